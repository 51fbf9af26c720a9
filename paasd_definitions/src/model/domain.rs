use uuid::Uuid;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Domain {
    pub id: Uuid,
    pub app_id: String,
    pub domain: String,
}
