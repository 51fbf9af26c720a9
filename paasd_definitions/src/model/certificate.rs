use chrono::{DateTime, Utc};
use uuid::Uuid;

/// A certificate attached to one or more Domains owned by an App.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Certificate {
    pub id: Uuid,
    pub app_id: String,
    pub name: String,
    pub common_name: String,
    pub expires: DateTime<Utc>,
    #[serde(default)]
    pub domains: Vec<String>,
}
