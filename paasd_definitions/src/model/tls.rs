use uuid::Uuid;

/// Per-App TLS policy toggle (e.g. whether the default ingress enforces
/// HTTPS redirects). Certificates are tracked separately and attach to
/// Domains.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TLS {
    pub id: Uuid,
    pub app_id: String,
    #[serde(default)]
    pub https_enforced: bool,
}

impl TLS {
    pub fn default_for(app_id: impl Into<String>) -> Self {
        TLS {
            id: Uuid::new_v4(),
            app_id: app_id.into(),
            https_enforced: false,
        }
    }
}
