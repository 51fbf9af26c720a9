use uuid::Uuid;

/// Declarative HTTP(S) gateway listener set, owned by an App.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Gateway {
    pub id: Uuid,
    pub app_id: String,
    pub name: String,
    pub listeners: Vec<Listener>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Listener {
    pub name: String,
    pub port: u16,
    pub protocol: String,
    /// True if this listener was stamped in by the default-ingress
    /// bootstrap (spec.md §4.6) rather than user-declared; used to detect
    /// when a "stale default-TLS flag" needs refreshing.
    #[serde(default)]
    pub is_default: bool,
}

impl Gateway {
    pub fn default_http(app_id: impl Into<String>, name: impl Into<String>) -> Self {
        Gateway {
            id: Uuid::new_v4(),
            app_id: app_id.into(),
            name: name.into(),
            listeners: vec![Listener {
                name: "http".into(),
                port: 80,
                protocol: "HTTP".into(),
                is_default: true,
            }],
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct BackendRef {
    pub service_name: String,
    pub port: u16,
    pub weight: u32,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct RouteRule {
    pub backend_refs: Vec<BackendRef>,
}

/// HTTP(S)/TCP route with rules pointing at Services, parented by Gateways.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Route {
    pub id: Uuid,
    pub app_id: String,
    pub name: String,
    pub parent_refs: Vec<String>,
    pub rules: Vec<RouteRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_ref: Option<String>,
}

impl Route {
    pub fn default_web(app_id: impl Into<String>, name: impl Into<String>, gateway_name: impl Into<String>, service_name: impl Into<String>, port: u16) -> Self {
        let app_id = app_id.into();
        Route {
            id: Uuid::new_v4(),
            app_id,
            name: name.into(),
            parent_refs: vec![gateway_name.into()],
            rules: vec![RouteRule {
                backend_refs: vec![BackendRef {
                    service_name: service_name.into(),
                    port,
                    weight: 100,
                }],
            }],
            tls_ref: None,
        }
    }
}
