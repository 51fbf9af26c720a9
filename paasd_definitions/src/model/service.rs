use uuid::Uuid;

use crate::{ErrorKind, Result};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Tcp,
    Udp,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ServicePort {
    pub name: String,
    pub port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: Protocol,
    pub target_port: u16,
}
fn default_protocol() -> Protocol {
    Protocol::Tcp
}

/// Per (App, ptype) service record.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Service {
    pub id: Uuid,
    pub app_id: String,
    pub ptype: String,
    pub ports: Vec<ServicePort>,
    #[serde(default)]
    pub canary: bool,
}

impl Service {
    pub fn new(app_id: impl Into<String>, ptype: impl Into<String>) -> Self {
        Service {
            id: Uuid::new_v4(),
            app_id: app_id.into(),
            ptype: ptype.into(),
            ports: Vec::new(),
            canary: false,
        }
    }

    pub fn verify(&self) -> Result<()> {
        let mut seen = std::collections::BTreeSet::new();
        for p in &self.ports {
            if !seen.insert(p.name.clone()) {
                return Err(ErrorKind::Validation(format!(
                    "service {} has duplicate port name '{}'",
                    self.ptype, p.name
                ))
                .into());
            }
        }
        Ok(())
    }
}
