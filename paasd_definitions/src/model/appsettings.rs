use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{ErrorKind, Result};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ScalingMetric {
    pub kind: ScalingMetricKind,
    pub target: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ScalingMetricKind {
    Cpu,
    Memory,
    Pods,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct AutoscaleSpec {
    pub min_replicas: u32,
    pub max_replicas: u32,
    pub metrics: Vec<ScalingMetric>,
}

impl AutoscaleSpec {
    pub fn verify(&self) -> Result<()> {
        if self.min_replicas == 0 {
            return Err(ErrorKind::Validation("minReplicas must be at least 1".into()).into());
        }
        if self.min_replicas > self.max_replicas {
            return Err(ErrorKind::Validation("maxReplicas must be >= minReplicas".into()).into());
        }
        Ok(())
    }
}

/// Latest-wins merge of app-level toggles. Creating a record identical to
/// the previous one is rejected (spec.md §3).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct AppSettings {
    pub id: Uuid,
    pub app_id: String,
    #[serde(default = "default_true")]
    pub routable: bool,
    #[serde(default)]
    pub autoscale: BTreeMap<String, AutoscaleSpec>,
    #[serde(default)]
    pub label: BTreeMap<String, String>,
    #[serde(default = "default_true")]
    pub autodeploy: bool,
    #[serde(default = "default_true")]
    pub autorollback: bool,
    pub created: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

impl AppSettings {
    pub fn default_for(app_id: impl Into<String>) -> Self {
        AppSettings {
            id: Uuid::new_v4(),
            app_id: app_id.into(),
            routable: true,
            autoscale: BTreeMap::new(),
            label: BTreeMap::new(),
            autodeploy: true,
            autorollback: true,
            created: Utc::now(),
        }
    }

    /// Would saving `next` over `previous` be a no-op? (spec.md §3: "Creating
    /// a record identical to the previous one is rejected".)
    pub fn is_identical_to(&self, previous: &AppSettings) -> bool {
        self.routable == previous.routable
            && self.autoscale == previous.autoscale
            && self.label == previous.label
            && self.autodeploy == previous.autodeploy
            && self.autorollback == previous.autorollback
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_save_is_detected() {
        let a = AppSettings::default_for("alpha");
        let mut b = a.clone();
        b.id = Uuid::new_v4();
        b.created = Utc::now();
        assert!(b.is_identical_to(&a));
        b.routable = false;
        assert!(!b.is_identical_to(&a));
    }
}
