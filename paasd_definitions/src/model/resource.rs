use std::collections::BTreeMap;

use uuid::Uuid;

use crate::{ErrorKind, Result};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub enum InstanceStatus {
    Provisioning,
    Ready,
    Failed,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub enum BindingStatus {
    Binding,
    Ready,
    Failed,
}

/// A provisioned service-catalog instance+binding (spec.md §4.10).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Resource {
    pub id: Uuid,
    pub app_id: String,
    pub name: String,
    /// "class:plan"
    pub plan: String,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<InstanceStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binding: Option<BindingStatus>,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
    pub created: chrono::DateTime<chrono::Utc>,
}

impl Resource {
    pub fn new(app_id: impl Into<String>, name: impl Into<String>, plan: impl Into<String>, options: BTreeMap<String, String>) -> Self {
        Resource {
            id: Uuid::new_v4(),
            app_id: app_id.into(),
            name: name.into(),
            plan: plan.into(),
            options,
            status: None,
            binding: None,
            data: BTreeMap::new(),
            created: chrono::Utc::now(),
        }
    }

    /// `bind()` requires `status==Ready` and `binding != Ready`.
    pub fn can_bind(&self) -> Result<()> {
        if self.status != Some(InstanceStatus::Ready) {
            return Err(ErrorKind::Drycc("the resource is not ready".into()).into());
        }
        if self.binding == Some(BindingStatus::Ready) {
            return Err(ErrorKind::Drycc("the resource is binding".into()).into());
        }
        Ok(())
    }

    /// `unbind()` requires `binding != null`.
    pub fn can_unbind(&self) -> Result<()> {
        if self.binding.is_none() {
            return Err(ErrorKind::Drycc("the resource is not binding".into()).into());
        }
        Ok(())
    }

    /// After `detach_resource`, the row itself is deleted unless the
    /// instance is Ready and still bound (spec.md §4.10).
    pub fn should_delete_after_detach(&self) -> bool {
        self.status != Some(InstanceStatus::Ready) || self.binding.is_none()
    }

    /// Wall-clock elapsed since creation, used by the `retrieve_resource`
    /// worker's backoff schedule (spec.md §4.9); restart-safe because it
    /// is computed from the stored `created` timestamp, not process uptime.
    pub fn age(&self) -> chrono::Duration {
        chrono::Utc::now() - self.created
    }

    /// Projection consumed by the `send_measurements` background worker
    /// (spec.md §4.9); mirrors `Resource.to_measurements` - one record per
    /// resource rather than the windowed usage records `Config` produces,
    /// since a service-catalog instance has no live usage counters of its
    /// own to sample.
    pub fn to_measurements(&self, timestamp: chrono::DateTime<chrono::Utc>) -> serde_json::Value {
        serde_json::json!([{
            "name": self.name,
            "app_id": self.app_id,
            "plan": self.plan,
            "timestamp": timestamp.timestamp(),
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Resource {
        Resource::new("alpha", "my-redis", "redis:standard", BTreeMap::new())
    }

    #[test]
    fn bind_requires_ready_instance() {
        let mut r = sample();
        assert!(r.can_bind().is_err());
        r.status = Some(InstanceStatus::Ready);
        assert!(r.can_bind().is_ok());
        r.binding = Some(BindingStatus::Ready);
        assert!(r.can_bind().is_err());
    }

    #[test]
    fn unbind_requires_existing_binding() {
        let r = sample();
        assert!(r.can_unbind().is_err());
    }

    #[test]
    fn to_measurements_carries_identity_and_plan() {
        let r = sample();
        let now = chrono::Utc::now();
        let records = r.to_measurements(now);
        assert_eq!(records[0]["app_id"], "alpha");
        assert_eq!(records[0]["plan"], "redis:standard");
    }

    #[test]
    fn detach_deletes_row_unless_ready_and_bound() {
        let mut r = sample();
        assert!(r.should_delete_after_detach());
        r.status = Some(InstanceStatus::Ready);
        r.binding = Some(BindingStatus::Ready);
        assert!(!r.should_delete_after_detach());
    }
}
