//! Service-catalog Resource orchestration (spec.md §4.10, C4.10).
//!
//! Grounded directly on `original_source/rootfs/api/models/resource.py`:
//! `retrieve`/`bind`/`unbind`/`detach_resource` reproduce its exact
//! transitions, translated from Django model methods into a struct that
//! wires the (already-built) `Resource` state machine to a `Scheduler` and
//! an `EntityStore`.

use std::collections::BTreeMap;

use serde_json::Value;

use paasd_definitions::{BindingStatus, ErrorKind, InstanceStatus, Resource, Result};
use paasd_scheduler::Scheduler;

use crate::store::EntityStore;

fn parse_instance_status(v: &str) -> Option<InstanceStatus> {
    match v {
        "Ready" => Some(InstanceStatus::Ready),
        "Provisioning" => Some(InstanceStatus::Provisioning),
        _ => Some(InstanceStatus::Failed),
    }
}

fn parse_binding_status(v: &str) -> Option<BindingStatus> {
    match v {
        "Ready" => Some(BindingStatus::Ready),
        "Binding" => Some(BindingStatus::Binding),
        _ => Some(BindingStatus::Failed),
    }
}

fn json_str(v: &Value, path: &[&str]) -> Option<String> {
    let mut cur = v;
    for key in path {
        cur = cur.get(key)?;
    }
    cur.as_str().map(|s| s.to_string())
}

pub struct ResourceManager<'a> {
    scheduler: &'a dyn Scheduler,
    store: &'a dyn EntityStore,
}

impl<'a> ResourceManager<'a> {
    pub fn new(scheduler: &'a dyn Scheduler, store: &'a dyn EntityStore) -> Self {
        ResourceManager { scheduler, store }
    }

    pub async fn get(&self, app_id: &str, name: &str) -> Result<Resource> {
        self.store.get_resource(app_id, name).await
    }

    pub async fn create(&self, resource: Resource) -> Result<Resource> {
        let spec = serde_json::json!({
            "spec": {
                "clusterServicePlanExternalName": resource.plan,
                "parameters": resource.options,
            }
        });
        self.scheduler
            .svcat_create_instance(&resource.app_id, &resource.name, spec)
            .await
            .map_err(|e| ErrorKind::ServiceUnavailable(e.to_string()))?;
        self.store.save_resource(resource).await
    }

    /// Polls instance + binding status from the cluster and reconciles the
    /// stored row. Returns `true` only when both are `Ready`. Persists only
    /// if something actually changed.
    pub async fn retrieve(&self, app_id: &str, name: &str) -> Result<bool> {
        let mut resource = self.store.get_resource(app_id, name).await?;
        let before = resource.clone();

        let instance = self
            .scheduler
            .svcat_get_instance(app_id, name)
            .await
            .map_err(|e| ErrorKind::ServiceUnavailable(e.to_string()))?;
        if let Some(state) = json_str(&instance, &["status", "lastConditionState"]) {
            resource.status = parse_instance_status(&state);
        }
        if let Some(params) = instance.pointer("/spec/parameters").and_then(|v| v.as_object()) {
            resource.options = params
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect();
        }

        let binding = self
            .scheduler
            .svcat_get_binding(app_id, name)
            .await
            .map_err(|e| ErrorKind::ServiceUnavailable(e.to_string()))?;
        if let Some(state) = json_str(&binding, &["status", "lastConditionState"]) {
            resource.binding = parse_binding_status(&state);
        }
        if let Some(secret_name) = json_str(&binding, &["spec", "secretName"]) {
            if let Ok(data) = self.scheduler.get_secret(app_id, &secret_name).await {
                resource.data = data;
            }
        }

        if resource != before {
            resource = self.store.save_resource(resource.clone()).await?;
        }

        Ok(resource.status == Some(InstanceStatus::Ready) && resource.binding == Some(BindingStatus::Ready))
    }

    pub async fn bind(&self, app_id: &str, name: &str) -> Result<()> {
        let mut resource = self.store.get_resource(app_id, name).await?;
        resource.can_bind()?;
        resource.binding = Some(BindingStatus::Binding);
        let resource = self.store.save_resource(resource).await?;
        let spec = serde_json::json!({"spec": {"instanceRef": {"name": resource.name}}});
        self.scheduler
            .svcat_create_binding(app_id, name, spec)
            .await
            .map_err(|e| ErrorKind::ServiceUnavailable(e.to_string()))
    }

    pub async fn unbind(&self, app_id: &str, name: &str) -> Result<()> {
        let mut resource = self.store.get_resource(app_id, name).await?;
        resource.can_unbind()?;
        self.scheduler
            .svcat_delete_binding(app_id, name)
            .await
            .map_err(|e| ErrorKind::ServiceUnavailable(e.to_string()))?;
        resource.binding = None;
        resource.data = BTreeMap::new();
        self.store.save_resource(resource).await?;
        Ok(())
    }

    /// Deletes the bound secret and binding if present, then drops the row
    /// unless the instance is still Ready and bound.
    pub async fn detach_resource(&self, app_id: &str, name: &str) -> Result<()> {
        let resource = self.store.get_resource(app_id, name).await?;
        if resource.binding.is_some() {
            if let Ok(binding) = self.scheduler.svcat_get_binding(app_id, name).await {
                if let Some(secret_name) = json_str(&binding, &["spec", "secretName"]) {
                    let _ = self.scheduler.delete_secret(app_id, &secret_name).await;
                }
            }
            self.scheduler
                .svcat_delete_binding(app_id, name)
                .await
                .map_err(|e| ErrorKind::ServiceUnavailable(e.to_string()))?;
        }
        if resource.should_delete_after_detach() {
            self.store.delete_resource(app_id, name).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use paasd_scheduler::fake::FakeScheduler;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn detach_drops_row_when_never_bound() {
        let scheduler = FakeScheduler::new();
        let store = InMemoryStore::new();
        let resources = ResourceManager::new(&scheduler, &store);
        store
            .save_resource(Resource::new("alpha", "db", "postgres:small", BTreeMap::new()))
            .await
            .unwrap();

        resources.detach_resource("alpha", "db").await.unwrap();
        assert!(store.get_resource("alpha", "db").await.is_err());
    }

    #[tokio::test]
    async fn bind_requires_ready_instance() {
        let scheduler = FakeScheduler::new();
        let store = InMemoryStore::new();
        let resources = ResourceManager::new(&scheduler, &store);
        store
            .save_resource(Resource::new("alpha", "db", "postgres:small", BTreeMap::new()))
            .await
            .unwrap();

        assert!(resources.bind("alpha", "db").await.is_err());
    }
}
