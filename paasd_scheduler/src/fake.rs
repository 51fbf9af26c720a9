//! In-memory `Scheduler` for tests (§SPEC_FULL.md 4.1 "[AMBIENT] test
//! tooling"). No direct teacher analog - shipcat's own tests shell out to
//! real `kubectl`/`helm`; this double is shaped from the `Scheduler` trait
//! itself so the rest of the crate can be driven deterministically.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::client::{
    DeployPlan, DeploymentInfo, PodInfo, PodState, PodWatch, Scheduler, SchedulerError,
    SchedulerResult,
};

#[derive(Default)]
struct State {
    namespaces: std::collections::BTreeSet<String>,
    deployments: BTreeMap<(String, String), DeploymentInfo>,
    in_progress: BTreeMap<(String, String), bool>,
    pods: BTreeMap<(String, String), PodInfo>,
    services: BTreeMap<(String, String), Value>,
    secrets: BTreeMap<(String, String), BTreeMap<String, String>>,
    pvcs: BTreeMap<(String, String), Value>,
    hpas: BTreeMap<(String, String), Value>,
    jobs: BTreeMap<(String, String), Value>,
    gateways: BTreeMap<(String, String), Value>,
    routes: BTreeMap<(String, String), Value>,
    svcat_instances: BTreeMap<(String, String), Value>,
    svcat_bindings: BTreeMap<(String, String), Value>,
    /// queued terminal states returned by the next `watch_pods` call, in order.
    next_watch_sequence: Vec<PodState>,
}

/// An in-memory `Scheduler` double. Every namespaced object is keyed by
/// `(namespace, name)`. Injecting `force_not_found`/`force_conflict` lets
/// tests exercise the `NotFound`/`Conflict` propagation paths described in
/// spec.md §7 without a real cluster.
pub struct FakeScheduler {
    state: Mutex<State>,
}

impl Default for FakeScheduler {
    fn default() -> Self {
        FakeScheduler {
            state: Mutex::new(State::default()),
        }
    }
}

impl FakeScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-program the terminal states the next `watch_pods()` call returns,
    /// in order, terminating the watch.
    pub fn queue_watch_states(&self, states: Vec<PodState>) {
        self.state.lock().unwrap().next_watch_sequence = states;
    }

    pub fn deployment_count(&self) -> usize {
        self.state.lock().unwrap().deployments.len()
    }

    pub fn has_deployment(&self, ns: &str, name: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .deployments
            .contains_key(&(ns.to_string(), name.to_string()))
    }

    pub fn deployment_replicas(&self, ns: &str, name: &str) -> Option<u32> {
        self.state
            .lock()
            .unwrap()
            .deployments
            .get(&(ns.to_string(), name.to_string()))
            .map(|d| d.replicas)
    }

    pub fn set_in_progress(&self, ns: &str, name: &str, in_progress: bool) {
        self.state
            .lock()
            .unwrap()
            .in_progress
            .insert((ns.to_string(), name.to_string()), in_progress);
    }

    pub fn secret_data(&self, ns: &str, name: &str) -> Option<BTreeMap<String, String>> {
        self.state
            .lock()
            .unwrap()
            .secrets
            .get(&(ns.to_string(), name.to_string()))
            .cloned()
    }

    pub fn has_service(&self, ns: &str, name: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .services
            .contains_key(&(ns.to_string(), name.to_string()))
    }

    pub fn has_gateway(&self, ns: &str, name: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .gateways
            .contains_key(&(ns.to_string(), name.to_string()))
    }

    pub fn has_route(&self, ns: &str, name: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .routes
            .contains_key(&(ns.to_string(), name.to_string()))
    }
}

struct FakePodWatch {
    remaining: Vec<PodState>,
    cancelled: bool,
}

#[async_trait]
impl PodWatch for FakePodWatch {
    async fn next(&mut self) -> Option<PodState> {
        if self.cancelled || self.remaining.is_empty() {
            return None;
        }
        Some(self.remaining.remove(0))
    }
    fn cancel(&mut self) {
        self.cancelled = true;
    }
}

fn key(ns: &str, name: &str) -> (String, String) {
    (ns.to_string(), name.to_string())
}

#[async_trait]
impl Scheduler for FakeScheduler {
    async fn get_namespace(&self, name: &str) -> SchedulerResult<()> {
        if self.state.lock().unwrap().namespaces.contains(name) {
            Ok(())
        } else {
            Err(SchedulerError::NotFound(format!("namespace {}", name)))
        }
    }
    async fn create_namespace(&self, name: &str) -> SchedulerResult<()> {
        self.state.lock().unwrap().namespaces.insert(name.to_string());
        Ok(())
    }
    async fn delete_namespace(&self, name: &str) -> SchedulerResult<()> {
        self.state.lock().unwrap().namespaces.remove(name);
        Ok(())
    }

    async fn get_deployment(&self, ns: &str, name: &str) -> SchedulerResult<DeploymentInfo> {
        self.state
            .lock()
            .unwrap()
            .deployments
            .get(&key(ns, name))
            .cloned()
            .ok_or_else(|| SchedulerError::NotFound(format!("deployment {}/{}", ns, name)))
    }
    async fn list_deployments(
        &self,
        ns: &str,
        labels: &BTreeMap<String, String>,
    ) -> SchedulerResult<Vec<DeploymentInfo>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .deployments
            .iter()
            .filter(|((dns, _), d)| {
                dns == ns && labels.iter().all(|(k, v)| d.labels.get(k) == Some(v))
            })
            .map(|(_, d)| d.clone())
            .collect())
    }
    async fn deploy(
        &self,
        ns: &str,
        name: &str,
        image: &str,
        _command: &[String],
        _args: &[String],
        plan: &DeployPlan,
    ) -> SchedulerResult<()> {
        let mut st = self.state.lock().unwrap();
        let mut labels = plan.tags.clone();
        labels.insert("app_type".to_string(), plan.app_type.clone());
        st.deployments.insert(
            key(ns, name),
            DeploymentInfo {
                name: name.to_string(),
                namespace: ns.to_string(),
                labels,
                replicas: plan.replicas,
                ready_replicas: plan.replicas,
                image: image.to_string(),
            },
        );
        Ok(())
    }
    async fn scale_deployment(&self, ns: &str, name: &str, replicas: u32) -> SchedulerResult<()> {
        let mut st = self.state.lock().unwrap();
        let d = st
            .deployments
            .get_mut(&key(ns, name))
            .ok_or_else(|| SchedulerError::NotFound(format!("deployment {}/{}", ns, name)))?;
        d.replicas = replicas;
        d.ready_replicas = replicas;
        Ok(())
    }
    async fn patch_deployment(&self, ns: &str, name: &str, _patch: Value) -> SchedulerResult<()> {
        self.get_deployment(ns, name).await.map(|_| ())
    }
    async fn restart_deployment(&self, ns: &str, name: &str) -> SchedulerResult<()> {
        self.get_deployment(ns, name).await.map(|_| ())
    }
    async fn deployment_in_progress(
        &self,
        ns: &str,
        name: &str,
        _timeout_secs: u32,
        _batches: u32,
        _replicas: u32,
        _tags: &BTreeMap<String, String>,
    ) -> SchedulerResult<(bool, bool)> {
        let in_progress = self
            .state
            .lock()
            .unwrap()
            .in_progress
            .get(&key(ns, name))
            .copied()
            .unwrap_or(false);
        Ok((in_progress, !in_progress))
    }
    async fn delete_deployment(&self, ns: &str, name: &str) -> SchedulerResult<()> {
        self.state.lock().unwrap().deployments.remove(&key(ns, name));
        Ok(())
    }

    async fn get_pod(&self, ns: &str, name: &str) -> SchedulerResult<PodInfo> {
        self.state
            .lock()
            .unwrap()
            .pods
            .get(&key(ns, name))
            .cloned()
            .ok_or_else(|| SchedulerError::NotFound(format!("pod {}/{}", ns, name)))
    }
    async fn list_pods(
        &self,
        ns: &str,
        labels: &BTreeMap<String, String>,
    ) -> SchedulerResult<Vec<PodInfo>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .pods
            .iter()
            .filter(|((pns, _), p)| {
                pns == ns && labels.iter().all(|(k, v)| p.labels.get(k) == Some(v))
            })
            .map(|(_, p)| p.clone())
            .collect())
    }
    async fn delete_pod(&self, ns: &str, name: &str) -> SchedulerResult<()> {
        self.state.lock().unwrap().pods.remove(&key(ns, name));
        Ok(())
    }
    async fn watch_pods(
        &self,
        _ns: &str,
        _labels: &BTreeMap<String, String>,
        _timeout_secs: u32,
    ) -> SchedulerResult<Box<dyn PodWatch>> {
        let seq = std::mem::take(&mut self.state.lock().unwrap().next_watch_sequence);
        Ok(Box::new(FakePodWatch {
            remaining: seq,
            cancelled: false,
        }))
    }

    async fn get_service(&self, ns: &str, name: &str) -> SchedulerResult<Value> {
        self.state
            .lock()
            .unwrap()
            .services
            .get(&key(ns, name))
            .cloned()
            .ok_or_else(|| SchedulerError::NotFound(format!("service {}/{}", ns, name)))
    }
    async fn create_or_update_service(&self, ns: &str, name: &str, spec: Value) -> SchedulerResult<()> {
        self.state.lock().unwrap().services.insert(key(ns, name), spec);
        Ok(())
    }
    async fn delete_service(&self, ns: &str, name: &str) -> SchedulerResult<()> {
        self.state.lock().unwrap().services.remove(&key(ns, name));
        Ok(())
    }

    async fn get_secret(&self, ns: &str, name: &str) -> SchedulerResult<BTreeMap<String, String>> {
        self.state
            .lock()
            .unwrap()
            .secrets
            .get(&key(ns, name))
            .cloned()
            .ok_or_else(|| SchedulerError::NotFound(format!("secret {}/{}", ns, name)))
    }
    async fn create_or_update_secret(
        &self,
        ns: &str,
        name: &str,
        data: BTreeMap<String, String>,
    ) -> SchedulerResult<()> {
        self.state.lock().unwrap().secrets.insert(key(ns, name), data);
        Ok(())
    }
    async fn delete_secret(&self, ns: &str, name: &str) -> SchedulerResult<()> {
        self.state.lock().unwrap().secrets.remove(&key(ns, name));
        Ok(())
    }
    async fn list_secrets(&self, ns: &str, _labels: &BTreeMap<String, String>) -> SchedulerResult<Vec<String>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .secrets
            .keys()
            .filter(|(sns, _)| sns == ns)
            .map(|(_, name)| name.clone())
            .collect())
    }

    async fn get_pvc(&self, ns: &str, name: &str) -> SchedulerResult<Value> {
        self.state
            .lock()
            .unwrap()
            .pvcs
            .get(&key(ns, name))
            .cloned()
            .ok_or_else(|| SchedulerError::NotFound(format!("pvc {}/{}", ns, name)))
    }
    async fn create_or_update_pvc(&self, ns: &str, name: &str, spec: Value) -> SchedulerResult<()> {
        self.state.lock().unwrap().pvcs.insert(key(ns, name), spec);
        Ok(())
    }
    async fn delete_pvc(&self, ns: &str, name: &str) -> SchedulerResult<()> {
        self.state.lock().unwrap().pvcs.remove(&key(ns, name));
        Ok(())
    }

    async fn get_hpa(&self, ns: &str, name: &str) -> SchedulerResult<Value> {
        self.state
            .lock()
            .unwrap()
            .hpas
            .get(&key(ns, name))
            .cloned()
            .ok_or_else(|| SchedulerError::NotFound(format!("hpa {}/{}", ns, name)))
    }
    async fn create_or_update_hpa(&self, ns: &str, name: &str, spec: Value) -> SchedulerResult<()> {
        self.state.lock().unwrap().hpas.insert(key(ns, name), spec);
        Ok(())
    }
    async fn delete_hpa(&self, ns: &str, name: &str) -> SchedulerResult<()> {
        self.state.lock().unwrap().hpas.remove(&key(ns, name));
        Ok(())
    }

    async fn create_job(&self, ns: &str, name: &str, spec: Value) -> SchedulerResult<()> {
        self.state.lock().unwrap().jobs.insert(key(ns, name), spec);
        Ok(())
    }
    async fn get_job(&self, ns: &str, name: &str) -> SchedulerResult<Value> {
        self.state
            .lock()
            .unwrap()
            .jobs
            .get(&key(ns, name))
            .cloned()
            .ok_or_else(|| SchedulerError::NotFound(format!("job {}/{}", ns, name)))
    }
    async fn delete_job(&self, ns: &str, name: &str) -> SchedulerResult<()> {
        self.state.lock().unwrap().jobs.remove(&key(ns, name));
        Ok(())
    }

    async fn list_events(&self, _ns: &str, _involved_object: &str) -> SchedulerResult<Vec<Value>> {
        Ok(Vec::new())
    }

    async fn get_gateway(&self, ns: &str, name: &str) -> SchedulerResult<Value> {
        self.state
            .lock()
            .unwrap()
            .gateways
            .get(&key(ns, name))
            .cloned()
            .ok_or_else(|| SchedulerError::NotFound(format!("gateway {}/{}", ns, name)))
    }
    async fn create_or_update_gateway(&self, ns: &str, name: &str, spec: Value) -> SchedulerResult<()> {
        self.state.lock().unwrap().gateways.insert(key(ns, name), spec);
        Ok(())
    }
    async fn delete_gateway(&self, ns: &str, name: &str) -> SchedulerResult<()> {
        self.state.lock().unwrap().gateways.remove(&key(ns, name));
        Ok(())
    }
    async fn get_route(&self, ns: &str, name: &str) -> SchedulerResult<Value> {
        self.state
            .lock()
            .unwrap()
            .routes
            .get(&key(ns, name))
            .cloned()
            .ok_or_else(|| SchedulerError::NotFound(format!("route {}/{}", ns, name)))
    }
    async fn create_or_update_route(&self, ns: &str, name: &str, spec: Value) -> SchedulerResult<()> {
        self.state.lock().unwrap().routes.insert(key(ns, name), spec);
        Ok(())
    }
    async fn delete_route(&self, ns: &str, name: &str) -> SchedulerResult<()> {
        self.state.lock().unwrap().routes.remove(&key(ns, name));
        Ok(())
    }

    async fn svcat_get_instance(&self, ns: &str, name: &str) -> SchedulerResult<Value> {
        self.state
            .lock()
            .unwrap()
            .svcat_instances
            .get(&key(ns, name))
            .cloned()
            .ok_or_else(|| SchedulerError::NotFound(format!("instance {}/{}", ns, name)))
    }
    async fn svcat_create_instance(&self, ns: &str, name: &str, spec: Value) -> SchedulerResult<()> {
        let mut st = self.state.lock().unwrap();
        if st.svcat_instances.contains_key(&key(ns, name)) {
            return Err(SchedulerError::Conflict(format!("instance {}/{} exists", ns, name)));
        }
        st.svcat_instances.insert(key(ns, name), spec);
        Ok(())
    }
    async fn svcat_put_instance(&self, ns: &str, name: &str, spec: Value) -> SchedulerResult<()> {
        self.state.lock().unwrap().svcat_instances.insert(key(ns, name), spec);
        Ok(())
    }
    async fn svcat_delete_instance(&self, ns: &str, name: &str) -> SchedulerResult<()> {
        self.state.lock().unwrap().svcat_instances.remove(&key(ns, name));
        Ok(())
    }
    async fn svcat_get_binding(&self, ns: &str, name: &str) -> SchedulerResult<Value> {
        self.state
            .lock()
            .unwrap()
            .svcat_bindings
            .get(&key(ns, name))
            .cloned()
            .ok_or_else(|| SchedulerError::NotFound(format!("binding {}/{}", ns, name)))
    }
    async fn svcat_create_binding(&self, ns: &str, name: &str, spec: Value) -> SchedulerResult<()> {
        let mut st = self.state.lock().unwrap();
        if st.svcat_bindings.contains_key(&key(ns, name)) {
            return Err(SchedulerError::Conflict(format!("binding {}/{} exists", ns, name)));
        }
        st.svcat_bindings.insert(key(ns, name), spec);
        Ok(())
    }
    async fn svcat_delete_binding(&self, ns: &str, name: &str) -> SchedulerResult<()> {
        self.state.lock().unwrap().svcat_bindings.remove(&key(ns, name));
        Ok(())
    }
}
