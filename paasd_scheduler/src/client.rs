use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde_json::Value;

/// Errors a `Scheduler` operation can raise (spec.md §4.1).
///
/// `NotFound` on a GET is catchable and expected before a create; mutating
/// `NotFound` is fatal unless the caller explicitly ignores it (spec.md §7).
#[derive(Debug, Clone)]
pub enum SchedulerError {
    NotFound(String),
    Conflict(String),
    TransportError(String),
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerError::NotFound(m) => write!(f, "not found: {}", m),
            SchedulerError::Conflict(m) => write!(f, "conflict: {}", m),
            SchedulerError::TransportError(m) => write!(f, "transport error: {}", m),
        }
    }
}
impl std::error::Error for SchedulerError {}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Per-ptype deploy arguments handed by the Deploy Orchestrator (C6) to the
/// Scheduler Client. One field per row of the deploy-plan table in
/// spec.md §4.5.
#[derive(Debug, Clone, Default)]
pub struct DeployPlan {
    pub tags: BTreeMap<String, String>,
    pub envs: BTreeMap<String, String>,
    pub registry: Option<String>,
    pub replicas: u32,
    pub version: u32,
    pub app_type: String,
    pub resources: ResourceLimits,
    pub build_type: String,
    pub annotations: BTreeMap<String, String>,
    pub healthcheck: Option<Probes>,
    pub runtime_class_name: Option<String>,
    pub dns_policy: String,
    pub lifecycle_post_start: Option<Vec<String>>,
    pub lifecycle_pre_stop: Option<Vec<String>>,
    pub routable: bool,
    pub deploy_batches: u32,
    pub restart_policy: String,
    pub deploy_timeout: u32,
    pub deployment_revision_history_limit: u32,
    pub release_summary: String,
    pub pod_termination_grace_period_seconds: u32,
    pub image_pull_secret_name: Option<String>,
    pub image_pull_policy: String,
    pub volumes: Vec<PlanVolume>,
    pub volume_mounts: Vec<PlanVolumeMount>,
    pub node_selector: BTreeMap<String, String>,
    pub pod_security_context: Value,
    pub container_security_context: Value,
}

#[derive(Debug, Clone, Default)]
pub struct ResourceLimits {
    pub limits: BTreeMap<String, String>,
    pub requests: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct Probes {
    pub liveness: Option<Value>,
    pub readiness: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct PlanVolume {
    pub name: String,
    pub source: Value,
}

#[derive(Debug, Clone)]
pub struct PlanVolumeMount {
    pub name: String,
    pub mount_path: String,
    pub read_only: bool,
}

#[derive(Debug, Clone, Default)]
pub struct DeploymentInfo {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub replicas: u32,
    pub ready_replicas: u32,
    pub image: String,
}

#[derive(Debug, Clone, Default)]
pub struct PodInfo {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub phase: String,
}

/// Terminal/non-terminal state of a watched pod sequence (spec.md §4.1,
/// Redesign Flag 5). `Down` is the expected terminal state for a completed
/// one-off Job pod; any other terminal state is a failure the caller must
/// raise on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodState {
    Pending,
    Running,
    Down,
    Failed,
    Unknown,
}

impl PodState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PodState::Down | PodState::Failed | PodState::Unknown)
    }
}

/// A finite, non-restartable sequence of pod states with an explicit
/// cancel, so a bounded pipeline wait (spec.md §4.5 `pipeline`) can stop
/// watching without leaking the underlying cluster watch.
#[async_trait]
pub trait PodWatch: Send {
    /// Returns `None` once the sequence has been exhausted (timeout elapsed
    /// with no terminal state observed).
    async fn next(&mut self) -> Option<PodState>;
    fn cancel(&mut self);
}

/// Block on `watch` until it yields a terminal state or is exhausted.
pub async fn drain_to_terminal(watch: &mut dyn PodWatch) -> Option<PodState> {
    let mut last = None;
    while let Some(state) = watch.next().await {
        last = Some(state);
        if state.is_terminal() {
            break;
        }
    }
    watch.cancel();
    last
}

/// Typed capability surface over the cluster API (spec.md §4.1).
#[async_trait]
pub trait Scheduler: Send + Sync {
    // Namespace
    async fn get_namespace(&self, name: &str) -> SchedulerResult<()>;
    async fn create_namespace(&self, name: &str) -> SchedulerResult<()>;
    async fn delete_namespace(&self, name: &str) -> SchedulerResult<()>;

    // Deployment
    async fn get_deployment(&self, ns: &str, name: &str) -> SchedulerResult<DeploymentInfo>;
    async fn list_deployments(
        &self,
        ns: &str,
        labels: &BTreeMap<String, String>,
    ) -> SchedulerResult<Vec<DeploymentInfo>>;
    async fn deploy(
        &self,
        ns: &str,
        name: &str,
        image: &str,
        command: &[String],
        args: &[String],
        plan: &DeployPlan,
    ) -> SchedulerResult<()>;
    async fn scale_deployment(&self, ns: &str, name: &str, replicas: u32) -> SchedulerResult<()>;
    async fn patch_deployment(&self, ns: &str, name: &str, patch: Value) -> SchedulerResult<()>;
    async fn restart_deployment(&self, ns: &str, name: &str) -> SchedulerResult<()>;
    /// Returns `(in_progress, ok_to_proceed)`.
    async fn deployment_in_progress(
        &self,
        ns: &str,
        name: &str,
        timeout_secs: u32,
        batches: u32,
        replicas: u32,
        tags: &BTreeMap<String, String>,
    ) -> SchedulerResult<(bool, bool)>;
    async fn delete_deployment(&self, ns: &str, name: &str) -> SchedulerResult<()>;

    // Pod
    async fn get_pod(&self, ns: &str, name: &str) -> SchedulerResult<PodInfo>;
    async fn list_pods(
        &self,
        ns: &str,
        labels: &BTreeMap<String, String>,
    ) -> SchedulerResult<Vec<PodInfo>>;
    async fn delete_pod(&self, ns: &str, name: &str) -> SchedulerResult<()>;
    async fn watch_pods(
        &self,
        ns: &str,
        labels: &BTreeMap<String, String>,
        timeout_secs: u32,
    ) -> SchedulerResult<Box<dyn PodWatch>>;

    // Service
    async fn get_service(&self, ns: &str, name: &str) -> SchedulerResult<Value>;
    async fn create_or_update_service(&self, ns: &str, name: &str, spec: Value) -> SchedulerResult<()>;
    async fn delete_service(&self, ns: &str, name: &str) -> SchedulerResult<()>;

    // Secret
    async fn get_secret(&self, ns: &str, name: &str) -> SchedulerResult<BTreeMap<String, String>>;
    async fn create_or_update_secret(
        &self,
        ns: &str,
        name: &str,
        data: BTreeMap<String, String>,
    ) -> SchedulerResult<()>;
    async fn delete_secret(&self, ns: &str, name: &str) -> SchedulerResult<()>;
    async fn list_secrets(&self, ns: &str, labels: &BTreeMap<String, String>) -> SchedulerResult<Vec<String>>;

    // PersistentVolumeClaim
    async fn get_pvc(&self, ns: &str, name: &str) -> SchedulerResult<Value>;
    async fn create_or_update_pvc(&self, ns: &str, name: &str, spec: Value) -> SchedulerResult<()>;
    async fn delete_pvc(&self, ns: &str, name: &str) -> SchedulerResult<()>;

    // HorizontalPodAutoscaler
    async fn get_hpa(&self, ns: &str, name: &str) -> SchedulerResult<Value>;
    async fn create_or_update_hpa(&self, ns: &str, name: &str, spec: Value) -> SchedulerResult<()>;
    async fn delete_hpa(&self, ns: &str, name: &str) -> SchedulerResult<()>;

    // Job
    async fn create_job(&self, ns: &str, name: &str, spec: Value) -> SchedulerResult<()>;
    async fn get_job(&self, ns: &str, name: &str) -> SchedulerResult<Value>;
    async fn delete_job(&self, ns: &str, name: &str) -> SchedulerResult<()>;

    // Event
    async fn list_events(&self, ns: &str, involved_object: &str) -> SchedulerResult<Vec<Value>>;

    // Gateway / Route
    async fn get_gateway(&self, ns: &str, name: &str) -> SchedulerResult<Value>;
    async fn create_or_update_gateway(&self, ns: &str, name: &str, spec: Value) -> SchedulerResult<()>;
    async fn delete_gateway(&self, ns: &str, name: &str) -> SchedulerResult<()>;
    async fn get_route(&self, ns: &str, name: &str) -> SchedulerResult<Value>;
    async fn create_or_update_route(&self, ns: &str, name: &str, spec: Value) -> SchedulerResult<()>;
    async fn delete_route(&self, ns: &str, name: &str) -> SchedulerResult<()>;

    // ServiceCatalog
    async fn svcat_get_instance(&self, ns: &str, name: &str) -> SchedulerResult<Value>;
    async fn svcat_create_instance(&self, ns: &str, name: &str, spec: Value) -> SchedulerResult<()>;
    async fn svcat_put_instance(&self, ns: &str, name: &str, spec: Value) -> SchedulerResult<()>;
    async fn svcat_delete_instance(&self, ns: &str, name: &str) -> SchedulerResult<()>;
    async fn svcat_get_binding(&self, ns: &str, name: &str) -> SchedulerResult<Value>;
    async fn svcat_create_binding(&self, ns: &str, name: &str, spec: Value) -> SchedulerResult<()>;
    async fn svcat_delete_binding(&self, ns: &str, name: &str) -> SchedulerResult<()>;
}
