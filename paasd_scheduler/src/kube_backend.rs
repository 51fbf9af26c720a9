//! Real `Scheduler` backed by the cluster API (spec.md §4.1), grounded on
//! `shipcat_cli::kubeapi::ShipKube`/`kubectl`'s `APIClient` usage: one
//! client built once from in-cluster or kubeconfig credentials, and one
//! `Api<K>` per resource kind.
//!
//! Gateway/Route/ServiceCatalog objects have no static type in
//! `k8s-openapi`; they go over the same `RawApi`-style path `kubectl.rs`
//! sketches for `selfsubjectrulesreviews`, returning `serde_json::Value`.

use std::collections::BTreeMap;
use std::convert::TryFrom;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::autoscaling::v1::HorizontalPodAutoscaler;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{
    Container, EnvVar, Namespace, PersistentVolumeClaim, Pod, PodSpec, PodTemplateSpec,
    ResourceRequirements, Secret, Service,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::api::{Api, DeleteParams, ListParams, PatchParams, PostParams, RawApi};
use kube::client::APIClient;
use kube::config::Configuration;
use serde_json::Value;

use crate::client::{
    DeployPlan, DeploymentInfo, PodInfo, PodState, PodWatch, Scheduler, SchedulerError,
    SchedulerResult,
};

fn wrap<E: std::fmt::Display>(e: E) -> SchedulerError {
    SchedulerError::TransportError(e.to_string())
}

/// Load in-cluster config first, falling back to a local kubeconfig - the
/// same preference order as `kubeapi::make_client`.
async fn make_client() -> SchedulerResult<APIClient> {
    let config: Configuration = if let Ok(cfg) = kube::config::incluster_config() {
        cfg
    } else {
        kube::config::load_kube_config().await.map_err(wrap)?
    };
    Ok(APIClient::new(config))
}

pub struct KubeScheduler {
    client: APIClient,
}

impl KubeScheduler {
    pub async fn new() -> SchedulerResult<Self> {
        Ok(KubeScheduler {
            client: make_client().await?,
        })
    }

    fn raw(&self, kind: &str, group: &str, version: &str) -> RawApi {
        RawApi::customResource(kind).group(group).version(version)
    }

    async fn raw_get(&self, raw: &RawApi, ns: &str, name: &str) -> SchedulerResult<Value> {
        let req = raw.get(name, ns).map_err(wrap)?;
        self.client.request::<Value>(req).await.map_err(|e| match e {
            kube::Error::Api(ae) if ae.code == 404 => {
                SchedulerError::NotFound(format!("{}/{}", ns, name))
            }
            other => wrap(other),
        })
    }

    async fn raw_create(&self, raw: &RawApi, ns: &str, spec: Value) -> SchedulerResult<()> {
        let pp = PostParams::default();
        let req = raw
            .create(&pp, ns, serde_json::to_vec(&spec).map_err(wrap)?)
            .map_err(wrap)?;
        self.client.request::<Value>(req).await.map_err(wrap)?;
        Ok(())
    }

    async fn raw_replace(&self, raw: &RawApi, ns: &str, name: &str, spec: Value) -> SchedulerResult<()> {
        let pp = PatchParams::default();
        let req = raw
            .patch(name, ns, &pp, serde_json::to_vec(&spec).map_err(wrap)?)
            .map_err(wrap)?;
        self.client.request::<Value>(req).await.map_err(wrap)?;
        Ok(())
    }

    async fn raw_delete(&self, raw: &RawApi, ns: &str, name: &str) -> SchedulerResult<()> {
        let dp = DeleteParams::default();
        let req = raw.delete(name, ns, &dp).map_err(wrap)?;
        match self.client.request::<Value>(req).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(other) => Err(wrap(other)),
        }
    }

    /// Create-or-replace: the pattern every `create_or_update_*` method
    /// below follows, since the cluster API has no single upsert verb.
    async fn raw_create_or_update(&self, raw: &RawApi, ns: &str, name: &str, spec: Value) -> SchedulerResult<()> {
        match self.raw_get(raw, ns, name).await {
            Ok(_) => self.raw_replace(raw, ns, name, spec).await,
            Err(SchedulerError::NotFound(_)) => self.raw_create(raw, ns, spec).await,
            Err(e) => Err(e),
        }
    }
}

fn deployment_info(name: &str, ns: &str, dep: &Deployment) -> DeploymentInfo {
    let mut labels = BTreeMap::new();
    if let Some(meta) = &dep.metadata {
        if let Some(l) = &meta.labels {
            labels = l.clone().into_iter().collect();
        }
    }
    let replicas = dep
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(0)
        .max(0) as u32;
    let ready_replicas = dep
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0)
        .max(0) as u32;
    let image = dep
        .spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .and_then(|p| p.containers.first())
        .and_then(|c| c.image.clone())
        .unwrap_or_default();
    DeploymentInfo {
        name: name.to_string(),
        namespace: ns.to_string(),
        labels,
        replicas,
        ready_replicas,
        image,
    }
}

fn pod_info(ns: &str, pod: &Pod) -> PodInfo {
    let mut labels = BTreeMap::new();
    let mut name = String::new();
    if let Some(meta) = &pod.metadata {
        if let Some(l) = &meta.labels {
            labels = l.clone().into_iter().collect();
        }
        if let Some(n) = &meta.name {
            name = n.clone();
        }
    }
    let phase = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.clone())
        .unwrap_or_default();
    PodInfo {
        name,
        namespace: ns.to_string(),
        labels,
        phase,
    }
}

fn phase_to_state(phase: &str) -> PodState {
    match phase {
        "Pending" => PodState::Pending,
        "Running" => PodState::Running,
        "Succeeded" => PodState::Down,
        "Failed" => PodState::Failed,
        _ => PodState::Unknown,
    }
}

fn build_deployment(name: &str, ns: &str, image: &str, command: &[String], args: &[String], plan: &DeployPlan) -> Deployment {
    let mut labels: BTreeMap<String, String> = plan.tags.clone();
    labels.insert("app_type".to_string(), plan.app_type.clone());

    let env: Vec<EnvVar> = plan
        .envs
        .iter()
        .map(|(k, v)| EnvVar {
            name: k.clone(),
            value: Some(v.clone()),
            ..Default::default()
        })
        .collect();

    let resources = ResourceRequirements {
        limits: Some(
            plan.resources
                .limits
                .iter()
                .filter_map(|(k, v)| {
                    k8s_openapi::apimachinery::pkg::api::resource::Quantity::try_from(v.clone())
                        .ok()
                        .map(|q| (k.clone(), q))
                })
                .collect(),
        ),
        requests: Some(
            plan.resources
                .requests
                .iter()
                .filter_map(|(k, v)| {
                    k8s_openapi::apimachinery::pkg::api::resource::Quantity::try_from(v.clone())
                        .ok()
                        .map(|q| (k.clone(), q))
                })
                .collect(),
        ),
    };

    let container = Container {
        name: name.to_string(),
        image: Some(image.to_string()),
        command: if command.is_empty() { None } else { Some(command.to_vec()) },
        args: if args.is_empty() { None } else { Some(args.to_vec()) },
        env: Some(env),
        resources: Some(resources),
        ..Default::default()
    };

    let pod_spec = PodSpec {
        containers: vec![container],
        restart_policy: Some(plan.restart_policy.clone()),
        dns_policy: Some(plan.dns_policy.clone()),
        termination_grace_period_seconds: Some(plan.pod_termination_grace_period_seconds as i64),
        node_selector: if plan.node_selector.is_empty() {
            None
        } else {
            Some(plan.node_selector.clone().into_iter().collect())
        },
        runtime_class_name: plan.runtime_class_name.clone(),
        ..Default::default()
    };

    Deployment {
        metadata: Some(ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(ns.to_string()),
            labels: Some(labels.clone().into_iter().collect()),
            annotations: Some(plan.annotations.clone().into_iter().collect()),
            ..Default::default()
        }),
        spec: Some(DeploymentSpec {
            replicas: Some(plan.replicas as i32),
            revision_history_limit: Some(plan.deployment_revision_history_limit as i32),
            selector: LabelSelector {
                match_labels: Some(labels.into_iter().collect()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta::default()),
                spec: Some(pod_spec),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[async_trait]
impl Scheduler for KubeScheduler {
    async fn get_namespace(&self, name: &str) -> SchedulerResult<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        api.get(name).await.map(|_| ()).map_err(|e| match e {
            kube::Error::Api(ae) if ae.code == 404 => SchedulerError::NotFound(name.to_string()),
            other => wrap(other),
        })
    }
    async fn create_namespace(&self, name: &str) -> SchedulerResult<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let mut ns = Namespace::default();
        ns.metadata = Some(ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        });
        match api.create(&PostParams::default(), &ns).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                Err(SchedulerError::Conflict(name.to_string()))
            }
            Err(other) => Err(wrap(other)),
        }
    }
    async fn delete_namespace(&self, name: &str) -> SchedulerResult<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(other) => Err(wrap(other)),
        }
    }

    async fn get_deployment(&self, ns: &str, name: &str) -> SchedulerResult<DeploymentInfo> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), ns);
        let dep = api.get(name).await.map_err(|e| match e {
            kube::Error::Api(ae) if ae.code == 404 => {
                SchedulerError::NotFound(format!("deployment {}/{}", ns, name))
            }
            other => wrap(other),
        })?;
        Ok(deployment_info(name, ns, &dep))
    }
    async fn list_deployments(
        &self,
        ns: &str,
        labels: &BTreeMap<String, String>,
    ) -> SchedulerResult<Vec<DeploymentInfo>> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), ns);
        let selector = labels
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",");
        let lp = ListParams {
            label_selector: if selector.is_empty() { None } else { Some(selector) },
            ..Default::default()
        };
        let deps = api.list(&lp).await.map_err(wrap)?;
        Ok(deps
            .items
            .iter()
            .map(|d| {
                let name = d
                    .metadata
                    .as_ref()
                    .and_then(|m| m.name.clone())
                    .unwrap_or_default();
                deployment_info(&name, ns, d)
            })
            .collect())
    }
    async fn deploy(
        &self,
        ns: &str,
        name: &str,
        image: &str,
        command: &[String],
        args: &[String],
        plan: &DeployPlan,
    ) -> SchedulerResult<()> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), ns);
        let dep = build_deployment(name, ns, image, command, args, plan);
        match api.get(name).await {
            Ok(_) => {
                api.replace(name, &PostParams::default(), &dep)
                    .await
                    .map_err(wrap)?;
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                api.create(&PostParams::default(), &dep).await.map_err(wrap)?;
            }
            Err(other) => return Err(wrap(other)),
        }
        Ok(())
    }
    async fn scale_deployment(&self, ns: &str, name: &str, replicas: u32) -> SchedulerResult<()> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), ns);
        let patch = serde_json::json!({ "spec": { "replicas": replicas } });
        api.patch(
            name,
            &PatchParams::default(),
            serde_json::to_vec(&patch).map_err(wrap)?,
        )
        .await
        .map_err(wrap)?;
        Ok(())
    }
    async fn patch_deployment(&self, ns: &str, name: &str, patch: Value) -> SchedulerResult<()> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), ns);
        api.patch(
            name,
            &PatchParams::default(),
            serde_json::to_vec(&patch).map_err(wrap)?,
        )
        .await
        .map_err(wrap)?;
        Ok(())
    }
    async fn restart_deployment(&self, ns: &str, name: &str) -> SchedulerResult<()> {
        let timestamp = chrono_like_now();
        let patch = serde_json::json!({
            "spec": { "template": { "metadata": { "annotations": {
                "paasd.io/restartedAt": timestamp
            }}}}
        });
        self.patch_deployment(ns, name, patch).await
    }
    async fn deployment_in_progress(
        &self,
        ns: &str,
        name: &str,
        _timeout_secs: u32,
        _batches: u32,
        replicas: u32,
        _tags: &BTreeMap<String, String>,
    ) -> SchedulerResult<(bool, bool)> {
        let info = self.get_deployment(ns, name).await?;
        let in_progress = info.ready_replicas < replicas;
        Ok((in_progress, !in_progress))
    }
    async fn delete_deployment(&self, ns: &str, name: &str) -> SchedulerResult<()> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), ns);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(other) => Err(wrap(other)),
        }
    }

    async fn get_pod(&self, ns: &str, name: &str) -> SchedulerResult<PodInfo> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), ns);
        let pod = api.get(name).await.map_err(|e| match e {
            kube::Error::Api(ae) if ae.code == 404 => {
                SchedulerError::NotFound(format!("pod {}/{}", ns, name))
            }
            other => wrap(other),
        })?;
        Ok(pod_info(ns, &pod))
    }
    async fn list_pods(
        &self,
        ns: &str,
        labels: &BTreeMap<String, String>,
    ) -> SchedulerResult<Vec<PodInfo>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), ns);
        let selector = labels
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",");
        let lp = ListParams {
            label_selector: if selector.is_empty() { None } else { Some(selector) },
            ..Default::default()
        };
        let pods = api.list(&lp).await.map_err(wrap)?;
        Ok(pods.items.iter().map(|p| pod_info(ns, p)).collect())
    }
    async fn delete_pod(&self, ns: &str, name: &str) -> SchedulerResult<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), ns);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(other) => Err(wrap(other)),
        }
    }
    async fn watch_pods(
        &self,
        ns: &str,
        labels: &BTreeMap<String, String>,
        timeout_secs: u32,
    ) -> SchedulerResult<Box<dyn PodWatch>> {
        Ok(Box::new(PollingPodWatch {
            client: self.client.clone(),
            ns: ns.to_string(),
            labels: labels.clone(),
            deadline: std::time::Instant::now() + std::time::Duration::from_secs(timeout_secs as u64),
            cancelled: false,
        }))
    }

    async fn get_service(&self, ns: &str, name: &str) -> SchedulerResult<Value> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), ns);
        let svc = api.get(name).await.map_err(|e| match e {
            kube::Error::Api(ae) if ae.code == 404 => {
                SchedulerError::NotFound(format!("service {}/{}", ns, name))
            }
            other => wrap(other),
        })?;
        serde_json::to_value(svc).map_err(wrap)
    }
    async fn create_or_update_service(&self, ns: &str, name: &str, spec: Value) -> SchedulerResult<()> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), ns);
        let svc: Service = serde_json::from_value(spec).map_err(wrap)?;
        match api.get(name).await {
            Ok(_) => api.replace(name, &PostParams::default(), &svc).await.map(|_| ()).map_err(wrap),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                api.create(&PostParams::default(), &svc).await.map(|_| ()).map_err(wrap)
            }
            Err(other) => Err(wrap(other)),
        }
    }
    async fn delete_service(&self, ns: &str, name: &str) -> SchedulerResult<()> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), ns);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(other) => Err(wrap(other)),
        }
    }

    async fn get_secret(&self, ns: &str, name: &str) -> SchedulerResult<BTreeMap<String, String>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), ns);
        let secret = api.get(name).await.map_err(|e| match e {
            kube::Error::Api(ae) if ae.code == 404 => {
                SchedulerError::NotFound(format!("secret {}/{}", ns, name))
            }
            other => wrap(other),
        })?;
        let mut out = BTreeMap::new();
        if let Some(data) = secret.string_data {
            out.extend(data);
        }
        Ok(out)
    }
    async fn create_or_update_secret(
        &self,
        ns: &str,
        name: &str,
        data: BTreeMap<String, String>,
    ) -> SchedulerResult<()> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), ns);
        let secret = Secret {
            metadata: Some(ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(ns.to_string()),
                ..Default::default()
            }),
            string_data: Some(data.into_iter().collect()),
            ..Default::default()
        };
        match api.get(name).await {
            Ok(_) => api
                .replace(name, &PostParams::default(), &secret)
                .await
                .map(|_| ())
                .map_err(wrap),
            Err(kube::Error::Api(ae)) if ae.code == 404 => api
                .create(&PostParams::default(), &secret)
                .await
                .map(|_| ())
                .map_err(wrap),
            Err(other) => Err(wrap(other)),
        }
    }
    async fn delete_secret(&self, ns: &str, name: &str) -> SchedulerResult<()> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), ns);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(other) => Err(wrap(other)),
        }
    }
    async fn list_secrets(&self, ns: &str, labels: &BTreeMap<String, String>) -> SchedulerResult<Vec<String>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), ns);
        let selector = labels
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",");
        let lp = ListParams {
            label_selector: if selector.is_empty() { None } else { Some(selector) },
            ..Default::default()
        };
        let secrets = api.list(&lp).await.map_err(wrap)?;
        Ok(secrets
            .items
            .iter()
            .filter_map(|s| s.metadata.as_ref().and_then(|m| m.name.clone()))
            .collect())
    }

    async fn get_pvc(&self, ns: &str, name: &str) -> SchedulerResult<Value> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), ns);
        let pvc = api.get(name).await.map_err(|e| match e {
            kube::Error::Api(ae) if ae.code == 404 => {
                SchedulerError::NotFound(format!("pvc {}/{}", ns, name))
            }
            other => wrap(other),
        })?;
        serde_json::to_value(pvc).map_err(wrap)
    }
    async fn create_or_update_pvc(&self, ns: &str, name: &str, spec: Value) -> SchedulerResult<()> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), ns);
        let pvc: PersistentVolumeClaim = serde_json::from_value(spec).map_err(wrap)?;
        match api.get(name).await {
            Ok(_) => api
                .replace(name, &PostParams::default(), &pvc)
                .await
                .map(|_| ())
                .map_err(wrap),
            Err(kube::Error::Api(ae)) if ae.code == 404 => api
                .create(&PostParams::default(), &pvc)
                .await
                .map(|_| ())
                .map_err(wrap),
            Err(other) => Err(wrap(other)),
        }
    }
    async fn delete_pvc(&self, ns: &str, name: &str) -> SchedulerResult<()> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), ns);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(other) => Err(wrap(other)),
        }
    }

    async fn get_hpa(&self, ns: &str, name: &str) -> SchedulerResult<Value> {
        let api: Api<HorizontalPodAutoscaler> = Api::namespaced(self.client.clone(), ns);
        let hpa = api.get(name).await.map_err(|e| match e {
            kube::Error::Api(ae) if ae.code == 404 => {
                SchedulerError::NotFound(format!("hpa {}/{}", ns, name))
            }
            other => wrap(other),
        })?;
        serde_json::to_value(hpa).map_err(wrap)
    }
    async fn create_or_update_hpa(&self, ns: &str, name: &str, spec: Value) -> SchedulerResult<()> {
        let api: Api<HorizontalPodAutoscaler> = Api::namespaced(self.client.clone(), ns);
        let hpa: HorizontalPodAutoscaler = serde_json::from_value(spec).map_err(wrap)?;
        match api.get(name).await {
            Ok(_) => api
                .replace(name, &PostParams::default(), &hpa)
                .await
                .map(|_| ())
                .map_err(wrap),
            Err(kube::Error::Api(ae)) if ae.code == 404 => api
                .create(&PostParams::default(), &hpa)
                .await
                .map(|_| ())
                .map_err(wrap),
            Err(other) => Err(wrap(other)),
        }
    }
    async fn delete_hpa(&self, ns: &str, name: &str) -> SchedulerResult<()> {
        let api: Api<HorizontalPodAutoscaler> = Api::namespaced(self.client.clone(), ns);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(other) => Err(wrap(other)),
        }
    }

    async fn create_job(&self, ns: &str, name: &str, spec: Value) -> SchedulerResult<()> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), ns);
        let mut job: Job = serde_json::from_value(spec).map_err(wrap)?;
        job.metadata.get_or_insert_with(ObjectMeta::default).name = Some(name.to_string());
        match api.create(&PostParams::default(), &job).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                Err(SchedulerError::Conflict(format!("job {}/{}", ns, name)))
            }
            Err(other) => Err(wrap(other)),
        }
    }
    async fn get_job(&self, ns: &str, name: &str) -> SchedulerResult<Value> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), ns);
        let job = api.get(name).await.map_err(|e| match e {
            kube::Error::Api(ae) if ae.code == 404 => {
                SchedulerError::NotFound(format!("job {}/{}", ns, name))
            }
            other => wrap(other),
        })?;
        serde_json::to_value(job).map_err(wrap)
    }
    async fn delete_job(&self, ns: &str, name: &str) -> SchedulerResult<()> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), ns);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(other) => Err(wrap(other)),
        }
    }

    async fn list_events(&self, ns: &str, involved_object: &str) -> SchedulerResult<Vec<Value>> {
        let raw = self.raw("events", "", "v1");
        let req = raw.list(ns, &ListParams::default()).map_err(wrap)?;
        let list: Value = self.client.request::<Value>(req).await.map_err(wrap)?;
        let items = list
            .get("items")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        Ok(items
            .into_iter()
            .filter(|e| {
                e.pointer("/involvedObject/name")
                    .and_then(|v| v.as_str())
                    .map(|n| n == involved_object)
                    .unwrap_or(false)
            })
            .collect())
    }

    async fn get_gateway(&self, ns: &str, name: &str) -> SchedulerResult<Value> {
        let raw = self.raw("gateways", "gateway.networking.k8s.io", "v1beta1");
        self.raw_get(&raw, ns, name).await
    }
    async fn create_or_update_gateway(&self, ns: &str, name: &str, spec: Value) -> SchedulerResult<()> {
        let raw = self.raw("gateways", "gateway.networking.k8s.io", "v1beta1");
        self.raw_create_or_update(&raw, ns, name, spec).await
    }
    async fn delete_gateway(&self, ns: &str, name: &str) -> SchedulerResult<()> {
        let raw = self.raw("gateways", "gateway.networking.k8s.io", "v1beta1");
        self.raw_delete(&raw, ns, name).await
    }
    async fn get_route(&self, ns: &str, name: &str) -> SchedulerResult<Value> {
        let raw = self.raw("httproutes", "gateway.networking.k8s.io", "v1beta1");
        self.raw_get(&raw, ns, name).await
    }
    async fn create_or_update_route(&self, ns: &str, name: &str, spec: Value) -> SchedulerResult<()> {
        let raw = self.raw("httproutes", "gateway.networking.k8s.io", "v1beta1");
        self.raw_create_or_update(&raw, ns, name, spec).await
    }
    async fn delete_route(&self, ns: &str, name: &str) -> SchedulerResult<()> {
        let raw = self.raw("httproutes", "gateway.networking.k8s.io", "v1beta1");
        self.raw_delete(&raw, ns, name).await
    }

    async fn svcat_get_instance(&self, ns: &str, name: &str) -> SchedulerResult<Value> {
        let raw = self.raw("serviceinstances", "servicecatalog.k8s.io", "v1beta1");
        self.raw_get(&raw, ns, name).await
    }
    async fn svcat_create_instance(&self, ns: &str, name: &str, spec: Value) -> SchedulerResult<()> {
        let raw = self.raw("serviceinstances", "servicecatalog.k8s.io", "v1beta1");
        match self.raw_get(&raw, ns, name).await {
            Ok(_) => Err(SchedulerError::Conflict(format!("instance {}/{}", ns, name))),
            Err(SchedulerError::NotFound(_)) => self.raw_create(&raw, ns, spec).await,
            Err(e) => Err(e),
        }
    }
    async fn svcat_put_instance(&self, ns: &str, name: &str, spec: Value) -> SchedulerResult<()> {
        let raw = self.raw("serviceinstances", "servicecatalog.k8s.io", "v1beta1");
        self.raw_create_or_update(&raw, ns, name, spec).await
    }
    async fn svcat_delete_instance(&self, ns: &str, name: &str) -> SchedulerResult<()> {
        let raw = self.raw("serviceinstances", "servicecatalog.k8s.io", "v1beta1");
        self.raw_delete(&raw, ns, name).await
    }
    async fn svcat_get_binding(&self, ns: &str, name: &str) -> SchedulerResult<Value> {
        let raw = self.raw("servicebindings", "servicecatalog.k8s.io", "v1beta1");
        self.raw_get(&raw, ns, name).await
    }
    async fn svcat_create_binding(&self, ns: &str, name: &str, spec: Value) -> SchedulerResult<()> {
        let raw = self.raw("servicebindings", "servicecatalog.k8s.io", "v1beta1");
        match self.raw_get(&raw, ns, name).await {
            Ok(_) => Err(SchedulerError::Conflict(format!("binding {}/{}", ns, name))),
            Err(SchedulerError::NotFound(_)) => self.raw_create(&raw, ns, spec).await,
            Err(e) => Err(e),
        }
    }
    async fn svcat_delete_binding(&self, ns: &str, name: &str) -> SchedulerResult<()> {
        let raw = self.raw("servicebindings", "servicecatalog.k8s.io", "v1beta1");
        self.raw_delete(&raw, ns, name).await
    }
}

/// `watch_pods` has no long-lived kube watch stream plumbed through this
/// trait object yet; it polls `list_pods` on an interval until a terminal
/// phase is observed or the deadline passes. Sufficient for the bounded
/// waits `pipeline` and `run` need (spec.md §4.5, §4.6).
struct PollingPodWatch {
    client: APIClient,
    ns: String,
    labels: BTreeMap<String, String>,
    deadline: std::time::Instant,
    cancelled: bool,
}

#[async_trait]
impl PodWatch for PollingPodWatch {
    async fn next(&mut self) -> Option<PodState> {
        if self.cancelled {
            return None;
        }
        loop {
            if std::time::Instant::now() >= self.deadline {
                return None;
            }
            let api: Api<Pod> = Api::namespaced(self.client.clone(), &self.ns);
            let selector = self
                .labels
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join(",");
            let lp = ListParams {
                label_selector: if selector.is_empty() { None } else { Some(selector) },
                ..Default::default()
            };
            match api.list(&lp).await {
                Ok(pods) => {
                    if let Some(pod) = pods.items.first() {
                        let phase = pod
                            .status
                            .as_ref()
                            .and_then(|s| s.phase.clone())
                            .unwrap_or_default();
                        return Some(phase_to_state(&phase));
                    }
                }
                Err(_) => return Some(PodState::Unknown),
            }
            tokio::time::delay_for(std::time::Duration::from_secs(2)).await;
        }
    }
    fn cancel(&mut self) {
        self.cancelled = true;
    }
}

/// RFC3339, matching `paasd_definitions::model`'s `DateTime<Utc>` fields.
fn chrono_like_now() -> String {
    chrono::Utc::now().to_rfc3339()
}
