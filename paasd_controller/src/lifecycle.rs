//! Per-app provisioning/teardown, one-off runs, env projection, registry
//! secrets and autoscaling (spec.md §4.6, C7).
//!
//! Grounded on `shipcat_cli::kubeapi::ShipKube`'s per-app façade shape (one
//! struct wrapping the cluster client plus a fixed app identity) and on
//! `crds.rs`'s pattern of wrapping a typed spec into a named cluster object,
//! reused here for Gateway/HTTPRoute construction.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde_json::json;

use paasd_definitions::{
    App, AppSettings, AutoscaleSpec, Config, ErrorKind, Gateway, Protocol, Release, RegistryEntry,
    Result, Route, Service, ServicePort, TLS,
};
use paasd_scheduler::{DeploymentInfo, PodInfo, Scheduler, SchedulerError};

use crate::lock::KvStore;
use crate::release::ReleaseEngine;
use crate::store::EntityStore;

const RESERVED_PTYPE_RUN: &str = "run";

fn to_err(e: SchedulerError) -> paasd_definitions::Error {
    match e {
        SchedulerError::NotFound(m) => ErrorKind::NotFound(m).into(),
        SchedulerError::Conflict(m) => ErrorKind::AlreadyExists(m).into(),
        SchedulerError::TransportError(m) => ErrorKind::ServiceUnavailable(m).into(),
    }
}

/// Docker's default index, normalized to the auth key `docker login`
/// actually writes (spec.md §8 "registry docker config").
const DOCKER_INDEX_AUTH_KEY: &str = "https://index.docker.io/v1/";

fn docker_auth_hostname(image: &str, explicit: Option<&str>) -> String {
    if let Some(h) = explicit.filter(|h| !h.is_empty()) {
        return normalize_docker_hostname(h);
    }
    let first_segment = image.split('/').next().unwrap_or("");
    let looks_like_host = first_segment == "localhost"
        || first_segment.contains('.')
        || first_segment.contains(':');
    if looks_like_host {
        normalize_docker_hostname(first_segment)
    } else {
        DOCKER_INDEX_AUTH_KEY.to_string()
    }
}

fn normalize_docker_hostname(h: &str) -> String {
    if h == "docker.io" || h == "index.docker.io" {
        DOCKER_INDEX_AUTH_KEY.to_string()
    } else {
        h.to_string()
    }
}

pub struct AppLifecycle<'a> {
    scheduler: &'a dyn Scheduler,
    store: &'a dyn EntityStore,
    kv: &'a dyn KvStore,
}

impl<'a> AppLifecycle<'a> {
    pub fn new(scheduler: &'a dyn Scheduler, store: &'a dyn EntityStore, kv: &'a dyn KvStore) -> Self {
        AppLifecycle { scheduler, store, kv }
    }

    /// Auto-generates `id` when none is given. A pre-existing namespace with
    /// no Release behind it is a foreign/conflicting namespace and fails;
    /// otherwise the namespace, default Config, v1 Release, default
    /// AppSettings and default TLS are all seeded.
    pub async fn create(&self, id: Option<String>, owner: &str) -> Result<App> {
        let app_id = match id {
            Some(id) => {
                App::validate_id(&id)?;
                id
            }
            None => loop {
                let candidate = format!(
                    "{}-{}",
                    paasd_definitions::random_lowercase(6),
                    paasd_definitions::random_lowercase(8)
                );
                if self.store.get_app(&candidate).await.is_err() {
                    break candidate;
                }
            },
        };

        let ns_exists = self.scheduler.get_namespace(&app_id).await.is_ok();
        let has_release = !self.store.list_releases(&app_id).await?.is_empty();
        if ns_exists && !has_release {
            return Err(ErrorKind::AlreadyExists(format!("namespace '{}' already exists", app_id)).into());
        }
        if !ns_exists {
            self.scheduler.create_namespace(&app_id).await.map_err(to_err)?;
        }

        let app = self.store.create_app(App::new(&app_id, owner)?).await?;

        let plan = paasd_definitions::LimitPlan::default_plan();
        self.store.save_limit_plan(plan.clone()).await?;
        let mut config = Config::new(&app_id, owner);
        config.limits.insert("web".to_string(), plan.name.clone());
        config.limits.insert(RESERVED_PTYPE_RUN.to_string(), plan.name.clone());
        let config = self.store.save_config(config).await?;

        self.store
            .save_release(Release::new(&app_id, 1, config.id, None, "initial release"))
            .await?;
        self.store.save_app_settings(AppSettings::default_for(&app_id)).await?;
        self.store.save_tls(TLS::default_for(&app_id)).await?;

        Ok(app)
    }

    /// Deletes the namespace (missing is success), polls up to 30s for its
    /// disappearance, then drops the DB rows.
    pub async fn delete(&self, app: &App) -> Result<()> {
        match self.scheduler.delete_namespace(&app.id).await {
            Ok(()) | Err(SchedulerError::NotFound(_)) => {}
            Err(e) => return Err(to_err(e)),
        }
        let deadline = Instant::now() + Duration::from_secs(30);
        loop {
            match self.scheduler.get_namespace(&app.id).await {
                Err(SchedulerError::NotFound(_)) => break,
                _ if Instant::now() >= deadline => break,
                _ => tokio::time::delay_for(Duration::from_secs(1)).await,
            }
        }
        self.store.delete_app(&app.id).await
    }

    /// Ensures the web Service/Gateway/HTTPRoute triple exists, re-issuing
    /// the cluster mutation unconditionally so a stale default-TLS listener
    /// is refreshed on every call rather than only on first creation.
    pub async fn default_ingress(&self, app: &App, release: &Release) -> Result<()> {
        const PTYPE: &str = "web";
        let engine = ReleaseEngine::new(self.store, self.kv);
        let target_port = engine.get_port(release, PTYPE).await?.unwrap_or(80);

        let mut svc = self
            .store
            .get_service(&app.id, PTYPE)
            .await
            .unwrap_or_else(|_| Service::new(&app.id, PTYPE));
        svc.ports = vec![ServicePort {
            name: "http".into(),
            port: 80,
            protocol: Protocol::Tcp,
            target_port,
        }];
        let svc = self.store.save_service(svc).await?;
        self.scheduler
            .create_or_update_service(&app.id, &app.id, serde_json::to_value(&svc).unwrap_or_default())
            .await
            .map_err(to_err)?;

        let gateway = self
            .store
            .get_gateway(&app.id, &app.id)
            .await?
            .unwrap_or_else(|| Gateway::default_http(&app.id, &app.id));
        let gateway = self.store.save_gateway(gateway).await?;
        self.scheduler
            .create_or_update_gateway(&app.id, &gateway.name, serde_json::to_value(&gateway).unwrap_or_default())
            .await
            .map_err(to_err)?;

        let route = self
            .store
            .get_route(&app.id, &app.id)
            .await?
            .unwrap_or_else(|| Route::default_web(&app.id, &app.id, &gateway.name, &app.id, 80));
        let route = self.store.save_route(route).await?;
        self.scheduler
            .create_or_update_route(&app.id, &route.name, serde_json::to_value(&route).unwrap_or_default())
            .await
            .map_err(to_err)?;
        Ok(())
    }

    /// One-off Job run. `pod_name` is `{app}-run-{5 random lowercase+digits}`.
    pub async fn run(
        &self,
        app: &App,
        release: &Release,
        ptype: &str,
        command: Vec<String>,
        timeout_secs: u32,
        expires_secs: u32,
    ) -> Result<String> {
        if !release.has_build() {
            return Err(ErrorKind::Drycc("no build".into()).into());
        }
        let engine = ReleaseEngine::new(self.store, self.kv);
        let image = engine
            .get_deploy_image(release, ptype)
            .await?
            .ok_or_else(|| ErrorKind::Drycc(format!("no deploy image for ptype '{}'", ptype)))?;

        let secret_name = self.set_application_config(app, release, ptype).await?;
        let pod_name = format!("{}-run-{}", app.id, paasd_definitions::random_lowercase(5));
        let spec = json!({
            "metadata": {"name": pod_name},
            "spec": {
                "activeDeadlineSeconds": timeout_secs,
                "ttlSecondsAfterFinished": expires_secs,
                "template": {
                    "spec": {
                        "containers": [{
                            "name": RESERVED_PTYPE_RUN,
                            "image": image,
                            "command": command,
                            "envFrom": [{"secretRef": {"name": secret_name}}],
                        }],
                        "restartPolicy": "Never",
                    }
                }
            }
        });
        self.scheduler
            .create_job(&app.id, &pod_name, spec)
            .await
            .map_err(|e| ErrorKind::ServiceUnavailable(e.to_string()))?;
        Ok(pod_name)
    }

    /// Materializes env as `{app}-{ptype}-{version}-env` (keys lowercased,
    /// `_` -> `-`, sorted). Idempotent create-or-update.
    pub async fn set_application_config(&self, app: &App, release: &Release, ptype: &str) -> Result<String> {
        let config = self
            .store
            .latest_config(&app.id)
            .await?
            .unwrap_or_else(|| Config::new(&app.id, &app.owner));
        let mut envs: BTreeMap<String, String> = config
            .values_for_ptype(ptype)
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        // computed last, so these always win over user values with the same name
        envs.insert("DRYCC_APP".to_string(), app.id.clone());
        envs.insert("WORKFLOW_RELEASE".to_string(), format!("v{}", release.version));
        envs.insert("WORKFLOW_RELEASE_SUMMARY".to_string(), release.summary.clone());
        envs.insert("WORKFLOW_RELEASE_CREATED_AT".to_string(), release.created.to_rfc3339());
        if let Some(build_id) = release.build_id {
            if let Ok(stored) = self.store.get_build(build_id).await {
                envs.insert("SOURCE_VERSION".to_string(), stored.build.sha.clone());
            }
        }
        let engine = ReleaseEngine::new(self.store, self.kv);
        if let Some(port) = engine.get_port(release, ptype).await? {
            envs.insert("PORT".to_string(), port.to_string());
        }

        let data: BTreeMap<String, String> = envs
            .into_iter()
            .map(|(k, v)| (k.to_lowercase().replace('_', "-"), v))
            .collect();
        let secret_name = format!("{}-{}-{}-env", app.id, ptype, release.version);
        self.scheduler
            .create_or_update_secret(&app.id, &secret_name, data)
            .await
            .map_err(to_err)?;
        Ok(secret_name)
    }

    /// Explicit per-ptype registry entry, or an off-cluster fallback read
    /// from a controller-wide Secret. `None` when neither is configured.
    /// The docker config auth key is derived from `image` unless the
    /// registry entry pins an explicit hostname (spec.md §8 "registry
    /// docker config").
    pub async fn image_pull_secret(&self, app: &App, ptype: &str, image: &str) -> Result<Option<String>> {
        let config = self.store.latest_config(&app.id).await?;
        let explicit = config.as_ref().and_then(|c| c.registry.get(ptype).cloned());
        let (entry, off_cluster) = match explicit {
            Some(e) => (e, false),
            None => {
                let data = match self.scheduler.get_secret("drycc", "private-registry-fallback").await {
                    Ok(d) => d,
                    Err(SchedulerError::NotFound(_)) => return Ok(None),
                    Err(e) => return Err(to_err(e)),
                };
                let username = match data.get("username") {
                    Some(u) => u.clone(),
                    None => return Ok(None),
                };
                let password = data.get("password").cloned().unwrap_or_default();
                let hostname = data.get("hostname").cloned();
                (
                    RegistryEntry {
                        hostname,
                        username,
                        password,
                    },
                    true,
                )
            }
        };

        let auth = base64::encode(format!("{}:{}", entry.username, entry.password));
        let hostname = docker_auth_hostname(image, entry.hostname.as_deref());
        let dockerconfigjson = json!({ "auths": { hostname: {"auth": auth} } }).to_string();

        let name = if off_cluster {
            format!("private-registry-{}-off-cluster", ptype)
        } else {
            format!("private-registry-{}", ptype)
        };
        let mut data = BTreeMap::new();
        data.insert(".dockerconfigjson".to_string(), dockerconfigjson);
        self.scheduler
            .create_or_update_secret(&app.id, &name, data)
            .await
            .map_err(to_err)?;
        Ok(Some(name))
    }

    pub async fn describe_pod(&self, app: &App, name: &str) -> Result<PodInfo> {
        self.scheduler.get_pod(&app.id, name).await.map_err(to_err)
    }

    pub async fn list_pods(&self, app: &App, ptype: Option<&str>) -> Result<Vec<PodInfo>> {
        let mut labels = BTreeMap::new();
        if let Some(p) = ptype {
            labels.insert("type".to_string(), p.to_string());
        }
        self.scheduler.list_pods(&app.id, &labels).await.map_err(to_err)
    }

    pub async fn describe_deployment(&self, app: &App, ptype: &str) -> Result<DeploymentInfo> {
        self.scheduler
            .get_deployment(&app.id, &format!("{}-{}", app.id, ptype))
            .await
            .map_err(to_err)
    }

    pub async fn list_deployments(&self, app: &App) -> Result<Vec<DeploymentInfo>> {
        self.scheduler
            .list_deployments(&app.id, &BTreeMap::new())
            .await
            .map_err(to_err)
    }

    pub async fn list_events(&self, app: &App, involved_object: &str) -> Result<Vec<serde_json::Value>> {
        self.scheduler.list_events(&app.id, involved_object).await.map_err(to_err)
    }

    /// `run` never autoscales; `spec=None` deletes the HPA.
    pub async fn autoscale(&self, app: &App, ptype: &str, spec: Option<AutoscaleSpec>) -> Result<()> {
        if ptype == RESERVED_PTYPE_RUN {
            return Err(ErrorKind::Drycc(format!("ptype '{}' cannot be autoscaled", RESERVED_PTYPE_RUN)).into());
        }
        let name = format!("{}-{}", app.id, ptype);
        match spec {
            None => match self.scheduler.delete_hpa(&app.id, &name).await {
                Ok(()) | Err(SchedulerError::NotFound(_)) => Ok(()),
                Err(e) => Err(to_err(e)),
            },
            Some(s) => {
                s.verify()?;
                let hpa = json!({
                    "spec": {
                        "minReplicas": s.min_replicas,
                        "maxReplicas": s.max_replicas,
                        "metrics": s.metrics,
                        "scaleTargetRef": {"kind": "Deployment", "name": name},
                    }
                });
                self.scheduler.create_or_update_hpa(&app.id, &name, hpa).await.map_err(to_err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::InMemoryKv;
    use crate::store::InMemoryStore;
    use paasd_scheduler::fake::FakeScheduler;

    #[tokio::test]
    async fn create_seeds_config_release_settings_and_tls() {
        let scheduler = FakeScheduler::new();
        let store = InMemoryStore::new();
        let kv = InMemoryKv::new();
        let lifecycle = AppLifecycle::new(&scheduler, &store, &kv);

        let app = lifecycle.create(Some("alpha".to_string()), "user1").await.unwrap();
        assert_eq!(app.id, "alpha");
        assert!(store.latest_config("alpha").await.unwrap().is_some());
        assert!(store.get_release("alpha", 1).await.is_ok());
        assert!(store.latest_app_settings("alpha").await.unwrap().is_some());
        assert!(store.get_tls("alpha").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn create_rejects_foreign_namespace_without_release() {
        let scheduler = FakeScheduler::new();
        scheduler.create_namespace("alpha").await.unwrap();
        let store = InMemoryStore::new();
        let kv = InMemoryKv::new();
        let lifecycle = AppLifecycle::new(&scheduler, &store, &kv);

        let err = lifecycle.create(Some("alpha".to_string()), "user1").await.unwrap_err();
        assert!(format!("{}", err).contains("already exists"));
    }

    #[tokio::test]
    async fn run_rejects_release_without_build() {
        let scheduler = FakeScheduler::new();
        let store = InMemoryStore::new();
        let kv = InMemoryKv::new();
        let lifecycle = AppLifecycle::new(&scheduler, &store, &kv);
        let app = lifecycle.create(Some("alpha".to_string()), "user1").await.unwrap();
        let release = store.get_release("alpha", 1).await.unwrap();

        let err = lifecycle
            .run(&app, &release, "web", vec!["true".to_string()], 600, 3600)
            .await
            .unwrap_err();
        assert!(format!("{}", err).contains("no build"));
    }

    #[test]
    fn docker_auth_hostname_keys_default_registry_under_index_url() {
        assert_eq!(docker_auth_hostname("autotest/example", None), DOCKER_INDEX_AUTH_KEY);
    }

    #[test]
    fn docker_auth_hostname_keys_custom_registry_by_image_prefix() {
        assert_eq!(docker_auth_hostname("quay.io/user/repo", None), "quay.io");
    }

    #[tokio::test]
    async fn image_pull_secret_uses_fallback_when_no_registry_configured() {
        let scheduler = FakeScheduler::new();
        let store = InMemoryStore::new();
        let kv = InMemoryKv::new();
        let lifecycle = AppLifecycle::new(&scheduler, &store, &kv);
        let app = lifecycle.create(Some("alpha".to_string()), "user1").await.unwrap();

        assert!(lifecycle
            .image_pull_secret(&app, "web", "autotest/example")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn autoscale_rejects_run_ptype() {
        let scheduler = FakeScheduler::new();
        let store = InMemoryStore::new();
        let kv = InMemoryKv::new();
        let lifecycle = AppLifecycle::new(&scheduler, &store, &kv);
        let app = lifecycle.create(Some("alpha".to_string()), "user1").await.unwrap();

        let err = lifecycle.autoscale(&app, "run", None).await.unwrap_err();
        assert!(format!("{}", err).contains("cannot be autoscaled"));
    }
}
