//! Computes per-ptype deploy plans, serializes through the deploy lock,
//! emits cluster mutations, verifies health, rolls back on failure, and
//! cleans obsolete ptypes (spec.md §4.5, C6).
//!
//! The parallel fan-out across ptypes reuses `tasks::TaskRunner`, grounded
//! on `shipcat_cli::helm::parallel::reconcile`; the wait-for-job-pod and
//! in-progress polling shapes are grounded on `shipcat_cli::kube`'s
//! poll-until-settled style for rollout status checks.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use paasd_definitions::{App, ErrorKind, LimitPlan, Release, ReleaseState, Result};
use paasd_scheduler::{DeployPlan, PlanVolume, PlanVolumeMount, PodState, PodWatch, Probes, ResourceLimits, Scheduler};

use crate::health::{verify_http_health, verify_tcp_health, HealthChecker};
use crate::lock::{DeployLock, KvStore};
use crate::release::ReleaseEngine;
use crate::store::EntityStore;
use crate::tasks::{TaskOutcome, TaskRunner};

const RESERVED_PTYPE_RUN: &str = "run";
const PIPELINE_RUN_TIMEOUT: u32 = 600;

/// Process-wide defaults referenced by the deploy-plan table (spec.md §4.5)
/// when no per-ptype or per-release override exists.
#[derive(Clone, Debug)]
pub struct GlobalDefaults {
    pub dns_policy: String,
    pub deploy_batches: u32,
    pub deploy_timeout: u32,
    pub deployment_revision_history_limit: u32,
    pub pod_termination_grace_period_seconds: u32,
    pub image_pull_policy: String,
}

impl Default for GlobalDefaults {
    fn default() -> Self {
        GlobalDefaults {
            dns_policy: "ClusterFirst".to_string(),
            deploy_batches: 1,
            deploy_timeout: 120,
            deployment_revision_history_limit: 5,
            pod_termination_grace_period_seconds: 30,
            image_pull_policy: "IfNotPresent".to_string(),
        }
    }
}

pub struct DeployOrchestrator<'a> {
    scheduler: &'a dyn Scheduler,
    store: &'a dyn EntityStore,
    kv: &'a dyn KvStore,
    health: &'a dyn HealthChecker,
    parallelism: usize,
    defaults: GlobalDefaults,
}

impl<'a> DeployOrchestrator<'a> {
    pub fn new(
        scheduler: &'a dyn Scheduler,
        store: &'a dyn EntityStore,
        kv: &'a dyn KvStore,
        health: &'a dyn HealthChecker,
        parallelism: usize,
    ) -> Self {
        DeployOrchestrator {
            scheduler,
            store,
            kv,
            health,
            parallelism,
            defaults: GlobalDefaults::default(),
        }
    }

    /// Same as `new`, but takes `parallelism` and the deploy-plan defaults
    /// from a `ControllerConfig` read at process startup instead of a bare
    /// number and the hardcoded `GlobalDefaults::default()`.
    pub fn with_config(
        scheduler: &'a dyn Scheduler,
        store: &'a dyn EntityStore,
        kv: &'a dyn KvStore,
        health: &'a dyn HealthChecker,
        config: &crate::config::ControllerConfig,
    ) -> Self {
        DeployOrchestrator {
            scheduler,
            store,
            kv,
            health,
            parallelism: config.task_parallelism.max(1),
            defaults: config.deploy.clone(),
        }
    }

    fn runners_namespace(&self, app_id: &str) -> String {
        app_id.to_string()
    }

    /// Full deploy including optional pre-deploy jobs. For each `run` step
    /// declared by the release for `ptypes`, creates a one-off Job and
    /// blocks on `pod.watch` until the sequence terminates in `Down`; any
    /// other terminal state raises. Always releases the deploy locks for
    /// `ptypes` and saves only `state`/`failed` on the release.
    pub async fn pipeline(
        &self,
        app: &App,
        release: &mut Release,
        ptypes: &[String],
        force: bool,
    ) -> Result<()> {
        let engine = ReleaseEngine::new(self.store, self.kv);
        let ns = self.runners_namespace(&app.id);
        let runners = engine.get_runners(release, ptypes).await?;

        let mut result: Result<()> = Ok(());
        for (ptype, run) in &runners {
            let job_name = format!("{}-run-{}", app.id, paasd_definitions::random_lowercase(5));
            let mut labels = BTreeMap::new();
            labels.insert("job-name".to_string(), job_name.clone());
            let spec = json!({
                "metadata": {"name": job_name, "labels": labels},
                "spec": {
                    "template": {
                        "spec": {
                            "containers": [{
                                "name": ptype,
                                "image": run.image,
                                "command": run.command,
                                "args": run.args,
                            }],
                            "restartPolicy": "Never",
                        }
                    }
                }
            });
            if let Err(e) = self.scheduler.create_job(&ns, &job_name, spec).await {
                result = Err(ErrorKind::ServiceUnavailable(e.to_string()).into());
                break;
            }

            let watch = self.scheduler.watch_pods(&ns, &labels, PIPELINE_RUN_TIMEOUT).await;
            let mut watch = match watch {
                Ok(w) => w,
                Err(e) => {
                    result = Err(ErrorKind::ServiceUnavailable(e.to_string()).into());
                    break;
                }
            };
            let outcome = paasd_scheduler::drain_to_terminal(watch.as_mut()).await;
            match outcome {
                Some(PodState::Down) => {}
                other => {
                    result = Err(ErrorKind::Drycc(format!(
                        "pre-deploy job {} ended in {:?}, expected Down",
                        job_name, other
                    ))
                    .into());
                    break;
                }
            }
        }
        if result.is_ok() {
            result = self.deploy(app, release, Some(ptypes), force, false).await;
        }

        if let Err(e) = &result {
            release.state = ReleaseState::Crashed;
            release.failed = true;
            release.add_condition(
                ReleaseState::Crashed,
                "pipeline",
                ptypes.to_vec(),
                Some(e.to_string()),
            );
        }

        let lock = DeployLock::new(self.kv, &app.id);
        lock.release(ptypes).await;

        // save only state/failed, never the rest of the struct, so a
        // concurrent edit to conditions/deployed_ptypes is not clobbered.
        let mut persisted = self.store.get_release(&app.id, release.version).await?;
        persisted.state = release.state;
        persisted.failed = release.failed;
        persisted.conditions = release.conditions.clone();
        let expected = persisted.updated;
        persisted.updated = Utc::now();
        self.store.save_release_cas(persisted, expected).await?;

        result
    }

    /// Builds a per-ptype plan, executes it in a single task batch (routable
    /// ptypes first), and verifies first-time-web health.
    pub async fn deploy(
        &self,
        app: &App,
        release: &mut Release,
        ptypes: Option<&[String]>,
        force: bool,
        rollback_on_failure: bool,
    ) -> Result<()> {
        if !release.has_build() {
            return Err(ErrorKind::Drycc("no build".into()).into());
        }
        let engine = ReleaseEngine::new(self.store, self.kv);
        let declared = engine
            .resolve_declared_ptypes(release)
            .await?
            .unwrap_or_default();
        let mut target: Vec<String> = match ptypes {
            Some(p) => p.to_vec(),
            None => declared.into_iter().collect(),
        };

        let app_settings = self
            .store
            .latest_app_settings(&app.id)
            .await?
            .unwrap_or_else(|| paasd_definitions::AppSettings::default_for(&app.id));
        target.sort_by_key(|p| if p == "web" && app_settings.routable { 0 } else { 1 });

        let ns = self.runners_namespace(&app.id);
        let lock = DeployLock::new(self.kv, &app.id);
        lock.acquire(&target, force).await?;

        let prev = engine.previous(&app.id, Some(release.version)).await?;
        let first_time = prev.as_ref().map(|p| !p.has_build()).unwrap_or(true);

        let mut plans = Vec::with_capacity(target.len());
        for ptype in &target {
            let name = format!("{}-{}", app.id, ptype);
            let in_progress = self
                .scheduler
                .deployment_in_progress(&ns, &name, self.defaults.deploy_timeout, self.defaults.deploy_batches, 0, &BTreeMap::new())
                .await
                .map_err(|e| ErrorKind::ServiceUnavailable(e.to_string()))?;
            if in_progress.0 && !force {
                lock.release(&target).await;
                return Err(ErrorKind::AlreadyExists(format!("deployment {} is already in progress", name)).into());
            }
            let plan = self.gather_app_settings(app, release, &app_settings, ptype).await?;
            let image = engine
                .get_deploy_image(release, ptype)
                .await?
                .ok_or_else(|| ErrorKind::Drycc(format!("no deploy image resolved for ptype '{}'", ptype)))?;
            let command = engine.get_deploy_command(release, ptype).await?.unwrap_or_default();
            let args = engine.get_deploy_args(release, ptype).await?;
            plans.push((ptype.clone(), name, image, command, args, plan));
        }

        let runner = TaskRunner::new(self.parallelism.max(1));
        let items: Vec<(String, _)> = plans
            .into_iter()
            .map(|(ptype, name, image, command, args, plan)| {
                let ptype2 = ptype.clone();
                let ns = ns.clone();
                (
                    ptype,
                    move || async move {
                        self.scheduler
                            .deploy(&ns, &name, &image, &command, &args, &plan)
                            .await
                            .map_err(|e| ErrorKind::ServiceUnavailable(format!("{}: {}", ptype2, e)).into())
                    },
                )
            })
            .collect();

        let apply_result = runner.run(items, |_outcome: &TaskOutcome<String>| {}).await;

        if let Err(e) = apply_result {
            lock.release(&target).await;
            if rollback_on_failure {
                if let Some(mut prev) = prev {
                    if prev.has_build() {
                        Box::pin(self.deploy(app, &mut prev, Some(&target), true, false)).await.ok();
                    }
                }
            }
            return Err(e);
        }

        if first_time {
            for ptype in &target {
                let port = engine.get_port(release, ptype).await?.unwrap_or(80);
                let domain = format!("{}-{}.{}.svc.cluster.local", app.id, ptype, app.id);
                if ptype == "web" {
                    let cfg = self.store.get_config(release.config_id).await?;
                    let liveness = cfg.healthcheck.get(ptype).and_then(|h| h.liveness_probe.clone());
                    verify_http_health(self.health, &domain, port, liveness.as_ref()).await;
                } else {
                    verify_tcp_health(self.health, &domain, port).await;
                }
            }
        }

        lock.release(&target).await;
        release.deployed_ptypes.extend(target.iter().cloned());
        release.state = ReleaseState::Succeed;
        Ok(())
    }

    /// Validates structure, diffs against `app.structure`, applies only the
    /// changed ptypes, rolling back to the old counts on `ServiceUnavailable`.
    pub async fn scale(&self, app: &mut App, structure: BTreeMap<String, u32>) -> Result<()> {
        App::validate_structure(&structure)?;
        let engine = ReleaseEngine::new(self.store, self.kv);
        let release = engine
            .latest(&app.id)
            .await?
            .ok_or_else(|| ErrorKind::Drycc("no release to scale".into()))?;
        if !release.has_build() {
            return Err(ErrorKind::Drycc("no build".into()).into());
        }

        let old = app.structure.clone();
        let ns = self.runners_namespace(&app.id);
        let changed: Vec<(String, u32)> = structure
            .iter()
            .filter(|(ptype, count)| old.get(*ptype) != Some(*count))
            .map(|(p, c)| (p.clone(), *c))
            .collect();

        for (ptype, count) in &changed {
            let name = format!("{}-{}", app.id, ptype);
            if let Err(e) = self.scheduler.scale_deployment(&ns, &name, *count).await {
                for (ptype, count) in &changed {
                    let name = format!("{}-{}", app.id, ptype);
                    let revert = old.get(ptype).copied().unwrap_or(0);
                    let _ = self.scheduler.scale_deployment(&ns, &name, revert).await;
                }
                return Err(ErrorKind::ServiceUnavailable(format!("scale {} failed: {}", ptype, e)).into());
            }
        }

        app.structure = structure;
        let expected = app.updated;
        app.updated = Utc::now();
        *app = self.store.save_app_cas(app.clone(), expected).await?;
        Ok(())
    }

    /// Patches each ptype's Deployment with updated volumes/mounts computed
    /// from the app's Volume set, preserving other pod template fields.
    pub async fn mount(&self, app: &App, volume_name: &str, structure: Option<&[String]>) -> Result<()> {
        let volumes = self.store.list_volumes(&app.id).await?;
        let volume = volumes
            .iter()
            .find(|v| v.name == volume_name)
            .ok_or_else(|| ErrorKind::NotFound(format!("volume '{}' not found", volume_name)))?;

        let ptypes: Vec<String> = match structure {
            Some(s) => s.to_vec(),
            None => app.structure.keys().cloned().collect(),
        };
        let ns = self.runners_namespace(&app.id);
        for ptype in &ptypes {
            let mount_path = match volume.path.get(ptype) {
                Some(p) => p,
                None => continue,
            };
            let name = format!("{}-{}", app.id, ptype);
            let patch = json!({
                "spec": {
                    "template": {
                        "spec": {
                            "volumes": [{"name": volume.name, "persistentVolumeClaim": {"claimName": volume.name}}],
                            "containers": [{"name": ptype, "volumeMounts": [{"name": volume.name, "mountPath": mount_path}]}]
                        }
                    }
                }
            });
            self.scheduler
                .patch_deployment(&ns, &name, patch)
                .await
                .map_err(|e| ErrorKind::ServiceUnavailable(e.to_string()))?;
        }
        Ok(())
    }

    /// Trigger a rolling restart; if `name` identifies a single pod, delete
    /// it instead (the Deployment replaces it).
    pub async fn restart(&self, app: &App, ptype: &str, pod_name: Option<&str>) -> Result<()> {
        let ns = self.runners_namespace(&app.id);
        if let Some(name) = pod_name {
            self.scheduler
                .delete_pod(&ns, name)
                .await
                .map_err(|e| ErrorKind::ServiceUnavailable(e.to_string()))?;
        } else {
            let name = format!("{}-{}", app.id, ptype);
            self.scheduler
                .restart_deployment(&ns, &name)
                .await
                .map_err(|e| ErrorKind::ServiceUnavailable(e.to_string()))?;
        }
        Ok(())
    }

    /// Scales to zero ptypes present in `app.structure` but not in the
    /// release's declared ptypes (further restricted to `ptypes` when
    /// given), then deletes their Deployments and Secrets. Takes the
    /// `DeployLock` for the ptypes being scaled to zero first, closing the
    /// race against a concurrent `deploy` of the same ptype (spec.md's
    /// open question on this, decided in favor of gating).
    pub async fn clean(&self, app: &App, release: Option<&Release>, ptypes: Option<&[String]>) -> Result<()> {
        let declared: std::collections::BTreeSet<String> = match release.and_then(|r| r.build_id) {
            Some(build_id) => self.store.get_build(build_id).await?.build.declared_ptypes(),
            None => Default::default(),
        };
        let ns = self.runners_namespace(&app.id);
        let mut obsolete: Vec<String> = app
            .structure
            .keys()
            .filter(|p| !declared.contains(*p))
            .cloned()
            .collect();
        if let Some(filter) = ptypes {
            obsolete.retain(|p| filter.contains(p));
        }

        let lock = DeployLock::new(self.kv, &app.id);
        lock.acquire(&obsolete, false).await?;

        for ptype in &obsolete {
            let name = format!("{}-{}", app.id, ptype);
            self.scheduler.scale_deployment(&ns, &name, 0).await.ok();
            self.scheduler.delete_deployment(&ns, &name).await.ok();
        }

        lock.release(&obsolete).await;

        let secrets = self.scheduler.list_secrets(&ns, &BTreeMap::new()).await.unwrap_or_default();
        for secret_name in secrets {
            let still_live = app.structure.keys().any(|p| secret_name.starts_with(&format!("{}-{}-", app.id, p)));
            if !still_live {
                self.scheduler.delete_secret(&ns, &secret_name).await.ok();
            }
        }
        Ok(())
    }

    /// For each ptype in `app.structure` with scale>0, enqueue a redeploy if
    /// its Deployment is missing; logs (does not raise) on other failures.
    pub async fn state_to_k8s(&self, app: &App) -> Vec<String> {
        let ns = self.runners_namespace(&app.id);
        let mut to_redeploy = Vec::new();
        for (ptype, scale) in &app.structure {
            if *scale == 0 {
                continue;
            }
            let name = format!("{}-{}", app.id, ptype);
            match self.scheduler.get_deployment(&ns, &name).await {
                Ok(_) => {}
                Err(paasd_scheduler::SchedulerError::NotFound(_)) => to_redeploy.push(ptype.clone()),
                Err(e) => warn!("state_to_k8s: non-404 error reading {}: {}", name, e),
            }
        }
        to_redeploy
    }

    /// Builds the per-ptype deploy plan (spec.md §4.5 table).
    async fn gather_app_settings(
        &self,
        app: &App,
        release: &Release,
        app_settings: &paasd_definitions::AppSettings,
        ptype: &str,
    ) -> Result<DeployPlan> {
        let engine = ReleaseEngine::new(self.store, self.kv);
        let config = self.store.get_config(release.config_id).await?;
        let limit_plan = match config.limits.get(ptype) {
            Some(name) => self.store.get_limit_plan(name).await.unwrap_or_else(|_| LimitPlan::default_plan()),
            None => LimitPlan::default_plan(),
        };

        let mut envs = BTreeMap::new();
        for (k, v) in config.values_for_ptype(ptype) {
            envs.insert(k.to_string(), v.to_string());
        }
        envs.insert("DRYCC_APP".to_string(), app.id.clone());
        envs.insert("WORKFLOW_RELEASE".to_string(), format!("v{}", release.version));
        envs.insert("WORKFLOW_RELEASE_SUMMARY".to_string(), release.summary.clone());
        envs.insert("WORKFLOW_RELEASE_CREATED_AT".to_string(), release.created.to_rfc3339());
        if let Some(build_id) = release.build_id {
            if let Ok(stored) = self.store.get_build(build_id).await {
                envs.insert("SOURCE_VERSION".to_string(), stored.build.sha.clone());
            }
        }
        if let Some(port) = engine.get_port(release, ptype).await? {
            envs.insert("PORT".to_string(), port.to_string());
        }

        let replicas = app.structure.get(ptype).copied().unwrap_or(0);
        let build_type = release.build_id.map(|_| ptype.to_string()).unwrap_or_default();
        let registry = config.registry.get(ptype).map(|_| ptype.to_string());
        let healthcheck = config.healthcheck.get(ptype).map(|h| Probes {
            liveness: h.liveness_probe.as_ref().map(|p| serde_json::to_value(p).unwrap_or_default()),
            readiness: h.readiness_probe.as_ref().map(|p| serde_json::to_value(p).unwrap_or_default()),
        });

        // reserved config keys double as env overrides for deploy-plan knobs
        // (spec.md §4.5/§9); fall back to the process-wide default when the
        // key is absent or fails to parse.
        let deploy_batches = envs
            .get("DRYCC_DEPLOY_BATCHES")
            .and_then(|v| v.parse().ok())
            .unwrap_or(self.defaults.deploy_batches);
        let deploy_timeout = envs
            .get("DRYCC_DEPLOY_TIMEOUT")
            .and_then(|v| v.parse().ok())
            .unwrap_or(self.defaults.deploy_timeout);
        let deployment_revision_history_limit = envs
            .get("KUBERNETES_DEPLOYMENTS_REVISION_HISTORY_LIMIT")
            .and_then(|v| v.parse().ok())
            .unwrap_or(self.defaults.deployment_revision_history_limit);
        let image_pull_policy = envs
            .get("IMAGE_PULL_POLICY")
            .cloned()
            .unwrap_or_else(|| self.defaults.image_pull_policy.clone());

        let app_volumes = self.store.list_volumes(&app.id).await?;
        let mut volumes: Vec<PlanVolume> = app_volumes
            .iter()
            .filter(|v| v.path.contains_key(ptype))
            .map(|v| PlanVolume {
                name: v.name.clone(),
                source: json!({"persistentVolumeClaim": {"claimName": v.name}}),
            })
            .collect();
        let mut volume_mounts: Vec<PlanVolumeMount> = app_volumes
            .iter()
            .filter_map(|v| {
                v.path.get(ptype).map(|mount_path| PlanVolumeMount {
                    name: v.name.clone(),
                    mount_path: mount_path.clone(),
                    read_only: false,
                })
            })
            .collect();
        volumes.extend(limit_plan.pod_volumes.iter().map(|pv| PlanVolume {
            name: pv.name.clone(),
            source: serde_json::to_value(pv).unwrap_or_default(),
        }));
        volume_mounts.extend(limit_plan.container_volume_mounts.iter().map(|vm| PlanVolumeMount {
            name: vm.name.clone(),
            mount_path: vm.mount_path.clone(),
            read_only: vm.read_only,
        }));

        Ok(DeployPlan {
            tags: config.tags.get(ptype).cloned().unwrap_or_default(),
            envs,
            registry,
            replicas,
            version: release.version,
            app_type: ptype.to_string(),
            resources: ResourceLimits {
                limits: limit_plan.limits.clone(),
                requests: limit_plan.requests.clone(),
            },
            build_type,
            annotations: limit_plan.annotations.clone(),
            healthcheck,
            runtime_class_name: limit_plan.runtime_class_name.clone(),
            dns_policy: self.defaults.dns_policy.clone(),
            lifecycle_post_start: config.lifecycle_post_start.get(ptype).map(|h| h.command.clone()),
            lifecycle_pre_stop: config.lifecycle_pre_stop.get(ptype).map(|h| h.command.clone()),
            routable: ptype == "web" && app_settings.routable,
            deploy_batches,
            restart_policy: if ptype == RESERVED_PTYPE_RUN { "Never".to_string() } else { "Always".to_string() },
            deploy_timeout,
            deployment_revision_history_limit,
            release_summary: release.summary.clone(),
            pod_termination_grace_period_seconds: config
                .termination_grace_period
                .get(ptype)
                .copied()
                .unwrap_or(self.defaults.pod_termination_grace_period_seconds),
            image_pull_secret_name: None,
            image_pull_policy,
            volumes,
            volume_mounts,
            node_selector: limit_plan.node_selector.clone(),
            pod_security_context: serde_json::to_value(&limit_plan.pod_security_context).unwrap_or_default(),
            container_security_context: serde_json::to_value(&limit_plan.container_security_context).unwrap_or_default(),
        })
    }
}
