//! Retry-policy-driven background task wrappers (spec.md §4.9, C8).
//!
//! Grounded on `original_source/rootfs/api/tasks.py`'s Celery task
//! decorators. Kept in the teacher's idiom - plain async fns plus an
//! explicit backoff type - rather than reimplementing a task queue: the
//! rest of the control plane has no broker, so each retry loop just sleeps
//! in place and is driven by whatever scheduled the call (cron, a worker
//! pool, a test).

use std::time::Duration;

use rand::Rng;

use paasd_definitions::{ErrorKind, Result};

use crate::deploy::DeployOrchestrator;
use crate::resource::ResourceManager;
use crate::store::EntityStore;

/// What a retrying worker should do next.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    RetryAfter(Duration),
    GiveUp,
}

fn jitter(base: Duration) -> Duration {
    let millis = base.as_millis() as u64;
    let jittered = rand::thread_rng().gen_range(millis / 2, millis + 1);
    Duration::from_millis(jittered)
}

/// `tasks.py::retrieve_resource`'s custom schedule: 30s while the row is
/// under an hour old, 30min afterward, forever.
fn retrieve_resource_backoff(age: chrono::Duration) -> Duration {
    if age < chrono::Duration::hours(1) {
        Duration::from_secs(30)
    } else {
        Duration::from_secs(30 * 60)
    }
}

/// Exponential backoff with jitter, base 8s, capped at 3600s (unbounded
/// retries), used by `send_measurements`.
fn measurement_backoff(attempt: u32) -> Duration {
    let capped_attempt = attempt.min(9); // 8 * 2^9 = 4096 > cap, saturates below
    let exp = Duration::from_secs(8) * 2u32.pow(capped_attempt);
    let capped = exp.min(Duration::from_secs(3600));
    jitter(capped)
}

/// `jitter`-only policy shared by scale_app/restart_app/mount_app, 3 max
/// retries, base 2s.
fn jittered_backoff(attempt: u32) -> Option<Duration> {
    if attempt >= 3 {
        return None;
    }
    Some(jitter(Duration::from_secs(2 * (attempt + 1) as u64)))
}

fn is_not_found(e: &paasd_definitions::Error) -> bool {
    matches!(e.kind(), ErrorKind::NotFound(_))
}

fn is_service_unavailable(e: &paasd_definitions::Error) -> bool {
    matches!(e.kind(), ErrorKind::ServiceUnavailable(_))
}

/// Poll a single Resource's instance/binding status once. Swallows
/// `NotFound` (the row may have been deleted between scheduling and
/// running); any other error yields a retry per the custom backoff keyed
/// off the resource's age.
pub async fn retrieve_resource(resources: &ResourceManager<'_>, app_id: &str, name: &str) -> Backoff {
    match resources.retrieve(app_id, name).await {
        Ok(_) => Backoff::GiveUp,
        Err(e) if is_not_found(&e) => {
            warn!("retrieve_resource: {}/{} no longer exists, dropping", app_id, name);
            Backoff::GiveUp
        }
        Err(e) => {
            warn!("retrieve_resource failed for {}/{}: {}", app_id, name, e);
            let age = resources
                .get(app_id, name)
                .await
                .map(|r| r.age())
                .unwrap_or_else(|_| chrono::Duration::zero());
            Backoff::RetryAfter(retrieve_resource_backoff(age))
        }
    }
}

/// A sink for app metric samples; no concrete metrics backend exists in
/// this control plane so callers inject whatever one they have (spec.md
/// explicitly scopes metrics storage out, §2 Non-goals).
#[async_trait::async_trait]
pub trait MetricsSink: Send + Sync {
    async fn send(&self, app_id: &str, measurements: &serde_json::Value) -> Result<()>;
}

/// Unbounded exponential-backoff-with-jitter retry, matching
/// `tasks.py::send_measurements`'s `autoretry_for=(Exception,)`.
pub async fn send_measurements(
    sink: &dyn MetricsSink,
    app_id: &str,
    measurements: &serde_json::Value,
    attempt: u32,
) -> Backoff {
    match sink.send(app_id, measurements).await {
        Ok(()) => Backoff::GiveUp,
        Err(e) => {
            warn!("send_measurements failed for {}: {}", app_id, e);
            Backoff::RetryAfter(measurement_backoff(attempt))
        }
    }
}

/// Retries only on `ServiceUnavailable`, up to 3 times, matching
/// `tasks.py::scale_app`'s `autoretry_for=(ServiceUnavailable,)`.
pub async fn scale_app(
    deploy: &DeployOrchestrator<'_>,
    app: &mut paasd_definitions::App,
    structure: std::collections::BTreeMap<String, u32>,
    attempt: u32,
) -> Result<Backoff> {
    match deploy.scale(app, structure).await {
        Ok(()) => Ok(Backoff::GiveUp),
        Err(e) if is_service_unavailable(&e) => match jittered_backoff(attempt) {
            Some(d) => Ok(Backoff::RetryAfter(d)),
            None => Err(e),
        },
        Err(e) => Err(e),
    }
}

pub async fn restart_app(
    deploy: &DeployOrchestrator<'_>,
    app: &paasd_definitions::App,
    ptype: &str,
    pod_name: Option<&str>,
    attempt: u32,
) -> Result<Backoff> {
    match deploy.restart(app, ptype, pod_name).await {
        Ok(()) => Ok(Backoff::GiveUp),
        Err(e) if is_service_unavailable(&e) => match jittered_backoff(attempt) {
            Some(d) => Ok(Backoff::RetryAfter(d)),
            None => Err(e),
        },
        Err(e) => Err(e),
    }
}

/// Merges `path` into the volume's recorded mount paths (a `None` value
/// removes the entry, matching `tasks.py::mount_app`'s merge-then-null-
/// removes semantics) before re-applying it to the running Deployments.
/// Swallows all errors, matching the Python task's `logger.exception(e)`
/// rather than re-raising.
pub async fn mount_app(
    deploy: &DeployOrchestrator<'_>,
    store: &dyn EntityStore,
    app: &paasd_definitions::App,
    volume_name: &str,
    path: std::collections::BTreeMap<String, Option<String>>,
    attempt: u32,
) -> Backoff {
    let result = async {
        let mut volumes = store.list_volumes(&app.id).await?;
        let volume = volumes
            .iter_mut()
            .find(|v| v.name == volume_name)
            .ok_or_else(|| ErrorKind::NotFound(format!("volume '{}' not found", volume_name)))?;
        for (ptype, value) in &path {
            match value {
                Some(p) => {
                    volume.path.insert(ptype.clone(), p.clone());
                }
                None => {
                    volume.path.remove(ptype);
                }
            }
        }
        let volume = volume.clone();
        store.save_volume(volume).await?;
        deploy.mount(app, volume_name, None).await
    }
    .await;

    match result {
        Ok(()) => Backoff::GiveUp,
        Err(e) => {
            warn!("mount_app failed for {}/{}: {}", app.id, volume_name, e);
            if is_service_unavailable(&e) {
                match jittered_backoff(attempt) {
                    Some(d) => Backoff::RetryAfter(d),
                    None => Backoff::GiveUp,
                }
            } else {
                Backoff::GiveUp
            }
        }
    }
}

/// Transfers `owner` across every per-app entity, then the App row itself;
/// default retry policy, 3 attempts (`tasks.py::downstream_model_owner`).
pub async fn downstream_model_owner(
    store: &dyn EntityStore,
    app_id: &str,
    new_owner: &str,
    attempt: u32,
) -> Result<Backoff> {
    match store.transfer_owner(app_id, new_owner).await {
        Ok(()) => Ok(Backoff::GiveUp),
        Err(_) if attempt < 3 => Ok(Backoff::RetryAfter(jitter(Duration::from_secs(1)))),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retrieve_resource_backoff_switches_after_one_hour() {
        assert_eq!(
            retrieve_resource_backoff(chrono::Duration::minutes(30)),
            Duration::from_secs(30)
        );
        assert_eq!(
            retrieve_resource_backoff(chrono::Duration::hours(2)),
            Duration::from_secs(1800)
        );
    }

    #[test]
    fn measurement_backoff_is_capped() {
        let d = measurement_backoff(20);
        assert!(d <= Duration::from_secs(3600));
    }

    #[test]
    fn jittered_backoff_gives_up_after_three() {
        assert!(jittered_backoff(0).is_some());
        assert!(jittered_backoff(2).is_some());
        assert!(jittered_backoff(3).is_none());
    }
}
