//! Environment-driven numeric knobs (spec.md §4.3, §4.5, §4.8, §4.9).
//!
//! Grounded on `shipcat_definitions::config::ManifestDefaults`'s shape (a
//! plain struct plus a `Default` impl naming every knob); unlike that
//! struct, these values come from environment variables rather than a
//! checked-in manifest file, since this controller has no static config
//! file of its own (spec.md explicitly scopes "static config loading" out).

use std::time::Duration;

use crate::deploy::GlobalDefaults;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_or_string(key: &str, default: String) -> String {
    std::env::var(key).unwrap_or(default)
}

/// Process-wide numeric/string knobs read once at startup. Anything unset
/// or unparsable falls back to `Default::default()`.
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Bounded fan-out width for `TaskRunner` (spec.md §4.3).
    pub task_parallelism: usize,
    /// TTL for the per-app `CacheLock` held around release creation and
    /// deploy-lock acquisition (spec.md §4.2).
    pub app_lock_timeout: Duration,
    /// Per-ptype deploy-plan defaults (spec.md §4.5 table).
    pub deploy: GlobalDefaults,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            task_parallelism: 4,
            app_lock_timeout: Duration::from_secs(30),
            deploy: GlobalDefaults::default(),
        }
    }
}

impl ControllerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        ControllerConfig {
            task_parallelism: env_or("PAASD_TASK_PARALLELISM", defaults.task_parallelism),
            app_lock_timeout: Duration::from_secs(env_or(
                "PAASD_APP_LOCK_TIMEOUT_SECS",
                defaults.app_lock_timeout.as_secs(),
            )),
            deploy: GlobalDefaults {
                dns_policy: env_or_string("PAASD_DNS_POLICY", defaults.deploy.dns_policy),
                deploy_batches: env_or("PAASD_DEPLOY_BATCHES", defaults.deploy.deploy_batches),
                deploy_timeout: env_or("PAASD_DEPLOY_TIMEOUT_SECS", defaults.deploy.deploy_timeout),
                deployment_revision_history_limit: env_or(
                    "PAASD_REVISION_HISTORY_LIMIT",
                    defaults.deploy.deployment_revision_history_limit,
                ),
                pod_termination_grace_period_seconds: env_or(
                    "PAASD_TERMINATION_GRACE_PERIOD_SECS",
                    defaults.deploy.pod_termination_grace_period_seconds,
                ),
                image_pull_policy: env_or_string("PAASD_IMAGE_PULL_POLICY", defaults.deploy.image_pull_policy),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_deploy_global_defaults() {
        let cfg = ControllerConfig::default();
        assert_eq!(cfg.task_parallelism, 4);
        assert_eq!(cfg.deploy.deploy_timeout, 120);
    }

    #[test]
    fn from_env_falls_back_when_unset() {
        std::env::remove_var("PAASD_TASK_PARALLELISM");
        let cfg = ControllerConfig::from_env();
        assert_eq!(cfg.task_parallelism, 4);
    }
}
