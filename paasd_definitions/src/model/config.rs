use std::collections::BTreeMap;

use uuid::Uuid;

use crate::{ErrorKind, Result};

/// A single named environment value, scoped to `global` or to a specific
/// ptype via `group`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ConfigValue {
    pub value: String,
    #[serde(default = "default_group")]
    pub group: String,
}

fn default_group() -> String {
    "global".to_string()
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct RegistryEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub username: String,
    pub password: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct Probe {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u32,
    #[serde(default = "default_initial_delay_seconds")]
    pub initial_delay_seconds: u32,
    #[serde(default = "default_period_seconds")]
    pub period_seconds: u32,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}
fn default_timeout_seconds() -> u32 {
    50
}
fn default_initial_delay_seconds() -> u32 {
    50
}
fn default_period_seconds() -> u32 {
    10
}
fn default_success_threshold() -> u32 {
    1
}
fn default_failure_threshold() -> u32 {
    3
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct HealthcheckEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub liveness_probe: Option<Probe>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness_probe: Option<Probe>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct LifecycleHook {
    pub command: Vec<String>,
}

/// Append-only, per-app configuration record. Every save merges against the
/// previous latest config (spec.md §3 "Invariant"), never overwrites it.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Config {
    pub id: Uuid,
    pub app_id: String,
    pub owner: String,
    #[serde(default)]
    pub values: BTreeMap<String, ConfigValue>,
    /// ptype -> LimitPlan name/id.
    #[serde(default)]
    pub limits: BTreeMap<String, String>,
    #[serde(default)]
    pub registry: BTreeMap<String, RegistryEntry>,
    #[serde(default)]
    pub healthcheck: BTreeMap<String, HealthcheckEntry>,
    #[serde(default)]
    pub tags: BTreeMap<String, BTreeMap<String, String>>,
    #[serde(default)]
    pub lifecycle_post_start: BTreeMap<String, LifecycleHook>,
    #[serde(default)]
    pub lifecycle_pre_stop: BTreeMap<String, LifecycleHook>,
    #[serde(default)]
    pub termination_grace_period: BTreeMap<String, u32>,
}

/// A patch value for a mergeable map attribute: `Some` sets/overwrites the
/// key, `None` requests the key be unset.
pub type Patch<V> = BTreeMap<String, Option<V>>;

/// Explicit per-attribute merge table (Redesign Flag 1, spec.md §9): rather
/// than reflecting over struct fields, every mergeable attribute is listed
/// here and merged with the same generic helper.
#[derive(Default)]
pub struct ConfigPatch {
    pub values: Patch<ConfigValue>,
    pub limits: Patch<String>,
    pub registry: Patch<RegistryEntry>,
    pub healthcheck: Patch<HealthcheckEntry>,
    pub tags: Patch<BTreeMap<String, String>>,
    pub lifecycle_post_start: Patch<LifecycleHook>,
    pub lifecycle_pre_stop: Patch<LifecycleHook>,
    pub termination_grace_period: Patch<u32>,
}

/// Merge `patch` into `data`: `Some(v)` sets/overwrites `key`, `None` removes
/// `key` if present or fails with `Unprocessable` if `key` was never set.
/// This single helper backs every mergeable attribute - see `ConfigPatch`.
fn merge_map<V: Clone>(attr: &str, data: &mut BTreeMap<String, V>, patch: Patch<V>) -> Result<()> {
    for (key, value) in patch {
        match value {
            Some(v) => {
                data.insert(key, v);
            }
            None => {
                if data.remove(&key).is_none() {
                    return Err(ErrorKind::Unprocessable(format!(
                        "{} does not exist under {}",
                        key, attr
                    ))
                    .into());
                }
            }
        }
    }
    Ok(())
}

impl Config {
    pub fn new(app_id: impl Into<String>, owner: impl Into<String>) -> Self {
        Config {
            id: Uuid::new_v4(),
            app_id: app_id.into(),
            owner: owner.into(),
            ..Default::default()
        }
    }

    /// Merge `patch` onto a clone of `previous`, producing the next Config
    /// revision. Never mutates `previous`. This is the only way a Config's
    /// maps ever change - each save is a merge over the latest non-failed
    /// release's config (spec.md §5 "Ordering guarantees").
    pub fn merged_from(previous: &Config, patch: ConfigPatch) -> Result<Config> {
        let mut next = previous.clone();
        next.id = Uuid::new_v4();
        merge_map("values", &mut next.values, patch.values)?;
        merge_map("limits", &mut next.limits, patch.limits)?;
        merge_map("registry", &mut next.registry, patch.registry)?;
        merge_map("healthcheck", &mut next.healthcheck, patch.healthcheck)?;
        merge_map("tags", &mut next.tags, patch.tags)?;
        merge_map(
            "lifecycle_post_start",
            &mut next.lifecycle_post_start,
            patch.lifecycle_post_start,
        )?;
        merge_map(
            "lifecycle_pre_stop",
            &mut next.lifecycle_pre_stop,
            patch.lifecycle_pre_stop,
        )?;
        merge_map(
            "termination_grace_period",
            &mut next.termination_grace_period,
            patch.termination_grace_period,
        )?;
        next.migrate_legacy_healthcheck();
        next.verify()?;
        Ok(next)
    }

    /// Folds the legacy `HEALTHCHECK_URL`/`HEALTHCHECK_TIMEOUT`/...
    /// env-var-encoded healthcheck into the structured `healthcheck` map
    /// under `web/cmd`, then drops the `HEALTHCHECK_*` keys from `values`.
    /// A no-op unless `HEALTHCHECK_URL` is present, matching the source
    /// this migrates from exactly.
    pub fn migrate_legacy_healthcheck(&mut self) {
        if !self.values.contains_key("HEALTHCHECK_URL") {
            return;
        }
        let get = |key: &str, default: u32| -> u32 {
            self.values
                .get(key)
                .and_then(|v| v.value.parse().ok())
                .unwrap_or(default)
        };
        let probe = Probe {
            path: Some(self.values["HEALTHCHECK_URL"].value.clone()),
            timeout_seconds: get("HEALTHCHECK_TIMEOUT", 50),
            initial_delay_seconds: get("HEALTHCHECK_INITIAL_DELAY", 50),
            period_seconds: get("HEALTHCHECK_PERIOD_SECONDS", 10),
            success_threshold: get("HEALTHCHECK_SUCCESS_THRESHOLD", 1),
            failure_threshold: get("HEALTHCHECK_FAILURE_THRESHOLD", 3),
        };
        self.healthcheck.insert(
            "web/cmd".to_string(),
            HealthcheckEntry {
                liveness_probe: Some(probe.clone()),
                readiness_probe: Some(probe),
            },
        );
        self.values.retain(|k, _| !k.starts_with("HEALTHCHECK_"));
    }

    pub fn verify(&self) -> Result<()> {
        for entry in self.registry.values() {
            if entry.username.trim().is_empty() {
                return Err(ErrorKind::Validation("registry username must not be empty".into()).into());
            }
        }
        Ok(())
    }

    /// Values whose `group` is `global` or matches `ptype` (spec.md §4.7).
    pub fn values_for_ptype<'a>(&'a self, ptype: &str) -> impl Iterator<Item = (&'a str, &'a str)> {
        self.values.iter().filter_map(move |(k, v)| {
            if v.group == "global" || v.group == ptype {
                Some((k.as_str(), v.value.as_str()))
            } else {
                None
            }
        })
    }

    pub fn port_for_ptype(&self, ptype: &str) -> Option<u16> {
        self.values_for_ptype(ptype)
            .find(|(k, _)| *k == "PORT")
            .and_then(|(_, v)| v.parse().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(v: &str) -> ConfigValue {
        ConfigValue {
            value: v.to_string(),
            group: "global".to_string(),
        }
    }

    #[test]
    fn merge_sets_and_unsets() {
        let prev = Config::new("alpha", "user1");
        let mut patch = ConfigPatch::default();
        patch.values.insert("X".into(), Some(value("1")));
        let merged = Config::merged_from(&prev, patch).unwrap();
        assert_eq!(merged.values.get("X").unwrap().value, "1");

        // unset a missing key fails with Unprocessable
        let mut bad_patch = ConfigPatch::default();
        bad_patch.values.insert("Y".into(), None);
        let err = Config::merged_from(&merged, bad_patch).unwrap_err();
        assert!(format!("{}", err).contains("does not exist under values"));

        // unset an existing key succeeds
        let mut unset_patch = ConfigPatch::default();
        unset_patch.values.insert("X".into(), None);
        let unset = Config::merged_from(&merged, unset_patch).unwrap();
        assert!(!unset.values.contains_key("X"));
    }

    #[test]
    fn collision_new_value_wins() {
        let mut prev = Config::new("alpha", "user1");
        prev.values.insert("X".into(), value("old"));
        let mut patch = ConfigPatch::default();
        patch.values.insert("X".into(), Some(value("new")));
        let merged = Config::merged_from(&prev, patch).unwrap();
        assert_eq!(merged.values.get("X").unwrap().value, "new");
    }

    #[test]
    fn values_for_ptype_filters_by_group() {
        let mut cfg = Config::new("alpha", "user1");
        cfg.values.insert(
            "GLOBAL_VAR".into(),
            ConfigValue {
                value: "g".into(),
                group: "global".into(),
            },
        );
        cfg.values.insert(
            "WEB_VAR".into(),
            ConfigValue {
                value: "w".into(),
                group: "web".into(),
            },
        );
        cfg.values.insert(
            "WORKER_VAR".into(),
            ConfigValue {
                value: "wk".into(),
                group: "worker".into(),
            },
        );
        let web: Vec<_> = cfg.values_for_ptype("web").map(|(k, _)| k).collect();
        assert!(web.contains(&"GLOBAL_VAR"));
        assert!(web.contains(&"WEB_VAR"));
        assert!(!web.contains(&"WORKER_VAR"));
    }

    #[test]
    fn legacy_healthcheck_migrates_into_structured_probes() {
        let mut cfg = Config::new("alpha", "user1");
        cfg.values.insert("HEALTHCHECK_URL".into(), value("/healthz"));
        cfg.values.insert("HEALTHCHECK_TIMEOUT".into(), value("5"));
        cfg.migrate_legacy_healthcheck();
        assert!(!cfg.values.contains_key("HEALTHCHECK_URL"));
        assert!(!cfg.values.contains_key("HEALTHCHECK_TIMEOUT"));
        let entry = cfg.healthcheck.get("web/cmd").unwrap();
        let liveness = entry.liveness_probe.as_ref().unwrap();
        assert_eq!(liveness.path.as_deref(), Some("/healthz"));
        assert_eq!(liveness.timeout_seconds, 5);
    }

    #[test]
    fn migrate_legacy_healthcheck_is_noop_without_url() {
        let mut cfg = Config::new("alpha", "user1");
        cfg.values.insert("SOME_VAR".into(), value("x"));
        cfg.migrate_legacy_healthcheck();
        assert!(cfg.healthcheck.is_empty());
        assert!(cfg.values.contains_key("SOME_VAR"));
    }
}
