use std::collections::BTreeMap;

/// Immutable catalog entry describing pod resources and scheduling knobs.
/// Selected by `Config.limits[ptype]`.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct LimitPlan {
    pub name: String,
    /// Resource name (cpu, memory, ...) -> quantity string.
    #[serde(default)]
    pub limits: BTreeMap<String, String>,
    #[serde(default)]
    pub requests: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_class_name: Option<String>,
    #[serde(default)]
    pub pod_volumes: Vec<PodVolume>,
    #[serde(default)]
    pub container_volume_mounts: Vec<VolumeMount>,
    #[serde(default)]
    pub pod_security_context: SecurityContext,
    #[serde(default)]
    pub container_security_context: SecurityContext,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct PodVolume {
    pub name: String,
    pub kind: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct VolumeMount {
    pub name: String,
    pub mount_path: String,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct SecurityContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_as_non_root: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_as_user: Option<i64>,
    #[serde(default)]
    pub read_only_root_filesystem: bool,
}

impl LimitPlan {
    /// The built-in default plan seeded for a new App's `web`/`run` ptypes
    /// (spec.md §4.6 "create").
    pub fn default_plan() -> Self {
        let mut limits = BTreeMap::new();
        limits.insert("cpu".to_string(), "1".to_string());
        limits.insert("memory".to_string(), "512Mi".to_string());
        let mut requests = BTreeMap::new();
        requests.insert("cpu".to_string(), "100m".to_string());
        requests.insert("memory".to_string(), "128Mi".to_string());
        LimitPlan {
            name: "std1.small".to_string(),
            limits,
            requests,
            ..Default::default()
        }
    }
}
