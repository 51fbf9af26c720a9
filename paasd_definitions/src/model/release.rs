use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use uuid::Uuid;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReleaseState {
    Created,
    Succeed,
    Crashed,
}

impl ReleaseState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ReleaseState::Succeed | ReleaseState::Crashed)
    }
}

/// One entry in a release's append-only condition log (spec.md §3, Redesign
/// Flag 6). Never removed or reordered - only ever pushed.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Condition {
    pub state: ReleaseState,
    pub action: String,
    pub ptypes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// A monotonically versioned (Build, Config) pair - the only deployable
/// object in the system.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Release {
    pub id: Uuid,
    pub app_id: String,
    pub version: u32,
    pub config_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_id: Option<Uuid>,
    pub state: ReleaseState,
    pub failed: bool,
    #[serde(default)]
    pub deployed_ptypes: BTreeSet<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    pub summary: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl Release {
    pub fn new(
        app_id: impl Into<String>,
        version: u32,
        config_id: Uuid,
        build_id: Option<Uuid>,
        summary: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Release {
            id: Uuid::new_v4(),
            app_id: app_id.into(),
            version,
            config_id,
            build_id,
            state: ReleaseState::Created,
            failed: false,
            deployed_ptypes: BTreeSet::new(),
            conditions: Vec::new(),
            summary: summary.into(),
            created: now,
            updated: now,
        }
    }

    pub fn has_build(&self) -> bool {
        self.build_id.is_some()
    }

    pub fn add_condition(&mut self, state: ReleaseState, action: impl Into<String>, ptypes: Vec<String>, exception: Option<String>) {
        self.conditions.push(Condition {
            state,
            action: action.into(),
            ptypes,
            exception,
            timestamp: Utc::now(),
        });
        self.updated = Utc::now();
    }

    /// Remove ptypes from `deployed_ptypes` that the build no longer declares.
    pub fn clean(&mut self, declared: &BTreeSet<String>) {
        self.deployed_ptypes.retain(|p| declared.contains(p));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn condition_log_is_append_only_and_ordered() {
        let mut r = Release::new("alpha", 1, Uuid::new_v4(), None, "initial deploy");
        r.add_condition(ReleaseState::Created, "deploy", vec!["web".into()], None);
        r.add_condition(ReleaseState::Succeed, "deploy", vec!["web".into()], None);
        assert_eq!(r.conditions.len(), 2);
        assert_eq!(r.conditions[0].state, ReleaseState::Created);
        assert_eq!(r.conditions[1].state, ReleaseState::Succeed);
    }

    #[test]
    fn clean_drops_undeclared_ptypes() {
        let mut r = Release::new("alpha", 2, Uuid::new_v4(), None, "");
        r.deployed_ptypes.insert("web".into());
        r.deployed_ptypes.insert("worker".into());
        let declared: BTreeSet<String> = ["web".to_string()].into_iter().collect();
        r.clean(&declared);
        assert_eq!(r.deployed_ptypes.len(), 1);
        assert!(r.deployed_ptypes.contains("web"));
    }
}
