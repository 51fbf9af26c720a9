use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use regex::Regex;
use uuid::Uuid;

use super::{RESERVED_APP_IDS, RESERVED_PTYPE_RUN};
use crate::{ErrorKind, Result};

/// A user-declared application. Maps 1-1 to a cluster namespace.
///
/// `id` is immutable once set: it is either chosen by the caller at create
/// time or auto-generated (two random lowercase groups, spec.md §4.6).
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct App {
    pub id: String,
    pub owner: String,
    /// ptype -> desired replica count.
    #[serde(default)]
    pub structure: BTreeMap<String, u32>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

fn id_regex() -> Regex {
    Regex::new(r"^[a-z][a-z0-9-]{2,61}$").expect("static regex")
}

impl App {
    pub fn new(id: impl Into<String>, owner: impl Into<String>) -> Result<Self> {
        let id = id.into();
        Self::validate_id(&id)?;
        let now = Utc::now();
        Ok(App {
            id,
            owner: owner.into(),
            structure: BTreeMap::new(),
            created: now,
            updated: now,
        })
    }

    /// `id`: 1 starting alpha, 3-62 of `[a-z0-9-]`, not ending in `-`, not reserved.
    pub fn validate_id(id: &str) -> Result<()> {
        if !id_regex().is_match(id) {
            return Err(ErrorKind::Validation(format!(
                "app id '{}' must start with a letter and contain only lowercase \
                 alphanumerics and hyphens, 3-62 characters",
                id
            ))
            .into());
        }
        if id.ends_with('-') {
            return Err(ErrorKind::Validation(format!("app id '{}' cannot end in '-'", id)).into());
        }
        if RESERVED_APP_IDS.contains(&id) {
            return Err(ErrorKind::Validation(format!("app id '{}' is reserved", id)).into());
        }
        Ok(())
    }

    /// Validate a candidate `structure` (scale request): all ptypes match
    /// the Build ptype naming rule, all counts are representable, and the
    /// reserved `run` ptype can never be scaled.
    pub fn validate_structure(structure: &BTreeMap<String, u32>) -> Result<()> {
        for ptype in structure.keys() {
            if ptype == RESERVED_PTYPE_RUN {
                return Err(ErrorKind::Drycc(format!(
                    "ptype '{}' is reserved for one-off runs and cannot be scaled",
                    RESERVED_PTYPE_RUN
                ))
                .into());
            }
            super::build::validate_ptype_name(ptype)?;
        }
        Ok(())
    }

    pub fn generate_id(mut taken: impl FnMut(&str) -> bool) -> String {
        loop {
            let candidate = format!("{}-{}", random_lowercase(6), random_lowercase(8));
            if !taken(&candidate) {
                return candidate;
            }
        }
    }
}

/// Random lowercase+digit string, used for id/pod-name suffixes (spec.md
/// §4.6 "run").
pub fn random_lowercase(len: usize) -> String {
    use rand::Rng;
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| ALPHABET[rng.gen_range(0, ALPHABET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_well_formed_ids() {
        assert!(App::validate_id("alpha").is_ok());
        assert!(App::validate_id("a1-bcd").is_ok());
    }

    #[test]
    fn rejects_bad_ids() {
        assert!(App::validate_id("1alpha").is_err()); // must start alpha
        assert!(App::validate_id("ab").is_err()); // too short
        assert!(App::validate_id("alpha-").is_err()); // trailing hyphen
        assert!(App::validate_id("Alpha").is_err()); // uppercase
        assert!(App::validate_id("deis").is_err()); // reserved
    }

    #[test]
    fn rejects_run_in_structure() {
        let mut structure = BTreeMap::new();
        structure.insert("run".to_string(), 1);
        assert!(App::validate_structure(&structure).is_err());
    }

    #[test]
    fn generate_id_avoids_collisions() {
        let mut seen = std::collections::HashSet::new();
        seen.insert("aaaaaa-bbbbbbbb".to_string());
        let mut calls = 0;
        let id = App::generate_id(|c| {
            calls += 1;
            seen.contains(c)
        });
        assert!(!seen.contains(&id));
    }
}
