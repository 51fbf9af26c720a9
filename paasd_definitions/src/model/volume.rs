use std::collections::BTreeMap;

use regex::Regex;
use uuid::Uuid;

use crate::{ErrorKind, Result};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VolumeType {
    Csi,
    Nfs,
    Oss,
}

/// Per (App, name) volume declaration. `path` maps ptype -> mount path.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Volume {
    pub id: Uuid,
    pub app_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub vtype: VolumeType,
    /// Size string with K/M/G/T/P unit suffix, e.g. "10G".
    pub size: String,
    /// ptype -> mount path.
    #[serde(default)]
    pub path: BTreeMap<String, String>,
}

fn size_regex() -> Regex {
    Regex::new(r"^(?i)(\d+)([kmgtp])$").expect("static regex")
}

/// Parse a volume size string into bytes, for shrink/expand comparisons.
pub fn parse_size_bytes(size: &str) -> Result<u64> {
    let caps = size_regex()
        .captures(size)
        .ok_or_else(|| ErrorKind::Validation(format!("invalid volume size '{}'", size)))?;
    let qty: u64 = caps[1]
        .parse()
        .map_err(|_| ErrorKind::Validation(format!("invalid volume size '{}'", size)))?;
    let exp = match caps[2].to_ascii_uppercase().as_str() {
        "K" => 1,
        "M" => 2,
        "G" => 3,
        "T" => 4,
        "P" => 5,
        _ => unreachable!("regex restricts to KMGTP"),
    };
    Ok(qty * 1000u64.pow(exp))
}

impl Volume {
    pub fn verify(&self) -> Result<()> {
        parse_size_bytes(&self.size)?;
        Ok(())
    }

    /// Within an App, no two volumes may share `(ptype, path)` (spec.md §3).
    pub fn conflicts_with(&self, other: &Volume) -> bool {
        if self.app_id != other.app_id || self.name == other.name {
            return false;
        }
        self.path
            .iter()
            .any(|(ptype, path)| other.path.get(ptype).map(|p| p == path).unwrap_or(false))
    }

    /// Only `csi` volumes support expand; shrink is never allowed regardless
    /// of type (spec.md §3).
    pub fn validate_resize(&self, new_size: &str) -> Result<()> {
        let old_bytes = parse_size_bytes(&self.size)?;
        let new_bytes = parse_size_bytes(new_size)?;
        if new_bytes < old_bytes {
            return Err(ErrorKind::Drycc("volumes cannot be shrunk".into()).into());
        }
        if new_bytes > old_bytes && self.vtype != VolumeType::Csi {
            return Err(ErrorKind::Drycc(format!(
                "only csi volumes support expand, '{}' is {:?}",
                self.name, self.vtype
            ))
            .into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vol(app: &str, name: &str, ptype: &str, path: &str, vtype: VolumeType) -> Volume {
        let mut m = BTreeMap::new();
        m.insert(ptype.to_string(), path.to_string());
        Volume {
            id: Uuid::new_v4(),
            app_id: app.into(),
            name: name.into(),
            vtype,
            size: "1G".into(),
            path: m,
        }
    }

    #[test]
    fn parses_units() {
        assert_eq!(parse_size_bytes("10G").unwrap(), 10_000_000_000);
        assert_eq!(parse_size_bytes("1T").unwrap(), 1_000_000_000_000);
        assert!(parse_size_bytes("10X").is_err());
    }

    #[test]
    fn detects_path_conflict_within_app() {
        let a = vol("alpha", "data", "web", "/mnt/data", VolumeType::Csi);
        let b = vol("alpha", "logs", "web", "/mnt/data", VolumeType::Csi);
        assert!(a.conflicts_with(&b));
        let c = vol("beta", "logs", "web", "/mnt/data", VolumeType::Csi);
        assert!(!a.conflicts_with(&c)); // different app, no conflict
    }

    #[test]
    fn shrink_always_disallowed_expand_only_csi() {
        let v = vol("alpha", "data", "web", "/mnt", VolumeType::Nfs);
        assert!(v.validate_resize("500M").is_err()); // shrink
        assert!(v.validate_resize("2G").is_err()); // expand on non-csi
        let csi = vol("alpha", "data", "web", "/mnt", VolumeType::Csi);
        assert!(csi.validate_resize("2G").is_ok());
    }
}
