use std::collections::BTreeMap;

use regex::Regex;

use crate::{ErrorKind, Result};

/// ptype names: `^[a-z0-9]+(-[a-z0-9]+)*$`, 3-63 characters.
fn ptype_regex() -> Regex {
    Regex::new(r"^[a-z0-9]+(-[a-z0-9]+)*$").expect("static regex")
}

pub fn validate_ptype_name(ptype: &str) -> Result<()> {
    if ptype.len() < 3 || ptype.len() > 63 {
        return Err(ErrorKind::Validation(format!(
            "ptype '{}' must be 3-63 characters",
            ptype
        ))
        .into());
    }
    if !ptype_regex().is_match(ptype) {
        return Err(ErrorKind::Validation(format!(
            "ptype '{}' must match ^[a-z0-9]+(-[a-z0-9]+)*$",
            ptype
        ))
        .into());
    }
    Ok(())
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Stack {
    Container,
    #[serde(rename = "heroku-18")]
    Heroku18,
    #[serde(rename = "heroku-20")]
    Heroku20,
}

/// An immutable snapshot of an image reference plus per-ptype launch manifest.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Build {
    pub image: String,
    pub stack: Stack,
    #[serde(default)]
    pub sha: String,
    /// ptype -> command string, Heroku-style Procfile.
    #[serde(default)]
    pub procfile: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dryccfile: Option<DryccFile>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct DryccFile {
    #[serde(default)]
    pub pipeline: Vec<PipelinePtype>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PipelinePtype {
    pub ptype: String,
    #[serde(default)]
    pub build: Option<BuildStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run: Option<RunStep>,
    pub deploy: DeployStep,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct BuildStep {
    #[serde(default)]
    pub docker: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RunStep {
    pub image: String,
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    /// Seconds before the pre-deploy job is considered hung.
    pub timeout: u32,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DeployStep {
    pub image: String,
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Build {
    pub fn verify(&self) -> Result<()> {
        if self.image.trim().is_empty() {
            return Err(ErrorKind::Validation("build image must not be empty".into()).into());
        }
        for (ptype, cmd) in &self.procfile {
            validate_ptype_name(ptype)?;
            if cmd.trim().is_empty() {
                return Err(ErrorKind::Validation(format!(
                    "procfile command for ptype '{}' must not be empty",
                    ptype
                ))
                .into());
            }
        }
        if let Some(df) = &self.dryccfile {
            for p in &df.pipeline {
                validate_ptype_name(&p.ptype)?;
                if p.deploy.image.trim().is_empty() {
                    return Err(ErrorKind::Validation(format!(
                        "dryccfile deploy image for ptype '{}' must not be empty",
                        p.ptype
                    ))
                    .into());
                }
            }
        }
        Ok(())
    }

    /// All ptypes this build declares, from either `procfile` or `dryccfile`.
    pub fn declared_ptypes(&self) -> std::collections::BTreeSet<String> {
        let mut out: std::collections::BTreeSet<String> = self.procfile.keys().cloned().collect();
        if let Some(df) = &self.dryccfile {
            out.extend(df.pipeline.iter().map(|p| p.ptype.clone()));
        }
        out
    }

    fn pipeline_entry(&self, ptype: &str) -> Option<&PipelinePtype> {
        self.dryccfile
            .as_ref()
            .and_then(|df| df.pipeline.iter().find(|p| p.ptype == ptype))
    }

    pub fn deploy_image(&self, ptype: &str) -> Option<String> {
        if let Some(p) = self.pipeline_entry(ptype) {
            return Some(p.deploy.image.clone());
        }
        if self.procfile.contains_key(ptype) {
            return Some(self.image.clone());
        }
        None
    }

    pub fn deploy_command(&self, ptype: &str) -> Option<Vec<String>> {
        if let Some(p) = self.pipeline_entry(ptype) {
            return Some(p.deploy.command.clone());
        }
        self.procfile
            .get(ptype)
            .map(|cmd| shell_words_like_split(cmd))
    }

    pub fn deploy_args(&self, ptype: &str) -> Vec<String> {
        self.pipeline_entry(ptype)
            .map(|p| p.deploy.args.clone())
            .unwrap_or_default()
    }

    pub fn runners(&self, ptypes: &[String]) -> Vec<(String, RunStep)> {
        let mut out = Vec::new();
        if let Some(df) = &self.dryccfile {
            for p in &df.pipeline {
                if ptypes.contains(&p.ptype) {
                    if let Some(run) = &p.run {
                        out.push((p.ptype.clone(), run.clone()));
                    }
                }
            }
        }
        out
    }
}

/// Minimal whitespace tokenizer for Procfile commands (no quoting support -
/// Procfile entries are single shell lines handed to `sh -c` in practice;
/// we split only for the rare caller that wants argv form).
fn shell_words_like_split(s: &str) -> Vec<String> {
    s.split_whitespace().map(|w| w.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_build() -> Build {
        let mut procfile = BTreeMap::new();
        procfile.insert("web".to_string(), "gunicorn app:app".to_string());
        Build {
            image: "autotest/example".into(),
            stack: Stack::Container,
            sha: "abc123".into(),
            procfile,
            dryccfile: None,
        }
    }

    #[test]
    fn resolves_image_and_command_from_procfile() {
        let b = sample_build();
        assert_eq!(b.deploy_image("web"), Some("autotest/example".into()));
        assert_eq!(
            b.deploy_command("web"),
            Some(vec!["gunicorn".to_string(), "app:app".to_string()])
        );
        assert_eq!(b.deploy_image("worker"), None);
    }

    #[test]
    fn dryccfile_deploy_overrides_procfile() {
        let mut b = sample_build();
        b.dryccfile = Some(DryccFile {
            pipeline: vec![PipelinePtype {
                ptype: "web".into(),
                build: None,
                run: Some(RunStep {
                    image: "autotest/example".into(),
                    command: vec!["migrate".into()],
                    args: vec![],
                    timeout: 300,
                }),
                deploy: DeployStep {
                    image: "autotest/example@sha256:deadbeef".into(),
                    command: vec!["gunicorn".into()],
                    args: vec!["app:app".into()],
                },
            }],
        });
        assert_eq!(
            b.deploy_image("web"),
            Some("autotest/example@sha256:deadbeef".into())
        );
        assert_eq!(b.runners(&["web".to_string()]).len(), 1);
    }

    #[test]
    fn rejects_bad_ptype_names() {
        assert!(validate_ptype_name("ab").is_err()); // too short
        assert!(validate_ptype_name("Web").is_err()); // uppercase
        assert!(validate_ptype_name("web-1").is_ok());
    }
}
