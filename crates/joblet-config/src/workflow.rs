//! Workflow YAML schema.
//!
//! ```yaml
//! name: nightly-build
//! environment: { REGION: us-east-1 }
//! secret_environment: { TOKEN: hunter2 }
//! jobs:
//!   build:
//!     command: make
//!     args: [all]
//!     resources: { max_cpu: 200, max_memory: 2048 }
//!   test:
//!     command: make
//!     args: [test]
//!     requires:
//!       - build: COMPLETED
//! ```
//!
//! Graph validation (undefined references, cycles) happens in the workflow
//! engine; this module only decodes and normalizes the file.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use joblet_core::JobState;

use crate::{ConfigError, ConfigResult};

/// A parsed workflow file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowFile {
    pub name: String,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub secret_environment: HashMap<String, String>,
    pub jobs: HashMap<String, JobEntry>,
}

/// One named job inside a workflow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobEntry {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub resources: ResourceEntry,
    #[serde(default)]
    pub uploads: UploadEntry,
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub runtime: Option<String>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub secret_environment: HashMap<String, String>,
    #[serde(default)]
    pub requires: Vec<RequireEntry>,
}

/// Resource limits as written in YAML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceEntry {
    #[serde(default)]
    pub max_cpu: u32,
    #[serde(default)]
    pub max_memory: u64,
    #[serde(default)]
    pub max_iobps: u64,
    #[serde(default)]
    pub cpu_cores: Option<String>,
    #[serde(default)]
    pub gpu_count: u32,
    #[serde(default)]
    pub gpu_memory_mb: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadEntry {
    #[serde(default)]
    pub files: Vec<String>,
}

/// A dependency declaration. `- build` is shorthand for
/// `- build: COMPLETED`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequireEntry {
    Bare(String),
    WithStatus(HashMap<String, String>),
}

impl RequireEntry {
    /// Normalize into `(predecessor, required state)` pairs.
    pub fn resolve(&self) -> ConfigResult<Vec<(String, JobState)>> {
        match self {
            RequireEntry::Bare(name) => Ok(vec![(name.clone(), JobState::Completed)]),
            RequireEntry::WithStatus(map) => {
                let mut pairs = Vec::with_capacity(map.len());
                for (name, status) in map {
                    let state =
                        status
                            .parse::<JobState>()
                            .map_err(|_| ConfigError::InvalidValue {
                                field: format!("requires.{name}"),
                                message: format!("unknown status {status}"),
                            })?;
                    pairs.push((name.clone(), state));
                }
                pairs.sort_by(|a, b| a.0.cmp(&b.0));
                Ok(pairs)
            }
        }
    }
}

impl WorkflowFile {
    /// Decode and sanity-check a workflow document.
    pub fn from_yaml(text: &str) -> ConfigResult<Self> {
        let file: WorkflowFile = serde_yaml::from_str(text)?;
        if file.name.trim().is_empty() {
            return Err(ConfigError::MissingField("name".into()));
        }
        if file.jobs.is_empty() {
            return Err(ConfigError::MissingField("jobs".into()));
        }
        for (name, job) in &file.jobs {
            if job.command.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: format!("jobs.{name}.command"),
                    message: "must not be empty".into(),
                });
            }
        }
        Ok(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FAN_OUT: &str = r#"
name: fan-out
environment:
  REGION: us-east-1
jobs:
  a:
    command: echo
    args: [a]
  b:
    command: echo
    args: [b]
    requires:
      - a: COMPLETED
  c:
    command: echo
    args: [c]
    requires:
      - a
  d:
    command: echo
    args: [d]
    requires:
      - b: COMPLETED
      - c: COMPLETED
"#;

    #[test]
    fn parses_fan_out_graph() {
        let file = WorkflowFile::from_yaml(FAN_OUT).unwrap();
        assert_eq!(file.name, "fan-out");
        assert_eq!(file.jobs.len(), 4);
        assert_eq!(
            file.environment.get("REGION").map(String::as_str),
            Some("us-east-1")
        );
    }

    #[test]
    fn bare_require_defaults_to_completed() {
        let file = WorkflowFile::from_yaml(FAN_OUT).unwrap();
        let pairs = file.jobs["c"].requires[0].resolve().unwrap();
        assert_eq!(pairs, vec![("a".to_string(), JobState::Completed)]);
    }

    #[test]
    fn explicit_status_is_honored() {
        let entry = RequireEntry::WithStatus(HashMap::from([(
            "cleanup".to_string(),
            "FAILED".to_string(),
        )]));
        let pairs = entry.resolve().unwrap();
        assert_eq!(pairs, vec![("cleanup".to_string(), JobState::Failed)]);
    }

    #[test]
    fn unknown_status_is_rejected() {
        let entry = RequireEntry::WithStatus(HashMap::from([(
            "a".to_string(),
            "DONE".to_string(),
        )]));
        assert!(entry.resolve().is_err());
    }

    #[test]
    fn empty_command_is_rejected() {
        let err = WorkflowFile::from_yaml("name: x\njobs:\n  a:\n    command: \"\"\n").unwrap_err();
        assert!(err.to_string().contains("command"));
    }

    #[test]
    fn missing_jobs_is_rejected() {
        assert!(WorkflowFile::from_yaml("name: x\njobs: {}\n").is_err());
    }
}
