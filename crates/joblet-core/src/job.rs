//! Job entity and state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::id::{JobId, WorkflowId};
use crate::network::NetworkMode;
use crate::resources::ResourceLimits;

/// Lifecycle state of a job. The wire form is the SCREAMING_SNAKE name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Pending,
    Scheduled,
    Initializing,
    Running,
    Stopping,
    Completed,
    Failed,
    Stopped,
    Cancelled,
}

impl Default for JobState {
    fn default() -> Self {
        JobState::Pending
    }
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Stopped | JobState::Cancelled
        )
    }

    /// Whether the state machine permits moving from `self` to `to`.
    ///
    /// Terminal states are immutable. A job that was asked to stop may still
    /// finish on its own, so STOPPING admits every terminal outcome.
    pub fn can_transition_to(&self, to: JobState) -> bool {
        use JobState::*;
        match self {
            Scheduled => matches!(to, Pending | Failed | Stopped | Cancelled),
            Pending => matches!(to, Initializing | Failed | Stopped | Cancelled),
            Initializing => matches!(to, Running | Stopping | Failed | Stopped),
            Running => matches!(to, Stopping | Completed | Failed | Stopped),
            Stopping => matches!(to, Completed | Failed | Stopped),
            Completed | Failed | Stopped | Cancelled => false,
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Pending => "PENDING",
            JobState::Scheduled => "SCHEDULED",
            JobState::Initializing => "INITIALIZING",
            JobState::Running => "RUNNING",
            JobState::Stopping => "STOPPING",
            JobState::Completed => "COMPLETED",
            JobState::Failed => "FAILED",
            JobState::Stopped => "STOPPED",
            JobState::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for JobState {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "PENDING" => Ok(JobState::Pending),
            "SCHEDULED" => Ok(JobState::Scheduled),
            "INITIALIZING" => Ok(JobState::Initializing),
            "RUNNING" => Ok(JobState::Running),
            "STOPPING" => Ok(JobState::Stopping),
            "COMPLETED" => Ok(JobState::Completed),
            "FAILED" => Ok(JobState::Failed),
            "STOPPED" => Ok(JobState::Stopped),
            "CANCELLED" => Ok(JobState::Cancelled),
            other => Err(crate::Error::InvalidArgument(format!(
                "unknown job state: {other}"
            ))),
        }
    }
}

/// A file shipped with the job and staged under `/uploads` inside its root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Upload {
    /// Path relative to the upload staging directory.
    pub path: String,
    /// Raw file content.
    pub content: Vec<u8>,
}

impl Upload {
    pub fn size(&self) -> u64 {
        self.content.len() as u64
    }
}

/// Everything needed to launch a job. This is what the supervisor serializes
/// onto the pipe for the isolated-init process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Regular environment, visible in listings and logs.
    #[serde(default)]
    pub environment: HashMap<String, String>,
    /// Secret environment. Merged into the child environment but never logged
    /// or echoed back by any API.
    #[serde(default)]
    pub secret_environment: HashMap<String, String>,
    #[serde(default)]
    pub uploads: Vec<Upload>,
    #[serde(default)]
    pub limits: ResourceLimits,
    #[serde(default)]
    pub network: NetworkMode,
    #[serde(default)]
    pub volumes: Vec<String>,
    /// Runtime spec string, resolved against the runtimes root before spawn.
    pub runtime: Option<String>,
    pub working_dir: Option<String>,
}

impl JobSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            environment: HashMap::new(),
            secret_environment: HashMap::new(),
            uploads: Vec::new(),
            limits: ResourceLimits::default(),
            network: NetworkMode::default(),
            volumes: Vec::new(),
            runtime: None,
            working_dir: None,
        }
    }

    /// The merged child environment. Secrets override regular values on key
    /// collision.
    pub fn merged_environment(&self) -> HashMap<String, String> {
        let mut merged = self.environment.clone();
        merged.extend(self.secret_environment.clone());
        merged
    }
}

/// The central job record. Owned exclusively by the store; readers get clones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub spec: JobSpec,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    /// Wall-clock time a SCHEDULED job becomes eligible to run.
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Exit code of the user command. Signal deaths are 128 + signo; a
    /// pre-exec failure inside the init process is 255.
    pub exit_code: Option<i32>,
    /// Human-readable failure cause for non-zero terminations.
    pub error: Option<String>,
    /// PID of the namespace init process while the job is alive.
    pub pid: Option<i32>,
    /// Set when this job was dispatched by a workflow.
    pub workflow_id: Option<WorkflowId>,
    /// The job's internal name within its workflow.
    pub workflow_job_name: Option<String>,
}

impl Job {
    pub fn new(id: JobId, spec: JobSpec) -> Self {
        Self {
            id,
            spec,
            state: JobState::Pending,
            created_at: Utc::now(),
            scheduled_at: None,
            started_at: None,
            ended_at: None,
            exit_code: None,
            error: None,
            pid: None,
            workflow_id: None,
            workflow_job_name: None,
        }
    }
}
