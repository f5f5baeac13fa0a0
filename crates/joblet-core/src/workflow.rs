//! Workflow and dependency records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{JobId, WorkflowId};
use crate::job::JobState;

/// Overall workflow status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Stopped
        )
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkflowStatus::Queued => "QUEUED",
            WorkflowStatus::Running => "RUNNING",
            WorkflowStatus::Completed => "COMPLETED",
            WorkflowStatus::Failed => "FAILED",
            WorkflowStatus::Stopped => "STOPPED",
        };
        f.write_str(s)
    }
}

/// One edge of the dependency graph: the named predecessor must reach
/// `status` before the dependent becomes ready.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    pub on: String,
    pub status: JobState,
}

/// Per-job dependency record inside a workflow. Tracks the internal name,
/// its requirements, its current state, and (once dispatched) the child job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDependency {
    /// Internal name within the workflow YAML.
    pub name: String,
    pub requires: Vec<Requirement>,
    pub state: JobState,
    /// The dispatched job's UUID; None until the engine starts it.
    pub job_id: Option<JobId>,
}

impl JobDependency {
    pub fn new(name: impl Into<String>, requires: Vec<Requirement>) -> Self {
        Self {
            name: name.into(),
            requires,
            state: JobState::Pending,
            job_id: None,
        }
    }
}

/// Aggregate counters reported with a workflow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowCounters {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// The workflow record. Holds job UUIDs only; jobs point back with an
/// optional workflow UUID, and neither owns the other.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    pub name: String,
    pub status: WorkflowStatus,
    pub counters: WorkflowCounters,
    pub jobs: Vec<JobDependency>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Workflow {
    pub fn new(name: impl Into<String>, jobs: Vec<JobDependency>) -> Self {
        let counters = WorkflowCounters {
            total: jobs.len(),
            ..Default::default()
        };
        Self {
            id: WorkflowId::new(),
            name: name.into(),
            status: WorkflowStatus::Queued,
            counters,
            jobs,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }
}
