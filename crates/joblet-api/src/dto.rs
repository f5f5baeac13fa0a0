//! Wire types and their explicit mappers.
//!
//! Every request is decoded into a fixed struct and converted by hand into
//! the domain types; validation of signs, encodings, and timestamps happens
//! here, before anything reaches the supervisor. Responses never carry
//! secret environment values.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use joblet_core::workflow::{Workflow, WorkflowCounters};
use joblet_core::{
    GpuRequest, Job, JobSpec, NetworkMode, ResourceLimits, Upload,
};

use crate::error::ApiError;

#[derive(Debug, Clone, Deserialize)]
pub struct RunJobRequest {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub max_cpu: i64,
    #[serde(default)]
    pub cpu_cores: Option<String>,
    #[serde(default)]
    pub max_memory: i64,
    #[serde(default)]
    pub max_iobps: i64,
    #[serde(default)]
    pub gpu_count: i64,
    #[serde(default)]
    pub gpu_memory_mb: Option<i64>,
    #[serde(default)]
    pub uploads: Vec<UploadEntry>,
    /// RFC3339, or empty for immediate execution.
    #[serde(default)]
    pub schedule: String,
    #[serde(default)]
    pub network: String,
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub runtime: Option<String>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub secret_environment: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadEntry {
    pub path: String,
    /// Base64 of the file content.
    pub content: String,
}

impl RunJobRequest {
    /// Decode into a job spec and optional schedule time.
    pub fn into_spec(self) -> Result<(JobSpec, Option<DateTime<Utc>>), ApiError> {
        let max_cpu = non_negative("max_cpu", self.max_cpu)?;
        let max_memory = non_negative("max_memory", self.max_memory)?;
        let max_iobps = non_negative("max_iobps", self.max_iobps)?;
        let gpu_count = non_negative("gpu_count", self.gpu_count)?;
        let gpu_memory_mb = self
            .gpu_memory_mb
            .map(|v| non_negative("gpu_memory_mb", v))
            .transpose()?;

        let mut spec = JobSpec::new(self.command);
        spec.args = self.args;
        spec.environment = self.environment;
        spec.secret_environment = self.secret_environment;
        spec.limits = ResourceLimits {
            max_cpu_percent: max_cpu as u32,
            max_memory_mb: max_memory,
            max_io_bps: max_iobps,
            cpu_cores: self.cpu_cores,
            gpu: (gpu_count > 0).then_some(GpuRequest {
                count: gpu_count as u32,
                memory_mb: gpu_memory_mb,
            }),
        };
        spec.network = self
            .network
            .parse::<NetworkMode>()
            .map_err(|e| ApiError::BadRequest(e.to_string()))?;
        spec.volumes = self.volumes;
        spec.runtime = self.runtime;
        spec.uploads = self
            .uploads
            .into_iter()
            .map(|u| {
                BASE64
                    .decode(&u.content)
                    .map(|content| Upload {
                        path: u.path.clone(),
                        content,
                    })
                    .map_err(|_| {
                        ApiError::BadRequest(format!("upload {} is not valid base64", u.path))
                    })
            })
            .collect::<Result<_, _>>()?;

        let schedule = if self.schedule.is_empty() {
            None
        } else {
            Some(
                DateTime::parse_from_rfc3339(&self.schedule)
                    .map_err(|e| ApiError::BadRequest(format!("schedule: {e}")))?
                    .with_timezone(&Utc),
            )
        };
        Ok((spec, schedule))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunJobResponse {
    pub uuid: String,
    pub status: String,
}

/// A job as clients see it. Secret environment values never leave the
/// process.
#[derive(Debug, Clone, Serialize)]
pub struct JobResponse {
    pub uuid: String,
    pub command: String,
    pub args: Vec<String>,
    pub status: String,
    pub environment: HashMap<String, String>,
    pub network: String,
    pub volumes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_job_name: Option<String>,
}

impl From<Job> for JobResponse {
    fn from(job: Job) -> Self {
        Self {
            uuid: job.id.to_string(),
            command: job.spec.command,
            args: job.spec.args,
            status: job.state.to_string(),
            environment: job.spec.environment,
            network: job.spec.network.to_string(),
            volumes: job.spec.volumes,
            runtime: job.spec.runtime,
            created_at: job.created_at,
            scheduled_at: job.scheduled_at,
            started_at: job.started_at,
            ended_at: job.ended_at,
            exit_code: job.exit_code,
            error: job.error,
            workflow_id: job.workflow_id.map(|id| id.to_string()),
            workflow_job_name: job.workflow_job_name,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeleteAllResponse {
    pub deleted_count: usize,
    pub skipped_count: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunWorkflowRequest {
    #[serde(default)]
    pub workflow_name: String,
    pub yaml_content: String,
    #[serde(default)]
    pub workflow_files: Vec<UploadEntry>,
}

impl RunWorkflowRequest {
    pub fn decode_files(&self) -> Result<HashMap<String, Vec<u8>>, ApiError> {
        self.workflow_files
            .iter()
            .map(|f| {
                BASE64
                    .decode(&f.content)
                    .map(|content| (f.path.clone(), content))
                    .map_err(|_| {
                        ApiError::BadRequest(format!("file {} is not valid base64", f.path))
                    })
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowInfoResponse {
    pub workflow_id: String,
    pub name: String,
    pub status: String,
    pub total_jobs: usize,
    pub completed_jobs: usize,
    pub failed_jobs: usize,
    pub cancelled_jobs: usize,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowJobResponse {
    pub name: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_uuid: Option<String>,
    pub requires: Vec<RequirementResponse>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RequirementResponse {
    pub job: String,
    pub status: String,
}

pub fn workflow_info(workflow: &Workflow) -> WorkflowInfoResponse {
    let WorkflowCounters {
        total,
        completed,
        failed,
        cancelled,
    } = workflow.counters;
    WorkflowInfoResponse {
        workflow_id: workflow.id.to_string(),
        name: workflow.name.clone(),
        status: workflow.status.to_string(),
        total_jobs: total,
        completed_jobs: completed,
        failed_jobs: failed,
        cancelled_jobs: cancelled,
        created_at: workflow.created_at,
        started_at: workflow.started_at,
        finished_at: workflow.finished_at,
    }
}

pub fn workflow_jobs(workflow: &Workflow) -> Vec<WorkflowJobResponse> {
    workflow
        .jobs
        .iter()
        .map(|dep| WorkflowJobResponse {
            name: dep.name.clone(),
            status: dep.state.to_string(),
            job_uuid: dep.job_id.map(|id| id.to_string()),
            requires: dep
                .requires
                .iter()
                .map(|req| RequirementResponse {
                    job: req.on.clone(),
                    status: req.status.to_string(),
                })
                .collect(),
        })
        .collect()
}

fn non_negative(field: &str, value: i64) -> Result<u64, ApiError> {
    u64::try_from(value)
        .map_err(|_| ApiError::BadRequest(format!("{field} must not be negative")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use joblet_core::{JobId, JobState};

    fn request() -> RunJobRequest {
        RunJobRequest {
            command: "echo".into(),
            args: vec!["hi".into()],
            max_cpu: 150,
            cpu_cores: None,
            max_memory: 512,
            max_iobps: 0,
            gpu_count: 0,
            gpu_memory_mb: None,
            uploads: Vec::new(),
            schedule: String::new(),
            network: "bridge".into(),
            volumes: Vec::new(),
            runtime: None,
            environment: HashMap::new(),
            secret_environment: HashMap::new(),
        }
    }

    #[test]
    fn request_maps_onto_the_spec() {
        let (spec, schedule) = request().into_spec().unwrap();
        assert_eq!(spec.command, "echo");
        assert_eq!(spec.limits.max_cpu_percent, 150);
        assert_eq!(spec.limits.max_memory_mb, 512);
        assert_eq!(spec.network, NetworkMode::Bridge);
        assert!(schedule.is_none());
    }

    #[test]
    fn negative_resources_are_rejected() {
        let mut bad = request();
        bad.max_memory = -1;
        assert!(bad.into_spec().is_err());
    }

    #[test]
    fn malformed_network_names_are_rejected() {
        let mut bad = request();
        bad.network = "team net/0".into();
        assert!(bad.into_spec().is_err());

        let mut custom = request();
        custom.network = "team0".into();
        let (spec, _) = custom.into_spec().unwrap();
        assert_eq!(spec.network, NetworkMode::Custom("team0".into()));
    }

    #[test]
    fn schedule_parses_rfc3339() {
        let mut req = request();
        req.schedule = "2026-08-01T12:00:00Z".into();
        let (_, schedule) = req.into_spec().unwrap();
        assert!(schedule.is_some());

        let mut bad = request();
        bad.schedule = "tomorrow-ish".into();
        assert!(bad.into_spec().is_err());
    }

    #[test]
    fn uploads_decode_base64() {
        let mut req = request();
        req.uploads = vec![UploadEntry {
            path: "run.sh".into(),
            content: BASE64.encode(b"echo hi\n"),
        }];
        let (spec, _) = req.into_spec().unwrap();
        assert_eq!(spec.uploads[0].content, b"echo hi\n");

        let mut bad = request();
        bad.uploads = vec![UploadEntry {
            path: "run.sh".into(),
            content: "not base64!!".into(),
        }];
        assert!(bad.into_spec().is_err());
    }

    #[test]
    fn job_response_never_carries_secrets() {
        let mut spec = JobSpec::new("echo");
        spec.secret_environment
            .insert("TOKEN".into(), "hunter2".into());
        let mut job = Job::new(JobId::new(), spec);
        job.state = JobState::Running;
        let response = JobResponse::from(job);
        let encoded = serde_json::to_string(&response).unwrap();
        assert!(!encoded.contains("hunter2"));
        assert!(!encoded.contains("TOKEN"));
    }
}
