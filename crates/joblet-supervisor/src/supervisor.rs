//! The job supervisor: accept, spawn, watch, finish.

use std::io::Read as _;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use joblet_config::JobletConfig;
use joblet_core::{
    Error, Job, JobId, JobSpec, JobState, NetworkMode, Result, RuntimeSpec, WorkflowId,
};
use joblet_executor::cgroup::{CgroupHandle, CgroupManager};
use joblet_executor::gpu::GpuManager;
use joblet_executor::plan::NetworkPlan;
use joblet_executor::spawn::{JobSpawner, SpawnedJob};
use joblet_logs::{LogHub, LogProducer, MetricsCollector, MetricsHub};
use joblet_platform::{Platform, decode_exec_result};
use joblet_store::{JobStore, Transition};

use crate::metrics_source::CgroupSampleSource;

/// What `StartJob` hands back: the registered record. For immediate jobs
/// the cgroup exists and the child holds its plan by the time this returns;
/// scheduled jobs are parked untouched.
#[derive(Debug, Clone)]
pub struct StartOutcome {
    pub job: Job,
}

struct Inner {
    platform: Arc<dyn Platform>,
    config: JobletConfig,
    store: Arc<JobStore>,
    spawner: Arc<JobSpawner>,
    cgroups: Arc<CgroupManager>,
    gpus: Arc<GpuManager>,
    log_hub: Arc<LogHub>,
    metrics_hub: Arc<MetricsHub>,
}

/// Cheap handle; clones share one supervisor.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        platform: Arc<dyn Platform>,
        config: JobletConfig,
        store: Arc<JobStore>,
        spawner: Arc<JobSpawner>,
        cgroups: Arc<CgroupManager>,
        gpus: Arc<GpuManager>,
        log_hub: Arc<LogHub>,
        metrics_hub: Arc<MetricsHub>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                platform,
                config,
                store,
                spawner,
                cgroups,
                gpus,
                log_hub,
                metrics_hub,
            }),
        }
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.inner.store
    }

    pub fn log_hub(&self) -> &Arc<LogHub> {
        &self.inner.log_hub
    }

    pub fn metrics_hub(&self) -> &Arc<MetricsHub> {
        &self.inner.metrics_hub
    }

    pub fn config(&self) -> &JobletConfig {
        &self.inner.config
    }

    /// Accept a job. Scheduled jobs are registered and parked; everything
    /// else runs cgroup setup and the spawn handshake before returning, so
    /// `ResourceExhausted` and `Internal` failures land on the caller. Only
    /// the wait/drain/cleanup phase continues in the background.
    pub async fn start_job(
        &self,
        spec: JobSpec,
        schedule: Option<DateTime<Utc>>,
        workflow: Option<(WorkflowId, String)>,
    ) -> Result<StartOutcome> {
        validate_spec(&spec, &self.inner.config)?;

        let mut job = Job::new(JobId::new(), spec);
        if let Some((workflow_id, name)) = workflow {
            job.workflow_id = Some(workflow_id);
            job.workflow_job_name = Some(name);
        }

        if let Some(at) = schedule {
            if at > Utc::now() {
                job.state = JobState::Scheduled;
                job.scheduled_at = Some(at);
                self.inner.store.register(job.clone())?;
                info!(job_id = %job.id, at = %at, "Job scheduled");
                return Ok(StartOutcome { job });
            }
        }

        self.inner.store.register(job.clone())?;
        let job = self.begin(job).await?;
        Ok(StartOutcome { job })
    }

    /// Promote a SCHEDULED job whose wall-clock has arrived. Driven by the
    /// timer loop in [`crate::scheduler`].
    pub async fn execute_scheduled_job(&self, id: &JobId) -> Result<()> {
        let job = self
            .inner
            .store
            .transition(id, Transition::to(JobState::Pending))?;
        info!(job_id = %id, "Scheduled job promoted");
        self.begin(job).await?;
        Ok(())
    }

    /// Stop a job. Idempotent on anything already terminal; cancels a
    /// SCHEDULED job; otherwise runs the graduated signal sequence.
    pub async fn stop_job(&self, id: &JobId) -> Result<()> {
        let job = self.inner.store.job(id)?;
        match job.state {
            state if state.is_terminal() => Ok(()),
            JobState::Stopping => Ok(()),
            JobState::Scheduled | JobState::Pending => {
                // Nothing is running yet; the spawn path backs off when it
                // finds the record already stopped.
                match self
                    .inner
                    .store
                    .transition(id, Transition::to(JobState::Stopped))
                {
                    Ok(_) => Ok(()),
                    // Lost the race with the spawn path; retry against the
                    // new state.
                    Err(Error::Precondition(_)) => Box::pin(self.stop_job(id)).await,
                    Err(err) => Err(err),
                }
            }
            JobState::Initializing | JobState::Running => {
                if let Err(Error::Precondition(_)) = self
                    .inner
                    .store
                    .transition(id, Transition::to(JobState::Stopping))
                {
                    // Already finished on its own.
                    return Ok(());
                }
                let pid = self.inner.store.job(id)?.pid;
                if let Some(pid) = pid {
                    self.inner.spawner.stop(id, pid).await?;
                }
                Ok(())
            }
            JobState::Completed | JobState::Failed | JobState::Stopped | JobState::Cancelled => {
                Ok(())
            }
        }
    }

    /// Delete a terminal job along with its log and metrics files.
    pub fn delete_job(&self, id: &JobId) -> Result<()> {
        let job = self.inner.store.delete(id)?;
        self.remove_job_files(&job.id);
        info!(job_id = %id, "Job deleted");
        Ok(())
    }

    /// Bulk delete of everything terminal. Returns `(deleted, skipped)`.
    pub fn delete_all_jobs(&self) -> (usize, usize) {
        let (deleted, skipped) = self.inner.store.delete_all();
        for job in &deleted {
            self.remove_job_files(&job.id);
        }
        (deleted.len(), skipped)
    }

    fn remove_job_files(&self, id: &JobId) {
        if let Err(err) = self.inner.log_hub.delete(id) {
            warn!(job_id = %id, error = %err, "Log file removal failed");
        }
        if let Err(err) = self.inner.metrics_hub.delete(id) {
            warn!(job_id = %id, error = %err, "Metrics removal failed");
        }
    }

    /// The blocking half of the lifecycle: cgroup setup and the two-stage
    /// handshake. Returns a fresh snapshot once the child is attached and
    /// holds its plan; the watch task owns everything after that.
    async fn begin(&self, job: Job) -> Result<Job> {
        let inner = &self.inner;
        let id = job.id;
        if inner
            .store
            .transition(&id, Transition::to(JobState::Initializing))
            .is_err()
        {
            // Stopped while still pending.
            return inner.store.job(&id);
        }

        let spawned = {
            let spawner = inner.spawner.clone();
            let job = job.clone();
            tokio::task::spawn_blocking(move || spawner.spawn(&job))
                .await
                .map_err(|e| Error::Internal(format!("spawn task: {e}")))?
        };
        let spawned = match spawned {
            Ok(spawned) => spawned,
            Err(err) => {
                let _ = inner.store.transition(
                    &id,
                    Transition {
                        to: JobState::Failed,
                        error: Some(err.to_string()),
                        ..Transition::default()
                    },
                );
                return Err(err);
            }
        };
        let _ = inner.store.set_pid(&id, spawned.pid);

        let producer = match inner.log_hub.open(id) {
            Ok(producer) => producer,
            Err(err) => {
                let _ = self
                    .inner
                    .platform
                    .signal(spawned.pid, joblet_platform::Signal::Kill);
                let _ = inner.store.transition(
                    &id,
                    Transition {
                        to: JobState::Failed,
                        error: Some(format!("log channel: {err}")),
                        ..Transition::default()
                    },
                );
                let spawner = inner.spawner.clone();
                let cgroup = spawned.cgroup.clone();
                let network = spawned.network.clone();
                tokio::task::spawn_blocking(move || {
                    spawner.cleanup(&id, Some(&cgroup), &network);
                })
                .await
                .ok();
                return Err(err);
            }
        };
        let SpawnedJob {
            pid,
            cgroup,
            network,
            stdout,
            stderr,
            exec_result,
        } = spawned;
        spawn_reader(producer.clone(), stdout);
        spawn_reader(producer, stderr);

        let supervisor = self.clone();
        tokio::spawn(async move {
            if let Err(err) = supervisor
                .watch_job(id, pid, cgroup, network, exec_result)
                .await
            {
                error!(job_id = %id, error = %err, "Job watch aborted");
            }
        });

        inner.store.job(&id)
    }

    /// The background half: confirm the exec, collect metrics, wait for the
    /// exit, account the terminal state, drain the logs, clean up.
    async fn watch_job(
        &self,
        id: JobId,
        pid: i32,
        cgroup: CgroupHandle,
        network: NetworkPlan,
        exec_result: std::fs::File,
    ) -> Result<()> {
        let inner = &self.inner;

        // EOF here means the child made it through exec; bytes mean it died
        // setting up.
        let exec_outcome = tokio::task::spawn_blocking(move || {
            let mut exec_result = exec_result;
            let mut buf = Vec::new();
            let _ = exec_result.read_to_end(&mut buf);
            decode_exec_result(&buf)
        })
        .await
        .map_err(|e| Error::Internal(format!("exec watch task: {e}")))?;

        let mut collector = None;
        let pre_exec_error = match exec_outcome {
            Ok(()) => {
                let _ = inner
                    .store
                    .transition(&id, Transition::to(JobState::Running));
                collector = Some(MetricsCollector::spawn(
                    inner.metrics_hub.clone(),
                    id,
                    Arc::new(CgroupSampleSource::new(
                        inner.platform.clone(),
                        inner.cgroups.clone(),
                        inner.gpus.clone(),
                        id,
                        cgroup.clone(),
                        pid,
                    )),
                    Duration::from_secs(inner.config.metrics.interval_secs),
                ));
                None
            }
            Err(err) => Some(format!("pre-exec failure: {err}")),
        };

        let exit = {
            let platform = inner.platform.clone();
            tokio::task::spawn_blocking(move || platform.wait_child(pid))
                .await
                .map_err(|e| Error::Internal(format!("wait task: {e}")))??
        };

        if let Some(collector) = &collector {
            collector.stop();
        }

        let was_stopping = inner
            .store
            .job(&id)
            .map(|j| j.state == JobState::Stopping)
            .unwrap_or(false);
        let (state, error) = match &pre_exec_error {
            Some(message) => (JobState::Failed, Some(message.clone())),
            None if was_stopping => (JobState::Stopped, None),
            None if exit.exit_code == 0 => (JobState::Completed, None),
            None if exit.signaled => (
                JobState::Failed,
                Some(format!("terminated by signal {}", exit.exit_code - 128)),
            ),
            None => (
                JobState::Failed,
                Some(format!("exited with code {}", exit.exit_code)),
            ),
        };

        if let Err(err) = inner.store.transition(
            &id,
            Transition {
                to: state,
                exit_code: Some(exit.exit_code),
                error,
                ..Transition::default()
            },
        ) {
            warn!(job_id = %id, error = %err, "Terminal transition refused");
        }
        info!(job_id = %id, state = %state, exit_code = exit.exit_code, "Job finished");

        // Drain window, terminal markers, then the cgroup can go.
        inner
            .log_hub
            .complete(&id, state, Some(exit.exit_code))
            .await;
        let spawner = inner.spawner.clone();
        tokio::task::spawn_blocking(move || {
            spawner.cleanup(&id, Some(&cgroup), &network);
        })
        .await
        .ok();
        Ok(())
    }
}

/// Pump one output pipe into the log system. Runs on a plain thread because
/// the file is a blocking pipe end.
fn spawn_reader(producer: LogProducer, mut pipe: std::fs::File) {
    std::thread::spawn(move || {
        let mut buf = [0u8; 8192];
        loop {
            match pipe.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => producer.publish(Bytes::copy_from_slice(&buf[..n])),
            }
        }
    });
}

/// Request validation, applied before anything is allocated.
fn validate_spec(spec: &JobSpec, config: &JobletConfig) -> Result<()> {
    if spec.command.trim().is_empty() {
        return Err(Error::InvalidArgument("command must not be empty".into()));
    }
    for name in &spec.volumes {
        if name.trim().is_empty() {
            return Err(Error::InvalidArgument(
                "volume names must not be empty".into(),
            ));
        }
    }
    if let Some(runtime) = &spec.runtime {
        RuntimeSpec::parse(runtime)?;
    }
    // Modes in the known set are always fine; custom names must resolve to
    // a configured network.
    if let NetworkMode::Custom(name) = &spec.network {
        if !config.network.resolves(name) {
            return Err(Error::InvalidArgument(format!(
                "network {name} is not configured"
            )));
        }
    }
    if let Some(gpu) = &spec.limits.gpu {
        if gpu.count == 0 && gpu.memory_mb.is_some() {
            return Err(Error::InvalidArgument(
                "GPU memory cap without a GPU count".into(),
            ));
        }
    }
    Ok(())
}
