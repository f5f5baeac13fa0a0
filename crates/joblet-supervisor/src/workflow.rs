//! Declarative workflow orchestration.
//!
//! A workflow is a DAG of named jobs from a YAML document. The engine
//! validates the graph up front (references, cycles, runtimes, volumes,
//! upload blobs), then dispatches the ready set through the supervisor on a
//! cooperative tick. Each dispatched job gets a watcher that mirrors the
//! store's view back into the dependency record; terminal updates re-run the
//! tick so cascades propagate without waiting for the next interval.
//!
//! Per-workflow state sits behind its own async mutex: concurrent dispatch
//! of the same job name is impossible, and a tick that finds the lock taken
//! simply skips that workflow.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use joblet_config::workflow::{JobEntry, WorkflowFile};
use joblet_config::{ConfigError, EnvScope};
use joblet_core::workflow::{JobDependency, Requirement, Workflow, WorkflowStatus};
use joblet_core::{
    Error, JobId, JobSpec, JobState, NetworkMode, Result, Upload, WorkflowId,
};
use joblet_core::{GpuRequest, ResourceLimits};
use joblet_executor::runtime::RuntimeManager;
use joblet_executor::volume::VolumeManager;

/// The seam between the engine and the supervisor, mockable for tests.
#[async_trait]
pub trait JobDispatcher: Send + Sync {
    /// Start one workflow job; returns the child job's UUID.
    async fn dispatch(&self, name: &str, spec: JobSpec, workflow: WorkflowId) -> Result<JobId>;
    /// Current state of a dispatched job.
    fn job_state(&self, id: &JobId) -> Result<JobState>;
}

#[async_trait]
impl JobDispatcher for crate::Supervisor {
    async fn dispatch(&self, name: &str, spec: JobSpec, workflow: WorkflowId) -> Result<JobId> {
        let outcome = self
            .start_job(spec, None, Some((workflow, name.to_string())))
            .await?;
        Ok(outcome.job.id)
    }

    fn job_state(&self, id: &JobId) -> Result<JobState> {
        self.store().job(id).map(|job| job.state)
    }
}

struct WorkflowRun {
    record: Workflow,
    file: WorkflowFile,
    uploads: HashMap<String, Vec<u8>>,
}

struct EngineInner {
    dispatcher: Arc<dyn JobDispatcher>,
    runtimes: Arc<RuntimeManager>,
    volumes: Arc<VolumeManager>,
    default_volume_size: String,
    tick_interval: Duration,
    watch_interval: Duration,
    workflows: Mutex<HashMap<WorkflowId, Arc<tokio::sync::Mutex<WorkflowRun>>>>,
}

/// Cheap handle; clones share one engine.
#[derive(Clone)]
pub struct WorkflowEngine {
    inner: Arc<EngineInner>,
}

impl WorkflowEngine {
    pub fn new(
        dispatcher: Arc<dyn JobDispatcher>,
        runtimes: Arc<RuntimeManager>,
        volumes: Arc<VolumeManager>,
        default_volume_size: String,
        tick_interval: Duration,
        watch_interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                dispatcher,
                runtimes,
                volumes,
                default_volume_size,
                tick_interval,
                watch_interval,
                workflows: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Parse and validate a workflow; nothing is dispatched until
    /// [`WorkflowEngine::start`].
    pub fn create_workflow(
        &self,
        yaml: &str,
        uploads: HashMap<String, Vec<u8>>,
    ) -> Result<Workflow> {
        let file = WorkflowFile::from_yaml(yaml).map_err(joblet_core::Error::from)?;

        let mut deps = Vec::with_capacity(file.jobs.len());
        for (name, entry) in &file.jobs {
            let mut requires = Vec::new();
            for require in &entry.requires {
                for (on, status) in require.resolve().map_err(joblet_core::Error::from)? {
                    if !file.jobs.contains_key(&on) {
                        return Err(Error::InvalidArgument(format!(
                            "job {name} requires undefined job {on}"
                        )));
                    }
                    requires.push(Requirement { on, status });
                }
            }
            deps.push(JobDependency::new(name.clone(), requires));
        }
        deps.sort_by(|a, b| a.name.cmp(&b.name));

        check_acyclic(&deps).map_err(joblet_core::Error::from)?;

        for (name, entry) in &file.jobs {
            if let Some(runtime) = &entry.runtime {
                self.inner.runtimes.test(runtime).map_err(|err| {
                    Error::Precondition(format!("job {name}: runtime {runtime}: {err}"))
                })?;
            }
            for volume in &entry.volumes {
                self.inner
                    .volumes
                    .ensure(volume, &self.inner.default_volume_size)?;
            }
            for path in &entry.uploads.files {
                if !uploads.contains_key(path) {
                    return Err(Error::InvalidArgument(format!(
                        "job {name} references upload {path} that was not sent"
                    )));
                }
            }
        }

        let record = Workflow::new(file.name.clone(), deps);
        let workflow = record.clone();
        self.inner.workflows.lock().unwrap().insert(
            record.id,
            Arc::new(tokio::sync::Mutex::new(WorkflowRun {
                record,
                file,
                uploads,
            })),
        );
        info!(workflow_id = %workflow.id, name = %workflow.name, total = workflow.counters.total, "Workflow created");
        Ok(workflow)
    }

    /// Move a QUEUED workflow into RUNNING and kick the first tick.
    pub async fn start(&self, id: &WorkflowId) -> Result<Workflow> {
        let run = self.run(id)?;
        {
            let mut run = run.lock().await;
            if run.record.status != WorkflowStatus::Queued {
                return Err(Error::Precondition(format!(
                    "workflow {id} is {}",
                    run.record.status
                )));
            }
            run.record.status = WorkflowStatus::Running;
            run.record.started_at = Some(Utc::now());
        }
        self.tick(id).await;
        let run = self.run(id)?;
        let snapshot = run.lock().await.record.clone();
        Ok(snapshot)
    }

    pub async fn get_status(&self, id: &WorkflowId) -> Result<Workflow> {
        let run = self.run(id)?;
        let run = run.lock().await;
        Ok(run.record.clone())
    }

    pub async fn list(&self, include_completed: bool) -> Vec<Workflow> {
        let runs: Vec<_> = self
            .inner
            .workflows
            .lock()
            .unwrap()
            .values()
            .cloned()
            .collect();
        let mut records = Vec::with_capacity(runs.len());
        for run in runs {
            let record = run.lock().await.record.clone();
            if include_completed || !record.status.is_terminal() {
                records.push(record);
            }
        }
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records
    }

    /// Names of jobs whose every requirement currently holds.
    pub async fn get_ready_jobs(&self, id: &WorkflowId) -> Result<Vec<String>> {
        let run = self.run(id)?;
        let run = run.lock().await;
        Ok(ready_names(&run.record.jobs))
    }

    /// The orchestration loop. Spawn once at daemon startup.
    pub async fn run_loop(self) {
        let mut ticker = tokio::time::interval(self.inner.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let ids: Vec<WorkflowId> = self
                .inner
                .workflows
                .lock()
                .unwrap()
                .keys()
                .copied()
                .collect();
            for id in ids {
                self.tick(&id).await;
            }
        }
    }

    /// One orchestration pass for one workflow. Skips silently if a previous
    /// pass still holds the lock.
    pub async fn tick(&self, id: &WorkflowId) {
        let Ok(run) = self.run(id) else {
            return;
        };
        let Ok(mut run) = run.try_lock() else {
            return;
        };
        if run.record.status != WorkflowStatus::Running {
            return;
        }
        self.advance(id, &mut run).await;
    }

    /// Cancellation pass + ready-set dispatch, repeated until a fixed point,
    /// then the completion check.
    async fn advance(&self, id: &WorkflowId, run: &mut WorkflowRun) {
        loop {
            let mut changed = false;

            // Requirements that can no longer hold cancel their dependents.
            let states: HashMap<String, JobState> = run
                .record
                .jobs
                .iter()
                .map(|d| (d.name.clone(), d.state))
                .collect();
            for dep in &mut run.record.jobs {
                if dep.state == JobState::Pending && unsatisfiable(&dep.requires, &states) {
                    dep.state = JobState::Cancelled;
                    run.record.counters.cancelled += 1;
                    info!(workflow_id = %id, job = %dep.name, "Workflow job cancelled");
                    changed = true;
                }
            }

            for name in ready_names(&run.record.jobs) {
                changed = true;
                let entry = run.file.jobs[&name].clone();
                match build_spec(&run.file, &entry, &run.uploads) {
                    Ok(spec) => match self.inner.dispatcher.dispatch(&name, spec, *id).await {
                        Ok(job_id) => {
                            let dep = dep_mut(&mut run.record.jobs, &name);
                            dep.job_id = Some(job_id);
                            dep.state = JobState::Initializing;
                            self.spawn_watcher(*id, name, job_id);
                        }
                        Err(err) => {
                            warn!(workflow_id = %id, job = %name, error = %err, "Dispatch failed");
                            dep_mut(&mut run.record.jobs, &name).state = JobState::Failed;
                            run.record.counters.failed += 1;
                        }
                    },
                    Err(err) => {
                        warn!(workflow_id = %id, job = %name, error = %err, "Spec build failed");
                        dep_mut(&mut run.record.jobs, &name).state = JobState::Failed;
                        run.record.counters.failed += 1;
                    }
                }
            }

            if !changed {
                break;
            }
        }

        if run.record.jobs.iter().all(|d| d.state.is_terminal()) {
            let counters = run.record.counters;
            run.record.status = if counters.failed == 0 && counters.cancelled == 0 {
                WorkflowStatus::Completed
            } else {
                WorkflowStatus::Failed
            };
            run.record.finished_at = Some(Utc::now());
            info!(
                workflow_id = %id,
                status = %run.record.status,
                completed = counters.completed,
                failed = counters.failed,
                cancelled = counters.cancelled,
                "Workflow finished"
            );
        }
    }

    /// Mirror one dispatched job's store state into the dependency record
    /// until it lands somewhere terminal.
    fn spawn_watcher(&self, workflow_id: WorkflowId, name: String, job_id: JobId) {
        let engine = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(engine.inner.watch_interval).await;
                let state = match engine.inner.dispatcher.job_state(&job_id) {
                    Ok(state) => state,
                    // The job vanished from the store; treat as failed.
                    Err(_) => JobState::Failed,
                };
                let Ok(run) = engine.run(&workflow_id) else {
                    return;
                };
                let mut run = run.lock().await;
                let dep = dep_mut(&mut run.record.jobs, &name);
                if dep.state != state {
                    dep.state = state;
                }
                if state.is_terminal() {
                    match state {
                        JobState::Completed => run.record.counters.completed += 1,
                        JobState::Failed => run.record.counters.failed += 1,
                        _ => run.record.counters.cancelled += 1,
                    }
                    // Propagate immediately instead of waiting for the tick.
                    engine.advance(&workflow_id, &mut run).await;
                    return;
                }
            }
        });
    }

    fn run(&self, id: &WorkflowId) -> Result<Arc<tokio::sync::Mutex<WorkflowRun>>> {
        self.inner
            .workflows
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("workflow {id}")))
    }
}

fn dep_mut<'a>(deps: &'a mut [JobDependency], name: &str) -> &'a mut JobDependency {
    deps.iter_mut()
        .find(|d| d.name == name)
        .expect("dependency records never change shape")
}

fn ready_names(deps: &[JobDependency]) -> Vec<String> {
    let states: HashMap<&str, JobState> = deps
        .iter()
        .map(|d| (d.name.as_str(), d.state))
        .collect();
    deps.iter()
        .filter(|dep| {
            dep.state == JobState::Pending
                && dep
                    .requires
                    .iter()
                    .all(|req| states.get(req.on.as_str()) == Some(&req.status))
        })
        .map(|dep| dep.name.clone())
        .collect()
}

/// A requirement is unsatisfiable once its predecessor is parked in a
/// terminal state other than the one required.
fn unsatisfiable(requires: &[Requirement], states: &HashMap<String, JobState>) -> bool {
    requires.iter().any(|req| {
        states
            .get(&req.on)
            .is_some_and(|state| state.is_terminal() && *state != req.status)
    })
}

/// Kahn's algorithm; anything left over sits on a cycle.
fn check_acyclic(deps: &[JobDependency]) -> std::result::Result<(), ConfigError> {
    let mut in_degree: HashMap<&str, usize> = deps
        .iter()
        .map(|d| (d.name.as_str(), d.requires.len()))
        .collect();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for dep in deps {
        for req in &dep.requires {
            dependents
                .entry(req.on.as_str())
                .or_default()
                .push(dep.name.as_str());
        }
    }

    let mut queue: Vec<&str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(name, _)| *name)
        .collect();
    let mut visited = HashSet::new();
    while let Some(name) = queue.pop() {
        visited.insert(name);
        for dependent in dependents.get(name).into_iter().flatten() {
            let degree = in_degree.get_mut(dependent).expect("known job");
            *degree -= 1;
            if *degree == 0 {
                queue.push(dependent);
            }
        }
    }

    if visited.len() != deps.len() {
        let stuck: Vec<&str> = deps
            .iter()
            .map(|d| d.name.as_str())
            .filter(|name| !visited.contains(name))
            .collect();
        return Err(ConfigError::CycleDetected(stuck.join(", ")));
    }
    Ok(())
}

/// Turn a YAML job entry into a dispatchable spec, applying `${VAR}`
/// templating from the merged global and job scopes.
fn build_spec(
    file: &WorkflowFile,
    entry: &JobEntry,
    uploads: &HashMap<String, Vec<u8>>,
) -> Result<JobSpec> {
    let scope = EnvScope::for_job(
        &file.environment,
        &file.secret_environment,
        &entry.environment,
        &entry.secret_environment,
    );

    let mut spec = JobSpec::new(scope.interpolate(&entry.command));
    spec.args = scope.interpolate_vec(&entry.args);
    let (environment, secret_environment) = scope.into_environments();
    spec.environment = environment;
    spec.secret_environment = secret_environment;

    spec.limits = ResourceLimits {
        max_cpu_percent: entry.resources.max_cpu,
        max_memory_mb: entry.resources.max_memory,
        max_io_bps: entry.resources.max_iobps,
        cpu_cores: entry.resources.cpu_cores.clone(),
        gpu: (entry.resources.gpu_count > 0).then_some(GpuRequest {
            count: entry.resources.gpu_count,
            memory_mb: entry.resources.gpu_memory_mb,
        }),
    };
    if let Some(network) = &entry.network {
        spec.network = network.parse::<NetworkMode>()?;
    }
    spec.volumes = entry.volumes.clone();
    spec.runtime = entry.runtime.clone();
    spec.uploads = entry
        .uploads
        .files
        .iter()
        .map(|path| {
            uploads
                .get(path)
                .map(|content| Upload {
                    path: path.clone(),
                    content: content.clone(),
                })
                .ok_or_else(|| Error::InvalidArgument(format!("missing upload {path}")))
        })
        .collect::<Result<_>>()?;
    Ok(spec)
}
