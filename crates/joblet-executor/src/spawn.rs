//! Supervisor side of the two-stage spawn.
//!
//! Order matters and is load-bearing:
//!
//! 1. resolve runtime, volumes, GPUs; stage uploads; lease the network
//! 2. create the cgroup and write limits (rolled back on any later failure)
//! 3. clone this binary into the new namespaces with `EXEC_MODE=isolated-init`
//! 4. attach the child PID to the cgroup and move the veth peer in
//! 5. only then write the plan to the child's stdin
//!
//! The child blocks reading its stdin, so step 5 is the go-ahead: it cannot
//! reach exec before the attach in step 4 happened.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, info, warn};

use joblet_config::JobletConfig;
use joblet_core::{Error, Job, JobId, Result};
use joblet_platform::{Platform, Signal, SpawnRequest};

use crate::cgroup::{CgroupHandle, CgroupManager};
use crate::gpu::GpuManager;
use crate::network::NetworkAttacher;
use crate::plan::{IsolationPlan, NetworkPlan, PlanBuilder};
use crate::runtime::RuntimeManager;
use crate::volume::VolumeManager;
use crate::{EXEC_MODE_ENV, EXEC_MODE_INIT, JOB_TYPE_ENV, JOB_TYPE_RUNTIME_BUILD};

/// Everything the supervisor holds for a freshly spawned job.
pub struct SpawnedJob {
    pub pid: i32,
    pub cgroup: CgroupHandle,
    pub network: NetworkPlan,
    /// Job output pipes, handed to the log readers.
    pub stdout: std::fs::File,
    pub stderr: std::fs::File,
    /// EOF on a successful exec; errno bytes on a pre-exec failure.
    pub exec_result: std::fs::File,
}

pub struct JobSpawner {
    platform: Arc<dyn Platform>,
    config: JobletConfig,
    cgroups: Arc<CgroupManager>,
    runtimes: Arc<RuntimeManager>,
    volumes: Arc<VolumeManager>,
    network: Arc<NetworkAttacher>,
    gpus: Arc<GpuManager>,
}

impl JobSpawner {
    pub fn new(
        platform: Arc<dyn Platform>,
        config: JobletConfig,
        cgroups: Arc<CgroupManager>,
        runtimes: Arc<RuntimeManager>,
        volumes: Arc<VolumeManager>,
        network: Arc<NetworkAttacher>,
        gpus: Arc<GpuManager>,
    ) -> Self {
        Self {
            platform,
            config,
            cgroups,
            runtimes,
            volumes,
            network,
            gpus,
        }
    }

    /// Launch a job. On success the child is attached, planned, and on its
    /// way to exec; on failure every acquired resource has been rolled back.
    pub fn spawn(&self, job: &Job) -> Result<SpawnedJob> {
        let plan = self.build_plan(job)?;

        let cgroup = self.cgroups.create(&job.id)?;
        if let Err(err) = self.cgroups.apply_limits(&cgroup, &job.spec.limits) {
            self.rollback(&job.id, Some(&cgroup), &plan.network, None);
            return Err(err);
        }

        let request = SpawnRequest {
            exe: current_exe()?,
            args: Vec::new(),
            env: vec![(EXEC_MODE_ENV.to_string(), EXEC_MODE_INIT.to_string())],
            namespaces: plan.namespaces(),
        };
        let child = match self.platform.spawn_isolated(&request) {
            Ok(child) => child,
            Err(err) => {
                self.rollback(&job.id, Some(&cgroup), &plan.network, None);
                return Err(Error::Internal(format!("spawning job: {err}")));
            }
        };
        debug!(job_id = %job.id, pid = child.pid, "Cloned isolated child");

        if let Err(err) = self.cgroups.attach(&cgroup, child.pid) {
            self.rollback(&job.id, Some(&cgroup), &plan.network, Some(child.pid));
            return Err(Error::ResourceExhausted(format!(
                "attaching pid {}: {err}",
                child.pid
            )));
        }

        if let Err(err) = self.network.attach(&job.id, child.pid, &plan.network) {
            self.rollback(&job.id, Some(&cgroup), &plan.network, Some(child.pid));
            return Err(err);
        }

        // The go-ahead: the child is parked on stdin until this lands.
        if let Err(err) = self.write_plan(&plan, child.plan) {
            self.rollback(&job.id, Some(&cgroup), &plan.network, Some(child.pid));
            return Err(err);
        }

        info!(job_id = %job.id, pid = child.pid, "Job dispatched to isolated init");
        Ok(SpawnedJob {
            pid: child.pid,
            cgroup,
            network: plan.network,
            stdout: child.stdout,
            stderr: child.stderr,
            exec_result: child.exec_result,
        })
    }

    /// Graduated stop: SIGTERM, a bounded wait, then SIGKILL to the init
    /// PID, which takes the whole PID namespace with it.
    pub async fn stop(&self, job_id: &JobId, pid: i32) -> Result<()> {
        if !self.platform.process_exists(pid) {
            return Ok(());
        }
        info!(job_id = %job_id, pid, "Stopping job");
        if let Err(err) = self.platform.signal(pid, Signal::Term) {
            // ESRCH means it beat us to the exit.
            if err.errno() == Some(libc::ESRCH) {
                return Ok(());
            }
            warn!(job_id = %job_id, pid, error = %err, "SIGTERM failed, escalating");
        }

        let deadline = Duration::from_secs(self.config.stop.term_wait_secs);
        let poll = Duration::from_millis(100);
        let mut waited = Duration::ZERO;
        while waited < deadline {
            if !self.platform.process_exists(pid) {
                return Ok(());
            }
            sleep(poll).await;
            waited += poll;
        }

        warn!(job_id = %job_id, pid, "Stop window elapsed, sending SIGKILL");
        match self.platform.signal(pid, Signal::Kill) {
            Ok(()) => Ok(()),
            Err(err) if err.errno() == Some(libc::ESRCH) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Tear down everything a finished or failed job held.
    pub fn cleanup(&self, job_id: &JobId, cgroup: Option<&CgroupHandle>, network: &NetworkPlan) {
        if let Some(cgroup) = cgroup {
            if let Err(err) = self.cgroups.destroy(cgroup) {
                warn!(job_id = %job_id, error = %err, "Cgroup teardown failed");
            }
        }
        self.network.release(job_id, network);
        self.gpus.release(job_id);
        let work = self.work_dir(job_id);
        if self.platform.exists(&work) {
            if let Err(err) = self.platform.remove_dir_all(&work) {
                warn!(job_id = %job_id, error = %err, "Work dir cleanup failed");
            }
        }
    }

    fn build_plan(&self, job: &Job) -> Result<IsolationPlan> {
        let work = self.work_dir(&job.id);
        let build_mode = job
            .spec
            .environment
            .get(JOB_TYPE_ENV)
            .is_some_and(|v| v == JOB_TYPE_RUNTIME_BUILD);

        let mut builder = PlanBuilder::new(job, work.join("rootfs")).build_mode(build_mode);

        if let Some(spec) = &job.spec.runtime {
            let runtime = self.runtimes.resolve(spec)?;
            builder = builder.runtime(runtime.isolated_root.clone(), runtime.extra_binds());
        }

        let mut volumes = Vec::with_capacity(job.spec.volumes.len());
        for name in &job.spec.volumes {
            self.volumes
                .ensure(name, &self.config.workflow.default_volume_size)?;
            volumes.push((name.clone(), self.volumes.data_dir(name)));
        }
        builder = builder.volumes(volumes);

        if !job.spec.uploads.is_empty() {
            let uploads_dir = work.join("uploads");
            self.stage_uploads(job, &uploads_dir)?;
            builder = builder.uploads(uploads_dir);
        }

        if let Some(gpu) = &job.spec.limits.gpu {
            builder = builder.gpus(self.gpus.allocate(&job.id, gpu)?);
        }

        let network = self.network.prepare(&job.id, &job.spec.network)?;
        Ok(builder.network(network).build())
    }

    fn stage_uploads(&self, job: &Job, dir: &Path) -> Result<()> {
        for upload in &job.spec.uploads {
            let relative = sanitize_upload_path(&upload.path)?;
            let target = dir.join(relative);
            if let Some(parent) = target.parent() {
                self.platform.create_dir_all(parent)?;
            }
            self.platform.write(&target, &upload.content)?;
        }
        Ok(())
    }

    fn write_plan(&self, plan: &IsolationPlan, mut pipe: std::fs::File) -> Result<()> {
        use std::io::Write as _;
        let encoded = serde_json::to_vec(plan)
            .map_err(|e| Error::Internal(format!("encoding isolation plan: {e}")))?;
        pipe.write_all(&encoded)
            .map_err(|e| Error::syscall("writing plan", e))?;
        // Dropping the write end gives the child its EOF.
        Ok(())
    }

    fn rollback(
        &self,
        job_id: &JobId,
        cgroup: Option<&CgroupHandle>,
        network: &NetworkPlan,
        pid: Option<i32>,
    ) {
        if let Some(pid) = pid {
            let _ = self.platform.signal(pid, Signal::Kill);
        }
        self.cleanup(job_id, cgroup, network);
    }

    fn work_dir(&self, job_id: &JobId) -> PathBuf {
        self.config.root.join("jobs").join(job_id.to_string())
    }
}

fn current_exe() -> Result<PathBuf> {
    std::env::current_exe().map_err(|e| Error::syscall("readlink /proc/self/exe", e))
}

/// Uploads land under `/uploads`; keep them there.
fn sanitize_upload_path(path: &str) -> Result<&Path> {
    let p = Path::new(path);
    if p.is_absolute()
        || p.components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return Err(Error::InvalidArgument(format!(
            "upload path {path:?} must be relative and stay in place"
        )));
    }
    Ok(p)
}

#[cfg(test)]
mod tests {
    use super::*;
    use joblet_core::{JobSpec, NetworkMode, Upload};
    use joblet_platform::testing::RecordingPlatform;
    use std::io::Read as _;
    use tempfile::TempDir;

    fn spawner(dir: &TempDir) -> (Arc<RecordingPlatform>, JobSpawner) {
        let platform = Arc::new(RecordingPlatform::new());
        let mut config = JobletConfig::default();
        config.root = dir.path().to_path_buf();
        config.runtimes_root = dir.path().join("runtimes");
        config.cgroup.subtree = dir.path().join("cgroup");
        let cgroups = Arc::new(CgroupManager::new(
            platform.clone(),
            config.cgroup.subtree.clone(),
        ));
        let runtimes = Arc::new(RuntimeManager::new(
            platform.clone(),
            config.runtimes_root.clone(),
        ));
        let volumes = Arc::new(VolumeManager::new(platform.clone(), dir.path().join("volumes")));
        let network = Arc::new(
            NetworkAttacher::new(platform.clone(), config.network.clone()).unwrap(),
        );
        let gpus = Arc::new(GpuManager::new(platform.clone(), Duration::from_secs(2)));
        let spawner = JobSpawner::new(
            platform.clone(),
            config,
            cgroups,
            runtimes,
            volumes,
            network,
            gpus,
        );
        (platform, spawner)
    }

    fn job() -> Job {
        let mut spec = JobSpec::new("echo");
        spec.args = vec!["hello".to_string()];
        spec.network = NetworkMode::None;
        Job::new(JobId::new(), spec)
    }

    #[test]
    fn spawn_attaches_and_delivers_the_plan() {
        let dir = TempDir::new().unwrap();
        let (platform, spawner) = spawner(&dir);
        let job = job();
        let spawned = spawner.spawn(&job).unwrap();

        // The child PID landed in the job's cgroup before the plan went out.
        let procs =
            std::fs::read_to_string(spawned.cgroup.path().join("cgroup.procs")).unwrap();
        assert_eq!(procs, spawned.pid.to_string());

        // The plan is complete and decodable on the child's stdin.
        let mut fake = platform.take_spawned().unwrap();
        drop(spawned);
        let mut buf = String::new();
        fake.plan.read_to_string(&mut buf).unwrap();
        let plan: IsolationPlan = serde_json::from_str(&buf).unwrap();
        assert_eq!(plan.command, "echo");
        assert_eq!(plan.job_id, job.id);
        assert!(fake.request.namespaces.pid);
        assert!(fake.request.namespaces.net);
        assert!(
            fake.request
                .env
                .contains(&(EXEC_MODE_ENV.to_string(), EXEC_MODE_INIT.to_string()))
        );
    }

    #[test]
    fn uploads_are_staged_under_the_work_dir() {
        let dir = TempDir::new().unwrap();
        let (_, spawner) = spawner(&dir);
        let mut job = job();
        job.spec.uploads = vec![Upload {
            path: "scripts/run.sh".into(),
            content: b"#!/bin/sh\necho hi\n".to_vec(),
        }];
        spawner.spawn(&job).unwrap();
        let staged = dir
            .path()
            .join("jobs")
            .join(job.id.to_string())
            .join("uploads/scripts/run.sh");
        assert!(staged.is_file());
    }

    #[test]
    fn traversal_uploads_are_rejected_before_any_resource_exists() {
        let dir = TempDir::new().unwrap();
        let (_, spawner) = spawner(&dir);
        let mut job = job();
        job.spec.uploads = vec![Upload {
            path: "../escape".into(),
            content: Vec::new(),
        }];
        assert!(spawner.spawn(&job).is_err());
        // No cgroup was left behind.
        assert!(!dir.path().join("cgroup").join(format!("job-{}", job.id)).exists());
    }

    #[test]
    fn unknown_runtime_fails_before_cgroup_creation() {
        let dir = TempDir::new().unwrap();
        let (_, spawner) = spawner(&dir);
        let mut job = job();
        job.spec.runtime = Some("python:3.11".into());
        assert!(matches!(spawner.spawn(&job), Err(Error::NotFound(_))));
        assert!(!dir.path().join("cgroup").join(format!("job-{}", job.id)).exists());
    }

    #[test]
    fn volumes_are_auto_created() {
        let dir = TempDir::new().unwrap();
        let (_, spawner) = spawner(&dir);
        let mut job = job();
        job.spec.volumes = vec!["cache".to_string()];
        spawner.spawn(&job).unwrap();
        assert!(dir.path().join("volumes/cache/data").is_dir());
    }

    #[tokio::test]
    async fn stop_escalates_to_sigkill() {
        let dir = TempDir::new().unwrap();
        let (platform, mut_config_spawner) = spawner(&dir);
        // Shrink the stop window so the test stays fast.
        let mut spawner = mut_config_spawner;
        spawner.config.stop.term_wait_secs = 1;
        let id = JobId::new();
        platform.live_pids.lock().unwrap().push(4321);
        spawner.stop(&id, 4321).await.unwrap();
        let signals: Vec<i32> = platform
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                joblet_platform::testing::SysCall::Signal { signal, .. } => Some(signal),
                _ => None,
            })
            .collect();
        assert_eq!(signals, vec![libc::SIGTERM, libc::SIGKILL]);
    }

    #[tokio::test]
    async fn stop_is_a_no_op_for_dead_pids() {
        let dir = TempDir::new().unwrap();
        let (platform, spawner) = spawner(&dir);
        spawner.stop(&JobId::new(), 9999).await.unwrap();
        assert!(platform.calls().is_empty());
    }
}
