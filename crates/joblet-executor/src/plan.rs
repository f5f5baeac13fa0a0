//! The isolation plan.
//!
//! Derived on the supervisor side from a validated job, serialized as JSON
//! onto the plan pipe, and applied verbatim by the isolated-init process.
//! The plan is the only channel between the two stages; the child shares no
//! state with the supervisor beyond it.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use joblet_core::{Job, JobId, NetworkMode};
use joblet_platform::NamespaceSet;

/// One bind mount to establish inside the new root. Targets are relative to
/// the root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindMount {
    pub source: PathBuf,
    pub target: String,
    pub readonly: bool,
}

/// A device node to create under /dev in the new root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceNode {
    pub name: String,
    pub major: u64,
    pub minor: u64,
    pub mode: u32,
}

/// Network configuration the init process applies before pivoting, while the
/// host's iproute2 is still reachable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkPlan {
    pub mode: NetworkMode,
    /// Interface name inside the job's namespace, e.g. `eth0`.
    pub interface: Option<String>,
    /// CIDR address leased from the bridge subnet.
    pub address: Option<String>,
    /// Default route target, normally the bridge IP.
    pub gateway: Option<String>,
}

impl NetworkPlan {
    pub fn none() -> Self {
        Self {
            mode: NetworkMode::None,
            interface: None,
            address: None,
            gateway: None,
        }
    }
}

/// Complete instructions for the isolated-init process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolationPlan {
    pub job_id: JobId,
    pub hostname: String,
    /// Host directory that becomes the job's `/`.
    pub root: PathBuf,
    /// Relaxed plan for runtime installation jobs: keep the host view, skip
    /// the pivot and mount shims.
    pub build_mode: bool,
    pub binds: Vec<BindMount>,
    pub devices: Vec<DeviceNode>,
    pub network: NetworkPlan,
    /// Merged regular and secret environment. Travels only over the private
    /// pipe, never through logs.
    pub env: Vec<(String, String)>,
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: Option<String>,
}

impl IsolationPlan {
    pub fn namespaces(&self) -> NamespaceSet {
        NamespaceSet::isolated(self.network.mode.unshares_netns())
    }
}

/// Directories bound read-only from the host when the job has no runtime.
const SCRATCH_HOST_DIRS: &[&str] = &["/bin", "/sbin", "/usr", "/lib", "/lib64", "/etc"];

/// Baseline device nodes every job root gets.
fn standard_devices() -> Vec<DeviceNode> {
    vec![
        DeviceNode {
            name: "null".into(),
            major: 1,
            minor: 3,
            mode: 0o666,
        },
        DeviceNode {
            name: "zero".into(),
            major: 1,
            minor: 5,
            mode: 0o666,
        },
        DeviceNode {
            name: "full".into(),
            major: 1,
            minor: 7,
            mode: 0o666,
        },
        DeviceNode {
            name: "random".into(),
            major: 1,
            minor: 8,
            mode: 0o666,
        },
        DeviceNode {
            name: "urandom".into(),
            major: 1,
            minor: 9,
            mode: 0o666,
        },
        DeviceNode {
            name: "tty".into(),
            major: 5,
            minor: 0,
            mode: 0o666,
        },
    ]
}

/// Assembles a plan from the resolved pieces of a job. The spawner feeds it
/// the runtime root, volume paths, staged uploads, GPU nodes, and the
/// network lease; the builder only composes.
pub struct PlanBuilder<'a> {
    job: &'a Job,
    root: PathBuf,
    runtime_root: Option<PathBuf>,
    runtime_extra_mounts: Vec<BindMount>,
    volumes: Vec<(String, PathBuf)>,
    uploads_dir: Option<PathBuf>,
    gpu_devices: Vec<DeviceNode>,
    network: NetworkPlan,
    build_mode: bool,
}

impl<'a> PlanBuilder<'a> {
    pub fn new(job: &'a Job, root: PathBuf) -> Self {
        Self {
            job,
            root,
            runtime_root: None,
            runtime_extra_mounts: Vec::new(),
            volumes: Vec::new(),
            uploads_dir: None,
            gpu_devices: Vec::new(),
            network: NetworkPlan::none(),
            build_mode: false,
        }
    }

    pub fn runtime(mut self, isolated_root: PathBuf, extra_mounts: Vec<BindMount>) -> Self {
        self.runtime_root = Some(isolated_root);
        self.runtime_extra_mounts = extra_mounts;
        self
    }

    /// `(name, host data dir)` pairs for each named volume.
    pub fn volumes(mut self, volumes: Vec<(String, PathBuf)>) -> Self {
        self.volumes = volumes;
        self
    }

    /// Host directory where the supervisor staged this job's uploads.
    pub fn uploads(mut self, dir: PathBuf) -> Self {
        self.uploads_dir = Some(dir);
        self
    }

    pub fn gpus(mut self, devices: Vec<DeviceNode>) -> Self {
        self.gpu_devices = devices;
        self
    }

    pub fn network(mut self, network: NetworkPlan) -> Self {
        self.network = network;
        self
    }

    pub fn build_mode(mut self, build_mode: bool) -> Self {
        self.build_mode = build_mode;
        self
    }

    pub fn build(self) -> IsolationPlan {
        let mut binds = Vec::new();

        if let Some(runtime_root) = &self.runtime_root {
            // The runtime tree becomes the whole root. Bound read-write so
            // volume and upload targets can be created inside it.
            binds.push(BindMount {
                source: runtime_root.clone(),
                target: String::new(),
                readonly: false,
            });
            binds.extend(self.runtime_extra_mounts);
        } else if !self.build_mode {
            for dir in SCRATCH_HOST_DIRS {
                if Path::new(dir).exists() {
                    binds.push(BindMount {
                        source: PathBuf::from(dir),
                        target: dir.trim_start_matches('/').to_string(),
                        readonly: true,
                    });
                }
            }
        }

        for (name, data_dir) in self.volumes {
            binds.push(BindMount {
                source: data_dir,
                target: format!("volumes/{name}"),
                readonly: false,
            });
        }

        if let Some(uploads) = self.uploads_dir {
            binds.push(BindMount {
                source: uploads,
                target: "uploads".to_string(),
                readonly: true,
            });
        }

        let mut devices = standard_devices();
        devices.extend(self.gpu_devices);

        let mut merged = self.job.spec.merged_environment();
        // The child environment is built from scratch; give exec a sane PATH
        // unless the job brought its own.
        merged
            .entry("PATH".to_string())
            .or_insert_with(|| "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string());
        let mut env: Vec<(String, String)> = merged.into_iter().collect();
        env.sort();

        IsolationPlan {
            job_id: self.job.id,
            hostname: format!("job-{}", short_id(&self.job.id)),
            root: self.root,
            build_mode: self.build_mode,
            binds,
            devices,
            network: self.network,
            env,
            command: self.job.spec.command.clone(),
            args: self.job.spec.args.clone(),
            working_dir: self.job.spec.working_dir.clone(),
        }
    }
}

fn short_id(id: &JobId) -> String {
    id.to_string().chars().take(8).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use joblet_core::JobSpec;

    fn job() -> Job {
        let mut spec = JobSpec::new("echo");
        spec.args = vec!["hello".to_string()];
        Job::new(JobId::new(), spec)
    }

    #[test]
    fn scratch_root_binds_host_dirs_read_only() {
        let job = job();
        let plan = PlanBuilder::new(&job, PathBuf::from("/work/rootfs")).build();
        assert!(!plan.binds.is_empty());
        assert!(plan.binds.iter().all(|b| b.readonly));
        assert!(plan.binds.iter().any(|b| b.target == "usr"));
    }

    #[test]
    fn runtime_root_replaces_host_binds() {
        let job = job();
        let plan = PlanBuilder::new(&job, PathBuf::from("/work/rootfs"))
            .runtime(PathBuf::from("/runtimes/python-3.11/isolated"), Vec::new())
            .build();
        assert_eq!(plan.binds[0].source, PathBuf::from("/runtimes/python-3.11/isolated"));
        assert_eq!(plan.binds[0].target, "");
        assert!(!plan.binds.iter().any(|b| b.target == "usr"));
    }

    #[test]
    fn volumes_and_uploads_are_appended() {
        let job = job();
        let plan = PlanBuilder::new(&job, PathBuf::from("/work/rootfs"))
            .volumes(vec![("cache".into(), PathBuf::from("/vols/cache/data"))])
            .uploads(PathBuf::from("/work/uploads"))
            .build();
        let volume = plan.binds.iter().find(|b| b.target == "volumes/cache").unwrap();
        assert!(!volume.readonly);
        let uploads = plan.binds.iter().find(|b| b.target == "uploads").unwrap();
        assert!(uploads.readonly);
    }

    #[test]
    fn gpu_nodes_extend_the_standard_set() {
        let job = job();
        let plan = PlanBuilder::new(&job, PathBuf::from("/w"))
            .gpus(vec![DeviceNode {
                name: "nvidia0".into(),
                major: 195,
                minor: 0,
                mode: 0o666,
            }])
            .build();
        assert!(plan.devices.iter().any(|d| d.name == "null"));
        assert!(plan.devices.iter().any(|d| d.name == "nvidia0"));
    }

    #[test]
    fn host_network_skips_netns_unshare() {
        let mut job = job();
        job.spec.network = NetworkMode::Host;
        let plan = PlanBuilder::new(&job, PathBuf::from("/w"))
            .network(NetworkPlan {
                mode: NetworkMode::Host,
                interface: None,
                address: None,
                gateway: None,
            })
            .build();
        assert!(!plan.namespaces().net);
        assert!(plan.namespaces().pid);
    }

    #[test]
    fn plan_round_trips_through_json() {
        let job = job();
        let plan = PlanBuilder::new(&job, PathBuf::from("/w")).build();
        let json = serde_json::to_string(&plan).unwrap();
        let parsed: IsolationPlan = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.command, "echo");
        assert_eq!(parsed.binds, plan.binds);
    }
}
