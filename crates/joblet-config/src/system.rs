//! System configuration parsing.
//!
//! The daemon reads a TOML file (default `/etc/joblet/joblet.toml`, override
//! with `JOBLET_CONFIG`) and applies a small set of environment overrides on
//! top. Every field has a default so a bare host can run without a file.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::{ConfigError, ConfigResult};

/// Top-level daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobletConfig {
    /// State root; logs, metrics, and volumes live underneath.
    pub root: PathBuf,
    /// Root of installed runtime trees.
    pub runtimes_root: PathBuf,
    pub server: ServerConfig,
    pub cgroup: CgroupConfig,
    pub network: NetworkConfig,
    pub logs: LogConfig,
    pub metrics: MetricsConfig,
    pub workflow: WorkflowConfig,
    pub stop: StopConfig,
    pub sink: SinkConfig,
}

/// Optional external persist process fed over a local stream socket.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    /// Unix socket path of the collaborator; absent disables forwarding.
    pub socket: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address for the RPC surface.
    pub listen: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CgroupConfig {
    /// Delegated cgroup v2 subtree the daemon owns.
    pub subtree: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Preexisting bridge jobs attach to in bridge mode. Provisioning the
    /// bridge itself is host tooling's problem.
    pub bridge: String,
    /// CIDR the bridge owns; job addresses are leased from it.
    pub subnet: String,
    /// Gateway address jobs route through, normally the bridge IP.
    pub gateway: String,
    /// Named custom networks a job may select instead of the default
    /// bridge. A request naming anything not listed here is rejected at
    /// validation time.
    pub custom: HashMap<String, CustomNetwork>,
}

/// One named network, backed by its own preexisting bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomNetwork {
    pub bridge: String,
    pub subnet: String,
    pub gateway: String,
}

impl NetworkConfig {
    /// Whether `name` refers to a configured custom network.
    pub fn resolves(&self, name: &str) -> bool {
        self.custom.contains_key(name)
    }
}

/// Behavior when a job's log queue fills up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Gzip the queued backlog in place.
    Compress,
    /// Move the backlog to a sidecar spill file.
    Spill,
    /// Keep every Nth chunk, drop the rest.
    Sample,
    /// Block the producer and surface ResourceExhausted upstream.
    Alert,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Per-job queue capacity in chunks.
    pub queue_capacity: usize,
    /// Aggregate in-memory cap across all jobs, in bytes.
    pub total_buffer_bytes: u64,
    pub overflow_policy: OverflowPolicy,
    /// Keep every Nth chunk under the sample policy.
    pub sample_every: usize,
    /// How often the disk writer forces data out.
    pub fsync_interval_ms: u64,
    /// Bounded wait when publishing to a slow subscriber.
    pub subscriber_send_timeout_ms: u64,
    /// Window after a terminal transition during which late chunks are still
    /// delivered. Clamped to at least 1ms; it must never be zero.
    pub drain_window_ms: u64,
    /// Keep-alive cadence on idle streams.
    pub keepalive_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Sampling interval per running job.
    pub interval_secs: u64,
    /// Host-wide GPU stat cache lifetime.
    pub gpu_cache_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Orchestration tick.
    pub tick_secs: u64,
    /// Per-dispatched-job watcher poll interval.
    pub watch_secs: u64,
    /// Default size note recorded for auto-created volumes.
    pub default_volume_size: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StopConfig {
    /// Seconds between SIGTERM and SIGKILL.
    pub term_wait_secs: u64,
}

impl Default for JobletConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/var/lib/joblet"),
            runtimes_root: PathBuf::from("/var/lib/joblet/runtimes"),
            server: ServerConfig::default(),
            cgroup: CgroupConfig::default(),
            network: NetworkConfig::default(),
            logs: LogConfig::default(),
            metrics: MetricsConfig::default(),
            workflow: WorkflowConfig::default(),
            stop: StopConfig::default(),
            sink: SinkConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:7621".to_string(),
        }
    }
}

impl Default for CgroupConfig {
    fn default() -> Self {
        Self {
            subtree: PathBuf::from("/sys/fs/cgroup/joblet.slice/joblet.service"),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bridge: "joblet0".to_string(),
            subnet: "10.88.0.0/16".to_string(),
            gateway: "10.88.0.1".to_string(),
            custom: HashMap::new(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 100_000,
            total_buffer_bytes: 1 << 30,
            overflow_policy: OverflowPolicy::Compress,
            sample_every: 10,
            fsync_interval_ms: 1_000,
            subscriber_send_timeout_ms: 100,
            drain_window_ms: 500,
            keepalive_interval_ms: 10_000,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            interval_secs: 5,
            gpu_cache_ms: 2_000,
        }
    }
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            tick_secs: 5,
            watch_secs: 2,
            default_volume_size: "1GB".to_string(),
        }
    }
}

impl Default for StopConfig {
    fn default() -> Self {
        Self { term_wait_secs: 5 }
    }
}

impl JobletConfig {
    /// Parse from TOML text.
    pub fn from_toml(text: &str) -> ConfigResult<Self> {
        let mut config: JobletConfig = toml::from_str(text)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Load from a file, or defaults when the file does not exist.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if path.exists() {
            Self::from_toml(&std::fs::read_to_string(path)?)
        } else {
            let mut config = Self::default();
            config.apply_env();
            Ok(config)
        }
    }

    /// Resolve the config file path from `JOBLET_CONFIG` and load it.
    pub fn discover() -> ConfigResult<Self> {
        let path = std::env::var("JOBLET_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/etc/joblet/joblet.toml"));
        Self::load(&path)
    }

    fn apply_env(&mut self) {
        if let Ok(root) = std::env::var("JOBLET_ROOT") {
            self.root = PathBuf::from(&root);
            self.runtimes_root = PathBuf::from(root).join("runtimes");
        }
        if let Ok(listen) = std::env::var("JOBLET_LISTEN") {
            self.server.listen = listen;
        }
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.logs.queue_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "logs.queue_capacity".into(),
                message: "must be positive".into(),
            });
        }
        if self.logs.sample_every == 0 {
            return Err(ConfigError::InvalidValue {
                field: "logs.sample_every".into(),
                message: "must be positive".into(),
            });
        }
        if self.metrics.interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "metrics.interval_secs".into(),
                message: "must be positive".into(),
            });
        }
        Ok(())
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn metrics_dir(&self) -> PathBuf {
        self.root.join("metrics")
    }

    pub fn volumes_dir(&self) -> PathBuf {
        self.root.join("volumes")
    }

    /// The drain window, never zero.
    pub fn drain_window(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.logs.drain_window_ms.max(1))
    }
}
