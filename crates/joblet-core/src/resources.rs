//! Resource limit value types.

use serde::{Deserialize, Serialize};

/// Resource limits applied to a job's cgroup. Zero means unlimited.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// CPU bandwidth as a percent of one core. 150 means 1.5 cores.
    #[serde(default)]
    pub max_cpu_percent: u32,
    /// Memory ceiling in megabytes.
    #[serde(default)]
    pub max_memory_mb: u64,
    /// I/O throughput ceiling in bytes per second, applied per device.
    #[serde(default)]
    pub max_io_bps: u64,
    /// Cpuset mask in kernel list syntax, e.g. "0-3" or "1,3".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_cores: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu: Option<GpuRequest>,
}

impl ResourceLimits {
    pub fn is_unlimited(&self) -> bool {
        self.max_cpu_percent == 0
            && self.max_memory_mb == 0
            && self.max_io_bps == 0
            && self.cpu_cores.is_none()
            && self.gpu.is_none()
    }
}

/// GPU allocation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuRequest {
    /// Number of devices to allocate.
    pub count: u32,
    /// Per-device memory cap in megabytes. Advisory; admission only gates on
    /// device availability.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,
}
