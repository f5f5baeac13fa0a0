//! Log and metrics event types shared by the pipeline, store, and API.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::id::JobId;
use crate::job::JobState;

/// One chunk of job output. Offsets are strictly increasing per job; the
/// timestamp is monotonic and used only for ordering and rate bookkeeping.
#[derive(Debug, Clone)]
pub struct LogChunk {
    pub offset: u64,
    pub bytes: Bytes,
    pub timestamp: Instant,
}

impl LogChunk {
    pub fn new(offset: u64, bytes: Bytes) -> Self {
        Self {
            offset,
            bytes,
            timestamp: Instant::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// What a log subscriber receives.
#[derive(Debug, Clone)]
pub enum JobEvent {
    Chunk(LogChunk),
    /// Emitted while a stream is idle so clients can detect liveness.
    KeepAlive,
    /// Delivered exactly once, after all chunks, when the drain window ends.
    Terminated {
        state: JobState,
        exit_code: Option<i32>,
    },
}

/// CPU counters and derived percent.
///
/// Counters come from `cpu.stat` in the job's cgroup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuStats {
    pub usage_usec: u64,
    pub user_usec: u64,
    pub system_usec: u64,
    pub throttled_usec: u64,
    pub nr_throttled: u64,
    /// Percent of one core over the sample interval.
    pub percent: f64,
}

/// Memory usage from `memory.current`, `memory.max`, `memory.stat`, and
/// `memory.events`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub current_bytes: u64,
    /// u64::MAX when unlimited.
    pub max_bytes: u64,
    pub anon_bytes: u64,
    pub file_bytes: u64,
    pub oom_kills: u64,
    /// Percent of the limit; 0.0 when unlimited.
    pub percent: f64,
}

/// Block I/O from `io.stat`, summed across devices, with rates derived from
/// the previous sample.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IoStats {
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub read_ops: u64,
    pub write_ops: u64,
    pub read_bps: f64,
    pub write_bps: f64,
}

/// Task counts from `pids.current` and `pids.max`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PidStats {
    pub current: u64,
    /// u64::MAX when unlimited.
    pub max: u64,
}

/// Pressure stall information, 10-second averages from the cgroup's
/// `*.pressure` files. Absent on kernels without PSI.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PressureStats {
    pub cpu_some_avg10: f64,
    pub memory_some_avg10: f64,
    pub memory_full_avg10: f64,
    pub io_some_avg10: f64,
    pub io_full_avg10: f64,
}

/// Per-process observations from `/proc/<pid>`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessStats {
    pub threads: u64,
    pub open_fds: u64,
}

/// Cumulative and rate network counters for the job's namespace.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkStats {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_bps: f64,
    pub tx_bps: f64,
}

/// Per-device GPU observations, shared host-wide and refreshed on a short
/// cache interval.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GpuStats {
    pub index: u32,
    pub utilization_percent: f64,
    pub memory_used_mb: u64,
    pub memory_total_mb: u64,
}

/// Point-in-time snapshot for one job. Serialized as one NDJSON line in the
/// per-job metrics file and forwarded to the event sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSample {
    pub job_id: JobId,
    pub timestamp: DateTime<Utc>,
    /// Seconds since the previous sample, used for the rate fields.
    pub interval_secs: f64,
    pub cpu: CpuStats,
    pub memory: MemoryStats,
    pub io: IoStats,
    pub pids: PidStats,
    pub process: ProcessStats,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pressure: Option<PressureStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkStats>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gpu: Vec<GpuStats>,
}
