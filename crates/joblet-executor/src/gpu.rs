//! GPU device admission and host-wide stats.
//!
//! Admission hands whole devices to jobs: the plan gets the `/dev/nvidia*`
//! node numbers and the init process mknods them inside the new root. The
//! per-GPU memory cap in a request is recorded but not enforced beyond the
//! device allow-list. Stats come from one `nvidia-smi` invocation shared by
//! every collector on the host, behind a short-lived cache.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

use joblet_core::events::GpuStats;
use joblet_core::{Error, GpuRequest, JobId, Result};
use joblet_platform::Platform;

use crate::plan::DeviceNode;

const NVIDIA_MAJOR: u64 = 195;
const NVIDIACTL_MINOR: u64 = 255;

pub struct GpuManager {
    platform: Arc<dyn Platform>,
    cache_ttl: Duration,
    allocations: Mutex<HashMap<JobId, Vec<u32>>>,
    stats_cache: Mutex<Option<(Instant, Vec<GpuStats>)>>,
}

impl GpuManager {
    pub fn new(platform: Arc<dyn Platform>, cache_ttl: Duration) -> Self {
        Self {
            platform,
            cache_ttl,
            allocations: Mutex::new(HashMap::new()),
            stats_cache: Mutex::new(None),
        }
    }

    /// Indexes of GPU devices present on the host.
    pub fn discover(&self) -> Vec<u32> {
        let Ok(entries) = self.platform.list_dir(Path::new("/dev")) else {
            return Vec::new();
        };
        let mut indexes: Vec<u32> = entries
            .iter()
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
            .filter_map(|name| name.strip_prefix("nvidia")?.parse().ok())
            .collect();
        indexes.sort_unstable();
        indexes
    }

    /// Reserve devices for a job and return the nodes its root needs.
    pub fn allocate(&self, job_id: &JobId, request: &GpuRequest) -> Result<Vec<DeviceNode>> {
        if request.count == 0 {
            return Ok(Vec::new());
        }
        let present = self.discover();
        let mut allocations = self.allocations.lock().unwrap();
        let taken: Vec<u32> = allocations.values().flatten().copied().collect();
        let free: Vec<u32> = present
            .into_iter()
            .filter(|idx| !taken.contains(idx))
            .collect();
        if (free.len() as u32) < request.count {
            return Err(Error::ResourceExhausted(format!(
                "requested {} GPUs, {} free",
                request.count,
                free.len()
            )));
        }
        let granted: Vec<u32> = free.into_iter().take(request.count as usize).collect();
        debug!(job_id = %job_id, gpus = ?granted, "Allocated GPUs");

        let mut nodes: Vec<DeviceNode> = granted
            .iter()
            .map(|idx| DeviceNode {
                name: format!("nvidia{idx}"),
                major: NVIDIA_MAJOR,
                minor: u64::from(*idx),
                mode: 0o666,
            })
            .collect();
        nodes.push(DeviceNode {
            name: "nvidiactl".into(),
            major: NVIDIA_MAJOR,
            minor: NVIDIACTL_MINOR,
            mode: 0o666,
        });
        if let Some(uvm_major) = self.uvm_major() {
            nodes.push(DeviceNode {
                name: "nvidia-uvm".into(),
                major: uvm_major,
                minor: 0,
                mode: 0o666,
            });
        }
        allocations.insert(*job_id, granted);
        Ok(nodes)
    }

    pub fn release(&self, job_id: &JobId) {
        self.allocations.lock().unwrap().remove(job_id);
    }

    /// Device indexes currently held by a job.
    pub fn allocation(&self, job_id: &JobId) -> Vec<u32> {
        self.allocations
            .lock()
            .unwrap()
            .get(job_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Host-wide GPU stats, at most `cache_ttl` stale. Every metrics
    /// collector shares this cache; only one `nvidia-smi` runs per window.
    pub fn stats(&self) -> Vec<GpuStats> {
        let mut cache = self.stats_cache.lock().unwrap();
        if let Some((at, stats)) = cache.as_ref() {
            if at.elapsed() < self.cache_ttl {
                return stats.clone();
            }
        }
        let stats = self.query_smi().unwrap_or_default();
        *cache = Some((Instant::now(), stats.clone()));
        stats
    }

    fn query_smi(&self) -> Result<Vec<GpuStats>> {
        let output = self.platform.run_command(
            "nvidia-smi",
            &[
                "--query-gpu=index,utilization.gpu,memory.used,memory.total",
                "--format=csv,noheader,nounits",
            ],
        )?;
        if !output.status.success() {
            return Ok(Vec::new());
        }
        Ok(parse_smi_csv(&String::from_utf8_lossy(&output.stdout)))
    }

    /// The nvidia-uvm major is dynamic; it lives in /proc/devices.
    fn uvm_major(&self) -> Option<u64> {
        let devices = self
            .platform
            .read_to_string(Path::new("/proc/devices"))
            .ok()?;
        devices.lines().find_map(|line| {
            let mut parts = line.split_whitespace();
            let major: u64 = parts.next()?.parse().ok()?;
            (parts.next()? == "nvidia-uvm").then_some(major)
        })
    }
}

fn parse_smi_csv(text: &str) -> Vec<GpuStats> {
    text.lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            if fields.len() != 4 {
                return None;
            }
            Some(GpuStats {
                index: fields[0].parse().ok()?,
                utilization_percent: fields[1].parse().ok()?,
                memory_used_mb: fields[2].parse().ok()?,
                memory_total_mb: fields[3].parse().ok()?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smi_csv_parses() {
        let stats = parse_smi_csv("0, 35, 2048, 24576\n1, 0, 0, 24576\n");
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].index, 0);
        assert_eq!(stats[0].utilization_percent, 35.0);
        assert_eq!(stats[1].memory_total_mb, 24_576);
    }

    #[test]
    fn malformed_smi_lines_are_skipped() {
        let stats = parse_smi_csv("garbage\n0, 35, 2048, 24576\n");
        assert_eq!(stats.len(), 1);
    }

    #[test]
    fn zero_count_requests_allocate_nothing() {
        let platform = Arc::new(joblet_platform::testing::RecordingPlatform::new());
        let mgr = GpuManager::new(platform, Duration::from_secs(2));
        let nodes = mgr
            .allocate(
                &JobId::new(),
                &GpuRequest {
                    count: 0,
                    memory_mb: None,
                },
            )
            .unwrap();
        assert!(nodes.is_empty());
    }

    #[test]
    fn over_allocation_is_resource_exhausted() {
        let platform = Arc::new(joblet_platform::testing::RecordingPlatform::new());
        let mgr = GpuManager::new(platform, Duration::from_secs(2));
        // More devices than any host has.
        let err = mgr
            .allocate(
                &JobId::new(),
                &GpuRequest {
                    count: 10_000,
                    memory_mb: None,
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted(_)));
    }
}
