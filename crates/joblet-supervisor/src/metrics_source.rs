//! Raw counters for one job: its cgroup, its `/proc` entry, and the shared
//! GPU cache.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;

use joblet_core::events::{MetricsSample, NetworkStats, ProcessStats};
use joblet_core::{JobId, Result};
use joblet_executor::cgroup::{CgroupHandle, CgroupManager};
use joblet_executor::gpu::GpuManager;
use joblet_logs::SampleSource;
use joblet_platform::Platform;

pub struct CgroupSampleSource {
    platform: Arc<dyn Platform>,
    cgroups: Arc<CgroupManager>,
    gpus: Arc<GpuManager>,
    job_id: JobId,
    handle: CgroupHandle,
    pid: i32,
}

impl CgroupSampleSource {
    pub fn new(
        platform: Arc<dyn Platform>,
        cgroups: Arc<CgroupManager>,
        gpus: Arc<GpuManager>,
        job_id: JobId,
        handle: CgroupHandle,
        pid: i32,
    ) -> Self {
        Self {
            platform,
            cgroups,
            gpus,
            job_id,
            handle,
            pid,
        }
    }

    fn proc_dir(&self) -> PathBuf {
        PathBuf::from("/proc").join(self.pid.to_string())
    }

    fn process_stats(&self) -> ProcessStats {
        let mut stats = ProcessStats::default();
        if let Ok(status) = self
            .platform
            .read_to_string(&self.proc_dir().join("status"))
        {
            stats.threads = status
                .lines()
                .find_map(|line| line.strip_prefix("Threads:"))
                .and_then(|rest| rest.trim().parse().ok())
                .unwrap_or(0);
        }
        if let Ok(fds) = self.platform.list_dir(&self.proc_dir().join("fd")) {
            stats.open_fds = fds.len() as u64;
        }
        stats
    }

    /// Interface totals as seen from inside the job's network namespace;
    /// `/proc/<pid>/net/dev` reads through to it. Loopback is excluded.
    fn network_stats(&self) -> Option<NetworkStats> {
        let text = self
            .platform
            .read_to_string(&self.proc_dir().join("net/dev"))
            .ok()?;
        let mut stats = NetworkStats::default();
        let mut seen = false;
        for line in text.lines().skip(2) {
            let (name, rest) = line.split_once(':')?;
            if name.trim() == "lo" {
                continue;
            }
            let fields: Vec<u64> = rest
                .split_whitespace()
                .filter_map(|f| f.parse().ok())
                .collect();
            if fields.len() >= 9 {
                stats.rx_bytes += fields[0];
                stats.tx_bytes += fields[8];
                seen = true;
            }
        }
        seen.then_some(stats)
    }
}

impl SampleSource for CgroupSampleSource {
    fn sample(&self) -> Result<MetricsSample> {
        let raw = self.cgroups.sample(&self.handle)?;
        let allocated = self.gpus.allocation(&self.job_id);
        let gpu = if allocated.is_empty() {
            Vec::new()
        } else {
            self.gpus
                .stats()
                .into_iter()
                .filter(|g| allocated.contains(&g.index))
                .collect()
        };

        Ok(MetricsSample {
            job_id: self.job_id,
            timestamp: Utc::now(),
            interval_secs: 0.0,
            cpu: raw.cpu,
            memory: raw.memory,
            io: raw.io,
            pids: raw.pids,
            process: self.process_stats(),
            pressure: raw.pressure,
            network: self.network_stats(),
            gpu,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use joblet_platform::LinuxPlatform;
    use tempfile::TempDir;

    #[test]
    fn own_process_stats_are_readable() {
        let dir = TempDir::new().unwrap();
        let platform: Arc<dyn Platform> = Arc::new(LinuxPlatform::new());
        let cgroups = Arc::new(CgroupManager::new(
            platform.clone(),
            dir.path().to_path_buf(),
        ));
        let handle = cgroups.create(&JobId::new()).unwrap();
        let source = CgroupSampleSource::new(
            platform.clone(),
            cgroups,
            Arc::new(GpuManager::new(
                platform,
                std::time::Duration::from_secs(2),
            )),
            JobId::new(),
            handle,
            std::process::id() as i32,
        );
        let stats = source.process_stats();
        assert!(stats.threads >= 1);
        assert!(stats.open_fds >= 1);

        // The empty cgroup samples to zeros rather than failing.
        let sample = source.sample().unwrap();
        assert_eq!(sample.cpu.usage_usec, 0);
    }
}
