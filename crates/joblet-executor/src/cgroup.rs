//! Cgroup v2 management for jobs.
//!
//! Each job owns one cgroup directory, `job-<uuid>`, under the daemon's
//! delegated subtree. The job's init PID is attached before it execs and is
//! the root member; everything the job forks stays inside.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use joblet_core::events::{CpuStats, IoStats, MemoryStats, PidStats, PressureStats};
use joblet_core::{Error, JobId, ResourceLimits, Result};
use joblet_platform::Platform;

/// CPU bandwidth period written to `cpu.max`, in microseconds.
const CPU_PERIOD_USEC: u64 = 100_000;

/// Attempts to remove a still-busy cgroup before giving up.
const DESTROY_RETRIES: u32 = 5;

/// Opaque handle to one job's cgroup directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgroupHandle {
    path: PathBuf,
}

impl CgroupHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }
}

/// Raw counters read from one cgroup. Rates and percentages are derived by
/// the metrics collector from consecutive samples.
#[derive(Debug, Clone, Default)]
pub struct RawSample {
    pub cpu: CpuStats,
    pub memory: MemoryStats,
    pub io: IoStats,
    pub pids: PidStats,
    /// None on kernels without PSI.
    pub pressure: Option<PressureStats>,
}

pub struct CgroupManager {
    platform: Arc<dyn Platform>,
    subtree: PathBuf,
}

impl CgroupManager {
    pub fn new(platform: Arc<dyn Platform>, subtree: PathBuf) -> Self {
        Self { platform, subtree }
    }

    /// Enable the controllers jobs need on the delegated subtree. Called once
    /// at daemon startup.
    pub fn ensure_controllers(&self) -> Result<()> {
        self.platform.create_dir_all(&self.subtree)?;
        let control = self.subtree.join("cgroup.subtree_control");
        self.platform
            .write(&control, b"+cpu +memory +io +pids +cpuset")
            .map_err(|e| {
                Error::ResourceExhausted(format!("enabling cgroup controllers: {e}"))
            })?;
        Ok(())
    }

    /// Create the cgroup for a job. Fails the job before any process exists.
    pub fn create(&self, id: &JobId) -> Result<CgroupHandle> {
        let path = self.subtree.join(format!("job-{id}"));
        if self.platform.exists(&path) {
            return Err(Error::ResourceExhausted(format!(
                "cgroup for job {id} already exists"
            )));
        }
        self.platform
            .create_dir_all(&path)
            .map_err(|e| Error::ResourceExhausted(format!("creating cgroup: {e}")))?;
        debug!(job_id = %id, path = %path.display(), "Created cgroup");
        Ok(CgroupHandle { path })
    }

    /// Write the job's limits. On failure the caller destroys the cgroup.
    pub fn apply_limits(&self, handle: &CgroupHandle, limits: &ResourceLimits) -> Result<()> {
        let cpu_max = if limits.max_cpu_percent == 0 {
            format!("max {CPU_PERIOD_USEC}")
        } else {
            let quota = u64::from(limits.max_cpu_percent) * CPU_PERIOD_USEC / 100;
            format!("{quota} {CPU_PERIOD_USEC}")
        };
        self.platform
            .write(&handle.file("cpu.max"), cpu_max.as_bytes())?;

        let memory_max = if limits.max_memory_mb == 0 {
            "max".to_string()
        } else {
            (limits.max_memory_mb * 1024 * 1024).to_string()
        };
        self.platform
            .write(&handle.file("memory.max"), memory_max.as_bytes())?;

        if limits.max_io_bps > 0 {
            for device in self.block_devices()? {
                let line = format!(
                    "{device} rbps={bps} wbps={bps}",
                    bps = limits.max_io_bps
                );
                self.platform
                    .write(&handle.file("io.max"), line.as_bytes())?;
            }
        }

        if let Some(cores) = &limits.cpu_cores {
            if !cores.is_empty() {
                self.platform
                    .write(&handle.file("cpuset.cpus"), cores.as_bytes())?;
            }
        }
        Ok(())
    }

    /// Attach a PID. The target must still be parked pre-exec; the plan pipe
    /// handshake guarantees that.
    pub fn attach(&self, handle: &CgroupHandle, pid: i32) -> Result<()> {
        self.platform
            .write(&handle.file("cgroup.procs"), pid.to_string().as_bytes())
    }

    /// Suspend every task in the cgroup.
    pub fn freeze(&self, handle: &CgroupHandle) -> Result<()> {
        self.platform.write(&handle.file("cgroup.freeze"), b"1")
    }

    pub fn thaw(&self, handle: &CgroupHandle) -> Result<()> {
        self.platform.write(&handle.file("cgroup.freeze"), b"0")
    }

    /// Whether any task is still attached.
    pub fn is_empty(&self, handle: &CgroupHandle) -> bool {
        match self.platform.read_to_string(&handle.file("cgroup.procs")) {
            Ok(procs) => procs.trim().is_empty(),
            Err(_) => true,
        }
    }

    /// Read the current counters. Missing files (PSI disabled, controller
    /// not enabled) degrade to zeros rather than failing the sample.
    pub fn sample(&self, handle: &CgroupHandle) -> Result<RawSample> {
        let mut sample = RawSample::default();

        if let Ok(cpu_stat) = self.platform.read_to_string(&handle.file("cpu.stat")) {
            let fields = parse_kv(&cpu_stat);
            sample.cpu.usage_usec = fields.get("usage_usec").copied().unwrap_or(0);
            sample.cpu.user_usec = fields.get("user_usec").copied().unwrap_or(0);
            sample.cpu.system_usec = fields.get("system_usec").copied().unwrap_or(0);
            sample.cpu.throttled_usec = fields.get("throttled_usec").copied().unwrap_or(0);
            sample.cpu.nr_throttled = fields.get("nr_throttled").copied().unwrap_or(0);
        }

        sample.memory.current_bytes = self.read_u64_or_zero(&handle.file("memory.current"));
        sample.memory.max_bytes = self.read_limit(&handle.file("memory.max"));
        if let Ok(memory_stat) = self.platform.read_to_string(&handle.file("memory.stat")) {
            let fields = parse_kv(&memory_stat);
            sample.memory.anon_bytes = fields.get("anon").copied().unwrap_or(0);
            sample.memory.file_bytes = fields.get("file").copied().unwrap_or(0);
        }
        if let Ok(memory_events) = self.platform.read_to_string(&handle.file("memory.events")) {
            sample.memory.oom_kills = parse_kv(&memory_events)
                .get("oom_kill")
                .copied()
                .unwrap_or(0);
        }

        if let Ok(io_stat) = self.platform.read_to_string(&handle.file("io.stat")) {
            for line in io_stat.lines() {
                let fields = parse_kv_pairs(line);
                sample.io.read_bytes += fields.get("rbytes").copied().unwrap_or(0);
                sample.io.write_bytes += fields.get("wbytes").copied().unwrap_or(0);
                sample.io.read_ops += fields.get("rios").copied().unwrap_or(0);
                sample.io.write_ops += fields.get("wios").copied().unwrap_or(0);
            }
        }

        sample.pids.current = self.read_u64_or_zero(&handle.file("pids.current"));
        sample.pids.max = self.read_limit(&handle.file("pids.max"));

        sample.pressure = self.read_pressure(handle);

        Ok(sample)
    }

    /// PSI averages, if the kernel exposes them.
    fn read_pressure(&self, handle: &CgroupHandle) -> Option<PressureStats> {
        let cpu = self.platform.read_to_string(&handle.file("cpu.pressure")).ok()?;
        let mut pressure = PressureStats {
            cpu_some_avg10: psi_avg10(&cpu, "some").unwrap_or(0.0),
            ..PressureStats::default()
        };
        if let Ok(memory) = self.platform.read_to_string(&handle.file("memory.pressure")) {
            pressure.memory_some_avg10 = psi_avg10(&memory, "some").unwrap_or(0.0);
            pressure.memory_full_avg10 = psi_avg10(&memory, "full").unwrap_or(0.0);
        }
        if let Ok(io) = self.platform.read_to_string(&handle.file("io.pressure")) {
            pressure.io_some_avg10 = psi_avg10(&io, "some").unwrap_or(0.0);
            pressure.io_full_avg10 = psi_avg10(&io, "full").unwrap_or(0.0);
        }
        Some(pressure)
    }

    /// Remove the cgroup. Waits briefly for emptiness and retries EBUSY; a
    /// leaked cgroup is logged and recoverable, so persistent failure is
    /// reported but callers treat it as non-fatal.
    pub fn destroy(&self, handle: &CgroupHandle) -> Result<()> {
        if !self.platform.exists(&handle.path) {
            return Ok(());
        }
        let mut last_err = None;
        for attempt in 0..DESTROY_RETRIES {
            if !self.is_empty(handle) {
                std::thread::sleep(Duration::from_millis(50 << attempt));
                continue;
            }
            match self.platform.remove_dir(&handle.path) {
                Ok(()) => return Ok(()),
                Err(err) => {
                    // Already gone is fine; EBUSY and the rest get retried.
                    if err.errno() == Some(libc::ENOENT) {
                        return Ok(());
                    }
                    last_err = Some(err);
                    std::thread::sleep(Duration::from_millis(50 << attempt));
                }
            }
        }
        let err = last_err
            .unwrap_or_else(|| Error::Timeout(format!("cgroup {} never emptied", handle.path.display())));
        warn!(path = %handle.path.display(), error = %err, "Leaking cgroup");
        Err(err)
    }

    fn read_u64_or_zero(&self, path: &Path) -> u64 {
        self.platform
            .read_to_string(path)
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0)
    }

    /// Parse a limit file where `max` means unlimited.
    fn read_limit(&self, path: &Path) -> u64 {
        match self.platform.read_to_string(path) {
            Ok(s) if s.trim() == "max" => u64::MAX,
            Ok(s) => s.trim().parse().unwrap_or(u64::MAX),
            Err(_) => u64::MAX,
        }
    }

    /// Enumerate `MAJ:MIN` identifiers of real block devices for io.max.
    fn block_devices(&self) -> Result<Vec<String>> {
        let sys_block = Path::new("/sys/block");
        if !self.platform.exists(sys_block) {
            return Ok(Vec::new());
        }
        let mut devices = Vec::new();
        for entry in self.platform.list_dir(sys_block)? {
            let name = entry
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            // Loopback and ramdisks don't take io limits.
            if name.starts_with("loop") || name.starts_with("ram") {
                continue;
            }
            if let Ok(dev) = self.platform.read_to_string(&entry.join("dev")) {
                devices.push(dev.trim().to_string());
            }
        }
        Ok(devices)
    }
}

/// Pull the avg10 value out of one PSI line, e.g.
/// `some avg10=0.12 avg60=0.05 avg300=0.01 total=123456`.
fn psi_avg10(text: &str, kind: &str) -> Option<f64> {
    text.lines()
        .find(|line| line.starts_with(kind))?
        .split_whitespace()
        .find_map(|field| field.strip_prefix("avg10="))?
        .parse()
        .ok()
}

/// Parse "key value" lines into a map.
fn parse_kv(text: &str) -> std::collections::HashMap<&str, u64> {
    text.lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let key = parts.next()?;
            let value = parts.next()?.parse().ok()?;
            Some((key, value))
        })
        .collect()
}

/// Parse "k1=v1 k2=v2" pairs from one io.stat line.
fn parse_kv_pairs(line: &str) -> std::collections::HashMap<&str, u64> {
    line.split_whitespace()
        .filter_map(|field| {
            let (key, value) = field.split_once('=')?;
            Some((key, value.parse().ok()?))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use joblet_platform::LinuxPlatform;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> CgroupManager {
        CgroupManager::new(
            Arc::new(LinuxPlatform::new()),
            dir.path().join("joblet.service"),
        )
    }

    #[test]
    fn create_and_destroy() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        let id = JobId::new();
        let handle = mgr.create(&id).unwrap();
        assert!(handle.path().ends_with(format!("job-{id}")));
        assert!(handle.path().is_dir());
        mgr.destroy(&handle).unwrap();
        assert!(!handle.path().exists());
    }

    #[test]
    fn duplicate_create_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        let id = JobId::new();
        mgr.create(&id).unwrap();
        assert!(matches!(
            mgr.create(&id),
            Err(Error::ResourceExhausted(_))
        ));
    }

    #[test]
    fn destroy_tolerates_missing_cgroup() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        let handle = CgroupHandle {
            path: dir.path().join("joblet.service/job-gone"),
        };
        mgr.destroy(&handle).unwrap();
    }

    #[test]
    fn limits_written_in_kernel_format() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        let handle = mgr.create(&JobId::new()).unwrap();
        let limits = ResourceLimits {
            max_cpu_percent: 150,
            max_memory_mb: 512,
            max_io_bps: 0,
            cpu_cores: Some("0-3".into()),
            gpu: None,
        };
        mgr.apply_limits(&handle, &limits).unwrap();
        let cpu = std::fs::read_to_string(handle.file("cpu.max")).unwrap();
        assert_eq!(cpu, "150000 100000");
        let memory = std::fs::read_to_string(handle.file("memory.max")).unwrap();
        assert_eq!(memory, (512u64 * 1024 * 1024).to_string());
        let cpuset = std::fs::read_to_string(handle.file("cpuset.cpus")).unwrap();
        assert_eq!(cpuset, "0-3");
    }

    #[test]
    fn unlimited_limits_write_max() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        let handle = mgr.create(&JobId::new()).unwrap();
        mgr.apply_limits(&handle, &ResourceLimits::default()).unwrap();
        let cpu = std::fs::read_to_string(handle.file("cpu.max")).unwrap();
        assert_eq!(cpu, "max 100000");
        let memory = std::fs::read_to_string(handle.file("memory.max")).unwrap();
        assert_eq!(memory, "max");
    }

    #[test]
    fn sample_parses_stat_files() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        let handle = mgr.create(&JobId::new()).unwrap();
        std::fs::write(
            handle.file("cpu.stat"),
            "usage_usec 250000\nuser_usec 150000\nsystem_usec 100000\nnr_throttled 2\nthrottled_usec 1234\n",
        )
        .unwrap();
        std::fs::write(handle.file("memory.current"), "1048576\n").unwrap();
        std::fs::write(handle.file("memory.max"), "max\n").unwrap();
        std::fs::write(handle.file("memory.stat"), "anon 4096\nfile 8192\n").unwrap();
        std::fs::write(handle.file("memory.events"), "low 0\noom_kill 1\n").unwrap();
        std::fs::write(
            handle.file("io.stat"),
            "8:0 rbytes=1000 wbytes=2000 rios=10 wios=20 dbytes=0 dios=0\n8:16 rbytes=500 wbytes=0 rios=5 wios=0 dbytes=0 dios=0\n",
        )
        .unwrap();
        std::fs::write(handle.file("pids.current"), "3\n").unwrap();
        std::fs::write(handle.file("pids.max"), "max\n").unwrap();

        let sample = mgr.sample(&handle).unwrap();
        assert_eq!(sample.cpu.usage_usec, 250_000);
        assert_eq!(sample.cpu.throttled_usec, 1_234);
        assert_eq!(sample.memory.current_bytes, 1_048_576);
        assert_eq!(sample.memory.max_bytes, u64::MAX);
        assert_eq!(sample.memory.oom_kills, 1);
        assert_eq!(sample.io.read_bytes, 1_500);
        assert_eq!(sample.io.write_bytes, 2_000);
        assert_eq!(sample.pids.current, 3);
        assert_eq!(sample.pids.max, u64::MAX);
    }

    #[test]
    fn sample_tolerates_missing_files() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        let handle = mgr.create(&JobId::new()).unwrap();
        let sample = mgr.sample(&handle).unwrap();
        assert_eq!(sample.cpu.usage_usec, 0);
        assert_eq!(sample.memory.max_bytes, u64::MAX);
        // No PSI files on this "kernel".
        assert!(sample.pressure.is_none());
    }

    #[test]
    fn pressure_files_are_parsed_when_present() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        let handle = mgr.create(&JobId::new()).unwrap();
        std::fs::write(
            handle.file("cpu.pressure"),
            "some avg10=1.50 avg60=0.80 avg300=0.20 total=123456\n",
        )
        .unwrap();
        std::fs::write(
            handle.file("memory.pressure"),
            "some avg10=0.25 avg60=0.10 avg300=0.00 total=99\nfull avg10=0.10 avg60=0.00 avg300=0.00 total=12\n",
        )
        .unwrap();
        let sample = mgr.sample(&handle).unwrap();
        let pressure = sample.pressure.unwrap();
        assert_eq!(pressure.cpu_some_avg10, 1.5);
        assert_eq!(pressure.memory_some_avg10, 0.25);
        assert_eq!(pressure.memory_full_avg10, 0.1);
        assert_eq!(pressure.io_some_avg10, 0.0);
    }
}
