//! Per-job metrics collection and publication.
//!
//! Each running job gets one collector task. Every tick it pulls cumulative
//! counters from its [`SampleSource`], derives rates from the previous
//! sample and the elapsed monotonic time, and publishes the result three
//! ways: a gzip NDJSON file under the metrics root, a broadcast channel for
//! live subscribers (lagging receivers lose oldest samples, never block the
//! collector), and the optional IPC sink.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_compression::tokio::write::GzipEncoder;
use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

use joblet_core::events::MetricsSample;
use joblet_core::{Error, JobId, Result};
use joblet_platform::Platform;

use crate::sink::IpcSink;

/// Capacity of each job's live metrics channel; lagging subscribers drop the
/// oldest samples.
const BROADCAST_CAPACITY: usize = 256;

/// Where a collector gets its raw numbers. Implementations read the job's
/// cgroup, `/proc/<pid>`, and the shared GPU cache; all counters are
/// cumulative and the collector handles differencing.
pub trait SampleSource: Send + Sync {
    fn sample(&self) -> Result<MetricsSample>;
}

/// Registry of live metrics streams.
pub struct MetricsHub {
    platform: Arc<dyn Platform>,
    metrics_dir: PathBuf,
    channels: Mutex<HashMap<JobId, broadcast::Sender<MetricsSample>>>,
    sink: Option<IpcSink>,
}

impl MetricsHub {
    pub fn new(platform: Arc<dyn Platform>, metrics_dir: PathBuf, sink: Option<IpcSink>) -> Self {
        Self {
            platform,
            metrics_dir,
            channels: Mutex::new(HashMap::new()),
            sink,
        }
    }

    /// Live samples for a running job.
    pub fn subscribe(&self, job_id: &JobId) -> Result<broadcast::Receiver<MetricsSample>> {
        self.channels
            .lock()
            .unwrap()
            .get(job_id)
            .map(|tx| tx.subscribe())
            .ok_or_else(|| Error::NotFound(format!("no live metrics for job {job_id}")))
    }

    /// Delete a job's persisted metrics directory.
    pub fn delete(&self, job_id: &JobId) -> Result<()> {
        let dir = self.metrics_dir.join(job_id.to_string());
        if self.platform.exists(&dir) {
            self.platform.remove_dir_all(&dir)?;
        }
        Ok(())
    }

    fn register(&self, job_id: JobId) -> broadcast::Sender<MetricsSample> {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        self.channels.lock().unwrap().insert(job_id, tx.clone());
        tx
    }

    fn unregister(&self, job_id: &JobId) {
        self.channels.lock().unwrap().remove(job_id);
    }
}

/// Handle to stop a running collector. Dropping it also stops collection.
pub struct MetricsCollector {
    stop: watch::Sender<bool>,
}

impl MetricsCollector {
    /// Launch the collector task for one job.
    pub fn spawn(
        hub: Arc<MetricsHub>,
        job_id: JobId,
        source: Arc<dyn SampleSource>,
        interval: Duration,
    ) -> Self {
        let (stop, stop_rx) = watch::channel(false);
        tokio::spawn(collect_task(hub, job_id, source, interval, stop_rx));
        Self { stop }
    }

    /// Stop collection. The task takes one final sample, flushes, and closes
    /// the live channel, which is the terminal signal to subscribers.
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }
}

async fn collect_task(
    hub: Arc<MetricsHub>,
    job_id: JobId,
    source: Arc<dyn SampleSource>,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let tx = hub.register(job_id);

    let dir = hub.metrics_dir.join(job_id.to_string());
    if let Err(err) = hub.platform.create_dir_all(&dir) {
        warn!(job_id = %job_id, error = %err, "Metrics dir creation failed");
        hub.unregister(&job_id);
        return;
    }
    let path = dir.join(format!("{}.ndjson.gz", Utc::now().format("%Y%m%dT%H%M%SZ")));
    let file = match tokio::fs::File::create(&path).await {
        Ok(file) => file,
        Err(err) => {
            warn!(job_id = %job_id, error = %err, "Metrics file creation failed");
            hub.unregister(&job_id);
            return;
        }
    };
    let mut encoder = GzipEncoder::new(file);

    let mut previous: Option<(Instant, MetricsSample)> = None;
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        let stopping = tokio::select! {
            _ = ticker.tick() => false,
            _ = stop.changed() => true,
        };

        match source.sample() {
            Ok(raw) => {
                let now = Instant::now();
                let sample = derive_rates(raw, &previous, now);
                if let Err(err) = write_line(&mut encoder, &sample).await {
                    warn!(job_id = %job_id, error = %err, "Metrics write failed");
                }
                let _ = tx.send(sample.clone());
                if let Some(sink) = &hub.sink {
                    sink.forward_metrics(&sample);
                }
                previous = Some((now, sample));
            }
            Err(err) => {
                // The cgroup may already be gone on the last tick.
                debug!(job_id = %job_id, error = %err, "Metrics sample failed");
            }
        }

        if stopping {
            break;
        }
    }

    if let Err(err) = encoder.shutdown().await {
        warn!(job_id = %job_id, error = %err, "Metrics file finalize failed");
    }
    hub.unregister(&job_id);
    debug!(job_id = %job_id, "Metrics collection stopped");
}

async fn write_line(
    encoder: &mut GzipEncoder<tokio::fs::File>,
    sample: &MetricsSample,
) -> Result<()> {
    let mut line = serde_json::to_vec(sample)
        .map_err(|e| Error::Internal(format!("encoding metrics sample: {e}")))?;
    line.push(b'\n');
    encoder.write_all(&line).await?;
    encoder.flush().await?;
    Ok(())
}

/// Fill in the rate and percent fields from the previous sample.
fn derive_rates(
    mut sample: MetricsSample,
    previous: &Option<(Instant, MetricsSample)>,
    now: Instant,
) -> MetricsSample {
    sample.timestamp = Utc::now();
    let Some((prev_at, prev)) = previous else {
        sample.interval_secs = 0.0;
        return sample;
    };
    let elapsed = now.duration_since(*prev_at).as_secs_f64();
    sample.interval_secs = elapsed;
    if elapsed <= f64::EPSILON {
        return sample;
    }

    let cpu_delta = sample.cpu.usage_usec.saturating_sub(prev.cpu.usage_usec);
    sample.cpu.percent = (cpu_delta as f64 / (elapsed * 1_000_000.0)) * 100.0;

    if sample.memory.max_bytes != u64::MAX && sample.memory.max_bytes > 0 {
        sample.memory.percent =
            (sample.memory.current_bytes as f64 / sample.memory.max_bytes as f64) * 100.0;
    }

    sample.io.read_bps =
        sample.io.read_bytes.saturating_sub(prev.io.read_bytes) as f64 / elapsed;
    sample.io.write_bps =
        sample.io.write_bytes.saturating_sub(prev.io.write_bytes) as f64 / elapsed;

    if let (Some(net), Some(prev_net)) = (&mut sample.network, &prev.network) {
        net.rx_bps = net.rx_bytes.saturating_sub(prev_net.rx_bytes) as f64 / elapsed;
        net.tx_bps = net.tx_bytes.saturating_sub(prev_net.tx_bytes) as f64 / elapsed;
    }

    sample
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use joblet_core::events::{CpuStats, IoStats};
    use joblet_platform::LinuxPlatform;
    use std::io::Read as _;
    use tempfile::TempDir;

    struct CountingSource {
        ticks: Mutex<u64>,
    }

    impl SampleSource for CountingSource {
        fn sample(&self) -> Result<MetricsSample> {
            let mut ticks = self.ticks.lock().unwrap();
            *ticks += 1;
            let t = *ticks;
            Ok(MetricsSample {
                job_id: JobId::new(),
                timestamp: Utc::now(),
                interval_secs: 0.0,
                cpu: CpuStats {
                    usage_usec: t * 100_000,
                    ..CpuStats::default()
                },
                memory: Default::default(),
                io: IoStats {
                    read_bytes: t * 4096,
                    ..IoStats::default()
                },
                pids: Default::default(),
                process: Default::default(),
                pressure: None,
                network: None,
                gpu: Vec::new(),
            })
        }
    }

    #[test]
    fn rates_derive_from_consecutive_samples() {
        let t0 = Instant::now();
        let mut first = MetricsSample {
            job_id: JobId::new(),
            timestamp: Utc::now(),
            interval_secs: 0.0,
            cpu: CpuStats {
                usage_usec: 1_000_000,
                ..CpuStats::default()
            },
            memory: Default::default(),
            io: IoStats {
                read_bytes: 0,
                ..IoStats::default()
            },
            pids: Default::default(),
            process: Default::default(),
            pressure: None,
            network: None,
            gpu: Vec::new(),
        };
        first.memory.max_bytes = u64::MAX;
        let prev = Some((t0, first.clone()));

        let mut second = first.clone();
        second.cpu.usage_usec = 2_000_000;
        second.io.read_bytes = 1_000_000;
        let derived = derive_rates(second, &prev, t0 + Duration::from_secs(2));

        assert_eq!(derived.interval_secs, 2.0);
        // One extra CPU-second over two wall seconds is 50% of a core.
        assert!((derived.cpu.percent - 50.0).abs() < 0.01);
        assert!((derived.io.read_bps - 500_000.0).abs() < 0.01);
    }

    #[test]
    fn first_sample_has_no_rates() {
        let sample = MetricsSample {
            job_id: JobId::new(),
            timestamp: Utc::now(),
            interval_secs: 99.0,
            cpu: Default::default(),
            memory: Default::default(),
            io: Default::default(),
            pids: Default::default(),
            process: Default::default(),
            pressure: None,
            network: None,
            gpu: Vec::new(),
        };
        let derived = derive_rates(sample, &None, Instant::now());
        assert_eq!(derived.interval_secs, 0.0);
        assert_eq!(derived.cpu.percent, 0.0);
    }

    #[tokio::test]
    async fn collector_persists_gzipped_ndjson() {
        let dir = TempDir::new().unwrap();
        let hub = Arc::new(MetricsHub::new(
            Arc::new(LinuxPlatform::new()),
            dir.path().to_path_buf(),
            None,
        ));
        let job_id = JobId::new();
        let collector = MetricsCollector::spawn(
            hub.clone(),
            job_id,
            Arc::new(CountingSource {
                ticks: Mutex::new(0),
            }),
            Duration::from_millis(10),
        );
        let mut rx = hub.subscribe(&job_id).unwrap();
        // At least two live samples arrive.
        rx.recv().await.unwrap();
        rx.recv().await.unwrap();
        collector.stop();
        // The channel closing is the terminal signal.
        loop {
            match rx.recv().await {
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }

        let job_dir = dir.path().join(job_id.to_string());
        let file = std::fs::read_dir(&job_dir).unwrap().next().unwrap().unwrap();
        let raw = std::fs::read(file.path()).unwrap();
        let mut text = String::new();
        GzDecoder::new(raw.as_slice())
            .read_to_string(&mut text)
            .unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines.len() >= 2);
        for line in lines {
            let parsed: MetricsSample = serde_json::from_str(line).unwrap();
            assert!(parsed.cpu.usage_usec > 0);
        }
    }

    #[tokio::test]
    async fn subscribe_requires_a_live_collector() {
        let dir = TempDir::new().unwrap();
        let hub = MetricsHub::new(Arc::new(LinuxPlatform::new()), dir.path().to_path_buf(), None);
        assert!(hub.subscribe(&JobId::new()).is_err());
    }
}
