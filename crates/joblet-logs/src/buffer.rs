//! The per-job backlog and its overflow policies.
//!
//! Chunks queue here between the reader thread and the writer task. Offsets
//! are assigned at push time and are strictly increasing for the life of the
//! job. When the backlog hits its chunk capacity (or the process-wide byte
//! cap), the configured policy makes room; only the alert policy ever
//! refuses a chunk.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tracing::warn;

use joblet_config::system::{LogConfig, OverflowPolicy};
use joblet_core::events::LogChunk;
use joblet_core::{Error, JobId, Result};
use joblet_platform::Platform;

/// One queued run of output. Compressed and spilled segments hold many
/// logical chunks that were folded together under pressure.
enum Segment {
    Plain(LogChunk),
    Gzip {
        first_offset: u64,
        compressed: Vec<u8>,
    },
    Spill {
        first_offset: u64,
        path: PathBuf,
    },
}

pub struct Backlog {
    job_id: JobId,
    segments: VecDeque<Segment>,
    /// Plain (uncompressed, unspilled) chunks currently queued.
    plain_chunks: usize,
    plain_bytes: u64,
    next_offset: u64,
    policy: OverflowPolicy,
    capacity: usize,
    sample_every: usize,
    spill_dir: PathBuf,
    spill_seq: usize,
    /// Shared byte counter across every job's backlog.
    total_bytes: Arc<AtomicU64>,
    total_cap: u64,
    /// Chunks refused or discarded by the policy, for operator visibility.
    pub dropped_chunks: u64,
}

impl Backlog {
    pub fn new(
        job_id: JobId,
        config: &LogConfig,
        spill_dir: PathBuf,
        total_bytes: Arc<AtomicU64>,
    ) -> Self {
        Self {
            job_id,
            segments: VecDeque::new(),
            plain_chunks: 0,
            plain_bytes: 0,
            next_offset: 0,
            policy: config.overflow_policy,
            capacity: config.queue_capacity,
            sample_every: config.sample_every.max(1),
            spill_dir,
            spill_seq: 0,
            total_bytes,
            total_cap: config.total_buffer_bytes,
            dropped_chunks: 0,
        }
    }

    pub fn next_offset(&self) -> u64 {
        self.next_offset
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Queue one chunk of output. Under pressure the policy reshapes the
    /// queue first; the alert policy instead reports the overflow and the
    /// caller decides whether to retry.
    pub fn push(&mut self, platform: &dyn Platform, bytes: Bytes) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        if self.under_pressure() {
            match self.policy {
                OverflowPolicy::Compress => self.compress_in_place()?,
                OverflowPolicy::Spill => self.spill(platform)?,
                OverflowPolicy::Sample => self.sample_down(),
                OverflowPolicy::Alert => {
                    self.dropped_chunks += 1;
                    return Err(Error::ResourceExhausted(format!(
                        "log queue for job {} is full",
                        self.job_id
                    )));
                }
            }
        }

        let len = bytes.len() as u64;
        let chunk = LogChunk::new(self.next_offset, bytes);
        self.next_offset += len;
        self.plain_chunks += 1;
        self.plain_bytes += len;
        self.total_bytes.fetch_add(len, Ordering::Relaxed);
        self.segments.push_back(Segment::Plain(chunk));
        Ok(())
    }

    /// Decode the whole queue, in order, into deliverable chunks. Folded
    /// segments come back as one chunk carrying their first offset.
    pub fn drain(&mut self, platform: &dyn Platform) -> Result<Vec<LogChunk>> {
        let mut chunks = Vec::with_capacity(self.segments.len());
        for segment in self.segments.drain(..) {
            match segment {
                Segment::Plain(chunk) => chunks.push(chunk),
                Segment::Gzip {
                    first_offset,
                    compressed,
                } => {
                    let mut decoder = GzDecoder::new(compressed.as_slice());
                    let mut out = Vec::new();
                    decoder
                        .read_to_end(&mut out)
                        .map_err(|e| Error::Internal(format!("inflating log backlog: {e}")))?;
                    chunks.push(LogChunk::new(first_offset, Bytes::from(out)));
                }
                Segment::Spill { first_offset, path } => {
                    let data = platform.read(&path)?;
                    let _ = platform.remove_file(&path);
                    chunks.push(LogChunk::new(first_offset, Bytes::from(data)));
                }
            }
        }
        self.total_bytes
            .fetch_sub(self.plain_bytes, Ordering::Relaxed);
        self.plain_chunks = 0;
        self.plain_bytes = 0;
        Ok(chunks)
    }

    fn under_pressure(&self) -> bool {
        self.plain_chunks >= self.capacity
            || self.total_bytes.load(Ordering::Relaxed) >= self.total_cap
    }

    /// Fold every queued plain chunk into one gzip segment.
    fn compress_in_place(&mut self) -> Result<()> {
        let (first_offset, payload) = self.take_plain();
        if payload.is_empty() {
            return Ok(());
        }
        let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
        encoder
            .write_all(&payload)
            .and_then(|_| encoder.finish())
            .map(|compressed| {
                self.segments.push_back(Segment::Gzip {
                    first_offset,
                    compressed,
                });
            })
            .map_err(|e| Error::Internal(format!("compressing log backlog: {e}")))
    }

    /// Move the queued plain chunks to a sidecar file.
    fn spill(&mut self, platform: &dyn Platform) -> Result<()> {
        let (first_offset, payload) = self.take_plain();
        if payload.is_empty() {
            return Ok(());
        }
        platform.create_dir_all(&self.spill_dir)?;
        let path = self
            .spill_dir
            .join(format!("{}.spill-{}", self.job_id, self.spill_seq));
        self.spill_seq += 1;
        platform.write(&path, &payload)?;
        self.segments.push_back(Segment::Spill { first_offset, path });
        Ok(())
    }

    /// Keep every Nth plain chunk, drop the rest. Offsets stay strictly
    /// increasing; they just grow sparse.
    fn sample_down(&mut self) {
        let every = self.sample_every;
        let mut index = 0usize;
        let mut kept_bytes = 0u64;
        let mut kept_chunks = 0usize;
        let mut dropped = 0u64;
        let segments = std::mem::take(&mut self.segments);
        self.segments = segments
            .into_iter()
            .filter(|segment| match segment {
                Segment::Plain(chunk) => {
                    let keep = index % every == 0;
                    index += 1;
                    if keep {
                        kept_bytes += chunk.len() as u64;
                        kept_chunks += 1;
                    } else {
                        dropped += 1;
                    }
                    keep
                }
                _ => true,
            })
            .collect();
        self.total_bytes
            .fetch_sub(self.plain_bytes - kept_bytes, Ordering::Relaxed);
        self.plain_bytes = kept_bytes;
        self.plain_chunks = kept_chunks;
        self.dropped_chunks += dropped;
        warn!(job_id = %self.job_id, dropped, "Sampled log backlog under pressure");
    }

    /// Remove and concatenate every plain segment, returning the first
    /// offset of the run.
    fn take_plain(&mut self) -> (u64, Vec<u8>) {
        let mut first_offset = None;
        let mut payload = Vec::with_capacity(self.plain_bytes as usize);
        let segments = std::mem::take(&mut self.segments);
        for segment in segments {
            match segment {
                Segment::Plain(chunk) => {
                    first_offset.get_or_insert(chunk.offset);
                    payload.extend_from_slice(&chunk.bytes);
                }
                other => self.segments.push_back(other),
            }
        }
        self.total_bytes
            .fetch_sub(self.plain_bytes, Ordering::Relaxed);
        self.plain_bytes = 0;
        self.plain_chunks = 0;
        (first_offset.unwrap_or(self.next_offset), payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use joblet_platform::LinuxPlatform;
    use tempfile::TempDir;

    fn backlog(dir: &TempDir, policy: OverflowPolicy, capacity: usize) -> Backlog {
        let config = LogConfig {
            queue_capacity: capacity,
            overflow_policy: policy,
            sample_every: 2,
            ..LogConfig::default()
        };
        Backlog::new(
            JobId::new(),
            &config,
            dir.path().to_path_buf(),
            Arc::new(AtomicU64::new(0)),
        )
    }

    fn drained_payload(backlog: &mut Backlog) -> Vec<u8> {
        let platform = LinuxPlatform::new();
        backlog
            .drain(&platform)
            .unwrap()
            .into_iter()
            .flat_map(|c| c.bytes.to_vec())
            .collect()
    }

    #[test]
    fn offsets_are_strictly_increasing() {
        let dir = TempDir::new().unwrap();
        let platform = LinuxPlatform::new();
        let mut backlog = backlog(&dir, OverflowPolicy::Compress, 100);
        for i in 0..10 {
            backlog
                .push(&platform, Bytes::from(format!("line {i}\n")))
                .unwrap();
        }
        let chunks = backlog.drain(&platform).unwrap();
        for pair in chunks.windows(2) {
            assert!(pair[0].offset < pair[1].offset);
        }
    }

    #[test]
    fn compress_policy_loses_nothing() {
        let dir = TempDir::new().unwrap();
        let platform = LinuxPlatform::new();
        let mut backlog = backlog(&dir, OverflowPolicy::Compress, 4);
        let mut expected = Vec::new();
        for i in 0..50 {
            let line = format!("log line number {i}\n");
            expected.extend_from_slice(line.as_bytes());
            backlog.push(&platform, Bytes::from(line)).unwrap();
        }
        assert_eq!(drained_payload(&mut backlog), expected);
    }

    #[test]
    fn spill_policy_loses_nothing_and_cleans_up() {
        let dir = TempDir::new().unwrap();
        let platform = LinuxPlatform::new();
        let mut backlog = backlog(&dir, OverflowPolicy::Spill, 4);
        let mut expected = Vec::new();
        for i in 0..20 {
            let line = format!("spilled {i}\n");
            expected.extend_from_slice(line.as_bytes());
            backlog.push(&platform, Bytes::from(line)).unwrap();
        }
        assert_eq!(drained_payload(&mut backlog), expected);
        // Sidecars are consumed by the drain.
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[test]
    fn sample_policy_thins_the_queue() {
        let dir = TempDir::new().unwrap();
        let platform = LinuxPlatform::new();
        let mut backlog = backlog(&dir, OverflowPolicy::Sample, 10);
        for i in 0..11 {
            backlog
                .push(&platform, Bytes::from(format!("{i}\n")))
                .unwrap();
        }
        assert!(backlog.dropped_chunks > 0);
        let chunks = backlog.drain(&platform).unwrap();
        // Offsets stay ordered even though runs were dropped.
        for pair in chunks.windows(2) {
            assert!(pair[0].offset < pair[1].offset);
        }
    }

    #[test]
    fn alert_policy_refuses_when_full() {
        let dir = TempDir::new().unwrap();
        let platform = LinuxPlatform::new();
        let mut backlog = backlog(&dir, OverflowPolicy::Alert, 3);
        for i in 0..3 {
            backlog
                .push(&platform, Bytes::from(format!("{i}\n")))
                .unwrap();
        }
        let err = backlog.push(&platform, Bytes::from_static(b"x\n")).unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted(_)));
        // Draining restores capacity.
        backlog.drain(&platform).unwrap();
        backlog.push(&platform, Bytes::from_static(b"y\n")).unwrap();
    }

    #[test]
    fn global_byte_cap_triggers_the_policy() {
        let dir = TempDir::new().unwrap();
        let platform = LinuxPlatform::new();
        let total = Arc::new(AtomicU64::new(0));
        let config = LogConfig {
            queue_capacity: 1_000_000,
            total_buffer_bytes: 64,
            overflow_policy: OverflowPolicy::Compress,
            ..LogConfig::default()
        };
        let mut backlog = Backlog::new(JobId::new(), &config, dir.path().to_path_buf(), total);
        let mut expected = Vec::new();
        for i in 0..32 {
            let line = format!("byte capped line {i}\n");
            expected.extend_from_slice(line.as_bytes());
            backlog.push(&platform, Bytes::from(line)).unwrap();
        }
        assert_eq!(drained_payload(&mut backlog), expected);
    }
}
