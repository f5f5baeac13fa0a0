//! Per-job log channels, disk persistence, and subscriber fan-out.
//!
//! One writer task per job owns the disk file and the delivery order.
//! Subscribers join with a replay of everything persisted so far, then ride
//! the live feed. The channel's io lock orders file appends against
//! subscriber registration, so a joining subscriber never misses a batch and
//! never sees one twice.
//!
//! Completion does not slam the door: the terminal transition opens a drain
//! window during which late chunks still flow, and only afterwards does each
//! subscriber receive exactly one terminal marker.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{Notify, mpsc};
use tracing::{debug, warn};

use joblet_config::system::{LogConfig, OverflowPolicy};
use joblet_core::events::{JobEvent, LogChunk};
use joblet_core::{Error, JobId, JobState, Result};
use joblet_platform::Platform;

use crate::SUBSCRIBER_CHANNEL_CAPACITY;
use crate::buffer::Backlog;
use crate::sink::IpcSink;

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<JobEvent>,
}

struct ChannelState {
    backlog: Backlog,
    subscribers: Vec<Subscriber>,
    next_subscriber_id: u64,
    persisted_offset: u64,
    terminal: Option<(JobState, Option<i32>)>,
    /// Set once the drain window has elapsed; the writer finishes up.
    closing: bool,
    closed: bool,
}

struct JobChannel {
    job_id: JobId,
    log_path: PathBuf,
    state: Mutex<ChannelState>,
    /// Orders disk appends against subscriber registration.
    io: tokio::sync::Mutex<()>,
    wake_writer: Notify,
    /// Signaled once the writer has retired the channel.
    closed_notify: Notify,
}

/// Producer handle used by the stdout/stderr reader threads. Publishing is
/// synchronous and never blocks longer than the configured bounded wait.
#[derive(Clone)]
pub struct LogProducer {
    channel: Arc<JobChannel>,
    platform: Arc<dyn Platform>,
    send_timeout: Duration,
    alert_policy: bool,
}

impl LogProducer {
    /// Queue one chunk of job output. Under the alert policy a full queue is
    /// retried for the bounded wait, then the chunk is dropped loudly.
    pub fn publish(&self, bytes: Bytes) {
        let deadline = std::time::Instant::now() + self.send_timeout;
        loop {
            let result = {
                let mut state = self.channel.state.lock().unwrap();
                if state.closed || state.closing {
                    return;
                }
                state.backlog.push(self.platform.as_ref(), bytes.clone())
            };
            match result {
                Ok(()) => {
                    self.channel.wake_writer.notify_one();
                    return;
                }
                Err(_) if self.alert_policy && std::time::Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(err) => {
                    warn!(job_id = %self.channel.job_id, error = %err, "Dropping log chunk");
                    return;
                }
            }
        }
    }
}

/// Process-wide log system. Owns every job's channel and the logs directory.
pub struct LogHub {
    platform: Arc<dyn Platform>,
    config: LogConfig,
    logs_dir: PathBuf,
    channels: Mutex<HashMap<JobId, Arc<JobChannel>>>,
    total_bytes: Arc<AtomicU64>,
    sink: Option<IpcSink>,
    drain_window: Duration,
}

impl LogHub {
    pub fn new(
        platform: Arc<dyn Platform>,
        config: LogConfig,
        logs_dir: PathBuf,
        sink: Option<IpcSink>,
    ) -> Self {
        let drain_window = Duration::from_millis(config.drain_window_ms.max(1));
        Self {
            platform,
            config,
            logs_dir,
            channels: Mutex::new(HashMap::new()),
            total_bytes: Arc::new(AtomicU64::new(0)),
            sink,
            drain_window,
        }
    }

    /// Register a job and spawn its writer task. Returns the producer handle
    /// for the reader threads.
    pub fn open(&self, job_id: JobId) -> Result<LogProducer> {
        self.platform.create_dir_all(&self.logs_dir)?;
        let log_path = self.logs_dir.join(format!("{job_id}.log"));
        // A fresh job truncates any stale file left at this path.
        self.platform.write(&log_path, b"")?;

        let channel = Arc::new(JobChannel {
            job_id,
            log_path,
            state: Mutex::new(ChannelState {
                backlog: Backlog::new(
                    job_id,
                    &self.config,
                    self.logs_dir.join("spill"),
                    self.total_bytes.clone(),
                ),
                subscribers: Vec::new(),
                next_subscriber_id: 0,
                persisted_offset: 0,
                terminal: None,
                closing: false,
                closed: false,
            }),
            io: tokio::sync::Mutex::new(()),
            wake_writer: Notify::new(),
            closed_notify: Notify::new(),
        });

        {
            let mut channels = self.channels.lock().unwrap();
            if channels.contains_key(&job_id) {
                return Err(Error::Internal(format!(
                    "log channel for job {job_id} already open"
                )));
            }
            channels.insert(job_id, channel.clone());
        }

        tokio::spawn(writer_task(
            self.platform.clone(),
            Duration::from_millis(self.config.fsync_interval_ms.max(1)),
            Duration::from_millis(self.config.subscriber_send_timeout_ms.max(1)),
            self.sink.clone(),
            channel.clone(),
        ));

        Ok(LogProducer {
            channel,
            platform: self.platform.clone(),
            send_timeout: Duration::from_millis(self.config.subscriber_send_timeout_ms),
            alert_policy: self.config.overflow_policy == OverflowPolicy::Alert,
        })
    }

    /// Subscribe to a live job. The receiver first gets everything already
    /// persisted, then the live feed, then exactly one terminal marker.
    /// Completed jobs have no channel; callers replay the file instead.
    pub async fn subscribe(&self, job_id: &JobId) -> Result<mpsc::Receiver<JobEvent>> {
        let channel = self
            .channels
            .lock()
            .unwrap()
            .get(job_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("no live log stream for job {job_id}")))?;

        let _io = channel.io.lock().await;
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        let mut state = channel.state.lock().unwrap();
        if state.closed {
            return Err(Error::NotFound(format!(
                "log stream for job {job_id} already closed"
            )));
        }
        if state.persisted_offset > 0 {
            let replay = Bytes::from(self.platform.read(&channel.log_path)?);
            if tx
                .try_send(JobEvent::Chunk(LogChunk::new(0, replay)))
                .is_err()
            {
                return Err(Error::ResourceExhausted(
                    "subscriber cannot hold the replay".into(),
                ));
            }
        }
        let id = state.next_subscriber_id;
        state.next_subscriber_id += 1;
        state.subscribers.push(Subscriber { id, tx });
        Ok(rx)
    }

    /// Raw persisted content, for replaying completed jobs.
    pub fn read_persisted(&self, job_id: &JobId) -> Result<Vec<u8>> {
        let path = self.logs_dir.join(format!("{job_id}.log"));
        if !self.platform.exists(&path) {
            return Ok(Vec::new());
        }
        self.platform.read(&path)
    }

    /// Terminal transition: open the drain window, then let the writer flush
    /// the remainder, deliver the marker, and retire the channel.
    pub async fn complete(&self, job_id: &JobId, state: JobState, exit_code: Option<i32>) {
        let channel = self.channels.lock().unwrap().get(job_id).cloned();
        let Some(channel) = channel else {
            return;
        };
        {
            let mut st = channel.state.lock().unwrap();
            if st.terminal.is_none() {
                st.terminal = Some((state, exit_code));
            }
        }
        tokio::time::sleep(self.drain_window).await;
        {
            let mut st = channel.state.lock().unwrap();
            st.closing = true;
        }
        channel.wake_writer.notify_one();

        // Wait for the writer to retire the channel, re-checking around the
        // notification to dodge the register/notify race.
        loop {
            let notified = channel.closed_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if channel.state.lock().unwrap().closed {
                break;
            }
            notified.await;
        }
        self.channels.lock().unwrap().remove(job_id);
        debug!(job_id = %job_id, "Log channel retired");
    }

    /// Remove the persisted file. Only sensible for deleted jobs.
    pub fn delete(&self, job_id: &JobId) -> Result<()> {
        let path = self.logs_dir.join(format!("{job_id}.log"));
        if self.platform.exists(&path) {
            self.platform.remove_file(&path)?;
        }
        Ok(())
    }
}

/// The single writer for one job: drains the backlog in batches, appends to
/// the log file, fans out to subscribers, and forwards to the sink.
async fn writer_task(
    platform: Arc<dyn Platform>,
    fsync_interval: Duration,
    send_timeout: Duration,
    sink: Option<IpcSink>,
    channel: Arc<JobChannel>,
) {
    let mut dirty = false;

    loop {
        tokio::select! {
            _ = channel.wake_writer.notified() => {}
            _ = tokio::time::sleep(fsync_interval), if dirty => {
                if platform.sync_file(&channel.log_path).is_ok() {
                    dirty = false;
                }
            }
        }

        // Drain and snapshot the audience under one lock: subscribers who
        // join later get this batch from the file instead.
        let (chunks, audience, closing) = {
            let mut state = channel.state.lock().unwrap();
            let chunks = match state.backlog.drain(platform.as_ref()) {
                Ok(chunks) => chunks,
                Err(err) => {
                    warn!(job_id = %channel.job_id, error = %err, "Backlog drain failed");
                    Vec::new()
                }
            };
            let audience: Vec<(u64, mpsc::Sender<JobEvent>)> = state
                .subscribers
                .iter()
                .map(|s| (s.id, s.tx.clone()))
                .collect();
            (chunks, audience, state.closing)
        };

        if !chunks.is_empty() {
            let payload: Vec<u8> = chunks
                .iter()
                .flat_map(|c| c.bytes.iter().copied())
                .collect();
            let end_offset = chunks
                .last()
                .map(|c| c.offset + c.len() as u64)
                .unwrap_or(0);

            let io_guard = channel.io.lock().await;
            let append = {
                let platform = platform.clone();
                let path = channel.log_path.clone();
                tokio::task::spawn_blocking(move || platform.append(&path, &payload))
                    .await
                    .unwrap_or_else(|e| Err(Error::Internal(format!("writer task: {e}"))))
            };
            match append {
                Ok(()) => {
                    dirty = true;
                    let mut state = channel.state.lock().unwrap();
                    state.persisted_offset = state.persisted_offset.max(end_offset);
                }
                Err(err) => {
                    warn!(job_id = %channel.job_id, error = %err, "Log append failed");
                }
            }
            drop(io_guard);

            deliver(&sink, &channel, &chunks, &audience, send_timeout).await;
        }

        if closing {
            let empty = channel.state.lock().unwrap().backlog.is_empty();
            if empty {
                finish(platform.as_ref(), &channel, send_timeout).await;
                return;
            }
            // Late chunks arrived during the window; loop once more.
            channel.wake_writer.notify_one();
        }
    }
}

async fn deliver(
    sink: &Option<IpcSink>,
    channel: &JobChannel,
    chunks: &[LogChunk],
    audience: &[(u64, mpsc::Sender<JobEvent>)],
    send_timeout: Duration,
) {
    let mut slow: Vec<u64> = Vec::new();
    for (id, tx) in audience {
        for chunk in chunks {
            if tx
                .send_timeout(JobEvent::Chunk(chunk.clone()), send_timeout)
                .await
                .is_err()
            {
                // A subscriber that cannot keep up inside the bounded wait
                // is disconnected rather than silently skipped.
                slow.push(*id);
                break;
            }
        }
    }
    if !slow.is_empty() {
        let mut state = channel.state.lock().unwrap();
        state.subscribers.retain(|s| !slow.contains(&s.id));
        warn!(job_id = %channel.job_id, dropped = slow.len(), "Disconnected slow log subscribers");
    }

    if let Some(sink) = sink {
        for chunk in chunks {
            sink.forward_log(&channel.job_id, chunk);
        }
    }
}

async fn finish(platform: &dyn Platform, channel: &JobChannel, send_timeout: Duration) {
    let _ = platform.sync_file(&channel.log_path);
    let (subscribers, terminal) = {
        let mut state = channel.state.lock().unwrap();
        state.closed = true;
        (
            std::mem::take(&mut state.subscribers),
            state.terminal.unwrap_or((JobState::Completed, None)),
        )
    };
    for subscriber in subscribers {
        let _ = subscriber
            .tx
            .send_timeout(
                JobEvent::Terminated {
                    state: terminal.0,
                    exit_code: terminal.1,
                },
                send_timeout,
            )
            .await;
    }
    channel.closed_notify.notify_waiters();
}

#[cfg(test)]
mod tests {
    use super::*;
    use joblet_platform::LinuxPlatform;
    use tempfile::TempDir;

    fn hub(dir: &TempDir) -> Arc<LogHub> {
        let config = LogConfig {
            drain_window_ms: 50,
            fsync_interval_ms: 10,
            ..LogConfig::default()
        };
        Arc::new(LogHub::new(
            Arc::new(LinuxPlatform::new()),
            config,
            dir.path().join("logs"),
            None,
        ))
    }

    async fn collect(mut rx: mpsc::Receiver<JobEvent>) -> (Vec<u8>, usize) {
        let mut payload = Vec::new();
        let mut terminals = 0;
        while let Some(event) = rx.recv().await {
            match event {
                JobEvent::Chunk(chunk) => payload.extend_from_slice(&chunk.bytes),
                JobEvent::Terminated { .. } => terminals += 1,
                JobEvent::KeepAlive => {}
            }
        }
        (payload, terminals)
    }

    #[tokio::test]
    async fn subscriber_sees_all_chunks_then_one_terminal() {
        let dir = TempDir::new().unwrap();
        let hub = hub(&dir);
        let id = JobId::new();
        let producer = hub.open(id).unwrap();
        let rx = hub.subscribe(&id).await.unwrap();

        let mut expected = Vec::new();
        for i in 0..20 {
            let line = format!("chunk {i}\n");
            expected.extend_from_slice(line.as_bytes());
            producer.publish(Bytes::from(line));
        }
        hub.complete(&id, JobState::Completed, Some(0)).await;

        let (payload, terminals) = collect(rx).await;
        assert_eq!(payload, expected);
        assert_eq!(terminals, 1);
    }

    #[tokio::test]
    async fn late_subscriber_replays_persisted_content() {
        let dir = TempDir::new().unwrap();
        let hub = hub(&dir);
        let id = JobId::new();
        let producer = hub.open(id).unwrap();
        producer.publish(Bytes::from_static(b"early\n"));
        // Give the writer a beat to persist.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let rx = hub.subscribe(&id).await.unwrap();
        producer.publish(Bytes::from_static(b"late\n"));
        hub.complete(&id, JobState::Completed, Some(0)).await;

        let (payload, _) = collect(rx).await;
        assert_eq!(payload, b"early\nlate\n");
    }

    #[tokio::test]
    async fn chunks_during_the_drain_window_are_delivered() {
        let dir = TempDir::new().unwrap();
        let hub = hub(&dir);
        let id = JobId::new();
        let producer = hub.open(id).unwrap();
        let rx = hub.subscribe(&id).await.unwrap();

        producer.publish(Bytes::from_static(b"before\n"));
        let hub2 = hub.clone();
        let complete = tokio::spawn(async move {
            hub2.complete(&id, JobState::Stopped, Some(143)).await;
        });
        // Lands inside the 50ms window.
        tokio::time::sleep(Duration::from_millis(10)).await;
        producer.publish(Bytes::from_static(b"during\n"));
        complete.await.unwrap();

        let (payload, terminals) = collect(rx).await;
        assert_eq!(payload, b"before\nduring\n");
        assert_eq!(terminals, 1);
    }

    #[tokio::test]
    async fn persisted_file_matches_published_content() {
        let dir = TempDir::new().unwrap();
        let hub = hub(&dir);
        let id = JobId::new();
        let producer = hub.open(id).unwrap();
        producer.publish(Bytes::from_static(b"hello\n"));
        hub.complete(&id, JobState::Completed, Some(0)).await;
        assert_eq!(hub.read_persisted(&id).unwrap(), b"hello\n");
    }

    #[tokio::test]
    async fn publishing_after_completion_is_ignored() {
        let dir = TempDir::new().unwrap();
        let hub = hub(&dir);
        let id = JobId::new();
        let producer = hub.open(id).unwrap();
        hub.complete(&id, JobState::Failed, Some(1)).await;
        producer.publish(Bytes::from_static(b"too late\n"));
        assert_eq!(hub.read_persisted(&id).unwrap(), b"");
    }

    #[tokio::test]
    async fn subscribe_requires_a_live_channel() {
        let dir = TempDir::new().unwrap();
        let hub = hub(&dir);
        assert!(matches!(
            hub.subscribe(&JobId::new()).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn heavy_load_round_trips_identically() {
        let dir = TempDir::new().unwrap();
        let config = LogConfig {
            queue_capacity: 64,
            drain_window_ms: 50,
            ..LogConfig::default()
        };
        let hub = Arc::new(LogHub::new(
            Arc::new(LinuxPlatform::new()),
            config,
            dir.path().join("logs"),
            None,
        ));
        let id = JobId::new();
        let producer = hub.open(id).unwrap();

        let mut expected = Vec::new();
        let writer = {
            let producer = producer.clone();
            std::thread::spawn(move || {
                for i in 0..5_000 {
                    producer.publish(Bytes::from(format!("busy line {i}\n")));
                }
            })
        };
        for i in 0..5_000 {
            expected.extend_from_slice(format!("busy line {i}\n").as_bytes());
        }
        writer.join().unwrap();
        hub.complete(&id, JobState::Completed, Some(0)).await;
        assert_eq!(hub.read_persisted(&id).unwrap(), expected);
    }
}
