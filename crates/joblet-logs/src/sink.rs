//! Best-effort event forwarding to an external persist process.
//!
//! The sink rides along as an extra consumer of every job's logs and
//! metrics, writing NDJSON over a local stream socket. It is strictly
//! optional: sends never block, a full queue drops the oldest-first by
//! refusing new events, and a dead peer triggers exponential-backoff
//! reconnects in the background. Nothing here can slow a job down.

use std::path::PathBuf;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use joblet_core::JobId;
use joblet_core::events::{LogChunk, MetricsSample};

/// In-flight events held while the peer is slow or away.
const QUEUE_CAPACITY: usize = 4096;

const BACKOFF_INITIAL: Duration = Duration::from_millis(100);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum SinkEvent {
    Log {
        job_id: JobId,
        offset: u64,
        data: String,
    },
    Metrics {
        sample: MetricsSample,
    },
}

/// Cheap cloneable handle; the connection lives in a background task.
#[derive(Clone)]
pub struct IpcSink {
    tx: mpsc::Sender<SinkEvent>,
}

impl IpcSink {
    /// Start forwarding to the socket at `path`. The connection is
    /// established lazily and re-established forever.
    pub fn connect(path: PathBuf) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        tokio::spawn(forward_task(path, rx));
        Self { tx }
    }

    pub fn forward_log(&self, job_id: &JobId, chunk: &LogChunk) {
        let event = SinkEvent::Log {
            job_id: *job_id,
            offset: chunk.offset,
            data: BASE64.encode(&chunk.bytes),
        };
        // Full queue or gone task: the sink is lossy by contract.
        let _ = self.tx.try_send(event);
    }

    pub fn forward_metrics(&self, sample: &MetricsSample) {
        let _ = self.tx.try_send(SinkEvent::Metrics {
            sample: sample.clone(),
        });
    }
}

async fn forward_task(path: PathBuf, mut rx: mpsc::Receiver<SinkEvent>) {
    let mut backoff = BACKOFF_INITIAL;
    loop {
        let mut stream = match UnixStream::connect(&path).await {
            Ok(stream) => {
                debug!(path = %path.display(), "Event sink connected");
                backoff = BACKOFF_INITIAL;
                stream
            }
            Err(err) => {
                debug!(path = %path.display(), error = %err, "Event sink unavailable");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(BACKOFF_CAP);
                continue;
            }
        };

        while let Some(event) = rx.recv().await {
            let mut line = match serde_json::to_vec(&event) {
                Ok(line) => line,
                Err(err) => {
                    warn!(error = %err, "Dropping unencodable sink event");
                    continue;
                }
            };
            line.push(b'\n');
            if stream.write_all(&line).await.is_err() {
                // Peer went away; this event is lost, the rest queue up
                // behind the reconnect.
                break;
            }
        }
        if rx.is_closed() && rx.is_empty() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::UnixListener;
    use tempfile::TempDir;

    #[tokio::test]
    async fn events_arrive_as_ndjson() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("persist.sock");
        let listener = UnixListener::bind(&socket).unwrap();

        let sink = IpcSink::connect(socket);
        let job_id = JobId::new();
        sink.forward_log(&job_id, &LogChunk::new(0, Bytes::from_static(b"hello\n")));

        let (stream, _) = listener.accept().await.unwrap();
        let mut lines = BufReader::new(stream).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["type"], "log");
        assert_eq!(value["job_id"], job_id.to_string());
        assert_eq!(value["data"], BASE64.encode(b"hello\n"));
    }

    #[tokio::test]
    async fn missing_peer_never_blocks_producers() {
        let dir = TempDir::new().unwrap();
        let sink = IpcSink::connect(dir.path().join("nobody-home.sock"));
        let job_id = JobId::new();
        // Far more than the queue holds; every call must return immediately.
        for i in 0..(QUEUE_CAPACITY * 2) {
            sink.forward_log(
                &job_id,
                &LogChunk::new(i as u64, Bytes::from_static(b"x")),
            );
        }
    }
}
