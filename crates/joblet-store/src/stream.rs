//! Bridging log subscriptions to streaming clients.
//!
//! `stream_job_updates` is the server half of `GetJobLogs`: replay for
//! finished jobs, live tail with keep-alives for running ones. Cancellation
//! is the caller dropping the future (the transport does that when the
//! client goes away); a failing sink ends delivery without touching the job.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use joblet_core::events::{JobEvent, LogChunk};
use joblet_core::{Error, JobId, Result};
use joblet_logs::LogHub;

use crate::JobStore;

/// Where streamed events go: an HTTP response body, a test buffer.
#[async_trait]
pub trait UpdateSink: Send {
    /// Deliver one event. An error means the client is gone.
    async fn send(&mut self, event: JobEvent) -> Result<()>;
}

/// Stream a job's output into `sink` until the terminal marker, emitting
/// keep-alives while the stream is idle.
pub async fn stream_job_updates(
    store: &JobStore,
    hub: &LogHub,
    job_id: &JobId,
    keepalive: Duration,
    sink: &mut dyn UpdateSink,
) -> Result<()> {
    let job = store.job(job_id)?;

    let mut rx = match hub.subscribe(job_id).await {
        Ok(rx) => rx,
        Err(Error::NotFound(_)) => {
            // Already terminal (or terminal raced the subscribe): replay the
            // persisted file and finish.
            let job = store.job(job_id)?;
            let persisted = hub.read_persisted(job_id)?;
            if !persisted.is_empty() {
                sink.send(JobEvent::Chunk(LogChunk::new(0, Bytes::from(persisted))))
                    .await?;
            }
            sink.send(JobEvent::Terminated {
                state: job.state,
                exit_code: job.exit_code,
            })
            .await?;
            return Ok(());
        }
        Err(err) => return Err(err),
    };
    debug!(job_id = %job_id, state = %job.state, "Client attached to log stream");

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Some(event @ JobEvent::Terminated { .. }) => {
                        sink.send(event).await?;
                        return Ok(());
                    }
                    Some(event) => sink.send(event).await?,
                    // Writer retired without a marker reaching us; report
                    // the store's view instead of going silent.
                    None => {
                        let job = store.job(job_id)?;
                        sink.send(JobEvent::Terminated {
                            state: job.state,
                            exit_code: job.exit_code,
                        })
                        .await?;
                        return Ok(());
                    }
                }
            }
            _ = tokio::time::sleep(keepalive) => {
                sink.send(JobEvent::KeepAlive).await?;
            }
        }
    }
}
