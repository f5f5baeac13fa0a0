//! Job service endpoints.

use std::io::Read as _;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::header;
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::debug;

use joblet_core::events::JobEvent;
use joblet_core::{Error, Result as CoreResult};
use joblet_store::{UpdateSink, stream_job_updates};

use crate::AppState;
use crate::dto::{DeleteAllResponse, JobResponse, RunJobRequest, RunJobResponse};
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_jobs).post(run_job).delete(delete_all_jobs))
        .route("/{reference}", get(get_job).delete(delete_job))
        .route("/{reference}/stop", post(stop_job))
        .route("/{reference}/logs", get(job_logs))
        .route("/{reference}/metrics", get(job_metrics))
}

async fn run_job(
    State(state): State<AppState>,
    Json(request): Json<RunJobRequest>,
) -> Result<Json<RunJobResponse>, ApiError> {
    let (spec, schedule) = request.into_spec()?;
    let outcome = state.supervisor.start_job(spec, schedule, None).await?;
    Ok(Json(RunJobResponse {
        uuid: outcome.job.id.to_string(),
        status: outcome.job.state.to_string(),
    }))
}

async fn list_jobs(State(state): State<AppState>) -> Json<Vec<JobResponse>> {
    let jobs = state
        .supervisor
        .store()
        .list()
        .into_iter()
        .map(JobResponse::from)
        .collect();
    Json(jobs)
}

async fn get_job(
    State(state): State<AppState>,
    Path(reference): Path<String>,
) -> Result<Json<JobResponse>, ApiError> {
    let job = state.supervisor.store().job_by_prefix(&reference)?;
    Ok(Json(JobResponse::from(job)))
}

async fn stop_job(
    State(state): State<AppState>,
    Path(reference): Path<String>,
) -> Result<Json<JobResponse>, ApiError> {
    let job = state.supervisor.store().job_by_prefix(&reference)?;
    state.supervisor.stop_job(&job.id).await?;
    let job = state.supervisor.store().job(&job.id)?;
    Ok(Json(JobResponse::from(job)))
}

async fn delete_job(
    State(state): State<AppState>,
    Path(reference): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let job = state.supervisor.store().job_by_prefix(&reference)?;
    state.supervisor.delete_job(&job.id)?;
    Ok(Json(serde_json::json!({ "deleted": job.id.to_string() })))
}

async fn delete_all_jobs(State(state): State<AppState>) -> Json<DeleteAllResponse> {
    let (deleted_count, skipped_count) = state.supervisor.delete_all_jobs();
    Json(DeleteAllResponse {
        deleted_count,
        skipped_count,
    })
}

/// Raw log bytes as a chunked stream. Empty chunks are keep-alives; the
/// stream closing is the terminal signal.
async fn job_logs(
    State(state): State<AppState>,
    Path(reference): Path<String>,
) -> Result<Response, ApiError> {
    // Prefixes are resolved here; the subscription key is always the full
    // UUID.
    let job = state.supervisor.store().job_by_prefix(&reference)?;
    let id = job.id;
    let keepalive =
        Duration::from_millis(state.supervisor.config().logs.keepalive_interval_ms.max(1));

    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(64);
    let supervisor = state.supervisor.clone();
    tokio::spawn(async move {
        let mut sink = BodySink { tx };
        if let Err(err) = stream_job_updates(
            supervisor.store(),
            supervisor.log_hub(),
            &id,
            keepalive,
            &mut sink,
        )
        .await
        {
            debug!(job_id = %id, error = %err, "Log stream ended");
        }
    });

    let stream = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    });
    let response = Response::builder()
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .body(Body::from_stream(stream))
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(response)
}

/// Persisted metrics as NDJSON, decompressed from every run file.
async fn job_metrics(
    State(state): State<AppState>,
    Path(reference): Path<String>,
) -> Result<Response, ApiError> {
    let job = state.supervisor.store().job_by_prefix(&reference)?;
    let dir = state
        .supervisor
        .config()
        .metrics_dir()
        .join(job.id.to_string());

    let body = tokio::task::spawn_blocking(move || -> CoreResult<Vec<u8>> {
        let mut out = Vec::new();
        if !dir.exists() {
            return Ok(out);
        }
        let mut files: Vec<_> = std::fs::read_dir(&dir)
            .map_err(Error::from)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .collect();
        files.sort();
        for file in files {
            let raw = std::fs::read(&file).map_err(Error::from)?;
            let mut decoder = flate2::read::GzDecoder::new(raw.as_slice());
            decoder.read_to_end(&mut out).map_err(Error::from)?;
        }
        Ok(out)
    })
    .await
    .map_err(|e| ApiError::Internal(e.to_string()))?
    .map_err(ApiError::from)?;

    let response = Response::builder()
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .body(Body::from(body))
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(response)
}

struct BodySink {
    tx: mpsc::Sender<Result<Bytes, std::io::Error>>,
}

#[async_trait]
impl UpdateSink for BodySink {
    async fn send(&mut self, event: JobEvent) -> CoreResult<()> {
        let payload = match event {
            JobEvent::Chunk(chunk) => chunk.bytes,
            JobEvent::KeepAlive => Bytes::new(),
            // Closing the body is the terminal marker on the wire.
            JobEvent::Terminated { .. } => return Ok(()),
        };
        self.tx
            .send(Ok(payload))
            .await
            .map_err(|_| Error::Cancelled)
    }
}
