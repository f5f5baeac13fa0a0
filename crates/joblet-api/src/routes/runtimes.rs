//! Runtime service endpoints.

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;

use joblet_core::RuntimeSpec;
use joblet_executor::{JOB_TYPE_ENV, JOB_TYPE_RUNTIME_BUILD};

use crate::AppState;
use crate::dto::RunJobRequest;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_runtimes).post(install_runtime))
        .route("/{name}", get(get_runtime).delete(remove_runtime))
        .route("/{name}/test", post(test_runtime))
}

#[derive(Debug, Serialize)]
struct RuntimeResponse {
    name: String,
    language: String,
    version: String,
    description: String,
    packages: Vec<String>,
    architectures: Vec<String>,
    requires_gpu: bool,
}

impl From<joblet_executor::runtime::ResolvedRuntime> for RuntimeResponse {
    fn from(runtime: joblet_executor::runtime::ResolvedRuntime) -> Self {
        Self {
            name: runtime.name,
            language: runtime.descriptor.language,
            version: runtime.descriptor.version,
            description: runtime.descriptor.description,
            packages: runtime.descriptor.packages,
            architectures: runtime.descriptor.architectures,
            requires_gpu: runtime.descriptor.requires_gpu,
        }
    }
}

async fn list_runtimes(
    State(state): State<AppState>,
) -> Result<Json<Vec<RuntimeResponse>>, ApiError> {
    let runtimes = state.runtimes.list()?;
    Ok(Json(runtimes.into_iter().map(RuntimeResponse::from).collect()))
}

async fn get_runtime(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<RuntimeResponse>, ApiError> {
    let runtime = state.runtimes.resolve(&name)?;
    Ok(Json(RuntimeResponse::from(runtime)))
}

async fn test_runtime(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.runtimes.test(&name)?;
    Ok(Json(json!({ "runtime": name, "status": "ok" })))
}

async fn remove_runtime(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let removed = state.runtimes.remove(&name)?;
    Ok(Json(json!({ "runtime": name, "removed": removed })))
}

#[derive(Debug, Deserialize)]
struct InstallRuntimeRequest {
    /// Runtime to install, in either accepted grammar.
    runtime_spec: String,
    /// Build job that assembles the tree; runs in the relaxed build plan
    /// with the target directory in `JOBLET_RUNTIME_DIR`.
    #[serde(flatten)]
    job: RunJobRequest,
}

/// Installation is itself a job: the uploaded build script runs with host
/// access and populates `<runtimes_root>/<name>/isolated` plus the
/// `runtime.yml` descriptor.
async fn install_runtime(
    State(state): State<AppState>,
    Json(request): Json<InstallRuntimeRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let parsed = RuntimeSpec::parse(&request.runtime_spec).map_err(ApiError::from)?;
    let target = state
        .supervisor
        .config()
        .runtimes_root
        .join(parsed.dir_name());

    let (mut spec, _) = request.job.into_spec()?;
    spec.environment
        .insert(JOB_TYPE_ENV.to_string(), JOB_TYPE_RUNTIME_BUILD.to_string());
    spec.environment.insert(
        "JOBLET_RUNTIME_DIR".to_string(),
        target.to_string_lossy().to_string(),
    );

    let outcome = state.supervisor.start_job(spec, None, None).await?;
    Ok(Json(json!({
        "runtime": parsed.dir_name(),
        "build_job": outcome.job.id.to_string(),
        "status": outcome.job.state.to_string(),
    })))
}
