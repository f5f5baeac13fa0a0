//! Volume service endpoints.

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use joblet_executor::volume::VolumeInfo;

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_volumes).post(create_volume))
        .route("/{name}", get(get_volume).delete(delete_volume))
}

#[derive(Debug, Deserialize)]
struct CreateVolumeRequest {
    name: String,
    #[serde(default = "default_size")]
    size: String,
}

fn default_size() -> String {
    "1GB".to_string()
}

async fn list_volumes(State(state): State<AppState>) -> Result<Json<Vec<VolumeInfo>>, ApiError> {
    Ok(Json(state.volumes.list()?))
}

async fn create_volume(
    State(state): State<AppState>,
    Json(request): Json<CreateVolumeRequest>,
) -> Result<Json<VolumeInfo>, ApiError> {
    Ok(Json(state.volumes.create(&request.name, &request.size)?))
}

async fn get_volume(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<VolumeInfo>, ApiError> {
    Ok(Json(state.volumes.get(&name)?))
}

async fn delete_volume(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.volumes.delete(&name)?;
    Ok(Json(json!({ "deleted": name })))
}
