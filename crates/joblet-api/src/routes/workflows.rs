//! Workflow service endpoints.

use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;

use joblet_core::WorkflowId;

use crate::AppState;
use crate::dto::{
    RunWorkflowRequest, WorkflowInfoResponse, WorkflowJobResponse, workflow_info, workflow_jobs,
};
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_workflows).post(run_workflow))
        .route("/{id}", get(get_workflow))
        .route("/{id}/jobs", get(get_workflow_jobs))
        .route("/{id}/ready", get(get_ready_jobs))
}

async fn run_workflow(
    State(state): State<AppState>,
    Json(request): Json<RunWorkflowRequest>,
) -> Result<Json<WorkflowInfoResponse>, ApiError> {
    let files = request.decode_files()?;
    let workflow = state.engine.create_workflow(&request.yaml_content, files)?;
    let workflow = state.engine.start(&workflow.id).await?;
    Ok(Json(workflow_info(&workflow)))
}

#[derive(Debug, Deserialize)]
struct ListWorkflowsQuery {
    #[serde(default)]
    include_completed: bool,
}

async fn list_workflows(
    State(state): State<AppState>,
    Query(query): Query<ListWorkflowsQuery>,
) -> Json<Vec<WorkflowInfoResponse>> {
    let workflows = state.engine.list(query.include_completed).await;
    Json(workflows.iter().map(workflow_info).collect())
}

async fn get_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<WorkflowInfoResponse>, ApiError> {
    let id = parse_id(&id)?;
    let workflow = state.engine.get_status(&id).await?;
    Ok(Json(workflow_info(&workflow)))
}

async fn get_workflow_jobs(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<WorkflowJobResponse>>, ApiError> {
    let id = parse_id(&id)?;
    let workflow = state.engine.get_status(&id).await?;
    Ok(Json(workflow_jobs(&workflow)))
}

async fn get_ready_jobs(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<String>>, ApiError> {
    let id = parse_id(&id)?;
    Ok(Json(state.engine.get_ready_jobs(&id).await?))
}

fn parse_id(raw: &str) -> Result<WorkflowId, ApiError> {
    raw.parse::<WorkflowId>()
        .map_err(|_| ApiError::BadRequest(format!("malformed workflow id: {raw}")))
}
