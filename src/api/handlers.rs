use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;

use crate::lxc::{ContainerAction, ContainerInfo, CreateRequest, DestroyRequest};
use crate::registry::{validate_unit_name, AttachInfo, SessionSummary};

use super::error::ApiError;
use super::AppState;

/// Version string reported by `GET /apiversion`.
pub const API_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Serialize)]
pub(super) struct HealthResponse {
    status: &'static str,
}

pub(super) async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

#[derive(Serialize)]
pub(super) struct VersionResponse {
    version: String,
}

pub(super) async fn lxc_version(
    State(state): State<AppState>,
) -> Result<Json<VersionResponse>, ApiError> {
    let version = state.lxc.version().await?;
    Ok(Json(VersionResponse { version }))
}

pub(super) async fn api_version() -> Json<VersionResponse> {
    Json(VersionResponse {
        version: API_VERSION.to_string(),
    })
}

#[derive(Serialize)]
pub(super) struct ContainerList {
    containers: Vec<String>,
}

pub(super) async fn containers(
    State(state): State<AppState>,
) -> Result<Json<ContainerList>, ApiError> {
    let containers = state.lxc.list().await?;
    Ok(Json(ContainerList { containers }))
}

#[derive(Serialize)]
pub(super) struct ContainerDetail {
    containers: Vec<ContainerInfo>,
}

pub(super) async fn container_info(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ContainerDetail>, ApiError> {
    validate_unit_name(&name).map_err(ApiError::InvalidName)?;
    let info = state.lxc.info(&name).await?;
    Ok(Json(ContainerDetail {
        containers: vec![info],
    }))
}

#[derive(Serialize)]
pub(super) struct CommandResponse {
    status_code: u16,
    message: &'static str,
}

impl CommandResponse {
    fn ok(message: &'static str) -> Json<Self> {
        Json(Self {
            status_code: StatusCode::OK.as_u16(),
            message,
        })
    }
}

async fn run_action(
    state: &AppState,
    action: ContainerAction,
    name: &str,
) -> Result<Json<CommandResponse>, ApiError> {
    validate_unit_name(name).map_err(ApiError::InvalidName)?;
    state.lxc.act(action, name).await?;
    tracing::info!(unit = %name, tool = action.tool(), "container action completed");
    Ok(CommandResponse::ok(action.success_message()))
}

pub(super) async fn container_start(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<CommandResponse>, ApiError> {
    run_action(&state, ContainerAction::Start, &name).await
}

pub(super) async fn container_stop(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<CommandResponse>, ApiError> {
    run_action(&state, ContainerAction::Stop, &name).await
}

pub(super) async fn container_freeze(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<CommandResponse>, ApiError> {
    run_action(&state, ContainerAction::Freeze, &name).await
}

pub(super) async fn container_unfreeze(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<CommandResponse>, ApiError> {
    run_action(&state, ContainerAction::Unfreeze, &name).await
}

pub(super) async fn container_create(
    State(state): State<AppState>,
    body: Result<Json<CreateRequest>, JsonRejection>,
) -> Result<Json<CommandResponse>, ApiError> {
    let Json(req) = body?;
    validate_unit_name(&req.container_name).map_err(ApiError::InvalidName)?;
    state.lxc.create(&req).await?;
    tracing::info!(unit = %req.container_name, template = %req.template, "container created");
    Ok(CommandResponse::ok("Container created successfully"))
}

pub(super) async fn container_destroy(
    State(state): State<AppState>,
    body: Result<Json<DestroyRequest>, JsonRejection>,
) -> Result<Json<CommandResponse>, ApiError> {
    let Json(req) = body?;
    validate_unit_name(&req.container_name).map_err(ApiError::InvalidName)?;
    state.lxc.destroy(&req.container_name).await?;
    tracing::info!(unit = %req.container_name, "container destroyed");
    Ok(CommandResponse::ok("Container destroyed successfully"))
}

pub(super) async fn attach(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<AttachInfo>, ApiError> {
    let info = state.sessions.attach(&name).await?;
    Ok(Json(info))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct IsAttachResponse {
    is_attach: bool,
}

pub(super) async fn is_attach(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Json<IsAttachResponse> {
    Json(IsAttachResponse {
        is_attach: state.sessions.is_attached(&name),
    })
}

pub(super) async fn detach(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.sessions.detach(&name).await?;
    Ok(StatusCode::OK)
}

pub(super) async fn sessions(State(state): State<AppState>) -> Json<Vec<SessionSummary>> {
    Json(state.sessions.list())
}
