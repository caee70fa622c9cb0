//! HTTP surface: satellite ingestion plus the admin API.

use std::sync::Arc;

use axum::{
    extract::{Path, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::db::Database;
use crate::error::DbError;
use crate::handlers;
use crate::tunnel::{Tunnel, TunnelError};
use crate::types::{
    AttachFileRequest, FileEntry, HeartbeatPayload, MachineLastSeen, ModifyMachineRequest,
    NewMachineRequest, RemoveFileRequest, RemoveMachineRequest, TelemetryPayload,
    WorkstationGroup,
};

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<dyn Database>,
    pub tunnel: Arc<Tunnel>,
    pub admin_token: Option<String>,
}

#[derive(Debug)]
pub enum ApiError {
    Db(DbError),
    Tunnel(TunnelError),
}

impl From<DbError> for ApiError {
    fn from(e: DbError) -> Self {
        Self::Db(e)
    }
}

impl From<TunnelError> for ApiError {
    fn from(e: TunnelError) -> Self {
        Self::Tunnel(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            Self::Db(e) if e.is_not_present() => (StatusCode::NOT_FOUND, e.to_string()),
            Self::Db(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            Self::Tunnel(e @ TunnelError::InvalidConfig(_)) => {
                (StatusCode::BAD_REQUEST, e.to_string())
            }
            Self::Tunnel(e @ TunnelError::Step { .. }) => (StatusCode::BAD_GATEWAY, e.to_string()),
            Self::Tunnel(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        };
        if status.is_server_error() {
            error!(status = status.as_u16(), error = %message, "request failed");
        }
        (status, Json(json!({ "error": message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Deserialize)]
pub struct HostRequest {
    pub hostname: String,
}

async fn require_admin(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if let Some(expected) = state.admin_token.as_ref() {
        let presented = req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        if presented != Some(expected.as_str()) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }
    next.run(req).await
}

async fn heartbeat(
    State(state): State<AppState>,
    Json(payload): Json<HeartbeatPayload>,
) -> ApiResult<StatusCode> {
    handlers::heartbeat(state.db.as_ref(), &payload).await?;
    Ok(StatusCode::OK)
}

async fn stats(
    State(state): State<AppState>,
    Json(payload): Json<TelemetryPayload>,
) -> ApiResult<StatusCode> {
    if let Err(e) = handlers::submit_telemetry(state.db.as_ref(), &payload).await {
        warn!(host = %payload.hostname, error = %e, "telemetry rejected");
        return Err(e.into());
    }
    Ok(StatusCode::OK)
}

async fn latest(State(state): State<AppState>) -> ApiResult<Json<Vec<WorkstationGroup>>> {
    Ok(Json(state.db.latest_data().await?))
}

async fn last_seen(State(state): State<AppState>) -> ApiResult<Json<Vec<MachineLastSeen>>> {
    Ok(Json(state.db.last_seen().await?))
}

async fn new_machine(
    State(state): State<AppState>,
    Json(req): Json<NewMachineRequest>,
) -> ApiResult<StatusCode> {
    state.db.new_machine(&req).await?;
    Ok(StatusCode::CREATED)
}

async fn update_machine(
    State(state): State<AppState>,
    Json(req): Json<ModifyMachineRequest>,
) -> ApiResult<StatusCode> {
    state.db.update_machine(&req).await?;
    Ok(StatusCode::OK)
}

async fn remove_machine(
    State(state): State<AppState>,
    Json(req): Json<RemoveMachineRequest>,
) -> ApiResult<StatusCode> {
    state.db.remove_machine(&req).await?;
    Ok(StatusCode::OK)
}

async fn attach_file(
    State(state): State<AppState>,
    Json(req): Json<AttachFileRequest>,
) -> ApiResult<StatusCode> {
    state.db.attach_file(&req).await?;
    Ok(StatusCode::CREATED)
}

async fn remove_file(
    State(state): State<AppState>,
    Json(req): Json<RemoveFileRequest>,
) -> ApiResult<StatusCode> {
    state.db.remove_file(&req).await?;
    Ok(StatusCode::OK)
}

async fn list_files(
    State(state): State<AppState>,
    Path(host): Path<String>,
) -> ApiResult<Json<Vec<FileEntry>>> {
    Ok(Json(state.db.list_files(&host).await?))
}

async fn get_file(
    State(state): State<AppState>,
    Path((host, name)): Path<(String, String)>,
) -> ApiResult<Response> {
    let file = state.db.get_file(&host, &name).await?;
    Ok(([(header::CONTENT_TYPE, file.mime)], file.payload).into_response())
}

// Onboarding copies a binary and can take a while, so it runs detached.
async fn onboard(
    State(state): State<AppState>,
    Json(req): Json<HostRequest>,
) -> ApiResult<StatusCode> {
    state.tunnel.check(&req.hostname)?;
    let tunnel = state.tunnel.clone();
    tokio::spawn(async move {
        if let Err(e) = tunnel.onboard(&req.hostname).await {
            error!(host = %req.hostname, error = %e, "onboarding failed");
        }
    });
    Ok(StatusCode::ACCEPTED)
}

async fn deboard(
    State(state): State<AppState>,
    Json(req): Json<HostRequest>,
) -> ApiResult<StatusCode> {
    state.tunnel.check(&req.hostname)?;
    let tunnel = state.tunnel.clone();
    tokio::spawn(async move {
        if let Err(e) = tunnel.deboard(&req.hostname).await {
            error!(host = %req.hostname, error = %e, "deboarding failed");
        }
    });
    Ok(StatusCode::ACCEPTED)
}

async fn restart_satellite(
    State(state): State<AppState>,
    Json(req): Json<HostRequest>,
) -> ApiResult<StatusCode> {
    state.tunnel.restart_satellite(&req.hostname).await?;
    Ok(StatusCode::OK)
}

async fn stop_satellite(
    State(state): State<AppState>,
    Json(req): Json<HostRequest>,
) -> ApiResult<StatusCode> {
    state.tunnel.stop_satellite(&req.hostname).await?;
    Ok(StatusCode::OK)
}

pub fn router(state: AppState) -> Router {
    let admin = Router::new()
        .route("/api/latest", get(latest))
        .route("/api/lastseen", get(last_seen))
        .route(
            "/api/machines",
            post(new_machine).patch(update_machine).delete(remove_machine),
        )
        .route("/api/files", post(attach_file).delete(remove_file))
        .route("/api/files/:host", get(list_files))
        .route("/api/files/:host/:name", get(get_file))
        .route("/api/onboard", post(onboard))
        .route("/api/deboard", post(deboard))
        .route("/api/satellite/restart", post(restart_satellite))
        .route("/api/satellite/stop", post(stop_satellite))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_admin));

    Router::new()
        .route("/api/heartbeat", post(heartbeat))
        .route("/api/stats", post(stats))
        .merge(admin)
        .with_state(state)
}

/// Serve until `cancel` fires, then drain in-flight requests.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "groundstation listening");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}
