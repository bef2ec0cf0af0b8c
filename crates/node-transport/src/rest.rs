//! REST handlers for session and core lifecycle.

use std::{
    future::Future,
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use axum::{
    Json,
    extract::{ConnectInfo, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use node_core::{ConfigError, Executor, ExecutorError, transform};
use node_session::{SessionError, SessionId, SessionManager, StartError, StopError};
use serde_json::{Value, json};
use thiserror::Error;
use uuid::Uuid;

use crate::{
    protocol::{NodeStatus, SessionRequest, StartRequest},
    router::AppState,
};

/// API error.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Session ID mismatch.")]
    Session(#[from] SessionError),
    #[error("Failed to decode config: {0}")]
    Config(#[from] ConfigError),
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Start(#[from] StartError),
    #[error(transparent)]
    Stop(#[from] StopError),
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl ApiError {
    /// HTTP status and machine-readable reason.
    #[must_use]
    pub const fn classify(&self) -> (StatusCode, &'static str) {
        match self {
            Self::Session(_) => (StatusCode::FORBIDDEN, "session_mismatch"),
            Self::Config(_) => (StatusCode::UNPROCESSABLE_ENTITY, "invalid_config"),
            Self::BadRequest(_) => (StatusCode::UNPROCESSABLE_ENTITY, "invalid_request"),
            Self::Start(StartError::AlreadyRunning) => (StatusCode::CONFLICT, "already_running"),
            Self::Start(StartError::Spawn(ExecutorError::Io(_))) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal")
            }
            Self::Start(StartError::Spawn(_)) => (StatusCode::SERVICE_UNAVAILABLE, "spawn_failed"),
            Self::Start(StartError::ExitedDuringStartup { .. }) => {
                (StatusCode::SERVICE_UNAVAILABLE, "exited_during_startup")
            }
            Self::Start(StartError::HealthTimeout(_)) => {
                (StatusCode::SERVICE_UNAVAILABLE, "health_timeout")
            }
            Self::Start(StartError::Stop(_)) | Self::Stop(StopError::KillFailed(_)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "stop_failed")
            }
            Self::Stop(StopError::Join(_)) | Self::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, reason) = self.classify();
        if status.is_server_error() {
            tracing::error!(%reason, error = %self, "request failed");
        } else {
            tracing::debug!(%reason, error = %self, "request rejected");
        }

        let mut body = json!({"detail": self.to_string(), "reason": reason});
        if let Self::Start(StartError::ExitedDuringStartup { last_lines, .. }) = &self {
            body["logs"] = json!(last_lines);
        }
        (status, Json(body)).into_response()
    }
}

fn node_status<E: Executor + 'static>(state: &AppState<E>, session_id: Option<Uuid>) -> NodeStatus {
    let process = state.supervisor.state();
    NodeStatus {
        connected: state.sessions.is_connected(),
        started: process.is_running(),
        core_version: state.supervisor.version(),
        session_id,
        state: process,
    }
}

/// Run a lifecycle transition on its own task so that a client hanging up
/// does not cancel it halfway.
async fn detached<F>(transition: F) -> Result<F::Output, ApiError>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(transition)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))
}

async fn stop_core<E: Executor + 'static>(state: &AppState<E>) -> Result<(), ApiError> {
    let supervisor = Arc::clone(&state.supervisor);
    detached(async move { supervisor.stop().await }).await??;
    Ok(())
}

/// `/` - status without a session.
pub async fn status<E: Executor + 'static>(State(state): State<AppState<E>>) -> Json<NodeStatus> {
    Json(node_status(&state, None))
}

/// `/connect` - open a session, taking over from any previous one.
pub async fn connect<E: Executor + 'static>(
    State(state): State<AppState<E>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Json<NodeStatus> {
    let client = addr.ip();
    let stopped = if state.sessions.is_connected() && state.supervisor.state().is_active() {
        tracing::warn!(%client, "new session takes over a running core, stopping it");
        stop_core(&state).await
    } else {
        Ok(())
    };
    let session_id = open_session(&state.sessions, client, stopped);
    Json(node_status(&state, Some(session_id)))
}

/// Open a session for `client`. A core that failed to stop on takeover is
/// reported through the status, never by refusing the session.
fn open_session(
    sessions: &SessionManager,
    client: IpAddr,
    stopped: Result<(), ApiError>,
) -> SessionId {
    if let Err(e) = stopped {
        tracing::error!(%client, error = %e, "failed to stop core on takeover");
    }
    sessions.open(client)
}

/// `/disconnect` - close the session and stop the core.
pub async fn disconnect<E: Executor + 'static>(
    State(state): State<AppState<E>>,
    payload: Result<Json<SessionRequest>, JsonRejection>,
) -> Result<Json<NodeStatus>, ApiError> {
    let Json(request) = payload?;
    state.sessions.require(request.session_id)?;
    state.sessions.close(request.session_id);
    stop_core(&state).await?;
    Ok(Json(node_status(&state, None)))
}

/// `/ping` - session liveness check.
pub async fn ping<E: Executor + 'static>(
    State(state): State<AppState<E>>,
    payload: Result<Json<SessionRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(request) = payload?;
    state.sessions.require(request.session_id)?;
    Ok(Json(json!({})))
}

/// `/start` - transform the config and launch the core.
pub async fn start<E: Executor + 'static>(
    State(state): State<AppState<E>>,
    payload: Result<Json<StartRequest>, JsonRejection>,
) -> Result<Json<NodeStatus>, ApiError> {
    let Json(request) = payload?;
    let session = state.sessions.require(request.session_id)?;
    let config = transform(
        request.config.into_value()?,
        &state.settings.inbounds,
        &state.settings.api_endpoint(),
        session.client_addr,
    )?;

    let supervisor = Arc::clone(&state.supervisor);
    detached(async move { supervisor.start(config).await }).await??;
    Ok(Json(node_status(&state, None)))
}

/// `/stop` - stop the core.
pub async fn stop<E: Executor + 'static>(
    State(state): State<AppState<E>>,
    payload: Result<Json<SessionRequest>, JsonRejection>,
) -> Result<Json<NodeStatus>, ApiError> {
    let Json(request) = payload?;
    state.sessions.require(request.session_id)?;
    stop_core(&state).await?;
    Ok(Json(node_status(&state, None)))
}

/// `/restart` - transform the config, stop the core and launch it again.
pub async fn restart<E: Executor + 'static>(
    State(state): State<AppState<E>>,
    payload: Result<Json<StartRequest>, JsonRejection>,
) -> Result<Json<NodeStatus>, ApiError> {
    let Json(request) = payload?;
    let session = state.sessions.require(request.session_id)?;
    let config = transform(
        request.config.into_value()?,
        &state.settings.inbounds,
        &state.settings.api_endpoint(),
        session.client_addr,
    )?;

    let supervisor = Arc::clone(&state.supervisor);
    detached(async move { supervisor.restart(config).await }).await??;
    Ok(Json(node_status(&state, None)))
}
