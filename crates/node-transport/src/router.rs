//! Route table of the control API.

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use node_core::{Executor, NodeSettings};
use node_session::{ProcessSupervisor, SessionManager};
use tower_http::trace::TraceLayer;

use crate::{rest, websocket};

/// Shared state of every handler.
pub struct AppState<E: Executor> {
    pub sessions: Arc<SessionManager>,
    pub supervisor: Arc<ProcessSupervisor<E>>,
    pub settings: Arc<NodeSettings>,
}

impl<E: Executor> Clone for AppState<E> {
    fn clone(&self) -> Self {
        Self {
            sessions: Arc::clone(&self.sessions),
            supervisor: Arc::clone(&self.supervisor),
            settings: Arc::clone(&self.settings),
        }
    }
}

impl<E: Executor + 'static> AppState<E> {
    /// Wire up state for the given executor.
    #[must_use]
    pub fn new(supervisor: ProcessSupervisor<E>, settings: NodeSettings) -> Self {
        Self {
            sessions: Arc::new(SessionManager::new()),
            supervisor: Arc::new(supervisor),
            settings: Arc::new(settings),
        }
    }
}

/// Build the control API router.
///
/// The connect handler reads the peer address, so the router must be served
/// with `into_make_service_with_connect_info::<SocketAddr>()`.
pub fn create_router<E: Executor + 'static>(state: AppState<E>) -> Router {
    Router::new()
        .route("/", post(rest::status::<E>).get(rest::status::<E>))
        .route("/connect", post(rest::connect::<E>))
        .route("/disconnect", post(rest::disconnect::<E>))
        .route("/ping", post(rest::ping::<E>))
        .route("/start", post(rest::start::<E>))
        .route("/stop", post(rest::stop::<E>))
        .route("/restart", post(rest::restart::<E>))
        .route("/logs", get(websocket::logs::<E>))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
