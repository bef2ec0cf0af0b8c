//! Control API for the proxy-node agent.
//!
//! Provides:
//! - Wire protocol (request/response bodies, log stream query and close codes)
//! - REST handlers for session and core lifecycle
//! - Log streaming over WebSocket
//! - Mutual-TLS server configuration

pub mod protocol;
pub mod rest;
pub mod router;
pub mod tls;
pub mod websocket;

#[cfg(test)]
mod test_support;

pub use protocol::{ConfigPayload, LogsQuery, NodeStatus, SessionRequest, StartRequest};
pub use rest::ApiError;
pub use router::{AppState, create_router};
pub use tls::{TlsError, load_server_config, server_config_from_pem};
