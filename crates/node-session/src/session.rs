//! The single control-plane session.

use std::{
    net::IpAddr,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use uuid::Uuid;

/// Session identifier.
pub type SessionId = Uuid;

/// The control-plane's current claim on this node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    /// Unique session identifier.
    pub id: SessionId,
    /// Creation timestamp (Unix epoch seconds).
    pub created_at: i64,
    /// Address the session was opened from.
    pub client_addr: IpAddr,
}

/// Session error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("Session ID mismatch")]
    Mismatch,
}

/// Holds at most one valid session.
///
/// Opening a session replaces the previous one; readers observe the latest
/// completed `open`/`close`. Stream handlers can [`subscribe`](Self::subscribe)
/// to learn about invalidation.
#[derive(Debug)]
pub struct SessionManager {
    current: watch::Sender<Option<Session>>,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionManager {
    /// Create a manager with no session.
    #[must_use]
    pub fn new() -> Self {
        let (current, _) = watch::channel(None);
        Self { current }
    }

    /// Open a new session, invalidating any previous one.
    pub fn open(&self, client_addr: IpAddr) -> SessionId {
        self.replace(client_addr).0.id
    }

    /// Open a new session and return it together with the one it replaced.
    pub fn replace(&self, client_addr: IpAddr) -> (Session, Option<Session>) {
        let session = Session {
            id: Uuid::new_v4(),
            created_at: unix_now(),
            client_addr,
        };
        let previous = self.current.send_replace(Some(session.clone()));

        match &previous {
            Some(old) => tracing::warn!(
                session_id = %session.id,
                previous = %old.id,
                previous_client = %old.client_addr,
                client = %client_addr,
                "session taken over by a new connection"
            ),
            None => tracing::info!(
                session_id = %session.id,
                client = %client_addr,
                "session opened"
            ),
        }

        (session, previous)
    }

    /// Whether `id` is the current session.
    #[must_use]
    pub fn validate(&self, id: SessionId) -> bool {
        self.current.borrow().as_ref().is_some_and(|s| s.id == id)
    }

    /// Close the session if `id` is current. Stale ids are ignored.
    pub fn close(&self, id: SessionId) -> bool {
        let closed = self.current.send_if_modified(|current| {
            if current.as_ref().is_some_and(|s| s.id == id) {
                *current = None;
                true
            } else {
                false
            }
        });
        if closed {
            tracing::info!(session_id = %id, "session closed");
        }
        closed
    }

    /// The current session, if any.
    #[must_use]
    pub fn current(&self) -> Option<Session> {
        self.current.borrow().clone()
    }

    /// The current session, provided its id is `id`.
    ///
    /// # Errors
    /// Returns `SessionError::Mismatch` if there is no session or it differs.
    pub fn require(&self, id: SessionId) -> Result<Session, SessionError> {
        self.current
            .borrow()
            .as_ref()
            .filter(|s| s.id == id)
            .cloned()
            .ok_or(SessionError::Mismatch)
    }

    /// Whether any session is open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.current.borrow().is_some()
    }

    /// Watch session changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Option<Session>> {
        self.current.subscribe()
    }
}

pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}
