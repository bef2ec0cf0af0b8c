//! Port through which the supervisor launches the proxy core.

use async_trait::async_trait;
use thiserror::Error;

use crate::ConfigDocument;

/// Spawned process handle.
///
/// The child runs in its own process group with piped stdout and stderr.
pub struct SpawnedProcess {
    /// Child process handle.
    pub child: command_group::AsyncGroupChild,
}

impl SpawnedProcess {
    /// Process id of the group leader, if it has not been reaped yet.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }
}

/// Executor error.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Spawn failed: {0}")]
    SpawnFailed(String),
    #[error("Executable not found: {0}")]
    ExecutableNotFound(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Unrecognised version output: {0:?}")]
    VersionParse(String),
    #[error("Command build error: {0}")]
    CommandBuild(String),
}

/// Trait for proxy core executors.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Launch the core with the given (already transformed) config.
    async fn spawn(&self, config: &ConfigDocument) -> Result<SpawnedProcess, ExecutorError>;

    /// Ask the executable for its version string (e.g. `1.8.4`).
    async fn version(&self) -> Result<String, ExecutorError>;

    /// Whether a log line announces that the core finished starting.
    ///
    /// `version` is the last probed version, when known.
    fn is_ready_line(&self, line: &str, version: Option<&str>) -> bool {
        let _ = (line, version);
        false
    }
}
