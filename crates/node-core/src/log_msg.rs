//! Typed log lines captured from the proxy core.

use serde::{Deserialize, Serialize};

/// A single line of subprocess output, tagged with the stream it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stream", content = "line", rename_all = "snake_case")]
pub enum LogMsg {
    /// Line read from standard output.
    Stdout(String),
    /// Line read from standard error.
    Stderr(String),
}

impl LogMsg {
    /// The text of the line without its stream tag.
    #[must_use]
    pub fn text(&self) -> &str {
        match self {
            Self::Stdout(s) | Self::Stderr(s) => s,
        }
    }

    /// Whether the line came from standard error.
    #[must_use]
    pub const fn is_stderr(&self) -> bool {
        matches!(self, Self::Stderr(_))
    }
}
