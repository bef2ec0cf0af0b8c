//! Xray core executor.
//!
//! Provides:
//! - Command building and executable resolution
//! - `XrayExecutor`, the `Executor` implementation for the Xray binary

pub mod command;
pub mod xray;

pub use command::{CommandBuildError, CommandBuilder, CommandParts, resolve_executable_path};
pub use xray::{XrayExecutor, parse_version};
