//! Core abstractions for the proxy-node agent.
//!
//! This crate provides the fundamental building blocks:
//! - `LogHub` - Per-subscriber fan-out of subprocess output
//! - `LogMsg` - Typed log line enum
//! - `ConfigDocument` / `transform` - Config validation and API injection
//! - `NodeSettings` - Typed settings consumed by the core
//! - `Executor` trait for launching the proxy core

pub mod log_hub;
pub mod log_msg;
pub mod settings;
pub mod traits;
pub mod transform;

pub use log_hub::{CloseReason, LogHub, Subscription};
pub use log_msg::LogMsg;
pub use settings::NodeSettings;
pub use traits::{Executor, ExecutorError, SpawnedProcess};
pub use transform::{ApiEndpoint, ConfigDocument, ConfigError, transform};
