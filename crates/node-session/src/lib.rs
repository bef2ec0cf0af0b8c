//! Control-plane session tracking and Xray process supervision.
//!
//! Provides:
//! - `SessionManager` - The single active control-plane session
//! - `ProcessSupervisor` - Start, stop and crash detection for the core

pub mod session;
pub mod supervisor;

pub use session::{Session, SessionError, SessionId, SessionManager};
pub use supervisor::{
    ActiveInstance, ProcessState, ProcessSupervisor, StartError, StopError, SupervisorOptions,
};
