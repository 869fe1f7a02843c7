//! Debug Engine
//!
//! An async library for holding interactive debug sessions against a
//! command-line debugger over a pseudo-terminal. Provides structured
//! config, error handling, stream demultiplexing, crash detection, and a
//! keyed registry of long-lived session actors.

pub mod config;
pub mod defaults;
pub mod demux;
pub mod detector;
pub mod error;
pub mod event;
pub mod launch;
pub mod registry;
pub mod session;
pub mod transport;

// Re-export commonly used types
pub use config::EngineConfig;
pub use defaults::DefaultsStore;
pub use error::{EngineError, Result};
pub use event::{AsyncEvent, Breakpoint, CommandResult, SessionState};
pub use launch::{LaunchSpec, TargetSpec};
pub use registry::{SessionInfo, SessionRegistry};
pub use session::Session;
