use std::time::Duration;
use thiserror::Error;

/// Engine-level failure taxonomy.
///
/// Transport and demultiplexer I/O failures never escape as raw
/// `std::io::Error`; the session translates them into one of these kinds
/// before they reach the public contract, always with a human-readable
/// diagnostic extracted from the last observed output.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Failed to spawn debugger: {0}")]
    Spawn(String),

    #[error("Launch failed: {0}")]
    LaunchFailed(String),

    #[error("Session is closed: {0}")]
    Closed(String),

    #[error("Command failed: {0}")]
    CommandFailed(String),

    #[error("Command timed out after {0:?}")]
    Timeout(Duration),

    #[error("Process crash detected: {0}")]
    CrashDetected(String),
}

impl EngineError {
    /// True for kinds that end the session; `Timeout` and `CommandFailed`
    /// are local to one command and leave the session usable.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            EngineError::Timeout(_) | EngineError::CommandFailed(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
