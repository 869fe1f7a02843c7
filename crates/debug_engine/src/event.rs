use serde::Serialize;
use std::fmt;

/// Session lifecycle state.
///
/// `Detached`, `Terminated` and `Crashed` are terminal: a session that
/// reaches one of them is removed from the registry and cannot be
/// resurrected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Launching,
    Running,
    Stopped,
    Detached,
    Terminated,
    Crashed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Detached | SessionState::Terminated | SessionState::Crashed
        )
    }

    /// States in which the debugger accepts commands.
    pub fn accepts_commands(&self) -> bool {
        matches!(self, SessionState::Running | SessionState::Stopped)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Launching => write!(f, "launching"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Detached => write!(f, "detached"),
            Self::Terminated => write!(f, "terminated"),
            Self::Crashed => write!(f, "crashed"),
        }
    }
}

/// An unsolicited status notification decoded from the debugger stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AsyncEvent {
    ProcessStopped {
        reason: Option<String>,
        thread_index: Option<u32>,
    },
    ProcessContinued,
    ProcessExited {
        code: Option<i32>,
    },
    ProcessCrashed {
        reason: String,
    },
    RawLine(String),
}

/// Result of one completed command.
///
/// A crashed session still resolves its pending command with a well-formed
/// result carrying the crash reason, so the caller can inspect it instead
/// of receiving a bare error.
#[derive(Debug, Clone, Serialize)]
pub struct CommandResult {
    pub output: String,
    pub state: SessionState,
    pub crash_reason: Option<String>,
}

impl CommandResult {
    pub fn completed(output: String, state: SessionState) -> Self {
        Self {
            output,
            state,
            crash_reason: None,
        }
    }

    pub fn crashed(output: String, reason: String) -> Self {
        Self {
            output,
            state: SessionState::Crashed,
            crash_reason: Some(reason),
        }
    }
}

/// One active breakpoint known to the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Breakpoint {
    pub id: u32,
    pub location: String,
}
