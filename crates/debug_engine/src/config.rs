use std::path::PathBuf;
use std::time::Duration;

/// Engine configuration, resolved once at startup.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Debugger binary launched on the PTY slave side.
    pub debugger_path: PathBuf,
    /// Helper binary used by the launch-then-attach strategy to start
    /// bundle targets suspended.
    pub launcher_path: PathBuf,
    /// Default deadline for one in-flight command.
    pub command_timeout: Duration,
    /// Deadline for the Launching -> Running handshake.
    pub launch_timeout: Duration,
    /// On-disk session-defaults record, reloaded on access.
    pub defaults_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            debugger_path: PathBuf::from("lldb"),
            launcher_path: PathBuf::from("app-launcher"),
            command_timeout: Duration::from_secs(30),
            launch_timeout: Duration::from_secs(15),
            defaults_path: None,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let debugger_path = std::env::var("DEBUGGER_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.debugger_path);

        let launcher_path = std::env::var("APP_LAUNCHER_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.launcher_path);

        let command_timeout = std::env::var("DEBUG_COMMAND_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.command_timeout);

        let launch_timeout = std::env::var("DEBUG_LAUNCH_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.launch_timeout);

        let defaults_path = std::env::var("SESSION_DEFAULTS_PATH").ok().map(PathBuf::from);

        Self {
            debugger_path,
            launcher_path,
            command_timeout,
            launch_timeout,
            defaults_path,
        }
    }
}
