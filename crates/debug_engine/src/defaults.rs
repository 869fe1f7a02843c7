use std::path::PathBuf;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::launch::TargetSpec;

/// Target as recorded in the shared defaults file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TargetRecord {
    Executable {
        path: PathBuf,
        #[serde(default)]
        args: Vec<String>,
    },
    Bundle {
        id: String,
    },
}

impl TargetRecord {
    pub fn to_target_spec(&self) -> TargetSpec {
        match self {
            TargetRecord::Executable { path, args } => TargetSpec::Executable {
                path: path.clone(),
                args: args.clone(),
            },
            TargetRecord::Bundle { id } => TargetSpec::Bundle { id: id.clone() },
        }
    }
}

/// The session-defaults record other tooling maintains.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SessionDefaults {
    pub target: Option<TargetRecord>,
    #[serde(default)]
    pub context: Option<serde_json::Value>,
}

/// Read-only view of the shared defaults file.
///
/// Reloaded on every access so edits made by other tools are picked up
/// without restarting; a missing or malformed file means "no default",
/// never an error.
pub struct DefaultsStore {
    path: Option<PathBuf>,
}

impl DefaultsStore {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    pub fn current(&self) -> Option<SessionDefaults> {
        let path = self.path.as_ref()?;
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) => {
                debug!("defaults file {} not readable: {err}", path.display());
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(defaults) => Some(defaults),
            Err(err) => {
                warn!("defaults file {} is malformed: {err}", path.display());
                None
            }
        }
    }

    /// The recorded default target, if any.
    pub fn default_target(&self) -> Option<TargetSpec> {
        self.current()?
            .target
            .as_ref()
            .map(TargetRecord::to_target_spec)
    }
}
