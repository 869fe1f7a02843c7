use std::collections::HashMap;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::error::Result;
use crate::event::SessionState;
use crate::launch::LaunchSpec;
use crate::session::Session;

/// Creates sessions on behalf of the registry. A seam so registry
/// behavior is testable without spawning a real debugger.
#[async_trait]
pub trait SessionSpawner: Send + Sync {
    async fn spawn(&self, config: &EngineConfig, spec: &LaunchSpec) -> Result<Session>;
}

struct DebuggerSpawner;

#[async_trait]
impl SessionSpawner for DebuggerSpawner {
    async fn spawn(&self, config: &EngineConfig, spec: &LaunchSpec) -> Result<Session> {
        Session::launch(config, spec).await
    }
}

/// Snapshot of one registered session, as reported to callers.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub target: String,
    pub state: SessionState,
    pub pid: Option<u32>,
}

/// Keyed store of live sessions, at most one per target.
///
/// The map lock is held across the existence check and session creation,
/// so two concurrent requests for the same target resolve to one debugger
/// spawn with both callers sharing the session that results.
pub struct SessionRegistry {
    config: EngineConfig,
    spawner: Box<dyn SessionSpawner>,
    sessions: Mutex<HashMap<String, Session>>,
}

impl SessionRegistry {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_spawner(config, Box::new(DebuggerSpawner))
    }

    pub(crate) fn with_spawner(config: EngineConfig, spawner: Box<dyn SessionSpawner>) -> Self {
        Self {
            config,
            spawner,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the live session for the target, creating it if absent.
    /// A terminal leftover under the same key is evicted and replaced.
    pub async fn obtain(&self, spec: &LaunchSpec) -> Result<Session> {
        let key = spec.target.key();
        let mut sessions = self.sessions.lock().await;

        if let Some(existing) = sessions.get(&key) {
            if !existing.state().is_terminal() {
                debug!("reusing session '{key}' ({})", existing.state());
                return Ok(existing.clone());
            }
            debug!("evicting ended session '{key}' ({})", existing.state());
            sessions.remove(&key);
        }

        info!("creating session '{key}'");
        let session = self.spawner.spawn(&self.config, spec).await?;
        sessions.insert(key, session.clone());
        Ok(session)
    }

    /// Looks up a session by target key without creating one. Terminal
    /// sessions are evicted rather than handed out.
    pub async fn get(&self, key: &str) -> Option<Session> {
        let mut sessions = self.sessions.lock().await;
        match sessions.get(key) {
            Some(session) if !session.state().is_terminal() => Some(session.clone()),
            Some(_) => {
                debug!("evicting ended session '{key}' on lookup");
                sessions.remove(key);
                None
            }
            None => None,
        }
    }

    pub async fn remove(&self, key: &str) -> Option<Session> {
        self.sessions.lock().await.remove(key)
    }

    pub async fn list(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.lock().await;
        let mut infos: Vec<SessionInfo> = sessions
            .iter()
            .map(|(key, session)| SessionInfo {
                target: key.clone(),
                state: session.state(),
                pid: session.pid(),
            })
            .collect();
        infos.sort_by(|a, b| a.target.cmp(&b.target));
        infos
    }
}
