use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::conversation::ConversationLog;
use crate::error::{EcoAssistantError, Result};
use crate::location::LocationPanel;

/// Which input control is active. There is no implicit default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputMode {
    #[default]
    Unselected,
    Text,
    Image,
}

/// All state belonging to one browser session. Dropped when the session ends.
#[derive(Debug)]
pub struct Session {
    pub id: Uuid,
    pub conversation: ConversationLog,
    pub input_mode: InputMode,
    pub location: LocationPanel,
    pub created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
}

impl Session {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            conversation: ConversationLog::new(),
            input_mode: InputMode::Unselected,
            location: LocationPanel::default(),
            created_at: now,
            last_activity: now,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_activity).to_std().unwrap_or_default()
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

pub type SessionHandle = Arc<Mutex<Session>>;

/// Registry of live sessions. Each session sits behind its own mutex so a
/// session handles one interaction at a time while others proceed.
pub struct SessionStore {
    sessions: RwLock<HashMap<Uuid, SessionHandle>>,
    idle_ttl: Duration,
}

impl SessionStore {
    pub fn new(idle_ttl: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            idle_ttl,
        }
    }

    pub async fn create(&self) -> SessionHandle {
        self.evict_idle().await;
        let session = Session::new();
        let id = session.id;
        let handle = Arc::new(Mutex::new(session));
        self.sessions.write().await.insert(id, Arc::clone(&handle));
        tracing::info!(session = %id, "Session started");
        handle
    }

    pub async fn get(&self, id: Uuid) -> Result<SessionHandle> {
        self.sessions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| EcoAssistantError::SessionNotFound(id.to_string()))
    }

    pub async fn end(&self, id: Uuid) -> Result<()> {
        match self.sessions.write().await.remove(&id) {
            Some(_) => {
                tracing::info!(session = %id, "Session ended");
                Ok(())
            }
            None => Err(EcoAssistantError::SessionNotFound(id.to_string())),
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Drop sessions idle longer than the configured TTL. Sessions busy with
    /// an interaction are skipped.
    pub async fn evict_idle(&self) -> usize {
        let now = Utc::now();
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|id, handle| match handle.try_lock() {
            Ok(session) => {
                let keep = session.idle_for(now) < self.idle_ttl;
                if !keep {
                    tracing::info!(session = %id, "Session expired");
                }
                keep
            }
            Err(_) => true,
        });
        before - sessions.len()
    }
}
