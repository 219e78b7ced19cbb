//! MCP session registry.
//!
//! Sessions are advisory identity only: they are created on `initialize`,
//! echoed back when a client presents a known id, and never required.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

/// An MCP session. Immutable after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// 32 lowercase hex characters.
    pub id: String,
    pub created_at: DateTime<Utc>,
}

impl Session {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            created_at: Utc::now(),
        }
    }
}

/// Concurrency-safe map of live sessions.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, Session>>>,
    max_sessions: Option<usize>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry that evicts the oldest session once `max` is exceeded.
    pub fn with_max_sessions(max: Option<usize>) -> Self {
        Self {
            sessions: Arc::default(),
            max_sessions: max.filter(|m| *m > 0),
        }
    }

    /// Create and register a fresh session.
    pub async fn create(&self) -> Session {
        let session = Session::new();
        let mut sessions = self.sessions.write().await;

        if let Some(max) = self.max_sessions {
            while sessions.len() >= max {
                let oldest = sessions
                    .values()
                    .min_by_key(|s| s.created_at)
                    .map(|s| s.id.clone());
                match oldest {
                    Some(id) => {
                        sessions.remove(&id);
                        debug!("Evicted MCP session {} (cap {})", id, max);
                    }
                    None => break,
                }
            }
        }

        sessions.insert(session.id.clone(), session.clone());
        info!("Created MCP session: {}", session.id);
        session
    }

    /// Look up a session by id.
    pub async fn get(&self, id: &str) -> Option<Session> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Number of live sessions.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
