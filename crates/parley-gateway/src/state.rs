//! Gateway shared state.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use parley_core::config::Config;
use parley_pipeline::{ComponentPool, Pipeline};

/// Shared gateway state accessible from all connections and handlers.
pub struct GatewayState {
    pub config: Arc<Config>,
    pub pool: Arc<ComponentPool>,
    pub sessions: RwLock<HashMap<String, SessionHandle>>,
    pub total_sessions: AtomicU64,
}

/// A live call.
pub struct SessionHandle {
    pub conn_id: String,
    pub call_sid: String,
    pub pipeline: Arc<Pipeline>,
    pub started_at: DateTime<Utc>,
}

impl GatewayState {
    pub fn new(config: Arc<Config>, pool: Arc<ComponentPool>) -> Self {
        Self {
            config,
            pool,
            sessions: RwLock::new(HashMap::new()),
            total_sessions: AtomicU64::new(0),
        }
    }

    pub async fn register(&self, stream_sid: &str, handle: SessionHandle) {
        self.total_sessions.fetch_add(1, Ordering::Relaxed);
        self.sessions
            .write()
            .await
            .insert(stream_sid.to_string(), handle);
    }

    pub async fn unregister(&self, stream_sid: &str) -> Option<SessionHandle> {
        self.sessions.write().await.remove(stream_sid)
    }

    pub async fn active_sessions(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub fn total_sessions(&self) -> u64 {
        self.total_sessions.load(Ordering::Relaxed)
    }

    /// Cancel every live pipeline. Returns how many were cancelled.
    pub async fn cancel_all(&self) -> usize {
        let sessions = self.sessions.read().await;
        for handle in sessions.values() {
            handle.pipeline.cancel();
        }
        sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_pipeline::PipelineSettings;

    #[tokio::test]
    async fn test_empty_state() {
        let state = GatewayState::new(
            Arc::new(Config::default()),
            Arc::new(ComponentPool::new(PipelineSettings::default())),
        );
        assert_eq!(state.active_sessions().await, 0);
        assert!(state.unregister("MZ1").await.is_none());
        assert_eq!(state.cancel_all().await, 0);
        assert_eq!(state.total_sessions(), 0);
    }
}
