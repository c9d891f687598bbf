//! Client session registry.
//!
//! Maps client ids to live session workers. Sessions are created on
//! demand during the handshake and live until explicitly destroyed or
//! the server shuts down; a mere disconnect leaves the session in place
//! waiting for a resume.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::methods::MethodRegistry;
use crate::session::{SessionConfig, SessionHandle, spawn_session};

pub struct ClientRegistry {
    sessions: RwLock<HashMap<String, SessionHandle>>,
    methods: Arc<MethodRegistry>,
    config: SessionConfig,
}

impl ClientRegistry {
    pub(crate) fn new(methods: Arc<MethodRegistry>, config: SessionConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            methods,
            config,
        }
    }

    /// Looks up the session for `claimed`, or spawns a fresh one when the
    /// id is absent or unknown. An unknown id gets a newly minted one
    /// rather than reviving a session this server never created. Returns
    /// the handle and whether it is new.
    pub async fn get_or_create(&self, claimed: Option<&str>) -> (SessionHandle, bool) {
        if let Some(id) = claimed
            && let Some(existing) = self.sessions.read().await.get(id)
        {
            return (existing.clone(), false);
        }

        let id = Uuid::new_v4().to_string();
        let handle = spawn_session(id.clone(), self.methods.clone(), &self.config);
        self.sessions.write().await.insert(id, handle.clone());
        (handle, true)
    }

    pub async fn get(&self, id: &str) -> Option<SessionHandle> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Tears a session down for good; its buffered frames are gone and a
    /// client presenting the id later starts over. Returns whether the id
    /// was known.
    pub async fn destroy(&self, id: &str) -> bool {
        let handle = self.sessions.write().await.remove(id);
        match handle {
            Some(handle) => {
                handle.destroy().await;
                tracing::info!(client = %id, "session destroyed");
                true
            }
            None => false,
        }
    }

    pub async fn handles(&self) -> Vec<SessionHandle> {
        self.sessions.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    pub(crate) async fn shutdown(&self) {
        let handles: Vec<SessionHandle> = self.sessions.write().await.drain().map(|(_, h)| h).collect();
        for handle in handles {
            handle.destroy().await;
        }
    }
}
