//! Pending-call table: request id allocation and response correlation.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Mutex, oneshot};
use tokio::time::Instant;

use crate::CallError;

pub(crate) type CallResult = Result<Value, CallError>;

struct PendingEntry {
    tx: oneshot::Sender<CallResult>,
    issued_at: Instant,
    /// Connection generation the call frame was (or will be) sent on.
    generation: u64,
}

/// Allocates request ids and pairs responses with their waiting callers.
///
/// Entries survive socket loss; they are only removed when a response
/// arrives, the caller gives up, or the whole session is invalidated.
#[derive(Clone, Default)]
pub(crate) struct PendingCalls {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    next_id: AtomicU64,
    entries: Mutex<HashMap<u64, PendingEntry>>,
}

impl PendingCalls {
    /// Returns the next request id, starting from 1.
    pub fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Registers a waiter for `req_id`. `generation` names the connection
    /// meant to carry the call frame; calls queued while disconnected are
    /// stamped with the generation that will flush them.
    pub async fn register(&self, req_id: u64, generation: u64) -> oneshot::Receiver<CallResult> {
        let (tx, rx) = oneshot::channel();
        let entry = PendingEntry {
            tx,
            issued_at: Instant::now(),
            generation,
        };
        self.inner.entries.lock().await.insert(req_id, entry);
        rx
    }

    /// Re-stamps a queued call with the generation that actually sent it.
    pub async fn restamp(&self, req_id: u64, generation: u64) {
        if let Some(entry) = self.inner.entries.lock().await.get_mut(&req_id) {
            entry.generation = generation;
        }
    }

    /// Delivers a result to the caller waiting on `req_id`. Returns false
    /// when no one is waiting (late response after timeout, or a replayed
    /// frame already seen).
    pub async fn resolve(&self, req_id: u64, result: CallResult) -> bool {
        match self.inner.entries.lock().await.remove(&req_id) {
            Some(entry) => {
                let _ = entry.tx.send(result);
                true
            }
            None => false,
        }
    }

    pub async fn remove(&self, req_id: u64) {
        self.inner.entries.lock().await.remove(&req_id);
    }

    /// Fails every outstanding call with the given error.
    pub async fn reject_all(&self, error: CallError) {
        let entries: Vec<(u64, PendingEntry)> =
            self.inner.entries.lock().await.drain().collect();
        for (_, entry) in entries {
            let _ = entry.tx.send(Err(error.clone()));
        }
    }

    /// Fails calls older than `age` with `Expired`, but only those
    /// stranded by a connection before `live_generation`. Calls riding
    /// the live connection wait for their response however long the
    /// handler takes. Returns how many were swept.
    pub async fn expire_older_than(&self, age: Duration, live_generation: u64) -> usize {
        let now = Instant::now();
        let mut entries = self.inner.entries.lock().await;
        let stale: Vec<u64> = entries
            .iter()
            .filter(|(_, e)| {
                e.generation < live_generation && now.duration_since(e.issued_at) >= age
            })
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            if let Some(entry) = entries.remove(id) {
                let _ = entry.tx.send(Err(CallError::Expired));
            }
        }
        stale.len()
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.inner.entries.lock().await.len()
    }
}
