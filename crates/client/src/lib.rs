//! Client endpoint of the tether session protocol.
//!
//! Provides a reconnecting WebSocket client with exactly-once, in-order
//! delivery of server responses and pushes across connection drops.

mod conn;
mod dispatcher;
mod supervisor;
mod types;

pub use supervisor::Supervisor;
pub use types::{CallOptions, ClientEvent, ConnectionState, ReconnectConfig, SupervisorConfig};

/// Errors establishing or operating the client connection.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("client closed")]
    Closed,
}

/// Ways a method call can fail.
///
/// `Clone` so one failure can be fanned out to every pending call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CallError {
    /// The server's handler rejected the call.
    #[error("{0}")]
    Method(String),

    /// The caller-supplied deadline passed.
    #[error("request timed out")]
    Timeout,

    /// The call waited out [`SupervisorConfig::max_pending_age`] without
    /// a connection to answer it.
    #[error("request expired during reconnect")]
    Expired,

    /// The server could not resume the session; local state is stale.
    #[error("session lost; state must be rebuilt")]
    SessionLost,

    /// The supervisor was closed.
    #[error("client closed")]
    Closed,

    #[error("JSON error: {0}")]
    Json(String),
}

impl CallError {
    /// Whether retrying the identical call is safe and sensible.
    ///
    /// Only [`CallError::Expired`] qualifies: the call was stranded on a
    /// connection that died before any response arrived, and the session
    /// it would run against is still live.
    pub fn is_retriable(&self) -> bool {
        matches!(self, CallError::Expired)
    }
}
