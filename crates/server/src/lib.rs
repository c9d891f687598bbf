//! Session-resilient WebSocket messaging server.
//!
//! Clients hold a logical session that outlives any single socket: the
//! server sequences every response and push, buffers them until the client
//! acknowledges receipt, and replays the missed suffix when the client
//! comes back. A reconnecting client therefore sees each frame exactly
//! once and in order, or is told to reload when the gap can no longer be
//! closed.

mod methods;
mod origin;
mod registry;
mod sequencer;
mod server;
mod session;

pub use methods::{Caller, MethodError, MethodRegistry, MethodResult};
pub use origin::{OriginPolicy, is_origin_allowed};
pub use registry::ClientRegistry;
pub use server::{MessageServer, ServerConfig};
pub use session::{SessionConfig, SessionHandle};

/// Send buffer capacity per socket.
///
/// A resume can enqueue an entire missed-frame buffer in one burst; 2048
/// leaves comfortable headroom over the default buffer cap.
pub const SEND_BUFFER_SIZE: usize = 2048;

/// Errors produced by the server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown client: {0}")]
    UnknownClient(String),

    #[error("session terminated")]
    SessionClosed,
}
