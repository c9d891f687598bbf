use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Time to wait for a pong (or any incoming frame) before a connection is
/// considered dead.
pub const PONG_WAIT: Duration = Duration::from_secs(30);

/// How often keepalive pings are sent (must be well under [`PONG_WAIT`]).
pub const PING_PERIOD: Duration = Duration::from_secs(10);

/// Time a freshly accepted socket gets to send its connect frame before
/// the server hangs up.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum frame size in bytes (1 MB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// How often a connected client acknowledges processed sequence numbers.
pub const ACK_INTERVAL: Duration = Duration::from_millis(250);

/// Default bound on buffered unacknowledged frames per session.
pub const DEFAULT_BUFFER_CAP: usize = 512;

/// Close code sent to a socket displaced by a newer connection for the
/// same client id. A client closed with this code must not reconnect on
/// its own; some other holder of the id owns the session now.
pub const CLOSE_SUPERSEDED: u16 = 4001;

/// Frame type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameType {
    /// Client-to-server method invocation.
    Call,
    /// Server reply to a call, correlated by `reqId`.
    Response,
    /// Server-initiated message, optionally scoped to a channel.
    Push,
    /// Session management: connect handshake, `clientConnect`, acks.
    Control,
    /// Forward compatibility: unknown frame types deserialize here.
    #[serde(other)]
    Unknown,
}
