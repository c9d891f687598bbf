//! Public types for the session client.

use std::time::Duration;

use serde_json::Value;

use tether_protocol::ACK_INTERVAL;

/// Connection state of the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No live socket; either never connected or between attempts.
    Disconnected,
    /// WebSocket handshake or reconnection in progress.
    Connecting,
    /// Socket live and session established.
    Connected,
    /// Closed for good; the supervisor will not reconnect.
    Closed,
}

/// Events emitted by the supervisor.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Connection state changed.
    StateChanged(ConnectionState),
    /// The server could not resume the session. Anything derived from
    /// earlier pushes is stale and must be rebuilt from scratch.
    NeedReload,
    /// A server push, delivered exactly once in sequence order.
    Push {
        channel: Option<String>,
        event: String,
        data: Option<Value>,
    },
}

/// Configuration for automatic reconnection with exponential backoff.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Initial delay before the first reconnection attempt.
    pub initial_delay: Duration,
    /// Maximum delay between attempts (backoff cap).
    pub max_delay: Duration,
    /// Multiplier for each subsequent attempt.
    pub backoff_factor: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(15),
            backoff_factor: 2.0,
        }
    }
}

impl ReconnectConfig {
    /// Calculates the delay for a given attempt number (1-based),
    /// with ±25% jitter to avoid thundering herd.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exp);
        let capped = secs.min(self.max_delay.as_secs_f64());
        // Add ±25% jitter.
        let jitter = capped * 0.25;
        let offset = (std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos() as f64
            / u32::MAX as f64)
            * 2.0
            - 1.0; // [-1.0, 1.0)
        let with_jitter = (capped + jitter * offset).max(0.05);
        Duration::from_secs_f64(with_jitter)
    }
}

/// Supervisor configuration.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// WebSocket URL of the server.
    pub url: String,
    pub reconnect: ReconnectConfig,
    /// How often processed-frame acknowledgments are sent while connected.
    pub ack_interval: Duration,
    /// Calls still unresolved after this long are rejected with
    /// [`CallError::Expired`](crate::CallError::Expired), which callers may
    /// treat as safe to retry. `None` leaves them waiting indefinitely.
    pub max_pending_age: Option<Duration>,
}

impl SupervisorConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reconnect: ReconnectConfig::default(),
            ack_interval: ACK_INTERVAL,
            max_pending_age: Some(Duration::from_secs(60)),
        }
    }
}

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Deadline for this call, counted from issue. On expiry the call
    /// fails locally with `Timeout`; the server may still have executed
    /// it. `None` waits as long as the session lives.
    pub timeout: Option<Duration>,
}
