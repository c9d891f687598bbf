//! Wire protocol for tether sessions.
//!
//! A tether session is a long-lived, ordered conversation between one
//! logical client and a server, carried over whatever WebSocket happens to
//! be alive at the moment. Everything on the wire is a JSON text [`Frame`]:
//! client calls, server responses, server pushes, and the control frames
//! that establish and acknowledge the session stream.
//!
//! Sequence numbers are assigned by the server to `response` and `push`
//! frames only; they are what lets a reconnecting client receive each
//! frame exactly once, in order, no matter how many sockets the session
//! outlives.

mod constants;
mod frame;

pub use constants::*;
pub use frame::{Frame, PushPayload};
