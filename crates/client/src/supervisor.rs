//! Connection supervisor: one logical session across many sockets.
//!
//! The supervisor owns everything that must outlive a socket: the client
//! id, sequence progress, pending calls, queued outbound calls, and the
//! event channel. When a socket dies unexpectedly it reconnects with
//! exponential backoff, resumes the session, and flushes queued calls;
//! callers awaiting responses never notice unless the server declares the
//! gap unclosable.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use tether_protocol::Frame;

use crate::conn::{self, Connection, Handshake, Progress, PumpExit, WsReadHalf};
use crate::dispatcher::PendingCalls;
use crate::types::{CallOptions, ClientEvent, ConnectionState, SupervisorConfig};
use crate::{CallError, ClientError};

/// Event queue depth before push handling backpressures the socket.
const EVENT_BUFFER_SIZE: usize = 256;

/// Shared state passed to free functions for connection setup and
/// reconnection. Avoids threading a dozen separate Arc parameters.
#[derive(Clone)]
struct Ctx {
    config: Arc<SupervisorConfig>,
    pending: PendingCalls,
    progress: Arc<Progress>,
    state: Arc<RwLock<ConnectionState>>,
    client_id: Arc<Mutex<Option<String>>>,
    /// Whether any handshake has completed yet. A reload on the very
    /// first connect is just a fresh session, not lost state.
    had_session: Arc<AtomicBool>,
    conn: Arc<Mutex<Option<Connection>>>,
    conn_gen: Arc<AtomicU64>,
    /// Calls issued while no socket was live, waiting to be sent.
    backlog: Arc<Mutex<VecDeque<Frame>>>,
    events_tx: mpsc::Sender<ClientEvent>,
    root_cancel: CancellationToken,
    reconnect_cancel: Arc<std::sync::Mutex<Option<CancellationToken>>>,
}

/// Client endpoint of the session protocol.
pub struct Supervisor {
    ctx: Ctx,
    events_rx: Mutex<Option<mpsc::Receiver<ClientEvent>>>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER_SIZE);
        let ctx = Ctx {
            config: Arc::new(config),
            pending: PendingCalls::default(),
            progress: Arc::new(Progress::default()),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            client_id: Arc::new(Mutex::new(None)),
            had_session: Arc::new(AtomicBool::new(false)),
            conn: Arc::new(Mutex::new(None)),
            conn_gen: Arc::new(AtomicU64::new(0)),
            backlog: Arc::new(Mutex::new(VecDeque::new())),
            events_tx,
            root_cancel: CancellationToken::new(),
            reconnect_cancel: Arc::new(std::sync::Mutex::new(None)),
        };
        Self {
            ctx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    /// Takes the event receiver. Can only be called once.
    pub async fn take_events(&self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.events_rx.lock().await.take()
    }

    pub async fn state(&self) -> ConnectionState {
        *self.ctx.state.read().await
    }

    /// The id the server assigned to this session, once connected.
    pub async fn client_id(&self) -> Option<String> {
        self.ctx.client_id.lock().await.clone()
    }

    /// Makes one connection attempt. On failure the caller decides when
    /// to try again; automatic reconnection only kicks in after an
    /// established connection drops.
    pub async fn connect(&self) -> Result<(), ClientError> {
        {
            let state = self.ctx.state.read().await;
            match *state {
                ConnectionState::Closed => return Err(ClientError::Closed),
                ConnectionState::Connected | ConnectionState::Connecting => return Ok(()),
                ConnectionState::Disconnected => {}
            }
        }
        // An explicit connect takes over from any scheduled retry.
        cancel_any_reconnect(&self.ctx.reconnect_cancel);
        set_state(&self.ctx, ConnectionState::Connecting).await;
        match try_connect_once(&self.ctx).await {
            Ok(()) => Ok(()),
            Err(e) => {
                set_state(&self.ctx, ConnectionState::Disconnected).await;
                Err(e)
            }
        }
    }

    /// Calls a server method and waits for its response.
    ///
    /// The call survives reconnects: if issued while disconnected it is
    /// queued and sent after resume. It fails only when the method
    /// errors, the session is lost, or the supervisor is closed.
    pub async fn call<T: Serialize + ?Sized>(
        &self,
        method: &str,
        args: Option<&T>,
    ) -> Result<Value, CallError> {
        self.call_with(method, args, CallOptions::default()).await
    }

    /// [`call`](Self::call) with an explicit per-call deadline.
    pub async fn call_with<T: Serialize + ?Sized>(
        &self,
        method: &str,
        args: Option<&T>,
        options: CallOptions,
    ) -> Result<Value, CallError> {
        if *self.ctx.state.read().await == ConnectionState::Closed {
            return Err(CallError::Closed);
        }
        let req_id = self.ctx.pending.next_id();
        let frame =
            Frame::call(req_id, method, args).map_err(|e| CallError::Json(e.to_string()))?;
        // Stamp the call with the connection that will carry it; a call
        // queued while disconnected rides the next one to come up.
        let generation = {
            let connected = *self.ctx.state.read().await == ConnectionState::Connected;
            let current = self.ctx.conn_gen.load(Ordering::Acquire);
            if connected { current } else { current + 1 }
        };
        let rx = self.ctx.pending.register(req_id, generation).await;
        send_or_backlog(&self.ctx, frame).await?;

        // close() may have drained the pending table between our
        // registration and here, in which case nothing will ever resolve
        // this receiver.
        if *self.ctx.state.read().await == ConnectionState::Closed {
            self.ctx.pending.remove(req_id).await;
            return Err(CallError::Closed);
        }

        let result = match options.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, rx).await {
                Ok(inner) => inner,
                Err(_) => {
                    self.ctx.pending.remove(req_id).await;
                    return Err(CallError::Timeout);
                }
            },
            None => rx.await,
        };
        match result {
            Ok(outcome) => outcome,
            Err(_) => Err(CallError::Closed),
        }
    }

    /// Shuts the supervisor down for good. Pending and queued calls fail
    /// with [`CallError::Closed`]; no reconnection happens afterwards.
    pub async fn close(&self) {
        self.ctx.root_cancel.cancel();
        cancel_any_reconnect(&self.ctx.reconnect_cancel);
        if let Some(conn) = self.ctx.conn.lock().await.take() {
            conn.cancel.cancel();
        }
        set_closed(&self.ctx).await;
        self.ctx.pending.reject_all(CallError::Closed).await;
        self.ctx.backlog.lock().await.clear();
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.ctx.root_cancel.cancel();
        cancel_any_reconnect(&self.ctx.reconnect_cancel);
    }
}

/// Cancels any active reconnect loop.
fn cancel_any_reconnect(slot: &std::sync::Mutex<Option<CancellationToken>>) {
    if let Ok(mut guard) = slot.lock()
        && let Some(token) = guard.take()
    {
        token.cancel();
    }
}

async fn set_state(ctx: &Ctx, new: ConnectionState) {
    {
        let mut state = ctx.state.write().await;
        if *state == new || *state == ConnectionState::Closed {
            return;
        }
        *state = new;
    }
    let _ = ctx.events_tx.send(ClientEvent::StateChanged(new)).await;
}

async fn set_closed(ctx: &Ctx) {
    {
        let mut state = ctx.state.write().await;
        if *state == ConnectionState::Closed {
            return;
        }
        *state = ConnectionState::Closed;
    }
    let _ = ctx
        .events_tx
        .send(ClientEvent::StateChanged(ConnectionState::Closed))
        .await;
}

/// Dials, applies the handshake, installs the connection, and starts the
/// monitor. Used by both the initial connect and the reconnect loop.
async fn try_connect_once(ctx: &Ctx) -> Result<(), ClientError> {
    let claimed = ctx.client_id.lock().await.clone();
    let last = ctx.progress.last_processed.load(Ordering::Relaxed);
    let (conn, read, handshake) = conn::establish(
        &ctx.config.url,
        claimed.as_deref(),
        last,
        &ctx.root_cancel,
    )
    .await?;

    apply_handshake(ctx, &handshake).await;

    let generation = ctx.conn_gen.fetch_add(1, Ordering::AcqRel) + 1;
    *ctx.conn.lock().await = Some(conn.clone());
    set_state(ctx, ConnectionState::Connected).await;
    flush_backlog(ctx).await;
    spawn_monitor(ctx.clone(), read, conn, generation);
    Ok(())
}

/// Applies the server's `clientConnect` to session state.
async fn apply_handshake(ctx: &Ctx, handshake: &Handshake) {
    *ctx.client_id.lock().await = Some(handshake.client_id.clone());
    let had_session = ctx.had_session.swap(true, Ordering::AcqRel);

    if !handshake.need_reload {
        tracing::info!(client = %handshake.client_id, "session resumed");
        return;
    }

    // The server starts us at its current watermark; everything older is
    // unrecoverable.
    ctx.progress
        .last_processed
        .store(handshake.baseline, Ordering::Relaxed);
    ctx.progress
        .last_acked
        .store(handshake.baseline, Ordering::Relaxed);

    if had_session {
        tracing::warn!(client = %handshake.client_id, "session not resumable; local state is stale");
        // In-flight calls belong to the dead session and will never get
        // answers; queued calls would execute against unknown state.
        ctx.pending.reject_all(CallError::SessionLost).await;
        let dropped = {
            let mut backlog = ctx.backlog.lock().await;
            let n = backlog.len();
            backlog.clear();
            n
        };
        if dropped > 0 {
            tracing::debug!(dropped, "discarded queued calls");
        }
        let _ = ctx.events_tx.send(ClientEvent::NeedReload).await;
    } else {
        tracing::info!(client = %handshake.client_id, "session established");
    }
}

/// Sends a call frame on the live connection, or queues it until one
/// exists.
async fn send_or_backlog(ctx: &Ctx, frame: Frame) -> Result<(), CallError> {
    let conn = ctx.conn.lock().await.clone();
    if let Some(conn) = conn {
        let json = serde_json::to_string(&frame).map_err(|e| CallError::Json(e.to_string()))?;
        if conn.write_tx.send(WsMessage::Text(json.into())).await.is_ok() {
            return Ok(());
        }
        // The socket died before the frame left this process, so sending
        // it later cannot double-execute the call.
    }
    ctx.backlog.lock().await.push_back(frame);
    // The connection may have been replaced between the failed send and
    // the queueing; flush immediately rather than waiting for the next
    // reconnect.
    if *ctx.state.read().await == ConnectionState::Connected {
        flush_backlog(ctx).await;
    }
    Ok(())
}

/// Sends queued calls in issue order over the current connection.
async fn flush_backlog(ctx: &Ctx) {
    let conn = ctx.conn.lock().await.clone();
    let Some(conn) = conn else { return };
    let live = ctx.conn_gen.load(Ordering::Acquire);
    let mut backlog = ctx.backlog.lock().await;
    if backlog.is_empty() {
        return;
    }
    let queued = backlog.len();
    while let Some(frame) = backlog.pop_front() {
        let req_id = frame.req_id;
        match serde_json::to_string(&frame) {
            Ok(json) => {
                if conn.write_tx.send(WsMessage::Text(json.into())).await.is_err() {
                    backlog.push_front(frame);
                    break;
                }
                // The call may have been stamped for an earlier attempt;
                // it now belongs to this connection.
                if let Some(req_id) = req_id {
                    ctx.pending.restamp(req_id, live).await;
                }
            }
            Err(e) => {
                tracing::warn!("dropping unserializable queued call: {e}");
            }
        }
    }
    tracing::debug!(queued, remaining = backlog.len(), "flushed queued calls");
}

/// Watches one connection's read pump and decides what happens after it
/// exits.
fn spawn_monitor(ctx: Ctx, read: WsReadHalf, conn: Connection, generation: u64) {
    tokio::spawn(async move {
        let exit = conn::read_pump(
            read,
            conn.write_tx.clone(),
            ctx.pending.clone(),
            ctx.events_tx.clone(),
            ctx.progress.clone(),
            generation,
            ctx.config.ack_interval,
            ctx.config.max_pending_age,
            conn.cancel.clone(),
        )
        .await;
        conn.cancel.cancel();

        // A monitor whose connection was already replaced must not touch
        // shared state; the replacement owns it now.
        let current = {
            let mut slot = ctx.conn.lock().await;
            if ctx.conn_gen.load(Ordering::Acquire) == generation {
                *slot = None;
                true
            } else {
                false
            }
        };

        if !current || ctx.root_cancel.is_cancelled() {
            return;
        }

        match exit {
            PumpExit::Superseded => {
                // Another client instance owns the session now; fighting
                // it over the socket would just flap both. Responses to
                // calls in flight will never reach this instance, and
                // queued calls would run against state it no longer sees.
                ctx.pending.reject_all(CallError::SessionLost).await;
                ctx.backlog.lock().await.clear();
                set_state(&ctx, ConnectionState::Disconnected).await;
            }
            PumpExit::Dropped => {
                set_state(&ctx, ConnectionState::Disconnected).await;
                let cancel = CancellationToken::new();
                cancel_any_reconnect(&ctx.reconnect_cancel);
                if let Ok(mut guard) = ctx.reconnect_cancel.lock() {
                    *guard = Some(cancel.clone());
                }
                tokio::spawn(reconnect_loop(ctx.clone(), cancel));
            }
        }
    });
}

/// Reconnection loop with exponential backoff.
async fn reconnect_loop(ctx: Ctx, cancel: CancellationToken) {
    let mut attempt: u32 = 0;

    loop {
        attempt = attempt.saturating_add(1);
        let delay = ctx.config.reconnect.delay_for_attempt(attempt);

        tracing::info!(
            attempt,
            delay_secs = format_args!("{:.1}", delay.as_secs_f64()),
            "reconnecting"
        );

        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("reconnect cancelled");
                return;
            }
            _ = ctx.root_cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        if cancel.is_cancelled() {
            return;
        }

        // The ack pump only runs while a socket is up, so calls stranded
        // by the dead connection are also swept here, where reconnection
        // may stall indefinitely. Queued calls stamped for the upcoming
        // connection have never been sent and are spared.
        if let Some(age) = ctx.config.max_pending_age {
            let next_generation = ctx.conn_gen.load(Ordering::Acquire) + 1;
            let expired = ctx.pending.expire_older_than(age, next_generation).await;
            if expired > 0 {
                tracing::warn!(expired, "expired stranded calls while disconnected");
            }
        }

        set_state(&ctx, ConnectionState::Connecting).await;
        match try_connect_once(&ctx).await {
            Ok(()) => {
                tracing::info!(attempt, "reconnected");
                break;
            }
            Err(e) => {
                tracing::warn!(attempt, error = %e, "reconnect attempt failed");
                set_state(&ctx, ConnectionState::Disconnected).await;
            }
        }

        if cancel.is_cancelled() {
            return;
        }
    }
}
