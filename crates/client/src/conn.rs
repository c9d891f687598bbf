//! Single-connection plumbing: dial, handshake, read/write pumps.
//!
//! Everything here lives and dies with one socket. Session state that
//! outlasts a socket (the pending-call table, sequence progress, the
//! event channel) is owned by the supervisor and threaded through.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::{Message as WsMessage, WebSocketConfig};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async_with_config};
use tokio_util::sync::CancellationToken;

use tether_protocol::{
    CLOSE_SUPERSEDED, Frame, FrameType, HANDSHAKE_TIMEOUT, MAX_FRAME_SIZE, PONG_WAIT, PushPayload,
};

use crate::dispatcher::PendingCalls;
use crate::types::ClientEvent;
use crate::{CallError, ClientError};

/// Outbound queue depth per connection.
const WRITE_BUFFER_SIZE: usize = 256;

pub(crate) type WsReadHalf = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Live socket handle: queue frames on `write_tx`, cancel to tear down.
#[derive(Clone)]
pub(crate) struct Connection {
    pub write_tx: mpsc::Sender<WsMessage>,
    pub cancel: CancellationToken,
}

/// The server's `clientConnect` reply.
pub(crate) struct Handshake {
    pub client_id: String,
    pub need_reload: bool,
    /// Sequence watermark to reposition at when `need_reload` is set.
    pub baseline: u64,
}

/// Sequence progress shared between pump and supervisor.
#[derive(Default)]
pub(crate) struct Progress {
    /// Highest sequence number fully processed.
    pub last_processed: AtomicU64,
    /// Highest sequence number acknowledged to the server.
    pub last_acked: AtomicU64,
}

/// Why the read pump stopped.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum PumpExit {
    /// Socket died; the supervisor should reconnect.
    Dropped,
    /// The server closed this socket because a newer one took over the
    /// session. Reconnecting would only steal it back.
    Superseded,
}

/// Dials the server, sends the connect frame, and waits for the
/// `clientConnect` reply. The write pump is already running on the
/// returned connection; the caller drives the read half.
pub(crate) async fn establish(
    url: &str,
    client_id: Option<&str>,
    last_seq: u64,
    parent_cancel: &CancellationToken,
) -> Result<(Connection, WsReadHalf, Handshake), ClientError> {
    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(MAX_FRAME_SIZE);
    ws_config.max_frame_size = Some(MAX_FRAME_SIZE);
    let (ws_stream, _) = connect_async_with_config(url, Some(ws_config), false).await?;
    let (write, mut read) = ws_stream.split();

    let (write_tx, write_rx) = mpsc::channel::<WsMessage>(WRITE_BUFFER_SIZE);
    let cancel = parent_cancel.child_token();
    tokio::spawn(write_pump(write, write_rx, cancel.clone()));

    let connect = Frame::connect(client_id, last_seq);
    let json = serde_json::to_string(&connect)?;
    write_tx
        .send(WsMessage::Text(json.into()))
        .await
        .map_err(|_| ClientError::Closed)?;

    let handshake = match tokio::time::timeout(HANDSHAKE_TIMEOUT, read_handshake(&mut read)).await
    {
        Ok(Ok(handshake)) => handshake,
        Ok(Err(e)) => {
            cancel.cancel();
            return Err(e);
        }
        Err(_) => {
            cancel.cancel();
            return Err(ClientError::Handshake("timed out waiting for server".into()));
        }
    };

    let conn = Connection { write_tx, cancel };
    Ok((conn, read, handshake))
}

async fn read_handshake(read: &mut WsReadHalf) -> Result<Handshake, ClientError> {
    while let Some(msg) = read.next().await {
        match msg? {
            WsMessage::Text(text) => {
                let frame: Frame = serde_json::from_str(&text)?;
                if frame.frame_type != FrameType::Control {
                    return Err(ClientError::Handshake(format!(
                        "expected clientConnect, got {:?} frame",
                        frame.frame_type
                    )));
                }
                let client_id = frame
                    .client_id
                    .ok_or_else(|| ClientError::Handshake("clientConnect without clientId".into()))?;
                return Ok(Handshake {
                    client_id,
                    need_reload: frame.need_reload.unwrap_or(false),
                    baseline: frame.seq.unwrap_or(0),
                });
            }
            WsMessage::Close(_) => {
                return Err(ClientError::Handshake("socket closed during handshake".into()));
            }
            _ => {}
        }
    }
    Err(ClientError::Handshake("socket ended during handshake".into()))
}

/// Writes queued messages to the socket until cancelled.
pub(crate) async fn write_pump<S>(
    mut write: S,
    mut write_rx: mpsc::Receiver<WsMessage>,
    cancel: CancellationToken,
) where
    S: SinkExt<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = write_rx.recv() => {
                match msg {
                    Some(m) => {
                        if let Err(e) = write.send(m).await {
                            tracing::debug!("write error: {e}");
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    let _ = write.send(WsMessage::Close(None)).await;
}

/// Reads frames until the socket dies, dispatching responses to pending
/// calls and pushes to the event channel.
///
/// A deadline detects dead connections: any incoming message resets it,
/// and the server pings often enough to keep a healthy socket inside the
/// window. The acknowledgment timer batches acks so a burst of frames
/// costs one control frame. `generation` is this connection's number;
/// the stale-call sweep spares everything sent on it.
pub(crate) async fn read_pump<S>(
    mut read: S,
    write_tx: mpsc::Sender<WsMessage>,
    pending: PendingCalls,
    events_tx: mpsc::Sender<ClientEvent>,
    progress: Arc<Progress>,
    generation: u64,
    ack_interval: Duration,
    max_pending_age: Option<Duration>,
    cancel: CancellationToken,
) -> PumpExit
where
    S: StreamExt<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let pong_deadline = tokio::time::sleep(PONG_WAIT);
    tokio::pin!(pong_deadline);
    let mut ack_timer = tokio::time::interval(ack_interval);
    ack_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut exit = PumpExit::Dropped;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            () = &mut pong_deadline => {
                tracing::warn!("server silent too long, closing socket");
                break;
            }

            _ = ack_timer.tick() => {
                flush_ack(&write_tx, &progress).await;
                // Only calls stranded by earlier connections can expire;
                // calls in flight on this socket wait for their response.
                if let Some(age) = max_pending_age {
                    let swept = pending.expire_older_than(age, generation).await;
                    if swept > 0 {
                        tracing::debug!(swept, "expired stranded calls");
                    }
                }
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(msg)) => {
                        // Any traffic proves the connection is alive.
                        pong_deadline.as_mut().reset(tokio::time::Instant::now() + PONG_WAIT);

                        match msg {
                            WsMessage::Text(text) => {
                                handle_frame(&text, &pending, &events_tx, &progress).await;
                            }
                            WsMessage::Ping(data) => {
                                let _ = write_tx.send(WsMessage::Pong(data)).await;
                            }
                            WsMessage::Pong(_) => {}
                            WsMessage::Close(frame) => {
                                if let Some(ref f) = frame
                                    && u16::from(f.code) == CLOSE_SUPERSEDED
                                {
                                    tracing::info!("session taken over by another connection");
                                    exit = PumpExit::Superseded;
                                }
                                tracing::debug!("received close frame");
                                break;
                            }
                            _ => {}
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!("read error: {e}");
                        break;
                    }
                    None => {
                        tracing::debug!("stream ended");
                        break;
                    }
                }
            }
        }
    }

    // Final ack so a clean disconnect leaves the server caught up.
    flush_ack(&write_tx, &progress).await;
    exit
}

/// Sends an ack for the latest processed sequence, if it advanced.
async fn flush_ack(write_tx: &mpsc::Sender<WsMessage>, progress: &Progress) {
    let processed = progress.last_processed.load(Ordering::Relaxed);
    if processed <= progress.last_acked.load(Ordering::Relaxed) {
        return;
    }
    let Ok(json) = serde_json::to_string(&Frame::ack(processed)) else {
        return;
    };
    if write_tx.send(WsMessage::Text(json.into())).await.is_ok() {
        progress.last_acked.store(processed, Ordering::Relaxed);
    }
}

/// Parses and dispatches one inbound text frame.
async fn handle_frame(
    text: &str,
    pending: &PendingCalls,
    events_tx: &mpsc::Sender<ClientEvent>,
    progress: &Progress,
) {
    let frame: Frame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(e) => {
            tracing::warn!("malformed frame ignored: {e}");
            return;
        }
    };

    match frame.frame_type {
        FrameType::Response | FrameType::Push => {
            let Some(seq) = frame.seq else {
                tracing::warn!(frame_type = ?frame.frame_type, "sequenced frame without seq dropped");
                return;
            };
            // Replay after reconnect can resend frames we already
            // handled before our ack reached the server.
            if seq <= progress.last_processed.load(Ordering::Relaxed) {
                tracing::trace!(seq, "duplicate frame dropped");
                return;
            }
            deliver(frame, pending, events_tx).await;
            progress.last_processed.store(seq, Ordering::Relaxed);
        }
        FrameType::Control => {
            // The only expected control frame is the handshake reply,
            // which the supervisor consumes before the pump starts.
            tracing::debug!("unexpected control frame ignored");
        }
        other => {
            tracing::warn!(frame_type = ?other, "unexpected frame type");
        }
    }
}

async fn deliver(frame: Frame, pending: &PendingCalls, events_tx: &mpsc::Sender<ClientEvent>) {
    match frame.frame_type {
        FrameType::Response => {
            let Some(req_id) = frame.req_id else {
                tracing::warn!("response without reqId dropped");
                return;
            };
            let result = match frame.error {
                Some(message) => Err(CallError::Method(message)),
                None => match frame.parse_data::<Value>() {
                    Ok(data) => Ok(data.unwrap_or(Value::Null)),
                    Err(e) => Err(CallError::Json(e.to_string())),
                },
            };
            if !pending.resolve(req_id, result).await {
                tracing::debug!(req_id, "response for unknown call dropped");
            }
        }
        FrameType::Push => {
            let payload = match frame.parse_data::<PushPayload>() {
                Ok(Some(p)) => p,
                Ok(None) => {
                    tracing::warn!("push without payload dropped");
                    return;
                }
                Err(e) => {
                    tracing::warn!("malformed push payload dropped: {e}");
                    return;
                }
            };
            let event = ClientEvent::Push {
                channel: frame.channel,
                event: payload.event,
                data: payload.data,
            };
            // Blocking here is deliberate backpressure: dropping would
            // lose an event the protocol has promised exactly once.
            let _ = events_tx.send(event).await;
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use tokio_tungstenite::tungstenite::protocol::CloseFrame;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

    fn text(frame: &Frame) -> String {
        serde_json::to_string(frame).unwrap()
    }

    fn sequenced(mut frame: Frame, seq: u64) -> Frame {
        frame.seq = Some(seq);
        frame
    }

    #[tokio::test]
    async fn response_routes_to_pending_call() {
        let pending = PendingCalls::default();
        let (events_tx, _events_rx) = mpsc::channel(16);
        let progress = Progress::default();

        let rx = pending.register(7, 1).await;
        let frame = sequenced(Frame::response(7, Some(&Value::from(5))).unwrap(), 1);
        handle_frame(&text(&frame), &pending, &events_tx, &progress).await;

        assert_eq!(rx.await.unwrap().unwrap(), Value::from(5));
        assert_eq!(progress.last_processed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn error_response_maps_to_method_error() {
        let pending = PendingCalls::default();
        let (events_tx, _events_rx) = mpsc::channel(16);
        let progress = Progress::default();

        let rx = pending.register(3, 1).await;
        let frame = sequenced(Frame::error_response(3, "unknown method: nope"), 1);
        handle_frame(&text(&frame), &pending, &events_tx, &progress).await;

        match rx.await.unwrap() {
            Err(CallError::Method(msg)) => assert_eq!(msg, "unknown method: nope"),
            other => panic!("expected method error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn duplicate_seq_is_dropped() {
        let pending = PendingCalls::default();
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let progress = Progress::default();

        let payload = PushPayload {
            event: "tick".into(),
            data: None,
        };
        let frame = sequenced(Frame::push(None, &payload).unwrap(), 1);
        handle_frame(&text(&frame), &pending, &events_tx, &progress).await;
        handle_frame(&text(&frame), &pending, &events_tx, &progress).await;

        assert!(events_rx.recv().await.is_some());
        assert!(events_rx.try_recv().is_err(), "duplicate push must not be re-emitted");
    }

    #[tokio::test]
    async fn push_becomes_event() {
        let pending = PendingCalls::default();
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let progress = Progress::default();

        let payload = PushPayload {
            event: "userJoin".into(),
            data: Some(serde_json::json!({"id": 4})),
        };
        let frame = sequenced(Frame::push(Some("room"), &payload).unwrap(), 1);
        handle_frame(&text(&frame), &pending, &events_tx, &progress).await;

        match events_rx.recv().await.unwrap() {
            ClientEvent::Push {
                channel,
                event,
                data,
            } => {
                assert_eq!(channel.as_deref(), Some("room"));
                assert_eq!(event, "userJoin");
                assert_eq!(data.unwrap()["id"], Value::from(4));
            }
            other => panic!("expected push event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_frame_is_ignored() {
        let pending = PendingCalls::default();
        let (events_tx, _events_rx) = mpsc::channel(16);
        let progress = Progress::default();
        handle_frame("not json {{{", &pending, &events_tx, &progress).await;
        assert_eq!(progress.last_processed.load(Ordering::Relaxed), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn pump_times_out_on_silence() {
        let pending = PendingCalls::default();
        let (events_tx, _events_rx) = mpsc::channel(16);
        let (write_tx, _write_rx) = mpsc::channel(16);
        let progress = Arc::new(Progress::default());
        let silent =
            stream::pending::<Result<WsMessage, tokio_tungstenite::tungstenite::Error>>();

        let exit = read_pump(
            silent,
            write_tx,
            pending,
            events_tx,
            progress,
            1,
            Duration::from_millis(250),
            None,
            CancellationToken::new(),
        )
        .await;
        assert_eq!(exit, PumpExit::Dropped);
    }

    #[tokio::test]
    async fn pump_reports_supersede() {
        let pending = PendingCalls::default();
        let (events_tx, _events_rx) = mpsc::channel(16);
        let (write_tx, _write_rx) = mpsc::channel(16);
        let progress = Arc::new(Progress::default());

        let close = WsMessage::Close(Some(CloseFrame {
            code: CloseCode::from(CLOSE_SUPERSEDED),
            reason: "superseded".into(),
        }));
        let one = stream::iter(vec![Ok(close)]);

        let exit = read_pump(
            one,
            write_tx,
            pending,
            events_tx,
            progress,
            1,
            Duration::from_millis(250),
            None,
            CancellationToken::new(),
        )
        .await;
        assert_eq!(exit, PumpExit::Superseded);
    }

    #[tokio::test(start_paused = true)]
    async fn ack_timer_flushes_progress() {
        let pending = PendingCalls::default();
        let (events_tx, _events_rx) = mpsc::channel(16);
        let (write_tx, mut write_rx) = mpsc::channel(16);
        let progress = Arc::new(Progress::default());
        let cancel = CancellationToken::new();

        let pump_progress = progress.clone();
        let pump_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            let silent =
                stream::pending::<Result<WsMessage, tokio_tungstenite::tungstenite::Error>>();
            read_pump(
                silent,
                write_tx,
                pending,
                events_tx,
                pump_progress,
                1,
                Duration::from_millis(250),
                None,
                pump_cancel,
            )
            .await
        });

        // Let the pump pass its immediate first tick before progressing.
        tokio::task::yield_now().await;
        progress.last_processed.store(3, Ordering::Relaxed);
        tokio::time::advance(Duration::from_millis(250)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        let msg = write_rx.recv().await.unwrap();
        let ack: Frame = match msg {
            WsMessage::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected ack frame, got {other:?}"),
        };
        assert_eq!(ack.frame_type, FrameType::Control);
        assert_eq!(ack.seq, Some(3));
        assert_eq!(progress.last_acked.load(Ordering::Relaxed), 3);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn write_pump_sends_close_on_cancel() {
        let (sink_tx, mut sink_rx) = mpsc::channel::<WsMessage>(16);
        let cancel = CancellationToken::new();

        let sink = futures_util::sink::unfold(sink_tx, |tx, msg: WsMessage| async move {
            let _ = tx.send(msg).await;
            Ok::<_, tokio_tungstenite::tungstenite::Error>(tx)
        });
        let sink = Box::pin(sink);

        let (_write_tx, write_rx) = mpsc::channel(16);
        let c = cancel.clone();
        let handle = tokio::spawn(async move {
            write_pump(sink, write_rx, c).await;
        });

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("should stop")
            .expect("no panic");

        let close_msg = sink_rx.recv().await;
        assert!(matches!(close_msg, Some(WsMessage::Close(_))));
    }
}
