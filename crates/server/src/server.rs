//! Session-aware WebSocket server.
//!
//! Listens on a TCP port, upgrades HTTP to WebSocket (vetting the Origin
//! header during the upgrade), runs the handshake that binds each socket
//! to a session, and pumps frames between the socket and the session
//! worker.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::accept_hdr_async_with_config;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::{Message as WsMessage, WebSocketConfig};
use tokio_util::sync::CancellationToken;

use tether_protocol::{
    Frame, FrameType, HANDSHAKE_TIMEOUT, MAX_FRAME_SIZE, PING_PERIOD, PONG_WAIT, PushPayload,
};

use crate::methods::MethodRegistry;
use crate::origin::{OriginPolicy, is_origin_allowed};
use crate::registry::ClientRegistry;
use crate::session::{SessionConfig, SessionHandle};
use crate::{SEND_BUFFER_SIZE, ServerError};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP port to listen on (0 = OS-assigned).
    pub port: u16,
    /// How strictly browser origins are matched against the request host.
    pub origin_policy: OriginPolicy,
    pub session: SessionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 0,
            origin_policy: OriginPolicy::SharedDomain,
            session: SessionConfig::default(),
        }
    }
}

/// The session-resilient messaging server.
///
/// Owns the client registry; application code registers methods up front
/// and pushes events through [`push_to_all`](Self::push_to_all) and
/// [`push_to_one`](Self::push_to_one).
pub struct MessageServer {
    config: ServerConfig,
    registry: Arc<ClientRegistry>,
    cancel: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl MessageServer {
    pub fn new(config: ServerConfig, methods: MethodRegistry) -> Arc<Self> {
        let registry = Arc::new(ClientRegistry::new(
            Arc::new(methods),
            config.session.clone(),
        ));
        Arc::new(Self {
            config,
            registry,
            cancel: CancellationToken::new(),
            local_addr: Mutex::new(None),
        })
    }

    /// Returns the local address the server is listening on.
    ///
    /// Only available after [`run`](Self::run) binds the socket.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().await
    }

    /// Returns the listening port (0 if not yet bound).
    pub async fn port(&self) -> u16 {
        self.local_addr.lock().await.map(|a| a.port()).unwrap_or(0)
    }

    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    /// Broadcasts an event to every session. Sessions without a live
    /// socket buffer it for replay.
    pub async fn push_to_all(
        &self,
        channel: Option<&str>,
        event: &str,
        data: Option<Value>,
    ) -> Result<(), ServerError> {
        let payload = PushPayload {
            event: event.to_owned(),
            data,
        };
        let frame = Frame::push(channel, &payload)?;
        for handle in self.registry.handles().await {
            // A session mid-destruction just misses the event.
            let _ = handle.send_push(frame.clone()).await;
        }
        Ok(())
    }

    /// Sends an event to one session, connected or not.
    pub async fn push_to_one(
        &self,
        client_id: &str,
        channel: Option<&str>,
        event: &str,
        data: Option<Value>,
    ) -> Result<(), ServerError> {
        let session = self
            .registry
            .get(client_id)
            .await
            .ok_or_else(|| ServerError::UnknownClient(client_id.to_owned()))?;
        let payload = PushPayload {
            event: event.to_owned(),
            data,
        };
        session.send_push(Frame::push(channel, &payload)?).await
    }

    /// Gracefully shuts down the server.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Runs the server until cancellation.
    ///
    /// Binds to the configured port and accepts WebSocket connections.
    pub async fn run(self: &Arc<Self>) -> Result<(), ServerError> {
        let addr: SocketAddr = ([0, 0, 0, 0], self.config.port).into();
        let listener = TcpListener::bind(addr).await?;

        let local_addr = listener.local_addr()?;
        *self.local_addr.lock().await = Some(local_addr);
        tracing::info!("message server listening on {local_addr}");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("server shutting down");
                    self.registry.shutdown().await;
                    break Ok(());
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let server = Arc::clone(self);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream, peer_addr).await {
                                    tracing::error!(%peer_addr, "connection error: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("accept error: {e}");
                        }
                    }
                }
            }
        }
    }

    /// Handles a single TCP connection: checks the origin, upgrades to
    /// WebSocket, and serves the socket until it dies.
    async fn handle_connection(
        self: &Arc<Self>,
        stream: tokio::net::TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), ServerError> {
        let policy = self.config.origin_policy;
        let callback = |req: &Request, response: Response| {
            // Non-browser clients send no Origin header; nothing to vet.
            let Some(origin) = req.headers().get("origin").and_then(|v| v.to_str().ok()) else {
                return Ok(response);
            };
            let host = req
                .headers()
                .get("host")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            if is_origin_allowed(policy, origin, host) {
                Ok(response)
            } else {
                tracing::warn!(%origin, %host, "rejecting upgrade: origin not allowed");
                let mut resp = ErrorResponse::new(Some("origin not allowed".into()));
                *resp.status_mut() = StatusCode::FORBIDDEN;
                Err(resp)
            }
        };

        // WebSocket upgrade with size limits matching our protocol constants.
        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(MAX_FRAME_SIZE);
        ws_config.max_frame_size = Some(MAX_FRAME_SIZE);
        let ws_stream = accept_hdr_async_with_config(stream, callback, Some(ws_config)).await?;
        tracing::debug!(%peer_addr, "websocket connection established");

        self.serve_socket(ws_stream, peer_addr).await
    }

    /// Runs one socket's lifetime: handshake, attach, pumps, detach.
    async fn serve_socket<S>(&self, ws_stream: S, peer_addr: SocketAddr) -> Result<(), ServerError>
    where
        S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
            + futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error>
            + Send
            + 'static,
    {
        let (ws_sink, mut ws_stream) = ws_stream.split();
        let (tx, rx) = mpsc::channel::<WsMessage>(SEND_BUFFER_SIZE);
        let socket_cancel = self.cancel.child_token();

        tokio::spawn(write_pump(ws_sink, rx, socket_cancel.clone()));

        // The first frame on a socket must be a connect within the
        // handshake window; anything else forfeits the socket.
        let hello = match tokio::time::timeout(HANDSHAKE_TIMEOUT, first_frame(&mut ws_stream, &tx))
            .await
        {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                socket_cancel.cancel();
                return Ok(());
            }
            Err(_) => {
                tracing::warn!(%peer_addr, "handshake timeout");
                socket_cancel.cancel();
                return Ok(());
            }
        };

        let (session, _) = self.registry.get_or_create(hello.client_id.as_deref()).await;
        let outcome = session
            .attach(tx.clone(), socket_cancel.clone(), hello.seq.unwrap_or(0))
            .await?;
        tracing::info!(
            client = %session.id(),
            %peer_addr,
            resumed = !outcome.need_reload,
            "client attached"
        );

        read_pump(ws_stream, tx, session.clone(), socket_cancel.clone()).await;

        socket_cancel.cancel();
        session.detach(outcome.epoch).await;
        tracing::debug!(client = %session.id(), %peer_addr, "socket closed");
        Ok(())
    }
}

/// Reads frames until a parseable connect arrives. Returns `None` when
/// the socket closes first or the frame is not a valid handshake.
async fn first_frame<S>(stream: &mut S, reply_tx: &mpsc::Sender<WsMessage>) -> Option<Frame>
where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + Unpin,
{
    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            WsMessage::Text(text) => match serde_json::from_str::<Frame>(&text) {
                Ok(frame) if frame.frame_type == FrameType::Control => return Some(frame),
                Ok(frame) => {
                    tracing::warn!(frame_type = ?frame.frame_type, "expected connect handshake");
                    return None;
                }
                Err(e) => {
                    tracing::warn!("malformed handshake frame: {e}");
                    return None;
                }
            },
            WsMessage::Ping(data) => {
                let _ = reply_tx.try_send(WsMessage::Pong(data));
            }
            WsMessage::Close(_) => return None,
            _ => {}
        }
    }
    None
}

/// Write pump: drains the send channel and sends WS pings.
async fn write_pump<S>(mut sink: S, mut rx: mpsc::Receiver<WsMessage>, cancel: CancellationToken)
where
    S: futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Send + Unpin,
{
    let mut ping_interval = tokio::time::interval(PING_PERIOD);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            msg = rx.recv() => {
                match msg {
                    Some(ws_msg) => {
                        if let Err(e) = sink.send(ws_msg).await {
                            tracing::debug!("write pump send error: {e}");
                            break;
                        }
                    }
                    None => break, // Channel closed.
                }
            }

            _ = ping_interval.tick() => {
                if let Err(e) = sink.send(WsMessage::Ping(Vec::new().into())).await {
                    tracing::debug!("write pump ping error: {e}");
                    break;
                }
            }
        }
    }

    // Flush anything still queued; a supersede close may be in there.
    while let Ok(msg) = rx.try_recv() {
        if sink.send(msg).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
}

/// Read pump: forwards inbound frames to the session worker and enforces
/// the pong deadline.
async fn read_pump<S>(
    mut stream: S,
    reply_tx: mpsc::Sender<WsMessage>,
    session: SessionHandle,
    cancel: CancellationToken,
) where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + Send
        + Unpin,
{
    let mut pong_deadline = tokio::time::interval(PONG_WAIT);
    pong_deadline.reset();
    let mut got_pong = true;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            _ = pong_deadline.tick() => {
                if !got_pong {
                    tracing::warn!(client = %session.id(), "pong timeout, closing socket");
                    break;
                }
                got_pong = false;
            }

            frame = stream.next() => {
                match frame {
                    Some(Ok(ws_msg)) => {
                        match ws_msg {
                            WsMessage::Text(text) => {
                                if text.len() > MAX_FRAME_SIZE {
                                    tracing::error!(client = %session.id(), "frame exceeds max size ({} > {MAX_FRAME_SIZE})", text.len());
                                    continue;
                                }
                                match serde_json::from_str::<Frame>(&text) {
                                    Ok(frame) => session.inbound(frame).await,
                                    Err(e) => {
                                        tracing::warn!(client = %session.id(), "malformed frame ignored: {e}");
                                    }
                                }
                            }
                            WsMessage::Binary(_) => {
                                tracing::warn!(client = %session.id(), "binary frame ignored");
                            }
                            WsMessage::Pong(_) => {
                                got_pong = true;
                                pong_deadline.reset();
                            }
                            WsMessage::Ping(data) => {
                                let _ = reply_tx.try_send(WsMessage::Pong(data));
                            }
                            WsMessage::Close(_) => {
                                tracing::debug!(client = %session.id(), "received close frame");
                                break;
                            }
                            WsMessage::Frame(_) => {} // Raw frames ignored.
                        }
                    }
                    Some(Err(e)) => {
                        tracing::debug!(client = %session.id(), "read pump error: {e}");
                        break;
                    }
                    None => break, // Stream ended.
                }
            }
        }
    }
}
