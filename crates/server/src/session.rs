//! Per-client session workers.
//!
//! Each logical client is owned by one task that serializes everything
//! happening to the session: socket attach/detach, inbound frames,
//! pushes, acknowledgments. Method handlers are the exception: they run
//! as their own tasks so a slow call never holds up the next frame, and
//! their results re-enter the worker as commands to be sequenced.
//!
//! The worker records every sequenced frame in the missed-frame buffer
//! before attempting delivery. A socket dying before, during, or after a
//! send therefore changes nothing about what the next resume replays.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_util::sync::CancellationToken;

use tether_protocol::{CLOSE_SUPERSEDED, DEFAULT_BUFFER_CAP, Frame, FrameType};

use crate::ServerError;
use crate::methods::{Caller, MethodRegistry};
use crate::sequencer::{MissedBuffer, ResumeDecision, Sequencer, resume_from};

/// Command queue depth per session worker.
const CMD_QUEUE_SIZE: usize = 256;

/// Session tuning.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Maximum buffered unacknowledged frames per client. A client that
    /// falls further behind than this can no longer resume and is told to
    /// reload.
    pub buffer_cap: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            buffer_cap: DEFAULT_BUFFER_CAP,
        }
    }
}

/// Result of attaching a socket to a session.
#[derive(Debug, Clone, Copy)]
pub(crate) struct AttachOutcome {
    /// Identifies this attachment; a later detach carrying a stale epoch
    /// is ignored.
    pub epoch: u64,
    pub need_reload: bool,
}

pub(crate) enum SessionCmd {
    Attach {
        socket_tx: mpsc::Sender<WsMessage>,
        socket_cancel: CancellationToken,
        last_seq: u64,
        reply: oneshot::Sender<AttachOutcome>,
    },
    Detach {
        epoch: u64,
    },
    Inbound(Frame),
    Push(Frame),
    Destroy,
    Completed {
        req_id: u64,
        result: Result<Value, String>,
    },
}

/// Cheap cloneable handle to a session worker.
#[derive(Clone)]
pub struct SessionHandle {
    id: String,
    created_at: DateTime<Utc>,
    cmd_tx: mpsc::Sender<SessionCmd>,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub(crate) async fn attach(
        &self,
        socket_tx: mpsc::Sender<WsMessage>,
        socket_cancel: CancellationToken,
        last_seq: u64,
    ) -> Result<AttachOutcome, ServerError> {
        let (reply, outcome) = oneshot::channel();
        self.cmd_tx
            .send(SessionCmd::Attach {
                socket_tx,
                socket_cancel,
                last_seq,
                reply,
            })
            .await
            .map_err(|_| ServerError::SessionClosed)?;
        outcome.await.map_err(|_| ServerError::SessionClosed)
    }

    pub(crate) async fn detach(&self, epoch: u64) {
        let _ = self.cmd_tx.send(SessionCmd::Detach { epoch }).await;
    }

    pub(crate) async fn inbound(&self, frame: Frame) {
        let _ = self.cmd_tx.send(SessionCmd::Inbound(frame)).await;
    }

    /// Queues an unsequenced push frame; the worker numbers and buffers it.
    pub(crate) async fn send_push(&self, frame: Frame) -> Result<(), ServerError> {
        self.cmd_tx
            .send(SessionCmd::Push(frame))
            .await
            .map_err(|_| ServerError::SessionClosed)
    }

    pub(crate) async fn destroy(&self) {
        let _ = self.cmd_tx.send(SessionCmd::Destroy).await;
    }
}

struct Socket {
    tx: mpsc::Sender<WsMessage>,
    cancel: CancellationToken,
    epoch: u64,
}

struct SessionWorker {
    id: String,
    seq: Sequencer,
    buffer: MissedBuffer,
    socket: Option<Socket>,
    epoch: u64,
    in_flight: HashSet<u64>,
    methods: Arc<MethodRegistry>,
    cmd_tx: mpsc::Sender<SessionCmd>,
}

/// Spawns the worker task for a new session and returns its handle.
pub(crate) fn spawn_session(
    id: String,
    methods: Arc<MethodRegistry>,
    config: &SessionConfig,
) -> SessionHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(CMD_QUEUE_SIZE);
    let handle = SessionHandle {
        id: id.clone(),
        created_at: Utc::now(),
        cmd_tx: cmd_tx.clone(),
    };
    let worker = SessionWorker {
        id,
        seq: Sequencer::default(),
        buffer: MissedBuffer::new(config.buffer_cap),
        socket: None,
        epoch: 0,
        in_flight: HashSet::new(),
        methods,
        cmd_tx,
    };
    tokio::spawn(worker.run(cmd_rx));
    handle
}

impl SessionWorker {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<SessionCmd>) {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                SessionCmd::Attach {
                    socket_tx,
                    socket_cancel,
                    last_seq,
                    reply,
                } => {
                    let outcome = self.attach(socket_tx, socket_cancel, last_seq);
                    let _ = reply.send(outcome);
                }
                SessionCmd::Detach { epoch } => {
                    if self.socket.as_ref().is_some_and(|s| s.epoch == epoch) {
                        self.socket = None;
                        tracing::debug!(client = %self.id, epoch, "socket detached");
                    }
                }
                SessionCmd::Inbound(frame) => self.handle_inbound(frame),
                SessionCmd::Push(frame) => self.send_sequenced(frame),
                SessionCmd::Completed { req_id, result } => self.complete_call(req_id, result),
                SessionCmd::Destroy => break,
            }
        }
        if let Some(socket) = self.socket.take() {
            socket.cancel.cancel();
        }
        tracing::debug!(client = %self.id, "session worker stopped");
    }

    /// Binds a socket to the session, superseding any previous one, and
    /// opens the stream with a `clientConnect` plus whatever replay the
    /// client's report calls for.
    fn attach(
        &mut self,
        socket_tx: mpsc::Sender<WsMessage>,
        socket_cancel: CancellationToken,
        last_seq: u64,
    ) -> AttachOutcome {
        if let Some(old) = self.socket.take() {
            tracing::info!(client = %self.id, "superseding existing socket");
            let close = WsMessage::Close(Some(CloseFrame {
                code: CloseCode::from(CLOSE_SUPERSEDED),
                reason: "superseded".into(),
            }));
            let _ = old.tx.try_send(close);
            old.cancel.cancel();
        }

        let first_attach = self.epoch == 0;
        self.epoch += 1;
        let epoch = self.epoch;
        let socket = Socket {
            tx: socket_tx,
            cancel: socket_cancel,
            epoch,
        };

        // A session that has never held a socket has no client-side state
        // to resume; it always starts with a reload.
        let decision = if first_attach {
            ResumeDecision::Reload
        } else {
            resume_from(&self.seq, &self.buffer, last_seq)
        };

        match decision {
            ResumeDecision::Replay(frames) => {
                // The report is itself an acknowledgment of everything at
                // or below it.
                self.seq.acknowledge(last_seq);
                self.buffer.acknowledge(self.seq.last_acked());
                self.socket = Some(socket);
                self.send_raw(&Frame::client_connect(&self.id, false, last_seq));
                let replayed = frames.len();
                for frame in &frames {
                    if self.socket.is_none() {
                        break;
                    }
                    self.send_raw(frame);
                }
                if replayed > 0 {
                    tracing::info!(client = %self.id, frames = replayed, "replayed missed frames");
                }
                AttachOutcome {
                    epoch,
                    need_reload: false,
                }
            }
            ResumeDecision::Reload => {
                // The stream restarts at the current watermark; older
                // frames are unrecoverable and must not leak forward.
                self.buffer.reset();
                self.seq.acknowledge(self.seq.last_assigned());
                if first_attach {
                    tracing::debug!(client = %self.id, "new session attached");
                } else {
                    tracing::info!(client = %self.id, reported = last_seq, "resume gap unclosable; client must reload");
                }
                self.socket = Some(socket);
                self.send_raw(&Frame::client_connect(
                    &self.id,
                    true,
                    self.seq.last_assigned(),
                ));
                AttachOutcome {
                    epoch,
                    need_reload: true,
                }
            }
        }
    }

    fn handle_inbound(&mut self, frame: Frame) {
        match frame.frame_type {
            FrameType::Call => self.handle_call(frame),
            FrameType::Control => {
                // Post-handshake control frames acknowledge processed
                // sequence numbers.
                if let Some(seq) = frame.seq {
                    self.seq.acknowledge(seq);
                    self.buffer.acknowledge(self.seq.last_acked());
                } else {
                    tracing::debug!(client = %self.id, "control frame without seq ignored");
                }
            }
            other => {
                tracing::warn!(client = %self.id, frame_type = ?other, "unexpected inbound frame type");
            }
        }
    }

    fn handle_call(&mut self, frame: Frame) {
        let Some(req_id) = frame.req_id else {
            tracing::warn!(client = %self.id, "call frame without reqId ignored");
            return;
        };
        let Some(method) = frame.method.clone() else {
            self.send_sequenced(Frame::error_response(req_id, "call frame without method"));
            return;
        };
        let args = match frame.parse_args::<Value>() {
            Ok(args) => args.unwrap_or(Value::Null),
            Err(e) => {
                self.send_sequenced(Frame::error_response(req_id, format!("malformed args: {e}")));
                return;
            }
        };
        let Some(handler) = self.methods.get(&method) else {
            tracing::debug!(client = %self.id, %method, "unknown method called");
            self.send_sequenced(Frame::error_response(
                req_id,
                format!("unknown method: {method}"),
            ));
            return;
        };

        if !self.in_flight.insert(req_id) {
            tracing::warn!(client = %self.id, req_id, "reqId reused while still in flight");
        }
        let caller = Caller {
            client_id: self.id.clone(),
        };
        let cmd_tx = self.cmd_tx.clone();
        // Detached so a slow handler never delays the next inbound frame;
        // the response is sequenced when the result comes back.
        tokio::spawn(async move {
            let result = handler(caller, args).await.map_err(|e| e.to_string());
            let _ = cmd_tx.send(SessionCmd::Completed { req_id, result }).await;
        });
    }

    fn complete_call(&mut self, req_id: u64, result: Result<Value, String>) {
        self.in_flight.remove(&req_id);
        let frame = match result {
            Ok(value) => Frame::response(req_id, Some(&value)).unwrap_or_else(|e| {
                Frame::error_response(req_id, format!("response serialization failed: {e}"))
            }),
            Err(message) => Frame::error_response(req_id, message),
        };
        self.send_sequenced(frame);
    }

    /// Numbers a frame, records it, then attempts live delivery.
    fn send_sequenced(&mut self, mut frame: Frame) {
        let seq = self.seq.assign();
        frame.seq = Some(seq);
        self.buffer.record(seq, frame.clone());
        self.send_raw(&frame);
    }

    /// Best-effort delivery over the live socket, if any. A full or closed
    /// send queue detaches the socket; sequenced traffic is already in the
    /// buffer and control frames are reissued on the next handshake.
    fn send_raw(&mut self, frame: &Frame) {
        let Some(socket) = self.socket.as_ref() else {
            return;
        };
        let json = match serde_json::to_string(frame) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!(client = %self.id, "frame serialization failed: {e}");
                return;
            }
        };
        if socket.tx.try_send(WsMessage::Text(json.into())).is_err()
            && let Some(dead) = self.socket.take()
        {
            tracing::warn!(client = %self.id, "socket send failed; detaching");
            dead.cancel.cancel();
        }
    }
}
