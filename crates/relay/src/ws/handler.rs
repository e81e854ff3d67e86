use std::{future, sync::Arc};

use axum::{
    extract::{
        ws::{CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use quire_common::protocol::ws::{encode_server_message, ServerMessage};
use tokio::{
    sync::mpsc,
    time::{self, Instant, Interval, MissedTickBehavior},
};
use tracing::{debug, warn};

use super::{
    node::RelayNode,
    session::{ConnectionSession, Reply, Termination},
};
use crate::sync::peer::LocalUpdate;

/// Consecutive failed writes after which the socket is considered dead.
pub(crate) const MAX_FAILED_WRITES: u32 = 3;

pub(crate) async fn ws_upgrade(
    State(node): State<Arc<RelayNode>>,
    upgrade: WebSocketUpgrade,
) -> Response {
    upgrade.on_upgrade(move |socket| serve_connection(node, socket))
}

enum Flow {
    Continue,
    Close(Option<Termination>),
}

/// Consecutive write failures on one socket. Any success starts over.
#[derive(Debug, Default)]
struct WriteBudget {
    consecutive_failures: u32,
}

impl WriteBudget {
    fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    /// Returns `false` once [`MAX_FAILED_WRITES`] writes in a row have failed.
    fn record_failure(&mut self) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_failures < MAX_FAILED_WRITES
    }
}

struct Writer {
    socket: WebSocket,
    budget: WriteBudget,
}

impl Writer {
    /// Writes one frame. Returns `false` once the failure budget is spent.
    async fn send(&mut self, message: &ServerMessage) -> bool {
        let encoded = match encode_server_message(message) {
            Ok(encoded) => encoded,
            Err(error) => {
                warn!(
                    message_type = message.message_type(),
                    error = %error,
                    "failed to encode frame"
                );
                return true;
            }
        };

        match self.socket.send(Message::Text(encoded.into())).await {
            Ok(()) => {
                self.budget.record_success();
                true
            }
            Err(error) => {
                let alive = self.budget.record_failure();
                debug!(
                    message_type = message.message_type(),
                    failed_writes = self.budget.consecutive_failures,
                    error = %error,
                    "websocket write failed"
                );
                alive
            }
        }
    }

    async fn send_reply(&mut self, reply: Reply) -> Flow {
        for frame in &reply.frames {
            if !self.send(frame).await {
                return Flow::Close(None);
            }
        }
        match reply.terminate {
            Some(termination) => Flow::Close(Some(termination)),
            None => Flow::Continue,
        }
    }

    async fn close(&mut self, termination: Termination) {
        let frame = CloseFrame {
            code: termination.code,
            reason: Utf8Bytes::from_static(termination.reason),
        };
        if let Err(error) = self.socket.send(Message::Close(Some(frame))).await {
            debug!(error = %error, "failed to send close frame");
        }
    }
}

/// Runs one accepted socket until it closes, then tears the connection down.
pub(crate) async fn serve_connection(node: Arc<RelayNode>, socket: WebSocket) {
    let (outbound_sender, mut outbound_receiver) = mpsc::unbounded_channel::<ServerMessage>();
    let (update_sender, mut update_receiver) = mpsc::unbounded_channel::<LocalUpdate>();
    let keepalive_period = node.config().keepalive_interval;

    let mut session = ConnectionSession::open(node, outbound_sender, update_sender);
    let mut writer = Writer { socket, budget: WriteBudget::default() };
    // Armed by the first inbound frame; nothing is sent before that.
    let mut keepalive: Option<Interval> = None;

    let termination = loop {
        let flow = tokio::select! {
            _ = next_tick(&mut keepalive) => {
                session.refresh_presence().await;
                if writer.send(&ServerMessage::Keepalive {}).await {
                    Flow::Continue
                } else {
                    Flow::Close(None)
                }
            }
            _ = deadline(session.deferred_deadline()) => {
                writer.send_reply(session.flush_held_updates()).await
            }
            Some(outbound) = outbound_receiver.recv() => {
                if writer.send(&outbound).await { Flow::Continue } else { Flow::Close(None) }
            }
            Some(update) = update_receiver.recv() => {
                let frame = ServerMessage::ServerUpdate {
                    message: update.message,
                    changes: update.changes,
                };
                if writer.send(&frame).await { Flow::Continue } else { Flow::Close(None) }
            }
            maybe_message = writer.socket.recv() => {
                let message = match maybe_message {
                    Some(Ok(message)) => message,
                    Some(Err(error)) => {
                        warn!(connection_id = %session.id(), error = %error, "websocket error");
                        break None;
                    }
                    None => break None,
                };

                let is_data = matches!(message, Message::Text(_) | Message::Binary(_));
                if is_data && session.mark_initialized() {
                    keepalive = Some(keepalive_interval(keepalive_period));
                    if !writer.send(&ServerMessage::Keepalive {}).await {
                        break None;
                    }
                }

                match message {
                    Message::Text(raw) => {
                        let reply = session.handle_text(raw.as_str()).await;
                        writer.send_reply(reply).await
                    }
                    Message::Binary(_) => {
                        session.handle_binary();
                        Flow::Continue
                    }
                    Message::Ping(payload) => {
                        if writer.socket.send(Message::Pong(payload)).await.is_err() {
                            break None;
                        }
                        Flow::Continue
                    }
                    Message::Pong(_) => Flow::Continue,
                    Message::Close(frame) => {
                        debug!(connection_id = %session.id(), ?frame, "client closed websocket");
                        break None;
                    }
                }
            }
        };

        if let Flow::Close(termination) = flow {
            break termination;
        }
    };

    if let Some(termination) = termination {
        writer.close(termination).await;
    }
    session.teardown().await;
}

/// Keepalives repeat every `period`, the first one a full period after the
/// immediate keepalive that arms them.
fn keepalive_interval(period: std::time::Duration) -> Interval {
    let mut interval = time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn next_tick(keepalive: &mut Option<Interval>) {
    match keepalive {
        Some(interval) => {
            interval.tick().await;
        }
        None => future::pending().await,
    }
}

async fn deadline(at: Option<Instant>) {
    match at {
        Some(at) => time::sleep_until(at).await,
        None => future::pending().await,
    }
}
