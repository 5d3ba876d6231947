//! One task per upgraded connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::CloseFrame;
use axum::extract::ws::Message;
use axum::extract::ws::WebSocket;
use axum::extract::ws::close_code;
use tokio::sync::OwnedSemaphorePermit;
use tracing::Instrument;
use tracing::debug;
use tracing::info_span;
use tracing::warn;

use super::WorkerEvent;
use super::WorkerShared;
use crate::connection::ConnectionLifecycle;
use crate::connection::Termination;
use crate::handler;
use crate::handler::Payload;
use crate::ids::ConnectionId;
use crate::registry::ConnectionRecord;

const SEND_TIMEOUT: Duration = Duration::from_secs(15);
const MAX_CLOSE_REASON_BYTES: usize = 123;

pub(crate) struct Session {
    lifecycle: ConnectionLifecycle,
    peer: Option<SocketAddr>,
    shared: Arc<WorkerShared>,
    _permit: OwnedSemaphorePermit,
}

enum Received {
    Message(Message),
    Ended,
    Idle,
    Failed(axum::Error),
}

impl Session {
    pub(crate) fn new(
        id: ConnectionId,
        peer: Option<SocketAddr>,
        shared: Arc<WorkerShared>,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            lifecycle: ConnectionLifecycle::new(id),
            peer,
            shared,
            _permit: permit,
        }
    }

    pub(crate) async fn run(self, socket: WebSocket) {
        let span = info_span!("ws_connection", conn_id = %self.lifecycle.id());
        self.drive(socket).instrument(span).await;
    }

    async fn drive(mut self, mut socket: WebSocket) {
        let id = self.lifecycle.id();
        if let Err(err) = self.lifecycle.open() {
            warn!(error = %err, "Refusing to open connection");
            return;
        }
        debug!(peer = ?self.peer, "Connection open");
        let _ = self
            .shared
            .events
            .send(WorkerEvent::Opened(ConnectionRecord::new(id, self.peer)));

        let termination = receive_loop(&mut socket, &self.shared, id).await;

        match self.lifecycle.terminate(termination) {
            Ok(termination) => {
                debug!(?termination, "Connection finished");
                let _ = self
                    .shared
                    .events
                    .send(WorkerEvent::Terminated { id, termination });
            }
            Err(err) => warn!(error = %err, "Dropped second terminal event"),
        }
    }
}

async fn receive_loop(
    socket: &mut WebSocket,
    shared: &WorkerShared,
    id: ConnectionId,
) -> Termination {
    let mut draining = shared.draining.clone();
    if *draining.borrow_and_update() {
        return close_with(socket, close_code::AWAY, "server shutting down").await;
    }

    loop {
        tokio::select! {
            _ = draining.changed() => {
                return close_with(socket, close_code::AWAY, "server shutting down").await;
            }
            received = next_message(socket, shared.settings.idle_timeout) => {
                let payload = match received {
                    Received::Message(Message::Text(text)) => Payload::Text(text),
                    Received::Message(Message::Binary(bytes)) => Payload::Binary(bytes),
                    Received::Message(Message::Ping(payload)) => {
                        if let Err(reason) = send(socket, Message::Pong(payload)).await {
                            return Termination::errored(reason);
                        }
                        continue;
                    }
                    Received::Message(Message::Pong(_)) => continue,
                    Received::Message(Message::Close(_)) | Received::Ended => {
                        return Termination::Closed;
                    }
                    Received::Idle => {
                        return close_with(socket, close_code::POLICY, "idle timeout").await;
                    }
                    Received::Failed(err) => return Termination::errored(err.to_string()),
                };

                match handler::dispatch(shared.handler.as_ref(), id, payload) {
                    Ok(None) => {}
                    Ok(Some(reply)) => {
                        if let Err(reason) = send(socket, into_message(reply)).await {
                            return Termination::errored(reason);
                        }
                    }
                    Err(err) => {
                        let reason = err.to_string();
                        let _ = close_with(socket, close_code::ERROR, &reason).await;
                        return Termination::errored(reason);
                    }
                }
            }
        }
    }
}

async fn next_message(socket: &mut WebSocket, idle: Option<Duration>) -> Received {
    let received = match idle {
        Some(limit) => match tokio::time::timeout(limit, socket.recv()).await {
            Ok(received) => received,
            Err(_) => return Received::Idle,
        },
        None => socket.recv().await,
    };
    match received {
        Some(Ok(message)) => Received::Message(message),
        Some(Err(err)) => Received::Failed(err),
        None => Received::Ended,
    }
}

async fn send(socket: &mut WebSocket, message: Message) -> Result<(), String> {
    match tokio::time::timeout(SEND_TIMEOUT, socket.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(err.to_string()),
        Err(_) => Err("send timed out".to_string()),
    }
}

/// Sends a close frame and reports the connection as closed. A peer that is
/// already gone turns this into the error path.
async fn close_with(socket: &mut WebSocket, code: u16, reason: &str) -> Termination {
    let frame = CloseFrame {
        code,
        reason: truncate_reason(reason).into(),
    };
    match send(socket, Message::Close(Some(frame))).await {
        Ok(()) => Termination::Closed,
        Err(err) => Termination::errored(err),
    }
}

fn into_message(payload: Payload) -> Message {
    match payload {
        Payload::Text(text) => Message::Text(text),
        Payload::Binary(bytes) => Message::Binary(bytes),
    }
}

fn truncate_reason(reason: &str) -> String {
    if reason.len() <= MAX_CLOSE_REASON_BYTES {
        return reason.to_string();
    }
    let mut end = MAX_CLOSE_REASON_BYTES;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    reason[..end].to_string()
}
