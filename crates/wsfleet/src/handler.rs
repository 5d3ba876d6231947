//! Message handling extension point.
//!
//! Workers only manage transport and lifecycle. What a message means is up to
//! the installed [`MessageHandler`].

use std::any::Any;
use std::panic;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use thiserror::Error;
use tracing::trace;

use crate::config::HandlerKind;
use crate::ids::ConnectionId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Vec<u8>),
}

impl Payload {
    pub fn len(&self) -> usize {
        match self {
            Payload::Text(text) => text.len(),
            Payload::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MessageProcessingError {
    #[error("message rejected: {0}")]
    Rejected(String),
    #[error("handler panicked: {0}")]
    Panicked(String),
}

pub trait MessageHandler: Send + Sync {
    /// Handles one data frame. A returned payload is sent back on the same
    /// connection; an error closes that connection through the error path.
    fn on_message(
        &self,
        conn: ConnectionId,
        payload: Payload,
    ) -> Result<Option<Payload>, MessageProcessingError>;
}

pub type MessageHandlerHandle = Arc<dyn MessageHandler>;

pub fn handler_for(kind: HandlerKind) -> MessageHandlerHandle {
    match kind {
        HandlerKind::Observe => Arc::new(ObserveHandler::default()),
        HandlerKind::Echo => Arc::new(EchoHandler),
    }
}

/// Runs the handler, turning a panic into a per-connection error.
pub(crate) fn dispatch(
    handler: &dyn MessageHandler,
    conn: ConnectionId,
    payload: Payload,
) -> Result<Option<Payload>, MessageProcessingError> {
    match panic::catch_unwind(AssertUnwindSafe(|| handler.on_message(conn, payload))) {
        Ok(result) => result,
        Err(panic) => Err(MessageProcessingError::Panicked(panic_message(panic.as_ref()))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Default handler: counts traffic and never replies.
#[derive(Debug, Default)]
pub struct ObserveHandler {
    messages: AtomicU64,
    bytes: AtomicU64,
}

impl ObserveHandler {
    pub fn messages(&self) -> u64 {
        self.messages.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

impl MessageHandler for ObserveHandler {
    fn on_message(
        &self,
        conn: ConnectionId,
        payload: Payload,
    ) -> Result<Option<Payload>, MessageProcessingError> {
        let len = payload.len() as u64;
        self.messages.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(len, Ordering::Relaxed);
        trace!(conn_id = %conn, bytes = len, "Message observed");
        Ok(None)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct EchoHandler;

impl MessageHandler for EchoHandler {
    fn on_message(
        &self,
        _conn: ConnectionId,
        payload: Payload,
    ) -> Result<Option<Payload>, MessageProcessingError> {
        Ok(Some(payload))
    }
}
