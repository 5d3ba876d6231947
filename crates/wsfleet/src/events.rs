//! Structured lifecycle events for connections and workers.

use std::sync::Mutex;

use serde::Serialize;
use tracing::error;
use tracing::info;
use tracing::warn;
use wsfleet_common::mutex_lock_or_recover;

use crate::ids::ConnectionId;
use crate::ids::WorkerId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event")]
pub enum LifecycleEvent {
    #[serde(rename = "connection.open", rename_all = "camelCase")]
    ConnectionOpen {
        worker_id: WorkerId,
        conn_id: ConnectionId,
    },
    #[serde(rename = "connection.close", rename_all = "camelCase")]
    ConnectionClose {
        worker_id: WorkerId,
        conn_id: ConnectionId,
    },
    #[serde(rename = "connection.error", rename_all = "camelCase")]
    ConnectionError {
        worker_id: WorkerId,
        conn_id: ConnectionId,
        reason: String,
    },
    #[serde(rename = "worker.started", rename_all = "camelCase")]
    WorkerStarted { worker_id: WorkerId, pid: u32 },
    /// `code` is the exit status, or 128 + signal number for a killed worker.
    #[serde(rename = "worker.exited", rename_all = "camelCase")]
    WorkerExited { worker_id: WorkerId, code: i32 },
    #[serde(rename = "worker.respawned", rename_all = "camelCase")]
    WorkerRespawned { old_id: WorkerId, new_id: WorkerId },
    #[serde(rename = "supervisor.respawn_suspended", rename_all = "camelCase")]
    RespawnSuspended { failures: usize, window_ms: u64 },
}

impl LifecycleEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ConnectionOpen { .. } => "connection.open",
            Self::ConnectionClose { .. } => "connection.close",
            Self::ConnectionError { .. } => "connection.error",
            Self::WorkerStarted { .. } => "worker.started",
            Self::WorkerExited { .. } => "worker.exited",
            Self::WorkerRespawned { .. } => "worker.respawned",
            Self::RespawnSuspended { .. } => "supervisor.respawn_suspended",
        }
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: &LifecycleEvent);
}

/// Writes every event as a `tracing` record.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &LifecycleEvent) {
        let name = event.name();
        match event {
            LifecycleEvent::ConnectionOpen { worker_id, conn_id }
            | LifecycleEvent::ConnectionClose { worker_id, conn_id } => {
                info!(event = name, worker_id = %worker_id, conn_id = %conn_id);
            }
            LifecycleEvent::ConnectionError {
                worker_id,
                conn_id,
                reason,
            } => {
                warn!(event = name, worker_id = %worker_id, conn_id = %conn_id, reason = %reason);
            }
            LifecycleEvent::WorkerStarted { worker_id, pid } => {
                info!(event = name, worker_id = %worker_id, pid);
            }
            LifecycleEvent::WorkerExited { worker_id, code } => {
                warn!(event = name, worker_id = %worker_id, code);
            }
            LifecycleEvent::WorkerRespawned { old_id, new_id } => {
                info!(event = name, old_id = %old_id, new_id = %new_id);
            }
            LifecycleEvent::RespawnSuspended {
                failures,
                window_ms,
            } => {
                error!(
                    event = name,
                    failures, window_ms, "Workers are crash looping; respawning suspended"
                );
            }
        }
    }
}

/// Keeps every emitted event in memory, in emission order.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<LifecycleEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LifecycleEvent> {
        mutex_lock_or_recover(&self.events).clone()
    }

    pub fn count(&self, name: &str) -> usize {
        mutex_lock_or_recover(&self.events)
            .iter()
            .filter(|event| event.name() == name)
            .count()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: &LifecycleEvent) {
        mutex_lock_or_recover(&self.events).push(event.clone());
    }
}
