//! Process-level error taxonomy.
//!
//! Connection-scoped failures (`HandshakeError`, `MessageProcessingError`) are
//! handled inside a worker and never reach this level.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;
use crate::ids::WorkerId;

/// Exit codes following sysexits.h conventions.
pub mod exit_codes {
    pub const SUCCESS: i32 = 0;
    pub const GENERAL_ERROR: i32 = 1;
    pub const USAGE: i32 = 64;
    pub const UNAVAILABLE: i32 = 69;
    pub const SOFTWARE: i32 = 70;
    pub const TEMPFAIL: i32 = 75;
    pub const CONFIG: i32 = 78;
}

#[derive(Debug, Error)]
pub enum BindError {
    #[error("invalid listen address {addr}: {message}")]
    InvalidAddress { addr: String, message: String },
    #[error("failed to {operation} {addr}: {source}")]
    Io {
        addr: String,
        operation: &'static str,
        #[source]
        source: io::Error,
    },
}

/// A fault that leaves a worker unable to serve. The worker exits non-zero and
/// the supervisor replaces it.
#[derive(Debug, Error)]
pub enum WorkerFatalError {
    #[error("listening socket failed: {0}")]
    Listener(#[source] io::Error),
    #[error("invalid inherited listener descriptor {fd}: {message}")]
    InheritedListener { fd: i32, message: String },
    #[error("invalid worker settings: {0}")]
    Settings(#[source] ConfigError),
    #[error("failed to build worker runtime: {0}")]
    Runtime(#[source] io::Error),
    #[error("worker I/O error ({operation}): {source}")]
    Io {
        operation: &'static str,
        #[source]
        source: io::Error,
    },
}

/// Workers that ignored SIGTERM for the whole grace period and were killed.
#[derive(Debug, Error)]
#[error("{} worker(s) did not exit within {grace:?}; forced termination", .stragglers.len())]
pub struct ShutdownTimeoutError {
    pub grace: Duration,
    pub stragglers: Vec<WorkerId>,
}

#[derive(Debug, Error)]
pub enum FleetError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Bind(#[from] BindError),
    #[error("failed to launch worker {worker_id}: {source}")]
    Spawn {
        worker_id: WorkerId,
        #[source]
        source: io::Error,
    },
    #[error("cannot locate the wsfleet executable: {0}")]
    Executable(#[source] io::Error),
    #[error("{failures} worker failures within {window:?}; giving up")]
    CrashLoop { failures: usize, window: Duration },
    #[error("failed to setup signal handler: {0}")]
    SignalSetup(String),
}

impl FleetError {
    pub fn exit_code(&self) -> i32 {
        match self {
            FleetError::Config(_) => exit_codes::CONFIG,
            FleetError::Bind(_) => exit_codes::UNAVAILABLE,
            FleetError::CrashLoop { .. } => exit_codes::TEMPFAIL,
            FleetError::Spawn { .. }
            | FleetError::Executable(_)
            | FleetError::SignalSetup(_) => exit_codes::GENERAL_ERROR,
        }
    }

    pub fn suggestion(&self) -> String {
        match self {
            FleetError::Config(_) => {
                "Check the --config file and WSFLEET_* environment variables.".to_string()
            }
            FleetError::Bind(_) => {
                "Another process may own the port. Pick a different --port or stop it.".to_string()
            }
            FleetError::Spawn { .. } => {
                "Check process limits (ulimit -u) and that the wsfleet binary is executable."
                    .to_string()
            }
            FleetError::Executable(_) => {
                "Workers are started by re-running this binary; make sure it was not moved or deleted."
                    .to_string()
            }
            FleetError::CrashLoop { .. } => {
                "Workers keep dying right after start. Inspect worker logs for the fault."
                    .to_string()
            }
            FleetError::SignalSetup(_) => {
                "Signal handler setup failed. Check system signal configuration.".to_string()
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, FleetError::Bind(_) | FleetError::CrashLoop { .. })
    }
}
