#![deny(clippy::all)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

//! Shared utilities used by the supervisor and worker processes.

pub mod env;
pub mod sync;
pub mod telemetry;

pub use env::non_empty;
pub use env::parse_env_u64;
pub use env::parse_env_usize;
pub use sync::mutex_lock_or_recover;
pub use telemetry::StreamPolicy;
pub use telemetry::TelemetryGuard;
pub use telemetry::init_tracing;
