#![deny(clippy::all)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

//! wsfleet: a pre-forked WebSocket server. A supervisor binds one listening
//! socket and keeps a pool of worker processes accepting on it; each worker
//! tracks its own connections and drains them on shutdown.

pub mod app;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod handler;
pub mod handshake;
pub mod ids;
pub mod probe;
pub mod protocol;
pub mod registry;
pub mod signal_handler;
pub mod supervisor;
pub mod worker;

#[cfg(test)]
mod test_support;

pub use app::Application;

pub use config::FleetConfig;
pub use config::HandlerKind;
pub use config::WorkerSettings;
pub use error::FleetError;
pub use events::EventSink;
pub use events::LifecycleEvent;
pub use events::MemorySink;
pub use ids::ConnectionId;
pub use ids::WorkerId;
pub use registry::ConnectionRegistry;
pub use supervisor::Supervisor;
pub use worker::Worker;
