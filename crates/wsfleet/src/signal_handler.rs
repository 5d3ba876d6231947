//! SIGINT/SIGTERM handling for supervisor and worker processes.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::thread;
use std::thread::JoinHandle;

use signal_hook::consts::SIGINT;
use signal_hook::consts::SIGTERM;
use signal_hook::iterator::Signals;
use tokio::sync::watch;
use tracing::info;
use tracing::warn;

use crate::error::FleetError;

pub trait ShutdownNotifier: Send + Sync {
    fn notify(&self);
}

pub type ShutdownNotifierHandle = Arc<dyn ShutdownNotifier>;

/// Wakes async code waiting on a `watch` channel.
pub struct WatchNotifier {
    tx: watch::Sender<bool>,
}

impl WatchNotifier {
    pub fn new(tx: watch::Sender<bool>) -> Self {
        Self { tx }
    }
}

impl ShutdownNotifier for WatchNotifier {
    fn notify(&self) {
        self.tx.send_replace(true);
    }
}

pub struct SignalHandler {
    _handle: JoinHandle<()>,
}

impl SignalHandler {
    /// The first signal sets `shutdown` and calls `notifier`. A second signal
    /// ends the process immediately with `128 + signal`.
    pub fn setup(
        shutdown: Arc<AtomicBool>,
        notifier: Option<ShutdownNotifierHandle>,
    ) -> Result<Self, FleetError> {
        let mut signals =
            Signals::new([SIGINT, SIGTERM]).map_err(|e| FleetError::SignalSetup(e.to_string()))?;

        let handle = thread::Builder::new()
            .name("signal-handler".to_string())
            .spawn(move || {
                let mut pending = signals.forever();
                if let Some(sig) = pending.next() {
                    info!(
                        signal = sig,
                        "Received signal, initiating graceful shutdown"
                    );
                    shutdown.store(true, Ordering::SeqCst);
                    if let Some(notifier) = notifier.as_ref() {
                        notifier.notify();
                    }
                }
                if let Some(sig) = pending.next() {
                    warn!(signal = sig, "Received second signal, exiting immediately");
                    std::process::exit(128 + sig);
                }
            })
            .map_err(|e| FleetError::SignalSetup(format!("failed to spawn signal handler: {e}")))?;

        Ok(Self { _handle: handle })
    }
}
