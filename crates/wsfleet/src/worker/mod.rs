//! Worker process: accepts upgrades on the shared listener and tracks every
//! open connection in a process-local registry.

mod http;
mod server;
mod session;

use std::net::SocketAddr;
use std::os::fd::FromRawFd;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tracing::Instrument;
use tracing::info_span;

use crate::config::WorkerSettings;
use crate::connection::Termination;
use crate::error::WorkerFatalError;
use crate::events::EventSink;
use crate::events::TracingSink;
use crate::handler::MessageHandlerHandle;
use crate::handler::handler_for;
use crate::ids::ConnectionId;
use crate::ids::WorkerId;
use crate::protocol::NoopReporter;
use crate::protocol::ReportSink;
use crate::registry::ConnectionRecord;

pub use http::default_http_router;

/// Messages from connection tasks to the worker's event loop.
#[derive(Debug)]
pub(crate) enum WorkerEvent {
    Opened(ConnectionRecord),
    Terminated {
        id: ConnectionId,
        termination: Termination,
    },
}

/// Outcome of a worker's graceful shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    /// Connections still open when the worker stopped waiting.
    pub remaining: usize,
    pub timed_out: bool,
}

pub(crate) struct WorkerShared {
    pub(crate) worker_id: WorkerId,
    pub(crate) settings: WorkerSettings,
    pub(crate) handler: MessageHandlerHandle,
    pub(crate) delegate: Router,
    pub(crate) events: mpsc::UnboundedSender<WorkerEvent>,
    pub(crate) draining: watch::Receiver<bool>,
    pub(crate) limits: Arc<Semaphore>,
    next_connection: AtomicU64,
}

impl WorkerShared {
    pub(crate) fn next_connection_id(&self) -> ConnectionId {
        ConnectionId::new(self.next_connection.fetch_add(1, Ordering::Relaxed))
    }
}

pub struct Worker {
    id: WorkerId,
    settings: WorkerSettings,
    handler: MessageHandlerHandle,
    sink: Arc<dyn EventSink>,
    http: Option<Router>,
    reporter: Box<dyn ReportSink>,
    open_tx: watch::Sender<usize>,
}

impl Worker {
    pub fn new(id: WorkerId, settings: WorkerSettings) -> Self {
        let handler = handler_for(settings.handler);
        let (open_tx, _) = watch::channel(0);
        Self {
            id,
            settings,
            handler,
            sink: Arc::new(TracingSink),
            http: None,
            reporter: Box::new(NoopReporter),
            open_tx,
        }
    }

    pub fn with_handler(mut self, handler: MessageHandlerHandle) -> Self {
        self.handler = handler;
        self
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Router for every request that is not a websocket upgrade.
    pub fn with_http_router(mut self, router: Router) -> Self {
        self.http = Some(router);
        self
    }

    pub fn with_reporter(mut self, reporter: Box<dyn ReportSink>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Live size of the connection registry.
    pub fn open_connections(&self) -> watch::Receiver<usize> {
        self.open_tx.subscribe()
    }

    /// Serves on a single-threaded runtime until `shutdown` flips to true and
    /// the drain completes.
    pub fn run(
        self,
        listener: std::net::TcpListener,
        shutdown: watch::Receiver<bool>,
    ) -> Result<DrainReport, WorkerFatalError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(WorkerFatalError::Runtime)?;

        runtime.block_on(async move {
            listener
                .set_nonblocking(true)
                .map_err(|source| WorkerFatalError::Io {
                    operation: "set non-blocking",
                    source,
                })?;
            let listener = TcpListener::from_std(listener).map_err(|source| WorkerFatalError::Io {
                operation: "register listener",
                source,
            })?;
            self.serve(listener, shutdown).await
        })
    }

    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: watch::Receiver<bool>,
    ) -> Result<DrainReport, WorkerFatalError> {
        self.settings.validate().map_err(WorkerFatalError::Settings)?;
        let Worker {
            id,
            settings,
            handler,
            sink,
            http,
            reporter,
            open_tx,
        } = self;

        let local_addr: Option<SocketAddr> = listener.local_addr().ok();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (drain_tx, drain_rx) = watch::channel(false);
        let delegate = http.unwrap_or_else(|| default_http_router(id, open_tx.subscribe()));
        let grace = settings.shutdown_grace;
        let shared = Arc::new(WorkerShared {
            worker_id: id,
            limits: Arc::new(Semaphore::new(settings.max_connections)),
            settings,
            handler,
            delegate,
            events: events_tx,
            draining: drain_rx,
            next_connection: AtomicU64::new(1),
        });

        let app = http::build_router(Arc::clone(&shared));
        let event_loop = server::EventLoop::new(
            id,
            sink,
            reporter,
            open_tx,
            drain_tx,
            grace,
            Arc::clone(&shared.limits),
        );
        event_loop
            .run(listener, app, events_rx, shutdown)
            .instrument(info_span!("worker", worker_id = %id, addr = ?local_addr))
            .await
    }
}

/// Adopts the listening socket a supervisor passed down at exec.
pub fn inherited_listener(fd: RawFd) -> Result<std::net::TcpListener, WorkerFatalError> {
    if fd < 0 {
        return Err(WorkerFatalError::InheritedListener {
            fd,
            message: "descriptor must be non-negative".to_string(),
        });
    }
    // SAFETY: F_GETFD only inspects descriptor flags.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(WorkerFatalError::InheritedListener {
            fd,
            message: std::io::Error::last_os_error().to_string(),
        });
    }
    // SAFETY: the descriptor is open and was handed to this process by the
    // supervisor for its exclusive use; nothing else in the worker owns it.
    let listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
    listener
        .local_addr()
        .map_err(|err| WorkerFatalError::InheritedListener {
            fd,
            message: err.to_string(),
        })?;
    Ok(listener)
}
