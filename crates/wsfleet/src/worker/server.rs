//! The worker's event loop: accept, registry bookkeeping, drain.

use std::future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use hyper_util::rt::TokioTimer;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;
use tower::ServiceExt;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::DrainReport;
use super::WorkerEvent;
use super::http::PeerAddr;
use crate::connection::Termination;
use crate::error::WorkerFatalError;
use crate::events::EventSink;
use crate::events::LifecycleEvent;
use crate::ids::WorkerId;
use crate::protocol::ReportSink;
use crate::protocol::WorkerReport;
use crate::registry::ConnectionRegistry;

const REPORT_INTERVAL: Duration = Duration::from_millis(50);
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

pub(crate) struct EventLoop {
    worker_id: WorkerId,
    registry: ConnectionRegistry,
    sink: Arc<dyn EventSink>,
    reporter: Box<dyn ReportSink>,
    reporter_failed: bool,
    reported: Option<usize>,
    open_tx: watch::Sender<usize>,
    drain_tx: watch::Sender<bool>,
    grace: Duration,
    limits: Arc<Semaphore>,
    capacity: usize,
}

impl EventLoop {
    pub(crate) fn new(
        worker_id: WorkerId,
        sink: Arc<dyn EventSink>,
        reporter: Box<dyn ReportSink>,
        open_tx: watch::Sender<usize>,
        drain_tx: watch::Sender<bool>,
        grace: Duration,
        limits: Arc<Semaphore>,
    ) -> Self {
        let capacity = limits.available_permits();
        Self {
            worker_id,
            registry: ConnectionRegistry::new(),
            sink,
            reporter,
            reporter_failed: false,
            reported: None,
            open_tx,
            drain_tx,
            grace,
            limits,
            capacity,
        }
    }

    pub(crate) async fn run(
        mut self,
        listener: TcpListener,
        app: Router,
        mut events: mpsc::UnboundedReceiver<WorkerEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<DrainReport, WorkerFatalError> {
        let mut listener = Some(listener);
        let mut deadline: Option<Instant> = None;
        let mut report_tick = tokio::time::interval(REPORT_INTERVAL);
        report_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        self.report(WorkerReport::Ready {
            worker_id: self.worker_id,
            pid: std::process::id(),
        });
        info!("Worker accepting connections");

        if *shutdown.borrow_and_update() {
            deadline = Some(self.begin_drain(&mut listener));
        }

        loop {
            while let Ok(event) = events.try_recv() {
                self.apply(event);
            }
            if deadline.is_some() && self.is_drained() {
                break;
            }

            tokio::select! {
                Some(event) = events.recv() => self.apply(event),
                changed = shutdown.changed(), if deadline.is_none() => {
                    if changed.is_err() || *shutdown.borrow() {
                        deadline = Some(self.begin_drain(&mut listener));
                    }
                }
                accepted = accept(listener.as_ref()) => match accepted {
                    Ok((stream, peer)) => serve_http(app.clone(), stream, peer),
                    Err(err) if is_transient_accept_error(&err) => {
                        warn!(error = %err, "Transient accept error; backing off");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                    Err(err) => {
                        error!(error = %err, "Listening socket failed");
                        return Err(WorkerFatalError::Listener(err));
                    }
                },
                _ = report_tick.tick() => self.flush_count(),
                _ = wait_until(deadline) => {
                    warn!(
                        remaining = self.registry.count(),
                        grace_ms = self.grace.as_millis() as u64,
                        "Drain grace period expired; abandoning open connections"
                    );
                    break;
                }
            }
        }

        let remaining = self.registry.count();
        self.flush_count();
        info!(remaining, "Worker stopped");
        Ok(DrainReport {
            remaining,
            timed_out: remaining > 0,
        })
    }

    fn apply(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Opened(record) => {
                let conn_id = record.id;
                if self.registry.insert(record) {
                    self.sink.emit(&LifecycleEvent::ConnectionOpen {
                        worker_id: self.worker_id,
                        conn_id,
                    });
                }
            }
            WorkerEvent::Terminated { id, termination } => {
                if self.registry.remove(id).is_none() {
                    debug!(conn_id = %id, "Terminal event for unknown connection");
                    return;
                }
                let event = match termination {
                    Termination::Closed => LifecycleEvent::ConnectionClose {
                        worker_id: self.worker_id,
                        conn_id: id,
                    },
                    Termination::Errored { reason } => LifecycleEvent::ConnectionError {
                        worker_id: self.worker_id,
                        conn_id: id,
                        reason,
                    },
                };
                self.sink.emit(&event);
            }
        }
        self.open_tx.send_replace(self.registry.count());
    }

    /// No open connections and no upgrade still holding a connection permit.
    fn is_drained(&self) -> bool {
        self.registry.is_empty() && self.limits.available_permits() == self.capacity
    }

    fn begin_drain(&mut self, listener: &mut Option<TcpListener>) -> Instant {
        listener.take();
        self.drain_tx.send_replace(true);
        let open = self.registry.count();
        info!(open, "Draining connections");
        self.report(WorkerReport::Draining {
            worker_id: self.worker_id,
            open,
        });
        Instant::now() + self.grace
    }

    fn flush_count(&mut self) {
        let open = self.registry.count();
        if self.reported == Some(open) {
            return;
        }
        self.reported = Some(open);
        self.report(WorkerReport::Connections {
            worker_id: self.worker_id,
            open,
        });
    }

    fn report(&mut self, report: WorkerReport) {
        if self.reporter_failed {
            return;
        }
        if let Err(err) = self.reporter.send(&report) {
            warn!(error = %err, "Status report failed; no further reports will be sent");
            self.reporter_failed = true;
        }
    }
}

fn serve_http(app: Router, stream: TcpStream, peer: SocketAddr) {
    tokio::spawn(async move {
        let service = service_fn(move |mut request: hyper::Request<Incoming>| {
            request.extensions_mut().insert(PeerAddr(peer));
            app.clone().oneshot(request)
        });
        let connection = http1::Builder::new()
            .timer(TokioTimer::new())
            .serve_connection(TokioIo::new(stream), service)
            .with_upgrades();
        if let Err(err) = connection.await {
            debug!(peer = %peer, error = %err, "HTTP connection ended with error");
        }
    });
}

async fn accept(listener: Option<&TcpListener>) -> io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => future::pending().await,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => future::pending().await,
    }
}

/// Errors that concern one pending connection or a momentary resource
/// shortage rather than the listening socket itself.
fn is_transient_accept_error(err: &io::Error) -> bool {
    if matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    ) {
        return true;
    }
    matches!(
        err.raw_os_error(),
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM | libc::EPROTO)
    )
}
