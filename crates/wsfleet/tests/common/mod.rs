#![expect(dead_code, reason = "Test helpers are used selectively.")]

//! Shared harness for worker and supervisor integration tests.

use std::io::Read;
use std::io::Write;
use std::net::SocketAddr;
use std::net::TcpListener;
use std::net::TcpStream;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;

use assert_cmd::Command;
use tokio::sync::watch;
use tungstenite::WebSocket;
use wsfleet::MemorySink;
use wsfleet::Worker;
use wsfleet::WorkerId;
use wsfleet::WorkerSettings;
use wsfleet::error::WorkerFatalError;
use wsfleet::worker::DrainReport;

pub const WAIT: Duration = Duration::from_secs(10);

pub fn wsfleet_cmd() -> Command {
    Command::new(assert_cmd::cargo::cargo_bin!("wsfleet"))
}

/// Polls `condition` every 10ms until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
}

/// A worker serving on a background thread, the way a worker process does.
pub struct TestWorker {
    pub addr: SocketAddr,
    pub events: Arc<MemorySink>,
    path: String,
    open: watch::Receiver<usize>,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<Result<DrainReport, WorkerFatalError>>,
}

impl TestWorker {
    pub fn start(settings: WorkerSettings) -> Self {
        Self::start_with(settings, |worker| worker)
    }

    /// Like [`TestWorker::start`], letting `configure` customize the worker
    /// (handler, router) before it starts serving.
    pub fn start_with(settings: WorkerSettings, configure: impl FnOnce(Worker) -> Worker) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let events = Arc::new(MemorySink::new());
        let path = settings.path.clone();
        let worker =
            configure(Worker::new(WorkerId::new(1), settings).with_event_sink(events.clone()));
        let open = worker.open_connections();
        let handle = thread::Builder::new()
            .name("test-worker".to_string())
            .spawn(move || worker.run(listener, shutdown_rx))
            .unwrap();
        Self {
            addr,
            events,
            path,
            open,
            shutdown,
            handle,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}{}", self.addr, self.path)
    }

    pub fn open_connections(&self) -> usize {
        *self.open.borrow()
    }

    pub fn wait_for_open(&self, expected: usize) {
        assert!(
            wait_until(WAIT, || self.open_connections() == expected),
            "expected {expected} open connections, have {}",
            self.open_connections()
        );
    }

    pub fn begin_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn stop(self) -> DrainReport {
        self.begin_shutdown();
        self.join()
    }

    pub fn join(self) -> DrainReport {
        self.handle.join().unwrap().unwrap()
    }
}

pub fn connect(url: &str) -> WebSocket<TcpStream> {
    let addr = url
        .trim_start_matches("ws://")
        .split('/')
        .next()
        .unwrap()
        .to_string();
    let stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(WAIT)).unwrap();
    let (socket, _response) = tungstenite::client(url, stream).unwrap();
    socket
}

/// Sends a raw HTTP/1.1 request and returns the response head and body. Reads
/// until the connection closes or `Content-Length` bytes of body arrived.
pub fn raw_request(addr: SocketAddr, request: &str) -> String {
    let mut stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(WAIT)).unwrap();
    stream.write_all(request.as_bytes()).unwrap();

    let mut response = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => response.extend_from_slice(&buf[..n]),
        }
        if response_complete(&response) {
            break;
        }
    }
    String::from_utf8_lossy(&response).into_owned()
}

fn response_complete(response: &[u8]) -> bool {
    let text = String::from_utf8_lossy(response);
    let Some((head, body)) = text.split_once("\r\n\r\n") else {
        return false;
    };
    head.lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())
                .flatten()
        })
        .is_some_and(|length| body.len() >= length)
}
