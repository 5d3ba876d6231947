//! One blocking client connection and its steps.

use std::io;
use std::net::SocketAddr;
use std::net::TcpStream;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use tracing::debug;
use tungstenite::Message;
use tungstenite::WebSocket;
use url::Url;

use super::plan::Step;

#[derive(Debug)]
pub(super) struct Failure {
    pub(super) kind: &'static str,
    pub(super) timed_out: bool,
}

impl Failure {
    pub(super) fn new(kind: &'static str) -> Self {
        Self {
            kind,
            timed_out: false,
        }
    }

    fn io(stage: &'static str, err: &io::Error) -> Self {
        let timed_out = matches!(
            err.kind(),
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
        );
        debug!(stage, error = %err, "Probe connection failed");
        Self {
            kind: if timed_out { "timeout" } else { stage },
            timed_out,
        }
    }

    fn ws(stage: &'static str, err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::Io(err) => Self::io(stage, &err),
            tungstenite::Error::Http(response) => {
                debug!(stage, status = %response.status(), "Probe upgrade rejected");
                Self::new("rejected")
            }
            other => {
                debug!(stage, error = %other, "Probe connection failed");
                Self::new(stage)
            }
        }
    }
}

#[derive(Debug)]
pub(super) struct Outcome {
    pub(super) connect_latency: Duration,
    pub(super) sent: usize,
    pub(super) replies: usize,
}

pub(super) fn run_connection(
    url: &Url,
    addr: SocketAddr,
    connect_timeout: Duration,
    steps: &[Step],
) -> Result<Outcome, Failure> {
    let started = Instant::now();
    let stream = TcpStream::connect_timeout(&addr, connect_timeout)
        .map_err(|err| Failure::io("connect", &err))?;
    stream
        .set_read_timeout(Some(connect_timeout))
        .and_then(|()| stream.set_write_timeout(Some(connect_timeout)))
        .map_err(|err| Failure::io("connect", &err))?;

    let (mut socket, _response) =
        tungstenite::client(url.as_str(), stream).map_err(|err| match err {
            tungstenite::HandshakeError::Failure(err) => Failure::ws("handshake", err),
            tungstenite::HandshakeError::Interrupted(_) => Failure {
                kind: "timeout",
                timed_out: true,
            },
        })?;
    let mut outcome = Outcome {
        connect_latency: started.elapsed(),
        sent: 0,
        replies: 0,
    };

    for step in steps {
        match step {
            Step::Message { await_reply, .. } => {
                let text = step.text().unwrap_or_default();
                socket
                    .send(Message::Text(text))
                    .map_err(|err| Failure::ws("send", err))?;
                outcome.sent += 1;
                if *await_reply {
                    await_data(&mut socket)?;
                    outcome.replies += 1;
                }
            }
            Step::Sleep { duration_ms } => thread::sleep(Duration::from_millis(*duration_ms)),
            Step::Disconnect => break,
        }
    }
    close(&mut socket);
    Ok(outcome)
}

fn await_data(socket: &mut WebSocket<TcpStream>) -> Result<(), Failure> {
    loop {
        match socket.read().map_err(|err| Failure::ws("receive", err))? {
            Message::Text(_) | Message::Binary(_) => return Ok(()),
            Message::Close(_) => return Err(Failure::new("closed")),
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
        }
    }
}

/// Best effort: sends a close frame and reads until the server answers or
/// the read timeout fires.
fn close(socket: &mut WebSocket<TcpStream>) {
    if socket.close(None).is_err() {
        return;
    }
    while socket.read().is_ok() {}
}
