//! Launching and controlling worker processes.

use std::fmt;
use std::io;
use std::io::Read;
use std::os::unix::process::CommandExt;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Child;
use std::process::ChildStdin;
use std::process::Command;
use std::process::ExitStatus;
use std::process::Stdio;

use super::listener::SharedListener;
use crate::config::WorkerSettings;
use crate::ids::WorkerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Term,
    Kill,
}

impl Signal {
    fn as_raw(self) -> i32 {
        match self {
            Signal::Term => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        }
    }
}

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    Exited(i32),
    Signaled(i32),
}

impl WorkerExit {
    pub fn from_status(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => WorkerExit::Exited(code),
            (None, Some(signal)) => WorkerExit::Signaled(signal),
            (None, None) => WorkerExit::Exited(-1),
        }
    }

    /// Exit status, or `128 + signal` for a killed process.
    pub fn code(self) -> i32 {
        match self {
            WorkerExit::Exited(code) => code,
            WorkerExit::Signaled(signal) => 128 + signal,
        }
    }

    pub fn is_success(self) -> bool {
        self == WorkerExit::Exited(0)
    }
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerExit::Exited(code) => write!(f, "exited with code {code}"),
            WorkerExit::Signaled(signal) => write!(f, "killed by signal {signal}"),
        }
    }
}

pub trait WorkerProcess: Send {
    fn pid(&self) -> u32;

    /// Non-blocking reap. Once an exit is observed it is returned on every
    /// later call.
    fn try_wait(&mut self) -> io::Result<Option<WorkerExit>>;

    /// Delivers `signal` unless the process has already been reaped.
    fn signal(&mut self, signal: Signal) -> io::Result<()>;

    /// The worker's status report stream, if it has one. Yields `Some` once.
    fn take_reports(&mut self) -> Option<Box<dyn Read + Send>>;
}

pub trait WorkerLauncher: Send {
    fn launch(
        &mut self,
        worker_id: WorkerId,
        listener: &SharedListener,
    ) -> io::Result<Box<dyn WorkerProcess>>;
}

/// Re-executes a wsfleet binary in worker mode.
#[derive(Debug, Clone)]
pub struct ExecLauncher {
    program: PathBuf,
    settings: WorkerSettings,
}

impl ExecLauncher {
    pub fn new(program: impl Into<PathBuf>, settings: WorkerSettings) -> Self {
        Self {
            program: program.into(),
            settings,
        }
    }

    pub fn current_exe(settings: WorkerSettings) -> io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?, settings))
    }

    fn command(&self, worker_id: WorkerId, listener: &SharedListener) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("worker")
            .arg("--worker-id")
            .arg(worker_id.to_string())
            .arg("--listen-fd")
            .arg(listener.raw_fd().to_string())
            .args(self.settings.to_args());
        // stdin EOF tells the worker its supervisor is gone.
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::inherit());
        // Terminal signals go to the supervisor only; it decides when workers stop.
        cmd.process_group(0);
        cmd
    }
}

impl WorkerLauncher for ExecLauncher {
    fn launch(
        &mut self,
        worker_id: WorkerId,
        listener: &SharedListener,
    ) -> io::Result<Box<dyn WorkerProcess>> {
        let child = self.command(worker_id, listener).spawn()?;
        Ok(Box::new(ChildWorker::new(child)))
    }
}

pub struct ChildWorker {
    child: Child,
    _stdin: Option<ChildStdin>,
    exit: Option<WorkerExit>,
}

impl ChildWorker {
    fn new(mut child: Child) -> Self {
        let stdin = child.stdin.take();
        Self {
            child,
            _stdin: stdin,
            exit: None,
        }
    }
}

impl WorkerProcess for ChildWorker {
    fn pid(&self) -> u32 {
        self.child.id()
    }

    fn try_wait(&mut self) -> io::Result<Option<WorkerExit>> {
        if self.exit.is_none() {
            self.exit = self.child.try_wait()?.map(WorkerExit::from_status);
        }
        Ok(self.exit)
    }

    fn signal(&mut self, signal: Signal) -> io::Result<()> {
        if self.exit.is_some() {
            return Ok(());
        }
        send_signal(self.child.id(), signal)
    }

    fn take_reports(&mut self) -> Option<Box<dyn Read + Send>> {
        self.child
            .stdout
            .take()
            .map(|stdout| Box::new(stdout) as Box<dyn Read + Send>)
    }
}

fn send_signal(pid: u32, signal: Signal) -> io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    // SAFETY: kill(2) has no memory-safety preconditions; the pid belongs to an
    // unreaped child so it cannot have been recycled.
    let rc = unsafe { libc::kill(pid, signal.as_raw()) };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use std::time::Instant;

    fn wait_for_exit(worker: &mut ChildWorker) -> WorkerExit {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(exit) = worker.try_wait().unwrap() {
                return exit;
            }
            assert!(Instant::now() < deadline, "process did not exit");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn exit_codes_map_signals_above_128() {
        assert_eq!(WorkerExit::Exited(3).code(), 3);
        assert_eq!(WorkerExit::Signaled(libc::SIGKILL).code(), 137);
        assert!(WorkerExit::Exited(0).is_success());
        assert_eq!(WorkerExit::Signaled(15).to_string(), "killed by signal 15");
    }

    #[test]
    fn child_worker_reports_signal_exit() {
        let child = Command::new("sleep")
            .arg("30")
            .stdin(Stdio::piped())
            .spawn()
            .unwrap();
        let mut worker = ChildWorker::new(child);
        assert_eq!(worker.try_wait().unwrap(), None);

        worker.signal(Signal::Term).unwrap();
        assert_eq!(wait_for_exit(&mut worker), WorkerExit::Signaled(libc::SIGTERM));

        // Reaped processes are never signaled again.
        worker.signal(Signal::Kill).unwrap();
        assert_eq!(worker.try_wait().unwrap(), Some(WorkerExit::Signaled(libc::SIGTERM)));
    }

    #[test]
    fn child_worker_reports_exit_code() {
        let child = Command::new("sh").args(["-c", "exit 7"]).spawn().unwrap();
        let mut worker = ChildWorker::new(child);
        assert_eq!(wait_for_exit(&mut worker), WorkerExit::Exited(7));
        assert!(worker.take_reports().is_none());
    }
}
