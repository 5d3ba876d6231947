//! Supervisor: binds the shared listener, keeps `workers` worker processes
//! alive and coordinates shutdown.

mod listener;
mod process;
mod restart;

use std::collections::HashMap;
use std::io::BufRead;
use std::io::BufReader;
use std::io::Read;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;
use wsfleet_common::mutex_lock_or_recover;

pub use listener::SharedListener;
pub use process::ChildWorker;
pub use process::ExecLauncher;
pub use process::Signal;
pub use process::WorkerExit;
pub use process::WorkerLauncher;
pub use process::WorkerProcess;
pub use restart::RestartDecision;
pub use restart::RestartTracker;

use crate::config::FleetConfig;
use crate::config::duration_ms;
use crate::error::FleetError;
use crate::error::ShutdownTimeoutError;
use crate::events::EventSink;
use crate::events::LifecycleEvent;
use crate::ids::IdSequence;
use crate::ids::WorkerId;
use crate::protocol::WorkerReport;

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const REAP_INTERVAL: Duration = Duration::from_millis(20);
const KILL_WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Starting,
    Running,
    Exited(i32),
}

pub struct WorkerHandle {
    id: WorkerId,
    pid: u32,
    status: WorkerStatus,
    started_at: Instant,
    process: Box<dyn WorkerProcess>,
}

impl WorkerHandle {
    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn status(&self) -> WorkerStatus {
        self.status
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSnapshot {
    pub id: WorkerId,
    pub pid: u32,
    pub status: WorkerStatus,
    pub open_connections: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Set when an earlier call already performed the shutdown.
    pub already_shut_down: bool,
    pub terminated: Vec<WorkerId>,
    /// Workers that outlived the grace period and were killed.
    pub forced: Vec<WorkerId>,
}

#[derive(Debug, Default, Clone, Copy)]
struct ReportState {
    ready: bool,
    open: usize,
}

type ReportBoard = Arc<Mutex<HashMap<WorkerId, ReportState>>>;

struct PendingRespawn {
    replaces: WorkerId,
    due: Instant,
}

pub struct Supervisor {
    listener: SharedListener,
    launcher: Box<dyn WorkerLauncher>,
    sink: Arc<dyn EventSink>,
    target: usize,
    grace: Duration,
    workers: Vec<WorkerHandle>,
    pending: Vec<PendingRespawn>,
    restarts: RestartTracker,
    ids: IdSequence,
    reports: ReportBoard,
    shut_down: bool,
}

impl Supervisor {
    /// Binds the listen address, then launches `config.workers` workers. No
    /// worker exists if binding fails.
    pub fn start(
        config: &FleetConfig,
        launcher: Box<dyn WorkerLauncher>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self, FleetError> {
        config.validate()?;
        let listener = SharedListener::bind(&config.listen_addr())?;
        info!(
            addr = %listener.local_addr(),
            workers = config.workers,
            path = %config.path,
            "Supervisor listening"
        );

        let mut supervisor = Self {
            listener,
            launcher,
            sink,
            target: config.workers,
            grace: config.shutdown_grace,
            workers: Vec::with_capacity(config.workers),
            pending: Vec::new(),
            restarts: RestartTracker::new(config.restart.clone()),
            ids: IdSequence::new(),
            reports: Arc::new(Mutex::new(HashMap::new())),
            shut_down: false,
        };

        for _ in 0..config.workers {
            if let Err(err) = supervisor.launch() {
                error!(error = %err, "Worker launch failed during startup");
                supervisor.shutdown();
                return Err(err);
            }
        }
        Ok(supervisor)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    pub fn target_workers(&self) -> usize {
        self.target
    }

    /// Live worker processes, excluding slots waiting for a respawn.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn pending_respawns(&self) -> usize {
        self.pending.len()
    }

    pub fn workers(&self) -> &[WorkerHandle] {
        &self.workers
    }

    pub fn status(&self) -> Vec<WorkerSnapshot> {
        let board = mutex_lock_or_recover(&self.reports);
        self.workers
            .iter()
            .map(|worker| {
                let report = board.get(&worker.id).copied().unwrap_or_default();
                let status = match worker.status {
                    WorkerStatus::Starting if report.ready => WorkerStatus::Running,
                    other => other,
                };
                WorkerSnapshot {
                    id: worker.id,
                    pid: worker.pid,
                    status,
                    open_connections: report.open,
                }
            })
            .collect()
    }

    pub fn total_open_connections(&self) -> usize {
        self.status()
            .iter()
            .map(|snapshot| snapshot.open_connections)
            .sum()
    }

    /// Polls until `shutdown` is set, then shuts the fleet down.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<ShutdownReport, FleetError> {
        while !shutdown.load(Ordering::SeqCst) {
            self.poll()?;
            thread::sleep(POLL_INTERVAL);
        }
        info!("Shutdown requested");
        Ok(self.shutdown())
    }

    /// Reaps exited workers and launches replacements that are due.
    pub fn poll(&mut self) -> Result<(), FleetError> {
        self.poll_at(Instant::now())
    }

    fn poll_at(&mut self, now: Instant) -> Result<(), FleetError> {
        if self.shut_down {
            return Ok(());
        }

        for (id, exit) in self.reap() {
            warn!(worker_id = %id, reason = %exit, "Worker exited unexpectedly");
            self.schedule_respawn(id, now)?;
        }

        let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|pending| pending.due <= now);
        self.pending = waiting;
        for pending in due {
            match self.launch() {
                Ok(new_id) => self.sink.emit(&LifecycleEvent::WorkerRespawned {
                    old_id: pending.replaces,
                    new_id,
                }),
                Err(err) => {
                    warn!(error = %err, replaces = %pending.replaces, "Replacement launch failed");
                    self.schedule_respawn(pending.replaces, now)?;
                }
            }
        }
        Ok(())
    }

    /// Stops respawning, asks every worker to drain, and kills those still
    /// running after the grace period. Later calls do nothing.
    pub fn shutdown(&mut self) -> ShutdownReport {
        if self.shut_down {
            return ShutdownReport {
                already_shut_down: true,
                ..ShutdownReport::default()
            };
        }
        self.shut_down = true;
        self.pending.clear();

        let mut report = ShutdownReport::default();
        info!(workers = self.workers.len(), "Stopping workers");
        for worker in &mut self.workers {
            if matches!(worker.process.try_wait(), Ok(Some(_))) {
                continue;
            }
            if let Err(err) = worker.process.signal(Signal::Term) {
                warn!(worker_id = %worker.id, error = %err, "Failed to send SIGTERM");
            }
        }

        let mut exits = self.wait_for_exits(Instant::now() + self.grace);
        let stragglers: Vec<WorkerId> = self.workers.iter().map(|worker| worker.id).collect();
        if !stragglers.is_empty() {
            warn!(
                "{}",
                ShutdownTimeoutError {
                    grace: self.grace,
                    stragglers: stragglers.clone(),
                }
            );
            for worker in &mut self.workers {
                if let Err(err) = worker.process.signal(Signal::Kill) {
                    warn!(worker_id = %worker.id, error = %err, "Failed to send SIGKILL");
                }
            }
            exits.extend(self.wait_for_exits(Instant::now() + KILL_WAIT));
            report.forced = stragglers;
        }

        for (id, exit) in exits {
            self.sink.emit(&LifecycleEvent::WorkerExited {
                worker_id: id,
                code: exit.code(),
            });
            report.terminated.push(id);
        }
        for worker in &self.workers {
            error!(worker_id = %worker.id, pid = worker.pid, "Worker survived SIGKILL");
        }
        self.workers.clear();
        mutex_lock_or_recover(&self.reports).clear();
        info!(
            terminated = report.terminated.len(),
            forced = report.forced.len(),
            "Supervisor stopped"
        );
        report
    }

    fn launch(&mut self) -> Result<WorkerId, FleetError> {
        let id = self.ids.next_worker();
        let mut process = self
            .launcher
            .launch(id, &self.listener)
            .map_err(|source| FleetError::Spawn {
                worker_id: id,
                source,
            })?;
        let pid = process.pid();

        {
            let mut board = mutex_lock_or_recover(&self.reports);
            let ready = match process.take_reports() {
                Some(stream) => {
                    spawn_report_reader(id, stream, Arc::clone(&self.reports));
                    false
                }
                None => true,
            };
            board.insert(
                id,
                ReportState {
                    ready,
                    ..ReportState::default()
                },
            );
        }

        self.workers.push(WorkerHandle {
            id,
            pid,
            status: WorkerStatus::Starting,
            started_at: Instant::now(),
            process,
        });
        self.sink.emit(&LifecycleEvent::WorkerStarted { worker_id: id, pid });
        Ok(id)
    }

    /// Removes every worker that has exited and emits `worker.exited` for it.
    fn reap(&mut self) -> Vec<(WorkerId, WorkerExit)> {
        let mut exited = Vec::new();
        let mut index = 0;
        while index < self.workers.len() {
            let worker = &mut self.workers[index];
            match worker.process.try_wait() {
                Ok(Some(exit)) => {
                    worker.status = WorkerStatus::Exited(exit.code());
                    let worker = self.workers.swap_remove(index);
                    mutex_lock_or_recover(&self.reports).remove(&worker.id);
                    self.sink.emit(&LifecycleEvent::WorkerExited {
                        worker_id: worker.id,
                        code: exit.code(),
                    });
                    exited.push((worker.id, exit));
                    continue;
                }
                Ok(None) => {
                    if worker.status == WorkerStatus::Starting
                        && mutex_lock_or_recover(&self.reports)
                            .get(&worker.id)
                            .is_some_and(|state| state.ready)
                    {
                        worker.status = WorkerStatus::Running;
                        debug!(worker_id = %worker.id, "Worker ready");
                    }
                }
                Err(err) => warn!(worker_id = %worker.id, error = %err, "Failed to poll worker"),
            }
            index += 1;
        }
        exited
    }

    fn schedule_respawn(&mut self, replaces: WorkerId, now: Instant) -> Result<(), FleetError> {
        match self.restarts.record_failure(now) {
            RestartDecision::Respawn { delay } => {
                debug!(replaces = %replaces, delay_ms = duration_ms(delay), "Respawn scheduled");
                self.pending.push(PendingRespawn {
                    replaces,
                    due: now + delay,
                });
                Ok(())
            }
            RestartDecision::GiveUp { failures } => {
                let window = self.restarts.policy().failure_window;
                self.sink.emit(&LifecycleEvent::RespawnSuspended {
                    failures,
                    window_ms: duration_ms(window),
                });
                self.shutdown();
                Err(FleetError::CrashLoop { failures, window })
            }
        }
    }

    /// Reaps workers until all are gone or `deadline` passes. Exited workers
    /// are removed from the pool.
    fn wait_for_exits(&mut self, deadline: Instant) -> Vec<(WorkerId, WorkerExit)> {
        let mut exits = Vec::new();
        loop {
            self.workers.retain_mut(|worker| match worker.process.try_wait() {
                Ok(Some(exit)) => {
                    worker.status = WorkerStatus::Exited(exit.code());
                    exits.push((worker.id, exit));
                    false
                }
                Ok(None) => true,
                Err(err) => {
                    warn!(worker_id = %worker.id, error = %err, "Failed to poll worker");
                    true
                }
            });
            if self.workers.is_empty() || Instant::now() >= deadline {
                return exits;
            }
            thread::sleep(REAP_INTERVAL);
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_report_reader(id: WorkerId, stream: Box<dyn Read + Send>, board: ReportBoard) {
    let spawned = thread::Builder::new()
        .name(format!("worker-{id}-reports"))
        .spawn(move || {
            for line in BufReader::new(stream).lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(err) => {
                        debug!(worker_id = %id, error = %err, "Report stream failed");
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                let report = match WorkerReport::from_line(&line) {
                    Ok(report) => report,
                    Err(_) => {
                        debug!(worker_id = %id, line = %line, "Ignoring non-report output");
                        continue;
                    }
                };
                let mut board = mutex_lock_or_recover(&board);
                // The entry is gone once the worker has been reaped.
                let Some(state) = board.get_mut(&id) else {
                    break;
                };
                if matches!(report, WorkerReport::Ready { .. }) {
                    state.ready = true;
                }
                if let Some(open) = report.open_connections() {
                    state.open = open;
                }
            }
        });
    if let Err(err) = spawned {
        warn!(worker_id = %id, error = %err, "Failed to spawn report reader");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RestartPolicy;
    use crate::events::MemorySink;
    use std::collections::HashSet;
    use std::io;
    use std::io::Cursor;

    #[derive(Default)]
    struct MockState {
        next_pid: u32,
        launched: Vec<WorkerId>,
        exits: HashMap<u32, WorkerExit>,
        signals: Vec<(u32, Signal)>,
        ignore_term: HashSet<u32>,
        fail_launches: usize,
        reports: Option<String>,
    }

    type Shared = Arc<Mutex<MockState>>;

    struct MockLauncher(Shared);

    struct MockWorker {
        pid: u32,
        state: Shared,
        reports: Option<String>,
    }

    impl WorkerLauncher for MockLauncher {
        fn launch(
            &mut self,
            worker_id: WorkerId,
            _listener: &SharedListener,
        ) -> io::Result<Box<dyn WorkerProcess>> {
            let mut state = self.0.lock().unwrap();
            if state.fail_launches > 0 {
                state.fail_launches -= 1;
                return Err(io::Error::other("fork failed"));
            }
            state.next_pid += 1;
            let pid = 1000 + state.next_pid;
            state.launched.push(worker_id);
            Ok(Box::new(MockWorker {
                pid,
                state: Arc::clone(&self.0),
                reports: state.reports.clone(),
            }))
        }
    }

    impl WorkerProcess for MockWorker {
        fn pid(&self) -> u32 {
            self.pid
        }

        fn try_wait(&mut self) -> io::Result<Option<WorkerExit>> {
            Ok(self.state.lock().unwrap().exits.get(&self.pid).copied())
        }

        fn signal(&mut self, signal: Signal) -> io::Result<()> {
            let mut state = self.state.lock().unwrap();
            state.signals.push((self.pid, signal));
            let honored = signal == Signal::Kill || !state.ignore_term.contains(&self.pid);
            if honored && !state.exits.contains_key(&self.pid) {
                let raw = match signal {
                    Signal::Term => libc::SIGTERM,
                    Signal::Kill => libc::SIGKILL,
                };
                state.exits.insert(self.pid, WorkerExit::Signaled(raw));
            }
            Ok(())
        }

        fn take_reports(&mut self) -> Option<Box<dyn Read + Send>> {
            self.reports
                .take()
                .map(|text| Box::new(Cursor::new(text.into_bytes())) as Box<dyn Read + Send>)
        }
    }

    fn config(workers: usize) -> FleetConfig {
        FleetConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            workers,
            shutdown_grace: Duration::from_millis(200),
            restart: RestartPolicy {
                initial_backoff: Duration::from_millis(10),
                max_backoff: Duration::from_millis(100),
                max_failures: 3,
                failure_window: Duration::from_secs(60),
            },
            ..FleetConfig::default()
        }
    }

    fn start(workers: usize, state: &Shared) -> (Supervisor, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let supervisor = Supervisor::start(
            &config(workers),
            Box::new(MockLauncher(Arc::clone(state))),
            sink.clone(),
        )
        .unwrap();
        (supervisor, sink)
    }

    fn crash(state: &Shared, supervisor: &Supervisor, index: usize) -> WorkerId {
        let worker = &supervisor.workers()[index];
        state
            .lock()
            .unwrap()
            .exits
            .insert(worker.pid(), WorkerExit::Signaled(libc::SIGKILL));
        worker.id()
    }

    #[test]
    fn start_launches_the_configured_pool() {
        let state = Shared::default();
        let (supervisor, sink) = start(4, &state);

        assert_eq!(supervisor.worker_count(), 4);
        assert_ne!(supervisor.local_addr().port(), 0);
        assert_eq!(sink.count("worker.started"), 4);
        let ids: HashSet<_> = supervisor.workers().iter().map(WorkerHandle::id).collect();
        assert_eq!(ids.len(), 4);
    }

    #[test]
    fn killed_worker_is_replaced_exactly_once() {
        let state = Shared::default();
        let (mut supervisor, sink) = start(2, &state);
        let dead = crash(&state, &supervisor, 0);

        let now = Instant::now();
        supervisor.poll_at(now).unwrap();
        assert_eq!(supervisor.worker_count(), 1);
        assert_eq!(supervisor.pending_respawns(), 1);
        assert!(sink.events().contains(&LifecycleEvent::WorkerExited {
            worker_id: dead,
            code: 137,
        }));

        let later = now + Duration::from_secs(1);
        supervisor.poll_at(later).unwrap();
        supervisor.poll_at(later).unwrap();
        assert_eq!(supervisor.worker_count(), 2);
        assert_eq!(state.lock().unwrap().launched.len(), 3);
        assert_eq!(sink.count("worker.respawned"), 1);
        assert!(sink.events().contains(&LifecycleEvent::WorkerRespawned {
            old_id: dead,
            new_id: WorkerId::new(3),
        }));
    }

    #[test]
    fn clean_exit_outside_shutdown_is_also_replaced() {
        let state = Shared::default();
        let (mut supervisor, sink) = start(1, &state);
        let pid = supervisor.workers()[0].pid();
        state.lock().unwrap().exits.insert(pid, WorkerExit::Exited(0));

        let now = Instant::now();
        supervisor.poll_at(now).unwrap();
        supervisor.poll_at(now + Duration::from_secs(1)).unwrap();
        assert_eq!(supervisor.worker_count(), 1);
        assert_eq!(sink.count("worker.respawned"), 1);
    }

    #[test]
    fn crash_loop_suspends_respawning() {
        let state = Shared::default();
        let (mut supervisor, sink) = start(1, &state);
        let mut now = Instant::now();

        for _ in 0..3 {
            crash(&state, &supervisor, 0);
            supervisor.poll_at(now).unwrap();
            now += Duration::from_secs(1);
            supervisor.poll_at(now).unwrap();
            assert_eq!(supervisor.worker_count(), 1);
        }

        crash(&state, &supervisor, 0);
        let err = supervisor.poll_at(now).unwrap_err();
        assert!(matches!(err, FleetError::CrashLoop { failures: 4, .. }));
        assert_eq!(sink.count("supervisor.respawn_suspended"), 1);
        assert_eq!(supervisor.worker_count(), 0);
        assert_eq!(supervisor.pending_respawns(), 0);

        supervisor.poll_at(now + Duration::from_secs(10)).unwrap();
        assert_eq!(state.lock().unwrap().launched.len(), 4);
    }

    #[test]
    fn failed_replacement_launch_counts_as_failure() {
        let state = Shared::default();
        let (mut supervisor, _sink) = start(1, &state);
        crash(&state, &supervisor, 0);
        state.lock().unwrap().fail_launches = 1;

        let now = Instant::now();
        supervisor.poll_at(now).unwrap();
        supervisor.poll_at(now + Duration::from_secs(1)).unwrap();
        assert_eq!(supervisor.worker_count(), 0);
        assert_eq!(supervisor.pending_respawns(), 1);

        supervisor.poll_at(now + Duration::from_secs(2)).unwrap();
        assert_eq!(supervisor.worker_count(), 1);
    }

    #[test]
    fn shutdown_terminates_every_worker_once() {
        let state = Shared::default();
        let (mut supervisor, sink) = start(3, &state);

        let report = supervisor.shutdown();
        assert!(!report.already_shut_down);
        assert_eq!(report.terminated.len(), 3);
        assert!(report.forced.is_empty());
        assert_eq!(sink.count("worker.exited"), 3);

        let again = supervisor.shutdown();
        assert!(again.already_shut_down);
        let signals = state.lock().unwrap().signals.clone();
        assert_eq!(signals.len(), 3);
        assert!(signals.iter().all(|(_, signal)| *signal == Signal::Term));

        drop(supervisor);
        assert_eq!(state.lock().unwrap().signals.len(), 3);
    }

    #[test]
    fn stragglers_are_killed_after_grace() {
        let state = Shared::default();
        let (mut supervisor, _sink) = start(2, &state);
        let stubborn = supervisor.workers()[1].pid();
        let stubborn_id = supervisor.workers()[1].id();
        state.lock().unwrap().ignore_term.insert(stubborn);

        let started = Instant::now();
        let report = supervisor.shutdown();
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert_eq!(report.forced, vec![stubborn_id]);
        assert_eq!(report.terminated.len(), 2);

        let signals = state.lock().unwrap().signals.clone();
        assert!(signals.contains(&(stubborn, Signal::Kill)));
        assert_eq!(signals.iter().filter(|(_, s)| *s == Signal::Kill).count(), 1);
    }

    #[test]
    fn bind_failure_happens_before_any_launch() {
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut config = config(2);
        config.port = occupied.local_addr().unwrap().port();
        let state = Shared::default();

        let result = Supervisor::start(
            &config,
            Box::new(MockLauncher(Arc::clone(&state))),
            Arc::new(MemorySink::new()),
        );
        assert!(matches!(result, Err(FleetError::Bind(_))));
        assert!(state.lock().unwrap().launched.is_empty());
    }

    #[test]
    fn invalid_config_is_rejected_before_binding() {
        let state = Shared::default();
        let result = Supervisor::start(
            &config(0),
            Box::new(MockLauncher(Arc::clone(&state))),
            Arc::new(MemorySink::new()),
        );
        assert!(matches!(result, Err(FleetError::Config(_))));
    }

    struct FailNth {
        inner: MockLauncher,
        calls: usize,
        fail_on: usize,
    }

    impl WorkerLauncher for FailNth {
        fn launch(
            &mut self,
            worker_id: WorkerId,
            listener: &SharedListener,
        ) -> io::Result<Box<dyn WorkerProcess>> {
            self.calls += 1;
            if self.calls == self.fail_on {
                return Err(io::Error::other("fork failed"));
            }
            self.inner.launch(worker_id, listener)
        }
    }

    #[test]
    fn startup_launch_failure_stops_launched_workers() {
        let state = Shared::default();
        let sink = Arc::new(MemorySink::new());
        let launcher = FailNth {
            inner: MockLauncher(Arc::clone(&state)),
            calls: 0,
            fail_on: 3,
        };

        match Supervisor::start(&config(4), Box::new(launcher), sink.clone()) {
            Err(FleetError::Spawn { worker_id, .. }) => assert_eq!(worker_id, WorkerId::new(3)),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("start should fail"),
        }
        assert_eq!(state.lock().unwrap().launched.len(), 2);
        assert_eq!(state.lock().unwrap().signals.len(), 2);
        assert_eq!(sink.count("worker.exited"), 2);
    }

    #[test]
    fn status_reflects_worker_reports() {
        let state = Shared::default();
        state.lock().unwrap().reports = Some(
            [
                WorkerReport::Ready {
                    worker_id: WorkerId::new(1),
                    pid: 1001,
                }
                .to_line(),
                "not a report\n".to_string(),
                WorkerReport::Connections {
                    worker_id: WorkerId::new(1),
                    open: 4,
                }
                .to_line(),
            ]
            .concat(),
        );
        let (mut supervisor, _sink) = start(1, &state);

        let deadline = Instant::now() + Duration::from_secs(5);
        while supervisor.total_open_connections() != 4 {
            assert!(Instant::now() < deadline, "report never arrived");
            thread::sleep(Duration::from_millis(10));
        }
        supervisor.poll().unwrap();
        let snapshot = supervisor.status();
        assert_eq!(snapshot[0].status, WorkerStatus::Running);
        assert_eq!(snapshot[0].open_connections, 4);
        assert_eq!(supervisor.workers()[0].status(), WorkerStatus::Running);
    }
}
