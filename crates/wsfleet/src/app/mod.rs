#![expect(
    clippy::print_stdout,
    clippy::print_stderr,
    reason = "The application layer writes probe reports and operator-facing errors"
)]

pub mod commands;

use std::io::Read;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::thread;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;
use wsfleet_common::StreamPolicy;
use wsfleet_common::init_tracing;

use crate::app::commands::Cli;
use crate::app::commands::Commands;
use crate::app::commands::ProbeArgs;
use crate::app::commands::ServeArgs;
use crate::app::commands::WorkerArgs;
use crate::config::FleetConfig;
use crate::error::FleetError;
use crate::error::exit_codes;
use crate::events::TracingSink;
use crate::probe::ProbeError;
use crate::probe::run_probe;
use crate::protocol::LineReporter;
use crate::signal_handler::ShutdownNotifierHandle;
use crate::signal_handler::SignalHandler;
use crate::signal_handler::WatchNotifier;
use crate::supervisor::ExecLauncher;
use crate::supervisor::ShutdownReport;
use crate::supervisor::Supervisor;
use crate::worker::DrainReport;
use crate::worker::Worker;
use crate::worker::inherited_listener;

pub struct Application;

impl Default for Application {
    fn default() -> Self {
        Self::new()
    }
}

impl Application {
    pub fn new() -> Self {
        Self
    }

    /// Parses the command line, runs the chosen command and returns the
    /// process exit code.
    pub fn run(&self) -> anyhow::Result<i32> {
        let cli = Cli::parse();
        let level = if cli.verbose { "debug" } else { "info" };
        match &cli.command {
            Commands::Serve(args) => {
                let _telemetry = init_tracing(level, StreamPolicy::FromEnv);
                Ok(self.serve(args))
            }
            Commands::Worker(args) => {
                // stdout carries the report stream.
                let _telemetry = init_tracing(level, StreamPolicy::StderrOnly);
                Ok(self.worker(args))
            }
            Commands::Probe(args) => {
                let _telemetry =
                    init_tracing(if cli.verbose { "debug" } else { "warn" }, StreamPolicy::FromEnv);
                self.probe(args)
            }
        }
    }

    fn serve(&self, args: &ServeArgs) -> i32 {
        match self.execute_serve(args) {
            Ok(report) => {
                if !report.forced.is_empty() {
                    warn!(forced = report.forced.len(), "Some workers had to be killed");
                }
                exit_codes::SUCCESS
            }
            Err(err) => {
                error!(error = %err, "Supervisor failed");
                eprintln!("Error: {err}");
                eprintln!("Suggestion: {}", err.suggestion());
                if err.is_retryable() {
                    eprintln!("(This error may be transient - retry may succeed)");
                }
                err.exit_code()
            }
        }
    }

    fn execute_serve(&self, args: &ServeArgs) -> Result<ShutdownReport, FleetError> {
        let mut config = FleetConfig::load(args.config.as_deref())?;
        args.apply(&mut config);
        debug!(?config, "Configuration resolved");

        let shutdown = Arc::new(AtomicBool::new(false));
        let _signals = SignalHandler::setup(Arc::clone(&shutdown), None)?;
        let launcher =
            ExecLauncher::current_exe(config.worker_settings()).map_err(FleetError::Executable)?;
        let mut supervisor = Supervisor::start(&config, Box::new(launcher), Arc::new(TracingSink))?;
        supervisor.run(&shutdown)
    }

    fn worker(&self, args: &WorkerArgs) -> i32 {
        match self.execute_worker(args) {
            Ok(report) => {
                if report.timed_out {
                    warn!(
                        remaining = report.remaining,
                        "Drain deadline passed with connections still open"
                    );
                }
                exit_codes::SUCCESS
            }
            Err(err) => {
                error!(worker_id = args.worker_id, error = %format!("{err:#}"), "Worker failed");
                exit_codes::SOFTWARE
            }
        }
    }

    fn execute_worker(&self, args: &WorkerArgs) -> anyhow::Result<DrainReport> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let notifier: ShutdownNotifierHandle = Arc::new(WatchNotifier::new(shutdown_tx));
        let _signals = SignalHandler::setup(
            Arc::new(AtomicBool::new(false)),
            Some(Arc::clone(&notifier)),
        )?;
        watch_supervisor(notifier).context("failed to watch supervisor pipe")?;

        let listener = inherited_listener(args.listen_fd)?;
        let worker = Worker::new(args.worker_id(), args.settings())
            .with_reporter(Box::new(LineReporter::stdout()));
        info!(worker_id = args.worker_id, pid = std::process::id(), "Worker starting");
        let report = worker.run(listener, shutdown_rx)?;
        Ok(report)
    }

    fn probe(&self, args: &ProbeArgs) -> anyhow::Result<i32> {
        let report = match args.to_config().and_then(|config| run_probe(&config)) {
            Ok(report) => report,
            Err(err) => {
                eprintln!("Error: {err}");
                return Ok(match err {
                    ProbeError::InvalidUrl { .. }
                    | ProbeError::NoConnections
                    | ProbeError::InvalidPlan(_)
                    | ProbeError::PlanFile { .. } => exit_codes::USAGE,
                    ProbeError::Resolve { .. } => exit_codes::UNAVAILABLE,
                });
            }
        };
        let json = serde_json::to_string_pretty(&report).context("failed to encode probe report")?;
        println!("{json}");
        Ok(if report.all_succeeded() {
            exit_codes::SUCCESS
        } else {
            exit_codes::GENERAL_ERROR
        })
    }
}

/// Starts draining once stdin reaches EOF, which happens when the supervisor
/// exits without signaling.
fn watch_supervisor(notifier: ShutdownNotifierHandle) -> std::io::Result<()> {
    thread::Builder::new()
        .name("supervisor-watch".to_string())
        .spawn(move || {
            let mut stdin = std::io::stdin().lock();
            let mut buf = [0u8; 256];
            loop {
                match stdin.read(&mut buf) {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
                    Err(_) => break,
                }
            }
            warn!("Supervisor pipe closed; draining");
            notifier.notify();
        })?;
    Ok(())
}
