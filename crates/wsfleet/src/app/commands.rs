use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use clap::Parser;
use clap::Subcommand;
use clap::ValueHint;

use crate::config::DEFAULT_MAX_CONNECTIONS;
use crate::config::DEFAULT_MAX_MESSAGE_BYTES;
use crate::config::DEFAULT_PATH;
use crate::config::DEFAULT_SHUTDOWN_GRACE_MS;
use crate::config::FleetConfig;
use crate::config::HandlerKind;
use crate::config::WorkerSettings;
use crate::config::idle_timeout_from_ms;
use crate::ids::WorkerId;
use crate::probe::HitRate;
use crate::probe::Load;
use crate::probe::PlanFile;
use crate::probe::ProbeConfig;
use crate::probe::ProbeError;
use crate::probe::Step;

const AFTER_LONG_HELP: &str = r#"CONFIGURATION:
    Settings are layered: built-in defaults, then the --config JSON file,
    then WSFLEET_* environment variables, then command-line flags.

EXAMPLES:
    # Four workers on port 9000, echoing every message
    wsfleet serve --port 9000 --workers 4 --handler echo

    # Open 200 connections against a running server and hold them 5s
    wsfleet probe ws://127.0.0.1:9000/ -n 200 --hold-ms 5000

    # Ramp from 0 to 500 connections per second over 30s, then hold 500/s for 60s
    wsfleet probe ws://127.0.0.1:9000/ --ramp 0:500:30 --ramp 500:500:60

LOGGING:
    RUST_LOG=debug            Log filter (default: info)
    WSFLEET_LOG_FORMAT=json   Structured JSON logs
    WSFLEET_LOG=<path>        Also write logs to a file"#;

#[derive(Debug, Parser)]
#[command(name = "wsfleet")]
#[command(author, version, propagate_version = true)]
#[command(about = "Multi-process WebSocket server with worker supervision")]
#[command(after_long_help = AFTER_LONG_HELP)]
#[command(subcommand_required = true, arg_required_else_help = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Bind the listen address and run a supervised pool of workers
    Serve(ServeArgs),

    /// Open WebSocket connections against a server and report how they went
    Probe(ProbeArgs),

    /// Serve connections on an inherited listener (started by `serve`)
    #[command(hide = true)]
    Worker(WorkerArgs),
}

#[derive(Debug, Clone, Default, Args)]
pub struct ServeArgs {
    /// JSON configuration file
    #[arg(short, long, value_name = "FILE", value_hint = ValueHint::FilePath)]
    pub config: Option<PathBuf>,

    #[arg(long)]
    pub host: Option<String>,

    #[arg(short, long)]
    pub port: Option<u16>,

    /// Number of worker processes (default: logical CPUs)
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// How long workers get to drain before they are killed
    #[arg(long, value_name = "MS")]
    pub shutdown_grace_ms: Option<u64>,

    /// HTTP path that accepts WebSocket upgrades
    #[arg(long)]
    pub path: Option<String>,

    /// Per-worker connection limit
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Close connections idle this long; 0 disables
    #[arg(long, value_name = "MS")]
    pub idle_timeout_ms: Option<u64>,

    #[arg(long, value_enum)]
    pub handler: Option<HandlerKind>,
}

impl ServeArgs {
    /// Applies flags on top of an already layered configuration.
    pub fn apply(&self, config: &mut FleetConfig) {
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(ms) = self.shutdown_grace_ms {
            config.shutdown_grace = Duration::from_millis(ms);
        }
        if let Some(path) = &self.path {
            config.path = path.clone();
        }
        if let Some(max) = self.max_connections {
            config.max_connections = max;
        }
        if let Some(ms) = self.idle_timeout_ms {
            config.idle_timeout = idle_timeout_from_ms(ms);
        }
        if let Some(handler) = self.handler {
            config.handler = handler;
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct ProbeArgs {
    /// Server URL, e.g. ws://127.0.0.1:8080/ (overrides the plan's url)
    #[arg(value_hint = ValueHint::Url, required_unless_present = "plan")]
    pub url: Option<String>,

    /// JSON load plan with rates and per-connection steps
    #[arg(long, value_name = "FILE", value_hint = ValueHint::FilePath)]
    pub plan: Option<PathBuf>,

    /// Connections to open at once when no ramp is given
    #[arg(short = 'n', long, default_value_t = crate::probe::DEFAULT_PROBE_CONNECTIONS)]
    pub connections: usize,

    /// Open connections on a linear per-second ramp; repeat to chain ramps
    #[arg(long, value_name = "START:END:SECS", value_parser = parse_ramp)]
    pub ramp: Vec<HitRate>,

    #[arg(long, value_name = "MS")]
    pub connect_timeout_ms: Option<u64>,

    /// Connections driven at the same time
    #[arg(long, value_name = "N")]
    pub max_in_flight: Option<usize>,

    /// Send this text on each connection and wait for a reply
    #[arg(short, long)]
    pub message: Option<String>,

    /// Keep every connection open this long before closing
    #[arg(long, value_name = "MS")]
    pub hold_ms: Option<u64>,
}

impl ProbeArgs {
    /// Layers flags over the `--plan` file. Ramps and steps given as flags
    /// replace the plan's.
    pub fn to_config(&self) -> Result<ProbeConfig, ProbeError> {
        let plan = match &self.plan {
            Some(path) => PlanFile::read(path)?,
            None => PlanFile::default(),
        };
        let url = self
            .url
            .clone()
            .or(plan.url)
            .ok_or_else(|| ProbeError::InvalidPlan("no url given".to_string()))?;

        let mut config = ProbeConfig::new(url);
        config.load = if !self.ramp.is_empty() {
            Load::Ramps(self.ramp.clone())
        } else if !plan.rates.is_empty() {
            Load::Ramps(plan.rates)
        } else {
            Load::Burst {
                connections: self.connections,
            }
        };

        let flag_steps = self.flag_steps();
        config.steps = if flag_steps.is_empty() {
            plan.steps
        } else {
            flag_steps
        };
        if let Some(ms) = self.connect_timeout_ms.or(plan.connect_timeout_ms) {
            config.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(max) = self.max_in_flight.or(plan.max_in_flight) {
            config.max_in_flight = max;
        }
        Ok(config)
    }

    fn flag_steps(&self) -> Vec<Step> {
        let mut steps = Vec::new();
        if let Some(text) = &self.message {
            steps.push(Step::Message {
                send: serde_json::Value::String(text.clone()),
                await_reply: true,
            });
        }
        if let Some(ms) = self.hold_ms.filter(|ms| *ms > 0) {
            steps.push(Step::Sleep { duration_ms: ms });
        }
        steps
    }
}

fn parse_ramp(raw: &str) -> Result<HitRate, String> {
    let parts: Vec<&str> = raw.split(':').collect();
    let [start, end, secs] = parts.as_slice() else {
        return Err(format!("expected START:END:SECS, got {raw:?}"));
    };
    let rate = |value: &str| {
        value
            .trim()
            .parse::<f64>()
            .map_err(|err| format!("invalid rate {value:?}: {err}"))
    };
    let duration = secs
        .trim()
        .parse::<u32>()
        .map_err(|err| format!("invalid duration {secs:?}: {err}"))?;
    Ok(HitRate::linear(rate(*start)?, rate(*end)?, duration))
}

#[derive(Debug, Clone, Args)]
pub struct WorkerArgs {
    #[arg(long)]
    pub worker_id: u64,

    /// Descriptor number of the inherited listening socket
    #[arg(long, allow_negative_numbers = true)]
    pub listen_fd: i32,

    #[arg(long, default_value = DEFAULT_PATH)]
    pub path: String,

    #[arg(long, default_value_t = DEFAULT_SHUTDOWN_GRACE_MS)]
    pub shutdown_grace_ms: u64,

    #[arg(long, default_value_t = DEFAULT_MAX_CONNECTIONS)]
    pub max_connections: usize,

    #[arg(long, default_value_t = DEFAULT_MAX_MESSAGE_BYTES)]
    pub max_message_bytes: usize,

    #[arg(long, default_value_t = 0)]
    pub idle_timeout_ms: u64,

    #[arg(long, value_enum, default_value_t = HandlerKind::Observe)]
    pub handler: HandlerKind,
}

impl WorkerArgs {
    pub fn worker_id(&self) -> WorkerId {
        WorkerId::new(self.worker_id)
    }

    pub fn settings(&self) -> WorkerSettings {
        WorkerSettings {
            path: self.path.clone(),
            shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
            max_connections: self.max_connections,
            max_message_bytes: self.max_message_bytes,
            idle_timeout: idle_timeout_from_ms(self.idle_timeout_ms),
            handler: self.handler,
        }
    }
}
