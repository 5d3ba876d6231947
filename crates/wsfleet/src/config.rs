//! Fleet configuration.
//!
//! Layers, lowest precedence first: built-in defaults, an optional JSON file,
//! `WSFLEET_*` environment variables, then command-line flags (applied by the
//! caller).

use std::env;
use std::fs;
use std::num::NonZeroUsize;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use wsfleet_common::non_empty;
use wsfleet_common::parse_env_u64;
use wsfleet_common::parse_env_usize;

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_PATH: &str = "/";
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 5_000;
pub const DEFAULT_MAX_CONNECTIONS: usize = 10_000;
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 16 * 1024 * 1024;
/// Connection permits are a tokio semaphore, which caps its permit count.
pub const MAX_CONNECTIONS_LIMIT: usize = tokio::sync::Semaphore::MAX_PERMITS;
const DEFAULT_INITIAL_BACKOFF_MS: u64 = 100;
const DEFAULT_MAX_BACKOFF_MS: u64 = 10_000;
const DEFAULT_MAX_FAILURES: usize = 10;
const DEFAULT_FAILURE_WINDOW_MS: u64 = 60_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid {field}: {message}")]
    Invalid {
        field: &'static str,
        message: String,
    },
}

/// Which message handler workers install on every connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum HandlerKind {
    /// Count and trace messages without replying.
    #[default]
    Observe,
    /// Reply with every received payload.
    Echo,
}

impl HandlerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            HandlerKind::Observe => "observe",
            HandlerKind::Echo => "echo",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "observe" => Some(HandlerKind::Observe),
            "echo" => Some(HandlerKind::Echo),
            _ => None,
        }
    }
}

/// Respawn throttling: exponential backoff and a crash-loop breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// More failures than this inside `failure_window` stops respawning.
    pub max_failures: usize,
    pub failure_window: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(DEFAULT_INITIAL_BACKOFF_MS),
            max_backoff: Duration::from_millis(DEFAULT_MAX_BACKOFF_MS),
            max_failures: DEFAULT_MAX_FAILURES,
            failure_window: Duration::from_millis(DEFAULT_FAILURE_WINDOW_MS),
        }
    }
}

/// Settings a worker process needs; forwarded on its command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    pub path: String,
    pub shutdown_grace: Duration,
    pub max_connections: usize,
    pub max_message_bytes: usize,
    pub idle_timeout: Option<Duration>,
    pub handler: HandlerKind,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            path: DEFAULT_PATH.to_string(),
            shutdown_grace: Duration::from_millis(DEFAULT_SHUTDOWN_GRACE_MS),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            idle_timeout: None,
            handler: HandlerKind::default(),
        }
    }
}

impl WorkerSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.path.starts_with('/') {
            return Err(invalid("path", format!("{:?} must start with '/'", self.path)));
        }
        if self.shutdown_grace.is_zero() {
            return Err(invalid("shutdownGraceMs", "must be greater than 0"));
        }
        if !(1..=MAX_CONNECTIONS_LIMIT).contains(&self.max_connections) {
            return Err(invalid(
                "maxConnections",
                format!("must be between 1 and {MAX_CONNECTIONS_LIMIT}"),
            ));
        }
        if self.max_message_bytes == 0 {
            return Err(invalid("maxMessageBytes", "must be at least 1"));
        }
        Ok(())
    }

    /// Arguments for the hidden `worker` subcommand reproducing these settings.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "--path".to_string(),
            self.path.clone(),
            "--shutdown-grace-ms".to_string(),
            duration_ms(self.shutdown_grace).to_string(),
            "--max-connections".to_string(),
            self.max_connections.to_string(),
            "--max-message-bytes".to_string(),
            self.max_message_bytes.to_string(),
            "--handler".to_string(),
            self.handler.as_str().to_string(),
        ];
        if let Some(idle) = self.idle_timeout {
            args.push("--idle-timeout-ms".to_string());
            args.push(duration_ms(idle).to_string());
        }
        args
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FleetConfig {
    pub host: String,
    pub port: u16,
    pub workers: usize,
    pub shutdown_grace: Duration,
    pub path: String,
    pub max_connections: usize,
    pub max_message_bytes: usize,
    pub idle_timeout: Option<Duration>,
    pub handler: HandlerKind,
    pub restart: RestartPolicy,
}

impl Default for FleetConfig {
    fn default() -> Self {
        let worker = WorkerSettings::default();
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            workers: default_worker_count(),
            shutdown_grace: worker.shutdown_grace,
            path: worker.path,
            max_connections: worker.max_connections,
            max_message_bytes: worker.max_message_bytes,
            idle_timeout: worker.idle_timeout,
            handler: worker.handler,
            restart: RestartPolicy::default(),
        }
    }
}

impl FleetConfig {
    /// Defaults, then `file` if given, then the environment.
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(path) = file {
            config.apply_file(FileConfig::read(path)?);
        }
        config.apply_env();
        Ok(config)
    }

    pub fn listen_addr(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            path: self.path.clone(),
            shutdown_grace: self.shutdown_grace,
            max_connections: self.max_connections,
            max_message_bytes: self.max_message_bytes,
            idle_timeout: self.idle_timeout,
            handler: self.handler,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(invalid("workers", "must be at least 1"));
        }
        self.worker_settings().validate()?;
        if self.restart.max_backoff < self.restart.initial_backoff {
            return Err(invalid(
                "restart.maxBackoffMs",
                "must not be smaller than restart.initialBackoffMs",
            ));
        }
        Ok(())
    }

    fn apply_file(&mut self, file: FileConfig) {
        if let Some(host) = file.host.and_then(non_empty) {
            self.host = host;
        }
        if let Some(port) = file.port {
            self.port = port;
        }
        if let Some(workers) = file.workers {
            self.workers = workers;
        }
        if let Some(ms) = file.shutdown_grace_ms {
            self.shutdown_grace = Duration::from_millis(ms);
        }
        if let Some(path) = file.path {
            self.path = path;
        }
        if let Some(max) = file.max_connections {
            self.max_connections = max;
        }
        if let Some(max) = file.max_message_bytes {
            self.max_message_bytes = max;
        }
        if let Some(ms) = file.idle_timeout_ms {
            self.idle_timeout = idle_timeout_from_ms(ms);
        }
        if let Some(handler) = file.handler {
            self.handler = handler;
        }
        if let Some(restart) = file.restart {
            if let Some(ms) = restart.initial_backoff_ms {
                self.restart.initial_backoff = Duration::from_millis(ms);
            }
            if let Some(ms) = restart.max_backoff_ms {
                self.restart.max_backoff = Duration::from_millis(ms);
            }
            if let Some(max) = restart.max_failures {
                self.restart.max_failures = max;
            }
            if let Some(ms) = restart.failure_window_ms {
                self.restart.failure_window = Duration::from_millis(ms);
            }
        }
    }

    fn apply_env(&mut self) {
        if let Some(host) = env::var("WSFLEET_HOST").ok().and_then(non_empty) {
            self.host = host;
        }
        if let Some(port) = parse_env_u64("WSFLEET_PORT") {
            match u16::try_from(port) {
                Ok(port) => self.port = port,
                Err(_) => tracing::warn!(port, "WSFLEET_PORT out of range; ignoring"),
            }
        }
        if let Some(workers) = parse_env_usize("WSFLEET_WORKERS") {
            self.workers = workers;
        }
        if let Some(ms) = parse_env_u64("WSFLEET_SHUTDOWN_GRACE_MS") {
            self.shutdown_grace = Duration::from_millis(ms);
        }
        if let Some(path) = env::var("WSFLEET_PATH").ok().and_then(non_empty) {
            self.path = path;
        }
        if let Some(max) = parse_env_usize("WSFLEET_MAX_CONNECTIONS") {
            self.max_connections = max;
        }
        if let Some(max) = parse_env_usize("WSFLEET_MAX_MESSAGE_BYTES") {
            self.max_message_bytes = max;
        }
        if let Some(ms) = parse_env_u64("WSFLEET_IDLE_TIMEOUT_MS") {
            self.idle_timeout = idle_timeout_from_ms(ms);
        }
        if let Some(value) = env::var("WSFLEET_HANDLER").ok().and_then(non_empty) {
            match HandlerKind::parse(&value) {
                Some(handler) => self.handler = handler,
                None => tracing::warn!(value = %value, "Unknown WSFLEET_HANDLER; ignoring"),
            }
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileConfig {
    host: Option<String>,
    port: Option<u16>,
    workers: Option<usize>,
    shutdown_grace_ms: Option<u64>,
    path: Option<String>,
    max_connections: Option<usize>,
    max_message_bytes: Option<usize>,
    idle_timeout_ms: Option<u64>,
    handler: Option<HandlerKind>,
    restart: Option<RestartFileConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RestartFileConfig {
    initial_backoff_ms: Option<u64>,
    max_backoff_ms: Option<u64>,
    max_failures: Option<usize>,
    failure_window_ms: Option<u64>,
}

impl FileConfig {
    fn read(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

pub fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

pub(crate) fn idle_timeout_from_ms(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

pub(crate) fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn invalid(field: &'static str, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::EnvGuard;
    use crate::test_support::env_lock;
    use std::io::Write;

    const ENV_KEYS: &[&str] = &[
        "WSFLEET_HOST",
        "WSFLEET_PORT",
        "WSFLEET_WORKERS",
        "WSFLEET_SHUTDOWN_GRACE_MS",
        "WSFLEET_PATH",
        "WSFLEET_MAX_CONNECTIONS",
        "WSFLEET_MAX_MESSAGE_BYTES",
        "WSFLEET_IDLE_TIMEOUT_MS",
        "WSFLEET_HANDLER",
    ];

    fn clear_env() -> Vec<EnvGuard> {
        ENV_KEYS.iter().map(|key| EnvGuard::remove(key)).collect()
    }

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn defaults_without_file_or_env() {
        let _lock = env_lock();
        let _env = clear_env();
        let config = FleetConfig::load(None).unwrap();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.workers, default_worker_count());
        assert_eq!(config.shutdown_grace, Duration::from_millis(5_000));
        assert_eq!(config.path, "/");
        assert_eq!(config.idle_timeout, None);
        assert_eq!(config.handler, HandlerKind::Observe);
        config.validate().unwrap();
    }

    #[test]
    fn file_values_override_defaults() {
        let _lock = env_lock();
        let _env = clear_env();
        let file = write_config(
            r#"{
                "port": 9001,
                "workers": 3,
                "shutdownGraceMs": 250,
                "path": "/ws",
                "idleTimeoutMs": 1500,
                "handler": "echo",
                "restart": {"maxFailures": 2, "failureWindowMs": 1000},
                "duration": 30
            }"#,
        );
        let config = FleetConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.port, 9001);
        assert_eq!(config.workers, 3);
        assert_eq!(config.shutdown_grace, Duration::from_millis(250));
        assert_eq!(config.path, "/ws");
        assert_eq!(config.idle_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(config.handler, HandlerKind::Echo);
        assert_eq!(config.restart.max_failures, 2);
        assert_eq!(config.restart.failure_window, Duration::from_secs(1));
        assert_eq!(config.restart.initial_backoff, RestartPolicy::default().initial_backoff);
    }

    #[test]
    fn env_overrides_file_and_ignores_garbage() {
        let _lock = env_lock();
        let _env = clear_env();
        let file = write_config(r#"{"port": 9001, "workers": 3}"#);
        let _port = EnvGuard::set("WSFLEET_PORT", "9100");
        let _workers = EnvGuard::set("WSFLEET_WORKERS", "many");
        let _handler = EnvGuard::set("WSFLEET_HANDLER", "shout");
        let _idle = EnvGuard::set("WSFLEET_IDLE_TIMEOUT_MS", "0");

        let config = FleetConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.port, 9100);
        assert_eq!(config.workers, 3);
        assert_eq!(config.handler, HandlerKind::Observe);
        assert_eq!(config.idle_timeout, None);
    }

    #[test]
    fn out_of_range_port_is_ignored() {
        let _lock = env_lock();
        let _env = clear_env();
        let _port = EnvGuard::set("WSFLEET_PORT", "70000");
        assert_eq!(FleetConfig::load(None).unwrap().port, DEFAULT_PORT);
    }

    #[test]
    fn missing_and_malformed_files_are_errors() {
        let _lock = env_lock();
        let err = FleetConfig::load(Some(Path::new("/nonexistent/wsfleet.json"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));

        let file = write_config("{ not json");
        let err = FleetConfig::load(Some(file.path())).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn validate_rejects_unusable_values() {
        let config = FleetConfig {
            workers: 0,
            ..FleetConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "workers", .. })
        ));

        let config = FleetConfig {
            path: "ws".to_string(),
            ..FleetConfig::default()
        };
        assert!(config.validate().is_err());

        let config = FleetConfig {
            shutdown_grace: Duration::ZERO,
            ..FleetConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn connection_limit_must_fit_the_permit_semaphore() {
        let at_limit = FleetConfig {
            max_connections: MAX_CONNECTIONS_LIMIT,
            ..FleetConfig::default()
        };
        at_limit.validate().unwrap();

        let over = FleetConfig {
            max_connections: usize::MAX,
            ..FleetConfig::default()
        };
        assert!(matches!(
            over.validate(),
            Err(ConfigError::Invalid { field: "maxConnections", .. })
        ));
    }

    #[test]
    fn zero_message_limit_is_rejected() {
        let config = FleetConfig {
            max_message_bytes: 0,
            ..FleetConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "maxMessageBytes", .. })
        ));
        let settings = WorkerSettings {
            max_message_bytes: 0,
            ..WorkerSettings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn listen_addr_brackets_ipv6_hosts() {
        let config = FleetConfig {
            host: "::1".to_string(),
            port: 9000,
            ..FleetConfig::default()
        };
        assert_eq!(config.listen_addr(), "[::1]:9000");
    }

    #[test]
    fn worker_args_carry_optional_idle_timeout() {
        let mut settings = WorkerSettings::default();
        assert!(!settings.to_args().contains(&"--idle-timeout-ms".to_string()));
        settings.idle_timeout = Some(Duration::from_secs(2));
        let args = settings.to_args();
        let idx = args.iter().position(|a| a == "--idle-timeout-ms").unwrap();
        assert_eq!(args[idx + 1], "2000");
    }
}
