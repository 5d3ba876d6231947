//! Connection probe: opens WebSocket clients against a running server on a
//! burst or a per-second ramp and summarizes how they went.

mod client;
mod plan;

use std::collections::BTreeMap;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use serde::Serialize;
use thiserror::Error;
use tracing::info;
use tracing::warn;
use url::Url;
use wsfleet_common::mutex_lock_or_recover;

pub use plan::Arrival;
pub use plan::HitRate;
pub use plan::Load;
pub use plan::PlanFile;
pub use plan::SecondBucket;
pub use plan::Step;
pub use plan::buckets;
pub use plan::schedule;

use client::Failure;
use client::Outcome;

use crate::config::duration_ms;

pub const DEFAULT_PROBE_CONNECTIONS: usize = 10;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_IN_FLIGHT: usize = 256;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("invalid probe URL {url:?}: {message}")]
    InvalidUrl { url: String, message: String },

    #[error("could not resolve {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("connection count must be at least 1")]
    NoConnections,

    #[error("invalid load plan: {0}")]
    InvalidPlan(String),

    #[error("failed to load plan {}: {message}", .path.display())]
    PlanFile { path: PathBuf, message: String },
}

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub url: String,
    pub load: Load,
    /// Run in order on every connection after its handshake.
    pub steps: Vec<Step>,
    pub connect_timeout: Duration,
    /// Connections handled at the same time; later arrivals wait for a slot.
    pub max_in_flight: usize,
}

impl ProbeConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            load: Load::Burst {
                connections: DEFAULT_PROBE_CONNECTIONS,
            },
            steps: Vec::new(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
        }
    }

    fn validate(&self) -> Result<(), ProbeError> {
        if self.max_in_flight == 0 {
            return Err(ProbeError::InvalidPlan(
                "maxInFlight must be at least 1".to_string(),
            ));
        }
        self.load.validate()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencySummary {
    pub min_ms: f64,
    pub mean_ms: f64,
    pub p50_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
}

impl LatencySummary {
    /// `None` for an empty sample.
    fn from_samples(samples: &mut [Duration]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        samples.sort_unstable();
        let ms = |d: Duration| d.as_micros() as f64 / 1000.0;
        let total: f64 = samples.iter().copied().map(ms).sum();
        Some(Self {
            min_ms: ms(samples[0]),
            mean_ms: total / samples.len() as f64,
            p50_ms: ms(percentile(samples, 50)),
            p99_ms: ms(percentile(samples, 99)),
            max_ms: ms(samples[samples.len() - 1]),
        })
    }
}

/// Nearest-rank percentile over sorted, non-empty samples.
fn percentile(sorted: &[Duration], pct: usize) -> Duration {
    let rank = (pct * sorted.len()).div_ceil(100).max(1);
    sorted[rank.min(sorted.len()) - 1]
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RampReport {
    #[serde(flatten)]
    pub rate: HitRate,
    pub planned: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeReport {
    pub url: String,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub messages_sent: usize,
    /// Replies received for messages that waited for one.
    pub replies: usize,
    pub elapsed_ms: u64,
    pub latency: Option<LatencySummary>,
    pub errors: BTreeMap<String, usize>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ramps: Vec<RampReport>,
}

impl ProbeReport {
    pub fn all_succeeded(&self) -> bool {
        self.attempted > 0 && self.succeeded == self.attempted
    }

    fn record(&mut self, result: &Result<Outcome, Failure>, ramp: Option<usize>) {
        let ramp = ramp.and_then(|index| self.ramps.get_mut(index));
        match result {
            Ok(outcome) => {
                self.succeeded += 1;
                self.messages_sent += outcome.sent;
                self.replies += outcome.replies;
                if let Some(ramp) = ramp {
                    ramp.succeeded += 1;
                }
            }
            Err(failure) => {
                if failure.timed_out {
                    self.timed_out += 1;
                } else {
                    self.failed += 1;
                }
                if let Some(ramp) = ramp {
                    if failure.timed_out {
                        ramp.timed_out += 1;
                    } else {
                        ramp.failed += 1;
                    }
                }
                *self.errors.entry(failure.kind.to_string()).or_default() += 1;
            }
        }
    }
}

pub fn run_probe(config: &ProbeConfig) -> Result<ProbeReport, ProbeError> {
    config.validate()?;
    let url = parse_ws_url(&config.url)?;
    let addr = resolve(&url)?;
    let arrivals = config.load.arrivals();
    let pool_size = config.max_in_flight.min(arrivals.len());
    info!(
        url = %url,
        %addr,
        connections = arrivals.len(),
        max_in_flight = pool_size,
        "Probing"
    );

    let results: Vec<Option<Result<Outcome, Failure>>> = arrivals.iter().map(|_| None).collect();
    let results = Mutex::new(results);
    let next = AtomicUsize::new(0);
    let started = Instant::now();

    let spawned = thread::scope(|scope| {
        let mut pool = Vec::with_capacity(pool_size);
        for slot in 0..pool_size {
            let handle = thread::Builder::new()
                .name(format!("probe-{slot}"))
                .spawn_scoped(scope, || {
                    drive_arrivals(&arrivals, &next, &results, started, |_| {
                        client::run_connection(&url, addr, config.connect_timeout, &config.steps)
                    });
                });
            match handle {
                Ok(handle) => pool.push(handle),
                Err(err) => {
                    warn!(error = %err, started = pool.len(), "Could not start more probe threads");
                    break;
                }
            }
        }
        let spawned = pool.len();
        for handle in pool {
            if handle.join().is_err() {
                warn!("Probe thread panicked; its unfinished connections count as failures");
            }
        }
        spawned
    });

    let mut report = ProbeReport {
        url: url.to_string(),
        attempted: arrivals.len(),
        elapsed_ms: duration_ms(started.elapsed()),
        ramps: ramp_reports(&config.load),
        ..ProbeReport::default()
    };
    let unrun = if spawned == 0 { "spawn" } else { "panic" };
    let mut latencies = Vec::with_capacity(arrivals.len());
    let results = results.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner());
    for (arrival, result) in arrivals.iter().zip(results) {
        let result = result.unwrap_or_else(|| Err(Failure::new(unrun)));
        if let Ok(outcome) = &result {
            latencies.push(outcome.connect_latency);
        }
        report.record(&result, arrival.ramp);
    }
    report.latency = LatencySummary::from_samples(&mut latencies);
    info!(
        succeeded = report.succeeded,
        failed = report.failed,
        timed_out = report.timed_out,
        elapsed_ms = report.elapsed_ms,
        "Probe finished"
    );
    Ok(report)
}

/// Claims arrivals in schedule order, waits for each one's start time and
/// stores what `connect` returned in its slot.
fn drive_arrivals<T>(
    arrivals: &[Arrival],
    next: &AtomicUsize,
    results: &Mutex<Vec<Option<T>>>,
    started: Instant,
    connect: impl Fn(&Arrival) -> T,
) {
    loop {
        let index = next.fetch_add(1, Ordering::Relaxed);
        let Some(arrival) = arrivals.get(index) else {
            return;
        };
        let due = started + arrival.at;
        let now = Instant::now();
        if due > now {
            thread::sleep(due - now);
        }
        let result = connect(arrival);
        mutex_lock_or_recover(results)[index] = Some(result);
    }
}

fn ramp_reports(load: &Load) -> Vec<RampReport> {
    let Load::Ramps(rates) = load else {
        return Vec::new();
    };
    let mut reports: Vec<RampReport> = rates
        .iter()
        .map(|rate| RampReport {
            rate: rate.clone(),
            planned: 0,
            succeeded: 0,
            failed: 0,
            timed_out: 0,
        })
        .collect();
    for bucket in buckets(rates) {
        if let Some(report) = reports.get_mut(bucket.ramp) {
            report.planned += bucket.count;
        }
    }
    reports
}

fn parse_ws_url(raw: &str) -> Result<Url, ProbeError> {
    let invalid = |message: &str| ProbeError::InvalidUrl {
        url: raw.to_string(),
        message: message.to_string(),
    };
    let url = Url::parse(raw).map_err(|err| invalid(&err.to_string()))?;
    match url.scheme() {
        "ws" => {}
        "wss" => return Err(invalid("TLS (wss://) is not supported")),
        _ => return Err(invalid("scheme must be ws://")),
    }
    if url.host_str().is_none() {
        return Err(invalid("missing host"));
    }
    Ok(url)
}

fn resolve(url: &Url) -> Result<SocketAddr, ProbeError> {
    let host = url.host_str().unwrap_or_default().to_string();
    let addrs = url
        .socket_addrs(|| Some(80))
        .map_err(|source| ProbeError::Resolve {
            host: host.clone(),
            source,
        })?;
    addrs.into_iter().next().ok_or_else(|| ProbeError::Resolve {
        host,
        source: io::Error::new(io::ErrorKind::NotFound, "no addresses"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn millis(values: &[u64]) -> Vec<Duration> {
        values.iter().copied().map(Duration::from_millis).collect()
    }

    fn refused_url() -> String {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        format!("ws://127.0.0.1:{port}/")
    }

    #[test]
    fn latency_summary_uses_nearest_rank() {
        let mut samples = millis(&[40, 10, 30, 20]);
        let summary = LatencySummary::from_samples(&mut samples).unwrap();
        assert_eq!(summary.min_ms, 10.0);
        assert_eq!(summary.max_ms, 40.0);
        assert_eq!(summary.mean_ms, 25.0);
        assert_eq!(summary.p50_ms, 20.0);
        assert_eq!(summary.p99_ms, 40.0);
    }

    #[test]
    fn latency_summary_of_nothing_is_none() {
        assert_eq!(LatencySummary::from_samples(&mut []), None);
    }

    #[test]
    fn percentile_of_single_sample() {
        let samples = millis(&[7]);
        assert_eq!(percentile(&samples, 1), Duration::from_millis(7));
        assert_eq!(percentile(&samples, 99), Duration::from_millis(7));
    }

    #[test]
    fn only_plain_ws_urls_are_accepted() {
        assert!(parse_ws_url("ws://127.0.0.1:8080/chat").is_ok());
        for bad in ["wss://example.com/", "http://127.0.0.1/", "not a url"] {
            assert!(
                matches!(parse_ws_url(bad), Err(ProbeError::InvalidUrl { .. })),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn zero_connections_is_an_error() {
        let mut config = ProbeConfig::new("ws://127.0.0.1:9/");
        config.load = Load::Burst { connections: 0 };
        assert!(matches!(run_probe(&config), Err(ProbeError::NoConnections)));
    }

    #[test]
    fn zero_in_flight_is_an_error() {
        let mut config = ProbeConfig::new("ws://127.0.0.1:9/");
        config.max_in_flight = 0;
        assert!(matches!(run_probe(&config), Err(ProbeError::InvalidPlan(_))));
    }

    #[test]
    fn refused_connections_are_counted_as_failures() {
        let mut config = ProbeConfig::new(refused_url());
        config.load = Load::Burst { connections: 3 };
        config.connect_timeout = Duration::from_secs(1);

        let report = run_probe(&config).unwrap();
        assert_eq!(report.attempted, 3);
        assert_eq!(report.succeeded, 0);
        assert_eq!(report.failed + report.timed_out, 3);
        assert_eq!(report.latency, None);
        assert!(!report.all_succeeded());
        assert_eq!(report.errors.values().sum::<usize>(), 3);
        assert!(report.ramps.is_empty());
    }

    #[test]
    fn more_connections_than_slots_are_all_attempted() {
        let mut config = ProbeConfig::new(refused_url());
        config.load = Load::Burst { connections: 40 };
        config.max_in_flight = 3;
        config.connect_timeout = Duration::from_secs(1);

        let report = run_probe(&config).unwrap();
        assert_eq!(report.attempted, 40);
        assert_eq!(report.failed + report.timed_out, 40);
        assert!(!report.errors.contains_key("spawn"));
        assert!(!report.errors.contains_key("panic"));
    }

    #[test]
    fn ramp_failures_are_attributed_to_their_ramp() {
        let mut config = ProbeConfig::new(refused_url());
        config.load = Load::Ramps(vec![
            HitRate::linear(4.0, 4.0, 1),
            HitRate::linear(2.0, 2.0, 1),
        ]);
        config.connect_timeout = Duration::from_secs(1);

        let report = run_probe(&config).unwrap();
        assert_eq!(report.attempted, 6);
        assert_eq!(report.ramps.len(), 2);
        assert_eq!(report.ramps[0].planned, 4);
        assert_eq!(report.ramps[1].planned, 2);
        let failed: Vec<usize> = report
            .ramps
            .iter()
            .map(|ramp| ramp.failed + ramp.timed_out)
            .collect();
        assert_eq!(failed, vec![4, 2]);
        // The second ramp starts one second in.
        assert!(report.elapsed_ms >= 1_000, "{report:?}");
    }

    #[test]
    fn arrivals_wait_for_their_start_time_and_fill_every_slot() {
        let arrivals = schedule(&[SecondBucket { ramp: 0, count: 4 }]);
        let results = Mutex::new(vec![None; arrivals.len()]);
        let next = AtomicUsize::new(0);
        let started = Instant::now();

        thread::scope(|scope| {
            for _ in 0..2 {
                scope.spawn(|| {
                    drive_arrivals(&arrivals, &next, &results, started, |arrival| {
                        (arrival.at, started.elapsed())
                    });
                });
            }
        });

        let results = results.into_inner().unwrap();
        for slot in results {
            let (due, ran_at) = slot.unwrap();
            assert!(ran_at >= due, "ran at {ran_at:?}, due {due:?}");
        }
    }
}
