//! Load shape of a probe run: when connections open and what each one does.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use super::ProbeError;

/// A linear ramp of connection openings per second.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HitRate {
    /// Rate the ramp starts from. Absent means "where the previous ramp
    /// ended", or 0 for the first one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<f64>,
    pub end: f64,
    /// Length of the ramp in seconds.
    pub duration: u32,
}

impl HitRate {
    pub fn linear(start: f64, end: f64, duration: u32) -> Self {
        Self {
            start: Some(start),
            end,
            duration,
        }
    }

    fn validate(&self, index: usize) -> Result<(), ProbeError> {
        let rates_ok = [self.start.unwrap_or(0.0), self.end]
            .iter()
            .all(|rate| rate.is_finite() && *rate >= 0.0);
        if !rates_ok {
            return Err(ProbeError::InvalidPlan(format!(
                "ramp {index}: rates must be finite and non-negative"
            )));
        }
        if self.duration == 0 {
            return Err(ProbeError::InvalidPlan(format!(
                "ramp {index}: duration must be at least 1 second"
            )));
        }
        Ok(())
    }
}

/// One action a connection performs after its handshake, in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Step {
    /// Sends `send` as a text frame: strings verbatim, anything else as JSON.
    Message {
        send: serde_json::Value,
        #[serde(default, rename = "awaitReply")]
        await_reply: bool,
    },
    Sleep {
        #[serde(rename = "durationMs")]
        duration_ms: u64,
    },
    /// Closes the connection and skips the remaining steps.
    Disconnect,
}

impl Step {
    pub fn text(&self) -> Option<String> {
        match self {
            Step::Message {
                send: serde_json::Value::String(text),
                ..
            } => Some(text.clone()),
            Step::Message { send, .. } => Some(send.to_string()),
            Step::Sleep { .. } | Step::Disconnect => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Load {
    /// Every connection opens at once.
    Burst { connections: usize },
    /// Connections open on consecutive per-second ramps.
    Ramps(Vec<HitRate>),
}

impl Load {
    pub fn validate(&self) -> Result<(), ProbeError> {
        match self {
            Load::Burst { connections: 0 } => Err(ProbeError::NoConnections),
            Load::Burst { .. } => Ok(()),
            Load::Ramps(rates) => {
                if rates.is_empty() {
                    return Err(ProbeError::InvalidPlan("no ramps given".to_string()));
                }
                rates
                    .iter()
                    .enumerate()
                    .try_for_each(|(index, rate)| rate.validate(index))?;
                if buckets(rates).iter().all(|bucket| bucket.count == 0) {
                    return Err(ProbeError::NoConnections);
                }
                Ok(())
            }
        }
    }

    /// When each connection opens, relative to the start of the run, sorted.
    pub fn arrivals(&self) -> Vec<Arrival> {
        match self {
            Load::Burst { connections } => vec![
                Arrival {
                    at: Duration::ZERO,
                    ramp: None,
                };
                *connections
            ],
            Load::Ramps(rates) => schedule(&buckets(rates)),
        }
    }
}

/// Connections to open during one second of a ramp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecondBucket {
    pub ramp: usize,
    pub count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arrival {
    pub at: Duration,
    pub ramp: Option<usize>,
}

/// Splits ramps into per-second buckets. The rate climbs by
/// `(end - current) / duration` every second and each second opens the
/// rounded current rate.
pub fn buckets(rates: &[HitRate]) -> Vec<SecondBucket> {
    let total: usize = rates.iter().map(|rate| rate.duration as usize).sum();
    let mut buckets = Vec::with_capacity(total);
    let mut current = 0.0_f64;
    for (ramp, rate) in rates.iter().enumerate() {
        if let Some(start) = rate.start {
            current = start;
        }
        if rate.duration == 0 {
            continue;
        }
        let step = (rate.end - current) / f64::from(rate.duration);
        for _ in 0..rate.duration {
            current += step;
            buckets.push(SecondBucket {
                ramp,
                count: current.round().max(0.0) as usize,
            });
        }
    }
    buckets
}

/// Spreads every bucket's connections evenly across its second.
pub fn schedule(buckets: &[SecondBucket]) -> Vec<Arrival> {
    let mut arrivals = Vec::with_capacity(buckets.iter().map(|bucket| bucket.count).sum());
    for (second, bucket) in buckets.iter().enumerate() {
        let base = Duration::from_secs(second as u64);
        let count = bucket.count as u64;
        for i in 0..count {
            arrivals.push(Arrival {
                at: base + Duration::from_nanos(1_000_000_000 * i / count),
                ramp: Some(bucket.ramp),
            });
        }
    }
    arrivals
}

/// A JSON load plan. Every field is optional so command-line flags can fill
/// the gaps.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanFile {
    pub url: Option<String>,
    pub connect_timeout_ms: Option<u64>,
    pub max_in_flight: Option<usize>,
    #[serde(default)]
    pub rates: Vec<HitRate>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl PlanFile {
    pub fn read(path: &Path) -> Result<Self, ProbeError> {
        let plan_error = |message: String| ProbeError::PlanFile {
            path: path.to_path_buf(),
            message,
        };
        let raw = fs::read_to_string(path).map_err(|err| plan_error(err.to_string()))?;
        serde_json::from_str(&raw).map_err(|err| plan_error(err.to_string()))
    }
}
