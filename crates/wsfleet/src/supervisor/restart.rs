//! Respawn throttling: exponential backoff with jitter and a crash-loop
//! circuit breaker over a sliding failure window.

use std::collections::VecDeque;
use std::time::Duration;
use std::time::Instant;

use rand::Rng;

use crate::config::RestartPolicy;

const MAX_BACKOFF_DOUBLINGS: u32 = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartDecision {
    Respawn { delay: Duration },
    /// Too many failures inside the window; stop respawning.
    GiveUp { failures: usize },
}

#[derive(Debug)]
pub struct RestartTracker {
    policy: RestartPolicy,
    failures: VecDeque<Instant>,
}

impl RestartTracker {
    pub fn new(policy: RestartPolicy) -> Self {
        Self {
            policy,
            failures: VecDeque::new(),
        }
    }

    pub fn policy(&self) -> &RestartPolicy {
        &self.policy
    }

    pub fn record_failure(&mut self, now: Instant) -> RestartDecision {
        self.prune(now);
        self.failures.push_back(now);
        let failures = self.failures.len();
        if failures > self.policy.max_failures {
            return RestartDecision::GiveUp { failures };
        }
        let base = self.base_delay(failures);
        RestartDecision::Respawn {
            delay: base + jitter(base),
        }
    }

    pub fn recent_failures(&mut self, now: Instant) -> usize {
        self.prune(now);
        self.failures.len()
    }

    /// `initial * 2^(failures - 1)`, capped at the policy maximum.
    fn base_delay(&self, failures: usize) -> Duration {
        let doublings = u32::try_from(failures.saturating_sub(1))
            .unwrap_or(u32::MAX)
            .min(MAX_BACKOFF_DOUBLINGS);
        self.policy
            .initial_backoff
            .saturating_mul(1u32 << doublings)
            .min(self.policy.max_backoff)
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.failures.front() {
            if now.saturating_duration_since(oldest) < self.policy.failure_window {
                break;
            }
            self.failures.pop_front();
        }
    }
}

/// Up to a quarter of `base`, so simultaneous crashes do not respawn in lockstep.
fn jitter(base: Duration) -> Duration {
    let max_ms = u64::try_from(base.as_millis() / 4).unwrap_or(u64::MAX);
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::rng().random_range(0..=max_ms))
}
