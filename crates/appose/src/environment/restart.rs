//! Worker respawn policy with exponential backoff

use std::time::{Duration, Instant};

/// When and how often an environment respawns a crashed worker
#[derive(Debug, Clone, PartialEq)]
pub struct RestartPolicy {
    /// Respawns allowed within one `window`
    pub max_restarts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    /// A worker that stays up this long resets the restart count
    pub window: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
            window: Duration::from_secs(300),
        }
    }
}

impl RestartPolicy {
    /// Never respawn; the first crash is final
    pub fn never() -> Self {
        Self {
            max_restarts: 0,
            ..Self::default()
        }
    }

    /// Respawn up to `max_restarts` times without waiting
    pub fn immediate(max_restarts: u32) -> Self {
        Self {
            max_restarts,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            ..Self::default()
        }
    }
}

/// Restart bookkeeping for one environment
#[derive(Debug)]
pub(crate) struct Supervisor {
    policy: RestartPolicy,
    restarts: u32,
    backoff: Duration,
    started_at: Option<Instant>,
}

impl Supervisor {
    pub(crate) fn new(policy: RestartPolicy) -> Self {
        let backoff = policy.initial_backoff;
        Self {
            policy,
            restarts: 0,
            backoff,
            started_at: None,
        }
    }

    pub(crate) fn record_start(&mut self) {
        self.started_at = Some(Instant::now());
    }

    /// Register a crash. Returns the delay before the next spawn, or `None`
    /// once the policy is exhausted.
    pub(crate) fn record_crash(&mut self) -> Option<Duration> {
        let stable = self
            .started_at
            .is_some_and(|at| at.elapsed() >= self.policy.window);
        if stable {
            self.restarts = 0;
            self.backoff = self.policy.initial_backoff;
        }
        self.started_at = None;

        if self.restarts >= self.policy.max_restarts {
            return None;
        }
        self.restarts += 1;

        let delay = self.backoff;
        let next = self.backoff.as_secs_f64() * self.policy.multiplier;
        self.backoff = Duration::from_secs_f64(next.min(self.policy.max_backoff.as_secs_f64()));
        Some(delay)
    }

    pub(crate) fn restarts(&self) -> u32 {
        self.restarts
    }
}
