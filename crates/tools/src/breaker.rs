//! Per-tool circuit breaker.
//!
//! CLOSED passes calls through and records their outcomes in a sliding
//! window. Once the window holds at least `min_calls` outcomes and the error
//! rate exceeds `error_rate_threshold`, the breaker opens. OPEN rejects every
//! call until `cooldown` has elapsed, then admits exactly one probe
//! (HALF_OPEN). A successful probe closes the breaker, a failed one reopens
//! it for another cooldown.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        })
    }
}

/// Tunable thresholds for the breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Number of most recent outcomes considered.
    pub window_size: usize,
    /// Minimum outcomes in the window before the breaker may open.
    pub min_calls: usize,
    /// Error rate (0.0 to 1.0) that must be exceeded to open.
    pub error_rate_threshold: f64,
    pub cooldown_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            window_size: 20,
            min_calls: 5,
            error_rate_threshold: 0.5,
            cooldown_ms: 30_000,
        }
    }
}

impl BreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

/// Decision for one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// The single HALF_OPEN probe; its outcome decides the next state.
    Probe,
    Rejected,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: BreakerState,
    window: VecDeque<bool>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            window: VecDeque::with_capacity(config.window_size),
            config,
            state: BreakerState::Closed,
            opened_at: None,
            probe_in_flight: false,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    /// Decide whether an attempt may reach the driver.
    pub fn try_acquire(&mut self, now: Instant) -> Admission {
        match self.state {
            BreakerState::Closed => Admission::Allowed,
            BreakerState::Open => {
                let cooled = self
                    .opened_at
                    .is_some_and(|at| now.duration_since(at) >= self.config.cooldown());
                if cooled {
                    self.state = BreakerState::HalfOpen;
                    self.probe_in_flight = true;
                    Admission::Probe
                } else {
                    Admission::Rejected
                }
            }
            BreakerState::HalfOpen => {
                if self.probe_in_flight {
                    Admission::Rejected
                } else {
                    self.probe_in_flight = true;
                    Admission::Probe
                }
            }
        }
    }

    /// Give back a probe slot whose outcome will never be recorded: the call
    /// was refused by dispatch or dropped mid-flight. The breaker stays
    /// HALF_OPEN and the next caller becomes the probe.
    pub fn release_probe(&mut self) {
        self.probe_in_flight = false;
    }

    /// Record the outcome of an admitted attempt. Returns the new state when
    /// this outcome caused a transition.
    pub fn record(&mut self, success: bool, now: Instant) -> Option<BreakerState> {
        match self.state {
            BreakerState::HalfOpen => {
                self.probe_in_flight = false;
                if success {
                    self.close();
                    Some(BreakerState::Closed)
                } else {
                    self.open(now);
                    Some(BreakerState::Open)
                }
            }
            BreakerState::Closed => {
                if self.window.len() == self.config.window_size.max(1) {
                    self.window.pop_front();
                }
                self.window.push_back(success);
                if self.window.len() >= self.config.min_calls
                    && self.error_rate() > self.config.error_rate_threshold
                {
                    self.open(now);
                    Some(BreakerState::Open)
                } else {
                    None
                }
            }
            // Late result of an attempt admitted before the breaker opened.
            BreakerState::Open => None,
        }
    }

    fn error_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let failures = self.window.iter().filter(|ok| !**ok).count();
        failures as f64 / self.window.len() as f64
    }

    fn open(&mut self, now: Instant) {
        self.state = BreakerState::Open;
        self.opened_at = Some(now);
        self.window.clear();
    }

    fn close(&mut self) {
        self.state = BreakerState::Closed;
        self.opened_at = None;
        self.window.clear();
    }
}
