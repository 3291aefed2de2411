use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::metrics_consts::{CIRCUIT_STATE, CIRCUIT_TRANSITIONS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    /// Numeric encoding exported on the state gauge.
    pub fn as_gauge(&self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 1.0,
            CircuitState::Open => 2.0,
        }
    }

    fn as_label(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::HalfOpen => "half_open",
            CircuitState::Open => "open",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in Closed before the circuit opens
    pub failure_threshold: u32,
    /// Consecutive successes in HalfOpen before the circuit closes
    pub success_threshold: u32,
    /// How long an open circuit rejects calls before admitting a probe
    pub open_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout: Duration::from_secs(30),
        }
    }
}

struct Inner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
}

/// Tracks store health and gates all sink calls.
///
/// The breaker is the one piece of state shared by every concurrent write
/// attempt, so its counters and transitions live behind a mutex: two callers
/// racing through record_failure must not lose the transition to Open.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: &str, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.to_owned(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                opened_at: None,
            }),
        }
    }

    /// Whether a sink call may proceed. In Open, this is also where the
    /// elapsed-timeout transition to HalfOpen happens.
    pub fn can_execute(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.config.open_timeout {
                    inner.success_count = 0;
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.opened_at = None;
                    self.transition(&mut inner, CircuitState::Closed);
                }
            }
            CircuitState::Open => {
                // A straggler from before the circuit opened; ignore
            }
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    inner.failure_count = 0;
                    inner.opened_at = Some(Instant::now());
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                // A single failed probe reopens the circuit
                inner.success_count = 0;
                inner.opened_at = Some(Instant::now());
                self.transition(&mut inner, CircuitState::Open);
            }
            CircuitState::Open => {
                // Stragglers don't move the open timestamp
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Poisoning means a panic mid-transition; the process is done for
        self.inner.lock().expect("poisoned circuit breaker mutex")
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState) {
        let from = inner.state;
        inner.state = to;
        metrics::counter!(CIRCUIT_TRANSITIONS, "to" => to.as_label()).increment(1);
        metrics::gauge!(CIRCUIT_STATE).set(to.as_gauge());
        match to {
            CircuitState::Closed => info!(
                "Circuit breaker '{}' transitioning from {:?} to {:?}",
                self.name, from, to
            ),
            _ => warn!(
                "Circuit breaker '{}' transitioning from {:?} to {:?}",
                self.name, from, to
            ),
        }
    }
}
