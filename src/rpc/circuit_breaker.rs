//! Closed/Open/Half-Open breaker shared by every call the JSON-RPC adapter
//! makes, so a dead Tunnel endpoint is not hammered by the heartbeat task and
//! all channel pipelines at once.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

const DEFAULT_FAILURE_THRESHOLD: usize = 5;
const DEFAULT_COOLDOWN: Duration = Duration::from_secs(30);
const DEFAULT_HALF_OPEN_TRIALS: usize = 1;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Copy, Clone)]
pub struct CircuitBreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: usize,
    pub opened_at: Option<Instant>,
}

#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError {
    #[error("rpc circuit breaker is open")]
    CircuitOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: usize,
    opened_at: Option<Instant>,
    trials_in_flight: usize,
}

impl BreakerInner {
    fn open(&mut self) {
        self.opened_at = Some(Instant::now());
        self.trials_in_flight = 0;
        self.move_to(CircuitState::Open);
    }

    fn move_to(&mut self, next: CircuitState) {
        if self.state == next {
            return;
        }
        tracing::warn!(
            previous = ?self.state,
            next = ?next,
            consecutive_failures = self.consecutive_failures,
            "tunnel rpc circuit breaker state changed"
        );
        self.state = next;
    }

    fn finish_trial(&mut self) {
        if self.state == CircuitState::HalfOpen {
            self.trials_in_flight = self.trials_in_flight.saturating_sub(1);
        }
    }
}

#[derive(Debug, Clone)]
pub struct RpcCircuitBreaker {
    inner: Arc<Mutex<BreakerInner>>,
    failure_threshold: usize,
    cooldown: Duration,
    half_open_trials: usize,
}

impl Default for RpcCircuitBreaker {
    fn default() -> Self {
        Self::new(
            DEFAULT_FAILURE_THRESHOLD,
            DEFAULT_COOLDOWN,
            DEFAULT_HALF_OPEN_TRIALS,
        )
    }
}

impl RpcCircuitBreaker {
    pub fn new(failure_threshold: usize, cooldown: Duration, half_open_trials: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trials_in_flight: 0,
            })),
            failure_threshold: failure_threshold.max(1),
            cooldown: if cooldown.is_zero() {
                Duration::from_secs(1)
            } else {
                cooldown
            },
            half_open_trials: half_open_trials.max(1),
        }
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let inner = self.inner.lock();
        CircuitBreakerSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            opened_at: inner.opened_at,
        }
    }

    /// Admits a call, moving Open to Half-Open once the cooldown has elapsed.
    pub fn before_request(&self) -> Result<CircuitState, CircuitBreakerError> {
        let mut inner = self.inner.lock();

        if inner.state == CircuitState::Open {
            let cooled_down = inner
                .opened_at
                .map(|opened| opened.elapsed() >= self.cooldown)
                .unwrap_or(false);
            if !cooled_down {
                return Err(CircuitBreakerError::CircuitOpen);
            }
            inner.trials_in_flight = 0;
            inner.move_to(CircuitState::HalfOpen);
        }

        if inner.state == CircuitState::HalfOpen {
            if inner.trials_in_flight >= self.half_open_trials {
                return Err(CircuitBreakerError::CircuitOpen);
            }
            inner.trials_in_flight += 1;
        }

        Ok(inner.state)
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.finish_trial();
        inner.consecutive_failures = 0;
        if inner.state == CircuitState::HalfOpen {
            inner.opened_at = None;
            inner.move_to(CircuitState::Closed);
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.finish_trial();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);

        match inner.state {
            CircuitState::HalfOpen => inner.open(),
            CircuitState::Closed if inner.consecutive_failures >= self.failure_threshold => {
                inner.open()
            }
            _ => {}
        }
    }
}
