//! Per-solver circuit breaker.
//!
//! Tracks solver health across three states:
//! - Closed: normal operation, attempts proceed
//! - Open: too many consecutive failures, attempts are rejected
//! - `HalfOpen`: one trial after the open period; success closes the
//!   circuit, failure re-opens it

use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    HalfOpen,
    Open,
}

#[derive(Debug, Clone)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    total_attempts: u64,
    total_successes: u64,
}

/// Failure-burst detector for one solver.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    timeout_period: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(failure_threshold: u32, timeout_period: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            timeout_period,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                total_attempts: 0,
                total_successes: 0,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether an attempt may proceed. An OPEN circuit whose timeout has
    /// elapsed transitions to `HalfOpen` and admits one trial.
    pub fn should_attempt(&self, solver: &str) -> bool {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                if let Some(opened) = inner.opened_at {
                    if opened.elapsed() >= self.timeout_period {
                        inner.state = CircuitState::HalfOpen;
                        info!(
                            "Circuit breaker HALF-OPEN for solver {solver} (after {:?})",
                            opened.elapsed()
                        );
                        return true;
                    }
                }
                false
            }
        }
    }

    /// Record a successful attempt; closes the circuit from `HalfOpen`.
    pub fn record_success(&self, solver: &str) {
        let mut inner = self.lock();
        inner.consecutive_failures = 0;
        inner.total_attempts += 1;
        inner.total_successes += 1;
        if inner.state != CircuitState::Closed {
            inner.state = CircuitState::Closed;
            inner.opened_at = None;
            info!("Circuit breaker CLOSED for solver {solver}");
        }
    }

    /// Record a failed attempt; opens the circuit at the threshold, and a
    /// `HalfOpen` trial failure re-opens immediately.
    pub fn record_failure(&self, solver: &str, error: &str) {
        let mut inner = self.lock();
        inner.consecutive_failures += 1;
        inner.total_attempts += 1;

        let should_open = inner.state == CircuitState::HalfOpen
            || inner.consecutive_failures >= self.failure_threshold;
        if should_open && inner.state != CircuitState::Open {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            warn!(
                "Circuit breaker OPEN for solver {solver} after {} consecutive failures. Last error: {error}",
                inner.consecutive_failures
            );
        } else if inner.state != CircuitState::Open {
            debug!(
                "Circuit breaker failure for solver {solver} ({}/{}): {error}",
                inner.consecutive_failures, self.failure_threshold
            );
        }
    }

    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    /// Attempt/success counters, for descriptor reporting.
    #[must_use]
    pub fn totals(&self) -> (u64, u64) {
        let inner = self.lock();
        (inner.total_attempts, inner.total_successes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_circuit_admits_attempts() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        assert!(breaker.should_attempt("solver"));
        breaker.record_success("solver");
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.consecutive_failures(), 0);
    }

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        breaker.record_failure("solver", "boom");
        breaker.record_failure("solver", "boom");
        assert!(breaker.should_attempt("solver"));
        breaker.record_failure("solver", "boom");

        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.should_attempt("solver"));
    }

    #[test]
    fn success_resets_failure_streak() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        breaker.record_failure("solver", "boom");
        breaker.record_failure("solver", "boom");
        breaker.record_success("solver");
        breaker.record_failure("solver", "boom");
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_after_timeout_then_closes_on_success() {
        let breaker = CircuitBreaker::new(2, Duration::from_millis(50));
        breaker.record_failure("solver", "boom");
        breaker.record_failure("solver", "boom");
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.should_attempt("solver"));

        std::thread::sleep(Duration::from_millis(80));
        assert!(breaker.should_attempt("solver"));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_success("solver");
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_failure_reopens_immediately() {
        let breaker = CircuitBreaker::new(2, Duration::from_millis(50));
        breaker.record_failure("solver", "boom");
        breaker.record_failure("solver", "boom");
        std::thread::sleep(Duration::from_millis(80));
        assert!(breaker.should_attempt("solver"));

        breaker.record_failure("solver", "boom again");
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.should_attempt("solver"));
    }
}
