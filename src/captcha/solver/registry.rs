//! Solver registry and performance tracking.
//!
//! Each registered solver carries a descriptor: the challenge systems it
//! supports, a static priority, an enabled flag, rolling performance numbers
//! (EMA response time, EMA success rate), a concurrency gate, and its
//! circuit breaker. Candidate ranking is `(priority DESC, success rate DESC,
//! response time ASC)`.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::Page;
use dashmap::DashMap;

use crate::config::CaptchaConfig;
use crate::error::AutomationResult;

use super::breaker::CircuitBreaker;
use crate::captcha::types::{AntiBotSystem, CaptchaChallenge, CaptchaSolution};

/// EMA smoothing factor for response time and success rate.
const EMA_ALPHA: f64 = 0.2;

/// A challenge solver, native or external.
#[async_trait]
pub trait Solver: Send + Sync {
    /// Stable identifier, e.g. `recaptcha-native`.
    fn id(&self) -> &str;

    async fn solve(&self, challenge: &CaptchaChallenge, page: &Page) -> AutomationResult<CaptchaSolution>;
}

#[derive(Debug)]
struct Performance {
    avg_response_ms: f64,
    success_rate: f64,
    samples: u64,
}

/// Registry entry wrapping a solver with its routing metadata.
pub struct SolverEntry {
    pub solver: Arc<dyn Solver>,
    pub supported: HashSet<AntiBotSystem>,
    pub priority: i32,
    enabled: AtomicBool,
    pub max_concurrency: usize,
    in_flight: AtomicUsize,
    performance: Mutex<Performance>,
    pub breaker: CircuitBreaker,
}

impl SolverEntry {
    #[must_use]
    pub fn name(&self) -> &str {
        self.solver.id()
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Reserve an attempt slot; false when the solver is saturated.
    pub fn try_begin_attempt(&self) -> bool {
        let mut current = self.in_flight.load(Ordering::Relaxed);
        loop {
            if current >= self.max_concurrency {
                return false;
            }
            match self.in_flight.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn end_attempt(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    /// Fold one observed attempt into the rolling metrics.
    pub fn record_observation(&self, duration: Duration, success: bool) {
        let mut perf = self.performance.lock().unwrap_or_else(|e| e.into_inner());
        let millis = duration.as_secs_f64() * 1000.0;
        let outcome = if success { 1.0 } else { 0.0 };
        if perf.samples == 0 {
            perf.avg_response_ms = millis;
            perf.success_rate = outcome;
        } else {
            perf.avg_response_ms = perf.avg_response_ms * (1.0 - EMA_ALPHA) + millis * EMA_ALPHA;
            perf.success_rate = perf.success_rate * (1.0 - EMA_ALPHA) + outcome * EMA_ALPHA;
        }
        perf.samples += 1;
    }

    #[must_use]
    pub fn average_response_ms(&self) -> f64 {
        self.performance.lock().unwrap_or_else(|e| e.into_inner()).avg_response_ms
    }

    #[must_use]
    pub fn success_rate(&self) -> f64 {
        let perf = self.performance.lock().unwrap_or_else(|e| e.into_inner());
        // Unproven solvers rank as if perfect so they get tried
        if perf.samples == 0 { 1.0 } else { perf.success_rate }
    }
}

/// Registration parameters for one solver.
pub struct SolverRegistration {
    pub solver: Arc<dyn Solver>,
    pub supported: HashSet<AntiBotSystem>,
    pub priority: i32,
    pub max_concurrency: usize,
}

/// Name-keyed solver registry.
pub struct SolverRegistry {
    entries: DashMap<String, Arc<SolverEntry>>,
    breaker_failure_threshold: u32,
    breaker_timeout_period: Duration,
}

impl SolverRegistry {
    #[must_use]
    pub fn new(config: &CaptchaConfig) -> Self {
        Self {
            entries: DashMap::new(),
            breaker_failure_threshold: config.breaker_failure_threshold,
            breaker_timeout_period: config.breaker_timeout_period,
        }
    }

    /// Register (or replace) a solver under its id.
    pub fn register(&self, registration: SolverRegistration) {
        let name = registration.solver.id().to_string();
        let entry = SolverEntry {
            solver: registration.solver,
            supported: registration.supported,
            priority: registration.priority,
            enabled: AtomicBool::new(true),
            max_concurrency: registration.max_concurrency.max(1),
            in_flight: AtomicUsize::new(0),
            performance: Mutex::new(Performance {
                avg_response_ms: 0.0,
                success_rate: 1.0,
                samples: 0,
            }),
            breaker: CircuitBreaker::new(self.breaker_failure_threshold, self.breaker_timeout_period),
        };
        self.entries.insert(name, Arc::new(entry));
    }

    /// Remove a solver; re-registering afterwards yields fresh state.
    pub fn unregister(&self, name: &str) -> bool {
        self.entries.remove(name).is_some()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<SolverEntry>> {
        self.entries.get(name).map(|e| Arc::clone(e.value()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Ranked candidates for a challenge system: supported, enabled, breaker
    /// not rejecting; ordered by priority DESC, success rate DESC, average
    /// response time ASC.
    #[must_use]
    pub fn candidates_for(&self, system: AntiBotSystem) -> Vec<Arc<SolverEntry>> {
        let mut candidates: Vec<Arc<SolverEntry>> = self
            .entries
            .iter()
            .filter(|entry| {
                let e = entry.value();
                e.supported.contains(&system)
                    && e.is_enabled()
                    && e.breaker.should_attempt(e.name())
            })
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        candidates.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| {
                    b.success_rate()
                        .partial_cmp(&a.success_rate())
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| {
                    a.average_response_ms()
                        .partial_cmp(&b.average_response_ms())
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
        });
        candidates
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopSolver {
        id: &'static str,
    }

    #[async_trait]
    impl Solver for NoopSolver {
        fn id(&self) -> &str {
            self.id
        }

        async fn solve(
            &self,
            _challenge: &CaptchaChallenge,
            _page: &Page,
        ) -> AutomationResult<CaptchaSolution> {
            Ok(CaptchaSolution::token(self.id, "tok"))
        }
    }

    fn registry() -> SolverRegistry {
        SolverRegistry::new(&CaptchaConfig::default())
    }

    fn register(reg: &SolverRegistry, id: &'static str, priority: i32) {
        reg.register(SolverRegistration {
            solver: Arc::new(NoopSolver { id }),
            supported: HashSet::from([AntiBotSystem::Recaptcha]),
            priority,
            max_concurrency: 10,
        });
    }

    #[test]
    fn register_unregister_register_is_idempotent() {
        let reg = registry();
        register(&reg, "a", 5);
        assert_eq!(reg.len(), 1);
        assert!(reg.unregister("a"));
        assert!(reg.is_empty());
        register(&reg, "a", 5);
        assert_eq!(reg.len(), 1);
        let entry = reg.get("a").expect("entry exists");
        assert_eq!(entry.priority, 5);
        assert_eq!(entry.in_flight(), 0);
    }

    #[test]
    fn candidates_rank_by_priority_then_success_rate() {
        let reg = registry();
        register(&reg, "low", 1);
        register(&reg, "high", 10);
        register(&reg, "mid-flaky", 5);
        register(&reg, "mid-solid", 5);

        // Give the flaky one a failure history
        let flaky = reg.get("mid-flaky").expect("entry exists");
        flaky.record_observation(Duration::from_millis(100), false);
        let solid = reg.get("mid-solid").expect("entry exists");
        solid.record_observation(Duration::from_millis(100), true);

        let names: Vec<String> = reg
            .candidates_for(AntiBotSystem::Recaptcha)
            .iter()
            .map(|e| e.name().to_string())
            .collect();
        assert_eq!(names, vec!["high", "mid-solid", "mid-flaky", "low"]);
    }

    #[test]
    fn unsupported_and_disabled_solvers_are_excluded() {
        let reg = registry();
        register(&reg, "a", 1);
        assert!(reg.candidates_for(AntiBotSystem::Akamai).is_empty());

        reg.get("a").expect("entry exists").set_enabled(false);
        assert!(reg.candidates_for(AntiBotSystem::Recaptcha).is_empty());
    }

    #[test]
    fn open_breaker_excludes_candidate() {
        let reg = registry();
        register(&reg, "a", 1);
        let entry = reg.get("a").expect("entry exists");
        for _ in 0..3 {
            entry.breaker.record_failure("a", "boom");
        }
        assert!(reg.candidates_for(AntiBotSystem::Recaptcha).is_empty());
    }

    #[test]
    fn concurrency_gate_caps_attempts() {
        let reg = registry();
        reg.register(SolverRegistration {
            solver: Arc::new(NoopSolver { id: "tight" }),
            supported: HashSet::from([AntiBotSystem::Recaptcha]),
            priority: 1,
            max_concurrency: 2,
        });
        let entry = reg.get("tight").expect("entry exists");
        assert!(entry.try_begin_attempt());
        assert!(entry.try_begin_attempt());
        assert!(!entry.try_begin_attempt());
        entry.end_attempt();
        assert!(entry.try_begin_attempt());
    }

    #[test]
    fn ema_tracks_recent_observations() {
        let reg = registry();
        register(&reg, "a", 1);
        let entry = reg.get("a").expect("entry exists");
        entry.record_observation(Duration::from_millis(1000), true);
        assert!((entry.average_response_ms() - 1000.0).abs() < 1.0);
        for _ in 0..20 {
            entry.record_observation(Duration::from_millis(100), true);
        }
        assert!(entry.average_response_ms() < 300.0);
        assert!(entry.success_rate() > 0.9);
    }
}
