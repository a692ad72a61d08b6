//! Solver orchestration (C8).
//!
//! Routes a detected challenge to the best available solver: candidates are
//! the enabled registry entries supporting the challenge's system whose
//! breaker admits traffic, ranked by priority, rolling success rate, and
//! response time. Each attempt runs under the challenge type's timeout;
//! failures feed the breaker and the error aggregator, with exponential
//! backoff between candidates. Exhaustion surfaces as `SolverUnavailable`
//! carrying the ordered per-attempt error list.

pub mod breaker;
pub mod external;
pub mod native;
pub mod registry;

pub use breaker::{CircuitBreaker, CircuitState};
pub use external::{AntiCaptchaSolver, ApiKeyRotation, TwoCaptchaSolver};
pub use native::{AkamaiSolver, DatadomeSolver, HcaptchaSolver, RecaptchaSolver, TurnstileSolver};
pub use registry::{Solver, SolverEntry, SolverRegistration, SolverRegistry};

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chromiumoxide::Page;
use tracing::{debug, info, warn};

use crate::config::CaptchaConfig;
use crate::correlation;
use crate::correlation::ErrorAggregator;
use crate::error::{AutomationError, AutomationResult};

use super::audio::AudioPipeline;
use super::types::{AntiBotSystem, CaptchaChallenge, CaptchaSolution, ChallengeType};
use super::widget::WidgetInteractor;

/// The checkbox-style default challenge assumed for a bare system detection.
#[must_use]
pub fn default_challenge_type(system: AntiBotSystem) -> ChallengeType {
    match system {
        AntiBotSystem::Recaptcha => ChallengeType::RecaptchaV2Checkbox,
        AntiBotSystem::Hcaptcha => ChallengeType::HcaptchaCheckbox,
        AntiBotSystem::Turnstile => ChallengeType::Turnstile,
        AntiBotSystem::Datadome => ChallengeType::DatadomeSensor,
        AntiBotSystem::Akamai => ChallengeType::AkamaiLevel2,
        AntiBotSystem::Funcaptcha => ChallengeType::Funcaptcha,
    }
}

/// Candidate-loop driver with fault tolerance.
pub struct SolverOrchestrator {
    registry: Arc<SolverRegistry>,
    config: CaptchaConfig,
}

impl SolverOrchestrator {
    #[must_use]
    pub fn new(registry: Arc<SolverRegistry>, config: CaptchaConfig) -> Self {
        Self { registry, config }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<SolverRegistry> {
        &self.registry
    }

    /// Solve `challenge` on `page` through the ranked candidate list.
    pub async fn solve(
        &self,
        challenge: &CaptchaChallenge,
        page: &Page,
    ) -> AutomationResult<CaptchaSolution> {
        self.run_candidates(challenge, |entry| {
            let solver = Arc::clone(&entry.solver);
            async move { solver.solve(challenge, page).await }
        })
        .await
    }

    /// Candidate loop, parameterized over the attempt body (test seam).
    pub(crate) async fn run_candidates<F, Fut>(
        &self,
        challenge: &CaptchaChallenge,
        attempt_fn: F,
    ) -> AutomationResult<CaptchaSolution>
    where
        F: Fn(Arc<SolverEntry>) -> Fut,
        Fut: Future<Output = AutomationResult<CaptchaSolution>>,
    {
        let system = challenge.challenge_type.system();
        let candidates = self.registry.candidates_for(system);
        if candidates.is_empty() {
            return Err(AutomationError::solver_unavailable(format!(
                "no enabled solver supports {system}"
            )));
        }

        let attempt_timeout = challenge.challenge_type.attempt_timeout();
        let max_attempts = self.config.retry_max_attempts.max(1);
        let mut aggregator = ErrorAggregator::new();
        let mut attempt: u32 = 0;

        for entry in candidates {
            if attempt >= max_attempts {
                break;
            }
            if challenge.is_cancelled() {
                return Err(AutomationError::internal("solve_cancelled", "job cancelled")
                    .with_attempts(attempt));
            }
            if !entry.try_begin_attempt() {
                debug!(solver = entry.name(), "Solver saturated, skipping candidate");
                continue;
            }

            attempt += 1;
            correlation::set_attempt_number(attempt);
            correlation::set_solver_metadata(entry.name());
            debug!(
                solver = entry.name(),
                attempt,
                challenge = %challenge.challenge_type,
                "Dispatching solver attempt"
            );

            let started = Instant::now();
            let outcome = tokio::time::timeout(attempt_timeout, attempt_fn(Arc::clone(&entry))).await;
            let duration = started.elapsed();
            entry.end_attempt();
            correlation::add_timing(started, Instant::now());

            match outcome {
                Ok(Ok(solution)) => {
                    entry.record_observation(duration, true);
                    entry.breaker.record_success(entry.name());
                    info!(
                        solver = entry.name(),
                        duration_ms = duration.as_millis() as u64,
                        "Challenge solved"
                    );
                    return Ok(solution);
                }
                Ok(Err(error)) => {
                    entry.record_observation(duration, false);
                    entry.breaker.record_failure(entry.name(), &error.message);
                    warn!(solver = entry.name(), "Solver attempt failed: {error}");
                    aggregator.record(entry.name(), error, duration);
                }
                Err(_) => {
                    let error = AutomationError::timeout(
                        "solver_attempt",
                        format!("{} exceeded {attempt_timeout:?}", entry.name()),
                    );
                    entry.record_observation(duration, false);
                    entry.breaker.record_failure(entry.name(), &error.message);
                    aggregator.record(entry.name(), error, duration);
                }
            }

            if attempt < max_attempts {
                let backoff = self.backoff_for(attempt);
                debug!(?backoff, "Backing off before next candidate");
                tokio::time::sleep(backoff).await;
            }
        }

        match aggregator.finish(correlation::current()) {
            Some(failure) => Err(failure.into_error()),
            // Every candidate was skipped while saturated
            None => Err(AutomationError::solver_unavailable(format!(
                "all candidates for {system} at concurrency capacity"
            ))),
        }
    }

    /// Exponential backoff `initial · 2^(attempt−1)`, capped.
    #[must_use]
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.config
            .initial_retry_delay
            .saturating_mul(factor)
            .min(self.config.max_retry_delay)
    }
}

/// Register the full native + external solver stack.
///
/// External adapters register only when their key set is non-empty, the same
/// lazy-credential policy the transcription providers follow.
pub fn build_default_registry(
    config: &CaptchaConfig,
    interactor: Arc<WidgetInteractor>,
    audio: Arc<AudioPipeline>,
) -> Arc<SolverRegistry> {
    let registry = Arc::new(SolverRegistry::new(config));
    let http = reqwest::Client::builder()
        .timeout(config.provider_timeout)
        .build()
        .unwrap_or_default();

    registry.register(SolverRegistration {
        solver: Arc::new(RecaptchaSolver::new(Arc::clone(&interactor), Arc::clone(&audio))),
        supported: HashSet::from([AntiBotSystem::Recaptcha]),
        priority: 10,
        max_concurrency: config.max_concurrency,
    });
    registry.register(SolverRegistration {
        solver: Arc::new(HcaptchaSolver::new(Arc::clone(&interactor), Arc::clone(&audio))),
        supported: HashSet::from([AntiBotSystem::Hcaptcha]),
        priority: 10,
        max_concurrency: config.max_concurrency,
    });
    registry.register(SolverRegistration {
        solver: Arc::new(TurnstileSolver::new(Arc::clone(&interactor))),
        supported: HashSet::from([AntiBotSystem::Turnstile]),
        priority: 10,
        max_concurrency: config.max_concurrency,
    });
    registry.register(SolverRegistration {
        solver: Arc::new(DatadomeSolver::new(
            Arc::clone(&interactor),
            crate::config::HumanInputConfig::default(),
        )),
        supported: HashSet::from([AntiBotSystem::Datadome]),
        priority: 10,
        max_concurrency: config.max_concurrency,
    });
    registry.register(SolverRegistration {
        solver: Arc::new(AkamaiSolver::new(config.akamai_sensor_secret.clone())),
        supported: HashSet::from([AntiBotSystem::Akamai]),
        priority: 10,
        max_concurrency: config.max_concurrency,
    });

    if !config.twocaptcha_api_keys.is_empty() {
        registry.register(SolverRegistration {
            solver: Arc::new(TwoCaptchaSolver::new(http.clone(), config.twocaptcha_api_keys.clone())),
            supported: HashSet::from([
                AntiBotSystem::Recaptcha,
                AntiBotSystem::Hcaptcha,
                AntiBotSystem::Turnstile,
                AntiBotSystem::Datadome,
                AntiBotSystem::Funcaptcha,
            ]),
            priority: 5,
            max_concurrency: config.max_concurrency,
        });
    }
    if !config.anticaptcha_api_keys.is_empty() {
        registry.register(SolverRegistration {
            solver: Arc::new(AntiCaptchaSolver::new(http, config.anticaptcha_api_keys.clone())),
            supported: HashSet::from([
                AntiBotSystem::Recaptcha,
                AntiBotSystem::Hcaptcha,
                AntiBotSystem::Turnstile,
            ]),
            priority: 4,
            max_concurrency: config.max_concurrency,
        });
    }

    info!("Solver registry initialized with {} solvers", registry.len());
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct StubSolver {
        id: &'static str,
    }

    #[async_trait]
    impl Solver for StubSolver {
        fn id(&self) -> &str {
            self.id
        }

        async fn solve(
            &self,
            _challenge: &CaptchaChallenge,
            _page: &Page,
        ) -> AutomationResult<CaptchaSolution> {
            unreachable!("tests drive run_candidates directly")
        }
    }

    fn orchestrator_with(ids: &[(&'static str, i32)]) -> SolverOrchestrator {
        let mut config = CaptchaConfig::default();
        config.initial_retry_delay = Duration::from_millis(1);
        config.max_retry_delay = Duration::from_millis(4);
        let registry = Arc::new(SolverRegistry::new(&config));
        for (id, priority) in ids {
            registry.register(SolverRegistration {
                solver: Arc::new(StubSolver { id }),
                supported: HashSet::from([AntiBotSystem::Recaptcha]),
                priority: *priority,
                max_concurrency: 10,
            });
        }
        SolverOrchestrator::new(registry, config)
    }

    fn challenge() -> CaptchaChallenge {
        CaptchaChallenge::new(ChallengeType::RecaptchaV2Checkbox, "https://example.com")
    }

    #[tokio::test]
    async fn first_successful_candidate_wins() {
        let orchestrator = orchestrator_with(&[("primary", 10), ("fallback", 5)]);
        let calls = AtomicU32::new(0);
        let solution = orchestrator
            .run_candidates(&challenge(), |entry| {
                calls.fetch_add(1, Ordering::SeqCst);
                let name = entry.name().to_string();
                async move { Ok(CaptchaSolution::token(&name, "tok")) }
            })
            .await
            .expect("primary should solve");
        assert_eq!(solution.solver_id, "primary");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failure_falls_back_to_next_candidate() {
        let orchestrator = orchestrator_with(&[("primary", 10), ("fallback", 5)]);
        let solution = orchestrator
            .run_candidates(&challenge(), |entry| {
                let name = entry.name().to_string();
                async move {
                    if name == "primary" {
                        Err(AutomationError::network("boom", "primary down"))
                    } else {
                        Ok(CaptchaSolution::token(&name, "tok"))
                    }
                }
            })
            .await
            .expect("fallback should solve");
        assert_eq!(solution.solver_id, "fallback");
    }

    #[tokio::test]
    async fn exhaustion_aggregates_attempted_solvers() {
        let orchestrator = orchestrator_with(&[("a", 10), ("b", 5), ("c", 1)]);
        let err = orchestrator
            .run_candidates(&challenge(), |entry| {
                let name = entry.name().to_string();
                async move { Err(AutomationError::timeout("t", format!("{name} timed out"))) }
            })
            .await
            .expect_err("all candidates fail");
        assert_eq!(err.category, crate::error::ErrorCategory::SolverUnavailable);
        assert_eq!(err.attempts, 3);
        assert!(err.message.contains("a:timeout"));
        assert!(err.message.contains("b:timeout"));
        assert!(err.message.contains("c:timeout"));
    }

    #[tokio::test]
    async fn breaker_opens_after_threshold_and_skips_solver() {
        let orchestrator = orchestrator_with(&[("flaky", 10), ("steady", 5)]);

        // Three runs where flaky fails and steady rescues leave flaky's
        // breaker OPEN while steady stays CLOSED
        for _ in 0..3 {
            let result = orchestrator
                .run_candidates(&challenge(), |entry| {
                    let name = entry.name().to_string();
                    async move {
                        if name == "flaky" {
                            Err(AutomationError::network("boom", "flaky down"))
                        } else {
                            Ok(CaptchaSolution::token(&name, "tok"))
                        }
                    }
                })
                .await;
            assert!(result.is_ok());
        }
        let flaky = orchestrator.registry().get("flaky").expect("entry exists");
        assert_eq!(flaky.breaker.state(), CircuitState::Open);

        // Next run routes straight to the healthy candidate
        let touched = std::sync::Mutex::new(Vec::new());
        let solution = orchestrator
            .run_candidates(&challenge(), |entry| {
                touched.lock().expect("lock").push(entry.name().to_string());
                let name = entry.name().to_string();
                async move { Ok(CaptchaSolution::token(&name, "tok")) }
            })
            .await
            .expect("steady solves");
        assert_eq!(solution.solver_id, "steady");
        assert_eq!(*touched.lock().expect("lock"), vec!["steady".to_string()]);
    }

    #[tokio::test]
    async fn cancellation_stops_between_candidates() {
        let orchestrator = orchestrator_with(&[("only", 10)]);
        let challenge = challenge();
        challenge
            .cancelled
            .store(true, std::sync::atomic::Ordering::Relaxed);
        let err = orchestrator
            .run_candidates(&challenge, |_entry| async move {
                panic!("cancelled challenge must not dispatch")
            })
            .await
            .expect_err("cancelled");
        assert_eq!(err.code, "solve_cancelled");
    }

    #[tokio::test]
    async fn max_attempts_bounds_candidate_walk() {
        let mut config = CaptchaConfig::default();
        config.retry_max_attempts = 2;
        config.initial_retry_delay = Duration::from_millis(1);
        let registry = Arc::new(SolverRegistry::new(&config));
        for (id, priority) in [("a", 10), ("b", 5), ("c", 1)] {
            registry.register(SolverRegistration {
                solver: Arc::new(StubSolver { id }),
                supported: HashSet::from([AntiBotSystem::Recaptcha]),
                priority,
                max_concurrency: 10,
            });
        }
        let orchestrator = SolverOrchestrator::new(registry, config);
        let calls = AtomicU32::new(0);
        let err = orchestrator
            .run_candidates(&challenge(), |_entry| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Err(AutomationError::network("boom", "down")) }
            })
            .await
            .expect_err("exhausts at cap");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(err.attempts, 2);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut config = CaptchaConfig::default();
        config.initial_retry_delay = Duration::from_secs(1);
        config.max_retry_delay = Duration::from_secs(30);
        let registry = Arc::new(SolverRegistry::new(&config));
        let orchestrator = SolverOrchestrator::new(registry, config);
        assert_eq!(orchestrator.backoff_for(1), Duration::from_secs(1));
        assert_eq!(orchestrator.backoff_for(2), Duration::from_secs(2));
        assert_eq!(orchestrator.backoff_for(3), Duration::from_secs(4));
        assert_eq!(orchestrator.backoff_for(6), Duration::from_secs(30));
        assert_eq!(orchestrator.backoff_for(63), Duration::from_secs(30));
    }

    #[test]
    fn default_challenge_types_are_checkbox_style() {
        assert_eq!(
            default_challenge_type(AntiBotSystem::Recaptcha),
            ChallengeType::RecaptchaV2Checkbox
        );
        assert_eq!(
            default_challenge_type(AntiBotSystem::Datadome),
            ChallengeType::DatadomeSensor
        );
    }
}
