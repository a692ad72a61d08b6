//! Aggregation of multi-attempt failures into a single reportable record.

use std::collections::HashMap;
use std::time::Duration;

use crate::error::{AutomationError, ErrorCategory};

use super::ErrorContext;

/// One failed attempt as recorded by the orchestrator.
#[derive(Debug, Clone)]
pub struct AttemptError {
    pub solver: String,
    pub error: AutomationError,
    pub duration: Duration,
}

/// Collects per-attempt failures while a candidate loop runs.
#[derive(Debug, Default)]
pub struct ErrorAggregator {
    attempts: Vec<AttemptError>,
}

impl ErrorAggregator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, solver: &str, error: AutomationError, duration: Duration) {
        self.attempts.push(AttemptError {
            solver: solver.to_string(),
            error,
            duration,
        });
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    /// Fold the recorded attempts into an [`AggregatedFailure`].
    ///
    /// Returns `None` when nothing was recorded (the caller succeeded).
    #[must_use]
    pub fn finish(self, context: Option<ErrorContext>) -> Option<AggregatedFailure> {
        if self.attempts.is_empty() {
            return None;
        }

        let total_attempts = self.attempts.len();
        let total_duration = self.attempts.iter().map(|a| a.duration).sum();

        let mut by_category: HashMap<ErrorCategory, usize> = HashMap::new();
        for attempt in &self.attempts {
            *by_category.entry(attempt.error.category).or_insert(0) += 1;
        }
        let most_common_category = by_category
            .into_iter()
            .max_by_key(|(_, count)| *count)
            .map(|(category, _)| category)
            .unwrap_or(ErrorCategory::Internal);

        let first_error = self.attempts.first().cloned();
        let last_error = self.attempts.last().cloned();

        Some(AggregatedFailure {
            errors: self.attempts,
            total_attempts,
            first_error,
            last_error,
            most_common_category,
            total_duration,
            context,
        })
    }
}

/// The combined outcome of an exhausted candidate loop.
#[derive(Debug, Clone)]
pub struct AggregatedFailure {
    pub errors: Vec<AttemptError>,
    pub total_attempts: usize,
    pub first_error: Option<AttemptError>,
    pub last_error: Option<AttemptError>,
    pub most_common_category: ErrorCategory,
    pub total_duration: Duration,
    pub context: Option<ErrorContext>,
}

impl AggregatedFailure {
    /// One-line human summary suitable for a job's error field.
    #[must_use]
    pub fn summary(&self) -> String {
        let solvers: Vec<String> = self
            .errors
            .iter()
            .map(|a| format!("{}:{}", a.solver, a.error.category))
            .collect();
        let correlation = self
            .context
            .as_ref()
            .map(|c| c.correlation_id.to_string())
            .unwrap_or_else(|| "-".to_string());
        format!(
            "{} attempts failed in {:.1}s (mostly {}) [{}] correlation={}",
            self.total_attempts,
            self.total_duration.as_secs_f64(),
            self.most_common_category,
            solvers.join(", "),
            correlation,
        )
    }

    /// Convert into the terminal error handed back to the processor.
    #[must_use]
    pub fn into_error(self) -> AutomationError {
        let mut err = AutomationError::solver_unavailable(self.summary())
            .with_attempts(self.total_attempts as u32);
        if let Some(ctx) = &self.context {
            err = err.with_correlation(ctx.correlation_id);
        }
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AutomationError;

    fn timeout_attempt(solver: &str) -> (String, AutomationError, Duration) {
        (
            solver.to_string(),
            AutomationError::timeout("t", "deadline exceeded"),
            Duration::from_millis(100),
        )
    }

    #[test]
    fn empty_aggregator_finishes_to_none() {
        assert!(ErrorAggregator::new().finish(None).is_none());
    }

    #[test]
    fn most_common_category_wins() {
        let mut agg = ErrorAggregator::new();
        for solver in ["a", "b"] {
            let (s, e, d) = timeout_attempt(solver);
            agg.record(&s, e, d);
        }
        agg.record(
            "c",
            AutomationError::network("n", "connection reset"),
            Duration::from_millis(50),
        );

        let failure = agg.finish(None).expect("attempts were recorded");
        assert_eq!(failure.total_attempts, 3);
        assert_eq!(failure.most_common_category, ErrorCategory::Timeout);
        assert_eq!(failure.total_duration, Duration::from_millis(250));
        assert_eq!(
            failure.first_error.as_ref().map(|a| a.solver.as_str()),
            Some("a")
        );
        assert_eq!(
            failure.last_error.as_ref().map(|a| a.solver.as_str()),
            Some("c")
        );
    }

    #[test]
    fn summary_names_each_attempted_solver() {
        let mut agg = ErrorAggregator::new();
        let (s, e, d) = timeout_attempt("turnstile-native");
        agg.record(&s, e, d);
        let failure = agg.finish(None).expect("attempt recorded");
        let summary = failure.summary();
        assert!(summary.contains("turnstile-native:timeout"), "{summary}");

        let err = failure.into_error();
        assert_eq!(err.category, ErrorCategory::SolverUnavailable);
        assert_eq!(err.attempts, 1);
    }
}
