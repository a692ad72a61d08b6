//! Error categories shared across the automation pipeline.
//!
//! Every component converts its low-level failures (driver, HTTP, database)
//! into an [`AutomationError`] before returning, so the processor and the
//! solver orchestrator can branch on category and recoverability instead of
//! string-matching at the call site.

use std::fmt;

use uuid::Uuid;

/// Coarse failure category with a default recoverability policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ErrorCategory {
    /// Navigation, action, or solver exceeded its deadline
    Timeout,
    /// DNS, TLS, connection, or upstream 5xx failures
    Network,
    /// Malformed URL, missing sitekey, bad action parameters
    InvalidInput,
    /// Missing or rejected API credential
    Auth,
    /// A per-minute provider cap was exceeded
    RateLimited,
    /// A circuit breaker rejected the attempt
    CircuitOpen,
    /// Every ranked solver candidate was exhausted
    SolverUnavailable,
    /// Unexpected internal failure, including path-traversal attempts
    Internal,
}

impl ErrorCategory {
    /// Default retry policy for this category.
    ///
    /// `RateLimited` and `CircuitOpen` are recoverable by moving on (backoff
    /// or next candidate) rather than by replaying the same call.
    #[must_use]
    pub fn is_recoverable(self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::Network | Self::RateLimited | Self::CircuitOpen
        )
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Timeout => "timeout",
            Self::Network => "network",
            Self::InvalidInput => "invalid_input",
            Self::Auth => "auth",
            Self::RateLimited => "rate_limited",
            Self::CircuitOpen => "circuit_open",
            Self::SolverUnavailable => "solver_unavailable",
            Self::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// Structured error carried through the job pipeline.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{category} [{code}]: {message}")]
pub struct AutomationError {
    pub category: ErrorCategory,
    /// Stable machine-readable code, e.g. `navigation_timeout`
    pub code: String,
    pub message: String,
    /// Overrides the category default when set explicitly
    pub recoverable: bool,
    /// Correlation id of the attempt that produced this error, when known
    pub correlation_id: Option<Uuid>,
    /// Number of attempts made before this error was surfaced
    pub attempts: u32,
}

impl AutomationError {
    /// Build an error with the category's default recoverability.
    pub fn new(category: ErrorCategory, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
            recoverable: category.is_recoverable(),
            correlation_id: None,
            attempts: 1,
        }
    }

    pub fn timeout(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Timeout, code, message)
    }

    pub fn network(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Network, code, message)
    }

    pub fn invalid_input(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::InvalidInput, code, message)
    }

    pub fn auth(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Auth, code, message)
    }

    pub fn rate_limited(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::RateLimited, code, message)
    }

    pub fn circuit_open(solver: &str) -> Self {
        Self::new(
            ErrorCategory::CircuitOpen,
            "breaker_open",
            format!("circuit breaker open for solver {solver}"),
        )
    }

    pub fn solver_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::SolverUnavailable, "all_solvers_exhausted", message)
    }

    pub fn internal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Internal, code, message)
    }

    /// Attach the correlation id of the current attempt.
    #[must_use]
    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    #[must_use]
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Force the recoverability flag regardless of category default.
    #[must_use]
    pub fn with_recoverable(mut self, recoverable: bool) -> Self {
        self.recoverable = recoverable;
        self
    }

    /// Classify an opaque error by message patterns.
    ///
    /// Mirrors the retry classification used for page failures: rate limits
    /// are checked first because their messages often also contain "request".
    #[must_use]
    pub fn classify(err: &anyhow::Error) -> Self {
        let msg = format!("{err:#}");
        let lower = msg.to_lowercase();

        if lower.contains("429") || lower.contains("too many requests") || lower.contains("rate limit")
        {
            return Self::rate_limited("provider_rate_limit", msg);
        }
        if lower.contains("timeout") || lower.contains("timed out") || lower.contains("deadline") {
            return Self::timeout("operation_timeout", msg);
        }
        if lower.contains("dns")
            || lower.contains("connection refused")
            || lower.contains("connection reset")
            || lower.contains("unreachable")
            || lower.contains("tls")
            || lower.contains("network")
            || lower.contains("502")
            || lower.contains("503")
        {
            return Self::network("upstream_failure", msg);
        }
        if lower.contains("api key") || lower.contains("unauthorized") || lower.contains("401") {
            return Self::auth("credential_rejected", msg);
        }
        if lower.contains("invalid url") || lower.contains("missing sitekey") || lower.contains("parse")
        {
            return Self::invalid_input("bad_input", msg);
        }
        Self::internal("unexpected", msg)
    }
}

impl From<sqlx::Error> for AutomationError {
    fn from(err: sqlx::Error) -> Self {
        Self::internal("store_failure", format!("database error: {err}"))
    }
}

impl From<reqwest::Error> for AutomationError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::timeout("http_timeout", err.to_string())
        } else {
            Self::network("http_failure", err.to_string())
        }
    }
}

impl From<chromiumoxide::error::CdpError> for AutomationError {
    fn from(err: chromiumoxide::error::CdpError) -> Self {
        let msg = err.to_string();
        if msg.to_lowercase().contains("timeout") {
            Self::timeout("cdp_timeout", msg)
        } else {
            Self::network("cdp_failure", msg)
        }
    }
}

/// Convenience alias used throughout the crate.
pub type AutomationResult<T> = Result<T, AutomationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_defaults_match_policy_table() {
        assert!(ErrorCategory::Timeout.is_recoverable());
        assert!(ErrorCategory::Network.is_recoverable());
        assert!(ErrorCategory::RateLimited.is_recoverable());
        assert!(ErrorCategory::CircuitOpen.is_recoverable());
        assert!(!ErrorCategory::InvalidInput.is_recoverable());
        assert!(!ErrorCategory::Auth.is_recoverable());
        assert!(!ErrorCategory::SolverUnavailable.is_recoverable());
        assert!(!ErrorCategory::Internal.is_recoverable());
    }

    #[test]
    fn classify_prefers_rate_limit_over_network() {
        let err = anyhow::anyhow!("upstream returned 429 Too Many Requests");
        let classified = AutomationError::classify(&err);
        assert_eq!(classified.category, ErrorCategory::RateLimited);
        assert!(classified.recoverable);
    }

    #[test]
    fn classify_detects_timeouts() {
        let err = anyhow::anyhow!("navigation timed out after 30s");
        assert_eq!(AutomationError::classify(&err).category, ErrorCategory::Timeout);
    }

    #[test]
    fn recoverable_override_sticks() {
        let err = AutomationError::timeout("t", "m").with_recoverable(false);
        assert!(!err.recoverable);
    }
}
