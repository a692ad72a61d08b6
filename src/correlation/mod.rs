//! Correlation scope threaded through every asynchronous suspension.
//!
//! A job attempt (and every solver attempt inside it) runs inside a scope
//! created by [`run_in_scope`]. The scope lives in tokio task-local storage,
//! so it survives awaits and is visible to all descendants of the call tree
//! without passing a context argument through every signature. Logging and
//! error aggregation read it through [`current`].

pub mod aggregation;

pub use aggregation::{AggregatedFailure, ErrorAggregator};

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Snapshot of the active scope, attached to logs and errors.
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub correlation_id: Uuid,
    pub solver_type: String,
    pub attempt_number: u32,
    pub started_at: DateTime<Utc>,
    /// Duration of the most recently recorded timing, if any
    pub last_duration: Option<Duration>,
    pub additional: HashMap<String, String>,
}

#[derive(Debug)]
struct ScopeInner {
    solver_type: String,
    attempt_number: u32,
    last_duration: Option<Duration>,
    additional: HashMap<String, String>,
}

/// Shared scope state; cheap to clone into spawned children.
#[derive(Debug, Clone)]
pub struct Scope {
    correlation_id: Uuid,
    started_at: DateTime<Utc>,
    entered: Instant,
    inner: Arc<Mutex<ScopeInner>>,
}

impl Scope {
    fn new(correlation_id: Uuid, solver_type: &str) -> Self {
        Self {
            correlation_id,
            started_at: Utc::now(),
            entered: Instant::now(),
            inner: Arc::new(Mutex::new(ScopeInner {
                solver_type: solver_type.to_string(),
                attempt_number: 1,
                last_duration: None,
                additional: HashMap::new(),
            })),
        }
    }

    fn snapshot(&self) -> ErrorContext {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        ErrorContext {
            correlation_id: self.correlation_id,
            solver_type: inner.solver_type.clone(),
            attempt_number: inner.attempt_number,
            started_at: self.started_at,
            last_duration: inner.last_duration,
            additional: inner.additional.clone(),
        }
    }
}

tokio::task_local! {
    static ACTIVE_SCOPE: Scope;
}

/// Run `body` inside a fresh correlation scope.
///
/// An explicit `correlation_id` (e.g. from an inbound request) is honored;
/// otherwise a new UUID is minted. Nested calls shadow the outer scope for
/// the duration of `body`.
pub async fn run_in_scope<F, T>(correlation_id: Option<Uuid>, solver_type: &str, body: F) -> T
where
    F: Future<Output = T>,
{
    let scope = Scope::new(correlation_id.unwrap_or_else(Uuid::new_v4), solver_type);
    ACTIVE_SCOPE.scope(scope, body).await
}

/// Snapshot of the active scope, or `None` outside any scope.
#[must_use]
pub fn current() -> Option<ErrorContext> {
    ACTIVE_SCOPE.try_with(Scope::snapshot).ok()
}

/// Correlation id of the active scope, or `None` outside any scope.
#[must_use]
pub fn current_id() -> Option<Uuid> {
    ACTIVE_SCOPE.try_with(|s| s.correlation_id).ok()
}

/// Elapsed time since the active scope was entered.
#[must_use]
pub fn elapsed() -> Option<Duration> {
    ACTIVE_SCOPE.try_with(|s| s.entered.elapsed()).ok()
}

fn with_inner(f: impl FnOnce(&mut ScopeInner)) {
    let _ = ACTIVE_SCOPE.try_with(|s| {
        let mut inner = s.inner.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut inner);
    });
}

/// Record the duration of a completed operation on the active scope.
pub fn add_timing(start: Instant, end: Instant) {
    with_inner(|inner| inner.last_duration = Some(end.duration_since(start)));
}

/// Record which solver the current attempt belongs to.
pub fn set_solver_metadata(solver_type: &str) {
    let solver_type = solver_type.to_string();
    with_inner(|inner| inner.solver_type = solver_type);
}

pub fn set_attempt_number(attempt: u32) {
    with_inner(|inner| inner.attempt_number = attempt);
}

/// Attach an arbitrary key/value pair to the active scope.
pub fn add_additional_context(key: &str, value: &str) {
    let (key, value) = (key.to_string(), value.to_string());
    with_inner(|inner| {
        inner.additional.insert(key, value);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scope_survives_awaits() {
        let id = Uuid::new_v4();
        run_in_scope(Some(id), "job", async move {
            assert_eq!(current_id(), Some(id));
            tokio::time::sleep(Duration::from_millis(5)).await;
            assert_eq!(current_id(), Some(id));
        })
        .await;
        assert!(current_id().is_none());
    }

    #[tokio::test]
    async fn nested_scope_shadows_outer() {
        run_in_scope(None, "job", async {
            let outer = current_id().expect("outer scope should be active");
            run_in_scope(None, "solver", async move {
                let inner = current_id().expect("inner scope should be active");
                assert_ne!(outer, inner);
                assert_eq!(
                    current().expect("context should exist").solver_type,
                    "solver"
                );
            })
            .await;
            assert_eq!(current_id(), Some(outer));
        })
        .await;
    }

    #[tokio::test]
    async fn metadata_mutations_are_visible() {
        run_in_scope(None, "job", async {
            set_attempt_number(3);
            set_solver_metadata("recaptcha-native");
            add_additional_context("page", "https://example.com");
            let start = Instant::now();
            add_timing(start, start + Duration::from_millis(250));

            let ctx = current().expect("context should exist");
            assert_eq!(ctx.attempt_number, 3);
            assert_eq!(ctx.solver_type, "recaptcha-native");
            assert_eq!(
                ctx.additional.get("page").map(String::as_str),
                Some("https://example.com")
            );
            assert_eq!(ctx.last_duration, Some(Duration::from_millis(250)));
        })
        .await;
    }

    #[tokio::test]
    async fn outside_scope_accessors_return_none() {
        assert!(current().is_none());
        assert!(elapsed().is_none());
        // Mutators are silent no-ops outside a scope
        set_attempt_number(7);
        add_additional_context("k", "v");
    }
}
