//! Queue semantics: locked dispatch, retry backoff, idempotent completion,
//! cancellation, and dead-worker requeue.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use browsermill::config::SchedulerConfig;
use browsermill::error::AutomationError;
use browsermill::events::{JobEvent, JobEventBus};
use browsermill::scheduler::job::{
    Action, BrowserFamily, BrowserWorker, JobLog, JobSpec, JobStatus, LogLevel, WorkerStatus,
};
use browsermill::scheduler::{FailureDisposition, JobStore, Scheduler};

fn spec(url: &str, priority: i64) -> JobSpec {
    JobSpec {
        target_url: url.to_string(),
        actions: vec![Action::Screenshot {
            format: "png".to_string(),
            full_page: false,
        }],
        browser_family: BrowserFamily::Chromium,
        priority,
        max_retries: Some(2),
        timeout_ms: None,
        wait_until: None,
        browser_storage: None,
    }
}

async fn store() -> JobStore {
    JobStore::open_in_memory().await.expect("in-memory store opens")
}

fn defaults() -> SchedulerConfig {
    SchedulerConfig::default()
}

#[tokio::test]
async fn enqueue_rejects_malformed_urls() {
    let store = store().await;
    let err = store
        .enqueue(spec("not a url", 0), &defaults())
        .await
        .expect_err("bad URL is rejected");
    assert_eq!(err.category, browsermill::error::ErrorCategory::InvalidInput);
}

#[tokio::test]
async fn claim_respects_priority_then_age() {
    let store = store().await;
    let low = store.enqueue(spec("https://example.com/low", 1), &defaults()).await.expect("enqueue");
    let high_old = store.enqueue(spec("https://example.com/high-old", 9), &defaults()).await.expect("enqueue");
    tokio::time::sleep(Duration::from_millis(5)).await;
    let high_new = store.enqueue(spec("https://example.com/high-new", 9), &defaults()).await.expect("enqueue");

    let worker = Uuid::new_v4();
    let first = store.claim_next(worker, BrowserFamily::Chromium).await.expect("claim").expect("job available");
    let second = store.claim_next(worker, BrowserFamily::Chromium).await.expect("claim").expect("job available");
    let third = store.claim_next(worker, BrowserFamily::Chromium).await.expect("claim").expect("job available");

    assert_eq!(first.id, high_old);
    assert_eq!(second.id, high_new);
    assert_eq!(third.id, low);
    assert!(store.claim_next(worker, BrowserFamily::Chromium).await.expect("claim").is_none());
}

#[tokio::test]
async fn claim_is_at_most_once_under_concurrency() {
    let store = store().await;
    let job_id = store.enqueue(spec("https://example.com/solo", 0), &defaults()).await.expect("enqueue");

    let (a, b) = tokio::join!(
        store.claim_next(Uuid::new_v4(), BrowserFamily::Chromium),
        store.claim_next(Uuid::new_v4(), BrowserFamily::Chromium),
    );
    let a = a.expect("claim a");
    let b = b.expect("claim b");

    // Exactly one racer wins the only job
    let winners = [a.as_ref(), b.as_ref()].iter().filter(|j| j.is_some()).count();
    assert_eq!(winners, 1);
    let won = a.or(b).expect("one winner");
    assert_eq!(won.id, job_id);
    assert_eq!(won.status, JobStatus::Processing);
    assert!(won.started_at.is_some());
}

#[tokio::test]
async fn claim_skips_other_families() {
    let store = store().await;
    let mut firefox_spec = spec("https://example.com/ff", 0);
    firefox_spec.browser_family = BrowserFamily::Firefox;
    store.enqueue(firefox_spec, &defaults()).await.expect("enqueue");

    assert!(
        store
            .claim_next(Uuid::new_v4(), BrowserFamily::Chromium)
            .await
            .expect("claim")
            .is_none()
    );
    assert!(
        store
            .claim_next(Uuid::new_v4(), BrowserFamily::Firefox)
            .await
            .expect("claim")
            .is_some()
    );
}

#[tokio::test]
async fn completion_is_idempotent() {
    let store = store().await;
    let job_id = store.enqueue(spec("https://example.com/done", 0), &defaults()).await.expect("enqueue");
    store.claim_next(Uuid::new_v4(), BrowserFamily::Chromium).await.expect("claim").expect("job");

    assert!(store.mark_completed(job_id, &[], &[]).await.expect("first completion"));
    // Replay is a no-op
    assert!(!store.mark_completed(job_id, &[], &[]).await.expect("replayed completion"));

    let job = store.get_job(job_id).await.expect("get").expect("exists");
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.completed_at.is_some());
}

#[tokio::test]
async fn retryable_failure_requeues_with_quadratic_backoff() {
    let store = store().await;
    let job_id = store.enqueue(spec("https://example.com/flaky", 0), &defaults()).await.expect("enqueue");
    let worker = Uuid::new_v4();
    let timeout = AutomationError::timeout("nav", "goto timed out");

    // First failure: retry with 1s backoff
    store.claim_next(worker, BrowserFamily::Chromium).await.expect("claim").expect("job");
    let disposition = store.mark_failed(job_id, &timeout, Duration::from_secs(300)).await.expect("mark");
    assert_eq!(
        disposition,
        FailureDisposition::Retried { attempt: 1, backoff: Duration::from_secs(1) }
    );
    // Backoff gates the next claim
    assert!(store.claim_next(worker, BrowserFamily::Chromium).await.expect("claim").is_none());

    let job = store.get_job(job_id).await.expect("get").expect("exists");
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.retry_count, 1);
    assert!(job.started_at.is_none());

    tokio::time::sleep(Duration::from_millis(1100)).await;
    store.claim_next(worker, BrowserFamily::Chromium).await.expect("claim").expect("retry claim");

    // Second failure: 4s backoff
    let disposition = store.mark_failed(job_id, &timeout, Duration::from_secs(300)).await.expect("mark");
    assert_eq!(
        disposition,
        FailureDisposition::Retried { attempt: 2, backoff: Duration::from_secs(4) }
    );
}

#[tokio::test]
async fn exhausted_retries_fail_terminally() {
    let store = store().await;
    let mut no_retry = spec("https://example.com/once", 0);
    no_retry.max_retries = Some(0);
    let job_id = store.enqueue(no_retry, &defaults()).await.expect("enqueue");
    store.claim_next(Uuid::new_v4(), BrowserFamily::Chromium).await.expect("claim").expect("job");

    let disposition = store
        .mark_failed(job_id, &AutomationError::timeout("nav", "boom"), Duration::from_secs(300))
        .await
        .expect("mark");
    assert_eq!(disposition, FailureDisposition::Failed);

    let job = store.get_job(job_id).await.expect("get").expect("exists");
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.completed_at.is_some());
    assert!(job.error_message.is_some());
}

#[tokio::test]
async fn non_recoverable_failure_skips_retry_budget() {
    let store = store().await;
    let job_id = store.enqueue(spec("https://example.com/bad", 0), &defaults()).await.expect("enqueue");
    store.claim_next(Uuid::new_v4(), BrowserFamily::Chromium).await.expect("claim").expect("job");

    let disposition = store
        .mark_failed(
            job_id,
            &AutomationError::invalid_input("bad_selector", "no such element"),
            Duration::from_secs(300),
        )
        .await
        .expect("mark");
    assert_eq!(disposition, FailureDisposition::Failed);
}

#[tokio::test]
async fn cancel_only_hits_non_terminal_jobs() {
    let store = store().await;
    let job_id = store.enqueue(spec("https://example.com/cancel", 0), &defaults()).await.expect("enqueue");

    assert!(store.cancel(job_id).await.expect("cancel pending"));
    assert!(store.is_cancelled(job_id).await.expect("check"));
    // Replay is a no-op on the now-terminal job
    assert!(!store.cancel(job_id).await.expect("cancel replay"));

    let job = store.get_job(job_id).await.expect("get").expect("exists");
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.completed_at.is_some());
    // A cancelled job is not dispatchable
    assert!(store.claim_next(Uuid::new_v4(), BrowserFamily::Chromium).await.expect("claim").is_none());
}

#[tokio::test]
async fn dead_worker_requeue_preserves_retry_count() {
    let store = store().await;
    let job_id = store.enqueue(spec("https://example.com/orphan", 0), &defaults()).await.expect("enqueue");

    let worker_id = Uuid::new_v4();
    store
        .register_worker(&BrowserWorker {
            id: worker_id,
            browser_family: BrowserFamily::Chromium,
            status: WorkerStatus::Idle,
            current_job_id: None,
            last_heartbeat_at: Utc::now(),
            pid: 4242,
            host: "test-host".to_string(),
        })
        .await
        .expect("register");

    let job = store.claim_next(worker_id, BrowserFamily::Chromium).await.expect("claim").expect("job");
    store
        .set_worker_state(worker_id, WorkerStatus::Busy, Some(job.id))
        .await
        .expect("mark busy");
    let retry_count_before = job.retry_count;

    // Heartbeat goes stale; reaper with a zero timeout sees it immediately
    tokio::time::sleep(Duration::from_millis(10)).await;
    let reaped = store.reap_dead_workers(Duration::from_millis(1)).await.expect("reap");
    assert_eq!(reaped.len(), 1);
    assert_eq!(reaped[0].0, worker_id);
    assert_eq!(reaped[0].1, Some(job_id));

    let job = store.get_job(job_id).await.expect("get").expect("exists");
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.retry_count, retry_count_before);
    assert!(job.started_at.is_none());

    let workers = store.list_active_workers().await.expect("list");
    assert!(workers.iter().all(|w| w.id != worker_id));
}

#[tokio::test]
async fn fresh_heartbeat_survives_reaper() {
    let store = store().await;
    let worker_id = Uuid::new_v4();
    store
        .register_worker(&BrowserWorker {
            id: worker_id,
            browser_family: BrowserFamily::Chromium,
            status: WorkerStatus::Idle,
            current_job_id: None,
            last_heartbeat_at: Utc::now(),
            pid: 1,
            host: "test-host".to_string(),
        })
        .await
        .expect("register");

    store.heartbeat(worker_id).await.expect("heartbeat");
    let reaped = store.reap_dead_workers(Duration::from_secs(30)).await.expect("reap");
    assert!(reaped.is_empty());
    assert_eq!(store.list_active_workers().await.expect("list").len(), 1);
}

#[tokio::test]
async fn job_logs_are_append_only_and_ordered() {
    let store = store().await;
    let job_id = store.enqueue(spec("https://example.com/logs", 0), &defaults()).await.expect("enqueue");
    let correlation_id = Uuid::new_v4();

    for (level, message) in [
        (LogLevel::Info, "job started"),
        (LogLevel::Warn, "slow navigation"),
        (LogLevel::Error, "action failed"),
    ] {
        store
            .append_log(&JobLog {
                job_id,
                level,
                message: message.to_string(),
                metadata: Some(serde_json::json!({ "step": message })),
                correlation_id: Some(correlation_id),
                timestamp: Utc::now(),
            })
            .await
            .expect("append");
    }

    let logs = store.logs_for_job(job_id).await.expect("read logs");
    assert_eq!(logs.len(), 3);
    assert_eq!(logs[0].message, "job started");
    assert_eq!(logs[2].message, "action failed");
    assert!(logs.iter().all(|l| l.correlation_id == Some(correlation_id)));
    assert!(logs.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
}

#[tokio::test]
async fn scheduler_publishes_terminal_events() {
    let store = store().await;
    let events = Arc::new(JobEventBus::new(16));
    let scheduler = Scheduler::new(store, Arc::clone(&events), defaults());
    let mut rx = events.subscribe();

    let job_id = scheduler.enqueue(spec("https://example.com/events", 0)).await.expect("enqueue");
    scheduler
        .claim_next(Uuid::new_v4(), BrowserFamily::Chromium)
        .await
        .expect("claim")
        .expect("job");
    scheduler.report_completed(job_id, &[], &[]).await.expect("complete");

    match rx.recv().await.expect("event delivered") {
        JobEvent::Completed { job_id: seen, status, .. } => {
            assert_eq!(seen, job_id);
            assert_eq!(status, JobStatus::Completed);
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn failed_event_reports_retry_decision() {
    let store = store().await;
    let events = Arc::new(JobEventBus::new(16));
    let scheduler = Scheduler::new(store, Arc::clone(&events), defaults());
    let mut rx = events.subscribe();

    let job_id = scheduler.enqueue(spec("https://example.com/retry-event", 0)).await.expect("enqueue");
    scheduler
        .claim_next(Uuid::new_v4(), BrowserFamily::Chromium)
        .await
        .expect("claim")
        .expect("job");
    scheduler
        .report_failed(job_id, &AutomationError::network("n", "connection reset"))
        .await
        .expect("report");

    match rx.recv().await.expect("event delivered") {
        JobEvent::Failed { will_retry, status, .. } => {
            assert!(will_retry);
            assert_eq!(status, JobStatus::Pending);
        }
        other => panic!("unexpected event: {other:?}"),
    }
}
