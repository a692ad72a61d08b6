//! Job scheduler and worker registry
//!
//! The scheduler owns every job state transition: submission, locked
//! dispatch, completion, retry-with-backoff, cancellation, and the
//! dead-worker reaper that requeues orphaned jobs. Workers interact with it
//! through `claim_next` polling and heartbeats; external consumers observe
//! transitions on the job event bus.

pub mod job;
pub mod store;

pub use job::{
    Action, ActionOutput, Artifact, AutomationJob, BrowserFamily, BrowserStorage, BrowserWorker,
    CookieSpec, JobLog, JobSpec, JobStatus, LogLevel, WaitUntil, WorkerStatus,
};
pub use store::{FailureDisposition, JobStore};

use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::error::{AutomationError, AutomationResult};
use crate::events::{JobEvent, JobEventBus};

/// Facade combining the store, the event stream, and liveness housekeeping.
pub struct Scheduler {
    store: JobStore,
    events: Arc<JobEventBus>,
    config: SchedulerConfig,
}

impl Scheduler {
    #[must_use]
    pub fn new(store: JobStore, events: Arc<JobEventBus>, config: SchedulerConfig) -> Self {
        Self { store, events, config }
    }

    #[must_use]
    pub fn store(&self) -> &JobStore {
        &self.store
    }

    #[must_use]
    pub fn events(&self) -> &Arc<JobEventBus> {
        &self.events
    }

    #[must_use]
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Submit a job; returns its id.
    pub async fn enqueue(&self, spec: JobSpec) -> AutomationResult<Uuid> {
        self.store.enqueue(spec, &self.config).await
    }

    /// Claim the next dispatchable job for `worker_id`, flipping the worker
    /// BUSY on success.
    pub async fn claim_next(
        &self,
        worker_id: Uuid,
        family: BrowserFamily,
    ) -> AutomationResult<Option<AutomationJob>> {
        let claimed = self.store.claim_next(worker_id, family).await?;
        if let Some(job) = &claimed {
            self.store
                .set_worker_state(worker_id, WorkerStatus::Busy, Some(job.id))
                .await?;
        }
        Ok(claimed)
    }

    /// Record success and publish `job.completed`.
    pub async fn report_completed(
        &self,
        job_id: Uuid,
        result: &[ActionOutput],
        artifacts: &[Artifact],
    ) -> AutomationResult<bool> {
        let transitioned = self.store.mark_completed(job_id, result, artifacts).await?;
        if transitioned {
            self.events.publish(JobEvent::completed(job_id));
        } else {
            debug!(job_id = %job_id, "mark_completed replay ignored (job already terminal)");
        }
        Ok(transitioned)
    }

    /// Record a failure, publish `job.failed`, and return the disposition.
    pub async fn report_failed(
        &self,
        job_id: Uuid,
        error: &AutomationError,
    ) -> AutomationResult<FailureDisposition> {
        let disposition = self
            .store
            .mark_failed(job_id, error, self.config.retry_backoff_cap)
            .await?;
        match disposition {
            FailureDisposition::Retried { attempt, backoff } => {
                info!(job_id = %job_id, attempt, ?backoff, "Job scheduled for retry");
                self.events
                    .publish(JobEvent::failed(job_id, &error.message, true));
            }
            FailureDisposition::Failed => {
                warn!(job_id = %job_id, category = %error.category, "Job failed terminally");
                self.events
                    .publish(JobEvent::failed(job_id, &error.message, false));
            }
            FailureDisposition::AlreadyTerminal => {}
        }
        Ok(disposition)
    }

    /// Cancel a PENDING or PROCESSING job and publish `job.cancelled`.
    pub async fn cancel(&self, job_id: Uuid) -> AutomationResult<bool> {
        let cancelled = self.store.cancel(job_id).await?;
        if cancelled {
            self.events.publish(JobEvent::cancelled(job_id));
        }
        Ok(cancelled)
    }

    /// Register this process as a worker.
    pub async fn register_worker(
        &self,
        worker_id: Uuid,
        family: BrowserFamily,
    ) -> AutomationResult<()> {
        let worker = BrowserWorker {
            id: worker_id,
            browser_family: family,
            status: WorkerStatus::Idle,
            current_job_id: None,
            last_heartbeat_at: Utc::now(),
            pid: std::process::id(),
            host: hostname(),
        };
        self.store.register_worker(&worker).await
    }

    /// Background task refreshing this worker's heartbeat.
    pub fn spawn_heartbeat(self: &Arc<Self>, worker_id: Uuid) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(scheduler.config.heartbeat_interval);
            loop {
                interval.tick().await;
                if let Err(e) = scheduler.store.heartbeat(worker_id).await {
                    error!(worker_id = %worker_id, "Heartbeat write failed: {e}");
                }
            }
        })
    }

    /// Background task marking dead workers OFFLINE and requeuing their jobs.
    ///
    /// Keeps the invariant that no job stays PROCESSING under an OFFLINE
    /// worker longer than `heartbeat_timeout + reaper_interval`.
    pub fn spawn_reaper(self: &Arc<Self>) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(scheduler.config.reaper_interval);
            loop {
                interval.tick().await;
                match scheduler
                    .store
                    .reap_dead_workers(scheduler.config.heartbeat_timeout)
                    .await
                {
                    Ok(reaped) if !reaped.is_empty() => {
                        info!("Reaper forced {} stale workers offline", reaped.len());
                    }
                    Ok(_) => {}
                    Err(e) => error!("Worker reaper pass failed: {e}"),
                }
            }
        })
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}
