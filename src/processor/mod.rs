//! Per-worker job execution loop (C4).
//!
//! Polls the scheduler at ~1 Hz under an in-flight cap, and for each claimed
//! job: opens a correlation scope, leases a pooled browser, builds an
//! isolated stealth context, seeds the job's browser storage, runs the
//! action pipeline sequentially on one shared page with progress events and
//! cancellation checks, then reports the terminal status. Cleanup (clearing
//! storage, closing the page and context, returning the browser) runs on
//! every exit path and treats individual failures as non-fatal.

pub mod actions;

pub use actions::{ActionContext, ActionEffect, ActionHandler, ActionRegistry};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::browser::BrowserPool;
use crate::config::MillConfig;
use crate::context::{ContextOptions, JobContext};
use crate::correlation;
use crate::error::AutomationError;
use crate::events::JobEvent;
use crate::scheduler::job::{
    ActionOutput, Artifact, AutomationJob, JobLog, LogLevel, WaitUntil, WorkerStatus,
};
use crate::scheduler::{FailureDisposition, Scheduler};

/// Why a job execution ended without a success.
enum ExecEnd {
    Cancelled,
    Failed(AutomationError),
}

impl From<AutomationError> for ExecEnd {
    fn from(error: AutomationError) -> Self {
        Self::Failed(error)
    }
}

/// The per-worker execution loop.
pub struct JobProcessor {
    scheduler: Arc<Scheduler>,
    pool: Arc<BrowserPool>,
    registry: Arc<ActionRegistry>,
    config: MillConfig,
    worker_id: Uuid,
    in_flight: Arc<Semaphore>,
    active_jobs: Arc<AtomicUsize>,
}

impl JobProcessor {
    #[must_use]
    pub fn new(
        scheduler: Arc<Scheduler>,
        pool: Arc<BrowserPool>,
        registry: Arc<ActionRegistry>,
        config: MillConfig,
        worker_id: Uuid,
    ) -> Arc<Self> {
        let cap = config.scheduler.max_concurrent_jobs.max(1);
        Arc::new(Self {
            scheduler,
            pool,
            registry,
            config,
            worker_id,
            in_flight: Arc::new(Semaphore::new(cap)),
            active_jobs: Arc::new(AtomicUsize::new(0)),
        })
    }

    #[must_use]
    pub fn worker_id(&self) -> Uuid {
        self.worker_id
    }

    #[must_use]
    pub fn active_jobs(&self) -> usize {
        self.active_jobs.load(Ordering::Relaxed)
    }

    /// Poll-and-dispatch loop; runs until the task is aborted.
    pub async fn run(self: Arc<Self>) {
        let family = self.config.scheduler.default_browser_family;
        let mut interval = tokio::time::interval(self.config.scheduler.poll_interval);
        info!(worker_id = %self.worker_id, %family, "Job processor started");

        loop {
            interval.tick().await;

            // Stop polling while the in-flight set is full
            let Ok(permit) = Arc::clone(&self.in_flight).try_acquire_owned() else {
                continue;
            };

            match self.scheduler.claim_next(self.worker_id, family).await {
                Ok(Some(job)) => {
                    let processor = Arc::clone(&self);
                    processor.active_jobs.fetch_add(1, Ordering::Relaxed);
                    tokio::spawn(async move {
                        let job_id = job.id;
                        processor.process_job(job).await;
                        let remaining = processor.active_jobs.fetch_sub(1, Ordering::Relaxed) - 1;
                        if remaining == 0 {
                            if let Err(e) = processor
                                .scheduler
                                .store()
                                .set_worker_state(processor.worker_id, WorkerStatus::Idle, None)
                                .await
                            {
                                warn!(job_id = %job_id, "Failed to mark worker idle: {e}");
                            }
                        }
                        drop(permit);
                    });
                }
                Ok(None) => drop(permit),
                Err(e) => {
                    error!("claim_next failed: {e}");
                    drop(permit);
                }
            }
        }
    }

    /// Execute one claimed job inside a fresh correlation scope.
    pub async fn process_job(self: &Arc<Self>, job: AutomationJob) {
        correlation::run_in_scope(None, "job", async {
            let correlation_id = correlation::current_id().unwrap_or_else(Uuid::new_v4);
            correlation::add_additional_context("job_id", &job.id.to_string());
            self.scheduler
                .events()
                .publish(JobEvent::started(job.id, correlation_id));
            self.log(job.id, LogLevel::Info, "job started", correlation_id).await;

            let started = Instant::now();
            let outcome = self.execute_job(&job).await;
            correlation::add_timing(started, Instant::now());

            match outcome {
                Ok((result, artifacts)) => {
                    match self
                        .scheduler
                        .report_completed(job.id, &result, &artifacts)
                        .await
                    {
                        Ok(true) => {
                            self.log(job.id, LogLevel::Info, "job completed", correlation_id).await;
                        }
                        Ok(false) => {
                            // Raced with an external cancel; nothing to record
                            debug!(job_id = %job.id, "Completion ignored, job already terminal");
                        }
                        Err(e) => error!(job_id = %job.id, "Failed to persist completion: {e}"),
                    }
                }
                Err(ExecEnd::Cancelled) => {
                    self.scheduler.events().publish(JobEvent::cancelled(job.id));
                    self.log(job.id, LogLevel::Warn, "job cancelled", correlation_id).await;
                }
                Err(ExecEnd::Failed(error)) => {
                    let error = error.with_correlation(correlation_id);
                    self.log(
                        job.id,
                        LogLevel::Error,
                        &format!("job failed: {error}"),
                        correlation_id,
                    )
                    .await;
                    match self.scheduler.report_failed(job.id, &error).await {
                        Ok(FailureDisposition::Retried { attempt, backoff }) => {
                            debug!(job_id = %job.id, attempt, ?backoff, "Job requeued");
                        }
                        Ok(_) => {}
                        Err(e) => error!(job_id = %job.id, "Failed to persist failure: {e}"),
                    }
                }
            }
        })
        .await;
    }

    /// Acquire browser, build context, run the pipeline, always clean up.
    async fn execute_job(
        &self,
        job: &AutomationJob,
    ) -> Result<(Vec<ActionOutput>, Vec<Artifact>), ExecEnd> {
        let guard = self
            .pool
            .acquire(job.browser_family)
            .await
            .map_err(ExecEnd::Failed)?;

        let mut context = JobContext::create(
            guard.browser(),
            &self.config.stealth,
            &ContextOptions {
                viewport: self.config.stealth.viewport,
                ..ContextOptions::default()
            },
        )
        .await
        .map_err(|e| ExecEnd::Failed(AutomationError::classify(&e)))?;

        // Watcher flips the shared flag on external cancellation so long
        // solver loops stop between attempts, not just between actions.
        let cancelled = Arc::new(AtomicBool::new(false));
        let watcher = {
            let store = self.scheduler.store().clone();
            let flag = Arc::clone(&cancelled);
            let job_id = job.id;
            let poll = self.config.scheduler.poll_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(poll);
                loop {
                    ticker.tick().await;
                    if matches!(store.is_cancelled(job_id).await, Ok(true)) {
                        flag.store(true, Ordering::Relaxed);
                        break;
                    }
                }
            })
        };

        let run = self.run_pipeline(job, &context, &cancelled).await;
        watcher.abort();

        // Cleanup runs on every exit path; individual failures are logged
        // and skipped so the browser always returns to the pool.
        if let Err(e) = context.clear_cookies().await {
            warn!(job_id = %job.id, "Cookie cleanup failed: {e:#}");
        }
        if let Err(e) = context.clear_web_storage().await {
            warn!(job_id = %job.id, "Web storage cleanup failed: {e:#}");
        }
        context.close(guard.browser()).await;
        drop(guard);

        run
    }

    /// Seed storage, navigate, and walk the action list on the shared page.
    async fn run_pipeline(
        &self,
        job: &AutomationJob,
        context: &JobContext,
        cancelled: &Arc<AtomicBool>,
    ) -> Result<(Vec<ActionOutput>, Vec<Artifact>), ExecEnd> {
        context
            .apply_cookies(&job.browser_storage.cookies, &job.target_url)
            .await
            .map_err(|e| ExecEnd::Failed(AutomationError::classify(&e)))?;

        context
            .navigate(
                &job.target_url,
                job.wait_until,
                Duration::from_millis(job.timeout_ms),
            )
            .await
            .map_err(|e| ExecEnd::Failed(AutomationError::classify(&e)))?;

        context
            .apply_web_storage(&job.browser_storage)
            .await
            .map_err(|e| ExecEnd::Failed(AutomationError::classify(&e)))?;

        let total = job.actions.len();
        let mut outputs = Vec::with_capacity(total);
        let mut artifacts = Vec::new();

        for (index, action) in job.actions.iter().enumerate() {
            if self.check_cancelled(job.id, cancelled).await? {
                return Err(ExecEnd::Cancelled);
            }

            let handler = self.registry.lookup(action.name()).ok_or_else(|| {
                ExecEnd::Failed(AutomationError::invalid_input(
                    "unknown_action",
                    format!("no handler registered for {:?}", action.name()),
                ))
            })?;

            let ctx = ActionContext {
                page: context.page(),
                job_context: context,
                job_id: job.id,
                cancelled: Arc::clone(cancelled),
                input: &self.config.input,
                default_timeout: Duration::from_millis(self.config.scheduler.default_timeout_ms),
                default_wait_until: WaitUntil::Load,
            };

            let started = Instant::now();
            match handler.execute(&ctx, action).await {
                Ok(effect) => {
                    outputs.push(ActionOutput {
                        action: action.name().to_string(),
                        success: true,
                        data: effect.data,
                        error: None,
                        duration_ms: started.elapsed().as_millis() as u64,
                    });
                    if let Some(artifact) = effect.artifact {
                        artifacts.push(artifact);
                    }
                    self.scheduler
                        .events()
                        .publish(JobEvent::progress(job.id, index + 1, total));
                }
                Err(error) => {
                    outputs.push(ActionOutput {
                        action: action.name().to_string(),
                        success: false,
                        data: None,
                        error: Some(error.message.clone()),
                        duration_ms: started.elapsed().as_millis() as u64,
                    });
                    return Err(ExecEnd::Failed(error));
                }
            }
        }

        Ok((outputs, artifacts))
    }

    /// Cancellation check between actions; sets the shared flag so an
    /// in-flight solver loop stops as well.
    async fn check_cancelled(
        &self,
        job_id: Uuid,
        flag: &Arc<AtomicBool>,
    ) -> Result<bool, ExecEnd> {
        if flag.load(Ordering::Relaxed) {
            return Ok(true);
        }
        match self.scheduler.store().is_cancelled(job_id).await {
            Ok(true) => {
                flag.store(true, Ordering::Relaxed);
                Ok(true)
            }
            Ok(false) => Ok(false),
            Err(e) => {
                // A flaky store read should not kill the job
                warn!(job_id = %job_id, "Cancellation check failed: {e}");
                Ok(false)
            }
        }
    }

    async fn log(&self, job_id: Uuid, level: LogLevel, message: &str, correlation_id: Uuid) {
        let entry = JobLog {
            job_id,
            level,
            message: message.to_string(),
            metadata: None,
            correlation_id: Some(correlation_id),
            timestamp: chrono::Utc::now(),
        };
        if let Err(e) = self.scheduler.store().append_log(&entry).await {
            warn!(job_id = %job_id, "Failed to append job log: {e}");
        }
    }
}
