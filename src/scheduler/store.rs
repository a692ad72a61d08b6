//! Persistent job queue and worker registry over SQLite.
//!
//! Uses WAL mode so readers do not block the single writer. The atomic claim
//! is one `UPDATE … RETURNING` against the highest-priority, oldest PENDING
//! row inside a transaction: SQLite's single-writer property guarantees that
//! two workers racing on `claim_next` cannot both flip the same row, which is
//! the at-most-once dispatch the platform contracts.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::error::{AutomationError, AutomationResult};

use super::job::{
    Action, ActionOutput, Artifact, AutomationJob, BrowserFamily, BrowserStorage, BrowserWorker,
    JobLog, JobSpec, JobStatus, LogLevel, WaitUntil, WorkerStatus,
};

/// SQL schema for the queue database
const SCHEMA_SQL: &str = r#"
-- Jobs: the persistent work queue
CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY,
    target_url TEXT NOT NULL,
    actions TEXT NOT NULL,
    browser_family TEXT NOT NULL,
    status TEXT NOT NULL,
    priority INTEGER NOT NULL DEFAULT 0,
    retry_count INTEGER NOT NULL DEFAULT 0,
    max_retries INTEGER NOT NULL DEFAULT 3,
    timeout_ms INTEGER NOT NULL,
    wait_until TEXT NOT NULL,
    browser_storage TEXT,
    result TEXT,
    artifacts TEXT,
    error_message TEXT,
    current_worker TEXT,
    not_before INTEGER,
    created_at INTEGER NOT NULL,
    started_at INTEGER,
    completed_at INTEGER
);

-- Dispatch order: highest priority first, oldest first within a priority
CREATE INDEX IF NOT EXISTS idx_jobs_dispatch ON jobs(status, priority DESC, created_at ASC);

-- Append-only job logs
CREATE TABLE IF NOT EXISTS job_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id TEXT NOT NULL,
    level TEXT NOT NULL,
    message TEXT NOT NULL,
    metadata TEXT,
    correlation_id TEXT,
    timestamp INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_job_logs_job ON job_logs(job_id);

-- Registered worker processes
CREATE TABLE IF NOT EXISTS workers (
    id TEXT PRIMARY KEY,
    browser_family TEXT NOT NULL,
    status TEXT NOT NULL,
    current_job_id TEXT,
    last_heartbeat_at INTEGER NOT NULL,
    pid INTEGER NOT NULL,
    host TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_workers_status ON workers(status);
CREATE INDEX IF NOT EXISTS idx_workers_heartbeat ON workers(last_heartbeat_at);
"#;

/// Outcome of reporting a failure to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Job went back to PENDING with backoff applied
    Retried { attempt: u32, backoff: Duration },
    /// Retries exhausted or error not recoverable
    Failed,
    /// Job was already terminal (e.g. cancelled mid-flight)
    AlreadyTerminal,
}

/// Shared handle to the queue database.
#[derive(Clone)]
pub struct JobStore {
    pool: SqlitePool,
}

impl JobStore {
    /// Open (creating if missing) the queue database at `path`.
    pub async fn open(path: &Path) -> AutomationResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Self::init_schema(&pool).await?;
        info!("Job store opened at {}", path.display());
        Ok(Self { pool })
    }

    /// Open an isolated in-memory store (test and embedded use).
    pub async fn open_in_memory() -> AutomationResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| AutomationError::internal("store_open", e.to_string()))?;
        // A single connection so every query sees the same in-memory database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Self::init_schema(&pool).await?;
        Ok(Self { pool })
    }

    async fn init_schema(pool: &SqlitePool) -> AutomationResult<()> {
        sqlx::raw_sql(SCHEMA_SQL).execute(pool).await?;
        Ok(())
    }

    // =========================================================================
    // Jobs
    // =========================================================================

    /// Insert a new PENDING job, filling unset fields from scheduler defaults.
    pub async fn enqueue(&self, spec: JobSpec, defaults: &SchedulerConfig) -> AutomationResult<Uuid> {
        if spec.target_url.is_empty() || url::Url::parse(&spec.target_url).is_err() {
            return Err(AutomationError::invalid_input(
                "bad_target_url",
                format!("not a valid URL: {:?}", spec.target_url),
            ));
        }

        let id = Uuid::new_v4();
        let actions = serde_json::to_string(&spec.actions)
            .map_err(|e| AutomationError::invalid_input("bad_actions", e.to_string()))?;
        let storage = spec
            .browser_storage
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| AutomationError::invalid_input("bad_storage", e.to_string()))?;
        let wait_until = spec.wait_until.unwrap_or_default();

        sqlx::query(
            "INSERT INTO jobs (id, target_url, actions, browser_family, status, priority, \
             retry_count, max_retries, timeout_ms, wait_until, browser_storage, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, 0, ?, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(&spec.target_url)
        .bind(actions)
        .bind(spec.browser_family.as_str())
        .bind(JobStatus::Pending.as_str())
        .bind(spec.priority)
        .bind(i64::from(spec.max_retries.unwrap_or(defaults.default_max_retries)))
        .bind(spec.timeout_ms.unwrap_or(defaults.default_timeout_ms) as i64)
        .bind(wait_until_str(wait_until))
        .bind(storage)
        .bind(now_millis())
        .execute(&self.pool)
        .await?;

        debug!(job_id = %id, "Job enqueued");
        Ok(id)
    }

    /// Fetch the full job view.
    pub async fn get_job(&self, id: Uuid) -> AutomationResult<Option<AutomationJob>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| job_from_row(&r)).transpose()
    }

    /// Atomically claim the next dispatchable job for `worker_id`.
    ///
    /// Dispatch order is priority DESC, created_at ASC; rows with a pending
    /// retry backoff (`not_before` in the future) are skipped. Returns `None`
    /// when the queue has nothing eligible.
    pub async fn claim_next(
        &self,
        worker_id: Uuid,
        family: BrowserFamily,
    ) -> AutomationResult<Option<AutomationJob>> {
        let now = now_millis();
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "UPDATE jobs SET status = 'PROCESSING', started_at = ?, current_worker = ? \
             WHERE id = ( \
                 SELECT id FROM jobs \
                 WHERE status = 'PENDING' AND browser_family = ? \
                   AND (not_before IS NULL OR not_before <= ?) \
                 ORDER BY priority DESC, created_at ASC \
                 LIMIT 1 \
             ) \
             RETURNING *",
        )
        .bind(now)
        .bind(worker_id.to_string())
        .bind(family.as_str())
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        tx.commit().await?;

        match row {
            Some(row) => {
                let job = job_from_row(&row)?;
                debug!(job_id = %job.id, worker_id = %worker_id, "Job claimed");
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    /// Record success. Replaying on a terminal job is a no-op (returns false).
    pub async fn mark_completed(
        &self,
        id: Uuid,
        result: &[ActionOutput],
        artifacts: &[Artifact],
    ) -> AutomationResult<bool> {
        let result_json = serde_json::to_string(result)
            .map_err(|e| AutomationError::internal("encode_result", e.to_string()))?;
        let artifacts_json = serde_json::to_string(artifacts)
            .map_err(|e| AutomationError::internal("encode_artifacts", e.to_string()))?;

        let updated = sqlx::query(
            "UPDATE jobs SET status = 'COMPLETED', result = ?, artifacts = ?, \
             completed_at = ?, current_worker = NULL \
             WHERE id = ? AND status = 'PROCESSING'",
        )
        .bind(result_json)
        .bind(artifacts_json)
        .bind(now_millis())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(updated > 0)
    }

    /// Record a failure, deciding retry vs terminal failure.
    ///
    /// Retryable errors with budget left go back to PENDING with a backoff of
    /// `retry_count²` seconds (capped); anything else becomes FAILED.
    pub async fn mark_failed(
        &self,
        id: Uuid,
        error: &AutomationError,
        backoff_cap: Duration,
    ) -> AutomationResult<FailureDisposition> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT status, retry_count, max_retries FROM jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            tx.commit().await?;
            return Err(AutomationError::invalid_input(
                "unknown_job",
                format!("no such job: {id}"),
            ));
        };

        let status: String = row.get("status");
        if JobStatus::from_str(&status).map(JobStatus::is_terminal).unwrap_or(false) {
            tx.commit().await?;
            return Ok(FailureDisposition::AlreadyTerminal);
        }

        let retry_count: i64 = row.get("retry_count");
        let max_retries: i64 = row.get("max_retries");

        let disposition = if error.recoverable && retry_count < max_retries {
            let attempt = (retry_count + 1) as u32;
            let backoff = Duration::from_secs(u64::from(attempt) * u64::from(attempt)).min(backoff_cap);
            sqlx::query(
                "UPDATE jobs SET status = 'PENDING', retry_count = ?, started_at = NULL, \
                 current_worker = NULL, not_before = ?, error_message = ? \
                 WHERE id = ?",
            )
            .bind(i64::from(attempt))
            .bind(now_millis() + backoff.as_millis() as i64)
            .bind(&error.message)
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
            FailureDisposition::Retried { attempt, backoff }
        } else {
            sqlx::query(
                "UPDATE jobs SET status = 'FAILED', error_message = ?, completed_at = ?, \
                 current_worker = NULL \
                 WHERE id = ?",
            )
            .bind(format!("{error}"))
            .bind(now_millis())
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
            FailureDisposition::Failed
        };

        tx.commit().await?;
        Ok(disposition)
    }

    /// Cancel a job that is still PENDING or PROCESSING.
    ///
    /// Returns false when the job was already terminal.
    pub async fn cancel(&self, id: Uuid) -> AutomationResult<bool> {
        let updated = sqlx::query(
            "UPDATE jobs SET status = 'CANCELLED', completed_at = ?, current_worker = NULL \
             WHERE id = ? AND status IN ('PENDING', 'PROCESSING')",
        )
        .bind(now_millis())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated > 0)
    }

    /// Whether a cancellation has been recorded for this job.
    pub async fn is_cancelled(&self, id: Uuid) -> AutomationResult<bool> {
        let row = sqlx::query("SELECT status FROM jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row
            .map(|r| r.get::<String, _>("status") == "CANCELLED")
            .unwrap_or(false))
    }

    /// Count jobs currently in `status` (monitoring and tests).
    pub async fn count_by_status(&self, status: JobStatus) -> AutomationResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM jobs WHERE status = ?")
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }

    // =========================================================================
    // Workers
    // =========================================================================

    /// Insert or refresh a worker registration.
    pub async fn register_worker(&self, worker: &BrowserWorker) -> AutomationResult<()> {
        sqlx::query(
            "INSERT INTO workers (id, browser_family, status, current_job_id, last_heartbeat_at, pid, host) \
             VALUES (?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET browser_family = excluded.browser_family, \
                 status = excluded.status, last_heartbeat_at = excluded.last_heartbeat_at, \
                 pid = excluded.pid, host = excluded.host",
        )
        .bind(worker.id.to_string())
        .bind(worker.browser_family.as_str())
        .bind(worker.status.as_str())
        .bind(worker.current_job_id.map(|id| id.to_string()))
        .bind(worker.last_heartbeat_at.timestamp_millis())
        .bind(i64::from(worker.pid))
        .bind(&worker.host)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Refresh a worker's liveness timestamp.
    pub async fn heartbeat(&self, worker_id: Uuid) -> AutomationResult<()> {
        sqlx::query("UPDATE workers SET last_heartbeat_at = ? WHERE id = ?")
            .bind(now_millis())
            .bind(worker_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Flip a worker between IDLE and BUSY, tracking its current job.
    pub async fn set_worker_state(
        &self,
        worker_id: Uuid,
        status: WorkerStatus,
        current_job_id: Option<Uuid>,
    ) -> AutomationResult<()> {
        sqlx::query("UPDATE workers SET status = ?, current_job_id = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(current_job_id.map(|id| id.to_string()))
            .bind(worker_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Workers that are not OFFLINE.
    pub async fn list_active_workers(&self) -> AutomationResult<Vec<BrowserWorker>> {
        let rows = sqlx::query("SELECT * FROM workers WHERE status != 'OFFLINE'")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(worker_from_row).collect()
    }

    /// Force-offline workers with stale heartbeats and requeue their jobs.
    ///
    /// The requeued job keeps its retry count: a worker crash is not the
    /// job's fault. Returns `(worker_id, requeued_job_id)` pairs.
    pub async fn reap_dead_workers(
        &self,
        heartbeat_timeout: Duration,
    ) -> AutomationResult<Vec<(Uuid, Option<Uuid>)>> {
        let cutoff = now_millis() - heartbeat_timeout.as_millis() as i64;
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(
            "UPDATE workers SET status = 'OFFLINE', current_job_id = NULL \
             WHERE status != 'OFFLINE' AND last_heartbeat_at < ? \
             RETURNING id, current_job_id",
        )
        .bind(cutoff)
        .fetch_all(&mut *tx)
        .await?;

        let mut reaped = Vec::with_capacity(rows.len());
        for row in rows {
            let worker_id = parse_uuid(row.get::<String, _>("id"))?;
            let job_id = row
                .get::<Option<String>, _>("current_job_id")
                .map(parse_uuid)
                .transpose()?;

            if let Some(job_id) = job_id {
                let requeued = sqlx::query(
                    "UPDATE jobs SET status = 'PENDING', started_at = NULL, current_worker = NULL \
                     WHERE id = ? AND status = 'PROCESSING'",
                )
                .bind(job_id.to_string())
                .execute(&mut *tx)
                .await?
                .rows_affected();
                if requeued > 0 {
                    warn!(worker_id = %worker_id, job_id = %job_id, "Requeued job from dead worker");
                }
            }
            reaped.push((worker_id, job_id));
        }

        tx.commit().await?;
        Ok(reaped)
    }

    // =========================================================================
    // Job logs
    // =========================================================================

    /// Append a log entry; entries are never mutated.
    pub async fn append_log(&self, log: &JobLog) -> AutomationResult<()> {
        let metadata = log
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| AutomationError::internal("encode_log_metadata", e.to_string()))?;

        sqlx::query(
            "INSERT INTO job_logs (job_id, level, message, metadata, correlation_id, timestamp) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(log.job_id.to_string())
        .bind(log.level.as_str())
        .bind(&log.message)
        .bind(metadata)
        .bind(log.correlation_id.map(|id| id.to_string()))
        .bind(log.timestamp.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// All log entries for a job, oldest first.
    pub async fn logs_for_job(&self, job_id: Uuid) -> AutomationResult<Vec<JobLog>> {
        let rows = sqlx::query(
            "SELECT * FROM job_logs WHERE job_id = ? ORDER BY timestamp ASC, id ASC",
        )
        .bind(job_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(log_from_row).collect()
    }
}

// =============================================================================
// Row mapping
// =============================================================================

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

fn wait_until_str(wait_until: WaitUntil) -> &'static str {
    match wait_until {
        WaitUntil::Load => "load",
        WaitUntil::DomContentLoaded => "domcontentloaded",
        WaitUntil::NetworkIdle => "networkidle",
    }
}

fn parse_uuid(raw: String) -> AutomationResult<Uuid> {
    Uuid::parse_str(&raw)
        .map_err(|e| AutomationError::internal("bad_uuid", format!("{raw}: {e}")))
}

fn job_from_row(row: &SqliteRow) -> AutomationResult<AutomationJob> {
    let actions: Vec<Action> = serde_json::from_str(&row.get::<String, _>("actions"))
        .map_err(|e| AutomationError::internal("decode_actions", e.to_string()))?;
    let browser_storage: BrowserStorage = row
        .get::<Option<String>, _>("browser_storage")
        .map(|raw| serde_json::from_str(&raw))
        .transpose()
        .map_err(|e| AutomationError::internal("decode_storage", e.to_string()))?
        .unwrap_or_default();
    let result: Vec<ActionOutput> = row
        .get::<Option<String>, _>("result")
        .map(|raw| serde_json::from_str(&raw))
        .transpose()
        .map_err(|e| AutomationError::internal("decode_result", e.to_string()))?
        .unwrap_or_default();
    let artifacts: Vec<Artifact> = row
        .get::<Option<String>, _>("artifacts")
        .map(|raw| serde_json::from_str(&raw))
        .transpose()
        .map_err(|e| AutomationError::internal("decode_artifacts", e.to_string()))?
        .unwrap_or_default();

    let wait_until = match row.get::<String, _>("wait_until").as_str() {
        "domcontentloaded" => WaitUntil::DomContentLoaded,
        "networkidle" => WaitUntil::NetworkIdle,
        _ => WaitUntil::Load,
    };

    Ok(AutomationJob {
        id: parse_uuid(row.get("id"))?,
        target_url: row.get("target_url"),
        actions,
        browser_family: BrowserFamily::from_str(&row.get::<String, _>("browser_family"))
            .map_err(|e| AutomationError::internal("decode_family", e))?,
        status: JobStatus::from_str(&row.get::<String, _>("status"))
            .map_err(|e| AutomationError::internal("decode_status", e))?,
        priority: row.get("priority"),
        retry_count: row.get::<i64, _>("retry_count") as u32,
        max_retries: row.get::<i64, _>("max_retries") as u32,
        timeout_ms: row.get::<i64, _>("timeout_ms") as u64,
        wait_until,
        browser_storage,
        result,
        artifacts,
        error_message: row.get("error_message"),
        current_worker: row
            .get::<Option<String>, _>("current_worker")
            .map(parse_uuid)
            .transpose()?,
        created_at: millis_to_datetime(row.get("created_at")),
        started_at: row.get::<Option<i64>, _>("started_at").map(millis_to_datetime),
        completed_at: row.get::<Option<i64>, _>("completed_at").map(millis_to_datetime),
    })
}

fn worker_from_row(row: &SqliteRow) -> AutomationResult<BrowserWorker> {
    Ok(BrowserWorker {
        id: parse_uuid(row.get("id"))?,
        browser_family: BrowserFamily::from_str(&row.get::<String, _>("browser_family"))
            .map_err(|e| AutomationError::internal("decode_family", e))?,
        status: WorkerStatus::from_str(&row.get::<String, _>("status"))
            .map_err(|e| AutomationError::internal("decode_worker_status", e))?,
        current_job_id: row
            .get::<Option<String>, _>("current_job_id")
            .map(parse_uuid)
            .transpose()?,
        last_heartbeat_at: millis_to_datetime(row.get("last_heartbeat_at")),
        pid: row.get::<i64, _>("pid") as u32,
        host: row.get("host"),
    })
}

fn log_from_row(row: &SqliteRow) -> AutomationResult<JobLog> {
    Ok(JobLog {
        job_id: parse_uuid(row.get("job_id"))?,
        level: LogLevel::from_str(&row.get::<String, _>("level"))
            .map_err(|e| AutomationError::internal("decode_log_level", e))?,
        message: row.get("message"),
        metadata: row
            .get::<Option<String>, _>("metadata")
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .map_err(|e| AutomationError::internal("decode_log_metadata", e.to_string()))?,
        correlation_id: row
            .get::<Option<String>, _>("correlation_id")
            .map(parse_uuid)
            .transpose()?,
        timestamp: millis_to_datetime(row.get("timestamp")),
    })
}
