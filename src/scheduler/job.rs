//! Job, worker, and log model types
//!
//! These are the records persisted by the store. Transitions go through the
//! scheduler; nothing else mutates a job row.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Job lifecycle status.
///
/// `Completed`, `Failed`, and `Cancelled` are terminal; `completed_at` is set
/// iff the status is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "PROCESSING" => Ok(Self::Processing),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Browser engine family a job targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrowserFamily {
    Chromium,
    Firefox,
    Webkit,
}

impl BrowserFamily {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Chromium => "chromium",
            Self::Firefox => "firefox",
            Self::Webkit => "webkit",
        }
    }
}

impl FromStr for BrowserFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "chromium" | "chrome" => Ok(Self::Chromium),
            "firefox" => Ok(Self::Firefox),
            "webkit" => Ok(Self::Webkit),
            other => Err(format!("unknown browser family: {other}")),
        }
    }
}

impl fmt::Display for BrowserFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Default for BrowserFamily {
    fn default() -> Self {
        Self::Chromium
    }
}

/// Navigation settle condition for the first `goto`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitUntil {
    Load,
    #[serde(rename = "domcontentloaded")]
    DomContentLoaded,
    NetworkIdle,
}

impl Default for WaitUntil {
    fn default() -> Self {
        Self::Load
    }
}

/// One step of a job's action pipeline.
///
/// The set is closed; handlers are looked up by tag in the action registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Action {
    Navigate {
        url: String,
        #[serde(default)]
        wait_until: Option<WaitUntil>,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    Click {
        selector: String,
        #[serde(default)]
        human_like: bool,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    Fill {
        selector: String,
        value: String,
        #[serde(default)]
        human_like: bool,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    Screenshot {
        #[serde(rename = "type", default = "default_screenshot_format")]
        format: String,
        #[serde(default)]
        full_page: bool,
    },
    Evaluate {
        script: String,
    },
    Wait {
        #[serde(default)]
        ms: Option<u64>,
        #[serde(default)]
        selector: Option<String>,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    Extract {
        selector: String,
        #[serde(default)]
        attribute: Option<String>,
        #[serde(default)]
        multiple: bool,
    },
    SolveCaptcha {
        #[serde(default)]
        challenge_hint: Option<String>,
    },
}

fn default_screenshot_format() -> String {
    "png".to_string()
}

impl Action {
    /// Tag used for registry lookup and progress reporting.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Navigate { .. } => "navigate",
            Self::Click { .. } => "click",
            Self::Fill { .. } => "fill",
            Self::Screenshot { .. } => "screenshot",
            Self::Evaluate { .. } => "evaluate",
            Self::Wait { .. } => "wait",
            Self::Extract { .. } => "extract",
            Self::SolveCaptcha { .. } => "solveCaptcha",
        }
    }
}

/// Output of one executed action, accumulated on the job record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionOutput {
    pub action: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Opaque binary artifact captured during execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub content_type: String,
    pub size: usize,
    /// Raw bytes, base64 on the wire
    #[serde(with = "artifact_bytes")]
    pub data: Vec<u8>,
}

mod artifact_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}

/// Cookie applied to a job's context before the first navigation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CookieSpec {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub http_only: bool,
    #[serde(default)]
    pub expires: Option<f64>,
}

/// Seeded browser state applied at job start and cleared at job end.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserStorage {
    #[serde(default)]
    pub cookies: Vec<CookieSpec>,
    #[serde(default)]
    pub local_storage: HashMap<String, String>,
    #[serde(default)]
    pub session_storage: HashMap<String, String>,
}

impl BrowserStorage {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty() && self.local_storage.is_empty() && self.session_storage.is_empty()
    }
}

/// Submission record consumed from the external facade.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    pub target_url: String,
    pub actions: Vec<Action>,
    #[serde(default)]
    pub browser_family: BrowserFamily,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub wait_until: Option<WaitUntil>,
    #[serde(default)]
    pub browser_storage: Option<BrowserStorage>,
}

/// The persisted unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationJob {
    pub id: Uuid,
    pub target_url: String,
    pub actions: Vec<Action>,
    pub browser_family: BrowserFamily,
    pub status: JobStatus,
    pub priority: i64,
    pub retry_count: u32,
    pub max_retries: u32,
    pub timeout_ms: u64,
    pub wait_until: WaitUntil,
    pub browser_storage: BrowserStorage,
    pub result: Vec<ActionOutput>,
    pub artifacts: Vec<Artifact>,
    pub error_message: Option<String>,
    pub current_worker: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Worker liveness status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerStatus {
    Idle,
    Busy,
    Offline,
}

impl WorkerStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Busy => "BUSY",
            Self::Offline => "OFFLINE",
        }
    }
}

impl FromStr for WorkerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "IDLE" => Ok(Self::Idle),
            "BUSY" => Ok(Self::Busy),
            "OFFLINE" => Ok(Self::Offline),
            other => Err(format!("unknown worker status: {other}")),
        }
    }
}

/// A worker process registered in the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserWorker {
    pub id: Uuid,
    pub browser_family: BrowserFamily,
    pub status: WorkerStatus,
    pub current_job_id: Option<Uuid>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub pid: u32,
    pub host: String,
}

/// Log severity for append-only job logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DEBUG" => Ok(Self::Debug),
            "INFO" => Ok(Self::Info),
            "WARN" => Ok(Self::Warn),
            "ERROR" => Ok(Self::Error),
            other => Err(format!("unknown log level: {other}")),
        }
    }
}

/// Append-only log entry tied to a job and a correlation id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobLog {
    pub job_id: Uuid,
    pub level: LogLevel,
    pub message: String,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    pub correlation_id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_tags_round_trip() {
        let json = serde_json::json!({"action": "screenshot", "type": "png"});
        let action: Action = serde_json::from_value(json).expect("screenshot action parses");
        match &action {
            Action::Screenshot { format, full_page } => {
                assert_eq!(format, "png");
                assert!(!full_page);
            }
            other => panic!("unexpected action: {other:?}"),
        }
        assert_eq!(action.name(), "screenshot");
    }

    #[test]
    fn solve_captcha_tag_is_camel_case() {
        let action: Action =
            serde_json::from_value(serde_json::json!({"action": "solveCaptcha"}))
                .expect("solveCaptcha parses");
        assert_eq!(action.name(), "solveCaptcha");
    }

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
    }

    #[test]
    fn browser_family_parses_aliases() {
        assert_eq!("chrome".parse::<BrowserFamily>(), Ok(BrowserFamily::Chromium));
        assert_eq!("WebKit".parse::<BrowserFamily>(), Ok(BrowserFamily::Webkit));
        assert!("opera".parse::<BrowserFamily>().is_err());
    }

    #[test]
    fn artifact_bytes_encode_as_base64() {
        let artifact = Artifact {
            content_type: "image/png".to_string(),
            size: 3,
            data: vec![1, 2, 3],
        };
        let json = serde_json::to_value(&artifact).expect("artifact serializes");
        assert_eq!(json["data"], "AQID");
        let back: Artifact = serde_json::from_value(json).expect("artifact deserializes");
        assert_eq!(back.data, vec![1, 2, 3]);
    }

    #[test]
    fn wait_until_wire_names() {
        assert_eq!(
            serde_json::to_value(WaitUntil::DomContentLoaded).expect("serializes"),
            serde_json::json!("domcontentloaded")
        );
        assert_eq!(
            serde_json::to_value(WaitUntil::NetworkIdle).expect("serializes"),
            serde_json::json!("networkidle")
        );
    }
}
