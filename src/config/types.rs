//! Configuration sections and their defaults.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::scheduler::job::BrowserFamily;

/// Top-level worker configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MillConfig {
    pub scheduler: SchedulerConfig,
    pub pool: PoolConfig,
    pub stealth: StealthConfig,
    pub input: HumanInputConfig,
    pub captcha: CaptchaConfig,
    pub audio: AudioConfig,
}

/// Queue polling, liveness, and retry knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Path of the shared SQLite queue file
    pub database_path: PathBuf,
    /// How often an idle worker polls `claim_next`
    pub poll_interval: Duration,
    /// How often a worker refreshes its heartbeat row
    pub heartbeat_interval: Duration,
    /// A worker with a heartbeat older than this is considered dead
    pub heartbeat_timeout: Duration,
    /// Cadence of the dead-worker reaper
    pub reaper_interval: Duration,
    /// Maximum jobs one worker runs in parallel
    pub max_concurrent_jobs: usize,
    /// Default retry budget for submitted jobs that do not specify one
    pub default_max_retries: u32,
    /// Cap applied to the `retry_count^2` seconds retry backoff
    pub retry_backoff_cap: Duration,
    /// Family assigned to workers without explicit configuration
    pub default_browser_family: BrowserFamily,
    /// Default first-navigation timeout for jobs that do not specify one
    pub default_timeout_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("browsermill.db"),
            poll_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(30),
            reaper_interval: Duration::from_secs(10),
            max_concurrent_jobs: 5,
            default_max_retries: 3,
            retry_backoff_cap: Duration::from_secs(300),
            default_browser_family: BrowserFamily::Chromium,
            default_timeout_ms: 30_000,
        }
    }
}

/// Per-family browser pool sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Instances prewarmed at init
    pub min_size: usize,
    /// Hard cap on concurrent instances per family
    pub max_size: usize,
    /// Close instances parked longer than this
    pub idle_timeout: Duration,
    /// Cadence of the idle-eviction sweep
    pub eviction_interval: Duration,
    /// Bound on how long `acquire` may block waiting for capacity
    pub acquire_timeout: Duration,
    pub headless: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 5,
            idle_timeout: Duration::from_secs(300),
            eviction_interval: Duration::from_secs(30),
            acquire_timeout: Duration::from_secs(60),
            headless: true,
        }
    }
}

/// Which automation markers the stealth layer hides.
///
/// All flags default to on. `hardware_concurrency` is randomized once per
/// context inside the configured range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StealthConfig {
    pub hide_webdriver: bool,
    pub canvas_noise: bool,
    pub webgl_vendor_override: bool,
    pub audio_context_jitter: bool,
    pub mock_battery: bool,
    pub randomize_hardware_concurrency: bool,
    pub static_plugins: bool,
    pub align_languages: bool,
    pub pin_timezone: bool,
    pub hardware_concurrency_range: (u32, u32),
    pub webgl_vendor: String,
    pub webgl_renderer: String,
    pub locale: String,
    pub timezone_id: String,
    pub viewport: (u32, u32),
    /// Abort image/font/media requests unless the job opts in to full loads
    pub block_heavy_assets: bool,
}

impl Default for StealthConfig {
    fn default() -> Self {
        Self {
            hide_webdriver: true,
            canvas_noise: true,
            webgl_vendor_override: true,
            audio_context_jitter: true,
            mock_battery: true,
            randomize_hardware_concurrency: true,
            static_plugins: true,
            align_languages: true,
            pin_timezone: true,
            hardware_concurrency_range: (2, 8),
            webgl_vendor: "Intel Inc.".to_string(),
            webgl_renderer: "Intel(R) UHD Graphics".to_string(),
            locale: "en-US".to_string(),
            timezone_id: "America/New_York".to_string(),
            viewport: (1920, 1080),
            block_heavy_assets: true,
        }
    }
}

/// Timing envelopes for human-like mouse movement and typing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HumanInputConfig {
    pub min_move_steps: u32,
    pub max_move_steps: u32,
    /// Inter-step delay range in milliseconds
    pub step_delay_ms: (u64, u64),
    /// Mean duration of a key press in milliseconds
    pub key_press_mean_ms: f64,
    /// Mean gap between keystrokes in milliseconds
    pub inter_key_mean_ms: f64,
    /// Probability of a longer "thinking" pause between keystrokes
    pub thinking_pause_probability: f64,
    pub click_delay_ms: (u64, u64),
    pub typing_delay_ms: (u64, u64),
}

impl Default for HumanInputConfig {
    fn default() -> Self {
        Self {
            min_move_steps: 12,
            max_move_steps: 28,
            step_delay_ms: (4, 18),
            key_press_mean_ms: 45.0,
            inter_key_mean_ms: 90.0,
            thinking_pause_probability: 0.06,
            click_delay_ms: (500, 2000),
            typing_delay_ms: (50, 150),
        }
    }
}

/// Detection, solver orchestration, and provider HTTP knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptchaConfig {
    /// Consecutive failures before a solver's breaker opens
    pub breaker_failure_threshold: u32,
    /// How long a breaker stays OPEN before the HALF_OPEN trial
    pub breaker_timeout_period: Duration,
    /// Detection memoization TTL
    pub detection_cache_ttl: Duration,
    pub retry_max_attempts: u32,
    pub initial_retry_delay: Duration,
    pub max_retry_delay: Duration,
    /// Overall budget for one orchestrated solve
    pub solve_timeout: Duration,
    pub detection_timeout: Duration,
    pub widget_interaction_timeout: Duration,
    pub audio_transcription_timeout: Duration,
    pub detection_min_confidence: f64,
    pub detection_strong_confidence: f64,
    /// Per-solver concurrent attempt cap
    pub max_concurrency: usize,
    pub provider_max_retries: u32,
    pub provider_timeout: Duration,
    pub provider_rate_limit_per_minute: u32,
    /// Debug screenshot directory; disabled when unset
    pub debug_screenshot_dir: Option<PathBuf>,
    /// Comma-separated key sets for external solver providers
    pub twocaptcha_api_keys: Vec<String>,
    pub anticaptcha_api_keys: Vec<String>,
    /// HMAC secret for Akamai sensor signing (placeholder by default)
    pub akamai_sensor_secret: String,
}

impl Default for CaptchaConfig {
    fn default() -> Self {
        Self {
            breaker_failure_threshold: 3,
            breaker_timeout_period: Duration::from_millis(60_000),
            detection_cache_ttl: Duration::from_millis(300_000),
            retry_max_attempts: 3,
            initial_retry_delay: Duration::from_millis(1_000),
            max_retry_delay: Duration::from_millis(30_000),
            solve_timeout: Duration::from_secs(120),
            detection_timeout: Duration::from_secs(10),
            widget_interaction_timeout: Duration::from_secs(30),
            audio_transcription_timeout: Duration::from_secs(60),
            detection_min_confidence: 0.5,
            detection_strong_confidence: 0.7,
            max_concurrency: 10,
            provider_max_retries: 3,
            provider_timeout: Duration::from_secs(60),
            provider_rate_limit_per_minute: 60,
            debug_screenshot_dir: None,
            twocaptcha_api_keys: Vec::new(),
            anticaptcha_api_keys: Vec::new(),
            akamai_sensor_secret: "browsermill-dev-sensor-secret".to_string(),
        }
    }
}

/// Audio-captcha pipeline knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Provider names in preference order
    pub provider_priority: Vec<String>,
    pub min_confidence: f64,
    pub max_retries: u32,
    pub cache_ttl: Duration,
    pub enable_cache: bool,
    pub rate_limit_per_minute: u32,
    pub temp_dir: PathBuf,
    pub request_timeout: Duration,
    pub google_api_key: Option<String>,
    pub openai_api_key: Option<String>,
    pub azure_api_key: Option<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            provider_priority: vec![
                "google".to_string(),
                "whisper".to_string(),
                "azure".to_string(),
            ],
            min_confidence: 0.7,
            max_retries: 3,
            cache_ttl: Duration::from_secs(24 * 60 * 60),
            enable_cache: true,
            rate_limit_per_minute: 60,
            temp_dir: std::env::temp_dir().join("browsermill-audio"),
            request_timeout: Duration::from_secs(60),
            google_api_key: None,
            openai_api_key: None,
            azure_api_key: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_knobs() {
        let cfg = MillConfig::default();
        assert_eq!(cfg.scheduler.max_concurrent_jobs, 5);
        assert_eq!(cfg.scheduler.heartbeat_timeout, Duration::from_secs(30));
        assert_eq!(cfg.pool.idle_timeout, Duration::from_secs(300));
        assert_eq!(cfg.captcha.breaker_failure_threshold, 3);
        assert_eq!(cfg.captcha.breaker_timeout_period, Duration::from_millis(60_000));
        assert_eq!(cfg.captcha.detection_min_confidence, 0.5);
        assert_eq!(cfg.captcha.detection_strong_confidence, 0.7);
        assert_eq!(cfg.audio.min_confidence, 0.7);
        assert_eq!(cfg.audio.cache_ttl, Duration::from_secs(86_400));
        assert_eq!(cfg.stealth.hardware_concurrency_range, (2, 8));
    }
}
