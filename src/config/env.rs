//! Environment-variable configuration loading.
//!
//! Every recognized variable overlays the corresponding default; unset or
//! unparseable values fall back silently except for malformed durations,
//! which log a warning so typos in deployments are visible.

use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::scheduler::job::BrowserFamily;

use super::types::MillConfig;

/// Lookup function abstraction so tests can inject variables without
/// touching process environment.
pub type EnvLookup<'a> = &'a dyn Fn(&str) -> Option<String>;

impl MillConfig {
    /// Load configuration from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(&|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary lookup function.
    #[must_use]
    pub fn from_lookup(lookup: EnvLookup<'_>) -> Self {
        let mut cfg = Self::default();

        // Captcha orchestration knobs
        set_parsed(lookup, "CAPTCHA_CIRCUIT_BREAKER_FAILURE_THRESHOLD", &mut cfg.captcha.breaker_failure_threshold);
        set_millis(lookup, "CAPTCHA_CIRCUIT_BREAKER_TIMEOUT_PERIOD", &mut cfg.captcha.breaker_timeout_period);
        set_millis(lookup, "CAPTCHA_CACHE_TTL", &mut cfg.captcha.detection_cache_ttl);
        set_parsed(lookup, "CAPTCHA_RETRY_MAX_ATTEMPTS", &mut cfg.captcha.retry_max_attempts);
        set_millis(lookup, "CAPTCHA_RETRY_BACKOFF_MS", &mut cfg.captcha.initial_retry_delay);
        set_millis(lookup, "CAPTCHA_RETRY_MAX_BACKOFF_MS", &mut cfg.captcha.max_retry_delay);
        set_millis(lookup, "CAPTCHA_TIMEOUT_SOLVE", &mut cfg.captcha.solve_timeout);
        set_millis(lookup, "CAPTCHA_TIMEOUT_DETECTION", &mut cfg.captcha.detection_timeout);
        set_millis(lookup, "CAPTCHA_TIMEOUT_WIDGET_INTERACTION", &mut cfg.captcha.widget_interaction_timeout);
        set_millis(lookup, "CAPTCHA_TIMEOUT_AUDIO_TRANSCRIPTION", &mut cfg.captcha.audio_transcription_timeout);
        set_parsed(lookup, "CAPTCHA_PROVIDER_MAX_RETRIES", &mut cfg.captcha.provider_max_retries);
        if let Some(secs) = parse_var::<u64>(lookup, "CAPTCHA_PROVIDER_TIMEOUT_SECONDS") {
            cfg.captcha.provider_timeout = Duration::from_secs(secs);
        }
        set_parsed(lookup, "CAPTCHA_PROVIDER_RATE_LIMIT_PER_MINUTE", &mut cfg.captcha.provider_rate_limit_per_minute);
        set_parsed(lookup, "CAPTCHA_DETECTION_MIN_CONFIDENCE_THRESHOLD", &mut cfg.captcha.detection_min_confidence);
        set_parsed(lookup, "CAPTCHA_DETECTION_MIN_STRONG_CONFIDENCE", &mut cfg.captcha.detection_strong_confidence);

        // External solver key sets, comma-separated, rotated round-robin
        if let Some(keys) = lookup("2CAPTCHA_API_KEY") {
            cfg.captcha.twocaptcha_api_keys = split_keys(&keys);
        }
        if let Some(keys) = lookup("ANTICAPTCHA_API_KEY") {
            cfg.captcha.anticaptcha_api_keys = split_keys(&keys);
        }
        if let Some(secret) = lookup("AKAMAI_SENSOR_SECRET") {
            cfg.captcha.akamai_sensor_secret = secret;
        }

        // Audio pipeline
        if let Some(priority) = lookup("AUDIO_CAPTCHA_PROVIDER_PRIORITY") {
            let names = split_keys(&priority);
            if !names.is_empty() {
                cfg.audio.provider_priority = names;
            }
        }
        set_parsed(lookup, "AUDIO_CAPTCHA_MIN_CONFIDENCE", &mut cfg.audio.min_confidence);
        set_parsed(lookup, "AUDIO_CAPTCHA_MAX_RETRIES", &mut cfg.audio.max_retries);
        if let Some(hours) = parse_var::<u64>(lookup, "AUDIO_CAPTCHA_CACHE_TTL_HOURS") {
            cfg.audio.cache_ttl = Duration::from_secs(hours * 3600);
        }
        if let Some(flag) = lookup("AUDIO_CAPTCHA_ENABLE_CACHE") {
            cfg.audio.enable_cache = parse_bool(&flag);
        }
        set_parsed(lookup, "AUDIO_CAPTCHA_RATE_LIMIT", &mut cfg.audio.rate_limit_per_minute);
        if let Some(dir) = lookup("AUDIO_CAPTCHA_TEMP_DIR") {
            cfg.audio.temp_dir = dir.into();
        }
        set_millis(lookup, "AUDIO_CAPTCHA_TIMEOUT", &mut cfg.audio.request_timeout);

        // Transcription providers register lazily on credential presence
        cfg.audio.google_api_key = lookup("GOOGLE_SPEECH_API_KEY").filter(|k| !k.is_empty());
        cfg.audio.openai_api_key = lookup("OPENAI_API_KEY").filter(|k| !k.is_empty());
        cfg.audio.azure_api_key = lookup("AZURE_SPEECH_KEY").filter(|k| !k.is_empty());

        // Worker defaults
        if let Some(family) = lookup("DEFAULT_BROWSER_TYPE_ID") {
            match BrowserFamily::from_str(family.trim()) {
                Ok(parsed) => cfg.scheduler.default_browser_family = parsed,
                Err(_) => warn!("Unrecognized DEFAULT_BROWSER_TYPE_ID: {family}"),
            }
        }
        if let Some(path) = lookup("BROWSERMILL_DATABASE_PATH") {
            cfg.scheduler.database_path = path.into();
        }
        set_parsed(lookup, "BROWSERMILL_MAX_CONCURRENT_JOBS", &mut cfg.scheduler.max_concurrent_jobs);
        set_parsed(lookup, "BROWSERMILL_POOL_MIN_SIZE", &mut cfg.pool.min_size);
        set_parsed(lookup, "BROWSERMILL_POOL_MAX_SIZE", &mut cfg.pool.max_size);
        if let Some(dir) = lookup("BROWSERMILL_DEBUG_SCREENSHOT_DIR") {
            cfg.captcha.debug_screenshot_dir = Some(dir.into());
        }

        cfg
    }
}

fn parse_var<T: FromStr>(lookup: EnvLookup<'_>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring unparseable value for {key}: {raw:?}");
            None
        }
    }
}

fn set_parsed<T: FromStr>(lookup: EnvLookup<'_>, key: &str, slot: &mut T) {
    if let Some(value) = parse_var(lookup, key) {
        *slot = value;
    }
}

fn set_millis(lookup: EnvLookup<'_>, key: &str, slot: &mut Duration) {
    if let Some(ms) = parse_var::<u64>(lookup, key) {
        *slot = Duration::from_millis(ms);
    }
}

fn parse_bool(raw: &str) -> bool {
    matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn split_keys(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from<'a>(map: &'a HashMap<&'a str, &'a str>) -> impl Fn(&str) -> Option<String> + 'a {
        move |key| map.get(key).map(ToString::to_string)
    }

    #[test]
    fn empty_environment_keeps_defaults() {
        let cfg = MillConfig::from_lookup(&|_| None);
        let defaults = MillConfig::default();
        assert_eq!(cfg.captcha.breaker_failure_threshold, defaults.captcha.breaker_failure_threshold);
        assert_eq!(cfg.audio.provider_priority, defaults.audio.provider_priority);
        assert!(cfg.audio.google_api_key.is_none());
    }

    #[test]
    fn breaker_and_cache_knobs_are_read() {
        let vars = HashMap::from([
            ("CAPTCHA_CIRCUIT_BREAKER_FAILURE_THRESHOLD", "5"),
            ("CAPTCHA_CIRCUIT_BREAKER_TIMEOUT_PERIOD", "120000"),
            ("CAPTCHA_CACHE_TTL", "60000"),
        ]);
        let lookup = lookup_from(&vars);
        let cfg = MillConfig::from_lookup(&lookup);
        assert_eq!(cfg.captcha.breaker_failure_threshold, 5);
        assert_eq!(cfg.captcha.breaker_timeout_period, Duration::from_secs(120));
        assert_eq!(cfg.captcha.detection_cache_ttl, Duration::from_secs(60));
    }

    #[test]
    fn comma_separated_keys_are_split_and_trimmed() {
        let vars = HashMap::from([
            ("2CAPTCHA_API_KEY", "key-a, key-b ,key-c"),
            ("AUDIO_CAPTCHA_PROVIDER_PRIORITY", "whisper,google"),
        ]);
        let lookup = lookup_from(&vars);
        let cfg = MillConfig::from_lookup(&lookup);
        assert_eq!(cfg.captcha.twocaptcha_api_keys, vec!["key-a", "key-b", "key-c"]);
        assert_eq!(cfg.audio.provider_priority, vec!["whisper", "google"]);
    }

    #[test]
    fn provider_credentials_gate_registration() {
        let vars = HashMap::from([("OPENAI_API_KEY", "sk-test"), ("AZURE_SPEECH_KEY", "")]);
        let lookup = lookup_from(&vars);
        let cfg = MillConfig::from_lookup(&lookup);
        assert_eq!(cfg.audio.openai_api_key.as_deref(), Some("sk-test"));
        // Empty credential means the provider is not registered
        assert!(cfg.audio.azure_api_key.is_none());
        assert!(cfg.audio.google_api_key.is_none());
    }

    #[test]
    fn unparseable_values_fall_back_to_defaults() {
        let vars = HashMap::from([("CAPTCHA_RETRY_MAX_ATTEMPTS", "lots")]);
        let lookup = lookup_from(&vars);
        let cfg = MillConfig::from_lookup(&lookup);
        assert_eq!(cfg.captcha.retry_max_attempts, 3);
    }

    #[test]
    fn browser_family_default_is_configurable() {
        let vars = HashMap::from([("DEFAULT_BROWSER_TYPE_ID", "firefox")]);
        let lookup = lookup_from(&vars);
        let cfg = MillConfig::from_lookup(&lookup);
        assert_eq!(
            cfg.scheduler.default_browser_family,
            crate::scheduler::job::BrowserFamily::Firefox
        );
    }
}
