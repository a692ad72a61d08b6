//! Stealth script assembly and injection.
//!
//! A config preamble (`window.__millConfig`) is installed first so every
//! evasion script reads its parameters from one place, then each enabled
//! script is registered to run before page scripts on every new document.
//! Order matters: the preamble must land before any script that reads it.
//! Injection is best-effort per script; it fails only when zero scripts
//! could be registered.

use anyhow::Result;
use chromiumoxide::{Page, cdp};
use rand::Rng;
use tracing::{debug, warn};

use crate::config::StealthConfig;

const WEBDRIVER_JS: &str = include_str!("scripts/webdriver.js");
const CANVAS_NOISE_JS: &str = include_str!("scripts/canvas_noise.js");
const WEBGL_VENDOR_JS: &str = include_str!("scripts/webgl_vendor.js");
const AUDIO_JITTER_JS: &str = include_str!("scripts/audio_jitter.js");
const BATTERY_MOCK_JS: &str = include_str!("scripts/battery_mock.js");
const HARDWARE_CONCURRENCY_JS: &str = include_str!("scripts/hardware_concurrency.js");
const PLUGINS_JS: &str = include_str!("scripts/plugins.js");
const LANGUAGES_JS: &str = include_str!("scripts/languages.js");
const TIMEZONE_JS: &str = include_str!("scripts/timezone.js");

/// Parameters frozen for one context's lifetime.
#[derive(Debug, Clone)]
pub struct StealthSession {
    pub hardware_concurrency: u32,
    pub session_seed: String,
}

impl StealthSession {
    /// Roll the per-context values from the configured ranges.
    #[must_use]
    pub fn roll(config: &StealthConfig) -> Self {
        let mut rng = rand::rng();
        let (min, max) = config.hardware_concurrency_range;
        let (min, max) = (min.min(max), min.max(max));
        let seed: Vec<u8> = (0..16).map(|_| rng.random::<u8>()).collect();
        Self {
            hardware_concurrency: rng.random_range(min..=max),
            session_seed: hex::encode(seed),
        }
    }
}

/// Scripts selected by the enabled flags, in injection order.
#[must_use]
pub fn enabled_scripts(config: &StealthConfig) -> Vec<(&'static str, &'static str)> {
    let mut scripts = Vec::new();
    if config.hide_webdriver {
        scripts.push(("webdriver", WEBDRIVER_JS));
    }
    if config.align_languages {
        scripts.push(("languages", LANGUAGES_JS));
    }
    if config.static_plugins {
        scripts.push(("plugins", PLUGINS_JS));
    }
    if config.randomize_hardware_concurrency {
        scripts.push(("hardware_concurrency", HARDWARE_CONCURRENCY_JS));
    }
    if config.webgl_vendor_override {
        scripts.push(("webgl_vendor", WEBGL_VENDOR_JS));
    }
    if config.canvas_noise {
        scripts.push(("canvas_noise", CANVAS_NOISE_JS));
    }
    if config.audio_context_jitter {
        scripts.push(("audio_jitter", AUDIO_JITTER_JS));
    }
    if config.mock_battery {
        scripts.push(("battery_mock", BATTERY_MOCK_JS));
    }
    if config.pin_timezone {
        scripts.push(("timezone", TIMEZONE_JS));
    }
    scripts
}

/// Build the `window.__millConfig` preamble for this context.
#[must_use]
pub fn config_preamble(config: &StealthConfig, session: &StealthSession) -> String {
    let language = config.locale.clone();
    let base = language.split('-').next().unwrap_or("en").to_string();
    let languages = serde_json::to_string(&[language.as_str(), base.as_str()])
        .unwrap_or_else(|_| "[]".to_string());
    format!(
        r#"window.__millConfig = {{
    language: {language:?},
    languages: {languages},
    timezoneId: {timezone:?},
    webglVendor: {vendor:?},
    webglRenderer: {renderer:?},
    hardwareConcurrency: {cores},
    sessionSeed: {seed:?}
}};"#,
        language = language,
        languages = languages,
        timezone = config.timezone_id,
        vendor = config.webgl_vendor,
        renderer = config.webgl_renderer,
        cores = session.hardware_concurrency,
        seed = session.session_seed,
    )
}

/// The platform string a user agent implies, used for the consistency check.
#[must_use]
pub fn expected_platform_fragment(user_agent: &str) -> Option<&'static str> {
    if user_agent.contains("Windows") {
        Some("Win")
    } else if user_agent.contains("Mac OS") || user_agent.contains("Macintosh") {
        Some("Mac")
    } else if user_agent.contains("Linux") || user_agent.contains("X11") {
        Some("Linux")
    } else {
        None
    }
}

/// Warn (never fail) when the user agent and platform string disagree.
pub fn check_ua_platform_consistency(user_agent: &str, platform: &str) -> Option<String> {
    let expected = expected_platform_fragment(user_agent)?;
    if platform.contains(expected) {
        None
    } else {
        let message = format!(
            "userAgent/platform mismatch: UA implies {expected:?} but platform is {platform:?}"
        );
        warn!("{message}");
        Some(message)
    }
}

/// Register the preamble and every enabled evasion script on `page`, then
/// strip the Headless marker from the user agent.
pub async fn inject(page: &Page, config: &StealthConfig, session: &StealthSession) -> Result<()> {
    let preamble = config_preamble(config, session);
    page.execute(
        cdp::browser_protocol::page::AddScriptToEvaluateOnNewDocumentParams {
            source: preamble,
            include_command_line_api: None,
            world_name: None,
            run_immediately: None,
        },
    )
    .await?;

    let scripts = enabled_scripts(config);
    let mut injected = 0usize;
    for (name, source) in &scripts {
        let result = page
            .execute(
                cdp::browser_protocol::page::AddScriptToEvaluateOnNewDocumentParams {
                    source: (*source).to_string(),
                    include_command_line_api: None,
                    world_name: None,
                    run_immediately: None,
                },
            )
            .await;
        match result {
            Ok(_) => injected += 1,
            Err(e) => warn!("Failed to inject stealth script {name}: {e}"),
        }
    }
    debug!("Injected {injected}/{} stealth scripts", scripts.len());
    if !scripts.is_empty() && injected == 0 {
        return Err(anyhow::anyhow!("failed to inject any stealth scripts"));
    }

    // UA override last so it applies to the cleaned-up string
    let version = page
        .execute(cdp::browser_protocol::browser::GetVersionParams {})
        .await?;
    let cleaned_ua = version.user_agent.replace("Headless", "");
    let platform = expected_platform_fragment(&cleaned_ua)
        .map(|fragment| match fragment {
            "Win" => "Win32",
            "Mac" => "MacIntel",
            _ => "Linux x86_64",
        })
        .unwrap_or("Linux x86_64");
    check_ua_platform_consistency(&cleaned_ua, platform);

    page.execute(cdp::browser_protocol::network::SetUserAgentOverrideParams {
        user_agent: cleaned_ua,
        accept_language: Some(format!("{},{};q=0.9", config.locale, config.locale.split('-').next().unwrap_or("en"))),
        platform: Some(platform.to_string()),
        user_agent_metadata: None,
    })
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_flags_on_selects_every_script() {
        let config = StealthConfig::default();
        assert_eq!(enabled_scripts(&config).len(), 9);
    }

    #[test]
    fn disabled_flags_drop_their_scripts() {
        let config = StealthConfig {
            canvas_noise: false,
            mock_battery: false,
            ..StealthConfig::default()
        };
        let names: Vec<&str> = enabled_scripts(&config).iter().map(|(n, _)| *n).collect();
        assert!(!names.contains(&"canvas_noise"));
        assert!(!names.contains(&"battery_mock"));
        assert!(names.contains(&"webdriver"));
    }

    #[test]
    fn preamble_carries_session_values() {
        let config = StealthConfig::default();
        let session = StealthSession {
            hardware_concurrency: 6,
            session_seed: "abc123".to_string(),
        };
        let preamble = config_preamble(&config, &session);
        assert!(preamble.contains("hardwareConcurrency: 6"));
        assert!(preamble.contains("\"abc123\""));
        assert!(preamble.contains("America/New_York"));
    }

    #[test]
    fn rolled_concurrency_stays_in_range() {
        let config = StealthConfig::default();
        for _ in 0..50 {
            let session = StealthSession::roll(&config);
            assert!((2..=8).contains(&session.hardware_concurrency));
        }
    }

    #[test]
    fn ua_platform_consistency() {
        assert!(check_ua_platform_consistency(
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64)",
            "Win32"
        )
        .is_none());
        assert!(check_ua_platform_consistency(
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64)",
            "Linux x86_64"
        )
        .is_some());
        assert!(check_ua_platform_consistency(
            "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7)",
            "MacIntel"
        )
        .is_none());
        // Unknown OS in UA: nothing to check
        assert!(check_ua_platform_consistency("curl/8.0", "Win32").is_none());
    }
}
