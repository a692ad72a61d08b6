//! External solver adapters: thin JSON/HTTPS clients over third-party
//! captcha-solving APIs, with round-robin API-key rotation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::Page;
use reqwest::Client;
use serde_json::json;
use tracing::debug;

use crate::captcha::types::{CaptchaChallenge, CaptchaSolution, ChallengeType};
use crate::error::{AutomationError, AutomationResult};

use super::registry::Solver;

/// Round-robin rotation over a configured key set.
pub struct ApiKeyRotation {
    keys: Vec<String>,
    cursor: AtomicUsize,
}

impl ApiKeyRotation {
    #[must_use]
    pub fn new(keys: Vec<String>) -> Self {
        Self {
            keys,
            cursor: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Next key in rotation; `None` when no keys are configured.
    #[must_use]
    pub fn next_key(&self) -> Option<&str> {
        if self.keys.is_empty() {
            return None;
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.keys.len();
        Some(&self.keys[index])
    }
}

fn require_sitekey(challenge: &CaptchaChallenge) -> AutomationResult<&str> {
    challenge
        .sitekey
        .as_deref()
        .ok_or_else(|| AutomationError::invalid_input("missing_sitekey", "external solvers need a sitekey"))
}

// =============================================================================
// 2captcha
// =============================================================================

pub struct TwoCaptchaSolver {
    client: Client,
    keys: ApiKeyRotation,
    base_url: String,
    poll_interval: Duration,
}

impl TwoCaptchaSolver {
    #[must_use]
    pub fn new(client: Client, keys: Vec<String>) -> Self {
        Self::with_base_url(client, keys, "https://api.2captcha.com".to_string())
    }

    #[must_use]
    pub fn with_base_url(client: Client, keys: Vec<String>, base_url: String) -> Self {
        Self {
            client,
            keys: ApiKeyRotation::new(keys),
            base_url,
            poll_interval: Duration::from_secs(5),
        }
    }

    fn task_type(challenge_type: ChallengeType) -> &'static str {
        match challenge_type {
            ChallengeType::RecaptchaV3 => "RecaptchaV3TaskProxyless",
            ChallengeType::Turnstile => "TurnstileTaskProxyless",
            ChallengeType::HcaptchaCheckbox
            | ChallengeType::HcaptchaInvisible
            | ChallengeType::HcaptchaAudio
            | ChallengeType::HcaptchaAccessibility => "HCaptchaTaskProxyless",
            ChallengeType::Funcaptcha => "FunCaptchaTaskProxyless",
            ChallengeType::DatadomeSensor
            | ChallengeType::DatadomeCaptcha
            | ChallengeType::DatadomeSlider => "DataDomeSliderTask",
            _ => "RecaptchaV2TaskProxyless",
        }
    }
}

#[async_trait]
impl Solver for TwoCaptchaSolver {
    fn id(&self) -> &str {
        "2captcha"
    }

    async fn solve(&self, challenge: &CaptchaChallenge, _page: &Page) -> AutomationResult<CaptchaSolution> {
        let key = self
            .keys
            .next_key()
            .ok_or_else(|| AutomationError::auth("2captcha_no_key", "no 2captcha API key configured"))?
            .to_string();
        let sitekey = require_sitekey(challenge)?;

        let create_body = json!({
            "clientKey": key,
            "task": {
                "type": Self::task_type(challenge.challenge_type),
                "websiteURL": challenge.page_url,
                "websiteKey": sitekey,
            },
        });
        let created: serde_json::Value = self
            .client
            .post(format!("{}/createTask", self.base_url))
            .json(&create_body)
            .send()
            .await?
            .json()
            .await?;
        if created["errorId"].as_i64().unwrap_or(0) != 0 {
            return Err(map_vendor_error(
                "2captcha",
                created["errorCode"].as_str().unwrap_or("unknown"),
            ));
        }
        let task_id = created["taskId"].clone();
        debug!(task_id = %task_id, "2captcha task created");

        let deadline = tokio::time::Instant::now() + challenge.challenge_type.attempt_timeout();
        loop {
            if challenge.is_cancelled() {
                return Err(AutomationError::internal("solve_cancelled", "job cancelled"));
            }
            tokio::time::sleep(self.poll_interval).await;
            let result: serde_json::Value = self
                .client
                .post(format!("{}/getTaskResult", self.base_url))
                .json(&json!({ "clientKey": key, "taskId": task_id }))
                .send()
                .await?
                .json()
                .await?;
            if result["errorId"].as_i64().unwrap_or(0) != 0 {
                return Err(map_vendor_error(
                    "2captcha",
                    result["errorCode"].as_str().unwrap_or("unknown"),
                ));
            }
            if result["status"].as_str() == Some("ready") {
                let token = result["solution"]["gRecaptchaResponse"]
                    .as_str()
                    .or_else(|| result["solution"]["token"].as_str())
                    .ok_or_else(|| {
                        AutomationError::network("2captcha_empty", "ready result carried no token")
                    })?;
                return Ok(CaptchaSolution::token(self.id(), token));
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(AutomationError::timeout("2captcha_poll", "task never became ready"));
            }
        }
    }
}

// =============================================================================
// Anti-Captcha
// =============================================================================

pub struct AntiCaptchaSolver {
    client: Client,
    keys: ApiKeyRotation,
    base_url: String,
    poll_interval: Duration,
}

impl AntiCaptchaSolver {
    #[must_use]
    pub fn new(client: Client, keys: Vec<String>) -> Self {
        Self::with_base_url(client, keys, "https://api.anti-captcha.com".to_string())
    }

    #[must_use]
    pub fn with_base_url(client: Client, keys: Vec<String>, base_url: String) -> Self {
        Self {
            client,
            keys: ApiKeyRotation::new(keys),
            base_url,
            poll_interval: Duration::from_secs(5),
        }
    }
}

#[async_trait]
impl Solver for AntiCaptchaSolver {
    fn id(&self) -> &str {
        "anticaptcha"
    }

    async fn solve(&self, challenge: &CaptchaChallenge, _page: &Page) -> AutomationResult<CaptchaSolution> {
        let key = self
            .keys
            .next_key()
            .ok_or_else(|| AutomationError::auth("anticaptcha_no_key", "no anti-captcha API key configured"))?
            .to_string();
        let sitekey = require_sitekey(challenge)?;

        let task_type = match challenge.challenge_type.system() {
            crate::captcha::types::AntiBotSystem::Hcaptcha => "HCaptchaTaskProxyless",
            crate::captcha::types::AntiBotSystem::Turnstile => "TurnstileTaskProxyless",
            _ => "RecaptchaV2TaskProxyless",
        };
        let created: serde_json::Value = self
            .client
            .post(format!("{}/createTask", self.base_url))
            .json(&json!({
                "clientKey": key,
                "task": {
                    "type": task_type,
                    "websiteURL": challenge.page_url,
                    "websiteKey": sitekey,
                },
            }))
            .send()
            .await?
            .json()
            .await?;
        if created["errorId"].as_i64().unwrap_or(0) != 0 {
            return Err(map_vendor_error(
                "anticaptcha",
                created["errorCode"].as_str().unwrap_or("unknown"),
            ));
        }
        let task_id = created["taskId"].clone();

        let deadline = tokio::time::Instant::now() + challenge.challenge_type.attempt_timeout();
        loop {
            if challenge.is_cancelled() {
                return Err(AutomationError::internal("solve_cancelled", "job cancelled"));
            }
            tokio::time::sleep(self.poll_interval).await;
            let result: serde_json::Value = self
                .client
                .post(format!("{}/getTaskResult", self.base_url))
                .json(&json!({ "clientKey": key, "taskId": task_id }))
                .send()
                .await?
                .json()
                .await?;
            if result["errorId"].as_i64().unwrap_or(0) != 0 {
                return Err(map_vendor_error(
                    "anticaptcha",
                    result["errorCode"].as_str().unwrap_or("unknown"),
                ));
            }
            if result["status"].as_str() == Some("ready") {
                let token = result["solution"]["gRecaptchaResponse"]
                    .as_str()
                    .or_else(|| result["solution"]["token"].as_str())
                    .ok_or_else(|| {
                        AutomationError::network("anticaptcha_empty", "ready result carried no token")
                    })?;
                return Ok(CaptchaSolution::token(self.id(), token));
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(AutomationError::timeout("anticaptcha_poll", "task never became ready"));
            }
        }
    }
}

fn map_vendor_error(vendor: &str, code: &str) -> AutomationError {
    let upper = code.to_ascii_uppercase();
    if upper.contains("KEY") {
        AutomationError::auth(format!("{vendor}_key"), format!("{vendor} rejected key: {code}"))
    } else if upper.contains("ZERO_BALANCE") {
        AutomationError::auth(format!("{vendor}_balance"), format!("{vendor}: {code}"))
    } else if upper.contains("NO_SLOT") || upper.contains("LIMIT") {
        AutomationError::rate_limited(format!("{vendor}_capacity"), format!("{vendor}: {code}"))
    } else {
        AutomationError::network(format!("{vendor}_error"), format!("{vendor}: {code}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_cycles_round_robin() {
        let rotation = ApiKeyRotation::new(vec!["a".into(), "b".into(), "c".into()]);
        let picks: Vec<&str> = (0..6).filter_map(|_| rotation.next_key()).collect();
        assert_eq!(picks, vec!["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn empty_rotation_yields_none() {
        let rotation = ApiKeyRotation::new(Vec::new());
        assert!(rotation.next_key().is_none());
        assert!(rotation.is_empty());
    }

    #[test]
    fn vendor_error_mapping() {
        assert_eq!(
            map_vendor_error("2captcha", "ERROR_WRONG_USER_KEY").category,
            crate::error::ErrorCategory::Auth
        );
        assert_eq!(
            map_vendor_error("2captcha", "ERROR_NO_SLOT_AVAILABLE").category,
            crate::error::ErrorCategory::RateLimited
        );
        assert_eq!(
            map_vendor_error("2captcha", "ERROR_CAPTCHA_UNSOLVABLE").category,
            crate::error::ErrorCategory::Network
        );
    }

    #[test]
    fn task_type_mapping_covers_families() {
        assert_eq!(TwoCaptchaSolver::task_type(ChallengeType::RecaptchaV2Checkbox), "RecaptchaV2TaskProxyless");
        assert_eq!(TwoCaptchaSolver::task_type(ChallengeType::RecaptchaV3), "RecaptchaV3TaskProxyless");
        assert_eq!(TwoCaptchaSolver::task_type(ChallengeType::Turnstile), "TurnstileTaskProxyless");
        assert_eq!(TwoCaptchaSolver::task_type(ChallengeType::HcaptchaAudio), "HCaptchaTaskProxyless");
    }
}
