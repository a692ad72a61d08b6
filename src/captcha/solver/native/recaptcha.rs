//! Native reCAPTCHA solver: v2 checkbox, invisible, audio, image, and v3.
//!
//! The checkbox path clicks the anchor widget and waits for the response
//! textarea to fill. The audio path switches the challenge to audio,
//! transcribes it through the ranked provider pipeline, and submits the
//! answer. Image challenges are solved by switching them to audio. v3 runs
//! `grecaptcha.execute` with the page's own sitekey.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::Page;
use tracing::{debug, info};

use crate::captcha::audio::AudioPipeline;
use crate::captcha::types::{CaptchaChallenge, CaptchaSolution, ChallengeType};
use crate::captcha::widget::{LocatorOptions, LocatorStrategy, WidgetInteractor};
use crate::error::{AutomationError, AutomationResult};

use super::{extract_sitekey, poll_for_string};

const RESPONSE_EXPR: &str =
    "(() => { const t = document.querySelector('textarea[name=g-recaptcha-response]'); return t ? t.value : null; })()";

pub struct RecaptchaSolver {
    interactor: Arc<WidgetInteractor>,
    audio: Arc<AudioPipeline>,
}

impl RecaptchaSolver {
    #[must_use]
    pub fn new(interactor: Arc<WidgetInteractor>, audio: Arc<AudioPipeline>) -> Self {
        Self { interactor, audio }
    }

    async fn click_checkbox(&self, page: &Page) -> AutomationResult<()> {
        let frame = self
            .interactor
            .switch_to_iframe(page, "google.com/recaptcha/api2/anchor")
            .await;
        let Some(handle) = frame.data else {
            return Err(AutomationError::invalid_input(
                "recaptcha_no_anchor",
                frame.error.unwrap_or_else(|| "anchor iframe not found".to_string()),
            ));
        };
        // Checkbox sits near the top-left corner of the anchor frame
        let x = handle.frame_box.x + 28.0;
        let y = handle.frame_box.y + handle.frame_box.height / 2.0;
        crate::context::input::click_human_like(page, x, y, &crate::config::HumanInputConfig::default())
            .await
            .map_err(|e| AutomationError::network("recaptcha_click", e.to_string()))?;
        Ok(())
    }

    async fn wait_for_token(&self, page: &Page, timeout: Duration) -> AutomationResult<String> {
        poll_for_string(page, RESPONSE_EXPR, timeout, Duration::from_millis(500))
            .await?
            .ok_or_else(|| {
                AutomationError::timeout("recaptcha_token", "response textarea never filled")
            })
    }

    async fn solve_audio(&self, page: &Page) -> AutomationResult<String> {
        // Switch the visible challenge to its audio variant
        let audio_button = LocatorOptions {
            strategies: vec![
                LocatorStrategy::Css("#recaptcha-audio-button".to_string()),
                LocatorStrategy::AriaLabel("audio".to_string()),
                LocatorStrategy::Css(".rc-button-audio".to_string()),
            ],
            visible: true,
            timeout: Duration::from_secs(5),
        };
        let clicked = self.interactor.click_element(page, &audio_button, true).await;
        if !clicked.success {
            return Err(AutomationError::invalid_input(
                "recaptcha_no_audio_button",
                clicked.error.unwrap_or_default(),
            ));
        }
        tokio::time::sleep(Duration::from_millis(800)).await;

        let audio_url = self.audio.find_audio_url(page).await?.ok_or_else(|| {
            AutomationError::invalid_input("recaptcha_no_audio_url", "audio challenge URL not found")
        })?;
        let bytes = self.audio.download(page, &audio_url).await?;
        let transcription = self.audio.process(&audio_url, &bytes).await?;
        info!(
            provider = %transcription.provider,
            cached = transcription.cached,
            "Audio challenge transcribed"
        );

        let answer_field = LocatorOptions {
            strategies: vec![LocatorStrategy::Css("#audio-response".to_string())],
            visible: true,
            timeout: Duration::from_secs(5),
        };
        let typed = self
            .interactor
            .type_text(page, &answer_field, &transcription.text)
            .await;
        if !typed.success {
            return Err(AutomationError::invalid_input(
                "recaptcha_no_answer_field",
                typed.error.unwrap_or_default(),
            ));
        }

        let verify_button = LocatorOptions {
            strategies: vec![
                LocatorStrategy::Css("#recaptcha-verify-button".to_string()),
                LocatorStrategy::Text("Verify".to_string()),
            ],
            visible: true,
            timeout: Duration::from_secs(5),
        };
        let verified = self.interactor.click_element(page, &verify_button, true).await;
        if !verified.success {
            return Err(AutomationError::invalid_input(
                "recaptcha_no_verify_button",
                verified.error.unwrap_or_default(),
            ));
        }

        self.wait_for_token(page, Duration::from_secs(10)).await
    }

    async fn solve_v3(&self, page: &Page, challenge: &CaptchaChallenge) -> AutomationResult<String> {
        let sitekey = match &challenge.sitekey {
            Some(key) => key.clone(),
            None => extract_sitekey(page, ".g-recaptcha")
                .await?
                .ok_or_else(|| {
                    AutomationError::invalid_input("recaptcha_v3_sitekey", "missing sitekey")
                })?,
        };
        let script = format!(
            r"(async () => {{
                if (typeof grecaptcha === 'undefined') return null;
                return await grecaptcha.execute({}, {{ action: 'submit' }});
            }})()",
            serde_json::to_string(&sitekey)
                .map_err(|e| AutomationError::internal("sitekey_encode", e.to_string()))?
        );
        let params = chromiumoxide::cdp::js_protocol::runtime::EvaluateParams::builder()
            .expression(script)
            .await_promise(true)
            .return_by_value(true)
            .build()
            .map_err(|e| AutomationError::internal("v3_eval_params", e))?;
        let result = page.evaluate(params).await.map_err(AutomationError::from)?;
        result
            .value()
            .and_then(serde_json::Value::as_str)
            .map(ToString::to_string)
            .ok_or_else(|| AutomationError::network("recaptcha_v3_execute", "grecaptcha.execute returned no token"))
    }
}

#[async_trait]
impl crate::captcha::solver::registry::Solver for RecaptchaSolver {
    fn id(&self) -> &str {
        "recaptcha-native"
    }

    async fn solve(&self, challenge: &CaptchaChallenge, page: &Page) -> AutomationResult<CaptchaSolution> {
        let token = match challenge.challenge_type {
            ChallengeType::RecaptchaV3 => self.solve_v3(page, challenge).await?,
            ChallengeType::RecaptchaV2Checkbox | ChallengeType::RecaptchaV2Invisible => {
                self.click_checkbox(page).await?;
                match self.wait_for_token(page, Duration::from_secs(5)).await {
                    Ok(token) => token,
                    // A challenge popup appeared instead of an instant pass
                    Err(_) => {
                        debug!("Checkbox click escalated to a challenge, taking audio path");
                        self.solve_audio(page).await?
                    }
                }
            }
            ChallengeType::RecaptchaV2Audio => self.solve_audio(page).await?,
            // Image grids are solved by switching the challenge to audio
            ChallengeType::RecaptchaV2Image => self.solve_audio(page).await?,
            other => {
                return Err(AutomationError::invalid_input(
                    "recaptcha_wrong_type",
                    format!("recaptcha-native cannot solve {other}"),
                ));
            }
        };
        Ok(CaptchaSolution::token(self.id(), token))
    }
}
