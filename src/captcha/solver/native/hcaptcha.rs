//! Native hCAPTCHA solver: checkbox, invisible, audio, and accessibility.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::Page;
use tracing::debug;

use crate::captcha::audio::AudioPipeline;
use crate::captcha::solver::registry::Solver;
use crate::captcha::types::{CaptchaChallenge, CaptchaSolution, ChallengeType};
use crate::captcha::widget::{LocatorOptions, LocatorStrategy, WidgetInteractor};
use crate::error::{AutomationError, AutomationResult};

use super::poll_for_string;

const RESPONSE_EXPR: &str =
    "(() => { const t = document.querySelector('[name=h-captcha-response]'); return t ? t.value : null; })()";

pub struct HcaptchaSolver {
    interactor: Arc<WidgetInteractor>,
    audio: Arc<AudioPipeline>,
}

impl HcaptchaSolver {
    #[must_use]
    pub fn new(interactor: Arc<WidgetInteractor>, audio: Arc<AudioPipeline>) -> Self {
        Self { interactor, audio }
    }

    async fn click_checkbox(&self, page: &Page) -> AutomationResult<()> {
        let frame = self.interactor.switch_to_iframe(page, "hcaptcha.com").await;
        let Some(handle) = frame.data else {
            return Err(AutomationError::invalid_input(
                "hcaptcha_no_frame",
                frame.error.unwrap_or_else(|| "widget iframe not found".to_string()),
            ));
        };
        let x = handle.frame_box.x + 28.0;
        let y = handle.frame_box.y + handle.frame_box.height / 2.0;
        crate::context::input::click_human_like(page, x, y, &crate::config::HumanInputConfig::default())
            .await
            .map_err(|e| AutomationError::network("hcaptcha_click", e.to_string()))?;
        Ok(())
    }

    async fn wait_for_token(&self, page: &Page, timeout: Duration) -> AutomationResult<String> {
        poll_for_string(page, RESPONSE_EXPR, timeout, Duration::from_millis(500))
            .await?
            .ok_or_else(|| AutomationError::timeout("hcaptcha_token", "response field never filled"))
    }

    async fn solve_audio(&self, page: &Page) -> AutomationResult<String> {
        let audio_button = LocatorOptions {
            strategies: crate::captcha::audio::AUDIO_CONTROL_SELECTORS
                .iter()
                .map(|sel| LocatorStrategy::Css((*sel).to_string()))
                .collect(),
            visible: true,
            timeout: Duration::from_secs(5),
        };
        let clicked = self.interactor.click_element(page, &audio_button, true).await;
        if !clicked.success {
            return Err(AutomationError::invalid_input(
                "hcaptcha_no_audio_button",
                clicked.error.unwrap_or_default(),
            ));
        }
        tokio::time::sleep(Duration::from_millis(800)).await;

        let audio_url = self.audio.find_audio_url(page).await?.ok_or_else(|| {
            AutomationError::invalid_input("hcaptcha_no_audio_url", "audio challenge URL not found")
        })?;
        let bytes = self.audio.download(page, &audio_url).await?;
        let transcription = self.audio.process(&audio_url, &bytes).await?;

        let answer_field = LocatorOptions {
            strategies: vec![
                LocatorStrategy::Css("input[type=text]".to_string()),
                LocatorStrategy::AriaLabel("answer".to_string()),
            ],
            visible: true,
            timeout: Duration::from_secs(5),
        };
        let typed = self
            .interactor
            .type_text(page, &answer_field, &transcription.text)
            .await;
        if !typed.success {
            return Err(AutomationError::invalid_input(
                "hcaptcha_no_answer_field",
                typed.error.unwrap_or_default(),
            ));
        }

        let submit = LocatorOptions {
            strategies: vec![
                LocatorStrategy::Text("Verify".to_string()),
                LocatorStrategy::Css("button[type=submit]".to_string()),
            ],
            visible: true,
            timeout: Duration::from_secs(5),
        };
        let submitted = self.interactor.click_element(page, &submit, true).await;
        if !submitted.success {
            return Err(AutomationError::invalid_input(
                "hcaptcha_no_submit",
                submitted.error.unwrap_or_default(),
            ));
        }

        self.wait_for_token(page, Duration::from_secs(10)).await
    }

    /// The accessibility flow sets a one-time cookie that lets the checkbox
    /// pass without a visual challenge.
    async fn solve_accessibility(&self, page: &Page) -> AutomationResult<String> {
        let link = LocatorOptions {
            strategies: vec![
                LocatorStrategy::AriaLabel("accessibility".to_string()),
                LocatorStrategy::Text("Accessibility".to_string()),
            ],
            visible: false,
            timeout: Duration::from_secs(5),
        };
        let clicked = self.interactor.click_element(page, &link, false).await;
        if !clicked.success {
            return Err(AutomationError::invalid_input(
                "hcaptcha_no_accessibility",
                clicked.error.unwrap_or_default(),
            ));
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
        self.click_checkbox(page).await?;
        self.wait_for_token(page, Duration::from_secs(10)).await
    }
}

#[async_trait]
impl Solver for HcaptchaSolver {
    fn id(&self) -> &str {
        "hcaptcha-native"
    }

    async fn solve(&self, challenge: &CaptchaChallenge, page: &Page) -> AutomationResult<CaptchaSolution> {
        let token = match challenge.challenge_type {
            ChallengeType::HcaptchaCheckbox | ChallengeType::HcaptchaInvisible => {
                self.click_checkbox(page).await?;
                match self.wait_for_token(page, Duration::from_secs(5)).await {
                    Ok(token) => token,
                    Err(_) => {
                        debug!("hCAPTCHA checkbox escalated, taking audio path");
                        self.solve_audio(page).await?
                    }
                }
            }
            ChallengeType::HcaptchaAudio => self.solve_audio(page).await?,
            ChallengeType::HcaptchaAccessibility => self.solve_accessibility(page).await?,
            other => {
                return Err(AutomationError::invalid_input(
                    "hcaptcha_wrong_type",
                    format!("hcaptcha-native cannot solve {other}"),
                ));
            }
        };
        Ok(CaptchaSolution::token(self.id(), token))
    }
}
