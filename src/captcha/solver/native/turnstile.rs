//! Native Cloudflare Turnstile solver.
//!
//! Managed Turnstile widgets pass on a single interaction when the browser
//! fingerprint holds up; the token lands in the hidden
//! `cf-turnstile-response` input.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::Page;

use crate::captcha::solver::registry::Solver;
use crate::captcha::types::{CaptchaChallenge, CaptchaSolution, ChallengeType};
use crate::captcha::widget::WidgetInteractor;
use crate::error::{AutomationError, AutomationResult};

use super::poll_for_string;

const RESPONSE_EXPR: &str =
    "(() => { const t = document.querySelector('[name=cf-turnstile-response]'); return t ? t.value : null; })()";

pub struct TurnstileSolver {
    interactor: Arc<WidgetInteractor>,
}

impl TurnstileSolver {
    #[must_use]
    pub fn new(interactor: Arc<WidgetInteractor>) -> Self {
        Self { interactor }
    }
}

#[async_trait]
impl Solver for TurnstileSolver {
    fn id(&self) -> &str {
        "turnstile-native"
    }

    async fn solve(&self, challenge: &CaptchaChallenge, page: &Page) -> AutomationResult<CaptchaSolution> {
        if challenge.challenge_type != ChallengeType::Turnstile {
            return Err(AutomationError::invalid_input(
                "turnstile_wrong_type",
                format!("turnstile-native cannot solve {}", challenge.challenge_type),
            ));
        }

        // Interactive widgets need one click inside the frame; invisible
        // ones emit the token on their own, so the click is best-effort.
        let frame = self
            .interactor
            .switch_to_iframe(page, "challenges.cloudflare.com")
            .await;
        if let Some(handle) = frame.data {
            if handle.frame_box.width > 0.0 {
                let x = handle.frame_box.x + 30.0;
                let y = handle.frame_box.y + handle.frame_box.height / 2.0;
                let _ = crate::context::input::click_human_like(
                    page,
                    x,
                    y,
                    &crate::config::HumanInputConfig::default(),
                )
                .await;
            }
        }

        let token = poll_for_string(
            page,
            RESPONSE_EXPR,
            challenge.challenge_type.attempt_timeout(),
            Duration::from_millis(500),
        )
        .await?
        .ok_or_else(|| AutomationError::timeout("turnstile_token", "turnstile response never filled"))?;

        Ok(CaptchaSolution::token(self.id(), token))
    }
}
