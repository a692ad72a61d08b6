//! Native DataDome solver: sensor replay, interstitial captcha, and slider.
//!
//! Success for every variant is observed the same way: a fresh `datadome`
//! clearance cookie in the context.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::Page;
use rand::Rng;

use crate::captcha::solver::registry::Solver;
use crate::captcha::types::{CaptchaChallenge, CaptchaSolution, ChallengeType};
use crate::captcha::widget::{LocatorOptions, LocatorStrategy, WidgetInteractor};
use crate::config::HumanInputConfig;
use crate::context::input;
use crate::error::{AutomationError, AutomationResult};

use super::cookie_value;

pub struct DatadomeSolver {
    interactor: Arc<WidgetInteractor>,
    input: HumanInputConfig,
}

impl DatadomeSolver {
    #[must_use]
    pub fn new(interactor: Arc<WidgetInteractor>, input: HumanInputConfig) -> Self {
        Self { interactor, input }
    }

    async fn wait_for_clearance(&self, page: &Page, timeout: Duration) -> AutomationResult<String> {
        let started = std::time::Instant::now();
        loop {
            if let Some(value) = cookie_value(page, "datadome").await? {
                if !value.is_empty() {
                    return Ok(value);
                }
            }
            if started.elapsed() >= timeout {
                return Err(AutomationError::timeout(
                    "datadome_clearance",
                    "datadome cookie never appeared",
                ));
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    /// Replay plausible interaction telemetry so the tag script reports a
    /// human session, then wait for the clearance cookie refresh.
    async fn solve_sensor(&self, page: &Page) -> AutomationResult<String> {
        let moves: Vec<(f64, f64)> = {
            let mut rng = rand::rng();
            (0..4)
                .map(|_| (rng.random_range(100.0..900.0), rng.random_range(100.0..600.0)))
                .collect()
        };
        for (x, y) in moves {
            input::move_mouse_human_like(page, x, y, &self.input)
                .await
                .map_err(|e| AutomationError::network("datadome_sensor_move", e.to_string()))?;
        }
        page.evaluate("window.scrollBy({ top: 300, behavior: 'smooth' })")
            .await
            .map_err(AutomationError::from)?;
        self.wait_for_clearance(page, Duration::from_secs(20)).await
    }

    /// Drag the slider puzzle across its track with a human-like path.
    async fn solve_slider(&self, page: &Page) -> AutomationResult<String> {
        let slider = LocatorOptions {
            strategies: vec![
                LocatorStrategy::Css(".slider".to_string()),
                LocatorStrategy::Css("[class*=slider-button]".to_string()),
                LocatorStrategy::AriaLabel("slider".to_string()),
            ],
            visible: true,
            timeout: Duration::from_secs(5),
        };
        let located = self.interactor.locate_element(page, &slider).await;
        let Some(element) = located.data else {
            return Err(AutomationError::invalid_input(
                "datadome_no_slider",
                located.error.unwrap_or_default(),
            ));
        };

        let (start_x, start_y) = element.rect.center();
        let travel = {
            let mut rng = rand::rng();
            260.0 + rng.random_range(-15.0..25.0)
        };
        input::move_mouse_human_like(page, start_x, start_y, &self.input)
            .await
            .map_err(|e| AutomationError::network("datadome_slider_move", e.to_string()))?;

        use chromiumoxide_cdp::cdp::browser_protocol::input::{
            DispatchMouseEventParams, DispatchMouseEventType, MouseButton,
        };
        page.execute(
            DispatchMouseEventParams::builder()
                .r#type(DispatchMouseEventType::MousePressed)
                .x(start_x)
                .y(start_y)
                .button(MouseButton::Left)
                .click_count(1)
                .build()
                .map_err(|e| AutomationError::internal("slider_press", e))?,
        )
        .await
        .map_err(AutomationError::from)?;

        // Drag in jittered increments with a small overshoot and settle-back
        let path = input::bezier_path(
            input::Point::new(start_x, start_y),
            input::Point::new(start_x + travel + 8.0, start_y),
            18,
            0.05,
        );
        for point in &path {
            page.execute(
                DispatchMouseEventParams::builder()
                    .r#type(DispatchMouseEventType::MouseMoved)
                    .x(point.x)
                    .y(point.y)
                    .button(MouseButton::Left)
                    .build()
                    .map_err(|e| AutomationError::internal("slider_drag", e))?,
            )
            .await
            .map_err(AutomationError::from)?;
            tokio::time::sleep(Duration::from_millis(12)).await;
        }
        page.execute(
            DispatchMouseEventParams::builder()
                .r#type(DispatchMouseEventType::MouseReleased)
                .x(start_x + travel)
                .y(start_y)
                .button(MouseButton::Left)
                .click_count(1)
                .build()
                .map_err(|e| AutomationError::internal("slider_release", e))?,
        )
        .await
        .map_err(AutomationError::from)?;

        self.wait_for_clearance(page, Duration::from_secs(20)).await
    }

    /// Interstitial captcha page: interact with the embedded widget frame.
    async fn solve_captcha(&self, page: &Page) -> AutomationResult<String> {
        let frame = self.interactor.switch_to_iframe(page, "datadome").await;
        if let Some(handle) = frame.data {
            if handle.frame_box.width > 0.0 {
                let x = handle.frame_box.x + handle.frame_box.width / 2.0;
                let y = handle.frame_box.y + handle.frame_box.height / 2.0;
                input::click_human_like(page, x, y, &self.input)
                    .await
                    .map_err(|e| AutomationError::network("datadome_captcha_click", e.to_string()))?;
            }
        }
        // Many interstitials fall back to the slider puzzle
        match self.solve_slider(page).await {
            Ok(cookie) => Ok(cookie),
            Err(_) => self.wait_for_clearance(page, Duration::from_secs(30)).await,
        }
    }
}

#[async_trait]
impl Solver for DatadomeSolver {
    fn id(&self) -> &str {
        "datadome-native"
    }

    async fn solve(&self, challenge: &CaptchaChallenge, page: &Page) -> AutomationResult<CaptchaSolution> {
        let cookie = match challenge.challenge_type {
            ChallengeType::DatadomeSensor => self.solve_sensor(page).await?,
            ChallengeType::DatadomeSlider => self.solve_slider(page).await?,
            ChallengeType::DatadomeCaptcha => self.solve_captcha(page).await?,
            other => {
                return Err(AutomationError::invalid_input(
                    "datadome_wrong_type",
                    format!("datadome-native cannot solve {other}"),
                ));
            }
        };
        Ok(CaptchaSolution::cookie(self.id(), cookie))
    }
}
