//! Captcha widget interaction (C6).
//!
//! Widgets live in vendor iframes. Discovery matches frame URLs and DOM
//! markers; element location tries CSS, XPath, role+name, text, and
//! aria-label in order; interaction goes through the human-like input layer
//! at resolved page coordinates. Every operation catches driver errors and
//! returns a structured [`InteractionOutcome`] so callers can branch instead
//! of unwinding.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use chromiumoxide::Page;
use rand::Rng;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::{CaptchaConfig, HumanInputConfig};
use crate::context::input;

use super::detection::{DetectionRegistry, Probe};
use super::types::AntiBotSystem;

/// Structured result of a widget operation; never panics through.
#[derive(Debug, Clone)]
pub struct InteractionOutcome<T> {
    pub success: bool,
    pub error: Option<String>,
    pub duration: Duration,
    pub data: Option<T>,
}

impl<T> InteractionOutcome<T> {
    #[must_use]
    pub fn ok(data: T, started: Instant) -> Self {
        Self {
            success: true,
            error: None,
            duration: started.elapsed(),
            data: Some(data),
        }
    }

    #[must_use]
    pub fn err(message: impl Into<String>, started: Instant) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
            duration: started.elapsed(),
            data: None,
        }
    }
}

/// Axis-aligned box in page coordinates.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    #[must_use]
    pub fn center(&self) -> (f64, f64) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }
}

/// A resolved widget frame.
#[derive(Debug, Clone)]
pub struct WidgetHandle {
    pub widget_type: AntiBotSystem,
    pub frame_src: String,
    pub frame_box: Rect,
    pub confidence: f64,
}

/// A located element, addressed by page coordinates.
#[derive(Debug, Clone)]
pub struct LocatedElement {
    pub strategy: &'static str,
    pub rect: Rect,
}

/// Location strategies, tried in declaration order.
#[derive(Debug, Clone)]
pub enum LocatorStrategy {
    Css(String),
    XPath(String),
    Role { role: String, name: String },
    Text(String),
    AriaLabel(String),
}

impl LocatorStrategy {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Css(_) => "css",
            Self::XPath(_) => "xpath",
            Self::Role { .. } => "role",
            Self::Text(_) => "text",
            Self::AriaLabel(_) => "aria-label",
        }
    }
}

/// Options for [`WidgetInteractor::locate_element`].
#[derive(Debug, Clone)]
pub struct LocatorOptions {
    pub strategies: Vec<LocatorStrategy>,
    /// Require visibility; when false an attached element suffices
    pub visible: bool,
    pub timeout: Duration,
}

impl Default for LocatorOptions {
    fn default() -> Self {
        Self {
            strategies: Vec::new(),
            visible: true,
            timeout: Duration::from_secs(5),
        }
    }
}

/// JS expression resolving a strategy to a bounding rect (or null).
#[must_use]
pub fn locator_js(strategy: &LocatorStrategy, visible: bool) -> String {
    let finder = match strategy {
        LocatorStrategy::Css(selector) => {
            format!("document.querySelector({})", js_str(selector))
        }
        LocatorStrategy::XPath(expr) => format!(
            "document.evaluate({}, document, null, XPathResult.FIRST_ORDERED_NODE_TYPE, null).singleNodeValue",
            js_str(expr)
        ),
        LocatorStrategy::Role { role, name } => format!(
            "Array.from(document.querySelectorAll('[role=' + JSON.stringify({role}) + ']')).find((el) => (el.getAttribute('aria-label') || el.textContent || '').trim().includes({name}))",
            role = js_str(role),
            name = js_str(name),
        ),
        LocatorStrategy::Text(text) => format!(
            "Array.from(document.querySelectorAll('a, button, span, div, label')).find((el) => (el.textContent || '').trim().includes({}))",
            js_str(text)
        ),
        LocatorStrategy::AriaLabel(label) => format!(
            "document.querySelector('[aria-label*=' + JSON.stringify({}) + ']')",
            js_str(label)
        ),
    };
    let visibility_check = if visible {
        "const style = getComputedStyle(el); \
         if (style.display === 'none' || style.visibility === 'hidden') return null; \
         if (rect.width <= 0 || rect.height <= 0) return null;"
    } else {
        ""
    };
    format!(
        r"(() => {{
            const el = {finder};
            if (!el) return null;
            const rect = el.getBoundingClientRect();
            {visibility_check}
            return {{ x: rect.x, y: rect.y, width: rect.width, height: rect.height }};
        }})()"
    )
}

fn js_str(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "\"\"".to_string())
}

/// Widget interaction surface shared by native solvers.
pub struct WidgetInteractor {
    input: HumanInputConfig,
    /// Optional directory for debug screenshots
    debug_dir: Option<PathBuf>,
    click_delay_ms: (u64, u64),
    typing_delay_ms: (u64, u64),
    /// Bypass visibility enforcement on clicks
    pub force_clicks: bool,
}

impl WidgetInteractor {
    #[must_use]
    pub fn new(input: HumanInputConfig, captcha: &CaptchaConfig) -> Self {
        Self {
            click_delay_ms: input.click_delay_ms,
            typing_delay_ms: input.typing_delay_ms,
            input,
            debug_dir: captcha.debug_screenshot_dir.clone(),
            force_clicks: false,
        }
    }

    /// Poll for a captcha widget until `timeout`, checking every 500 ms.
    pub async fn wait_for_captcha_widget(
        &self,
        page: &Page,
        registry: &DetectionRegistry,
        widget_type: Option<AntiBotSystem>,
        timeout: Duration,
    ) -> InteractionOutcome<WidgetHandle> {
        let started = Instant::now();
        loop {
            match self.detect_widget_inner(page, registry, widget_type).await {
                Ok(Some(handle)) => return InteractionOutcome::ok(handle, started),
                Ok(None) => {}
                Err(e) => debug!("Widget probe failed, retrying: {e}"),
            }
            if started.elapsed() >= timeout {
                return InteractionOutcome::err(
                    format!("no captcha widget appeared within {timeout:?}"),
                    started,
                );
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    /// Variant resolving early once confidence exceeds 0.5.
    pub async fn wait_for_dynamic_widget(
        &self,
        page: &Page,
        registry: &DetectionRegistry,
        widget_type: Option<AntiBotSystem>,
        timeout: Duration,
    ) -> InteractionOutcome<WidgetHandle> {
        let started = Instant::now();
        loop {
            if let Ok(Some(handle)) = self.detect_widget_inner(page, registry, widget_type).await {
                if handle.confidence > 0.5 {
                    return InteractionOutcome::ok(handle, started);
                }
            }
            if started.elapsed() >= timeout {
                return InteractionOutcome::err(
                    format!("no dynamic widget above confidence 0.5 within {timeout:?}"),
                    started,
                );
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    /// Single-shot widget detection for `widget_type` (or any system).
    pub async fn detect_widget(
        &self,
        page: &Page,
        registry: &DetectionRegistry,
        widget_type: Option<AntiBotSystem>,
    ) -> InteractionOutcome<WidgetHandle> {
        let started = Instant::now();
        match self.detect_widget_inner(page, registry, widget_type).await {
            Ok(Some(handle)) => InteractionOutcome::ok(handle, started),
            Ok(None) => InteractionOutcome::err("no widget detected", started),
            Err(e) => InteractionOutcome::err(e, started),
        }
    }

    async fn detect_widget_inner(
        &self,
        page: &Page,
        registry: &DetectionRegistry,
        widget_type: Option<AntiBotSystem>,
    ) -> Result<Option<WidgetHandle>, String> {
        let snapshot = registry.snapshot(page).await.map_err(|e| e.to_string())?;
        let mut detections = registry.aggregate(&snapshot);
        if let Some(system) = widget_type {
            detections.retain(|d| d.system == system);
        }
        let Some(best) = detections.first().cloned() else {
            return Ok(None);
        };

        let fragment = iframe_fragment(registry, best.system);
        let frame_src = snapshot
            .iframe_srcs
            .iter()
            .find(|src| fragment.map(|f| src.contains(f)).unwrap_or(false))
            .cloned();

        let mut confidence = best.confidence;
        let (frame_src, frame_box) = match frame_src {
            Some(src) => {
                let frame_box = self
                    .iframe_box(page, &src)
                    .await
                    .map_err(|e| e.to_string())?
                    .unwrap_or_default();
                // Inner DOM confirmation: the frame actually renders
                if frame_box.width > 0.0 {
                    confidence = (confidence + 0.1).min(1.0);
                }
                (src, frame_box)
            }
            None => (String::new(), Rect::default()),
        };

        Ok(Some(WidgetHandle {
            widget_type: best.system,
            frame_src,
            frame_box,
            confidence,
        }))
    }

    /// Resolve a live widget frame by a URL substring.
    pub async fn switch_to_iframe(
        &self,
        page: &Page,
        url_substring: &str,
    ) -> InteractionOutcome<WidgetHandle> {
        let started = Instant::now();
        let script = format!(
            r"(() => {{
                const frame = Array.from(document.querySelectorAll('iframe'))
                    .find((f) => (f.src || '').includes({}));
                if (!frame) return null;
                const rect = frame.getBoundingClientRect();
                return {{ src: frame.src, x: rect.x, y: rect.y, width: rect.width, height: rect.height }};
            }})()",
            js_str(url_substring)
        );
        match page.evaluate(script).await {
            Ok(result) => match result.value() {
                Some(serde_json::Value::Object(map)) => {
                    let rect = Rect {
                        x: map.get("x").and_then(serde_json::Value::as_f64).unwrap_or(0.0),
                        y: map.get("y").and_then(serde_json::Value::as_f64).unwrap_or(0.0),
                        width: map.get("width").and_then(serde_json::Value::as_f64).unwrap_or(0.0),
                        height: map.get("height").and_then(serde_json::Value::as_f64).unwrap_or(0.0),
                    };
                    let src = map
                        .get("src")
                        .and_then(serde_json::Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    InteractionOutcome::ok(
                        WidgetHandle {
                            widget_type: AntiBotSystem::Recaptcha,
                            frame_src: src,
                            frame_box: rect,
                            confidence: 1.0,
                        },
                        started,
                    )
                }
                _ => InteractionOutcome::err(
                    format!("no iframe matching {url_substring:?}"),
                    started,
                ),
            },
            Err(e) => InteractionOutcome::err(e.to_string(), started),
        }
    }

    async fn iframe_box(&self, page: &Page, src: &str) -> Result<Option<Rect>, anyhow::Error> {
        let script = format!(
            r"(() => {{
                const frame = Array.from(document.querySelectorAll('iframe'))
                    .find((f) => (f.src || '') === {});
                if (!frame) return null;
                const rect = frame.getBoundingClientRect();
                return {{ x: rect.x, y: rect.y, width: rect.width, height: rect.height }};
            }})()",
            js_str(src)
        );
        let result = page.evaluate(script).await?;
        match result.value() {
            Some(value) if !value.is_null() => Ok(serde_json::from_value(value.clone()).ok()),
            _ => Ok(None),
        }
    }

    /// Try each strategy in order until one resolves within the timeout.
    pub async fn locate_element(
        &self,
        page: &Page,
        options: &LocatorOptions,
    ) -> InteractionOutcome<LocatedElement> {
        let started = Instant::now();
        let visible = options.visible && !self.force_clicks;
        loop {
            for strategy in &options.strategies {
                let script = locator_js(strategy, visible);
                match page.evaluate(script).await {
                    Ok(result) => {
                        if let Some(value) = result.value() {
                            if !value.is_null() {
                                if let Ok(rect) = serde_json::from_value::<Rect>(value.clone()) {
                                    return InteractionOutcome::ok(
                                        LocatedElement {
                                            strategy: strategy.name(),
                                            rect,
                                        },
                                        started,
                                    );
                                }
                            }
                        }
                    }
                    Err(e) => debug!("Locator {} errored: {e}", strategy.name()),
                }
            }
            if started.elapsed() >= options.timeout {
                return InteractionOutcome::err(
                    format!(
                        "no element resolved by {} strategies within {:?}",
                        options.strategies.len(),
                        options.timeout
                    ),
                    started,
                );
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Locate then click with an optional human-like pre-click delay.
    pub async fn click_element(
        &self,
        page: &Page,
        options: &LocatorOptions,
        human_delay: bool,
    ) -> InteractionOutcome<LocatedElement> {
        let located = self.locate_element(page, options).await;
        let started = Instant::now();
        let Some(element) = located.data.clone() else {
            return located;
        };

        if human_delay {
            let delay = {
                let mut rng = rand::rng();
                rng.random_range(self.click_delay_ms.0..=self.click_delay_ms.1.max(self.click_delay_ms.0))
            };
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let (x, y) = element.rect.center();
        match input::click_human_like(page, x, y, &self.input).await {
            Ok(()) => InteractionOutcome::ok(element, started),
            Err(e) => InteractionOutcome::err(format!("click failed: {e}"), started),
        }
    }

    /// Locate, focus, and type with human-like cadence.
    pub async fn type_text(
        &self,
        page: &Page,
        options: &LocatorOptions,
        text: &str,
    ) -> InteractionOutcome<LocatedElement> {
        let clicked = self.click_element(page, options, false).await;
        let started = Instant::now();
        let Some(element) = clicked.data.clone() else {
            return clicked;
        };

        let mut cfg = self.input.clone();
        cfg.inter_key_mean_ms = (self.typing_delay_ms.0 + self.typing_delay_ms.1) as f64 / 2.0;
        match input::type_human_like(page, text, &cfg).await {
            Ok(()) => InteractionOutcome::ok(element, started),
            Err(e) => InteractionOutcome::err(format!("typing failed: {e}"), started),
        }
    }

    /// Locate a `<select>` and choose the option with `value`.
    pub async fn select_option(
        &self,
        page: &Page,
        options: &LocatorOptions,
        value: &str,
    ) -> InteractionOutcome<LocatedElement> {
        let located = self.locate_element(page, options).await;
        let started = Instant::now();
        let Some(element) = located.data.clone() else {
            return located;
        };

        let Some(LocatorStrategy::Css(selector)) = options.strategies.first() else {
            return InteractionOutcome::err("select_option requires a CSS strategy first", started);
        };
        let script = format!(
            r"(() => {{
                const el = document.querySelector({});
                if (!el) return false;
                el.value = {};
                el.dispatchEvent(new Event('change', {{ bubbles: true }}));
                return true;
            }})()",
            js_str(selector),
            js_str(value)
        );
        match page.evaluate(script).await {
            Ok(result) if result.value().and_then(serde_json::Value::as_bool) == Some(true) => {
                InteractionOutcome::ok(element, started)
            }
            Ok(_) => InteractionOutcome::err("select element vanished", started),
            Err(e) => InteractionOutcome::err(e.to_string(), started),
        }
    }

    /// Write a debug screenshot when a directory is configured.
    pub async fn capture_debug_screenshot(
        &self,
        page: &Page,
        task_id: &str,
    ) -> InteractionOutcome<PathBuf> {
        let started = Instant::now();
        let Some(dir) = &self.debug_dir else {
            return InteractionOutcome::err("debug screenshots not configured", started);
        };
        let filename = format!("captcha-{task_id}-{}.png", chrono::Utc::now().timestamp_millis());
        let path = dir.join(filename);

        let params = chromiumoxide::page::ScreenshotParams::builder()
            .format(chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat::Png)
            .build();
        match page.screenshot(params).await {
            Ok(bytes) => {
                if let Err(e) = tokio::fs::create_dir_all(dir).await {
                    return InteractionOutcome::err(format!("mkdir failed: {e}"), started);
                }
                match tokio::fs::write(&path, bytes).await {
                    Ok(()) => InteractionOutcome::ok(path, started),
                    Err(e) => InteractionOutcome::err(format!("write failed: {e}"), started),
                }
            }
            Err(e) => {
                warn!("Debug screenshot failed: {e}");
                InteractionOutcome::err(e.to_string(), started)
            }
        }
    }
}

fn iframe_fragment(registry: &DetectionRegistry, system: AntiBotSystem) -> Option<&'static str> {
    registry
        .strategies()
        .iter()
        .find(|s| s.system == system)?
        .signals
        .iter()
        .find_map(|signal| match signal.probe {
            Probe::IframeSrc(fragment) => Some(fragment),
            _ => None,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locator_js_escapes_selectors() {
        let js = locator_js(&LocatorStrategy::Css("input[name=\"q\"]".to_string()), true);
        assert!(js.contains(r#"input[name=\"q\"]"#));
        assert!(js.contains("getBoundingClientRect"));
        assert!(js.contains("getComputedStyle"));
    }

    #[test]
    fn invisible_locator_skips_visibility_check() {
        let js = locator_js(&LocatorStrategy::Css("#hidden".to_string()), false);
        assert!(!js.contains("getComputedStyle"));
    }

    #[test]
    fn xpath_strategy_uses_document_evaluate() {
        let js = locator_js(&LocatorStrategy::XPath("//button[1]".to_string()), true);
        assert!(js.contains("document.evaluate"));
        assert!(js.contains("FIRST_ORDERED_NODE_TYPE"));
    }

    #[test]
    fn strategy_names_are_stable() {
        assert_eq!(LocatorStrategy::Css(String::new()).name(), "css");
        assert_eq!(LocatorStrategy::XPath(String::new()).name(), "xpath");
        assert_eq!(
            LocatorStrategy::Role { role: String::new(), name: String::new() }.name(),
            "role"
        );
        assert_eq!(LocatorStrategy::Text(String::new()).name(), "text");
        assert_eq!(LocatorStrategy::AriaLabel(String::new()).name(), "aria-label");
    }

    #[test]
    fn rect_center_is_midpoint() {
        let rect = Rect { x: 10.0, y: 20.0, width: 30.0, height: 40.0 };
        assert_eq!(rect.center(), (25.0, 40.0));
    }

    #[test]
    fn outcome_constructors_set_flags() {
        let started = Instant::now();
        let ok: InteractionOutcome<u32> = InteractionOutcome::ok(7, started);
        assert!(ok.success);
        assert_eq!(ok.data, Some(7));
        let err: InteractionOutcome<u32> = InteractionOutcome::err("boom", started);
        assert!(!err.success);
        assert_eq!(err.error.as_deref(), Some("boom"));
    }
}
