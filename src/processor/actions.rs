//! Action registry and built-in handlers (the closed action set).
//!
//! Handlers are registered by tag and executed against the job's shared
//! page. Each returns data and/or an artifact; raising an error fails the
//! action and hands the job to the retry policy.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::Page;
use serde_json::{Value, json};
use tracing::{debug, info};
use uuid::Uuid;

use crate::captcha::detection::DetectionRegistry;
use crate::captcha::solver::SolverOrchestrator;
use crate::captcha::types::{CaptchaChallenge, ChallengeType, SolutionKind};
use crate::config::HumanInputConfig;
use crate::context::{JobContext, input};
use crate::error::{AutomationError, AutomationResult};
use crate::scheduler::job::{Action, Artifact, WaitUntil};

/// Execution environment handed to every handler.
pub struct ActionContext<'a> {
    pub page: &'a Page,
    pub job_context: &'a JobContext,
    pub job_id: Uuid,
    pub cancelled: Arc<std::sync::atomic::AtomicBool>,
    pub input: &'a HumanInputConfig,
    /// Fallback deadline for actions without their own `timeout_ms`
    pub default_timeout: Duration,
    pub default_wait_until: WaitUntil,
}

/// What a handler produced.
#[derive(Debug, Default)]
pub struct ActionEffect {
    pub data: Option<Value>,
    pub artifact: Option<Artifact>,
}

impl ActionEffect {
    #[must_use]
    pub fn data(value: Value) -> Self {
        Self {
            data: Some(value),
            artifact: None,
        }
    }
}

/// One step implementation, registered by tag.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn execute(&self, ctx: &ActionContext<'_>, action: &Action) -> AutomationResult<ActionEffect>;
}

/// Tag-keyed handler registry.
pub struct ActionRegistry {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
}

impl ActionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Registry pre-populated with the built-in handlers.
    #[must_use]
    pub fn with_builtins(
        detection: Arc<DetectionRegistry>,
        orchestrator: Arc<SolverOrchestrator>,
    ) -> Self {
        let mut registry = Self::new();
        registry.register("navigate", Arc::new(NavigateHandler));
        registry.register("click", Arc::new(ClickHandler));
        registry.register("fill", Arc::new(FillHandler));
        registry.register("screenshot", Arc::new(ScreenshotHandler));
        registry.register("evaluate", Arc::new(EvaluateHandler));
        registry.register("wait", Arc::new(WaitHandler));
        registry.register("extract", Arc::new(ExtractHandler));
        registry.register(
            "solveCaptcha",
            Arc::new(SolveCaptchaHandler {
                detection,
                orchestrator,
            }),
        );
        registry
    }

    pub fn register(&mut self, name: &str, handler: Arc<dyn ActionHandler>) {
        self.handlers.insert(name.to_string(), handler);
    }

    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.get(name).cloned()
    }

    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Element helpers
// =============================================================================

/// Poll `find_element` until it resolves or the deadline passes.
async fn wait_for_element(
    page: &Page,
    selector: &str,
    timeout: Duration,
) -> AutomationResult<chromiumoxide::element::Element> {
    let started = std::time::Instant::now();
    loop {
        match page.find_element(selector).await {
            Ok(element) => return Ok(element),
            Err(_) if started.elapsed() < timeout => {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            Err(e) => {
                return Err(AutomationError::timeout(
                    "element_wait",
                    format!("selector {selector:?} did not resolve within {timeout:?}: {e}"),
                ));
            }
        }
    }
}

async fn element_center(page: &Page, selector: &str) -> AutomationResult<(f64, f64)> {
    let script = format!(
        r"(() => {{
            const el = document.querySelector({});
            if (!el) return null;
            const rect = el.getBoundingClientRect();
            return [rect.x + rect.width / 2, rect.y + rect.height / 2];
        }})()",
        serde_json::to_string(selector)
            .map_err(|e| AutomationError::internal("selector_encode", e.to_string()))?
    );
    let result = page.evaluate(script).await.map_err(AutomationError::from)?;
    let coords: Option<(f64, f64)> = result
        .value()
        .and_then(|v| serde_json::from_value(v.clone()).ok());
    coords.ok_or_else(|| {
        AutomationError::invalid_input("element_gone", format!("selector {selector:?} vanished"))
    })
}

// =============================================================================
// Built-in handlers
// =============================================================================

struct NavigateHandler;

#[async_trait]
impl ActionHandler for NavigateHandler {
    async fn execute(&self, ctx: &ActionContext<'_>, action: &Action) -> AutomationResult<ActionEffect> {
        let Action::Navigate { url, wait_until, timeout_ms } = action else {
            return Err(wrong_action("navigate"));
        };
        let timeout = timeout_ms.map_or(ctx.default_timeout, Duration::from_millis);
        ctx.job_context
            .navigate(url, wait_until.unwrap_or(ctx.default_wait_until), timeout)
            .await
            .map_err(|e| AutomationError::classify(&e))?;
        Ok(ActionEffect::data(json!({ "url": url })))
    }
}

struct ClickHandler;

#[async_trait]
impl ActionHandler for ClickHandler {
    async fn execute(&self, ctx: &ActionContext<'_>, action: &Action) -> AutomationResult<ActionEffect> {
        let Action::Click { selector, human_like, timeout_ms } = action else {
            return Err(wrong_action("click"));
        };
        let timeout = timeout_ms.map_or(ctx.default_timeout, Duration::from_millis);
        let element = wait_for_element(ctx.page, selector, timeout).await?;
        if *human_like {
            let (x, y) = element_center(ctx.page, selector).await?;
            input::click_human_like(ctx.page, x, y, ctx.input)
                .await
                .map_err(|e| AutomationError::classify(&e))?;
        } else {
            element
                .click()
                .await
                .map_err(|e| AutomationError::network("click_failed", e.to_string()))?;
        }
        Ok(ActionEffect::data(json!({ "selector": selector })))
    }
}

struct FillHandler;

#[async_trait]
impl ActionHandler for FillHandler {
    async fn execute(&self, ctx: &ActionContext<'_>, action: &Action) -> AutomationResult<ActionEffect> {
        let Action::Fill { selector, value, human_like, timeout_ms } = action else {
            return Err(wrong_action("fill"));
        };
        let timeout = timeout_ms.map_or(ctx.default_timeout, Duration::from_millis);
        let element = wait_for_element(ctx.page, selector, timeout).await?;
        element
            .click()
            .await
            .map_err(|e| AutomationError::network("fill_focus", e.to_string()))?;
        if *human_like {
            input::type_human_like(ctx.page, value, ctx.input)
                .await
                .map_err(|e| AutomationError::classify(&e))?;
        } else {
            element
                .type_str(value)
                .await
                .map_err(|e| AutomationError::network("fill_type", e.to_string()))?;
        }
        Ok(ActionEffect::data(json!({ "selector": selector, "length": value.len() })))
    }
}

struct ScreenshotHandler;

#[async_trait]
impl ActionHandler for ScreenshotHandler {
    async fn execute(&self, ctx: &ActionContext<'_>, action: &Action) -> AutomationResult<ActionEffect> {
        let Action::Screenshot { format, full_page } = action else {
            return Err(wrong_action("screenshot"));
        };
        use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
        let (cdp_format, content_type) = match format.to_ascii_lowercase().as_str() {
            "jpeg" | "jpg" => (CaptureScreenshotFormat::Jpeg, "image/jpeg"),
            _ => (CaptureScreenshotFormat::Png, "image/png"),
        };
        let params = chromiumoxide::page::ScreenshotParams::builder()
            .format(cdp_format)
            .full_page(*full_page)
            .build();
        let bytes = ctx
            .page
            .screenshot(params)
            .await
            .map_err(|e| AutomationError::network("screenshot", e.to_string()))?;
        debug!(job_id = %ctx.job_id, size = bytes.len(), "Screenshot captured");
        Ok(ActionEffect {
            data: Some(json!({ "contentType": content_type, "size": bytes.len() })),
            artifact: Some(Artifact {
                content_type: content_type.to_string(),
                size: bytes.len(),
                data: bytes,
            }),
        })
    }
}

struct EvaluateHandler;

#[async_trait]
impl ActionHandler for EvaluateHandler {
    async fn execute(&self, ctx: &ActionContext<'_>, action: &Action) -> AutomationResult<ActionEffect> {
        let Action::Evaluate { script } = action else {
            return Err(wrong_action("evaluate"));
        };
        let result = ctx
            .page
            .evaluate(script.clone())
            .await
            .map_err(AutomationError::from)?;
        Ok(ActionEffect::data(result.value().cloned().unwrap_or(Value::Null)))
    }
}

struct WaitHandler;

#[async_trait]
impl ActionHandler for WaitHandler {
    async fn execute(&self, ctx: &ActionContext<'_>, action: &Action) -> AutomationResult<ActionEffect> {
        let Action::Wait { ms, selector, timeout_ms } = action else {
            return Err(wrong_action("wait"));
        };
        if let Some(ms) = ms {
            tokio::time::sleep(Duration::from_millis(*ms)).await;
        }
        if let Some(selector) = selector {
            let timeout = timeout_ms.map_or(ctx.default_timeout, Duration::from_millis);
            wait_for_element(ctx.page, selector, timeout).await?;
        }
        Ok(ActionEffect::default())
    }
}

struct ExtractHandler;

#[async_trait]
impl ActionHandler for ExtractHandler {
    async fn execute(&self, ctx: &ActionContext<'_>, action: &Action) -> AutomationResult<ActionEffect> {
        let Action::Extract { selector, attribute, multiple } = action else {
            return Err(wrong_action("extract"));
        };
        let accessor = match attribute {
            Some(attr) => format!(
                "el.getAttribute({})",
                serde_json::to_string(attr)
                    .map_err(|e| AutomationError::internal("attr_encode", e.to_string()))?
            ),
            None => "el.textContent".to_string(),
        };
        let selector_json = serde_json::to_string(selector)
            .map_err(|e| AutomationError::internal("selector_encode", e.to_string()))?;
        let script = if *multiple {
            format!(
                "Array.from(document.querySelectorAll({selector_json})).map((el) => {accessor})"
            )
        } else {
            format!(
                "(() => {{ const el = document.querySelector({selector_json}); return el ? {accessor} : null; }})()"
            )
        };
        let result = ctx
            .page
            .evaluate(script)
            .await
            .map_err(AutomationError::from)?;
        Ok(ActionEffect::data(result.value().cloned().unwrap_or(Value::Null)))
    }
}

/// Detects the page's anti-bot system (unless a hint pins the challenge
/// type) and routes it through the solver orchestrator.
struct SolveCaptchaHandler {
    detection: Arc<DetectionRegistry>,
    orchestrator: Arc<SolverOrchestrator>,
}

#[async_trait]
impl ActionHandler for SolveCaptchaHandler {
    async fn execute(&self, ctx: &ActionContext<'_>, action: &Action) -> AutomationResult<ActionEffect> {
        let Action::SolveCaptcha { challenge_hint } = action else {
            return Err(wrong_action("solveCaptcha"));
        };

        let page_url = ctx
            .page
            .url()
            .await
            .map_err(AutomationError::from)?
            .unwrap_or_default();

        let (challenge_type, confidence) = match challenge_hint {
            Some(hint) => (parse_challenge_hint(hint)?, 1.0),
            None => {
                let detections = self.detection.detect(ctx.page).await?;
                let best = detections
                    .into_iter()
                    .find(|d| self.detection.is_actionable(d))
                    .ok_or_else(|| {
                        AutomationError::invalid_input(
                            "no_challenge_detected",
                            "no actionable anti-bot challenge on page",
                        )
                    })?;
                (
                    crate::captcha::solver::default_challenge_type(best.system),
                    best.confidence,
                )
            }
        };

        let mut challenge = CaptchaChallenge::new(challenge_type, page_url);
        challenge.confidence = confidence;
        challenge.cancelled = Arc::clone(&ctx.cancelled);
        challenge.sitekey = sitekey_for(ctx.page, challenge_type).await?;

        let solution = self.orchestrator.solve(&challenge, ctx.page).await?;
        info!(
            job_id = %ctx.job_id,
            solver = %solution.solver_id,
            "Captcha solved"
        );
        Ok(ActionEffect::data(json!({
            "token": solution.value,
            "kind": match solution.kind {
                SolutionKind::Token => "token",
                SolutionKind::Cookie => "cookie",
            },
            "solverId": solution.solver_id,
            "solvedAt": solution.solved_at.to_rfc3339(),
        })))
    }
}

fn wrong_action(expected: &str) -> AutomationError {
    AutomationError::internal(
        "handler_mismatch",
        format!("handler {expected} received a different action variant"),
    )
}

/// A hint names the challenge type in its wire spelling,
/// e.g. `recaptchaV2Checkbox`.
fn parse_challenge_hint(hint: &str) -> AutomationResult<ChallengeType> {
    serde_json::from_value(Value::String(hint.to_string())).map_err(|_| {
        AutomationError::invalid_input("bad_challenge_hint", format!("unknown challenge type: {hint}"))
    })
}

async fn sitekey_for(page: &Page, challenge_type: ChallengeType) -> AutomationResult<Option<String>> {
    use crate::captcha::types::AntiBotSystem;
    let selector = match challenge_type.system() {
        AntiBotSystem::Recaptcha => ".g-recaptcha",
        AntiBotSystem::Hcaptcha => ".h-captcha",
        AntiBotSystem::Turnstile => ".cf-turnstile",
        _ => return Ok(None),
    };
    let script = format!(
        "(() => {{ const el = document.querySelector('{selector}'); return el ? el.getAttribute('data-sitekey') : null; }})()"
    );
    let result = page.evaluate(script).await.map_err(AutomationError::from)?;
    Ok(result
        .value()
        .and_then(Value::as_str)
        .map(ToString::to_string))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn challenge_hints_use_wire_spelling() {
        assert_eq!(
            parse_challenge_hint("recaptchaV2Checkbox").expect("hint parses"),
            ChallengeType::RecaptchaV2Checkbox
        );
        assert_eq!(
            parse_challenge_hint("akamaiLevel2").expect("hint parses"),
            ChallengeType::AkamaiLevel2
        );
        assert!(parse_challenge_hint("unknownThing").is_err());
    }

    #[test]
    fn registry_lookup_by_tag() {
        let mut registry = ActionRegistry::new();
        registry.register("navigate", Arc::new(NavigateHandler));
        assert!(registry.lookup("navigate").is_some());
        assert!(registry.lookup("teleport").is_none());
        assert_eq!(registry.names(), vec!["navigate"]);
    }
}
