//! Native in-process solvers.
//!
//! These drive the widget through the page itself, producing the same token
//! or clearance cookie a human interaction would. No external API is
//! involved.

pub mod akamai;
pub mod datadome;
pub mod hcaptcha;
pub mod recaptcha;
pub mod turnstile;

pub use akamai::AkamaiSolver;
pub use datadome::DatadomeSolver;
pub use hcaptcha::HcaptchaSolver;
pub use recaptcha::RecaptchaSolver;
pub use turnstile::TurnstileSolver;

use std::time::{Duration, Instant};

use chromiumoxide::Page;

use crate::error::{AutomationError, AutomationResult};

/// Poll a JS expression until it yields a non-empty string or the deadline
/// passes. The expression must evaluate to a string or null.
pub(crate) async fn poll_for_string(
    page: &Page,
    expression: &str,
    timeout: Duration,
    interval: Duration,
) -> AutomationResult<Option<String>> {
    let started = Instant::now();
    loop {
        let result = page.evaluate(expression.to_string()).await.map_err(AutomationError::from)?;
        if let Some(value) = result.value().and_then(serde_json::Value::as_str) {
            if !value.is_empty() {
                return Ok(Some(value.to_string()));
            }
        }
        if started.elapsed() >= timeout {
            return Ok(None);
        }
        tokio::time::sleep(interval).await;
    }
}

/// Read a cookie value visible to the page by name.
pub(crate) async fn cookie_value(page: &Page, name: &str) -> AutomationResult<Option<String>> {
    let script = format!(
        r"(() => {{
            const entry = document.cookie.split(';').map((c) => c.trim())
                .find((c) => c.startsWith({} + '='));
            return entry ? entry.substring(entry.indexOf('=') + 1) : null;
        }})()",
        serde_json::to_string(name).unwrap_or_default()
    );
    let result = page.evaluate(script).await.map_err(AutomationError::from)?;
    Ok(result
        .value()
        .and_then(serde_json::Value::as_str)
        .map(ToString::to_string))
}

/// Extract the widget sitekey from the canonical data attribute.
pub(crate) async fn extract_sitekey(page: &Page, selector: &str) -> AutomationResult<Option<String>> {
    let script = format!(
        r"(() => {{
            const el = document.querySelector({});
            return el ? el.getAttribute('data-sitekey') : null;
        }})()",
        serde_json::to_string(selector).unwrap_or_default()
    );
    let result = page.evaluate(script).await.map_err(AutomationError::from)?;
    Ok(result
        .value()
        .and_then(serde_json::Value::as_str)
        .map(ToString::to_string))
}
