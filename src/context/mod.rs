//! Per-job browser context lifecycle
//!
//! Each job runs inside a dedicated CDP browser context: an isolated
//! cookie/storage partition on a pooled browser. Context creation applies
//! viewport, locale, timezone, optional proxy, HTTPS-error tolerance, the
//! stealth script set, and a route filter that aborts heavy static assets.
//! The context is destroyed at job end regardless of outcome; `close` is
//! idempotent and swallows individual cleanup failures.

pub mod input;
pub mod stealth;

pub use input::{Point, bezier_path, click_human_like, move_mouse_human_like, type_human_like};
pub use stealth::{StealthSession, check_ua_platform_consistency};

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context as _, Result};
use chromiumoxide::browser::Browser;
use chromiumoxide::cdp::browser_protocol::browser::BrowserContextId;
use chromiumoxide::cdp::browser_protocol::network::{CookieParam, TimeSinceEpoch};
use chromiumoxide::cdp::browser_protocol::storage::{ClearCookiesParams, GetCookiesParams, SetCookiesParams};
use chromiumoxide::cdp::browser_protocol::target::{CreateBrowserContextParams, CreateTargetParams, DisposeBrowserContextParams};
use chromiumoxide::{Page, cdp};
use tracing::{debug, warn};

use crate::config::StealthConfig;
use crate::scheduler::job::{BrowserStorage, CookieSpec, WaitUntil};

/// URL patterns aborted by the default route filter: images, fonts, and
/// video. Audio stays loadable so audio challenges can still be fetched.
const HEAVY_ASSET_PATTERNS: &[&str] = &[
    "*.png", "*.jpg", "*.jpeg", "*.gif", "*.webp", "*.svg", "*.ico", "*.woff", "*.woff2",
    "*.ttf", "*.otf", "*.eot", "*.mp4", "*.webm", "*.avi", "*.mov",
];

/// Proxy settings for a context.
#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub server: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Options for building a job context.
#[derive(Debug, Clone)]
pub struct ContextOptions {
    pub viewport: (u32, u32),
    pub user_agent: Option<String>,
    pub proxy: Option<ProxySettings>,
    pub ignore_https_errors: bool,
    /// When set, the heavy-asset route filter is not installed
    pub full_resource_loads: bool,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            viewport: (1920, 1080),
            user_agent: None,
            proxy: None,
            ignore_https_errors: true,
            full_resource_loads: false,
        }
    }
}

/// An isolated cookie/storage partition with one shared page.
pub struct JobContext {
    context_id: BrowserContextId,
    page: Page,
    stealth_session: StealthSession,
    closed: bool,
}

impl JobContext {
    /// Build a fresh context on `browser` and open its shared page.
    pub async fn create(
        browser: &Browser,
        stealth: &StealthConfig,
        options: &ContextOptions,
    ) -> Result<Self> {
        let create_params = CreateBrowserContextParams {
            dispose_on_detach: Some(true),
            proxy_server: options.proxy.as_ref().map(|p| p.server.clone()),
            proxy_bypass_list: None,
            origins_with_universal_network_access: None,
        };
        let created = browser
            .execute(create_params)
            .await
            .context("Failed to create browser context")?;
        let context_id = created.browser_context_id.clone();

        let target = CreateTargetParams::builder()
            .url("about:blank")
            .browser_context_id(context_id.clone())
            .build()
            .map_err(anyhow::Error::msg)?;
        let page = browser
            .new_page(target)
            .await
            .context("Failed to open context page")?;

        let stealth_session = StealthSession::roll(stealth);
        stealth::inject(&page, stealth, &stealth_session)
            .await
            .context("Stealth injection failed")?;

        page.execute(
            cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams::builder()
                .width(i64::from(options.viewport.0))
                .height(i64::from(options.viewport.1))
                .device_scale_factor(1.0)
                .mobile(false)
                .build()
                .map_err(anyhow::Error::msg)?,
        )
        .await
        .context("Failed to set viewport dimensions")?;

        if stealth.pin_timezone {
            let tz = cdp::browser_protocol::emulation::SetTimezoneOverrideParams::builder()
                .timezone_id(stealth.timezone_id.clone())
                .build()
                .map_err(anyhow::Error::msg)?;
            if let Err(e) = page.execute(tz).await {
                warn!("Timezone override rejected: {e}");
            }
        }

        if options.ignore_https_errors {
            page.execute(
                cdp::browser_protocol::security::SetIgnoreCertificateErrorsParams::builder()
                    .ignore(true)
                    .build()
                    .map_err(anyhow::Error::msg)?,
            )
            .await
            .context("Failed to relax certificate errors")?;
        }

        if let Some(ua) = &options.user_agent {
            check_ua_platform_consistency(ua, current_platform());
            page.execute(cdp::browser_protocol::network::SetUserAgentOverrideParams {
                user_agent: ua.clone(),
                accept_language: Some(format!("{},en;q=0.9", stealth.locale)),
                platform: None,
                user_agent_metadata: None,
            })
            .await
            .context("Failed to override user agent")?;
        }

        if let Some(proxy) = &options.proxy {
            if let (Some(user), Some(pass)) = (&proxy.username, &proxy.password) {
                apply_proxy_credentials(&page, user, pass).await?;
            }
        }

        if stealth.block_heavy_assets && !options.full_resource_loads {
            install_route_filter(&page).await?;
        }

        debug!("Job context created");
        Ok(Self {
            context_id,
            page,
            stealth_session,
            closed: false,
        })
    }

    /// The single page shared by every action of the job.
    #[must_use]
    pub fn page(&self) -> &Page {
        &self.page
    }

    #[must_use]
    pub fn stealth_session(&self) -> &StealthSession {
        &self.stealth_session
    }

    /// Navigate the shared page honoring the job's settle policy and timeout.
    pub async fn navigate(&self, url: &str, wait_until: WaitUntil, timeout: Duration) -> Result<()> {
        tokio::time::timeout(timeout, async {
            self.page.goto(url).await?;
            match wait_until {
                // goto resolves on the navigation response; DOMContentLoaded
                // has fired by the time the load event wait returns
                WaitUntil::Load | WaitUntil::DomContentLoaded => {
                    self.page.wait_for_navigation().await?;
                }
                WaitUntil::NetworkIdle => {
                    self.page.wait_for_navigation().await?;
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
            Ok::<_, anyhow::Error>(())
        })
        .await
        .map_err(|_| anyhow::anyhow!("navigation to {url} timed out after {timeout:?}"))??;
        Ok(())
    }

    /// Add the job's seeded cookies to this context.
    pub async fn apply_cookies(&self, cookies: &[CookieSpec], fallback_url: &str) -> Result<()> {
        if cookies.is_empty() {
            return Ok(());
        }
        let params: Vec<CookieParam> = cookies
            .iter()
            .filter_map(|c| cookie_param(c, fallback_url))
            .collect();
        self.page
            .execute(SetCookiesParams {
                cookies: params,
                browser_context_id: None,
            })
            .await
            .context("Failed to seed cookies")?;
        Ok(())
    }

    /// Install localStorage and sessionStorage entries on the shared page.
    ///
    /// Must run after the first navigation; storage is origin-scoped.
    pub async fn apply_web_storage(&self, storage: &BrowserStorage) -> Result<()> {
        if storage.local_storage.is_empty() && storage.session_storage.is_empty() {
            return Ok(());
        }
        let script = web_storage_script(&storage.local_storage, &storage.session_storage)?;
        self.page
            .evaluate(script)
            .await
            .context("Failed to seed web storage")?;
        Ok(())
    }

    /// Cookies currently visible in this context.
    pub async fn cookies(&self) -> Result<Vec<cdp::browser_protocol::network::Cookie>> {
        let result = self
            .page
            .execute(GetCookiesParams {
                browser_context_id: None,
            })
            .await
            .context("Failed to read cookies")?;
        Ok(result.cookies.clone())
    }

    /// Remove every cookie from this context.
    pub async fn clear_cookies(&self) -> Result<()> {
        self.page
            .execute(ClearCookiesParams {
                browser_context_id: None,
            })
            .await
            .context("Failed to clear cookies")?;
        Ok(())
    }

    /// Clear localStorage and sessionStorage if the page is still live.
    pub async fn clear_web_storage(&self) -> Result<()> {
        self.page
            .evaluate("try { localStorage.clear(); sessionStorage.clear(); } catch (e) {}")
            .await
            .context("Failed to clear web storage")?;
        Ok(())
    }

    /// Close the page and dispose the context. Safe to call repeatedly;
    /// individual failures are logged and skipped.
    pub async fn close(&mut self, browser: &Browser) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Err(e) = self.page.clone().close().await {
            warn!("Failed to close context page: {e}");
        }
        let dispose = DisposeBrowserContextParams {
            browser_context_id: self.context_id.clone(),
        };
        if let Err(e) = browser.execute(dispose).await {
            warn!("Failed to dispose browser context: {e}");
        }
        debug!("Job context closed");
    }
}

/// Abort requests for large static assets to cut memory footprint.
async fn install_route_filter(page: &Page) -> Result<()> {
    page.execute(cdp::browser_protocol::network::EnableParams::default())
        .await
        .context("Failed to enable network domain")?;
    page.execute(cdp::browser_protocol::network::SetBlockedUrLsParams {
        urls: HEAVY_ASSET_PATTERNS.iter().map(ToString::to_string).collect(),
    })
    .await
    .context("Failed to install route filter")?;
    Ok(())
}

/// HTTP proxies accepting Proxy-Authorization get credentials as a header.
async fn apply_proxy_credentials(page: &Page, username: &str, password: &str) -> Result<()> {
    use base64::Engine;
    let token = base64::engine::general_purpose::STANDARD.encode(format!("{username}:{password}"));
    let mut headers = serde_json::Map::new();
    headers.insert(
        "Proxy-Authorization".to_string(),
        serde_json::Value::String(format!("Basic {token}")),
    );
    page.execute(cdp::browser_protocol::network::SetExtraHttpHeadersParams {
        headers: cdp::browser_protocol::network::Headers::new(serde_json::Value::Object(headers)),
    })
    .await
    .context("Failed to set proxy credentials")?;
    Ok(())
}

fn cookie_param(spec: &CookieSpec, fallback_url: &str) -> Option<CookieParam> {
    let mut builder = CookieParam::builder().name(&spec.name).value(&spec.value);
    match &spec.domain {
        Some(domain) => builder = builder.domain(domain),
        None => builder = builder.url(fallback_url),
    }
    if let Some(path) = &spec.path {
        builder = builder.path(path);
    }
    builder = builder.secure(spec.secure).http_only(spec.http_only);
    if let Some(expires) = spec.expires {
        builder = builder.expires(TimeSinceEpoch::new(expires));
    }
    match builder.build() {
        Ok(param) => Some(param),
        Err(e) => {
            warn!("Skipping malformed cookie {}: {e}", spec.name);
            None
        }
    }
}

fn web_storage_script(
    local: &HashMap<String, String>,
    session: &HashMap<String, String>,
) -> Result<String> {
    let local_json = serde_json::to_string(local)?;
    let session_json = serde_json::to_string(session)?;
    Ok(format!(
        r"(() => {{
            const local = {local_json};
            const session = {session_json};
            for (const [k, v] of Object.entries(local)) localStorage.setItem(k, v);
            for (const [k, v] of Object.entries(session)) sessionStorage.setItem(k, v);
        }})()"
    ))
}

fn current_platform() -> &'static str {
    if cfg!(target_os = "windows") {
        "Win32"
    } else if cfg!(target_os = "macos") {
        "MacIntel"
    } else {
        "Linux x86_64"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_script_escapes_values() {
        let mut local = HashMap::new();
        local.insert("token".to_string(), "a\"b\\c".to_string());
        let session = HashMap::new();
        let script = web_storage_script(&local, &session).expect("script builds");
        assert!(script.contains(r#"a\"b\\c"#));
        assert!(script.contains("localStorage.setItem"));
    }

    #[test]
    fn default_options_relax_https_and_block_assets() {
        let options = ContextOptions::default();
        assert!(options.ignore_https_errors);
        assert!(!options.full_resource_loads);
    }

    #[test]
    fn heavy_asset_patterns_cover_images_fonts_video() {
        assert!(HEAVY_ASSET_PATTERNS.contains(&"*.png"));
        assert!(HEAVY_ASSET_PATTERNS.contains(&"*.woff2"));
        assert!(HEAVY_ASSET_PATTERNS.contains(&"*.mp4"));
    }
}
