//! Per-family browser launching.
//!
//! Chromium is the first-class family: executable discovery covers the usual
//! install locations with a managed download as a last resort, and the launch
//! args are tuned for headless stability. Firefox and WebKit builds are
//! driven over the same wire protocol when an executable is configured; they
//! have no managed download path.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use chromiumoxide::browser::{Browser, BrowserConfigBuilder, HeadlessMode};
use chromiumoxide::fetcher::{BrowserFetcher, BrowserFetcherOptions};
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::scheduler::job::BrowserFamily;

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36";

/// Resolve the executable for a browser family.
///
/// Chromium: `CHROMIUM_PATH` override, well-known install paths, `which`,
/// then a managed download. Firefox/WebKit: explicit env override or `which`
/// only; without one the family is unavailable on this worker.
pub async fn resolve_executable(family: BrowserFamily) -> Result<PathBuf> {
    match family {
        BrowserFamily::Chromium => resolve_chromium().await,
        BrowserFamily::Firefox => {
            resolve_from_env_or_which("BROWSERMILL_FIREFOX_PATH", &["firefox", "firefox-esr"])
                .context("no Firefox executable configured for this worker")
        }
        BrowserFamily::Webkit => {
            resolve_from_env_or_which("BROWSERMILL_WEBKIT_PATH", &["MiniBrowser"])
                .context("no WebKit executable configured for this worker")
        }
    }
}

async fn resolve_chromium() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("CHROMIUM_PATH") {
        let path = PathBuf::from(path);
        if path.exists() {
            info!("Using browser from CHROMIUM_PATH: {}", path.display());
            return Ok(path);
        }
        warn!("CHROMIUM_PATH points to non-existent file: {}", path.display());
    }

    let candidates: &[&str] = if cfg!(target_os = "macos") {
        &[
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
            "/opt/homebrew/bin/chromium",
        ]
    } else if cfg!(target_os = "windows") {
        &[
            r"C:\Program Files\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files\Chromium\Application\chrome.exe",
        ]
    } else {
        &[
            "/usr/bin/google-chrome",
            "/usr/bin/google-chrome-stable",
            "/usr/bin/chromium",
            "/usr/bin/chromium-browser",
            "/snap/bin/chromium",
            "/opt/google/chrome/chrome",
        ]
    };

    for candidate in candidates {
        let path = PathBuf::from(candidate);
        if path.exists() {
            info!("Found browser at: {}", path.display());
            return Ok(path);
        }
    }

    if let Some(path) = which_first(&["chromium", "chromium-browser", "google-chrome", "chrome"]) {
        return Ok(path);
    }

    warn!("No Chrome/Chromium executable found; downloading managed browser");
    download_managed_browser().await
}

fn resolve_from_env_or_which(env_key: &str, commands: &[&str]) -> Result<PathBuf> {
    if let Ok(path) = std::env::var(env_key) {
        let path = PathBuf::from(path);
        if path.exists() {
            return Ok(path);
        }
        warn!("{env_key} points to non-existent file: {}", path.display());
    }
    which_first(commands).context("executable not found on PATH")
}

fn which_first(commands: &[&str]) -> Option<PathBuf> {
    if cfg!(target_os = "windows") {
        return None;
    }
    for cmd in commands {
        if let Ok(output) = Command::new("which").arg(cmd).output() {
            if output.status.success() {
                let path_str = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if !path_str.is_empty() {
                    let path = PathBuf::from(path_str);
                    info!("Found browser using 'which': {}", path.display());
                    return Some(path);
                }
            }
        }
    }
    None
}

/// Download a managed Chromium build into a cache directory.
pub async fn download_managed_browser() -> Result<PathBuf> {
    let cache_dir = std::env::temp_dir().join("browsermill_chromium_cache");
    std::fs::create_dir_all(&cache_dir).context("Failed to create browser cache directory")?;

    let fetcher = BrowserFetcher::new(
        BrowserFetcherOptions::builder()
            .with_path(&cache_dir)
            .build()
            .context("Failed to build fetcher options")?,
    );
    let revision_info = fetcher.fetch().await.context("Failed to fetch browser")?;
    info!("Downloaded Chromium to: {}", revision_info.folder_path.display());
    Ok(revision_info.executable_path)
}

/// Launch args tuned for headless stability per family.
#[must_use]
pub fn launch_args(family: BrowserFamily) -> Vec<&'static str> {
    match family {
        BrowserFamily::Chromium => vec![
            "--disable-blink-features=AutomationControlled",
            "--disable-infobars",
            "--disable-notifications",
            "--disable-dev-shm-usage",
            "--disable-software-rasterizer",
            "--disable-features=IsolateOrigins,site-per-process",
            "--disable-setuid-sandbox",
            "--no-first-run",
            "--no-default-browser-check",
            "--no-sandbox",
            "--ignore-certificate-errors",
            "--disable-extensions",
            "--disable-popup-blocking",
            "--disable-background-networking",
            "--disable-background-timer-throttling",
            "--disable-backgrounding-occluded-windows",
            "--disable-breakpad",
            "--disable-hang-monitor",
            "--disable-ipc-flooding-protection",
            "--disable-prompt-on-repost",
            "--metrics-recording-only",
            "--password-store=basic",
            "--use-mock-keychain",
            "--hide-scrollbars",
            "--mute-audio",
        ],
        // Gecko/WebKit builds take the shared subset their CDP shims accept
        BrowserFamily::Firefox | BrowserFamily::Webkit => vec![
            "--no-first-run",
            "--mute-audio",
        ],
    }
}

/// Launched browser plus its event-handler task and profile directory.
///
/// The handler MUST be aborted when the browser is discarded; the pool's
/// handle wrapper does this on drop.
pub struct LaunchedBrowser {
    pub browser: Browser,
    pub handler: JoinHandle<()>,
    pub user_data_dir: PathBuf,
}

/// Launch a browser of `family` with a fresh profile directory.
pub async fn launch_browser(family: BrowserFamily, headless: bool) -> Result<LaunchedBrowser> {
    let executable = resolve_executable(family).await?;
    let profile = super::profile::create_unique_profile()
        .context("Failed to create browser profile")?;
    let user_data_dir = profile.into_path();

    let mut config_builder = BrowserConfigBuilder::default()
        .request_timeout(Duration::from_secs(30))
        .window_size(1920, 1080)
        .user_data_dir(user_data_dir.clone())
        .chrome_executable(executable)
        .arg(format!("--user-agent={DEFAULT_USER_AGENT}"));

    if headless {
        config_builder = config_builder.headless_mode(HeadlessMode::default());
    } else {
        config_builder = config_builder.with_head();
    }

    for arg in launch_args(family) {
        config_builder = config_builder.arg(arg);
    }

    let browser_config = config_builder
        .build()
        .map_err(|e| anyhow::anyhow!("Failed to build browser config: {e}"))?;

    let (browser, mut handler) = Browser::launch(browser_config)
        .await
        .with_context(|| format!("Failed to launch {family} browser"))?;

    let handler_task = tokio::task::spawn(async move {
        while let Some(event) = handler.next().await {
            if let Err(e) = event {
                tracing::error!("Browser handler error: {:?}", e);
            }
        }
    });

    Ok(LaunchedBrowser {
        browser,
        handler: handler_task,
        user_data_dir,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chromium_args_cover_headless_stability() {
        let args = launch_args(BrowserFamily::Chromium);
        assert!(args.contains(&"--no-sandbox"));
        assert!(args.contains(&"--disable-dev-shm-usage"));
        assert!(args.contains(&"--disable-blink-features=AutomationControlled"));
    }

    #[test]
    fn non_chromium_args_are_minimal() {
        assert!(launch_args(BrowserFamily::Firefox).len() < launch_args(BrowserFamily::Chromium).len());
    }
}
