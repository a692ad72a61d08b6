//! Anti-bot system detection (C5).
//!
//! Each registered strategy scores a page snapshot against its vendor's
//! fingerprint: iframe sources, DOM selectors, cookie names, and global
//! objects, each signal carrying a weight. Confidence is the weighted sum
//! capped at 1.0, so it is monotone nondecreasing in the number of
//! corroborating signals. Results are memoized by page URL with a TTL to
//! avoid repeating DOM evaluations in polling loops.

use std::time::{Duration, Instant};

use chromiumoxide::Page;
use dashmap::DashMap;
use serde::Deserialize;
use tracing::debug;

use crate::config::CaptchaConfig;
use crate::error::{AutomationError, AutomationResult};

use super::types::AntiBotSystem;

/// How a signal is probed on the page.
#[derive(Debug, Clone)]
pub enum Probe {
    /// An iframe whose src contains this fragment
    IframeSrc(&'static str),
    /// A DOM selector that resolves
    Selector(&'static str),
    /// A cookie with this name
    Cookie(&'static str),
    /// A global object present on `window`
    Global(&'static str),
}

/// One weighted fingerprint signal.
#[derive(Debug, Clone)]
pub struct Signal {
    pub probe: Probe,
    pub weight: f64,
    pub description: &'static str,
}

/// Fingerprint for one anti-bot system.
#[derive(Debug, Clone)]
pub struct SystemStrategy {
    pub system: AntiBotSystem,
    pub signals: Vec<Signal>,
}

/// Everything detection needs from the page, gathered in one evaluation.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageSnapshot {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub iframe_srcs: Vec<String>,
    #[serde(default)]
    pub selectors_present: Vec<String>,
    #[serde(default)]
    pub cookie_names: Vec<String>,
    #[serde(default)]
    pub globals_present: Vec<String>,
}

impl PageSnapshot {
    fn matches(&self, probe: &Probe) -> bool {
        match probe {
            Probe::IframeSrc(fragment) => {
                self.iframe_srcs.iter().any(|src| src.contains(fragment))
            }
            Probe::Selector(selector) => {
                self.selectors_present.iter().any(|s| s == selector)
            }
            Probe::Cookie(name) => self.cookie_names.iter().any(|c| c == name),
            Probe::Global(name) => self.globals_present.iter().any(|g| g == name),
        }
    }
}

/// One system's detection verdict.
#[derive(Debug, Clone)]
pub struct Detection {
    pub system: AntiBotSystem,
    /// Weighted signal sum capped at 1.0
    pub confidence: f64,
    /// Descriptions of the signals that fired
    pub signals: Vec<&'static str>,
}

#[derive(Clone)]
struct CachedDetections {
    detections: Vec<Detection>,
    cached_at: Instant,
}

/// Multi-strategy detection registry with TTL memoization.
pub struct DetectionRegistry {
    strategies: Vec<SystemStrategy>,
    cache: DashMap<String, CachedDetections>,
    cache_ttl: Duration,
    min_confidence: f64,
    strong_confidence: f64,
}

impl DetectionRegistry {
    /// Registry with the built-in vendor fingerprints.
    #[must_use]
    pub fn with_defaults(config: &CaptchaConfig) -> Self {
        Self {
            strategies: default_strategies(),
            cache: DashMap::new(),
            cache_ttl: config.detection_cache_ttl,
            min_confidence: config.detection_min_confidence,
            strong_confidence: config.detection_strong_confidence,
        }
    }

    /// Replace or add the strategy for a system.
    pub fn register(&mut self, strategy: SystemStrategy) {
        self.strategies.retain(|s| s.system != strategy.system);
        self.strategies.push(strategy);
    }

    #[must_use]
    pub fn strategies(&self) -> &[SystemStrategy] {
        &self.strategies
    }

    /// Score one strategy against a snapshot.
    #[must_use]
    pub fn score(strategy: &SystemStrategy, snapshot: &PageSnapshot) -> Detection {
        let mut confidence = 0.0;
        let mut signals = Vec::new();
        for signal in &strategy.signals {
            if snapshot.matches(&signal.probe) {
                confidence += signal.weight;
                signals.push(signal.description);
            }
        }
        Detection {
            system: strategy.system,
            confidence: confidence.min(1.0),
            signals,
        }
    }

    /// Score every strategy, keeping max confidence per system above the
    /// minimum threshold, strongest first.
    #[must_use]
    pub fn aggregate(&self, snapshot: &PageSnapshot) -> Vec<Detection> {
        let mut detections: Vec<Detection> = self
            .strategies
            .iter()
            .map(|strategy| Self::score(strategy, snapshot))
            .filter(|d| d.confidence >= self.min_confidence)
            .collect();
        detections.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        detections
    }

    /// Detect anti-bot systems on `page`, memoized by URL.
    pub async fn detect(&self, page: &Page) -> AutomationResult<Vec<Detection>> {
        let url = page
            .url()
            .await
            .map_err(AutomationError::from)?
            .unwrap_or_default();

        if let Some(cached) = self.cache.get(&url) {
            if cached.cached_at.elapsed() < self.cache_ttl {
                debug!(%url, "Detection cache hit");
                return Ok(cached.detections.clone());
            }
        }

        let snapshot = self.snapshot(page).await?;
        let detections = self.aggregate(&snapshot);
        if !url.is_empty() {
            self.cache.insert(
                url,
                CachedDetections {
                    detections: detections.clone(),
                    cached_at: Instant::now(),
                },
            );
        }
        Ok(detections)
    }

    /// A detection at or above the strong threshold is actionable.
    #[must_use]
    pub fn is_actionable(&self, detection: &Detection) -> bool {
        detection.confidence >= self.strong_confidence
    }

    /// Drop every memoized result.
    pub fn invalidate(&self) {
        self.cache.clear();
    }

    /// Gather the page snapshot in a single DOM evaluation.
    pub async fn snapshot(&self, page: &Page) -> AutomationResult<PageSnapshot> {
        let selectors: Vec<&str> = self
            .strategies
            .iter()
            .flat_map(|s| s.signals.iter())
            .filter_map(|signal| match signal.probe {
                Probe::Selector(sel) => Some(sel),
                _ => None,
            })
            .collect();
        let globals: Vec<&str> = self
            .strategies
            .iter()
            .flat_map(|s| s.signals.iter())
            .filter_map(|signal| match signal.probe {
                Probe::Global(name) => Some(name),
                _ => None,
            })
            .collect();

        let script = snapshot_script(&selectors, &globals)
            .map_err(|e| AutomationError::internal("snapshot_script", e.to_string()))?;
        let result = page.evaluate(script).await.map_err(AutomationError::from)?;
        let snapshot: PageSnapshot = result
            .into_value()
            .map_err(|e| AutomationError::internal("snapshot_decode", e.to_string()))?;
        Ok(snapshot)
    }
}

fn snapshot_script(selectors: &[&str], globals: &[&str]) -> serde_json::Result<String> {
    let selectors_json = serde_json::to_string(selectors)?;
    let globals_json = serde_json::to_string(globals)?;
    Ok(format!(
        r#"(() => {{
            const selectors = {selectors_json};
            const globals = {globals_json};
            const present = [];
            for (const sel of selectors) {{
                try {{ if (document.querySelector(sel)) present.push(sel); }} catch (e) {{}}
            }}
            const globalsPresent = globals.filter((g) => typeof window[g] !== 'undefined');
            const iframeSrcs = Array.from(document.querySelectorAll('iframe'))
                .map((f) => f.src || '')
                .filter((s) => s.length > 0);
            const cookieNames = document.cookie
                .split(';')
                .map((c) => c.split('=')[0].trim())
                .filter((n) => n.length > 0);
            return {{
                url: location.href,
                iframeSrcs,
                selectorsPresent: present,
                cookieNames,
                globalsPresent,
            }};
        }})()"#
    ))
}

/// Built-in vendor fingerprints.
#[must_use]
pub fn default_strategies() -> Vec<SystemStrategy> {
    vec![
        SystemStrategy {
            system: AntiBotSystem::Recaptcha,
            signals: vec![
                Signal { probe: Probe::IframeSrc("google.com/recaptcha"), weight: 0.6, description: "recaptcha iframe" },
                Signal { probe: Probe::Selector(".g-recaptcha"), weight: 0.4, description: ".g-recaptcha container" },
                Signal { probe: Probe::Selector("textarea[name=g-recaptcha-response]"), weight: 0.3, description: "response textarea" },
                Signal { probe: Probe::Global("grecaptcha"), weight: 0.3, description: "grecaptcha global" },
            ],
        },
        SystemStrategy {
            system: AntiBotSystem::Hcaptcha,
            signals: vec![
                Signal { probe: Probe::IframeSrc("hcaptcha.com"), weight: 0.6, description: "hcaptcha iframe" },
                Signal { probe: Probe::Selector(".h-captcha"), weight: 0.4, description: ".h-captcha container" },
                Signal { probe: Probe::Global("hcaptcha"), weight: 0.3, description: "hcaptcha global" },
            ],
        },
        SystemStrategy {
            system: AntiBotSystem::Turnstile,
            signals: vec![
                Signal { probe: Probe::IframeSrc("challenges.cloudflare.com"), weight: 0.6, description: "cloudflare challenge iframe" },
                Signal { probe: Probe::Selector(".cf-turnstile"), weight: 0.4, description: ".cf-turnstile container" },
                Signal { probe: Probe::Global("turnstile"), weight: 0.3, description: "turnstile global" },
                Signal { probe: Probe::Global("_cf"), weight: 0.2, description: "_cf global" },
            ],
        },
        SystemStrategy {
            system: AntiBotSystem::Datadome,
            signals: vec![
                Signal { probe: Probe::IframeSrc("datadome"), weight: 0.5, description: "datadome iframe" },
                Signal { probe: Probe::Selector("[id*=datadome]"), weight: 0.3, description: "datadome element" },
                Signal { probe: Probe::Cookie("datadome"), weight: 0.4, description: "datadome cookie" },
            ],
        },
        SystemStrategy {
            system: AntiBotSystem::Akamai,
            signals: vec![
                Signal { probe: Probe::IframeSrc("akam.net"), weight: 0.4, description: "akamai iframe" },
                Signal { probe: Probe::Cookie("_abck"), weight: 0.4, description: "_abck cookie" },
                Signal { probe: Probe::Cookie("bm_sz"), weight: 0.3, description: "bm_sz cookie" },
                Signal { probe: Probe::Global("bmak"), weight: 0.4, description: "bmak sensor global" },
            ],
        },
        SystemStrategy {
            system: AntiBotSystem::Funcaptcha,
            signals: vec![
                Signal { probe: Probe::IframeSrc("arkoselabs.com"), weight: 0.6, description: "arkose iframe" },
                Signal { probe: Probe::Selector("#arkose-frame"), weight: 0.3, description: "arkose frame element" },
                Signal { probe: Probe::Global("arkose"), weight: 0.2, description: "arkose global" },
            ],
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> DetectionRegistry {
        DetectionRegistry::with_defaults(&CaptchaConfig::default())
    }

    fn recaptcha_strategy() -> SystemStrategy {
        default_strategies()
            .into_iter()
            .find(|s| s.system == AntiBotSystem::Recaptcha)
            .expect("recaptcha strategy exists")
    }

    #[test]
    fn confidence_is_monotone_in_signal_count() {
        let strategy = recaptcha_strategy();
        let mut snapshot = PageSnapshot {
            iframe_srcs: vec!["https://www.google.com/recaptcha/api2/anchor".to_string()],
            ..PageSnapshot::default()
        };
        let one_signal = DetectionRegistry::score(&strategy, &snapshot).confidence;

        snapshot.selectors_present.push(".g-recaptcha".to_string());
        let two_signals = DetectionRegistry::score(&strategy, &snapshot).confidence;

        snapshot.globals_present.push("grecaptcha".to_string());
        let three_signals = DetectionRegistry::score(&strategy, &snapshot).confidence;

        assert!(one_signal < two_signals);
        assert!(two_signals <= three_signals);
    }

    #[test]
    fn confidence_caps_at_one() {
        let strategy = recaptcha_strategy();
        let snapshot = PageSnapshot {
            iframe_srcs: vec!["https://www.google.com/recaptcha/api2/anchor".to_string()],
            selectors_present: vec![
                ".g-recaptcha".to_string(),
                "textarea[name=g-recaptcha-response]".to_string(),
            ],
            globals_present: vec!["grecaptcha".to_string()],
            ..PageSnapshot::default()
        };
        let detection = DetectionRegistry::score(&strategy, &snapshot);
        assert!((detection.confidence - 1.0).abs() < f64::EPSILON);
        assert_eq!(detection.signals.len(), 4);
    }

    #[test]
    fn aggregate_filters_below_min_confidence() {
        let registry = registry();
        // Only one weak Akamai signal: 0.3 < 0.5 threshold
        let snapshot = PageSnapshot {
            cookie_names: vec!["bm_sz".to_string()],
            ..PageSnapshot::default()
        };
        assert!(registry.aggregate(&snapshot).is_empty());

        // _abck + bm_sz = 0.7: above threshold and actionable
        let snapshot = PageSnapshot {
            cookie_names: vec!["bm_sz".to_string(), "_abck".to_string()],
            ..PageSnapshot::default()
        };
        let detections = registry.aggregate(&snapshot);
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].system, AntiBotSystem::Akamai);
        assert!(registry.is_actionable(&detections[0]));
    }

    #[test]
    fn aggregate_orders_by_confidence() {
        let registry = registry();
        let snapshot = PageSnapshot {
            iframe_srcs: vec![
                "https://www.google.com/recaptcha/api2/anchor".to_string(),
                "https://challenges.cloudflare.com/turnstile".to_string(),
            ],
            selectors_present: vec![".g-recaptcha".to_string()],
            ..PageSnapshot::default()
        };
        let detections = registry.aggregate(&snapshot);
        assert_eq!(detections.len(), 2);
        assert_eq!(detections[0].system, AntiBotSystem::Recaptcha);
        assert!(detections[0].confidence >= detections[1].confidence);
    }

    #[test]
    fn snapshot_script_embeds_probe_lists() {
        let script = snapshot_script(&[".g-recaptcha"], &["grecaptcha"]).expect("script builds");
        assert!(script.contains(".g-recaptcha"));
        assert!(script.contains("grecaptcha"));
        assert!(script.contains("cookieNames"));
    }
}
