//! Native Akamai Bot Manager solver (levels 1–3).
//!
//! Assembles a sensor payload from a per-session browser fingerprint plus
//! synthetic but statistically plausible interaction telemetry, signs it
//! with HMAC-SHA256, and posts it to the page's sensor endpoint. Success is
//! observed as an `_abck` cookie whose value length exceeds 50; shorter
//! values are the denial sentinel.
//!
//! Level 1 sends the fingerprint alone; level 2 adds mouse trajectories;
//! level 3 adds scroll and keystroke telemetry.

use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::Page;
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use rand::Rng;
use serde::Serialize;
use sha2::Sha256;
use tracing::debug;

use crate::captcha::solver::registry::Solver;
use crate::captcha::types::{CaptchaChallenge, CaptchaSolution, ChallengeType};
use crate::context::input::{Point, bezier_path};
use crate::error::{AutomationError, AutomationResult};

use super::cookie_value;

type HmacSha256 = Hmac<Sha256>;

const SENSOR_VERSION: &str = "2.3.1";
/// `_abck` values at or under this length are denial sentinels.
const ABCK_ACCEPT_LENGTH: usize = 50;

/// Device identity frozen for one session.
#[derive(Debug, Clone, Serialize)]
pub struct BrowserFingerprint {
    pub screen_width: u32,
    pub screen_height: u32,
    pub timezone_offset_minutes: i32,
    pub plugin_count: u32,
    pub webgl_renderer: String,
    pub canvas_hash: String,
    pub hardware_concurrency: u32,
}

impl BrowserFingerprint {
    /// Roll a plausible desktop fingerprint.
    #[must_use]
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let screens = [(1920u32, 1080u32), (2560, 1440), (1680, 1050), (1440, 900)];
        let (screen_width, screen_height) = screens[rng.random_range(0..screens.len())];
        let renderers = [
            "Intel(R) UHD Graphics 630",
            "NVIDIA GeForce GTX 1660/PCIe/SSE2",
            "AMD Radeon RX 580 Series",
        ];
        let canvas_hash: Vec<u8> = (0..16).map(|_| rng.random::<u8>()).collect();
        Self {
            screen_width,
            screen_height,
            timezone_offset_minutes: [-300, -360, 0, 60][rng.random_range(0..4)],
            plugin_count: rng.random_range(3..=5),
            webgl_renderer: renderers[rng.random_range(0..renderers.len())].to_string(),
            canvas_hash: hex::encode(canvas_hash),
            hardware_concurrency: [4u32, 8, 12, 16][rng.random_range(0..4)],
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MouseSample {
    pub t: u64,
    pub x: i32,
    pub y: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScrollSample {
    pub t: u64,
    pub delta: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct KeySample {
    pub t: u64,
    pub hold_ms: u32,
}

/// The serialized telemetry bundle Akamai expects.
#[derive(Debug, Clone, Serialize)]
pub struct SensorData {
    pub fingerprint: BrowserFingerprint,
    pub mouse_events: Vec<MouseSample>,
    pub scroll_events: Vec<ScrollSample>,
    pub key_events: Vec<KeySample>,
    pub sensor_version: String,
}

/// Synthetic mouse trajectory: Bézier with 20% control-point deviation and
/// 1–3 px jitter, timestamped with human-scale gaps.
#[must_use]
pub fn synthesize_mouse_events(count: usize) -> Vec<MouseSample> {
    let mut rng = rand::rng();
    let from = Point::new(rng.random_range(50.0..400.0), rng.random_range(50.0..400.0));
    let to = Point::new(rng.random_range(500.0..1200.0), rng.random_range(300.0..800.0));
    let steps = count.max(2) as u32 - 1;
    drop(rng);

    let path = bezier_path(from, to, steps, 0.2);
    let mut rng = rand::rng();
    let mut t = rng.random_range(80u64..240);
    path.into_iter()
        .map(|p| {
            t += rng.random_range(8..28);
            MouseSample {
                t,
                x: p.x.max(0.0) as i32,
                y: p.y.max(0.0) as i32,
            }
        })
        .collect()
}

/// Scroll bursts with a final overshoot-and-correct pair.
#[must_use]
pub fn synthesize_scroll_events(count: usize) -> Vec<ScrollSample> {
    let mut rng = rand::rng();
    let mut t = rng.random_range(400u64..900);
    let mut events: Vec<ScrollSample> = (0..count.max(1))
        .map(|_| {
            t += rng.random_range(60..220);
            ScrollSample {
                t,
                delta: rng.random_range(40..160),
            }
        })
        .collect();
    // Overshoot then settle back
    t += rng.random_range(80..160);
    events.push(ScrollSample { t, delta: rng.random_range(180..320) });
    t += rng.random_range(120..260);
    events.push(ScrollSample { t, delta: -rng.random_range(30..90) });
    events
}

/// Keystroke timings with gaussian-ish holds.
#[must_use]
pub fn synthesize_key_events(count: usize) -> Vec<KeySample> {
    let mut rng = rand::rng();
    let mut t = rng.random_range(900u64..1500);
    (0..count)
        .map(|_| {
            t += rng.random_range(90..260);
            KeySample {
                t,
                hold_ms: rng.random_range(35..110),
            }
        })
        .collect()
}

/// Assemble the sensor bundle for a bot-manager level.
#[must_use]
pub fn assemble_sensor(fingerprint: BrowserFingerprint, challenge_type: ChallengeType) -> SensorData {
    let (mouse, scroll, keys) = match challenge_type {
        ChallengeType::AkamaiLevel1 => (0, 0, 0),
        ChallengeType::AkamaiLevel2 => (24, 0, 0),
        _ => (36, 4, 8),
    };
    SensorData {
        fingerprint,
        mouse_events: if mouse > 0 { synthesize_mouse_events(mouse) } else { Vec::new() },
        scroll_events: if scroll > 0 { synthesize_scroll_events(scroll) } else { Vec::new() },
        key_events: if keys > 0 { synthesize_key_events(keys) } else { Vec::new() },
        sensor_version: SENSOR_VERSION.to_string(),
    }
}

/// HMAC-SHA256 over `{payload, sensorVersion, timestamp, pageUrl}`.
///
/// The key mixes the configured secret with the challenge host; production
/// deployments must supply a real secret.
#[must_use]
pub fn sign_sensor(payload: &str, timestamp_ms: i64, page_url: &str, secret: &str) -> String {
    let host = url::Url::parse(page_url)
        .ok()
        .and_then(|u| u.host_str().map(ToString::to_string))
        .unwrap_or_default();
    let key = format!("{secret}:{host}");
    let mut mac = HmacSha256::new_from_slice(key.as_bytes()).expect("HMAC accepts any key length");
    mac.update(payload.as_bytes());
    mac.update(SENSOR_VERSION.as_bytes());
    mac.update(timestamp_ms.to_string().as_bytes());
    mac.update(page_url.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

pub struct AkamaiSolver {
    /// Fingerprints cached per challenge host for session consistency
    sessions: DashMap<String, BrowserFingerprint>,
    sensor_secret: String,
}

impl AkamaiSolver {
    #[must_use]
    pub fn new(sensor_secret: String) -> Self {
        Self {
            sessions: DashMap::new(),
            sensor_secret,
        }
    }

    fn fingerprint_for(&self, page_url: &str) -> BrowserFingerprint {
        let host = url::Url::parse(page_url)
            .ok()
            .and_then(|u| u.host_str().map(ToString::to_string))
            .unwrap_or_else(|| page_url.to_string());
        self.sessions
            .entry(host)
            .or_insert_with(BrowserFingerprint::generate)
            .clone()
    }

    /// Find the sensor endpoint the page's bot-manager script posts to.
    async fn detect_sensor_endpoint(&self, page: &Page) -> AutomationResult<String> {
        let script = r"(() => {
            if (window.bmak && window.bmak.sensor_url) return window.bmak.sensor_url;
            const tag = Array.from(document.querySelectorAll('script[src]'))
                .map((s) => s.src)
                .find((src) => src.includes('akam') || /\/[0-9a-f]{8}-[0-9a-f]{4}-/.test(src));
            return tag || null;
        })()";
        let result = page.evaluate(script).await.map_err(AutomationError::from)?;
        result
            .value()
            .and_then(serde_json::Value::as_str)
            .map(ToString::to_string)
            .ok_or_else(|| {
                AutomationError::invalid_input("akamai_no_endpoint", "sensor endpoint not found on page")
            })
    }

    /// Post the signed sensor payload from inside the page so the response
    /// cookies land in the job context.
    async fn post_sensor(&self, page: &Page, endpoint: &str, body: &str, signature: &str) -> AutomationResult<()> {
        let script = format!(
            r"(async () => {{
                const response = await fetch({endpoint}, {{
                    method: 'POST',
                    headers: {{
                        'Content-Type': 'application/json',
                        'X-Sensor-Signature': {signature},
                    }},
                    body: {body},
                    credentials: 'include',
                }});
                return response.status;
            }})()",
            endpoint = serde_json::to_string(endpoint)
                .map_err(|e| AutomationError::internal("akamai_encode", e.to_string()))?,
            signature = serde_json::to_string(signature)
                .map_err(|e| AutomationError::internal("akamai_encode", e.to_string()))?,
            body = serde_json::to_string(body)
                .map_err(|e| AutomationError::internal("akamai_encode", e.to_string()))?,
        );
        let params = chromiumoxide::cdp::js_protocol::runtime::EvaluateParams::builder()
            .expression(script)
            .await_promise(true)
            .return_by_value(true)
            .build()
            .map_err(|e| AutomationError::internal("akamai_eval_params", e))?;
        let result = page.evaluate(params).await.map_err(AutomationError::from)?;
        let status = result.value().and_then(serde_json::Value::as_i64).unwrap_or(0);
        if !(200..300).contains(&status) {
            return Err(AutomationError::network(
                "akamai_sensor_post",
                format!("sensor endpoint returned {status}"),
            ));
        }
        Ok(())
    }

    async fn wait_for_abck(&self, page: &Page, timeout: Duration) -> AutomationResult<String> {
        let started = std::time::Instant::now();
        loop {
            if let Some(value) = cookie_value(page, "_abck").await? {
                if value.len() > ABCK_ACCEPT_LENGTH {
                    return Ok(value);
                }
            }
            if started.elapsed() >= timeout {
                return Err(AutomationError::timeout(
                    "akamai_abck",
                    "no accepting _abck cookie within deadline",
                ));
            }
            tokio::time::sleep(Duration::from_millis(400)).await;
        }
    }
}

#[async_trait]
impl Solver for AkamaiSolver {
    fn id(&self) -> &str {
        "akamai-native"
    }

    async fn solve(&self, challenge: &CaptchaChallenge, page: &Page) -> AutomationResult<CaptchaSolution> {
        if !matches!(
            challenge.challenge_type,
            ChallengeType::AkamaiLevel1 | ChallengeType::AkamaiLevel2 | ChallengeType::AkamaiLevel3
        ) {
            return Err(AutomationError::invalid_input(
                "akamai_wrong_type",
                format!("akamai-native cannot solve {}", challenge.challenge_type),
            ));
        }

        let fingerprint = self.fingerprint_for(&challenge.page_url);
        let sensor = assemble_sensor(fingerprint, challenge.challenge_type);
        let payload = serde_json::to_string(&sensor)
            .map_err(|e| AutomationError::internal("akamai_serialize", e.to_string()))?;
        let timestamp_ms = chrono::Utc::now().timestamp_millis();
        let signature = sign_sensor(&payload, timestamp_ms, &challenge.page_url, &self.sensor_secret);

        let endpoint = self.detect_sensor_endpoint(page).await?;
        debug!(endpoint = %endpoint, "Posting Akamai sensor payload");
        self.post_sensor(page, &endpoint, &payload, &signature).await?;

        let abck = self
            .wait_for_abck(page, challenge.challenge_type.attempt_timeout())
            .await?;
        Ok(CaptchaSolution::cookie(self.id(), abck))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_cached_per_host() {
        let solver = AkamaiSolver::new("secret".to_string());
        let a1 = solver.fingerprint_for("https://shop.example.com/cart");
        let a2 = solver.fingerprint_for("https://shop.example.com/checkout");
        assert_eq!(a1.canvas_hash, a2.canvas_hash);
        // Different host gets an independent roll (hash collision is 2^-128)
        let b = solver.fingerprint_for("https://other.example.org/");
        assert_ne!(a1.canvas_hash, b.canvas_hash);
    }

    #[test]
    fn sensor_levels_scale_telemetry() {
        let fp = BrowserFingerprint::generate();
        let l1 = assemble_sensor(fp.clone(), ChallengeType::AkamaiLevel1);
        assert!(l1.mouse_events.is_empty());
        assert!(l1.scroll_events.is_empty());

        let l2 = assemble_sensor(fp.clone(), ChallengeType::AkamaiLevel2);
        assert!(!l2.mouse_events.is_empty());
        assert!(l2.scroll_events.is_empty());

        let l3 = assemble_sensor(fp, ChallengeType::AkamaiLevel3);
        assert!(!l3.mouse_events.is_empty());
        assert!(!l3.scroll_events.is_empty());
        assert!(!l3.key_events.is_empty());
    }

    #[test]
    fn mouse_timestamps_are_monotone() {
        let events = synthesize_mouse_events(30);
        assert_eq!(events.len(), 30);
        assert!(events.windows(2).all(|w| w[0].t < w[1].t));
    }

    #[test]
    fn scroll_events_end_with_overshoot_correction() {
        let events = synthesize_scroll_events(5);
        let last = events.last().expect("events exist");
        assert!(last.delta < 0, "final event should settle back upward");
    }

    #[test]
    fn signature_is_deterministic_and_input_sensitive() {
        let sig1 = sign_sensor("payload", 1_700_000_000_000, "https://example.com/a", "secret");
        let sig2 = sign_sensor("payload", 1_700_000_000_000, "https://example.com/a", "secret");
        assert_eq!(sig1, sig2);
        assert_eq!(sig1.len(), 64);

        assert_ne!(sig1, sign_sensor("payload2", 1_700_000_000_000, "https://example.com/a", "secret"));
        assert_ne!(sig1, sign_sensor("payload", 1_700_000_000_001, "https://example.com/a", "secret"));
        assert_ne!(sig1, sign_sensor("payload", 1_700_000_000_000, "https://example.org/a", "secret"));
        assert_ne!(sig1, sign_sensor("payload", 1_700_000_000_000, "https://example.com/a", "other"));
    }
}
