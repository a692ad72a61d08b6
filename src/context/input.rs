//! Human-like mouse and keyboard input.
//!
//! Mouse movement follows a cubic Bézier curve between the current and
//! target points, with control points deviating up to 20% of the travel
//! distance and 1–3 px of per-step jitter. Typing draws per-key timings from
//! a normal distribution around the configured means, with occasional longer
//! "thinking" pauses.

use std::time::Duration;

use anyhow::Result;
use chromiumoxide::Page;
use chromiumoxide_cdp::cdp::browser_protocol::input::{
    DispatchKeyEventParams, DispatchKeyEventType, DispatchMouseEventParams, DispatchMouseEventType,
    MouseButton,
};
use rand::Rng;

use crate::config::HumanInputConfig;

/// A 2D point on the page.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    #[must_use]
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    fn distance_to(self, other: Point) -> f64 {
        ((other.x - self.x).powi(2) + (other.y - self.y).powi(2)).sqrt()
    }
}

/// Sample a cubic Bézier path from `from` to `to`.
///
/// Control points deviate up to `deviation_ratio` of the travel distance off
/// the straight line; every sampled point gets 1–3 px of jitter.
#[must_use]
pub fn bezier_path(from: Point, to: Point, steps: u32, deviation_ratio: f64) -> Vec<Point> {
    let mut rng = rand::rng();
    let distance = from.distance_to(to).max(1.0);
    let deviation = distance * deviation_ratio;

    let mut control = |t: f64| Point {
        x: from.x + (to.x - from.x) * t + rng.random_range(-deviation..=deviation),
        y: from.y + (to.y - from.y) * t + rng.random_range(-deviation..=deviation),
    };
    let (c1, c2) = (control(0.33), control(0.66));

    let steps = steps.max(2);
    (0..=steps)
        .map(|i| {
            let t = f64::from(i) / f64::from(steps);
            let u = 1.0 - t;
            let x = u.powi(3) * from.x
                + 3.0 * u.powi(2) * t * c1.x
                + 3.0 * u * t.powi(2) * c2.x
                + t.powi(3) * to.x;
            let y = u.powi(3) * from.y
                + 3.0 * u.powi(2) * t * c1.y
                + 3.0 * u * t.powi(2) * c2.y
                + t.powi(3) * to.y;
            let jitter = rng.random_range(1.0..=3.0);
            let angle = rng.random_range(0.0..std::f64::consts::TAU);
            Point {
                x: x + jitter * angle.cos(),
                y: y + jitter * angle.sin(),
            }
        })
        .collect()
}

/// Sample from N(mean, mean/4) via Box–Muller, clamped to stay positive.
#[must_use]
pub fn gaussian_delay_ms(mean: f64) -> f64 {
    let mut rng = rand::rng();
    let u1: f64 = rng.random_range(f64::EPSILON..1.0);
    let u2: f64 = rng.random_range(0.0..1.0);
    let z = (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos();
    (mean + z * mean / 4.0).max(mean / 4.0)
}

/// Move the mouse along a Bézier path to `(x, y)`.
pub async fn move_mouse_human_like(
    page: &Page,
    x: f64,
    y: f64,
    config: &HumanInputConfig,
) -> Result<()> {
    let (steps, start) = {
        let mut rng = rand::rng();
        let steps = rng.random_range(config.min_move_steps..=config.max_move_steps.max(config.min_move_steps));
        // Origin is unknown to CDP; start from a plausible nearby point
        let start = Point::new(
            (x - rng.random_range(80.0..240.0)).max(0.0),
            (y - rng.random_range(60.0..180.0)).max(0.0),
        );
        (steps, start)
    };
    let path = bezier_path(start, Point::new(x, y), steps, 0.2);

    for point in path {
        page.execute(
            DispatchMouseEventParams::builder()
                .r#type(DispatchMouseEventType::MouseMoved)
                .x(point.x)
                .y(point.y)
                .build()
                .map_err(|e| anyhow::anyhow!("mouse move params: {e}"))?,
        )
        .await?;
        let delay = {
            let mut rng = rand::rng();
            rng.random_range(config.step_delay_ms.0..=config.step_delay_ms.1.max(config.step_delay_ms.0))
        };
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
    Ok(())
}

/// Move to `(x, y)` human-like, then press and release the left button.
pub async fn click_human_like(page: &Page, x: f64, y: f64, config: &HumanInputConfig) -> Result<()> {
    move_mouse_human_like(page, x, y, config).await?;

    page.execute(
        DispatchMouseEventParams::builder()
            .r#type(DispatchMouseEventType::MousePressed)
            .x(x)
            .y(y)
            .button(MouseButton::Left)
            .click_count(1)
            .build()
            .map_err(|e| anyhow::anyhow!("mouse press params: {e}"))?,
    )
    .await?;

    let hold = gaussian_delay_ms(config.key_press_mean_ms);
    tokio::time::sleep(Duration::from_millis(hold as u64)).await;

    page.execute(
        DispatchMouseEventParams::builder()
            .r#type(DispatchMouseEventType::MouseReleased)
            .x(x)
            .y(y)
            .button(MouseButton::Left)
            .click_count(1)
            .build()
            .map_err(|e| anyhow::anyhow!("mouse release params: {e}"))?,
    )
    .await?;
    Ok(())
}

/// Type `text` into the focused element with human-like cadence.
pub async fn type_human_like(page: &Page, text: &str, config: &HumanInputConfig) -> Result<()> {
    for ch in text.chars() {
        page.execute(
            DispatchKeyEventParams::builder()
                .r#type(DispatchKeyEventType::Char)
                .text(ch.to_string())
                .build()
                .map_err(|e| anyhow::anyhow!("key event params: {e}"))?,
        )
        .await?;

        let mut delay = gaussian_delay_ms(config.inter_key_mean_ms);
        let thinking = {
            let mut rng = rand::rng();
            rng.random_bool(config.thinking_pause_probability.clamp(0.0, 1.0))
        };
        if thinking {
            delay += gaussian_delay_ms(config.inter_key_mean_ms * 6.0);
        }
        tokio::time::sleep(Duration::from_millis(delay as u64)).await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bezier_path_starts_and_ends_near_endpoints() {
        let from = Point::new(0.0, 0.0);
        let to = Point::new(200.0, 120.0);
        let path = bezier_path(from, to, 20, 0.2);
        assert_eq!(path.len(), 21);
        let first = path[0];
        let last = path[path.len() - 1];
        // Within jitter radius of the true endpoints
        assert!(first.distance_to(from) <= 4.0, "start drifted: {first:?}");
        assert!(last.distance_to(to) <= 4.0, "end drifted: {last:?}");
    }

    #[test]
    fn bezier_path_enforces_minimum_steps() {
        let path = bezier_path(Point::new(0.0, 0.0), Point::new(10.0, 10.0), 0, 0.2);
        assert!(path.len() >= 3);
    }

    #[test]
    fn gaussian_delay_is_positive_and_centered() {
        let samples: Vec<f64> = (0..500).map(|_| gaussian_delay_ms(90.0)).collect();
        assert!(samples.iter().all(|&d| d > 0.0));
        let mean = samples.iter().sum::<f64>() / samples.len() as f64;
        assert!((60.0..120.0).contains(&mean), "mean drifted: {mean}");
    }
}
