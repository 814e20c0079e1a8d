//! Human-like interaction patterns for the attached browser.
//!
//! Reading simulation is planned as data first (scroll segments, mouse
//! waypoints, delays) so the planners stay pure and testable; execution
//! drives the page over CDP. Delays are log-normal rather than uniform —
//! uniform gaps are a bot tell.

use chromiumoxide::cdp::browser_protocol::input::{
    DispatchMouseEventParams, DispatchMouseEventType,
};
use chromiumoxide::page::Page;
use rand::Rng;
use rand_distr::{Distribution, LogNormal};
use tracing::debug;

/// One scroll step: target y offset and the pause after reaching it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScrollStep {
    pub y: f64,
    pub pause_secs: f64,
}

/// Human behaviour planner/executor.
#[derive(Debug, Clone, Default)]
pub struct HumanBehavior;

impl HumanBehavior {
    /// A delay drawn from a log-normal clipped to `[min, max]`.
    #[must_use]
    pub fn random_delay(min_secs: f64, max_secs: f64) -> f64 {
        let mean = ((min_secs + max_secs) / 2.0).max(0.01);
        let lognormal = LogNormal::new(mean.ln(), 0.4).unwrap_or_else(|_| {
            LogNormal::new(0.0, 0.4).expect("constant parameters are valid")
        });
        let sample = lognormal.sample(&mut rand::rng());
        sample.clamp(min_secs, max_secs)
    }

    /// Segment a page into scroll stops with ease-out spacing: big jumps at
    /// the top, smaller ones toward the bottom, longer pauses on dense
    /// segments.
    #[must_use]
    pub fn scroll_plan(page_height: f64, viewport_height: f64) -> Vec<ScrollStep> {
        if page_height <= viewport_height {
            return Vec::new();
        }
        let scrollable = page_height - viewport_height;
        let segments = ((scrollable / viewport_height).ceil() as usize).clamp(1, 12);

        let mut steps = Vec::with_capacity(segments);
        for i in 1..=segments {
            let progress = i as f64 / segments as f64;
            // ease-out: fast start, slow approach to the bottom
            let eased = 1.0 - (1.0 - progress).powi(2);
            steps.push(ScrollStep {
                y: (scrollable * eased).round(),
                pause_secs: Self::random_delay(0.4, 1.6),
            });
        }
        steps
    }

    /// Cubic-Bezier mouse path from `start` to `end` with jittered control
    /// points, sampled into 20–40 waypoints.
    #[must_use]
    pub fn mouse_path(start: (f64, f64), end: (f64, f64)) -> Vec<(f64, f64)> {
        let mut rng = rand::rng();
        let steps = rng.random_range(20..=40);

        let dx = end.0 - start.0;
        let dy = end.1 - start.1;
        let c1 = (
            start.0 + dx * 0.3 + rng.random_range(-40.0..40.0),
            start.1 + dy * 0.3 + rng.random_range(-40.0..40.0),
        );
        let c2 = (
            start.0 + dx * 0.7 + rng.random_range(-40.0..40.0),
            start.1 + dy * 0.7 + rng.random_range(-40.0..40.0),
        );

        (0..=steps)
            .map(|i| {
                let t = f64::from(i) / f64::from(steps);
                let u = 1.0 - t;
                let x = u.powi(3) * start.0
                    + 3.0 * u.powi(2) * t * c1.0
                    + 3.0 * u * t.powi(2) * c2.0
                    + t.powi(3) * end.0;
                let y = u.powi(3) * start.1
                    + 3.0 * u.powi(2) * t * c1.1
                    + 3.0 * u * t.powi(2) * c2.1
                    + t.powi(3) * end.1;
                (x, y)
            })
            .collect()
    }

    /// Scroll through the page the way a reader would. Failures are
    /// swallowed — simulation must never fail a fetch.
    pub async fn simulate_reading(&self, page: &Page) {
        let heights: (f64, f64) = match page
            .evaluate("[document.body ? document.body.scrollHeight : 0, window.innerHeight]")
            .await
            .ok()
            .and_then(|v| v.into_value::<(f64, f64)>().ok())
        {
            Some(pair) => pair,
            None => return,
        };

        for step in Self::scroll_plan(heights.0, heights.1) {
            let script = format!("window.scrollTo({{ top: {}, behavior: 'smooth' }})", step.y);
            if page.evaluate(script).await.is_err() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_secs_f64(step.pause_secs)).await;
        }
    }

    /// Move the mouse along a Bezier path to one of the first interactive
    /// elements, if any.
    pub async fn move_mouse_to_interactive_element(&self, page: &Page) {
        let target: Option<(f64, f64)> = page
            .evaluate(
                r#"(() => {
                    const els = document.querySelectorAll(
                        "a, button, input[type='text'], input[type='search']");
                    if (!els.length) return null;
                    const el = els[Math.floor(Math.random() * Math.min(els.length, 5))];
                    const r = el.getBoundingClientRect();
                    return [r.x + r.width / 2, r.y + r.height / 2];
                })()"#,
            )
            .await
            .ok()
            .and_then(|v| v.into_value::<Option<(f64, f64)>>().ok())
            .flatten();

        let Some(end) = target else { return };
        let start = {
            let mut rng = rand::rng();
            (rng.random_range(50.0..300.0), rng.random_range(50.0..300.0))
        };

        for (x, y) in Self::mouse_path(start, end) {
            let params = DispatchMouseEventParams::builder()
                .r#type(DispatchMouseEventType::MouseMoved)
                .x(x)
                .y(y)
                .build();
            let Ok(params) = params else { return };
            if page.execute(params).await.is_err() {
                debug!("mouse movement skipped");
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(8)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_stay_within_bounds() {
        for _ in 0..200 {
            let d = HumanBehavior::random_delay(0.5, 2.0);
            assert!((0.5..=2.0).contains(&d));
        }
    }

    #[test]
    fn short_pages_need_no_scrolling() {
        assert!(HumanBehavior::scroll_plan(500.0, 900.0).is_empty());
    }

    #[test]
    fn scroll_plan_is_monotonic_and_bounded() {
        let steps = HumanBehavior::scroll_plan(5000.0, 900.0);
        assert!(!steps.is_empty());
        let scrollable = 5000.0 - 900.0;
        let mut prev = 0.0;
        for step in &steps {
            assert!(step.y >= prev);
            assert!(step.y <= scrollable);
            prev = step.y;
        }
        // the plan reaches the bottom
        assert!((steps.last().unwrap().y - scrollable).abs() < 1.0);
    }

    #[test]
    fn mouse_path_hits_both_endpoints() {
        let path = HumanBehavior::mouse_path((10.0, 10.0), (400.0, 300.0));
        assert!(path.len() >= 21);
        let first = path.first().unwrap();
        let last = path.last().unwrap();
        assert!((first.0 - 10.0).abs() < 1e-6 && (first.1 - 10.0).abs() < 1e-6);
        assert!((last.0 - 400.0).abs() < 1e-6 && (last.1 - 300.0).abs() < 1e-6);
    }
}
