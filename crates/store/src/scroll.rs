//! Scroll-triggered pagination: decides when a scroll position should load the
//! next page.

#![forbid(unsafe_code)]

use std::time::Duration;

use tokio::time::Instant;

pub const SCROLL_THROTTLE: Duration = Duration::from_millis(100);
pub const BOTTOM_THRESHOLD_PX: f64 = 200.0;

/// Viewport geometry reported by the list view.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScrollMetrics {
    pub offset: f64,
    pub viewport: f64,
    pub content: f64,
}

impl ScrollMetrics {
    pub fn new(offset: f64, viewport: f64, content: f64) -> Self { Self { offset, viewport, content } }

    pub fn distance_to_bottom(&self) -> f64 { (self.content - self.offset - self.viewport).max(0.0) }
}

/// Leading-edge throttle: the first scroll in a window is evaluated, the rest
/// are dropped until `throttle` has elapsed.
#[derive(Debug)]
pub struct ScrollLoader {
    throttle: Duration,
    threshold_px: f64,
    last_eval: Option<Instant>,
}

impl Default for ScrollLoader {
    fn default() -> Self { Self::new(SCROLL_THROTTLE, BOTTOM_THRESHOLD_PX) }
}

impl ScrollLoader {
    pub fn new(throttle: Duration, threshold_px: f64) -> Self { Self { throttle, threshold_px, last_eval: None } }

    /// True when a load-more should be issued for this scroll position.
    pub fn should_load(&mut self, metrics: ScrollMetrics, is_loading: bool, has_more: bool) -> bool {
        let now = Instant::now();
        if let Some(prev) = self.last_eval {
            if now.duration_since(prev) < self.throttle {
                return false;
            }
        }
        self.last_eval = Some(now);
        !is_loading && has_more && metrics.distance_to_bottom() <= self.threshold_px
    }
}
