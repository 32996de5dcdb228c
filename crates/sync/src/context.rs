//! Coordination state shared by the stream bridge, the protection registry,
//! the edit controller and the engine.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkQuality {
    Fast,
    Normal,
    Slow,
    VerySlow,
}

impl NetworkQuality {
    /// Classify a median save round-trip.
    pub fn classify(median: Duration) -> Self {
        match median.as_millis() {
            0..=199 => NetworkQuality::Fast,
            200..=999 => NetworkQuality::Normal,
            1000..=1999 => NetworkQuality::Slow,
            _ => NetworkQuality::VerySlow,
        }
    }

    /// Multiplier applied to protection and stabilization windows.
    pub fn window_scale(self) -> f64 {
        match self {
            NetworkQuality::Fast | NetworkQuality::Normal => 1.0,
            NetworkQuality::Slow => 1.5,
            NetworkQuality::VerySlow => 2.0,
        }
    }

    pub fn scale(self, base: Duration) -> Duration { base.mul_f64(self.window_scale()) }

    pub fn as_str(self) -> &'static str {
        match self {
            NetworkQuality::Fast => "fast",
            NetworkQuality::Normal => "normal",
            NetworkQuality::Slow => "slow",
            NetworkQuality::VerySlow => "very_slow",
        }
    }
}

pub const LATENCY_WINDOW: usize = 16;

/// Bounded ring of recent write round-trips.
#[derive(Debug, Clone)]
pub struct LatencySampler {
    samples: VecDeque<Duration>,
    cap: usize,
}

impl Default for LatencySampler {
    fn default() -> Self { Self::with_capacity(LATENCY_WINDOW) }
}

impl LatencySampler {
    pub fn with_capacity(cap: usize) -> Self { Self { samples: VecDeque::with_capacity(cap), cap: cap.max(1) } }

    pub fn record(&mut self, d: Duration) {
        if self.samples.len() == self.cap {
            self.samples.pop_front();
        }
        self.samples.push_back(d);
    }

    pub fn len(&self) -> usize { self.samples.len() }

    pub fn is_empty(&self) -> bool { self.samples.is_empty() }

    /// Upper median.
    pub fn median(&self) -> Option<Duration> {
        let mut v: Vec<Duration> = self.samples.iter().copied().collect();
        v.sort_unstable();
        v.get(v.len() / 2).copied()
    }

    pub fn quality(&self) -> NetworkQuality { self.median().map_or(NetworkQuality::Normal, NetworkQuality::classify) }
}

#[derive(Debug, Default)]
struct CoordState {
    last_user_action: Option<Instant>,
    last_stream_update: Option<Instant>,
    inline_edits: usize,
    sampler: LatencySampler,
    quality_override: Option<NetworkQuality>,
}

/// Shared as `Arc<CoordinationContext>`.
#[derive(Debug, Default)]
pub struct CoordinationContext {
    inner: Mutex<CoordState>,
}

impl CoordinationContext {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> MutexGuard<'_, CoordState> { self.inner.lock().unwrap_or_else(PoisonError::into_inner) }

    pub fn note_user_action(&self) -> Instant {
        let now = Instant::now();
        self.lock().last_user_action = Some(now);
        now
    }

    pub fn last_user_action(&self) -> Option<Instant> { self.lock().last_user_action }

    pub fn note_stream_update(&self) { self.lock().last_stream_update = Some(Instant::now()); }

    pub fn last_stream_update(&self) -> Option<Instant> { self.lock().last_stream_update }

    pub fn edit_started(&self) { self.lock().inline_edits += 1; }

    pub fn edit_finished(&self) {
        let mut g = self.lock();
        g.inline_edits = g.inline_edits.saturating_sub(1);
    }

    pub fn inline_edits(&self) -> usize { self.lock().inline_edits }

    pub fn is_inline_editing(&self) -> bool { self.inline_edits() > 0 }

    pub fn record_latency(&self, d: Duration) { self.lock().sampler.record(d); }

    /// Pin the quality instead of deriving it from samples; `None` restores sampling.
    pub fn set_quality_override(&self, q: Option<NetworkQuality>) { self.lock().quality_override = q; }

    pub fn network_quality(&self) -> NetworkQuality {
        let g = self.lock();
        g.quality_override.unwrap_or_else(|| g.sampler.quality())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_on_median() {
        let mut s = LatencySampler::with_capacity(3);
        assert_eq!(s.quality(), NetworkQuality::Normal);
        s.record(Duration::from_millis(50));
        assert_eq!(s.quality(), NetworkQuality::Fast);
        s.record(Duration::from_millis(2500));
        s.record(Duration::from_millis(2600));
        assert_eq!(s.quality(), NetworkQuality::VerySlow);
        // ring evicts the oldest
        s.record(Duration::from_millis(1200));
        s.record(Duration::from_millis(1100));
        assert_eq!(s.len(), 3);
        assert_eq!(s.quality(), NetworkQuality::Slow);
    }

    #[test]
    fn window_scaling() {
        let base = Duration::from_secs(8);
        assert_eq!(NetworkQuality::Normal.scale(base), base);
        assert_eq!(NetworkQuality::Slow.scale(base), Duration::from_secs(12));
        assert_eq!(NetworkQuality::VerySlow.scale(Duration::from_secs(2)), Duration::from_secs(4));
    }

    #[test]
    fn edit_count_never_underflows() {
        let ctx = CoordinationContext::new();
        ctx.edit_started();
        ctx.edit_finished();
        ctx.edit_finished();
        assert!(!ctx.is_inline_editing());
    }
}
