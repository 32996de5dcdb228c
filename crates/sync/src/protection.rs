//! Action-protection registry: short windows after a local write during which
//! server events for the same post are dropped, plus a global stabilization
//! window after any user action.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use postdeck_core::{ChangeEvent, EntityId};
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::debug;

use crate::context::CoordinationContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuppressReason {
    /// The target entity has an open protection window.
    Window,
    /// A user action happened moments ago.
    Stabilizing,
}

impl SuppressReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SuppressReason::Window => "window",
            SuppressReason::Stabilizing => "stabilizing",
        }
    }
}

#[derive(Debug)]
pub struct ProtectionRegistry {
    windows: FxHashMap<EntityId, Instant>,
    base: Duration,
    stabilize: Duration,
    coord: Arc<CoordinationContext>,
}

impl ProtectionRegistry {
    pub fn new(base: Duration, stabilize: Duration, coord: Arc<CoordinationContext>) -> Self {
        Self { windows: FxHashMap::default(), base, stabilize, coord }
    }

    /// Open or refresh the window for `id` and record the user action.
    /// Returns the window's expiry.
    pub fn mark_action(&mut self, id: EntityId) -> Instant {
        let now = self.coord.note_user_action();
        let quality = self.coord.network_quality();
        let expires = now + quality.scale(self.base);
        self.windows.insert(id, expires);
        debug!(entity = %id, quality = quality.as_str(), "protect: window opened");
        expires
    }

    pub fn is_protected(&self, id: EntityId) -> bool {
        self.windows.get(&id).is_some_and(|exp| Instant::now() < *exp)
    }

    pub fn is_stabilizing(&self) -> bool {
        let Some(last) = self.coord.last_user_action() else { return false };
        let window = self.coord.network_quality().scale(self.stabilize);
        Instant::now().duration_since(last) < window
    }

    pub fn should_suppress(&self, event: &ChangeEvent) -> Option<SuppressReason> {
        if self.is_protected(event.entity_id) {
            Some(SuppressReason::Window)
        } else if self.is_stabilizing() {
            Some(SuppressReason::Stabilizing)
        } else {
            None
        }
    }

    pub fn release(&mut self, id: EntityId) -> bool { self.windows.remove(&id).is_some() }

    /// Drop expired windows; returns how many were removed.
    pub fn sweep(&mut self) -> usize {
        let now = Instant::now();
        let before = self.windows.len();
        self.windows.retain(|_, exp| now < *exp);
        before - self.windows.len()
    }

    pub fn next_expiry(&self) -> Option<Instant> { self.windows.values().min().copied() }

    pub fn len(&self) -> usize { self.windows.len() }

    pub fn is_empty(&self) -> bool { self.windows.is_empty() }
}
