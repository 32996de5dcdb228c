//! postdeck store: in-RAM paged collection of posts, the optimistic reconciler,
//! the paged cache and the shared snapshot readers subscribe to.

#![forbid(unsafe_code)]

use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::watch;
use tracing::trace;

pub mod cache;
pub mod collection;
pub mod reconcile;
pub mod scroll;

pub use cache::{reset_threshold, total_drift_exceeds, CacheOutcome, PageRequest, PagedCache, ResetReason};
pub use collection::{compute_has_more, PagedCollection};
pub use reconcile::{apply_field, reconcile};
pub use scroll::{ScrollLoader, ScrollMetrics};

/// The one published collection. Writers `publish`, readers `current()` a
/// cheap snapshot and `subscribe()` to the epoch to learn about swaps.
#[derive(Clone)]
pub struct SharedCollection {
    snap: Arc<ArcSwap<PagedCollection>>,
    epoch_tx: Arc<watch::Sender<u64>>,
}

impl Default for SharedCollection {
    fn default() -> Self { Self::new() }
}

impl SharedCollection {
    pub fn new() -> Self {
        let (epoch_tx, _) = watch::channel(0u64);
        Self { snap: Arc::new(ArcSwap::from_pointee(PagedCollection::default())), epoch_tx: Arc::new(epoch_tx) }
    }

    pub fn current(&self) -> Arc<PagedCollection> { self.snap.load_full() }

    pub fn epoch(&self) -> u64 { *self.epoch_tx.borrow() }

    pub fn publish(&self, next: PagedCollection) {
        self.snap.store(Arc::new(next));
        self.epoch_tx.send_modify(|e| *e = e.saturating_add(1));
        trace!(epoch = self.epoch(), "store: snapshot published");
    }

    /// Receiver that changes on every publish.
    pub fn subscribe(&self) -> watch::Receiver<u64> { self.epoch_tx.subscribe() }
}
