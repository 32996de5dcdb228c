//! Paged collection cache: first-page reset-vs-preserve decisions, offset
//! load-more with in-flight guarding, and stream-driven in-place mutation.

#![forbid(unsafe_code)]

use metrics::counter;
use std::cmp::Ordering;

use postdeck_core::{compare_entities, ChangeEvent, ContextSignature, Entity, EntityId, EventKind, Page, QueryContext, SortSpec};
use rustc_hash::FxHashSet;
use serde_json::Value;
use tracing::{debug, info};

use crate::collection::{compute_has_more, PagedCollection};
use crate::reconcile::{apply_field, reconcile};

/// A page fetch the caller should perform.
#[derive(Debug, Clone, PartialEq)]
pub struct PageRequest {
    pub ctx: QueryContext,
    pub signature: ContextSignature,
    pub offset: u64,
    pub page_size: u32,
    /// Cache generation the request was issued against; bumped on every reset.
    pub generation: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResetReason {
    FirstLoad,
    ContextChanged,
    TotalDrift { server: u64, cached: u64 },
    /// Forced after stream events were lost.
    Resync,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheOutcome {
    Reset(ResetReason),
    /// Locally reconciled state kept; the delivered page was ignored.
    Preserved,
    /// Page belongs to a context that is no longer being loaded.
    Stale,
}

/// `max(5, 5% of server total)`.
pub fn reset_threshold(server_total: u64) -> f64 {
    (server_total as f64 * 0.05).max(5.0)
}

pub fn total_drift_exceeds(server_total: u64, cached_total: u64) -> bool {
    server_total.abs_diff(cached_total) as f64 > reset_threshold(server_total)
}

#[derive(Debug)]
pub struct PagedCache {
    collection: PagedCollection,
    ctx: Option<QueryContext>,
    signature: Option<ContextSignature>,
    page_size: u32,
    generation: u64,
    loading_more: bool,
    /// Signature of the most recently requested first page; kept after a
    /// failed refresh so late pages for older contexts stay stale.
    requested: Option<ContextSignature>,
    refreshing: bool,
    resync: bool,
}

impl PagedCache {
    pub fn new(page_size: u32) -> Self {
        Self {
            collection: PagedCollection::default(),
            ctx: None,
            signature: None,
            page_size: page_size.max(1),
            generation: 0,
            loading_more: false,
            requested: None,
            refreshing: false,
            resync: false,
        }
    }

    pub fn collection(&self) -> &PagedCollection { &self.collection }

    pub fn context(&self) -> Option<&QueryContext> { self.ctx.as_ref() }

    pub fn signature(&self) -> Option<&ContextSignature> { self.signature.as_ref() }

    pub fn sort(&self) -> SortSpec { self.ctx.as_ref().map(|c| c.sort.clone()).unwrap_or_default() }

    pub fn page_size(&self) -> u32 { self.page_size }

    pub fn generation(&self) -> u64 { self.generation }

    pub fn has_more(&self) -> bool { self.collection.has_more }

    pub fn is_loading(&self) -> bool { self.loading_more || self.refreshing }

    /// Start a first-page load for `ctx` (initial load, filter/sort change or
    /// periodic refresh). A newer refresh makes older first pages stale.
    pub fn begin_refresh(&mut self, ctx: QueryContext) -> PageRequest {
        let signature = ctx.signature();
        self.requested = Some(signature.clone());
        self.refreshing = true;
        self.resync = false;
        PageRequest { ctx, signature, offset: 0, page_size: self.page_size, generation: self.generation }
    }

    /// Refresh the current context and reset to its first page even when the
    /// totals agree. `None` before anything was loaded.
    pub fn begin_resync(&mut self) -> Option<PageRequest> {
        let ctx = self.ctx.clone()?;
        let req = self.begin_refresh(ctx);
        self.resync = true;
        Some(req)
    }

    pub fn fail_refresh(&mut self, signature: &ContextSignature) {
        if self.requested.as_ref() == Some(signature) {
            self.refreshing = false;
            self.resync = false;
        }
    }

    /// Decide between a full reset to `page` and keeping the locally reconciled
    /// state. Resets on first load, on a signature change, or when the server
    /// total drifted beyond `reset_threshold`.
    pub fn observe_first_page(&mut self, ctx: QueryContext, page: Page<Entity>) -> CacheOutcome {
        let signature = ctx.signature();
        if self.requested.as_ref().is_some_and(|latest| *latest != signature) {
            debug!(signature = %signature, "cache: first page for superseded context dropped");
            return CacheOutcome::Stale;
        }
        self.refreshing = false;
        let cached = self.collection.total_count;
        let reason = match &self.signature {
            None => Some(ResetReason::FirstLoad),
            Some(prev) if *prev != signature => Some(ResetReason::ContextChanged),
            Some(_) if self.resync => Some(ResetReason::Resync),
            Some(_) if total_drift_exceeds(page.total_count, cached) => {
                Some(ResetReason::TotalDrift { server: page.total_count, cached })
            }
            Some(_) => None,
        };
        let Some(reason) = reason else {
            debug!(server_total = page.total_count, cached_total = cached, "cache: first page ignored; keeping reconciled state");
            return CacheOutcome::Preserved;
        };
        self.collection = PagedCollection::from_page(page, self.page_size);
        self.ctx = Some(ctx);
        self.signature = Some(signature);
        self.generation += 1;
        self.loading_more = false;
        self.resync = false;
        counter!("cache_resets_total", 1u64);
        info!(
            reason = ?reason,
            items = self.collection.len(),
            total = self.collection.total_count,
            has_more = self.collection.has_more,
            "cache: reset to first page"
        );
        CacheOutcome::Reset(reason)
    }

    /// Next page request, or `None` when a load is in flight, a refresh is
    /// pending, nothing was loaded yet, or the collection is exhausted.
    pub fn begin_load_more(&mut self) -> Option<PageRequest> {
        if self.loading_more || self.refreshing || !self.collection.has_more {
            return None;
        }
        let (ctx, signature) = (self.ctx.clone()?, self.signature.clone()?);
        self.loading_more = true;
        Some(PageRequest {
            ctx,
            signature,
            offset: self.collection.len() as u64,
            page_size: self.page_size,
            generation: self.generation,
        })
    }

    /// Append a loaded page. Returns false for requests issued before a reset.
    pub fn complete_load_more(&mut self, req: &PageRequest, page: Page<Entity>) -> bool {
        if req.generation != self.generation {
            debug!(req_generation = req.generation, generation = self.generation, "cache: stale page dropped");
            return false;
        }
        self.loading_more = false;
        let returned = page.items.len();
        let known: FxHashSet<EntityId> = self.collection.items.iter().map(|e| e.id).collect();
        let before = self.collection.len();
        self.collection
            .items
            .extend(page.items.into_iter().filter(|e| !known.contains(&e.id)).map(std::sync::Arc::new));
        self.collection.total_count = page.total_count;
        self.collection.has_more =
            compute_has_more(returned, self.page_size, self.collection.len(), page.total_count);
        info!(
            returned,
            appended = self.collection.len() - before,
            total = page.total_count,
            has_more = self.collection.has_more,
            "cache: page appended"
        );
        true
    }

    pub fn fail_load_more(&mut self, req: &PageRequest) {
        if req.generation == self.generation {
            self.loading_more = false;
        }
    }

    /// Reconcile one stream event in place. Returns whether anything changed.
    ///
    /// A new post that sorts after the last loaded row while more pages remain
    /// only bumps the total: it belongs to a page not fetched yet, and keeping
    /// it out leaves `items.len()` equal to the server offset of the next page.
    pub fn apply_event(&mut self, event: &ChangeEvent) -> bool {
        if event.kind == EventKind::Created && self.beyond_loaded_range(event) {
            self.collection.total_count = self.collection.total_count.saturating_add(1);
            debug!(entity = %event.entity_id, "cache: created post past the loaded range left to a later page");
            return true;
        }
        let next = reconcile(&self.collection, event, &self.sort());
        self.replace(next)
    }

    /// Optimistic patch or rollback of one field.
    pub fn apply_field(&mut self, id: EntityId, field: &str, value: &Value) -> bool {
        let next = apply_field(&self.collection, id, field, value, &self.sort());
        self.replace(next)
    }

    fn beyond_loaded_range(&self, event: &ChangeEvent) -> bool {
        if !self.collection.has_more || self.collection.contains(event.entity_id) {
            return false;
        }
        let Some(last) = self.collection.items.last() else {
            return false;
        };
        let candidate = Entity::from_patch(event.entity_id, &event.patch);
        compare_entities(&candidate, last, &self.sort()) == Ordering::Greater
    }

    fn replace(&mut self, next: PagedCollection) -> bool {
        if next == self.collection {
            return false;
        }
        self.collection = next;
        true
    }
}
