//! Optimistic reconciler: applies one change event (or one local field patch)
//! to a collection and returns the next collection. Pure; only the targeted
//! entity is ever replaced.

#![forbid(unsafe_code)]

use std::sync::Arc;

use postdeck_core::{ChangeEvent, Entity, EntityId, EventKind, Patch, SortSpec, ID_FIELD};
use serde_json::Value;
use tracing::debug;

use crate::collection::PagedCollection;

fn patch_touches_sort(patch: &Patch, sort: &SortSpec) -> bool {
    patch.keys().any(|k| sort.is_key(k)) && sort.key != ID_FIELD
}

/// Merge `patch` into the entity `id`; re-sort only when the patch touches the
/// active sort key. Missing ids and no-op merges return an unchanged clone.
fn merge(current: &PagedCollection, id: EntityId, patch: &Patch, sort: &SortSpec) -> PagedCollection {
    let mut next = current.clone();
    let Some(idx) = next.position(id) else {
        debug!(entity = %id, "reconcile: update for unloaded entity ignored");
        return next;
    };
    let mut updated = Entity::clone(&next.items[idx]);
    updated.merge(patch);
    if updated == *next.items[idx] {
        return next;
    }
    next.items[idx] = Arc::new(updated);
    if patch_touches_sort(patch, sort) {
        next.sort(sort);
    }
    next
}

fn insert(current: &PagedCollection, id: EntityId, patch: &Patch, sort: &SortSpec) -> PagedCollection {
    let mut next = current.clone();
    next.items.push(Arc::new(Entity::from_patch(id, patch)));
    next.sort(sort);
    next.total_count = next.total_count.saturating_add(1);
    // there may be more to discover
    next.has_more = true;
    next
}

fn remove(current: &PagedCollection, id: EntityId) -> PagedCollection {
    let mut next = current.clone();
    let Some(idx) = next.position(id) else {
        debug!(entity = %id, "reconcile: delete for unloaded entity ignored");
        return next;
    };
    next.items.remove(idx);
    next.total_count = next.total_count.saturating_sub(1);
    if !next.has_more && next.total_count > next.items.len() as u64 {
        // a previously exhausted list now has a freed slot to fill
        next.has_more = true;
    }
    next
}

/// Apply one change event.
///
/// - `Created` for a known id behaves exactly like `Updated` (duplicate delivery).
/// - `Updated`/`StatusChanged` never change `has_more`.
/// - `Unknown` is a no-op.
pub fn reconcile(current: &PagedCollection, event: &ChangeEvent, sort: &SortSpec) -> PagedCollection {
    let id = event.entity_id;
    match event.kind {
        EventKind::Created if current.contains(id) => merge(current, id, &event.patch, sort),
        EventKind::Created => insert(current, id, &event.patch, sort),
        EventKind::Updated | EventKind::StatusChanged => merge(current, id, &event.patch, sort),
        EventKind::Deleted => remove(current, id),
        EventKind::Unknown => {
            debug!(entity = %id, "reconcile: unknown event kind ignored");
            current.clone()
        }
    }
}

/// Apply a single local field value (optimistic patch or rollback).
pub fn apply_field(current: &PagedCollection, id: EntityId, field: &str, value: &Value, sort: &SortSpec) -> PagedCollection {
    let mut patch = Patch::new();
    patch.insert(field.to_string(), value.clone());
    merge(current, id, &patch, sort)
}

