//! Ordered, incrementally loaded list of posts.

#![forbid(unsafe_code)]

use std::sync::Arc;

use postdeck_core::{compare_entities, Entity, EntityId, Page, SortSpec};

/// Items are `Arc`ed so a reconciliation step can replace one entity while
/// every other entity keeps its identity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PagedCollection {
    pub items: Vec<Arc<Entity>>,
    pub total_count: u64,
    pub has_more: bool,
}

/// `hasMore` after a server page: a full page came back and the server still
/// reports rows beyond what is loaded.
pub fn compute_has_more(returned: usize, page_size: u32, loaded: usize, server_total: u64) -> bool {
    returned as u64 == u64::from(page_size) && (loaded as u64) < server_total
}

impl PagedCollection {
    /// Fresh collection from a first page, kept in server order.
    pub fn from_page(page: Page<Entity>, page_size: u32) -> Self {
        let returned = page.items.len();
        let items: Vec<Arc<Entity>> = page.items.into_iter().map(Arc::new).collect();
        let has_more = compute_has_more(returned, page_size, items.len(), page.total_count);
        Self { items, total_count: page.total_count, has_more }
    }

    pub fn len(&self) -> usize { self.items.len() }

    pub fn is_empty(&self) -> bool { self.items.is_empty() }

    pub fn position(&self, id: EntityId) -> Option<usize> { self.items.iter().position(|e| e.id == id) }

    pub fn get(&self, id: EntityId) -> Option<&Arc<Entity>> { self.items.iter().find(|e| e.id == id) }

    pub fn contains(&self, id: EntityId) -> bool { self.position(id).is_some() }

    pub fn ids(&self) -> Vec<EntityId> { self.items.iter().map(|e| e.id).collect() }

    /// Stable sort by `sort`, ties on ascending id.
    pub fn sort(&mut self, sort: &SortSpec) {
        sort_items(&mut self.items, sort);
    }
}

pub fn sort_items(items: &mut [Arc<Entity>], sort: &SortSpec) {
    items.sort_by(|a, b| compare_entities(a, b, sort));
}
