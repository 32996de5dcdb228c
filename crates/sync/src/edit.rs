//! Inline edit controller.
//!
//! Tracks one [`PendingEdit`] per `(entity, field)` and turns user actions and
//! write outcomes into decisions; it never performs I/O itself. The engine
//! applies the decisions (optimistic patch, protection, write, retry timer,
//! rollback).

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use postdeck_api::ApiError;
use postdeck_core::EntityId;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tracing::{debug, info};

use crate::context::CoordinationContext;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EditKey {
    pub entity: EntityId,
    pub field: String,
}

impl EditKey {
    pub fn new(entity: EntityId, field: impl Into<String>) -> Self { Self { entity, field: field.into() } }
}

impl std::fmt::Display for EditKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "{}.{}", self.entity, self.field) }
}

/// `Viewing` is the absence of a pending edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditPhase {
    Editing,
    Saving,
    RetryPending,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingEdit {
    pub original: Value,
    /// In-progress value while editing; the value being written while saving.
    pub candidate: Value,
    /// Latest external value that arrived while editing.
    pub buffered: Option<Value>,
    pub phase: EditPhase,
    pub attempt: u32,
    pub generation: u64,
}

/// Backoff schedule for network-class write failures; one delay per retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    delays: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self { Self::new(vec![Duration::from_secs(1), Duration::from_secs(2), Duration::from_secs(4)]) }
}

impl RetryPolicy {
    pub fn new(delays: Vec<Duration>) -> Self { Self { delays } }

    pub fn max_retries(&self) -> u32 { self.delays.len() as u32 }

    /// Delay before retry number `n` (1-based).
    pub fn delay_for(&self, n: u32) -> Option<Duration> { n.checked_sub(1).and_then(|i| self.delays.get(i as usize)).copied() }
}

/// One write attempt to perform.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteTicket {
    pub key: EditKey,
    pub value: Value,
    pub generation: u64,
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SaveDecision {
    /// Candidate equals the original; no write. `restore` is a buffered
    /// external value to show now.
    NoOp { restore: Option<Value> },
    Write(WriteTicket),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalDisposition {
    ApplyNow,
    Buffered,
    Ignored,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Completion of a superseded or forgotten write.
    Stale,
    Confirmed,
    Retry { delay: Duration, attempt: u32 },
    Rollback { original: Value, error: ApiError },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EditError {
    #[error("no edit open for {0}")]
    NotEditing(EditKey),
}

pub struct InlineEditController {
    edits: FxHashMap<EditKey, PendingEdit>,
    retry: RetryPolicy,
    next_generation: u64,
    coord: Arc<CoordinationContext>,
}

impl InlineEditController {
    pub fn new(retry: RetryPolicy, coord: Arc<CoordinationContext>) -> Self {
        Self { edits: FxHashMap::default(), retry, next_generation: 0, coord }
    }

    pub fn retry_policy(&self) -> &RetryPolicy { &self.retry }

    pub fn pending(&self, key: &EditKey) -> Option<&PendingEdit> { self.edits.get(key) }

    pub fn phase(&self, key: &EditKey) -> Option<EditPhase> { self.edits.get(key).map(|p| p.phase) }

    pub fn len(&self) -> usize { self.edits.len() }

    pub fn is_empty(&self) -> bool { self.edits.is_empty() }

    /// Whether any field of `entity` has an open edit.
    pub fn has_entity(&self, entity: EntityId) -> bool { self.edits.keys().any(|k| k.entity == entity) }

    /// Whether `field` of `entity` is in the `Editing` phase.
    pub fn is_editing(&self, entity: EntityId, field: &str) -> bool {
        self.edits.get(&EditKey::new(entity, field)).is_some_and(|p| p.phase == EditPhase::Editing)
    }

    fn bump_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    fn finish(&mut self, key: &EditKey) -> Option<PendingEdit> {
        let done = self.edits.remove(key);
        if done.is_some() {
            self.coord.edit_finished();
        }
        done
    }

    /// Open an edit capturing `current` as the original. Reopening a key that is
    /// saving keeps the earliest original and makes the in-flight write stale.
    pub fn start_edit(&mut self, key: EditKey, current: Value) -> &PendingEdit {
        let generation = self.bump_generation();
        let coord = Arc::clone(&self.coord);
        let entry = self
            .edits
            .entry(key)
            .and_modify(|p| {
                if p.phase != EditPhase::Editing {
                    p.phase = EditPhase::Editing;
                    p.candidate = current.clone();
                    p.generation = generation;
                    p.attempt = 0;
                }
            })
            .or_insert_with(|| {
                coord.edit_started();
                PendingEdit {
                    original: current.clone(),
                    candidate: current,
                    buffered: None,
                    phase: EditPhase::Editing,
                    attempt: 0,
                    generation,
                }
            });
        entry
    }

    /// Keystroke-level change; ignored unless the key is being edited.
    pub fn update_candidate(&mut self, key: &EditKey, value: Value) -> bool {
        match self.edits.get_mut(key) {
            Some(p) if p.phase == EditPhase::Editing => {
                p.candidate = value;
                true
            }
            _ => false,
        }
    }

    /// Route a server value for `key`.
    pub fn external_value(&mut self, key: &EditKey, value: &Value) -> ExternalDisposition {
        match self.edits.get_mut(key) {
            None => ExternalDisposition::ApplyNow,
            Some(p) if p.phase == EditPhase::Editing => {
                p.buffered = Some(value.clone());
                debug!(key = %key, "edit: external value buffered");
                ExternalDisposition::Buffered
            }
            Some(_) => ExternalDisposition::Ignored,
        }
    }

    /// Commit `candidate`. A save on a key that is already saving supersedes
    /// the earlier write.
    pub fn begin_save(&mut self, key: &EditKey, candidate: Value) -> Result<SaveDecision, EditError> {
        let Some(p) = self.edits.get(key) else {
            return Err(EditError::NotEditing(key.clone()));
        };
        if p.phase == EditPhase::Editing && p.original == candidate {
            let restore = self.finish(key).and_then(|p| p.buffered);
            debug!(key = %key, "edit: unchanged; no write");
            return Ok(SaveDecision::NoOp { restore });
        }
        let generation = self.bump_generation();
        let Some(p) = self.edits.get_mut(key) else {
            return Err(EditError::NotEditing(key.clone()));
        };
        if p.phase != EditPhase::Editing {
            info!(key = %key, superseded = p.generation, "edit: save superseded");
        }
        p.phase = EditPhase::Saving;
        p.candidate = candidate.clone();
        p.buffered = None;
        p.attempt = 1;
        p.generation = generation;
        Ok(SaveDecision::Write(WriteTicket { key: key.clone(), value: candidate, generation, attempt: 1 }))
    }

    fn is_current(&self, key: &EditKey, generation: u64) -> bool {
        self.edits.get(key).is_some_and(|p| p.generation == generation)
    }

    pub fn on_write_result(&mut self, ticket: &WriteTicket, result: &Result<(), ApiError>) -> Resolution {
        if !self.is_current(&ticket.key, ticket.generation) {
            debug!(key = %ticket.key, generation = ticket.generation, "edit: stale write completion ignored");
            return Resolution::Stale;
        }
        let err = match result {
            Ok(()) => {
                self.finish(&ticket.key);
                return Resolution::Confirmed;
            }
            Err(e) => e,
        };
        let retry_no = ticket.attempt;
        if err.is_network() {
            if let Some(delay) = self.retry.delay_for(retry_no) {
                if let Some(p) = self.edits.get_mut(&ticket.key) {
                    p.phase = EditPhase::RetryPending;
                }
                return Resolution::Retry { delay, attempt: ticket.attempt + 1 };
            }
        }
        match self.finish(&ticket.key) {
            Some(p) => Resolution::Rollback { original: p.original, error: err.clone() },
            None => Resolution::Stale,
        }
    }

    /// Next attempt once a retry delay elapsed, if that retry is still current.
    pub fn retry_due(&mut self, key: &EditKey, generation: u64) -> Option<WriteTicket> {
        let p = self.edits.get_mut(key)?;
        if p.generation != generation || p.phase != EditPhase::RetryPending {
            return None;
        }
        p.phase = EditPhase::Saving;
        p.attempt += 1;
        Some(WriteTicket { key: key.clone(), value: p.candidate.clone(), generation, attempt: p.attempt })
    }

    /// Leave `Editing` without saving: the buffered external value if any,
    /// else the original. Ignored while a write is in flight.
    pub fn cancel_edit(&mut self, key: &EditKey) -> Option<Value> {
        if self.phase(key) != Some(EditPhase::Editing) {
            return None;
        }
        self.finish(key).map(|p| p.buffered.unwrap_or(p.original))
    }

    /// Drop every edit on a deleted entity.
    pub fn forget_entity(&mut self, entity: EntityId) -> usize {
        let keys: Vec<EditKey> = self.edits.keys().filter(|k| k.entity == entity).cloned().collect();
        for k in &keys {
            self.finish(k);
        }
        keys.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn controller() -> (InlineEditController, Arc<CoordinationContext>) {
        let coord = Arc::new(CoordinationContext::new());
        (InlineEditController::new(RetryPolicy::default(), coord.clone()), coord)
    }

    fn write(d: SaveDecision) -> WriteTicket {
        match d {
            SaveDecision::Write(t) => t,
            other => panic!("expected write, got {other:?}"),
        }
    }

    #[test]
    fn unchanged_save_is_noop() {
        let (mut c, coord) = controller();
        let key = EditKey::new(EntityId(1), "text");
        c.start_edit(key.clone(), json!("a"));
        assert!(coord.is_inline_editing());
        c.update_candidate(&key, json!("ab"));
        c.update_candidate(&key, json!("a"));
        assert_eq!(c.begin_save(&key, json!("a")), Ok(SaveDecision::NoOp { restore: None }));
        assert!(c.is_empty());
        assert!(!coord.is_inline_editing());
    }

    #[test]
    fn unchanged_save_surfaces_value_buffered_during_edit() {
        let (mut c, _) = controller();
        let key = EditKey::new(EntityId(1), "city");
        c.start_edit(key.clone(), json!("Paris"));
        assert_eq!(c.external_value(&key, &json!("Nice")), ExternalDisposition::Buffered);
        assert_eq!(c.begin_save(&key, json!("Paris")), Ok(SaveDecision::NoOp { restore: Some(json!("Nice")) }));
    }

    #[test]
    fn network_failures_retry_on_schedule_then_roll_back() {
        let (mut c, _) = controller();
        let key = EditKey::new(EntityId(1), "city");
        c.start_edit(key.clone(), json!("Paris"));
        let mut t = write(c.begin_save(&key, json!("Lyon")).unwrap());
        for (delay, attempt) in [(1, 2), (2, 3), (4, 4)] {
            assert_eq!(
                c.on_write_result(&t, &Err(ApiError::Timeout("15s".into()))),
                Resolution::Retry { delay: Duration::from_secs(delay), attempt }
            );
            assert_eq!(c.phase(&key), Some(EditPhase::RetryPending));
            t = c.retry_due(&key, t.generation).expect("retry is current");
            assert_eq!(t.attempt, attempt);
            assert_eq!(t.value, json!("Lyon"));
        }
        assert_eq!(
            c.on_write_result(&t, &Err(ApiError::Offline("no route".into()))),
            Resolution::Rollback { original: json!("Paris"), error: ApiError::Offline("no route".into()) }
        );
        assert!(c.is_empty());
    }

    #[test]
    fn validation_failure_rolls_back_immediately() {
        let (mut c, _) = controller();
        let key = EditKey::new(EntityId(2), "price");
        c.start_edit(key.clone(), json!(10));
        let t = write(c.begin_save(&key, json!(-1)).unwrap());
        let err = ApiError::Validation { status: 422, detail: "price must be positive".into() };
        assert_eq!(c.on_write_result(&t, &Err(err.clone())), Resolution::Rollback { original: json!(10), error: err });
    }

    #[test]
    fn superseded_write_completion_is_stale() {
        let (mut c, _) = controller();
        let key = EditKey::new(EntityId(3), "text");
        c.start_edit(key.clone(), json!("v0"));
        let first = write(c.begin_save(&key, json!("v1")).unwrap());
        let second = write(c.begin_save(&key, json!("v2")).unwrap());
        assert!(second.generation > first.generation);
        assert_eq!(c.on_write_result(&first, &Err(ApiError::Conflict("stale".into()))), Resolution::Stale);
        assert_eq!(c.pending(&key).map(|p| p.original.clone()), Some(json!("v0")));
        assert_eq!(c.on_write_result(&second, &Ok(())), Resolution::Confirmed);
        assert!(c.retry_due(&key, second.generation).is_none());
    }

    #[test]
    fn external_values_buffer_while_editing_and_flush_on_cancel() {
        let (mut c, _) = controller();
        let key = EditKey::new(EntityId(4), "city");
        assert_eq!(c.external_value(&key, &json!("x")), ExternalDisposition::ApplyNow);
        c.start_edit(key.clone(), json!("Paris"));
        assert_eq!(c.external_value(&key, &json!("Nice")), ExternalDisposition::Buffered);
        assert_eq!(c.external_value(&key, &json!("Lille")), ExternalDisposition::Buffered);
        assert_eq!(c.cancel_edit(&key), Some(json!("Lille")));

        c.start_edit(key.clone(), json!("Paris"));
        assert_eq!(c.cancel_edit(&key), Some(json!("Paris")));
    }

    #[test]
    fn in_flight_edits_ignore_external_values_and_cancel() {
        let (mut c, _) = controller();
        let key = EditKey::new(EntityId(5), "text");
        c.start_edit(key.clone(), json!("a"));
        c.begin_save(&key, json!("b")).unwrap();
        assert_eq!(c.external_value(&key, &json!("z")), ExternalDisposition::Ignored);
        assert_eq!(c.cancel_edit(&key), None);
        assert_eq!(c.phase(&key), Some(EditPhase::Saving));
        assert_eq!(c.forget_entity(EntityId(5)), 1);
        assert!(c.begin_save(&key, json!("c")).is_err());
    }
}
