//! The sync event loop.
//!
//! `SyncEngine` owns the paged cache, the protection registry and the edit
//! controller. Network calls and timers run as spawned tasks that report back
//! as [`SyncUpdate`] messages on one channel; every state change happens in a
//! `&mut self` handler.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, histogram};
use postdeck_api::{ApiResult, PostsApi};
use postdeck_core::{ChangeEvent, Entity, EntityId, EventKind, Notification, NotificationLevel, Page, Patch, QueryContext};
use postdeck_store::{CacheOutcome, PageRequest, PagedCache, PagedCollection, ScrollLoader, ScrollMetrics, SharedCollection};
use postdeck_stream::{ConnectionStatus, EventStreamClient, StreamHandle};
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::context::CoordinationContext;
use crate::edit::{EditError, EditKey, ExternalDisposition, InlineEditController, PendingEdit, Resolution, SaveDecision, WriteTicket};
use crate::notice::{Notice, NoticeKind};
use crate::protection::ProtectionRegistry;
use crate::task::ScheduledTask;

const NOTICE_CAP: usize = 64;

/// Messages handled by the engine loop.
#[derive(Debug)]
pub enum SyncUpdate {
    Stream(ChangeEvent),
    /// The entity listener fell behind and lost `n` events.
    StreamLagged(u64),
    Notification(Notification),
    Status(ConnectionStatus),
    FirstPage { req: PageRequest, result: ApiResult<Page<Entity>>, took: Duration },
    MorePage { req: PageRequest, result: ApiResult<Page<Entity>>, took: Duration },
    WriteDone { ticket: WriteTicket, result: ApiResult<()>, took: Duration },
    RetryDue { key: EditKey, generation: u64 },
    Sweep,
}

pub struct SyncEngine {
    api: Arc<dyn PostsApi>,
    coord: Arc<CoordinationContext>,
    registry: ProtectionRegistry,
    edits: InlineEditController,
    cache: PagedCache,
    scroll: ScrollLoader,
    shared: SharedCollection,
    status: ConnectionStatus,
    status_tx: watch::Sender<ConnectionStatus>,
    notices_tx: broadcast::Sender<Notice>,
    tx: mpsc::UnboundedSender<SyncUpdate>,
    rx: mpsc::UnboundedReceiver<SyncUpdate>,
    retries: FxHashMap<EditKey, ScheduledTask>,
    sweep: Option<ScheduledTask>,
    bridge: Vec<ScheduledTask>,
    stream: Option<StreamHandle>,
}

impl SyncEngine {
    pub fn new(api: Arc<dyn PostsApi>, cfg: &SyncConfig) -> Self {
        Self::with_context(api, cfg, Arc::new(CoordinationContext::new()))
    }

    pub fn with_context(api: Arc<dyn PostsApi>, cfg: &SyncConfig, coord: Arc<CoordinationContext>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (notices_tx, _) = broadcast::channel(NOTICE_CAP);
        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            api,
            registry: ProtectionRegistry::new(cfg.protect, cfg.stabilize, Arc::clone(&coord)),
            edits: InlineEditController::new(cfg.retry_policy(), Arc::clone(&coord)),
            coord,
            cache: PagedCache::new(cfg.page_size),
            scroll: ScrollLoader::default(),
            shared: SharedCollection::new(),
            status: ConnectionStatus::Disconnected,
            status_tx,
            notices_tx,
            tx,
            rx,
            retries: FxHashMap::default(),
            sweep: None,
            bridge: Vec::new(),
            stream: None,
        }
    }

    // ----------------- read surface -----------------

    pub fn subscribe(&self) -> watch::Receiver<u64> { self.shared.subscribe() }

    pub fn snapshot(&self) -> Arc<PagedCollection> { self.shared.current() }

    pub fn shared(&self) -> SharedCollection { self.shared.clone() }

    pub fn notices(&self) -> broadcast::Receiver<Notice> { self.notices_tx.subscribe() }

    pub fn connection_status(&self) -> ConnectionStatus { self.status }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> { self.status_tx.subscribe() }

    pub fn has_more(&self) -> bool { self.cache.has_more() }

    pub fn is_loading(&self) -> bool { self.cache.is_loading() }

    pub fn coordination(&self) -> Arc<CoordinationContext> { Arc::clone(&self.coord) }

    pub fn registry(&self) -> &ProtectionRegistry { &self.registry }

    pub fn pending_edit(&self, id: EntityId, field: &str) -> Option<PendingEdit> {
        self.edits.pending(&EditKey::new(id, field)).cloned()
    }

    /// Sender for feeding updates from outside the engine.
    pub fn updates(&self) -> mpsc::UnboundedSender<SyncUpdate> { self.tx.clone() }

    fn publish(&self) { self.shared.publish(self.cache.collection().clone()); }

    fn notify(&self, notice: Notice) {
        debug!(kind = ?notice.kind, text = %notice.text, "sync: notice");
        let _ = self.notices_tx.send(notice);
    }

    // ----------------- stream -----------------

    /// Subscribe to `client`, start its connection task and forward its output
    /// into the engine loop.
    pub fn attach_stream(&mut self, client: &EventStreamClient) {
        self.detach_stream();
        let mut entity_rx = client.on_entity_event();
        let mut notify_rx = client.on_notification();
        let mut status_rx = client.status();

        let tx = self.tx.clone();
        self.bridge.push(ScheduledTask::spawn(async move {
            loop {
                let update = match entity_rx.recv().await {
                    Ok(ev) => SyncUpdate::Stream(ev),
                    Err(RecvError::Lagged(n)) => SyncUpdate::StreamLagged(n),
                    Err(RecvError::Closed) => break,
                };
                if tx.send(update).is_err() {
                    break;
                }
            }
        }));
        let tx = self.tx.clone();
        self.bridge.push(ScheduledTask::spawn(async move {
            loop {
                match notify_rx.recv().await {
                    Ok(n) => {
                        if tx.send(SyncUpdate::Notification(n)).is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(n)) => warn!(lost = n, "sync: notifications lagged"),
                    Err(RecvError::Closed) => break,
                }
            }
        }));
        let tx = self.tx.clone();
        self.bridge.push(ScheduledTask::spawn(async move {
            loop {
                let s = *status_rx.borrow_and_update();
                if tx.send(SyncUpdate::Status(s)).is_err() || status_rx.changed().await.is_err() {
                    break;
                }
            }
        }));
        self.stream = Some(client.connect());
        info!("sync: stream attached");
    }

    pub fn detach_stream(&mut self) {
        self.bridge.clear();
        if let Some(h) = self.stream.take() {
            h.cancel();
            info!("sync: stream detached");
        }
    }

    /// Gate, route and reconcile one server change event.
    pub fn ingest(&mut self, event: ChangeEvent) {
        self.coord.note_stream_update();
        if let Some(reason) = self.registry.should_suppress(&event) {
            counter!("sync_events_suppressed_total", 1u64, "reason" => reason.as_str());
            debug!(entity = %event.entity_id, kind = event.kind.as_str(), reason = reason.as_str(), "sync: event suppressed");
            return;
        }
        let id = event.entity_id;
        let event = match event.kind {
            EventKind::Deleted => {
                self.forget_entity(id);
                event
            }
            EventKind::Created | EventKind::Updated | EventKind::StatusChanged => {
                let mut patch = Patch::new();
                for (field, value) in event.patch.iter() {
                    let key = EditKey::new(id, field.as_str());
                    if self.edits.external_value(&key, value) == ExternalDisposition::ApplyNow {
                        patch.insert(field.clone(), value.clone());
                    }
                }
                if patch.is_empty() && !event.patch.is_empty() && event.kind != EventKind::Created {
                    debug!(entity = %id, "sync: event fully held back by open edits");
                    return;
                }
                ChangeEvent { patch, ..event }
            }
            EventKind::Unknown => event,
        };
        if self.cache.apply_event(&event) {
            self.publish();
        }
    }

    fn forget_entity(&mut self, id: EntityId) {
        if self.edits.forget_entity(id) > 0 {
            self.retries.retain(|k, _| k.entity != id);
            info!(entity = %id, "sync: open edits dropped for deleted post");
        }
        self.registry.release(id);
    }

    fn on_status(&mut self, next: ConnectionStatus) {
        let prev = std::mem::replace(&mut self.status, next);
        self.status_tx.send_replace(next);
        if prev == next {
            return;
        }
        info!(from = ?prev, to = ?next, "sync: connection status");
        match (prev, next) {
            (_, ConnectionStatus::Error) => {
                self.notify(Notice::warn("Live updates unavailable; retrying in a few minutes"))
            }
            (ConnectionStatus::Error, ConnectionStatus::Connected) => self.notify(Notice::info("Live updates restored")),
            _ => {}
        }
    }

    // ----------------- pagination -----------------

    /// Load the first page for `ctx`; a changed context resets the collection.
    pub fn refresh(&mut self, ctx: QueryContext) {
        let req = self.cache.begin_refresh(ctx);
        self.spawn_page_load(req, true);
    }

    /// Refresh the current context (or the default one before any load).
    pub fn reload(&mut self) {
        let ctx = self.cache.context().cloned().unwrap_or_default();
        self.refresh(ctx);
    }

    /// Reset to a fresh first page of the current context after stream events
    /// were lost.
    fn resync(&mut self, lost: u64) {
        match self.cache.begin_resync() {
            Some(req) => {
                warn!(lost, "sync: stream listener lagged; resyncing first page");
                self.spawn_page_load(req, true);
            }
            None => {
                warn!(lost, "sync: stream listener lagged before first load; reloading");
                self.reload();
            }
        }
    }

    pub fn load_more(&mut self) -> bool {
        match self.cache.begin_load_more() {
            Some(req) => {
                self.spawn_page_load(req, false);
                true
            }
            None => false,
        }
    }

    pub fn on_scroll(&mut self, metrics: ScrollMetrics) -> bool {
        if self.scroll.should_load(metrics, self.cache.is_loading(), self.cache.has_more()) {
            self.load_more()
        } else {
            false
        }
    }

    fn spawn_page_load(&self, req: PageRequest, first: bool) {
        let api = Arc::clone(&self.api);
        let tx = self.tx.clone();
        debug!(offset = req.offset, page_size = req.page_size, first, "sync: page load");
        tokio::spawn(async move {
            let t0 = Instant::now();
            let result = api.list(&req.ctx, req.offset, req.page_size).await;
            let took = t0.elapsed();
            let update = if first {
                SyncUpdate::FirstPage { req, result, took }
            } else {
                SyncUpdate::MorePage { req, result, took }
            };
            let _ = tx.send(update);
        });
    }

    fn on_first_page(&mut self, req: PageRequest, result: ApiResult<Page<Entity>>, took: Duration) {
        histogram!("cache_page_load_ms", took.as_secs_f64() * 1000.0);
        match result {
            Ok(page) => {
                if let CacheOutcome::Reset(_) = self.cache.observe_first_page(req.ctx, page) {
                    self.publish();
                }
            }
            Err(e) => {
                self.cache.fail_refresh(&req.signature);
                warn!(error = %e, "sync: first page failed");
                self.notify(Notice::error(format!("Could not load posts: {e}")));
            }
        }
    }

    fn on_more_page(&mut self, req: PageRequest, result: ApiResult<Page<Entity>>, took: Duration) {
        histogram!("cache_page_load_ms", took.as_secs_f64() * 1000.0);
        match result {
            Ok(page) => {
                if self.cache.complete_load_more(&req, page) {
                    self.publish();
                }
            }
            Err(e) => {
                self.cache.fail_load_more(&req);
                warn!(error = %e, offset = req.offset, "sync: next page failed");
                self.notify(Notice::error(format!("Could not load more posts: {e}")));
            }
        }
    }

    // ----------------- inline edits -----------------

    /// Open an edit on a loaded post, capturing its current value.
    pub fn start_edit(&mut self, id: EntityId, field: &str) -> Option<Value> {
        let current = self.cache.collection().get(id)?.get(field);
        Some(self.start_edit_with(id, field, current))
    }

    /// Open an edit with an explicit current value. Protects the post for the
    /// length of one window.
    pub fn start_edit_with(&mut self, id: EntityId, field: &str, current: Value) -> Value {
        self.registry.mark_action(id);
        self.schedule_sweep();
        self.edits.start_edit(EditKey::new(id, field), current).candidate.clone()
    }

    pub fn update_edit(&mut self, id: EntityId, field: &str, value: Value) -> bool {
        self.edits.update_candidate(&EditKey::new(id, field), value)
    }

    /// Commit `value`: protect the post, patch the collection optimistically
    /// and issue the write.
    pub fn save_edit(&mut self, id: EntityId, field: &str, value: Value) -> Result<(), EditError> {
        let key = EditKey::new(id, field);
        match self.edits.begin_save(&key, value)? {
            SaveDecision::NoOp { restore } => {
                if let Some(v) = restore {
                    self.apply_local(id, field, &v);
                }
                self.release_if_idle(id);
            }
            SaveDecision::Write(ticket) => {
                self.retries.remove(&key);
                self.registry.mark_action(id);
                self.schedule_sweep();
                self.apply_local(id, field, &ticket.value);
                self.spawn_write(ticket);
            }
        }
        Ok(())
    }

    /// Leave an edit without saving; returns the value now shown.
    pub fn cancel_edit(&mut self, id: EntityId, field: &str) -> Option<Value> {
        let v = self.edits.cancel_edit(&EditKey::new(id, field))?;
        self.apply_local(id, field, &v);
        self.release_if_idle(id);
        Some(v)
    }

    /// Drop the post's window when no other edit on it remains open.
    fn release_if_idle(&mut self, id: EntityId) {
        if !self.edits.has_entity(id) {
            self.registry.release(id);
        }
    }

    fn apply_local(&mut self, id: EntityId, field: &str, value: &Value) {
        if self.cache.apply_field(id, field, value) {
            self.publish();
        }
    }

    fn spawn_write(&self, ticket: WriteTicket) {
        let api = Arc::clone(&self.api);
        let tx = self.tx.clone();
        info!(entity = %ticket.key.entity, field = %ticket.key.field, attempt = ticket.attempt, "edit: write start");
        tokio::spawn(async move {
            let t0 = Instant::now();
            let result = api.update_field(ticket.key.entity, &ticket.key.field, &ticket.value).await;
            let took = t0.elapsed();
            let _ = tx.send(SyncUpdate::WriteDone { ticket, result, took });
        });
    }

    fn on_write_done(&mut self, ticket: WriteTicket, result: ApiResult<()>, took: Duration) {
        histogram!("edit_write_ms", took.as_secs_f64() * 1000.0);
        self.coord.record_latency(took);
        let key = ticket.key.clone();
        match self.edits.on_write_result(&ticket, &result) {
            Resolution::Stale => {}
            Resolution::Confirmed => {
                self.retries.remove(&key);
                info!(entity = %key.entity, field = %key.field, attempt = ticket.attempt, took_ms = %took.as_millis(), "edit: saved");
                self.notify(Notice::new(NoticeKind::Success, format!("Saved {}", key.field)));
            }
            Resolution::Retry { delay, attempt } => {
                counter!("edit_retries_total", 1u64);
                let max = self.edits.retry_policy().max_retries() + 1;
                warn!(entity = %key.entity, field = %key.field, attempt, delay_ms = %delay.as_millis(), "edit: write failed; retrying");
                self.notify(Notice::info(format!("Retrying save ({attempt}/{max})")));
                let tx = self.tx.clone();
                let generation = ticket.generation;
                let due_key = key.clone();
                let task = ScheduledTask::after(delay, async move {
                    let _ = tx.send(SyncUpdate::RetryDue { key: due_key, generation });
                });
                self.retries.insert(key, task);
            }
            Resolution::Rollback { original, error } => {
                self.retries.remove(&key);
                counter!("edit_rollbacks_total", 1u64, "class" => error.class());
                warn!(entity = %key.entity, field = %key.field, error = %error, "edit: rolled back");
                self.release_if_idle(key.entity);
                self.apply_local(key.entity, &key.field, &original);
                self.notify(Notice::error(format!("Could not save {}: {error}", key.field)));
            }
        }
    }

    fn on_retry_due(&mut self, key: EditKey, generation: u64) {
        self.retries.remove(&key);
        if let Some(ticket) = self.edits.retry_due(&key, generation) {
            self.registry.mark_action(key.entity);
            self.schedule_sweep();
            self.spawn_write(ticket);
        }
    }

    fn schedule_sweep(&mut self) {
        let Some(at) = self.registry.next_expiry() else {
            self.sweep = None;
            return;
        };
        let tx = self.tx.clone();
        self.sweep = Some(ScheduledTask::spawn(async move {
            tokio::time::sleep_until(at).await;
            let _ = tx.send(SyncUpdate::Sweep);
        }));
    }

    // ----------------- loop -----------------

    pub fn handle(&mut self, update: SyncUpdate) {
        match update {
            SyncUpdate::Stream(ev) => self.ingest(ev),
            SyncUpdate::StreamLagged(n) => self.resync(n),
            SyncUpdate::Notification(n) => {
                let kind = match n.level {
                    NotificationLevel::Info => NoticeKind::Info,
                    NotificationLevel::Warn => NoticeKind::Warn,
                    NotificationLevel::Error => NoticeKind::Error,
                };
                self.notify(Notice::new(kind, n.message));
            }
            SyncUpdate::Status(s) => self.on_status(s),
            SyncUpdate::FirstPage { req, result, took } => self.on_first_page(req, result, took),
            SyncUpdate::MorePage { req, result, took } => self.on_more_page(req, result, took),
            SyncUpdate::WriteDone { ticket, result, took } => self.on_write_done(ticket, result, took),
            SyncUpdate::RetryDue { key, generation } => self.on_retry_due(key, generation),
            SyncUpdate::Sweep => {
                let removed = self.registry.sweep();
                debug!(removed, remaining = self.registry.len(), "protect: sweep");
                self.schedule_sweep();
            }
        }
    }

    /// Wait for and handle one update.
    pub async fn step(&mut self) {
        if let Some(update) = self.rx.recv().await {
            self.handle(update);
        }
    }

    /// Handle every update already queued; returns how many were handled.
    pub fn drain(&mut self) -> usize {
        let mut n = 0;
        while let Ok(update) = self.rx.try_recv() {
            self.handle(update);
            n += 1;
        }
        n
    }

    pub async fn run(&mut self) {
        loop {
            self.step().await;
        }
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) { self.detach_stream(); }
}
