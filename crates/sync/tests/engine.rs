#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use postdeck_api::{ApiError, MockApi};
use postdeck_core::{ChangeEvent, Entity, EntityId, EventKind, Patch, PostStatus, QueryContext};
use postdeck_store::ScrollMetrics;
use postdeck_sync::{EditPhase, Notice, NoticeKind, SyncConfig, SyncEngine, SyncUpdate};
use serde_json::{json, Value};
use tokio::sync::broadcast;

fn post(id: i64, status: PostStatus) -> Entity {
    let mut e = Entity::new(EntityId(id), status);
    e.set("text", &json!(format!("t{id}")));
    e.set("city", &json!("Paris"));
    e.set("price", &json!(10));
    e
}

fn rows(n: i64) -> Vec<Entity> { (1..=n).map(|i| post(i, PostStatus::ToGenerate)).collect() }

fn patch(v: Value) -> Patch { v.as_object().cloned().unwrap_or_default() }

async fn step_until(engine: &mut SyncEngine, mut done: impl FnMut(&SyncEngine) -> bool) {
    for _ in 0..64 {
        if done(engine) {
            return;
        }
        tokio::time::timeout(Duration::from_secs(900), engine.step()).await.expect("engine stalled");
    }
    panic!("condition not reached");
}

async fn loaded(api: &Arc<MockApi>) -> SyncEngine {
    let mut engine = SyncEngine::new(api.clone(), &SyncConfig::default());
    engine.refresh(QueryContext::default());
    step_until(&mut engine, |e| !e.is_loading()).await;
    engine
}

fn field(engine: &SyncEngine, id: i64, name: &str) -> Value {
    engine.snapshot().get(EntityId(id)).map(|e| e.get(name)).unwrap_or(Value::Null)
}

fn drain_notices(rx: &mut broadcast::Receiver<Notice>) -> Vec<Notice> {
    let mut out = Vec::new();
    while let Ok(n) = rx.try_recv() {
        out.push(n);
    }
    out
}

fn count(notices: &[Notice], kind: NoticeKind) -> usize { notices.iter().filter(|n| n.kind == kind).count() }

#[tokio::test(start_paused = true)]
async fn save_survives_one_timeout_with_two_attempts() {
    let api = Arc::new(MockApi::with_rows(rows(10)));
    api.script_writes([Err(ApiError::Timeout("deadline".into())), Ok(())]);
    let mut engine = loaded(&api).await;
    let mut notices = engine.notices();

    engine.start_edit(EntityId(7), "text").expect("post 7 loaded");
    engine.update_edit(EntityId(7), "text", json!("Hel"));
    engine.save_edit(EntityId(7), "text", json!("Hello")).unwrap();
    assert_eq!(field(&engine, 7, "text"), json!("Hello"));

    step_until(&mut engine, |e| {
        e.pending_edit(EntityId(7), "text").map(|p| p.phase) == Some(EditPhase::RetryPending)
    })
    .await;
    assert_eq!(field(&engine, 7, "text"), json!("Hello"));

    step_until(&mut engine, |e| e.pending_edit(EntityId(7), "text").is_none()).await;
    assert_eq!(field(&engine, 7, "text"), json!("Hello"));
    let writes = api.write_calls();
    assert_eq!(writes.len(), 2);
    assert!(writes.iter().all(|w| w.id == EntityId(7) && w.value == json!("Hello")));
    let seen = drain_notices(&mut notices);
    assert_eq!(count(&seen, NoticeKind::Error), 0);
    assert_eq!(count(&seen, NoticeKind::Info), 1, "one retrying notice");
}

#[tokio::test(start_paused = true)]
async fn protected_post_drops_status_changes() {
    let api = Arc::new(MockApi::with_rows(rows(5)));
    api.set_write_latency(Duration::from_secs(5));
    let mut engine = loaded(&api).await;

    engine.start_edit(EntityId(3), "city").unwrap();
    assert!(engine.registry().is_protected(EntityId(3)), "protected from edit start");
    engine.save_edit(EntityId(3), "city", json!("Lyon")).unwrap();

    let ev = ChangeEvent::new(EventKind::StatusChanged, EntityId(3), patch(json!({"status": "Publié"})));
    engine.updates().send(SyncUpdate::Stream(ev.clone())).unwrap();
    engine.drain();
    assert_eq!(field(&engine, 3, "status"), json!("Post à générer"));

    // past stabilization, still inside the window
    tokio::time::advance(Duration::from_secs(3)).await;
    engine.ingest(ev.clone());
    assert_eq!(field(&engine, 3, "status"), json!("Post à générer"));
    assert_eq!(field(&engine, 3, "city"), json!("Lyon"));

    // once the write settles and the window lapses, events apply again
    step_until(&mut engine, |e| e.pending_edit(EntityId(3), "city").is_none()).await;
    tokio::time::advance(Duration::from_secs(4)).await;
    assert!(!engine.registry().is_protected(EntityId(3)));
    engine.ingest(ev);
    assert_eq!(field(&engine, 3, "status"), json!("Publié"));
}

#[tokio::test(start_paused = true)]
async fn validation_failure_rolls_back_without_retry() {
    let api = Arc::new(MockApi::with_rows(rows(5)));
    api.script_writes([Err(ApiError::from_status(422, r#"{"error":"price must be positive"}"#.into()))]);
    let mut engine = loaded(&api).await;
    let mut notices = engine.notices();

    engine.start_edit(EntityId(2), "price").unwrap();
    engine.save_edit(EntityId(2), "price", json!(-5)).unwrap();
    assert_eq!(field(&engine, 2, "price"), json!(-5));

    step_until(&mut engine, |e| e.pending_edit(EntityId(2), "price").is_none()).await;
    assert_eq!(field(&engine, 2, "price"), json!(10));
    assert_eq!(api.write_calls().len(), 1);
    assert!(!engine.registry().is_protected(EntityId(2)));
    let seen = drain_notices(&mut notices);
    assert_eq!(count(&seen, NoticeKind::Error), 1);
    assert!(seen.iter().any(|n| n.text.contains("price must be positive")));
}

#[tokio::test(start_paused = true)]
async fn rollback_keeps_post_protected_while_another_field_is_open() {
    let api = Arc::new(MockApi::with_rows(rows(5)));
    api.script_writes([Err(ApiError::from_status(422, "bad price".into()))]);
    let mut engine = loaded(&api).await;

    engine.start_edit(EntityId(3), "city").unwrap();
    engine.start_edit(EntityId(3), "price").unwrap();
    engine.save_edit(EntityId(3), "price", json!(-1)).unwrap();
    step_until(&mut engine, |e| e.pending_edit(EntityId(3), "price").is_none()).await;
    assert_eq!(field(&engine, 3, "price"), json!(10));
    assert!(engine.pending_edit(EntityId(3), "city").is_some());
    assert!(engine.registry().is_protected(EntityId(3)));

    tokio::time::advance(Duration::from_secs(3)).await;
    engine.ingest(ChangeEvent::new(EventKind::StatusChanged, EntityId(3), patch(json!({"status": "Publié"}))));
    assert_eq!(field(&engine, 3, "status"), json!("Post à générer"));
}

#[tokio::test(start_paused = true)]
async fn lagged_stream_resets_to_fresh_first_page() {
    let api = Arc::new(MockApi::with_rows(rows(5)));
    let mut engine = loaded(&api).await;
    let mut data = rows(5);
    data[3].set("city", &json!("Nantes"));
    api.set_rows(data);

    engine.updates().send(SyncUpdate::StreamLagged(12)).unwrap();
    step_until(&mut engine, |e| field(e, 4, "city") == json!("Nantes")).await;
    assert_eq!(api.list_calls().len(), 2);
    assert!(!engine.is_loading());
}

#[tokio::test(start_paused = true)]
async fn rollback_restores_pre_edit_value() {
    let api = Arc::new(MockApi::with_rows(rows(5)));
    api.script_writes([Err(ApiError::Conflict("row changed".into()))]);
    let mut engine = loaded(&api).await;

    engine.start_edit(EntityId(5), "text").unwrap();
    engine.update_edit(EntityId(5), "text", json!("draft 1"));
    tokio::time::advance(Duration::from_secs(9)).await;
    engine.ingest(ChangeEvent::new(EventKind::Updated, EntityId(5), patch(json!({"text": "from server"}))));
    engine.update_edit(EntityId(5), "text", json!("draft 2"));
    engine.save_edit(EntityId(5), "text", json!("final")).unwrap();

    step_until(&mut engine, |e| e.pending_edit(EntityId(5), "text").is_none()).await;
    assert_eq!(field(&engine, 5, "text"), json!("t5"));
}

#[tokio::test(start_paused = true)]
async fn cancel_shows_value_that_arrived_during_edit() {
    let api = Arc::new(MockApi::with_rows(rows(5)));
    let mut engine = loaded(&api).await;

    engine.start_edit(EntityId(4), "city").unwrap();
    engine.update_edit(EntityId(4), "city", json!("Mar"));
    assert!(engine.registry().is_protected(EntityId(4)));
    // a long edit outlives its window; later values are buffered instead
    tokio::time::advance(Duration::from_secs(9)).await;
    engine.ingest(ChangeEvent::new(EventKind::Updated, EntityId(4), patch(json!({"city": "Nice", "text": "x"}))));
    assert_eq!(field(&engine, 4, "city"), json!("Paris"), "buffered while editing");
    assert_eq!(field(&engine, 4, "text"), json!("x"), "other fields apply");

    assert_eq!(engine.cancel_edit(EntityId(4), "city"), Some(json!("Nice")));
    assert_eq!(field(&engine, 4, "city"), json!("Nice"));
    assert!(api.write_calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn unchanged_save_issues_no_write() {
    let api = Arc::new(MockApi::with_rows(rows(3)));
    let mut engine = loaded(&api).await;
    engine.start_edit(EntityId(1), "city").unwrap();
    engine.update_edit(EntityId(1), "city", json!("Lille"));
    engine.save_edit(EntityId(1), "city", json!("Paris")).unwrap();
    assert!(engine.pending_edit(EntityId(1), "city").is_none());
    assert!(!engine.registry().is_protected(EntityId(1)), "window released with nothing to protect");
    assert_eq!(engine.drain(), 0);
    assert!(api.write_calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn stabilization_drops_unrelated_events_briefly() {
    let api = Arc::new(MockApi::with_rows(rows(5)));
    let mut engine = loaded(&api).await;

    engine.start_edit(EntityId(1), "text").unwrap();
    engine.save_edit(EntityId(1), "text", json!("mine")).unwrap();
    step_until(&mut engine, |e| e.pending_edit(EntityId(1), "text").is_none()).await;

    let other = ChangeEvent::new(EventKind::Updated, EntityId(2), patch(json!({"text": "theirs"})));
    engine.ingest(other.clone());
    assert_eq!(field(&engine, 2, "text"), json!("t2"));

    tokio::time::advance(Duration::from_millis(2100)).await;
    engine.ingest(other);
    assert_eq!(field(&engine, 2, "text"), json!("theirs"));
}

#[tokio::test(start_paused = true)]
async fn superseded_failure_does_not_roll_back() {
    let api = Arc::new(MockApi::with_rows(rows(3)));
    api.script_writes([Err(ApiError::from_status(422, "too long".into())), Ok(())]);
    let mut engine = loaded(&api).await;
    let mut notices = engine.notices();

    engine.start_edit(EntityId(2), "text").unwrap();
    engine.save_edit(EntityId(2), "text", json!("v1")).unwrap();
    // let the first write fail before it is superseded
    tokio::task::yield_now().await;
    engine.save_edit(EntityId(2), "text", json!("v2")).unwrap();

    step_until(&mut engine, |e| e.pending_edit(EntityId(2), "text").is_none()).await;
    assert_eq!(field(&engine, 2, "text"), json!("v2"));
    assert_eq!(api.write_calls().len(), 2);
    assert_eq!(count(&drain_notices(&mut notices), NoticeKind::Error), 0);
}

#[tokio::test(start_paused = true)]
async fn created_event_extends_partial_list() {
    let api = Arc::new(MockApi::with_rows(rows(200)));
    let mut engine = loaded(&api).await;
    let before = engine.snapshot();
    assert_eq!((before.len(), before.total_count, before.has_more), (50, 200, true));

    engine.ingest(ChangeEvent::new(EventKind::Created, EntityId(201), patch(json!({"text": "fresh"}))));
    let after = engine.snapshot();
    assert_eq!((after.len(), after.total_count), (51, 201));
    assert!(engine.has_more());
    assert_eq!(after.items[0].id, EntityId(201));
    // untouched entities keep their identity
    assert!(before.items.iter().zip(after.items[1..].iter()).all(|(a, b)| Arc::ptr_eq(a, b)));
}

#[tokio::test(start_paused = true)]
async fn status_filter_change_resets_to_new_first_page() {
    let mut data: Vec<Entity> = (1..=60).map(|i| post(i, PostStatus::from("A"))).collect();
    data.extend((61..=63).map(|i| post(i, PostStatus::from("B"))));
    let api = Arc::new(MockApi::with_rows(data));
    let mut engine = SyncEngine::new(api.clone(), &SyncConfig::default());
    let mut epochs = engine.subscribe();

    engine.refresh(QueryContext::default().with_statuses([PostStatus::from("A")]));
    step_until(&mut engine, |e| !e.is_loading()).await;
    assert_eq!(engine.snapshot().len(), 50);
    assert!(engine.has_more());

    engine.refresh(QueryContext::default().with_statuses([PostStatus::from("B")]));
    step_until(&mut engine, |e| !e.is_loading()).await;
    let snap = engine.snapshot();
    assert_eq!(snap.ids(), vec![EntityId(63), EntityId(62), EntityId(61)]);
    assert_eq!(snap.total_count, 3);
    assert!(!engine.has_more());
    assert!(epochs.has_changed().unwrap());
    assert_eq!(*epochs.borrow_and_update(), 2);
}

#[tokio::test(start_paused = true)]
async fn scrolling_loads_next_page_once() {
    let api = Arc::new(MockApi::with_rows(rows(120)));
    let mut engine = loaded(&api).await;
    let near_bottom = ScrollMetrics::new(4800.0, 600.0, 5500.0);

    assert!(engine.on_scroll(near_bottom));
    assert!(!engine.on_scroll(near_bottom), "throttled and in flight");
    assert!(!engine.load_more(), "already loading");
    step_until(&mut engine, |e| !e.is_loading()).await;
    assert_eq!(engine.snapshot().len(), 100);
    assert_eq!(api.list_calls().last().map(|c| c.offset), Some(50));

    assert!(engine.load_more());
    step_until(&mut engine, |e| !e.is_loading()).await;
    assert_eq!(engine.snapshot().len(), 120);
    assert!(!engine.has_more());
    assert!(!engine.load_more());
}

#[tokio::test(start_paused = true)]
async fn failed_page_load_surfaces_error_and_unblocks() {
    let api = Arc::new(MockApi::with_rows(rows(80)));
    let mut engine = loaded(&api).await;
    let mut notices = engine.notices();
    api.script_list_failures([ApiError::Server { status: 500, body: "boom".into() }]);

    assert!(engine.load_more());
    step_until(&mut engine, |e| !e.is_loading()).await;
    assert_eq!(engine.snapshot().len(), 50);
    assert_eq!(count(&drain_notices(&mut notices), NoticeKind::Error), 1);
    assert!(engine.load_more());
}

#[tokio::test(start_paused = true)]
async fn deleted_post_drops_its_open_edit() {
    let api = Arc::new(MockApi::with_rows(rows(5)));
    let mut engine = loaded(&api).await;
    engine.start_edit(EntityId(4), "text").unwrap();
    let deleted = ChangeEvent::new(EventKind::Deleted, EntityId(4), Patch::new());
    engine.ingest(deleted.clone());
    assert!(engine.pending_edit(EntityId(4), "text").is_some(), "suppressed inside the window");

    tokio::time::advance(Duration::from_secs(9)).await;
    engine.ingest(deleted);
    assert!(engine.pending_edit(EntityId(4), "text").is_none());
    assert!(!engine.snapshot().contains(EntityId(4)));
    assert_eq!(engine.snapshot().total_count, 4);
    assert!(!engine.coordination().is_inline_editing());
}
