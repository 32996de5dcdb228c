#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use postdeck_core::{EntityId, EventKind};
use postdeck_stream::{ByteStream, ConnectionStatus, EventSource, EventStreamClient, ReconnectPolicy, StreamError};

enum Script {
    Fail,
    /// Serve chunks, then keep the connection open.
    Serve(Vec<&'static [u8]>),
    /// Serve chunks, then end the body.
    ServeThenEnd(Vec<&'static [u8]>),
}

struct ScriptedSource {
    script: Mutex<VecDeque<Script>>,
    opens: AtomicUsize,
}

impl ScriptedSource {
    fn new(script: Vec<Script>) -> Arc<Self> {
        Arc::new(Self { script: Mutex::new(script.into()), opens: AtomicUsize::new(0) })
    }

    fn opens(&self) -> usize { self.opens.load(Ordering::SeqCst) }
}

fn chunks(parts: Vec<&'static [u8]>) -> impl futures::Stream<Item = Result<Bytes, StreamError>> {
    futures::stream::iter(parts.into_iter().map(|c| Ok(Bytes::from_static(c))))
}

#[async_trait::async_trait]
impl EventSource for ScriptedSource {
    async fn open(&self, _last_event_id: Option<&str>) -> Result<ByteStream, StreamError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Script::Fail) => Err(StreamError::Connect("connection refused".into())),
            Some(Script::Serve(parts)) => Ok(chunks(parts).chain(futures::stream::pending()).boxed()),
            Some(Script::ServeThenEnd(parts)) => Ok(chunks(parts).boxed()),
            None => Ok(futures::stream::pending().boxed()),
        }
    }

    fn describe(&self) -> String { "scripted".into() }
}

fn policy(max_attempts: u32) -> ReconnectPolicy {
    ReconnectPolicy { max_attempts, jitter_max: Duration::ZERO, ..ReconnectPolicy::default() }
}

#[tokio::test(start_paused = true)]
async fn reconnects_and_survives_malformed_frames() {
    let source = ScriptedSource::new(vec![
        Script::Fail,
        Script::Serve(vec![
            b"event: entity\ndata: {\"kind\":\"updated\",\"entityId\":1,\"patch\":{\"city\":\"Lyon\"}}\n\n",
            b"event: entity\ndata: {broken\n\n",
            b": keepalive\n\n",
            b"event: created\ndata: {\"entityId\":2,",
            b"\"patch\":{\"text\":\"hi\"}}\n\n",
        ]),
    ]);
    let client = EventStreamClient::new(source.clone(), policy(5), 64);
    let mut events = client.on_entity_event();
    let status = client.status();
    let handle = client.connect();

    let first = tokio::time::timeout(Duration::from_secs(30), events.recv()).await.unwrap().unwrap();
    let second = tokio::time::timeout(Duration::from_secs(30), events.recv()).await.unwrap().unwrap();
    assert_eq!((first.entity_id, first.kind), (EntityId(1), EventKind::Updated));
    assert_eq!((second.entity_id, second.kind), (EntityId(2), EventKind::Created));
    assert_eq!(*status.borrow(), ConnectionStatus::Connected);
    // the malformed frame did not drop the connection
    assert_eq!(source.opens(), 2);
    handle.cancel();
}

#[tokio::test(start_paused = true)]
async fn heartbeats_record_liveness() {
    let source = ScriptedSource::new(vec![Script::Serve(vec![b": keepalive\n\n", b"event: ping\ndata:\n\n"])]);
    let client = EventStreamClient::new(source.clone(), policy(5), 8);
    assert_eq!(client.last_heartbeat(), None);
    let mut beats = client.heartbeats();
    let handle = client.connect();

    tokio::time::timeout(Duration::from_secs(30), beats.wait_for(|t| t.is_some())).await.unwrap().unwrap();
    assert!(client.last_heartbeat().is_some());
    assert_eq!(source.opens(), 1);
    handle.cancel();
}

#[tokio::test(start_paused = true)]
async fn ended_body_is_retried() {
    let source = ScriptedSource::new(vec![
        Script::ServeThenEnd(vec![b"event: deleted\ndata: {\"id\":4}\n\n"]),
        Script::Serve(vec![b"event: deleted\ndata: {\"id\":5}\n\n"]),
    ]);
    let client = EventStreamClient::new(source.clone(), policy(5), 64);
    let mut events = client.on_entity_event();
    let handle = client.connect();
    let a = tokio::time::timeout(Duration::from_secs(30), events.recv()).await.unwrap().unwrap();
    let b = tokio::time::timeout(Duration::from_secs(30), events.recv()).await.unwrap().unwrap();
    assert_eq!(a.entity_id, EntityId(4));
    assert_eq!(b.entity_id, EntityId(5));
    assert_eq!(source.opens(), 2);
    handle.cancel();
}

#[tokio::test(start_paused = true)]
async fn exhausted_attempts_enter_cooldown_then_resume() {
    let source = ScriptedSource::new(vec![Script::Fail, Script::Fail, Script::Fail]);
    let client = EventStreamClient::new(source.clone(), policy(2), 8);
    let mut status = client.status();
    let handle = client.connect();

    tokio::time::timeout(Duration::from_secs(60), status.wait_for(|s| *s == ConnectionStatus::Error))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(source.opens(), 3);

    // still cooling down well before the 5 minute mark
    tokio::time::sleep(Duration::from_secs(200)).await;
    assert_eq!(source.opens(), 3);

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(source.opens(), 4);
    assert_eq!(*status.borrow(), ConnectionStatus::Connected);
    handle.cancel();
}
