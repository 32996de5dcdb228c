//! postdeck stream: long-lived SSE connection to the posts service.
//!
//! `EventStreamClient::connect` spawns a task that opens the stream, decodes
//! typed frames and fans them out to listeners; transport failures are retried
//! forever under `ReconnectPolicy` (capped backoff, attempt ceiling, cooldown).

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use metrics::counter;
use postdeck_core::{ChangeEvent, Notification};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub mod backoff;
pub mod decode;
pub mod source;
pub mod sse;

pub use backoff::{Backoff, BackoffStep, ReconnectPolicy};
pub use decode::{decode_frame, DecodeError, StreamEvent};
pub use source::{ByteStream, EventSource, HttpEventSource};
pub use sse::{SseFrame, SseParser};

/// Connection state shown as the live/offline indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    /// Between retries.
    Disconnected,
    /// Attempts exhausted; cooling down before the next cycle.
    Error,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum StreamError {
    #[error("connect: {0}")]
    Connect(String),
    #[error("unexpected status: {0}")]
    Status(u16),
    #[error("transport: {0}")]
    Transport(String),
    #[error("stream ended by server")]
    Ended,
}

#[derive(Clone)]
struct Sinks {
    entity_tx: broadcast::Sender<ChangeEvent>,
    notify_tx: broadcast::Sender<Notification>,
    status_tx: Arc<watch::Sender<ConnectionStatus>>,
    /// Last heartbeat (or comment line) seen on the connection.
    heartbeat_tx: Arc<watch::Sender<Option<Instant>>>,
}

impl Sinks {
    fn set_status(&self, s: ConnectionStatus) {
        self.status_tx.send_replace(s);
    }

    fn dispatch(&self, frame: &SseFrame) {
        match decode_frame(frame) {
            Ok(StreamEvent::Entity(ev)) => {
                counter!("stream_events_total", 1u64, "kind" => ev.kind.as_str());
                debug!(entity = %ev.entity_id, kind = ev.kind.as_str(), "stream: entity event");
                let _ = self.entity_tx.send(ev);
            }
            Ok(StreamEvent::Notification(n)) => {
                debug!(message = %n.message, "stream: notification");
                let _ = self.notify_tx.send(n);
            }
            Ok(StreamEvent::Heartbeat) => {
                debug!("stream: heartbeat");
                self.heartbeat_tx.send_replace(Some(Instant::now()));
            }
            Err(DecodeError::UnknownType(t)) => debug!(frame_type = %t, "stream: ignoring unknown frame type"),
            Err(e) => {
                counter!("stream_malformed_total", 1u64);
                warn!(error = %e, "stream: dropping malformed frame");
            }
        }
    }
}

/// Cancellation handle for the connection task.
pub struct StreamHandle {
    task: Option<tokio::task::JoinHandle<()>>,
}

impl StreamHandle {
    pub fn cancel(mut self) {
        if let Some(h) = self.task.take() {
            h.abort();
        }
    }

    pub fn is_finished(&self) -> bool { self.task.as_ref().map_or(true, |t| t.is_finished()) }
}

pub struct EventStreamClient {
    source: Arc<dyn EventSource>,
    policy: ReconnectPolicy,
    sinks: Sinks,
}

impl EventStreamClient {
    pub fn new(source: Arc<dyn EventSource>, policy: ReconnectPolicy, cap: usize) -> Self {
        let (entity_tx, _) = broadcast::channel(cap.max(1));
        let (notify_tx, _) = broadcast::channel(cap.max(1));
        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected);
        let (heartbeat_tx, _) = watch::channel(None);
        let sinks = Sinks {
            entity_tx,
            notify_tx,
            status_tx: Arc::new(status_tx),
            heartbeat_tx: Arc::new(heartbeat_tx),
        };
        Self { source, policy, sinks }
    }

    pub fn on_entity_event(&self) -> broadcast::Receiver<ChangeEvent> { self.sinks.entity_tx.subscribe() }

    pub fn on_notification(&self) -> broadcast::Receiver<Notification> { self.sinks.notify_tx.subscribe() }

    pub fn status(&self) -> watch::Receiver<ConnectionStatus> { self.sinks.status_tx.subscribe() }

    /// Liveness confirmed by heartbeats; no timer is reset by them.
    pub fn heartbeats(&self) -> watch::Receiver<Option<Instant>> { self.sinks.heartbeat_tx.subscribe() }

    pub fn last_heartbeat(&self) -> Option<Instant> { *self.sinks.heartbeat_tx.borrow() }

    /// Spawn the connection task. Listeners registered before or after this call
    /// receive every event published after they subscribed.
    pub fn connect(&self) -> StreamHandle {
        let source = Arc::clone(&self.source);
        let policy = self.policy.clone();
        let sinks = self.sinks.clone();
        info!(source = %source.describe(), "stream: connect requested");
        let task = tokio::spawn(run(source, policy, sinks));
        StreamHandle { task: Some(task) }
    }
}

fn random_jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

async fn run(source: Arc<dyn EventSource>, policy: ReconnectPolicy, sinks: Sinks) {
    let mut backoff = Backoff::new(policy);
    let mut last_id: Option<String> = None;
    loop {
        sinks.set_status(ConnectionStatus::Connecting);
        if let Err(e) = pump(source.as_ref(), &sinks, &mut backoff, &mut last_id).await {
            warn!(error = %e, "stream: connection lost");
        }
        counter!("stream_reconnects_total", 1u64);
        let jitter = random_jitter(backoff.policy().jitter_max);
        match backoff.next_step(jitter) {
            BackoffStep::Retry { attempt, delay } => {
                sinks.set_status(ConnectionStatus::Disconnected);
                info!(attempt, delay_ms = %delay.as_millis(), "stream: reconnect scheduled");
                tokio::time::sleep(delay).await;
            }
            BackoffStep::Cooldown(cooldown) => {
                sinks.set_status(ConnectionStatus::Error);
                warn!(cooldown_secs = cooldown.as_secs(), "stream: reconnect attempts exhausted; cooling down");
                tokio::time::sleep(cooldown).await;
            }
        }
    }
}

/// One connection lifetime. Only returns on failure; a clean end of body is
/// reported as `StreamError::Ended`.
async fn pump(
    source: &dyn EventSource,
    sinks: &Sinks,
    backoff: &mut Backoff,
    last_id: &mut Option<String>,
) -> Result<(), StreamError> {
    let mut stream = source.open(last_id.as_deref()).await?;
    sinks.set_status(ConnectionStatus::Connected);
    backoff.reset();
    info!("stream: connected");
    let mut parser = SseParser::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        for frame in parser.push(&chunk) {
            sinks.dispatch(&frame);
        }
        if let Some(id) = parser.last_id() {
            *last_id = Some(id.to_string());
        }
    }
    Err(StreamError::Ended)
}
