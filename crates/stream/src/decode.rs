//! Typed decoding of SSE frames.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use postdeck_core::{ChangeEvent, EntityId, EventKind, Notification, Patch};
use serde::Deserialize;

use crate::sse::SseFrame;

/// A decoded stream message.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Entity(ChangeEvent),
    Notification(Notification),
    /// Liveness only; resets no timers.
    Heartbeat,
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid json in '{event}' frame: {source}")]
    Json {
        event: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("unknown frame type '{0}'")]
    UnknownType(String),
}

/// Entity payload where `kind` may instead come from the SSE event name.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EntityPayload {
    #[serde(default)]
    kind: Option<EventKind>,
    #[serde(alias = "id")]
    entity_id: EntityId,
    #[serde(default, alias = "data")]
    patch: Patch,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

fn event_kind_from_name(name: &str) -> Option<EventKind> {
    match serde_json::from_value::<EventKind>(serde_json::Value::String(name.to_string())) {
        Ok(EventKind::Unknown) | Err(_) => None,
        Ok(kind) => Some(kind),
    }
}

fn decode_entity(frame: &SseFrame, named: Option<EventKind>) -> Result<StreamEvent, DecodeError> {
    let payload: EntityPayload = serde_json::from_str(&frame.data)
        .map_err(|source| DecodeError::Json { event: frame.event_name().to_string(), source })?;
    let kind = named.or(payload.kind).unwrap_or(EventKind::Unknown);
    let mut ev = ChangeEvent::new(kind, payload.entity_id, payload.patch);
    if let Some(ts) = payload.timestamp {
        ev.timestamp = ts;
    }
    Ok(StreamEvent::Entity(ev))
}

/// Decode one frame. Event names `entity`/`message`/`change` carry `kind` in the
/// payload; names like `created` or `status_changed` carry it in the name.
pub fn decode_frame(frame: &SseFrame) -> Result<StreamEvent, DecodeError> {
    if frame.comment {
        return Ok(StreamEvent::Heartbeat);
    }
    match frame.event_name() {
        "heartbeat" | "ping" | "keepalive" => Ok(StreamEvent::Heartbeat),
        "entity" | "message" | "change" => decode_entity(frame, None),
        "notification" => serde_json::from_str::<Notification>(&frame.data)
            .map(StreamEvent::Notification)
            .map_err(|source| DecodeError::Json { event: "notification".into(), source }),
        other => match event_kind_from_name(other) {
            Some(kind) => decode_entity(frame, Some(kind)),
            None => Err(DecodeError::UnknownType(other.to_string())),
        },
    }
}
