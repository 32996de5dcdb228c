//! postdeck core types: posts, change events, sort order and query context.

#![forbid(unsafe_code)]

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub mod order;
pub mod query;

pub use order::{compare_entities, compare_values};
pub use query::{Combinator, ContextSignature, FilterExpression, FilterGroup, QueryContext};

/// Field name carrying the workflow status inside patches.
pub const STATUS_FIELD: &str = "status";
/// Field name resolving to the entity id in sort keys and lookups.
pub const ID_FIELD: &str = "id";

/// Stable integer identity of a post.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub i64);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Partial update `{field: value}`. Unknown fields are carried as-is.
pub type Patch = Map<String, Value>;

/// Workflow status of a post draft. Serialized as its display label so the
/// wire format matches the upstream database; unknown labels are preserved.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PostStatus {
    ToGenerate,
    Generated,
    ToReview,
    Approved,
    Published,
    Failed,
    Other(String),
}

impl PostStatus {
    pub fn as_str(&self) -> &str {
        match self {
            PostStatus::ToGenerate => "Post à générer",
            PostStatus::Generated => "Post généré",
            PostStatus::ToReview => "Post à valider",
            PostStatus::Approved => "Post validé",
            PostStatus::Published => "Publié",
            PostStatus::Failed => "Erreur",
            PostStatus::Other(s) => s.as_str(),
        }
    }
}

impl Default for PostStatus {
    fn default() -> Self { PostStatus::ToGenerate }
}

impl From<&str> for PostStatus {
    fn from(s: &str) -> Self {
        match s {
            "Post à générer" => PostStatus::ToGenerate,
            "Post généré" => PostStatus::Generated,
            "Post à valider" => PostStatus::ToReview,
            "Post validé" => PostStatus::Approved,
            "Publié" => PostStatus::Published,
            "Erreur" => PostStatus::Failed,
            other => PostStatus::Other(other.to_string()),
        }
    }
}

impl From<String> for PostStatus {
    fn from(s: String) -> Self { PostStatus::from(s.as_str()) }
}

impl From<PostStatus> for String {
    fn from(s: PostStatus) -> Self {
        match s {
            PostStatus::Other(s) => s,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for PostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// A post as displayed by the dashboard. `fields` holds every independently
/// editable scalar/text column (`text`, `city`, `price`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    #[serde(default)]
    pub status: PostStatus,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Entity {
    pub fn new(id: EntityId, status: PostStatus) -> Self {
        Self { id, status, fields: Map::new() }
    }

    /// Build an entity from a creation patch; missing status defaults to `ToGenerate`.
    pub fn from_patch(id: EntityId, patch: &Patch) -> Self {
        let mut e = Self::new(id, PostStatus::default());
        e.merge(patch);
        e
    }

    /// Resolve `id`, `status` and plain fields uniformly as JSON values.
    pub fn get(&self, field: &str) -> Value {
        match field {
            ID_FIELD => Value::from(self.id.0),
            STATUS_FIELD => Value::String(self.status.as_str().to_string()),
            other => self.fields.get(other).cloned().unwrap_or(Value::Null),
        }
    }

    /// Set one field. `id` is immutable and ignored; non-string statuses are ignored.
    pub fn set(&mut self, field: &str, value: &Value) {
        match field {
            ID_FIELD => {}
            STATUS_FIELD => {
                if let Some(s) = value.as_str() {
                    self.status = PostStatus::from(s);
                }
            }
            other => {
                self.fields.insert(other.to_string(), value.clone());
            }
        }
    }

    /// Merge every key of `patch` into this entity.
    pub fn merge(&mut self, patch: &Patch) {
        for (k, v) in patch.iter() {
            self.set(k, v);
        }
    }
}

/// Kind of a server-pushed change. Unknown kinds decode to `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    #[serde(alias = "Created", alias = "create")]
    Created,
    #[serde(alias = "Updated", alias = "update")]
    Updated,
    #[serde(alias = "Deleted", alias = "delete")]
    Deleted,
    #[serde(alias = "StatusChanged", alias = "statusChanged")]
    StatusChanged,
    #[serde(other)]
    Unknown,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Created => "created",
            EventKind::Updated => "updated",
            EventKind::Deleted => "deleted",
            EventKind::StatusChanged => "status_changed",
            EventKind::Unknown => "unknown",
        }
    }
}

/// Server-pushed change notification for a single post.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub kind: EventKind,
    pub entity_id: EntityId,
    #[serde(default)]
    pub patch: Patch,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn new(kind: EventKind, entity_id: EntityId, patch: Patch) -> Self {
        Self { kind, entity_id, patch, timestamp: Utc::now() }
    }

    /// Whether applying this event changes `field`.
    pub fn touches(&self, field: &str) -> bool {
        self.patch.contains_key(field)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    #[default]
    Info,
    Warn,
    Error,
}

/// Non-entity server message (e.g. "generation batch finished").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(default)]
    pub level: NotificationLevel,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDir {
    Asc,
    #[default]
    Desc,
}

/// Active sort: key resolved through `Entity::get`, ties broken by ascending id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SortSpec {
    pub key: String,
    pub dir: SortDir,
}

impl SortSpec {
    pub fn new(key: impl Into<String>, dir: SortDir) -> Self { Self { key: key.into(), dir } }

    pub fn is_key(&self, field: &str) -> bool { self.key == field }
}

impl Default for SortSpec {
    fn default() -> Self { Self { key: ID_FIELD.to_string(), dir: SortDir::Desc } }
}

/// One page of the read endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total_count: u64,
}

pub mod prelude {
    pub use super::{
        ChangeEvent, Entity, EntityId, EventKind, Notification, NotificationLevel, Page, Patch,
        PostStatus, SortDir, SortSpec,
    };
    pub use super::query::{ContextSignature, FilterExpression, FilterGroup, QueryContext};
}
