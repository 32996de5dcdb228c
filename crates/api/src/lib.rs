//! postdeck API façade: the CRUD endpoints the sync core pages from and writes to.
//!
//! Frontends and the sync engine depend on the `PostsApi` trait only. `HttpApi`
//! talks to the real service; `MockApi` is a scripted in-memory stand-in.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use postdeck_core::{compare_entities, Entity, EntityId, Page, QueryContext};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

/// Write/read failures. The first four variants are network-class and safe to
/// retry against the idempotent write endpoint; the rest are terminal.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
pub enum ApiError {
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("aborted: {0}")]
    Aborted(String),
    #[error("offline: {0}")]
    Offline(String),
    #[error("transport: {0}")]
    Transport(String),
    #[error("validation ({status}): {detail}")]
    Validation { status: u16, detail: String },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("server ({status}): {body}")]
    Server { status: u16, body: String },
    #[error("decode: {0}")]
    Decode(String),
}

impl ApiError {
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            ApiError::Timeout(_) | ApiError::Aborted(_) | ApiError::Offline(_) | ApiError::Transport(_)
        )
    }

    /// Map a non-success HTTP status and its body to the taxonomy.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            400 | 422 => ApiError::Validation { status, detail: server_detail(&body) },
            404 => ApiError::NotFound(server_detail(&body)),
            408 | 504 => ApiError::Timeout(format!("status {status}")),
            409 | 412 => ApiError::Conflict(server_detail(&body)),
            _ => ApiError::Server { status, body: server_detail(&body) },
        }
    }

    /// Short label for metrics.
    pub fn class(&self) -> &'static str {
        match self {
            ApiError::Timeout(_) => "timeout",
            ApiError::Aborted(_) => "aborted",
            ApiError::Offline(_) => "offline",
            ApiError::Transport(_) => "transport",
            ApiError::Validation { .. } => "validation",
            ApiError::Conflict(_) => "conflict",
            ApiError::NotFound(_) => "not_found",
            ApiError::Server { .. } => "server",
            ApiError::Decode(_) => "decode",
        }
    }
}

/// Prefer a JSON `{"error": ..}` / `{"message": ..}` field when the server sends one.
fn server_detail(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            ["error", "message", "detail"]
                .iter()
                .find_map(|k| v.get(*k).and_then(|m| m.as_str()).map(str::to_string))
        })
        .unwrap_or_else(|| body.trim().to_string())
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ApiError::Timeout(e.to_string())
        } else if e.is_connect() {
            ApiError::Offline(e.to_string())
        } else if e.is_decode() {
            ApiError::Decode(e.to_string())
        } else if let Some(status) = e.status() {
            ApiError::from_status(status.as_u16(), e.to_string())
        } else {
            ApiError::Transport(e.to_string())
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// CRUD surface consumed by the sync core.
#[async_trait::async_trait]
pub trait PostsApi: Send + Sync {
    /// `GET posts` for the given context, starting at `offset`.
    async fn list(&self, ctx: &QueryContext, offset: u64, limit: u32) -> ApiResult<Page<Entity>>;

    /// `PUT posts/{id}` with `{field: value}`. Must be idempotent.
    async fn update_field(&self, id: EntityId, field: &str, value: &Value) -> ApiResult<()>;
}

// ----------------- HTTP implementation -----------------

/// reqwest-backed client. Each call has a per-request timeout plus a hard abort
/// so a stalled body can never hang a save.
#[derive(Clone)]
pub struct HttpApi {
    http: reqwest::Client,
    base_url: String,
    hard_timeout: Duration,
}

impl HttpApi {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration, hard_timeout: Duration) -> ApiResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self { http, base_url, hard_timeout })
    }

    async fn check(res: reqwest::Response) -> ApiResult<reqwest::Response> {
        if res.status().is_success() {
            return Ok(res);
        }
        let status = res.status().as_u16();
        let body = res.text().await.unwrap_or_default();
        Err(ApiError::from_status(status, body))
    }

    async fn bounded<T>(&self, fut: impl std::future::Future<Output = ApiResult<T>>) -> ApiResult<T> {
        match tokio::time::timeout(self.hard_timeout, fut).await {
            Ok(res) => res,
            Err(_) => Err(ApiError::Aborted(format!("no response after {}ms", self.hard_timeout.as_millis()))),
        }
    }
}

#[async_trait::async_trait]
impl PostsApi for HttpApi {
    async fn list(&self, ctx: &QueryContext, offset: u64, limit: u32) -> ApiResult<Page<Entity>> {
        let t0 = Instant::now();
        let url = format!("{}/posts", self.base_url);
        let pairs = ctx.to_query_pairs(offset, limit);
        debug!(url = %url, offset, limit, "api: list start");
        let res = self
            .bounded(async {
                let res = self.http.get(&url).query(&pairs).send().await?;
                let res = Self::check(res).await?;
                Ok(res.json::<Page<Entity>>().await?)
            })
            .await;
        let took_ms = t0.elapsed().as_millis();
        histogram!("api_list_ms", t0.elapsed().as_secs_f64() * 1000.0);
        match &res {
            Ok(page) => info!(items = page.items.len(), total = page.total_count, offset, took_ms = %took_ms, "api: list ok"),
            Err(e) => warn!(error = %e, offset, took_ms = %took_ms, "api: list failed"),
        }
        res
    }

    async fn update_field(&self, id: EntityId, field: &str, value: &Value) -> ApiResult<()> {
        let t0 = Instant::now();
        let url = format!("{}/posts/{}", self.base_url, id);
        let mut body = Map::new();
        body.insert(field.to_string(), value.clone());
        let res = self
            .bounded(async {
                let res = self.http.put(&url).json(&body).send().await?;
                Self::check(res).await.map(|_| ())
            })
            .await;
        let took_ms = t0.elapsed().as_millis();
        histogram!("api_update_ms", t0.elapsed().as_secs_f64() * 1000.0);
        match &res {
            Ok(()) => info!(entity = %id, field = %field, took_ms = %took_ms, "api: update ok"),
            Err(e) => {
                counter!("api_update_errors_total", 1u64, "class" => e.class());
                warn!(entity = %id, field = %field, error = %e, took_ms = %took_ms, "api: update failed");
            }
        }
        res
    }
}

// ----------------- Mock implementation -----------------

/// One recorded write against the mock.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteCall {
    pub id: EntityId,
    pub field: String,
    pub value: Value,
}

/// One recorded page request against the mock.
#[derive(Debug, Clone, PartialEq)]
pub struct ListCall {
    pub ctx: QueryContext,
    pub offset: u64,
    pub limit: u32,
}

/// In-memory implementation for tests and demos. Rows are filtered by status and
/// sorted with the context's sort; writes pop scripted outcomes (default Ok).
#[derive(Default)]
pub struct MockApi {
    rows: Mutex<Vec<Entity>>,
    total_override: Mutex<Option<u64>>,
    write_script: Mutex<VecDeque<ApiResult<()>>>,
    list_script: Mutex<VecDeque<ApiError>>,
    writes: Mutex<Vec<WriteCall>>,
    lists: Mutex<Vec<ListCall>>,
    write_latency: Mutex<Duration>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockApi {
    pub fn new() -> Self { Self::default() }

    pub fn with_rows(rows: Vec<Entity>) -> Self {
        let me = Self::default();
        *lock(&me.rows) = rows;
        me
    }

    pub fn set_rows(&self, rows: Vec<Entity>) { *lock(&self.rows) = rows; }

    /// Report this total instead of the filtered row count.
    pub fn set_total(&self, total: Option<u64>) { *lock(&self.total_override) = total; }

    /// Queue outcomes for the next writes, in order.
    pub fn script_writes(&self, outcomes: impl IntoIterator<Item = ApiResult<()>>) {
        lock(&self.write_script).extend(outcomes);
    }

    /// Queue failures for the next list calls, in order.
    pub fn script_list_failures(&self, errors: impl IntoIterator<Item = ApiError>) {
        lock(&self.list_script).extend(errors);
    }

    pub fn set_write_latency(&self, d: Duration) { *lock(&self.write_latency) = d; }

    pub fn write_calls(&self) -> Vec<WriteCall> { lock(&self.writes).clone() }

    pub fn list_calls(&self) -> Vec<ListCall> { lock(&self.lists).clone() }

    pub fn row(&self, id: EntityId) -> Option<Entity> {
        lock(&self.rows).iter().find(|e| e.id == id).cloned()
    }
}

#[async_trait::async_trait]
impl PostsApi for MockApi {
    async fn list(&self, ctx: &QueryContext, offset: u64, limit: u32) -> ApiResult<Page<Entity>> {
        lock(&self.lists).push(ListCall { ctx: ctx.clone(), offset, limit });
        if let Some(e) = lock(&self.list_script).pop_front() {
            return Err(e);
        }
        let mut rows: Vec<Entity> = lock(&self.rows)
            .iter()
            .filter(|e| ctx.statuses.is_empty() || ctx.statuses.contains(&e.status))
            .cloned()
            .collect();
        rows.sort_by(|a, b| compare_entities(a, b, &ctx.sort));
        let total = lock(&self.total_override).unwrap_or(rows.len() as u64);
        let items = rows.into_iter().skip(offset as usize).take(limit as usize).collect();
        Ok(Page { items, total_count: total })
    }

    async fn update_field(&self, id: EntityId, field: &str, value: &Value) -> ApiResult<()> {
        lock(&self.writes).push(WriteCall { id, field: field.to_string(), value: value.clone() });
        let latency = *lock(&self.write_latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let outcome = lock(&self.write_script).pop_front().unwrap_or(Ok(()));
        if outcome.is_ok() {
            if let Some(row) = lock(&self.rows).iter_mut().find(|e| e.id == id) {
                row.set(field, value);
            }
        }
        outcome
    }
}
