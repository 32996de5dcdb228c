//! Transport seam for the event stream.

#![forbid(unsafe_code)]

use std::time::Duration;

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use reqwest::header::{ACCEPT, CACHE_CONTROL};

use crate::StreamError;

pub type ByteStream = BoxStream<'static, Result<Bytes, StreamError>>;

/// Opens one server-push connection and yields its raw body chunks.
#[async_trait::async_trait]
pub trait EventSource: Send + Sync {
    async fn open(&self, last_event_id: Option<&str>) -> Result<ByteStream, StreamError>;

    /// Human label for logs.
    fn describe(&self) -> String;
}

/// `GET <url>` with `Accept: text/event-stream` over reqwest.
pub struct HttpEventSource {
    http: reqwest::Client,
    url: String,
}

impl HttpEventSource {
    pub fn new(url: impl Into<String>, connect_timeout: Duration) -> Result<Self, StreamError> {
        // no overall timeout: the body is meant to stay open
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| StreamError::Connect(e.to_string()))?;
        Ok(Self { http, url: url.into() })
    }
}

#[async_trait::async_trait]
impl EventSource for HttpEventSource {
    async fn open(&self, last_event_id: Option<&str>) -> Result<ByteStream, StreamError> {
        let mut req = self
            .http
            .get(&self.url)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache");
        if let Some(id) = last_event_id {
            req = req.header("Last-Event-ID", id);
        }
        let res = req.send().await.map_err(|e| StreamError::Connect(e.to_string()))?;
        if !res.status().is_success() {
            return Err(StreamError::Status(res.status().as_u16()));
        }
        Ok(res
            .bytes_stream()
            .map_err(|e| StreamError::Transport(e.to_string()))
            .boxed())
    }

    fn describe(&self) -> String { self.url.clone() }
}
