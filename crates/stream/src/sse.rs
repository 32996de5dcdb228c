//! Incremental `text/event-stream` framing.

#![forbid(unsafe_code)]

use bytes::BytesMut;

/// One dispatched SSE frame. `comment` marks comment-only frames (keep-alives).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
    pub comment: bool,
}

impl SseFrame {
    pub fn event_name(&self) -> &str { self.event.as_deref().unwrap_or("message") }
}

/// Splits arbitrary byte chunks into frames. Safe across chunk boundaries,
/// including a CRLF split between two chunks.
#[derive(Debug, Default)]
pub struct SseParser {
    buf: BytesMut,
    event: Option<String>,
    data: Vec<String>,
    last_id: Option<String>,
    saw_comment: bool,
}

impl SseParser {
    pub fn new() -> Self { Self::default() }

    /// Last `id:` seen; persists across frames like the browser's lastEventId.
    pub fn last_id(&self) -> Option<&str> { self.last_id.as_deref() }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line = self.buf.split_to(pos);
            let _ = self.buf.split_to(1); // drop '\n'
            if line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }
            let line = String::from_utf8_lossy(&line);
            if let Some(frame) = self.feed_line(&line) {
                out.push(frame);
            }
        }
        out
    }

    fn feed_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            self.saw_comment = true;
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            "id" => self.last_id = Some(value.to_string()),
            // reconnect timing is owned by our own policy
            "retry" => {}
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let comment = std::mem::take(&mut self.saw_comment);
        if self.data.is_empty() && self.event.is_none() {
            return comment.then(|| SseFrame { comment: true, id: self.last_id.clone(), ..Default::default() });
        }
        Some(SseFrame {
            event: self.event.take(),
            data: std::mem::take(&mut self.data).join("\n"),
            id: self.last_id.clone(),
            comment: false,
        })
    }
}
