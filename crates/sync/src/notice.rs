//! User-visible notices (toasts) emitted by the engine.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NoticeKind {
    Info,
    Success,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub kind: NoticeKind,
    pub text: String,
    /// Suggested display time; every notice is dismissible.
    pub duration_ms: u64,
}

impl Notice {
    pub fn new(kind: NoticeKind, text: impl Into<String>) -> Self {
        let duration_ms = match kind {
            NoticeKind::Error => 5000,
            NoticeKind::Warn => 4000,
            _ => 3000,
        };
        Self { kind, text: text.into(), duration_ms }
    }

    pub fn info(text: impl Into<String>) -> Self { Self::new(NoticeKind::Info, text) }

    pub fn warn(text: impl Into<String>) -> Self { Self::new(NoticeKind::Warn, text) }

    pub fn error(text: impl Into<String>) -> Self { Self::new(NoticeKind::Error, text) }
}
