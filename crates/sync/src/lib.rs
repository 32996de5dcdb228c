//! postdeck sync: protects in-flight local edits from server echoes, drives the
//! inline edit state machine and wires stream, cache and writes into one
//! event loop.

#![forbid(unsafe_code)]

pub mod config;
pub mod context;
pub mod edit;
pub mod engine;
pub mod notice;
pub mod protection;
pub mod task;

pub use config::{ConfigError, SyncConfig};
pub use context::{CoordinationContext, LatencySampler, NetworkQuality};
pub use edit::{
    EditError, EditKey, EditPhase, ExternalDisposition, InlineEditController, PendingEdit, Resolution, RetryPolicy,
    SaveDecision, WriteTicket,
};
pub use engine::{SyncEngine, SyncUpdate};
pub use notice::{Notice, NoticeKind};
pub use protection::{ProtectionRegistry, SuppressReason};
pub use task::ScheduledTask;
