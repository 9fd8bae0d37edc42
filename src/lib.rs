//! Resumable, deduplicating, chunked file-upload engine.
//!
//! Files are split into content-addressed chunks, checked against the
//! server for existing data ("instant upload"), uploaded under bounded
//! two-level concurrency with retry/backoff, then merged server-side.
//! Progress survives restarts through a persisted per-transfer record.

pub mod api;
pub mod config;
pub mod dedup;
pub mod hasher;
pub mod models;
pub mod planner;
pub mod progress;
pub mod rate;
pub mod retry;
pub mod scheduler;
pub mod source;
pub mod store;

/// Convenient re-exports of the types most callers wire together.
pub mod prelude {
    pub use crate::api::{HttpTransferApi, TransferApi};
    pub use crate::config::UploaderConfig;
    pub use crate::models::{FailureKind, TaskId, TaskStatus, TransferTask};
    pub use crate::rate::TransferLimits;
    pub use crate::retry::RetryPolicy;
    pub use crate::scheduler::Scheduler;
    pub use crate::source::{BlobSource, FileBlob, MemoryBlob};
    pub use crate::store::{KeyValueStore, MemoryStore, SqliteStore};
}
