//! # Persistence Module - Durable Outbox
//!
//! The outbox is the single source of truth for outbound events. Producers
//! insert rows, the dispatch loop claims and finalizes them, and nothing here
//! ever waits on the broker.
//!
//! ## Row Lifecycle
//!
//! ```text
//! enqueue ──► pending ──claim──► processing ──mark_sent──► sent (terminal)
//!                ▲                    │
//!                └──────release───────┘
//!                └──reset_stale_processing (restart / timeout)
//! ```
//!
//! ## Key Abstractions
//! - [`OutboxStore`]: the storage contract used by the dispatch loop and the supervisor
//! - [`sqlite_outbox::SqliteOutbox`]: SQLite implementation with versioned migrations
//! - [`PendingMessage`] / [`ExtraInfo`]: a row and its JSON side-channel
//! - [`Payload`]: producer-facing payload that serializes on enqueue
//!
//! ## Blocking I/O
//! The store API is synchronous. Async callers go through [`run_blocking`],
//! which moves the call onto tokio's blocking pool.

mod schema;
pub mod sqlite_outbox;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

pub use sqlite_outbox::SqliteOutbox;

/// Payload handed to [`OutboxStore::enqueue`].
///
/// Text and bytes pass through untouched, anything else is JSON-encoded.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Text(String),
    Bytes(Vec<u8>),
    Json(serde_json::Value),
}

impl Payload {
    /// Wraps any serializable value as a JSON payload.
    pub fn json<T: Serialize>(value: &T) -> Result<Self, OutboxError> {
        Ok(Payload::Json(serde_json::to_value(value)?))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, OutboxError> {
        match self {
            Payload::Text(text) => Ok(text.as_bytes().to_vec()),
            Payload::Bytes(bytes) => Ok(bytes.clone()),
            Payload::Json(value) => Ok(serde_json::to_vec(value)?),
        }
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Payload::Text(value)
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Payload::Text(value.to_string())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        Payload::Bytes(value)
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Payload::Json(value)
    }
}

/// JSON side-channel stored in the `extra_info` column.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtraInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stored_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub processing: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_started: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
}

impl ExtraInfo {
    pub fn stored(at: DateTime<Utc>) -> Self {
        Self {
            stored_at: Some(at),
            ..Default::default()
        }
    }

    pub fn parse(raw: &str) -> Result<Self, OutboxError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn encode(&self) -> Result<String, OutboxError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// One durable unit of work.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMessage {
    pub id: i64,
    pub topic: String,
    pub payload: Vec<u8>,
    pub timestamp: DateTime<Utc>,
    pub sent: bool,
    pub retry_count: u32,
    /// Broker connectivity observed by the producer at enqueue time.
    pub connection_state: bool,
    pub extra_info: ExtraInfo,
}

impl PendingMessage {
    pub fn is_processing(&self) -> bool {
        self.extra_info.processing
    }
}

/// Errors raised by outbox storage.
#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Message not found: {0}")]
    NotFound(i64),

    #[error("Topic must not be empty")]
    EmptyTopic,

    #[error("Outbox lock poisoned during {0}")]
    LockPoisoned(&'static str),

    #[error("Blocking task failed: {0}")]
    Task(String),
}

/// Storage contract for the durable outbox.
///
/// Implementations must make [`claim_pending`](OutboxStore::claim_pending)
/// atomic: two concurrent callers never receive the same row.
pub trait OutboxStore: Send + Sync {
    /// Inserts a new pending message and returns its ID.
    fn enqueue(
        &self,
        topic: &str,
        payload: &Payload,
        connection_state: bool,
    ) -> Result<i64, OutboxError>;

    /// Claims up to `limit` pending, unclaimed messages in ID order.
    fn claim_pending(&self, limit: usize) -> Result<Vec<PendingMessage>, OutboxError>;

    /// Finalizes a message. Calling it on an already sent message is a no-op.
    fn mark_sent(&self, id: i64) -> Result<(), OutboxError>;

    /// Returns a claimed message to the pending pool and counts the attempt.
    fn release(&self, id: i64) -> Result<(), OutboxError>;

    /// Clears `processing` on claims older than `older_than`, or on every
    /// claim when `None`. Returns the number of rows reset.
    fn reset_stale_processing(&self, older_than: Option<Duration>) -> Result<usize, OutboxError>;

    fn count_pending(&self) -> Result<usize, OutboxError>;

    /// Whether any pending message was created more than `age` ago.
    fn has_old_pending(&self, age: Duration) -> Result<bool, OutboxError>;

    fn get(&self, id: i64) -> Result<Option<PendingMessage>, OutboxError>;
}

/// Runs a store operation on the blocking pool.
///
/// A panic inside `op` surfaces as [`OutboxError::Task`].
pub async fn run_blocking<F, R>(store: &Arc<dyn OutboxStore>, op: F) -> Result<R, OutboxError>
where
    F: FnOnce(&dyn OutboxStore) -> Result<R, OutboxError> + Send + 'static,
    R: Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || op(store.as_ref()))
        .await
        .map_err(|e| OutboxError::Task(e.to_string()))?
}
