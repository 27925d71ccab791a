//! Persistent storage behind one adapter interface.
//!
//! ```text
//! ┌──────────────┐   append / query   ┌──────────────────┐
//! │ Coordinator  │ ─────────────────► │  StorageAdapter  │
//! └──────────────┘                    └────────┬─────────┘
//!                                    ┌─────────┴─────────┐
//!                                    ▼                   ▼
//!                            ┌──────────────┐   ┌────────────────┐
//!                            │ MemoryStorage│   │ Relational     │
//!                            │ (per-process)│   │ (Postgres/sqlx)│
//!                            └──────────────┘   └────────────────┘
//! ```
//!
//! Deltas are opaque: the hub stores payloads and vector clocks, never
//! content. Append is idempotent by delta id; per-document ordering is
//! append order. Within one node, append-then-read is read-your-writes.

pub mod memory;
pub mod relational;

use async_trait::async_trait;
use serde_json::Value;

use crate::clock::VectorClock;

pub use memory::MemoryStorage;
pub use relational::RelationalStorage;

/// A delta as persisted: opaque payload plus clock bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDelta {
    /// Sender-unique id; the idempotency key.
    pub id: String,
    pub document_id: String,
    pub origin_client_id: String,
    pub vector_clock: VectorClock,
    pub payload: Value,
    /// Unix milliseconds, informational.
    pub timestamp: i64,
}

/// Document metadata. The clock equals the pointwise max over all the
/// document's delta clocks.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentRecord {
    pub id: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub vector_clock: VectorClock,
}

/// Session metadata written at authentication and refreshed while the
/// connection lives.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    pub id: String,
    pub user_id: String,
    pub client_id: String,
    pub connected_at: i64,
    pub last_seen: i64,
    pub metadata: Value,
}

/// Age cutoffs for [`StorageAdapter::cleanup`], as absolute Unix
/// milliseconds. `None` skips that table.
#[derive(Debug, Clone, Copy, Default)]
pub struct CleanupOptions {
    pub deltas_before: Option<i64>,
    pub sessions_before: Option<i64>,
}

/// Rows removed by a cleanup pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub deltas_removed: u64,
    pub sessions_removed: u64,
}

/// Storage faults.
#[derive(Debug, Clone)]
pub enum StorageError {
    /// Backend unreachable or connection refused.
    Connection(String),
    /// Query or statement failure.
    Query(String),
    /// Stored bytes did not decode.
    Corrupt(String),
    /// Startup schema validation failed.
    SchemaMismatch(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Connection(e) => write!(f, "Storage connection error: {e}"),
            StorageError::Query(e) => write!(f, "Storage query error: {e}"),
            StorageError::Corrupt(e) => write!(f, "Corrupt stored value: {e}"),
            StorageError::SchemaMismatch(e) => write!(f, "Schema mismatch: {e}"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<sqlx::Error> for StorageError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                StorageError::Connection(e.to_string())
            }
            other => StorageError::Query(other.to_string()),
        }
    }
}

/// Uniform async storage interface. The coordinator treats adapters as
/// thread-safe; each adapter owns its internal concurrency.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Fetch a document, creating it with an empty clock when absent.
    async fn get_or_create_document(
        &self,
        document_id: &str,
    ) -> Result<DocumentRecord, StorageError>;

    /// Fetch without creating. `sync_request` on an unknown document
    /// must not bring it into existence.
    async fn get_document(
        &self,
        document_id: &str,
    ) -> Result<Option<DocumentRecord>, StorageError>;

    /// Append a delta and merge its clock into the document clock.
    ///
    /// Idempotent by `delta.id`: re-appending returns `Ok(false)` and
    /// changes nothing.
    async fn append_delta(
        &self,
        document_id: &str,
        delta: StoredDelta,
    ) -> Result<bool, StorageError>;

    /// Deltas the presenting client has not observed: every stored
    /// delta whose clock is neither dominated by nor equal to `since`,
    /// in append order. `None` returns everything.
    async fn get_deltas_since(
        &self,
        document_id: &str,
        since: Option<&VectorClock>,
    ) -> Result<Vec<StoredDelta>, StorageError>;

    /// The document clock; empty for unknown documents.
    async fn get_document_clock(
        &self,
        document_id: &str,
    ) -> Result<VectorClock, StorageError>;

    async fn count_documents(&self) -> Result<u64, StorageError>;

    async fn save_session(&self, session: SessionRecord) -> Result<(), StorageError>;

    async fn update_session_last_seen(
        &self,
        session_id: &str,
        last_seen: i64,
    ) -> Result<(), StorageError>;

    async fn get_sessions_by_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<SessionRecord>, StorageError>;

    /// Remove sessions whose `last_seen` is before `cutoff`. Returns
    /// how many were removed.
    async fn delete_sessions_older_than(&self, cutoff: i64) -> Result<u64, StorageError>;

    /// Age-based GC for deltas and sessions.
    async fn cleanup(&self, options: CleanupOptions) -> Result<CleanupReport, StorageError>;

    async fn health_check(&self) -> Result<(), StorageError>;
}
