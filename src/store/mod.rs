// src/store/mod.rs
//
// Store seam
//
// RULES:
// - Stores are DUMB record holders keyed by (set, composite key)
// - Batches are atomic: a failed op leaves the store untouched
// - Token checks live here; translation to the public error lives in the
//   unit of work

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

use crate::key::CompositeKey;

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::{default_database_path, SqliteStore, SqliteStoreConfig};

/// Backend failures. `TokenMismatch` is the optimistic-concurrency signal;
/// everything else is a general persistence failure.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Backend(#[from] rusqlite::Error),

    #[error("pool error: {0}")]
    Pool(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("duplicate key {key} in set `{set}`")]
    DuplicateKey { set: String, key: CompositeKey },

    #[error(
        "stale token for key {key} in set `{set}`: expected {expected:?}, found {found:?}"
    )]
    TokenMismatch {
        set: String,
        key: CompositeKey,
        expected: Option<i64>,
        found: Option<i64>,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<r2d2::Error> for StoreError {
    fn from(err: r2d2::Error) -> Self {
        StoreError::Pool(err.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// One stored record: payload plus the token the store will check on the
/// next write.
#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub key: CompositeKey,
    pub payload: Value,
    pub token: i64,
    pub updated_at: DateTime<Utc>,
}

/// One pending write. `expected` is the token observed when the record was
/// loaded; `None` means the write is unchecked (the record was attached
/// without being loaded first).
#[derive(Debug, Clone)]
pub enum WriteOp {
    Insert {
        set: String,
        key: CompositeKey,
        payload: Value,
    },
    Update {
        set: String,
        key: CompositeKey,
        payload: Value,
        expected: Option<i64>,
    },
    Delete {
        set: String,
        key: CompositeKey,
        expected: Option<i64>,
    },
}

impl WriteOp {
    pub fn set(&self) -> &str {
        match self {
            WriteOp::Insert { set, .. }
            | WriteOp::Update { set, .. }
            | WriteOp::Delete { set, .. } => set,
        }
    }

    pub fn key(&self) -> &CompositeKey {
        match self {
            WriteOp::Insert { key, .. }
            | WriteOp::Update { key, .. }
            | WriteOp::Delete { key, .. } => key,
        }
    }
}

/// Outcome of one applied write. `token` carries the record's new token, or
/// `None` for a delete.
#[derive(Debug, Clone)]
pub struct Applied {
    pub set: String,
    pub key: CompositeKey,
    pub token: Option<i64>,
}

/// The persistence backend consumed by contexts and queries.
///
/// Reads of an unknown set behave as reads of an empty set. Writes create
/// sets on demand. `apply` is all-or-nothing.
#[cfg_attr(test, mockall::automock)]
pub trait Store: Send + Sync + 'static {
    /// Fetches one record by key.
    fn get(&self, set: &str, key: &CompositeKey) -> StoreResult<Option<StoredRecord>>;

    /// Returns every record of the set, ordered by key.
    fn scan(&self, set: &str) -> StoreResult<Vec<StoredRecord>>;

    /// True when a record with the given key exists.
    fn contains(&self, set: &str, key: &CompositeKey) -> StoreResult<bool>;

    /// Number of records in the set.
    fn count(&self, set: &str) -> StoreResult<u64>;

    /// Applies a batch of writes atomically. Tokens start at 1 on insert and
    /// increment on every update; a checked write whose expected token does
    /// not match the stored one (or whose record is gone) fails with
    /// [`StoreError::TokenMismatch`].
    fn apply(&self, ops: Vec<WriteOp>) -> StoreResult<Vec<Applied>>;
}

// Lets several units of work share one backend: each wraps its own handle
// to the same underlying store.
impl<S: Store + ?Sized> Store for std::sync::Arc<S> {
    fn get(&self, set: &str, key: &CompositeKey) -> StoreResult<Option<StoredRecord>> {
        (**self).get(set, key)
    }

    fn scan(&self, set: &str) -> StoreResult<Vec<StoredRecord>> {
        (**self).scan(set)
    }

    fn contains(&self, set: &str, key: &CompositeKey) -> StoreResult<bool> {
        (**self).contains(set, key)
    }

    fn count(&self, set: &str) -> StoreResult<u64> {
        (**self).count(set)
    }

    fn apply(&self, ops: Vec<WriteOp>) -> StoreResult<Vec<Applied>> {
        (**self).apply(ops)
    }
}
