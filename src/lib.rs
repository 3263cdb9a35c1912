// src/lib.rs
// Depot - Unit-of-work and repository layer over embedded document stores
//
// Architecture:
// - Store seam: backends hold records, check tokens, apply atomic batches
// - Context: identity map + pending change set, shared by reference
// - Repository/Query: thin typed facades forwarding to context and store
// - Unit of work: scope lifecycle, commit, error translation, disposal
// - Explicit: no implicit behavior, no hidden I/O before a terminal call

pub mod areas;
pub mod context;
pub mod entity;
pub mod error;
pub mod key;
pub mod query;
pub mod repository;
pub mod store;
pub mod uow;

// ============================================================================
// PUBLIC API
// ============================================================================

pub use areas::{LogicalArea, WorkArea};
pub use context::{DataContext, ExecPolicy};
pub use entity::{Entity, EntityState, Navigation};
pub use error::{Error, Result};
pub use key::{
    validate_parts, CompositeKey, EntityKey, KeyComponent, KeyError, KeyKind, KeyPart,
    MAX_KEY_ARITY,
};
pub use query::{Average, Numeric, Query};
pub use repository::Repository;
pub use store::{
    default_database_path, Applied, MemoryStore, SqliteStore, SqliteStoreConfig, Store,
    StoreError, StoreResult, StoredRecord, WriteOp,
};
pub use uow::{ScopeState, UnitOfWork};
