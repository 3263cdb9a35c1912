// src/entity.rs
//
// Entity contract and lifecycle states
//
// RULES:
// - Entities are plain serde records; the library never inspects payloads
// - The key is declared by the entity, not discovered by reflection
// - Lifecycle states belong to the tracking context, not to the entity

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::key::{CompositeKey, EntityKey};

/// A persistable record type.
///
/// `SET` names the record set the entity lives in (the analog of a table
/// name). `Key` is a single [`crate::key::KeyComponent`] or a tuple of 2-4
/// of them; `key()` must return the same value for the lifetime of the
/// record.
pub trait Entity: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Name of the record set this entity belongs to.
    const SET: &'static str;

    /// The typed key shape, one to four ordered components.
    type Key: EntityKey;

    /// The identifying key of this instance.
    fn key(&self) -> Self::Key;

    /// Named relationship paths available to eager-fetching queries.
    fn navigations() -> &'static [Navigation<Self>] {
        &[]
    }
}

/// Lifecycle state of a tracked entity, mirroring the states of the wrapped
/// persistence context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    /// Not known to the context.
    Detached,
    /// Tracked and identical to the stored record.
    Unchanged,
    /// Staged for insertion at the next commit.
    Added,
    /// Staged for an update at the next commit.
    Modified,
    /// Staged for removal at the next commit.
    Deleted,
}

/// A named relationship path from one entity to a record in another set.
///
/// `key_of` extracts the related record's key from an instance; `None` means
/// the relationship is absent for that instance.
pub struct Navigation<E> {
    pub name: &'static str,
    pub target_set: &'static str,
    pub key_of: fn(&E) -> Option<CompositeKey>,
}
