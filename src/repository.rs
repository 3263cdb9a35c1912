// src/repository.rs
//
// Generic repository
//
// CRITICAL RULES:
// - Repositories are thin forwarders to the shared context
// - They never own the context, only reference it
// - Writes stage state transitions; nothing reaches the store before commit
// - Positional key lookups are validated before any persistence interaction

use std::marker::PhantomData;
use std::sync::Arc;

use crate::context::DataContext;
use crate::entity::Entity;
use crate::error::Result;
use crate::key::{validate_parts, EntityKey, KeyPart};
use crate::query::Query;

/// A collection-like facade over the persisted entities of one type.
///
/// All instances built from the same unit of work share one
/// [`DataContext`]; the facade itself is cheap to construct and clone.
pub struct Repository<E: Entity> {
    ctx: Arc<DataContext>,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> Clone for Repository<E> {
    fn clone(&self) -> Self {
        Self {
            ctx: Arc::clone(&self.ctx),
            _entity: PhantomData,
        }
    }
}

impl<E: Entity> Repository<E> {
    pub fn new(ctx: Arc<DataContext>) -> Self {
        Self {
            ctx,
            _entity: PhantomData,
        }
    }

    // ------------------------------------------------------------------
    // Keyed reads
    // ------------------------------------------------------------------

    /// Fetches the entity with the given key, or `None`. The identity map
    /// is consulted before the store.
    pub fn get_by_id(&self, key: &E::Key) -> Result<Option<E>> {
        self.ctx.find::<E>(&key.encode())
    }

    /// Async form of [`Repository::get_by_id`].
    pub async fn get_by_id_async(&self, key: &E::Key) -> Result<Option<E>> {
        self.ctx.find_async::<E>(&key.encode()).await
    }

    /// Positional form of [`Repository::get_by_id`]: the supplied parts are
    /// validated against the entity's declared key shape first.
    pub fn get_by_parts(&self, parts: &[KeyPart]) -> Result<Option<E>> {
        let key = validate_parts::<E::Key>(parts)?;
        self.ctx.find::<E>(&key)
    }

    /// Async form of [`Repository::get_by_parts`].
    pub async fn get_by_parts_async(&self, parts: &[KeyPart]) -> Result<Option<E>> {
        let key = validate_parts::<E::Key>(parts)?;
        self.ctx.find_async::<E>(&key).await
    }

    /// True when a committed record with the given key exists. Pending
    /// (uncommitted) changes are not considered.
    pub fn exists(&self, key: &E::Key) -> Result<bool> {
        let store = self.ctx.store_handle()?;
        Ok(store.contains(E::SET, &key.encode())?)
    }

    /// Async form of [`Repository::exists`].
    pub async fn exists_async(&self, key: &E::Key) -> Result<bool> {
        let key = key.encode();
        self.ctx
            .run_store(move |store| store.contains(E::SET, &key))
            .await
    }

    /// Positional form of [`Repository::exists`].
    pub fn exists_parts(&self, parts: &[KeyPart]) -> Result<bool> {
        let key = validate_parts::<E::Key>(parts)?;
        let store = self.ctx.store_handle()?;
        Ok(store.contains(E::SET, &key)?)
    }

    // ------------------------------------------------------------------
    // Staged writes
    // ------------------------------------------------------------------

    /// Stages the entity for insertion at the next commit.
    pub fn add(&self, entity: &E) -> Result<()> {
        self.ctx.stage_insert(entity)
    }

    /// Stages every entity for insertion at the next commit.
    pub fn add_many(&self, entities: &[E]) -> Result<()> {
        for entity in entities {
            self.ctx.stage_insert(entity)?;
        }
        Ok(())
    }

    /// Async form of [`Repository::add`]. Staging is in-memory, so this
    /// completes immediately.
    pub async fn add_async(&self, entity: &E) -> Result<()> {
        self.add(entity)
    }

    /// Async form of [`Repository::add_many`].
    pub async fn add_many_async(&self, entities: &[E]) -> Result<()> {
        self.add_many(entities)
    }

    /// Stages the entity for an update at the next commit; an untracked
    /// entity is attached first. An entity already staged for insertion
    /// stays staged for insertion.
    pub fn update(&self, entity: &E) -> Result<()> {
        self.ctx.stage_update(entity)
    }

    /// Stages every entity for an update at the next commit.
    pub fn update_many(&self, entities: &[E]) -> Result<()> {
        for entity in entities {
            self.ctx.stage_update(entity)?;
        }
        Ok(())
    }

    /// Async form of [`Repository::update`].
    pub async fn update_async(&self, entity: &E) -> Result<()> {
        self.update(entity)
    }

    /// Async form of [`Repository::update_many`].
    pub async fn update_many_async(&self, entities: &[E]) -> Result<()> {
        self.update_many(entities)
    }

    /// Stages the entity for removal at the next commit; an untracked
    /// entity is attached, then removed.
    pub fn delete(&self, entity: &E) -> Result<()> {
        self.ctx.stage_delete(entity)
    }

    /// Stages every entity for removal at the next commit.
    pub fn delete_many(&self, entities: &[E]) -> Result<()> {
        for entity in entities {
            self.ctx.stage_delete(entity)?;
        }
        Ok(())
    }

    /// Async form of [`Repository::delete`].
    pub async fn delete_async(&self, entity: &E) -> Result<()> {
        self.delete(entity)
    }

    /// Async form of [`Repository::delete_many`].
    pub async fn delete_many_async(&self, entities: &[E]) -> Result<()> {
        self.delete_many(entities)
    }

    // ------------------------------------------------------------------
    // Totals and queries
    // ------------------------------------------------------------------

    /// Number of committed records in the set.
    pub fn total(&self) -> Result<u64> {
        let store = self.ctx.store_handle()?;
        Ok(store.count(E::SET)?)
    }

    /// Async form of [`Repository::total`].
    pub async fn total_async(&self) -> Result<u64> {
        self.ctx.run_store(move |store| store.count(E::SET)).await
    }

    /// An unfiltered query over the set.
    pub fn query(&self) -> Query<E> {
        Query::new(Arc::clone(&self.ctx))
    }

    /// A query that eagerly loads the named navigation paths into the
    /// identity map at materialization. Unknown paths are a caller error.
    pub fn query_fetching(&self, paths: &[&str]) -> Result<Query<E>> {
        Query::new(Arc::clone(&self.ctx)).fetching(paths)
    }
}
