// src/query/mod.rs
//
// Typed composable queries
//
// RULES:
// - Queries read committed data; entities staged for insertion are not
//   visible until the unit of work commits
// - Composition is cheap; nothing touches the store before a terminal
//   operation runs
// - Async terminals execute store reads under the context's ExecPolicy

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use crate::context::DataContext;
use crate::entity::{Entity, EntityState, Navigation};
use crate::error::{Error, Result};
use crate::key::{CompositeKey, EntityKey};
use crate::store::StoredRecord;

pub mod aggregate;

pub use aggregate::{Average, Numeric};

/// A composable read over one record set, with sync and async terminal
/// operations.
///
/// Filters are applied in the order they were added. `*_or_default`
/// terminals return `None` for an empty result where their plain
/// counterparts fail with [`Error::NoElement`].
pub struct Query<E: Entity> {
    ctx: Arc<DataContext>,
    key: Option<CompositeKey>,
    filters: Vec<Arc<dyn Fn(&E) -> bool + Send + Sync>>,
    fetch: Vec<&'static str>,
}

impl<E: Entity> std::fmt::Debug for Query<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("key", &self.key)
            .field("filters", &self.filters.len())
            .field("fetch", &self.fetch)
            .finish()
    }
}

impl<E: Entity> Clone for Query<E> {
    fn clone(&self) -> Self {
        Self {
            ctx: Arc::clone(&self.ctx),
            key: self.key.clone(),
            filters: self.filters.clone(),
            fetch: self.fetch.clone(),
        }
    }
}

impl<E: Entity> Query<E> {
    pub(crate) fn new(ctx: Arc<DataContext>) -> Self {
        Self {
            ctx,
            key: None,
            filters: Vec::new(),
            fetch: Vec::new(),
        }
    }

    // ------------------------------------------------------------------
    // Composition
    // ------------------------------------------------------------------

    /// Adds a predicate; rows failing it are dropped at materialization.
    pub fn filter(mut self, predicate: impl Fn(&E) -> bool + Send + Sync + 'static) -> Self {
        self.filters.push(Arc::new(predicate));
        self
    }

    /// Restricts the query to the record with the given key.
    pub fn by_key(mut self, key: &E::Key) -> Self {
        self.key = Some(key.encode());
        self
    }

    /// Declares navigation paths to load eagerly at materialization.
    /// Unknown paths are a caller error.
    pub fn fetching(mut self, paths: &[&str]) -> Result<Self> {
        for path in paths {
            match E::navigations().iter().find(|nav| nav.name == *path) {
                Some(nav) => {
                    if !self.fetch.contains(&nav.name) {
                        self.fetch.push(nav.name);
                    }
                }
                None => {
                    return Err(Error::UnknownFetchPath {
                        set: E::SET,
                        path: (*path).to_string(),
                    })
                }
            }
        }
        Ok(self)
    }

    // ------------------------------------------------------------------
    // Materialization
    // ------------------------------------------------------------------

    fn navs(&self) -> impl Iterator<Item = &'static Navigation<E>> + '_ {
        self.fetch
            .iter()
            .filter_map(|name| E::navigations().iter().find(move |nav| nav.name == *name))
    }

    fn decode_filter(&self, records: Vec<StoredRecord>) -> Result<Vec<E>> {
        let mut rows = Vec::with_capacity(records.len());
        for record in records {
            let entity: E = self.ctx.resolve_loaded(record)?;
            if self.filters.iter().all(|predicate| predicate(&entity)) {
                rows.push(entity);
            }
        }
        Ok(rows)
    }

    fn prefetch_sync(&self, rows: &[E]) -> Result<()> {
        if self.fetch.is_empty() {
            return Ok(());
        }
        let store = self.ctx.store_handle()?;
        for nav in self.navs() {
            for row in rows {
                let Some(key) = (nav.key_of)(row) else {
                    continue;
                };
                if self.ctx.entry_state(nav.target_set, &key) != EntityState::Detached {
                    continue;
                }
                if let Some(record) = store.get(nav.target_set, &key)? {
                    self.ctx.attach_loaded(nav.target_set, &record);
                }
            }
        }
        Ok(())
    }

    async fn prefetch_async(&self, rows: &[E]) -> Result<()> {
        if self.fetch.is_empty() {
            return Ok(());
        }
        for nav in self.navs() {
            for row in rows {
                let Some(key) = (nav.key_of)(row) else {
                    continue;
                };
                if self.ctx.entry_state(nav.target_set, &key) != EntityState::Detached {
                    continue;
                }
                let target = nav.target_set;
                let record = self
                    .ctx
                    .run_store(move |store| store.get(target, &key))
                    .await?;
                if let Some(record) = record {
                    self.ctx.attach_loaded(target, &record);
                }
            }
        }
        Ok(())
    }

    fn fetch_records(&self) -> Result<Vec<StoredRecord>> {
        let store = self.ctx.store_handle()?;
        match &self.key {
            Some(key) => Ok(store.get(E::SET, key)?.into_iter().collect()),
            None => Ok(store.scan(E::SET)?),
        }
    }

    async fn fetch_records_async(&self) -> Result<Vec<StoredRecord>> {
        match &self.key {
            Some(key) => {
                let key = key.clone();
                let record = self
                    .ctx
                    .run_store(move |store| store.get(E::SET, &key))
                    .await?;
                Ok(record.into_iter().collect())
            }
            None => self.ctx.run_store(move |store| store.scan(E::SET)).await,
        }
    }

    /// Materializes the matching rows, in key order.
    pub fn to_vec(&self) -> Result<Vec<E>> {
        let rows = self.decode_filter(self.fetch_records()?)?;
        self.prefetch_sync(&rows)?;
        Ok(rows)
    }

    /// Async form of [`Query::to_vec`].
    pub async fn to_vec_async(&self) -> Result<Vec<E>> {
        let rows = self.decode_filter(self.fetch_records_async().await?)?;
        self.prefetch_async(&rows).await?;
        Ok(rows)
    }

    /// Runs `action` over every matching row.
    pub fn for_each(&self, mut action: impl FnMut(&E)) -> Result<()> {
        for row in self.to_vec()? {
            action(&row);
        }
        Ok(())
    }

    /// Async form of [`Query::for_each`].
    pub async fn for_each_async(&self, mut action: impl FnMut(&E)) -> Result<()> {
        for row in self.to_vec_async().await? {
            action(&row);
        }
        Ok(())
    }

    /// Materializes into a map keyed by `key_fn`. Later rows overwrite
    /// earlier ones when `key_fn` collides.
    pub fn to_map<K: Eq + Hash>(&self, key_fn: impl Fn(&E) -> K) -> Result<HashMap<K, E>> {
        let rows = self.to_vec()?;
        let mut map = HashMap::with_capacity(rows.len());
        for row in rows {
            map.insert(key_fn(&row), row);
        }
        Ok(map)
    }

    /// Async form of [`Query::to_map`].
    pub async fn to_map_async<K: Eq + Hash>(
        &self,
        key_fn: impl Fn(&E) -> K,
    ) -> Result<HashMap<K, E>> {
        let rows = self.to_vec_async().await?;
        let mut map = HashMap::with_capacity(rows.len());
        for row in rows {
            map.insert(key_fn(&row), row);
        }
        Ok(map)
    }

    // ------------------------------------------------------------------
    // Count / existence
    // ------------------------------------------------------------------

    /// Number of matching rows. Delegates to the store when no predicate is
    /// attached.
    pub fn count(&self) -> Result<u64> {
        if self.filters.is_empty() {
            let store = self.ctx.store_handle()?;
            return match &self.key {
                Some(key) => Ok(u64::from(store.contains(E::SET, key)?)),
                None => Ok(store.count(E::SET)?),
            };
        }
        Ok(self.to_vec()?.len() as u64)
    }

    /// Async form of [`Query::count`].
    pub async fn count_async(&self) -> Result<u64> {
        if self.filters.is_empty() {
            return match &self.key {
                Some(key) => {
                    let key = key.clone();
                    let hit = self
                        .ctx
                        .run_store(move |store| store.contains(E::SET, &key))
                        .await?;
                    Ok(u64::from(hit))
                }
                None => self.ctx.run_store(move |store| store.count(E::SET)).await,
            };
        }
        Ok(self.to_vec_async().await?.len() as u64)
    }

    /// True when at least one row matches.
    pub fn any(&self) -> Result<bool> {
        Ok(self.count()? > 0)
    }

    /// Async form of [`Query::any`].
    pub async fn any_async(&self) -> Result<bool> {
        Ok(self.count_async().await? > 0)
    }

    /// True when at least one row matches the extra predicate.
    pub fn any_where(&self, predicate: impl Fn(&E) -> bool) -> Result<bool> {
        Ok(self.to_vec()?.iter().any(|row| predicate(row)))
    }

    /// Async form of [`Query::any_where`].
    pub async fn any_where_async(&self, predicate: impl Fn(&E) -> bool) -> Result<bool> {
        Ok(self.to_vec_async().await?.iter().any(|row| predicate(row)))
    }

    // ------------------------------------------------------------------
    // Element operations
    // ------------------------------------------------------------------

    /// First matching row, or [`Error::NoElement`].
    pub fn first(&self) -> Result<E> {
        first_of(self.to_vec()?)
    }

    /// Async form of [`Query::first`].
    pub async fn first_async(&self) -> Result<E> {
        first_of(self.to_vec_async().await?)
    }

    /// First matching row, or `None`.
    pub fn first_or_default(&self) -> Result<Option<E>> {
        Ok(self.to_vec()?.into_iter().next())
    }

    /// Async form of [`Query::first_or_default`].
    pub async fn first_or_default_async(&self) -> Result<Option<E>> {
        Ok(self.to_vec_async().await?.into_iter().next())
    }

    /// First row matching the extra predicate, or [`Error::NoElement`].
    pub fn first_where(&self, predicate: impl Fn(&E) -> bool) -> Result<E> {
        first_of(retain(self.to_vec()?, predicate))
    }

    /// Async form of [`Query::first_where`].
    pub async fn first_where_async(&self, predicate: impl Fn(&E) -> bool) -> Result<E> {
        first_of(retain(self.to_vec_async().await?, predicate))
    }

    /// Last matching row, or [`Error::NoElement`].
    pub fn last(&self) -> Result<E> {
        last_of(self.to_vec()?)
    }

    /// Async form of [`Query::last`].
    pub async fn last_async(&self) -> Result<E> {
        last_of(self.to_vec_async().await?)
    }

    /// Last matching row, or `None`.
    pub fn last_or_default(&self) -> Result<Option<E>> {
        Ok(self.to_vec()?.pop())
    }

    /// Async form of [`Query::last_or_default`].
    pub async fn last_or_default_async(&self) -> Result<Option<E>> {
        Ok(self.to_vec_async().await?.pop())
    }

    /// Last row matching the extra predicate, or [`Error::NoElement`].
    pub fn last_where(&self, predicate: impl Fn(&E) -> bool) -> Result<E> {
        last_of(retain(self.to_vec()?, predicate))
    }

    /// Async form of [`Query::last_where`].
    pub async fn last_where_async(&self, predicate: impl Fn(&E) -> bool) -> Result<E> {
        last_of(retain(self.to_vec_async().await?, predicate))
    }

    /// The only matching row. Fails with [`Error::NoElement`] on an empty
    /// result and [`Error::MultipleElements`] on more than one.
    pub fn single(&self) -> Result<E> {
        single_of(self.to_vec()?)
    }

    /// Async form of [`Query::single`].
    pub async fn single_async(&self) -> Result<E> {
        single_of(self.to_vec_async().await?)
    }

    /// The only matching row, or `None` when empty. Still fails with
    /// [`Error::MultipleElements`] on more than one match.
    pub fn single_or_default(&self) -> Result<Option<E>> {
        single_opt_of(self.to_vec()?)
    }

    /// Async form of [`Query::single_or_default`].
    pub async fn single_or_default_async(&self) -> Result<Option<E>> {
        single_opt_of(self.to_vec_async().await?)
    }

    /// The only row matching the extra predicate.
    pub fn single_where(&self, predicate: impl Fn(&E) -> bool) -> Result<E> {
        single_of(retain(self.to_vec()?, predicate))
    }

    /// Async form of [`Query::single_where`].
    pub async fn single_where_async(&self, predicate: impl Fn(&E) -> bool) -> Result<E> {
        single_of(retain(self.to_vec_async().await?, predicate))
    }
}

fn retain<E>(mut rows: Vec<E>, predicate: impl Fn(&E) -> bool) -> Vec<E> {
    rows.retain(|row| predicate(row));
    rows
}

fn first_of<E>(rows: Vec<E>) -> Result<E> {
    rows.into_iter().next().ok_or(Error::NoElement)
}

fn last_of<E>(rows: Vec<E>) -> Result<E> {
    rows.into_iter().next_back().ok_or(Error::NoElement)
}

fn single_of<E>(mut rows: Vec<E>) -> Result<E> {
    match rows.len() {
        0 => Err(Error::NoElement),
        1 => Ok(rows.remove(0)),
        _ => Err(Error::MultipleElements),
    }
}

fn single_opt_of<E>(mut rows: Vec<E>) -> Result<Option<E>> {
    match rows.len() {
        0 => Ok(None),
        1 => Ok(Some(rows.remove(0))),
        _ => Err(Error::MultipleElements),
    }
}
