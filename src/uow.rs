// src/uow.rs
//
// Unit of work
//
// CRITICAL RULES:
// - Exactly one context per unit of work, owned for its whole lifetime
// - Scope lifecycle: Created -> Begun -> {Committed | Failed}; a new scope
//   may begin only after the previous one reached a terminal state
// - Token mismatches surface as Error::Concurrency, everything else a
//   commit raises surfaces as Error::Commit, untouched
// - No retries, no backoff, no partial-failure recovery

use log::{debug, warn};
use std::sync::Arc;

use crate::areas::{LogicalArea, WorkArea};
use crate::context::{DataContext, ExecPolicy};
use crate::entity::Entity;
use crate::error::{Error, Result};
use crate::repository::Repository;
use crate::store::{Store, StoreError};

/// Lifecycle of one unit-of-work scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeState {
    Created,
    Begun,
    Committed,
    Failed,
}

/// A scope that batches staged persistence operations and commits them as
/// one atomic flush.
///
/// The unit of work owns its [`DataContext`] and is the only place where
/// store failures get translated: a stale concurrency token becomes
/// [`Error::Concurrency`], any other flush failure becomes
/// [`Error::Commit`].
pub struct UnitOfWork<S: Store> {
    store: Option<Arc<S>>,
    ctx: Arc<DataContext>,
    scope: ScopeState,
}

impl<S: Store> UnitOfWork<S> {
    /// Wraps a store with the default execution policy.
    pub fn new(store: S) -> Self {
        Self::with_policy(store, ExecPolicy::default())
    }

    /// Wraps a store, executing async store work under `policy`.
    pub fn with_policy(store: S, policy: ExecPolicy) -> Self {
        let store = Arc::new(store);
        let ctx = Arc::new(DataContext::new(
            Arc::clone(&store) as Arc<dyn Store>,
            policy,
        ));
        Self {
            store: Some(store),
            ctx,
            scope: ScopeState::Created,
        }
    }

    /// The typed store handle, or [`Error::Disposed`] after disposal.
    pub fn store(&self) -> Result<&Arc<S>> {
        self.store.as_ref().ok_or(Error::Disposed)
    }

    /// The shared persistence context.
    pub fn context(&self) -> &Arc<DataContext> {
        &self.ctx
    }

    /// Current scope state.
    pub fn scope(&self) -> ScopeState {
        self.scope
    }

    /// A repository for `E` backed by this unit of work's context.
    pub fn repository<E: Entity>(&self) -> Repository<E> {
        Repository::new(Arc::clone(&self.ctx))
    }

    /// A named work area sharing this unit of work's context.
    pub fn work_area(&self, name: impl Into<String>) -> WorkArea {
        WorkArea::new(name, Arc::clone(&self.ctx))
    }

    /// A named logical area sharing this unit of work's context.
    pub fn logical_area(&self, name: impl Into<String>) -> LogicalArea {
        LogicalArea::new(name, Arc::clone(&self.ctx))
    }

    /// Opens a scope. Fails while a scope is already open; permitted again
    /// once the previous scope committed or failed.
    pub fn begin(&mut self) -> Result<()> {
        self.store()?;
        match self.scope {
            ScopeState::Begun => Err(Error::Scope("scope already begun")),
            _ => {
                self.scope = ScopeState::Begun;
                Ok(())
            }
        }
    }

    /// Flushes the pending change set. On success the scope is
    /// `Committed`; on failure it is `Failed` and the error is translated
    /// per the commit policy.
    pub fn commit(&mut self) -> Result<()> {
        if self.scope != ScopeState::Begun {
            return Err(Error::Scope("commit requires a begun scope"));
        }

        let plan = self.ctx.flush_plan()?;
        if plan.is_empty() {
            self.scope = ScopeState::Committed;
            return Ok(());
        }

        let store = self.ctx.store_handle()?;
        let pending = plan.len();
        match store.apply(plan) {
            Ok(applied) => {
                self.ctx.complete_flush(&applied);
                self.scope = ScopeState::Committed;
                debug!("committed {} staged change(s)", pending);
                Ok(())
            }
            Err(err) => {
                self.scope = ScopeState::Failed;
                Err(translate_commit_error(err))
            }
        }
    }

    /// Async form of [`UnitOfWork::commit`]; the flush runs under the
    /// configured [`ExecPolicy`].
    pub async fn commit_async(&mut self) -> Result<()> {
        if self.scope != ScopeState::Begun {
            return Err(Error::Scope("commit requires a begun scope"));
        }

        let plan = self.ctx.flush_plan()?;
        if plan.is_empty() {
            self.scope = ScopeState::Committed;
            return Ok(());
        }

        let pending = plan.len();
        let outcome = self.ctx.run_raw(move |store| store.apply(plan)).await?;
        match outcome {
            Ok(applied) => {
                self.ctx.complete_flush(&applied);
                self.scope = ScopeState::Committed;
                debug!("committed {} staged change(s)", pending);
                Ok(())
            }
            Err(err) => {
                self.scope = ScopeState::Failed;
                Err(translate_commit_error(err))
            }
        }
    }

    /// Releases the context exactly once: tracked state is evicted and the
    /// store handles are dropped. Safe to call repeatedly; every operation
    /// afterwards fails with [`Error::Disposed`].
    pub fn dispose(&mut self) {
        if self.store.take().is_some() {
            self.ctx.release();
        }
    }
}

impl<S: Store> Drop for UnitOfWork<S> {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn translate_commit_error(err: StoreError) -> Error {
    match err {
        StoreError::TokenMismatch { .. } => {
            warn!("commit hit a concurrency conflict: {}", err);
            Error::Concurrency(err)
        }
        other => Error::Commit(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{CompositeKey, EntityKey};
    use crate::store::{MemoryStore, MockStore, StoreError};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Widget {
        id: i64,
        label: String,
    }

    impl Entity for Widget {
        const SET: &'static str = "widgets";
        type Key = i64;

        fn key(&self) -> i64 {
            self.id
        }
    }

    fn widget(id: i64) -> Widget {
        Widget {
            id,
            label: format!("widget {}", id),
        }
    }

    #[test]
    fn scope_machine_happy_path() {
        let mut uow = UnitOfWork::new(MemoryStore::new());
        assert_eq!(uow.scope(), ScopeState::Created);

        uow.begin().unwrap();
        assert_eq!(uow.scope(), ScopeState::Begun);

        uow.commit().unwrap();
        assert_eq!(uow.scope(), ScopeState::Committed);

        // A new scope may begin after a terminal state.
        uow.begin().unwrap();
        assert_eq!(uow.scope(), ScopeState::Begun);
    }

    #[test]
    fn begin_twice_is_rejected() {
        let mut uow = UnitOfWork::new(MemoryStore::new());
        uow.begin().unwrap();
        assert!(matches!(uow.begin(), Err(Error::Scope(_))));
    }

    #[test]
    fn commit_without_begin_is_rejected() {
        let mut uow = UnitOfWork::new(MemoryStore::new());
        assert!(matches!(uow.commit(), Err(Error::Scope(_))));
    }

    #[test]
    fn token_mismatch_translates_to_concurrency() {
        let mut mock = MockStore::new();
        mock.expect_apply().returning(|_| {
            Err(StoreError::TokenMismatch {
                set: "widgets".to_string(),
                key: 1i64.encode(),
                expected: Some(1),
                found: Some(2),
            })
        });

        let mut uow = UnitOfWork::new(mock);
        uow.begin().unwrap();
        uow.repository::<Widget>().update(&widget(1)).unwrap();

        let err = uow.commit().unwrap_err();
        assert!(matches!(err, Error::Concurrency(_)));
        assert_eq!(uow.scope(), ScopeState::Failed);
    }

    #[test]
    fn other_store_failures_translate_to_commit() {
        let mut mock = MockStore::new();
        mock.expect_apply().returning(|_| {
            Err(StoreError::DuplicateKey {
                set: "widgets".to_string(),
                key: CompositeKey::from_parts(vec![crate::key::KeyPart::Int(1)]).unwrap(),
            })
        });

        let mut uow = UnitOfWork::new(mock);
        uow.begin().unwrap();
        uow.repository::<Widget>().add(&widget(1)).unwrap();

        let err = uow.commit().unwrap_err();
        assert!(matches!(err, Error::Commit(_)));
        assert_eq!(uow.scope(), ScopeState::Failed);
    }

    #[test]
    fn failed_scope_can_begin_again() {
        let mut mock = MockStore::new();
        mock.expect_apply()
            .returning(|_| Err(StoreError::Other("flush refused".to_string())));

        let mut uow = UnitOfWork::new(mock);
        uow.begin().unwrap();
        uow.repository::<Widget>().add(&widget(1)).unwrap();
        assert!(uow.commit().is_err());
        assert_eq!(uow.scope(), ScopeState::Failed);

        uow.begin().unwrap();
        assert_eq!(uow.scope(), ScopeState::Begun);
    }

    #[test]
    fn dispose_releases_exactly_once() {
        let mut uow = UnitOfWork::new(MemoryStore::new());
        let handle = Arc::clone(uow.store().unwrap());

        // One reference here, one in the unit of work, one in the context.
        assert_eq!(Arc::strong_count(&handle), 3);

        uow.dispose();
        assert_eq!(Arc::strong_count(&handle), 1);

        // Second disposal is a no-op.
        uow.dispose();
        assert_eq!(Arc::strong_count(&handle), 1);

        assert!(matches!(uow.begin(), Err(Error::Disposed)));
        assert!(matches!(uow.store(), Err(Error::Disposed)));
    }

    #[test]
    fn drop_releases_the_context() {
        let handle;
        {
            let uow = UnitOfWork::new(MemoryStore::new());
            handle = Arc::clone(uow.store().unwrap());
            assert_eq!(Arc::strong_count(&handle), 3);
        }
        assert_eq!(Arc::strong_count(&handle), 1);
    }

    #[test]
    fn empty_commit_succeeds_without_touching_the_store() {
        // No expectation is set on apply: a call would panic the test.
        let mut uow = UnitOfWork::new(MockStore::new());
        uow.begin().unwrap();
        uow.commit().unwrap();
        assert_eq!(uow.scope(), ScopeState::Committed);
    }
}
