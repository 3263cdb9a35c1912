// tests/commit_scopes.rs
//
// Scope lifecycle and commit translation across whole units of work:
// stale tokens surface as concurrency conflicts, everything else as plain
// commit failures, and disposal releases the context deterministically.

mod common;

use common::{book, Book};
use depot::{Error, MemoryStore, ScopeState, SqliteStore, SqliteStoreConfig, UnitOfWork};
use std::sync::Arc;

#[test]
fn concurrent_edits_of_the_same_record_conflict() {
    let store = Arc::new(MemoryStore::new());

    // Seed through a first unit of work.
    let mut seeder = UnitOfWork::new(Arc::clone(&store));
    seeder.begin().unwrap();
    seeder
        .repository::<Book>()
        .add(&book(1, "shared", 100, None, "5.00"))
        .unwrap();
    seeder.commit().unwrap();

    // Two independent units of work load the same record.
    let mut uow_a = UnitOfWork::new(Arc::clone(&store));
    let mut uow_b = UnitOfWork::new(Arc::clone(&store));
    let mut from_a = uow_a.repository::<Book>().get_by_id(&1).unwrap().unwrap();
    let mut from_b = uow_b.repository::<Book>().get_by_id(&1).unwrap().unwrap();

    // The first writer wins.
    uow_a.begin().unwrap();
    from_a.title = "renamed by a".to_string();
    uow_a.repository::<Book>().update(&from_a).unwrap();
    uow_a.commit().unwrap();

    // The second writer holds a stale token and must get the typed
    // concurrency signal, never the general commit failure.
    uow_b.begin().unwrap();
    from_b.title = "renamed by b".to_string();
    uow_b.repository::<Book>().update(&from_b).unwrap();
    let err = uow_b.commit().unwrap_err();
    assert!(matches!(err, Error::Concurrency(_)));
    assert_eq!(uow_b.scope(), ScopeState::Failed);

    // The winning write survived.
    let current = UnitOfWork::new(Arc::clone(&store))
        .repository::<Book>()
        .get_by_id(&1)
        .unwrap()
        .unwrap();
    assert_eq!(current.title, "renamed by a");
}

#[test]
fn conflicting_delete_is_a_concurrency_error_too() {
    let store = Arc::new(MemoryStore::new());

    let mut seeder = UnitOfWork::new(Arc::clone(&store));
    seeder.begin().unwrap();
    seeder
        .repository::<Book>()
        .add(&book(2, "to vanish", 50, None, "3.00"))
        .unwrap();
    seeder.commit().unwrap();

    let mut uow_a = UnitOfWork::new(Arc::clone(&store));
    let mut uow_b = UnitOfWork::new(Arc::clone(&store));
    let from_a = uow_a.repository::<Book>().get_by_id(&2).unwrap().unwrap();
    let from_b = uow_b.repository::<Book>().get_by_id(&2).unwrap().unwrap();

    uow_a.begin().unwrap();
    uow_a.repository::<Book>().delete(&from_a).unwrap();
    uow_a.commit().unwrap();

    uow_b.begin().unwrap();
    uow_b.repository::<Book>().delete(&from_b).unwrap();
    let err = uow_b.commit().unwrap_err();
    assert!(matches!(err, Error::Concurrency(_)));
}

#[test]
fn duplicate_insert_is_a_general_commit_failure() {
    let store = Arc::new(MemoryStore::new());

    let mut uow_a = UnitOfWork::new(Arc::clone(&store));
    let mut uow_b = UnitOfWork::new(Arc::clone(&store));

    uow_a.begin().unwrap();
    uow_a
        .repository::<Book>()
        .add(&book(3, "first in", 10, None, "1.00"))
        .unwrap();
    uow_a.commit().unwrap();

    uow_b.begin().unwrap();
    uow_b
        .repository::<Book>()
        .add(&book(3, "second in", 10, None, "1.00"))
        .unwrap();
    let err = uow_b.commit().unwrap_err();
    assert!(matches!(err, Error::Commit(_)));
}

#[test]
fn failed_scope_allows_a_fresh_scope() {
    let store = Arc::new(MemoryStore::new());

    let mut seeder = UnitOfWork::new(Arc::clone(&store));
    seeder.begin().unwrap();
    seeder
        .repository::<Book>()
        .add(&book(4, "contended", 10, None, "1.00"))
        .unwrap();
    seeder.commit().unwrap();

    let mut uow = UnitOfWork::new(Arc::clone(&store));
    let mut stale = uow.repository::<Book>().get_by_id(&4).unwrap().unwrap();

    // Outdate the token behind this unit of work's back.
    let mut rival = UnitOfWork::new(Arc::clone(&store));
    let mut fresh = rival.repository::<Book>().get_by_id(&4).unwrap().unwrap();
    rival.begin().unwrap();
    fresh.pages = 11;
    rival.repository::<Book>().update(&fresh).unwrap();
    rival.commit().unwrap();

    uow.begin().unwrap();
    stale.pages = 12;
    uow.repository::<Book>().update(&stale).unwrap();
    assert!(uow.commit().is_err());
    assert_eq!(uow.scope(), ScopeState::Failed);

    // The unit of work is still usable for a new scope.
    uow.begin().unwrap();
    assert_eq!(uow.scope(), ScopeState::Begun);
}

#[test]
fn work_and_logical_areas_share_the_context() {
    let mut uow = UnitOfWork::new(MemoryStore::new());
    let catalog = uow.work_area("catalog");
    let reporting = uow.logical_area("reporting");

    assert_eq!(catalog.name(), "catalog");
    assert_eq!(reporting.name(), "reporting");
    assert!(Arc::ptr_eq(catalog.context(), uow.context()));
    assert!(Arc::ptr_eq(reporting.context(), uow.context()));

    uow.begin().unwrap();
    catalog
        .repository::<Book>()
        .add(&book(5, "via area", 10, None, "2.00"))
        .unwrap();
    uow.commit().unwrap();

    // The logical area sees the committed record through the same context.
    let count = reporting.query::<Book>().count().unwrap();
    assert_eq!(count, 1);
    let row = reporting.query::<Book>().single().unwrap();
    assert_eq!(row.title, "via area");
}

#[test]
fn dispose_on_disk_store_is_idempotent() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("scopes.db");

    let mut uow = UnitOfWork::new(SqliteStore::open(SqliteStoreConfig::new(&path))?);
    uow.begin()?;
    uow.repository::<Book>()
        .add(&book(6, "persisted", 10, None, "1.50"))?;
    uow.commit()?;

    uow.dispose();
    uow.dispose();
    assert!(matches!(uow.begin(), Err(Error::Disposed)));
    assert!(matches!(
        uow.repository::<Book>().total(),
        Err(Error::Disposed)
    ));

    // The data is on disk regardless of the disposal.
    let reopened = UnitOfWork::new(SqliteStore::open(SqliteStoreConfig::new(&path))?);
    assert!(reopened.repository::<Book>().exists(&6)?);
    Ok(())
}

#[tokio::test]
async fn async_commit_translates_conflicts_the_same_way() {
    let store = Arc::new(MemoryStore::new());

    let mut seeder = UnitOfWork::new(Arc::clone(&store));
    seeder.begin().unwrap();
    seeder
        .repository::<Book>()
        .add(&book(7, "async contended", 10, None, "1.00"))
        .unwrap();
    seeder.commit_async().await.unwrap();

    let mut uow_a = UnitOfWork::new(Arc::clone(&store));
    let mut uow_b = UnitOfWork::new(Arc::clone(&store));
    let mut from_a = uow_a
        .repository::<Book>()
        .get_by_id_async(&7)
        .await
        .unwrap()
        .unwrap();
    let mut from_b = uow_b
        .repository::<Book>()
        .get_by_id_async(&7)
        .await
        .unwrap()
        .unwrap();

    uow_a.begin().unwrap();
    from_a.pages = 20;
    uow_a.repository::<Book>().update(&from_a).unwrap();
    uow_a.commit_async().await.unwrap();

    uow_b.begin().unwrap();
    from_b.pages = 30;
    uow_b.repository::<Book>().update(&from_b).unwrap();
    let err = uow_b.commit_async().await.unwrap_err();
    assert!(matches!(err, Error::Concurrency(_)));
}
