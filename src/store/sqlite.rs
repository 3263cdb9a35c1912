// src/store/sqlite.rs
//
// SQLite store backend
//
// PRINCIPLES:
// - Explicit connection pooling
// - Explicit SQL only
// - Idempotent schema initialization with a tracked version
// - Token checks happen inside the write transaction

use chrono::{DateTime, Utc};
use log::{debug, info};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::PathBuf;

use crate::key::CompositeKey;
use crate::store::{Applied, Store, StoreError, StoreResult, StoredRecord, WriteOp};

/// Type alias for the connection pool
pub type ConnectionPool = Pool<SqliteConnectionManager>;

/// Type alias for a pooled connection
pub type PooledConn = PooledConnection<SqliteConnectionManager>;

/// Current schema version
/// Increment this when adding migrations
const CURRENT_SCHEMA_VERSION: i32 = 1;

/// Pool and pragma configuration for [`SqliteStore`].
#[derive(Debug, Clone)]
pub struct SqliteStoreConfig {
    pub path: PathBuf,
    pub max_connections: u32,
}

impl SqliteStoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_connections: 15,
        }
    }
}

/// Default database location for an application name.
///
/// Path structure: {APP_DATA}/{app_name}/{app_name}.db
pub fn default_database_path(app_name: &str) -> StoreResult<PathBuf> {
    let data_dir = dirs::data_dir().ok_or_else(|| {
        StoreError::Other("could not determine app data directory".to_string())
    })?;

    let app_dir = data_dir.join(app_name);
    std::fs::create_dir_all(&app_dir)?;

    Ok(app_dir.join(format!("{}.db", app_name)))
}

/// Record store over a pooled SQLite database.
///
/// All records live in one `records` table keyed by `(set_name, record_key)`
/// with the composite key in its canonical text encoding. The `token` column
/// is the optimistic-concurrency token; `updated_at` is a write-time audit
/// stamp.
pub struct SqliteStore {
    pool: ConnectionPool,
}

impl SqliteStore {
    /// Opens (and if necessary creates) the database at the configured path.
    pub fn open(config: SqliteStoreConfig) -> StoreResult<Self> {
        let manager = SqliteConnectionManager::file(&config.path).with_init(|conn| {
            // Enable foreign key support (not default in SQLite)
            conn.execute_batch(
                "PRAGMA foreign_keys = ON;
                 PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA busy_timeout = 5000;",
            )?;
            Ok(())
        });

        let pool = Pool::builder()
            .max_size(config.max_connections)
            .build(manager)?;

        let store = Self { pool };
        store.initialize_schema()?;
        info!("sqlite store open at {}", config.path.display());
        Ok(store)
    }

    /// Opens a private in-memory database (one connection, for tests and
    /// ephemeral work).
    pub fn open_in_memory() -> StoreResult<Self> {
        let manager = SqliteConnectionManager::memory().with_init(|conn| {
            conn.execute_batch("PRAGMA foreign_keys = ON;")?;
            Ok(())
        });

        // A second connection would see a different empty database, so the
        // pool is pinned to one.
        let pool = Pool::builder().max_size(1).build(manager)?;

        let store = Self { pool };
        store.initialize_schema()?;
        Ok(store)
    }

    fn conn(&self) -> StoreResult<PooledConn> {
        Ok(self.pool.get()?)
    }

    /// Initialize the schema.
    ///
    /// Safe to call multiple times (idempotent).
    fn initialize_schema(&self) -> StoreResult<()> {
        let conn = self.conn()?;
        let current_version = get_schema_version(&conn)?;

        if current_version == 0 {
            apply_initial_schema(&conn)?;
            set_schema_version(&conn, CURRENT_SCHEMA_VERSION)?;
            info!("sqlite schema initialized at version {}", CURRENT_SCHEMA_VERSION);
        } else if current_version != CURRENT_SCHEMA_VERSION {
            return Err(StoreError::Other(format!(
                "schema version {} unsupported, expected {}",
                current_version, CURRENT_SCHEMA_VERSION
            )));
        }

        Ok(())
    }

    fn row_to_record(key: CompositeKey, row: &Row) -> Result<StoredRecord, rusqlite::Error> {
        let payload_text: String = row.get("payload")?;
        let payload = serde_json::from_str(&payload_text)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;

        let token: i64 = row.get("token")?;

        let updated_at_text: String = row.get("updated_at")?;
        let updated_at = DateTime::parse_from_rfc3339(&updated_at_text)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;

        Ok(StoredRecord {
            key,
            payload,
            token,
            updated_at,
        })
    }
}

/// Get current schema version.
/// Returns 0 if the schema_version table doesn't exist (fresh database).
fn get_schema_version(conn: &Connection) -> StoreResult<i32> {
    let table_exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
        [],
        |row| row.get(0),
    )?;

    if !table_exists {
        return Ok(0);
    }

    let version: Option<i32> =
        conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))?;

    Ok(version.unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: i32) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO schema_version (version, applied_at) VALUES (?1, ?2)",
        params![version, Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

fn apply_initial_schema(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
             version    INTEGER NOT NULL,
             applied_at TEXT NOT NULL
         );

         CREATE TABLE IF NOT EXISTS records (
             set_name   TEXT NOT NULL,
             record_key TEXT NOT NULL,
             payload    TEXT NOT NULL,
             token      INTEGER NOT NULL,
             updated_at TEXT NOT NULL,
             PRIMARY KEY (set_name, record_key)
         );",
    )?;
    Ok(())
}

fn current_token(
    conn: &Connection,
    set: &str,
    key: &CompositeKey,
) -> StoreResult<Option<i64>> {
    let token = conn
        .query_row(
            "SELECT token FROM records WHERE set_name = ?1 AND record_key = ?2",
            params![set, key.canonical()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(token)
}

impl Store for SqliteStore {
    fn get(&self, set: &str, key: &CompositeKey) -> StoreResult<Option<StoredRecord>> {
        let conn = self.conn()?;

        let record = conn
            .query_row(
                "SELECT payload, token, updated_at
                 FROM records
                 WHERE set_name = ?1 AND record_key = ?2",
                params![set, key.canonical()],
                |row| Self::row_to_record(key.clone(), row),
            )
            .optional()?;

        Ok(record)
    }

    fn scan(&self, set: &str) -> StoreResult<Vec<StoredRecord>> {
        let conn = self.conn()?;

        let mut stmt = conn.prepare(
            "SELECT record_key, payload, token, updated_at
             FROM records
             WHERE set_name = ?1
             ORDER BY record_key",
        )?;

        let rows = stmt.query_map(params![set], |row| {
            let key_text: String = row.get("record_key")?;
            let key = CompositeKey::from_canonical(&key_text)
                .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
            Self::row_to_record(key, row)
        })?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    fn contains(&self, set: &str, key: &CompositeKey) -> StoreResult<bool> {
        let conn = self.conn()?;

        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM records WHERE set_name = ?1 AND record_key = ?2",
            params![set, key.canonical()],
            |row| row.get(0),
        )?;

        Ok(count > 0)
    }

    fn count(&self, set: &str) -> StoreResult<u64> {
        let conn = self.conn()?;

        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM records WHERE set_name = ?1",
            params![set],
            |row| row.get(0),
        )?;

        Ok(count as u64)
    }

    fn apply(&self, ops: Vec<WriteOp>) -> StoreResult<Vec<Applied>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();

        let mut applied = Vec::with_capacity(ops.len());
        for op in ops {
            match op {
                WriteOp::Insert { set, key, payload } => {
                    if current_token(&tx, &set, &key)?.is_some() {
                        return Err(StoreError::DuplicateKey { set, key });
                    }
                    tx.execute(
                        "INSERT INTO records (set_name, record_key, payload, token, updated_at)
                         VALUES (?1, ?2, ?3, 1, ?4)",
                        params![set, key.canonical(), serde_json::to_string(&payload)?, now],
                    )?;
                    applied.push(Applied {
                        set,
                        key,
                        token: Some(1),
                    });
                }
                WriteOp::Update {
                    set,
                    key,
                    payload,
                    expected,
                } => {
                    let changed = tx.execute(
                        "UPDATE records
                         SET payload = ?3, token = token + 1, updated_at = ?4
                         WHERE set_name = ?1 AND record_key = ?2
                           AND (?5 IS NULL OR token = ?5)",
                        params![
                            set,
                            key.canonical(),
                            serde_json::to_string(&payload)?,
                            now,
                            expected
                        ],
                    )?;
                    if changed == 0 {
                        let found = current_token(&tx, &set, &key)?;
                        return Err(StoreError::TokenMismatch {
                            set,
                            key,
                            expected,
                            found,
                        });
                    }
                    let token = current_token(&tx, &set, &key)?;
                    applied.push(Applied { set, key, token });
                }
                WriteOp::Delete { set, key, expected } => {
                    let changed = tx.execute(
                        "DELETE FROM records
                         WHERE set_name = ?1 AND record_key = ?2
                           AND (?3 IS NULL OR token = ?3)",
                        params![set, key.canonical(), expected],
                    )?;
                    if changed == 0 {
                        let found = current_token(&tx, &set, &key)?;
                        return Err(StoreError::TokenMismatch {
                            set,
                            key,
                            expected,
                            found,
                        });
                    }
                    applied.push(Applied {
                        set,
                        key,
                        token: None,
                    });
                }
            }
        }

        tx.commit()?;
        debug!("applied {} write op(s)", applied.len());
        Ok(applied)
    }
}
