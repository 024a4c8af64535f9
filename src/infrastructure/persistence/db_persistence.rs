//! `SQLite` blob-table persistence backend.
//!
//! One table per logical cache: `(id, key, payload, last_update, context)`
//! with a unique index on `key`. All statements run on blocking threads; the
//! connection sits behind a mutex since `rusqlite` statements are not
//! reentrant. Operations on one key run in call order, background writes
//! included. Table-wide operations first wait for pending background writes.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, ErrorCode, OptionalExtension, params, params_from_iter};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::domain::entities::{PersistenceEntry, timestamp_from_millis};
use crate::domain::errors::{PersistenceError, PersistenceResult, check_key};
use crate::domain::ports::Persistence;

use super::cleanup::{CleanupPolicy, DELETE_BATCH};
use super::key_locks::KeyLocks;

/// Default size of the fire-and-forget writer pool.
pub const DEFAULT_WRITER_THREADS: usize = 3;

/// Current table layout version.
pub const SCHEMA_VERSION: i64 = 2;

const META_TABLE: &str = "viewcache_meta";
const BACKEND: &str = "database";

/// SQL text for one table, built once from the validated table name.
#[derive(Debug)]
struct Sql {
    table: String,
    create: String,
    create_index: String,
    exists: String,
    select: String,
    last_update: String,
    insert: String,
    update: String,
    delete: String,
    keys: String,
    clear: String,
    expired: String,
}

impl Sql {
    fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            create: format!(
                "CREATE TABLE {table} (
                    id          INTEGER PRIMARY KEY AUTOINCREMENT,
                    key         TEXT NOT NULL,
                    payload     BLOB NOT NULL,
                    last_update INTEGER NOT NULL,
                    context     BLOB
                )"
            ),
            create_index: format!("CREATE UNIQUE INDEX IF NOT EXISTS {table}_key ON {table}(key)"),
            exists: format!("SELECT 1 FROM {table} WHERE key = ?1"),
            select: format!("SELECT payload, last_update, context FROM {table} WHERE key = ?1"),
            last_update: format!("SELECT last_update FROM {table} WHERE key = ?1"),
            insert: format!(
                "INSERT INTO {table} (key, payload, last_update, context) VALUES (?1, ?2, ?3, ?4)"
            ),
            update: format!(
                "UPDATE {table} SET payload = ?2, last_update = ?3, context = ?4 WHERE key = ?1"
            ),
            delete: format!("DELETE FROM {table} WHERE key = ?1"),
            keys: format!("SELECT key FROM {table} ORDER BY id"),
            clear: format!("DELETE FROM {table}"),
            expired: format!("SELECT id FROM {table} WHERE last_update < ?1 ORDER BY id"),
        }
    }
}

#[derive(Debug)]
enum DbState {
    Uninitialized,
    Open(Connection),
    Closed,
}

#[derive(Debug)]
struct Shared {
    path: PathBuf,
    sql: Sql,
    state: Mutex<DbState>,
}

/// Persistence storing every entry as a row of one `SQLite` table.
#[derive(Debug)]
pub struct DbPersistence {
    shared: Arc<Shared>,
    async_writes: bool,
    writer_threads: usize,
    writers: Arc<Semaphore>,
    locks: KeyLocks,
    cleanup: CleanupPolicy,
}

impl DbPersistence {
    /// Creates a backend for `table` in the database file at `path`.
    ///
    /// # Errors
    /// Returns [`PersistenceError::InvalidTable`] if `table` is not a plain
    /// SQL identifier.
    pub fn new(path: impl Into<PathBuf>, table: &str) -> PersistenceResult<Self> {
        validate_table(table)?;
        Ok(Self {
            shared: Arc::new(Shared {
                path: path.into(),
                sql: Sql::new(table),
                state: Mutex::new(DbState::Uninitialized),
            }),
            async_writes: false,
            writer_threads: DEFAULT_WRITER_THREADS,
            writers: Arc::new(Semaphore::new(DEFAULT_WRITER_THREADS)),
            locks: KeyLocks::new(),
            cleanup: CleanupPolicy::None,
        })
    }

    /// Makes writes that do not ask for a copy return immediately, running
    /// on at most `writer_threads` background writers.
    #[must_use]
    pub fn with_async_writes(mut self, writer_threads: usize) -> Self {
        let writer_threads = writer_threads.max(1);
        self.async_writes = true;
        self.writer_threads = writer_threads;
        self.writers = Arc::new(Semaphore::new(writer_threads));
        self
    }

    /// Sets the policy applied by [`Persistence::run_cleanup_policy`].
    #[must_use]
    pub const fn with_cleanup(mut self, cleanup: CleanupPolicy) -> Self {
        self.cleanup = cleanup;
        self
    }

    /// The database file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    /// Waits until every background write has landed.
    pub async fn flush(&self) {
        let permits = u32::try_from(self.writer_threads).unwrap_or(u32::MAX);
        if let Ok(all) = self.writers.acquire_many(permits).await {
            drop(all);
        }
    }

    async fn run<T, F>(&self, f: F) -> PersistenceResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection, &Sql) -> PersistenceResult<T> + Send + 'static,
    {
        run_blocking(self.shared.clone(), f).await
    }
}

async fn run_blocking<T, F>(shared: Arc<Shared>, f: F) -> PersistenceResult<T>
where
    T: Send + 'static,
    F: FnOnce(&mut Connection, &Sql) -> PersistenceResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut state = shared.state.lock();
        match &mut *state {
            DbState::Open(conn) => f(conn, &shared.sql),
            DbState::Uninitialized => Err(PersistenceError::not_initialized(BACKEND)),
            DbState::Closed => Err(PersistenceError::closed(BACKEND)),
        }
    })
    .await?
}

fn validate_table(table: &str) -> PersistenceResult<()> {
    let mut chars = table.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    let reserved = table.eq_ignore_ascii_case(META_TABLE)
        || table.to_ascii_lowercase().starts_with("sqlite_");

    if valid_start && valid_rest && !reserved {
        Ok(())
    } else {
        Err(PersistenceError::InvalidTable {
            name: table.to_string(),
        })
    }
}

/// Maps integrity failures to [`PersistenceError::Corrupted`].
fn classify(err: rusqlite::Error) -> PersistenceError {
    match err.sqlite_error_code() {
        Some(ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase) => {
            PersistenceError::corrupted(err.to_string())
        }
        _ => PersistenceError::Database(err),
    }
}

/// Brings the table to [`SCHEMA_VERSION`] inside one transaction.
fn migrate(conn: &mut Connection, sql: &Sql) -> rusqlite::Result<()> {
    let tx = conn.transaction()?;
    tx.execute(
        &format!(
            "CREATE TABLE IF NOT EXISTS {META_TABLE} (
                table_name TEXT PRIMARY KEY,
                version    INTEGER NOT NULL
            )"
        ),
        [],
    )?;

    let exists: bool = tx.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
        [sql.table.as_str()],
        |row| row.get(0),
    )?;
    let version: Option<i64> = tx
        .query_row(
            &format!("SELECT version FROM {META_TABLE} WHERE table_name = ?1"),
            [sql.table.as_str()],
            |row| row.get(0),
        )
        .optional()?;

    match (exists, version) {
        (true, Some(SCHEMA_VERSION)) => {}
        (true, Some(1)) => {
            tx.execute(&format!("ALTER TABLE {} ADD COLUMN context BLOB", sql.table), [])?;
            info!(table = %sql.table, "Migrated table to schema version {SCHEMA_VERSION}");
        }
        (false, _) => {
            tx.execute(&sql.create, [])?;
            debug!(table = %sql.table, "Created table");
        }
        (true, other) => {
            warn!(table = %sql.table, found = ?other, "Unknown schema version, recreating table");
            tx.execute(&format!("DROP TABLE {}", sql.table), [])?;
            tx.execute(&sql.create, [])?;
        }
    }

    tx.execute(&sql.create_index, [])?;
    tx.execute(
        &format!("INSERT OR REPLACE INTO {META_TABLE} (table_name, version) VALUES (?1, ?2)"),
        params![sql.table, SCHEMA_VERSION],
    )?;
    tx.commit()
}

fn upsert(
    conn: &mut Connection,
    sql: &Sql,
    key: &str,
    payload: &[u8],
    timestamp: i64,
    context: Option<&[u8]>,
) -> rusqlite::Result<()> {
    let tx = conn.transaction()?;
    let exists = tx.prepare_cached(&sql.exists)?.exists([key])?;
    if exists {
        tx.execute(&sql.update, params![key, payload, timestamp, context])?;
    } else {
        tx.execute(&sql.insert, params![key, payload, timestamp, context])?;
    }
    tx.commit()
}

#[async_trait]
impl Persistence for DbPersistence {
    fn name(&self) -> &str {
        BACKEND
    }

    async fn initialize(&self) -> PersistenceResult<()> {
        let shared = self.shared.clone();
        tokio::task::spawn_blocking(move || {
            if let Some(parent) = shared.path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent)?;
            }
            let mut conn = Connection::open(&shared.path).map_err(classify)?;
            migrate(&mut conn, &shared.sql).map_err(classify)?;

            debug!(path = %shared.path.display(), table = %shared.sql.table, "Database persistence initialized");
            *shared.state.lock() = DbState::Open(conn);
            Ok(())
        })
        .await?
    }

    async fn read_entry(&self, key: &str) -> PersistenceResult<Option<PersistenceEntry>> {
        check_key(key)?;
        let _guard = self.locks.lock(key).await;
        let key = key.to_string();
        self.run(move |conn, sql| {
            let mut stmt = conn.prepare_cached(&sql.select)?;
            let row = stmt
                .query_row([key.as_str()], |row| {
                    Ok((
                        row.get::<_, Vec<u8>>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, Option<Vec<u8>>>(2)?,
                    ))
                })
                .optional()
                .map_err(classify)?;

            Ok(row.map(|(payload, timestamp, context)| {
                PersistenceEntry::new(
                    key,
                    Bytes::from(payload),
                    timestamp_from_millis(timestamp),
                    context.map(Bytes::from),
                )
            }))
        })
        .await
    }

    async fn write_entry(
        &self,
        key: &str,
        payload: Bytes,
        timestamp: DateTime<Utc>,
        context: Option<Bytes>,
        return_copy: bool,
    ) -> PersistenceResult<Option<Bytes>> {
        check_key(key)?;
        let owned_key = key.to_string();
        let millis = timestamp.timestamp_millis();
        let copy = return_copy.then(|| payload.clone());
        let write = move |conn: &mut Connection, sql: &Sql| {
            upsert(conn, sql, &owned_key, &payload, millis, context.as_deref()).map_err(classify)
        };

        let guard = self.locks.lock(key).await;
        if self.async_writes && !return_copy {
            let permit = self
                .writers
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| PersistenceError::closed(BACKEND))?;
            let shared = self.shared.clone();
            let key = key.to_string();
            // The key stays locked until the row has landed.
            tokio::spawn(async move {
                if let Err(e) = run_blocking(shared, write).await {
                    warn!(key = %key, error = %e, "Background write failed");
                }
                drop(permit);
                drop(guard);
            });
            return Ok(None);
        }

        self.run(write).await?;
        drop(guard);
        Ok(copy)
    }

    async fn remove_entry(&self, key: &str) -> PersistenceResult<()> {
        check_key(key)?;
        let _guard = self.locks.lock(key).await;
        let key = key.to_string();
        self.run(move |conn, sql| {
            conn.execute(&sql.delete, [key.as_str()])?;
            Ok(())
        })
        .await
    }

    async fn list_keys(&self) -> PersistenceResult<Vec<String>> {
        self.flush().await;
        self.run(|conn, sql| {
            let mut stmt = conn.prepare_cached(&sql.keys)?;
            let keys = stmt
                .query_map([], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(keys)
        })
        .await
    }

    async fn last_update(&self, key: &str) -> PersistenceResult<Option<DateTime<Utc>>> {
        check_key(key)?;
        let _guard = self.locks.lock(key).await;
        let key = key.to_string();
        self.run(move |conn, sql| {
            let millis: Option<i64> = conn
                .prepare_cached(&sql.last_update)?
                .query_row([key.as_str()], |row| row.get(0))
                .optional()?;
            Ok(millis.map(timestamp_from_millis))
        })
        .await
    }

    async fn clear(&self) -> PersistenceResult<()> {
        self.flush().await;
        self.run(|conn, sql| {
            let removed = conn.execute(&sql.clear, [])?;
            debug!(removed, "Database persistence cleared");
            Ok(())
        })
        .await
    }

    async fn close(&self) -> PersistenceResult<()> {
        self.flush().await;
        self.writers.close();

        let shared = self.shared.clone();
        tokio::task::spawn_blocking(move || {
            let previous = std::mem::replace(&mut *shared.state.lock(), DbState::Closed);
            if let DbState::Open(conn) = previous {
                conn.close().map_err(|(_, e)| PersistenceError::Database(e))?;
            }
            debug!(path = %shared.path.display(), "Database persistence closed");
            Ok(())
        })
        .await?
    }

    async fn run_cleanup_policy(&self) -> PersistenceResult<usize> {
        let Some(cutoff) = self.cleanup.cutoff(Utc::now()) else {
            return Ok(0);
        };
        let cutoff = cutoff.timestamp_millis();

        self.flush().await;
        self.run(move |conn, sql| {
            let ids: Vec<i64> = conn
                .prepare(&sql.expired)?
                .query_map([cutoff], |row| row.get(0))?
                .collect::<Result<_, _>>()?;

            let mut removed = 0;
            for batch in ids.chunks(DELETE_BATCH) {
                let placeholders = vec!["?"; batch.len()].join(", ");
                removed += conn.execute(
                    &format!("DELETE FROM {} WHERE id IN ({placeholders})", sql.table),
                    params_from_iter(batch),
                )?;
            }
            if removed > 0 {
                debug!(removed, table = %sql.table, "Expired rows removed");
            }
            Ok(removed)
        })
        .await
    }

    async fn purge(&self) -> PersistenceResult<()> {
        self.flush().await;
        let shared = self.shared.clone();
        tokio::task::spawn_blocking(move || {
            let mut state = shared.state.lock();
            *state = DbState::Uninitialized;

            let stem = shared.path.as_os_str().to_owned();
            let mut doomed = vec![shared.path.clone()];
            for suffix in ["-journal", "-wal", "-shm"] {
                let mut sidecar = stem.clone();
                sidecar.push(suffix);
                doomed.push(PathBuf::from(sidecar));
            }

            for path in doomed {
                match std::fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
            warn!(path = %shared.path.display(), "Database persistence purged");
            Ok(())
        })
        .await?
    }
}
