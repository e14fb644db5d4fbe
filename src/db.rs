//! # SQLite Access Layer
//!
//! [`Db`] wraps one `rusqlite::Connection` behind a cheap-clone handle and
//! provides the contract the rest of the crate builds on:
//!
//! - statement execution with bounded busy-retry and randomized backoff
//! - `BEGIN IMMEDIATE` transactions with SAVEPOINT support, serialized so at
//!   most one write transaction is in flight per handle
//! - a "something changed" counter ([`Db::data_version`]) and the durable
//!   [`Db::user_version`] checkpoint
//! - the append-only migration ledger
//!
//! ## Connection Ownership
//!
//! SQLite connections are `Send` but not `Sync`, so the connection lives in a
//! mutex and every statement takes it for the duration of that statement
//! only. Write transactions are serialized through a separate async lock
//! (one transaction in flight per process per handle); the OS-level write
//! lock across processes is SQLite's own, surfacing as SQLITE_BUSY, which
//! the retry policy here absorbs.
//!
//! ## Retry Policy
//!
//! One policy per operation class, nothing per-call-site:
//!
//! | Class | Attempts | Backoff per attempt |
//! |-------|----------|---------------------|
//! | Single statement | 8 | 5–15 ms randomized |
//! | Transaction begin | 12 | 10–40 ms randomized |

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags, ToSql};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::error::{sqlite_is_busy, Error, Result};

// =============================================================================
// Retry Configuration
// =============================================================================

/// Attempts for a single statement hitting SQLITE_BUSY.
pub const STMT_RETRY_ATTEMPTS: u32 = 8;

/// Attempts for BEGIN IMMEDIATE hitting SQLITE_BUSY.
pub const TX_RETRY_ATTEMPTS: u32 = 12;

fn stmt_backoff() -> Duration {
    Duration::from_millis(rand::rng().random_range(5..15))
}

fn tx_backoff() -> Duration {
    Duration::from_millis(rand::rng().random_range(10..40))
}

// =============================================================================
// Owned SQL Values
// =============================================================================

/// An owned SQL value, used for both bind parameters and row results.
///
/// Owning the values (rather than borrowing `dyn ToSql`) keeps every future
/// in this crate `Send`, and lets retries re-bind the same parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
        use rusqlite::types::{ToSqlOutput, Value};
        Ok(match self {
            SqlValue::Null => ToSqlOutput::Owned(Value::Null),
            SqlValue::Integer(i) => ToSqlOutput::Owned(Value::Integer(*i)),
            SqlValue::Real(f) => ToSqlOutput::Owned(Value::Real(*f)),
            SqlValue::Text(s) => ToSqlOutput::Owned(Value::Text(s.clone())),
            SqlValue::Blob(b) => ToSqlOutput::Owned(Value::Blob(b.clone())),
        })
    }
}

impl SqlValue {
    fn from_ref(v: ValueRef<'_>) -> Self {
        match v {
            ValueRef::Null => SqlValue::Null,
            ValueRef::Integer(i) => SqlValue::Integer(i),
            ValueRef::Real(f) => SqlValue::Real(f),
            ValueRef::Text(t) => SqlValue::Text(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => SqlValue::Blob(b.to_vec()),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }
}

/// A bound parameter list.
pub type SqlParams = Vec<SqlValue>;

/// A raw result row.
pub type SqlRow = Vec<SqlValue>;

// =============================================================================
// Db Handle
// =============================================================================

struct DbInner {
    conn: Mutex<Connection>,
    /// Serializes write transactions: at most one in flight per handle.
    tx_lock: Arc<AsyncMutex<()>>,
    /// Commits made through this handle. `PRAGMA data_version` only moves
    /// for *other* connections, so this fills in our own writes.
    write_commits: AtomicU64,
    read_only: bool,
    /// Backing file, for [`Db::reopen`]. `None` for in-memory databases.
    path: Option<std::path::PathBuf>,
}

/// A cheap-clone handle to one SQLite connection.
#[derive(Clone)]
pub struct Db {
    inner: Arc<DbInner>,
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db")
            .field("read_only", &self.inner.read_only)
            .finish()
    }
}

impl Db {
    /// Opens (creating if needed) a database file for read-write access.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = open_connection(&path, false)?;
        Self::from_connection(conn, false, Some(path))
    }

    /// Opens an existing database file read-only. Never sees uncommitted
    /// state from writers on other connections.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = open_connection(&path, true)?;
        Self::from_connection(conn, true, Some(path))
    }

    /// Opens an in-memory database. Lost when the handle is dropped.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, false, None)
    }

    fn from_connection(conn: Connection, read_only: bool, path: Option<std::path::PathBuf>) -> Result<Self> {
        Ok(Self {
            inner: Arc::new(DbInner {
                conn: Mutex::new(conn),
                tx_lock: Arc::new(AsyncMutex::new(())),
                write_commits: AtomicU64::new(0),
                read_only,
                path,
            }),
        })
    }

    /// Replaces the underlying connection with a fresh one on the same
    /// file, recovering from lock contention or a wedged connection. Every
    /// clone of this handle sees the new connection. Waits out any open
    /// transaction first. No-op for in-memory databases (their contents
    /// live in the connection).
    pub async fn reopen(&self) -> Result<()> {
        let Some(path) = self.inner.path.clone() else {
            return Ok(());
        };
        let _no_tx = self.inner.tx_lock.lock().await;
        let fresh = open_connection(&path, self.inner.read_only)?;
        *self.inner.conn.lock().expect("connection mutex poisoned") = fresh;
        Ok(())
    }

    /// `user_version` as of the latest commit: waits out any transaction
    /// open on this handle, so an in-flight replay's uncommitted checkpoint
    /// is never observed. (A read-only handle never has one.)
    pub async fn committed_user_version(&self) -> Result<u64> {
        let _no_tx = self.inner.tx_lock.lock().await;
        self.user_version().await
    }

    /// True for handles opened with [`Db::open_read_only`].
    pub fn is_read_only(&self) -> bool {
        self.inner.read_only
    }

    /// True when no transaction is open on this connection.
    pub fn is_autocommit(&self) -> Result<bool> {
        Ok(self.with_conn(|conn| Ok(conn.is_autocommit()))?)
    }

    // =========================================================================
    // Statements
    // =========================================================================

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> rusqlite::Result<T> {
        let conn = self.inner.conn.lock().expect("connection mutex poisoned");
        f(&conn)
    }

    /// Executes a statement, retrying on SQLITE_BUSY.
    pub async fn exec(&self, sql: &str, params: &[SqlValue]) -> Result<usize> {
        self.retry_stmt(|conn| conn.execute(sql, rusqlite::params_from_iter(params.iter())))
            .await
    }

    /// Executes a statement and returns `last_insert_rowid()`.
    pub async fn exec_returning_rowid(&self, sql: &str, params: &[SqlValue]) -> Result<i64> {
        self.retry_stmt(|conn| {
            conn.execute(sql, rusqlite::params_from_iter(params.iter()))?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    /// Executes a batch of semicolon-separated statements (DDL, pragmas).
    pub async fn exec_batch(&self, sql: &str) -> Result<()> {
        self.retry_stmt(|conn| conn.execute_batch(sql)).await
    }

    /// Runs a query and returns every row as owned values.
    pub async fn query_all(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>> {
        self.retry_stmt(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let ncols = stmt.column_count();
            let mut rows = stmt.query(rusqlite::params_from_iter(params.iter()))?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let mut vals = Vec::with_capacity(ncols);
                for i in 0..ncols {
                    vals.push(SqlValue::from_ref(row.get_ref(i)?));
                }
                out.push(vals);
            }
            Ok(out)
        })
        .await
    }

    /// Runs a query and returns the first row, if any.
    pub async fn query_one(&self, sql: &str, params: &[SqlValue]) -> Result<Option<SqlRow>> {
        let mut rows = self.query_all(sql, params).await?;
        if rows.is_empty() {
            Ok(None)
        } else {
            Ok(Some(rows.swap_remove(0)))
        }
    }

    /// Runs a query expected to yield a single scalar.
    pub async fn query_scalar(&self, sql: &str, params: &[SqlValue]) -> Result<Option<SqlValue>> {
        Ok(self
            .query_one(sql, params)
            .await?
            .and_then(|mut row| if row.is_empty() { None } else { Some(row.swap_remove(0)) }))
    }

    async fn retry_stmt<T>(
        &self,
        f: impl Fn(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.with_conn(&f) {
                Ok(v) => return Ok(v),
                Err(e) if sqlite_is_busy(&e) && attempt < STMT_RETRY_ATTEMPTS => {
                    tracing::debug!(attempt, "statement hit SQLITE_BUSY, retrying");
                    tokio::time::sleep(stmt_backoff()).await;
                }
                Err(e) if sqlite_is_busy(&e) => return Err(Error::Busy { attempts: attempt }),
                Err(e) => return Err(e.into()),
            }
        }
    }

    // =========================================================================
    // Version Counters
    // =========================================================================

    /// A counter that changes whenever any connection commits a write.
    ///
    /// SQLite's `PRAGMA data_version` moves only for commits made by *other*
    /// connections; the handle's own committed transactions are added in.
    pub async fn data_version(&self) -> Result<u64> {
        let dv = self
            .query_scalar("PRAGMA data_version", &[])
            .await?
            .and_then(|v| v.as_i64())
            .unwrap_or(0) as u64;
        Ok(dv.wrapping_add(self.inner.write_commits.load(Ordering::Acquire)))
    }

    /// The durable user-settable version counter (`PRAGMA user_version`).
    pub async fn user_version(&self) -> Result<u64> {
        Ok(self
            .query_scalar("PRAGMA user_version", &[])
            .await?
            .and_then(|v| v.as_i64())
            .unwrap_or(0) as u64)
    }

    /// Sets `PRAGMA user_version`. Transactional: participates in any open
    /// transaction on this connection.
    pub async fn set_user_version(&self, v: u64) -> Result<()> {
        // PRAGMA does not take bind parameters.
        self.exec_batch(&format!("PRAGMA user_version = {v}")).await
    }

    pub(crate) fn note_commit(&self) {
        self.inner.write_commits.fetch_add(1, Ordering::Release);
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Begins an immediate-mode write transaction.
    ///
    /// Transactions on one handle are serialized; the returned guard must be
    /// committed or rolled back, and rolls back on drop otherwise. SQLITE_BUSY
    /// at BEGIN (a writer in another process) is retried with backoff.
    pub async fn begin_immediate(&self) -> Result<TxGuard> {
        let guard = Arc::clone(&self.inner.tx_lock).lock_owned().await;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.with_conn(|conn| conn.execute_batch("BEGIN IMMEDIATE")) {
                Ok(()) => {
                    return Ok(TxGuard {
                        db: self.clone(),
                        _guard: guard,
                        open: true,
                    })
                }
                Err(e) if sqlite_is_busy(&e) && attempt < TX_RETRY_ATTEMPTS => {
                    tracing::debug!(attempt, "BEGIN IMMEDIATE busy, retrying");
                    tokio::time::sleep(tx_backoff()).await;
                }
                Err(e) if sqlite_is_busy(&e) => return Err(Error::Busy { attempts: attempt }),
                Err(e) => return Err(e.into()),
            }
        }
    }

    // =========================================================================
    // Migration Ledger
    // =========================================================================

    /// Creates the migration ledger table if missing.
    pub async fn ensure_migration_ledger(&self) -> Result<()> {
        self.exec_batch(
            "CREATE TABLE IF NOT EXISTS _migrations (
                key TEXT NOT NULL,
                ts  INTEGER NOT NULL,
                up  INTEGER NOT NULL
            )",
        )
        .await
    }

    /// A migration is done iff its latest ledger row has `up = 1`.
    pub async fn migration_done(&self, key: &str) -> Result<bool> {
        let row = self
            .query_scalar(
                "SELECT up FROM _migrations WHERE key = ? ORDER BY rowid DESC LIMIT 1",
                &[SqlValue::Text(key.to_string())],
            )
            .await?;
        Ok(matches!(row, Some(SqlValue::Integer(1))))
    }

    /// Appends a ledger row for `key`.
    pub async fn record_migration(&self, key: &str, up: bool) -> Result<()> {
        self.exec(
            "INSERT INTO _migrations (key, ts, up) VALUES (?, ?, ?)",
            &[
                SqlValue::Text(key.to_string()),
                SqlValue::Integer(now_ms()),
                SqlValue::Integer(up as i64),
            ],
        )
        .await?;
        Ok(())
    }

    /// Runs each not-yet-done migration's DDL inside its own transaction and
    /// records it in the ledger. Forward-only.
    pub async fn run_migrations(&self, migrations: &[Migration]) -> Result<()> {
        self.ensure_migration_ledger().await?;
        for m in migrations {
            if self.migration_done(&m.key).await? {
                continue;
            }
            tracing::debug!(key = %m.key, "running migration");
            let tx = self.begin_immediate().await?;
            self.exec_batch(&m.sql).await?;
            self.record_migration(&m.key, true).await?;
            tx.commit().await?;
        }
        Ok(())
    }
}

fn open_connection(path: &Path, read_only: bool) -> rusqlite::Result<Connection> {
    if read_only {
        Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
    } else {
        let conn = Connection::open(path)?;
        // WAL so readers on the second connection never block the writer.
        conn.execute_batch("PRAGMA journal_mode = WAL")?;
        conn.execute_batch("PRAGMA synchronous = NORMAL")?;
        conn.execute_batch("PRAGMA foreign_keys = ON")?;
        Ok(conn)
    }
}

/// One forward-only schema migration: a stable key plus a DDL batch.
#[derive(Debug, Clone)]
pub struct Migration {
    pub key: String,
    pub sql: String,
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

// =============================================================================
// Transaction Guard
// =============================================================================

/// An open `BEGIN IMMEDIATE` transaction.
///
/// Holds the handle's transaction lock for its lifetime. Statements issued
/// through the owning [`Db`] while the guard is alive run inside the
/// transaction. Dropping the guard without committing rolls back.
pub struct TxGuard {
    db: Db,
    _guard: OwnedMutexGuard<()>,
    open: bool,
}

impl TxGuard {
    /// Opens a named savepoint inside the transaction.
    pub async fn savepoint(&self, name: &str) -> Result<()> {
        self.db.exec_batch(&format!("SAVEPOINT {name}")).await
    }

    /// Releases a savepoint, keeping its changes.
    pub async fn release(&self, name: &str) -> Result<()> {
        self.db.exec_batch(&format!("RELEASE {name}")).await
    }

    /// Rolls back to a savepoint, discarding its changes but keeping the
    /// enclosing transaction open. The savepoint is released afterwards.
    pub async fn rollback_to(&self, name: &str) -> Result<()> {
        self.db.exec_batch(&format!("ROLLBACK TO {name}")).await?;
        self.db.exec_batch(&format!("RELEASE {name}")).await
    }

    /// Commits the transaction.
    pub async fn commit(mut self) -> Result<()> {
        self.open = false;
        match self.db.exec_batch("COMMIT").await {
            Ok(()) => {
                self.db.note_commit();
                Ok(())
            }
            Err(e) => {
                let _ = self.db.exec_batch("ROLLBACK").await;
                Err(e)
            }
        }
    }

    /// Rolls the transaction back.
    pub async fn rollback(mut self) -> Result<()> {
        self.open = false;
        self.db.exec_batch("ROLLBACK").await
    }
}

impl Drop for TxGuard {
    fn drop(&mut self) {
        if self.open {
            let _ = self.db.with_conn(|conn| conn.execute_batch("ROLLBACK"));
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
