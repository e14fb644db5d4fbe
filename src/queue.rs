//! # Event Queue
//!
//! An append-only, auto-incrementing log of [`Event`]s. Versions come from
//! SQLite's AUTOINCREMENT sequence and are never reused; gaps are permitted
//! (a failed event's version stays consumed).
//!
//! ## Ordering
//!
//! SQLite does not guarantee cross-call ordering between interleaved tasks,
//! so same-process `add` calls are serialized through one async lock:
//! insertion order matches call order, and returned versions are strictly
//! increasing in that order.
//!
//! ## Waiting
//!
//! `get_next` suspends cooperatively until a same-process `add` notifies it,
//! a timeout elapses (default 10 s, the re-poll ceiling that picks up
//! events written by *other* processes sharing the file, a tunable), or the
//! wait is cancelled.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value as JsonValue;
use tokio::sync::{Mutex as AsyncMutex, Notify};

use crate::db::{now_ms, Db, Migration, SqlRow, SqlValue};
use crate::error::Result;
use crate::event::Event;

/// Default ceiling on one `get_next` wait before re-polling.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

const SELECT_COLS: &str = "v, type, ts, data, result, error, events, failed_result";

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for an [`EventQueue`].
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Ceiling on one cooperative `get_next` wait.
    pub wait_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { wait_timeout: DEFAULT_WAIT_TIMEOUT }
    }
}

// =============================================================================
// Event Queue
// =============================================================================

struct QueueInner {
    db: Db,
    /// Serializes `add` so insertion order matches call order.
    add_lock: AsyncMutex<()>,
    /// Wakes in-process `get_next` waiters on `add`.
    added: Notify,
    /// Aborts in-flight `get_next` waits.
    cancelled: Notify,
    /// `(data_version, latest v)`, valid while data_version is unchanged.
    cached_latest: Mutex<Option<(u64, u64)>>,
    wait_timeout: Duration,
}

/// Handle to the append-only event log. Cheap to clone.
#[derive(Clone)]
pub struct EventQueue {
    inner: Arc<QueueInner>,
}

impl std::fmt::Debug for EventQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventQueue").finish()
    }
}

impl EventQueue {
    /// Opens the queue on `db`, creating the events table if missing.
    pub async fn open(db: Db, config: QueueConfig) -> Result<Self> {
        if !db.is_read_only() {
            db.run_migrations(&[Migration {
                key: "events:create".to_string(),
                sql: "CREATE TABLE IF NOT EXISTS events (
                        v             INTEGER PRIMARY KEY AUTOINCREMENT,
                        type          TEXT NOT NULL,
                        ts            INTEGER NOT NULL,
                        data          TEXT,
                        result        TEXT,
                        error         TEXT,
                        events        TEXT,
                        failed_result TEXT
                    )"
                .to_string(),
            }])
            .await?;
        }
        Ok(Self {
            inner: Arc::new(QueueInner {
                db,
                add_lock: AsyncMutex::new(()),
                added: Notify::new(),
                cancelled: Notify::new(),
                cached_latest: Mutex::new(None),
                wait_timeout: config.wait_timeout,
            }),
        })
    }

    /// The handle the queue reads and writes through.
    pub fn db(&self) -> &Db {
        &self.inner.db
    }

    // =========================================================================
    // Append
    // =========================================================================

    /// Appends an event; the storage engine assigns its version.
    pub async fn add(&self, kind: &str, data: Option<JsonValue>, ts: Option<i64>) -> Result<Event> {
        let ts = ts.unwrap_or_else(now_ms);
        let data_text = match &data {
            Some(v) => SqlValue::Text(serde_json::to_string(v)?),
            None => SqlValue::Null,
        };

        // Own transaction: the insert must never join a replay transaction
        // open on the shared connection, or a savepoint rollback there could
        // un-assign this version.
        let v = {
            let _ordered = self.inner.add_lock.lock().await;
            let tx = self.inner.db.begin_immediate().await?;
            let rowid = self
                .inner
                .db
                .exec_returning_rowid(
                    "INSERT INTO events (type, ts, data) VALUES (?, ?, ?)",
                    &[SqlValue::Text(kind.to_string()), SqlValue::Integer(ts), data_text],
                )
                .await?;
            tx.commit().await?;
            rowid
        } as u64;

        *self.inner.cached_latest.lock().expect("cache mutex poisoned") = None;
        self.inner.added.notify_waiters();

        let mut event = Event::new(kind, data, ts);
        event.v = v;
        Ok(event)
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// Fetches the event with exactly this version.
    pub async fn get(&self, v: u64) -> Result<Option<Event>> {
        let row = self
            .inner
            .db
            .query_one(
                &format!("SELECT {SELECT_COLS} FROM events WHERE v = ?"),
                &[SqlValue::Integer(v as i64)],
            )
            .await?;
        row.map(row_to_event).transpose()
    }

    /// The highest version known. Cached; the cache is invalidated whenever
    /// the storage engine's data-version counter moves, so an unchanged
    /// database never re-runs the MAX query.
    pub async fn latest_version(&self) -> Result<u64> {
        let dv = self.inner.db.data_version().await?;
        if let Some((cached_dv, latest)) =
            *self.inner.cached_latest.lock().expect("cache mutex poisoned")
        {
            if cached_dv == dv {
                return Ok(latest);
            }
        }
        let latest = self
            .inner
            .db
            .query_scalar("SELECT MAX(v) FROM events", &[])
            .await?
            .and_then(|v| v.as_i64())
            .unwrap_or(0) as u64;
        *self.inner.cached_latest.lock().expect("cache mutex poisoned") = Some((dv, latest));
        Ok(latest)
    }

    /// Returns the first event with version greater than `after`.
    ///
    /// With nothing available and `no_wait` false, suspends until an
    /// in-process `add`, the wait timeout (then re-polls; this is how other
    /// processes' events are observed), or [`EventQueue::cancel_next`],
    /// which resolves to `None`.
    pub async fn get_next(&self, after: u64, no_wait: bool) -> Result<Option<Event>> {
        loop {
            // Arm the wakeups before querying: an add landing between the
            // query and the wait is then never missed.
            let added = self.inner.added.notified();
            let cancelled = self.inner.cancelled.notified();
            tokio::pin!(added, cancelled);
            added.as_mut().enable();
            cancelled.as_mut().enable();

            let row = self
                .inner
                .db
                .query_one(
                    &format!("SELECT {SELECT_COLS} FROM events WHERE v > ? ORDER BY v LIMIT 1"),
                    &[SqlValue::Integer(after as i64)],
                )
                .await?;
            if let Some(row) = row {
                return Ok(Some(row_to_event(row)?));
            }
            if no_wait {
                return Ok(None);
            }

            tokio::select! {
                _ = &mut added => {}
                _ = &mut cancelled => return Ok(None),
                _ = tokio::time::sleep(self.inner.wait_timeout) => {}
            }
        }
    }

    /// Aborts any in-progress `get_next` wait; the waiters resolve to `None`.
    pub fn cancel_next(&self) {
        self.inner.cancelled.notify_waiters();
    }

    // =========================================================================
    // Write-Back and Sequencing
    // =========================================================================

    /// Persists a replayed event's final record (data, result, error,
    /// sub-events) onto its row. The version is never changed.
    pub async fn set_event(&self, event: &Event) -> Result<()> {
        let to_text = |v: Option<String>| v.map(SqlValue::Text).unwrap_or(SqlValue::Null);
        self.inner
            .db
            .exec(
                "UPDATE events
                 SET type = ?, ts = ?, data = ?, result = ?, error = ?, events = ?, failed_result = ?
                 WHERE v = ?",
                &[
                    SqlValue::Text(event.kind.clone()),
                    SqlValue::Integer(event.ts),
                    to_text(event.data.as_ref().map(serde_json::to_string).transpose()?),
                    to_text(event.result.as_ref().map(serde_json::to_string).transpose()?),
                    to_text(event.error.as_ref().map(serde_json::to_string).transpose()?),
                    to_text(event.events.as_ref().map(serde_json::to_string).transpose()?),
                    to_text(event.failed_result.as_ref().map(serde_json::to_string).transpose()?),
                    SqlValue::Integer(event.v as i64),
                ],
            )
            .await?;
        Ok(())
    }

    /// Fast-forwards the AUTOINCREMENT sequence to at least `v`, reconciling
    /// an externally-tracked version at startup. Idempotent; each statement
    /// is a single atomic adjustment, no transaction needed.
    pub async fn set_known_version(&self, v: u64) -> Result<()> {
        let v = SqlValue::Integer(v as i64);
        self.inner
            .db
            .exec(
                "INSERT INTO sqlite_sequence (name, seq)
                 SELECT 'events', ?1
                 WHERE NOT EXISTS (SELECT 1 FROM sqlite_sequence WHERE name = 'events')",
                std::slice::from_ref(&v),
            )
            .await?;
        self.inner
            .db
            .exec(
                "UPDATE sqlite_sequence SET seq = ?1 WHERE name = 'events' AND seq < ?1",
                &[v],
            )
            .await?;
        *self.inner.cached_latest.lock().expect("cache mutex poisoned") = None;
        Ok(())
    }
}

// =============================================================================
// Row Mapping
// =============================================================================

fn json_col(v: &SqlValue) -> Result<Option<JsonValue>> {
    match v {
        SqlValue::Text(s) => Ok(Some(serde_json::from_str(s)?)),
        _ => Ok(None),
    }
}

fn row_to_event(row: SqlRow) -> Result<Event> {
    let mut event = Event::new(
        row[1].as_str().unwrap_or_default(),
        json_col(&row[3])?,
        row[2].as_i64().unwrap_or(0),
    );
    event.v = row[0].as_i64().unwrap_or(0) as u64;
    event.result = json_col(&row[4])?.map(serde_json::from_value).transpose()?;
    event.error = json_col(&row[5])?.map(serde_json::from_value).transpose()?;
    event.events = json_col(&row[6])?.map(serde_json::from_value).transpose()?;
    event.failed_result = json_col(&row[7])?.map(serde_json::from_value).transpose()?;
    Ok(event)
}

// =============================================================================
// Tests
// =============================================================================
