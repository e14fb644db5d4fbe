//! # Error Handling for tidedb
//!
//! A single error enum ([`Error`]) covers every failure mode, with a
//! [`Result`] alias used throughout the crate.
//!
//! ## Error Categories
//!
//! | Category | Examples | Typical Response |
//! |----------|----------|------------------|
//! | Contention | `Busy` after retry exhaustion | Back off and retry the operation |
//! | Event outcome | `EventFailed`, `DocumentConflict` | Inspect the event's error map |
//! | Programmer | `UnknownColumn`, `ColumnConfig` | Fix the model definition |
//! | Structural | `RecursionLimit`, `Structural` | Fix the reducer/preprocessor |
//! | Internal | `Sqlite`, `Json` | Log and investigate |
//!
//! Phase errors (preprocess/reduce/apply/derive) are never variants here:
//! they are recorded on the event row's `error` map, and the whole event is
//! handed back inside [`Error::EventFailed`].

use thiserror::Error;

use crate::event::Event;

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in tidedb operations.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Storage contention
    // =========================================================================
    /// The database stayed locked through every retry attempt.
    ///
    /// Single statements and transaction begins each retry a bounded number
    /// of times with randomized backoff before surfacing this.
    #[error("database busy after {attempts} attempts")]
    Busy {
        /// How many attempts were made before giving up.
        attempts: u32,
    },

    // =========================================================================
    // Event outcomes
    // =========================================================================
    /// A dispatched event was replayed and recorded a non-empty error map.
    ///
    /// The full event is carried so callers can walk `event.events` down to
    /// the deepest error and distinguish their own rejected input from an
    /// unrelated concurrent failure.
    #[error("event v{} ({}) failed: {}", .0.v, .0.kind, .0.error_summary())]
    EventFailed(Box<Event>),

    /// The default document reducer rejected a mutation.
    ///
    /// Soft, expected outcomes: inserting an id that already exists, or
    /// updating one that does not.
    #[error("document conflict on {model}[{id}]: {reason}")]
    DocumentConflict {
        model: String,
        id: String,
        reason: String,
    },

    // =========================================================================
    // Structural errors (non-retryable)
    // =========================================================================
    /// Sub-event recursion exceeded the configured depth limit.
    #[error("sub-event recursion exceeded depth {depth}")]
    RecursionLimit { depth: usize },

    /// An event pipeline invariant was violated, e.g. a preprocessor mutated
    /// the event's version or type.
    #[error("structural error: {0}")]
    Structural(String),

    // =========================================================================
    // Programmer errors (thrown at call/configuration time)
    // =========================================================================
    /// A filter, sort, or lookup named a column the model does not declare.
    #[error("unknown column '{column}' on table '{table}'")]
    UnknownColumn { table: String, column: String },

    /// A write left a `required` column null.
    #[error("required column '{column}' on table '{table}' is null")]
    MissingRequired { table: String, column: String },

    /// An illegal column declaration (e.g. `unique` without `index`).
    #[error("column configuration error: {0}")]
    ColumnConfig(String),

    /// `change_id` was asked to move a row that does not exist.
    #[error("no row '{id}' in table '{table}'")]
    NotFound { table: String, id: String },

    // =========================================================================
    // Lifecycle
    // =========================================================================
    /// The engine or queue has been stopped; the operation cannot complete.
    #[error("store is stopped")]
    Stopped,

    /// The polling loop exhausted its retry ceiling and the engine is no
    /// longer making progress. Treated as fatal by callers.
    #[error("event polling failed {attempts} consecutive times, giving up")]
    PollExhausted { attempts: u32 },

    // =========================================================================
    // Internal errors
    // =========================================================================
    /// Any error from the underlying SQLite engine.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Serialization of a document, event payload, or cursor failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// True when the underlying SQLite error is lock/busy contention, the
    /// one class the call path retries automatically.
    pub fn is_busy(&self) -> bool {
        match self {
            Error::Busy { .. } => true,
            Error::Sqlite(e) => sqlite_is_busy(e),
            _ => false,
        }
    }
}

/// Distinguishes SQLITE_BUSY / SQLITE_LOCKED from every other SQLite error.
pub(crate) fn sqlite_is_busy(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error {
                code: rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked,
                ..
            },
            _,
        )
    )
}

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::DocumentConflict {
            model: "users".to_string(),
            id: "u1".to_string(),
            reason: "exists".to_string(),
        };
        assert_eq!(err.to_string(), "document conflict on users[u1]: exists");

        let err = Error::UnknownColumn {
            table: "posts".to_string(),
            column: "nope".to_string(),
        };
        assert_eq!(err.to_string(), "unknown column 'nope' on table 'posts'");

        let err = Error::Busy { attempts: 8 };
        assert!(err.is_busy());
    }

    #[test]
    fn test_sqlite_error_conversion() {
        let sqlite_err = rusqlite::Error::InvalidParameterName("test".to_string());
        let our_err: Error = sqlite_err.into();
        assert!(matches!(our_err, Error::Sqlite(_)));
        assert!(!our_err.is_busy());
    }
}
