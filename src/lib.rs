//! # tidedb: Embedded Event-Sourcing Database on SQLite
//!
//! tidedb is an embedded, single-writer event-sourcing database. Application
//! state is a set of derived document tables ("models"); state never changes
//! by direct mutation, only by appending immutable events to an ordered log
//! and atomically replaying each event through per-model preprocessors,
//! reducers, and derivers.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Application Code                            │
//! │        dispatch(type, data)  ·  model reads  ·  model.set       │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Engine (replay loop)                       │
//! │                                                                 │
//! │  ┌─────────────┐  ┌──────────────┐  ┌───────────────────────┐  │
//! │  │ Event Queue │  │ Transaction  │  │ preprocess → reduce   │  │
//! │  │ (AUTOINCR.) │  │ + SAVEPOINT  │  │ → apply → derive      │  │
//! │  └─────────────┘  └──────────────┘  │ → sub-events (rec.)   │  │
//! │                                     └───────────────────────┘  │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                   SQLite (rw + read-only conn)                  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **Append-only log**: event versions strictly increase and are never
//!    reused; same-process `add` order matches call order.
//! 2. **Exactly-once replay**: `user_version` is the durable checkpoint
//!    "events up to V have been applied"; every event is applied exactly
//!    once per database, even with several processes sharing the file.
//! 3. **All-or-nothing events**: a failed event's side effects roll back to
//!    a savepoint; its row, error map, and consumed version survive.
//! 4. **Deterministic identity**: replaying a preprocessed event reassigns
//!    the same ids, so a crash-retry never drifts.
//! 5. **Documents never drift**: dedicated columns and the JSON blob are
//!    derived from the same object in the same write.
//!
//! ## Module Organization
//!
//! - [`error`]: the crate-wide error enum and `Result` alias
//! - [`db`]: SQLite access (busy retry, transactions/savepoints, version
//!   counters, migration ledger)
//! - [`column`]: declarative column descriptors resolved into SQL strategies
//! - [`cursor`]: opaque keyset-pagination tokens
//! - [`table`]: the JSON document table (CRUD, search, aggregates)
//! - [`cache`]: request-scoped row-lookup cache
//! - [`queue`]: the append-only event log with cooperative waiting
//! - [`event`]: event records and reducer diffs (the durable wire format)
//! - [`model`]: model specifications and phase-function types
//! - [`esmodel`]: the event-sourced document table (mutations as events)
//! - [`engine`]: the dispatcher and transactional replay pipeline

pub mod cache;
pub mod column;
pub mod cursor;
pub mod db;
pub mod engine;
pub mod error;
pub mod esmodel;
pub mod event;
pub mod model;
pub mod queue;
pub mod table;

pub use cache::RowCache;
pub use column::{ColumnDef, ColumnKind, IndexMode, SqlType};
pub use db::{Db, Migration, SqlValue};
pub use engine::{Engine, EngineOptions};
pub use error::{Error, Result};
pub use esmodel::{DocAction, EsModel};
pub use event::{Event, ModelDiff, SubEvent};
pub use model::{DeriverFn, ModelSpec, PhaseCtx, PreprocessorFn, ReducerFn};
pub use queue::{EventQueue, QueueConfig};
pub use table::{DocumentTable, EachOptions, SearchOptions, SearchResult, SortDir};
