//! # Event-Sourcing Engine
//!
//! The engine owns the append-only queue, the models, and two connections
//! (read-write for replay and migrations, read-only for queries) and drives
//! every event through the replay pipeline inside one write transaction
//! with a savepoint:
//!
//! ```text
//! dispatch ──► queue.add ──► polling loop
//!                               │  BEGIN IMMEDIATE + SAVEPOINT
//!                               ▼
//!                 preprocess ─► reduce ─► apply ─► derive
//!                               │            │
//!                               │            └─ user_version = v  (top level)
//!                               ▼
//!                 sub-events, recursively, in order
//!                               │
//!                 RELEASE / ROLLBACK TO ─► event row updated ─► COMMIT
//!                               │
//!                               ▼
//!                 waiters on v resolved with the finished event
//! ```
//!
//! ## Invariants
//!
//! - Replay is strictly in increasing version order, one event at a time;
//!   a version is applied exactly once per database even with several
//!   engines (in this or other processes) sharing the file, enforced by
//!   re-checking `user_version` after taking the write lock.
//! - A failed event's side effects roll back to the savepoint; its row,
//!   error map, and consumed version survive.
//! - Phase errors never escape the engine: they are recorded on the event,
//!   and the event itself is the rejection value for waiting dispatchers.
//!
//! Phase functions must not call the model mutation surface (`set`,
//! `update`, `remove`): those dispatch and wait on the very transaction in
//! flight. Queue follow-up work with `PhaseCtx::add_event` instead.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use futures::future::{join_all, BoxFuture};
use serde_json::{json, Value as JsonValue};
use tokio::sync::oneshot;

use crate::db::{now_ms, Db};
use crate::error::{Error, Result};
use crate::esmodel::{DispatchFn, EsModel};
use crate::event::{Event, ModelDiff, ResultMap, SubEvent};
use crate::model::{ModelSpec, PhaseCtx};
use crate::queue::{EventQueue, QueueConfig, DEFAULT_WAIT_TIMEOUT};
use crate::table::DocumentTable;

// =============================================================================
// Options
// =============================================================================

/// Engine tunables. The defaults are sensible for production; tests shrink
/// the timeouts.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Ceiling on one queue wait before re-polling (cross-process pickup).
    pub wait_timeout: Duration,
    /// Maximum sub-event recursion depth.
    pub max_sub_event_depth: usize,
    /// Consecutive polling-loop failures tolerated before giving up.
    pub poll_retry_ceiling: u32,
    /// Backoff unit between polling-loop retries (multiplied by the
    /// consecutive-error count).
    pub poll_backoff_base: Duration,
    /// Fast-forward the queue's version sequence to at least this value at
    /// open, reconciling an externally-tracked version.
    pub known_version: Option<u64>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            max_sub_event_depth: 100,
            poll_retry_ceiling: 38,
            poll_backoff_base: Duration::from_secs(5),
            known_version: None,
        }
    }
}

// =============================================================================
// Engine
// =============================================================================

struct ModelEntry {
    name: String,
    spec: ModelSpec,
    /// Bound to the read-write connection; used by replay phases only.
    replay: EsModel,
    /// Bound to the read-only connection; handed to application code.
    public: EsModel,
}

#[derive(Default)]
struct PollState {
    running: bool,
    forever: bool,
    stop: bool,
    /// Highest version some waiter needs; drain-to-target mode polls until
    /// `user_version` reaches it.
    target: u64,
}

struct EngineCore {
    db: Db,
    rdb: Db,
    queue: EventQueue,
    models: OnceLock<Vec<ModelEntry>>,
    replay_map: OnceLock<Arc<HashMap<String, EsModel>>>,
    waiters: Mutex<BTreeMap<u64, Vec<oneshot::Sender<Event>>>>,
    poll: Mutex<PollState>,
    options: EngineOptions,
    stopped: AtomicBool,
    /// Non-zero once the polling loop exhausted its retry ceiling.
    fatal_attempts: AtomicU32,
}

/// The event-sourcing database handle. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    core: Arc<EngineCore>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("models", &self.core.models.get().map_or(0, Vec::len))
            .finish()
    }
}

impl Engine {
    /// Opens (creating if needed) the store at `path`, or an in-memory
    /// store, runs every model's migrations, and dispatches pending `init`
    /// seed events.
    pub async fn open(
        path: Option<&Path>,
        specs: Vec<ModelSpec>,
        options: EngineOptions,
    ) -> Result<Self> {
        let db = match path {
            Some(p) => Db::open(p)?,
            None => Db::open_in_memory()?,
        };

        let queue = EventQueue::open(
            db.clone(),
            QueueConfig { wait_timeout: options.wait_timeout },
        )
        .await?;
        if let Some(v) = options.known_version {
            queue.set_known_version(v).await?;
        }

        // In-memory stores share one connection; file stores get a second,
        // read-only connection that never sees uncommitted state. Opened
        // after the queue migration so the database file exists.
        let rdb = match path {
            Some(p) => Db::open_read_only(p)?,
            None => db.clone(),
        };

        let core = Arc::new(EngineCore {
            db: db.clone(),
            rdb: rdb.clone(),
            queue,
            models: OnceLock::new(),
            replay_map: OnceLock::new(),
            waiters: Mutex::new(BTreeMap::new()),
            poll: Mutex::new(PollState::default()),
            options,
            stopped: AtomicBool::new(false),
            fatal_attempts: AtomicU32::new(0),
        });

        // Model mutations dispatch back through the engine; a weak
        // reference keeps the models from pinning the core alive.
        let weak = Arc::downgrade(&core);
        let dispatch: DispatchFn = Arc::new(move |kind, data, ts| {
            let weak: Weak<EngineCore> = weak.clone();
            Box::pin(async move {
                let core = weak.upgrade().ok_or(Error::Stopped)?;
                Engine { core }.dispatch(&kind, data, ts).await
            })
        });

        let mut entries = Vec::with_capacity(specs.len());
        let mut replay_map = HashMap::with_capacity(specs.len());
        for spec in specs {
            let table = DocumentTable::create(db.clone(), &spec.name, spec.columns.clone()).await?;
            let public_table = table.with_db(rdb.clone());
            let replay = EsModel::new(&spec.name, table, dispatch.clone());
            let public = EsModel::new(&spec.name, public_table, dispatch.clone());
            replay_map.insert(spec.name.clone(), replay.clone());
            entries.push(ModelEntry { name: spec.name.clone(), spec, replay, public });
        }
        let _ = core.models.set(entries);
        let _ = core.replay_map.set(Arc::new(replay_map));

        let engine = Engine { core };
        engine.seed_init_models().await?;
        Ok(engine)
    }

    /// Dispatches each `init` model's seed event exactly once per database,
    /// recorded in the migration ledger.
    async fn seed_init_models(&self) -> Result<()> {
        self.core.db.ensure_migration_ledger().await?;
        let names: Vec<String> = self
            .models()
            .iter()
            .filter(|e| e.spec.init)
            .map(|e| e.name.clone())
            .collect();
        for name in names {
            let key = format!("init:{name}");
            if self.core.db.migration_done(&key).await? {
                continue;
            }
            self.dispatch("model-init", Some(json!({ "model": name })), None).await?;
            self.core.db.record_migration(&key, true).await?;
        }
        Ok(())
    }

    fn models(&self) -> &Vec<ModelEntry> {
        self.core.models.get().expect("models are set in open")
    }

    /// The read-only handle of a model, or `None` when undeclared.
    pub fn model(&self, name: &str) -> Option<EsModel> {
        self.models().iter().find(|e| e.name == name).map(|e| e.public.clone())
    }

    /// The event queue.
    pub fn queue(&self) -> &EventQueue {
        &self.core.queue
    }

    /// The durable "events up to this version have been applied" counter.
    pub async fn version(&self) -> Result<u64> {
        self.core.rdb.committed_user_version().await
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// Appends an event and waits for it to be durably applied, by this
    /// engine or any other process sharing the file. Resolves with the
    /// finished event record, or rejects with [`Error::EventFailed`]
    /// carrying it.
    pub async fn dispatch(
        &self,
        kind: &str,
        data: Option<JsonValue>,
        ts: Option<i64>,
    ) -> Result<Event> {
        if self.core.stopped.load(Ordering::Acquire) {
            let attempts = self.core.fatal_attempts.load(Ordering::Acquire);
            return Err(if attempts > 0 {
                Error::PollExhausted { attempts }
            } else {
                Error::Stopped
            });
        }
        let event = self.core.queue.add(kind, data, ts).await?;
        self.handled_version(event.v).await
    }

    /// Waits until version `v` has been applied and returns its event.
    ///
    /// Past versions resolve immediately from the queue record; future ones
    /// register a waiter and make sure the polling loop is running.
    pub async fn handled_version(&self, v: u64) -> Result<Event> {
        if self.core.rdb.committed_user_version().await? >= v {
            return self.finished_event(v).await;
        }

        let rx = {
            let mut waiters = self.core.waiters.lock().expect("waiter mutex poisoned");
            let (tx, rx) = oneshot::channel();
            waiters.entry(v).or_default().push(tx);
            rx
        };
        self.ensure_polling(Some(v));

        // The version may have landed between the first check and the
        // waiter registration.
        if self.core.rdb.committed_user_version().await? >= v {
            return self.finished_event(v).await;
        }

        match rx.await {
            Ok(event) if event.has_error() => Err(Error::EventFailed(Box::new(event))),
            Ok(event) => Ok(event),
            // The engine was dropped or gave up; the wait cannot resolve.
            Err(_) => Err(Error::Stopped),
        }
    }

    /// Alias of [`Engine::handled_version`] for read-your-writes callers.
    pub async fn wait_for_version(&self, v: u64) -> Result<Event> {
        self.handled_version(v).await
    }

    async fn finished_event(&self, v: u64) -> Result<Event> {
        match self.core.queue.get(v).await? {
            Some(e) if e.has_error() => Err(Error::EventFailed(Box::new(e))),
            Some(e) => Ok(e),
            None => Err(Error::Structural(format!("no event row for applied version {v}"))),
        }
    }

    // =========================================================================
    // Polling
    // =========================================================================

    /// Keeps replaying events indefinitely, observing other processes'
    /// writes as well. Without this, polling runs only while some
    /// dispatched version is outstanding.
    pub fn start_polling(&self) {
        {
            let mut poll = self.core.poll.lock().expect("poll mutex poisoned");
            poll.forever = true;
        }
        self.ensure_polling(None);
    }

    /// Cancels any in-progress queue wait and lets the polling loop exit
    /// after the event currently in flight. Pending waiters stay pending.
    pub fn stop_polling(&self) {
        {
            let mut poll = self.core.poll.lock().expect("poll mutex poisoned");
            poll.forever = false;
            poll.stop = true;
        }
        self.core.queue.cancel_next();
    }

    fn ensure_polling(&self, target: Option<u64>) {
        let mut poll = self.core.poll.lock().expect("poll mutex poisoned");
        if let Some(v) = target {
            poll.target = poll.target.max(v);
        }
        if poll.running {
            return;
        }
        poll.running = true;
        poll.stop = false;
        let core = Arc::clone(&self.core);
        tokio::spawn(poll_loop(core));
    }
}

// =============================================================================
// Polling Loop
// =============================================================================

async fn poll_loop(core: Arc<EngineCore>) {
    let mut consecutive_errors: u32 = 0;
    loop {
        match poll_once(&core).await {
            Ok(true) => consecutive_errors = 0,
            Ok(false) => return,
            Err(e) => {
                consecutive_errors += 1;
                if consecutive_errors >= core.options.poll_retry_ceiling {
                    tracing::error!(
                        error = %e,
                        attempts = consecutive_errors,
                        "event polling exhausted its retry ceiling; engine is stopping"
                    );
                    core.fatal_attempts.store(consecutive_errors, Ordering::Release);
                    core.stopped.store(true, Ordering::Release);
                    let mut poll = core.poll.lock().expect("poll mutex poisoned");
                    poll.running = false;
                    return;
                }
                tracing::warn!(
                    error = %e,
                    attempt = consecutive_errors,
                    "event polling failed, backing off"
                );
                tokio::time::sleep(core.options.poll_backoff_base * consecutive_errors).await;
                // A fresh connection recovers from lock contention or a
                // wedged handle; in-memory stores skip this.
                let reopened = match core.db.reopen().await {
                    Ok(()) => core.rdb.reopen().await,
                    Err(re) => Err(re),
                };
                if let Err(re) = reopened {
                    tracing::warn!(error = %re, "failed to reopen connections");
                }
            }
        }
    }
}

/// One polling iteration. `Ok(false)` means the loop should exit.
async fn poll_once(core: &Arc<EngineCore>) -> Result<bool> {
    let done = core.db.user_version().await?;
    resolve_waiters(core, done).await?;

    {
        let mut poll = core.poll.lock().expect("poll mutex poisoned");
        if poll.stop {
            poll.stop = false;
            poll.running = false;
            return Ok(false);
        }
        if !poll.forever && done >= poll.target {
            poll.running = false;
            return Ok(false);
        }
    }

    let Some(event) = core.queue.get_next(done, false).await? else {
        // Cancelled.
        let mut poll = core.poll.lock().expect("poll mutex poisoned");
        poll.stop = false;
        poll.running = false;
        return Ok(false);
    };
    if event.v > done {
        handle_event(core, event).await?;
    }
    Ok(true)
}

/// Resolves every waiter at or below `done` with its finished event.
async fn resolve_waiters(core: &Arc<EngineCore>, done: u64) -> Result<()> {
    let ready: Vec<(u64, Vec<oneshot::Sender<Event>>)> = {
        let mut waiters = core.waiters.lock().expect("waiter mutex poisoned");
        let keep = waiters.split_off(&(done + 1));
        std::mem::replace(&mut *waiters, keep).into_iter().collect()
    };
    for (v, senders) in ready {
        match core.queue.get(v).await {
            Ok(Some(event)) => {
                for tx in senders {
                    let _ = tx.send(event.clone());
                }
            }
            Ok(None) => {}
            Err(e) => {
                // Put the waiters back so the retry can resolve them.
                let mut waiters = core.waiters.lock().expect("waiter mutex poisoned");
                waiters.entry(v).or_default().extend(senders);
                return Err(e);
            }
        }
    }
    Ok(())
}

// =============================================================================
// Event Replay
// =============================================================================

/// Replays one top-level event inside a write transaction with a savepoint.
async fn handle_event(core: &Arc<EngineCore>, mut event: Event) -> Result<()> {
    let models = core.models.get().expect("models are set in open");

    // Fresh id counters for a new top-level event.
    for entry in models {
        entry.replay.reset_id_counter().await;
    }

    let tx = core.db.begin_immediate().await?;

    // Exactly-once across processes: someone else may have replayed this
    // version while we waited for the write lock.
    let done = core.db.user_version().await?;
    if done >= event.v {
        tx.rollback().await?;
        resolve_waiters(core, done).await?;
        return Ok(());
    }

    tx.savepoint("replay").await?;
    process_event(core, &mut event, 0).await;

    if event.has_error() {
        // Side effects are undone; the event row, its error annotation, and
        // the consumed version survive.
        tx.rollback_to("replay").await?;
        if let Some(result) = event.result.take() {
            if !result.is_empty() {
                event.failed_result = Some(result);
            }
        }
        core.db.set_user_version(event.v).await?;
        tracing::debug!(v = event.v, kind = %event.kind, error = %event.error_summary(), "event failed");
    } else {
        tx.release("replay").await?;
        tracing::debug!(v = event.v, kind = %event.kind, "event applied");
    }

    // The queue shares the read-write connection, so the write-back joins
    // this transaction.
    core.queue.set_event(&event).await?;
    tx.commit().await?;

    // The transaction produced a result or error: counters restart from
    // the true MAX(id) next time.
    for entry in models {
        entry.replay.reset_id_counter().await;
    }

    resolve_waiters(core, event.v).await
}

/// Runs the four-phase pipeline on one event (or sub-event). All failures
/// are recorded into the event's error map rather than returned.
fn process_event<'a>(
    core: &'a Arc<EngineCore>,
    event: &'a mut Event,
    depth: usize,
) -> BoxFuture<'a, ()> {
    Box::pin(async move {
        if depth > core.options.max_sub_event_depth {
            event.add_error(
                "_handle",
                json!(format!(
                    "sub-event recursion exceeded depth {}",
                    core.options.max_sub_event_depth
                )),
            );
            return;
        }

        let models = core.models.get().expect("models are set in open");
        let ctx = PhaseCtx::new(
            Arc::clone(core.replay_map.get().expect("replay map is set in open")),
            depth,
        );

        // ---- Phase 1: preprocess, in registration order ----
        for entry in models {
            if let Err(e) = entry.replay.default_preprocess(event).await {
                event.add_error(format!("_preprocess_{}", entry.name), json!(e.to_string()));
                return;
            }
            if let Some(pre) = &entry.spec.preprocessor {
                let (v, kind) = (event.v, event.kind.clone());
                match pre(entry.replay.clone(), event.clone(), ctx.clone()).await {
                    Ok(replaced) => {
                        if replaced.v != v || replaced.kind != kind {
                            event.add_error(
                                format!("_preprocess_{}", entry.name),
                                json!("preprocessor must preserve event version and type"),
                            );
                            return;
                        }
                        *event = replaced;
                    }
                    Err(e) => {
                        event.add_error(format!("_preprocess_{}", entry.name), json!(e.to_string()));
                        return;
                    }
                }
            }
        }

        // ---- Phase 2: reduce, cooperative fan-out ----
        // Ordering between independent models' reducers is not guaranteed;
        // each model's own diff is internally ordered.
        let reductions = join_all(models.iter().map(|entry| {
            let replay = entry.replay.clone();
            let custom = entry.spec.reducer.clone();
            let ev = event.clone();
            let ctx = ctx.clone();
            async move {
                if ev.kind == replay.crud_kind() {
                    replay.default_reduce(&ev).await
                } else if let Some(reduce) = custom {
                    reduce(replay, ev, ctx).await
                } else {
                    Ok(ModelDiff::none())
                }
            }
        }))
        .await;

        let mut diffs: Vec<ModelDiff> = Vec::with_capacity(models.len());
        let mut reduce_failed = false;
        for (entry, outcome) in models.iter().zip(reductions) {
            match outcome {
                Ok(diff) => diffs.push(diff),
                Err(e) => {
                    event.add_error(format!("_reduce_{}", entry.name), json!(e.to_string()));
                    reduce_failed = true;
                    diffs.push(ModelDiff::none());
                }
            }
        }
        if reduce_failed {
            return;
        }

        // Per-model outcomes; sub-events live on the event, not the result.
        let mut result = ResultMap::new();
        for (entry, diff) in models.iter().zip(&diffs) {
            if !diff.is_empty() {
                let mut stored = diff.clone();
                stored.events.clear();
                match serde_json::to_value(&stored) {
                    Ok(v) => {
                        result.insert(entry.name.clone(), v);
                    }
                    Err(e) => {
                        event.add_error(format!("_reduce_{}", entry.name), json!(e.to_string()));
                        return;
                    }
                }
            }
        }
        if !result.is_empty() {
            event.result = Some(result);
        }

        // ---- Phase 3: apply, then the durability checkpoint, then derive ----
        for (entry, diff) in models.iter().zip(&diffs) {
            if diff.has_ops() {
                if let Err(e) = entry.replay.apply_diff(diff).await {
                    event.add_error("_apply_apply", json!(format!("{}: {e}", entry.name)));
                    return;
                }
            }
        }

        if depth == 0 {
            if let Err(e) = core.db.set_user_version(event.v).await {
                event.add_error("_apply_version", json!(e.to_string()));
                return;
            }
        }

        let derivations = join_all(
            models
                .iter()
                .zip(&diffs)
                .filter(|(entry, _)| entry.spec.deriver.is_some())
                .map(|(entry, diff)| {
                    let derive = entry.spec.deriver.clone().expect("filtered on deriver");
                    let replay = entry.replay.clone();
                    let ev = event.clone();
                    let ctx = ctx.clone();
                    let applied = (!diff.is_empty())
                        .then(|| serde_json::to_value(diff).ok())
                        .flatten();
                    let name = entry.name.clone();
                    async move { (name, derive(replay, ev, ctx, applied).await) }
                }),
        )
        .await;
        for (name, outcome) in derivations {
            if let Err(e) = outcome {
                event.add_error("_apply_derive", json!(format!("{name}: {e}")));
            }
        }
        if event.has_error() {
            return;
        }

        // ---- Phase 4: sub-events, strictly left to right ----
        let mut pending: Vec<SubEvent> = Vec::new();
        for diff in &diffs {
            pending.extend(diff.events.iter().cloned());
        }
        pending.extend(ctx.drain_sub_events());

        for sub in pending {
            let mut child = Event::sub_event(event.v, sub.kind, sub.data, now_ms());
            process_event(core, &mut child, depth + 1).await;
            let child_failed = child.has_error();
            event.push_sub_event(child);
            if child_failed {
                // First failure stops the remaining siblings.
                event.add_error("_handle", json!("sub-event failed"));
                return;
            }
        }
    })
}

// =============================================================================
// Tests
// =============================================================================
