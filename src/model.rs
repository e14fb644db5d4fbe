//! # Model Definitions
//!
//! A [`ModelSpec`] declares one derived table: its columns plus the phase
//! functions the engine runs on every event: preprocessor, reducer,
//! deriver. Every model carries the built-in document phases (id
//! assignation and CRUD reduction for its own document events); the
//! functions declared here handle everything else.
//!
//! Phase functions are boxed async closures over owned, cheap-clone
//! arguments, so plain `move` closures work without lifetime gymnastics:
//!
//! ```text
//! preprocessor: (EsModel, Event, PhaseCtx) -> Event     (may replace the event)
//! reducer:      (EsModel, Event, PhaseCtx) -> ModelDiff (declarative diff)
//! deriver:      (EsModel, Event, PhaseCtx, diff) -> ()  (cross-model side effects)
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use serde_json::Value as JsonValue;

use crate::column::ColumnDef;
use crate::error::Result;
use crate::esmodel::EsModel;
use crate::event::{Event, ModelDiff, SubEvent};

// =============================================================================
// Phase Functions
// =============================================================================

/// Runs before reduction; may assign identity or reject the event. Must
/// preserve `v` and `type` and cause no side effects.
pub type PreprocessorFn =
    Arc<dyn Fn(EsModel, Event, PhaseCtx) -> BoxFuture<'static, Result<Event>> + Send + Sync>;

/// Computes this model's declarative diff for an event.
pub type ReducerFn =
    Arc<dyn Fn(EsModel, Event, PhaseCtx) -> BoxFuture<'static, Result<ModelDiff>> + Send + Sync>;

/// Runs after apply with read/write access to all models, for side effects
/// not representable as a diff. Receives the model's applied diff, if any.
pub type DeriverFn = Arc<
    dyn Fn(EsModel, Event, PhaseCtx, Option<JsonValue>) -> BoxFuture<'static, Result<()>>
        + Send
        + Sync,
>;

// =============================================================================
// Phase Context
// =============================================================================

/// Per-replay context handed to every phase function.
#[derive(Clone)]
pub struct PhaseCtx {
    models: Arc<HashMap<String, EsModel>>,
    sub_events: Arc<Mutex<Vec<SubEvent>>>,
    /// Sub-event recursion depth of the event being replayed (0 = top level).
    pub depth: usize,
}

impl PhaseCtx {
    pub(crate) fn new(models: Arc<HashMap<String, EsModel>>, depth: usize) -> Self {
        Self { models, sub_events: Arc::new(Mutex::new(Vec::new())), depth }
    }

    /// The writable replay handle of another model, for derivers.
    pub fn model(&self, name: &str) -> Option<EsModel> {
        self.models.get(name).cloned()
    }

    /// Enqueues a sub-event, replayed in order before the current event
    /// completes.
    pub fn add_event(&self, kind: impl Into<String>, data: Option<JsonValue>) {
        self.sub_events
            .lock()
            .expect("sub-event mutex poisoned")
            .push(SubEvent::new(kind, data));
    }

    /// Drains every sub-event queued so far, in insertion order.
    pub(crate) fn drain_sub_events(&self) -> Vec<SubEvent> {
        std::mem::take(&mut *self.sub_events.lock().expect("sub-event mutex poisoned"))
    }
}

// =============================================================================
// Model Specification
// =============================================================================

/// Declarative definition of one model, consumed by the engine at open.
#[derive(Clone)]
pub struct ModelSpec {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    pub preprocessor: Option<PreprocessorFn>,
    pub reducer: Option<ReducerFn>,
    pub deriver: Option<DeriverFn>,
    /// Dispatch a once-only seed event for this model at engine open.
    pub init: bool,
}

impl std::fmt::Debug for ModelSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelSpec")
            .field("name", &self.name)
            .field("columns", &self.columns.len())
            .field("reducer", &self.reducer.is_some())
            .field("preprocessor", &self.preprocessor.is_some())
            .field("deriver", &self.deriver.is_some())
            .field("init", &self.init)
            .finish()
    }
}

impl ModelSpec {
    /// A plain document model: built-in CRUD phases, no custom logic.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            preprocessor: None,
            reducer: None,
            deriver: None,
            init: false,
        }
    }

    pub fn columns(mut self, columns: Vec<ColumnDef>) -> Self {
        self.columns = columns;
        self
    }

    pub fn preprocessor(mut self, f: PreprocessorFn) -> Self {
        self.preprocessor = Some(f);
        self
    }

    pub fn reducer(mut self, f: ReducerFn) -> Self {
        self.reducer = Some(f);
        self
    }

    pub fn deriver(mut self, f: DeriverFn) -> Self {
        self.deriver = Some(f);
        self
    }

    pub fn init(mut self) -> Self {
        self.init = true;
        self
    }
}

// =============================================================================
// Tests
// =============================================================================
