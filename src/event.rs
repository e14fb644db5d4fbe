//! # Event Records and Model Diffs
//!
//! [`Event`] is the durable wire format of the log: it is persisted as-is,
//! exposed to callers, and must stay stable across versions for replay
//! compatibility. [`ModelDiff`] is a reducer's declarative output, applied
//! to that model's document table during the apply phase.
//!
//! ## Invariants
//!
//! - `v` is assigned exactly once at insertion and never reused; sub-events
//!   carry their parent's `v`.
//! - Preprocessors and reducers may replace the event record but must
//!   preserve `v` and `type`.
//! - An event with a non-empty `error` map contributed no durable state
//!   change; any partial result is relabeled `failedResult`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

// =============================================================================
// Event
// =============================================================================

/// Per-phase error annotations, keyed by stable tags such as
/// `_preprocess_<model>`, `_reduce_<model>`, `_apply_<phase>`, `_handle`.
pub type ErrorMap = BTreeMap<String, JsonValue>;

/// Per-model outcome annotations, keyed by model name.
pub type ResultMap = BTreeMap<String, JsonValue>;

/// An immutable, versioned log entry describing an intended state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic version, primary key in the queue. Gap-tolerant.
    pub v: u64,

    /// The event type, routing it to reducers.
    #[serde(rename = "type")]
    pub kind: String,

    /// Milliseconds since the Unix epoch.
    pub ts: i64,

    /// Arbitrary JSON payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,

    /// Per-model diff outcomes, written back after a successful replay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ResultMap>,

    /// Per-phase errors. Non-empty means the event's transaction was rolled
    /// back (or, for a sub-event, that it aborted its parent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorMap>,

    /// Sub-events, in the order they were enqueued. Each shares this `v`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub events: Option<Vec<Event>>,

    /// The partial result of a failed replay, kept for diagnosis.
    #[serde(default, rename = "failedResult", skip_serializing_if = "Option::is_none")]
    pub failed_result: Option<ResultMap>,
}

impl Event {
    /// A fresh, not-yet-persisted event. The queue assigns `v` on insert.
    pub fn new(kind: impl Into<String>, data: Option<JsonValue>, ts: i64) -> Self {
        Self {
            v: 0,
            kind: kind.into(),
            ts,
            data,
            result: None,
            error: None,
            events: None,
            failed_result: None,
        }
    }

    /// A sub-event inheriting its parent's version.
    pub fn sub_event(parent_v: u64, kind: impl Into<String>, data: Option<JsonValue>, ts: i64) -> Self {
        let mut e = Self::new(kind, data, ts);
        e.v = parent_v;
        e
    }

    /// True when this event (not its children) recorded an error.
    pub fn has_error(&self) -> bool {
        self.error.as_ref().is_some_and(|m| !m.is_empty())
    }

    /// True when this event or any nested sub-event recorded an error.
    pub fn failed(&self) -> bool {
        self.deepest_error().is_some()
    }

    /// Walks the sub-event tree to the deepest event carrying an error.
    ///
    /// Dispatch callers use this to tell "my input was rejected" apart from
    /// "an unrelated nested event crashed".
    pub fn deepest_error(&self) -> Option<&Event> {
        if let Some(children) = &self.events {
            for child in children {
                if let Some(deep) = child.deepest_error() {
                    return Some(deep);
                }
            }
        }
        if self.has_error() {
            Some(self)
        } else {
            None
        }
    }

    /// Short human-readable summary of the error map, for messages and logs.
    pub fn error_summary(&self) -> String {
        let Some(deep) = self.deepest_error() else {
            return "no error".to_string();
        };
        let map = deep.error.as_ref().expect("deepest_error implies error map");
        map.iter()
            .map(|(tag, v)| match v {
                JsonValue::String(s) => format!("{tag}: {s}"),
                other => format!("{tag}: {other}"),
            })
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// Records a phase error under its tag.
    pub fn add_error(&mut self, tag: impl Into<String>, value: JsonValue) {
        self.error.get_or_insert_with(BTreeMap::new).insert(tag.into(), value);
    }

    /// Appends a sub-event.
    pub fn push_sub_event(&mut self, event: Event) {
        self.events.get_or_insert_with(Vec::new).push(event);
    }
}

// =============================================================================
// Sub-Events
// =============================================================================

/// A sub-event requested by a reducer, preprocessor, or deriver, queued for
/// recursive replay before the parent event completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
}

impl SubEvent {
    pub fn new(kind: impl Into<String>, data: Option<JsonValue>) -> Self {
        Self { kind: kind.into(), data }
    }
}

// =============================================================================
// Model Diffs
// =============================================================================

/// A reducer's declarative output for one model.
///
/// Being a closed struct, a misspelled operation cannot exist; JSON coming
/// from persisted results additionally rejects unknown keys on deserialize.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelDiff {
    /// Ids to delete. Missing ids are a no-op.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remove: Vec<JsonValue>,

    /// Full objects to insert; fails on id collision.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub insert: Vec<JsonValue>,

    /// Full objects to insert-or-replace.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub set: Vec<JsonValue>,

    /// Partial objects merged onto existing rows.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub update: Vec<JsonValue>,

    /// Partial objects merged onto existing rows, inserted when missing.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub upsert: Vec<JsonValue>,

    /// Sub-events to enqueue after this model's diff is collected.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<SubEvent>,

    /// Soft conflict marker from the default document reducer
    /// (`"exists"`, `"missing"`). Surfaced to the dispatching caller as a
    /// document conflict, not an engine error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail: Option<String>,
}

impl ModelDiff {
    /// A diff that changes nothing.
    pub fn none() -> Self {
        Self::default()
    }

    /// True when applying this diff would do nothing and it carries no
    /// sub-events or failure marker.
    pub fn is_empty(&self) -> bool {
        self.remove.is_empty()
            && self.insert.is_empty()
            && self.set.is_empty()
            && self.update.is_empty()
            && self.upsert.is_empty()
            && self.events.is_empty()
            && self.fail.is_none()
    }

    /// True when the diff has row operations to apply.
    pub fn has_ops(&self) -> bool {
        !(self.remove.is_empty()
            && self.insert.is_empty()
            && self.set.is_empty()
            && self.update.is_empty()
            && self.upsert.is_empty())
    }

    pub fn removing(id: JsonValue) -> Self {
        Self { remove: vec![id], ..Self::default() }
    }

    pub fn updating(partial: JsonValue) -> Self {
        Self { update: vec![partial], ..Self::default() }
    }

    pub fn inserting(obj: JsonValue) -> Self {
        Self { insert: vec![obj], ..Self::default() }
    }

    pub fn failing(reason: impl Into<String>) -> Self {
        Self { fail: Some(reason.into()), ..Self::default() }
    }
}

// =============================================================================
// Tests
// =============================================================================
