//! # Event-Sourced Document Tables
//!
//! [`EsModel`] is the outward handle of one model: reads pass straight
//! through to the underlying [`DocumentTable`], while every mutation is
//! turned into a dispatched document event and only observed back after the
//! engine has replayed it. The writable inner table is touched directly only
//! by the engine's apply phase (and by migrations); the two concerns are
//! separate handles by composition, never a mode flag flipped on shared
//! state.
//!
//! Document events carry the payload `[action, id, obj, meta?]`. The
//! built-in preprocessor assigns the id (re-derived on every replay
//! attempt, so a retried event reproduces the same id instead of drifting)
//! and the built-in reducer turns the payload into a [`ModelDiff`] against
//! the previous stored object.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{json, Map as JsonMap, Value as JsonValue};
use tokio::sync::Mutex as AsyncMutex;

use crate::error::{Error, Result};
use crate::event::{Event, ModelDiff};
use crate::table::{json_key, DocumentTable, SearchOptions, SearchResult};

/// Dispatches an event through the owning engine and resolves with the
/// replayed record: `(type, data, ts)`.
pub type DispatchFn = Arc<
    dyn Fn(String, Option<JsonValue>, Option<i64>) -> BoxFuture<'static, Result<Event>>
        + Send
        + Sync,
>;

// =============================================================================
// Document Actions
// =============================================================================

/// The mutation intent carried in a document event payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocAction {
    Remove = 0,
    Set = 1,
    Insert = 2,
    Update = 3,
    Upsert = 4,
}

impl DocAction {
    pub fn as_i64(self) -> i64 {
        self as i64
    }

    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            0 => Some(DocAction::Remove),
            1 => Some(DocAction::Set),
            2 => Some(DocAction::Insert),
            3 => Some(DocAction::Update),
            4 => Some(DocAction::Upsert),
            _ => None,
        }
    }
}

// =============================================================================
// EsModel
// =============================================================================

struct EsInner {
    name: String,
    crud_kind: String,
    table: DocumentTable,
    dispatch: DispatchFn,
    /// High-water mark for [`EsModel::get_next_id`]; `None` re-seeds from
    /// the table's current MAX(id).
    id_hwm: AsyncMutex<Option<i64>>,
}

/// One model's event-sourced handle. Cheap to clone.
#[derive(Clone)]
pub struct EsModel {
    inner: Arc<EsInner>,
}

impl std::fmt::Debug for EsModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EsModel").field("name", &self.inner.name).finish()
    }
}

impl EsModel {
    pub(crate) fn new(name: &str, table: DocumentTable, dispatch: DispatchFn) -> Self {
        Self {
            inner: Arc::new(EsInner {
                name: name.to_string(),
                crud_kind: crud_kind(name),
                table,
                dispatch,
                id_hwm: AsyncMutex::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The event type this model's document mutations dispatch as.
    pub fn crud_kind(&self) -> &str {
        &self.inner.crud_kind
    }

    /// The underlying document table bound to this handle's connection.
    pub fn table(&self) -> &DocumentTable {
        &self.inner.table
    }

    // =========================================================================
    // Reads (passthrough)
    // =========================================================================

    pub async fn get(&self, id: &JsonValue) -> Result<Option<JsonValue>> {
        self.inner.table.get(id).await
    }

    pub async fn get_all(&self, ids: &[JsonValue]) -> Result<Vec<Option<JsonValue>>> {
        self.inner.table.get_all(ids).await
    }

    pub async fn search(&self, filter: &JsonValue, options: &SearchOptions) -> Result<SearchResult> {
        self.inner.table.search(filter, options).await
    }

    pub async fn count(&self, filter: &JsonValue) -> Result<u64> {
        self.inner.table.count(filter).await
    }

    pub async fn exists(&self, filter: &JsonValue) -> Result<bool> {
        self.inner.table.exists(filter).await
    }

    // =========================================================================
    // Mutations (dispatched as events)
    // =========================================================================

    /// Replaces (or creates) the object through a dispatched event and
    /// returns the authoritative post-replay state, since other logic may have
    /// further mutated it before this caller observes it.
    pub async fn set(&self, obj: &JsonValue) -> Result<Option<JsonValue>> {
        self.dispatch_change(DocAction::Set, obj.get("id").cloned(), obj.clone(), None)
            .await
    }

    /// Creates the object; the replay fails softly when the id exists.
    pub async fn insert(&self, obj: &JsonValue) -> Result<Option<JsonValue>> {
        self.dispatch_change(DocAction::Insert, obj.get("id").cloned(), obj.clone(), None)
            .await
    }

    /// Merges a partial object (explicit nulls delete fields). With
    /// `upsert`, a missing row is created instead of failing.
    pub async fn update(&self, partial: &JsonValue, upsert: bool) -> Result<Option<JsonValue>> {
        let id = partial.get("id").cloned();
        if !upsert && id.as_ref().map_or(true, JsonValue::is_null) {
            return Err(Error::Structural(format!(
                "model '{}': update requires an id",
                self.inner.name
            )));
        }
        let action = if upsert { DocAction::Upsert } else { DocAction::Update };
        self.dispatch_change(action, id, partial.clone(), None).await
    }

    /// Removes by id (or by the object's id). Missing rows are a no-op.
    pub async fn remove(&self, id_or_obj: &JsonValue) -> Result<()> {
        let id = if id_or_obj.is_object() {
            id_or_obj.get("id").cloned().unwrap_or(JsonValue::Null)
        } else {
            id_or_obj.clone()
        };
        self.dispatch_change(DocAction::Remove, Some(id), JsonValue::Null, None)
            .await?;
        Ok(())
    }

    /// Low-level form of the mutation path, with optional event metadata.
    pub async fn dispatch_change(
        &self,
        action: DocAction,
        id: Option<JsonValue>,
        obj: JsonValue,
        meta: Option<JsonValue>,
    ) -> Result<Option<JsonValue>> {
        let mut payload = vec![
            json!(action.as_i64()),
            id.unwrap_or(JsonValue::Null),
            obj,
        ];
        if let Some(meta) = meta {
            payload.push(meta);
        }

        let event =
            (self.inner.dispatch)(self.inner.crud_kind.clone(), Some(JsonValue::Array(payload)), None)
                .await?;

        // Soft conflict markers from the default reducer surface as typed
        // errors rather than engine failures.
        let assigned_id = event
            .data
            .as_ref()
            .and_then(|d| d.get(1))
            .cloned()
            .unwrap_or(JsonValue::Null);
        if let Some(result) = &event.result {
            if let Some(diff) = result.get(&self.inner.name) {
                if let Some(reason) = diff.get("fail").and_then(JsonValue::as_str) {
                    return Err(Error::DocumentConflict {
                        model: self.inner.name.clone(),
                        id: json_key(&assigned_id),
                        reason: reason.to_string(),
                    });
                }
            }
        }

        if action == DocAction::Remove {
            return Ok(None);
        }
        self.inner.table.get(&assigned_id).await
    }

    // =========================================================================
    // Id Assignation
    // =========================================================================

    /// The next free integer id, strictly increasing across calls within
    /// one replay attempt (including recursive sub-events of the same
    /// top-level event). The counter re-seeds from the table's true MAX(id)
    /// whenever it has been reset, so a retried event recomputes the same
    /// ids instead of accumulating a stale counter.
    pub async fn get_next_id(&self) -> Result<i64> {
        let mut hwm = self.inner.id_hwm.lock().await;
        let next = match *hwm {
            Some(n) => n + 1,
            None => {
                let max = self
                    .inner
                    .table
                    .max("id", &json!({}))
                    .await?
                    .as_i64()
                    .unwrap_or(0);
                max + 1
            }
        };
        *hwm = Some(next);
        Ok(next)
    }

    /// Forgets the id high-water mark. The engine calls this when a new
    /// top-level event begins and when the surrounding transaction produces
    /// a result or error.
    pub(crate) async fn reset_id_counter(&self) {
        *self.inner.id_hwm.lock().await = None;
    }

    // =========================================================================
    // Built-In Phases (engine side)
    // =========================================================================

    /// Assigns the document id into the event payload. Runs on every replay
    /// attempt; all branches are deterministic for a given table state.
    pub(crate) async fn default_preprocess(&self, event: &mut Event) -> Result<()> {
        if event.kind != self.inner.crud_kind {
            return Ok(());
        }
        let (action, _, obj, _) = parse_payload(&self.inner.name, event.data.as_ref())?;
        if action == DocAction::Remove {
            return Ok(());
        }

        // Explicit id, else the id column's value/slug function, else the
        // next free integer id.
        let id = match obj.get("id") {
            Some(explicit) if !explicit.is_null() => explicit.clone(),
            _ => match self.inner.table.derive_id(&obj).await? {
                Some(derived) => derived,
                None => json!(self.get_next_id().await?),
            },
        };
        if let Some(JsonValue::Array(payload)) = event.data.as_mut() {
            payload[1] = id;
        }
        Ok(())
    }

    /// Translates the document payload into a diff against the previous
    /// stored object.
    pub(crate) async fn default_reduce(&self, event: &Event) -> Result<ModelDiff> {
        if event.kind != self.inner.crud_kind {
            return Ok(ModelDiff::none());
        }
        let (action, id, obj, _) = parse_payload(&self.inner.name, event.data.as_ref())?;
        let prev = self.inner.table.get(&id).await?;

        Ok(match action {
            DocAction::Remove => match prev {
                Some(_) => ModelDiff::removing(id),
                None => ModelDiff::none(),
            },
            DocAction::Insert => match prev {
                Some(_) => ModelDiff::failing("exists"),
                None => ModelDiff::inserting(with_id(obj, &id)),
            },
            DocAction::Set => match prev {
                None => ModelDiff::inserting(with_id(obj, &id)),
                Some(prev) => diff_to_update(&prev, &with_id(obj, &id), true),
            },
            DocAction::Update => match prev {
                None => ModelDiff::failing("missing"),
                Some(prev) => diff_to_update(&prev, &with_id(obj, &id), false),
            },
            DocAction::Upsert => match prev {
                None => ModelDiff::inserting(strip_nulls(&with_id(obj, &id))),
                Some(prev) => diff_to_update(&prev, &with_id(obj, &id), false),
            },
        })
    }

    /// Applies one diff to the writable table with per-item failure
    /// isolation: one failing item does not block the others, and the first
    /// error is re-raised after all complete.
    pub(crate) async fn apply_diff(&self, diff: &ModelDiff) -> Result<()> {
        let table = &self.inner.table;
        let mut first_err: Option<Error> = None;
        let mut note = |r: Result<()>| {
            if let Err(e) = r {
                first_err.get_or_insert(e);
            }
        };

        for id in &diff.remove {
            note(table.remove(id).await);
        }
        for obj in &diff.insert {
            note(table.set(obj, true, true).await.map(drop));
        }
        for obj in &diff.set {
            note(table.set(obj, false, true).await.map(drop));
        }
        for partial in &diff.update {
            note(table.update_no_trans(partial, false, true).await.map(drop));
        }
        for partial in &diff.upsert {
            note(table.update_no_trans(partial, true, true).await.map(drop));
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// The event type carrying document mutations for `name`.
pub fn crud_kind(name: &str) -> String {
    format!("doc/{name}")
}

// =============================================================================
// Payload and Diff Helpers
// =============================================================================

fn parse_payload(
    model: &str,
    data: Option<&JsonValue>,
) -> Result<(DocAction, JsonValue, JsonValue, Option<JsonValue>)> {
    let err = || Error::Structural(format!("model '{model}': malformed document event payload"));
    let arr = data.and_then(JsonValue::as_array).ok_or_else(err)?;
    if arr.len() < 3 {
        return Err(err());
    }
    let action = arr[0].as_i64().and_then(DocAction::from_i64).ok_or_else(err)?;
    Ok((action, arr[1].clone(), arr[2].clone(), arr.get(3).cloned()))
}

fn with_id(mut obj: JsonValue, id: &JsonValue) -> JsonValue {
    if !obj.is_object() {
        obj = json!({});
    }
    if let Some(map) = obj.as_object_mut() {
        map.insert("id".to_string(), id.clone());
    }
    obj
}

fn strip_nulls(obj: &JsonValue) -> JsonValue {
    match obj.as_object() {
        Some(map) => JsonValue::Object(
            map.iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ),
        None => obj.clone(),
    }
}

/// Computes the update partial between the stored object and the incoming
/// one. Null-valued fields (and, for full replacement, omitted fields)
/// become explicit nulls. No change yields an empty diff.
fn diff_to_update(prev: &JsonValue, next: &JsonValue, full_replace: bool) -> ModelDiff {
    let empty = JsonMap::new();
    let prev_map = prev.as_object().unwrap_or(&empty);
    let next_map = next.as_object().unwrap_or(&empty);

    let mut partial = JsonMap::new();
    for (k, v) in next_map {
        if v.is_null() {
            if prev_map.contains_key(k) {
                partial.insert(k.clone(), JsonValue::Null);
            }
        } else if prev_map.get(k) != Some(v) {
            partial.insert(k.clone(), v.clone());
        }
    }
    if full_replace {
        for k in prev_map.keys() {
            if !next_map.contains_key(k) {
                partial.insert(k.clone(), JsonValue::Null);
            }
        }
    }

    if partial.is_empty() {
        return ModelDiff::none();
    }
    if let Some(id) = next_map.get("id") {
        partial.insert("id".to_string(), id.clone());
    }
    ModelDiff::updating(JsonValue::Object(partial))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::{ColumnDef, SqlType};
    use crate::db::Db;

    fn no_dispatch() -> DispatchFn {
        Arc::new(|_, _, _| Box::pin(async { Err(Error::Stopped) }))
    }

    async fn replay_model() -> EsModel {
        let db = Db::open_in_memory().unwrap();
        let table = DocumentTable::create(
            db,
            "things",
            vec![ColumnDef::real("id", SqlType::Integer)],
        )
        .await
        .unwrap();
        EsModel::new("things", table, no_dispatch())
    }

    fn crud_event(model: &EsModel, action: DocAction, id: JsonValue, obj: JsonValue) -> Event {
        let mut e = Event::new(model.crud_kind(), Some(json!([action.as_i64(), id, obj])), 0);
        e.v = 1;
        e
    }

    #[test]
    fn test_action_roundtrip() {
        for action in [
            DocAction::Remove,
            DocAction::Set,
            DocAction::Insert,
            DocAction::Update,
            DocAction::Upsert,
        ] {
            assert_eq!(DocAction::from_i64(action.as_i64()), Some(action));
        }
        assert!(DocAction::from_i64(9).is_none());
    }

    #[test]
    fn test_diff_to_update_replacement_nulls_omitted_fields() {
        let prev = json!({"id": 1, "a": 1, "b": 2});
        let next = json!({"id": 1, "a": 1, "c": 3});
        let diff = diff_to_update(&prev, &next, true);
        assert_eq!(diff.update, vec![json!({"id": 1, "b": null, "c": 3})]);

        // Identical objects produce no update at all.
        assert!(diff_to_update(&prev, &prev.clone(), true).is_empty());
    }

    #[test]
    fn test_diff_to_update_partial_keeps_omitted_fields() {
        let prev = json!({"id": 1, "a": 1, "b": 2});
        let partial = json!({"id": 1, "b": null, "c": 3});
        let diff = diff_to_update(&prev, &partial, false);
        assert_eq!(diff.update, vec![json!({"id": 1, "b": null, "c": 3})]);

        // Nulling a field that never existed changes nothing.
        let diff = diff_to_update(&prev, &json!({"id": 1, "zz": null}), false);
        assert!(diff.is_empty());
    }

    #[tokio::test]
    async fn test_default_preprocess_assigns_and_reassigns_ids() {
        let model = replay_model().await;
        let mut event = crud_event(&model, DocAction::Insert, JsonValue::Null, json!({"x": 1}));

        model.default_preprocess(&mut event).await.unwrap();
        assert_eq!(event.data.as_ref().unwrap()[1], json!(1));

        // Retry after rollback: counter reset, same table state, same id.
        model.reset_id_counter().await;
        model.default_preprocess(&mut event).await.unwrap();
        assert_eq!(event.data.as_ref().unwrap()[1], json!(1));

        // Explicit ids pass through untouched.
        let mut explicit =
            crud_event(&model, DocAction::Set, JsonValue::Null, json!({"id": 42, "x": 1}));
        model.default_preprocess(&mut explicit).await.unwrap();
        assert_eq!(explicit.data.as_ref().unwrap()[1], json!(42));
    }

    #[tokio::test]
    async fn test_get_next_id_monotone_until_reset() {
        let model = replay_model().await;
        model.table().set(&json!({"id": 7}), false, true).await.unwrap();

        assert_eq!(model.get_next_id().await.unwrap(), 8);
        assert_eq!(model.get_next_id().await.unwrap(), 9);

        model.reset_id_counter().await;
        assert_eq!(model.get_next_id().await.unwrap(), 8);
    }

    #[tokio::test]
    async fn test_default_reduce_soft_failures() {
        let model = replay_model().await;
        model.table().set(&json!({"id": 1, "a": 1}), false, true).await.unwrap();

        let exists = model
            .default_reduce(&crud_event(&model, DocAction::Insert, json!(1), json!({"a": 2})))
            .await
            .unwrap();
        assert_eq!(exists.fail.as_deref(), Some("exists"));

        let missing = model
            .default_reduce(&crud_event(&model, DocAction::Update, json!(9), json!({"a": 2})))
            .await
            .unwrap();
        assert_eq!(missing.fail.as_deref(), Some("missing"));
    }

    #[tokio::test]
    async fn test_default_reduce_remove_and_set() {
        let model = replay_model().await;
        model.table().set(&json!({"id": 1, "a": 1}), false, true).await.unwrap();

        let rm = model
            .default_reduce(&crud_event(&model, DocAction::Remove, json!(1), JsonValue::Null))
            .await
            .unwrap();
        assert_eq!(rm.remove, vec![json!(1)]);

        let rm_missing = model
            .default_reduce(&crud_event(&model, DocAction::Remove, json!(9), JsonValue::Null))
            .await
            .unwrap();
        assert!(rm_missing.is_empty());

        // Set over an identical object is a no-op diff.
        let same = model
            .default_reduce(&crud_event(&model, DocAction::Set, json!(1), json!({"a": 1})))
            .await
            .unwrap();
        assert!(same.is_empty());
    }

    #[tokio::test]
    async fn test_apply_diff_isolation() {
        let model = replay_model().await;
        model.table().set(&json!({"id": 1}), false, true).await.unwrap();
        model.table().set(&json!({"id": 2}), false, true).await.unwrap();

        // The insert collides; the remove and upsert still apply, and the
        // first error is re-raised after all items ran.
        let diff = ModelDiff {
            remove: vec![json!(1)],
            insert: vec![json!({"id": 2})],
            upsert: vec![json!({"id": 3, "b": 2})],
            ..ModelDiff::default()
        };
        let err = model.apply_diff(&diff).await.unwrap_err();
        assert!(matches!(err, Error::Sqlite(_)));
        assert!(model.table().get(&json!(1)).await.unwrap().is_none());
        assert!(model.table().get(&json!(2)).await.unwrap().is_some());
        assert_eq!(model.table().get(&json!(3)).await.unwrap().unwrap()["b"], 2);
    }
}
