//! End-to-end behavior of event-sourced document models: every mutation is
//! an event, and only replayed state is ever observed.

mod common;

use serde_json::json;
use tidedb::{Engine, Error};

use common::{fast_options, things_spec};

async fn open_things() -> Engine {
    Engine::open(None, vec![things_spec()], fast_options()).await.unwrap()
}

#[tokio::test]
async fn test_exists_flips_exactly_at_commit() {
    let engine = open_things().await;
    let things = engine.model("things").unwrap();

    assert!(!things.exists(&json!({"id": 7})).await.unwrap());
    things.set(&json!({"id": 7, "rank": 1})).await.unwrap();
    assert!(things.exists(&json!({"id": 7})).await.unwrap());
}

#[tokio::test]
async fn test_remove_missing_resolves_and_changes_nothing() {
    let engine = open_things().await;
    let things = engine.model("things").unwrap();

    things.set(&json!({"id": 1})).await.unwrap();
    things.remove(&json!(999)).await.unwrap();
    assert_eq!(things.count(&json!({})).await.unwrap(), 1);
}

#[tokio::test]
async fn test_mutations_are_recorded_as_events() {
    let engine = open_things().await;
    let things = engine.model("things").unwrap();

    things.set(&json!({"id": 1, "rank": 5})).await.unwrap();
    things.remove(&json!(1)).await.unwrap();

    let first = engine.queue().get(1).await.unwrap().unwrap();
    assert_eq!(first.kind, "doc/things");
    let result = first.result.as_ref().unwrap();
    assert!(result.contains_key("things"));

    let second = engine.queue().get(2).await.unwrap().unwrap();
    assert_eq!(second.result.as_ref().unwrap()["things"]["remove"], json!([1]));
}

#[tokio::test]
async fn test_insert_conflict_and_update_missing() {
    let engine = open_things().await;
    let things = engine.model("things").unwrap();

    things.insert(&json!({"id": 1})).await.unwrap();
    let err = things.insert(&json!({"id": 1})).await.unwrap_err();
    assert!(matches!(err, Error::DocumentConflict { ref reason, .. } if reason == "exists"));

    let err = things.update(&json!({"id": 2, "rank": 1}), false).await.unwrap_err();
    assert!(matches!(err, Error::DocumentConflict { ref reason, .. } if reason == "missing"));

    // The conflicting events consumed versions but changed nothing.
    assert_eq!(engine.version().await.unwrap(), 3);
    assert_eq!(things.count(&json!({})).await.unwrap(), 1);
}

#[tokio::test]
async fn test_update_null_semantics_through_events() {
    let engine = open_things().await;
    let things = engine.model("things").unwrap();

    things.set(&json!({"id": 1, "rank": 1, "note": "keep"})).await.unwrap();

    let updated = things.update(&json!({"id": 1, "note": null}), false).await.unwrap().unwrap();
    assert!(updated.get("note").is_none());
    assert_eq!(updated["rank"], 1);

    // A no-change set produces an event with an empty outcome.
    let before = engine.version().await.unwrap();
    things.set(&json!({"id": 1, "rank": 1})).await.unwrap();
    assert_eq!(engine.version().await.unwrap(), before + 1);
}

#[tokio::test]
async fn test_ids_assigned_sequentially_without_explicit_id() {
    let engine = open_things().await;
    let things = engine.model("things").unwrap();

    let a = things.insert(&json!({"rank": 1})).await.unwrap().unwrap();
    let b = things.insert(&json!({"rank": 2})).await.unwrap().unwrap();
    assert_eq!(a["id"], 1);
    assert_eq!(b["id"], 2);

    // Explicit ids are respected and the sequence continues past them.
    things.insert(&json!({"id": 10, "rank": 3})).await.unwrap();
    let c = things.insert(&json!({"rank": 4})).await.unwrap().unwrap();
    assert_eq!(c["id"], 11);
}

#[tokio::test]
async fn test_upsert_creates_then_merges() {
    let engine = open_things().await;
    let things = engine.model("things").unwrap();

    let created = things.update(&json!({"id": 5, "rank": 1}), true).await.unwrap().unwrap();
    assert_eq!(created["rank"], 1);

    let merged = things.update(&json!({"id": 5, "extra": "x"}), true).await.unwrap().unwrap();
    assert_eq!(merged["rank"], 1);
    assert_eq!(merged["extra"], "x");
}
