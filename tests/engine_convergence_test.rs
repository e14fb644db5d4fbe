//! Two engine instances sharing one database file must replay every event
//! exactly once between them and converge to identical state.

mod common;

use futures::future::join_all;
use serde_json::json;
use tidedb::Engine;

use common::{counter_spec, fast_options, open_counter_engine};

#[tokio::test]
async fn test_two_engines_one_file_converge() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shared.db");

    let a = open_counter_engine(&path).await;
    let b = open_counter_engine(&path).await;

    // 100 events dispatched concurrently from both instances.
    let ticks_a = join_all((0..50).map(|_| {
        let a = a.clone();
        async move { a.dispatch("tick", None, None).await }
    }));
    let ticks_b = join_all((0..50).map(|_| {
        let b = b.clone();
        async move { b.dispatch("tick", None, None).await }
    }));
    let (ra, rb) = tokio::join!(ticks_a, ticks_b);
    for r in ra.into_iter().chain(rb) {
        r.expect("every tick should apply");
    }

    // Both instances see the same durable version and the same total.
    let va = a.version().await.unwrap();
    let vb = b.version().await.unwrap();
    assert_eq!(va, 100);
    assert_eq!(vb, 100);

    let ta = a.model("counter").unwrap().get(&json!("c")).await.unwrap().unwrap();
    let tb = b.model("counter").unwrap().get(&json!("c")).await.unwrap().unwrap();
    assert_eq!(ta["total"], 100);
    assert_eq!(tb["total"], 100);

    a.stop_polling();
    b.stop_polling();
}

#[tokio::test]
async fn test_follower_observes_other_instances_events() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("follow.db");

    let writer = open_counter_engine(&path).await;
    let follower = open_counter_engine(&path).await;
    follower.start_polling();

    writer.dispatch("tick", None, None).await.unwrap();
    writer.dispatch("tick", None, None).await.unwrap();

    // The follower picks the events up via its polling timeout, with no
    // dispatch of its own.
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
    loop {
        if follower.version().await.unwrap() >= 2 {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "follower never caught up");
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    let total = follower.model("counter").unwrap().get(&json!("c")).await.unwrap().unwrap();
    assert_eq!(total["total"], 2);

    writer.stop_polling();
    follower.stop_polling();
}

#[tokio::test]
async fn test_restart_preserves_version_and_state() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("restart.db");

    {
        let engine = open_counter_engine(&path).await;
        for _ in 0..3 {
            engine.dispatch("tick", None, None).await.unwrap();
        }
        engine.stop_polling();
    }

    let engine = open_counter_engine(&path).await;
    assert_eq!(engine.version().await.unwrap(), 3);
    let total = engine.model("counter").unwrap().get(&json!("c")).await.unwrap().unwrap();
    assert_eq!(total["total"], 3);

    // New events continue from the preserved sequence.
    let e = engine.dispatch("tick", None, None).await.unwrap();
    assert_eq!(e.v, 4);
    engine.stop_polling();
}

#[tokio::test]
async fn test_known_version_fast_forwards_sequence() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("legacy.db");

    let options = tidedb::EngineOptions { known_version: Some(500), ..fast_options() };
    let engine = Engine::open(Some(&path), vec![counter_spec()], options).await.unwrap();

    let e = engine.dispatch("tick", None, None).await.unwrap();
    assert_eq!(e.v, 501);
    engine.stop_polling();
}
