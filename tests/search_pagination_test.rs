//! Search, cursor pagination, and iteration over a populated model.

mod common;

use serde_json::{json, Value as JsonValue};
use tidedb::{Engine, SearchOptions, SortDir};

use common::{fast_options, things_spec};

async fn seeded_engine(n: i64) -> Engine {
    let engine = Engine::open(None, vec![things_spec()], fast_options()).await.unwrap();
    let things = engine.model("things").unwrap();
    for i in 0..n {
        things.set(&json!({"id": i + 1, "rank": i % 7, "label": format!("row-{i}")})).await.unwrap();
    }
    engine
}

fn ids(items: &[JsonValue]) -> Vec<i64> {
    items.iter().map(|o| o["id"].as_i64().unwrap()).collect()
}

#[tokio::test]
async fn test_cursor_pages_equal_unbounded_search() {
    let engine = seeded_engine(31).await;
    let things = engine.model("things").unwrap();

    for dir in [SortDir::Asc, SortDir::Desc] {
        let all = things
            .search(
                &json!({}),
                &SearchOptions {
                    sort: vec![("rank".to_string(), dir), ("id".to_string(), SortDir::Asc)],
                    no_cursor: true,
                    ..SearchOptions::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(all.items.len(), 31);

        let mut opts = SearchOptions {
            sort: vec![("rank".to_string(), dir), ("id".to_string(), SortDir::Asc)],
            limit: Some(7),
            ..SearchOptions::default()
        };
        let mut paged = Vec::new();
        loop {
            let page = things.search(&json!({}), &opts).await.unwrap();
            assert!(page.items.len() <= 7);
            paged.extend(page.items);
            match page.cursor {
                Some(c) => opts.cursor = Some(c),
                None => break,
            }
        }

        assert_eq!(ids(&paged), ids(&all.items), "direction {dir:?}");
    }
}

#[tokio::test]
async fn test_total_and_filtered_pagination() {
    let engine = seeded_engine(20).await;
    let things = engine.model("things").unwrap();

    let page = things
        .search(
            &json!({"rank": 3}),
            &SearchOptions { limit: Some(2), ..SearchOptions::default() },
        )
        .await
        .unwrap();
    // Ranks cycle mod 7 over 20 rows: ids 4, 11, 18 have rank 3.
    assert_eq!(page.total, Some(3));
    assert_eq!(page.items.len(), 2);
    assert!(page.cursor.is_some());

    let rest = things
        .search(
            &json!({"rank": 3}),
            &SearchOptions { limit: Some(2), cursor: page.cursor, ..SearchOptions::default() },
        )
        .await
        .unwrap();
    assert_eq!(ids(&rest.items), vec![18]);
    assert!(rest.cursor.is_none());
}

#[tokio::test]
async fn test_each_streams_every_row() {
    let engine = seeded_engine(17).await;
    let things = engine.model("things").unwrap();

    let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = std::sync::Arc::clone(&seen);
    things
        .table()
        .each(
            &json!({}),
            tidedb::EachOptions { batch_size: 4, concurrency: 2 },
            move |obj| {
                let sink = std::sync::Arc::clone(&sink);
                async move {
                    sink.lock().unwrap().push(obj["id"].as_i64().unwrap());
                    Ok(())
                }
            },
        )
        .await
        .unwrap();

    let mut got = seen.lock().unwrap().clone();
    got.sort();
    assert_eq!(got, (1..=17).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_aggregates_and_get_all() {
    let engine = seeded_engine(10).await;
    let things = engine.model("things").unwrap();

    assert_eq!(things.table().max("id", &json!({})).await.unwrap(), json!(10));
    assert_eq!(things.table().min("rank", &json!({})).await.unwrap(), json!(0));
    assert_eq!(things.count(&json!({"rank": 2})).await.unwrap(), 2);

    let got = things.get_all(&[json!(3), json!(99), json!(1)]).await.unwrap();
    assert_eq!(got[0].as_ref().unwrap()["id"], 3);
    assert!(got[1].is_none());
    assert_eq!(got[2].as_ref().unwrap()["id"], 1);
}
