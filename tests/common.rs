#![allow(dead_code)]

//! Shared helpers for integration tests.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tidedb::{ColumnDef, Engine, EngineOptions, IndexMode, ModelDiff, ModelSpec, SqlType};

/// Engine options with short timeouts so tests never sit out a full
/// cross-process polling window.
pub fn fast_options() -> EngineOptions {
    EngineOptions {
        wait_timeout: Duration::from_millis(30),
        poll_backoff_base: Duration::from_millis(10),
        ..EngineOptions::default()
    }
}

/// A `counter` model whose reducer increments a single row's `total` on
/// every `tick` event.
pub fn counter_spec() -> ModelSpec {
    ModelSpec::new("counter")
        .columns(vec![
            ColumnDef::real("id", SqlType::Text),
            ColumnDef::real("total", SqlType::Integer).indexed(IndexMode::All),
        ])
        .reducer(Arc::new(|model, event, _ctx| {
            Box::pin(async move {
                if event.kind != "tick" {
                    return Ok(ModelDiff::none());
                }
                let prev = model.get(&json!("c")).await?;
                let total = prev.and_then(|p| p["total"].as_i64()).unwrap_or(0);
                Ok(ModelDiff {
                    upsert: vec![json!({"id": "c", "total": total + 1})],
                    ..ModelDiff::default()
                })
            })
        }))
}

/// A plain document model named `things` with an integer id.
pub fn things_spec() -> ModelSpec {
    ModelSpec::new("things").columns(vec![
        ColumnDef::real("id", SqlType::Integer),
        ColumnDef::real("rank", SqlType::Integer).indexed(IndexMode::All),
    ])
}

pub async fn open_counter_engine(path: &Path) -> Engine {
    Engine::open(Some(path), vec![counter_spec()], fast_options())
        .await
        .expect("engine should open")
}
