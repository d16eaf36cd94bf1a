//! Shared helpers for integration tests

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use tempfile::TempDir;
use tidemark_ingest::engine::{DbConfig, Engine, SqliteEngine};
use tidemark_ingest::{Column, ColumnType, RowBatch, Value};

/// Initialize tracing for tests
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,tidemark_ingest=debug,sqlx=warn")),
        )
        .with_test_writer()
        .try_init();
}

/// File-backed SQLite warehouse living as long as the returned directory
pub struct Warehouse {
    pub dir: TempDir,
    pub engine: SqliteEngine,
}

impl Warehouse {
    pub async fn new() -> Self {
        init_tracing();
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("warehouse.db").display());
        let engine = SqliteEngine::connect(&DbConfig::new(url)).await.unwrap();
        Self { dir, engine }
    }

    pub fn shared(&self) -> Arc<dyn Engine> {
        Arc::new(self.engine.clone())
    }

    pub async fn count(&self, table: &str) -> i64 {
        sqlx::query_scalar(&format!("SELECT COUNT(*) FROM \"{}\"", table))
            .fetch_one(self.engine.pool())
            .await
            .unwrap()
    }

    /// `(id, v, ts)` rows ordered by id then v
    pub async fn rows(&self, table: &str) -> Vec<(i64, Option<String>, Option<i64>)> {
        sqlx::query_as(&format!(
            "SELECT \"id\", \"v\", \"ts\" FROM \"{}\" ORDER BY \"id\", \"v\"",
            table
        ))
        .fetch_all(self.engine.pool())
        .await
        .unwrap()
    }
}

/// Batch with columns `id` (integer), `v` (text) and `ts` (integer)
pub fn batch(rows: &[(i64, Option<&str>, Option<i64>)]) -> RowBatch {
    RowBatch::new(vec![
        Column::new(
            "id",
            ColumnType::Integer,
            rows.iter().map(|r| Value::Integer(r.0)).collect(),
        ),
        Column::new(
            "v",
            ColumnType::Text,
            rows.iter()
                .map(|r| r.1.map(|v| Value::Text(v.to_string())).unwrap_or(Value::Null))
                .collect(),
        ),
        Column::new(
            "ts",
            ColumnType::Integer,
            rows.iter()
                .map(|r| r.2.map(Value::Integer).unwrap_or(Value::Null))
                .collect(),
        ),
    ])
    .unwrap()
}

pub fn row(id: i64, v: &str, ts: i64) -> (i64, Option<String>, Option<i64>) {
    (id, Some(v.to_string()), Some(ts))
}
