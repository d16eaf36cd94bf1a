//! Upload job tests: destination rows copied back out to a worksheet

mod common;

use async_trait::async_trait;
use chrono::{SecondsFormat, TimeZone, Utc};
use common::Warehouse;
use std::sync::Arc;
use tidemark_common::{Bookmark, BookmarkStore, InMemoryBookmarkStore};
use tidemark_ingest::extract::{InMemoryWorksheet, WorksheetSink};
use tidemark_ingest::{UploadJob, UploadJobConfig, UploadReport};

const SHEET_URL: &str = "https://docs.google.com/spreadsheets/d/sheet42/edit";

/// Sink that refuses every write
struct RejectingSink;

#[async_trait]
impl WorksheetSink for RejectingSink {
    async fn update_worksheet(
        &self,
        _sheet_url: &str,
        _worksheet: &str,
        _rows: Vec<Vec<String>>,
    ) -> anyhow::Result<()> {
        anyhow::bail!("quota exceeded")
    }
}

/// Upload config targeting the `Top` worksheet of `sheet42` unless overridden
fn config(mut value: serde_json::Value) -> UploadJobConfig {
    let fields = value.as_object_mut().unwrap();
    fields.entry("sheet_url").or_insert_with(|| SHEET_URL.into());
    fields.entry("worksheet_name").or_insert_with(|| "Top".into());
    serde_json::from_value(value).unwrap()
}

fn old_bookmark() -> Bookmark {
    Bookmark::Timestamp(Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap())
}

async fn seed_movies(warehouse: &Warehouse) {
    for sql in [
        "CREATE TABLE movies (id INTEGER, v TEXT, ts INTEGER)",
        "INSERT INTO movies VALUES (1, 'a', 1), (2, NULL, 2), (3, 'c', 3)",
    ] {
        sqlx::query(sql)
            .execute(warehouse.engine.pool())
            .await
            .unwrap();
    }
}

fn strings(rows: &[&[&str]]) -> Vec<Vec<String>> {
    rows.iter()
        .map(|row| row.iter().map(|cell| cell.to_string()).collect())
        .collect()
}

#[tokio::test]
async fn test_upload_writes_stamped_rows_and_advances_bookmark() {
    let warehouse = Warehouse::new().await;
    seed_movies(&warehouse).await;
    let sheets = InMemoryWorksheet::new()
        .with_worksheet("sheet42", "Other", vec![vec!["keep"]])
        .with_worksheet("sheet42", "Top", vec![vec!["stale"], vec!["row"]]);
    let store = Arc::new(InMemoryBookmarkStore::new(Some(old_bookmark())));
    let before = Utc::now();

    let job = UploadJob::new(
        sheets.clone(),
        warehouse.shared(),
        config(serde_json::json!({
            "table_name": "movies",
            "columns": ["id", "v"],
            "where_clause": "ORDER BY id"
        })),
        store.clone(),
    );
    let bookmark = match job.run().await.unwrap() {
        UploadReport::Uploaded { rows, bookmark } => {
            assert_eq!(rows, 3);
            bookmark
        }
        other => panic!("expected an upload, got {other:?}"),
    };

    assert_eq!(store.read().unwrap(), Some(bookmark));
    let run_at = bookmark.as_timestamp().unwrap();
    assert!(run_at >= before);

    let stamp = run_at.to_rfc3339_opts(SecondsFormat::Secs, true);
    let s = stamp.as_str();
    assert_eq!(
        sheets.worksheet("sheet42", "Top").unwrap(),
        strings(&[
            &["id", "v", "last_updated"],
            &["1", "a", s],
            &["2", "", s],
            &["3", "c", s],
        ])
    );
    assert_eq!(
        sheets.worksheet("sheet42", "Other").unwrap(),
        strings(&[&["keep"]])
    );
}

#[tokio::test]
async fn test_upload_applies_where_clause_and_limit() {
    let warehouse = Warehouse::new().await;
    seed_movies(&warehouse).await;
    let sheets = InMemoryWorksheet::new();

    let job = UploadJob::new(
        sheets.clone(),
        warehouse.shared(),
        config(serde_json::json!({
            "table_name": "movies",
            "columns": ["v"],
            "where_clause": "WHERE ts > 1 ORDER BY ts DESC",
            "limit": 1
        })),
        Arc::new(InMemoryBookmarkStore::new(None)),
    );
    let report = job.run().await.unwrap();
    assert!(matches!(report, UploadReport::Uploaded { rows: 1, .. }));

    let rows = sheets.worksheet("sheet42", "Top").unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0], vec!["v", "last_updated"]);
    assert_eq!(rows[1][0], "c");
}

#[tokio::test]
async fn test_upload_of_empty_table_leaves_header_only() {
    let warehouse = Warehouse::new().await;
    sqlx::query("CREATE TABLE movies (id INTEGER, v TEXT, ts INTEGER)")
        .execute(warehouse.engine.pool())
        .await
        .unwrap();
    let sheets =
        InMemoryWorksheet::new().with_worksheet("sheet42", "Top", vec![vec!["id"], vec!["9"]]);

    let job = UploadJob::new(
        sheets.clone(),
        warehouse.shared(),
        config(serde_json::json!({ "table_name": "movies", "columns": ["id"] })),
        Arc::new(InMemoryBookmarkStore::new(None)),
    );
    assert!(matches!(
        job.run().await.unwrap(),
        UploadReport::Uploaded { rows: 0, .. }
    ));
    assert_eq!(
        sheets.worksheet("sheet42", "Top").unwrap(),
        strings(&[&["id", "last_updated"]])
    );
}

#[tokio::test]
async fn test_inactive_upload_does_nothing() {
    let warehouse = Warehouse::new().await;
    let sheets = InMemoryWorksheet::new();
    let store = Arc::new(InMemoryBookmarkStore::new(None));

    let job = UploadJob::new(
        sheets.clone(),
        warehouse.shared(),
        config(serde_json::json!({
            "table_name": "missing",
            "is_active": false,
            "columns": ["id"]
        })),
        store.clone(),
    );
    assert_eq!(job.run().await.unwrap(), UploadReport::Inactive);
    assert!(sheets.worksheet("sheet42", "Top").is_none());
    assert_eq!(store.read().unwrap(), None);
}

#[tokio::test]
async fn test_failed_sink_keeps_bookmark() {
    let warehouse = Warehouse::new().await;
    seed_movies(&warehouse).await;
    let store = Arc::new(InMemoryBookmarkStore::new(Some(old_bookmark())));

    let job = UploadJob::new(
        RejectingSink,
        warehouse.shared(),
        config(serde_json::json!({ "table_name": "movies", "columns": ["id"] })),
        store.clone(),
    );
    let err = job.run().await.unwrap_err();
    assert!(format!("{err:#}").contains("quota exceeded"));
    assert_eq!(store.read().unwrap(), Some(old_bookmark()));
}

#[tokio::test]
async fn test_failed_read_keeps_bookmark_and_worksheet() {
    let warehouse = Warehouse::new().await;
    let sheets = InMemoryWorksheet::new().with_worksheet("sheet42", "Top", vec![vec!["id"]]);
    let store = Arc::new(InMemoryBookmarkStore::new(Some(old_bookmark())));

    let job = UploadJob::new(
        sheets.clone(),
        warehouse.shared(),
        config(serde_json::json!({ "table_name": "missing", "columns": ["id"] })),
        store.clone(),
    );
    let err = job.run().await.unwrap_err();
    assert!(format!("{err:#}").contains("Failed to read missing"));
    assert_eq!(store.read().unwrap(), Some(old_bookmark()));
    assert_eq!(
        sheets.worksheet("sheet42", "Top").unwrap(),
        strings(&[&["id"]])
    );
}
