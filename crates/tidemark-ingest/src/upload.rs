//! Destination-to-worksheet upload job
//!
//! Reads selected columns of a destination table, stamps every row with the
//! run's instant and replaces a worksheet's contents with the result. The
//! bookmark records the last successful upload.

use crate::engine::Engine;
use crate::error::{IngestError, IngestResult};
use crate::extract::WorksheetSink;
use crate::table::{quote_ident, TableName};
use anyhow::Context;
use chrono::{SecondsFormat, Utc};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;
use tidemark_common::{Bookmark, BookmarkStore};
use tracing::{info, instrument};

/// Column appended to every uploaded row
pub const LAST_UPDATED_COLUMN: &str = "last_updated";

pub const DEFAULT_UPLOAD_LIMIT: u64 = 1000;

fn default_true() -> bool {
    true
}

fn default_limit() -> Option<u64> {
    Some(DEFAULT_UPLOAD_LIMIT)
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadJobConfig {
    /// Table to read, `schema.table` or `table`
    pub table_name: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
    pub sheet_url: String,
    pub worksheet_name: String,
    pub columns: Vec<String>,
    /// Trusted SQL appended after `FROM`, e.g. `WHERE rating > 4 ORDER BY name`
    #[serde(default)]
    pub where_clause: Option<String>,
    /// Row cap; `null` or 0 uploads everything
    #[serde(default = "default_limit")]
    pub limit: Option<u64>,
}

impl UploadJobConfig {
    /// Query reading every configured column as text
    pub fn query(&self) -> IngestResult<String> {
        if self.columns.is_empty() {
            return Err(IngestError::invalid_input(format!(
                "upload of {} selects no columns",
                self.table_name
            )));
        }

        let select = self
            .columns
            .iter()
            .map(|c| format!("CAST({0} AS VARCHAR) AS {0}", quote_ident(c)))
            .collect::<Vec<_>>()
            .join(", ");
        let mut query = format!(
            "SELECT {} FROM {}",
            select,
            TableName::parse(&self.table_name)?.quoted()
        );

        let clause = self.where_clause.as_deref().map(str::trim).unwrap_or_default();
        if !clause.is_empty() {
            query.push(' ');
            query.push_str(clause);
        }
        if let Some(limit) = self.limit.filter(|&l| l > 0) {
            query.push_str(&format!(" LIMIT {}", limit));
        }
        Ok(query)
    }
}

/// What one upload run did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadReport {
    Inactive,
    Uploaded { rows: usize, bookmark: Bookmark },
}

pub struct UploadJob<S> {
    sink: S,
    engine: Arc<dyn Engine>,
    config: UploadJobConfig,
    bookmarks: Arc<dyn BookmarkStore>,
}

impl<S: WorksheetSink> UploadJob<S> {
    pub fn new(
        sink: S,
        engine: Arc<dyn Engine>,
        config: UploadJobConfig,
        bookmarks: Arc<dyn BookmarkStore>,
    ) -> Self {
        Self {
            sink,
            engine,
            config,
            bookmarks,
        }
    }

    pub fn config(&self) -> &UploadJobConfig {
        &self.config
    }

    /// Run once
    ///
    /// An empty result still replaces the worksheet, leaving only the
    /// header. The bookmark moves only after the worksheet is written.
    #[instrument(
        skip(self),
        fields(table = %self.config.table_name, worksheet = %self.config.worksheet_name)
    )]
    pub async fn run(&self) -> anyhow::Result<UploadReport> {
        let started = Instant::now();
        let run_at = Utc::now();

        if !self.config.is_active {
            info!("Upload is not active, skipping");
            return Ok(UploadReport::Inactive);
        }

        let query = self.config.query()?;
        info!(query = %query, "Reading destination");
        let rows = self
            .engine
            .fetch_text(&query)
            .await
            .with_context(|| format!("Failed to read {}", self.config.table_name))?;

        let stamp = run_at.to_rfc3339_opts(SecondsFormat::Secs, true);
        let mut header = self.config.columns.clone();
        header.push(LAST_UPDATED_COLUMN.to_string());

        let uploaded = rows.len();
        let sheet: Vec<Vec<String>> = std::iter::once(header)
            .chain(rows.into_iter().map(|row| {
                row.into_iter()
                    .map(Option::unwrap_or_default)
                    .chain(std::iter::once(stamp.clone()))
                    .collect()
            }))
            .collect();

        self.sink
            .update_worksheet(&self.config.sheet_url, &self.config.worksheet_name, sheet)
            .await
            .context("Worksheet upload failed")?;

        let bookmark = Bookmark::Timestamp(run_at);
        self.bookmarks
            .write(&bookmark)
            .context("Failed to write bookmark")?;

        info!(
            rows = uploaded,
            bookmark = %bookmark,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Upload finished"
        );
        Ok(UploadReport::Uploaded {
            rows: uploaded,
            bookmark,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn config(value: serde_json::Value) -> UploadJobConfig {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_query_casts_columns_and_applies_defaults() {
        let config = config(serde_json::json!({
            "table_name": "etl.restaurant",
            "sheet_url": "https://docs.google.com/spreadsheets/d/abc/edit",
            "worksheet_name": "Top",
            "columns": ["name", "rating"],
            "where_clause": " WHERE rating > 4 ORDER BY name "
        }));

        assert!(config.is_active);
        assert_eq!(
            config.query().unwrap(),
            "SELECT CAST(\"name\" AS VARCHAR) AS \"name\", CAST(\"rating\" AS VARCHAR) AS \"rating\" \
             FROM \"etl\".\"restaurant\" WHERE rating > 4 ORDER BY name LIMIT 1000"
        );
    }

    #[test]
    fn test_query_without_limit_or_columns() {
        let mut config = config(serde_json::json!({
            "table_name": "restaurant",
            "sheet_url": "https://docs.google.com/spreadsheets/d/abc/edit",
            "worksheet_name": "Top",
            "columns": ["name"],
            "limit": null
        }));
        assert_eq!(
            config.query().unwrap(),
            "SELECT CAST(\"name\" AS VARCHAR) AS \"name\" FROM \"restaurant\""
        );

        config.limit = Some(0);
        assert!(!config.query().unwrap().contains("LIMIT"));

        config.columns.clear();
        assert!(matches!(config.query(), Err(IngestError::InvalidInput(_))));
    }
}
