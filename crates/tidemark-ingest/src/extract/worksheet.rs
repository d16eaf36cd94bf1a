//! Spreadsheet worksheet extraction
//!
//! The spreadsheet service is a collaborator behind [`WorksheetSource`] for
//! reads and [`WorksheetSink`] for uploads. Every cell is text; jobs cast
//! columns in a custom transform.

use super::Extractor;
use crate::batch::{Column, ColumnType, RowBatch, Value};
use crate::error::BatchError;
use crate::job::JobSettings;
use anyhow::Context;
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tidemark_common::Bookmark;
use tracing::info;

/// Column holding the generated row id
pub const GENERATED_ID_COLUMN: &str = "id";

/// Read access to spreadsheet worksheets
#[async_trait]
pub trait WorksheetSource: Send + Sync {
    /// Every row of the worksheet, header rows included
    ///
    /// An empty `worksheet` name selects the first worksheet.
    async fn get_worksheet(&self, sheet_url: &str, worksheet: &str)
        -> anyhow::Result<Vec<Vec<String>>>;
}

/// Write access to spreadsheet worksheets
#[async_trait]
pub trait WorksheetSink: Send + Sync {
    /// Replace the worksheet's contents with `rows`, header first,
    /// creating the worksheet if it does not exist
    async fn update_worksheet(
        &self,
        sheet_url: &str,
        worksheet: &str,
        rows: Vec<Vec<String>>,
    ) -> anyhow::Result<()>;
}

/// Spreadsheet id from a `.../d/<id>/...` sheet URL
pub fn spreadsheet_id(sheet_url: &str) -> anyhow::Result<String> {
    let pattern = Regex::new(r"/d/([a-zA-Z0-9_-]+)")?;
    pattern
        .captures(sheet_url)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .with_context(|| format!("Invalid spreadsheet URL: {}", sheet_url))
}

type Worksheets = HashMap<String, Vec<(String, Vec<Vec<String>>)>>;

/// Worksheets held in memory, keyed by spreadsheet id
///
/// Clones share the same spreadsheets.
#[derive(Debug, Default, Clone)]
pub struct InMemoryWorksheet {
    sheets: Arc<Mutex<Worksheets>>,
}

impl InMemoryWorksheet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a worksheet; the first added per spreadsheet is its default
    pub fn with_worksheet(
        self,
        spreadsheet_id: impl Into<String>,
        worksheet: impl Into<String>,
        rows: Vec<Vec<&str>>,
    ) -> Self {
        let rows = rows
            .into_iter()
            .map(|row| row.into_iter().map(str::to_string).collect())
            .collect();
        self.sheets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(spreadsheet_id.into())
            .or_default()
            .push((worksheet.into(), rows));
        self
    }

    /// Current rows of a worksheet; an empty name selects the first one
    pub fn worksheet(&self, spreadsheet_id: &str, worksheet: &str) -> Option<Vec<Vec<String>>> {
        let sheets = self.sheets.lock().unwrap_or_else(PoisonError::into_inner);
        let worksheets = sheets.get(spreadsheet_id)?;
        let found = if worksheet.is_empty() {
            worksheets.first()
        } else {
            worksheets.iter().find(|(name, _)| name == worksheet)
        };
        found.map(|(_, rows)| rows.clone())
    }
}

#[async_trait]
impl WorksheetSource for InMemoryWorksheet {
    async fn get_worksheet(
        &self,
        sheet_url: &str,
        worksheet: &str,
    ) -> anyhow::Result<Vec<Vec<String>>> {
        let id = spreadsheet_id(sheet_url)?;
        self.worksheet(&id, worksheet)
            .with_context(|| format!("Worksheet '{}' not found in {}", worksheet, id))
    }
}

#[async_trait]
impl WorksheetSink for InMemoryWorksheet {
    async fn update_worksheet(
        &self,
        sheet_url: &str,
        worksheet: &str,
        rows: Vec<Vec<String>>,
    ) -> anyhow::Result<()> {
        let id = spreadsheet_id(sheet_url)?;
        let mut sheets = self.sheets.lock().unwrap_or_else(PoisonError::into_inner);
        let worksheets = sheets.entry(id).or_default();
        match worksheets.iter_mut().find(|(name, _)| name == worksheet) {
            Some((_, existing)) => *existing = rows,
            None => worksheets.push((worksheet.to_string(), rows)),
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_data_row() -> usize {
    1
}

/// Settings for one worksheet ingestion job
#[derive(Debug, Clone, Deserialize)]
pub struct WorksheetJobConfig {
    pub table_name: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
    pub sheet_url: String,
    /// Empty selects the first worksheet
    #[serde(default)]
    pub worksheet_name: String,
    pub primary_keys: Vec<String>,
    pub range_column: String,
    /// Add an `id` column hashed from each row's values
    #[serde(default)]
    pub generate_id: bool,
    #[serde(default = "default_data_row")]
    pub sheet_data_row_num: usize,
    #[serde(default)]
    pub sheet_header_row_num: usize,
}

impl JobSettings for WorksheetJobConfig {
    fn table_name(&self) -> &str {
        &self.table_name
    }

    fn primary_keys(&self) -> &[String] {
        &self.primary_keys
    }

    fn range_column(&self) -> &str {
        &self.range_column
    }

    fn is_active(&self) -> bool {
        self.is_active
    }
}

/// Column name normaliser, e.g. `"Average Cost"` to `average_cost`
#[derive(Debug, Clone)]
pub struct SnakeCase {
    word_start: Regex,
    camel_boundary: Regex,
    separators: Regex,
    disallowed: Regex,
    repeated_underscores: Regex,
}

impl SnakeCase {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            word_start: Regex::new(r"(.)([A-Z][a-z]+)")?,
            camel_boundary: Regex::new(r"([a-z])([A-Z])")?,
            separators: Regex::new(r"[ -]")?,
            disallowed: Regex::new(r"[^a-zA-Z0-9_]")?,
            repeated_underscores: Regex::new(r"_{2,}")?,
        })
    }

    pub fn convert(&self, name: &str) -> String {
        let name = self.word_start.replace_all(name, "${1}_${2}");
        let name = self.camel_boundary.replace_all(&name, "${1}_${2}");
        let name = name.to_lowercase();
        let name = self.separators.replace_all(&name, "_");
        let name = self.disallowed.replace_all(&name, "");
        let name = self.repeated_underscores.replace_all(&name, "_");
        name.trim_start_matches('_')
            .trim_end_matches('_')
            .to_string()
    }
}

/// Snake-case a single column name
pub fn to_snake_case(name: &str) -> Result<String, regex::Error> {
    Ok(SnakeCase::new()?.convert(name))
}

/// MD5 hex digest of a row's cells joined by `_`; nulls contribute ""
fn row_id(cells: &[&Value]) -> String {
    let joined = cells
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("_");
    format!("{:x}", md5::compute(joined.as_bytes()))
}

type Transform = Box<dyn Fn(RowBatch) -> Result<RowBatch, BatchError> + Send + Sync>;

pub struct WorksheetExtractor<S> {
    source: S,
    config: WorksheetJobConfig,
    renamer: SnakeCase,
    transform: Option<Transform>,
}

impl<S: WorksheetSource> WorksheetExtractor<S> {
    pub fn new(source: S, config: WorksheetJobConfig) -> Result<Self, regex::Error> {
        Ok(Self {
            source,
            config,
            renamer: SnakeCase::new()?,
            transform: None,
        })
    }

    /// Job-specific cleanup applied after renaming
    pub fn with_transform(
        mut self,
        transform: impl Fn(RowBatch) -> Result<RowBatch, BatchError> + Send + Sync + 'static,
    ) -> Self {
        self.transform = Some(Box::new(transform));
        self
    }

    pub fn config(&self) -> &WorksheetJobConfig {
        &self.config
    }

    fn build_batch(&self, mut rows: Vec<Vec<String>>) -> anyhow::Result<RowBatch> {
        let header_row = self.config.sheet_header_row_num;
        if header_row >= rows.len() {
            anyhow::bail!(
                "Worksheet has {} rows, header row {} is out of range",
                rows.len(),
                header_row
            );
        }

        let header = rows[header_row].clone();
        let data = rows.split_off(self.config.sheet_data_row_num.min(rows.len()));
        let mut batch = RowBatch::from_text_rows(header, data)?;

        if self.config.generate_id {
            let ids = (0..batch.num_rows())
                .filter_map(|i| batch.row(i))
                .map(|cells| Value::Text(row_id(&cells)))
                .collect();
            batch = batch.with_column(Column::new(GENERATED_ID_COLUMN, ColumnType::Text, ids))?;
        }

        let batch = batch.rename_columns(|name| self.renamer.convert(name))?;
        let batch = match &self.transform {
            Some(transform) => transform(batch)?,
            None => batch,
        };
        Ok(batch)
    }
}

#[async_trait]
impl<S: WorksheetSource> Extractor for WorksheetExtractor<S> {
    /// Whole-sheet read; the bookmark and page cap do not apply
    async fn extract(
        &self,
        _bookmark: Option<&Bookmark>,
        _max_pages: Option<u32>,
    ) -> anyhow::Result<Option<RowBatch>> {
        let rows = self
            .source
            .get_worksheet(&self.config.sheet_url, &self.config.worksheet_name)
            .await?;
        if rows.is_empty() {
            return Ok(None);
        }

        let batch = self.build_batch(rows)?;
        info!(
            table = %self.config.table_name,
            rows = batch.num_rows(),
            "Fetched worksheet"
        );
        Ok(Some(batch))
    }
}
