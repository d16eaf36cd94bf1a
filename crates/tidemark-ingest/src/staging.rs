//! Staging Loader: writes a batch into a fresh scratch table
//!
//! Staging is not transactional. A failure part-way leaves whatever was
//! created behind; the next run's unconditional drop cleans it up.

use crate::batch::{ColumnType, RowBatch};
use crate::engine::Engine;
use crate::error::{BatchError, IngestError, IngestResult, StagingFailure};
use crate::merge::RANK_COLUMN;
use crate::table::{quote_ident, TableName};
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use tracing::{info, instrument};

/// Column added to every staged row
pub const LOAD_TIMESTAMP_COLUMN: &str = "load_timestamp";

/// Names a batch may not use, compared case-insensitively since SQLite
/// identifiers are
pub const RESERVED_COLUMNS: [&str; 2] = [LOAD_TIMESTAMP_COLUMN, RANK_COLUMN];

/// Where the rows to stage live
#[derive(Debug, Clone)]
pub enum BatchSource {
    Memory(RowBatch),
    /// Delimited file with a header row
    Csv { path: PathBuf, delimiter: u8 },
}

impl BatchSource {
    pub fn csv(path: impl Into<PathBuf>, delimiter: u8) -> Self {
        BatchSource::Csv {
            path: path.into(),
            delimiter,
        }
    }

    fn into_batch(self) -> Result<RowBatch, BatchError> {
        match self {
            BatchSource::Memory(batch) => Ok(batch),
            BatchSource::Csv { path, delimiter } => RowBatch::from_csv_path(path, delimiter),
        }
    }
}

impl From<RowBatch> for BatchSource {
    fn from(batch: RowBatch) -> Self {
        BatchSource::Memory(batch)
    }
}

/// A scratch table produced by [`StagingLoader::stage`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedTable {
    pub table: TableName,
    /// Source columns followed by the load timestamp column
    pub columns: Vec<String>,
    pub row_count: u64,
}

pub struct StagingLoader<'a> {
    engine: &'a dyn Engine,
    destination: TableName,
    scratch: TableName,
}

impl<'a> StagingLoader<'a> {
    /// Loader filling `scratch` on behalf of `destination`
    pub fn new(engine: &'a dyn Engine, destination: TableName, scratch: TableName) -> Self {
        Self {
            engine,
            destination,
            scratch,
        }
    }

    /// Drop any previous scratch table, bulk-load `source` into a new one and
    /// stamp every row with `load_timestamp`.
    ///
    /// Duplicate rows are kept; the merge deduplicates.
    #[instrument(
        skip(self, source),
        fields(destination = %self.destination, scratch = %self.scratch)
    )]
    pub async fn stage(
        &self,
        source: BatchSource,
        load_timestamp: DateTime<Utc>,
    ) -> IngestResult<StagedTable> {
        let fail = |source: StagingFailure| {
            IngestError::staging(&self.destination, &self.scratch, source)
        };

        let batch = source.into_batch().map_err(|e| fail(e.into()))?;
        if let Some(reserved) = batch
            .column_names()
            .into_iter()
            .find(|name| RESERVED_COLUMNS.iter().any(|r| name.eq_ignore_ascii_case(r)))
        {
            return Err(fail(BatchError::ReservedColumn(reserved.to_string()).into()));
        }

        let kind = self.engine.kind();
        let quoted = self.scratch.quoted();

        self.engine
            .execute(&format!("DROP TABLE IF EXISTS {}", quoted))
            .await
            .map_err(|e| fail(e.into()))?;

        let row_count = self
            .engine
            .bulk_load(&self.scratch, &batch)
            .await
            .map_err(|e| fail(e.into()))?;

        let stamp_statements = [
            format!(
                "ALTER TABLE {} ADD COLUMN {} {}",
                quoted,
                quote_ident(LOAD_TIMESTAMP_COLUMN),
                kind.sql_type(ColumnType::Timestamp)
            ),
            format!(
                "UPDATE {} SET {} = {}",
                quoted,
                quote_ident(LOAD_TIMESTAMP_COLUMN),
                kind.timestamp_literal(load_timestamp)
            ),
        ];
        for statement in &stamp_statements {
            self.engine.execute(statement).await.map_err(|e| fail(e.into()))?;
        }

        let mut columns: Vec<String> = batch.column_names().into_iter().map(str::to_string).collect();
        columns.push(LOAD_TIMESTAMP_COLUMN.to_string());

        info!(rows = row_count, columns = columns.len(), "Batch staged");

        Ok(StagedTable {
            table: self.scratch.clone(),
            columns,
            row_count,
        })
    }
}
