//! Ingestion Orchestrator: stage, then merge
//!
//! Stateless between calls; each call is an independently retryable unit.
//! Callers must not run two ingestions into the same destination at once.

use crate::engine::Engine;
use crate::error::IngestResult;
use crate::merge::{MergeEngine, MergeKey, MergeReport};
use crate::staging::{BatchSource, StagingLoader};
use crate::table::TableName;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, instrument};

/// Outcome of one successful ingestion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestReport {
    pub destination: TableName,
    pub staged_rows: u64,
    pub merge: MergeReport,
}

/// Everything needed to ingest batches into one destination table
#[derive(Clone)]
pub struct TableIngestor {
    engine: Arc<dyn Engine>,
    destination: TableName,
    merge_key: MergeKey,
    range_column: String,
    temp_schema: Option<String>,
}

impl TableIngestor {
    pub fn new(
        engine: Arc<dyn Engine>,
        destination: TableName,
        merge_key: MergeKey,
        range_column: impl Into<String>,
    ) -> Self {
        Self {
            engine,
            destination,
            merge_key,
            range_column: range_column.into(),
            temp_schema: None,
        }
    }

    /// Stage into `schema` instead of the destination's own schema
    pub fn with_temp_schema(mut self, schema: impl Into<String>) -> Self {
        self.temp_schema = Some(schema.into());
        self
    }

    pub fn destination(&self) -> &TableName {
        &self.destination
    }

    pub fn scratch(&self) -> TableName {
        self.destination.scratch(self.temp_schema.as_deref())
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    /// Stage `source` and merge it into the destination
    ///
    /// The first failing step aborts the call. Nothing is retried.
    #[instrument(skip(self, source), fields(destination = %self.destination))]
    pub async fn ingest(
        &self,
        source: impl Into<BatchSource>,
        load_timestamp: DateTime<Utc>,
    ) -> IngestResult<IngestReport> {
        let started = Instant::now();
        let scratch = self.scratch();

        let loader =
            StagingLoader::new(self.engine.as_ref(), self.destination.clone(), scratch.clone());
        let staged = loader.stage(source.into(), load_timestamp).await?;

        let merge = MergeEngine::new(self.engine.as_ref())
            .merge(&self.destination, &scratch, &self.merge_key, &self.range_column)
            .await?;

        info!(
            staged = staged.row_count,
            inserted = merge.inserted,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Ingestion complete"
        );

        Ok(IngestReport {
            destination: self.destination.clone(),
            staged_rows: staged.row_count,
            merge,
        })
    }
}

/// One-shot ingestion without building a [`TableIngestor`]
pub async fn ingest(
    engine: Arc<dyn Engine>,
    source: impl Into<BatchSource>,
    destination: TableName,
    merge_key: MergeKey,
    range_column: &str,
    load_timestamp: DateTime<Utc>,
) -> IngestResult<IngestReport> {
    TableIngestor::new(engine, destination, merge_key, range_column)
        .ingest(source, load_timestamp)
        .await
}
