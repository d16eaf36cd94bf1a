//! Incremental jobs: extract from the bookmark, ingest, advance the bookmark

use crate::engine::Engine;
use crate::error::IngestResult;
use crate::extract::Extractor;
use crate::ingestor::{IngestReport, TableIngestor};
use crate::merge::MergeKey;
use crate::table::TableName;
use anyhow::Context;
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tidemark_common::{Bookmark, BookmarkStore};
use tracing::{info, instrument};

/// What one job run did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobReport {
    /// The job is switched off
    Inactive,
    /// The extractor found nothing; the bookmark is unchanged
    NoData,
    Ingested {
        report: IngestReport,
        bookmark: Bookmark,
    },
}

/// Destination and scheduling settings shared by job definitions
pub trait JobSettings {
    /// Destination table, `schema.table` or `table`
    fn table_name(&self) -> &str;

    fn primary_keys(&self) -> &[String];

    fn range_column(&self) -> &str;

    fn is_active(&self) -> bool;

    /// Extraction cap handed to the extractor
    fn max_pages(&self) -> Option<u32> {
        None
    }
}

pub struct IncrementalJob<E> {
    name: String,
    extractor: E,
    ingestor: TableIngestor,
    bookmarks: Arc<dyn BookmarkStore>,
    is_active: bool,
    max_pages: Option<u32>,
}

impl<E: Extractor> IncrementalJob<E> {
    pub fn new(
        name: impl Into<String>,
        extractor: E,
        ingestor: TableIngestor,
        bookmarks: Arc<dyn BookmarkStore>,
    ) -> Self {
        Self {
            name: name.into(),
            extractor,
            ingestor,
            bookmarks,
            is_active: true,
            max_pages: None,
        }
    }

    /// Job named after its destination table, switched on or off and
    /// capped as `settings` say
    pub fn from_config(
        settings: &impl JobSettings,
        extractor: E,
        engine: Arc<dyn Engine>,
        bookmarks: Arc<dyn BookmarkStore>,
    ) -> IngestResult<Self> {
        let ingestor = TableIngestor::new(
            engine,
            TableName::parse(settings.table_name())?,
            MergeKey::new(settings.primary_keys().iter().cloned())?,
            settings.range_column(),
        );

        Ok(Self::new(settings.table_name(), extractor, ingestor, bookmarks)
            .with_active(settings.is_active())
            .with_max_pages(settings.max_pages()))
    }

    pub fn with_active(mut self, is_active: bool) -> Self {
        self.is_active = is_active;
        self
    }

    pub fn with_max_pages(mut self, max_pages: Option<u32>) -> Self {
        self.max_pages = max_pages;
        self
    }

    /// Run once
    ///
    /// The bookmark moves to this run's start instant only after the merge
    /// commits. A failed run leaves it alone, so the next run re-extracts
    /// the same window.
    #[instrument(skip(self), fields(job = %self.name, table = %self.ingestor.destination()))]
    pub async fn run(&self) -> anyhow::Result<JobReport> {
        let started = Instant::now();
        let run_at = Utc::now();
        info!(started_at = %run_at, "Job started");

        if !self.is_active {
            info!("Job is not active, skipping");
            return Ok(JobReport::Inactive);
        }

        let previous = self.bookmarks.read().context("Failed to read bookmark")?;
        info!(bookmark = ?previous, "Extracting");

        let batch = self
            .extractor
            .extract(previous.as_ref(), self.max_pages)
            .await
            .context("Extraction failed")?;

        let batch = match batch {
            Some(batch) if !batch.is_empty() => batch,
            _ => {
                info!(elapsed_ms = started.elapsed().as_millis() as u64, "No data to ingest");
                return Ok(JobReport::NoData);
            },
        };

        let report = self.ingestor.ingest(batch, run_at).await?;

        let bookmark = Bookmark::Timestamp(run_at);
        self.bookmarks
            .write(&bookmark)
            .context("Failed to write bookmark")?;

        info!(
            rows = report.staged_rows,
            bookmark = %bookmark,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Job finished"
        );

        Ok(JobReport::Ingested { report, bookmark })
    }
}
