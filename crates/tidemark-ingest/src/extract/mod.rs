//! Extractors: upstream sources that produce row batches
//!
//! Extractors sit outside the load-and-merge core. A job hands each one the
//! current bookmark as a lower bound plus an optional page cap, and stages
//! whatever comes back.

pub mod api;
pub mod worksheet;

use crate::batch::RowBatch;
use async_trait::async_trait;
use tidemark_common::Bookmark;

pub use api::{ApiExtractor, ApiJobConfig, ExtractError, PagedApiClient};
pub use worksheet::{
    to_snake_case, InMemoryWorksheet, SnakeCase, WorksheetExtractor, WorksheetJobConfig,
    WorksheetSink, WorksheetSource,
};

#[async_trait]
pub trait Extractor: Send + Sync {
    /// Rows newer than `bookmark`, or `None` when the source has nothing
    async fn extract(
        &self,
        bookmark: Option<&Bookmark>,
        max_pages: Option<u32>,
    ) -> anyhow::Result<Option<RowBatch>>;
}
