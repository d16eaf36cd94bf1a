//! Tidemark Ingest Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Idempotent load-and-merge of extracted batches into a destination table.
//!
//! # Pipeline
//!
//! - **Row Batch** ([`batch`]): immutable table of named, typed columns
//! - **Staging Loader** ([`staging`]): bulk-loads a batch into `{table}_temp`
//!   and stamps every row with the load timestamp
//! - **Merge Engine** ([`merge`]): delete-by-key, deduplicate and insert in
//!   one transaction, then drop the scratch table
//! - **Ingestion Orchestrator** ([`ingestor`]): stage then merge
//!
//! Extractors ([`extract`]) and incremental jobs ([`job`]) sit around the
//! pipeline and own the bookmark. [`upload`] copies a destination table back
//! out to a worksheet.
//!
//! # Example
//!
//! ```no_run
//! use tidemark_ingest::{engine, BatchSource, DbConfig, MergeKey, TableIngestor, TableName};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let engine = engine::connect(&DbConfig::from_env()?).await?;
//!     let ingestor = TableIngestor::new(
//!         engine,
//!         TableName::parse("etl.movies")?,
//!         MergeKey::new(["id"])?,
//!         "release_date",
//!     );
//!     ingestor
//!         .ingest(BatchSource::csv("./movies.csv", b'|'), chrono::Utc::now())
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod batch;
pub mod engine;
pub mod error;
pub mod extract;
pub mod ingestor;
pub mod job;
pub mod merge;
pub mod staging;
pub mod table;
pub mod upload;

pub use batch::{Column, ColumnType, RowBatch, Value};
pub use engine::{DbConfig, Engine, EngineKind};
pub use error::{BatchError, IngestError, IngestResult, MergePhase};
pub use ingestor::{ingest, IngestReport, TableIngestor};
pub use job::{IncrementalJob, JobReport, JobSettings};
pub use merge::{MergeEngine, MergeKey, MergeReport};
pub use staging::{
    BatchSource, StagedTable, StagingLoader, LOAD_TIMESTAMP_COLUMN, RESERVED_COLUMNS,
};
pub use table::TableName;
pub use upload::{UploadJob, UploadJobConfig, UploadReport};
