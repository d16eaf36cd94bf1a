//! Error types for the load-and-merge pipeline

use std::fmt;
use thiserror::Error;

pub type IngestResult<T> = Result<T, IngestError>;

/// Problems with the shape or content of a row batch
#[derive(Error, Debug)]
pub enum BatchError {
    #[error("Batch has no columns")]
    NoColumns,

    #[error("Duplicate column name: {0}")]
    DuplicateColumn(String),

    #[error("Column '{column}' has {actual} values, expected {expected}")]
    LengthMismatch {
        column: String,
        expected: usize,
        actual: usize,
    },

    #[error("Row {row} has {actual} fields, header has {expected}")]
    WidthMismatch {
        row: usize,
        expected: usize,
        actual: usize,
    },

    #[error("Column '{column}' is declared {expected} but row {row} holds a {actual} value")]
    TypeMismatch {
        column: String,
        row: usize,
        expected: String,
        actual: String,
    },

    #[error("Column name '{0}' is reserved by the pipeline")]
    ReservedColumn(String),

    #[error("Unknown column: {0}")]
    UnknownColumn(String),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why staging a batch failed
#[derive(Error, Debug)]
pub enum StagingFailure {
    #[error(transparent)]
    Batch(#[from] BatchError),

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Step of the merge transaction that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePhase {
    Introspect,
    Begin,
    CreateDestination,
    Delete,
    Insert,
    DropScratch,
    Commit,
}

impl fmt::Display for MergePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MergePhase::Introspect => "introspect",
            MergePhase::Begin => "begin",
            MergePhase::CreateDestination => "create destination",
            MergePhase::Delete => "delete",
            MergePhase::Insert => "insert",
            MergePhase::DropScratch => "drop scratch",
            MergePhase::Commit => "commit",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum IngestError {
    /// Bulk load into the scratch table failed
    #[error("Staging for {table} (scratch {scratch}) failed: {source}")]
    Staging {
        table: String,
        scratch: String,
        #[source]
        source: StagingFailure,
    },

    /// The merge transaction failed; the destination keeps its pre-merge state
    #[error("Merge into {table} failed during {phase}: {source}")]
    Merge {
        table: String,
        phase: MergePhase,
        #[source]
        source: sqlx::Error,
    },

    /// Staged columns cannot be reconciled with the destination
    #[error("Schema mismatch for {table}: {detail}")]
    SchemaMismatch { table: String, detail: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl IngestError {
    pub fn staging(
        table: impl ToString,
        scratch: impl ToString,
        source: impl Into<StagingFailure>,
    ) -> Self {
        Self::Staging {
            table: table.to_string(),
            scratch: scratch.to_string(),
            source: source.into(),
        }
    }

    pub fn merge(table: impl ToString, phase: MergePhase, source: sqlx::Error) -> Self {
        Self::Merge {
            table: table.to_string(),
            phase,
            source,
        }
    }

    pub fn schema_mismatch(table: impl ToString, detail: impl Into<String>) -> Self {
        Self::SchemaMismatch {
            table: table.to_string(),
            detail: detail.into(),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }
}
