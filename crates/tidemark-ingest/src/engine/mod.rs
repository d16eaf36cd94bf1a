//! Destination engines
//!
//! The pipeline talks to a database only through [`Engine`]. Variants form a
//! closed set ([`EngineKind`]): Postgres as the client/server engine and
//! SQLite as the embedded one. SQL dialect differences live in
//! [`EngineKind`]; the merge algorithm itself is dialect-agnostic.

pub mod config;
pub mod postgres;
pub mod sqlite;

use crate::batch::{ColumnType, RowBatch};
use crate::table::{quote_ident, quote_list, quote_literal, TableName};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use sqlx::{Database, Encode, QueryBuilder, Type};
use std::sync::Arc;

pub use config::{DbConfig, EngineError, EngineResult};
pub use postgres::PostgresEngine;
pub use sqlite::SqliteEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    Postgres,
    Sqlite,
}

impl EngineKind {
    /// Engine for a connection URL, by scheme
    pub fn from_url(url: &str) -> EngineResult<Self> {
        let scheme = url.split(':').next().unwrap_or_default();
        match scheme {
            "postgres" | "postgresql" => Ok(EngineKind::Postgres),
            "sqlite" => Ok(EngineKind::Sqlite),
            other => Err(EngineError::config(format!(
                "Unsupported database URL scheme '{}'",
                other
            ))),
        }
    }

    /// Column type used when creating a scratch table
    pub fn sql_type(self, column_type: ColumnType) -> &'static str {
        match (self, column_type) {
            (_, ColumnType::Boolean) => "BOOLEAN",
            (_, ColumnType::Text) => "TEXT",
            (_, ColumnType::Date) => "DATE",
            (EngineKind::Postgres, ColumnType::Integer) => "BIGINT",
            (EngineKind::Postgres, ColumnType::Float) => "DOUBLE PRECISION",
            (EngineKind::Postgres, ColumnType::Timestamp) => "TIMESTAMPTZ",
            (EngineKind::Sqlite, ColumnType::Integer) => "INTEGER",
            (EngineKind::Sqlite, ColumnType::Float) => "REAL",
            (EngineKind::Sqlite, ColumnType::Timestamp) => "TIMESTAMP",
        }
    }

    pub fn timestamp_literal(self, ts: DateTime<Utc>) -> String {
        quote_literal(&ts.to_rfc3339_opts(SecondsFormat::Micros, true))
    }

    /// Null-coalesced text form of a column, as compared by the delete phase
    pub fn key_text(self, column: &str) -> String {
        format!("COALESCE(CAST({} AS VARCHAR), '')", quote_ident(column))
    }

    /// Text form of a column with byte-wise ordering on every engine
    pub fn ordering_text(self, column: &str) -> String {
        match self {
            EngineKind::Postgres => format!("CAST({} AS VARCHAR) COLLATE \"C\"", quote_ident(column)),
            EngineKind::Sqlite => format!("CAST({} AS VARCHAR)", quote_ident(column)),
        }
    }

    /// Bind parameter limit per statement
    pub fn max_bind_params(self) -> usize {
        match self {
            EngineKind::Postgres => 65_535,
            EngineKind::Sqlite => 32_766,
        }
    }

    /// DDL creating an empty table shaped like `batch`
    pub fn create_table_sql(self, table: &TableName, batch: &RowBatch) -> String {
        let columns = batch
            .columns()
            .iter()
            .map(|c| format!("{} {}", quote_ident(c.name()), self.sql_type(c.column_type())))
            .collect::<Vec<_>>()
            .join(", ");
        format!("CREATE TABLE {} ({})", table.quoted(), columns)
    }

    /// Rows per INSERT so a chunk stays under the bind parameter limit
    pub fn rows_per_insert(self, num_columns: usize) -> usize {
        (self.max_bind_params() / num_columns.max(1)).max(1)
    }
}

/// `INSERT ... VALUES` statements covering every row of `batch`, each sized
/// to fit the engine's bind parameter limit. Yields the chunk's row count
/// with its builder.
pub(crate) fn insert_chunks<'b, DB>(
    kind: EngineKind,
    table: &TableName,
    batch: &'b RowBatch,
) -> impl Iterator<Item = (usize, QueryBuilder<'static, DB>)> + 'b
where
    DB: Database,
    <DB as Database>::Arguments<'static>: Default,
    Option<bool>: Encode<'static, DB> + Type<DB>,
    Option<i64>: Encode<'static, DB> + Type<DB>,
    Option<f64>: Encode<'static, DB> + Type<DB>,
    Option<String>: Encode<'static, DB> + Type<DB>,
    Option<NaiveDate>: Encode<'static, DB> + Type<DB>,
    Option<DateTime<Utc>>: Encode<'static, DB> + Type<DB>,
{
    let header = format!(
        "INSERT INTO {} ({}) ",
        table.quoted(),
        quote_list(&batch.column_names())
    );
    let chunk = kind.rows_per_insert(batch.num_columns());

    (0..batch.num_rows()).step_by(chunk).map(move |start| {
        let end = (start + chunk).min(batch.num_rows());
        let mut builder = QueryBuilder::<DB>::new(header.as_str());
        builder.push_values(start..end, |mut row, index| {
            for column in batch.columns() {
                let value = &column.values()[index];
                match column.column_type() {
                    ColumnType::Boolean => row.push_bind(value.as_bool()),
                    ColumnType::Integer => row.push_bind(value.as_i64()),
                    ColumnType::Float => row.push_bind(value.as_f64()),
                    ColumnType::Text => row.push_bind(value.as_str().map(str::to_string)),
                    ColumnType::Date => row.push_bind(value.as_date()),
                    ColumnType::Timestamp => row.push_bind(value.as_timestamp()),
                };
            }
        });
        (end - start, builder)
    })
}

/// Capability the pipeline needs from a destination database
#[async_trait]
pub trait Engine: Send + Sync {
    fn kind(&self) -> EngineKind;

    /// Run one statement outside any explicit transaction
    async fn execute(&self, sql: &str) -> Result<u64, sqlx::Error>;

    /// Column names in creation order; empty if the table does not exist
    async fn column_names(&self, table: &TableName) -> Result<Vec<String>, sqlx::Error>;

    /// Create `table` shaped like `batch` and load every row into it
    ///
    /// Returns the number of rows inserted.
    async fn bulk_load(&self, table: &TableName, batch: &RowBatch) -> Result<u64, sqlx::Error>;

    /// Every row of a query whose columns are all text; NULL reads as `None`
    async fn fetch_text(&self, sql: &str) -> Result<Vec<Vec<Option<String>>>, sqlx::Error>;

    async fn begin(&self) -> Result<Box<dyn EngineTransaction>, sqlx::Error>;
}

/// An open transaction; dropping it without [`commit`](EngineTransaction::commit)
/// rolls back.
#[async_trait]
pub trait EngineTransaction: Send {
    async fn execute(&mut self, sql: &str) -> Result<u64, sqlx::Error>;

    async fn commit(self: Box<Self>) -> Result<(), sqlx::Error>;
}

/// Connect to the engine named by `config.url`
pub async fn connect(config: &DbConfig) -> EngineResult<Arc<dyn Engine>> {
    let engine: Arc<dyn Engine> = match EngineKind::from_url(&config.url)? {
        EngineKind::Postgres => Arc::new(PostgresEngine::connect(config).await?),
        EngineKind::Sqlite => Arc::new(SqliteEngine::connect(config).await?),
    };
    Ok(engine)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::batch::{Column, Value};

    #[test]
    fn test_kind_from_url() {
        assert_eq!(EngineKind::from_url("postgres://u:p@h/db").unwrap(), EngineKind::Postgres);
        assert_eq!(EngineKind::from_url("postgresql://h/db").unwrap(), EngineKind::Postgres);
        assert_eq!(EngineKind::from_url("sqlite::memory:").unwrap(), EngineKind::Sqlite);
        assert!(matches!(
            EngineKind::from_url("duckdb:///tmp/x.db"),
            Err(EngineError::Config(_))
        ));
    }

    #[test]
    fn test_create_table_sql_per_dialect() {
        let batch = RowBatch::new(vec![
            Column::new("id", ColumnType::Integer, vec![Value::Integer(1)]),
            Column::new("seen_at", ColumnType::Timestamp, vec![Value::Null]),
        ])
        .unwrap();
        let table = TableName::parse("etl.movies_temp").unwrap();

        assert_eq!(
            EngineKind::Postgres.create_table_sql(&table, &batch),
            "CREATE TABLE \"etl\".\"movies_temp\" (\"id\" BIGINT, \"seen_at\" TIMESTAMPTZ)"
        );
        assert_eq!(
            EngineKind::Sqlite.create_table_sql(&table, &batch),
            "CREATE TABLE \"etl\".\"movies_temp\" (\"id\" INTEGER, \"seen_at\" TIMESTAMP)"
        );
    }

    #[test]
    fn test_rows_per_insert_respects_param_limit() {
        assert_eq!(EngineKind::Sqlite.rows_per_insert(3), 10_922);
        assert_eq!(EngineKind::Postgres.rows_per_insert(0), 65_535);
        assert_eq!(EngineKind::Sqlite.rows_per_insert(40_000), 1);
    }

    #[test]
    fn test_insert_chunks_cover_every_row() {
        let ids = (0..20_000).map(Value::Integer).collect::<Vec<_>>();
        let titles = vec![Value::Null; ids.len()];
        let batch = RowBatch::new(vec![
            Column::new("id", ColumnType::Integer, ids),
            Column::new("title", ColumnType::Text, titles),
        ])
        .unwrap();
        let table = TableName::parse("movies_temp").unwrap();

        let chunks: Vec<_> = insert_chunks::<sqlx::Sqlite>(EngineKind::Sqlite, &table, &batch).collect();
        let sizes: Vec<usize> = chunks.iter().map(|(rows, _)| *rows).collect();
        assert_eq!(sizes, vec![16_383, 3_617]);
        for (_, builder) in &chunks {
            assert!(builder.sql().starts_with("INSERT INTO \"movies_temp\" (\"id\", \"title\") VALUES ("));
        }
    }
}
