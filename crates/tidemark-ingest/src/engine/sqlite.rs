//! Embedded SQLite destination engine

use super::config::{DbConfig, EngineResult};
use super::{insert_chunks, Engine, EngineKind, EngineTransaction};
use crate::batch::RowBatch;
use crate::table::{quote_ident, TableName};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Row, Sqlite, Transaction};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct SqliteEngine {
    pool: SqlitePool,
}

impl SqliteEngine {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if missing) the database at `config.url`
    ///
    /// In-memory databases get a single connection so every statement sees
    /// the same data.
    pub async fn connect(config: &DbConfig) -> EngineResult<Self> {
        config.validate()?;

        let options = SqliteConnectOptions::from_str(&config.url)?.create_if_missing(true);
        let (max_connections, min_connections) = if config.is_in_memory() {
            (1, 1)
        } else {
            (config.max_connections, config.min_connections)
        };

        let mut pool_options = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs));

        if config.is_in_memory() {
            // Closing the last connection would discard the database
            pool_options = pool_options.idle_timeout(None).max_lifetime(None);
        } else if let Some(idle_timeout) = config.idle_timeout_secs {
            pool_options = pool_options.idle_timeout(Duration::from_secs(idle_timeout));
        }

        let pool = pool_options.connect_with(options).await?;

        info!(url = %config.url, max_connections, "SQLite pool created");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl Engine for SqliteEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Sqlite
    }

    async fn execute(&self, sql: &str) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(sql).persistent(false).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn column_names(&self, table: &TableName) -> Result<Vec<String>, sqlx::Error> {
        let pragma = match table.schema() {
            Some(schema) => format!(
                "PRAGMA {}.table_info({})",
                quote_ident(schema),
                quote_ident(table.name())
            ),
            None => format!("PRAGMA table_info({})", quote_ident(table.name())),
        };

        let rows = sqlx::query(&pragma).persistent(false).fetch_all(&self.pool).await?;
        rows.iter().map(|row| row.try_get::<String, _>("name")).collect()
    }

    async fn bulk_load(&self, table: &TableName, batch: &RowBatch) -> Result<u64, sqlx::Error> {
        self.execute(&self.kind().create_table_sql(table, batch)).await?;

        let mut inserted = 0;
        for (rows, mut insert) in insert_chunks::<Sqlite>(self.kind(), table, batch) {
            let result = insert.build().persistent(false).execute(&self.pool).await?;
            inserted += result.rows_affected();
            debug!(table = %table, rows, "Inserted chunk");
        }

        Ok(inserted)
    }

    async fn fetch_text(&self, sql: &str) -> Result<Vec<Vec<Option<String>>>, sqlx::Error> {
        let rows = sqlx::query(sql).persistent(false).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| (0..row.len()).map(|i| row.try_get::<Option<String>, _>(i)).collect())
            .collect()
    }

    async fn begin(&self) -> Result<Box<dyn EngineTransaction>, sqlx::Error> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(SqliteTransaction { tx }))
    }
}

struct SqliteTransaction {
    tx: Transaction<'static, Sqlite>,
}

#[async_trait]
impl EngineTransaction for SqliteTransaction {
    async fn execute(&mut self, sql: &str) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(sql).persistent(false).execute(&mut *self.tx).await?;
        Ok(result.rows_affected())
    }

    async fn commit(self: Box<Self>) -> Result<(), sqlx::Error> {
        self.tx.commit().await
    }
}
