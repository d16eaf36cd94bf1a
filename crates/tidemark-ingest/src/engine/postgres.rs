//! Postgres destination engine

use super::config::{DbConfig, EngineResult};
use super::{insert_chunks, Engine, EngineKind, EngineTransaction};
use crate::batch::RowBatch;
use crate::table::TableName;
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Row, Transaction};
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct PostgresEngine {
    pool: PgPool,
}

impl PostgresEngine {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(config: &DbConfig) -> EngineResult<Self> {
        config.validate()?;

        let mut options = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs));

        if let Some(idle_timeout) = config.idle_timeout_secs {
            options = options.idle_timeout(Duration::from_secs(idle_timeout));
        }

        let pool = options.connect(&config.url).await?;

        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Postgres connection pool created"
        );

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Engine for PostgresEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Postgres
    }

    async fn execute(&self, sql: &str) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(sql).persistent(false).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn column_names(&self, table: &TableName) -> Result<Vec<String>, sqlx::Error> {
        sqlx::query_scalar::<_, String>(
            r#"
            SELECT column_name::text
            FROM information_schema.columns
            WHERE table_schema = COALESCE($1, current_schema())
              AND table_name = $2
            ORDER BY ordinal_position
            "#,
        )
        .bind(table.schema())
        .bind(table.name())
        .fetch_all(&self.pool)
        .await
    }

    async fn bulk_load(&self, table: &TableName, batch: &RowBatch) -> Result<u64, sqlx::Error> {
        self.execute(&self.kind().create_table_sql(table, batch)).await?;

        let mut inserted = 0;
        for (rows, mut insert) in insert_chunks::<Postgres>(self.kind(), table, batch) {
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
        Ok(Box::new(PgTransaction { tx }))
    }
}

struct PgTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl EngineTransaction for PgTransaction {
    async fn execute(&mut self, sql: &str) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(sql).persistent(false).execute(&mut *self.tx).await?;
        Ok(result.rows_affected())
    }

    async fn commit(self: Box<Self>) -> Result<(), sqlx::Error> {
        self.tx.commit().await
    }
}
