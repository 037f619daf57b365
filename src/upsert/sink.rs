// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::debug;

use super::error::StorageError;
use super::statement::{quote_identifier, UpsertBatch};
use crate::resilience::retry::{retry, RetryConfig};

/// Destination for upsert batches.
#[async_trait]
pub trait TableSink: Send + Sync {
    /// Apply one batch. Returns rows affected.
    async fn apply(&self, batch: &UpsertBatch) -> Result<u64, StorageError>;

    /// Delete every row of `table`. Returns rows deleted.
    async fn clear(&self, table: &str) -> Result<u64, StorageError>;

    /// Replace the contents of `table` with `batches` so readers never see
    /// an empty or partial table. Returns rows written.
    async fn refresh_atomically(
        &self,
        table: &str,
        batches: &[UpsertBatch],
    ) -> Result<u64, StorageError>;
}

/// Postgres primary store.
pub struct PgTableSink {
    pool: PgPool,
}

impl PgTableSink {
    /// Connect with startup-mode retry (fails fast if config is wrong).
    pub async fn connect(connection_string: &str) -> Result<Self, StorageError> {
        let pool = retry("primary_connect", &RetryConfig::startup(), || async {
            PgPoolOptions::new()
                .max_connections(10)
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300))
                .connect(connection_string)
                .await
                .map_err(StorageError::from)
        })
        .await?;
        Ok(Self { pool })
    }

    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> PgPool {
        self.pool.clone()
    }
}

#[async_trait]
impl TableSink for PgTableSink {
    async fn apply(&self, batch: &UpsertBatch) -> Result<u64, StorageError> {
        let result = batch.statement.to_sqlx().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn clear(&self, table: &str) -> Result<u64, StorageError> {
        let sql = format!("DELETE FROM {}", quote_identifier(table));
        let result = sqlx::query(&sql).execute(&self.pool).await?;
        debug!(table, deleted = result.rows_affected(), "Cleared table");
        Ok(result.rows_affected())
    }

    async fn refresh_atomically(
        &self,
        table: &str,
        batches: &[UpsertBatch],
    ) -> Result<u64, StorageError> {
        let mut tx = self.pool.begin().await?;

        let sql = format!("DELETE FROM {}", quote_identifier(table));
        sqlx::query(&sql).execute(&mut *tx).await?;

        let mut written = 0;
        for batch in batches {
            written += batch.statement.to_sqlx().execute(&mut *tx).await?.rows_affected();
        }

        // Dropping `tx` on an early return rolls back
        tx.commit().await?;
        Ok(written)
    }
}
