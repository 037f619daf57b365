// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The generic sync job: read from replicas, map, write to the primary.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::cache::CacheAside;
use crate::replica::{FailoverExecutor, QueryError, ReplicaBackend};
use crate::scheduler::{Job, JobError};
use crate::sql_value::SqlQuery;
use crate::upsert::{TableSpec, ToUpsertRow, UpsertPipeline};

/// Row mapper from a backend row to a domain record.
pub type RowMapper<R, T> = Arc<dyn Fn(&R) -> Result<T, QueryError> + Send + Sync>;

/// How fetched rows reach the target table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Insert-or-update by conflict key
    #[default]
    Upsert,
    /// Replace the table; for sources without a stable identity
    FullRefresh,
}

/// Fetch via failover → map → upsert (or full refresh), then invalidate
/// dependent cache keys.
pub struct ReplicaSyncJob<B: ReplicaBackend, T> {
    name: String,
    executor: FailoverExecutor<B>,
    query: SqlQuery,
    mapper: RowMapper<B::Row, T>,
    pipeline: Arc<UpsertPipeline>,
    table: TableSpec,
    mode: SyncMode,
    batch_size: Option<usize>,
    cache: Option<Arc<CacheAside>>,
    invalidate: Vec<String>,
}

impl<B, T> ReplicaSyncJob<B, T>
where
    B: ReplicaBackend,
    T: ToUpsertRow + Send + Sync + 'static,
{
    pub fn new(
        name: &str,
        executor: FailoverExecutor<B>,
        query: SqlQuery,
        mapper: RowMapper<B::Row, T>,
        pipeline: Arc<UpsertPipeline>,
        table: TableSpec,
    ) -> Self {
        Self {
            name: name.to_string(),
            executor,
            query,
            mapper,
            pipeline,
            table,
            mode: SyncMode::Upsert,
            batch_size: None,
            cache: None,
            invalidate: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_mode(mut self, mode: SyncMode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    /// Remove `keys` from `cache` after each successful run.
    #[must_use]
    pub fn invalidating(mut self, cache: Arc<CacheAside>, keys: &[&str]) -> Self {
        self.cache = Some(cache);
        self.invalidate = keys.iter().map(|k| k.to_string()).collect();
        self
    }
}

#[async_trait]
impl<B, T> Job for ReplicaSyncJob<B, T>
where
    B: ReplicaBackend,
    T: ToUpsertRow + Send + Sync + 'static,
{
    async fn run(&self) -> Result<(), JobError> {
        let mapper = &self.mapper;
        let records = self.executor.execute(&self.query, |row| mapper(row)).await?;
        let rows = records.iter().map(ToUpsertRow::to_upsert_row).collect::<Vec<_>>();
        let fetched = rows.len();

        let report = match self.mode {
            SyncMode::Upsert => self.pipeline.upsert(&self.table, rows, self.batch_size).await?,
            SyncMode::FullRefresh => {
                self.pipeline.full_refresh(&self.table, rows, self.batch_size).await?
            }
        };

        if let Some(cache) = &self.cache {
            let keys: Vec<&str> = self.invalidate.iter().map(String::as_str).collect();
            let result = cache.remove_multiple(&keys).await;
            if !result.is_complete() {
                // Stale entries still expire on their own
                warn!(job = %self.name, failed = result.failed.len(), "Cache invalidation incomplete");
            }
        }

        info!(
            job = %self.name,
            table = %self.table.name,
            fetched,
            affected = report.rows_affected,
            dropped = report.rows_dropped,
            "Replica sync finished"
        );
        Ok(())
    }
}
