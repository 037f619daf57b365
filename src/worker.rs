// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! One sync worker per entity type.
//!
//! A [`SyncWorker`] wires a replica registry, failover executor, upsert
//! pipeline, cache and a named job coordinator from one
//! [`ReplicaSyncConfig`]. The entity-specific parts (endpoints, queries, row
//! mappers, target tables, job definitions) are injected.
//!
//! # Example
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use std::time::Duration;
//! # use replica_sync::{ReplicaSyncConfig, SyncWorker};
//! # use replica_sync::replica::{Endpoint, QueryError};
//! # use replica_sync::scheduler::JobDefinition;
//! # use replica_sync::sql_value::SqlQuery;
//! # use replica_sync::upsert::{TableSpec, UpsertRow};
//! # use sqlx::Row;
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ReplicaSyncConfig { scheduler_name: "drep-worker".into(), ..Default::default() };
//! let endpoints = vec![
//!     Endpoint::new("replica-a", 1, "postgres://sync@replica-a/gov"),
//!     Endpoint::new("replica-b", 2, "postgres://sync@replica-b/gov"),
//! ];
//! let worker = SyncWorker::connect_postgres(
//!     config,
//!     endpoints,
//!     "postgres://app@primary/app",
//!     "redis://localhost",
//! )
//! .await?;
//!
//! worker.register_sync(
//!     JobDefinition::new("drep-list", "0 0 2 * * ?").with_startup(Duration::from_secs(5)),
//!     SqlQuery::new("SELECT drep_id, voting_power FROM drep_list"),
//!     Arc::new(|row: &sqlx::postgres::PgRow| -> Result<UpsertRow, QueryError> {
//!         Ok(UpsertRow::new()
//!             .with("drep_id", row.try_get::<String, _>("drep_id")?)
//!             .with("voting_power", row.try_get::<i64, _>("voting_power")?))
//!     }),
//!     TableSpec::new("drep", &["drep_id"]),
//! )?;
//!
//! worker.start()?;
//! tokio::signal::ctrl_c().await?;
//! worker.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::cache::{CacheAside, CacheError, KeyValueStore, RedisKeyValueStore};
use crate::config::ReplicaSyncConfig;
use crate::jobs::{ReplicaSyncJob, RowMapper, SyncMode};
use crate::replica::{Endpoint, EndpointRegistry, FailoverExecutor, PgReplicaBackend, ReplicaBackend};
use crate::scheduler::{Job, JobCoordinator, JobDefinition, SchedulerError};
use crate::sql_value::SqlQuery;
use crate::upsert::{PgTableSink, StorageError, TableSink, TableSpec, ToUpsertRow, UpsertPipeline};

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("primary store: {0}")]
    Storage(#[from] StorageError),
    #[error("cache: {0}")]
    Cache(#[from] CacheError),
    #[error("scheduler: {0}")]
    Scheduler(#[from] SchedulerError),
}

pub struct SyncWorker<B: ReplicaBackend> {
    config: ReplicaSyncConfig,
    executor: FailoverExecutor<B>,
    pipeline: Arc<UpsertPipeline>,
    cache: Arc<CacheAside>,
    coordinator: JobCoordinator,
}

impl<B: ReplicaBackend> SyncWorker<B> {
    /// Compose a worker from already-built backends. Must be called inside a
    /// Tokio runtime.
    pub fn new(
        config: ReplicaSyncConfig,
        endpoints: Vec<Endpoint>,
        backend: Arc<B>,
        sink: Arc<dyn TableSink>,
        cache_store: Arc<dyn KeyValueStore>,
    ) -> Self {
        let registry = Arc::new(EndpointRegistry::new(endpoints));
        let executor = FailoverExecutor::from_config(registry, backend, &config);
        let pipeline = Arc::new(UpsertPipeline::new(sink, &config));
        let cache = Arc::new(CacheAside::new(cache_store, &config));
        let coordinator = JobCoordinator::new(&config.scheduler_name, config.startup_ordering);

        Self {
            config,
            executor,
            pipeline,
            cache,
            coordinator,
        }
    }

    #[must_use]
    pub fn config(&self) -> &ReplicaSyncConfig {
        &self.config
    }

    #[must_use]
    pub fn executor(&self) -> &FailoverExecutor<B> {
        &self.executor
    }

    #[must_use]
    pub fn pipeline(&self) -> &Arc<UpsertPipeline> {
        &self.pipeline
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<CacheAside> {
        &self.cache
    }

    #[must_use]
    pub fn coordinator(&self) -> &JobCoordinator {
        &self.coordinator
    }

    /// Register a custom job body.
    pub fn register(&self, definition: JobDefinition, job: Arc<dyn Job>) -> Result<(), SchedulerError> {
        self.coordinator.register_job(definition, job)
    }

    /// Register the standard fetch → upsert job for one target table.
    pub fn register_sync<T>(
        &self,
        definition: JobDefinition,
        query: SqlQuery,
        mapper: RowMapper<B::Row, T>,
        table: TableSpec,
    ) -> Result<(), SchedulerError>
    where
        T: ToUpsertRow + Send + Sync + 'static,
    {
        self.register_sync_with(definition, query, mapper, table, SyncMode::Upsert, &[])
    }

    /// Like [`register_sync`](Self::register_sync), with a sync mode and cache
    /// keys to invalidate after each successful run.
    pub fn register_sync_with<T>(
        &self,
        definition: JobDefinition,
        query: SqlQuery,
        mapper: RowMapper<B::Row, T>,
        table: TableSpec,
        mode: SyncMode,
        invalidate: &[&str],
    ) -> Result<(), SchedulerError>
    where
        T: ToUpsertRow + Send + Sync + 'static,
    {
        let mut job = ReplicaSyncJob::new(
            &definition.name,
            self.executor.clone(),
            query,
            mapper,
            Arc::clone(&self.pipeline),
            table,
        )
        .with_mode(mode)
        .with_batch_size(self.config.upsert_batch_size);
        if !invalidate.is_empty() {
            job = job.invalidating(Arc::clone(&self.cache), invalidate);
        }
        self.coordinator.register_job(definition, Arc::new(job))
    }

    pub fn start(&self) -> Result<(), SchedulerError> {
        info!(
            scheduler = %self.coordinator.name(),
            endpoints = self.executor.registry().len(),
            jobs = self.coordinator.job_names().len(),
            "Starting sync worker"
        );
        self.coordinator.start()
    }

    /// Stop triggers and wait for running jobs, then drain queued cache
    /// writes and release replica connections.
    pub async fn shutdown(&self) {
        self.coordinator.shutdown().await;
        self.cache.shutdown().await;
        self.executor.backend().close().await;
        info!(scheduler = %self.coordinator.name(), "Sync worker stopped");
    }
}

impl SyncWorker<PgReplicaBackend> {
    /// Postgres replicas and primary with a Redis cache.
    pub async fn connect_postgres(
        config: ReplicaSyncConfig,
        endpoints: Vec<Endpoint>,
        primary_url: &str,
        redis_url: &str,
    ) -> Result<Self, WorkerError> {
        let backend = Arc::new(PgReplicaBackend::new(
            config.timeouts(),
            config.max_concurrent_db_ops as u32,
        ));
        let sink = Arc::new(PgTableSink::connect(primary_url).await?);
        let cache_store = Arc::new(
            RedisKeyValueStore::with_prefix(redis_url, config.cache_key_prefix.as_deref()).await?,
        );
        Ok(Self::new(config, endpoints, backend, sink, cache_store))
    }
}
