// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Replica Sync
//!
//! Scheduled replication of read-replica query results into a primary store,
//! with a cache-aside layer in front of the primary.
//!
//! ## Architecture
//!
//! Each entity type gets one [`SyncWorker`]: a named job coordinator whose
//! jobs fetch from a prioritised list of replicas and upsert into the
//! primary.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Job Coordinator                         │
//! │  • Daily cron trigger + optional startup trigger           │
//! │  • Single-flight per job, misfires fire immediately        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Failover Query Executor                    │
//! │  • Endpoints tried in priority order                       │
//! │  • Per-endpoint circuit breaker, shared DB semaphore       │
//! │  • Fresh connection per attempt, bounded timeouts          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                      (rows → UpsertRow)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Bulk Upsert Pipeline                      │
//! │  • Batched INSERT .. ON CONFLICT DO UPDATE                 │
//! │  • JSON guard for document columns                         │
//! │  • Full refresh for sources without a stable key           │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                      (invalidate keys)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Cache-Aside                            │
//! │  • Expiry embedded in the stored value                     │
//! │  • Sync or fire-and-forget writes                          │
//! │  • Hit/miss outcome per request                            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use replica_sync::{ReplicaSyncConfig, SyncWorker};
//! use replica_sync::replica::Endpoint;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ReplicaSyncConfig {
//!         scheduler_name: "proposal-worker".into(),
//!         ..Default::default()
//!     };
//!     let endpoints = vec![
//!         Endpoint::new("replica-a", 1, "postgres://sync@replica-a/gov"),
//!         Endpoint::new("replica-b", 2, "postgres://sync@replica-b/gov"),
//!     ];
//!
//!     let worker = SyncWorker::connect_postgres(
//!         config,
//!         endpoints,
//!         "postgres://app@primary/app",
//!         "redis://localhost:6379",
//!     )
//!     .await?;
//!
//!     // Cache-aside reads in front of the primary
//!     let total: i64 = worker
//!         .cache()
//!         .get_or_set("proposals:count", Some(Duration::from_secs(60)), || async {
//!             Ok::<_, std::io::Error>(42)
//!         })
//!         .await?;
//!     println!("proposals: {total}");
//!
//!     worker.start()?;
//!     tokio::signal::ctrl_c().await?;
//!     worker.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! See [`ReplicaSyncConfig`] for all configuration options.
//!
//! ## Modules
//!
//! - [`replica`]: Endpoint registry and the [`FailoverExecutor`]
//! - [`resilience`]: Circuit breakers and retry logic
//! - [`cache`]: [`CacheAside`] over Redis or memory
//! - [`upsert`]: Batched upserts and full refresh into the primary
//! - [`scheduler`]: Named [`JobCoordinator`] with cron and startup triggers
//! - [`jobs`]: The standard fetch → upsert job
//! - [`worker`]: One [`SyncWorker`] per entity type

pub mod cache;
pub mod clock;
pub mod config;
pub mod jobs;
pub mod metrics;
pub mod replica;
pub mod resilience;
pub mod scheduler;
pub mod sql_value;
pub mod upsert;
pub mod worker;

pub use cache::{CacheAside, CacheError, CacheOutcome, KeyValueStore};
pub use clock::{Clock, SharedClock};
pub use config::{RefreshMode, ReplicaSyncConfig, StartupOrdering};
pub use jobs::{ReplicaSyncJob, RowMapper, SyncMode};
pub use replica::{Endpoint, FailoverError, FailoverExecutor, QueryError, ReplicaBackend};
pub use resilience::{CircuitConfig, CircuitState, RetryConfig};
pub use scheduler::{Job, JobCoordinator, JobDefinition, JobError, SchedulerError};
pub use sql_value::{SqlQuery, SqlValue};
pub use upsert::{TableSink, TableSpec, UpsertError, UpsertPipeline, UpsertRow};
pub use worker::{SyncWorker, WorkerError};
