// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for a replica sync worker.
//!
//! Values arrive already parsed (the host decides whether they come from a
//! file, the environment or flags). Every field has a default.
//!
//! # Example
//!
//! ```
//! use replica_sync::ReplicaSyncConfig;
//!
//! // Minimal config (uses defaults)
//! let config = ReplicaSyncConfig::default();
//! assert_eq!(config.max_concurrent_db_ops, 8);
//! assert_eq!(config.upsert_batch_size, 500);
//! assert!(config.cache_fire_and_forget);
//!
//! // Tuned config
//! let config = ReplicaSyncConfig {
//!     max_concurrent_db_ops: 4,
//!     breaker_failure_threshold: 5,
//!     ..Default::default()
//! };
//! assert_eq!(config.breaker_failure_threshold, 5);
//! ```

use std::time::Duration;

use serde::Deserialize;

use crate::resilience::circuit_breaker::CircuitConfig;
use crate::resilience::retry::RetryConfig;
use crate::replica::backend::DbTimeouts;

/// How a full-refresh job replaces the contents of its target table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshMode {
    /// Delete every row, then insert the batches one by one. Readers can
    /// observe an empty or partially filled table while the refresh runs.
    #[default]
    DeleteThenInsert,
    /// Delete and insert inside a single transaction. Readers see either the
    /// old contents or the new contents.
    Transactional,
}

/// How a dependent job's startup run is ordered after its producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartupOrdering {
    /// Fixed delays only. Nothing checks that the producer finished.
    #[default]
    Delay,
    /// The dependent waits for the producer's startup run to finish, then
    /// applies its own delay.
    AwaitCompletion,
}

/// Configuration for a replica sync worker.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplicaSyncConfig {
    /// Name of this worker's scheduler instance (one per entity type)
    #[serde(default = "default_scheduler_name")]
    pub scheduler_name: String,

    /// Process-wide cap on concurrent replica/primary database operations
    #[serde(default = "default_max_concurrent_db_ops")]
    pub max_concurrent_db_ops: usize,

    /// Timeout for acquiring a connection to one endpoint
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Timeout for running one query on an acquired connection
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Attempts per endpoint for retriable failures
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// Consecutive failures that open an endpoint's breaker
    #[serde(default = "default_breaker_failure_threshold")]
    pub breaker_failure_threshold: u32,
    /// How long an open breaker excludes its endpoint
    #[serde(default = "default_breaker_cooldown_secs")]
    pub breaker_cooldown_secs: u64,

    /// Cache write mode: background (true) or synchronous (false)
    #[serde(default = "default_cache_fire_and_forget")]
    pub cache_fire_and_forget: bool,
    /// Optional key prefix for namespacing a shared cache
    #[serde(default)]
    pub cache_key_prefix: Option<String>,
    /// Bounded queue length for background cache writes
    #[serde(default = "default_cache_writer_queue")]
    pub cache_writer_queue: usize,

    /// Rows per upsert statement
    #[serde(default = "default_upsert_batch_size")]
    pub upsert_batch_size: usize,
    #[serde(default)]
    pub refresh_mode: RefreshMode,
    #[serde(default)]
    pub startup_ordering: StartupOrdering,
}

fn default_scheduler_name() -> String { "replica-sync".to_string() }
fn default_max_concurrent_db_ops() -> usize { 8 }
fn default_connect_timeout_ms() -> u64 { 5_000 }
fn default_read_timeout_ms() -> u64 { 30_000 }
fn default_max_retries() -> usize { 3 }
fn default_retry_base_delay_ms() -> u64 { 500 }
fn default_retry_max_delay_ms() -> u64 { 10_000 }
fn default_breaker_failure_threshold() -> u32 { 3 }
fn default_breaker_cooldown_secs() -> u64 { 60 }
fn default_cache_fire_and_forget() -> bool { true }
fn default_cache_writer_queue() -> usize { 1024 }
fn default_upsert_batch_size() -> usize { 500 }

impl Default for ReplicaSyncConfig {
    fn default() -> Self {
        Self {
            scheduler_name: default_scheduler_name(),
            max_concurrent_db_ops: default_max_concurrent_db_ops(),
            connect_timeout_ms: default_connect_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            breaker_failure_threshold: default_breaker_failure_threshold(),
            breaker_cooldown_secs: default_breaker_cooldown_secs(),
            cache_fire_and_forget: default_cache_fire_and_forget(),
            cache_key_prefix: None,
            cache_writer_queue: default_cache_writer_queue(),
            upsert_batch_size: default_upsert_batch_size(),
            refresh_mode: RefreshMode::default(),
            startup_ordering: StartupOrdering::default(),
        }
    }
}

impl ReplicaSyncConfig {
    /// Retry policy applied per endpoint by the failover executor.
    #[must_use]
    pub fn retry(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries.max(1),
            initial_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            factor: 2.0,
        }
    }

    #[must_use]
    pub fn circuit(&self) -> CircuitConfig {
        CircuitConfig {
            failure_threshold: self.breaker_failure_threshold.max(1),
            cooldown: Duration::from_secs(self.breaker_cooldown_secs),
        }
    }

    #[must_use]
    pub fn timeouts(&self) -> DbTimeouts {
        DbTimeouts {
            connect: Duration::from_millis(self.connect_timeout_ms),
            read: Duration::from_millis(self.read_timeout_ms),
        }
    }
}
