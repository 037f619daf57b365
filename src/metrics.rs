// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for replica-sync.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host process is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `replica_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `endpoint`: replica endpoint key
//! - `table`: upsert target table
//! - `job`: scheduled job name
//! - `status` / `outcome`: result of the operation

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record the result of one endpoint within a failover execution
pub fn record_endpoint_attempt(endpoint: &str, outcome: &str) {
    counter!(
        "replica_sync_endpoint_attempts_total",
        "endpoint" => endpoint.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record circuit breaker state change (0 = closed, 1 = open)
pub fn set_circuit_state(endpoint: &str, state: u8) {
    gauge!(
        "replica_sync_circuit_breaker_state",
        "endpoint" => endpoint.to_string()
    )
    .set(state as f64);
}

/// Record an execution where every endpoint failed
pub fn record_failover_exhausted() {
    counter!("replica_sync_failover_exhausted_total").increment(1);
}

/// Record connect + fetch latency of a successful attempt
pub fn record_query_latency(endpoint: &str, duration: Duration) {
    histogram!(
        "replica_sync_query_seconds",
        "endpoint" => endpoint.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record time spent waiting for a database operation permit
pub fn record_semaphore_wait(duration: Duration) {
    histogram!("replica_sync_db_semaphore_wait_seconds").record(duration.as_secs_f64());
}

/// Record a cache lookup outcome (hit / miss)
pub fn record_cache_request(outcome: &str) {
    counter!(
        "replica_sync_cache_requests_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a swallowed cache failure
pub fn record_cache_error(operation: &str) {
    counter!(
        "replica_sync_cache_errors_total",
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Record a background cache write result (written / failed / dropped)
pub fn record_cache_background_write(status: &str) {
    counter!(
        "replica_sync_cache_background_writes_total",
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record rows sent in applied upsert batches
pub fn record_upsert_rows(table: &str, count: usize) {
    counter!(
        "replica_sync_upsert_rows_total",
        "table" => table.to_string()
    )
    .increment(count as u64);
}

/// Record rows dropped for a missing conflict key
pub fn record_upsert_rows_dropped(table: &str, count: usize) {
    counter!(
        "replica_sync_upsert_rows_dropped_total",
        "table" => table.to_string()
    )
    .increment(count as u64);
}

/// Record an upsert batch result
pub fn record_upsert_batch(table: &str, status: &str) {
    counter!(
        "replica_sync_upsert_batches_total",
        "table" => table.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a finished job run and its duration
pub fn record_job_run(job: &str, status: &str, duration: Duration) {
    counter!(
        "replica_sync_job_runs_total",
        "job" => job.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!(
        "replica_sync_job_duration_seconds",
        "job" => job.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a trigger fire dropped because the job was running
pub fn record_job_skipped(job: &str) {
    counter!(
        "replica_sync_job_skipped_total",
        "job" => job.to_string()
    )
    .increment(1);
}
