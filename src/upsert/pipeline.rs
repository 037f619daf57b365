// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bulk upsert and full-refresh runs.
//!
//! Batches are applied strictly in source order. The first failing batch
//! aborts the run and the error propagates; earlier batches stay applied
//! (except in transactional refresh, where nothing is visible until commit).

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use super::error::UpsertError;
use super::row::{TableSpec, UpsertRow};
use super::sink::TableSink;
use super::statement::{build_batches, prepare_rows, UpsertBatch};
use crate::config::{RefreshMode, ReplicaSyncConfig};
use crate::metrics;

/// Summary of one upsert or refresh run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertReport {
    /// Rows handed to the pipeline
    pub rows_submitted: usize,
    /// Rows discarded for a missing conflict key
    pub rows_dropped: usize,
    pub batches: usize,
    /// Rows the store reported as affected
    pub rows_affected: u64,
}

pub struct UpsertPipeline {
    sink: Arc<dyn TableSink>,
    refresh_mode: RefreshMode,
    default_batch_size: usize,
}

impl UpsertPipeline {
    pub fn new(sink: Arc<dyn TableSink>, config: &ReplicaSyncConfig) -> Self {
        Self {
            sink,
            refresh_mode: config.refresh_mode,
            default_batch_size: config.upsert_batch_size.max(1),
        }
    }

    #[must_use]
    pub fn with_refresh_mode(mut self, mode: RefreshMode) -> Self {
        self.refresh_mode = mode;
        self
    }

    #[must_use]
    pub fn refresh_mode(&self) -> RefreshMode {
        self.refresh_mode
    }

    /// Insert-or-update `rows` into `spec.name`, last write wins per key.
    #[tracing::instrument(skip(self, spec, rows), fields(table = %spec.name, rows = rows.len()))]
    pub async fn upsert(
        &self,
        spec: &TableSpec,
        rows: Vec<UpsertRow>,
        batch_size: Option<usize>,
    ) -> Result<UpsertReport, UpsertError> {
        if spec.conflict_columns.is_empty() {
            return Err(UpsertError::EmptyConflictKey(spec.name.clone()));
        }

        let (batches, mut report) = self.prepare(spec, rows, batch_size)?;
        let start = Instant::now();

        for (index, batch) in batches.iter().enumerate() {
            report.rows_affected += self.apply_batch(spec, index, batch).await?;
        }

        info!(
            batches = report.batches,
            affected = report.rows_affected,
            dropped = report.rows_dropped,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Upsert complete"
        );
        Ok(report)
    }

    /// Replace the whole table with `rows`.
    ///
    /// With [`RefreshMode::DeleteThenInsert`] readers can observe an empty or
    /// partially filled table while the run is in progress.
    #[tracing::instrument(skip(self, spec, rows), fields(table = %spec.name, rows = rows.len()))]
    pub async fn full_refresh(
        &self,
        spec: &TableSpec,
        rows: Vec<UpsertRow>,
        batch_size: Option<usize>,
    ) -> Result<UpsertReport, UpsertError> {
        let (batches, mut report) = self.prepare(spec, rows, batch_size)?;

        match self.refresh_mode {
            RefreshMode::DeleteThenInsert => {
                let deleted = self
                    .sink
                    .clear(&spec.name)
                    .await
                    .map_err(|source| UpsertError::Sink {
                        table: spec.name.clone(),
                        batch: 0,
                        source,
                    })?;
                debug!(deleted, "Table cleared for refresh");

                for (index, batch) in batches.iter().enumerate() {
                    report.rows_affected += self.apply_batch(spec, index, batch).await?;
                }
            }
            RefreshMode::Transactional => {
                report.rows_affected = self
                    .sink
                    .refresh_atomically(&spec.name, &batches)
                    .await
                    .map_err(|source| {
                        metrics::record_upsert_batch(&spec.name, "error");
                        UpsertError::Sink {
                            table: spec.name.clone(),
                            batch: 0,
                            source,
                        }
                    })?;
                for batch in &batches {
                    metrics::record_upsert_batch(&spec.name, "success");
                    metrics::record_upsert_rows(&spec.name, batch.len());
                }
            }
        }

        info!(
            mode = ?self.refresh_mode,
            batches = report.batches,
            affected = report.rows_affected,
            "Full refresh complete"
        );
        Ok(report)
    }

    fn prepare(
        &self,
        spec: &TableSpec,
        rows: Vec<UpsertRow>,
        batch_size: Option<usize>,
    ) -> Result<(Vec<UpsertBatch>, UpsertReport), UpsertError> {
        let rows_submitted = rows.len();
        let prepared = prepare_rows(spec, rows)?;
        let rows_dropped = prepared.dropped;

        if rows_dropped > 0 {
            metrics::record_upsert_rows_dropped(&spec.name, rows_dropped);
            warn!(table = %spec.name, dropped = rows_dropped, "Dropped rows missing a conflict key");
        }

        let batches = build_batches(spec, prepared, batch_size.unwrap_or(self.default_batch_size));
        let report = UpsertReport {
            rows_submitted,
            rows_dropped,
            batches: batches.len(),
            rows_affected: 0,
        };
        Ok((batches, report))
    }

    async fn apply_batch(
        &self,
        spec: &TableSpec,
        index: usize,
        batch: &UpsertBatch,
    ) -> Result<u64, UpsertError> {
        match self.sink.apply(batch).await {
            Ok(affected) => {
                metrics::record_upsert_batch(&spec.name, "success");
                metrics::record_upsert_rows(&spec.name, batch.len());
                debug!(batch = index, rows = batch.len(), affected, "Batch applied");
                Ok(affected)
            }
            Err(source) => {
                metrics::record_upsert_batch(&spec.name, "error");
                warn!(table = %spec.name, batch = index, error = %source, "Batch failed, aborting run");
                Err(UpsertError::Sink {
                    table: spec.name.clone(),
                    batch: index,
                    source,
                })
            }
        }
    }
}
