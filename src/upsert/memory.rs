// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-memory [`TableSink`] that applies batches structurally.
//!
//! Rows are keyed by their conflict-column values and merged with the same
//! rules the generated SQL uses: `DO UPDATE` overwrites non-key columns,
//! `DO NOTHING` keeps the existing row. Used by tests and local development.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use super::error::StorageError;
use super::statement::UpsertBatch;
use super::TableSink;
use crate::sql_value::SqlValue;

pub type StoredRow = BTreeMap<String, SqlValue>;

/// Operation log entry, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkOp {
    Apply { table: String, rows: usize },
    Clear { table: String },
    Refresh { table: String, batches: usize },
}

#[derive(Default)]
pub struct InMemoryTables {
    /// table → (key debug string → row)
    tables: DashMap<String, BTreeMap<String, StoredRow>>,
    ops: Mutex<Vec<SinkOp>>,
    /// Batches still allowed before `apply` starts failing
    fail_after: Mutex<Option<usize>>,
    applied: AtomicUsize,
}

impl InMemoryTables {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `apply` after the first `n` fail.
    pub fn fail_after_batches(&self, n: usize) {
        *self.fail_after.lock() = Some(n);
    }

    /// Rows of `table`, ordered by conflict key.
    #[must_use]
    pub fn rows(&self, table: &str) -> Vec<StoredRow> {
        self.tables
            .get(table)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn row_count(&self, table: &str) -> usize {
        self.tables.get(table).map(|t| t.len()).unwrap_or(0)
    }

    /// Find a row by one column value.
    #[must_use]
    pub fn find(&self, table: &str, column: &str, value: &SqlValue) -> Option<StoredRow> {
        self.tables
            .get(table)?
            .values()
            .find(|row| row.get(column) == Some(value))
            .cloned()
    }

    #[must_use]
    pub fn ops(&self) -> Vec<SinkOp> {
        self.ops.lock().clone()
    }

    /// Total successful `apply` calls.
    #[must_use]
    pub fn applied_batches(&self) -> usize {
        self.applied.load(Ordering::SeqCst)
    }

    fn check_failure(&self) -> Result<(), StorageError> {
        let mut fail_after = self.fail_after.lock();
        match fail_after.as_mut() {
            Some(0) => Err(StorageError::Backend("injected batch failure".into())),
            Some(remaining) => {
                *remaining -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

fn merge_batch(table: &mut BTreeMap<String, StoredRow>, batch: &UpsertBatch) -> u64 {
    let keys = batch.key_indexes();
    let mut affected = 0;

    for (position, values) in batch.rows.iter().enumerate() {
        let key = if keys.is_empty() {
            // No conflict key: every row is new
            format!("#{}#{}", table.len(), position)
        } else {
            keys.iter()
                .map(|&i| format!("{:?}", values[i]))
                .collect::<Vec<_>>()
                .join("|")
        };

        let row: StoredRow = batch.columns.iter().cloned().zip(values.iter().cloned()).collect();
        let updates_anything = batch.columns.len() > keys.len();

        match table.get_mut(&key) {
            Some(existing) if updates_anything => {
                *existing = row;
                affected += 1;
            }
            Some(_) => {}
            None => {
                table.insert(key, row);
                affected += 1;
            }
        }
    }
    affected
}

#[async_trait]
impl TableSink for InMemoryTables {
    async fn apply(&self, batch: &UpsertBatch) -> Result<u64, StorageError> {
        self.check_failure()?;
        let affected = merge_batch(
            &mut self.tables.entry(batch.table.clone()).or_default(),
            batch,
        );
        self.applied.fetch_add(1, Ordering::SeqCst);
        self.ops.lock().push(SinkOp::Apply {
            table: batch.table.clone(),
            rows: batch.rows.len(),
        });
        Ok(affected)
    }

    async fn clear(&self, table: &str) -> Result<u64, StorageError> {
        let removed = self
            .tables
            .get_mut(table)
            .map(|mut t| {
                let n = t.len() as u64;
                t.clear();
                n
            })
            .unwrap_or(0);
        self.ops.lock().push(SinkOp::Clear {
            table: table.to_string(),
        });
        Ok(removed)
    }

    async fn refresh_atomically(
        &self,
        table: &str,
        batches: &[UpsertBatch],
    ) -> Result<u64, StorageError> {
        let mut replacement = BTreeMap::new();
        let mut written = 0;
        for batch in batches {
            self.check_failure()?;
            written += merge_batch(&mut replacement, batch);
        }

        // Swap only once every batch succeeded
        self.tables.insert(table.to_string(), replacement);
        self.ops.lock().push(SinkOp::Refresh {
            table: table.to_string(),
            batches: batches.len(),
        });
        Ok(written)
    }
}
