// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use thiserror::Error;

/// Failure of a table sink round trip.
#[derive(Error, Debug, Clone)]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Storage operation timed out: {0}")]
    Timeout(String),
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut => StorageError::Timeout(err.to_string()),
            other => StorageError::Backend(other.to_string()),
        }
    }
}

#[derive(Error, Debug, Clone)]
pub enum UpsertError {
    #[error("Invalid SQL identifier '{0}'")]
    InvalidIdentifier(String),

    #[error("Row {row} of '{table}' has columns {found:?}, expected {expected:?}")]
    ColumnMismatch {
        table: String,
        row: usize,
        expected: Vec<String>,
        found: Vec<String>,
    },

    #[error("Upsert into '{0}' needs at least one conflict column")]
    EmptyConflictKey(String),

    #[error("Batch {batch} of '{table}' failed: {source}")]
    Sink {
        table: String,
        batch: usize,
        #[source]
        source: StorageError,
    },
}
