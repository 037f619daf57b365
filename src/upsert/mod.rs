// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bulk upsert pipeline: rows → guarded, batched `INSERT ... ON CONFLICT`.

pub mod error;
pub mod json_guard;
pub mod memory;
pub mod pipeline;
pub mod row;
pub mod sink;
pub mod statement;

pub use error::{StorageError, UpsertError};
pub use memory::{InMemoryTables, SinkOp};
pub use pipeline::{UpsertPipeline, UpsertReport};
pub use row::{TableSpec, ToUpsertRow, UpsertRow};
pub use sink::{PgTableSink, TableSink};
pub use statement::{UpsertBatch, MAX_BIND_PARAMS};
