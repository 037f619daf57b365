// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::collections::{BTreeMap, BTreeSet};

use crate::sql_value::SqlValue;

/// Column → value map for one target row.
///
/// Nullable domain fields should be set to [`SqlValue::Null`] rather than
/// left out: every row in a batch must carry the same column set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpsertRow {
    values: BTreeMap<String, SqlValue>,
}

impl UpsertRow {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style column setter.
    #[must_use]
    pub fn with(mut self, column: &str, value: impl Into<SqlValue>) -> Self {
        self.set(column, value);
        self
    }

    pub fn set(&mut self, column: &str, value: impl Into<SqlValue>) {
        self.values.insert(column.to_string(), value.into());
    }

    #[must_use]
    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.values.get(column)
    }

    /// Column names in sorted order.
    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub(crate) fn take(&mut self, column: &str) -> Option<SqlValue> {
        self.values.remove(column)
    }
}

impl FromIterator<(String, SqlValue)> for UpsertRow {
    fn from_iter<I: IntoIterator<Item = (String, SqlValue)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

/// Maps a domain record onto its target-table row.
pub trait ToUpsertRow {
    fn to_upsert_row(&self) -> UpsertRow;
}

impl ToUpsertRow for UpsertRow {
    fn to_upsert_row(&self) -> UpsertRow {
        self.clone()
    }
}

/// Target table of an upsert: name, conflict key and JSON-typed columns.
///
/// ```
/// use replica_sync::upsert::TableSpec;
///
/// let spec = TableSpec::new("gov.drep_metadata", &["drep_id"]).with_json_columns(&["anchor"]);
/// assert!(spec.is_json_column("anchor"));
/// assert!(spec.is_conflict_column("drep_id"));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct TableSpec {
    pub name: String,
    /// Ordered conflict key
    pub conflict_columns: Vec<String>,
    pub json_columns: BTreeSet<String>,
}

impl TableSpec {
    pub fn new(name: &str, conflict_columns: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            conflict_columns: conflict_columns.iter().map(|c| c.to_string()).collect(),
            json_columns: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn with_json_columns(mut self, columns: &[&str]) -> Self {
        self.json_columns.extend(columns.iter().map(|c| c.to_string()));
        self
    }

    #[must_use]
    pub fn is_json_column(&self, column: &str) -> bool {
        self.json_columns.contains(column)
    }

    #[must_use]
    pub fn is_conflict_column(&self, column: &str) -> bool {
        self.conflict_columns.iter().any(|c| c == column)
    }
}
