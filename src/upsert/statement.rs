// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Multi-row `INSERT ... ON CONFLICT DO UPDATE` statement builder.
//!
//! Rows are normalised once ([`prepare_rows`]) and then cut into batches
//! ([`build_batches`]), each rendered as a single parameterized statement.
//! Table and column names are validated and quoted; values are always bound.
//! SQL NULLs are written as the literal `NULL` so no parameter needs a type.

use std::collections::HashSet;

use super::error::UpsertError;
use super::json_guard::guard_value;
use super::row::{TableSpec, UpsertRow};
use crate::sql_value::{SqlQuery, SqlValue};

/// Postgres limit on bind parameters in one statement.
pub const MAX_BIND_PARAMS: usize = 65_535;

/// Rows normalised against a [`TableSpec`].
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedRows {
    /// Column order shared by every row
    pub columns: Vec<String>,
    pub rows: Vec<Vec<SqlValue>>,
    /// Rows discarded for lacking a conflict-key value
    pub dropped: usize,
}

/// One rendered statement plus the data it carries.
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertBatch {
    pub table: String,
    pub conflict_columns: Vec<String>,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<SqlValue>>,
    pub statement: SqlQuery,
}

impl UpsertBatch {
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Index of each conflict column within `columns`.
    #[must_use]
    pub fn key_indexes(&self) -> Vec<usize> {
        key_indexes(&self.columns, &self.conflict_columns)
    }
}

/// `[A-Za-z_][A-Za-z0-9_]*`, optionally one `schema.` qualifier.
pub fn validate_identifier(name: &str) -> Result<(), UpsertError> {
    let valid_part = |part: &str| {
        let mut chars = part.chars();
        matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    };

    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() <= 2 && parts.iter().all(|p| valid_part(p)) {
        Ok(())
    } else {
        Err(UpsertError::InvalidIdentifier(name.to_string()))
    }
}

/// Double-quote a validated identifier, part by part.
#[must_use]
pub fn quote_identifier(name: &str) -> String {
    name.split('.')
        .map(|part| format!("\"{part}\""))
        .collect::<Vec<_>>()
        .join(".")
}

/// Largest batch that stays under the bind-parameter ceiling.
#[must_use]
pub fn effective_batch_size(requested: usize, column_count: usize) -> usize {
    let ceiling = MAX_BIND_PARAMS / column_count.max(1);
    requested.clamp(1, ceiling.max(1))
}

/// Check identifiers, drop rows without a full conflict key, guard JSON
/// columns and put every row into one column order.
///
/// The first kept row fixes the column set; a later row with a different
/// set is an error.
pub fn prepare_rows(spec: &TableSpec, rows: Vec<UpsertRow>) -> Result<PreparedRows, UpsertError> {
    validate_identifier(&spec.name)?;
    for column in &spec.conflict_columns {
        validate_identifier(column)?;
    }

    let mut columns: Option<Vec<String>> = None;
    let mut prepared = Vec::with_capacity(rows.len());
    let mut dropped = 0;

    for (index, mut row) in rows.into_iter().enumerate() {
        let has_key = spec
            .conflict_columns
            .iter()
            .all(|c| row.get(c).is_some_and(|v| !v.is_null()));
        if !has_key {
            dropped += 1;
            continue;
        }

        let found: Vec<String> = row.columns().map(str::to_string).collect();
        if columns.is_none() {
            for column in &found {
                validate_identifier(column)?;
            }
        }
        let expected = columns.get_or_insert_with(|| found.clone());
        if *expected != found {
            return Err(UpsertError::ColumnMismatch {
                table: spec.name.clone(),
                row: index,
                expected: expected.clone(),
                found,
            });
        }

        let values = expected
            .iter()
            .map(|column| {
                let value = row.take(column).unwrap_or(SqlValue::Null);
                if spec.is_json_column(column) {
                    guard_value(value)
                } else {
                    value
                }
            })
            .collect();
        prepared.push(values);
    }

    Ok(PreparedRows {
        columns: columns.unwrap_or_default(),
        rows: prepared,
        dropped,
    })
}

/// Cut prepared rows into statements, in source order.
pub fn build_batches(
    spec: &TableSpec,
    prepared: PreparedRows,
    batch_size: usize,
) -> Vec<UpsertBatch> {
    if prepared.rows.is_empty() {
        return Vec::new();
    }

    let size = effective_batch_size(batch_size, prepared.columns.len());
    let keys = key_indexes(&prepared.columns, &spec.conflict_columns);

    prepared
        .rows
        .chunks(size)
        .map(|chunk| {
            let rows = dedupe_last_wins(chunk, &keys);
            let statement = render(spec, &prepared.columns, &rows);
            UpsertBatch {
                table: spec.name.clone(),
                conflict_columns: spec.conflict_columns.clone(),
                columns: prepared.columns.clone(),
                rows,
                statement,
            }
        })
        .collect()
}

fn key_indexes(columns: &[String], conflict_columns: &[String]) -> Vec<usize> {
    conflict_columns
        .iter()
        .filter_map(|key| columns.iter().position(|c| c == key))
        .collect()
}

/// A statement may not update the same row twice, so only the last row for
/// each conflict key survives. Source order of the survivors is kept.
fn dedupe_last_wins(rows: &[Vec<SqlValue>], keys: &[usize]) -> Vec<Vec<SqlValue>> {
    if keys.is_empty() {
        return rows.to_vec();
    }

    let mut seen = HashSet::new();
    let mut kept: Vec<Vec<SqlValue>> = rows
        .iter()
        .rev()
        .filter(|row| {
            let key: Vec<String> = keys.iter().map(|&i| format!("{:?}", row[i])).collect();
            seen.insert(key)
        })
        .cloned()
        .collect();
    kept.reverse();
    kept
}

fn render(spec: &TableSpec, columns: &[String], rows: &[Vec<SqlValue>]) -> SqlQuery {
    let column_list = columns
        .iter()
        .map(|c| quote_identifier(c))
        .collect::<Vec<_>>()
        .join(", ");

    let mut params = Vec::new();
    let mut tuples = Vec::with_capacity(rows.len());
    for row in rows {
        let cells: Vec<String> = columns
            .iter()
            .zip(row)
            .map(|(column, value)| {
                if value.is_null() {
                    return "NULL".to_string();
                }
                params.push(value.clone());
                if spec.is_json_column(column) {
                    format!("${}::jsonb", params.len())
                } else {
                    format!("${}", params.len())
                }
            })
            .collect();
        tuples.push(format!("({})", cells.join(", ")));
    }

    let mut sql = format!(
        "INSERT INTO {} ({}) VALUES {}",
        quote_identifier(&spec.name),
        column_list,
        tuples.join(", ")
    );

    if !spec.conflict_columns.is_empty() {
        let conflict = spec
            .conflict_columns
            .iter()
            .map(|c| quote_identifier(c))
            .collect::<Vec<_>>()
            .join(", ");
        let updates: Vec<String> = columns
            .iter()
            .filter(|c| !spec.is_conflict_column(c))
            .map(|c| {
                let quoted = quote_identifier(c);
                format!("{quoted} = EXCLUDED.{quoted}")
            })
            .collect();

        if updates.is_empty() {
            sql.push_str(&format!(" ON CONFLICT ({conflict}) DO NOTHING"));
        } else {
            sql.push_str(&format!(
                " ON CONFLICT ({conflict}) DO UPDATE SET {}",
                updates.join(", ")
            ));
        }
    }

    SqlQuery { sql, params }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn drep_spec() -> TableSpec {
        TableSpec::new("gov.drep", &["drep_id"]).with_json_columns(&["metadata"])
    }

    fn drep_row(id: &str, power: i64, metadata: &str) -> UpsertRow {
        UpsertRow::new()
            .with("drep_id", id)
            .with("voting_power", power)
            .with("metadata", metadata)
    }

    #[test]
    fn test_identifier_validation() {
        assert!(validate_identifier("drep").is_ok());
        assert!(validate_identifier("_tmp1").is_ok());
        assert!(validate_identifier("gov.drep").is_ok());
        assert!(validate_identifier("1drep").is_err());
        assert!(validate_identifier("drep; DROP TABLE x").is_err());
        assert!(validate_identifier("a.b.c").is_err());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("a\"b").is_err());
        assert_eq!(quote_identifier("gov.drep"), "\"gov\".\"drep\"");
    }

    #[test]
    fn test_statement_shape() {
        let prepared = prepare_rows(&drep_spec(), vec![
            drep_row("d1", 10, r#"{"name":"a"}"#),
            drep_row("d2", 20, "plain"),
        ])
        .unwrap();
        let batches = build_batches(&drep_spec(), prepared, 500);

        assert_eq!(batches.len(), 1);
        let stmt = &batches[0].statement;
        // Columns are sorted: drep_id, metadata, voting_power
        assert_eq!(
            stmt.sql,
            "INSERT INTO \"gov\".\"drep\" (\"drep_id\", \"metadata\", \"voting_power\") \
             VALUES ($1, $2::jsonb, $3), ($4, $5::jsonb, $6) \
             ON CONFLICT (\"drep_id\") DO UPDATE SET \
             \"metadata\" = EXCLUDED.\"metadata\", \"voting_power\" = EXCLUDED.\"voting_power\""
        );
        assert_eq!(stmt.params.len(), 6);
        assert_eq!(stmt.params[1], SqlValue::Json(json!({"name": "a"})));
        assert_eq!(stmt.params[4], SqlValue::Json(json!("plain")));
    }

    #[test]
    fn test_null_is_literal() {
        let spec = TableSpec::new("drep", &["drep_id"]);
        let rows = vec![UpsertRow::new().with("drep_id", "d1").with("name", None::<String>)];
        let batches = build_batches(&spec, prepare_rows(&spec, rows).unwrap(), 500);

        assert!(batches[0].statement.sql.contains("VALUES ($1, NULL)"));
        assert_eq!(batches[0].statement.params, vec![SqlValue::Text("d1".into())]);
    }

    #[test]
    fn test_rows_missing_key_are_dropped() {
        let rows = vec![
            drep_row("d1", 1, "{}"),
            UpsertRow::new().with("voting_power", 2i64).with("metadata", "{}"),
            drep_row("d3", 3, "{}").with("drep_id", None::<String>),
        ];
        let prepared = prepare_rows(&drep_spec(), rows).unwrap();
        assert_eq!(prepared.rows.len(), 1);
        assert_eq!(prepared.dropped, 2);
    }

    #[test]
    fn test_column_mismatch() {
        let rows = vec![
            drep_row("d1", 1, "{}"),
            UpsertRow::new().with("drep_id", "d2").with("voting_power", 2i64),
        ];
        let err = prepare_rows(&drep_spec(), rows).unwrap_err();
        assert!(matches!(err, UpsertError::ColumnMismatch { row: 1, .. }));
    }

    #[test]
    fn test_invalid_column_name_rejected() {
        let spec = TableSpec::new("drep", &["id"]);
        let rows = vec![UpsertRow::new().with("id", 1i64).with("bad name", 2i64)];
        assert!(matches!(
            prepare_rows(&spec, rows),
            Err(UpsertError::InvalidIdentifier(name)) if name == "bad name"
        ));
    }

    #[test]
    fn test_batching_keeps_order() {
        let rows: Vec<_> = (0..5).map(|i| drep_row(&format!("d{i}"), i, "{}")).collect();
        let batches = build_batches(&drep_spec(), prepare_rows(&drep_spec(), rows).unwrap(), 2);

        let sizes: Vec<_> = batches.iter().map(UpsertBatch::len).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(batches[2].rows[0][0], SqlValue::Text("d4".into()));
    }

    #[test]
    fn test_duplicate_keys_collapse_to_last() {
        let rows = vec![
            drep_row("d1", 1, "{}"),
            drep_row("d2", 2, "{}"),
            drep_row("d1", 3, "{}"),
        ];
        let batches = build_batches(&drep_spec(), prepare_rows(&drep_spec(), rows).unwrap(), 500);

        assert_eq!(batches[0].rows.len(), 2);
        assert_eq!(batches[0].rows[0][0], SqlValue::Text("d2".into()));
        assert_eq!(batches[0].rows[1][2], SqlValue::Int(3));
    }

    #[test]
    fn test_key_only_rows_do_nothing() {
        let spec = TableSpec::new("drep_seen", &["drep_id", "epoch"]);
        let rows = vec![UpsertRow::new().with("drep_id", "d1").with("epoch", 512i64)];
        let batches = build_batches(&spec, prepare_rows(&spec, rows).unwrap(), 500);

        assert!(batches[0]
            .statement
            .sql
            .ends_with("ON CONFLICT (\"drep_id\", \"epoch\") DO NOTHING"));
    }

    #[test]
    fn test_no_conflict_key_is_plain_insert() {
        let spec = TableSpec::new("epoch_param", &[]);
        let rows = vec![UpsertRow::new().with("k", "v")];
        let batches = build_batches(&spec, prepare_rows(&spec, rows).unwrap(), 500);

        assert!(!batches[0].statement.sql.contains("ON CONFLICT"));
    }

    #[test]
    fn test_parameter_ceiling() {
        assert_eq!(effective_batch_size(500, 10), 500);
        assert_eq!(effective_batch_size(10_000, 100), 655);
        assert_eq!(effective_batch_size(0, 3), 1);
        assert_eq!(effective_batch_size(500, 0), 500);
    }
}
