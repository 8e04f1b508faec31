//! Row-level comparison of the same table across two materializations.
//!
//! The fast paths (audit aggregation, identical object sets) live in the
//! repository's `diff` dispatch; this module holds the result type and the
//! PK-join compare used when both sides have to be materialized.

use std::collections::BTreeMap;

use crate::core::audit::ChangeAggregate;
use crate::core::schema::{Row, TableSchema};
use crate::core::value::Value;

/// Outcome of comparing one table between two images (or an image and the
/// staging area).
#[derive(Debug, Clone, PartialEq)]
pub enum DiffResult {
    /// Table absent on the left side, present on the right.
    Added,
    /// Table present on the left side, absent on the right.
    Removed,
    /// Row changes: `(true, row)` for rows only on the right side,
    /// `(false, row)` for rows only on the left. An updated key emits its
    /// old row as removed and its new row as added.
    Rows(Vec<(bool, Row)>),
    /// Net added/removed/updated counts.
    Aggregate(ChangeAggregate),
}

impl DiffResult {
    /// The empty diff in the requested shape.
    pub fn empty(aggregate: bool) -> DiffResult {
        if aggregate {
            DiffResult::Aggregate(ChangeAggregate::default())
        } else {
            DiffResult::Rows(Vec::new())
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            DiffResult::Rows(rows) => rows.is_empty(),
            DiffResult::Aggregate(agg) => agg.is_empty(),
            DiffResult::Added | DiffResult::Removed => false,
        }
    }
}

/// Join two row sets on primary key and report the difference, either as
/// counts or as the ordered change list.
pub fn compare_tables(
    schema: &TableSchema,
    rows_a: Vec<Row>,
    rows_b: Vec<Row>,
    aggregate: bool,
) -> DiffResult {
    let keyed = |rows: Vec<Row>| -> BTreeMap<Vec<Value>, Row> {
        rows.into_iter().map(|row| (schema.pk_of(&row), row)).collect()
    };
    let left = keyed(rows_a);
    let right = keyed(rows_b);

    let mut agg = ChangeAggregate::default();
    let mut changes: Vec<(bool, Row)> = Vec::new();
    for (pk, row) in &left {
        match right.get(pk) {
            None => {
                agg.removed += 1;
                changes.push((false, row.clone()));
            }
            Some(other) if other != row => {
                agg.updated += 1;
                changes.push((false, row.clone()));
                changes.push((true, other.clone()));
            }
            Some(_) => {}
        }
    }
    for (pk, row) in &right {
        if !left.contains_key(pk) {
            agg.added += 1;
            changes.push((true, row.clone()));
        }
    }

    if aggregate {
        DiffResult::Aggregate(agg)
    } else {
        DiffResult::Rows(changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schema::Column;
    use crate::core::value::ColumnType;

    fn kv_schema() -> TableSchema {
        TableSchema::new(vec![
            Column::new("k", ColumnType::Integer, true),
            Column::new("v", ColumnType::Text, false),
        ])
    }

    fn row(k: i64, v: &str) -> Row {
        vec![Value::Integer(k), Value::Text(v.into())]
    }

    #[test]
    fn test_compare_aggregate() {
        let result = compare_tables(
            &kv_schema(),
            vec![row(1, "a"), row(2, "b"), row(3, "c")],
            vec![row(1, "A"), row(2, "b"), row(4, "d")],
            true,
        );
        assert_eq!(
            result,
            DiffResult::Aggregate(ChangeAggregate {
                added: 1,
                removed: 1,
                updated: 1
            })
        );
    }

    #[test]
    fn test_compare_rows_emits_update_pairs() {
        let result = compare_tables(
            &kv_schema(),
            vec![row(1, "a")],
            vec![row(1, "A")],
            false,
        );
        assert_eq!(
            result,
            DiffResult::Rows(vec![(false, row(1, "a")), (true, row(1, "A"))])
        );
    }

    #[test]
    fn test_compare_identical_is_empty() {
        let rows = vec![row(1, "a"), row(2, "b")];
        assert!(compare_tables(&kv_schema(), rows.clone(), rows, false).is_empty());
    }
}
