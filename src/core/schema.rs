//! Table schemas: the ordered column list attached to every table
//! descriptor and fragment. Two schemas are equal iff they have the same
//! columns with the same types and PK membership in the same order; a
//! difference forces the commit engine back to a full snapshot.

use serde::{Deserialize, Serialize};

use crate::core::value::{ColumnType, Value};
use crate::errors::StoreError;

/// A row is an ordered list of cell values matching the schema's columns.
pub type Row = Vec<Value>;

/// One column of a table schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub col_type: ColumnType,
    pub is_pk: bool,
}

impl Column {
    pub fn new(name: impl Into<String>, col_type: ColumnType, is_pk: bool) -> Column {
        Column {
            name: name.into(),
            col_type,
            is_pk,
        }
    }
}

/// The ordered column list of a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub columns: Vec<Column>,
}

impl TableSchema {
    pub fn new(columns: Vec<Column>) -> TableSchema {
        TableSchema { columns }
    }

    /// Positions of the primary key columns. A table with no declared PK
    /// is keyed by the whole row.
    pub fn pk_indices(&self) -> Vec<usize> {
        let declared: Vec<usize> = self
            .columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_pk)
            .map(|(i, _)| i)
            .collect();
        if declared.is_empty() {
            (0..self.columns.len()).collect()
        } else {
            declared
        }
    }

    /// Names of the primary key columns.
    pub fn pk_columns(&self) -> Vec<String> {
        self.pk_indices()
            .into_iter()
            .map(|i| self.columns[i].name.clone())
            .collect()
    }

    /// Extract the primary key values out of a row.
    pub fn pk_of(&self, row: &Row) -> Vec<Value> {
        self.pk_indices().iter().map(|&i| row[i].clone()).collect()
    }

    /// Position of a column by name.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Check a row's width and cell types against the schema. `Null` is
    /// accepted in any non-PK column.
    pub fn validate_row(&self, row: &Row) -> Result<(), StoreError> {
        if row.len() != self.columns.len() {
            return Err(StoreError::InvalidArgument(format!(
                "row has {} values, schema has {} columns",
                row.len(),
                self.columns.len()
            )));
        }
        for (value, column) in row.iter().zip(self.columns.iter()) {
            match value.column_type() {
                Some(t) if t != column.col_type => {
                    return Err(StoreError::InvalidArgument(format!(
                        "column {} expects {}, got {}",
                        column.name, column.col_type, t
                    )));
                }
                None if column.is_pk => {
                    return Err(StoreError::InvalidArgument(format!(
                        "NULL in primary key column {}",
                        column.name
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Keep only the named columns, in the requested order.
    pub fn project(&self, names: &[String]) -> Result<TableSchema, StoreError> {
        let mut columns = Vec::with_capacity(names.len());
        for name in names {
            let idx = self.position(name).ok_or_else(|| {
                StoreError::InvalidArgument(format!("unknown column {name}"))
            })?;
            columns.push(self.columns[idx].clone());
        }
        Ok(TableSchema { columns })
    }
}
