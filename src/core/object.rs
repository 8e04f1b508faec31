//! Object (fragment) model: immutable, content-addressed row sets.
//!
//! An object is either a BASE (self-contained rows over one PK range) or a
//! PATCH (per-row upserts and deletes against a parent fragment). Metadata
//! and payload are stored separately so that a store can hold the metadata
//! for an object whose payload lives elsewhere.

use std::collections::BTreeMap;
use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

use crate::core::schema::{Row, TableSchema};
use crate::core::value::Value;
use crate::errors::StoreError;
use crate::hash::ObjectHash;

/// Encoding of an object: full snapshot or delta against a parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ObjectFormat {
    Base,
    Patch,
}

impl Display for ObjectFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectFormat::Base => write!(f, "BASE"),
            ObjectFormat::Patch => write!(f, "PATCH"),
        }
    }
}

/// Min/max bounds per indexed column: always the PK columns, optionally
/// extra columns requested at commit time. Used to route changes to base
/// segments and to prune fragment scans.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectIndex {
    pub bounds: BTreeMap<String, (Value, Value)>,
}

impl ObjectIndex {
    /// Compute bounds over `rows` for the PK columns plus `extra` columns.
    /// Rows containing only deletions contribute their PK values.
    pub fn from_rows<'a>(
        schema: &TableSchema,
        rows: impl Iterator<Item = &'a Row>,
        extra: &[String],
    ) -> ObjectIndex {
        let mut columns: Vec<String> = schema.pk_columns();
        for name in extra {
            if !columns.contains(name) && schema.position(name).is_some() {
                columns.push(name.clone());
            }
        }
        let positions: Vec<(String, usize)> = columns
            .into_iter()
            .filter_map(|name| schema.position(&name).map(|i| (name, i)))
            .collect();

        let mut bounds: BTreeMap<String, (Value, Value)> = BTreeMap::new();
        for row in rows {
            for (name, idx) in &positions {
                if *idx >= row.len() {
                    continue;
                }
                let value = &row[*idx];
                if matches!(value, Value::Null) {
                    continue;
                }
                bounds
                    .entry(name.clone())
                    .and_modify(|(min, max)| {
                        if value < min {
                            *min = value.clone();
                        }
                        if value > max {
                            *max = value.clone();
                        }
                    })
                    .or_insert_with(|| (value.clone(), value.clone()));
            }
        }
        ObjectIndex { bounds }
    }

    /// Whether a primary key falls inside this index's PK bounds. Keys on
    /// columns without recorded bounds are treated as outside.
    pub fn contains_pk(&self, schema: &TableSchema, pk: &[Value]) -> bool {
        let pk_columns = schema.pk_columns();
        if pk_columns.len() != pk.len() {
            return false;
        }
        for (name, value) in pk_columns.iter().zip(pk.iter()) {
            match self.bounds.get(name) {
                Some((min, max)) if value >= min && value <= max => {}
                _ => return false,
            }
        }
        true
    }

    /// Grow the bounds to cover another index (used when patches extend a
    /// base segment's range).
    pub fn merge(&mut self, other: &ObjectIndex) {
        for (name, (omin, omax)) in &other.bounds {
            self.bounds
                .entry(name.clone())
                .and_modify(|(min, max)| {
                    if omin < min {
                        *min = omin.clone();
                    }
                    if omax > max {
                        *max = omax.clone();
                    }
                })
                .or_insert_with(|| (omin.clone(), omax.clone()));
        }
    }

    /// The min bound of the first PK column, used to order base segments.
    pub fn min_pk(&self, schema: &TableSchema) -> Option<Value> {
        let first = schema.pk_columns().into_iter().next()?;
        self.bounds.get(&first).map(|(min, _)| min.clone())
    }
}

/// Registered metadata of an object: id, encoding, parent links, owning
/// namespace and the PK/secondary index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub object_id: ObjectHash,
    pub format: ObjectFormat,
    pub parent_object_ids: Vec<ObjectHash>,
    pub namespace: String,
    pub index: ObjectIndex,
}

/// A single change inside a PATCH fragment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchEntry {
    Upsert(Row),
    Delete(Vec<Value>),
}

/// The row content of a fragment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FragmentData {
    Base(Vec<Row>),
    Patch(Vec<PatchEntry>),
}

impl FragmentData {
    pub fn format(&self) -> ObjectFormat {
        match self {
            FragmentData::Base(_) => ObjectFormat::Base,
            FragmentData::Patch(_) => ObjectFormat::Patch,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            FragmentData::Base(rows) => rows.len(),
            FragmentData::Patch(entries) => entries.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The stored payload of an object: the fragment schema plus its rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FragmentPayload {
    pub schema: TableSchema,
    pub data: FragmentData,
}

impl FragmentPayload {
    /// Derive the content-addressed object id: a hash over the canonical
    /// JSON form of the schema, the rows and the index. Identical content
    /// always yields the identical identifier.
    pub fn content_id(&self, index: &ObjectIndex) -> Result<ObjectHash, StoreError> {
        let bytes = serde_json::to_vec(&(&self.schema, &self.data, index))?;
        Ok(ObjectHash::of_content(&bytes))
    }
}

/// External location of an object payload; absence means the payload lives
/// in the local store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectLocation {
    pub object_id: ObjectHash,
    pub protocol: String,
    pub location: String,
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
    fn test_index_bounds_and_containment() {
        let schema = kv_schema();
        let rows = vec![row(3, "c"), row(1, "a"), row(2, "b")];
        let index = ObjectIndex::from_rows(&schema, rows.iter(), &[]);
        assert_eq!(
            index.bounds.get("k"),
            Some(&(Value::Integer(1), Value::Integer(3)))
        );
        assert!(index.contains_pk(&schema, &[Value::Integer(2)]));
        assert!(!index.contains_pk(&schema, &[Value::Integer(4)]));
    }

    #[test]
    fn test_index_extra_columns() {
        let schema = kv_schema();
        let rows = vec![row(1, "a"), row(2, "b")];
        let index = ObjectIndex::from_rows(&schema, rows.iter(), &["v".to_string()]);
        assert_eq!(
            index.bounds.get("v"),
            Some(&(Value::Text("a".into()), Value::Text("b".into())))
        );
    }

    #[test]
    fn test_index_merge() {
        let schema = kv_schema();
        let mut index = ObjectIndex::from_rows(&schema, vec![row(1, "a")].iter(), &[]);
        let other = ObjectIndex::from_rows(&schema, vec![row(5, "e")].iter(), &[]);
        index.merge(&other);
        assert_eq!(
            index.bounds.get("k"),
            Some(&(Value::Integer(1), Value::Integer(5)))
        );
    }

    /// The same payload hashes to the same id; a different row changes it.
    #[test]
    fn test_content_id_deterministic() {
        let schema = kv_schema();
        let payload = FragmentPayload {
            schema: schema.clone(),
            data: FragmentData::Base(vec![row(1, "a"), row(2, "b")]),
        };
        let index = ObjectIndex::from_rows(
            &schema,
            match &payload.data {
                FragmentData::Base(rows) => rows.iter(),
                _ => unreachable!(),
            },
            &[],
        );
        let id1 = payload.content_id(&index).unwrap();
        let id2 = payload.content_id(&index).unwrap();
        assert_eq!(id1, id2);

        let other = FragmentPayload {
            schema,
            data: FragmentData::Base(vec![row(1, "a"), row(2, "x")]),
        };
        assert_ne!(other.content_id(&index).unwrap(), id1);
    }
}
