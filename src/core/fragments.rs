//! Fragment construction: turning source rows and pending changes into
//! content-addressed BASE and PATCH objects.
//!
//! Full tables are chunked into base snapshots along PK order; changesets
//! are conflated to one net change per key and stored either as a single
//! patch on the end of the existing chain or, when splitting is requested,
//! as one patch per base segment whose PK range the changes fall into,
//! plus a fresh base for keys outside every range.

use std::collections::BTreeMap;

use rayon::prelude::*;
use tracing::warn;

use crate::core::audit::{ConflatedChange, NetChange, conflate_changes};
use crate::core::engine::Engine;
use crate::core::object::{
    FragmentData, FragmentPayload, ObjectFormat, ObjectIndex, ObjectMeta, PatchEntry,
};
use crate::core::objects::ObjectManager;
use crate::core::schema::{Row, TableSchema};
use crate::core::table::Table;
use crate::core::value::Value;
use crate::core::{CancelToken, TxLog};
use crate::errors::StoreError;
use crate::hash::ObjectHash;

/// Builds new fragments and registers them together with their table
/// descriptors.
pub struct FragmentManager<'a> {
    engine: &'a Engine,
}

impl<'a> FragmentManager<'a> {
    pub fn new(engine: &'a Engine) -> FragmentManager<'a> {
        FragmentManager { engine }
    }

    /// Snapshot a source table as one or more BASE fragments of at most
    /// `chunk_size` rows each (`None` disables chunking) and register the
    /// resulting descriptor under `image_hash`. Returns the ordered object
    /// ids of the new chain.
    #[allow(clippy::too_many_arguments)]
    pub fn record_table_as_base(
        &self,
        namespace: &str,
        repository: &str,
        table_name: &str,
        image_hash: ObjectHash,
        chunk_size: Option<usize>,
        source_schema: &str,
        source_table: Option<&str>,
        extra_indexes: Option<&[String]>,
        cancel: Option<&CancelToken>,
        tx: &mut TxLog,
    ) -> Result<Vec<ObjectHash>, StoreError> {
        if chunk_size == Some(0) {
            return Err(StoreError::InvalidArgument(
                "chunk_size must be positive".to_string(),
            ));
        }
        let source_table = source_table.unwrap_or(table_name);
        let (schema, rows) = self.engine.read_table(source_schema, source_table)?;
        if let Some(cancel) = cancel {
            cancel.check()?;
        }

        let chunks: Vec<Vec<Row>> = match chunk_size {
            Some(size) => rows.chunks(size).map(|chunk| chunk.to_vec()).collect(),
            None if rows.is_empty() => Vec::new(),
            None => vec![rows],
        };
        let extra = extra_indexes.unwrap_or(&[]);

        let built: Vec<(ObjectMeta, FragmentPayload)> = chunks
            .into_par_iter()
            .map(|chunk_rows| {
                let index = ObjectIndex::from_rows(&schema, chunk_rows.iter(), extra);
                let payload = FragmentPayload {
                    schema: schema.clone(),
                    data: FragmentData::Base(chunk_rows),
                };
                let object_id = payload.content_id(&index)?;
                Ok((
                    ObjectMeta {
                        object_id,
                        format: ObjectFormat::Base,
                        parent_object_ids: Vec::new(),
                        namespace: namespace.to_string(),
                        index,
                    },
                    payload,
                ))
            })
            .collect::<Result<Vec<_>, StoreError>>()?;

        let objects = ObjectManager::new(self.engine);
        let mut object_ids = Vec::with_capacity(built.len());
        for (meta, payload) in built {
            if let Some(cancel) = cancel {
                cancel.check()?;
            }
            objects.register_objects(std::slice::from_ref(&meta), None)?;
            if self.engine.insert_payload(meta.object_id, payload) {
                tx.new_payloads.push(meta.object_id);
            }
            object_ids.push(meta.object_id);
        }
        objects.register_tables(
            namespace,
            repository,
            &[(
                image_hash,
                table_name.to_string(),
                schema,
                object_ids.clone(),
            )],
        )?;
        Ok(object_ids)
    }

    /// Store the pending changes of `prior`'s table as PATCH fragment(s)
    /// under `image_hash`. Returns the full new object chain.
    #[allow(clippy::too_many_arguments)]
    pub fn record_table_as_patch(
        &self,
        prior: &Table,
        schema_name: &str,
        image_hash: ObjectHash,
        split_changeset: bool,
        extra_indexes: Option<&[String]>,
        cancel: Option<&CancelToken>,
        tx: &mut TxLog,
    ) -> Result<Vec<ObjectHash>, StoreError> {
        let entries = self
            .engine
            .get_pending_changes(schema_name, &prior.table_name)?;
        let conflated = conflate_changes(&entries);
        let objects = ObjectManager::new(self.engine);

        // A changeset that nets out to nothing links the image to the
        // previous chain unchanged.
        if conflated.is_empty() {
            objects.register_tables(
                &prior.namespace,
                &prior.repository,
                &[(
                    image_hash,
                    prior.table_name.clone(),
                    prior.table_schema.clone(),
                    prior.objects.clone(),
                )],
            )?;
            return Ok(prior.objects.clone());
        }

        // An empty prior chain leaves nothing to delta against.
        if prior.objects.is_empty() {
            return self.record_table_as_base(
                &prior.namespace,
                &prior.repository,
                &prior.table_name,
                image_hash,
                None,
                schema_name,
                None,
                extra_indexes,
                cancel,
                tx,
            );
        }

        let extra = extra_indexes.unwrap_or(&[]);
        let schema = prior.table_schema.clone();

        let object_ids = if split_changeset {
            self.record_split_patches(&objects, prior, &schema, conflated, extra, cancel, tx)?
        } else {
            let patch_entries = to_patch_entries(&conflated);
            let parent = prior.objects[prior.objects.len() - 1];
            let object_id = self.write_patch(
                &objects,
                &schema,
                &prior.namespace,
                patch_entries,
                parent,
                extra,
                tx,
            )?;
            let mut object_ids = prior.objects.clone();
            object_ids.push(object_id);
            object_ids
        };

        objects.register_tables(
            &prior.namespace,
            &prior.repository,
            &[(
                image_hash,
                prior.table_name.clone(),
                schema,
                object_ids.clone(),
            )],
        )?;
        Ok(object_ids)
    }

    /// Partition a conflated changeset across the existing base segments'
    /// PK ranges. Segments are ordered by min PK and a key belongs to the
    /// first segment whose bounds contain it; keys outside every range go
    /// to a fresh residual BASE.
    #[allow(clippy::too_many_arguments)]
    fn record_split_patches(
        &self,
        objects: &ObjectManager<'_>,
        prior: &Table,
        schema: &TableSchema,
        conflated: BTreeMap<Vec<Value>, ConflatedChange>,
        extra: &[String],
        cancel: Option<&CancelToken>,
        tx: &mut TxLog,
    ) -> Result<Vec<ObjectHash>, StoreError> {
        let segments = objects.resolve_segments(&prior.objects)?;

        // Effective range of a segment: its base bounds grown by every
        // patch already layered on it.
        let mut ranged = Vec::with_capacity(segments.len());
        for segment in segments {
            let mut chain = vec![segment.base];
            chain.extend(segment.patches.iter().copied());
            let metas = objects.get_object_metas(&chain)?;
            let mut index = ObjectIndex::default();
            for meta in &metas {
                index.merge(&meta.index);
            }
            ranged.push((segment, index));
        }
        ranged.sort_by(|a, b| a.1.min_pk(schema).cmp(&b.1.min_pk(schema)));

        let mut per_segment: Vec<BTreeMap<Vec<Value>, ConflatedChange>> =
            vec![BTreeMap::new(); ranged.len()];
        let mut residual: BTreeMap<Vec<Value>, ConflatedChange> = BTreeMap::new();
        for (pk, change) in conflated {
            let target = ranged
                .iter()
                .position(|(_, index)| index.contains_pk(schema, &pk));
            match target {
                Some(i) => {
                    per_segment[i].insert(pk, change);
                }
                None if change.net == NetChange::Delete => {
                    // A delete outside every known range cannot hit a row.
                    warn!(
                        "Dropping delete of key {:?} outside all fragment ranges of {}",
                        pk, prior.table_name
                    );
                }
                None => {
                    residual.insert(pk, change);
                }
            }
        }

        let mut object_ids = Vec::new();
        for ((segment, _), changes) in ranged.into_iter().zip(per_segment) {
            if let Some(cancel) = cancel {
                cancel.check()?;
            }
            object_ids.push(segment.base);
            object_ids.extend(segment.patches.iter().copied());
            if changes.is_empty() {
                continue;
            }
            let parent = segment.last();
            let patch_id = self.write_patch(
                objects,
                schema,
                &prior.namespace,
                to_patch_entries(&changes),
                parent,
                extra,
                tx,
            )?;
            object_ids.push(patch_id);
        }

        if !residual.is_empty() {
            let rows: Vec<Row> = residual
                .into_values()
                .filter_map(|change| match change.net {
                    NetChange::Upsert(row) => Some(row),
                    NetChange::Delete => None,
                })
                .collect();
            let index = ObjectIndex::from_rows(schema, rows.iter(), extra);
            let payload = FragmentPayload {
                schema: schema.clone(),
                data: FragmentData::Base(rows),
            };
            let object_id = payload.content_id(&index)?;
            objects.register_objects(
                &[ObjectMeta {
                    object_id,
                    format: ObjectFormat::Base,
                    parent_object_ids: Vec::new(),
                    namespace: prior.namespace.clone(),
                    index,
                }],
                None,
            )?;
            if self.engine.insert_payload(object_id, payload) {
                tx.new_payloads.push(object_id);
            }
            object_ids.push(object_id);
        }
        Ok(object_ids)
    }

    #[allow(clippy::too_many_arguments)]
    fn write_patch(
        &self,
        objects: &ObjectManager<'_>,
        schema: &TableSchema,
        namespace: &str,
        entries: Vec<PatchEntry>,
        parent: ObjectHash,
        extra: &[String],
        tx: &mut TxLog,
    ) -> Result<ObjectHash, StoreError> {
        let index = index_for_entries(schema, &entries, extra);
        let payload = FragmentPayload {
            schema: schema.clone(),
            data: FragmentData::Patch(entries),
        };
        let object_id = payload.content_id(&index)?;
        objects.register_objects(
            &[ObjectMeta {
                object_id,
                format: ObjectFormat::Patch,
                parent_object_ids: vec![parent],
                namespace: namespace.to_string(),
                index,
            }],
            None,
        )?;
        if self.engine.insert_payload(object_id, payload) {
            tx.new_payloads.push(object_id);
        }
        Ok(object_id)
    }
}

/// Render a conflated changeset as ordered patch entries.
fn to_patch_entries(conflated: &BTreeMap<Vec<Value>, ConflatedChange>) -> Vec<PatchEntry> {
    conflated
        .iter()
        .map(|(pk, change)| match &change.net {
            NetChange::Upsert(row) => PatchEntry::Upsert(row.clone()),
            NetChange::Delete => PatchEntry::Delete(pk.clone()),
        })
        .collect()
}

/// Index bounds for a patch: upserts contribute whole rows, deletes
/// contribute their key values.
fn index_for_entries(
    schema: &TableSchema,
    entries: &[PatchEntry],
    extra: &[String],
) -> ObjectIndex {
    let pk_indices = schema.pk_indices();
    let rows: Vec<Row> = entries
        .iter()
        .map(|entry| match entry {
            PatchEntry::Upsert(row) => row.clone(),
            PatchEntry::Delete(pk) => {
                let mut row = vec![Value::Null; schema.columns.len()];
                for (i, idx) in pk_indices.iter().enumerate() {
                    if let Some(value) = pk.get(i) {
                        row[*idx] = value.clone();
                    }
                }
                row
            }
        })
        .collect();
    ObjectIndex::from_rows(schema, rows.iter(), extra)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::image::ImageManager;
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

    /// Engine with an image to attach descriptors to and a populated
    /// working table.
    fn setup(rows: &[Row]) -> (Engine, ObjectHash) {
        let engine = Engine::new("test");
        let image_hash = ObjectHash::random();
        ImageManager::new(&engine, "ns", "r")
            .add(None, image_hash, None, None, None, None)
            .unwrap();
        engine.create_schema("ns/r").unwrap();
        engine.create_table("ns/r", "t", kv_schema()).unwrap();
        for r in rows {
            engine.insert_row("ns/r", "t", r.clone()).unwrap();
        }
        (engine, image_hash)
    }

    #[test]
    fn test_base_chunking() {
        let (engine, image) = setup(&[row(1, "a"), row(2, "b"), row(3, "c")]);
        let fragments = FragmentManager::new(&engine);
        let mut tx = TxLog::default();
        let ids = fragments
            .record_table_as_base(
                "ns", "r", "t", image, Some(2), "ns/r", None, None, None, &mut tx,
            )
            .unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(tx.new_payloads.len(), 2);

        let objects = ObjectManager::new(&engine);
        let metas = objects.get_object_metas(&ids).unwrap();
        assert!(metas.iter().all(|m| m.format == ObjectFormat::Base));
        assert_eq!(
            metas[0].index.bounds.get("k"),
            Some(&(Value::Integer(1), Value::Integer(2)))
        );
        assert_eq!(
            metas[1].index.bounds.get("k"),
            Some(&(Value::Integer(3), Value::Integer(3)))
        );
    }

    /// Identical input yields identical object ids.
    #[test]
    fn test_base_deterministic_ids() {
        let (engine_a, image_a) = setup(&[row(1, "a"), row(2, "b")]);
        let (engine_b, image_b) = setup(&[row(1, "a"), row(2, "b")]);
        let mut tx = TxLog::default();
        let ids_a = FragmentManager::new(&engine_a)
            .record_table_as_base(
                "ns", "r", "t", image_a, Some(2), "ns/r", None, None, None, &mut tx,
            )
            .unwrap();
        let ids_b = FragmentManager::new(&engine_b)
            .record_table_as_base(
                "ns", "r", "t", image_b, Some(2), "ns/r", None, None, None, &mut tx,
            )
            .unwrap();
        assert_eq!(ids_a, ids_b);
    }

    #[test]
    fn test_unsplit_patch_extends_chain() {
        let (engine, image) = setup(&[row(1, "a"), row(2, "b")]);
        let fragments = FragmentManager::new(&engine);
        let mut tx = TxLog::default();
        let base_ids = fragments
            .record_table_as_base(
                "ns", "r", "t", image, None, "ns/r", None, None, None, &mut tx,
            )
            .unwrap();

        engine.manage_audit_triggers("ns/r").unwrap();
        engine
            .update_row("ns/r", "t", &[Value::Integer(1)], row(1, "A"))
            .unwrap();

        let images = ImageManager::new(&engine, "ns", "r");
        let next = ObjectHash::random();
        images.add(Some(image), next, None, None, None, None).unwrap();
        let prior = images.get_table(&image, "t").unwrap();
        let ids = fragments
            .record_table_as_patch(&prior, "ns/r", next, false, None, None, &mut tx)
            .unwrap();

        assert_eq!(ids.len(), 2);
        assert_eq!(ids[0], base_ids[0]);
        let metas = ObjectManager::new(&engine).get_object_metas(&ids).unwrap();
        assert_eq!(metas[1].format, ObjectFormat::Patch);
        assert_eq!(metas[1].parent_object_ids, vec![base_ids[0]]);
    }

    /// Splitting routes changes to the segment whose range covers them and
    /// emits a fresh base for keys outside every range.
    #[test]
    fn test_split_patch_partitioning() {
        let (engine, image) = setup(&[row(1, "a"), row(2, "b"), row(3, "c")]);
        let fragments = FragmentManager::new(&engine);
        let mut tx = TxLog::default();
        let base_ids = fragments
            .record_table_as_base(
                "ns", "r", "t", image, Some(2), "ns/r", None, None, None, &mut tx,
            )
            .unwrap();

        engine.manage_audit_triggers("ns/r").unwrap();
        engine
            .update_row("ns/r", "t", &[Value::Integer(1)], row(1, "A"))
            .unwrap();
        engine.delete_row("ns/r", "t", &[Value::Integer(3)]).unwrap();
        engine.insert_row("ns/r", "t", row(4, "d")).unwrap();

        let images = ImageManager::new(&engine, "ns", "r");
        let next = ObjectHash::random();
        images.add(Some(image), next, None, None, None, None).unwrap();
        let prior = images.get_table(&image, "t").unwrap();
        let ids = fragments
            .record_table_as_patch(&prior, "ns/r", next, true, None, None, &mut tx)
            .unwrap();

        // [base1, patch->base1, base2, patch->base2, residual base]
        assert_eq!(ids.len(), 5);
        let metas = ObjectManager::new(&engine).get_object_metas(&ids).unwrap();
        assert_eq!(metas[0].object_id, base_ids[0]);
        assert_eq!(metas[1].format, ObjectFormat::Patch);
        assert_eq!(metas[1].parent_object_ids, vec![base_ids[0]]);
        assert_eq!(metas[2].object_id, base_ids[1]);
        assert_eq!(metas[3].format, ObjectFormat::Patch);
        assert_eq!(metas[3].parent_object_ids, vec![base_ids[1]]);
        assert_eq!(metas[4].format, ObjectFormat::Base);
        assert_eq!(
            metas[4].index.bounds.get("k"),
            Some(&(Value::Integer(4), Value::Integer(4)))
        );
    }

    /// A changeset that cancels out reuses the prior chain.
    #[test]
    fn test_cancelled_out_changeset_reuses_chain() {
        let (engine, image) = setup(&[row(1, "a")]);
        let fragments = FragmentManager::new(&engine);
        let mut tx = TxLog::default();
        let base_ids = fragments
            .record_table_as_base(
                "ns", "r", "t", image, None, "ns/r", None, None, None, &mut tx,
            )
            .unwrap();

        engine.manage_audit_triggers("ns/r").unwrap();
        engine.insert_row("ns/r", "t", row(9, "z")).unwrap();
        engine.delete_row("ns/r", "t", &[Value::Integer(9)]).unwrap();

        let images = ImageManager::new(&engine, "ns", "r");
        let next = ObjectHash::random();
        images.add(Some(image), next, None, None, None, None).unwrap();
        let prior = images.get_table(&image, "t").unwrap();
        let ids = fragments
            .record_table_as_patch(&prior, "ns/r", next, false, None, None, &mut tx)
            .unwrap();
        assert_eq!(ids, base_ids);
    }
}
