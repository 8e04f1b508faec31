//! The object store surface: registration of fragment metadata, locations
//! and table descriptors, payload transfer between stores, chain
//! resolution and payload cleanup.
//!
//! Registration is idempotent. An identifier collision with differing
//! content is reported as a clash rather than silently keeping the first
//! record: identifiers are content-derived, so a mismatch means something
//! upstream is corrupt.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info};

use crate::core::engine::{Engine, TableRecord};
use crate::core::object::{ObjectFormat, ObjectLocation, ObjectMeta};
use crate::core::schema::TableSchema;
use crate::core::{CancelToken, TxLog, repo_key};
use crate::errors::StoreError;
use crate::hash::ObjectHash;

/// One base segment of a table chain: a BASE fragment and the patches
/// layered on it, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub base: ObjectHash,
    pub patches: Vec<ObjectHash>,
}

impl Segment {
    /// The newest fragment of the segment; the parent for the next patch.
    pub fn last(&self) -> ObjectHash {
        *self.patches.last().unwrap_or(&self.base)
    }
}

/// A table descriptor row to register: image hash, table name, schema and
/// the ordered object chain.
pub type TableEntry = (ObjectHash, String, TableSchema, Vec<ObjectHash>);

/// Object catalog operations over one engine.
pub struct ObjectManager<'a> {
    engine: &'a Engine,
}

impl<'a> ObjectManager<'a> {
    pub fn new(engine: &'a Engine) -> ObjectManager<'a> {
        ObjectManager { engine }
    }

    /// Register object metadata, idempotently. A record that already
    /// exists is preserved; re-registering with different content is a
    /// clash. `namespace` optionally rewrites the owning namespace, as
    /// used when uploading into another user's store.
    pub fn register_objects(
        &self,
        metas: &[ObjectMeta],
        namespace: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut meta_store = self.engine.write_meta();
        for meta in metas {
            let mut meta = meta.clone();
            if let Some(namespace) = namespace {
                meta.namespace = namespace.to_string();
            }
            if let Some(existing) = meta_store.objects.get(&meta.object_id) {
                if existing.format != meta.format
                    || existing.parent_object_ids != meta.parent_object_ids
                    || existing.index != meta.index
                {
                    return Err(StoreError::ObjectClash(meta.object_id.to_string()));
                }
                continue;
            }
            meta_store.objects.insert(meta.object_id, meta);
        }
        Ok(())
    }

    /// Record external payload locations, idempotently per object. The
    /// object metadata must already be registered.
    pub fn register_object_locations(
        &self,
        locations: &[ObjectLocation],
    ) -> Result<(), StoreError> {
        let mut meta_store = self.engine.write_meta();
        for location in locations {
            if !meta_store.objects.contains_key(&location.object_id) {
                return Err(StoreError::Integrity(format!(
                    "location for unregistered object {}",
                    location.object_id
                )));
            }
            meta_store
                .object_locations
                .entry(location.object_id)
                .or_insert_with(|| location.clone());
        }
        Ok(())
    }

    /// Write table descriptors. Every referenced object must already be
    /// registered and the image must exist.
    pub fn register_tables(
        &self,
        namespace: &str,
        repository: &str,
        entries: &[TableEntry],
    ) -> Result<(), StoreError> {
        let key = repo_key(namespace, repository);
        let mut meta_store = self.engine.write_meta();
        for (image_hash, table_name, table_schema, object_ids) in entries {
            for object_id in object_ids {
                if !meta_store.objects.contains_key(object_id) {
                    return Err(StoreError::Integrity(format!(
                        "descriptor for {table_name}@{image_hash} references unregistered object {object_id}"
                    )));
                }
            }
            let repo = meta_store.repositories.entry(key.clone()).or_default();
            if !repo.images.contains_key(image_hash) {
                return Err(StoreError::Integrity(format!(
                    "descriptor for {table_name} references unknown image {image_hash}"
                )));
            }
            repo.tables.entry(*image_hash).or_default().insert(
                table_name.clone(),
                TableRecord {
                    table_schema: table_schema.clone(),
                    object_ids: object_ids.clone(),
                },
            );
        }
        Ok(())
    }

    /// Known external locations for the given objects.
    pub fn get_object_locations(&self, object_ids: &[ObjectHash]) -> Vec<ObjectLocation> {
        let meta_store = self.engine.read_meta();
        object_ids
            .iter()
            .filter_map(|id| meta_store.object_locations.get(id).cloned())
            .collect()
    }

    /// Registered metadata for the given objects; missing ids are an
    /// integrity error.
    pub fn get_object_metas(
        &self,
        object_ids: &[ObjectHash],
    ) -> Result<Vec<ObjectMeta>, StoreError> {
        let meta_store = self.engine.read_meta();
        object_ids
            .iter()
            .map(|id| {
                meta_store
                    .objects
                    .get(id)
                    .cloned()
                    .ok_or_else(|| StoreError::ObjectNotFound(id.to_string()))
            })
            .collect()
    }

    /// Acquire payloads for `object_ids`: external locations first
    /// (delegating to the matching handler), then the source store for
    /// objects with no location. Returns the ids actually fetched.
    pub fn download_objects(
        &self,
        source: Option<&Engine>,
        object_ids: &[ObjectHash],
        locations: &[ObjectLocation],
        cancel: Option<&CancelToken>,
    ) -> Result<Vec<ObjectHash>, StoreError> {
        let located: BTreeMap<ObjectHash, &ObjectLocation> = locations
            .iter()
            .map(|location| (location.object_id, location))
            .collect();

        let mut fetched = Vec::new();
        let mut by_protocol: BTreeMap<String, Vec<ObjectLocation>> = BTreeMap::new();
        for object_id in object_ids {
            if let Some(cancel) = cancel {
                cancel.check()?;
            }
            if self.engine.has_payload(object_id) {
                continue;
            }
            if let Some(location) = located.get(object_id) {
                by_protocol
                    .entry(location.protocol.clone())
                    .or_default()
                    .push((*location).clone());
                continue;
            }
            let payload = source
                .and_then(|source| source.get_payload(object_id))
                .ok_or_else(|| StoreError::ObjectNotFound(object_id.to_string()))?;
            if self.engine.insert_payload(*object_id, payload) {
                fetched.push(*object_id);
            }
        }

        for (protocol, locations) in by_protocol {
            let handler = self.engine.handlers().get(&protocol)?;
            let downloaded = handler.download(self.engine, &locations)?;
            fetched.extend(downloaded);
        }
        if !fetched.is_empty() {
            debug!("Fetched {} object payload(s)", fetched.len());
        }
        Ok(fetched)
    }

    /// Transfer payloads for `object_ids` towards `target`: the `DB`
    /// handler pushes them into the target's local store, anything else
    /// goes through the registered external handler and yields new
    /// location records.
    pub fn upload_objects(
        &self,
        target: &Engine,
        object_ids: &[ObjectHash],
        handler: &str,
        handler_params: &serde_json::Value,
        cancel: Option<&CancelToken>,
        tx: &mut TxLog,
    ) -> Result<Vec<ObjectLocation>, StoreError> {
        if handler == "DB" {
            for object_id in object_ids {
                if let Some(cancel) = cancel {
                    cancel.check()?;
                }
                if target.has_payload(object_id) {
                    continue;
                }
                let payload = self
                    .engine
                    .get_payload(object_id)
                    .ok_or_else(|| StoreError::ObjectNotFound(object_id.to_string()))?;
                if target.insert_payload(*object_id, payload) {
                    tx.new_payloads.push(*object_id);
                }
            }
            return Ok(Vec::new());
        }
        let external = self.engine.handlers().get(handler)?;
        external.upload(self.engine, object_ids, handler_params)
    }

    /// Every object referenced by any table descriptor on this engine.
    pub fn referenced_objects(&self) -> BTreeSet<ObjectHash> {
        let meta_store = self.engine.read_meta();
        meta_store
            .repositories
            .values()
            .flat_map(|repo| repo.tables.values())
            .flat_map(|tables| tables.values())
            .flat_map(|record| record.object_ids.iter().copied())
            .collect()
    }

    /// Remove local payloads unreferenced by any table descriptor.
    /// Metadata and external locations are preserved.
    pub fn cleanup(&self) -> Result<Vec<ObjectHash>, StoreError> {
        let referenced = self.referenced_objects();
        let unreferenced: Vec<ObjectHash> = self
            .engine
            .payload_ids()
            .into_iter()
            .filter(|id| !referenced.contains(id))
            .collect();
        self.engine.remove_payloads(&unreferenced);
        if !unreferenced.is_empty() {
            info!("Deleted {} unreferenced object payload(s)", unreferenced.len());
        }
        Ok(unreferenced)
    }

    /// Resolve an object chain into ordered base segments, validating the
    /// composition invariant: a leading BASE, every PATCH extending the
    /// newest fragment of one of the preceding segments.
    pub fn resolve_segments(
        &self,
        object_ids: &[ObjectHash],
    ) -> Result<Vec<Segment>, StoreError> {
        let metas = self.get_object_metas(object_ids).map_err(|err| match err {
            StoreError::ObjectNotFound(id) => {
                StoreError::Integrity(format!("chain references unregistered object {id}"))
            }
            other => other,
        })?;
        let mut segments: Vec<Segment> = Vec::new();
        for meta in metas {
            match meta.format {
                ObjectFormat::Base => segments.push(Segment {
                    base: meta.object_id,
                    patches: Vec::new(),
                }),
                ObjectFormat::Patch => {
                    let parent = *meta.parent_object_ids.first().ok_or_else(|| {
                        StoreError::Integrity(format!(
                            "patch {} has no parent fragment",
                            meta.object_id
                        ))
                    })?;
                    let segment = segments
                        .iter_mut()
                        .find(|segment| segment.last() == parent)
                        .ok_or_else(|| {
                            StoreError::Integrity(format!(
                                "patch {} does not extend any preceding fragment",
                                meta.object_id
                            ))
                        })?;
                    segment.patches.push(meta.object_id);
                }
            }
        }
        if segments.is_empty() && !object_ids.is_empty() {
            return Err(StoreError::Integrity(
                "object chain has no BASE fragment".to_string(),
            ));
        }
        Ok(segments)
    }

    /// Walk a fragment's parent pointers up to the closest BASE. Returns
    /// the base id and the patch path walked, newest first. The whole
    /// parent graph is loaded once and crawled in memory.
    pub fn closest_base(
        &self,
        object_id: &ObjectHash,
    ) -> Result<(ObjectHash, Vec<ObjectHash>), StoreError> {
        let graph: BTreeMap<ObjectHash, (ObjectFormat, Vec<ObjectHash>)> = {
            let meta_store = self.engine.read_meta();
            meta_store
                .objects
                .iter()
                .map(|(id, meta)| (*id, (meta.format, meta.parent_object_ids.clone())))
                .collect()
        };

        let mut path = Vec::new();
        let mut seen = BTreeSet::new();
        let mut current = *object_id;
        loop {
            if !seen.insert(current) {
                return Err(StoreError::Integrity(format!(
                    "cycle in object chain at {current}"
                )));
            }
            let (format, parents) = graph
                .get(&current)
                .ok_or_else(|| StoreError::ObjectNotFound(current.to_string()))?;
            match format {
                ObjectFormat::Base => return Ok((current, path)),
                ObjectFormat::Patch => {
                    path.push(current);
                    current = *parents.first().ok_or_else(|| {
                        StoreError::Integrity(format!(
                            "no BASE fragment reachable from {object_id}"
                        ))
                    })?;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::object::ObjectIndex;

    fn meta(id: ObjectHash, format: ObjectFormat, parents: Vec<ObjectHash>) -> ObjectMeta {
        ObjectMeta {
            object_id: id,
            format,
            parent_object_ids: parents,
            namespace: "ns".to_string(),
            index: ObjectIndex::default(),
        }
    }

    #[test]
    fn test_register_objects_idempotent_and_clashing() {
        let engine = Engine::new("test");
        let objects = ObjectManager::new(&engine);
        let id = ObjectHash::random();
        let record = meta(id, ObjectFormat::Base, vec![]);

        objects.register_objects(&[record.clone()], None).unwrap();
        objects.register_objects(&[record.clone()], None).unwrap();

        let clashing = meta(id, ObjectFormat::Patch, vec![ObjectHash::random()]);
        assert!(matches!(
            objects.register_objects(&[clashing], None),
            Err(StoreError::ObjectClash(_))
        ));
    }

    #[test]
    fn test_locations_require_registered_objects() {
        let engine = Engine::new("test");
        let objects = ObjectManager::new(&engine);
        let location = ObjectLocation {
            object_id: ObjectHash::random(),
            protocol: "FILE".to_string(),
            location: "/nowhere".to_string(),
        };
        assert!(matches!(
            objects.register_object_locations(&[location]),
            Err(StoreError::Integrity(_))
        ));
    }

    #[test]
    fn test_resolve_segments() {
        let engine = Engine::new("test");
        let objects = ObjectManager::new(&engine);
        let b1 = ObjectHash::random();
        let b2 = ObjectHash::random();
        let p1 = ObjectHash::random();
        let p2 = ObjectHash::random();
        objects
            .register_objects(
                &[
                    meta(b1, ObjectFormat::Base, vec![]),
                    meta(b2, ObjectFormat::Base, vec![]),
                    meta(p1, ObjectFormat::Patch, vec![b1]),
                    meta(p2, ObjectFormat::Patch, vec![p1]),
                ],
                None,
            )
            .unwrap();

        let segments = objects
            .resolve_segments(&[b1, p1, b2, p2])
            .unwrap();
        assert_eq!(
            segments,
            vec![
                Segment {
                    base: b1,
                    patches: vec![p1, p2]
                },
                Segment {
                    base: b2,
                    patches: vec![]
                },
            ]
        );
    }

    #[test]
    fn test_resolve_segments_rejects_malformed_chains() {
        let engine = Engine::new("test");
        let objects = ObjectManager::new(&engine);
        let b1 = ObjectHash::random();
        let p1 = ObjectHash::random();
        objects
            .register_objects(
                &[
                    meta(b1, ObjectFormat::Base, vec![]),
                    meta(p1, ObjectFormat::Patch, vec![ObjectHash::random()]),
                ],
                None,
            )
            .unwrap();

        // Patch first: no BASE to extend.
        assert!(matches!(
            objects.resolve_segments(&[p1]),
            Err(StoreError::Integrity(_))
        ));
        // Patch whose parent is not in the chain.
        assert!(matches!(
            objects.resolve_segments(&[b1, p1]),
            Err(StoreError::Integrity(_))
        ));
    }

    #[test]
    fn test_closest_base() {
        let engine = Engine::new("test");
        let objects = ObjectManager::new(&engine);
        let base = ObjectHash::random();
        let p1 = ObjectHash::random();
        let p2 = ObjectHash::random();
        objects
            .register_objects(
                &[
                    meta(base, ObjectFormat::Base, vec![]),
                    meta(p1, ObjectFormat::Patch, vec![base]),
                    meta(p2, ObjectFormat::Patch, vec![p1]),
                ],
                None,
            )
            .unwrap();

        let (found, path) = objects.closest_base(&p2).unwrap();
        assert_eq!(found, base);
        assert_eq!(path, vec![p2, p1]);
    }

    #[test]
    fn test_download_from_source_store() {
        let local = Engine::new("local");
        let remote = Engine::new("remote");
        let id = ObjectHash::random();
        let payload = crate::core::object::FragmentPayload {
            schema: crate::core::schema::TableSchema::new(vec![]),
            data: crate::core::object::FragmentData::Base(vec![]),
        };
        remote.insert_payload(id, payload.clone());

        let objects = ObjectManager::new(&local);
        let fetched = objects
            .download_objects(Some(&remote), &[id], &[], None)
            .unwrap();
        assert_eq!(fetched, vec![id]);
        assert_eq!(local.get_payload(&id), Some(payload));

        // Second download is a no-op.
        let fetched = objects
            .download_objects(Some(&remote), &[id], &[], None)
            .unwrap();
        assert!(fetched.is_empty());

        assert!(matches!(
            objects.download_objects(None, &[ObjectHash::random()], &[], None),
            Err(StoreError::ObjectNotFound(_))
        ));
    }
}
