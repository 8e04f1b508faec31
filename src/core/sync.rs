//! Synchronization of repository metadata and object payloads between two
//! stores: the machinery behind clone, push and pull.
//!
//! A sync gathers everything present on the source but missing on the
//! target (images, table descriptors, object metadata, locations and
//! tags), then registers it in dependency order: images parent before
//! child, objects before locations, descriptors only once their objects
//! exist, tags last. Any failure rolls back both ends.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::{error, info};

use crate::core::engine::{Engine, Upstream, lock_latch};
use crate::core::image::Image;
use crate::core::object::{ObjectLocation, ObjectMeta};
use crate::core::objects::TableEntry;
use crate::core::repository::Repository;
use crate::core::{CancelToken, HEAD, TxLog};
use crate::errors::StoreError;
use crate::hash::ObjectHash;

/// Resolves a remote name to an engine; how the sync layer reaches peers
/// configured outside the library.
pub trait RemoteLookup {
    fn engine(&self, name: &str) -> Result<Arc<Engine>, StoreError>;
}

/// Everything present on the source repository but missing on the target.
#[derive(Debug, Default)]
pub struct SyncMetadata {
    /// New images in parent-before-child order.
    pub new_images: Vec<Image>,
    pub table_meta: Vec<TableEntry>,
    pub object_meta: Vec<ObjectMeta>,
    pub object_locations: Vec<ObjectLocation>,
    /// Non-HEAD tags referencing any of the new images.
    pub tags: BTreeMap<String, ObjectHash>,
}

/// Compute the metadata delta between `source` and `target` for one
/// repository.
pub fn gather_sync_metadata(
    target: &Repository,
    source: &Repository,
) -> Result<SyncMetadata, StoreError> {
    let target_images: BTreeSet<ObjectHash> = target
        .images()
        .all_images()
        .into_iter()
        .map(|image| image.image_hash)
        .collect();
    let source_images = source.images().all_images();

    // Order the new images parent-before-child: emit every image whose
    // parent is already known, repeating until the set drains.
    let mut remaining: Vec<Image> = source_images
        .into_iter()
        .filter(|image| !target_images.contains(&image.image_hash))
        .collect();
    let mut known = target_images;
    let mut new_images: Vec<Image> = Vec::with_capacity(remaining.len());
    while !remaining.is_empty() {
        let (ready, still): (Vec<Image>, Vec<Image>) = remaining.into_iter().partition(
            |image| match image.parent_id {
                None => true,
                Some(parent) => known.contains(&parent),
            },
        );
        if ready.is_empty() {
            return Err(StoreError::Integrity(format!(
                "image graph of {source} has unreachable parents"
            )));
        }
        known.extend(ready.iter().map(|image| image.image_hash));
        new_images.extend(ready);
        remaining = still;
    }

    let mut table_meta: Vec<TableEntry> = Vec::new();
    let mut referenced: BTreeSet<ObjectHash> = BTreeSet::new();
    for image in &new_images {
        for table_name in source.images().get_tables(&image.image_hash) {
            let table = source.images().get_table(&image.image_hash, &table_name)?;
            referenced.extend(table.objects.iter().copied());
            table_meta.push((
                image.image_hash,
                table_name,
                table.table_schema,
                table.objects,
            ));
        }
    }

    let missing: Vec<ObjectHash> = {
        let target_meta = target.engine.read_meta();
        referenced
            .into_iter()
            .filter(|id| !target_meta.objects.contains_key(id))
            .collect()
    };
    let object_meta = source.objects().get_object_metas(&missing)?;
    let object_locations = source.objects().get_object_locations(&missing);

    let new_hashes: BTreeSet<ObjectHash> =
        new_images.iter().map(|image| image.image_hash).collect();
    let tags: BTreeMap<String, ObjectHash> = source
        .images()
        .all_tags()
        .into_iter()
        .filter(|(tag, image_hash)| tag != HEAD && new_hashes.contains(image_hash))
        .collect();

    Ok(SyncMetadata {
        new_images,
        table_meta,
        object_meta,
        object_locations,
        tags,
    })
}

/// Generic sync routine: fetch images, descriptors, objects and tags
/// present on `source` but not on `target`. With `download`, payload
/// transfer is pulled towards the target (optionally up front); without
/// it, the source uploads payloads through `handler`.
#[allow(clippy::too_many_arguments)]
pub fn sync_repositories(
    target: &Repository,
    source: &Repository,
    download: bool,
    download_all: bool,
    handler: &str,
    handler_options: &serde_json::Value,
    cancel: Option<&CancelToken>,
) -> Result<(), StoreError> {
    let latch = target.engine.repo_latch(&target.to_schema());
    let _guard = lock_latch(&latch);

    info!("Gathering remote metadata...");
    let gathered = gather_sync_metadata(target, source)?;
    if gathered.new_images.is_empty() {
        info!("Nothing to do.");
        return Ok(());
    }

    let target_snapshot = target.engine.meta_snapshot();
    let source_snapshot = source.engine.meta_snapshot();
    let mut tx = TxLog::default();
    let result = sync_inner(
        target,
        source,
        &gathered,
        download,
        download_all,
        handler,
        handler_options,
        cancel,
        &mut tx,
    );
    if let Err(err) = result {
        error!("Error during repository sync: {err}");
        target.engine.restore_meta(target_snapshot);
        source.engine.restore_meta(source_snapshot);
        target.engine.remove_payloads(&tx.new_payloads);
        return Err(err);
    }

    info!(
        "{} metadata for {} object(s), {} table version(s) and {} tag(s).",
        if download { "Fetched" } else { "Uploaded" },
        gathered.object_meta.len(),
        gathered.table_meta.len(),
        gathered.tags.len(),
    );
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn sync_inner(
    target: &Repository,
    source: &Repository,
    gathered: &SyncMetadata,
    download: bool,
    download_all: bool,
    handler: &str,
    handler_options: &serde_json::Value,
    cancel: Option<&CancelToken>,
    tx: &mut TxLog,
) -> Result<(), StoreError> {
    for image in &gathered.new_images {
        if let Some(cancel) = cancel {
            cancel.check()?;
        }
        target.images().add(
            image.parent_id,
            image.image_hash,
            Some(image.created),
            image.comment.clone(),
            image.provenance_type,
            image.provenance_data.clone(),
        )?;
    }

    let object_ids: Vec<ObjectHash> = gathered
        .object_meta
        .iter()
        .map(|meta| meta.object_id)
        .collect();

    if download {
        target.objects().register_objects(&gathered.object_meta, None)?;
        target
            .objects()
            .register_object_locations(&gathered.object_locations)?;
        // Payloads are normally fetched lazily at checkout time.
        if download_all {
            info!("Fetching remote objects...");
            let fetched = target.objects().download_objects(
                Some(source.engine.as_ref()),
                &object_ids,
                &gathered.object_locations,
                cancel,
            )?;
            tx.new_payloads.extend(fetched);
        }
        // A bare target stays bare; a checked-out target keeps its HEAD.
        if !target.engine.schema_exists(&target.to_schema()) {
            target.set_head(None)?;
        }
    } else {
        let new_uploads = source.objects().upload_objects(
            &target.engine,
            &object_ids,
            handler,
            handler_options,
            cancel,
            tx,
        )?;
        // Metadata lands after the transfer but before the location
        // records: locations reference registered objects.
        target
            .objects()
            .register_objects(&gathered.object_meta, Some(target.namespace.as_str()))?;
        let mut locations = gathered.object_locations.clone();
        locations.extend(new_uploads.iter().cloned());
        target.objects().register_object_locations(&locations)?;
        source.objects().register_object_locations(&new_uploads)?;
    }

    target.objects().register_tables(
        &target.namespace,
        &target.repository,
        &gathered.table_meta,
    )?;
    target.set_tags(&gathered.tags)?;
    Ok(())
}

/// Clone a remote repository, or synchronize new remote changes into an
/// existing local one. The local repository defaults to the remote's name
/// on `local_engine` and adopts the remote as its upstream if it has none.
pub fn clone_repository(
    remote: &Repository,
    local: Option<Repository>,
    local_engine: Option<Arc<Engine>>,
    download_all: bool,
    cancel: Option<&CancelToken>,
) -> Result<Repository, StoreError> {
    let local = match local {
        Some(local) => local,
        None => {
            let engine = local_engine.ok_or_else(|| {
                StoreError::InvalidArgument(
                    "either a local repository or a local engine is needed".to_string(),
                )
            })?;
            Repository::new(remote.namespace.clone(), remote.repository.clone(), engine)
        }
    };
    sync_repositories(
        &local,
        remote,
        true,
        download_all,
        "DB",
        &serde_json::Value::Null,
        cancel,
    )?;
    if local.get_upstream().is_none() {
        local.set_upstream(Upstream {
            remote_name: remote.engine.name().to_string(),
            remote_namespace: remote.namespace.clone(),
            remote_repository: remote.repository.clone(),
        });
    }
    Ok(local)
}

impl Repository {
    fn upstream_repository(
        &self,
        lookup: &dyn RemoteLookup,
    ) -> Result<Repository, StoreError> {
        let upstream = self.get_upstream().ok_or_else(|| {
            StoreError::InvalidArgument(format!(
                "no remote repository specified and no upstream found for {self}"
            ))
        })?;
        Ok(Repository::new(
            upstream.remote_namespace,
            upstream.remote_repository,
            lookup.engine(&upstream.remote_name)?,
        ))
    }

    /// Push all local changes to `remote` and transfer new object
    /// payloads through `handler`. Adopts the remote as upstream if this
    /// repository has none.
    pub fn push_to(
        &self,
        remote: &Repository,
        handler: &str,
        handler_options: &serde_json::Value,
        cancel: Option<&CancelToken>,
    ) -> Result<(), StoreError> {
        sync_repositories(remote, self, false, false, handler, handler_options, cancel)?;
        if self.get_upstream().is_none() {
            info!("Setting upstream for {} to {}.", self, remote);
            self.set_upstream(Upstream {
                remote_name: remote.engine.name().to_string(),
                remote_namespace: remote.namespace.clone(),
                remote_repository: remote.repository.clone(),
            });
        }
        Ok(())
    }

    /// Push to the configured upstream.
    pub fn push(
        &self,
        lookup: &dyn RemoteLookup,
        handler: &str,
        handler_options: &serde_json::Value,
        cancel: Option<&CancelToken>,
    ) -> Result<Repository, StoreError> {
        let remote = self.upstream_repository(lookup)?;
        self.push_to(&remote, handler, handler_options, cancel)?;
        Ok(remote)
    }

    /// Synchronize new changes down from `remote`.
    pub fn pull_from(
        &self,
        remote: &Repository,
        download_all: bool,
        cancel: Option<&CancelToken>,
    ) -> Result<(), StoreError> {
        clone_repository(remote, Some(self.clone()), None, download_all, cancel)?;
        Ok(())
    }

    /// Synchronize new changes down from the configured upstream.
    pub fn pull(
        &self,
        lookup: &dyn RemoteLookup,
        download_all: bool,
        cancel: Option<&CancelToken>,
    ) -> Result<(), StoreError> {
        let remote = self.upstream_repository(lookup)?;
        self.pull_from(&remote, download_all, cancel)
    }
}

/// Shorthand for importing tables from a yet-uncloned remote: clone its
/// metadata into a temporary repository, import from there, drop the
/// temporary clone.
pub fn import_table_from_remote(
    remote: &Repository,
    remote_tables: &[String],
    remote_image_hash: ObjectHash,
    target: &Repository,
    target_tables: &[String],
    target_hash: Option<ObjectHash>,
) -> Result<ObjectHash, StoreError> {
    let staging = Repository::new(
        remote.namespace.clone(),
        format!("{}_clone_tmp", remote.repository),
        target.engine.clone(),
    );
    clone_repository(remote, Some(staging.clone()), None, true, None)?;
    let result = target.import_tables(
        &staging,
        &crate::core::repository::ImportOptions {
            tables: target_tables.to_vec(),
            source_tables: remote_tables.to_vec(),
            image_hash: Some(remote_image_hash),
            target_hash,
            ..Default::default()
        },
    );
    staging.delete(true, false)?;
    result
}
