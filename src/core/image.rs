//! Image records and the per-repository image manager.
//!
//! An image is an immutable commit: a hash, an optional parent, a creation
//! timestamp, an optional comment and a provenance record that is carried
//! verbatim so that an image can later be reconstructed by replaying the
//! steps that produced it. The manager enforces that the image graph stays
//! acyclic (a new image may only attach to an already-registered parent)
//! and that tag names are unique per repository.

use std::collections::BTreeMap;
use std::fmt::{self, Display};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::engine::Engine;
use crate::core::repo_key;
use crate::core::table::Table;
use crate::errors::StoreError;
use crate::hash::ObjectHash;

/// How an image came to be; the attached data is opaque at this level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProvenanceType {
    Import,
    Sql,
    Mount,
}

/// An immutable commit in a repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub image_hash: ObjectHash,
    pub parent_id: Option<ObjectHash>,
    pub created: DateTime<Utc>,
    pub comment: Option<String>,
    pub provenance_type: Option<ProvenanceType>,
    pub provenance_data: Option<serde_json::Value>,
}

impl Display for Image {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.image_hash)?;
        if let Some(comment) = &self.comment {
            write!(f, " {comment}")?;
        }
        Ok(())
    }
}

/// Image and tag operations for one repository on one engine.
pub struct ImageManager<'a> {
    engine: &'a Engine,
    namespace: String,
    repository: String,
}

impl<'a> ImageManager<'a> {
    pub fn new(engine: &'a Engine, namespace: &str, repository: &str) -> ImageManager<'a> {
        ImageManager {
            engine,
            namespace: namespace.to_string(),
            repository: repository.to_string(),
        }
    }

    fn key(&self) -> String {
        repo_key(&self.namespace, &self.repository)
    }

    /// Register a new image. The parent, when given, must already exist in
    /// the same repository; since every insertion attaches a fresh hash to
    /// an existing node, the graph stays acyclic by construction.
    #[allow(clippy::too_many_arguments)]
    pub fn add(
        &self,
        parent_id: Option<ObjectHash>,
        image_hash: ObjectHash,
        created: Option<DateTime<Utc>>,
        comment: Option<String>,
        provenance_type: Option<ProvenanceType>,
        provenance_data: Option<serde_json::Value>,
    ) -> Result<Image, StoreError> {
        let key = self.key();
        let mut meta = self.engine.write_meta();
        let repo = meta.repositories.entry(key.clone()).or_default();
        if repo.images.contains_key(&image_hash) {
            return Err(StoreError::Integrity(format!(
                "image {image_hash} already registered in {key}"
            )));
        }
        if let Some(parent) = parent_id {
            if !repo.images.contains_key(&parent) {
                return Err(StoreError::Integrity(format!(
                    "parent image {parent} of {image_hash} not registered in {key}"
                )));
            }
        }
        let image = Image {
            image_hash,
            parent_id,
            created: created.unwrap_or_else(Utc::now),
            comment,
            provenance_type,
            provenance_data,
        };
        repo.images.insert(image_hash, image.clone());
        Ok(image)
    }

    pub fn by_hash(&self, image_hash: &ObjectHash) -> Result<Image, StoreError> {
        self.engine
            .read_meta()
            .repositories
            .get(&self.key())
            .and_then(|repo| repo.images.get(image_hash))
            .cloned()
            .ok_or_else(|| {
                StoreError::ImageNotFound(image_hash.to_string(), self.key())
            })
    }

    pub fn exists(&self, image_hash: &ObjectHash) -> bool {
        self.engine
            .read_meta()
            .repositories
            .get(&self.key())
            .is_some_and(|repo| repo.images.contains_key(image_hash))
    }

    /// Resolve a tag to its image. With `raise_on_none` a missing tag is an
    /// error; otherwise it yields `None` (the usual way of asking whether a
    /// repository is checked out at all).
    pub fn by_tag(&self, tag: &str, raise_on_none: bool) -> Result<Option<Image>, StoreError> {
        let target = self
            .engine
            .read_meta()
            .repositories
            .get(&self.key())
            .and_then(|repo| repo.tags.get(tag).copied());
        match target {
            Some(image_hash) => Ok(Some(self.by_hash(&image_hash)?)),
            None if raise_on_none => {
                Err(StoreError::TagNotFound(tag.to_string(), self.key()))
            }
            None => Ok(None),
        }
    }

    /// Point a tag at an image, moving it if it already exists.
    pub fn tag(&self, image_hash: &ObjectHash, tag: &str) -> Result<(), StoreError> {
        if !self.exists(image_hash) {
            return Err(StoreError::ImageNotFound(
                image_hash.to_string(),
                self.key(),
            ));
        }
        let key = self.key();
        let mut meta = self.engine.write_meta();
        let repo = meta.repositories.entry(key).or_default();
        repo.tags.insert(tag.to_string(), *image_hash);
        Ok(())
    }

    pub fn delete_tag(&self, tag: &str) -> Result<(), StoreError> {
        let key = self.key();
        let mut meta = self.engine.write_meta();
        let removed = meta
            .repositories
            .get_mut(&key)
            .and_then(|repo| repo.tags.remove(tag));
        match removed {
            Some(_) => Ok(()),
            None => Err(StoreError::TagNotFound(tag.to_string(), key)),
        }
    }

    pub fn get_tag(&self, tag: &str) -> Option<ObjectHash> {
        self.engine
            .read_meta()
            .repositories
            .get(&self.key())
            .and_then(|repo| repo.tags.get(tag).copied())
    }

    /// All tags of the repository, including `HEAD` when present.
    pub fn all_tags(&self) -> BTreeMap<String, ObjectHash> {
        self.engine
            .read_meta()
            .repositories
            .get(&self.key())
            .map(|repo| repo.tags.clone())
            .unwrap_or_default()
    }

    /// All images of the repository ordered by creation time.
    pub fn all_images(&self) -> Vec<Image> {
        let mut images: Vec<Image> = self
            .engine
            .read_meta()
            .repositories
            .get(&self.key())
            .map(|repo| repo.images.values().cloned().collect())
            .unwrap_or_default();
        images.sort_by_key(|image| image.created);
        images
    }

    /// Table names recorded under an image.
    pub fn get_tables(&self, image_hash: &ObjectHash) -> Vec<String> {
        self.engine
            .read_meta()
            .repositories
            .get(&self.key())
            .and_then(|repo| repo.tables.get(image_hash))
            .map(|tables| tables.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// The descriptor of one table at one image.
    pub fn get_table(
        &self,
        image_hash: &ObjectHash,
        table_name: &str,
    ) -> Result<Table, StoreError> {
        let record = self
            .engine
            .read_meta()
            .repositories
            .get(&self.key())
            .and_then(|repo| repo.tables.get(image_hash))
            .and_then(|tables| tables.get(table_name))
            .cloned()
            .ok_or_else(|| {
                StoreError::TableNotFound(table_name.to_string(), image_hash.to_string())
            })?;
        Ok(Table {
            namespace: self.namespace.clone(),
            repository: self.repository.clone(),
            image_hash: *image_hash,
            table_name: table_name.to_string(),
            table_schema: record.table_schema,
            objects: record.object_ids,
        })
    }
}
