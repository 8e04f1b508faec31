//! The repository API: init/delete, commit, checkout, table imports,
//! diffing, dumping and publication.
//!
//! A repository is `(namespace, repository)` on one engine. Its working
//! area lives in the schema named `namespace/repository`; the `HEAD` tag
//! exists exactly while that schema does. Mutating operations take the
//! repository's writer latch, snapshot the metadata relations up front and
//! roll back on any error, so a failed commit or import leaves neither a
//! new image nor new objects visible.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Display};
use std::io::Write;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::core::audit::{aggregate_changes, conflate_changes};
use crate::core::diff::{DiffResult, compare_tables};
use crate::core::engine::{Engine, Upstream, lock_latch};
use crate::core::fragments::FragmentManager;
use crate::core::image::{Image, ImageManager, ProvenanceType};
use crate::core::object::FragmentData;
use crate::core::objects::ObjectManager;
use crate::core::query::{run_query, validate_import_sql};
use crate::core::schema::{Row, TableSchema};
use crate::core::table::MaterializedTable;
use crate::core::{CancelToken, DEFAULT_CHUNK_SIZE, HEAD, META_SCHEMA, TxLog, repo_key};
use crate::errors::StoreError;
use crate::hash::ObjectHash;

/// Rows included per table in a published preview.
const PREVIEW_ROWS: usize = 100;

/// Catalog entry written by `publish`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishInfo {
    pub image_hash: ObjectHash,
    pub published: DateTime<Utc>,
    pub provenance: Option<serde_json::Value>,
    pub readme: String,
    pub schemata: BTreeMap<String, TableSchema>,
    pub previews: Option<BTreeMap<String, Vec<Row>>>,
}

/// Options for `Repository::commit`.
#[derive(Debug, Clone)]
pub struct CommitOptions {
    /// Hash of the new image; drawn at random when absent.
    pub image_hash: Option<ObjectHash>,
    pub comment: Option<String>,
    /// Store every table as a full snapshot instead of delta compression.
    pub snap_only: bool,
    /// Rows per base fragment; `None` disables chunking.
    pub chunk_size: Option<usize>,
    /// Split changesets along the PK regions of the existing fragments.
    pub split_changeset: bool,
    /// Extra indexed columns per table.
    pub extra_indexes: BTreeMap<String, Vec<String>>,
    pub cancel: Option<CancelToken>,
}

impl Default for CommitOptions {
    fn default() -> CommitOptions {
        CommitOptions {
            image_hash: None,
            comment: None,
            snap_only: false,
            chunk_size: Some(DEFAULT_CHUNK_SIZE),
            split_changeset: false,
            extra_indexes: BTreeMap::new(),
            cancel: None,
        }
    }
}

/// Options for `Repository::import_tables`.
#[derive(Debug, Clone)]
pub struct ImportOptions {
    /// Names to store the imported tables under; defaults to the source
    /// names.
    pub tables: Vec<String>,
    /// Source table names, or query strings where `table_queries` is set.
    pub source_tables: Vec<String>,
    /// Source image; the source HEAD by default.
    pub image_hash: Option<ObjectHash>,
    /// Copy from the source working schema instead of a source image.
    pub foreign_tables: bool,
    pub do_checkout: bool,
    /// Hash of the new image; drawn at random when absent.
    pub target_hash: Option<ObjectHash>,
    /// Mask marking which `source_tables` entries are queries.
    pub table_queries: Vec<bool>,
    /// Image to base the new image on; the current HEAD by default.
    pub parent_hash: Option<ObjectHash>,
    pub cancel: Option<CancelToken>,
}

impl Default for ImportOptions {
    fn default() -> ImportOptions {
        ImportOptions {
            tables: Vec::new(),
            source_tables: Vec::new(),
            image_hash: None,
            foreign_tables: false,
            do_checkout: true,
            target_hash: None,
            table_queries: Vec::new(),
            parent_hash: None,
            cancel: None,
        }
    }
}

/// A named versioned table collection on one engine.
#[derive(Clone)]
pub struct Repository {
    pub namespace: String,
    pub repository: String,
    pub engine: Arc<Engine>,
}

impl Display for Repository {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_schema())
    }
}

impl PartialEq for Repository {
    fn eq(&self, other: &Self) -> bool {
        self.namespace == other.namespace
            && self.repository == other.repository
            && Arc::ptr_eq(&self.engine, &other.engine)
    }
}

impl Repository {
    pub fn new(
        namespace: impl Into<String>,
        repository: impl Into<String>,
        engine: Arc<Engine>,
    ) -> Repository {
        Repository {
            namespace: namespace.into(),
            repository: repository.into(),
            engine,
        }
    }

    /// Parse a `namespace/repository` schema name into a repository.
    pub fn from_schema(schema: &str, engine: Arc<Engine>) -> Repository {
        match schema.split_once('/') {
            Some((namespace, repository)) => Repository::new(namespace, repository, engine),
            None => Repository::new("", schema, engine),
        }
    }

    /// The working schema this repository is checked out into.
    pub fn to_schema(&self) -> String {
        repo_key(&self.namespace, &self.repository)
    }

    pub fn images(&self) -> ImageManager<'_> {
        ImageManager::new(&self.engine, &self.namespace, &self.repository)
    }

    pub fn objects(&self) -> ObjectManager<'_> {
        ObjectManager::new(&self.engine)
    }

    fn fragments(&self) -> FragmentManager<'_> {
        FragmentManager::new(&self.engine)
    }

    // --- GENERAL REPOSITORY MANAGEMENT ---

    /// Initialize an empty repository: the working schema plus the initial
    /// all-zeros image with `HEAD` pointing at it.
    pub fn init(&self) -> Result<(), StoreError> {
        let schema = self.to_schema();
        let latch = self.engine.repo_latch(&schema);
        let _guard = lock_latch(&latch);
        if !self.images().all_images().is_empty() {
            return Err(StoreError::InvalidArgument(format!(
                "repository {self} already exists"
            )));
        }
        self.engine.create_schema(&schema)?;
        self.images()
            .add(None, ObjectHash::zero(), None, None, None, None)?;
        self.images().tag(&ObjectHash::zero(), HEAD)?;
        self.engine.manage_audit_triggers(&schema)
    }

    /// Discard the repository: optionally its checked-out schema and
    /// optionally all of its metadata. Cached object payloads survive.
    pub fn delete(&self, unregister: bool, uncheckout: bool) -> Result<(), StoreError> {
        let schema = self.to_schema();
        let latch = self.engine.repo_latch(&schema);
        let _guard = lock_latch(&latch);
        if uncheckout {
            match self.engine.discard_pending_changes(&schema) {
                Ok(()) => {
                    if let Some(audit) = self.engine.audit() {
                        audit.uninstall(&schema);
                    }
                    self.engine.delete_schema(&schema)?;
                }
                Err(StoreError::EngineInit(_)) => {
                    // A bare remote has nothing checked out to begin with.
                    warn!(
                        "Audit capture missing on engine {}, not running uncheckout",
                        self.engine.name()
                    );
                }
                Err(err) => return Err(err),
            }
        }
        if unregister {
            self.engine.write_meta().repositories.remove(&schema);
        }
        Ok(())
    }

    pub fn get_upstream(&self) -> Option<Upstream> {
        self.engine
            .read_meta()
            .repositories
            .get(&self.to_schema())
            .and_then(|repo| repo.upstream.clone())
    }

    pub fn set_upstream(&self, upstream: Upstream) {
        self.engine
            .write_meta()
            .repositories
            .entry(self.to_schema())
            .or_default()
            .upstream = Some(upstream);
    }

    pub fn delete_upstream(&self) {
        if let Some(repo) = self
            .engine
            .write_meta()
            .repositories
            .get_mut(&self.to_schema())
        {
            repo.upstream = None;
        }
    }

    // --- COMMITS / CHECKOUTS ---

    /// The HEAD image, or `None` when the repository is not checked out.
    pub fn head(&self) -> Result<Option<Image>, StoreError> {
        self.images().by_tag(HEAD, false)
    }

    /// The HEAD image; errors when the repository is not checked out.
    pub fn head_strict(&self) -> Result<Image, StoreError> {
        match self.images().by_tag(HEAD, true)? {
            Some(image) => Ok(image),
            None => Err(StoreError::TagNotFound(HEAD.to_string(), self.to_schema())),
        }
    }

    /// Move (or remove) the `HEAD` pointer. The move is the linearization
    /// point of a commit.
    pub fn set_head(&self, image_hash: Option<ObjectHash>) -> Result<(), StoreError> {
        match image_hash {
            Some(image_hash) => self.images().tag(&image_hash, HEAD),
            None => match self.images().delete_tag(HEAD) {
                Ok(()) | Err(StoreError::TagNotFound(..)) => Ok(()),
                Err(err) => Err(err),
            },
        }
    }

    /// A read-only handle to a table at an image, materialized into a
    /// transient table that is dropped when the handle goes out of scope.
    /// With no image, the current working table is returned as-is.
    pub fn materialized_table(
        &self,
        table_name: &str,
        image_hash: Option<&ObjectHash>,
        source: Option<&Engine>,
    ) -> Result<MaterializedTable<'_>, StoreError> {
        match image_hash {
            None => Ok(MaterializedTable::working(
                &self.engine,
                self.to_schema(),
                table_name.to_string(),
            )),
            Some(image_hash) => {
                let table = self.images().get_table(image_hash, table_name)?;
                let transient_name = ObjectHash::random().to_string();
                table.materialize(&self.engine, source, META_SCHEMA, &transient_name)?;
                Ok(MaterializedTable::transient(
                    &self.engine,
                    META_SCHEMA.to_string(),
                    transient_name,
                ))
            }
        }
    }

    /// Materialize an image into the working schema and move `HEAD` to it.
    /// Payloads missing locally are fetched through their locations or
    /// from `source`.
    pub fn checkout(
        &self,
        image_hash: &ObjectHash,
        force: bool,
        source: Option<&Engine>,
    ) -> Result<(), StoreError> {
        let schema = self.to_schema();
        let latch = self.engine.repo_latch(&schema);
        let _guard = lock_latch(&latch);
        let image = self.images().by_hash(image_hash)?;

        if self.has_pending_changes()? {
            if !force {
                return Err(StoreError::CheckoutConflict(format!(
                    "{schema} has pending changes! Pass force or commit them first"
                )));
            }
            warn!("{} has pending changes, discarding...", schema);
        }
        self.engine.discard_pending_changes(&schema)?;
        self.engine.delete_schema(&schema)?;
        self.engine.create_schema(&schema)?;
        for table_name in self.images().get_tables(image_hash) {
            self.images()
                .get_table(image_hash, &table_name)?
                .materialize(&self.engine, source, &schema, &table_name)?;
        }
        self.set_head(Some(image.image_hash))?;
        self.engine.manage_audit_triggers(&schema)?;
        self.engine.discard_pending_changes(&schema)
    }

    /// Delete the working schema and drop `HEAD`, refusing on pending
    /// changes unless forced.
    pub fn uncheckout(&self, force: bool) -> Result<(), StoreError> {
        if self.head()?.is_none() {
            return Ok(());
        }
        if self.has_pending_changes()? {
            if !force {
                return Err(StoreError::CheckoutConflict(format!(
                    "{} has pending changes! Pass force to discard them",
                    self.to_schema()
                )));
            }
            warn!("{} has pending changes, discarding...", self.to_schema());
        }
        self.delete(false, true)?;
        self.set_head(None)
    }

    /// Whether the working area differs from HEAD: content changes, schema
    /// drift, or table additions and removals.
    pub fn has_pending_changes(&self) -> Result<bool, StoreError> {
        let Some(head) = self.head()? else {
            return Ok(false);
        };
        let schema = self.to_schema();
        let head_tables: BTreeSet<String> =
            self.images().get_tables(&head.image_hash).into_iter().collect();
        let working_tables: BTreeSet<String> =
            self.engine.get_all_tables(&schema).into_iter().collect();
        if head_tables != working_tables {
            return Ok(true);
        }
        for table_name in &working_tables {
            let descriptor = self.images().get_table(&head.image_hash, table_name)?;
            if descriptor.table_schema != self.engine.get_full_table_schema(&schema, table_name)?
            {
                return Ok(true);
            }
            let pending = self.engine.get_pending_changes(&schema, table_name)?;
            if !conflate_changes(&pending).is_empty() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Commit all pending changes, creating a new image.
    pub fn commit(&self, opts: &CommitOptions) -> Result<Image, StoreError> {
        let schema = self.to_schema();
        let latch = self.engine.repo_latch(&schema);
        let _guard = lock_latch(&latch);
        if !self.engine.schema_exists(&schema) {
            return Err(StoreError::EngineInit(format!(
                "{schema} is not checked out"
            )));
        }
        info!("Committing {}...", schema);
        self.engine.manage_audit_triggers(&schema)?;

        let head = self.head()?;
        let image_hash = opts.image_hash.unwrap_or_else(ObjectHash::random);

        let snapshot = self.engine.meta_snapshot();
        let mut tx = TxLog::default();
        if let Err(err) =
            self.commit_inner(&schema, head.as_ref(), image_hash, opts, &mut tx)
        {
            self.engine.restore_meta(snapshot);
            self.engine.remove_payloads(&tx.new_payloads);
            return Err(err);
        }
        self.engine.manage_audit_triggers(&schema)?;
        self.images().by_hash(&image_hash)
    }

    /// Conflate and store the pending changes of every working table:
    /// new tables and schema changes as full snapshots, changed tables as
    /// patches, unchanged tables linked to the previous chain.
    fn commit_inner(
        &self,
        schema: &str,
        head: Option<&Image>,
        image_hash: ObjectHash,
        opts: &CommitOptions,
        tx: &mut TxLog,
    ) -> Result<(), StoreError> {
        let cancel = opts.cancel.as_ref();
        if let Some(cancel) = cancel {
            cancel.check()?;
        }
        self.images().add(
            head.map(|image| image.image_hash),
            image_hash,
            None,
            opts.comment.clone(),
            None,
            None,
        )?;

        let changed = self.engine.get_changed_tables(schema)?;
        for table_name in self.engine.get_all_tables(schema) {
            if let Some(cancel) = cancel {
                cancel.check()?;
            }
            let prior = match head {
                Some(head) => match self.images().get_table(&head.image_hash, &table_name) {
                    Ok(table) => Some(table),
                    Err(StoreError::TableNotFound(..)) => None,
                    Err(err) => return Err(err),
                },
                None => None,
            };
            let extra = opts
                .extra_indexes
                .get(&table_name)
                .map(|columns| columns.as_slice());
            let schema_changed = match &prior {
                Some(prior) => {
                    prior.table_schema
                        != self.engine.get_full_table_schema(schema, &table_name)?
                }
                None => false,
            };

            // New table, schema change or an explicit snapshot request:
            // store a full copy.
            if prior.is_none() || opts.snap_only || schema_changed {
                self.fragments().record_table_as_base(
                    &self.namespace,
                    &self.repository,
                    &table_name,
                    image_hash,
                    opts.chunk_size,
                    schema,
                    None,
                    extra,
                    cancel,
                    tx,
                )?;
            } else if let Some(prior) = prior {
                if changed.contains(&table_name) {
                    // Changed since the last revision: store a conflated
                    // patch.
                    self.fragments().record_table_as_patch(
                        &prior,
                        schema,
                        image_hash,
                        opts.split_changeset,
                        extra,
                        cancel,
                        tx,
                    )?;
                } else {
                    // Unchanged: point the image at the previous objects.
                    self.objects().register_tables(
                        &self.namespace,
                        &self.repository,
                        &[(
                            image_hash,
                            table_name.clone(),
                            prior.table_schema,
                            prior.objects,
                        )],
                    )?;
                }
            }
        }

        self.engine.discard_pending_changes(schema)?;
        self.set_head(Some(image_hash))
    }

    // --- TAG MANAGEMENT ---

    /// All tagged images of the repository, as `(image_hash, tag)`.
    pub fn get_all_hashes_tags(&self) -> Vec<(ObjectHash, String)> {
        self.images()
            .all_tags()
            .into_iter()
            .map(|(tag, image_hash)| (image_hash, tag))
            .collect()
    }

    /// Set several tags at once; `HEAD` is never set this way.
    pub fn set_tags(&self, tags: &BTreeMap<String, ObjectHash>) -> Result<(), StoreError> {
        for (tag, image_hash) in tags {
            if tag != HEAD {
                self.images().tag(image_hash, tag)?;
            }
        }
        Ok(())
    }

    // --- IMPORTING TABLES ---

    /// Create a new image with tables imported from another repository on
    /// the same engine: linked descriptors for versioned tables, fresh
    /// snapshots for foreign tables and query results. Tables carried by
    /// the parent image are preserved.
    pub fn import_tables(
        &self,
        source: &Repository,
        opts: &ImportOptions,
    ) -> Result<ObjectHash, StoreError> {
        if !Arc::ptr_eq(&self.engine, &source.engine) {
            return Err(StoreError::InvalidArgument(
                "imports are only supported between repositories on the same engine"
                    .to_string(),
            ));
        }
        let schema = self.to_schema();
        let latch = self.engine.repo_latch(&schema);
        let _guard = lock_latch(&latch);

        let target_hash = opts.target_hash.unwrap_or_else(ObjectHash::random);
        let image = if opts.foreign_tables {
            None
        } else {
            Some(match opts.image_hash {
                Some(image_hash) => source.images().by_hash(&image_hash)?,
                None => source.head_strict()?,
            })
        };

        let source_tables = if opts.source_tables.is_empty() {
            match &image {
                Some(image) => source.images().get_tables(&image.image_hash),
                None => source.engine.get_all_tables(&source.to_schema()),
            }
        } else {
            opts.source_tables.clone()
        };
        let tables = if opts.tables.is_empty() {
            if !opts.table_queries.is_empty() {
                return Err(StoreError::InvalidArgument(
                    "tables have to be defined when importing queries".to_string(),
                ));
            }
            source_tables.clone()
        } else {
            opts.tables.clone()
        };
        let table_queries = if opts.table_queries.is_empty() {
            vec![false; tables.len()]
        } else {
            opts.table_queries.clone()
        };
        if tables.len() != source_tables.len() || source_tables.len() != table_queries.len() {
            return Err(StoreError::InvalidArgument(
                "tables, source_tables and table_queries have mismatching lengths".to_string(),
            ));
        }

        let (parent_hash, existing_tables) = match opts.parent_hash {
            Some(parent_hash) => {
                // Validate the parent exists.
                self.images().by_hash(&parent_hash)?;
                (Some(parent_hash), self.images().get_tables(&parent_hash))
            }
            None => (
                self.head()?.map(|image| image.image_hash),
                self.engine.get_all_tables(&schema),
            ),
        };
        let clashing: Vec<&String> = tables
            .iter()
            .filter(|t| existing_tables.contains(*t))
            .collect();
        if !clashing.is_empty() {
            return Err(StoreError::TableClash(
                format!("{clashing:?}"),
                self.to_schema(),
            ));
        }

        let snapshot = self.engine.meta_snapshot();
        let mut tx = TxLog::default();
        if let Err(err) = self.import_tables_inner(
            source,
            image.as_ref(),
            &tables,
            &source_tables,
            &table_queries,
            parent_hash,
            target_hash,
            opts,
            &mut tx,
        ) {
            self.engine.restore_meta(snapshot);
            self.engine.remove_payloads(&tx.new_payloads);
            return Err(err);
        }
        Ok(target_hash)
    }

    #[allow(clippy::too_many_arguments)]
    fn import_tables_inner(
        &self,
        source: &Repository,
        image: Option<&Image>,
        tables: &[String],
        source_tables: &[String],
        table_queries: &[bool],
        parent_hash: Option<ObjectHash>,
        target_hash: ObjectHash,
        opts: &ImportOptions,
        tx: &mut TxLog,
    ) -> Result<(), StoreError> {
        let schema = self.to_schema();
        let cancel = opts.cancel.as_ref();
        if opts.do_checkout {
            self.engine.create_schema(&schema)?;
        }

        self.images().add(
            parent_hash,
            target_hash,
            None,
            Some(format!("Importing {tables:?} from {source}")),
            Some(ProvenanceType::Import),
            Some(serde_json::json!({
                "source": source.to_schema(),
                "source_tables": source_tables,
            })),
        )?;

        for ((source_table, target_table), is_query) in
            source_tables.iter().zip(tables).zip(table_queries)
        {
            if let Some(cancel) = cancel {
                cancel.check()?;
            }
            if *is_query && !opts.foreign_tables {
                let image = image.ok_or_else(|| {
                    StoreError::InvalidArgument(
                        "query imports need a source image".to_string(),
                    )
                })?;
                self.import_query(source, image, source_table, target_table, target_hash, tx)?;
            } else if opts.foreign_tables {
                let transient = ObjectHash::random().to_string();
                self.engine.copy_table(
                    &source.to_schema(),
                    source_table,
                    META_SCHEMA,
                    &transient,
                )?;
                let result = self.fragments().record_table_as_base(
                    &self.namespace,
                    &self.repository,
                    target_table,
                    target_hash,
                    Some(DEFAULT_CHUNK_SIZE),
                    META_SCHEMA,
                    Some(transient.as_str()),
                    None,
                    cancel,
                    tx,
                );
                self.engine.delete_table(META_SCHEMA, &transient)?;
                result?;
            } else {
                let image = image.ok_or_else(|| {
                    StoreError::InvalidArgument(
                        "versioned imports need a source image".to_string(),
                    )
                })?;
                let table = source.images().get_table(&image.image_hash, source_table)?;
                self.objects().register_tables(
                    &self.namespace,
                    &self.repository,
                    &[(
                        target_hash,
                        target_table.clone(),
                        table.table_schema.clone(),
                        table.objects.clone(),
                    )],
                )?;
            }
            if opts.do_checkout {
                self.images()
                    .get_table(&target_hash, target_table)?
                    .materialize(&self.engine, None, &schema, target_table)?;
            }
        }

        // Carry the parent image's remaining tables into the new image.
        if let Some(parent_hash) = parent_hash {
            for table_name in self.images().get_tables(&parent_hash) {
                if tables.contains(&table_name) {
                    continue;
                }
                let table = self.images().get_table(&parent_hash, &table_name)?;
                self.objects().register_tables(
                    &self.namespace,
                    &self.repository,
                    &[(
                        target_hash,
                        table_name,
                        table.table_schema,
                        table.objects,
                    )],
                )?;
            }
        }

        if opts.do_checkout {
            self.set_head(Some(target_hash))?;
            self.engine.manage_audit_triggers(&schema)?;
            self.engine.discard_pending_changes(&schema)?;
        }
        Ok(())
    }

    /// Run a validated query over a transient materialization of the
    /// source image and snapshot the result as a new BASE.
    fn import_query(
        &self,
        source: &Repository,
        image: &Image,
        query_text: &str,
        target_table: &str,
        target_hash: ObjectHash,
        tx: &mut TxLog,
    ) -> Result<(), StoreError> {
        let query = validate_import_sql(query_text)?;
        let query_schema = format!("query_{}", ObjectHash::random());

        let table = source.images().get_table(&image.image_hash, &query.table)?;
        table.materialize(&self.engine, None, &query_schema, &query.table)?;
        let result = run_query(&self.engine, &query_schema, &query);
        self.engine.delete_schema(&query_schema)?;
        let (result_schema, rows) = result?;

        let transient = ObjectHash::random().to_string();
        self.engine
            .create_table(META_SCHEMA, &transient, result_schema)?;
        self.engine.bulk_insert(META_SCHEMA, &transient, rows)?;
        let result = self.fragments().record_table_as_base(
            &self.namespace,
            &self.repository,
            target_table,
            target_hash,
            Some(DEFAULT_CHUNK_SIZE),
            META_SCHEMA,
            Some(transient.as_str()),
            None,
            None,
            tx,
        );
        self.engine.delete_table(META_SCHEMA, &transient)?;
        result?;
        Ok(())
    }

    // --- DIFFS ---

    fn table_exists_at(
        &self,
        table_name: &str,
        image_hash: Option<&ObjectHash>,
    ) -> Result<bool, StoreError> {
        match image_hash {
            None => Ok(self.engine.table_exists(&self.to_schema(), table_name)),
            Some(image_hash) => match self.images().get_table(image_hash, table_name) {
                Ok(_) => Ok(true),
                Err(StoreError::TableNotFound(..)) => Ok(false),
                Err(err) => Err(err),
            },
        }
    }

    /// Compare the state of a table between two images, or between an
    /// image and the staging area (`None`).
    pub fn diff(
        &self,
        table_name: &str,
        image_a: Option<&ObjectHash>,
        image_b: Option<&ObjectHash>,
        aggregate: bool,
    ) -> Result<DiffResult, StoreError> {
        if !self.table_exists_at(table_name, image_a)? {
            return Ok(DiffResult::Added);
        }
        if !self.table_exists_at(table_name, image_b)? {
            return Ok(DiffResult::Removed);
        }

        // Diffing HEAD against staging with aggregation comes straight out
        // of the audit log.
        if let (Some(image_a), None) = (image_a, image_b) {
            if aggregate
                && self.head()?.map(|head| head.image_hash) == Some(*image_a)
            {
                let pending = self
                    .engine
                    .get_pending_changes(&self.to_schema(), table_name)?;
                return Ok(DiffResult::Aggregate(aggregate_changes(&conflate_changes(
                    &pending,
                ))));
            }
        }

        // Same object set on both sides: no diff without materializing.
        if let (Some(image_a), Some(image_b)) = (image_a, image_b) {
            let objects_a: BTreeSet<ObjectHash> = self
                .images()
                .get_table(image_a, table_name)?
                .objects
                .into_iter()
                .collect();
            let objects_b: BTreeSet<ObjectHash> = self
                .images()
                .get_table(image_b, table_name)?
                .objects
                .into_iter()
                .collect();
            if objects_a == objects_b {
                return Ok(DiffResult::empty(aggregate));
            }
        }

        let left = self.materialized_table(table_name, image_a, None)?;
        let right = self.materialized_table(table_name, image_b, None)?;
        let (schema, rows_a) = self.engine.read_table(left.schema(), left.table())?;
        let (_, rows_b) = self.engine.read_table(right.schema(), right.table())?;
        Ok(compare_tables(&schema, rows_a, rows_b, aggregate))
    }

    // --- DUMPING ---

    /// Write an SQL dump of the repository's metadata and (optionally) the
    /// contents of every object it references.
    pub fn dump(
        &self,
        stream: &mut dyn Write,
        exclude_object_contents: bool,
    ) -> Result<(), StoreError> {
        let images = self.images();

        write!(stream, "--\n-- Images --\n--\n")?;
        for image in images.all_images() {
            writeln!(
                stream,
                "INSERT INTO \"{META_SCHEMA}\".\"images\" VALUES ({});",
                [
                    sql_str(&self.namespace),
                    sql_str(&self.repository),
                    sql_str(&image.image_hash.to_string()),
                    image
                        .parent_id
                        .map(|parent| sql_str(&parent.to_string()))
                        .unwrap_or_else(|| "NULL".to_string()),
                    sql_str(&image.created.to_rfc3339()),
                    image
                        .comment
                        .as_deref()
                        .map(sql_str)
                        .unwrap_or_else(|| "NULL".to_string()),
                    image
                        .provenance_type
                        .map(|p| sql_str(&serde_json::json!(p).to_string()))
                        .unwrap_or_else(|| "NULL".to_string()),
                    image
                        .provenance_data
                        .as_ref()
                        .map(|p| sql_str(&p.to_string()))
                        .unwrap_or_else(|| "NULL".to_string()),
                ]
                .join(", ")
            )?;
        }

        // Objects come before tables: descriptor registration checks that
        // its objects exist.
        let mut required: BTreeSet<ObjectHash> = BTreeSet::new();
        for image in images.all_images() {
            for table_name in images.get_tables(&image.image_hash) {
                required.extend(images.get_table(&image.image_hash, &table_name)?.objects);
            }
        }
        let object_list = required
            .iter()
            .map(|id| sql_str(&id.to_string()))
            .collect::<Vec<_>>()
            .join(", ");

        write!(stream, "\n--\n-- Objects --\n--\n")?;
        for table in ["objects", "object_locations"] {
            writeln!(
                stream,
                "DELETE FROM \"{META_SCHEMA}\".\"{table}\" WHERE object_id IN ({object_list});\n"
            )?;
        }
        let metas = self.objects().get_object_metas(&required.iter().copied().collect::<Vec<_>>())?;
        for meta in &metas {
            writeln!(
                stream,
                "INSERT INTO \"{META_SCHEMA}\".\"objects\" VALUES ({}, {}, {}, {}, {});",
                sql_str(&meta.object_id.to_string()),
                sql_str(&meta.format.to_string()),
                sql_str(&serde_json::to_string(&meta.parent_object_ids)?),
                sql_str(&meta.namespace),
                sql_str(&serde_json::to_string(&meta.index)?),
            )?;
        }
        for location in self
            .objects()
            .get_object_locations(&required.iter().copied().collect::<Vec<_>>())
        {
            writeln!(
                stream,
                "INSERT INTO \"{META_SCHEMA}\".\"object_locations\" VALUES ({}, {}, {});",
                sql_str(&location.object_id.to_string()),
                sql_str(&location.protocol),
                sql_str(&location.location),
            )?;
        }

        write!(stream, "\n--\n-- Tables --\n--\n")?;
        for image in images.all_images() {
            for table_name in images.get_tables(&image.image_hash) {
                let table = images.get_table(&image.image_hash, &table_name)?;
                writeln!(
                    stream,
                    "INSERT INTO \"{META_SCHEMA}\".\"tables\" VALUES ({}, {}, {}, {}, {}, {});",
                    sql_str(&self.namespace),
                    sql_str(&self.repository),
                    sql_str(&image.image_hash.to_string()),
                    sql_str(&table_name),
                    sql_str(&serde_json::to_string(&table.table_schema)?),
                    sql_str(&serde_json::to_string(&table.objects)?),
                )?;
            }
        }

        write!(stream, "\n--\n-- Tags --\n--\n")?;
        for (tag, image_hash) in images.all_tags() {
            if tag == HEAD {
                continue;
            }
            writeln!(
                stream,
                "INSERT INTO \"{META_SCHEMA}\".\"tags\" VALUES ({}, {}, {}, {});",
                sql_str(&self.namespace),
                sql_str(&self.repository),
                sql_str(&image_hash.to_string()),
                sql_str(&tag),
            )?;
        }

        if !exclude_object_contents {
            write!(stream, "\n--\n-- Object contents --\n--\n")?;
            for object_id in &required {
                writeln!(
                    stream,
                    "DROP FOREIGN TABLE IF EXISTS \"{META_SCHEMA}\".\"{object_id}\";"
                )?;
                let payload = self
                    .engine
                    .get_payload(object_id)
                    .ok_or_else(|| StoreError::ObjectNotFound(object_id.to_string()))?;
                dump_object(stream, object_id, &payload)?;
                writeln!(stream)?;
            }
        }
        Ok(())
    }

    // --- PUBLISHING ---

    /// Summarize a previously-pushed, tagged image into the remote's
    /// catalog: schemas, optional previews and optional provenance.
    pub fn publish(
        &self,
        tag: &str,
        remote: &Repository,
        readme: &str,
        include_provenance: bool,
        include_table_previews: bool,
    ) -> Result<(), StoreError> {
        let Some(image) = self.images().by_tag(tag, true)? else {
            return Err(StoreError::TagNotFound(tag.to_string(), self.to_schema()));
        };
        info!("Publishing {}:{} ({})", self, image.image_hash, tag);
        // Only pushed images can be published.
        remote.images().by_hash(&image.image_hash)?;

        let mut schemata = BTreeMap::new();
        let mut previews = BTreeMap::new();
        for table_name in self.images().get_tables(&image.image_hash) {
            let table = self.images().get_table(&image.image_hash, &table_name)?;
            schemata.insert(table_name.clone(), table.table_schema.clone());
            if include_table_previews {
                let handle =
                    self.materialized_table(&table_name, Some(&image.image_hash), None)?;
                let (_, rows) = self.engine.read_table(handle.schema(), handle.table())?;
                previews.insert(table_name, rows.into_iter().take(PREVIEW_ROWS).collect());
            }
        }

        let info = PublishInfo {
            image_hash: image.image_hash,
            published: Utc::now(),
            provenance: if include_provenance {
                image.provenance_data.clone()
            } else {
                None
            },
            readme: readme.to_string(),
            schemata,
            previews: include_table_previews.then_some(previews),
        };
        remote
            .engine
            .write_meta()
            .repositories
            .entry(remote.to_schema())
            .or_default()
            .publications
            .insert(tag.to_string(), info);
        Ok(())
    }

    /// The published catalog entry for a tag, if any.
    pub fn get_publication(&self, tag: &str) -> Option<PublishInfo> {
        self.engine
            .read_meta()
            .repositories
            .get(&self.to_schema())
            .and_then(|repo| repo.publications.get(tag).cloned())
    }
}

fn sql_str(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Dump one object as a CREATE TABLE plus INSERTs. Patch fragments carry a
/// leading action column (`U` for upserts, `D` for deletes).
fn dump_object(
    stream: &mut dyn Write,
    object_id: &ObjectHash,
    payload: &crate::core::object::FragmentPayload,
) -> Result<(), StoreError> {
    let columns: Vec<String> = payload
        .schema
        .columns
        .iter()
        .map(|column| format!("\"{}\" {}", column.name, column.col_type))
        .collect();
    match &payload.data {
        FragmentData::Base(rows) => {
            writeln!(
                stream,
                "CREATE TABLE \"{META_SCHEMA}\".\"{object_id}\" ({});",
                columns.join(", ")
            )?;
            for row in rows {
                writeln!(
                    stream,
                    "INSERT INTO \"{META_SCHEMA}\".\"{object_id}\" VALUES ({});",
                    row.iter()
                        .map(|value| value.sql_literal())
                        .collect::<Vec<_>>()
                        .join(", ")
                )?;
            }
        }
        FragmentData::Patch(entries) => {
            writeln!(
                stream,
                "CREATE TABLE \"{META_SCHEMA}\".\"{object_id}\" (\"action\" text, {});",
                columns.join(", ")
            )?;
            let width = payload.schema.columns.len();
            let pk_indices = payload.schema.pk_indices();
            for entry in entries {
                let (action, row) = match entry {
                    crate::core::object::PatchEntry::Upsert(row) => ("U", row.clone()),
                    crate::core::object::PatchEntry::Delete(pk) => {
                        let mut row = vec![crate::core::value::Value::Null; width];
                        for (i, idx) in pk_indices.iter().enumerate() {
                            if let Some(value) = pk.get(i) {
                                row[*idx] = value.clone();
                            }
                        }
                        ("D", row)
                    }
                };
                writeln!(
                    stream,
                    "INSERT INTO \"{META_SCHEMA}\".\"{object_id}\" VALUES ('{action}', {});",
                    row.iter()
                        .map(|value| value.sql_literal())
                        .collect::<Vec<_>>()
                        .join(", ")
                )?;
            }
        }
    }
    Ok(())
}
