//! The backing store: one named peer holding metadata relations, object
//! payloads and the mutable working area.
//!
//! The original design kept the current engine as process-global state;
//! here it is an explicit value threaded through every operation. An
//! engine persists itself as a single JSON document, which is what makes
//! the CLI verbs durable between invocations. A *bare* engine (the usual
//! shape of a remote) has no working area and no audit capture; callers
//! that need those either fail with `EngineInit` or degrade to a warning.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::core::audit::{AuditLog, ChangeEntry, ChangeKind};
use crate::core::image::Image;
use crate::core::object::{FragmentPayload, ObjectLocation, ObjectMeta, PatchEntry};
use crate::core::repository::PublishInfo;
use crate::core::schema::{Row, TableSchema};
use crate::core::value::Value;
use crate::errors::StoreError;
use crate::handlers::HandlerRegistry;
use crate::hash::ObjectHash;

/// A table descriptor row: the schema and the ordered object chain whose
/// composition reconstructs the table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableRecord {
    pub table_schema: TableSchema,
    pub object_ids: Vec<ObjectHash>,
}

/// The remote a repository tracks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Upstream {
    pub remote_name: String,
    pub remote_namespace: String,
    pub remote_repository: String,
}

/// Metadata relations scoped to one repository.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepoMeta {
    pub images: BTreeMap<ObjectHash, Image>,
    /// image hash -> table name -> descriptor
    pub tables: BTreeMap<ObjectHash, BTreeMap<String, TableRecord>>,
    pub tags: BTreeMap<String, ObjectHash>,
    pub upstream: Option<Upstream>,
    pub publications: BTreeMap<String, PublishInfo>,
}

/// The full metadata store of an engine: per-repository relations plus the
/// engine-global object catalog.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetaStore {
    pub repositories: BTreeMap<String, RepoMeta>,
    pub objects: BTreeMap<ObjectHash, ObjectMeta>,
    pub object_locations: BTreeMap<ObjectHash, ObjectLocation>,
}

/// A physical table in a working schema: rows keyed and ordered by
/// primary key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "PhysicalTableRepr", into = "PhysicalTableRepr")]
pub struct PhysicalTable {
    pub schema: TableSchema,
    pub rows: BTreeMap<Vec<Value>, Row>,
}

impl PhysicalTable {
    pub fn new(schema: TableSchema) -> PhysicalTable {
        PhysicalTable {
            schema,
            rows: BTreeMap::new(),
        }
    }
}

/// Rows are persisted as a flat list; the PK map is rebuilt on load.
#[derive(Serialize, Deserialize)]
struct PhysicalTableRepr {
    schema: TableSchema,
    rows: Vec<Row>,
}

impl From<PhysicalTableRepr> for PhysicalTable {
    fn from(repr: PhysicalTableRepr) -> PhysicalTable {
        let mut table = PhysicalTable::new(repr.schema);
        for row in repr.rows {
            let pk = table.schema.pk_of(&row);
            table.rows.insert(pk, row);
        }
        table
    }
}

impl From<PhysicalTable> for PhysicalTableRepr {
    fn from(table: PhysicalTable) -> PhysicalTableRepr {
        PhysicalTableRepr {
            schema: table.schema,
            rows: table.rows.into_values().collect(),
        }
    }
}

/// One working schema: the named tables a repository is checked out into.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkingSchema {
    pub tables: BTreeMap<String, PhysicalTable>,
}

/// Serialized form of a whole engine.
#[derive(Serialize, Deserialize)]
struct EngineState {
    name: String,
    bare: bool,
    meta: MetaStore,
    payloads: BTreeMap<ObjectHash, FragmentPayload>,
    working: BTreeMap<String, WorkingSchema>,
    audit: Option<AuditLog>,
}

/// One named peer store.
pub struct Engine {
    name: String,
    bare: bool,
    meta: RwLock<MetaStore>,
    payloads: DashMap<ObjectHash, FragmentPayload>,
    working: RwLock<BTreeMap<String, WorkingSchema>>,
    audit: Option<AuditLog>,
    latches: DashMap<String, Arc<Mutex<()>>>,
    handlers: HandlerRegistry,
    path: RwLock<Option<PathBuf>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("name", &self.name)
            .field("bare", &self.bare)
            .finish()
    }
}

impl Engine {
    /// A fresh engine with a working area and audit capture installed.
    pub fn new(name: impl Into<String>) -> Engine {
        Engine {
            name: name.into(),
            bare: false,
            meta: RwLock::new(MetaStore::default()),
            payloads: DashMap::new(),
            working: RwLock::new(BTreeMap::new()),
            audit: Some(AuditLog::default()),
            latches: DashMap::new(),
            handlers: HandlerRegistry::with_defaults(),
            path: RwLock::new(None),
        }
    }

    /// A bare engine: metadata and payloads only, no working area.
    pub fn new_bare(name: impl Into<String>) -> Engine {
        let mut engine = Engine::new(name);
        engine.bare = true;
        engine.audit = None;
        engine
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_bare(&self) -> bool {
        self.bare
    }

    // --- PERSISTENCE ---

    fn from_state(state: EngineState, path: Option<PathBuf>) -> Engine {
        Engine {
            name: state.name,
            bare: state.bare,
            meta: RwLock::new(state.meta),
            payloads: state.payloads.into_iter().collect(),
            working: RwLock::new(state.working),
            audit: state.audit,
            latches: DashMap::new(),
            handlers: HandlerRegistry::with_defaults(),
            path: RwLock::new(path),
        }
    }

    fn to_state(&self) -> EngineState {
        EngineState {
            name: self.name.clone(),
            bare: self.bare,
            meta: self.read_meta().clone(),
            payloads: self
                .payloads
                .iter()
                .map(|entry| (*entry.key(), entry.value().clone()))
                .collect(),
            working: self.read_working().clone(),
            audit: self.audit.as_ref().map(|audit| audit.snapshot()),
        }
    }

    /// Load an engine from its backing file.
    pub fn load(path: impl AsRef<Path>) -> Result<Engine, StoreError> {
        let path = path.as_ref();
        let file = fs::File::open(path)?;
        let state: EngineState = serde_json::from_reader(BufReader::new(file))?;
        Ok(Engine::from_state(state, Some(path.to_path_buf())))
    }

    /// Load an engine from its backing file, creating a fresh one under
    /// `name` if the file does not exist yet.
    pub fn load_or_create(path: impl AsRef<Path>, name: &str) -> Result<Engine, StoreError> {
        let path = path.as_ref();
        if path.exists() {
            Engine::load(path)
        } else {
            let engine = Engine::new(name);
            *engine.path.write().unwrap_or_else(|e| e.into_inner()) =
                Some(path.to_path_buf());
            Ok(engine)
        }
    }

    /// Like `load_or_create`, but a store created fresh starts bare.
    pub fn load_or_create_bare(
        path: impl AsRef<Path>,
        name: &str,
    ) -> Result<Engine, StoreError> {
        let path = path.as_ref();
        if path.exists() {
            Engine::load(path)
        } else {
            let engine = Engine::new_bare(name);
            *engine.path.write().unwrap_or_else(|e| e.into_inner()) =
                Some(path.to_path_buf());
            Ok(engine)
        }
    }

    /// Persist the engine to its backing file.
    pub fn save(&self) -> Result<(), StoreError> {
        let path = self
            .path
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| {
                StoreError::InvalidArgument(format!(
                    "engine {} has no backing file",
                    self.name
                ))
            })?;
        self.save_to(path)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<(), StoreError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = fs::File::create(path.as_ref())?;
        serde_json::to_writer(BufWriter::new(file), &self.to_state())?;
        Ok(())
    }

    // --- METADATA ACCESS ---

    pub(crate) fn read_meta(&self) -> RwLockReadGuard<'_, MetaStore> {
        self.meta.read().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn write_meta(&self) -> RwLockWriteGuard<'_, MetaStore> {
        self.meta.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Clone the metadata relations; the rollback point of a mutating
    /// operation.
    pub fn meta_snapshot(&self) -> MetaStore {
        self.read_meta().clone()
    }

    pub fn restore_meta(&self, snapshot: MetaStore) {
        *self.write_meta() = snapshot;
    }

    // --- PAYLOADS ---

    pub fn has_payload(&self, object_id: &ObjectHash) -> bool {
        self.payloads.contains_key(object_id)
    }

    pub fn get_payload(&self, object_id: &ObjectHash) -> Option<FragmentPayload> {
        self.payloads.get(object_id).map(|entry| entry.value().clone())
    }

    /// Insert a payload at-most-once. Returns whether the payload was
    /// actually inserted; a second attempt is a no-op.
    pub fn insert_payload(&self, object_id: ObjectHash, payload: FragmentPayload) -> bool {
        if self.payloads.contains_key(&object_id) {
            return false;
        }
        self.payloads.insert(object_id, payload);
        true
    }

    pub fn remove_payloads(&self, object_ids: &[ObjectHash]) {
        for object_id in object_ids {
            self.payloads.remove(object_id);
        }
    }

    pub fn payload_ids(&self) -> Vec<ObjectHash> {
        self.payloads.iter().map(|entry| *entry.key()).collect()
    }

    // --- WORKING AREA ---

    fn read_working(&self) -> RwLockReadGuard<'_, BTreeMap<String, WorkingSchema>> {
        self.working.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_working(&self) -> RwLockWriteGuard<'_, BTreeMap<String, WorkingSchema>> {
        self.working.write().unwrap_or_else(|e| e.into_inner())
    }

    fn no_working_area(&self) -> StoreError {
        StoreError::EngineInit(format!("engine {} has no working area", self.name))
    }

    pub fn create_schema(&self, schema: &str) -> Result<(), StoreError> {
        if self.bare {
            return Err(self.no_working_area());
        }
        self.write_working()
            .entry(schema.to_string())
            .or_default();
        Ok(())
    }

    pub fn schema_exists(&self, schema: &str) -> bool {
        self.read_working().contains_key(schema)
    }

    pub fn delete_schema(&self, schema: &str) -> Result<(), StoreError> {
        if self.bare {
            return Err(self.no_working_area());
        }
        self.write_working().remove(schema);
        Ok(())
    }

    pub fn get_all_tables(&self, schema: &str) -> Vec<String> {
        self.read_working()
            .get(schema)
            .map(|ws| ws.tables.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn table_exists(&self, schema: &str, table: &str) -> bool {
        self.read_working()
            .get(schema)
            .is_some_and(|ws| ws.tables.contains_key(table))
    }

    pub fn get_full_table_schema(
        &self,
        schema: &str,
        table: &str,
    ) -> Result<TableSchema, StoreError> {
        self.read_working()
            .get(schema)
            .and_then(|ws| ws.tables.get(table))
            .map(|t| t.schema.clone())
            .ok_or_else(|| {
                StoreError::TableNotFound(table.to_string(), schema.to_string())
            })
    }

    /// Create an empty table, creating the schema entry if needed.
    pub fn create_table(
        &self,
        schema: &str,
        table: &str,
        table_schema: TableSchema,
    ) -> Result<(), StoreError> {
        if self.bare {
            return Err(self.no_working_area());
        }
        self.write_working()
            .entry(schema.to_string())
            .or_default()
            .tables
            .insert(table.to_string(), PhysicalTable::new(table_schema));
        Ok(())
    }

    pub fn delete_table(&self, schema: &str, table: &str) -> Result<(), StoreError> {
        if self.bare {
            return Err(self.no_working_area());
        }
        self.write_working()
            .get_mut(schema)
            .and_then(|ws| ws.tables.remove(table));
        Ok(())
    }

    /// Read a table's schema and all of its rows in PK order.
    pub fn read_table(
        &self,
        schema: &str,
        table: &str,
    ) -> Result<(TableSchema, Vec<Row>), StoreError> {
        self.read_working()
            .get(schema)
            .and_then(|ws| ws.tables.get(table))
            .map(|t| (t.schema.clone(), t.rows.values().cloned().collect()))
            .ok_or_else(|| {
                StoreError::TableNotFound(table.to_string(), schema.to_string())
            })
    }

    /// Unaudited structural copy of a table, as used by foreign-table
    /// imports. Overwrites the destination.
    pub fn copy_table(
        &self,
        source_schema: &str,
        source_table: &str,
        dest_schema: &str,
        dest_table: &str,
    ) -> Result<(), StoreError> {
        let copied = self
            .read_working()
            .get(source_schema)
            .and_then(|ws| ws.tables.get(source_table))
            .cloned()
            .ok_or_else(|| {
                StoreError::TableNotFound(source_table.to_string(), source_schema.to_string())
            })?;
        self.write_working()
            .entry(dest_schema.to_string())
            .or_default()
            .tables
            .insert(dest_table.to_string(), copied);
        Ok(())
    }

    /// Unaudited bulk load used by the materializer. Rows land keyed by PK;
    /// base segments cover disjoint ranges so collisions cannot occur on a
    /// well-formed chain.
    pub fn bulk_insert(
        &self,
        schema: &str,
        table: &str,
        rows: Vec<Row>,
    ) -> Result<(), StoreError> {
        let mut working = self.write_working();
        let target = working
            .get_mut(schema)
            .and_then(|ws| ws.tables.get_mut(table))
            .ok_or_else(|| {
                StoreError::TableNotFound(table.to_string(), schema.to_string())
            })?;
        for row in rows {
            target.schema.validate_row(&row)?;
            let pk = target.schema.pk_of(&row);
            target.rows.insert(pk, row);
        }
        Ok(())
    }

    /// Unaudited application of patch entries, in order, by primary key.
    pub fn apply_patch(
        &self,
        schema: &str,
        table: &str,
        entries: &[PatchEntry],
    ) -> Result<(), StoreError> {
        let mut working = self.write_working();
        let target = working
            .get_mut(schema)
            .and_then(|ws| ws.tables.get_mut(table))
            .ok_or_else(|| {
                StoreError::TableNotFound(table.to_string(), schema.to_string())
            })?;
        for entry in entries {
            match entry {
                PatchEntry::Upsert(row) => {
                    target.schema.validate_row(row)?;
                    let pk = target.schema.pk_of(row);
                    target.rows.insert(pk, row.clone());
                }
                PatchEntry::Delete(pk) => {
                    target.rows.remove(pk);
                }
            }
        }
        Ok(())
    }

    // --- AUDITED DML ---

    fn mutate_row(
        &self,
        schema: &str,
        table: &str,
        f: impl FnOnce(&mut PhysicalTable) -> Result<ChangeEntry, StoreError>,
    ) -> Result<(), StoreError> {
        let entry = {
            let mut working = self.write_working();
            let target = working
                .get_mut(schema)
                .and_then(|ws| ws.tables.get_mut(table))
                .ok_or_else(|| {
                    StoreError::TableNotFound(table.to_string(), schema.to_string())
                })?;
            f(target)?
        };
        if let Some(audit) = &self.audit {
            audit.record(schema, table, entry);
        }
        Ok(())
    }

    pub fn insert_row(&self, schema: &str, table: &str, row: Row) -> Result<(), StoreError> {
        self.mutate_row(schema, table, |target| {
            target.schema.validate_row(&row)?;
            let pk = target.schema.pk_of(&row);
            if target.rows.contains_key(&pk) {
                return Err(StoreError::InvalidArgument(format!(
                    "duplicate key in {table}"
                )));
            }
            target.rows.insert(pk.clone(), row.clone());
            Ok(ChangeEntry {
                pk,
                kind: ChangeKind::Insert,
                new_row: Some(row),
            })
        })
    }

    pub fn update_row(
        &self,
        schema: &str,
        table: &str,
        pk: &[Value],
        row: Row,
    ) -> Result<(), StoreError> {
        self.mutate_row(schema, table, |target| {
            target.schema.validate_row(&row)?;
            if target.schema.pk_of(&row) != pk {
                return Err(StoreError::InvalidArgument(
                    "update may not move a row to a different key".to_string(),
                ));
            }
            if !target.rows.contains_key(pk) {
                return Err(StoreError::InvalidArgument(format!(
                    "no row with this key in {table}"
                )));
            }
            target.rows.insert(pk.to_vec(), row.clone());
            Ok(ChangeEntry {
                pk: pk.to_vec(),
                kind: ChangeKind::Update,
                new_row: Some(row),
            })
        })
    }

    pub fn delete_row(
        &self,
        schema: &str,
        table: &str,
        pk: &[Value],
    ) -> Result<(), StoreError> {
        self.mutate_row(schema, table, |target| {
            if target.rows.remove(pk).is_none() {
                return Err(StoreError::InvalidArgument(format!(
                    "no row with this key in {table}"
                )));
            }
            Ok(ChangeEntry {
                pk: pk.to_vec(),
                kind: ChangeKind::Delete,
                new_row: None,
            })
        })
    }

    // --- AUDIT CAPABILITY ---

    pub fn audit(&self) -> Option<&AuditLog> {
        self.audit.as_ref()
    }

    fn audit_required(&self) -> Result<&AuditLog, StoreError> {
        self.audit.as_ref().ok_or_else(|| {
            StoreError::EngineInit(format!(
                "audit capture is not installed on engine {}",
                self.name
            ))
        })
    }

    /// Idempotently (re)install change capture on all current tables of a
    /// checked-out schema.
    pub fn manage_audit_triggers(&self, schema: &str) -> Result<(), StoreError> {
        let audit = self.audit_required()?;
        let tables: BTreeSet<String> = self.get_all_tables(schema).into_iter().collect();
        audit.set_tracked(schema, tables);
        Ok(())
    }

    pub fn discard_pending_changes(&self, schema: &str) -> Result<(), StoreError> {
        self.audit_required()?.discard(schema);
        Ok(())
    }

    pub fn get_pending_changes(
        &self,
        schema: &str,
        table: &str,
    ) -> Result<Vec<ChangeEntry>, StoreError> {
        Ok(self.audit_required()?.pending(schema, table))
    }

    pub fn get_changed_tables(&self, schema: &str) -> Result<BTreeSet<String>, StoreError> {
        Ok(self.audit_required()?.changed_tables(schema))
    }

    // --- LOCKING ---

    /// The writer latch for one repository; mutations hold it for their
    /// whole duration.
    pub fn repo_latch(&self, key: &str) -> Arc<Mutex<()>> {
        self.latches
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // --- HANDLERS ---

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }
}

/// Lock a repository latch, recovering from a poisoned mutex.
pub fn lock_latch(latch: &Arc<Mutex<()>>) -> MutexGuard<'_, ()> {
    latch.lock().unwrap_or_else(|e| e.into_inner())
}
