//! Table descriptors and their materialization into physical tables.

use tracing::warn;

use crate::core::engine::Engine;
use crate::core::object::FragmentData;
use crate::core::objects::ObjectManager;
use crate::core::schema::TableSchema;
use crate::errors::StoreError;
use crate::hash::ObjectHash;

/// A table at one image: its schema and the ordered object chain whose
/// composition reconstructs it.
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    pub namespace: String,
    pub repository: String,
    pub image_hash: ObjectHash,
    pub table_name: String,
    pub table_schema: TableSchema,
    pub objects: Vec<ObjectHash>,
}

impl Table {
    /// Rebuild the table under `destination_schema.destination_table`:
    /// create it with the descriptor schema, bulk-copy every BASE segment
    /// and apply the PATCHes in chain order. Payloads missing locally are
    /// acquired through their external locations or from `source`.
    pub fn materialize(
        &self,
        engine: &Engine,
        source: Option<&Engine>,
        destination_schema: &str,
        destination_table: &str,
    ) -> Result<(), StoreError> {
        let objects = ObjectManager::new(engine);
        objects.resolve_segments(&self.objects)?;

        let missing: Vec<ObjectHash> = self
            .objects
            .iter()
            .filter(|id| !engine.has_payload(id))
            .copied()
            .collect();
        if !missing.is_empty() {
            let locations = objects.get_object_locations(&missing);
            objects.download_objects(source, &missing, &locations, None)?;
        }

        engine.create_table(
            destination_schema,
            destination_table,
            self.table_schema.clone(),
        )?;
        for object_id in &self.objects {
            let payload = engine
                .get_payload(object_id)
                .ok_or_else(|| StoreError::ObjectNotFound(object_id.to_string()))?;
            match payload.data {
                FragmentData::Base(rows) => {
                    engine.bulk_insert(destination_schema, destination_table, rows)?
                }
                FragmentData::Patch(entries) => {
                    engine.apply_patch(destination_schema, destination_table, &entries)?
                }
            }
        }
        Ok(())
    }
}

/// A handle to a read-only materialized table. Transient materializations
/// are dropped when the handle goes out of scope, on every exit path; a
/// failed drop is logged and never masks the caller's own error.
pub struct MaterializedTable<'a> {
    engine: &'a Engine,
    schema: String,
    table: String,
    transient: bool,
}

impl<'a> MaterializedTable<'a> {
    /// A handle onto the current working table; nothing to clean up.
    pub fn working(engine: &'a Engine, schema: String, table: String) -> MaterializedTable<'a> {
        MaterializedTable {
            engine,
            schema,
            table,
            transient: false,
        }
    }

    /// A handle onto a freshly materialized transient table.
    pub fn transient(
        engine: &'a Engine,
        schema: String,
        table: String,
    ) -> MaterializedTable<'a> {
        MaterializedTable {
            engine,
            schema,
            table,
            transient: true,
        }
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn table(&self) -> &str {
        &self.table
    }
}

impl Drop for MaterializedTable<'_> {
    fn drop(&mut self) {
        if !self.transient {
            return;
        }
        if let Err(err) = self.engine.delete_table(&self.schema, &self.table) {
            warn!(
                "Failed to drop transient table {}.{}: {}",
                self.schema, self.table, err
            );
        }
    }
}
