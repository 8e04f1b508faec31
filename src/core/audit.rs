//! Row-level change capture for checked-out working schemas.
//!
//! Every insert, update and delete against a tracked table is recorded as a
//! change entry. At commit time the stream is conflated down to one net
//! change per primary key: the last writer wins, a delete followed by an
//! insert collapses to an upsert, and an insert followed by a delete
//! cancels out entirely.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::core::schema::Row;
use crate::core::value::Value;

/// Kind of a captured row change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// One captured change: the primary key it touches, what happened, and the
/// new row image for inserts and updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEntry {
    pub pk: Vec<Value>,
    pub kind: ChangeKind,
    pub new_row: Option<Row>,
}

/// The net effect on one primary key after conflation.
#[derive(Debug, Clone, PartialEq)]
pub enum NetChange {
    Upsert(Row),
    Delete,
}

/// A conflated change: whether the key was first seen as an insert in this
/// changeset, and its net effect.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflatedChange {
    pub newly_added: bool,
    pub net: NetChange,
}

/// Counts of net added, removed and updated rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeAggregate {
    pub added: usize,
    pub removed: usize,
    pub updated: usize,
}

impl ChangeAggregate {
    pub fn as_tuple(&self) -> (usize, usize, usize) {
        (self.added, self.removed, self.updated)
    }

    pub fn is_empty(&self) -> bool {
        self.added == 0 && self.removed == 0 && self.updated == 0
    }
}

/// Conflate a change stream to one net change per primary key, in PK order.
pub fn conflate_changes(entries: &[ChangeEntry]) -> BTreeMap<Vec<Value>, ConflatedChange> {
    let mut conflated: BTreeMap<Vec<Value>, ConflatedChange> = BTreeMap::new();
    for entry in entries {
        let net = match entry.kind {
            ChangeKind::Delete => NetChange::Delete,
            _ => NetChange::Upsert(entry.new_row.clone().unwrap_or_default()),
        };
        conflated
            .entry(entry.pk.clone())
            .and_modify(|existing| existing.net = net.clone())
            .or_insert_with(|| ConflatedChange {
                newly_added: entry.kind == ChangeKind::Insert,
                net,
            });
    }
    // An insert that was deleted again within the same changeset is a no-op.
    conflated.retain(|_, change| !(change.newly_added && change.net == NetChange::Delete));
    conflated
}

/// Aggregate a conflated changeset into (added, removed, updated) counts.
pub fn aggregate_changes(
    conflated: &BTreeMap<Vec<Value>, ConflatedChange>,
) -> ChangeAggregate {
    let mut agg = ChangeAggregate::default();
    for change in conflated.values() {
        match (&change.net, change.newly_added) {
            (NetChange::Upsert(_), true) => agg.added += 1,
            (NetChange::Upsert(_), false) => agg.updated += 1,
            (NetChange::Delete, false) => agg.removed += 1,
            (NetChange::Delete, true) => {}
        }
    }
    agg
}

/// The capture log for one engine: per-schema, per-table change streams
/// plus the set of tables with capture installed.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct AuditLog {
    entries: Mutex<BTreeMap<String, BTreeMap<String, Vec<ChangeEntry>>>>,
    tracked: Mutex<BTreeMap<String, BTreeSet<String>>>,
}

type SchemaEntries = BTreeMap<String, BTreeMap<String, Vec<ChangeEntry>>>;

impl AuditLog {
    fn lock_entries(&self) -> std::sync::MutexGuard<'_, SchemaEntries> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_tracked(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, BTreeSet<String>>> {
        self.tracked.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Install capture on exactly `tables` for a schema. Idempotent;
    /// tables dropped from the schema lose their capture and their
    /// recorded changes.
    pub fn set_tracked(&self, schema: &str, tables: BTreeSet<String>) {
        if let Some(per_table) = self.lock_entries().get_mut(schema) {
            per_table.retain(|table, _| tables.contains(table));
        }
        self.lock_tracked().insert(schema.to_string(), tables);
    }

    pub fn is_tracked(&self, schema: &str, table: &str) -> bool {
        self.lock_tracked()
            .get(schema)
            .is_some_and(|tables| tables.contains(table))
    }

    /// Record one change against a tracked table. Untracked writes are
    /// silently ignored, matching trigger-based capture.
    pub fn record(&self, schema: &str, table: &str, entry: ChangeEntry) {
        if !self.is_tracked(schema, table) {
            return;
        }
        self.lock_entries()
            .entry(schema.to_string())
            .or_default()
            .entry(table.to_string())
            .or_default()
            .push(entry);
    }

    /// The raw pending change stream for one table, in capture order.
    pub fn pending(&self, schema: &str, table: &str) -> Vec<ChangeEntry> {
        self.lock_entries()
            .get(schema)
            .and_then(|per_table| per_table.get(table))
            .cloned()
            .unwrap_or_default()
    }

    /// Tables of a schema with at least one pending change.
    pub fn changed_tables(&self, schema: &str) -> BTreeSet<String> {
        self.lock_entries()
            .get(schema)
            .map(|per_table| {
                per_table
                    .iter()
                    .filter(|(_, changes)| !changes.is_empty())
                    .map(|(table, _)| table.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drop all pending changes for a schema.
    pub fn discard(&self, schema: &str) {
        self.lock_entries().remove(schema);
    }

    /// Remove capture and pending changes for a schema entirely.
    pub fn uninstall(&self, schema: &str) {
        self.lock_entries().remove(schema);
        self.lock_tracked().remove(schema);
    }

    pub fn snapshot(&self) -> AuditLog {
        AuditLog {
            entries: Mutex::new(self.lock_entries().clone()),
            tracked: Mutex::new(self.lock_tracked().clone()),
        }
    }
}
