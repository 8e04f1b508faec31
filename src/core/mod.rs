//! Core of the versioned table store: the image/object graph, the commit
//! and checkout engines, diffing and repository synchronization.

pub mod audit;
pub mod diff;
pub mod engine;
pub mod fragments;
pub mod image;
pub mod object;
pub mod objects;
pub mod query;
pub mod repository;
pub mod schema;
pub mod sync;
pub mod table;
pub mod value;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::errors::StoreError;
use crate::hash::ObjectHash;

/// Schema holding engine-internal tables: transient materializations and
/// imported query results.
pub const META_SCHEMA: &str = "tablepack_meta";

/// The reserved tag naming the currently checked-out image. Never synced,
/// never dumped.
pub const HEAD: &str = "HEAD";

/// Default number of rows per base fragment chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 10_000;

/// The working-schema name for a repository: `namespace/repository`, or
/// just the repository when the namespace is empty.
pub fn repo_key(namespace: &str, repository: &str) -> String {
    if namespace.is_empty() {
        repository.to_string()
    } else {
        format!("{namespace}/{repository}")
    }
}

/// Cooperative cancellation flag shared between a caller and a long
/// operation. Checked at chunk and transfer boundaries; a cancelled
/// operation rolls back like any other failure.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Error out of the current operation if cancellation was requested.
    pub fn check(&self) -> Result<(), StoreError> {
        if self.is_cancelled() {
            Err(StoreError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Record of object payloads a mutating operation added, so that a failed
/// operation can remove exactly what it created.
#[derive(Debug, Default)]
pub struct TxLog {
    pub new_payloads: Vec<ObjectHash>,
}
