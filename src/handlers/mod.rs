//! Pluggable transports for object payloads stored outside an engine.
//!
//! The engine itself only needs two primitives: upload a batch of payloads
//! somewhere (producing location records) and download payloads back from
//! their locations. `DB` is the reserved handler name meaning "push into
//! the target's own store" and is implemented by the object manager;
//! everything else resolves through this registry. The built-in `FILE`
//! handler keeps payloads as JSON files under a directory; blob-bucket
//! handlers (S3 and friends) register themselves at runtime.

pub mod file;

use std::sync::Arc;

use dashmap::DashMap;

use crate::core::engine::Engine;
use crate::core::object::ObjectLocation;
use crate::errors::StoreError;
use crate::hash::ObjectHash;

pub use file::FileHandler;

/// A transport for object payloads living outside the engine.
pub trait ExternalHandler: Send + Sync {
    /// Push payloads out of `source`, returning one location record per
    /// uploaded object.
    fn upload(
        &self,
        source: &Engine,
        object_ids: &[ObjectHash],
        params: &serde_json::Value,
    ) -> Result<Vec<ObjectLocation>, StoreError>;

    /// Fetch payloads at `locations` into `target`, returning the ids
    /// actually inserted.
    fn download(
        &self,
        target: &Engine,
        locations: &[ObjectLocation],
    ) -> Result<Vec<ObjectHash>, StoreError>;
}

/// Protocol name to handler mapping, per engine.
pub struct HandlerRegistry {
    handlers: DashMap<String, Arc<dyn ExternalHandler>>,
}

impl HandlerRegistry {
    /// A registry with the built-in handlers installed.
    pub fn with_defaults() -> HandlerRegistry {
        let registry = HandlerRegistry {
            handlers: DashMap::new(),
        };
        registry.register("FILE", Arc::new(FileHandler));
        registry
    }

    pub fn register(&self, protocol: &str, handler: Arc<dyn ExternalHandler>) {
        self.handlers.insert(protocol.to_string(), handler);
    }

    pub fn get(&self, protocol: &str) -> Result<Arc<dyn ExternalHandler>, StoreError> {
        self.handlers
            .get(protocol)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                StoreError::EngineInit(format!(
                    "no external handler registered for protocol {protocol}"
                ))
            })
    }
}
