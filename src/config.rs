//! Engine configuration: the local store file, default chunking and the
//! named remotes the CLI can sync against.
//!
//! Values resolve in precedence order: built-in defaults, patched by an
//! optional JSON config file, patched by `TABLEPACK_*` environment
//! variables.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::DEFAULT_CHUNK_SIZE;
use crate::core::engine::Engine;
use crate::core::sync::RemoteLookup;
use crate::errors::StoreError;

/// Environment variable naming the config file.
pub const CONFIG_FILE_ENV: &str = "TABLEPACK_CONFIG";
/// Config file looked up in the working directory by default.
pub const DEFAULT_CONFIG_FILE: &str = "tablepack.config.json";

/// One named remote: another store file on disk.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RemoteConfig {
    pub path: PathBuf,
    /// Whether a store created at this path starts bare. Remotes usually
    /// do.
    #[serde(default = "default_true")]
    pub bare: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub store_path: PathBuf,
    pub engine_name: String,
    pub chunk_size: usize,
    pub remotes: BTreeMap<String, RemoteConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from("tablepack.store.json"),
            engine_name: "local".to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            remotes: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Resolve the configuration: defaults, then the config file (from
    /// `TABLEPACK_CONFIG` or the working directory), then environment
    /// overrides.
    pub fn load() -> Result<Config, StoreError> {
        let mut value = serde_json::to_value(Config::default())?;
        let path = env::var(CONFIG_FILE_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE));
        if path.exists() {
            let file_value: serde_json::Value = serde_json::from_slice(&fs::read(&path)?)?;
            value = patch_config(value, file_value);
        }
        let mut config: Config = serde_json::from_value(value)?;

        if let Ok(store_path) = env::var("TABLEPACK_STORE") {
            config.store_path = PathBuf::from(store_path);
        }
        if let Ok(engine_name) = env::var("TABLEPACK_ENGINE") {
            config.engine_name = engine_name;
        }
        if let Ok(chunk_size) = env::var("TABLEPACK_CHUNK_SIZE") {
            config.chunk_size = chunk_size.parse().map_err(|_| {
                StoreError::InvalidArgument(format!(
                    "TABLEPACK_CHUNK_SIZE is not a number: {chunk_size}"
                ))
            })?;
        }
        Ok(config)
    }

    /// Open (or create) the local store this configuration points at.
    pub fn open_store(&self) -> Result<Arc<Engine>, StoreError> {
        Ok(Arc::new(Engine::load_or_create(
            &self.store_path,
            &self.engine_name,
        )?))
    }
}

/// Recursively merge `patch` into `config`: objects merge key-by-key,
/// anything else is replaced.
pub fn patch_config(
    config: serde_json::Value,
    patch: serde_json::Value,
) -> serde_json::Value {
    match (config, patch) {
        (serde_json::Value::Object(mut left), serde_json::Value::Object(right)) => {
            for (key, value) in right {
                let merged = match left.remove(&key) {
                    Some(existing) => patch_config(existing, value),
                    None => value,
                };
                left.insert(key, merged);
            }
            serde_json::Value::Object(left)
        }
        (_, patch) => patch,
    }
}

impl RemoteLookup for Config {
    fn engine(&self, name: &str) -> Result<Arc<Engine>, StoreError> {
        let remote = self.remotes.get(name).ok_or_else(|| {
            StoreError::RepositoryNotFound(format!("remote {name} is not configured"))
        })?;
        let engine = if remote.bare {
            Engine::load_or_create_bare(&remote.path, name)?
        } else {
            Engine::load_or_create(&remote.path, name)?
        };
        Ok(Arc::new(engine))
    }
}
