//! Filesystem payload handler: one JSON file per object under a caller
//! supplied directory. The testable stand-in for blob-bucket storage.

use std::fs;
use std::path::Path;

use crate::core::engine::Engine;
use crate::core::object::{FragmentPayload, ObjectLocation};
use crate::errors::StoreError;
use crate::handlers::ExternalHandler;
use crate::hash::ObjectHash;

/// Protocol name for payloads stored as files.
pub const FILE_PROTOCOL: &str = "FILE";

pub struct FileHandler;

impl ExternalHandler for FileHandler {
    fn upload(
        &self,
        source: &Engine,
        object_ids: &[ObjectHash],
        params: &serde_json::Value,
    ) -> Result<Vec<ObjectLocation>, StoreError> {
        let dir = params
            .get("path")
            .and_then(|value| value.as_str())
            .ok_or_else(|| {
                StoreError::InvalidArgument(
                    "FILE handler requires a \"path\" parameter".to_string(),
                )
            })?;
        fs::create_dir_all(dir)?;

        let mut locations = Vec::with_capacity(object_ids.len());
        for object_id in object_ids {
            let payload = source
                .get_payload(object_id)
                .ok_or_else(|| StoreError::ObjectNotFound(object_id.to_string()))?;
            let path = Path::new(dir).join(format!("{object_id}.json"));
            fs::write(&path, serde_json::to_vec(&payload)?)?;
            locations.push(ObjectLocation {
                object_id: *object_id,
                protocol: FILE_PROTOCOL.to_string(),
                location: path.to_string_lossy().into_owned(),
            });
        }
        Ok(locations)
    }

    fn download(
        &self,
        target: &Engine,
        locations: &[ObjectLocation],
    ) -> Result<Vec<ObjectHash>, StoreError> {
        let mut fetched = Vec::new();
        for location in locations {
            if target.has_payload(&location.object_id) {
                continue;
            }
            let bytes = fs::read(&location.location).map_err(|err| {
                StoreError::Transport(format!(
                    "cannot read payload of {} at {}: {err}",
                    location.object_id, location.location
                ))
            })?;
            let payload: FragmentPayload = serde_json::from_slice(&bytes)?;
            if target.insert_payload(location.object_id, payload) {
                fetched.push(location.object_id);
            }
        }
        Ok(fetched)
    }
}
