//! Error types for the tablepack crate.
//!
//! This module defines a unified error enumeration used across the metadata
//! store, fragment construction, checkout/materialization, diffing and
//! repository sync. It integrates with `thiserror` to provide rich `Display`
//! implementations and error source chaining where applicable.
//!
//! Notes:
//! - Each variant carries contextual details via its message payload.
//! - Variants cover missing entities, clashes, integrity violations,
//!   checkout conflicts, engine/transport failures and invalid arguments.

use thiserror::Error;

#[derive(Error, Debug)]
/// Unified error enumeration for the tablepack library.
///
/// - Used across the metadata store, object store, commit/checkout engines
///   and the sync machinery.
/// - Implements `std::error::Error` via `thiserror`.
pub enum StoreError {
    /// Image hash not present in the repository.
    #[error("No image {0} found in {1}")]
    ImageNotFound(String, String),

    /// Tag not present in the repository.
    #[error("Tag {0} not found in {1}")]
    TagNotFound(String, String),

    /// Table not present in the image or working schema.
    #[error("Table {0} not found in image {1}")]
    TableNotFound(String, String),

    /// Object metadata or payload missing where required.
    #[error("Object {0} not found")]
    ObjectNotFound(String),

    /// Repository has no metadata on this engine.
    #[error("Repository {0} not found")]
    RepositoryNotFound(String),

    /// Table already exists in the target image or working schema.
    #[error("Table(s) {0} already exist at {1}")]
    TableClash(String, String),

    /// Object identifier collision with differing content.
    #[error("Object {0} is already registered with different content")]
    ObjectClash(String),

    /// Dangling object reference, malformed object chain or descriptor
    /// referencing unregistered objects.
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// Pending changes present where the caller demanded a clean state.
    #[error("{0}")]
    CheckoutConflict(String),

    /// Required engine-side facility (audit capture, working area) absent.
    #[error("Engine not initialized: {0}")]
    EngineInit(String),

    /// Remote store unavailable or a transfer failed mid-flight.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Invalid CLI or function argument.
    #[error("Argument parse failed: {0}")]
    InvalidArgument(String),

    /// Invalid 64-hex hash formatting or value.
    #[error("The {0} is not a valid hash value")]
    InvalidHashValue(String),

    /// Operation cancelled through a cancellation token.
    #[error("Operation cancelled")]
    Cancelled,

    /// I/O error from an underlying reader or writer.
    #[error("IO Error: {0}")]
    IOError(#[from] std::io::Error),

    /// Serialization or deserialization failure.
    #[error("Serde Error: {0}")]
    SerdeError(#[from] serde_json::Error),
}

impl StoreError {
    /// Whether the error is caused by bad user input (missing tags,
    /// clashes, conflicting checkouts) as opposed to an engine or
    /// transport fault. Drives the CLI exit code.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            StoreError::ImageNotFound(..)
                | StoreError::TagNotFound(..)
                | StoreError::TableNotFound(..)
                | StoreError::RepositoryNotFound(..)
                | StoreError::TableClash(..)
                | StoreError::CheckoutConflict(..)
                | StoreError::InvalidArgument(..)
                | StoreError::InvalidHashValue(..)
        )
    }
}
