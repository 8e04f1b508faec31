//! 256-bit identifiers for images and objects, encoded as 64 lowercase hex
//! characters. Image hashes are drawn at random at commit time; object ids
//! are derived from fragment content so that identical content always maps
//! to the same identifier.

use std::{fmt::Display, str::FromStr};

use colored::Colorize;
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use sha2::{Digest, Sha256};

use crate::errors::StoreError;

/// A 256-bit identifier used for both image hashes and object ids.
///
/// Supports conversion to/from 64-character lowercase hex strings and is
/// ordered bytewise so that it can key ordered maps.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ObjectHash([u8; 32]);

impl Display for ObjectHash {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for ObjectHash {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl AsRef<[u8]> for ObjectHash {
    fn as_ref(&self) -> &[u8] {
        self.0.as_slice()
    }
}

/// Parse 64 hex characters into an `ObjectHash`.
impl FromStr for ObjectHash {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 64 {
            return Err(StoreError::InvalidHashValue(s.to_string()));
        }
        let bytes =
            hex::decode(s).map_err(|_| StoreError::InvalidHashValue(s.to_string()))?;
        let mut h = [0u8; 32];
        h.copy_from_slice(bytes.as_slice());
        Ok(ObjectHash(h))
    }
}

impl Serialize for ObjectHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ObjectHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ObjectHash::from_str(&s).map_err(de::Error::custom)
    }
}

impl ObjectHash {
    /// The distinguished all-zeros hash: the initial image of every
    /// repository.
    pub const fn zero() -> ObjectHash {
        ObjectHash([0u8; 32])
    }

    /// Whether this is the all-zeros hash.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Draw a fresh random 256-bit hash for a new image.
    pub fn random() -> ObjectHash {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        ObjectHash(bytes)
    }

    /// Compute the SHA-256 content hash of `data`.
    pub fn of_content(data: &[u8]) -> ObjectHash {
        let digest = Sha256::digest(data);
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(digest.as_ref());
        ObjectHash(bytes)
    }

    /// Create an `ObjectHash` from 32 raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<ObjectHash, StoreError> {
        if bytes.len() != 32 {
            return Err(StoreError::InvalidHashValue(hex::encode(bytes)));
        }
        let mut h = [0u8; 32];
        h.copy_from_slice(bytes);
        Ok(ObjectHash(h))
    }

    /// Format hash as colored string (for terminal display).
    pub fn to_color_str(self) -> String {
        self.to_string().yellow().bold().to_string()
    }

    /// Return raw bytes of the hash.
    pub fn to_data(self) -> Vec<u8> {
        self.0.to_vec()
    }
}
