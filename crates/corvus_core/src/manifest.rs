//! Database manifest for metadata storage.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Schema version this build reads and writes.
pub const SCHEMA_VERSION: u32 = 1;

/// Database manifest persisted as JSON at the directory root.
///
/// The manifest records the schema version and a stable database identity.
/// A version mismatch on open is fatal: the data directory must be migrated
/// or discarded before this build will touch it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    /// On-disk schema version.
    pub schema_version: u32,
    /// Stable identity of this database, assigned at creation.
    pub database_id: Uuid,
}

impl Default for Manifest {
    fn default() -> Self {
        Self::new()
    }
}

impl Manifest {
    /// Creates a manifest for a new database at the current schema version.
    #[must_use]
    pub fn new() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            database_id: Uuid::new_v4(),
        }
    }

    /// Encodes the manifest as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Decodes a manifest from JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidFormat`] when the bytes are not a valid
    /// manifest.
    pub fn decode(data: &[u8]) -> CoreResult<Self> {
        serde_json::from_slice(data)
            .map_err(|e| CoreError::invalid_format(format!("invalid manifest: {e}")))
    }

    /// Checks the schema version against this build.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::SchemaVersionMismatch`] on any difference.
    pub fn check_version(&self) -> CoreResult<()> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(CoreError::SchemaVersionMismatch {
                found: self.schema_version,
                supported: SCHEMA_VERSION,
            });
        }
        Ok(())
    }
}
