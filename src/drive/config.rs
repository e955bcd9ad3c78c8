//! Driver configuration.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::drive::error::DriveResult;
use crate::storage::{GitObjectStore, MemoryObjectStore, ObjectStore};

/// Where shard and tree bytes are kept.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ObjectStoreConfig {
    /// Process memory; everything is lost on drop.
    #[default]
    Memory,
    /// A bare git object database at `path`.
    Git { path: PathBuf },
}

/// Driver configuration options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    pub object_store: ObjectStoreConfig,
    /// Initialize the git object store if it does not exist yet.
    pub create_if_missing: bool,
    /// Byte threshold used when `put_file` is given 0.
    pub default_target_file_bytes: u64,
    /// Record threshold used when `put_file` is given 0.
    pub default_target_file_datums: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            object_store: ObjectStoreConfig::Memory,
            create_if_missing: true,
            default_target_file_bytes: 0,
            default_target_file_datums: 0,
        }
    }
}

impl DriverConfig {
    /// In-memory configuration.
    pub fn memory() -> Self {
        Self::default()
    }

    /// Configuration backed by a git object database at `path`.
    pub fn git(path: impl Into<PathBuf>) -> Self {
        Self {
            object_store: ObjectStoreConfig::Git { path: path.into() },
            ..Default::default()
        }
    }

    /// Parse a JSON config document. Missing fields take their defaults.
    pub fn from_json(json: &str) -> DriveResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Set create_if_missing flag.
    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Set the fallback byte threshold.
    pub fn target_file_bytes(mut self, bytes: u64) -> Self {
        self.default_target_file_bytes = bytes;
        self
    }

    /// Set the fallback record threshold.
    pub fn target_file_datums(mut self, datums: u64) -> Self {
        self.default_target_file_datums = datums;
        self
    }

    pub(crate) fn build_store(&self) -> DriveResult<Arc<dyn ObjectStore>> {
        Ok(match &self.object_store {
            ObjectStoreConfig::Memory => Arc::new(MemoryObjectStore::new()),
            ObjectStoreConfig::Git { path } if self.create_if_missing => {
                Arc::new(GitObjectStore::open_or_init(path)?)
            }
            ObjectStoreConfig::Git { path } => Arc::new(GitObjectStore::open(path)?),
        })
    }
}
