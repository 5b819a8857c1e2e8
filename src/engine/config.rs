//! Engine configuration.
//!
//! Loaded from a JSON file with [`EngineConfig::from_file`]; every section
//! and field is optional and falls back to its default.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::collection::{CollectionSettings, CompactionConfig};
use crate::error::{QuiverError, Result};
use crate::index::HnswConfig;
use crate::query::QueryConfig;
use crate::storage::StorageConfig;
use crate::wal::CommitConfig;

pub const DEFAULT_DATA_DIR: &str = "./quiver_data";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root directory of all persisted files.
    pub data_dir: PathBuf,
    /// Keep everything in memory; nothing survives a restart.
    pub in_memory: bool,
    pub storage: StorageConfig,
    pub commit: CommitConfig,
    /// Index settings of newly created collections.
    pub index: HnswConfig,
    pub compaction: CompactionConfig,
    pub query: QueryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            in_memory: false,
            storage: StorageConfig::default(),
            commit: CommitConfig::default(),
            index: HnswConfig::default(),
            compaction: CompactionConfig::default(),
            query: QueryConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Read a JSON configuration file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            QuiverError::invalid_config(format!("cannot read {}: {e}", path.display()))
        })?;
        let config: EngineConfig = serde_json::from_str(&content).map_err(|e| {
            QuiverError::invalid_config(format!("cannot parse {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Configuration of an engine that keeps everything in memory.
    pub fn in_memory() -> Self {
        EngineConfig {
            in_memory: true,
            ..Self::default()
        }
    }

    pub fn with_data_dir<P: Into<PathBuf>>(mut self, data_dir: P) -> Self {
        self.data_dir = data_dir.into();
        self
    }

    pub fn with_in_memory(mut self, in_memory: bool) -> Self {
        self.in_memory = in_memory;
        self
    }

    pub fn with_storage(mut self, storage: StorageConfig) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_commit(mut self, commit: CommitConfig) -> Self {
        self.commit = commit;
        self
    }

    pub fn with_index(mut self, index: HnswConfig) -> Self {
        self.index = index;
        self
    }

    pub fn with_compaction(mut self, compaction: CompactionConfig) -> Self {
        self.compaction = compaction;
        self
    }

    pub fn with_query(mut self, query: QueryConfig) -> Self {
        self.query = query;
        self
    }

    /// Settings every collection is opened with.
    pub fn collection_settings(&self) -> CollectionSettings {
        CollectionSettings {
            commit: self.commit.clone(),
            compaction: self.compaction.clone(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.in_memory && self.data_dir.as_os_str().is_empty() {
            return Err(QuiverError::invalid_config("data_dir must not be empty"));
        }
        self.storage.validate()?;
        self.commit.validate()?;
        self.index.validate()?;
        self.compaction.validate()?;
        self.query.validate()
    }
}
