//! The catalog: which collection names exist and where their files live.
//!
//! Persisted as `catalog.json` at the engine root and replaced atomically on
//! every change. Each collection's files live under `collections/{id}/`, so a
//! name can be dropped and re-created without the two generations sharing
//! any file.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{QuiverError, Result};
use crate::storage::Storage;

pub const CATALOG_FILE: &str = "catalog.json";
pub const COLLECTIONS_DIR: &str = "collections";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
}

impl CatalogEntry {
    pub fn new() -> Self {
        CatalogEntry {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
        }
    }

    /// Storage prefix of this collection's files.
    pub fn prefix(&self) -> String {
        collection_prefix(self.id)
    }
}

impl Default for CatalogEntry {
    fn default() -> Self {
        Self::new()
    }
}

pub fn collection_prefix(id: Uuid) -> String {
    format!("{COLLECTIONS_DIR}/{id}")
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CatalogFile {
    collections: BTreeMap<String, CatalogEntry>,
}

#[derive(Debug)]
pub struct Catalog {
    storage: Arc<dyn Storage>,
    entries: RwLock<BTreeMap<String, CatalogEntry>>,
}

impl Catalog {
    /// Load the catalog, starting empty when none has been written yet.
    pub fn load(storage: Arc<dyn Storage>) -> Result<Self> {
        let temp = format!("{CATALOG_FILE}.tmp");
        if storage.file_exists(&temp) {
            storage.delete_file(&temp)?;
        }

        let entries = if storage.file_exists(CATALOG_FILE) {
            let bytes = storage.read_bytes(CATALOG_FILE)?;
            let file: CatalogFile = serde_json::from_slice(&bytes)
                .map_err(|e| QuiverError::corruption(format!("unreadable catalog: {e}")))?;
            file.collections
        } else {
            BTreeMap::new()
        };

        Ok(Catalog {
            storage,
            entries: RwLock::new(entries),
        })
    }

    pub fn get(&self, name: &str) -> Option<CatalogEntry> {
        self.entries.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().contains_key(name)
    }

    /// Names and entries, ordered by name.
    pub fn list(&self) -> Vec<(String, CatalogEntry)> {
        self.entries
            .read()
            .iter()
            .map(|(name, entry)| (name.clone(), entry.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Register `name`. Fails with `AlreadyExists` if it is taken.
    pub fn insert(&self, name: &str, entry: CatalogEntry) -> Result<()> {
        let mut entries = self.entries.write();
        if entries.contains_key(name) {
            return Err(QuiverError::already_exists(format!(
                "collection {name} already exists"
            )));
        }
        let mut next = entries.clone();
        next.insert(name.to_string(), entry);
        self.persist(&next)?;
        *entries = next;
        Ok(())
    }

    /// Unregister `name`, returning its entry.
    pub fn remove(&self, name: &str) -> Result<CatalogEntry> {
        let mut entries = self.entries.write();
        let mut next = entries.clone();
        let entry = next
            .remove(name)
            .ok_or_else(|| QuiverError::collection_not_found(name))?;
        self.persist(&next)?;
        *entries = next;
        Ok(entry)
    }

    fn persist(&self, entries: &BTreeMap<String, CatalogEntry>) -> Result<()> {
        let file = CatalogFile {
            collections: entries.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&file)?;
        self.storage.write_atomic(CATALOG_FILE, &bytes)
    }
}
