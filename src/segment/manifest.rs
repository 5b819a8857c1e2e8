//! The collection manifest: the durable list of sealed segments and the
//! active segment's flushed offset.
//!
//! Every change produces a new manifest with a strictly greater generation,
//! written to `MANIFEST.tmp`, synced, and renamed over `MANIFEST`. After a
//! restart the engine sees either the previous or the new manifest, never a
//! partial one.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::collection::config::CollectionConfig;
use crate::error::{QuiverError, Result};
use crate::segment::format::{HEADER_LEN, MANIFEST_FILE, MANIFEST_TEMP_FILE};
use crate::storage::Storage;

pub const MANIFEST_FORMAT_VERSION: u32 = 1;

/// Summary of one sealed segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentDescriptor {
    pub id: u64,
    /// Number of records in the segment file, tombstones included.
    pub record_count: u64,
    /// Number of tombstones in the segment file.
    pub tombstone_count: u64,
    pub min_seq: u64,
    pub max_seq: u64,
    pub size_bytes: u64,
    pub sealed_at: DateTime<Utc>,
}

/// Durable position of the active segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveState {
    pub id: u64,
    /// Records persisted to the active segment file.
    pub flushed_records: u64,
    /// Valid prefix of the active segment file, header included.
    pub flushed_bytes: u64,
    /// Highest WAL sequence number reflected in segment files.
    pub flushed_seq: u64,
}

impl ActiveState {
    pub fn fresh(id: u64, flushed_seq: u64) -> Self {
        ActiveState {
            id,
            flushed_records: 0,
            flushed_bytes: HEADER_LEN,
            flushed_seq,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub format_version: u32,
    pub generation: u64,
    pub collection_id: Uuid,
    pub config: CollectionConfig,
    pub sealed: Vec<SegmentDescriptor>,
    pub active: ActiveState,
    pub next_segment_id: u64,
    pub last_sealed_segment_id: Option<u64>,
    pub updated_at: DateTime<Utc>,
}

impl Manifest {
    /// Manifest of a newly created collection: generation 1, active segment 1.
    pub fn new(collection_id: Uuid, config: CollectionConfig) -> Self {
        Manifest {
            format_version: MANIFEST_FORMAT_VERSION,
            generation: 1,
            collection_id,
            config,
            sealed: Vec::new(),
            active: ActiveState::fresh(1, 0),
            next_segment_id: 2,
            last_sealed_segment_id: None,
            updated_at: Utc::now(),
        }
    }

    /// Ids of every segment file the manifest references.
    pub fn referenced_segments(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.sealed.iter().map(|s| s.id).collect();
        ids.push(self.active.id);
        ids
    }

    pub fn sealed_descriptor(&self, id: u64) -> Option<&SegmentDescriptor> {
        self.sealed.iter().find(|s| s.id == id)
    }

    /// Take the next segment id.
    pub fn allocate_segment_id(&mut self) -> u64 {
        let id = self.next_segment_id;
        self.next_segment_id += 1;
        id
    }

    fn validate(&self) -> Result<()> {
        if self.format_version != MANIFEST_FORMAT_VERSION {
            return Err(QuiverError::corruption(format!(
                "unsupported manifest version {}",
                self.format_version
            )));
        }
        if self.active.flushed_bytes < HEADER_LEN {
            return Err(QuiverError::corruption(
                "manifest active offset is inside the segment header",
            ));
        }
        let referenced = self.referenced_segments();
        if referenced.iter().any(|id| *id >= self.next_segment_id) {
            return Err(QuiverError::corruption(
                "manifest references a segment id at or beyond next_segment_id",
            ));
        }
        Ok(())
    }
}

/// Owner of a collection's current manifest.
#[derive(Debug)]
pub struct ManifestStore {
    storage: Arc<dyn Storage>,
    current: Mutex<Manifest>,
}

impl ManifestStore {
    /// Persist a brand-new manifest.
    pub fn create(storage: Arc<dyn Storage>, manifest: Manifest) -> Result<Self> {
        manifest.validate()?;
        write_manifest(storage.as_ref(), &manifest)?;
        Ok(ManifestStore {
            storage,
            current: Mutex::new(manifest),
        })
    }

    /// Load the manifest, discarding any half-written temporary file first.
    ///
    /// Returns `Ok(None)` when no manifest exists.
    pub fn open(storage: Arc<dyn Storage>) -> Result<Option<Self>> {
        if storage.file_exists(MANIFEST_TEMP_FILE) {
            log::warn!("Discarding interrupted manifest write");
            storage.delete_file(MANIFEST_TEMP_FILE)?;
        }
        if !storage.file_exists(MANIFEST_FILE) {
            return Ok(None);
        }

        let bytes = storage.read_bytes(MANIFEST_FILE)?;
        let manifest: Manifest = serde_json::from_slice(&bytes)
            .map_err(|e| QuiverError::corruption(format!("unreadable manifest: {e}")))?;
        manifest.validate()?;

        Ok(Some(ManifestStore {
            storage,
            current: Mutex::new(manifest),
        }))
    }

    /// Snapshot of the current manifest.
    pub fn current(&self) -> Manifest {
        self.current.lock().clone()
    }

    pub fn generation(&self) -> u64 {
        self.current.lock().generation
    }

    /// Apply `change` to a copy of the manifest and publish it atomically.
    ///
    /// When `change` fails nothing is written and the current manifest is
    /// unchanged. The closure's output is returned alongside the new manifest.
    pub fn update<T>(&self, change: impl FnOnce(&mut Manifest) -> Result<T>) -> Result<(Manifest, T)> {
        let mut current = self.current.lock();
        let mut next = current.clone();
        let output = change(&mut next)?;

        next.generation = current.generation + 1;
        next.updated_at = Utc::now();
        next.validate()?;
        if next.generation <= current.generation {
            return Err(QuiverError::internal("manifest generation must increase"));
        }

        write_manifest(self.storage.as_ref(), &next)?;
        *current = next.clone();
        Ok((next, output))
    }
}

fn write_manifest(storage: &dyn Storage, manifest: &Manifest) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(manifest)?;
    storage.write_atomic(MANIFEST_FILE, &bytes)
}
