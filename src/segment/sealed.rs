//! Immutable sealed segments.
//!
//! A sealed segment never changes after its footer is written. Its records
//! are held in memory and its proximity graph is attached once, either while
//! sealing or on the first query. A segment whose file fails validation stays
//! in the manifest but is marked [`SegmentHealth::Corrupted`], holds no
//! records, and is skipped by queries, which then report degraded results.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;

use crate::error::{QuiverError, Result};
use crate::index::hnsw::{self, HnswIndex, RankedRecords, SearchCandidate};
use crate::index::{HnswConfig, snapshot};
use crate::query::cancel::CancelToken;
use crate::segment::format::{
    self, FOOTER_LEN, HEADER_LEN, SegmentFooter, SegmentHeader, segment_file_name,
};
use crate::segment::manifest::SegmentDescriptor;
use crate::storage::Storage;
use crate::vector::codec::{VectorCodec, encode_record};
use crate::vector::{DistanceMetric, VectorRecord};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum SegmentHealth {
    Healthy,
    Corrupted(String),
}

#[derive(Debug)]
pub struct SealedSegment {
    descriptor: SegmentDescriptor,
    records: Arc<Vec<Arc<VectorRecord>>>,
    /// Position of the newest version of each id within this segment.
    positions: HashMap<String, usize>,
    /// Ascending-id rank of each position, for tie-breaking.
    ranks: Vec<u32>,
    health: SegmentHealth,
    metric: DistanceMetric,
    index_config: HnswConfig,
    storage: Arc<dyn Storage>,
    index: Mutex<Option<Arc<HnswIndex>>>,
}

impl SealedSegment {
    /// Wrap records that were just written to a sealed file.
    pub fn from_records(
        descriptor: SegmentDescriptor,
        records: Vec<Arc<VectorRecord>>,
        metric: DistanceMetric,
        index_config: HnswConfig,
        storage: Arc<dyn Storage>,
    ) -> Self {
        let positions = newest_positions(&records);
        let ranks = hnsw::id_ranks(&records);
        SealedSegment {
            descriptor,
            records: Arc::new(records),
            positions,
            ranks,
            health: SegmentHealth::Healthy,
            metric,
            index_config,
            storage,
            index: Mutex::new(None),
        }
    }

    /// Load a sealed segment file. Validation failures produce a corrupted
    /// segment rather than an error.
    pub fn load(
        storage: Arc<dyn Storage>,
        descriptor: SegmentDescriptor,
        codec: VectorCodec,
        metric: DistanceMetric,
        index_config: HnswConfig,
    ) -> Self {
        match read_sealed_file(storage.as_ref(), descriptor.id, codec) {
            Ok(records) => {
                Self::from_records(descriptor, records, metric, index_config, storage)
            }
            Err(err) => {
                log::error!("Segment {} is unreadable and excluded from queries: {err}", descriptor.id);
                SealedSegment {
                    descriptor,
                    records: Arc::new(Vec::new()),
                    positions: HashMap::new(),
                    ranks: Vec::new(),
                    health: SegmentHealth::Corrupted(err.to_string()),
                    metric,
                    index_config,
                    storage,
                    index: Mutex::new(None),
                }
            }
        }
    }

    pub fn id(&self) -> u64 {
        self.descriptor.id
    }

    pub fn descriptor(&self) -> &SegmentDescriptor {
        &self.descriptor
    }

    pub fn health(&self) -> &SegmentHealth {
        &self.health
    }

    pub fn is_healthy(&self) -> bool {
        self.health == SegmentHealth::Healthy
    }

    pub fn records(&self) -> &Arc<Vec<Arc<VectorRecord>>> {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Newest version of `record_id` stored in this segment, tombstones included.
    pub fn get(&self, record_id: &str) -> Option<&Arc<VectorRecord>> {
        self.positions
            .get(record_id)
            .and_then(|&position| self.records.get(position))
    }

    pub fn has_index(&self) -> bool {
        self.index.lock().is_some()
    }

    /// The segment's proximity graph, loading or building it on first use.
    pub fn index(&self) -> Result<Arc<HnswIndex>> {
        if !self.is_healthy() {
            return Err(QuiverError::corruption(format!(
                "segment {} is corrupted",
                self.id()
            )));
        }

        let mut slot = self.index.lock();
        if let Some(index) = slot.as_ref() {
            return Ok(Arc::clone(index));
        }

        let index = Arc::new(self.load_or_build_index()?);
        *slot = Some(Arc::clone(&index));
        Ok(index)
    }

    fn load_or_build_index(&self) -> Result<HnswIndex> {
        if self.index_config.persist {
            match snapshot::load(
                self.storage.as_ref(),
                self.id(),
                self.records.len(),
                self.metric,
            ) {
                Ok(Some(index)) => return Ok(index),
                Ok(None) => {}
                Err(err) => log::warn!("Rebuilding index of segment {}: {err}", self.id()),
            }
        }

        let index = HnswIndex::build(self.records.as_slice(), self.metric, &self.index_config)?;
        log::debug!(
            "Built index for segment {} ({} vectors, {} layers)",
            self.id(),
            index.len(),
            index.max_level() + 1
        );

        // A segment replaced by compaction may already have lost its file.
        if self.index_config.persist && self.storage.file_exists(&segment_file_name(self.id())) {
            if let Err(err) = snapshot::save(self.storage.as_ref(), self.id(), &index) {
                log::warn!("Could not persist index of segment {}: {err}", self.id());
            }
        }
        Ok(index)
    }

    /// Approximate top-`k` among records accepted by `allow`.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        ef: usize,
        allow: &dyn Fn(usize, &VectorRecord) -> bool,
        cancel: &CancelToken,
    ) -> Result<Vec<SearchCandidate>> {
        let index = self.index()?;
        let records = self.records.as_slice();
        let allow_node = |node: usize| records.get(node).is_some_and(|r| allow(node, r));
        let source = RankedRecords::new(records, &self.ranks);
        index.search(&source, query, k, ef, &allow_node, cancel)
    }
}

/// Build the descriptor for a set of records about to be sealed.
pub fn describe(id: u64, records: &[Arc<VectorRecord>], size_bytes: u64) -> SegmentDescriptor {
    SegmentDescriptor {
        id,
        record_count: records.len() as u64,
        tombstone_count: records.iter().filter(|r| r.deleted).count() as u64,
        min_seq: records.iter().map(|r| r.seq).min().unwrap_or(0),
        max_seq: records.iter().map(|r| r.seq).max().unwrap_or(0),
        size_bytes,
        sealed_at: Utc::now(),
    }
}

/// Write a complete sealed segment file (used by compaction). Returns its size.
pub fn write_sealed_file(
    storage: &dyn Storage,
    id: u64,
    dimension: usize,
    records: &[Arc<VectorRecord>],
) -> Result<u64> {
    let header = SegmentHeader {
        segment_id: id,
        dimension: dimension as u32,
    };
    let mut frames = Vec::new();
    for record in records {
        format::put_frame(&mut frames, &encode_record(record));
    }
    let footer = SegmentFooter {
        record_count: records.len() as u64,
        frames_crc: crc32fast::hash(&frames),
    };

    let mut bytes = Vec::with_capacity(frames.len() + (HEADER_LEN + FOOTER_LEN) as usize);
    bytes.extend_from_slice(&header.encode());
    bytes.extend_from_slice(&frames);
    bytes.extend_from_slice(&footer.encode());

    storage.write_atomic(&segment_file_name(id), &bytes)?;
    Ok(bytes.len() as u64)
}

/// Read and fully validate a sealed segment file.
pub fn read_sealed_file(
    storage: &dyn Storage,
    id: u64,
    codec: VectorCodec,
) -> Result<Vec<Arc<VectorRecord>>> {
    let bytes = storage.read_bytes(&segment_file_name(id))?;
    let (header, frames) = format::parse_sealed(&bytes)?;
    if header.segment_id != id {
        return Err(QuiverError::corruption(format!(
            "segment file {id} carries id {}",
            header.segment_id
        )));
    }
    if header.dimension as usize != codec.dimension() {
        return Err(QuiverError::corruption(format!(
            "segment {id} has dimension {}, expected {}",
            header.dimension,
            codec.dimension()
        )));
    }

    frames
        .into_iter()
        .map(|frame| codec.decode(frame).map(Arc::new))
        .collect()
}

fn newest_positions(records: &[Arc<VectorRecord>]) -> HashMap<String, usize> {
    let mut positions: HashMap<String, usize> = HashMap::with_capacity(records.len());
    for (position, record) in records.iter().enumerate() {
        let newer = positions
            .get(&record.id)
            .is_none_or(|&existing| records[existing].seq <= record.seq);
        if newer {
            positions.insert(record.id.clone(), position);
        }
    }
    positions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn storage() -> Arc<dyn Storage> {
        Arc::new(MemoryStorage::new_default())
    }

    fn sample_records() -> Vec<Arc<VectorRecord>> {
        vec![
            Arc::new(VectorRecord::new("a", vec![1.0, 0.0]).with_seq(1)),
            Arc::new(VectorRecord::new("b", vec![0.0, 1.0]).with_seq(2)),
            Arc::new(VectorRecord::new("a", vec![0.5, 0.5]).with_seq(3)),
            Arc::new(VectorRecord::tombstone("b").with_seq(4)),
        ]
    }

    #[test]
    fn test_write_then_load() {
        let storage = storage();
        let records = sample_records();
        let size = write_sealed_file(storage.as_ref(), 4, 2, &records).unwrap();
        let descriptor = describe(4, &records, size);
        assert_eq!(descriptor.tombstone_count, 1);
        assert_eq!((descriptor.min_seq, descriptor.max_seq), (1, 4));

        let segment = SealedSegment::load(
            storage,
            descriptor,
            VectorCodec::new(2),
            DistanceMetric::L2,
            HnswConfig::default(),
        );
        assert!(segment.is_healthy());
        assert_eq!(segment.len(), 4);
        assert_eq!(segment.get("a").unwrap().seq, 3);
        assert!(segment.get("b").unwrap().deleted);
        assert!(segment.get("zzz").is_none());
    }

    #[test]
    fn test_damaged_file_marks_segment_corrupted() {
        let storage = storage();
        let records = sample_records();
        let size = write_sealed_file(storage.as_ref(), 4, 2, &records).unwrap();

        let name = segment_file_name(4);
        let mut bytes = storage.read_bytes(&name).unwrap();
        bytes[HEADER_LEN as usize + 10] ^= 0x01;
        storage.write_atomic(&name, &bytes).unwrap();

        let segment = SealedSegment::load(
            storage,
            describe(4, &records, size),
            VectorCodec::new(2),
            DistanceMetric::L2,
            HnswConfig::default(),
        );
        assert!(!segment.is_healthy());
        assert!(segment.is_empty());
        assert!(segment.index().is_err());
    }

    #[test]
    fn test_index_is_built_once_and_persisted() {
        let storage = storage();
        let records = sample_records();
        let size = write_sealed_file(storage.as_ref(), 4, 2, &records).unwrap();
        let segment = SealedSegment::from_records(
            describe(4, &records, size),
            records,
            DistanceMetric::L2,
            HnswConfig::default(),
            storage.clone(),
        );

        assert!(!segment.has_index());
        let first = segment.index().unwrap();
        let second = segment.index().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(storage.file_exists(&format::index_file_name(4)));
        assert_eq!(first.len(), 3);
    }

    #[test]
    fn test_index_of_deleted_segment_is_not_persisted() {
        let storage = storage();
        let records = sample_records();
        let size = write_sealed_file(storage.as_ref(), 6, 2, &records).unwrap();
        let segment = SealedSegment::from_records(
            describe(6, &records, size),
            records,
            DistanceMetric::L2,
            HnswConfig::default(),
            storage.clone(),
        );
        storage.delete_file(&segment_file_name(6)).unwrap();

        assert_eq!(segment.index().unwrap().len(), 3);
        assert!(!storage.file_exists(&format::index_file_name(6)));
    }

    #[test]
    fn test_equal_distances_rank_by_id() {
        let storage = storage();
        let records: Vec<Arc<VectorRecord>> = ["z", "m", "a"]
            .iter()
            .enumerate()
            .map(|(i, id)| Arc::new(VectorRecord::new(*id, vec![1.0, 0.0]).with_seq(i as u64 + 1)))
            .collect();
        let segment = SealedSegment::from_records(
            describe(3, &records, 0),
            records,
            DistanceMetric::L2,
            HnswConfig::default().with_persist(false),
            storage,
        );

        let results = segment
            .search(&[1.0, 0.0], 2, 16, &|_, _| true, &CancelToken::new())
            .unwrap();
        let ids: Vec<&str> = results
            .iter()
            .map(|c| segment.records()[c.node as usize].id.as_str())
            .collect();
        assert_eq!(ids, vec!["a", "m"]);
    }

    #[test]
    fn test_search_respects_predicate() {
        let storage = storage();
        let records = sample_records();
        let segment = SealedSegment::from_records(
            describe(9, &records, 0),
            records,
            DistanceMetric::L2,
            HnswConfig::default().with_persist(false),
            storage,
        );

        let results = segment
            .search(&[1.0, 0.0], 5, 16, &|_, r| r.seq != 1, &CancelToken::new())
            .unwrap();
        let nodes: Vec<u32> = results.iter().map(|c| c.node).collect();
        assert_eq!(nodes, vec![2, 1]);
    }
}
