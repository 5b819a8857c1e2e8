//! Persistence of index snapshots next to their segment files.
//!
//! ```text
//! magic "QVHNSW01" | crc32 of payload u32 | bincode(HnswIndex)
//! ```
//!
//! A snapshot that is missing, damaged, or built over a different number of
//! positions is reported as `None`/`Corruption`; the caller rebuilds the graph
//! from the segment instead.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{QuiverError, Result};
use crate::index::hnsw::HnswIndex;
use crate::segment::format::index_file_name;
use crate::storage::Storage;
use crate::vector::DistanceMetric;

const SNAPSHOT_MAGIC: &[u8; 8] = b"QVHNSW01";
const SNAPSHOT_HEADER_LEN: usize = 12;

/// Write the snapshot of `segment_id`'s index atomically.
pub fn save(storage: &dyn Storage, segment_id: u64, index: &HnswIndex) -> Result<()> {
    let payload = bincode::serialize(index)?;
    let mut bytes = Vec::with_capacity(SNAPSHOT_HEADER_LEN + payload.len());
    bytes.extend_from_slice(SNAPSHOT_MAGIC);
    let mut crc = [0u8; 4];
    LittleEndian::write_u32(&mut crc, crc32fast::hash(&payload));
    bytes.extend_from_slice(&crc);
    bytes.extend_from_slice(&payload);

    storage.write_atomic(&index_file_name(segment_id), &bytes)
}

/// Load the snapshot of `segment_id`, if one exists.
pub fn load(
    storage: &dyn Storage,
    segment_id: u64,
    expected_nodes: usize,
    metric: DistanceMetric,
) -> Result<Option<HnswIndex>> {
    let name = index_file_name(segment_id);
    if !storage.file_exists(&name) {
        return Ok(None);
    }

    let bytes = storage.read_bytes(&name)?;
    if bytes.len() < SNAPSHOT_HEADER_LEN || &bytes[..8] != SNAPSHOT_MAGIC {
        return Err(QuiverError::corruption(format!(
            "index snapshot {name} has a bad header"
        )));
    }
    let stored_crc = LittleEndian::read_u32(&bytes[8..12]);
    let payload = &bytes[SNAPSHOT_HEADER_LEN..];
    if crc32fast::hash(payload) != stored_crc {
        return Err(QuiverError::corruption(format!(
            "index snapshot {name} checksum mismatch"
        )));
    }

    let index: HnswIndex = bincode::deserialize(payload)
        .map_err(|e| QuiverError::corruption(format!("index snapshot {name}: {e}")))?;
    if index.node_count() != expected_nodes || index.metric() != metric {
        return Err(QuiverError::corruption(format!(
            "index snapshot {name} does not match its segment"
        )));
    }

    Ok(Some(index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::HnswConfig;
    use crate::storage::MemoryStorage;
    use crate::vector::VectorRecord;
    use std::sync::Arc;

    fn build() -> (Vec<Arc<VectorRecord>>, HnswIndex) {
        let records: Vec<Arc<VectorRecord>> = (0..40)
            .map(|i| Arc::new(VectorRecord::new(format!("r{i}"), vec![i as f32, 1.0])))
            .collect();
        let index = HnswIndex::build(&records, DistanceMetric::L2, &HnswConfig::default()).unwrap();
        (records, index)
    }

    #[test]
    fn test_save_and_load() {
        let storage = MemoryStorage::new_default();
        let (records, index) = build();

        save(&storage, 5, &index).unwrap();
        let loaded = load(&storage, 5, records.len(), DistanceMetric::L2)
            .unwrap()
            .unwrap();
        assert_eq!(loaded, index);
    }

    #[test]
    fn test_missing_snapshot() {
        let storage = MemoryStorage::new_default();
        assert!(load(&storage, 1, 0, DistanceMetric::L2).unwrap().is_none());
    }

    #[test]
    fn test_damaged_or_mismatched_snapshot() {
        let storage = MemoryStorage::new_default();
        let (records, index) = build();
        save(&storage, 5, &index).unwrap();

        assert!(load(&storage, 5, records.len() + 1, DistanceMetric::L2).is_err());
        assert!(load(&storage, 5, records.len(), DistanceMetric::Cosine).is_err());

        let name = index_file_name(5);
        let mut bytes = storage.read_bytes(&name).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        storage.write_atomic(&name, &bytes).unwrap();
        assert!(matches!(
            load(&storage, 5, records.len(), DistanceMetric::L2).unwrap_err(),
            QuiverError::Corruption(_)
        ));
    }
}
