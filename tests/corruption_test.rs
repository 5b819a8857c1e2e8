use std::sync::Arc;

use quiver::collection::catalog::collection_prefix;
use quiver::engine::{Engine, EngineConfig, HealthStatus};
use quiver::error::{QuiverError, Result};
use quiver::query::QueryRequest;
use quiver::segment::format::{HEADER_LEN, segment_file_name};
use quiver::storage::{MemoryStorage, Storage};
use quiver::vector::codec::VectorCodec;
use quiver::vector::{DistanceMetric, VectorRecord};

fn flip_bit(storage: &MemoryStorage, name: &str, offset: usize) {
    let mut bytes = storage.read_bytes(name).unwrap();
    bytes[offset] ^= 0x10;
    storage.write_atomic(name, &bytes).unwrap();
}

#[test]
fn test_single_bit_flip_is_detected_by_codec() {
    let codec = VectorCodec::new(3);
    let record = VectorRecord::new("a", vec![0.5, -1.0, 2.0])
        .with_meta("lang", "en")
        .with_seq(7);
    let bytes = codec.encode(&record).unwrap();

    for offset in [0, bytes.len() / 2, bytes.len() - 1] {
        let mut damaged = bytes.clone();
        damaged[offset] ^= 0x01;
        assert!(
            matches!(codec.decode(&damaged), Err(QuiverError::Corruption(_))),
            "flip at {offset} went unnoticed"
        );
    }
}

#[test]
fn test_corrupted_segment_is_excluded_and_reported() -> Result<()> {
    let storage = MemoryStorage::new_default();

    let (collection_id, damaged) = {
        let engine = Engine::open(Arc::new(storage.clone()), EngineConfig::in_memory())?;
        let docs = engine.create_collection("docs", 2, DistanceMetric::L2)?;
        docs.add(VectorRecord::new("a", vec![0.0, 0.0]))?;
        let damaged = docs.seal()?;
        docs.add(VectorRecord::new("b", vec![1.0, 0.0]))?;
        docs.seal()?;
        docs.add(VectorRecord::new("c", vec![2.0, 0.0]))?;
        let id = docs.id();
        engine.stop()?;
        (id, damaged)
    };

    let name = format!(
        "{}/{}",
        collection_prefix(collection_id),
        segment_file_name(damaged)
    );
    flip_bit(&storage, &name, HEADER_LEN as usize + 6);

    let engine = Engine::open(Arc::new(storage.clone()), EngineConfig::in_memory())?;
    let docs = engine.collection("docs")?;

    // The other segments still answer, flagged as incomplete.
    let response = docs.query(&QueryRequest::new(vec![0.0, 0.0], 3))?;
    assert!(response.degraded);
    assert_eq!(response.unavailable_segments, vec![damaged]);
    assert_eq!(response.ids(), vec!["b", "c"]);

    let info = docs.info();
    assert!(!info.is_healthy());
    assert_eq!(info.corrupted_segments, vec![damaged]);

    let health = engine.health();
    assert_eq!(health.status, HealthStatus::Degraded);
    assert_eq!(health.corrupted_segments.get("docs"), Some(&vec![damaged]));

    // Writes keep working.
    docs.add(VectorRecord::new("d", vec![3.0, 0.0]))?;
    assert!(docs.get("d")?.is_some());
    engine.stop()
}

#[test]
fn test_compaction_leaves_corrupted_segment_alone() -> Result<()> {
    let storage = MemoryStorage::new_default();
    let (collection_id, damaged) = {
        let engine = Engine::open(Arc::new(storage.clone()), EngineConfig::in_memory())?;
        let docs = engine.create_collection("docs", 2, DistanceMetric::L2)?;
        docs.add(VectorRecord::new("a", vec![0.0, 0.0]))?;
        let damaged = docs.seal()?;
        for i in 1..4 {
            docs.add(VectorRecord::new(format!("r{i}"), vec![i as f32, 0.0]))?;
            docs.seal()?;
        }
        let id = docs.id();
        engine.stop()?;
        (id, damaged)
    };
    let name = format!(
        "{}/{}",
        collection_prefix(collection_id),
        segment_file_name(damaged)
    );
    flip_bit(&storage, &name, HEADER_LEN as usize + 6);

    let engine = Engine::open(Arc::new(storage.clone()), EngineConfig::in_memory())?;
    let docs = engine.collection("docs")?;
    let outcome = docs.compact()?.expect("healthy segments should merge");
    assert!(!outcome.inputs.contains(&damaged));
    assert_eq!(outcome.records_out, 3);

    // The damaged file is still there for inspection.
    assert!(storage.file_exists(&name));
    assert_eq!(docs.info().corrupted_segments, vec![damaged]);
    assert_eq!(docs.count()?, 3);
    engine.stop()
}
