//! Compaction of small sealed segments.
//!
//! Compaction picks sealed segments below a size threshold, copies the
//! records that still matter into one new segment, and swaps the manifest so
//! the inputs disappear and the output appears in the same generation. Queries
//! holding the previous view keep reading the inputs until they finish.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::collection::directory::RecordDirectory;
use crate::error::{QuiverError, Result};
use crate::segment::sealed::{self, SealedSegment};
use crate::segment::{SegmentStore, SegmentView};
use crate::vector::VectorRecord;

/// When and how sealed segments are merged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    /// Segments with at least this many records are left alone.
    pub max_segment_records: usize,
    /// Upper bound on segments merged in one run.
    pub merge_factor: usize,
    /// Number of small segments that triggers a merge.
    pub min_segments: usize,
    /// Share of dead records that makes a single segment worth rewriting.
    pub tombstone_ratio: f64,
    /// Let the engine's maintenance thread compact on its own.
    pub auto: bool,
    pub interval_ms: u64,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        CompactionConfig {
            max_segment_records: 8_192,
            merge_factor: 8,
            min_segments: 2,
            tombstone_ratio: 0.2,
            auto: false,
            interval_ms: 30_000,
        }
    }
}

impl CompactionConfig {
    pub fn with_max_segment_records(mut self, records: usize) -> Self {
        self.max_segment_records = records;
        self
    }

    pub fn with_merge_factor(mut self, merge_factor: usize) -> Self {
        self.merge_factor = merge_factor;
        self
    }

    pub fn with_min_segments(mut self, min_segments: usize) -> Self {
        self.min_segments = min_segments;
        self
    }

    pub fn with_tombstone_ratio(mut self, ratio: f64) -> Self {
        self.tombstone_ratio = ratio;
        self
    }

    pub fn with_auto(mut self, auto: bool) -> Self {
        self.auto = auto;
        self
    }

    pub fn with_interval_ms(mut self, interval_ms: u64) -> Self {
        self.interval_ms = interval_ms;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_segment_records == 0 {
            return Err(QuiverError::invalid_config(
                "compaction.max_segment_records must be > 0",
            ));
        }
        if self.merge_factor < 2 {
            return Err(QuiverError::invalid_config(
                "compaction.merge_factor must be >= 2",
            ));
        }
        if self.min_segments < 2 || self.min_segments > self.merge_factor {
            return Err(QuiverError::invalid_config(
                "compaction.min_segments must be between 2 and compaction.merge_factor",
            ));
        }
        if !(self.tombstone_ratio > 0.0 && self.tombstone_ratio <= 1.0) {
            return Err(QuiverError::invalid_config(
                "compaction.tombstone_ratio must be in (0, 1]",
            ));
        }
        if self.interval_ms == 0 {
            return Err(QuiverError::invalid_config(
                "compaction.interval_ms must be > 0",
            ));
        }
        Ok(())
    }
}

/// Sealed segments chosen for one compaction run, oldest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionPlan {
    pub inputs: Vec<u64>,
}

/// What a compaction run did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompactionOutcome {
    pub inputs: Vec<u64>,
    /// Id of the merged segment, or `None` when nothing survived.
    pub output: Option<u64>,
    pub records_in: usize,
    pub records_out: usize,
    /// Tombstones removed for good.
    pub dropped_tombstones: usize,
}

/// Records of `segment` that are neither live nor the current tombstone.
fn dead_ratio(segment: &SealedSegment, directory: &RecordDirectory) -> f64 {
    if segment.is_empty() {
        return 1.0;
    }
    let dead = segment
        .records()
        .iter()
        .filter(|r| !directory.is_live(r))
        .count();
    dead as f64 / segment.len() as f64
}

/// Decide whether `view` needs compacting.
///
/// Candidates are healthy sealed segments smaller than
/// `max_segment_records`. Up to `merge_factor` of them, oldest first, are
/// merged once there are `min_segments`; a lone candidate is rewritten when
/// its dead share reaches `tombstone_ratio`.
pub fn plan(
    view: &SegmentView,
    directory: &RecordDirectory,
    config: &CompactionConfig,
) -> Option<CompactionPlan> {
    let mut candidates: Vec<&Arc<SealedSegment>> = view
        .healthy_sealed()
        .filter(|s| s.len() < config.max_segment_records)
        .collect();
    candidates.sort_by_key(|s| s.id());

    if candidates.len() >= config.min_segments {
        return Some(CompactionPlan {
            inputs: candidates
                .iter()
                .take(config.merge_factor)
                .map(|s| s.id())
                .collect(),
        });
    }

    candidates
        .into_iter()
        .find(|s| dead_ratio(s, directory) >= config.tombstone_ratio)
        .map(|s| CompactionPlan {
            inputs: vec![s.id()],
        })
}

/// Merge the segments of `plan` into one.
///
/// The inputs' files are left on disk; the caller deletes them once the new
/// view is published. When `abandoned` reports true just before the swap, the
/// output is discarded and the run fails with `OperationCancelled`.
pub fn compact(
    store: &SegmentStore,
    directory: &RecordDirectory,
    plan: &CompactionPlan,
    abandoned: &dyn Fn() -> bool,
) -> Result<CompactionOutcome> {
    let view = store.view();
    let inputs: Vec<&Arc<SealedSegment>> = plan
        .inputs
        .iter()
        .map(|id| {
            view.sealed_segment(*id)
                .ok_or(QuiverError::SegmentNotFound(*id))
        })
        .collect::<Result<_>>()?;
    if let Some(bad) = inputs.iter().find(|s| !s.is_healthy()) {
        return Err(QuiverError::corruption(format!(
            "segment {} is corrupted and cannot be compacted",
            bad.id()
        )));
    }

    let input_ids: HashSet<u64> = plan.inputs.iter().copied().collect();
    let outside: Vec<&Arc<SealedSegment>> = view
        .sealed
        .iter()
        .filter(|s| !input_ids.contains(&s.id()))
        .collect();
    // A corrupted segment may hide older versions of any id.
    let keep_all_tombstones = outside.iter().any(|s| !s.is_healthy());

    let records_in: usize = inputs.iter().map(|s| s.len()).sum();
    let mut kept: Vec<Arc<VectorRecord>> = Vec::new();
    let mut dropped: Vec<(String, u64)> = Vec::new();
    // The newest sealed version of an id is kept even when a newer one is
    // still unsealed, so sealed-only queries keep seeing it.
    for segment in &inputs {
        for record in segment.records().iter() {
            let newest_sealed = view.is_newest_sealed(record);
            if directory.is_live(record) || (!record.deleted && newest_sealed) {
                kept.push(Arc::clone(record));
            } else if record.deleted && newest_sealed {
                let shadows_older = keep_all_tombstones
                    || outside
                        .iter()
                        .any(|s| s.get(&record.id).is_some_and(|older| older.seq < record.seq));
                if shadows_older {
                    kept.push(Arc::clone(record));
                } else {
                    dropped.push((record.id.clone(), record.seq));
                }
            }
        }
    }
    kept.sort_by_key(|r| r.seq);

    let config = store.config();
    let output = if kept.is_empty() {
        None
    } else {
        let id = store.allocate_segment_id()?;
        let written = sealed::write_sealed_file(store.storage().as_ref(), id, config.dimension, &kept)
            .and_then(|size| {
                let segment = SealedSegment::from_records(
                    sealed::describe(id, &kept, size),
                    kept.clone(),
                    config.metric,
                    config.index.clone(),
                    store.storage().clone(),
                );
                if config.index.eager_build {
                    segment.index()?;
                }
                Ok(segment)
            });
        match written {
            Ok(segment) => Some(segment),
            Err(err) => {
                discard_output(store, id);
                return Err(err);
            }
        }
    };
    let output_id = output.as_ref().map(|s| s.id());

    if abandoned() {
        if let Some(id) = output_id {
            discard_output(store, id);
        }
        return Err(QuiverError::cancelled("collection closed during compaction"));
    }
    if let Err(err) = store.replace_segments(&plan.inputs, output) {
        if let Some(id) = output_id {
            discard_output(store, id);
        }
        return Err(err);
    }

    for (id, seq) in &dropped {
        directory.forget_tombstone(id, *seq);
    }

    Ok(CompactionOutcome {
        inputs: plan.inputs.clone(),
        output: output_id,
        records_in,
        records_out: kept.len(),
        dropped_tombstones: dropped.len(),
    })
}

fn discard_output(store: &SegmentStore, id: u64) {
    if let Err(err) = SegmentStore::delete_segment_files(store.storage().as_ref(), id) {
        log::warn!("Could not remove unfinished compaction output {id}: {err}");
    }
}
