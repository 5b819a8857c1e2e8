//! The segment store of one collection.
//!
//! Owns the manifest, the sealed segments, the active segment and its backing
//! file. The set of segments readers see is published as an immutable
//! [`SegmentView`] behind an `Arc`; seal and compaction build a new view and
//! swap it in, so a query that grabbed the old view keeps a consistent picture
//! until it finishes.

use std::collections::HashSet;
use std::io::Write;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use uuid::Uuid;

use crate::collection::config::CollectionConfig;
use crate::error::{QuiverError, Result};
use crate::segment::active::ActiveSegment;
use crate::segment::format::{
    self, FileKind, HEADER_LEN, SegmentFooter, SegmentHeader, classify_file, index_file_name,
    segment_file_name,
};
use crate::segment::manifest::{ActiveState, Manifest, ManifestStore};
use crate::segment::sealed::{self, SealedSegment, SegmentHealth};
use crate::storage::{Storage, StorageOutput};
use crate::vector::codec::{VectorCodec, encode_record};
use crate::vector::{DistanceMetric, VectorRecord};

/// Immutable picture of a collection's segments.
#[derive(Debug)]
pub struct SegmentView {
    /// Manifest generation the view was published with.
    pub generation: u64,
    pub sealed: Vec<Arc<SealedSegment>>,
    pub active: Arc<ActiveSegment>,
}

impl SegmentView {
    pub fn healthy_sealed(&self) -> impl Iterator<Item = &Arc<SealedSegment>> {
        self.sealed.iter().filter(|s| s.is_healthy())
    }

    pub fn corrupted_ids(&self) -> Vec<u64> {
        self.sealed
            .iter()
            .filter(|s| !s.is_healthy())
            .map(|s| s.id())
            .collect()
    }

    pub fn sealed_segment(&self, id: u64) -> Option<&Arc<SealedSegment>> {
        self.sealed.iter().find(|s| s.id() == id)
    }

    /// Whether no healthy sealed segment holds a newer version of `record`'s id.
    pub fn is_newest_sealed(&self, record: &VectorRecord) -> bool {
        self.healthy_sealed().all(|segment| {
            segment
                .get(&record.id)
                .is_none_or(|stored| stored.seq <= record.seq)
        })
    }
}

/// Outcome of opening an existing store.
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    pub sealed_segments: usize,
    pub corrupted_segments: Vec<u64>,
    pub orphans_removed: usize,
    pub active_records: usize,
    pub discarded_bytes: u64,
}

/// Lazy, restartable iteration over one segment's records.
///
/// Yields `(position, record)`; a scan interrupted at position `p` resumes
/// with [`SegmentStore::scan`] from `p`.
#[derive(Debug, Clone)]
pub struct SegmentScan {
    segment_id: u64,
    records: Arc<Vec<Arc<VectorRecord>>>,
    position: usize,
}

impl SegmentScan {
    pub fn segment_id(&self) -> u64 {
        self.segment_id
    }

    /// Position of the next record to be yielded.
    pub fn position(&self) -> usize {
        self.position
    }
}

impl Iterator for SegmentScan {
    type Item = (usize, Arc<VectorRecord>);

    fn next(&mut self) -> Option<Self::Item> {
        let record = self.records.get(self.position)?;
        let item = (self.position, Arc::clone(record));
        self.position += 1;
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.records.len().saturating_sub(self.position);
        (remaining, Some(remaining))
    }
}

/// Handle on the active segment's backing file.
#[derive(Debug)]
struct ActiveWriter {
    segment_id: u64,
    output: Option<Box<dyn StorageOutput>>,
    flushed_bytes: u64,
}

#[derive(Debug)]
pub struct SegmentStore {
    config: CollectionConfig,
    codec: VectorCodec,
    storage: Arc<dyn Storage>,
    manifest: ManifestStore,
    view: RwLock<Arc<SegmentView>>,
    writer: Mutex<ActiveWriter>,
}

impl SegmentStore {
    /// Create the files of a new, empty collection.
    pub fn create(
        storage: Arc<dyn Storage>,
        collection_id: Uuid,
        config: CollectionConfig,
    ) -> Result<Self> {
        config.validate()?;
        let manifest = Manifest::new(collection_id, config.clone());
        let active_id = manifest.active.id;

        write_active_header(storage.as_ref(), active_id, config.dimension)?;
        let manifest = ManifestStore::create(storage.clone(), manifest)?;
        let generation = manifest.generation();

        Ok(SegmentStore {
            codec: VectorCodec::new(config.dimension),
            view: RwLock::new(Arc::new(SegmentView {
                generation,
                sealed: Vec::new(),
                active: Arc::new(ActiveSegment::new(active_id, config.dimension)),
            })),
            writer: Mutex::new(ActiveWriter {
                segment_id: active_id,
                output: None,
                flushed_bytes: HEADER_LEN,
            }),
            config,
            storage,
            manifest,
        })
    }

    /// Open an existing store, repairing what an unclean shutdown left behind.
    ///
    /// Returns `Ok(None)` when `storage` holds no manifest. Records that were
    /// logged but not flushed are not restored here; the commit pipeline
    /// replays them from the write-ahead log.
    pub fn open(storage: Arc<dyn Storage>) -> Result<Option<(Self, RecoveryReport)>> {
        let Some(manifest) = ManifestStore::open(storage.clone())? else {
            return Ok(None);
        };
        let current = manifest.current();
        let config = current.config.clone();
        let codec = VectorCodec::new(config.dimension);
        let mut report = RecoveryReport::default();

        let sealed: Vec<Arc<SealedSegment>> = current
            .sealed
            .iter()
            .map(|descriptor| {
                Arc::new(SealedSegment::load(
                    storage.clone(),
                    descriptor.clone(),
                    codec,
                    config.metric,
                    config.index.clone(),
                ))
            })
            .collect();
        report.sealed_segments = sealed.len();
        report.corrupted_segments = sealed
            .iter()
            .filter(|s| !s.is_healthy())
            .map(|s| s.id())
            .collect();

        if config.index.eager_build {
            sealed.par_iter().filter(|s| s.is_healthy()).for_each(|segment| {
                if let Err(err) = segment.index() {
                    log::warn!("Index of segment {} unavailable: {err}", segment.id());
                }
            });
        }

        report.orphans_removed = remove_orphans(storage.as_ref(), &current)?;

        let (active, discarded) = recover_active(storage.as_ref(), &manifest, codec)?;
        report.active_records = active.len();
        report.discarded_bytes = discarded;

        let current = manifest.current();
        let store = SegmentStore {
            codec,
            view: RwLock::new(Arc::new(SegmentView {
                generation: current.generation,
                sealed,
                active: Arc::new(active),
            })),
            writer: Mutex::new(ActiveWriter {
                segment_id: current.active.id,
                output: None,
                flushed_bytes: current.active.flushed_bytes,
            }),
            config,
            storage,
            manifest,
        };
        Ok(Some((store, report)))
    }

    pub fn config(&self) -> &CollectionConfig {
        &self.config
    }

    pub fn dimension(&self) -> usize {
        self.config.dimension
    }

    pub fn metric(&self) -> DistanceMetric {
        self.config.metric
    }

    pub fn codec(&self) -> VectorCodec {
        self.codec
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn manifest(&self) -> Manifest {
        self.manifest.current()
    }

    /// Current published view.
    pub fn view(&self) -> Arc<SegmentView> {
        Arc::clone(&self.view.read())
    }

    pub fn active(&self) -> Arc<ActiveSegment> {
        Arc::clone(&self.view.read().active)
    }

    /// Add a record to the active segment's buffer.
    ///
    /// Writers are serialised by the commit pipeline; this only validates the
    /// record's shape.
    pub fn append_to_active(&self, record: Arc<VectorRecord>) -> Result<()> {
        if !record.deleted && record.embedding.len() != self.config.dimension {
            return Err(QuiverError::dimension_mismatch(
                self.config.dimension,
                record.embedding.len(),
            ));
        }
        self.active().push(record);
        Ok(())
    }

    /// Persist buffered records to the active segment file and advance the
    /// manifest. Returns the number of records flushed.
    pub fn flush(&self) -> Result<usize> {
        let mut writer = self.writer.lock();
        self.flush_locked(&mut writer)
    }

    fn flush_locked(&self, writer: &mut ActiveWriter) -> Result<usize> {
        let active = self.active();
        if writer.segment_id != active.id() {
            return Err(QuiverError::internal(format!(
                "writer is on segment {}, active segment is {}",
                writer.segment_id,
                active.id()
            )));
        }

        let flushed = active.flushed_count();
        let pending = active.records_from(flushed);
        if pending.is_empty() {
            return Ok(0);
        }

        let mut frames = Vec::new();
        for record in &pending {
            format::put_frame(&mut frames, &encode_record(record));
        }
        let last_seq = pending.iter().map(|r| r.seq).max().unwrap_or(0);

        if let Err(err) = self.write_frames(writer, &frames) {
            self.reset_writer(writer);
            return Err(err);
        }
        let flushed_bytes = writer.flushed_bytes + frames.len() as u64;

        let total = flushed + pending.len();
        let update = self.manifest.update(|m| {
            m.active.flushed_records = total as u64;
            m.active.flushed_bytes = flushed_bytes;
            m.active.flushed_seq = m.active.flushed_seq.max(last_seq);
            Ok(())
        });
        if let Err(err) = update {
            self.reset_writer(writer);
            return Err(err);
        }

        writer.flushed_bytes = flushed_bytes;
        active.mark_flushed(total);
        log::debug!(
            "Flushed {} records to segment {} of {}",
            pending.len(),
            active.id(),
            self.config.name
        );
        Ok(pending.len())
    }

    fn write_frames(&self, writer: &mut ActiveWriter, frames: &[u8]) -> Result<()> {
        let output = self.ensure_output(writer)?;
        output.write_all(frames)?;
        output.flush_and_sync()
    }

    fn ensure_output<'a>(
        &self,
        writer: &'a mut ActiveWriter,
    ) -> Result<&'a mut Box<dyn StorageOutput>> {
        if writer.output.is_none() {
            let name = segment_file_name(writer.segment_id);
            let size = if self.storage.file_exists(&name) {
                self.storage.file_size(&name)?
            } else {
                0
            };
            if size < HEADER_LEN {
                write_active_header(self.storage.as_ref(), writer.segment_id, self.dimension())?;
            } else if size > writer.flushed_bytes {
                self.storage.truncate_file(&name, writer.flushed_bytes)?;
            }
            writer.output = Some(self.storage.create_output_append(&name)?);
        }
        writer
            .output
            .as_mut()
            .ok_or_else(|| QuiverError::internal("active segment output missing"))
    }

    /// Drop the file handle and cut the file back to its confirmed length.
    fn reset_writer(&self, writer: &mut ActiveWriter) {
        writer.output = None;
        let name = segment_file_name(writer.segment_id);
        if let Err(err) = self.storage.truncate_file(&name, writer.flushed_bytes) {
            log::warn!("Could not truncate {name} after a failed flush: {err}");
        }
    }

    /// The id `seal` would return without doing anything: the last sealed
    /// segment, when nothing has been written since.
    pub fn idempotent_seal_id(&self) -> Option<u64> {
        if self.active().is_empty() {
            self.manifest.current().last_sealed_segment_id
        } else {
            None
        }
    }

    /// Close the active segment, start a new one, and return the sealed id.
    ///
    /// `seal_seq` is the sequence number of the write-ahead log marker that
    /// announced the seal; every record logged before it is in the segment.
    pub fn seal(&self, seal_seq: u64) -> Result<u64> {
        let mut writer = self.writer.lock();
        if let Some(id) = self.idempotent_seal_id() {
            return Ok(id);
        }

        self.flush_locked(&mut writer)?;

        let active = self.active();
        let segment_id = active.id();
        let records = active.records_from(0);

        let name = segment_file_name(segment_id);
        let bytes = self.storage.read_bytes(&name)?;
        if (bytes.len() as u64) < writer.flushed_bytes {
            return Err(QuiverError::corruption(format!(
                "active segment {segment_id} is shorter than its flushed length"
            )));
        }
        let frame_bytes = &bytes[HEADER_LEN as usize..writer.flushed_bytes as usize];
        let footer = SegmentFooter {
            record_count: records.len() as u64,
            frames_crc: crc32fast::hash(frame_bytes),
        };

        let write_footer = (|| -> Result<()> {
            let output = self.ensure_output(&mut writer)?;
            output.write_all(&footer.encode())?;
            output.flush_and_sync()?;
            output.close()
        })();
        if let Err(err) = write_footer {
            self.reset_writer(&mut writer);
            return Err(err);
        }
        writer.output = None;
        let size_bytes = writer.flushed_bytes + format::FOOTER_LEN;

        let descriptor = sealed::describe(segment_id, &records, size_bytes);
        let segment = SealedSegment::from_records(
            descriptor.clone(),
            records,
            self.config.metric,
            self.config.index.clone(),
            self.storage.clone(),
        );
        if self.config.index.eager_build {
            if let Err(err) = segment.index() {
                log::warn!("Index of segment {segment_id} will be built on demand: {err}");
            }
        }

        let (manifest, new_active_id) = self.manifest.update(|m| {
            m.sealed.push(descriptor);
            m.last_sealed_segment_id = Some(segment_id);
            let new_id = m.allocate_segment_id();
            let flushed_seq = m.active.flushed_seq.max(seal_seq);
            m.active = ActiveState::fresh(new_id, flushed_seq);
            Ok(new_id)
        })?;

        writer.segment_id = new_active_id;
        writer.flushed_bytes = HEADER_LEN;
        if let Err(err) = self.ensure_output(&mut writer) {
            log::warn!("Active segment {new_active_id} file not created yet: {err}");
            writer.output = None;
        }

        {
            let mut view = self.view.write();
            let mut sealed = view.sealed.clone();
            sealed.push(Arc::new(segment));
            *view = Arc::new(SegmentView {
                generation: manifest.generation,
                sealed,
                active: Arc::new(ActiveSegment::new(new_active_id, self.dimension())),
            });
        }

        log::info!(
            "Sealed segment {segment_id} of {} ({} records); active segment is now {new_active_id}",
            self.config.name,
            footer.record_count
        );
        Ok(segment_id)
    }

    /// Read the newest version of `record_id` stored in one segment.
    pub fn read(&self, segment_id: u64, record_id: &str) -> Result<Option<Arc<VectorRecord>>> {
        let view = self.view();
        if view.active.id() == segment_id {
            let snapshot = view.active.snapshot();
            return Ok(snapshot
                .records
                .iter()
                .rev()
                .find(|r| r.id == record_id)
                .cloned());
        }

        let segment = view
            .sealed_segment(segment_id)
            .ok_or(QuiverError::SegmentNotFound(segment_id))?;
        if let SegmentHealth::Corrupted(reason) = segment.health() {
            return Err(QuiverError::corruption(format!(
                "segment {segment_id}: {reason}"
            )));
        }
        Ok(segment.get(record_id).cloned())
    }

    /// Iterate over a segment's records starting at `from`.
    pub fn scan(&self, segment_id: u64, from: usize) -> Result<SegmentScan> {
        let view = self.view();
        let records = if view.active.id() == segment_id {
            view.active.snapshot().records
        } else {
            let segment = view
                .sealed_segment(segment_id)
                .ok_or(QuiverError::SegmentNotFound(segment_id))?;
            if !segment.is_healthy() {
                return Err(QuiverError::corruption(format!(
                    "segment {segment_id} is corrupted"
                )));
            }
            Arc::clone(segment.records())
        };

        Ok(SegmentScan {
            segment_id,
            records,
            position: from,
        })
    }

    /// Reserve a fresh segment id.
    pub fn allocate_segment_id(&self) -> Result<u64> {
        let (_, id) = self.manifest.update(|m| Ok(m.allocate_segment_id()))?;
        Ok(id)
    }

    /// Atomically replace sealed segments `inputs` with `output`.
    ///
    /// Fails without changes if any input is no longer part of the manifest.
    pub fn replace_segments(&self, inputs: &[u64], output: Option<SealedSegment>) -> Result<()> {
        let _writer = self.writer.lock();
        let removed: HashSet<u64> = inputs.iter().copied().collect();

        let descriptor = output.as_ref().map(|s| s.descriptor().clone());
        let (manifest, _) = self.manifest.update(|m| {
            for id in inputs {
                if m.sealed_descriptor(*id).is_none() {
                    return Err(QuiverError::SegmentNotFound(*id));
                }
            }
            m.sealed.retain(|s| !removed.contains(&s.id));
            if let Some(descriptor) = descriptor {
                m.sealed.push(descriptor);
            }
            Ok(())
        })?;

        let mut view = self.view.write();
        let mut sealed: Vec<Arc<SealedSegment>> = view
            .sealed
            .iter()
            .filter(|s| !removed.contains(&s.id()))
            .cloned()
            .collect();
        if let Some(output) = output {
            sealed.push(Arc::new(output));
        }
        *view = Arc::new(SegmentView {
            generation: manifest.generation,
            sealed,
            active: Arc::clone(&view.active),
        });
        Ok(())
    }

    /// Delete a segment's data and index files.
    pub fn delete_segment_files(storage: &dyn Storage, segment_id: u64) -> Result<()> {
        storage.delete_file(&segment_file_name(segment_id))?;
        storage.delete_file(&index_file_name(segment_id))
    }

    /// Release the active segment file handle.
    pub fn close(&self) {
        self.writer.lock().output = None;
    }
}

fn write_active_header(storage: &dyn Storage, segment_id: u64, dimension: usize) -> Result<()> {
    let header = SegmentHeader {
        segment_id,
        dimension: dimension as u32,
    };
    let mut output = storage.create_output(&segment_file_name(segment_id))?;
    output.write_all(&header.encode())?;
    output.flush_and_sync()?;
    output.close()
}

/// Delete segment and index files the manifest does not reference, and
/// leftover temporary files.
fn remove_orphans(storage: &dyn Storage, manifest: &Manifest) -> Result<usize> {
    let referenced: HashSet<u64> = manifest.referenced_segments().into_iter().collect();
    let mut removed = 0;

    for name in storage.list_files()? {
        let orphan = match classify_file(&name) {
            Some(FileKind::Segment(id)) | Some(FileKind::Index(id)) => !referenced.contains(&id),
            Some(_) => false,
            None => name.ends_with(".tmp"),
        };
        if orphan {
            log::info!("Removing unreferenced file {name}");
            storage.delete_file(&name)?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Load the flushed prefix of the active segment file.
///
/// Bytes past the manifest's flushed offset were never confirmed and are cut
/// away. A damaged prefix is salvaged up to the first bad frame and the
/// manifest is rewritten to match.
fn recover_active(
    storage: &dyn Storage,
    manifest: &ManifestStore,
    codec: VectorCodec,
) -> Result<(ActiveSegment, u64)> {
    let state = manifest.current().active;
    let name = segment_file_name(state.id);
    let dimension = codec.dimension();

    if !storage.file_exists(&name) {
        if state.flushed_records > 0 {
            log::error!(
                "Active segment file {name} is missing; {} flushed records are lost",
                state.flushed_records
            );
        }
        write_active_header(storage, state.id, dimension)?;
        if state.flushed_bytes != HEADER_LEN {
            let fresh = ActiveState::fresh(state.id, state.flushed_seq);
            manifest.update(|m| {
                m.active = fresh;
                Ok(())
            })?;
        }
        return Ok((ActiveSegment::new(state.id, dimension), 0));
    }

    let bytes = storage.read_bytes(&name)?;
    let size = bytes.len() as u64;
    let mut discarded = 0;
    if size > state.flushed_bytes {
        discarded = size - state.flushed_bytes;
        log::info!("Discarding {discarded} unconfirmed bytes from {name}");
        storage.truncate_file(&name, state.flushed_bytes)?;
    }

    let confirmed = &bytes[..size.min(state.flushed_bytes) as usize];
    let (records, valid_bytes, problem) = decode_active_prefix(confirmed, state.id, codec);

    if let Some(problem) = problem {
        log::error!(
            "Active segment {} is damaged ({problem}); keeping {} of {} records",
            state.id,
            records.len(),
            state.flushed_records
        );
        if valid_bytes < HEADER_LEN {
            write_active_header(storage, state.id, dimension)?;
        } else {
            storage.truncate_file(&name, valid_bytes)?;
        }
        let flushed_records = records.len() as u64;
        let flushed_bytes = valid_bytes.max(HEADER_LEN);
        manifest.update(|m| {
            m.active.flushed_records = flushed_records;
            m.active.flushed_bytes = flushed_bytes;
            Ok(())
        })?;
    }

    Ok((ActiveSegment::with_flushed(state.id, dimension, records), discarded))
}

/// Decode frames until the first problem. Returns the records, the length of
/// the valid prefix, and the problem if any.
fn decode_active_prefix(
    bytes: &[u8],
    segment_id: u64,
    codec: VectorCodec,
) -> (Vec<Arc<VectorRecord>>, u64, Option<String>) {
    let header = match SegmentHeader::decode(bytes) {
        Ok(header) => header,
        Err(err) => return (Vec::new(), 0, Some(err.to_string())),
    };
    if header.segment_id != segment_id || header.dimension as usize != codec.dimension() {
        return (Vec::new(), 0, Some("header does not match manifest".into()));
    }

    let mut records = Vec::new();
    let mut pos = HEADER_LEN as usize;
    // One frame at a time, so a bad frame keeps the good prefix.
    while pos < bytes.len() {
        let Some(len) = bytes
            .get(pos..pos + 4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize)
        else {
            return (records, pos as u64, Some("truncated frame prefix".into()));
        };
        let start = pos + 4;
        let Some(payload) = bytes.get(start..start + len) else {
            return (records, pos as u64, Some("truncated frame".into()));
        };
        match codec.decode(payload) {
            Ok(record) => records.push(Arc::new(record)),
            Err(err) => return (records, pos as u64, Some(err.to_string())),
        }
        pos = start + len;
    }
    (records, pos as u64, None)
}
