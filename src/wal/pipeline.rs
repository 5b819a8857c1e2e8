//! The commit pipeline: the single path every write of a collection takes.
//!
//! ```text
//! Received ──validate──▶ Logged ──WAL append──▶ Buffered ──flush──▶ Flushed
//! ```
//!
//! Writers are serialised by one mutex held from validation to buffering.
//! Readers never take it; they read the active segment through snapshots.
//! Flushing runs outside the writer mutex so appends only wait for the WAL.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::collection::directory::RecordDirectory;
use crate::error::{QuiverError, Result};
use crate::segment::SegmentStore;
use crate::wal::file::{self as wal_file, SeqNumber, WalEntry, WalManager, WalRecord};
use crate::vector::VectorRecord;

/// What a writer does when too many records wait to be flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Wait up to `timeout_ms` for a flush to make room, then fail.
    Block { timeout_ms: u64 },
    /// Fail immediately.
    Reject,
}

impl Default for BackpressurePolicy {
    fn default() -> Self {
        BackpressurePolicy::Block { timeout_ms: 5_000 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommitConfig {
    /// Flush once this many records are buffered.
    pub flush_max_records: usize,
    /// Flush buffered records older than this.
    pub flush_interval_ms: u64,
    /// Seal the active segment once it holds this many records.
    pub segment_max_records: usize,
    /// Buffered records beyond which writers are pushed back.
    pub max_pending_records: usize,
    pub backpressure: BackpressurePolicy,
    /// Sync the log on every append.
    pub sync_wal: bool,
}

impl Default for CommitConfig {
    fn default() -> Self {
        CommitConfig {
            flush_max_records: 1024,
            flush_interval_ms: 1000,
            segment_max_records: 65_536,
            max_pending_records: 16_384,
            backpressure: BackpressurePolicy::default(),
            sync_wal: true,
        }
    }
}

impl CommitConfig {
    pub fn with_flush_max_records(mut self, records: usize) -> Self {
        self.flush_max_records = records;
        self
    }

    pub fn with_flush_interval_ms(mut self, interval_ms: u64) -> Self {
        self.flush_interval_ms = interval_ms;
        self
    }

    pub fn with_segment_max_records(mut self, records: usize) -> Self {
        self.segment_max_records = records;
        self
    }

    pub fn with_max_pending_records(mut self, records: usize) -> Self {
        self.max_pending_records = records;
        self
    }

    pub fn with_backpressure(mut self, policy: BackpressurePolicy) -> Self {
        self.backpressure = policy;
        self
    }

    pub fn with_sync_wal(mut self, sync_wal: bool) -> Self {
        self.sync_wal = sync_wal;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.flush_max_records == 0 {
            return Err(QuiverError::invalid_config(
                "commit.flush_max_records must be at least 1",
            ));
        }
        if self.segment_max_records == 0 {
            return Err(QuiverError::invalid_config(
                "commit.segment_max_records must be at least 1",
            ));
        }
        if self.max_pending_records < self.flush_max_records {
            return Err(QuiverError::invalid_config(
                "commit.max_pending_records must be at least commit.flush_max_records",
            ));
        }
        Ok(())
    }
}

/// Where a write is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteState {
    Received,
    Logged,
    Buffered,
    Flushed,
}

/// How a write treats ids that are already live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Reject live ids with `AlreadyExists`.
    Insert,
    /// Replace live ids.
    Upsert,
}

/// Acknowledgement of an accepted write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteReceipt {
    pub first_seq: SeqNumber,
    pub last_seq: SeqNumber,
    pub records: usize,
    pub state: WriteState,
}

/// Counts from replaying the log at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub replayed: usize,
    pub skipped: usize,
    pub seals_completed: usize,
    pub logs_read: usize,
}

#[derive(Debug)]
struct WriterState {
    wal: WalManager,
    next_seq: SeqNumber,
}

#[derive(Debug)]
pub struct CommitPipeline {
    name: String,
    store: Arc<SegmentStore>,
    directory: Arc<RecordDirectory>,
    config: CommitConfig,
    writer: Mutex<WriterState>,
    /// Signalled whenever a flush or seal frees buffer space.
    space: Condvar,
    space_lock: Mutex<()>,
    last_flush: Mutex<Instant>,
    closed: AtomicBool,
}

impl CommitPipeline {
    /// Start the pipeline of a newly created collection.
    pub fn create(
        store: Arc<SegmentStore>,
        directory: Arc<RecordDirectory>,
        config: CommitConfig,
    ) -> Result<Self> {
        let active_id = store.active().id();
        let wal = WalManager::create(store.storage().clone(), active_id, config.sync_wal)?;
        Ok(Self::with_state(
            store,
            directory,
            config,
            WriterState { wal, next_seq: 1 },
        ))
    }

    /// Start the pipeline of a reopened collection, replaying logged writes
    /// the segment files do not hold yet.
    ///
    /// Every log of a segment up to the active one is replayed in ascending
    /// order; entries at or below the manifest's flushed sequence number are
    /// already durable and skipped. A seal marker for the active segment
    /// completes that seal with every record logged before it. Replayed
    /// records are flushed and the old logs deleted before writes resume.
    pub fn recover(
        store: Arc<SegmentStore>,
        directory_source: impl FnOnce(&SegmentStore) -> Arc<RecordDirectory>,
        config: CommitConfig,
    ) -> Result<(Self, ReplayReport)> {
        let storage = store.storage().clone();
        let codec = store.codec();
        let flushed_seq = store.manifest().active.flushed_seq;
        let mut report = ReplayReport::default();
        let mut max_seq = flushed_seq;

        for log_id in wal_file::list_logs(storage.as_ref())? {
            let active_id = store.active().id();
            if log_id > active_id {
                log::warn!("Removing log of unknown segment {log_id}");
                wal_file::delete_log(storage.as_ref(), log_id)?;
                continue;
            }

            let contents = wal_file::read_log(storage.as_ref(), log_id, codec)?;
            if contents.is_torn() {
                log::warn!(
                    "Discarding {} bytes after the last intact entry of log {log_id} of {}",
                    contents.file_len - contents.valid_len,
                    store.config().name
                );
            }
            report.logs_read += 1;
            for record in contents.records {
                max_seq = max_seq.max(record.seq);
                if record.seq <= flushed_seq {
                    report.skipped += 1;
                    continue;
                }
                match record.entry {
                    WalEntry::Put(put) => {
                        store.append_to_active(Arc::new(put))?;
                        report.replayed += 1;
                    }
                    WalEntry::SealBegin { segment_id } if segment_id == store.active().id() => {
                        store.seal(record.seq)?;
                        report.seals_completed += 1;
                    }
                    WalEntry::SealBegin { .. } => report.skipped += 1,
                }
            }
        }

        store.flush()?;
        for log_id in wal_file::list_logs(storage.as_ref())? {
            wal_file::delete_log(storage.as_ref(), log_id)?;
        }
        if report.replayed > 0 || report.seals_completed > 0 {
            log::info!(
                "Replayed {} logged writes ({} seals completed) for {}",
                report.replayed,
                report.seals_completed,
                store.config().name
            );
        }

        let sealed_max = store
            .manifest()
            .sealed
            .iter()
            .map(|s| s.max_seq)
            .max()
            .unwrap_or(0);
        let next_seq = max_seq.max(sealed_max).max(store.manifest().active.flushed_seq) + 1;

        let directory = directory_source(&store);
        let wal = WalManager::create(storage, store.active().id(), config.sync_wal)?;
        let pipeline = Self::with_state(store, directory, config, WriterState { wal, next_seq });
        Ok((pipeline, report))
    }

    fn with_state(
        store: Arc<SegmentStore>,
        directory: Arc<RecordDirectory>,
        config: CommitConfig,
        state: WriterState,
    ) -> Self {
        CommitPipeline {
            name: store.config().name.clone(),
            store,
            directory,
            config,
            writer: Mutex::new(state),
            space: Condvar::new(),
            space_lock: Mutex::new(()),
            last_flush: Mutex::new(Instant::now()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &CommitConfig {
        &self.config
    }

    pub fn directory(&self) -> &Arc<RecordDirectory> {
        &self.directory
    }

    /// Records buffered but not yet flushed.
    pub fn pending(&self) -> usize {
        self.store.active().pending_count()
    }

    /// Sequence number the next write will receive.
    pub fn next_seq(&self) -> SeqNumber {
        self.writer.lock().next_seq
    }

    /// Progress of the write that received `seq`.
    pub fn state_of(&self, seq: SeqNumber) -> WriteState {
        if seq <= self.store.manifest().active.flushed_seq {
            WriteState::Flushed
        } else if seq < self.next_seq() {
            WriteState::Buffered
        } else {
            WriteState::Received
        }
    }

    /// Log and buffer `records` as one unit.
    ///
    /// Every record is validated before anything is logged; one bad record
    /// rejects the whole batch. The receipt is returned once the batch is in
    /// the log and visible to reads.
    pub fn write(&self, records: Vec<VectorRecord>, mode: WriteMode) -> Result<WriteReceipt> {
        if records.is_empty() {
            return Err(QuiverError::invalid_argument("no records to write"));
        }
        self.ensure_open()?;
        self.wait_for_capacity(records.len())?;

        let receipt = {
            let mut state = self.writer.lock();
            self.ensure_open()?;
            self.validate(&records, mode)?;
            self.log_and_buffer(&mut state, records)?
        };

        Ok(self.after_write(receipt))
    }

    /// Write a tombstone for `id`. Returns whether `id` was live.
    pub fn delete(&self, id: &str) -> Result<bool> {
        self.ensure_open()?;
        self.wait_for_capacity(1)?;

        let receipt = {
            let mut state = self.writer.lock();
            self.ensure_open()?;
            if !self.directory.contains_live(id) {
                return Ok(false);
            }
            self.log_and_buffer(&mut state, vec![VectorRecord::tombstone(id)])?
        };

        self.after_write(receipt);
        Ok(true)
    }

    fn validate(&self, records: &[VectorRecord], mode: WriteMode) -> Result<()> {
        let dimension = self.store.dimension();
        let mut seen = HashSet::with_capacity(records.len());

        for record in records {
            if record.id.is_empty() {
                return Err(QuiverError::invalid_argument("record id must not be empty"));
            }
            if !seen.insert(record.id.as_str()) {
                return Err(QuiverError::invalid_argument(format!(
                    "id {} appears more than once in the batch",
                    record.id
                )));
            }
            if record.deleted {
                continue;
            }
            if record.embedding.len() != dimension {
                return Err(QuiverError::dimension_mismatch(
                    dimension,
                    record.embedding.len(),
                ));
            }
            if record.embedding.iter().any(|v| !v.is_finite()) {
                return Err(QuiverError::invalid_argument(format!(
                    "embedding of {} contains a non-finite value",
                    record.id
                )));
            }
            if mode == WriteMode::Insert && self.directory.contains_live(&record.id) {
                return Err(QuiverError::already_exists(format!(
                    "record {} already exists in {}",
                    record.id, self.name
                )));
            }
        }
        Ok(())
    }

    fn log_and_buffer(
        &self,
        state: &mut WriterState,
        records: Vec<VectorRecord>,
    ) -> Result<WriteReceipt> {
        self.follow_active_segment(state)?;

        let first_seq = state.next_seq;
        let records: Vec<VectorRecord> = records
            .into_iter()
            .enumerate()
            .map(|(offset, record)| record.with_seq(first_seq + offset as u64))
            .collect();
        let last_seq = first_seq + records.len() as u64 - 1;

        let frames: Vec<WalRecord> = records.iter().cloned().map(WalRecord::put).collect();
        state.wal.append_batch(&frames)?;
        state.next_seq = last_seq + 1;

        let count = records.len();
        // Buffer before publishing in the directory, so an id the directory
        // points at is always found in the current view.
        for record in records {
            let record = Arc::new(record);
            self.store.append_to_active(Arc::clone(&record))?;
            self.directory.apply(&record);
        }

        Ok(WriteReceipt {
            first_seq,
            last_seq,
            records: count,
            state: WriteState::Buffered,
        })
    }

    /// Point the log at the active segment if a seal moved it.
    fn follow_active_segment(&self, state: &mut WriterState) -> Result<()> {
        let active_id = self.store.active().id();
        if state.wal.segment_id() != active_id {
            state.wal.rotate(active_id)?;
        }
        Ok(())
    }

    fn after_write(&self, mut receipt: WriteReceipt) -> WriteReceipt {
        let active = self.store.active();
        if active.len() >= self.config.segment_max_records {
            if let Err(err) = self.seal() {
                log::warn!("Automatic seal of {} failed: {err}", self.name);
            } else {
                receipt.state = WriteState::Flushed;
            }
        } else if active.pending_count() >= self.config.flush_max_records {
            match self.flush() {
                Ok(_) => receipt.state = self.state_of(receipt.last_seq),
                Err(err) => log::warn!("Flush of {} failed, writes stay logged: {err}", self.name),
            }
        }
        receipt
    }

    fn wait_for_capacity(&self, incoming: usize) -> Result<()> {
        let limit = self.config.max_pending_records;
        let has_room = |pending: usize| pending == 0 || pending + incoming <= limit;

        if has_room(self.pending()) {
            return Ok(());
        }
        if let Err(err) = self.flush() {
            log::warn!("Flush of {} under backpressure failed: {err}", self.name);
        }
        if has_room(self.pending()) {
            return Ok(());
        }

        let timeout_ms = match self.config.backpressure {
            BackpressurePolicy::Reject => {
                log::warn!("Rejecting write to {}: {} records pending", self.name, self.pending());
                return Err(QuiverError::overloaded(format!(
                    "{} records are waiting to be flushed in {}",
                    self.pending(),
                    self.name
                )));
            }
            BackpressurePolicy::Block { timeout_ms } => timeout_ms,
        };

        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let mut guard = self.space_lock.lock();
        while !has_room(self.pending()) {
            if self.space.wait_until(&mut guard, deadline).timed_out() {
                if has_room(self.pending()) {
                    break;
                }
                log::warn!("Write to {} timed out waiting for buffer space", self.name);
                return Err(QuiverError::overloaded(format!(
                    "timed out after {timeout_ms} ms waiting for buffer space in {}",
                    self.name
                )));
            }
        }
        Ok(())
    }

    /// Persist buffered records. Returns how many were flushed.
    pub fn flush(&self) -> Result<usize> {
        let flushed = self.store.flush()?;
        *self.last_flush.lock() = Instant::now();
        if flushed > 0 {
            self.notify_space();
        }
        Ok(flushed)
    }

    /// Flush if buffered records have waited longer than the flush interval.
    pub fn flush_if_due(&self) -> Result<usize> {
        let due = self.last_flush.lock().elapsed()
            >= Duration::from_millis(self.config.flush_interval_ms);
        if due && self.pending() > 0 {
            self.flush()
        } else {
            Ok(0)
        }
    }

    /// Seal the active segment and return the sealed segment's id.
    ///
    /// Sealing again without intervening writes returns the same id.
    pub fn seal(&self) -> Result<u64> {
        let mut state = self.writer.lock();
        if let Some(id) = self.store.idempotent_seal_id() {
            return Ok(id);
        }
        self.follow_active_segment(&mut state)?;

        let active_id = self.store.active().id();
        let seq = state.next_seq;
        state.wal.append(&WalRecord::seal_begin(seq, active_id))?;
        state.next_seq += 1;

        let sealed = self.store.seal(seq)?;
        if let Err(err) = self.follow_active_segment(&mut state) {
            log::warn!("Log rotation for {} deferred: {err}", self.name);
        }
        *self.last_flush.lock() = Instant::now();
        self.notify_space();
        Ok(sealed)
    }

    fn notify_space(&self) {
        let _guard = self.space_lock.lock();
        self.space.notify_all();
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QuiverError::collection_not_found(self.name.clone()));
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Flush what is buffered and refuse further writes.
    pub fn close(&self) -> Result<()> {
        let mut state = self.writer.lock();
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let flushed = self.store.flush();
        state.wal.close()?;
        self.store.close();
        self.notify_space();
        flushed.map(|_| ())
    }

    /// Refuse further writes without flushing; used when the collection's
    /// files are about to be deleted.
    pub fn abandon(&self) {
        let mut state = self.writer.lock();
        self.closed.store(true, Ordering::Release);
        if let Err(err) = state.wal.close() {
            log::debug!("Closing log of dropped collection {}: {err}", self.name);
        }
        self.store.close();
        self.notify_space();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::config::CollectionConfig;
    use crate::segment::format::wal_file_name;
    use crate::storage::{FileMetadata, MemoryStorage, Storage, StorageInput, StorageOutput};
    use crate::vector::DistanceMetric;
    use uuid::Uuid;

    fn record(id: &str, x: f32) -> VectorRecord {
        VectorRecord::new(id, vec![x, 1.0])
    }

    fn pipeline_on(storage: Arc<dyn Storage>, config: CommitConfig) -> CommitPipeline {
        let store = Arc::new(
            SegmentStore::create(
                storage,
                Uuid::new_v4(),
                CollectionConfig::new("docs", 2, DistanceMetric::L2),
            )
            .unwrap(),
        );
        CommitPipeline::create(store, Arc::new(RecordDirectory::new()), config).unwrap()
    }

    fn reopen(storage: Arc<dyn Storage>) -> (CommitPipeline, ReplayReport) {
        let (store, _) = SegmentStore::open(storage).unwrap().unwrap();
        CommitPipeline::recover(
            Arc::new(store),
            |store| Arc::new(RecordDirectory::rebuild(&store.view())),
            CommitConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_write_is_visible_before_flush() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let pipeline = pipeline_on(storage, CommitConfig::default());

        let receipt = pipeline
            .write(vec![record("a", 1.0), record("b", 2.0)], WriteMode::Insert)
            .unwrap();
        assert_eq!((receipt.first_seq, receipt.last_seq), (1, 2));
        assert_eq!(receipt.state, WriteState::Buffered);
        assert_eq!(pipeline.pending(), 2);
        assert!(pipeline.directory().contains_live("a"));
        assert_eq!(pipeline.state_of(2), WriteState::Buffered);

        pipeline.flush().unwrap();
        assert_eq!(pipeline.state_of(2), WriteState::Flushed);
        assert_eq!(pipeline.state_of(99), WriteState::Received);
    }

    #[test]
    fn test_validation_rejects_whole_batch() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let pipeline = pipeline_on(storage, CommitConfig::default());
        pipeline.write(vec![record("a", 1.0)], WriteMode::Insert).unwrap();

        let err = pipeline
            .write(
                vec![record("b", 1.0), VectorRecord::new("c", vec![1.0])],
                WriteMode::Insert,
            )
            .unwrap_err();
        assert!(matches!(err, QuiverError::DimensionMismatch { expected: 2, actual: 1 }));

        let err = pipeline
            .write(vec![record("a", 5.0)], WriteMode::Insert)
            .unwrap_err();
        assert!(matches!(err, QuiverError::AlreadyExists(_)));

        let err = pipeline
            .write(vec![VectorRecord::new("n", vec![f32::NAN, 1.0])], WriteMode::Insert)
            .unwrap_err();
        assert!(matches!(err, QuiverError::InvalidArgument(_)));

        assert!(!pipeline.directory().contains_live("b"));
        assert_eq!(pipeline.next_seq(), 2);
    }

    #[test]
    fn test_upsert_and_delete() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let pipeline = pipeline_on(storage, CommitConfig::default());
        pipeline.write(vec![record("a", 1.0)], WriteMode::Insert).unwrap();
        let receipt = pipeline.write(vec![record("a", 3.0)], WriteMode::Upsert).unwrap();
        assert_eq!(pipeline.directory().live_seq("a"), Some(receipt.last_seq));

        assert!(pipeline.delete("a").unwrap());
        assert!(!pipeline.delete("a").unwrap());
        assert_eq!(pipeline.directory().live_count(), 0);
    }

    #[test]
    fn test_replay_restores_unflushed_writes() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let pipeline = pipeline_on(storage.clone(), CommitConfig::default());
        pipeline.write(vec![record("a", 1.0)], WriteMode::Insert).unwrap();
        pipeline.flush().unwrap();
        pipeline.write(vec![record("b", 2.0)], WriteMode::Insert).unwrap();
        // Crash: nothing is closed or flushed.
        drop(pipeline);

        let (pipeline, report) = reopen(storage.clone());
        assert_eq!(report.replayed, 1);
        assert_eq!(report.skipped, 1);
        assert!(pipeline.directory().contains_live("a"));
        assert!(pipeline.directory().contains_live("b"));
        assert_eq!(pipeline.next_seq(), 3);
        // Replayed writes are flushed and the log starts over.
        assert_eq!(pipeline.pending(), 0);
        assert!(storage.file_exists(&wal_file_name(1)));
        assert_eq!(storage.file_size(&wal_file_name(1)).unwrap(), 0);
    }

    #[test]
    fn test_replay_completes_interrupted_seal() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let pipeline = pipeline_on(storage.clone(), CommitConfig::default());
        pipeline.write(vec![record("a", 1.0), record("b", 2.0)], WriteMode::Insert).unwrap();
        {
            // The seal marker reached the log, then the process died.
            let mut state = pipeline.writer.lock();
            let seq = state.next_seq;
            state.wal.append(&WalRecord::seal_begin(seq, 1)).unwrap();
        }
        drop(pipeline);

        let (pipeline, report) = reopen(storage);
        assert_eq!(report.seals_completed, 1);
        let manifest = pipeline.store.manifest();
        assert_eq!(manifest.last_sealed_segment_id, Some(1));
        assert_eq!(manifest.sealed[0].record_count, 2);
        assert_eq!(pipeline.store.active().id(), 2);
        assert_eq!(pipeline.directory().live_count(), 2);
        assert_eq!(pipeline.seal().unwrap(), 1);
    }

    #[test]
    fn test_seal_rotates_log_and_is_idempotent() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let pipeline = pipeline_on(storage.clone(), CommitConfig::default());
        pipeline.write(vec![record("a", 1.0)], WriteMode::Insert).unwrap();

        let sealed = pipeline.seal().unwrap();
        assert_eq!(pipeline.seal().unwrap(), sealed);
        assert!(!storage.file_exists(&wal_file_name(1)));

        pipeline.write(vec![record("b", 1.0)], WriteMode::Insert).unwrap();
        assert!(storage.file_exists(&wal_file_name(2)));
        assert_ne!(pipeline.seal().unwrap(), sealed);
    }

    #[test]
    fn test_automatic_flush_and_seal_thresholds() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let config = CommitConfig::default()
            .with_flush_max_records(2)
            .with_max_pending_records(4)
            .with_segment_max_records(5);
        let pipeline = pipeline_on(storage, config);

        pipeline.write(vec![record("a", 1.0)], WriteMode::Insert).unwrap();
        assert_eq!(pipeline.pending(), 1);
        let receipt = pipeline.write(vec![record("b", 1.0)], WriteMode::Insert).unwrap();
        assert_eq!(receipt.state, WriteState::Flushed);
        assert_eq!(pipeline.pending(), 0);

        for id in ["c", "d", "e"] {
            pipeline.write(vec![record(id, 1.0)], WriteMode::Insert).unwrap();
        }
        assert_eq!(pipeline.store.manifest().sealed.len(), 1);
        assert!(pipeline.store.active().is_empty());
    }

    #[test]
    fn test_closed_pipeline_refuses_writes() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let pipeline = pipeline_on(storage, CommitConfig::default());
        pipeline.write(vec![record("a", 1.0)], WriteMode::Insert).unwrap();
        pipeline.close().unwrap();

        let err = pipeline.write(vec![record("b", 1.0)], WriteMode::Insert).unwrap_err();
        assert!(matches!(err, QuiverError::CollectionNotFound(_)));
        assert_eq!(pipeline.pending(), 0);
    }

    /// Memory storage whose segment files refuse appends while `broken` is set,
    /// so flushes fail but the log keeps working.
    #[derive(Debug)]
    struct BrokenSegments {
        inner: MemoryStorage,
        broken: AtomicBool,
    }

    impl BrokenSegments {
        fn new() -> Arc<Self> {
            Arc::new(BrokenSegments {
                inner: MemoryStorage::new_default(),
                broken: AtomicBool::new(false),
            })
        }
    }

    impl Storage for BrokenSegments {
        fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>> {
            self.inner.open_input(name)
        }

        fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
            self.inner.create_output(name)
        }

        fn create_output_append(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
            if self.broken.load(Ordering::Acquire) && name.ends_with(".seg") {
                return Err(QuiverError::storage(format!("{name} is not writable")));
            }
            self.inner.create_output_append(name)
        }

        fn file_exists(&self, name: &str) -> bool {
            self.inner.file_exists(name)
        }

        fn delete_file(&self, name: &str) -> Result<()> {
            self.inner.delete_file(name)
        }

        fn list_files(&self) -> Result<Vec<String>> {
            self.inner.list_files()
        }

        fn file_size(&self, name: &str) -> Result<u64> {
            self.inner.file_size(name)
        }

        fn metadata(&self, name: &str) -> Result<FileMetadata> {
            self.inner.metadata(name)
        }

        fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()> {
            self.inner.rename_file(old_name, new_name)
        }

        fn truncate_file(&self, name: &str, len: u64) -> Result<()> {
            self.inner.truncate_file(name, len)
        }

        fn sync(&self) -> Result<()> {
            self.inner.sync()
        }
    }

    fn backpressured(storage: &Arc<BrokenSegments>, policy: BackpressurePolicy) -> CommitPipeline {
        let config = CommitConfig::default()
            .with_flush_max_records(2)
            .with_max_pending_records(2)
            .with_backpressure(policy);
        let pipeline = pipeline_on(storage.clone(), config);
        storage.broken.store(true, Ordering::Release);
        pipeline
            .write(vec![record("a", 1.0), record("b", 2.0)], WriteMode::Insert)
            .unwrap();
        assert_eq!(pipeline.pending(), 2);
        pipeline
    }

    #[test]
    fn test_reject_policy_fails_fast_when_buffer_is_full() {
        let storage = BrokenSegments::new();
        let pipeline = backpressured(&storage, BackpressurePolicy::Reject);

        let err = pipeline.write(vec![record("c", 3.0)], WriteMode::Insert).unwrap_err();
        assert!(matches!(err, QuiverError::Overloaded(_)));
        assert!(!pipeline.directory().contains_live("c"));
        assert!(pipeline.directory().contains_live("a"));
        assert!(matches!(pipeline.delete("a").unwrap_err(), QuiverError::Overloaded(_)));

        storage.broken.store(false, Ordering::Release);
        pipeline.write(vec![record("c", 3.0)], WriteMode::Insert).unwrap();
        assert!(pipeline.directory().contains_live("c"));
    }

    #[test]
    fn test_block_policy_times_out() {
        let storage = BrokenSegments::new();
        let pipeline = backpressured(&storage, BackpressurePolicy::Block { timeout_ms: 50 });

        let started = Instant::now();
        let err = pipeline.write(vec![record("c", 3.0)], WriteMode::Insert).unwrap_err();
        assert!(matches!(err, QuiverError::Overloaded(_)));
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(pipeline.pending(), 2);
    }

    #[test]
    fn test_block_policy_resumes_after_flush() {
        let storage = BrokenSegments::new();
        let pipeline = Arc::new(backpressured(
            &storage,
            BackpressurePolicy::Block { timeout_ms: 10_000 },
        ));

        let flusher = {
            let storage = storage.clone();
            let pipeline = pipeline.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(30));
                storage.broken.store(false, Ordering::Release);
                pipeline.flush()
            })
        };

        let receipt = pipeline.write(vec![record("c", 3.0)], WriteMode::Insert).unwrap();
        assert_eq!(receipt.first_seq, 3);
        assert!(flusher.join().unwrap().is_ok());
        assert!(pipeline.directory().contains_live("c"));
    }
}
