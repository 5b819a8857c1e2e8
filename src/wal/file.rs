//! Write-Ahead Log (WAL) for collection writes.
//!
//! Every write is logged here before it becomes visible in the active segment.
//! There is one log file per active segment (`wal-{segment id}.log`); sealing
//! the segment rotates the log.
//!
//! Frame layout (little-endian):
//!
//! ```text
//! payload len u32 | crc32 u32 | kind u8 | seq u64 | payload
//! ```
//!
//! The checksum covers kind, seq, and payload. A frame that is cut short or
//! fails its checksum marks a torn write; it and everything after it are
//! ignored.

use std::io::Write;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{QuiverError, Result};
use crate::segment::format::{FileKind, classify_file, wal_file_name};
use crate::storage::{Storage, StorageOutput};
use crate::vector::VectorRecord;
use crate::vector::codec::{VectorCodec, encode_record};

pub type SeqNumber = u64;

const FRAME_HEADER_LEN: usize = 4 + 4 + 1 + 8;

const KIND_PUT: u8 = 1;
const KIND_SEAL_BEGIN: u8 = 2;

/// A single operation in the log.
#[derive(Debug, Clone, PartialEq)]
pub enum WalEntry {
    /// A record (insert, upsert, or tombstone) entering the active segment.
    Put(VectorRecord),
    /// Sealing of the given segment started.
    SealBegin { segment_id: u64 },
}

/// A log entry with its sequence number.
#[derive(Debug, Clone, PartialEq)]
pub struct WalRecord {
    pub seq: SeqNumber,
    pub entry: WalEntry,
}

impl WalRecord {
    pub fn put(record: VectorRecord) -> Self {
        WalRecord {
            seq: record.seq,
            entry: WalEntry::Put(record),
        }
    }

    pub fn seal_begin(seq: SeqNumber, segment_id: u64) -> Self {
        WalRecord {
            seq,
            entry: WalEntry::SealBegin { segment_id },
        }
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        let (kind, payload) = match &self.entry {
            WalEntry::Put(record) => (KIND_PUT, encode_record(record)),
            WalEntry::SealBegin { segment_id } => {
                (KIND_SEAL_BEGIN, segment_id.to_le_bytes().to_vec())
            }
        };

        let mut header = [0u8; FRAME_HEADER_LEN];
        LittleEndian::write_u32(&mut header[0..4], payload.len() as u32);
        header[8] = kind;
        LittleEndian::write_u64(&mut header[9..17], self.seq);

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&header[8..]);
        hasher.update(&payload);
        LittleEndian::write_u32(&mut header[4..8], hasher.finalize());

        buf.extend_from_slice(&header);
        buf.extend_from_slice(&payload);
    }
}

/// Everything readable from one log file.
#[derive(Debug, Default)]
pub struct WalContents {
    pub records: Vec<WalRecord>,
    /// Length of the intact prefix of the file.
    pub valid_len: u64,
    pub file_len: u64,
}

impl WalContents {
    pub fn is_torn(&self) -> bool {
        self.valid_len < self.file_len
    }
}

/// Appender for the log of one active segment.
#[derive(Debug)]
pub struct WalManager {
    storage: Arc<dyn Storage>,
    segment_id: u64,
    writer: Option<Box<dyn StorageOutput>>,
    /// Bytes known to be intact on disk.
    length: u64,
    sync: bool,
}

impl WalManager {
    /// Start an empty log for `segment_id`, replacing any existing file.
    pub fn create(storage: Arc<dyn Storage>, segment_id: u64, sync: bool) -> Result<Self> {
        let mut output = storage.create_output(&wal_file_name(segment_id))?;
        output.flush_and_sync()?;
        Ok(WalManager {
            storage,
            segment_id,
            writer: Some(output),
            length: 0,
            sync,
        })
    }

    pub fn segment_id(&self) -> u64 {
        self.segment_id
    }

    /// Append one entry.
    pub fn append(&mut self, record: &WalRecord) -> Result<()> {
        self.append_batch(std::slice::from_ref(record))
    }

    /// Append entries as one write. On failure nothing of the batch remains
    /// in the log.
    pub fn append_batch(&mut self, records: &[WalRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut buf = Vec::new();
        for record in records {
            record.encode_into(&mut buf);
        }

        match self.write_all(&buf) {
            Ok(()) => {
                self.length += buf.len() as u64;
                Ok(())
            }
            Err(err) => {
                self.writer = None;
                let name = wal_file_name(self.segment_id);
                if let Err(truncate_err) = self.storage.truncate_file(&name, self.length) {
                    log::error!("Could not roll back {name} after a failed append: {truncate_err}");
                }
                Err(err)
            }
        }
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        if self.writer.is_none() {
            let name = wal_file_name(self.segment_id);
            self.writer = Some(self.storage.create_output_append(&name)?);
        }
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| QuiverError::internal("log writer missing"))?;
        writer.write_all(buf)?;
        if self.sync {
            writer.flush_and_sync()
        } else {
            writer.flush()?;
            Ok(())
        }
    }

    /// Switch to the log of `segment_id` and delete the current file.
    ///
    /// Only called once everything in the current log is durable elsewhere.
    pub fn rotate(&mut self, segment_id: u64) -> Result<()> {
        if segment_id == self.segment_id {
            return Ok(());
        }
        let previous = self.segment_id;
        if let Some(mut writer) = self.writer.take() {
            writer.close()?;
        }

        self.segment_id = segment_id;
        self.length = 0;
        self.storage.delete_file(&wal_file_name(segment_id))?;
        self.storage.delete_file(&wal_file_name(previous))?;
        log::debug!("Rotated log from segment {previous} to {segment_id}");
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        match self.writer.take() {
            Some(mut writer) => writer.close(),
            None => Ok(()),
        }
    }
}

/// Read every intact entry of the log of `segment_id`.
pub fn read_log(storage: &dyn Storage, segment_id: u64, codec: VectorCodec) -> Result<WalContents> {
    let name = wal_file_name(segment_id);
    if !storage.file_exists(&name) {
        return Ok(WalContents::default());
    }

    let bytes = storage.read_bytes(&name)?;
    let mut contents = WalContents {
        file_len: bytes.len() as u64,
        ..Default::default()
    };

    let mut pos = 0usize;
    while pos < bytes.len() {
        match decode_frame(&bytes[pos..], codec) {
            Ok((record, consumed)) => {
                contents.records.push(record);
                pos += consumed;
            }
            Err(err) => {
                log::warn!(
                    "Log {name} ends in a torn write at offset {pos} ({} bytes dropped): {err}",
                    bytes.len() - pos
                );
                break;
            }
        }
    }
    contents.valid_len = pos as u64;
    Ok(contents)
}

fn decode_frame(bytes: &[u8], codec: VectorCodec) -> Result<(WalRecord, usize)> {
    if bytes.len() < FRAME_HEADER_LEN {
        return Err(QuiverError::corruption("truncated frame header"));
    }
    let len = LittleEndian::read_u32(&bytes[0..4]) as usize;
    let stored_crc = LittleEndian::read_u32(&bytes[4..8]);
    let end = FRAME_HEADER_LEN + len;
    if bytes.len() < end {
        return Err(QuiverError::corruption("truncated frame payload"));
    }
    if crc32fast::hash(&bytes[8..end]) != stored_crc {
        return Err(QuiverError::corruption("frame checksum mismatch"));
    }

    let kind = bytes[8];
    let seq = LittleEndian::read_u64(&bytes[9..17]);
    let payload = &bytes[FRAME_HEADER_LEN..end];
    let entry = match kind {
        KIND_PUT => {
            let record = codec.decode(payload)?;
            if record.seq != seq {
                return Err(QuiverError::corruption(format!(
                    "frame seq {seq} carries record seq {}",
                    record.seq
                )));
            }
            WalEntry::Put(record)
        }
        KIND_SEAL_BEGIN if payload.len() == 8 => WalEntry::SealBegin {
            segment_id: LittleEndian::read_u64(payload),
        },
        other => {
            return Err(QuiverError::corruption(format!(
                "unknown frame kind {other}"
            )));
        }
    };
    Ok((WalRecord { seq, entry }, end))
}

/// Segment ids of every log file in `storage`, ascending.
pub fn list_logs(storage: &dyn Storage) -> Result<Vec<u64>> {
    let mut ids: Vec<u64> = storage
        .list_files()?
        .iter()
        .filter_map(|name| match classify_file(name) {
            Some(FileKind::Wal(id)) => Some(id),
            _ => None,
        })
        .collect();
    ids.sort_unstable();
    Ok(ids)
}

pub fn delete_log(storage: &dyn Storage, segment_id: u64) -> Result<()> {
    storage.delete_file(&wal_file_name(segment_id))
}
