//! Binary encoding of vector records.
//!
//! Layout (little-endian):
//!
//! ```text
//! magic u8 | version u8 | flags u8 | seq u64
//! id: varint len + utf-8
//! dimension u32 | dimension x f32
//! metadata: varint block len | varint count | (key, tag u8, value)*
//! [document: varint len + utf-8]            (flags bit 1)
//! crc32 u32 over every preceding byte
//! ```
//!
//! The checksum is verified before any field is parsed, so a flipped bit
//! anywhere in the record is reported as corruption without a full re-parse.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{QuiverError, Result};
use crate::util::varint;
use crate::vector::record::{Metadata, MetadataValue, VectorRecord};

pub const RECORD_MAGIC: u8 = 0xA7;
pub const RECORD_VERSION: u8 = 1;

const FLAG_DELETED: u8 = 0b01;
const FLAG_DOCUMENT: u8 = 0b10;

const TAG_STRING: u8 = 0;
const TAG_NUMBER: u8 = 1;
const TAG_BOOL: u8 = 2;

/// Fixed prefix: magic, version, flags, seq.
const PREFIX_LEN: usize = 3 + 8;
const CHECKSUM_LEN: usize = 4;

/// Smallest well-formed record: prefix, empty id, zero dimension, empty
/// metadata block, checksum.
pub const MIN_RECORD_LEN: usize = PREFIX_LEN + 1 + 4 + 1 + CHECKSUM_LEN;

/// Encoder/decoder bound to a collection's dimension.
#[derive(Debug, Clone, Copy)]
pub struct VectorCodec {
    dimension: usize,
}

impl VectorCodec {
    pub fn new(dimension: usize) -> Self {
        VectorCodec { dimension }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Encode a record. Live records must match the codec's dimension.
    pub fn encode(&self, record: &VectorRecord) -> Result<Vec<u8>> {
        if !record.deleted && record.embedding.len() != self.dimension {
            return Err(QuiverError::dimension_mismatch(
                self.dimension,
                record.embedding.len(),
            ));
        }
        Ok(encode_record(record))
    }

    /// Decode a record, rejecting live records of the wrong dimension.
    pub fn decode(&self, bytes: &[u8]) -> Result<VectorRecord> {
        let record = decode_record(bytes)?;
        if !record.deleted && record.embedding.len() != self.dimension {
            return Err(QuiverError::corruption(format!(
                "record {} has dimension {}, collection dimension is {}",
                record.id,
                record.embedding.len(),
                self.dimension
            )));
        }
        Ok(record)
    }
}

/// Encode a record without any dimension check.
pub fn encode_record(record: &VectorRecord) -> Vec<u8> {
    let mut buf = Vec::with_capacity(encoded_len_hint(record));

    let mut flags = 0u8;
    if record.deleted {
        flags |= FLAG_DELETED;
    }
    if record.document.is_some() {
        flags |= FLAG_DOCUMENT;
    }

    buf.push(RECORD_MAGIC);
    buf.push(RECORD_VERSION);
    buf.push(flags);
    put_u64(&mut buf, record.seq);
    put_str(&mut buf, &record.id);

    put_u32(&mut buf, record.embedding.len() as u32);
    for value in &record.embedding {
        let mut bytes = [0u8; 4];
        LittleEndian::write_f32(&mut bytes, *value);
        buf.extend_from_slice(&bytes);
    }

    let metadata = encode_metadata(&record.metadata);
    varint::put_u64(&mut buf, metadata.len() as u64);
    buf.extend_from_slice(&metadata);

    if let Some(document) = &record.document {
        put_str(&mut buf, document);
    }

    let checksum = crc32fast::hash(&buf);
    put_u32(&mut buf, checksum);
    buf
}

/// Decode a record without any dimension check.
pub fn decode_record(bytes: &[u8]) -> Result<VectorRecord> {
    let body = verify_checksum(bytes)?;
    let mut reader = ByteReader::new(body);

    let magic = reader.u8()?;
    if magic != RECORD_MAGIC {
        return Err(QuiverError::corruption(format!(
            "bad record magic 0x{magic:02x}"
        )));
    }
    let version = reader.u8()?;
    if version != RECORD_VERSION {
        return Err(QuiverError::corruption(format!(
            "unsupported record version {version}"
        )));
    }
    let flags = reader.u8()?;
    let seq = reader.u64()?;
    let id = reader.string()?;

    let dimension = reader.u32()? as usize;
    let raw = reader.take(dimension.checked_mul(4).ok_or_else(|| {
        QuiverError::corruption(format!("dimension {dimension} overflows"))
    })?)?;
    let embedding = raw.chunks_exact(4).map(LittleEndian::read_f32).collect();

    let metadata_len = reader.len()?;
    let metadata = decode_metadata(reader.take(metadata_len)?)?;

    let document = if flags & FLAG_DOCUMENT != 0 {
        Some(reader.string()?)
    } else {
        None
    };

    if !reader.is_empty() {
        return Err(QuiverError::corruption(format!(
            "{} trailing bytes after record {id}",
            reader.remaining()
        )));
    }

    Ok(VectorRecord {
        id,
        embedding,
        metadata,
        document,
        deleted: flags & FLAG_DELETED != 0,
        seq,
    })
}

/// Check the trailing checksum and return the bytes it covers.
pub fn verify_checksum(bytes: &[u8]) -> Result<&[u8]> {
    if bytes.len() < MIN_RECORD_LEN {
        return Err(QuiverError::corruption(format!(
            "record too short: {} bytes",
            bytes.len()
        )));
    }
    let (body, tail) = bytes.split_at(bytes.len() - CHECKSUM_LEN);
    let stored = LittleEndian::read_u32(tail);
    let actual = crc32fast::hash(body);
    if stored != actual {
        return Err(QuiverError::corruption(format!(
            "record checksum mismatch: stored {stored:08x}, computed {actual:08x}"
        )));
    }
    Ok(body)
}

fn encoded_len_hint(record: &VectorRecord) -> usize {
    let metadata: usize = record
        .metadata
        .iter()
        .map(|(k, v)| {
            k.len()
                + 2
                + match v {
                    MetadataValue::String(s) => s.len() + 2,
                    MetadataValue::Number(_) => 8,
                    MetadataValue::Bool(_) => 1,
                }
        })
        .sum();
    MIN_RECORD_LEN
        + record.id.len()
        + 2
        + record.embedding.len() * 4
        + metadata
        + record.document.as_ref().map(|d| d.len() + 2).unwrap_or(0)
}

fn encode_metadata(metadata: &Metadata) -> Vec<u8> {
    let mut buf = Vec::new();
    varint::put_u64(&mut buf, metadata.len() as u64);
    for (key, value) in metadata {
        put_str(&mut buf, key);
        match value {
            MetadataValue::String(s) => {
                buf.push(TAG_STRING);
                put_str(&mut buf, s);
            }
            MetadataValue::Number(n) => {
                buf.push(TAG_NUMBER);
                let mut bytes = [0u8; 8];
                LittleEndian::write_f64(&mut bytes, *n);
                buf.extend_from_slice(&bytes);
            }
            MetadataValue::Bool(b) => {
                buf.push(TAG_BOOL);
                buf.push(u8::from(*b));
            }
        }
    }
    buf
}

fn decode_metadata(bytes: &[u8]) -> Result<Metadata> {
    let mut reader = ByteReader::new(bytes);
    let count = reader.len()?;
    let mut metadata = Metadata::new();

    for _ in 0..count {
        let key = reader.string()?;
        let value = match reader.u8()? {
            TAG_STRING => MetadataValue::String(reader.string()?),
            TAG_NUMBER => MetadataValue::Number(LittleEndian::read_f64(reader.take(8)?)),
            TAG_BOOL => MetadataValue::Bool(reader.u8()? != 0),
            tag => {
                return Err(QuiverError::corruption(format!(
                    "unknown metadata tag {tag} for key {key}"
                )));
            }
        };
        metadata.insert(key, value);
    }

    if !reader.is_empty() {
        return Err(QuiverError::corruption("trailing bytes in metadata block"));
    }
    Ok(metadata)
}

fn put_u32(buf: &mut Vec<u8>, value: u32) {
    let mut bytes = [0u8; 4];
    LittleEndian::write_u32(&mut bytes, value);
    buf.extend_from_slice(&bytes);
}

fn put_u64(buf: &mut Vec<u8>, value: u64) {
    let mut bytes = [0u8; 8];
    LittleEndian::write_u64(&mut bytes, value);
    buf.extend_from_slice(&bytes);
}

fn put_str(buf: &mut Vec<u8>, value: &str) {
    varint::put_u64(buf, value.len() as u64);
    buf.extend_from_slice(value.as_bytes());
}

/// Bounds-checked cursor over a byte slice; every short read is corruption.
struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        ByteReader { bytes, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.remaining() {
            return Err(QuiverError::corruption(format!(
                "unexpected end of record: need {n} bytes, have {}",
                self.remaining()
            )));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(LittleEndian::read_u64(self.take(8)?))
    }

    fn len(&mut self) -> Result<usize> {
        let (value, read) = varint::decode_len(&self.bytes[self.pos..])?;
        self.pos += read;
        Ok(value)
    }

    fn string(&mut self) -> Result<String> {
        let len = self.len()?;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec())
            .map_err(|e| QuiverError::corruption(format!("invalid utf-8 in record: {e}")))
    }
}
