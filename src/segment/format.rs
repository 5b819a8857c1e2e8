//! On-disk framing of segment files.
//!
//! ```text
//! header  : magic "QVSEGv01" | segment id u64 | dimension u32 | reserved u32
//! frames  : (len u32 | codec record bytes)*
//! footer  : magic "QVSEGEND" | record count u64 | crc32 of frame bytes u32
//! ```
//!
//! The active segment has a header and frames only. Sealing appends the
//! footer, after which the file never changes.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{QuiverError, Result};

pub const SEGMENT_MAGIC: &[u8; 8] = b"QVSEGv01";
pub const FOOTER_MAGIC: &[u8; 8] = b"QVSEGEND";
pub const HEADER_LEN: u64 = 24;
pub const FOOTER_LEN: u64 = 20;
pub const FRAME_PREFIX_LEN: u64 = 4;

pub const MANIFEST_FILE: &str = "MANIFEST";
pub const MANIFEST_TEMP_FILE: &str = "MANIFEST.tmp";

pub fn segment_file_name(segment_id: u64) -> String {
    format!("segment-{segment_id:020}.seg")
}

pub fn index_file_name(segment_id: u64) -> String {
    format!("segment-{segment_id:020}.hnsw")
}

pub fn wal_file_name(segment_id: u64) -> String {
    format!("wal-{segment_id:020}.log")
}

/// Kinds of files that live in a collection directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Segment(u64),
    Index(u64),
    Wal(u64),
    Manifest,
    ManifestTemp,
}

/// Classify a collection-relative file name. Unknown names return `None`.
pub fn classify_file(name: &str) -> Option<FileKind> {
    match name {
        MANIFEST_FILE => return Some(FileKind::Manifest),
        MANIFEST_TEMP_FILE => return Some(FileKind::ManifestTemp),
        _ => {}
    }

    let parse_id = |digits: &str| -> Option<u64> {
        if digits.len() == 20 && digits.bytes().all(|b| b.is_ascii_digit()) {
            digits.parse().ok()
        } else {
            None
        }
    };

    if let Some(rest) = name.strip_prefix("segment-") {
        if let Some(digits) = rest.strip_suffix(".seg") {
            return parse_id(digits).map(FileKind::Segment);
        }
        if let Some(digits) = rest.strip_suffix(".hnsw") {
            return parse_id(digits).map(FileKind::Index);
        }
    }
    if let Some(digits) = name
        .strip_prefix("wal-")
        .and_then(|rest| rest.strip_suffix(".log"))
    {
        return parse_id(digits).map(FileKind::Wal);
    }
    None
}

/// Fixed-size header at the start of every segment file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    pub segment_id: u64,
    pub dimension: u32,
}

impl SegmentHeader {
    pub fn encode(&self) -> [u8; HEADER_LEN as usize] {
        let mut buf = [0u8; HEADER_LEN as usize];
        buf[..8].copy_from_slice(SEGMENT_MAGIC);
        LittleEndian::write_u64(&mut buf[8..16], self.segment_id);
        LittleEndian::write_u32(&mut buf[16..20], self.dimension);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN as usize {
            return Err(QuiverError::corruption("segment header truncated"));
        }
        if &bytes[..8] != SEGMENT_MAGIC {
            return Err(QuiverError::corruption("bad segment magic"));
        }
        Ok(SegmentHeader {
            segment_id: LittleEndian::read_u64(&bytes[8..16]),
            dimension: LittleEndian::read_u32(&bytes[16..20]),
        })
    }
}

/// Trailer written when a segment is sealed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentFooter {
    pub record_count: u64,
    pub frames_crc: u32,
}

impl SegmentFooter {
    pub fn encode(&self) -> [u8; FOOTER_LEN as usize] {
        let mut buf = [0u8; FOOTER_LEN as usize];
        buf[..8].copy_from_slice(FOOTER_MAGIC);
        LittleEndian::write_u64(&mut buf[8..16], self.record_count);
        LittleEndian::write_u32(&mut buf[16..20], self.frames_crc);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != FOOTER_LEN as usize || &bytes[..8] != FOOTER_MAGIC {
            return Err(QuiverError::corruption("missing or damaged segment footer"));
        }
        Ok(SegmentFooter {
            record_count: LittleEndian::read_u64(&bytes[8..16]),
            frames_crc: LittleEndian::read_u32(&bytes[16..20]),
        })
    }
}

/// Append one length-prefixed frame to `buf`.
pub fn put_frame(buf: &mut Vec<u8>, record: &[u8]) {
    let mut len = [0u8; 4];
    LittleEndian::write_u32(&mut len, record.len() as u32);
    buf.extend_from_slice(&len);
    buf.extend_from_slice(record);
}

/// Split a frame region into record payloads.
///
/// Frames must exactly cover `bytes`; a frame running past the end is
/// corruption.
pub fn split_frames(bytes: &[u8]) -> Result<Vec<&[u8]>> {
    let mut frames = Vec::new();
    let mut pos = 0usize;

    while pos < bytes.len() {
        if bytes.len() - pos < FRAME_PREFIX_LEN as usize {
            return Err(QuiverError::corruption(format!(
                "truncated frame prefix at offset {pos}"
            )));
        }
        let len = LittleEndian::read_u32(&bytes[pos..pos + 4]) as usize;
        pos += 4;
        if bytes.len() - pos < len {
            return Err(QuiverError::corruption(format!(
                "frame of {len} bytes at offset {pos} runs past end of segment"
            )));
        }
        frames.push(&bytes[pos..pos + len]);
        pos += len;
    }

    Ok(frames)
}

/// Validate a sealed segment file and return its header and frame payloads.
pub fn parse_sealed(bytes: &[u8]) -> Result<(SegmentHeader, Vec<&[u8]>)> {
    let min = (HEADER_LEN + FOOTER_LEN) as usize;
    if bytes.len() < min {
        return Err(QuiverError::corruption(format!(
            "sealed segment too short: {} bytes",
            bytes.len()
        )));
    }

    let header = SegmentHeader::decode(&bytes[..HEADER_LEN as usize])?;
    let footer_start = bytes.len() - FOOTER_LEN as usize;
    let footer = SegmentFooter::decode(&bytes[footer_start..])?;

    let frame_bytes = &bytes[HEADER_LEN as usize..footer_start];
    let crc = crc32fast::hash(frame_bytes);
    if crc != footer.frames_crc {
        return Err(QuiverError::corruption(format!(
            "segment {} frame checksum mismatch",
            header.segment_id
        )));
    }

    let frames = split_frames(frame_bytes)?;
    if frames.len() as u64 != footer.record_count {
        return Err(QuiverError::corruption(format!(
            "segment {} footer says {} records, found {}",
            header.segment_id,
            footer.record_count,
            frames.len()
        )));
    }

    Ok((header, frames))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sealed_bytes(records: &[&[u8]]) -> Vec<u8> {
        let mut buf = SegmentHeader {
            segment_id: 3,
            dimension: 4,
        }
        .encode()
        .to_vec();
        let mut frames = Vec::new();
        for record in records {
            put_frame(&mut frames, record);
        }
        let footer = SegmentFooter {
            record_count: records.len() as u64,
            frames_crc: crc32fast::hash(&frames),
        };
        buf.extend_from_slice(&frames);
        buf.extend_from_slice(&footer.encode());
        buf
    }

    #[test]
    fn test_file_names_sort_numerically() {
        assert_eq!(segment_file_name(7), "segment-00000000000000000007.seg");
        assert!(segment_file_name(9) < segment_file_name(10));
        assert_eq!(wal_file_name(1), "wal-00000000000000000001.log");
    }

    #[test]
    fn test_classify_file() {
        assert_eq!(classify_file(&segment_file_name(12)), Some(FileKind::Segment(12)));
        assert_eq!(classify_file(&index_file_name(12)), Some(FileKind::Index(12)));
        assert_eq!(classify_file(&wal_file_name(4)), Some(FileKind::Wal(4)));
        assert_eq!(classify_file("MANIFEST"), Some(FileKind::Manifest));
        assert_eq!(classify_file("MANIFEST.tmp"), Some(FileKind::ManifestTemp));
        assert_eq!(classify_file("segment-12.seg"), None);
        assert_eq!(classify_file("notes.txt"), None);
    }

    #[test]
    fn test_parse_sealed() {
        let bytes = sealed_bytes(&[b"alpha", b"", b"gamma"]);
        let (header, frames) = parse_sealed(&bytes).unwrap();

        assert_eq!(header.segment_id, 3);
        assert_eq!(header.dimension, 4);
        assert_eq!(frames, vec![&b"alpha"[..], &b""[..], &b"gamma"[..]]);
    }

    #[test]
    fn test_parse_sealed_detects_damage() {
        let bytes = sealed_bytes(&[b"alpha", b"beta"]);

        let mut flipped = bytes.clone();
        flipped[HEADER_LEN as usize + 5] ^= 0x10;
        assert!(parse_sealed(&flipped).is_err());

        let missing_footer = &bytes[..bytes.len() - FOOTER_LEN as usize];
        assert!(parse_sealed(missing_footer).is_err());

        let mut bad_magic = bytes.clone();
        bad_magic[0] = b'X';
        assert!(parse_sealed(&bad_magic).is_err());
    }

    #[test]
    fn test_split_frames_rejects_overrun() {
        let mut frames = Vec::new();
        put_frame(&mut frames, b"abcdef");
        frames.truncate(frames.len() - 2);
        assert!(split_frames(&frames).is_err());
    }
}
