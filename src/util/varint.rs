//! Variable-length integer encoding used for length prefixes.
//!
//! Seven payload bits per byte, high bit set while more bytes follow. Malformed
//! input is reported as [`QuiverError::Corruption`] because varints are only
//! ever decoded from persisted bytes.

use crate::error::{QuiverError, Result};

/// Maximum encoded length of a u64.
pub const MAX_VARINT_LEN: usize = 10;

/// Append `value` to `buf` using variable-length encoding.
///
/// Returns the number of bytes written.
pub fn put_u64(buf: &mut Vec<u8>, value: u64) -> usize {
    let mut val = value;
    let mut written = 0;

    loop {
        let mut byte = (val & 0x7F) as u8;
        val >>= 7;

        if val != 0 {
            byte |= 0x80;
        }

        buf.push(byte);
        written += 1;

        if val == 0 {
            return written;
        }
    }
}

/// Encode a u64 value into a fresh buffer.
pub fn encode_u64(value: u64) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(MAX_VARINT_LEN);
    put_u64(&mut bytes, value);
    bytes
}

/// Decode a u64 from the front of `bytes`, returning it and the bytes consumed.
pub fn decode_u64(bytes: &[u8]) -> Result<(u64, usize)> {
    let mut result = 0u64;
    let mut shift = 0;

    for (index, &byte) in bytes.iter().enumerate() {
        if shift >= 64 || index >= MAX_VARINT_LEN {
            return Err(QuiverError::corruption("varint overflow"));
        }

        result |= ((byte & 0x7F) as u64) << shift;

        if (byte & 0x80) == 0 {
            return Ok((result, index + 1));
        }

        shift += 7;
    }

    Err(QuiverError::corruption("incomplete varint"))
}

/// Decode a varint that must fit in `usize` (lengths and counts).
pub fn decode_len(bytes: &[u8]) -> Result<(usize, usize)> {
    let (value, read) = decode_u64(bytes)?;
    let value = usize::try_from(value)
        .map_err(|_| QuiverError::corruption(format!("length {value} does not fit in usize")))?;
    Ok((value, read))
}
