//! Binary framing for WAL entries and snapshots.
//!
//! Every frame is:
//! ```text
//! [version: 1 byte][length: 4 bytes LE][payload: N bytes JSON][crc32: 4 bytes LE]
//! ```
//! Files start with `MAGIC` followed by the codec version.

use std::io::{Error as IoError, ErrorKind, Read, Result as IoResult, Write};

use crc32fast::Hasher;
use serde::{de::DeserializeOwned, Serialize};

/// Current codec version.
const CODEC_VERSION: u8 = 1;

/// Magic bytes identifying mapping-store files.
pub const MAGIC: [u8; 4] = *b"CIDM";

/// Frames larger than this are treated as corruption.
const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

fn invalid(message: String) -> IoError {
    IoError::new(ErrorKind::InvalidData, message)
}

fn checksum(payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(payload);
    hasher.finalize()
}

/// Serializes `value` into a checksummed frame.
pub fn encode<T: Serialize>(value: &T) -> IoResult<Vec<u8>> {
    let payload =
        serde_json::to_vec(value).map_err(|e| invalid(format!("serialization failed: {e}")))?;
    if payload.len() > MAX_FRAME_BYTES {
        return Err(invalid(format!(
            "frame of {} bytes exceeds maximum {MAX_FRAME_BYTES}",
            payload.len()
        )));
    }

    let len = u32::try_from(payload.len()).map_err(|_| invalid("frame too large".to_string()))?;
    let mut out = Vec::with_capacity(payload.len() + 9);
    out.push(CODEC_VERSION);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&payload);
    out.extend_from_slice(&checksum(&payload).to_le_bytes());
    Ok(out)
}

/// Reads one frame and deserializes it, verifying the checksum.
///
/// # Errors
/// - `UnexpectedEof` if the reader ends mid-frame (torn write)
/// - `InvalidData` on version mismatch, oversized frame or CRC mismatch
pub fn decode<T: DeserializeOwned>(reader: &mut impl Read) -> IoResult<T> {
    let mut head = [0u8; 5];
    reader.read_exact(&mut head)?;

    if head[0] != CODEC_VERSION {
        return Err(invalid(format!(
            "unsupported codec version: {} (expected {CODEC_VERSION})",
            head[0]
        )));
    }

    let len = u32::from_le_bytes([head[1], head[2], head[3], head[4]]) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(invalid(format!("frame size {len} exceeds maximum {MAX_FRAME_BYTES}")));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;

    let mut crc = [0u8; 4];
    reader.read_exact(&mut crc)?;
    let stored = u32::from_le_bytes(crc);
    let computed = checksum(&payload);
    if stored != computed {
        return Err(invalid(format!(
            "CRC mismatch: stored={stored:08x}, computed={computed:08x} (data corrupted)"
        )));
    }

    serde_json::from_slice(&payload).map_err(|e| invalid(format!("deserialization failed: {e}")))
}

/// Writes the file header.
pub fn write_header(writer: &mut impl Write) -> IoResult<()> {
    writer.write_all(&MAGIC)?;
    writer.write_all(&[CODEC_VERSION])
}

/// Reads and validates the file header, returning its version.
pub fn read_header(reader: &mut impl Read) -> IoResult<u8> {
    let mut head = [0u8; 5];
    reader.read_exact(&mut head)?;
    if head[..4] != MAGIC {
        return Err(invalid(format!(
            "invalid magic bytes: expected {MAGIC:?}, got {:?}",
            &head[..4]
        )));
    }
    Ok(head[4])
}

/// Length of the header written by `write_header`.
pub const HEADER_LEN: u64 = 5;
