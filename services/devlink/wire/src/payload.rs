//! Command payload encoding and decoding.
//!
//! ```text
//! path        : u16 len | utf-8 bytes
//! info reply  : u32 max_payload
//! list reply  : u16 count | count x (u8 kind | u16 name_len | name | u64 size)
//! error reply : u16 code | u16 msg_len | utf-8 message
//! chunk 0     : path | u32 total_len | u64 offset | data
//! chunk n     : u64 offset | data
//! chunk ack   : u32 confirmed_offset (optional)
//! ```

use crate::WireError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Bytes taken by the u16 path length prefix
pub const PATH_PREFIX_SIZE: usize = 2;
/// Bytes taken by the total-length field of the first chunk
pub const TOTAL_LEN_SIZE: usize = 4;
/// Bytes taken by the offset field of every chunk
pub const OFFSET_SIZE: usize = 8;

/// List entry kind byte for directories
pub const KIND_DIRECTORY: u8 = 1;

fn need(buf: &[u8], n: usize, field: &'static str) -> Result<(), WireError> {
    if buf.len() < n {
        return Err(WireError::Truncated {
            field,
            need: n,
            have: buf.len(),
        });
    }
    Ok(())
}

/// Append a length-prefixed UTF-8 path
pub fn put_path(buf: &mut BytesMut, path: &str) -> Result<(), WireError> {
    let len = u16::try_from(path.len()).map_err(|_| WireError::PathTooLong(path.len()))?;
    buf.put_u16_le(len);
    buf.put_slice(path.as_bytes());
    Ok(())
}

/// Encode the request payload shared by List, Delete and Mkdir
pub fn encode_path(path: &str) -> Result<Bytes, WireError> {
    let mut buf = BytesMut::with_capacity(PATH_PREFIX_SIZE + path.len());
    put_path(&mut buf, path)?;
    Ok(buf.freeze())
}

/// Decode a length-prefixed UTF-8 path
pub fn decode_path(mut buf: &[u8]) -> Result<String, WireError> {
    need(buf, PATH_PREFIX_SIZE, "path length")?;
    let len = buf.get_u16_le() as usize;
    need(buf, len, "path")?;
    std::str::from_utf8(&buf[..len])
        .map(str::to_owned)
        .map_err(|_| WireError::Utf8("path"))
}

/// Structured error carried by an error-flagged frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceError {
    /// Device-specific error code
    pub code: u16,
    /// Human-readable message
    pub message: String,
}

impl DeviceError {
    /// Decode an error payload.
    ///
    /// Payloads shorter than the fixed fields decode to code 0 with
    /// "unknown error"; a message length past the end is clamped.
    pub fn decode(payload: &[u8]) -> Self {
        if payload.len() < 4 {
            return Self {
                code: 0,
                message: "unknown error".to_string(),
            };
        }

        let mut buf = payload;
        let code = buf.get_u16_le();
        let len = (buf.get_u16_le() as usize).min(buf.len());
        let message = String::from_utf8_lossy(&buf[..len]).into_owned();

        Self { code, message }
    }

    /// Encode an error payload (device side, used by tests and tools)
    pub fn encode(&self) -> Bytes {
        let msg = self.message.as_bytes();
        let len = msg.len().min(u16::MAX as usize);
        let mut buf = BytesMut::with_capacity(4 + len);
        buf.put_u16_le(self.code);
        buf.put_u16_le(len as u16);
        buf.put_slice(&msg[..len]);
        buf.freeze()
    }
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "code {}: {}", self.code, self.message)
    }
}

impl std::error::Error for DeviceError {}

/// Decode the Info reply into the device's maximum payload size
pub fn decode_info(mut payload: &[u8]) -> Result<u32, WireError> {
    need(payload, 4, "max payload")?;
    Ok(payload.get_u32_le())
}

/// Kind of a directory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    /// Regular file
    File,
    /// Directory
    Directory,
}

impl From<u8> for EntryKind {
    fn from(value: u8) -> Self {
        if value == KIND_DIRECTORY {
            EntryKind::Directory
        } else {
            EntryKind::File
        }
    }
}

/// One entry of a directory listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListEntry {
    /// Entry name (no directory part)
    pub name: String,
    /// File or directory
    pub kind: EntryKind,
    /// Size in bytes (directories report whatever the device sends)
    pub size: u64,
}

impl ListEntry {
    /// Whether the entry is a directory
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// Decode an aggregated List reply
pub fn decode_list(mut payload: &[u8]) -> Result<Vec<ListEntry>, WireError> {
    need(payload, 2, "entry count")?;
    let count = payload.get_u16_le() as usize;
    let mut entries = Vec::with_capacity(count);

    for _ in 0..count {
        need(payload, 3, "entry header")?;
        let kind = EntryKind::from(payload.get_u8());
        let name_len = payload.get_u16_le() as usize;
        need(payload, name_len, "entry name")?;
        let name = std::str::from_utf8(&payload[..name_len])
            .map_err(|_| WireError::Utf8("entry name"))?
            .to_owned();
        payload.advance(name_len);
        need(payload, 8, "entry size")?;
        let size = payload.get_u64_le();

        entries.push(ListEntry { name, kind, size });
    }

    Ok(entries)
}

/// Encode a List reply (device side, used by tests and tools)
pub fn encode_list(entries: &[ListEntry]) -> Result<Bytes, WireError> {
    let count = u16::try_from(entries.len()).map_err(|_| WireError::Size(entries.len() as u64))?;
    let mut buf = BytesMut::new();
    buf.put_u16_le(count);
    for entry in entries {
        buf.put_u8(match entry.kind {
            EntryKind::Directory => KIND_DIRECTORY,
            EntryKind::File => 0,
        });
        put_path(&mut buf, &entry.name)?;
        buf.put_u64_le(entry.size);
    }
    Ok(buf.freeze())
}

/// Per-chunk bytes used by metadata rather than file data
pub fn chunk_overhead(path: &str) -> usize {
    PATH_PREFIX_SIZE + path.len() + TOTAL_LEN_SIZE + OFFSET_SIZE
}

/// Encode a WriteChunk payload.
///
/// The first chunk (`first == true`) carries the path and total length in
/// front of the offset; later chunks carry only the offset.
pub fn encode_chunk(
    path: &str,
    total_len: u32,
    offset: u64,
    data: &[u8],
    first: bool,
) -> Result<Bytes, WireError> {
    let mut buf = BytesMut::with_capacity(chunk_overhead(path) + data.len());
    if first {
        put_path(&mut buf, path)?;
        buf.put_u32_le(total_len);
    }
    buf.put_u64_le(offset);
    buf.put_slice(data);
    Ok(buf.freeze())
}

/// A WriteChunk payload as seen by the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPayload {
    /// Path and total length, present on the first chunk only
    pub start: Option<(String, u32)>,
    /// Offset of `data` within the file
    pub offset: u64,
    /// File bytes
    pub data: Bytes,
}

impl ChunkPayload {
    /// Decode a chunk payload; `first` selects the chunk-0 layout
    pub fn decode(payload: &Bytes, first: bool) -> Result<Self, WireError> {
        let mut rest = &payload[..];
        let start = if first {
            let path = decode_path(rest)?;
            rest.advance(PATH_PREFIX_SIZE + path.len());
            need(rest, TOTAL_LEN_SIZE, "total length")?;
            Some((path, rest.get_u32_le()))
        } else {
            None
        };
        need(rest, OFFSET_SIZE, "offset")?;
        let offset = rest.get_u64_le();
        let consumed = payload.len() - rest.len();

        Ok(Self {
            start,
            offset,
            data: payload.slice(consumed..),
        })
    }
}

/// Read the confirmed write offset from a chunk acknowledgment, if present
pub fn decode_chunk_ack(mut payload: &[u8]) -> Option<u32> {
    if payload.len() >= 4 {
        Some(payload.get_u32_le())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_prefix() {
        let bytes = encode_path("/books").unwrap();
        assert_eq!(&bytes[..], b"\x06\x00/books");
        assert_eq!(decode_path(&bytes).unwrap(), "/books");
    }

    #[test]
    fn test_path_too_long() {
        let long = "a".repeat(70_000);
        assert_eq!(encode_path(&long), Err(WireError::PathTooLong(70_000)));
    }

    #[test]
    fn test_device_error_decode() {
        let err = DeviceError::decode(b"\x05\x00\x09\x00not found");
        assert_eq!(err.code, 5);
        assert_eq!(err.message, "not found");
        assert_eq!(err.to_string(), "code 5: not found");
    }

    #[test]
    fn test_device_error_short_payload() {
        let err = DeviceError::decode(&[1, 0]);
        assert_eq!(err.message, "unknown error");
    }

    #[test]
    fn test_device_error_clamps_length() {
        let err = DeviceError::decode(b"\x02\x00\xff\x00full");
        assert_eq!(err.code, 2);
        assert_eq!(err.message, "full");
    }

    #[test]
    fn test_info_decode() {
        assert_eq!(decode_info(&8192u32.to_le_bytes()).unwrap(), 8192);
        assert!(matches!(
            decode_info(&[0, 1]),
            Err(WireError::Truncated { need: 4, have: 2, .. })
        ));
    }

    #[test]
    fn test_list_decode_layout() {
        let mut raw = vec![2, 0];
        raw.push(1);
        raw.extend_from_slice(&[5, 0]);
        raw.extend_from_slice(b"BOOKS");
        raw.extend_from_slice(&0u64.to_le_bytes());
        raw.push(0);
        raw.extend_from_slice(&[9, 0]);
        raw.extend_from_slice(b"COVER.TRI");
        raw.extend_from_slice(&1234u64.to_le_bytes());

        let entries = decode_list(&raw).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "BOOKS");
        assert!(entries[0].is_dir());
        assert_eq!(entries[1].name, "COVER.TRI");
        assert_eq!(entries[1].kind, EntryKind::File);
        assert_eq!(entries[1].size, 1234);

        assert_eq!(encode_list(&entries).unwrap(), Bytes::from(raw));
    }

    #[test]
    fn test_list_truncated() {
        let raw = [1u8, 0, 0, 3, 0, b'a'];
        assert!(matches!(
            decode_list(&raw),
            Err(WireError::Truncated { field: "entry name", .. })
        ));
    }

    #[test]
    fn test_first_chunk_layout() {
        let bytes = encode_chunk("/a", 10, 0, b"xyz", true).unwrap();
        assert_eq!(bytes.len(), chunk_overhead("/a") + 3);
        assert_eq!(&bytes[..4], b"\x02\x00/a");
        assert_eq!(&bytes[4..8], &10u32.to_le_bytes());
        assert_eq!(&bytes[8..16], &0u64.to_le_bytes());

        let decoded = ChunkPayload::decode(&bytes, true).unwrap();
        assert_eq!(decoded.start, Some(("/a".to_string(), 10)));
        assert_eq!(decoded.offset, 0);
        assert_eq!(&decoded.data[..], b"xyz");
    }

    #[test]
    fn test_later_chunk_layout() {
        let bytes = encode_chunk("/a", 10, 3, b"more", false).unwrap();
        assert_eq!(bytes.len(), OFFSET_SIZE + 4);

        let decoded = ChunkPayload::decode(&bytes, false).unwrap();
        assert_eq!(decoded.start, None);
        assert_eq!(decoded.offset, 3);
        assert_eq!(&decoded.data[..], b"more");
    }

    #[test]
    fn test_chunk_ack() {
        assert_eq!(decode_chunk_ack(&512u32.to_le_bytes()), Some(512));
        assert_eq!(decode_chunk_ack(&[1, 2]), None);
    }
}
