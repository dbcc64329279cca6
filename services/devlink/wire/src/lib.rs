//! Frame encoding, CRC validation, resynchronizing scanner and command payloads for devlink.
//!
//! This crate implements the byte-level side of the host/device protocol
//! spoken over a serial link: building CRC-protected frames, pulling frames
//! back out of an arbitrarily fragmented and occasionally damaged byte
//! stream, and the per-command payload layouts.
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+----------------------------+
//! | u16 magic (0x5452)   | frame start marker         |
//! +----------------------+----------------------------+
//! | u8 version           | currently 0x01             |
//! +----------------------+----------------------------+
//! | u8 flags             | RESP / ERR / END / CONT    |
//! +----------------------+----------------------------+
//! | u8 command           | Ping, Info, List, ...      |
//! +----------------------+----------------------------+
//! | u16 request_id       | correlation token          |
//! +----------------------+----------------------------+
//! | u32 payload_len      | length of payload          |
//! +----------------------+----------------------------+
//! | payload              | variable (0..N)            |
//! +----------------------+----------------------------+
//! | u32 crc32            | IEEE CRC of all the above  |
//! +----------------------+----------------------------+
//! ```
//!
//! All integers are little-endian.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod frame;
pub mod header;
pub mod payload;
pub mod scan;

// Re-export main types
pub use error::WireError;
pub use frame::{crc32, encode_frame, Frame};
pub use header::{
    Command, Flags, FrameHeader, CRC_SIZE, HEADER_SIZE, MAGIC, MAGIC_BYTES, MIN_FRAME_SIZE,
    WIRE_VERSION,
};
pub use payload::{
    chunk_overhead, decode_chunk_ack, decode_info, decode_list, decode_path, encode_chunk,
    encode_list, encode_path, put_path, ChunkPayload, DeviceError, EntryKind, ListEntry,
};
pub use scan::{scan, FrameScanner, ResyncReason, ScanStats, DEFAULT_MAX_SCAN_PAYLOAD};
