//! Frame structure, encoding and CRC.
//!
//! ```text
//! +-------+-----+-------+-----+--------+--------+---------+-------+
//! | magic | ver | flags | cmd | req_id | length | payload | crc32 |
//! |  2B   | 1B  |  1B   | 1B  |   2B   |   4B   |   N B   |  4B   |
//! +-------+-----+-------+-----+--------+--------+---------+-------+
//! ```
//!
//! The CRC is the IEEE CRC-32 of every byte from the magic through the end
//! of the payload.

use crate::error::WireError;
use crate::header::{Command, Flags, FrameHeader, CRC_SIZE, HEADER_SIZE};
use bytes::{BufMut, Bytes, BytesMut};

/// IEEE CRC-32 (reflected 0xEDB88320, init 0xFFFFFFFF, final complement)
pub fn crc32(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes)
}

/// One decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame flags
    pub flags: Flags,
    /// Raw command byte
    pub command: u8,
    /// Correlation id
    pub request_id: u16,
    /// Payload bytes
    pub payload: Bytes,
    /// Whether the trailing CRC matched
    pub crc_ok: bool,
}

impl Frame {
    /// Create a frame with a valid CRC marker
    pub fn new(command: impl Into<u8>, request_id: u16, payload: Bytes, flags: Flags) -> Self {
        Self {
            flags,
            command: command.into(),
            request_id,
            payload,
            crc_ok: true,
        }
    }

    /// Decoded command, if known
    pub fn command(&self) -> Option<Command> {
        Command::try_from(self.command).ok()
    }

    /// Whether the device flagged this frame as an error
    pub fn is_error(&self) -> bool {
        self.flags.contains(Flags::ERROR)
    }

    /// Whether this frame is a response
    pub fn is_response(&self) -> bool {
        self.flags.contains(Flags::RESPONSE)
    }

    /// Size of the frame on the wire
    pub fn encoded_size(&self) -> usize {
        HEADER_SIZE + self.payload.len() + CRC_SIZE
    }

    /// Encode the frame, computing a fresh CRC
    pub fn encode(&self) -> Result<Bytes, WireError> {
        encode_frame(self.command, self.request_id, &self.payload, self.flags)
    }
}

/// Serialize a frame for the wire.
///
/// Only the 32-bit length field is enforced here; callers respect the
/// negotiated maximum payload.
pub fn encode_frame(
    command: impl Into<u8>,
    request_id: u16,
    payload: &[u8],
    flags: Flags,
) -> Result<Bytes, WireError> {
    let length = length_field(payload.len())?;
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);

    FrameHeader::new(command.into(), request_id, length, flags).encode(&mut buf);
    buf.put_slice(payload);

    let crc = crc32(&buf);
    buf.put_u32_le(crc);

    Ok(buf.freeze())
}

fn length_field(len: usize) -> Result<u32, WireError> {
    u32::try_from(len).map_err(|_| WireError::Size(len as u64))
}
