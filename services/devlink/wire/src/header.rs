//! Fixed frame header for the wire protocol.
//!
//! Every frame starts with an 11-byte header followed by the payload and a
//! 4-byte CRC trailer. All multi-byte integers are little-endian; the magic
//! is written as the u16 `0x5452`, which puts `0x52 0x54` on the wire.

use bitflags::bitflags;
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

/// Frame magic as a little-endian u16
pub const MAGIC: u16 = 0x5452;

/// Magic bytes in wire order
pub const MAGIC_BYTES: [u8; 2] = MAGIC.to_le_bytes();

/// Wire protocol version
pub const WIRE_VERSION: u8 = 0x01;

/// Header size in bytes (magic, version, flags, command, request id, length)
pub const HEADER_SIZE: usize = 11;

/// CRC trailer size in bytes
pub const CRC_SIZE: usize = 4;

/// Smallest possible frame (empty payload)
pub const MIN_FRAME_SIZE: usize = HEADER_SIZE + CRC_SIZE;

/// Commands understood by the device
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Command {
    /// Liveness probe
    Ping = 0x01,
    /// Device information (max payload)
    Info = 0x02,
    /// Directory listing (streamed response)
    List = 0x10,
    /// One chunk of a file upload
    WriteChunk = 0x12,
    /// Delete a file
    Delete = 0x13,
    /// Create a directory
    Mkdir = 0x14,
}

impl TryFrom<u8> for Command {
    type Error = crate::WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Command::Ping),
            0x02 => Ok(Command::Info),
            0x10 => Ok(Command::List),
            0x12 => Ok(Command::WriteChunk),
            0x13 => Ok(Command::Delete),
            0x14 => Ok(Command::Mkdir),
            _ => Err(crate::WireError::Command(value)),
        }
    }
}

impl From<Command> for u8 {
    fn from(command: Command) -> Self {
        command as u8
    }
}

bitflags! {
    /// Frame flags bitmask
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Flags: u8 {
        /// Frame is a response to a host request
        const RESPONSE = 1 << 0;
        /// Payload carries a structured error
        const ERROR = 1 << 1;
        /// Last frame of a stream
        const END = 1 << 2;
        /// More frames follow for this request id
        const CONTINUATION = 1 << 3;
    }
}

impl Flags {
    /// Whether this frame terminates a streamed response.
    ///
    /// A frame without the continuation bit ends the stream even when the
    /// explicit end bit is missing.
    pub fn is_terminal(self) -> bool {
        self.contains(Flags::END) || !self.contains(Flags::CONTINUATION)
    }

    /// Short diagnostic label, e.g. `RESP|ERR`
    pub fn label(self) -> String {
        let mut out = String::from(if self.contains(Flags::RESPONSE) {
            "RESP"
        } else {
            "REQ"
        });
        if self.contains(Flags::ERROR) {
            out.push_str("|ERR");
        }
        if self.contains(Flags::END) {
            out.push_str("|END");
        }
        if self.contains(Flags::CONTINUATION) {
            out.push_str("|CONT");
        }
        out
    }
}

/// Decoded frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Protocol version
    pub version: u8,
    /// Frame flags (unknown bits retained)
    pub flags: Flags,
    /// Raw command byte
    pub command: u8,
    /// Correlation id shared by a request and its responses
    pub request_id: u16,
    /// Declared payload length
    pub payload_len: u32,
}

impl FrameHeader {
    /// Create a header for the current wire version
    pub fn new(command: u8, request_id: u16, payload_len: u32, flags: Flags) -> Self {
        Self {
            version: WIRE_VERSION,
            flags,
            command,
            request_id,
            payload_len,
        }
    }

    /// Encode the header (little-endian)
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16_le(MAGIC);
        buf.put_u8(self.version);
        buf.put_u8(self.flags.bits());
        buf.put_u8(self.command);
        buf.put_u16_le(self.request_id);
        buf.put_u32_le(self.payload_len);
    }

    /// Decode a header from the first [`HEADER_SIZE`] bytes of `buf`.
    ///
    /// Magic and version are not checked here; the scanner validates them
    /// before calling this so it can resynchronize.
    pub fn decode(mut buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }

        let _magic = buf.get_u16_le();
        let version = buf.get_u8();
        let flags = Flags::from_bits_retain(buf.get_u8());
        let command = buf.get_u8();
        let request_id = buf.get_u16_le();
        let payload_len = buf.get_u32_le();

        Some(Self {
            version,
            flags,
            command,
            request_id,
            payload_len,
        })
    }
}
