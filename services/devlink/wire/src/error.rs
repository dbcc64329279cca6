//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Payload ended before a field could be read
    #[error("truncated payload: need {need} bytes for {field}, have {have}")]
    Truncated {
        /// Field being decoded
        field: &'static str,
        /// Bytes required
        need: usize,
        /// Bytes remaining
        have: usize,
    },

    /// Unknown command byte
    #[error("unknown command 0x{0:02x}")]
    Command(u8),

    /// Path does not fit the u16 length prefix
    #[error("path too long: {0} bytes")]
    PathTooLong(usize),

    /// String field is not valid UTF-8
    #[error("invalid utf-8 in {0}")]
    Utf8(&'static str),

    /// Value does not fit the wire field
    #[error("size limit exceeded: {0}")]
    Size(u64),
}
