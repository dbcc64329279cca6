//! Session error types.

use crate::stats::StatsSnapshot;
use devlink_wire::{DeviceError, WireError};
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced to callers of a [`Link`](crate::Link).
///
/// CRC mismatches and resyncs are absorbed by the read loop and only show up
/// in [`LinkStats`](crate::LinkStats); everything here is caller-visible.
#[derive(Error, Debug)]
pub enum LinkError {
    /// I/O error on the transport
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Read loop has stopped; the session is unusable
    #[error("link closed")]
    Closed,

    /// Error-flagged response from the device
    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    /// No matching response before the deadline
    #[error("timeout after {after:?} waiting for request {request_id}")]
    Timeout {
        /// Request that timed out
        request_id: u16,
        /// Wait duration
        after: Duration,
    },

    /// Streamed response did not terminate before the deadline
    #[error("stream timeout for request {request_id} ({diagnostics})")]
    StreamTimeout {
        /// Request that timed out
        request_id: u16,
        /// Link counters at expiry
        diagnostics: StatsSnapshot,
    },

    /// A frame of a streamed response failed its CRC check
    #[error("stream for request {request_id} had {frames} corrupt frames")]
    StreamCorrupt {
        /// Request whose response was damaged
        request_id: u16,
        /// Corrupt frames seen
        frames: u32,
    },

    /// Chunk acknowledgment never arrived
    #[error("chunk at offset {offset} not acknowledged after {attempts} attempts")]
    ChunkTimeout {
        /// Offset of the unacknowledged chunk
        offset: u64,
        /// Attempts made
        attempts: u32,
    },

    /// Every response to a retried request was corrupt
    #[error("response corrupt after {attempts} attempts")]
    CorruptResponse {
        /// Attempts made
        attempts: u32,
    },

    /// Device kept acknowledging without advancing the confirmed offset
    #[error("upload stalled at offset {offset}")]
    Stalled {
        /// Confirmed offset that stopped moving
        offset: u64,
    },

    /// Cooperative cancellation observed
    #[error("canceled")]
    Canceled,

    /// Negotiated parameters cannot carry the request
    #[error("configuration error: {0}")]
    Config(String),

    /// Malformed payload
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// A waiter is already registered for this request id
    #[error("request {0} already has a waiter")]
    DuplicateWaiter(u16),
}

/// Result type alias using LinkError.
pub type Result<T> = std::result::Result<T, LinkError>;
