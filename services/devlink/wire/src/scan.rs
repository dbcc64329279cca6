//! Resynchronizing frame scanner.
//!
//! The scanner owns the receive-side accumulator. Each call to
//! [`FrameScanner::feed`] appends transport bytes and extracts every complete
//! frame. Garbage in front of a frame (line noise, power-on glitches, a
//! partial write) is skipped by searching for the next magic pair. Frames
//! whose CRC does not match are still emitted, marked `crc_ok = false`, so
//! callers can count them and decide whether to accept them.

use crate::frame::{crc32, Frame};
use crate::header::{FrameHeader, CRC_SIZE, HEADER_SIZE, MAGIC_BYTES, MIN_FRAME_SIZE, WIRE_VERSION};
use bytes::{Buf, BytesMut};
use tracing::{debug, trace, warn};

/// Largest payload the scanner will wait for (16 MiB)
pub const DEFAULT_MAX_SCAN_PAYLOAD: usize = 16 * 1024 * 1024;

/// Why the scanner skipped bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResyncReason {
    /// First two bytes are not the magic
    BadMagic,
    /// Magic matched but the version byte did not
    BadVersion(u8),
    /// Declared payload length exceeds the scanner limit
    Oversize(u32),
}

/// Receive-side diagnostic counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    /// Bytes fed into the scanner
    pub rx_bytes: u64,
    /// Frames emitted (valid or not)
    pub frames: u64,
    /// Frames whose CRC did not match
    pub crc_errors: u64,
    /// Resyncs caused by a bad magic
    pub bad_magic: u64,
    /// Resyncs caused by an unsupported version
    pub bad_version: u64,
    /// Resyncs caused by an implausible length
    pub oversize: u64,
    /// Bytes thrown away while resynchronizing
    pub discarded_bytes: u64,
}

/// Extract all complete frames from the head of `buf`.
///
/// Consumed bytes are removed from `buf`; an incomplete trailing frame is
/// left in place for the next call. No partial frame is ever emitted.
pub fn scan(buf: &mut BytesMut, stats: &mut ScanStats, max_payload: usize) -> Vec<Frame> {
    let mut frames = Vec::new();

    while buf.len() >= MIN_FRAME_SIZE {
        if buf[..2] != MAGIC_BYTES {
            stats.bad_magic += 1;
            resync(buf, stats, ResyncReason::BadMagic);
            continue;
        }

        if buf[2] != WIRE_VERSION {
            stats.bad_version += 1;
            let reason = ResyncReason::BadVersion(buf[2]);
            resync(buf, stats, reason);
            continue;
        }

        let Some(header) = FrameHeader::decode(&buf[..HEADER_SIZE]) else {
            break;
        };

        let payload_len = header.payload_len as usize;
        if payload_len > max_payload {
            stats.oversize += 1;
            resync(buf, stats, ResyncReason::Oversize(header.payload_len));
            continue;
        }

        let total = HEADER_SIZE + payload_len + CRC_SIZE;
        if buf.len() < total {
            trace!(
                "Partial frame: have {} of {} bytes (req={})",
                buf.len(),
                total,
                header.request_id
            );
            break;
        }

        let body_len = HEADER_SIZE + payload_len;
        let expected = (&buf[body_len..total]).get_u32_le();
        let actual = crc32(&buf[..body_len]);
        let crc_ok = expected == actual;

        if !crc_ok {
            stats.crc_errors += 1;
            if stats.crc_errors % 5 == 1 {
                warn!(
                    "CRC mismatch ({} total): req={} cmd=0x{:02x} expected={:08x} actual={:08x}",
                    stats.crc_errors, header.request_id, header.command, expected, actual
                );
            }
        }

        let mut frame_bytes = buf.split_to(total).freeze();
        frame_bytes.advance(HEADER_SIZE);
        frame_bytes.truncate(payload_len);

        stats.frames += 1;
        frames.push(Frame {
            flags: header.flags,
            command: header.command,
            request_id: header.request_id,
            payload: frame_bytes,
            crc_ok,
        });
    }

    frames
}

/// Skip to the next magic pair after the first byte.
///
/// With no pair in the buffer everything is dropped, except a trailing first
/// magic byte whose partner may still be in flight.
fn resync(buf: &mut BytesMut, stats: &mut ScanStats, reason: ResyncReason) {
    let skip = match buf[1..].windows(2).position(|w| w == MAGIC_BYTES) {
        Some(pos) => pos + 1,
        None if buf[buf.len() - 1] == MAGIC_BYTES[0] => buf.len() - 1,
        None => buf.len(),
    };

    debug!("Resync ({:?}): skipping {} bytes", reason, skip);
    stats.discarded_bytes += skip as u64;
    buf.advance(skip);
}

/// Owns the receive accumulator and its counters
#[derive(Debug)]
pub struct FrameScanner {
    buf: BytesMut,
    stats: ScanStats,
    max_payload: usize,
}

impl FrameScanner {
    /// Create a scanner with the default payload limit
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_SCAN_PAYLOAD)
    }

    /// Create a scanner that resyncs past frames declaring more than `max_payload` bytes
    pub fn with_max_payload(max_payload: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(64 * 1024),
            stats: ScanStats::default(),
            max_payload,
        }
    }

    /// Append transport bytes and return every complete frame
    pub fn feed(&mut self, data: &[u8]) -> Vec<Frame> {
        self.stats.rx_bytes += data.len() as u64;
        self.buf.extend_from_slice(data);
        scan(&mut self.buf, &mut self.stats, self.max_payload)
    }

    /// Bytes waiting for the rest of a frame
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Counters since creation
    pub fn stats(&self) -> ScanStats {
        self.stats
    }
}

impl Default for FrameScanner {
    fn default() -> Self {
        Self::new()
    }
}
