//! Link counters shared between the read loop and callers.

use devlink_wire::ScanStats;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters for one link
#[derive(Debug, Default)]
pub struct LinkStats {
    rx_bytes: AtomicU64,
    tx_bytes: AtomicU64,
    frames_in: AtomicU64,
    frames_out: AtomicU64,
    crc_errors: AtomicU64,
    bad_magic: AtomicU64,
    bad_version: AtomicU64,
    oversize: AtomicU64,
    inbox_dropped: AtomicU64,
}

/// Point-in-time copy of [`LinkStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Bytes read from the transport
    pub rx_bytes: u64,
    /// Bytes written to the transport
    pub tx_bytes: u64,
    /// Frames decoded (valid or not)
    pub frames_in: u64,
    /// Frames written
    pub frames_out: u64,
    /// Frames with a CRC mismatch
    pub crc_errors: u64,
    /// Resyncs on a bad magic
    pub bad_magic: u64,
    /// Resyncs on an unsupported version
    pub bad_version: u64,
    /// Resyncs on an implausible length
    pub oversize: u64,
    /// Unclaimed frames evicted from the inbox
    pub inbox_dropped: u64,
}

impl LinkStats {
    /// Mirror the read loop's scanner counters
    pub(crate) fn record_scan(&self, scan: &ScanStats) {
        self.rx_bytes.store(scan.rx_bytes, Ordering::Relaxed);
        self.frames_in.store(scan.frames, Ordering::Relaxed);
        self.crc_errors.store(scan.crc_errors, Ordering::Relaxed);
        self.bad_magic.store(scan.bad_magic, Ordering::Relaxed);
        self.bad_version.store(scan.bad_version, Ordering::Relaxed);
        self.oversize.store(scan.oversize, Ordering::Relaxed);
    }

    pub(crate) fn record_tx(&self, bytes: usize) {
        self.tx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.frames_out.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_inbox_drop(&self) {
        self.inbox_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the current values
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            frames_in: self.frames_in.load(Ordering::Relaxed),
            frames_out: self.frames_out.load(Ordering::Relaxed),
            crc_errors: self.crc_errors.load(Ordering::Relaxed),
            bad_magic: self.bad_magic.load(Ordering::Relaxed),
            bad_version: self.bad_version.load(Ordering::Relaxed),
            oversize: self.oversize.load(Ordering::Relaxed),
            inbox_dropped: self.inbox_dropped.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rx={} tx={} frames_in={} frames_out={} crc={} magic={} ver={} oversize={} inbox_dropped={}",
            self.rx_bytes,
            self.tx_bytes,
            self.frames_in,
            self.frames_out,
            self.crc_errors,
            self.bad_magic,
            self.bad_version,
            self.oversize,
            self.inbox_dropped
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_updates() {
        let stats = LinkStats::default();
        stats.record_scan(&ScanStats {
            rx_bytes: 100,
            frames: 3,
            crc_errors: 1,
            bad_magic: 2,
            bad_version: 1,
            oversize: 0,
            discarded_bytes: 9,
        });
        stats.record_tx(15);
        stats.record_tx(20);
        stats.record_inbox_drop();

        let snap = stats.snapshot();
        assert_eq!(snap.rx_bytes, 100);
        assert_eq!(snap.frames_in, 3);
        assert_eq!(snap.tx_bytes, 35);
        assert_eq!(snap.frames_out, 2);
        assert_eq!(snap.crc_errors, 1);
        assert_eq!(snap.bad_magic, 2);
        assert_eq!(snap.inbox_dropped, 1);
        assert!(snap.to_string().contains("crc=1 magic=2 ver=1"));
    }
}
