//! A session over one byte transport.
//!
//! [`Link::open`] splits the transport, spawns the read loop, and returns a
//! handle that any number of tasks can use concurrently. Writes are
//! serialized through a mutex so frames never interleave on the wire; reads
//! happen only in the background loop, which feeds the scanner and routes
//! every frame through the [`Correlator`].

use crate::correlator::{Correlator, Dispatch, StreamFailure};
use crate::error::{LinkError, Result};
use crate::stats::{LinkStats, StatsSnapshot};
use crate::upload::ShortAckPolicy;
use bytes::Bytes;
use devlink_wire::{
    encode_frame, Command, DeviceError, Flags, Frame, FrameScanner, DEFAULT_MAX_SCAN_PAYLOAD,
};
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Size of one transport read
const READ_CHUNK: usize = 4096;

/// Configuration for a link
#[derive(Clone, Debug)]
pub struct LinkConfig {
    /// Wait for single-frame responses (ping, info, delete, mkdir)
    pub response_timeout: Duration,
    /// Wait for a complete directory listing
    pub list_timeout: Duration,
    /// Wait for each chunk acknowledgment
    pub chunk_ack_timeout: Duration,
    /// Sends per chunk before giving up
    pub chunk_attempts: u32,
    /// Sends per delete while responses arrive corrupt
    pub delete_attempts: u32,
    /// Max payload assumed until the device reports one
    pub default_max_payload: u32,
    /// Unclaimed frames held for late waiters
    pub max_inbox_frames: usize,
    /// Non-advancing acknowledgments tolerated before an upload fails
    pub max_stalled_acks: u32,
    /// What a chunk acknowledgment without an offset means
    pub short_ack_policy: ShortAckPolicy,
    /// Largest payload length the scanner will believe
    pub max_frame_payload: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(2),
            list_timeout: Duration::from_secs(5),
            chunk_ack_timeout: Duration::from_secs(8),
            chunk_attempts: 3,
            delete_attempts: 3,
            default_max_payload: 4096,
            max_inbox_frames: 256,
            max_stalled_acks: 3,
            short_ack_policy: ShortAckPolicy::default(),
            max_frame_payload: DEFAULT_MAX_SCAN_PAYLOAD,
        }
    }
}

type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// Handle to an open session with a device
pub struct Link {
    pub(crate) config: LinkConfig,
    writer: Mutex<Writer>,
    correlator: Arc<Correlator>,
    stats: Arc<LinkStats>,
    next_id: AtomicU16,
    max_payload: AtomicU32,
    reader: JoinHandle<()>,
}

impl Link {
    /// Open a session over `stream` and start the read loop.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn open<S>(stream: S, config: LinkConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let correlator = Arc::new(Correlator::new(config.max_inbox_frames));
        let stats = Arc::new(LinkStats::default());

        let reader = tokio::spawn(run_reader(
            read_half,
            correlator.clone(),
            stats.clone(),
            config.max_frame_payload,
        ));

        debug!(
            "Link opened (response timeout {:?}, default max payload {})",
            config.response_timeout, config.default_max_payload
        );

        Self {
            max_payload: AtomicU32::new(config.default_max_payload),
            config,
            writer: Mutex::new(Box::new(write_half)),
            correlator,
            stats,
            next_id: AtomicU16::new(1),
            reader,
        }
    }

    /// Link configuration
    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Current counters
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Whether the read loop has stopped
    pub fn is_closed(&self) -> bool {
        self.correlator.is_closed()
    }

    /// Largest payload the device accepts, as last reported by Info
    pub fn max_payload(&self) -> u32 {
        self.max_payload.load(Ordering::Relaxed)
    }

    /// Override the negotiated max payload
    pub fn set_max_payload(&self, max_payload: u32) {
        self.max_payload.store(max_payload, Ordering::Relaxed);
    }

    pub(crate) fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    /// Allocate a request id. Ids wrap at 16 bits and never use 0.
    pub fn next_request_id(&self) -> u16 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    /// Send a request with a fresh id and return the id
    pub async fn send(&self, command: Command, payload: &[u8]) -> Result<u16> {
        let request_id = self.next_request_id();
        self.send_frame(command, request_id, payload, Flags::empty())
            .await?;
        Ok(request_id)
    }

    /// Write one frame with an explicit id and flags
    pub async fn send_frame(
        &self,
        command: Command,
        request_id: u16,
        payload: &[u8],
        flags: Flags,
    ) -> Result<()> {
        if self.correlator.is_closed() {
            return Err(LinkError::Closed);
        }

        let bytes = encode_frame(command, request_id, payload, flags)?;
        {
            let mut writer = self.writer.lock().await;
            writer.write_all(&bytes).await?;
            writer.flush().await?;
        }
        self.stats.record_tx(bytes.len());

        debug!(
            component = "tx",
            "TX {} cmd={:?} req={} len={}",
            flags.label(),
            command,
            request_id,
            payload.len()
        );
        Ok(())
    }

    /// Wait for the first response frame for `request_id`.
    ///
    /// Frames with a bad CRC are skipped unless `accept_corrupt` is set.
    /// Error-flagged frames are returned as-is; callers decide what they mean.
    pub async fn await_response(
        &self,
        request_id: u16,
        timeout: Duration,
        accept_corrupt: bool,
    ) -> Result<Frame> {
        let (_registration, rx) = self
            .correlator
            .register_single(request_id, accept_corrupt)?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) => Err(LinkError::Closed),
            Err(_) => Err(LinkError::Timeout {
                request_id,
                after: timeout,
            }),
        }
    }

    /// Wait for a streamed response and return the concatenated payloads
    pub async fn await_stream(&self, request_id: u16, timeout: Duration) -> Result<Bytes> {
        let (_registration, rx) = self.correlator.register_stream(request_id)?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(payload))) => Ok(payload),
            Ok(Ok(Err(StreamFailure::Device(device)))) => Err(LinkError::Device(device)),
            Ok(Ok(Err(StreamFailure::Corrupt { frames }))) => {
                warn!(
                    "Stream for req={} had {} corrupt frames, discarding response",
                    request_id, frames
                );
                Err(LinkError::StreamCorrupt { request_id, frames })
            }
            Ok(Err(_)) => Err(LinkError::Closed),
            Err(_) => {
                let diagnostics = self.stats.snapshot();
                warn!(
                    "Stream for req={} timed out after {:?}: {}",
                    request_id, timeout, diagnostics
                );
                Err(LinkError::StreamTimeout {
                    request_id,
                    diagnostics,
                })
            }
        }
    }

    /// Send a request and wait for its single-frame response
    pub async fn request(
        &self,
        command: Command,
        payload: &[u8],
        timeout: Duration,
        accept_corrupt: bool,
    ) -> Result<Frame> {
        let request_id = self.send(command, payload).await?;
        self.await_response(request_id, timeout, accept_corrupt)
            .await
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.reader.abort();
        self.correlator.close();
    }
}

async fn run_reader<R>(
    mut reader: R,
    correlator: Arc<Correlator>,
    stats: Arc<LinkStats>,
    max_frame_payload: usize,
) where
    R: AsyncRead + Unpin,
{
    let mut scanner = FrameScanner::with_max_payload(max_frame_payload);
    let mut buf = vec![0u8; READ_CHUNK];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                info!("Transport closed by peer");
                break;
            }
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!("Transport read failed: {}", e);
                break;
            }
        };

        let frames = scanner.feed(&buf[..n]);
        stats.record_scan(&scanner.stats());

        for frame in frames {
            log_inbound(&frame);
            if let Dispatch::Queued { evicted: true } = correlator.dispatch(frame) {
                stats.record_inbox_drop();
            }
        }
    }

    correlator.close();
    info!("Link read loop stopped. Stats: {}", stats.snapshot());
}

fn crc_marker(frame: &Frame) -> &'static str {
    if frame.crc_ok {
        ""
    } else {
        " |CRC"
    }
}

fn log_inbound(frame: &Frame) {
    debug!(
        component = "rx",
        "RX {} cmd=0x{:02x} req={} len={}{}",
        frame.flags.label(),
        frame.command,
        frame.request_id,
        frame.payload.len(),
        crc_marker(frame)
    );

    if let Some(message) = device_error_line(frame) {
        warn!("{}", message);
    }
}

/// Log line for an error-flagged frame, claimed or not. A corrupt payload is
/// still decoded best-effort and marked.
fn device_error_line(frame: &Frame) -> Option<String> {
    if !frame.is_error() {
        return None;
    }
    Some(format!(
        "Device error on req={}: {}{}",
        frame.request_id,
        DeviceError::decode(&frame.payload),
        crc_marker(frame)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeDevice;

    #[tokio::test]
    async fn test_request_ids_skip_zero() {
        let (link, _device) = FakeDevice::pair(LinkConfig::default());
        link.next_id.store(u16::MAX, Ordering::Relaxed);

        assert_eq!(link.next_request_id(), u16::MAX);
        assert_eq!(link.next_request_id(), 1);
        assert_eq!(link.next_request_id(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_requests_resolve_by_id() {
        let (link, mut device) = FakeDevice::pair(LinkConfig::default());
        let link = Arc::new(link);

        let mut ids = Vec::new();
        for _ in 0..8 {
            ids.push(link.send(Command::Ping, &[]).await.unwrap());
        }
        let mut requests = Vec::new();
        for _ in 0..8 {
            requests.push(device.recv().await);
        }

        let waits: Vec<_> = ids
            .iter()
            .map(|&id| {
                let link = link.clone();
                tokio::spawn(async move {
                    link.await_response(id, Duration::from_secs(5), false).await
                })
            })
            .collect();

        for request in requests.iter().rev() {
            device
                .reply(request, Flags::empty(), &request.request_id.to_le_bytes())
                .await;
        }

        for (id, wait) in ids.iter().zip(waits) {
            let frame = wait.await.unwrap().unwrap();
            assert_eq!(frame.request_id, *id);
            assert_eq!(&frame.payload[..], &id.to_le_bytes());
        }
        assert_eq!(link.correlator().pending(), 0);
        assert_eq!(link.correlator().queued(), 0);
    }

    #[tokio::test]
    async fn test_early_response_is_replayed() {
        let (link, mut device) = FakeDevice::pair(LinkConfig::default());

        let id = link.send(Command::Ping, &[]).await.unwrap();
        let request = device.recv().await;
        device.reply(&request, Flags::empty(), b"pong").await;

        while link.correlator().queued() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let frame = link
            .await_response(id, Duration::from_secs(1), false)
            .await
            .unwrap();
        assert_eq!(&frame.payload[..], b"pong");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_deregisters_waiter() {
        let (link, mut device) = FakeDevice::pair(LinkConfig::default());

        let id = link.send(Command::Ping, &[]).await.unwrap();
        let request = device.recv().await;

        let err = link
            .await_response(id, Duration::from_millis(100), false)
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::Timeout { request_id, .. } if request_id == id));
        assert_eq!(link.correlator().pending(), 0);

        device.reply(&request, Flags::empty(), b"late").await;
        while link.correlator().queued() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    #[tokio::test]
    async fn test_corrupt_response_skipped_for_strict_waiter() {
        let (link, mut device) = FakeDevice::pair(LinkConfig::default());

        let id = link.send(Command::Ping, &[]).await.unwrap();
        let request = device.recv().await;
        device.reply_corrupt(&request, Flags::empty(), b"bad").await;
        device.reply(&request, Flags::empty(), b"good").await;

        let frame = link
            .await_response(id, Duration::from_secs(1), false)
            .await
            .unwrap();
        assert!(frame.crc_ok);
        assert_eq!(&frame.payload[..], b"good");
        assert_eq!(link.stats().crc_errors, 1);
    }

    #[tokio::test]
    async fn test_noise_between_frames_is_skipped() {
        let (link, mut device) = FakeDevice::pair(LinkConfig::default());

        let id = link.send(Command::Ping, &[]).await.unwrap();
        let request = device.recv().await;
        device.send_raw(&[0x00, 0xff, 0x13, 0x52]).await;
        device.reply(&request, Flags::empty(), b"").await;

        let frame = link
            .await_response(id, Duration::from_secs(1), false)
            .await
            .unwrap();
        assert_eq!(frame.request_id, id);
        assert!(link.stats().bad_magic >= 1);
    }

    #[tokio::test]
    async fn test_eof_closes_link() {
        let (link, mut device) = FakeDevice::pair(LinkConfig::default());

        let id = link.send(Command::Ping, &[]).await.unwrap();
        device.recv().await;
        drop(device);

        let err = link
            .await_response(id, Duration::from_secs(5), false)
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::Closed));
        assert!(link.is_closed());
        assert!(matches!(
            link.send(Command::Ping, &[]).await,
            Err(LinkError::Closed)
        ));
    }

    #[test]
    fn test_device_error_line_includes_corrupt_frames() {
        let error = DeviceError {
            code: 2,
            message: "not found".to_string(),
        };
        let mut frame = Frame::new(
            Command::Delete,
            4,
            error.encode(),
            Flags::RESPONSE | Flags::ERROR,
        );
        assert_eq!(
            device_error_line(&frame).as_deref(),
            Some(format!("Device error on req=4: {}", error).as_str())
        );

        frame.crc_ok = false;
        let line = device_error_line(&frame).unwrap();
        assert!(line.starts_with("Device error on req=4: "));
        assert!(line.ends_with(" |CRC"));

        frame.flags = Flags::RESPONSE;
        assert!(device_error_line(&frame).is_none());
    }

    #[tokio::test]
    async fn test_tx_counters() {
        let (link, mut device) = FakeDevice::pair(LinkConfig::default());
        link.send(Command::Ping, &[]).await.unwrap();
        link.send(Command::Info, &[]).await.unwrap();
        device.recv().await;
        device.recv().await;

        let stats = link.stats();
        assert_eq!(stats.frames_out, 2);
        assert_eq!(stats.tx_bytes, 30);
    }
}
