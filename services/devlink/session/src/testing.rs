//! In-process device double for tests.

use crate::link::{Link, LinkConfig};
use devlink_wire::{encode_frame, Flags, Frame, FrameScanner};
use std::collections::VecDeque;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

/// Far end of a duplex pipe, speaking the wire format
pub(crate) struct FakeDevice {
    stream: DuplexStream,
    scanner: FrameScanner,
    pending: VecDeque<Frame>,
}

impl FakeDevice {
    /// Open a link wired to a fresh fake device
    pub(crate) fn pair(config: LinkConfig) -> (Link, FakeDevice) {
        let (host, device) = tokio::io::duplex(256 * 1024);
        let link = Link::open(host, config);
        let device = FakeDevice {
            stream: device,
            scanner: FrameScanner::new(),
            pending: VecDeque::new(),
        };
        (link, device)
    }

    /// Next frame written by the host
    pub(crate) async fn recv(&mut self) -> Frame {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return frame;
            }
            let mut buf = [0u8; 4096];
            let n = self.stream.read(&mut buf).await.expect("device read");
            assert!(n > 0, "host closed the link");
            self.pending.extend(self.scanner.feed(&buf[..n]));
        }
    }

    /// Answer `request` with a response frame carrying `flags`
    pub(crate) async fn reply(&mut self, request: &Frame, flags: Flags, payload: &[u8]) {
        let bytes = encode_frame(
            request.command,
            request.request_id,
            payload,
            Flags::RESPONSE | flags,
        )
        .expect("encode reply");
        self.send_raw(&bytes).await;
    }

    /// Answer `request` with a frame whose CRC does not match
    pub(crate) async fn reply_corrupt(&mut self, request: &Frame, flags: Flags, payload: &[u8]) {
        let mut bytes = encode_frame(
            request.command,
            request.request_id,
            payload,
            Flags::RESPONSE | flags,
        )
        .expect("encode reply")
        .to_vec();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        self.send_raw(&bytes).await;
    }

    /// Write bytes to the host unchanged
    pub(crate) async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("device write");
        self.stream.flush().await.expect("device flush");
    }
}
