//! Device commands built on the request/response primitives of [`Link`].

use crate::error::{LinkError, Result};
use crate::link::Link;
use devlink_wire::{decode_info, decode_list, encode_path, Command, DeviceError, Frame, ListEntry};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Turn an error-flagged frame into [`LinkError::Device`]
fn check_device_error(frame: &Frame) -> Result<()> {
    if frame.is_error() {
        return Err(LinkError::Device(DeviceError::decode(&frame.payload)));
    }
    Ok(())
}

impl Link {
    /// Liveness probe; returns the round-trip time
    pub async fn ping(&self) -> Result<Duration> {
        let started = Instant::now();
        let frame = self
            .request(Command::Ping, &[], self.config.response_timeout, false)
            .await?;
        check_device_error(&frame)?;

        let rtt = started.elapsed();
        debug!("Ping RTT {:?}", rtt);
        Ok(rtt)
    }

    /// Query the device's max payload and adopt it.
    ///
    /// A reported value of 0 keeps the previous one. Returns the max payload
    /// in effect afterwards.
    pub async fn info(&self) -> Result<u32> {
        let frame = self
            .request(Command::Info, &[], self.config.response_timeout, false)
            .await?;
        check_device_error(&frame)?;

        let reported = decode_info(&frame.payload)?;
        if reported == 0 {
            warn!(
                "Device reported max payload 0, keeping {}",
                self.max_payload()
            );
        } else {
            self.set_max_payload(reported);
            info!("Device max payload {}", reported);
        }
        Ok(self.max_payload())
    }

    /// List a directory; the response may span several frames
    pub async fn list(&self, path: &str) -> Result<Vec<ListEntry>> {
        let payload = encode_path(path)?;
        let request_id = self.send(Command::List, &payload).await?;
        let listing = self
            .await_stream(request_id, self.config.list_timeout)
            .await?;

        let entries = decode_list(&listing)?;
        debug!("Listed {}: {} entries", path, entries.len());
        Ok(entries)
    }

    /// Delete a file.
    ///
    /// Responses with a bad CRC are accepted so they can trigger a resend;
    /// after `delete_attempts` corrupt responses the call fails. A device
    /// error is returned immediately.
    pub async fn delete(&self, path: &str) -> Result<()> {
        let payload = encode_path(path)?;
        let attempts = self.config.delete_attempts.max(1);

        for attempt in 1..=attempts {
            let frame = self
                .request(Command::Delete, &payload, self.config.response_timeout, true)
                .await?;
            if !frame.crc_ok {
                warn!(
                    "Corrupt delete response for {} (attempt {}/{})",
                    path, attempt, attempts
                );
                continue;
            }
            check_device_error(&frame)?;
            debug!("Deleted {}", path);
            return Ok(());
        }

        Err(LinkError::CorruptResponse { attempts })
    }

    /// Create a directory
    pub async fn mkdir(&self, path: &str) -> Result<()> {
        let payload = encode_path(path)?;
        let frame = self
            .request(Command::Mkdir, &payload, self.config.response_timeout, false)
            .await?;
        check_device_error(&frame)?;
        debug!("Created directory {}", path);
        Ok(())
    }

    /// Best-effort removal of a partially uploaded file
    pub async fn remove_partial(&self, path: &str) {
        match self.delete(path).await {
            Ok(()) => info!("Removed partial upload {}", path),
            Err(e) => warn!("Failed to remove partial upload {}: {}", path, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::LinkConfig;
    use crate::testing::FakeDevice;
    use devlink_wire::{decode_path, encode_list, EntryKind, Flags};

    fn device_error(code: u16, message: &str) -> Vec<u8> {
        DeviceError {
            code,
            message: message.to_string(),
        }
        .encode()
        .to_vec()
    }

    #[tokio::test]
    async fn test_ping() {
        let (link, mut device) = FakeDevice::pair(LinkConfig::default());
        let responder = tokio::spawn(async move {
            let request = device.recv().await;
            assert_eq!(request.command(), Some(Command::Ping));
            assert!(request.payload.is_empty());
            device.reply(&request, Flags::empty(), &[]).await;
            device
        });

        link.ping().await.unwrap();
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_ping_device_error() {
        let (link, mut device) = FakeDevice::pair(LinkConfig::default());
        let responder = tokio::spawn(async move {
            let request = device.recv().await;
            device
                .reply(&request, Flags::ERROR, &device_error(9, "busy"))
                .await;
            device
        });

        let err = link.ping().await.unwrap_err();
        assert!(matches!(err, LinkError::Device(e) if e.code == 9 && e.message == "busy"));
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_info_updates_max_payload() {
        let (link, mut device) = FakeDevice::pair(LinkConfig::default());
        assert_eq!(link.max_payload(), 4096);

        let responder = tokio::spawn(async move {
            let request = device.recv().await;
            device
                .reply(&request, Flags::empty(), &8192u32.to_le_bytes())
                .await;
            let request = device.recv().await;
            device.reply(&request, Flags::empty(), &0u32.to_le_bytes()).await;
            device
        });

        assert_eq!(link.info().await.unwrap(), 8192);
        assert_eq!(link.info().await.unwrap(), 8192);
        assert_eq!(link.max_payload(), 8192);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_info_short_payload_is_an_error() {
        let (link, mut device) = FakeDevice::pair(LinkConfig::default());
        let responder = tokio::spawn(async move {
            let request = device.recv().await;
            device.reply(&request, Flags::empty(), &[1, 2]).await;
            device
        });

        assert!(matches!(link.info().await, Err(LinkError::Wire(_))));
        assert_eq!(link.max_payload(), 4096);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_list_split_across_frames() {
        let entries = vec![
            ListEntry {
                name: "notes.txt".to_string(),
                kind: EntryKind::File,
                size: 1234,
            },
            ListEntry {
                name: "books".to_string(),
                kind: EntryKind::Directory,
                size: 0,
            },
            ListEntry {
                name: "a.epub".to_string(),
                kind: EntryKind::File,
                size: 1 << 33,
            },
        ];
        let encoded = encode_list(&entries).unwrap();

        let (link, mut device) = FakeDevice::pair(LinkConfig::default());
        let responder = tokio::spawn(async move {
            let request = device.recv().await;
            assert_eq!(request.command(), Some(Command::List));
            assert_eq!(decode_path(&request.payload).unwrap(), "/");

            let (head, tail) = encoded.split_at(7);
            device.reply(&request, Flags::CONTINUATION, head).await;
            device.reply(&request, Flags::END, tail).await;
            device
        });

        let listed = link.list("/").await.unwrap();
        assert_eq!(listed, entries);
        assert!(listed[1].is_dir());
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_list_device_error() {
        let (link, mut device) = FakeDevice::pair(LinkConfig::default());
        let responder = tokio::spawn(async move {
            let request = device.recv().await;
            device
                .reply(&request, Flags::CONTINUATION, &[2, 0])
                .await;
            device
                .reply(&request, Flags::ERROR, &device_error(2, "not found"))
                .await;
            device
        });

        let err = link.list("/missing").await.unwrap_err();
        assert!(matches!(err, LinkError::Device(e) if e.code == 2));
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_list_with_corrupt_middle_frame_fails() {
        let entries = vec![
            ListEntry {
                name: "first.txt".to_string(),
                kind: EntryKind::File,
                size: 10,
            },
            ListEntry {
                name: "second.txt".to_string(),
                kind: EntryKind::File,
                size: 20,
            },
        ];
        let encoded = encode_list(&entries).unwrap();

        let (link, mut device) = FakeDevice::pair(LinkConfig::default());
        let responder = tokio::spawn(async move {
            let request = device.recv().await;
            let (head, rest) = encoded.split_at(5);
            let (middle, tail) = rest.split_at(6);
            device.reply(&request, Flags::CONTINUATION, head).await;
            device
                .reply_corrupt(&request, Flags::CONTINUATION, middle)
                .await;
            device.reply(&request, Flags::END, tail).await;
            device
        });

        let err = link.list("/").await.unwrap_err();
        assert!(matches!(err, LinkError::StreamCorrupt { frames: 1, .. }));
        assert_eq!(link.stats().crc_errors, 1);
        assert_eq!(link.correlator().pending(), 0);
        responder.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_list_timeout_reports_diagnostics() {
        let (link, mut device) = FakeDevice::pair(LinkConfig::default());
        let responder = tokio::spawn(async move {
            let request = device.recv().await;
            device
                .reply(&request, Flags::CONTINUATION, &[1, 0])
                .await;
            device
        });

        let err = link.list("/").await.unwrap_err();
        match err {
            LinkError::StreamTimeout { diagnostics, .. } => {
                assert_eq!(diagnostics.frames_in, 1);
                assert_eq!(diagnostics.frames_out, 1);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_retries_corrupt_response() {
        let (link, mut device) = FakeDevice::pair(LinkConfig::default());
        let responder = tokio::spawn(async move {
            let first = device.recv().await;
            assert_eq!(decode_path(&first.payload).unwrap(), "/old.txt");
            device.reply_corrupt(&first, Flags::empty(), &[]).await;

            let second = device.recv().await;
            assert_eq!(second.payload, first.payload);
            device.reply(&second, Flags::empty(), &[]).await;
            device
        });

        link.delete("/old.txt").await.unwrap();
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_gives_up_after_corrupt_responses() {
        let (link, mut device) = FakeDevice::pair(LinkConfig::default());
        let responder = tokio::spawn(async move {
            for _ in 0..3 {
                let request = device.recv().await;
                device.reply_corrupt(&request, Flags::empty(), &[]).await;
            }
            device
        });

        let err = link.delete("/x").await.unwrap_err();
        assert!(matches!(err, LinkError::CorruptResponse { attempts: 3 }));
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_device_error_is_not_retried() {
        let (link, mut device) = FakeDevice::pair(LinkConfig::default());

        let id = tokio::spawn(async move {
            let request = device.recv().await;
            device
                .reply(&request, Flags::ERROR, &device_error(2, "no such file"))
                .await;
            let next = device.recv().await;
            device.reply(&next, Flags::empty(), &[]).await;
            next.command()
        });

        let err = link.delete("/nope").await.unwrap_err();
        assert!(matches!(err, LinkError::Device(e) if e.message == "no such file"));

        link.ping().await.unwrap();
        assert_eq!(id.await.unwrap(), Some(Command::Ping));
    }

    #[tokio::test]
    async fn test_mkdir() {
        let (link, mut device) = FakeDevice::pair(LinkConfig::default());
        let responder = tokio::spawn(async move {
            let request = device.recv().await;
            assert_eq!(request.command(), Some(Command::Mkdir));
            assert_eq!(decode_path(&request.payload).unwrap(), "/books");
            device.reply(&request, Flags::empty(), &[]).await;

            let request = device.recv().await;
            device
                .reply(&request, Flags::ERROR, &device_error(17, "exists"))
                .await;
            device
        });

        link.mkdir("/books").await.unwrap();
        let err = link.mkdir("/books").await.unwrap_err();
        assert!(matches!(err, LinkError::Device(e) if e.code == 17));
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_partial_swallows_errors() {
        let (link, mut device) = FakeDevice::pair(LinkConfig::default());
        let responder = tokio::spawn(async move {
            let request = device.recv().await;
            assert_eq!(request.command(), Some(Command::Delete));
            device
                .reply(&request, Flags::ERROR, &device_error(5, "io"))
                .await;
            device
        });

        link.remove_partial("/partial.bin").await;
        responder.await.unwrap();
    }
}
