//! Chunked file upload.
//!
//! A file travels as a sequence of WriteChunk frames sharing one request id.
//! Every chunk waits for an acknowledgment carrying the offset the device
//! has durably written; the next chunk starts there, so a partial write is
//! simply resent from the confirmed offset.
//!
//! ```text
//! Idle -> Sending{offset} -> Sending{offset'} -> ... -> Done
//!              |
//!              +--> Failed (timeout, device error, stall)
//!              +--> Canceled (token observed between chunks)
//! ```

use crate::error::{LinkError, Result};
use crate::link::Link;
use devlink_wire::{
    chunk_overhead, decode_chunk_ack, encode_chunk, Command, DeviceError, Flags, Frame,
    WireError,
};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Smallest chunk the engine will send, whatever the device reports
pub const MIN_CHUNK_SIZE: usize = 512;

/// Interpretation of an acknowledgment too short to carry an offset
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShortAckPolicy {
    /// Assume the whole chunk was written
    #[default]
    AssumeFullChunk,
    /// Fail the upload
    Reject,
}

/// Progress reported after every acknowledged chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadProgress {
    /// Bytes the device has confirmed
    pub confirmed_offset: u64,
    /// File size
    pub total_len: u64,
}

impl UploadProgress {
    /// Completed fraction in `0.0..=1.0`
    pub fn fraction(&self) -> f64 {
        if self.total_len == 0 {
            return 1.0;
        }
        self.confirmed_offset as f64 / self.total_len as f64
    }
}

/// Summary of a finished upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReport {
    /// Request id shared by every chunk
    pub request_id: u16,
    /// Bytes confirmed by the device
    pub bytes: u64,
    /// Chunks acknowledged
    pub chunks: u32,
    /// Chunk resends after a timeout
    pub retries: u32,
    /// Wall time
    pub elapsed: Duration,
}

/// Lifecycle of one transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    /// Not started
    Idle,
    /// Chunks in flight; `offset` is the confirmed offset
    Sending {
        /// Confirmed offset
        offset: u64,
    },
    /// Device confirmed the whole file
    Done,
    /// Aborted on error
    Failed,
    /// Aborted by the caller
    Canceled,
}

/// Largest chunk of file data that fits the negotiated max payload
pub fn chunk_size_for(max_payload: u32, path: &str) -> Result<usize> {
    let overhead = chunk_overhead(path);
    let room = max_payload as usize;
    if room <= overhead {
        return Err(LinkError::Config(format!(
            "max payload {} leaves no room for data after {} bytes of chunk metadata",
            max_payload, overhead
        )));
    }
    Ok((room - overhead).max(MIN_CHUNK_SIZE))
}

struct Transfer<'a> {
    path: &'a str,
    data: &'a [u8],
    total_len: u32,
    chunk_size: usize,
    request_id: u16,
    state: TransferState,
    chunks: u32,
    retries: u32,
    stalled: u32,
}

impl Transfer<'_> {
    fn transition(&mut self, next: TransferState) {
        debug!(
            "Transfer req={} {:?} -> {:?}",
            self.request_id, self.state, next
        );
        self.state = next;
    }

    fn offset(&self) -> u64 {
        match self.state {
            TransferState::Sending { offset } => offset,
            TransferState::Done => self.total_len as u64,
            _ => 0,
        }
    }

    fn fail(&mut self, err: LinkError) -> LinkError {
        let next = if matches!(err, LinkError::Canceled) {
            TransferState::Canceled
        } else {
            TransferState::Failed
        };
        warn!(
            "Upload of {} stopped at offset {}: {}",
            self.path,
            self.offset(),
            err
        );
        self.transition(next);
        err
    }
}

impl Link {
    /// Upload `data` to `path` on the device.
    ///
    /// `progress` runs after every acknowledged chunk. `cancel` is checked
    /// before each chunk; a chunk already in flight is not interrupted. On
    /// failure the device may hold a partial file, see
    /// [`remove_partial`](Link::remove_partial).
    pub async fn upload(
        &self,
        path: &str,
        data: &[u8],
        mut progress: impl FnMut(UploadProgress),
        cancel: &CancellationToken,
    ) -> Result<UploadReport> {
        let total_len = u32::try_from(data.len()).map_err(|_| {
            LinkError::Config(format!(
                "file of {} bytes exceeds the 32-bit transfer length",
                data.len()
            ))
        })?;
        if path.len() > u16::MAX as usize {
            return Err(WireError::PathTooLong(path.len()).into());
        }
        let chunk_size = chunk_size_for(self.max_payload(), path)?;

        let started = Instant::now();
        let mut transfer = Transfer {
            path,
            data,
            total_len,
            chunk_size,
            request_id: self.next_request_id(),
            state: TransferState::Idle,
            chunks: 0,
            retries: 0,
            stalled: 0,
        };

        info!(
            "Uploading {} bytes to {} (req={}, chunk size {})",
            total_len, path, transfer.request_id, chunk_size
        );
        if total_len == 0 {
            warn!("Empty upload to {}; no chunks sent", path);
        }

        transfer.transition(TransferState::Sending { offset: 0 });
        while transfer.offset() < total_len as u64 {
            if let Err(e) = self.send_next_chunk(&mut transfer, cancel).await {
                return Err(transfer.fail(e));
            }
            progress(UploadProgress {
                confirmed_offset: transfer.offset(),
                total_len: total_len as u64,
            });
        }
        transfer.transition(TransferState::Done);

        let report = UploadReport {
            request_id: transfer.request_id,
            bytes: total_len as u64,
            chunks: transfer.chunks,
            retries: transfer.retries,
            elapsed: started.elapsed(),
        };
        info!(
            "Uploaded {} ({} bytes, {} chunks, {} retries) in {:?}",
            path, report.bytes, report.chunks, report.retries, report.elapsed
        );
        Ok(report)
    }

    async fn send_next_chunk(
        &self,
        transfer: &mut Transfer<'_>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(LinkError::Canceled);
        }

        let offset = transfer.offset();
        let total = transfer.total_len as u64;
        let end = (offset + transfer.chunk_size as u64).min(total);
        let data = &transfer.data[offset as usize..end as usize];
        let payload = encode_chunk(
            transfer.path,
            transfer.total_len,
            offset,
            data,
            transfer.chunks == 0,
        )?;
        let flags = if end == total {
            Flags::END
        } else {
            Flags::CONTINUATION
        };

        let ack = self
            .exchange_chunk(transfer, &payload, flags, offset)
            .await?;
        if ack.is_error() {
            return Err(LinkError::Device(DeviceError::decode(&ack.payload)));
        }

        let confirmed = match decode_chunk_ack(&ack.payload) {
            Some(written) => written as u64,
            None => match self.config.short_ack_policy {
                ShortAckPolicy::AssumeFullChunk => {
                    warn!(
                        "Ack for offset {} carries no offset, assuming {} bytes written",
                        offset,
                        end - offset
                    );
                    end
                }
                ShortAckPolicy::Reject => {
                    return Err(WireError::Truncated {
                        field: "chunk ack offset",
                        need: 4,
                        have: ack.payload.len(),
                    }
                    .into())
                }
            },
        };
        let next = confirmed.min(total);

        if next <= offset {
            transfer.stalled += 1;
            warn!(
                "Device confirmed {} after chunk at {} ({}/{} stalled acks)",
                next, offset, transfer.stalled, self.config.max_stalled_acks
            );
            if transfer.stalled >= self.config.max_stalled_acks {
                return Err(LinkError::Stalled { offset });
            }
        } else {
            transfer.stalled = 0;
        }
        if next < end {
            debug!(
                "Partial write at {}: device confirmed {} of {}",
                offset, next, end
            );
        }

        transfer.chunks += 1;
        transfer.transition(TransferState::Sending { offset: next });
        Ok(())
    }

    /// Send one chunk and wait for its acknowledgment, resending on timeout.
    ///
    /// Acks are accepted even with a bad CRC: the offset inside is the only
    /// thing read and a wrong one is corrected by the next ack.
    async fn exchange_chunk(
        &self,
        transfer: &mut Transfer<'_>,
        payload: &[u8],
        flags: Flags,
        offset: u64,
    ) -> Result<Frame> {
        let attempts = self.config.chunk_attempts.max(1);
        let request_id = transfer.request_id;

        for attempt in 1..=attempts {
            let stale = self.correlator().discard_inbox(request_id);
            if stale > 0 {
                debug!("Discarded {} stale acks for req={}", stale, request_id);
            }

            self.send_frame(Command::WriteChunk, request_id, payload, flags)
                .await?;
            match self.await_chunk_ack(request_id, offset).await {
                Ok(ack) => return Ok(ack),
                Err(LinkError::Timeout { .. }) if attempt < attempts => {
                    transfer.retries += 1;
                    warn!(
                        "No ack for chunk at {} (attempt {}/{}), resending",
                        offset, attempt, attempts
                    );
                }
                Err(LinkError::Timeout { .. }) => break,
                Err(e) => return Err(e),
            }
        }

        Err(LinkError::ChunkTimeout { offset, attempts })
    }

    /// Wait up to `chunk_ack_timeout` for an ack that does not point behind
    /// `offset`.
    ///
    /// An ack confirming less than `offset` answers an earlier chunk and
    /// arrived after that chunk's inbox was discarded; it is dropped. An ack
    /// confirming exactly `offset` is ambiguous with a zero-byte write and is
    /// left to the stall guard.
    async fn await_chunk_ack(&self, request_id: u16, offset: u64) -> Result<Frame> {
        let deadline = tokio::time::Instant::now() + self.config.chunk_ack_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let ack = self.await_response(request_id, remaining, true).await?;
            match decode_chunk_ack(&ack.payload) {
                Some(confirmed) if !ack.is_error() && u64::from(confirmed) < offset => {
                    debug!(
                        "Dropping stale ack for req={}: confirmed {} is behind chunk at {}",
                        request_id, confirmed, offset
                    );
                }
                _ => return Ok(ack),
            }
        }
    }
}
