//! Read loop, request correlation, streamed responses and chunked uploads for devlink.
//!
//! This crate turns a raw byte transport (USB CDC serial device or a TCP
//! bridge) into a concurrent request/response session with a device. A single
//! background task owns the read side: it scans frames out of the byte
//! stream, keeps link counters, and routes each frame by request id to
//! whichever caller is waiting for it.
//!
//! ## Features
//!
//! - **Correlation**: any number of requests in flight, matched by id
//! - **Early responses**: frames that beat their waiter are held and replayed
//! - **Streamed responses**: multi-frame listings aggregated into one payload
//! - **Uploads**: chunked, acknowledged, resumable from partial writes
//! - **Retries**: corrupt delete responses and missing chunk acks are resent
//!
//! ## Example
//!
//! ```rust,no_run
//! use devlink_session::{open_device, CancellationToken, Link, LinkConfig, DEFAULT_BAUD_RATE};
//!
//! # async fn example() -> devlink_session::Result<()> {
//! let stream = open_device("/dev/ttyACM0", DEFAULT_BAUD_RATE).await?;
//! let link = Link::open(stream, LinkConfig::default());
//!
//! link.ping().await?;
//! let max_payload = link.info().await?;
//! println!("device accepts {} byte payloads", max_payload);
//!
//! for entry in link.list("/").await? {
//!     println!("{} {}", entry.name, entry.size);
//! }
//!
//! let report = link
//!     .upload(
//!         "/books/a.epub",
//!         b"file contents",
//!         |p| println!("{:.0}%", p.fraction() * 100.0),
//!         &CancellationToken::new(),
//!     )
//!     .await?;
//! println!("sent {} chunks", report.chunks);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod commands;
pub mod correlator;
pub mod error;
pub mod link;
pub mod stats;
pub mod transport;
pub mod upload;

#[cfg(test)]
mod testing;

// Re-export main types
pub use correlator::{Correlator, Dispatch, Registration, StreamFailure, StreamResult};
pub use error::{LinkError, Result};
pub use link::{Link, LinkConfig};
pub use stats::{LinkStats, StatsSnapshot};
pub use transport::{connect_tcp, open_device, IoStream, DEFAULT_BAUD_RATE};
pub use upload::{
    chunk_size_for, ShortAckPolicy, TransferState, UploadProgress, UploadReport, MIN_CHUNK_SIZE,
};

pub use tokio_util::sync::CancellationToken;
