//! Request/response correlation.
//!
//! The read loop hands every decoded frame to [`Correlator::dispatch`], which
//! looks up the waiter registered for the frame's request id. A frame that
//! arrives before its waiter (the transport is faster than the caller) is
//! parked in a per-id inbox and replayed, oldest first, the moment a waiter
//! for that id registers.
//!
//! Two kinds of waiter exist:
//!
//! - *single*: resolves with the first acceptable frame
//! - *aggregate*: collects payloads until a terminal frame, then resolves
//!   with their concatenation (streamed responses such as directory listings).
//!   A corrupt frame anywhere in the stream fails the whole response; its
//!   bytes are never spliced into the result.

use crate::error::{LinkError, Result};
use bytes::{Bytes, BytesMut};
use devlink_wire::{DeviceError, Frame};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

/// Why a streamed response did not produce a payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFailure {
    /// The device answered with an error-flagged frame
    Device(DeviceError),
    /// At least one frame of the stream failed its CRC check
    Corrupt {
        /// Corrupt frames seen before the stream ended
        frames: u32,
    },
}

/// Outcome of a streamed response
pub type StreamResult = std::result::Result<Bytes, StreamFailure>;

enum Waiter {
    Single {
        accept_corrupt: bool,
        tx: oneshot::Sender<Frame>,
    },
    Aggregate {
        parts: Vec<Bytes>,
        corrupt: u32,
        tx: oneshot::Sender<StreamResult>,
    },
}

enum Step {
    /// Waiter resolved; drop it
    Done,
    /// Frame consumed, waiter needs more
    Continue(Waiter),
    /// Frame refused, waiter unchanged
    Declined(Waiter),
}

impl Waiter {
    fn offer(self, frame: Frame) -> Step {
        match self {
            Waiter::Single { accept_corrupt, tx } => {
                if !frame.crc_ok && !accept_corrupt {
                    return Step::Declined(Waiter::Single { accept_corrupt, tx });
                }
                let _ = tx.send(frame);
                Step::Done
            }
            Waiter::Aggregate {
                mut parts,
                mut corrupt,
                tx,
            } => {
                if !frame.crc_ok {
                    corrupt += 1;
                    if frame.flags.is_terminal() {
                        let _ = tx.send(Err(StreamFailure::Corrupt { frames: corrupt }));
                        return Step::Done;
                    }
                    return Step::Declined(Waiter::Aggregate { parts, corrupt, tx });
                }
                if frame.is_error() {
                    let _ = tx.send(Err(StreamFailure::Device(DeviceError::decode(
                        &frame.payload,
                    ))));
                    return Step::Done;
                }

                let terminal = frame.flags.is_terminal();
                if corrupt > 0 {
                    if terminal {
                        let _ = tx.send(Err(StreamFailure::Corrupt { frames: corrupt }));
                        return Step::Done;
                    }
                    return Step::Continue(Waiter::Aggregate { parts, corrupt, tx });
                }

                parts.push(frame.payload);
                if !terminal {
                    return Step::Continue(Waiter::Aggregate { parts, corrupt, tx });
                }

                let total = parts.iter().map(Bytes::len).sum();
                let mut out = BytesMut::with_capacity(total);
                for part in &parts {
                    out.extend_from_slice(part);
                }
                let _ = tx.send(Ok(out.freeze()));
                Step::Done
            }
        }
    }
}

struct Entry {
    token: u64,
    waiter: Waiter,
}

#[derive(Default)]
struct Registry {
    waiters: HashMap<u16, Entry>,
    inbox: HashMap<u16, VecDeque<Frame>>,
    /// Request ids of queued frames in arrival order, for eviction
    order: VecDeque<u16>,
    closed: bool,
}

impl Registry {
    fn take_queue(&mut self, id: u16) -> Option<VecDeque<Frame>> {
        let queue = self.inbox.remove(&id)?;
        self.order.retain(|&queued| queued != id);
        Some(queue)
    }

    fn evict_oldest(&mut self) -> Option<Frame> {
        let id = self.order.pop_front()?;
        let queue = self.inbox.get_mut(&id)?;
        let frame = queue.pop_front();
        if queue.is_empty() {
            self.inbox.remove(&id);
        }
        frame
    }
}

/// What happened to a dispatched frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// A waiter took the frame
    Delivered,
    /// A waiter exists but refused the frame (corrupt)
    Declined,
    /// No waiter yet; frame parked in the inbox
    Queued {
        /// Whether an older frame was evicted to make room
        evicted: bool,
    },
    /// Link closed; frame dropped
    Dropped,
}

/// Waiter registry and inbox shared by the read loop and callers
pub struct Correlator {
    registry: Mutex<Registry>,
    next_token: AtomicU64,
    max_inbox: usize,
}

impl Correlator {
    /// Create a correlator holding at most `max_inbox` unclaimed frames
    pub fn new(max_inbox: usize) -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            next_token: AtomicU64::new(1),
            max_inbox: max_inbox.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a waiter for the first frame with `request_id`.
    ///
    /// Corrupt frames are only delivered when `accept_corrupt` is set.
    pub fn register_single(
        &self,
        request_id: u16,
        accept_corrupt: bool,
    ) -> Result<(Registration<'_>, oneshot::Receiver<Frame>)> {
        let (tx, rx) = oneshot::channel();
        let registration = self.register(request_id, Waiter::Single { accept_corrupt, tx })?;
        Ok((registration, rx))
    }

    /// Register a waiter that aggregates a streamed response for `request_id`
    pub fn register_stream(
        &self,
        request_id: u16,
    ) -> Result<(Registration<'_>, oneshot::Receiver<StreamResult>)> {
        let (tx, rx) = oneshot::channel();
        let waiter = Waiter::Aggregate {
            parts: Vec::new(),
            corrupt: 0,
            tx,
        };
        let registration = self.register(request_id, waiter)?;
        Ok((registration, rx))
    }

    fn register(&self, request_id: u16, waiter: Waiter) -> Result<Registration<'_>> {
        let mut registry = self.lock();
        if registry.closed {
            return Err(LinkError::Closed);
        }
        if registry.waiters.contains_key(&request_id) {
            return Err(LinkError::DuplicateWaiter(request_id));
        }

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let mut waiter = Some(waiter);

        if let Some(queue) = registry.take_queue(request_id) {
            let queued = queue.len();
            let mut replayed = 0;
            for frame in queue {
                let Some(current) = waiter.take() else {
                    break;
                };
                replayed += 1;
                match current.offer(frame) {
                    Step::Done => {}
                    Step::Continue(next) | Step::Declined(next) => waiter = Some(next),
                }
            }
            debug!(
                "Replayed {} of {} queued frames for req={}",
                replayed, queued, request_id
            );
        }

        if let Some(waiter) = waiter {
            registry.waiters.insert(request_id, Entry { token, waiter });
        }

        Ok(Registration {
            correlator: self,
            request_id,
            token,
        })
    }

    /// Route a frame to its waiter, or park it in the inbox
    pub fn dispatch(&self, frame: Frame) -> Dispatch {
        let mut registry = self.lock();
        if registry.closed {
            return Dispatch::Dropped;
        }

        let request_id = frame.request_id;
        if let Some(Entry { token, waiter }) = registry.waiters.remove(&request_id) {
            return match waiter.offer(frame) {
                Step::Done => Dispatch::Delivered,
                Step::Continue(waiter) => {
                    registry.waiters.insert(request_id, Entry { token, waiter });
                    Dispatch::Delivered
                }
                Step::Declined(waiter) => {
                    registry.waiters.insert(request_id, Entry { token, waiter });
                    trace!("Waiter for req={} declined corrupt frame", request_id);
                    Dispatch::Declined
                }
            };
        }

        let mut evicted = false;
        if registry.order.len() >= self.max_inbox {
            if let Some(old) = registry.evict_oldest() {
                warn!(
                    "Inbox full, dropping unclaimed frame req={} cmd=0x{:02x}",
                    old.request_id, old.command
                );
                evicted = true;
            }
        }

        registry.inbox.entry(request_id).or_default().push_back(frame);
        registry.order.push_back(request_id);
        Dispatch::Queued { evicted }
    }

    /// Drop every unclaimed frame for `request_id`
    pub fn discard_inbox(&self, request_id: u16) -> usize {
        self.lock()
            .take_queue(request_id)
            .map(|queue| queue.len())
            .unwrap_or(0)
    }

    /// Fail all waiters and refuse new registrations
    pub fn close(&self) {
        let mut registry = self.lock();
        registry.closed = true;
        let pending = registry.waiters.len();
        registry.waiters.clear();
        registry.inbox.clear();
        registry.order.clear();
        if pending > 0 {
            debug!("Closed correlator with {} pending waiters", pending);
        }
    }

    /// Whether [`close`](Self::close) has run
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of registered waiters
    pub fn pending(&self) -> usize {
        self.lock().waiters.len()
    }

    /// Number of unclaimed frames
    pub fn queued(&self) -> usize {
        self.lock().order.len()
    }

    fn deregister(&self, request_id: u16, token: u64) {
        let mut registry = self.lock();
        if registry
            .waiters
            .get(&request_id)
            .is_some_and(|entry| entry.token == token)
        {
            registry.waiters.remove(&request_id);
            trace!("Deregistered waiter for req={}", request_id);
        }
    }
}

/// Keeps a waiter registered; dropping it removes the waiter.
///
/// A caller that gives up (timeout, cancellation, dropped future) therefore
/// never leaves a waiter behind for a late frame to resolve.
pub struct Registration<'a> {
    correlator: &'a Correlator,
    request_id: u16,
    token: u64,
}

impl Registration<'_> {
    /// Request id this registration waits on
    pub fn request_id(&self) -> u16 {
        self.request_id
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.correlator.deregister(self.request_id, self.token);
    }
}
