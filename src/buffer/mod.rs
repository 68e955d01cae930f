//! Bounded blocking circular buffer
//!
//! The hand-off queue between a base's reader thread and a source's
//! consumer. It holds fixed-size items and is shared through an `Arc`; the
//! producer side works through a [`Writer`] and the consumer side through a
//! [`Reader`].
//!
//! # Two-phase commit
//!
//! ```text
//!   Writer                     CircularBuffer                 Reader
//!   pending ──(acquire #n+1)──► committed: [a, b, c] ──(consume)──► current
//!      ▲                            │
//!      └──────── free slots ◄───────┴──────── (next consume) ◄──────┘
//! ```
//!
//! [`Writer::acquire_write_slot`] first commits the slot handed out by the
//! previous call, then hands out a fresh one. A slot therefore becomes
//! visible to the consumer only when the producer asks for the next slot.
//! The reader keeps the item it returned until its next call to
//! [`Reader::consume`], which recycles it.
//!
//! Slots are boxed and moved between the pending, committed and free
//! positions, so neither side ever aliases memory the other side can see.
//!
//! # Cancellation
//!
//! [`CircularBuffer::stop`] is permanent and wakes every waiter. After it,
//! every producer and consumer call returns [`Cancelled`], even if
//! committed items remain.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};

/// Maximum byte size of one allocation chunk
///
/// A chunk always holds at least [`MIN_ITEMS_PER_CHUNK`] items, even when
/// that exceeds this size.
pub const CHUNK_MAX_SIZE: usize = 0x20000;

/// Minimum number of items held by one chunk
pub const MIN_ITEMS_PER_CHUNK: usize = 3;

/// Returned when the buffer has been stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Circular buffer stopped")
    }
}

impl std::error::Error for Cancelled {}

struct Ring {
    committed: VecDeque<Box<[u8]>>,
    free: Vec<Box<[u8]>>,
    stopped: bool,
}

impl Ring {
    fn take_slot(&mut self, item_size: usize, per_chunk: usize) -> Box<[u8]> {
        if let Some(slot) = self.free.pop() {
            return slot;
        }
        // Grow by one chunk; one slot goes straight to the caller
        for _ in 1..per_chunk {
            self.free.push(vec![0u8; item_size].into_boxed_slice());
        }
        vec![0u8; item_size].into_boxed_slice()
    }
}

/// Thread-safe FIFO of fixed-size items with a maximum item count
pub struct CircularBuffer {
    item_size: usize,
    capacity: usize,
    items_per_chunk: usize,
    ring: Mutex<Ring>,
    not_full: Condvar,
    not_empty: Condvar,
}

impl CircularBuffer {
    /// Create a buffer holding at least `item_count` items of `item_size` bytes
    ///
    /// The capacity is rounded up to a whole number of chunks. The first
    /// chunk is reserved up front; later chunks are allocated as the
    /// buffer fills.
    pub fn new(item_size: usize, item_count: usize) -> Result<Arc<Self>> {
        if item_size == 0 || item_count == 0 {
            return Err(Error::InvalidSpec(format!(
                "buffer needs non-zero item size and count (got {} x {})",
                item_size, item_count
            )));
        }

        let items_per_chunk = items_per_chunk(item_size);
        let capacity = item_count
            .div_ceil(items_per_chunk)
            .checked_mul(items_per_chunk)
            .ok_or(Error::Allocation)?;

        let mut committed = VecDeque::new();
        committed.try_reserve_exact(capacity)?;

        let first_chunk = items_per_chunk.min(capacity + 2);
        let mut free = Vec::new();
        free.try_reserve_exact(first_chunk)?;
        for _ in 0..first_chunk {
            let mut slot = Vec::new();
            slot.try_reserve_exact(item_size)?;
            slot.resize(item_size, 0);
            free.push(slot.into_boxed_slice());
        }

        Ok(Arc::new(Self {
            item_size,
            capacity,
            items_per_chunk,
            ring: Mutex::new(Ring {
                committed,
                free,
                stopped: false,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
        }))
    }

    /// Producer handle
    pub fn writer(self: &Arc<Self>) -> Writer {
        Writer {
            buffer: Arc::clone(self),
            pending: None,
        }
    }

    /// Consumer handle
    pub fn reader(self: &Arc<Self>) -> Reader {
        Reader {
            buffer: Arc::clone(self),
            current: None,
        }
    }

    /// Stop the buffer and wake every blocked producer and consumer
    ///
    /// Safe to call any number of times from any thread.
    pub fn stop(&self) {
        let mut ring = self.ring.lock();
        ring.stopped = true;
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.ring.lock().stopped
    }

    pub fn item_size(&self) -> usize {
        self.item_size
    }

    /// Maximum number of committed, unconsumed items
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of committed, unconsumed items
    pub fn len(&self) -> usize {
        self.ring.lock().committed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for CircularBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircularBuffer")
            .field("item_size", &self.item_size)
            .field("capacity", &self.capacity)
            .finish()
    }
}

fn items_per_chunk(item_size: usize) -> usize {
    (CHUNK_MAX_SIZE / item_size).max(MIN_ITEMS_PER_CHUNK)
}

/// Producer side of a [`CircularBuffer`]
///
/// Holds the pending, not yet committed slot.
pub struct Writer {
    buffer: Arc<CircularBuffer>,
    pending: Option<Box<[u8]>>,
}

impl Writer {
    /// Commit the pending slot (if any) and return a fresh one
    ///
    /// Blocks while the buffer is full and a pending slot is waiting to
    /// be committed.
    pub fn acquire_write_slot(&mut self) -> std::result::Result<&mut [u8], Cancelled> {
        match self.advance(None)? {
            Some(slot) => Ok(slot),
            None => Err(Cancelled),
        }
    }

    /// Like [`acquire_write_slot`](Self::acquire_write_slot), but gives up
    /// after `timeout`
    ///
    /// On timeout the pending slot stays pending and `Ok(None)` is returned.
    pub fn acquire_write_slot_timeout(
        &mut self,
        timeout: Duration,
    ) -> std::result::Result<Option<&mut [u8]>, Cancelled> {
        self.advance(Some(Instant::now() + timeout))
    }

    /// The slot handed out by the last acquire, still uncommitted
    pub fn pending_slot(&mut self) -> Option<&mut [u8]> {
        self.pending.as_deref_mut()
    }

    pub fn buffer(&self) -> &Arc<CircularBuffer> {
        &self.buffer
    }

    fn advance(
        &mut self,
        deadline: Option<Instant>,
    ) -> std::result::Result<Option<&mut [u8]>, Cancelled> {
        let buf = &self.buffer;
        let mut ring = buf.ring.lock();

        loop {
            if ring.stopped {
                return Err(Cancelled);
            }
            if self.pending.is_none() || ring.committed.len() < buf.capacity {
                break;
            }
            match deadline {
                None => buf.not_full.wait(&mut ring),
                Some(deadline) => {
                    if buf.not_full.wait_until(&mut ring, deadline).timed_out() {
                        return Ok(None);
                    }
                }
            }
        }

        if let Some(filled) = self.pending.take() {
            ring.committed.push_back(filled);
            buf.not_empty.notify_one();
        }
        let slot = ring.take_slot(buf.item_size, buf.items_per_chunk);
        drop(ring);

        Ok(Some(&mut self.pending.insert(slot)[..]))
    }
}

/// Consumer side of a [`CircularBuffer`]
pub struct Reader {
    buffer: Arc<CircularBuffer>,
    current: Option<Box<[u8]>>,
}

impl Reader {
    /// Return the oldest committed item, blocking while there is none
    ///
    /// The returned item stays valid until the next call.
    pub fn consume(&mut self) -> std::result::Result<&[u8], Cancelled> {
        let buf = &self.buffer;
        let mut ring = buf.ring.lock();

        if let Some(done) = self.current.take() {
            ring.free.push(done);
        }

        let item = loop {
            if ring.stopped {
                return Err(Cancelled);
            }
            if let Some(item) = ring.committed.pop_front() {
                break item;
            }
            buf.not_empty.wait(&mut ring);
        };
        buf.not_full.notify_one();
        drop(ring);

        Ok(&self.current.insert(item)[..])
    }

    pub fn buffer(&self) -> &Arc<CircularBuffer> {
        &self.buffer
    }
}
