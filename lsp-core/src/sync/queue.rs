//! Bounded blocking queues.
//!
//! Fixed-capacity ring buffers guarded by a [`TimedMutex`] and two condition
//! variables (one per direction). Producers block while the ring is full,
//! consumers while it is empty; every blocking call takes the usual
//! `Option<Duration>` timeout. A zero timeout never waits, not even for the
//! lock: contention reads as full or empty. [`BoundedQueue::offer`] and
//! [`BoundedQueue::take`] wait for the lock but never for room or items.
//!
//! Three element storage modes exist, each its own type so they cannot be
//! mixed on one queue:
//!
//! - [`BoundedQueue<T>`]: zero-copy. The queue takes ownership of the item
//!   on push and hands it back on pop.
//! - [`CopyQueue`]: variable-size byte entries, copied in and out.
//! - [`SlotQueue`]: fixed-size byte items stored inline in one arena.
//!
//! # Waiter accounting
//!
//! Each ring counts the threads blocked on it. [`clear`](BoundedQueue::clear)
//! and [`destroy`](BoundedQueue::destroy) refuse with
//! [`LspError::ResourceInUse`] while that count is non-zero, and the count is
//! decremented on every exit path, timeouts included.

use crate::error::{LspError, Rejected, Result};
use crate::sync::mutex::{wait_on, TimedGuard, TimedMutex};
use crate::timeout::Deadline;
use parking_lot::Condvar;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, trace};

/// Storage behind a ring.
trait Storage {
    /// Release every still-queued entry.
    fn release_all(&mut self);
}

impl<T> Storage for Vec<Option<T>> {
    fn release_all(&mut self) {
        self.iter_mut().for_each(|slot| drop(slot.take()));
    }
}

/// Inline arena of `capacity * item_size` bytes.
struct SlotArena {
    bytes: Box<[u8]>,
    item_size: usize,
}

impl SlotArena {
    fn slot_mut(&mut self, index: usize) -> &mut [u8] {
        let start = index * self.item_size;
        &mut self.bytes[start..start + self.item_size]
    }
}

impl Storage for SlotArena {
    // Slots are inline, nothing to free.
    fn release_all(&mut self) {}
}

struct Ring<S> {
    slots: S,
    head: usize,
    tail: usize,
    len: usize,
    capacity: usize,
    waiting_full: usize,
    waiting_empty: usize,
    destroyed: bool,
}

impl<S> Ring<S> {
    #[inline]
    const fn waiters(&self) -> usize {
        self.waiting_full + self.waiting_empty
    }

    #[inline]
    const fn is_full(&self) -> bool {
        self.len >= self.capacity
    }

    /// Advance `tail` after an entry was written at the old tail.
    fn advance_tail(&mut self) {
        self.tail = (self.tail + 1) % self.capacity;
        self.len += 1;
    }

    /// Advance `head` after the entry at the old head was taken.
    fn advance_head(&mut self) {
        self.head = (self.head + 1) % self.capacity;
        self.len -= 1;
    }
}

/// The ring plus its lock and condition variables.
struct Monitor<S> {
    ring: TimedMutex<Ring<S>>,
    not_full: Condvar,
    not_empty: Condvar,
    len_hint: AtomicUsize,
}

impl<S: Storage> Monitor<S> {
    fn new(slots: S, capacity: usize) -> Self {
        Self {
            ring: TimedMutex::new(Ring {
                slots,
                head: 0,
                tail: 0,
                len: 0,
                capacity,
                waiting_full: 0,
                waiting_empty: 0,
                destroyed: false,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
            len_hint: AtomicUsize::new(0),
        }
    }

    /// Lock the ring. [`Deadline::Immediate`] is a try-lock.
    fn lock(&self, deadline: Deadline) -> Result<TimedGuard<'_, Ring<S>>> {
        let ring = self.ring.lock_until(deadline)?;
        if ring.destroyed {
            return Err(LspError::Destroyed);
        }
        Ok(ring)
    }

    /// Lock for a non-blocking attempt; a contended lock reads as `busy`.
    fn lock_or(&self, deadline: Deadline, busy: LspError) -> Result<TimedGuard<'_, Ring<S>>> {
        match self.lock(deadline) {
            Err(LspError::Timeout) if deadline.is_immediate() => {
                trace!("[QUEUE] lock contended, {}", busy);
                Err(busy)
            }
            result => result,
        }
    }

    /// Lock the ring and wait until it has a free slot.
    fn acquire_space(&self, timeout: Option<Duration>) -> Result<TimedGuard<'_, Ring<S>>> {
        let deadline = Deadline::after(timeout);
        let mut ring = self.lock_or(deadline, LspError::QueueFull)?;
        if !ring.is_full() {
            return Ok(ring);
        }
        if deadline.is_immediate() {
            return Err(LspError::QueueFull);
        }

        ring.waiting_full += 1;
        while ring.is_full() && !ring.destroyed {
            if !wait_on(&self.not_full, &mut ring, deadline) {
                break;
            }
        }
        ring.waiting_full -= 1;

        if ring.destroyed {
            Err(LspError::Destroyed)
        } else if ring.is_full() {
            Err(LspError::Timeout)
        } else {
            Ok(ring)
        }
    }

    /// Lock the ring and wait until it holds at least one entry.
    fn acquire_item(&self, timeout: Option<Duration>) -> Result<TimedGuard<'_, Ring<S>>> {
        let deadline = Deadline::after(timeout);
        let mut ring = self.lock_or(deadline, LspError::QueueEmpty)?;
        if ring.len > 0 {
            return Ok(ring);
        }
        if deadline.is_immediate() {
            return Err(LspError::QueueEmpty);
        }

        ring.waiting_empty += 1;
        while ring.len == 0 && !ring.destroyed {
            if !wait_on(&self.not_empty, &mut ring, deadline) {
                break;
            }
        }
        ring.waiting_empty -= 1;

        if ring.destroyed {
            Err(LspError::Destroyed)
        } else if ring.len == 0 {
            Err(LspError::Timeout)
        } else {
            Ok(ring)
        }
    }

    fn pushed(&self, ring: &mut Ring<S>) {
        ring.advance_tail();
        self.len_hint.store(ring.len, Ordering::Release);
        // Every waiter re-checks its predicate, one wake is enough.
        self.not_empty.notify_one();
    }

    fn popped(&self, ring: &mut Ring<S>) {
        ring.advance_head();
        self.len_hint.store(ring.len, Ordering::Release);
        self.not_full.notify_one();
    }

    fn clear(&self) -> Result<()> {
        let mut ring = self.lock(Deadline::Never)?;
        if ring.waiters() > 0 {
            return Err(LspError::ResourceInUse);
        }
        ring.slots.release_all();
        ring.head = 0;
        ring.tail = 0;
        ring.len = 0;
        self.len_hint.store(0, Ordering::Release);
        Ok(())
    }

    fn destroy(&self) -> Result<usize> {
        let mut ring = self.lock(Deadline::Never)?;
        if ring.waiters() > 0 {
            return Err(LspError::ResourceInUse);
        }
        let released = ring.len;
        ring.slots.release_all();
        ring.len = 0;
        ring.destroyed = true;
        self.len_hint.store(0, Ordering::Release);
        debug!("[QUEUE] destroyed, released {} queued entries", released);
        Ok(released)
    }

    fn waiters(&self) -> usize {
        self.ring.lock(None).map_or(0, |ring| ring.waiters())
    }

    fn capacity(&self) -> usize {
        self.ring.lock(None).map_or(0, |ring| ring.capacity)
    }
}

fn alloc_entries<T>(capacity: usize) -> Result<Vec<Option<T>>> {
    if capacity == 0 {
        return Err(LspError::invalid("queue capacity must be non-zero"));
    }
    let mut slots = Vec::new();
    slots
        .try_reserve_exact(capacity)
        .map_err(|_| LspError::OutOfMemory)?;
    slots.resize_with(capacity, || None);
    Ok(slots)
}

/// Zero-copy bounded queue of owned items.
pub struct BoundedQueue<T> {
    monitor: Monitor<Vec<Option<T>>>,
}

impl<T> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` items.
    pub fn new(capacity: usize) -> Result<Self> {
        let slots = alloc_entries(capacity)?;
        debug!("[QUEUE] created zero-copy queue, capacity: {}", capacity);
        Ok(Self {
            monitor: Monitor::new(slots, capacity),
        })
    }

    /// Push `item`, blocking while the queue is full.
    ///
    /// On failure the item is handed back inside [`Rejected`].
    pub fn push(&self, item: T, timeout: Option<Duration>) -> std::result::Result<(), Rejected<T>> {
        let mut ring = match self.monitor.acquire_space(timeout) {
            Ok(ring) => ring,
            Err(error) => return Err(Rejected::new(error, item)),
        };
        let tail = ring.tail;
        ring.slots[tail] = Some(item);
        trace!("[QUEUE] push idx: {}", tail);
        self.monitor.pushed(&mut ring);
        Ok(())
    }

    /// Pop the oldest item, blocking while the queue is empty.
    pub fn pop(&self, timeout: Option<Duration>) -> Result<T> {
        let mut ring = self.monitor.acquire_item(timeout)?;
        let head = ring.head;
        let item = ring.slots[head]
            .take()
            .expect("non-zero length ensures the head slot is occupied");
        trace!("[QUEUE] pop  idx: {}", head);
        self.monitor.popped(&mut ring);
        Ok(item)
    }

    /// Push `item` if there is room right now.
    ///
    /// Unlike a zero-timeout [`push`](Self::push) this waits for the internal
    /// lock, so a full queue is the only reason for [`LspError::QueueFull`].
    pub fn offer(&self, item: T) -> std::result::Result<(), Rejected<T>> {
        let mut ring = match self.monitor.lock(Deadline::Never) {
            Ok(ring) if ring.is_full() => return Err(Rejected::new(LspError::QueueFull, item)),
            Ok(ring) => ring,
            Err(error) => return Err(Rejected::new(error, item)),
        };
        let tail = ring.tail;
        ring.slots[tail] = Some(item);
        self.monitor.pushed(&mut ring);
        Ok(())
    }

    /// Pop the oldest item if there is one right now.
    ///
    /// Waits for the internal lock but never for an item; `Ok(None)` means
    /// the queue really was empty.
    pub fn take(&self) -> Result<Option<T>> {
        let mut ring = self.monitor.lock(Deadline::Never)?;
        if ring.len == 0 {
            return Ok(None);
        }
        let head = ring.head;
        let item = ring.slots[head].take();
        self.monitor.popped(&mut ring);
        Ok(item)
    }

    /// Pop every queued item without waiting for more.
    pub fn drain(&self) -> Vec<T> {
        let mut items = Vec::with_capacity(self.len());
        while let Ok(Some(item)) = self.take() {
            items.push(item);
        }
        items
    }

    /// Drop every queued item. Refused while threads are blocked on the queue.
    pub fn clear(&self) -> Result<()> {
        self.monitor.clear()
    }

    /// Drop every queued item and retire the queue.
    ///
    /// Refused while threads are blocked on the queue; once accepted, every
    /// later operation fails with [`LspError::Destroyed`]. Returns how many
    /// entries were released.
    pub fn destroy(&self) -> Result<usize> {
        self.monitor.destroy()
    }

    /// Number of queued items (advisory, lock-free).
    #[inline]
    pub fn len(&self) -> usize {
        self.monitor.len_hint.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.monitor.capacity()
    }

    /// Number of threads blocked in push or pop.
    pub fn waiters(&self) -> usize {
        self.monitor.waiters()
    }
}

impl<T> fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}

/// Bounded queue of variable-size byte entries, copied in and out.
pub struct CopyQueue {
    monitor: Monitor<Vec<Option<Box<[u8]>>>>,
}

impl CopyQueue {
    pub fn new(capacity: usize) -> Result<Self> {
        let slots = alloc_entries(capacity)?;
        debug!("[QUEUE] created copying queue, capacity: {}", capacity);
        Ok(Self {
            monitor: Monitor::new(slots, capacity),
        })
    }

    /// Push a private copy of `data`.
    pub fn push(&self, data: &[u8], timeout: Option<Duration>) -> Result<()> {
        let mut copy = Vec::new();
        copy.try_reserve_exact(data.len())
            .map_err(|_| LspError::OutOfMemory)?;
        copy.extend_from_slice(data);

        let mut ring = self.monitor.acquire_space(timeout)?;
        let tail = ring.tail;
        ring.slots[tail] = Some(copy.into_boxed_slice());
        trace!("[QUEUE] push idx: {} ({} bytes)", tail, data.len());
        self.monitor.pushed(&mut ring);
        Ok(())
    }

    /// Copy the oldest entry into `dst` and remove it.
    ///
    /// Returns the entry size. If `dst` is too small the entry stays queued
    /// and [`LspError::InvalidArgument`] is returned.
    pub fn pop(&self, dst: &mut [u8], timeout: Option<Duration>) -> Result<usize> {
        let mut ring = self.monitor.acquire_item(timeout)?;
        let head = ring.head;
        let size = ring.slots[head].as_ref().map_or(0, |entry| entry.len());
        if dst.len() < size {
            return Err(LspError::invalid(format!(
                "destination holds {} bytes, entry has {}",
                dst.len(),
                size
            )));
        }
        if let Some(entry) = ring.slots[head].take() {
            dst[..size].copy_from_slice(&entry);
        }
        trace!("[QUEUE] pop  idx: {} ({} bytes)", head, size);
        self.monitor.popped(&mut ring);
        Ok(size)
    }

    /// Size of the oldest entry, or `None` when empty (advisory).
    pub fn peek_size(&self) -> Option<usize> {
        let ring = self.monitor.ring.lock(None).ok()?;
        if ring.len == 0 {
            return None;
        }
        ring.slots[ring.head].as_ref().map(|entry| entry.len())
    }

    pub fn clear(&self) -> Result<()> {
        self.monitor.clear()
    }

    pub fn destroy(&self) -> Result<usize> {
        self.monitor.destroy()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.monitor.len_hint.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.monitor.capacity()
    }

    pub fn waiters(&self) -> usize {
        self.monitor.waiters()
    }
}

/// Bounded queue of fixed-size items stored inline in one arena.
pub struct SlotQueue {
    monitor: Monitor<SlotArena>,
    item_size: usize,
}

impl SlotQueue {
    /// Create a queue of `capacity` slots of `item_size` bytes each.
    pub fn new(capacity: usize, item_size: usize) -> Result<Self> {
        if capacity == 0 || item_size == 0 {
            return Err(LspError::invalid("slot queue capacity and item size must be non-zero"));
        }
        let total = capacity
            .checked_mul(item_size)
            .ok_or_else(|| LspError::invalid("slot queue arena size overflows"))?;
        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(total)
            .map_err(|_| LspError::OutOfMemory)?;
        bytes.resize(total, 0);

        debug!(
            "[QUEUE] created slot queue, capacity: {} itemsize: {} arena: {} bytes",
            capacity, item_size, total
        );
        let arena = SlotArena {
            bytes: bytes.into_boxed_slice(),
            item_size,
        };
        Ok(Self {
            monitor: Monitor::new(arena, capacity),
            item_size,
        })
    }

    /// Copy exactly `item_size` bytes into the next slot.
    pub fn push(&self, item: &[u8], timeout: Option<Duration>) -> Result<()> {
        if item.len() != self.item_size {
            return Err(LspError::invalid(format!(
                "item is {} bytes, queue slots are {}",
                item.len(),
                self.item_size
            )));
        }
        let mut ring = self.monitor.acquire_space(timeout)?;
        let tail = ring.tail;
        ring.slots.slot_mut(tail).copy_from_slice(item);
        trace!("[QUEUE] push idx: {}", tail);
        self.monitor.pushed(&mut ring);
        Ok(())
    }

    /// Copy the oldest item into the first `item_size` bytes of `dst`.
    pub fn pop(&self, dst: &mut [u8], timeout: Option<Duration>) -> Result<()> {
        if dst.len() < self.item_size {
            return Err(LspError::invalid(format!(
                "destination holds {} bytes, queue slots are {}",
                dst.len(),
                self.item_size
            )));
        }
        let mut ring = self.monitor.acquire_item(timeout)?;
        let head = ring.head;
        dst[..self.item_size].copy_from_slice(ring.slots.slot_mut(head));
        trace!("[QUEUE] pop  idx: {}", head);
        self.monitor.popped(&mut ring);
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        self.monitor.clear()
    }

    pub fn destroy(&self) -> Result<usize> {
        self.monitor.destroy()
    }

    #[inline]
    #[must_use]
    pub const fn item_size(&self) -> usize {
        self.item_size
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.monitor.len_hint.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.monitor.capacity()
    }

    pub fn waiters(&self) -> usize {
        self.monitor.waiters()
    }
}
