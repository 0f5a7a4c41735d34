//! Bounded lock-free task ring used to submit work into a device context.
//!
//! One producer, one consumer. Each slot carries its own valid bit: the
//! consumer only trusts a slot after observing that bit, because `head`
//! having advanced does not by itself prove the payload write is visible
//! to a device-side reader polling the same memory.
//!
//! Roles are claimed through [`TaskQueue::try_producer`] and
//! [`TaskQueue::try_consumer`]; at most one handle of each kind exists at a
//! time, which keeps the single-producer/single-consumer contract checked
//! by the type system instead of by convention.

use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::fmt;
use std::mem::MaybeUninit;
use std::sync::atomic::{fence, AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Smallest ring that can hold an entry under the one-slot-empty rule.
pub const MIN_QUEUE_CAPACITY: usize = 2;

struct Slot<T> {
    valid: AtomicBool,
    payload: UnsafeCell<MaybeUninit<T>>,
}

/// Fixed-capacity ring of `T` with per-slot validity bits.
///
/// Holds at most `capacity - 1` live entries: the ring is full when
/// `(head + 1) % capacity == tail`.
pub struct TaskQueue<T: Copy> {
    slots: Box<[Slot<T>]>,
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
    producer_claimed: AtomicBool,
    consumer_claimed: AtomicBool,
}

// SAFETY: a slot's payload is written only by the unique `Producer` while the
// slot is outside `tail..head`, and read only by the unique `Consumer` after
// it observed the slot's valid bit with acquire ordering.
unsafe impl<T: Copy + Send> Send for TaskQueue<T> {}
unsafe impl<T: Copy + Send> Sync for TaskQueue<T> {}

impl<T: Copy> TaskQueue<T> {
    /// Create a ring with `capacity` slots.
    ///
    /// # Panics
    /// Panics if `capacity < MIN_QUEUE_CAPACITY`; such a ring could never
    /// hold an entry.
    pub fn with_capacity(capacity: usize) -> Arc<Self> {
        assert!(
            capacity >= MIN_QUEUE_CAPACITY,
            "task queue capacity must be at least {}",
            MIN_QUEUE_CAPACITY
        );
        let slots = (0..capacity)
            .map(|_| Slot {
                valid: AtomicBool::new(false),
                payload: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();
        Arc::new(Self {
            slots,
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
            producer_claimed: AtomicBool::new(false),
            consumer_claimed: AtomicBool::new(false),
        })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of entries between tail and head. A snapshot only.
    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        if head >= tail {
            head - tail
        } else {
            self.capacity() - tail + head
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == self.tail.load(Ordering::Acquire)
    }

    pub fn is_full(&self) -> bool {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        (head + 1) % self.capacity() == tail
    }

    /// Claim the producer role. Returns `None` while another producer lives.
    pub fn try_producer(self: &Arc<Self>) -> Option<Producer<T>> {
        self.producer_claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Producer {
                queue: Arc::clone(self),
            })
    }

    /// Claim the consumer role. Returns `None` while another consumer lives.
    pub fn try_consumer(self: &Arc<Self>) -> Option<Consumer<T>> {
        self.consumer_claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Consumer {
                queue: Arc::clone(self),
            })
    }

    fn push(&self, entry: T) -> bool {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        let next = (head + 1) % self.capacity();
        if next == tail {
            return false;
        }
        let slot = &self.slots[head];
        // SAFETY: `head` is outside the consumer's readable window until the
        // valid bit and the advanced head are published below.
        unsafe { (*slot.payload.get()).write(entry) };
        slot.valid.store(true, Ordering::Release);
        self.head.store(next, Ordering::Release);
        true
    }

    fn pop(&self) -> Option<T> {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        fence(Ordering::Acquire);
        let slot = &self.slots[tail];
        if !slot.valid.load(Ordering::Acquire) {
            // Head moved but the payload is not published yet.
            return None;
        }
        // SAFETY: the valid bit was observed with acquire ordering, so the
        // producer's write of this slot happened-before this read.
        let entry = unsafe { (*slot.payload.get()).assume_init() };
        slot.valid.store(false, Ordering::Release);
        self.tail
            .store((tail + 1) % self.capacity(), Ordering::Release);
        Some(entry)
    }
}

impl<T: Copy> fmt::Debug for TaskQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskQueue")
            .field("capacity", &self.capacity())
            .field("head", &self.head.load(Ordering::Relaxed))
            .field("tail", &self.tail.load(Ordering::Relaxed))
            .finish()
    }
}

/// Unique producer handle for a [`TaskQueue`].
pub struct Producer<T: Copy> {
    queue: Arc<TaskQueue<T>>,
}

impl<T: Copy> Producer<T> {
    /// Append `entry`. Returns `false` when the ring is full; that is
    /// backpressure, not a failure.
    #[must_use]
    #[inline]
    pub fn push(&mut self, entry: T) -> bool {
        self.queue.push(entry)
    }

    pub fn queue(&self) -> &Arc<TaskQueue<T>> {
        &self.queue
    }
}

impl<T: Copy> Drop for Producer<T> {
    fn drop(&mut self) {
        self.queue.producer_claimed.store(false, Ordering::Release);
    }
}

impl<T: Copy> fmt::Debug for Producer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Producer").field(&self.queue).finish()
    }
}

/// Unique consumer handle for a [`TaskQueue`].
pub struct Consumer<T: Copy> {
    queue: Arc<TaskQueue<T>>,
}

impl<T: Copy> Consumer<T> {
    /// Take the oldest published entry. `None` means empty right now,
    /// including a slot whose producer has not finished publishing.
    #[inline]
    pub fn pop(&mut self) -> Option<T> {
        self.queue.pop()
    }

    pub fn queue(&self) -> &Arc<TaskQueue<T>> {
        &self.queue
    }
}

impl<T: Copy> Drop for Consumer<T> {
    fn drop(&mut self) {
        self.queue.consumer_claimed.store(false, Ordering::Release);
    }
}

impl<T: Copy> fmt::Debug for Consumer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Consumer").field(&self.queue).finish()
    }
}
