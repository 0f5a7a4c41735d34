//! Accelerator-visible shared memory.
//!
//! Every channel buffer starts with a `PAYLOAD_OFFSET`-byte header holding
//! the handshake flag at `VALID_OFFSET`, followed by the payload region.
//! A [`Channel`] pairs one such buffer with a [`TaskQueue`]; it is the
//! queue object bound to a dataflow edge. A [`MemPool`] is the arena a
//! request allocates its channels from; nothing in it is reclaimed before
//! the request is released.

use crate::flag::AtomicFlag;
use crate::primitive::TaskDescriptor;
use crate::queue::{TaskQueue, MIN_QUEUE_CAPACITY};
use crossbeam_utils::Backoff;
use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Bytes reserved in front of every payload for flag storage.
pub const PAYLOAD_OFFSET: usize = 64;
/// Byte offset of the flag word inside the header.
pub const VALID_OFFSET: usize = 0;
/// Bytes per payload element (one `f32` sample).
pub const ELEMENT_SIZE: usize = 4;
/// Alignment of every shared buffer.
pub const BUFFER_ALIGN: usize = 64;

const _: () = assert!(VALID_OFFSET + std::mem::size_of::<AtomicFlag>() <= PAYLOAD_OFFSET);
const _: () = assert!(VALID_OFFSET % std::mem::align_of::<AtomicFlag>() == 0);

static NEXT_BUFFER: AtomicU64 = AtomicU64::new(1);

/// Contiguous-buffer handle passed to devices in their descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferHandle(pub u64);

/// Zero-initialised, 64-byte aligned block: header then payload.
pub struct SharedBuffer {
    handle: BufferHandle,
    ptr: NonNull<u8>,
    layout: Layout,
    writer_claimed: AtomicBool,
    reader_claimed: AtomicBool,
}

// SAFETY: the header flag is atomic; payload bytes are only touched through
// the unique `PayloadWriter` (flag clear) or `PayloadReader` (flag set), and
// the flag's release/acquire pair orders those accesses.
unsafe impl Send for SharedBuffer {}
unsafe impl Sync for SharedBuffer {}

impl SharedBuffer {
    /// Allocate a buffer with `payload_len` payload bytes.
    ///
    /// # Panics
    /// Panics if the total size overflows `isize`.
    pub fn new(payload_len: usize) -> Arc<Self> {
        let layout = Layout::from_size_align(PAYLOAD_OFFSET + payload_len, BUFFER_ALIGN)
            .expect("shared buffer layout overflow");
        // SAFETY: the layout has a non-zero size (the header alone is 64 bytes).
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = match NonNull::new(raw) {
            Some(ptr) => ptr,
            None => alloc::handle_alloc_error(layout),
        };
        Arc::new(Self {
            handle: BufferHandle(NEXT_BUFFER.fetch_add(1, Ordering::Relaxed)),
            ptr,
            layout,
            writer_claimed: AtomicBool::new(false),
            reader_claimed: AtomicBool::new(false),
        })
    }

    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    pub fn payload_len(&self) -> usize {
        self.layout.size() - PAYLOAD_OFFSET
    }

    /// The header flag.
    pub fn flag(&self) -> &AtomicFlag {
        // SAFETY: the header is zeroed (a valid clear flag), lives as long as
        // `self`, and `VALID_OFFSET` is suitably aligned inside a 64-byte
        // aligned block.
        unsafe { &*(self.ptr.as_ptr().add(VALID_OFFSET) as *const AtomicFlag) }
    }

    /// Claim the writing side. `None` while another writer lives.
    pub fn try_writer(self: &Arc<Self>) -> Option<PayloadWriter> {
        self.writer_claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| PayloadWriter {
                buffer: Arc::clone(self),
            })
    }

    /// Claim the reading side. `None` while another reader lives.
    pub fn try_reader(self: &Arc<Self>) -> Option<PayloadReader> {
        self.reader_claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| PayloadReader {
                buffer: Arc::clone(self),
            })
    }

    fn payload_ptr(&self) -> *mut u8 {
        // SAFETY: PAYLOAD_OFFSET is within the allocation.
        unsafe { self.ptr.as_ptr().add(PAYLOAD_OFFSET) }
    }
}

impl Drop for SharedBuffer {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with exactly this layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

impl fmt::Debug for SharedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedBuffer")
            .field("handle", &self.handle)
            .field("payload_len", &self.payload_len())
            .field("flag", &self.flag().raw())
            .finish()
    }
}

/// Producer side of a buffer's flag handshake.
#[derive(Debug)]
pub struct PayloadWriter {
    buffer: Arc<SharedBuffer>,
}

impl PayloadWriter {
    /// Write the payload and raise the flag, if the reader has handed the
    /// buffer back. Returns `false` when the previous payload is unread.
    pub fn publish(&mut self, write: impl FnOnce(&mut [u8])) -> bool {
        let flag = self.buffer.flag();
        if flag.is_set() {
            return false;
        }
        // SAFETY: flag clear (observed with acquire) means the reader is done
        // with the payload, and this handle is the only writer.
        let payload = unsafe {
            std::slice::from_raw_parts_mut(self.buffer.payload_ptr(), self.buffer.payload_len())
        };
        write(payload);
        flag.set();
        true
    }

    /// Busy-poll until the buffer is free, then publish.
    pub fn publish_wait(&mut self, write: impl FnOnce(&mut [u8])) {
        self.buffer.flag().wait_clear();
        let published = self.publish(write);
        debug_assert!(published);
    }

    pub fn buffer(&self) -> &Arc<SharedBuffer> {
        &self.buffer
    }
}

impl Drop for PayloadWriter {
    fn drop(&mut self) {
        self.buffer.writer_claimed.store(false, Ordering::Release);
    }
}

/// Consumer side of a buffer's flag handshake.
#[derive(Debug)]
pub struct PayloadReader {
    buffer: Arc<SharedBuffer>,
}

impl PayloadReader {
    /// Read the payload and lower the flag, if one is published.
    pub fn consume<R>(&mut self, read: impl FnOnce(&[u8]) -> R) -> Option<R> {
        let flag = self.buffer.flag();
        if !flag.is_set() {
            return None;
        }
        // SAFETY: flag set (observed with acquire) means the writer finished
        // and will not touch the payload until the flag is cleared.
        let payload = unsafe {
            std::slice::from_raw_parts(self.buffer.payload_ptr(), self.buffer.payload_len())
        };
        let out = read(payload);
        flag.clear();
        Some(out)
    }

    /// Busy-poll until a payload is published, then consume it.
    pub fn consume_wait<R>(&mut self, read: impl FnOnce(&[u8]) -> R) -> R {
        let backoff = Backoff::new();
        let mut read = Some(read);
        loop {
            if self.buffer.flag().is_set() {
                if let Some(read) = read.take() {
                    if let Some(out) = self.consume(read) {
                        return out;
                    }
                }
            }
            backoff.snooze();
        }
    }

    pub fn buffer(&self) -> &Arc<SharedBuffer> {
        &self.buffer
    }
}

impl Drop for PayloadReader {
    fn drop(&mut self) {
        self.buffer.reader_claimed.store(false, Ordering::Release);
    }
}

/// Identifier of a channel, unique within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueId(pub u64);

/// Task ring plus flag-guarded data buffer bound to one dataflow edge.
#[derive(Debug)]
pub struct Channel {
    id: QueueId,
    tasks: Arc<TaskQueue<TaskDescriptor>>,
    buffer: Arc<SharedBuffer>,
}

/// Shared reference to a channel; binding edges copy this.
pub type QueueRef = Arc<Channel>;

impl Channel {
    /// A channel whose buffer holds `len` elements.
    pub fn new(queue_capacity: usize, len: usize) -> QueueRef {
        let buffer = SharedBuffer::new(len * ELEMENT_SIZE);
        Arc::new(Self {
            id: QueueId(buffer.handle().0),
            tasks: TaskQueue::with_capacity(queue_capacity),
            buffer,
        })
    }

    pub fn id(&self) -> QueueId {
        self.id
    }

    pub fn tasks(&self) -> &Arc<TaskQueue<TaskDescriptor>> {
        &self.tasks
    }

    pub fn buffer(&self) -> &Arc<SharedBuffer> {
        &self.buffer
    }
}

/// Per-request arena of channels.
#[derive(Debug)]
pub struct MemPool {
    queue_capacity: usize,
    channels: Vec<QueueRef>,
}

impl MemPool {
    /// Capacities below [`MIN_QUEUE_CAPACITY`] are raised to it.
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            queue_capacity: queue_capacity.max(MIN_QUEUE_CAPACITY),
            channels: Vec::new(),
        }
    }

    /// Allocate a fresh channel of `len` elements owned by this pool.
    pub fn alloc_channel(&mut self, len: usize) -> QueueRef {
        let channel = Channel::new(self.queue_capacity, len);
        self.channels.push(Arc::clone(&channel));
        channel
    }

    /// Channels allocated so far, in allocation order.
    pub fn channels(&self) -> &[QueueRef] {
        &self.channels
    }

    pub fn allocated(&self) -> usize {
        self.channels.len()
    }
}
