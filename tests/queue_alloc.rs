use accel_arbiter::mem::SharedBuffer;
use accel_arbiter::{PrimitiveParams, TaskDescriptor, TaskQueue};
use std::alloc::{GlobalAlloc, Layout};
use std::cell::RefCell;

thread_local! {
    static ALLOC_COUNT: RefCell<usize> = const { RefCell::new(0) };
}

struct CountingAllocator;

unsafe impl GlobalAlloc for CountingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        ALLOC_COUNT.with(|c| *c.borrow_mut() += 1);
        unsafe { std::alloc::System.alloc(layout) }
    }
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe { std::alloc::System.dealloc(ptr, layout) }
    }
}

#[global_allocator]
static A: CountingAllocator = CountingAllocator;

fn allocations() -> usize {
    ALLOC_COUNT.with(|c| *c.borrow())
}

#[test]
fn queue_push_pop_does_not_allocate() {
    let queue = TaskQueue::with_capacity(16);
    let mut tx = queue.try_producer().unwrap();
    let mut rx = queue.try_consumer().unwrap();
    let params = PrimitiveParams::audio(8);

    let before = allocations();
    for seq in 0..10_000 {
        assert!(tx.push(TaskDescriptor::new(seq, params)));
        assert_eq!(rx.pop().map(|t| t.seq), Some(seq));
    }
    assert_eq!(allocations(), before, "task queue traffic should not allocate");
}

#[test]
fn buffer_publish_consume_does_not_allocate() {
    let buffer = SharedBuffer::new(256);
    let mut writer = buffer.try_writer().unwrap();
    let mut reader = buffer.try_reader().unwrap();

    let before = allocations();
    for round in 0..10_000u32 {
        assert!(writer.publish(|payload| payload[..4].copy_from_slice(&round.to_le_bytes())));
        let got = reader.consume(|payload| u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]));
        assert_eq!(got, Some(round));
    }
    assert_eq!(allocations(), before, "flag handoff should not allocate");
}
