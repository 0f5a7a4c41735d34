//! Single-bit handshake flag living in accelerator-visible memory.
//!
//! One producer publishes by storing `1` after writing its payload; one
//! consumer observes `1`, reads the payload, and hands the slot back by
//! storing `0`. Release/acquire on the flag orders the payload accesses.
//! This is not a multi-writer primitive.

use crossbeam_utils::Backoff;
use std::sync::atomic::{AtomicU32, Ordering};

/// One machine word holding `0` or `1`.
#[repr(transparent)]
#[derive(Debug, Default)]
pub struct AtomicFlag(AtomicU32);

impl AtomicFlag {
    pub const fn new(set: bool) -> Self {
        Self(AtomicU32::new(set as u32))
    }

    /// True when the producer has published.
    #[inline]
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire) == 1
    }

    /// Publish: everything written before this call is visible to a reader
    /// that observes the flag set.
    #[inline]
    pub fn set(&self) {
        self.0.store(1, Ordering::Release);
    }

    /// Hand the slot back to the producer.
    #[inline]
    pub fn clear(&self) {
        self.0.store(0, Ordering::Release);
    }

    /// Busy-poll until the flag is set.
    #[inline]
    pub fn wait_set(&self) {
        let backoff = Backoff::new();
        while !self.is_set() {
            backoff.snooze();
        }
    }

    /// Busy-poll until the flag is clear.
    #[inline]
    pub fn wait_clear(&self) {
        let backoff = Backoff::new();
        while self.is_set() {
            backoff.snooze();
        }
    }

    /// Raw word, for device descriptors that mirror the flag.
    pub fn raw(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }
}
