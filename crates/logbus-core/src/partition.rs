//! A fixed-capacity partition of the log buffer.
//!
//! A partition is a contiguous, 8-byte-aligned byte region with an atomically
//! advanced tail counter. Producers reserve ranges by CAS on the tail, write
//! their frame into the reserved range and publish it by storing the frame
//! length with release ordering. Readers never read past a committed length,
//! so racing writers and readers never touch overlapping bytes.
//!
//! ## Tail encoding
//!
//! The tail is the next free byte offset. Once a reservation would cross the
//! end of the partition, the winning producer stores the terminal value
//! (`capacity`) into the tail; every later claim observes the partition as
//! filled and retries against the rotated active partition.
//!
//! ## Status
//!
//! `Active → Draining → Clean` mirrors the recycling protocol: the log buffer
//! marks a partition `Draining` when the rotation cursor is two slots away
//! from reusing it, and the conductor resets it to `Clean` (zeroed storage,
//! tail 0) once every consumer has passed [`Partition::reclaim_at`].

#![allow(unsafe_code)]

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU8, Ordering};

use crossbeam_utils::CachePadded;

/// Partition is in (or available for) the active write path.
pub(crate) const STATUS_ACTIVE: u8 = 0;
/// Partition holds data that consumers may still be reading.
pub(crate) const STATUS_DRAINING: u8 = 1;
/// Partition is zeroed and ready to be rotated into.
pub(crate) const STATUS_CLEAN: u8 = 2;

/// A fixed-capacity byte region with an atomic tail counter.
pub(crate) struct Partition {
    /// Backing storage in 64-bit words so header fields are always aligned
    /// for atomic access. Mutated through raw pointers by the CAS winner of
    /// each reserved range.
    storage: Box<[UnsafeCell<u64>]>,
    capacity: i32,
    tail: CachePadded<AtomicI32>,
    status: AtomicU8,
    /// Stream position every consumer must have passed before this partition
    /// may be cleaned. Only meaningful while `status == STATUS_DRAINING`.
    reclaim_at: AtomicI64,
}

// SAFETY: all mutation of `storage` goes through raw-pointer writes into
// ranges that are exclusively owned by the producer that won the tail CAS,
// or through `clean()` which the conductor only invokes once no producer or
// consumer can reach the partition. Readers only dereference bytes covered
// by a frame length they loaded with acquire ordering, published by the
// writer with release ordering.
unsafe impl Send for Partition {}
unsafe impl Sync for Partition {}

impl Partition {
    /// Allocates a zeroed partition of `capacity` bytes.
    ///
    /// `capacity` must be a positive multiple of 8; the config layer
    /// validates this before construction.
    pub(crate) fn new(capacity: i32, status: u8) -> Self {
        debug_assert!(capacity > 0 && capacity % 8 == 0);
        let words = (capacity as usize) / 8;
        let storage: Vec<UnsafeCell<u64>> = (0..words).map(|_| UnsafeCell::new(0)).collect();
        Self {
            storage: storage.into_boxed_slice(),
            capacity,
            tail: CachePadded::new(AtomicI32::new(0)),
            status: AtomicU8::new(status),
            reclaim_at: AtomicI64::new(0),
        }
    }

    /// Capacity of the partition in bytes.
    #[inline]
    pub(crate) fn capacity(&self) -> i32 {
        self.capacity
    }

    /// Acquire-ordered read of the tail counter.
    #[inline]
    pub(crate) fn tail_volatile(&self) -> i32 {
        self.tail.load(Ordering::Acquire)
    }

    /// Attempts to move the tail from `current` to `new`.
    #[inline]
    pub(crate) fn cas_tail(&self, current: i32, new: i32) -> bool {
        self.tail
            .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Current status byte.
    #[inline]
    pub(crate) fn status(&self) -> u8 {
        self.status.load(Ordering::Acquire)
    }

    /// Release-ordered status update.
    #[inline]
    pub(crate) fn set_status_ordered(&self, status: u8) {
        self.status.store(status, Ordering::Release);
    }

    /// Stream position consumers must pass before cleaning (Draining only).
    #[inline]
    pub(crate) fn reclaim_at(&self) -> i64 {
        self.reclaim_at.load(Ordering::Acquire)
    }

    /// Sets the reclaim threshold. Written before the `Draining` status.
    #[inline]
    pub(crate) fn set_reclaim_at(&self, stream_position: i64) {
        self.reclaim_at.store(stream_position, Ordering::Release);
    }

    #[inline]
    fn byte_ptr(&self) -> *mut u8 {
        self.storage[0].get().cast::<u8>()
    }

    /// Acquire-ordered load of an `i32` at `offset`.
    ///
    /// This is how readers observe frame lengths: the matching release store
    /// is [`Partition::put_i32_ordered`].
    #[inline]
    pub(crate) fn get_i32_volatile(&self, offset: i32) -> i32 {
        debug_assert!(offset >= 0 && offset % 4 == 0 && offset + 4 <= self.capacity);
        // SAFETY: offset is in bounds and 4-byte aligned; the location is
        // only ever accessed atomically while shared.
        unsafe {
            let ptr = self.byte_ptr().add(offset as usize).cast::<AtomicI32>();
            (*ptr).load(Ordering::Acquire)
        }
    }

    /// Release-ordered store of an `i32` at `offset`.
    #[inline]
    pub(crate) fn put_i32_ordered(&self, offset: i32, value: i32) {
        debug_assert!(offset >= 0 && offset % 4 == 0 && offset + 4 <= self.capacity);
        // SAFETY: as in `get_i32_volatile`.
        unsafe {
            let ptr = self.byte_ptr().add(offset as usize).cast::<AtomicI32>();
            (*ptr).store(value, Ordering::Release);
        }
    }

    /// Plain store of an `i32` into an exclusively reserved range.
    #[inline]
    pub(crate) fn put_i32(&self, offset: i32, value: i32) {
        debug_assert!(offset >= 0 && offset + 4 <= self.capacity);
        // SAFETY: the caller owns the reserved range containing `offset`; no
        // reader touches it until the frame length is published.
        unsafe {
            let ptr = self.byte_ptr().add(offset as usize).cast::<i32>();
            ptr.write_unaligned(value);
        }
    }

    /// Plain store of a byte into an exclusively reserved range.
    #[inline]
    pub(crate) fn put_u8(&self, offset: i32, value: u8) {
        debug_assert!(offset >= 0 && offset < self.capacity);
        // SAFETY: as in `put_i32`.
        unsafe {
            self.byte_ptr().add(offset as usize).write(value);
        }
    }

    /// Plain load of a byte. Only valid for offsets covered by a committed
    /// frame length previously loaded with acquire ordering.
    #[inline]
    pub(crate) fn get_u8(&self, offset: i32) -> u8 {
        debug_assert!(offset >= 0 && offset < self.capacity);
        // SAFETY: offset is in bounds; the commit protocol orders this read
        // after the writer's release store of the frame length.
        unsafe { self.byte_ptr().add(offset as usize).read() }
    }

    /// Copies `src` into the partition at `offset`.
    #[inline]
    pub(crate) fn write_bytes(&self, offset: i32, src: &[u8]) {
        debug_assert!(offset >= 0 && offset as usize + src.len() <= self.capacity as usize);
        // SAFETY: the caller owns the reserved range `[offset, offset+len)`.
        unsafe {
            std::ptr::copy_nonoverlapping(
                src.as_ptr(),
                self.byte_ptr().add(offset as usize),
                src.len(),
            );
        }
    }

    /// Borrows `len` bytes starting at `offset` for reading.
    ///
    /// # Safety
    ///
    /// The range must be covered by a committed frame whose length the caller
    /// loaded with acquire ordering, so no writer can still be mutating it.
    #[inline]
    pub(crate) unsafe fn slice(&self, offset: i32, len: i32) -> &[u8] {
        debug_assert!(offset >= 0 && len >= 0 && offset + len <= self.capacity);
        std::slice::from_raw_parts(self.byte_ptr().add(offset as usize), len as usize)
    }

    /// Borrows `len` bytes starting at `offset` for writing.
    ///
    /// # Safety
    ///
    /// The caller must exclusively own the reserved range, and must not hold
    /// two overlapping slices at once.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn slice_mut(&self, offset: i32, len: i32) -> &mut [u8] {
        debug_assert!(offset >= 0 && len >= 0 && offset + len <= self.capacity);
        std::slice::from_raw_parts_mut(self.byte_ptr().add(offset as usize), len as usize)
    }

    /// Zeroes the storage and resets the tail, making the partition `Clean`.
    ///
    /// Only the conductor calls this, and only after every consumer position
    /// has passed [`Partition::reclaim_at`]; the publisher limit guarantees
    /// no producer can be writing here.
    pub(crate) fn clean(&self) {
        // SAFETY: per the invariant above nothing else reads or writes the
        // partition while it is being cleaned.
        unsafe {
            std::ptr::write_bytes(self.byte_ptr(), 0, self.capacity as usize);
        }
        self.tail.store(0, Ordering::Release);
        self.set_status_ordered(STATUS_CLEAN);
    }
}

impl std::fmt::Debug for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Partition")
            .field("capacity", &self.capacity)
            .field("tail", &self.tail.load(Ordering::Relaxed))
            .field("status", &self.status.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
