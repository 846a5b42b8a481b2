//! Atomic stream positions.
//!
//! A [`Position`] is a monotonic 64-bit counter shared between one writer and
//! any number of readers. The publisher position, the publisher limit and
//! every subscription cursor are positions. While open, a position only moves
//! forward: the ratchet [`Position::propose_max_ordered`] never regresses the
//! value. Once closed, all reads return [`CLOSED_POSITION`].
//!
//! This module also owns the composite *stream position* encoding:
//! `(partition_id << 32) | partition_offset`. Because partition offsets are
//! always smaller than 2^32, comparing two stream positions as plain integers
//! orders them correctly across partition boundaries.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use crossbeam_utils::CachePadded;

/// Sentinel returned when reading a closed position.
pub const CLOSED_POSITION: i64 = -1;

/// Number of bits used for the offset within a partition.
pub const PARTITION_OFFSET_BITS: u32 = 32;

/// Encodes a composite stream position from a partition id and offset.
#[inline]
#[must_use]
pub fn position(partition_id: i32, partition_offset: i32) -> i64 {
    debug_assert!(partition_id >= 0);
    debug_assert!(partition_offset >= 0);
    (i64::from(partition_id) << PARTITION_OFFSET_BITS) | i64::from(partition_offset)
}

/// Extracts the partition id from a composite stream position.
#[inline]
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn partition_id(stream_position: i64) -> i32 {
    (stream_position >> PARTITION_OFFSET_BITS) as i32
}

/// Extracts the offset within the partition from a composite stream position.
#[inline]
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn partition_offset(stream_position: i64) -> i32 {
    (stream_position & 0xFFFF_FFFF) as i32
}

/// An atomically updated, monotonically increasing 64-bit position.
///
/// The value is cache-padded so that independently advancing positions
/// (publisher, limit, each subscriber) never share a cache line.
#[derive(Debug, Default)]
pub struct Position {
    value: CachePadded<AtomicI64>,
    closed: AtomicBool,
}

impl Position {
    /// Creates a new open position starting at `initial`.
    #[must_use]
    pub fn new(initial: i64) -> Self {
        Self {
            value: CachePadded::new(AtomicI64::new(initial)),
            closed: AtomicBool::new(false),
        }
    }

    /// Plain read of the position.
    ///
    /// Returns [`CLOSED_POSITION`] once the position has been closed.
    #[inline]
    #[must_use]
    pub fn get(&self) -> i64 {
        if self.closed.load(Ordering::Relaxed) {
            return CLOSED_POSITION;
        }
        self.value.load(Ordering::Relaxed)
    }

    /// Acquire-ordered read of the position.
    ///
    /// Pairs with [`Position::set_ordered`] and
    /// [`Position::propose_max_ordered`] on the writer side: everything the
    /// writer did before publishing the value is visible after this load.
    #[inline]
    #[must_use]
    pub fn get_volatile(&self) -> i64 {
        if self.closed.load(Ordering::Acquire) {
            return CLOSED_POSITION;
        }
        self.value.load(Ordering::Acquire)
    }

    /// Plain write of the position. Single-writer contexts only.
    #[inline]
    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    /// Release-ordered write of the position.
    #[inline]
    pub fn set_ordered(&self, value: i64) {
        self.value.store(value, Ordering::Release);
    }

    /// Atomically advances the position to `proposed` if it is ahead of the
    /// current value. Returns whether the position advanced.
    ///
    /// This is the only mutation racing writers are allowed to use: the
    /// ratchet guarantees an observer never sees the position move backward.
    #[inline]
    pub fn propose_max_ordered(&self, proposed: i64) -> bool {
        if self.closed.load(Ordering::Relaxed) {
            return false;
        }
        self.value.fetch_max(proposed, Ordering::AcqRel) < proposed
    }

    /// Closes the position. All subsequent reads return [`CLOSED_POSITION`].
    ///
    /// Closing is terminal; a closed position is never reused.
    #[inline]
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Returns whether the position has been closed.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
