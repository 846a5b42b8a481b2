//! The append/claim algorithm.
//!
//! [`FrameAppender`] reserves byte ranges inside the active partition by CAS
//! on the partition tail. Three things can happen:
//!
//! 1. The reservation fits: the winner owns `[tail, tail + aligned)`
//!    exclusively and writes its frame there.
//! 2. The reservation would cross the end of the partition: the winner CASes
//!    the tail to the terminal value, writes a padding frame over the residue
//!    and reports the partition as filled. Exactly one producer ever does
//!    this per partition.
//! 3. The CAS loses or the tail is already terminal: re-read and retry, or
//!    report "filled" so the caller rotates to the next partition. No
//!    producer ever blocks on another.

use crate::claim::{ClaimedFragment, ClaimedFragmentBatch};
use crate::frame::{
    align_frame_length, flags_offset, frame_length, length_offset, payload_offset,
    stream_id_offset, FLAG_PADDING, FRAME_ALIGNMENT, HEADER_LENGTH,
};
use crate::partition::Partition;
use crate::position::position;

/// Result of appending a fully formed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AppendOutcome {
    /// Frame written and committed; value is the new tail offset.
    Committed(i32),
    /// The partition filled up; this or another producer wrote the trailing
    /// padding. The caller rotates the active partition and retries.
    Filled,
}

/// Result of reserving a range for a claim.
pub(crate) enum ClaimOutcome<'a> {
    /// Range reserved; finish via the guard.
    Granted(ClaimedFragment<'a>),
    /// Partition filled; rotate and retry.
    Filled,
}

/// Result of reserving a range for a batch claim.
pub(crate) enum BatchClaimOutcome<'a> {
    /// Range reserved; fill fragments via the guard.
    Granted(ClaimedFragmentBatch<'a>),
    /// Partition filled; rotate and retry.
    Filled,
}

enum Reservation {
    Range { frame_offset: i32, new_tail: i32 },
    Filled,
}

/// Stateless append/claim logic over a partition.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct FrameAppender;

impl FrameAppender {
    /// Appends a complete frame (header + payload copy) and commits it.
    pub(crate) fn append_frame(
        self,
        partition: &Partition,
        payload: &[u8],
        stream_id: i32,
    ) -> AppendOutcome {
        let frame_len = frame_length(payload.len());
        match Self::reserve(partition, align_frame_length(frame_len)) {
            Reservation::Range {
                frame_offset,
                new_tail,
            } => {
                partition.put_i32(stream_id_offset(frame_offset), stream_id);
                partition.put_u8(flags_offset(frame_offset), 0);
                partition.write_bytes(payload_offset(frame_offset), payload);
                // Publishing the length makes the frame visible to readers.
                partition.put_i32_ordered(length_offset(frame_offset), frame_len);
                AppendOutcome::Committed(new_tail)
            }
            Reservation::Filled => AppendOutcome::Filled,
        }
    }

    /// Reserves a range for a single-fragment claim.
    ///
    /// The frame header is written with a *negative* length so readers stall
    /// at the claim until the guard commits or aborts.
    pub(crate) fn claim<'a>(
        self,
        partition: &'a Partition,
        partition_id: i32,
        payload_length: usize,
        stream_id: i32,
    ) -> ClaimOutcome<'a> {
        let frame_len = frame_length(payload_length);
        match Self::reserve(partition, align_frame_length(frame_len)) {
            Reservation::Range {
                frame_offset,
                new_tail,
            } => {
                partition.put_i32(stream_id_offset(frame_offset), stream_id);
                partition.put_u8(flags_offset(frame_offset), 0);
                partition.put_i32_ordered(length_offset(frame_offset), -frame_len);
                ClaimOutcome::Granted(ClaimedFragment::new(
                    partition,
                    frame_offset,
                    frame_len,
                    position(partition_id, new_tail),
                ))
            }
            Reservation::Filled => ClaimOutcome::Filled,
        }
    }

    /// Reserves one contiguous range large enough for `fragment_count`
    /// fragments totalling `batch_length` payload bytes.
    ///
    /// Each fragment is individually aligned, so the reservation includes
    /// worst-case per-fragment alignment slack; any unused residue is
    /// published as padding when the batch commits.
    pub(crate) fn claim_batch<'a>(
        self,
        partition: &'a Partition,
        partition_id: i32,
        fragment_count: usize,
        batch_length: usize,
    ) -> BatchClaimOutcome<'a> {
        let per_fragment = HEADER_LENGTH + FRAME_ALIGNMENT - 1;
        let reserved = align_frame_length(
            frame_length(batch_length) - HEADER_LENGTH
                + i32::try_from(fragment_count).expect("fragment count fits i32") * per_fragment,
        );
        match Self::reserve(partition, reserved) {
            Reservation::Range {
                frame_offset,
                new_tail,
            } => BatchClaimOutcome::Granted(ClaimedFragmentBatch::new(
                partition,
                frame_offset,
                new_tail,
                fragment_count,
                position(partition_id, new_tail),
            )),
            Reservation::Filled => BatchClaimOutcome::Filled,
        }
    }

    fn reserve(partition: &Partition, aligned_length: i32) -> Reservation {
        let capacity = partition.capacity();
        loop {
            let tail = partition.tail_volatile();
            if tail >= capacity {
                // Terminal tail: another producer already filled this
                // partition.
                return Reservation::Filled;
            }

            if tail + aligned_length <= capacity {
                if partition.cas_tail(tail, tail + aligned_length) {
                    return Reservation::Range {
                        frame_offset: tail,
                        new_tail: tail + aligned_length,
                    };
                }
            } else if partition.cas_tail(tail, capacity) {
                // We crossed the end: everything from the old tail to the end
                // becomes a padding frame so readers can walk over it.
                let residue = capacity - tail;
                debug_assert!(residue >= FRAME_ALIGNMENT);
                partition.put_u8(flags_offset(tail), FLAG_PADDING);
                partition.put_i32_ordered(length_offset(tail), residue);
                return Reservation::Filled;
            }
            // CAS lost: another producer moved the tail, retry with the
            // refreshed value.
        }
    }
}
