//! Scoped write guards for claimed buffer space.
//!
//! A claim reserves a byte range without copying a caller-supplied buffer:
//! the caller writes directly into the reserved region through the guard and
//! then finishes the claim exactly once, either with `commit` (publishing the
//! frame to readers) or `abort` (turning the region into padding that readers
//! skip). Single use is enforced by move: both finishers consume the guard.
//!
//! Dropping an unfinished guard aborts the claim. Without this, a panicking
//! producer would leave a permanently in-progress frame that stalls every
//! reader behind it.

// Guards lend out slices of the reserved byte range.
#![allow(unsafe_code)]

use smallvec::SmallVec;

use crate::frame::{
    align_frame_length, flags_offset, frame_length, length_offset, payload_offset,
    stream_id_offset, FLAG_BATCH_CONTINUATION, FLAG_PADDING, HEADER_LENGTH,
};
use crate::partition::Partition;

/// Exclusive write access to a single claimed frame.
///
/// Created by [`Dispatcher::claim`](crate::Dispatcher::claim). The frame is
/// invisible to readers (negative length marker) until [`commit`] is called;
/// [`abort`] or dropping the guard turns it into padding instead.
///
/// [`commit`]: ClaimedFragment::commit
/// [`abort`]: ClaimedFragment::abort
#[derive(Debug)]
pub struct ClaimedFragment<'a> {
    partition: &'a Partition,
    frame_offset: i32,
    frame_length: i32,
    position: i64,
    finished: bool,
}

impl<'a> ClaimedFragment<'a> {
    pub(crate) fn new(
        partition: &'a Partition,
        frame_offset: i32,
        frame_length: i32,
        position: i64,
    ) -> Self {
        Self {
            partition,
            frame_offset,
            frame_length,
            position,
            finished: false,
        }
    }

    /// The stream position this frame will occupy once committed.
    #[must_use]
    pub fn position(&self) -> i64 {
        self.position
    }

    /// Length of the claimed payload region in bytes.
    #[must_use]
    pub fn payload_len(&self) -> usize {
        (self.frame_length - HEADER_LENGTH) as usize
    }

    /// The claimed payload region. Write the message here, then commit.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        // SAFETY: the reservation gives this guard exclusive ownership of the
        // frame's byte range until it is committed or aborted.
        unsafe {
            self.partition.slice_mut(
                payload_offset(self.frame_offset),
                self.frame_length - HEADER_LENGTH,
            )
        }
    }

    /// Publishes the frame, making it visible to readers.
    pub fn commit(mut self) {
        self.partition
            .put_i32_ordered(length_offset(self.frame_offset), self.frame_length);
        self.finished = true;
    }

    /// Discards the frame. Readers skip the region; no consumer ever
    /// observes partially written payload bytes.
    pub fn abort(mut self) {
        self.abort_in_place();
    }

    fn abort_in_place(&mut self) {
        self.partition
            .put_u8(flags_offset(self.frame_offset), FLAG_PADDING);
        self.partition
            .put_i32_ordered(length_offset(self.frame_offset), self.frame_length);
        self.finished = true;
    }
}

impl Drop for ClaimedFragment<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.abort_in_place();
        }
    }
}

/// Exclusive write access to a batch of claimed frames.
///
/// Created by [`Dispatcher::claim_batch`](crate::Dispatcher::claim_batch).
/// Fragments are added in order with [`next_fragment`]; a single [`commit`]
/// publishes all of them atomically (readers observe none or all of the
/// batch), while [`abort`] or dropping the guard replaces the whole reserved
/// region with padding.
///
/// [`next_fragment`]: ClaimedFragmentBatch::next_fragment
/// [`commit`]: ClaimedFragmentBatch::commit
/// [`abort`]: ClaimedFragmentBatch::abort
#[derive(Debug)]
pub struct ClaimedFragmentBatch<'a> {
    partition: &'a Partition,
    batch_offset: i32,
    batch_end: i32,
    next_offset: i32,
    fragment_limit: usize,
    fragments: SmallVec<[i32; 8]>,
    position: i64,
    finished: bool,
}

impl<'a> ClaimedFragmentBatch<'a> {
    pub(crate) fn new(
        partition: &'a Partition,
        batch_offset: i32,
        batch_end: i32,
        fragment_limit: usize,
        position: i64,
    ) -> Self {
        Self {
            partition,
            batch_offset,
            batch_end,
            next_offset: batch_offset,
            fragment_limit,
            fragments: SmallVec::new(),
            position,
            finished: false,
        }
    }

    /// The stream position at the end of the reserved region.
    #[must_use]
    pub fn position(&self) -> i64 {
        self.position
    }

    /// Number of fragments added so far.
    #[must_use]
    pub fn fragment_count(&self) -> usize {
        self.fragments.len()
    }

    /// Appends the next fragment and returns its payload region.
    ///
    /// # Panics
    ///
    /// Panics if more fragments are added than were declared to the claim, or
    /// if the fragment does not fit into the remaining reserved space. Both
    /// indicate that the caller under-declared the batch.
    pub fn next_fragment<'s>(&'s mut self, payload_length: usize, stream_id: i32) -> &'s mut [u8] {
        assert!(
            self.fragments.len() < self.fragment_limit,
            "batch claimed for {} fragments",
            self.fragment_limit
        );
        let frame_len = frame_length(payload_length);
        let aligned = align_frame_length(frame_len);
        assert!(
            self.next_offset + aligned <= self.batch_end,
            "fragment of {payload_length} bytes exceeds the claimed batch length"
        );

        let frame_offset = self.next_offset;
        self.partition
            .put_i32(stream_id_offset(frame_offset), stream_id);
        self.partition
            .put_u8(flags_offset(frame_offset), FLAG_BATCH_CONTINUATION);
        self.partition
            .put_i32_ordered(length_offset(frame_offset), -frame_len);

        self.fragments.push(frame_offset);
        self.next_offset += aligned;

        // SAFETY: the fragment range was carved out of the batch reservation
        // above and is exclusively owned by this guard.
        unsafe {
            self.partition
                .slice_mut(payload_offset(frame_offset), frame_len - HEADER_LENGTH)
        }
    }

    /// Publishes every fragment of the batch as one atomic unit.
    ///
    /// The final fragment loses its continuation flag, unused reserved space
    /// becomes padding, and fragment lengths are published in reverse order:
    /// a reader cannot pass the first fragment before it is flipped, and by
    /// then every later fragment is already visible.
    pub fn commit(mut self) {
        if let Some(&last) = self.fragments.last() {
            self.partition.put_u8(flags_offset(last), 0);
        }

        if self.next_offset < self.batch_end {
            let residue = self.batch_end - self.next_offset;
            self.partition
                .put_u8(flags_offset(self.next_offset), FLAG_PADDING);
            self.partition
                .put_i32_ordered(length_offset(self.next_offset), residue);
        }

        for &frame_offset in self.fragments.iter().rev() {
            let pending = self.partition.get_i32_volatile(length_offset(frame_offset));
            debug_assert!(pending < 0);
            self.partition
                .put_i32_ordered(length_offset(frame_offset), -pending);
        }
        self.finished = true;
    }

    /// Discards the whole batch. The reserved region becomes a single
    /// padding frame; readers never observe any fragment of it.
    pub fn abort(mut self) {
        self.abort_in_place();
    }

    fn abort_in_place(&mut self) {
        self.partition
            .put_u8(flags_offset(self.batch_offset), FLAG_PADDING);
        self.partition.put_i32_ordered(
            length_offset(self.batch_offset),
            self.batch_end - self.batch_offset,
        );
        self.finished = true;
    }
}

impl Drop for ClaimedFragmentBatch<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.abort_in_place();
        }
    }
}
