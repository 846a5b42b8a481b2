//! Consumer-side view of the log.
//!
//! A [`Subscription`] owns a cursor into the stream and hands committed
//! frames to a caller-supplied handler via [`Subscription::poll`]. Reading is
//! zero-copy: the handler borrows the payload directly from the buffer. The
//! flow-control window guarantees the bytes stay valid for the duration of
//! the handler call, because a partition is only recycled once every
//! subscriber has moved past it.
//!
//! Each subscription has exactly one reader at a time (`poll` takes `&mut
//! self` through the handler's exclusivity); different subscriptions read
//! concurrently without coordination.

// Polling lends out payload slices straight from the partition storage.
#![allow(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::conductor::ConductorCommand;
use crate::error::PollError;
use crate::frame::{
    align_frame_length, flags_offset, length_offset, payload_offset, stream_id_offset,
    FLAG_PADDING, FRAME_ALIGNMENT, HEADER_LENGTH,
};
use crate::log_buffer::LogBuffer;
use crate::position::{partition_id, partition_offset, position, Position, CLOSED_POSITION};

/// A committed frame handed to a poll handler.
#[derive(Debug)]
pub struct Fragment<'a> {
    position: i64,
    stream_id: i32,
    payload: &'a [u8],
}

impl Fragment<'_> {
    /// The stream position just past this frame. A consumer that persists
    /// this value can resume from it without re-reading the frame.
    #[must_use]
    pub fn position(&self) -> i64 {
        self.position
    }

    /// The stream id the producer attached to the frame.
    #[must_use]
    pub fn stream_id(&self) -> i32 {
        self.stream_id
    }

    /// The frame payload, borrowed from the buffer.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        self.payload
    }
}

/// A named consumer of the dispatcher's stream.
///
/// Obtained from [`Dispatcher::open_subscription`] or named at construction
/// via the config. Dropping a subscription does not unregister it; use
/// [`Dispatcher::close_subscription`] so the writer stops waiting for it.
///
/// [`Dispatcher::open_subscription`]: crate::Dispatcher::open_subscription
/// [`Dispatcher::close_subscription`]: crate::Dispatcher::close_subscription
#[derive(Debug)]
pub struct Subscription {
    id: u32,
    name: String,
    position: Arc<Position>,
    limit: Arc<Position>,
    closed: AtomicBool,
    log_buffer: Arc<LogBuffer>,
    consumed_tx: crossbeam_channel::Sender<ConductorCommand>,
}

impl Subscription {
    pub(crate) fn new(
        id: u32,
        name: String,
        position: Arc<Position>,
        limit: Arc<Position>,
        log_buffer: Arc<LogBuffer>,
        consumed_tx: crossbeam_channel::Sender<ConductorCommand>,
    ) -> Self {
        Self {
            id,
            name,
            position,
            limit,
            closed: AtomicBool::new(false),
            log_buffer,
            consumed_tx,
        }
    }

    /// The subscription's registration order, starting at 0. In pipeline
    /// mode this is the stage index.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// The name the subscription was registered under.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The subscription's current stream position.
    #[must_use]
    pub fn position(&self) -> i64 {
        self.position.get_volatile()
    }

    /// Whether the subscription has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn position_shared(&self) -> &Arc<Position> {
        &self.position
    }

    pub(crate) fn force_close(&self) {
        self.closed.store(true, Ordering::Release);
        self.position.close();
    }

    /// Reads up to `max_fragments` committed frames, invoking `handler` for
    /// each. Returns the number of frames consumed.
    ///
    /// The handler returns whether the frame was consumed: on `false` the
    /// cursor stays *before* the frame and the next poll delivers it again.
    /// This makes side effects retryable without any replay buffer.
    ///
    /// # Errors
    ///
    /// Returns [`PollError::Closed`] if the subscription or its dispatcher
    /// has been closed, and [`PollError::CorruptFrame`] if a frame header
    /// fails validation (the cursor does not advance past a corrupt frame).
    pub fn poll<F>(&self, mut handler: F, max_fragments: usize) -> Result<usize, PollError>
    where
        F: FnMut(Fragment<'_>) -> bool,
    {
        if self.is_closed() {
            return Err(PollError::Closed);
        }
        let mut pos = self.position.get();
        let limit = self.limit.get_volatile();
        if pos == CLOSED_POSITION || limit == CLOSED_POSITION {
            return Err(PollError::Closed);
        }

        let partition_size = self.log_buffer.partition_size();
        let start = pos;
        let mut consumed = 0;

        while consumed < max_fragments && pos < limit {
            let id = partition_id(pos);
            let offset = partition_offset(pos);
            let partition = self.log_buffer.partition(id);

            let frame_len = partition.get_i32_volatile(length_offset(offset));
            if frame_len <= 0 {
                // Nothing committed here yet, or a claim still in progress.
                break;
            }
            let aligned = align_frame_length(frame_len);
            if frame_len < FRAME_ALIGNMENT || offset + aligned > partition_size {
                self.finish_poll(start, pos);
                return Err(PollError::CorruptFrame {
                    partition_id: id,
                    offset,
                });
            }

            let flags = partition.get_u8(flags_offset(offset));
            if flags & FLAG_PADDING != 0 {
                pos = Self::next_position(id, offset + aligned, partition_size);
                continue;
            }
            if frame_len < HEADER_LENGTH {
                self.finish_poll(start, pos);
                return Err(PollError::CorruptFrame {
                    partition_id: id,
                    offset,
                });
            }

            let next = Self::next_position(id, offset + aligned, partition_size);
            // SAFETY: the frame was committed (positive length) and lies
            // behind the publisher limit, so the recycler cannot touch the
            // partition until this subscription's position passes it.
            let payload = unsafe {
                partition.slice(payload_offset(offset), frame_len - HEADER_LENGTH)
            };
            let fragment = Fragment {
                position: next,
                stream_id: partition.get_i32_volatile(stream_id_offset(offset)),
                payload,
            };
            if !handler(fragment) {
                break;
            }
            pos = next;
            consumed += 1;
        }

        self.finish_poll(start, pos);
        Ok(consumed)
    }

    /// Like [`poll`](Subscription::poll), but spins and then yields until at
    /// least one frame is consumed or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// Propagates the same errors as [`poll`](Subscription::poll).
    pub fn poll_blocking<F>(
        &self,
        mut handler: F,
        max_fragments: usize,
        timeout: Duration,
    ) -> Result<usize, PollError>
    where
        F: FnMut(Fragment<'_>) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut spins = 0u32;
        loop {
            let consumed = self.poll(&mut handler, max_fragments)?;
            if consumed > 0 || Instant::now() >= deadline {
                return Ok(consumed);
            }
            if spins < 64 {
                spins += 1;
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
    }

    fn finish_poll(&self, start: i64, pos: i64) {
        if pos > start {
            self.position.propose_max_ordered(pos);
            // The conductor may already be shutting down; a full or
            // disconnected channel is fine, the signal is best-effort.
            let _ = self.consumed_tx.try_send(ConductorCommand::DataConsumed);
        }
    }

    fn next_position(id: i32, end_offset: i32, partition_size: i32) -> i64 {
        if end_offset >= partition_size {
            position(id + 1, 0)
        } else {
            position(id, end_offset)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::appender::{AppendOutcome, FrameAppender};
    use crate::log_buffer::LogBuffer;

    fn subscription_over(buffer: &Arc<LogBuffer>, limit: i64) -> Subscription {
        // The consumed signal is best-effort; tests drop the receiver.
        let (tx, _rx) = crossbeam_channel::unbounded();
        Subscription::new(
            0,
            "test".to_string(),
            Arc::new(Position::new(0)),
            Arc::new(Position::new(limit)),
            Arc::clone(buffer),
            tx,
        )
    }

    fn append(buffer: &LogBuffer, partition_id: i32, payload: &[u8], stream_id: i32) {
        let partition = buffer.partition(partition_id);
        match FrameAppender.append_frame(partition, payload, stream_id) {
            AppendOutcome::Committed(_) => {}
            AppendOutcome::Filled => panic!("partition unexpectedly filled"),
        }
    }

    #[test]
    fn test_poll_delivers_frames_in_order() {
        let buffer = Arc::new(LogBuffer::new(1024, 3));
        append(&buffer, 0, b"first", 7);
        append(&buffer, 0, b"second", 8);

        let sub = subscription_over(&buffer, position(0, 1024));
        let mut seen = Vec::new();
        let consumed = sub
            .poll(
                |frag| {
                    seen.push((frag.stream_id(), frag.payload().to_vec(), frag.position()));
                    true
                },
                10,
            )
            .unwrap();

        assert_eq!(consumed, 2);
        assert_eq!(seen[0].0, 7);
        assert_eq!(seen[0].1, b"first");
        assert_eq!(seen[1].0, 8);
        assert_eq!(seen[1].1, b"second");
        // The second frame starts where the first one's position points.
        assert_eq!(partition_offset(seen[0].2), 24);
        assert_eq!(sub.position(), seen[1].2);
    }

    #[test]
    fn test_handler_false_leaves_frame_unconsumed() {
        let buffer = Arc::new(LogBuffer::new(1024, 3));
        append(&buffer, 0, b"retry me", 1);

        let sub = subscription_over(&buffer, position(0, 1024));
        let consumed = sub.poll(|_| false, 10).unwrap();
        assert_eq!(consumed, 0);
        assert_eq!(sub.position(), 0);

        // The same frame is delivered again on the next poll.
        let consumed = sub
            .poll(
                |frag| {
                    assert_eq!(frag.payload(), b"retry me");
                    true
                },
                10,
            )
            .unwrap();
        assert_eq!(consumed, 1);
    }

    #[test]
    fn test_poll_stops_at_uncommitted_frame() {
        let buffer = Arc::new(LogBuffer::new(1024, 3));
        append(&buffer, 0, b"visible", 0);
        // A claim in progress behind the limit must halt the reader.
        let partition = buffer.partition(0);
        partition.put_i32_ordered(length_offset(24), -(HEADER_LENGTH + 4));

        let sub = subscription_over(&buffer, position(0, 1024));
        let consumed = sub.poll(|_| true, 10).unwrap();
        assert_eq!(consumed, 1);
        assert_eq!(partition_offset(sub.position()), 24);
    }

    #[test]
    fn test_padding_hops_to_next_partition() {
        let buffer = Arc::new(LogBuffer::new(256, 3));
        // Fill partition 0 close to the end, then let the appender publish
        // trailing padding by rejecting a frame that no longer fits.
        append(&buffer, 0, &[0u8; 200], 0);
        let partition = buffer.partition(0);
        match FrameAppender.append_frame(partition, &[0u8; 100], 0) {
            AppendOutcome::Filled => {}
            AppendOutcome::Committed(_) => panic!("expected fill"),
        }
        append(&buffer, 1, b"next", 5);

        let sub = subscription_over(&buffer, position(1, 256));
        let mut payloads = Vec::new();
        let consumed = sub
            .poll(
                |frag| {
                    payloads.push(frag.payload().to_vec());
                    true
                },
                10,
            )
            .unwrap();

        // Padding is skipped silently; only the two data frames arrive.
        assert_eq!(consumed, 2);
        assert_eq!(payloads[1], b"next");
        assert_eq!(partition_id(sub.position()), 1);
    }

    #[test]
    fn test_limit_gates_reading() {
        let buffer = Arc::new(LogBuffer::new(1024, 3));
        append(&buffer, 0, b"ahead of limit", 0);

        let sub = subscription_over(&buffer, 0);
        assert_eq!(sub.poll(|_| true, 10).unwrap(), 0);
    }

    #[test]
    fn test_closed_subscription_errors() {
        let buffer = Arc::new(LogBuffer::new(1024, 3));
        let sub = subscription_over(&buffer, position(0, 1024));
        sub.force_close();
        assert_eq!(sub.poll(|_| true, 10), Err(PollError::Closed));
    }

    #[test]
    fn test_corrupt_length_reported() {
        let buffer = Arc::new(LogBuffer::new(256, 3));
        let partition = buffer.partition(0);
        // A length running past the end of the partition.
        partition.put_i32_ordered(length_offset(0), 512);

        let sub = subscription_over(&buffer, position(0, 256));
        assert_eq!(
            sub.poll(|_| true, 10),
            Err(PollError::CorruptFrame {
                partition_id: 0,
                offset: 0
            })
        );
        assert_eq!(sub.position(), 0);
    }
}
