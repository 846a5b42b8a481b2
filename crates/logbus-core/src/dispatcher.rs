//! The dispatcher: producer-facing API and shared control state.
//!
//! A [`Dispatcher`] multiplexes any number of producers onto one segmented
//! log and fans the committed frames out to named subscriptions. Producers
//! interact only with atomics (the publisher limit, the active partition
//! cursor and the partition tail); all bookkeeping runs on the conductor
//! thread.
//!
//! ## Flow control
//!
//! Writers may run at most `log_window_length` bytes ahead of the slowest
//! relevant subscriber. The *publisher limit* encodes that bound as a stream
//! position; `offer` and `claim` compare the prospective write position
//! against it and report backpressure instead of overwriting unread data.
//! The limit only ever advances, and only the conductor advances it.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use crossbeam_channel::Sender;

use crate::appender::{AppendOutcome, BatchClaimOutcome, ClaimOutcome, FrameAppender};
use crate::claim::{ClaimedFragment, ClaimedFragmentBatch};
use crate::conductor::{Conductor, ConductorCommand};
use crate::config::{DispatchMode, DispatcherConfig};
use crate::error::DispatcherError;
use crate::frame::{FRAME_ALIGNMENT, HEADER_LENGTH};
use crate::log_buffer::LogBuffer;
use crate::partition::STATUS_DRAINING;
use crate::position::{partition_id, partition_offset, position, Position, CLOSED_POSITION};
use crate::subscription::Subscription;

/// `offer` result: the write was refused because it would overrun the
/// slowest subscriber. Retry after consumers made progress.
pub const OFFER_BACKPRESSURED: i64 = -1;

/// `offer` result: the active partition filled up and the dispatcher rotated
/// to the next one. Retry immediately.
pub const OFFER_PARTITION_FILLED: i64 = -2;

/// Result of [`Dispatcher::claim`].
#[derive(Debug)]
pub enum ClaimResult<'a> {
    /// Space reserved; write through the guard and commit.
    Granted(ClaimedFragment<'a>),
    /// Writing now would overrun the slowest subscriber. Retry after
    /// consumers made progress.
    Backpressured,
    /// The active partition filled up and was rotated. Retry immediately.
    PartitionFilled,
}

/// Result of [`Dispatcher::claim_batch`].
#[derive(Debug)]
pub enum BatchClaimResult<'a> {
    /// Space reserved; add fragments through the guard and commit.
    Granted(ClaimedFragmentBatch<'a>),
    /// Writing now would overrun the slowest subscriber.
    Backpressured,
    /// The active partition filled up and was rotated. Retry immediately.
    PartitionFilled,
}

/// Shared state between the producer API and the conductor thread.
#[derive(Debug)]
pub(crate) struct Inner {
    name: String,
    mode: DispatchMode,
    log_buffer: Arc<LogBuffer>,
    log_window_length: i32,
    max_frame_length: usize,
    publisher_position: Arc<Position>,
    publisher_limit: Arc<Position>,
    /// Copy-on-write registry: the conductor replaces the whole vector on
    /// open/close, readers grab a consistent snapshot without locking.
    subscriptions: ArcSwap<Vec<Arc<Subscription>>>,
    next_subscription_id: AtomicU32,
    closed: AtomicBool,
    consumed_tx: Sender<ConductorCommand>,
}

impl Inner {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Registers a new subscription. Conductor context only (plus initial
    /// wiring before the conductor starts).
    pub(crate) fn do_open_subscription(
        &self,
        name: &str,
    ) -> Result<Arc<Subscription>, DispatcherError> {
        if self.is_closed() {
            return Err(DispatcherError::Closed);
        }
        let current = self.subscriptions.load();
        if current.iter().any(|s| s.name() == name) {
            return Err(DispatcherError::DuplicateSubscription(name.to_string()));
        }

        let id = self.next_subscription_id.fetch_add(1, Ordering::Relaxed);
        let sub_position = Arc::new(Position::new(position(
            self.log_buffer.active_partition_id_volatile(),
            0,
        )));
        let limit = match self.mode {
            // Broadcast readers chase the publisher directly.
            DispatchMode::Broadcast => Arc::clone(&self.publisher_position),
            // Pipeline stage n chases stage n-1; the head chases the
            // publisher.
            DispatchMode::Pipeline => current
                .last()
                .map_or_else(|| Arc::clone(&self.publisher_position), |prev| {
                    Arc::clone(prev.position_shared())
                }),
        };
        let subscription = Arc::new(Subscription::new(
            id,
            name.to_string(),
            sub_position,
            limit,
            Arc::clone(&self.log_buffer),
            self.consumed_tx.clone(),
        ));

        let mut next = Vec::with_capacity(current.len() + 1);
        next.extend(current.iter().cloned());
        next.push(Arc::clone(&subscription));
        self.subscriptions.store(Arc::new(next));
        Ok(subscription)
    }

    /// Unregisters a subscription. Conductor context only.
    pub(crate) fn do_close_subscription(&self, name: &str) -> Result<(), DispatcherError> {
        let current = self.subscriptions.load();
        let Some(index) = current.iter().position(|s| s.name() == name) else {
            return Err(DispatcherError::SubscriptionNotFound(name.to_string()));
        };
        let mut next = current.as_ref().clone();
        let removed = next.remove(index);
        self.subscriptions.store(Arc::new(next));
        removed.force_close();
        Ok(())
    }

    pub(crate) fn find_subscription(
        &self,
        name: &str,
    ) -> Result<Arc<Subscription>, DispatcherError> {
        self.subscriptions
            .load()
            .iter()
            .find(|s| s.name() == name)
            .cloned()
            .ok_or_else(|| DispatcherError::SubscriptionNotFound(name.to_string()))
    }

    /// Recomputes the publisher limit from the slowest relevant subscriber.
    /// Returns whether the limit advanced.
    pub(crate) fn update_publisher_limit(&self) -> bool {
        if self.is_closed() {
            return false;
        }
        let anchor = match self.anchor_position() {
            Some(pos) => pos,
            // Without subscribers the writer throttles itself: the limit
            // trails its own previous value by one window.
            None => (self.publisher_limit.get_volatile() - i64::from(self.log_window_length))
                .max(0),
        };

        let mut id = partition_id(anchor);
        let mut offset = partition_offset(anchor) + self.log_window_length;
        if offset >= self.log_buffer.partition_size() {
            id += 1;
            offset = self.log_window_length;
        }
        self.publisher_limit.propose_max_ordered(position(id, offset))
    }

    /// The position of the slowest subscriber the writer must respect, or
    /// `None` if there are no open subscriptions.
    fn anchor_position(&self) -> Option<i64> {
        let subs = self.subscriptions.load();
        match self.mode {
            DispatchMode::Broadcast => subs
                .iter()
                .map(|s| s.position())
                .filter(|&p| p != CLOSED_POSITION)
                .min(),
            // In a pipeline the tail stage is by construction the slowest.
            DispatchMode::Pipeline => subs
                .last()
                .map(|s| s.position())
                .filter(|&p| p != CLOSED_POSITION),
        }
    }

    /// Recycles drained partitions that every consumer has moved past.
    pub(crate) fn clean_partitions(&self) -> usize {
        let min = self
            .min_consumer_position()
            .unwrap_or_else(|| self.publisher_position.get_volatile());
        if min == CLOSED_POSITION {
            return 0;
        }
        self.log_buffer.clean_partitions(min)
    }

    fn min_consumer_position(&self) -> Option<i64> {
        self.subscriptions
            .load()
            .iter()
            .map(|s| s.position())
            .filter(|&p| p != CLOSED_POSITION)
            .min()
    }

    /// Terminal teardown, run on the conductor in response to `Shutdown`.
    pub(crate) fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        self.publisher_limit.close();
        self.publisher_position.close();
        for subscription in self.subscriptions.load().iter() {
            subscription.force_close();
        }
        self.subscriptions.store(Arc::new(Vec::new()));
    }
}

/// A multi-producer, multi-subscriber log dispatcher.
///
/// Producers publish through [`offer`](Dispatcher::offer) (copying) or
/// [`claim`](Dispatcher::claim) (zero-copy); consumers read through
/// [`Subscription::poll`]. Closing the dispatcher (or dropping it) stops the
/// conductor and closes every subscription.
#[derive(Debug)]
pub struct Dispatcher {
    inner: Arc<Inner>,
    conductor: Conductor,
}

impl Dispatcher {
    /// Creates a dispatcher from a validated configuration and spawns its
    /// conductor thread. Subscriptions named in the config are opened before
    /// the first frame can be published.
    ///
    /// # Errors
    ///
    /// Returns [`DispatcherError::InvalidConfig`] if validation fails and
    /// [`DispatcherError::ConductorSpawn`] if the control thread cannot be
    /// started.
    pub fn new(config: DispatcherConfig) -> Result<Self, DispatcherError> {
        config.validate()?;

        let log_buffer = Arc::new(LogBuffer::new(config.partition_size, config.partition_count));
        let (tx, rx) = crossbeam_channel::unbounded();
        let inner = Arc::new(Inner {
            name: config.name.clone(),
            mode: config.mode,
            log_buffer,
            log_window_length: config.log_window_length,
            max_frame_length: config.max_frame_length(),
            publisher_position: Arc::new(Position::new(0)),
            publisher_limit: Arc::new(Position::new(position(0, config.log_window_length))),
            subscriptions: ArcSwap::from_pointee(Vec::new()),
            next_subscription_id: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            consumed_tx: tx.clone(),
        });

        // Initial wiring happens before the conductor exists, so ordering is
        // deterministic; pipeline stages get ids in declaration order.
        for name in &config.subscription_names {
            inner.do_open_subscription(name)?;
        }

        let conductor = Conductor::spawn(&config.name, Arc::clone(&inner), tx, rx)?;
        tracing::debug!(
            dispatcher = %config.name,
            partition_size = config.partition_size,
            partition_count = config.partition_count,
            log_window_length = config.log_window_length,
            mode = ?config.mode,
            "dispatcher created"
        );
        Ok(Self { inner, conductor })
    }

    /// The dispatcher's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The configured dispatch mode.
    #[must_use]
    pub fn mode(&self) -> DispatchMode {
        self.inner.mode
    }

    /// The largest payload `offer` and `claim` accept, in bytes.
    #[must_use]
    pub fn max_frame_length(&self) -> usize {
        self.inner.max_frame_length
    }

    /// The highest committed stream position, or [`CLOSED_POSITION`] after
    /// close.
    #[must_use]
    pub fn publisher_position(&self) -> i64 {
        self.inner.publisher_position.get_volatile()
    }

    /// The current flow-control bound, or [`CLOSED_POSITION`] after close.
    #[must_use]
    pub fn publisher_limit(&self) -> i64 {
        self.inner.publisher_limit.get_volatile()
    }

    /// Number of currently open subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscriptions.load().len()
    }

    /// Whether the dispatcher has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Publishes `message` with stream id 0. See
    /// [`offer_with_stream`](Dispatcher::offer_with_stream).
    pub fn offer(&self, message: &[u8]) -> i64 {
        self.offer_with_stream(message, 0)
    }

    /// Copies `message` into the log and commits it.
    ///
    /// Returns the stream position just past the new frame (always positive)
    /// on success, [`OFFER_BACKPRESSURED`] when the write would overrun the
    /// slowest subscriber or the dispatcher is closed, and
    /// [`OFFER_PARTITION_FILLED`] when the active partition rotated (retry
    /// immediately).
    ///
    /// # Panics
    ///
    /// Panics if `message` reaches [`max_frame_length`] (the bound is
    /// exclusive); oversized payloads are a caller bug, not an operational
    /// condition.
    ///
    /// [`max_frame_length`]: Dispatcher::max_frame_length
    pub fn offer_with_stream(&self, message: &[u8], stream_id: i32) -> i64 {
        assert!(
            message.len() < self.inner.max_frame_length,
            "payload of {} bytes must be smaller than the max frame length of {}",
            message.len(),
            self.inner.max_frame_length
        );

        let (active_id, partition) = match self.writable_partition() {
            Ok(pair) => pair,
            Err(result) => return result,
        };
        match FrameAppender.append_frame(partition, message, stream_id) {
            AppendOutcome::Committed(new_tail) => {
                let committed = position(active_id, new_tail);
                self.inner
                    .publisher_position
                    .propose_max_ordered(committed);
                committed
            }
            AppendOutcome::Filled => {
                self.inner.log_buffer.on_active_partition_filled(active_id);
                OFFER_PARTITION_FILLED
            }
        }
    }

    /// Reserves `payload_length` bytes for zero-copy writing.
    ///
    /// On success the publisher position already covers the claim; readers
    /// stall at the in-progress frame until the guard commits or aborts.
    ///
    /// # Panics
    ///
    /// Panics if `payload_length` reaches [`max_frame_length`] (the bound is
    /// exclusive).
    ///
    /// [`max_frame_length`]: Dispatcher::max_frame_length
    pub fn claim(&self, payload_length: usize, stream_id: i32) -> ClaimResult<'_> {
        assert!(
            payload_length < self.inner.max_frame_length,
            "payload of {payload_length} bytes must be smaller than the max frame length of {}",
            self.inner.max_frame_length
        );

        let (active_id, partition) = match self.writable_partition() {
            Ok(pair) => pair,
            Err(_) => return ClaimResult::Backpressured,
        };
        match FrameAppender.claim(partition, active_id, payload_length, stream_id) {
            ClaimOutcome::Granted(claim) => {
                self.inner
                    .publisher_position
                    .propose_max_ordered(claim.position());
                ClaimResult::Granted(claim)
            }
            ClaimOutcome::Filled => {
                self.inner.log_buffer.on_active_partition_filled(active_id);
                ClaimResult::PartitionFilled
            }
        }
    }

    /// Reserves space for a batch of `fragment_count` fragments totalling
    /// `batch_length` payload bytes, committed atomically.
    ///
    /// # Panics
    ///
    /// Panics if the reservation (payload plus per-fragment framing
    /// overhead) reaches [`max_frame_length`] (the bound is exclusive).
    ///
    /// [`max_frame_length`]: Dispatcher::max_frame_length
    #[allow(clippy::cast_sign_loss)]
    pub fn claim_batch(
        &self,
        fragment_count: usize,
        batch_length: usize,
    ) -> BatchClaimResult<'_> {
        let framing = fragment_count * ((HEADER_LENGTH + FRAME_ALIGNMENT - 1) as usize);
        assert!(
            batch_length + framing < self.inner.max_frame_length,
            "batch of {batch_length} bytes in {fragment_count} fragments must stay smaller than the max frame length of {}",
            self.inner.max_frame_length
        );

        let (active_id, partition) = match self.writable_partition() {
            Ok(pair) => pair,
            Err(_) => return BatchClaimResult::Backpressured,
        };
        match FrameAppender.claim_batch(partition, active_id, fragment_count, batch_length) {
            BatchClaimOutcome::Granted(batch) => {
                self.inner
                    .publisher_position
                    .propose_max_ordered(batch.position());
                BatchClaimResult::Granted(batch)
            }
            BatchClaimOutcome::Filled => {
                self.inner.log_buffer.on_active_partition_filled(active_id);
                BatchClaimResult::PartitionFilled
            }
        }
    }

    /// Resolves the active partition if writing to it is currently allowed,
    /// or the sentinel to return otherwise.
    fn writable_partition(&self) -> Result<(i32, &crate::partition::Partition), i64> {
        if self.inner.is_closed() {
            return Err(OFFER_BACKPRESSURED);
        }
        let limit = self.inner.publisher_limit.get_volatile();
        if limit == CLOSED_POSITION {
            return Err(OFFER_BACKPRESSURED);
        }
        let active_id = self.inner.log_buffer.active_partition_id_volatile();
        let partition = self.inner.log_buffer.partition(active_id);
        if position(active_id, partition.tail_volatile()) >= limit {
            return Err(OFFER_BACKPRESSURED);
        }
        // The cursor can rotate into a slot the conductor has not recycled
        // yet; refuse rather than overwrite unread frames.
        if partition.status() == STATUS_DRAINING {
            return Err(OFFER_BACKPRESSURED);
        }
        Ok((active_id, partition))
    }

    /// Opens a new named subscription starting at the beginning of the
    /// active partition.
    ///
    /// # Errors
    ///
    /// Returns [`DispatcherError::SubscriptionsFixed`] in pipeline mode,
    /// [`DispatcherError::DuplicateSubscription`] if the name is taken and
    /// [`DispatcherError::Closed`] after close.
    pub fn open_subscription(
        &self,
        name: impl Into<String>,
    ) -> Result<Arc<Subscription>, DispatcherError> {
        if self.inner.mode == DispatchMode::Pipeline {
            return Err(DispatcherError::SubscriptionsFixed);
        }
        let (reply, rx) = crossbeam_channel::bounded(1);
        self.conductor_call(
            ConductorCommand::Open {
                name: name.into(),
                reply,
            },
            &rx,
        )
    }

    /// Closes the named subscription, releasing the writer from waiting on
    /// it.
    ///
    /// # Errors
    ///
    /// Returns [`DispatcherError::SubscriptionsFixed`] in pipeline mode and
    /// [`DispatcherError::SubscriptionNotFound`] for unknown names.
    pub fn close_subscription(&self, name: &str) -> Result<(), DispatcherError> {
        if self.inner.mode == DispatchMode::Pipeline {
            return Err(DispatcherError::SubscriptionsFixed);
        }
        let (reply, rx) = crossbeam_channel::bounded(1);
        self.conductor_call(
            ConductorCommand::Close {
                name: name.to_string(),
                reply,
            },
            &rx,
        )
    }

    /// Looks up an open subscription by name. Works in both modes; this is
    /// how pipeline stages obtain their handles.
    ///
    /// # Errors
    ///
    /// Returns [`DispatcherError::SubscriptionNotFound`] for unknown names
    /// and [`DispatcherError::Closed`] after close.
    pub fn subscription(&self, name: &str) -> Result<Arc<Subscription>, DispatcherError> {
        let (reply, rx) = crossbeam_channel::bounded(1);
        self.conductor_call(
            ConductorCommand::Lookup {
                name: name.to_string(),
                reply,
            },
            &rx,
        )
    }

    fn conductor_call<T>(
        &self,
        command: ConductorCommand,
        rx: &crossbeam_channel::Receiver<Result<T, DispatcherError>>,
    ) -> Result<T, DispatcherError> {
        self.conductor
            .sender()
            .send(command)
            .map_err(|_| DispatcherError::Closed)?;
        rx.recv().map_err(|_| DispatcherError::Closed)?
    }

    /// Recomputes the publisher limit immediately instead of waiting for the
    /// conductor. Returns whether the limit advanced.
    ///
    /// The conductor performs this whenever a consumer reports progress;
    /// calling it by hand is only needed for deterministic single-threaded
    /// driving, or to un-throttle a dispatcher with no subscribers.
    pub fn update_publisher_limit(&self) -> bool {
        self.inner.update_publisher_limit()
    }

    /// Closes the dispatcher: stops the conductor, closes the publisher
    /// positions and every subscription. Idempotent; also runs on drop.
    pub fn close(&mut self) {
        self.conductor.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn small_dispatcher() -> Dispatcher {
        // One full-partition window and a permissive frame policy: every
        // geometry effect in these tests comes from partition boundaries.
        Dispatcher::new(
            DispatcherConfig::builder()
                .name("test")
                .partition_size(1024)
                .partition_count(3)
                .log_window_length(1024)
                .max_frame_divisor(1)
                .build(),
        )
        .unwrap()
    }

    #[test]
    fn test_offer_returns_increasing_positions() {
        let d = small_dispatcher();
        let p1 = d.offer(&[1u8; 100]);
        let p2 = d.offer(&[2u8; 100]);
        let p3 = d.offer(&[3u8; 100]);

        assert_eq!(p1, position(0, 112));
        assert_eq!(p2, position(0, 224));
        assert_eq!(p3, position(0, 336));
        assert_eq!(d.publisher_position(), p3);
    }

    #[test]
    fn test_partition_fill_rotates_and_retry_succeeds() {
        let d = small_dispatcher();
        for _ in 0..3 {
            assert!(d.offer(&[0u8; 100]) > 0);
        }

        // 912 aligned bytes do not fit behind offset 336 of a 1 KiB
        // partition: the offer pads out the partition and rotates.
        assert_eq!(d.offer(&[0u8; 900]), OFFER_PARTITION_FILLED);

        // No subscribers, so nothing drives the conductor; advance the
        // window by hand.
        assert!(d.update_publisher_limit());
        let pos = d.offer(&[0u8; 900]);
        assert!(pos > 0);
        assert_eq!(partition_id(pos), 1);
        assert_eq!(partition_offset(pos), 912);
    }

    #[test]
    fn test_backpressure_without_subscribers() {
        let d = small_dispatcher();
        for _ in 0..3 {
            assert!(d.offer(&[0u8; 100]) > 0);
        }
        assert_eq!(d.offer(&[0u8; 900]), OFFER_PARTITION_FILLED);
        // The initial window only covers partition 0.
        assert_eq!(d.offer(&[0u8; 900]), OFFER_BACKPRESSURED);
    }

    fn default_policy_dispatcher() -> Dispatcher {
        // Default policy: max frame = partition_size / 16 = 64 bytes.
        Dispatcher::new(DispatcherConfig::builder().partition_size(1024).build()).unwrap()
    }

    #[test]
    #[should_panic(expected = "smaller than the max frame length")]
    fn test_offer_at_max_frame_length_panics() {
        let d = default_policy_dispatcher();
        // The bound is exclusive: exactly max_frame_length is already too big.
        let _ = d.offer(&[0u8; 64]);
    }

    #[test]
    #[should_panic(expected = "smaller than the max frame length")]
    fn test_claim_at_max_frame_length_panics() {
        let d = default_policy_dispatcher();
        let _ = d.claim(64, 0);
    }

    #[test]
    fn test_payload_below_max_frame_length_accepted() {
        let d = default_policy_dispatcher();
        assert_eq!(d.max_frame_length(), 64);
        assert!(d.offer(&[0u8; 63]) > 0);
    }

    #[test]
    fn test_offer_and_poll_round_trip() {
        let d = small_dispatcher();
        let sub = d.open_subscription("reader").unwrap();

        d.offer_with_stream(b"alpha", 1);
        d.offer_with_stream(b"beta", 2);

        let mut seen = Vec::new();
        let consumed = sub
            .poll(
                |frag| {
                    seen.push((frag.stream_id(), frag.payload().to_vec()));
                    true
                },
                10,
            )
            .unwrap();
        assert_eq!(consumed, 2);
        assert_eq!(seen, vec![(1, b"alpha".to_vec()), (2, b"beta".to_vec())]);
    }

    #[test]
    fn test_claim_round_trip() {
        let d = small_dispatcher();
        let sub = d.open_subscription("reader").unwrap();

        let ClaimResult::Granted(mut claim) = d.claim(5, 9) else {
            panic!("claim rejected");
        };
        claim.payload_mut().copy_from_slice(b"claim");
        let committed = claim.position();
        claim.commit();
        assert_eq!(d.publisher_position(), committed);

        let consumed = sub
            .poll(
                |frag| {
                    assert_eq!(frag.payload(), b"claim");
                    assert_eq!(frag.stream_id(), 9);
                    true
                },
                10,
            )
            .unwrap();
        assert_eq!(consumed, 1);
    }

    #[test]
    fn test_batch_claim_round_trip() {
        let d = small_dispatcher();
        let sub = d.open_subscription("reader").unwrap();

        let BatchClaimResult::Granted(mut batch) = d.claim_batch(2, 10) else {
            panic!("batch rejected");
        };
        batch.next_fragment(4, 1).copy_from_slice(b"aaaa");
        batch.next_fragment(6, 2).copy_from_slice(b"bbbbbb");
        batch.commit();

        let mut seen = Vec::new();
        sub.poll(
            |frag| {
                seen.push((frag.stream_id(), frag.payload().to_vec()));
                true
            },
            10,
        )
        .unwrap();
        assert_eq!(seen, vec![(1, b"aaaa".to_vec()), (2, b"bbbbbb".to_vec())]);
    }

    fn windowed_dispatcher() -> Dispatcher {
        Dispatcher::new(
            DispatcherConfig::builder()
                .name("windowed")
                .partition_size(1024)
                .log_window_length(512)
                .max_frame_divisor(1)
                .build(),
        )
        .unwrap()
    }

    #[test]
    fn test_stalled_broadcast_subscriber_caps_the_limit() {
        let d = windowed_dispatcher();
        let fast = d.open_subscription("fast").unwrap();
        let _slow = d.open_subscription("slow").unwrap();

        while d.offer(&[0u8; 100]) > 0 {}
        fast.poll(|_| true, 100).unwrap();

        // "slow" never consumed anything, so the window stays anchored at
        // position 0 regardless of how far "fast" got.
        assert!(!d.update_publisher_limit());
        assert_eq!(d.publisher_limit(), position(0, 512));
        assert_eq!(d.offer(&[0u8; 100]), OFFER_BACKPRESSURED);
    }

    #[test]
    fn test_closing_the_stalled_subscriber_releases_the_writer() {
        let d = windowed_dispatcher();
        let fast = d.open_subscription("fast").unwrap();
        let slow = d.open_subscription("slow").unwrap();

        while d.offer(&[0u8; 100]) > 0 {}
        fast.poll(|_| true, 100).unwrap();
        d.close_subscription("slow").unwrap();
        assert!(slow.is_closed());
        assert_eq!(d.subscriber_count(), 1);

        // The conductor may already have advanced the limit while handling
        // the close; the manual update is just a deterministic backstop.
        d.update_publisher_limit();
        assert_eq!(d.publisher_limit(), position(1, 512));
        assert!(d.offer(&[0u8; 100]) > 0);
    }

    #[test]
    fn test_pipeline_stages_consume_in_order() {
        let d = Dispatcher::new(
            DispatcherConfig::builder()
                .name("pipe")
                .partition_size(1024)
                .log_window_length(1024)
                .max_frame_divisor(1)
                .mode(DispatchMode::Pipeline)
                .subscription("head")
                .subscription("tail")
                .build(),
        )
        .unwrap();
        let head = d.subscription("head").unwrap();
        let tail = d.subscription("tail").unwrap();
        assert_eq!(head.id(), 0);
        assert_eq!(tail.id(), 1);

        assert!(d.offer(b"staged") > 0);

        // The tail stage cannot overtake the head stage.
        assert_eq!(tail.poll(|_| true, 10).unwrap(), 0);
        assert_eq!(head.poll(|_| true, 10).unwrap(), 1);
        assert_eq!(
            tail.poll(
                |frag| {
                    assert_eq!(frag.payload(), b"staged");
                    true
                },
                10
            )
            .unwrap(),
            1
        );
    }

    #[test]
    fn test_pipeline_mode_fixes_subscriptions() {
        let d = Dispatcher::new(
            DispatcherConfig::builder()
                .mode(DispatchMode::Pipeline)
                .subscription("only")
                .build(),
        )
        .unwrap();
        assert!(matches!(
            d.open_subscription("late"),
            Err(DispatcherError::SubscriptionsFixed)
        ));
        assert_eq!(
            d.close_subscription("only"),
            Err(DispatcherError::SubscriptionsFixed)
        );
        // Lookup still works.
        assert!(d.subscription("only").is_ok());
    }

    #[test]
    fn test_duplicate_subscription_rejected() {
        let d = small_dispatcher();
        d.open_subscription("reader").unwrap();
        assert!(matches!(
            d.open_subscription("reader"),
            Err(DispatcherError::DuplicateSubscription(name)) if name == "reader"
        ));
    }

    #[test]
    fn test_close_is_terminal_and_idempotent() {
        let mut d = small_dispatcher();
        let sub = d.open_subscription("reader").unwrap();
        assert!(d.offer(b"x") > 0);

        d.close();
        d.close();

        assert!(d.is_closed());
        assert_eq!(d.offer(b"x"), OFFER_BACKPRESSURED);
        assert_eq!(d.publisher_position(), CLOSED_POSITION);
        assert_eq!(d.publisher_limit(), CLOSED_POSITION);
        assert!(sub.is_closed());
        assert_eq!(d.subscriber_count(), 0);
        assert!(matches!(
            d.open_subscription("late"),
            Err(DispatcherError::Closed)
        ));
    }

    #[test]
    fn test_concurrent_producers_and_consumer_preserve_frames() {
        let d = Arc::new(
            Dispatcher::new(
                DispatcherConfig::builder()
                    .name("e2e")
                    .partition_size(4096)
                    .partition_count(3)
                    .log_window_length(1024)
                    .max_frame_divisor(16)
                    .subscription("sink")
                    .build(),
            )
            .unwrap(),
        );
        let sub = d.subscription("sink").unwrap();

        const PRODUCERS: usize = 3;
        const PER_PRODUCER: usize = 400;

        let mut producers = Vec::new();
        for t in 0..PRODUCERS {
            let d = Arc::clone(&d);
            producers.push(thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    let msg = (i as u64).to_le_bytes();
                    loop {
                        let result = d.offer_with_stream(&msg, i32::try_from(t).unwrap());
                        if result > 0 {
                            break;
                        }
                        if result == OFFER_BACKPRESSURED {
                            thread::yield_now();
                        }
                    }
                }
            }));
        }

        // Per-producer sequences must arrive in order; interleaving across
        // producers is arbitrary.
        let mut next_expected = [0u64; PRODUCERS];
        let mut total = 0usize;
        while total < PRODUCERS * PER_PRODUCER {
            let consumed = sub
                .poll_blocking(
                    |frag| {
                        let t = usize::try_from(frag.stream_id()).unwrap();
                        let mut buf = [0u8; 8];
                        buf.copy_from_slice(frag.payload());
                        assert_eq!(u64::from_le_bytes(buf), next_expected[t]);
                        next_expected[t] += 1;
                        true
                    },
                    64,
                    Duration::from_secs(5),
                )
                .unwrap();
            assert!(consumed > 0, "consumer starved");
            total += consumed;
        }

        for p in producers {
            p.join().unwrap();
        }
        assert_eq!(next_expected, [PER_PRODUCER as u64; PRODUCERS]);
    }
}
