//! Persistence seam for the in-memory log.
//!
//! The dispatcher itself is a transit buffer; durability comes from draining
//! a subscription into a [`LogStorage`] implementation. [`LogDrain`] does the
//! plumbing: it polls, hands each frame to the storage and only lets the
//! cursor advance past frames the storage accepted, so a failed write is
//! redelivered on the next drain instead of being lost.

use std::sync::Arc;

use crate::error::PollError;
use crate::subscription::Subscription;

/// A sink for committed frames.
///
/// `position` is the stream position just past the frame; persisting it
/// alongside the payload lets a restarted consumer resume without gaps or
/// duplicates.
pub trait LogStorage {
    /// Error produced by the underlying medium.
    type Error: std::error::Error;

    /// Persists one frame. Must be atomic per frame: on error the frame is
    /// handed in again later.
    fn append(&mut self, position: i64, stream_id: i32, payload: &[u8]) -> Result<(), Self::Error>;

    /// Reads back the frame recorded at exactly `position`, if any.
    fn read(&self, position: i64) -> Result<Option<(i32, Vec<u8>)>, Self::Error>;
}

/// Errors reported by [`LogDrain::drain`].
#[derive(Debug, thiserror::Error)]
pub enum DrainError<E: std::error::Error> {
    /// The subscription could not be read.
    #[error("failed to read from the log: {0}")]
    Poll(#[from] PollError),

    /// The storage rejected a frame. The frame stays in the log and is
    /// redelivered on the next drain.
    #[error("failed to persist frame: {0}")]
    Storage(E),
}

/// Pumps a subscription into a [`LogStorage`].
#[derive(Debug)]
pub struct LogDrain<S> {
    subscription: Arc<Subscription>,
    storage: S,
}

impl<S: LogStorage> LogDrain<S> {
    /// Creates a drain reading from `subscription` into `storage`.
    pub fn new(subscription: Arc<Subscription>, storage: S) -> Self {
        Self {
            subscription,
            storage,
        }
    }

    /// Persists up to `max_fragments` frames. Returns how many frames the
    /// storage accepted.
    ///
    /// # Errors
    ///
    /// Returns [`DrainError::Storage`] if the storage rejected a frame (the
    /// frame is not consumed) and [`DrainError::Poll`] if the subscription
    /// is closed or the log is corrupt.
    pub fn drain(&mut self, max_fragments: usize) -> Result<usize, DrainError<S::Error>> {
        let storage = &mut self.storage;
        let mut failure = None;
        let consumed = self.subscription.poll(
            |fragment| match storage.append(
                fragment.position(),
                fragment.stream_id(),
                fragment.payload(),
            ) {
                Ok(()) => true,
                Err(e) => {
                    failure = Some(e);
                    false
                }
            },
            max_fragments,
        )?;
        match failure {
            Some(e) => Err(DrainError::Storage(e)),
            None => Ok(consumed),
        }
    }

    /// The storage behind this drain.
    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Consumes the drain and returns the storage.
    pub fn into_storage(self) -> S {
        self.storage
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatcherConfig;
    use crate::dispatcher::Dispatcher;
    use std::collections::BTreeMap;

    #[derive(Debug, thiserror::Error)]
    #[error("storage full")]
    struct StorageFull;

    /// Map keyed by stream position, with an optional fail-after fuse.
    #[derive(Debug, Default)]
    struct MemoryStorage {
        frames: BTreeMap<i64, (i32, Vec<u8>)>,
        fail_after: Option<usize>,
    }

    impl LogStorage for MemoryStorage {
        type Error = StorageFull;

        fn append(
            &mut self,
            position: i64,
            stream_id: i32,
            payload: &[u8],
        ) -> Result<(), Self::Error> {
            if self.fail_after == Some(self.frames.len()) {
                return Err(StorageFull);
            }
            self.frames.insert(position, (stream_id, payload.to_vec()));
            Ok(())
        }

        fn read(&self, position: i64) -> Result<Option<(i32, Vec<u8>)>, Self::Error> {
            Ok(self.frames.get(&position).cloned())
        }
    }

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(
            DispatcherConfig::builder()
                .name("drain-test")
                .partition_size(1024)
                .log_window_length(1024)
                .max_frame_divisor(1)
                .subscription("sink")
                .build(),
        )
        .unwrap()
    }

    #[test]
    fn test_drain_persists_frames_with_positions() {
        let d = dispatcher();
        let pos_a = d.offer_with_stream(b"aa", 1);
        let pos_b = d.offer_with_stream(b"bb", 2);

        let mut drain = LogDrain::new(d.subscription("sink").unwrap(), MemoryStorage::default());
        assert_eq!(drain.drain(10).unwrap(), 2);

        let storage = drain.storage();
        assert_eq!(
            storage.read(pos_a).unwrap(),
            Some((1, b"aa".to_vec()))
        );
        assert_eq!(
            storage.read(pos_b).unwrap(),
            Some((2, b"bb".to_vec()))
        );
        assert_eq!(storage.read(9999).unwrap(), None);
    }

    #[test]
    fn test_failed_append_redelivers_the_frame() {
        let d = dispatcher();
        d.offer(b"first");
        d.offer(b"second");

        let storage = MemoryStorage {
            fail_after: Some(1),
            ..MemoryStorage::default()
        };
        let mut drain = LogDrain::new(d.subscription("sink").unwrap(), storage);

        // The first frame lands, the second is refused and stays in the log.
        assert!(matches!(drain.drain(10), Err(DrainError::Storage(_))));
        assert_eq!(drain.storage().frames.len(), 1);

        // Lift the fuse: the refused frame arrives again.
        drain.storage.fail_after = None;
        assert_eq!(drain.drain(10).unwrap(), 1);
        assert_eq!(drain.storage().frames.len(), 2);
        let payloads: Vec<&[u8]> = drain
            .storage()
            .frames
            .values()
            .map(|(_, p)| p.as_slice())
            .collect();
        assert_eq!(payloads, vec![b"first".as_slice(), b"second".as_slice()]);
    }

    #[test]
    fn test_drain_on_closed_dispatcher_errors() {
        let mut d = dispatcher();
        let sub = d.subscription("sink").unwrap();
        d.close();

        let mut drain = LogDrain::new(sub, MemoryStorage::default());
        assert!(matches!(
            drain.drain(10),
            Err(DrainError::Poll(PollError::Closed))
        ));
    }
}
