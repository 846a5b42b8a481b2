//! Error types for the dispatcher.
//!
//! The split mirrors the two halves of the system: control-path operations
//! (configuration, subscription management, lifecycle) return rich
//! [`DispatcherError`] values, while the data path stays allocation-free and
//! reports backpressure through sentinel return values — backpressure is
//! never an error. The only data-path failure that surfaces as an error is
//! [`PollError::CorruptFrame`], which indicates a bug rather than an
//! operational condition and must not be silently skipped.

/// Errors reported by control-path operations on a dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatcherError {
    /// The dispatcher configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A subscription with the same name is already registered.
    #[error("subscription with name '{0}' already exists")]
    DuplicateSubscription(String),

    /// No subscription with the given name is registered.
    #[error("subscription with name '{0}' is not registered")]
    SubscriptionNotFound(String),

    /// Subscriptions cannot be opened or closed dynamically in pipeline
    /// mode; the chain is wired once at construction.
    #[error("subscriptions are fixed in pipeline mode")]
    SubscriptionsFixed,

    /// The conductor thread could not be spawned.
    #[error("failed to spawn conductor thread: {0}")]
    ConductorSpawn(String),

    /// The dispatcher has been closed.
    #[error("dispatcher is closed")]
    Closed,
}

/// Errors reported while polling a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PollError {
    /// The subscription (or its dispatcher) has been closed.
    #[error("subscription is closed")]
    Closed,

    /// A frame header failed validation. Continuing would misinterpret
    /// offsets, so the reader must stop instead of skipping.
    #[error("corrupt frame header in partition {partition_id} at offset {offset}")]
    CorruptFrame {
        /// Absolute id of the partition containing the bad header.
        partition_id: i32,
        /// Byte offset of the frame within the partition.
        offset: i32,
    },
}
