//! # logbus-core
//!
//! A lock-free, in-process message dispatcher over a segmented ring buffer.
//!
//! Producers publish variable-length frames into a ring of fixed-size
//! partitions; any number of named subscriptions consume them, either
//! independently (*broadcast*) or as an ordered chain of stages
//! (*pipeline*). The hot path is wait-free for readers and lock-free for
//! writers: coordination happens entirely through atomic positions, and all
//! bookkeeping (flow control, partition recycling, subscription management)
//! runs on a single background conductor thread.
//!
//! ## Quick start
//!
//! ```
//! use logbus_core::{Dispatcher, DispatcherConfig};
//!
//! let dispatcher = Dispatcher::new(
//!     DispatcherConfig::builder()
//!         .name("example")
//!         .partition_size(64 * 1024)
//!         .build(),
//! )?;
//! let subscription = dispatcher.open_subscription("reader")?;
//!
//! let position = dispatcher.offer_with_stream(b"hello", 1);
//! assert!(position > 0);
//!
//! let consumed = subscription.poll(
//!     |frame| {
//!         assert_eq!(frame.payload(), b"hello");
//!         assert_eq!(frame.stream_id(), 1);
//!         true
//!     },
//!     16,
//! )?;
//! assert_eq!(consumed, 1);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Design
//!
//! - **Stream positions.** Every frame has a totally ordered `i64` position
//!   composed of an absolute partition id and an offset within the
//!   partition; see [`position`](crate::position::position).
//! - **Flow control.** Writers may run at most one configurable window
//!   ahead of the slowest relevant subscriber; `offer` reports backpressure
//!   with a sentinel instead of blocking or overwriting.
//! - **Zero-copy.** [`Dispatcher::claim`] hands producers a scoped write
//!   guard into the buffer, and [`Subscription::poll`] lends consumers the
//!   payload bytes in place.
//! - **Durability.** The dispatcher is a transit buffer; pair a
//!   subscription with a [`LogStorage`] via [`LogDrain`] to persist frames.

#![deny(missing_docs)]
// Unsafe code is confined to the partition storage primitives.
#![deny(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod appender;
pub mod claim;
mod conductor;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod frame;
mod log_buffer;
mod partition;
pub mod position;
pub mod storage;
pub mod subscription;

pub use claim::{ClaimedFragment, ClaimedFragmentBatch};
pub use config::{DispatchMode, DispatcherConfig, DispatcherConfigBuilder};
pub use dispatcher::{
    BatchClaimResult, ClaimResult, Dispatcher, OFFER_BACKPRESSURED, OFFER_PARTITION_FILLED,
};
pub use error::{DispatcherError, PollError};
pub use position::{Position, CLOSED_POSITION};
pub use storage::{DrainError, LogDrain, LogStorage};
pub use subscription::{Fragment, Subscription};
