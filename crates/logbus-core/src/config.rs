//! Dispatcher configuration.
//!
//! All sizing knobs live here: partition geometry, the flow-control window
//! and the max-frame policy. Values are validated up front so the data path
//! never has to re-check them.

use crate::error::DispatcherError;
use crate::frame::FRAME_ALIGNMENT;

/// Default size of each partition in bytes (1 MiB).
pub const DEFAULT_PARTITION_SIZE: i32 = 1 << 20;

/// Smallest supported partition size.
pub const MIN_PARTITION_SIZE: i32 = 128;

/// Default number of partitions in the ring.
pub const DEFAULT_PARTITION_COUNT: usize = 3;

/// Minimum number of partitions. With fewer than three, a partition could be
/// rotated into before the recycler has had a chance to clean it.
pub const MIN_PARTITION_COUNT: usize = 3;

/// Default divisor for the max-frame-length policy
/// (`max_frame_length = partition_size / divisor`).
pub const DEFAULT_MAX_FRAME_DIVISOR: i32 = 16;

/// How subscribers relate to each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    /// Every subscriber independently sees every frame; the writer is gated
    /// by the slowest subscriber.
    #[default]
    Broadcast,

    /// Subscribers form an ordered chain: each one may only read what the
    /// previous one has consumed. The chain is wired at construction and
    /// cannot change afterwards.
    Pipeline,
}

/// Configuration for a [`Dispatcher`](crate::Dispatcher).
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Name of the dispatcher, used in logs and thread names.
    pub name: String,

    /// Size of each partition in bytes. Must be a multiple of the frame
    /// alignment (8 bytes).
    pub partition_size: i32,

    /// Number of partitions in the ring.
    pub partition_count: usize,

    /// How far (in bytes of stream position) the publisher limit may run
    /// ahead of the slowest relevant subscriber.
    pub log_window_length: i32,

    /// Max-frame policy: the largest accepted payload is
    /// `partition_size / max_frame_divisor`.
    pub max_frame_divisor: i32,

    /// Broadcast or pipeline semantics.
    pub mode: DispatchMode,

    /// Subscriptions opened at construction. Required wiring for pipeline
    /// mode; optional convenience for broadcast mode.
    pub subscription_names: Vec<String>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            name: "logbus".to_string(),
            partition_size: DEFAULT_PARTITION_SIZE,
            partition_count: DEFAULT_PARTITION_COUNT,
            log_window_length: DEFAULT_PARTITION_SIZE / 4,
            max_frame_divisor: DEFAULT_MAX_FRAME_DIVISOR,
            mode: DispatchMode::Broadcast,
            subscription_names: Vec::new(),
        }
    }
}

impl DispatcherConfig {
    /// Creates a builder with default values.
    #[must_use]
    pub fn builder() -> DispatcherConfigBuilder {
        DispatcherConfigBuilder::default()
    }

    /// The largest accepted payload length under this configuration.
    #[must_use]
    pub fn max_frame_length(&self) -> usize {
        (self.partition_size / self.max_frame_divisor) as usize
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`DispatcherError::InvalidConfig`] describing the first
    /// violated constraint.
    pub fn validate(&self) -> Result<(), DispatcherError> {
        if self.partition_size < MIN_PARTITION_SIZE {
            return Err(DispatcherError::InvalidConfig(format!(
                "partition size {} is below the minimum of {MIN_PARTITION_SIZE}",
                self.partition_size
            )));
        }
        if self.partition_size % FRAME_ALIGNMENT != 0 {
            return Err(DispatcherError::InvalidConfig(format!(
                "partition size {} is not a multiple of the frame alignment ({FRAME_ALIGNMENT})",
                self.partition_size
            )));
        }
        if self.partition_count < MIN_PARTITION_COUNT {
            return Err(DispatcherError::InvalidConfig(format!(
                "partition count {} is below the minimum of {MIN_PARTITION_COUNT}",
                self.partition_count
            )));
        }
        if self.log_window_length <= 0 || self.log_window_length > self.partition_size {
            return Err(DispatcherError::InvalidConfig(format!(
                "log window length {} must be in 1..={}",
                self.log_window_length, self.partition_size
            )));
        }
        if self.max_frame_divisor < 1 {
            return Err(DispatcherError::InvalidConfig(format!(
                "max frame divisor {} must be at least 1",
                self.max_frame_divisor
            )));
        }
        if self.mode == DispatchMode::Pipeline && self.subscription_names.is_empty() {
            return Err(DispatcherError::InvalidConfig(
                "pipeline mode requires at least one initial subscription".to_string(),
            ));
        }
        let mut names = self.subscription_names.clone();
        names.sort_unstable();
        names.dedup();
        if names.len() != self.subscription_names.len() {
            return Err(DispatcherError::InvalidConfig(
                "initial subscription names must be unique".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`DispatcherConfig`].
#[derive(Debug, Default)]
pub struct DispatcherConfigBuilder {
    name: Option<String>,
    partition_size: Option<i32>,
    partition_count: Option<usize>,
    log_window_length: Option<i32>,
    max_frame_divisor: Option<i32>,
    mode: Option<DispatchMode>,
    subscription_names: Vec<String>,
}

impl DispatcherConfigBuilder {
    /// Sets the dispatcher name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the partition size in bytes.
    #[must_use]
    pub fn partition_size(mut self, size: i32) -> Self {
        self.partition_size = Some(size);
        self
    }

    /// Sets the number of partitions.
    #[must_use]
    pub fn partition_count(mut self, count: usize) -> Self {
        self.partition_count = Some(count);
        self
    }

    /// Sets the flow-control window length in bytes.
    #[must_use]
    pub fn log_window_length(mut self, length: i32) -> Self {
        self.log_window_length = Some(length);
        self
    }

    /// Sets the max-frame divisor policy.
    #[must_use]
    pub fn max_frame_divisor(mut self, divisor: i32) -> Self {
        self.max_frame_divisor = Some(divisor);
        self
    }

    /// Sets the dispatch mode.
    #[must_use]
    pub fn mode(mut self, mode: DispatchMode) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Adds a subscription to open at construction.
    #[must_use]
    pub fn subscription(mut self, name: impl Into<String>) -> Self {
        self.subscription_names.push(name.into());
        self
    }

    /// Builds the configuration. Defaults fill in anything unset; the window
    /// defaults to a quarter of the partition size.
    #[must_use]
    pub fn build(self) -> DispatcherConfig {
        let partition_size = self.partition_size.unwrap_or(DEFAULT_PARTITION_SIZE);
        DispatcherConfig {
            name: self.name.unwrap_or_else(|| "logbus".to_string()),
            partition_size,
            partition_count: self.partition_count.unwrap_or(DEFAULT_PARTITION_COUNT),
            log_window_length: self.log_window_length.unwrap_or(partition_size / 4),
            max_frame_divisor: self.max_frame_divisor.unwrap_or(DEFAULT_MAX_FRAME_DIVISOR),
            mode: self.mode.unwrap_or_default(),
            subscription_names: self.subscription_names,
        }
    }
}
