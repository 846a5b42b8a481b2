//! The segmented ring of partitions.
//!
//! A [`LogBuffer`] owns a fixed number of equally sized partitions and the
//! active-partition cursor. The cursor is an absolute, monotonically
//! increasing partition id; the physical slot is `id % partition_count`, so
//! the id itself carries the wrap-around generation and two stream positions
//! from different laps never compare equal.
//!
//! ## Rotation and recycling
//!
//! When a producer observes the active partition as filled it ratchets the
//! cursor forward by one. At the same time the partition *two* slots ahead of
//! the filled one is marked `Draining` together with the stream position its
//! old contents expire at; the conductor later zeroes it once the slowest
//! consumer has passed that threshold. With at least three partitions the
//! publisher limit keeps writers at most one partition ahead of the slowest
//! reader, so a slot is always `Clean` again before the cursor reaches it.

use std::sync::atomic::{AtomicI32, Ordering};

use crossbeam_utils::CachePadded;

use crate::partition::{Partition, STATUS_ACTIVE, STATUS_CLEAN, STATUS_DRAINING};
use crate::position::position;

/// Fixed-size ring of partitions plus the active-partition cursor.
#[derive(Debug)]
pub(crate) struct LogBuffer {
    partitions: Box<[Partition]>,
    partition_size: i32,
    /// Absolute id of the partition currently accepting writes. Only ever
    /// advances (propose-max ratchet), wrapping is implicit in `id % count`.
    active_partition_id: CachePadded<AtomicI32>,
}

impl LogBuffer {
    /// Allocates `partition_count` zeroed partitions of `partition_size`
    /// bytes each. Partition 0 starts active, the rest start clean.
    pub(crate) fn new(partition_size: i32, partition_count: usize) -> Self {
        debug_assert!(partition_count >= 3);
        let partitions: Vec<Partition> = (0..partition_count)
            .map(|i| {
                let status = if i == 0 { STATUS_ACTIVE } else { STATUS_CLEAN };
                Partition::new(partition_size, status)
            })
            .collect();
        Self {
            partitions: partitions.into_boxed_slice(),
            partition_size,
            active_partition_id: CachePadded::new(AtomicI32::new(0)),
        }
    }

    /// Size of each partition in bytes.
    #[inline]
    pub(crate) fn partition_size(&self) -> i32 {
        self.partition_size
    }

    /// The partition serving the given absolute partition id.
    #[inline]
    pub(crate) fn partition(&self, partition_id: i32) -> &Partition {
        debug_assert!(partition_id >= 0);
        &self.partitions[partition_id as usize % self.partitions.len()]
    }

    /// Acquire-ordered read of the active partition id.
    #[inline]
    pub(crate) fn active_partition_id_volatile(&self) -> i32 {
        self.active_partition_id.load(Ordering::Acquire)
    }

    /// Advances the active partition after `partition_id` was observed as
    /// filled.
    ///
    /// Safe to race: multiple producers may observe the fill simultaneously,
    /// the cursor advance is a propose-max ratchet and the `Draining` marking
    /// is idempotent.
    pub(crate) fn on_active_partition_filled(&self, partition_id: i32) {
        let next = partition_id + 1;
        let next_next = partition_id + 2;

        let count = i32::try_from(self.partitions.len()).expect("partition count fits i32");
        if next_next >= count {
            // The slot two ahead still holds data from a previous lap; flag
            // it for recycling before the cursor can rotate into it. Its old
            // contents expire once every consumer passed the start of the
            // partition that followed it.
            let retired_id = next_next - count;
            let slot = self.partition(next_next);
            slot.set_reclaim_at(position(retired_id + 1, 0));
            slot.set_status_ordered(STATUS_DRAINING);
        }

        self.active_partition_id.fetch_max(next, Ordering::AcqRel);
    }

    /// Recycles every `Draining` partition whose contents lie entirely behind
    /// `min_consumer_position`. Returns the number of partitions cleaned.
    ///
    /// Runs on the conductor only; never on the data path.
    pub(crate) fn clean_partitions(&self, min_consumer_position: i64) -> usize {
        let mut cleaned = 0;
        for partition in &*self.partitions {
            if partition.status() == STATUS_DRAINING
                && min_consumer_position >= partition.reclaim_at()
            {
                partition.clean();
                cleaned += 1;
            }
        }
        cleaned
    }
}
