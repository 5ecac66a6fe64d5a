//! Identifier vocabulary shared across the storage core.

use std::num::NonZeroU16;

/// Shard owning one slice of the keyspace.
pub type ShardId = u16;

/// Numbered logical database inside a slice.
pub type DbIndex = u16;

/// Transaction identifier stamped on journal records.
pub type TxId = u64;

/// Monotonic log sequence number assigned by the journal.
pub type Lsn = u64;

/// Cluster hash-slot identifier.
pub type SlotId = u16;

/// Highest valid cluster hash slot.
pub const MAX_SLOT_ID: SlotId = 0x3FFF;

/// Number of cluster hash slots.
pub const SLOT_COUNT: usize = MAX_SLOT_ID as usize + 1;

/// Number of shard owners in a process.
///
/// Every database index is owned by exactly one shard, so a running process always has at
/// least one. The `NonZeroU16` representation makes a zero count unrepresentable rather than
/// re-checking it at every division or modulo site (memory-budget partitioning, soft-limit
/// computation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ShardCount(NonZeroU16);

impl ShardCount {
    /// Wraps a raw count, refusing zero.
    #[must_use]
    pub fn new(count: u16) -> Option<Self> {
        NonZeroU16::new(count).map(Self)
    }

    /// The raw count.
    #[must_use]
    pub const fn get(self) -> u16 {
        self.0.get()
    }
}

#[cfg(test)]
mod tests {
    use super::{MAX_SLOT_ID, SLOT_COUNT, ShardCount};
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn zero_shards_is_unrepresentable() {
        assert_that!(ShardCount::new(0), eq(None));
    }

    #[rstest]
    #[case(1)]
    #[case(6)]
    #[case(512)]
    fn shard_count_roundtrips_nonzero_values(#[case] count: u16) {
        let wrapped = ShardCount::new(count).expect("non-zero count must wrap");
        assert_that!(wrapped.get(), eq(count));
    }

    #[rstest]
    fn shard_counts_order_by_raw_value() {
        let small = ShardCount::new(2).expect("non-zero count must wrap");
        let large = ShardCount::new(16).expect("non-zero count must wrap");
        assert_that!(small < large, eq(true));
    }

    #[rstest]
    fn slot_space_bounds_agree() {
        assert_that!(SLOT_COUNT, eq(usize::from(MAX_SLOT_ID) + 1));
        assert_that!(MAX_SLOT_ID.count_ones(), eq(14));
    }
}
