//! Tiered-storage interface.
//!
//! The storage core never blocks on tiered I/O in the hot path: stashes are fire-and-forget,
//! reads hand back a one-shot future that is awaited only at the snapshot flush boundary.

mod future;
mod stub;

pub use future::{ValueFuture, ValuePromise};
pub use stub::InMemoryTieredStorage;

use sable_common::ids::DbIndex;

/// Location of a value inside the tiered backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExternalDescriptor {
    /// Backend offset of the serialized value.
    pub offset: u64,
    /// Serialized length in bytes.
    pub len: u32,
}

/// Cold-value backend consumed by the storage core.
///
/// Implementations own their durability and layout; the core only tracks descriptors and the
/// cool shadow state of its own entries.
pub trait TieredStorage {
    /// Schedules a read of an offloaded value. Never blocks.
    fn read(&self, db: DbIndex, key: &[u8], descriptor: &ExternalDescriptor) -> ValueFuture;

    /// Offers a value for offloading. Returns its descriptor when the backend accepted it.
    fn try_stash(&self, db: DbIndex, key: &[u8], value: &[u8]) -> Option<ExternalDescriptor>;

    /// Withdraws a pending stash, keeping the value in memory.
    fn cancel_stash(&self, db: DbIndex, key: &[u8], descriptor: &ExternalDescriptor);

    /// Drops an offloaded value.
    fn delete(&self, db: DbIndex, descriptor: &ExternalDescriptor);

    /// Releases up to `goal_bytes` of reclaimable backend memory. Returns the bytes released.
    fn reclaim_memory(&self, goal_bytes: usize) -> usize;

    /// Memory the backend could release on demand (cool shadows and caches).
    fn cool_memory_usage(&self) -> usize;

    /// Read-modify-write of an offloaded value. The edit runs when the value arrives; the
    /// returned future resolves with the edited bytes.
    fn modify(
        &self,
        db: DbIndex,
        key: &[u8],
        descriptor: &ExternalDescriptor,
        edit: &mut dyn FnMut(&mut Vec<u8>),
    ) -> ValueFuture;
}
