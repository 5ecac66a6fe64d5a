//! Insertion-time policy hooks.

use crate::cursor::Cursor;
use crate::table::{BucketCoord, DashTable, STASH_BUCKETS};

/// The bucket set examined when an insert collides: the home bucket, its probe neighbor, and the
/// segment's stash buckets. Garbage collection and eviction operate on this set because it names
/// exactly the buckets that must yield a slot for the insert to succeed.
#[derive(Debug, Clone, Copy)]
pub struct HotBuckets {
    /// Fingerprint of the colliding key.
    pub key_hash: u64,
    /// Segment under pressure.
    pub segment: u32,
    /// Home and probe bucket coordinates.
    pub regular: [BucketCoord; 2],
    /// Stash bucket coordinates of the segment.
    pub stash: [BucketCoord; STASH_BUCKETS],
}

/// Insertion policy consulted when a segment runs out of room.
///
/// `insert_new` drives the hooks in order: `can_grow` gates a segment split, then
/// `garbage_collect` and `evict` get a chance to free slots in the hot bucket set. Hooks receive
/// the table itself so they can delete entries through the regular table API; they must not
/// suspend.
pub trait EvictionPolicy<K, V> {
    /// Whether the table may allocate another segment.
    fn can_grow(&mut self, table: &DashTable<K, V>) -> bool {
        let _ = table;
        true
    }

    /// Notification that a segment split happened.
    fn record_split(&mut self, segment: u32) {
        let _ = segment;
    }

    /// Notification that an entry moved between buckets (displacement or split).
    fn on_move(&mut self, source: Cursor, dest: Cursor) {
        let _ = (source, dest);
    }

    /// Lazily drops expired entries in the hot buckets. Returns how many were freed.
    fn garbage_collect(&mut self, hot: &HotBuckets, table: &mut DashTable<K, V>) -> u32 {
        let _ = (hot, table);
        0
    }

    /// Evicts up to one entry from the hot buckets. Returns how many were evicted.
    fn evict(&mut self, hot: &HotBuckets, table: &mut DashTable<K, V>) -> u32 {
        let _ = (hot, table);
        0
    }
}

/// Policy that always grows and never evicts. Used by tables without a memory budget of their
/// own, like the expire table.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEvictionPolicy;

impl<K, V> EvictionPolicy<K, V> for NoopEvictionPolicy {}

/// Read-path promotion policy consulted by `bump_up`.
pub trait BumpPolicy<K> {
    /// Whether the entry may be promoted. Sticky entries typically refuse.
    fn can_bump(&self, key: &K) -> bool;

    /// Notification that the promotion relocated an entry between buckets.
    fn on_move(&mut self, source: Cursor, dest: Cursor) {
        let _ = (source, dest);
    }
}
