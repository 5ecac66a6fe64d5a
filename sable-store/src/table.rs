//! Per-database table bundle.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use sable_common::containers::HotMap;
use sable_common::ids::{DbIndex, SLOT_COUNT, SlotId};
use sable_dash::{Cursor, DashTable};

use crate::intent_lock::IntentLockTable;
use crate::key::StoredKey;
use crate::sampling::{DenseHll, TopKeys};
use crate::value::{Value, ValueKind};

/// Primary table: fingerprint → (key, value).
pub type PrimeTable = DashTable<StoredKey, Value>;

/// Expiration table: fingerprint → relative deadline, keyed by the same key bytes.
pub type ExpireTable = DashTable<Vec<u8>, ExpirePeriod>;

/// Handle a watching session leaves behind: flipped when the watched key first changes.
pub type WatcherHandle = Arc<AtomicBool>;

/// 32-bit deadline stored relative to the slice's expire base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpirePeriod(u32);

impl ExpirePeriod {
    /// Encodes an absolute deadline against a base, saturating at the representable maximum.
    #[must_use]
    pub fn from_absolute(deadline_ms: u64, base_ms: u64) -> Self {
        let delta = deadline_ms.saturating_sub(base_ms);
        Self(u32::try_from(delta).unwrap_or(u32::MAX))
    }

    /// Decodes back to an absolute deadline.
    #[must_use]
    pub fn to_absolute(self, base_ms: u64) -> u64 {
        base_ms + u64::from(self.0)
    }

    /// Raw delta in milliseconds.
    #[must_use]
    pub fn delta_ms(self) -> u32 {
        self.0
    }
}

/// Per-slot statistics kept when cluster slot accounting is enabled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotStats {
    /// Live keys hashed into the slot.
    pub key_count: u64,
    /// Reads served for the slot.
    pub total_reads: u64,
    /// Writes applied to the slot.
    pub total_writes: u64,
    /// Object memory attributed to the slot.
    pub memory_bytes: i64,
}

/// Memory statistics for one database.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DbTableStats {
    /// Heap bytes owned by keys and values, excluding inline keys.
    pub obj_memory_usage: i64,
    /// Keys on the inline fast path.
    pub inline_keys: u64,
    /// Heap bytes per value kind.
    pub memory_by_kind: [i64; ValueKind::COUNT],
}

impl DbTableStats {
    /// Applies a signed heap delta for one value kind.
    pub fn add_kind_memory(&mut self, kind: ValueKind, delta: i64) {
        self.obj_memory_usage += delta;
        debug_assert!(
            self.obj_memory_usage >= 0,
            "object memory accounting went negative"
        );
        self.memory_by_kind[kind.index()] += delta;
    }
}

/// One numbered logical database: the prime/expire pair plus auxiliary metadata.
#[derive(Debug)]
pub struct DbTable {
    /// Database index.
    pub index: DbIndex,
    /// Primary key → value table.
    pub prime: PrimeTable,
    /// Key → relative deadline table.
    pub expire: ExpireTable,
    /// Sparse auxiliary 32-bit tags.
    pub mcflag: HotMap<Vec<u8>, u32>,
    /// Transaction intent locks.
    pub trans_locks: IntentLockTable,
    /// Keys watched by sessions awaiting their first write.
    pub watched_keys: HotMap<Vec<u8>, Vec<WatcherHandle>>,
    /// Optional per-slot statistics (cluster mode).
    pub slots_stats: Option<Box<[SlotStats]>>,
    /// Optional frequency sampler.
    pub top_keys: Option<TopKeys>,
    /// Optional cardinality sampler.
    pub dense_hll: Option<DenseHll>,
    /// Resume point of the incremental expiry sweep.
    pub expire_cursor: Cursor,
    /// Buffered keys for the expired-keys event channel.
    pub expired_keys_events: Vec<Vec<u8>>,
    /// Memory statistics.
    pub stats: DbTableStats,
}

impl DbTable {
    /// Creates an empty database.
    #[must_use]
    pub fn new(index: DbIndex, with_slot_stats: bool) -> Self {
        Self {
            index,
            prime: PrimeTable::new(),
            expire: ExpireTable::new(),
            mcflag: HotMap::new(),
            trans_locks: IntentLockTable::new(),
            watched_keys: HotMap::new(),
            slots_stats: with_slot_stats
                .then(|| vec![SlotStats::default(); SLOT_COUNT].into_boxed_slice()),
            top_keys: None,
            dense_hll: None,
            expire_cursor: Cursor::default(),
            expired_keys_events: Vec::new(),
            stats: DbTableStats::default(),
        }
    }

    /// Heap bytes held by the table structures themselves.
    #[must_use]
    pub fn table_memory(&self) -> usize {
        self.prime.mem_usage() + self.expire.mem_usage()
    }

    /// Per-slot statistics for one slot, when tracking is enabled.
    #[must_use]
    pub fn slot_stats(&self, slot: SlotId) -> Option<SlotStats> {
        self.slots_stats
            .as_ref()
            .map(|stats| stats[slot as usize])
    }
}
