//! Per-shard keyspace slice: the owner of the prime and expire tables.
//!
//! A `DbSlice` holds a family of numbered logical databases for one shard, performs every read
//! and write against them, enforces the shard's memory budget through insertion-time eviction
//! and heartbeat sweeps, and feeds pre-mutation change notifications to registered observers
//! (snapshots, slot migration). The slice is a single-threaded structure driven by its shard
//! owner; cross-thread interaction happens only through the watcher/invalidation handles it
//! hands out.

mod intent_lock;
mod key;
mod latch;
mod sampling;
mod slice;
mod slot_set;
mod table;
mod value;

pub use intent_lock::{IntentLockTable, LockMode};
pub use key::StoredKey;
pub use latch::{FiberAtomicGuard, LocalLatch, in_atomic_section};
pub use sampling::{DenseHll, TopKeys};
pub use slice::change::{
    BucketChange, ChangeCallback, ChangeReq, EntryView, MovedCallback, SnapshotScanStep,
};
pub use slice::eviction::{DocDeletionCallback, InvalidationSink};
pub use slice::expiry::{DeleteExpiredStats, ExpireFlags, ExpireParams, TimeUnit};
pub use slice::flush::FlushSlotsTask;
pub use slice::updater::AutoUpdater;
pub use slice::{
    AddOrFindResult, DbContext, DbSlice, DbStats, FoundMutable, ItAndExp, SliceEvents, Stats,
    keyspace_event_channel,
};
pub use slot_set::SlotSet;
pub use table::{DbTable, DbTableStats, ExpirePeriod, ExpireTable, PrimeTable, SlotStats};
pub use value::{StreamEntry, Value, ValueKind};
