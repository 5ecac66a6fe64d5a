//! The per-shard keyspace slice.

pub(crate) mod change;
pub(crate) mod eviction;
pub(crate) mod expiry;
pub(crate) mod flush;
pub(crate) mod updater;

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::atomic::Ordering;

use sable_common::config::StoreConfig;
use sable_common::containers::{HotMap, HotSet};
use sable_common::error::{OpResult, OpStatus};
use sable_common::hash::{key_fingerprint, key_slot};
use sable_common::ids::{DbIndex, ShardId};
use sable_dash::{BucketCoord, Cursor, SlotPos};
use sable_journal::ShardJournal;
use sable_tiering::TieredStorage;

use crate::key::StoredKey;
use crate::latch::LocalLatch;
use crate::sampling::{DenseHll, TopKeys};
use crate::slice::change::{
    BucketChange, ChangeCallback, ChangeReq, EntryView, ExpireOutcome, MovedCallback,
    SnapshotScanStep,
};
use crate::slice::eviction::{
    DeferredSetDrop, DeletionContext, DocDeletionCallback, InvalidationSink, PrimeEvictionPolicy,
    SliceBumpPolicy, account_kind_memory, perform_deletion, queue_invalidation,
};
use crate::slice::flush::ActiveSlotFlush;
use crate::slice::updater::AutoUpdater;
use crate::slot_set::SlotSet;
use crate::table::{DbTable, DbTableStats, ExpirePeriod, PrimeTable, WatcherHandle};
use crate::value::{Value, ValueKind};

/// Reclaim target floor kept ahead of tiered-storage pressure, covering a potential segment
/// split.
const TIERED_RED_LINE_BYTES: i64 = 40 * 1024;

/// Name of the keyspace-event channel carrying expirations and evictions for one database.
///
/// Expired keys buffered by the slice are published here, each key as one message.
#[must_use]
pub fn keyspace_event_channel(db: DbIndex) -> String {
    format!("__keyevent@{db}__:expired")
}

/// Per-operation context: the target database and the caller's clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbContext {
    /// Target database index.
    pub db: DbIndex,
    /// Current time in milliseconds.
    pub time_now_ms: u64,
}

/// Counters of notable slice events since startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SliceEvents {
    /// Keys evicted under memory pressure.
    pub evicted_keys: u64,
    /// Keys evicted by the post-insert debt convergence path.
    pub hard_evictions: u64,
    /// Keys removed because their deadline passed.
    pub expired_keys: u64,
    /// Expired keys collected by the insertion-time garbage pass.
    pub garbage_collected: u64,
    /// Entries examined by the insertion-time garbage pass.
    pub garbage_checked: u64,
    /// Entries promoted out of stash buckets.
    pub stash_unloaded: u64,
    /// Cache-mode read promotions.
    pub bumpups: u64,
    /// Successful lookups.
    pub hits: u64,
    /// Failed lookups.
    pub misses: u64,
    /// Mutating lookups and inserts.
    pub mutations: u64,
    /// Inserts rejected for memory.
    pub insertion_rejections: u64,
    /// Completed post-mutation updates.
    pub update: u64,
    /// Read hits served from RAM-resident values.
    pub ram_hits: u64,
    /// Read hits served from cool tiered values.
    pub ram_cool_hits: u64,
    /// Read hits that would require tiered I/O.
    pub ram_misses: u64,
}

/// Read-only iterator pair over the prime and expire tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItAndExp {
    /// Prime-table position.
    pub it: SlotPos,
    /// Expire-table position, when the entry carries a deadline.
    pub exp_it: Option<SlotPos>,
}

/// Mutable lookup result: the iterator pair plus the scoped updater.
#[derive(Debug)]
pub struct FoundMutable {
    /// Prime-table position.
    pub it: SlotPos,
    /// Expire-table position, when the entry carries a deadline.
    pub exp_it: Option<SlotPos>,
    /// Scoped post-mutation updater; must be run or cancelled.
    pub updater: AutoUpdater,
}

/// Result of add-or-find: the mutable lookup plus whether the entry was created.
#[derive(Debug)]
pub struct AddOrFindResult {
    /// Prime-table position.
    pub it: SlotPos,
    /// Expire-table position, when the entry carries a deadline.
    pub exp_it: Option<SlotPos>,
    /// Scoped post-mutation updater; must be run or cancelled.
    pub updater: AutoUpdater,
    /// Whether the key was absent and has been inserted with an empty value.
    pub is_new: bool,
}

/// Aggregated statistics for one database.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DbStats {
    /// Memory statistics.
    pub table: DbTableStats,
    /// Live keys.
    pub key_count: u64,
    /// Keys with deadlines.
    pub expire_count: u64,
    /// Prime-table slot capacity.
    pub prime_capacity: u64,
    /// Expire-table slot capacity.
    pub expire_capacity: u64,
    /// Bytes held by the table structures.
    pub table_mem_usage: u64,
}

/// Point-in-time statistics snapshot of the whole slice.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stats {
    /// Event counters.
    pub events: SliceEvents,
    /// Per-database statistics, indexed by database.
    pub db_stats: Vec<DbStats>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpdateStatsMode {
    Read,
    Mutable,
}

/// The per-shard owner of the prime and expire tables for a family of numbered databases.
pub struct DbSlice {
    shard_id: ShardId,
    cache_mode: bool,
    cluster_slot_stats: bool,
    expire_allowed: bool,
    load_in_progress: bool,
    expired_events_enabled: bool,
    max_memory_bytes: u64,
    shard_count: u16,
    max_eviction_per_heartbeat: u32,
    max_segment_to_consider: u32,
    table_growth_margin: f64,

    db_arr: Vec<Option<DbTable>>,
    expire_base_ms: u64,
    next_version: Cell<u64>,
    next_moved_id: Cell<u64>,
    memory_budget: i64,
    table_memory: i64,
    entries_count: u64,
    events: SliceEvents,
    fetched_items: HotSet<(u64, DbIndex)>,
    change_cbs: RefCell<Vec<(u64, ChangeCallback)>>,
    moved_cbs: RefCell<Vec<(u64, MovedCallback)>>,
    serialization_latch: LocalLatch,
    active_slot_flushes: Vec<ActiveSlotFlush>,
    deferred_deletions: Vec<DeferredSetDrop>,
    client_tracking: HotMap<Vec<u8>, Vec<InvalidationSink>>,
    pending_invalidations: Vec<(Vec<u8>, Vec<InvalidationSink>)>,
    journal: Option<Rc<ShardJournal>>,
    tiered: Option<Rc<dyn TieredStorage>>,
    doc_del_cb: Option<DocDeletionCallback>,
}

impl DbSlice {
    /// Creates a slice for one shard from process configuration, with database 0 active.
    #[must_use]
    pub fn new(shard_id: ShardId, config: &StoreConfig) -> Self {
        let shard_count = config.shard_count.get();
        let memory_budget = if config.max_memory_bytes > 0 {
            (config.max_memory_bytes / u64::from(shard_count)) as i64
        } else {
            i64::MAX / 2
        };
        let mut slice = Self {
            shard_id,
            cache_mode: config.cache_mode,
            cluster_slot_stats: config.cluster_slot_stats,
            expire_allowed: true,
            load_in_progress: false,
            expired_events_enabled: config.expired_events_enabled(),
            max_memory_bytes: config.max_memory_bytes,
            shard_count,
            max_eviction_per_heartbeat: config.max_eviction_per_heartbeat,
            max_segment_to_consider: config.max_segment_to_consider,
            table_growth_margin: config.table_growth_margin,
            db_arr: Vec::new(),
            expire_base_ms: 0,
            next_version: Cell::new(1),
            next_moved_id: Cell::new(1),
            memory_budget,
            table_memory: 0,
            entries_count: 0,
            events: SliceEvents::default(),
            fetched_items: HotSet::new(),
            change_cbs: RefCell::new(Vec::new()),
            moved_cbs: RefCell::new(Vec::new()),
            serialization_latch: LocalLatch::new(),
            active_slot_flushes: Vec::new(),
            deferred_deletions: Vec::new(),
            client_tracking: HotMap::new(),
            pending_invalidations: Vec::new(),
            journal: None,
            tiered: None,
            doc_del_cb: None,
        };
        slice.activate_db(0);
        slice
    }

    /// Owning shard id.
    #[must_use]
    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    /// Whether the slice evicts under pressure instead of rejecting inserts.
    #[must_use]
    pub fn cache_mode(&self) -> bool {
        self.cache_mode
    }

    /// Remaining signed memory budget in bytes.
    #[must_use]
    pub fn memory_budget(&self) -> i64 {
        self.memory_budget
    }

    /// Overrides the memory budget; used by heartbeat recalibration.
    pub fn set_memory_budget(&mut self, budget: i64) {
        self.memory_budget = budget;
    }

    /// Live entries across all databases.
    #[must_use]
    pub fn entries_count(&self) -> u64 {
        self.entries_count
    }

    /// Bytes held by table structures across all databases.
    #[must_use]
    pub fn table_memory(&self) -> i64 {
        self.table_memory
    }

    /// Event counters.
    #[must_use]
    pub fn events(&self) -> &SliceEvents {
        &self.events
    }

    /// Resets the post-mutation update counter.
    pub fn reset_update_events(&mut self) {
        self.events.update = 0;
    }

    /// Resets all event counters.
    pub fn reset_events(&mut self) {
        self.events = SliceEvents::default();
    }

    /// Attaches the shard journal.
    pub fn set_journal(&mut self, journal: Rc<ShardJournal>) {
        self.journal = Some(journal);
    }

    /// The shard journal, when attached.
    #[must_use]
    pub fn journal(&self) -> Option<Rc<ShardJournal>> {
        self.journal.clone()
    }

    /// Attaches the tiered-storage backend.
    pub fn set_tiered(&mut self, tiered: Rc<dyn TieredStorage>) {
        self.tiered = Some(tiered);
    }

    /// The tiered-storage backend, when attached.
    #[must_use]
    pub fn tiered(&self) -> Option<Rc<dyn TieredStorage>> {
        self.tiered.clone()
    }

    /// Installs the callback fired before Hash/Json values are deleted or expired.
    pub fn set_doc_deletion_callback(&mut self, callback: DocDeletionCallback) {
        self.doc_del_cb = Some(callback);
    }

    /// Disables conservative growth checks while a snapshot or replication stream loads.
    pub fn set_load_in_progress(&mut self, loading: bool) {
        self.load_in_progress = loading;
    }

    /// Enables or disables all expiry-driven deletions.
    pub fn set_expire_allowed(&mut self, allowed: bool) {
        self.expire_allowed = allowed;
    }

    /// Sets the base against which relative deadlines are stored.
    pub fn set_expire_base(&mut self, base_ms: u64) {
        debug_assert!(self.entries_count == 0 || base_ms <= self.expire_base_ms + u64::from(u32::MAX));
        self.expire_base_ms = base_ms;
    }

    /// The deadline base in milliseconds.
    #[must_use]
    pub fn expire_base_ms(&self) -> u64 {
        self.expire_base_ms
    }

    /// Reconfigures keyspace-event recording.
    pub fn set_notify_keyspace_events(&mut self, enabled: bool) {
        self.expired_events_enabled = enabled;
    }

    /// The slice's serialization latch.
    #[must_use]
    pub fn serialization_latch(&self) -> &LocalLatch {
        &self.serialization_latch
    }

    /// Makes a database index usable, growing the database array as needed.
    pub fn activate_db(&mut self, db: DbIndex) {
        let index = db as usize;
        if self.db_arr.len() <= index {
            self.db_arr.resize_with(index + 1, || None);
        }
        if self.db_arr[index].is_none() {
            let table = DbTable::new(db, self.cluster_slot_stats && db == 0);
            self.table_memory += table.table_memory() as i64;
            self.db_arr[index] = Some(table);
        }
    }

    /// Whether a database index is active.
    #[must_use]
    pub fn is_db_valid(&self, db: DbIndex) -> bool {
        self.db_arr
            .get(db as usize)
            .is_some_and(Option::is_some)
    }

    /// Indexes of all active databases.
    #[must_use]
    pub fn database_indexes(&self) -> Vec<DbIndex> {
        self.db_arr
            .iter()
            .enumerate()
            .filter_map(|(index, table)| table.as_ref().map(|_| index as DbIndex))
            .collect()
    }

    /// Live keys in one database.
    #[must_use]
    pub fn db_size(&self, db: DbIndex) -> usize {
        if self.is_db_valid(db) {
            self.db(db).prime.len()
        } else {
            0
        }
    }

    pub(crate) fn db(&self, db: DbIndex) -> &DbTable {
        self.db_arr[db as usize]
            .as_ref()
            .expect("database index must be active")
    }

    pub(crate) fn db_mut(&mut self, db: DbIndex) -> &mut DbTable {
        self.db_arr[db as usize]
            .as_mut()
            .expect("database index must be active")
    }

    /// Direct access to one database's tables. Snapshot and migration helpers use this.
    #[must_use]
    pub fn db_table(&self, db: DbIndex) -> Option<&DbTable> {
        self.db_arr.get(db as usize).and_then(Option::as_ref)
    }

    /// Key handle at a prime-table position.
    #[must_use]
    pub fn key_at(&self, db: DbIndex, pos: SlotPos) -> Option<&StoredKey> {
        self.db_table(db)?.prime.get(pos).map(|(key, _)| key)
    }

    /// Value at a prime-table position.
    #[must_use]
    pub fn value_at(&self, db: DbIndex, pos: SlotPos) -> Option<&Value> {
        self.db_table(db)?.prime.get(pos).map(|(_, value)| value)
    }

    /// Mutable value at a prime-table position. Callers hold a scoped updater while mutating.
    pub fn value_at_mut(&mut self, db: DbIndex, pos: SlotPos) -> Option<&mut Value> {
        self.db_arr
            .get_mut(db as usize)?
            .as_mut()?
            .prime
            .get_mut(pos)
            .map(|(_, value)| value)
    }

    pub(crate) fn take_next_version(&self) -> u64 {
        let version = self.next_version.get();
        self.next_version.set(version + 1);
        version
    }

    /// The next version the counter will hand out.
    #[must_use]
    pub fn current_version_bound(&self) -> u64 {
        self.next_version.get()
    }

    // ---- lookups ------------------------------------------------------------------------

    /// Read-only lookup: updates hit statistics, samplers and hotness, lazily expires.
    ///
    /// # Errors
    ///
    /// `OpStatus::KeyNotFound` when the key is absent or just expired.
    pub fn find_read_only(&mut self, cntx: &DbContext, key: &[u8]) -> OpResult<ItAndExp> {
        self.find_internal(cntx, key, None, UpdateStatsMode::Read)
    }

    /// Read-only lookup requiring a value kind.
    ///
    /// # Errors
    ///
    /// `OpStatus::KeyNotFound` or `OpStatus::WrongType`.
    pub fn find_read_only_typed(
        &mut self,
        cntx: &DbContext,
        key: &[u8],
        kind: ValueKind,
    ) -> OpResult<ItAndExp> {
        self.find_internal(cntx, key, Some(kind), UpdateStatsMode::Read)
    }

    /// Mutable lookup: fires the pre-mutation protocol and returns a scoped updater.
    ///
    /// # Errors
    ///
    /// `OpStatus::KeyNotFound` when the key is absent, expired, or removed by an in-flight
    /// slot flush.
    pub fn find_mutable(&mut self, cntx: &DbContext, key: &[u8]) -> OpResult<FoundMutable> {
        self.find_mutable_internal(cntx, key, None)
    }

    /// Mutable lookup requiring a value kind.
    ///
    /// # Errors
    ///
    /// `OpStatus::KeyNotFound` or `OpStatus::WrongType`.
    pub fn find_mutable_typed(
        &mut self,
        cntx: &DbContext,
        key: &[u8],
        kind: ValueKind,
    ) -> OpResult<FoundMutable> {
        self.find_mutable_internal(cntx, key, Some(kind))
    }

    fn find_mutable_internal(
        &mut self,
        cntx: &DbContext,
        key: &[u8],
        req_kind: Option<ValueKind>,
    ) -> OpResult<FoundMutable> {
        let found = self.find_internal(cntx, key, req_kind, UpdateStatsMode::Mutable)?;
        self.pre_update_bucket(cntx, found.it.coord());
        // The pre-mutation protocol may have removed the entry (slot flush filtering).
        if !self.entry_matches(cntx.db, found.it, key) {
            return Err(OpStatus::KeyNotFound);
        }
        let orig_heap = self
            .value_at(cntx.db, found.it)
            .map_or(0, Value::malloc_used);
        Ok(FoundMutable {
            it: found.it,
            exp_it: found.exp_it,
            updater: AutoUpdater::arm(cntx.db, key, found.it, orig_heap),
        })
    }

    fn entry_matches(&self, db: DbIndex, pos: SlotPos, key: &[u8]) -> bool {
        self.key_at(db, pos)
            .is_some_and(|stored| stored.as_bytes() == key)
    }

    fn find_internal(
        &mut self,
        cntx: &DbContext,
        key: &[u8],
        req_kind: Option<ValueKind>,
        mode: UpdateStatsMode,
    ) -> OpResult<ItAndExp> {
        let db = cntx.db;
        if !self.is_db_valid(db) {
            tracing::error!(db, "lookup against an inactive database index");
            debug_assert!(false, "inactive database index");
            return Err(OpStatus::KeyNotFound);
        }
        let hash = key_fingerprint(key);
        let miss_weight = u64::from(mode == UpdateStatsMode::Read);

        let Some(pos) = self
            .db(db)
            .prime
            .find(hash, |stored| stored.as_bytes() == key)
        else {
            self.events.misses += miss_weight;
            return Err(OpStatus::KeyNotFound);
        };

        self.touch_samplers(db, key, hash);

        if let Some(required) = req_kind {
            let matches = self
                .value_at(db, pos)
                .is_some_and(|value| value.logical_kind() == required);
            if !matches {
                self.events.misses += miss_weight;
                return Err(OpStatus::WrongType);
            }
        }

        let exp_pos = match self.expire_if_needed_internal(cntx, pos) {
            ExpireOutcome::Deleted => {
                self.events.misses += miss_weight;
                return Err(OpStatus::KeyNotFound);
            }
            ExpireOutcome::Live(exp_pos) => exp_pos,
        };

        if self.cache_mode {
            let _ = self.fetched_items.insert((hash, db));
        }

        let (is_external, is_cool) = self
            .value_at(db, pos)
            .map_or((false, false), |value| (value.is_external(), value.is_cool()));

        match mode {
            UpdateStatsMode::Mutable => self.events.mutations += 1,
            UpdateStatsMode::Read => {
                self.events.hits += 1;
                if let Some(slots) = self.db_mut(db).slots_stats.as_deref_mut() {
                    slots[key_slot(key) as usize].total_reads += 1;
                }
                if is_external {
                    if is_cool {
                        self.events.ram_cool_hits += 1;
                    } else {
                        self.events.ram_misses += 1;
                    }
                } else {
                    self.events.ram_hits += 1;
                }
            }
        }

        // A looked-up value is hot again: fetch back cool entries and drop the backend copy.
        if is_cool {
            self.warm_cool_entry(db, pos);
        }

        // The hotness bit lives on the key so value overwrites preserve it.
        if let Some(stored) = self.key_at(db, pos) {
            stored.set_touched(true);
        }

        Ok(ItAndExp {
            it: pos,
            exp_it: exp_pos,
        })
    }

    fn touch_samplers(&mut self, db: DbIndex, key: &[u8], hash: u64) {
        let table = self.db_mut(db);
        if let Some(top_keys) = table.top_keys.as_mut() {
            top_keys.touch(key);
        }
        if let Some(hll) = table.dense_hll.as_mut() {
            hll.add(hash);
        }
    }

    fn warm_cool_entry(&mut self, db: DbIndex, pos: SlotPos) {
        let mut cancel = None;
        {
            let table = self.db_mut(db);
            let Some((stored, value)) = table.prime.get_mut(pos) else {
                return;
            };
            let Value::External { descriptor, cool } = value else {
                return;
            };
            let Some(shadow) = cool.take() else {
                return;
            };
            cancel = Some((stored.as_bytes().to_vec(), *descriptor));
            *value = *shadow;
            stored.set_external(false);
            stored.set_cool(false);
            stored.set_stash_pending(false);
        }
        if let Some(tiered) = &self.tiered
            && let Some((key, descriptor)) = cancel.take()
        {
            tiered.cancel_stash(db, &key, &descriptor);
        }
    }

    // ---- inserts ------------------------------------------------------------------------

    /// Finds the key or inserts it with an empty value.
    ///
    /// # Errors
    ///
    /// `OpStatus::OutOfMemory` when the insert was rejected after eviction and garbage
    /// collection failed to free space.
    pub fn add_or_find(&mut self, cntx: &DbContext, key: &[u8]) -> OpResult<AddOrFindResult> {
        self.add_or_find_typed(cntx, key, None)
    }

    /// Typed form of [`DbSlice::add_or_find`].
    ///
    /// # Errors
    ///
    /// `OpStatus::WrongType` when the key exists with another kind, `OpStatus::OutOfMemory`
    /// when insertion was rejected.
    pub fn add_or_find_typed(
        &mut self,
        cntx: &DbContext,
        key: &[u8],
        req_kind: Option<ValueKind>,
    ) -> OpResult<AddOrFindResult> {
        self.activate_db(cntx.db);

        match self.find_internal(cntx, key, req_kind, UpdateStatsMode::Mutable) {
            Ok(found) => {
                self.pre_update_bucket(cntx, found.it.coord());
                if self.entry_matches(cntx.db, found.it, key) {
                    let orig_heap = self
                        .value_at(cntx.db, found.it)
                        .map_or(0, Value::malloc_used);
                    return Ok(AddOrFindResult {
                        it: found.it,
                        exp_it: found.exp_it,
                        updater: AutoUpdater::arm(cntx.db, key, found.it, orig_heap),
                        is_new: false,
                    });
                }
                // The pre-mutation protocol removed the entry; fall through to insertion.
            }
            Err(OpStatus::WrongType) => return Err(OpStatus::WrongType),
            Err(OpStatus::KeyNotFound) => {}
            Err(other) => return Err(other),
        }

        self.insert_new_entry(cntx, key)
    }

    fn insert_new_entry(&mut self, cntx: &DbContext, key: &[u8]) -> OpResult<AddOrFindResult> {
        let db = cntx.db;
        let hash = key_fingerprint(key);
        self.pre_insert(cntx, key, hash);

        let mut mem_offset = -(key.len() as i64);
        let mut reclaimed = 0_usize;
        if let Some(tiered) = &self.tiered {
            let red_line = (key.len() as i64 * 2).max(TIERED_RED_LINE_BYTES);
            if self.memory_budget < red_line {
                let goal = (red_line - self.memory_budget) as usize;
                reclaimed = tiered.reclaim_memory(goal);
                self.memory_budget += reclaimed as i64;
            }
            // Cool memory is reclaimable on demand, so growth decisions may count it.
            mem_offset += tiered.cool_memory_usage() as i64;
        }

        // Conservative growth checks are disabled while loading a snapshot: the rebuilt
        // directory shape differs from the donor's and would trip them spuriously.
        let apply_memory_limit = self.max_memory_bytes > 0 && !self.load_in_progress;
        if apply_memory_limit && !self.cache_mode && self.memory_budget + mem_offset < 0 {
            tracing::warn!(
                budget = self.memory_budget,
                reclaimed,
                offset = mem_offset,
                "insert rejected over the memory limit"
            );
            self.events.insertion_rejections += 1;
            return Err(OpStatus::OutOfMemory);
        }

        let soft_limit = ((0.3 * self.max_memory_bytes as f64) / f64::from(self.shard_count)) as i64;
        let bytes_per_object = self.bytes_per_object();
        let can_evict = self.cache_mode;
        let margin = self.table_growth_margin;
        let record_expired_events = self.expired_events_enabled;
        let expire_base_ms = self.expire_base_ms;
        let expire_allowed = self.expire_allowed;

        let Self {
            db_arr,
            events,
            entries_count,
            memory_budget,
            journal,
            tiered,
            deferred_deletions,
            client_tracking,
            pending_invalidations,
            doc_del_cb,
            ..
        } = self;
        let table = db_arr[db as usize]
            .as_mut()
            .expect("database index must be active");
        let DbTable {
            prime,
            expire,
            mcflag,
            trans_locks,
            slots_stats,
            expired_keys_events,
            stats,
            ..
        } = table;
        let ctx = DeletionContext {
            db,
            now_ms: cntx.time_now_ms,
            expire_base_ms,
            expire_allowed,
            record_expired_events,
            expire,
            mcflag,
            locks: trans_locks,
            stats,
            slots_stats: slots_stats.as_deref_mut(),
            expired_events: expired_keys_events,
            events,
            entries_count,
            memory_budget,
            journal: journal.as_ref(),
            tiered: tiered.as_ref(),
            deferred_deletions,
            client_tracking,
            pending_invalidations,
            doc_del_cb: doc_del_cb.as_ref(),
        };
        let mut policy = PrimeEvictionPolicy::new(
            ctx,
            can_evict,
            apply_memory_limit,
            mem_offset,
            soft_limit,
            bytes_per_object,
            margin,
        );

        let table_before = prime.mem_usage() as i64;
        let insert_result = prime.insert_new(
            hash,
            StoredKey::new(key.to_vec()),
            Value::empty(),
            &mut policy,
        );
        let (evicted, checked, moved) = policy.into_parts();

        let pos = match insert_result {
            Ok(pos) => pos,
            Err(_) => {
                tracing::warn!(
                    budget = self.memory_budget,
                    reclaimed,
                    offset = mem_offset,
                    "insert rejected, table refused to make room"
                );
                self.events.insertion_rejections += 1;
                return Err(OpStatus::OutOfMemory);
            }
        };

        self.call_moved_callbacks(db, &moved);
        self.events.mutations += 1;
        self.events.evicted_keys += u64::from(evicted);
        self.events.garbage_checked += u64::from(checked);

        let table_increase = self.db(db).prime.mem_usage() as i64 - table_before;
        self.memory_budget -= table_increase;
        self.table_memory += table_increase;
        self.entries_count += 1;

        {
            let table = self.db_mut(db);
            let Some((stored, _)) = table.prime.get(pos) else {
                return Err(OpStatus::KeyNotFound);
            };
            let key_heap = stored.malloc_used();
            if stored.is_inline() {
                table.stats.inline_keys += 1;
            } else {
                account_kind_memory(
                    &mut table.stats,
                    table.slots_stats.as_deref_mut(),
                    key,
                    ValueKind::Str,
                    key_heap as i64,
                );
            }
            if let Some(slots) = table.slots_stats.as_deref_mut() {
                slots[key_slot(key) as usize].key_count += 1;
            }
        }

        let version = self.take_next_version();
        self.db(db).prime.raise_bucket_version(pos.coord(), version);
        self.touch_samplers(db, key, hash);

        Ok(AddOrFindResult {
            it: pos,
            exp_it: None,
            updater: AutoUpdater::arm(db, key, pos, 0),
            is_new: true,
        })
    }

    /// Inserts a key the caller guarantees to be absent.
    ///
    /// # Errors
    ///
    /// `OpStatus::OutOfMemory` when the insert was rejected.
    pub fn add_new(
        &mut self,
        cntx: &DbContext,
        key: &[u8],
        value: Value,
        expire_at_ms: u64,
    ) -> OpResult<FoundMutable> {
        let result = self.add_or_update_internal(cntx, key, value, expire_at_ms, false)?;
        debug_assert!(result.is_new, "add_new requires an absent key");
        Ok(FoundMutable {
            it: result.it,
            exp_it: result.exp_it,
            updater: result.updater,
        })
    }

    /// Inserts or overwrites a key.
    ///
    /// # Errors
    ///
    /// `OpStatus::OutOfMemory` when the insert was rejected.
    pub fn add_or_update(
        &mut self,
        cntx: &DbContext,
        key: &[u8],
        value: Value,
        expire_at_ms: u64,
    ) -> OpResult<AddOrFindResult> {
        self.add_or_update_internal(cntx, key, value, expire_at_ms, true)
    }

    fn add_or_update_internal(
        &mut self,
        cntx: &DbContext,
        key: &[u8],
        value: Value,
        expire_at_ms: u64,
        force_update: bool,
    ) -> OpResult<AddOrFindResult> {
        let mut result = self.add_or_find(cntx, key)?;
        if !result.is_new && !force_update {
            return Ok(result);
        }

        let db = cntx.db;
        if let Some(slot) = self.value_at_mut(db, result.it) {
            *slot = value;
        }

        if expire_at_ms != 0 {
            if let Some(stored) = self.key_at(db, result.it) {
                stored.set_has_expire(true);
            }
            match result.exp_it {
                Some(exp_pos) if force_update => {
                    let period = ExpirePeriod::from_absolute(expire_at_ms, self.expire_base_ms);
                    if let Some((_, slot)) = self.db_mut(db).expire.get_mut(exp_pos) {
                        *slot = period;
                    }
                }
                _ => {
                    // add_expire asserts a clean has-expire bit.
                    if let Some(stored) = self.key_at(db, result.it) {
                        stored.set_has_expire(false);
                    }
                    self.add_expire(db, result.it, expire_at_ms);
                    result.exp_it = self.find_expire_pos(db, key);
                }
            }
        }
        Ok(result)
    }

    pub(crate) fn find_expire_pos(&self, db: DbIndex, key: &[u8]) -> Option<SlotPos> {
        let fingerprint = key_fingerprint(key);
        self.db(db)
            .expire
            .find(fingerprint, |stored| stored.as_slice() == key)
    }

    // ---- deletion -----------------------------------------------------------------------

    /// Removes an entry. Any scoped updater held for it must be cancelled, not run.
    pub fn del(&mut self, cntx: &DbContext, pos: SlotPos) {
        self.pre_update_bucket(cntx, pos.coord());
        self.with_deletion_ctx(cntx.db, cntx.time_now_ms, |prime, ctx| {
            let _ = perform_deletion(prime, ctx, pos);
        });
    }

    pub(crate) fn with_deletion_ctx<R>(
        &mut self,
        db: DbIndex,
        now_ms: u64,
        f: impl FnOnce(&mut PrimeTable, &mut DeletionContext<'_>) -> R,
    ) -> R {
        let record_expired_events = self.expired_events_enabled;
        let expire_base_ms = self.expire_base_ms;
        let expire_allowed = self.expire_allowed;
        let Self {
            db_arr,
            events,
            entries_count,
            memory_budget,
            journal,
            tiered,
            deferred_deletions,
            client_tracking,
            pending_invalidations,
            doc_del_cb,
            ..
        } = self;
        let table = db_arr[db as usize]
            .as_mut()
            .expect("database index must be active");
        let DbTable {
            prime,
            expire,
            mcflag,
            trans_locks,
            slots_stats,
            expired_keys_events,
            stats,
            ..
        } = table;
        let mut ctx = DeletionContext {
            db,
            now_ms,
            expire_base_ms,
            expire_allowed,
            record_expired_events,
            expire,
            mcflag,
            locks: trans_locks,
            stats,
            slots_stats: slots_stats.as_deref_mut(),
            expired_events: expired_keys_events,
            events,
            entries_count,
            memory_budget,
            journal: journal.as_ref(),
            tiered: tiered.as_ref(),
            deferred_deletions,
            client_tracking,
            pending_invalidations,
            doc_del_cb: doc_del_cb.as_ref(),
        };
        f(prime, &mut ctx)
    }

    // ---- pre-mutation protocol ----------------------------------------------------------

    /// Fires the pre-mutation protocol for one bucket and bumps its version.
    pub(crate) fn pre_update_bucket(&mut self, cntx: &DbContext, coord: BucketCoord) {
        self.apply_slot_flush_filter_bucket(cntx, coord);
        self.fire_update_callbacks(cntx.db, coord);
        let version = self.take_next_version();
        self.db(cntx.db).prime.raise_bucket_version(coord, version);
    }

    /// Fires the pre-mutation protocol for a pending insert of `key`.
    pub(crate) fn pre_insert(&mut self, cntx: &DbContext, key: &[u8], hash: u64) {
        self.apply_slot_flush_filter_insert(cntx, hash);
        if self.change_cbs.borrow().is_empty() {
            return;
        }
        let this = &*self;
        let mut buckets = Vec::new();
        this.db(cntx.db)
            .prime
            .cvc_upon_insert(u64::MAX, hash, |bucket| {
                buckets.push(this.bucket_change_from_ref(cntx.db, bucket));
            });
        this.call_change_callbacks(
            cntx.db,
            &ChangeReq::Insert {
                key,
                buckets: &buckets,
            },
        );
    }

    fn fire_update_callbacks(&self, db: DbIndex, coord: BucketCoord) {
        if self.change_cbs.borrow().is_empty() {
            return;
        }
        let Some(bucket) = self.db(db).prime.bucket_ref(coord) else {
            return;
        };
        let view = self.bucket_change_from_ref(db, bucket);
        self.call_change_callbacks(db, &ChangeReq::Update(&view));
    }

    pub(crate) fn bucket_change_from_ref<'a>(
        &'a self,
        db: DbIndex,
        bucket: sable_dash::BucketRef<'a, StoredKey, Value>,
    ) -> BucketChange<'a> {
        let table = self.db(db);
        let base = self.expire_base_ms;
        let entries = bucket
            .iter()
            .map(|(_, stored, value)| {
                let key_bytes = stored.as_bytes();
                let expire_at_ms = if stored.has_expire() {
                    let fingerprint = key_fingerprint(key_bytes);
                    table
                        .expire
                        .find(fingerprint, |candidate| candidate.as_slice() == key_bytes)
                        .and_then(|pos| table.expire.get(pos))
                        .map(|(_, period)| period.to_absolute(base))
                } else {
                    None
                };
                let mcflag = if stored.has_mcflag() {
                    table.mcflag.get(key_bytes).copied()
                } else {
                    None
                };
                EntryView {
                    db,
                    key: key_bytes,
                    value,
                    sticky: stored.is_sticky(),
                    expire_at_ms,
                    mcflag,
                }
            })
            .collect();
        BucketChange { bucket, entries }
    }

    /// Invokes every registered change callback. Callbacks may not suspend and may not touch
    /// the registry.
    pub(crate) fn call_change_callbacks(&self, db: DbIndex, req: &ChangeReq<'_>) {
        let _latch = self.serialization_latch.lock();
        let mut callbacks = self.change_cbs.borrow_mut();
        for (_, callback) in callbacks.iter_mut() {
            callback(db, req);
        }
    }

    pub(crate) fn call_moved_callbacks(&self, db: DbIndex, moves: &[(Cursor, Cursor)]) {
        if moves.is_empty() || self.moved_cbs.borrow().is_empty() {
            return;
        }
        let _latch = self.serialization_latch.lock();
        let mut callbacks = self.moved_cbs.borrow_mut();
        for (_, callback) in callbacks.iter_mut() {
            callback(db, moves);
        }
    }

    /// Registers a pre-mutation observer. The returned id doubles as the version bound below
    /// which the observer has not yet seen state.
    pub fn register_on_change(&self, callback: ChangeCallback) -> u64 {
        let version = self.take_next_version();
        self.change_cbs.borrow_mut().push((version, callback));
        version
    }

    /// Removes a pre-mutation observer.
    pub fn unregister_on_change(&self, id: u64) {
        self.serialization_latch.wait();
        let mut callbacks = self.change_cbs.borrow_mut();
        let before = callbacks.len();
        callbacks.retain(|(version, _)| *version != id);
        debug_assert_eq!(before, callbacks.len() + 1, "unknown change callback id");
    }

    /// Registers a relocation observer.
    pub fn register_on_moved(&self, callback: MovedCallback) -> u64 {
        let id = self.next_moved_id.get();
        self.next_moved_id.set(id + 1);
        self.moved_cbs.borrow_mut().push((id, callback));
        id
    }

    /// Removes a relocation observer.
    pub fn unregister_on_moved(&self, id: u64) {
        self.serialization_latch.wait();
        let mut callbacks = self.moved_cbs.borrow_mut();
        let before = callbacks.len();
        callbacks.retain(|(cb_id, _)| *cb_id != id);
        debug_assert_eq!(before, callbacks.len() + 1, "unknown moved callback id");
    }

    /// Number of registered change callbacks.
    #[must_use]
    pub fn change_callback_count(&self) -> usize {
        self.change_cbs.borrow().len()
    }

    /// Delivers a bucket to observers registered before `upper_bound` but after the bucket's
    /// last change, giving older in-flight snapshots priority over a newer one about to
    /// overwrite the bucket version.
    pub fn flush_change_to_earlier_callbacks(
        &self,
        db: DbIndex,
        coord: BucketCoord,
        upper_bound: u64,
    ) {
        let Some(bucket) = self.db(db).prime.bucket_ref(coord) else {
            return;
        };
        let view = self.bucket_change_from_ref(db, bucket);
        self.flush_change_to_earlier_view(db, &view, upper_bound);
    }

    fn flush_change_to_earlier_view(&self, db: DbIndex, view: &BucketChange<'_>, upper: u64) {
        let _latch = self.serialization_latch.lock();
        let bucket_version = view.version();
        let mut callbacks = self.change_cbs.borrow_mut();
        for (cb_version, callback) in callbacks.iter_mut() {
            debug_assert!(*cb_version <= upper);
            if *cb_version == upper {
                return;
            }
            if bucket_version < *cb_version {
                callback(db, &ChangeReq::Update(view));
            }
        }
    }

    /// One snapshot traversal step over the bucket at `cursor`.
    ///
    /// With a version bound (point-in-time mode) the bucket is serialized through `emit` only
    /// when its version predates the bound: earlier registered observers get the bucket first,
    /// and the version is bumped so the bucket is never serialized twice. Without a bound every
    /// visited bucket is emitted and versions are left alone; relocation tracking covers moved
    /// entries in that mode.
    pub fn snapshot_scan(
        &self,
        db: DbIndex,
        cursor: Cursor,
        version_bound: Option<u64>,
        emit: &mut dyn FnMut(&EntryView<'_>),
    ) -> SnapshotScanStep {
        let mut serialized = 0_u32;
        let mut skipped = 0_u32;
        let next = self.db(db).prime.traverse_buckets(cursor, |bucket| {
            if let Some(bound) = version_bound {
                if bucket.version() >= bound {
                    skipped += 1;
                    return;
                }
                let view = self.bucket_change_from_ref(db, bucket);
                self.flush_change_to_earlier_view(db, &view, bound);
                let _latch = self.serialization_latch.lock();
                for entry in view.entries() {
                    emit(entry);
                    serialized += 1;
                }
                view.set_version_at_least(bound);
            } else {
                let view = self.bucket_change_from_ref(db, bucket);
                let _latch = self.serialization_latch.lock();
                for entry in view.entries() {
                    emit(entry);
                    serialized += 1;
                }
            }
        });
        SnapshotScanStep {
            cursor: next,
            serialized,
            skipped,
        }
    }

    /// Bucket view addressed by a traversal cursor, used by relocation interception.
    #[must_use]
    pub fn bucket_view_at(&self, db: DbIndex, cursor: Cursor) -> Option<BucketChange<'_>> {
        let coord = self.db_table(db)?.prime.cursor_to_coord(cursor)?;
        let bucket = self.db(db).prime.bucket_ref(coord)?;
        Some(self.bucket_change_from_ref(db, bucket))
    }

    // ---- post-mutation ------------------------------------------------------------------

    pub(crate) fn finish_update(
        &mut self,
        db: DbIndex,
        key: &[u8],
        pos: SlotPos,
        orig_heap_size: usize,
    ) {
        debug_assert!(
            self.entry_matches(db, pos, key),
            "updater released after its entry was removed"
        );
        let new_heap = self.value_at(db, pos).map_or(0, Value::malloc_used);
        let delta = new_heap as i64 - orig_heap_size as i64;
        self.account_value_memory(db, key, delta);
        self.post_update(db, key);
    }

    pub(crate) fn account_value_memory(&mut self, db: DbIndex, key: &[u8], delta: i64) {
        if delta == 0 || !self.is_db_valid(db) {
            return;
        }
        let kind = self
            .db(db)
            .prime
            .find(key_fingerprint(key), |stored| stored.as_bytes() == key)
            .and_then(|pos| self.value_at(db, pos))
            .map_or(ValueKind::Str, Value::kind);
        let table = self.db_mut(db);
        account_kind_memory(
            &mut table.stats,
            table.slots_stats.as_deref_mut(),
            key,
            kind,
            delta,
        );
    }

    fn post_update(&mut self, db: DbIndex, key: &[u8]) {
        {
            let table = self.db_mut(db);
            if let Some(watchers) = table.watched_keys.remove(key) {
                for watcher in watchers {
                    watcher.store(true, Ordering::Relaxed);
                }
            }
        }
        self.events.update += 1;
        if let Some(slots) = self.db_mut(db).slots_stats.as_deref_mut() {
            slots[key_slot(key) as usize].total_writes += 1;
        }
        queue_invalidation(
            &mut self.client_tracking,
            &mut self.pending_invalidations,
            key,
        );
    }

    // ---- cache-mode bump-ups ------------------------------------------------------------

    /// End-of-callback hook: promotes entries read during the callback and flushes queued
    /// client invalidations.
    pub fn on_cb_finish(&mut self) {
        if self.cache_mode {
            let fetched: Vec<(u64, DbIndex)> = self.fetched_items.drain().collect();
            for (hash, db) in fetched {
                if !self.is_db_valid(db) {
                    continue;
                }
                // Hash collisions are tolerable here: promoting a colliding neighbor is
                // harmless and skipping the exact-key check keeps fetch accounting cheap.
                let Some(pos) = self.db(db).prime.find_first(hash) else {
                    continue;
                };

                let newest_bound = self
                    .change_cbs
                    .borrow()
                    .last()
                    .map(|(version, _)| *version);
                if let Some(bound) = newest_bound {
                    let this = &*self;
                    let mut views = Vec::new();
                    this.db(db).prime.cvc_upon_bump(bound, pos, |bucket| {
                        views.push(this.bucket_change_from_ref(db, bucket));
                    });
                    for view in &views {
                        this.call_change_callbacks(db, &ChangeReq::Update(view));
                    }
                }

                // Bucket order must stay stable while a bucket serialization is in flight.
                self.serialization_latch.wait();
                let mut policy = SliceBumpPolicy::default();
                let new_pos = self.db_mut(db).prime.bump_up(pos, &mut policy);
                if new_pos != pos {
                    self.events.bumpups += 1;
                }
                self.events.stash_unloaded = self.db(db).prime.stash_unloaded();
                self.call_moved_callbacks(db, &policy.moves);
            }
        }
        self.send_queued_invalidations();
    }

    // ---- client-side tracking -----------------------------------------------------------

    /// Subscribes a session's invalidation sink to one key.
    pub fn track_key(&mut self, key: &[u8], sink: InvalidationSink) {
        self.client_tracking
            .entry(key.to_vec())
            .or_default()
            .push(sink);
    }

    /// Flushes queued invalidation messages to their session sinks.
    pub fn send_queued_invalidations(&mut self) {
        for (key, sinks) in self.pending_invalidations.drain(..) {
            for sink in sinks {
                sink.lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .push(key.clone());
            }
        }
    }

    // ---- watched keys -------------------------------------------------------------------

    /// Registers a session handle to be flipped on the key's first write.
    pub fn register_watched_key(&mut self, db: DbIndex, key: &[u8], handle: WatcherHandle) {
        self.activate_db(db);
        self.db_mut(db)
            .watched_keys
            .entry(key.to_vec())
            .or_default()
            .push(handle);
    }

    /// Removes one session handle from a watched key.
    pub fn unregister_watched_key(&mut self, db: DbIndex, key: &[u8], handle: &WatcherHandle) {
        if !self.is_db_valid(db) {
            return;
        }
        let table = self.db_mut(db);
        if let Some(handles) = table.watched_keys.get_mut(key) {
            handles.retain(|candidate| !std::sync::Arc::ptr_eq(candidate, handle));
            if handles.is_empty() {
                let _ = table.watched_keys.remove(key);
            }
        }
    }

    /// Flips every watcher of the database; used by flushes.
    pub fn invalidate_db_watches(&mut self, db: DbIndex) {
        if !self.is_db_valid(db) {
            return;
        }
        for watchers in self.db(db).watched_keys.values() {
            for watcher in watchers {
                watcher.store(true, Ordering::Relaxed);
            }
        }
    }

    /// Flips watchers of keys hashed into the given slots.
    pub fn invalidate_slot_watches(&mut self, slots: &SlotSet) {
        if !self.is_db_valid(0) {
            return;
        }
        for (key, watchers) in &self.db(0).watched_keys {
            if !slots.contains(key_slot(key)) {
                continue;
            }
            for watcher in watchers {
                watcher.store(true, Ordering::Relaxed);
            }
        }
    }

    // ---- intent locks -------------------------------------------------------------------

    /// Takes an intent lock on a key fingerprint for the external transaction scheduler.
    /// Returns whether it was granted.
    pub fn acquire_lock(
        &mut self,
        db: DbIndex,
        fingerprint: u64,
        mode: crate::intent_lock::LockMode,
    ) -> bool {
        self.activate_db(db);
        self.db_mut(db).trans_locks.acquire(fingerprint, mode)
    }

    /// Releases a previously granted intent lock.
    pub fn release_lock(
        &mut self,
        db: DbIndex,
        fingerprint: u64,
        mode: crate::intent_lock::LockMode,
    ) {
        if self.is_db_valid(db) {
            self.db_mut(db).trans_locks.release(fingerprint, mode);
        }
    }

    /// Whether a fresh acquisition in the given mode would be granted right now.
    #[must_use]
    pub fn check_lock(
        &self,
        db: DbIndex,
        fingerprint: u64,
        mode: crate::intent_lock::LockMode,
    ) -> bool {
        if !self.is_db_valid(db) {
            return true;
        }
        self.db(db).trans_locks.check(fingerprint, mode)
    }

    // ---- mcflag -------------------------------------------------------------------------

    /// Sets or clears the auxiliary 32-bit tag of a key. Returns whether the key exists.
    pub fn set_mcflag(&mut self, db: DbIndex, key: &[u8], flag: u32) -> bool {
        if !self.is_db_valid(db) {
            return false;
        }
        let fingerprint = key_fingerprint(key);
        let Some(pos) = self
            .db(db)
            .prime
            .find(fingerprint, |stored| stored.as_bytes() == key)
        else {
            return false;
        };
        let table = self.db_mut(db);
        if flag == 0 {
            let _ = table.mcflag.remove(key);
            if let Some((stored, _)) = table.prime.get(pos) {
                stored.set_has_mcflag(false);
            }
        } else {
            let _ = table.mcflag.insert(key.to_vec(), flag);
            if let Some((stored, _)) = table.prime.get(pos) {
                stored.set_has_mcflag(true);
            }
        }
        true
    }

    /// The auxiliary tag of a key; zero when absent.
    #[must_use]
    pub fn get_mcflag(&self, db: DbIndex, key: &[u8]) -> u32 {
        if !self.is_db_valid(db) {
            return 0;
        }
        let flagged = self
            .db(db)
            .prime
            .find(key_fingerprint(key), |stored| stored.as_bytes() == key)
            .and_then(|pos| self.key_at(db, pos))
            .is_some_and(StoredKey::has_mcflag);
        if !flagged {
            return 0;
        }
        match self.db(db).mcflag.get(key) {
            Some(flag) => *flag,
            None => {
                tracing::error!(
                    key = %String::from_utf8_lossy(key),
                    "mcflag flagged on key but missing from the table"
                );
                debug_assert!(false, "mcflag table out of sync");
                0
            }
        }
    }

    // ---- tiering ------------------------------------------------------------------------

    /// Offloads a string value to tiered storage, keeping a cool in-memory shadow.
    ///
    /// # Errors
    ///
    /// `OpStatus::KeyNotFound` when the key is absent, `OpStatus::WrongType` for non-string
    /// values, `OpStatus::Skipped` when the backend refused the stash or none is attached.
    pub fn stash_value(&mut self, cntx: &DbContext, key: &[u8]) -> OpResult<()> {
        let Some(tiered) = self.tiered.clone() else {
            return Err(OpStatus::Skipped);
        };
        let db = cntx.db;
        let pos = self
            .db(db)
            .prime
            .find(key_fingerprint(key), |stored| stored.as_bytes() == key)
            .ok_or(OpStatus::KeyNotFound)?;

        let bytes = match self.value_at(db, pos) {
            Some(Value::Str(bytes)) => bytes.clone(),
            Some(_) => return Err(OpStatus::WrongType),
            None => return Err(OpStatus::KeyNotFound),
        };
        let Some(descriptor) = tiered.try_stash(db, key, &bytes) else {
            return Err(OpStatus::Skipped);
        };

        let table = self.db_mut(db);
        if let Some((stored, value)) = table.prime.get_mut(pos) {
            let shadow = std::mem::replace(value, Value::empty());
            *value = Value::External {
                descriptor,
                cool: Some(Box::new(shadow)),
            };
            stored.set_external(true);
            stored.set_cool(true);
        }
        Ok(())
    }

    // ---- sampling -----------------------------------------------------------------------

    /// Starts top-keys frequency sampling on one database.
    pub fn start_sample_top_keys(&mut self, db: DbIndex, min_freq: u64) {
        self.activate_db(db);
        let table = self.db_mut(db);
        if table.top_keys.is_some() {
            tracing::info!(db, "top-keys sampling already running");
            return;
        }
        table.top_keys = Some(TopKeys::new(min_freq));
    }

    /// Stops top-keys sampling and returns the collected frequencies.
    pub fn stop_sample_top_keys(&mut self, db: DbIndex) -> Vec<(Vec<u8>, u64)> {
        if !self.is_db_valid(db) {
            return Vec::new();
        }
        match self.db_mut(db).top_keys.take() {
            Some(sampler) => sampler.top_keys(),
            None => {
                tracing::warn!(db, "top-keys sampling was not running");
                Vec::new()
            }
        }
    }

    /// Starts cardinality sampling on one database.
    pub fn start_sample_keys(&mut self, db: DbIndex) {
        self.activate_db(db);
        let table = self.db_mut(db);
        if table.dense_hll.is_some() {
            tracing::info!(db, "key sampling already running");
            return;
        }
        table.dense_hll = Some(DenseHll::new());
    }

    /// Stops cardinality sampling and returns the estimated distinct-key count.
    pub fn stop_sample_keys(&mut self, db: DbIndex) -> u64 {
        if !self.is_db_valid(db) {
            return 0;
        }
        match self.db_mut(db).dense_hll.take() {
            Some(sketch) => sketch.estimate(),
            None => {
                tracing::info!(db, "key sampling was not running");
                0
            }
        }
    }

    // ---- events & stats -----------------------------------------------------------------

    /// Drains the buffered expired-key events of one database for publication on the keyspace
    /// channel.
    pub fn take_expired_key_events(&mut self, db: DbIndex) -> Vec<Vec<u8>> {
        if !self.is_db_valid(db) {
            return Vec::new();
        }
        std::mem::take(&mut self.db_mut(db).expired_keys_events)
    }

    /// Aggregated statistics across the slice.
    #[must_use]
    pub fn stats(&self) -> Stats {
        let mut db_stats = Vec::with_capacity(self.db_arr.len());
        for table in &self.db_arr {
            let Some(table) = table else {
                db_stats.push(DbStats::default());
                continue;
            };
            db_stats.push(DbStats {
                table: table.stats.clone(),
                key_count: table.prime.len() as u64,
                expire_count: table.expire.len() as u64,
                prime_capacity: table.prime.capacity() as u64,
                expire_capacity: table.expire.capacity() as u64,
                table_mem_usage: table.table_memory() as u64,
            });
        }
        Stats {
            events: self.events,
            db_stats,
        }
    }

    fn bytes_per_object(&self) -> i64 {
        if self.entries_count == 0 {
            return 0;
        }
        let total: i64 = self
            .db_arr
            .iter()
            .flatten()
            .map(|table| table.stats.obj_memory_usage)
            .sum();
        total / self.entries_count as i64
    }
}

impl std::fmt::Debug for DbSlice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbSlice")
            .field("shard_id", &self.shard_id)
            .field("cache_mode", &self.cache_mode)
            .field("databases", &self.database_indexes())
            .field("entries_count", &self.entries_count)
            .field("memory_budget", &self.memory_budget)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[path = "slice/tests.rs"]
mod tests;
