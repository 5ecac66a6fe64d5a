//! Insertion-time eviction policy, deletion plumbing, and the heartbeat eviction step.

use std::rc::Rc;
use std::sync::{Arc, Mutex};

use rand::Rng;

use sable_common::containers::{HotMap, HotSet};
use sable_common::hash::{key_fingerprint, key_slot};
use sable_common::ids::DbIndex;
use sable_dash::{
    BUCKETS_PER_SEGMENT, BumpPolicy, Cursor, EvictionPolicy, HotBuckets, SLOTS_PER_BUCKET,
    SlotPos,
};
use sable_journal::{JournalEntry, JournalFlushGuard, JournalOp, ShardJournal};
use sable_tiering::TieredStorage;

use crate::intent_lock::{IntentLockTable, LockMode};
use crate::key::StoredKey;
use crate::latch::FiberAtomicGuard;
use crate::slice::expiry::expire_entry;
use crate::slice::{DbSlice, SliceEvents};
use crate::table::{DbTableStats, ExpireTable, PrimeTable, SlotStats};
use crate::value::{Value, ValueKind};

/// Dense sets at or above this cardinality are cleared incrementally at idle time.
pub(crate) const DENSE_SET_ASYNC_MIN: usize = 256;

/// Elements dropped from one deferred set per idle step.
pub(crate) const DEFERRED_CLEAR_CHUNK: usize = 512;

/// Session handle receiving client-side invalidation keys.
pub type InvalidationSink = Arc<Mutex<Vec<Vec<u8>>>>;

/// Callback fired before a Hash or Json value is deleted or expired.
pub type DocDeletionCallback = Box<dyn Fn(&[u8], &Value)>;

/// One dense set awaiting incremental disposal.
#[derive(Debug)]
pub(crate) struct DeferredSetDrop {
    pub(crate) set: HotSet<Vec<u8>>,
}

/// Split-borrow bundle threading every deletion-adjacent piece of slice state into code that
/// simultaneously holds the prime table mutably (eviction hooks, sweeps).
pub(crate) struct DeletionContext<'a> {
    pub db: DbIndex,
    pub now_ms: u64,
    pub expire_base_ms: u64,
    pub expire_allowed: bool,
    pub record_expired_events: bool,
    pub expire: &'a mut ExpireTable,
    pub mcflag: &'a mut HotMap<Vec<u8>, u32>,
    pub locks: &'a IntentLockTable,
    pub stats: &'a mut DbTableStats,
    pub slots_stats: Option<&'a mut [SlotStats]>,
    pub expired_events: &'a mut Vec<Vec<u8>>,
    pub events: &'a mut SliceEvents,
    pub entries_count: &'a mut u64,
    pub memory_budget: &'a mut i64,
    pub journal: Option<&'a Rc<ShardJournal>>,
    pub tiered: Option<&'a Rc<dyn TieredStorage>>,
    pub deferred_deletions: &'a mut Vec<DeferredSetDrop>,
    pub client_tracking: &'a mut HotMap<Vec<u8>, Vec<InvalidationSink>>,
    pub pending_invalidations: &'a mut Vec<(Vec<u8>, Vec<InvalidationSink>)>,
    pub doc_del_cb: Option<&'a DocDeletionCallback>,
}

impl DeletionContext<'_> {
    /// Appends an expiry pseudo-record and buffers the keyspace event for one removed key.
    pub(crate) fn record_expiry(&mut self, key: &[u8]) {
        if let Some(journal) = self.journal {
            let _ = journal.append(JournalEntry {
                txid: 0,
                db: self.db,
                op: JournalOp::Expired { key: key.to_vec() },
            });
        }
        if self.record_expired_events {
            self.expired_events.push(key.to_vec());
        }
    }
}

/// Applies a signed heap delta to the stats and slot accounting.
pub(crate) fn account_kind_memory(
    stats: &mut DbTableStats,
    slots_stats: Option<&mut [SlotStats]>,
    key: &[u8],
    kind: ValueKind,
    delta: i64,
) {
    if delta == 0 {
        return;
    }
    stats.add_kind_memory(kind, delta);
    if let Some(slots) = slots_stats {
        slots[key_slot(key) as usize].memory_bytes += delta;
    }
}

/// Moves a tracked key's sessions onto the pending invalidation queue.
pub(crate) fn queue_invalidation(
    client_tracking: &mut HotMap<Vec<u8>, Vec<InvalidationSink>>,
    pending: &mut Vec<(Vec<u8>, Vec<InvalidationSink>)>,
    key: &[u8],
) {
    let _guard = FiberAtomicGuard::new();
    if let Some(sinks) = client_tracking.remove(key) {
        pending.push((key.to_vec(), sinks));
    }
}

/// Removes one entry and settles every table, statistic, and side channel that referenced it.
///
/// Journal records and keyspace events are the caller's concern; this function is shared by
/// explicit deletes, expiry, eviction, and slot flushes, which each record differently.
/// Returns the heap bytes released.
pub(crate) fn perform_deletion(
    prime: &mut PrimeTable,
    ctx: &mut DeletionContext<'_>,
    pos: SlotPos,
) -> Option<usize> {
    let (key_ref, value_ref) = prime.get(pos)?;
    let key_bytes = key_ref.as_bytes().to_vec();
    let fingerprint = key_fingerprint(&key_bytes);

    if let Some(doc_del) = ctx.doc_del_cb
        && matches!(value_ref.logical_kind(), ValueKind::Hash | ValueKind::Json)
    {
        doc_del(&key_bytes, value_ref);
    }

    if key_ref.has_expire() {
        match ctx.expire.find(fingerprint, |stored| stored == &key_bytes) {
            Some(expire_pos) => {
                let _ = ctx.expire.erase(expire_pos);
            }
            None => {
                tracing::error!(
                    key = %String::from_utf8_lossy(&key_bytes),
                    db = ctx.db,
                    "entry flagged has-expire missing from the expire table"
                );
                debug_assert!(false, "expire table out of sync with prime table");
            }
        }
    }

    if key_ref.has_mcflag() && ctx.mcflag.remove(&key_bytes).is_none() {
        tracing::error!(
            key = %String::from_utf8_lossy(&key_bytes),
            "entry flagged has-mcflag missing from the mcflag table"
        );
        debug_assert!(false, "mcflag table out of sync with prime table");
    }

    if let Some(tiered) = ctx.tiered
        && let Some(descriptor) = value_ref.external_descriptor()
    {
        if key_ref.has_stash_pending() || value_ref.is_cool() {
            tiered.cancel_stash(ctx.db, &key_bytes, &descriptor);
        } else {
            tiered.delete(ctx.db, &descriptor);
        }
    }

    let key_heap = key_ref.malloc_used();
    let value_heap = value_ref.malloc_used();
    let kind = value_ref.kind();
    let async_delete = key_ref.is_async_delete();

    if key_ref.is_inline() {
        ctx.stats.inline_keys = ctx.stats.inline_keys.saturating_sub(1);
    } else {
        account_kind_memory(
            ctx.stats,
            ctx.slots_stats.as_deref_mut(),
            &key_bytes,
            kind,
            -(key_heap as i64),
        );
    }
    account_kind_memory(
        ctx.stats,
        ctx.slots_stats.as_deref_mut(),
        &key_bytes,
        kind,
        -(value_heap as i64),
    );
    if let Some(slots) = ctx.slots_stats.as_deref_mut() {
        let slot = &mut slots[key_slot(&key_bytes) as usize];
        slot.key_count = slot.key_count.saturating_sub(1);
    }

    let (_key, value) = prime.erase(pos)?;
    if async_delete
        && let Value::Set(set) = value
        && set.len() >= DENSE_SET_ASYNC_MIN
    {
        ctx.deferred_deletions.push(DeferredSetDrop { set });
    }

    *ctx.entries_count = ctx.entries_count.saturating_sub(1);
    *ctx.memory_budget += (key_heap + value_heap) as i64;
    queue_invalidation(ctx.client_tracking, ctx.pending_invalidations, &key_bytes);
    Some(key_heap + value_heap)
}

/// Insertion-time eviction policy of the prime table.
///
/// Growth is gated by a conservative estimate of what the projected free slots would cost in
/// object memory; when growth is refused, expired entries in the hot buckets are collected
/// first and a pseudo-random stash bucket is robbed of its coldest slot second.
pub(crate) struct PrimeEvictionPolicy<'a> {
    ctx: DeletionContext<'a>,
    can_evict: bool,
    apply_memory_limit: bool,
    mem_offset: i64,
    soft_limit: i64,
    bytes_per_object: i64,
    table_growth_margin: f64,
    evicted: u32,
    checked: u32,
    moved: Vec<(Cursor, Cursor)>,
}

impl<'a> PrimeEvictionPolicy<'a> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        ctx: DeletionContext<'a>,
        can_evict: bool,
        apply_memory_limit: bool,
        mem_offset: i64,
        soft_limit: i64,
        bytes_per_object: i64,
        table_growth_margin: f64,
    ) -> Self {
        Self {
            ctx,
            can_evict,
            apply_memory_limit,
            mem_offset,
            soft_limit,
            bytes_per_object,
            table_growth_margin,
            evicted: 0,
            checked: 0,
            moved: Vec::new(),
        }
    }

    pub(crate) fn into_parts(self) -> (u32, u32, Vec<(Cursor, Cursor)>) {
        (self.evicted, self.checked, self.moved)
    }
}

impl EvictionPolicy<StoredKey, Value> for PrimeEvictionPolicy<'_> {
    fn can_grow(&mut self, table: &PrimeTable) -> bool {
        let mem_available = *self.ctx.memory_budget + self.mem_offset;
        if !self.apply_memory_limit || mem_available > self.soft_limit {
            return true;
        }

        // Conservative stance: estimate what filling the current free capacity would cost,
        // even though present usage may be lower.
        let segment_capacity = (BUCKETS_PER_SEGMENT * SLOTS_PER_BUCKET) as f64;
        let table_free_items =
            ((table.capacity() - table.len()) as f64 + segment_capacity) * self.table_growth_margin;
        let obj_bytes_estimation = self.bytes_per_object as f64 * table_free_items;
        let needed = PrimeTable::segment_bytes() as i64 + obj_bytes_estimation as i64;
        let allowed = mem_available > needed;
        if !allowed {
            tracing::info!(
                free_items = table_free_items as u64,
                bytes_per_object = self.bytes_per_object,
                mem_available,
                "refusing table growth under memory pressure"
            );
        }
        allowed
    }

    fn record_split(&mut self, segment: u32) {
        tracing::debug!(segment, "prime table segment split");
    }

    fn on_move(&mut self, source: Cursor, dest: Cursor) {
        self.moved.push((source, dest));
    }

    fn garbage_collect(&mut self, hot: &HotBuckets, table: &mut PrimeTable) -> u32 {
        if self
            .ctx
            .journal
            .is_some_and(|journal| journal.will_block_on_write())
        {
            return 0;
        }
        let _flush_guard = JournalFlushGuard::new(self.ctx.journal);
        let _atomic = FiberAtomicGuard::new();

        // Regular buckets fill first, so they carry most of the expired population; stash
        // buckets are filled last and rarely pay off.
        let mut freed = 0;
        for coord in hot.regular {
            let mut expired_positions = Vec::new();
            if let Some(bucket) = table.bucket_ref(coord) {
                for (pos, key, _) in bucket.iter() {
                    if key.has_expire() {
                        self.checked += 1;
                        expired_positions.push(pos);
                    }
                }
            }
            for pos in expired_positions {
                if expire_entry(table, &mut self.ctx, pos) {
                    freed += 1;
                    self.ctx.events.garbage_collected += 1;
                }
            }
        }
        freed
    }

    fn evict(&mut self, hot: &HotBuckets, table: &mut PrimeTable) -> u32 {
        if !self.can_evict
            || self
                .ctx
                .journal
                .is_some_and(|journal| journal.will_block_on_write())
        {
            return 0;
        }
        let _flush_guard = JournalFlushGuard::new(self.ctx.journal);
        let _atomic = FiberAtomicGuard::new();

        // Rob a pseudo-random stash bucket of its tail slot, which bump-up keeps coldest.
        let stash = hot.stash[(hot.key_hash % hot.stash.len() as u64) as usize];
        let last_slot = (SLOTS_PER_BUCKET - 1) as u8;
        if let Some(pos) = table.occupied_at(stash.segment, stash.bucket, last_slot) {
            let Some((key, _)) = table.get(pos) else {
                return 0;
            };
            if key.is_sticky() {
                return 0;
            }
            let key_bytes = key.as_bytes().to_vec();
            if self.ctx.locks.is_locked(key_fingerprint(&key_bytes)) {
                return 0;
            }

            self.ctx.record_expiry(&key_bytes);
            let _ = perform_deletion(table, &mut self.ctx, pos);
            self.ctx.events.evicted_keys += 1;
            self.evicted += 1;
        }
        table.shift_right(stash);
        1
    }
}

/// Read-path promotion policy: never bump sticky keys, collect relocations for the snapshot's
/// moved-items channel.
#[derive(Debug, Default)]
pub(crate) struct SliceBumpPolicy {
    pub(crate) moves: Vec<(Cursor, Cursor)>,
}

impl BumpPolicy<StoredKey> for SliceBumpPolicy {
    fn can_bump(&self, key: &StoredKey) -> bool {
        !key.is_sticky()
    }

    fn on_move(&mut self, source: Cursor, dest: Cursor) {
        self.moves.push((source, dest));
    }
}

impl DbSlice {
    /// Heartbeat-driven memory release: tiered reclaim first, then a bounded LRU-approximating
    /// eviction scan over the prime table.
    ///
    /// Returns `(evicted_items, freed_bytes)`.
    pub fn free_mem_with_eviction_step(
        &mut self,
        db: DbIndex,
        starting_segment: u32,
        increase_goal_bytes: usize,
        now_ms: u64,
    ) -> (u64, usize) {
        let _atomic = FiberAtomicGuard::new();

        let mut freed = 0_usize;
        if let Some(tiered) = &self.tiered {
            freed = tiered.reclaim_memory(increase_goal_bytes);
            if freed >= increase_goal_bytes {
                return (0, freed);
            }
        }
        if !self.cache_mode || !self.expire_allowed || !self.is_db_valid(db) {
            return (0, freed);
        }

        let max_evictions = u64::from(self.max_eviction_per_heartbeat);
        let max_segments = self.max_segment_to_consider.max(1);
        let record_keys = self.journal.is_some() || self.expired_events_enabled;

        let mut evicted_items = 0_u64;
        let mut evicted_keys = Vec::new();

        self.with_deletion_ctx(db, now_ms, |prime, ctx| {
            let _flush_guard = JournalFlushGuard::new(ctx.journal);
            let segment_count = prime.segment_count();

            // High slots across high buckets approximate the cold end; segment order carries no
            // recency, so a random starting segment keeps the scan fair.
            'scan: for slot_id in (0..SLOTS_PER_BUCKET as u8).rev() {
                for bucket_id in (0..BUCKETS_PER_SEGMENT as u8).rev() {
                    let mut segment = starting_segment % segment_count;
                    for _ in 0..max_segments {
                        let Some(pos) = prime.occupied_at(segment, bucket_id, slot_id) else {
                            segment = prime.next_segment(segment);
                            continue;
                        };
                        let Some((key, value)) = prime.get(pos) else {
                            segment = prime.next_segment(segment);
                            continue;
                        };
                        let has_allocated = key.malloc_used() > 0 || value.has_allocated();
                        if key.is_sticky() || !has_allocated {
                            segment = prime.next_segment(segment);
                            continue;
                        }
                        let key_bytes = key.as_bytes().to_vec();
                        if ctx.locks.is_locked(key_fingerprint(&key_bytes)) {
                            segment = prime.next_segment(segment);
                            continue;
                        }

                        if record_keys {
                            evicted_keys.push(key_bytes);
                        }
                        if let Some(bytes) = perform_deletion(prime, ctx, pos) {
                            freed += bytes;
                        }
                        evicted_items += 1;
                        if evicted_items == max_evictions || freed >= increase_goal_bytes {
                            break 'scan;
                        }
                        segment = prime.next_segment(segment);
                    }
                }
            }

            for key in &evicted_keys {
                ctx.record_expiry(key);
            }
            ctx.events.evicted_keys += evicted_items;
        });

        self.send_queued_invalidations();
        (evicted_items, freed)
    }

    /// Picks a pseudo-random starting segment for the next heartbeat eviction step.
    #[must_use]
    pub fn random_eviction_segment(&self, db: DbIndex) -> u32 {
        if !self.is_db_valid(db) {
            return 0;
        }
        let count = self.db(db).prime.segment_count();
        rand::rng().random_range(0..count)
    }

    /// Drains deferred dense-set disposals in bounded chunks. Returns elements dropped.
    pub fn run_idle_deletions(&mut self, max_items: usize) -> usize {
        let mut dropped = 0;
        while dropped < max_items {
            let Some(deferred) = self.deferred_deletions.last_mut() else {
                break;
            };
            let chunk = DEFERRED_CLEAR_CHUNK
                .min(max_items - dropped)
                .min(deferred.set.len());
            for _ in 0..chunk {
                let Some(member) = deferred.set.iter().next().cloned() else {
                    break;
                };
                let _ = deferred.set.remove(&member);
                dropped += 1;
            }
            if deferred.set.is_empty() {
                let _ = self.deferred_deletions.pop();
            }
        }
        dropped
    }

    /// Number of dense sets awaiting incremental disposal.
    #[must_use]
    pub fn pending_deferred_deletions(&self) -> usize {
        self.deferred_deletions.len()
    }
}

/// Lock check shared by sweep paths: an entry is sweepable when an exclusive acquisition would
/// be granted, meaning no transaction holds the key.
pub(crate) fn key_is_sweepable(locks: &IntentLockTable, fingerprint: u64) -> bool {
    locks.check(fingerprint, LockMode::Exclusive)
}
