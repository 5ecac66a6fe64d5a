//! Database and slot-range flushing.

use std::mem;
use std::thread;

use sable_common::hash::key_slot;
use sable_common::ids::DbIndex;
use sable_common::run_state::RunState;
use sable_dash::Cursor;

use crate::slice::eviction::perform_deletion;
use crate::slice::{DbContext, DbSlice};
use crate::slot_set::SlotSet;
use crate::table::DbTable;

/// Buckets visited by one slot-flush step.
const FLUSH_STEP_BUCKETS: usize = 64;

/// In-flight slot flush registered with the slice.
///
/// While active, the slice's pre-mutation protocol eagerly removes matching stale keys from any
/// bucket about to change, so a concurrent write can never resurrect flushed state.
#[derive(Debug)]
pub(crate) struct ActiveSlotFlush {
    pub(crate) version: u64,
    pub(crate) slots: SlotSet,
}

/// Cooperative driver of one slot-range flush.
///
/// The flush deletes every key whose slot is in the set and whose bucket version predates the
/// flush start; keys written after the start survive. Drive it with [`FlushSlotsTask::run_step`]
/// between commands, or [`FlushSlotsTask::run_to_completion`] under an external run state.
#[derive(Debug)]
pub struct FlushSlotsTask {
    version: u64,
    slots: SlotSet,
    cursor: Cursor,
    deleted: u64,
    done: bool,
}

impl FlushSlotsTask {
    /// Keys deleted so far.
    #[must_use]
    pub fn deleted(&self) -> u64 {
        self.deleted
    }

    /// Whether the traversal completed.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Runs one bounded chunk of the flush traversal. Returns whether the flush completed.
    pub fn run_step(&mut self, slice: &mut DbSlice) -> bool {
        if self.done {
            return true;
        }
        let db: DbIndex = 0;
        if !slice.is_db_valid(db) {
            self.finish(slice);
            return true;
        }

        for _ in 0..FLUSH_STEP_BUCKETS {
            let mut stale_keys = Vec::new();
            let next_cursor = {
                let table = slice.db(db);
                table.prime.traverse_buckets(self.cursor, |bucket| {
                    if bucket.version() >= self.version {
                        return;
                    }
                    for (_, key, _) in bucket.iter() {
                        if self.slots.contains(key_slot(key.as_bytes())) {
                            stale_keys.push(key.as_bytes().to_vec());
                        }
                    }
                })
            };
            self.cursor = next_cursor;
            self.deleted += slice.delete_keys_for_flush(db, &stale_keys);
            if self.cursor.is_exhausted() {
                self.finish(slice);
                return true;
            }
        }
        false
    }

    /// Drives the flush until done or until the run state requests shutdown. Returns the
    /// deleted-key count.
    pub fn run_to_completion(mut self, slice: &mut DbSlice, run_state: &RunState) -> u64 {
        while !self.done {
            if !run_state.is_running() {
                self.finish(slice);
                break;
            }
            let _ = self.run_step(slice);
        }
        tracing::debug!(deleted = self.deleted, "slot flush finished");
        self.deleted
    }

    fn finish(&mut self, slice: &mut DbSlice) {
        if !self.done {
            slice.unregister_slot_flush(self.version);
            self.done = true;
        }
    }
}

impl DbSlice {
    /// Begins flushing a slot set, invalidating watchers on affected keys first.
    #[must_use]
    pub fn start_flush_slots(&mut self, slots: SlotSet) -> FlushSlotsTask {
        self.invalidate_slot_watches(&slots);
        let version = self.take_next_version();
        self.active_slot_flushes.push(ActiveSlotFlush {
            version,
            slots: slots.clone(),
        });
        FlushSlotsTask {
            version,
            slots,
            cursor: Cursor::default(),
            deleted: 0,
            done: false,
        }
    }

    pub(crate) fn unregister_slot_flush(&mut self, version: u64) {
        self.active_slot_flushes
            .retain(|flush| flush.version != version);
    }

    /// Deletes the given keys without journaling; shared by the flush task and the eager
    /// pre-mutation filter. Returns how many were removed.
    pub(crate) fn delete_keys_for_flush(&mut self, db: DbIndex, keys: &[Vec<u8>]) -> u64 {
        if keys.is_empty() {
            return 0;
        }
        let mut deleted = 0;
        self.with_deletion_ctx(db, 0, |prime, ctx| {
            for key in keys {
                let fingerprint = sable_common::hash::key_fingerprint(key);
                let Some(pos) = prime.find(fingerprint, |stored| stored.as_bytes() == key.as_slice())
                else {
                    continue;
                };
                if perform_deletion(prime, ctx, pos).is_some() {
                    deleted += 1;
                }
            }
        });
        deleted
    }

    /// Flushes one database, or all of them when `index` is `None`.
    ///
    /// The table swap is synchronous; disposing of the detached tables happens on a background
    /// thread so bulky keyspaces do not stall the shard.
    pub fn flush_db(&mut self, index: Option<DbIndex>) {
        self.client_tracking.clear();
        let indexes = match index {
            Some(db) => vec![db],
            None => self.database_indexes(),
        };
        self.flush_db_indexes(&indexes);
    }

    /// Flushes a specific list of databases.
    pub fn flush_db_indexes(&mut self, indexes: &[DbIndex]) {
        if self.tiered.is_some() {
            self.clear_offloaded_entries(indexes);
        }

        let mut detached = Vec::new();
        for &db in indexes {
            if !self.is_db_valid(db) {
                continue;
            }
            self.invalidate_db_watches(db);

            let slot_stats_on = self.cluster_slot_stats && db == 0;
            let Some(mut old) = self.db_arr[db as usize].take() else {
                continue;
            };
            self.table_memory -= old.table_memory() as i64;
            self.entries_count -= old.prime.len() as u64;

            let mut fresh = DbTable::new(db, slot_stats_on);
            // Lock state belongs to in-flight transactions and survives the flush.
            mem::swap(&mut fresh.trans_locks, &mut old.trans_locks);
            self.table_memory += fresh.table_memory() as i64;
            self.db_arr[db as usize] = Some(fresh);
            detached.push(old);
        }

        if !self.fetched_items.is_empty() {
            tracing::error!("flush ran with pending bump-ups outside a callback");
            debug_assert!(false, "fetched items must drain before a flush");
            self.fetched_items.clear();
        }

        if detached.is_empty() {
            return;
        }
        let spawn = thread::Builder::new()
            .name("sable-flush-drop".to_owned())
            .spawn(move || drop(detached));
        if let Err(error) = spawn {
            tracing::warn!(%error, "flush disposal thread unavailable, dropping inline");
        }
    }

    /// Releases tiered-storage state for every offloaded entry in the given databases.
    fn clear_offloaded_entries(&mut self, indexes: &[DbIndex]) {
        let Some(tiered) = self.tiered.clone() else {
            return;
        };
        for &db in indexes {
            if !self.is_db_valid(db) {
                continue;
            }
            let mut offloaded = Vec::new();
            let table = self.db(db);
            let mut cursor = Cursor::default();
            loop {
                cursor = table.prime.traverse_buckets(cursor, |bucket| {
                    for (_, key, value) in bucket.iter() {
                        if let Some(descriptor) = value.external_descriptor() {
                            offloaded.push((
                                key.as_bytes().to_vec(),
                                descriptor,
                                value.is_cool() || key.has_stash_pending(),
                            ));
                        }
                    }
                });
                if cursor.is_exhausted() {
                    break;
                }
            }
            for (key, descriptor, keep_hot) in offloaded {
                if keep_hot {
                    tiered.cancel_stash(db, &key, &descriptor);
                } else {
                    tiered.delete(db, &descriptor);
                }
            }
        }
    }

    /// Eagerly removes stale flushed-slot keys from one bucket about to be mutated.
    pub(crate) fn apply_slot_flush_filter_bucket(
        &mut self,
        cntx: &DbContext,
        coord: sable_dash::BucketCoord,
    ) {
        if self.active_slot_flushes.is_empty() || cntx.db != 0 {
            return;
        }
        let flushes = mem::take(&mut self.active_slot_flushes);
        let mut stale_keys = Vec::new();
        {
            let table = self.db(cntx.db);
            if let Some(bucket) = table.prime.bucket_ref(coord) {
                for flush in &flushes {
                    if bucket.version() >= flush.version {
                        continue;
                    }
                    for (_, key, _) in bucket.iter() {
                        if flush.slots.contains(key_slot(key.as_bytes())) {
                            stale_keys.push(key.as_bytes().to_vec());
                        }
                    }
                }
            }
        }
        let _ = self.delete_keys_for_flush(cntx.db, &stale_keys);
        self.active_slot_flushes = flushes;
    }

    /// Eagerly removes stale flushed-slot keys from the buckets a pending insert may touch.
    pub(crate) fn apply_slot_flush_filter_insert(&mut self, cntx: &DbContext, hash: u64) {
        if self.active_slot_flushes.is_empty() || cntx.db != 0 {
            return;
        }
        let mut coords = Vec::new();
        self.db(cntx.db)
            .prime
            .cvc_upon_insert(u64::MAX, hash, |bucket| coords.push(bucket.coord()));
        for coord in coords {
            self.apply_slot_flush_filter_bucket(cntx, coord);
        }
    }
}
