//! Deadline management: conditional expire updates, lazy expiry, and the incremental sweep.

use sable_common::error::{OpResult, OpStatus};
use sable_common::hash::key_fingerprint;
use sable_dash::SlotPos;
use sable_journal::JournalFlushGuard;

use crate::slice::change::ExpireOutcome;
use crate::slice::eviction::{DeletionContext, key_is_sweepable, perform_deletion};
use crate::slice::{DbContext, DbSlice};
use crate::table::{ExpirePeriod, PrimeTable};

/// Longest accepted deadline, about a century ahead.
pub const MAX_EXPIRE_DEADLINE_SEC: i64 = 100 * 365 * 24 * 3600;
/// Longest accepted deadline in milliseconds.
pub const MAX_EXPIRE_DEADLINE_MS: i64 = MAX_EXPIRE_DEADLINE_SEC * 1000;

/// Unit of an expire argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    /// Seconds.
    Sec,
    /// Milliseconds.
    Msec,
}

/// Conditions gating a deadline update. The command layer guarantees at most one is set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpireFlags {
    /// Apply only when no deadline exists.
    pub nx: bool,
    /// Apply only when a deadline exists.
    pub xx: bool,
    /// Apply only when the new deadline is later than the current one.
    pub gt: bool,
    /// Apply only when the new deadline is earlier than the current one.
    pub lt: bool,
}

/// Parsed deadline specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpireParams {
    /// Deadline magnitude.
    pub value: i64,
    /// Unit of `value`.
    pub unit: TimeUnit,
    /// Whether `value` is an absolute timestamp rather than a relative offset.
    pub absolute: bool,
    /// Remove the deadline instead of setting one.
    pub persist: bool,
    /// Update conditions.
    pub flags: ExpireFlags,
}

impl ExpireParams {
    /// Caps a deadline at the accepted maximum for its unit.
    #[must_use]
    pub fn cap(value: i64, unit: TimeUnit) -> i64 {
        match unit {
            TimeUnit::Sec => value.min(MAX_EXPIRE_DEADLINE_SEC),
            TimeUnit::Msec => value.min(MAX_EXPIRE_DEADLINE_MS),
        }
    }

    /// Resolves the deadline into `(relative_ms, absolute_ms)` against the current clock.
    ///
    /// An out-of-domain spec yields a negative absolute time, which the caller rejects.
    #[must_use]
    pub fn calculate(&self, now_ms: u64, cap: bool) -> (i64, i64) {
        if self.persist {
            return (0, 0);
        }
        if self.unit == TimeUnit::Sec && self.value > i64::MAX / 1000 {
            return (0, -1);
        }
        let msec = match self.unit {
            TimeUnit::Sec => self.value * 1000,
            TimeUnit::Msec => self.value,
        };
        let now = i64::try_from(now_ms).unwrap_or(i64::MAX);
        let mut rel_msec = if self.absolute { msec - now } else { msec };
        if cap {
            rel_msec = Self::cap(rel_msec, TimeUnit::Msec);
        }
        (rel_msec, now.saturating_add(rel_msec))
    }
}

/// Outcome counters of one incremental expiry sweep step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteExpiredStats {
    /// Expire-table entries examined.
    pub traversed: u32,
    /// Entries deleted because their deadline passed.
    pub deleted: u32,
    /// Sum of remaining TTLs over the survivors, for adaptive pacing upstream.
    pub survivor_ttl_sum: u64,
    /// Heap bytes released by the deletions.
    pub deleted_bytes: usize,
}

/// Deletes one entry whose deadline has passed. Shared by lazy expiry, the sweep, and the
/// insertion-time garbage collector. Returns whether the entry was removed.
pub(crate) fn expire_entry(
    prime: &mut PrimeTable,
    ctx: &mut DeletionContext<'_>,
    pos: SlotPos,
) -> bool {
    let Some((key, _)) = prime.get(pos) else {
        return false;
    };
    if !key.has_expire() {
        tracing::error!("expiry check on an entry without a deadline");
        debug_assert!(false, "expire_entry requires the has-expire bit");
        return false;
    }
    let key_bytes = key.as_bytes().to_vec();
    let fingerprint = key_fingerprint(&key_bytes);

    let Some(expire_pos) = ctx.expire.find(fingerprint, |stored| stored == &key_bytes) else {
        tracing::error!(
            key = %String::from_utf8_lossy(&key_bytes),
            db = ctx.db,
            "has-expire entry missing from expire table, clearing the flag"
        );
        debug_assert!(false, "expire table out of sync with prime table");
        key.set_has_expire(false);
        return false;
    };

    let deadline = ctx
        .expire
        .get(expire_pos)
        .map(|(_, period)| period.to_absolute(ctx.expire_base_ms));
    let Some(deadline) = deadline else {
        return false;
    };
    if ctx.now_ms < deadline || !ctx.expire_allowed {
        return false;
    }

    ctx.record_expiry(&key_bytes);
    let _ = perform_deletion(prime, ctx, pos);
    ctx.events.expired_keys += 1;
    true
}

impl DbSlice {
    /// Lazily expires one found entry. Returns whether it is still live, with its expire-table
    /// position attached.
    pub(crate) fn expire_if_needed_internal(
        &mut self,
        cntx: &DbContext,
        pos: SlotPos,
    ) -> ExpireOutcome {
        let db = cntx.db;
        {
            let table = self.db(db);
            let Some((key, _)) = table.prime.get(pos) else {
                return ExpireOutcome::Deleted;
            };
            if !key.has_expire() {
                return ExpireOutcome::Live(None);
            }
            let key_bytes = key.as_bytes().to_vec();
            let fingerprint = key_fingerprint(&key_bytes);
            let expire_pos = table.expire.find(fingerprint, |stored| stored == &key_bytes);
            let Some(expire_pos) = expire_pos else {
                tracing::error!(
                    key = %String::from_utf8_lossy(&key_bytes),
                    db,
                    "has-expire entry missing from expire table, clearing the flag"
                );
                debug_assert!(false, "expire table out of sync with prime table");
                key.set_has_expire(false);
                return ExpireOutcome::Live(None);
            };
            let deadline = table
                .expire
                .get(expire_pos)
                .map(|(_, period)| period.to_absolute(self.expire_base_ms));
            let Some(deadline) = deadline else {
                return ExpireOutcome::Live(Some(expire_pos));
            };
            if cntx.time_now_ms < deadline || !self.expire_allowed {
                return ExpireOutcome::Live(Some(expire_pos));
            }
        }

        let deleted = self.with_deletion_ctx(db, cntx.time_now_ms, |prime, ctx| {
            expire_entry(prime, ctx, pos)
        });
        if deleted {
            ExpireOutcome::Deleted
        } else {
            ExpireOutcome::Live(None)
        }
    }

    /// Public form of the lazy expiry check: deletes the entry when its deadline passed and
    /// reports whether it did.
    pub fn expire_if_needed(&mut self, cntx: &DbContext, pos: SlotPos) -> bool {
        matches!(
            self.expire_if_needed_internal(cntx, pos),
            ExpireOutcome::Deleted
        )
    }

    /// Installs a deadline for an entry that has none.
    pub fn add_expire(&mut self, db: sable_common::ids::DbIndex, pos: SlotPos, deadline_ms: u64) {
        let base = self.expire_base_ms;
        let table = self.db_mut(db);
        let Some((key, _)) = table.prime.get(pos) else {
            return;
        };
        debug_assert!(!key.has_expire());
        let key_bytes = key.as_bytes().to_vec();
        key.set_has_expire(true);
        let fingerprint = key_fingerprint(&key_bytes);
        let table_before = table.expire.mem_usage() as i64;
        let period = ExpirePeriod::from_absolute(deadline_ms, base);
        let mut policy = sable_dash::NoopEvictionPolicy;
        let _ = table.expire.insert_new(fingerprint, key_bytes, period, &mut policy);
        let delta = table.expire.mem_usage() as i64 - table_before;
        self.table_memory += delta;
        self.memory_budget -= delta;
    }

    /// Removes an entry's deadline. Returns whether one existed.
    pub fn remove_expire(&mut self, db: sable_common::ids::DbIndex, pos: SlotPos) -> bool {
        let table = self.db_mut(db);
        let Some((key, _)) = table.prime.get(pos) else {
            return false;
        };
        if !key.has_expire() {
            return false;
        }
        let key_bytes = key.as_bytes().to_vec();
        key.set_has_expire(false);
        let fingerprint = key_fingerprint(&key_bytes);
        let table_before = table.expire.mem_usage() as i64;
        if let Some(expire_pos) = table.expire.find(fingerprint, |stored| stored == &key_bytes) {
            let _ = table.expire.erase(expire_pos);
        } else {
            tracing::error!(
                key = %String::from_utf8_lossy(&key_bytes),
                "remove_expire found no expire entry"
            );
            debug_assert!(false, "expire table out of sync with prime table");
        }
        let delta = table.expire.mem_usage() as i64 - table_before;
        self.table_memory += delta;
        self.memory_budget -= delta;
        true
    }

    /// Applies a deadline spec to a live entry under its XX/NX/GT/LT conditions.
    ///
    /// Returns the new absolute deadline in milliseconds, `0` for persist, or `-1` when the
    /// spec demanded immediate deletion.
    ///
    /// # Errors
    ///
    /// `OpStatus::OutOfRange` for deadlines outside the accepted domain, `OpStatus::Skipped`
    /// when a condition made the update a no-op.
    pub fn update_expire(
        &mut self,
        cntx: &DbContext,
        prime_pos: SlotPos,
        expire_pos: Option<SlotPos>,
        params: &ExpireParams,
    ) -> OpResult<i64> {
        if params.persist {
            let _ = self.remove_expire(cntx.db, prime_pos);
            return Ok(0);
        }

        let (rel_msec, abs_msec) = params.calculate(cntx.time_now_ms, false);
        if abs_msec < 0 || rel_msec > MAX_EXPIRE_DEADLINE_MS {
            return Err(OpStatus::OutOfRange);
        }

        if rel_msec <= 0 {
            self.del(cntx, prime_pos);
            return Ok(-1);
        }

        if let Some(expire_pos) = expire_pos {
            if params.flags.nx {
                return Err(OpStatus::Skipped);
            }
            let base = self.expire_base_ms;
            let current = self
                .db(cntx.db)
                .expire
                .get(expire_pos)
                .map(|(_, period)| period.to_absolute(base));
            let Some(current) = current else {
                return Err(OpStatus::OutOfRange);
            };
            let current = i64::try_from(current).unwrap_or(i64::MAX);
            if (params.flags.lt && current <= abs_msec)
                || (params.flags.gt && current >= abs_msec)
            {
                return Err(OpStatus::Skipped);
            }
            let period = ExpirePeriod::from_absolute(abs_msec as u64, base);
            if let Some((_, slot)) = self.db_mut(cntx.db).expire.get_mut(expire_pos) {
                *slot = period;
            }
            Ok(abs_msec)
        } else {
            if params.flags.xx {
                return Err(OpStatus::Skipped);
            }
            self.add_expire(cntx.db, prime_pos, abs_msec as u64);
            Ok(abs_msec)
        }
    }

    /// One incremental expiry sweep step.
    ///
    /// Walks up to `count / 3` positions of the expire cursor; when at least a quarter of the
    /// visited entries were dead, keeps going up to `count`. Keys under an exclusive
    /// transaction lock are skipped.
    pub fn delete_expired_step(&mut self, cntx: &DbContext, count: u32) -> DeleteExpiredStats {
        let mut stats = DeleteExpiredStats::default();
        if !self.is_db_valid(cntx.db) {
            return stats;
        }

        let mut steps = 0;
        while steps < count / 3 {
            self.expired_sweep_one(cntx, &mut stats);
            steps += 1;
        }
        // Continue only on a strong deletion rate in the first sample.
        if stats.deleted * 4 > stats.traversed {
            while steps < count {
                self.expired_sweep_one(cntx, &mut stats);
                steps += 1;
            }
        }
        stats
    }

    /// Visits one expire-table bucket and deletes the dead entries in it.
    fn expired_sweep_one(&mut self, cntx: &DbContext, stats: &mut DeleteExpiredStats) {
        let db = cntx.db;
        let base = self.expire_base_ms;
        let mut candidates: Vec<(Vec<u8>, u64)> = Vec::new();
        let next_cursor = {
            let table = self.db(db);
            table.expire.traverse_buckets(table.expire_cursor, |bucket| {
                for (_, key, period) in bucket.iter() {
                    candidates.push((key.clone(), period.to_absolute(base)));
                }
            })
        };
        self.db_mut(db).expire_cursor = next_cursor;

        for (key, deadline) in candidates {
            let fingerprint = key_fingerprint(&key);
            if !key_is_sweepable(&self.db(db).trans_locks, fingerprint) {
                continue;
            }
            stats.traversed += 1;
            if deadline > cntx.time_now_ms {
                stats.survivor_ttl_sum += deadline - cntx.time_now_ms;
                continue;
            }
            let prime_pos = self
                .db(db)
                .prime
                .find(fingerprint, |stored| stored.as_bytes() == key.as_slice());
            let Some(prime_pos) = prime_pos else {
                // Tables went out of sync; repair by erasing the orphan deadline.
                tracing::error!(
                    key = %String::from_utf8_lossy(&key),
                    db,
                    "expired key missing from prime table, erasing the orphan"
                );
                debug_assert!(false, "expire table orphan");
                let table = self.db_mut(db);
                if let Some(orphan) =
                    table.expire.find(fingerprint, |stored| stored == &key)
                {
                    let _ = table.expire.erase(orphan);
                }
                stats.deleted += 1;
                continue;
            };
            let entry_bytes = {
                let table = self.db(db);
                table.prime.get(prime_pos).map_or(0, |(stored_key, value)| {
                    stored_key.malloc_used() + value.malloc_used()
                })
            };
            if self.expire_if_needed(cntx, prime_pos) {
                stats.deleted += 1;
                stats.deleted_bytes += entry_bytes;
            }
        }
    }

    /// Sweeps every database to completion. Used at shutdown and after bulk loads.
    pub fn expire_all_if_needed(&mut self, now_ms: u64) {
        self.serialization_latch().wait();
        let journal = self.journal();
        let _flush_guard = JournalFlushGuard::new(journal.as_ref());

        for db in self.database_indexes() {
            let cntx = DbContext {
                db,
                time_now_ms: now_ms,
            };
            loop {
                let mut stats = DeleteExpiredStats::default();
                self.expired_sweep_one(&cntx, &mut stats);
                if self.db(db).expire_cursor.is_exhausted() {
                    break;
                }
            }
        }
    }
}
