//! Scoped post-mutation updater.

use sable_common::ids::DbIndex;
use sable_dash::SlotPos;

use crate::slice::DbSlice;

/// Scoped updater returned by every mutable lookup.
///
/// The updater records the value's pre-mutation heap size; releasing it recomputes the delta,
/// updates per-db memory statistics, notifies watchers, bumps the write counter, and enqueues
/// client-side invalidations. Release is explicit: call [`AutoUpdater::run`] after mutating, or
/// [`AutoUpdater::cancel`] when the entry was deleted instead. Exactly one of the two must
/// happen per acquisition; dropping an armed updater trips a debug assertion.
#[derive(Debug)]
pub struct AutoUpdater {
    fields: Option<UpdaterFields>,
}

#[derive(Debug)]
struct UpdaterFields {
    db: DbIndex,
    key: Vec<u8>,
    pos: SlotPos,
    orig_heap_size: usize,
}

impl AutoUpdater {
    pub(crate) fn arm(db: DbIndex, key: &[u8], pos: SlotPos, orig_heap_size: usize) -> Self {
        Self {
            fields: Some(UpdaterFields {
                db,
                key: key.to_vec(),
                pos,
                orig_heap_size,
            }),
        }
    }

    /// Releases the updater, running the post-mutation bookkeeping.
    pub fn run(mut self, slice: &mut DbSlice) {
        let Some(fields) = self.fields.take() else {
            return;
        };
        slice.finish_update(fields.db, &fields.key, fields.pos, fields.orig_heap_size);
    }

    /// Subtracts the recorded pre-mutation heap size immediately, so a later `run` accounts
    /// only the bytes added after this point.
    pub fn reduce_heap_usage(&mut self, slice: &mut DbSlice) {
        let Some(fields) = &mut self.fields else {
            return;
        };
        slice.account_value_memory(fields.db, &fields.key, -(fields.orig_heap_size as i64));
        fields.orig_heap_size = 0;
    }

    /// Suppresses the release. Used when the caller deleted the entry; releasing after a delete
    /// is a contract violation.
    pub fn cancel(mut self) {
        self.fields = None;
    }

    /// Whether the updater still awaits its release.
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.fields.is_some()
    }
}

impl Drop for AutoUpdater {
    fn drop(&mut self) {
        debug_assert!(
            self.fields.is_none(),
            "auto updater dropped without run() or cancel()"
        );
    }
}
