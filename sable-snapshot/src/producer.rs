//! The snapshot producer.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use sable_common::ids::{DbIndex, Lsn};
use sable_dash::Cursor;
use sable_journal::ShardJournal;
use sable_store::{BucketChange, ChangeReq, DbSlice, EntryView, Value};
use sable_tiering::{TieredStorage, ValueFuture};

use crate::exec_state::{ExecutionState, SnapshotError};
use crate::flush_gate::FlushGate;
use crate::serializer::{MIN_BLOB_SIZE, SnapshotSerializer};

/// Post-flush sleep ceiling used to avoid starving the shard's main workload.
const MAX_BACKPRESSURE_SLEEP: Duration = Duration::from_millis(2);
/// Delayed tiered reads accumulated before a flush is forced.
const MAX_DELAYED_ENTRIES: usize = 32;

/// Receiver of the produced stream.
pub trait SnapshotConsumer {
    /// Accepts one chunk. Chunks arrive in strictly increasing flush order.
    fn consume(&mut self, chunk: Vec<u8>);
    /// Called once when the producer is done; `cancelled` reflects an aborted run.
    fn finalize(&mut self, cancelled: bool);
}

/// Progress counters of one snapshot run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnapshotStats {
    /// Keys present when the run started.
    pub keys_total: u64,
    /// Entries serialized by the traversal loop.
    pub loop_serialized: u64,
    /// Entries serialized by the pre-mutation hook.
    pub side_saved: u64,
    /// Buckets skipped because they were already serialized.
    pub skipped: u64,
    /// Pre-mutation hook invocations.
    pub savecb_calls: u64,
    /// Journal records streamed into the output.
    pub journal_changes: u64,
    /// Entries re-serialized after relocation into already-covered territory.
    pub moved_saved: u64,
}

struct DelayedEntry {
    db: DbIndex,
    key: Vec<u8>,
    future: ValueFuture,
    expire_at_ms: Option<u64>,
    mcflag: Option<u32>,
    sticky: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TraversalProgress {
    db_rank: usize,
    cursor: Cursor,
}

struct SnapshotInner {
    serializer: SnapshotSerializer,
    snapshot_version: u64,
    use_snapshot_version: bool,
    tiered: Option<Rc<dyn TieredStorage>>,
    delayed: Vec<DelayedEntry>,
    pending_moved: Vec<(DbIndex, Cursor)>,
    dbs: Vec<DbIndex>,
    progress: TraversalProgress,
    side_saved: u64,
    savecb_calls: u64,
    journal_changes: u64,
}

impl SnapshotInner {
    fn save_entry(&mut self, entry: &EntryView<'_>) {
        if let Value::External {
            descriptor,
            cool: None,
        } = entry.value
            && let Some(tiered) = &self.tiered
        {
            // Tiered reads must not block the traversal; resolve them at the flush boundary.
            let future = tiered.read(entry.db, entry.key, descriptor);
            self.delayed.push(DelayedEntry {
                db: entry.db,
                key: entry.key.to_vec(),
                future,
                expire_at_ms: entry.expire_at_ms,
                mcflag: entry.mcflag,
                sticky: entry.sticky,
            });
            return;
        }
        self.serializer.save_entry(entry);
    }

    fn on_db_change(&mut self, _db: DbIndex, req: &ChangeReq<'_>) {
        self.savecb_calls += 1;
        if !self.use_snapshot_version {
            return;
        }
        match req {
            ChangeReq::Update(bucket) => self.side_save_bucket(bucket),
            ChangeReq::Insert { buckets, .. } => {
                for bucket in *buckets {
                    self.side_save_bucket(bucket);
                }
            }
        }
    }

    fn side_save_bucket(&mut self, bucket: &BucketChange<'_>) {
        if bucket.version() >= self.snapshot_version {
            return;
        }
        for entry in bucket.entries() {
            self.save_entry(entry);
            self.side_saved += 1;
        }
        bucket.set_version_at_least(self.snapshot_version);
    }

    fn is_position_serialized(&self, db: DbIndex, cursor: Cursor) -> bool {
        let Some(rank) = self.dbs.iter().position(|&candidate| candidate == db) else {
            return false;
        };
        if rank != self.progress.db_rank {
            return rank < self.progress.db_rank;
        }
        (cursor.bucket_id(), cursor.segment_prefix())
            < (
                self.progress.cursor.bucket_id(),
                self.progress.cursor.segment_prefix(),
            )
    }

    fn on_moved(&mut self, db: DbIndex, items: &[(Cursor, Cursor)]) {
        debug_assert!(!self.use_snapshot_version);
        for (source, dest) in items {
            // An entry displaced from ahead of the cursor into covered territory would
            // otherwise be missed.
            if self.is_position_serialized(db, *dest) && !self.is_position_serialized(db, *source)
            {
                self.pending_moved.push((db, *dest));
            }
        }
    }
}

/// Producer of one shard's snapshot stream.
///
/// `start` registers the pre-mutation hook and records its id as the snapshot version; the
/// traversal is then driven cooperatively with [`SliceSnapshot::run_pass`] (or
/// [`SliceSnapshot::run_to_completion`]) on the owning shard, interleaving freely with
/// mutations.
pub struct SliceSnapshot {
    inner: Rc<RefCell<SnapshotInner>>,
    consumer: Rc<RefCell<dyn SnapshotConsumer>>,
    gate: Arc<FlushGate>,
    exec: ExecutionState,
    snapshot_version: u64,
    change_cb_id: Option<u64>,
    moved_cb_id: Option<u64>,
    journal_cb_id: Option<u32>,
    journal: Option<Rc<ShardJournal>>,
    stream_journal: bool,
    db_rank: usize,
    cursor: Cursor,
    traversal_done: bool,
    finished: bool,
    recent_burn: Cell<Duration>,
    keys_total: u64,
    loop_serialized: u64,
    skipped: u64,
    moved_saved: u64,
}

impl SliceSnapshot {
    /// Creates an idle producer bound to a consumer and execution context.
    #[must_use]
    pub fn new(consumer: Rc<RefCell<dyn SnapshotConsumer>>, exec: ExecutionState) -> Self {
        Self::with_gate(consumer, exec, Arc::new(FlushGate::new()))
    }

    /// Creates a producer sharing a flush gate with other producers of the same consumer.
    #[must_use]
    pub fn with_gate(
        consumer: Rc<RefCell<dyn SnapshotConsumer>>,
        exec: ExecutionState,
        gate: Arc<FlushGate>,
    ) -> Self {
        Self {
            inner: Rc::new(RefCell::new(SnapshotInner {
                serializer: SnapshotSerializer::new(),
                snapshot_version: 0,
                use_snapshot_version: true,
                tiered: None,
                delayed: Vec::new(),
                pending_moved: Vec::new(),
                dbs: Vec::new(),
                progress: TraversalProgress {
                    db_rank: 0,
                    cursor: Cursor::default(),
                },
                side_saved: 0,
                savecb_calls: 0,
                journal_changes: 0,
            })),
            consumer,
            gate,
            exec,
            snapshot_version: 0,
            change_cb_id: None,
            moved_cb_id: None,
            journal_cb_id: None,
            journal: None,
            stream_journal: false,
            db_rank: 0,
            cursor: Cursor::default(),
            traversal_done: false,
            finished: false,
            recent_burn: Cell::new(Duration::ZERO),
            keys_total: 0,
            loop_serialized: 0,
            skipped: 0,
            moved_saved: 0,
        }
    }

    /// The version bound below which this snapshot serializes buckets.
    #[must_use]
    pub fn snapshot_version(&self) -> u64 {
        self.snapshot_version
    }

    /// Progress counters.
    #[must_use]
    pub fn stats(&self) -> SnapshotStats {
        let inner = self.inner.borrow();
        SnapshotStats {
            keys_total: self.keys_total,
            loop_serialized: self.loop_serialized,
            side_saved: inner.side_saved,
            skipped: self.skipped,
            savecb_calls: inner.savecb_calls,
            journal_changes: inner.journal_changes,
            moved_saved: self.moved_saved,
        }
    }

    /// Begins a snapshot run.
    ///
    /// With `stream_journal` the journal hook is installed so mutations after snapshot start
    /// stream into the output; `point_in_time` selects version-guarded bucket saving, otherwise
    /// relocation tracking is used.
    pub fn start(&mut self, slice: &DbSlice, stream_journal: bool, point_in_time: bool) {
        debug_assert!(self.change_cb_id.is_none(), "snapshot started twice");
        let use_snapshot_version = if stream_journal { point_in_time } else { true };
        self.stream_journal = stream_journal;
        self.keys_total = slice
            .database_indexes()
            .iter()
            .map(|&db| slice.db_size(db) as u64)
            .sum();

        {
            let mut inner = self.inner.borrow_mut();
            inner.use_snapshot_version = use_snapshot_version;
            inner.tiered = slice.tiered();
            inner.dbs = slice.database_indexes();
        }

        let change_inner = Rc::clone(&self.inner);
        self.snapshot_version = slice.register_on_change(Box::new(move |db, req| {
            change_inner.borrow_mut().on_db_change(db, req);
        }));
        self.change_cb_id = Some(self.snapshot_version);
        self.inner.borrow_mut().snapshot_version = self.snapshot_version;

        if stream_journal {
            match slice.journal() {
                Some(journal) => {
                    let journal_inner = Rc::clone(&self.inner);
                    self.journal_cb_id =
                        Some(journal.register_on_change(Box::new(move |entry| {
                            let mut inner = journal_inner.borrow_mut();
                            inner.serializer.write_journal_entry(entry);
                            inner.journal_changes += 1;
                        })));
                    self.journal = Some(journal);
                }
                None => self.exec.report_error(SnapshotError::JournalMissing),
            }
            if !use_snapshot_version {
                let moved_inner = Rc::clone(&self.inner);
                self.moved_cb_id = Some(slice.register_on_moved(Box::new(move |db, items| {
                    moved_inner.borrow_mut().on_moved(db, items);
                })));
            }
        }
        tracing::debug!(
            version = self.snapshot_version,
            stream_journal,
            point_in_time = use_snapshot_version,
            "snapshot started, saving entries below the version bound"
        );
    }

    /// Begins an incremental run: replays journal entries from `start_lsn`, emits the full-sync
    /// cut, then switches to streaming. The table is not traversed.
    pub fn start_incremental(&mut self, slice: &DbSlice, start_lsn: Lsn) {
        self.traversal_done = true;
        let Some(journal) = slice.journal() else {
            self.exec.report_error(SnapshotError::JournalMissing);
            return;
        };

        let mut lsn = start_lsn;
        while self.exec.is_running() && journal.is_lsn_in_buffer(lsn) {
            if let Some(entry) = journal.entry_at_lsn(lsn) {
                self.inner.borrow_mut().serializer.write_journal_entry(&entry);
            }
            let _ = self.push_serialized(false);
            lsn += 1;
        }

        if journal.current_lsn() == lsn {
            self.inner.borrow_mut().serializer.send_full_sync_cut();
            let journal_inner = Rc::clone(&self.inner);
            self.journal_cb_id = Some(journal.register_on_change(Box::new(move |entry| {
                let mut inner = journal_inner.borrow_mut();
                inner.serializer.write_journal_entry(entry);
                inner.journal_changes += 1;
            })));
            self.journal = Some(journal);
            let _ = self.push_serialized(true);
        } else {
            let current = journal.current_lsn();
            self.exec.report_error(SnapshotError::PartialSyncDropped {
                requested: lsn,
                current,
            });
        }
    }

    /// Runs one traversal step. Returns `true` once the traversal is complete (or cancelled).
    pub fn run_pass(&mut self, slice: &DbSlice) -> bool {
        if self.traversal_done {
            return true;
        }
        if !self.exec.is_running() {
            self.traversal_done = true;
            return true;
        }
        let pass_start = Instant::now();
        self.drain_pending_moved(slice);

        let (dbs_len, current_db) = {
            let inner = self.inner.borrow();
            (inner.dbs.len(), inner.dbs.get(self.db_rank).copied())
        };
        let Some(db) = current_db else {
            self.traversal_done = true;
            return true;
        };

        let bound = self
            .inner
            .borrow()
            .use_snapshot_version
            .then_some(self.snapshot_version);
        let scan_inner = Rc::clone(&self.inner);
        let step = slice.snapshot_scan(db, self.cursor, bound, &mut |entry| {
            scan_inner.borrow_mut().save_entry(entry);
        });
        self.cursor = step.cursor;
        self.loop_serialized += u64::from(step.serialized);
        self.skipped += u64::from(step.skipped);
        self.inner.borrow_mut().progress = TraversalProgress {
            db_rank: self.db_rank,
            cursor: self.cursor,
        };
        self.recent_burn.set(pass_start.elapsed());

        if self.cursor.is_exhausted() {
            let _ = self.push_serialized(true);
            self.db_rank += 1;
            self.cursor = Cursor::default();
            self.inner.borrow_mut().progress = TraversalProgress {
                db_rank: self.db_rank,
                cursor: Cursor::default(),
            };
            if self.db_rank >= dbs_len {
                if self.stream_journal {
                    self.inner.borrow_mut().serializer.send_full_sync_cut();
                    let _ = self.push_serialized(true);
                }
                self.traversal_done = true;
                return true;
            }
        } else {
            let _ = self.push_serialized(false);
        }
        false
    }

    /// Drives the traversal to completion, then unregisters the slice hooks and finalizes the
    /// consumer. The journal hook, when any, stays until [`SliceSnapshot::finalize_journal_stream`].
    pub fn run_to_completion(&mut self, slice: &DbSlice) {
        loop {
            if self.run_pass(slice) {
                break;
            }
        }
        self.finish(slice);
    }

    /// Unregisters the slice hooks and finalizes the consumer.
    pub fn finish(&mut self, slice: &DbSlice) {
        if self.finished {
            return;
        }
        self.finished = true;
        if let Some(id) = self.change_cb_id.take() {
            slice.unregister_on_change(id);
        }
        if let Some(id) = self.moved_cb_id.take() {
            slice.unregister_on_moved(id);
        }
        if self.exec.is_running() {
            let _ = self.push_serialized(true);
        }
        self.consumer.borrow_mut().finalize(!self.exec.is_running());
        let stats = self.stats();
        tracing::debug!(
            loop_serialized = stats.loop_serialized,
            side_saved = stats.side_saved,
            savecb_calls = stats.savecb_calls,
            journal_changes = stats.journal_changes,
            moved_saved = stats.moved_saved,
            "snapshot serializer loop exited"
        );
    }

    /// Tears down the journal stream: unregisters the hook, and unless cancelled emits the
    /// final journal offset and force-flushes.
    pub fn finalize_journal_stream(&mut self, cancel: bool) {
        let Some(cb_id) = self.journal_cb_id.take() else {
            return;
        };
        let Some(journal) = self.journal.clone() else {
            return;
        };
        journal.unregister_on_change(cb_id);
        if !cancel {
            let lsn = journal.current_lsn();
            tracing::debug!(lsn, "finalizing journal stream");
            self.inner.borrow_mut().serializer.send_journal_offset(lsn);
            let _ = self.push_serialized(true);
        }
    }

    fn drain_pending_moved(&mut self, slice: &DbSlice) {
        let pending: Vec<(DbIndex, Cursor)> = {
            let mut inner = self.inner.borrow_mut();
            if inner.pending_moved.is_empty() {
                return;
            }
            inner.pending_moved.drain(..).collect()
        };
        for (db, cursor) in pending {
            let Some(view) = slice.bucket_view_at(db, cursor) else {
                continue;
            };
            let mut inner = self.inner.borrow_mut();
            for entry in view.entries() {
                inner.save_entry(entry);
            }
            self.moved_saved += view.entries().len() as u64;
        }
    }

    /// Flushes staged records when past the blob threshold (or forced), then resolves delayed
    /// tiered reads in order and flushes them too. Returns whether anything was pushed.
    fn push_serialized(&mut self, force: bool) -> bool {
        {
            let inner = self.inner.borrow();
            if !force
                && inner.serializer.serialized_len() < MIN_BLOB_SIZE
                && inner.delayed.len() < MAX_DELAYED_ENTRIES
            {
                return false;
            }
        }

        let mut total = self.flush_chunk();
        let mut resolved_any = false;
        loop {
            let delayed = { self.inner.borrow_mut().delayed.pop() };
            let Some(entry) = delayed else {
                break;
            };
            resolved_any = true;
            // Blocking point: awaiting the tiered read is allowed only here.
            let bytes = entry.future.wait();
            self.inner.borrow_mut().serializer.save_resolved_external(
                entry.db,
                &entry.key,
                &bytes,
                entry.expire_at_ms,
                entry.mcflag,
                entry.sticky,
            );
        }
        if resolved_any {
            total += self.flush_chunk();
        }
        total > 0
    }

    fn flush_chunk(&self) -> usize {
        let chunk = self.inner.borrow_mut().serializer.take_chunk();
        if chunk.is_empty() {
            return 0;
        }
        let len = chunk.len();
        let ticket = self.gate.take_ticket();
        self.gate.wait_turn(ticket);
        self.consumer.borrow_mut().consume(chunk);
        self.gate.complete(ticket);

        // Counter-balance serialization CPU use by sleeping for about half the recent burn.
        let sleep = (self.recent_burn.get() / 2).min(MAX_BACKPRESSURE_SLEEP);
        if !sleep.is_zero() {
            std::thread::sleep(sleep);
        }
        len
    }
}
