//! Journal record model used by the storage core's change stream.
//!
//! For every structural change the slice may emit one record; records are sequenced by
//! monotonic LSNs and buffered in a bounded in-memory backlog for streaming consumers.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use sable_common::ids::{DbIndex, Lsn, TxId};

/// Default number of journal entries kept in the streaming backlog.
pub const DEFAULT_BACKLOG_LEN: usize = 8192;

/// One keyspace mutation, in the shape the replication stream ships it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalOp {
    /// Key write, with the optional attributes the wire form carries.
    Set {
        /// Affected key.
        key: Vec<u8>,
        /// Serialized value bytes.
        value: Vec<u8>,
        /// Absolute deadline in milliseconds, when the write installs one.
        expire_at_ms: Option<u64>,
        /// Preserve an existing deadline instead of clearing it.
        keep_ttl: bool,
        /// Key is exempt from eviction.
        sticky: bool,
        /// Auxiliary memcache flag, when present.
        mcflags: Option<u32>,
    },
    /// Explicit key removal.
    Del {
        /// Affected key.
        key: Vec<u8>,
    },
    /// Deadline installation or update.
    PExpireAt {
        /// Affected key.
        key: Vec<u8>,
        /// Absolute deadline in milliseconds.
        deadline_ms: u64,
    },
    /// Deadline removal.
    Persist {
        /// Affected key.
        key: Vec<u8>,
    },
    /// Atomic multi-key write of the pairs owned by this shard.
    MSet {
        /// Key/value pairs.
        pairs: Vec<(Vec<u8>, Vec<u8>)>,
    },
    /// Expiry- or eviction-driven removal, marked so consumers can tell it from a user DEL.
    Expired {
        /// Affected key.
        key: Vec<u8>,
    },
}

/// One append-only journal record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    /// Transaction id associated with this record.
    pub txid: TxId,
    /// Database the mutation happened in.
    pub db: DbIndex,
    /// The mutation itself.
    pub op: JournalOp,
}

impl JournalEntry {
    /// Renders the record in its textual wire form.
    #[must_use]
    pub fn to_command_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match &self.op {
            JournalOp::Set {
                key,
                value,
                expire_at_ms,
                keep_ttl,
                sticky,
                mcflags,
            } => {
                out.extend_from_slice(b"SET ");
                out.extend_from_slice(key);
                out.push(b' ');
                out.extend_from_slice(value);
                if let Some(deadline) = expire_at_ms {
                    out.extend_from_slice(format!(" PXAT {deadline}").as_bytes());
                }
                if *keep_ttl {
                    out.extend_from_slice(b" KEEPTTL");
                }
                if *sticky {
                    out.extend_from_slice(b" STICK");
                }
                if let Some(flags) = mcflags {
                    out.extend_from_slice(format!(" _MCFLAGS {flags}").as_bytes());
                }
            }
            JournalOp::Del { key } | JournalOp::Expired { key } => {
                out.extend_from_slice(b"DEL ");
                out.extend_from_slice(key);
            }
            JournalOp::PExpireAt { key, deadline_ms } => {
                out.extend_from_slice(b"PEXPIREAT ");
                out.extend_from_slice(key);
                out.extend_from_slice(format!(" {deadline_ms}").as_bytes());
            }
            JournalOp::Persist { key } => {
                out.extend_from_slice(b"PERSIST ");
                out.extend_from_slice(key);
            }
            JournalOp::MSet { pairs } => {
                out.extend_from_slice(b"MSET");
                for (key, value) in pairs {
                    out.push(b' ');
                    out.extend_from_slice(key);
                    out.push(b' ');
                    out.extend_from_slice(value);
                }
            }
        }
        out
    }

    /// Whether this record was produced by expiry or eviction rather than a user command.
    #[must_use]
    pub fn is_expiry(&self) -> bool {
        matches!(self.op, JournalOp::Expired { .. })
    }
}

/// Journal record with its assigned LSN.
#[derive(Debug, Clone, PartialEq, Eq)]
struct JournalRecord {
    lsn: Lsn,
    entry: JournalEntry,
}

/// In-memory append-only journal with bounded backlog and monotonic LSN tracking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InMemoryJournal {
    records: VecDeque<JournalRecord>,
    backlog_len: usize,
    next_lsn: Lsn,
}

impl Default for InMemoryJournal {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryJournal {
    /// Creates an empty journal with the default backlog size.
    #[must_use]
    pub fn new() -> Self {
        Self::with_backlog(DEFAULT_BACKLOG_LEN)
    }

    /// Creates an empty journal with a custom backlog size.
    ///
    /// A backlog size of zero is coerced to one entry.
    #[must_use]
    pub fn with_backlog(backlog_len: usize) -> Self {
        let backlog_len = backlog_len.max(1);
        Self {
            records: VecDeque::with_capacity(backlog_len),
            backlog_len,
            next_lsn: 1,
        }
    }

    /// Appends one entry and returns its assigned LSN.
    pub fn append(&mut self, entry: JournalEntry) -> Lsn {
        let lsn = self.next_lsn;
        self.next_lsn = self.next_lsn.saturating_add(1);
        if self.records.len() == self.backlog_len {
            let _ = self.records.pop_front();
        }
        self.records.push_back(JournalRecord { lsn, entry });
        lsn
    }

    /// LSN of the next appended entry.
    #[must_use]
    pub fn current_lsn(&self) -> Lsn {
        self.next_lsn
    }

    /// Whether an LSN can still be served from the backlog.
    #[must_use]
    pub fn is_lsn_in_buffer(&self, lsn: Lsn) -> bool {
        let (Some(front), Some(back)) = (self.records.front(), self.records.back()) else {
            return false;
        };
        front.lsn <= lsn && lsn <= back.lsn
    }

    /// One entry by LSN, when still buffered.
    #[must_use]
    pub fn entry_at_lsn(&self, lsn: Lsn) -> Option<JournalEntry> {
        if !self.is_lsn_in_buffer(lsn) {
            return None;
        }
        let front_lsn = self.records.front().map(|record| record.lsn)?;
        let offset = usize::try_from(lsn.saturating_sub(front_lsn)).ok()?;
        self.records.get(offset).map(|record| record.entry.clone())
    }

    /// Entries from a starting LSN (inclusive) to the head.
    ///
    /// `start_lsn == current_lsn()` yields an empty suffix; stale or future cursors yield
    /// `None`.
    #[must_use]
    pub fn entries_from_lsn(&self, start_lsn: Lsn) -> Option<Vec<JournalEntry>> {
        if start_lsn == self.current_lsn() {
            return Some(Vec::new());
        }
        if start_lsn > self.current_lsn() || !self.is_lsn_in_buffer(start_lsn) {
            return None;
        }
        Some(
            self.records
                .iter()
                .filter(|record| record.lsn >= start_lsn)
                .map(|record| record.entry.clone())
                .collect(),
        )
    }

    /// Number of buffered entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the backlog is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Callback invoked for every appended entry.
pub type JournalChangeCallback = Box<dyn FnMut(&JournalEntry)>;

/// Shard-local journal front: the LSN ring plus streaming hooks and the flush-suppression
/// counter used by non-suspending eviction paths.
pub struct ShardJournal {
    inner: RefCell<InMemoryJournal>,
    change_cbs: RefCell<Vec<(u32, JournalChangeCallback)>>,
    next_cb_id: Cell<u32>,
    flush_disabled: Cell<u32>,
}

impl Default for ShardJournal {
    fn default() -> Self {
        Self::new()
    }
}

impl ShardJournal {
    /// Creates a journal with the default backlog.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RefCell::new(InMemoryJournal::new()),
            change_cbs: RefCell::new(Vec::new()),
            next_cb_id: Cell::new(1),
            flush_disabled: Cell::new(0),
        }
    }

    /// Appends one entry, notifying streaming hooks, and returns its LSN.
    pub fn append(&self, entry: JournalEntry) -> Lsn {
        let lsn = self.inner.borrow_mut().append(entry.clone());
        let mut cbs = self.change_cbs.borrow_mut();
        for (_, cb) in cbs.iter_mut() {
            cb(&entry);
        }
        lsn
    }

    /// Registers a streaming hook. Returns its id.
    pub fn register_on_change(&self, cb: JournalChangeCallback) -> u32 {
        let id = self.next_cb_id.get();
        self.next_cb_id.set(id + 1);
        self.change_cbs.borrow_mut().push((id, cb));
        id
    }

    /// Removes a streaming hook by id.
    pub fn unregister_on_change(&self, id: u32) {
        self.change_cbs.borrow_mut().retain(|(cb_id, _)| *cb_id != id);
    }

    /// LSN of the next appended entry.
    #[must_use]
    pub fn current_lsn(&self) -> Lsn {
        self.inner.borrow().current_lsn()
    }

    /// Whether an LSN is still buffered.
    #[must_use]
    pub fn is_lsn_in_buffer(&self, lsn: Lsn) -> bool {
        self.inner.borrow().is_lsn_in_buffer(lsn)
    }

    /// Entries from a starting LSN to the head; see [`InMemoryJournal::entries_from_lsn`].
    #[must_use]
    pub fn entries_from_lsn(&self, start_lsn: Lsn) -> Option<Vec<JournalEntry>> {
        self.inner.borrow().entries_from_lsn(start_lsn)
    }

    /// One entry by LSN, when still buffered; see [`InMemoryJournal::entry_at_lsn`].
    #[must_use]
    pub fn entry_at_lsn(&self, lsn: Lsn) -> Option<JournalEntry> {
        self.inner.borrow().entry_at_lsn(lsn)
    }

    /// All buffered entries in append order.
    #[must_use]
    pub fn entries(&self) -> Vec<JournalEntry> {
        self.inner
            .borrow()
            .records
            .iter()
            .map(|record| record.entry.clone())
            .collect()
    }

    /// Whether a journal write would currently suspend the caller.
    #[must_use]
    pub fn will_block_on_write(&self) -> bool {
        false
    }

    /// Whether flush-driven suspension is currently suppressed.
    #[must_use]
    pub fn flush_suppressed(&self) -> bool {
        self.flush_disabled.get() > 0
    }

    pub(crate) fn suppress_flush(&self) {
        self.flush_disabled.set(self.flush_disabled.get() + 1);
    }

    pub(crate) fn release_flush(&self) {
        debug_assert!(self.flush_disabled.get() > 0);
        self.flush_disabled.set(self.flush_disabled.get().saturating_sub(1));
    }
}

/// Scope guard suppressing journal-driven suspension, held across eviction and garbage
/// collection hooks.
pub struct JournalFlushGuard {
    journal: Option<Rc<ShardJournal>>,
}

impl JournalFlushGuard {
    /// Starts a suppression scope. Accepts `None` so call sites without a journal stay
    /// branch-free.
    #[must_use]
    pub fn new(journal: Option<&Rc<ShardJournal>>) -> Self {
        if let Some(journal) = journal {
            journal.suppress_flush();
        }
        Self {
            journal: journal.cloned(),
        }
    }
}

impl Drop for JournalFlushGuard {
    fn drop(&mut self) {
        if let Some(journal) = &self.journal {
            journal.release_flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        InMemoryJournal, JournalEntry, JournalFlushGuard, JournalOp, ShardJournal,
    };
    use googletest::prelude::*;
    use rstest::rstest;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn del_entry(key: &[u8]) -> JournalEntry {
        JournalEntry {
            txid: 1,
            db: 0,
            op: JournalOp::Del { key: key.to_vec() },
        }
    }

    #[rstest]
    fn lsns_are_assigned_monotonically() {
        let mut journal = InMemoryJournal::new();
        let first = journal.append(del_entry(b"a"));
        let second = journal.append(del_entry(b"b"));
        assert_that!(second, eq(first + 1));
        assert_that!(journal.current_lsn(), eq(second + 1));
    }

    #[rstest]
    fn backlog_drops_oldest_entries() {
        let mut journal = InMemoryJournal::with_backlog(2);
        let first = journal.append(del_entry(b"a"));
        let _ = journal.append(del_entry(b"b"));
        let _ = journal.append(del_entry(b"c"));
        assert_that!(journal.len(), eq(2));
        assert_that!(journal.is_lsn_in_buffer(first), eq(false));
        assert_that!(journal.entries_from_lsn(first), eq(&None));
    }

    #[rstest]
    fn suffix_from_current_lsn_is_empty() {
        let mut journal = InMemoryJournal::new();
        let _ = journal.append(del_entry(b"a"));
        let suffix = journal
            .entries_from_lsn(journal.current_lsn())
            .expect("head cursor is valid");
        assert_that!(suffix.is_empty(), eq(true));
    }

    #[rstest]
    fn set_records_render_their_wire_form() {
        let entry = JournalEntry {
            txid: 9,
            db: 0,
            op: JournalOp::Set {
                key: b"k".to_vec(),
                value: b"v".to_vec(),
                expire_at_ms: Some(1500),
                keep_ttl: false,
                sticky: true,
                mcflags: Some(7),
            },
        };
        assert_that!(
            entry.to_command_bytes(),
            eq(&b"SET k v PXAT 1500 STICK _MCFLAGS 7".to_vec())
        );
    }

    #[rstest]
    fn expired_records_are_distinguishable() {
        let entry = JournalEntry {
            txid: 1,
            db: 0,
            op: JournalOp::Expired { key: b"k".to_vec() },
        };
        assert_that!(entry.is_expiry(), eq(true));
        assert_that!(entry.to_command_bytes(), eq(&b"DEL k".to_vec()));
    }

    #[rstest]
    fn shard_journal_notifies_streaming_hooks() {
        let journal = ShardJournal::new();
        let observed = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&observed);
        let id = journal.register_on_change(Box::new(move |entry| {
            sink.borrow_mut().push(entry.clone());
        }));

        let _ = journal.append(del_entry(b"a"));
        assert_that!(observed.borrow().len(), eq(1));

        journal.unregister_on_change(id);
        let _ = journal.append(del_entry(b"b"));
        assert_that!(observed.borrow().len(), eq(1));
    }

    #[rstest]
    fn flush_guard_scopes_suppression() {
        let journal = Rc::new(ShardJournal::new());
        assert_that!(journal.flush_suppressed(), eq(false));
        {
            let _guard = JournalFlushGuard::new(Some(&journal));
            assert_that!(journal.flush_suppressed(), eq(true));
            {
                let _inner = JournalFlushGuard::new(Some(&journal));
                assert_that!(journal.flush_suppressed(), eq(true));
            }
            assert_that!(journal.flush_suppressed(), eq(true));
        }
        assert_that!(journal.flush_suppressed(), eq(false));
    }
}
