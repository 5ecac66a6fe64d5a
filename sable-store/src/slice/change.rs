//! Pre-mutation change requests and the observer registry types.

use sable_common::ids::DbIndex;
use sable_dash::{BucketCoord, BucketRef, Cursor, SlotPos};

use crate::key::StoredKey;
use crate::value::Value;

/// One entry of a bucket, as seen by a change observer.
///
/// All references borrow the slice for the duration of the callback; observers copy whatever
/// they keep, and never retain a view across a suspension point.
#[derive(Debug, Clone, Copy)]
pub struct EntryView<'a> {
    /// Database the entry lives in.
    pub db: DbIndex,
    /// Key bytes.
    pub key: &'a [u8],
    /// Value reference.
    pub value: &'a Value,
    /// Eviction exemption bit.
    pub sticky: bool,
    /// Resolved absolute deadline, when the entry has one.
    pub expire_at_ms: Option<u64>,
    /// Auxiliary tag, when the entry has one.
    pub mcflag: Option<u32>,
}

/// View of one bucket about to change: its entries plus a version handle observers may raise.
pub struct BucketChange<'a> {
    pub(crate) bucket: BucketRef<'a, StoredKey, Value>,
    pub(crate) entries: Vec<EntryView<'a>>,
}

impl<'a> BucketChange<'a> {
    /// Bucket coordinate.
    #[must_use]
    pub fn coord(&self) -> BucketCoord {
        self.bucket.coord()
    }

    /// Traversal cursor naming this bucket.
    #[must_use]
    pub fn cursor(&self) -> Cursor {
        self.bucket.cursor()
    }

    /// Version at view-construction time.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.bucket.version()
    }

    /// Raises the bucket version; never lowers it.
    pub fn set_version_at_least(&self, version: u64) {
        self.bucket.set_version_at_least(version);
    }

    /// Entries of the bucket.
    #[must_use]
    pub fn entries(&self) -> &[EntryView<'a>] {
        &self.entries
    }
}

/// The mutation about to happen.
///
/// `Insert` carries the candidate buckets the insert may touch (displacement targets, or the
/// whole segment when the insert will split it), so observers can act on every bucket whose
/// version still predates their registration.
pub enum ChangeReq<'a> {
    /// A new key is about to be inserted.
    Insert {
        /// Key being inserted.
        key: &'a [u8],
        /// Candidate buckets the insert may touch.
        buckets: &'a [BucketChange<'a>],
    },
    /// An existing bucket is about to be structurally mutated.
    Update(&'a BucketChange<'a>),
}

/// Pre-mutation observer. Must not suspend.
pub type ChangeCallback = Box<dyn FnMut(DbIndex, &ChangeReq<'_>)>;

/// Observer of entry relocations `(source, destination)` reported at bucket granularity.
pub type MovedCallback = Box<dyn FnMut(DbIndex, &[(Cursor, Cursor)])>;

/// Outcome of one snapshot traversal step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnapshotScanStep {
    /// Cursor of the next bucket; exhausted when the database is fully traversed.
    pub cursor: Cursor,
    /// Entries handed to the emitter by this step.
    pub serialized: u32,
    /// Buckets skipped because their version already reached the bound.
    pub skipped: u32,
}

/// Outcome of a lazy expiry check on one found entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExpireOutcome {
    /// Entry is live; the expire-table position is attached when one exists.
    Live(Option<SlotPos>),
    /// Entry was expired and deleted.
    Deleted,
}
