//! Traversal cursor encoding.

/// Number of bits reserved for the in-segment bucket id at the top of the cursor word.
const BUCKET_BITS: u32 = 8;

/// Number of bits available for the left-aligned directory prefix.
pub(crate) const PREFIX_BITS: u32 = 64 - BUCKET_BITS;

/// Opaque traversal position over a table's physical buckets.
///
/// The encoding packs the in-segment bucket id into the top byte and the directory prefix of the
/// segment left-aligned into the remaining bits. Left alignment makes cursors survive directory
/// growth: when the directory doubles, an old prefix still addresses the same key region, just
/// with one more significant bit.
///
/// `Cursor::default()` is both the start position and the "complete wraparound" return value, so
/// traversal loops run `loop { ... if cursor.is_exhausted() { break } }`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct Cursor(u64);

impl Cursor {
    /// Packs a bucket id and a directory index under the given global depth.
    #[must_use]
    pub(crate) fn encode(bucket: u8, dir_index: usize, global_depth: u8) -> Self {
        let prefix = if global_depth == 0 {
            0
        } else {
            (dir_index as u64) << (PREFIX_BITS - u32::from(global_depth))
        };
        Self((u64::from(bucket) << PREFIX_BITS) | prefix)
    }

    /// Returns the in-segment bucket id this cursor points at.
    #[must_use]
    pub fn bucket_id(self) -> u8 {
        (self.0 >> PREFIX_BITS) as u8
    }

    /// Returns the left-aligned directory prefix, comparable across directory growth.
    #[must_use]
    pub fn segment_prefix(self) -> u64 {
        self.0 & ((1_u64 << PREFIX_BITS) - 1)
    }

    /// Resolves the directory index under the given global depth.
    #[must_use]
    pub(crate) fn dir_index(self, global_depth: u8) -> usize {
        if global_depth == 0 {
            0
        } else {
            (self.segment_prefix() >> (PREFIX_BITS - u32::from(global_depth))) as usize
        }
    }

    /// Whether this cursor marks a completed wraparound (or a fresh start).
    #[must_use]
    pub fn is_exhausted(self) -> bool {
        self.0 == 0
    }
}
