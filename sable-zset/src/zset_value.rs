//! Representation-switching sorted-set value.

use sable_common::error::OpResult;

use crate::packed::PackedZSet;
use crate::score::{LexRange, ScoreRange};
use crate::sorted_map::{AddOptions, AddResult, ScoredMember, SortedMap};

/// Largest packed set before promotion to the tree representation.
pub const PACKED_MAX_ENTRIES: usize = 128;
/// Longest member a packed set will hold before promotion.
pub const PACKED_MAX_MEMBER_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq)]
enum Repr {
    Packed(PackedZSet),
    Tree(SortedMap),
}

/// Sorted-set value with an automatic small-size representation.
///
/// Semantics do not depend on the representation; promotion happens transparently when the
/// packed thresholds are exceeded and is never reversed.
#[derive(Debug, Clone, PartialEq)]
pub struct ZSetValue {
    repr: Repr,
}

impl Default for ZSetValue {
    fn default() -> Self {
        Self::new()
    }
}

impl ZSetValue {
    /// Creates an empty set in the packed representation.
    #[must_use]
    pub fn new() -> Self {
        Self {
            repr: Repr::Packed(PackedZSet::default()),
        }
    }

    /// Number of members.
    #[must_use]
    pub fn len(&self) -> usize {
        match &self.repr {
            Repr::Packed(packed) => packed.len(),
            Repr::Tree(tree) => tree.len(),
        }
    }

    /// Whether the set has no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the set currently uses the packed representation.
    #[must_use]
    pub fn is_packed(&self) -> bool {
        matches!(self.repr, Repr::Packed(_))
    }

    fn promote_if_needed(&mut self, incoming_member_len: usize) {
        let Repr::Packed(packed) = &self.repr else {
            return;
        };
        if packed.len() < PACKED_MAX_ENTRIES
            && incoming_member_len <= PACKED_MAX_MEMBER_LEN
            && packed.max_member_len() <= PACKED_MAX_MEMBER_LEN
        {
            return;
        }
        let mut tree = SortedMap::new();
        for (member, score) in packed.entries() {
            let _ = tree.insert_new(*score, member);
        }
        self.repr = Repr::Tree(tree);
    }

    /// Adds or updates one member. See [`SortedMap::add`].
    ///
    /// # Errors
    ///
    /// Returns `OpStatus::InvalidFloat` for NaN scores or NaN increment results.
    pub fn add(&mut self, score: f64, member: &[u8], options: AddOptions) -> OpResult<AddResult> {
        self.promote_if_needed(member.len());
        match &mut self.repr {
            Repr::Packed(packed) => packed.add(score, member, options),
            Repr::Tree(tree) => tree.add(score, member, options),
        }
    }

    /// Inserts a member known to be absent. See [`SortedMap::insert_new`].
    ///
    /// # Errors
    ///
    /// Returns `OpStatus::InvalidFloat` for NaN scores.
    pub fn insert_new(&mut self, score: f64, member: &[u8]) -> OpResult<bool> {
        self.promote_if_needed(member.len());
        match &mut self.repr {
            Repr::Packed(packed) => packed.insert_new(score, member),
            Repr::Tree(tree) => tree.insert_new(score, member),
        }
    }

    /// Removes one member. Returns whether it was present.
    pub fn delete(&mut self, member: &[u8]) -> bool {
        match &mut self.repr {
            Repr::Packed(packed) => packed.delete(member),
            Repr::Tree(tree) => tree.delete(member),
        }
    }

    /// Score of one member.
    #[must_use]
    pub fn get_score(&self, member: &[u8]) -> Option<f64> {
        match &self.repr {
            Repr::Packed(packed) => packed.get_score(member),
            Repr::Tree(tree) => tree.get_score(member),
        }
    }

    /// Ordinal of one member in `(score, member)` order.
    #[must_use]
    pub fn get_rank(&self, member: &[u8], reverse: bool) -> Option<usize> {
        match &self.repr {
            Repr::Packed(packed) => packed.get_rank(member, reverse),
            Repr::Tree(tree) => tree.get_rank(member, reverse),
        }
    }

    /// Members in rank window `[start, start + len)`.
    #[must_use]
    pub fn range_by_rank(&self, start: usize, len: usize, reverse: bool) -> Vec<ScoredMember> {
        match &self.repr {
            Repr::Packed(packed) => packed.range_by_rank(start, len, reverse),
            Repr::Tree(tree) => tree.range_by_rank(start, len, reverse),
        }
    }

    /// Members whose score falls inside the range.
    #[must_use]
    pub fn range_by_score(
        &self,
        range: &ScoreRange,
        offset: usize,
        limit: usize,
        reverse: bool,
    ) -> Vec<ScoredMember> {
        self.with_tree_view(|tree| tree.range_by_score(range, offset, limit, reverse))
    }

    /// Members inside the lexicographic range.
    #[must_use]
    pub fn range_by_lex(
        &self,
        range: &LexRange,
        offset: usize,
        limit: usize,
        reverse: bool,
    ) -> Vec<ScoredMember> {
        self.with_tree_view(|tree| tree.range_by_lex(range, offset, limit, reverse))
    }

    /// Number of members whose score falls inside the range.
    #[must_use]
    pub fn count_in_range(&self, range: &ScoreRange) -> usize {
        self.with_tree_view(|tree| tree.count_in_range(range))
    }

    /// Rough heap footprint estimate.
    #[must_use]
    pub fn malloc_size(&self) -> usize {
        match &self.repr {
            Repr::Packed(packed) => packed.malloc_size(),
            Repr::Tree(tree) => tree.malloc_size(),
        }
    }

    /// Runs a read-only tree operation, materializing a temporary tree for packed sets.
    ///
    /// Packed sets are small by construction, so the conversion cost is bounded by the packed
    /// thresholds.
    fn with_tree_view<T>(&self, read: impl FnOnce(&SortedMap) -> T) -> T {
        match &self.repr {
            Repr::Tree(tree) => read(tree),
            Repr::Packed(packed) => {
                let mut tree = SortedMap::new();
                for (member, score) in packed.entries() {
                    let _ = tree.insert_new(*score, member);
                }
                read(&tree)
            }
        }
    }
}
