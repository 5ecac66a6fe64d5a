//! Sorted-set substrate: a member→score hash paired with an ordered tree.
//!
//! Every member present in one structure is present in the other. Member-indexed operations go
//! through the hash; range, rank, and lexicographic scans traverse the tree. Small sets use a
//! packed array representation with identical semantics.

mod packed;
mod score;
mod sorted_map;
mod zset_value;

pub use score::{LexBound, LexRange, ScoreRange};
pub use sorted_map::{AddOptions, AddOutcome, AddResult, ScoredMember, SortedMap};
pub use zset_value::{PACKED_MAX_ENTRIES, PACKED_MAX_MEMBER_LEN, ZSetValue};

#[cfg(test)]
#[path = "tests.rs"]
mod tests;
