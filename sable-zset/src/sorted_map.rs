//! Tree-backed sorted map: the large-set representation.

use std::collections::BTreeSet;
use std::mem;

use sable_common::containers::HotMap;
use sable_common::error::{OpResult, OpStatus};

use crate::score::{LexRange, ScoreKey, ScoreRange};

/// Number of entries yielded by one `scan` step.
const SCAN_CHUNK: usize = 10;

/// One member with its score.
pub type ScoredMember = (Vec<u8>, f64);

/// Conditions and modifiers for `add`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddOptions {
    /// Only add new members, never touch existing ones.
    pub nx: bool,
    /// Only update existing members, never add.
    pub xx: bool,
    /// Update an existing member only when the new score is greater.
    pub gt: bool,
    /// Update an existing member only when the new score is lower.
    pub lt: bool,
    /// Treat the score as an increment over the current score.
    pub incr: bool,
}

/// What `add` did with the member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// The member was new and was inserted.
    Added,
    /// The member existed and its score changed.
    Updated,
    /// A condition made the operation a no-op.
    Skipped,
}

/// Result of one `add` call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AddResult {
    /// Performed action.
    pub outcome: AddOutcome,
    /// Effective score after the call; absent when skipped.
    pub score: Option<f64>,
}

/// Sorted map over unique byte-string members ordered by `(score, member)`.
///
/// Invariant: `scores` and `tree` always hold exactly the same member set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SortedMap {
    scores: HotMap<Vec<u8>, f64>,
    tree: BTreeSet<(ScoreKey, Vec<u8>)>,
}

impl SortedMap {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of members.
    #[must_use]
    pub fn len(&self) -> usize {
        debug_assert_eq!(self.scores.len(), self.tree.len());
        self.scores.len()
    }

    /// Whether the map has no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    /// Inserts a new member. Returns `false` without touching the score when the member already
    /// exists.
    pub fn insert_new(&mut self, score: f64, member: &[u8]) -> OpResult<bool> {
        if score.is_nan() {
            return Err(OpStatus::InvalidFloat);
        }
        if self.scores.contains_key(member) {
            return Ok(false);
        }
        self.scores.insert(member.to_vec(), score);
        let inserted = self.tree.insert((ScoreKey::new(score), member.to_vec()));
        debug_assert!(inserted);
        Ok(true)
    }

    /// Adds or updates one member under the given conditions.
    ///
    /// # Errors
    ///
    /// Returns `OpStatus::InvalidFloat` when the input score, or the incremented result, is NaN.
    pub fn add(&mut self, score: f64, member: &[u8], options: AddOptions) -> OpResult<AddResult> {
        if score.is_nan() {
            return Err(OpStatus::InvalidFloat);
        }

        let Some(&current) = self.scores.get(member) else {
            if options.xx {
                return Ok(AddResult {
                    outcome: AddOutcome::Skipped,
                    score: None,
                });
            }
            self.scores.insert(member.to_vec(), score);
            self.tree.insert((ScoreKey::new(score), member.to_vec()));
            return Ok(AddResult {
                outcome: AddOutcome::Added,
                score: Some(score),
            });
        };

        if options.nx {
            return Ok(AddResult {
                outcome: AddOutcome::Skipped,
                score: None,
            });
        }

        let target = if options.incr { current + score } else { score };
        if target.is_nan() {
            return Err(OpStatus::InvalidFloat);
        }
        if (options.gt && target <= current) || (options.lt && target >= current) {
            return Ok(AddResult {
                outcome: AddOutcome::Skipped,
                score: None,
            });
        }
        if target == current {
            return Ok(AddResult {
                outcome: AddOutcome::Updated,
                score: Some(current),
            });
        }

        self.relocate(member, current, target);
        Ok(AddResult {
            outcome: AddOutcome::Updated,
            score: Some(target),
        })
    }

    fn relocate(&mut self, member: &[u8], from: f64, to: f64) {
        let removed = self.tree.remove(&(ScoreKey::new(from), member.to_vec()));
        debug_assert!(removed);
        self.tree.insert((ScoreKey::new(to), member.to_vec()));
        if let Some(slot) = self.scores.get_mut(member) {
            *slot = to;
        }
    }

    /// Removes one member. Returns whether it was present.
    pub fn delete(&mut self, member: &[u8]) -> bool {
        let Some(score) = self.scores.remove(member) else {
            return false;
        };
        let removed = self.tree.remove(&(ScoreKey::new(score), member.to_vec()));
        debug_assert!(removed);
        true
    }

    /// Score of one member.
    #[must_use]
    pub fn get_score(&self, member: &[u8]) -> Option<f64> {
        self.scores.get(member).copied()
    }

    /// Ordinal position of one member in `(score, member)` order.
    #[must_use]
    pub fn get_rank(&self, member: &[u8], reverse: bool) -> Option<usize> {
        let score = self.get_score(member)?;
        let key = (ScoreKey::new(score), member.to_vec());
        let forward = self.tree.range(..&key).count();
        if reverse {
            Some(self.len() - 1 - forward)
        } else {
            Some(forward)
        }
    }

    /// Rank and score of one member in a single lookup.
    #[must_use]
    pub fn get_rank_and_score(&self, member: &[u8], reverse: bool) -> Option<(usize, f64)> {
        let rank = self.get_rank(member, reverse)?;
        let score = self.get_score(member)?;
        Some((rank, score))
    }

    /// Members in rank window `[start, start + len)`.
    #[must_use]
    pub fn range_by_rank(&self, start: usize, len: usize, reverse: bool) -> Vec<ScoredMember> {
        let mut out = Vec::with_capacity(len.min(self.len()));
        self.iterate(start, len, reverse, |member, score| {
            out.push((member.to_vec(), score));
            true
        });
        out
    }

    /// Runs `visit` for each member in the rank window, stopping early when it returns `false`.
    /// Returns `false` on early stop.
    pub fn iterate(
        &self,
        start_rank: usize,
        len: usize,
        reverse: bool,
        mut visit: impl FnMut(&[u8], f64) -> bool,
    ) -> bool {
        let window = self.tree.iter().skip(start_rank).take(len);
        if reverse {
            for (score, member) in self.tree.iter().rev().skip(start_rank).take(len) {
                if !visit(member, score.get()) {
                    return false;
                }
            }
            return true;
        }
        for (score, member) in window {
            if !visit(member, score.get()) {
                return false;
            }
        }
        true
    }

    /// Members whose score falls inside the range, with offset/limit pagination.
    #[must_use]
    pub fn range_by_score(
        &self,
        range: &ScoreRange,
        offset: usize,
        limit: usize,
        reverse: bool,
    ) -> Vec<ScoredMember> {
        if range.is_empty() {
            return Vec::new();
        }
        let in_range = |entry: &&(ScoreKey, Vec<u8>)| range.contains(entry.0.get());
        let collect = |iter: &mut dyn Iterator<Item = &(ScoreKey, Vec<u8>)>| {
            iter.skip(offset)
                .take(limit)
                .map(|(score, member)| (member.clone(), score.get()))
                .collect::<Vec<_>>()
        };
        if reverse {
            collect(&mut self.tree.iter().rev().filter(in_range))
        } else {
            collect(&mut self.tree.iter().filter(in_range))
        }
    }

    /// Number of members whose score falls inside the range.
    #[must_use]
    pub fn count_in_range(&self, range: &ScoreRange) -> usize {
        if range.is_empty() {
            return 0;
        }
        self.tree
            .iter()
            .filter(|(score, _)| range.contains(score.get()))
            .count()
    }

    /// Members inside the lexicographic range, with offset/limit pagination.
    #[must_use]
    pub fn range_by_lex(
        &self,
        range: &LexRange,
        offset: usize,
        limit: usize,
        reverse: bool,
    ) -> Vec<ScoredMember> {
        let in_range = |entry: &&(ScoreKey, Vec<u8>)| range.contains(entry.1.as_slice());
        let collect = |iter: &mut dyn Iterator<Item = &(ScoreKey, Vec<u8>)>| {
            iter.skip(offset)
                .take(limit)
                .map(|(score, member)| (member.clone(), score.get()))
                .collect::<Vec<_>>()
        };
        if reverse {
            collect(&mut self.tree.iter().rev().filter(in_range))
        } else {
            collect(&mut self.tree.iter().filter(in_range))
        }
    }

    /// Number of members inside the lexicographic range.
    #[must_use]
    pub fn lex_count(&self, range: &LexRange) -> usize {
        self.tree
            .iter()
            .filter(|(_, member)| range.contains(member.as_slice()))
            .count()
    }

    /// Removes and returns up to `count` members from the top (or bottom) of the score order.
    pub fn pop_top(&mut self, count: usize, reverse: bool) -> Vec<ScoredMember> {
        let victims: Vec<ScoredMember> = if reverse {
            self.tree
                .iter()
                .rev()
                .take(count)
                .map(|(score, member)| (member.clone(), score.get()))
                .collect()
        } else {
            self.tree
                .iter()
                .take(count)
                .map(|(score, member)| (member.clone(), score.get()))
                .collect()
        };
        for (member, _) in &victims {
            let _ = self.delete(member);
        }
        victims
    }

    /// Removes members in the inclusive rank window `[start, end]`. Returns removed count.
    pub fn delete_range_by_rank(&mut self, start: usize, end: usize) -> usize {
        if start > end || start >= self.len() {
            return 0;
        }
        let len = end.min(self.len() - 1) - start + 1;
        let victims = self.range_by_rank(start, len, false);
        for (member, _) in &victims {
            let _ = self.delete(member);
        }
        victims.len()
    }

    /// Removes members whose score falls inside the range. Returns removed count.
    pub fn delete_range_by_score(&mut self, range: &ScoreRange) -> usize {
        let victims = self.range_by_score(range, 0, usize::MAX, false);
        for (member, _) in &victims {
            let _ = self.delete(member);
        }
        victims.len()
    }

    /// Removes members inside the lexicographic range. Returns removed count.
    pub fn delete_range_by_lex(&mut self, range: &LexRange) -> usize {
        let victims = self.range_by_lex(range, 0, usize::MAX, false);
        for (member, _) in &victims {
            let _ = self.delete(member);
        }
        victims.len()
    }

    /// Cursor scan over the member set in tree order.
    ///
    /// The cursor is the ordinal of the next unvisited entry; zero means done. Stable as long as
    /// the map is not mutated between steps.
    pub fn scan(&self, cursor: u64, mut visit: impl FnMut(&[u8], f64)) -> u64 {
        let start = cursor as usize;
        let mut yielded = 0_usize;
        for (score, member) in self.tree.iter().skip(start).take(SCAN_CHUNK) {
            visit(member, score.get());
            yielded += 1;
        }
        let next = start + yielded;
        if next >= self.len() { 0 } else { next as u64 }
    }

    /// Iterates all members in `(score, member)` order.
    pub fn iter_ordered(&self) -> impl Iterator<Item = (&[u8], f64)> + '_ {
        self.tree
            .iter()
            .map(|(score, member)| (member.as_slice(), score.get()))
    }

    /// Rough heap footprint estimate.
    #[must_use]
    pub fn malloc_size(&self) -> usize {
        let per_entry = mem::size_of::<(ScoreKey, Vec<u8>)>()
            + mem::size_of::<(Vec<u8>, f64)>();
        self.scores
            .keys()
            .map(|member| member.len() * 2 + per_entry)
            .sum()
    }
}
