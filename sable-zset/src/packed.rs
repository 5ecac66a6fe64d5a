//! Packed small-set representation: a vector of `(member, score)` kept in `(score, member)`
//! order. Semantics are identical to the tree representation; only the cost model differs.

use sable_common::error::{OpResult, OpStatus};

use crate::sorted_map::{AddOptions, AddOutcome, AddResult, ScoredMember};

#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct PackedZSet {
    entries: Vec<ScoredMember>,
}

impl PackedZSet {
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn entries(&self) -> &[ScoredMember] {
        &self.entries
    }

    pub(crate) fn max_member_len(&self) -> usize {
        self.entries
            .iter()
            .map(|(member, _)| member.len())
            .max()
            .unwrap_or(0)
    }

    fn position(&self, member: &[u8]) -> Option<usize> {
        self.entries.iter().position(|(m, _)| m == member)
    }

    fn ordered_insert(&mut self, member: Vec<u8>, score: f64) {
        let at = self
            .entries
            .partition_point(|(m, s)| (*s, m.as_slice()) < (score, member.as_slice()));
        self.entries.insert(at, (member, score));
    }

    pub(crate) fn get_score(&self, member: &[u8]) -> Option<f64> {
        self.position(member).map(|at| self.entries[at].1)
    }

    pub(crate) fn get_rank(&self, member: &[u8], reverse: bool) -> Option<usize> {
        let at = self.position(member)?;
        if reverse {
            Some(self.entries.len() - 1 - at)
        } else {
            Some(at)
        }
    }

    pub(crate) fn delete(&mut self, member: &[u8]) -> bool {
        let Some(at) = self.position(member) else {
            return false;
        };
        let _ = self.entries.remove(at);
        true
    }

    pub(crate) fn insert_new(&mut self, score: f64, member: &[u8]) -> OpResult<bool> {
        if score.is_nan() {
            return Err(OpStatus::InvalidFloat);
        }
        if self.position(member).is_some() {
            return Ok(false);
        }
        self.ordered_insert(member.to_vec(), score);
        Ok(true)
    }

    pub(crate) fn add(
        &mut self,
        score: f64,
        member: &[u8],
        options: AddOptions,
    ) -> OpResult<AddResult> {
        if score.is_nan() {
            return Err(OpStatus::InvalidFloat);
        }
        let skipped = AddResult {
            outcome: AddOutcome::Skipped,
            score: None,
        };

        let Some(at) = self.position(member) else {
            if options.xx {
                return Ok(skipped);
            }
            self.ordered_insert(member.to_vec(), score);
            return Ok(AddResult {
                outcome: AddOutcome::Added,
                score: Some(score),
            });
        };

        if options.nx {
            return Ok(skipped);
        }
        let current = self.entries[at].1;
        let target = if options.incr { current + score } else { score };
        if target.is_nan() {
            return Err(OpStatus::InvalidFloat);
        }
        if (options.gt && target <= current) || (options.lt && target >= current) {
            return Ok(skipped);
        }
        if target != current {
            let (member, _) = self.entries.remove(at);
            self.ordered_insert(member, target);
        }
        Ok(AddResult {
            outcome: AddOutcome::Updated,
            score: Some(target),
        })
    }

    pub(crate) fn range_by_rank(
        &self,
        start: usize,
        len: usize,
        reverse: bool,
    ) -> Vec<ScoredMember> {
        if reverse {
            self.entries
                .iter()
                .rev()
                .skip(start)
                .take(len)
                .cloned()
                .collect()
        } else {
            self.entries.iter().skip(start).take(len).cloned().collect()
        }
    }

    pub(crate) fn malloc_size(&self) -> usize {
        self.entries
            .iter()
            .map(|(member, _)| member.len() + std::mem::size_of::<ScoredMember>())
            .sum()
    }
}
