//! Score ordering and range specifications.

use std::cmp::Ordering;

use sable_common::error::{OpResult, OpStatus};

/// Total-order wrapper over a score used as the tree key.
///
/// Negative zero is normalized to positive zero so tree order matches numeric equality. NaN is
/// rejected at the API boundary and never reaches a key.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct ScoreKey(f64);

impl ScoreKey {
    pub(crate) fn new(score: f64) -> Self {
        debug_assert!(!score.is_nan());
        if score == 0.0 { Self(0.0) } else { Self(score) }
    }

    pub(crate) fn get(self) -> f64 {
        self.0
    }
}

impl Eq for ScoreKey {}

impl PartialOrd for ScoreKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScoreKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// Inclusive/exclusive score interval.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreRange {
    /// Lower bound.
    pub min: f64,
    /// Upper bound.
    pub max: f64,
    /// Whether the lower bound is exclusive.
    pub minex: bool,
    /// Whether the upper bound is exclusive.
    pub maxex: bool,
}

impl ScoreRange {
    /// Builds a validated score interval.
    ///
    /// # Errors
    ///
    /// Returns `OpStatus::InvalidFloat` when either bound is NaN.
    pub fn new(min: f64, max: f64, minex: bool, maxex: bool) -> OpResult<Self> {
        if min.is_nan() || max.is_nan() {
            return Err(OpStatus::InvalidFloat);
        }
        Ok(Self {
            min,
            max,
            minex,
            maxex,
        })
    }

    /// Unbounded interval covering every score.
    #[must_use]
    pub fn all() -> Self {
        Self {
            min: f64::NEG_INFINITY,
            max: f64::INFINITY,
            minex: false,
            maxex: false,
        }
    }

    /// Whether the score falls inside the interval.
    #[must_use]
    pub fn contains(&self, score: f64) -> bool {
        let above_min = if self.minex {
            score > self.min
        } else {
            score >= self.min
        };
        let below_max = if self.maxex {
            score < self.max
        } else {
            score <= self.max
        };
        above_min && below_max
    }

    /// Whether the interval cannot contain any score.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.min > self.max || (self.min == self.max && (self.minex || self.maxex))
    }
}

/// One end of a lexicographic interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LexBound {
    /// Below every member.
    NegInfinity,
    /// Above every member.
    PosInfinity,
    /// Inclusive bound.
    Inclusive(Vec<u8>),
    /// Exclusive bound.
    Exclusive(Vec<u8>),
}

/// Lexicographic member interval. Meaningful when all members share one score, matching the
/// classic contract for lex ranges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LexRange {
    /// Lower bound.
    pub min: LexBound,
    /// Upper bound.
    pub max: LexBound,
}

impl LexRange {
    /// Whether the member falls inside the interval.
    #[must_use]
    pub fn contains(&self, member: &[u8]) -> bool {
        let above_min = match &self.min {
            LexBound::NegInfinity => true,
            LexBound::PosInfinity => false,
            LexBound::Inclusive(bound) => member >= bound.as_slice(),
            LexBound::Exclusive(bound) => member > bound.as_slice(),
        };
        let below_max = match &self.max {
            LexBound::NegInfinity => false,
            LexBound::PosInfinity => true,
            LexBound::Inclusive(bound) => member <= bound.as_slice(),
            LexBound::Exclusive(bound) => member < bound.as_slice(),
        };
        above_min && below_max
    }
}
