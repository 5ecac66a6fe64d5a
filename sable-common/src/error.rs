//! Shared error model for cross-crate APIs.

use thiserror::Error;

/// Unified result type used by core storage operations.
pub type OpResult<T> = Result<T, OpStatus>;

/// Status codes surfaced by core storage operations.
///
/// These are deliberately flat: a storage operation either succeeds or reports one of these
/// conditions, and the caller decides how to phrase it for its own surface.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum OpStatus {
    /// Key is absent from the prime table (or lazily expired on access).
    #[error("key not found")]
    KeyNotFound,

    /// Entry exists but holds a different value kind than the operation requires.
    #[error("wrong value type for this operation")]
    WrongType,

    /// Insertion was rejected after eviction and garbage collection failed to free space.
    #[error("out of memory")]
    OutOfMemory,

    /// Numeric argument is outside the accepted domain (for example an expire deadline).
    #[error("value is out of range")]
    OutOfRange,

    /// Payload could not be parsed as an integer.
    #[error("value is not an integer")]
    InvalidInt,

    /// Payload could not be parsed as a float, or the float is not usable (NaN score).
    #[error("value is not a valid float")]
    InvalidFloat,

    /// Payload is structurally invalid for the target value kind.
    #[error("invalid value payload")]
    InvalidValue,

    /// Conditional operation (NX/XX/GT/LT) observed a state that makes it a no-op.
    #[error("conditional operation was skipped")]
    Skipped,

    /// Target resource is held by an exclusive transaction lock.
    #[error("resource is locked")]
    Busy,
}

#[cfg(test)]
mod tests {
    use super::OpStatus;
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case(OpStatus::KeyNotFound, "key not found")]
    #[case(OpStatus::OutOfMemory, "out of memory")]
    #[case(OpStatus::Skipped, "conditional operation was skipped")]
    fn statuses_render_stable_messages(#[case] status: OpStatus, #[case] expected: &str) {
        assert_that!(status.to_string(), eq(expected));
    }
}
