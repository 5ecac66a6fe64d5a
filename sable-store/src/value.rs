//! Tagged value union over the supported kinds.

use std::collections::VecDeque;
use std::mem;

use sable_common::containers::{HotMap, HotSet};
use sable_tiering::ExternalDescriptor;
use sable_zset::ZSetValue;

/// One entry of a stream value.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEntry {
    /// Entry id as `(ms, seq)`.
    pub id: (u64, u64),
    /// Field/value payload.
    pub fields: Vec<(Vec<u8>, Vec<u8>)>,
}

/// Value kind tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    /// Byte string.
    Str,
    /// List of byte strings.
    List,
    /// Unordered set.
    Set,
    /// Field/value hash.
    Hash,
    /// Sorted set.
    ZSet,
    /// Append-only stream.
    Stream,
    /// Raw JSON document.
    Json,
    /// Descriptor into tiered storage.
    External,
}

impl ValueKind {
    /// Stable index used by per-kind memory accounting.
    #[must_use]
    pub fn index(self) -> usize {
        match self {
            Self::Str => 0,
            Self::List => 1,
            Self::Set => 2,
            Self::Hash => 3,
            Self::ZSet => 4,
            Self::Stream => 5,
            Self::Json => 6,
            Self::External => 7,
        }
    }

    /// Number of distinct kinds.
    pub const COUNT: usize = 8;
}

/// Tagged union over the supported value kinds. Each variant reports its own allocation size.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Byte string.
    Str(Vec<u8>),
    /// List of byte strings.
    List(VecDeque<Vec<u8>>),
    /// Unordered set of byte strings.
    Set(HotSet<Vec<u8>>),
    /// Field/value hash.
    Hash(HotMap<Vec<u8>, Vec<u8>>),
    /// Sorted set.
    ZSet(ZSetValue),
    /// Append-only stream.
    Stream(Vec<StreamEntry>),
    /// Raw JSON document bytes; the core does not interpret them.
    Json(Vec<u8>),
    /// Value offloaded to tiered storage, optionally shadowed in memory while cool.
    External {
        /// Backend location of the serialized value.
        descriptor: ExternalDescriptor,
        /// In-memory shadow retained while the entry is cool.
        cool: Option<Box<Value>>,
    },
}

impl Default for Value {
    fn default() -> Self {
        Self::empty()
    }
}

impl Value {
    /// The empty placeholder installed by add-or-find before the caller writes a real value.
    #[must_use]
    pub fn empty() -> Self {
        Self::Str(Vec::new())
    }

    /// Kind tag of this value.
    #[must_use]
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Str(_) => ValueKind::Str,
            Self::List(_) => ValueKind::List,
            Self::Set(_) => ValueKind::Set,
            Self::Hash(_) => ValueKind::Hash,
            Self::ZSet(_) => ValueKind::ZSet,
            Self::Stream(_) => ValueKind::Stream,
            Self::Json(_) => ValueKind::Json,
            Self::External { .. } => ValueKind::External,
        }
    }

    /// Kind used for type checks: tiered values keep the kind of what they hold, which is
    /// always a string in the current offloading model.
    #[must_use]
    pub fn logical_kind(&self) -> ValueKind {
        match self {
            Self::External { cool: Some(shadow), .. } => shadow.logical_kind(),
            Self::External { cool: None, .. } => ValueKind::Str,
            other => other.kind(),
        }
    }

    /// Whether the value lives in tiered storage.
    #[must_use]
    pub fn is_external(&self) -> bool {
        matches!(self, Self::External { .. })
    }

    /// Whether the value is tiered but still shadowed in memory.
    #[must_use]
    pub fn is_cool(&self) -> bool {
        matches!(self, Self::External { cool: Some(_), .. })
    }

    /// Backend descriptor for tiered values.
    #[must_use]
    pub fn external_descriptor(&self) -> Option<ExternalDescriptor> {
        match self {
            Self::External { descriptor, .. } => Some(*descriptor),
            _ => None,
        }
    }

    /// Estimated heap bytes owned by this value.
    #[must_use]
    pub fn malloc_used(&self) -> usize {
        const ELEM_OVERHEAD: usize = 16;
        match self {
            Self::Str(bytes) | Self::Json(bytes) => bytes.len(),
            Self::List(items) => items.iter().map(|item| item.len() + ELEM_OVERHEAD).sum(),
            Self::Set(members) => members
                .iter()
                .map(|member| member.len() + ELEM_OVERHEAD)
                .sum(),
            Self::Hash(fields) => fields
                .iter()
                .map(|(field, value)| field.len() + value.len() + 2 * ELEM_OVERHEAD)
                .sum(),
            Self::ZSet(zset) => zset.malloc_size(),
            Self::Stream(entries) => entries
                .iter()
                .map(|entry| {
                    mem::size_of::<StreamEntry>()
                        + entry
                            .fields
                            .iter()
                            .map(|(field, value)| field.len() + value.len())
                            .sum::<usize>()
                })
                .sum(),
            Self::External { cool, .. } => {
                cool.as_deref().map_or(0, Value::malloc_used)
            }
        }
    }

    /// Whether the value owns heap allocations at all.
    #[must_use]
    pub fn has_allocated(&self) -> bool {
        self.malloc_used() > 0
    }
}

#[cfg(test)]
mod tests {
    use super::{Value, ValueKind};
    use googletest::prelude::*;
    use rstest::rstest;
    use sable_tiering::ExternalDescriptor;

    #[rstest]
    fn empty_value_is_an_empty_string() {
        let value = Value::empty();
        assert_that!(value.kind(), eq(ValueKind::Str));
        assert_that!(value.malloc_used(), eq(0));
        assert_that!(value.has_allocated(), eq(false));
    }

    #[rstest]
    fn cool_externals_keep_their_shadow_kind() {
        let descriptor = ExternalDescriptor { offset: 0, len: 3 };
        let value = Value::External {
            descriptor,
            cool: Some(Box::new(Value::Str(b"abc".to_vec()))),
        };
        assert_that!(value.kind(), eq(ValueKind::External));
        assert_that!(value.logical_kind(), eq(ValueKind::Str));
        assert_that!(value.is_cool(), eq(true));
        assert_that!(value.malloc_used(), eq(3));
    }

    #[rstest]
    fn heap_estimates_scale_with_payload() {
        let small = Value::Str(b"a".to_vec());
        let large = Value::Str(vec![b'a'; 4096]);
        assert_that!(large.malloc_used() > small.malloc_used(), eq(true));
    }
}
