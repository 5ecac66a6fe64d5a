//! Snapshot producer: a consistent serialized stream of one shard's keyspace, produced
//! concurrently with live mutation.
//!
//! The producer cursor-walks the prime table and serializes every bucket whose version predates
//! snapshot start; a pre-mutation hook side-saves buckets about to change before they do. The
//! output is a sequence of length-tagged records pushed to a consumer in strictly increasing
//! flush order.

mod codec;
mod exec_state;
mod flush_gate;
mod producer;
mod serializer;

pub use codec::{SnapshotRecord, decode_records, value_kind_tag};
pub use exec_state::{ExecutionState, SnapshotError};
pub use flush_gate::FlushGate;
pub use producer::{SliceSnapshot, SnapshotConsumer, SnapshotStats};
pub use serializer::{MIN_BLOB_SIZE, SnapshotSerializer};

#[cfg(test)]
#[path = "tests.rs"]
mod tests;
