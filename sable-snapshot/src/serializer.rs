//! In-memory record accumulator for the snapshot stream.

use sable_common::ids::{DbIndex, Lsn};
use sable_journal::JournalEntry;
use sable_store::{EntryView, Value, ValueKind};

use crate::codec;

/// Accumulated bytes below this threshold are not worth a flush unless forced.
pub const MIN_BLOB_SIZE: usize = 8 * 1024;

/// Appends length-tagged records to an in-memory buffer until the producer cuts a chunk.
///
/// The stream header is emitted into the first chunk only.
#[derive(Debug)]
pub struct SnapshotSerializer {
    buffer: Vec<u8>,
    peak_bytes: usize,
}

impl Default for SnapshotSerializer {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotSerializer {
    /// Creates a serializer with the stream header staged.
    #[must_use]
    pub fn new() -> Self {
        let mut buffer = Vec::new();
        codec::write_stream_header(&mut buffer);
        Self {
            buffer,
            peak_bytes: 0,
        }
    }

    /// Bytes currently staged.
    #[must_use]
    pub fn serialized_len(&self) -> usize {
        self.buffer.len()
    }

    /// Largest staged size observed so far.
    #[must_use]
    pub fn peak_bytes(&self) -> usize {
        self.peak_bytes
    }

    /// Appends one keyspace entry.
    pub fn save_entry(&mut self, entry: &EntryView<'_>) {
        // Cool externals serialize as the value they shadow.
        let value = match entry.value {
            Value::External {
                cool: Some(shadow), ..
            } => shadow.as_ref(),
            other => other,
        };
        codec::write_entry(
            &mut self.buffer,
            entry.db,
            codec::value_kind_tag(value.kind()),
            entry.sticky,
            entry.expire_at_ms,
            entry.mcflag,
            entry.key,
            &codec::encode_value(value),
        );
        self.note_peak();
    }

    /// Appends one entry whose tiered read has resolved.
    pub fn save_resolved_external(
        &mut self,
        db: DbIndex,
        key: &[u8],
        value_bytes: &[u8],
        expire_at_ms: Option<u64>,
        mcflag: Option<u32>,
        sticky: bool,
    ) {
        codec::write_entry(
            &mut self.buffer,
            db,
            codec::value_kind_tag(ValueKind::Str),
            sticky,
            expire_at_ms,
            mcflag,
            key,
            value_bytes,
        );
        self.note_peak();
    }

    /// Appends one journal record in its wire form.
    pub fn write_journal_entry(&mut self, entry: &JournalEntry) {
        codec::write_journal(
            &mut self.buffer,
            entry.db,
            entry.txid,
            &entry.to_command_bytes(),
        );
        self.note_peak();
    }

    /// Appends the marker separating the snapshot from the replication stream.
    pub fn send_full_sync_cut(&mut self) {
        codec::write_full_sync_cut(&mut self.buffer);
        self.note_peak();
    }

    /// Appends the final journal position.
    pub fn send_journal_offset(&mut self, lsn: Lsn) {
        codec::write_journal_offset(&mut self.buffer, lsn);
        self.note_peak();
    }

    /// Cuts the staged bytes into a chunk, leaving the buffer empty.
    #[must_use]
    pub fn take_chunk(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }

    fn note_peak(&mut self) {
        self.peak_bytes = self.peak_bytes.max(self.buffer.len());
    }
}
