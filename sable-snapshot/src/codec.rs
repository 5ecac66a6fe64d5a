//! Length-tagged record codec for the snapshot stream.

use sable_common::error::{OpResult, OpStatus};
use sable_common::ids::{DbIndex, Lsn, TxId};
use sable_store::{Value, ValueKind};

/// Fixed magic marker at the beginning of every snapshot stream.
pub(crate) const STREAM_MAGIC: &[u8; 8] = b"SBLESNAP";
/// Current stream format version.
pub(crate) const STREAM_VERSION: u16 = 1;

const TAG_ENTRY: u8 = 1;
const TAG_JOURNAL: u8 = 2;
const TAG_FULL_SYNC_CUT: u8 = 3;
const TAG_JOURNAL_OFFSET: u8 = 4;

const FLAG_STICKY: u8 = 1 << 0;
const FLAG_HAS_EXPIRE: u8 = 1 << 1;
const FLAG_HAS_MCFLAG: u8 = 1 << 2;

/// Stable one-byte tag for a value kind.
#[must_use]
pub fn value_kind_tag(kind: ValueKind) -> u8 {
    kind.index() as u8
}

/// One decoded record of the snapshot stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotRecord {
    /// One keyspace entry.
    Entry {
        /// Database the entry belongs to.
        db: DbIndex,
        /// Value-kind tag; see [`value_kind_tag`].
        kind: u8,
        /// Eviction exemption bit.
        sticky: bool,
        /// Absolute deadline, when present.
        expire_at_ms: Option<u64>,
        /// Auxiliary tag, when present.
        mcflag: Option<u32>,
        /// Key bytes.
        key: Vec<u8>,
        /// Serialized value payload.
        value: Vec<u8>,
    },
    /// One replayed or streamed journal record in its wire form.
    Journal {
        /// Database of the mutation.
        db: DbIndex,
        /// Transaction id of the mutation.
        txid: TxId,
        /// Textual wire form of the mutation.
        payload: Vec<u8>,
    },
    /// Marker separating the snapshot phase from the continuous replication phase.
    FullSyncCut,
    /// Final journal position emitted at stream teardown.
    JournalOffset(Lsn),
}

pub(crate) fn write_stream_header(out: &mut Vec<u8>) {
    out.extend_from_slice(STREAM_MAGIC);
    out.extend_from_slice(&STREAM_VERSION.to_le_bytes());
}

pub(crate) fn write_entry(
    out: &mut Vec<u8>,
    db: DbIndex,
    kind: u8,
    sticky: bool,
    expire_at_ms: Option<u64>,
    mcflag: Option<u32>,
    key: &[u8],
    value: &[u8],
) {
    out.push(TAG_ENTRY);
    out.extend_from_slice(&db.to_le_bytes());
    out.push(kind);
    let mut flags = 0_u8;
    if sticky {
        flags |= FLAG_STICKY;
    }
    if expire_at_ms.is_some() {
        flags |= FLAG_HAS_EXPIRE;
    }
    if mcflag.is_some() {
        flags |= FLAG_HAS_MCFLAG;
    }
    out.push(flags);
    if let Some(deadline) = expire_at_ms {
        out.extend_from_slice(&deadline.to_le_bytes());
    }
    if let Some(flag) = mcflag {
        out.extend_from_slice(&flag.to_le_bytes());
    }
    write_bytes(out, key);
    write_bytes(out, value);
}

pub(crate) fn write_journal(out: &mut Vec<u8>, db: DbIndex, txid: TxId, payload: &[u8]) {
    out.push(TAG_JOURNAL);
    out.extend_from_slice(&db.to_le_bytes());
    out.extend_from_slice(&txid.to_le_bytes());
    write_bytes(out, payload);
}

pub(crate) fn write_full_sync_cut(out: &mut Vec<u8>) {
    out.push(TAG_FULL_SYNC_CUT);
}

pub(crate) fn write_journal_offset(out: &mut Vec<u8>, lsn: Lsn) {
    out.push(TAG_JOURNAL_OFFSET);
    out.extend_from_slice(&lsn.to_le_bytes());
}

/// Serializes a value into its record payload.
#[must_use]
pub(crate) fn encode_value(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    match value {
        Value::Str(bytes) | Value::Json(bytes) => out.extend_from_slice(bytes),
        Value::List(items) => {
            write_u32(&mut out, items.len() as u32);
            for item in items {
                write_bytes(&mut out, item);
            }
        }
        Value::Set(members) => {
            let mut sorted: Vec<&Vec<u8>> = members.iter().collect();
            sorted.sort();
            write_u32(&mut out, sorted.len() as u32);
            for member in sorted {
                write_bytes(&mut out, member);
            }
        }
        Value::Hash(fields) => {
            let mut sorted: Vec<(&Vec<u8>, &Vec<u8>)> = fields.iter().collect();
            sorted.sort_by(|left, right| left.0.cmp(right.0));
            write_u32(&mut out, sorted.len() as u32);
            for (field, field_value) in sorted {
                write_bytes(&mut out, field);
                write_bytes(&mut out, field_value);
            }
        }
        Value::ZSet(zset) => {
            let members = zset.range_by_rank(0, usize::MAX, false);
            write_u32(&mut out, members.len() as u32);
            for (member, score) in members {
                write_bytes(&mut out, &member);
                out.extend_from_slice(&score.to_le_bytes());
            }
        }
        Value::Stream(entries) => {
            write_u32(&mut out, entries.len() as u32);
            for entry in entries {
                out.extend_from_slice(&entry.id.0.to_le_bytes());
                out.extend_from_slice(&entry.id.1.to_le_bytes());
                write_u32(&mut out, entry.fields.len() as u32);
                for (field, field_value) in &entry.fields {
                    write_bytes(&mut out, field);
                    write_bytes(&mut out, field_value);
                }
            }
        }
        Value::External { descriptor, cool } => {
            // Cool shadows are serialized upstream; reaching here means a tiered placeholder.
            debug_assert!(cool.is_none());
            out.extend_from_slice(&descriptor.offset.to_le_bytes());
            out.extend_from_slice(&descriptor.len.to_le_bytes());
        }
    }
    out
}

fn write_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn write_bytes(out: &mut Vec<u8>, payload: &[u8]) {
    write_u32(out, payload.len() as u32);
    out.extend_from_slice(payload);
}

struct StreamCursor<'a> {
    payload: &'a [u8],
    at: usize,
}

impl<'a> StreamCursor<'a> {
    fn read_slice(&mut self, len: usize) -> OpResult<&'a [u8]> {
        let end = self.at.checked_add(len).ok_or(OpStatus::InvalidValue)?;
        if end > self.payload.len() {
            return Err(OpStatus::InvalidValue);
        }
        let slice = &self.payload[self.at..end];
        self.at = end;
        Ok(slice)
    }

    fn read_u8(&mut self) -> OpResult<u8> {
        Ok(self.read_slice(1)?[0])
    }

    fn read_u16(&mut self) -> OpResult<u16> {
        let bytes = self.read_slice(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn read_u32(&mut self) -> OpResult<u32> {
        let bytes = self.read_slice(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_u64(&mut self) -> OpResult<u64> {
        let bytes = self.read_slice(8)?;
        let mut raw = [0_u8; 8];
        raw.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(raw))
    }

    fn read_bytes(&mut self) -> OpResult<Vec<u8>> {
        let len = self.read_u32()? as usize;
        Ok(self.read_slice(len)?.to_vec())
    }

    fn is_done(&self) -> bool {
        self.at == self.payload.len()
    }
}

/// Decodes a concatenated snapshot stream back into records.
///
/// # Errors
///
/// Returns `OpStatus::InvalidValue` for a bad magic, an unsupported version, or a truncated
/// record.
pub fn decode_records(payload: &[u8]) -> OpResult<Vec<SnapshotRecord>> {
    let mut cursor = StreamCursor { payload, at: 0 };
    if cursor.read_slice(STREAM_MAGIC.len())? != STREAM_MAGIC {
        return Err(OpStatus::InvalidValue);
    }
    if cursor.read_u16()? != STREAM_VERSION {
        return Err(OpStatus::InvalidValue);
    }

    let mut records = Vec::new();
    while !cursor.is_done() {
        let tag = cursor.read_u8()?;
        match tag {
            TAG_ENTRY => {
                let db = cursor.read_u16()?;
                let kind = cursor.read_u8()?;
                let flags = cursor.read_u8()?;
                let expire_at_ms = if flags & FLAG_HAS_EXPIRE != 0 {
                    Some(cursor.read_u64()?)
                } else {
                    None
                };
                let mcflag = if flags & FLAG_HAS_MCFLAG != 0 {
                    Some(cursor.read_u32()?)
                } else {
                    None
                };
                let key = cursor.read_bytes()?;
                let value = cursor.read_bytes()?;
                records.push(SnapshotRecord::Entry {
                    db,
                    kind,
                    sticky: flags & FLAG_STICKY != 0,
                    expire_at_ms,
                    mcflag,
                    key,
                    value,
                });
            }
            TAG_JOURNAL => {
                let db = cursor.read_u16()?;
                let txid = cursor.read_u64()?;
                let payload = cursor.read_bytes()?;
                records.push(SnapshotRecord::Journal { db, txid, payload });
            }
            TAG_FULL_SYNC_CUT => records.push(SnapshotRecord::FullSyncCut),
            TAG_JOURNAL_OFFSET => {
                records.push(SnapshotRecord::JournalOffset(cursor.read_u64()?));
            }
            _ => return Err(OpStatus::InvalidValue),
        }
    }
    Ok(records)
}
