use std::cell::RefCell;
use std::rc::Rc;

use googletest::prelude::*;
use hashbrown::HashMap;
use rstest::rstest;

use sable_common::config::StoreConfig;
use sable_common::ids::ShardCount;
use sable_journal::{JournalEntry, JournalOp, ShardJournal};
use sable_store::{DbContext, DbSlice, Value};
use sable_tiering::{InMemoryTieredStorage, TieredStorage};

use crate::exec_state::{ExecutionState, SnapshotError};
use crate::producer::{SliceSnapshot, SnapshotConsumer};
use crate::codec::{SnapshotRecord, decode_records};

#[derive(Default)]
struct VecConsumer {
    chunks: Vec<Vec<u8>>,
    finalized: Option<bool>,
}

impl SnapshotConsumer for VecConsumer {
    fn consume(&mut self, chunk: Vec<u8>) {
        self.chunks.push(chunk);
    }

    fn finalize(&mut self, cancelled: bool) {
        self.finalized = Some(cancelled);
    }
}

fn records_of(consumer: &VecConsumer) -> Vec<SnapshotRecord> {
    let mut stream = Vec::new();
    for chunk in &consumer.chunks {
        stream.extend_from_slice(chunk);
    }
    decode_records(&stream).expect("produced stream must decode")
}

fn new_slice() -> DbSlice {
    let config = StoreConfig {
        shard_count: ShardCount::new(1).expect("literal is valid"),
        ..StoreConfig::default()
    };
    DbSlice::new(0, &config)
}

fn ctx(now_ms: u64) -> DbContext {
    DbContext {
        db: 0,
        time_now_ms: now_ms,
    }
}

fn set_str(slice: &mut DbSlice, key: &[u8], value: &[u8], expire_at_ms: u64) {
    let result = slice
        .add_or_update(&ctx(1000), key, Value::Str(value.to_vec()), expire_at_ms)
        .expect("write must succeed");
    result.updater.run(slice);
}

fn entry_values(records: &[SnapshotRecord]) -> HashMap<Vec<u8>, Vec<u8>> {
    let mut out = HashMap::new();
    for record in records {
        if let SnapshotRecord::Entry { key, value, .. } = record {
            let duplicate = out.insert(key.clone(), value.clone());
            assert_that!(duplicate, eq(&None));
        }
    }
    out
}

fn snapshot_pair() -> (Rc<RefCell<VecConsumer>>, SliceSnapshot, ExecutionState) {
    let consumer = Rc::new(RefCell::new(VecConsumer::default()));
    let dyn_consumer: Rc<RefCell<dyn SnapshotConsumer>> = consumer.clone();
    let exec = ExecutionState::new();
    let snapshot = SliceSnapshot::new(dyn_consumer, exec.clone());
    (consumer, snapshot, exec)
}

#[rstest]
fn full_snapshot_captures_every_entry_exactly_once() {
    let mut slice = new_slice();
    for index in 0..1000 {
        let key = format!("k{index}");
        set_str(&mut slice, key.as_bytes(), b"v", 0);
    }

    let (consumer, mut snapshot, _exec) = snapshot_pair();
    snapshot.start(&slice, false, true);
    snapshot.run_to_completion(&slice);

    let consumer = consumer.borrow();
    assert_that!(consumer.finalized, eq(Some(false)));
    let values = entry_values(&records_of(&consumer));
    assert_that!(values.len(), eq(1000));
    for index in 0..1000 {
        let key = format!("k{index}").into_bytes();
        assert_that!(values.get(&key), eq(Some(&b"v".to_vec())));
    }
}

#[rstest]
fn concurrent_overwrites_are_side_saved_with_pre_mutation_values() {
    let mut slice = new_slice();
    for index in 0..1000 {
        let key = format!("k{index}");
        set_str(&mut slice, key.as_bytes(), b"orig", 0);
    }

    let (consumer, mut snapshot, _exec) = snapshot_pair();
    snapshot.start(&slice, false, true);

    // Interleave: a few traversal passes, then overwrites racing the traversal.
    for _ in 0..10 {
        let _ = snapshot.run_pass(&slice);
    }
    for index in 0..100 {
        let key = format!("k{index}");
        set_str(&mut slice, key.as_bytes(), b"new", 0);
    }
    snapshot.run_to_completion(&slice);

    let stats = snapshot.stats();
    let consumer = consumer.borrow();
    let values = entry_values(&records_of(&consumer));
    assert_that!(values.len(), eq(1000));
    // Every record carries the value from snapshot start, side-saved where the overwrite won
    // the race to the bucket.
    for index in 0..1000 {
        let key = format!("k{index}").into_bytes();
        assert_that!(values.get(&key), eq(Some(&b"orig".to_vec())));
    }
    assert_that!(
        stats.loop_serialized + stats.side_saved >= 1000,
        eq(true)
    );
}

#[rstest]
fn entries_carry_expire_and_mcflag_metadata() {
    let mut slice = new_slice();
    set_str(&mut slice, b"plain", b"v", 0);
    set_str(&mut slice, b"deadlined", b"v", 90_000);
    set_str(&mut slice, b"tagged", b"v", 0);
    assert_that!(slice.set_mcflag(0, b"tagged", 42), eq(true));

    let (consumer, mut snapshot, _exec) = snapshot_pair();
    snapshot.start(&slice, false, true);
    snapshot.run_to_completion(&slice);

    let consumer = consumer.borrow();
    let records = records_of(&consumer);
    let mut by_key = HashMap::new();
    for record in &records {
        if let SnapshotRecord::Entry {
            key,
            expire_at_ms,
            mcflag,
            ..
        } = record
        {
            let _ = by_key.insert(key.clone(), (*expire_at_ms, *mcflag));
        }
    }
    assert_that!(by_key.get(b"plain".as_slice()), eq(Some(&(None, None))));
    assert_that!(
        by_key.get(b"deadlined".as_slice()),
        eq(Some(&(Some(90_000), None)))
    );
    assert_that!(
        by_key.get(b"tagged".as_slice()),
        eq(Some(&(None, Some(42))))
    );
}

#[rstest]
fn streaming_snapshot_emits_cut_then_journal_tail() {
    let mut slice = new_slice();
    let journal = Rc::new(ShardJournal::new());
    slice.set_journal(Rc::clone(&journal));
    for index in 0..200 {
        let key = format!("k{index}");
        set_str(&mut slice, key.as_bytes(), b"v", 0);
    }

    let (consumer, mut snapshot, _exec) = snapshot_pair();
    snapshot.start(&slice, true, true);
    snapshot.run_to_completion(&slice);

    // Writes after the traversal reach the stream through the journal hook.
    let _ = journal.append(JournalEntry {
        txid: 7,
        db: 0,
        op: JournalOp::Set {
            key: b"post".to_vec(),
            value: b"v".to_vec(),
            expire_at_ms: None,
            keep_ttl: false,
            sticky: false,
            mcflags: None,
        },
    });
    let final_lsn = journal.current_lsn();
    snapshot.finalize_journal_stream(false);

    let consumer = consumer.borrow();
    let records = records_of(&consumer);
    let cut_at = records
        .iter()
        .position(|record| *record == SnapshotRecord::FullSyncCut)
        .expect("stream must carry the full-sync cut");
    let journal_at = records
        .iter()
        .position(|record| matches!(record, SnapshotRecord::Journal { txid: 7, .. }))
        .expect("streamed journal record must be present");
    assert_that!(cut_at < journal_at, eq(true));
    assert_that!(
        records.last(),
        eq(Some(&SnapshotRecord::JournalOffset(final_lsn)))
    );
}

#[rstest]
fn incremental_snapshot_replays_the_journal_suffix() {
    let mut slice = new_slice();
    let journal = Rc::new(ShardJournal::new());
    slice.set_journal(Rc::clone(&journal));
    for index in 0..5 {
        let key = format!("k{index}").into_bytes();
        let _ = journal.append(JournalEntry {
            txid: index,
            db: 0,
            op: JournalOp::Del { key },
        });
    }

    let (consumer, mut snapshot, exec) = snapshot_pair();
    snapshot.start_incremental(&slice, 3);
    assert_that!(exec.error(), eq(&None));

    let consumer_ref = consumer.borrow();
    let records = records_of(&consumer_ref);
    let journal_records = records
        .iter()
        .filter(|record| matches!(record, SnapshotRecord::Journal { .. }))
        .count();
    // LSNs 3, 4 and 5 remain ahead of the requested position.
    assert_that!(journal_records, eq(3));
    assert_that!(
        records.last(),
        eq(Some(&SnapshotRecord::FullSyncCut))
    );
}

#[rstest]
fn incremental_snapshot_from_a_dropped_lsn_reports_an_error() {
    let mut slice = new_slice();
    let journal = Rc::new(ShardJournal::new());
    slice.set_journal(Rc::clone(&journal));
    for index in 0..5 {
        let _ = journal.append(JournalEntry {
            txid: index,
            db: 0,
            op: JournalOp::Del {
                key: format!("k{index}").into_bytes(),
            },
        });
    }

    let (_consumer, mut snapshot, exec) = snapshot_pair();
    // LSN 100 is in the future; nothing can be replayed from there.
    snapshot.start_incremental(&slice, 100);
    assert_that!(
        matches!(exec.error(), Some(SnapshotError::PartialSyncDropped { .. })),
        eq(true)
    );
}

#[rstest]
fn delayed_tiered_reads_resolve_into_the_stream() {
    let backend = Rc::new(InMemoryTieredStorage::new());
    let mut slice = new_slice();
    let tiered: Rc<dyn TieredStorage> = backend.clone();
    slice.set_tiered(tiered);

    // A fully offloaded entry: no in-memory shadow, so the snapshot must go through the
    // tiered read.
    set_str(&mut slice, b"cold", b"x", 0);
    let descriptor = backend
        .try_stash(0, b"cold", b"offloaded-payload")
        .expect("stub accepts every stash");
    let found = slice
        .find_mutable(&ctx(1000), b"cold")
        .expect("key must exist");
    let pos = found.it;
    if let Some(value) = slice.value_at_mut(0, pos) {
        *value = Value::External {
            descriptor,
            cool: None,
        };
    }
    found.updater.run(&mut slice);

    let (consumer, mut snapshot, _exec) = snapshot_pair();
    snapshot.start(&slice, false, true);
    snapshot.run_to_completion(&slice);

    let consumer = consumer.borrow();
    let values = entry_values(&records_of(&consumer));
    assert_that!(
        values.get(b"cold".as_slice()),
        eq(Some(&b"offloaded-payload".to_vec()))
    );
}

#[rstest]
fn cancelled_snapshot_finalizes_with_the_cancel_flag() {
    let mut slice = new_slice();
    for index in 0..500 {
        let key = format!("k{index}");
        set_str(&mut slice, key.as_bytes(), b"v", 0);
    }

    let (consumer, mut snapshot, exec) = snapshot_pair();
    snapshot.start(&slice, false, true);
    let _ = snapshot.run_pass(&slice);
    exec.cancel();
    snapshot.run_to_completion(&slice);

    assert_that!(consumer.borrow().finalized, eq(Some(true)));
    assert_that!(slice.change_callback_count(), eq(0));
}

#[rstest]
fn two_in_flight_snapshots_each_see_every_key_once() {
    let mut slice = new_slice();
    for index in 0..600 {
        let key = format!("k{index}");
        set_str(&mut slice, key.as_bytes(), b"v", 0);
    }

    let (first_consumer, mut first, _exec_a) = snapshot_pair();
    first.start(&slice, false, true);
    for _ in 0..20 {
        let _ = first.run_pass(&slice);
    }

    let (second_consumer, mut second, _exec_b) = snapshot_pair();
    second.start(&slice, false, true);

    // Mutations now race both snapshots; the earlier one has priority on shared buckets.
    for index in 0..50 {
        let key = format!("k{index}");
        set_str(&mut slice, key.as_bytes(), b"overwritten", 0);
    }

    let mut first_done = false;
    let mut second_done = false;
    while !(first_done && second_done) {
        if !first_done {
            first_done = first.run_pass(&slice);
        }
        if !second_done {
            second_done = second.run_pass(&slice);
        }
    }
    first.finish(&slice);
    second.finish(&slice);

    let first_values = entry_values(&records_of(&first_consumer.borrow()));
    let second_values = entry_values(&records_of(&second_consumer.borrow()));
    assert_that!(first_values.len(), eq(600));
    assert_that!(second_values.len(), eq(600));
    // The older snapshot predates every overwrite, so it must hold original values only.
    for index in 0..50 {
        let key = format!("k{index}").into_bytes();
        assert_that!(first_values.get(&key), eq(Some(&b"v".to_vec())));
    }
}
