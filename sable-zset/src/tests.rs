use googletest::prelude::*;
use rstest::rstest;
use sable_common::error::OpStatus;

use crate::{
    AddOptions, AddOutcome, LexBound, LexRange, PACKED_MAX_ENTRIES, ScoreRange, SortedMap,
    ZSetValue,
};

fn map_with(members: &[(&str, f64)]) -> SortedMap {
    let mut map = SortedMap::new();
    for (member, score) in members {
        let inserted = map
            .insert_new(*score, member.as_bytes())
            .expect("finite score must insert");
        assert_that!(inserted, eq(true));
    }
    map
}

#[rstest]
fn insert_new_refuses_duplicates_without_score_update() {
    let mut map = map_with(&[("a", 1.0)]);
    let inserted = map.insert_new(9.0, b"a").expect("finite score");
    assert_that!(inserted, eq(false));
    assert_that!(map.get_score(b"a"), eq(Some(1.0)));
}

#[rstest]
fn nan_scores_are_rejected() {
    let mut map = SortedMap::new();
    assert_that!(
        map.insert_new(f64::NAN, b"a"),
        eq(Err(OpStatus::InvalidFloat))
    );
    assert_that!(
        map.add(f64::NAN, b"a", AddOptions::default()),
        eq(Err(OpStatus::InvalidFloat))
    );
}

#[rstest]
fn incr_to_nan_is_rejected_and_leaves_score_intact() {
    let mut map = map_with(&[("a", f64::INFINITY)]);
    let options = AddOptions {
        incr: true,
        ..AddOptions::default()
    };
    assert_that!(
        map.add(f64::NEG_INFINITY, b"a", options),
        eq(Err(OpStatus::InvalidFloat))
    );
    assert_that!(map.get_score(b"a"), eq(Some(f64::INFINITY)));
}

#[rstest]
fn nx_adds_only_new_members() {
    let mut map = map_with(&[("a", 1.0)]);
    let options = AddOptions {
        nx: true,
        ..AddOptions::default()
    };
    let existing = map.add(5.0, b"a", options).expect("finite score");
    assert_that!(existing.outcome, eq(AddOutcome::Skipped));
    assert_that!(map.get_score(b"a"), eq(Some(1.0)));

    let fresh = map.add(5.0, b"b", options).expect("finite score");
    assert_that!(fresh.outcome, eq(AddOutcome::Added));
    assert_that!(map.get_score(b"b"), eq(Some(5.0)));
}

#[rstest]
fn xx_updates_only_existing_members() {
    let mut map = map_with(&[("a", 1.0)]);
    let options = AddOptions {
        xx: true,
        ..AddOptions::default()
    };
    let missing = map.add(5.0, b"b", options).expect("finite score");
    assert_that!(missing.outcome, eq(AddOutcome::Skipped));
    assert_that!(map.get_score(b"b"), eq(None));

    let existing = map.add(5.0, b"a", options).expect("finite score");
    assert_that!(existing.outcome, eq(AddOutcome::Updated));
    assert_that!(map.get_score(b"a"), eq(Some(5.0)));
}

#[rstest]
#[case(true, false, 3.0, 5.0, Some(5.0))]
#[case(true, false, 3.0, 2.0, Some(3.0))]
#[case(false, true, 3.0, 2.0, Some(2.0))]
#[case(false, true, 3.0, 5.0, Some(3.0))]
fn gt_lt_gate_score_updates(
    #[case] gt: bool,
    #[case] lt: bool,
    #[case] initial: f64,
    #[case] update: f64,
    #[case] expected: Option<f64>,
) {
    let mut map = map_with(&[("a", initial)]);
    let options = AddOptions {
        gt,
        lt,
        ..AddOptions::default()
    };
    let _ = map.add(update, b"a", options).expect("finite score");
    assert_that!(map.get_score(b"a"), eq(expected));
}

#[rstest]
fn incr_accumulates_scores() {
    let mut map = map_with(&[("a", 10.0)]);
    let options = AddOptions {
        incr: true,
        ..AddOptions::default()
    };
    let result = map.add(2.5, b"a", options).expect("finite score");
    assert_that!(result.score, eq(Some(12.5)));
    assert_that!(map.get_score(b"a"), eq(Some(12.5)));
}

#[rstest]
fn ranks_follow_score_then_member_order() {
    let map = map_with(&[("c", 2.0), ("a", 1.0), ("b", 2.0), ("d", 3.0)]);
    assert_that!(map.get_rank(b"a", false), eq(Some(0)));
    assert_that!(map.get_rank(b"b", false), eq(Some(1)));
    assert_that!(map.get_rank(b"c", false), eq(Some(2)));
    assert_that!(map.get_rank(b"d", false), eq(Some(3)));
    assert_that!(map.get_rank(b"a", true), eq(Some(3)));
    assert_that!(map.get_rank(b"d", true), eq(Some(0)));
    assert_that!(map.get_rank(b"missing", false), eq(None));
}

#[rstest]
fn range_by_score_honors_exclusive_bounds() {
    let map = map_with(&[("a", 1.0), ("b", 2.0), ("c", 3.0), ("d", 4.0)]);
    let range = ScoreRange::new(1.0, 3.0, true, false).expect("finite bounds");
    let members = map.range_by_score(&range, 0, usize::MAX, false);
    let names: Vec<&[u8]> = members.iter().map(|(m, _)| m.as_slice()).collect();
    assert_that!(names, eq(&vec![b"b".as_slice(), b"c".as_slice()]));
    assert_that!(map.count_in_range(&range), eq(2));
}

#[rstest]
fn range_by_score_paginates_in_reverse() {
    let map = map_with(&[("a", 1.0), ("b", 2.0), ("c", 3.0), ("d", 4.0)]);
    let members = map.range_by_score(&ScoreRange::all(), 1, 2, true);
    let names: Vec<&[u8]> = members.iter().map(|(m, _)| m.as_slice()).collect();
    assert_that!(names, eq(&vec![b"c".as_slice(), b"b".as_slice()]));
}

#[rstest]
fn lex_ranges_filter_members_sharing_a_score() {
    let map = map_with(&[("apple", 0.0), ("banana", 0.0), ("cherry", 0.0)]);
    let range = LexRange {
        min: LexBound::Exclusive(b"apple".to_vec()),
        max: LexBound::PosInfinity,
    };
    let members = map.range_by_lex(&range, 0, usize::MAX, false);
    let names: Vec<&[u8]> = members.iter().map(|(m, _)| m.as_slice()).collect();
    assert_that!(names, eq(&vec![b"banana".as_slice(), b"cherry".as_slice()]));
    assert_that!(map.lex_count(&range), eq(2));
}

#[rstest]
fn pop_top_removes_from_the_requested_end() {
    let mut map = map_with(&[("a", 1.0), ("b", 2.0), ("c", 3.0)]);
    let popped = map.pop_top(2, true);
    let names: Vec<&[u8]> = popped.iter().map(|(m, _)| m.as_slice()).collect();
    assert_that!(names, eq(&vec![b"c".as_slice(), b"b".as_slice()]));
    assert_that!(map.len(), eq(1));
    assert_that!(map.get_score(b"a"), eq(Some(1.0)));
}

#[rstest]
fn delete_ranges_remove_expected_members() {
    let mut map = map_with(&[("a", 1.0), ("b", 2.0), ("c", 3.0), ("d", 4.0)]);
    assert_that!(map.delete_range_by_rank(1, 2), eq(2));
    assert_that!(map.len(), eq(2));
    assert_that!(map.get_score(b"b"), eq(None));
    assert_that!(map.get_score(b"c"), eq(None));

    let range = ScoreRange::new(4.0, 4.0, false, false).expect("finite bounds");
    assert_that!(map.delete_range_by_score(&range), eq(1));
    assert_that!(map.len(), eq(1));
}

#[rstest]
fn scan_covers_every_member_exactly_once() {
    let mut map = SortedMap::new();
    for index in 0..57 {
        let member = format!("m{index:03}");
        let _ = map.insert_new(index as f64, member.as_bytes());
    }
    let mut seen = Vec::new();
    let mut cursor = 0;
    loop {
        cursor = map.scan(cursor, |member, _| seen.push(member.to_vec()));
        if cursor == 0 {
            break;
        }
    }
    assert_that!(seen.len(), eq(57));
    seen.sort();
    seen.dedup();
    assert_that!(seen.len(), eq(57));
}

#[rstest]
fn packed_sets_promote_past_the_entry_threshold() {
    let mut value = ZSetValue::new();
    assert_that!(value.is_packed(), eq(true));
    for index in 0..PACKED_MAX_ENTRIES + 1 {
        let member = format!("member-{index:04}");
        let _ = value
            .add(index as f64, member.as_bytes(), AddOptions::default())
            .expect("finite score");
    }
    assert_that!(value.is_packed(), eq(false));
    assert_that!(value.len(), eq(PACKED_MAX_ENTRIES + 1));
}

#[rstest]
fn packed_sets_promote_on_oversized_members() {
    let mut value = ZSetValue::new();
    let long_member = vec![b'x'; 200];
    let _ = value
        .add(1.0, &long_member, AddOptions::default())
        .expect("finite score");
    assert_that!(value.is_packed(), eq(false));
}

#[rstest]
fn representations_agree_on_semantics() {
    let mut packed = ZSetValue::new();
    let mut reference = SortedMap::new();
    let input = [
        ("delta", 4.0),
        ("alpha", 1.0),
        ("bravo", 2.0),
        ("charlie", 2.0),
    ];
    for (member, score) in input {
        let _ = packed
            .add(score, member.as_bytes(), AddOptions::default())
            .expect("finite score");
        let _ = reference.insert_new(score, member.as_bytes());
    }
    assert_that!(packed.is_packed(), eq(true));

    for (member, _) in input {
        assert_that!(
            packed.get_rank(member.as_bytes(), false),
            eq(reference.get_rank(member.as_bytes(), false))
        );
        assert_that!(
            packed.get_score(member.as_bytes()),
            eq(reference.get_score(member.as_bytes()))
        );
    }
    assert_that!(
        packed.range_by_rank(0, 10, false),
        eq(&reference.range_by_rank(0, 10, false))
    );
    let range = ScoreRange::new(2.0, 4.0, false, true).expect("finite bounds");
    assert_that!(
        packed.range_by_score(&range, 0, usize::MAX, false),
        eq(&reference.range_by_score(&range, 0, usize::MAX, false))
    );
}
