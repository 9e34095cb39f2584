//! Tests for ordered bulk loading
//!
//! These tests verify:
//! - Ordered loads build the same table as individual inserts
//! - Out-of-order records are rejected and poison the session
//! - Cancel is idempotent and safe after commits
//! - Duplicates, wraparound and non-empty tables fall back correctly

mod common;

use hashstore::{Context, HashstoreError, Record, TableKind, Tbl};

use common::*;

macro_rules! conformance {
    ($check:ident: $hash:ident, $mem:ident) => {
        #[test]
        fn $hash() {
            $check(TableKind::DiskResident);
        }

        #[test]
        fn $mem() {
            $check(TableKind::MemoryResident);
        }
    };
}

fn ctx() -> Context {
    Context::background()
}

/// Records sorted by home slot in `tbl`
fn sorted_for(tbl: &dyn Tbl, count: u64) -> Vec<Record> {
    let header = tbl.header();
    let mut records: Vec<Record> = (0..count).map(|n| record(key_n(n), n)).collect();
    records.sort_by_key(|rec| header.home_slot(&rec.key));
    records
}

// =============================================================================
// Equivalence Tests
// =============================================================================

fn check_ordered_matches_inserts(kind: TableKind) {
    let (_temp_a, path_a) = setup_temp_table();
    let (_temp_b, path_b) = setup_temp_table();
    let inserted = create(&path_a, kind);
    let loaded = create(&path_b, kind);

    // enough records to span several buffered runs
    let records = sorted_for(loaded.as_ref(), 5000);
    for rec in &records {
        inserted.insert(&ctx(), *rec).unwrap();
    }

    let mut session = loaded.expect_ordered(&ctx()).unwrap();
    for rec in &records {
        assert!(session.commit(*rec).unwrap());
    }
    session.finish().unwrap();

    assert_eq!(collect(loaded.as_ref()), collect(inserted.as_ref()));
    for rec in &records {
        assert_eq!(loaded.lookup(&ctx(), &rec.key).unwrap(), Some(*rec));
    }
    assert_eq!(loaded.stats(), inserted.stats());

    // The slot arrays are byte-identical.
    loaded.sync().unwrap();
    inserted.sync().unwrap();
    let bytes_a = std::fs::read(&path_a).unwrap();
    let bytes_b = std::fs::read(&path_b).unwrap();
    assert!(bytes_a[4096..] == bytes_b[4096..]);
}
conformance!(check_ordered_matches_inserts: test_ordered_matches_inserts_hashtbl, test_ordered_matches_inserts_memtbl);

fn check_ordered_load_survives_reopen(kind: TableKind) {
    let (_temp, path) = setup_temp_table();
    let tbl = create(&path, kind);
    let records = sorted_for(tbl.as_ref(), 300);

    let mut session = tbl.expect_ordered(&ctx()).unwrap();
    for rec in &records {
        session.commit(*rec).unwrap();
    }
    session.finish().unwrap();
    tbl.sync().unwrap();
    tbl.close();

    let tbl = hashstore::open_table(&ctx(), open_rw(&path)).unwrap();
    assert_eq!(tbl.stats().num_set, 300);
    for rec in &records {
        assert_eq!(tbl.lookup(&ctx(), &rec.key).unwrap(), Some(*rec));
    }
}
conformance!(check_ordered_load_survives_reopen: test_ordered_reopen_hashtbl, test_ordered_reopen_memtbl);

// =============================================================================
// Ordering Violation Tests
// =============================================================================

fn check_out_of_order_fails(kind: TableKind) {
    let (_temp, path) = setup_temp_table();
    let tbl = create_unhashed(&path, kind);

    let mut session = tbl.expect_ordered(&ctx()).unwrap();
    session.commit(record(key_at(10, 0), 0)).unwrap();
    session.commit(record(key_at(20, 0), 1)).unwrap();

    let err = session.commit(record(key_at(5, 0), 2)).unwrap_err();
    assert!(matches!(
        err,
        HashstoreError::OrderingViolation { previous: 20, slot: 5 }
    ));

    // Poisoned: even a well-ordered record is refused now.
    assert!(matches!(
        session.commit(record(key_at(30, 0), 3)),
        Err(HashstoreError::OrderingViolation { .. })
    ));

    session.cancel();
    session.cancel();
    drop(session);

    // The writer lock was released and the bad record never landed.
    assert_eq!(tbl.lookup(&ctx(), &key_at(5, 0)).unwrap(), None);
    assert!(tbl.insert(&ctx(), record(key_at(40, 0), 4)).unwrap());
}
conformance!(check_out_of_order_fails: test_out_of_order_hashtbl, test_out_of_order_memtbl);

fn check_finish_after_violation_fails(kind: TableKind) {
    let (_temp, path) = setup_temp_table();
    let tbl = create_unhashed(&path, kind);

    let mut session = tbl.expect_ordered(&ctx()).unwrap();
    session.commit(record(key_at(9, 0), 0)).unwrap();
    let _ = session.commit(record(key_at(3, 0), 1));

    assert!(matches!(
        session.finish(),
        Err(HashstoreError::OrderingViolation { previous: 9, slot: 3 })
    ));
}
conformance!(check_finish_after_violation_fails: test_finish_after_violation_hashtbl, test_finish_after_violation_memtbl);

// =============================================================================
// Session Lifecycle Tests
// =============================================================================

fn check_cancel_after_commits_is_safe(kind: TableKind) {
    let (_temp, path) = setup_temp_table();
    let tbl = create(&path, kind);
    let records = sorted_for(tbl.as_ref(), 50);

    {
        let mut session = tbl.expect_ordered(&ctx()).unwrap();
        for rec in &records {
            session.commit(*rec).unwrap();
        }
        session.cancel();
        session.cancel();
        assert!(matches!(
            session.commit(records[0]),
            Err(HashstoreError::Closed)
        ));
    }

    // Whatever was kept is consistent between stats and contents.
    let visible = collect(tbl.as_ref());
    assert_eq!(tbl.stats().num_set, visible.len() as u64);
    tbl.compute_estimates(&ctx()).unwrap();
    assert_eq!(tbl.stats().num_set, visible.len() as u64);

    // A new session can start once the old one is gone.
    let session = tbl.expect_ordered(&ctx()).unwrap();
    session.finish().unwrap();
}
conformance!(check_cancel_after_commits_is_safe: test_cancel_after_commits_hashtbl, test_cancel_after_commits_memtbl);

fn check_dropped_session_releases_writer(kind: TableKind) {
    let (_temp, path) = setup_temp_table();
    let tbl = create(&path, kind);

    let result: hashstore::Result<()> = (|| {
        let mut session = tbl.expect_ordered(&ctx())?;
        session.commit(record(key_n(1), 1))?;
        Err(HashstoreError::InvalidArgument("caller bailed".into()))
    })();
    assert!(result.is_err());

    tbl.insert(&ctx(), record(key_n(2), 2)).unwrap();
    assert_eq!(tbl.lookup(&ctx(), &key_n(2)).unwrap(), Some(record(key_n(2), 2)));
}
conformance!(check_dropped_session_releases_writer: test_dropped_session_hashtbl, test_dropped_session_memtbl);

// =============================================================================
// Placement Edge Case Tests
// =============================================================================

fn check_duplicate_keys_overwrite(kind: TableKind) {
    let (_temp, path) = setup_temp_table();
    let tbl = create_unhashed(&path, kind);

    let mut session = tbl.expect_ordered(&ctx()).unwrap();
    assert!(session.commit(record(key_at(7, 0), 0)).unwrap());
    assert!(session.commit(record(key_at(7, 1), 1)).unwrap());
    assert!(!session.commit(record(key_at(7, 0), 100)).unwrap());
    assert!(session.commit(record(key_at(8, 0), 2)).unwrap());
    session.finish().unwrap();

    assert_eq!(tbl.stats().num_set, 3);
    assert_eq!(tbl.lookup(&ctx(), &key_at(7, 0)).unwrap(), Some(record(key_at(7, 0), 100)));
    // slot 8 was taken by the collision chain, so key (8, 0) sits at 9
    assert_eq!(tbl.lookup(&ctx(), &key_at(8, 0)).unwrap(), Some(record(key_at(8, 0), 2)));
}
conformance!(check_duplicate_keys_overwrite: test_ordered_duplicates_hashtbl, test_ordered_duplicates_memtbl);

fn check_ordered_wraps_at_table_end(kind: TableKind) {
    let (_temp, path) = setup_temp_table();
    let tbl = create_unhashed(&path, kind);
    let last = NUM_SLOTS - 1;

    let mut session = tbl.expect_ordered(&ctx()).unwrap();
    session.commit(record(key_at(last - 1, 0), 0)).unwrap();
    for id in 0..4 {
        session.commit(record(key_at(last, id), id + 1)).unwrap();
    }
    session.finish().unwrap();

    assert_eq!(tbl.stats().num_set, 5);
    for id in 0..4 {
        assert_eq!(
            tbl.lookup(&ctx(), &key_at(last, id)).unwrap(),
            Some(record(key_at(last, id), id + 1))
        );
    }
}
conformance!(check_ordered_wraps_at_table_end: test_ordered_wraps_hashtbl, test_ordered_wraps_memtbl);

fn check_ordered_into_non_empty_table(kind: TableKind) {
    let (_temp, path) = setup_temp_table();
    let tbl = create_unhashed(&path, kind);
    tbl.insert(&ctx(), record(key_at(50, 0), 0)).unwrap();
    tbl.insert(&ctx(), record(key_at(51, 0), 1)).unwrap();

    let mut session = tbl.expect_ordered(&ctx()).unwrap();
    assert!(session.commit(record(key_at(50, 1), 2)).unwrap());
    assert!(!session.commit(record(key_at(51, 0), 3)).unwrap());
    assert!(session.commit(record(key_at(52, 0), 4)).unwrap());
    session.finish().unwrap();

    let all = collect(tbl.as_ref());
    assert_eq!(all.len(), 4);
    assert_eq!(tbl.lookup(&ctx(), &key_at(50, 0)).unwrap(), Some(record(key_at(50, 0), 0)));
    assert_eq!(tbl.lookup(&ctx(), &key_at(50, 1)).unwrap(), Some(record(key_at(50, 1), 2)));
    assert_eq!(tbl.lookup(&ctx(), &key_at(51, 0)).unwrap(), Some(record(key_at(51, 0), 3)));
    assert_eq!(tbl.lookup(&ctx(), &key_at(52, 0)).unwrap(), Some(record(key_at(52, 0), 4)));
}
conformance!(check_ordered_into_non_empty_table: test_ordered_non_empty_hashtbl, test_ordered_non_empty_memtbl);

// =============================================================================
// Session Interaction Tests
// =============================================================================

fn check_session_after_close(kind: TableKind) {
    let (_temp, path) = setup_temp_table();
    let tbl = create_unhashed(&path, kind);

    let mut session = tbl.expect_ordered(&ctx()).unwrap();
    assert!(session.commit(record(key_at(1, 0), 1)).unwrap());
    tbl.close();

    assert!(matches!(
        session.commit(record(key_at(2, 0), 2)),
        Err(HashstoreError::Closed)
    ));
    assert!(matches!(session.finish(), Err(HashstoreError::Closed)));

    // Nothing from after the close reached the file.
    let tbl = hashstore::open_table(&ctx(), open_rw(&path)).unwrap();
    assert_eq!(tbl.lookup(&ctx(), &key_at(2, 0)).unwrap(), None);
    assert_eq!(tbl.stats().num_set, collect(tbl.as_ref()).len() as u64);
}
conformance!(check_session_after_close: test_session_after_close_hashtbl, test_session_after_close_memtbl);

fn check_estimates_during_session(kind: TableKind) {
    let (_temp, path) = setup_temp_table();
    let tbl = create(&path, kind);
    let records = sorted_for(tbl.as_ref(), 100);

    // rescan, then cancel
    let mut session = tbl.expect_ordered(&ctx()).unwrap();
    session.commit(records[0]).unwrap();
    session.commit(records[1]).unwrap();
    tbl.compute_estimates(&ctx()).unwrap();
    assert!(tbl.stats().num_set <= 2);
    session.cancel();
    drop(session);

    let visible = collect(tbl.as_ref());
    let len: u64 = visible.iter().map(|r| u64::from(r.length)).sum();
    assert_eq!(tbl.stats().num_set, visible.len() as u64);
    assert_eq!(tbl.stats().len_set, len);
    assert!(tbl.load() <= 1.0);

    // rescan mid-session, then finish
    let mut session = tbl.expect_ordered(&ctx()).unwrap();
    for rec in &records[..50] {
        session.commit(*rec).unwrap();
    }
    tbl.compute_estimates(&ctx()).unwrap();
    for rec in &records[50..] {
        session.commit(*rec).unwrap();
    }
    session.finish().unwrap();

    let visible = collect(tbl.as_ref());
    let len: u64 = visible.iter().map(|r| u64::from(r.length)).sum();
    assert_eq!(visible.len(), 100);
    assert_eq!(tbl.stats().num_set, 100);
    assert_eq!(tbl.stats().len_set, len);
}
conformance!(check_estimates_during_session: test_estimates_during_session_hashtbl, test_estimates_during_session_memtbl);
