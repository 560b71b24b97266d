mod test_utils;

use std::fs;

use small_heap::{
    index::IndexScan,
    storage::{
        buffer_pool::BufferPool,
        heap_page::{LINE_POINTER_BYTES, PAGE_HEADER_BYTES},
        tuple::{Cell, INVALID_XID, MARKED_FOR_UPDATE, MOVED_IN, MOVED_OFF, UPDATED, XMAX_INVALID, XMIN_COMMITTED},
    },
    transaction::Transaction,
    utils::HandyRwLock,
    vacuum::{request_cancel, vacuum},
    Database, ErrorKind,
};

use crate::test_utils::{
    add_index, all_tuples, delete_rows, fill_table, get_page, new_table, setup, sized_row,
    uniform_row, visible_count, ROWS_PER_PAGE, TUPLE_BYTES,
};

/// Four full pages, tuples 5..9 of the last page deleted long ago.
/// The page shrinks in place: no fragmented page lies before it, so
/// nothing moves and nothing is truncated.
#[test]
fn test_s1_shrinks_dead_space_in_place() {
    let _guard = setup();

    let table_rc = new_table("s1");
    let table = table_rc.rl();

    let tids = fill_table(&table, 4);
    delete_rows(&table, &tids[35..40]);

    vacuum(Some("s1"), true, false, None).unwrap();

    assert_eq!(table.num_pages(), 4);
    assert_eq!(visible_count(&table), 35);

    let stats = Database::catalog().read_stats(table.get_id()).unwrap();
    assert_eq!(stats.num_tuples, 35);
    assert_eq!(stats.num_pages, 4);

    // space conservation on the repacked page: all free space is one
    // contiguous run
    let page_pod = get_page(&table, 3);
    let page = page_pod.rl();
    let expected_free = BufferPool::get_page_size()
        - PAGE_HEADER_BYTES
        - 5 * TUPLE_BYTES
        - ROWS_PER_PAGE * LINE_POINTER_BYTES;
    assert_eq!(page.free_space(), expected_free);
    assert_eq!(page.live_count(), 5);
}

/// Same layout, but every tuple of the last page is dead: the page
/// ends up empty and the file is truncated by one block.
#[test]
fn test_s2_truncates_fully_dead_trailing_page() {
    let _guard = setup();

    let table_rc = new_table("s2");
    let table = table_rc.rl();

    let tids = fill_table(&table, 4);
    delete_rows(&table, &tids[30..40]);

    vacuum(Some("s2"), true, false, None).unwrap();

    assert_eq!(table.num_pages(), 3);
    assert_eq!(visible_count(&table), 30);

    let stats = Database::catalog().read_stats(table.get_id()).unwrap();
    assert_eq!(stats.num_tuples, 30);
    assert_eq!(stats.num_pages, 3);
}

/// Two pages; the first gains space from deletions, the second keeps
/// one live tuple. The survivor moves forward and the file shrinks to
/// one page. Also checks index-heap consistency and truncation safety
/// through a secondary index.
#[test]
fn test_s3_moves_last_tuple_and_truncates() {
    let _guard = setup();

    let table_rc = new_table("s3");
    let table = table_rc.rl();

    let tids = fill_table(&table, 2);
    let index_rc = add_index("s3_key_idx", &table_rc);

    // five dead on page 0, nine dead on page 1, key 15 survives there
    delete_rows(&table, &tids[3..8]);
    delete_rows(&table, &tids[10..15]);
    delete_rows(&table, &tids[16..20]);

    vacuum(Some("s3"), true, false, None).unwrap();

    assert_eq!(table.num_pages(), 1);
    assert_eq!(visible_count(&table), 6);

    let stats = Database::catalog().read_stats(table.get_id()).unwrap();
    assert_eq!(stats.num_tuples, 6);
    assert_eq!(stats.num_pages, 1);
    assert!(stats.has_index);

    // the moved survivor sits on the first page now
    let moved: Vec<_> = all_tuples(&table)
        .into_iter()
        .filter(|(_, t)| t.get_cell(0).get_int64().unwrap() == 15)
        .collect();
    assert_eq!(moved.len(), 1);
    let (moved_tid, moved_tuple) = &moved[0];
    assert_eq!(moved_tid.block, 0);
    assert!(moved_tuple.is_set(MOVED_IN));
    assert!(moved_tuple.is_set(XMIN_COMMITTED));

    // index-heap consistency: every surviving key resolves to exactly
    // one live tuple bearing that key
    let index = index_rc.rl();
    assert_eq!(index.live_entries_count(), 6);
    for key in [0i64, 1, 2, 8, 9, 15].iter() {
        let matches = index.search(&Cell::Int64(*key));
        assert_eq!(matches.len(), 1, "key {}", key);

        let tx = Transaction::new();
        let tuple = table.get_tuple(&tx, &matches[0]).unwrap();
        tx.commit().unwrap();
        assert_eq!(tuple.get_cell(0).get_int64().unwrap(), *key);
    }
    drop(index);

    // truncation safety: no index entry points past the new tail
    for (_, heap_tid, _) in IndexScan::new(index_rc.clone()) {
        assert!(heap_tid.block < table.num_pages());
    }

    let index_stats = Database::catalog()
        .read_stats(index_rc.rl().get_id())
        .unwrap();
    assert_eq!(index_stats.num_tuples, 6);
}

/// A two-version update chain on pages 0 and 3 moves onto page 1 as a
/// whole, tail first, and stays navigable through `ctid`.
#[test]
fn test_s4_moves_whole_update_chain() {
    let _guard = setup();

    let table_rc = new_table("s4");
    let table = table_rc.rl();

    let tids = fill_table(&table, 3);

    // room for both versions on page 1
    delete_rows(&table, &tids[12..20]);

    // the reader keeps the old version "recently dead"
    let reader = Transaction::new();

    let updater = Transaction::new();
    let v2_tid = table.update_tuple(&updater, &tids[0], &uniform_row(0)).unwrap();
    updater.commit().unwrap();
    assert_eq!(v2_tid.block, 3);

    vacuum(Some("s4"), true, false, None).unwrap();

    // the emptied tail page is gone
    assert_eq!(table.num_pages(), 3);
    assert_eq!(visible_count(&table), 22);

    let stats = Database::catalog().read_stats(table.get_id()).unwrap();
    assert_eq!(stats.num_tuples, 22);

    // both versions moved to page 1, flags settled
    let versions: Vec<_> = all_tuples(&table)
        .into_iter()
        .filter(|(_, t)| t.get_cell(0).get_int64().unwrap() == 0)
        .collect();
    assert_eq!(versions.len(), 2);

    let (new_tid, new_tuple) = versions
        .iter()
        .find(|(_, t)| t.is_set(UPDATED))
        .expect("new version not found");
    let (old_tid, old_tuple) = versions
        .iter()
        .find(|(_, t)| !t.is_set(UPDATED))
        .expect("old version not found");

    assert_eq!(new_tid.block, 1);
    assert_eq!(old_tid.block, 1);
    for tuple in [new_tuple, old_tuple].iter() {
        assert!(tuple.is_set(MOVED_IN));
        assert!(tuple.is_set(XMIN_COMMITTED));
    }

    // chain preservation: old -> new, new -> itself
    assert_eq!(old_tuple.ctid, *new_tid);
    assert_eq!(new_tuple.ctid, *new_tid);

    // recently-dead preservation: the old version is still deleted,
    // not resurrected
    assert_ne!(old_tuple.xmax, INVALID_XID);

    // the original homes are reclaimed
    assert!(!get_page(&table, 0).rl().is_slot_used(tids[0].slot));

    reader.commit().unwrap();
}

/// The same chain with room for only one version: the chain is
/// rejected as a whole and both versions stay where they are.
#[test]
fn test_s5_chain_stays_when_space_lacks() {
    let _guard = setup();

    let table_rc = new_table("s5");
    let table = table_rc.rl();

    let tids = fill_table(&table, 3);

    // room for exactly one uniform tuple on page 1
    delete_rows(&table, &tids[12..13]);

    let reader = Transaction::new();

    let updater = Transaction::new();
    let v2_tid = table.update_tuple(&updater, &tids[0], &uniform_row(0)).unwrap();
    updater.commit().unwrap();
    assert_eq!(v2_tid.block, 3);

    vacuum(Some("s5"), true, false, None).unwrap();

    // the chain pages survive untouched
    assert_eq!(table.num_pages(), 4);

    let tx = Transaction::new();
    let old_tuple = table.get_tuple(&tx, &tids[0]).unwrap();
    let new_tuple = table.get_tuple(&tx, &v2_tid).unwrap();
    tx.commit().unwrap();

    assert!(!old_tuple.is_set(MOVED_OFF));
    assert!(!new_tuple.is_set(MOVED_IN));
    assert_eq!(old_tuple.ctid, v2_tid);

    reader.commit().unwrap();
}

/// A tuple with an in-progress inserter downgrades the pass: the scan
/// completes and the statistics are written, but nothing moves.
#[test]
fn test_s6_in_progress_inserter_disables_compaction() {
    let _guard = setup();

    let table_rc = new_table("s6");
    let table = table_rc.rl();

    let tids = fill_table(&table, 2);

    // a partially filled third page
    let tx = Transaction::new();
    for key in 20..25 {
        table.insert_tuple(&tx, &uniform_row(key)).unwrap();
    }
    tx.commit().unwrap();

    // dead space on page 0 so compaction would otherwise run
    delete_rows(&table, &tids[3..6]);

    // an insert whose transaction never finishes; built on another
    // thread so this session has no open transaction
    let open_tx = {
        let table_rc = table_rc.clone();
        std::thread::spawn(move || {
            let tx = Transaction::new();
            table_rc.rl().insert_tuple(&tx, &uniform_row(1000)).unwrap();
            tx
        })
        .join()
        .unwrap()
    };

    vacuum(Some("s6"), true, false, None).unwrap();

    assert_eq!(table.num_pages(), 3);

    let stats = Database::catalog().read_stats(table.get_id()).unwrap();
    assert_eq!(stats.num_tuples, 22);
    assert_eq!(stats.num_pages, 3);

    // compaction was skipped for the whole relation
    for (_, tuple) in all_tuples(&table) {
        assert!(!tuple.is_set(MOVED_IN));
        assert!(!tuple.is_set(MOVED_OFF));
    }

    open_tx.abort().unwrap();
}

/// A second pass over an unchanged relation does no work and leaves
/// identical statistics.
#[test]
fn test_vacuum_twice_is_idempotent() {
    let _guard = setup();

    let table_rc = new_table("twice");
    let table = table_rc.rl();

    let tids = fill_table(&table, 4);
    delete_rows(&table, &tids[35..40]);

    vacuum(Some("twice"), false, false, None).unwrap();
    let first = Database::catalog().read_stats(table.get_id()).unwrap();
    let pages_after_first = table.num_pages();

    vacuum(Some("twice"), false, false, None).unwrap();
    let second = Database::catalog().read_stats(table.get_id()).unwrap();

    assert_eq!(first, second);
    assert_eq!(table.num_pages(), pages_after_first);
    assert_eq!(visible_count(&table), 35);

    for (_, tuple) in all_tuples(&table) {
        assert!(!tuple.is_set(MOVED_IN));
        assert!(!tuple.is_set(MOVED_OFF));
    }
}

/// A committed row lock is not a delete: the tuple survives and the
/// lock bits are cleared.
#[test]
fn test_marked_for_update_is_kept_as_lock_record() {
    let _guard = setup();

    let table_rc = new_table("locked");
    let table = table_rc.rl();

    let tids = fill_table(&table, 1);

    let tx = Transaction::new();
    table.lock_tuple_for_update(&tx, &tids[4]).unwrap();
    tx.commit().unwrap();

    vacuum(Some("locked"), false, false, None).unwrap();

    assert_eq!(visible_count(&table), 10);

    let read_tx = Transaction::new();
    let tuple = table.get_tuple(&read_tx, &tids[4]).unwrap();
    read_tx.commit().unwrap();

    assert!(!tuple.is_set(MARKED_FOR_UPDATE));
    assert!(tuple.is_set(XMAX_INVALID));
}

#[test]
fn test_refuses_inside_transaction_block() {
    let _guard = setup();

    let table_rc = new_table("blocked");
    fill_table(&table_rc.rl(), 1);

    let tx = Transaction::new();
    let err = vacuum(Some("blocked"), false, false, None).unwrap_err();
    assert_eq!(err.get_kind(), ErrorKind::InTransactionBlock);
    tx.commit().unwrap();

    // with the transaction gone, the same call goes through
    vacuum(Some("blocked"), false, false, None).unwrap();
}

#[test]
fn test_unknown_relation_reported_and_lock_released() {
    let _guard = setup();

    let err = vacuum(Some("no_such_table"), false, false, None).unwrap_err();
    assert_eq!(err.get_kind(), ErrorKind::RelationNotFound);

    // the failure path must unlink the vacuum lock file
    assert!(!Database::global().vacuum_lock_path().exists());

    // and a later vacuum can run again
    vacuum(None, false, false, None).unwrap();
}

#[test]
fn test_second_vacuum_rejected_while_lock_held() {
    let _guard = setup();

    let lock_path = Database::global().vacuum_lock_path();
    fs::write(&lock_path, b"").unwrap();

    let err = vacuum(None, false, false, None).unwrap_err();
    assert_eq!(err.get_kind(), ErrorKind::AnotherVacuumRunning);

    fs::remove_file(&lock_path).unwrap();
    vacuum(None, false, false, None).unwrap();
}

/// A wildcard pass walks the whole catalog and skips non-table
/// relations (the index) with a warning instead of failing.
#[test]
fn test_wildcard_pass_skips_index_relations() {
    let _guard = setup();

    let table_rc = new_table("wild");
    let table = table_rc.rl();
    let tids = fill_table(&table, 2);
    add_index("wild_key_idx", &table_rc);
    delete_rows(&table, &tids[0..5]);

    vacuum(None, true, false, None).unwrap();

    let stats = Database::catalog().read_stats(table.get_id()).unwrap();
    assert_eq!(stats.num_tuples, 15);
}

#[test]
fn test_analyze_column_list_validation() {
    let _guard = setup();

    let table_rc = new_table("analyzed");
    fill_table(&table_rc.rl(), 1);

    // a column list without analyze is refused
    let err = vacuum(
        Some("analyzed"),
        false,
        false,
        Some(vec!["key".to_string()]),
    )
    .unwrap_err();
    assert_eq!(err.get_kind(), ErrorKind::Internal);

    // with analyze it is accepted (and ignored)
    vacuum(
        Some("analyzed"),
        false,
        true,
        Some(vec!["key".to_string()]),
    )
    .unwrap();
}

#[test]
fn test_statistics_overwrite_posts_invalidation() {
    let _guard = setup();

    let table_rc = new_table("inval");
    fill_table(&table_rc.rl(), 1);

    let before = Database::catalog().invalidation_count();
    vacuum(Some("inval"), false, false, None).unwrap();
    let after = Database::catalog().invalidation_count();

    assert_eq!(after, before + 1);
}

/// Rows of random sizes, a scattered delete, then two passes: the
/// engine must stay consistent whatever the layout, and the second
/// pass must find nothing left to do.
#[test]
fn test_mixed_row_sizes_compact_and_settle() {
    use rand::Rng;

    let _guard = setup();

    let table_rc = new_table("mixed");
    let table = table_rc.rl();
    add_index("mixed_key_idx", &table_rc);

    let mut rng = rand::thread_rng();
    let tx = Transaction::new();
    let mut tids = Vec::new();
    for key in 0..200i64 {
        let payload = rng.gen_range(40, 600);
        tids.push(table.insert_tuple(&tx, &sized_row(key, payload)).unwrap());
    }
    tx.commit().unwrap();

    let doomed: Vec<_> = tids
        .iter()
        .enumerate()
        .filter(|(i, _)| i % 3 == 0)
        .map(|(_, tid)| *tid)
        .collect();
    delete_rows(&table, &doomed);
    let survivors = 200 - doomed.len();

    vacuum(Some("mixed"), true, false, None).unwrap();

    assert_eq!(visible_count(&table), survivors);
    let first = Database::catalog().read_stats(table.get_id()).unwrap();
    assert_eq!(first.num_tuples, survivors as u64);

    // a second pass may tidy further but never changes what is live
    vacuum(Some("mixed"), true, false, None).unwrap();
    assert_eq!(visible_count(&table), survivors);
    let second = Database::catalog().read_stats(table.get_id()).unwrap();
    assert_eq!(second.num_tuples, survivors as u64);
    assert!(second.num_pages <= first.num_pages);
}

/// Cancellation is cooperative: whether it lands or the pass finishes
/// first, everything is released cleanly.
#[test]
fn test_cancel_releases_everything() {
    let _guard = setup();

    let table_rc = new_table("cancelled");
    let table = table_rc.rl();
    let tids = fill_table(&table, 20);
    delete_rows(&table, &tids[150..200]);
    drop(table);

    let handle = std::thread::spawn(|| vacuum(Some("cancelled"), false, false, None));
    request_cancel();
    let result = handle.join().unwrap();

    match result {
        Ok(()) => {}
        Err(e) => assert_eq!(e.get_kind(), ErrorKind::Cancelled),
    }

    assert!(!Database::global().vacuum_lock_path().exists());

    // the engine is reusable afterwards
    vacuum(Some("cancelled"), false, false, None).unwrap();
}
