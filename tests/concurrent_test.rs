mod test_utils;

use std::thread;

use small_heap::{
    storage::tuple::TupleId, transaction::Transaction, utils::HandyRwLock, vacuum::vacuum, Database,
};

use crate::test_utils::{delete_rows, new_table, setup, uniform_row, visible_count};

const WRITERS: usize = 4;
const ROWS: i64 = 100;

/// Several writers load a table through the ordinary insert path at
/// the same time, then a vacuum pass reclaims what a later delete
/// killed. Exercises latching, relation locks and the status oracle
/// under real thread interleaving.
#[test]
fn test_concurrent_inserts_then_vacuum() {
    let _guard = setup();

    let table_rc = new_table("storm");

    let (key_sender, key_receiver) = crossbeam::channel::unbounded::<i64>();
    let (tid_sender, tid_receiver) = crossbeam::channel::unbounded::<(i64, TupleId)>();

    for key in 0..ROWS {
        key_sender.send(key).unwrap();
    }
    drop(key_sender);

    let mut handles = Vec::new();
    for _ in 0..WRITERS {
        let table_rc = table_rc.clone();
        let key_receiver = key_receiver.clone();
        let tid_sender = tid_sender.clone();

        handles.push(thread::spawn(move || {
            let tx = Transaction::new();
            let table = table_rc.rl();

            while let Ok(key) = key_receiver.recv() {
                let tid = table.insert_tuple(&tx, &uniform_row(key)).unwrap();
                tid_sender.send((key, tid)).unwrap();
            }

            tx.commit().unwrap();
        }));
    }
    drop(tid_sender);

    for handle in handles {
        handle.join().unwrap();
    }

    let table = table_rc.rl();
    assert_eq!(visible_count(&table), ROWS as usize);

    // kill every fourth row, then reclaim
    let doomed: Vec<TupleId> = tid_receiver
        .iter()
        .filter(|(key, _)| key % 4 == 0)
        .map(|(_, tid)| tid)
        .collect();
    delete_rows(&table, &doomed);

    vacuum(Some("storm"), true, false, None).unwrap();

    assert_eq!(visible_count(&table), 75);

    let stats = Database::catalog().read_stats(table.get_id()).unwrap();
    assert_eq!(stats.num_tuples, 75);
}
