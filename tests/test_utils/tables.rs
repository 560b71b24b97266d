use std::sync::{Arc, RwLock};

use small_heap::{
    index::OrderedIndex,
    storage::{
        heap_page::{HeapPage, HeapPageID},
        tuple::{Cell, HeapTuple, Tuple, TupleId, HEAP_TUPLE_HEADER_BYTES},
    },
    transaction::{Permission, Transaction},
    types::Pod,
    utils::HandyRwLock,
    Database, HeapTable, TableSchema,
};

/// With the default 4096-byte page, exactly ten uniform rows fit on a
/// page: 392 payload bytes plus a 6-byte line pointer each.
pub const ROWS_PER_PAGE: usize = 10;
pub const PAYLOAD_BYTES: usize = 360;

/// Encoded length of a uniform row, 8-byte aligned already.
pub const TUPLE_BYTES: usize = HEAP_TUPLE_HEADER_BYTES + 8 + 2 + PAYLOAD_BYTES;

pub fn uniform_row(key: i64) -> Tuple {
    Tuple::new_from_cells(&vec![
        Cell::Int64(key),
        Cell::Bytes(vec![(key % 251) as u8; PAYLOAD_BYTES]),
    ])
}

/// A row with an explicit payload size, for mixed-length layouts.
pub fn sized_row(key: i64, payload_bytes: usize) -> Tuple {
    Tuple::new_from_cells(&vec![
        Cell::Int64(key),
        Cell::Bytes(vec![(key % 251) as u8; payload_bytes]),
    ])
}

pub fn new_table(name: &str) -> Pod<HeapTable> {
    let schema = TableSchema::int_bytes_schema(1024);
    let table_rc = Arc::new(RwLock::new(HeapTable::new(name, None, &schema)));
    Database::mut_catalog().add_table(Arc::clone(&table_rc));
    table_rc
}

/// Fill `pages` pages to the brim with uniform rows keyed 0..n,
/// returning every tuple id in insertion order.
pub fn fill_table(table: &HeapTable, pages: usize) -> Vec<TupleId> {
    let tx = Transaction::new();
    let mut tids = Vec::new();
    for key in 0..(pages * ROWS_PER_PAGE) as i64 {
        tids.push(table.insert_tuple(&tx, &uniform_row(key)).unwrap());
    }
    tx.commit().unwrap();

    assert_eq!(table.num_pages() as usize, pages);
    tids
}

pub fn delete_rows(table: &HeapTable, tids: &[TupleId]) {
    let tx = Transaction::new();
    for tid in tids {
        table.delete_tuple(&tx, tid).unwrap();
    }
    tx.commit().unwrap();
}

pub fn add_index(name: &str, table_rc: &Pod<HeapTable>) -> Pod<OrderedIndex> {
    let tx = Transaction::new();
    let index = OrderedIndex::build(name, &table_rc.rl(), &tx, 0);
    tx.commit().unwrap();

    let index_rc = Arc::new(RwLock::new(index));
    Database::mut_catalog().add_index(Arc::clone(&index_rc));
    index_rc
}

pub fn get_page(table: &HeapTable, block: u32) -> Pod<HeapPage> {
    let tx = Transaction::new();
    let pod = Database::buffer_pool()
        .get_page(
            &tx,
            Permission::ReadOnly,
            &HeapPageID::new(table.get_id(), block),
        )
        .unwrap();
    tx.commit().unwrap();
    pod
}

pub fn visible_count(table: &HeapTable) -> usize {
    let tx = Transaction::new();
    let count = table.visible_tuples_count(&tx);
    tx.commit().unwrap();
    count
}

/// Every tuple physically stored in the relation, used or not yet
/// reclaimed, with its address.
pub fn all_tuples(table: &HeapTable) -> Vec<(TupleId, HeapTuple)> {
    let tx = Transaction::new();
    let tuples: Vec<_> = table.iter(&tx).collect();
    tx.commit().unwrap();
    tuples
}
