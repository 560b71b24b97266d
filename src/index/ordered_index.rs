use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use bit_vec::BitVec;

use crate::{
    storage::{
        buffer_pool::BufferPool,
        heap_file::HeapTable,
        tuple::{Cell, HeapTuple, TupleId},
    },
    transaction::Transaction,
    types::Pod,
    utils::HandyRwLock,
};

// synthetic entry footprint, used only for the page-count statistic
const INDEX_ENTRY_BYTES: usize = 16;

#[derive(Clone, Debug)]
pub struct IndexEntry {
    pub key: Cell,
    pub heap_tid: TupleId,
}

/// A secondary index on one key field of a heap table.
///
/// Entry ordinals are stable for the whole lifetime of the index:
/// `delete_entry` only sets the kill bit, and `vacuum_cleanup` sweeps
/// the killed entries once no scan is open. That way a scan can delete
/// entries behind its own cursor without invalidating it.
pub struct OrderedIndex {
    id: u32,

    pub name: String,

    table_id: u32,

    key_field: usize,

    entries: Vec<IndexEntry>,

    dead: BitVec,
}

impl OrderedIndex {
    pub fn new(name: &str, table_id: u32, key_field: usize) -> Self {
        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);

        Self {
            id: hasher.finish() as u32,
            name: name.to_string(),
            table_id,
            key_field,
            entries: Vec::new(),
            dead: BitVec::new(),
        }
    }

    /// Build the index over every tuple currently stored in the heap,
    /// dead or alive. Reclaimed entries are cleaned by vacuum, the way
    /// they would be for an index that existed all along.
    pub fn build(name: &str, table: &HeapTable, tx: &Transaction, key_field: usize) -> Self {
        let mut index = Self::new(name, table.get_id(), key_field);

        for (tid, tuple) in table.iter(tx) {
            let key = index.form_key(&tuple);
            index.insert_entry(&key, &tid);
        }

        index
    }

    pub fn get_id(&self) -> u32 {
        self.id
    }

    pub fn get_table_id(&self) -> u32 {
        self.table_id
    }

    pub fn get_key_field(&self) -> usize {
        self.key_field
    }

    /// Compute the index key for a heap tuple.
    pub fn form_key(&self, tuple: &HeapTuple) -> Cell {
        tuple.get_cell(self.key_field)
    }

    pub fn insert_entry(&mut self, key: &Cell, heap_tid: &TupleId) {
        self.entries.push(IndexEntry {
            key: key.clone(),
            heap_tid: *heap_tid,
        });
        self.dead.push(false);
    }

    /// Mark one entry dead. The ordinal keeps addressing the same
    /// entry until `vacuum_cleanup` runs.
    pub fn delete_entry(&mut self, ordinal: usize) {
        self.dead.set(ordinal, true);
    }

    pub fn is_dead(&self, ordinal: usize) -> bool {
        self.dead.get(ordinal).unwrap_or(false)
    }

    pub fn entries_count(&self) -> usize {
        self.entries.len()
    }

    pub fn live_entries_count(&self) -> usize {
        self.dead.iter().filter(|dead| !dead).count()
    }

    /// Drop all killed entries. Must not run while a scan is open.
    pub fn vacuum_cleanup(&mut self) {
        let dead = std::mem::replace(&mut self.dead, BitVec::new());

        let mut keep = dead.iter().map(|d| !d);
        self.entries.retain(|_| keep.next().unwrap());

        self.dead = BitVec::from_elem(self.entries.len(), false);
    }

    /// Synthetic page count: the statistics writer wants one, and the
    /// entries are memory-resident.
    pub fn num_pages(&self) -> u32 {
        let bytes = self.entries.len() * INDEX_ENTRY_BYTES;
        let page_size = BufferPool::get_page_size();
        ((bytes + page_size - 1) / page_size).max(1) as u32
    }

    /// Heap tids of all live entries matching `key`.
    pub fn search(&self, key: &Cell) -> Vec<TupleId> {
        let mut tids = Vec::new();
        for (i, entry) in self.entries.iter().enumerate() {
            if !self.is_dead(i) && &entry.key == key {
                tids.push(entry.heap_tid);
            }
        }
        tids
    }

    pub fn get_entry(&self, ordinal: usize) -> Option<&IndexEntry> {
        self.entries.get(ordinal)
    }
}

/// Full scan over a shared index. Locks the index per step, so the
/// caller may take the write lock between steps to kill entries.
pub struct IndexScan {
    index: Pod<OrderedIndex>,
    cursor: usize,
}

impl IndexScan {
    pub fn new(index: Pod<OrderedIndex>) -> Self {
        Self { index, cursor: 0 }
    }
}

impl Iterator for IndexScan {
    type Item = (usize, TupleId, Cell);

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.index.rl();
        loop {
            let ordinal = self.cursor;
            if ordinal >= index.entries_count() {
                return None;
            }
            self.cursor += 1;

            if index.is_dead(ordinal) {
                continue;
            }

            let entry = index.get_entry(ordinal)?;
            return Some((ordinal, entry.heap_tid, entry.key.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kill_and_cleanup() {
        let mut index = OrderedIndex::new("idx", 1, 0);
        for i in 0..5 {
            index.insert_entry(&Cell::Int64(i), &TupleId::new(0, i as u16));
        }

        index.delete_entry(1);
        index.delete_entry(3);

        assert_eq!(index.entries_count(), 5);
        assert_eq!(index.live_entries_count(), 3);
        assert!(index.search(&Cell::Int64(3)).is_empty());

        index.vacuum_cleanup();
        assert_eq!(index.entries_count(), 3);
        assert_eq!(index.live_entries_count(), 3);
        assert_eq!(index.search(&Cell::Int64(4)), vec![TupleId::new(0, 4)]);
    }
}
