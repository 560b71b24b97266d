use core::fmt;
use std::{
    collections::hash_map::DefaultHasher,
    fs::{File, OpenOptions},
    hash::{Hash, Hasher},
    io::{Read, Seek, SeekFrom, Write},
    sync::{Mutex, MutexGuard},
};

use crate::{
    error::SmallError,
    storage::{
        buffer_pool::BufferPool,
        heap_page::{HeapPageID, LINE_POINTER_BYTES, PAGE_HEADER_BYTES},
        schema::TableSchema,
        tuple::{
            HeapTuple, Tuple, TupleId, INVALID_XID, MARKED_FOR_UPDATE, UPDATED, XMAX_COMMITTED,
            XMAX_INVALID,
        },
    },
    transaction::{ConcurrentStatus, Permission, RelationLock, Transaction},
    types::SmallResult,
    utils::{align8, HandyRwLock},
    Database,
};

/// A heap relation: an unordered collection of MVCC tuples in a
/// paged file.
pub struct HeapTable {
    pub name: String,

    table_id: u32,

    pub schema: TableSchema,

    // the field which secondary indexes are keyed on by default
    pub key_field: usize,

    file: Mutex<File>,

    file_path: String,
}

impl fmt::Display for HeapTable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "<HeapTable, file: {}, id: {}>", self.file_path, self.table_id)
    }
}

// init functions
impl HeapTable {
    pub fn new(name: &str, table_id: Option<u32>, schema: &TableSchema) -> Self {
        let file_path = Database::global()
            .get_path()
            .join(format!("{}.db", name))
            .to_str()
            .unwrap()
            .to_string();

        File::create(&file_path).expect("io error");

        let f = Mutex::new(
            OpenOptions::new()
                .write(true)
                .read(true)
                .open(&file_path)
                .unwrap(),
        );

        let table_id = table_id.unwrap_or_else(|| {
            let mut hasher = DefaultHasher::new();
            name.hash(&mut hasher);
            hasher.finish() as u32
        });

        Self {
            name: name.to_string(),
            table_id,
            schema: schema.clone(),
            key_field: schema.get_key_pos(),
            file: f,
            file_path,
        }
    }
}

// storage-manager surface
impl HeapTable {
    pub fn get_id(&self) -> u32 {
        self.table_id
    }

    pub fn get_schema(&self) -> &TableSchema {
        &self.schema
    }

    fn get_file(&self) -> MutexGuard<'_, File> {
        self.file.lock().unwrap()
    }

    /// Number of blocks in the heap file.
    pub fn num_pages(&self) -> u32 {
        let len = self.get_file().metadata().unwrap().len() as usize;
        (len / BufferPool::get_page_size()) as u32
    }

    pub fn read_page_bytes(&self, block: u32) -> Result<Vec<u8>, SmallError> {
        let page_size = BufferPool::get_page_size();
        let mut file = self.get_file();
        file.seek(SeekFrom::Start((block as usize * page_size) as u64))?;

        let mut buf: Vec<u8> = vec![0; page_size];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn write_page_bytes(&self, block: u32, bytes: &[u8]) -> SmallResult {
        let page_size = BufferPool::get_page_size();
        let mut file = self.get_file();
        file.seek(SeekFrom::Start((block as usize * page_size) as u64))?;
        file.write_all(bytes)?;
        Ok(())
    }

    /// Give trailing blocks back to the filesystem.
    pub fn truncate(&self, new_page_count: u32) -> SmallResult {
        let page_size = BufferPool::get_page_size();
        self.get_file()
            .set_len((new_page_count as usize * page_size) as u64)?;
        Ok(())
    }

    /// Append one unformatted block, return its number.
    pub fn allocate_page(&self) -> Result<u32, SmallError> {
        let block = self.num_pages();
        self.write_page_bytes(block, &vec![0; BufferPool::get_page_size()])?;
        Ok(block)
    }

    /// The largest encoded tuple a page can take.
    pub fn tuple_capacity() -> usize {
        BufferPool::get_page_size() - PAGE_HEADER_BYTES - LINE_POINTER_BYTES
    }
}

// MVCC entry points
impl HeapTable {
    pub fn insert_tuple(&self, tx: &Transaction, row: &Tuple) -> Result<TupleId, SmallError> {
        ConcurrentStatus::request_relation_lock(tx, &RelationLock::Exclusive, self.table_id)?;

        let result = self.insert_tuple_with_mask(tx, row, 0);

        // locks and latches are statement-scoped; visibility is done
        // by the tuple headers, not by two-phase locking
        Database::mut_concurrent_status().release_statement_locks(tx);
        result
    }

    fn insert_tuple_with_mask(
        &self,
        tx: &Transaction,
        row: &Tuple,
        extra_mask: u16,
    ) -> Result<TupleId, SmallError> {
        let mut tuple = HeapTuple::new(row, tx.get_id(), tx.current_cid(), TupleId::new(0, 0));
        tuple.infomask |= extra_mask;
        let encoded = tuple.encode();

        if align8(encoded.len()) > Self::tuple_capacity() {
            return Err(SmallError::internal(&format!(
                "tuple of {} bytes exceeds page capacity",
                encoded.len()
            )));
        }

        // stage 1: try every existing page
        for block in 0..self.num_pages() {
            if let Some(tid) = self.try_place(tx, block, &encoded)? {
                self.insert_index_entries(&tuple, &tid)?;
                return Ok(tid);
            }
        }

        // stage 2: extend the file by one page
        let block = self.allocate_page()?;
        match self.try_place(tx, block, &encoded)? {
            Some(tid) => {
                self.insert_index_entries(&tuple, &tid)?;
                Ok(tid)
            }
            None => Err(SmallError::internal("fresh page rejected the tuple")),
        }
    }

    fn try_place(
        &self,
        tx: &Transaction,
        block: u32,
        encoded: &[u8],
    ) -> Result<Option<TupleId>, SmallError> {
        let pid = HeapPageID::new(self.table_id, block);
        let page_pod = Database::buffer_pool().get_page(tx, Permission::ReadWrite, &pid)?;

        // hold the page
        {
            let mut page = page_pod.wl();
            if page.is_new() {
                page.format();
            }

            if let Some(slot) = page.insert_tuple_bytes(encoded) {
                let tid = TupleId::new(block, slot);

                // point the stored ctid at the tuple itself
                let mut stored = page.get_tuple(slot, &self.schema)?;
                stored.ctid = tid;
                page.set_tuple_header(slot, &stored)?;

                return Ok(Some(tid));
            }
        }
        // release the page

        Ok(None)
    }

    fn insert_index_entries(&self, tuple: &HeapTuple, tid: &TupleId) -> SmallResult {
        for index_pod in Database::catalog().get_indexes(self.table_id) {
            let mut index = index_pod.wl();
            let key = index.form_key(tuple);
            index.insert_entry(&key, tid);
        }
        Ok(())
    }

    /// Mark the tuple deleted by this transaction. The space is only
    /// reclaimed by a later vacuum pass.
    pub fn delete_tuple(&self, tx: &Transaction, tid: &TupleId) -> SmallResult {
        ConcurrentStatus::request_relation_lock(tx, &RelationLock::Exclusive, self.table_id)?;

        let result = (|| {
            let pid = HeapPageID::new(self.table_id, tid.block);
            let page_pod = Database::buffer_pool().get_page(tx, Permission::ReadWrite, &pid)?;

            let mut page = page_pod.wl();
            let mut tuple = page.get_tuple(tid.slot, &self.schema)?;

            tuple.xmax = tx.get_id();
            tuple.cmd = tx.current_cid();
            tuple.clear_flag(XMAX_INVALID | XMAX_COMMITTED | MARKED_FOR_UPDATE);

            page.set_tuple_header(tid.slot, &tuple)
        })();

        Database::mut_concurrent_status().release_statement_locks(tx);
        result
    }

    /// Write a new version of the tuple and chain the old one to it
    /// via `ctid`.
    pub fn update_tuple(
        &self,
        tx: &Transaction,
        tid: &TupleId,
        new_row: &Tuple,
    ) -> Result<TupleId, SmallError> {
        ConcurrentStatus::request_relation_lock(tx, &RelationLock::Exclusive, self.table_id)?;

        let result = (|| -> Result<TupleId, SmallError> {
            // the new version first, so the old version never points
            // at nothing
            let new_tid = self.insert_tuple_with_mask(tx, new_row, UPDATED)?;

            let pid = HeapPageID::new(self.table_id, tid.block);
            let page_pod = Database::buffer_pool().get_page(tx, Permission::ReadWrite, &pid)?;

            let mut page = page_pod.wl();
            let mut old = page.get_tuple(tid.slot, &self.schema)?;

            old.xmax = tx.get_id();
            old.cmd = tx.current_cid();
            old.ctid = new_tid;
            old.clear_flag(XMAX_INVALID | XMAX_COMMITTED | MARKED_FOR_UPDATE);

            page.set_tuple_header(tid.slot, &old)?;

            Ok(new_tid)
        })();

        Database::mut_concurrent_status().release_statement_locks(tx);
        result
    }

    /// Take a row-level lock: `xmax` is stamped but the tuple is a
    /// lock record, not a delete.
    pub fn lock_tuple_for_update(&self, tx: &Transaction, tid: &TupleId) -> SmallResult {
        ConcurrentStatus::request_relation_lock(tx, &RelationLock::Exclusive, self.table_id)?;

        let result = (|| {
            let pid = HeapPageID::new(self.table_id, tid.block);
            let page_pod = Database::buffer_pool().get_page(tx, Permission::ReadWrite, &pid)?;

            let mut page = page_pod.wl();
            let mut tuple = page.get_tuple(tid.slot, &self.schema)?;

            tuple.xmax = tx.get_id();
            tuple.cmd = tx.current_cid();
            tuple.set_flag(MARKED_FOR_UPDATE);
            tuple.clear_flag(XMAX_INVALID | XMAX_COMMITTED);

            page.set_tuple_header(tid.slot, &tuple)
        })();

        Database::mut_concurrent_status().release_statement_locks(tx);
        result
    }

    pub fn get_tuple(&self, tx: &Transaction, tid: &TupleId) -> Result<HeapTuple, SmallError> {
        let result = (|| {
            let pid = HeapPageID::new(self.table_id, tid.block);
            let page_pod = Database::buffer_pool().get_page(tx, Permission::ReadOnly, &pid)?;

            let page = page_pod.rl();
            page.get_tuple(tid.slot, &self.schema)
        })();

        Database::mut_concurrent_status().release_statement_locks(tx);
        result
    }

    pub fn iter<'a>(&'a self, tx: &'a Transaction) -> HeapTableIterator<'a> {
        HeapTableIterator {
            tx,
            table: self,
            block: 0,
            slot: 0,
        }
    }

    /// Count the tuples this transaction should see. A simplified
    /// visibility check, enough for tests: hint bits are trusted, the
    /// status oracle resolves the rest.
    pub fn visible_tuples_count(&self, tx: &Transaction) -> usize {
        use crate::storage::tuple::{MOVED_IN, MOVED_OFF, XMIN_COMMITTED, XMIN_INVALID};

        // collect first: the iterator latches pages, and latching must
        // not run under the status-table guard
        let tuples: Vec<_> = self.iter(tx).collect();
        Database::mut_concurrent_status().release_statement_locks(tx);

        let concurrent_status = Database::concurrent_status();
        let mut count = 0;

        for (_, tuple) in tuples {
            if tuple.is_set(XMIN_INVALID) {
                continue;
            }
            if tuple.is_set(MOVED_OFF) && concurrent_status.did_commit(tuple.cmd) {
                continue;
            }
            if tuple.is_set(MOVED_IN)
                && !tuple.is_set(XMIN_COMMITTED)
                && !concurrent_status.did_commit(tuple.cmd)
            {
                continue;
            }
            if !tuple.is_set(XMIN_COMMITTED)
                && tuple.xmin != tx.get_id()
                && !concurrent_status.did_commit(tuple.xmin)
            {
                continue;
            }
            if tuple.xmax != INVALID_XID
                && !tuple.is_set(XMAX_INVALID)
                && !tuple.is_set(MARKED_FOR_UPDATE)
                && (tuple.is_set(XMAX_COMMITTED)
                    || tuple.xmax == tx.get_id()
                    || concurrent_status.did_commit(tuple.xmax))
            {
                continue;
            }

            count += 1;
        }

        count
    }
}

pub struct HeapTableIterator<'a> {
    tx: &'a Transaction,
    table: &'a HeapTable,
    block: u32,
    slot: u16,
}

impl<'a> Iterator for HeapTableIterator<'a> {
    type Item = (TupleId, HeapTuple);

    fn next(&mut self) -> Option<Self::Item> {
        let num_pages = self.table.num_pages();

        while self.block < num_pages {
            let pid = HeapPageID::new(self.table.get_id(), self.block);
            let page_pod = Database::buffer_pool()
                .get_page(self.tx, Permission::ReadOnly, &pid)
                .ok()?;
            let page = page_pod.rl();

            if page.is_new() {
                self.block += 1;
                self.slot = 0;
                continue;
            }

            while (self.slot as usize) < page.slot_count() {
                let slot = self.slot;
                self.slot += 1;

                if page.is_slot_used(slot) {
                    let tuple = page.get_tuple(slot, &self.table.schema).ok()?;
                    return Some((TupleId::new(self.block, slot), tuple));
                }
            }

            self.block += 1;
            self.slot = 0;
        }

        None
    }
}
