use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, RwLock,
};

use log::debug;

use crate::{
    error::SmallError,
    storage::heap_page::{HeapPage, HeapPageID},
    transaction::{ConcurrentStatus, Permission, Transaction},
    types::{ConcurrentHashMap, Pod, ResultPod},
    utils::HandyRwLock,
    Database,
};

pub const DEFAULT_PAGE_SIZE: usize = 4096;
static PAGE_SIZE: AtomicUsize = AtomicUsize::new(DEFAULT_PAGE_SIZE);

/// Page cache over the heap files.
///
/// A held `Pod<HeapPage>` is the pin: the frame cannot be dropped
/// from under the holder. The page's `RwLock` is the page lock; every
/// mutation happens inside a guard scope, so the unlock runs on every
/// exit path.
pub struct BufferPool {
    buffer: ConcurrentHashMap<HeapPageID, Pod<HeapPage>>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            buffer: ConcurrentHashMap::new(),
        }
    }

    pub fn clear(&self) {
        self.buffer.clear();
    }

    /// Retrieve the page with the associated permission. Latches the
    /// page through `ConcurrentStatus` first (blocking), then loads it
    /// from disk on a cache miss.
    pub fn get_page(
        &self,
        tx: &Transaction,
        perm: Permission,
        pid: &HeapPageID,
    ) -> ResultPod<HeapPage> {
        ConcurrentStatus::request_latch(tx, &perm.to_lock(), pid)?;

        if perm == Permission::ReadWrite {
            Database::mut_concurrent_status().set_dirty_page(tx, pid);
        }

        self.buffer.get_or_insert(pid, |pid| Self::load_page(pid))
    }

    fn load_page(pid: &HeapPageID) -> ResultPod<HeapPage> {
        // stage 1: get table
        let catalog = Database::catalog();
        let table_pod = catalog.get_table(pid.get_table_id()).ok_or_else(|| {
            SmallError::internal(&format!("table {} not found", pid.get_table_id()))
        })?;
        let table = table_pod.rl();

        // stage 2: read page content from disk
        let buf = table.read_page_bytes(pid.page_index)?;

        // stage 3: page instantiation
        let page = HeapPage::new(pid, &buf)?;

        return Ok(Arc::new(RwLock::new(page)));
    }

    /// Write the content of a specific page back to its heap file.
    pub fn flush_page(&self, pid: &HeapPageID) {
        let page_pod = match self.buffer.get(pid) {
            Some(v) => v,
            None => return,
        };

        let catalog = Database::catalog();
        let table_pod = catalog.get_table(pid.get_table_id()).unwrap();
        let table = table_pod.rl();

        debug!("flushing page {:?}", pid);
        page_pod.rl().write_to_table(&table).unwrap();
    }

    /// Write all pages dirtied by the transaction to disk.
    pub fn flush_pages(&self, tx: &Transaction) {
        for pid in Database::concurrent_status().get_dirty_pages(tx) {
            self.flush_page(&pid);
        }
    }

    /// Write every cached page of one relation to disk.
    pub fn flush_relation(&self, table_id: u32) {
        for pid in self.buffer.keys() {
            if pid.get_table_id() == table_id {
                self.flush_page(&pid);
            }
        }
    }

    pub fn flush_all_pages(&self) {
        for pid in self.buffer.keys() {
            self.flush_page(&pid);
        }
    }

    /// Remove the specific page id from the buffer pool.
    ///
    /// Needed when a rolled-back or truncated page must not be served
    /// from the cache again.
    pub fn discard_page(&self, pid: &HeapPageID) {
        self.buffer.remove(pid);
    }

    pub fn all_keys(&self) -> Vec<HeapPageID> {
        self.buffer.keys()
    }

    pub fn set_page_size(page_size: usize) {
        PAGE_SIZE.store(page_size, Ordering::Relaxed);
    }

    pub fn get_page_size() -> usize {
        PAGE_SIZE.load(Ordering::Relaxed)
    }
}
