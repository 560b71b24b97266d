use core::fmt;
use std::{
    collections::{HashMap, HashSet},
    thread::sleep,
    time::Instant,
};

use crate::{
    error::{ErrorKind, SmallError},
    storage::heap_page::HeapPageID,
    transaction::{Transaction, TransactionID, TransactionStatus},
    types::SmallResult,
    Database,
};

static TIMEOUT: u64 = 3;

#[derive(Debug, PartialEq)]
pub enum Lock {
    XLock,
    SLock,
}

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum Permission {
    ReadOnly,
    ReadWrite,
}

impl Permission {
    pub fn to_lock(&self) -> Lock {
        match self {
            Permission::ReadOnly => Lock::SLock,
            Permission::ReadWrite => Lock::XLock,
        }
    }
}

/// Relation-level lock modes.
///
/// `ShareExclusive` is what a vacuum pass holds: it admits readers,
/// conflicts with writers and with other vacuums.
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum RelationLock {
    Share,
    ShareExclusive,
    Exclusive,
}

impl RelationLock {
    fn conflicts_with(&self, other: &RelationLock) -> bool {
        match (self, other) {
            (RelationLock::Share, RelationLock::Share) => false,
            (RelationLock::Share, RelationLock::ShareExclusive) => false,
            (RelationLock::ShareExclusive, RelationLock::Share) => false,
            _ => true,
        }
    }
}

/// All cross-transaction bookkeeping: page latches, relation locks,
/// dirty-page tracking, and the transaction-status table.
///
/// The status table is the transaction-status oracle: given a
/// transaction id it answers running / aborted / committed. The idea
/// is from PostgreSQL. An id it has never seen belongs to a crashed
/// writer, which is neither of the three.
pub struct ConcurrentStatus {
    s_latch_map: HashMap<HeapPageID, HashSet<TransactionID>>,
    x_latch_map: HashMap<HeapPageID, TransactionID>,

    hold_pages: HashMap<TransactionID, HashSet<HeapPageID>>,

    dirty_pages: HashMap<TransactionID, HashSet<HeapPageID>>,

    relation_locks: HashMap<u32, Vec<(TransactionID, RelationLock)>>,
    hold_relations: HashMap<TransactionID, HashSet<u32>>,

    transaction_status: HashMap<TransactionID, TransactionStatus>,
}

impl ConcurrentStatus {
    pub fn new() -> Self {
        Self {
            s_latch_map: HashMap::new(),
            x_latch_map: HashMap::new(),
            hold_pages: HashMap::new(),

            dirty_pages: HashMap::new(),

            relation_locks: HashMap::new(),
            hold_relations: HashMap::new(),

            transaction_status: HashMap::new(),
        }
    }
}

// latch / lock acquisition
impl ConcurrentStatus {
    /// Request a latch on the given page. This api is blocking.
    pub(crate) fn request_latch(
        tx: &Transaction,
        lock: &Lock,
        page_id: &HeapPageID,
    ) -> SmallResult {
        let start_time = Instant::now();
        while Instant::now().duration_since(start_time).as_secs() < TIMEOUT {
            // acquire RwLock on "concurrent_status"
            {
                let mut concurrent_status = Database::mut_concurrent_status();
                if concurrent_status.add_latch(tx, lock, page_id) {
                    return Ok(());
                }
            }
            // release RwLock on "concurrent_status"

            sleep(std::time::Duration::from_millis(10));
        }

        let err_msg = format!(
            "acquire latch timeout, args: {:?}, {:?}, {:?}, concurrent status: {:?}",
            tx,
            lock,
            page_id,
            Database::concurrent_status(),
        );
        let err = SmallError::new(ErrorKind::LockTimeout, &err_msg);
        err.show_backtrace();
        return Err(err);
    }

    // Add a latch to the given page. This api is idempotent.
    //
    // # Return
    //
    // Return a bool value to indicate whether the latch is added
    // successfully.
    fn add_latch(&mut self, tx: &Transaction, lock: &Lock, page_id: &HeapPageID) -> bool {
        // If the page is held by another transaction with X-Latch,
        // fail the request.
        if let Some(v) = self.x_latch_map.get(page_id) {
            if *v != tx.get_id() {
                return false;
            }
        }

        match lock {
            Lock::SLock => {
                self.s_latch_map
                    .entry(*page_id)
                    .or_insert_with(HashSet::new)
                    .insert(tx.get_id());
            }
            Lock::XLock => {
                // If the page is held by another transaction with
                // S-Latch, fail the request.
                if let Some(holders) = self.s_latch_map.get(page_id) {
                    for holder in holders {
                        if *holder != tx.get_id() {
                            return false;
                        }
                    }
                }

                self.x_latch_map.insert(*page_id, tx.get_id());
            }
        }

        self.hold_pages
            .entry(tx.get_id())
            .or_insert_with(HashSet::new)
            .insert(*page_id);
        return true;
    }

    /// Request a relation-level lock. This api is blocking.
    pub(crate) fn request_relation_lock(
        tx: &Transaction,
        lock: &RelationLock,
        table_id: u32,
    ) -> SmallResult {
        let start_time = Instant::now();
        while Instant::now().duration_since(start_time).as_secs() < TIMEOUT {
            {
                let mut concurrent_status = Database::mut_concurrent_status();
                if concurrent_status.add_relation_lock(tx, lock, table_id) {
                    return Ok(());
                }
            }

            sleep(std::time::Duration::from_millis(10));
        }

        let err_msg = format!(
            "acquire relation lock timeout, args: {:?}, {:?}, table: {}",
            tx, lock, table_id,
        );
        let err = SmallError::new(ErrorKind::LockTimeout, &err_msg);
        err.show_backtrace();
        return Err(err);
    }

    fn add_relation_lock(&mut self, tx: &Transaction, lock: &RelationLock, table_id: u32) -> bool {
        let holders = self.relation_locks.entry(table_id).or_insert_with(Vec::new);

        for (holder, held) in holders.iter() {
            if *holder != tx.get_id() && lock.conflicts_with(held) {
                return false;
            }
        }

        // re-request by the same transaction upgrades in place
        holders.retain(|(holder, _)| *holder != tx.get_id());
        holders.push((tx.get_id(), *lock));

        self.hold_relations
            .entry(tx.get_id())
            .or_insert_with(HashSet::new)
            .insert(table_id);
        return true;
    }
}

// release paths
impl ConcurrentStatus {
    /// Release everything the transaction holds: latches, relation
    /// locks, dirty-page tracking.
    pub(crate) fn remove_relation(&mut self, tx: &Transaction) {
        self.dirty_pages.remove(&tx.get_id());
        self.release_latches(tx);
        self.release_relation_locks(tx);
    }

    /// Like `remove_relation`, but relation locks survive. Used by the
    /// partial commit of the vacuum engine.
    pub(crate) fn remove_relation_keep_locks(&mut self, tx: &Transaction) {
        self.dirty_pages.remove(&tx.get_id());
        self.release_latches(tx);
    }

    /// Give back the latches and relation locks a heap statement took,
    /// keeping the dirty-page tracking so commit still flushes. Page
    /// latches are held for the duration of one page interaction, not
    /// for the transaction.
    pub(crate) fn release_statement_locks(&mut self, tx: &Transaction) {
        self.release_latches(tx);
        self.release_relation_locks(tx);
    }

    fn release_latches(&mut self, tx: &Transaction) {
        let hold_pages = match self.hold_pages.remove(&tx.get_id()) {
            Some(v) => v,
            None => return,
        };

        for page_id in hold_pages {
            self.release_latch(tx, &page_id);
        }
    }

    pub(crate) fn release_latch(&mut self, tx: &Transaction, page_id: &HeapPageID) {
        if let Some(v) = self.s_latch_map.get_mut(page_id) {
            v.remove(&tx.get_id());
            if v.len() == 0 {
                self.s_latch_map.remove(page_id);
            }
        }

        if let Some(holder) = self.x_latch_map.get(page_id) {
            if *holder == tx.get_id() {
                self.x_latch_map.remove(page_id);
            }
        }
    }

    pub(crate) fn release_relation_locks(&mut self, tx: &Transaction) {
        let hold_relations = match self.hold_relations.remove(&tx.get_id()) {
            Some(v) => v,
            None => return,
        };

        for table_id in hold_relations {
            if let Some(holders) = self.relation_locks.get_mut(&table_id) {
                holders.retain(|(holder, _)| *holder != tx.get_id());
                if holders.is_empty() {
                    self.relation_locks.remove(&table_id);
                }
            }
        }
    }
}

// dirty-page tracking
impl ConcurrentStatus {
    pub(crate) fn set_dirty_page(&mut self, tx: &Transaction, page_id: &HeapPageID) {
        self.dirty_pages
            .entry(tx.get_id())
            .or_insert_with(HashSet::new)
            .insert(*page_id);
    }

    pub(crate) fn get_dirty_pages(&self, tx: &Transaction) -> HashSet<HeapPageID> {
        return self
            .dirty_pages
            .get(&tx.get_id())
            .cloned()
            .unwrap_or_default();
    }
}

// the transaction-status oracle
impl ConcurrentStatus {
    pub(crate) fn set_transaction_status(&mut self, id: TransactionID, status: TransactionStatus) {
        self.transaction_status.insert(id, status);
    }

    pub fn did_commit(&self, id: TransactionID) -> bool {
        self.transaction_status.get(&id) == Some(&TransactionStatus::Committed)
    }

    pub fn did_abort(&self, id: TransactionID) -> bool {
        self.transaction_status.get(&id) == Some(&TransactionStatus::Aborted)
    }

    pub fn in_progress(&self, id: TransactionID) -> bool {
        self.transaction_status.get(&id) == Some(&TransactionStatus::Active)
    }

    /// The smallest transaction id still running, `exclude` aside.
    /// The vacuum driver captures this once per relation pass as its
    /// recently-dead cutoff.
    pub fn oldest_active_xid(&self, exclude: TransactionID) -> Option<TransactionID> {
        self.transaction_status
            .iter()
            .filter(|(id, status)| **status == TransactionStatus::Active && **id != exclude)
            .map(|(id, _)| *id)
            .min()
    }

    pub fn clear(&mut self) {
        self.s_latch_map.clear();
        self.x_latch_map.clear();
        self.hold_pages.clear();
        self.dirty_pages.clear();
        self.relation_locks.clear();
        self.hold_relations.clear();
        self.transaction_status.clear();
    }
}

impl fmt::Display for ConcurrentStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut depiction = "\n".to_string();

        // s_latch_map
        depiction.push_str("s_latch_map: {");
        for (k, v) in self.s_latch_map.iter() {
            depiction.push_str(&format!("\n\t{:?} -> {:?}, ", k.get_short_repr(), v));
        }
        depiction.push_str("\n}\n");

        // x_latch_map
        depiction.push_str("x_latch_map: {");
        for (k, v) in self.x_latch_map.iter() {
            depiction.push_str(&format!("\n\t{:?} -> {:?}, ", k.get_short_repr(), v));
        }
        depiction.push_str("\n}\n");

        // relation_locks
        depiction.push_str("relation_locks: {");
        for (k, v) in self.relation_locks.iter() {
            depiction.push_str(&format!("\n\t{} -> {:?}, ", k, v));
        }
        depiction.push_str("\n}\n");

        return write!(f, "{}", depiction);
    }
}

impl fmt::Debug for ConcurrentStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        return write!(f, "{}", self);
    }
}
