use core::fmt;
use std::{
    cell::Cell,
    sync::atomic::{AtomicU32, Ordering},
};

use crate::{types::SmallResult, Database};

#[derive(Clone, Copy, PartialEq, Debug)]
pub enum TransactionStatus {
    Active,
    Aborted,
    Committed,
}

pub type TransactionID = u32;

pub const TRANSACTION_ID_BYTES: usize = 4;

static TRANSACTION_ID: AtomicU32 = AtomicU32::new(1);

thread_local! {
    // The transaction this session currently has open, if any. Used
    // by entry points that refuse to run inside a caller transaction.
    static SESSION_TX: Cell<Option<TransactionID>> = Cell::new(None);
}

#[derive(Clone)]
pub struct Transaction {
    // increase monotonically by 1
    id: TransactionID,

    // command counter within the transaction
    cid: Cell<u32>,
}

impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Transaction {}

impl Transaction {
    pub fn new() -> Self {
        let id = TRANSACTION_ID.fetch_add(1, Ordering::Relaxed);
        let instance = Self {
            id,
            cid: Cell::new(0),
        };
        instance.start().unwrap();

        Database::mut_concurrent_status().set_transaction_status(id, TransactionStatus::Active);

        SESSION_TX.with(|v| v.set(Some(id)));

        instance
    }

    fn start(&self) -> SmallResult {
        Database::mut_log_manager().log_start(self)
    }

    /// The transaction the calling thread currently has open.
    pub fn session_active() -> Option<TransactionID> {
        SESSION_TX.with(|v| v.get())
    }

    pub fn commit(&self) -> SmallResult {
        // step 1: flush all pages dirtied by this transaction to disk
        //
        // (this is a disk operation, hence should be put before the
        // "COMMIT" record is written)
        Database::buffer_pool().flush_pages(self);

        // step 2: write "COMMIT" log record
        Database::mut_log_manager().log_commit(self)?;

        // step 3: release latches and relation locks
        //
        // (this is a memory operation, hence can be put after the
        // "COMMIT" record is written)
        Database::mut_concurrent_status().remove_relation(self);

        Database::mut_concurrent_status()
            .set_transaction_status(self.id, TransactionStatus::Committed);

        SESSION_TX.with(|v| v.set(None));

        Ok(())
    }

    /// Commit, but keep this transaction's relation locks.
    ///
    /// This violates ordinary transaction scoping on purpose: the
    /// vacuum engine calls it exactly once per relation pass, at the
    /// boundary between the move batch and the index-sync work, so the
    /// share-exclusive relation lock spans the commit. Nothing else
    /// should call it.
    pub fn commit_keeping_locks(&self) -> SmallResult {
        Database::buffer_pool().flush_pages(self);

        Database::mut_log_manager().log_commit(self)?;

        // page latches go, relation locks stay
        Database::mut_concurrent_status().remove_relation_keep_locks(self);

        Database::mut_concurrent_status()
            .set_transaction_status(self.id, TransactionStatus::Committed);

        SESSION_TX.with(|v| v.set(None));

        Ok(())
    }

    pub fn abort(&self) -> SmallResult {
        // step 1: write "ABORT" log record
        Database::mut_log_manager().log_abort(self)?;

        // step 2: discard all dirty pages, so later readers reload the
        // on-disk state
        for pid in Database::concurrent_status().get_dirty_pages(self) {
            Database::buffer_pool().discard_page(&pid);
        }

        // step 3: release latches and relation locks
        Database::mut_concurrent_status().remove_relation(self);

        Database::mut_concurrent_status()
            .set_transaction_status(self.id, TransactionStatus::Aborted);

        SESSION_TX.with(|v| v.set(None));

        Ok(())
    }

    pub fn get_id(&self) -> TransactionID {
        self.id
    }

    pub fn current_cid(&self) -> u32 {
        self.cid.get()
    }

    /// Start a new command within the transaction.
    pub fn advance_cid(&self) {
        self.cid.set(self.cid.get() + 1);
    }
}

impl std::hash::Hash for Transaction {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "tx_{}", self.id)
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        return write!(f, "{}", self);
    }
}
