//! The vacuum/reclaim engine.
//!
//! One logical operation spread across multiple transactions: scan a
//! relation and classify every tuple, compact live tuples toward the
//! front of the file, keep the secondary indexes consistent with the
//! motions, overwrite the relation statistics in place, and give
//! trailing empty pages back to the storage manager. No database-wide
//! lock is ever taken; the engine serializes per relation with a
//! share-exclusive lock and per cluster with a lock file.

mod index_sync;
pub mod page_list;
mod repair;
mod scan;

use std::{
    fs::{self, OpenOptions},
    io,
    path::PathBuf,
    sync::atomic::{AtomicBool, Ordering},
    time::Instant,
};

use log::{debug, error, info, warn};

use crate::{
    error::{ErrorKind, SmallError},
    storage::heap_page::HeapPageID,
    transaction::{ConcurrentStatus, Permission, RelationLock, Transaction},
    types::SmallResult,
    utils::HandyRwLock,
    vacuum::page_list::VacPageList,
    Database, RelationKind,
};

pub use scan::VacRelStats;

static CANCEL: AtomicBool = AtomicBool::new(false);

/// Ask a running vacuum to stop. The engine polls this between pages
/// in the scan and between chains in the compaction loop, finishes
/// the piece it is on, then unwinds through the ordinary abort hook.
pub fn request_cancel() {
    CANCEL.store(true, Ordering::SeqCst);
}

pub(crate) fn check_cancel() -> SmallResult {
    if CANCEL.load(Ordering::SeqCst) {
        return Err(SmallError::new(
            ErrorKind::Cancelled,
            "vacuum cancelled by request",
        ));
    }
    Ok(())
}

/// The process-wide vacuum lock: exclusive creation of a lock file at
/// start, unlink on drop. Dropping on every exit path is what the
/// failure hook of the engine amounts to.
struct VacuumLock {
    path: PathBuf,
}

impl VacuumLock {
    fn acquire() -> Result<Self, SmallError> {
        let path = Database::global().vacuum_lock_path();

        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => Ok(Self { path }),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(SmallError::new(
                ErrorKind::AnotherVacuumRunning,
                &format!("vacuum lock file {:?} exists", path),
            )),
            Err(e) => Err(SmallError::io(&e.to_string())),
        }
    }
}

impl Drop for VacuumLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[derive(Copy, Clone, PartialEq, Debug)]
enum VacuumState {
    Idle,
    ListBuilt,
    Scanning,
    Compacting,
    IndexSync,
    Truncated,
    Aborting,
}

struct VacuumContext {
    state: VacuumState,
}

impl VacuumContext {
    fn new() -> Self {
        Self {
            state: VacuumState::Idle,
        }
    }

    fn set_state(&mut self, state: VacuumState) {
        debug!("vacuum state: {:?} -> {:?}", self.state, state);
        self.state = state;
    }
}

/// The single entry point.
///
/// `target` of `None` means every ordinary table. `analyze` refreshes
/// the statistics row from the scan results; per-column extended
/// statistics are not computed here, so a supplied `column_list` is
/// only validated and reported.
pub fn vacuum(
    target: Option<&str>,
    verbose: bool,
    analyze: bool,
    column_list: Option<Vec<String>>,
) -> SmallResult {
    if column_list.is_some() && !analyze {
        return Err(SmallError::internal(
            "a column list can only be given in analyze mode",
        ));
    }

    if let Some(xid) = Transaction::session_active() {
        return Err(SmallError::new(
            ErrorKind::InTransactionBlock,
            &format!("vacuum cannot run inside transaction {}", xid),
        ));
    }

    CANCEL.store(false, Ordering::SeqCst);

    // one vacuum per cluster
    let _lock = VacuumLock::acquire()?;

    let mut ctx = VacuumContext::new();

    let targets = build_relation_list(target)?;
    ctx.set_state(VacuumState::ListBuilt);

    if let Some(columns) = &column_list {
        info!("analyze: per-column statistics not kept, ignoring column list {:?}", columns);
    }

    for rel_id in targets {
        check_cancel()?;
        vacuum_rel(&mut ctx, rel_id, verbose, analyze)?;
    }

    ctx.set_state(VacuumState::Idle);
    Ok(())
}

/// Enumerate the target relations under a transaction of their own.
/// The transaction commits before any per-relation work starts; the
/// returned list outlives it.
fn build_relation_list(target: Option<&str>) -> Result<Vec<u32>, SmallError> {
    let tx = Transaction::new();

    let result = {
        let catalog = Database::catalog();
        match target {
            Some(name) => match catalog.get_table_by_name(name) {
                Some(table_pod) => Ok(vec![table_pod.rl().get_id()]),
                None => Err(SmallError::new(
                    ErrorKind::RelationNotFound,
                    &format!("relation \"{}\" does not exist", name),
                )),
            },
            None => {
                let mut ids = Vec::new();
                for (id, kind) in catalog.enumerate_relations() {
                    if kind != RelationKind::Table {
                        warn!("skipping relation {}: not an ordinary table ({:?})", id, kind);
                        continue;
                    }
                    ids.push(id);
                }
                Ok(ids)
            }
        }
    };

    tx.commit()?;
    result
}

/// One relation pass, one (sometimes two) transactions.
fn vacuum_rel(ctx: &mut VacuumContext, rel_id: u32, verbose: bool, analyze: bool) -> SmallResult {
    let tx = Transaction::new();
    let mut cont: Option<Transaction> = None;

    let result = run_rel_pass(ctx, &tx, &mut cont, rel_id, verbose, analyze);

    if let Err(ref e) = result {
        ctx.set_state(VacuumState::Aborting);
        error!("vacuum of relation {} failed: {}", rel_id, e);

        if let Some(cont_tx) = cont.take() {
            cont_tx.abort().ok();
        }

        // the move batch, once committed, stays committed; only give
        // the relation lock back. An uncommitted pass rolls back whole.
        if Database::concurrent_status().did_commit(tx.get_id()) {
            Database::mut_concurrent_status().release_relation_locks(&tx);
        } else {
            tx.abort().ok();
        }

        ctx.set_state(VacuumState::Idle);
    }

    result
}

fn run_rel_pass(
    ctx: &mut VacuumContext,
    tx: &Transaction,
    cont: &mut Option<Transaction>,
    rel_id: u32,
    verbose: bool,
    analyze: bool,
) -> SmallResult {
    let table_pod = Database::catalog().get_table(rel_id).ok_or_else(|| {
        SmallError::new(
            ErrorKind::RelationNotFound,
            &format!("relation {} disappeared from the catalog", rel_id),
        )
    })?;
    let table = table_pod.rl();

    // held for the whole pass, across the partial commit
    ConcurrentStatus::request_relation_lock(tx, &RelationLock::ShareExclusive, rel_id)?;

    // the recently-dead cutoff, captured once per pass
    let xmax_recent = Database::concurrent_status()
        .oldest_active_xid(tx.get_id())
        .unwrap_or_else(|| tx.get_id());

    let started = Instant::now();

    ctx.set_state(VacuumState::Scanning);
    let (mut stats, reclaim, mut fragmented) = scan::scan_heap(tx, &table, xmax_recent)?;

    let indexes = Database::catalog().get_indexes(rel_id);
    stats.has_index = !indexes.is_empty();
    let expected_live = stats.num_tuples + stats.keep_tuples;

    // Index sync, first round: entries of tuples the scan found dead.
    // This runs before any move so a destination slot can never alias
    // an entry that is still waiting to be cleaned.
    ctx.set_state(VacuumState::IndexSync);
    for index_pod in &indexes {
        index_sync::sync_index(index_pod, &reclaim, expected_live)?;
    }

    let mut num_moved = 0;
    let mut checked = VacPageList::new();
    if stats.do_shrinking && !fragmented.is_empty() {
        ctx.set_state(VacuumState::Compacting);
        let (n_list, moved) =
            repair::repair_frag(tx, &table, &stats, &reclaim, &mut fragmented, xmax_recent)?;
        checked = n_list;
        num_moved = moved;

        // the move transaction is committed; the rest of the pass runs
        // under a continuation transaction
        *cont = Some(Transaction::new());
    }

    let work_tx: &Transaction = cont.as_ref().unwrap_or(tx);

    if num_moved > 0 {
        repair::finish_moves(work_tx, &table, &checked, tx.get_id())?;

        // second round: entries left behind by the moves
        ctx.set_state(VacuumState::IndexSync);
        for index_pod in &indexes {
            index_sync::sync_index(index_pod, &checked, expected_live)?;
        }
    }

    // make the reclaimed space physical
    repair::apply_reclaim(work_tx, &table, &reclaim)?;
    if num_moved > 0 {
        repair::apply_reclaim(work_tx, &table, &checked)?;
    }

    // truncation: everything down to disk first
    ctx.set_state(VacuumState::Truncated);
    Database::buffer_pool().flush_relation(rel_id);
    let old_pages = table.num_pages();
    let new_pages = truncate_trailing(work_tx, &table)?;

    // statistics go last, after all buffers are flushed
    stats.num_pages = new_pages;
    Database::catalog().update_stats_in_place(rel_id, new_pages, stats.num_tuples, stats.has_index)?;

    if analyze {
        debug!("analyze: statistics row refreshed for {}", table.name);
    }

    if verbose {
        info!(
            "vacuum of {}: pages {} -> {}, live {}, kept {}, removed {}, moved {}, elapsed {:?}",
            table.name,
            old_pages,
            new_pages,
            stats.num_tuples,
            stats.keep_tuples,
            stats.num_dead,
            num_moved,
            started.elapsed(),
        );
    }

    match cont.take() {
        Some(cont_tx) => {
            cont_tx.commit()?;
            // the lock that spanned the partial commit goes last
            Database::mut_concurrent_status().release_relation_locks(tx);
        }
        None => {
            tx.commit()?;
        }
    }

    ctx.set_state(VacuumState::Idle);
    Ok(())
}

/// Count the trailing run of empty pages and release it back to the
/// storage manager.
fn truncate_trailing(tx: &Transaction, table: &crate::HeapTable) -> Result<u32, SmallError> {
    let old_pages = table.num_pages();
    let mut new_pages = old_pages;

    while new_pages > 0 {
        let pid = HeapPageID::new(table.get_id(), new_pages - 1);
        let page_pod = Database::buffer_pool().get_page(tx, Permission::ReadOnly, &pid)?;
        let page = page_pod.rl();

        if page.is_new() || page.is_empty() {
            new_pages -= 1;
        } else {
            break;
        }
    }

    if new_pages < old_pages {
        for block in new_pages..old_pages {
            Database::buffer_pool().discard_page(&HeapPageID::new(table.get_id(), block));
        }
        table.truncate(new_pages)?;
        debug!(
            "truncated {} from {} to {} pages",
            table.name, old_pages, new_pages
        );
    }

    Ok(new_pages)
}
