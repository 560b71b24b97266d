use itertools::Itertools;
use log::{debug, warn};

use crate::{
    error::SmallError,
    storage::{
        heap_file::HeapTable,
        heap_page::{HeapPage, HeapPageID},
        tuple::{
            TupleId, INVALID_XID, MARKED_FOR_UPDATE, XMAX_COMMITTED, XMAX_INVALID, XMIN_COMMITTED,
            XMIN_INVALID,
        },
    },
    transaction::{Permission, Transaction, TransactionID},
    utils::HandyRwLock,
    vacuum::page_list::{TupleLinkTable, VacPage, VacPageList},
    Database,
};

/// Accumulators for one relation pass.
pub struct VacRelStats {
    pub rel_id: u32,

    pub num_pages: u32,

    /// Live tuples.
    pub num_tuples: u64,

    /// Recently-dead and in-progress tuples that must be kept.
    pub keep_tuples: u64,

    /// Tuples whose space the pass reclaims.
    pub num_dead: u64,

    pub min_tlen: usize,
    pub max_tlen: usize,

    pub has_index: bool,

    /// Cleared when an in-progress inserter or deleter is seen; the
    /// compaction step is skipped for this relation.
    pub do_shrinking: bool,

    pub vtlinks: TupleLinkTable,
}

impl VacRelStats {
    fn new(rel_id: u32) -> Self {
        Self {
            rel_id,
            num_pages: 0,
            num_tuples: 0,
            keep_tuples: 0,
            num_dead: 0,
            min_tlen: usize::MAX,
            max_tlen: 0,
            has_index: false,
            do_shrinking: true,
            vtlinks: TupleLinkTable::new(),
        }
    }
}

/// First pass over the heap: classify every tuple, set hint bits,
/// and build the two page lists.
///
/// The real pages are only modified by hint-bit writes here. Dead
/// tuples are repacked on a temporary copy of their page, so the
/// recorded free-space figures describe the state the repair step
/// will produce.
pub(crate) fn scan_heap(
    tx: &Transaction,
    table: &HeapTable,
    xmax_recent: TransactionID,
) -> Result<(VacRelStats, VacPageList, VacPageList), SmallError> {
    let schema = table.get_schema();
    let nblocks = table.num_pages();

    let mut stats = VacRelStats::new(table.get_id());
    let mut reclaim = VacPageList::new();
    let mut fragmented = VacPageList::new();

    // length of the current run of pages with nothing to keep
    let mut empty_run: u32 = 0;

    for blk in 0..nblocks {
        super::check_cancel()?;

        let pid = HeapPageID::new(table.get_id(), blk);
        let page_pod = Database::buffer_pool().get_page(tx, Permission::ReadWrite, &pid)?;

        let mut vacpage = VacPage::new(blk, 0);
        let mut page_changed = false;
        let mut scratch: Option<HeapPage> = None;
        let mut live_lengths: Vec<usize> = Vec::new();
        let mut keep_on_page: u64 = 0;

        // hold the page
        {
            let mut page = page_pod.wl();

            if page.is_new() {
                warn!("relation {}: uninitialized page {}, fixing", table.name, blk);
                page.format();

                vacpage.free = page.free_space();
                reclaim.push(vacpage);
                empty_run += 1;

                drop(page);
                Database::buffer_pool().flush_page(&pid);
                continue;
            }

            for slot in page.used_slots() {
                let mut tuple = page.get_tuple(slot, schema)?;
                let tlen = tuple.encoded_len();

                let mut dead = false;
                let mut keep = false;
                let mut hint_changed = false;

                let concurrent_status = Database::concurrent_status();

                if !tuple.is_set(XMIN_COMMITTED) {
                    if tuple.is_set(XMIN_INVALID) {
                        dead = true;
                    } else if concurrent_status.did_commit(tuple.xmin) {
                        tuple.set_flag(XMIN_COMMITTED);
                        hint_changed = true;
                    } else if concurrent_status.did_abort(tuple.xmin) {
                        dead = true;
                    } else if concurrent_status.in_progress(tuple.xmin) {
                        // an open inserter: the tuple stays, and no
                        // tuple of this relation may be moved this pass
                        warn!(
                            "relation {}: tuple ({},{}) has in-progress inserter {}, \
                             compaction disabled for this pass",
                            table.name, blk, slot, tuple.xmin,
                        );
                        stats.do_shrinking = false;
                        keep = true;
                    } else {
                        // the inserter is neither committed, aborted
                        // nor running: a crashed writer
                        dead = true;
                    }
                }

                if !dead && !keep && tuple.xmax != INVALID_XID && !tuple.is_set(XMAX_INVALID) {
                    if !tuple.is_set(XMAX_COMMITTED) {
                        if concurrent_status.did_commit(tuple.xmax) {
                            tuple.set_flag(XMAX_COMMITTED);
                            hint_changed = true;
                        } else if concurrent_status.did_abort(tuple.xmax) {
                            tuple.set_flag(XMAX_INVALID);
                            hint_changed = true;
                        } else if concurrent_status.in_progress(tuple.xmax) {
                            warn!(
                                "relation {}: tuple ({},{}) has in-progress deleter {}, \
                                 compaction disabled for this pass",
                                table.name, blk, slot, tuple.xmax,
                            );
                            stats.do_shrinking = false;
                        } else {
                            // crashed deleter
                            tuple.set_flag(XMAX_INVALID);
                            hint_changed = true;
                        }
                    }

                    if tuple.is_set(XMAX_COMMITTED) {
                        if tuple.is_set(MARKED_FOR_UPDATE) {
                            // a lock record, not a delete: keep the
                            // tuple, clear the lock bits
                            tuple.clear_flag(MARKED_FOR_UPDATE | XMAX_COMMITTED);
                            tuple.set_flag(XMAX_INVALID);
                            hint_changed = true;
                        } else if tuple.xmax >= xmax_recent {
                            // recently dead: a concurrent transaction
                            // may still need to see it
                            keep = true;
                        } else {
                            dead = true;
                        }
                    }
                }

                drop(concurrent_status);

                if dead {
                    let scratch_page = scratch.get_or_insert_with(|| page.clone());
                    scratch_page.mark_slot_unused(slot);
                    vacpage.unused_slots.push(slot);
                    stats.num_dead += 1;
                    continue;
                }

                if keep {
                    keep_on_page += 1;
                    stats.keep_tuples += 1;
                } else {
                    live_lengths.push(tlen);
                    stats.num_tuples += 1;
                }

                if hint_changed {
                    page.set_tuple_header(slot, &tuple)?;
                    page_changed = true;
                }

                let self_tid = TupleId::new(blk, slot);
                if tuple.points_elsewhere(&self_tid) {
                    stats.vtlinks.push(tuple.ctid, self_tid);
                }
            }

            // the free figure describes the page as it will look once
            // its dead tuples are reclaimed
            vacpage.free = match scratch {
                Some(ref mut scratch_page) => {
                    scratch_page.compact();
                    scratch_page.free_space()
                }
                None => page.free_space(),
            };

            let pre_existing_unused = page.slot_count() - page.live_count();
            let used_count = page.live_count();

            if let Some((lo, hi)) = live_lengths.iter().minmax().into_option() {
                stats.min_tlen = stats.min_tlen.min(*lo);
                stats.max_tlen = stats.max_tlen.max(*hi);
            }

            if !vacpage.unused_slots.is_empty() || pre_existing_unused > 0 || used_count == 0 {
                // the last usable block never becomes a move target,
                // so the repair step always has a source strictly past
                // every destination
                let frag_candidate = vacpage.free > stats.min_tlen && blk + 1 < nblocks;

                reclaim.push(vacpage.clone());
                if frag_candidate {
                    fragmented.push(vacpage);
                }
            }

            if live_lengths.is_empty() && keep_on_page == 0 {
                empty_run += 1;
            } else {
                empty_run = 0;
            }
        }
        // release the page

        if page_changed {
            // hint-bit-only changes are flushed too; wasteful on an
            // otherwise unmodified page but kept pending a benchmark
            Database::buffer_pool().flush_page(&pid);
        }
    }

    stats.num_pages = nblocks;
    if stats.min_tlen == usize::MAX {
        stats.min_tlen = 0;
    }

    reclaim.empty_end_pages = empty_run;
    fragmented.empty_end_pages = empty_run;

    // never move tuples onto pages truncation is going to release
    fragmented.drop_tail(nblocks - empty_run);

    stats.vtlinks.sort();

    debug!(
        "scan of {} done: {} pages, {} live, {} kept, {} dead, {} reclaimable pages, \
         {} fragmented pages, {} chain links, {} trailing empty",
        table.name,
        nblocks,
        stats.num_tuples,
        stats.keep_tuples,
        stats.num_dead,
        reclaim.len(),
        fragmented.len(),
        stats.vtlinks.len(),
        empty_run,
    );

    Ok((stats, reclaim, fragmented))
}
