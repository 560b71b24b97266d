use std::collections::{HashSet, VecDeque};

use log::{debug, warn};

use crate::{
    error::{ErrorKind, SmallError},
    storage::{
        heap_file::HeapTable,
        heap_page::{HeapPage, HeapPageID, LINE_POINTER_BYTES},
        tuple::{
            HeapTuple, TupleId, MOVED_IN, MOVED_OFF, UPDATED, XMAX_INVALID, XMIN_COMMITTED,
            XMIN_INVALID,
        },
    },
    transaction::{Permission, Transaction, TransactionID},
    types::SmallResult,
    utils::{align8, HandyRwLock},
    vacuum::{
        page_list::{CheckedPageListBuilder, VacPage, VacPageList},
        scan::VacRelStats,
    },
    Database,
};

// backstop against a cyclic ctid chain on a corrupt heap
const MAX_CHAIN_LEN: usize = 1024;

/// Mark the recorded unused slots of one page and repack it.
fn reap_page(page: &mut HeapPage, vacpage: &VacPage) {
    for &slot in &vacpage.unused_slots {
        page.mark_slot_unused(slot);
    }
    page.compact();
}

/// Second pass: move live tuples off the tail of the relation onto
/// earlier pages with free space.
///
/// Invariant kept throughout: once a tuple has been deposited on page
/// B, every later source page has a block number > B, so the pass
/// always terminates and the tail it empties is safe to truncate.
///
/// Ends with a partial commit: the move batch is forced to disk and
/// committed while the relation lock stays held. The `moved-off` /
/// `moved-in` pair makes the batch atomic: either the move
/// transaction committed and every copy is the valid version, or it
/// did not and every original still is.
pub(crate) fn repair_frag(
    tx: &Transaction,
    table: &HeapTable,
    stats: &VacRelStats,
    reclaim: &VacPageList,
    fragmented: &mut VacPageList,
    xmax_recent: TransactionID,
) -> Result<(VacPageList, usize), SmallError> {
    let nblocks = stats.num_pages;

    let mut mover = Mover {
        tx,
        table,
        reclaim,
        fragmented,
        checked: CheckedPageListBuilder::new(),
        reaped: HashSet::new(),
        last_move_dest: -1,
        num_moved: 0,
    };

    // walk source blocks from the last non-empty page downward
    let mut blk = (nblocks - reclaim.empty_end_pages) as i64 - 1;

    while blk > mover.last_move_dest {
        super::check_cancel()?;
        let blkno = blk as u32;

        // destinations must lie strictly before the current source
        mover.fragmented.drop_tail(blkno);
        if mover.fragmented.is_empty() {
            break;
        }

        let pid = HeapPageID::new(table.get_id(), blkno);
        let page_pod = Database::buffer_pool().get_page(tx, Permission::ReadWrite, &pid)?;

        // reclaim this page's own dead slots before reading it; it is
        // a source now, never a destination
        {
            let mut page = page_pod.wl();
            mover.reap_if_needed(blkno, &mut page);
        }

        let slots = page_pod.rl().used_slots();
        for slot in slots {
            let self_tid = TupleId::new(blkno, slot);
            let tuple = page_pod.rl().get_tuple(slot, table.get_schema())?;

            if tuple.is_set(MOVED_IN) && tuple.cmd == tx.get_id() {
                return Err(SmallError::internal(&format!(
                    "moved-in tuple {} seen as a move source",
                    self_tid
                )));
            }

            if tuple.is_set(MOVED_OFF) && tuple.cmd == tx.get_id() {
                // already relocated as part of an update chain; the
                // slot stays used until the post-move pass, so index
                // sync counts it exactly once
                continue;
            }

            let is_chain = (tuple.is_set(UPDATED) && tuple.xmin >= xmax_recent)
                || (!tuple.is_set(XMAX_INVALID) && tuple.points_elsewhere(&self_tid));

            if is_chain {
                super::check_cancel()?;
                match mover.move_chain(stats, xmax_recent, self_tid, &tuple) {
                    Ok(()) => {}
                    Err(e) if e.get_kind() == ErrorKind::ChainBroken => {
                        warn!("relation {}: {}", table.name, e);
                    }
                    Err(e) => return Err(e),
                }
            } else {
                if !mover.place_tuple(&self_tid, &tuple)? {
                    // nothing can take this tuple; the rest of the
                    // page stays put
                    debug!("no space left for {}, page {} keeps its tail", self_tid, blkno);
                    break;
                }
            }
        }

        blk -= 1;
    }

    let num_moved = mover.num_moved;
    let checked = mover.checked.build();

    debug!("relation {}: moved {} tuples", table.name, num_moved);

    // Commit the move batch: force the pages to disk, then write the
    // commit record. The relation lock survives the commit; no other
    // writer can observe the intermediate state.
    Database::buffer_pool().flush_relation(table.get_id());
    tx.commit_keeping_locks()?;

    Ok((checked, num_moved))
}

struct Mover<'a> {
    tx: &'a Transaction,
    table: &'a HeapTable,
    reclaim: &'a VacPageList,
    fragmented: &'a mut VacPageList,
    checked: CheckedPageListBuilder,
    reaped: HashSet<u32>,
    last_move_dest: i64,
    num_moved: usize,
}

impl<'a> Mover<'a> {
    fn reap_if_needed(&mut self, block: u32, page: &mut HeapPage) {
        if let Some(vacpage) = self.reclaim.lookup_block(block) {
            if self.reaped.insert(block) {
                reap_page(page, vacpage);
            }
        }
    }

    /// Case A: relocate a whole update chain, atomically, tail first.
    ///
    /// The chain is never chased as a pointer graph: the forward walk
    /// follows `ctid` one hop at a time, the backward walk is a
    /// bounded loop of link-table lookups.
    fn move_chain(
        &mut self,
        stats: &VacRelStats,
        xmax_recent: TransactionID,
        start_tid: TupleId,
        start_tuple: &HeapTuple,
    ) -> SmallResult {
        let mut chain: VecDeque<(TupleId, HeapTuple)> = VecDeque::new();
        chain.push_back((start_tid, start_tuple.clone()));

        // forward to the chain tail
        loop {
            let (next_tid, cur_xmax) = {
                let (cur_tid, cur) = chain.back().unwrap();
                if cur.is_set(XMAX_INVALID) || !cur.points_elsewhere(cur_tid) {
                    break;
                }
                (cur.ctid, cur.xmax)
            };

            let next = self.read_chain_tuple(&next_tid)?;
            if next.xmin != cur_xmax {
                return Err(chain_broken(&next_tid, next.xmin, cur_xmax));
            }

            chain.push_back((next_tid, next));
            if chain.len() > MAX_CHAIN_LEN {
                return Err(SmallError::new(
                    ErrorKind::ChainBroken,
                    &format!("update chain at {} does not terminate", start_tid),
                ));
            }
        }

        // backward while the head is itself a recent update
        loop {
            let (head_tid, head_xmin) = {
                let (tid, head) = chain.front().unwrap();
                if !(head.is_set(UPDATED) && head.xmin >= xmax_recent) {
                    break;
                }
                (*tid, head.xmin)
            };

            let parent_tid = match stats.vtlinks.lookup_by_successor(&head_tid) {
                Some(link) => link.this_tid,
                None => break,
            };

            let parent = self.read_chain_tuple(&parent_tid)?;
            if parent.xmax != head_xmin {
                return Err(chain_broken(&parent_tid, head_xmin, parent.xmax));
            }

            chain.push_front((parent_tid, parent));
            if chain.len() > MAX_CHAIN_LEN {
                return Err(SmallError::new(
                    ErrorKind::ChainBroken,
                    &format!("update chain at {} does not terminate", start_tid),
                ));
            }
        }

        // plan destinations greedily, tail first; reject the whole
        // chain if any link cannot be placed
        let mut plan: Vec<usize> = Vec::with_capacity(chain.len());
        {
            let mut avail: Vec<usize> = self.fragmented.iter().map(|page| page.free).collect();
            for (tid, tuple) in chain.iter().rev() {
                let need = align8(tuple.encoded_len()) + LINE_POINTER_BYTES;
                match avail.iter().position(|&free| free >= need) {
                    Some(i) => {
                        avail[i] -= need;
                        plan.push(i);
                    }
                    None => {
                        debug!(
                            "chain of {} tuples at {} cannot be placed, leaving it in place",
                            chain.len(),
                            tid
                        );
                        return Ok(());
                    }
                }
            }
        }

        // execute tail -> head, linking each copy to the one placed
        // before it
        let mut successor: Option<TupleId> = None;
        for (k, (src_tid, src_tuple)) in chain.iter().rev().enumerate() {
            let frag_index = plan[k];
            let dest_block = self.fragmented.get(frag_index).unwrap().block;
            let need = align8(src_tuple.encoded_len()) + LINE_POINTER_BYTES;

            let new_tid = self.execute_move(src_tid, src_tuple, dest_block, successor)?;

            let frag_page = self.fragmented.get_mut(frag_index).unwrap();
            frag_page.free -= need;

            self.last_move_dest = self.last_move_dest.max(dest_block as i64);
            self.num_moved += 1;
            successor = Some(new_tid);
        }

        Ok(())
    }

    /// Case B: relocate one ordinary tuple. Returns false when no
    /// fragmented page can take it.
    fn place_tuple(&mut self, src_tid: &TupleId, src_tuple: &HeapTuple) -> Result<bool, SmallError> {
        let need = align8(src_tuple.encoded_len()) + LINE_POINTER_BYTES;

        let frag_index = match self.fragmented.iter().position(|page| page.free >= need) {
            Some(i) => i,
            None => return Ok(false),
        };
        let dest_block = self.fragmented.get(frag_index).unwrap().block;

        self.execute_move(src_tid, src_tuple, dest_block, None)?;

        let frag_page = self.fragmented.get_mut(frag_index).unwrap();
        frag_page.free -= need;

        self.last_move_dest = self.last_move_dest.max(dest_block as i64);
        self.num_moved += 1;
        Ok(true)
    }

    /// The move protocol for one tuple: write the copy, index it,
    /// then stamp the source. Page latches are taken in ascending
    /// block order.
    fn execute_move(
        &mut self,
        src_tid: &TupleId,
        src_tuple: &HeapTuple,
        dest_block: u32,
        successor: Option<TupleId>,
    ) -> Result<TupleId, SmallError> {
        let table_id = self.table.get_id();
        let dest_pid = HeapPageID::new(table_id, dest_block);
        let src_pid = HeapPageID::new(table_id, src_tid.block);

        let (lo, hi) = if dest_pid.page_index <= src_pid.page_index {
            (dest_pid, src_pid)
        } else {
            (src_pid, dest_pid)
        };
        let lo_pod = Database::buffer_pool().get_page(self.tx, Permission::ReadWrite, &lo)?;
        let hi_pod = Database::buffer_pool().get_page(self.tx, Permission::ReadWrite, &hi)?;
        let (dest_pod, src_pod) = if lo == dest_pid {
            (lo_pod, hi_pod)
        } else {
            (hi_pod, lo_pod)
        };

        // step 1: write the copy onto the destination
        let mut moved = src_tuple.clone();
        moved.set_flag(MOVED_IN);
        moved.clear_flag(MOVED_OFF | XMIN_COMMITTED | XMIN_INVALID);
        moved.cmd = self.tx.get_id();

        let new_tid;
        {
            let mut dest = dest_pod.wl();

            // first touch: make the free figure recorded by the scan
            // physically true
            self.reap_if_needed(dest_block, &mut dest);

            let slot = dest.append_tuple_bytes(&moved.encode()).ok_or_else(|| {
                SmallError::internal(&format!(
                    "destination page {} out of space during a move",
                    dest_block
                ))
            })?;
            new_tid = TupleId::new(dest_block, slot);

            // the tail of a chain points at itself, every other copy
            // at the successor placed just before it
            moved.ctid = successor.unwrap_or(new_tid);
            dest.set_tuple_header(slot, &moved)?;
        }
        self.checked.note_moved_in(dest_block);

        // step 2: index entries for the new location, before the
        // source stops being the valid version
        for index_pod in Database::catalog().get_indexes(table_id) {
            let mut index = index_pod.wl();
            let key = index.form_key(&moved);
            index.insert_entry(&key, &new_tid);
        }

        // step 3: stamp the source as the moved-off half of the pair
        {
            let mut src = src_pod.wl();
            let mut old = src.get_tuple(src_tid.slot, self.table.get_schema())?;
            old.set_flag(MOVED_OFF);
            old.clear_flag(MOVED_IN | XMIN_COMMITTED | XMIN_INVALID);
            old.cmd = self.tx.get_id();
            src.set_tuple_header(src_tid.slot, &old)?;
        }
        self.checked.note_moved_off(src_tid.block, src_tid.slot);

        debug!("moved tuple {} -> {}", src_tid, new_tid);
        Ok(new_tid)
    }

    fn read_chain_tuple(&self, tid: &TupleId) -> Result<HeapTuple, SmallError> {
        let pid = HeapPageID::new(self.table.get_id(), tid.block);
        let page_pod = Database::buffer_pool().get_page(self.tx, Permission::ReadOnly, &pid)?;
        let page = page_pod.rl();

        if !page.is_slot_used(tid.slot) {
            return Err(SmallError::new(
                ErrorKind::ChainBroken,
                &format!("chain member {} is already pruned", tid),
            ));
        }

        page.get_tuple(tid.slot, self.table.get_schema())
    }
}

fn chain_broken(tid: &TupleId, child_xmin: TransactionID, parent_xmax: TransactionID) -> SmallError {
    SmallError::new(
        ErrorKind::ChainBroken,
        &format!(
            "update chain broken at {}: child xmin {} does not match parent xmax {}, \
             skipping this chain",
            tid, child_xmin, parent_xmax
        ),
    )
}

/// Post-move pass: settle the hint bits of every tuple the move
/// transaction stamped, and check the per-page accounting.
pub(crate) fn finish_moves(
    tx: &Transaction,
    table: &HeapTable,
    checked: &VacPageList,
    move_xid: TransactionID,
) -> SmallResult {
    for vacpage in checked.iter() {
        let pid = HeapPageID::new(table.get_id(), vacpage.block);
        let page_pod = Database::buffer_pool().get_page(tx, Permission::ReadWrite, &pid)?;

        let mut moved_in_seen = 0usize;

        // hold the page
        {
            let mut page = page_pod.wl();
            for slot in page.used_slots() {
                let mut tuple = page.get_tuple(slot, table.get_schema())?;
                if tuple.cmd != move_xid {
                    continue;
                }

                if tuple.is_set(MOVED_IN) {
                    tuple.set_flag(XMIN_COMMITTED);
                    page.set_tuple_header(slot, &tuple)?;
                    moved_in_seen += 1;
                } else if tuple.is_set(MOVED_OFF) {
                    tuple.set_flag(XMIN_INVALID);
                    page.set_tuple_header(slot, &tuple)?;
                } else {
                    return Err(SmallError::internal(&format!(
                        "tuple ({},{}) carries the vacuum transaction id {} but is neither \
                         moved-in nor moved-off",
                        vacpage.block, slot, move_xid
                    )));
                }
            }
        }
        // release the page

        if moved_in_seen != vacpage.moved_in_count {
            return Err(SmallError::internal(&format!(
                "move accounting broken on block {}: {} moved-in tuples found, {} recorded",
                vacpage.block, moved_in_seen, vacpage.moved_in_count
            )));
        }

        Database::buffer_pool().flush_page(&pid);
    }

    Ok(())
}

/// Mark the unused slots of every listed page on the real pages and
/// repack them. Idempotent; pages already reclaimed by the move step
/// are simply repacked again.
pub(crate) fn apply_reclaim(tx: &Transaction, table: &HeapTable, pages: &VacPageList) -> SmallResult {
    for vacpage in pages.iter() {
        if vacpage.unused_slots.is_empty() {
            continue;
        }

        let pid = HeapPageID::new(table.get_id(), vacpage.block);
        let page_pod = Database::buffer_pool().get_page(tx, Permission::ReadWrite, &pid)?;

        let mut page = page_pod.wl();
        reap_page(&mut page, vacpage);
    }

    Ok(())
}
