use std::collections::BTreeMap;

use crate::storage::tuple::TupleId;

/// Per-page scratch record built during the scan and consumed by the
/// repair engine and the index synchronizer.
#[derive(Clone, Debug)]
pub struct VacPage {
    pub block: u32,

    /// Free bytes the page will have once its unused slots are
    /// reclaimed.
    pub free: usize,

    /// Slots taken by tuples the engine has just moved onto the page.
    pub moved_in_count: usize,

    /// Slot numbers to be marked unused, ascending.
    pub unused_slots: Vec<u16>,
}

impl VacPage {
    pub fn new(block: u32, free: usize) -> Self {
        Self {
            block,
            free,
            moved_in_count: 0,
            unused_slots: Vec::new(),
        }
    }

    pub fn contains_slot(&self, slot: u16) -> bool {
        self.unused_slots.binary_search(&slot).is_ok()
    }
}

/// An ordered sequence of page descriptors plus the length of the
/// trailing run of fully empty pages.
pub struct VacPageList {
    pages: Vec<VacPage>,

    pub empty_end_pages: u32,
}

impl VacPageList {
    pub fn new() -> Self {
        Self {
            pages: Vec::new(),
            empty_end_pages: 0,
        }
    }

    /// Append a descriptor. Block numbers must arrive strictly
    /// ascending.
    pub fn push(&mut self, page: VacPage) {
        if let Some(last) = self.pages.last() {
            assert!(
                page.block > last.block,
                "page list out of order: {} after {}",
                page.block,
                last.block
            );
        }
        self.pages.push(page);
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, VacPage> {
        self.pages.iter()
    }

    pub fn get(&self, i: usize) -> Option<&VacPage> {
        self.pages.get(i)
    }

    pub fn get_mut(&mut self, i: usize) -> Option<&mut VacPage> {
        self.pages.get_mut(i)
    }

    /// Binary-search the descriptor for a block number.
    pub fn lookup_block(&self, block: u32) -> Option<&VacPage> {
        let i = self
            .pages
            .binary_search_by_key(&block, |page| page.block)
            .ok()?;
        self.pages.get(i)
    }

    pub fn contains_block(&self, block: u32) -> bool {
        self.lookup_block(block).is_some()
    }

    pub fn remove_block(&mut self, block: u32) {
        if let Ok(i) = self.pages.binary_search_by_key(&block, |page| page.block) {
            self.pages.remove(i);
        }
    }

    /// Drop descriptors in the trailing-empty range, so the repair
    /// engine never moves tuples onto pages that truncation is going
    /// to release.
    pub fn drop_tail(&mut self, first_dropped_block: u32) {
        self.pages.retain(|page| page.block < first_dropped_block);
    }
}

/// One link of an update chain: `new_tid` is the successor version,
/// `this_tid` the version that points at it.
#[derive(Copy, Clone, Debug)]
pub struct VacTupleLink {
    pub new_tid: TupleId,
    pub this_tid: TupleId,
}

/// The update chains of a relation, represented as a relation indexed
/// by successor tid rather than as a pointer graph. A backward chain
/// walk is a bounded loop of binary-search lookups.
pub struct TupleLinkTable {
    links: Vec<VacTupleLink>,
    sorted: bool,
}

impl TupleLinkTable {
    pub fn new() -> Self {
        Self {
            links: Vec::new(),
            sorted: true,
        }
    }

    pub fn push(&mut self, new_tid: TupleId, this_tid: TupleId) {
        self.links.push(VacTupleLink { new_tid, this_tid });
        self.sorted = false;
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn sort(&mut self) {
        self.links.sort_by_key(|link| link.new_tid);
        self.sorted = true;
    }

    /// Find the link whose successor is `new_tid`, i.e. the parent
    /// version of that tuple.
    pub fn lookup_by_successor(&self, new_tid: &TupleId) -> Option<&VacTupleLink> {
        assert!(self.sorted, "link table queried before sorting");

        let i = self
            .links
            .binary_search_by_key(new_tid, |link| link.new_tid)
            .ok()?;
        self.links.get(i)
    }
}

/// Accumulator used by the post-move pass: merges per-block knowledge
/// about moved-off slots and moved-in counts into one ascending page
/// list (the list the second index-sync pass runs over).
pub struct CheckedPageListBuilder {
    pages: BTreeMap<u32, VacPage>,
}

impl CheckedPageListBuilder {
    pub fn new() -> Self {
        Self {
            pages: BTreeMap::new(),
        }
    }

    pub fn note_moved_off(&mut self, block: u32, slot: u16) {
        self.pages
            .entry(block)
            .or_insert_with(|| VacPage::new(block, 0))
            .unused_slots
            .push(slot);
    }

    pub fn note_moved_in(&mut self, block: u32) {
        self.pages
            .entry(block)
            .or_insert_with(|| VacPage::new(block, 0))
            .moved_in_count += 1;
    }

    pub fn build(self) -> VacPageList {
        let mut list = VacPageList::new();
        for (_, mut page) in self.pages {
            page.unused_slots.sort();
            page.unused_slots.dedup();
            list.push(page);
        }
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_list_ordering_enforced() {
        let mut list = VacPageList::new();
        list.push(VacPage::new(1, 100));
        list.push(VacPage::new(4, 100));
        list.push(VacPage::new(9, 100));

        assert!(list.contains_block(4));
        assert!(!list.contains_block(5));

        list.remove_block(4);
        assert!(!list.contains_block(4));
        assert_eq!(list.len(), 2);
    }

    #[test]
    #[should_panic(expected = "page list out of order")]
    fn test_page_list_rejects_descending_blocks() {
        let mut list = VacPageList::new();
        list.push(VacPage::new(4, 100));
        list.push(VacPage::new(1, 100));
    }

    #[test]
    fn test_link_table_backward_walk() {
        let mut table = TupleLinkTable::new();
        // chain: (0,1) -> (2,4) -> (5,0)
        table.push(TupleId::new(2, 4), TupleId::new(0, 1));
        table.push(TupleId::new(5, 0), TupleId::new(2, 4));
        table.sort();

        let parent = table.lookup_by_successor(&TupleId::new(5, 0)).unwrap();
        assert_eq!(parent.this_tid, TupleId::new(2, 4));

        let grandparent = table.lookup_by_successor(&parent.this_tid).unwrap();
        assert_eq!(grandparent.this_tid, TupleId::new(0, 1));

        assert!(table.lookup_by_successor(&grandparent.this_tid).is_none());
    }
}
