use log::{debug, warn};

use crate::{
    index::{IndexScan, OrderedIndex},
    types::{Pod, SmallResult},
    utils::HandyRwLock,
    vacuum::page_list::VacPageList,
    Database,
};

/// One cleanup scan over one index.
///
/// Every entry whose heap pointer names a slot recorded as unused in
/// `pages` is deleted; the survivors are counted and the index
/// statistics row is overwritten in place. A count that disagrees
/// with the heap is reported but not fatal: the next pass recomputes
/// both sides.
pub(crate) fn sync_index(
    index_pod: &Pod<OrderedIndex>,
    pages: &VacPageList,
    expected_live: u64,
) -> SmallResult {
    let mut live: u64 = 0;
    let mut deleted: u64 = 0;

    let scan = IndexScan::new(index_pod.clone());
    for (ordinal, heap_tid, _key) in scan {
        let reclaimed = pages
            .lookup_block(heap_tid.block)
            .map(|vacpage| vacpage.contains_slot(heap_tid.slot))
            .unwrap_or(false);

        if reclaimed {
            index_pod.wl().delete_entry(ordinal);
            deleted += 1;
        } else {
            live += 1;
        }
    }

    index_pod.wl().vacuum_cleanup();

    let (index_id, index_name, num_pages, live_now) = {
        let index = index_pod.rl();
        (
            index.get_id(),
            index.name.clone(),
            index.num_pages(),
            index.live_entries_count(),
        )
    };

    Database::catalog().update_index_stats_in_place(index_id, num_pages, live_now as u64)?;

    debug!(
        "index {}: removed {} entries, {} live",
        index_name, deleted, live
    );

    if live != expected_live {
        warn!(
            "index {} has {} live entries, heap has {} (live + kept); \
             the index may need a rebuild",
            index_name, live, expected_live
        );
    }

    Ok(())
}
