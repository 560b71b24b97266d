mod ordered_index;

pub use ordered_index::{IndexEntry, IndexScan, OrderedIndex};
