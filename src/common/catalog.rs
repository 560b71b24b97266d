use std::{
    collections::HashMap,
    path::Path,
    sync::atomic::{AtomicU64, Ordering},
};

use log::debug;

use crate::{
    error::SmallError,
    index::OrderedIndex,
    io::SmallFile,
    storage::heap_file::HeapTable,
    types::{Pod, SmallResult},
    utils::HandyRwLock,
};

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum RelationKind {
    Table,
    Index,
}

/// Per-relation statistics as stored in the side file.
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct RelStats {
    pub num_tuples: u64,
    pub num_pages: u32,
    pub has_index: bool,
}

const RELSTATS_RECORD_BYTES: u64 = 16;

type TableRC = Pod<HeapTable>;
type IndexRC = Pod<OrderedIndex>;

pub struct Catalog {
    tables: HashMap<u32, TableRC>,

    indexes: HashMap<u32, Vec<IndexRC>>,

    // all relations (tables and indexes) in registration order
    relations: Vec<(u32, RelationKind)>,

    // relation id -> record ordinal in the statistics file
    stats_rows: HashMap<u32, u64>,

    stats_file: SmallFile,

    // bumped on every in-place statistics write, standing in for the
    // cache-invalidation message other sessions would consume
    invalidations: AtomicU64,
}

impl Catalog {
    pub fn new(dir: &Path) -> Self {
        Self {
            tables: HashMap::new(),
            indexes: HashMap::new(),
            relations: Vec::new(),
            stats_rows: HashMap::new(),
            stats_file: SmallFile::new(dir.join("relstats.db")),
            invalidations: AtomicU64::new(0),
        }
    }

    fn register(&mut self, id: u32, kind: RelationKind) {
        let row = self.relations.len() as u64;
        self.relations.push((id, kind));
        self.stats_rows.insert(id, row);

        // reserve the record so later in-place writes always land
        // inside the file
        self.stats_file
            .write_at(row * RELSTATS_RECORD_BYTES, &[0u8; RELSTATS_RECORD_BYTES as usize])
            .unwrap();
    }

    pub fn add_table(&mut self, table_rc: TableRC) {
        let id = table_rc.rl().get_id();
        self.tables.insert(id, table_rc);
        self.register(id, RelationKind::Table);
    }

    pub fn add_index(&mut self, index_rc: IndexRC) {
        let (id, table_id) = {
            let index = index_rc.rl();
            (index.get_id(), index.get_table_id())
        };

        self.indexes.entry(table_id).or_insert_with(Vec::new).push(index_rc);
        self.register(id, RelationKind::Index);
    }

    pub fn get_table(&self, table_id: u32) -> Option<TableRC> {
        self.tables.get(&table_id).cloned()
    }

    pub fn get_table_by_name(&self, name: &str) -> Option<TableRC> {
        for table_rc in self.tables.values() {
            if table_rc.rl().name == name {
                return Some(table_rc.clone());
            }
        }
        None
    }

    /// Every relation known to the catalog, tables and non-tables
    /// alike, in registration order.
    pub fn enumerate_relations(&self) -> Vec<(u32, RelationKind)> {
        self.relations.clone()
    }

    pub fn get_indexes(&self, table_id: u32) -> Vec<IndexRC> {
        self.indexes.get(&table_id).cloned().unwrap_or_default()
    }

    /// Overwrite the statistics record of a relation in place.
    ///
    /// This bypasses the versioned update path on purpose: were the
    /// statistics rows versioned, vacuuming the statistics store would
    /// churn its own rows. The record is fixed-size and never null, so
    /// the overwrite is safe under concurrent readers.
    pub fn update_stats_in_place(
        &self,
        rel_id: u32,
        num_pages: u32,
        num_tuples: u64,
        has_index: bool,
    ) -> SmallResult {
        let row = self.stats_rows.get(&rel_id).ok_or_else(|| {
            SmallError::internal(&format!("relation {} has no statistics row", rel_id))
        })?;

        let mut record = [0u8; RELSTATS_RECORD_BYTES as usize];
        record[0..8].copy_from_slice(&num_tuples.to_le_bytes());
        record[8..12].copy_from_slice(&num_pages.to_le_bytes());
        record[12] = has_index as u8;

        self.stats_file.write_at(row * RELSTATS_RECORD_BYTES, &record)?;

        self.post_invalidation(rel_id);
        Ok(())
    }

    pub fn update_index_stats_in_place(
        &self,
        index_id: u32,
        num_pages: u32,
        num_tuples: u64,
    ) -> SmallResult {
        self.update_stats_in_place(index_id, num_pages, num_tuples, false)
    }

    pub fn read_stats(&self, rel_id: u32) -> Result<RelStats, SmallError> {
        let row = self.stats_rows.get(&rel_id).ok_or_else(|| {
            SmallError::internal(&format!("relation {} has no statistics row", rel_id))
        })?;

        let record = self
            .stats_file
            .read_at(row * RELSTATS_RECORD_BYTES, RELSTATS_RECORD_BYTES as usize)?;

        let mut num_tuples = [0u8; 8];
        num_tuples.copy_from_slice(&record[0..8]);
        let mut num_pages = [0u8; 4];
        num_pages.copy_from_slice(&record[8..12]);

        Ok(RelStats {
            num_tuples: u64::from_le_bytes(num_tuples),
            num_pages: u32::from_le_bytes(num_pages),
            has_index: record[12] == 1,
        })
    }

    fn post_invalidation(&self, rel_id: u32) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
        debug!("posted statistics invalidation for relation {}", rel_id);
    }

    pub fn invalidation_count(&self) -> u64 {
        self.invalidations.load(Ordering::Relaxed)
    }
}
