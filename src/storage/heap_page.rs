use std::fmt;

use crate::{
    error::{ErrorKind, SmallError},
    storage::{
        heap_file::HeapTable,
        schema::TableSchema,
        tuple::{HeapTuple, HEAP_TUPLE_HEADER_BYTES},
    },
    utils::align8,
};

#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct HeapPageID {
    pub table_id: u32,

    /// 0-based block number within the relation file.
    pub page_index: u32,
}

impl HeapPageID {
    pub fn new(table_id: u32, page_index: u32) -> Self {
        Self {
            table_id,
            page_index,
        }
    }

    pub fn get_table_id(&self) -> u32 {
        self.table_id
    }

    pub fn get_short_repr(&self) -> String {
        format!("{}_{}", self.table_id, self.page_index)
    }
}

impl fmt::Display for HeapPageID {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "<table: {}, page: {}>",
            self.table_id, self.page_index
        )
    }
}

impl fmt::Debug for HeapPageID {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

pub const PAGE_HEADER_BYTES: usize = 8;
pub const LINE_POINTER_BYTES: usize = 6;

const LP_FLAG_USED: u16 = 1;

/// Indirection slot: maps a stable slot number to the byte range of
/// its item. A cleared used-flag means the slot may be overwritten by
/// a later insertion; the slot number itself stays stable.
#[derive(Copy, Clone, Debug)]
pub struct LinePointer {
    pub offset: u16,
    pub len: u16,
    pub used: bool,
}

/// A heap page: header, line-pointer array growing up, payload region
/// growing down. Free space is the gap between `lower` and `upper`.
///
/// The in-memory form keeps the full page image in `data`; payload
/// mutations write through to it, the header and line pointers are
/// re-serialized by `serialize`.
#[derive(Clone, Debug)]
pub struct HeapPage {
    pid: HeapPageID,
    lower: usize,
    upper: usize,
    lps: Vec<LinePointer>,
    data: Vec<u8>,
}

impl HeapPage {
    pub fn new(pid: &HeapPageID, bytes: &[u8]) -> Result<Self, SmallError> {
        let page_size = bytes.len();

        let lower = u16::from_le_bytes([bytes[0], bytes[1]]) as usize;
        let upper = u16::from_le_bytes([bytes[2], bytes[3]]) as usize;

        // An all-zero block has never been formatted.
        if lower == 0 && upper == 0 {
            return Ok(Self {
                pid: *pid,
                lower: 0,
                upper: 0,
                lps: Vec::new(),
                data: bytes.to_vec(),
            });
        }

        if lower < PAGE_HEADER_BYTES
            || upper > page_size
            || lower > upper
            || (lower - PAGE_HEADER_BYTES) % LINE_POINTER_BYTES != 0
        {
            return Err(SmallError::new(
                ErrorKind::PageCorrupt,
                &format!(
                    "bad page header on {}: lower {}, upper {}",
                    pid, lower, upper
                ),
            ));
        }

        let slot_count = (lower - PAGE_HEADER_BYTES) / LINE_POINTER_BYTES;
        let mut lps = Vec::with_capacity(slot_count);
        for i in 0..slot_count {
            let base = PAGE_HEADER_BYTES + i * LINE_POINTER_BYTES;
            let raw = &bytes[base..base + LINE_POINTER_BYTES];
            let offset = u16::from_le_bytes([raw[0], raw[1]]);
            let len = u16::from_le_bytes([raw[2], raw[3]]);
            let flags = u16::from_le_bytes([raw[4], raw[5]]);
            let used = flags & LP_FLAG_USED != 0;

            if used
                && ((offset as usize) < upper
                    || offset as usize + len as usize > page_size
                    || (len as usize) < HEAP_TUPLE_HEADER_BYTES)
            {
                return Err(SmallError::new(
                    ErrorKind::PageCorrupt,
                    &format!(
                        "bad line pointer {} on {}: raw: {}",
                        i,
                        pid,
                        hex::encode(raw),
                    ),
                ));
            }

            lps.push(LinePointer { offset, len, used });
        }

        Ok(Self {
            pid: *pid,
            lower,
            upper,
            lps,
            data: bytes.to_vec(),
        })
    }

    pub fn get_pid(&self) -> HeapPageID {
        self.pid
    }

    pub fn get_page_size(&self) -> usize {
        self.data.len()
    }

    /// True for a block that has never been formatted.
    pub fn is_new(&self) -> bool {
        self.lower == 0 && self.upper == 0
    }

    /// Format an uninitialized (or reclaimed) block as an empty page.
    pub fn format(&mut self) {
        let page_size = self.data.len();
        self.lower = PAGE_HEADER_BYTES;
        self.upper = page_size;
        self.lps.clear();
        self.data = vec![0; page_size];
    }

    pub fn free_space(&self) -> usize {
        if self.is_new() {
            return 0;
        }
        self.upper - self.lower
    }

    pub fn slot_count(&self) -> usize {
        self.lps.len()
    }

    pub fn is_slot_used(&self, slot: u16) -> bool {
        match self.lps.get(slot as usize) {
            Some(lp) => lp.used,
            None => false,
        }
    }

    pub fn used_slots(&self) -> Vec<u16> {
        let mut slots = Vec::new();
        for (i, lp) in self.lps.iter().enumerate() {
            if lp.used {
                slots.push(i as u16);
            }
        }
        slots
    }

    pub fn live_count(&self) -> usize {
        self.lps.iter().filter(|lp| lp.used).count()
    }

    pub fn is_empty(&self) -> bool {
        self.live_count() == 0
    }

    /// Place an encoded tuple on the page, reusing the first unused
    /// line pointer if one exists. Returns the slot number, or `None`
    /// when the free space cannot take the item.
    pub fn insert_tuple_bytes(&mut self, bytes: &[u8]) -> Option<u16> {
        let aligned = align8(bytes.len());

        let reuse_slot = self
            .lps
            .iter()
            .position(|lp| !lp.used)
            .map(|i| i as u16);

        let needed = match reuse_slot {
            Some(_) => aligned,
            None => aligned + LINE_POINTER_BYTES,
        };
        if self.free_space() < needed {
            return None;
        }

        self.upper -= aligned;
        self.data[self.upper..self.upper + bytes.len()].copy_from_slice(bytes);
        for b in &mut self.data[self.upper + bytes.len()..self.upper + aligned] {
            *b = 0;
        }

        let lp = LinePointer {
            offset: self.upper as u16,
            len: bytes.len() as u16,
            used: true,
        };

        match reuse_slot {
            Some(slot) => {
                self.lps[slot as usize] = lp;
                Some(slot)
            }
            None => {
                self.lps.push(lp);
                self.lower += LINE_POINTER_BYTES;
                Some((self.lps.len() - 1) as u16)
            }
        }
    }

    /// Place an encoded tuple on a fresh line pointer, never reusing
    /// an unused slot. Move destinations need this: the unused slots
    /// of a page are still named by the page lists that drive index
    /// cleanup, so a reused slot number would alias a reclaimed one.
    pub fn append_tuple_bytes(&mut self, bytes: &[u8]) -> Option<u16> {
        let aligned = align8(bytes.len());

        if self.free_space() < aligned + LINE_POINTER_BYTES {
            return None;
        }

        self.upper -= aligned;
        self.data[self.upper..self.upper + bytes.len()].copy_from_slice(bytes);
        for b in &mut self.data[self.upper + bytes.len()..self.upper + aligned] {
            *b = 0;
        }

        self.lps.push(LinePointer {
            offset: self.upper as u16,
            len: bytes.len() as u16,
            used: true,
        });
        self.lower += LINE_POINTER_BYTES;
        Some((self.lps.len() - 1) as u16)
    }

    fn get_lp(&self, slot: u16) -> Result<&LinePointer, SmallError> {
        match self.lps.get(slot as usize) {
            Some(lp) if lp.used => Ok(lp),
            _ => Err(SmallError::internal(&format!(
                "slot {} on {} is not in use",
                slot, self.pid
            ))),
        }
    }

    pub fn get_tuple(&self, slot: u16, schema: &TableSchema) -> Result<HeapTuple, SmallError> {
        let lp = self.get_lp(slot)?;
        let bytes = &self.data[lp.offset as usize..(lp.offset + lp.len) as usize];
        HeapTuple::decode(bytes, schema)
    }

    /// Overwrite the header of the tuple in `slot` in place. Row data
    /// behind the header is untouched, so this is safe for hint-bit,
    /// ctid and cmd updates.
    pub fn set_tuple_header(&mut self, slot: u16, tuple: &HeapTuple) -> Result<(), SmallError> {
        let offset = self.get_lp(slot)?.offset as usize;
        let header = tuple.encode_header();
        self.data[offset..offset + HEAP_TUPLE_HEADER_BYTES].copy_from_slice(&header);
        Ok(())
    }

    pub fn mark_slot_unused(&mut self, slot: u16) {
        if let Some(lp) = self.lps.get_mut(slot as usize) {
            lp.used = false;
            lp.offset = 0;
            lp.len = 0;
        }
    }

    /// Repack all live items so the payload region is contiguous and
    /// all free space sits between `lower` and `upper`. Slot numbers
    /// do not change.
    pub fn compact(&mut self) {
        let page_size = self.data.len();

        let mut items: Vec<(usize, Vec<u8>)> = Vec::new();
        for (i, lp) in self.lps.iter().enumerate() {
            if !lp.used {
                continue;
            }
            let mut item =
                self.data[lp.offset as usize..(lp.offset + lp.len) as usize].to_vec();
            item.resize(align8(lp.len as usize), 0);
            items.push((i, item));
        }

        let mut upper = page_size;
        for (slot, item) in items {
            upper -= item.len();
            self.data[upper..upper + item.len()].copy_from_slice(&item);
            self.lps[slot].offset = upper as u16;
        }

        self.upper = upper;
        for b in &mut self.data[self.lower..self.upper] {
            *b = 0;
        }
    }

    /// Serialize to exactly one page-size block.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = self.data.clone();
        if self.is_new() {
            return buf;
        }

        buf[0..2].copy_from_slice(&(self.lower as u16).to_le_bytes());
        buf[2..4].copy_from_slice(&(self.upper as u16).to_le_bytes());
        buf[4..8].copy_from_slice(&[0; 4]);

        for (i, lp) in self.lps.iter().enumerate() {
            let base = PAGE_HEADER_BYTES + i * LINE_POINTER_BYTES;
            buf[base..base + 2].copy_from_slice(&lp.offset.to_le_bytes());
            buf[base + 2..base + 4].copy_from_slice(&lp.len.to_le_bytes());
            let flags: u16 = if lp.used { LP_FLAG_USED } else { 0 };
            buf[base + 4..base + 6].copy_from_slice(&flags.to_le_bytes());
        }

        buf
    }

    pub fn write_to_table(&self, table: &HeapTable) -> Result<(), SmallError> {
        table.write_page_bytes(self.pid.page_index, &self.serialize())
    }
}

impl fmt::Display for HeapPage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "<page {}, slots: {}, live: {}, free: {}>",
            self.pid,
            self.slot_count(),
            self.live_count(),
            self.free_space(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tuple::{Cell, Tuple, TupleId};

    fn empty_page(page_size: usize) -> HeapPage {
        let pid = HeapPageID::new(1, 0);
        let mut page = HeapPage::new(&pid, &vec![0; page_size]).unwrap();
        assert!(page.is_new());
        page.format();
        page
    }

    fn make_tuple(key: i64, payload_len: usize) -> HeapTuple {
        let row = Tuple::new_from_cells(&vec![
            Cell::Int64(key),
            Cell::Bytes(vec![0xab; payload_len]),
        ]);
        HeapTuple::new(&row, 1, 0, TupleId::new(0, 0))
    }

    #[test]
    fn test_insert_and_read_back() {
        let schema = TableSchema::int_bytes_schema(128);
        let mut page = empty_page(4096);

        let tuple = make_tuple(1, 10);
        let slot = page.insert_tuple_bytes(&tuple.encode()).unwrap();

        let read = page.get_tuple(slot, &schema).unwrap();
        assert_eq!(read.get_cell(0).get_int64().unwrap(), 1);
    }

    #[test]
    fn test_slot_reuse_keeps_slot_numbers_stable() {
        let mut page = empty_page(4096);

        let s0 = page.insert_tuple_bytes(&make_tuple(0, 8).encode()).unwrap();
        let s1 = page.insert_tuple_bytes(&make_tuple(1, 8).encode()).unwrap();
        let s2 = page.insert_tuple_bytes(&make_tuple(2, 8).encode()).unwrap();
        assert_eq!((s0, s1, s2), (0, 1, 2));

        page.mark_slot_unused(s1);
        assert_eq!(page.slot_count(), 3);

        // the freed line pointer is reused, not appended
        let s3 = page.insert_tuple_bytes(&make_tuple(3, 8).encode()).unwrap();
        assert_eq!(s3, 1);
        assert_eq!(page.slot_count(), 3);
    }

    #[test]
    fn test_compact_reclaims_dead_space() {
        let schema = TableSchema::int_bytes_schema(128);
        let mut page = empty_page(4096);

        let mut slots = Vec::new();
        for i in 0..8 {
            slots.push(page.insert_tuple_bytes(&make_tuple(i, 32).encode()).unwrap());
        }
        let free_full = page.free_space();

        let dead_len = align8(make_tuple(0, 32).encoded_len());
        page.mark_slot_unused(slots[2]);
        page.mark_slot_unused(slots[5]);

        // space is only counted back after the repack
        assert_eq!(page.free_space(), free_full);
        page.compact();
        assert_eq!(page.free_space(), free_full + 2 * dead_len);

        // survivors are intact and keep their slots
        for i in [0u16, 1, 3, 4, 6, 7].iter() {
            let t = page.get_tuple(slots[*i as usize], &schema).unwrap();
            assert_eq!(t.get_cell(0).get_int64().unwrap(), *i as i64);
        }
    }

    #[test]
    fn test_serialize_roundtrip() {
        let schema = TableSchema::int_bytes_schema(128);
        let mut page = empty_page(4096);
        for i in 0..5 {
            page.insert_tuple_bytes(&make_tuple(i, 16).encode()).unwrap();
        }
        page.mark_slot_unused(3);

        let bytes = page.serialize();
        let reread = HeapPage::new(&page.get_pid(), &bytes).unwrap();

        assert_eq!(reread.slot_count(), 5);
        assert_eq!(reread.live_count(), 4);
        assert_eq!(reread.free_space(), page.free_space());
        assert_eq!(
            reread.get_tuple(4, &schema).unwrap().get_cell(0).get_int64().unwrap(),
            4
        );
    }

    #[test]
    fn test_corrupt_line_pointer_detected() {
        let mut page = empty_page(4096);
        page.insert_tuple_bytes(&make_tuple(1, 8).encode()).unwrap();
        let mut bytes = page.serialize();

        // point the line pointer past the end of the page
        let base = PAGE_HEADER_BYTES;
        bytes[base..base + 2].copy_from_slice(&u16::MAX.to_le_bytes());

        let err = HeapPage::new(&page.get_pid(), &bytes).unwrap_err();
        assert_eq!(err.get_kind(), ErrorKind::PageCorrupt);
    }
}
