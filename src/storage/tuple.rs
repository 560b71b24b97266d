use std::fmt;

use crate::{
    error::{ErrorKind, SmallError},
    io::{read_exact, Decodeable, Encodeable, SmallWriter},
    storage::schema::{TableSchema, Type},
    transaction::TransactionID,
};

#[derive(Debug, Clone)]
pub enum Cell {
    Int64(i64),
    Bytes(Vec<u8>),
}

impl Cell {
    pub fn get_int64(&self) -> Result<i64, SmallError> {
        match self {
            Cell::Int64(v) => Ok(*v),
            _ => Err(SmallError::internal("cell is not an int64")),
        }
    }

    pub fn get_bytes(&self) -> Result<Vec<u8>, SmallError> {
        match self {
            Cell::Bytes(v) => Ok(v.clone()),
            _ => Err(SmallError::internal("cell is not a bytes cell")),
        }
    }
}

impl PartialEq for Cell {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Cell::Int64(a), Cell::Int64(b)) => a == b,
            (Cell::Bytes(a), Cell::Bytes(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Cell {}

impl PartialOrd for Cell {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        match (self, other) {
            (Cell::Int64(a), Cell::Int64(b)) => a.partial_cmp(b),
            (Cell::Bytes(a), Cell::Bytes(b)) => a.partial_cmp(b),
            _ => None,
        }
    }
}

impl Ord for Cell {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.partial_cmp(other)
            .expect("cells of different types are not comparable")
    }
}

/// A row, without any visibility metadata.
#[derive(Clone, PartialEq, Eq)]
pub struct Tuple {
    cells: Vec<Cell>,
}

impl Tuple {
    pub fn new_from_cells(cells: &Vec<Cell>) -> Self {
        Self {
            cells: cells.to_vec(),
        }
    }

    pub fn new_int_tuples(value: i64, width: usize) -> Self {
        let mut cells: Vec<Cell> = Vec::new();
        for _ in 0..width {
            cells.push(Cell::Int64(value));
        }

        Tuple { cells }
    }

    pub fn get_cell(&self, i: usize) -> Cell {
        self.cells[i].clone()
    }

    pub fn get_cells(&self) -> Vec<Cell> {
        self.cells.clone()
    }

    pub fn read_from<R: std::io::Read>(reader: &mut R, schema: &TableSchema) -> Self {
        let mut cells: Vec<Cell> = Vec::new();
        for field in schema.get_fields() {
            match field.get_type() {
                Type::Int64 => {
                    cells.push(Cell::Int64(i64::decode_from(reader)));
                }
                Type::Bytes(_) => {
                    let len = u16::decode_from(reader);
                    cells.push(Cell::Bytes(read_exact(reader, len as usize)));
                }
            }
        }
        Tuple { cells }
    }
}

impl Encodeable for Tuple {
    fn encode(&self) -> Vec<u8> {
        let mut writer = SmallWriter::new();
        for cell in &self.cells {
            match cell {
                Cell::Int64(v) => writer.write(v),
                Cell::Bytes(v) => {
                    writer.write(&(v.len() as u16));
                    writer.write_bytes(v);
                }
            }
        }
        writer.to_bytes()
    }
}

impl fmt::Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut content: String = "{".to_owned();
        for cell in &self.cells {
            let cell_str = format!("{:?}, ", cell);
            content.push_str(&cell_str);
        }
        if content.len() > 1 {
            content = content[..content.len() - 2].to_string();
        }
        content.push_str(&"}");
        write!(f, "{}", content)
    }
}

impl fmt::Debug for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

/// Physical address of a tuple: block number plus line-pointer slot.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TupleId {
    pub block: u32,
    pub slot: u16,
}

impl TupleId {
    pub fn new(block: u32, slot: u16) -> Self {
        Self { block, slot }
    }
}

impl fmt::Display for TupleId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "({},{})", self.block, self.slot)
    }
}

impl fmt::Debug for TupleId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl Encodeable for TupleId {
    fn encode(&self) -> Vec<u8> {
        let mut writer = SmallWriter::new();
        writer.write(&self.block);
        writer.write(&self.slot);
        writer.to_bytes()
    }
}

impl Decodeable for TupleId {
    fn decode_from<R: std::io::Read>(reader: &mut R) -> Self {
        let block = u32::decode_from(reader);
        let slot = u16::decode_from(reader);
        Self { block, slot }
    }
}

// infomask bits
pub const XMIN_COMMITTED: u16 = 1 << 0;
pub const XMIN_INVALID: u16 = 1 << 1;
pub const XMAX_COMMITTED: u16 = 1 << 2;
pub const XMAX_INVALID: u16 = 1 << 3;
pub const MARKED_FOR_UPDATE: u16 = 1 << 4;
pub const MOVED_OFF: u16 = 1 << 5;
pub const MOVED_IN: u16 = 1 << 6;
pub const UPDATED: u16 = 1 << 7;

pub const INVALID_XID: TransactionID = 0;

/// Bytes of the on-page tuple header: xmin, xmax, cmd, ctid, infomask,
/// plus two bytes of padding to keep row data 8-byte aligned.
pub const HEAP_TUPLE_HEADER_BYTES: usize = 4 + 4 + 4 + 6 + 2 + 2;

/// A row plus its visibility header, as stored on a heap page.
///
/// `cmd` holds the creating command id; the compaction engine reuses
/// the same slot to stamp its own transaction id on move pairs.
#[derive(Clone)]
pub struct HeapTuple {
    pub xmin: TransactionID,
    pub xmax: TransactionID,
    pub cmd: u32,
    pub ctid: TupleId,
    pub infomask: u16,
    row: Tuple,
}

impl HeapTuple {
    /// A freshly inserted tuple: `ctid` points at itself.
    pub fn new(row: &Tuple, xid: TransactionID, cid: u32, self_tid: TupleId) -> Self {
        Self {
            xmin: xid,
            xmax: INVALID_XID,
            cmd: cid,
            ctid: self_tid,
            infomask: XMAX_INVALID,
            row: row.clone(),
        }
    }

    pub fn get_row(&self) -> &Tuple {
        &self.row
    }

    pub fn get_cell(&self, i: usize) -> Cell {
        self.row.get_cell(i)
    }

    pub fn is_set(&self, flag: u16) -> bool {
        self.infomask & flag != 0
    }

    pub fn set_flag(&mut self, flag: u16) {
        self.infomask |= flag;
    }

    pub fn clear_flag(&mut self, flag: u16) {
        self.infomask &= !flag;
    }

    /// True when `ctid` no longer points at the tuple itself, i.e. a
    /// newer version exists somewhere.
    pub fn points_elsewhere(&self, self_tid: &TupleId) -> bool {
        self.ctid != *self_tid
    }

    pub fn encoded_len(&self) -> usize {
        HEAP_TUPLE_HEADER_BYTES + self.row.encode().len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut writer = SmallWriter::new();
        writer.write(&self.xmin);
        writer.write(&self.xmax);
        writer.write(&self.cmd);
        writer.write(&self.ctid);
        writer.write(&self.infomask);
        writer.write(&0u16);
        writer.write_bytes(&self.row.encode());
        writer.to_bytes()
    }

    /// Just the header bytes; used for in-place hint-bit writes that
    /// must not disturb the row data behind them.
    pub fn encode_header(&self) -> Vec<u8> {
        let mut writer = SmallWriter::new();
        writer.write(&self.xmin);
        writer.write(&self.xmax);
        writer.write(&self.cmd);
        writer.write(&self.ctid);
        writer.write(&self.infomask);
        writer.write(&0u16);
        writer.to_bytes()
    }

    pub fn decode(bytes: &[u8], schema: &TableSchema) -> Result<Self, SmallError> {
        if bytes.len() < HEAP_TUPLE_HEADER_BYTES {
            return Err(SmallError::new(
                ErrorKind::PageCorrupt,
                &format!(
                    "tuple shorter than its header: {} bytes, raw: {}",
                    bytes.len(),
                    hex::encode(bytes),
                ),
            ));
        }

        let mut reader = std::io::Cursor::new(bytes);
        let xmin = u32::decode_from(&mut reader);
        let xmax = u32::decode_from(&mut reader);
        let cmd = u32::decode_from(&mut reader);
        let ctid = TupleId::decode_from(&mut reader);
        let infomask = u16::decode_from(&mut reader);
        let _padding = u16::decode_from(&mut reader);
        let row = Tuple::read_from(&mut reader, schema);

        Ok(Self {
            xmin,
            xmax,
            cmd,
            ctid,
            infomask,
            row,
        })
    }
}

impl fmt::Display for HeapTuple {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "<xmin: {}, xmax: {}, cmd: {}, ctid: {}, mask: {:#04x}, row: {}>",
            self.xmin, self.xmax, self.cmd, self.ctid, self.infomask, self.row,
        )
    }
}

impl fmt::Debug for HeapTuple {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heap_tuple_codec() {
        let schema = TableSchema::int_bytes_schema(64);
        let row = Tuple::new_from_cells(&vec![Cell::Int64(7), Cell::Bytes(vec![1, 2, 3])]);
        let tuple = HeapTuple::new(&row, 42, 0, TupleId::new(3, 5));

        let bytes = tuple.encode();
        assert_eq!(bytes.len(), tuple.encoded_len());

        let decoded = HeapTuple::decode(&bytes, &schema).unwrap();
        assert_eq!(decoded.xmin, 42);
        assert_eq!(decoded.ctid, TupleId::new(3, 5));
        assert!(decoded.is_set(XMAX_INVALID));
        assert_eq!(decoded.get_row(), &row);
    }

    #[test]
    fn test_header_len_matches_encoding() {
        let row = Tuple::new_int_tuples(1, 2);
        let tuple = HeapTuple::new(&row, 1, 0, TupleId::new(0, 0));
        assert_eq!(tuple.encode_header().len(), HEAP_TUPLE_HEADER_BYTES);
    }
}
