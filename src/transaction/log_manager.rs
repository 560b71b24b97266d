use std::path::{Path, PathBuf};

use log::debug;

use crate::{
    io::{SmallFile, SmallWriter},
    transaction::Transaction,
    types::SmallResult,
};

#[derive(Debug, PartialEq, Clone, Copy)]
enum RecordType {
    Abort,
    Commit,
    Start,
}

impl RecordType {
    fn to_u8(&self) -> u8 {
        match self {
            RecordType::Abort => 0,
            RecordType::Commit => 1,
            RecordType::Start => 2,
        }
    }
}

/// Append-only commit log: one record per transaction state change.
///
/// Replay/recovery is not implemented; the log exists so commit
/// ordering is durable and observable. In particular the vacuum move
/// batch is committed by writing a record here after its pages are
/// forced to disk.
pub struct LogManager {
    file: SmallFile,

    records_count: usize,

    file_path: PathBuf,
}

impl LogManager {
    pub fn new<P: AsRef<Path>>(file_path: P) -> Self {
        Self {
            file: SmallFile::new(&file_path),
            records_count: 0,
            file_path: file_path.as_ref().to_path_buf(),
        }
    }

    /// Forget the in-memory status and truncate the log file. Used by
    /// tests via `Database::reset`.
    pub fn reset(&mut self) {
        self.file = SmallFile::new(&self.file_path);
        self.file.set_len(0).unwrap();
        self.records_count = 0;
    }

    pub fn records_count(&self) -> usize {
        self.records_count
    }

    pub fn log_start(&mut self, tx: &Transaction) -> SmallResult {
        self.append(RecordType::Start, tx)
    }

    pub fn log_commit(&mut self, tx: &Transaction) -> SmallResult {
        self.append(RecordType::Commit, tx)?;

        // a commit record must reach the disk before the commit is
        // reported
        self.file.flush()
    }

    pub fn log_abort(&mut self, tx: &Transaction) -> SmallResult {
        self.append(RecordType::Abort, tx)
    }

    fn append(&mut self, record_type: RecordType, tx: &Transaction) -> SmallResult {
        let mut writer = SmallWriter::new();
        writer.write(&record_type.to_u8());
        writer.write(&tx.get_id());

        self.file.append(&writer.to_bytes())?;
        self.records_count += 1;

        debug!("log record: {:?} {}", record_type, tx);
        Ok(())
    }
}
