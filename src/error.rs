use std::{error::Error, fmt};

use backtrace::Backtrace;
use log::error;

/// Failure categories of the engine.
///
/// The vacuum driver branches on the kind: `MoveBlocked` and
/// `ChainBroken` degrade the current pass, `IndexCountMismatch` is a
/// warning, everything else unwinds through the abort hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The caller already has a transaction open in this session.
    InTransactionBlock,

    /// The vacuum lock file exists, another vacuum is running.
    AnotherVacuumRunning,

    /// A named relation doesn't exist in the catalog.
    RelationNotFound,

    /// On-disk structure violates a basic invariant.
    PageCorrupt,

    /// A tuple with an in-progress inserter/deleter was seen during
    /// the scan; compaction is disabled for the relation.
    MoveBlocked,

    /// An update chain turned out to be partly pruned; the chain is
    /// skipped.
    ChainBroken,

    /// Live index entries != live heap tuples after a sync pass.
    IndexCountMismatch,

    /// Cooperative cancellation was requested.
    Cancelled,

    LockTimeout,
    Io,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

pub struct SmallError {
    kind: ErrorKind,
    details: String,
}

impl SmallError {
    pub fn new(kind: ErrorKind, msg: &str) -> SmallError {
        SmallError {
            kind,
            details: msg.to_string(),
        }
    }

    pub fn io(msg: &str) -> SmallError {
        Self::new(ErrorKind::Io, msg)
    }

    pub fn internal(msg: &str) -> SmallError {
        Self::new(ErrorKind::Internal, msg)
    }

    pub fn get_kind(&self) -> ErrorKind {
        self.kind
    }

    /// Print the current backtrace through the logger. Used on
    /// lock-discipline failures where the call path matters more than
    /// the message.
    pub fn show_backtrace(&self) {
        let backtrace = Backtrace::new();
        error!("{}\n{:?}", self, backtrace);
    }
}

impl fmt::Display for SmallError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.details)
    }
}

impl fmt::Debug for SmallError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl Error for SmallError {}

impl From<std::io::Error> for SmallError {
    fn from(e: std::io::Error) -> Self {
        SmallError::io(&e.to_string())
    }
}
