use std::{
    path::PathBuf,
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use once_cell::sync::OnceCell;

use super::Catalog;
use crate::{
    storage::buffer_pool::BufferPool,
    transaction::{ConcurrentStatus, LogManager},
    types::Pod,
    utils::HandyRwLock,
};

/// We collect all global variables here.
///
/// These variable cannot be initialized as static variables, because
/// their initialization function all rely on non-const fn (e.g.
/// `HashMap::new()`).
pub struct Database {
    path: PathBuf,

    buffer_pool: Pod<BufferPool>,
    catalog: Pod<Catalog>,
    concurrent_status: Pod<ConcurrentStatus>,
    log_manager: Pod<LogManager>,
}

static SINGLETON: OnceCell<Database> = OnceCell::new();

impl Database {
    fn new() -> Self {
        let db_name = "default_db";
        let db_path = PathBuf::from("data").join(db_name);
        if !db_path.exists() {
            std::fs::create_dir_all(&db_path).unwrap();
        }

        let log_path = db_path.join("wal.log");

        Self {
            buffer_pool: Arc::new(RwLock::new(BufferPool::new())),
            concurrent_status: Arc::new(RwLock::new(ConcurrentStatus::new())),
            catalog: Arc::new(RwLock::new(Catalog::new(&db_path))),
            log_manager: Arc::new(RwLock::new(LogManager::new(log_path))),

            path: db_path,
        }
    }

    /// Reset the memory status of the database, used for tests mostly.
    ///
    /// Actions:
    /// - Page cache will be cleared.
    /// - Catalog will be cleared.
    /// - Status of `log_manager` will be reset, but the log file
    ///   itself will keep unchanged.
    pub fn reset() {
        let db = Self::global();

        db.buffer_pool.rl().clear();
        *db.catalog.wl() = Catalog::new(&db.path);
        *db.concurrent_status.wl() = ConcurrentStatus::new();
        db.log_manager.wl().reset();
    }

    pub fn buffer_pool() -> RwLockReadGuard<'static, BufferPool> {
        Self::global().buffer_pool.rl()
    }

    pub fn mut_buffer_pool() -> RwLockWriteGuard<'static, BufferPool> {
        Self::global().buffer_pool.wl()
    }

    pub fn concurrent_status() -> RwLockReadGuard<'static, ConcurrentStatus> {
        Self::global().concurrent_status.rl()
    }

    pub(crate) fn mut_concurrent_status() -> RwLockWriteGuard<'static, ConcurrentStatus> {
        Self::global().concurrent_status.wl()
    }

    pub fn catalog() -> RwLockReadGuard<'static, Catalog> {
        Self::global().catalog.rl()
    }

    pub fn mut_catalog() -> RwLockWriteGuard<'static, Catalog> {
        Self::global().catalog.wl()
    }

    pub fn log_manager() -> RwLockReadGuard<'static, LogManager> {
        Self::global().log_manager.rl()
    }

    pub fn mut_log_manager() -> RwLockWriteGuard<'static, LogManager> {
        Self::global().log_manager.wl()
    }

    pub fn global() -> &'static Self {
        SINGLETON.get_or_init(Self::new)
    }

    pub fn get_path(&self) -> PathBuf {
        self.path.clone()
    }

    pub fn vacuum_lock_path(&self) -> PathBuf {
        self.path.join("vacuum.lock")
    }
}
