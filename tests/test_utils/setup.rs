use std::{
    fs,
    sync::{Mutex, MutexGuard},
};

use once_cell::sync::OnceCell;
use small_heap::{
    storage::buffer_pool::{BufferPool, DEFAULT_PAGE_SIZE},
    utils, Database,
};

static SERIAL: OnceCell<Mutex<()>> = OnceCell::new();

/// # Conduct the initialization
///
/// - Setting up log configurations.
/// - Reset page size.
/// - Reset the database singleton (page cache, catalog, lock tables,
///   log manager).
/// - Remove a stale vacuum lock file.
///
/// The returned guard serializes the tests of one binary; the engine
/// state is a process singleton, so concurrent tests would trample
/// each other's catalogs.
pub fn setup() -> MutexGuard<'static, ()> {
    let guard = SERIAL
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|e| e.into_inner());

    utils::init_log();

    BufferPool::set_page_size(DEFAULT_PAGE_SIZE);
    Database::reset();

    let _ = fs::remove_file(Database::global().vacuum_lock_path());

    guard
}
