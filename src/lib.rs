pub mod common;
pub mod error;
pub mod index;
pub mod io;
pub mod storage;
pub mod transaction;
pub mod types;
pub mod utils;
pub mod vacuum;

pub use common::{Catalog, Database, RelStats, RelationKind};
pub use error::{ErrorKind, SmallError};
pub use storage::heap_file::HeapTable;
pub use storage::schema::TableSchema;
