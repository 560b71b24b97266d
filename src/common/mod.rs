mod catalog;
mod database;

pub use catalog::{Catalog, RelStats, RelationKind};
pub use database::Database;
