//! Persistence layer: libSQL-backed source registry and dedup store.

mod libsql_backend;
mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{Database, InsertOutcome, RelayedPost, Source, normalize_source, source_handle};
