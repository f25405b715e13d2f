//! Storage for uploaded tables (SQLite) and for their registry metadata
//!
//! The two live in separate database files: `store` holds the data tables that
//! queries run against, `metadata_store` holds the bookkeeping needed to rebuild
//! the registry after a restart.

pub mod metadata_store;
pub mod store;

pub use metadata_store::MetadataStore;
pub use store::{QueryOutput, SqliteStore, TableStore};
