//! sql-agent: natural-language SQL analyst over mock ERP tables and uploaded
//! spreadsheets.
//!
//! The interesting part is ingestion: an arbitrary CSV/Excel upload becomes a
//! uniquely named, SQL-safe table plus the metadata query generation needs.

pub mod chat;
pub mod config;
pub mod db;
pub mod error;
pub mod ingestion;
pub mod llm;
pub mod mock_data;
pub mod query;
pub mod registry;
pub mod value;
pub mod workspace;

pub use error::{AgentError, Result};
pub use ingestion::{IngestionPipeline, IngestionResult};
pub use registry::{Provenance, TableMetadata, TableRegistry};
pub use workspace::Workspace;
