//! Ingestion - turns uploaded spreadsheets into registered SQL tables
//!
//! ```text
//! bytes -> file_parser -> (sanitizer + naming_advisor) -> type_inference -> store -> registry
//! ```

pub mod file_parser;
pub mod naming_advisor;
pub mod pipeline;
pub mod sanitizer;
pub mod type_inference;

pub use file_parser::{parse_file, FileFormat, ParsedFile};
pub use naming_advisor::{NamingAdvisor, NamingOutcome, NamingSuggestion};
pub use pipeline::{IngestionPipeline, IngestionResult};
pub use sanitizer::{dedupe, to_identifier};
pub use type_inference::{infer_type, ColumnProfile, ColumnType};
