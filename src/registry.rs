//! Table Registry - in-memory directory of every queryable table
//!
//! Keyed by physical table name. A table becomes visible to queries only once
//! it is registered here, which the ingestion pipeline does after its rows are
//! loaded. Names are never handed out twice in one process, even after a drop.

use crate::error::{AgentError, Result};
use crate::ingestion::sanitizer::is_valid_identifier;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

/// Where a table came from; decides what may be done to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    Mock,
    Upload,
    Derived,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provenance::Mock => "mock",
            Provenance::Upload => "upload",
            Provenance::Derived => "derived",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "mock" => Some(Provenance::Mock),
            "upload" => Some(Provenance::Upload),
            "derived" => Some(Provenance::Derived),
            _ => None,
        }
    }

    /// Mock tables are shared seed data and stay put.
    pub fn is_deletable(&self) -> bool {
        !matches!(self, Provenance::Mock)
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableMetadata {
    pub display_name: String,
    pub physical_name: String,
    /// Row count at creation time.
    pub row_count: usize,
    pub column_names: Vec<String>,
    pub description: String,
    pub provenance: Provenance,
    pub upload_id: Option<String>,
    pub table_comment: Option<String>,
    pub column_comments: HashMap<String, String>,
    pub column_original_names: HashMap<String, String>,
    #[serde(default)]
    pub sample_questions: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl TableMetadata {
    /// Metadata with only the required fields filled in.
    pub fn new(
        physical_name: impl Into<String>,
        display_name: impl Into<String>,
        column_names: Vec<String>,
        row_count: usize,
        provenance: Provenance,
    ) -> Self {
        Self {
            display_name: display_name.into(),
            physical_name: physical_name.into(),
            row_count,
            column_names,
            description: String::new(),
            provenance,
            upload_id: None,
            table_comment: None,
            column_comments: HashMap::new(),
            column_original_names: HashMap::new(),
            sample_questions: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !is_valid_identifier(&self.physical_name) {
            return Err(AgentError::InvalidMetadata(format!(
                "'{}' is not a legal table identifier",
                self.physical_name
            )));
        }
        if self.column_names.is_empty() {
            return Err(AgentError::InvalidMetadata(format!(
                "table '{}' has no columns",
                self.physical_name
            )));
        }

        let mut seen = HashSet::new();
        for column in &self.column_names {
            if !seen.insert(column.to_lowercase()) {
                return Err(AgentError::InvalidMetadata(format!(
                    "table '{}' repeats column '{}'",
                    self.physical_name, column
                )));
            }
        }

        let known: HashSet<&str> = self.column_names.iter().map(String::as_str).collect();
        for key in self.column_comments.keys().chain(self.column_original_names.keys()) {
            if !known.contains(key.as_str()) {
                return Err(AgentError::InvalidMetadata(format!(
                    "table '{}' annotates unknown column '{}'",
                    self.physical_name, key
                )));
            }
        }

        if self.upload_id.is_some() && self.provenance != Provenance::Upload {
            return Err(AgentError::InvalidMetadata(format!(
                "table '{}' has an upload id but {} provenance",
                self.physical_name, self.provenance
            )));
        }
        Ok(())
    }

    /// Label shown to users: the comment when there is one.
    pub fn label(&self) -> &str {
        self.table_comment.as_deref().unwrap_or(&self.display_name)
    }
}

#[derive(Default)]
struct RegistryState {
    tables: HashMap<String, TableMetadata>,
    /// Registration order, for stable listings.
    order: Vec<String>,
    /// Lowercased names ever registered, including removed ones.
    taken: HashSet<String>,
}

/// Shared by handle (`Arc<TableRegistry>`); all methods take `&self`.
#[derive(Default)]
pub struct TableRegistry {
    state: RwLock<RegistryState>,
}

impl TableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register(&self, metadata: TableMetadata) -> Result<()> {
        metadata.validate()?;

        let mut state = self.write();
        let key = metadata.physical_name.to_lowercase();
        if state.taken.contains(&key) {
            return Err(AgentError::DuplicateTable(metadata.physical_name));
        }

        info!(
            "Registered table {} ({}, {} rows, {} columns)",
            metadata.physical_name,
            metadata.provenance,
            metadata.row_count,
            metadata.column_names.len()
        );
        state.taken.insert(key);
        state.order.push(metadata.physical_name.clone());
        state.tables.insert(metadata.physical_name.clone(), metadata);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<TableMetadata> {
        self.read().tables.get(name).cloned()
    }

    /// Lookup ignoring ASCII case, matching how SQL resolves identifiers.
    pub fn find(&self, name: &str) -> Option<TableMetadata> {
        let state = self.read();
        if let Some(meta) = state.tables.get(name) {
            return Some(meta.clone());
        }
        state
            .tables
            .values()
            .find(|meta| meta.physical_name.eq_ignore_ascii_case(name))
            .cloned()
    }

    /// All registered tables in registration order.
    pub fn list(&self) -> Vec<TableMetadata> {
        let state = self.read();
        state
            .order
            .iter()
            .filter_map(|name| state.tables.get(name).cloned())
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.read().order.clone()
    }

    pub fn exists(&self, name: &str) -> bool {
        self.read().tables.contains_key(name)
    }

    /// True when `name` is registered now or was registered earlier in this
    /// process. Used by dedupe so dropped names are not recycled.
    pub fn is_name_taken(&self, name: &str) -> bool {
        self.read().taken.contains(&name.to_lowercase())
    }

    pub fn len(&self) -> usize {
        self.read().tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop the entry; its name stays retired.
    pub fn remove(&self, name: &str) -> Option<TableMetadata> {
        let mut state = self.write();
        let removed = state.tables.remove(name)?;
        state.order.retain(|n| n != name);
        debug!("Removed table {} from registry", name);
        Some(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(name: &str) -> TableMetadata {
        TableMetadata::new(name, name, vec!["id".to_string(), "amount".to_string()], 2, Provenance::Upload)
    }

    #[test]
    fn test_register_get_list() {
        let registry = TableRegistry::new();
        registry.register(meta("orders")).unwrap();
        registry.register(meta("customers")).unwrap();

        assert!(registry.exists("orders"));
        assert_eq!(registry.get("customers").unwrap().row_count, 2);
        assert_eq!(registry.names(), vec!["orders", "customers"]);
        assert_eq!(registry.list().len(), 2);
        assert_eq!(registry.find("ORDERS").unwrap().physical_name, "orders");
    }

    #[test]
    fn test_duplicate_is_rejected() {
        let registry = TableRegistry::new();
        registry.register(meta("orders")).unwrap();
        let err = registry.register(meta("orders")).unwrap_err();
        assert!(matches!(err, AgentError::DuplicateTable(_)));
        assert!(matches!(registry.register(meta("Orders")), Err(AgentError::DuplicateTable(_))));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_removed_names_stay_retired() {
        let registry = TableRegistry::new();
        registry.register(meta("orders")).unwrap();
        assert!(registry.remove("orders").is_some());
        assert!(!registry.exists("orders"));
        assert!(registry.is_name_taken("orders"));
        assert!(matches!(registry.register(meta("orders")), Err(AgentError::DuplicateTable(_))));
        assert!(registry.remove("orders").is_none());
    }

    #[test]
    fn test_validation() {
        let registry = TableRegistry::new();

        assert!(matches!(registry.register(meta("1bad")), Err(AgentError::InvalidMetadata(_))));

        let mut dup_columns = meta("t1");
        dup_columns.column_names = vec!["a".into(), "a".into()];
        assert!(matches!(registry.register(dup_columns), Err(AgentError::InvalidMetadata(_))));

        let mut stray_comment = meta("t2");
        stray_comment.column_comments.insert("ghost".into(), "幽灵".into());
        assert!(matches!(registry.register(stray_comment), Err(AgentError::InvalidMetadata(_))));

        let mut derived_with_upload = meta("t3");
        derived_with_upload.provenance = Provenance::Derived;
        derived_with_upload.upload_id = Some("abc".into());
        assert!(matches!(registry.register(derived_with_upload), Err(AgentError::InvalidMetadata(_))));

        assert!(registry.is_empty());
    }

    #[test]
    fn test_provenance_rules() {
        assert!(!Provenance::Mock.is_deletable());
        assert!(Provenance::Upload.is_deletable());
        assert_eq!(Provenance::parse("derived"), Some(Provenance::Derived));
        assert_eq!(Provenance::parse("other"), None);
    }
}
