//! Workspace - wires storage, registry, ingestion and querying together
//!
//! Built once at startup and shared by handle. `bootstrap` rebuilds the
//! registry from mock seed data and the metadata store; nothing else ever
//! registers a table except the ingestion pipeline.

use crate::chat::{ChatReply, ChatSessions};
use crate::config::Settings;
use crate::db::{MetadataStore, SqliteStore, TableStore};
use crate::error::{AgentError, Result};
use crate::ingestion::{IngestionPipeline, IngestionResult, NamingAdvisor};
use crate::llm::{LlmClient, TextCompletion};
use crate::mock_data::mock_tables;
use crate::query::QueryFacade;
use crate::registry::{TableMetadata, TableRegistry};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// What `bootstrap` found and did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BootstrapReport {
    pub mock_tables: Vec<String>,
    pub restored: Vec<String>,
    /// Stored metadata whose physical table no longer exists.
    pub pruned: Vec<String>,
    /// Physical tables with no registry entry; left in place, never queried.
    pub orphans: Vec<String>,
}

/// Registry entry as listed to clients.
#[derive(Debug, Clone, Serialize)]
pub struct DataSource {
    #[serde(flatten)]
    pub metadata: TableMetadata,
    pub deletable: bool,
}

pub struct Workspace {
    registry: Arc<TableRegistry>,
    store: Arc<dyn TableStore>,
    metadata_store: Option<Arc<MetadataStore>>,
    pipeline: IngestionPipeline,
    query: QueryFacade,
    chats: ChatSessions,
}

impl Workspace {
    pub fn new(
        store: Arc<dyn TableStore>,
        metadata_store: Option<Arc<MetadataStore>>,
        llm: Option<Arc<dyn TextCompletion>>,
        llm_timeout: Duration,
    ) -> Self {
        let registry = Arc::new(TableRegistry::new());
        let advisor = NamingAdvisor::new(llm.clone(), llm_timeout);

        let mut pipeline = IngestionPipeline::new(registry.clone(), store.clone(), advisor);
        if let Some(metadata_store) = &metadata_store {
            pipeline = pipeline.with_metadata_store(metadata_store.clone());
        }
        let query = QueryFacade::new(registry.clone(), store.clone(), llm);

        Self {
            registry,
            store,
            metadata_store,
            pipeline,
            query,
            chats: ChatSessions::new(),
        }
    }

    /// Open the databases named in `settings` and bootstrap the registry.
    pub fn open(settings: &Settings) -> Result<Self> {
        let store: Arc<dyn TableStore> = Arc::new(SqliteStore::open(&settings.database_path)?);
        let metadata_store = Arc::new(MetadataStore::open(&settings.metadata_database_path)?);
        let llm = LlmClient::from_settings(settings)?.map(|client| {
            info!("LLM naming and querying enabled (model {})", client.model());
            Arc::new(client) as Arc<dyn TextCompletion>
        });
        if llm.is_none() {
            warn!("OPENAI_API_KEY not set: uploads use sanitizer naming, questions are disabled");
        }

        let workspace = Self::new(store, Some(metadata_store), llm, settings.llm_timeout);
        workspace.bootstrap(settings.seed_mock_data)?;
        Ok(workspace)
    }

    pub fn bootstrap(&self, seed_mock_data: bool) -> Result<BootstrapReport> {
        let mut report = BootstrapReport::default();

        if seed_mock_data {
            for table in mock_tables() {
                if self.registry.exists(table.name) {
                    continue;
                }
                if !self.store.table_exists(table.name)? {
                    self.store.load_table(table.name, &table.column_names(), &table.to_rows())?;
                }
                let row_count = self.store.count_rows(table.name)?;
                self.registry.register(table.metadata(row_count))?;
                report.mock_tables.push(table.name.to_string());
            }
        }

        if let Some(metadata_store) = &self.metadata_store {
            for metadata in metadata_store.load_all()? {
                let name = metadata.physical_name.clone();
                if self.registry.exists(&name) {
                    continue;
                }
                if !self.store.table_exists(&name)? {
                    warn!("Stored metadata for {} has no table, pruning it", name);
                    metadata_store.delete(&name)?;
                    report.pruned.push(name);
                    continue;
                }
                match self.registry.register(metadata) {
                    Ok(()) => report.restored.push(name),
                    Err(e) => warn!("Could not restore {}: {}", name, e),
                }
            }
        }

        let registered: HashSet<String> = self.registry.names().into_iter().map(|n| n.to_lowercase()).collect();
        for name in self.store.list_tables()? {
            if !registered.contains(&name.to_lowercase()) {
                warn!("Table {} exists in storage without metadata; it will not be queryable", name);
                report.orphans.push(name);
            }
        }

        info!(
            "Bootstrap complete: {} mock, {} restored, {} pruned, {} orphaned",
            report.mock_tables.len(),
            report.restored.len(),
            report.pruned.len(),
            report.orphans.len()
        );
        Ok(report)
    }

    pub fn registry(&self) -> &Arc<TableRegistry> {
        &self.registry
    }

    pub fn query(&self) -> &QueryFacade {
        &self.query
    }

    pub fn chats(&self) -> &ChatSessions {
        &self.chats
    }

    pub async fn chat(&self, session_id: Option<&str>, table: Option<&str>, message: &str) -> Result<ChatReply> {
        self.chats.send(&self.query, session_id, table, message).await
    }

    pub async fn upload(&self, file_bytes: &[u8], filename: &str) -> Result<IngestionResult> {
        self.pipeline.ingest(file_bytes, filename).await
    }

    pub fn list_sources(&self) -> Vec<DataSource> {
        self.registry
            .list()
            .into_iter()
            .map(|metadata| DataSource {
                deletable: metadata.provenance.is_deletable(),
                metadata,
            })
            .collect()
    }

    /// Drop an uploaded or derived table. Mock tables are refused.
    pub fn delete_table(&self, name: &str) -> Result<TableMetadata> {
        let metadata = self
            .registry
            .find(name)
            .ok_or_else(|| AgentError::TableNotFound(format!("'{}'", name)))?;
        if !metadata.provenance.is_deletable() {
            return Err(AgentError::ProtectedTable(format!(
                "'{}' is {} data and cannot be deleted",
                metadata.physical_name, metadata.provenance
            )));
        }

        // Unregister first so no query resolves a table mid-drop; the name
        // stays retired either way
        self.registry.remove(&metadata.physical_name);
        if let Err(e) = self.store.drop_table(&metadata.physical_name) {
            warn!("Unregistered {} but could not drop it: {}", metadata.physical_name, e);
            return Err(e);
        }
        if let Some(metadata_store) = &self.metadata_store {
            if let Err(e) = metadata_store.delete(&metadata.physical_name) {
                warn!("Failed to delete stored metadata for {}: {}", metadata.physical_name, e);
            }
        }

        info!("Deleted table {}", metadata.physical_name);
        Ok(metadata)
    }

    /// Run a read-only query and keep its result as a new derived table.
    pub fn save_query_result(&self, sql: &str, label: &str) -> Result<TableMetadata> {
        let output = self.query.execute_sql(sql)?;
        self.pipeline.ingest_query_result(label, sql, &output)
    }
}
