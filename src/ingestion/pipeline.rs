//! Ingestion Pipeline - upload bytes in, registered SQL table out
//!
//! Order matters: parse, name, profile, load, and only then register. A table
//! is visible to queries only after its rows are in storage.

use crate::db::{MetadataStore, QueryOutput, TableStore};
use crate::error::{AgentError, Result};
use crate::ingestion::file_parser::parse_file;
use crate::ingestion::naming_advisor::{merge_sample_questions, NamingAdvisor, NamingOutcome, NamingSuggestion};
use crate::ingestion::sanitizer::{dedupe, to_identifier};
use crate::ingestion::type_inference::{profile_columns, ColumnProfile};
use crate::registry::{Provenance, TableMetadata, TableRegistry};
use crate::value::{CellValue, Row};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const TABLE_FALLBACK: &str = "uploaded_table";
pub const TABLE_PREFIX: &str = "uploaded";
pub const DERIVED_FALLBACK: &str = "derived_table";
pub const DERIVED_PREFIX: &str = "derived";
pub const COLUMN_PREFIX: &str = "col";

/// Outcome of one successful upload.
#[derive(Debug, Clone, Serialize)]
pub struct IngestionResult {
    pub physical_table_name: String,
    pub table_comment: String,
    pub column_profiles: Vec<ColumnProfile>,
    pub total_columns: usize,
    pub estimated_rows: usize,
    pub upload_id: String,
    pub sample_questions: Vec<String>,
    pub column_comments: HashMap<String, String>,
    /// Physical column names in source order.
    pub headers: Vec<String>,
    #[serde(skip)]
    pub metadata: TableMetadata,
}

/// Source header to physical column assignment for one table.
#[derive(Debug, Clone)]
struct ColumnPlan {
    source: String,
    physical: String,
    comment: String,
}

pub struct IngestionPipeline {
    registry: Arc<TableRegistry>,
    store: Arc<dyn TableStore>,
    advisor: NamingAdvisor,
    metadata_store: Option<Arc<MetadataStore>>,
}

impl IngestionPipeline {
    pub fn new(registry: Arc<TableRegistry>, store: Arc<dyn TableStore>, advisor: NamingAdvisor) -> Self {
        Self {
            registry,
            store,
            advisor,
            metadata_store: None,
        }
    }

    /// Persist registered tables so they survive a restart.
    pub fn with_metadata_store(mut self, metadata_store: Arc<MetadataStore>) -> Self {
        self.metadata_store = Some(metadata_store);
        self
    }

    pub async fn ingest(&self, file_bytes: &[u8], filename: &str) -> Result<IngestionResult> {
        let basename = base_filename(filename);
        let parsed = parse_file(file_bytes, basename)?;

        let source_columns = column_union(&parsed.headers, &parsed.rows);
        let sample_rows = &parsed.rows[..parsed.rows.len().min(3)];

        let suggestion = match self.advisor.suggest(basename, &source_columns, sample_rows).await {
            NamingOutcome::Suggested(s) => Some(s),
            NamingOutcome::Unavailable => {
                info!("No LLM configured, naming {} with the sanitizer", basename);
                None
            }
            NamingOutcome::Malformed(reason) => {
                warn!("Naming advice for {} unusable ({}), using the sanitizer", basename, reason);
                None
            }
        };

        // Advice that sanitizes to nothing (e.g. all CJK) loses to the filename
        let candidate = suggestion
            .as_ref()
            .map(|s| to_identifier(&s.table_name, TABLE_FALLBACK, TABLE_PREFIX))
            .filter(|name| name != TABLE_FALLBACK)
            .unwrap_or_else(|| to_identifier(basename, TABLE_FALLBACK, TABLE_PREFIX));
        let table_name = self.unique_table_name(&candidate)?;

        let plan = plan_columns(&source_columns, suggestion.as_ref());
        let columns: Vec<String> = plan.iter().map(|c| c.physical.clone()).collect();
        let rows = remap_rows(&parsed.rows, &plan);

        let column_comments: HashMap<String, String> =
            plan.iter().map(|c| (c.physical.clone(), c.comment.clone())).collect();
        let column_original_names: HashMap<String, String> =
            plan.iter().map(|c| (c.physical.clone(), c.source.clone())).collect();
        let column_profiles = profile_columns(&rows, &columns, &column_comments, &column_original_names);

        let table_comment = suggestion
            .as_ref()
            .and_then(|s| s.table_comment.clone())
            .unwrap_or_else(|| file_stem(basename).to_string());
        let suggested_questions = suggestion.map(|s| s.sample_questions).unwrap_or_default();
        let sample_questions = merge_sample_questions(&suggested_questions, &table_comment, &source_columns);

        let upload_id = Uuid::new_v4().to_string();
        let metadata = TableMetadata {
            display_name: table_comment.clone(),
            physical_name: table_name.clone(),
            row_count: rows.len(),
            column_names: columns.clone(),
            description: format!("用户上传的文件: {}", basename),
            provenance: Provenance::Upload,
            upload_id: Some(upload_id.clone()),
            table_comment: Some(table_comment.clone()),
            column_comments: column_comments.clone(),
            column_original_names,
            sample_questions: sample_questions.clone(),
            created_at: chrono::Utc::now(),
        };

        self.commit_table(&metadata, &rows)?;

        Ok(IngestionResult {
            physical_table_name: table_name,
            table_comment,
            total_columns: columns.len(),
            estimated_rows: rows.len(),
            column_profiles,
            upload_id,
            sample_questions,
            column_comments,
            headers: columns,
            metadata,
        })
    }

    /// Store the result of a read query as a new `derived` table named after
    /// `label`.
    pub fn ingest_query_result(&self, label: &str, sql: &str, output: &QueryOutput) -> Result<TableMetadata> {
        if output.columns.is_empty() {
            return Err(AgentError::EmptyInput("the query returned no columns".to_string()));
        }

        let table_name = self.unique_table_name(&to_identifier(label, DERIVED_FALLBACK, DERIVED_PREFIX))?;
        let plan = plan_columns(&output.columns, None);

        // Positional so repeated result column names keep their own values
        let rows: Vec<Row> = output
            .rows
            .iter()
            .map(|values| {
                plan.iter()
                    .zip(values.iter())
                    .map(|(column, value)| (column.physical.clone(), CellValue::from_json(value)))
                    .collect()
            })
            .collect();

        let label = label.trim();
        let mut metadata = TableMetadata::new(
            table_name,
            if label.is_empty() { DERIVED_FALLBACK } else { label },
            plan.iter().map(|c| c.physical.clone()).collect(),
            rows.len(),
            Provenance::Derived,
        );
        metadata.description = format!("查询结果: {}", sql.trim());
        metadata.column_original_names = plan.iter().map(|c| (c.physical.clone(), c.source.clone())).collect();
        metadata.column_comments = plan.iter().map(|c| (c.physical.clone(), c.comment.clone())).collect();

        self.commit_table(&metadata, &rows)?;
        Ok(metadata)
    }

    /// Dedupe against names the registry has handed out and everything in the
    /// storage catalog, registered or not.
    fn unique_table_name(&self, base: &str) -> Result<String> {
        let catalog: HashSet<String> = self
            .store
            .list_tables()?
            .into_iter()
            .map(|n| n.to_lowercase())
            .collect();

        let name = dedupe(base, |candidate| {
            self.registry.is_name_taken(candidate) || catalog.contains(&candidate.to_lowercase())
        });
        if name != base {
            info!("Table name {} is taken, using {}", base, name);
        }
        Ok(name)
    }

    /// Load rows, then register, then persist. Nothing is registered when the
    /// load fails.
    fn commit_table(&self, metadata: &TableMetadata, rows: &[Row]) -> Result<()> {
        metadata.validate()?;

        if let Err(e) = self.store.load_table(&metadata.physical_name, &metadata.column_names, rows) {
            error!("Failed to load {}: {}", metadata.physical_name, e);
            return Err(match e {
                AgentError::StorageWrite(msg) => AgentError::StorageWrite(msg),
                other => AgentError::StorageWrite(other.to_string()),
            });
        }

        if let Err(e) = self.registry.register(metadata.clone()) {
            // Our own fresh table; leaving it would only create an orphan
            if let Err(drop_err) = self.store.drop_table(&metadata.physical_name) {
                warn!("Could not drop unregistered table {}: {}", metadata.physical_name, drop_err);
            }
            return Err(e);
        }

        if let Some(metadata_store) = &self.metadata_store {
            if let Err(e) = metadata_store.save(metadata) {
                warn!("Failed to persist metadata for {}: {}", metadata.physical_name, e);
            }
        }
        Ok(())
    }
}

/// Strip any client-side directory from an uploaded filename.
fn base_filename(filename: &str) -> &str {
    let trimmed = filename.trim();
    trimmed.rsplit(['/', '\\']).next().unwrap_or(trimmed)
}

fn file_stem(basename: &str) -> &str {
    Path::new(basename)
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or(basename)
}

/// Headers first, then any key seen only in rows, in first-seen order.
fn column_union(headers: &[String], rows: &[Row]) -> Vec<String> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut union = Vec::with_capacity(headers.len());
    let keys = headers.iter().map(String::as_str).chain(rows.iter().flat_map(|r| r.keys()));
    for key in keys {
        if seen.insert(key) {
            union.push(key.to_string());
        }
    }
    union
}

/// Assign physical names. A collision takes the 1-based source index as a
/// suffix, and a further counter if even that is taken.
fn plan_columns(sources: &[String], suggestion: Option<&NamingSuggestion>) -> Vec<ColumnPlan> {
    let mut used: HashSet<String> = HashSet::new();
    let mut plan = Vec::with_capacity(sources.len());

    for (idx, source) in sources.iter().enumerate() {
        let position = idx + 1;
        let advice = suggestion.and_then(|s| s.column_for(source));
        let candidate = advice.map(|a| a.column_name.as_str()).unwrap_or(source);

        let base = to_identifier(candidate, &format!("column_{}", position), COLUMN_PREFIX);
        let physical = if used.contains(&base.to_lowercase()) {
            dedupe(&format!("{}_{}", base, position), |name| used.contains(&name.to_lowercase()))
        } else {
            base
        };
        used.insert(physical.to_lowercase());

        let comment = advice
            .and_then(|a| a.column_comment.clone())
            .unwrap_or_else(|| source.clone());

        plan.push(ColumnPlan {
            source: source.clone(),
            physical,
            comment,
        });
    }
    plan
}

/// Re-key rows by physical name. Keys outside the plan are dropped and absent
/// keys stay absent.
fn remap_rows(rows: &[Row], plan: &[ColumnPlan]) -> Vec<Row> {
    rows.iter()
        .map(|row| {
            plan.iter()
                .filter_map(|c| row.get(&c.source).map(|v| (c.physical.clone(), v.clone())))
                .collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteStore;
    use crate::ingestion::naming_advisor::ColumnSuggestion;
    use crate::ingestion::sanitizer::is_valid_identifier;

    fn pipeline() -> (IngestionPipeline, Arc<TableRegistry>, Arc<SqliteStore>) {
        let registry = Arc::new(TableRegistry::new());
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let pipeline = IngestionPipeline::new(registry.clone(), store.clone(), NamingAdvisor::disabled());
        (pipeline, registry, store)
    }

    fn names(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_base_filename_and_stem() {
        assert_eq!(base_filename("C:\\Users\\me\\报表.xlsx"), "报表.xlsx");
        assert_eq!(base_filename("/tmp/a/b.csv"), "b.csv");
        assert_eq!(file_stem("报表.xlsx"), "报表");
        assert_eq!(file_stem("noext"), "noext");
    }

    #[test]
    fn test_column_union_keeps_first_seen_order() {
        let headers = names(&["a", "b"]);
        let rows: Vec<Row> = vec![
            [("b".to_string(), CellValue::Int(1)), ("z".to_string(), CellValue::Int(2))]
                .into_iter()
                .collect(),
            [("y".to_string(), CellValue::Int(3))].into_iter().collect(),
        ];
        assert_eq!(column_union(&headers, &rows), names(&["a", "b", "z", "y"]));
    }

    #[test]
    fn test_plan_columns_collisions() {
        let plan = plan_columns(&names(&["Order ID", "order-id", "订单", "备注", "order_id_2"]), None);
        let physical: Vec<&str> = plan.iter().map(|c| c.physical.as_str()).collect();
        assert_eq!(physical, vec!["order_id", "order_id_2", "column_3", "column_4", "order_id_2_5"]);
        assert_eq!(plan[2].comment, "订单");
    }

    #[test]
    fn test_plan_columns_uses_advice_by_exact_source() {
        let suggestion = NamingSuggestion {
            table_name: "orders".into(),
            table_comment: None,
            columns: vec![
                ColumnSuggestion {
                    source_name: "订单编号".into(),
                    column_name: "Order Id".into(),
                    column_comment: Some("订单号".into()),
                },
                ColumnSuggestion {
                    source_name: "金额 ".into(),
                    column_name: "amount".into(),
                    column_comment: None,
                },
            ],
            sample_questions: vec![],
        };
        let plan = plan_columns(&names(&["订单编号", "金额"]), Some(&suggestion));
        assert_eq!(plan[0].physical, "order_id");
        assert_eq!(plan[0].comment, "订单号");
        // Trailing space means no match
        assert_eq!(plan[1].physical, "column_2");
    }

    #[tokio::test]
    async fn test_ingest_csv_without_advisor() {
        let (pipeline, registry, store) = pipeline();
        let csv = "Order ID,客户,amount\nA1,张三,10\nA2,,20\n";

        let result = pipeline.ingest(csv.as_bytes(), "uploads/Q1 Sales.csv").await.unwrap();
        assert_eq!(result.physical_table_name, "q1_sales");
        assert_eq!(result.table_comment, "Q1 Sales");
        assert_eq!(result.headers, names(&["order_id", "column_2", "amount"]));
        assert_eq!(result.estimated_rows, 2);
        assert_eq!(result.sample_questions.len(), 4);
        assert!(result.headers.iter().all(|h| is_valid_identifier(h)));

        let meta = registry.get("q1_sales").unwrap();
        assert_eq!(meta.provenance, Provenance::Upload);
        assert_eq!(meta.column_original_names["column_2"], "客户");
        assert_eq!(meta.upload_id.as_deref(), Some(result.upload_id.as_str()));
        assert_eq!(store.count_rows("q1_sales").unwrap(), 2);
    }

    #[tokio::test]
    async fn test_rejected_upload_touches_nothing() {
        let (pipeline, registry, store) = pipeline();
        let err = pipeline.ingest(b"a,b\n1,2\n", "data.json").await.unwrap_err();
        assert!(matches!(err, AgentError::UnsupportedFormat(_)));
        let err = pipeline.ingest(b"a,b\n", "empty.csv").await.unwrap_err();
        assert!(matches!(err, AgentError::EmptyInput(_)));
        assert!(registry.is_empty());
        assert!(store.list_tables().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unregistered_table_is_routed_around() {
        let (pipeline, registry, store) = pipeline();
        let row: Row = [("x".to_string(), CellValue::Int(1))].into_iter().collect();
        store.load_table("report", &names(&["x"]), &[row]).unwrap();

        let result = pipeline.ingest(b"a\n1\n", "report.csv").await.unwrap();
        assert_eq!(result.physical_table_name, "report_2");
        assert!(!registry.exists("report"));
        assert_eq!(store.count_rows("report").unwrap(), 1);
    }

    #[test]
    fn test_ingest_query_result() {
        let (pipeline, registry, _store) = pipeline();
        let output = QueryOutput {
            columns: names(&["id", "id", "总额"]),
            rows: vec![vec![serde_json::json!(1), serde_json::json!(2), serde_json::json!(9.5)]],
        };
        let meta = pipeline
            .ingest_query_result("Top Customers", "SELECT ...", &output)
            .unwrap();
        assert_eq!(meta.physical_name, "top_customers");
        assert_eq!(meta.column_names, names(&["id", "id_2", "column_3"]));
        assert_eq!(meta.provenance, Provenance::Derived);
        assert!(registry.exists("top_customers"));
    }
}
