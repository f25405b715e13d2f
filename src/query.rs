//! Query Façade - table lookup, previews, raw SQL and natural-language questions
//!
//! Every table reference goes through the registry first, including the
//! relations named inside raw SQL, so unregistered (orphaned or half-loaded)
//! tables can never be read.

use crate::db::{QueryOutput, TableStore};
use crate::error::{AgentError, Result};
use crate::ingestion::sanitizer::quote_identifier;
use crate::llm::{strip_code_fence, TextCompletion};
use crate::registry::{TableMetadata, TableRegistry};
use serde::Serialize;
use sqlparser::ast::{ObjectName, Query, Statement, Visit, Visitor};
use sqlparser::dialect::SQLiteDialect;
use sqlparser::parser::Parser;
use std::collections::HashSet;
use std::ops::ControlFlow;
use std::sync::Arc;
use strsim::jaro_winkler;
use tracing::{debug, info, warn};

pub const DEFAULT_PREVIEW_ROWS: usize = 20;
pub const MAX_PREVIEW_ROWS: usize = 1000;

/// Rows included when asking for a summary.
const SUMMARY_SAMPLE_ROWS: usize = 20;

const SUGGESTION_THRESHOLD: f64 = 0.75;

const SQL_SYSTEM_INSTRUCTION: &str =
    "You are a data analyst who writes SQLite queries. Return exactly one SELECT statement and nothing else.";
const SUMMARY_SYSTEM_INSTRUCTION: &str =
    "You are a data analyst. Summarise query results for a business user in two or three sentences of Chinese.";

#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub table_name: String,
    pub question: String,
    pub sql: String,
    pub columns: Vec<String>,
    pub rows: Vec<serde_json::Value>,
    pub row_count: usize,
    pub summary: String,
}

pub struct QueryFacade {
    registry: Arc<TableRegistry>,
    store: Arc<dyn TableStore>,
    llm: Option<Arc<dyn TextCompletion>>,
}

impl QueryFacade {
    pub fn new(registry: Arc<TableRegistry>, store: Arc<dyn TableStore>, llm: Option<Arc<dyn TextCompletion>>) -> Self {
        Self { registry, store, llm }
    }

    pub fn resolve(&self, table: &str) -> Result<TableMetadata> {
        let table = table.trim();
        if let Some(meta) = self.registry.find(table) {
            return Ok(meta);
        }

        let closest = self
            .registry
            .names()
            .into_iter()
            .map(|name| (jaro_winkler(&name.to_lowercase(), &table.to_lowercase()), name))
            .filter(|(score, _)| *score >= SUGGESTION_THRESHOLD)
            .max_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

        Err(match closest {
            Some((_, name)) => AgentError::TableNotFound(format!("'{}' (did you mean '{}'?)", table, name)),
            None => AgentError::TableNotFound(format!("'{}'", table)),
        })
    }

    pub fn preview(&self, table: &str, limit: usize) -> Result<QueryOutput> {
        let meta = self.resolve(table)?;
        let limit = limit.clamp(1, MAX_PREVIEW_ROWS);
        self.store.query(&format!(
            "SELECT * FROM {} LIMIT {}",
            quote_identifier(&meta.physical_name),
            limit
        ))
    }

    /// Run a single read-only statement over registered tables only.
    pub fn execute_sql(&self, sql: &str) -> Result<QueryOutput> {
        let statement = parse_select(sql)?;
        for table in referenced_tables(&statement) {
            self.resolve(&table)?;
        }
        debug!("Executing SQL: {}", sql);
        self.store.query(sql)
    }

    /// Answer a natural-language question about one table.
    pub async fn ask(&self, table: &str, question: &str) -> Result<Answer> {
        let llm = self
            .llm
            .as_ref()
            .ok_or_else(|| AgentError::LlmUnavailable("set OPENAI_API_KEY to ask questions".to_string()))?;

        let question = question.trim();
        if question.is_empty() {
            return Err(AgentError::InvalidQuery("the question is empty".to_string()));
        }
        let meta = self.resolve(table)?;

        let response = llm.complete(SQL_SYSTEM_INSTRUCTION, &sql_prompt(&meta, question)).await?;
        let sql = strip_code_fence(&response).trim().to_string();
        info!("Generated SQL for {}: {}", meta.physical_name, sql);

        let output = self.execute_sql(&sql)?;
        let records = output.records();

        let summary = match llm
            .complete(SUMMARY_SYSTEM_INSTRUCTION, &summary_prompt(question, &sql, &output))
            .await
        {
            Ok(text) => text.trim().to_string(),
            Err(e) => {
                warn!("Summary generation failed: {}", e);
                fallback_summary(&output)
            }
        };

        Ok(Answer {
            table_name: meta.physical_name,
            question: question.to_string(),
            sql,
            columns: output.columns,
            row_count: records.len(),
            rows: records,
            summary,
        })
    }
}

/// Accept exactly one statement, and only a query.
pub fn validate_select(sql: &str) -> Result<()> {
    parse_select(sql).map(|_| ())
}

fn parse_select(sql: &str) -> Result<Statement> {
    let mut statements = Parser::parse_sql(&SQLiteDialect {}, sql)
        .map_err(|e| AgentError::InvalidQuery(format!("could not parse SQL: {}", e)))?;

    match statements.as_slice() {
        [Statement::Query(_)] => Ok(statements.remove(0)),
        [] => Err(AgentError::InvalidQuery("no SQL statement given".to_string())),
        [_] => Err(AgentError::InvalidQuery("only SELECT queries are allowed".to_string())),
        _ => Err(AgentError::InvalidQuery("exactly one statement is allowed".to_string())),
    }
}

/// Collects relation names and the CTE aliases that shadow them.
#[derive(Default)]
struct RelationCollector {
    ctes: HashSet<String>,
    relations: Vec<String>,
}

impl Visitor for RelationCollector {
    type Break = ();

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<()> {
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                self.ctes.insert(cte.alias.name.value.to_lowercase());
            }
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_relation(&mut self, relation: &ObjectName) -> ControlFlow<()> {
        // Schema qualifiers (`main.sales`) are ignored; the table name decides
        if let Some(ident) = relation.0.last() {
            self.relations.push(ident.value.clone());
        }
        ControlFlow::Continue(())
    }
}

/// Physical tables a statement reads, CTE names excluded, first mention order.
pub fn referenced_tables(statement: &Statement) -> Vec<String> {
    let mut collector = RelationCollector::default();
    let _ = statement.visit(&mut collector);

    let mut seen = HashSet::new();
    collector
        .relations
        .into_iter()
        .filter(|name| !collector.ctes.contains(&name.to_lowercase()))
        .filter(|name| seen.insert(name.to_lowercase()))
        .collect()
}

fn sql_prompt(meta: &TableMetadata, question: &str) -> String {
    let mut schema = format!("Table {}", quote_identifier(&meta.physical_name));
    if let Some(comment) = &meta.table_comment {
        schema.push_str(&format!(" -- {}", comment));
    }
    schema.push('\n');
    for column in &meta.column_names {
        schema.push_str(&format!("  {} TEXT", quote_identifier(column)));
        let comment = meta.column_comments.get(column);
        let original = meta.column_original_names.get(column);
        match (comment, original) {
            (Some(c), Some(o)) if c != o => schema.push_str(&format!(" -- {} (source header: {})", c, o)),
            (Some(c), _) => schema.push_str(&format!(" -- {}", c)),
            (None, Some(o)) => schema.push_str(&format!(" -- source header: {}", o)),
            (None, None) => {}
        }
        schema.push('\n');
    }

    let mut prompt = format!(
        "{}\nAll columns are stored as TEXT; CAST numeric columns before arithmetic or numeric sorting.\n",
        schema
    );
    if !meta.sample_questions.is_empty() {
        prompt.push_str("Example questions for this table:\n");
        for q in &meta.sample_questions {
            prompt.push_str(&format!("- {}\n", q));
        }
    }
    prompt.push_str(&format!("\nQuestion: {}\nSQL:", question));
    prompt
}

fn summary_prompt(question: &str, sql: &str, output: &QueryOutput) -> String {
    let sample: Vec<serde_json::Value> = output.records().into_iter().take(SUMMARY_SAMPLE_ROWS).collect();
    format!(
        "Question: {}\nSQL: {}\nRow count: {}\nRows (first {}): {}",
        question,
        sql,
        output.row_count(),
        SUMMARY_SAMPLE_ROWS,
        serde_json::Value::Array(sample)
    )
}

fn fallback_summary(output: &QueryOutput) -> String {
    if output.row_count() == 0 {
        "查询没有返回任何数据。".to_string()
    } else {
        format!("查询返回 {} 行数据，共 {} 列。", output.row_count(), output.columns.len())
    }
}
