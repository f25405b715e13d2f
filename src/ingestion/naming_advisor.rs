//! Schema Naming Advisor - asks the LLM for readable table/column names and
//! Chinese comments, degrading to "no suggestion" on any failure

use crate::llm::{strip_code_fence, TextCompletion};
use crate::value::Row;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Rows of sample data sent along with the headers.
pub const SAMPLE_ROW_LIMIT: usize = 3;

/// Sample questions kept per table.
pub const SAMPLE_QUESTION_LIMIT: usize = 4;

const SYSTEM_INSTRUCTION: &str = "You name SQL tables and columns. Return JSON only, no text.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSuggestion {
    pub source_name: String,
    pub column_name: String,
    pub column_comment: Option<String>,
}

/// Proposal from the advisor. Identifiers are candidates only and still go
/// through the sanitizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamingSuggestion {
    pub table_name: String,
    pub table_comment: Option<String>,
    pub columns: Vec<ColumnSuggestion>,
    pub sample_questions: Vec<String>,
}

impl NamingSuggestion {
    /// Suggestion for `source_name`, matched by exact string.
    pub fn column_for(&self, source_name: &str) -> Option<&ColumnSuggestion> {
        self.columns.iter().find(|c| c.source_name == source_name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NamingOutcome {
    Suggested(NamingSuggestion),
    /// No completion capability is configured.
    Unavailable,
    /// The call failed, timed out, or returned something unusable.
    Malformed(String),
}

impl NamingOutcome {
    pub fn into_suggestion(self) -> Option<NamingSuggestion> {
        match self {
            NamingOutcome::Suggested(s) => Some(s),
            _ => None,
        }
    }
}

/// Wire shape requested from the model.
#[derive(Debug, Deserialize)]
struct RawPlan {
    table_name_en: Option<String>,
    table_comment_cn: Option<String>,
    #[serde(default)]
    columns: Option<Vec<RawColumnPlan>>,
    #[serde(default)]
    sample_questions: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
struct RawColumnPlan {
    #[serde(default)]
    source_name: Option<serde_json::Value>,
    #[serde(default)]
    column_name_en: Option<String>,
    #[serde(default)]
    column_comment_cn: Option<String>,
}

#[derive(Clone)]
pub struct NamingAdvisor {
    llm: Option<Arc<dyn TextCompletion>>,
    timeout: Duration,
}

impl NamingAdvisor {
    pub fn new(llm: Option<Arc<dyn TextCompletion>>, timeout: Duration) -> Self {
        Self { llm, timeout }
    }

    /// Advisor with no capability: every call is `Unavailable`.
    pub fn disabled() -> Self {
        Self::new(None, Duration::from_secs(30))
    }

    pub fn is_enabled(&self) -> bool {
        self.llm.is_some()
    }

    pub async fn suggest(&self, filename: &str, source_columns: &[String], sample_rows: &[Row]) -> NamingOutcome {
        let Some(llm) = &self.llm else {
            return NamingOutcome::Unavailable;
        };
        if source_columns.is_empty() {
            return NamingOutcome::Malformed("no source columns to name".to_string());
        }

        let prompt = build_prompt(filename, source_columns, sample_rows);
        let response = match tokio::time::timeout(self.timeout, llm.complete(SYSTEM_INSTRUCTION, &prompt)).await {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => {
                warn!("LLM naming fallback: {}", e);
                return NamingOutcome::Malformed(e.to_string());
            }
            Err(_) => {
                warn!("LLM naming fallback: timed out after {:?}", self.timeout);
                return NamingOutcome::Malformed("naming request timed out".to_string());
            }
        };

        match parse_suggestion(&response) {
            Some(suggestion) => {
                info!(
                    "LLM naming plan: table={}, {} column suggestions",
                    suggestion.table_name,
                    suggestion.columns.len()
                );
                NamingOutcome::Suggested(suggestion)
            }
            None => {
                warn!("LLM naming fallback: unusable response");
                NamingOutcome::Malformed("unusable naming response".to_string())
            }
        }
    }
}

fn build_prompt(filename: &str, source_columns: &[String], sample_rows: &[Row]) -> String {
    let payload = serde_json::json!({
        "filename": filename,
        "columns": source_columns,
        "sample_rows": sample_rows
            .iter()
            .take(SAMPLE_ROW_LIMIT)
            .map(Row::to_json)
            .collect::<Vec<_>>(),
    });

    format!(
        r#"Generate a strict JSON naming plan for a SQL table and its columns.
JSON schema:
{{
  "table_name_en": "sales_orders",
  "table_comment_cn": "销售订单",
  "sample_questions": ["最近30天订单趋势如何？", "销售额最高的前10个产品是什么？", "按地区统计订单量分布", "复购率最高的客户是谁？"],
  "columns": [
    {{"source_name": "原字段", "column_name_en": "order_id", "column_comment_cn": "订单编号"}}
  ]
}}
Rules:
1) table_name_en and column_name_en must match ^[a-zA-Z_][a-zA-Z0-9_]*$.
2) Keep the semantic meaning; source_name must repeat the input column exactly.
3) sample_questions must contain exactly 4 practical analysis questions in Chinese.
4) Return JSON only.
Input: {}"#,
        payload
    )
}

/// Defensive parse: strip code fences, cut to the outermost `{...}`, decode.
/// `None` for anything without a table name or a usable column list.
pub fn parse_suggestion(raw: &str) -> Option<NamingSuggestion> {
    let text = strip_code_fence(raw);
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }

    let plan: RawPlan = serde_json::from_str(&text[start..=end]).ok()?;

    let table_name = plan.table_name_en.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())?;

    let columns: Vec<ColumnSuggestion> = plan
        .columns?
        .into_iter()
        .filter_map(|c| {
            let source_name = match c.source_name? {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            let column_name = c.column_name_en?.trim().to_string();
            if source_name.is_empty() || column_name.is_empty() {
                return None;
            }
            let column_comment = c
                .column_comment_cn
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty());
            Some(ColumnSuggestion {
                source_name,
                column_name,
                column_comment,
            })
        })
        .collect();

    if columns.is_empty() {
        return None;
    }

    let sample_questions = plan
        .sample_questions
        .unwrap_or_default()
        .into_iter()
        .filter_map(|q| match q {
            serde_json::Value::String(s) => Some(s.trim().to_string()),
            _ => None,
        })
        .filter(|q| !q.is_empty())
        .take(SAMPLE_QUESTION_LIMIT)
        .collect();

    Some(NamingSuggestion {
        table_name,
        table_comment: plan
            .table_comment_cn
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty()),
        columns,
        sample_questions,
    })
}

/// Deterministic questions used when the advisor supplies fewer than four.
pub fn default_sample_questions(table_comment: &str, original_columns: &[String]) -> Vec<String> {
    let focus = if original_columns.is_empty() {
        "主要字段".to_string()
    } else {
        original_columns.iter().take(3).cloned().collect::<Vec<_>>().join("、")
    };
    vec![
        format!("{}一共有多少条数据？", table_comment),
        format!("{}最近30天的趋势如何？", table_comment),
        format!("按{}分组统计，Top 10 是什么？", focus),
        format!("{}里是否有异常值或缺失值？", table_comment),
    ]
}

/// Advisor questions first, padded with defaults, capped at four.
pub fn merge_sample_questions(suggested: &[String], table_comment: &str, original_columns: &[String]) -> Vec<String> {
    let mut questions: Vec<String> = suggested.iter().take(SAMPLE_QUESTION_LIMIT).cloned().collect();
    if questions.len() < SAMPLE_QUESTION_LIMIT {
        questions.extend(default_sample_questions(table_comment, original_columns));
        questions.truncate(SAMPLE_QUESTION_LIMIT);
    }
    questions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AgentError, Result};
    use crate::value::CellValue;
    use async_trait::async_trait;

    struct CannedLlm(String);

    #[async_trait]
    impl TextCompletion for CannedLlm {
        async fn complete(&self, _system: &str, _prompt: &str) -> Result<String> {
            Ok(self.0.clone())
        }
    }

    struct FailingLlm;

    #[async_trait]
    impl TextCompletion for FailingLlm {
        async fn complete(&self, _system: &str, _prompt: &str) -> Result<String> {
            Err(AgentError::Llm("connection refused".to_string()))
        }
    }

    struct SlowLlm;

    #[async_trait]
    impl TextCompletion for SlowLlm {
        async fn complete(&self, _system: &str, _prompt: &str) -> Result<String> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok("{}".to_string())
        }
    }

    const PLAN: &str = r#"{
        "table_name_en": "sales_orders",
        "table_comment_cn": "销售订单",
        "sample_questions": ["问题一", "  ", "问题二"],
        "columns": [
            {"source_name": "订单编号", "column_name_en": "order_id", "column_comment_cn": "订单编号"},
            {"source_name": "金额", "column_name_en": "amount"},
            {"source_name": "", "column_name_en": "ignored"}
        ]
    }"#;

    fn headers() -> Vec<String> {
        vec!["订单编号".to_string(), "金额".to_string()]
    }

    #[test]
    fn test_parse_plain_and_fenced() {
        let plain = parse_suggestion(PLAN).unwrap();
        assert_eq!(plain.table_name, "sales_orders");
        assert_eq!(plain.table_comment.as_deref(), Some("销售订单"));
        assert_eq!(plain.columns.len(), 2);
        assert_eq!(plain.column_for("金额").unwrap().column_name, "amount");
        assert!(plain.column_for("金额").unwrap().column_comment.is_none());
        assert_eq!(plain.sample_questions, vec!["问题一", "问题二"]);

        let fenced = format!("Here you go:\n```json\n{}\n```", PLAN);
        assert_eq!(parse_suggestion(&fenced).unwrap(), plain);
    }

    #[test]
    fn test_parse_rejects_incomplete_plans() {
        assert!(parse_suggestion("not json at all").is_none());
        assert!(parse_suggestion("{broken").is_none());
        assert!(parse_suggestion(r#"{"columns": [{"source_name": "a", "column_name_en": "a"}]}"#).is_none());
        assert!(parse_suggestion(r#"{"table_name_en": "t", "columns": []}"#).is_none());
        assert!(parse_suggestion(r#"{"table_name_en": "t"}"#).is_none());
        assert!(parse_suggestion(r#"{"table_name_en": "  ", "columns": [{"source_name": "a", "column_name_en": "a"}]}"#).is_none());
    }

    #[tokio::test]
    async fn test_suggest_outcomes() {
        let mut row = Row::new();
        row.push("订单编号", CellValue::Text("A001".into()));
        let rows = vec![row];

        let outcome = NamingAdvisor::disabled().suggest("orders.csv", &headers(), &rows).await;
        assert_eq!(outcome, NamingOutcome::Unavailable);

        let advisor = NamingAdvisor::new(Some(Arc::new(CannedLlm(PLAN.to_string()))), Duration::from_secs(5));
        let outcome = advisor.suggest("orders.csv", &headers(), &rows).await;
        assert!(matches!(outcome, NamingOutcome::Suggested(_)));

        let advisor = NamingAdvisor::new(Some(Arc::new(CannedLlm("sorry, no".to_string()))), Duration::from_secs(5));
        let outcome = advisor.suggest("orders.csv", &headers(), &rows).await;
        assert!(matches!(outcome, NamingOutcome::Malformed(_)));

        let advisor = NamingAdvisor::new(Some(Arc::new(FailingLlm)), Duration::from_secs(5));
        assert!(advisor.suggest("orders.csv", &headers(), &rows).await.into_suggestion().is_none());
    }

    #[tokio::test]
    async fn test_suggest_times_out() {
        let advisor = NamingAdvisor::new(Some(Arc::new(SlowLlm)), Duration::from_millis(20));
        let outcome = advisor.suggest("orders.csv", &headers(), &[]).await;
        assert!(matches!(outcome, NamingOutcome::Malformed(_)));
    }

    #[test]
    fn test_sample_question_padding() {
        let merged = merge_sample_questions(&["自定义问题".to_string()], "销售订单", &headers());
        assert_eq!(merged.len(), 4);
        assert_eq!(merged[0], "自定义问题");
        assert_eq!(merged[1], "销售订单一共有多少条数据？");

        let defaults = default_sample_questions("销售订单", &[]);
        assert!(defaults[2].contains("主要字段"));
    }
}
