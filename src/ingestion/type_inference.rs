//! Column Type Inference - classifies sampled cell values by shape

use crate::value::{CellValue, Row};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Share of non-empty values that must match a shape for it to win.
const MATCH_THRESHOLD: f64 = 0.8;

/// Non-empty values kept per column in a profile.
const MAX_SAMPLE_VALUES: usize = 5;

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y/%m/%d %H:%M:%S",
    "%Y/%m/%d %H:%M",
];

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%Y/%m/%d",
    "%Y.%m.%d",
    "%d/%m/%Y",
    "%m/%d/%Y",
    "%d-%m-%Y",
    "%Y年%m月%d日",
    "%b %d, %Y",
    "%d %b %Y",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    String,
    Number,
    Date,
    Boolean,
}

impl ColumnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::String => "string",
            ColumnType::Number => "number",
            ColumnType::Date => "date",
            ColumnType::Boolean => "boolean",
        }
    }
}

/// Per-column summary returned with an upload; not persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnProfile {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    pub nullable: bool,
    pub unique_values: usize,
    pub sample_values: Vec<CellValue>,
    pub comment: Option<String>,
    pub original_name: Option<String>,
}

/// Infer a semantic type. Checks run boolean, number, date, then fall back to
/// string; "0"/"1" columns must land on boolean before the numeric check sees them.
pub fn infer_type<'a, I>(values: I) -> ColumnType
where
    I: IntoIterator<Item = &'a CellValue>,
{
    let present: Vec<&CellValue> = values.into_iter().filter(|v| !v.is_empty()).collect();
    if present.is_empty() {
        return ColumnType::String;
    }

    let total = present.len() as f64;
    let share = |predicate: fn(&CellValue) -> bool| {
        present.iter().filter(|v| predicate(v)).count() as f64 / total
    };

    if share(is_boolean_like) >= MATCH_THRESHOLD {
        ColumnType::Boolean
    } else if share(is_numeric) >= MATCH_THRESHOLD {
        ColumnType::Number
    } else if share(is_date_like) >= MATCH_THRESHOLD {
        ColumnType::Date
    } else {
        ColumnType::String
    }
}

fn is_boolean_like(value: &CellValue) -> bool {
    match value {
        CellValue::Bool(_) => true,
        CellValue::Text(s) => {
            let s = s.trim();
            s.eq_ignore_ascii_case("true") || s.eq_ignore_ascii_case("false") || is_zero_or_one(value)
        }
        _ => is_zero_or_one(value),
    }
}

fn is_zero_or_one(value: &CellValue) -> bool {
    matches!(value.as_f64(), Some(n) if n == 0.0 || n == 1.0)
}

fn is_numeric(value: &CellValue) -> bool {
    match value {
        CellValue::Int(_) => true,
        CellValue::Float(f) => f.is_finite(),
        CellValue::Text(s) => s.trim().parse::<f64>().map(|n| n.is_finite()).unwrap_or(false),
        _ => false,
    }
}

fn is_date_like(value: &CellValue) -> bool {
    match value {
        CellValue::DateTime(_) => true,
        CellValue::Text(s) => parse_datetime(s.trim()).is_some(),
        _ => false,
    }
}

/// Parse the common spreadsheet date/time spellings.
pub fn parse_datetime(s: &str) -> Option<NaiveDateTime> {
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_utc());
    }
    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt);
        }
    }
    for fmt in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return d.and_hms_opt(0, 0, 0);
        }
    }
    None
}

/// Build profiles for `columns` over rows already keyed by physical column name.
pub fn profile_columns(
    rows: &[Row],
    columns: &[String],
    comments: &HashMap<String, String>,
    original_names: &HashMap<String, String>,
) -> Vec<ColumnProfile> {
    columns
        .iter()
        .map(|column| {
            let values: Vec<&CellValue> = rows
                .iter()
                .map(|row| row.get(column).unwrap_or(&CellValue::Null))
                .collect();

            let nullable = values.iter().any(|v| v.is_empty());

            // Nulls count as one distinct value
            let unique_values = values
                .iter()
                .map(|v| if v.is_empty() { None } else { Some(v.to_string()) })
                .collect::<HashSet<_>>()
                .len();

            let sample_values = values
                .iter()
                .filter(|v| !v.is_empty())
                .take(MAX_SAMPLE_VALUES)
                .map(|v| (*v).clone())
                .collect();

            ColumnProfile {
                name: column.clone(),
                column_type: infer_type(values.iter().copied()),
                nullable,
                unique_values,
                sample_values,
                comment: comments.get(column).cloned(),
                original_name: original_names.get(column).cloned(),
            }
        })
        .collect()
}
