//! File Parser - turns uploaded CSV/Excel bytes into rows keyed by raw header

use crate::error::{AgentError, Result};
use crate::value::{CellValue, Row};
use calamine::{open_workbook_auto_from_rs, Data, Reader};
use csv::ReaderBuilder;
use encoding_rs::GB18030;
use std::borrow::Cow;
use std::collections::HashSet;
use std::io::Cursor;
use std::path::Path;
use tracing::debug;

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Csv,
    Excel,
}

impl FileFormat {
    /// Dispatch on the filename extension, case-insensitively.
    pub fn from_filename(filename: &str) -> Result<Self> {
        let extension = Path::new(filename)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();

        match extension.as_str() {
            "csv" => Ok(FileFormat::Csv),
            "xlsx" | "xls" | "xlsm" | "xlsb" => Ok(FileFormat::Excel),
            "" => Err(AgentError::UnsupportedFormat(format!(
                "'{}' has no file extension (expected .csv, .xlsx or .xls)",
                filename
            ))),
            other => Err(AgentError::UnsupportedFormat(format!(
                ".{} files are not supported (expected .csv, .xlsx or .xls)",
                other
            ))),
        }
    }
}

/// Parsed upload: normalised header row plus data rows keyed by those headers.
#[derive(Debug, Clone)]
pub struct ParsedFile {
    pub headers: Vec<String>,
    pub rows: Vec<Row>,
}

pub fn parse_file(bytes: &[u8], filename: &str) -> Result<ParsedFile> {
    let parsed = match FileFormat::from_filename(filename)? {
        FileFormat::Csv => parse_csv(bytes)?,
        FileFormat::Excel => parse_excel(bytes)?,
    };

    if parsed.headers.is_empty() {
        return Err(AgentError::EmptyInput("the file has no header row".to_string()));
    }
    if parsed.rows.is_empty() {
        return Err(AgentError::EmptyInput("the file has no data rows".to_string()));
    }

    debug!(
        "Parsed {}: {} columns, {} rows",
        filename,
        parsed.headers.len(),
        parsed.rows.len()
    );
    Ok(parsed)
}

pub fn parse_csv(bytes: &[u8]) -> Result<ParsedFile> {
    let text = decode_text(bytes)?;

    let mut rdr = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(text.as_bytes());

    let raw_headers: Vec<String> = rdr
        .headers()
        .map_err(|e| AgentError::Parse(format!("Failed to read CSV headers: {}", e)))?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    if raw_headers.iter().all(|h| h.is_empty()) {
        return Ok(ParsedFile {
            headers: Vec::new(),
            rows: Vec::new(),
        });
    }
    let headers = normalize_headers(raw_headers);

    let mut rows = Vec::new();
    for result in rdr.records() {
        let record = result.map_err(|e| AgentError::Parse(format!("Failed to read CSV record: {}", e)))?;
        if record.len() > headers.len() {
            debug!("CSV record has {} fields, ignoring those past the header", record.len());
        }
        // Short records leave their trailing headers absent
        let row: Row = headers
            .iter()
            .zip(record.iter())
            .map(|(header, cell)| (header.clone(), coerce_cell(cell)))
            .collect();
        rows.push(row);
    }

    Ok(ParsedFile { headers, rows })
}

/// UTF-8 (BOM optional) first, then GB18030 for legacy Chinese exports.
/// Bytes that are valid in neither are a parse error, never replaced.
fn decode_text(bytes: &[u8]) -> Result<Cow<'_, str>> {
    let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
    if let Ok(text) = std::str::from_utf8(bytes) {
        return Ok(Cow::Borrowed(text));
    }

    match GB18030.decode_without_bom_handling_and_without_replacement(bytes) {
        Some(text) => {
            debug!("CSV is not UTF-8, decoded as GB18030");
            Ok(text)
        }
        None => Err(AgentError::Parse(
            "the file is neither UTF-8 nor GBK/GB18030 encoded text".to_string(),
        )),
    }
}

pub fn parse_excel(bytes: &[u8]) -> Result<ParsedFile> {
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes.to_vec()))
        .map_err(|e| AgentError::Parse(format!("Failed to open workbook: {}", e)))?;

    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| AgentError::EmptyInput("the workbook has no worksheets".to_string()))?
        .map_err(|e| AgentError::Parse(format!("Failed to read worksheet: {}", e)))?;

    let mut sheet_rows = range.rows();
    let Some(header_cells) = sheet_rows.next() else {
        return Ok(ParsedFile {
            headers: Vec::new(),
            rows: Vec::new(),
        });
    };

    let raw_headers: Vec<String> = header_cells.iter().map(header_text).collect();
    if raw_headers.iter().all(|h| h.is_empty()) {
        return Ok(ParsedFile {
            headers: Vec::new(),
            rows: Vec::new(),
        });
    }
    let headers = normalize_headers(raw_headers);

    let mut rows = Vec::new();
    for cells in sheet_rows {
        if cells.iter().all(|c| matches!(c, Data::Empty)) {
            continue;
        }
        let row: Row = headers
            .iter()
            .zip(cells.iter())
            .filter(|(_, cell)| !matches!(cell, Data::Empty))
            .map(|(header, cell)| (header.clone(), excel_cell(cell)))
            .collect();
        rows.push(row);
    }

    Ok(ParsedFile { headers, rows })
}

/// Blank headers become `Unnamed: {index}`; repeats get `.1`, `.2`, ... so
/// every source column keeps a distinct key.
fn normalize_headers(raw: Vec<String>) -> Vec<String> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut out = Vec::with_capacity(raw.len());

    for (idx, header) in raw.into_iter().enumerate() {
        let base = if header.is_empty() {
            format!("Unnamed: {}", idx)
        } else {
            header
        };
        let mut candidate = base.clone();
        let mut n = 1;
        while seen.contains(&candidate) {
            candidate = format!("{}.{}", base, n);
            n += 1;
        }
        seen.insert(candidate.clone());
        out.push(candidate);
    }
    out
}

fn coerce_cell(s: &str) -> CellValue {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        CellValue::Null
    } else {
        CellValue::Text(trimmed.to_string())
    }
}

fn header_text(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.trim().to_string(),
        other => other.to_string().trim().to_string(),
    }
}

fn excel_cell(cell: &Data) -> CellValue {
    match cell {
        Data::Empty | Data::Error(_) => CellValue::Null,
        Data::Bool(b) => CellValue::Bool(*b),
        Data::Int(i) => CellValue::Int(*i),
        Data::Float(f) => CellValue::Float(*f),
        Data::String(s) => coerce_cell(s),
        Data::DateTime(dt) => match dt.as_datetime() {
            Some(naive) => CellValue::DateTime(naive),
            None => CellValue::Float(dt.as_f64()),
        },
        Data::DateTimeIso(s) | Data::DurationIso(s) => coerce_cell(s),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_dispatch() {
        assert_eq!(FileFormat::from_filename("a.CSV").unwrap(), FileFormat::Csv);
        assert_eq!(FileFormat::from_filename("报表.xlsx").unwrap(), FileFormat::Excel);
        assert_eq!(FileFormat::from_filename("old.xls").unwrap(), FileFormat::Excel);
        assert!(matches!(
            FileFormat::from_filename("notes.txt"),
            Err(AgentError::UnsupportedFormat(_))
        ));
        assert!(matches!(
            FileFormat::from_filename("README"),
            Err(AgentError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_csv_short_rows_and_empty_cells() {
        let csv = "id,name,city\n1,Ann,Paris\n2,,\n3\n";
        let parsed = parse_file(csv.as_bytes(), "people.csv").unwrap();
        assert_eq!(parsed.headers, vec!["id", "name", "city"]);
        assert_eq!(parsed.rows.len(), 3);
        assert_eq!(parsed.rows[1].get("name"), Some(&CellValue::Null));
        assert_eq!(parsed.rows[2].len(), 1);
        assert!(parsed.rows[2].get("city").is_none());
    }

    #[test]
    fn test_csv_bom_and_duplicate_headers() {
        let mut bytes = UTF8_BOM.to_vec();
        bytes.extend_from_slice("金额,金额,,备注\n1,2,3,x\n".as_bytes());
        let parsed = parse_csv(&bytes).unwrap();
        assert_eq!(parsed.headers, vec!["金额", "金额.1", "Unnamed: 2", "备注"]);
        assert_eq!(parsed.rows[0].get("金额.1"), Some(&CellValue::Text("2".into())));
    }

    #[test]
    fn test_empty_inputs() {
        assert!(matches!(parse_file(b"", "empty.csv"), Err(AgentError::EmptyInput(_))));
        assert!(matches!(parse_file(b"a,b\n", "header_only.csv"), Err(AgentError::EmptyInput(_))));
        assert!(matches!(parse_file(b",,\n1,2,3\n", "blank_header.csv"), Err(AgentError::EmptyInput(_))));
    }

    #[test]
    fn test_gbk_csv_is_decoded() {
        // "金额,客户\n100,张三\n" encoded as GBK
        let mut bytes = vec![0xBD, 0xF0, 0xB6, 0xEE, b','];
        bytes.extend_from_slice(&[0xBF, 0xCD, 0xBB, 0xA7]);
        bytes.extend_from_slice(b"\n100,");
        bytes.extend_from_slice(&[0xD5, 0xC5, 0xC8, 0xFD]);
        bytes.push(b'\n');

        let parsed = parse_csv(&bytes).unwrap();
        assert_eq!(parsed.headers, vec!["金额", "客户"]);
        assert_eq!(parsed.rows[0].get("客户"), Some(&CellValue::Text("张三".into())));
    }

    #[test]
    fn test_undecodable_csv_is_parse_error() {
        // 0xFF is not a lead byte in UTF-8 or GB18030
        let bytes = [b'a', b'\n', 0xFF, 0xFF, b'\n'];
        assert!(matches!(parse_csv(&bytes), Err(AgentError::Parse(_))));
    }

    #[test]
    fn test_excel_cells_keep_their_types() {
        let bytes = include_bytes!("../../tests/fixtures/shipments.xlsx");
        let parsed = parse_file(bytes, "shipments.xlsx").unwrap();

        assert_eq!(parsed.headers, vec!["日期", "产品", "数量", "已发货"]);
        // The blank sheet row in between is skipped
        assert_eq!(parsed.rows.len(), 2);

        let first = &parsed.rows[0];
        let new_year = chrono::NaiveDate::from_ymd_opt(2024, 1, 1)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .unwrap();
        assert_eq!(first.get("日期"), Some(&CellValue::DateTime(new_year)));
        assert_eq!(first.get("产品"), Some(&CellValue::Text("苹果".into())));
        assert_eq!(first.get("数量").and_then(CellValue::as_f64), Some(3.0));
        assert_eq!(first.get("已发货"), Some(&CellValue::Bool(true)));
        assert_eq!(parsed.rows[1].get("数量").and_then(CellValue::as_f64), Some(2.5));
        assert_eq!(parsed.rows[1].get("已发货"), Some(&CellValue::Bool(false)));
    }

    #[test]
    fn test_garbage_workbook_is_parse_error() {
        let result = parse_file(b"definitely not a workbook", "broken.xlsx");
        assert!(matches!(result, Err(AgentError::Parse(_))));
    }
}
