//! Physical table storage
//!
//! Every data column is declared `TEXT`; the schema carries names only and
//! typing lives in the column profiles. A load creates the table and inserts
//! its rows inside one transaction, so a failed load leaves nothing behind.

use crate::error::{AgentError, Result};
use crate::ingestion::sanitizer::quote_identifier;
use crate::value::{CellValue, Row};
use itertools::Itertools;
use rusqlite::types::{Value, ValueRef};
use rusqlite::{params, params_from_iter, Connection};
use serde::Serialize;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

/// Tabular result of a read query.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryOutput {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
}

impl QueryOutput {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Rows as JSON objects keyed by column name. A repeated column name keeps
    /// its last value.
    pub fn records(&self) -> Vec<serde_json::Value> {
        self.rows
            .iter()
            .map(|row| {
                let map: serde_json::Map<String, serde_json::Value> = self
                    .columns
                    .iter()
                    .cloned()
                    .zip(row.iter().cloned())
                    .collect();
                serde_json::Value::Object(map)
            })
            .collect()
    }
}

/// Physical storage behind the registry.
pub trait TableStore: Send + Sync {
    /// Names of every table in the storage catalog, registered or not.
    fn list_tables(&self) -> Result<Vec<String>>;

    /// Case-insensitive catalog check.
    fn table_exists(&self, name: &str) -> Result<bool>;

    /// Create `name` with `columns` and insert `rows` (keyed by those column
    /// names; absent keys become NULL) as one unit. Fails if `name` exists.
    fn load_table(&self, name: &str, columns: &[String], rows: &[Row]) -> Result<usize>;

    fn drop_table(&self, name: &str) -> Result<()>;

    fn count_rows(&self, name: &str) -> Result<usize>;

    /// Run a read-only statement.
    fn query(&self, sql: &str) -> Result<QueryOutput>;
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)
            .map_err(|e| AgentError::Database(format!("Failed to open data database: {}", e)))?;
        info!("Opened data database at {}", path.display());
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AgentError::Database("data database lock poisoned".to_string()))
    }
}

impl TableStore for SqliteStore {
    fn list_tables(&self) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(names)
    }

    fn table_exists(&self, name: &str) -> Result<bool> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND lower(name) = lower(?1)",
            params![name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn load_table(&self, name: &str, columns: &[String], rows: &[Row]) -> Result<usize> {
        if columns.is_empty() {
            return Err(AgentError::StorageWrite(format!("table '{}' has no columns", name)));
        }

        let column_defs = columns
            .iter()
            .map(|c| format!("{} TEXT", quote_identifier(c)))
            .join(", ");
        // No IF NOT EXISTS: an existing table must fail the load
        let create_sql = format!("CREATE TABLE {} ({})", quote_identifier(name), column_defs);
        let insert_sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_identifier(name),
            columns.iter().map(|c| quote_identifier(c)).join(", "),
            (1..=columns.len()).map(|i| format!("?{}", i)).join(", ")
        );

        let write_err = |e: rusqlite::Error| AgentError::StorageWrite(format!("loading '{}': {}", name, e));

        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(write_err)?;
        tx.execute(&create_sql, []).map_err(write_err)?;
        {
            let mut stmt = tx.prepare(&insert_sql).map_err(write_err)?;
            for row in rows {
                let values = columns.iter().map(|c| to_sql_value(row.get(c)));
                stmt.execute(params_from_iter(values)).map_err(write_err)?;
            }
        }
        tx.commit().map_err(write_err)?;

        info!("Loaded {} rows into {} ({} columns)", rows.len(), name, columns.len());
        Ok(rows.len())
    }

    fn drop_table(&self, name: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(&format!("DROP TABLE {}", quote_identifier(name)), [])?;
        debug!("Dropped table {}", name);
        Ok(())
    }

    fn count_rows(&self, name: &str) -> Result<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", quote_identifier(name)),
            [],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as usize)
    }

    fn query(&self, sql: &str) -> Result<QueryOutput> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql)?;
        if !stmt.readonly() {
            return Err(AgentError::InvalidQuery("only read-only statements can be executed".to_string()));
        }

        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let width = columns.len();

        let mut rows = Vec::new();
        let mut cursor = stmt.query([])?;
        while let Some(row) = cursor.next()? {
            let mut values = Vec::with_capacity(width);
            for idx in 0..width {
                values.push(json_value(row.get_ref(idx)?));
            }
            rows.push(values);
        }

        Ok(QueryOutput { columns, rows })
    }
}

fn to_sql_value(cell: Option<&CellValue>) -> Value {
    match cell {
        None | Some(CellValue::Null) => Value::Null,
        Some(CellValue::Float(f)) if f.is_nan() => Value::Null,
        Some(other) => Value::Text(other.to_string()),
    }
}

fn json_value(value: ValueRef<'_>) -> serde_json::Value {
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => serde_json::Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        ValueRef::Text(bytes) => serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => serde_json::Value::String(format!("<{} bytes>", bytes.len())),
    }
}
