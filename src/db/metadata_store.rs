//! Metadata Store - persists registry entries for uploaded and derived tables
//!
//! Lives in its own SQLite file next to the data database. Mock tables are
//! seeded on every start and are not stored here.

use crate::error::{AgentError, Result};
use crate::registry::{Provenance, TableMetadata};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{info, warn};

pub struct MetadataStore {
    db: Mutex<Connection>,
}

impl MetadataStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let db = Connection::open(path)
            .map_err(|e| AgentError::Database(format!("Failed to open metadata database: {}", e)))?;
        let store = Self { db: Mutex::new(db) };
        store.init_schema()?;
        info!("Opened metadata database at {}", path.display());
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let store = Self {
            db: Mutex::new(Connection::open_in_memory()?),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn db(&self) -> Result<MutexGuard<'_, Connection>> {
        self.db
            .lock()
            .map_err(|_| AgentError::Database("metadata database lock poisoned".to_string()))
    }

    fn init_schema(&self) -> Result<()> {
        let db = self.db()?;
        db.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS table_metadata (
                physical_name TEXT PRIMARY KEY,
                display_name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                provenance TEXT NOT NULL,
                upload_id TEXT,
                table_comment TEXT,
                row_count INTEGER NOT NULL DEFAULT 0,
                sample_questions TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS column_metadata (
                physical_name TEXT NOT NULL,
                position INTEGER NOT NULL,
                column_name TEXT NOT NULL,
                original_name TEXT,
                comment TEXT,
                PRIMARY KEY (physical_name, column_name)
            );
            CREATE INDEX IF NOT EXISTS idx_column_metadata_table ON column_metadata(physical_name);
            "#,
        )?;
        Ok(())
    }

    /// Insert or replace the record for `metadata.physical_name`.
    pub fn save(&self, metadata: &TableMetadata) -> Result<()> {
        let mut db = self.db()?;
        let tx = db.transaction()?;

        tx.execute(
            r#"
            INSERT OR REPLACE INTO table_metadata
            (physical_name, display_name, description, provenance, upload_id, table_comment, row_count, sample_questions, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                metadata.physical_name,
                metadata.display_name,
                metadata.description,
                metadata.provenance.as_str(),
                metadata.upload_id,
                metadata.table_comment,
                metadata.row_count as i64,
                serde_json::to_string(&metadata.sample_questions)?,
                metadata.created_at.to_rfc3339(),
            ],
        )?;

        tx.execute(
            "DELETE FROM column_metadata WHERE physical_name = ?1",
            params![metadata.physical_name],
        )?;
        for (position, column) in metadata.column_names.iter().enumerate() {
            tx.execute(
                r#"
                INSERT INTO column_metadata (physical_name, position, column_name, original_name, comment)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                params![
                    metadata.physical_name,
                    position as i64,
                    column,
                    metadata.column_original_names.get(column),
                    metadata.column_comments.get(column),
                ],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    pub fn get(&self, physical_name: &str) -> Result<Option<TableMetadata>> {
        let db = self.db()?;
        let record = db
            .query_row(
                r#"
                SELECT physical_name, display_name, description, provenance, upload_id,
                       table_comment, row_count, sample_questions, created_at
                FROM table_metadata WHERE physical_name = ?1
                "#,
                params![physical_name],
                read_record,
            )
            .optional()?;
        match record {
            Some(record) => Ok(Some(attach_columns(&db, record)?)),
            None => Ok(None),
        }
    }

    /// Every stored record, oldest first. Records that no longer decode are
    /// skipped with a warning.
    pub fn load_all(&self) -> Result<Vec<TableMetadata>> {
        let db = self.db()?;
        let records = {
            let mut stmt = db.prepare(
                r#"
                SELECT physical_name, display_name, description, provenance, upload_id,
                       table_comment, row_count, sample_questions, created_at
                FROM table_metadata ORDER BY created_at, physical_name
                "#,
            )?;
            let rows = stmt.query_map([], read_record)?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        };

        let mut tables = Vec::with_capacity(records.len());
        for record in records {
            let name = record.physical_name.clone();
            match attach_columns(&db, record) {
                Ok(meta) => tables.push(meta),
                Err(e) => warn!("Skipping stored metadata for {}: {}", name, e),
            }
        }
        Ok(tables)
    }

    pub fn delete(&self, physical_name: &str) -> Result<bool> {
        let mut db = self.db()?;
        let tx = db.transaction()?;
        tx.execute(
            "DELETE FROM column_metadata WHERE physical_name = ?1",
            params![physical_name],
        )?;
        let removed = tx.execute(
            "DELETE FROM table_metadata WHERE physical_name = ?1",
            params![physical_name],
        )?;
        tx.commit()?;
        Ok(removed > 0)
    }
}

struct StoredRecord {
    physical_name: String,
    display_name: String,
    description: String,
    provenance: String,
    upload_id: Option<String>,
    table_comment: Option<String>,
    row_count: i64,
    sample_questions: String,
    created_at: String,
}

fn read_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredRecord> {
    Ok(StoredRecord {
        physical_name: row.get(0)?,
        display_name: row.get(1)?,
        description: row.get(2)?,
        provenance: row.get(3)?,
        upload_id: row.get(4)?,
        table_comment: row.get(5)?,
        row_count: row.get(6)?,
        sample_questions: row.get(7)?,
        created_at: row.get(8)?,
    })
}

fn attach_columns(db: &Connection, record: StoredRecord) -> Result<TableMetadata> {
    let provenance = Provenance::parse(&record.provenance).ok_or_else(|| {
        AgentError::InvalidMetadata(format!("unknown provenance '{}'", record.provenance))
    })?;
    let created_at = DateTime::parse_from_rfc3339(&record.created_at)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| AgentError::InvalidMetadata(format!("bad created_at: {}", e)))?;
    let sample_questions: Vec<String> = serde_json::from_str(&record.sample_questions)?;

    let mut stmt = db.prepare(
        r#"
        SELECT column_name, original_name, comment
        FROM column_metadata WHERE physical_name = ?1 ORDER BY position
        "#,
    )?;
    let columns = stmt
        .query_map(params![record.physical_name], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, Option<String>>(2)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut column_names = Vec::with_capacity(columns.len());
    let mut column_original_names = HashMap::new();
    let mut column_comments = HashMap::new();
    for (name, original, comment) in columns {
        if let Some(original) = original {
            column_original_names.insert(name.clone(), original);
        }
        if let Some(comment) = comment {
            column_comments.insert(name.clone(), comment);
        }
        column_names.push(name);
    }

    let metadata = TableMetadata {
        display_name: record.display_name,
        physical_name: record.physical_name,
        row_count: record.row_count.max(0) as usize,
        column_names,
        description: record.description,
        provenance,
        upload_id: record.upload_id,
        table_comment: record.table_comment,
        column_comments,
        column_original_names,
        sample_questions,
        created_at,
    };
    metadata.validate()?;
    Ok(metadata)
}
