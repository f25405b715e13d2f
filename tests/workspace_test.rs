use sql_agent::config::Settings;
use sql_agent::db::{MetadataStore, SqliteStore, TableStore};
use sql_agent::value::{CellValue, Row};
use sql_agent::{AgentError, Provenance, Workspace};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn open_workspace(dir: &Path) -> Result<Workspace, AgentError> {
    let store: Arc<dyn TableStore> = Arc::new(SqliteStore::open(dir.join("data.db"))?);
    let metadata_store = Arc::new(MetadataStore::open(dir.join("metadata.db"))?);
    Ok(Workspace::new(store, Some(metadata_store), None, Duration::from_secs(1)))
}

#[tokio::test]
async fn test_uploads_survive_restart() -> TestResult {
    let dir = TempDir::new()?;

    let uploaded = {
        let ws = open_workspace(dir.path())?;
        let report = ws.bootstrap(true)?;
        assert_eq!(report.mock_tables.len(), 3);
        assert!(report.restored.is_empty());

        let result = ws.upload("客户,金额\n张三,10\n李四,20\n".as_bytes(), "orders.csv").await?;
        result.metadata
    };

    let ws = open_workspace(dir.path())?;
    let report = ws.bootstrap(true)?;
    assert_eq!(report.mock_tables.len(), 3);
    assert_eq!(report.restored, vec![uploaded.physical_name.clone()]);
    assert!(report.orphans.is_empty());

    let restored = ws
        .registry()
        .get(&uploaded.physical_name)
        .ok_or("upload was not restored")?;
    assert_eq!(restored.column_names, uploaded.column_names);
    assert_eq!(restored.column_original_names, uploaded.column_original_names);
    assert_eq!(restored.upload_id, uploaded.upload_id);
    assert_eq!(restored.sample_questions, uploaded.sample_questions);

    let out = ws
        .query()
        .execute_sql(&format!("SELECT COUNT(*) FROM {}", uploaded.physical_name))?;
    assert_eq!(out.rows[0][0], 2);
    Ok(())
}

#[tokio::test]
async fn test_bootstrap_prunes_and_reports_orphans() -> TestResult {
    let dir = TempDir::new()?;

    {
        let ws = open_workspace(dir.path())?;
        ws.bootstrap(false)?;
        ws.upload(b"a\n1\n", "kept.csv").await?;
        ws.upload(b"a\n1\n", "lost.csv").await?;
    }

    // Simulate an external drop and a half-finished load from another process
    {
        let store = SqliteStore::open(dir.path().join("data.db"))?;
        store.drop_table("lost")?;
        let row: Row = [("a".to_string(), CellValue::Int(1))].into_iter().collect();
        store.load_table("stray", &["a".to_string()], &[row])?;
    }

    let ws = open_workspace(dir.path())?;
    let report = ws.bootstrap(false)?;
    assert_eq!(report.restored, vec!["kept"]);
    assert_eq!(report.pruned, vec!["lost"]);
    assert_eq!(report.orphans, vec!["stray"]);

    assert!(!ws.registry().exists("stray"));
    assert!(matches!(ws.query().resolve("stray"), Err(AgentError::TableNotFound(_))));

    // The orphan's name is still avoided
    let next = ws.upload(b"b\n2\n", "stray.csv").await?;
    assert_eq!(next.physical_table_name, "stray_2");

    // A pruned record does not come back
    let metadata_store = MetadataStore::open(dir.path().join("metadata.db"))?;
    assert!(metadata_store.get("lost")?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_delete_rules() -> TestResult {
    let dir = TempDir::new()?;
    let ws = open_workspace(dir.path())?;
    ws.bootstrap(true)?;

    let err = ws.delete_table("erp_sales_orders").unwrap_err();
    assert!(matches!(err, AgentError::ProtectedTable(_)));

    let upload = ws.upload(b"k,v\n1,2\n", "scratch.csv").await?;
    let derived = ws.save_query_result("SELECT region, COUNT(*) AS n FROM erp_customers GROUP BY region", "by_region")?;
    assert_eq!(derived.provenance, Provenance::Derived);
    assert_eq!(derived.physical_name, "by_region");

    let before = ws.registry().len();
    ws.delete_table(&upload.physical_table_name)?;
    ws.delete_table("by_region")?;
    assert_eq!(ws.registry().len(), before - 2);
    assert!(matches!(ws.delete_table("by_region"), Err(AgentError::TableNotFound(_))));

    // Deleted tables are gone from storage and from the persisted metadata
    let metadata_store = MetadataStore::open(dir.path().join("metadata.db"))?;
    assert!(metadata_store.load_all()?.is_empty());
    Ok(())
}

#[test]
fn test_open_from_settings() -> TestResult {
    let dir = TempDir::new()?;
    let settings = Settings {
        database_path: dir.path().join("nested").join("data.db"),
        metadata_database_path: dir.path().join("nested").join("metadata.db"),
        ..Settings::default()
    };

    let ws = Workspace::open(&settings)?;
    assert_eq!(ws.list_sources().len(), 3);
    assert!(ws.list_sources().iter().all(|s| !s.deletable));
    Ok(())
}
