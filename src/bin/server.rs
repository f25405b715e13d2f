//! HTTP API server for the SQL agent
//! Plain tokio TCP loop with hand-rolled HTTP/1.1 handling

use anyhow::Context;
use clap::Parser;
use serde::Deserialize;
use serde_json::json;
use sql_agent::config::Settings;
use sql_agent::error::AgentError;
use sql_agent::query::DEFAULT_PREVIEW_ROWS;
use sql_agent::workspace::Workspace;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Headers plus JSON bodies never need more than this.
const HEADER_ALLOWANCE: usize = 64 * 1024;
const READ_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "sql-agent-server")]
#[command(about = "Natural-language SQL analyst with spreadsheet upload")]
struct Args {
    /// Bind address (or set HOST)
    #[arg(long)]
    host: Option<String>,

    /// Port (or set PORT)
    #[arg(short, long)]
    port: Option<u16>,

    /// Data database path (or set DATABASE_PATH)
    #[arg(long)]
    database: Option<PathBuf>,

    /// Metadata database path (or set METADATA_DATABASE_PATH)
    #[arg(long)]
    metadata_database: Option<PathBuf>,

    /// Skip seeding the mock ERP tables
    #[arg(long)]
    no_seed: bool,
}

struct AppState {
    workspace: Workspace,
    max_upload_bytes: usize,
    llm_enabled: bool,
}

struct Request {
    method: String,
    path: String,
    query: HashMap<String, String>,
    body: Vec<u8>,
}

#[derive(Deserialize)]
struct AskBody {
    table_name: String,
    query: String,
}

#[derive(Deserialize)]
struct ChatBody {
    message: String,
    table_name: Option<String>,
    session_id: Option<String>,
}

#[derive(Deserialize)]
struct SqlBody {
    sql: String,
}

#[derive(Deserialize)]
struct DerivedBody {
    sql: String,
    name: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let mut settings = Settings::from_env().context("invalid configuration")?;
    if let Some(host) = args.host {
        settings.host = host;
    }
    if let Some(port) = args.port {
        settings.port = port;
    }
    if let Some(database) = args.database {
        settings.database_path = database;
    }
    if let Some(metadata_database) = args.metadata_database {
        settings.metadata_database_path = metadata_database;
    }
    if args.no_seed {
        settings.seed_mock_data = false;
    }

    let workspace = Workspace::open(&settings).context("failed to open workspace")?;
    let state = Arc::new(AppState {
        workspace,
        max_upload_bytes: settings.max_upload_bytes,
        llm_enabled: settings.llm_configured(),
    });

    let listener = TcpListener::bind((settings.host.as_str(), settings.port))
        .await
        .with_context(|| format!("failed to bind {}:{}", settings.host, settings.port))?;
    info!("Server listening on http://{}:{}", settings.host, settings.port);

    loop {
        let (stream, addr) = listener.accept().await?;
        debug!("New connection from {}", addr);
        tokio::spawn(handle_connection(stream, state.clone()));
    }
}

async fn handle_connection(mut stream: TcpStream, state: Arc<AppState>) {
    let limit = state.max_upload_bytes + HEADER_ALLOWANCE;
    let raw = match tokio::time::timeout(READ_TIMEOUT, read_request(&mut stream, limit)).await {
        Ok(Ok(Some(raw))) => raw,
        Ok(Ok(None)) => return,
        Ok(Err(e)) => {
            warn!("Failed to read request: {}", e);
            return;
        }
        Err(_) => {
            warn!("Request read timeout");
            return;
        }
    };

    let response = match parse_request(&raw) {
        Some(request) if request.body.len() > state.max_upload_bytes => error_response(
            413,
            "Payload Too Large",
            &format!("request body exceeds {} bytes", state.max_upload_bytes),
        ),
        Some(request) => handle_request(request, &state).await,
        None => error_response(400, "Bad Request", "malformed HTTP request"),
    };

    if let Err(e) = stream.write_all(response.as_bytes()).await {
        error!("Failed to write response: {}", e);
    }
}

/// Read one request: headers, then `Content-Length` bytes of body. Stops
/// early once `limit` is passed so oversized uploads can be refused.
async fn read_request(stream: &mut TcpStream, limit: usize) -> std::io::Result<Option<Vec<u8>>> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 8192];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..n]);

        if let Some(headers_end) = find_header_end(&buffer) {
            let content_length = extract_content_length(&String::from_utf8_lossy(&buffer[..headers_end])).unwrap_or(0);
            if buffer.len() >= headers_end + content_length {
                break;
            }
        }
        if buffer.len() > limit {
            break;
        }
    }

    Ok(if buffer.is_empty() { None } else { Some(buffer) })
}

fn find_header_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|w| w == b"\r\n\r\n").map(|pos| pos + 4)
}

fn extract_content_length(headers: &str) -> Option<usize> {
    headers.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if key.trim().eq_ignore_ascii_case("content-length") {
            value.trim().parse().ok()
        } else {
            None
        }
    })
}

fn parse_request(raw: &[u8]) -> Option<Request> {
    let headers_end = find_header_end(raw)?;
    let head = String::from_utf8_lossy(&raw[..headers_end]);
    let request_line = head.lines().next()?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next()?.to_string();
    let target = parts.next()?;

    // Resolve against a dummy origin to get percent-decoded query pairs
    let url = reqwest::Url::parse(&format!("http://localhost{}", target)).ok()?;
    let mut path = url.path().trim_end_matches('/').to_string();
    if path.is_empty() {
        path = "/".to_string();
    }
    let query = url.query_pairs().into_owned().collect();

    Some(Request {
        method,
        path,
        query,
        body: raw[headers_end..].to_vec(),
    })
}

async fn handle_request(request: Request, state: &AppState) -> String {
    debug!("Request: {} {}", request.method, request.path);
    let workspace = &state.workspace;

    let segments: Vec<&str> = request.path.trim_start_matches('/').split('/').collect();
    let result: Result<serde_json::Value, AgentError> = match (request.method.as_str(), segments.as_slice()) {
        ("OPTIONS", _) => return create_response(204, "No Content", ""),

        ("GET", ["api", "health"]) => Ok(json!({
            "status": "ok",
            "llm_enabled": state.llm_enabled,
            "tables": workspace.registry().len(),
            "active_sessions": workspace.chats().len(),
        })),

        ("GET", ["api", "datasources"]) => Ok(json!({ "datasources": workspace.list_sources() })),

        ("GET", ["api", "tables", name]) => workspace
            .query()
            .resolve(name)
            .map(|meta| json!({ "table": meta })),

        ("GET", ["api", "tables", name, "preview"]) => {
            let limit = request
                .query
                .get("limit")
                .and_then(|l| l.parse::<usize>().ok())
                .unwrap_or(DEFAULT_PREVIEW_ROWS);
            workspace.query().preview(name, limit).map(|out| {
                json!({
                    "columns": out.columns,
                    "row_count": out.row_count(),
                    "rows": out.records(),
                })
            })
        }

        ("DELETE", ["api", "tables", name]) => workspace
            .delete_table(name)
            .map(|meta| json!({ "deleted": meta.physical_name })),

        ("POST", ["api", "upload"]) => match request.query.get("filename") {
            Some(filename) => upload(workspace, &request.body, filename).await,
            None => Err(AgentError::UnsupportedFormat(
                "missing ?filename= (expected .csv, .xlsx or .xls)".to_string(),
            )),
        },

        ("POST", ["api", "query"]) => match parse_body::<AskBody>(&request.body) {
            Ok(body) => workspace
                .query()
                .ask(&body.table_name, &body.query)
                .await
                .and_then(|answer| Ok(serde_json::to_value(answer)?)),
            Err(e) => Err(e),
        },

        ("POST", ["api", "chat"]) => match parse_body::<ChatBody>(&request.body) {
            Ok(body) => workspace
                .chat(body.session_id.as_deref(), body.table_name.as_deref(), &body.message)
                .await
                .and_then(|reply| Ok(serde_json::to_value(reply)?)),
            Err(e) => Err(e),
        },

        ("POST", ["api", "sql"]) => parse_body::<SqlBody>(&request.body).and_then(|body| {
            let out = workspace.query().execute_sql(&body.sql)?;
            Ok(json!({
                "columns": out.columns,
                "row_count": out.row_count(),
                "rows": out.records(),
            }))
        }),

        ("POST", ["api", "derived"]) => parse_body::<DerivedBody>(&request.body).and_then(|body| {
            let meta = workspace.save_query_result(&body.sql, &body.name)?;
            Ok(json!({ "table": meta }))
        }),

        _ => return error_response(404, "Not Found", &format!("no route for {} {}", request.method, request.path)),
    };

    match result {
        Ok(mut payload) => {
            if let Some(object) = payload.as_object_mut() {
                object.insert("success".to_string(), json!(true));
            }
            create_response(200, "OK", &payload.to_string())
        }
        Err(e) => {
            let (status, status_text) = error_status(&e);
            if status >= 500 {
                error!("{} {} failed: {}", request.method, request.path, e);
            }
            error_response(status, status_text, &e.to_string())
        }
    }
}

async fn upload(workspace: &Workspace, body: &[u8], filename: &str) -> Result<serde_json::Value, AgentError> {
    let result = workspace.upload(body, filename).await?;
    info!(
        "Uploaded {} as {} ({} rows)",
        filename, result.physical_table_name, result.estimated_rows
    );
    Ok(serde_json::to_value(result)?)
}

fn parse_body<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, AgentError> {
    serde_json::from_slice(body).map_err(|e| AgentError::InvalidQuery(format!("invalid request body: {}", e)))
}

fn error_status(err: &AgentError) -> (u16, &'static str) {
    match err {
        AgentError::UnsupportedFormat(_)
        | AgentError::EmptyInput(_)
        | AgentError::Parse(_)
        | AgentError::InvalidQuery(_)
        | AgentError::InvalidMetadata(_) => (400, "Bad Request"),
        AgentError::ProtectedTable(_) => (403, "Forbidden"),
        AgentError::TableNotFound(_) => (404, "Not Found"),
        AgentError::DuplicateTable(_) => (409, "Conflict"),
        AgentError::LlmUnavailable(_) => (503, "Service Unavailable"),
        _ => (500, "Internal Server Error"),
    }
}

fn error_response(status: u16, status_text: &str, message: &str) -> String {
    let body = json!({ "success": false, "error": message });
    create_response(status, status_text, &body.to_string())
}

fn create_response(status: u16, status_text: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: application/json; charset=utf-8\r\n\
         Access-Control-Allow-Origin: *\r\n\
         Access-Control-Allow-Methods: GET, POST, DELETE, OPTIONS\r\n\
         Access-Control-Allow-Headers: Content-Type\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        status,
        status_text,
        body.len(),
        body
    )
}
