use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Unsupported file format: {0}")]
    UnsupportedFormat(String),

    #[error("Empty input: {0}")]
    EmptyInput(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Table already registered: {0}")]
    DuplicateTable(String),

    #[error("Table not found: {0}")]
    TableNotFound(String),

    #[error("Table is protected: {0}")]
    ProtectedTable(String),

    #[error("Invalid table metadata: {0}")]
    InvalidMetadata(String),

    #[error("Storage write failed: {0}")]
    StorageWrite(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("LLM is not configured: {0}")]
    LlmUnavailable(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for AgentError {
    fn from(err: rusqlite::Error) -> Self {
        AgentError::Database(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;
