//! Error types for the sync engine.

use thiserror::Error;

use crate::metadata::models::ErrorType;

/// Main error type for sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Destination/metadata database error
    #[error("Database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// Source or destination connector failure that is worth retrying
    #[error("Connection error: {0}")]
    Connection(String),

    /// A single record could not be transformed for the destination
    #[error("Transformation error for table {table}: {message}")]
    Transformation { table: String, message: String },

    /// Value failed validation at a trust boundary
    #[error("Validation error: {0}")]
    Validation(String),

    /// Schema introspection, registration or migration failure
    #[error("Schema error: {0}")]
    Schema(String),

    /// A migration batch contains changes that require manual approval
    #[error("{count} schema changes require manual approval")]
    ApprovalRequired { count: usize },

    /// Operation exceeded its deadline
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Unknown connector type requested from the registry
    #[error("Unsupported connector type '{kind}'. Available: {available}")]
    UnsupportedConnector { kind: String, available: String },

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Sync was cancelled (SIGINT, etc.)
    #[error("Sync cancelled")]
    Cancelled,
}

impl SyncError {
    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl ToString, context: impl Into<String>) -> Self {
        SyncError::Pool {
            message: message.to_string(),
            context: context.into(),
        }
    }

    /// Create a Transformation error for a specific table
    pub fn transformation(table: impl Into<String>, message: impl Into<String>) -> Self {
        SyncError::Transformation {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Whether this error is transient and worth retrying with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Connection(_) | SyncError::Timeout(_) | SyncError::Pool { .. } => true,
            SyncError::Database(e) => e.is_closed() || e.as_db_error().is_none(),
            _ => false,
        }
    }

    /// Classify this error for the metadata error log.
    pub fn error_type(&self) -> ErrorType {
        match self {
            SyncError::Connection(_) | SyncError::Pool { .. } => ErrorType::Connection,
            SyncError::Timeout(_) => ErrorType::Timeout,
            SyncError::Transformation { .. } => ErrorType::Transformation,
            SyncError::Validation(_) => ErrorType::Validation,
            SyncError::Schema(_) | SyncError::ApprovalRequired { .. } => ErrorType::Schema,
            SyncError::Database(e) => classify_db_error(e),
            _ => ErrorType::Validation,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Map a PostgreSQL error to the metadata error taxonomy via SQLSTATE class.
fn classify_db_error(err: &tokio_postgres::Error) -> ErrorType {
    if err.is_closed() {
        return ErrorType::Connection;
    }
    let Some(db) = err.as_db_error() else {
        return ErrorType::Connection;
    };
    match db.code().code() {
        // Class 23: integrity constraint violation
        c if c.starts_with("23") => ErrorType::Constraint,
        // Class 28: invalid authorization, 42501: insufficient privilege
        c if c.starts_with("28") || c == "42501" => ErrorType::Permission,
        // Class 42: syntax error or access rule violation (DDL drift)
        c if c.starts_with("42") => ErrorType::Schema,
        // 57014: query canceled (statement timeout)
        "57014" => ErrorType::Timeout,
        c if c.starts_with("08") => ErrorType::Connection,
        _ => ErrorType::Constraint,
    }
}

/// Result type alias for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
