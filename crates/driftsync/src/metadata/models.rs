//! Data models for the metadata subsystem: position markers, schema
//! registry, sync runs, error log and dead letter queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{Result, SyncError};

/// Types of sync position markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerType {
    /// Stream-based CDC position (resume token, LSN).
    Stream,
    /// Batch processing watermark (timestamp).
    Batch,
    /// Initial load progress.
    Initial,
}

impl MarkerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarkerType::Stream => "stream",
            MarkerType::Batch => "batch",
            MarkerType::Initial => "initial",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "stream" => Ok(MarkerType::Stream),
            "batch" => Ok(MarkerType::Batch),
            "initial" => Ok(MarkerType::Initial),
            _ => Err(SyncError::Validation(format!("Invalid marker type: {}", s))),
        }
    }
}

/// Types of sync operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    Stream,
    Batch,
    Initial,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Stream => "stream",
            SyncMode::Batch => "batch",
            SyncMode::Initial => "initial",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "stream" => Ok(SyncMode::Stream),
            "batch" => Ok(SyncMode::Batch),
            "initial" => Ok(SyncMode::Initial),
            _ => Err(SyncError::Validation(format!("Invalid sync mode: {}", s))),
        }
    }
}

/// Status of a sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Running => "running",
            SyncStatus::Completed => "completed",
            SyncStatus::Failed => "failed",
            SyncStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(SyncStatus::Running),
            "completed" => Ok(SyncStatus::Completed),
            "failed" => Ok(SyncStatus::Failed),
            "cancelled" => Ok(SyncStatus::Cancelled),
            _ => Err(SyncError::Validation(format!("Invalid sync status: {}", s))),
        }
    }
}

/// Error taxonomy for the error log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    Connection,
    Transformation,
    Constraint,
    Schema,
    Timeout,
    Permission,
    Validation,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::Connection => "connection",
            ErrorType::Transformation => "transformation",
            ErrorType::Constraint => "constraint",
            ErrorType::Schema => "schema",
            ErrorType::Timeout => "timeout",
            ErrorType::Permission => "permission",
            ErrorType::Validation => "validation",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "connection" => Ok(ErrorType::Connection),
            "transformation" => Ok(ErrorType::Transformation),
            "constraint" => Ok(ErrorType::Constraint),
            "schema" => Ok(ErrorType::Schema),
            "timeout" => Ok(ErrorType::Timeout),
            "permission" => Ok(ErrorType::Permission),
            "validation" => Ok(ErrorType::Validation),
            _ => Err(SyncError::Validation(format!("Invalid error type: {}", s))),
        }
    }
}

/// Status of an error log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStatus {
    Open,
    Resolved,
    Ignored,
}

impl ErrorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorStatus::Open => "open",
            ErrorStatus::Resolved => "resolved",
            ErrorStatus::Ignored => "ignored",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "open" => Ok(ErrorStatus::Open),
            "resolved" => Ok(ErrorStatus::Resolved),
            "ignored" => Ok(ErrorStatus::Ignored),
            _ => Err(SyncError::Validation(format!("Invalid error status: {}", s))),
        }
    }
}

/// Status of a dead letter queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DlqStatus {
    Pending,
    Processing,
    Resolved,
    Discarded,
}

impl DlqStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DlqStatus::Pending => "pending",
            DlqStatus::Processing => "processing",
            DlqStatus::Resolved => "resolved",
            DlqStatus::Discarded => "discarded",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(DlqStatus::Pending),
            "processing" => Ok(DlqStatus::Processing),
            "resolved" => Ok(DlqStatus::Resolved),
            "discarded" => Ok(DlqStatus::Discarded),
            _ => Err(SyncError::Validation(format!("Invalid DLQ status: {}", s))),
        }
    }
}

/// Why a schema version was registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvolutionType {
    Create,
    AddColumn,
    ModifyColumn,
    DropColumn,
    AddIndex,
    DropIndex,
}

impl EvolutionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvolutionType::Create => "create",
            EvolutionType::AddColumn => "add_column",
            EvolutionType::ModifyColumn => "modify_column",
            EvolutionType::DropColumn => "drop_column",
            EvolutionType::AddIndex => "add_index",
            EvolutionType::DropIndex => "drop_index",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "create" => Ok(EvolutionType::Create),
            "add_column" => Ok(EvolutionType::AddColumn),
            "modify_column" => Ok(EvolutionType::ModifyColumn),
            "drop_column" => Ok(EvolutionType::DropColumn),
            "add_index" => Ok(EvolutionType::AddIndex),
            "drop_index" => Ok(EvolutionType::DropIndex),
            _ => Err(SyncError::Validation(format!(
                "Invalid evolution type: {}",
                s
            ))),
        }
    }
}

/// A persisted sync position marker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMarker {
    pub id: Uuid,
    pub schema_name: String,
    pub table_name: Option<String>,
    pub marker_type: MarkerType,
    /// Opaque position payload (LSN, resume token, timestamp, ...).
    pub position_data: Value,
    pub last_updated: DateTime<Utc>,
    pub sync_run_id: Option<Uuid>,
}

impl SyncMarker {
    /// Build a marker, rejecting empty position payloads at the boundary.
    pub fn new(
        schema_name: impl Into<String>,
        table_name: Option<String>,
        marker_type: MarkerType,
        position_data: Value,
    ) -> Result<Self> {
        validate_position_data(&position_data)?;
        Ok(Self {
            id: Uuid::new_v4(),
            schema_name: schema_name.into(),
            table_name,
            marker_type,
            position_data,
            last_updated: Utc::now(),
            sync_run_id: None,
        })
    }
}

/// Reject empty or non-object/scalar-null position payloads.
pub fn validate_position_data(position: &Value) -> Result<()> {
    let empty = match position {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::String(s) => s.is_empty(),
        _ => false,
    };
    if empty {
        return Err(SyncError::Validation(
            "position_data cannot be empty".to_string(),
        ));
    }
    Ok(())
}

/// A versioned, content-hashed table definition for the schema registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDefinition {
    pub columns: Vec<Value>,
    #[serde(default)]
    pub primary_keys: Vec<String>,
    #[serde(default)]
    pub indexes: Vec<Value>,
    #[serde(default)]
    pub constraints: Vec<Value>,
}

impl SchemaDefinition {
    /// SHA-256 over a canonicalized (sorted) representation, so structurally
    /// identical definitions hash identically regardless of field order.
    pub fn schema_hash(&self) -> String {
        let mut columns = self.columns.clone();
        columns.sort_by_key(|c| name_of(c));
        let mut primary_keys = self.primary_keys.clone();
        primary_keys.sort();
        let mut indexes = self.indexes.clone();
        indexes.sort_by_key(|i| name_of(i));
        let mut constraints = self.constraints.clone();
        constraints.sort_by_key(|c| name_of(c));

        let normalized = serde_json::json!({
            "columns": columns,
            "constraints": constraints,
            "indexes": indexes,
            "primary_keys": primary_keys,
        });

        let mut hasher = Sha256::new();
        hasher.update(canonical_json(&normalized).as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Build from the portable table schema model.
    pub fn from_table_schema(table: &crate::core::TableSchema) -> Self {
        Self {
            columns: table
                .columns
                .iter()
                .map(|c| serde_json::to_value(c).unwrap_or(Value::Null))
                .collect(),
            primary_keys: table.primary_keys.clone(),
            indexes: table
                .indexes
                .iter()
                .map(|i| serde_json::to_value(i).unwrap_or(Value::Null))
                .collect(),
            constraints: Vec::new(),
        }
    }
}

fn name_of(value: &Value) -> String {
    value
        .get("name")
        .and_then(|n| n.as_str())
        .unwrap_or_default()
        .to_string()
}

/// Serialize with object keys sorted at every level, so the hash input is
/// independent of insertion order.
fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let parts: Vec<String> = keys
                .iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(k).unwrap_or_default(),
                        canonical_json(&map[*k])
                    )
                })
                .collect();
            format!("{{{}}}", parts.join(","))
        }
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", parts.join(","))
        }
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// One entry in the schema registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaRegistryEntry {
    pub id: Uuid,
    pub schema_name: String,
    pub table_name: String,
    /// Strictly increasing per (schema, table); immutable once written.
    pub version: i32,
    pub schema_definition: SchemaDefinition,
    pub schema_hash: String,
    pub evolution_type: Option<EvolutionType>,
    pub previous_version: Option<i32>,
    pub compatibility_status: String,
    pub registered_at: DateTime<Utc>,
}

/// Statistics accumulated over one sync run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRunStatistics {
    pub records_processed: i64,
    pub records_inserted: i64,
    pub records_updated: i64,
    pub records_deleted: i64,
    pub records_failed: i64,
    pub bytes_processed: i64,
}

/// One execution attempt of a schema's sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRun {
    pub id: Uuid,
    pub schema_name: String,
    pub sync_mode: SyncMode,
    pub status: SyncStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub statistics: SyncRunStatistics,
    pub config_hash: Option<String>,
    pub error_message: Option<String>,
}

impl SyncRun {
    pub fn new(schema_name: impl Into<String>, sync_mode: SyncMode) -> Self {
        Self {
            id: Uuid::new_v4(),
            schema_name: schema_name.into(),
            sync_mode,
            status: SyncStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
            statistics: SyncRunStatistics::default(),
            config_hash: None,
            error_message: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == SyncStatus::Running
    }
}

/// One entry in the error log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorLogEntry {
    pub id: Uuid,
    pub sync_run_id: Option<Uuid>,
    pub schema_name: String,
    pub table_name: Option<String>,
    pub error_type: ErrorType,
    pub error_message: String,
    /// Record that caused the error, if applicable.
    pub record_data: Option<Value>,
    pub operation_type: Option<crate::core::OperationType>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub status: ErrorStatus,
    pub occurred_at: DateTime<Utc>,
}

impl ErrorLogEntry {
    pub fn new(
        schema_name: impl Into<String>,
        error_type: ErrorType,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            sync_run_id: None,
            schema_name: schema_name.into(),
            table_name: None,
            error_type,
            error_message: error_message.into(),
            record_data: None,
            operation_type: None,
            retry_count: 0,
            max_retries: 3,
            status: ErrorStatus::Open,
            occurred_at: Utc::now(),
        }
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries && self.status == ErrorStatus::Open
    }
}

/// One entry in the dead letter queue.
///
/// Identified by (schema, table, source_record_id): repeated failures of the
/// same source record increment `error_count` on the existing entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: Uuid,
    pub sync_run_id: Option<Uuid>,
    pub error_log_id: Option<Uuid>,
    pub schema_name: String,
    pub table_name: String,
    pub source_record_id: Option<String>,
    pub operation_type: crate::core::OperationType,
    pub record_data: Map<String, Value>,
    pub error_count: i32,
    pub first_error_at: DateTime<Utc>,
    pub last_error_at: DateTime<Utc>,
    pub last_error_message: Option<String>,
    pub status: DlqStatus,
}

impl DeadLetterEntry {
    /// Build an entry, rejecting empty record payloads at the boundary.
    pub fn new(
        schema_name: impl Into<String>,
        table_name: impl Into<String>,
        operation_type: crate::core::OperationType,
        record_data: Map<String, Value>,
    ) -> Result<Self> {
        if record_data.is_empty() {
            return Err(SyncError::Validation(
                "record_data cannot be empty".to_string(),
            ));
        }
        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4(),
            sync_run_id: None,
            error_log_id: None,
            schema_name: schema_name.into(),
            table_name: table_name.into(),
            source_record_id: None,
            operation_type,
            record_data,
            error_count: 1,
            first_error_at: now,
            last_error_at: now,
            last_error_message: None,
            status: DlqStatus::Pending,
        })
    }
}

/// Aggregate sync statistics over a trailing window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncStatisticsReport {
    pub time_range_hours: i64,
    pub schema_name: Option<String>,
    pub total_runs: i64,
    pub completed_runs: i64,
    pub failed_runs: i64,
    pub running_runs: i64,
    pub avg_duration_ms: Option<f64>,
    pub total_records_processed: i64,
    pub total_bytes_processed: i64,
    pub total_errors: i64,
    pub open_errors: i64,
    pub total_dlq_records: i64,
    pub pending_dlq_records: i64,
    pub generated_at: Option<DateTime<Utc>>,
}

/// Row counts removed by a cleanup pass, per table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub sync_runs: u64,
    pub error_log: u64,
    pub dead_letter_queue: u64,
    pub sync_markers: u64,
    pub schema_registry: u64,
}
