//! Configuration type definitions.

use serde::{Deserialize, Serialize};

use crate::evolution::EvolutionConfig;

/// Execution mode of the runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Run exactly one configured schema (`single_schema_name`).
    #[default]
    Single,
    /// Run every configured schema concurrently.
    Multi,
}

/// Per-table sync mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncModeSetting {
    /// Continuous per-table change loops.
    #[default]
    Stream,
    /// One pass per invocation.
    Batch,
}

/// How deletes propagate to the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletionStrategy {
    /// Physically remove the row.
    #[default]
    Hard,
    /// Set the deletion flag and timestamp, leave the row.
    Soft,
    /// Flag first, then remove.
    Both,
}

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Execution mode (single or multi schema).
    #[serde(default)]
    pub mode: ExecutionMode,

    /// Source database configuration.
    pub source: SourceConfig,

    /// Destination database configuration.
    pub destination: DestinationConfig,

    /// Schema configurations.
    pub schemas: Vec<SchemaConfig>,

    /// Schema to run in single mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub single_schema_name: Option<String>,

    /// Tables to include across all schemas; takes precedence over the
    /// blacklist.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_table_whitelist: Option<Vec<String>>,

    /// Tables to exclude across all schemas.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_table_blacklist: Option<Vec<String>>,

    /// Error handling and retry policy.
    #[serde(default)]
    pub error_handling: ErrorHandlingConfig,

    /// Schema evolution policy.
    #[serde(default)]
    pub evolution: EvolutionConfig,

    /// Plan and log without writing to the destination.
    #[serde(default)]
    pub dry_run: bool,

    /// Reload every table from a full snapshot before streaming.
    #[serde(default)]
    pub full_resync: bool,
}

/// Source database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Connector type (e.g. "memory"; registry-resolved).
    pub r#type: String,

    /// Database connection string.
    pub connection_string: String,

    /// Database name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,

    /// Column used for change detection in batch mode.
    #[serde(default = "default_change_detection_column")]
    pub change_detection_column: String,
}

/// Destination database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationConfig {
    /// Connector type (e.g. "postgresql"; registry-resolved).
    pub r#type: String,

    /// Database connection string.
    pub connection_string: String,

    /// Database name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,

    /// Schema holding the metadata tables.
    #[serde(default = "default_metadata_schema")]
    pub metadata_schema: String,

    /// Minimum pooled connections.
    #[serde(default = "default_min_connections")]
    pub min_connections: usize,

    /// Maximum pooled connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Connect timeout in seconds.
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_seconds: u64,

    /// Per-statement timeout in seconds.
    #[serde(default = "default_command_timeout")]
    pub command_timeout_seconds: u64,

    /// Default deletion strategy; per-table settings override it.
    #[serde(default)]
    pub deletion_strategy: DeletionStrategy,

    /// Column flagging soft-deleted rows.
    #[serde(default = "default_soft_delete_flag")]
    pub soft_delete_flag_column: String,

    /// Column stamping soft-delete time.
    #[serde(default = "default_soft_delete_timestamp")]
    pub soft_delete_timestamp_column: String,
}

/// Schema-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaConfig {
    /// Schema name.
    pub name: String,

    /// Default sync mode for tables in this schema.
    #[serde(default)]
    pub mode: SyncModeSetting,

    /// Default batch size.
    #[serde(default = "default_batch_size")]
    pub default_batch_size: usize,

    /// Default polling interval in seconds.
    #[serde(default = "default_polling_interval")]
    pub default_polling_interval_seconds: u64,

    /// Tables to include; takes precedence over the blacklist.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_whitelist: Option<Vec<String>>,

    /// Tables to exclude.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_blacklist: Option<Vec<String>>,

    /// Table-specific overrides.
    #[serde(default)]
    pub tables: Vec<TableConfig>,
}

impl SchemaConfig {
    /// Whitelist takes precedence: when present, only listed tables sync.
    pub fn is_table_allowed(&self, table_name: &str) -> bool {
        if let Some(whitelist) = &self.table_whitelist {
            return whitelist.iter().any(|t| t == table_name);
        }
        if let Some(blacklist) = &self.table_blacklist {
            return !blacklist.iter().any(|t| t == table_name);
        }
        true
    }

    /// Table-specific config, or defaults derived from the schema config.
    pub fn table_config(&self, table_name: &str) -> TableConfig {
        self.tables
            .iter()
            .find(|t| t.name == table_name)
            .cloned()
            .unwrap_or_else(|| TableConfig {
                name: table_name.to_string(),
                mode: None,
                stream_batch_size: self.default_batch_size,
                write_batch_size: default_write_batch_size(),
                full_load_batch_size: default_full_load_batch_size(),
                polling_interval_seconds: self.default_polling_interval_seconds,
                enable_schema_evolution: true,
                deletion_strategy: None,
            })
    }
}

/// Table-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableConfig {
    /// Table name.
    pub name: String,

    /// Override the schema's sync mode for this table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<SyncModeSetting>,

    /// Records per change-stream pull.
    #[serde(default = "default_batch_size")]
    pub stream_batch_size: usize,

    /// Records per write transaction.
    #[serde(default = "default_write_batch_size")]
    pub write_batch_size: usize,

    /// Records per full-load batch.
    #[serde(default = "default_full_load_batch_size")]
    pub full_load_batch_size: usize,

    /// Polling interval between change pulls.
    #[serde(default = "default_polling_interval")]
    pub polling_interval_seconds: u64,

    /// Allow schema evolution events for this table.
    #[serde(default = "default_true")]
    pub enable_schema_evolution: bool,

    /// Override the destination's deletion strategy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_strategy: Option<DeletionStrategy>,
}

/// Error handling and retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorHandlingConfig {
    /// Retry attempts for connection/timeout errors.
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// Exponential backoff multiplier.
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Backoff ceiling in seconds.
    #[serde(default = "default_max_backoff")]
    pub max_backoff_seconds: u64,

    /// Route poison records to the dead letter queue.
    #[serde(default = "default_true")]
    pub dead_letter_queue: bool,

    /// Days to retain terminal metadata rows.
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
}

impl Default for ErrorHandlingConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_factor: default_backoff_factor(),
            max_backoff_seconds: default_max_backoff(),
            dead_letter_queue: true,
            retention_days: default_retention_days(),
        }
    }
}

impl Config {
    /// Check global filters; whitelist takes precedence.
    pub fn is_table_globally_allowed(&self, table_name: &str) -> bool {
        if let Some(whitelist) = &self.global_table_whitelist {
            return whitelist.iter().any(|t| t == table_name);
        }
        if let Some(blacklist) = &self.global_table_blacklist {
            return !blacklist.iter().any(|t| t == table_name);
        }
        true
    }

    /// Combined global and schema-level filter.
    pub fn is_table_allowed(&self, schema_name: &str, table_name: &str) -> bool {
        if !self.is_table_globally_allowed(table_name) {
            return false;
        }
        self.schema_config(schema_name)
            .map(|s| s.is_table_allowed(table_name))
            .unwrap_or(true)
    }

    /// Configuration for a specific schema.
    pub fn schema_config(&self, schema_name: &str) -> Option<&SchemaConfig> {
        self.schemas.iter().find(|s| s.name == schema_name)
    }
}

// Default value functions for serde

fn default_true() -> bool {
    true
}

fn default_change_detection_column() -> String {
    "updated_at".to_string()
}

fn default_metadata_schema() -> String {
    "driftsync_metadata".to_string()
}

fn default_min_connections() -> usize {
    2
}

fn default_max_connections() -> usize {
    10
}

fn default_connection_timeout() -> u64 {
    30
}

fn default_command_timeout() -> u64 {
    60
}

fn default_soft_delete_flag() -> String {
    "is_deleted".to_string()
}

fn default_soft_delete_timestamp() -> String {
    "deleted_at".to_string()
}

fn default_batch_size() -> usize {
    1000
}

fn default_write_batch_size() -> usize {
    500
}

fn default_full_load_batch_size() -> usize {
    10_000
}

fn default_polling_interval() -> u64 {
    5
}

fn default_max_retries() -> usize {
    3
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_max_backoff() -> u64 {
    300
}

fn default_retention_days() -> i64 {
    30
}
