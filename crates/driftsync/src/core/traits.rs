//! Connector contract: the traits every source and destination must satisfy.
//!
//! # Failure semantics
//!
//! Any method may fail with a connection error, which callers treat as
//! retryable, or a data error, which is logged and does not kill the
//! connector. See `SyncError::is_retryable`.

use async_trait::async_trait;
use serde_json::Value;

use super::record::{ChangeStream, Record, SchemaChange, SnapshotStream};
use super::schema::{DatabaseSchema, TableSchema};
use crate::error::Result;

/// Read data and detect changes on a source database.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    /// Get the current schema definition for a database schema.
    async fn get_schema(&self, schema_name: &str) -> Result<DatabaseSchema>;

    /// Open a stream of changes since `marker`.
    ///
    /// With `marker = None` the stream starts from the earliest available
    /// position. The stream is restartable: re-opening with any marker a
    /// previous event carried resumes after that event. In stream mode the
    /// stream is unbounded; in batch mode it ends when the source has no
    /// more changes.
    async fn get_changes(
        &self,
        schema_name: &str,
        marker: Option<Value>,
        batch_size: usize,
    ) -> Result<ChangeStream>;

    /// Open a full snapshot of one table for initial load.
    ///
    /// The snapshot is finite and restartable only from the beginning; a
    /// partially consumed snapshot cannot be resumed.
    async fn get_full_snapshot(
        &self,
        schema_name: &str,
        table_name: &str,
        batch_size: usize,
    ) -> Result<SnapshotStream>;

    /// Establish the connection.
    async fn connect(&self) -> Result<()>;

    /// Close the connection.
    async fn disconnect(&self) -> Result<()>;

    /// Check whether the source is reachable.
    async fn test_connection(&self) -> bool;
}

/// Write data and apply schema changes on a destination database.
#[async_trait]
pub trait DestinationConnector: Send + Sync {
    /// Write a batch of records.
    ///
    /// The batch may mix inserts, updates and deletes. Writes are
    /// idempotent under primary-key conflict: re-delivery of the same
    /// record updates the existing row and bumps its version column rather
    /// than inserting a duplicate.
    async fn write_batch(&self, schema_name: &str, records: &[Record]) -> Result<()>;

    /// Apply structural changes.
    async fn apply_schema_changes(&self, schema_name: &str, changes: &[SchemaChange])
        -> Result<()>;

    /// Persist the processing position for a table.
    async fn update_marker(&self, schema_name: &str, table_name: &str, marker: &Value)
        -> Result<()>;

    /// Read the processing position for a table, `None` on first run.
    async fn get_marker(&self, schema_name: &str, table_name: &str) -> Result<Option<Value>>;

    /// Create the schema if missing. Safe to call on every startup.
    async fn create_schema_if_not_exists(&self, schema_name: &str) -> Result<()>;

    /// Create the table if missing. Safe to call on every startup.
    async fn create_table_if_not_exists(
        &self,
        schema_name: &str,
        table_schema: &TableSchema,
    ) -> Result<()>;

    /// Establish the connection.
    async fn connect(&self) -> Result<()>;

    /// Close the connection.
    async fn disconnect(&self) -> Result<()>;

    /// Check whether the destination is reachable.
    async fn test_connection(&self) -> bool;
}
