//! Metadata store trait: the durable source of truth for resumable state.
//!
//! The orchestration layer works with `Arc<dyn MetadataStore>` without
//! knowing the concrete backend. Two implementations exist:
//!
//! - [`PgMetadataStore`](super::postgres::PgMetadataStore): PostgreSQL tables
//!   in the destination warehouse (production).
//! - [`MemoryMetadataStore`](super::memory::MemoryMetadataStore): in-process
//!   state for tests and dry runs.
//!
//! Implementations must be safe under concurrent access from multiple schema
//! processors: marker updates are row-level upserts, not process-level locks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use super::models::{
    CleanupReport, DeadLetterEntry, ErrorLogEntry, EvolutionType, MarkerType, SchemaDefinition,
    SchemaRegistryEntry, SyncMarker, SyncMode, SyncRun, SyncRunStatistics, SyncStatisticsReport,
    SyncStatus,
};
use crate::error::Result;

#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Create metadata tables and indexes. Idempotent.
    async fn initialize(&self) -> Result<()>;

    /// Read the marker for (schema, table, type). `None` on first run; an
    /// absent marker is an expected state, not an error.
    async fn get_sync_marker(
        &self,
        schema_name: &str,
        table_name: Option<&str>,
        marker_type: MarkerType,
    ) -> Result<Option<SyncMarker>>;

    /// Upsert the marker for (schema, COALESCE(table,''), type).
    ///
    /// One logical marker exists per key; updates replace the position
    /// payload and stamp `last_updated`.
    async fn update_sync_marker(
        &self,
        schema_name: &str,
        table_name: Option<&str>,
        marker_type: MarkerType,
        position_data: Value,
        sync_run_id: Option<Uuid>,
    ) -> Result<SyncMarker>;

    /// Register a table schema version.
    ///
    /// Computes the canonical hash; if it equals the latest registered
    /// version's hash this is a no-op returning that version. Otherwise a
    /// new version N+1 is appended with `evolution_type` and
    /// `previous_version` recorded.
    async fn register_schema(
        &self,
        schema_name: &str,
        table_name: &str,
        definition: SchemaDefinition,
        evolution_type: Option<EvolutionType>,
    ) -> Result<SchemaRegistryEntry>;

    /// Fetch a specific schema version, or the latest when `version` is
    /// `None`.
    async fn get_schema_version(
        &self,
        schema_name: &str,
        table_name: &str,
        version: Option<i32>,
    ) -> Result<Option<SchemaRegistryEntry>>;

    /// Open a sync run in `running` state.
    async fn start_sync_run(
        &self,
        schema_name: &str,
        sync_mode: SyncMode,
        config_hash: Option<String>,
    ) -> Result<SyncRun>;

    /// Finalize a sync run exactly once.
    ///
    /// Transitions status and stamps completion time and duration. Returns
    /// `false` when the run was already finalized (the call is then a
    /// no-op).
    async fn complete_sync_run(
        &self,
        sync_run_id: Uuid,
        status: SyncStatus,
        statistics: SyncRunStatistics,
        error_message: Option<String>,
    ) -> Result<bool>;

    /// Append an error log entry.
    async fn log_error(&self, entry: ErrorLogEntry) -> Result<ErrorLogEntry>;

    /// Add a record to the dead letter queue.
    ///
    /// If a pending/processing entry exists for the same (schema, table,
    /// source_record_id), its `error_count` is incremented and
    /// `last_error_at`/`last_error_message` updated instead of inserting a
    /// duplicate.
    async fn add_to_dead_letter_queue(&self, entry: DeadLetterEntry) -> Result<DeadLetterEntry>;

    /// Mark runs stuck in `running` older than `max_age` as failed.
    /// Returns the ids of the recovered runs.
    async fn recover_failed_runs(&self, max_age: chrono::Duration) -> Result<Vec<Uuid>>;

    /// Aggregate run/error/DLQ statistics over a trailing window.
    async fn get_sync_statistics(
        &self,
        schema_name: Option<&str>,
        hours: i64,
    ) -> Result<SyncStatisticsReport>;

    /// Delete resolved/terminal rows older than the retention window across
    /// all metadata tables.
    async fn cleanup_old_metadata(&self, retention_days: i64) -> Result<CleanupReport>;

    /// Backend name for logging.
    fn backend_type(&self) -> &'static str;
}

/// Convenience helpers shared by callers of the store.
pub mod positions {
    use super::*;

    /// Read the batch watermark timestamp out of a batch marker payload.
    pub fn batch_timestamp(marker: &SyncMarker) -> Option<DateTime<Utc>> {
        marker
            .position_data
            .get("timestamp")
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    /// Build a batch marker payload for a watermark timestamp.
    pub fn batch_position(timestamp: DateTime<Utc>) -> Value {
        serde_json::json!({
            "timestamp": timestamp.to_rfc3339(),
            "updated_at": Utc::now().to_rfc3339(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_position_round_trip() {
        let ts = Utc::now();
        let marker = SyncMarker::new("app", None, MarkerType::Batch, positions::batch_position(ts))
            .unwrap();
        let parsed = positions::batch_timestamp(&marker).unwrap();
        // RFC 3339 keeps sub-second precision, so the round trip is lossless
        assert_eq!(parsed.timestamp_micros(), ts.timestamp_micros());
    }

    #[test]
    fn test_batch_timestamp_absent_on_stream_payload() {
        let marker =
            SyncMarker::new("app", None, MarkerType::Stream, serde_json::json!({"lsn": 10}))
                .unwrap();
        assert!(positions::batch_timestamp(&marker).is_none());
    }
}
