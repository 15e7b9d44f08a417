//! In-memory metadata store.
//!
//! Implements the same semantics as the PostgreSQL store against process
//! memory. Used by tests, dry runs and local development where no warehouse
//! is available. State dies with the process.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::models::{
    validate_position_data, CleanupReport, DeadLetterEntry, DlqStatus, ErrorLogEntry, ErrorStatus,
    EvolutionType, MarkerType, SchemaDefinition, SchemaRegistryEntry, SyncMarker, SyncMode,
    SyncRun, SyncRunStatistics, SyncStatisticsReport, SyncStatus,
};
use super::store::MetadataStore;
use crate::error::Result;

#[derive(Default)]
struct State {
    markers: HashMap<(String, String, MarkerType), SyncMarker>,
    registry: Vec<SchemaRegistryEntry>,
    runs: HashMap<Uuid, SyncRun>,
    errors: Vec<ErrorLogEntry>,
    dlq: Vec<DeadLetterEntry>,
}

/// In-memory metadata store.
#[derive(Default)]
pub struct MemoryMetadataStore {
    state: Mutex<State>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the dead letter queue, for assertions in tests.
    pub async fn dead_letter_entries(&self) -> Vec<DeadLetterEntry> {
        self.state.lock().await.dlq.clone()
    }

    /// Snapshot of the error log, for assertions in tests.
    pub async fn error_log_entries(&self) -> Vec<ErrorLogEntry> {
        self.state.lock().await.errors.clone()
    }

    /// Fetch a run by id, for assertions in tests.
    pub async fn sync_run(&self, id: Uuid) -> Option<SyncRun> {
        self.state.lock().await.runs.get(&id).cloned()
    }

    /// Inject a run directly, for recovery tests.
    pub async fn insert_sync_run(&self, run: SyncRun) {
        self.state.lock().await.runs.insert(run.id, run);
    }
}

fn marker_key(schema: &str, table: Option<&str>, marker_type: MarkerType) -> (String, String, MarkerType) {
    (
        schema.to_string(),
        table.unwrap_or_default().to_string(),
        marker_type,
    )
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn get_sync_marker(
        &self,
        schema_name: &str,
        table_name: Option<&str>,
        marker_type: MarkerType,
    ) -> Result<Option<SyncMarker>> {
        let state = self.state.lock().await;
        Ok(state
            .markers
            .get(&marker_key(schema_name, table_name, marker_type))
            .cloned())
    }

    async fn update_sync_marker(
        &self,
        schema_name: &str,
        table_name: Option<&str>,
        marker_type: MarkerType,
        position_data: Value,
        sync_run_id: Option<Uuid>,
    ) -> Result<SyncMarker> {
        validate_position_data(&position_data)?;
        let mut state = self.state.lock().await;
        let key = marker_key(schema_name, table_name, marker_type);

        let marker = match state.markers.get(&key) {
            Some(existing) => SyncMarker {
                id: existing.id,
                schema_name: schema_name.to_string(),
                table_name: table_name.map(String::from),
                marker_type,
                position_data,
                last_updated: Utc::now(),
                sync_run_id,
            },
            None => {
                let mut marker =
                    SyncMarker::new(schema_name, table_name.map(String::from), marker_type, position_data)?;
                marker.sync_run_id = sync_run_id;
                marker
            }
        };
        state.markers.insert(key, marker.clone());
        Ok(marker)
    }

    async fn register_schema(
        &self,
        schema_name: &str,
        table_name: &str,
        definition: SchemaDefinition,
        evolution_type: Option<EvolutionType>,
    ) -> Result<SchemaRegistryEntry> {
        let schema_hash = definition.schema_hash();
        let mut state = self.state.lock().await;

        let latest = state
            .registry
            .iter()
            .filter(|e| e.schema_name == schema_name && e.table_name == table_name)
            .max_by_key(|e| e.version)
            .cloned();

        if let Some(entry) = &latest {
            if entry.schema_hash == schema_hash {
                return Ok(entry.clone());
            }
        }

        let entry = SchemaRegistryEntry {
            id: Uuid::new_v4(),
            schema_name: schema_name.to_string(),
            table_name: table_name.to_string(),
            version: latest.as_ref().map(|e| e.version).unwrap_or(0) + 1,
            schema_definition: definition,
            schema_hash,
            evolution_type,
            previous_version: latest.map(|e| e.version),
            compatibility_status: "compatible".to_string(),
            registered_at: Utc::now(),
        };
        state.registry.push(entry.clone());
        Ok(entry)
    }

    async fn get_schema_version(
        &self,
        schema_name: &str,
        table_name: &str,
        version: Option<i32>,
    ) -> Result<Option<SchemaRegistryEntry>> {
        let state = self.state.lock().await;
        let matching = state
            .registry
            .iter()
            .filter(|e| e.schema_name == schema_name && e.table_name == table_name);

        Ok(match version {
            Some(v) => matching.filter(|e| e.version == v).next_back().cloned(),
            None => matching.max_by_key(|e| e.version).cloned(),
        })
    }

    async fn start_sync_run(
        &self,
        schema_name: &str,
        sync_mode: SyncMode,
        config_hash: Option<String>,
    ) -> Result<SyncRun> {
        let mut run = SyncRun::new(schema_name, sync_mode);
        run.config_hash = config_hash;
        self.state.lock().await.runs.insert(run.id, run.clone());
        Ok(run)
    }

    async fn complete_sync_run(
        &self,
        sync_run_id: Uuid,
        status: SyncStatus,
        statistics: SyncRunStatistics,
        error_message: Option<String>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(run) = state.runs.get_mut(&sync_run_id) else {
            return Ok(false);
        };
        if run.status != SyncStatus::Running {
            return Ok(false);
        }
        let completed_at = Utc::now();
        run.status = status;
        run.completed_at = Some(completed_at);
        run.duration_ms = Some((completed_at - run.started_at).num_milliseconds());
        run.statistics = statistics;
        run.error_message = error_message;
        Ok(true)
    }

    async fn log_error(&self, entry: ErrorLogEntry) -> Result<ErrorLogEntry> {
        self.state.lock().await.errors.push(entry.clone());
        Ok(entry)
    }

    async fn add_to_dead_letter_queue(&self, mut entry: DeadLetterEntry) -> Result<DeadLetterEntry> {
        let mut state = self.state.lock().await;

        let existing = state.dlq.iter_mut().find(|e| {
            e.schema_name == entry.schema_name
                && e.table_name == entry.table_name
                && e.source_record_id.as_deref().unwrap_or("")
                    == entry.source_record_id.as_deref().unwrap_or("")
                && matches!(e.status, DlqStatus::Pending | DlqStatus::Processing)
        });

        match existing {
            Some(e) => {
                e.error_count += 1;
                e.last_error_at = Utc::now();
                e.last_error_message = entry.last_error_message.clone();
                if entry.error_log_id.is_some() {
                    e.error_log_id = entry.error_log_id;
                }
                if entry.sync_run_id.is_some() {
                    e.sync_run_id = entry.sync_run_id;
                }
                entry = e.clone();
            }
            None => state.dlq.push(entry.clone()),
        }
        Ok(entry)
    }

    async fn recover_failed_runs(&self, max_age: Duration) -> Result<Vec<Uuid>> {
        let cutoff = Utc::now() - max_age;
        let mut state = self.state.lock().await;
        let mut recovered = Vec::new();

        for run in state.runs.values_mut() {
            if run.status == SyncStatus::Running && run.started_at < cutoff {
                let now = Utc::now();
                run.status = SyncStatus::Failed;
                run.completed_at = Some(now);
                run.duration_ms = Some((now - run.started_at).num_milliseconds());
                run.error_message = Some("Run recovered after timeout".to_string());
                recovered.push(run.id);
            }
        }
        Ok(recovered)
    }

    async fn get_sync_statistics(
        &self,
        schema_name: Option<&str>,
        hours: i64,
    ) -> Result<SyncStatisticsReport> {
        let since = Utc::now() - Duration::hours(hours);
        let state = self.state.lock().await;

        let runs: Vec<&SyncRun> = state
            .runs
            .values()
            .filter(|r| r.started_at >= since)
            .filter(|r| schema_name.is_none_or(|s| r.schema_name == s))
            .collect();

        let durations: Vec<i64> = runs.iter().filter_map(|r| r.duration_ms).collect();
        let avg_duration_ms = if durations.is_empty() {
            None
        } else {
            Some(durations.iter().sum::<i64>() as f64 / durations.len() as f64)
        };

        let errors: Vec<&ErrorLogEntry> = state
            .errors
            .iter()
            .filter(|e| e.occurred_at >= since)
            .filter(|e| schema_name.is_none_or(|s| e.schema_name == s))
            .collect();

        let dlq: Vec<&DeadLetterEntry> = state
            .dlq
            .iter()
            .filter(|e| e.first_error_at >= since)
            .filter(|e| schema_name.is_none_or(|s| e.schema_name == s))
            .collect();

        Ok(SyncStatisticsReport {
            time_range_hours: hours,
            schema_name: schema_name.map(String::from),
            total_runs: runs.len() as i64,
            completed_runs: runs.iter().filter(|r| r.status == SyncStatus::Completed).count()
                as i64,
            failed_runs: runs.iter().filter(|r| r.status == SyncStatus::Failed).count() as i64,
            running_runs: runs.iter().filter(|r| r.status == SyncStatus::Running).count() as i64,
            avg_duration_ms,
            total_records_processed: runs.iter().map(|r| r.statistics.records_processed).sum(),
            total_bytes_processed: runs.iter().map(|r| r.statistics.bytes_processed).sum(),
            total_errors: errors.len() as i64,
            open_errors: errors.iter().filter(|e| e.status == ErrorStatus::Open).count() as i64,
            total_dlq_records: dlq.len() as i64,
            pending_dlq_records: dlq.iter().filter(|e| e.status == DlqStatus::Pending).count()
                as i64,
            generated_at: Some(Utc::now()),
        })
    }

    async fn cleanup_old_metadata(&self, retention_days: i64) -> Result<CleanupReport> {
        let cutoff = Utc::now() - Duration::days(retention_days);
        let mut state = self.state.lock().await;
        let mut report = CleanupReport::default();

        let before = state.runs.len();
        state.runs.retain(|_, r| {
            !(r.status != SyncStatus::Running && r.completed_at.is_some_and(|c| c < cutoff))
        });
        report.sync_runs = (before - state.runs.len()) as u64;

        let before = state.errors.len();
        state
            .errors
            .retain(|e| !(e.status == ErrorStatus::Resolved && e.occurred_at < cutoff));
        report.error_log = (before - state.errors.len()) as u64;

        let before = state.dlq.len();
        state.dlq.retain(|e| {
            !(matches!(e.status, DlqStatus::Resolved | DlqStatus::Discarded)
                && e.first_error_at < cutoff)
        });
        report.dead_letter_queue = (before - state.dlq.len()) as u64;

        let before = state.markers.len();
        state.markers.retain(|_, m| m.last_updated >= cutoff);
        report.sync_markers = (before - state.markers.len()) as u64;

        Ok(report)
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}
