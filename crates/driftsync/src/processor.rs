//! Per-schema sync orchestrator.
//!
//! Stream mode runs one task per table; each loop reads the table's last
//! marker from the metadata store, pulls changes since it, writes them
//! through the destination and persists the new marker strictly after the
//! successful write. A crash between write and marker update re-delivers
//! the record on restart; the destination's UPSERT semantics absorb it.
//! Batch mode runs the same body once per invocation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backon::Retryable;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{ErrorHandlingConfig, SchemaConfig, SyncModeSetting, TableConfig};
use crate::core::{
    ChangeEvent, DestinationConnector, OperationType, Record, SchemaChange, SchemaChangeKind,
    SourceConnector, TableSchema,
};
use crate::error::{Result, SyncError};
use crate::evolution::SchemaEvolutionEngine;
use crate::metadata::store::positions;
use crate::metadata::{
    DeadLetterEntry, ErrorLogEntry, MarkerType, MetadataStore, SchemaDefinition, SyncMode,
    SyncRunStatistics, SyncStatus,
};
use crate::retry;

/// Counters shared by all table tasks of one run.
#[derive(Default)]
struct RunStats {
    processed: AtomicI64,
    inserted: AtomicI64,
    updated: AtomicI64,
    deleted: AtomicI64,
    failed: AtomicI64,
    bytes: AtomicI64,
}

impl RunStats {
    fn count(&self, record: &Record) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.bytes
            .fetch_add(record.approximate_size() as i64, Ordering::Relaxed);
        match record.operation {
            OperationType::Insert => self.inserted.fetch_add(1, Ordering::Relaxed),
            OperationType::Update => self.updated.fetch_add(1, Ordering::Relaxed),
            OperationType::Delete => self.deleted.fetch_add(1, Ordering::Relaxed),
            OperationType::SchemaChange => 0,
        };
    }

    fn snapshot(&self) -> SyncRunStatistics {
        SyncRunStatistics {
            records_processed: self.processed.load(Ordering::Relaxed),
            records_inserted: self.inserted.load(Ordering::Relaxed),
            records_updated: self.updated.load(Ordering::Relaxed),
            records_deleted: self.deleted.load(Ordering::Relaxed),
            records_failed: self.failed.load(Ordering::Relaxed),
            bytes_processed: self.bytes.load(Ordering::Relaxed),
        }
    }
}

/// Status snapshot of a processor.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProcessorStatus {
    pub schema_name: String,
    pub running: bool,
    pub mode: SyncModeSetting,
    pub active_tables: usize,
    pub statistics: SyncRunStatistics,
}

/// Processes CDC changes for a single schema.
pub struct SchemaProcessor {
    schema_config: SchemaConfig,
    source: Arc<dyn SourceConnector>,
    destination: Arc<dyn DestinationConnector>,
    metadata: Arc<dyn MetadataStore>,
    evolution: Option<Arc<SchemaEvolutionEngine>>,
    error_handling: ErrorHandlingConfig,
    global_whitelist: Option<Vec<String>>,
    global_blacklist: Option<Vec<String>>,
    config_hash: Option<String>,
    dry_run: bool,
    cancel: CancellationToken,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
    stats: Arc<RunStats>,
    run_id: Mutex<Option<Uuid>>,
    running: AtomicBool,
}

impl SchemaProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        schema_config: SchemaConfig,
        source: Arc<dyn SourceConnector>,
        destination: Arc<dyn DestinationConnector>,
        metadata: Arc<dyn MetadataStore>,
        evolution: Option<Arc<SchemaEvolutionEngine>>,
        error_handling: ErrorHandlingConfig,
        config_hash: Option<String>,
        dry_run: bool,
    ) -> Self {
        Self {
            schema_config,
            source,
            destination,
            metadata,
            evolution,
            error_handling,
            global_whitelist: None,
            global_blacklist: None,
            config_hash,
            dry_run,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(HashMap::new()),
            stats: Arc::new(RunStats::default()),
            run_id: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    /// Install global table filters (whitelist takes precedence).
    pub fn with_global_filters(
        mut self,
        whitelist: Option<Vec<String>>,
        blacklist: Option<Vec<String>>,
    ) -> Self {
        self.global_whitelist = whitelist;
        self.global_blacklist = blacklist;
        self
    }

    pub fn schema_name(&self) -> &str {
        &self.schema_config.name
    }

    fn is_table_allowed(&self, table_name: &str) -> bool {
        if let Some(whitelist) = &self.global_whitelist {
            if !whitelist.iter().any(|t| t == table_name) {
                return false;
            }
        } else if let Some(blacklist) = &self.global_blacklist {
            if blacklist.iter().any(|t| t == table_name) {
                return false;
            }
        }
        self.schema_config.is_table_allowed(table_name)
    }

    /// Start processing. In stream mode this spawns one task per table and
    /// returns; in batch mode it runs one pass to completion.
    pub async fn start(self: &Arc<Self>, full_resync: bool) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!(schema = %self.schema_config.name, "Schema processor already running");
            return Ok(());
        }

        let schema_name = self.schema_config.name.clone();
        info!(
            schema = %schema_name,
            mode = ?self.schema_config.mode,
            full_resync,
            dry_run = self.dry_run,
            "Starting schema processor"
        );

        let started = async {
            if !self.dry_run {
                self.destination
                    .create_schema_if_not_exists(&schema_name)
                    .await?;
            }

            let source_schema = self.source.get_schema(&schema_name).await?;
            let tables: Vec<TableSchema> = source_schema
                .tables
                .into_iter()
                .filter(|t| self.is_table_allowed(&t.name))
                .collect();

            let sync_mode = match self.schema_config.mode {
                SyncModeSetting::Stream => SyncMode::Stream,
                SyncModeSetting::Batch => SyncMode::Batch,
            };
            let run = self
                .metadata
                .start_sync_run(&schema_name, sync_mode, self.config_hash.clone())
                .await?;
            let run_started_at = run.started_at;
            *self.run_id.lock().await = Some(run.id);

            for table in &tables {
                if !self.dry_run {
                    self.destination
                        .create_table_if_not_exists(&schema_name, table)
                        .await?;
                }
                // Baseline registration is a no-op when the shape is already
                // current
                self.metadata
                    .register_schema(
                        &schema_name,
                        &table.name,
                        SchemaDefinition::from_table_schema(table),
                        Some(crate::metadata::EvolutionType::Create),
                    )
                    .await?;

                if full_resync {
                    let table_config = self.schema_config.table_config(&table.name);
                    self.full_table_sync(table, &table_config).await?;
                }
            }

            match self.schema_config.mode {
                SyncModeSetting::Stream => {
                    let mut tasks = self.tasks.lock().await;
                    for table in &tables {
                        let table_config = self.schema_config.table_config(&table.name);
                        let processor = Arc::clone(self);
                        let table_name = table.name.clone();
                        let handle = tokio::spawn(async move {
                            processor.table_stream_loop(table_name, table_config).await;
                        });
                        tasks.insert(table.name.clone(), handle);
                    }
                }
                SyncModeSetting::Batch => {
                    for table in &tables {
                        let table_config = self.schema_config.table_config(&table.name);
                        self.table_batch_pass(&table.name, &table_config).await?;
                    }
                    // Schema-level watermark: source rows changed after this
                    // instant belong to the next pass
                    if !self.dry_run {
                        let run_id = *self.run_id.lock().await;
                        self.metadata
                            .update_sync_marker(
                                &schema_name,
                                None,
                                MarkerType::Batch,
                                positions::batch_position(run_started_at),
                                run_id,
                            )
                            .await?;
                    }
                    self.finish_run(SyncStatus::Completed, None).await;
                    self.running.store(false, Ordering::SeqCst);
                }
            }
            Ok::<(), SyncError>(())
        }
        .await;

        if let Err(e) = started {
            error!(schema = %schema_name, error = %e, "Failed to start schema processor");
            self.finish_run(SyncStatus::Failed, Some(e.to_string())).await;
            self.running.store(false, Ordering::SeqCst);
            return Err(e);
        }

        info!(schema = %schema_name, "Schema processor started");
        Ok(())
    }

    /// Stop processing: cancel all table tasks and await their cancellation
    /// before reporting stopped. In-flight writes finish or fail on their
    /// own; nothing aborts a write already in progress.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(schema = %self.schema_config.name, "Stopping schema processor");
        self.cancel.cancel();

        let mut tasks = self.tasks.lock().await;
        for (table_name, handle) in tasks.drain() {
            debug!(table = %table_name, "Awaiting table task");
            if let Err(e) = handle.await {
                warn!(table = %table_name, error = %e, "Table task ended abnormally");
            }
        }
        drop(tasks);

        self.finish_run(SyncStatus::Cancelled, None).await;
        info!(schema = %self.schema_config.name, "Schema processor stopped");
    }

    pub async fn status(&self) -> ProcessorStatus {
        ProcessorStatus {
            schema_name: self.schema_config.name.clone(),
            running: self.running.load(Ordering::SeqCst),
            mode: self.schema_config.mode,
            active_tables: self.tasks.lock().await.len(),
            statistics: self.stats.snapshot(),
        }
    }

    /// Finalize the sync run once; later calls are no-ops.
    async fn finish_run(&self, status: SyncStatus, error_message: Option<String>) {
        let run_id = self.run_id.lock().await.take();
        if let Some(run_id) = run_id {
            let result = self
                .metadata
                .complete_sync_run(run_id, status, self.stats.snapshot(), error_message)
                .await;
            if let Err(e) = result {
                warn!(sync_run_id = %run_id, error = %e, "Failed to finalize sync run");
            }
        }
    }

    /// Continuous change loop for one table (stream mode).
    async fn table_stream_loop(self: Arc<Self>, table_name: String, table_config: TableConfig) {
        info!(
            schema = %self.schema_config.name,
            table = %table_name,
            "Starting table change loop"
        );
        let poll_interval = Duration::from_secs(table_config.polling_interval_seconds.max(1));

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            match self
                .pull_and_apply(&table_name, &table_config, MarkerType::Stream)
                .await
            {
                Ok(count) if count > 0 => {
                    debug!(table = %table_name, count, "Processed changes");
                }
                Ok(_) => {}
                Err(e) => {
                    // Exhausted retries: log it open and try again next poll
                    error!(table = %table_name, error = %e, "Change pull failed");
                    self.log_open_error(&table_name, &e, None).await;
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
        info!(table = %table_name, "Table change loop stopped");
    }

    /// One batch pass for one table (batch mode).
    async fn table_batch_pass(&self, table_name: &str, table_config: &TableConfig) -> Result<()> {
        info!(
            schema = %self.schema_config.name,
            table = %table_name,
            "Starting table batch pass"
        );
        let count = self
            .pull_and_apply(table_name, table_config, MarkerType::Batch)
            .await?;
        info!(table = %table_name, changes_processed = count, "Batch pass complete");
        Ok(())
    }

    /// Pull changes since the table's marker and apply them in order.
    async fn pull_and_apply(
        &self,
        table_name: &str,
        table_config: &TableConfig,
        marker_type: MarkerType,
    ) -> Result<usize> {
        let schema_name = self.schema_config.name.clone();
        let marker = self
            .metadata
            .get_sync_marker(&schema_name, Some(table_name), marker_type)
            .await?
            .map(|m| m.position_data);

        let open_stream = || {
            let marker = marker.clone();
            let schema_name = schema_name.clone();
            async move {
                self.source
                    .get_changes(&schema_name, marker, table_config.stream_batch_size)
                    .await
            }
        };
        let mut stream = open_stream
            .retry(retry::backoff(&self.error_handling))
            .when(|e: &SyncError| e.is_retryable())
            .await?;

        let mut count = 0usize;
        while let Some(next) = tokio::select! {
            _ = self.cancel.cancelled() => None,
            item = stream.next() => item,
        } {
            let event = match next {
                Ok(event) => event,
                Err(e) => {
                    warn!(table = %table_name, error = %e, "Source stream error");
                    self.log_open_error(table_name, &e, None).await;
                    break;
                }
            };
            // One stream serves the whole schema; each task keeps only its
            // own table's changes
            if event.record.table_name != table_name {
                continue;
            }
            self.process_change_event(&event, table_config, marker_type)
                .await?;
            count += 1;
        }
        Ok(count)
    }

    /// Apply a single change event: write, then persist its marker.
    async fn process_change_event(
        &self,
        event: &ChangeEvent,
        table_config: &TableConfig,
        marker_type: MarkerType,
    ) -> Result<()> {
        let record = &event.record;

        if record.operation == OperationType::SchemaChange {
            // An unapplied schema change must stay re-deliverable: the
            // marker only advances once the change went through (or was
            // deliberately skipped)
            self.handle_schema_change(event, table_config).await?;
            self.persist_marker(record, &event.position_marker, marker_type)
                .await?;
            return Ok(());
        }

        if self.dry_run {
            debug!(
                table = %record.table_name,
                operation = record.operation.as_str(),
                "Dry run: skipping write"
            );
            self.stats.count(record);
            return Ok(());
        }

        let write = || {
            let record = record.clone();
            let schema_name = self.schema_config.name.clone();
            async move {
                self.destination
                    .write_batch(&schema_name, &[record])
                    .await
            }
        };
        let written = write
            .retry(retry::backoff(&self.error_handling))
            .when(|e: &SyncError| e.is_retryable())
            .await;

        match written {
            Ok(()) => {
                self.stats.count(record);
                // Marker persistence is ordered strictly after the write
                self.persist_marker(record, &event.position_marker, marker_type)
                    .await?;
                Ok(())
            }
            Err(e) if e.is_retryable() => {
                // Retries exhausted; leave the marker so the record is
                // re-delivered next cycle
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
            Err(e) => {
                // Poison record: dead-letter it and move past, the pipeline
                // must not stall
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                self.route_to_dead_letter(record, &e).await;
                self.persist_marker(record, &event.position_marker, marker_type)
                    .await?;
                Ok(())
            }
        }
    }

    async fn persist_marker(
        &self,
        record: &Record,
        position: &Value,
        marker_type: MarkerType,
    ) -> Result<()> {
        if self.dry_run {
            return Ok(());
        }
        let run_id = *self.run_id.lock().await;
        self.metadata
            .update_sync_marker(
                &self.schema_config.name,
                Some(&record.table_name),
                marker_type,
                position.clone(),
                run_id,
            )
            .await?;
        Ok(())
    }

    /// Route a schema-change record to the evolution engine's migration
    /// path. In dry-run mode the DDL is planned, never executed.
    ///
    /// Returns an error when the change could not be applied (migration
    /// failure, policy block, approval required): the caller then keeps the
    /// marker in place so the source re-delivers the change instead of
    /// losing it.
    async fn handle_schema_change(
        &self,
        event: &ChangeEvent,
        table_config: &TableConfig,
    ) -> Result<()> {
        let record = &event.record;
        if !table_config.enable_schema_evolution {
            debug!(
                table = %record.table_name,
                "Schema evolution disabled for table, change skipped"
            );
            return Ok(());
        }
        let Some(engine) = &self.evolution else {
            warn!(
                table = %record.table_name,
                "Schema change received but evolution engine is not configured"
            );
            return Ok(());
        };

        let change = match schema_change_from_record(&self.schema_config.name, record) {
            Ok(change) => change,
            Err(e) => {
                // Unparseable forever: record it and move past rather than
                // stall the table
                warn!(table = %record.table_name, error = %e, "Malformed schema change record");
                self.log_open_error(&record.table_name, &e, Some(record)).await;
                return Ok(());
            }
        };

        match engine
            .apply_schema_change(&self.schema_config.name, &change, self.dry_run)
            .await
        {
            Ok(result) if result.success => {
                info!(
                    table = %record.table_name,
                    applied = result.applied_changes.len(),
                    dry_run = self.dry_run,
                    "Schema change applied"
                );
                Ok(())
            }
            Ok(result) => {
                warn!(
                    table = %record.table_name,
                    errors = ?result.errors,
                    "Schema change not applied, holding marker"
                );
                let err = SyncError::Schema(format!(
                    "schema change for table {} not applied: {}",
                    record.table_name,
                    result.errors.join("; ")
                ));
                self.log_open_error(&record.table_name, &err, Some(record)).await;
                Err(err)
            }
            Err(e) => {
                error!(table = %record.table_name, error = %e, "Schema change failed");
                self.log_open_error(&record.table_name, &e, Some(record)).await;
                Err(e)
            }
        }
    }

    async fn log_open_error(&self, table_name: &str, error: &SyncError, record: Option<&Record>) {
        let run_id = *self.run_id.lock().await;
        let mut entry = ErrorLogEntry::new(
            self.schema_config.name.clone(),
            error.error_type(),
            error.to_string(),
        );
        entry.table_name = Some(table_name.to_string());
        entry.sync_run_id = run_id;
        entry.max_retries = self.error_handling.max_retries as i32;
        if let Some(record) = record {
            entry.record_data = serde_json::to_value(&record.data).ok();
            entry.operation_type = Some(record.operation);
        }
        if let Err(e) = self.metadata.log_error(entry).await {
            warn!(error = %e, "Failed to write error log entry");
        }
    }

    async fn route_to_dead_letter(&self, record: &Record, error: &SyncError) {
        let run_id = *self.run_id.lock().await;

        let mut log_entry = ErrorLogEntry::new(
            self.schema_config.name.clone(),
            error.error_type(),
            error.to_string(),
        );
        log_entry.table_name = Some(record.table_name.clone());
        log_entry.sync_run_id = run_id;
        log_entry.record_data = serde_json::to_value(&record.data).ok();
        log_entry.operation_type = Some(record.operation);
        let error_log_id = match self.metadata.log_error(log_entry).await {
            Ok(entry) => Some(entry.id),
            Err(e) => {
                warn!(error = %e, "Failed to write error log entry");
                None
            }
        };

        if !self.error_handling.dead_letter_queue {
            return;
        }
        let entry = DeadLetterEntry::new(
            self.schema_config.name.clone(),
            record.table_name.clone(),
            record.operation,
            record.data.clone(),
        );
        match entry {
            Ok(mut entry) => {
                entry.sync_run_id = run_id;
                entry.error_log_id = error_log_id;
                entry.source_record_id = record.source_record_id();
                entry.last_error_message = Some(error.to_string());
                if let Err(e) = self.metadata.add_to_dead_letter_queue(entry).await {
                    warn!(error = %e, "Failed to write dead letter entry");
                }
            }
            Err(e) => warn!(error = %e, "Record not eligible for dead letter queue"),
        }
    }

    /// Full snapshot load for one table, run before the normal loop when a
    /// resync was requested. Snapshots restart from the beginning; there is
    /// no mid-snapshot resume.
    async fn full_table_sync(
        &self,
        table: &TableSchema,
        table_config: &TableConfig,
    ) -> Result<()> {
        let schema_name = &self.schema_config.name;
        info!(schema = %schema_name, table = %table.name, "Starting full table sync");

        if !self.dry_run {
            self.destination
                .create_table_if_not_exists(schema_name, table)
                .await?;
        }

        let mut stream = self
            .source
            .get_full_snapshot(schema_name, &table.name, table_config.full_load_batch_size)
            .await?;

        let mut count = 0u64;
        while let Some(next) = tokio::select! {
            _ = self.cancel.cancelled() => None,
            item = stream.next() => item,
        } {
            let record = next?;
            if !self.dry_run {
                let write = || {
                    let record = record.clone();
                    async move {
                        self.destination
                            .write_batch(schema_name, &[record])
                            .await
                    }
                };
                write
                    .retry(retry::backoff(&self.error_handling))
                    .when(|e: &SyncError| e.is_retryable())
                    .await?;
            }
            self.stats.count(&record);
            count += 1;
        }

        if !self.dry_run {
            let run_id = *self.run_id.lock().await;
            self.metadata
                .update_sync_marker(
                    schema_name,
                    Some(&table.name),
                    MarkerType::Initial,
                    serde_json::json!({
                        "completed_at": chrono::Utc::now().to_rfc3339(),
                        "records": count,
                    }),
                    run_id,
                )
                .await?;
        }

        info!(
            schema = %schema_name,
            table = %table.name,
            records = count,
            "Completed full table sync"
        );
        Ok(())
    }
}

/// Rebuild a structural change from a source-emitted `schema_change` record.
fn schema_change_from_record(schema_name: &str, record: &Record) -> Result<SchemaChange> {
    let kind = record
        .data
        .get("change_type")
        .and_then(Value::as_str)
        .ok_or_else(|| SyncError::Schema("schema change record missing change_type".to_string()))?;
    let kind = match kind {
        "add_table" => SchemaChangeKind::AddTable,
        "drop_table" => SchemaChangeKind::DropTable,
        "add_column" => SchemaChangeKind::AddColumn,
        "drop_column" => SchemaChangeKind::DropColumn,
        "modify_column" => SchemaChangeKind::ModifyColumn,
        other => {
            return Err(SyncError::Schema(format!(
                "unknown schema change type '{}'",
                other
            )));
        }
    };
    Ok(SchemaChange {
        schema_name: schema_name.to_string(),
        table_name: record.table_name.clone(),
        kind,
        details: record.data.clone(),
        timestamp: record.timestamp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_schema_change_from_record() {
        let mut data = serde_json::Map::new();
        data.insert("change_type".to_string(), json!("add_column"));
        data.insert("column".to_string(), json!({"name": "c", "type": "string"}));
        let record = Record {
            table_name: "orders".to_string(),
            data,
            operation: OperationType::SchemaChange,
            timestamp: chrono::Utc::now(),
            primary_key_values: serde_json::Map::new(),
            before_data: None,
        };
        let change = schema_change_from_record("app", &record).unwrap();
        assert_eq!(change.kind, SchemaChangeKind::AddColumn);
        assert_eq!(change.table_name, "orders");

        let mut bad = record.clone();
        bad.data.remove("change_type");
        assert!(schema_change_from_record("app", &bad).is_err());
    }

    #[test]
    fn test_run_stats_counting() {
        let stats = RunStats::default();
        let mut pk = serde_json::Map::new();
        pk.insert("id".to_string(), json!(1));
        let mut data = serde_json::Map::new();
        data.insert("id".to_string(), json!(1));

        for op in [
            OperationType::Insert,
            OperationType::Insert,
            OperationType::Update,
            OperationType::Delete,
        ] {
            stats.count(&Record {
                table_name: "t".to_string(),
                data: data.clone(),
                operation: op,
                timestamp: chrono::Utc::now(),
                primary_key_values: pk.clone(),
                before_data: None,
            });
        }

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.records_processed, 4);
        assert_eq!(snapshot.records_inserted, 2);
        assert_eq!(snapshot.records_updated, 1);
        assert_eq!(snapshot.records_deleted, 1);
        assert!(snapshot.bytes_processed > 0);
    }
}
