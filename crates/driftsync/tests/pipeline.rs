//! End-to-end pipeline tests over the in-memory connectors and metadata
//! store: delivery ordering, idempotent re-delivery, poison-record routing
//! and lifecycle.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Map, Value};

use driftsync::config::{
    DeletionStrategy, ErrorHandlingConfig, SchemaConfig, SyncModeSetting, TableConfig,
};
use driftsync::connectors::{MemoryDestination, MemorySource};
use driftsync::core::{
    ColumnDefinition, ColumnType, DatabaseSchema, OperationType, Record, TableSchema,
};
use driftsync::metadata::{DlqStatus, MarkerType, MemoryMetadataStore, MetadataStore};
use driftsync::processor::SchemaProcessor;

fn orders_table() -> TableSchema {
    TableSchema {
        name: "orders".to_string(),
        columns: vec![
            ColumnDefinition::new("id", ColumnType::Bigint),
            ColumnDefinition::new("status", ColumnType::String),
        ],
        primary_keys: vec!["id".to_string()],
        indexes: vec![],
    }
}

fn app_schema() -> DatabaseSchema {
    DatabaseSchema {
        name: "app".to_string(),
        tables: vec![orders_table()],
    }
}

fn record(id: i64, status: &str, op: OperationType) -> Record {
    let mut data = Map::new();
    data.insert("id".to_string(), json!(id));
    data.insert("status".to_string(), json!(status));
    let mut pk = Map::new();
    pk.insert("id".to_string(), json!(id));
    Record {
        table_name: "orders".to_string(),
        data,
        operation: op,
        timestamp: Utc::now(),
        primary_key_values: pk,
        before_data: None,
    }
}

fn schema_config(mode: SyncModeSetting) -> SchemaConfig {
    SchemaConfig {
        name: "app".to_string(),
        mode,
        default_batch_size: 100,
        default_polling_interval_seconds: 1,
        table_whitelist: None,
        table_blacklist: None,
        tables: vec![TableConfig {
            name: "orders".to_string(),
            mode: None,
            stream_batch_size: 100,
            write_batch_size: 50,
            full_load_batch_size: 100,
            polling_interval_seconds: 1,
            enable_schema_evolution: true,
            deletion_strategy: None,
        }],
    }
}

struct Pipeline {
    source: Arc<MemorySource>,
    destination: Arc<MemoryDestination>,
    metadata: Arc<MemoryMetadataStore>,
    processor: Arc<SchemaProcessor>,
}

async fn pipeline(mode: SyncModeSetting) -> Pipeline {
    pipeline_with(mode, MemoryDestination::new()).await
}

async fn pipeline_with(mode: SyncModeSetting, destination: MemoryDestination) -> Pipeline {
    let source = Arc::new(MemorySource::new());
    source.set_schema(app_schema()).await;
    let destination = Arc::new(destination);
    let metadata = Arc::new(MemoryMetadataStore::new());

    let error_handling = ErrorHandlingConfig {
        max_retries: 2,
        backoff_factor: 1.0,
        max_backoff_seconds: 1,
        dead_letter_queue: true,
        retention_days: 30,
    };
    let processor = Arc::new(SchemaProcessor::new(
        schema_config(mode),
        source.clone(),
        destination.clone(),
        metadata.clone(),
        None,
        error_handling,
        Some("test-config-hash".to_string()),
        false,
    ));

    Pipeline {
        source,
        destination,
        metadata,
        processor,
    }
}

#[tokio::test]
async fn batch_pass_applies_changes_and_persists_markers() {
    let p = pipeline(SyncModeSetting::Batch).await;
    p.source.push_change("app", record(1, "new", OperationType::Insert)).await;
    p.source.push_change("app", record(2, "new", OperationType::Insert)).await;
    let last = p
        .source
        .push_change("app", record(1, "paid", OperationType::Update))
        .await;

    p.processor.start(false).await.unwrap();

    let rows = p.destination.rows("app", "orders").await;
    assert_eq!(rows.len(), 2);
    assert_eq!(rows["1"].data["status"], json!("paid"));
    assert_eq!(rows["1"].version, 2);

    // Marker sits at the last applied event
    let marker = p
        .metadata
        .get_sync_marker("app", Some("orders"), MarkerType::Batch)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(marker.position_data, last);

    // The pass also records a schema-level batch watermark
    let watermark = p
        .metadata
        .get_sync_marker("app", None, MarkerType::Batch)
        .await
        .unwrap()
        .unwrap();
    assert!(driftsync::metadata::store::positions::batch_timestamp(&watermark).is_some());

    // The sync run finalized with accurate statistics
    let stats = p.metadata.get_sync_statistics(Some("app"), 1).await.unwrap();
    assert_eq!(stats.total_runs, 1);
    assert_eq!(stats.completed_runs, 1);
    assert_eq!(stats.total_records_processed, 3);
}

#[tokio::test]
async fn second_batch_pass_resumes_after_marker() {
    let p = pipeline(SyncModeSetting::Batch).await;
    p.source.push_change("app", record(1, "new", OperationType::Insert)).await;
    p.processor.start(false).await.unwrap();

    // New change arrives between passes
    p.source.push_change("app", record(2, "new", OperationType::Insert)).await;

    // A second pass only sees the new event; the first one is not re-applied
    let p2 = Pipeline {
        processor: Arc::new(SchemaProcessor::new(
            schema_config(SyncModeSetting::Batch),
            p.source.clone(),
            p.destination.clone(),
            p.metadata.clone(),
            None,
            ErrorHandlingConfig::default(),
            None,
            false,
        )),
        source: p.source.clone(),
        destination: p.destination.clone(),
        metadata: p.metadata.clone(),
    };
    p2.processor.start(false).await.unwrap();

    let rows = p2.destination.rows("app", "orders").await;
    assert_eq!(rows.len(), 2);
    // Row 1 was delivered exactly once, so its version is still 1
    assert_eq!(rows["1"].version, 1);
}

#[tokio::test]
async fn redelivery_after_crash_is_idempotent() {
    let p = pipeline(SyncModeSetting::Batch).await;
    let pending_marker = p
        .source
        .push_change("app", record(7, "new", OperationType::Insert))
        .await;

    // Simulate a crash after the write but before the marker update: the
    // row is already in the destination, the marker is not persisted
    p.destination
        .write_batch("app", &[record(7, "new", OperationType::Insert)])
        .await
        .unwrap();
    assert!(p
        .metadata
        .get_sync_marker("app", Some("orders"), MarkerType::Batch)
        .await
        .unwrap()
        .is_none());

    // Restart: the record is re-delivered and absorbed by the UPSERT
    p.processor.start(false).await.unwrap();

    let rows = p.destination.rows("app", "orders").await;
    assert_eq!(rows.len(), 1, "re-delivery must not duplicate the row");
    assert_eq!(rows["7"].data["status"], json!("new"));
    assert_eq!(rows["7"].version, 2, "version bump is the only difference");

    let marker = p
        .metadata
        .get_sync_marker("app", Some("orders"), MarkerType::Batch)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(marker.position_data, pending_marker);
}

#[tokio::test]
async fn poison_record_routes_to_dlq_without_blocking() {
    let destination = MemoryDestination::new();
    destination.fail_writes_for_pk("13").await;
    let p = pipeline_with(SyncModeSetting::Batch, destination).await;

    p.source.push_change("app", record(12, "ok", OperationType::Insert)).await;
    p.source.push_change("app", record(13, "bad", OperationType::Insert)).await;
    p.source.push_change("app", record(14, "ok", OperationType::Insert)).await;

    p.processor.start(false).await.unwrap();

    // Healthy records on both sides of the poison record landed
    let rows = p.destination.rows("app", "orders").await;
    assert!(rows.contains_key("12"));
    assert!(rows.contains_key("14"));
    assert!(!rows.contains_key("13"));

    let dlq = p.metadata.dead_letter_entries().await;
    assert_eq!(dlq.len(), 1);
    assert_eq!(dlq[0].source_record_id.as_deref(), Some("13"));
    assert_eq!(dlq[0].error_count, 1);
    assert_eq!(dlq[0].status, DlqStatus::Pending);

    let errors = p.metadata.error_log_entries().await;
    assert_eq!(errors.len(), 1);

    // The same source record failing again increments the existing entry
    p.source.push_change("app", record(13, "bad again", OperationType::Insert)).await;
    let second = Arc::new(SchemaProcessor::new(
        schema_config(SyncModeSetting::Batch),
        p.source.clone(),
        p.destination.clone(),
        p.metadata.clone(),
        None,
        ErrorHandlingConfig::default(),
        None,
        false,
    ));
    second.start(false).await.unwrap();

    let dlq = p.metadata.dead_letter_entries().await;
    assert_eq!(dlq.len(), 1, "repeat failure must not duplicate the entry");
    assert_eq!(dlq[0].error_count, 2);
}

#[tokio::test]
async fn transient_write_failure_is_retried() {
    let destination = MemoryDestination::new();
    destination.fail_next_writes(1).await;
    let p = pipeline_with(SyncModeSetting::Batch, destination).await;

    p.source.push_change("app", record(1, "ok", OperationType::Insert)).await;
    p.processor.start(false).await.unwrap();

    let rows = p.destination.rows("app", "orders").await;
    assert_eq!(rows.len(), 1);
    // Retried transparently: nothing dead-lettered
    assert!(p.metadata.dead_letter_entries().await.is_empty());
}

#[tokio::test]
async fn stream_mode_processes_and_stops_cleanly() {
    let p = pipeline(SyncModeSetting::Stream).await;
    p.source.push_change("app", record(1, "new", OperationType::Insert)).await;
    p.source.push_change("app", record(2, "new", OperationType::Insert)).await;

    p.processor.start(false).await.unwrap();

    // Wait until the stream loop has applied both changes
    let mut applied = false;
    for _ in 0..100 {
        if p.destination.rows("app", "orders").await.len() == 2 {
            applied = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(applied, "stream loop did not apply changes in time");

    let status = p.processor.status().await;
    assert!(status.running);
    assert_eq!(status.active_tables, 1);

    p.processor.stop().await;
    let status = p.processor.status().await;
    assert!(!status.running);
    assert_eq!(status.active_tables, 0);

    // Stream markers were used, and the run was finalized as cancelled
    assert!(p
        .metadata
        .get_sync_marker("app", Some("orders"), MarkerType::Stream)
        .await
        .unwrap()
        .is_some());
    let stats = p.metadata.get_sync_statistics(Some("app"), 1).await.unwrap();
    assert_eq!(stats.running_runs, 0);
}

#[tokio::test]
async fn full_resync_loads_snapshot_before_loop() {
    let p = pipeline(SyncModeSetting::Batch).await;
    p.source
        .set_snapshot(
            "app",
            "orders",
            vec![
                record(100, "archived", OperationType::Insert),
                record(101, "archived", OperationType::Insert),
            ],
        )
        .await;
    // One live change on top of the snapshot
    p.source.push_change("app", record(102, "new", OperationType::Insert)).await;

    p.processor.start(true).await.unwrap();

    let rows = p.destination.rows("app", "orders").await;
    assert_eq!(rows.len(), 3);

    let initial = p
        .metadata
        .get_sync_marker("app", Some("orders"), MarkerType::Initial)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(initial.position_data["records"], json!(2));
}

#[tokio::test]
async fn soft_delete_flags_rows_instead_of_removing() {
    let destination = MemoryDestination::new().with_deletion_strategy(DeletionStrategy::Soft);
    let p = pipeline_with(SyncModeSetting::Batch, destination).await;

    p.source.push_change("app", record(5, "new", OperationType::Insert)).await;
    p.source.push_change("app", record(5, "gone", OperationType::Delete)).await;

    p.processor.start(false).await.unwrap();

    let rows = p.destination.rows("app", "orders").await;
    assert_eq!(rows.len(), 1);
    assert!(rows["5"].is_deleted);
    assert!(rows["5"].deleted_at.is_some());
}

#[tokio::test]
async fn table_blacklist_excludes_changes() {
    let source = Arc::new(MemorySource::new());
    let mut schema = app_schema();
    schema.tables.push(TableSchema {
        name: "audit".to_string(),
        columns: vec![ColumnDefinition::new("id", ColumnType::Bigint)],
        primary_keys: vec!["id".to_string()],
        indexes: vec![],
    });
    source.set_schema(schema).await;
    let destination = Arc::new(MemoryDestination::new());
    let metadata = Arc::new(MemoryMetadataStore::new());

    let mut config = schema_config(SyncModeSetting::Batch);
    config.table_blacklist = Some(vec!["audit".to_string()]);

    let processor = Arc::new(SchemaProcessor::new(
        config,
        source.clone(),
        destination.clone(),
        metadata,
        None,
        ErrorHandlingConfig::default(),
        None,
        false,
    ));

    source.push_change("app", record(1, "new", OperationType::Insert)).await;
    let mut audit_row = record(9, "x", OperationType::Insert);
    audit_row.table_name = "audit".to_string();
    source.push_change("app", audit_row).await;

    processor.start(false).await.unwrap();

    assert_eq!(destination.rows("app", "orders").await.len(), 1);
    assert!(destination.rows("app", "audit").await.is_empty());
}

#[tokio::test]
async fn batch_run_statistics_count_operations() {
    let p = pipeline(SyncModeSetting::Batch).await;
    p.source.push_change("app", record(1, "new", OperationType::Insert)).await;
    p.source.push_change("app", record(1, "paid", OperationType::Update)).await;
    p.source.push_change("app", record(1, "gone", OperationType::Delete)).await;

    p.processor.start(false).await.unwrap();

    let status = p.processor.status().await;
    assert_eq!(status.statistics.records_processed, 3);
    assert_eq!(status.statistics.records_inserted, 1);
    assert_eq!(status.statistics.records_updated, 1);
    assert_eq!(status.statistics.records_deleted, 1);
    assert!(status.statistics.bytes_processed > 0);
}

#[tokio::test]
async fn dry_run_writes_nothing() {
    let source = Arc::new(MemorySource::new());
    source.set_schema(app_schema()).await;
    let destination = Arc::new(MemoryDestination::new());
    let metadata = Arc::new(MemoryMetadataStore::new());

    let processor = Arc::new(SchemaProcessor::new(
        schema_config(SyncModeSetting::Batch),
        source.clone(),
        destination.clone(),
        metadata.clone(),
        None,
        ErrorHandlingConfig::default(),
        None,
        true,
    ));

    source.push_change("app", record(1, "new", OperationType::Insert)).await;
    processor.start(false).await.unwrap();

    assert!(destination.rows("app", "orders").await.is_empty());
    assert!(metadata
        .get_sync_marker("app", Some("orders"), MarkerType::Batch)
        .await
        .unwrap()
        .is_none());
    // The run itself is still tracked
    let stats = metadata.get_sync_statistics(Some("app"), 1).await.unwrap();
    assert_eq!(stats.completed_runs, 1);
}

#[tokio::test]
async fn run_finalizes_exactly_once_under_stop() {
    let p = pipeline(SyncModeSetting::Stream).await;
    p.processor.start(false).await.unwrap();
    p.processor.stop().await;
    // A second stop is a no-op, not a second completion
    p.processor.stop().await;

    let stats = p.metadata.get_sync_statistics(Some("app"), 1).await.unwrap();
    assert_eq!(stats.total_runs, 1);
    assert_eq!(stats.running_runs, 0);
}

#[tokio::test]
async fn sync_run_status_reflects_stream_cancellation() {
    let p = pipeline(SyncModeSetting::Stream).await;
    p.processor.start(false).await.unwrap();
    p.processor.stop().await;

    // Find the run through the statistics report: not running, not failed
    let stats = p.metadata.get_sync_statistics(Some("app"), 1).await.unwrap();
    assert_eq!(stats.failed_runs, 0);
    assert_eq!(stats.completed_runs, 0, "operator stop records cancellation");
}

#[tokio::test]
async fn schema_change_record_is_forwarded_to_evolution() {
    let p = evolution_pipeline(MemoryDestination::new(), false).await;
    let marker = p
        .source
        .push_change(
            "app",
            schema_change_record("add_column", Some(json!({"name": "discount", "type": "double"}))),
        )
        .await;

    p.processor.start(false).await.unwrap();

    let executed = p.destination.executed_sql().await;
    assert!(
        executed.iter().any(|sql| sql.contains("ADD COLUMN \"discount\"")),
        "executed: {:?}",
        executed
    );

    // Applied successfully, so the marker moved past the change
    let persisted = p
        .metadata
        .get_sync_marker("app", Some("orders"), MarkerType::Batch)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(persisted.position_data, marker);
}

fn schema_change_record(change_type: &str, column: Option<Value>) -> Record {
    let mut data = Map::new();
    data.insert("change_type".to_string(), json!(change_type));
    if let Some(column) = column {
        data.insert("column".to_string(), column);
    }
    Record {
        table_name: "orders".to_string(),
        data,
        operation: OperationType::SchemaChange,
        timestamp: Utc::now(),
        primary_key_values: Map::new(),
        before_data: None,
    }
}

async fn evolution_pipeline(destination: MemoryDestination, dry_run: bool) -> Pipeline {
    use driftsync::evolution::{EvolutionConfig, SchemaEvolutionEngine};

    let source = Arc::new(MemorySource::new());
    source.set_schema(app_schema()).await;
    let destination = Arc::new(destination);
    let metadata = Arc::new(MemoryMetadataStore::new());

    let evolution = Arc::new(SchemaEvolutionEngine::new(
        EvolutionConfig::default(),
        source.clone(),
        destination.clone(),
        metadata.clone(),
        vec!["app".to_string()],
    ));
    let processor = Arc::new(SchemaProcessor::new(
        schema_config(SyncModeSetting::Batch),
        source.clone(),
        destination.clone(),
        metadata.clone(),
        Some(evolution),
        ErrorHandlingConfig::default(),
        None,
        dry_run,
    ));

    Pipeline {
        source,
        destination,
        metadata,
        processor,
    }
}

#[tokio::test]
async fn dry_run_schema_change_executes_no_ddl() {
    let p = evolution_pipeline(MemoryDestination::new(), true).await;
    p.source
        .push_change(
            "app",
            schema_change_record("add_column", Some(json!({"name": "discount", "type": "double"}))),
        )
        .await;

    p.processor.start(false).await.unwrap();

    // The change was planned only: nothing reached the destination
    assert!(p.destination.executed_sql().await.is_empty());
    assert!(p.destination.applied_changes().await.is_empty());
    assert!(p.metadata.error_log_entries().await.is_empty());
    // Dry run never persists markers either
    assert!(p
        .metadata
        .get_sync_marker("app", Some("orders"), MarkerType::Batch)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn approval_required_schema_change_holds_marker() {
    let p = evolution_pipeline(MemoryDestination::new(), false).await;
    p.source
        .push_change("app", schema_change_record("drop_table", None))
        .await;

    // The drop needs approval, so the pass fails rather than skipping it
    let result = p.processor.start(false).await;
    assert!(result.is_err());

    // Marker held: the change is re-delivered until approved or
    // pre-filtered
    assert!(p
        .metadata
        .get_sync_marker("app", Some("orders"), MarkerType::Batch)
        .await
        .unwrap()
        .is_none());
    assert!(p.destination.executed_sql().await.is_empty());
    assert!(!p.metadata.error_log_entries().await.is_empty());

    let stats = p.metadata.get_sync_statistics(Some("app"), 1).await.unwrap();
    assert_eq!(stats.failed_runs, 1);
}

#[tokio::test]
async fn failed_schema_change_ddl_holds_marker() {
    let destination = MemoryDestination::new();
    destination.fail_sql_containing("ADD COLUMN").await;
    let p = evolution_pipeline(destination, false).await;
    p.source
        .push_change(
            "app",
            schema_change_record("add_column", Some(json!({"name": "discount", "type": "double"}))),
        )
        .await;

    let result = p.processor.start(false).await;
    assert!(result.is_err());

    assert!(p
        .metadata
        .get_sync_marker("app", Some("orders"), MarkerType::Batch)
        .await
        .unwrap()
        .is_none());
    assert!(!p.metadata.error_log_entries().await.is_empty());
}

#[tokio::test]
async fn marker_is_not_persisted_when_write_keeps_failing() {
    let destination = MemoryDestination::new();
    // More failures than the configured retries allow
    destination.fail_next_writes(10).await;
    let p = pipeline_with(SyncModeSetting::Batch, destination).await;

    p.source.push_change("app", record(1, "new", OperationType::Insert)).await;
    let result = p.processor.start(false).await;
    assert!(result.is_err());

    // No write happened, so no marker may exist: the record will be
    // re-delivered on the next pass
    assert!(p
        .metadata
        .get_sync_marker("app", Some("orders"), MarkerType::Batch)
        .await
        .unwrap()
        .is_none());
    let stats = p.metadata.get_sync_statistics(Some("app"), 1).await.unwrap();
    assert_eq!(stats.failed_runs, 1);

    let rows = p.destination.rows("app", "orders").await;
    assert!(rows.is_empty());
}

#[tokio::test]
async fn value_conversion_estimates_loss_for_migrator() {
    // estimate_data_loss feeds the migrator's automatic-proceed decision
    use driftsync::TypeConversionEngine;

    let engine = TypeConversionEngine::new();
    let samples: Vec<Value> = vec![json!("10"), json!("20"), json!("n/a")];
    let loss = engine.estimate_data_loss(&samples, ColumnType::String, ColumnType::Integer);
    assert!(loss > 33.0 && loss < 34.0);
}
