//! In-memory source and destination connectors.
//!
//! Contract-faithful implementations backed by process memory, used by the
//! test suite, dry runs and local development. The destination implements
//! the same idempotent UPSERT semantics as the PostgreSQL connector,
//! including the version bump on re-delivery.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream;
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::DeletionStrategy;
use crate::core::{
    ChangeEvent, ChangeStream, DatabaseSchema, DestinationConnector, OperationType, Record,
    SchemaChange, SchemaChangeKind, SnapshotStream, SourceConnector, TableSchema,
};
use crate::error::{Result, SyncError};

/// A stored destination row.
#[derive(Debug, Clone)]
pub struct StoredRow {
    pub data: Map<String, Value>,
    pub version: i64,
    pub is_deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Default)]
struct SourceState {
    schemas: HashMap<String, DatabaseSchema>,
    /// Ordered change log per schema; position markers are sequence numbers.
    changes: HashMap<String, Vec<ChangeEvent>>,
    snapshots: HashMap<(String, String), Vec<Record>>,
    connected: bool,
}

/// In-memory source connector.
#[derive(Default)]
pub struct MemorySource {
    state: Mutex<SourceState>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the schema snapshot returned by `get_schema`.
    pub async fn set_schema(&self, schema: DatabaseSchema) {
        let mut state = self.state.lock().await;
        state.schemas.insert(schema.name.clone(), schema);
    }

    /// Append a change to the log; its position marker is assigned here.
    pub async fn push_change(&self, schema_name: &str, record: Record) -> Value {
        let mut state = self.state.lock().await;
        let log = state.changes.entry(schema_name.to_string()).or_default();
        let marker = json!({"seq": log.len() as i64 + 1});
        log.push(ChangeEvent {
            record,
            position_marker: marker.clone(),
            schema_name: schema_name.to_string(),
        });
        marker
    }

    /// Install snapshot rows for a table.
    pub async fn set_snapshot(&self, schema_name: &str, table_name: &str, rows: Vec<Record>) {
        let mut state = self.state.lock().await;
        state
            .snapshots
            .insert((schema_name.to_string(), table_name.to_string()), rows);
    }
}

fn marker_seq(marker: &Value) -> i64 {
    marker.get("seq").and_then(Value::as_i64).unwrap_or(0)
}

#[async_trait]
impl SourceConnector for MemorySource {
    async fn get_schema(&self, schema_name: &str) -> Result<DatabaseSchema> {
        let state = self.state.lock().await;
        state
            .schemas
            .get(schema_name)
            .cloned()
            .ok_or_else(|| SyncError::Schema(format!("unknown source schema '{}'", schema_name)))
    }

    async fn get_changes(
        &self,
        schema_name: &str,
        marker: Option<Value>,
        batch_size: usize,
    ) -> Result<ChangeStream> {
        let since = marker.as_ref().map(marker_seq).unwrap_or(0);
        let state = self.state.lock().await;
        let events: Vec<Result<ChangeEvent>> = state
            .changes
            .get(schema_name)
            .map(|log| {
                log.iter()
                    .filter(|e| marker_seq(&e.position_marker) > since)
                    .take(batch_size)
                    .cloned()
                    .map(Ok)
                    .collect()
            })
            .unwrap_or_default();
        Ok(Box::pin(stream::iter(events)))
    }

    async fn get_full_snapshot(
        &self,
        schema_name: &str,
        table_name: &str,
        _batch_size: usize,
    ) -> Result<SnapshotStream> {
        let state = self.state.lock().await;
        let rows: Vec<Result<Record>> = state
            .snapshots
            .get(&(schema_name.to_string(), table_name.to_string()))
            .map(|rows| rows.iter().cloned().map(Ok).collect())
            .unwrap_or_default();
        Ok(Box::pin(stream::iter(rows)))
    }

    async fn connect(&self) -> Result<()> {
        self.state.lock().await.connected = true;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.state.lock().await.connected = false;
        Ok(())
    }

    async fn test_connection(&self) -> bool {
        true
    }
}

#[derive(Default)]
struct DestinationState {
    /// Rows per (schema, table), keyed by primary-key identity.
    tables: HashMap<(String, String), BTreeMap<String, StoredRow>>,
    schemas_created: HashSet<String>,
    tables_created: HashSet<(String, String)>,
    table_schemas: HashMap<(String, String), TableSchema>,
    markers: HashMap<(String, String), Value>,
    executed_sql: Vec<String>,
    applied_changes: Vec<SchemaChange>,
    fail_sql_patterns: Vec<String>,
    fail_write_pks: HashSet<String>,
    fail_writes_remaining: usize,
    connected: bool,
}

/// In-memory destination connector.
pub struct MemoryDestination {
    state: Mutex<DestinationState>,
    deletion_strategy: DeletionStrategy,
    table_deletion_overrides: HashMap<String, DeletionStrategy>,
}

impl Default for MemoryDestination {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDestination {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(DestinationState::default()),
            deletion_strategy: DeletionStrategy::Hard,
            table_deletion_overrides: HashMap::new(),
        }
    }

    /// Override the default deletion strategy.
    pub fn with_deletion_strategy(mut self, strategy: DeletionStrategy) -> Self {
        self.deletion_strategy = strategy;
        self
    }

    /// Per-table deletion strategy overrides.
    pub fn with_table_deletion_strategies(
        mut self,
        overrides: HashMap<String, DeletionStrategy>,
    ) -> Self {
        self.table_deletion_overrides = overrides;
        self
    }

    /// Make `apply_schema_changes` fail for SQL containing the pattern.
    pub async fn fail_sql_containing(&self, pattern: &str) {
        self.state
            .lock()
            .await
            .fail_sql_patterns
            .push(pattern.to_string());
    }

    /// Make `write_batch` reject records with this primary-key identity
    /// (simulates a poison record).
    pub async fn fail_writes_for_pk(&self, pk: &str) {
        self.state.lock().await.fail_write_pks.insert(pk.to_string());
    }

    /// Make the next `n` write batches fail with a connection error
    /// (simulates transient outage).
    pub async fn fail_next_writes(&self, n: usize) {
        self.state.lock().await.fail_writes_remaining = n;
    }

    /// All raw SQL executed through `apply_schema_changes`.
    pub async fn executed_sql(&self) -> Vec<String> {
        self.state.lock().await.executed_sql.clone()
    }

    /// All structural changes received.
    pub async fn applied_changes(&self) -> Vec<SchemaChange> {
        self.state.lock().await.applied_changes.clone()
    }

    /// Snapshot of a table's rows keyed by primary-key identity.
    pub async fn rows(&self, schema_name: &str, table_name: &str) -> BTreeMap<String, StoredRow> {
        self.state
            .lock()
            .await
            .tables
            .get(&(schema_name.to_string(), table_name.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    fn strategy_for(&self, table_name: &str) -> DeletionStrategy {
        self.table_deletion_overrides
            .get(table_name)
            .copied()
            .unwrap_or(self.deletion_strategy)
    }
}

fn pk_identity(record: &Record) -> Result<String> {
    record.source_record_id().ok_or_else(|| {
        SyncError::transformation(
            record.table_name.clone(),
            "record has no primary key values",
        )
    })
}

#[async_trait]
impl DestinationConnector for MemoryDestination {
    async fn write_batch(&self, schema_name: &str, records: &[Record]) -> Result<()> {
        let mut state = self.state.lock().await;

        if state.fail_writes_remaining > 0 {
            state.fail_writes_remaining -= 1;
            return Err(SyncError::Connection(
                "injected transient write failure".to_string(),
            ));
        }

        for record in records {
            let pk = pk_identity(record)?;
            if state.fail_write_pks.contains(&pk) {
                return Err(SyncError::transformation(
                    record.table_name.clone(),
                    format!("injected poison record {}", pk),
                ));
            }

            let key = (schema_name.to_string(), record.table_name.clone());
            let strategy = self.strategy_for(&record.table_name);
            let table = state.tables.entry(key).or_default();
            let now = Utc::now();

            match record.operation {
                OperationType::Insert | OperationType::Update => {
                    match table.get_mut(&pk) {
                        Some(row) => {
                            // Re-delivery updates in place and bumps the
                            // version
                            row.data = record.data.clone();
                            row.version += 1;
                            row.updated_at = now;
                        }
                        None => {
                            table.insert(
                                pk,
                                StoredRow {
                                    data: record.data.clone(),
                                    version: 1,
                                    is_deleted: false,
                                    deleted_at: None,
                                    updated_at: now,
                                },
                            );
                        }
                    }
                }
                OperationType::Delete => match strategy {
                    DeletionStrategy::Hard => {
                        table.remove(&pk);
                    }
                    DeletionStrategy::Soft => {
                        if let Some(row) = table.get_mut(&pk) {
                            row.is_deleted = true;
                            row.deleted_at = Some(now);
                            row.version += 1;
                            row.updated_at = now;
                        }
                    }
                    DeletionStrategy::Both => {
                        table.remove(&pk);
                    }
                },
                OperationType::SchemaChange => {
                    return Err(SyncError::transformation(
                        record.table_name.clone(),
                        "schema_change records do not belong in write_batch",
                    ));
                }
            }
        }
        Ok(())
    }

    async fn apply_schema_changes(
        &self,
        _schema_name: &str,
        changes: &[SchemaChange],
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        for change in changes {
            if change.kind == SchemaChangeKind::MigrationSql {
                let sql = change
                    .details
                    .get("sql")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                if let Some(pattern) = state
                    .fail_sql_patterns
                    .iter()
                    .find(|p| sql.contains(p.as_str()))
                {
                    return Err(SyncError::Schema(format!(
                        "injected failure for SQL matching '{}'",
                        pattern
                    )));
                }
                debug!(sql, "Memory destination executed migration SQL");
                state.executed_sql.push(sql);
            }
            state.applied_changes.push(change.clone());
        }
        Ok(())
    }

    async fn update_marker(
        &self,
        schema_name: &str,
        table_name: &str,
        marker: &Value,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .markers
            .insert((schema_name.to_string(), table_name.to_string()), marker.clone());
        Ok(())
    }

    async fn get_marker(&self, schema_name: &str, table_name: &str) -> Result<Option<Value>> {
        let state = self.state.lock().await;
        Ok(state
            .markers
            .get(&(schema_name.to_string(), table_name.to_string()))
            .cloned())
    }

    async fn create_schema_if_not_exists(&self, schema_name: &str) -> Result<()> {
        self.state
            .lock()
            .await
            .schemas_created
            .insert(schema_name.to_string());
        Ok(())
    }

    async fn create_table_if_not_exists(
        &self,
        schema_name: &str,
        table_schema: &TableSchema,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let key = (schema_name.to_string(), table_schema.name.clone());
        state.tables_created.insert(key.clone());
        state.table_schemas.insert(key, table_schema.clone());
        Ok(())
    }

    async fn connect(&self) -> Result<()> {
        self.state.lock().await.connected = true;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.state.lock().await.connected = false;
        Ok(())
    }

    async fn test_connection(&self) -> bool {
        true
    }
}

/// Shared handles for registering the memory pair under one connection
/// string, so the factory returns the same instances the test configured.
#[derive(Clone, Default)]
pub struct MemoryConnectorHub {
    pub source: Arc<MemorySource>,
    pub destination: Arc<MemoryDestination>,
}

impl MemoryConnectorHub {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn record(table: &str, id: i64, op: OperationType) -> Record {
        let mut data = Map::new();
        data.insert("id".to_string(), json!(id));
        data.insert("name".to_string(), json!(format!("row-{}", id)));
        let mut pk = Map::new();
        pk.insert("id".to_string(), json!(id));
        Record {
            table_name: table.to_string(),
            data,
            operation: op,
            timestamp: Utc::now(),
            primary_key_values: pk,
            before_data: None,
        }
    }

    #[tokio::test]
    async fn test_upsert_law_version_bump() {
        let dest = MemoryDestination::new();
        let r = record("orders", 1, OperationType::Insert);

        dest.write_batch("app", &[r.clone()]).await.unwrap();
        dest.write_batch("app", &[r]).await.unwrap();

        let rows = dest.rows("app", "orders").await;
        assert_eq!(rows.len(), 1, "re-delivery must not create a second row");
        assert_eq!(rows["1"].version, 2);
    }

    #[tokio::test]
    async fn test_mixed_batch() {
        let dest = MemoryDestination::new();
        dest.write_batch(
            "app",
            &[
                record("orders", 1, OperationType::Insert),
                record("orders", 2, OperationType::Insert),
            ],
        )
        .await
        .unwrap();
        dest.write_batch(
            "app",
            &[
                record("orders", 1, OperationType::Update),
                record("orders", 2, OperationType::Delete),
                record("orders", 3, OperationType::Insert),
            ],
        )
        .await
        .unwrap();

        let rows = dest.rows("app", "orders").await;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows["1"].version, 2);
        assert!(rows.contains_key("3"));
    }

    #[tokio::test]
    async fn test_soft_delete_keeps_row() {
        let dest = MemoryDestination::new().with_deletion_strategy(DeletionStrategy::Soft);
        dest.write_batch("app", &[record("orders", 1, OperationType::Insert)])
            .await
            .unwrap();
        dest.write_batch("app", &[record("orders", 1, OperationType::Delete)])
            .await
            .unwrap();

        let rows = dest.rows("app", "orders").await;
        assert_eq!(rows.len(), 1);
        assert!(rows["1"].is_deleted);
        assert!(rows["1"].deleted_at.is_some());
        assert_eq!(rows["1"].version, 2);
    }

    #[tokio::test]
    async fn test_source_changes_resume_from_marker() {
        let source = MemorySource::new();
        source
            .push_change("app", record("orders", 1, OperationType::Insert))
            .await;
        let second = source
            .push_change("app", record("orders", 2, OperationType::Insert))
            .await;
        source
            .push_change("app", record("orders", 3, OperationType::Insert))
            .await;

        // From the beginning
        let all: Vec<_> = source
            .get_changes("app", None, 100)
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(all.len(), 3);

        // Restart from the second marker: only the third event remains
        let rest: Vec<_> = source
            .get_changes("app", Some(second), 100)
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(rest.len(), 1);
        assert_eq!(
            rest[0].as_ref().unwrap().record.primary_key_values["id"],
            json!(3)
        );
    }

    #[tokio::test]
    async fn test_snapshot_restarts_from_beginning() {
        let source = MemorySource::new();
        source
            .set_snapshot(
                "app",
                "orders",
                vec![
                    record("orders", 1, OperationType::Insert),
                    record("orders", 2, OperationType::Insert),
                ],
            )
            .await;

        for _ in 0..2 {
            let rows: Vec<_> = source
                .get_full_snapshot("app", "orders", 10)
                .await
                .unwrap()
                .collect()
                .await;
            assert_eq!(rows.len(), 2);
        }
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let dest = MemoryDestination::new();
        dest.fail_next_writes(1).await;
        let err = dest
            .write_batch("app", &[record("orders", 1, OperationType::Insert)])
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        // Next write succeeds
        dest.write_batch("app", &[record("orders", 1, OperationType::Insert)])
            .await
            .unwrap();

        dest.fail_writes_for_pk("9").await;
        let err = dest
            .write_batch("app", &[record("orders", 9, OperationType::Insert)])
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }
}
