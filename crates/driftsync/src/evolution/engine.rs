//! Schema evolution engine.
//!
//! Coordinates detector and migrator on a timer or on demand: fetch the
//! current source schema, diff it, filter by policy, and hand the surviving
//! events to the migration engine. A batch containing any change that
//! requires approval is aborted whole rather than partially applied; callers
//! needing partial application must pass pre-filtered event lists.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::EvolutionConfig;
use super::convert::TypeConversionEngine;
use super::detector::SchemaChangeDetector;
use super::migrator::SchemaMigrationEngine;
use super::types::{
    ChangeKind, EvolutionMetrics, EvolutionResult, HealthSnapshot, SchemaEvolutionEvent,
};
use crate::core::{DestinationConnector, SchemaChange, SchemaChangeKind, SourceConnector};
use crate::error::Result;
use crate::metadata::{EvolutionType, MetadataStore, SchemaDefinition};

/// Engine monitoring one set of schemas for drift.
pub struct SchemaEvolutionEngine {
    config: EvolutionConfig,
    source: Arc<dyn SourceConnector>,
    metadata: Arc<dyn MetadataStore>,
    converter: Arc<TypeConversionEngine>,
    detector: Mutex<SchemaChangeDetector>,
    migrator: SchemaMigrationEngine,
    monitored_schemas: Vec<String>,
    running: AtomicBool,
    metrics: Mutex<EvolutionMetrics>,
}

impl SchemaEvolutionEngine {
    pub fn new(
        config: EvolutionConfig,
        source: Arc<dyn SourceConnector>,
        destination: Arc<dyn DestinationConnector>,
        metadata: Arc<dyn MetadataStore>,
        monitored_schemas: Vec<String>,
    ) -> Self {
        let converter = Arc::new(TypeConversionEngine::new());
        let detector = Mutex::new(SchemaChangeDetector::new(config.clone()));
        let migrator =
            SchemaMigrationEngine::new(config.clone(), destination, converter.clone());
        Self {
            config,
            source,
            metadata,
            converter,
            detector,
            migrator,
            monitored_schemas,
            running: AtomicBool::new(false),
            metrics: Mutex::new(EvolutionMetrics::default()),
        }
    }

    /// Background monitoring loop; returns when cancelled.
    pub async fn run_monitor(self: Arc<Self>, cancel: CancellationToken) {
        if !self.config.enabled {
            info!("Schema evolution disabled in configuration");
            return;
        }
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Schema evolution engine already running");
            return;
        }

        info!(
            strategy = self.config.strategy.as_str(),
            interval_seconds = self.config.detection_interval_seconds,
            schemas = self.monitored_schemas.len(),
            "Starting schema evolution monitoring loop"
        );
        let interval = Duration::from_secs(self.config.detection_interval_seconds.max(1));

        loop {
            for schema_name in &self.monitored_schemas {
                if cancel.is_cancelled() {
                    break;
                }
                if let Err(e) = self.evolve_schema(schema_name, false).await {
                    error!(schema = %schema_name, error = %e, "Schema evolution pass failed");
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }

        self.running.store(false, Ordering::SeqCst);
        info!("Schema evolution monitoring loop stopped");
    }

    /// One evolution pass for a schema: detect, filter, migrate, register.
    pub async fn evolve_schema(&self, schema_name: &str, dry_run: bool) -> Result<EvolutionResult> {
        self.metrics.lock().await.last_check = Some(Utc::now());

        let current = self.source.get_schema(schema_name).await?;

        let events = {
            let mut detector = self.detector.lock().await;
            detector.detect_changes(schema_name, current.clone(), None, &self.converter)
        };

        if events.is_empty() {
            debug!(schema = schema_name, "No schema changes detected");
            return Ok(EvolutionResult::succeeded(Vec::new()));
        }

        let filtered = self.filter_events(events);
        if filtered.is_empty() {
            debug!(schema = schema_name, "All detected changes filtered out");
            let mut result = EvolutionResult::succeeded(Vec::new());
            result
                .warnings
                .push("All changes filtered by configuration".to_string());
            return Ok(result);
        }

        let result = self
            .migrator
            .execute_migrations(filtered, schema_name, dry_run)
            .await;

        self.metrics.lock().await.record(&result);

        if result.success && !dry_run {
            self.register_migrated_schemas(schema_name, &result).await;
        }

        info!(
            schema = schema_name,
            success = result.success,
            applied = result.applied_changes.len(),
            "Schema evolution completed"
        );
        Ok(result)
    }

    /// Diff without applying: what would change right now.
    pub async fn schema_diff(&self, schema_name: &str) -> Result<Vec<SchemaEvolutionEvent>> {
        let current = self.source.get_schema(schema_name).await?;
        let mut detector = self.detector.lock().await;
        Ok(detector.detect_changes(schema_name, current, None, &self.converter))
    }

    /// Migration path for a `schema_change` record emitted by the source
    /// stream. The change is converted into an evolution event and goes
    /// through the same policy checks as detected drift. With `dry_run` the
    /// DDL is planned and reported but never executed.
    pub async fn apply_schema_change(
        &self,
        schema_name: &str,
        change: &SchemaChange,
        dry_run: bool,
    ) -> Result<EvolutionResult> {
        let event = event_from_schema_change(change)?;
        let filtered = self.filter_events(vec![event]);
        if filtered.is_empty() {
            let mut result = EvolutionResult::succeeded(Vec::new());
            result
                .warnings
                .push("Change filtered by configuration".to_string());
            return Ok(result);
        }
        let result = self
            .migrator
            .execute_migrations(filtered, schema_name, dry_run)
            .await;
        self.metrics.lock().await.record(&result);
        Ok(result)
    }

    /// Apply per-table policy overrides (spec: excluded tables/columns are
    /// already handled by the detector).
    fn filter_events(&self, events: Vec<SchemaEvolutionEvent>) -> Vec<SchemaEvolutionEvent> {
        events
            .into_iter()
            .filter(|event| {
                if !self.config.is_table_enabled(&event.table_name) {
                    return false;
                }
                let Some(overrides) = self.config.table_configs.get(&event.table_name) else {
                    return true;
                };
                match event.change_type {
                    ChangeKind::AddColumn => overrides.allow_column_additions,
                    ChangeKind::DropColumn => overrides.allow_column_removals,
                    ChangeKind::ModifyColumnType => overrides.allow_type_changes,
                    _ => true,
                }
            })
            .collect()
    }

    /// Record the post-migration shape of every touched table in the schema
    /// registry.
    async fn register_migrated_schemas(&self, schema_name: &str, result: &EvolutionResult) {
        let detector = self.detector.lock().await;
        let Some(snapshot) = detector.cached_schema(schema_name) else {
            return;
        };

        for event in &result.events {
            let Some(table) = snapshot.table(&event.table_name) else {
                continue;
            };
            let definition = SchemaDefinition::from_table_schema(table);
            let evolution_type = match event.change_type {
                ChangeKind::AddTable => EvolutionType::Create,
                ChangeKind::AddColumn => EvolutionType::AddColumn,
                ChangeKind::DropColumn => EvolutionType::DropColumn,
                ChangeKind::ModifyColumnType | ChangeKind::RenameColumn => {
                    EvolutionType::ModifyColumn
                }
                ChangeKind::AddIndex => EvolutionType::AddIndex,
                ChangeKind::DropIndex => EvolutionType::DropIndex,
                _ => continue,
            };
            if let Err(e) = self
                .metadata
                .register_schema(schema_name, &event.table_name, definition, Some(evolution_type))
                .await
            {
                warn!(
                    schema = schema_name,
                    table = %event.table_name,
                    error = %e,
                    "Failed to register evolved schema version"
                );
            }
        }
    }

    pub async fn metrics(&self) -> EvolutionMetrics {
        self.metrics.lock().await.clone()
    }

    pub async fn reset_metrics(&self) {
        *self.metrics.lock().await = EvolutionMetrics::default();
    }

    /// Clear the detector cache for one schema (used by full resync).
    pub async fn clear_schema_cache(&self, schema_name: &str) {
        self.detector.lock().await.clear_cache(Some(schema_name));
    }

    /// Health snapshot: running state, policy, metrics and cache stats.
    pub async fn health_check(&self) -> HealthSnapshot {
        let metrics = self.metrics.lock().await.clone();
        let detector_stats = self.detector.lock().await.detection_stats();
        HealthSnapshot {
            running: self.running.load(Ordering::SeqCst),
            enabled: self.config.enabled,
            strategy: self.config.strategy,
            schemas_monitored: self.monitored_schemas.len(),
            last_check: metrics.last_check,
            metrics,
            detector_stats,
        }
    }
}

/// Build an evolution event from a source-emitted schema change.
fn event_from_schema_change(change: &SchemaChange) -> Result<SchemaEvolutionEvent> {
    use crate::error::SyncError;

    let kind = match change.kind {
        SchemaChangeKind::AddTable => ChangeKind::AddTable,
        SchemaChangeKind::DropTable => ChangeKind::DropTable,
        SchemaChangeKind::AddColumn => ChangeKind::AddColumn,
        SchemaChangeKind::DropColumn => ChangeKind::DropColumn,
        SchemaChangeKind::ModifyColumn => ChangeKind::ModifyColumnType,
        SchemaChangeKind::MigrationSql => {
            return Err(SyncError::Schema(
                "migration_sql changes cannot re-enter the migration path".to_string(),
            ));
        }
    };

    let mut event = SchemaEvolutionEvent::new(kind, &change.schema_name, &change.table_name);
    event.old_definition = change.details.get("old").cloned().filter(|v| !v.is_null());
    event.new_definition = change
        .details
        .get("new")
        .or_else(|| change.details.get("column"))
        .or_else(|| change.details.get("table"))
        .cloned()
        .filter(|v| !v.is_null());
    event.column_name = event
        .new_definition
        .as_ref()
        .or(event.old_definition.as_ref())
        .and_then(|d| d.get("name"))
        .and_then(Value::as_str)
        .map(String::from)
        .filter(|_| matches!(kind, ChangeKind::AddColumn | ChangeKind::DropColumn | ChangeKind::ModifyColumnType));

    // Source-emitted structural drops carry the same guardrails as detected
    // ones
    if matches!(kind, ChangeKind::DropTable | ChangeKind::DropColumn) {
        event.safety_level = super::types::SafetyLevel::Dangerous;
        event.requires_approval = true;
    }
    Ok(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::memory::{MemoryDestination, MemorySource};
    use crate::core::{ColumnDefinition, ColumnType, DatabaseSchema, TableSchema};
    use crate::metadata::MemoryMetadataStore;
    use serde_json::json;

    fn users_schema(with_phone: bool) -> DatabaseSchema {
        let mut columns = vec![
            ColumnDefinition::new("id", ColumnType::Bigint),
            ColumnDefinition::new("email", ColumnType::String),
        ];
        if with_phone {
            columns.push(ColumnDefinition::new("phone_number", ColumnType::String));
        }
        DatabaseSchema {
            name: "app".to_string(),
            tables: vec![TableSchema {
                name: "users".to_string(),
                columns,
                primary_keys: vec!["id".to_string()],
                indexes: vec![],
            }],
        }
    }

    fn engine_for(source: Arc<MemorySource>) -> (Arc<SchemaEvolutionEngine>, Arc<MemoryMetadataStore>) {
        let metadata = Arc::new(MemoryMetadataStore::new());
        let engine = Arc::new(SchemaEvolutionEngine::new(
            EvolutionConfig::default(),
            source,
            Arc::new(MemoryDestination::new()),
            metadata.clone(),
            vec!["app".to_string()],
        ));
        (engine, metadata)
    }

    #[tokio::test]
    async fn test_first_pass_is_baseline_second_detects_addition() {
        let source = Arc::new(MemorySource::new());
        source.set_schema(users_schema(false)).await;
        let (engine, metadata) = engine_for(source.clone());

        let first = engine.evolve_schema("app", false).await.unwrap();
        assert!(first.success);
        assert!(first.events.is_empty());

        source.set_schema(users_schema(true)).await;
        let second = engine.evolve_schema("app", false).await.unwrap();
        assert!(second.success, "errors: {:?}", second.errors);
        assert_eq!(second.events.len(), 1);
        assert_eq!(second.events[0].change_type, ChangeKind::AddColumn);
        assert_eq!(second.applied_changes.len(), 1);

        // The evolved table was registered in the schema registry
        let registered = metadata
            .get_schema_version("app", "users", None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(registered.schema_definition.columns.len(), 3);
        assert_eq!(registered.evolution_type, Some(EvolutionType::AddColumn));
    }

    #[tokio::test]
    async fn test_metrics_accumulate() {
        let source = Arc::new(MemorySource::new());
        source.set_schema(users_schema(false)).await;
        let (engine, _) = engine_for(source.clone());

        engine.evolve_schema("app", false).await.unwrap();
        source.set_schema(users_schema(true)).await;
        engine.evolve_schema("app", false).await.unwrap();

        let metrics = engine.metrics().await;
        assert_eq!(metrics.total_changes_detected, 1);
        assert_eq!(metrics.column_additions, 1);
        assert!(metrics.last_check.is_some());

        let health = engine.health_check().await;
        assert!(!health.running);
        assert!(health.enabled);
        assert_eq!(health.schemas_monitored, 1);
        assert_eq!(health.detector_stats["app"].0, 1);
    }

    #[tokio::test]
    async fn test_table_override_filters_column_additions() {
        let source = Arc::new(MemorySource::new());
        source.set_schema(users_schema(false)).await;

        let mut config = EvolutionConfig::default();
        config.table_configs.insert(
            "users".to_string(),
            super::super::config::TableEvolutionConfig {
                allow_column_additions: false,
                allow_type_changes: true,
                ..Default::default()
            },
        );
        let engine = SchemaEvolutionEngine::new(
            config,
            source.clone(),
            Arc::new(MemoryDestination::new()),
            Arc::new(MemoryMetadataStore::new()),
            vec!["app".to_string()],
        );

        engine.evolve_schema("app", false).await.unwrap();
        source.set_schema(users_schema(true)).await;
        let result = engine.evolve_schema("app", false).await.unwrap();

        assert!(result.success);
        assert!(result.applied_changes.is_empty());
        assert!(result
            .warnings
            .iter()
            .any(|w| w.contains("filtered by configuration")));
    }

    #[tokio::test]
    async fn test_apply_schema_change_from_source_stream() {
        let source = Arc::new(MemorySource::new());
        source.set_schema(users_schema(false)).await;
        let (engine, _) = engine_for(source);

        let mut details = serde_json::Map::new();
        details.insert("column".to_string(), json!({"name": "note", "type": "string"}));
        let change = SchemaChange {
            schema_name: "app".to_string(),
            table_name: "users".to_string(),
            kind: SchemaChangeKind::AddColumn,
            details,
            timestamp: Utc::now(),
        };

        let result = engine.apply_schema_change("app", &change, false).await.unwrap();
        assert!(result.success, "errors: {:?}", result.errors);
        assert_eq!(result.applied_changes.len(), 1);
        assert!(result.applied_changes[0].contains("ADD COLUMN \"note\""));
    }

    #[tokio::test]
    async fn test_apply_schema_change_dry_run_plans_only() {
        let source = Arc::new(MemorySource::new());
        source.set_schema(users_schema(false)).await;
        let destination = Arc::new(MemoryDestination::new());
        let engine = SchemaEvolutionEngine::new(
            EvolutionConfig::default(),
            source,
            destination.clone(),
            Arc::new(MemoryMetadataStore::new()),
            vec!["app".to_string()],
        );

        let mut details = serde_json::Map::new();
        details.insert("column".to_string(), json!({"name": "note", "type": "string"}));
        let change = SchemaChange {
            schema_name: "app".to_string(),
            table_name: "users".to_string(),
            kind: SchemaChangeKind::AddColumn,
            details,
            timestamp: Utc::now(),
        };

        let result = engine.apply_schema_change("app", &change, true).await.unwrap();
        assert!(result.success);
        assert!(result.applied_changes[0].starts_with("DRY RUN:"));
        assert!(destination.executed_sql().await.is_empty());
    }

    #[tokio::test]
    async fn test_source_emitted_drop_requires_approval() {
        let source = Arc::new(MemorySource::new());
        source.set_schema(users_schema(false)).await;
        let (engine, _) = engine_for(source);

        let change = SchemaChange {
            schema_name: "app".to_string(),
            table_name: "users".to_string(),
            kind: SchemaChangeKind::DropTable,
            details: serde_json::Map::new(),
            timestamp: Utc::now(),
        };

        let result = engine.apply_schema_change("app", &change, false).await.unwrap();
        assert!(!result.success);
        assert!(result.applied_changes.is_empty());
    }
}
