//! Schema migration engine.
//!
//! Validates a batch of evolution events against policy, orders them so
//! additive changes precede destructive ones, generates forward and rollback
//! DDL before touching the destination, executes sequentially, and rolls
//! back in reverse order on the first failure. A batch is all-or-nothing
//! from the caller's perspective.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::config::EvolutionConfig;
use super::convert::TypeConversionEngine;
use super::types::{ChangeKind, EvolutionResult, EvolutionStrategy, SafetyLevel, SchemaEvolutionEvent};
use crate::core::{ColumnType, DestinationConnector, SchemaChange};
use crate::error::{Result, SyncError};

/// Engine executing schema migrations against a destination.
pub struct SchemaMigrationEngine {
    config: EvolutionConfig,
    destination: Arc<dyn DestinationConnector>,
    converter: Arc<TypeConversionEngine>,
    active_migrations: AtomicUsize,
}

impl SchemaMigrationEngine {
    pub fn new(
        config: EvolutionConfig,
        destination: Arc<dyn DestinationConnector>,
        converter: Arc<TypeConversionEngine>,
    ) -> Self {
        Self {
            config,
            destination,
            converter,
            active_migrations: AtomicUsize::new(0),
        }
    }

    /// Execute a batch of evolution events.
    ///
    /// `dry_run` plans and reports the SQL without executing it. Success
    /// means every forward command succeeded; failure means rollback was
    /// attempted and `errors` reports what remains.
    pub async fn execute_migrations(
        &self,
        events: Vec<SchemaEvolutionEvent>,
        schema_name: &str,
        dry_run: bool,
    ) -> EvolutionResult {
        let start = Instant::now();
        let mut result = EvolutionResult {
            events: events.clone(),
            ..Default::default()
        };

        if events.is_empty() {
            result.success = true;
            result.processing_time = start.elapsed();
            return result;
        }

        if let Err(e) = self.validate_batch(&events) {
            result.errors.push(e.to_string());
            result.processing_time = start.elapsed();
            return result;
        }

        let mut sorted = events;
        sorted.sort_by_key(|e| (e.change_type.priority(), e.safety_level));

        let _guard = match MigrationGuard::acquire(
            &self.active_migrations,
            self.config.max_concurrent_migrations,
        ) {
            Some(guard) => guard,
            None => {
                result
                    .errors
                    .push("Maximum concurrent migrations reached".to_string());
                result.processing_time = start.elapsed();
                return result;
            }
        };

        for event in &sorted {
            let forward = match self.generate_migration_sql(event, schema_name) {
                Ok(sql) => sql,
                Err(e) => {
                    result.errors.push(e.to_string());
                    break;
                }
            };
            // Rollback is derived before execution so a mid-batch failure
            // can always be unwound
            let rollback = self.generate_rollback_sql(event, schema_name);

            if dry_run {
                result
                    .applied_changes
                    .extend(forward.iter().map(|sql| format!("DRY RUN: {}", sql)));
                continue;
            }

            let mut failed = false;
            for sql in &forward {
                debug!(sql, "Executing migration command");
                match self.execute_sql(schema_name, sql).await {
                    Ok(()) => result.applied_changes.push(sql.clone()),
                    Err(e) => {
                        error!(sql, error = %e, "Migration command failed");
                        result.errors.push(format!("Failed to execute: {}: {}", sql, e));
                        failed = true;
                        break;
                    }
                }
            }

            if failed {
                // Unwind only what previously applied, in reverse order
                if self.config.enable_rollback {
                    let commands = result.rollback_commands.clone();
                    self.execute_rollback(schema_name, &commands, &mut result).await;
                }
                break;
            }
            result.rollback_commands.extend(rollback);
        }

        result.success = result.errors.is_empty();
        result.processing_time = start.elapsed();

        if result.success {
            info!(
                schema = schema_name,
                changes = result.applied_changes.len(),
                dry_run,
                "Schema migration completed"
            );
        } else {
            error!(
                schema = schema_name,
                errors = result.errors.len(),
                "Schema migration failed"
            );
        }
        result
    }

    /// Policy validation for a batch.
    fn validate_batch(&self, events: &[SchemaEvolutionEvent]) -> Result<()> {
        let risky = events
            .iter()
            .filter(|e| e.safety_level == SafetyLevel::Risky)
            .count();
        let dangerous = events
            .iter()
            .filter(|e| {
                matches!(e.safety_level, SafetyLevel::Dangerous | SafetyLevel::Incompatible)
            })
            .count();

        match self.config.strategy {
            EvolutionStrategy::Strict if risky + dangerous > 0 => {
                return Err(SyncError::Schema(format!(
                    "Strict mode: {} unsafe changes blocked",
                    risky + dangerous
                )));
            }
            EvolutionStrategy::Conservative if dangerous > 0 => {
                return Err(SyncError::Schema(format!(
                    "Conservative mode: {} dangerous changes blocked",
                    dangerous
                )));
            }
            EvolutionStrategy::Permissive | EvolutionStrategy::Aggressive
                if risky + dangerous > 0 =>
            {
                warn!(
                    risky,
                    dangerous,
                    strategy = self.config.strategy.as_str(),
                    "Applying unsafe changes"
                );
            }
            _ => {}
        }

        // A batch with approval-required changes is rejected whole; callers
        // wanting partial application must pre-filter the event list
        if self.config.require_approval_for_risky_changes {
            let needs_approval = events.iter().filter(|e| e.requires_approval).count();
            if needs_approval > 0 {
                return Err(SyncError::ApprovalRequired {
                    count: needs_approval,
                });
            }
        }

        for event in events {
            if event.change_type == ChangeKind::ModifyColumnType
                && !self.validate_type_conversion(event)
            {
                return Err(SyncError::Schema(format!(
                    "Invalid type conversion for column {:?} of table {}",
                    event.column_name, event.table_name
                )));
            }
        }
        Ok(())
    }

    fn validate_type_conversion(&self, event: &SchemaEvolutionEvent) -> bool {
        let Some((old_type, new_type)) = event_types(event) else {
            return false;
        };
        self.converter.can_convert(old_type, new_type)
    }

    /// Forward DDL for one event.
    fn generate_migration_sql(
        &self,
        event: &SchemaEvolutionEvent,
        schema_name: &str,
    ) -> Result<Vec<String>> {
        let mut commands = Vec::new();

        match event.change_type {
            ChangeKind::AddTable => {
                let table = event.new_definition.as_ref().ok_or_else(|| {
                    SyncError::Schema("add_table event missing new definition".to_string())
                })?;
                commands.push(create_table_sql(schema_name, table)?);
            }
            ChangeKind::AddColumn => {
                let column = event.new_definition.as_ref().ok_or_else(|| {
                    SyncError::Schema("add_column event missing new definition".to_string())
                })?;
                let mut sql = format!(
                    "ALTER TABLE \"{}\".\"{}\" ADD COLUMN \"{}\" {}",
                    schema_name,
                    event.table_name,
                    column_name(column)?,
                    column_type_sql(column)?
                );
                if !column.get("nullable").and_then(Value::as_bool).unwrap_or(true) {
                    sql.push_str(" NOT NULL");
                }
                if let Some(default) = column.get("default").filter(|d| !d.is_null()) {
                    sql.push_str(&format!(" DEFAULT {}", sql_literal(default)));
                }
                commands.push(sql);
            }
            ChangeKind::ModifyColumnType => {
                let old = event.old_definition.as_ref();
                let new = event.new_definition.as_ref().ok_or_else(|| {
                    SyncError::Schema("modify_column_type event missing new definition".to_string())
                })?;
                let column = event.column_name.as_deref().ok_or_else(|| {
                    SyncError::Schema("modify_column_type event missing column name".to_string())
                })?;
                let mut sql = format!(
                    "ALTER TABLE \"{}\".\"{}\" ALTER COLUMN \"{}\" TYPE {}",
                    schema_name,
                    event.table_name,
                    column,
                    column_type_sql(new)?
                );
                if let Some(using) = old.and_then(|o| using_clause(column, o, new)) {
                    sql.push_str(&format!(" USING {}", using));
                }
                commands.push(sql);
            }
            ChangeKind::RenameColumn => {
                let old = event.old_definition.as_ref().ok_or_else(|| {
                    SyncError::Schema("rename_column event missing old definition".to_string())
                })?;
                let new = event.new_definition.as_ref().ok_or_else(|| {
                    SyncError::Schema("rename_column event missing new definition".to_string())
                })?;
                commands.push(format!(
                    "ALTER TABLE \"{}\".\"{}\" RENAME COLUMN \"{}\" TO \"{}\"",
                    schema_name,
                    event.table_name,
                    column_name(old)?,
                    column_name(new)?
                ));
            }
            ChangeKind::DropColumn => {
                let column = event.column_name.as_deref().ok_or_else(|| {
                    SyncError::Schema("drop_column event missing column name".to_string())
                })?;
                commands.push(format!(
                    "ALTER TABLE \"{}\".\"{}\" DROP COLUMN \"{}\"",
                    schema_name, event.table_name, column
                ));
            }
            ChangeKind::DropTable => {
                commands.push(format!(
                    "DROP TABLE \"{}\".\"{}\"",
                    schema_name, event.table_name
                ));
            }
            ChangeKind::AddIndex => {
                let index = event.new_definition.as_ref().ok_or_else(|| {
                    SyncError::Schema("add_index event missing new definition".to_string())
                })?;
                commands.push(create_index_sql(schema_name, &event.table_name, index)?);
            }
            ChangeKind::DropIndex => {
                let index = event.old_definition.as_ref().ok_or_else(|| {
                    SyncError::Schema("drop_index event missing old definition".to_string())
                })?;
                commands.push(format!(
                    "DROP INDEX IF EXISTS \"{}\".\"{}\"",
                    schema_name,
                    column_name(index)?
                ));
            }
            ChangeKind::ModifyColumnConstraint
            | ChangeKind::AddConstraint
            | ChangeKind::DropConstraint => {
                return Err(SyncError::Schema(format!(
                    "No SQL generation for {}",
                    event.change_type.as_str()
                )));
            }
        }
        Ok(commands)
    }

    /// Rollback DDL for one event, executed in reverse order on failure.
    fn generate_rollback_sql(&self, event: &SchemaEvolutionEvent, schema_name: &str) -> Vec<String> {
        match event.change_type {
            ChangeKind::AddTable => vec![format!(
                "DROP TABLE IF EXISTS \"{}\".\"{}\"",
                schema_name, event.table_name
            )],
            ChangeKind::AddColumn => match &event.new_definition {
                Some(column) => column_name(column)
                    .map(|name| {
                        vec![format!(
                            "ALTER TABLE \"{}\".\"{}\" DROP COLUMN IF EXISTS \"{}\"",
                            schema_name, event.table_name, name
                        )]
                    })
                    .unwrap_or_default(),
                None => Vec::new(),
            },
            ChangeKind::ModifyColumnType => {
                match (&event.old_definition, event.column_name.as_deref()) {
                    (Some(old), Some(column)) => match column_type_sql(old) {
                        Ok(old_type) => vec![format!(
                            "ALTER TABLE \"{}\".\"{}\" ALTER COLUMN \"{}\" TYPE {}",
                            schema_name, event.table_name, column, old_type
                        )],
                        Err(_) => Vec::new(),
                    },
                    _ => Vec::new(),
                }
            }
            ChangeKind::RenameColumn => {
                match (&event.old_definition, &event.new_definition) {
                    (Some(old), Some(new)) => match (column_name(old), column_name(new)) {
                        (Ok(old_name), Ok(new_name)) => vec![format!(
                            "ALTER TABLE \"{}\".\"{}\" RENAME COLUMN \"{}\" TO \"{}\"",
                            schema_name, event.table_name, new_name, old_name
                        )],
                        _ => Vec::new(),
                    },
                    _ => Vec::new(),
                }
            }
            ChangeKind::DropColumn => match &event.old_definition {
                Some(old) => match (column_name(old), column_type_sql(old)) {
                    (Ok(name), Ok(sql_type)) => vec![format!(
                        "ALTER TABLE \"{}\".\"{}\" ADD COLUMN \"{}\" {}",
                        schema_name, event.table_name, name, sql_type
                    )],
                    _ => Vec::new(),
                },
                None => Vec::new(),
            },
            // Dropped tables cannot be restored from DDL alone
            ChangeKind::DropTable => Vec::new(),
            ChangeKind::AddIndex => match &event.new_definition {
                Some(index) => column_name(index)
                    .map(|name| {
                        vec![format!(
                            "DROP INDEX IF EXISTS \"{}\".\"{}\"",
                            schema_name, name
                        )]
                    })
                    .unwrap_or_default(),
                None => Vec::new(),
            },
            ChangeKind::DropIndex => match &event.old_definition {
                Some(index) => create_index_sql(schema_name, &event.table_name, index)
                    .map(|sql| vec![sql])
                    .unwrap_or_default(),
                None => Vec::new(),
            },
            _ => Vec::new(),
        }
    }

    async fn execute_sql(&self, schema_name: &str, sql: &str) -> Result<()> {
        let change = SchemaChange::migration_sql(schema_name, sql);
        self.destination
            .apply_schema_changes(schema_name, &[change])
            .await
    }

    async fn execute_rollback(
        &self,
        schema_name: &str,
        commands: &[String],
        result: &mut EvolutionResult,
    ) {
        warn!(commands = commands.len(), "Executing rollback");
        let mut rollback_failed = false;
        for sql in commands.iter().rev() {
            if let Err(e) = self.execute_sql(schema_name, sql).await {
                // Rollback failures are reported, not hidden; the schema is
                // left at the last successfully rolled-back step
                error!(sql, error = %e, "Rollback command failed");
                result.errors.push(format!("Rollback failed: {}: {}", sql, e));
                rollback_failed = true;
            }
        }
        if !rollback_failed {
            result.warnings.push("Rollback completed successfully".to_string());
        }
    }
}

/// RAII guard for the concurrent-migration limit.
struct MigrationGuard<'a> {
    counter: &'a AtomicUsize,
}

impl<'a> MigrationGuard<'a> {
    fn acquire(counter: &'a AtomicUsize, limit: usize) -> Option<Self> {
        let mut current = counter.load(Ordering::Acquire);
        loop {
            if current >= limit {
                return None;
            }
            match counter.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(Self { counter }),
                Err(actual) => current = actual,
            }
        }
    }
}

impl Drop for MigrationGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

fn event_types(event: &SchemaEvolutionEvent) -> Option<(ColumnType, ColumnType)> {
    let old = event
        .old_definition
        .as_ref()
        .and_then(|d| d.get("type"))
        .and_then(|t| serde_json::from_value::<ColumnType>(t.clone()).ok())?;
    let new = event
        .new_definition
        .as_ref()
        .and_then(|d| d.get("type"))
        .and_then(|t| serde_json::from_value::<ColumnType>(t.clone()).ok())?;
    Some((old, new))
}

fn column_name(definition: &Value) -> Result<String> {
    definition
        .get("name")
        .and_then(Value::as_str)
        .map(String::from)
        .ok_or_else(|| SyncError::Schema("definition missing name".to_string()))
}

/// Map a JSON column definition to a PostgreSQL type string.
fn column_type_sql(definition: &Value) -> Result<String> {
    let type_name = definition
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| SyncError::Schema("definition missing type".to_string()))?;

    let sql = match type_name {
        "string" => {
            let max_length = definition.get("max_length").and_then(Value::as_i64);
            match max_length {
                Some(n) if n > 0 => format!("VARCHAR({})", n),
                _ => "TEXT".to_string(),
            }
        }
        "integer" => "INTEGER".to_string(),
        "bigint" => "BIGINT".to_string(),
        "float" => "REAL".to_string(),
        "double" => "DOUBLE PRECISION".to_string(),
        "boolean" => "BOOLEAN".to_string(),
        "timestamp" => "TIMESTAMPTZ".to_string(),
        "date" => "DATE".to_string(),
        "json" => "JSONB".to_string(),
        "binary" => "BYTEA".to_string(),
        other => {
            return Err(SyncError::Schema(format!("unknown column type '{}'", other)));
        }
    };
    Ok(sql)
}

fn sql_literal(value: &Value) -> String {
    match value {
        Value::String(s) => format!("'{}'", s.replace('\'', "''")),
        Value::Bool(true) => "TRUE".to_string(),
        Value::Bool(false) => "FALSE".to_string(),
        Value::Null => "NULL".to_string(),
        other => other.to_string(),
    }
}

/// USING clause for conversions PostgreSQL will not cast implicitly.
fn using_clause(column: &str, old: &Value, new: &Value) -> Option<String> {
    let old_type = old.get("type").and_then(Value::as_str)?;
    let new_type = new.get("type").and_then(Value::as_str)?;
    if old_type != "string" {
        return None;
    }
    match new_type {
        "integer" | "bigint" => Some(format!("\"{}\"::BIGINT", column)),
        "float" | "double" => Some(format!("\"{}\"::DOUBLE PRECISION", column)),
        "boolean" => Some(format!("\"{}\"::BOOLEAN", column)),
        _ => None,
    }
}

fn create_table_sql(schema_name: &str, table: &Value) -> Result<String> {
    let name = column_name(table)?;
    let columns = table
        .get("columns")
        .and_then(Value::as_array)
        .ok_or_else(|| SyncError::Schema("add_table definition missing columns".to_string()))?;

    let mut parts = Vec::new();
    for column in columns {
        let mut part = format!("\"{}\" {}", column_name(column)?, column_type_sql(column)?);
        if !column.get("nullable").and_then(Value::as_bool).unwrap_or(true) {
            part.push_str(" NOT NULL");
        }
        if let Some(default) = column.get("default").filter(|d| !d.is_null()) {
            part.push_str(&format!(" DEFAULT {}", sql_literal(default)));
        }
        parts.push(part);
    }

    if let Some(pks) = table.get("primary_keys").and_then(Value::as_array) {
        if !pks.is_empty() {
            let quoted: Vec<String> = pks
                .iter()
                .filter_map(Value::as_str)
                .map(|pk| format!("\"{}\"", pk))
                .collect();
            parts.push(format!("PRIMARY KEY ({})", quoted.join(", ")));
        }
    }

    Ok(format!(
        "CREATE TABLE \"{}\".\"{}\" ({})",
        schema_name,
        name,
        parts.join(", ")
    ))
}

fn create_index_sql(schema_name: &str, table_name: &str, index: &Value) -> Result<String> {
    let name = column_name(index)?;
    let columns = index
        .get("columns")
        .and_then(Value::as_array)
        .ok_or_else(|| SyncError::Schema("index definition missing columns".to_string()))?;
    let quoted: Vec<String> = columns
        .iter()
        .filter_map(Value::as_str)
        .map(|c| format!("\"{}\"", c))
        .collect();
    let unique = if index.get("unique").and_then(Value::as_bool).unwrap_or(false) {
        "UNIQUE "
    } else {
        ""
    };
    Ok(format!(
        "CREATE {}INDEX IF NOT EXISTS \"{}\" ON \"{}\".\"{}\" ({})",
        unique,
        name,
        schema_name,
        table_name,
        quoted.join(", ")
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::memory::MemoryDestination;
    use serde_json::json;

    fn engine_with(strategy: EvolutionStrategy) -> SchemaMigrationEngine {
        let config = EvolutionConfig {
            strategy,
            ..Default::default()
        };
        SchemaMigrationEngine::new(
            config,
            Arc::new(MemoryDestination::new()),
            Arc::new(TypeConversionEngine::new()),
        )
    }

    fn add_column_event(table: &str, column: &str) -> SchemaEvolutionEvent {
        let mut event = SchemaEvolutionEvent::new(ChangeKind::AddColumn, "app", table);
        event.column_name = Some(column.to_string());
        event.new_definition = Some(json!({"name": column, "type": "string"}));
        event
    }

    fn dangerous_type_change() -> SchemaEvolutionEvent {
        let mut event = SchemaEvolutionEvent::new(ChangeKind::ModifyColumnType, "app", "users");
        event.column_name = Some("age".to_string());
        event.old_definition = Some(json!({"name": "age", "type": "string"}));
        event.new_definition = Some(json!({"name": "age", "type": "integer"}));
        event.safety_level = SafetyLevel::Dangerous;
        event.requires_approval = true;
        event
    }

    #[tokio::test]
    async fn test_strict_policy_rejects_dangerous_batch_entirely() {
        let engine = engine_with(EvolutionStrategy::Strict);
        let result = engine
            .execute_migrations(vec![dangerous_type_change()], "app", false)
            .await;
        assert!(!result.success);
        assert!(result.applied_changes.is_empty());
        assert!(result.errors.iter().any(|e| e.contains("Strict mode")));
    }

    #[tokio::test]
    async fn test_conservative_policy_blocks_dangerous_only() {
        let engine = engine_with(EvolutionStrategy::Conservative);
        let result = engine
            .execute_migrations(vec![dangerous_type_change()], "app", false)
            .await;
        assert!(!result.success);
        assert!(result
            .errors
            .iter()
            .any(|e| e.contains("Conservative mode")));
    }

    #[tokio::test]
    async fn test_approval_required_batch_is_aborted_whole() {
        // Permissive strategy passes the safety gate, but the approval flag
        // still rejects the whole batch, including its safe member
        let engine = engine_with(EvolutionStrategy::Permissive);
        let events = vec![add_column_event("users", "note"), dangerous_type_change()];
        let result = engine.execute_migrations(events, "app", false).await;
        assert!(!result.success);
        assert!(result.applied_changes.is_empty());
        assert!(result.errors.iter().any(|e| e.contains("approval")));
    }

    #[tokio::test]
    async fn test_safe_batch_executes_in_priority_order() {
        let engine = engine_with(EvolutionStrategy::Conservative);

        let mut add_table = SchemaEvolutionEvent::new(ChangeKind::AddTable, "app", "invoices");
        add_table.new_definition = Some(json!({
            "name": "invoices",
            "columns": [{"name": "id", "type": "bigint", "nullable": false}],
            "primary_keys": ["id"],
        }));

        // Deliberately out of order: column first, table second
        let events = vec![add_column_event("users", "note"), add_table];
        let result = engine.execute_migrations(events, "app", false).await;

        assert!(result.success, "errors: {:?}", result.errors);
        assert_eq!(result.applied_changes.len(), 2);
        assert!(result.applied_changes[0].starts_with("CREATE TABLE"));
        assert!(result.applied_changes[1].starts_with("ALTER TABLE"));
        // Rollback plans exist even on success
        assert_eq!(result.rollback_commands.len(), 2);
    }

    #[tokio::test]
    async fn test_dry_run_plans_without_executing() {
        let destination = Arc::new(MemoryDestination::new());
        let engine = SchemaMigrationEngine::new(
            EvolutionConfig::default(),
            destination.clone(),
            Arc::new(TypeConversionEngine::new()),
        );
        let result = engine
            .execute_migrations(vec![add_column_event("users", "note")], "app", true)
            .await;
        assert!(result.success);
        assert!(result.applied_changes[0].starts_with("DRY RUN:"));
        assert!(destination.executed_sql().await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_step_triggers_reverse_rollback() {
        let destination = Arc::new(MemoryDestination::new());
        destination
            .fail_sql_containing("ADD COLUMN \"broken\"")
            .await;
        let engine = SchemaMigrationEngine::new(
            EvolutionConfig::default(),
            destination.clone(),
            Arc::new(TypeConversionEngine::new()),
        );

        let events = vec![
            add_column_event("users", "note"),
            add_column_event("users", "broken"),
        ];
        let result = engine.execute_migrations(events, "app", false).await;

        assert!(!result.success);
        // First statement applied, second failed
        assert_eq!(result.applied_changes.len(), 1);
        assert!(result.warnings.iter().any(|w| w.contains("Rollback completed")));
        // The rollback dropped the first column again
        let executed = destination.executed_sql().await;
        assert!(executed
            .iter()
            .any(|sql| sql.contains("DROP COLUMN IF EXISTS \"note\"")));
    }

    #[test]
    fn test_modify_column_type_generates_using_clause() {
        let engine = engine_with(EvolutionStrategy::Aggressive);
        let sql = engine
            .generate_migration_sql(&dangerous_type_change(), "app")
            .unwrap();
        assert_eq!(sql.len(), 1);
        assert!(sql[0].contains("ALTER COLUMN \"age\" TYPE INTEGER"));
        assert!(sql[0].contains("USING \"age\"::BIGINT"));
    }

    #[test]
    fn test_rollback_restores_previous_type() {
        let engine = engine_with(EvolutionStrategy::Aggressive);
        let rollback = engine.generate_rollback_sql(&dangerous_type_change(), "app");
        assert_eq!(rollback.len(), 1);
        assert!(rollback[0].contains("ALTER COLUMN \"age\" TYPE TEXT"));
    }

    #[test]
    fn test_varchar_length_carried_into_ddl() {
        let sql =
            column_type_sql(&json!({"name": "code", "type": "string", "max_length": 32})).unwrap();
        assert_eq!(sql, "VARCHAR(32)");
        let unbounded = column_type_sql(&json!({"name": "body", "type": "string"})).unwrap();
        assert_eq!(unbounded, "TEXT");
    }

    #[test]
    fn test_sql_literal_escapes_quotes() {
        assert_eq!(sql_literal(&json!("O'Brien")), "'O''Brien'");
        assert_eq!(sql_literal(&json!(true)), "TRUE");
        assert_eq!(sql_literal(&json!(7)), "7");
    }

    #[test]
    fn test_migration_guard_enforces_limit() {
        let counter = AtomicUsize::new(0);
        let first = MigrationGuard::acquire(&counter, 1);
        assert!(first.is_some());
        assert!(MigrationGuard::acquire(&counter, 1).is_none());
        drop(first);
        assert!(MigrationGuard::acquire(&counter, 1).is_some());
    }
}
