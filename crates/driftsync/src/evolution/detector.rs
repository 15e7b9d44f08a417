//! Schema change detection.
//!
//! The detector owns one cached [`DatabaseSchema`] snapshot per schema name.
//! The first observation of a schema establishes the baseline and emits no
//! events; every later check diffs against the cache and then replaces it.
//! No multi-generation history is kept here; the schema registry in the
//! metadata store is the durable history.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::config::EvolutionConfig;
use super::convert::TypeConversionEngine;
use super::types::{ChangeKind, SafetyLevel, SchemaEvolutionEvent};
use crate::core::{ColumnDefinition, DatabaseSchema, TableSchema};

/// Detects changes between consecutive schema snapshots.
pub struct SchemaChangeDetector {
    config: EvolutionConfig,
    cache: HashMap<String, DatabaseSchema>,
    last_detection: HashMap<String, DateTime<Utc>>,
}

impl SchemaChangeDetector {
    pub fn new(config: EvolutionConfig) -> Self {
        Self {
            config,
            cache: HashMap::new(),
            last_detection: HashMap::new(),
        }
    }

    /// Diff `current` against the previous snapshot.
    ///
    /// With `previous = None` the cached snapshot is used; if none exists the
    /// current snapshot is cached as the baseline and no events are emitted.
    /// After diffing, the cache holds `current`.
    pub fn detect_changes(
        &mut self,
        schema_name: &str,
        current: DatabaseSchema,
        previous: Option<&DatabaseSchema>,
        converter: &TypeConversionEngine,
    ) -> Vec<SchemaEvolutionEvent> {
        let baseline = match previous {
            Some(p) => p.clone(),
            None => match self.cache.get(schema_name) {
                Some(cached) => cached.clone(),
                None => {
                    info!(
                        schema = schema_name,
                        tables = current.tables.len(),
                        "Caching initial schema snapshot"
                    );
                    self.replace_cache(schema_name, current);
                    return Vec::new();
                }
            },
        };

        let mut events = Vec::new();
        self.detect_table_changes(schema_name, &current, &baseline, &mut events);
        self.detect_column_changes(schema_name, &current, &baseline, converter, &mut events);

        self.replace_cache(schema_name, current);

        if !events.is_empty() {
            info!(
                schema = schema_name,
                changes = events.len(),
                "Schema changes detected"
            );
        }
        events
    }

    fn replace_cache(&mut self, schema_name: &str, snapshot: DatabaseSchema) {
        self.cache.insert(schema_name.to_string(), snapshot);
        self.last_detection.insert(schema_name.to_string(), Utc::now());
    }

    fn detect_table_changes(
        &self,
        schema_name: &str,
        current: &DatabaseSchema,
        previous: &DatabaseSchema,
        events: &mut Vec<SchemaEvolutionEvent>,
    ) {
        for table in &current.tables {
            if previous.table(&table.name).is_none() && self.config.is_table_enabled(&table.name) {
                let mut event =
                    SchemaEvolutionEvent::new(ChangeKind::AddTable, schema_name, &table.name);
                event.new_definition = serde_json::to_value(table).ok();
                event.estimated_impact = format!(
                    "New table '{}' with {} columns",
                    table.name,
                    table.columns.len()
                );
                events.push(event);
            }
        }

        for table in &previous.tables {
            if current.table(&table.name).is_none() && self.config.is_table_enabled(&table.name) {
                let mut event =
                    SchemaEvolutionEvent::new(ChangeKind::DropTable, schema_name, &table.name);
                event.old_definition = serde_json::to_value(table).ok();
                event.safety_level = SafetyLevel::Dangerous;
                event.requires_approval = true;
                event.estimated_impact = format!(
                    "Table '{}' with {} columns will be dropped",
                    table.name,
                    table.columns.len()
                );
                events.push(event);
            }
        }
    }

    fn detect_column_changes(
        &self,
        schema_name: &str,
        current: &DatabaseSchema,
        previous: &DatabaseSchema,
        converter: &TypeConversionEngine,
        events: &mut Vec<SchemaEvolutionEvent>,
    ) {
        for table in &current.tables {
            if !self.config.is_table_enabled(&table.name) {
                continue;
            }
            let Some(previous_table) = previous.table(&table.name) else {
                continue;
            };
            self.detect_table_column_changes(schema_name, table, previous_table, converter, events);
        }
    }

    fn detect_table_column_changes(
        &self,
        schema_name: &str,
        current: &TableSchema,
        previous: &TableSchema,
        converter: &TypeConversionEngine,
        events: &mut Vec<SchemaEvolutionEvent>,
    ) {
        let table_name = &current.name;

        if self.config.detect_column_additions {
            for column in &current.columns {
                if previous.column(&column.name).is_none()
                    && !self.config.is_column_excluded(table_name, &column.name)
                {
                    let mut event =
                        SchemaEvolutionEvent::new(ChangeKind::AddColumn, schema_name, table_name);
                    event.column_name = Some(column.name.clone());
                    event.new_definition = serde_json::to_value(column).ok();
                    event.estimated_impact = format!(
                        "New column '{}' of type {}",
                        column.name,
                        column.column_type.as_str()
                    );
                    events.push(event);
                }
            }
        }

        if self.config.detect_column_removals {
            for column in &previous.columns {
                if current.column(&column.name).is_none()
                    && !self.config.is_column_excluded(table_name, &column.name)
                {
                    let mut event =
                        SchemaEvolutionEvent::new(ChangeKind::DropColumn, schema_name, table_name);
                    event.column_name = Some(column.name.clone());
                    event.old_definition = serde_json::to_value(column).ok();
                    event.safety_level = SafetyLevel::Dangerous;
                    event.requires_approval = true;
                    event.estimated_impact = format!(
                        "Column '{}' of type {} will be dropped",
                        column.name,
                        column.column_type.as_str()
                    );
                    events.push(event);
                }
            }
        }

        if self.config.detect_type_changes {
            for column in &current.columns {
                if self.config.is_column_excluded(table_name, &column.name) {
                    continue;
                }
                let Some(old_column) = previous.column(&column.name) else {
                    continue;
                };
                if old_column.column_type == column.column_type {
                    continue;
                }
                events.push(self.type_change_event(
                    schema_name,
                    table_name,
                    old_column,
                    column,
                    converter,
                ));
            }
        }
    }

    fn type_change_event(
        &self,
        schema_name: &str,
        table_name: &str,
        old_column: &ColumnDefinition,
        new_column: &ColumnDefinition,
        converter: &TypeConversionEngine,
    ) -> SchemaEvolutionEvent {
        // Safety classification comes from the conversion rule table
        let safety = converter.conversion_safety(old_column.column_type, new_column.column_type);

        let mut event =
            SchemaEvolutionEvent::new(ChangeKind::ModifyColumnType, schema_name, table_name);
        event.column_name = Some(new_column.name.clone());
        event.old_definition = serde_json::to_value(old_column).ok();
        event.new_definition = serde_json::to_value(new_column).ok();
        event.safety_level = safety;
        event.requires_approval =
            matches!(safety, SafetyLevel::Risky | SafetyLevel::Dangerous | SafetyLevel::Incompatible);
        event.estimated_impact = format!(
            "Column '{}' type change: {} -> {}",
            new_column.name,
            old_column.column_type.as_str(),
            new_column.column_type.as_str()
        );
        debug!(
            table = table_name,
            column = %new_column.name,
            safety = safety.as_str(),
            "Detected column type change"
        );
        event
    }

    /// Cached snapshot for a schema, if any.
    pub fn cached_schema(&self, schema_name: &str) -> Option<&DatabaseSchema> {
        self.cache.get(schema_name)
    }

    /// Drop the cache for one schema, or all schemas.
    pub fn clear_cache(&mut self, schema_name: Option<&str>) {
        match schema_name {
            Some(name) => {
                self.cache.remove(name);
                self.last_detection.remove(name);
            }
            None => {
                self.cache.clear();
                self.last_detection.clear();
            }
        }
    }

    /// Per-schema cache stats: (cached tables, total columns).
    pub fn detection_stats(&self) -> HashMap<String, (usize, usize)> {
        self.cache
            .iter()
            .map(|(name, snapshot)| {
                let columns = snapshot.tables.iter().map(|t| t.columns.len()).sum();
                (name.clone(), (snapshot.tables.len(), columns))
            })
            .collect()
    }

    /// When a schema was last diffed.
    pub fn last_detection(&self, schema_name: &str) -> Option<DateTime<Utc>> {
        self.last_detection.get(schema_name).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ColumnType;

    fn table(name: &str, columns: &[(&str, ColumnType)]) -> TableSchema {
        TableSchema {
            name: name.to_string(),
            columns: columns
                .iter()
                .map(|(n, t)| ColumnDefinition::new(*n, *t))
                .collect(),
            primary_keys: vec!["id".to_string()],
            indexes: vec![],
        }
    }

    fn snapshot(tables: Vec<TableSchema>) -> DatabaseSchema {
        DatabaseSchema {
            name: "app".to_string(),
            tables,
        }
    }

    fn detector() -> (SchemaChangeDetector, TypeConversionEngine) {
        (
            SchemaChangeDetector::new(EvolutionConfig::default()),
            TypeConversionEngine::new(),
        )
    }

    #[test]
    fn test_first_observation_establishes_baseline() {
        let (mut detector, converter) = detector();
        let events = detector.detect_changes(
            "app",
            snapshot(vec![table("users", &[("id", ColumnType::Bigint)])]),
            None,
            &converter,
        );
        assert!(events.is_empty());
        assert!(detector.cached_schema("app").is_some());
        assert!(detector.last_detection("app").is_some());
    }

    #[test]
    fn test_add_column_is_safe_without_approval() {
        let (mut detector, converter) = detector();
        let before = snapshot(vec![table("users", &[("id", ColumnType::Bigint)])]);
        let after = snapshot(vec![table(
            "users",
            &[("id", ColumnType::Bigint), ("phone_number", ColumnType::String)],
        )]);

        detector.detect_changes("app", before, None, &converter);
        let events = detector.detect_changes("app", after, None, &converter);

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].change_type, ChangeKind::AddColumn);
        assert_eq!(events[0].column_name.as_deref(), Some("phone_number"));
        assert_eq!(events[0].safety_level, SafetyLevel::Safe);
        assert!(!events[0].requires_approval);
    }

    #[test]
    fn test_string_to_integer_change_is_dangerous() {
        let (mut detector, converter) = detector();
        let before = snapshot(vec![table("users", &[("age", ColumnType::String)])]);
        let after = snapshot(vec![table("users", &[("age", ColumnType::Integer)])]);

        detector.detect_changes("app", before, None, &converter);
        let events = detector.detect_changes("app", after, None, &converter);

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].change_type, ChangeKind::ModifyColumnType);
        assert_eq!(events[0].safety_level, SafetyLevel::Dangerous);
        assert!(events[0].requires_approval);
    }

    #[test]
    fn test_drop_table_requires_approval() {
        let (mut detector, converter) = detector();
        let before = snapshot(vec![
            table("users", &[("id", ColumnType::Bigint)]),
            table("legacy", &[("id", ColumnType::Bigint)]),
        ]);
        let after = snapshot(vec![table("users", &[("id", ColumnType::Bigint)])]);

        detector.detect_changes("app", before, None, &converter);
        let events = detector.detect_changes("app", after, None, &converter);

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].change_type, ChangeKind::DropTable);
        assert_eq!(events[0].safety_level, SafetyLevel::Dangerous);
        assert!(events[0].requires_approval);
    }

    #[test]
    fn test_add_table_is_safe() {
        let (mut detector, converter) = detector();
        let before = snapshot(vec![table("users", &[("id", ColumnType::Bigint)])]);
        let after = snapshot(vec![
            table("users", &[("id", ColumnType::Bigint)]),
            table("invoices", &[("id", ColumnType::Bigint)]),
        ]);

        detector.detect_changes("app", before, None, &converter);
        let events = detector.detect_changes("app", after, None, &converter);

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].change_type, ChangeKind::AddTable);
        assert_eq!(events[0].safety_level, SafetyLevel::Safe);
    }

    #[test]
    fn test_excluded_column_suppresses_events() {
        let mut config = EvolutionConfig::default();
        config
            .excluded_columns
            .insert("users".to_string(), vec!["shadow".to_string()]);
        let mut detector = SchemaChangeDetector::new(config);
        let converter = TypeConversionEngine::new();

        let before = snapshot(vec![table("users", &[("id", ColumnType::Bigint)])]);
        let after = snapshot(vec![table(
            "users",
            &[("id", ColumnType::Bigint), ("shadow", ColumnType::String)],
        )]);

        detector.detect_changes("app", before, None, &converter);
        let events = detector.detect_changes("app", after, None, &converter);
        assert!(events.is_empty());
    }

    #[test]
    fn test_cache_is_replaced_after_each_diff() {
        let (mut detector, converter) = detector();
        let v1 = snapshot(vec![table("users", &[("id", ColumnType::Bigint)])]);
        let v2 = snapshot(vec![table(
            "users",
            &[("id", ColumnType::Bigint), ("email", ColumnType::String)],
        )]);

        detector.detect_changes("app", v1, None, &converter);
        detector.detect_changes("app", v2.clone(), None, &converter);
        assert_eq!(detector.cached_schema("app"), Some(&v2));

        // Diffing v2 against itself is quiet
        let events = detector.detect_changes("app", v2, None, &converter);
        assert!(events.is_empty());
    }

    #[test]
    fn test_clear_cache_resets_baseline() {
        let (mut detector, converter) = detector();
        let v1 = snapshot(vec![table("users", &[("id", ColumnType::Bigint)])]);
        detector.detect_changes("app", v1.clone(), None, &converter);
        detector.clear_cache(Some("app"));
        assert!(detector.cached_schema("app").is_none());

        // Next observation is a baseline again
        let events = detector.detect_changes("app", v1, None, &converter);
        assert!(events.is_empty());
    }

    #[test]
    fn test_detection_stats() {
        let (mut detector, converter) = detector();
        detector.detect_changes(
            "app",
            snapshot(vec![table(
                "users",
                &[("id", ColumnType::Bigint), ("email", ColumnType::String)],
            )]),
            None,
            &converter,
        );
        let stats = detector.detection_stats();
        assert_eq!(stats["app"], (1, 2));
    }
}
