//! Change records and events flowing from source to destination.

use std::pin::Pin;

use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;

/// Types of row-level operations carried by a [`Record`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Insert,
    Update,
    Delete,
    SchemaChange,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Insert => "insert",
            OperationType::Update => "update",
            OperationType::Delete => "delete",
            OperationType::SchemaChange => "schema_change",
        }
    }
}

/// One row-level change as produced by a source connector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    /// Table the change belongs to.
    pub table_name: String,

    /// Column values after the change.
    pub data: Map<String, Value>,

    /// Operation kind.
    pub operation: OperationType,

    /// When the change happened on the source.
    pub timestamp: DateTime<Utc>,

    /// Primary key values identifying the row.
    pub primary_key_values: Map<String, Value>,

    /// Row image before the change, for updates and deletes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before_data: Option<Map<String, Value>>,
}

impl Record {
    /// Source-side identity of this record, used to deduplicate dead-letter
    /// entries. Single-column keys collapse to the bare value.
    pub fn source_record_id(&self) -> Option<String> {
        match self.primary_key_values.len() {
            0 => None,
            1 => self
                .primary_key_values
                .values()
                .next()
                .map(value_to_plain_string),
            _ => {
                let mut parts: Vec<String> = self
                    .primary_key_values
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, value_to_plain_string(v)))
                    .collect();
                parts.sort();
                Some(parts.join(","))
            }
        }
    }

    /// Approximate wire size, used for bytes-processed statistics.
    pub fn approximate_size(&self) -> u64 {
        serde_json::to_vec(&self.data).map(|v| v.len() as u64).unwrap_or(0)
    }
}

fn value_to_plain_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// A [`Record`] paired with the position it was read at.
///
/// The `position_marker` is opaque to the engine (resume token, LSN or
/// timestamp, serialized as JSON) and must be persisted only after the
/// record's write has been durably applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub record: Record,

    /// Opaque resume position issued by the source.
    pub position_marker: Value,

    /// Schema the change belongs to.
    pub schema_name: String,
}

/// Kinds of structural changes a source or the migrator can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaChangeKind {
    AddTable,
    DropTable,
    AddColumn,
    DropColumn,
    ModifyColumn,
    /// A raw DDL statement generated by the migration engine.
    MigrationSql,
}

/// A structural change to apply on the destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaChange {
    pub schema_name: String,
    pub table_name: String,
    pub kind: SchemaChangeKind,

    /// Change-specific details (column name, types, raw SQL, ...).
    pub details: Map<String, Value>,

    pub timestamp: DateTime<Utc>,
}

impl SchemaChange {
    /// Wrap a migrator-generated DDL statement.
    pub fn migration_sql(schema_name: impl Into<String>, sql: impl Into<String>) -> Self {
        let mut details = Map::new();
        details.insert("sql".to_string(), Value::String(sql.into()));
        Self {
            schema_name: schema_name.into(),
            table_name: String::new(),
            kind: SchemaChangeKind::MigrationSql,
            details,
            timestamp: Utc::now(),
        }
    }
}

/// Stream of change events pulled from a source.
///
/// Restartable: a stream opened with a previously-issued marker resumes
/// after that position. Infinite in stream mode, finite in batch mode.
pub type ChangeStream = Pin<Box<dyn Stream<Item = Result<ChangeEvent>> + Send>>;

/// Stream of snapshot rows for an initial or full reload.
///
/// NOT restartable mid-sequence: consumers must either drain it or start
/// over from the beginning. There is no marker to resume a snapshot from.
pub type SnapshotStream = Pin<Box<dyn Stream<Item = Result<Record>> + Send>>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record_with_pk(pk: Map<String, Value>) -> Record {
        let mut data = Map::new();
        data.insert("id".to_string(), json!(7));
        Record {
            table_name: "orders".to_string(),
            data,
            operation: OperationType::Insert,
            timestamp: Utc::now(),
            primary_key_values: pk,
            before_data: None,
        }
    }

    #[test]
    fn test_source_record_id_single_key() {
        let mut pk = Map::new();
        pk.insert("id".to_string(), json!(7));
        assert_eq!(record_with_pk(pk).source_record_id().as_deref(), Some("7"));

        let mut pk = Map::new();
        pk.insert("id".to_string(), json!("abc-123"));
        assert_eq!(
            record_with_pk(pk).source_record_id().as_deref(),
            Some("abc-123")
        );
    }

    #[test]
    fn test_source_record_id_composite_key_is_stable() {
        let mut pk = Map::new();
        pk.insert("b".to_string(), json!(2));
        pk.insert("a".to_string(), json!(1));
        let id1 = record_with_pk(pk.clone()).source_record_id().unwrap();

        let mut pk2 = Map::new();
        pk2.insert("a".to_string(), json!(1));
        pk2.insert("b".to_string(), json!(2));
        let id2 = record_with_pk(pk2).source_record_id().unwrap();

        assert_eq!(id1, id2);
        assert_eq!(id1, "a=1,b=2");
    }

    #[test]
    fn test_source_record_id_missing_key() {
        assert!(record_with_pk(Map::new()).source_record_id().is_none());
    }

    #[test]
    fn test_migration_sql_change() {
        let change = SchemaChange::migration_sql("app", "ALTER TABLE app.t ADD COLUMN c TEXT");
        assert_eq!(change.kind, SchemaChangeKind::MigrationSql);
        assert_eq!(
            change.details.get("sql").and_then(|v| v.as_str()),
            Some("ALTER TABLE app.t ADD COLUMN c TEXT")
        );
    }
}
