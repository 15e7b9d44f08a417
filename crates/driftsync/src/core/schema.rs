//! Portable schema model shared by connectors and the evolution engine.
//!
//! These types provide a database-agnostic representation of tables, columns
//! and indexes as observed on the source, independent of any engine's
//! catalog format.

use serde::{Deserialize, Serialize};

/// Column types understood by the sync engine.
///
/// Source connectors normalize their native types into this set; the
/// destination connector and the type conversion engine only ever see these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    String,
    Integer,
    Bigint,
    Float,
    Double,
    Boolean,
    Timestamp,
    Date,
    Json,
    Binary,
}

impl ColumnType {
    /// Stable lowercase name, used in DDL details and metadata payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::String => "string",
            ColumnType::Integer => "integer",
            ColumnType::Bigint => "bigint",
            ColumnType::Float => "float",
            ColumnType::Double => "double",
            ColumnType::Boolean => "boolean",
            ColumnType::Timestamp => "timestamp",
            ColumnType::Date => "date",
            ColumnType::Json => "json",
            ColumnType::Binary => "binary",
        }
    }
}

/// Definition of a single column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDefinition {
    /// Column name.
    pub name: String,

    /// Normalized column type.
    #[serde(rename = "type")]
    pub column_type: ColumnType,

    /// Whether the column allows NULL.
    #[serde(default = "default_true")]
    pub nullable: bool,

    /// Default value, if any, as a JSON scalar.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,

    /// Maximum length for string/binary types.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<i32>,

    /// Numeric precision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precision: Option<i32>,

    /// Numeric scale.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<i32>,
}

impl ColumnDefinition {
    /// Shorthand for a nullable column with no length/precision metadata.
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: true,
            default: None,
            max_length: None,
            precision: None,
            scale: None,
        }
    }
}

/// Index on a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDefinition {
    /// Index name.
    pub name: String,

    /// Indexed column names.
    pub columns: Vec<String>,

    /// Whether the index is unique.
    #[serde(default)]
    pub unique: bool,
}

/// Schema definition for a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    /// Table name.
    pub name: String,

    /// Column definitions.
    pub columns: Vec<ColumnDefinition>,

    /// Primary key column names.
    #[serde(default)]
    pub primary_keys: Vec<String>,

    /// Secondary indexes.
    #[serde(default)]
    pub indexes: Vec<IndexDefinition>,
}

impl TableSchema {
    /// Look up a column by name.
    pub fn column(&self, name: &str) -> Option<&ColumnDefinition> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Check if the table has a primary key.
    pub fn has_pk(&self) -> bool {
        !self.primary_keys.is_empty()
    }
}

/// Schema definition for a database schema (a namespace of tables).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseSchema {
    /// Schema name.
    pub name: String,

    /// Tables in this schema.
    pub tables: Vec<TableSchema>,
}

impl DatabaseSchema {
    /// Look up a table by name.
    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.iter().find(|t| t.name == name)
    }
}

fn default_true() -> bool {
    true
}
