//! Core model: schema types, change records and the connector contract.

pub mod record;
pub mod schema;
pub mod traits;

pub use record::{
    ChangeEvent, ChangeStream, OperationType, Record, SchemaChange, SchemaChangeKind,
    SnapshotStream,
};
pub use schema::{ColumnDefinition, ColumnType, DatabaseSchema, IndexDefinition, TableSchema};
pub use traits::{DestinationConnector, SourceConnector};
