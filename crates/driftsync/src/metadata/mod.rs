//! Metadata subsystem: durable position markers, schema registry, sync runs,
//! error log and dead letter queue.

pub mod memory;
pub mod models;
pub mod postgres;
pub mod schema;
pub mod store;

pub use memory::MemoryMetadataStore;
pub use models::{
    CleanupReport, DeadLetterEntry, DlqStatus, ErrorLogEntry, ErrorStatus, ErrorType,
    EvolutionType, MarkerType, SchemaDefinition, SchemaRegistryEntry, SyncMarker, SyncMode,
    SyncRun, SyncRunStatistics, SyncStatisticsReport, SyncStatus,
};
pub use postgres::PgMetadataStore;
pub use store::MetadataStore;
