//! # driftsync
//!
//! Change-data-capture replication engine: continuously (stream mode) or
//! periodically (batch mode) replicates table-level changes from a source
//! database into a destination warehouse, evolving the destination schema
//! safely as the source drifts.
//!
//! The engine runs unattended, resumes exactly where it left off after a
//! restart (durable position markers, persisted strictly after each
//! successful write), tolerates poison records via a dead letter queue, and
//! classifies every type change by how likely it is to lose data before
//! migrating anything.
//!
//! ## Example
//!
//! ```rust,no_run
//! use driftsync::{Config, Runner};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load("config.yaml")?;
//!     let cancel = CancellationToken::new();
//!     Runner::new(config).run(cancel).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connectors;
pub mod core;
pub mod error;
pub mod evolution;
pub mod metadata;
pub mod processor;
pub mod retry;
pub mod runner;

// Re-exports for convenient access
pub use config::{Config, DeletionStrategy, ExecutionMode, SchemaConfig, TableConfig};
pub use core::{
    ChangeEvent, DatabaseSchema, DestinationConnector, OperationType, Record, SourceConnector,
    TableSchema,
};
pub use error::{Result, SyncError};
pub use evolution::{SchemaEvolutionEngine, TypeConversionEngine};
pub use metadata::{MemoryMetadataStore, MetadataStore, PgMetadataStore};
pub use processor::SchemaProcessor;
pub use runner::{Runner, RunnerStatus};
