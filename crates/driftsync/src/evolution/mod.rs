//! Schema evolution: drift detection, safety classification and transactional
//! migration with rollback.

pub mod config;
pub mod convert;
pub mod detector;
pub mod engine;
pub mod migrator;
pub mod types;

pub use config::{EvolutionConfig, TableEvolutionConfig};
pub use convert::{ConversionRule, TypeConversionEngine};
pub use detector::SchemaChangeDetector;
pub use engine::SchemaEvolutionEngine;
pub use migrator::SchemaMigrationEngine;
pub use types::{
    ChangeKind, EvolutionMetrics, EvolutionResult, EvolutionStrategy, HealthSnapshot, SafetyLevel,
    SchemaEvolutionEvent,
};
