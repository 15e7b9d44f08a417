//! Concrete connectors and the registry mapping type names to constructors.
//!
//! Connector resolution is an explicit string-keyed registry; no reflection
//! or plugin discovery. The runner asks the factory for connectors by the
//! `type` field of the source/destination configuration.

pub mod memory;
pub mod postgres;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::config::{DeletionStrategy, DestinationConfig, SourceConfig};
use crate::core::{DestinationConnector, SourceConnector};
use crate::error::{Result, SyncError};

pub use memory::{MemoryConnectorHub, MemoryDestination, MemorySource};
pub use postgres::PostgresDestination;

/// Constructor for a source connector type.
#[async_trait]
pub trait SourceConnectorFactory: Send + Sync {
    async fn create(&self, config: &SourceConfig) -> Result<Arc<dyn SourceConnector>>;
}

/// Constructor for a destination connector type.
#[async_trait]
pub trait DestinationConnectorFactory: Send + Sync {
    async fn create(
        &self,
        config: &DestinationConfig,
        deletion_overrides: HashMap<String, DeletionStrategy>,
    ) -> Result<Arc<dyn DestinationConnector>>;
}

/// Registry of connector constructors keyed by type name.
#[derive(Default)]
pub struct ConnectorRegistry {
    sources: HashMap<String, Arc<dyn SourceConnectorFactory>>,
    destinations: HashMap<String, Arc<dyn DestinationConnectorFactory>>,
}

impl ConnectorRegistry {
    /// Registry with the built-in connector types installed.
    pub fn with_builtins() -> Self {
        let mut registry = Self::default();
        registry.register_source("memory", Arc::new(MemorySourceFactory));
        registry.register_destination("memory", Arc::new(MemoryDestinationFactory));
        registry.register_destination("postgresql", Arc::new(PostgresDestinationFactory));
        registry
    }

    pub fn register_source(&mut self, kind: &str, factory: Arc<dyn SourceConnectorFactory>) {
        info!(kind, "Registered source connector");
        self.sources.insert(kind.to_string(), factory);
    }

    pub fn register_destination(
        &mut self,
        kind: &str,
        factory: Arc<dyn DestinationConnectorFactory>,
    ) {
        info!(kind, "Registered destination connector");
        self.destinations.insert(kind.to_string(), factory);
    }

    /// Register a pre-built source instance under a type name. Used by
    /// tests and embedders that construct connectors themselves.
    pub fn register_source_instance(&mut self, kind: &str, instance: Arc<dyn SourceConnector>) {
        self.register_source(kind, Arc::new(StaticSourceFactory(instance)));
    }

    /// Register a pre-built destination instance under a type name.
    pub fn register_destination_instance(
        &mut self,
        kind: &str,
        instance: Arc<dyn DestinationConnector>,
    ) {
        self.register_destination(kind, Arc::new(StaticDestinationFactory(instance)));
    }

    pub fn source_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.sources.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn destination_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.destinations.keys().cloned().collect();
        types.sort();
        types
    }

    /// Create a source connector for the configured type.
    pub async fn create_source(&self, config: &SourceConfig) -> Result<Arc<dyn SourceConnector>> {
        let factory = self.sources.get(&config.r#type).ok_or_else(|| {
            SyncError::UnsupportedConnector {
                kind: config.r#type.clone(),
                available: self.source_types().join(", "),
            }
        })?;
        let connector = factory.create(config).await?;
        info!(kind = %config.r#type, "Created source connector");
        Ok(connector)
    }

    /// Create a destination connector for the configured type.
    pub async fn create_destination(
        &self,
        config: &DestinationConfig,
        deletion_overrides: HashMap<String, DeletionStrategy>,
    ) -> Result<Arc<dyn DestinationConnector>> {
        let factory = self.destinations.get(&config.r#type).ok_or_else(|| {
            SyncError::UnsupportedConnector {
                kind: config.r#type.clone(),
                available: self.destination_types().join(", "),
            }
        })?;
        let connector = factory.create(config, deletion_overrides).await?;
        info!(
            kind = %config.r#type,
            metadata_schema = %config.metadata_schema,
            "Created destination connector"
        );
        Ok(connector)
    }
}

struct MemorySourceFactory;

#[async_trait]
impl SourceConnectorFactory for MemorySourceFactory {
    async fn create(&self, _config: &SourceConfig) -> Result<Arc<dyn SourceConnector>> {
        Ok(Arc::new(MemorySource::new()))
    }
}

struct MemoryDestinationFactory;

#[async_trait]
impl DestinationConnectorFactory for MemoryDestinationFactory {
    async fn create(
        &self,
        config: &DestinationConfig,
        deletion_overrides: HashMap<String, DeletionStrategy>,
    ) -> Result<Arc<dyn DestinationConnector>> {
        Ok(Arc::new(
            MemoryDestination::new()
                .with_deletion_strategy(config.deletion_strategy)
                .with_table_deletion_strategies(deletion_overrides),
        ))
    }
}

struct PostgresDestinationFactory;

#[async_trait]
impl DestinationConnectorFactory for PostgresDestinationFactory {
    async fn create(
        &self,
        config: &DestinationConfig,
        deletion_overrides: HashMap<String, DeletionStrategy>,
    ) -> Result<Arc<dyn DestinationConnector>> {
        postgres::build(config, deletion_overrides)
    }
}

struct StaticSourceFactory(Arc<dyn SourceConnector>);

#[async_trait]
impl SourceConnectorFactory for StaticSourceFactory {
    async fn create(&self, _config: &SourceConfig) -> Result<Arc<dyn SourceConnector>> {
        Ok(self.0.clone())
    }
}

struct StaticDestinationFactory(Arc<dyn DestinationConnector>);

#[async_trait]
impl DestinationConnectorFactory for StaticDestinationFactory {
    async fn create(
        &self,
        _config: &DestinationConfig,
        _deletion_overrides: HashMap<String, DeletionStrategy>,
    ) -> Result<Arc<dyn DestinationConnector>> {
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source_config(kind: &str) -> SourceConfig {
        SourceConfig {
            r#type: kind.to_string(),
            connection_string: "memory://".to_string(),
            database: None,
            change_detection_column: "updated_at".to_string(),
        }
    }

    #[tokio::test]
    async fn test_builtin_lookup() {
        let registry = ConnectorRegistry::with_builtins();
        assert_eq!(registry.source_types(), vec!["memory"]);
        assert_eq!(registry.destination_types(), vec!["memory", "postgresql"]);

        let source = registry.create_source(&source_config("memory")).await;
        assert!(source.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_type_lists_available() {
        let registry = ConnectorRegistry::with_builtins();
        let err = registry
            .create_source(&source_config("mongodb"))
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("mongodb"));
        assert!(message.contains("memory"));
    }

    #[tokio::test]
    async fn test_static_instance_registration() {
        let mut registry = ConnectorRegistry::with_builtins();
        let hub = MemoryConnectorHub::new();
        hub.source
            .set_schema(crate::core::DatabaseSchema {
                name: "app".to_string(),
                tables: vec![],
            })
            .await;
        registry.register_source_instance("fixture", hub.source.clone());

        // The factory returns the shared instance, so state set on the hub
        // is visible through the created connector
        let created = registry
            .create_source(&source_config("fixture"))
            .await
            .unwrap();
        assert!(created.get_schema("app").await.is_ok());
    }
}
