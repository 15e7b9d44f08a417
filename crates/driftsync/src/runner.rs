//! Top-level runner: resolves execution mode, builds connectors and the
//! metadata store, owns every schema processor and evolution engine, and
//! coordinates startup, shutdown and background metadata maintenance.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{Config, DeletionStrategy, ExecutionMode, SchemaConfig};
use crate::connectors::{postgres::build_pg_pool, ConnectorRegistry};
use crate::core::{DestinationConnector, SourceConnector};
use crate::error::{Result, SyncError};
use crate::evolution::{HealthSnapshot, SchemaEvolutionEngine};
use crate::metadata::{MemoryMetadataStore, MetadataStore, PgMetadataStore};
use crate::processor::{ProcessorStatus, SchemaProcessor};

/// Interval between metadata maintenance passes (cleanup + stuck-run
/// recovery).
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(3600);

/// Age threshold after which a `running` sync run counts as stuck.
const STUCK_RUN_AGE_HOURS: i64 = 24;

/// Status snapshot of the whole runner.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RunnerStatus {
    pub running: bool,
    pub mode: crate::config::ExecutionMode,
    pub processors: Vec<ProcessorStatus>,
    pub evolution: Vec<HealthSnapshot>,
}

/// Top-level process coordinating all schema processors.
pub struct Runner {
    config: Config,
    registry: ConnectorRegistry,
    metadata_override: Option<Arc<dyn MetadataStore>>,
    processors: Vec<Arc<SchemaProcessor>>,
    evolution_engines: Vec<Arc<SchemaEvolutionEngine>>,
    background_tasks: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
    running: bool,
}

impl Runner {
    /// Create a runner with the built-in connector registry.
    pub fn new(config: Config) -> Self {
        Self::with_registry(config, ConnectorRegistry::with_builtins())
    }

    /// Create a runner with a caller-supplied registry (tests, embedders).
    pub fn with_registry(config: Config, registry: ConnectorRegistry) -> Self {
        Self {
            config,
            registry,
            metadata_override: None,
            processors: Vec::new(),
            evolution_engines: Vec::new(),
            background_tasks: Vec::new(),
            cancel: CancellationToken::new(),
            running: false,
        }
    }

    /// Use a specific metadata store instead of deriving one from the
    /// destination descriptor.
    pub fn with_metadata_store(mut self, store: Arc<dyn MetadataStore>) -> Self {
        self.metadata_override = Some(store);
        self
    }

    /// Schemas this runner will process, honoring the execution mode.
    fn active_schemas(&self) -> Result<Vec<SchemaConfig>> {
        match self.config.mode {
            ExecutionMode::Single => {
                let name = self.config.single_schema_name.as_deref().ok_or_else(|| {
                    SyncError::Config("single_schema_name is required for single mode".into())
                })?;
                let schema = self
                    .config
                    .schema_config(name)
                    .cloned()
                    .ok_or_else(|| {
                        SyncError::Config(format!("schema config not found: {}", name))
                    })?;
                Ok(vec![schema])
            }
            ExecutionMode::Multi => Ok(self.config.schemas.clone()),
        }
    }

    /// Per-table deletion overrides for the destination, merged across the
    /// active schemas.
    fn deletion_overrides(&self, schemas: &[SchemaConfig]) -> HashMap<String, DeletionStrategy> {
        let mut overrides = HashMap::new();
        for schema in schemas {
            for table in &schema.tables {
                if let Some(strategy) = table.deletion_strategy {
                    overrides.insert(table.name.clone(), strategy);
                }
            }
        }
        overrides
    }

    /// Build the metadata store for the configured destination.
    fn build_metadata_store(&self) -> Result<Arc<dyn MetadataStore>> {
        if let Some(store) = &self.metadata_override {
            return Ok(store.clone());
        }
        match self.config.destination.r#type.as_str() {
            "postgresql" => {
                let pool = build_pg_pool(&self.config.destination)?;
                Ok(Arc::new(PgMetadataStore::new(
                    pool,
                    self.config.destination.metadata_schema.clone(),
                )))
            }
            "memory" => Ok(Arc::new(MemoryMetadataStore::new())),
            other => Err(SyncError::Config(format!(
                "no metadata store for destination type '{}'",
                other
            ))),
        }
    }

    /// Start all processors and background loops.
    pub async fn start(&mut self) -> Result<()> {
        if self.running {
            warn!("Runner already running");
            return Ok(());
        }

        let schemas = self.active_schemas()?;
        info!(
            mode = ?self.config.mode,
            schemas = schemas.len(),
            dry_run = self.config.dry_run,
            "Starting driftsync"
        );

        // Fatal conditions abort startup entirely
        let source: Arc<dyn SourceConnector> =
            self.registry.create_source(&self.config.source).await?;
        let destination: Arc<dyn DestinationConnector> = self
            .registry
            .create_destination(&self.config.destination, self.deletion_overrides(&schemas))
            .await?;
        source.connect().await?;
        destination.connect().await?;

        let metadata = self.build_metadata_store()?;
        metadata.initialize().await?;

        let config_hash = Some(self.config.hash());

        for schema in &schemas {
            let evolution = if self.config.evolution.enabled {
                let engine = Arc::new(SchemaEvolutionEngine::new(
                    self.config.evolution.clone(),
                    source.clone(),
                    destination.clone(),
                    metadata.clone(),
                    vec![schema.name.clone()],
                ));
                let monitor = engine.clone();
                let cancel = self.cancel.child_token();
                self.background_tasks.push(tokio::spawn(async move {
                    monitor.run_monitor(cancel).await;
                }));
                self.evolution_engines.push(engine.clone());
                Some(engine)
            } else {
                None
            };

            let processor = Arc::new(
                SchemaProcessor::new(
                    schema.clone(),
                    source.clone(),
                    destination.clone(),
                    metadata.clone(),
                    evolution,
                    self.config.error_handling.clone(),
                    config_hash.clone(),
                    self.config.dry_run,
                )
                .with_global_filters(
                    self.config.global_table_whitelist.clone(),
                    self.config.global_table_blacklist.clone(),
                ),
            );
            processor.start(self.config.full_resync).await?;
            self.processors.push(processor);
        }

        self.spawn_maintenance_loop(metadata);
        self.running = true;
        info!("driftsync started");
        Ok(())
    }

    /// Periodic metadata maintenance: retention cleanup and stuck-run
    /// recovery.
    fn spawn_maintenance_loop(&mut self, metadata: Arc<dyn MetadataStore>) {
        let cancel = self.cancel.child_token();
        let retention_days = self.config.error_handling.retention_days;
        self.background_tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(MAINTENANCE_INTERVAL) => {}
                }
                if let Err(e) = metadata.cleanup_old_metadata(retention_days).await {
                    error!(error = %e, "Metadata cleanup failed");
                }
                match metadata
                    .recover_failed_runs(chrono::Duration::hours(STUCK_RUN_AGE_HOURS))
                    .await
                {
                    Ok(recovered) if !recovered.is_empty() => {
                        warn!(count = recovered.len(), "Recovered stuck sync runs");
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Stuck run recovery failed"),
                }
            }
        }));
    }

    /// Stop all processors, evolution engines and background loops.
    pub async fn stop(&mut self) {
        if !self.running {
            return;
        }
        info!("Stopping driftsync");
        self.cancel.cancel();

        for processor in &self.processors {
            processor.stop().await;
        }
        self.processors.clear();
        self.evolution_engines.clear();

        for task in self.background_tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        self.running = false;
        info!("driftsync stopped");
    }

    /// Run until the token is cancelled, then shut down.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        self.start().await?;
        cancel.cancelled().await;
        self.stop().await;
        Ok(())
    }

    /// Status of the runner and every processor.
    pub async fn status(&self) -> RunnerStatus {
        let mut processors = Vec::new();
        for processor in &self.processors {
            processors.push(processor.status().await);
        }
        let mut evolution = Vec::new();
        for engine in &self.evolution_engines {
            evolution.push(engine.health_check().await);
        }
        RunnerStatus {
            running: self.running,
            mode: self.config.mode,
            processors,
            evolution,
        }
    }
}
