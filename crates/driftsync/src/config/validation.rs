//! Configuration validation.

use super::{Config, ExecutionMode};
use crate::error::{Result, SyncError};

/// Validate the configuration. Fatal problems abort startup entirely.
pub fn validate(config: &Config) -> Result<()> {
    if config.source.r#type.is_empty() {
        return Err(SyncError::Config("source.type is required".into()));
    }
    if config.source.connection_string.is_empty() {
        return Err(SyncError::Config(
            "source.connection_string is required".into(),
        ));
    }
    if config.destination.r#type.is_empty() {
        return Err(SyncError::Config("destination.type is required".into()));
    }
    if config.destination.connection_string.is_empty() {
        return Err(SyncError::Config(
            "destination.connection_string is required".into(),
        ));
    }
    if config.destination.metadata_schema.is_empty() {
        return Err(SyncError::Config(
            "destination.metadata_schema is required".into(),
        ));
    }
    if config.destination.max_connections == 0 {
        return Err(SyncError::Config(
            "destination.max_connections must be at least 1".into(),
        ));
    }
    if config.destination.min_connections > config.destination.max_connections {
        return Err(SyncError::Config(
            "destination.min_connections cannot exceed max_connections".into(),
        ));
    }

    if config.schemas.is_empty() {
        return Err(SyncError::Config(
            "at least one schema must be configured".into(),
        ));
    }

    if config.mode == ExecutionMode::Single {
        let name = config.single_schema_name.as_deref().ok_or_else(|| {
            SyncError::Config("single_schema_name is required when mode is 'single'".into())
        })?;
        if config.schema_config(name).is_none() {
            return Err(SyncError::Config(format!(
                "single_schema_name '{}' has no schema configuration",
                name
            )));
        }
    }

    for schema in &config.schemas {
        if schema.name.is_empty() {
            return Err(SyncError::Config("schema name cannot be empty".into()));
        }
        if schema.default_batch_size == 0 {
            return Err(SyncError::Config(format!(
                "schema '{}': default_batch_size must be at least 1",
                schema.name
            )));
        }
        for table in &schema.tables {
            if table.stream_batch_size == 0 || table.write_batch_size == 0 {
                return Err(SyncError::Config(format!(
                    "table '{}.{}': batch sizes must be at least 1",
                    schema.name, table.name
                )));
            }
        }
    }

    if config.error_handling.backoff_factor < 1.0 {
        return Err(SyncError::Config(
            "error_handling.backoff_factor must be at least 1.0".into(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        DestinationConfig, ErrorHandlingConfig, SchemaConfig, SourceConfig, SyncModeSetting,
    };

    fn valid_config() -> Config {
        Config {
            mode: ExecutionMode::Single,
            source: SourceConfig {
                r#type: "memory".to_string(),
                connection_string: "memory://".to_string(),
                database: None,
                change_detection_column: "updated_at".to_string(),
            },
            destination: DestinationConfig {
                r#type: "postgresql".to_string(),
                connection_string: "host=localhost dbname=warehouse".to_string(),
                database: None,
                metadata_schema: "driftsync_metadata".to_string(),
                min_connections: 2,
                max_connections: 10,
                connection_timeout_seconds: 30,
                command_timeout_seconds: 60,
                deletion_strategy: Default::default(),
                soft_delete_flag_column: "is_deleted".to_string(),
                soft_delete_timestamp_column: "deleted_at".to_string(),
            },
            schemas: vec![SchemaConfig {
                name: "app".to_string(),
                mode: SyncModeSetting::Stream,
                default_batch_size: 1000,
                default_polling_interval_seconds: 5,
                table_whitelist: None,
                table_blacklist: None,
                tables: vec![],
            }],
            single_schema_name: Some("app".to_string()),
            global_table_whitelist: None,
            global_table_blacklist: None,
            error_handling: ErrorHandlingConfig::default(),
            evolution: Default::default(),
            dry_run: false,
            full_resync: false,
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(validate(&valid_config()).is_ok());
    }

    #[test]
    fn test_missing_connection_string() {
        let mut config = valid_config();
        config.source.connection_string.clear();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_single_mode_requires_schema_name() {
        let mut config = valid_config();
        config.single_schema_name = None;
        assert!(validate(&config).is_err());

        let mut config = valid_config();
        config.single_schema_name = Some("missing".to_string());
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_multi_mode_without_single_name_is_fine() {
        let mut config = valid_config();
        config.mode = ExecutionMode::Multi;
        config.single_schema_name = None;
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_no_schemas_rejected() {
        let mut config = valid_config();
        config.schemas.clear();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_pool_bounds() {
        let mut config = valid_config();
        config.destination.min_connections = 20;
        assert!(validate(&config).is_err());

        let mut config = valid_config();
        config.destination.max_connections = 0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_backoff_factor_bound() {
        let mut config = valid_config();
        config.error_handling.backoff_factor = 0.5;
        assert!(validate(&config).is_err());
    }
}
