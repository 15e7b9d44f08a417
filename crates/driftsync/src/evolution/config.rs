//! Configuration for the schema evolution engine.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::types::EvolutionStrategy;

/// Evolution policy and detection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvolutionConfig {
    /// Enable schema evolution monitoring.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Strategy applied to detected changes.
    #[serde(default)]
    pub strategy: EvolutionStrategy,

    /// How often to check for schema changes, in seconds.
    #[serde(default = "default_detection_interval")]
    pub detection_interval_seconds: u64,

    /// Detect new columns.
    #[serde(default = "default_true")]
    pub detect_column_additions: bool,

    /// Detect removed columns.
    #[serde(default = "default_true")]
    pub detect_column_removals: bool,

    /// Detect column type changes.
    #[serde(default = "default_true")]
    pub detect_type_changes: bool,

    /// Require manual approval for risky changes.
    #[serde(default = "default_true")]
    pub require_approval_for_risky_changes: bool,

    /// Maximum acceptable data loss percentage for automatic risky changes.
    #[serde(default = "default_max_data_loss")]
    pub max_data_loss_percentage: f64,

    /// Roll back automatically when a migration step fails.
    #[serde(default = "default_true")]
    pub enable_rollback: bool,

    /// Maximum concurrent schema migrations.
    #[serde(default = "default_one")]
    pub max_concurrent_migrations: usize,

    /// Tables excluded from evolution.
    #[serde(default)]
    pub excluded_tables: Vec<String>,

    /// Columns excluded from evolution, keyed by table.
    #[serde(default)]
    pub excluded_columns: HashMap<String, Vec<String>>,

    /// Per-table overrides.
    #[serde(default)]
    pub table_configs: HashMap<String, TableEvolutionConfig>,
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            strategy: EvolutionStrategy::default(),
            detection_interval_seconds: default_detection_interval(),
            detect_column_additions: true,
            detect_column_removals: true,
            detect_type_changes: true,
            require_approval_for_risky_changes: true,
            max_data_loss_percentage: default_max_data_loss(),
            enable_rollback: true,
            max_concurrent_migrations: 1,
            excluded_tables: Vec::new(),
            excluded_columns: HashMap::new(),
            table_configs: HashMap::new(),
        }
    }
}

impl EvolutionConfig {
    /// Whether a column of a table is excluded from evolution.
    pub fn is_column_excluded(&self, table: &str, column: &str) -> bool {
        if let Some(columns) = self.excluded_columns.get(table) {
            if columns.iter().any(|c| c == column) {
                return true;
            }
        }
        self.table_configs
            .get(table)
            .map(|t| t.excluded_columns.iter().any(|c| c == column))
            .unwrap_or(false)
    }

    /// Whether a table participates in evolution at all.
    pub fn is_table_enabled(&self, table: &str) -> bool {
        if self.excluded_tables.iter().any(|t| t == table) {
            return false;
        }
        self.table_configs
            .get(table)
            .and_then(|t| t.enabled)
            .unwrap_or(true)
    }
}

/// Per-table schema evolution overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableEvolutionConfig {
    /// Override the global enabled flag for this table.
    #[serde(default)]
    pub enabled: Option<bool>,

    /// Allow new columns for this table.
    #[serde(default = "default_true")]
    pub allow_column_additions: bool,

    /// Allow column removal for this table.
    #[serde(default)]
    pub allow_column_removals: bool,

    /// Allow type changes for this table.
    #[serde(default = "default_true")]
    pub allow_type_changes: bool,

    /// Columns excluded from evolution for this table.
    #[serde(default)]
    pub excluded_columns: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn default_one() -> usize {
    1
}

fn default_detection_interval() -> u64 {
    30
}

fn default_max_data_loss() -> f64 {
    0.01
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EvolutionConfig::default();
        assert!(config.enabled);
        assert_eq!(config.strategy, EvolutionStrategy::Conservative);
        assert_eq!(config.detection_interval_seconds, 30);
        assert!(config.detect_column_additions);
        assert!(config.enable_rollback);
        assert_eq!(config.max_concurrent_migrations, 1);
    }

    #[test]
    fn test_exclusions() {
        let mut config = EvolutionConfig::default();
        config.excluded_tables.push("audit_log".to_string());
        config
            .excluded_columns
            .insert("orders".to_string(), vec!["internal_notes".to_string()]);

        assert!(!config.is_table_enabled("audit_log"));
        assert!(config.is_table_enabled("orders"));
        assert!(config.is_column_excluded("orders", "internal_notes"));
        assert!(!config.is_column_excluded("orders", "status"));
    }

    #[test]
    fn test_per_table_override_disables() {
        let mut config = EvolutionConfig::default();
        config.table_configs.insert(
            "frozen".to_string(),
            TableEvolutionConfig {
                enabled: Some(false),
                ..Default::default()
            },
        );
        assert!(!config.is_table_enabled("frozen"));
    }

    #[test]
    fn test_yaml_parse() {
        let yaml = r#"
strategy: strict
detection_interval_seconds: 60
excluded_tables: [staging_tmp]
table_configs:
  orders:
    allow_column_removals: true
"#;
        let config: EvolutionConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.strategy, EvolutionStrategy::Strict);
        assert_eq!(config.detection_interval_seconds, 60);
        assert!(!config.is_table_enabled("staging_tmp"));
        assert!(config.table_configs["orders"].allow_column_removals);
    }
}
