//! Types and enums for the schema evolution engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Strategy controlling how much the engine may change on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvolutionStrategy {
    /// Manual intervention for any non-safe change.
    Strict,
    /// Safe changes automatic; dangerous changes blocked.
    #[default]
    Conservative,
    /// Most changes automatic, warn on risky.
    Permissive,
    /// Everything automatic with fallbacks.
    Aggressive,
}

impl EvolutionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvolutionStrategy::Strict => "strict",
            EvolutionStrategy::Conservative => "conservative",
            EvolutionStrategy::Permissive => "permissive",
            EvolutionStrategy::Aggressive => "aggressive",
        }
    }
}

/// How likely a conversion or structural change is to lose or corrupt data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyLevel {
    /// No data loss, always allowed.
    #[default]
    Safe,
    /// Potential data loss, requires validation.
    Risky,
    /// High risk of data loss, requires approval.
    Dangerous,
    /// Cannot convert, blocked.
    Incompatible,
}

impl SafetyLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SafetyLevel::Safe => "safe",
            SafetyLevel::Risky => "risky",
            SafetyLevel::Dangerous => "dangerous",
            SafetyLevel::Incompatible => "incompatible",
        }
    }
}

/// Structural differences the detector can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    AddTable,
    DropTable,
    AddColumn,
    DropColumn,
    ModifyColumnType,
    ModifyColumnConstraint,
    RenameColumn,
    AddIndex,
    DropIndex,
    AddConstraint,
    DropConstraint,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::AddTable => "add_table",
            ChangeKind::DropTable => "drop_table",
            ChangeKind::AddColumn => "add_column",
            ChangeKind::DropColumn => "drop_column",
            ChangeKind::ModifyColumnType => "modify_column_type",
            ChangeKind::ModifyColumnConstraint => "modify_column_constraint",
            ChangeKind::RenameColumn => "rename_column",
            ChangeKind::AddIndex => "add_index",
            ChangeKind::DropIndex => "drop_index",
            ChangeKind::AddConstraint => "add_constraint",
            ChangeKind::DropConstraint => "drop_constraint",
        }
    }

    /// Execution priority within one migration batch: additive changes run
    /// before destructive ones.
    pub fn priority(&self) -> u8 {
        match self {
            ChangeKind::AddTable => 0,
            ChangeKind::AddColumn => 1,
            ChangeKind::AddIndex | ChangeKind::AddConstraint => 2,
            ChangeKind::ModifyColumnType | ChangeKind::ModifyColumnConstraint => 3,
            ChangeKind::RenameColumn => 4,
            ChangeKind::DropIndex | ChangeKind::DropConstraint => 5,
            ChangeKind::DropColumn => 6,
            ChangeKind::DropTable => 7,
        }
    }
}

/// One detected structural difference between two schema snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaEvolutionEvent {
    pub change_type: ChangeKind,
    pub schema_name: String,
    pub table_name: String,
    pub column_name: Option<String>,
    /// Previous definition (table or column), where applicable.
    pub old_definition: Option<Value>,
    /// New definition (table or column), where applicable.
    pub new_definition: Option<Value>,
    pub safety_level: SafetyLevel,
    pub requires_approval: bool,
    /// Human-readable impact summary for logs and approval queues.
    pub estimated_impact: String,
}

impl SchemaEvolutionEvent {
    pub fn new(
        change_type: ChangeKind,
        schema_name: impl Into<String>,
        table_name: impl Into<String>,
    ) -> Self {
        Self {
            change_type,
            schema_name: schema_name.into(),
            table_name: table_name.into(),
            column_name: None,
            old_definition: None,
            new_definition: None,
            safety_level: SafetyLevel::Safe,
            requires_approval: false,
            estimated_impact: String::new(),
        }
    }
}

/// Result of one evolution/migration pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvolutionResult {
    pub success: bool,
    pub events: Vec<SchemaEvolutionEvent>,
    /// SQL statements executed (or planned, in dry-run mode).
    pub applied_changes: Vec<String>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub rollback_commands: Vec<String>,
    pub processing_time: std::time::Duration,
}

impl EvolutionResult {
    pub fn succeeded(events: Vec<SchemaEvolutionEvent>) -> Self {
        Self {
            success: true,
            events,
            ..Default::default()
        }
    }
}

/// Cumulative metrics for evolution operations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvolutionMetrics {
    pub total_changes_detected: u64,
    pub changes_applied_successfully: u64,
    pub changes_failed: u64,
    pub changes_requiring_approval: u64,
    pub rollbacks_performed: u64,
    pub last_check: Option<DateTime<Utc>>,

    // By change type
    pub table_additions: u64,
    pub table_removals: u64,
    pub column_additions: u64,
    pub column_removals: u64,
    pub type_changes: u64,

    // By safety level
    pub safe_changes: u64,
    pub risky_changes: u64,
    pub dangerous_changes: u64,
}

impl EvolutionMetrics {
    /// Fold one result into the cumulative counters.
    pub fn record(&mut self, result: &EvolutionResult) {
        self.total_changes_detected += result.events.len() as u64;
        if result.success {
            self.changes_applied_successfully += result.applied_changes.len() as u64;
        } else {
            self.changes_failed += result.events.len() as u64;
        }
        if !result.rollback_commands.is_empty() && !result.success {
            self.rollbacks_performed += 1;
        }

        for event in &result.events {
            match event.change_type {
                ChangeKind::AddTable => self.table_additions += 1,
                ChangeKind::DropTable => self.table_removals += 1,
                ChangeKind::AddColumn => self.column_additions += 1,
                ChangeKind::DropColumn => self.column_removals += 1,
                ChangeKind::ModifyColumnType => self.type_changes += 1,
                _ => {}
            }
            if event.requires_approval {
                self.changes_requiring_approval += 1;
            }
            match event.safety_level {
                SafetyLevel::Safe => self.safe_changes += 1,
                SafetyLevel::Risky => self.risky_changes += 1,
                SafetyLevel::Dangerous => self.dangerous_changes += 1,
                SafetyLevel::Incompatible => {}
            }
        }
    }
}

/// Health snapshot of the evolution engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub running: bool,
    pub enabled: bool,
    pub strategy: EvolutionStrategy,
    pub schemas_monitored: usize,
    pub last_check: Option<DateTime<Utc>>,
    pub metrics: EvolutionMetrics,
    /// Per-schema detector cache stats: (cached tables, total columns).
    pub detector_stats: std::collections::HashMap<String, (usize, usize)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_orders_additive_before_destructive() {
        assert!(ChangeKind::AddTable.priority() < ChangeKind::AddColumn.priority());
        assert!(ChangeKind::AddColumn.priority() < ChangeKind::ModifyColumnType.priority());
        assert!(ChangeKind::ModifyColumnType.priority() < ChangeKind::RenameColumn.priority());
        assert!(ChangeKind::RenameColumn.priority() < ChangeKind::DropColumn.priority());
        assert!(ChangeKind::DropColumn.priority() < ChangeKind::DropTable.priority());
    }

    #[test]
    fn test_metrics_fold() {
        let mut metrics = EvolutionMetrics::default();
        let mut event = SchemaEvolutionEvent::new(ChangeKind::AddColumn, "app", "orders");
        event.safety_level = SafetyLevel::Safe;

        let mut dangerous = SchemaEvolutionEvent::new(ChangeKind::DropTable, "app", "legacy");
        dangerous.safety_level = SafetyLevel::Dangerous;
        dangerous.requires_approval = true;

        let result = EvolutionResult {
            success: true,
            events: vec![event, dangerous],
            applied_changes: vec!["ALTER".to_string()],
            ..Default::default()
        };
        metrics.record(&result);

        assert_eq!(metrics.total_changes_detected, 2);
        assert_eq!(metrics.column_additions, 1);
        assert_eq!(metrics.table_removals, 1);
        assert_eq!(metrics.safe_changes, 1);
        assert_eq!(metrics.dangerous_changes, 1);
        assert_eq!(metrics.changes_requiring_approval, 1);
        assert_eq!(metrics.changes_applied_successfully, 1);
    }

    #[test]
    fn test_safety_level_ordering() {
        assert!(SafetyLevel::Safe < SafetyLevel::Risky);
        assert!(SafetyLevel::Risky < SafetyLevel::Dangerous);
        assert!(SafetyLevel::Dangerous < SafetyLevel::Incompatible);
    }
}
