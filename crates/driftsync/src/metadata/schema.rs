//! DDL for the metadata tables.
//!
//! Five tables under a configurable metadata schema. Creation order matters:
//! error_log and dead_letter_queue carry foreign keys to sync_runs.

/// SQL statements creating the metadata schema and tables, in dependency
/// order. Every statement is idempotent.
pub fn schema_creation_sql(schema: &str) -> Vec<String> {
    vec![
        format!(r#"CREATE SCHEMA IF NOT EXISTS "{}""#, schema),
        format!(
            r#"CREATE TABLE IF NOT EXISTS "{schema}".sync_runs (
                id UUID PRIMARY KEY,
                schema_name VARCHAR(255) NOT NULL,
                sync_mode VARCHAR(50) NOT NULL,
                status VARCHAR(50) NOT NULL,
                started_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                completed_at TIMESTAMPTZ,
                duration_ms BIGINT,
                records_processed BIGINT NOT NULL DEFAULT 0,
                records_inserted BIGINT NOT NULL DEFAULT 0,
                records_updated BIGINT NOT NULL DEFAULT 0,
                records_deleted BIGINT NOT NULL DEFAULT 0,
                records_failed BIGINT NOT NULL DEFAULT 0,
                bytes_processed BIGINT NOT NULL DEFAULT 0,
                config_hash VARCHAR(64),
                error_message TEXT
            )"#,
            schema = schema
        ),
        format!(
            r#"CREATE INDEX IF NOT EXISTS idx_sync_runs_schema_started
                ON "{}".sync_runs (schema_name, started_at DESC)"#,
            schema
        ),
        format!(
            r#"CREATE INDEX IF NOT EXISTS idx_sync_runs_status
                ON "{}".sync_runs (status)"#,
            schema
        ),
        format!(
            r#"CREATE TABLE IF NOT EXISTS "{schema}".sync_markers (
                id UUID PRIMARY KEY,
                schema_name VARCHAR(255) NOT NULL,
                table_name VARCHAR(255),
                marker_type VARCHAR(50) NOT NULL,
                position_data JSONB NOT NULL,
                last_updated TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                sync_run_id UUID
            )"#,
            schema = schema
        ),
        // Unique index with COALESCE so NULL table_name collapses to one row
        format!(
            r#"CREATE UNIQUE INDEX IF NOT EXISTS uk_sync_markers_schema_table_type
                ON "{}".sync_markers (schema_name, COALESCE(table_name, ''), marker_type)"#,
            schema
        ),
        format!(
            r#"CREATE TABLE IF NOT EXISTS "{schema}".schema_registry (
                id UUID PRIMARY KEY,
                schema_name VARCHAR(255) NOT NULL,
                table_name VARCHAR(255) NOT NULL,
                version INTEGER NOT NULL DEFAULT 1,
                schema_definition JSONB NOT NULL,
                schema_hash VARCHAR(64) NOT NULL,
                evolution_type VARCHAR(50),
                previous_version INTEGER,
                compatibility_status VARCHAR(50) NOT NULL DEFAULT 'compatible',
                registered_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                CONSTRAINT uk_schema_registry_schema_table_version
                    UNIQUE (schema_name, table_name, version)
            )"#,
            schema = schema
        ),
        format!(
            r#"CREATE INDEX IF NOT EXISTS idx_schema_registry_hash
                ON "{}".schema_registry (schema_hash)"#,
            schema
        ),
        format!(
            r#"CREATE TABLE IF NOT EXISTS "{schema}".error_log (
                id UUID PRIMARY KEY,
                sync_run_id UUID REFERENCES "{schema}".sync_runs(id) ON DELETE SET NULL,
                schema_name VARCHAR(255) NOT NULL,
                table_name VARCHAR(255),
                error_type VARCHAR(100) NOT NULL,
                error_message TEXT NOT NULL,
                record_data JSONB,
                operation_type VARCHAR(50),
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 3,
                status VARCHAR(50) NOT NULL DEFAULT 'open',
                resolved_at TIMESTAMPTZ,
                occurred_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )"#,
            schema = schema
        ),
        format!(
            r#"CREATE INDEX IF NOT EXISTS idx_error_log_schema_status
                ON "{}".error_log (schema_name, status)"#,
            schema
        ),
        format!(
            r#"CREATE TABLE IF NOT EXISTS "{schema}".dead_letter_queue (
                id UUID PRIMARY KEY,
                sync_run_id UUID REFERENCES "{schema}".sync_runs(id) ON DELETE SET NULL,
                error_log_id UUID REFERENCES "{schema}".error_log(id) ON DELETE SET NULL,
                schema_name VARCHAR(255) NOT NULL,
                table_name VARCHAR(255) NOT NULL,
                source_record_id VARCHAR(255),
                operation_type VARCHAR(50) NOT NULL,
                record_data JSONB NOT NULL,
                error_count INTEGER NOT NULL DEFAULT 1,
                first_error_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                last_error_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                last_error_message TEXT,
                status VARCHAR(50) NOT NULL DEFAULT 'pending',
                processed_at TIMESTAMPTZ
            )"#,
            schema = schema
        ),
        format!(
            r#"CREATE INDEX IF NOT EXISTS idx_dlq_schema_table
                ON "{}".dead_letter_queue (schema_name, table_name, COALESCE(source_record_id, ''))"#,
            schema
        ),
        format!(
            r#"CREATE INDEX IF NOT EXISTS idx_dlq_status
                ON "{}".dead_letter_queue (status)"#,
            schema
        ),
    ]
}

/// SQL statements dropping the metadata schema, for tests and resets.
pub fn schema_cleanup_sql(schema: &str) -> Vec<String> {
    vec![
        format!(r#"DROP TABLE IF EXISTS "{}".dead_letter_queue CASCADE"#, schema),
        format!(r#"DROP TABLE IF EXISTS "{}".error_log CASCADE"#, schema),
        format!(r#"DROP TABLE IF EXISTS "{}".schema_registry CASCADE"#, schema),
        format!(r#"DROP TABLE IF EXISTS "{}".sync_markers CASCADE"#, schema),
        format!(r#"DROP TABLE IF EXISTS "{}".sync_runs CASCADE"#, schema),
        format!(r#"DROP SCHEMA IF EXISTS "{}" CASCADE"#, schema),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_creation_order_respects_foreign_keys() {
        let sql = schema_creation_sql("drift_meta");
        let pos = |needle: &str| {
            sql.iter()
                .position(|s| s.contains(needle))
                .unwrap_or_else(|| panic!("missing statement containing {}", needle))
        };
        assert!(pos("sync_runs (") < pos("error_log ("));
        assert!(pos("error_log (") < pos("dead_letter_queue ("));
        assert_eq!(pos(r#"CREATE SCHEMA IF NOT EXISTS "drift_meta""#), 0);
    }

    #[test]
    fn test_marker_uniqueness_uses_coalesce() {
        let sql = schema_creation_sql("m");
        assert!(sql
            .iter()
            .any(|s| s.contains("COALESCE(table_name, '')") && s.contains("UNIQUE INDEX")));
    }

    #[test]
    fn test_cleanup_is_reverse_of_creation() {
        let sql = schema_cleanup_sql("m");
        assert!(sql[0].contains("dead_letter_queue"));
        assert!(sql.last().unwrap().contains("DROP SCHEMA"));
    }
}
