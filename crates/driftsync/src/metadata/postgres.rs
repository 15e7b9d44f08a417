//! PostgreSQL-backed metadata store.
//!
//! Stores all resumable state in tables under a dedicated metadata schema in
//! the destination warehouse. Preferred over in-memory state for production:
//! transactional safety, multi-instance coordination, built-in audit trail.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use deadpool_postgres::Pool;
use serde_json::Value;
use tokio_postgres::types::Json;
use tokio_postgres::Row;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::models::{
    validate_position_data, CleanupReport, DeadLetterEntry, ErrorLogEntry, EvolutionType,
    MarkerType, SchemaDefinition, SchemaRegistryEntry, SyncMarker, SyncMode, SyncRun,
    SyncRunStatistics, SyncStatisticsReport, SyncStatus,
};
use super::schema::{schema_cleanup_sql, schema_creation_sql};
use super::store::MetadataStore;
use crate::error::{Result, SyncError};

/// PostgreSQL metadata store.
pub struct PgMetadataStore {
    pool: Pool,
    schema: String,
}

impl PgMetadataStore {
    /// Create a store over an existing pool, using the given metadata schema.
    pub fn new(pool: Pool, metadata_schema: impl Into<String>) -> Self {
        Self {
            pool,
            schema: metadata_schema.into(),
        }
    }

    /// Drop all metadata tables. For tests and resets only.
    pub async fn cleanup_metadata_schema(&self) -> Result<()> {
        warn!(schema = %self.schema, "Dropping metadata schema");
        let conn = self.get_conn().await?;
        for sql in schema_cleanup_sql(&self.schema) {
            conn.execute(sql.as_str(), &[]).await?;
        }
        Ok(())
    }

    async fn get_conn(&self) -> Result<deadpool_postgres::Object> {
        self.pool
            .get()
            .await
            .map_err(|e| SyncError::pool(e, "acquiring metadata connection"))
    }

    fn registry_entry_from_row(&self, row: &Row) -> Result<SchemaRegistryEntry> {
        let definition: Json<SchemaDefinition> = row.get("schema_definition");
        let evolution_type: Option<String> = row.get("evolution_type");
        Ok(SchemaRegistryEntry {
            id: row.get("id"),
            schema_name: row.get("schema_name"),
            table_name: row.get("table_name"),
            version: row.get("version"),
            schema_definition: definition.0,
            schema_hash: row.get("schema_hash"),
            evolution_type: evolution_type
                .as_deref()
                .map(EvolutionType::parse)
                .transpose()?,
            previous_version: row.get("previous_version"),
            compatibility_status: row.get("compatibility_status"),
            registered_at: row.get("registered_at"),
        })
    }

    fn marker_from_row(&self, row: &Row) -> Result<SyncMarker> {
        let position: Json<Value> = row.get("position_data");
        let marker_type: String = row.get("marker_type");
        Ok(SyncMarker {
            id: row.get("id"),
            schema_name: row.get("schema_name"),
            table_name: row.get("table_name"),
            marker_type: MarkerType::parse(&marker_type)?,
            position_data: position.0,
            last_updated: row.get("last_updated"),
            sync_run_id: row.get("sync_run_id"),
        })
    }
}

#[async_trait]
impl MetadataStore for PgMetadataStore {
    async fn initialize(&self) -> Result<()> {
        info!(schema = %self.schema, "Initializing metadata tables");
        let conn = self.get_conn().await?;
        for sql in schema_creation_sql(&self.schema) {
            conn.execute(sql.as_str(), &[]).await?;
        }
        debug!("Metadata tables created or verified");
        Ok(())
    }

    async fn get_sync_marker(
        &self,
        schema_name: &str,
        table_name: Option<&str>,
        marker_type: MarkerType,
    ) -> Result<Option<SyncMarker>> {
        let conn = self.get_conn().await?;
        let row = conn
            .query_opt(
                &format!(
                    "SELECT id, schema_name, table_name, marker_type, position_data,
                            last_updated, sync_run_id
                     FROM \"{}\".sync_markers
                     WHERE schema_name = $1
                       AND COALESCE(table_name, '') = COALESCE($2, '')
                       AND marker_type = $3",
                    self.schema
                ),
                &[&schema_name, &table_name, &marker_type.as_str()],
            )
            .await?;

        row.map(|r| self.marker_from_row(&r)).transpose()
    }

    async fn update_sync_marker(
        &self,
        schema_name: &str,
        table_name: Option<&str>,
        marker_type: MarkerType,
        position_data: Value,
        sync_run_id: Option<Uuid>,
    ) -> Result<SyncMarker> {
        validate_position_data(&position_data)?;
        let now = Utc::now();
        let id = Uuid::new_v4();

        let conn = self.get_conn().await?;
        let row = conn
            .query_one(
                &format!(
                    "INSERT INTO \"{}\".sync_markers
                         (id, schema_name, table_name, marker_type, position_data,
                          last_updated, sync_run_id)
                     VALUES ($1, $2, $3, $4, $5, $6, $7)
                     ON CONFLICT (schema_name, COALESCE(table_name, ''), marker_type)
                     DO UPDATE SET
                         position_data = EXCLUDED.position_data,
                         last_updated = EXCLUDED.last_updated,
                         sync_run_id = EXCLUDED.sync_run_id
                     RETURNING id",
                    self.schema
                ),
                &[
                    &id,
                    &schema_name,
                    &table_name,
                    &marker_type.as_str(),
                    &Json(&position_data),
                    &now,
                    &sync_run_id,
                ],
            )
            .await?;

        Ok(SyncMarker {
            id: row.get(0),
            schema_name: schema_name.to_string(),
            table_name: table_name.map(String::from),
            marker_type,
            position_data,
            last_updated: now,
            sync_run_id,
        })
    }

    async fn register_schema(
        &self,
        schema_name: &str,
        table_name: &str,
        definition: SchemaDefinition,
        evolution_type: Option<EvolutionType>,
    ) -> Result<SchemaRegistryEntry> {
        let schema_hash = definition.schema_hash();
        let mut conn = self.get_conn().await?;
        let tx = conn.transaction().await?;

        let latest = tx
            .query_opt(
                &format!(
                    "SELECT id, schema_name, table_name, version, schema_definition,
                            schema_hash, evolution_type, previous_version,
                            compatibility_status, registered_at
                     FROM \"{}\".schema_registry
                     WHERE schema_name = $1 AND table_name = $2
                     ORDER BY version DESC
                     LIMIT 1
                     FOR UPDATE",
                    self.schema
                ),
                &[&schema_name, &table_name],
            )
            .await?;

        let (current_version, previous_entry) = match latest {
            Some(row) => {
                let entry = self.registry_entry_from_row(&row)?;
                if entry.schema_hash == schema_hash {
                    // Unchanged since the latest version: nothing to append
                    debug!(
                        schema = schema_name,
                        table = table_name,
                        version = entry.version,
                        "Schema unchanged, skipping registration"
                    );
                    tx.commit().await?;
                    return Ok(entry);
                }
                (entry.version, Some(entry))
            }
            None => (0, None),
        };

        let new_version = current_version + 1;
        let id = Uuid::new_v4();
        let registered_at = Utc::now();
        tx.execute(
            &format!(
                "INSERT INTO \"{}\".schema_registry
                     (id, schema_name, table_name, version, schema_definition,
                      schema_hash, evolution_type, previous_version,
                      compatibility_status, registered_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
                self.schema
            ),
            &[
                &id,
                &schema_name,
                &table_name,
                &new_version,
                &Json(&definition),
                &schema_hash,
                &evolution_type.map(|e| e.as_str()),
                &previous_entry.as_ref().map(|e| e.version),
                &"compatible",
                &registered_at,
            ],
        )
        .await?;
        tx.commit().await?;

        info!(
            schema = schema_name,
            table = table_name,
            version = new_version,
            evolution = ?evolution_type,
            "Schema version registered"
        );

        Ok(SchemaRegistryEntry {
            id,
            schema_name: schema_name.to_string(),
            table_name: table_name.to_string(),
            version: new_version,
            schema_definition: definition,
            schema_hash,
            evolution_type,
            previous_version: previous_entry.map(|e| e.version),
            compatibility_status: "compatible".to_string(),
            registered_at,
        })
    }

    async fn get_schema_version(
        &self,
        schema_name: &str,
        table_name: &str,
        version: Option<i32>,
    ) -> Result<Option<SchemaRegistryEntry>> {
        let conn = self.get_conn().await?;
        let row = match version {
            Some(v) => {
                conn.query_opt(
                    &format!(
                        "SELECT id, schema_name, table_name, version, schema_definition,
                                schema_hash, evolution_type, previous_version,
                                compatibility_status, registered_at
                         FROM \"{}\".schema_registry
                         WHERE schema_name = $1 AND table_name = $2 AND version = $3",
                        self.schema
                    ),
                    &[&schema_name, &table_name, &v],
                )
                .await?
            }
            None => {
                conn.query_opt(
                    &format!(
                        "SELECT id, schema_name, table_name, version, schema_definition,
                                schema_hash, evolution_type, previous_version,
                                compatibility_status, registered_at
                         FROM \"{}\".schema_registry
                         WHERE schema_name = $1 AND table_name = $2
                         ORDER BY version DESC
                         LIMIT 1",
                        self.schema
                    ),
                    &[&schema_name, &table_name],
                )
                .await?
            }
        };

        row.map(|r| self.registry_entry_from_row(&r)).transpose()
    }

    async fn start_sync_run(
        &self,
        schema_name: &str,
        sync_mode: SyncMode,
        config_hash: Option<String>,
    ) -> Result<SyncRun> {
        let mut run = SyncRun::new(schema_name, sync_mode);
        run.config_hash = config_hash;

        let conn = self.get_conn().await?;
        conn.execute(
            &format!(
                "INSERT INTO \"{}\".sync_runs
                     (id, schema_name, sync_mode, status, started_at, config_hash)
                 VALUES ($1, $2, $3, $4, $5, $6)",
                self.schema
            ),
            &[
                &run.id,
                &run.schema_name,
                &run.sync_mode.as_str(),
                &run.status.as_str(),
                &run.started_at,
                &run.config_hash,
            ],
        )
        .await?;

        info!(
            sync_run_id = %run.id,
            schema = schema_name,
            mode = sync_mode.as_str(),
            "Sync run started"
        );
        Ok(run)
    }

    async fn complete_sync_run(
        &self,
        sync_run_id: Uuid,
        status: SyncStatus,
        statistics: SyncRunStatistics,
        error_message: Option<String>,
    ) -> Result<bool> {
        let completed_at = Utc::now();
        let conn = self.get_conn().await?;

        // Guard on status = 'running' so only the first completion wins
        let updated = conn
            .execute(
                &format!(
                    "UPDATE \"{}\".sync_runs
                     SET status = $2,
                         completed_at = $3,
                         duration_ms = (EXTRACT(EPOCH FROM ($3 - started_at)) * 1000)::BIGINT,
                         records_processed = $4,
                         records_inserted = $5,
                         records_updated = $6,
                         records_deleted = $7,
                         records_failed = $8,
                         bytes_processed = $9,
                         error_message = $10
                     WHERE id = $1 AND status = 'running'",
                    self.schema
                ),
                &[
                    &sync_run_id,
                    &status.as_str(),
                    &completed_at,
                    &statistics.records_processed,
                    &statistics.records_inserted,
                    &statistics.records_updated,
                    &statistics.records_deleted,
                    &statistics.records_failed,
                    &statistics.bytes_processed,
                    &error_message,
                ],
            )
            .await?;

        if updated == 0 {
            warn!(sync_run_id = %sync_run_id, "Sync run already finalized, completion skipped");
            return Ok(false);
        }

        info!(
            sync_run_id = %sync_run_id,
            status = status.as_str(),
            records = statistics.records_processed,
            "Sync run completed"
        );
        Ok(true)
    }

    async fn log_error(&self, entry: ErrorLogEntry) -> Result<ErrorLogEntry> {
        let conn = self.get_conn().await?;
        conn.execute(
            &format!(
                "INSERT INTO \"{}\".error_log
                     (id, sync_run_id, schema_name, table_name, error_type,
                      error_message, record_data, operation_type, retry_count,
                      max_retries, status, occurred_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
                self.schema
            ),
            &[
                &entry.id,
                &entry.sync_run_id,
                &entry.schema_name,
                &entry.table_name,
                &entry.error_type.as_str(),
                &entry.error_message,
                &entry.record_data.as_ref().map(Json),
                &entry.operation_type.map(|o| o.as_str()),
                &entry.retry_count,
                &entry.max_retries,
                &entry.status.as_str(),
                &entry.occurred_at,
            ],
        )
        .await?;

        debug!(
            error_id = %entry.id,
            schema = %entry.schema_name,
            error_type = entry.error_type.as_str(),
            "Error logged"
        );
        Ok(entry)
    }

    async fn add_to_dead_letter_queue(&self, mut entry: DeadLetterEntry) -> Result<DeadLetterEntry> {
        let mut conn = self.get_conn().await?;
        let tx = conn.transaction().await?;

        let existing = tx
            .query_opt(
                &format!(
                    "SELECT id, error_count FROM \"{}\".dead_letter_queue
                     WHERE schema_name = $1 AND table_name = $2
                       AND COALESCE(source_record_id, '') = COALESCE($3, '')
                       AND status IN ('pending', 'processing')
                     FOR UPDATE",
                    self.schema
                ),
                &[&entry.schema_name, &entry.table_name, &entry.source_record_id],
            )
            .await?;

        match existing {
            Some(row) => {
                let id: Uuid = row.get(0);
                let error_count: i32 = row.get(1);
                tx.execute(
                    &format!(
                        "UPDATE \"{}\".dead_letter_queue
                         SET error_count = error_count + 1,
                             last_error_at = NOW(),
                             last_error_message = $2,
                             error_log_id = COALESCE($3, error_log_id),
                             sync_run_id = COALESCE($4, sync_run_id)
                         WHERE id = $1",
                        self.schema
                    ),
                    &[
                        &id,
                        &entry.last_error_message,
                        &entry.error_log_id,
                        &entry.sync_run_id,
                    ],
                )
                .await?;
                entry.id = id;
                entry.error_count = error_count + 1;
            }
            None => {
                tx.execute(
                    &format!(
                        "INSERT INTO \"{}\".dead_letter_queue
                             (id, sync_run_id, error_log_id, schema_name, table_name,
                              source_record_id, operation_type, record_data, error_count,
                              first_error_at, last_error_at, last_error_message, status)
                         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
                        self.schema
                    ),
                    &[
                        &entry.id,
                        &entry.sync_run_id,
                        &entry.error_log_id,
                        &entry.schema_name,
                        &entry.table_name,
                        &entry.source_record_id,
                        &entry.operation_type.as_str(),
                        &Json(&entry.record_data),
                        &entry.error_count,
                        &entry.first_error_at,
                        &entry.last_error_at,
                        &entry.last_error_message,
                        &entry.status.as_str(),
                    ],
                )
                .await?;
            }
        }
        tx.commit().await?;

        warn!(
            dlq_id = %entry.id,
            schema = %entry.schema_name,
            table = %entry.table_name,
            error_count = entry.error_count,
            "Record routed to dead letter queue"
        );
        Ok(entry)
    }

    async fn recover_failed_runs(&self, max_age: Duration) -> Result<Vec<Uuid>> {
        let cutoff: DateTime<Utc> = Utc::now() - max_age;
        let conn = self.get_conn().await?;

        let rows = conn
            .query(
                &format!(
                    "UPDATE \"{}\".sync_runs
                     SET status = 'failed',
                         completed_at = NOW(),
                         error_message = 'Run recovered after timeout',
                         duration_ms = (EXTRACT(EPOCH FROM (NOW() - started_at)) * 1000)::BIGINT
                     WHERE status = 'running' AND started_at < $1
                     RETURNING id",
                    self.schema
                ),
                &[&cutoff],
            )
            .await?;

        let recovered: Vec<Uuid> = rows.iter().map(|r| r.get(0)).collect();
        for id in &recovered {
            warn!(sync_run_id = %id, "Recovered stuck sync run");
        }
        Ok(recovered)
    }

    async fn get_sync_statistics(
        &self,
        schema_name: Option<&str>,
        hours: i64,
    ) -> Result<SyncStatisticsReport> {
        let since: DateTime<Utc> = Utc::now() - Duration::hours(hours);
        let conn = self.get_conn().await?;
        let schema_filter = schema_name.map(String::from);

        let runs = conn
            .query_one(
                &format!(
                    "SELECT COUNT(*),
                            COUNT(*) FILTER (WHERE status = 'completed'),
                            COUNT(*) FILTER (WHERE status = 'failed'),
                            COUNT(*) FILTER (WHERE status = 'running'),
                            AVG(duration_ms)::FLOAT8,
                            COALESCE(SUM(records_processed), 0)::BIGINT,
                            COALESCE(SUM(bytes_processed), 0)::BIGINT
                     FROM \"{}\".sync_runs
                     WHERE started_at >= $1 AND ($2::VARCHAR IS NULL OR schema_name = $2)",
                    self.schema
                ),
                &[&since, &schema_filter],
            )
            .await?;

        let errors = conn
            .query_one(
                &format!(
                    "SELECT COUNT(*), COUNT(*) FILTER (WHERE status = 'open')
                     FROM \"{}\".error_log
                     WHERE occurred_at >= $1 AND ($2::VARCHAR IS NULL OR schema_name = $2)",
                    self.schema
                ),
                &[&since, &schema_filter],
            )
            .await?;

        let dlq = conn
            .query_one(
                &format!(
                    "SELECT COUNT(*), COUNT(*) FILTER (WHERE status = 'pending')
                     FROM \"{}\".dead_letter_queue
                     WHERE first_error_at >= $1 AND ($2::VARCHAR IS NULL OR schema_name = $2)",
                    self.schema
                ),
                &[&since, &schema_filter],
            )
            .await?;

        Ok(SyncStatisticsReport {
            time_range_hours: hours,
            schema_name: schema_filter,
            total_runs: runs.get(0),
            completed_runs: runs.get(1),
            failed_runs: runs.get(2),
            running_runs: runs.get(3),
            avg_duration_ms: runs.get(4),
            total_records_processed: runs.get(5),
            total_bytes_processed: runs.get(6),
            total_errors: errors.get(0),
            open_errors: errors.get(1),
            total_dlq_records: dlq.get(0),
            pending_dlq_records: dlq.get(1),
            generated_at: Some(Utc::now()),
        })
    }

    async fn cleanup_old_metadata(&self, retention_days: i64) -> Result<CleanupReport> {
        let cutoff: DateTime<Utc> = Utc::now() - Duration::days(retention_days);
        let mut conn = self.get_conn().await?;
        let tx = conn.transaction().await?;
        let mut report = CleanupReport::default();

        report.dead_letter_queue = tx
            .execute(
                &format!(
                    "DELETE FROM \"{}\".dead_letter_queue
                     WHERE processed_at < $1 AND status IN ('resolved', 'discarded')",
                    self.schema
                ),
                &[&cutoff],
            )
            .await?;

        report.error_log = tx
            .execute(
                &format!(
                    "DELETE FROM \"{}\".error_log
                     WHERE resolved_at < $1 AND status = 'resolved'",
                    self.schema
                ),
                &[&cutoff],
            )
            .await?;

        report.sync_runs = tx
            .execute(
                &format!(
                    "DELETE FROM \"{}\".sync_runs
                     WHERE completed_at < $1
                       AND status IN ('completed', 'failed', 'cancelled')",
                    self.schema
                ),
                &[&cutoff],
            )
            .await?;

        // Stale markers whose schema has not synced inside the window
        report.sync_markers = tx
            .execute(
                &format!(
                    "DELETE FROM \"{}\".sync_markers WHERE last_updated < $1",
                    self.schema
                ),
                &[&cutoff],
            )
            .await?;

        // Keep the trailing ten versions per table regardless of age
        report.schema_registry = tx
            .execute(
                &format!(
                    "DELETE FROM \"{schema}\".schema_registry sr
                     WHERE sr.registered_at < $1
                       AND sr.version + 10 <= (
                           SELECT MAX(version) FROM \"{schema}\".schema_registry latest
                           WHERE latest.schema_name = sr.schema_name
                             AND latest.table_name = sr.table_name
                       )",
                    schema = self.schema
                ),
                &[&cutoff],
            )
            .await?;

        tx.commit().await?;

        if report != CleanupReport::default() {
            info!(?report, "Metadata cleanup completed");
        }
        Ok(report)
    }

    fn backend_type(&self) -> &'static str {
        "postgres"
    }
}
