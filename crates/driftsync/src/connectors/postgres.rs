//! PostgreSQL destination connector.
//!
//! Pooled UPSERT writes with audit columns, idempotent schema/table
//! creation, soft/hard delete support and marker persistence. Marker
//! operations use the `sync_markers` table that the metadata store creates
//! at startup.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_postgres::types::{Json, ToSql};
use tokio_postgres::NoTls;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{DeletionStrategy, DestinationConfig};
use crate::core::{
    ColumnType, DestinationConnector, OperationType, Record, SchemaChange, SchemaChangeKind,
    TableSchema,
};
use crate::error::{Result, SyncError};
use crate::evolution::{SafetyLevel, TypeConversionEngine};

/// Audit columns appended to every replicated table.
const CREATED_AT_COLUMN: &str = "_sync_created_at";
const UPDATED_AT_COLUMN: &str = "_sync_updated_at";
const VERSION_COLUMN: &str = "_sync_version";

/// PostgreSQL destination connector.
pub struct PostgresDestination {
    pool: Pool,
    metadata_schema: String,
    deletion_strategy: DeletionStrategy,
    table_deletion_overrides: HashMap<String, DeletionStrategy>,
    soft_delete_flag: String,
    soft_delete_timestamp: String,
    converter: TypeConversionEngine,
    // Created-set memoization avoids redundant DDL round-trips; the DDL
    // itself stays idempotent for restarts
    created_schemas: Mutex<HashSet<String>>,
    created_tables: Mutex<HashSet<(String, String)>>,
    table_schemas: Mutex<HashMap<(String, String), TableSchema>>,
}

impl PostgresDestination {
    /// Build a connector and its pool from configuration.
    pub fn new(config: &DestinationConfig) -> Result<Self> {
        Self::with_overrides(config, HashMap::new())
    }

    /// Build with per-table deletion strategy overrides.
    pub fn with_overrides(
        config: &DestinationConfig,
        table_deletion_overrides: HashMap<String, DeletionStrategy>,
    ) -> Result<Self> {
        let pool = build_pg_pool(config)?;
        Ok(Self {
            pool,
            metadata_schema: config.metadata_schema.clone(),
            deletion_strategy: config.deletion_strategy,
            table_deletion_overrides,
            soft_delete_flag: config.soft_delete_flag_column.clone(),
            soft_delete_timestamp: config.soft_delete_timestamp_column.clone(),
            converter: TypeConversionEngine::new(),
            created_schemas: Mutex::new(HashSet::new()),
            created_tables: Mutex::new(HashSet::new()),
            table_schemas: Mutex::new(HashMap::new()),
        })
    }

    /// The underlying pool; the runner shares it with the metadata store.
    pub fn pool(&self) -> Pool {
        self.pool.clone()
    }

    async fn get_conn(&self) -> Result<deadpool_postgres::Object> {
        self.pool
            .get()
            .await
            .map_err(|e| SyncError::pool(e, "acquiring destination connection"))
    }

    fn quote_ident(name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    fn qualify(schema: &str, table: &str) -> String {
        format!("{}.{}", Self::quote_ident(schema), Self::quote_ident(table))
    }

    fn strategy_for(&self, table_name: &str) -> DeletionStrategy {
        self.table_deletion_overrides
            .get(table_name)
            .copied()
            .unwrap_or(self.deletion_strategy)
    }

    async fn table_schema(&self, schema_name: &str, table_name: &str) -> Option<TableSchema> {
        self.table_schemas
            .lock()
            .await
            .get(&(schema_name.to_string(), table_name.to_string()))
            .cloned()
    }

    async fn write_table_batch(
        &self,
        schema_name: &str,
        table_name: &str,
        records: &[Record],
    ) -> Result<()> {
        let table_schema = self
            .table_schema(schema_name, table_name)
            .await
            .ok_or_else(|| {
                SyncError::Schema(format!(
                    "no cached schema for {}.{}; create_table_if_not_exists must run first",
                    schema_name, table_name
                ))
            })?;

        let mut conn = self.get_conn().await?;
        let tx = conn.transaction().await?;

        for record in records {
            match record.operation {
                OperationType::Insert => {
                    self.upsert_record(&tx, schema_name, &table_schema, record)
                        .await?
                }
                OperationType::Update => {
                    self.update_record(&tx, schema_name, &table_schema, record)
                        .await?
                }
                OperationType::Delete => {
                    let strategy = self.strategy_for(table_name);
                    if matches!(strategy, DeletionStrategy::Soft | DeletionStrategy::Both) {
                        self.soft_delete_record(&tx, schema_name, &table_schema, record)
                            .await?;
                    }
                    if matches!(strategy, DeletionStrategy::Hard | DeletionStrategy::Both) {
                        self.hard_delete_record(&tx, schema_name, &table_schema, record)
                            .await?;
                    }
                }
                OperationType::SchemaChange => {
                    return Err(SyncError::transformation(
                        table_name,
                        "schema_change records do not belong in write_batch",
                    ));
                }
            }
        }

        tx.commit().await?;
        debug!(
            schema = schema_name,
            table = table_name,
            records = records.len(),
            "Batch written"
        );
        Ok(())
    }

    async fn upsert_record(
        &self,
        tx: &tokio_postgres::Transaction<'_>,
        schema_name: &str,
        table: &TableSchema,
        record: &Record,
    ) -> Result<()> {
        let mut columns: Vec<String> = Vec::new();
        let mut params: Vec<BoundValue> = Vec::new();
        for column in &table.columns {
            columns.push(Self::quote_ident(&column.name));
            params.push(bind_value(
                record.data.get(&column.name).unwrap_or(&Value::Null),
                column.column_type,
                &record.table_name,
            )?);
        }

        let placeholders: Vec<String> = (1..=params.len()).map(|i| format!("${}", i)).collect();
        let mut insert_columns = columns.clone();
        insert_columns.extend([
            Self::quote_ident(&self.soft_delete_flag),
            Self::quote_ident(&self.soft_delete_timestamp),
            Self::quote_ident(CREATED_AT_COLUMN),
            Self::quote_ident(UPDATED_AT_COLUMN),
            Self::quote_ident(VERSION_COLUMN),
        ]);
        let mut values = placeholders;
        values.extend([
            "FALSE".to_string(),
            "NULL".to_string(),
            "NOW()".to_string(),
            "NOW()".to_string(),
            "1".to_string(),
        ]);

        let mut sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            Self::qualify(schema_name, &table.name),
            insert_columns.join(", "),
            values.join(", "),
        );

        if table.has_pk() {
            let conflict: Vec<String> = table
                .primary_keys
                .iter()
                .map(|pk| Self::quote_ident(pk))
                .collect();
            let mut updates: Vec<String> = table
                .columns
                .iter()
                .filter(|c| !table.primary_keys.contains(&c.name))
                .map(|c| {
                    format!(
                        "{col} = EXCLUDED.{col}",
                        col = Self::quote_ident(&c.name)
                    )
                })
                .collect();
            // Re-delivery of the same record is a no-op beyond this bump
            updates.push(format!(
                "{} = {}.{} + 1",
                Self::quote_ident(VERSION_COLUMN),
                Self::quote_ident(&table.name),
                Self::quote_ident(VERSION_COLUMN)
            ));
            updates.push(format!("{} = NOW()", Self::quote_ident(UPDATED_AT_COLUMN)));
            sql.push_str(&format!(
                " ON CONFLICT ({}) DO UPDATE SET {}",
                conflict.join(", "),
                updates.join(", ")
            ));
        }

        let refs = param_refs(&params);
        tx.execute(&sql, &refs).await?;
        Ok(())
    }

    async fn update_record(
        &self,
        tx: &tokio_postgres::Transaction<'_>,
        schema_name: &str,
        table: &TableSchema,
        record: &Record,
    ) -> Result<()> {
        let mut sets: Vec<String> = Vec::new();
        let mut params: Vec<BoundValue> = Vec::new();
        let mut idx = 1usize;

        for column in &table.columns {
            if let Some(value) = record.data.get(&column.name) {
                sets.push(format!("{} = ${}", Self::quote_ident(&column.name), idx));
                params.push(bind_value(value, column.column_type, &record.table_name)?);
                idx += 1;
            }
        }
        sets.push(format!("{} = NOW()", Self::quote_ident(UPDATED_AT_COLUMN)));
        sets.push(format!(
            "{col} = {col} + 1",
            col = Self::quote_ident(VERSION_COLUMN)
        ));

        let (where_clause, mut pk_params) =
            pk_where_clause(table, record, idx)?;
        params.append(&mut pk_params);

        let sql = format!(
            "UPDATE {} SET {} WHERE {}",
            Self::qualify(schema_name, &table.name),
            sets.join(", "),
            where_clause
        );

        let refs = param_refs(&params);
        let updated = tx.execute(&sql, &refs).await?;
        if updated == 0 {
            // Out-of-order delivery: the row is not there yet, upsert it
            self.upsert_record(tx, schema_name, table, record).await?;
        }
        Ok(())
    }

    async fn soft_delete_record(
        &self,
        tx: &tokio_postgres::Transaction<'_>,
        schema_name: &str,
        table: &TableSchema,
        record: &Record,
    ) -> Result<()> {
        let (where_clause, params) = pk_where_clause(table, record, 1)?;
        let sql = format!(
            "UPDATE {} SET {flag} = TRUE, {ts} = NOW(), {updated} = NOW(), {ver} = {ver} + 1
             WHERE {where_clause} AND ({flag} IS NULL OR {flag} = FALSE)",
            Self::qualify(schema_name, &table.name),
            flag = Self::quote_ident(&self.soft_delete_flag),
            ts = Self::quote_ident(&self.soft_delete_timestamp),
            updated = Self::quote_ident(UPDATED_AT_COLUMN),
            ver = Self::quote_ident(VERSION_COLUMN),
            where_clause = where_clause,
        );
        let refs = param_refs(&params);
        tx.execute(&sql, &refs).await?;
        Ok(())
    }

    async fn hard_delete_record(
        &self,
        tx: &tokio_postgres::Transaction<'_>,
        schema_name: &str,
        table: &TableSchema,
        record: &Record,
    ) -> Result<()> {
        let (where_clause, params) = pk_where_clause(table, record, 1)?;
        let sql = format!(
            "DELETE FROM {} WHERE {}",
            Self::qualify(schema_name, &table.name),
            where_clause
        );
        let refs = param_refs(&params);
        tx.execute(&sql, &refs).await?;
        Ok(())
    }

    async fn apply_single_change(&self, change: &SchemaChange) -> Result<()> {
        let conn = self.get_conn().await?;
        match change.kind {
            SchemaChangeKind::MigrationSql => {
                let sql = change
                    .details
                    .get("sql")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        SyncError::Schema("migration_sql change missing sql".to_string())
                    })?;
                conn.batch_execute(sql).await?;
                info!(sql, "Executed migration SQL");
            }
            SchemaChangeKind::AddColumn => {
                let column = change.details.get("column").ok_or_else(|| {
                    SyncError::Schema("add_column change missing column details".to_string())
                })?;
                let name = column
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| SyncError::Schema("column details missing name".to_string()))?;
                let column_type: ColumnType = column
                    .get("type")
                    .cloned()
                    .map(serde_json::from_value)
                    .transpose()?
                    .unwrap_or(ColumnType::String);
                let nullable = column.get("nullable").and_then(Value::as_bool).unwrap_or(true);
                let max_length = column
                    .get("max_length")
                    .and_then(Value::as_i64)
                    .map(|n| n as i32);

                let mut sql = format!(
                    "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {} {}",
                    Self::qualify(&change.schema_name, &change.table_name),
                    Self::quote_ident(name),
                    postgres_type(column_type, max_length)
                );
                if !nullable {
                    sql.push_str(" NOT NULL");
                }
                conn.execute(sql.as_str(), &[]).await?;
                info!(
                    schema = %change.schema_name,
                    table = %change.table_name,
                    column = name,
                    "Column added"
                );
            }
            SchemaChangeKind::ModifyColumn => {
                let old_type: Option<ColumnType> = change
                    .details
                    .get("old")
                    .and_then(|d| d.get("type"))
                    .cloned()
                    .map(serde_json::from_value)
                    .transpose()?;
                let new = change.details.get("new").ok_or_else(|| {
                    SyncError::Schema("modify_column change missing new definition".to_string())
                })?;
                let new_type: ColumnType = new
                    .get("type")
                    .cloned()
                    .map(serde_json::from_value)
                    .transpose()?
                    .ok_or_else(|| SyncError::Schema("new definition missing type".to_string()))?;
                let name = new
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| SyncError::Schema("new definition missing name".to_string()))?;

                // Only safe widenings may bypass the migration engine
                let safe = old_type
                    .map(|old| self.converter.conversion_safety(old, new_type) == SafetyLevel::Safe)
                    .unwrap_or(false);
                if !safe {
                    warn!(
                        table = %change.table_name,
                        column = name,
                        "Unsafe direct column type change skipped; use the migration engine"
                    );
                    return Ok(());
                }

                let max_length = new.get("max_length").and_then(Value::as_i64).map(|n| n as i32);
                let sql = format!(
                    "ALTER TABLE {} ALTER COLUMN {} TYPE {}",
                    Self::qualify(&change.schema_name, &change.table_name),
                    Self::quote_ident(name),
                    postgres_type(new_type, max_length)
                );
                conn.execute(sql.as_str(), &[]).await?;
                info!(
                    table = %change.table_name,
                    column = name,
                    new_type = new_type.as_str(),
                    "Column type widened"
                );
            }
            SchemaChangeKind::AddTable => {
                let table = change.details.get("table").ok_or_else(|| {
                    SyncError::Schema("add_table change missing table details".to_string())
                })?;
                let table_schema: TableSchema = serde_json::from_value(table.clone())?;
                drop(conn);
                self.create_table_if_not_exists(&change.schema_name, &table_schema)
                    .await?;
            }
            SchemaChangeKind::DropColumn | SchemaChangeKind::DropTable => {
                // Destructive drops only travel the migration engine's
                // approval-gated path
                warn!(
                    kind = ?change.kind,
                    table = %change.table_name,
                    "Direct destructive change refused"
                );
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DestinationConnector for PostgresDestination {
    async fn write_batch(&self, schema_name: &str, records: &[Record]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        // Group by table so each table's records share one transaction
        let mut by_table: HashMap<&str, Vec<&Record>> = HashMap::new();
        for record in records {
            by_table.entry(&record.table_name).or_default().push(record);
        }

        for (table_name, table_records) in by_table {
            let owned: Vec<Record> = table_records.into_iter().cloned().collect();
            self.write_table_batch(schema_name, table_name, &owned).await?;
        }
        Ok(())
    }

    async fn apply_schema_changes(
        &self,
        _schema_name: &str,
        changes: &[SchemaChange],
    ) -> Result<()> {
        for change in changes {
            self.apply_single_change(change).await?;
        }
        Ok(())
    }

    async fn update_marker(
        &self,
        schema_name: &str,
        table_name: &str,
        marker: &Value,
    ) -> Result<()> {
        let conn = self.get_conn().await?;
        conn.execute(
            &format!(
                "INSERT INTO {}.sync_markers
                     (id, schema_name, table_name, marker_type, position_data, last_updated)
                 VALUES ($1, $2, $3, 'stream', $4, NOW())
                 ON CONFLICT (schema_name, COALESCE(table_name, ''), marker_type)
                 DO UPDATE SET
                     position_data = EXCLUDED.position_data,
                     last_updated = EXCLUDED.last_updated",
                Self::quote_ident(&self.metadata_schema)
            ),
            &[&Uuid::new_v4(), &schema_name, &table_name, &Json(marker)],
        )
        .await?;
        Ok(())
    }

    async fn get_marker(&self, schema_name: &str, table_name: &str) -> Result<Option<Value>> {
        let conn = self.get_conn().await?;
        let row = conn
            .query_opt(
                &format!(
                    "SELECT position_data FROM {}.sync_markers
                     WHERE schema_name = $1 AND COALESCE(table_name, '') = $2
                       AND marker_type = 'stream'",
                    Self::quote_ident(&self.metadata_schema)
                ),
                &[&schema_name, &table_name],
            )
            .await?;
        Ok(row.map(|r| r.get::<_, Json<Value>>(0).0))
    }

    async fn create_schema_if_not_exists(&self, schema_name: &str) -> Result<()> {
        if self.created_schemas.lock().await.contains(schema_name) {
            return Ok(());
        }
        let conn = self.get_conn().await?;
        conn.execute(
            &format!("CREATE SCHEMA IF NOT EXISTS {}", Self::quote_ident(schema_name)),
            &[],
        )
        .await?;
        self.created_schemas
            .lock()
            .await
            .insert(schema_name.to_string());
        debug!(schema = schema_name, "Schema created or verified");
        Ok(())
    }

    async fn create_table_if_not_exists(
        &self,
        schema_name: &str,
        table_schema: &TableSchema,
    ) -> Result<()> {
        let key = (schema_name.to_string(), table_schema.name.clone());
        if self.created_tables.lock().await.contains(&key) {
            return Ok(());
        }

        self.create_schema_if_not_exists(schema_name).await?;

        let mut columns: Vec<String> = table_schema
            .columns
            .iter()
            .map(|col| {
                let mut part = format!(
                    "{} {}",
                    Self::quote_ident(&col.name),
                    postgres_type(col.column_type, col.max_length)
                );
                if !col.nullable {
                    part.push_str(" NOT NULL");
                }
                part
            })
            .collect();

        columns.push(format!(
            "{} BOOLEAN DEFAULT FALSE",
            Self::quote_ident(&self.soft_delete_flag)
        ));
        columns.push(format!(
            "{} TIMESTAMPTZ",
            Self::quote_ident(&self.soft_delete_timestamp)
        ));
        columns.push(format!(
            "{} TIMESTAMPTZ DEFAULT NOW()",
            Self::quote_ident(CREATED_AT_COLUMN)
        ));
        columns.push(format!(
            "{} TIMESTAMPTZ DEFAULT NOW()",
            Self::quote_ident(UPDATED_AT_COLUMN)
        ));
        columns.push(format!(
            "{} INTEGER DEFAULT 1",
            Self::quote_ident(VERSION_COLUMN)
        ));

        if table_schema.has_pk() {
            let pks: Vec<String> = table_schema
                .primary_keys
                .iter()
                .map(|pk| Self::quote_ident(pk))
                .collect();
            columns.push(format!("PRIMARY KEY ({})", pks.join(", ")));
        }

        let conn = self.get_conn().await?;
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} ({})",
                Self::qualify(schema_name, &table_schema.name),
                columns.join(", ")
            ),
            &[],
        )
        .await?;

        for index in &table_schema.indexes {
            let index_columns: Vec<String> = index
                .columns
                .iter()
                .map(|c| Self::quote_ident(c))
                .collect();
            let unique = if index.unique { "UNIQUE " } else { "" };
            if let Err(e) = conn
                .execute(
                    &format!(
                        "CREATE {}INDEX IF NOT EXISTS {} ON {} ({})",
                        unique,
                        Self::quote_ident(&index.name),
                        Self::qualify(schema_name, &table_schema.name),
                        index_columns.join(", ")
                    ),
                    &[],
                )
                .await
            {
                warn!(index = %index.name, error = %e, "Failed to create index");
            }
        }

        self.created_tables.lock().await.insert(key.clone());
        self.table_schemas
            .lock()
            .await
            .insert(key, table_schema.clone());
        info!(
            schema = schema_name,
            table = %table_schema.name,
            columns = table_schema.columns.len(),
            "Table created or verified"
        );
        Ok(())
    }

    async fn connect(&self) -> Result<()> {
        let conn = self.get_conn().await?;
        conn.simple_query("SELECT 1").await?;
        info!("Connected to PostgreSQL destination");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.pool.close();
        Ok(())
    }

    async fn test_connection(&self) -> bool {
        match self.pool.get().await {
            Ok(conn) => conn.simple_query("SELECT 1").await.is_ok(),
            Err(_) => false,
        }
    }
}

/// A value bound for a statement parameter.
type BoundValue = Box<dyn ToSql + Send + Sync>;

fn param_refs(params: &[BoundValue]) -> Vec<&(dyn ToSql + Sync)> {
    params
        .iter()
        .map(|p| p.as_ref() as &(dyn ToSql + Sync))
        .collect()
}

/// Convert a JSON value into a typed statement parameter for the target
/// column, parsing leniently the way schemaless sources require.
fn bind_value(value: &Value, column_type: ColumnType, table: &str) -> Result<BoundValue> {
    if value.is_null() {
        return Ok(null_for(column_type));
    }

    let bound: BoundValue = match column_type {
        ColumnType::String => match value {
            Value::String(s) => Box::new(Some(s.clone())),
            other => Box::new(Some(other.to_string())),
        },
        ColumnType::Integer | ColumnType::Bigint => match value {
            Value::Number(n) => match n.as_i64() {
                Some(i) => Box::new(Some(i)),
                None => Box::new(n.as_f64().map(|f| f.trunc() as i64)),
            },
            Value::String(s) => match s.trim().parse::<i64>() {
                Ok(i) => Box::new(Some(i)),
                Err(_) => {
                    return Err(conversion_error(table, value, column_type));
                }
            },
            Value::Bool(b) => Box::new(Some(i64::from(*b))),
            _ => return Err(conversion_error(table, value, column_type)),
        },
        ColumnType::Float | ColumnType::Double => match value {
            Value::Number(n) => Box::new(n.as_f64()),
            Value::String(s) => match s.trim().parse::<f64>() {
                Ok(f) => Box::new(Some(f)),
                Err(_) => return Err(conversion_error(table, value, column_type)),
            },
            _ => return Err(conversion_error(table, value, column_type)),
        },
        ColumnType::Boolean => match value {
            Value::Bool(b) => Box::new(Some(*b)),
            Value::Number(n) => Box::new(n.as_i64().map(|i| i != 0)),
            Value::String(s) => match s.trim().to_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Box::new(Some(true)),
                "false" | "0" | "no" | "off" => Box::new(Some(false)),
                _ => return Err(conversion_error(table, value, column_type)),
            },
            _ => return Err(conversion_error(table, value, column_type)),
        },
        ColumnType::Timestamp => match value {
            Value::String(s) => match DateTime::parse_from_rfc3339(s) {
                Ok(dt) => Box::new(Some(dt.with_timezone(&Utc))),
                Err(_) => return Err(conversion_error(table, value, column_type)),
            },
            Value::Number(n) => match n.as_i64().and_then(DateTime::from_timestamp_millis) {
                Some(dt) => Box::new(Some(dt)),
                None => return Err(conversion_error(table, value, column_type)),
            },
            _ => return Err(conversion_error(table, value, column_type)),
        },
        ColumnType::Date => match value {
            Value::String(s) => match NaiveDate::from_str(s.trim()) {
                Ok(d) => Box::new(Some(d)),
                Err(_) => return Err(conversion_error(table, value, column_type)),
            },
            _ => return Err(conversion_error(table, value, column_type)),
        },
        ColumnType::Json => Box::new(Some(Json(value.clone()))),
        ColumnType::Binary => match value {
            Value::String(s) => Box::new(Some(s.clone().into_bytes())),
            _ => return Err(conversion_error(table, value, column_type)),
        },
    };
    Ok(bound)
}

fn null_for(column_type: ColumnType) -> BoundValue {
    match column_type {
        ColumnType::String => Box::new(None::<String>),
        ColumnType::Integer | ColumnType::Bigint => Box::new(None::<i64>),
        ColumnType::Float | ColumnType::Double => Box::new(None::<f64>),
        ColumnType::Boolean => Box::new(None::<bool>),
        ColumnType::Timestamp => Box::new(None::<DateTime<Utc>>),
        ColumnType::Date => Box::new(None::<NaiveDate>),
        ColumnType::Json => Box::new(None::<Json<Value>>),
        ColumnType::Binary => Box::new(None::<Vec<u8>>),
    }
}

fn conversion_error(table: &str, value: &Value, column_type: ColumnType) -> SyncError {
    SyncError::transformation(
        table,
        format!("cannot bind {} as {}", value, column_type.as_str()),
    )
}

/// WHERE clause over primary-key values, with parameters starting at
/// `start_idx`.
fn pk_where_clause(
    table: &TableSchema,
    record: &Record,
    start_idx: usize,
) -> Result<(String, Vec<BoundValue>)> {
    if record.primary_key_values.is_empty() {
        return Err(SyncError::transformation(
            table.name.clone(),
            "record has no primary key values",
        ));
    }

    let mut clauses = Vec::new();
    let mut params = Vec::new();
    let mut idx = start_idx;
    for (pk, value) in &record.primary_key_values {
        let column_type = table
            .column(pk)
            .map(|c| c.column_type)
            .unwrap_or(ColumnType::String);
        clauses.push(format!(
            "{} = ${}",
            PostgresDestination::quote_ident(pk),
            idx
        ));
        params.push(bind_value(value, column_type, &table.name)?);
        idx += 1;
    }
    Ok((clauses.join(" AND "), params))
}

/// Map a normalized column type to its PostgreSQL type.
fn postgres_type(column_type: ColumnType, max_length: Option<i32>) -> String {
    match column_type {
        ColumnType::String => match max_length {
            Some(n) if n > 0 && n <= 255 => format!("VARCHAR({})", n),
            _ => "TEXT".to_string(),
        },
        ColumnType::Integer => "INTEGER".to_string(),
        ColumnType::Bigint => "BIGINT".to_string(),
        ColumnType::Float => "REAL".to_string(),
        ColumnType::Double => "DOUBLE PRECISION".to_string(),
        ColumnType::Boolean => "BOOLEAN".to_string(),
        ColumnType::Timestamp => "TIMESTAMPTZ".to_string(),
        ColumnType::Date => "DATE".to_string(),
        ColumnType::Json => "JSONB".to_string(),
        ColumnType::Binary => "BYTEA".to_string(),
    }
}

/// Build a deadpool pool from a destination descriptor. Shared between the
/// destination connector and the metadata store.
pub fn build_pg_pool(config: &DestinationConfig) -> Result<Pool> {
    let mut pg_config = tokio_postgres::Config::from_str(&config.connection_string)
        .map_err(|e| SyncError::Config(format!("invalid destination connection string: {}", e)))?;
    pg_config.connect_timeout(Duration::from_secs(config.connection_timeout_seconds));
    pg_config.keepalives(true);

    let mgr = Manager::from_config(
        pg_config,
        NoTls,
        ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        },
    );
    Pool::builder(mgr)
        .max_size(config.max_connections)
        .build()
        .map_err(|e| SyncError::pool(e, "creating PostgreSQL pool"))
}

// Registry hookup lives in the connectors module; the struct stays
// constructible directly for embedding.
pub(super) fn build(
    config: &DestinationConfig,
    overrides: HashMap<String, DeletionStrategy>,
) -> Result<Arc<dyn DestinationConnector>> {
    Ok(Arc::new(PostgresDestination::with_overrides(config, overrides)?))
}
