//! SQLite Record Store
//!
//! Applies change records to the host application's SQLite database.
//! Payloads are full row snapshots; applying one intersects the payload
//! keys with the table's actual columns, so peers running slightly
//! different schema versions degrade to the shared columns instead of
//! failing. The key column comes from the table's primary key when it
//! has a single-column one, otherwise from configuration.

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row, SqlitePool};

use crate::config::DatabaseConfig;
use crate::error::{Error, Result};
use crate::ledger::{ChangeRecord, Operation};

use super::RecordStore;

/// Record store over a SQLite connection pool
pub struct SqliteStore {
    pool: SqlitePool,
    fallback_key_column: String,
}

/// One column from PRAGMA table_info
struct TableColumn {
    name: String,
    pk: bool,
}

impl SqliteStore {
    /// Open the application database
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&config.url())?
            .create_if_missing(true)
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.pool_size)
            .connect_with(options)
            .await?;

        Ok(Self {
            pool,
            fallback_key_column: config.key_column.clone(),
        })
    }

    /// Execute a raw SQL statement, returning affected rows. The host
    /// application owns its schema; this exists for setup and tooling.
    pub async fn execute_raw(&self, sql: &str) -> Result<u64> {
        let result = sqlx::query(sql).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    /// Column names and primary-key flags for a table
    async fn columns(&self, table: &str) -> Result<Vec<TableColumn>> {
        let rows = sqlx::query(&format!("PRAGMA table_info(\"{}\")", table))
            .fetch_all(&self.pool)
            .await?;

        let columns: Vec<TableColumn> = rows
            .iter()
            .filter_map(|row| {
                Some(TableColumn {
                    name: row.try_get("name").ok()?,
                    pk: row.try_get::<i64, _>("pk").ok()? > 0,
                })
            })
            .collect();

        Ok(columns)
    }

    /// Key column for a table: its primary key when single-column,
    /// the configured fallback otherwise
    fn key_column_for(&self, table: &str, columns: &[TableColumn]) -> Result<String> {
        let pk_columns: Vec<&TableColumn> = columns.iter().filter(|c| c.pk).collect();
        if pk_columns.len() == 1 {
            return Ok(pk_columns[0].name.clone());
        }
        if columns.iter().any(|c| c.name == self.fallback_key_column) {
            return Ok(self.fallback_key_column.clone());
        }
        Err(Error::Apply {
            table: table.to_string(),
            key: String::new(),
            reason: format!("no usable key column (fallback '{}' absent)", self.fallback_key_column),
        })
    }

    fn apply_err(record: &ChangeRecord, reason: impl Into<String>) -> Error {
        Error::Apply {
            table: record.table_name.clone(),
            key: record.record_key.clone(),
            reason: reason.into(),
        }
    }
}

#[async_trait::async_trait]
impl RecordStore for SqliteStore {
    async fn read(&self, table: &str, key: &str) -> Result<Option<serde_json::Value>> {
        if !valid_ident(table) {
            return Ok(None);
        }
        let columns = self.columns(table).await?;
        if columns.is_empty() {
            return Ok(None);
        }
        let key_column = self.key_column_for(table, &columns)?;

        let sql = format!("SELECT * FROM \"{}\" WHERE \"{}\" = ?1", table, key_column);
        let row = sqlx::query(&sql).bind(key).fetch_optional(&self.pool).await?;

        Ok(row.map(|r| row_to_json(&r)))
    }

    async fn write(&self, record: &ChangeRecord) -> Result<()> {
        if let Some(reason) = record.shape_error() {
            return Err(Self::apply_err(record, reason));
        }
        if !valid_ident(&record.table_name) {
            return Err(Self::apply_err(record, "invalid table name"));
        }

        let columns = self.columns(&record.table_name).await?;
        if columns.is_empty() {
            return Err(Self::apply_err(record, "table does not exist"));
        }
        let key_column = self.key_column_for(&record.table_name, &columns)?;

        match record.operation {
            Operation::Delete => {
                let sql = format!(
                    "DELETE FROM \"{}\" WHERE \"{}\" = ?1",
                    record.table_name, key_column
                );
                sqlx::query(&sql)
                    .bind(&record.record_key)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| Self::apply_err(record, e.to_string()))?;
            }
            Operation::Insert | Operation::Update => {
                // shape_error already guaranteed an object payload
                let payload = match &record.payload {
                    Some(serde_json::Value::Object(map)) => map,
                    _ => return Err(Self::apply_err(record, "payload must be a JSON object")),
                };

                // Intersect payload keys with the table's columns
                let mut names: Vec<String> = Vec::new();
                let mut values: Vec<serde_json::Value> = Vec::new();
                for column in &columns {
                    if let Some(value) = payload.get(&column.name) {
                        names.push(column.name.clone());
                        values.push(value.clone());
                    }
                }
                if names.is_empty() {
                    return Err(Self::apply_err(record, "payload shares no columns with table"));
                }
                if !names.contains(&key_column) {
                    names.push(key_column.clone());
                    values.push(serde_json::Value::String(record.record_key.clone()));
                }

                let quoted: Vec<String> = names.iter().map(|n| format!("\"{}\"", n)).collect();
                let placeholders: Vec<String> =
                    (1..=names.len()).map(|i| format!("?{}", i)).collect();
                let sql = format!(
                    "INSERT OR REPLACE INTO \"{}\" ({}) VALUES ({})",
                    record.table_name,
                    quoted.join(", "),
                    placeholders.join(", ")
                );

                let mut query = sqlx::query(&sql);
                for value in &values {
                    query = bind_json(query, value);
                }
                query
                    .execute(&self.pool)
                    .await
                    .map_err(|e| Self::apply_err(record, e.to_string()))?;
            }
        }

        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        let result: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await?;
        Ok(result.0 == 1)
    }

    fn backend(&self) -> &'static str {
        "sqlite"
    }
}

/// Table and column names come off the wire; only plain identifiers pass
fn valid_ident(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 128
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit())
}

/// Bind one JSON value as the matching SQLite type
fn bind_json<'q>(
    query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    value: &serde_json::Value,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    match value {
        serde_json::Value::Null => query.bind(None::<String>),
        serde_json::Value::Bool(b) => query.bind(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                query.bind(i)
            } else if let Some(f) = n.as_f64() {
                query.bind(f)
            } else {
                query.bind(n.to_string())
            }
        }
        serde_json::Value::String(s) => query.bind(s.clone()),
        // Nested structures are stored as JSON text
        other => query.bind(other.to_string()),
    }
}

/// Convert a fetched row into a JSON object
fn row_to_json(row: &SqliteRow) -> serde_json::Value {
    let mut object = serde_json::Map::new();
    for (i, column) in row.columns().iter().enumerate() {
        let value = if let Ok(v) = row.try_get::<Option<i64>, _>(i) {
            match v {
                Some(n) => serde_json::Value::from(n),
                None => serde_json::Value::Null,
            }
        } else if let Ok(Some(f)) = row.try_get::<Option<f64>, _>(i) {
            serde_json::Value::from(f)
        } else if let Ok(Some(s)) = row.try_get::<Option<String>, _>(i) {
            serde_json::Value::String(s)
        } else if let Ok(Some(b)) = row.try_get::<Option<Vec<u8>>, _>(i) {
            serde_json::Value::String(hex::encode(b))
        } else {
            serde_json::Value::Null
        };
        object.insert(column.name().to_string(), value);
    }
    serde_json::Value::Object(object)
}
