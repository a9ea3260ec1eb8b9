//! Dialect-agnostic SQL execution (spec §4.2).
//!
//! `Store` wraps either a Postgres or SQLite pool and exposes the five
//! operations the rest of the engine needs: `query_rows`, `query_row`,
//! `exec`, `transaction`, `exec_ddl`. Everything above this module talks in
//! `serde_json::Value` records and `BindValue`s; only this module knows
//! which concrete sqlx driver is live.

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::{Map, Value};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{postgres::PgPoolOptions, PgPool, Row, SqlitePool};
use uuid::Uuid;

use crate::config::{AppConfig, Dialect};
use crate::error::AppError;

/// A single bound parameter, already resolved to a concrete type.
/// `infer_scalar` / `infer_array` build these from raw JSON the same way
/// `repository::table_service::infer_scalar_filter` did in the teacher.
#[derive(Debug, Clone)]
pub enum BindValue {
    Null,
    Text(String),
    Uuid(Uuid),
    Bool(bool),
    I64(i64),
    F64(f64),
    Date(NaiveDate),
    Timestamp(DateTime<Utc>),
    Json(Value),
    TextArray(Vec<String>),
}

#[derive(Clone)]
pub enum Store {
    Postgres(PgPool),
    Sqlite(SqlitePool),
}

impl Store {
    pub async fn connect(config: &AppConfig) -> Result<Self, sqlx::Error> {
        match config.dialect {
            Dialect::Postgres => {
                let pool = PgPoolOptions::new()
                    .max_connections(config.db_pool_max_connections)
                    .connect(&config.database_url)
                    .await?;
                Ok(Store::Postgres(pool))
            }
            Dialect::Sqlite => {
                let pool = SqlitePoolOptions::new()
                    .max_connections(config.db_pool_max_connections)
                    .connect(&config.database_url)
                    .await?;
                Ok(Store::Sqlite(pool))
            }
        }
    }

    pub fn dialect(&self) -> Dialect {
        match self {
            Store::Postgres(_) => Dialect::Postgres,
            Store::Sqlite(_) => Dialect::Sqlite,
        }
    }

    /// Rewrites a `?` placeholder SQL template into the dialect's actual
    /// placeholder syntax: `$N` for postgres, `?N` is not needed for
    /// sqlite (sqlx accepts bare `?`), so sqlite passes the template
    /// through unchanged.
    pub fn rewrite_placeholders(&self, template: &str) -> String {
        match self {
            Store::Postgres(_) => {
                let mut out = String::with_capacity(template.len() + 8);
                let mut n = 0usize;
                for ch in template.chars() {
                    if ch == '?' {
                        n += 1;
                        out.push('$');
                        out.push_str(&n.to_string());
                    } else {
                        out.push(ch);
                    }
                }
                out
            }
            Store::Sqlite(_) => template.to_string(),
        }
    }

    pub async fn query_rows(&self, sql: &str, params: &[BindValue]) -> Result<Vec<Value>, AppError> {
        let sql = self.rewrite_placeholders(sql);
        match self {
            Store::Postgres(pool) => {
                let mut query = sqlx::query(&sql);
                for param in params {
                    query = bind_postgres(query, param);
                }
                let rows = query.fetch_all(pool).await.map_err(map_sqlx_error)?;
                Ok(rows
                    .into_iter()
                    .map(|row| row_to_json_postgres(&row))
                    .collect())
            }
            Store::Sqlite(pool) => {
                let mut query = sqlx::query(&sql);
                for param in params {
                    query = bind_sqlite(query, param);
                }
                let rows = query.fetch_all(pool).await.map_err(map_sqlx_error)?;
                Ok(rows
                    .into_iter()
                    .map(|row| row_to_json_sqlite(&row))
                    .collect())
            }
        }
    }

    pub async fn query_row(&self, sql: &str, params: &[BindValue]) -> Result<Option<Value>, AppError> {
        let sql = self.rewrite_placeholders(sql);
        match self {
            Store::Postgres(pool) => {
                let mut query = sqlx::query(&sql);
                for param in params {
                    query = bind_postgres(query, param);
                }
                let row = query.fetch_optional(pool).await.map_err(map_sqlx_error)?;
                Ok(row.map(|row| row_to_json_postgres(&row)))
            }
            Store::Sqlite(pool) => {
                let mut query = sqlx::query(&sql);
                for param in params {
                    query = bind_sqlite(query, param);
                }
                let row = query.fetch_optional(pool).await.map_err(map_sqlx_error)?;
                Ok(row.map(|row| row_to_json_sqlite(&row)))
            }
        }
    }

    pub async fn exec(&self, sql: &str, params: &[BindValue]) -> Result<u64, AppError> {
        let sql = self.rewrite_placeholders(sql);
        match self {
            Store::Postgres(pool) => {
                let mut query = sqlx::query(&sql);
                for param in params {
                    query = bind_postgres(query, param);
                }
                let result = query.execute(pool).await.map_err(map_sqlx_error)?;
                Ok(result.rows_affected())
            }
            Store::Sqlite(pool) => {
                let mut query = sqlx::query(&sql);
                for param in params {
                    query = bind_sqlite(query, param);
                }
                let result = query.execute(pool).await.map_err(map_sqlx_error)?;
                Ok(result.rows_affected())
            }
        }
    }

    pub async fn exec_ddl(&self, sql: &str) -> Result<(), AppError> {
        match self {
            Store::Postgres(pool) => {
                sqlx::query(sql).execute(pool).await.map_err(map_sqlx_error)?;
            }
            Store::Sqlite(pool) => {
                sqlx::query(sql).execute(pool).await.map_err(map_sqlx_error)?;
            }
        }
        Ok(())
    }

    /// Opens a transaction for the nested-write executor (spec §4.5: the
    /// whole write graph commits or rolls back as one unit). `sqlx`'s pool
    /// hands back an owned `'static` transaction, so `StoreTx` can be held
    /// across `.await` points without borrowing `Store`.
    pub async fn begin(&self) -> Result<StoreTx, AppError> {
        match self {
            Store::Postgres(pool) => Ok(StoreTx::Postgres(pool.begin().await.map_err(map_sqlx_error)?)),
            Store::Sqlite(pool) => Ok(StoreTx::Sqlite(pool.begin().await.map_err(map_sqlx_error)?)),
        }
    }
}

/// An open transaction, mirroring `Store`'s query surface. Held by the
/// nested-write executor for the lifetime of one request.
pub enum StoreTx {
    Postgres(sqlx::Transaction<'static, sqlx::Postgres>),
    Sqlite(sqlx::Transaction<'static, sqlx::Sqlite>),
}

impl StoreTx {
    pub fn dialect(&self) -> Dialect {
        match self {
            StoreTx::Postgres(_) => Dialect::Postgres,
            StoreTx::Sqlite(_) => Dialect::Sqlite,
        }
    }

    fn rewrite_placeholders(&self, template: &str) -> String {
        match self {
            StoreTx::Postgres(_) => {
                let mut out = String::with_capacity(template.len() + 8);
                let mut n = 0usize;
                for ch in template.chars() {
                    if ch == '?' {
                        n += 1;
                        out.push('$');
                        out.push_str(&n.to_string());
                    } else {
                        out.push(ch);
                    }
                }
                out
            }
            StoreTx::Sqlite(_) => template.to_string(),
        }
    }

    pub async fn query_rows(&mut self, sql: &str, params: &[BindValue]) -> Result<Vec<Value>, AppError> {
        let sql = self.rewrite_placeholders(sql);
        match self {
            StoreTx::Postgres(tx) => {
                let mut query = sqlx::query(&sql);
                for param in params {
                    query = bind_postgres(query, param);
                }
                let rows = query.fetch_all(&mut **tx).await.map_err(map_sqlx_error)?;
                Ok(rows.into_iter().map(|row| row_to_json_postgres(&row)).collect())
            }
            StoreTx::Sqlite(tx) => {
                let mut query = sqlx::query(&sql);
                for param in params {
                    query = bind_sqlite(query, param);
                }
                let rows = query.fetch_all(&mut **tx).await.map_err(map_sqlx_error)?;
                Ok(rows.into_iter().map(|row| row_to_json_sqlite(&row)).collect())
            }
        }
    }

    pub async fn query_row(&mut self, sql: &str, params: &[BindValue]) -> Result<Option<Value>, AppError> {
        let sql = self.rewrite_placeholders(sql);
        match self {
            StoreTx::Postgres(tx) => {
                let mut query = sqlx::query(&sql);
                for param in params {
                    query = bind_postgres(query, param);
                }
                let row = query.fetch_optional(&mut **tx).await.map_err(map_sqlx_error)?;
                Ok(row.map(|row| row_to_json_postgres(&row)))
            }
            StoreTx::Sqlite(tx) => {
                let mut query = sqlx::query(&sql);
                for param in params {
                    query = bind_sqlite(query, param);
                }
                let row = query.fetch_optional(&mut **tx).await.map_err(map_sqlx_error)?;
                Ok(row.map(|row| row_to_json_sqlite(&row)))
            }
        }
    }

    pub async fn exec(&mut self, sql: &str, params: &[BindValue]) -> Result<u64, AppError> {
        let sql = self.rewrite_placeholders(sql);
        match self {
            StoreTx::Postgres(tx) => {
                let mut query = sqlx::query(&sql);
                for param in params {
                    query = bind_postgres(query, param);
                }
                let result = query.execute(&mut **tx).await.map_err(map_sqlx_error)?;
                Ok(result.rows_affected())
            }
            StoreTx::Sqlite(tx) => {
                let mut query = sqlx::query(&sql);
                for param in params {
                    query = bind_sqlite(query, param);
                }
                let result = query.execute(&mut **tx).await.map_err(map_sqlx_error)?;
                Ok(result.rows_affected())
            }
        }
    }

    pub async fn commit(self) -> Result<(), AppError> {
        match self {
            StoreTx::Postgres(tx) => tx.commit().await.map_err(map_sqlx_error),
            StoreTx::Sqlite(tx) => tx.commit().await.map_err(map_sqlx_error),
        }
    }

    pub async fn rollback(self) -> Result<(), AppError> {
        match self {
            StoreTx::Postgres(tx) => tx.rollback().await.map_err(map_sqlx_error),
            StoreTx::Sqlite(tx) => tx.rollback().await.map_err(map_sqlx_error),
        }
    }
}

/// Infer the tightest `BindValue` for a JSON scalar, consulting the column
/// name for uuid/date/timestamp heuristics the way
/// `table_service::infer_scalar_filter` does.
pub fn infer_scalar(column: &str, value: &Value) -> BindValue {
    match value {
        Value::Null => BindValue::Null,
        Value::Bool(flag) => BindValue::Bool(*flag),
        Value::Number(number) => {
            if let Some(i) = number.as_i64() {
                BindValue::I64(i)
            } else if let Some(f) = number.as_f64() {
                BindValue::F64(f)
            } else {
                BindValue::Text(number.to_string())
            }
        }
        Value::String(text) => {
            let trimmed = text.trim();
            if is_uuid_column(column) {
                if let Ok(parsed) = Uuid::parse_str(trimmed) {
                    return BindValue::Uuid(parsed);
                }
            }
            if is_timestamp_column(column) {
                if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
                    return BindValue::Timestamp(parsed.with_timezone(&Utc));
                }
            }
            if is_date_column(column) {
                if let Ok(parsed) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
                    return BindValue::Date(parsed);
                }
            }
            BindValue::Text(text.clone())
        }
        Value::Array(_) | Value::Object(_) => BindValue::Json(value.clone()),
    }
}

pub fn is_uuid_column(column: &str) -> bool {
    column == "id" || column.ends_with("_id")
}

pub fn is_timestamp_column(column: &str) -> bool {
    column.ends_with("_at")
}

pub fn is_date_column(column: &str) -> bool {
    column.ends_with("_date") || column.ends_with("_on")
}

fn bind_postgres<'q>(
    query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    value: &'q BindValue,
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    match value {
        BindValue::Null => query.bind(None::<String>),
        BindValue::Text(text) => query.bind(text),
        BindValue::Uuid(id) => query.bind(id),
        BindValue::Bool(flag) => query.bind(flag),
        BindValue::I64(number) => query.bind(number),
        BindValue::F64(number) => query.bind(number),
        BindValue::Date(date) => query.bind(date),
        BindValue::Timestamp(ts) => query.bind(ts),
        BindValue::Json(json) => query.bind(json),
        BindValue::TextArray(items) => query.bind(items),
    }
}

fn bind_sqlite<'q>(
    query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    value: &'q BindValue,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    match value {
        BindValue::Null => query.bind(None::<String>),
        BindValue::Text(text) => query.bind(text),
        BindValue::Uuid(id) => query.bind(id.to_string()),
        BindValue::Bool(flag) => query.bind(if *flag { 1_i64 } else { 0_i64 }),
        BindValue::I64(number) => query.bind(number),
        BindValue::F64(number) => query.bind(number),
        BindValue::Date(date) => query.bind(date.format("%Y-%m-%d").to_string()),
        BindValue::Timestamp(ts) => query.bind(ts.to_rfc3339()),
        BindValue::Json(json) => query.bind(json.to_string()),
        BindValue::TextArray(items) => query.bind(serde_json::to_string(items).unwrap_or_default()),
    }
}

/// Normalize a Postgres row into a JSON object: decimals/floats pass
/// through, 16-byte UUID columns were already declared `uuid` so sqlx
/// yields a dashed string directly.
fn row_to_json_postgres(row: &sqlx::postgres::PgRow) -> Value {
    use sqlx::postgres::PgRow;
    use sqlx::Column;
    use sqlx::TypeInfo;

    let mut map = Map::new();
    for (index, column) in row.columns().iter().enumerate() {
        let name = column.name().to_string();
        let type_name = column.type_info().name().to_ascii_uppercase();
        let value = postgres_cell_to_json(row, index, &type_name);
        map.insert(name, value);
    }
    Value::Object(map)
}

fn postgres_cell_to_json(row: &sqlx::postgres::PgRow, index: usize, type_name: &str) -> Value {
    match type_name {
        "UUID" => row
            .try_get::<Option<Uuid>, _>(index)
            .ok()
            .flatten()
            .map(|id| Value::String(id.to_string()))
            .unwrap_or(Value::Null),
        "BOOL" => row
            .try_get::<Option<bool>, _>(index)
            .ok()
            .flatten()
            .map(Value::Bool)
            .unwrap_or(Value::Null),
        "INT2" | "INT4" | "INT8" => row
            .try_get::<Option<i64>, _>(index)
            .ok()
            .flatten()
            .map(|n| Value::Number(n.into()))
            .unwrap_or(Value::Null),
        "FLOAT4" | "FLOAT8" | "NUMERIC" => row
            .try_get::<Option<f64>, _>(index)
            .ok()
            .flatten()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        "TIMESTAMPTZ" | "TIMESTAMP" => row
            .try_get::<Option<DateTime<Utc>>, _>(index)
            .ok()
            .flatten()
            .map(|ts| Value::String(ts.to_rfc3339()))
            .unwrap_or(Value::Null),
        "DATE" => row
            .try_get::<Option<NaiveDate>, _>(index)
            .ok()
            .flatten()
            .map(|d| Value::String(d.to_string()))
            .unwrap_or(Value::Null),
        "JSON" | "JSONB" => row
            .try_get::<Option<Value>, _>(index)
            .ok()
            .flatten()
            .unwrap_or(Value::Null),
        _ => row
            .try_get::<Option<String>, _>(index)
            .ok()
            .flatten()
            .map(Value::String)
            .unwrap_or(Value::Null),
    }
}

/// Normalize a SQLite row: integer 0/1 cannot be told apart from real
/// integers at the driver level, so boolean widening only happens where
/// the caller already knows the column is boolean (query planner passes
/// that through the entity's field type, not here). JSON TEXT starting
/// with `{`/`[` is opportunistically decoded.
fn row_to_json_sqlite(row: &sqlx::sqlite::SqliteRow) -> Value {
    use sqlx::sqlite::SqliteRow;
    use sqlx::Column;

    let _ = SqliteRow::columns;
    let mut map = Map::new();
    for (index, column) in row.columns().iter().enumerate() {
        let name = column.name().to_string();
        let value = sqlite_cell_to_json(row, index);
        map.insert(name, value);
    }
    Value::Object(map)
}

fn sqlite_cell_to_json(row: &sqlx::sqlite::SqliteRow, index: usize) -> Value {
    if let Ok(Some(i)) = row.try_get::<Option<i64>, _>(index) {
        return Value::Number(i.into());
    }
    if let Ok(Some(f)) = row.try_get::<Option<f64>, _>(index) {
        return serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null);
    }
    if let Ok(Some(text)) = row.try_get::<Option<String>, _>(index) {
        let trimmed = text.trim_start();
        if trimmed.starts_with('{') || trimmed.starts_with('[') {
            if let Ok(parsed) = serde_json::from_str::<Value>(&text) {
                return parsed;
            }
        }
        return Value::String(text);
    }
    Value::Null
}

/// SQLite boolean widening: fields the caller has marked boolean get their
/// 0/1 integer value converted in place after row normalization.
pub fn widen_booleans(record: &mut Value, boolean_fields: &[&str]) {
    if let Some(obj) = record.as_object_mut() {
        for field in boolean_fields {
            if let Some(existing) = obj.get(*field).cloned() {
                if let Some(n) = existing.as_i64() {
                    obj.insert((*field).to_string(), Value::Bool(n != 0));
                }
            }
        }
    }
}

pub fn map_sqlx_error(error: sqlx::Error) -> AppError {
    let message = error.to_string();
    tracing::error!(db_error = %message, "database query failed");

    let is_unique_violation = match &error {
        sqlx::Error::Database(db_error) => {
            db_error.code().as_deref() == Some("23505")
                || message.to_ascii_lowercase().contains("unique constraint failed")
        }
        _ => false,
    };

    if is_unique_violation {
        return AppError::Conflict("Duplicate value violates a unique constraint.".to_string());
    }
    AppError::Internal("Database operation failed.".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_and_timestamp_columns_detected_by_name() {
        assert!(is_uuid_column("id"));
        assert!(is_uuid_column("organization_id"));
        assert!(!is_uuid_column("name"));
        assert!(is_timestamp_column("created_at"));
        assert!(is_date_column("period_end_on") || is_date_column("available_date"));
    }

    #[test]
    fn infer_scalar_picks_uuid_over_text_for_id_columns() {
        let value = Value::String("550e8400-e29b-41d4-a716-446655440000".to_string());
        match infer_scalar("id", &value) {
            BindValue::Uuid(_) => {}
            other => panic!("expected Uuid, got {other:?}"),
        }
    }

    #[test]
    fn infer_scalar_falls_back_to_text_for_non_uuid_strings() {
        match infer_scalar("name", &Value::String("Acme".to_string())) {
            BindValue::Text(text) => assert_eq!(text, "Acme"),
            other => panic!("expected Text, got {other:?}"),
        }
    }
}
