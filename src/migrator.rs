//! Idempotent DDL: catalog bootstrap plus per-entity `CREATE`/`ALTER TABLE`
//! (spec §4.3). Every statement here is safe to re-run.

use crate::config::Dialect;
use crate::error::AppResult;
use crate::registry::model::{EntityDef, FieldType, RelationDef};
use crate::store::Store;

/// The `_`-prefixed management tables spec §6 names verbatim. Created once
/// at startup, before the registry's first load.
pub async fn ensure_catalog_tables(store: &Store) -> AppResult<()> {
    let json_type = json_column_type(store.dialect());
    let pk = uuid_primary_key(store.dialect());
    let now_default = now_default(store.dialect());

    let statements = vec![
        format!(
            "CREATE TABLE IF NOT EXISTS _entities (\
                name TEXT PRIMARY KEY, table_name TEXT NOT NULL, definition {json_type} NOT NULL, \
                created_at TIMESTAMP NOT NULL DEFAULT {now_default}, updated_at TIMESTAMP NOT NULL DEFAULT {now_default})"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS _relations (\
                name TEXT PRIMARY KEY, source TEXT NOT NULL, target TEXT NOT NULL, definition {json_type} NOT NULL, \
                created_at TIMESTAMP NOT NULL DEFAULT {now_default}, updated_at TIMESTAMP NOT NULL DEFAULT {now_default})"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS _rules (\
                id {pk}, entity TEXT NOT NULL, hook TEXT NOT NULL, type TEXT NOT NULL, definition {json_type} NOT NULL, \
                priority INT NOT NULL DEFAULT 0, active BOOLEAN NOT NULL DEFAULT true, \
                created_at TIMESTAMP NOT NULL DEFAULT {now_default}, updated_at TIMESTAMP NOT NULL DEFAULT {now_default})"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS _state_machines (\
                id {pk}, entity TEXT NOT NULL, field TEXT NOT NULL, definition {json_type} NOT NULL, \
                active BOOLEAN NOT NULL DEFAULT true, \
                created_at TIMESTAMP NOT NULL DEFAULT {now_default}, updated_at TIMESTAMP NOT NULL DEFAULT {now_default})"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS _workflows (\
                id {pk}, name TEXT NOT NULL UNIQUE, trigger {json_type} NOT NULL, context {json_type} NOT NULL, \
                steps {json_type} NOT NULL, active BOOLEAN NOT NULL DEFAULT true, \
                created_at TIMESTAMP NOT NULL DEFAULT {now_default}, updated_at TIMESTAMP NOT NULL DEFAULT {now_default})"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS _workflow_instances (\
                id {pk}, workflow_name TEXT NOT NULL, status TEXT NOT NULL, current_step TEXT NOT NULL, \
                current_step_deadline TIMESTAMP, context {json_type} NOT NULL, history {json_type} NOT NULL, \
                created_at TIMESTAMP NOT NULL DEFAULT {now_default}, updated_at TIMESTAMP NOT NULL DEFAULT {now_default})"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS _permissions (\
                id {pk}, entity TEXT NOT NULL, action TEXT NOT NULL, roles {json_type} NOT NULL, \
                conditions {json_type} NOT NULL, \
                created_at TIMESTAMP NOT NULL DEFAULT {now_default}, updated_at TIMESTAMP NOT NULL DEFAULT {now_default})"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS _webhooks (\
                id {pk}, entity TEXT NOT NULL, hook TEXT NOT NULL, url TEXT NOT NULL, method TEXT NOT NULL DEFAULT 'POST', \
                headers {json_type} NOT NULL, condition TEXT, async BOOLEAN NOT NULL DEFAULT false, \
                retry {json_type} NOT NULL, active BOOLEAN NOT NULL DEFAULT true, \
                created_at TIMESTAMP NOT NULL DEFAULT {now_default}, updated_at TIMESTAMP NOT NULL DEFAULT {now_default})"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS _webhook_logs (\
                id {pk}, webhook_id TEXT NOT NULL, entity TEXT NOT NULL, hook TEXT NOT NULL, action TEXT NOT NULL, \
                url TEXT NOT NULL, method TEXT NOT NULL, request_headers {json_type}, request_body {json_type}, \
                response_status INT, response_body TEXT, status TEXT NOT NULL, attempt INT NOT NULL DEFAULT 0, \
                max_attempts INT NOT NULL DEFAULT 5, next_retry_at TIMESTAMP, error TEXT, \
                idempotency_key TEXT NOT NULL UNIQUE, \
                created_at TIMESTAMP NOT NULL DEFAULT {now_default}, updated_at TIMESTAMP NOT NULL DEFAULT {now_default})"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS _events (\
                id {pk}, trace_id TEXT NOT NULL, span_id TEXT NOT NULL, parent_span_id TEXT, \
                event_type TEXT NOT NULL, source TEXT NOT NULL, component TEXT NOT NULL, action TEXT NOT NULL, \
                entity TEXT, record_id TEXT, user_id TEXT, duration_ms BIGINT, status TEXT NOT NULL, \
                metadata {json_type} NOT NULL, created_at TIMESTAMP NOT NULL DEFAULT {now_default})"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS _users (\
                id {pk}, email TEXT NOT NULL UNIQUE, password_hash TEXT NOT NULL, roles {json_type} NOT NULL, \
                active BOOLEAN NOT NULL DEFAULT true, \
                created_at TIMESTAMP NOT NULL DEFAULT {now_default}, updated_at TIMESTAMP NOT NULL DEFAULT {now_default})"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS _refresh_tokens (\
                id {pk}, user_id TEXT NOT NULL, token TEXT NOT NULL UNIQUE, expires_at TIMESTAMP NOT NULL, \
                created_at TIMESTAMP NOT NULL DEFAULT {now_default})"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS _files (\
                id {pk}, filename TEXT NOT NULL, storage_path TEXT NOT NULL, mime_type TEXT, size BIGINT, \
                uploaded_by TEXT, created_at TIMESTAMP NOT NULL DEFAULT {now_default})"
        ),
        "CREATE TABLE IF NOT EXISTS _audit_logs (\
            id TEXT PRIMARY KEY, organization_scope TEXT, actor_user_id TEXT, action TEXT NOT NULL, \
            entity TEXT NOT NULL, entity_id TEXT, before TEXT, after TEXT, created_at TEXT NOT NULL)"
            .to_string(),
    ];

    for statement in statements {
        store.exec_ddl(&statement).await?;
    }
    Ok(())
}

/// `migrate(entity)` (spec §4.3): create the table if absent, otherwise
/// diff columns and `ALTER TABLE ADD COLUMN` whatever is missing.
pub async fn migrate_entity(store: &Store, entity: &EntityDef) -> AppResult<()> {
    if !table_exists(store, &entity.table).await? {
        create_entity_table(store, entity).await?;
    } else {
        reconcile_columns(store, entity).await?;
    }

    for field in &entity.fields {
        if field.unique {
            let index_name = format!("ux_{}_{}", entity.table, field.name);
            let sql = format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS {index_name} ON {} ({})",
                entity.table, field.name
            );
            store.exec_ddl(&sql).await?;
        }
    }

    if entity.soft_delete {
        let index_name = format!("ix_{}_deleted_at", entity.table);
        let sql = soft_delete_index_sql(store.dialect(), &index_name, &entity.table);
        store.exec_ddl(&sql).await?;
    }

    Ok(())
}

/// `migrate_join_table(relation)`: composite-PK join table for M:N edges.
pub async fn migrate_join_table(store: &Store, relation: &RelationDef) -> AppResult<()> {
    let Some(join_table) = &relation.join_table else {
        return Ok(());
    };
    let source_join_key = relation
        .source_join_key
        .as_deref()
        .unwrap_or("source_id");
    let target_join_key = relation
        .target_join_key
        .as_deref()
        .unwrap_or("target_id");

    let uuid_type = column_type(store.dialect(), FieldType::Uuid, None);
    let sql = format!(
        "CREATE TABLE IF NOT EXISTS {join_table} (\
            {source_join_key} {uuid_type} NOT NULL, {target_join_key} {uuid_type} NOT NULL, \
            PRIMARY KEY ({source_join_key}, {target_join_key}))"
    );
    store.exec_ddl(&sql).await?;
    Ok(())
}

async fn table_exists(store: &Store, table: &str) -> AppResult<bool> {
    let sql = match store.dialect() {
        Dialect::Postgres => "SELECT 1 FROM information_schema.tables WHERE table_name = ?",
        Dialect::Sqlite => "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?",
    };
    let params = vec![crate::store::BindValue::Text(table.to_string())];
    Ok(store.query_row(sql, &params).await?.is_some())
}

async fn existing_columns(store: &Store, table: &str) -> AppResult<Vec<String>> {
    let sql = match store.dialect() {
        Dialect::Postgres => "SELECT column_name AS name FROM information_schema.columns WHERE table_name = ?",
        Dialect::Sqlite => "",
    };
    if store.dialect() == Dialect::Sqlite {
        let rows = store.query_rows(&format!("PRAGMA table_info({table})"), &[]).await?;
        return Ok(rows
            .into_iter()
            .filter_map(|row| row.get("name").and_then(|v| v.as_str()).map(ToOwned::to_owned))
            .collect());
    }
    let params = vec![crate::store::BindValue::Text(table.to_string())];
    let rows = store.query_rows(sql, &params).await?;
    Ok(rows
        .into_iter()
        .filter_map(|row| row.get("name").and_then(|v| v.as_str()).map(ToOwned::to_owned))
        .collect())
}

async fn create_entity_table(store: &Store, entity: &EntityDef) -> AppResult<()> {
    let mut columns = Vec::new();

    let pk_type = column_type(store.dialect(), pk_field_type(entity), None);
    let pk_default = if entity.primary_key.generated {
        format!(" DEFAULT {}", uuid_default(store.dialect()))
    } else {
        String::new()
    };
    columns.push(format!(
        "{} {}{} PRIMARY KEY",
        entity.primary_key.field, pk_type, pk_default
    ));

    for field in &entity.fields {
        if field.name == entity.primary_key.field {
            continue;
        }
        let sql_type = column_type(store.dialect(), field.field_type, field.precision);
        let mut column = format!("{} {}", field.name, sql_type);
        if field.required && !field.nullable {
            column.push_str(" NOT NULL");
        }
        if let Some(default) = &field.default {
            column.push_str(&format!(" DEFAULT {}", default_literal(default)));
        }
        columns.push(column);
    }

    if entity.soft_delete {
        columns.push("deleted_at TIMESTAMP".to_string());
    }

    let sql = format!("CREATE TABLE {} ({})", entity.table, columns.join(", "));
    store.exec_ddl(&sql).await?;
    Ok(())
}

/// Required non-nullable additions get a default so the `ALTER TABLE` stays
/// backward-compatible with existing rows (spec §4.3).
async fn reconcile_columns(store: &Store, entity: &EntityDef) -> AppResult<()> {
    let existing = existing_columns(store, &entity.table).await?;
    let mut missing_fields: Vec<&crate::registry::model::Field> = entity
        .fields
        .iter()
        .filter(|field| field.name != entity.primary_key.field && !existing.contains(&field.name))
        .collect();

    if entity.soft_delete && !existing.iter().any(|name| name == "deleted_at") {
        let sql = format!("ALTER TABLE {} ADD COLUMN deleted_at TIMESTAMP", entity.table);
        store.exec_ddl(&sql).await?;
    }

    missing_fields.sort_by_key(|field| field.name.clone());
    for field in missing_fields {
        let sql_type = column_type(store.dialect(), field.field_type, field.precision);
        let mut column = format!("ALTER TABLE {} ADD COLUMN {} {}", entity.table, field.name, sql_type);
        if field.required && !field.nullable {
            let default = field
                .default
                .as_ref()
                .map(default_literal)
                .unwrap_or_else(|| default_literal_for_type(field.field_type));
            column.push_str(&format!(" NOT NULL DEFAULT {default}"));
        } else if let Some(default) = &field.default {
            column.push_str(&format!(" DEFAULT {}", default_literal(default)));
        }
        store.exec_ddl(&column).await?;
    }
    Ok(())
}

fn pk_field_type(entity: &EntityDef) -> FieldType {
    match entity.primary_key.key_type {
        crate::registry::model::PrimaryKeyType::Uuid => FieldType::Uuid,
        crate::registry::model::PrimaryKeyType::Int => FieldType::Int,
        crate::registry::model::PrimaryKeyType::Bigint => FieldType::Bigint,
        crate::registry::model::PrimaryKeyType::String => FieldType::String,
    }
}

fn default_literal(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(text) => format!("'{}'", text.replace('\'', "''")),
        serde_json::Value::Bool(flag) => flag.to_string(),
        serde_json::Value::Number(number) => number.to_string(),
        serde_json::Value::Null => "NULL".to_string(),
        other => format!("'{}'", other.to_string().replace('\'', "''")),
    }
}

fn default_literal_for_type(field_type: FieldType) -> String {
    match field_type {
        FieldType::String | FieldType::Text | FieldType::Uuid | FieldType::File => "''".to_string(),
        FieldType::Int | FieldType::Bigint => "0".to_string(),
        FieldType::Float | FieldType::Decimal => "0".to_string(),
        FieldType::Boolean => "false".to_string(),
        FieldType::Timestamp | FieldType::Date => "CURRENT_TIMESTAMP".to_string(),
        FieldType::Json => "'{}'".to_string(),
    }
}

/// `column_type(field_type, precision)` dialect capability (spec §4.2).
pub fn column_type(dialect: Dialect, field_type: FieldType, precision: Option<u32>) -> String {
    match (dialect, field_type) {
        (Dialect::Postgres, FieldType::String) => "VARCHAR(255)".to_string(),
        (Dialect::Postgres, FieldType::Text) => "TEXT".to_string(),
        (Dialect::Postgres, FieldType::Int) => "INTEGER".to_string(),
        (Dialect::Postgres, FieldType::Bigint) => "BIGINT".to_string(),
        (Dialect::Postgres, FieldType::Float) => "DOUBLE PRECISION".to_string(),
        (Dialect::Postgres, FieldType::Decimal) => {
            format!("NUMERIC(18,{})", precision.unwrap_or(2))
        }
        (Dialect::Postgres, FieldType::Boolean) => "BOOLEAN".to_string(),
        (Dialect::Postgres, FieldType::Uuid) => "UUID".to_string(),
        (Dialect::Postgres, FieldType::Timestamp) => "TIMESTAMPTZ".to_string(),
        (Dialect::Postgres, FieldType::Date) => "DATE".to_string(),
        (Dialect::Postgres, FieldType::Json) => "JSONB".to_string(),
        (Dialect::Postgres, FieldType::File) => "TEXT".to_string(),

        (Dialect::Sqlite, FieldType::Int) => "INTEGER".to_string(),
        (Dialect::Sqlite, FieldType::Bigint) => "INTEGER".to_string(),
        (Dialect::Sqlite, FieldType::Float) => "REAL".to_string(),
        (Dialect::Sqlite, FieldType::Decimal) => "REAL".to_string(),
        (Dialect::Sqlite, FieldType::Boolean) => "INTEGER".to_string(),
        (Dialect::Sqlite, FieldType::Timestamp) => "TEXT".to_string(),
        (Dialect::Sqlite, FieldType::Date) => "TEXT".to_string(),
        (Dialect::Sqlite, FieldType::Json) => "TEXT".to_string(),
        (Dialect::Sqlite, _) => "TEXT".to_string(),
    }
}

fn json_column_type(dialect: Dialect) -> &'static str {
    match dialect {
        Dialect::Postgres => "JSONB",
        Dialect::Sqlite => "TEXT",
    }
}

fn uuid_primary_key(dialect: Dialect) -> String {
    match dialect {
        Dialect::Postgres => format!("id UUID PRIMARY KEY DEFAULT {}", uuid_default(dialect)),
        Dialect::Sqlite => "id TEXT PRIMARY KEY".to_string(),
    }
}

/// `uuid_default()` dialect capability.
pub fn uuid_default(dialect: Dialect) -> &'static str {
    match dialect {
        Dialect::Postgres => "gen_random_uuid()",
        Dialect::Sqlite => "(lower(hex(randomblob(16))))",
    }
}

fn now_default(dialect: Dialect) -> &'static str {
    match dialect {
        Dialect::Postgres => "now()",
        Dialect::Sqlite => "CURRENT_TIMESTAMP",
    }
}

/// `soft_delete_index_sql(table)` dialect capability: a partial index on
/// Postgres, a plain index on SQLite (no partial-index predicate support
/// for `IS NULL` filtering pre-3.8 builds some deployments still run).
pub fn soft_delete_index_sql(dialect: Dialect, index_name: &str, table: &str) -> String {
    match dialect {
        Dialect::Postgres => format!(
            "CREATE INDEX IF NOT EXISTS {index_name} ON {table} (deleted_at) WHERE deleted_at IS NULL"
        ),
        Dialect::Sqlite => format!("CREATE INDEX IF NOT EXISTS {index_name} ON {table} (deleted_at)"),
    }
}

/// `supports_percentile?` dialect capability (spec §4.2, §4.11).
pub fn supports_percentile(dialect: Dialect) -> bool {
    matches!(dialect, Dialect::Postgres)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decimal_type_uses_requested_precision() {
        assert_eq!(
            column_type(Dialect::Postgres, FieldType::Decimal, Some(4)),
            "NUMERIC(18,4)"
        );
    }

    #[test]
    fn sqlite_has_no_native_boolean() {
        assert_eq!(column_type(Dialect::Sqlite, FieldType::Boolean, None), "INTEGER");
    }

    #[test]
    fn soft_delete_index_is_partial_on_postgres_only() {
        let pg = soft_delete_index_sql(Dialect::Postgres, "ix_foo", "foo");
        assert!(pg.contains("WHERE deleted_at IS NULL"));
        let lite = soft_delete_index_sql(Dialect::Sqlite, "ix_foo", "foo");
        assert!(!lite.contains("WHERE"));
    }

    #[test]
    fn percentile_support_is_postgres_only() {
        assert!(supports_percentile(Dialect::Postgres));
        assert!(!supports_percentile(Dialect::Sqlite));
    }
}
