//! Metadata admin surface (spec §6): CRUD over the catalog tables plus a
//! schema export/import pair. Every write here ends with a registry
//! reload so the next request sees the change immediately (spec §4.1,
//! §9 "Global mutable state").

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::auth::CurrentUser;
use crate::error::{AppError, AppResult};
use crate::state::AppState;
use crate::store::BindValue;
use crate::validation;

const CATALOG_TABLES: &[(&str, &str)] = &[
    ("entities", "_entities"),
    ("relations", "_relations"),
    ("rules", "_rules"),
    ("state_machines", "_state_machines"),
    ("workflows", "_workflows"),
    ("permissions", "_permissions"),
    ("webhooks", "_webhooks"),
    ("webhook_logs", "_webhook_logs"),
];

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route("/_admin/{collection}", axum::routing::get(list_metadata).post(create_metadata))
        .route(
            "/_admin/{collection}/{id}",
            axum::routing::get(get_metadata).put(update_metadata).delete(delete_metadata),
        )
        .route("/_admin/schema/export", axum::routing::get(export_schema))
        .route("/_admin/schema/import", axum::routing::post(import_schema))
}

fn require_admin(user: &CurrentUser) -> AppResult<()> {
    if user.is_admin() {
        Ok(())
    } else {
        Err(AppError::Forbidden("admin role required".to_string()))
    }
}

fn resolve_table(collection: &str) -> AppResult<&'static str> {
    CATALOG_TABLES
        .iter()
        .find(|(name, _)| *name == collection)
        .map(|(_, table)| *table)
        .ok_or_else(|| AppError::NotFound(format!("unknown metadata collection '{collection}'")))
}

/// Entities/relations are keyed by name; every other catalog row by a
/// generated `id`, matching `_entities(name PK)` / `_relations(name PK)`
/// versus the `id {pk}` rows in spec §6's table list.
fn key_column(collection: &str) -> &'static str {
    match collection {
        "entities" => "name",
        "relations" => "name",
        _ => "id",
    }
}

async fn list_metadata(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    user: CurrentUser,
) -> AppResult<Json<Value>> {
    require_admin(&user)?;
    let table = resolve_table(&collection)?;
    let rows = state.store.query_rows(&format!("SELECT * FROM {table}"), &[]).await?;
    Ok(Json(json!({ "data": rows })))
}

async fn get_metadata(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
    user: CurrentUser,
) -> AppResult<Json<Value>> {
    require_admin(&user)?;
    let table = resolve_table(&collection)?;
    let key = key_column(&collection);
    let row = state
        .store
        .query_row(&format!("SELECT * FROM {table} WHERE {key} = ?"), &[BindValue::Text(id)])
        .await?
        .ok_or_else(|| AppError::NotFound(format!("{collection} row not found")))?;
    Ok(Json(json!({ "data": row })))
}

/// Inserts a catalog row by splatting the payload's flat columns plus a
/// `definition`/shape-specific JSON blob, matching how `Loader` reads rows
/// back (spec §4.1).
async fn create_metadata(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    user: CurrentUser,
    Json(payload): Json<Value>,
) -> AppResult<impl IntoResponse> {
    require_admin(&user)?;
    let table = resolve_table(&collection)?;
    validation::validate_create(&collection, &payload)?;
    let mut object = payload
        .as_object()
        .cloned()
        .ok_or_else(|| AppError::InvalidPayload("request body must be a JSON object".to_string()))?;

    let key = key_column(&collection);
    if key == "id" && !object.contains_key("id") {
        object.insert("id".to_string(), Value::String(Uuid::new_v4().to_string()));
    }

    let mut columns = Vec::with_capacity(object.len());
    let mut placeholders = Vec::with_capacity(object.len());
    let mut params = Vec::with_capacity(object.len());
    for (column, value) in &object {
        columns.push(column.clone());
        placeholders.push("?".to_string());
        params.push(crate::store::infer_scalar(column, value));
    }

    let sql = format!("INSERT INTO {table} ({}) VALUES ({}) RETURNING *", columns.join(", "), placeholders.join(", "));
    let row = state
        .store
        .query_row(&sql, &params)
        .await?
        .ok_or_else(|| AppError::Internal("insert did not return a row".to_string()))?;

    let row_id = row.get(key).and_then(Value::as_str).map(str::to_string);
    crate::audit::record(&state.store, &user.id, "create", &collection, row_id.as_deref(), None, Some(&row)).await?;

    state.reload_registry().await?;
    Ok((StatusCode::CREATED, Json(json!({ "data": row }))))
}

async fn update_metadata(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
    user: CurrentUser,
    Json(payload): Json<Value>,
) -> AppResult<Json<Value>> {
    require_admin(&user)?;
    let table = resolve_table(&collection)?;
    validation::validate_update(&collection, &payload)?;
    let key = key_column(&collection);
    let object = payload
        .as_object()
        .cloned()
        .ok_or_else(|| AppError::InvalidPayload("request body must be a JSON object".to_string()))?;

    let before = state
        .store
        .query_row(&format!("SELECT * FROM {table} WHERE {key} = ?"), &[BindValue::Text(id.clone())])
        .await?;

    let mut assignments = Vec::new();
    let mut params = Vec::new();
    for (column, value) in &object {
        if column == key {
            continue;
        }
        assignments.push(format!("{column} = ?"));
        params.push(crate::store::infer_scalar(column, value));
    }
    params.push(BindValue::Text(id.clone()));

    let sql = format!(
        "UPDATE {table} SET {} WHERE {key} = ? RETURNING *",
        assignments.join(", ")
    );
    let row = state
        .store
        .query_row(&sql, &params)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("{collection} row not found")))?;

    crate::audit::record(&state.store, &user.id, "update", &collection, Some(&id), before.as_ref(), Some(&row)).await?;

    state.reload_registry().await?;
    Ok(Json(json!({ "data": row })))
}

async fn delete_metadata(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
    user: CurrentUser,
) -> AppResult<Json<Value>> {
    require_admin(&user)?;
    let table = resolve_table(&collection)?;
    let key = key_column(&collection);
    let before = state
        .store
        .query_row(&format!("SELECT * FROM {table} WHERE {key} = ?"), &[BindValue::Text(id.clone())])
        .await?;
    state
        .store
        .exec(&format!("DELETE FROM {table} WHERE {key} = ?"), &[BindValue::Text(id.clone())])
        .await?;
    crate::audit::record(&state.store, &user.id, "delete", &collection, Some(&id), before.as_ref(), None).await?;
    state.reload_registry().await?;
    Ok(Json(json!({ "data": { "id": id } })))
}

async fn export_schema(State(state): State<AppState>, user: CurrentUser) -> AppResult<Json<Value>> {
    require_admin(&user)?;
    let mut export = serde_json::Map::new();
    for (collection, table) in CATALOG_TABLES {
        if *collection == "webhook_logs" {
            continue;
        }
        let rows = state.store.query_rows(&format!("SELECT * FROM {table}"), &[]).await?;
        export.insert((*collection).to_string(), Value::Array(rows));
    }
    Ok(Json(Value::Object(export)))
}

/// Idempotent by natural key (entity name, relation name, workflow name,
/// …) and resumes past a partial failure (spec §6). Each collection's rows
/// upsert independently; one row's failure is recorded in `errors` and
/// does not abort the rest of the import.
async fn import_schema(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(payload): Json<Value>,
) -> AppResult<Json<Value>> {
    require_admin(&user)?;
    let Some(bundle) = payload.as_object() else {
        return Err(AppError::InvalidPayload("import payload must be a JSON object".to_string()));
    };

    let mut summary = serde_json::Map::new();
    let mut errors = Vec::new();

    for (collection, table) in CATALOG_TABLES {
        if *collection == "webhook_logs" {
            continue;
        }
        let Some(rows) = bundle.get(*collection).and_then(Value::as_array) else {
            continue;
        };
        let key = key_column(collection);
        let mut inserted = 0i64;

        for row in rows {
            match upsert_catalog_row(&state, table, key, row).await {
                Ok(Upsert::Inserted) => inserted += 1,
                Ok(Upsert::Updated) => {}
                Err(error) => errors.push(format!("{collection}: {error}")),
            }
        }
        summary.insert((*collection).to_string(), Value::Number(inserted.into()));
    }

    crate::audit::record(
        &state.store,
        &user.id,
        "import",
        "schema",
        None,
        None,
        Some(&Value::Object(summary.clone())),
    )
    .await?;

    state.reload_registry().await?;

    Ok(Json(json!({ "summary": summary, "errors": errors })))
}

enum Upsert {
    Inserted,
    Updated,
}

async fn upsert_catalog_row(state: &AppState, table: &str, key: &str, row: &Value) -> AppResult<Upsert> {
    let Some(object) = row.as_object() else {
        return Err(AppError::InvalidPayload("row must be a JSON object".to_string()));
    };
    let Some(key_value) = object.get(key) else {
        return Err(AppError::InvalidPayload(format!("row is missing natural key '{key}'")));
    };

    let existing = state
        .store
        .query_row(
            &format!("SELECT {key} FROM {table} WHERE {key} = ?"),
            &[BindValue::Text(key_value.as_str().unwrap_or_default().to_string())],
        )
        .await?;

    let columns: Vec<&String> = object.keys().collect();
    if existing.is_some() {
        let assignments: Vec<String> = columns
            .iter()
            .filter(|column| column.as_str() != key)
            .map(|column| format!("{column} = ?"))
            .collect();
        let mut params: Vec<BindValue> = columns
            .iter()
            .filter(|column| column.as_str() != key)
            .map(|column| crate::store::infer_scalar(column, &object[*column]))
            .collect();
        params.push(BindValue::Text(key_value.as_str().unwrap_or_default().to_string()));
        let sql = format!("UPDATE {table} SET {} WHERE {key} = ?", assignments.join(", "));
        state.store.exec(&sql, &params).await?;
        Ok(Upsert::Updated)
    } else {
        let placeholders = vec!["?"; columns.len()].join(", ");
        let column_list: Vec<String> = columns.iter().map(|c| c.to_string()).collect();
        let params: Vec<BindValue> = columns
            .iter()
            .map(|column| crate::store::infer_scalar(column, &object[*column]))
            .collect();
        let sql = format!("INSERT INTO {table} ({}) VALUES ({placeholders})", column_list.join(", "));
        state.store.exec(&sql, &params).await?;
        Ok(Upsert::Inserted)
    }
}
