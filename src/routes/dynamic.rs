//! Generic CRUD surface (spec §6): `/api/{app}/{entity}` and
//! `/api/{app}/{entity}/{id}`, dispatched entirely off the registry —
//! there is exactly one handler per HTTP verb, not one per entity.

use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::{http::StatusCode, Json};
use serde_json::{json, Map, Value};

use crate::auth::CurrentUser;
use crate::error::{AppError, AppResult};
use crate::instrument::{Span, SpanSource};
use crate::permissions::{self, action_for_method};
use crate::query_planner::{self, FilterClause, FilterOperator, PermissionFilters};
use crate::registry::model::PermissionAction;
use crate::state::AppState;
use crate::write_planner::{self, Operation};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/api/{app}/{entity}",
            axum::routing::get(list_records).post(create_record),
        )
        .route(
            "/api/{app}/{entity}/{id}",
            axum::routing::get(get_record).put(update_record).delete(delete_record),
        )
}

fn resolve_entity(state: &AppState, entity_name: &str) -> AppResult<std::sync::Arc<crate::registry::model::EntityDef>> {
    state
        .registry
        .load()
        .entity(entity_name)
        .ok_or_else(|| AppError::NotFound(format!("unknown entity '{entity_name}'")))
}

/// SQLite returns boolean columns as raw 0/1 integers; widen them back to
/// JSON booleans before a row reaches a client. No-op on postgres rows,
/// which already come back as real booleans.
fn widen_row(entity: &crate::registry::model::EntityDef, row: &mut Value) {
    let boolean_fields: Vec<&str> = entity
        .fields
        .iter()
        .filter(|field| field.field_type == crate::registry::model::FieldType::Boolean)
        .map(|field| field.name.as_str())
        .collect();
    if !boolean_fields.is_empty() {
        crate::store::widen_booleans(row, &boolean_fields);
    }
}

async fn list_records(
    State(state): State<AppState>,
    Path((_app, entity_name)): Path<(String, String)>,
    Query(raw_query): Query<Vec<(String, String)>>,
    user: CurrentUser,
) -> AppResult<Json<Value>> {
    let span = Span::root(SpanSource::Http, "routes::dynamic", "list_records").with_entity(entity_name.clone());
    let entity = resolve_entity(&state, &entity_name)?;

    let parsed = query_planner::parse_query(&entity, &raw_query)?;
    let permissions = state.registry.load().permissions_for(&entity.name, PermissionAction::Read);
    let filters = permissions::read_filters(&permissions, &user)?.unwrap_or(PermissionFilters(vec![]));

    let plan = query_planner::build_plan(&entity, &parsed, &filters, user.is_admin());
    let data_sql = query_planner::data_sql(&plan);
    let count_sql = query_planner::count_sql(&plan);

    let mut rows = state.store.query_rows(&data_sql, &plan.params).await?;
    for row in &mut rows {
        widen_row(&entity, row);
    }
    let total = state
        .store
        .query_row(&count_sql, &plan.params)
        .await?
        .and_then(|row| row.get("total").and_then(Value::as_i64))
        .unwrap_or(0);

    span.close(&state.store, "ok").await.ok();

    Ok(Json(json!({
        "data": rows,
        "meta": { "page": parsed.page, "per_page": parsed.per_page, "total": total },
    })))
}

async fn get_record(
    State(state): State<AppState>,
    Path((_app, entity_name, id)): Path<(String, String, String)>,
    user: CurrentUser,
) -> AppResult<Json<Value>> {
    let entity = resolve_entity(&state, &entity_name)?;
    let mut parsed = query_planner::parse_query(&entity, &[])?;
    parsed.filters.push(FilterClause {
        field: entity.primary_key.field.clone(),
        operator: FilterOperator::Eq,
        value: Some(Value::String(id.clone())),
    });

    let permissions = state.registry.load().permissions_for(&entity.name, PermissionAction::Read);
    let filters = permissions::read_filters(&permissions, &user)?.unwrap_or(PermissionFilters(vec![]));

    let plan = query_planner::build_plan(&entity, &parsed, &filters, user.is_admin());
    let data_sql = query_planner::data_sql(&plan);
    let mut row = state
        .store
        .query_row(&data_sql, &plan.params)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("{} not found", entity.name)))?;
    widen_row(&entity, &mut row);

    Ok(Json(json!({ "data": row })))
}

async fn create_record(
    State(state): State<AppState>,
    Path((_app, entity_name)): Path<(String, String)>,
    user: CurrentUser,
    Json(payload): Json<Value>,
) -> AppResult<impl IntoResponse> {
    let entity = resolve_entity(&state, &entity_name)?;
    let object = payload
        .as_object()
        .cloned()
        .ok_or_else(|| AppError::InvalidPayload("request body must be a JSON object".to_string()))?;

    let mut record = write_planner::execute_write(&state, &entity, object, Operation::Insert, &user).await?;
    widen_row(&entity, &mut record);
    Ok((StatusCode::CREATED, Json(json!({ "data": record }))))
}

async fn update_record(
    State(state): State<AppState>,
    Path((_app, entity_name, id)): Path<(String, String, String)>,
    user: CurrentUser,
    Json(payload): Json<Value>,
) -> AppResult<Json<Value>> {
    let entity = resolve_entity(&state, &entity_name)?;
    let mut object: Map<String, Value> = payload
        .as_object()
        .cloned()
        .ok_or_else(|| AppError::InvalidPayload("request body must be a JSON object".to_string()))?;
    object.insert(entity.primary_key.field.clone(), Value::String(id));

    let mut record = write_planner::execute_write(&state, &entity, object, Operation::Update, &user).await?;
    widen_row(&entity, &mut record);
    Ok(Json(json!({ "data": record })))
}

async fn delete_record(
    State(state): State<AppState>,
    Path((_app, entity_name, id)): Path<(String, String, String)>,
    user: CurrentUser,
) -> AppResult<Json<Value>> {
    let entity = resolve_entity(&state, &entity_name)?;
    let pk_value = crate::store::infer_scalar(&entity.primary_key.field, &Value::String(id.clone()));
    let pk_json = match pk_value {
        crate::store::BindValue::Uuid(value) => Value::String(value.to_string()),
        _ => Value::String(id.clone()),
    };

    write_planner::execute_delete(&state, &entity, &pk_json, &user).await?;
    Ok(Json(json!({ "data": { "id": id } })))
}

/// Shared by both metadata admin routes and the dynamic CRUD surface: the
/// HTTP method maps to a `PermissionAction` the way spec §4.10 describes.
pub fn action_for(method: &axum::http::Method) -> PermissionAction {
    action_for_method(method.as_str())
}
