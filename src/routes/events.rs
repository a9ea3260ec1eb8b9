//! Observability surface (spec §4.11, §6): emit a business event,
//! filterable event list, trace waterfall, and aggregate stats.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::auth::CurrentUser;
use crate::error::AppResult;
use crate::instrument::percentile_from_sorted;
use crate::state::AppState;
use crate::store::BindValue;

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route("/api/{app}/_events", axum::routing::get(list_events).post(emit_event))
        .route("/api/{app}/_events/trace/{trace_id}", axum::routing::get(trace_waterfall))
        .route("/api/{app}/_events/stats", axum::routing::get(stats))
}

async fn emit_event(
    State(state): State<AppState>,
    Path(_app): Path<String>,
    user: CurrentUser,
    Json(payload): Json<Value>,
) -> AppResult<impl IntoResponse> {
    let trace_id = payload
        .get("trace_id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let component = payload.get("component").and_then(Value::as_str).unwrap_or("business").to_string();
    let action = payload
        .get("action")
        .and_then(Value::as_str)
        .unwrap_or("event")
        .to_string();
    let entity = payload.get("entity").and_then(Value::as_str).map(str::to_string);
    let record_id = payload.get("record_id").and_then(Value::as_str).map(str::to_string);
    let metadata = payload.get("metadata").cloned().unwrap_or(Value::Object(Default::default()));

    let sql = "INSERT INTO _events \
        (id, trace_id, span_id, parent_span_id, event_type, source, component, action, entity, record_id, user_id, duration_ms, status, metadata, created_at) \
        VALUES (?, ?, ?, NULL, 'business', 'engine', ?, ?, ?, ?, ?, NULL, 'ok', ?, ?)";
    let params = vec![
        BindValue::Uuid(Uuid::new_v4()),
        BindValue::Text(trace_id.clone()),
        BindValue::Text(Uuid::new_v4().to_string()),
        BindValue::Text(component),
        BindValue::Text(action),
        entity.map(BindValue::Text).unwrap_or(BindValue::Null),
        record_id.map(BindValue::Text).unwrap_or(BindValue::Null),
        BindValue::Text(user.id.clone()),
        BindValue::Json(metadata),
        BindValue::Timestamp(chrono::Utc::now()),
    ];
    state.store.exec(sql, &params).await?;

    Ok((StatusCode::CREATED, Json(json!({ "data": { "trace_id": trace_id } }))))
}

async fn list_events(
    State(state): State<AppState>,
    Path(_app): Path<String>,
    Query(raw_query): Query<Vec<(String, String)>>,
    _user: CurrentUser,
) -> AppResult<Json<Value>> {
    let mut conditions = Vec::new();
    let mut params = Vec::new();
    for (key, value) in &raw_query {
        match key.as_str() {
            "entity" => {
                conditions.push("entity = ?".to_string());
                params.push(BindValue::Text(value.clone()));
            }
            "source" => {
                conditions.push("source = ?".to_string());
                params.push(BindValue::Text(value.clone()));
            }
            "status" => {
                conditions.push("status = ?".to_string());
                params.push(BindValue::Text(value.clone()));
            }
            "record_id" => {
                conditions.push("record_id = ?".to_string());
                params.push(BindValue::Text(value.clone()));
            }
            _ => {}
        }
    }

    let where_clause = if conditions.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", conditions.join(" AND "))
    };
    let sql = format!("SELECT * FROM _events {where_clause} ORDER BY created_at DESC LIMIT 200");
    let rows = state.store.query_rows(&sql, &params).await?;
    Ok(Json(json!({ "data": rows })))
}

/// Returns the span tree for a trace: the root is the HTTP span whose
/// `duration_ms` is the trace's `total_duration_ms` (spec §7 worked
/// example).
async fn trace_waterfall(
    State(state): State<AppState>,
    Path((_app, trace_id)): Path<(String, String)>,
    _user: CurrentUser,
) -> AppResult<Json<Value>> {
    let rows = state
        .store
        .query_rows(
            "SELECT * FROM _events WHERE trace_id = ? ORDER BY created_at ASC",
            &[BindValue::Text(trace_id.clone())],
        )
        .await?;

    let total_duration_ms = rows
        .iter()
        .find(|row| row.get("parent_span_id").map(Value::is_null).unwrap_or(true))
        .and_then(|row| row.get("duration_ms"))
        .and_then(Value::as_i64)
        .unwrap_or(0);

    Ok(Json(json!({
        "data": { "trace_id": trace_id, "total_duration_ms": total_duration_ms, "spans": rows },
    })))
}

/// Aggregate counts/avg/p95 over a queried window (spec §3, §4.11):
/// uses the dialect's native percentile when available, otherwise
/// fetches sorted durations and computes it in code.
async fn stats(
    State(state): State<AppState>,
    Path(_app): Path<String>,
    Query(raw_query): Query<Vec<(String, String)>>,
    _user: CurrentUser,
) -> AppResult<Json<Value>> {
    let mut conditions = Vec::new();
    let mut params = Vec::new();
    for (key, value) in &raw_query {
        if key == "entity" {
            conditions.push("entity = ?".to_string());
            params.push(BindValue::Text(value.clone()));
        }
        if key == "component" {
            conditions.push("component = ?".to_string());
            params.push(BindValue::Text(value.clone()));
        }
    }
    let where_clause = if conditions.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", conditions.join(" AND "))
    };

    let totals_sql = format!(
        "SELECT COUNT(*) AS total, \
         SUM(CASE WHEN status = 'error' THEN 1 ELSE 0 END) AS error_count, \
         AVG(duration_ms) AS avg_duration_ms \
         FROM _events {where_clause}"
    );
    let totals = state
        .store
        .query_row(&totals_sql, &params)
        .await?
        .unwrap_or(Value::Object(Default::default()));

    let p95 = if state.store.dialect().supports_percentile() {
        let sql = format!(
            "SELECT PERCENTILE_CONT(0.95) WITHIN GROUP (ORDER BY duration_ms) AS p95 FROM _events {where_clause}"
        );
        state
            .store
            .query_row(&sql, &params)
            .await?
            .and_then(|row| row.get("p95").and_then(Value::as_f64))
            .map(|value| value as i64)
    } else {
        let sql = format!("SELECT duration_ms FROM _events {where_clause} ORDER BY duration_ms ASC");
        let rows = state.store.query_rows(&sql, &params).await?;
        let durations: Vec<i64> = rows
            .iter()
            .filter_map(|row| row.get("duration_ms").and_then(Value::as_i64))
            .collect();
        percentile_from_sorted(&durations, 95.0)
    };

    Ok(Json(json!({
        "data": {
            "total": totals.get("total").cloned().unwrap_or(Value::Number(0.into())),
            "error_count": totals.get("error_count").cloned().unwrap_or(Value::Number(0.into())),
            "avg_duration_ms": totals.get("avg_duration_ms").cloned().unwrap_or(Value::Null),
            "p95_duration_ms": p95,
        }
    })))
}
