//! Workflow instance surface (spec §4.8, §6): list pending instances,
//! fetch one by id, and decide a pending approval step.

use axum::extract::{Path, State};
use axum::Json;
use serde_json::{json, Value};

use crate::auth::CurrentUser;
use crate::error::{AppError, AppResult};
use crate::state::AppState;
use crate::store::BindValue;
use crate::workflow;

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route("/api/{app}/_workflows/pending", axum::routing::get(list_pending))
        .route("/api/{app}/_workflows/{id}", axum::routing::get(get_instance))
        .route("/api/{app}/_workflows/{id}/approve", axum::routing::post(approve_instance))
        .route("/api/{app}/_workflows/{id}/reject", axum::routing::post(reject_instance))
}

async fn list_pending(
    State(state): State<AppState>,
    Path(_app): Path<String>,
    _user: CurrentUser,
) -> AppResult<Json<Value>> {
    let rows = state
        .store
        .query_rows(
            "SELECT * FROM _workflow_instances WHERE status = 'running' ORDER BY created_at DESC",
            &[],
        )
        .await?;
    Ok(Json(json!({ "data": rows })))
}

async fn get_instance(
    State(state): State<AppState>,
    Path((_app, id)): Path<(String, String)>,
    _user: CurrentUser,
) -> AppResult<Json<Value>> {
    let row = state
        .store
        .query_row("SELECT * FROM _workflow_instances WHERE id = ?", &[BindValue::Text(id.clone())])
        .await?
        .ok_or_else(|| AppError::NotFound(format!("workflow instance '{id}' not found")))?;
    Ok(Json(json!({ "data": row })))
}

async fn resolve_workflow_for_instance(
    state: &AppState,
    id: &str,
) -> AppResult<std::sync::Arc<crate::registry::model::WorkflowDef>> {
    let row = state
        .store
        .query_row(
            "SELECT workflow_name FROM _workflow_instances WHERE id = ?",
            &[BindValue::Text(id.to_string())],
        )
        .await?
        .ok_or_else(|| AppError::NotFound(format!("workflow instance '{id}' not found")))?;
    let workflow_name = row
        .get("workflow_name")
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::Internal("workflow instance row missing workflow_name".to_string()))?;
    state
        .registry
        .load()
        .workflow(workflow_name)
        .ok_or_else(|| AppError::NotFound(format!("unknown workflow '{workflow_name}'")))
}

async fn approve_instance(
    State(state): State<AppState>,
    Path((_app, id)): Path<(String, String)>,
    user: CurrentUser,
) -> AppResult<Json<Value>> {
    let workflow = resolve_workflow_for_instance(&state, &id).await?;
    workflow::approve(&state, &workflow, &id, &user.id).await?;
    Ok(Json(json!({ "data": { "id": id, "decision": "approved" } })))
}

async fn reject_instance(
    State(state): State<AppState>,
    Path((_app, id)): Path<(String, String)>,
    user: CurrentUser,
) -> AppResult<Json<Value>> {
    let workflow = resolve_workflow_for_instance(&state, &id).await?;
    workflow::reject(&state, &workflow, &id, &user.id).await?;
    Ok(Json(json!({ "data": { "id": id, "decision": "rejected" } })))
}
