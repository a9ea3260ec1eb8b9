//! State Machine runtime (spec §4.7): hooked into the nested-write
//! executor after a parent update, runs guarded transitions and their
//! actions inside the caller's transaction.

use serde_json::Value;
use uuid::Uuid;

use crate::auth::CurrentUser;
use crate::error::{AppError, AppResult, ViolationDetail};
use crate::expr::{self, Env};
use crate::registry::model::{Action, StateMachineDef, Transition};
use crate::state::AppState;
use crate::store::BindValue;
use crate::webhook;

pub struct TransitionOutcome {
    pub transition: Transition,
    pub record: Value,
}

/// Finds the transition matching `(old_value -> new_value)`, checks its
/// guard and role requirement, then runs its actions in order within the
/// same transaction the caller already holds (spec §4.7). `set_field`
/// mutates `record` directly so the caller's subsequent `UPDATE` (or the
/// already-applied row) reflects every action's effect.
pub async fn apply_transition(
    state: &AppState,
    machine: &StateMachineDef,
    old_value: &Value,
    new_value: &Value,
    user: &CurrentUser,
    record: &mut Value,
) -> AppResult<Transition> {
    let old_str = old_value.as_str().unwrap_or_default();
    let new_str = new_value.as_str().unwrap_or_default();

    let transition = machine
        .transitions
        .iter()
        .find(|transition| transition.from.iter().any(|from| from == old_str) && transition.to == new_str)
        .cloned()
        .ok_or_else(|| {
            AppError::ValidationFailed(vec![ViolationDetail::new(
                machine.field.clone(),
                "transition",
                format!("no transition from '{old_str}' to '{new_str}' is defined"),
            )])
        })?;

    if let Some(guard) = &transition.guard {
        let env = Env {
            record: record.clone(),
            old: Value::Null,
            context: Value::Null,
            action: Value::Null,
        };
        let passed = expr::eval_bool(guard, &env)
            .map_err(|error| AppError::Internal(format!("guard evaluation failed: {error}")))?;
        if !passed {
            return Err(AppError::ValidationFailed(vec![ViolationDetail::new(
                machine.field.clone(),
                "guard",
                "transition guard condition was not satisfied".to_string(),
            )]));
        }
    }

    if !transition.roles.is_empty() && !transition.roles.iter().any(|role| user.has_role(role)) && !user.is_admin()
    {
        return Err(AppError::Forbidden(
            "user lacks a role required for this transition".to_string(),
        ));
    }

    for action in &transition.actions {
        run_action(state, action, record).await?;
    }

    Ok(transition)
}

/// Runs a single declared action against `record`, shared by the state
/// machine's transition actions and workflow action steps.
pub async fn run_action(state: &AppState, action: &Action, record: &mut Value) -> AppResult<()> {
    match action {
        Action::SetField { field, value } => {
            let resolved = resolve_action_value(value);
            if let Some(object) = record.as_object_mut() {
                object.insert(field.clone(), resolved);
            }
            Ok(())
        }
        Action::CreateRecord { entity, data } => {
            let target = state
                .registry
                .load()
                .entity(entity)
                .ok_or_else(|| AppError::Internal(format!("create_record action references unknown entity '{entity}'")))?;

            let mut object = data
                .as_object()
                .cloned()
                .ok_or_else(|| AppError::Internal("create_record action data must be a JSON object".to_string()))?;
            if target.primary_key.generated {
                object
                    .entry(target.primary_key.field.clone())
                    .or_insert_with(|| Value::String(Uuid::new_v4().to_string()));
            }

            let columns: Vec<&String> = object.keys().collect();
            let placeholders = vec!["?"; columns.len()].join(", ");
            let column_list: Vec<String> = columns.iter().map(|c| c.to_string()).collect();
            let params: Vec<BindValue> = columns
                .iter()
                .map(|column| crate::store::infer_scalar(column, &object[*column]))
                .collect();
            let sql = format!(
                "INSERT INTO {} ({}) VALUES ({placeholders})",
                target.table,
                column_list.join(", ")
            );
            state.store.exec(&sql, &params).await?;
            Ok(())
        }
        Action::SendEvent { event_type, metadata } => {
            let sql = "INSERT INTO _events \
                (id, trace_id, span_id, parent_span_id, event_type, source, component, action, entity, record_id, user_id, duration_ms, status, metadata, created_at) \
                VALUES (?, ?, ?, NULL, ?, 'engine', 'state_machine', 'send_event', NULL, NULL, NULL, NULL, 'ok', ?, ?)";
            let trace_id = Uuid::new_v4().to_string();
            let params = vec![
                BindValue::Uuid(Uuid::new_v4()),
                BindValue::Text(trace_id.clone()),
                BindValue::Text(trace_id),
                BindValue::Text(event_type.clone()),
                BindValue::Json(metadata.clone()),
                BindValue::Timestamp(chrono::Utc::now()),
            ];
            state.store.exec(sql, &params).await?;
            Ok(())
        }
        Action::Webhook { webhook: webhook_id } => {
            let Some(webhook_def) = state.registry.load().webhook(webhook_id) else {
                return Err(AppError::Internal(format!(
                    "webhook action references unknown webhook '{webhook_id}'"
                )));
            };
            let log_id = webhook::enqueue(state, &webhook_def, &webhook_def.entity, record, "transition").await?;
            if !webhook_def.is_async {
                webhook::deliver_sync(state, &webhook_def, &log_id, record).await?;
            }
            Ok(())
        }
    }
}

fn resolve_action_value(value: &Value) -> Value {
    match value.as_str() {
        Some("now") => Value::String(chrono::Utc::now().to_rfc3339()),
        _ => value.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> StateMachineDef {
        StateMachineDef {
            id: "sm1".to_string(),
            entity: "invoice".to_string(),
            field: "status".to_string(),
            initial: "draft".to_string(),
            transitions: vec![Transition {
                from: vec!["draft".to_string()],
                to: "sent".to_string(),
                guard: Some("record.total > 0".to_string()),
                roles: vec![],
                actions: vec![Action::SetField {
                    field: "sent_at".to_string(),
                    value: Value::String("now".to_string()),
                }],
            }],
            active: true,
        }
    }

    fn admin() -> CurrentUser {
        CurrentUser {
            id: "u1".to_string(),
            roles: vec!["admin".to_string()],
        }
    }

    #[tokio::test]
    async fn guard_failure_rejects_transition() {
        let state = test_state().await;
        let machine = machine();
        let mut record = serde_json::json!({ "total": 0, "status": "draft" });
        let result = apply_transition(
            &state,
            &machine,
            &Value::String("draft".to_string()),
            &Value::String("sent".to_string()),
            &admin(),
            &mut record,
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn passing_guard_runs_set_field_action() {
        let state = test_state().await;
        let machine = machine();
        let mut record = serde_json::json!({ "total": 10, "status": "draft" });
        apply_transition(
            &state,
            &machine,
            &Value::String("draft".to_string()),
            &Value::String("sent".to_string()),
            &admin(),
            &mut record,
        )
        .await
        .unwrap();
        assert!(record.get("sent_at").is_some());
    }

    #[tokio::test]
    async fn unknown_transition_is_rejected() {
        let state = test_state().await;
        let machine = machine();
        let mut record = serde_json::json!({ "total": 10, "status": "sent" });
        let result = apply_transition(
            &state,
            &machine,
            &Value::String("sent".to_string()),
            &Value::String("sent".to_string()),
            &admin(),
            &mut record,
        )
        .await;
        assert!(result.is_err());
    }

    async fn test_state() -> AppState {
        let mut config = crate::config::AppConfig::from_env();
        config.database_url = "sqlite::memory:".to_string();
        config.dialect = crate::config::Dialect::Sqlite;
        AppState::build(config).await.expect("in-memory sqlite state builds")
    }
}
