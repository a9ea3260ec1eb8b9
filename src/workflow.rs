//! Workflow Instance runtime (spec §4.8): creation on a matching
//! state-machine transition, one-step-at-a-time advancement, and a
//! background sweeper for timed-out approval steps — the sweeper is
//! grounded on the teacher's `run_background_scheduler`
//! (`services/scheduler.rs`): a `loop { sleep(...); ... }` over a cloned
//! `AppState`, each tick spawned onto its own task.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::expr::{self, Env};
use crate::registry::model::{StepType, WorkflowDef, WorkflowStep};
use crate::state::AppState;
use crate::store::BindValue;

/// Creates a running `WorkflowInstance` for the workflow whose trigger
/// matches `(entity, field, to)`, with `context` populated from the
/// configured field paths on the triggering record (spec §4.8).
pub async fn start_instance(state: &AppState, workflow: &WorkflowDef, triggering_record: &Value) -> AppResult<String> {
    let Some(first_step) = workflow.first_step() else {
        return Err(AppError::Internal(format!(
            "workflow '{}' has no steps",
            workflow.name
        )));
    };

    let mut context = serde_json::Map::new();
    for (name, path) in &workflow.context {
        let value = triggering_record.get(path).cloned().unwrap_or(Value::Null);
        context.insert(name.clone(), value);
    }

    let deadline = first_step
        .timeout_seconds
        .map(|seconds| Utc::now() + ChronoDuration::seconds(seconds));

    let id = Uuid::new_v4().to_string();
    let history = serde_json::json!([]);
    let sql = "INSERT INTO _workflow_instances \
        (id, workflow_name, status, current_step, current_step_deadline, context, history, created_at, updated_at) \
        VALUES (?, ?, 'running', ?, ?, ?, ?, ?, ?)";
    let now = Utc::now();
    let params = vec![
        BindValue::Text(id.clone()),
        BindValue::Text(workflow.name.clone()),
        BindValue::Text(first_step.id.clone()),
        deadline.map(BindValue::Timestamp).unwrap_or(BindValue::Null),
        BindValue::Json(Value::Object(context)),
        BindValue::Json(history),
        BindValue::Timestamp(now),
        BindValue::Timestamp(now),
    ];
    state.store.exec(sql, &params).await?;
    Ok(id)
}

/// Advances a running instance by exactly one step (spec §4.8): action
/// steps execute then follow `then`; condition steps evaluate and branch;
/// approval steps persist and wait for external input or the sweeper.
pub async fn advance(state: &AppState, workflow: &WorkflowDef, instance_id: &str) -> AppResult<()> {
    let Some(instance) = load_instance(state, instance_id).await? else {
        return Err(AppError::NotFound(format!("workflow instance '{instance_id}' not found")));
    };
    if instance.status != "running" {
        return Ok(());
    }

    let Some(step) = workflow.step(&instance.current_step) else {
        return fail_instance(state, instance_id, "unknown step id").await;
    };

    match step.step_type {
        StepType::Action => {
            let mut context = instance.context.clone();
            for action in &step.actions {
                if let Err(error) = crate::state_machine::run_action(state, action, &mut context).await {
                    return fail_instance(state, instance_id, &format!("action step failed: {error}")).await;
                }
            }
            update_context(state, instance_id, &context).await?;
            append_history(state, instance_id, &step.id, "completed", None).await?;
            match &step.then {
                Some(next) => move_to_step(state, workflow, instance_id, next).await,
                None => complete_instance(state, instance_id).await,
            }
        }
        StepType::Condition => {
            let Some(expression) = &step.expression else {
                return fail_instance(state, instance_id, "condition step missing expression").await;
            };
            let env = Env {
                record: Value::Null,
                old: Value::Null,
                context: instance.context.clone(),
                action: Value::Null,
            };
            let passed = expr::eval_bool(expression, &env)
                .map_err(|error| AppError::Internal(format!("workflow condition failed: {error}")))?;
            append_history(
                state,
                instance_id,
                &step.id,
                if passed { "true" } else { "false" },
                None,
            )
            .await?;
            let next = if passed { &step.on_true } else { &step.on_false };
            match next {
                Some(next) => move_to_step(state, workflow, instance_id, next).await,
                None => complete_instance(state, instance_id).await,
            }
        }
        StepType::Approval => {
            let deadline = step.timeout_seconds.map(|seconds| Utc::now() + ChronoDuration::seconds(seconds));
            let sql = "UPDATE _workflow_instances SET current_step_deadline = ?, updated_at = ? WHERE id = ?";
            let params = vec![
                deadline.map(BindValue::Timestamp).unwrap_or(BindValue::Null),
                BindValue::Timestamp(Utc::now()),
                BindValue::Text(instance_id.to_string()),
            ];
            state.store.exec(sql, &params).await?;
            Ok(())
        }
    }
}

/// `POST .../{id}/approve` (spec §6): advances an approval step to
/// `on_approve`.
pub async fn approve(state: &AppState, workflow: &WorkflowDef, instance_id: &str, by_user: &str) -> AppResult<()> {
    decide(state, workflow, instance_id, by_user, true).await
}

/// `POST .../{id}/reject` (spec §6): advances an approval step to
/// `on_reject`.
pub async fn reject(state: &AppState, workflow: &WorkflowDef, instance_id: &str, by_user: &str) -> AppResult<()> {
    decide(state, workflow, instance_id, by_user, false).await
}

async fn decide(
    state: &AppState,
    workflow: &WorkflowDef,
    instance_id: &str,
    by_user: &str,
    approved: bool,
) -> AppResult<()> {
    let Some(instance) = load_instance(state, instance_id).await? else {
        return Err(AppError::NotFound(format!("workflow instance '{instance_id}' not found")));
    };
    if instance.status != "running" {
        return Err(AppError::Conflict("workflow instance is not awaiting a decision".to_string()));
    }
    let Some(step) = workflow.step(&instance.current_step) else {
        return Err(AppError::Internal("current step no longer exists in workflow definition".to_string()));
    };
    if step.step_type != StepType::Approval {
        return Err(AppError::Conflict("current step is not an approval step".to_string()));
    }

    append_history(
        state,
        instance_id,
        &step.id,
        if approved { "approved" } else { "rejected" },
        Some(by_user),
    )
    .await?;

    let next = if approved { &step.on_approve } else { &step.on_reject };
    match next {
        Some(next) => move_to_step(state, workflow, instance_id, next).await,
        None => {
            let status = if approved { "approved" } else { "rejected" };
            set_terminal_status(state, instance_id, status).await
        }
    }
}

async fn move_to_step(state: &AppState, workflow: &WorkflowDef, instance_id: &str, step_id: &str) -> AppResult<()> {
    if step_id == "end" {
        return complete_instance(state, instance_id).await;
    }
    let Some(next_step) = workflow.step(step_id) else {
        return fail_instance(state, instance_id, "transition targets an unknown step id").await;
    };
    let deadline = next_step.timeout_seconds.map(|seconds| Utc::now() + ChronoDuration::seconds(seconds));

    let sql = "UPDATE _workflow_instances SET current_step = ?, current_step_deadline = ?, updated_at = ? WHERE id = ?";
    let params = vec![
        BindValue::Text(step_id.to_string()),
        deadline.map(BindValue::Timestamp).unwrap_or(BindValue::Null),
        BindValue::Timestamp(Utc::now()),
        BindValue::Text(instance_id.to_string()),
    ];
    state.store.exec(sql, &params).await?;

    Box::pin(advance(state, workflow, instance_id)).await
}

async fn complete_instance(state: &AppState, instance_id: &str) -> AppResult<()> {
    set_terminal_status(state, instance_id, "completed").await
}

async fn fail_instance(state: &AppState, instance_id: &str, reason: &str) -> AppResult<()> {
    append_history(state, instance_id, "_runtime", "error", None).await?;
    tracing::error!(instance_id, reason, "workflow instance failed");
    set_terminal_status(state, instance_id, "failed").await
}

async fn set_terminal_status(state: &AppState, instance_id: &str, status: &str) -> AppResult<()> {
    let sql = "UPDATE _workflow_instances SET status = ?, current_step_deadline = NULL, updated_at = ? WHERE id = ?";
    let params = vec![
        BindValue::Text(status.to_string()),
        BindValue::Timestamp(Utc::now()),
        BindValue::Text(instance_id.to_string()),
    ];
    state.store.exec(sql, &params).await?;
    Ok(())
}

async fn append_history(
    state: &AppState,
    instance_id: &str,
    step: &str,
    status: &str,
    by: Option<&str>,
) -> AppResult<()> {
    let Some(instance) = load_instance(state, instance_id).await? else {
        return Ok(());
    };
    let mut history = instance.history;
    if let Some(items) = history.as_array_mut() {
        items.push(serde_json::json!({
            "step": step,
            "status": status,
            "at": Utc::now().to_rfc3339(),
            "by": by,
        }));
    }
    let sql = "UPDATE _workflow_instances SET history = ?, updated_at = ? WHERE id = ?";
    let params = vec![BindValue::Json(history), BindValue::Timestamp(Utc::now()), BindValue::Text(instance_id.to_string())];
    state.store.exec(sql, &params).await?;
    Ok(())
}

async fn update_context(state: &AppState, instance_id: &str, context: &Value) -> AppResult<()> {
    let sql = "UPDATE _workflow_instances SET context = ?, updated_at = ? WHERE id = ?";
    let params = vec![
        BindValue::Json(context.clone()),
        BindValue::Timestamp(Utc::now()),
        BindValue::Text(instance_id.to_string()),
    ];
    state.store.exec(sql, &params).await?;
    Ok(())
}

struct LoadedInstance {
    status: String,
    current_step: String,
    context: Value,
    history: Value,
}

async fn load_instance(state: &AppState, instance_id: &str) -> AppResult<Option<LoadedInstance>> {
    let row = state
        .store
        .query_row(
            "SELECT status, current_step, context, history FROM _workflow_instances WHERE id = ?",
            &[BindValue::Text(instance_id.to_string())],
        )
        .await?;
    Ok(row.map(|row| LoadedInstance {
        status: row.get("status").and_then(Value::as_str).unwrap_or_default().to_string(),
        current_step: row.get("current_step").and_then(Value::as_str).unwrap_or_default().to_string(),
        context: row.get("context").cloned().unwrap_or(Value::Null),
        history: row.get("history").cloned().unwrap_or(Value::Array(vec![])),
    }))
}

/// Moves every instance whose `current_step_deadline` has passed to
/// `on_timeout` (or `timed_out` if the step names none). Concurrency is
/// enforced with a CAS update on `status` (spec §4.8's concurrency
/// contract): only the worker that wins the `running -> running` update
/// with a fresh deadline proceeds.
pub async fn sweep_timeouts(state: &AppState) -> AppResult<usize> {
    let due = state
        .store
        .query_rows(
            "SELECT id, workflow_name FROM _workflow_instances \
             WHERE status = 'running' AND current_step_deadline IS NOT NULL AND current_step_deadline <= ?",
            &[BindValue::Timestamp(Utc::now())],
        )
        .await?;

    let mut advanced = 0usize;
    for row in due {
        let id = row.get("id").and_then(Value::as_str).unwrap_or_default().to_string();
        let workflow_name = row.get("workflow_name").and_then(Value::as_str).unwrap_or_default().to_string();

        let claimed = state
            .store
            .exec(
                "UPDATE _workflow_instances SET current_step_deadline = NULL, updated_at = ? \
                 WHERE id = ? AND status = 'running'",
                &[BindValue::Timestamp(Utc::now()), BindValue::Text(id.clone())],
            )
            .await?;
        if claimed == 0 {
            continue;
        }

        let Some(workflow) = state.registry.load().workflow(&workflow_name) else {
            continue;
        };
        let Some(instance) = load_instance(state, &id).await? else {
            continue;
        };
        let Some(step) = workflow.step(&instance.current_step) else {
            continue;
        };

        append_history(state, &id, &step.id, "timed_out", None).await?;
        match &step.on_timeout {
            Some(next) => move_to_step(state, &workflow, &id, next).await?,
            None => set_terminal_status(state, &id, "timed_out").await?,
        }
        advanced += 1;
    }
    Ok(advanced)
}

/// Background sweeper, started once from `main.rs` alongside the webhook
/// workers. One failing tick never stops the loop.
pub async fn run_sweeper_loop(state: Arc<AppState>) {
    loop {
        tokio::time::sleep(Duration::from_millis(state.config.workflow_sweep_interval_ms)).await;
        let state = state.clone();
        tokio::spawn(async move {
            match sweep_timeouts(&state).await {
                Ok(count) if count > 0 => tracing::info!(advanced = count, "workflow sweeper advanced timed-out instances"),
                Ok(_) => {}
                Err(error) => tracing::error!(error = %error, "workflow sweeper tick failed"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::model::{WorkflowTrigger};
    use std::collections::HashMap;

    fn workflow() -> WorkflowDef {
        WorkflowDef {
            id: "wf1".to_string(),
            name: "invoice_sent".to_string(),
            trigger: WorkflowTrigger {
                entity: "invoice".to_string(),
                field: "status".to_string(),
                to: "sent".to_string(),
            },
            context: HashMap::from([("total".to_string(), "total".to_string())]),
            steps: vec![
                WorkflowStep {
                    id: "check".to_string(),
                    step_type: StepType::Condition,
                    actions: vec![],
                    expression: Some("context.total > 100".to_string()),
                    timeout_seconds: None,
                    then: None,
                    on_true: Some("approve".to_string()),
                    on_false: Some("end".to_string()),
                    on_approve: None,
                    on_reject: None,
                    on_timeout: None,
                },
                WorkflowStep {
                    id: "approve".to_string(),
                    step_type: StepType::Approval,
                    actions: vec![],
                    expression: None,
                    timeout_seconds: Some(3600),
                    then: None,
                    on_true: None,
                    on_false: None,
                    on_approve: Some("end".to_string()),
                    on_reject: Some("end".to_string()),
                    on_timeout: Some("end".to_string()),
                },
            ],
            active: true,
        }
    }

    #[test]
    fn workflow_resolves_first_and_named_steps() {
        let workflow = workflow();
        assert_eq!(workflow.first_step().unwrap().id, "check");
        assert!(workflow.step("approve").is_some());
        assert!(workflow.step("missing").is_none());
    }
}
