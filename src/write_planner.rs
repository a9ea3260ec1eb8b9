//! Nested Write planner and executor (spec §4.5): turns one request
//! payload into an ordered set of per-entity operations and runs them
//! inside a single transaction, wiring in the rule engine, permission
//! evaluator, state machine runtime, and webhook dispatcher at the points
//! the spec pins them to.
//!
//! Nesting is resolved one level deep — the parent entity plus its
//! directly-declared relations — mirroring the non-recursive stance the
//! query planner's `include=` already takes (spec §4.4, §9 Open
//! Questions); a child's own nested children are rejected with
//! `INVALID_PAYLOAD` rather than silently ignored.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::auth::CurrentUser;
use crate::error::{AppError, AppResult, ViolationDetail};
use crate::instrument::{Span, SpanSource};
use crate::permissions;
use crate::registry::model::{
    AutoFill, EntityDef, Field, FieldType, OnDelete, PermissionAction, RelationDef,
    RelationType, RuleHook, WebhookHook, WriteMode,
};
use crate::registry::Registry;
use crate::rules;
use crate::state::AppState;
use crate::state_machine;
use crate::store::BindValue;
use crate::webhook;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

/// One node of the write plan: a single entity row, scoped under the
/// relation its owning tuple in the plan already carries.
struct WriteNode {
    entity: Arc<EntityDef>,
    operation: Operation,
    payload: Map<String, Value>,
}

/// Builds the plan by pulling relation-keyed arrays/objects out of the
/// root payload (spec §4.5: "payload may interleave scalar fields for the
/// parent and arrays/objects for related entities keyed by relation
/// name").
fn plan_write(registry: &Registry, entity: &Arc<EntityDef>, mut payload: Map<String, Value>) -> AppResult<(Map<String, Value>, Vec<(Arc<RelationDef>, WriteMode, Vec<WriteNode>)>)> {
    let relations = registry.relations_for_source(&entity.name);
    let mut children = Vec::new();

    for relation in relations {
        let Some(raw) = payload.remove(&relation.name) else {
            continue;
        };
        let target = registry
            .entity(&relation.target)
            .ok_or_else(|| AppError::NotFound(format!("unknown relation target entity '{}'", relation.target)))?;

        let items: Vec<Value> = match relation.relation_type {
            RelationType::OneToOne => vec![raw],
            _ => raw
                .as_array()
                .cloned()
                .ok_or_else(|| AppError::InvalidPayload(format!("relation '{}' expects an array payload", relation.name)))?,
        };

        let mut nodes = Vec::with_capacity(items.len());
        for item in items {
            let mut object = item
                .as_object()
                .cloned()
                .ok_or_else(|| AppError::InvalidPayload(format!("relation '{}' entries must be objects", relation.name)))?;

            for reserved in registry.relations_for_source(&target.name) {
                if object.contains_key(&reserved.name) {
                    return Err(AppError::InvalidPayload(
                        "nested writes are only resolved one level deep".to_string(),
                    ));
                }
            }

            let delete_flagged = object
                .remove("_delete")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);

            let has_pk = object
                .get(&target.primary_key.field)
                .map(|v| !v.is_null())
                .unwrap_or(false);

            let operation = if delete_flagged {
                Operation::Delete
            } else if has_pk {
                if relation.write_mode == WriteMode::Append {
                    return Err(AppError::InvalidPayload(format!(
                        "relation '{}' uses append mode; child payloads may not carry a primary key",
                        relation.name
                    )));
                }
                Operation::Update
            } else {
                Operation::Insert
            };

            nodes.push(WriteNode {
                entity: target.clone(),
                operation,
                payload: object,
            });
        }

        children.push((relation.clone(), relation.write_mode, nodes));
    }

    Ok((payload, children))
}

/// Writes one record (insert or update) for `entity`, running the full
/// per-node sequence from spec §4.5 steps 1-5. Returns the resolved row.
async fn write_node(
    state: &AppState,
    tx: &mut crate::store::StoreTx,
    entity: &Arc<EntityDef>,
    operation: Operation,
    mut payload: Map<String, Value>,
    user: &CurrentUser,
    parent_binding: Option<(&str, Value)>,
) -> AppResult<Value> {
    if let Some((field, value)) = parent_binding {
        payload.insert(field.to_string(), value);
    }

    let existing = if operation == Operation::Update {
        let pk_value = payload
            .get(&entity.primary_key.field)
            .cloned()
            .ok_or_else(|| AppError::InvalidPayload("update payload is missing its primary key".to_string()))?;
        let row = fetch_by_pk(tx, entity, &pk_value).await?;
        Some(row.ok_or_else(|| AppError::NotFound(format!("{} not found", entity.name)))?)
    } else {
        None
    };

    populate_auto_fields(entity, &mut payload, operation == Operation::Insert);
    populate_slug(entity, &mut payload, operation == Operation::Insert);

    let mut record = Value::Object(payload);
    let old_value = existing.clone().unwrap_or(Value::Null);

    let permissions_list = state
        .registry
        .load()
        .permissions_for(&entity.name, action_for_operation(operation));
    permissions::authorize_write(&permissions_list, user, &record)?;

    let rule_hook = match operation {
        Operation::Delete => RuleHook::BeforeDelete,
        _ => RuleHook::BeforeWrite,
    };
    let active_rules = state.registry.load().rules_for(&entity.name, rule_hook);
    rules::run_before_write(&active_rules, &mut record, &old_value, &Value::Null)
        .map_err(AppError::ValidationFailed)?;

    let saved = match operation {
        Operation::Insert => insert_row(tx, entity, &record).await?,
        Operation::Update => update_row(tx, entity, &record).await?,
        Operation::Delete => unreachable!("delete handled separately"),
    };

    if operation == Operation::Update {
        for state_machine in state.registry.load().state_machines_for(&entity.name) {
            let old_field_value = old_value.get(&state_machine.field).cloned().unwrap_or(Value::Null);
            let new_field_value = saved.get(&state_machine.field).cloned().unwrap_or(Value::Null);
            if old_field_value == new_field_value || old_field_value.is_null() {
                continue;
            }

            let mut transitioned = saved.clone();
            let transition = state_machine::apply_transition(
                state,
                &state_machine,
                &old_field_value,
                &new_field_value,
                user,
                &mut transitioned,
            )
            .await?;
            let _ = update_row(tx, entity, &transitioned).await?;

            if let Some(workflow) = state
                .registry
                .load()
                .workflow_for_trigger(&entity.name, &state_machine.field, &transition.to)
            {
                crate::workflow::start_instance(state, &workflow, &transitioned).await?;
            }
            dispatch_sync_webhooks(state, entity, &transitioned, &old_value, operation).await?;
            return Ok(transitioned);
        }
    }

    dispatch_sync_webhooks(state, entity, &saved, &old_value, operation).await?;

    Ok(saved)
}

fn action_for_operation(operation: Operation) -> PermissionAction {
    match operation {
        Operation::Insert => PermissionAction::Create,
        Operation::Update => PermissionAction::Update,
        Operation::Delete => PermissionAction::Delete,
    }
}

fn populate_auto_fields(entity: &EntityDef, payload: &mut Map<String, Value>, is_insert: bool) {
    if is_insert && entity.primary_key.generated {
        payload
            .entry(entity.primary_key.field.clone())
            .or_insert_with(|| Value::String(Uuid::new_v4().to_string()));
    }
    for field in &entity.fields {
        let Some(auto) = field.auto else { continue };
        if !is_insert && !payload.contains_key(&field.name) {
            continue;
        }
        match auto {
            AutoFill::Now => {
                payload.insert(field.name.clone(), Value::String(Utc::now().to_rfc3339()));
            }
            AutoFill::Uuid => {
                payload
                    .entry(field.name.clone())
                    .or_insert_with(|| Value::String(Uuid::new_v4().to_string()));
            }
        }
    }
}

fn populate_slug(entity: &EntityDef, payload: &mut Map<String, Value>, is_insert: bool) {
    let Some(slug) = &entity.slug else { return };
    if !is_insert && !slug.regenerate_on_update {
        return;
    }
    if !is_insert && payload.contains_key(&slug.field) {
        return;
    }
    let Some(source) = payload.get(&slug.source).and_then(Value::as_str) else {
        return;
    };
    payload.insert(slug.field.clone(), Value::String(slugify(source)));
}

fn slugify(source: &str) -> String {
    let mut slug = String::with_capacity(source.len());
    let mut last_was_dash = false;
    for ch in source.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
            last_was_dash = false;
        } else if !last_was_dash && !slug.is_empty() {
            slug.push('-');
            last_was_dash = true;
        }
    }
    slug.trim_end_matches('-').to_string()
}

async fn insert_row(tx: &mut crate::store::StoreTx, entity: &EntityDef, record: &Value) -> AppResult<Value> {
    let object = record.as_object().cloned().unwrap_or_default();
    let mut columns = Vec::with_capacity(object.len());
    let mut placeholders = Vec::with_capacity(object.len());
    let mut params = Vec::with_capacity(object.len());

    for (column, value) in &object {
        columns.push(column.clone());
        placeholders.push("?".to_string());
        params.push(crate::store::infer_scalar(column, value));
    }

    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({}) RETURNING *",
        entity.table,
        columns.join(", "),
        placeholders.join(", ")
    );

    let row = tx.query_row(&sql, &params).await?;
    row.ok_or_else(|| AppError::Internal(format!("insert into '{}' did not return a row", entity.table)))
}

async fn update_row(tx: &mut crate::store::StoreTx, entity: &EntityDef, record: &Value) -> AppResult<Value> {
    let object = record.as_object().cloned().unwrap_or_default();
    let pk_field = &entity.primary_key.field;
    let pk_value = object
        .get(pk_field)
        .cloned()
        .ok_or_else(|| AppError::InvalidPayload("update payload is missing its primary key".to_string()))?;

    let mut assignments = Vec::new();
    let mut params = Vec::new();
    for (column, value) in &object {
        if column == pk_field {
            continue;
        }
        assignments.push(format!("{column} = ?"));
        params.push(crate::store::infer_scalar(column, value));
    }
    params.push(crate::store::infer_scalar(pk_field, &pk_value));

    let mut sql = format!(
        "UPDATE {} SET {} WHERE {} = ?",
        entity.table,
        assignments.join(", "),
        pk_field
    );
    if entity.soft_delete {
        sql.push_str(" AND deleted_at IS NULL");
    }
    sql.push_str(" RETURNING *");

    let row = tx.query_row(&sql, &params).await?;
    row.ok_or_else(|| AppError::NotFound(format!("{} not found", entity.name)))
}

async fn fetch_by_pk(tx: &mut crate::store::StoreTx, entity: &EntityDef, pk_value: &Value) -> AppResult<Option<Value>> {
    let sql = format!("SELECT * FROM {} WHERE {} = ?", entity.table, entity.primary_key.field);
    tx.query_row(&sql, &[crate::store::infer_scalar(&entity.primary_key.field, pk_value)]).await
}

async fn dispatch_sync_webhooks(
    state: &AppState,
    entity: &Arc<EntityDef>,
    record: &Value,
    old: &Value,
    operation: Operation,
) -> AppResult<()> {
    let hook = match operation {
        Operation::Insert | Operation::Update => WebhookHook::AfterWrite,
        Operation::Delete => WebhookHook::AfterDelete,
    };
    let action = match operation {
        Operation::Insert => "create",
        Operation::Update => "update",
        Operation::Delete => "delete",
    };

    let hooks = state.registry.load().webhooks_for(&entity.name, hook);
    for hook_def in hooks {
        if !webhook::condition_passes(&hook_def, record, old, action) {
            continue;
        }
        if hook_def.is_async {
            webhook::enqueue(state, &hook_def, &entity.name, record, action).await?;
        } else {
            let log_id = webhook::enqueue(state, &hook_def, &entity.name, record, action).await?;
            webhook::deliver_sync(state, &hook_def, &log_id, record).await?;
        }
    }
    Ok(())
}

/// Entry point for `POST`/`PUT`/`PATCH` on `/api/{app}/{entity}` (spec
/// §4.5, §6). Opens the transaction, runs the parent then each child
/// write-mode's reconciliation, commits, then fires anything deferred
/// until after commit.
pub async fn execute_write(
    state: &AppState,
    entity: &Arc<EntityDef>,
    root_payload: Map<String, Value>,
    root_operation: Operation,
    user: &CurrentUser,
) -> AppResult<Value> {
    let span = Span::root(SpanSource::Engine, "write_planner", "execute_write").with_entity(entity.name.clone());

    let registry = state.registry.load();
    let (root_fields, child_specs) = plan_write(&registry, entity, root_payload)?;

    let mut tx = state.store.begin().await?;

    let result: AppResult<Value> = async {
        let root_record = write_node(state, &mut tx, entity, root_operation, root_fields, user, None).await?;
        let root_pk = root_record
            .get(&entity.primary_key.field)
            .cloned()
            .unwrap_or(Value::Null);

        let mut record = root_record.clone();

        for (relation, write_mode, nodes) in child_specs {
            let mut written = Vec::with_capacity(nodes.len());
            let mut seen_keys = Vec::new();

            for node in nodes {
                match node.operation {
                    Operation::Delete => {
                        delete_related(&mut tx, &node.entity, &node.payload).await?;
                    }
                    _ => {
                        let binding = (relation.target_key(), root_pk.clone());
                        let saved = write_node(
                            state,
                            &mut tx,
                            &node.entity,
                            node.operation,
                            node.payload,
                            user,
                            Some(binding),
                        )
                        .await?;
                        if let Some(key) = saved.get(&node.entity.primary_key.field).cloned() {
                            seen_keys.push(key);
                        }
                        written.push(saved);
                    }
                }
            }

            if write_mode == WriteMode::Replace {
                let target = registry
                    .entity(&relation.target)
                    .ok_or_else(|| AppError::NotFound(format!("unknown relation target entity '{}'", relation.target)))?;
                reconcile_replace(&mut tx, &relation, &target, &root_pk, &seen_keys).await?;
            }

            record
                .as_object_mut()
                .expect("record is always an object")
                .insert(relation.name.clone(), Value::Array(written));
        }

        Ok(record)
    }
    .await;

    match result {
        Ok(record) => {
            tx.commit().await?;
            span.close(&state.store, "ok").await.ok();
            Ok(record)
        }
        Err(error) => {
            tx.rollback().await.ok();
            span.close(&state.store, "error").await.ok();
            Err(error)
        }
    }
}

/// Any still-linked child absent from a `replace`-mode payload is removed
/// (soft or hard per the target entity, spec §4.5).
async fn reconcile_replace(
    tx: &mut crate::store::StoreTx,
    relation: &RelationDef,
    target: &EntityDef,
    parent_key: &Value,
    kept_keys: &[Value],
) -> AppResult<()> {
    let pk_field = &target.primary_key.field;
    let mut sql = format!("SELECT * FROM {} WHERE {} = ?", target.table, relation.target_key());
    let mut params = vec![crate::store::infer_scalar(relation.target_key(), parent_key)];

    if !kept_keys.is_empty() {
        let placeholders = vec!["?"; kept_keys.len()].join(", ");
        sql.push_str(&format!(" AND {pk_field} NOT IN ({placeholders})"));
        for key in kept_keys {
            params.push(crate::store::infer_scalar(pk_field, key));
        }
    }

    let orphaned = tx.query_rows(&sql, &params).await?;
    for row in orphaned {
        let Some(pk) = row.get(pk_field).cloned() else { continue };
        soft_or_hard_delete(tx, &target.table, pk_field, &pk).await?;
    }
    Ok(())
}

async fn delete_related(tx: &mut crate::store::StoreTx, entity: &EntityDef, payload: &Map<String, Value>) -> AppResult<()> {
    let Some(pk) = payload.get(&entity.primary_key.field) else {
        return Err(AppError::InvalidPayload("_delete entries must carry a primary key".to_string()));
    };
    soft_or_hard_delete(tx, &entity.table, &entity.primary_key.field, pk).await
}

async fn soft_or_hard_delete(tx: &mut crate::store::StoreTx, table: &str, pk_field: &str, pk: &Value) -> AppResult<()> {
    let sql = format!("UPDATE {table} SET deleted_at = ? WHERE {pk_field} = ? AND deleted_at IS NULL");
    let affected = tx
        .exec(&sql, &[BindValue::Timestamp(Utc::now()), crate::store::infer_scalar(pk_field, pk)])
        .await?;
    if affected == 0 {
        let hard_sql = format!("DELETE FROM {table} WHERE {pk_field} = ?");
        tx.exec(&hard_sql, &[crate::store::infer_scalar(pk_field, pk)]).await?;
    }
    Ok(())
}

/// Top-level delete entry point, including the `cascade`/`set_null`/
/// `restrict` relation walk (spec §4.5).
pub async fn execute_delete(state: &AppState, entity: &Arc<EntityDef>, pk_value: &Value, user: &CurrentUser) -> AppResult<()> {
    let registry = state.registry.load();
    let permissions_list = registry.permissions_for(&entity.name, PermissionAction::Delete);

    let mut tx = state.store.begin().await?;
    let result: AppResult<()> = async {
        let Some(existing) = fetch_by_pk(&mut tx, entity, pk_value).await? else {
            return Err(AppError::NotFound(format!("{} not found", entity.name)));
        };
        permissions::authorize_write(&permissions_list, user, &existing)?;

        let delete_rules = registry.rules_for(&entity.name, RuleHook::BeforeDelete);
        let mut scratch = existing.clone();
        rules::run_before_write(&delete_rules, &mut scratch, &Value::Null, &Value::Null)
            .map_err(AppError::ValidationFailed)?;

        cascade_delete(&registry, &mut tx, entity, pk_value).await?;
        soft_or_hard_delete(&mut tx, &entity.table, &entity.primary_key.field, pk_value).await?;
        dispatch_sync_webhooks(state, entity, &existing, &Value::Null, Operation::Delete).await?;
        Ok(())
    }
    .await;

    match result {
        Ok(()) => {
            tx.commit().await?;
            Ok(())
        }
        Err(error) => {
            tx.rollback().await.ok();
            Err(error)
        }
    }
}

async fn cascade_delete(
    registry: &Registry,
    tx: &mut crate::store::StoreTx,
    entity: &Arc<EntityDef>,
    pk_value: &Value,
) -> AppResult<()> {
    for relation in registry.relations_for_source(&entity.name) {
        if relation.source != entity.name {
            continue;
        }
        let Some(target) = registry.entity(&relation.target) else { continue };
        let target_key = relation.target_key();

        match relation.on_delete {
            OnDelete::Restrict => {
                let sql = format!("SELECT 1 AS present FROM {} WHERE {} = ? LIMIT 1", target.table, target_key);
                let exists = tx.query_row(&sql, &[crate::store::infer_scalar(target_key, pk_value)]).await?;
                if exists.is_some() {
                    return Err(AppError::Conflict(format!(
                        "cannot delete: '{}' records still reference this row",
                        target.name
                    )));
                }
            }
            OnDelete::Cascade => {
                let sql = format!("SELECT {} FROM {} WHERE {} = ?", target.primary_key.field, target.table, target_key);
                let rows = tx.query_rows(&sql, &[crate::store::infer_scalar(target_key, pk_value)]).await?;
                for row in rows {
                    if let Some(child_pk) = row.get(&target.primary_key.field).cloned() {
                        Box::pin(cascade_delete(registry, tx, &target, &child_pk)).await?;
                        soft_or_hard_delete(tx, &target.table, &target.primary_key.field, &child_pk).await?;
                    }
                }
            }
            OnDelete::SetNull => {
                let sql = format!("UPDATE {} SET {} = NULL WHERE {} = ?", target.table, target_key, target_key);
                tx.exec(&sql, &[crate::store::infer_scalar(target_key, pk_value)]).await?;
            }
            OnDelete::NoAction => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::model::{PrimaryKey, PrimaryKeyType};

    fn invoice_entity() -> Arc<EntityDef> {
        Arc::new(EntityDef {
            name: "invoice".to_string(),
            table: "invoice".to_string(),
            primary_key: PrimaryKey {
                field: "id".to_string(),
                key_type: PrimaryKeyType::Uuid,
                generated: true,
            },
            fields: vec![Field {
                name: "created_at".to_string(),
                field_type: FieldType::Timestamp,
                required: false,
                unique: false,
                nullable: true,
                default: None,
                enum_values: None,
                auto: Some(AutoFill::Now),
                precision: None,
            }],
            soft_delete: true,
            slug: None,
        })
    }

    #[test]
    fn populate_auto_fields_assigns_generated_pk_and_now() {
        let entity = invoice_entity();
        let mut payload = Map::new();
        populate_auto_fields(&entity, &mut payload, true);
        assert!(payload.contains_key("id"));
        assert!(payload.contains_key("created_at"));
    }

    #[test]
    fn slugify_lowercases_and_dashes() {
        assert_eq!(slugify("Hello, World!"), "hello-world");
        assert_eq!(slugify("  leading/trailing  "), "leading-trailing");
    }
}
