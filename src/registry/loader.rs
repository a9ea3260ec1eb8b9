//! Loads the flat catalog rows from the `_`-prefixed management tables and
//! turns them into the typed definitions the `Registry` indexes (spec
//! §4.1). One query per table; referential validation happens in
//! `RegistryBuilder::build`.

use serde_json::Value;

use crate::error::{AppError, AppResult};
use crate::store::Store;

use super::model::{
    ComputedRuleDef, EntityDef, ExpressionRuleDef, FieldRuleDef, PermissionDef, RelationDef,
    RuleDef, RuleDefinition, RuleHook, StateMachineDef, WebhookDef, WorkflowDef,
};
use super::snapshot::{Registry, RegistryBuilder};

pub struct Loader<'a> {
    store: &'a Store,
}

impl<'a> Loader<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }

    pub async fn load(&self) -> AppResult<Registry> {
        let entities = self.load_entities().await?;
        let relations = self.load_relations().await?;
        let rules = self.load_rules().await?;
        let state_machines = self.load_state_machines().await?;
        let workflows = self.load_workflows().await?;
        let webhooks = self.load_webhooks().await?;
        let permissions = self.load_permissions().await?;

        RegistryBuilder::new(
            entities,
            relations,
            rules,
            state_machines,
            workflows,
            webhooks,
            permissions,
        )
        .build()
        .map_err(AppError::Internal)
    }

    async fn load_entities(&self) -> AppResult<Vec<EntityDef>> {
        let rows = self
            .store
            .query_rows("SELECT name, table_name, definition FROM _entities", &[])
            .await?;
        rows.into_iter()
            .map(|row| {
                let name = text(&row, "name")?;
                let table_name = text(&row, "table_name")?;
                let mut definition = json_column(&row, "definition")?;
                if let Some(object) = definition.as_object_mut() {
                    object.insert("name".to_string(), Value::String(name.clone()));
                    object.insert("table".to_string(), Value::String(table_name));
                }
                serde_json::from_value(definition)
                    .map_err(|error| AppError::Internal(format!("malformed entity '{name}': {error}")))
            })
            .collect()
    }

    async fn load_relations(&self) -> AppResult<Vec<RelationDef>> {
        let rows = self
            .store
            .query_rows("SELECT name, source, target, definition FROM _relations", &[])
            .await?;
        rows.into_iter()
            .map(|row| {
                let name = text(&row, "name")?;
                let source = text(&row, "source")?;
                let target = text(&row, "target")?;
                let mut definition = json_column(&row, "definition")?;
                if let Some(object) = definition.as_object_mut() {
                    object.insert("name".to_string(), Value::String(name.clone()));
                    object.insert("source".to_string(), Value::String(source));
                    object.insert("target".to_string(), Value::String(target));
                }
                serde_json::from_value(definition).map_err(|error| {
                    AppError::Internal(format!("malformed relation '{name}': {error}"))
                })
            })
            .collect()
    }

    async fn load_rules(&self) -> AppResult<Vec<RuleDef>> {
        let rows = self
            .store
            .query_rows(
                "SELECT id, entity, hook, type, definition, priority, active FROM _rules",
                &[],
            )
            .await?;
        rows.into_iter()
            .map(|row| {
                let id = text(&row, "id")?;
                let entity = text(&row, "entity")?;
                let hook = parse_hook(&text(&row, "hook")?)?;
                let kind = text(&row, "type")?;
                let definition = json_column(&row, "definition")?;
                let priority = row.get("priority").and_then(Value::as_i64).unwrap_or(0) as i32;
                let active = row.get("active").and_then(Value::as_bool).unwrap_or(true);

                let definition = match kind.as_str() {
                    "field" => RuleDefinition::Field(parse_definition::<FieldRuleDef>(
                        &id, &definition,
                    )?),
                    "expression" => RuleDefinition::Expression(parse_definition::<ExpressionRuleDef>(
                        &id, &definition,
                    )?),
                    "computed" => RuleDefinition::Computed(parse_definition::<ComputedRuleDef>(
                        &id, &definition,
                    )?),
                    other => {
                        return Err(AppError::Internal(format!(
                            "rule '{id}' has unknown type '{other}'"
                        )))
                    }
                };

                Ok(RuleDef {
                    id,
                    entity,
                    hook,
                    priority,
                    active,
                    definition,
                })
            })
            .collect()
    }

    async fn load_state_machines(&self) -> AppResult<Vec<StateMachineDef>> {
        let rows = self
            .store
            .query_rows(
                "SELECT id, entity, field, definition, active FROM _state_machines",
                &[],
            )
            .await?;
        rows.into_iter()
            .map(|row| {
                let id = text(&row, "id")?;
                let entity = text(&row, "entity")?;
                let field = text(&row, "field")?;
                let active = row.get("active").and_then(Value::as_bool).unwrap_or(true);
                let mut definition = json_column(&row, "definition")?;
                if let Some(object) = definition.as_object_mut() {
                    object.insert("id".to_string(), Value::String(id.clone()));
                    object.insert("entity".to_string(), Value::String(entity));
                    object.insert("field".to_string(), Value::String(field));
                    object.insert("active".to_string(), Value::Bool(active));
                }
                serde_json::from_value(definition).map_err(|error| {
                    AppError::Internal(format!("malformed state machine '{id}': {error}"))
                })
            })
            .collect()
    }

    async fn load_workflows(&self) -> AppResult<Vec<WorkflowDef>> {
        let rows = self
            .store
            .query_rows(
                "SELECT id, name, trigger, context, steps, active FROM _workflows",
                &[],
            )
            .await?;
        rows.into_iter()
            .map(|row| {
                let id = text(&row, "id")?;
                let name = text(&row, "name")?;
                let active = row.get("active").and_then(Value::as_bool).unwrap_or(true);
                let trigger = json_column(&row, "trigger")?;
                let context = json_column(&row, "context")?;
                let steps = json_column(&row, "steps")?;
                let combined = serde_json::json!({
                    "id": id,
                    "name": name,
                    "trigger": trigger,
                    "context": context,
                    "steps": steps,
                    "active": active,
                });
                serde_json::from_value(combined).map_err(|error| {
                    AppError::Internal(format!("malformed workflow '{name}': {error}"))
                })
            })
            .collect()
    }

    async fn load_webhooks(&self) -> AppResult<Vec<WebhookDef>> {
        let rows = self
            .store
            .query_rows(
                "SELECT id, entity, hook, url, method, headers, condition, async, retry, active FROM _webhooks",
                &[],
            )
            .await?;
        rows.into_iter()
            .map(|row| {
                let id = text(&row, "id")?;
                let combined = serde_json::json!({
                    "id": id,
                    "entity": text(&row, "entity")?,
                    "hook": text(&row, "hook")?,
                    "url": text(&row, "url")?,
                    "method": row.get("method").cloned().unwrap_or(Value::String("POST".into())),
                    "headers": json_column(&row, "headers").unwrap_or(Value::Object(Default::default())),
                    "condition": row.get("condition").cloned().unwrap_or(Value::Null),
                    "is_async": row.get("async").and_then(Value::as_bool).unwrap_or(false),
                    "retry": json_column(&row, "retry").unwrap_or(Value::Null),
                    "active": row.get("active").and_then(Value::as_bool).unwrap_or(true),
                });
                serde_json::from_value(combined)
                    .map_err(|error| AppError::Internal(format!("malformed webhook '{id}': {error}")))
            })
            .collect()
    }

    async fn load_permissions(&self) -> AppResult<Vec<PermissionDef>> {
        let rows = self
            .store
            .query_rows(
                "SELECT id, entity, action, roles, conditions FROM _permissions",
                &[],
            )
            .await?;
        rows.into_iter()
            .map(|row| {
                let id = text(&row, "id")?;
                let combined = serde_json::json!({
                    "id": id,
                    "entity": text(&row, "entity")?,
                    "action": text(&row, "action")?,
                    "roles": json_column(&row, "roles").unwrap_or(Value::Array(vec![])),
                    "conditions": json_column(&row, "conditions").unwrap_or(Value::Array(vec![])),
                });
                serde_json::from_value(combined).map_err(|error| {
                    AppError::Internal(format!("malformed permission '{id}': {error}"))
                })
            })
            .collect()
    }
}

fn text(row: &Value, field: &str) -> AppResult<String> {
    row.get(field)
        .and_then(Value::as_str)
        .map(ToOwned::to_owned)
        .ok_or_else(|| AppError::Internal(format!("catalog row missing column '{field}'")))
}

fn json_column(row: &Value, field: &str) -> AppResult<Value> {
    match row.get(field) {
        Some(Value::String(raw)) => serde_json::from_str(raw)
            .map_err(|error| AppError::Internal(format!("invalid JSON in column '{field}': {error}"))),
        Some(other) => Ok(other.clone()),
        None => Ok(Value::Null),
    }
}

fn parse_definition<T: serde::de::DeserializeOwned>(id: &str, definition: &Value) -> AppResult<T> {
    serde_json::from_value(definition.clone())
        .map_err(|error| AppError::Internal(format!("malformed rule '{id}': {error}")))
}

fn parse_hook(raw: &str) -> AppResult<RuleHook> {
    match raw {
        "before_write" => Ok(RuleHook::BeforeWrite),
        "before_delete" => Ok(RuleHook::BeforeDelete),
        other => Err(AppError::Internal(format!("unknown rule hook '{other}'"))),
    }
}
