//! Admin-facing input DTOs for the metadata catalog (spec §6), validated
//! with `validator` before the generic column splat runs — mirrors the
//! teacher's `schemas.rs` `#[derive(Validate)]` structs, `Create*` only.

use serde::Deserialize;
use serde_json::Value;
use validator::Validate;

use crate::error::{AppError, AppResult, ViolationDetail};

pub fn validate_input<T: Validate>(input: &T) -> Result<(), AppError> {
    input.validate().map_err(|errors| {
        let details = errors
            .field_errors()
            .into_iter()
            .flat_map(|(field, errors)| {
                errors.iter().map(move |error| {
                    ViolationDetail::new(
                        field,
                        error.code.to_string(),
                        error
                            .message
                            .clone()
                            .map(|m| m.to_string())
                            .unwrap_or_else(|| format!("'{field}' failed validation")),
                    )
                })
            })
            .collect();
        AppError::ValidationFailed(details)
    })
}

fn default_method() -> String {
    "POST".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_priority() -> i32 {
    0
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateEntityInput {
    #[validate(length(min = 1, max = 128))]
    pub name: String,
    #[validate(length(min = 1, max = 128))]
    pub table_name: String,
    pub definition: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateEntityInput {
    pub table_name: Option<String>,
    pub definition: Option<Value>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateRelationInput {
    #[validate(length(min = 1, max = 128))]
    pub name: String,
    #[validate(length(min = 1, max = 128))]
    pub source: String,
    #[validate(length(min = 1, max = 128))]
    pub target: String,
    pub definition: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateRelationInput {
    pub source: Option<String>,
    pub target: Option<String>,
    pub definition: Option<Value>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateRuleInput {
    #[validate(length(min = 1, max = 128))]
    pub entity: String,
    #[validate(length(min = 1))]
    pub hook: String,
    #[serde(rename = "type")]
    #[validate(length(min = 1))]
    pub rule_type: String,
    pub definition: Value,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub active: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateRuleInput {
    pub entity: Option<String>,
    pub hook: Option<String>,
    #[serde(rename = "type")]
    pub rule_type: Option<String>,
    pub definition: Option<Value>,
    pub priority: Option<i32>,
    pub active: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateStateMachineInput {
    #[validate(length(min = 1, max = 128))]
    pub entity: String,
    #[validate(length(min = 1, max = 128))]
    pub field: String,
    pub definition: Value,
    #[serde(default = "default_true")]
    pub active: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateStateMachineInput {
    pub entity: Option<String>,
    pub field: Option<String>,
    pub definition: Option<Value>,
    pub active: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateWorkflowInput {
    #[validate(length(min = 1, max = 128))]
    pub name: String,
    pub trigger: Value,
    pub context: Value,
    pub steps: Value,
    #[serde(default = "default_true")]
    pub active: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateWorkflowInput {
    pub trigger: Option<Value>,
    pub context: Option<Value>,
    pub steps: Option<Value>,
    pub active: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreatePermissionInput {
    #[validate(length(min = 1, max = 128))]
    pub entity: String,
    #[validate(length(min = 1))]
    pub action: String,
    pub roles: Value,
    pub conditions: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdatePermissionInput {
    pub entity: Option<String>,
    pub action: Option<String>,
    pub roles: Option<Value>,
    pub conditions: Option<Value>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateWebhookInput {
    #[validate(length(min = 1, max = 128))]
    pub entity: String,
    #[validate(length(min = 1))]
    pub hook: String,
    #[validate(url)]
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    pub headers: Value,
    pub condition: Option<String>,
    #[serde(rename = "async", default = "default_false")]
    pub is_async: bool,
    pub retry: Value,
    #[serde(default = "default_true")]
    pub active: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateWebhookInput {
    pub entity: Option<String>,
    pub hook: Option<String>,
    pub url: Option<String>,
    pub method: Option<String>,
    pub headers: Option<Value>,
    pub condition: Option<String>,
    #[serde(rename = "async")]
    pub is_async: Option<bool>,
    pub retry: Option<Value>,
    pub active: Option<bool>,
}

/// Deserializes and validates `payload` against the `Create*` DTO that
/// matches `collection`; collections with no declared input shape (e.g.
/// `webhook_logs`, which is never admin-created) pass through unchecked.
pub fn validate_create(collection: &str, payload: &Value) -> AppResult<()> {
    match collection {
        "entities" => validate_input(&parse::<CreateEntityInput>(payload)?),
        "relations" => validate_input(&parse::<CreateRelationInput>(payload)?),
        "rules" => validate_input(&parse::<CreateRuleInput>(payload)?),
        "state_machines" => validate_input(&parse::<CreateStateMachineInput>(payload)?),
        "workflows" => validate_input(&parse::<CreateWorkflowInput>(payload)?),
        "permissions" => validate_input(&parse::<CreatePermissionInput>(payload)?),
        "webhooks" => validate_input(&parse::<CreateWebhookInput>(payload)?),
        _ => Ok(()),
    }
}

/// Same shape check as `validate_create` but against the `Update*` DTOs,
/// which carry no `#[validate(...)]` attributes of their own (matching the
/// teacher's `Update*Input` structs) — this only confirms the payload
/// deserializes into the collection's recognized optional fields.
pub fn validate_update(collection: &str, payload: &Value) -> AppResult<()> {
    match collection {
        "entities" => parse::<UpdateEntityInput>(payload).map(|_| ()),
        "relations" => parse::<UpdateRelationInput>(payload).map(|_| ()),
        "rules" => parse::<UpdateRuleInput>(payload).map(|_| ()),
        "state_machines" => parse::<UpdateStateMachineInput>(payload).map(|_| ()),
        "workflows" => parse::<UpdateWorkflowInput>(payload).map(|_| ()),
        "permissions" => parse::<UpdatePermissionInput>(payload).map(|_| ()),
        "webhooks" => parse::<UpdateWebhookInput>(payload).map(|_| ()),
        _ => Ok(()),
    }
}

fn parse<T: for<'de> Deserialize<'de>>(payload: &Value) -> AppResult<T> {
    serde_json::from_value(payload.clone())
        .map_err(|error| AppError::InvalidPayload(format!("payload does not match the expected shape: {error}")))
}
