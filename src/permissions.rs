//! Role + condition permission evaluation (spec §4.10), grounded on the
//! teacher's `tenancy.rs` role-check pattern (`assert_org_member`,
//! `assert_org_role`) generalized from a fixed membership table to
//! catalog-backed `Permission` rows.

use std::sync::Arc;

use serde_json::Value;

use crate::auth::CurrentUser;
use crate::error::{AppError, AppResult};
use crate::query_planner::{FilterClause, FilterOperator, PermissionFilters};
use crate::registry::model::{ConditionOperator, PermissionAction, PermissionCondition, PermissionDef};

/// For `create`/`update`/`delete`: does any permission matching the
/// user's roles also match the resolved record's conditions?
pub fn authorize_write(
    permissions: &[Arc<PermissionDef>],
    user: &CurrentUser,
    record: &Value,
) -> AppResult<()> {
    if user.is_admin() {
        return Ok(());
    }
    if permissions.is_empty() {
        return Err(AppError::Forbidden("no permission grants this action".to_string()));
    }

    let matched = permissions.iter().any(|permission| {
        role_matches(permission, user) && conditions_match(&permission.conditions, record)
    });

    if matched {
        Ok(())
    } else {
        Err(AppError::Forbidden("permission denied".to_string()))
    }
}

/// For `read`: returns the OR-combined set of row filters contributed by
/// every permission whose role matches. An admin bypasses entirely
/// (returns `None` meaning "no extra filters, no restriction").
pub fn read_filters(
    permissions: &[Arc<PermissionDef>],
    user: &CurrentUser,
) -> AppResult<Option<PermissionFilters>> {
    if user.is_admin() {
        return Ok(None);
    }
    if permissions.is_empty() {
        return Err(AppError::Forbidden("no permission grants read access".to_string()));
    }

    let matching: Vec<Arc<PermissionDef>> = permissions
        .iter()
        .filter(|permission| role_matches(permission, user))
        .cloned()
        .collect();

    if matching.is_empty() {
        return Err(AppError::Forbidden("permission denied".to_string()));
    }

    let groups = matching
        .iter()
        .map(|permission| permission.conditions.iter().map(to_filter_clause).collect())
        .collect();

    Ok(Some(PermissionFilters(groups)))
}

fn role_matches(permission: &PermissionDef, user: &CurrentUser) -> bool {
    permission.roles.iter().any(|role| user.has_role(role)) || permission.roles.iter().any(|role| role == "*")
}

fn conditions_match(conditions: &[PermissionCondition], record: &Value) -> bool {
    conditions.iter().all(|condition| condition_matches(condition, record))
}

fn condition_matches(condition: &PermissionCondition, record: &Value) -> bool {
    let actual = record.get(&condition.field).cloned().unwrap_or(Value::Null);
    match condition.operator {
        ConditionOperator::Eq => actual == condition.value,
        ConditionOperator::Neq => actual != condition.value,
        ConditionOperator::Gt | ConditionOperator::Gte | ConditionOperator::Lt | ConditionOperator::Lte => {
            let (Some(a), Some(b)) = (actual.as_f64(), condition.value.as_f64()) else {
                return false;
            };
            match condition.operator {
                ConditionOperator::Gt => a > b,
                ConditionOperator::Gte => a >= b,
                ConditionOperator::Lt => a < b,
                ConditionOperator::Lte => a <= b,
                _ => unreachable!(),
            }
        }
        ConditionOperator::In => condition
            .value
            .as_array()
            .map(|items| items.contains(&actual))
            .unwrap_or(false),
        ConditionOperator::NotIn => condition
            .value
            .as_array()
            .map(|items| !items.contains(&actual))
            .unwrap_or(true),
    }
}

fn to_filter_clause(condition: &PermissionCondition) -> FilterClause {
    let operator = match condition.operator {
        ConditionOperator::Eq => FilterOperator::Eq,
        ConditionOperator::Neq => FilterOperator::Neq,
        ConditionOperator::Gt => FilterOperator::Gt,
        ConditionOperator::Gte => FilterOperator::Gte,
        ConditionOperator::Lt => FilterOperator::Lt,
        ConditionOperator::Lte => FilterOperator::Lte,
        ConditionOperator::In => FilterOperator::In,
        ConditionOperator::NotIn => FilterOperator::NotIn,
    };
    FilterClause {
        field: condition.field.clone(),
        operator,
        value: Some(condition.value.clone()),
    }
}

pub fn action_for_method(method: &str) -> PermissionAction {
    match method {
        "POST" => PermissionAction::Create,
        "PUT" | "PATCH" => PermissionAction::Update,
        "DELETE" => PermissionAction::Delete,
        _ => PermissionAction::Read,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn permission(roles: Vec<&str>, conditions: Vec<PermissionCondition>) -> Arc<PermissionDef> {
        Arc::new(PermissionDef {
            id: "p1".to_string(),
            entity: "invoice".to_string(),
            action: PermissionAction::Update,
            roles: roles.into_iter().map(str::to_string).collect(),
            conditions,
        })
    }

    #[test]
    fn admin_bypasses_condition_evaluation() {
        let user = CurrentUser {
            id: "u1".to_string(),
            roles: vec!["admin".to_string()],
        };
        let result = authorize_write(&[], &user, &Value::Null);
        assert!(result.is_ok());
    }

    #[test]
    fn no_matching_permission_is_forbidden() {
        let user = CurrentUser {
            id: "u1".to_string(),
            roles: vec!["viewer".to_string()],
        };
        let permissions = vec![permission(vec!["editor"], vec![])];
        assert!(authorize_write(&permissions, &user, &Value::Null).is_err());
    }

    #[test]
    fn condition_must_match_resolved_record() {
        let user = CurrentUser {
            id: "u1".to_string(),
            roles: vec!["owner".to_string()],
        };
        let conditions = vec![PermissionCondition {
            field: "owner_id".to_string(),
            operator: ConditionOperator::Eq,
            value: Value::String("u1".to_string()),
        }];
        let permissions = vec![permission(vec!["owner"], conditions)];

        let matching_record = serde_json::json!({ "owner_id": "u1" });
        assert!(authorize_write(&permissions, &user, &matching_record).is_ok());

        let other_record = serde_json::json!({ "owner_id": "u2" });
        assert!(authorize_write(&permissions, &user, &other_record).is_err());
    }
}
