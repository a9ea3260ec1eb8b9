//! Rule engine: field validators, expression validators and computed
//! fields, run in priority order for a `before_write`/`before_delete` hook
//! (spec §4.6).

use serde_json::Value;

use crate::error::ViolationDetail;
use crate::expr::{self, Env};
use crate::registry::model::{FieldRuleDef, RuleDef, RuleDefinition};

/// Runs every active rule for (entity, hook) against `record` (the
/// resolved write payload) and `old` (the pre-existing row, if any).
/// Field rules run first, then expression rules, then computed rules —
/// exactly the ordering spec §4.5 step 2 and §4.6 prescribe. Computed
/// rules mutate `record` in place; field/expression rules only observe.
pub fn run_before_write(
    rules: &[std::sync::Arc<RuleDef>],
    record: &mut Value,
    old: &Value,
    context: &Value,
) -> Result<(), Vec<ViolationDetail>> {
    let mut violations = Vec::new();

    for rule in rules.iter().filter(|rule| matches!(rule.definition, RuleDefinition::Field(_))) {
        if let RuleDefinition::Field(field_rule) = &rule.definition {
            if let Some(violation) = check_field_rule(field_rule, record) {
                violations.push(violation);
            }
        }
    }

    for rule in rules
        .iter()
        .filter(|rule| matches!(rule.definition, RuleDefinition::Expression(_)))
    {
        if let RuleDefinition::Expression(expr_rule) = &rule.definition {
            let env = Env {
                record: record.clone(),
                old: old.clone(),
                context: context.clone(),
                action: Value::Null,
            };
            let violated = expr::eval_bool(&expr_rule.expression, &env).unwrap_or(false);
            if violated {
                violations.push(ViolationDetail::new(
                    "_expression",
                    "expression",
                    expr_rule.message.clone(),
                ));
                if expr_rule.stop_on_fail {
                    break;
                }
            }
        }
    }

    if !violations.is_empty() {
        return Err(violations);
    }

    for rule in rules
        .iter()
        .filter(|rule| matches!(rule.definition, RuleDefinition::Computed(_)))
    {
        if let RuleDefinition::Computed(computed) = &rule.definition {
            let env = Env {
                record: record.clone(),
                old: old.clone(),
                context: context.clone(),
                action: Value::Null,
            };
            if let Ok(value) = expr::compile(&computed.expression).and_then(|compiled| compiled.eval(&env)) {
                if let Some(object) = record.as_object_mut() {
                    object.insert(computed.target.clone(), value);
                }
            }
        }
    }

    Ok(())
}

fn check_field_rule(rule: &FieldRuleDef, record: &Value) -> Option<ViolationDetail> {
    let value = record.get(&rule.field).cloned().unwrap_or(Value::Null);
    let ok = match rule.operator.as_str() {
        "required" => !value.is_null() && value != Value::String(String::new()),
        "min" => compare_numeric(&value, &rule.value, |a, b| a >= b).unwrap_or(true),
        "max" => compare_numeric(&value, &rule.value, |a, b| a <= b).unwrap_or(true),
        "length" => {
            let expected = rule.value.as_ref().and_then(Value::as_u64).unwrap_or(0) as usize;
            match &value {
                Value::String(s) => s.chars().count() == expected,
                Value::Null => true,
                _ => true,
            }
        }
        "matches" => {
            let pattern = rule.value.as_ref().and_then(Value::as_str).unwrap_or("");
            match (&value, regex::Regex::new(pattern)) {
                (Value::String(s), Ok(regex)) => regex.is_match(s),
                _ => true,
            }
        }
        "one_of" => {
            let options = rule.value.as_ref().and_then(Value::as_array).cloned().unwrap_or_default();
            value.is_null() || options.iter().any(|option| option == &value)
        }
        _ => true,
    };

    if ok {
        None
    } else {
        Some(ViolationDetail::new(
            rule.field.clone(),
            rule.operator.clone(),
            rule.message.clone(),
        ))
    }
}

fn compare_numeric(value: &Value, bound: &Option<Value>, op: impl Fn(f64, f64) -> bool) -> Option<bool> {
    let value = numeric(value)?;
    let bound = bound.as_ref().and_then(numeric)?;
    Some(op(value, bound))
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::model::{RuleHook};
    use std::sync::Arc;

    fn field_rule(field: &str, operator: &str, value: Option<Value>, message: &str) -> Arc<RuleDef> {
        Arc::new(RuleDef {
            id: "r1".to_string(),
            entity: "invoice".to_string(),
            hook: RuleHook::BeforeWrite,
            priority: 0,
            active: true,
            definition: RuleDefinition::Field(FieldRuleDef {
                field: field.to_string(),
                operator: operator.to_string(),
                value,
                message: message.to_string(),
            }),
        })
    }

    #[test]
    fn min_rule_rejects_negative_total() {
        let rules = vec![field_rule("total", "min", Some(Value::from(0)), "total must be non-negative")];
        let mut record = serde_json::json!({ "total": -5 });
        let result = run_before_write(&rules, &mut record, &Value::Null, &Value::Null);
        let violations = result.unwrap_err();
        assert_eq!(violations[0].field, "total");
        assert_eq!(violations[0].rule, "min");
    }

    #[test]
    fn min_rule_accepts_non_negative_total() {
        let rules = vec![field_rule("total", "min", Some(Value::from(0)), "total must be non-negative")];
        let mut record = serde_json::json!({ "total": 19.99 });
        assert!(run_before_write(&rules, &mut record, &Value::Null, &Value::Null).is_ok());
    }

    #[test]
    fn computed_rule_assigns_target_field() {
        let rule = Arc::new(RuleDef {
            id: "r2".to_string(),
            entity: "invoice".to_string(),
            hook: RuleHook::BeforeWrite,
            priority: 1,
            active: true,
            definition: RuleDefinition::Computed(crate::registry::model::ComputedRuleDef {
                target: "is_large".to_string(),
                expression: "record.total > 1000".to_string(),
            }),
        });
        let mut record = serde_json::json!({ "total": 2000 });
        run_before_write(&[rule], &mut record, &Value::Null, &Value::Null).unwrap();
        assert_eq!(record["is_large"], Value::Bool(true));
    }
}
