//! Filter/sort/paginate/include parsing and SQL plan construction
//! (spec §4.4).

use std::collections::HashMap;

use serde_json::Value;

use crate::error::{AppError, AppResult};
use crate::registry::model::{EntityDef, FieldType, RelationDef};
use crate::store::{infer_scalar, BindValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOperator {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Like,
    In,
    NotIn,
    IsNull,
    IsNotNull,
}

impl FilterOperator {
    fn parse(raw: &str) -> AppResult<Self> {
        match raw {
            "eq" => Ok(Self::Eq),
            "neq" => Ok(Self::Neq),
            "gt" => Ok(Self::Gt),
            "gte" => Ok(Self::Gte),
            "lt" => Ok(Self::Lt),
            "lte" => Ok(Self::Lte),
            "like" => Ok(Self::Like),
            "in" => Ok(Self::In),
            "not_in" => Ok(Self::NotIn),
            "is_null" => Ok(Self::IsNull),
            "is_not_null" => Ok(Self::IsNotNull),
            other => Err(AppError::InvalidPayload(format!("unknown filter operator '{other}'"))),
        }
    }

    fn sql(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Neq => "!=",
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Lt => "<",
            Self::Lte => "<=",
            Self::Like => "LIKE",
            Self::In => "IN",
            Self::NotIn => "NOT IN",
            Self::IsNull => "IS NULL",
            Self::IsNotNull => "IS NOT NULL",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FilterClause {
    pub field: String,
    pub operator: FilterOperator,
    pub value: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct SortClause {
    pub field: String,
    pub descending: bool,
}

#[derive(Debug, Clone)]
pub struct ParsedQuery {
    pub filters: Vec<FilterClause>,
    pub sort: Vec<SortClause>,
    pub page: i64,
    pub per_page: i64,
    pub include: Vec<String>,
}

/// `filter[field]=v` (eq) / `filter[field.op]=v` bracket syntax
/// (spec §4.4). `pairs` is the raw, possibly-repeated query string.
pub fn parse_query(entity: &EntityDef, pairs: &[(String, String)]) -> AppResult<ParsedQuery> {
    let mut filters = Vec::new();
    let mut sort = Vec::new();
    let mut page = 1_i64;
    let mut per_page = 25_i64;
    let mut include = Vec::new();

    for (key, value) in pairs {
        if let Some(rest) = key.strip_prefix("filter[").and_then(|s| s.strip_suffix(']')) {
            let (field, operator) = match rest.split_once('.') {
                Some((field, op)) => (field, FilterOperator::parse(op)?),
                None => (rest, FilterOperator::Eq),
            };
            if !entity.has_field(field) && field != entity.primary_key.field {
                return Err(AppError::InvalidPayload(format!("unknown filter field '{field}'")));
            }
            let coerced = coerce_filter_value(entity, field, operator, value)?;
            filters.push(FilterClause {
                field: field.to_string(),
                operator,
                value: coerced,
            });
            continue;
        }

        match key.as_str() {
            "sort" => {
                for part in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                    let (descending, field) = match part.strip_prefix('-') {
                        Some(rest) => (true, rest),
                        None => (false, part),
                    };
                    if !entity.has_field(field) && field != entity.primary_key.field {
                        return Err(AppError::InvalidPayload(format!("unknown sort field '{field}'")));
                    }
                    sort.push(SortClause {
                        field: field.to_string(),
                        descending,
                    });
                }
            }
            "page" => {
                page = value
                    .parse::<i64>()
                    .map_err(|_| AppError::InvalidPayload("page must be an integer".to_string()))?;
                if page < 1 {
                    return Err(AppError::InvalidPayload("page must be >= 1".to_string()));
                }
            }
            "per_page" => {
                let requested: i64 = value
                    .parse()
                    .map_err(|_| AppError::InvalidPayload("per_page must be an integer".to_string()))?;
                if requested == 0 {
                    return Err(AppError::InvalidPayload("per_page must be >= 1".to_string()));
                }
                per_page = requested.clamp(1, 100);
            }
            "include" => {
                for name in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                    include.push(name.to_string());
                }
            }
            _ => {}
        }
    }

    Ok(ParsedQuery {
        filters,
        sort,
        page,
        per_page,
        include,
    })
}

fn coerce_filter_value(
    entity: &EntityDef,
    field: &str,
    operator: FilterOperator,
    raw: &str,
) -> AppResult<Option<Value>> {
    if matches!(operator, FilterOperator::IsNull | FilterOperator::IsNotNull) {
        return Ok(None);
    }
    let field_type = entity.field(field).map(|f| f.field_type).unwrap_or(FieldType::String);

    if matches!(operator, FilterOperator::In | FilterOperator::NotIn) {
        let items: Vec<Value> = raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|item| coerce_scalar(field_type, item))
            .collect();
        return Ok(Some(Value::Array(items)));
    }

    Ok(Some(coerce_scalar(field_type, raw)))
}

fn coerce_scalar(field_type: FieldType, raw: &str) -> Value {
    match field_type {
        FieldType::Int | FieldType::Bigint => raw
            .parse::<i64>()
            .map(|n| Value::Number(n.into()))
            .unwrap_or_else(|_| Value::String(raw.to_string())),
        FieldType::Float | FieldType::Decimal => serde_json::Number::from_f64(raw.parse().unwrap_or(0.0))
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(raw.to_string())),
        FieldType::Boolean => raw
            .parse::<bool>()
            .map(Value::Bool)
            .unwrap_or_else(|_| Value::String(raw.to_string())),
        _ => Value::String(raw.to_string()),
    }
}

/// A fully-built SQL plan: template SQL with `?` placeholders (rewritten
/// per-dialect by `Store`) plus the bound parameters in order.
#[derive(Debug, Clone)]
pub struct Plan {
    pub table: String,
    pub where_sql: String,
    pub params: Vec<BindValue>,
    pub order_by_sql: String,
    pub limit: i64,
    pub offset: i64,
}

/// Row-level filters contributed by the Permission evaluator, appended
/// after user-supplied filters so they cannot be bypassed (spec §4.4,
/// §4.10). Each inner vec is AND-combined; the outer vec is OR-combined
/// (one per matching permission).
pub struct PermissionFilters(pub Vec<Vec<FilterClause>>);

pub fn build_plan(
    entity: &EntityDef,
    query: &ParsedQuery,
    permission_filters: &PermissionFilters,
    admin_bypass: bool,
) -> Plan {
    let mut clauses = Vec::new();
    let mut params = Vec::new();

    for filter in &query.filters {
        push_clause(&mut clauses, &mut params, filter);
    }

    if entity.soft_delete && !admin_bypass {
        clauses.push(format!("{}.deleted_at IS NULL", entity.table));
    }

    if !admin_bypass && !permission_filters.0.is_empty() {
        let mut or_groups = Vec::new();
        for group in &permission_filters.0 {
            let mut and_clauses = Vec::new();
            for filter in group {
                push_clause(&mut and_clauses, &mut params, filter);
            }
            if !and_clauses.is_empty() {
                or_groups.push(format!("({})", and_clauses.join(" AND ")));
            }
        }
        if !or_groups.is_empty() {
            clauses.push(format!("({})", or_groups.join(" OR ")));
        }
    }

    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };

    let order_by_sql = if query.sort.is_empty() {
        String::new()
    } else {
        let parts: Vec<String> = query
            .sort
            .iter()
            .map(|sort| format!("{} {}", sort.field, if sort.descending { "DESC" } else { "ASC" }))
            .collect();
        format!("ORDER BY {}", parts.join(", "))
    };

    Plan {
        table: entity.table.clone(),
        where_sql,
        params,
        order_by_sql,
        limit: query.per_page,
        offset: (query.page - 1) * query.per_page,
    }
}

fn push_clause(clauses: &mut Vec<String>, params: &mut Vec<BindValue>, filter: &FilterClause) {
    match filter.operator {
        FilterOperator::IsNull => clauses.push(format!("{} IS NULL", filter.field)),
        FilterOperator::IsNotNull => clauses.push(format!("{} IS NOT NULL", filter.field)),
        FilterOperator::In | FilterOperator::NotIn => {
            let items = filter.value.as_ref().and_then(Value::as_array).cloned().unwrap_or_default();
            if items.is_empty() {
                // spec §8: `in=` with an empty list yields an empty result set, not a 400.
                clauses.push("1 = 0".to_string());
                return;
            }
            let placeholders = vec!["?"; items.len()].join(", ");
            clauses.push(format!("{} {} ({})", filter.field, filter.operator.sql(), placeholders));
            for item in items {
                params.push(infer_scalar(&filter.field, &item));
            }
        }
        FilterOperator::Like => {
            clauses.push(format!("{} LIKE ?", filter.field));
            params.push(infer_scalar(&filter.field, filter.value.as_ref().unwrap_or(&Value::Null)));
        }
        _ => {
            clauses.push(format!("{} {} ?", filter.field, filter.operator.sql()));
            params.push(infer_scalar(&filter.field, filter.value.as_ref().unwrap_or(&Value::Null)));
        }
    }
}

/// Builds the `SELECT` and the paired `SELECT COUNT(*)` from the same
/// plan; the count statement omits `ORDER BY`/`LIMIT`/`OFFSET` and any
/// `include`s (spec §4.4).
pub fn data_sql(plan: &Plan) -> String {
    format!(
        "SELECT * FROM {} {} {} LIMIT {} OFFSET {}",
        plan.table, plan.where_sql, plan.order_by_sql, plan.limit, plan.offset
    )
}

pub fn count_sql(plan: &Plan) -> String {
    format!("SELECT COUNT(*) AS total FROM {} {}", plan.table, plan.where_sql)
}

/// Resolves `include=` relation names against the source entity's
/// relation index. Each named relation must be declared on this entity;
/// recursion is not supported (spec §4.4, §9 Open Questions).
pub fn resolve_includes<'a>(
    requested: &[String],
    relations: &'a [std::sync::Arc<RelationDef>],
) -> AppResult<Vec<&'a RelationDef>> {
    let mut resolved = Vec::with_capacity(requested.len());
    for name in requested {
        let relation = relations
            .iter()
            .find(|relation| &relation.name == name)
            .ok_or_else(|| AppError::NotFound(format!("unknown relation '{name}'")))?;
        resolved.push(relation.as_ref());
    }
    Ok(resolved)
}

/// Stitches batched child rows back onto their parents by key, grouping
/// on the relation's `target_key` (1-x) as spec §4.4's includes loader
/// describes ("issue one batched query per relation ... stitch results
/// back by key").
pub fn group_rows_by_key(rows: Vec<Value>, key_field: &str) -> HashMap<String, Vec<Value>> {
    let mut groups: HashMap<String, Vec<Value>> = HashMap::new();
    for row in rows {
        let key = row
            .get(key_field)
            .and_then(Value::as_str)
            .map(ToOwned::to_owned)
            .unwrap_or_default();
        groups.entry(key).or_default().push(row);
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::model::{Field, PrimaryKey, PrimaryKeyType};

    fn invoice_entity() -> EntityDef {
        EntityDef {
            name: "invoice".to_string(),
            table: "invoice".to_string(),
            primary_key: PrimaryKey {
                field: "id".to_string(),
                key_type: PrimaryKeyType::Uuid,
                generated: true,
            },
            fields: vec![
                Field {
                    name: "total".to_string(),
                    field_type: FieldType::Decimal,
                    required: true,
                    unique: false,
                    nullable: false,
                    default: None,
                    enum_values: None,
                    auto: None,
                    precision: Some(2),
                },
                Field {
                    name: "status".to_string(),
                    field_type: FieldType::String,
                    required: false,
                    unique: false,
                    nullable: true,
                    default: None,
                    enum_values: None,
                    auto: None,
                    precision: None,
                },
            ],
            soft_delete: true,
            slug: None,
        }
    }

    #[test]
    fn per_page_zero_is_rejected() {
        let entity = invoice_entity();
        let pairs = vec![("per_page".to_string(), "0".to_string())];
        assert!(parse_query(&entity, &pairs).is_err());
    }

    #[test]
    fn per_page_over_100_is_clamped() {
        let entity = invoice_entity();
        let pairs = vec![("per_page".to_string(), "500".to_string())];
        let parsed = parse_query(&entity, &pairs).unwrap();
        assert_eq!(parsed.per_page, 100);
    }

    #[test]
    fn bracket_filter_with_operator_parses() {
        let entity = invoice_entity();
        let pairs = vec![("filter[total.gt]".to_string(), "5".to_string())];
        let parsed = parse_query(&entity, &pairs).unwrap();
        assert_eq!(parsed.filters[0].operator, FilterOperator::Gt);
    }

    #[test]
    fn unknown_sort_field_is_rejected() {
        let entity = invoice_entity();
        let pairs = vec![("sort".to_string(), "nonexistent".to_string())];
        assert!(parse_query(&entity, &pairs).is_err());
    }

    #[test]
    fn soft_delete_adds_deleted_at_filter() {
        let entity = invoice_entity();
        let query = parse_query(&entity, &[]).unwrap();
        let plan = build_plan(&entity, &query, &PermissionFilters(vec![]), false);
        assert!(plan.where_sql.contains("deleted_at IS NULL"));
    }

    #[test]
    fn admin_bypass_skips_soft_delete_filter() {
        let entity = invoice_entity();
        let query = parse_query(&entity, &[]).unwrap();
        let plan = build_plan(&entity, &query, &PermissionFilters(vec![]), true);
        assert!(!plan.where_sql.contains("deleted_at"));
    }

    #[test]
    fn empty_in_list_short_circuits_to_no_rows() {
        let entity = invoice_entity();
        let pairs = vec![("filter[status.in]".to_string(), "".to_string())];
        let query = parse_query(&entity, &pairs).unwrap();
        let plan = build_plan(&entity, &query, &PermissionFilters(vec![]), true);
        assert!(plan.where_sql.contains("1 = 0"));
    }
}
