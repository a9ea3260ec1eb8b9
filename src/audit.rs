//! Audit trail for metadata mutations (spec §3 supplement): every admin
//! write to a catalog table gets one `_audit_logs` row, mirroring the
//! same "durable row per significant boundary" habit the instrumenter
//! applies to request spans (`instrument::Span::close`).

use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use crate::error::AppResult;
use crate::store::{BindValue, Store};

pub async fn record(
    store: &Store,
    actor_user_id: &str,
    action: &str,
    entity: &str,
    entity_id: Option<&str>,
    before: Option<&Value>,
    after: Option<&Value>,
) -> AppResult<()> {
    let sql = "INSERT INTO _audit_logs \
        (id, organization_scope, actor_user_id, action, entity, entity_id, before, after, created_at) \
        VALUES (?, NULL, ?, ?, ?, ?, ?, ?, ?)";
    let params = vec![
        BindValue::Text(Uuid::new_v4().to_string()),
        BindValue::Text(actor_user_id.to_string()),
        BindValue::Text(action.to_string()),
        BindValue::Text(entity.to_string()),
        entity_id.map(|id| BindValue::Text(id.to_string())).unwrap_or(BindValue::Null),
        before.map(|v| BindValue::Text(v.to_string())).unwrap_or(BindValue::Null),
        after.map(|v| BindValue::Text(v.to_string())).unwrap_or(BindValue::Null),
        BindValue::Text(Utc::now().to_rfc3339()),
    ];
    store.exec(sql, &params).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn before_after_serialize_as_json_text() {
        let before = serde_json::json!({ "active": true });
        assert_eq!(before.to_string(), "{\"active\":true}");
    }
}
