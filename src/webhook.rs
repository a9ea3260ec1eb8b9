//! Webhook dispatcher (spec §4.9): synchronous delivery inside the write
//! transaction, and a durable, CAS-claimed queue for asynchronous delivery
//! — grounded on the teacher's `workflow_jobs`/`workflow_job_attempts`
//! claim pattern (`routes/workflows.rs::process_workflow_jobs`) and
//! `notification_center.rs`'s `dedupe_key` idempotency scheme.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::expr::{self, Env};
use crate::registry::model::{BackoffKind, WebhookDef};
use crate::state::AppState;
use crate::store::BindValue;

pub fn idempotency_key(webhook_id: &str, record_id: &str, action: &str, attempt: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(webhook_id.as_bytes());
    hasher.update(b"|");
    hasher.update(record_id.as_bytes());
    hasher.update(b"|");
    hasher.update(action.as_bytes());
    hasher.update(b"|");
    hasher.update(attempt.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// `backoff(attempt)` (spec §4.9): `min(max, base * 2^(attempt-1)) + jitter`
/// for exponential; a fixed interval for `fixed`. Jitter is derived from
/// the idempotency key so retries stay deterministic in tests.
pub fn backoff_duration(kind: BackoffKind, attempt: u32, base_ms: u64, max_ms: u64, jitter_seed: u64) -> Duration {
    let millis = match kind {
        BackoffKind::Fixed => base_ms,
        BackoffKind::Exponential => {
            let exponent = attempt.saturating_sub(1).min(32);
            let scaled = base_ms.saturating_mul(1u64 << exponent);
            scaled.min(max_ms)
        }
    };
    let jitter = jitter_seed % (base_ms.max(1) / 2 + 1);
    Duration::from_millis(millis.saturating_add(jitter))
}

/// Evaluates the webhook's `condition` against `{record, old, action}`;
/// a falsy condition suppresses the delivery silently before any log row
/// is written (spec §4.9).
pub fn condition_passes(webhook: &WebhookDef, record: &Value, old: &Value, action: &str) -> bool {
    let Some(condition) = &webhook.condition else {
        return true;
    };
    let env = Env {
        record: record.clone(),
        old: old.clone(),
        context: Value::Null,
        action: Value::String(action.to_string()),
    };
    expr::eval_bool(condition, &env).unwrap_or(false)
}

/// Inserts the pending `WebhookLog` row. Shared by both the sync path
/// (executed immediately after) and the async path (picked up later by a
/// worker).
pub async fn enqueue(
    state: &AppState,
    webhook: &WebhookDef,
    entity: &str,
    record: &Value,
    action: &str,
) -> AppResult<String> {
    let record_id = record.get("id").and_then(Value::as_str).unwrap_or_default();
    let key = idempotency_key(&webhook.id, record_id, action, 1);
    let headers = serde_json::to_value(&webhook.headers).unwrap_or(Value::Null);

    let sql = "INSERT INTO _webhook_logs \
        (id, webhook_id, entity, hook, action, url, method, request_headers, request_body, response_status, response_body, \
         status, attempt, max_attempts, next_retry_at, error, idempotency_key, created_at, updated_at) \
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, NULL, 'pending', 0, ?, ?, NULL, ?, ?, ?) \
        ON CONFLICT (idempotency_key) DO NOTHING";

    let log_id = Uuid::new_v4().to_string();
    let now = Utc::now();
    let params = vec![
        BindValue::Text(log_id.clone()),
        BindValue::Text(webhook.id.clone()),
        BindValue::Text(entity.to_string()),
        BindValue::Text(format!("{:?}", webhook.hook)),
        BindValue::Text(action.to_string()),
        BindValue::Text(webhook.url.clone()),
        BindValue::Text(webhook.method.clone()),
        BindValue::Json(headers),
        BindValue::Json(record.clone()),
        BindValue::I64(webhook.retry.max_attempts as i64),
        BindValue::Timestamp(now),
        BindValue::Text(key),
        BindValue::Timestamp(now),
        BindValue::Timestamp(now),
    ];
    state.store.exec(sql, &params).await?;
    Ok(log_id)
}

/// Synchronous delivery (spec §4.9): runs inline; a non-2xx or transport
/// failure bubbles up so the caller's transaction rolls back.
pub async fn deliver_sync(state: &AppState, webhook: &WebhookDef, log_id: &str, record: &Value) -> AppResult<()> {
    let response = send_request(state, webhook, record).await;
    match response {
        Ok(status) if (200..300).contains(&status) => {
            mark_delivered(state, log_id, status as i64).await?;
            Ok(())
        }
        Ok(status) => {
            mark_failed(state, log_id, Some(status as i64), "non-2xx response").await?;
            Err(AppError::Internal(format!(
                "synchronous webhook '{}' returned status {status}",
                webhook.id
            )))
        }
        Err(error) => {
            mark_failed(state, log_id, None, &error.to_string()).await?;
            Err(AppError::Internal(format!(
                "synchronous webhook '{}' failed: {error}",
                webhook.id
            )))
        }
    }
}

async fn send_request(state: &AppState, webhook: &WebhookDef, record: &Value) -> Result<u16, reqwest::Error> {
    let method = reqwest::Method::from_bytes(webhook.method.as_bytes()).unwrap_or(reqwest::Method::POST);
    let mut request = state.http_client.request(method, &webhook.url).json(record);
    for (name, value) in &webhook.headers {
        request = request.header(name, value);
    }
    let response = request
        .timeout(Duration::from_millis(state.config.webhook_attempt_timeout_ms))
        .send()
        .await?;
    Ok(response.status().as_u16())
}

async fn mark_delivered(state: &AppState, log_id: &str, status: i64) -> AppResult<()> {
    let sql = "UPDATE _webhook_logs SET status = 'delivered', response_status = ?, updated_at = ? WHERE id = ?";
    let params = vec![BindValue::I64(status), BindValue::Timestamp(Utc::now()), BindValue::Text(log_id.to_string())];
    state.store.exec(sql, &params).await?;
    Ok(())
}

async fn mark_failed(state: &AppState, log_id: &str, status: Option<i64>, error: &str) -> AppResult<()> {
    let sql = "UPDATE _webhook_logs SET status = 'failed', response_status = ?, error = ?, updated_at = ? WHERE id = ?";
    let params = vec![
        status.map(BindValue::I64).unwrap_or(BindValue::Null),
        BindValue::Text(error.to_string()),
        BindValue::Timestamp(Utc::now()),
        BindValue::Text(log_id.to_string()),
    ];
    state.store.exec(sql, &params).await?;
    Ok(())
}

/// One worker's iteration: claim the next due row with a CAS update from
/// `pending`/`retrying`, attempt delivery, then mark `delivered` or
/// `retrying`/`failed` per spec §4.9.
pub async fn run_worker_tick(state: &AppState) -> AppResult<bool> {
    let Some(claimed) = claim_next_due(state).await? else {
        return Ok(false);
    };

    let url = claimed.get("url").and_then(Value::as_str).unwrap_or_default().to_string();
    let method = claimed.get("method").and_then(Value::as_str).unwrap_or("POST").to_string();
    let body = claimed.get("request_body").cloned().unwrap_or(Value::Null);
    let id = claimed.get("id").and_then(Value::as_str).unwrap_or_default().to_string();
    let attempt = claimed.get("attempt").and_then(Value::as_i64).unwrap_or(0) + 1;
    let max_attempts = claimed.get("max_attempts").and_then(Value::as_i64).unwrap_or(5);

    let http_method = reqwest::Method::from_bytes(method.as_bytes()).unwrap_or(reqwest::Method::POST);
    let outcome = state
        .http_client
        .request(http_method, &url)
        .json(&body)
        .timeout(Duration::from_millis(state.config.webhook_attempt_timeout_ms))
        .send()
        .await;

    match outcome {
        Ok(response) if response.status().is_success() => {
            mark_delivered(state, &id, response.status().as_u16() as i64).await?;
        }
        Ok(response) => {
            handle_attempt_failure(state, &claimed, attempt, max_attempts, Some(response.status().as_u16() as i64), "non-2xx response").await?;
        }
        Err(error) => {
            handle_attempt_failure(state, &claimed, attempt, max_attempts, None, &error.to_string()).await?;
        }
    }
    Ok(true)
}

/// Closes out the claimed row's own outcome (`failed`, always — a row
/// never lives in `retrying` once its one delivery attempt has resolved)
/// and, if attempts remain, inserts a brand-new `pending` row for the next
/// attempt: spec scenario S5 wants one row per attempt, all sharing the
/// same `(webhook_id, record_id, action)` idempotency-key series.
async fn handle_attempt_failure(
    state: &AppState,
    claimed: &Value,
    attempt: i64,
    max_attempts: i64,
    status: Option<i64>,
    error: &str,
) -> AppResult<()> {
    let log_id = claimed.get("id").and_then(Value::as_str).unwrap_or_default();
    let sql = "UPDATE _webhook_logs SET status = 'failed', attempt = ?, response_status = ?, error = ?, updated_at = ? WHERE id = ?";
    let params = vec![
        BindValue::I64(attempt),
        status.map(BindValue::I64).unwrap_or(BindValue::Null),
        BindValue::Text(error.to_string()),
        BindValue::Timestamp(Utc::now()),
        BindValue::Text(log_id.to_string()),
    ];
    state.store.exec(sql, &params).await?;

    if attempt >= max_attempts {
        return Ok(());
    }

    let webhook_id = claimed.get("webhook_id").and_then(Value::as_str).unwrap_or_default();
    let entity = claimed.get("entity").and_then(Value::as_str).unwrap_or_default();
    let hook = claimed.get("hook").and_then(Value::as_str).unwrap_or_default();
    let action = claimed.get("action").and_then(Value::as_str).unwrap_or_default();
    let url = claimed.get("url").and_then(Value::as_str).unwrap_or_default();
    let method = claimed.get("method").and_then(Value::as_str).unwrap_or("POST");
    let request_headers = claimed.get("request_headers").cloned().unwrap_or(Value::Null);
    let request_body = claimed.get("request_body").cloned().unwrap_or(Value::Null);
    let record_id = request_body.get("id").and_then(Value::as_str).unwrap_or_default();

    let backoff = backoff_duration(
        BackoffKind::Exponential,
        attempt as u32,
        state.config.webhook_backoff_base_ms,
        state.config.webhook_backoff_max_ms,
        attempt as u64,
    );
    let next_retry_at = Utc::now() + chrono::Duration::milliseconds(backoff.as_millis() as i64);
    let key = idempotency_key(webhook_id, record_id, action, (attempt + 1) as u32);

    let insert_sql = "INSERT INTO _webhook_logs \
        (id, webhook_id, entity, hook, action, url, method, request_headers, request_body, response_status, response_body, \
         status, attempt, max_attempts, next_retry_at, error, idempotency_key, created_at, updated_at) \
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, NULL, 'pending', ?, ?, ?, NULL, ?, ?, ?) \
        ON CONFLICT (idempotency_key) DO NOTHING";
    let now = Utc::now();
    let params = vec![
        BindValue::Text(Uuid::new_v4().to_string()),
        BindValue::Text(webhook_id.to_string()),
        BindValue::Text(entity.to_string()),
        BindValue::Text(hook.to_string()),
        BindValue::Text(action.to_string()),
        BindValue::Text(url.to_string()),
        BindValue::Text(method.to_string()),
        BindValue::Json(request_headers),
        BindValue::Json(request_body),
        BindValue::I64(attempt),
        BindValue::I64(max_attempts),
        BindValue::Timestamp(next_retry_at),
        BindValue::Text(key),
        BindValue::Timestamp(now),
        BindValue::Timestamp(now),
    ];
    state.store.exec(insert_sql, &params).await?;
    Ok(())
}

/// Claims one due row via an `UPDATE ... WHERE status IN (...) AND
/// next_retry_at <= now` CAS, then re-selects it. No in-memory locking —
/// concurrent workers race on the row and exactly one wins the update.
/// The in-flight marker is `retrying`, one of the spec's four documented
/// statuses — never a fifth "delivering" value.
async fn claim_next_due(state: &AppState) -> AppResult<Option<Value>> {
    let candidate = state
        .store
        .query_row(
            "SELECT id FROM _webhook_logs WHERE status = 'pending' \
             AND (next_retry_at IS NULL OR next_retry_at <= ?) ORDER BY created_at ASC LIMIT 1",
            &[BindValue::Timestamp(Utc::now())],
        )
        .await?;
    let Some(candidate) = candidate else {
        return Ok(None);
    };
    let id = candidate.get("id").and_then(Value::as_str).unwrap_or_default().to_string();

    let claimed = state
        .store
        .exec(
            "UPDATE _webhook_logs SET status = 'retrying', updated_at = ? \
             WHERE id = ? AND status = 'pending'",
            &[BindValue::Timestamp(Utc::now()), BindValue::Text(id.clone())],
        )
        .await?;
    if claimed == 0 {
        return Ok(None);
    }

    state
        .store
        .query_row("SELECT * FROM _webhook_logs WHERE id = ?", &[BindValue::Text(id)])
        .await
}

/// Spawned once at startup per `WEBHOOK_WORKER_COUNT`; each worker loops
/// on a short interval claiming and delivering due rows (spec §5: workers
/// compete via CAS, never in-memory locking).
pub async fn run_worker_loop(state: Arc<AppState>) {
    loop {
        match run_worker_tick(&state).await {
            Ok(true) => continue,
            Ok(false) => tokio::time::sleep(Duration::from_millis(500)).await,
            Err(error) => {
                tracing::error!(error = %error, "webhook worker tick failed");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let d1 = backoff_duration(BackoffKind::Exponential, 1, 1_000, 300_000, 0);
        let d2 = backoff_duration(BackoffKind::Exponential, 2, 1_000, 300_000, 0);
        let d5 = backoff_duration(BackoffKind::Exponential, 20, 1_000, 300_000, 0);
        assert!(d2.as_millis() >= d1.as_millis());
        assert!(d5.as_millis() <= 300_000);
    }

    #[test]
    fn fixed_backoff_is_constant_modulo_jitter() {
        let d = backoff_duration(BackoffKind::Fixed, 3, 5_000, 300_000, 0);
        assert!(d.as_millis() >= 5_000);
    }

    #[test]
    fn idempotency_key_is_deterministic() {
        let a = idempotency_key("wh1", "rec1", "create", 1);
        let b = idempotency_key("wh1", "rec1", "create", 1);
        assert_eq!(a, b);
        let c = idempotency_key("wh1", "rec1", "create", 2);
        assert_ne!(a, c);
    }

    #[test]
    fn condition_suppresses_when_falsy() {
        let webhook = WebhookDef {
            id: "wh1".to_string(),
            entity: "invoice".to_string(),
            hook: crate::registry::model::WebhookHook::AfterWrite,
            url: "https://example.com".to_string(),
            method: "POST".to_string(),
            headers: Default::default(),
            condition: Some("record.total > 100".to_string()),
            is_async: true,
            retry: Default::default(),
            active: true,
        };
        let record = serde_json::json!({ "total": 5 });
        assert!(!condition_passes(&webhook, &record, &Value::Null, "create"));
    }
}
