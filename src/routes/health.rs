use axum::extract::State;
use axum::Json;
use chrono::Utc;
use serde_json::{json, Value};
use std::time::Duration;

use crate::state::AppState;

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    // Wrap in a short timeout so the healthcheck always responds quickly,
    // even if the first DB connection hangs (e.g. DNS, SSL, TCP).
    let db_ok = match tokio::time::timeout(Duration::from_secs(3), state.store.query_row("SELECT 1 AS ok", &[])).await {
        Ok(Ok(_)) => true,
        Ok(Err(error)) => {
            tracing::error!(error = %error, "health check db query failed");
            false
        }
        Err(_) => {
            tracing::error!("health check db query timed out (3s)");
            false
        }
    };

    let status = if db_ok { "ok" } else { "degraded" };
    Json(json!({
        "status": status,
        "now": Utc::now().to_rfc3339(),
        "db": db_ok
    }))
}
