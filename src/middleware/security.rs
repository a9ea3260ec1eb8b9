//! Rejects requests whose `Host` header isn't on the configured allow
//! list (spec §8's perimeter concerns — TLS termination and the reverse
//! proxy live outside the process, but Host-header spoofing is cheap
//! enough to guard here).

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::state::AppState;

pub async fn enforce_trusted_hosts(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if state.config.trusted_hosts.is_empty() {
        return next.run(request).await;
    }

    let host = request
        .headers()
        .get(axum::http::header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.split(':').next().unwrap_or(value))
        .unwrap_or_default();

    let allowed = state
        .config
        .trusted_hosts
        .iter()
        .any(|trusted| trusted == "*" || trusted == host);

    if allowed {
        next.run(request).await
    } else {
        (StatusCode::FORBIDDEN, "untrusted host").into_response()
    }
}
