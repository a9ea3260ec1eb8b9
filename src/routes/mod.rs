use axum::{routing::get, Router};

use crate::state::AppState;

pub mod admin;
pub mod dynamic;
pub mod events;
pub mod health;
pub mod workflow_runtime;

pub fn v1_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health::health))
        .merge(dynamic::router())
        .merge(admin::router())
        .merge(workflow_runtime::router())
        .merge(events::router())
}
