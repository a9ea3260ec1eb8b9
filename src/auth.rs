//! Principal resolution (spec §8 — JWT parsing is an external collaborator;
//! only the narrow "decode a bearer token into {sub, roles}" interface is
//! implemented here). Dev-override headers mirror the teacher's
//! `auth_dev_overrides_enabled` gate in `tenancy.rs`.

use axum::extract::{FromRequestParts, State};
use axum::http::request::Parts;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::state::AppState;

pub const ADMIN_ROLE: &str = "admin";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrentUser {
    pub id: String,
    pub roles: Vec<String>,
}

impl CurrentUser {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|owned| owned == role)
    }

    pub fn is_admin(&self) -> bool {
        self.has_role(ADMIN_ROLE)
    }
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default)]
    roles: Vec<String>,
}

impl<S> FromRequestParts<S> for CurrentUser
where
    AppState: axum::extract::FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let State(state): State<AppState> = State::from_request_parts(parts, state)
            .await
            .map_err(|_| AppError::Internal("app state unavailable".to_string()))?;

        if let Some(user) = try_bearer_token(parts, &state) {
            return user;
        }

        if state.config.auth_dev_overrides_enabled() {
            if let Some(user) = try_dev_headers(parts) {
                return Ok(user);
            }
        }

        Err(AppError::Unauthorized(
            "missing or invalid credentials".to_string(),
        ))
    }
}

fn try_bearer_token(parts: &Parts, state: &AppState) -> Option<Result<CurrentUser, AppError>> {
    let header = parts.headers.get(axum::http::header::AUTHORIZATION)?;
    let header = header.to_str().ok()?;
    let token = header.strip_prefix("Bearer ")?;
    let secret = state.config.jwt_secret.as_ref()?;

    let decoded = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::new(Algorithm::HS256),
    );

    Some(match decoded {
        Ok(data) => Ok(CurrentUser {
            id: data.claims.sub,
            roles: data.claims.roles,
        }),
        Err(_) => Err(AppError::Unauthorized("invalid bearer token".to_string())),
    })
}

fn try_dev_headers(parts: &Parts) -> Option<CurrentUser> {
    let user_id = parts
        .headers
        .get("x-user-id")
        .and_then(|value| value.to_str().ok())?
        .to_string();
    let roles = parts
        .headers
        .get("x-user-roles")
        .and_then(|value| value.to_str().ok())
        .map(|raw| raw.split(',').map(|role| role.trim().to_string()).collect())
        .unwrap_or_default();
    Some(CurrentUser { id: user_id, roles })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_role_detected_case_sensitively() {
        let user = CurrentUser {
            id: "u1".to_string(),
            roles: vec!["admin".to_string()],
        };
        assert!(user.is_admin());
        let user = CurrentUser {
            id: "u1".to_string(),
            roles: vec!["Admin".to_string()],
        };
        assert!(!user.is_admin());
    }
}
