use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

pub const REVIEWER_ROLES: &[&str] = &["teacher", "admin"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
    pub role: Option<String>,
}

/// Bearer-JWT gate: HS256 secret plus the roles allowed through.
#[derive(Clone)]
pub struct RoleGate {
    secret: Arc<str>,
    allowed: &'static [&'static str],
}

impl RoleGate {
    pub fn new(secret: &str, allowed: &'static [&'static str]) -> Self {
        Self {
            secret: Arc::from(secret),
            allowed,
        }
    }

    pub fn reviewers(secret: &str) -> Self {
        Self::new(secret, REVIEWER_ROLES)
    }
}

fn reject(status: StatusCode, code: &str) -> Response {
    (status, Json(json!({ "error": code }))).into_response()
}

pub async fn require_roles(State(gate): State<RoleGate>, mut req: Request, next: Next) -> Response {
    let Some(auth_header) = req.headers().get(axum::http::header::AUTHORIZATION) else {
        return reject(StatusCode::UNAUTHORIZED, "missing_authorization");
    };
    let Ok(auth_str) = auth_header.to_str() else {
        return reject(StatusCode::UNAUTHORIZED, "bad_authorization");
    };
    let Some(token) = auth_str.strip_prefix("Bearer ") else {
        return reject(StatusCode::UNAUTHORIZED, "unsupported_scheme");
    };

    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;
    match decode::<Claims>(
        token,
        &DecodingKey::from_secret(gate.secret.as_bytes()),
        &validation,
    ) {
        Ok(data) => {
            let role = data.claims.role.clone().unwrap_or_default();
            if !gate.allowed.is_empty() && !gate.allowed.iter().any(|r| r.eq_ignore_ascii_case(&role)) {
                tracing::warn!(sub = %data.claims.sub, role = %role, "reviewer route denied");
                return reject(StatusCode::FORBIDDEN, "forbidden");
            }
            req.extensions_mut().insert(data.claims);
            next.run(req).await
        }
        Err(_) => reject(StatusCode::UNAUTHORIZED, "invalid_token"),
    }
}
