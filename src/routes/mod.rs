pub mod evidence;
pub mod health;
pub mod review;
pub mod student;

use axum::{
    routing::{get, patch, post},
    Router,
};

use crate::middleware::auth::{require_roles, RoleGate};
use crate::middleware::rate_limit::{rps_middleware, RateLimiter};
use crate::error::{Error, Result};
use crate::AppState;
use uuid::Uuid;

/// Ids in the path are parsed by hand so a malformed one reads as "not found".
pub(crate) fn parse_id(raw: &str, what: &str) -> Result<Uuid> {
    Uuid::parse_str(raw.trim()).map_err(|_| Error::NotFound(format!("{} {} not found", what, raw)))
}

#[derive(Clone)]
pub struct RouterSettings {
    pub public_rps: u32,
    pub review_rps: u32,
    pub reviewer_gate: RoleGate,
}

pub fn api_router(state: AppState, settings: RouterSettings) -> Router {
    let student_api = Router::new()
        .route("/api/attempts", post(student::check_in))
        .route("/api/attempts/:id", get(student::get_status))
        .route("/api/attempts/:id/start", post(student::start_timer))
        .route("/api/attempts/:id/remaining", get(student::get_remaining))
        .route("/api/attempts/:id/answer", patch(student::save_answer))
        .route("/api/attempts/:id/events", post(student::log_event))
        .route("/api/attempts/:id/identity", post(student::verify_identity))
        .route("/api/attempts/:id/submit", post(student::submit))
        .route("/api/attempts/:id/result", get(student::get_result))
        .route("/api/evidence/*path", get(evidence::serve_evidence))
        .layer(axum::middleware::from_fn_with_state(
            RateLimiter::new("public", settings.public_rps),
            rps_middleware,
        ));

    let review_api = Router::new()
        .route(
            "/api/review/exams/:exam_id/attempts",
            get(review::list_exam_attempts),
        )
        .route("/api/review/attempts/:id", get(review::get_report))
        .route("/api/review/attempts/:id/approve", post(review::approve))
        .route("/api/review/attempts/:id/reject", post(review::reject))
        .route("/api/review/attempts/:id/penalties", post(review::set_penalties))
        .layer(axum::middleware::from_fn_with_state(
            settings.reviewer_gate,
            require_roles,
        ))
        .layer(axum::middleware::from_fn_with_state(
            RateLimiter::new("review", settings.review_rps),
            rps_middleware,
        ));

    Router::new()
        .route("/health", get(health::health))
        .merge(student_api)
        .merge(review_api)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_ids_are_not_found() {
        let id = Uuid::new_v4();
        assert_eq!(parse_id(&id.to_string(), "Attempt").unwrap(), id);
        assert!(matches!(parse_id("not-a-uuid", "Attempt"), Err(Error::NotFound(_))));
    }
}
