use axum::{
    extract::{Path, State},
    response::{IntoResponse, Json, Response},
    Extension,
};
use serde_json::json;
use validator::Validate;

use crate::dto::review_dto::{ReviewDecisionRequest, ReviewDecisionResponse, SetPenaltiesRequest};
use crate::error::Result;
use crate::routes::parse_id;
use crate::middleware::auth::Claims;
use crate::services::review_service::PenaltyUpdate;
use crate::AppState;

#[axum::debug_handler]
pub async fn list_exam_attempts(
    State(state): State<AppState>,
    Path(raw_exam_id): Path<String>,
) -> Result<Response> {
    let exam_id = parse_id(&raw_exam_id, "Exam")?;
    let rows = state.reviews.list_exam_attempts(exam_id).await?;
    Ok(Json(json!({ "exam_id": exam_id, "total": rows.len(), "items": rows })).into_response())
}

#[axum::debug_handler]
pub async fn get_report(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
) -> Result<Response> {
    let attempt_id = parse_id(&raw_id, "Attempt")?;
    let report = state.reviews.report(attempt_id).await?;
    Ok(Json(report).into_response())
}

#[axum::debug_handler]
pub async fn approve(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(raw_id): Path<String>,
    body: Option<Json<ReviewDecisionRequest>>,
) -> Result<Response> {
    let attempt_id = parse_id(&raw_id, "Attempt")?;
    let req = body.map(|Json(r)| r).unwrap_or_default();
    req.validate()?;
    let attempt = state.reviews.approve(attempt_id, &claims.sub, req.comment).await?;
    Ok(Json(ReviewDecisionResponse::from(attempt)).into_response())
}

#[axum::debug_handler]
pub async fn reject(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(raw_id): Path<String>,
    body: Option<Json<ReviewDecisionRequest>>,
) -> Result<Response> {
    let attempt_id = parse_id(&raw_id, "Attempt")?;
    let req = body.map(|Json(r)| r).unwrap_or_default();
    req.validate()?;
    let attempt = state.reviews.reject(attempt_id, &claims.sub, req.comment).await?;
    Ok(Json(ReviewDecisionResponse::from(attempt)).into_response())
}

#[axum::debug_handler]
pub async fn set_penalties(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(raw_id): Path<String>,
    Json(req): Json<SetPenaltiesRequest>,
) -> Result<Response> {
    let attempt_id = parse_id(&raw_id, "Attempt")?;
    req.validate()?;
    let attempt = state
        .reviews
        .set_penalties(
            attempt_id,
            &claims.sub,
            PenaltyUpdate {
                penalized_items: req.penalized_items,
                penalty_points: req.penalty_points,
                comment: req.comment,
            },
        )
        .await?;
    Ok(Json(ReviewDecisionResponse::from(attempt)).into_response())
}
