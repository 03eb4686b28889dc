use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use validator::Validate;

use crate::dto::attempt_dto::{
    CheckInRequest, LogEventRequest, LogEventResponse, SaveAnswerRequest, SaveAnswerResponse,
    StartTimerResponse, SubmitResponse, VerifyIdentityRequest,
};
use crate::error::Result;
use crate::routes::parse_id;
use crate::services::attempt_service::{AnswerOutcome, CheckIn, StartOutcome, SubmitOutcome};
use crate::services::ledger_service::{EvidenceImage, LogOutcome};
use crate::utils::image::decode_base64_image;
use crate::AppState;

fn decode_evidence(raw: &str) -> Result<EvidenceImage> {
    let (bytes, kind) = decode_base64_image(raw)?;
    Ok(EvidenceImage { bytes, kind })
}

#[axum::debug_handler]
pub async fn check_in(
    State(state): State<AppState>,
    Json(req): Json<CheckInRequest>,
) -> Result<Response> {
    req.validate()?;
    let status = state
        .attempts
        .check_in(CheckIn {
            exam_id: req.exam_id,
            student_name: req.student_name,
            student_identifier: req.student_identifier,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(status)).into_response())
}

#[axum::debug_handler]
pub async fn get_status(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
) -> Result<Response> {
    let attempt_id = parse_id(&raw_id, "Attempt")?;
    let status = state.attempts.status(attempt_id).await?;
    Ok(Json(status).into_response())
}

#[axum::debug_handler]
pub async fn start_timer(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
) -> Result<Response> {
    let attempt_id = parse_id(&raw_id, "Attempt")?;
    let outcome = state.attempts.start_timer(attempt_id).await?;
    let remaining = state.attempts.remaining_seconds(attempt_id).await?;
    let (started, ignored, reason) = match &outcome {
        StartOutcome::Started { .. } | StartOutcome::AlreadyStarted { .. } => (true, false, None),
        StartOutcome::Ignored { reason, .. } => (false, true, Some(*reason)),
    };
    Ok(Json(StartTimerResponse {
        attempt_id,
        started,
        ignored,
        reason,
        start_time: outcome.start_time(),
        remaining_seconds: remaining.remaining_seconds,
    })
    .into_response())
}

#[axum::debug_handler]
pub async fn get_remaining(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
) -> Result<Response> {
    let attempt_id = parse_id(&raw_id, "Attempt")?;
    let remaining = state.attempts.remaining_seconds(attempt_id).await?;
    Ok(Json(remaining).into_response())
}

#[axum::debug_handler]
pub async fn save_answer(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
    Json(req): Json<SaveAnswerRequest>,
) -> Result<Response> {
    let attempt_id = parse_id(&raw_id, "Attempt")?;
    req.validate()?;
    let outcome = state
        .attempts
        .save_answer(attempt_id, &req.item_id, &req.answer)
        .await?;
    let response = match outcome {
        AnswerOutcome::Saved {
            saved_at,
            timer_started_now,
        } => SaveAnswerResponse {
            saved: true,
            ignored: false,
            reason: None,
            item_id: req.item_id,
            timestamp: Some(saved_at),
            timer_started: timer_started_now,
        },
        AnswerOutcome::Ignored { reason } => SaveAnswerResponse {
            saved: false,
            ignored: true,
            reason: Some(reason),
            item_id: req.item_id,
            timestamp: None,
            timer_started: false,
        },
    };
    Ok(Json(response).into_response())
}

#[axum::debug_handler]
pub async fn log_event(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
    Json(req): Json<LogEventRequest>,
) -> Result<Response> {
    let attempt_id = parse_id(&raw_id, "Attempt")?;
    req.validate()?;
    let evidence = req
        .evidence_image
        .as_deref()
        .filter(|raw| !raw.trim().is_empty())
        .map(decode_evidence)
        .transpose()?;

    let outcome = state
        .attempts
        .log_event(attempt_id, &req.event_type, req.metadata, evidence)
        .await?;
    let response = match outcome {
        LogOutcome::Recorded { event } => LogEventResponse {
            recorded: true,
            ignored: false,
            reason: None,
            seq: Some(event.seq),
            timestamp: Some(event.timestamp),
        },
        LogOutcome::Ignored { reason } => LogEventResponse {
            recorded: false,
            ignored: true,
            reason: Some(reason),
            seq: None,
            timestamp: None,
        },
    };
    Ok(Json(response).into_response())
}

#[axum::debug_handler]
pub async fn verify_identity(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
    Json(req): Json<VerifyIdentityRequest>,
) -> Result<Response> {
    let attempt_id = parse_id(&raw_id, "Attempt")?;
    req.validate()?;
    let image = decode_evidence(&req.image)?;
    let outcome = state.attempts.verify_identity(attempt_id, image).await?;
    Ok(Json(outcome).into_response())
}

#[axum::debug_handler]
pub async fn submit(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
) -> Result<Response> {
    let attempt_id = parse_id(&raw_id, "Attempt")?;
    let (attempt, already_finalized) = match state.attempts.submit(attempt_id).await? {
        SubmitOutcome::Completed(attempt) => (attempt, false),
        SubmitOutcome::AlreadyFinalized(attempt) => (attempt, true),
    };
    let result = state.attempts.result(attempt_id).await?;
    Ok(Json(SubmitResponse {
        attempt_id,
        completed: attempt.completed_at.is_some(),
        already_finalized,
        completed_at: attempt.completed_at,
        result,
    })
    .into_response())
}

#[axum::debug_handler]
pub async fn get_result(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
) -> Result<Response> {
    let attempt_id = parse_id(&raw_id, "Attempt")?;
    let view = state.attempts.result(attempt_id).await?;
    Ok(Json(view).into_response())
}
