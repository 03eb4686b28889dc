use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::services::attempt_service::GradeView;
use crate::services::ledger_service::IgnoreReason;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CheckInRequest {
    pub exam_id: Uuid,
    #[validate(length(min = 1, max = 200))]
    pub student_name: String,
    #[validate(length(min = 1, max = 64))]
    pub student_identifier: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartTimerResponse {
    pub attempt_id: Uuid,
    pub started: bool,
    pub ignored: bool,
    pub reason: Option<IgnoreReason>,
    pub start_time: Option<DateTime<Utc>>,
    pub remaining_seconds: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SaveAnswerRequest {
    #[validate(length(min = 1, max = 128))]
    pub item_id: String,
    #[validate(length(max = 2000))]
    pub answer: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveAnswerResponse {
    pub saved: bool,
    pub ignored: bool,
    pub reason: Option<IgnoreReason>,
    pub item_id: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub timer_started: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct LogEventRequest {
    #[validate(length(min = 1, max = 64))]
    pub event_type: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// Base64 snapshot, optionally as a data URL.
    pub evidence_image: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEventResponse {
    pub recorded: bool,
    pub ignored: bool,
    pub reason: Option<IgnoreReason>,
    pub seq: Option<i64>,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct VerifyIdentityRequest {
    #[validate(length(min = 1))]
    pub image: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub attempt_id: Uuid,
    pub completed: bool,
    pub already_finalized: bool,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: GradeView,
}
