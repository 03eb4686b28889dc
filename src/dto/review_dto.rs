use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;
use validator::Validate;

use crate::models::attempt::{Attempt, ReviewStatus};

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct ReviewDecisionRequest {
    #[validate(length(max = 4000))]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SetPenaltiesRequest {
    #[serde(default)]
    pub penalized_items: BTreeSet<String>,
    #[validate(range(min = 0.0, max = 10.0))]
    #[serde(default)]
    pub penalty_points: f64,
    #[validate(length(max = 4000))]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewDecisionResponse {
    pub attempt_id: Uuid,
    pub review_status: ReviewStatus,
    pub score: Option<f64>,
    pub completed_at: Option<DateTime<Utc>>,
    pub penalized_items: BTreeSet<String>,
    pub penalty_points: f64,
    pub teacher_comment: Option<String>,
}

impl From<Attempt> for ReviewDecisionResponse {
    fn from(a: Attempt) -> Self {
        Self {
            attempt_id: a.id,
            review_status: a.review_status,
            score: a.score,
            completed_at: a.completed_at,
            penalized_items: a.penalized_items,
            penalty_points: a.penalty_points,
            teacher_comment: a.teacher_comment,
        }
    }
}
