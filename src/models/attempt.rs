use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Pending,
    Revision,
    Approved,
    Rejected,
}

impl ReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Revision => "revision",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    /// A human has made the final call; no student-side write may follow.
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Approved | Self::Rejected)
    }
}

impl FromStr for ReviewStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "revision" => Ok(Self::Revision),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            other => Err(format!("unknown review status '{}'", other)),
        }
    }
}

impl fmt::Display for ReviewStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityStatus {
    Unverified,
    Verified,
    ManualReview,
}

impl IdentityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unverified => "unverified",
            Self::Verified => "verified",
            Self::ManualReview => "manual_review",
        }
    }
}

impl FromStr for IdentityStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unverified" => Ok(Self::Unverified),
            "verified" => Ok(Self::Verified),
            "manual_review" => Ok(Self::ManualReview),
            other => Err(format!("unknown identity status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalizedBy {
    Student,
    Timeout,
    Reviewer,
}

impl FinalizedBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Student => "student",
            Self::Timeout => "timeout",
            Self::Reviewer => "reviewer",
        }
    }
}

impl FromStr for FinalizedBy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "student" => Ok(Self::Student),
            "timeout" => Ok(Self::Timeout),
            "reviewer" => Ok(Self::Reviewer),
            other => Err(format!("unknown finalizer '{}'", other)),
        }
    }
}

/// One student's pass at one exam.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    pub id: Uuid,
    pub exam_id: Uuid,
    pub student_name: String,
    pub student_identifier: String,
    /// Item ids in the order this student sees them.
    pub item_order: Vec<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub timer_reset_used: bool,
    pub completed_at: Option<DateTime<Utc>>,
    pub finalized_by: Option<FinalizedBy>,
    pub answers: BTreeMap<String, String>,
    pub score: Option<f64>,
    pub review_status: ReviewStatus,
    pub penalized_items: BTreeSet<String>,
    pub penalty_points: f64,
    pub teacher_comment: Option<String>,
    pub identity_status: IdentityStatus,
    /// Storage-relative path, re-signed on every read.
    pub photo_id_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Attempt {
    pub fn new(
        exam_id: Uuid,
        student_name: String,
        student_identifier: String,
        item_order: Vec<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            exam_id,
            student_name,
            student_identifier,
            item_order,
            start_time: None,
            timer_reset_used: false,
            completed_at: None,
            finalized_by: None,
            answers: BTreeMap::new(),
            score: None,
            review_status: ReviewStatus::Pending,
            penalized_items: BTreeSet::new(),
            penalty_points: 0.0,
            teacher_comment: None,
            identity_status: IdentityStatus::Unverified,
            photo_id_path: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.completed_at.is_some() || self.review_status.is_final()
    }

    pub fn screen(&self) -> Screen {
        if self.is_terminal() {
            Screen::Finished
        } else if self.start_time.is_some() {
            Screen::InProgress
        } else if self.identity_status == IdentityStatus::Unverified {
            Screen::IdentityGate
        } else {
            Screen::Ready
        }
    }
}

/// Student-facing step, derived from persisted fields only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Screen {
    IdentityGate,
    Ready,
    InProgress,
    Finished,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> Attempt {
        Attempt::new(Uuid::new_v4(), "Ana".into(), "30111222".into(), vec![], Utc::now())
    }

    #[test]
    fn terminal_covers_completion_and_final_review() {
        let mut attempt = fresh();
        assert!(!attempt.is_terminal());

        attempt.review_status = ReviewStatus::Revision;
        assert!(!attempt.is_terminal());

        attempt.review_status = ReviewStatus::Rejected;
        assert!(attempt.is_terminal());

        let mut attempt = fresh();
        attempt.completed_at = Some(Utc::now());
        assert!(attempt.is_terminal());
    }

    #[test]
    fn screen_follows_persisted_fields() {
        let mut attempt = fresh();
        assert_eq!(attempt.screen(), Screen::IdentityGate);

        attempt.identity_status = IdentityStatus::ManualReview;
        assert_eq!(attempt.screen(), Screen::Ready);

        attempt.start_time = Some(Utc::now());
        assert_eq!(attempt.screen(), Screen::InProgress);

        attempt.completed_at = Some(Utc::now());
        assert_eq!(attempt.screen(), Screen::Finished);
    }

    #[test]
    fn review_status_round_trips_through_text() {
        for status in [
            ReviewStatus::Pending,
            ReviewStatus::Revision,
            ReviewStatus::Approved,
            ReviewStatus::Rejected,
        ] {
            assert_eq!(status.as_str().parse::<ReviewStatus>().unwrap(), status);
        }
        assert!("annulled".parse::<ReviewStatus>().is_err());
    }
}
