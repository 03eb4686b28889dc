use crate::models::attempt::{Attempt, IdentityStatus, ReviewStatus};
use crate::models::security_event::{EventType, SecurityEvent};
use crate::models::tenant::RiskThresholds;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskTier {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize)]
pub struct RiskAssessment {
    pub score: i64,
    pub tier: RiskTier,
    pub counts: BTreeMap<EventType, u32>,
    /// Identity mismatches raised by verification retries; not scored.
    pub excluded_retry_failures: u32,
}

/// Student-facing grade decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GradeVisibility {
    pub visible: bool,
    pub score: Option<f64>,
}

pub struct RiskService;

impl RiskService {
    pub fn weight(event_type: EventType) -> i64 {
        match event_type {
            EventType::FocusLost => 1,
            EventType::FullscreenExit => 2,
            EventType::NoFace => 3,
            EventType::MultiFace => 5,
            EventType::IdentityMismatch => 10,
            _ => 0,
        }
    }

    pub fn tier(score: i64, thresholds: &RiskThresholds) -> RiskTier {
        if score > thresholds.high {
            RiskTier::High
        } else if score > thresholds.medium {
            RiskTier::Medium
        } else {
            RiskTier::Low
        }
    }

    pub fn assess(events: &[SecurityEvent], thresholds: &RiskThresholds) -> RiskAssessment {
        let mut counts: BTreeMap<EventType, u32> = BTreeMap::new();
        let mut excluded_retry_failures = 0;
        let mut score = 0;

        for event in events {
            if event.event_type == EventType::IdentityMismatch && event.is_retry_failure() {
                excluded_retry_failures += 1;
                continue;
            }
            *counts.entry(event.event_type).or_default() += 1;
            score += Self::weight(event.event_type);
        }

        RiskAssessment {
            score,
            tier: Self::tier(score, thresholds),
            counts,
            excluded_retry_failures,
        }
    }

    /// Approved shows the stored score, rejected shows zero. Anything else is
    /// shown only for a completed, low-risk attempt whose identity check did
    /// not escalate.
    pub fn grade_visibility(attempt: &Attempt, tier: RiskTier) -> GradeVisibility {
        match attempt.review_status {
            ReviewStatus::Approved => GradeVisibility {
                visible: true,
                score: attempt.score,
            },
            ReviewStatus::Rejected => GradeVisibility {
                visible: true,
                score: Some(0.0),
            },
            ReviewStatus::Pending | ReviewStatus::Revision => {
                let visible = attempt.completed_at.is_some()
                    && tier == RiskTier::Low
                    && attempt.identity_status != IdentityStatus::ManualReview;
                GradeVisibility {
                    visible,
                    score: if visible { attempt.score } else { None },
                }
            }
        }
    }
}
