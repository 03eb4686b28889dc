//! Reviewer decisions and the read models behind the review dashboard.

use crate::config::RuntimePolicy;
use crate::error::{Error, Result};
use crate::models::attempt::{Attempt, FinalizedBy, IdentityStatus, ReviewStatus};
use crate::models::evidence::EvidenceRecord;
use crate::models::exam::Exam;
use crate::models::security_event::SecurityEvent;
use crate::services::attempt_locks::AttemptLocks;
use crate::services::blob_store::BlobStore;
use crate::services::clock::Clock;
use crate::services::grading_service::{GradingService, ScoreBreakdown};
use crate::services::ledger_service::{correlate, IncidentCorrelation};
use crate::services::risk_service::{GradeVisibility, RiskAssessment, RiskService, RiskTier};
use crate::services::store::{AttemptStore, AuditEntry, ExamCatalog};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct PenaltyUpdate {
    pub penalized_items: BTreeSet<String>,
    pub penalty_points: f64,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AttemptSummary {
    pub attempt_id: Uuid,
    pub student_name: String,
    pub student_identifier: String,
    pub start_time: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub finalized_by: Option<FinalizedBy>,
    pub score: Option<f64>,
    pub review_status: ReviewStatus,
    pub identity_status: IdentityStatus,
    pub risk_score: i64,
    pub risk_tier: RiskTier,
    pub event_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReviewedEvent {
    #[serde(flatten)]
    pub event: SecurityEvent,
    pub evidence_url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReviewedEvidence {
    #[serde(flatten)]
    pub record: EvidenceRecord,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReviewReport {
    pub attempt: Attempt,
    pub exam_title: String,
    pub breakdown: ScoreBreakdown,
    pub risk: RiskAssessment,
    pub student_view: GradeVisibility,
    pub events: Vec<ReviewedEvent>,
    pub incidents: Vec<IncidentCorrelation>,
    pub evidence: Vec<ReviewedEvidence>,
    pub identity_photo_url: Option<String>,
}

#[derive(Clone)]
pub struct ReviewService {
    store: Arc<dyn AttemptStore>,
    catalog: Arc<dyn ExamCatalog>,
    blobs: Arc<dyn BlobStore>,
    clock: Arc<dyn Clock>,
    locks: Arc<AttemptLocks>,
    policy: RuntimePolicy,
}

impl ReviewService {
    pub fn new(
        store: Arc<dyn AttemptStore>,
        catalog: Arc<dyn ExamCatalog>,
        blobs: Arc<dyn BlobStore>,
        clock: Arc<dyn Clock>,
        locks: Arc<AttemptLocks>,
        policy: RuntimePolicy,
    ) -> Self {
        Self {
            store,
            catalog,
            blobs,
            clock,
            locks,
            policy,
        }
    }

    async fn load(&self, attempt_id: Uuid) -> Result<(Attempt, Exam)> {
        let attempt = self
            .store
            .get_attempt(attempt_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Attempt {} not found", attempt_id)))?;
        let exam = self
            .catalog
            .exam(attempt.exam_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Exam {} not found", attempt.exam_id)))?;
        Ok((attempt, exam))
    }

    fn sign(&self, key: &str) -> Option<String> {
        match self.blobs.signed_url(key, self.policy.signed_url_ttl) {
            Ok(url) => Some(url),
            Err(e) => {
                tracing::warn!(key, error = %e, "could not sign evidence url");
                None
            }
        }
    }

    /// Best effort: the decision is already stored when this runs.
    async fn audit(&self, actor: &str, action: &str, attempt: &Attempt, changes: serde_json::Value) {
        let entry = AuditEntry {
            id: Uuid::new_v4(),
            actor: actor.to_string(),
            action: action.to_string(),
            attempt_id: attempt.id,
            changes,
            created_at: attempt.updated_at,
        };
        if let Err(e) = self.store.append_audit(&entry).await {
            tracing::error!(
                attempt_id = %attempt.id,
                actor,
                action,
                changes = %entry.changes,
                error = %e,
                "failed to record audit entry"
            );
        }
    }

    fn close_if_open(attempt: &mut Attempt, now: DateTime<Utc>) {
        if attempt.completed_at.is_none() {
            attempt.completed_at = Some(now);
            attempt.finalized_by = Some(FinalizedBy::Reviewer);
        }
    }

    pub async fn approve(&self, attempt_id: Uuid, actor: &str, comment: Option<String>) -> Result<Attempt> {
        let _guard = self.locks.acquire(attempt_id).await;
        let (mut attempt, exam) = self.load(attempt_id).await?;
        let now = self.clock.now();
        let previous = attempt.review_status;

        attempt.review_status = ReviewStatus::Approved;
        attempt.score = Some(GradingService::score(&exam, &attempt).final_score);
        Self::close_if_open(&mut attempt, now);
        if comment.is_some() {
            attempt.teacher_comment = comment;
        }
        attempt.updated_at = now;
        self.store.update_attempt(&attempt).await?;

        self.audit(
            actor,
            "approve",
            &attempt,
            json!({ "from": previous, "score": attempt.score }),
        )
        .await;
        tracing::info!(attempt_id = %attempt_id, actor, score = ?attempt.score, "attempt approved");
        Ok(attempt)
    }

    pub async fn reject(&self, attempt_id: Uuid, actor: &str, comment: Option<String>) -> Result<Attempt> {
        let _guard = self.locks.acquire(attempt_id).await;
        let (mut attempt, _exam) = self.load(attempt_id).await?;
        let now = self.clock.now();
        let previous = attempt.review_status;

        attempt.review_status = ReviewStatus::Rejected;
        attempt.score = Some(0.0);
        Self::close_if_open(&mut attempt, now);
        if comment.is_some() {
            attempt.teacher_comment = comment;
        }
        attempt.updated_at = now;
        self.store.update_attempt(&attempt).await?;

        self.audit(actor, "reject", &attempt, json!({ "from": previous })).await;
        tracing::info!(attempt_id = %attempt_id, actor, "attempt rejected");
        Ok(attempt)
    }

    pub async fn set_penalties(&self, attempt_id: Uuid, actor: &str, update: PenaltyUpdate) -> Result<Attempt> {
        if !update.penalty_points.is_finite() || update.penalty_points < 0.0 {
            return Err(Error::BadRequest(
                "penalty_points must be a non-negative number".to_string(),
            ));
        }

        let _guard = self.locks.acquire(attempt_id).await;
        let (mut attempt, exam) = self.load(attempt_id).await?;

        if let Some(unknown) = update
            .penalized_items
            .iter()
            .find(|id| exam.item(id).is_none())
        {
            return Err(Error::BadRequest(format!(
                "Item {} does not belong to this exam",
                unknown
            )));
        }

        let now = self.clock.now();
        attempt.penalized_items = update.penalized_items;
        attempt.penalty_points = update.penalty_points;
        if update.comment.is_some() {
            attempt.teacher_comment = update.comment;
        }
        if attempt.review_status == ReviewStatus::Pending {
            attempt.review_status = ReviewStatus::Revision;
        }
        attempt.score = match attempt.review_status {
            ReviewStatus::Rejected => Some(0.0),
            _ if attempt.completed_at.is_some() => Some(GradingService::score(&exam, &attempt).final_score),
            _ => attempt.score,
        };
        attempt.updated_at = now;
        self.store.update_attempt(&attempt).await?;

        self.audit(
            actor,
            "set_penalties",
            &attempt,
            json!({
                "penalized_items": attempt.penalized_items,
                "penalty_points": attempt.penalty_points,
                "score": attempt.score,
            }),
        )
        .await;
        tracing::info!(
            attempt_id = %attempt_id,
            actor,
            penalty_points = attempt.penalty_points,
            penalized = attempt.penalized_items.len(),
            "penalties updated"
        );
        Ok(attempt)
    }

    pub async fn list_exam_attempts(&self, exam_id: Uuid) -> Result<Vec<AttemptSummary>> {
        let exam = self
            .catalog
            .exam(exam_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Exam {} not found", exam_id)))?;
        let thresholds = self.catalog.risk_thresholds(exam.tenant_id).await?;

        let mut rows = Vec::new();
        for attempt in self.store.list_exam_attempts(exam_id).await? {
            let events = self.store.list_events(attempt.id).await?;
            let risk = RiskService::assess(&events, &thresholds);
            rows.push(AttemptSummary {
                attempt_id: attempt.id,
                student_name: attempt.student_name,
                student_identifier: attempt.student_identifier,
                start_time: attempt.start_time,
                completed_at: attempt.completed_at,
                finalized_by: attempt.finalized_by,
                score: attempt.score,
                review_status: attempt.review_status,
                identity_status: attempt.identity_status,
                risk_score: risk.score,
                risk_tier: risk.tier,
                event_count: events.len(),
            });
        }
        Ok(rows)
    }

    pub async fn report(&self, attempt_id: Uuid) -> Result<ReviewReport> {
        let (attempt, exam) = self.load(attempt_id).await?;
        let thresholds = self.catalog.risk_thresholds(exam.tenant_id).await?;
        let events = self.store.list_events(attempt_id).await?;
        let evidence = self.store.list_evidence(attempt_id).await?;

        let risk = RiskService::assess(&events, &thresholds);
        let incidents = correlate(&events, self.policy.correlation_window_secs);
        let student_view = RiskService::grade_visibility(&attempt, risk.tier);
        let breakdown = GradingService::score(&exam, &attempt);

        let events = events
            .into_iter()
            .map(|event| {
                let evidence_url = event.evidence_path().and_then(|p| self.sign(p));
                ReviewedEvent { event, evidence_url }
            })
            .collect();
        let evidence = evidence
            .into_iter()
            .map(|record| {
                let url = self.sign(&record.file_path);
                ReviewedEvidence { record, url }
            })
            .collect();
        let identity_photo_url = attempt.photo_id_path.as_deref().and_then(|p| self.sign(p));

        Ok(ReviewReport {
            exam_title: exam.title,
            breakdown,
            risk,
            student_view,
            events,
            incidents,
            evidence,
            identity_photo_url,
            attempt,
        })
    }
}
