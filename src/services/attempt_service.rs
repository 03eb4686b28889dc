use crate::config::RuntimePolicy;
use crate::error::{Error, Result};
use crate::models::attempt::{Attempt, FinalizedBy, IdentityStatus, ReviewStatus, Screen};
use crate::models::exam::Exam;
use crate::models::security_event::{EventType, ITEM_ID_KEY};
use crate::services::attempt_locks::AttemptLocks;
use crate::services::clock::Clock;
use crate::services::grading_service::GradingService;
use crate::services::identity_service::{IdentityService, VerificationOutcome};
use crate::services::ledger_service::{EvidenceImage, IgnoreReason, LedgerService, LogOutcome};
use crate::services::risk_service::{RiskService, RiskTier};
use crate::services::store::{AttemptStore, ExamCatalog};
use chrono::{DateTime, Duration, Utc};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct CheckIn {
    pub exam_id: Uuid,
    pub student_name: String,
    pub student_identifier: String,
}

/// An item as the student sees it: no correct flag, no weight.
#[derive(Debug, Clone, Serialize)]
pub struct StudentItem {
    pub item_id: String,
    pub stem: String,
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AttemptStatus {
    pub attempt_id: Uuid,
    pub exam_id: Uuid,
    pub exam_title: String,
    pub student_name: String,
    pub screen: Screen,
    pub start_time: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub remaining_seconds: i64,
    pub total_seconds: i64,
    pub answered: usize,
    pub total_items: usize,
    pub identity_status: IdentityStatus,
    pub review_status: ReviewStatus,
    pub answers: std::collections::BTreeMap<String, String>,
    pub items: Vec<StudentItem>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StartOutcome {
    Started { start_time: DateTime<Utc> },
    AlreadyStarted { start_time: DateTime<Utc> },
    Ignored { start_time: Option<DateTime<Utc>>, reason: IgnoreReason },
}

impl StartOutcome {
    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Started { start_time } | Self::AlreadyStarted { start_time } => Some(*start_time),
            Self::Ignored { start_time, .. } => *start_time,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RemainingTime {
    pub remaining_seconds: i64,
    pub total_seconds: i64,
    pub started: bool,
    /// The one-time reset was applied by this call.
    pub timer_reset: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AnswerOutcome {
    Saved { saved_at: DateTime<Utc>, timer_started_now: bool },
    Ignored { reason: IgnoreReason },
}

#[derive(Debug, Clone)]
pub enum SubmitOutcome {
    Completed(Attempt),
    AlreadyFinalized(Attempt),
}

/// What the student may see of their grade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradeView {
    pub attempt_id: Uuid,
    pub completed: bool,
    pub visible: bool,
    pub score: Option<f64>,
    pub review_status: ReviewStatus,
    pub teacher_comment: Option<String>,
    pub message: String,
}

fn remaining_at(attempt: &Attempt, exam: &Exam, now: DateTime<Utc>) -> i64 {
    match attempt.start_time {
        None => exam.duration_seconds,
        Some(start) => (exam.duration_seconds - (now - start).num_seconds()).max(0),
    }
}

fn student_items(exam: &Exam, order: &[String]) -> Vec<StudentItem> {
    order
        .iter()
        .filter_map(|id| exam.item(id))
        .map(|item| StudentItem {
            item_id: item.item_id.clone(),
            stem: item.stem.clone(),
            options: item.options.iter().map(|o| o.text.clone()).collect(),
        })
        .collect()
}

#[derive(Clone)]
pub struct AttemptService {
    store: Arc<dyn AttemptStore>,
    catalog: Arc<dyn ExamCatalog>,
    ledger: LedgerService,
    identity: IdentityService,
    clock: Arc<dyn Clock>,
    locks: Arc<AttemptLocks>,
    policy: RuntimePolicy,
}

impl AttemptService {
    pub fn new(
        store: Arc<dyn AttemptStore>,
        catalog: Arc<dyn ExamCatalog>,
        ledger: LedgerService,
        identity: IdentityService,
        clock: Arc<dyn Clock>,
        locks: Arc<AttemptLocks>,
        policy: RuntimePolicy,
    ) -> Self {
        Self {
            store,
            catalog,
            ledger,
            identity,
            clock,
            locks,
            policy,
        }
    }

    pub async fn get_attempt(&self, attempt_id: Uuid) -> Result<Attempt> {
        self.store
            .get_attempt(attempt_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Attempt {} not found", attempt_id)))
    }

    async fn exam(&self, exam_id: Uuid) -> Result<Exam> {
        self.catalog
            .exam(exam_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Exam {} not found", exam_id)))
    }

    async fn load(&self, attempt_id: Uuid) -> Result<(Attempt, Exam)> {
        let attempt = self.get_attempt(attempt_id).await?;
        let exam = self.exam(attempt.exam_id).await?;
        Ok((attempt, exam))
    }

    fn reset_eligible(&self, attempt: &Attempt, exam: &Exam, now: DateTime<Utc>) -> bool {
        self.policy.allow_timer_reset
            && !attempt.timer_reset_used
            && !attempt.is_terminal()
            && attempt.answers.is_empty()
            && attempt.start_time.is_some()
            && remaining_at(attempt, exam, now) == 0
    }

    /// Restarts the clock once for an attempt that ran out without a single answer.
    fn apply_timer_reset(&self, attempt: &mut Attempt, exam: &Exam, now: DateTime<Utc>) -> bool {
        if !self.reset_eligible(attempt, exam, now) {
            return false;
        }
        attempt.start_time = Some(now);
        attempt.timer_reset_used = true;
        attempt.updated_at = now;
        tracing::warn!(attempt_id = %attempt.id, "timer expired with no answers; clock restarted once");
        true
    }

    pub async fn check_in(&self, req: CheckIn) -> Result<AttemptStatus> {
        let student_name = req.student_name.trim().to_string();
        let student_identifier = req.student_identifier.trim().to_string();
        if student_name.is_empty() || student_identifier.is_empty() {
            return Err(Error::BadRequest(
                "Student name and identifier are required".to_string(),
            ));
        }

        let exam = self.exam(req.exam_id).await?;
        let _check_in = self.locks.acquire_check_in(exam.id, &student_identifier).await;
        if let Some(status) = self.resume_existing(&exam, &student_identifier).await? {
            return Ok(status);
        }

        let mut items: Vec<_> = exam.items.iter().collect();
        items.sort_by_key(|i| i.position);
        let mut item_order: Vec<String> = items.into_iter().map(|i| i.item_id.clone()).collect();
        if exam.shuffle_items {
            item_order.shuffle(&mut rand::thread_rng());
        }

        let attempt = Attempt::new(
            exam.id,
            student_name,
            student_identifier,
            item_order,
            self.clock.now(),
        );
        match self.store.insert_attempt(&attempt).await {
            Ok(()) => {}
            // Another instance inserted the open attempt first.
            Err(Error::Conflict(reason)) => {
                tracing::info!(exam_id = %exam.id, reason = %reason, "check-in raced; resuming");
                return self
                    .resume_existing(&exam, &attempt.student_identifier)
                    .await?
                    .ok_or(Error::Conflict(reason));
            }
            Err(e) => return Err(e),
        }
        tracing::info!(attempt_id = %attempt.id, exam_id = %exam.id, "attempt checked in");
        Ok(self.status_of(&attempt, &exam))
    }

    /// Rejects a student who already finished and hands back their open attempt if any.
    async fn resume_existing(&self, exam: &Exam, student_identifier: &str) -> Result<Option<AttemptStatus>> {
        let existing = self
            .store
            .find_student_attempts(exam.id, student_identifier)
            .await?;

        if existing.iter().any(|a| a.completed_at.is_some()) {
            return Err(Error::BadRequest(format!(
                "Identifier {} has already completed this exam",
                student_identifier
            )));
        }

        let Some(open) = existing.into_iter().find(|a| !a.is_terminal()) else {
            return Ok(None);
        };
        let _guard = self.locks.acquire(open.id).await;
        let attempt = self.get_attempt(open.id).await?;
        if attempt.start_time.is_some() {
            self.ledger
                .append_internal(&attempt, EventType::SessionResume, json!({}))
                .await?;
        }
        tracing::info!(attempt_id = %attempt.id, "attempt resumed");
        Ok(Some(self.status_of(&attempt, exam)))
    }

    fn status_of(&self, attempt: &Attempt, exam: &Exam) -> AttemptStatus {
        AttemptStatus {
            attempt_id: attempt.id,
            exam_id: exam.id,
            exam_title: exam.title.clone(),
            student_name: attempt.student_name.clone(),
            screen: attempt.screen(),
            start_time: attempt.start_time,
            completed_at: attempt.completed_at,
            remaining_seconds: if attempt.is_terminal() {
                0
            } else {
                remaining_at(attempt, exam, self.clock.now())
            },
            total_seconds: exam.duration_seconds,
            answered: attempt.answers.len(),
            total_items: exam.items.len(),
            identity_status: attempt.identity_status,
            review_status: attempt.review_status,
            answers: attempt.answers.clone(),
            items: student_items(exam, &attempt.item_order),
        }
    }

    pub async fn status(&self, attempt_id: Uuid) -> Result<AttemptStatus> {
        let (attempt, exam) = self.load(attempt_id).await?;
        Ok(self.status_of(&attempt, &exam))
    }

    pub async fn start_timer(&self, attempt_id: Uuid) -> Result<StartOutcome> {
        let _guard = self.locks.acquire(attempt_id).await;
        let mut attempt = self.get_attempt(attempt_id).await?;

        if attempt.is_terminal() {
            return Ok(StartOutcome::Ignored {
                start_time: attempt.start_time,
                reason: IgnoreReason::Terminal,
            });
        }
        if let Some(start_time) = attempt.start_time {
            return Ok(StartOutcome::AlreadyStarted { start_time });
        }

        let now = self.clock.now();
        attempt.start_time = Some(now);
        attempt.updated_at = now;
        self.store.update_attempt(&attempt).await?;
        tracing::info!(attempt_id = %attempt_id, start_time = %now, "exam timer started");
        Ok(StartOutcome::Started { start_time: now })
    }

    pub async fn remaining_seconds(&self, attempt_id: Uuid) -> Result<RemainingTime> {
        let (attempt, exam) = self.load(attempt_id).await?;
        let now = self.clock.now();

        if self.reset_eligible(&attempt, &exam, now) {
            let _guard = self.locks.acquire(attempt_id).await;
            let mut attempt = self.get_attempt(attempt_id).await?;
            let now = self.clock.now();
            let timer_reset = self.apply_timer_reset(&mut attempt, &exam, now);
            if timer_reset {
                self.store.update_attempt(&attempt).await?;
            }
            return Ok(RemainingTime {
                remaining_seconds: remaining_at(&attempt, &exam, now),
                total_seconds: exam.duration_seconds,
                started: attempt.start_time.is_some(),
                timer_reset,
            });
        }

        let remaining_seconds = if attempt.is_terminal() {
            0
        } else {
            remaining_at(&attempt, &exam, now)
        };
        Ok(RemainingTime {
            remaining_seconds,
            total_seconds: exam.duration_seconds,
            started: attempt.start_time.is_some(),
            timer_reset: false,
        })
    }

    pub async fn save_answer(&self, attempt_id: Uuid, item_id: &str, option_text: &str) -> Result<AnswerOutcome> {
        let _guard = self.locks.acquire(attempt_id).await;
        let (mut attempt, exam) = self.load(attempt_id).await?;

        if attempt.is_terminal() {
            tracing::debug!(attempt_id = %attempt_id, item_id, "answer on terminal attempt ignored");
            return Ok(AnswerOutcome::Ignored {
                reason: IgnoreReason::Terminal,
            });
        }
        if exam.item(item_id).is_none() {
            return Err(Error::BadRequest(format!(
                "Item {} does not belong to this exam",
                item_id
            )));
        }

        let now = self.clock.now();
        let timer_started_now = attempt.start_time.is_none();
        if timer_started_now {
            attempt.start_time = Some(now);
            tracing::info!(attempt_id = %attempt_id, "exam timer started by first answer");
        }

        attempt.answers.insert(item_id.to_string(), option_text.to_string());
        attempt.updated_at = now;
        self.store.update_attempt(&attempt).await?;

        self.ledger
            .append_internal(&attempt, EventType::AnswerSaved, json!({ ITEM_ID_KEY: item_id }))
            .await?;

        Ok(AnswerOutcome::Saved {
            saved_at: now,
            timer_started_now,
        })
    }

    pub async fn log_event(
        &self,
        attempt_id: Uuid,
        event_type: &str,
        metadata: JsonValue,
        evidence: Option<EvidenceImage>,
    ) -> Result<LogOutcome> {
        let _guard = self.locks.acquire(attempt_id).await;
        let attempt = self.get_attempt(attempt_id).await?;
        self.ledger.log_event(&attempt, event_type, metadata, evidence).await
    }

    pub async fn verify_identity(&self, attempt_id: Uuid, image: EvidenceImage) -> Result<VerificationOutcome> {
        let _guard = self.locks.acquire(attempt_id).await;
        let mut attempt = self.get_attempt(attempt_id).await?;
        self.identity.verify(&mut attempt, image).await
    }

    /// Grades and closes the attempt in a single write.
    fn finalize(attempt: &mut Attempt, exam: &Exam, by: FinalizedBy, now: DateTime<Utc>) -> f64 {
        let score = GradingService::score(exam, attempt).final_score;
        attempt.score = Some(score);
        attempt.completed_at = Some(now);
        attempt.finalized_by = Some(by);
        attempt.updated_at = now;
        score
    }

    pub async fn submit(&self, attempt_id: Uuid) -> Result<SubmitOutcome> {
        let _guard = self.locks.acquire(attempt_id).await;
        let (mut attempt, exam) = self.load(attempt_id).await?;

        if attempt.is_terminal() {
            return Ok(SubmitOutcome::AlreadyFinalized(attempt));
        }

        let score = Self::finalize(&mut attempt, &exam, FinalizedBy::Student, self.clock.now());
        self.store.update_attempt(&attempt).await?;
        tracing::info!(attempt_id = %attempt_id, score, "attempt submitted");
        Ok(SubmitOutcome::Completed(attempt))
    }

    pub async fn result(&self, attempt_id: Uuid) -> Result<GradeView> {
        let (attempt, exam) = self.load(attempt_id).await?;
        let thresholds = self.catalog.risk_thresholds(exam.tenant_id).await?;
        let events = self.ledger.events(attempt_id).await?;
        let risk = RiskService::assess(&events, &thresholds);
        let visibility = RiskService::grade_visibility(&attempt, risk.tier);

        let message = match (attempt.review_status, attempt.completed_at.is_some(), visibility.visible) {
            (ReviewStatus::Rejected, _, _) => "Your attempt was annulled by the reviewer",
            (ReviewStatus::Approved, _, _) => "Your grade has been confirmed",
            (_, false, _) => "The exam is still in progress",
            (_, true, true) => "Your grade is available",
            (_, true, false) if risk.tier != RiskTier::Low => "Your grade is pending review",
            (_, true, false) => "Your identity is pending review; the grade will be published afterwards",
        };

        Ok(GradeView {
            attempt_id,
            completed: attempt.completed_at.is_some(),
            visible: visibility.visible,
            score: visibility.score,
            review_status: attempt.review_status,
            teacher_comment: if visibility.visible {
                attempt.teacher_comment.clone()
            } else {
                None
            },
            message: message.to_string(),
        })
    }

    /// Closes every running attempt whose deadline passed more than the grace
    /// margin ago. Attempts still owed a timer reset are left alone.
    pub async fn finalize_expired(&self) -> Result<usize> {
        let mut closed = 0;
        for candidate in self.store.list_running_attempts().await? {
            let _guard = self.locks.acquire(candidate.id).await;
            let mut attempt = match self.store.get_attempt(candidate.id).await {
                Ok(Some(attempt)) => attempt,
                Ok(None) => continue,
                Err(e) => {
                    tracing::error!(attempt_id = %candidate.id, error = %e, "cannot reload attempt for timeout sweep");
                    continue;
                }
            };
            let Some(start) = attempt.start_time else {
                continue;
            };
            if attempt.is_terminal() {
                continue;
            }
            let exam = match self.exam(attempt.exam_id).await {
                Ok(exam) => exam,
                Err(e) => {
                    tracing::error!(attempt_id = %attempt.id, error = %e, "cannot finalize attempt without its exam");
                    continue;
                }
            };

            let now = self.clock.now();
            if self.reset_eligible(&attempt, &exam, now) {
                continue;
            }
            let cutoff = start + Duration::seconds(exam.duration_seconds + self.policy.timeout_grace_secs);
            if now <= cutoff {
                continue;
            }

            let score = Self::finalize(&mut attempt, &exam, FinalizedBy::Timeout, now);
            if let Err(e) = self.store.update_attempt(&attempt).await {
                tracing::error!(attempt_id = %attempt.id, error = %e, "failed to persist timed-out attempt");
                continue;
            }
            tracing::warn!(attempt_id = %attempt.id, score, "attempt finalized by timeout");
            closed += 1;
        }
        Ok(closed)
    }
}
