//! Persistence ports for the attempt runtime.
//!
//! `AttemptStore` owns the three runtime tables (attempts, security events,
//! evidence records) plus the reviewer audit trail. `ExamCatalog` is the
//! read-only view of content and tenant settings produced elsewhere.
//! Security events have no update or delete operation: the ledger is
//! append-only by construction.

use crate::error::{Error, Result};
use crate::models::attempt::Attempt;
use crate::models::evidence::EvidenceRecord;
use crate::models::exam::Exam;
use crate::models::security_event::{NewSecurityEvent, SecurityEvent};
use crate::models::tenant::RiskThresholds;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub actor: String,
    pub action: String,
    pub attempt_id: Uuid,
    pub changes: JsonValue,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait AttemptStore: Send + Sync {
    async fn insert_attempt(&self, attempt: &Attempt) -> Result<()>;
    async fn get_attempt(&self, id: Uuid) -> Result<Option<Attempt>>;
    async fn find_student_attempts(&self, exam_id: Uuid, student_identifier: &str) -> Result<Vec<Attempt>>;
    async fn list_exam_attempts(&self, exam_id: Uuid) -> Result<Vec<Attempt>>;
    /// Attempts whose clock runs and that are not terminal yet.
    async fn list_running_attempts(&self) -> Result<Vec<Attempt>>;
    /// Replaces every mutable field of the row in one write.
    async fn update_attempt(&self, attempt: &Attempt) -> Result<()>;

    async fn append_event(&self, event: NewSecurityEvent) -> Result<SecurityEvent>;
    /// Ordered by timestamp, then insertion.
    async fn list_events(&self, attempt_id: Uuid) -> Result<Vec<SecurityEvent>>;

    async fn insert_evidence(&self, record: &EvidenceRecord) -> Result<()>;
    async fn update_evidence(&self, record: &EvidenceRecord) -> Result<()>;
    /// Ordered by creation time.
    async fn list_evidence(&self, attempt_id: Uuid) -> Result<Vec<EvidenceRecord>>;

    async fn append_audit(&self, entry: &AuditEntry) -> Result<()>;
}

#[async_trait]
pub trait ExamCatalog: Send + Sync {
    async fn exam(&self, exam_id: Uuid) -> Result<Option<Exam>>;
    async fn risk_thresholds(&self, tenant_id: Uuid) -> Result<RiskThresholds>;
}

#[derive(Default)]
struct MemoryInner {
    attempts: HashMap<Uuid, Attempt>,
    events: HashMap<Uuid, Vec<SecurityEvent>>,
    evidence: HashMap<Uuid, Vec<EvidenceRecord>>,
    audit: Vec<AuditEntry>,
    next_seq: i64,
    exams: HashMap<Uuid, Exam>,
    thresholds: HashMap<Uuid, RiskThresholds>,
}

/// In-process store backing `STORE=memory` runs and the test suite.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put_exam(&self, exam: Exam) {
        self.inner.write().await.exams.insert(exam.id, exam);
    }

    pub async fn put_thresholds(&self, tenant_id: Uuid, thresholds: RiskThresholds) {
        self.inner.write().await.thresholds.insert(tenant_id, thresholds);
    }

    pub async fn audit_entries(&self, attempt_id: Uuid) -> Vec<AuditEntry> {
        self.inner
            .read()
            .await
            .audit
            .iter()
            .filter(|e| e.attempt_id == attempt_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl AttemptStore for MemoryStore {
    async fn insert_attempt(&self, attempt: &Attempt) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.attempts.contains_key(&attempt.id) {
            return Err(Error::Internal(format!("Attempt {} already exists", attempt.id)));
        }
        let open_duplicate = !attempt.is_terminal()
            && inner.attempts.values().any(|a| {
                a.exam_id == attempt.exam_id
                    && a.student_identifier == attempt.student_identifier
                    && !a.is_terminal()
            });
        if open_duplicate {
            return Err(Error::Conflict(format!(
                "Identifier {} already has an open attempt",
                attempt.student_identifier
            )));
        }
        inner.attempts.insert(attempt.id, attempt.clone());
        Ok(())
    }

    async fn get_attempt(&self, id: Uuid) -> Result<Option<Attempt>> {
        Ok(self.inner.read().await.attempts.get(&id).cloned())
    }

    async fn find_student_attempts(&self, exam_id: Uuid, student_identifier: &str) -> Result<Vec<Attempt>> {
        let inner = self.inner.read().await;
        let mut rows: Vec<Attempt> = inner
            .attempts
            .values()
            .filter(|a| a.exam_id == exam_id && a.student_identifier == student_identifier)
            .cloned()
            .collect();
        rows.sort_by_key(|a| a.created_at);
        Ok(rows)
    }

    async fn list_exam_attempts(&self, exam_id: Uuid) -> Result<Vec<Attempt>> {
        let inner = self.inner.read().await;
        let mut rows: Vec<Attempt> = inner
            .attempts
            .values()
            .filter(|a| a.exam_id == exam_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    async fn list_running_attempts(&self) -> Result<Vec<Attempt>> {
        let inner = self.inner.read().await;
        Ok(inner
            .attempts
            .values()
            .filter(|a| a.start_time.is_some() && !a.is_terminal())
            .cloned()
            .collect())
    }

    async fn update_attempt(&self, attempt: &Attempt) -> Result<()> {
        let mut inner = self.inner.write().await;
        match inner.attempts.get_mut(&attempt.id) {
            Some(slot) => {
                *slot = attempt.clone();
                Ok(())
            }
            None => Err(Error::NotFound(format!("Attempt {} not found", attempt.id))),
        }
    }

    async fn append_event(&self, event: NewSecurityEvent) -> Result<SecurityEvent> {
        let mut inner = self.inner.write().await;
        if !inner.attempts.contains_key(&event.attempt_id) {
            return Err(Error::NotFound(format!("Attempt {} not found", event.attempt_id)));
        }
        inner.next_seq += 1;
        let stored = SecurityEvent {
            seq: inner.next_seq,
            attempt_id: event.attempt_id,
            event_type: event.event_type,
            timestamp: event.timestamp,
            metadata: event.metadata,
        };
        inner
            .events
            .entry(stored.attempt_id)
            .or_default()
            .push(stored.clone());
        Ok(stored)
    }

    async fn list_events(&self, attempt_id: Uuid) -> Result<Vec<SecurityEvent>> {
        let inner = self.inner.read().await;
        let mut rows = inner.events.get(&attempt_id).cloned().unwrap_or_default();
        rows.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.seq.cmp(&b.seq)));
        Ok(rows)
    }

    async fn insert_evidence(&self, record: &EvidenceRecord) -> Result<()> {
        let mut inner = self.inner.write().await;
        if !inner.attempts.contains_key(&record.attempt_id) {
            return Err(Error::NotFound(format!("Attempt {} not found", record.attempt_id)));
        }
        inner
            .evidence
            .entry(record.attempt_id)
            .or_default()
            .push(record.clone());
        Ok(())
    }

    async fn update_evidence(&self, record: &EvidenceRecord) -> Result<()> {
        let mut inner = self.inner.write().await;
        let slot = inner
            .evidence
            .get_mut(&record.attempt_id)
            .and_then(|rows| rows.iter_mut().find(|r| r.id == record.id))
            .ok_or_else(|| Error::NotFound(format!("Evidence {} not found", record.id)))?;
        *slot = record.clone();
        Ok(())
    }

    async fn list_evidence(&self, attempt_id: Uuid) -> Result<Vec<EvidenceRecord>> {
        let inner = self.inner.read().await;
        let mut rows = inner.evidence.get(&attempt_id).cloned().unwrap_or_default();
        rows.sort_by_key(|r| r.created_at);
        Ok(rows)
    }

    async fn append_audit(&self, entry: &AuditEntry) -> Result<()> {
        self.inner.write().await.audit.push(entry.clone());
        Ok(())
    }
}

#[async_trait]
impl ExamCatalog for MemoryStore {
    async fn exam(&self, exam_id: Uuid) -> Result<Option<Exam>> {
        Ok(self.inner.read().await.exams.get(&exam_id).cloned())
    }

    async fn risk_thresholds(&self, tenant_id: Uuid) -> Result<RiskThresholds> {
        Ok(self
            .inner
            .read()
            .await
            .thresholds
            .get(&tenant_id)
            .copied()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::attempt::ReviewStatus;
    use crate::models::security_event::EventType;
    use chrono::Duration;
    use serde_json::json;

    #[test]
    fn events_sort_by_time_then_insertion() {
        tokio_test::block_on(async {
            let store = MemoryStore::new();
            let now = Utc::now();
            let attempt = Attempt::new(Uuid::new_v4(), "Ana".into(), "1".into(), vec![], now);
            store.insert_attempt(&attempt).await.unwrap();

            let later = now + Duration::seconds(5);
            for (event_type, at) in [
                (EventType::FocusGained, later),
                (EventType::FocusLost, now),
                (EventType::AnswerSaved, later),
            ] {
                store
                    .append_event(NewSecurityEvent {
                        attempt_id: attempt.id,
                        event_type,
                        timestamp: at,
                        metadata: json!({}),
                    })
                    .await
                    .unwrap();
            }

            let kinds: Vec<EventType> = store
                .list_events(attempt.id)
                .await
                .unwrap()
                .into_iter()
                .map(|e| e.event_type)
                .collect();
            assert_eq!(
                kinds,
                vec![EventType::FocusLost, EventType::FocusGained, EventType::AnswerSaved]
            );
        });
    }

    #[test]
    fn second_open_attempt_for_a_student_conflicts() {
        tokio_test::block_on(async {
            let store = MemoryStore::new();
            let exam_id = Uuid::new_v4();
            let now = Utc::now();
            let first = Attempt::new(exam_id, "Ana".into(), "4012".into(), vec![], now);
            store.insert_attempt(&first).await.unwrap();

            let twin = Attempt::new(exam_id, "Ana".into(), "4012".into(), vec![], now);
            let err = store.insert_attempt(&twin).await.unwrap_err();
            assert!(matches!(err, Error::Conflict(_)));

            let other_exam = Attempt::new(Uuid::new_v4(), "Ana".into(), "4012".into(), vec![], now);
            store.insert_attempt(&other_exam).await.unwrap();

            let mut closed = first.clone();
            closed.review_status = ReviewStatus::Rejected;
            store.update_attempt(&closed).await.unwrap();
            store.insert_attempt(&twin).await.unwrap();
        });
    }

    #[test]
    fn events_for_unknown_attempt_are_rejected() {
        tokio_test::block_on(async {
            let store = MemoryStore::new();
            let err = store
                .append_event(NewSecurityEvent {
                    attempt_id: Uuid::new_v4(),
                    event_type: EventType::NoFace,
                    timestamp: Utc::now(),
                    metadata: json!({}),
                })
                .await
                .unwrap_err();
            assert!(matches!(err, Error::NotFound(_)));
        });
    }
}
