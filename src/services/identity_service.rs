//! Identity verification: up to N classifier-backed tries per session, then
//! escalation to manual review. Escalation never blocks the student.

use crate::config::RuntimePolicy;
use crate::error::Result;
use crate::models::attempt::{Attempt, IdentityStatus};
use crate::models::evidence::{EvidenceKind, EvidenceRecord, EvidenceStatus};
use crate::models::security_event::EventType;
use crate::services::blob_store::BlobStore;
use crate::services::classifier::{ClassifierChain, ClassifierError, DocumentReading};
use crate::services::clock::Clock;
use crate::services::ledger_service::{retry_failure_metadata, EvidenceImage, LedgerService};
use crate::services::store::AttemptStore;
use bytes::Bytes;
use chrono::Duration;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct VerificationOutcome {
    /// The student may proceed into the exam.
    pub success: bool,
    /// Identity is unresolved and a human will look at it.
    pub warning: bool,
    /// Another image may be submitted.
    pub retry: bool,
    pub identity_status: IdentityStatus,
    pub attempt_number: i32,
    pub attempts_remaining: u32,
    pub evidence_id: Option<Uuid>,
    pub message: String,
}

/// Strips everything but ASCII digits.
pub fn digits_only(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Declared identifier matches if either digit string contains the other.
/// An empty side never matches.
pub fn identifier_matches(declared: &str, extracted: &str) -> bool {
    let declared = digits_only(declared);
    let extracted = digits_only(extracted);
    if declared.is_empty() || extracted.is_empty() {
        return false;
    }
    extracted.contains(&declared) || declared.contains(&extracted)
}

enum Verdict {
    Match,
    Mismatch(&'static str),
    Unavailable(ClassifierError),
}

fn judge(attempt: &Attempt, result: std::result::Result<DocumentReading, ClassifierError>) -> Verdict {
    match result {
        Ok(reading) if !reading.is_document => Verdict::Mismatch("no identity document detected"),
        Ok(reading) if identifier_matches(&attempt.student_identifier, &reading.extracted_digits) => {
            Verdict::Match
        }
        Ok(_) => Verdict::Mismatch("document number does not match the declared identifier"),
        Err(ClassifierError::RateLimited) => Verdict::Unavailable(ClassifierError::RateLimited),
        Err(_) => Verdict::Mismatch("document could not be read"),
    }
}

#[derive(Clone)]
pub struct IdentityService {
    store: Arc<dyn AttemptStore>,
    blobs: Arc<dyn BlobStore>,
    classifiers: ClassifierChain,
    ledger: LedgerService,
    clock: Arc<dyn Clock>,
    policy: RuntimePolicy,
}

impl IdentityService {
    pub fn new(
        store: Arc<dyn AttemptStore>,
        blobs: Arc<dyn BlobStore>,
        classifiers: ClassifierChain,
        ledger: LedgerService,
        clock: Arc<dyn Clock>,
        policy: RuntimePolicy,
    ) -> Self {
        Self {
            store,
            blobs,
            classifiers,
            ledger,
            clock,
            policy,
        }
    }

    fn settled(&self, attempt: &Attempt, attempt_number: i32) -> Option<VerificationOutcome> {
        let (warning, message) = match attempt.identity_status {
            IdentityStatus::Verified => (false, "Identity already verified"),
            IdentityStatus::ManualReview => (true, "Identity will be confirmed by a reviewer"),
            IdentityStatus::Unverified if attempt.is_terminal() => {
                return Some(VerificationOutcome {
                    success: false,
                    warning: false,
                    retry: false,
                    identity_status: attempt.identity_status,
                    attempt_number,
                    attempts_remaining: 0,
                    evidence_id: None,
                    message: "Attempt is already finalized".to_string(),
                })
            }
            IdentityStatus::Unverified => return None,
        };
        Some(VerificationOutcome {
            success: true,
            warning,
            retry: false,
            identity_status: attempt.identity_status,
            attempt_number,
            attempts_remaining: 0,
            evidence_id: None,
            message: message.to_string(),
        })
    }

    /// Runs one verification try for `attempt` and persists every change.
    /// The caller holds the attempt lock.
    pub async fn verify(&self, attempt: &mut Attempt, image: EvidenceImage) -> Result<VerificationOutcome> {
        let history: Vec<EvidenceRecord> = self
            .store
            .list_evidence(attempt.id)
            .await?
            .into_iter()
            .filter(|r| r.kind == EvidenceKind::IdentityDocument)
            .collect();
        let prior = history.len() as i32;

        if let Some(outcome) = self.settled(attempt, prior) {
            return Ok(outcome);
        }

        let now = self.clock.now();
        let attempt_number = prior + 1;
        let folder = format!("{}/{}", attempt.id, EvidenceKind::IdentityDocument.as_str());
        let image_bytes = Bytes::from(image.bytes);

        let key = match self
            .blobs
            .put(&folder, image.kind.extension(), image_bytes.clone())
            .await
        {
            Ok(key) => key,
            Err(e) => {
                tracing::warn!(attempt_id = %attempt.id, error = %e, "identity image not stored; escalating");
                let latest = history.last().cloned();
                return self
                    .escalate(attempt, latest, attempt_number, "Evidence storage is unavailable")
                    .await;
            }
        };

        let mut record = EvidenceRecord::new(
            attempt.id,
            EvidenceKind::IdentityDocument,
            key.clone(),
            EvidenceStatus::Processing,
            attempt_number,
            now,
        );
        self.store.insert_evidence(&record).await?;

        let session_started = history.first().map(|r| r.created_at).unwrap_or(now);
        if now - session_started > Duration::seconds(self.policy.identity_session_ceiling_secs) {
            tracing::warn!(attempt_id = %attempt.id, "identity session ceiling exceeded");
            return self
                .escalate(attempt, Some(record), attempt_number, "Verification window has expired")
                .await;
        }

        let result = self.classifiers.classify(&image_bytes).await;
        record.analysis = match &result {
            Ok(reading) => json!({
                "is_document": reading.is_document,
                "extracted_digits": reading.extracted_digits,
            }),
            Err(e) => json!({ "error": e.to_string() }),
        };
        record.updated_at = self.clock.now();

        match judge(attempt, result) {
            Verdict::Match => {
                record.status = EvidenceStatus::Success;
                self.store.update_evidence(&record).await?;

                attempt.identity_status = IdentityStatus::Verified;
                attempt.photo_id_path = Some(key);
                attempt.updated_at = record.updated_at;
                self.store.update_attempt(attempt).await?;

                tracing::info!(attempt_id = %attempt.id, attempt_number, "identity verified");
                Ok(VerificationOutcome {
                    success: true,
                    warning: false,
                    retry: false,
                    identity_status: IdentityStatus::Verified,
                    attempt_number,
                    attempts_remaining: 0,
                    evidence_id: Some(record.id),
                    message: "Identity verified".to_string(),
                })
            }
            Verdict::Unavailable(err) => {
                tracing::warn!(attempt_id = %attempt.id, error = %err, "classifier unavailable; escalating");
                self.escalate(attempt, Some(record), attempt_number, "Verification service is busy")
                    .await
            }
            Verdict::Mismatch(reason) => {
                record.status = EvidenceStatus::Failed;
                self.store.update_evidence(&record).await?;
                self.ledger
                    .append_internal(
                        attempt,
                        EventType::IdentityMismatch,
                        retry_failure_metadata(attempt_number, Some(&record.file_path), reason),
                    )
                    .await?;

                let max = self.policy.identity_max_attempts as i32;
                if attempt_number >= max {
                    tracing::warn!(attempt_id = %attempt.id, attempt_number, "identity retries exhausted");
                    return self
                        .escalate(attempt, Some(record), attempt_number, "Identity could not be confirmed")
                        .await;
                }

                tracing::info!(attempt_id = %attempt.id, attempt_number, reason, "identity try failed");
                Ok(VerificationOutcome {
                    success: false,
                    warning: false,
                    retry: true,
                    identity_status: IdentityStatus::Unverified,
                    attempt_number,
                    attempts_remaining: (max - attempt_number) as u32,
                    evidence_id: Some(record.id),
                    message: format!("Verification failed: {}", reason),
                })
            }
        }
    }

    async fn escalate(
        &self,
        attempt: &mut Attempt,
        latest: Option<EvidenceRecord>,
        attempt_number: i32,
        reason: &str,
    ) -> Result<VerificationOutcome> {
        let now = self.clock.now();
        let evidence_id = match latest {
            Some(mut record) => {
                record.status = EvidenceStatus::ManualReview;
                record.updated_at = now;
                self.store.update_evidence(&record).await?;
                Some(record.id)
            }
            None => None,
        };

        attempt.identity_status = IdentityStatus::ManualReview;
        attempt.updated_at = now;
        self.store.update_attempt(attempt).await?;

        tracing::warn!(attempt_id = %attempt.id, reason, "identity escalated to manual review");
        Ok(VerificationOutcome {
            success: true,
            warning: true,
            retry: false,
            identity_status: IdentityStatus::ManualReview,
            attempt_number,
            attempts_remaining: 0,
            evidence_id,
            message: format!("{}; a reviewer will confirm your identity", reason),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::blob_store::{MemoryBlobStore, UnavailableBlobStore};
    use crate::services::classifier::MockDocumentClassifier;
    use crate::services::clock::ManualClock;
    use crate::services::store::MemoryStore;
    use crate::utils::image::ImageKind;
    use chrono::Utc;

    const JPEG: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0, 0x10];

    struct Harness {
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        service: IdentityService,
    }

    fn harness(classifier: MockDocumentClassifier, blobs: Arc<dyn BlobStore>) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let policy = RuntimePolicy::default();
        let ledger = LedgerService::new(store.clone(), blobs.clone(), clock.clone(), policy.clone());
        let chain = ClassifierChain::new(policy.classifier_timeout).with_backend("mock", Arc::new(classifier));
        let service = IdentityService::new(store.clone(), blobs, chain, ledger, clock.clone(), policy);
        Harness { store, clock, service }
    }

    fn memory_blobs() -> Arc<dyn BlobStore> {
        Arc::new(MemoryBlobStore::new("secret", Arc::new(ManualClock::new(Utc::now()))))
    }

    fn image() -> EvidenceImage {
        EvidenceImage {
            bytes: JPEG.to_vec(),
            kind: ImageKind::Jpeg,
        }
    }

    async fn new_attempt(store: &MemoryStore) -> Attempt {
        let attempt = Attempt::new(Uuid::new_v4(), "Ana".into(), "40.123.456".into(), vec![], Utc::now());
        store.insert_attempt(&attempt).await.unwrap();
        attempt
    }

    #[test]
    fn digit_matching_tolerates_noise_and_partial_reads() {
        assert!(identifier_matches("40.123.456", "DNI 40123456 ARG"));
        assert!(identifier_matches("40123456", "0123456"));
        assert!(identifier_matches("1234", "991234"));
        assert!(identifier_matches("40123456", "0123"));
        assert!(identifier_matches("40123456", "456"));
        assert!(!identifier_matches("40123456", "40123457"));
        assert!(!identifier_matches("40123456", "DNI"));
        assert!(!identifier_matches("abc", "123"));
    }

    #[tokio::test]
    async fn three_failures_escalate_and_stop_calling_the_classifier() {
        let mut classifier = MockDocumentClassifier::new();
        classifier.expect_classify().times(3).returning(|_| {
            Ok(DocumentReading {
                is_document: true,
                extracted_digits: "99999999".to_string(),
            })
        });
        let h = harness(classifier, memory_blobs());
        let mut attempt = new_attempt(&h.store).await;

        let first = h.service.verify(&mut attempt, image()).await.unwrap();
        assert!(!first.success && first.retry);
        assert_eq!(first.attempts_remaining, 2);
        let second = h.service.verify(&mut attempt, image()).await.unwrap();
        assert_eq!(second.attempt_number, 2);

        let third = h.service.verify(&mut attempt, image()).await.unwrap();
        assert!(third.success && third.warning && !third.retry);
        assert_eq!(third.identity_status, IdentityStatus::ManualReview);

        let evidence = h.store.list_evidence(attempt.id).await.unwrap();
        assert_eq!(evidence.len(), 3);
        assert_eq!(evidence.last().unwrap().status, EvidenceStatus::ManualReview);

        let events = h.store.list_events(attempt.id).await.unwrap();
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|e| e.is_retry_failure()));

        let fourth = h.service.verify(&mut attempt, image()).await.unwrap();
        assert!(fourth.warning);
        assert_eq!(h.store.list_evidence(attempt.id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn match_marks_canonical_photo() {
        let mut classifier = MockDocumentClassifier::new();
        classifier.expect_classify().times(1).returning(|_| {
            Ok(DocumentReading {
                is_document: true,
                extracted_digits: "40123456".to_string(),
            })
        });
        let h = harness(classifier, memory_blobs());
        let mut attempt = new_attempt(&h.store).await;

        let outcome = h.service.verify(&mut attempt, image()).await.unwrap();
        assert!(outcome.success && !outcome.warning);

        let stored = h.store.get_attempt(attempt.id).await.unwrap().unwrap();
        assert_eq!(stored.identity_status, IdentityStatus::Verified);
        let evidence = h.store.list_evidence(attempt.id).await.unwrap();
        assert_eq!(stored.photo_id_path.as_deref(), Some(evidence[0].file_path.as_str()));
        assert_eq!(evidence[0].status, EvidenceStatus::Success);
    }

    #[tokio::test]
    async fn rate_limit_escalates_on_first_try() {
        let mut classifier = MockDocumentClassifier::new();
        classifier
            .expect_classify()
            .times(1)
            .returning(|_| Err(ClassifierError::RateLimited));
        let h = harness(classifier, memory_blobs());
        let mut attempt = new_attempt(&h.store).await;

        let outcome = h.service.verify(&mut attempt, image()).await.unwrap();
        assert!(outcome.success && outcome.warning);
        assert_eq!(outcome.attempt_number, 1);
        assert!(h.store.list_events(attempt.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn storage_failure_escalates_without_classifying() {
        let mut classifier = MockDocumentClassifier::new();
        classifier.expect_classify().never();
        let h = harness(classifier, Arc::new(UnavailableBlobStore));
        let mut attempt = new_attempt(&h.store).await;

        let outcome = h.service.verify(&mut attempt, image()).await.unwrap();
        assert!(outcome.success && outcome.warning);
        assert_eq!(attempt.identity_status, IdentityStatus::ManualReview);
    }

    #[tokio::test]
    async fn session_ceiling_escalates_late_retries() {
        let mut classifier = MockDocumentClassifier::new();
        classifier.expect_classify().times(1).returning(|_| {
            Ok(DocumentReading {
                is_document: false,
                extracted_digits: String::new(),
            })
        });
        let h = harness(classifier, memory_blobs());
        let mut attempt = new_attempt(&h.store).await;

        assert!(h.service.verify(&mut attempt, image()).await.unwrap().retry);
        h.clock.advance_secs(601);
        let late = h.service.verify(&mut attempt, image()).await.unwrap();
        assert!(late.warning && !late.retry);
    }
}
