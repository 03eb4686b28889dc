#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::Router;
use chrono::{TimeZone, Utc};
use exam_proctor_backend::{
    config::RuntimePolicy,
    error::{Error, Result as AppResult},
    middleware::auth::RoleGate,
    models::attempt::Attempt,
    models::evidence::EvidenceRecord,
    models::exam::{Exam, ExamItem, ItemOption},
    models::security_event::{NewSecurityEvent, SecurityEvent},
    routes::{api_router, RouterSettings},
    services::{
        blob_store::MemoryBlobStore,
        classifier::{ClassifierChain, ClassifierError, DocumentClassifier, DocumentReading},
        clock::ManualClock,
        store::{AttemptStore, AuditEntry, MemoryStore},
    },
    AppState, Ports,
};
use uuid::Uuid;

pub const JWT_SECRET: &str = "test_secret_key";
pub const PNG_BYTES: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR\0\0\0\x01";

/// Classifier that replays a fixed script and counts calls.
#[derive(Default)]
pub struct ScriptedClassifier {
    script: Mutex<VecDeque<Result<DocumentReading, ClassifierError>>>,
    calls: AtomicUsize,
}

impl ScriptedClassifier {
    pub fn push(&self, reply: Result<DocumentReading, ClassifierError>) {
        self.script.lock().unwrap().push_back(reply);
    }

    pub fn push_reading(&self, digits: &str) {
        self.push(Ok(DocumentReading {
            is_document: true,
            extracted_digits: digits.to_string(),
        }));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocumentClassifier for ScriptedClassifier {
    async fn classify(&self, _image: &[u8]) -> Result<DocumentReading, ClassifierError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ClassifierError::Unavailable("script exhausted".into())))
    }
}

/// Delegates to a `MemoryStore` but fails chosen writes on demand.
#[derive(Default)]
pub struct FaultyStore {
    inner: Arc<MemoryStore>,
    failing_updates: Mutex<HashSet<Uuid>>,
    failing_audit: AtomicBool,
}

impl FaultyStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            ..Default::default()
        }
    }

    pub fn fail_updates_for(&self, attempt_id: Uuid) {
        self.failing_updates.lock().unwrap().insert(attempt_id);
    }

    pub fn fail_audit(&self, fail: bool) {
        self.failing_audit.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl AttemptStore for FaultyStore {
    async fn insert_attempt(&self, attempt: &Attempt) -> AppResult<()> {
        self.inner.insert_attempt(attempt).await
    }

    async fn get_attempt(&self, id: Uuid) -> AppResult<Option<Attempt>> {
        self.inner.get_attempt(id).await
    }

    async fn find_student_attempts(&self, exam_id: Uuid, student_identifier: &str) -> AppResult<Vec<Attempt>> {
        self.inner.find_student_attempts(exam_id, student_identifier).await
    }

    async fn list_exam_attempts(&self, exam_id: Uuid) -> AppResult<Vec<Attempt>> {
        self.inner.list_exam_attempts(exam_id).await
    }

    async fn list_running_attempts(&self) -> AppResult<Vec<Attempt>> {
        self.inner.list_running_attempts().await
    }

    async fn update_attempt(&self, attempt: &Attempt) -> AppResult<()> {
        if self.failing_updates.lock().unwrap().contains(&attempt.id) {
            return Err(Error::Internal("connection reset".into()));
        }
        self.inner.update_attempt(attempt).await
    }

    async fn append_event(&self, event: NewSecurityEvent) -> AppResult<SecurityEvent> {
        self.inner.append_event(event).await
    }

    async fn list_events(&self, attempt_id: Uuid) -> AppResult<Vec<SecurityEvent>> {
        self.inner.list_events(attempt_id).await
    }

    async fn insert_evidence(&self, record: &EvidenceRecord) -> AppResult<()> {
        self.inner.insert_evidence(record).await
    }

    async fn update_evidence(&self, record: &EvidenceRecord) -> AppResult<()> {
        self.inner.update_evidence(record).await
    }

    async fn list_evidence(&self, attempt_id: Uuid) -> AppResult<Vec<EvidenceRecord>> {
        self.inner.list_evidence(attempt_id).await
    }

    async fn append_audit(&self, entry: &AuditEntry) -> AppResult<()> {
        if self.failing_audit.load(Ordering::SeqCst) {
            return Err(Error::Internal("audit table unavailable".into()));
        }
        self.inner.append_audit(entry).await
    }
}

pub struct TestApp {
    pub state: AppState,
    pub store: Arc<MemoryStore>,
    pub faults: Arc<FaultyStore>,
    pub clock: Arc<ManualClock>,
    pub blobs: Arc<MemoryBlobStore>,
    pub classifier: Arc<ScriptedClassifier>,
    pub exam: Exam,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_policy(RuntimePolicy::default()).await
    }

    pub async fn with_policy(policy: RuntimePolicy) -> Self {
        let store = Arc::new(MemoryStore::new());
        let faults = Arc::new(FaultyStore::new(store.clone()));
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 5, 4, 9, 0, 0).unwrap(),
        ));
        let blobs = Arc::new(MemoryBlobStore::new("url-secret", clock.clone()));
        let classifier = Arc::new(ScriptedClassifier::default());

        let exam = sample_exam();
        store.put_exam(exam.clone()).await;

        let classifiers =
            ClassifierChain::new(policy.classifier_timeout).with_backend("scripted", classifier.clone());
        let state = AppState::new(
            Ports {
                store: faults.clone(),
                catalog: store.clone(),
                blobs: blobs.clone(),
                classifiers,
                clock: clock.clone(),
            },
            policy,
            "memory",
        );

        Self {
            state,
            store,
            faults,
            clock,
            blobs,
            classifier,
            exam,
        }
    }

    pub fn router(&self) -> Router {
        api_router(
            self.state.clone(),
            RouterSettings {
                public_rps: 1000,
                review_rps: 1000,
                reviewer_gate: RoleGate::reviewers(JWT_SECRET),
            },
        )
    }

    /// Checks in a fresh student and returns the attempt id.
    pub async fn check_in(&self, identifier: &str) -> Uuid {
        self.state
            .attempts
            .check_in(exam_proctor_backend::services::attempt_service::CheckIn {
                exam_id: self.exam.id,
                student_name: "Marta Quispe".into(),
                student_identifier: identifier.into(),
            })
            .await
            .expect("check in")
            .attempt_id
    }
}

fn item(id: &str, correct: &str, wrong: &str, points: Option<f64>, position: i32) -> ExamItem {
    ExamItem {
        item_id: id.into(),
        stem: format!("Question {}", id),
        options: vec![
            ItemOption { text: wrong.into(), correct: false },
            ItemOption { text: correct.into(), correct: true },
        ],
        points,
        position,
    }
}

/// Four single-point items, ten minute budget.
pub fn sample_exam() -> Exam {
    Exam {
        id: Uuid::new_v4(),
        tenant_id: Uuid::new_v4(),
        title: "Algebra I".into(),
        duration_seconds: 600,
        shuffle_items: false,
        items: vec![
            item("q1", "4", "5", Some(1.0), 1),
            item("q2", "9", "8", Some(1.0), 2),
            item("q3", "x=2", "x=3", None, 3),
            item("q4", "16", "12", Some(1.0), 4),
        ],
    }
}

pub fn reviewer_token(role: &str) -> String {
    let claims = exam_proctor_backend::middleware::auth::Claims {
        sub: format!("{}-7", role),
        exp: (Utc::now().timestamp() + 3600) as usize,
        role: Some(role.to_string()),
    };
    jsonwebtoken::encode(
        &jsonwebtoken::Header::default(),
        &claims,
        &jsonwebtoken::EncodingKey::from_secret(JWT_SECRET.as_bytes()),
    )
    .expect("encode token")
}
