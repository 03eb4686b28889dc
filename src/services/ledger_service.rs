//! Security event ledger: admission rules for client events, internal
//! appends, and the read-time incident correlation view.

use crate::config::RuntimePolicy;
use crate::error::Result;
use crate::models::attempt::Attempt;
use crate::models::evidence::{EvidenceKind, EvidenceRecord, EvidenceStatus};
use crate::models::security_event::{
    EventType, NewSecurityEvent, SecurityEvent, EVIDENCE_PATH_KEY, RETRY_FAILURE_KEY,
};
use crate::services::blob_store::BlobStore;
use crate::services::clock::Clock;
use crate::services::store::AttemptStore;
use crate::utils::image::ImageKind;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as JsonValue};
use std::sync::Arc;
use uuid::Uuid;

/// Why a student-side write was accepted as a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IgnoreReason {
    Terminal,
    TimerNotStarted,
    UnknownEventType,
    GracePeriod,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum LogOutcome {
    Recorded { event: SecurityEvent },
    Ignored { reason: IgnoreReason },
}

/// Snapshot attached to a client event.
pub struct EvidenceImage {
    pub bytes: Vec<u8>,
    pub kind: ImageKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuickAnswer {
    pub item_id: Option<String>,
    pub answered_at: DateTime<Utc>,
    pub reaction_seconds: f64,
}

/// One departure from the exam surface and what followed it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IncidentCorrelation {
    pub seq: i64,
    pub event_type: EventType,
    pub occurred_at: DateTime<Utc>,
    pub returned_at: Option<DateTime<Utc>>,
    pub away_seconds: Option<f64>,
    pub suspicious_answer: Option<QuickAnswer>,
}

#[derive(Clone)]
pub struct LedgerService {
    store: Arc<dyn AttemptStore>,
    blobs: Arc<dyn BlobStore>,
    clock: Arc<dyn Clock>,
    policy: RuntimePolicy,
}

impl LedgerService {
    pub fn new(
        store: Arc<dyn AttemptStore>,
        blobs: Arc<dyn BlobStore>,
        clock: Arc<dyn Clock>,
        policy: RuntimePolicy,
    ) -> Self {
        Self {
            store,
            blobs,
            clock,
            policy,
        }
    }

    fn admit(&self, attempt: &Attempt, now: DateTime<Utc>) -> Option<IgnoreReason> {
        if attempt.is_terminal() {
            return Some(IgnoreReason::Terminal);
        }
        let start = match attempt.start_time {
            Some(start) => start,
            None => return Some(IgnoreReason::TimerNotStarted),
        };
        if now < start + Duration::seconds(self.policy.event_grace_secs) {
            return Some(IgnoreReason::GracePeriod);
        }
        None
    }

    /// Records a client-reported event. The caller holds the attempt lock.
    pub async fn log_event(
        &self,
        attempt: &Attempt,
        event_type: &str,
        metadata: JsonValue,
        evidence: Option<EvidenceImage>,
    ) -> Result<LogOutcome> {
        let event_type: EventType = match event_type.trim().parse() {
            Ok(t) => t,
            Err(_) => {
                tracing::debug!(attempt_id = %attempt.id, event_type, "ignoring unknown event type");
                return Ok(LogOutcome::Ignored {
                    reason: IgnoreReason::UnknownEventType,
                });
            }
        };

        let now = self.clock.now();
        if let Some(reason) = self.admit(attempt, now) {
            tracing::debug!(attempt_id = %attempt.id, %event_type, ?reason, "event ignored");
            return Ok(LogOutcome::Ignored { reason });
        }

        let mut metadata = client_metadata(metadata);
        if let Some(image) = evidence {
            if let Some(path) = self.store_snapshot(attempt.id, image, now).await? {
                metadata.insert(EVIDENCE_PATH_KEY.to_string(), JsonValue::String(path));
            }
        }

        let event = self
            .store
            .append_event(NewSecurityEvent {
                attempt_id: attempt.id,
                event_type,
                timestamp: now,
                metadata: JsonValue::Object(metadata),
            })
            .await?;
        tracing::info!(attempt_id = %attempt.id, %event_type, seq = event.seq, "security event recorded");
        Ok(LogOutcome::Recorded { event })
    }

    /// Server-originated append; skips the timer and grace checks.
    pub async fn append_internal(
        &self,
        attempt: &Attempt,
        event_type: EventType,
        metadata: JsonValue,
    ) -> Result<LogOutcome> {
        if attempt.is_terminal() {
            return Ok(LogOutcome::Ignored {
                reason: IgnoreReason::Terminal,
            });
        }
        let event = self
            .store
            .append_event(NewSecurityEvent {
                attempt_id: attempt.id,
                event_type,
                timestamp: self.clock.now(),
                metadata,
            })
            .await?;
        Ok(LogOutcome::Recorded { event })
    }

    pub async fn events(&self, attempt_id: Uuid) -> Result<Vec<SecurityEvent>> {
        self.store.list_events(attempt_id).await
    }

    /// Returns the stored key, or `None` when storage failed and the event
    /// should go in without evidence.
    async fn store_snapshot(
        &self,
        attempt_id: Uuid,
        image: EvidenceImage,
        now: DateTime<Utc>,
    ) -> Result<Option<String>> {
        let folder = format!("{}/{}", attempt_id, EvidenceKind::IncidentSnapshot.as_str());
        let key = match self
            .blobs
            .put(&folder, image.kind.extension(), Bytes::from(image.bytes))
            .await
        {
            Ok(key) => key,
            Err(e) => {
                tracing::warn!(attempt_id = %attempt_id, error = %e, "incident snapshot not stored");
                return Ok(None);
            }
        };

        let record = EvidenceRecord::new(
            attempt_id,
            EvidenceKind::IncidentSnapshot,
            key.clone(),
            EvidenceStatus::Stored,
            0,
            now,
        );
        self.store.insert_evidence(&record).await?;
        Ok(Some(key))
    }
}

/// Clients may not forge server-owned keys; non-object payloads are wrapped.
fn client_metadata(raw: JsonValue) -> Map<String, JsonValue> {
    let mut map = match raw {
        JsonValue::Object(map) => map,
        JsonValue::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    };
    map.remove(RETRY_FAILURE_KEY);
    map.remove(EVIDENCE_PATH_KEY);
    map
}

/// Pairs each departure with the next return and the first answer saved
/// within `window_secs` of that return (or of the departure, if the student
/// never came back). `events` must be in ledger order.
pub fn correlate(events: &[SecurityEvent], window_secs: i64) -> Vec<IncidentCorrelation> {
    let window = Duration::seconds(window_secs);
    let mut incidents = Vec::new();

    for (idx, event) in events.iter().enumerate() {
        if !event.event_type.is_departure() {
            continue;
        }
        let later = &events[idx + 1..];

        let returned_at = later
            .iter()
            .find(|e| e.event_type == EventType::FocusGained)
            .map(|e| e.timestamp);
        let anchor = returned_at.unwrap_or(event.timestamp);

        let suspicious_answer = later
            .iter()
            .filter(|e| e.event_type == EventType::AnswerSaved)
            .find(|e| e.timestamp >= anchor && e.timestamp <= anchor + window)
            .map(|e| QuickAnswer {
                item_id: e.item_id().map(str::to_string),
                answered_at: e.timestamp,
                reaction_seconds: seconds_between(anchor, e.timestamp),
            });

        incidents.push(IncidentCorrelation {
            seq: event.seq,
            event_type: event.event_type,
            occurred_at: event.timestamp,
            returned_at,
            away_seconds: returned_at.map(|r| seconds_between(event.timestamp, r)),
            suspicious_answer,
        });
    }

    incidents
}

fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / 1000.0
}

/// Metadata for an identity mismatch produced by a failed verification try.
pub fn retry_failure_metadata(attempt_number: i32, evidence_path: Option<&str>, reason: &str) -> JsonValue {
    json!({
        RETRY_FAILURE_KEY: true,
        "attempt_number": attempt_number,
        EVIDENCE_PATH_KEY: evidence_path,
        "reason": reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::security_event::ITEM_ID_KEY;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn ev(seq: i64, event_type: EventType, secs: i64, metadata: JsonValue) -> SecurityEvent {
        SecurityEvent {
            seq,
            attempt_id: Uuid::nil(),
            event_type,
            timestamp: at(secs),
            metadata,
        }
    }

    #[test]
    fn flags_quick_answer_after_return() {
        let events = vec![
            ev(1, EventType::FocusLost, 100, json!({})),
            ev(2, EventType::FocusGained, 145, json!({})),
            ev(3, EventType::AnswerSaved, 152, json!({ ITEM_ID_KEY: "q7" })),
        ];
        let incidents = correlate(&events, 30);
        assert_eq!(incidents.len(), 1);
        let incident = &incidents[0];
        assert_eq!(incident.away_seconds, Some(45.0));
        let answer = incident.suspicious_answer.as_ref().unwrap();
        assert_eq!(answer.item_id.as_deref(), Some("q7"));
        assert_eq!(answer.reaction_seconds, 7.0);
    }

    #[test]
    fn answers_outside_window_are_not_flagged() {
        let events = vec![
            ev(1, EventType::FullscreenExit, 0, json!({})),
            ev(2, EventType::FocusGained, 10, json!({})),
            ev(3, EventType::AnswerSaved, 41, json!({ ITEM_ID_KEY: "q1" })),
        ];
        let incidents = correlate(&events, 30);
        assert!(incidents[0].suspicious_answer.is_none());
    }

    #[test]
    fn departure_without_return_anchors_on_itself() {
        let events = vec![
            ev(1, EventType::AnswerSaved, 0, json!({ ITEM_ID_KEY: "q0" })),
            ev(2, EventType::FocusLost, 5, json!({})),
            ev(3, EventType::AnswerSaved, 20, json!({ ITEM_ID_KEY: "q2" })),
        ];
        let incidents = correlate(&events, 30);
        assert_eq!(incidents[0].returned_at, None);
        assert_eq!(incidents[0].away_seconds, None);
        assert_eq!(incidents[0].suspicious_answer.as_ref().unwrap().reaction_seconds, 15.0);
    }

    #[test]
    fn correlation_is_recomputed_from_the_ledger() {
        let mut events = vec![ev(1, EventType::FocusLost, 0, json!({}))];
        assert!(correlate(&events, 30)[0].returned_at.is_none());
        events.push(ev(2, EventType::FocusGained, 3, json!({})));
        assert_eq!(correlate(&events, 30)[0].away_seconds, Some(3.0));
    }

    #[test]
    fn client_metadata_cannot_forge_server_keys() {
        let cleaned = client_metadata(json!({
            RETRY_FAILURE_KEY: true,
            EVIDENCE_PATH_KEY: "x/y.png",
            "faces": 2
        }));
        assert_eq!(JsonValue::Object(cleaned), json!({ "faces": 2 }));
        assert_eq!(JsonValue::Object(client_metadata(json!("raw"))), json!({ "value": "raw" }));
    }
}
