use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Metadata key marking an identity mismatch produced by a failed verification retry.
pub const RETRY_FAILURE_KEY: &str = "retry_failure";
pub const EVIDENCE_PATH_KEY: &str = "evidence_path";
pub const ITEM_ID_KEY: &str = "item_id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    SessionResume,
    FocusLost,
    FocusGained,
    FullscreenExit,
    MultiFace,
    NoFace,
    AudioSpike,
    IdentityMismatch,
    CameraError,
    AnswerSaved,
}

impl EventType {
    pub const ALL: [EventType; 10] = [
        Self::SessionResume,
        Self::FocusLost,
        Self::FocusGained,
        Self::FullscreenExit,
        Self::MultiFace,
        Self::NoFace,
        Self::AudioSpike,
        Self::IdentityMismatch,
        Self::CameraError,
        Self::AnswerSaved,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SessionResume => "SESSION_RESUME",
            Self::FocusLost => "FOCUS_LOST",
            Self::FocusGained => "FOCUS_GAINED",
            Self::FullscreenExit => "FULLSCREEN_EXIT",
            Self::MultiFace => "MULTI_FACE",
            Self::NoFace => "NO_FACE",
            Self::AudioSpike => "AUDIO_SPIKE",
            Self::IdentityMismatch => "IDENTITY_MISMATCH",
            Self::CameraError => "CAMERA_ERROR",
            Self::AnswerSaved => "ANSWER_SAVED",
        }
    }

    /// Leaving the exam surface; opens an away window in the correlation view.
    pub fn is_departure(&self) -> bool {
        matches!(self, Self::FocusLost | Self::FullscreenExit)
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown event type '{}'", s))
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of an attempt's append-only ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityEvent {
    /// Insertion sequence; breaks timestamp ties.
    pub seq: i64,
    pub attempt_id: Uuid,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub metadata: JsonValue,
}

impl SecurityEvent {
    pub fn is_retry_failure(&self) -> bool {
        self.metadata
            .get(RETRY_FAILURE_KEY)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    pub fn evidence_path(&self) -> Option<&str> {
        self.metadata.get(EVIDENCE_PATH_KEY).and_then(|v| v.as_str())
    }

    pub fn item_id(&self) -> Option<&str> {
        self.metadata.get(ITEM_ID_KEY).and_then(|v| v.as_str())
    }
}

/// An event not yet persisted; the store assigns `seq`.
#[derive(Debug, Clone)]
pub struct NewSecurityEvent {
    pub attempt_id: Uuid,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub metadata: JsonValue,
}
