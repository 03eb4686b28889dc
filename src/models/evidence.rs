use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceKind {
    IdentityDocument,
    IncidentSnapshot,
}

impl EvidenceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IdentityDocument => "identity_document",
            Self::IncidentSnapshot => "incident_snapshot",
        }
    }
}

impl FromStr for EvidenceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "identity_document" => Ok(Self::IdentityDocument),
            "incident_snapshot" => Ok(Self::IncidentSnapshot),
            other => Err(format!("unknown evidence kind '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceStatus {
    /// Stored, classification not finished yet.
    Processing,
    Success,
    Failed,
    ManualReview,
    /// Incident snapshot; never classified.
    Stored,
}

impl EvidenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::ManualReview => "manual_review",
            Self::Stored => "stored",
        }
    }
}

impl FromStr for EvidenceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processing" => Ok(Self::Processing),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "manual_review" => Ok(Self::ManualReview),
            "stored" => Ok(Self::Stored),
            other => Err(format!("unknown evidence status '{}'", other)),
        }
    }
}

/// A captured image plus what the classifier said about it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceRecord {
    pub id: Uuid,
    pub attempt_id: Uuid,
    pub kind: EvidenceKind,
    pub file_path: String,
    pub status: EvidenceStatus,
    /// 1-based verification try; 0 for incident snapshots.
    pub attempt_number: i32,
    pub analysis: JsonValue,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EvidenceRecord {
    pub fn new(
        attempt_id: Uuid,
        kind: EvidenceKind,
        file_path: String,
        status: EvidenceStatus,
        attempt_number: i32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            attempt_id,
            kind,
            file_path,
            status,
            attempt_number,
            analysis: JsonValue::Object(Default::default()),
            created_at: now,
            updated_at: now,
        }
    }
}
