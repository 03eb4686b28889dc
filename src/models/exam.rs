use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const DEFAULT_ITEM_WEIGHT: f64 = 1.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemOption {
    pub text: String,
    #[serde(default)]
    pub correct: bool,
}

/// An item as linked into one exam, weight included.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExamItem {
    pub item_id: String,
    pub stem: String,
    pub options: Vec<ItemOption>,
    /// Point value from the exam-item link; absent means the default weight.
    pub points: Option<f64>,
    #[serde(default)]
    pub position: i32,
}

impl ExamItem {
    pub fn weight(&self) -> f64 {
        self.points.unwrap_or(DEFAULT_ITEM_WEIGHT)
    }

    pub fn correct_option(&self) -> Option<&str> {
        self.options
            .iter()
            .find(|o| o.correct)
            .map(|o| o.text.as_str())
    }
}

/// Read-only exam content produced by the authoring side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Exam {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub title: String,
    /// Full time budget, buffers included.
    pub duration_seconds: i64,
    pub shuffle_items: bool,
    pub items: Vec<ExamItem>,
}

impl Exam {
    pub fn item(&self, item_id: &str) -> Option<&ExamItem> {
        self.items.iter().find(|i| i.item_id == item_id)
    }
}
