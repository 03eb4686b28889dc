use serde::{Deserialize, Serialize};

/// Tenant-configured risk cut-offs; `medium < high`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskThresholds {
    pub medium: i64,
    pub high: i64,
}

impl RiskThresholds {
    pub fn new(medium: i64, high: i64) -> Result<Self, String> {
        if medium >= high {
            return Err(format!(
                "medium risk threshold ({}) must be below the high threshold ({})",
                medium, high
            ));
        }
        Ok(Self { medium, high })
    }
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self { medium: 4, high: 10 }
    }
}
