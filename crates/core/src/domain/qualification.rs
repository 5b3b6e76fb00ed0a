use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualificationVerdict {
    Qualified,
    Disqualified,
    /// Not enough signal to decide either way.
    Inconclusive,
}

impl QualificationVerdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Qualified => "qualified",
            Self::Disqualified => "disqualified",
            Self::Inconclusive => "inconclusive",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualificationResult {
    pub verdict: QualificationVerdict,
    /// Lead's own words about when they are free, if they offered any.
    pub availability: Option<String>,
    /// 0..=100
    pub confidence: u8,
    pub score: i32,
    pub reason: String,
}

impl QualificationResult {
    pub fn qualified(&self) -> bool {
        self.verdict == QualificationVerdict::Qualified
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeetingSlot {
    pub starts_at: DateTime<Utc>,
    pub duration_minutes: u32,
    pub booking_reference: String,
}
