use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::DomainError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LeadId(pub String);

impl std::fmt::Display for LeadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// E.164 phone number (`+` followed by 8 to 15 digits).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PhoneNumber(String);

impl PhoneNumber {
    /// Normalises a CRM phone field. Formatting characters are stripped and a
    /// bare ten digit number is treated as a North American number.
    pub fn parse(raw: &str) -> Result<Self, DomainError> {
        let trimmed = raw.trim();
        let has_plus = trimmed.starts_with('+');
        let digits: String = trimmed.chars().filter(char::is_ascii_digit).collect();

        let stray = trimmed
            .chars()
            .any(|ch| !(ch.is_ascii_digit() || matches!(ch, '+' | '-' | ' ' | '(' | ')' | '.')));
        if stray || digits.is_empty() {
            return Err(DomainError::InvalidPhoneNumber(raw.to_owned()));
        }

        let normalized = if has_plus {
            format!("+{digits}")
        } else if digits.len() == 10 {
            format!("+1{digits}")
        } else if digits.len() == 11 && digits.starts_with('1') {
            format!("+{digits}")
        } else {
            return Err(DomainError::InvalidPhoneNumber(raw.to_owned()));
        };

        if !(9..=16).contains(&normalized.len()) {
            return Err(DomainError::InvalidPhoneNumber(raw.to_owned()));
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Lead record as delivered by the lead source, before validation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawLead {
    pub id: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub company: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadStatus {
    /// Waiting for its first or next attempt.
    Pending,
    /// Has exactly one non-terminal call attempt.
    Active,
    /// Retry ceiling reached or a non-retryable telephony rejection.
    Exhausted,
    /// A final conversation outcome was recorded.
    Archived,
}

impl LeadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Exhausted => "exhausted",
            Self::Archived => "archived",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "active" => Some(Self::Active),
            "exhausted" => Some(Self::Exhausted),
            "archived" => Some(Self::Archived),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lead {
    pub id: LeadId,
    pub name: String,
    pub phone: PhoneNumber,
    pub email: Option<String>,
    pub company: Option<String>,
    pub created_at: DateTime<Utc>,
    pub ingested_at: DateTime<Utc>,
    pub status: LeadStatus,
    pub attempt_count: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_eligible_at: Option<DateTime<Utc>>,
}

impl Lead {
    pub fn from_raw(raw: RawLead, ingested_at: DateTime<Utc>) -> Result<Self, DomainError> {
        let id = raw.id.trim();
        if id.is_empty() {
            return Err(DomainError::InvariantViolation("lead id must not be empty".to_owned()));
        }
        let phone = match raw.phone.as_deref() {
            Some(value) if !value.trim().is_empty() => PhoneNumber::parse(value)?,
            _ => return Err(DomainError::MissingPhoneNumber(LeadId(id.to_owned()))),
        };

        let name = [raw.first_name.as_deref(), raw.last_name.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(" ");

        Ok(Self {
            id: LeadId(id.to_owned()),
            name,
            phone,
            email: raw.email.filter(|value| !value.trim().is_empty()),
            company: raw.company.filter(|value| !value.trim().is_empty()),
            created_at: raw.created_at,
            ingested_at,
            status: LeadStatus::Pending,
            attempt_count: 0,
            last_attempt_at: None,
            next_eligible_at: None,
        })
    }

    /// First name used when greeting the lead.
    pub fn display_first_name(&self) -> &str {
        self.name.split_whitespace().next().unwrap_or("there")
    }
}
