use chrono::{DateTime, Duration, FixedOffset, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

/// Daily dialing window in a fixed local offset.
///
/// `start > end` describes a window that wraps midnight (e.g. 22:00-02:00).
/// `start == end` is an always-open window.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusinessHours {
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub utc_offset_minutes: i32,
}

impl BusinessHours {
    pub fn always_open() -> Self {
        Self { start: NaiveTime::MIN, end: NaiveTime::MIN, utc_offset_minutes: 0 }
    }

    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        if self.start == self.end {
            return true;
        }
        let local = self.local_time(now);
        if self.start < self.end {
            local >= self.start && local < self.end
        } else {
            local >= self.start || local < self.end
        }
    }

    fn local_time(&self, now: DateTime<Utc>) -> NaiveTime {
        match FixedOffset::east_opt(self.utc_offset_minutes * 60) {
            Some(offset) => now.with_timezone(&offset).time(),
            None => (now + Duration::minutes(i64::from(self.utc_offset_minutes))).time(),
        }
    }
}

/// Parses `HH:MM` the way the configuration file spells it.
pub fn parse_clock(value: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M").ok()
}
