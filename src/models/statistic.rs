//! Per-day upload/download counters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Counters for one UTC calendar day. Created by the first event of the day
/// and only ever incremented afterwards.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct DailyStatistic {
    /// `YYYY-MM-DD`
    pub date: String,
    pub upload_count: u64,
    pub download_count: u64,
    pub upload_size_byte: u64,
    pub download_size_byte: u64,
}

impl DailyStatistic {
    /// A zeroed row for `date`, used when a day has seen no events.
    pub fn empty(date: impl Into<String>) -> Self {
        Self {
            date: date.into(),
            ..Self::default()
        }
    }
}

/// The statistics key for the day containing `now`.
pub fn day_key(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%d").to_string()
}
