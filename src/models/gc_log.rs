//! One garbage-collection run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Append-only record of a GC run. The entry with the greatest `id` is the
/// most recent run, whatever its timestamp says.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct GcLogEntry {
    pub id: i64,
    pub collection_time: DateTime<Utc>,
    /// Items reclaimed in that run; may be 0.
    pub garbage_count: i64,
}
