//! Stored entry records.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::identity::TimelineId;

/// An entry as persisted in the record store.
///
/// `sealed` holds the format-specific encrypted body exactly as it was
/// written. It is kept as loosely typed JSON because the store may contain
/// shapes from older writers; [`crate::dispatch::classify`] is the only place
/// that interprets it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntryRecord {
    pub id: String,
    /// Logical time of the note, unix milliseconds. May be backdated.
    pub timestamp: i64,
    pub targets: Vec<TimelineId>,
    pub sealed: serde_json::Value,
}

impl EntryRecord {
    /// Generates a new time-ordered entry id.
    pub fn new_id() -> String {
        Uuid::now_v7().to_string()
    }

    pub fn targets(&self, timeline: &TimelineId) -> bool {
        self.targets.contains(timeline)
    }
}

/// Current wall-clock time in unix milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
