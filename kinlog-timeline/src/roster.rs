//! Child profiles and discovery candidate order.

use kinlog_crypto::CredentialRecord;
use serde::{Deserialize, Serialize};

use crate::identity::{ChildId, TimelineId};

/// A child account: display data plus the child's password wrapped under
/// the parent's password.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildProfile {
    pub id: ChildId,
    pub display_name: String,
    /// Unix milliseconds.
    pub created_at: i64,
    pub credential: CredentialRecord,
}

/// Candidate timelines in discovery priority: General, then children by
/// creation time with ties broken by id.
pub fn discovery_order(children: &[ChildProfile]) -> Vec<TimelineId> {
    let mut ordered: Vec<&ChildProfile> = children.iter().collect();
    ordered.sort_by_key(|c| (c.created_at, c.id));

    std::iter::once(TimelineId::General)
        .chain(ordered.into_iter().map(|c| TimelineId::Child(c.id)))
        .collect()
}
