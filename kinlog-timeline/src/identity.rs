//! Timeline identities.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Identifier of a child account.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChildId(pub i64);

impl fmt::Display for ChildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which timeline an entry or password belongs to.
///
/// Canonical string form is `general` or `child:<id>`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimelineId {
    General,
    Child(ChildId),
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid timeline id: {0:?}")]
pub struct TimelineIdParseError(pub String);

impl TimelineId {
    pub fn child(id: i64) -> Self {
        Self::Child(ChildId(id))
    }

    pub fn is_general(&self) -> bool {
        matches!(self, Self::General)
    }

    /// Interprets a recipient key id from a legacy multi-recipient entry.
    ///
    /// Older writers keyed the parent as `parent` and children by their bare
    /// numeric id, so those spellings are accepted alongside the canonical
    /// ones.
    pub fn from_recipient_key(key: &str) -> Option<Self> {
        match key {
            "general" | "parent" => Some(Self::General),
            other => {
                let digits = other.strip_prefix("child:").unwrap_or(other);
                digits.parse::<i64>().ok().map(Self::child)
            }
        }
    }
}

impl fmt::Display for TimelineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::General => f.write_str("general"),
            Self::Child(id) => write!(f, "child:{id}"),
        }
    }
}

impl FromStr for TimelineId {
    type Err = TimelineIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "general" {
            return Ok(Self::General);
        }
        s.strip_prefix("child:")
            .and_then(|n| n.parse::<i64>().ok())
            .map(Self::child)
            .ok_or_else(|| TimelineIdParseError(s.to_string()))
    }
}

impl Serialize for TimelineId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TimelineId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_and_parse_agree() {
        for id in [TimelineId::General, TimelineId::child(7), TimelineId::child(-1)] {
            assert_eq!(id.to_string().parse::<TimelineId>().unwrap(), id);
        }
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!("parent".parse::<TimelineId>().is_err());
        assert!("child:".parse::<TimelineId>().is_err());
        assert!("child:x".parse::<TimelineId>().is_err());
        assert!("7".parse::<TimelineId>().is_err());
    }

    #[test]
    fn legacy_recipient_keys() {
        assert_eq!(TimelineId::from_recipient_key("parent"), Some(TimelineId::General));
        assert_eq!(TimelineId::from_recipient_key("general"), Some(TimelineId::General));
        assert_eq!(TimelineId::from_recipient_key("3"), Some(TimelineId::child(3)));
        assert_eq!(TimelineId::from_recipient_key("child:3"), Some(TimelineId::child(3)));
        assert_eq!(TimelineId::from_recipient_key("grandma"), None);
    }

    #[test]
    fn serializes_as_string() {
        let json = serde_json::to_string(&vec![TimelineId::General, TimelineId::child(2)]).unwrap();
        assert_eq!(json, r#"["general","child:2"]"#);
        let back: Vec<TimelineId> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, vec![TimelineId::General, TimelineId::child(2)]);
    }
}
