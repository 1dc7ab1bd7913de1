//! Stash identifiers

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Opaque identifier of one stashed item.
///
/// Drawn from 128 bits of OS entropy (RFC 4122 version 4) and rendered as a
/// lowercase hyphenated UUID, which is also the name of the item's
/// container directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StashId(Uuid);

impl StashId {
    /// Allocate a fresh identifier
    pub fn allocate() -> Result<Self> {
        let mut bytes = [0u8; 16];
        getrandom::getrandom(&mut bytes)?;
        Ok(Self(uuid::Builder::from_random_bytes(bytes).into_uuid()))
    }

    /// Parse an identifier from its textual form.
    ///
    /// Anything that is not a UUID yields `None`, so an id taken from a
    /// request path can never name anything but a direct child of the
    /// stash directory.
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s.trim()).ok().map(Self)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for StashId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for StashId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_allocate_produces_v4_ids() {
        let id = StashId::allocate().unwrap();
        assert_eq!(id.as_uuid().get_version_num(), 4);
        assert_eq!(id.as_uuid().get_variant(), uuid::Variant::RFC4122);
    }

    #[test]
    fn test_allocate_is_unique() {
        let ids: HashSet<StashId> = (0..1000).map(|_| StashId::allocate().unwrap()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn test_display_round_trips_through_parse() {
        let id = StashId::allocate().unwrap();
        let text = id.to_string();
        assert_eq!(text.len(), 36);
        assert_eq!(text, text.to_lowercase());
        assert_eq!(StashId::parse(&text), Some(id));
        assert_eq!(text.parse::<StashId>().unwrap(), id);
    }

    #[test]
    fn test_parse_rejects_paths() {
        assert_eq!(StashId::parse(""), None);
        assert_eq!(StashId::parse(".."), None);
        assert_eq!(StashId::parse("../etc/passwd"), None);
        assert_eq!(StashId::parse("deadbeef-1234"), None);
    }

    #[test]
    fn test_serializes_as_plain_string() {
        let id = StashId::parse("67e55044-10b1-426f-9247-bb680e5fe0c8").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"67e55044-10b1-426f-9247-bb680e5fe0c8\"");
    }
}
