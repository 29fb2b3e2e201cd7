//! Strongly-typed ticket identifier.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TicketError;

/// Identifier of a ticket (primary key of every store).
///
/// Parsing is the validation boundary: an empty string yields
/// [`TicketError::EmptyId`] and anything that is not a UUID yields
/// [`TicketError::InvalidId`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TicketId(Uuid);

impl TicketId {
    /// Create a new random identifier.
    ///
    /// Uses UUIDv7 (time-ordered). Prefer passing IDs explicitly in tests
    /// for determinism.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// The nil UUID carries no identity and is treated like an empty id.
    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl Default for TicketId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for TicketId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl From<Uuid> for TicketId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl From<TicketId> for Uuid {
    fn from(value: TicketId) -> Self {
        value.0
    }
}

impl FromStr for TicketId {
    type Err = TicketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Err(TicketError::EmptyId);
        }
        let uuid =
            Uuid::from_str(s).map_err(|e| TicketError::invalid_id(format!("{s:?}: {e}")))?;
        Ok(Self(uuid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_uuid() {
        let raw = "0190f3a6-5c2e-7b7a-9d1e-3f6f3c0b8a11";
        let id: TicketId = raw.parse().unwrap();
        assert_eq!(id.to_string(), raw);
    }

    #[test]
    fn empty_string_is_empty_id() {
        assert_eq!("".parse::<TicketId>(), Err(TicketError::EmptyId));
        assert_eq!("   ".parse::<TicketId>(), Err(TicketError::EmptyId));
    }

    #[test]
    fn garbage_is_invalid_id() {
        let err = "not-a-uuid".parse::<TicketId>().unwrap_err();
        assert!(matches!(err, TicketError::InvalidId(_)));
    }

    #[test]
    fn nil_uuid_is_flagged() {
        assert!(TicketId::from_uuid(Uuid::nil()).is_nil());
        assert!(!TicketId::new().is_nil());
    }
}
