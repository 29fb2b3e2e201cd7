//! Options accepted by terminal transitions (ack / cancel / fail).

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Configuration of a terminal transition.
///
/// Defaults: `expire_in = 0`, `keep = false`, `error_reason = None`, meaning
/// the ticket is removed as soon as it leaves `Pending`.
///
/// | keep  | expire_in | outcome                                           |
/// |-------|-----------|---------------------------------------------------|
/// | false | any       | ticket deleted by the transition itself           |
/// | true  | 0         | retained until deleted explicitly                 |
/// | true  | d > 0     | visible until `now + d`, then eligible for expiry |
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CloseOptions {
    pub expire_in: Duration,
    pub keep: bool,
    pub error_reason: Option<JsonValue>,
}

impl CloseOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Retain the ticket after the transition instead of deleting it.
    pub fn keep(mut self) -> Self {
        self.keep = true;
        self
    }

    /// Finite retention window, counted from the transition time.
    pub fn expire_in(mut self, ttl: Duration) -> Self {
        self.expire_in = ttl;
        self
    }

    /// Attach an opaque failure detail to the ticket.
    pub fn error_reason(mut self, reason: impl Into<JsonValue>) -> Self {
        self.error_reason = Some(reason.into());
        self
    }
}
