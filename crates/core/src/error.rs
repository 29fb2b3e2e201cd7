//! Domain error model.

use thiserror::Error;

use crate::id::TicketId;
use crate::ticket::TicketStatus;

/// Result type used across the ticket domain.
pub type TicketResult<T> = Result<T, TicketError>;

/// Domain-level ticket error.
///
/// Deterministic failures only (malformed identifiers, illegal state
/// transitions). Storage failures belong to the store layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TicketError {
    /// The identifier was empty (empty string or the nil UUID).
    #[error("ticket id is empty")]
    EmptyId,

    /// The identifier is not a well-formed UUID.
    #[error("invalid ticket id: {0}")]
    InvalidId(String),

    /// A status string did not name a known status.
    #[error("invalid ticket status: {0}")]
    InvalidStatus(String),

    /// A terminal transition was attempted on a ticket that is not pending.
    #[error("ticket {id} is not pending (status: {status})")]
    InvalidStatusTransition { id: TicketId, status: TicketStatus },
}

impl TicketError {
    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn invalid_transition(id: TicketId, status: TicketStatus) -> Self {
        Self::InvalidStatusTransition { id, status }
    }
}
