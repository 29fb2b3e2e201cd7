//! `lymbo-core`: ticket queue domain primitives.
//!
//! This crate contains **pure domain** types (no storage or runtime concerns):
//! the ticket entity and its state machine, the options a terminal transition
//! accepts, and the backoff policy that shapes poll leases.

pub mod backoff;
pub mod error;
pub mod id;
pub mod options;
pub mod ticket;

pub use backoff::BackoffPolicy;
pub use error::{TicketError, TicketResult};
pub use id::TicketId;
pub use options::CloseOptions;
pub use ticket::{RETAIN_FOREVER_SECS, Retention, Ticket, TicketStatus, add_saturating, retain_forever};
