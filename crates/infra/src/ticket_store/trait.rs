use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use lymbo_core::{BackoffPolicy, CloseOptions, Ticket, TicketError, TicketId, TicketStatus};

/// Parameters of a single `poll_pending` call.
///
/// `now` is supplied by the caller so that a poll is deterministic with respect
/// to time; `ttr` ("time to run") is the base visibility window added to every
/// lease on top of the backoff component.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PollRequest {
    pub limit: usize,
    pub now: DateTime<Utc>,
    pub ttr: Duration,
    pub backoff: BackoffPolicy,
}

impl PollRequest {
    pub fn new(limit: usize, now: DateTime<Utc>, ttr: Duration) -> Self {
        Self {
            limit,
            now,
            ttr,
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Reject requests that can never yield a result.
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.limit == 0 {
            return Err(StoreError::InvalidArgument(
                "poll limit must be positive".to_string(),
            ));
        }
        if !self.backoff.is_valid() {
            return Err(StoreError::InvalidArgument(format!(
                "backoff base must be finite and >= 1.0, got {}",
                self.backoff.base
            )));
        }
        Ok(())
    }
}

/// Outcome of a poll.
///
/// Either `tickets` is non-empty and `sleep_until` is `None`, or `tickets` is
/// empty and `sleep_until` holds the earliest `runat` of the pending set
/// (`None` when nothing is pending at all).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PollResult {
    pub tickets: Vec<Ticket>,
    pub sleep_until: Option<DateTime<Utc>>,
}

impl PollResult {
    pub fn leased(tickets: Vec<Ticket>) -> Self {
        Self {
            tickets,
            sleep_until: None,
        }
    }

    pub fn sleep_until(at: Option<DateTime<Utc>>) -> Self {
        Self {
            tickets: Vec::new(),
            sleep_until: at,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tickets.is_empty()
    }
}

/// Caller-supplied mutation for [`TicketStore::update`].
pub type UpdateFn = Box<dyn FnOnce(&mut Ticket) -> Result<(), StoreError> + Send>;

/// Ticket store operation error.
///
/// ## Error Categories
///
/// - **Ticket**: domain validation (empty/invalid id, illegal transition)
/// - **NotFound**: the addressed ticket does not exist
/// - **InvalidArgument**: a request parameter can never be satisfied
/// - **Storage**: backend failure (I/O, transaction, connectivity, poisoned lock)
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Ticket(#[from] TicketError),

    #[error("ticket not found: {0}")]
    NotFound(TicketId),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    pub fn is_invalid_transition(&self) -> bool {
        matches!(
            self,
            StoreError::Ticket(TicketError::InvalidStatusTransition { .. })
        )
    }
}

/// Durable ticket store.
///
/// The contract every backing technology implements identically; scheduling
/// semantics live in `lymbo_core::Ticket::{lease, close}` and in
/// `poll_pending`, never in callers.
///
/// ## Semantics
///
/// - `add` is an upsert keyed by id and always stores the ticket as `Pending`
/// - `delete` of an absent id succeeds
/// - `ack` / `cancel` / `fail` require a pending ticket and leave it untouched
///   on any error
/// - `poll_pending` selects ready tickets ordered by `(runat, nice, id)` and
///   leases them; concurrent polls never return the same ticket while its
///   lease is outstanding
/// - `expire_tickets` removes up to `limit` terminal tickets whose `runat` is
///   at or before `now`, returning how many were removed
#[async_trait]
pub trait TicketStore: Send + Sync {
    /// Load a ticket by id.
    async fn get(&self, id: TicketId) -> Result<Ticket, StoreError>;

    /// Enqueue (or overwrite) a ticket; status is forced to `Pending`.
    async fn add(&self, ticket: Ticket) -> Result<(), StoreError>;

    /// Remove a ticket unconditionally.
    async fn delete(&self, id: TicketId) -> Result<(), StoreError>;

    /// Move a pending ticket to a terminal status.
    async fn close(
        &self,
        id: TicketId,
        status: TicketStatus,
        opts: CloseOptions,
    ) -> Result<(), StoreError>;

    /// Lease up to `limit` ready tickets, or report when to poll again.
    async fn poll_pending(&self, req: PollRequest) -> Result<PollResult, StoreError>;

    /// Reclaim terminal tickets past their retention deadline.
    async fn expire_tickets(&self, limit: usize, now: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Read-modify-write a single ticket atomically; returns the stored ticket.
    ///
    /// The mutation must not change the ticket id.
    async fn update(&self, id: TicketId, f: UpdateFn) -> Result<Ticket, StoreError>;

    async fn ack(&self, id: TicketId, opts: CloseOptions) -> Result<(), StoreError> {
        self.close(id, TicketStatus::Done, opts).await
    }

    async fn cancel(&self, id: TicketId, opts: CloseOptions) -> Result<(), StoreError> {
        self.close(id, TicketStatus::Cancelled, opts).await
    }

    async fn fail(&self, id: TicketId, opts: CloseOptions) -> Result<(), StoreError> {
        self.close(id, TicketStatus::Failed, opts).await
    }
}

/// Validation shared by every `close` implementation.
pub(crate) fn ensure_terminal_target(status: TicketStatus) -> Result<(), StoreError> {
    if status.is_terminal() {
        Ok(())
    } else {
        Err(StoreError::InvalidArgument(format!(
            "close target must be a terminal status, got {status}"
        )))
    }
}

/// Reject the nil id, which stands for "no id" everywhere a ticket is addressed.
pub(crate) fn ensure_id(id: TicketId) -> Result<(), StoreError> {
    if id.is_nil() {
        return Err(TicketError::EmptyId.into());
    }
    Ok(())
}

/// Validation shared by every `add` implementation.
pub(crate) fn ensure_addable(ticket: &Ticket) -> Result<(), StoreError> {
    ensure_id(ticket.id)
}

#[async_trait]
impl<S> TicketStore for Arc<S>
where
    S: TicketStore + ?Sized,
{
    async fn get(&self, id: TicketId) -> Result<Ticket, StoreError> {
        (**self).get(id).await
    }

    async fn add(&self, ticket: Ticket) -> Result<(), StoreError> {
        (**self).add(ticket).await
    }

    async fn delete(&self, id: TicketId) -> Result<(), StoreError> {
        (**self).delete(id).await
    }

    async fn close(
        &self,
        id: TicketId,
        status: TicketStatus,
        opts: CloseOptions,
    ) -> Result<(), StoreError> {
        (**self).close(id, status, opts).await
    }

    async fn poll_pending(&self, req: PollRequest) -> Result<PollResult, StoreError> {
        (**self).poll_pending(req).await
    }

    async fn expire_tickets(&self, limit: usize, now: DateTime<Utc>) -> Result<u64, StoreError> {
        (**self).expire_tickets(limit, now).await
    }

    async fn update(&self, id: TicketId, f: UpdateFn) -> Result<Ticket, StoreError> {
        (**self).update(id, f).await
    }

    async fn ack(&self, id: TicketId, opts: CloseOptions) -> Result<(), StoreError> {
        (**self).ack(id, opts).await
    }

    async fn cancel(&self, id: TicketId, opts: CloseOptions) -> Result<(), StoreError> {
        (**self).cancel(id, opts).await
    }

    async fn fail(&self, id: TicketId, opts: CloseOptions) -> Result<(), StoreError> {
        (**self).fail(id, opts).await
    }
}
