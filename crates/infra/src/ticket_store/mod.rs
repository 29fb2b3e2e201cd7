//! Durable ticket store boundary.
//!
//! [`TicketStore`] is the contract; [`InMemoryTicketStore`] and
//! [`PostgresTicketStore`] implement it with identical semantics.
//! [`InstrumentedTicketStore`] wraps either one and feeds [`Stats`].

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use lymbo_core::{CloseOptions, Ticket, TicketId, TicketStatus};

use crate::stats::Stats;

pub use in_memory::InMemoryTicketStore;
pub use postgres::PostgresTicketStore;
pub use r#trait::{PollRequest, PollResult, StoreError, TicketStore, UpdateFn};

/// Adapter that updates [`Stats`] after each successful call on the inner store.
///
/// Counters are touched **only after** the wrapped operation succeeds, so a
/// rejected transition or a storage error never shows up in the numbers.
pub struct InstrumentedTicketStore<S> {
    store: S,
    stats: Arc<Stats>,
}

impl<S> InstrumentedTicketStore<S> {
    pub fn new(store: S, stats: Arc<Stats>) -> Self {
        Self { store, stats }
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    pub fn into_parts(self) -> (S, Arc<Stats>) {
        (self.store, self.stats)
    }
}

#[async_trait]
impl<S> TicketStore for InstrumentedTicketStore<S>
where
    S: TicketStore,
{
    async fn get(&self, id: TicketId) -> Result<Ticket, StoreError> {
        self.store.get(id).await
    }

    async fn add(&self, ticket: Ticket) -> Result<(), StoreError> {
        self.store.add(ticket).await?;
        self.stats.record_added();
        Ok(())
    }

    async fn delete(&self, id: TicketId) -> Result<(), StoreError> {
        self.store.delete(id).await?;
        self.stats.record_deleted();
        Ok(())
    }

    async fn close(
        &self,
        id: TicketId,
        status: TicketStatus,
        opts: CloseOptions,
    ) -> Result<(), StoreError> {
        self.store.close(id, status, opts).await?;
        match status {
            TicketStatus::Done => self.stats.record_acked(),
            TicketStatus::Failed => self.stats.record_failed(),
            TicketStatus::Cancelled => self.stats.record_canceled(),
            TicketStatus::Pending => {}
        }
        Ok(())
    }

    async fn poll_pending(&self, req: PollRequest) -> Result<PollResult, StoreError> {
        let result = self.store.poll_pending(req).await?;
        let retried = result.tickets.iter().filter(|t| t.attempts > 1).count();
        self.stats
            .record_poll(result.tickets.len() as u64, retried as u64);
        Ok(result)
    }

    async fn expire_tickets(&self, limit: usize, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let removed = self.store.expire_tickets(limit, now).await?;
        self.stats.record_expired(removed);
        Ok(removed)
    }

    async fn update(&self, id: TicketId, f: UpdateFn) -> Result<Ticket, StoreError> {
        self.store.update(id, f).await
    }
}
