use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use lymbo_core::{CloseOptions, Retention, Ticket, TicketId, TicketStatus};

use super::r#trait::{
    PollRequest, PollResult, StoreError, TicketStore, UpdateFn, ensure_addable, ensure_id,
    ensure_terminal_target,
};

/// In-memory ticket store.
///
/// One `RwLock` guards the whole map: `get` shares it, every mutation holds it
/// exclusively for its full duration, so each call is atomic with respect to
/// every other. Polls scan the full map. Correct for many tasks in one process;
/// it does not extend across processes.
#[derive(Debug, Default)]
pub struct InMemoryTicketStore {
    tickets: RwLock<HashMap<TicketId, Ticket>>,
}

impl InMemoryTicketStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored tickets, in any status.
    pub fn len(&self) -> Result<usize, StoreError> {
        Ok(self.read()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    fn write(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<TicketId, Ticket>>, StoreError> {
        self.tickets
            .write()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))
    }

    fn read(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, HashMap<TicketId, Ticket>>, StoreError> {
        self.tickets
            .read()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))
    }

    /// Lease selection; runs entirely under the write lock.
    fn poll_locked(tickets: &mut HashMap<TicketId, Ticket>, req: &PollRequest) -> PollResult {
        let mut closest: Option<DateTime<Utc>> = None;
        let mut ready: Vec<(DateTime<Utc>, i32, TicketId)> = Vec::new();

        for t in tickets.values().filter(|t| t.is_pending()) {
            if t.runat > req.now {
                closest = Some(closest.map_or(t.runat, |c| c.min(t.runat)));
                continue;
            }
            ready.push((t.runat, t.nice, t.id));
        }

        if ready.is_empty() {
            return PollResult::sleep_until(closest);
        }

        ready.sort_unstable();
        ready.truncate(req.limit);

        let mut leased = Vec::with_capacity(ready.len());
        for (_, _, id) in ready {
            if let Some(t) = tickets.get_mut(&id) {
                t.lease(req.now, req.ttr, &req.backoff);
                leased.push(t.clone());
            }
        }

        PollResult::leased(leased)
    }
}

#[async_trait]
impl TicketStore for InMemoryTicketStore {
    async fn get(&self, id: TicketId) -> Result<Ticket, StoreError> {
        ensure_id(id)?;
        self.read()?
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn add(&self, mut ticket: Ticket) -> Result<(), StoreError> {
        ensure_addable(&ticket)?;
        ticket.status = TicketStatus::Pending;

        self.write()?.insert(ticket.id, ticket);
        Ok(())
    }

    async fn delete(&self, id: TicketId) -> Result<(), StoreError> {
        ensure_id(id)?;
        self.write()?.remove(&id);
        Ok(())
    }

    async fn close(
        &self,
        id: TicketId,
        status: TicketStatus,
        opts: CloseOptions,
    ) -> Result<(), StoreError> {
        ensure_id(id)?;
        ensure_terminal_target(status)?;

        let mut tickets = self.write()?;
        let current = tickets.get(&id).ok_or(StoreError::NotFound(id))?;

        // Work on a copy so a rejected transition leaves the stored ticket as is.
        let mut ticket = current.clone();
        match ticket.close(status, &opts, Utc::now())? {
            Retention::Keep => {
                tickets.insert(id, ticket);
            }
            Retention::Remove => {
                tickets.remove(&id);
            }
        }
        Ok(())
    }

    async fn poll_pending(&self, req: PollRequest) -> Result<PollResult, StoreError> {
        req.validate()?;

        let mut tickets = self.write()?;
        Ok(Self::poll_locked(&mut tickets, &req))
    }

    async fn expire_tickets(&self, limit: usize, now: DateTime<Utc>) -> Result<u64, StoreError> {
        if limit == 0 {
            return Ok(0);
        }

        let mut tickets = self.write()?;
        let expired: Vec<TicketId> = tickets
            .values()
            .filter(|t| t.status.is_terminal() && t.runat <= now)
            .map(|t| t.id)
            .take(limit)
            .collect();

        for id in &expired {
            tickets.remove(id);
        }
        Ok(expired.len() as u64)
    }

    async fn update(&self, id: TicketId, f: UpdateFn) -> Result<Ticket, StoreError> {
        ensure_id(id)?;
        let mut tickets = self.write()?;
        let mut ticket = tickets.get(&id).cloned().ok_or(StoreError::NotFound(id))?;

        f(&mut ticket)?;
        if ticket.id != id {
            return Err(StoreError::InvalidArgument(format!(
                "update must not change the ticket id ({id} -> {})",
                ticket.id
            )));
        }

        tickets.insert(id, ticket.clone());
        Ok(ticket)
    }
}
