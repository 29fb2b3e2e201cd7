use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::ticket_store::{StoreError, TicketStore};

/// Upper bound on `expire_tickets` calls per sweep, so one sweep cannot
/// monopolise the store while a backlog drains.
const MAX_BATCHES_PER_SWEEP: usize = 16;

/// Handle to stop a spawned sweeper.
#[derive(Debug)]
pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    /// Request shutdown and wait for the current sweep to finish.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                warn!(error = %e, "expiry sweeper task ended abnormally");
            }
        }
    }
}

/// Periodically reclaims terminal tickets whose retention deadline passed.
#[derive(Debug, Clone)]
pub struct ExpirySweeper<S> {
    store: S,
    batch: usize,
    interval: Duration,
}

impl<S> ExpirySweeper<S>
where
    S: TicketStore + 'static,
{
    pub fn new(store: S, batch: usize, interval: Duration) -> Self {
        Self {
            store,
            batch,
            interval,
        }
    }

    /// One sweep: call `expire_tickets` until a short batch comes back.
    ///
    /// Returns the number of tickets removed.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        if self.batch == 0 {
            return Ok(0);
        }

        let mut total = 0;
        for _ in 0..MAX_BATCHES_PER_SWEEP {
            let removed = self.store.expire_tickets(self.batch, now).await?;
            total += removed;
            if removed < self.batch as u64 {
                break;
            }
        }

        if total > 0 {
            debug!(removed = total, "expired tickets");
        }
        Ok(total)
    }

    /// Run [`run_once`](Self::run_once) every `interval` on a tokio task.
    pub fn spawn(self) -> SweeperHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let join = tokio::spawn(async move {
            info!(
                batch = self.batch,
                interval_secs = self.interval.as_secs_f64(),
                "expiry sweeper started"
            );
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_once(Utc::now()).await {
                            warn!(error = %e, "expiry sweep failed");
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("expiry sweeper stopped");
        });

        SweeperHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use lymbo_core::{CloseOptions, Ticket, TicketId};

    use crate::ticket_store::InMemoryTicketStore;

    use super::*;

    async fn closed_tickets(store: &InMemoryTicketStore, n: usize, retention: Duration) {
        for _ in 0..n {
            let t = Ticket::new(TicketId::new(), "test", serde_json::json!({}));
            let id = t.id;
            store.add(t).await.unwrap();
            store
                .ack(id, CloseOptions::new().keep().expire_in(retention))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn run_once_drains_in_batches() {
        let store = Arc::new(InMemoryTicketStore::new());
        closed_tickets(&store, 25, Duration::from_secs(1)).await;
        store
            .add(Ticket::new(TicketId::new(), "pending", serde_json::json!({})))
            .await
            .unwrap();

        let sweeper = ExpirySweeper::new(store.clone(), 10, Duration::from_secs(60));
        let removed = sweeper
            .run_once(Utc::now() + chrono::Duration::seconds(5))
            .await
            .unwrap();

        assert_eq!(removed, 25);
        assert_eq!(store.len().unwrap(), 1);
    }

    #[tokio::test]
    async fn run_once_leaves_unexpired_tickets() {
        let store = Arc::new(InMemoryTicketStore::new());
        closed_tickets(&store, 3, Duration::from_secs(3600)).await;

        let sweeper = ExpirySweeper::new(store.clone(), 10, Duration::from_secs(60));

        assert_eq!(sweeper.run_once(Utc::now()).await.unwrap(), 0);
        assert_eq!(store.len().unwrap(), 3);
    }

    #[tokio::test]
    async fn spawned_sweeper_runs_and_shuts_down() {
        let store = Arc::new(InMemoryTicketStore::new());
        closed_tickets(&store, 4, Duration::from_millis(1)).await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        let handle = ExpirySweeper::new(store.clone(), 100, Duration::from_millis(10)).spawn();

        // The first tick fires immediately.
        for _ in 0..100 {
            if store.is_empty().unwrap() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.shutdown().await;

        assert!(store.is_empty().unwrap());
    }
}
