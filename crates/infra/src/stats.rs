//! Queue counters.
//!
//! A [`Stats`] is shared (usually behind an `Arc`) between an
//! [`InstrumentedTicketStore`](crate::ticket_store::InstrumentedTicketStore)
//! and whatever reads the numbers. Counters are monotonically increasing until
//! [`Stats::reset`].

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Debug, Default)]
pub struct Stats {
    added: AtomicU64,
    polled: AtomicU64,
    scheduled: AtomicU64,
    acked: AtomicU64,
    failed: AtomicU64,
    done: AtomicU64,
    retried: AtomicU64,
    canceled: AtomicU64,
    deleted: AtomicU64,
    expired: AtomicU64,
    processed: AtomicU64,
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub added: u64,
    pub polled: u64,
    pub scheduled: u64,
    pub acked: u64,
    pub failed: u64,
    pub done: u64,
    pub retried: u64,
    pub canceled: u64,
    pub deleted: u64,
    pub expired: u64,
    pub processed: u64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_added(&self) {
        self.added.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_deleted(&self) {
        self.deleted.fetch_add(1, Ordering::Relaxed);
    }

    /// One successful poll that handed out `scheduled` tickets, `retried` of
    /// which had been leased before.
    pub(crate) fn record_poll(&self, scheduled: u64, retried: u64) {
        self.polled.fetch_add(1, Ordering::Relaxed);
        self.scheduled.fetch_add(scheduled, Ordering::Relaxed);
        self.retried.fetch_add(retried, Ordering::Relaxed);
    }

    pub(crate) fn record_acked(&self) {
        self.acked.fetch_add(1, Ordering::Relaxed);
        self.done.fetch_add(1, Ordering::Relaxed);
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.done.fetch_add(1, Ordering::Relaxed);
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_canceled(&self) {
        self.canceled.fetch_add(1, Ordering::Relaxed);
        self.done.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_expired(&self, removed: u64) {
        self.expired.fetch_add(removed, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            added: self.added.load(Ordering::Relaxed),
            polled: self.polled.load(Ordering::Relaxed),
            scheduled: self.scheduled.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            done: self.done.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            canceled: self.canceled.load(Ordering::Relaxed),
            deleted: self.deleted.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.added,
            &self.polled,
            &self.scheduled,
            &self.acked,
            &self.failed,
            &self.done,
            &self.retried,
            &self.canceled,
            &self.deleted,
            &self.expired,
            &self.processed,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
