//! Ticket entity and its state machine.
//!
//! ```text
//!            add (upsert)
//!                 │
//!                 ▼
//!   ┌──────── Pending ◄──┐ poll_pending: attempts += 1,
//!   │        │      │    │ runat = now + lease
//!   │ ack    │cancel│fail└─┘
//!   ▼        ▼      ▼
//!  Done  Cancelled  Failed   (runat becomes the retention deadline)
//! ```
//!
//! The two routines that mutate a ticket, [`Ticket::lease`] and
//! [`Ticket::close`], are the single definition of lease and terminal
//! semantics. Every store implementation either calls them or mirrors them.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::backoff::BackoffPolicy;
use crate::error::{TicketError, TicketResult};
use crate::id::TicketId;
use crate::options::CloseOptions;

/// 9999-12-31T23:59:59Z as a Unix timestamp.
pub const RETAIN_FOREVER_SECS: i64 = 253_402_300_799;

/// Sentinel `runat` for terminal tickets that never auto-expire.
///
/// This is the largest instant both `chrono` and Postgres `timestamptz` can
/// hold as an ordinary value, so every store agrees on it.
pub fn retain_forever() -> DateTime<Utc> {
    DateTime::from_timestamp(RETAIN_FOREVER_SECS, 0).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `at + d`, clamped to [`retain_forever`].
pub fn add_saturating(at: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    let forever = retain_forever();
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .map_or(forever, |t| t.min(forever))
}

/// Ticket lifecycle status.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    /// Waiting for a worker (possibly leased out, see `runat`).
    Pending,
    /// Acknowledged by a worker.
    Done,
    /// Cancelled before completion.
    Cancelled,
    /// Failed permanently.
    Failed,
}

impl TicketStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TicketStatus::Pending => "pending",
            TicketStatus::Done => "done",
            TicketStatus::Cancelled => "cancelled",
            TicketStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, TicketStatus::Pending)
    }
}

impl core::fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for TicketStatus {
    type Err = TicketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TicketStatus::Pending),
            "done" => Ok(TicketStatus::Done),
            "cancelled" => Ok(TicketStatus::Cancelled),
            "failed" => Ok(TicketStatus::Failed),
            other => Err(TicketError::InvalidStatus(other.to_string())),
        }
    }
}

/// What a store must do with a ticket after [`Ticket::close`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Retention {
    /// Write the closed ticket back.
    Keep,
    /// Delete the ticket instead of writing it back.
    Remove,
}

/// A unit of schedulable work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    pub id: TicketId,
    pub status: TicketStatus,
    /// While pending: earliest time the ticket may be polled (lease expiry
    /// after a poll). Once terminal: retention deadline.
    pub runat: DateTime<Utc>,
    /// Lower values are polled first among equally-due tickets.
    pub nice: i32,
    /// Opaque classification tag.
    #[serde(rename = "type")]
    pub kind: String,
    pub ctime: DateTime<Utc>,
    pub mtime: Option<DateTime<Utc>>,
    /// Number of leases granted so far.
    pub attempts: u32,
    pub payload: JsonValue,
    pub error_reason: Option<JsonValue>,
}

impl Ticket {
    /// A pending ticket that is ready immediately.
    pub fn new(id: TicketId, kind: impl Into<String>, payload: JsonValue) -> Self {
        let now = Utc::now();
        Self {
            id,
            status: TicketStatus::Pending,
            runat: now,
            nice: 0,
            kind: kind.into(),
            ctime: now,
            mtime: None,
            attempts: 0,
            payload,
            error_reason: None,
        }
    }

    /// Set the priority (lower is served first).
    pub fn with_nice(mut self, nice: i32) -> Self {
        self.nice = nice;
        self
    }

    /// Defer the first eligibility of the ticket.
    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.runat = at;
        self
    }

    /// Defer the first eligibility by a delay from its creation time.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.runat = add_saturating(self.ctime, delay);
        self
    }

    pub fn is_pending(&self) -> bool {
        self.status == TicketStatus::Pending
    }

    /// Pending and due at `now`.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.is_pending() && self.runat <= now
    }

    /// Fail with `InvalidStatusTransition` unless the ticket is pending.
    pub fn ensure_pending(&self) -> TicketResult<()> {
        if self.is_pending() {
            Ok(())
        } else {
            Err(TicketError::invalid_transition(self.id, self.status))
        }
    }

    /// Grant a lease: one more attempt, hidden from pollers until the lease lapses.
    pub fn lease(&mut self, now: DateTime<Utc>, ttr: Duration, backoff: &BackoffPolicy) {
        self.attempts = self.attempts.saturating_add(1);
        self.runat = add_saturating(now, backoff.lease_for_attempt(self.attempts, ttr));
        self.mtime = Some(now);
    }

    /// Apply a terminal transition.
    ///
    /// The ticket must be pending; on error it is left untouched.
    pub fn close(
        &mut self,
        status: TicketStatus,
        opts: &CloseOptions,
        now: DateTime<Utc>,
    ) -> TicketResult<Retention> {
        self.ensure_pending()?;

        self.status = status;
        self.mtime = Some(now);

        if let Some(reason) = &opts.error_reason {
            self.error_reason = Some(reason.clone());
        }

        self.runat = if opts.expire_in > Duration::ZERO {
            add_saturating(now, opts.expire_in)
        } else {
            retain_forever()
        };

        Ok(if opts.keep {
            Retention::Keep
        } else {
            Retention::Remove
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn pending() -> Ticket {
        Ticket::new(TicketId::new(), "email", serde_json::json!({"to": "a@b.c"}))
    }

    #[test]
    fn new_ticket_is_pending_and_ready() {
        let ticket = pending();
        assert!(ticket.is_pending());
        assert_eq!(ticket.attempts, 0);
        assert!(ticket.mtime.is_none());
        assert!(ticket.is_ready(ticket.ctime));
    }

    #[test]
    fn delayed_ticket_is_not_ready_before_its_runat() {
        let ticket = pending().delayed(Duration::from_secs(60));
        assert!(!ticket.is_ready(ticket.ctime));
        assert!(ticket.is_ready(ticket.ctime + chrono::Duration::seconds(60)));
    }

    #[test]
    fn lease_increments_attempts_and_extends_runat() {
        let mut ticket = pending();
        let policy = BackoffPolicy::default();

        ticket.lease(t0(), Duration::from_secs(5), &policy);

        assert_eq!(ticket.attempts, 1);
        assert_eq!(ticket.runat, t0() + chrono::Duration::milliseconds(6500));
        assert_eq!(ticket.mtime, Some(t0()));
        assert!(ticket.is_pending());
    }

    #[test]
    fn close_without_keep_requests_removal() {
        let mut ticket = pending();
        let retention = ticket
            .close(TicketStatus::Done, &CloseOptions::new(), t0())
            .unwrap();

        assert_eq!(retention, Retention::Remove);
        assert_eq!(ticket.status, TicketStatus::Done);
        assert_eq!(ticket.runat, retain_forever());
    }

    #[test]
    fn close_with_keep_and_expiry_sets_deadline() {
        let mut ticket = pending();
        let opts = CloseOptions::new()
            .keep()
            .expire_in(Duration::from_secs(3600))
            .error_reason(serde_json::json!({"code": 42}));

        let retention = ticket.close(TicketStatus::Failed, &opts, t0()).unwrap();

        assert_eq!(retention, Retention::Keep);
        assert_eq!(ticket.status, TicketStatus::Failed);
        assert_eq!(ticket.runat, t0() + chrono::Duration::hours(1));
        assert_eq!(ticket.mtime, Some(t0()));
        assert_eq!(ticket.error_reason, Some(serde_json::json!({"code": 42})));
    }

    #[test]
    fn close_keeps_previous_error_reason_when_none_given() {
        let mut ticket = pending();
        ticket.error_reason = Some(serde_json::json!("earlier"));

        ticket
            .close(TicketStatus::Cancelled, &CloseOptions::new().keep(), t0())
            .unwrap();

        assert_eq!(ticket.error_reason, Some(serde_json::json!("earlier")));
    }

    #[test]
    fn close_on_terminal_ticket_is_rejected_and_leaves_it_untouched() {
        let mut ticket = pending();
        ticket
            .close(TicketStatus::Done, &CloseOptions::new().keep(), t0())
            .unwrap();
        let before = ticket.clone();

        let err = ticket
            .close(TicketStatus::Failed, &CloseOptions::new().keep(), t0())
            .unwrap_err();

        assert_eq!(
            err,
            TicketError::InvalidStatusTransition {
                id: ticket.id,
                status: TicketStatus::Done
            }
        );
        assert_eq!(ticket, before);
    }

    #[test]
    fn unknown_status_string_is_rejected() {
        assert_eq!(
            "archived".parse::<TicketStatus>(),
            Err(TicketError::InvalidStatus("archived".to_string()))
        );
        assert!(TicketStatus::Cancelled.is_terminal());
        assert!(!TicketStatus::Pending.is_terminal());
    }

    #[test]
    fn saturating_add_clamps_to_sentinel() {
        assert_eq!(
            add_saturating(t0(), Duration::from_secs(u64::MAX)),
            retain_forever()
        );
        assert_eq!(
            retain_forever().to_rfc3339(),
            "9999-12-31T23:59:59+00:00"
        );
    }

    #[test]
    fn kind_serializes_as_type() {
        let json = serde_json::to_value(pending()).unwrap();
        assert_eq!(json["type"], "email");
        assert_eq!(json["status"], "pending");
    }
}
