//! Postgres-backed ticket store.
//!
//! Every store instance owns one table (name validated at construction, so
//! several queues or isolated test runs can share a database). The schema is
//! created idempotently by [`PostgresTicketStore::connect`].
//!
//! ## Concurrency
//!
//! - `poll_pending` is a single statement: ready rows are selected with
//!   `FOR UPDATE SKIP LOCKED` and leased in the same CTE, so two concurrent
//!   polls never return the same ticket.
//! - `close` and `update` run in a transaction holding the row lock
//!   (`SELECT ... FOR UPDATE`). Dropping the future drops the transaction,
//!   which rolls it back.
//! - `expire_tickets` deletes through a `SKIP LOCKED` subselect, so it never
//!   blocks on tickets that are being closed or updated.
//!
//! ## Error Mapping
//!
//! | SQLx Error | StoreError | Scenario |
//! |------------|------------|----------|
//! | Database | `Storage` | constraint violation, syntax, permission |
//! | PoolClosed | `Storage` | pool shut down |
//! | PoolTimedOut | `Storage` | `acquire_timeout` elapsed |
//! | Other | `Storage` | network errors, decoding |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::{debug, instrument, warn};

use lymbo_core::{CloseOptions, Retention, Ticket, TicketId, TicketStatus, retain_forever};

use super::r#trait::{
    PollRequest, PollResult, StoreError, TicketStore, UpdateFn, ensure_addable, ensure_id,
    ensure_terminal_target,
};

/// Default table name.
pub const DEFAULT_TABLE: &str = "tickets";

const ROW_TICKET: &str = "ticket";
const ROW_SLEEP_UNTIL: &str = "sleep_until";

/// Postgres-backed ticket store.
///
/// Cheap to clone; clones share the pool.
#[derive(Debug, Clone)]
pub struct PostgresTicketStore {
    pool: Arc<PgPool>,
    table: Arc<str>,
    queries: Arc<Queries>,
}

impl PostgresTicketStore {
    /// Validate `table`, create the schema if needed and return the store.
    pub async fn connect(pool: PgPool, table: impl Into<String>) -> Result<Self, StoreError> {
        let table = table.into();
        validate_table_name(&table)?;

        let store = Self {
            pool: Arc::new(pool),
            queries: Arc::new(Queries::new(&table)),
            table: table.into(),
        };
        store.migrate().await?;
        Ok(store)
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    #[instrument(skip(self), fields(table = %self.table), err)]
    async fn migrate(&self) -> Result<(), StoreError> {
        for statement in schema_statements(&self.table) {
            sqlx::query(&statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("migrate", e))?;
        }
        debug!("ticket schema ready");
        Ok(())
    }

    #[instrument(skip(self), fields(table = %self.table, ticket_id = %id), err)]
    pub async fn get(&self, id: TicketId) -> Result<Ticket, StoreError> {
        ensure_id(id)?;

        let row = sqlx::query(&self.queries.select)
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        match row {
            Some(row) => decode_ticket(&row),
            None => Err(StoreError::NotFound(id)),
        }
    }

    #[instrument(
        skip(self, ticket),
        fields(table = %self.table, ticket_id = %ticket.id, kind = %ticket.kind),
        err
    )]
    pub async fn add(&self, mut ticket: Ticket) -> Result<(), StoreError> {
        ensure_addable(&ticket)?;
        ticket.status = TicketStatus::Pending;

        bind_ticket(sqlx::query(&self.queries.upsert), &ticket)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("add", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(table = %self.table, ticket_id = %id), err)]
    pub async fn delete(&self, id: TicketId) -> Result<(), StoreError> {
        ensure_id(id)?;

        sqlx::query(&self.queries.delete)
            .bind(id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete", e))?;
        Ok(())
    }

    #[instrument(
        skip(self, opts),
        fields(table = %self.table, ticket_id = %id, status = %status, keep = opts.keep),
        err
    )]
    pub async fn close(
        &self,
        id: TicketId,
        status: TicketStatus,
        opts: CloseOptions,
    ) -> Result<(), StoreError> {
        ensure_id(id)?;
        ensure_terminal_target(status)?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let mut ticket = self.lock_ticket(&mut tx, id).await?;

        let retention = match ticket.close(status, &opts, Utc::now()) {
            Ok(retention) => retention,
            Err(e) => {
                tx.rollback()
                    .await
                    .map_err(|e| map_sqlx_error("rollback", e))?;
                return Err(e.into());
            }
        };

        match retention {
            Retention::Keep => {
                bind_ticket(sqlx::query(&self.queries.write_back), &ticket)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| map_sqlx_error("close_write_back", e))?;
            }
            Retention::Remove => {
                sqlx::query(&self.queries.delete)
                    .bind(id.as_uuid())
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| map_sqlx_error("close_remove", e))?;
            }
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(())
    }

    /// Lease up to `req.limit` ready tickets in one statement.
    #[instrument(
        skip(self, req),
        fields(
            table = %self.table,
            limit = req.limit,
            leased = tracing::field::Empty,
            sleep_until = tracing::field::Empty
        ),
        err
    )]
    pub async fn poll_pending(&self, req: PollRequest) -> Result<PollResult, StoreError> {
        req.validate()?;

        let limit = i64::try_from(req.limit).unwrap_or(i64::MAX);
        let ceiling = lease_secs_ceiling(req.now);
        let rows = sqlx::query(&self.queries.poll)
            .bind(req.now)
            .bind(limit)
            .bind(req.backoff.base)
            .bind(clamp_secs(req.backoff.max_delay, ceiling))
            .bind(clamp_secs(req.ttr, ceiling))
            .bind(retain_forever())
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("poll_pending", e))?;

        let result = collect_poll_rows(rows.iter().map(decode_poll_row));

        let span = tracing::Span::current();
        span.record("leased", result.tickets.len());
        if let Some(at) = result.sleep_until {
            span.record("sleep_until", tracing::field::display(at));
        }
        Ok(result)
    }

    #[instrument(skip(self), fields(table = %self.table, removed = tracing::field::Empty), err)]
    pub async fn expire_tickets(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        if limit == 0 {
            return Ok(0);
        }

        let result = sqlx::query(&self.queries.expire)
            .bind(now)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("expire_tickets", e))?;

        let removed = result.rows_affected();
        tracing::Span::current().record("removed", removed);
        Ok(removed)
    }

    #[instrument(skip(self, f), fields(table = %self.table, ticket_id = %id), err)]
    pub async fn update(&self, id: TicketId, f: UpdateFn) -> Result<Ticket, StoreError> {
        ensure_id(id)?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let mut ticket = self.lock_ticket(&mut tx, id).await?;

        let outcome = f(&mut ticket).and_then(|()| {
            if ticket.id == id {
                Ok(())
            } else {
                Err(StoreError::InvalidArgument(format!(
                    "update must not change the ticket id ({id} -> {})",
                    ticket.id
                )))
            }
        });
        if let Err(e) = outcome {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(e);
        }

        bind_ticket(sqlx::query(&self.queries.write_back), &ticket)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("update_write_back", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(ticket)
    }

    /// Load a ticket holding its row lock until `tx` ends.
    async fn lock_ticket(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: TicketId,
    ) -> Result<Ticket, StoreError> {
        let row = sqlx::query(&self.queries.select_for_update)
            .bind(id.as_uuid())
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("lock_ticket", e))?;

        match row {
            Some(row) => decode_ticket(&row),
            None => Err(StoreError::NotFound(id)),
        }
    }
}

#[async_trait]
impl TicketStore for PostgresTicketStore {
    async fn get(&self, id: TicketId) -> Result<Ticket, StoreError> {
        PostgresTicketStore::get(self, id).await
    }

    async fn add(&self, ticket: Ticket) -> Result<(), StoreError> {
        PostgresTicketStore::add(self, ticket).await
    }

    async fn delete(&self, id: TicketId) -> Result<(), StoreError> {
        PostgresTicketStore::delete(self, id).await
    }

    async fn close(
        &self,
        id: TicketId,
        status: TicketStatus,
        opts: CloseOptions,
    ) -> Result<(), StoreError> {
        PostgresTicketStore::close(self, id, status, opts).await
    }

    async fn poll_pending(&self, req: PollRequest) -> Result<PollResult, StoreError> {
        PostgresTicketStore::poll_pending(self, req).await
    }

    async fn expire_tickets(&self, limit: usize, now: DateTime<Utc>) -> Result<u64, StoreError> {
        PostgresTicketStore::expire_tickets(self, limit, now).await
    }

    async fn update(&self, id: TicketId, f: UpdateFn) -> Result<Ticket, StoreError> {
        PostgresTicketStore::update(self, id, f).await
    }
}

/// Accept `[a-z_][a-z0-9_]*`, at most 63 bytes (the Postgres identifier limit).
pub fn validate_table_name(name: &str) -> Result<(), StoreError> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');

    if valid_start && valid_rest && name.len() <= 63 {
        Ok(())
    } else {
        Err(StoreError::InvalidArgument(format!(
            "invalid table name: {name:?}"
        )))
    }
}

const COLUMNS: &str = "id, status, runat, nice, type, ctime, mtime, attempts, payload, error_reason";

fn schema_statements(table: &str) -> [String; 3] {
    [
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id UUID PRIMARY KEY,
                status TEXT NOT NULL
                    CHECK (status IN ('pending', 'done', 'cancelled', 'failed')),
                runat TIMESTAMPTZ NOT NULL,
                nice INTEGER NOT NULL DEFAULT 0,
                type TEXT NOT NULL,
                ctime TIMESTAMPTZ NOT NULL,
                mtime TIMESTAMPTZ NULL,
                attempts INTEGER NOT NULL DEFAULT 0 CHECK (attempts >= 0),
                payload JSONB NOT NULL,
                error_reason JSONB NULL
            )
            "#
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {table}_pending_idx ON {table} (runat, nice) WHERE status = 'pending'"
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {table}_expire_idx ON {table} (runat) WHERE status <> 'pending'"
        ),
    ]
}

/// SQL text for one table, rendered once per store.
#[derive(Debug)]
struct Queries {
    select: String,
    select_for_update: String,
    upsert: String,
    write_back: String,
    delete: String,
    poll: String,
    expire: String,
}

impl Queries {
    fn new(table: &str) -> Self {
        // Bind order of `upsert` and `write_back` follows `bind_ticket`.
        Self {
            select: format!("SELECT {COLUMNS} FROM {table} WHERE id = $1"),
            select_for_update: format!("SELECT {COLUMNS} FROM {table} WHERE id = $1 FOR UPDATE"),
            upsert: format!(
                r#"
                INSERT INTO {table} ({COLUMNS})
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ON CONFLICT (id) DO UPDATE SET
                    status = EXCLUDED.status,
                    runat = EXCLUDED.runat,
                    nice = EXCLUDED.nice,
                    type = EXCLUDED.type,
                    ctime = EXCLUDED.ctime,
                    mtime = EXCLUDED.mtime,
                    attempts = EXCLUDED.attempts,
                    payload = EXCLUDED.payload,
                    error_reason = EXCLUDED.error_reason
                "#
            ),
            write_back: format!(
                r#"
                UPDATE {table} SET
                    status = $2,
                    runat = $3,
                    nice = $4,
                    type = $5,
                    ctime = $6,
                    mtime = $7,
                    attempts = $8,
                    payload = $9,
                    error_reason = $10
                WHERE id = $1
                "#
            ),
            delete: format!("DELETE FROM {table} WHERE id = $1"),
            // $1 now, $2 limit, $3 backoff base, $4 backoff ceiling (secs),
            // $5 ttr (secs), $6 retain-forever sentinel.
            //
            // The exponential term is computed as exp(n * ln(base)) clamped
            // below float8 overflow; base = 1 yields exactly 1.
            poll: format!(
                r#"
                WITH ready AS (
                    SELECT id, runat
                    FROM {table}
                    WHERE status = 'pending' AND runat <= $1
                    ORDER BY runat, nice, id
                    LIMIT $2
                    FOR UPDATE SKIP LOCKED
                ),
                leased AS (
                    UPDATE {table} AS t
                    SET attempts = t.attempts + 1,
                        runat = LEAST(
                            $1 + make_interval(secs => LEAST(
                                $4::float8,
                                CASE WHEN $3::float8 <= 1.0 THEN 1.0
                                     ELSE exp(LEAST((t.attempts + 1)::float8 * ln($3::float8), 700.0))
                                END
                            ) + $5::float8),
                            $6
                        ),
                        mtime = $1
                    FROM ready
                    WHERE t.id = ready.id
                    RETURNING t.id, t.status, t.runat, t.nice, t.type, t.ctime, t.mtime,
                              t.attempts, t.payload, t.error_reason, ready.runat AS queued_at
                ),
                upcoming AS (
                    SELECT runat
                    FROM {table}
                    WHERE status = 'pending' AND NOT EXISTS (SELECT 1 FROM leased)
                    ORDER BY runat
                    LIMIT 1
                    FOR SHARE SKIP LOCKED
                )
                SELECT '{ROW_TICKET}'::text AS row_kind, id, status, runat, nice, type, ctime,
                       mtime, attempts, payload, error_reason, queued_at
                FROM leased
                UNION ALL
                SELECT '{ROW_SLEEP_UNTIL}'::text, NULL::uuid, NULL::text, runat, NULL::integer,
                       NULL::text, NULL::timestamptz, NULL::timestamptz, NULL::integer,
                       NULL::jsonb, NULL::jsonb, NULL::timestamptz
                FROM upcoming
                ORDER BY queued_at, nice, id
                "#
            ),
            expire: format!(
                r#"
                DELETE FROM {table}
                WHERE id IN (
                    SELECT id
                    FROM {table}
                    WHERE status <> 'pending' AND runat <= $1
                    ORDER BY runat
                    LIMIT $2
                    FOR UPDATE SKIP LOCKED
                )
                "#
            ),
        }
    }
}

type PgQuery<'q> = sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments>;

fn bind_ticket<'q>(query: PgQuery<'q>, ticket: &'q Ticket) -> PgQuery<'q> {
    query
        .bind(ticket.id.as_uuid())
        .bind(ticket.status.as_str())
        .bind(ticket.runat)
        .bind(ticket.nice)
        .bind(ticket.kind.as_str())
        .bind(ticket.ctime)
        .bind(ticket.mtime)
        .bind(i32::try_from(ticket.attempts).unwrap_or(i32::MAX))
        .bind(&ticket.payload)
        .bind(ticket.error_reason.as_ref())
}

/// Largest lease component, in seconds, that keeps `now + lease` inside the
/// `timestamptz` range. The statement clamps the sum to `retain_forever`
/// afterwards, matching `add_saturating` in the in-memory store.
fn lease_secs_ceiling(now: DateTime<Utc>) -> f64 {
    (retain_forever() - now).num_seconds().max(0) as f64
}

fn clamp_secs(d: std::time::Duration, ceiling: f64) -> f64 {
    d.as_secs_f64().min(ceiling)
}

/// One decoded row of the poll statement.
#[derive(Debug, Clone, PartialEq)]
enum PollRow {
    Leased(Ticket),
    SleepUntil(DateTime<Utc>),
}

fn decode_poll_row(row: &PgRow) -> Result<PollRow, StoreError> {
    let row_kind: String = row
        .try_get("row_kind")
        .map_err(|e| StoreError::Storage(format!("poll row without discriminator: {e}")))?;

    match row_kind.as_str() {
        ROW_TICKET => decode_ticket(row).map(PollRow::Leased),
        ROW_SLEEP_UNTIL => row
            .try_get::<DateTime<Utc>, _>("runat")
            .map(PollRow::SleepUntil)
            .map_err(|e| StoreError::Storage(format!("malformed sleep_until row: {e}"))),
        other => Err(StoreError::Storage(format!(
            "poll row of unknown kind {other:?}"
        ))),
    }
}

/// Fold decoded poll rows into a result. Rows that failed to decode are
/// logged and skipped; they never fail the whole poll.
fn collect_poll_rows<I>(rows: I) -> PollResult
where
    I: IntoIterator<Item = Result<PollRow, StoreError>>,
{
    let mut tickets = Vec::new();
    let mut sleep_until = None;

    for row in rows {
        match row {
            Ok(PollRow::Leased(ticket)) => tickets.push(ticket),
            Ok(PollRow::SleepUntil(at)) => sleep_until = Some(at),
            Err(e) => warn!(error = %e, "skipping malformed poll row"),
        }
    }

    if tickets.is_empty() {
        PollResult::sleep_until(sleep_until)
    } else {
        PollResult::leased(tickets)
    }
}

fn decode_ticket(row: &PgRow) -> Result<Ticket, StoreError> {
    TicketRow::from_row(row)
        .map_err(|e| StoreError::Storage(format!("failed to decode ticket row: {e}")))?
        .try_into()
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.into_owned()).unwrap_or_default();
            StoreError::Storage(format!(
                "database error in {operation} ({code}): {}",
                db_err.message()
            ))
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::PoolTimedOut => {
            StoreError::Storage(format!("timed out acquiring a connection in {operation}"))
        }
        _ => StoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

// SQLx row types

#[derive(Debug)]
struct TicketRow {
    id: uuid::Uuid,
    status: String,
    runat: DateTime<Utc>,
    nice: i32,
    kind: String,
    ctime: DateTime<Utc>,
    mtime: Option<DateTime<Utc>>,
    attempts: i32,
    payload: serde_json::Value,
    error_reason: Option<serde_json::Value>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for TicketRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(TicketRow {
            id: row.try_get("id")?,
            status: row.try_get("status")?,
            runat: row.try_get("runat")?,
            nice: row.try_get("nice")?,
            kind: row.try_get("type")?,
            ctime: row.try_get("ctime")?,
            mtime: row.try_get("mtime")?,
            attempts: row.try_get("attempts")?,
            payload: row.try_get("payload")?,
            error_reason: row.try_get("error_reason")?,
        })
    }
}

impl TryFrom<TicketRow> for Ticket {
    type Error = StoreError;

    fn try_from(row: TicketRow) -> Result<Self, Self::Error> {
        let status = row.status.parse::<TicketStatus>()?;
        let attempts = u32::try_from(row.attempts).map_err(|_| {
            StoreError::Storage(format!(
                "ticket {} has negative attempts: {}",
                row.id, row.attempts
            ))
        })?;

        Ok(Ticket {
            id: TicketId::from_uuid(row.id),
            status,
            runat: row.runat,
            nice: row.nice,
            kind: row.kind,
            ctime: row.ctime,
            mtime: row.mtime,
            attempts,
            payload: row.payload,
            error_reason: row.error_reason,
        })
    }
}
