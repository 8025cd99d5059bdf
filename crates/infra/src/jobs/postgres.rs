//! Postgres-backed job store.
//!
//! ## Claiming
//!
//! `claim_due_jobs` runs one `SERIALIZABLE` transaction that selects due rows
//! with `FOR UPDATE SKIP LOCKED`, flips them to `SENDING` and returns them
//! joined with their user. Rows locked by another claimer are skipped, so
//! concurrent workers partition the due set instead of queueing behind each
//! other. Serialization failures (`40001`) and deadlocks (`40P01`) are retried
//! a bounded number of times before surfacing as `Conflict`.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError |
//! |------------|----------------------|---------------|
//! | Database (unique violation) | `23505` | `Conflict` (second open job for a user and kind) |
//! | Database (foreign key violation) | `23503` | `UserNotFound` on insert, `Storage` otherwise |
//! | Database (serialization failure / deadlock) | `40001` / `40P01` | `Conflict` |
//! | Database (other) | Any other | `Storage` |
//! | PoolTimedOut / PoolClosed / Io | N/A | `Unavailable` |
//! | Other | N/A | `Storage` |

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::{PgPoolOptions, PgQueryResult, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, instrument, warn};

use cakeday_core::{ClaimedJob, JobId, JobKind, JobStatus, MessageJob, User, UserId};

use super::store::{JobChange, JobChangeSet, JobStats, JobStore, JobStoreError};

/// DDL for `users` and `message_jobs`. Idempotent.
pub const SCHEMA: &str = include_str!("../../sql/schema.sql");

const DEFAULT_CLAIM_RETRIES: u32 = 3;

const JOB_COLUMNS: &str = "id, user_id, kind, scheduled_at_utc, status, attempts, \
     next_attempt_at_utc, last_error, sent_at_utc, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
    claim_retries: u32,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            claim_retries: DEFAULT_CLAIM_RETRIES,
        }
    }

    /// Open a pool against `database_url`.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, JobStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    pub fn with_claim_retries(mut self, retries: u32) -> Self {
        self.claim_retries = retries;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables and indexes if they are missing.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    /// Insert or update a user row. The profile service owns this table in
    /// production; tests and local setups use this to seed it.
    #[instrument(skip(self, user), fields(user_id = %user.id), err)]
    pub async fn upsert_user(&self, user: &User) -> Result<(), JobStoreError> {
        sqlx::query(
            r#"
            INSERT INTO users (id, first_name, last_name, email, birth_date, timezone)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE SET
                first_name = EXCLUDED.first_name,
                last_name = EXCLUDED.last_name,
                email = EXCLUDED.email,
                birth_date = EXCLUDED.birth_date,
                timezone = EXCLUDED.timezone,
                updated_at = NOW()
            "#,
        )
        .bind(user.id.as_uuid())
        .bind(&user.first_name)
        .bind(&user.last_name)
        .bind(&user.email)
        .bind(user.birth_date)
        .bind(&user.timezone)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert_user", e))?;
        Ok(())
    }

    /// Apply `changes` inside a transaction the caller owns.
    ///
    /// Lets the profile service commit a user write and the matching
    /// reschedule together.
    pub async fn apply_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        changes: &JobChangeSet,
    ) -> Result<(), JobStoreError> {
        for change in &changes.changes {
            apply_change(tx, change, changes.at).await?;
        }
        Ok(())
    }

    async fn claim_once(&self, limit: i64, now: DateTime<Utc>) -> Result<Vec<ClaimedJob>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;

        let rows = sqlx::query(
            r#"
            WITH due AS (
                SELECT id
                FROM message_jobs
                WHERE status IN ('PENDING', 'RETRY')
                  AND scheduled_at_utc <= $1
                  AND (next_attempt_at_utc IS NULL OR next_attempt_at_utc <= $1)
                ORDER BY scheduled_at_utc ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            ),
            claimed AS (
                UPDATE message_jobs j
                SET status = 'SENDING', updated_at = $1
                FROM due
                WHERE j.id = due.id
                RETURNING j.*
            )
            SELECT
                c.id, c.user_id, c.kind, c.scheduled_at_utc, c.status, c.attempts,
                c.next_attempt_at_utc, c.last_error, c.sent_at_utc, c.created_at, c.updated_at,
                u.first_name, u.last_name, u.email, u.birth_date, u.timezone
            FROM claimed c
            JOIN users u ON u.id = c.user_id
            ORDER BY c.scheduled_at_utc ASC
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;

        // Decode before committing: on error the transaction drops and rolls
        // back, leaving the rows claimable.
        let claimed = rows.iter().map(claimed_from_row).collect::<Result<Vec<_>, _>>()?;
        tx.commit().await?;

        Ok(claimed)
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self), fields(claimed), err)]
    async fn claim_due_jobs(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<ClaimedJob>, JobStoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let mut attempt = 0;
        loop {
            match self.claim_once(limit, now).await {
                Ok(claimed) => {
                    tracing::Span::current().record("claimed", claimed.len());
                    return Ok(claimed);
                }
                Err(e) if is_retryable(&e) && attempt < self.claim_retries => {
                    attempt += 1;
                    debug!(attempt, error = %e, "claim transaction aborted, retrying");
                }
                Err(e) => {
                    if is_retryable(&e) {
                        warn!(error = %e, "claim kept conflicting, giving up for this cycle");
                    }
                    return Err(map_sqlx_error("claim_due_jobs", e));
                }
            }
        }
    }

    #[instrument(skip(self, changes), fields(changes = changes.len()), err)]
    async fn apply(&self, changes: JobChangeSet) -> Result<(), JobStoreError> {
        if changes.is_empty() {
            return Ok(());
        }
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        Self::apply_in_tx(&mut tx, &changes).await?;
        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
        Ok(())
    }

    async fn get(&self, job_id: JobId) -> Result<Option<MessageJob>, JobStoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM message_jobs WHERE id = $1"))
            .bind(job_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;
        row.as_ref().map(job_from_row).transpose().map_err(|e| map_sqlx_error("get", e))
    }

    async fn open_job_for(&self, user_id: UserId, kind: &JobKind) -> Result<Option<MessageJob>, JobStoreError> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM message_jobs \
             WHERE user_id = $1 AND kind = $2 AND status IN ('PENDING', 'RETRY')"
        ))
        .bind(user_id.as_uuid())
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("open_job_for", e))?;
        row.as_ref()
            .map(job_from_row)
            .transpose()
            .map_err(|e| map_sqlx_error("open_job_for", e))
    }

    async fn jobs_for_user(&self, user_id: UserId) -> Result<Vec<MessageJob>, JobStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM message_jobs WHERE user_id = $1 \
             ORDER BY scheduled_at_utc ASC, created_at ASC"
        ))
        .bind(user_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("jobs_for_user", e))?;
        rows.iter()
            .map(job_from_row)
            .collect::<Result<_, _>>()
            .map_err(|e| map_sqlx_error("jobs_for_user", e))
    }

    #[instrument(skip(self), err)]
    async fn stuck_sending(
        &self,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<MessageJob>, JobStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM message_jobs \
             WHERE status = 'SENDING' AND updated_at < $1 \
             ORDER BY updated_at ASC LIMIT $2"
        ))
        .bind(updated_before)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("stuck_sending", e))?;
        rows.iter()
            .map(job_from_row)
            .collect::<Result<_, _>>()
            .map_err(|e| map_sqlx_error("stuck_sending", e))
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS count FROM message_jobs GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(|e| map_sqlx_error("stats", e))?;
            let count: i64 = row.try_get("count").map_err(|e| map_sqlx_error("stats", e))?;
            let status = JobStatus::parse(&status).map_err(|e| JobStoreError::Storage(e.to_string()))?;
            stats.record(status, usize::try_from(count).unwrap_or(0));
        }
        Ok(stats)
    }

    async fn ping(&self) -> Result<(), JobStoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("ping", e))?;
        Ok(())
    }
}

async fn apply_change(
    tx: &mut Transaction<'_, Postgres>,
    change: &JobChange,
    at: DateTime<Utc>,
) -> Result<(), JobStoreError> {
    match change {
        JobChange::Insert(job) => {
            insert_job(tx, job, INSERT_JOB).await?;
        }
        JobChange::InsertUnlessOpen(job) => {
            let inserted = insert_job(tx, job, INSERT_JOB_UNLESS_OPEN).await?;
            if inserted == 0 {
                debug!(user_id = %job.user_id, kind = %job.kind, "open job already present, follow-up skipped");
            }
        }
        JobChange::CancelOpen { user_id, kind } => {
            let result = sqlx::query(
                "DELETE FROM message_jobs \
                 WHERE user_id = $1 AND kind = $2 AND status IN ('PENDING', 'RETRY')",
            )
            .bind(user_id.as_uuid())
            .bind(kind.as_str())
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("cancel_open", e))?;
            debug!(%user_id, %kind, cancelled = result.rows_affected(), "cancelled open jobs");
        }
        JobChange::CancelAllOpen { user_id } => {
            let result = sqlx::query(
                "DELETE FROM message_jobs WHERE user_id = $1 AND status IN ('PENDING', 'RETRY')",
            )
            .bind(user_id.as_uuid())
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("cancel_all_open", e))?;
            debug!(%user_id, cancelled = result.rows_affected(), "cancelled all open jobs");
        }
        JobChange::MarkSent { job_id, sent_at } => {
            let result = sqlx::query(
                "UPDATE message_jobs \
                 SET status = 'SENT', sent_at_utc = $2, attempts = attempts + 1, updated_at = $3 \
                 WHERE id = $1 AND status = 'SENDING'",
            )
            .bind(job_id.as_uuid())
            .bind(sent_at)
            .bind(at)
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("mark_sent", e))?;
            ensure_transitioned(tx, *job_id, JobStatus::Sent, result).await?;
        }
        JobChange::MarkRetry {
            job_id,
            attempts,
            next_attempt_at,
            error,
        } => {
            let result = sqlx::query(
                "UPDATE message_jobs \
                 SET status = 'RETRY', attempts = GREATEST(attempts, $2), \
                     next_attempt_at_utc = $3, last_error = $4, updated_at = $5 \
                 WHERE id = $1 AND status = 'SENDING'",
            )
            .bind(job_id.as_uuid())
            .bind(i32::try_from(*attempts).unwrap_or(i32::MAX))
            .bind(next_attempt_at)
            .bind(error)
            .bind(at)
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("mark_retry", e))?;
            ensure_transitioned(tx, *job_id, JobStatus::Retry, result).await?;
        }
        JobChange::MarkFailed { job_id, attempts, error } => {
            let result = sqlx::query(
                "UPDATE message_jobs \
                 SET status = 'FAILED', attempts = GREATEST(attempts, $2), last_error = $3, updated_at = $4 \
                 WHERE id = $1 AND status = 'SENDING'",
            )
            .bind(job_id.as_uuid())
            .bind(i32::try_from(*attempts).unwrap_or(i32::MAX))
            .bind(error)
            .bind(at)
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("mark_failed", e))?;
            ensure_transitioned(tx, *job_id, JobStatus::Failed, result).await?;
        }
        JobChange::Requeue { job_id } => {
            let result = sqlx::query(
                "UPDATE message_jobs \
                 SET status = 'RETRY', next_attempt_at_utc = NULL, updated_at = $2 \
                 WHERE id = $1 AND status = 'SENDING'",
            )
            .bind(job_id.as_uuid())
            .bind(at)
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("requeue", e))?;
            ensure_transitioned(tx, *job_id, JobStatus::Retry, result).await?;
        }
    }
    Ok(())
}

const INSERT_JOB: &str = r#"
    INSERT INTO message_jobs (
        id, user_id, kind, scheduled_at_utc, status, attempts,
        next_attempt_at_utc, last_error, sent_at_utc, created_at, updated_at
    )
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
"#;

// Targets the partial unique index on open jobs.
const INSERT_JOB_UNLESS_OPEN: &str = r#"
    INSERT INTO message_jobs (
        id, user_id, kind, scheduled_at_utc, status, attempts,
        next_attempt_at_utc, last_error, sent_at_utc, created_at, updated_at
    )
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
    ON CONFLICT (user_id, kind) WHERE status IN ('PENDING', 'RETRY') DO NOTHING
"#;

/// Insert one job row, returning the number of rows written.
async fn insert_job(
    tx: &mut Transaction<'_, Postgres>,
    job: &MessageJob,
    sql: &'static str,
) -> Result<u64, JobStoreError> {
    let result = sqlx::query(sql)
        .bind(job.id.as_uuid())
        .bind(job.user_id.as_uuid())
        .bind(job.kind.as_str())
        .bind(job.scheduled_at_utc)
        .bind(job.status.as_str())
        .bind(i32::try_from(job.attempts).unwrap_or(i32::MAX))
        .bind(job.next_attempt_at_utc)
        .bind(job.last_error.as_deref())
        .bind(job.sent_at_utc)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| {
            if sqlstate(&e).as_deref() == Some("23503") {
                JobStoreError::UserNotFound(job.user_id)
            } else {
                map_sqlx_error("insert_job", e)
            }
        })?;
    Ok(result.rows_affected())
}

/// Turn a guarded update that touched no row into `NotFound` or `InvalidTransition`.
async fn ensure_transitioned(
    tx: &mut Transaction<'_, Postgres>,
    job_id: JobId,
    to: JobStatus,
    result: PgQueryResult,
) -> Result<(), JobStoreError> {
    if result.rows_affected() > 0 {
        return Ok(());
    }

    let current: Option<String> = sqlx::query_scalar("SELECT status FROM message_jobs WHERE id = $1")
        .bind(job_id.as_uuid())
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("load_status", e))?;

    match current {
        None => Err(JobStoreError::NotFound(job_id)),
        Some(status) => {
            let from = JobStatus::parse(&status).map_err(|e| JobStoreError::Storage(e.to_string()))?;
            Err(JobStoreError::InvalidTransition { job_id, from, to })
        }
    }
}

fn job_from_row(row: &PgRow) -> Result<MessageJob, sqlx::Error> {
    let status: String = row.try_get("status")?;
    let status = JobStatus::parse(&status).map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
    let kind: String = row.try_get("kind")?;
    let attempts: i32 = row.try_get("attempts")?;
    let id: uuid::Uuid = row.try_get("id")?;
    let user_id: uuid::Uuid = row.try_get("user_id")?;

    Ok(MessageJob {
        id: JobId::from_uuid(id),
        user_id: UserId::from_uuid(user_id),
        kind: JobKind::parse(&kind),
        scheduled_at_utc: row.try_get("scheduled_at_utc")?,
        status,
        attempts: u32::try_from(attempts).unwrap_or(0),
        next_attempt_at_utc: row.try_get("next_attempt_at_utc")?,
        last_error: row.try_get("last_error")?,
        sent_at_utc: row.try_get("sent_at_utc")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn claimed_from_row(row: &PgRow) -> Result<ClaimedJob, sqlx::Error> {
    let job = job_from_row(row)?;
    let birth_date: NaiveDate = row.try_get("birth_date")?;
    let user = User {
        id: job.user_id,
        first_name: row.try_get("first_name")?,
        last_name: row.try_get("last_name")?,
        email: row.try_get("email")?,
        birth_date,
        timezone: row.try_get("timezone")?,
    };
    Ok(ClaimedJob { job, user })
}

fn sqlstate(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().map(|c| c.into_owned()),
        _ => None,
    }
}

/// Serialization failure or deadlock: the transaction can simply run again.
fn is_retryable(err: &sqlx::Error) -> bool {
    matches!(sqlstate(err).as_deref(), Some("40001") | Some("40P01"))
}

/// Map SQLx errors to JobStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => JobStoreError::Conflict(msg),
                Some("40001") | Some("40P01") => JobStoreError::Conflict(msg),
                _ => JobStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolTimedOut => {
            JobStoreError::Unavailable(format!("connection pool timed out in {}", operation))
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Unavailable(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::Io(e) => JobStoreError::Unavailable(format!("io error in {}: {}", operation, e)),
        _ => JobStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}
