//! Postgres-backed job store.
//!
//! ## Claim semantics
//!
//! `claim` and `reset_stuck` are single conditional `UPDATE .. RETURNING`
//! statements: the `WHERE` clause re-checks the source state, so concurrent
//! workers race on the row lock and exactly one sees a returned row.
//!
//! `complete` and `fail` lock the row with `SELECT .. FOR UPDATE`, apply the
//! same transitions as the in-memory store, and write the row back within
//! one transaction.
//!
//! ## Change feed
//!
//! Every transition is published on the in-process broadcast channel and via
//! `pg_notify('pdf_job_changes', ..)`. [`PostgresJobStore::listen`] relays
//! notifications from other processes into the local channel; duplicates are
//! harmless because observers order by `revision`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgListener, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tokio::sync::broadcast;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use offerdesk_core::{OwnerId, Tenant, TenantId};

use super::retry::{RetryPolicy, to_chrono};
use super::store::{CHANGE_FEED_CAPACITY, FailOutcome, JobStats, JobStore, JobStoreError};
use super::types::{DeadLetterEntry, JobChange, JobId, JobStatus, PdfJob, StatusSnapshot};

const NOTIFY_CHANNEL: &str = "pdf_job_changes";

const JOB_COLUMNS: &str = r#"
    id, tenant_kind, tenant_id, owner_id, status, payload, storage_path,
    result_url, error_message, last_retry_error, retry_count, max_retries,
    next_retry_at, started_at, completed_at, created_at, updated_at,
    callback_url, download_token, quota_period, revision
"#;

#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
    policy: RetryPolicy,
    changes: broadcast::Sender<JobChange>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool, policy: RetryPolicy) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            pool,
            policy,
            changes,
        }
    }

    /// Create the job and dead-letter tables if they do not exist.
    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        for ddl in [
            r#"
            CREATE TABLE IF NOT EXISTS pdf_jobs (
                id               UUID        PRIMARY KEY,
                tenant_kind      TEXT        NOT NULL,
                tenant_id        UUID,
                owner_id         UUID        NOT NULL,
                status           TEXT        NOT NULL,
                payload          JSONB       NOT NULL,
                storage_path     TEXT        NOT NULL,
                result_url       TEXT,
                error_message    TEXT,
                last_retry_error TEXT,
                retry_count      INTEGER     NOT NULL DEFAULT 0,
                max_retries      INTEGER     NOT NULL,
                next_retry_at    TIMESTAMPTZ,
                started_at       TIMESTAMPTZ,
                completed_at     TIMESTAMPTZ,
                created_at       TIMESTAMPTZ NOT NULL,
                updated_at       TIMESTAMPTZ NOT NULL,
                callback_url     TEXT,
                download_token   TEXT        NOT NULL,
                quota_period     DATE,
                revision         BIGINT      NOT NULL DEFAULT 1,
                CHECK (retry_count <= max_retries),
                CHECK ((result_url IS NOT NULL) = (status = 'completed')),
                CHECK ((next_retry_at IS NOT NULL) = (status = 'failed'))
            )
            "#,
            "CREATE INDEX IF NOT EXISTS pdf_jobs_claimable_idx ON pdf_jobs (status, next_retry_at)",
            "CREATE INDEX IF NOT EXISTS pdf_jobs_started_idx ON pdf_jobs (status, started_at)",
            "CREATE INDEX IF NOT EXISTS pdf_jobs_updated_idx ON pdf_jobs (updated_at)",
            r#"
            CREATE TABLE IF NOT EXISTS pdf_dead_letters (
                job_id           UUID        PRIMARY KEY REFERENCES pdf_jobs (id),
                tenant_kind      TEXT        NOT NULL,
                tenant_id        UUID,
                reason           TEXT        NOT NULL,
                attempts         INTEGER     NOT NULL,
                dead_lettered_at TIMESTAMPTZ NOT NULL
            )
            "#,
        ] {
            sqlx::query(ddl)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }

    /// Relay notifications from other processes into the local change feed.
    ///
    /// Runs until the listener connection fails.
    pub async fn listen(&self) -> Result<tokio::task::JoinHandle<()>, JobStoreError> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("listen_connect", e))?;
        listener
            .listen(NOTIFY_CHANNEL)
            .await
            .map_err(|e| map_sqlx_error("listen", e))?;

        let changes = self.changes.clone();
        Ok(tokio::spawn(async move {
            loop {
                match listener.recv().await {
                    Ok(notification) => {
                        match serde_json::from_str::<ChangeNotice>(notification.payload()) {
                            Ok(notice) => {
                                let _ = changes.send(notice.into());
                            }
                            Err(e) => warn!(error = %e, "ignoring malformed job notification"),
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "job notification listener stopped");
                        break;
                    }
                }
            }
        }))
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, JobStoreError> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))
    }

    /// Publish locally and to other processes. Best effort.
    async fn publish(&self, job: &PdfJob) {
        let change = JobChange::of(job);
        let _ = self.changes.send(change.clone());

        match serde_json::to_string(&ChangeNotice::from(change)) {
            Ok(payload) => {
                if let Err(e) = sqlx::query("SELECT pg_notify($1, $2)")
                    .bind(NOTIFY_CHANNEL)
                    .bind(payload)
                    .execute(&self.pool)
                    .await
                {
                    debug!(job_id = %job.id, error = %e, "pg_notify failed");
                }
            }
            Err(e) => debug!(job_id = %job.id, error = %e, "failed to encode job notification"),
        }
    }

    async fn fetch_many(&self, sql: &str, operation: &str, binds: ListBinds) -> Result<Vec<PdfJob>, JobStoreError> {
        let mut query = sqlx::query(sql);
        if let Some(at) = binds.at {
            query = query.bind(at);
        }
        if let Some(limit) = binds.limit {
            query = query.bind(limit);
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        rows.iter().map(job_from_row).collect()
    }
}

/// Positional binds shared by the list queries: `$1 = at`, `$2 = limit`.
struct ListBinds {
    at: Option<DateTime<Utc>>,
    limit: Option<i64>,
}

fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

/// Lock a row for the rest of the transaction.
async fn lock_job(
    tx: &mut Transaction<'_, Postgres>,
    job_id: JobId,
) -> Result<PdfJob, JobStoreError> {
    let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM pdf_jobs WHERE id = $1 FOR UPDATE"))
        .bind(job_id.as_uuid())
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("lock_job", e))?
        .ok_or(JobStoreError::NotFound(job_id))?;
    job_from_row(&row)
}

/// Write back every mutable column of a locked row.
async fn write_job(tx: &mut Transaction<'_, Postgres>, job: &PdfJob) -> Result<(), JobStoreError> {
    sqlx::query(
        r#"
        UPDATE pdf_jobs SET
            status = $2,
            result_url = $3,
            error_message = $4,
            last_retry_error = $5,
            retry_count = $6,
            next_retry_at = $7,
            started_at = $8,
            completed_at = $9,
            updated_at = $10,
            revision = $11
        WHERE id = $1
        "#,
    )
    .bind(job.id.as_uuid())
    .bind(job.status.as_str())
    .bind(&job.result_url)
    .bind(&job.error_message)
    .bind(&job.last_retry_error)
    .bind(job.retry_count as i32)
    .bind(job.next_retry_at)
    .bind(job.started_at)
    .bind(job.completed_at)
    .bind(job.updated_at)
    .bind(job.revision as i64)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("write_job", e))?;
    Ok(())
}

fn require_processing(job: &PdfJob, action: &'static str) -> Result<(), JobStoreError> {
    if job.status != JobStatus::Processing {
        return Err(JobStoreError::InvalidTransition {
            job_id: job.id,
            from: job.status,
            action,
        });
    }
    Ok(())
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id), err)]
    async fn create(&self, job: PdfJob) -> Result<PdfJob, JobStoreError> {
        let (tenant_kind, tenant_id) = tenant_columns(&job.tenant);
        let payload = serde_json::to_value(&job.payload)
            .map_err(|e| JobStoreError::Storage(format!("failed to encode payload: {e}")))?;

        sqlx::query(&format!(
            "INSERT INTO pdf_jobs ({JOB_COLUMNS}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21)"
        ))
        .bind(job.id.as_uuid())
        .bind(tenant_kind)
        .bind(tenant_id)
        .bind(job.owner_id.as_uuid())
        .bind(job.status.as_str())
        .bind(payload)
        .bind(&job.storage_path)
        .bind(&job.result_url)
        .bind(&job.error_message)
        .bind(&job.last_retry_error)
        .bind(job.retry_count as i32)
        .bind(job.max_retries as i32)
        .bind(job.next_retry_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(&job.callback_url)
        .bind(&job.download_token)
        .bind(job.quota_period)
        .bind(job.revision as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                JobStoreError::AlreadyExists(job.id)
            } else {
                map_sqlx_error("create_job", e)
            }
        })?;

        self.publish(&job).await;
        Ok(job)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<PdfJob>, JobStoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM pdf_jobs WHERE id = $1"))
            .bind(job_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;
        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn claim(&self, job_id: JobId, now: DateTime<Utc>) -> Result<Option<PdfJob>, JobStoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE pdf_jobs SET
                status = 'processing',
                started_at = $2,
                next_retry_at = NULL,
                updated_at = $2,
                revision = revision + 1
            WHERE id = $1
              AND (status = 'pending' OR (status = 'failed' AND next_retry_at <= $2))
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id.as_uuid())
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_job", e))?;

        let claimed = row.as_ref().map(job_from_row).transpose()?;
        if let Some(job) = &claimed {
            self.publish(job).await;
        }
        Ok(claimed)
    }

    #[instrument(skip(self, result_url), fields(job_id = %job_id), err)]
    async fn complete(
        &self,
        job_id: JobId,
        result_url: &str,
        now: DateTime<Utc>,
    ) -> Result<PdfJob, JobStoreError> {
        let mut tx = self.begin().await?;
        let mut job = lock_job(&mut tx, job_id).await?;
        require_processing(&job, "complete")?;

        job.mark_completed(result_url, now);
        write_job(&mut tx, &job).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        self.publish(&job).await;
        Ok(job)
    }

    #[instrument(skip(self, error), fields(job_id = %job_id), err)]
    async fn fail(
        &self,
        job_id: JobId,
        error: &str,
        retryable: bool,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome, JobStoreError> {
        let mut tx = self.begin().await?;
        let mut job = lock_job(&mut tx, job_id).await?;
        require_processing(&job, "fail")?;

        let entry = job.mark_failed(error, retryable, &self.policy, now);
        write_job(&mut tx, &job).await?;

        if let Some(entry) = &entry {
            let (tenant_kind, tenant_id) = tenant_columns(&entry.tenant);
            sqlx::query(
                r#"
                INSERT INTO pdf_dead_letters (job_id, tenant_kind, tenant_id, reason, attempts, dead_lettered_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(entry.job_id.as_uuid())
            .bind(tenant_kind)
            .bind(tenant_id)
            .bind(&entry.reason)
            .bind(entry.attempts as i32)
            .bind(entry.dead_lettered_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert_dead_letter", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        self.publish(&job).await;

        Ok(match entry {
            Some(entry) => FailOutcome::DeadLettered { job, entry },
            None => FailOutcome::Rescheduled(job),
        })
    }

    #[instrument(skip(self, reason), fields(job_id = %job_id), err)]
    async fn reset_stuck(
        &self,
        job_id: JobId,
        started_before: DateTime<Utc>,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<PdfJob>, JobStoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE pdf_jobs SET
                status = 'failed',
                started_at = NULL,
                next_retry_at = $3,
                error_message = $4,
                updated_at = $3,
                revision = revision + 1
            WHERE id = $1 AND status = 'processing' AND started_at <= $2
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id.as_uuid())
        .bind(started_before)
        .bind(now)
        .bind(reason)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("reset_stuck", e))?;

        let reset = row.as_ref().map(job_from_row).transpose()?;
        if let Some(job) = &reset {
            self.publish(job).await;
        }
        Ok(reset)
    }

    async fn list_claimable(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<PdfJob>, JobStoreError> {
        self.fetch_many(
            &format!(
                r#"
                SELECT {JOB_COLUMNS} FROM pdf_jobs
                WHERE status = 'pending' OR (status = 'failed' AND next_retry_at <= $1)
                ORDER BY COALESCE(next_retry_at, created_at), id
                LIMIT $2
                "#
            ),
            "list_claimable",
            ListBinds {
                at: Some(now),
                limit: Some(limit_param(limit)),
            },
        )
        .await
    }

    async fn list_ready_for_retry(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PdfJob>, JobStoreError> {
        self.fetch_many(
            &format!(
                r#"
                SELECT {JOB_COLUMNS} FROM pdf_jobs
                WHERE status = 'failed' AND next_retry_at <= $1
                ORDER BY next_retry_at, id
                LIMIT $2
                "#
            ),
            "list_ready_for_retry",
            ListBinds {
                at: Some(now),
                limit: Some(limit_param(limit)),
            },
        )
        .await
    }

    async fn list_stuck(&self, now: DateTime<Utc>, timeout: Duration) -> Result<Vec<PdfJob>, JobStoreError> {
        self.fetch_many(
            &format!(
                r#"
                SELECT {JOB_COLUMNS} FROM pdf_jobs
                WHERE status = 'processing' AND started_at <= $1
                ORDER BY started_at, id
                "#
            ),
            "list_stuck",
            ListBinds {
                at: Some(now - to_chrono(timeout)),
                limit: None,
            },
        )
        .await
    }

    async fn list_finished_since(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PdfJob>, JobStoreError> {
        self.fetch_many(
            &format!(
                r#"
                SELECT {JOB_COLUMNS} FROM pdf_jobs
                WHERE status IN ('completed', 'dead_letter') AND updated_at >= $1
                ORDER BY updated_at, id
                LIMIT $2
                "#
            ),
            "list_finished_since",
            ListBinds {
                at: Some(since),
                limit: Some(limit_param(limit)),
            },
        )
        .await
    }

    async fn list_dead_letters(
        &self,
        tenant: Tenant,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, JobStoreError> {
        let (tenant_kind, tenant_id) = tenant_columns(&tenant);
        let rows = sqlx::query(
            r#"
            SELECT job_id, tenant_kind, tenant_id, reason, attempts, dead_lettered_at
            FROM pdf_dead_letters
            WHERE tenant_kind = $1 AND tenant_id IS NOT DISTINCT FROM $2
            ORDER BY dead_lettered_at, job_id
            LIMIT $3
            "#,
        )
        .bind(tenant_kind)
        .bind(tenant_id)
        .bind(limit_param(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_dead_letters", e))?;

        rows.iter()
            .map(|row| -> Result<DeadLetterEntry, JobStoreError> {
                let attempts: i32 = row.try_get("attempts").map_err(row_error)?;
                Ok(DeadLetterEntry {
                    job_id: JobId::from_uuid(row.try_get("job_id").map_err(row_error)?),
                    tenant: tenant_from_columns(
                        &row.try_get::<String, _>("tenant_kind").map_err(row_error)?,
                        row.try_get("tenant_id").map_err(row_error)?,
                    )?,
                    reason: row.try_get("reason").map_err(row_error)?,
                    attempts: attempts.max(0) as u32,
                    dead_lettered_at: row.try_get("dead_lettered_at").map_err(row_error)?,
                })
            })
            .collect()
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM pdf_jobs GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(row_error)?;
            let n: i64 = row.try_get("n").map_err(row_error)?;
            let status: JobStatus = status.parse().map_err(JobStoreError::Storage)?;
            stats.add(status, usize::try_from(n).unwrap_or(0));
        }
        Ok(stats)
    }

    fn subscribe(&self) -> broadcast::Receiver<JobChange> {
        self.changes.subscribe()
    }

    fn retry_policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

/// Wire form of a [`JobChange`] carried by `pg_notify`.
#[derive(Debug, Serialize, Deserialize)]
struct ChangeNotice {
    job_id: JobId,
    revision: u64,
    snapshot: StatusSnapshot,
}

impl From<JobChange> for ChangeNotice {
    fn from(c: JobChange) -> Self {
        Self {
            job_id: c.job_id,
            revision: c.revision,
            snapshot: c.snapshot,
        }
    }
}

impl From<ChangeNotice> for JobChange {
    fn from(n: ChangeNotice) -> Self {
        Self {
            job_id: n.job_id,
            revision: n.revision,
            snapshot: n.snapshot,
        }
    }
}

fn tenant_columns(tenant: &Tenant) -> (&'static str, Option<Uuid>) {
    match tenant {
        Tenant::System => ("system", None),
        Tenant::Account(id) => ("account", Some(*id.as_uuid())),
    }
}

fn tenant_from_columns(kind: &str, id: Option<Uuid>) -> Result<Tenant, JobStoreError> {
    match (kind, id) {
        ("system", _) => Ok(Tenant::System),
        ("account", Some(id)) => Ok(Tenant::Account(TenantId::from_uuid(id))),
        _ => Err(JobStoreError::Storage(format!("invalid tenant columns: {kind}"))),
    }
}

fn job_from_row(row: &PgRow) -> Result<PdfJob, JobStoreError> {
    let status: String = row.try_get("status").map_err(row_error)?;
    let payload: serde_json::Value = row.try_get("payload").map_err(row_error)?;
    let retry_count: i32 = row.try_get("retry_count").map_err(row_error)?;
    let max_retries: i32 = row.try_get("max_retries").map_err(row_error)?;
    let revision: i64 = row.try_get("revision").map_err(row_error)?;
    let tenant_kind: String = row.try_get("tenant_kind").map_err(row_error)?;
    let quota_period: Option<NaiveDate> = row.try_get("quota_period").map_err(row_error)?;

    Ok(PdfJob {
        id: JobId::from_uuid(row.try_get("id").map_err(row_error)?),
        tenant: tenant_from_columns(&tenant_kind, row.try_get("tenant_id").map_err(row_error)?)?,
        owner_id: OwnerId::from_uuid(row.try_get("owner_id").map_err(row_error)?),
        status: status.parse().map_err(JobStoreError::Storage)?,
        payload: serde_json::from_value(payload)
            .map_err(|e| JobStoreError::Storage(format!("failed to decode payload: {e}")))?,
        storage_path: row.try_get("storage_path").map_err(row_error)?,
        result_url: row.try_get("result_url").map_err(row_error)?,
        error_message: row.try_get("error_message").map_err(row_error)?,
        last_retry_error: row.try_get("last_retry_error").map_err(row_error)?,
        retry_count: retry_count.max(0) as u32,
        max_retries: max_retries.max(0) as u32,
        next_retry_at: row.try_get("next_retry_at").map_err(row_error)?,
        started_at: row.try_get("started_at").map_err(row_error)?,
        completed_at: row.try_get("completed_at").map_err(row_error)?,
        created_at: row.try_get("created_at").map_err(row_error)?,
        updated_at: row.try_get("updated_at").map_err(row_error)?,
        callback_url: row.try_get("callback_url").map_err(row_error)?,
        download_token: row.try_get("download_token").map_err(row_error)?,
        quota_period,
        revision: revision.max(0) as u64,
    })
}

fn row_error(e: sqlx::Error) -> JobStoreError {
    JobStoreError::Storage(format!("failed to decode job row: {e}"))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            JobStoreError::Storage(format!("database error in {}: {}", operation, db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}
