//! Postgres-backed quota ledger.
//!
//! Schema:
//!
//! ```sql
//! quota_usage   (tenant_id, period_start DATE, used, updated_at)   PK (tenant_id, period_start)
//! quota_refunds (job_id PK, tenant_id, period_start, refunded_at)
//! ```
//!
//! The admission is a single `INSERT .. ON CONFLICT DO UPDATE .. WHERE used < limit`,
//! so the row lock taken by the upsert is the only coordination point.

use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{instrument, warn};

use offerdesk_core::{JobId, QuotaPeriod, TenantId};

use super::{QuotaDecision, QuotaError, QuotaLedger, Refund, canonical};

#[derive(Debug, Clone)]
pub struct PostgresQuotaLedger {
    pool: PgPool,
}

impl PostgresQuotaLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the ledger tables if they do not exist.
    pub async fn ensure_schema(&self) -> Result<(), QuotaError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS quota_usage (
                tenant_id    UUID        NOT NULL,
                period_start DATE        NOT NULL,
                used         INTEGER     NOT NULL DEFAULT 0 CHECK (used >= 0),
                updated_at   TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (tenant_id, period_start)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_quota_usage", e))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS quota_refunds (
                job_id       UUID        PRIMARY KEY,
                tenant_id    UUID        NOT NULL,
                period_start DATE        NOT NULL,
                refunded_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_quota_refunds", e))?;

        Ok(())
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, QuotaError> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))
    }
}

/// Fold rows stored under a non-canonical date of `period` into the canonical row.
async fn migrate_strays(
    tx: &mut Transaction<'_, Postgres>,
    tenant: TenantId,
    period: QuotaPeriod,
) -> Result<(), QuotaError> {
    let rows = sqlx::query(
        r#"
        WITH strays AS (
            SELECT period_start, used
            FROM quota_usage
            WHERE tenant_id = $1
              AND period_start > $2
              AND period_start < $3
              AND used > 0
            FOR UPDATE
        )
        UPDATE quota_usage q
        SET used = 0, updated_at = NOW()
        FROM strays s
        WHERE q.tenant_id = $1 AND q.period_start = s.period_start
        RETURNING s.period_start AS period_start, s.used AS moved
        "#,
    )
    .bind(tenant.as_uuid())
    .bind(period.start())
    .bind(period.next().start())
    .fetch_all(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("migrate_strays", e))?;

    let mut moved_total: i64 = 0;
    for row in rows {
        let stored: NaiveDate = row
            .try_get("period_start")
            .map_err(|e| map_sqlx_error("migrate_strays", e))?;
        let moved: i32 = row.try_get("moved").map_err(|e| map_sqlx_error("migrate_strays", e))?;
        warn!(
            tenant_id = %tenant,
            stored_period = %stored,
            canonical_period = %period,
            moved,
            "migrating non-canonical quota row"
        );
        moved_total += i64::from(moved);
    }

    if moved_total > 0 {
        sqlx::query(
            r#"
            INSERT INTO quota_usage (tenant_id, period_start, used)
            VALUES ($1, $2, $3)
            ON CONFLICT (tenant_id, period_start)
            DO UPDATE SET used = quota_usage.used + EXCLUDED.used, updated_at = NOW()
            "#,
        )
        .bind(tenant.as_uuid())
        .bind(period.start())
        .bind(i32::try_from(moved_total).unwrap_or(i32::MAX))
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("merge_strays", e))?;
    }

    Ok(())
}

async fn current_usage(
    tx: &mut Transaction<'_, Postgres>,
    tenant: TenantId,
    period: QuotaPeriod,
) -> Result<u32, QuotaError> {
    let used: Option<i32> = sqlx::query_scalar(
        "SELECT used FROM quota_usage WHERE tenant_id = $1 AND period_start = $2",
    )
    .bind(tenant.as_uuid())
    .bind(period.start())
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("current_usage", e))?;

    Ok(used.map(|u| u.max(0) as u32).unwrap_or(0))
}

#[async_trait]
impl QuotaLedger for PostgresQuotaLedger {
    #[instrument(skip(self), fields(tenant_id = %tenant), err)]
    async fn check_and_increment(
        &self,
        tenant: TenantId,
        limit: u32,
        period_start: NaiveDate,
    ) -> Result<QuotaDecision, QuotaError> {
        let period = canonical(period_start);
        let limit = i32::try_from(limit).unwrap_or(i32::MAX);
        let mut tx = self.begin().await?;

        migrate_strays(&mut tx, tenant, period).await?;

        let admitted: Option<i32> = sqlx::query_scalar(
            r#"
            INSERT INTO quota_usage (tenant_id, period_start, used)
            SELECT $1, $2, 1 WHERE $3 > 0
            ON CONFLICT (tenant_id, period_start)
            DO UPDATE SET used = quota_usage.used + 1, updated_at = NOW()
            WHERE quota_usage.used < $3
            RETURNING used
            "#,
        )
        .bind(tenant.as_uuid())
        .bind(period.start())
        .bind(limit)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("check_and_increment", e))?;

        let decision = match admitted {
            Some(used) => QuotaDecision {
                allowed: true,
                used: used.max(0) as u32,
            },
            None => QuotaDecision {
                allowed: false,
                used: current_usage(&mut tx, tenant, period).await?,
            },
        };

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(decision)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant, job_id = %job_id), err)]
    async fn rollback_increment(
        &self,
        tenant: TenantId,
        period_start: NaiveDate,
        job_id: JobId,
    ) -> Result<Refund, QuotaError> {
        let period = canonical(period_start);
        let mut tx = self.begin().await?;

        migrate_strays(&mut tx, tenant, period).await?;

        let recorded = sqlx::query(
            r#"
            INSERT INTO quota_refunds (job_id, tenant_id, period_start)
            VALUES ($1, $2, $3)
            ON CONFLICT (job_id) DO NOTHING
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(tenant.as_uuid())
        .bind(period.start())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("record_refund", e))?;

        if recorded.rows_affected() == 0 {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Ok(Refund::AlreadyRefunded);
        }

        let used: Option<i32> = sqlx::query_scalar(
            r#"
            UPDATE quota_usage
            SET used = used - 1, updated_at = NOW()
            WHERE tenant_id = $1 AND period_start = $2 AND used > 0
            RETURNING used
            "#,
        )
        .bind(tenant.as_uuid())
        .bind(period.start())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("rollback_increment", e))?;

        match used {
            Some(used) => {
                tx.commit()
                    .await
                    .map_err(|e| map_sqlx_error("commit_transaction", e))?;
                Ok(Refund::Refunded {
                    used: used.max(0) as u32,
                })
            }
            None => {
                // Keep the job refundable if usage shows up later.
                tx.rollback()
                    .await
                    .map_err(|e| map_sqlx_error("rollback", e))?;
                Ok(Refund::NothingToRefund)
            }
        }
    }

    #[instrument(skip(self), fields(tenant_id = %tenant), err)]
    async fn usage(&self, tenant: TenantId, period_start: NaiveDate) -> Result<u32, QuotaError> {
        let period = canonical(period_start);
        let used: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT SUM(used)::BIGINT FROM quota_usage
            WHERE tenant_id = $1 AND period_start >= $2 AND period_start < $3
            "#,
        )
        .bind(tenant.as_uuid())
        .bind(period.start())
        .bind(period.next().start())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("usage", e))?;

        Ok(used.map(|u| u.clamp(0, i64::from(u32::MAX)) as u32).unwrap_or(0))
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> QuotaError {
    match err {
        sqlx::Error::Database(db_err) => {
            QuotaError::Storage(format!("database error in {}: {}", operation, db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            QuotaError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => QuotaError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}
