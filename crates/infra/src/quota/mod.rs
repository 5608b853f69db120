//! Per-tenant, per-period usage quota.
//!
//! ## Semantics
//!
//! - A period is the UTC calendar month, keyed by its first day
//!   ([`QuotaPeriod`]). Any date handed to the ledger is truncated to that key.
//! - `check_and_increment` is a single conditional increment: two concurrent
//!   admissions can never both take the last slot.
//! - Rows stored under a non-canonical date inside the period (written by
//!   older clients) are folded into the canonical row before the increment.
//!   The stray row is zeroed, never deleted.
//! - `rollback_increment` refunds one credit per job, at most once, and never
//!   drives `used` below zero.

mod in_memory;
mod postgres;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Serialize;

use offerdesk_core::{JobId, QuotaPeriod, TenantId};

pub use in_memory::InMemoryQuotaLedger;
pub use postgres::PostgresQuotaLedger;

/// Result of an admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuotaDecision {
    pub allowed: bool,
    /// Usage after the attempt (unchanged when denied).
    pub used: u32,
}

/// Outcome of a refund request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refund {
    Refunded { used: u32 },
    /// This job was refunded before.
    AlreadyRefunded,
    /// Nothing to refund; usage is already zero.
    NothingToRefund,
}

/// Quota ledger error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QuotaError {
    #[error("quota storage error: {0}")]
    Storage(String),
}

/// Quota ledger abstraction.
#[async_trait]
pub trait QuotaLedger: Send + Sync + 'static {
    /// Admit one unit of work if `used < limit`, atomically.
    async fn check_and_increment(
        &self,
        tenant: TenantId,
        limit: u32,
        period_start: NaiveDate,
    ) -> Result<QuotaDecision, QuotaError>;

    /// Give back the credit consumed by `job_id`. Idempotent per job.
    async fn rollback_increment(
        &self,
        tenant: TenantId,
        period_start: NaiveDate,
        job_id: JobId,
    ) -> Result<Refund, QuotaError>;

    /// Current usage for the period containing `period_start`.
    async fn usage(&self, tenant: TenantId, period_start: NaiveDate) -> Result<u32, QuotaError>;
}

/// Canonical key for any date the caller supplies.
pub(crate) fn canonical(period_start: NaiveDate) -> QuotaPeriod {
    QuotaPeriod::from_date(period_start)
}

#[async_trait]
impl<L: QuotaLedger + ?Sized> QuotaLedger for std::sync::Arc<L> {
    async fn check_and_increment(
        &self,
        tenant: TenantId,
        limit: u32,
        period_start: NaiveDate,
    ) -> Result<QuotaDecision, QuotaError> {
        (**self).check_and_increment(tenant, limit, period_start).await
    }

    async fn rollback_increment(
        &self,
        tenant: TenantId,
        period_start: NaiveDate,
        job_id: JobId,
    ) -> Result<Refund, QuotaError> {
        (**self).rollback_increment(tenant, period_start, job_id).await
    }

    async fn usage(&self, tenant: TenantId, period_start: NaiveDate) -> Result<u32, QuotaError> {
        (**self).usage(tenant, period_start).await
    }
}
