//! In-memory quota ledger for tests/dev.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::NaiveDate;
use tracing::{debug, warn};

use offerdesk_core::{JobId, QuotaPeriod, TenantId};

use super::{QuotaDecision, QuotaError, QuotaLedger, Refund, canonical};

#[derive(Debug, Default)]
struct LedgerState {
    /// Keyed by the stored date, which may be non-canonical for legacy rows.
    rows: HashMap<(TenantId, NaiveDate), u32>,
    /// Refunded jobs per canonical period. See [`LedgerState::prune_refunds`].
    refunded: HashMap<(TenantId, NaiveDate), HashSet<JobId>>,
}

impl LedgerState {
    /// Forget refund records older than the period before `current`.
    ///
    /// A job is dead-lettered at most once and within hours of admission, so
    /// a refund for a period two months back cannot arrive again.
    fn prune_refunds(&mut self, tenant: TenantId, current: QuotaPeriod) {
        let keep_from = current
            .start()
            .pred_opt()
            .map(|d| QuotaPeriod::from_date(d).start())
            .unwrap_or(current.start());
        self.refunded
            .retain(|(t, period), _| *t != tenant || *period >= keep_from);
    }

    fn was_refunded(&self, tenant: TenantId, period: QuotaPeriod, job_id: JobId) -> bool {
        self.refunded
            .get(&(tenant, period.start()))
            .is_some_and(|jobs| jobs.contains(&job_id))
    }

    /// Fold stray rows of `period` into its canonical row.
    fn migrate(&mut self, tenant: TenantId, period: QuotaPeriod) {
        let start = period.start();
        let end = period.next().start();

        let strays: Vec<NaiveDate> = self
            .rows
            .iter()
            .filter(|((t, d), used)| *t == tenant && *d > start && *d < end && **used > 0)
            .map(|((_, d), _)| *d)
            .collect();

        for date in strays {
            let moved = self.rows.insert((tenant, date), 0).unwrap_or(0);
            warn!(
                tenant_id = %tenant,
                stored_period = %date,
                canonical_period = %period,
                moved,
                "migrating non-canonical quota row"
            );
            *self.rows.entry((tenant, start)).or_insert(0) += moved;
        }
    }
}

/// Mutex-guarded ledger. The whole check-and-increment runs under one lock.
#[derive(Debug, Default)]
pub struct InMemoryQuotaLedger {
    state: Mutex<LedgerState>,
}

impl InMemoryQuotaLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a row exactly as given, bypassing normalisation. Imports legacy data.
    pub fn insert_raw(&self, tenant: TenantId, stored_period: NaiveDate, used: u32) -> Result<(), QuotaError> {
        let mut state = self.lock()?;
        state.rows.insert((tenant, stored_period), used);
        Ok(())
    }

    /// Stored value of a single row, without normalisation.
    pub fn raw(&self, tenant: TenantId, stored_period: NaiveDate) -> Option<u32> {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.rows.get(&(tenant, stored_period)).copied())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, LedgerState>, QuotaError> {
        self.state
            .lock()
            .map_err(|_| QuotaError::Storage("quota ledger lock poisoned".to_string()))
    }
}

#[async_trait]
impl QuotaLedger for InMemoryQuotaLedger {
    async fn check_and_increment(
        &self,
        tenant: TenantId,
        limit: u32,
        period_start: NaiveDate,
    ) -> Result<QuotaDecision, QuotaError> {
        let period = canonical(period_start);
        let mut state = self.lock()?;
        state.migrate(tenant, period);
        state.prune_refunds(tenant, period);

        let used = state.rows.entry((tenant, period.start())).or_insert(0);
        if *used >= limit {
            debug!(tenant_id = %tenant, period = %period, used = *used, limit, "quota exhausted");
            return Ok(QuotaDecision { allowed: false, used: *used });
        }

        *used += 1;
        Ok(QuotaDecision { allowed: true, used: *used })
    }

    async fn rollback_increment(
        &self,
        tenant: TenantId,
        period_start: NaiveDate,
        job_id: JobId,
    ) -> Result<Refund, QuotaError> {
        let period = canonical(period_start);
        let mut state = self.lock()?;
        state.migrate(tenant, period);

        if state.was_refunded(tenant, period, job_id) {
            return Ok(Refund::AlreadyRefunded);
        }

        let used = state.rows.entry((tenant, period.start())).or_insert(0);
        if *used == 0 {
            return Ok(Refund::NothingToRefund);
        }
        *used -= 1;
        let used = *used;
        state
            .refunded
            .entry((tenant, period.start()))
            .or_default()
            .insert(job_id);

        Ok(Refund::Refunded { used })
    }

    async fn usage(&self, tenant: TenantId, period_start: NaiveDate) -> Result<u32, QuotaError> {
        let period = canonical(period_start);
        let state = self.lock()?;
        let start = period.start();
        let end = period.next().start();

        // Strays count towards the period even before they are migrated.
        Ok(state
            .rows
            .iter()
            .filter(|((t, d), _)| *t == tenant && *d >= start && *d < end)
            .map(|(_, used)| *used)
            .sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[tokio::test]
    async fn admits_up_to_limit() {
        let ledger = InMemoryQuotaLedger::new();
        let tenant = TenantId::new();
        let period = date(2026, 3, 1);

        for expected in 1..=3 {
            let d = ledger.check_and_increment(tenant, 3, period).await.unwrap();
            assert!(d.allowed);
            assert_eq!(d.used, expected);
        }
        let denied = ledger.check_and_increment(tenant, 3, period).await.unwrap();
        assert_eq!(denied, QuotaDecision { allowed: false, used: 3 });
    }

    #[tokio::test]
    async fn periods_are_independent_and_normalised() {
        let ledger = InMemoryQuotaLedger::new();
        let tenant = TenantId::new();

        ledger.check_and_increment(tenant, 1, date(2026, 3, 17)).await.unwrap();
        // Any day in March is March.
        assert!(!ledger.check_and_increment(tenant, 1, date(2026, 3, 31)).await.unwrap().allowed);
        assert!(ledger.check_and_increment(tenant, 1, date(2026, 4, 1)).await.unwrap().allowed);
        assert_eq!(ledger.raw(tenant, date(2026, 3, 1)), Some(1));
    }

    #[tokio::test]
    async fn stray_rows_are_migrated_into_canonical_row() {
        let ledger = InMemoryQuotaLedger::new();
        let tenant = TenantId::new();
        ledger.insert_raw(tenant, date(2026, 3, 1), 2).unwrap();
        ledger.insert_raw(tenant, date(2026, 3, 2), 5).unwrap();
        // Neighbouring months are untouched.
        ledger.insert_raw(tenant, date(2026, 4, 2), 9).unwrap();

        assert_eq!(ledger.usage(tenant, date(2026, 3, 1)).await.unwrap(), 7);

        let d = ledger.check_and_increment(tenant, 10, date(2026, 3, 1)).await.unwrap();
        assert_eq!(d, QuotaDecision { allowed: true, used: 8 });
        assert_eq!(ledger.raw(tenant, date(2026, 3, 2)), Some(0));
        assert_eq!(ledger.raw(tenant, date(2026, 4, 2)), Some(9));
    }

    #[tokio::test]
    async fn rollback_is_idempotent_per_job_and_floored() {
        let ledger = InMemoryQuotaLedger::new();
        let tenant = TenantId::new();
        let period = date(2026, 3, 1);
        let job = JobId::new();

        ledger.check_and_increment(tenant, 5, period).await.unwrap();
        assert_eq!(
            ledger.rollback_increment(tenant, period, job).await.unwrap(),
            Refund::Refunded { used: 0 }
        );
        assert_eq!(
            ledger.rollback_increment(tenant, period, job).await.unwrap(),
            Refund::AlreadyRefunded
        );
        assert_eq!(
            ledger.rollback_increment(tenant, period, JobId::new()).await.unwrap(),
            Refund::NothingToRefund
        );
        assert_eq!(ledger.usage(tenant, period).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn refund_records_are_pruned_after_two_periods() {
        let ledger = InMemoryQuotaLedger::new();
        let tenant = TenantId::new();
        let other = TenantId::new();
        let job = JobId::new();

        for t in [tenant, other] {
            ledger.check_and_increment(t, 5, date(2026, 1, 1)).await.unwrap();
            ledger.rollback_increment(t, date(2026, 1, 1), job).await.unwrap();
        }

        // February admission keeps January's records.
        ledger.check_and_increment(tenant, 5, date(2026, 2, 10)).await.unwrap();
        assert_eq!(
            ledger.rollback_increment(tenant, date(2026, 1, 1), job).await.unwrap(),
            Refund::AlreadyRefunded
        );

        // March admission drops January's records for this tenant only.
        ledger.check_and_increment(tenant, 5, date(2026, 3, 3)).await.unwrap();
        let state = ledger.state.lock().unwrap();
        assert!(!state.was_refunded(tenant, QuotaPeriod::from_date(date(2026, 1, 1)), job));
        assert!(state.was_refunded(other, QuotaPeriod::from_date(date(2026, 1, 1)), job));
    }

    async fn race(callers: usize, limit: u32) -> (usize, u32) {
        let ledger = Arc::new(InMemoryQuotaLedger::new());
        let tenant = TenantId::new();
        let period = date(2026, 1, 1);

        let mut handles = Vec::with_capacity(callers);
        for _ in 0..callers {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger.check_and_increment(tenant, limit, period).await
            }));
        }

        let mut admitted = 0;
        for h in handles {
            if h.await.unwrap().unwrap().allowed {
                admitted += 1;
            }
        }
        (admitted, ledger.usage(tenant, period).await.unwrap())
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            ..ProptestConfig::default()
        })]

        /// Property: N concurrent callers against limit K admit exactly min(N, K).
        #[test]
        fn concurrent_admissions_never_exceed_limit(callers in 1usize..48, limit in 0u32..24) {
            let rt = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(4)
                .build()
                .unwrap();
            let (admitted, used) = rt.block_on(race(callers, limit));
            let expected = callers.min(limit as usize);
            prop_assert_eq!(admitted, expected);
            prop_assert_eq!(used as usize, expected);
        }
    }
}
