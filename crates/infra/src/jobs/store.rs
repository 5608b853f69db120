//! Job storage: the transition API and an in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use offerdesk_core::Tenant;

use super::retry::{RetryPolicy, to_chrono};
use super::types::{DeadLetterEntry, JobChange, JobId, JobStatus, PdfJob};

/// Capacity of the change-notification channel. Slow observers lag and fall
/// back to polling.
pub(crate) const CHANGE_FEED_CAPACITY: usize = 1024;

/// Job store abstraction.
///
/// Rows are mutated only through these transitions. Each one is atomic with
/// respect to concurrent callers: `claim` in particular succeeds for exactly
/// one caller per claimable row.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Insert a new `pending` job.
    async fn create(&self, job: PdfJob) -> Result<PdfJob, JobStoreError>;

    async fn get(&self, job_id: JobId) -> Result<Option<PdfJob>, JobStoreError>;

    /// `pending | due failed → processing`. Returns `None` if the job is not
    /// claimable (already claimed, not yet due, terminal or missing).
    async fn claim(&self, job_id: JobId, now: DateTime<Utc>) -> Result<Option<PdfJob>, JobStoreError>;

    /// `processing → completed`.
    async fn complete(
        &self,
        job_id: JobId,
        result_url: &str,
        now: DateTime<Utc>,
    ) -> Result<PdfJob, JobStoreError>;

    /// `processing → failed | dead_letter`, decided by the store's retry policy.
    async fn fail(
        &self,
        job_id: JobId,
        error: &str,
        retryable: bool,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome, JobStoreError>;

    /// `processing → failed` for a job claimed at or before `started_before`.
    /// Returns `None` if the job moved on in the meantime.
    async fn reset_stuck(
        &self,
        job_id: JobId,
        started_before: DateTime<Utc>,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<PdfJob>, JobStoreError>;

    /// Pending and due failed jobs, oldest first.
    async fn list_claimable(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<PdfJob>, JobStoreError>;

    /// Failed jobs whose `next_retry_at` has passed, oldest first.
    async fn list_ready_for_retry(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PdfJob>, JobStoreError>;

    /// Jobs `processing` for longer than `timeout`.
    async fn list_stuck(&self, now: DateTime<Utc>, timeout: Duration) -> Result<Vec<PdfJob>, JobStoreError>;

    /// Jobs that reached a terminal status at or after `since`.
    async fn list_finished_since(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PdfJob>, JobStoreError>;

    async fn list_dead_letters(
        &self,
        tenant: Tenant,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, JobStoreError>;

    /// Counts per status.
    async fn stats(&self) -> Result<JobStats, JobStoreError>;

    /// Subscribe to transition notifications.
    fn subscribe(&self) -> broadcast::Receiver<JobChange>;

    fn retry_policy(&self) -> &RetryPolicy;
}

/// Result of [`JobStore::fail`].
#[derive(Debug, Clone, PartialEq)]
pub enum FailOutcome {
    Rescheduled(PdfJob),
    DeadLettered { job: PdfJob, entry: DeadLetterEntry },
}

impl FailOutcome {
    pub fn job(&self) -> &PdfJob {
        match self {
            FailOutcome::Rescheduled(job) => job,
            FailOutcome::DeadLettered { job, .. } => job,
        }
    }
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("job {job_id} cannot {action} from status {from}")]
    InvalidTransition {
        job_id: JobId,
        from: JobStatus,
        action: &'static str,
    },
    #[error("storage error: {0}")]
    Storage(String),
}

impl JobStoreError {
    fn poisoned() -> Self {
        Self::Storage("job store lock poisoned".to_string())
    }
}

/// Job statistics (queue depth per status).
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub dead_letter: usize,
}

impl JobStats {
    pub fn record(&mut self, status: JobStatus) {
        self.add(status, 1);
    }

    pub fn add(&mut self, status: JobStatus, n: usize) {
        let slot = match status {
            JobStatus::Pending => &mut self.pending,
            JobStatus::Processing => &mut self.processing,
            JobStatus::Completed => &mut self.completed,
            JobStatus::Failed => &mut self.failed,
            JobStatus::DeadLetter => &mut self.dead_letter,
        };
        *slot += n;
    }

    /// Jobs waiting for a worker (pending plus scheduled retries).
    pub fn queue_depth(&self) -> usize {
        self.pending + self.failed
    }
}

/// In-memory job store for tests/dev.
#[derive(Debug)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, PdfJob>>,
    dead_letters: RwLock<Vec<DeadLetterEntry>>,
    policy: RetryPolicy,
    changes: broadcast::Sender<JobChange>,
}

impl InMemoryJobStore {
    pub fn new(policy: RetryPolicy) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            jobs: RwLock::new(HashMap::new()),
            dead_letters: RwLock::new(Vec::new()),
            policy,
            changes,
        }
    }

    pub fn arc(policy: RetryPolicy) -> Arc<Self> {
        Arc::new(Self::new(policy))
    }

    fn publish(&self, job: &PdfJob) {
        // No subscribers is fine.
        let _ = self.changes.send(JobChange::of(job));
    }

    /// Apply `f` to a row and publish the new state, both under the write
    /// lock so notifications for one job leave in revision order.
    fn transition<T>(
        &self,
        job_id: JobId,
        f: impl FnOnce(&mut PdfJob) -> Result<T, JobStoreError>,
    ) -> Result<(T, PdfJob), JobStoreError> {
        let mut jobs = self.jobs.write().map_err(|_| JobStoreError::poisoned())?;
        let job = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        let out = f(job)?;
        self.publish(job);
        Ok((out, job.clone()))
    }

    fn select(
        &self,
        limit: usize,
        filter: impl Fn(&PdfJob) -> bool,
        order: impl Fn(&PdfJob) -> DateTime<Utc>,
    ) -> Result<Vec<PdfJob>, JobStoreError> {
        let jobs = self.jobs.read().map_err(|_| JobStoreError::poisoned())?;
        let mut result: Vec<_> = jobs.values().filter(|j| filter(j)).cloned().collect();
        result.sort_by_key(|j| (order(j), j.id));
        result.truncate(limit);
        Ok(result)
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
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
impl JobStore for InMemoryJobStore {
    async fn create(&self, job: PdfJob) -> Result<PdfJob, JobStoreError> {
        let mut jobs = self.jobs.write().map_err(|_| JobStoreError::poisoned())?;
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        jobs.insert(job.id, job.clone());
        self.publish(&job);
        Ok(job)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<PdfJob>, JobStoreError> {
        let jobs = self.jobs.read().map_err(|_| JobStoreError::poisoned())?;
        Ok(jobs.get(&job_id).cloned())
    }

    async fn claim(&self, job_id: JobId, now: DateTime<Utc>) -> Result<Option<PdfJob>, JobStoreError> {
        let mut jobs = self.jobs.write().map_err(|_| JobStoreError::poisoned())?;
        match jobs.get_mut(&job_id) {
            Some(job) if job.is_claimable(now) => {
                job.mark_processing(now);
                self.publish(job);
                Ok(Some(job.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn complete(
        &self,
        job_id: JobId,
        result_url: &str,
        now: DateTime<Utc>,
    ) -> Result<PdfJob, JobStoreError> {
        let ((), job) = self.transition(job_id, |job| {
            require_processing(job, "complete")?;
            job.mark_completed(result_url, now);
            Ok(())
        })?;
        Ok(job)
    }

    async fn fail(
        &self,
        job_id: JobId,
        error: &str,
        retryable: bool,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome, JobStoreError> {
        let policy = &self.policy;
        let (entry, job) = self.transition(job_id, |job| {
            require_processing(job, "fail")?;
            Ok(job.mark_failed(error, retryable, policy, now))
        })?;

        match entry {
            Some(entry) => {
                self.dead_letters
                    .write()
                    .map_err(|_| JobStoreError::poisoned())?
                    .push(entry.clone());
                Ok(FailOutcome::DeadLettered { job, entry })
            }
            None => Ok(FailOutcome::Rescheduled(job)),
        }
    }

    async fn reset_stuck(
        &self,
        job_id: JobId,
        started_before: DateTime<Utc>,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<PdfJob>, JobStoreError> {
        let mut jobs = self.jobs.write().map_err(|_| JobStoreError::poisoned())?;
        match jobs.get_mut(&job_id) {
            Some(job) if job.is_stuck(started_before) => {
                job.mark_reaped(reason, now);
                self.publish(job);
                Ok(Some(job.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn list_claimable(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<PdfJob>, JobStoreError> {
        self.select(limit, |j| j.is_claimable(now), |j| j.next_retry_at.unwrap_or(j.created_at))
    }

    async fn list_ready_for_retry(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PdfJob>, JobStoreError> {
        self.select(
            limit,
            |j| j.is_ready_for_retry(now),
            |j| j.next_retry_at.unwrap_or(j.created_at),
        )
    }

    async fn list_stuck(&self, now: DateTime<Utc>, timeout: Duration) -> Result<Vec<PdfJob>, JobStoreError> {
        let cutoff = now - to_chrono(timeout);
        self.select(usize::MAX, |j| j.is_stuck(cutoff), |j| j.started_at.unwrap_or(j.created_at))
    }

    async fn list_finished_since(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PdfJob>, JobStoreError> {
        self.select(
            limit,
            |j| j.status.is_terminal() && j.updated_at >= since,
            |j| j.updated_at,
        )
    }

    async fn list_dead_letters(
        &self,
        tenant: Tenant,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, JobStoreError> {
        let dls = self.dead_letters.read().map_err(|_| JobStoreError::poisoned())?;
        Ok(dls
            .iter()
            .filter(|e| e.tenant == tenant)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let jobs = self.jobs.read().map_err(|_| JobStoreError::poisoned())?;
        let mut stats = JobStats::default();
        for job in jobs.values() {
            stats.record(job.status);
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

#[async_trait]
impl<S: JobStore + ?Sized> JobStore for Arc<S> {
    async fn create(&self, job: PdfJob) -> Result<PdfJob, JobStoreError> {
        (**self).create(job).await
    }

    async fn get(&self, job_id: JobId) -> Result<Option<PdfJob>, JobStoreError> {
        (**self).get(job_id).await
    }

    async fn claim(&self, job_id: JobId, now: DateTime<Utc>) -> Result<Option<PdfJob>, JobStoreError> {
        (**self).claim(job_id, now).await
    }

    async fn complete(
        &self,
        job_id: JobId,
        result_url: &str,
        now: DateTime<Utc>,
    ) -> Result<PdfJob, JobStoreError> {
        (**self).complete(job_id, result_url, now).await
    }

    async fn fail(
        &self,
        job_id: JobId,
        error: &str,
        retryable: bool,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome, JobStoreError> {
        (**self).fail(job_id, error, retryable, now).await
    }

    async fn reset_stuck(
        &self,
        job_id: JobId,
        started_before: DateTime<Utc>,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<PdfJob>, JobStoreError> {
        (**self).reset_stuck(job_id, started_before, reason, now).await
    }

    async fn list_claimable(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<PdfJob>, JobStoreError> {
        (**self).list_claimable(now, limit).await
    }

    async fn list_ready_for_retry(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PdfJob>, JobStoreError> {
        (**self).list_ready_for_retry(now, limit).await
    }

    async fn list_stuck(&self, now: DateTime<Utc>, timeout: Duration) -> Result<Vec<PdfJob>, JobStoreError> {
        (**self).list_stuck(now, timeout).await
    }

    async fn list_finished_since(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PdfJob>, JobStoreError> {
        (**self).list_finished_since(since, limit).await
    }

    async fn list_dead_letters(
        &self,
        tenant: Tenant,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, JobStoreError> {
        (**self).list_dead_letters(tenant, limit).await
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        (**self).stats().await
    }

    fn subscribe(&self) -> broadcast::Receiver<JobChange> {
        (**self).subscribe()
    }

    fn retry_policy(&self) -> &RetryPolicy {
        (**self).retry_policy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::{NewJob, RenderPayload};
    use chrono::Duration as ChronoDuration;
    use offerdesk_core::{OwnerId, TenantId};

    fn test_job(tenant: Tenant) -> PdfJob {
        PdfJob::new(
            NewJob {
                tenant,
                owner_id: OwnerId::new(),
                payload: RenderPayload::html("<p>offer</p>"),
                callback_url: None,
                max_retries: 3,
                quota_period: None,
            },
            Utc::now(),
        )
    }

    fn store() -> InMemoryJobStore {
        InMemoryJobStore::new(RetryPolicy::default().with_jitter_ratio(0.0))
    }

    #[tokio::test]
    async fn create_and_claim() {
        let store = store();
        let job = store.create(test_job(Tenant::System)).await.unwrap();
        let now = Utc::now();

        let claimed = store.claim(job.id, now).await.unwrap().unwrap();
        assert_eq!(claimed.status, JobStatus::Processing);
        assert_eq!(claimed.started_at, Some(now));

        // Already claimed.
        assert!(store.claim(job.id, now).await.unwrap().is_none());
        assert!(store.list_claimable(now, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_create_is_rejected() {
        let store = store();
        let job = store.create(test_job(Tenant::System)).await.unwrap();
        assert!(matches!(
            store.create(job.clone()).await,
            Err(JobStoreError::AlreadyExists(id)) if id == job.id
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_have_exactly_one_winner() {
        let store = Arc::new(store());
        let job = store.create(test_job(Tenant::System)).await.unwrap();
        let now = Utc::now();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.claim(job.id, now).await }));
        }

        let mut winners = 0;
        for h in handles {
            if h.await.unwrap().unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn complete_requires_processing() {
        let store = store();
        let job = store.create(test_job(Tenant::System)).await.unwrap();

        let err = store.complete(job.id, "u", Utc::now()).await.unwrap_err();
        assert!(matches!(
            err,
            JobStoreError::InvalidTransition { from: JobStatus::Pending, action: "complete", .. }
        ));
    }

    #[tokio::test]
    async fn failed_job_becomes_claimable_when_due() {
        let store = store();
        let job = store.create(test_job(Tenant::System)).await.unwrap();
        let now = Utc::now();
        store.claim(job.id, now).await.unwrap();

        let outcome = store.fail(job.id, "timeout", true, now).await.unwrap();
        let failed = match outcome {
            FailOutcome::Rescheduled(job) => job,
            other => panic!("expected reschedule, got {other:?}"),
        };
        let due = failed.next_retry_at.unwrap();

        assert!(store.list_ready_for_retry(now, 10).await.unwrap().is_empty());
        assert!(store.claim(job.id, now).await.unwrap().is_none());

        let ready = store.list_ready_for_retry(due, 10).await.unwrap();
        assert_eq!(ready.len(), 1);
        assert!(store.claim(job.id, due).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn dead_letter_is_terminal_and_recorded_once() {
        let store = store();
        let tenant = Tenant::Account(TenantId::new());
        let job = store.create(test_job(tenant)).await.unwrap();
        let now = Utc::now();
        store.claim(job.id, now).await.unwrap();

        let outcome = store
            .fail(job.id, "validation failed: bad html", false, now)
            .await
            .unwrap();
        assert!(matches!(outcome, FailOutcome::DeadLettered { .. }));

        // A second fail cannot dead-letter again.
        assert!(matches!(
            store.fail(job.id, "again", false, now).await,
            Err(JobStoreError::InvalidTransition { from: JobStatus::DeadLetter, .. })
        ));
        assert!(store.claim(job.id, now + ChronoDuration::days(1)).await.unwrap().is_none());

        let dls = store.list_dead_letters(tenant, 10).await.unwrap();
        assert_eq!(dls.len(), 1);
        assert_eq!(dls[0].job_id, job.id);
        assert!(store.list_dead_letters(Tenant::System, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stuck_listing_and_reset() {
        let store = store();
        let job = store.create(test_job(Tenant::System)).await.unwrap();
        let started = Utc::now();
        store.claim(job.id, started).await.unwrap();

        let timeout = Duration::from_secs(600);
        assert!(store.list_stuck(started + ChronoDuration::minutes(5), timeout).await.unwrap().is_empty());

        let later = started + ChronoDuration::minutes(11);
        let stuck = store.list_stuck(later, timeout).await.unwrap();
        assert_eq!(stuck.len(), 1);

        let reset = store
            .reset_stuck(job.id, later - ChronoDuration::minutes(10), "stuck", later)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reset.status, JobStatus::Failed);
        assert_eq!(reset.retry_count, 0);

        // Second reset is a no-op.
        assert!(store.reset_stuck(job.id, later, "stuck", later).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn transitions_are_published_in_revision_order() {
        let store = store();
        let mut feed = store.subscribe();
        let job = store.create(test_job(Tenant::System)).await.unwrap();
        let now = Utc::now();
        store.claim(job.id, now).await.unwrap();
        store.complete(job.id, "https://cdn/x.pdf", now).await.unwrap();

        let revisions: Vec<u64> = (0..3).map(|_| feed.try_recv().unwrap().revision).collect();
        assert_eq!(revisions, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn stats_tracking() {
        let store = store();
        let now = Utc::now();
        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(store.create(test_job(Tenant::System)).await.unwrap().id);
        }
        store.claim(ids[0], now).await.unwrap();
        store.claim(ids[1], now).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.pending, 3);
        assert_eq!(stats.processing, 2);
        assert_eq!(stats.queue_depth(), 3);
    }
}
