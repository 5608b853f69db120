//! PDF worker: claims due jobs, renders, uploads and records the outcome.
//!
//! Workers coordinate only through [`JobStore::claim`]; any number of them
//! (in one process or many) can poll the same store.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use offerdesk_core::Clock;

use crate::external::{ObjectStorage, Rasterizer, RasterizerError, StorageError, WebhookEvent, WebhookNotifier};
use crate::quota::{QuotaLedger, Refund};

use super::retry::JobFailure;
use super::store::{FailOutcome, JobStore, JobStoreError};
use super::types::{DeadLetterEntry, PdfJob};

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How often an idle worker polls for claimable jobs
    pub poll_interval: Duration,
    /// Upper bound on a single render
    pub render_timeout: Duration,
    /// Upper bound on a single upload
    pub upload_timeout: Duration,
    /// Candidates fetched per poll
    pub batch_size: usize,
    /// Name for logging
    pub name: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            render_timeout: Duration::from_secs(60),
            upload_timeout: Duration::from_secs(30),
            batch_size: 8,
            name: "pdf-worker".to_string(),
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_render_timeout(mut self, timeout: Duration) -> Self {
        self.render_timeout = timeout;
        self
    }

    pub fn with_upload_timeout(mut self, timeout: Duration) -> Self {
        self.upload_timeout = timeout;
        self
    }
}

/// Collaborators shared by every worker.
#[derive(Clone)]
pub struct WorkerDeps {
    pub store: Arc<dyn JobStore>,
    pub ledger: Arc<dyn QuotaLedger>,
    pub rasterizer: Arc<dyn Rasterizer>,
    pub storage: Arc<dyn ObjectStorage>,
    pub webhooks: Arc<dyn WebhookNotifier>,
    pub clock: Arc<dyn Clock>,
}

/// What happened to a claimed job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed(PdfJob),
    Rescheduled(PdfJob),
    DeadLettered { job: PdfJob, entry: DeadLetterEntry },
}

impl JobOutcome {
    pub fn job(&self) -> &PdfJob {
        match self {
            JobOutcome::Completed(job) | JobOutcome::Rescheduled(job) => job,
            JobOutcome::DeadLettered { job, .. } => job,
        }
    }
}

/// A single PDF worker.
#[derive(Clone)]
pub struct Worker {
    deps: WorkerDeps,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(deps: WorkerDeps, config: WorkerConfig) -> Self {
        Self { deps, config }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Claim and process at most one job. Returns `None` when nothing was claimable.
    pub async fn run_once(&self) -> Result<Option<JobOutcome>, JobStoreError> {
        let now = self.deps.clock.now();
        let candidates = self
            .deps
            .store
            .list_claimable(now, self.config.batch_size)
            .await?;

        for candidate in candidates {
            // Another worker may win the race; try the next candidate.
            if let Some(job) = self.deps.store.claim(candidate.id, self.deps.clock.now()).await? {
                debug!(worker = %self.config.name, job_id = %job.id, attempt = job.retry_count + 1, "claimed job");
                return self.process_claimed(job).await.map(Some);
            }
        }
        Ok(None)
    }

    /// Drive a job this worker has claimed to its next state.
    #[instrument(skip(self, job), fields(worker = %self.config.name, job_id = %job.id))]
    pub async fn process_claimed(&self, job: PdfJob) -> Result<JobOutcome, JobStoreError> {
        let started = Instant::now();

        match self.attempt(&job).await {
            Ok(url) => {
                let done = self
                    .deps
                    .store
                    .complete(job.id, &url, self.deps.clock.now())
                    .await?;
                info!(elapsed_ms = started.elapsed().as_millis() as u64, "job completed");
                self.notify(&done).await;
                Ok(JobOutcome::Completed(done))
            }
            Err(failure) => {
                let retryable = failure.is_retryable();
                let outcome = self
                    .deps
                    .store
                    .fail(job.id, &failure.to_string(), retryable, self.deps.clock.now())
                    .await?;

                match outcome {
                    FailOutcome::Rescheduled(job) => {
                        warn!(
                            error = %failure,
                            retry_count = job.retry_count,
                            next_retry_at = ?job.next_retry_at,
                            "job failed, retry scheduled"
                        );
                        Ok(JobOutcome::Rescheduled(job))
                    }
                    FailOutcome::DeadLettered { job, entry } => {
                        error!(error = %failure, attempts = entry.attempts, retryable, "job dead-lettered");
                        self.refund(&job).await;
                        self.notify(&job).await;
                        Ok(JobOutcome::DeadLettered { job, entry })
                    }
                }
            }
        }
    }

    /// Render and upload. The rasterizer session is released on every path.
    async fn attempt(&self, job: &PdfJob) -> Result<String, JobFailure> {
        job.payload.validate().map_err(JobFailure::Validation)?;

        let mut session = self
            .deps
            .rasterizer
            .open_session()
            .await
            .map_err(render_failure)?;
        let rendered = tokio::time::timeout(self.config.render_timeout, session.render(&job.payload)).await;
        session.close().await;

        let bytes = match rendered {
            Err(_) => return Err(JobFailure::RenderTimeout(self.config.render_timeout)),
            Ok(Err(e)) => return Err(render_failure(e)),
            Ok(Ok(bytes)) if bytes.is_empty() => {
                return Err(JobFailure::TransientRender("rasterizer returned no bytes".to_string()));
            }
            Ok(Ok(bytes)) => bytes,
        };

        match tokio::time::timeout(
            self.config.upload_timeout,
            self.deps.storage.put(&job.storage_path, bytes),
        )
        .await
        {
            Err(_) => Err(JobFailure::StorageTimeout(self.config.upload_timeout)),
            Ok(Err(e)) => Err(storage_failure(e)),
            Ok(Ok(url)) => Ok(url),
        }
    }

    /// Give back the quota credit of a dead-lettered, metered job.
    async fn refund(&self, job: &PdfJob) {
        let (Some(tenant), Some(period)) = (job.tenant.account_id(), job.quota_period) else {
            return;
        };
        match self.deps.ledger.rollback_increment(tenant, period, job.id).await {
            Ok(Refund::Refunded { used }) => debug!(tenant_id = %tenant, used, "quota refunded"),
            Ok(other) => debug!(tenant_id = %tenant, outcome = ?other, "quota refund skipped"),
            Err(e) => error!(tenant_id = %tenant, error = %e, "quota refund failed"),
        }
    }

    async fn notify(&self, job: &PdfJob) {
        let Some(url) = job.callback_url.as_deref() else {
            return;
        };
        if let Err(e) = self.deps.webhooks.notify(url, &WebhookEvent::for_job(job)).await {
            warn!(job_id = %job.id, callback_url = url, error = %e, "webhook delivery failed");
        }
    }
}

fn render_failure(e: RasterizerError) -> JobFailure {
    match e {
        RasterizerError::InvalidInput(msg) => JobFailure::Validation(msg),
        RasterizerError::TemplateNotFound(id) => JobFailure::NotFound(format!("template {id}")),
        RasterizerError::Unavailable(_) | RasterizerError::Crashed(_) => {
            JobFailure::TransientRender(e.to_string())
        }
    }
}

fn storage_failure(e: StorageError) -> JobFailure {
    JobFailure::Storage(e.to_string())
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct WorkerStats {
    pub jobs_processed: u64,
    pub jobs_completed: u64,
    pub jobs_rescheduled: u64,
    pub jobs_dead_lettered: u64,
    pub store_errors: u64,
}

impl WorkerStats {
    fn record(&mut self, outcome: &JobOutcome) {
        self.jobs_processed += 1;
        match outcome {
            JobOutcome::Completed(_) => self.jobs_completed += 1,
            JobOutcome::Rescheduled(_) => self.jobs_rescheduled += 1,
            JobOutcome::DeadLettered { .. } => self.jobs_dead_lettered += 1,
        }
    }
}

/// Handle to control a running pool.
#[derive(Debug)]
pub struct WorkerPoolHandle {
    shutdown: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerPoolHandle {
    /// Request graceful shutdown. In-flight jobs finish first.
    pub async fn shutdown(self) -> WorkerStats {
        let _ = self.shutdown.send(true);
        for join in self.joins {
            let _ = join.await;
        }
        lock_stats(&self.stats).clone()
    }

    pub fn stats(&self) -> WorkerStats {
        lock_stats(&self.stats).clone()
    }
}

fn lock_stats(stats: &Mutex<WorkerStats>) -> std::sync::MutexGuard<'_, WorkerStats> {
    stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// N independent worker tasks.
pub struct WorkerPool;

impl WorkerPool {
    pub fn spawn(worker: Worker, count: usize) -> WorkerPoolHandle {
        let (shutdown, rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(WorkerStats::default()));

        let joins = (0..count.max(1))
            .map(|i| {
                let name = format!("{}-{i}", worker.config.name);
                let worker = Worker::new(worker.deps.clone(), worker.config.clone().with_name(name));
                tokio::spawn(worker_loop(worker, rx.clone(), stats.clone()))
            })
            .collect();

        WorkerPoolHandle {
            shutdown,
            joins,
            stats,
        }
    }
}

async fn worker_loop(worker: Worker, mut shutdown: watch::Receiver<bool>, stats: Arc<Mutex<WorkerStats>>) {
    info!(worker = %worker.config.name, "worker started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let idle = match worker.run_once().await {
            Ok(Some(outcome)) => {
                lock_stats(&stats).record(&outcome);
                false
            }
            Ok(None) => true,
            Err(e) => {
                error!(worker = %worker.config.name, error = %e, "job store error");
                lock_stats(&stats).store_errors += 1;
                true
            }
        };

        if idle {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(worker.config.poll_interval) => {}
            }
        }
    }

    info!(worker = %worker.config.name, "worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::{
        InMemoryObjectStorage, RecordingWebhookNotifier, ScriptedRasterizer, ScriptedRender,
        StorageFault, WebhookError,
    };
    use crate::jobs::retry::RetryPolicy;
    use crate::jobs::store::InMemoryJobStore;
    use crate::jobs::types::{JobStatus, NewJob, RenderPayload};
    use crate::quota::InMemoryQuotaLedger;
    use chrono::Utc;
    use offerdesk_core::{OwnerId, QuotaPeriod, SystemClock, Tenant, TenantId};

    struct Harness {
        store: Arc<InMemoryJobStore>,
        ledger: Arc<InMemoryQuotaLedger>,
        rasterizer: Arc<ScriptedRasterizer>,
        storage: Arc<InMemoryObjectStorage>,
        webhooks: Arc<RecordingWebhookNotifier>,
        worker: Worker,
    }

    fn harness(script: Vec<ScriptedRender>, webhooks: RecordingWebhookNotifier) -> Harness {
        let store = InMemoryJobStore::arc(RetryPolicy::default().with_jitter_ratio(0.0));
        let ledger = Arc::new(InMemoryQuotaLedger::new());
        let rasterizer = Arc::new(ScriptedRasterizer::with_script(script));
        let storage = Arc::new(InMemoryObjectStorage::default());
        let webhooks = Arc::new(webhooks);
        let worker = Worker::new(
            WorkerDeps {
                store: store.clone(),
                ledger: ledger.clone(),
                rasterizer: rasterizer.clone(),
                storage: storage.clone(),
                webhooks: webhooks.clone(),
                clock: Arc::new(SystemClock),
            },
            WorkerConfig::default()
                .with_render_timeout(Duration::from_secs(5))
                .with_upload_timeout(Duration::from_secs(5)),
        );
        Harness {
            store,
            ledger,
            rasterizer,
            storage,
            webhooks,
            worker,
        }
    }

    async fn submit(h: &Harness, payload: RenderPayload, tenant: Tenant) -> PdfJob {
        let quota_period = tenant.account_id().map(|_| QuotaPeriod::containing(Utc::now()).start());
        if let (Some(t), Some(p)) = (tenant.account_id(), quota_period) {
            assert!(h.ledger.check_and_increment(t, 10, p).await.unwrap().allowed);
        }
        h.store
            .create(PdfJob::new(
                NewJob {
                    tenant,
                    owner_id: OwnerId::new(),
                    payload,
                    callback_url: Some("https://hooks.example.com/pdf".into()),
                    max_retries: 3,
                    quota_period,
                },
                Utc::now(),
            ))
            .await
            .unwrap()
    }

    fn assert_no_leaks(h: &Harness) {
        assert_eq!(h.rasterizer.sessions_opened(), h.rasterizer.sessions_closed());
    }

    #[tokio::test]
    async fn completes_job_and_fires_webhook() {
        let h = harness(vec![], RecordingWebhookNotifier::new());
        let job = submit(&h, RenderPayload::html("<h1>Offer</h1>"), Tenant::System).await;

        let outcome = h.worker.run_once().await.unwrap().unwrap();
        let done = match outcome {
            JobOutcome::Completed(job) => job,
            other => panic!("expected completion, got {other:?}"),
        };
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.result_url.as_deref(), Some(format!("memory://pdfs/{}", job.storage_path).as_str()));
        assert!(h.storage.get(&job.storage_path).is_some());

        let deliveries = h.webhooks.deliveries();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].1.status, JobStatus::Completed);
        assert_no_leaks(&h);

        assert!(h.worker.run_once().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn render_error_releases_session_and_reschedules() {
        let h = harness(
            vec![ScriptedRender::Fail(RasterizerError::Crashed("segfault".into()))],
            RecordingWebhookNotifier::new(),
        );
        submit(&h, RenderPayload::html("<p/>"), Tenant::System).await;

        let outcome = h.worker.run_once().await.unwrap().unwrap();
        let job = outcome.job();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retry_count, 1);
        assert!(job.last_retry_error.as_deref().unwrap().contains("segfault"));
        assert_no_leaks(&h);
        assert_eq!(h.rasterizer.sessions_opened(), 1);
        // No webhook for non-terminal states.
        assert!(h.webhooks.deliveries().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn render_timeout_releases_session() {
        let h = harness(
            vec![ScriptedRender::Hang(Duration::from_secs(600))],
            RecordingWebhookNotifier::new(),
        );
        submit(&h, RenderPayload::html("<p/>"), Tenant::System).await;

        let outcome = h.worker.run_once().await.unwrap().unwrap();
        assert_eq!(outcome.job().status, JobStatus::Failed);
        assert!(outcome.job().error_message.as_deref().unwrap().contains("timed out"));
        assert_no_leaks(&h);
    }

    #[tokio::test]
    async fn upload_failure_releases_session() {
        let h = harness(vec![], RecordingWebhookNotifier::new());
        h.storage
            .push_faults([StorageFault::Fail(StorageError::Io("connection reset".into()))]);
        submit(&h, RenderPayload::html("<p/>"), Tenant::System).await;

        let outcome = h.worker.run_once().await.unwrap().unwrap();
        assert!(matches!(outcome, JobOutcome::Rescheduled(_)));
        assert!(h.storage.is_empty());
        assert_no_leaks(&h);
    }

    #[tokio::test]
    async fn unavailable_rasterizer_opens_nothing() {
        let h = harness(
            vec![ScriptedRender::Unavailable("no browser".into())],
            RecordingWebhookNotifier::new(),
        );
        submit(&h, RenderPayload::html("<p/>"), Tenant::System).await;

        let outcome = h.worker.run_once().await.unwrap().unwrap();
        assert!(matches!(outcome, JobOutcome::Rescheduled(_)));
        assert_eq!(h.rasterizer.sessions_opened(), 0);
        assert_no_leaks(&h);
    }

    #[tokio::test]
    async fn invalid_payload_dead_letters_without_rendering_and_refunds() {
        let h = harness(vec![], RecordingWebhookNotifier::new());
        let tenant_id = TenantId::new();
        let job = submit(&h, RenderPayload::html("   "), Tenant::Account(tenant_id)).await;
        let period = job.quota_period.unwrap();
        assert_eq!(h.ledger.usage(tenant_id, period).await.unwrap(), 1);

        let outcome = h.worker.run_once().await.unwrap().unwrap();
        match &outcome {
            JobOutcome::DeadLettered { job, entry } => {
                assert_eq!(job.retry_count, 0);
                assert_eq!(entry.attempts, 1);
            }
            other => panic!("expected dead letter, got {other:?}"),
        }
        assert_eq!(h.rasterizer.sessions_opened(), 0);
        assert_eq!(h.ledger.usage(tenant_id, period).await.unwrap(), 0);

        let deliveries = h.webhooks.deliveries();
        assert_eq!(deliveries[0].1.status, JobStatus::DeadLetter);
        assert!(deliveries[0].1.error.is_some());
    }

    #[tokio::test]
    async fn invalid_document_from_rasterizer_is_not_retried() {
        let h = harness(
            vec![ScriptedRender::Fail(RasterizerError::InvalidInput("unclosed tag".into()))],
            RecordingWebhookNotifier::new(),
        );
        submit(&h, RenderPayload::html("<p>"), Tenant::System).await;

        let outcome = h.worker.run_once().await.unwrap().unwrap();
        assert!(matches!(outcome, JobOutcome::DeadLettered { .. }));
        assert_no_leaks(&h);
    }

    #[tokio::test]
    async fn webhook_failure_does_not_affect_job() {
        let h = harness(vec![], RecordingWebhookNotifier::failing(WebhookError::Status(500)));
        let job = submit(&h, RenderPayload::html("<p/>"), Tenant::System).await;

        let outcome = h.worker.run_once().await.unwrap().unwrap();
        assert!(matches!(outcome, JobOutcome::Completed(_)));
        let stored = h.store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(h.webhooks.deliveries().len(), 1);
    }

    #[tokio::test]
    async fn pool_drains_queue_and_shuts_down() {
        let h = harness(vec![], RecordingWebhookNotifier::new());
        let mut ids = Vec::new();
        for i in 0..10 {
            ids.push(submit(&h, RenderPayload::html(format!("<p>{i}</p>")), Tenant::System).await.id);
        }

        let worker = Worker::new(
            h.worker.deps.clone(),
            h.worker.config.clone().with_poll_interval(Duration::from_millis(5)),
        );
        let pool = WorkerPool::spawn(worker, 4);

        for _ in 0..400 {
            if h.store.stats().await.unwrap().completed == 10 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let stats = pool.shutdown().await;

        assert_eq!(h.store.stats().await.unwrap().completed, 10);
        assert_eq!(stats.jobs_completed, 10);
        // Each job rendered exactly once.
        for i in 0..10 {
            assert_eq!(h.rasterizer.renders_of(&format!("<p>{i}</p>")), 1);
        }
        assert_no_leaks(&h);
    }
}
