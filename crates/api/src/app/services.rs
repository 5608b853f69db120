//! Service wiring: backends, the job service and the background tasks.

use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tokio::task::JoinHandle;

use offerdesk_core::{Clock, SystemClock};
use offerdesk_infra::config::AppConfig;
use offerdesk_infra::external::{
    ChromiumRasterizer, HttpWebhookNotifier, LocalObjectStorage, ObjectStorage, Rasterizer,
    WebhookNotifier,
};
use offerdesk_infra::jobs::{
    InMemoryJobStore, JobService, JobStore, MetricsExporter, MetricsHandle, PostgresJobStore,
    Reaper, ReaperHandle, StatusChannel, Worker, WorkerDeps, WorkerPool, WorkerPoolHandle,
};
use offerdesk_infra::quota::{InMemoryQuotaLedger, PostgresQuotaLedger, QuotaLedger};

/// Storage and external collaborators the services run against.
#[derive(Clone)]
pub struct Backends {
    pub store: Arc<dyn JobStore>,
    pub ledger: Arc<dyn QuotaLedger>,
    pub rasterizer: Arc<dyn Rasterizer>,
    pub storage: Arc<dyn ObjectStorage>,
    pub webhooks: Arc<dyn WebhookNotifier>,
    pub clock: Arc<dyn Clock>,
}

/// Shared, request-facing services.
#[derive(Clone)]
pub struct AppServices {
    pub jobs: JobService,
    pub status: StatusChannel,
    pub metrics: MetricsExporter,
}

/// Handles of everything running in the background.
pub struct BackgroundTasks {
    workers: WorkerPoolHandle,
    reaper: ReaperHandle,
    metrics: MetricsHandle,
    listener: Option<JoinHandle<()>>,
}

impl BackgroundTasks {
    pub async fn shutdown(self) {
        let stats = self.workers.shutdown().await;
        tracing::info!(
            processed = stats.jobs_processed,
            completed = stats.jobs_completed,
            dead_lettered = stats.jobs_dead_lettered,
            "workers stopped"
        );
        self.reaper.shutdown().await;
        self.metrics.shutdown().await;
        if let Some(listener) = self.listener {
            listener.abort();
        }
    }
}

/// Build production backends: Postgres when `DATABASE_URL` is set, in-memory
/// otherwise. Also returns the cross-process change relay, if any.
pub async fn build_backends(config: &AppConfig) -> anyhow::Result<(Backends, Option<JoinHandle<()>>)> {
    let rasterizer: Arc<dyn Rasterizer> = Arc::new(
        ChromiumRasterizer::new(&config.chromium_path).with_templates_dir(&config.templates_dir),
    );
    let storage: Arc<dyn ObjectStorage> = Arc::new(LocalObjectStorage::new(
        &config.storage_root,
        config.storage_public_url.clone(),
    ));
    let webhooks: Arc<dyn WebhookNotifier> = Arc::new(
        HttpWebhookNotifier::new(config.webhook_timeout).context("failed to build webhook client")?,
    );
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let Some(database_url) = config.database_url.as_deref() else {
        tracing::warn!("DATABASE_URL not set; jobs and quota are kept in memory");
        let backends = Backends {
            store: InMemoryJobStore::arc(config.retry_policy()),
            ledger: Arc::new(InMemoryQuotaLedger::new()),
            rasterizer,
            storage,
            webhooks,
            clock,
        };
        return Ok((backends, None));
    };

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .context("failed to connect to Postgres")?;

    let store = PostgresJobStore::new(pool.clone(), config.retry_policy());
    store.ensure_schema().await.context("failed to create job tables")?;
    let ledger = PostgresQuotaLedger::new(pool);
    ledger.ensure_schema().await.context("failed to create quota tables")?;
    let listener = store.listen().await.context("failed to listen for job changes")?;

    let backends = Backends {
        store: Arc::new(store),
        ledger: Arc::new(ledger),
        rasterizer,
        storage,
        webhooks,
        clock,
    };
    Ok((backends, Some(listener)))
}

/// Wire services over `backends` and start workers, reaper and metrics.
pub fn start(
    config: &AppConfig,
    backends: Backends,
    listener: Option<JoinHandle<()>>,
) -> (Arc<AppServices>, BackgroundTasks) {
    let jobs = JobService::new(
        backends.store.clone(),
        backends.ledger.clone(),
        backends.clock.clone(),
        config.service_config(),
    );
    let status = StatusChannel::new(backends.store.clone(), config.status_config());
    let metrics = MetricsExporter::new(
        backends.store.clone(),
        backends.clock.clone(),
        config.metrics_config(),
    );

    let worker = Worker::new(
        WorkerDeps {
            store: backends.store.clone(),
            ledger: backends.ledger,
            rasterizer: backends.rasterizer,
            storage: backends.storage,
            webhooks: backends.webhooks,
            clock: backends.clock.clone(),
        },
        config.worker_config(),
    );
    let workers = WorkerPool::spawn(worker, config.worker_count);
    let reaper = Reaper::new(backends.store, backends.clock, config.reaper_config()).spawn();
    let metrics_handle = metrics.spawn();

    let services = Arc::new(AppServices {
        jobs,
        status,
        metrics,
    });
    let tasks = BackgroundTasks {
        workers,
        reaper,
        metrics: metrics_handle,
        listener,
    };
    (services, tasks)
}
