//! Stuck-job reaper.
//!
//! Periodically returns jobs that have been `processing` for longer than the
//! timeout to `failed`, due immediately, with their retry count untouched.
//! It only uses the store's conditional transitions, so a worker finishing
//! the job concurrently simply wins.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use offerdesk_core::Clock;

use super::retry::to_chrono;
use super::store::{JobStore, JobStoreError};

#[derive(Debug, Clone)]
pub struct ReaperConfig {
    pub interval: Duration,
    /// How long a job may stay `processing` before it is considered stuck.
    pub timeout: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(10 * 60),
        }
    }
}

pub struct Reaper {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    config: ReaperConfig,
}

impl Reaper {
    pub fn new(store: Arc<dyn JobStore>, clock: Arc<dyn Clock>, config: ReaperConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// One pass. Returns the number of jobs reset.
    pub async fn sweep(&self) -> Result<usize, JobStoreError> {
        let now = self.clock.now();
        let cutoff = now - to_chrono(self.config.timeout);
        let stuck = self.store.list_stuck(now, self.config.timeout).await?;

        let mut reset = 0;
        for job in stuck {
            let reason = format!(
                "job stuck in processing since {}; reset by reaper",
                job.started_at.map(|t| t.to_rfc3339()).unwrap_or_default()
            );
            if let Some(job) = self.store.reset_stuck(job.id, cutoff, &reason, now).await? {
                warn!(job_id = %job.id, retry_count = job.retry_count, "reaped stuck job");
                reset += 1;
            }
        }
        Ok(reset)
    }

    pub fn spawn(self) -> ReaperHandle {
        let (shutdown, mut rx) = watch::channel(false);
        let join = tokio::spawn(async move {
            info!(interval_secs = self.config.interval.as_secs(), "reaper started");
            let mut ticker = tokio::time::interval(self.config.interval);
            loop {
                tokio::select! {
                    changed = rx.changed() => {
                        if changed.is_err() || *rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep().await {
                            error!(error = %e, "reaper sweep failed");
                        }
                    }
                }
            }
            info!("reaper stopped");
        });
        ReaperHandle { shutdown, join }
    }
}

#[derive(Debug)]
pub struct ReaperHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl ReaperHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.join.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::retry::RetryPolicy;
    use crate::jobs::store::InMemoryJobStore;
    use crate::jobs::types::{JobStatus, NewJob, PdfJob, RenderPayload};
    use chrono::{Duration as ChronoDuration, Utc};
    use offerdesk_core::{ManualClock, OwnerId, Tenant};

    async fn processing_job(store: &InMemoryJobStore, clock: &ManualClock) -> PdfJob {
        let job = store
            .create(PdfJob::new(
                NewJob {
                    tenant: Tenant::System,
                    owner_id: OwnerId::new(),
                    payload: RenderPayload::html("<p/>"),
                    callback_url: None,
                    max_retries: 3,
                    quota_period: None,
                },
                clock.now(),
            ))
            .await
            .unwrap();
        store.claim(job.id, clock.now()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn resets_only_jobs_past_the_timeout() {
        let store = InMemoryJobStore::arc(RetryPolicy::default());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let reaper = Reaper::new(store.clone(), clock.clone(), ReaperConfig::default());

        let old = processing_job(&store, &clock).await;
        clock.advance(ChronoDuration::minutes(6));
        let young = processing_job(&store, &clock).await;

        clock.advance(ChronoDuration::minutes(5));
        assert_eq!(reaper.sweep().await.unwrap(), 1);

        let old = store.get(old.id).await.unwrap().unwrap();
        assert_eq!(old.status, JobStatus::Failed);
        assert_eq!(old.retry_count, 0);
        assert_eq!(old.started_at, None);
        assert_eq!(old.next_retry_at, Some(clock.now()));
        assert!(old.error_message.unwrap().contains("reaper"));

        let young = store.get(young.id).await.unwrap().unwrap();
        assert_eq!(young.status, JobStatus::Processing);

        // Nothing left to do.
        assert_eq!(reaper.sweep().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn reaped_job_keeps_its_retry_budget() {
        let store = InMemoryJobStore::arc(RetryPolicy::default().with_jitter_ratio(0.0));
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let reaper = Reaper::new(store.clone(), clock.clone(), ReaperConfig::default());

        let job = processing_job(&store, &clock).await;
        clock.advance(ChronoDuration::minutes(11));
        reaper.sweep().await.unwrap();

        // Re-claim and fail: this is the first counted failure.
        store.claim(job.id, clock.now()).await.unwrap().unwrap();
        let failed = store.fail(job.id, "timeout", true, clock.now()).await.unwrap();
        assert_eq!(failed.job().retry_count, 1);
        assert_eq!(failed.job().status, JobStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_reaper_sweeps_on_interval() {
        let store = InMemoryJobStore::arc(RetryPolicy::default());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let job = processing_job(&store, &clock).await;
        clock.advance(ChronoDuration::minutes(30));

        let handle = Reaper::new(
            store.clone(),
            clock.clone(),
            ReaperConfig {
                interval: Duration::from_secs(1),
                ..ReaperConfig::default()
            },
        )
        .spawn();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        handle.shutdown().await;

        assert_eq!(store.get(job.id).await.unwrap().unwrap().status, JobStatus::Failed);
    }
}
