//! Live per-job status feed.
//!
//! Each subscription runs one task that layers two sources:
//!
//! - the store's change feed filtered to the job (low latency), and
//! - a fixed-interval poll of the row (covers missed or lagged notifications).
//!
//! Both paths go through the same compare-and-emit step keyed on the row
//! `revision`, so a transition seen by both is emitted once and an older
//! snapshot never overwrites a newer one. The task sends a heartbeat after
//! each idle interval and ends on a terminal status, the overall deadline,
//! or when the receiver is dropped. The subscription and timers are locals of
//! that task and are dropped with it on every exit.
//!
//! With [`StatusChannel::open`] the snapshot current at subscription time is
//! not emitted unless it is already terminal. [`StatusChannel::open_after`]
//! starts from a snapshot the caller already delivered and emits anything
//! newer, including changes made between the caller's read and the task's.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, Sleep};
use tracing::{debug, warn};

use super::store::JobStore;
use super::types::{JobChange, JobId, PdfJob, StatusSnapshot};

#[derive(Debug, Clone)]
pub struct StatusChannelConfig {
    pub poll_interval: Duration,
    /// Idle time after which a heartbeat is sent.
    pub heartbeat_interval: Duration,
    /// Overall lifetime of a subscription.
    pub max_duration: Duration,
    /// Messages buffered for a slow reader.
    pub buffer: usize,
}

impl Default for StatusChannelConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(30),
            max_duration: Duration::from_secs(5 * 60),
            buffer: 16,
        }
    }
}

/// Message delivered to a status observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusMessage {
    Update(StatusSnapshot),
    Heartbeat,
}

/// Why a subscription ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelClose {
    Terminal,
    Timeout,
    Disconnected,
    NotFound,
}

/// An open subscription.
#[derive(Debug)]
pub struct StatusSubscription {
    pub messages: mpsc::Receiver<StatusMessage>,
    pub task: JoinHandle<ChannelClose>,
}

#[derive(Clone)]
pub struct StatusChannel {
    store: Arc<dyn JobStore>,
    config: StatusChannelConfig,
}

impl StatusChannel {
    pub fn new(store: Arc<dyn JobStore>, config: StatusChannelConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &StatusChannelConfig {
        &self.config
    }

    /// Open a feed for `job_id`. Dropping `messages` ends the task.
    pub fn open(&self, job_id: JobId) -> StatusSubscription {
        self.spawn(job_id, None)
    }

    /// Open a feed continuing from `seen`, a row the caller already reported.
    pub fn open_after(&self, seen: &PdfJob) -> StatusSubscription {
        self.spawn(seen.id, Some((seen.revision, seen.snapshot())))
    }

    fn spawn(&self, job_id: JobId, seen: Option<(u64, StatusSnapshot)>) -> StatusSubscription {
        let (tx, messages) = mpsc::channel(self.config.buffer.max(1));
        // Subscribe before the row is read so no transition falls in between.
        let changes = self.store.subscribe();
        let task = tokio::spawn(run(
            self.store.clone(),
            self.config.clone(),
            job_id,
            seen,
            changes,
            tx,
        ));
        StatusSubscription { messages, task }
    }
}

struct Observer {
    tx: mpsc::Sender<StatusMessage>,
    last: StatusSnapshot,
    last_revision: u64,
    heartbeat: Pin<Box<Sleep>>,
    heartbeat_interval: Duration,
}

enum Step {
    Continue,
    Close(ChannelClose),
}

impl Observer {
    fn new(
        tx: mpsc::Sender<StatusMessage>,
        revision: u64,
        snapshot: StatusSnapshot,
        config: &StatusChannelConfig,
    ) -> Self {
        Self {
            tx,
            last: snapshot,
            last_revision: revision,
            heartbeat: Box::pin(tokio::time::sleep(config.heartbeat_interval)),
            heartbeat_interval: config.heartbeat_interval,
        }
    }

    /// Emit `snapshot` if it is newer than and different from the last one.
    async fn consider(&mut self, revision: u64, snapshot: StatusSnapshot) -> Step {
        if revision <= self.last_revision {
            return Step::Continue;
        }
        self.last_revision = revision;

        if !snapshot.same_state(&self.last) {
            self.last = snapshot.clone();
            if self.tx.send(StatusMessage::Update(snapshot)).await.is_err() {
                return Step::Close(ChannelClose::Disconnected);
            }
            self.reset_heartbeat();
        }

        if self.last.status.is_terminal() {
            Step::Close(ChannelClose::Terminal)
        } else {
            Step::Continue
        }
    }

    async fn beat(&mut self) -> Step {
        self.reset_heartbeat();
        if self.tx.send(StatusMessage::Heartbeat).await.is_err() {
            return Step::Close(ChannelClose::Disconnected);
        }
        Step::Continue
    }

    fn reset_heartbeat(&mut self) {
        self.heartbeat
            .as_mut()
            .reset(Instant::now() + self.heartbeat_interval);
    }
}

async fn run(
    store: Arc<dyn JobStore>,
    config: StatusChannelConfig,
    job_id: JobId,
    seen: Option<(u64, StatusSnapshot)>,
    changes: broadcast::Receiver<JobChange>,
    tx: mpsc::Sender<StatusMessage>,
) -> ChannelClose {
    let initial = match store.get(job_id).await {
        Ok(Some(job)) => job,
        Ok(None) => return ChannelClose::NotFound,
        Err(e) => {
            warn!(job_id = %job_id, error = %e, "status channel could not load job");
            return ChannelClose::NotFound;
        }
    };

    let mut observer = match seen {
        Some((revision, snapshot)) => Observer::new(tx, revision, snapshot, &config),
        None if initial.status.is_terminal() => {
            let _ = tx.send(StatusMessage::Update(initial.snapshot())).await;
            return ChannelClose::Terminal;
        }
        None => Observer::new(tx, initial.revision, initial.snapshot(), &config),
    };

    // Catch up on whatever changed since the caller's read.
    if let Step::Close(reason) = observer.consider(initial.revision, initial.snapshot()).await {
        return reason;
    }
    observe(store, config, job_id, changes, observer).await
}

async fn observe(
    store: Arc<dyn JobStore>,
    config: StatusChannelConfig,
    job_id: JobId,
    changes: broadcast::Receiver<JobChange>,
    mut observer: Observer,
) -> ChannelClose {
    let mut changes = Some(changes);

    let deadline = tokio::time::sleep(config.max_duration);
    tokio::pin!(deadline);

    let mut poll = tokio::time::interval_at(Instant::now() + config.poll_interval, config.poll_interval);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let close = loop {
        let step = tokio::select! {
            biased;

            _ = observer.tx.closed() => Step::Close(ChannelClose::Disconnected),
            _ = &mut deadline => Step::Close(ChannelClose::Timeout),
            change = recv_change(&mut changes) => match change {
                Ok(change) if change.job_id == job_id => {
                    observer.consider(change.revision, change.snapshot).await
                }
                Ok(_) => Step::Continue,
                Err(RecvError::Lagged(skipped)) => {
                    debug!(job_id = %job_id, skipped, "status channel lagged, polling");
                    poll_row(&*store, job_id, &mut observer).await
                }
                Err(RecvError::Closed) => {
                    changes = None;
                    Step::Continue
                }
            },
            _ = poll.tick() => poll_row(&*store, job_id, &mut observer).await,
            _ = &mut observer.heartbeat => observer.beat().await,
        };

        if let Step::Close(reason) = step {
            break reason;
        }
    };

    debug!(job_id = %job_id, reason = ?close, "status channel closed");
    close
}

/// Next notification, or pending forever once the feed is gone.
async fn recv_change(
    changes: &mut Option<broadcast::Receiver<JobChange>>,
) -> Result<JobChange, RecvError> {
    match changes {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn poll_row(store: &dyn JobStore, job_id: JobId, observer: &mut Observer) -> Step {
    match store.get(job_id).await {
        Ok(Some(job)) => observer.consider(job.revision, job.snapshot()).await,
        Ok(None) => Step::Close(ChannelClose::NotFound),
        Err(e) => {
            warn!(job_id = %job_id, error = %e, "status poll failed");
            Step::Continue
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::retry::RetryPolicy;
    use crate::jobs::store::InMemoryJobStore;
    use crate::jobs::types::{JobStatus, NewJob, PdfJob, RenderPayload};
    use chrono::Utc;
    use offerdesk_core::{OwnerId, Tenant};

    async fn pending_job(store: &InMemoryJobStore) -> PdfJob {
        store
            .create(PdfJob::new(
                NewJob {
                    tenant: Tenant::System,
                    owner_id: OwnerId::new(),
                    payload: RenderPayload::html("<p/>"),
                    callback_url: None,
                    max_retries: 3,
                    quota_period: None,
                },
                Utc::now(),
            ))
            .await
            .unwrap()
    }

    fn channel(store: &Arc<InMemoryJobStore>, config: StatusChannelConfig) -> StatusChannel {
        StatusChannel::new(store.clone(), config)
    }

    #[tokio::test]
    async fn unknown_job_closes_immediately() {
        let store = InMemoryJobStore::arc(RetryPolicy::default());
        let mut sub = channel(&store, StatusChannelConfig::default()).open(JobId::new());
        assert_eq!(sub.task.await.unwrap(), ChannelClose::NotFound);
        assert!(sub.messages.recv().await.is_none());
    }

    #[tokio::test]
    async fn terminal_job_emits_once_and_closes() {
        let store = InMemoryJobStore::arc(RetryPolicy::default());
        let job = pending_job(&store).await;
        store.claim(job.id, Utc::now()).await.unwrap();
        store.complete(job.id, "https://cdn/a.pdf", Utc::now()).await.unwrap();

        let mut sub = channel(&store, StatusChannelConfig::default()).open(job.id);
        match sub.messages.recv().await {
            Some(StatusMessage::Update(s)) => assert_eq!(s.status, JobStatus::Completed),
            other => panic!("unexpected {other:?}"),
        }
        assert!(sub.messages.recv().await.is_none());
        assert_eq!(sub.task.await.unwrap(), ChannelClose::Terminal);
    }

    #[tokio::test]
    async fn pushes_each_transition_once_then_closes() {
        let store = InMemoryJobStore::arc(RetryPolicy::default().with_jitter_ratio(0.0));
        let job = pending_job(&store).await;
        let now = Utc::now();
        store.claim(job.id, now).await.unwrap();

        let mut sub = channel(&store, StatusChannelConfig::default()).open(job.id);
        // Let the task subscribe and read the initial row.
        tokio::task::yield_now().await;

        store.fail(job.id, "timeout", true, now).await.unwrap();
        let due = store.get(job.id).await.unwrap().unwrap().next_retry_at.unwrap();
        store.claim(job.id, due).await.unwrap().unwrap();
        store.complete(job.id, "https://cdn/b.pdf", due).await.unwrap();

        let mut statuses = Vec::new();
        while let Some(msg) = sub.messages.recv().await {
            if let StatusMessage::Update(s) = msg {
                statuses.push(s.status);
            }
        }
        assert_eq!(
            statuses,
            vec![JobStatus::Failed, JobStatus::Processing, JobStatus::Completed]
        );
        assert_eq!(sub.task.await.unwrap(), ChannelClose::Terminal);
    }

    #[tokio::test]
    async fn open_after_catches_up_from_the_callers_snapshot() {
        let store = InMemoryJobStore::arc(RetryPolicy::default());
        let seen = pending_job(&store).await;
        // Changes after the caller's read but before the feed opens.
        let now = Utc::now();
        store.claim(seen.id, now).await.unwrap();

        let mut sub = channel(&store, StatusChannelConfig::default()).open_after(&seen);
        match sub.messages.recv().await {
            Some(StatusMessage::Update(s)) => assert_eq!(s.status, JobStatus::Processing),
            other => panic!("unexpected {other:?}"),
        }

        store.complete(seen.id, "https://cdn/c.pdf", now).await.unwrap();
        match sub.messages.recv().await {
            Some(StatusMessage::Update(s)) => assert_eq!(s.status, JobStatus::Completed),
            other => panic!("unexpected {other:?}"),
        }
        assert!(sub.messages.recv().await.is_none());
        assert_eq!(sub.task.await.unwrap(), ChannelClose::Terminal);
    }

    #[tokio::test]
    async fn open_after_an_unchanged_row_emits_nothing_first() {
        let store = InMemoryJobStore::arc(RetryPolicy::default());
        let seen = pending_job(&store).await;

        let mut sub = channel(&store, StatusChannelConfig::default()).open_after(&seen);
        tokio::task::yield_now().await;
        assert!(sub.messages.try_recv().is_err());

        store.claim(seen.id, Utc::now()).await.unwrap();
        match sub.messages.recv().await {
            Some(StatusMessage::Update(s)) => assert_eq!(s.status, JobStatus::Processing),
            other => panic!("unexpected {other:?}"),
        }
        drop(sub.messages);
        assert_eq!(sub.task.await.unwrap(), ChannelClose::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeats_while_idle_then_times_out() {
        let store = InMemoryJobStore::arc(RetryPolicy::default());
        let job = pending_job(&store).await;

        let config = StatusChannelConfig {
            heartbeat_interval: Duration::from_secs(30),
            max_duration: Duration::from_secs(95),
            ..StatusChannelConfig::default()
        };
        let mut sub = channel(&store, config).open(job.id);

        let mut heartbeats = 0;
        while let Some(msg) = sub.messages.recv().await {
            assert_eq!(msg, StatusMessage::Heartbeat);
            heartbeats += 1;
        }
        assert_eq!(heartbeats, 3);
        assert_eq!(sub.task.await.unwrap(), ChannelClose::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_receiver_ends_the_task() {
        let store = InMemoryJobStore::arc(RetryPolicy::default());
        let job = pending_job(&store).await;

        let sub = channel(&store, StatusChannelConfig::default()).open(job.id);
        tokio::task::yield_now().await;
        drop(sub.messages);

        assert_eq!(sub.task.await.unwrap(), ChannelClose::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_emits_changes_missed_by_the_feed() {
        let store = InMemoryJobStore::arc(RetryPolicy::default());
        let job = pending_job(&store).await;
        let job_id = job.id;
        let observer_store = store.clone();

        let config = StatusChannelConfig {
            poll_interval: Duration::from_secs(2),
            ..StatusChannelConfig::default()
        };
        let (tx, mut messages) = mpsc::channel(4);
        let task = tokio::spawn(async move {
            let mut obs = Observer {
                tx,
                last: job.snapshot(),
                last_revision: job.revision,
                heartbeat: Box::pin(tokio::time::sleep(config.heartbeat_interval)),
                heartbeat_interval: config.heartbeat_interval,
            };
            // No feed here: the row changes and only polls observe it.
            tokio::time::sleep(config.poll_interval).await;
            poll_row(&*observer_store, job_id, &mut obs).await;
            poll_row(&*observer_store, job_id, &mut obs).await;
        });

        store.claim(job_id, Utc::now()).await.unwrap();
        task.await.unwrap();

        match messages.recv().await {
            Some(StatusMessage::Update(s)) => assert_eq!(s.status, JobStatus::Processing),
            other => panic!("unexpected {other:?}"),
        }
        // The second poll saw the same revision and emitted nothing.
        assert!(messages.try_recv().is_err());
    }
}
