//! Queue metrics: depth, failure and retry rates, processing-time percentiles.
//!
//! [`MetricsSnapshot::compute`] is pure. [`MetricsExporter`] samples the store
//! on an interval, logs each snapshot and keeps the latest for scraping.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use offerdesk_core::Clock;

use super::retry::to_chrono;
use super::store::{JobStats, JobStore, JobStoreError};
use super::types::{JobStatus, PdfJob};

/// Processing-time percentiles in milliseconds (nearest rank).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Percentiles {
    pub p50_ms: u64,
    pub p90_ms: u64,
    pub p99_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub at: DateTime<Utc>,
    pub stats: JobStats,
    /// Pending plus scheduled retries.
    pub queue_depth: usize,
    /// Jobs that finished in the window.
    pub finished: usize,
    /// Share of finished jobs that dead-lettered.
    pub failure_rate: f64,
    /// Share of finished jobs that needed at least one retry.
    pub retry_rate: f64,
    /// `None` when no job completed in the window.
    pub processing_time: Option<Percentiles>,
}

impl MetricsSnapshot {
    pub fn compute(stats: JobStats, finished: &[PdfJob], at: DateTime<Utc>) -> Self {
        let total = finished.len();
        let dead = finished.iter().filter(|j| j.status == JobStatus::DeadLetter).count();
        let retried = finished.iter().filter(|j| j.retry_count > 0).count();

        let mut durations: Vec<u64> = finished
            .iter()
            .filter(|j| j.status == JobStatus::Completed)
            .filter_map(|j| match (j.started_at, j.completed_at) {
                (Some(s), Some(c)) if c >= s => Some((c - s).num_milliseconds().max(0) as u64),
                _ => None,
            })
            .collect();
        durations.sort_unstable();

        let processing_time = (!durations.is_empty()).then(|| Percentiles {
            p50_ms: nearest_rank(&durations, 50),
            p90_ms: nearest_rank(&durations, 90),
            p99_ms: nearest_rank(&durations, 99),
        });

        Self {
            at,
            queue_depth: stats.queue_depth(),
            stats,
            finished: total,
            failure_rate: ratio(dead, total),
            retry_rate: ratio(retried, total),
            processing_time,
        }
    }
}

fn ratio(n: usize, d: usize) -> f64 {
    if d == 0 { 0.0 } else { n as f64 / d as f64 }
}

/// Nearest-rank percentile of a sorted, non-empty slice.
fn nearest_rank(sorted: &[u64], pct: usize) -> u64 {
    let rank = (pct * sorted.len()).div_ceil(100).max(1);
    sorted[rank.min(sorted.len()) - 1]
}

#[derive(Debug, Clone)]
pub struct MetricsConfig {
    pub interval: Duration,
    /// How far back finished jobs are considered.
    pub window: Duration,
    /// Cap on finished jobs sampled per snapshot.
    pub sample_limit: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            window: Duration::from_secs(60 * 60),
            sample_limit: 10_000,
        }
    }
}

/// Periodic exporter. Read-only against the store.
#[derive(Clone)]
pub struct MetricsExporter {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    config: MetricsConfig,
    latest: Arc<RwLock<Option<MetricsSnapshot>>>,
}

impl MetricsExporter {
    pub fn new(store: Arc<dyn JobStore>, clock: Arc<dyn Clock>, config: MetricsConfig) -> Self {
        Self {
            store,
            clock,
            config,
            latest: Arc::new(RwLock::new(None)),
        }
    }

    /// Sample the store now and remember the result.
    pub async fn collect(&self) -> Result<MetricsSnapshot, JobStoreError> {
        let now = self.clock.now();
        let stats = self.store.stats().await?;
        let finished = self
            .store
            .list_finished_since(now - to_chrono(self.config.window), self.config.sample_limit)
            .await?;

        let snapshot = MetricsSnapshot::compute(stats, &finished, now);
        if let Ok(mut latest) = self.latest.write() {
            *latest = Some(snapshot.clone());
        }
        Ok(snapshot)
    }

    /// Last collected snapshot, if any.
    pub fn latest(&self) -> Option<MetricsSnapshot> {
        self.latest.read().ok().and_then(|l| l.clone())
    }

    pub fn spawn(&self) -> MetricsHandle {
        let exporter = self.clone();
        let (shutdown, mut rx) = watch::channel(false);
        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(exporter.config.interval);
            loop {
                tokio::select! {
                    changed = rx.changed() => {
                        if changed.is_err() || *rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => match exporter.collect().await {
                        Ok(m) => info!(
                            queue_depth = m.queue_depth,
                            pending = m.stats.pending,
                            processing = m.stats.processing,
                            failed = m.stats.failed,
                            dead_letter = m.stats.dead_letter,
                            failure_rate = m.failure_rate,
                            retry_rate = m.retry_rate,
                            p50_ms = m.processing_time.map(|p| p.p50_ms),
                            p90_ms = m.processing_time.map(|p| p.p90_ms),
                            p99_ms = m.processing_time.map(|p| p.p99_ms),
                            "job queue metrics"
                        ),
                        Err(e) => error!(error = %e, "metrics collection failed"),
                    },
                }
            }
        });
        MetricsHandle { shutdown, join }
    }
}

#[derive(Debug)]
pub struct MetricsHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl MetricsHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.join.await;
    }
}
