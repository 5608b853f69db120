//! PDF render job queue.
//!
//! ## Components
//!
//! - `JobStore`: durable job rows, claim/complete/fail transitions, DLQ and a change feed
//! - `RetryPolicy`: exponential backoff with jitter and the retry/dead-letter decision
//! - `Worker` / `WorkerPool`: claim, render, upload and notify
//! - `Reaper`: returns jobs stuck in `processing` to the queue
//! - `StatusChannel`: push + poll status updates per job
//! - `MetricsExporter`: periodic queue depth, rates and processing-time percentiles
//! - `JobService`: quota-checked admission and the read-side operations

pub mod metrics;
pub mod postgres;
pub mod reaper;
pub mod retry;
pub mod service;
pub mod status;
pub mod store;
pub mod types;
pub mod worker;

pub use metrics::{MetricsConfig, MetricsExporter, MetricsHandle, MetricsSnapshot, Percentiles};
pub use postgres::PostgresJobStore;
pub use reaper::{Reaper, ReaperConfig, ReaperHandle};
pub use retry::{JobFailure, RetryDecision, RetryPolicy, is_retryable_message};
pub use service::{
    JobReceipt, JobService, JobServiceConfig, QuotaUsage, SubmitError, SubmitRequest,
};
pub use status::{
    ChannelClose, StatusChannel, StatusChannelConfig, StatusMessage, StatusSubscription,
};
pub use store::{FailOutcome, InMemoryJobStore, JobStats, JobStore, JobStoreError};
pub use types::{
    DeadLetterEntry, JobChange, JobId, JobStatus, NewJob, PdfJob, RenderPayload, StatusSnapshot,
};
pub use worker::{
    JobOutcome, Worker, WorkerConfig, WorkerDeps, WorkerPool, WorkerPoolHandle, WorkerStats,
};
