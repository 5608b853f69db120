//! Core PDF job types and lifecycle transitions.
//!
//! `PdfJob` rows are only ever mutated through the `mark_*` transitions below,
//! so every store backend enforces the same invariants:
//!
//! - `retry_count <= max_retries`
//! - `result_url` is set iff `status == Completed`
//! - `next_retry_at` is set iff `status == Failed`
//! - `DeadLetter` is terminal and entered at most once
//! - `id` and `storage_path` never change

use chrono::{DateTime, NaiveDate, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use offerdesk_core::{OwnerId, Tenant};

pub use offerdesk_core::JobId;

use super::retry::{RetryDecision, RetryPolicy};

/// Upper bound on an inline payload accepted by the worker.
pub const MAX_PAYLOAD_BYTES: usize = 5 * 1024 * 1024;

/// Job lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, waiting to be claimed
    Pending,
    /// Claimed by exactly one worker
    Processing,
    /// PDF produced and uploaded
    Completed,
    /// Attempt failed, retry scheduled at `next_retry_at`
    Failed,
    /// Quarantined for operator inspection
    DeadLetter,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::DeadLetter)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::DeadLetter => "dead_letter",
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "dead_letter" => Ok(JobStatus::DeadLetter),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Document input handed to the rasterizer. Opaque to the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RenderPayload {
    /// Fully rendered HTML document.
    Html { html: String },
    /// Reference to a stored template plus its data.
    Template {
        template_id: String,
        #[serde(default)]
        data: serde_json::Value,
    },
}

impl RenderPayload {
    pub fn html(html: impl Into<String>) -> Self {
        Self::Html { html: html.into() }
    }

    /// Structural checks done before any rasterizer resource is acquired.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            RenderPayload::Html { html } => {
                if html.trim().is_empty() {
                    return Err("html payload is empty".to_string());
                }
                if html.len() > MAX_PAYLOAD_BYTES {
                    return Err(format!(
                        "html payload is {} bytes (limit {MAX_PAYLOAD_BYTES})",
                        html.len()
                    ));
                }
                Ok(())
            }
            RenderPayload::Template { template_id, .. } => {
                if template_id.trim().is_empty() {
                    return Err("template id is empty".to_string());
                }
                Ok(())
            }
        }
    }
}

/// Everything needed to create a job row.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub tenant: Tenant,
    pub owner_id: OwnerId,
    pub payload: RenderPayload,
    pub callback_url: Option<String>,
    pub max_retries: u32,
    /// Quota period the job was admitted under (`None` for unmetered jobs).
    pub quota_period: Option<NaiveDate>,
}

/// A PDF generation job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PdfJob {
    pub id: JobId,
    pub tenant: Tenant,
    pub owner_id: OwnerId,
    pub status: JobStatus,
    pub payload: RenderPayload,
    /// Destination key of the produced artifact.
    pub storage_path: String,
    pub result_url: Option<String>,
    pub error_message: Option<String>,
    pub last_retry_error: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub callback_url: Option<String>,
    pub download_token: String,
    pub quota_period: Option<NaiveDate>,
    /// Bumped on every transition; orders change notifications.
    pub revision: u64,
}

impl PdfJob {
    /// Create a new `pending` job.
    pub fn new(job: NewJob, now: DateTime<Utc>) -> Self {
        let id = JobId::new();
        Self {
            id,
            storage_path: storage_path_for(&job.tenant, job.owner_id, id),
            tenant: job.tenant,
            owner_id: job.owner_id,
            status: JobStatus::Pending,
            payload: job.payload,
            result_url: None,
            error_message: None,
            last_retry_error: None,
            retry_count: 0,
            max_retries: job.max_retries,
            next_retry_at: None,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
            callback_url: job.callback_url,
            download_token: generate_download_token(),
            quota_period: job.quota_period,
            revision: 1,
        }
    }

    /// Whether a worker may claim this job at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            JobStatus::Pending => true,
            JobStatus::Failed => self.next_retry_at.is_some_and(|at| at <= now),
            _ => false,
        }
    }

    pub fn is_ready_for_retry(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Failed && self.is_claimable(now)
    }

    /// Whether this job has been `processing` since before `cutoff`.
    pub fn is_stuck(&self, cutoff: DateTime<Utc>) -> bool {
        self.status == JobStatus::Processing && self.started_at.is_some_and(|at| at <= cutoff)
    }

    /// `pending|failed → processing`.
    pub fn mark_processing(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Processing;
        self.started_at = Some(now);
        self.next_retry_at = None;
        self.touch(now);
    }

    /// `processing → completed`.
    pub fn mark_completed(&mut self, result_url: impl Into<String>, now: DateTime<Utc>) {
        self.status = JobStatus::Completed;
        self.result_url = Some(result_url.into());
        self.error_message = None;
        self.next_retry_at = None;
        self.completed_at = Some(now);
        self.touch(now);
    }

    /// `processing → failed | dead_letter`, as decided by the retry policy.
    ///
    /// Returns the dead-letter entry when the job was quarantined.
    pub fn mark_failed(
        &mut self,
        error: &str,
        retryable: bool,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Option<DeadLetterEntry> {
        self.last_retry_error = Some(error.to_string());

        match policy.decide(self.retry_count, self.max_retries, retryable, error, now) {
            RetryDecision::Reschedule {
                retry_count,
                next_retry_at,
            } => {
                self.status = JobStatus::Failed;
                self.retry_count = retry_count.min(self.max_retries);
                self.next_retry_at = Some(next_retry_at);
                self.started_at = None;
                self.error_message = Some(error.to_string());
                self.touch(now);
                None
            }
            RetryDecision::DeadLetter { attempts, reason } => {
                self.status = JobStatus::DeadLetter;
                self.next_retry_at = None;
                self.started_at = None;
                self.completed_at = Some(now);
                self.error_message = Some(reason.clone());
                self.touch(now);
                Some(DeadLetterEntry {
                    job_id: self.id,
                    tenant: self.tenant,
                    reason,
                    attempts,
                    dead_lettered_at: now,
                })
            }
        }
    }

    /// `processing → failed` for a job whose worker went away.
    ///
    /// The retry count is left alone; the job is immediately claimable.
    pub fn mark_reaped(&mut self, reason: &str, now: DateTime<Utc>) {
        self.status = JobStatus::Failed;
        self.started_at = None;
        self.next_retry_at = Some(now);
        self.error_message = Some(reason.to_string());
        self.touch(now);
    }

    /// Status view shared by the polling and streaming endpoints.
    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            status: self.status,
            result_url: self.result_url.clone(),
            error: self.error_message.clone(),
            timestamp: self.updated_at,
        }
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
        self.revision += 1;
    }
}

fn storage_path_for(tenant: &Tenant, owner_id: OwnerId, id: JobId) -> String {
    format!("{}/{}/{}.pdf", tenant.storage_segment(), owner_id, id)
}

/// 32 random bytes from the OS RNG, hex encoded.
pub fn generate_download_token() -> String {
    let mut buf = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    hex::encode(buf)
}

/// What a status observer sees.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub status: JobStatus,
    pub result_url: Option<String>,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl StatusSnapshot {
    /// Same observable state, ignoring the timestamp.
    pub fn same_state(&self, other: &StatusSnapshot) -> bool {
        self.status == other.status
            && self.result_url == other.result_url
            && self.error == other.error
    }
}

/// Notification published on every job transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobChange {
    pub job_id: JobId,
    pub revision: u64,
    pub snapshot: StatusSnapshot,
}

impl JobChange {
    pub fn of(job: &PdfJob) -> Self {
        Self {
            job_id: job.id,
            revision: job.revision,
            snapshot: job.snapshot(),
        }
    }
}

/// Entry in the dead-letter queue. Append-only, never read by workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub job_id: JobId,
    pub tenant: Tenant,
    pub reason: String,
    pub attempts: u32,
    pub dead_lettered_at: DateTime<Utc>,
}
