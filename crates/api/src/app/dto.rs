use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use offerdesk_infra::jobs::{DeadLetterEntry, JobId, JobStatus, PdfJob, RenderPayload};

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct SubmitJobRequest {
    pub payload: RenderPayload,
    pub callback_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct QuotaQuery {
    /// Any date or timestamp inside the period; defaults to now.
    pub period: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<usize>,
}

// -------------------------
// Response DTOs
// -------------------------

/// Job as returned by the status endpoint. Never exposes the download token.
#[derive(Debug, Serialize)]
pub struct JobView {
    pub job_id: JobId,
    pub status: JobStatus,
    pub result_url: Option<String>,
    pub error: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<PdfJob> for JobView {
    fn from(job: PdfJob) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
            result_url: job.result_url,
            error: job.error_message,
            retry_count: job.retry_count,
            max_retries: job.max_retries,
            next_retry_at: job.next_retry_at,
            created_at: job.created_at,
            updated_at: job.updated_at,
            completed_at: job.completed_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DeadLetterView {
    pub job_id: JobId,
    pub reason: String,
    pub attempts: u32,
    pub dead_lettered_at: DateTime<Utc>,
}

impl From<DeadLetterEntry> for DeadLetterView {
    fn from(entry: DeadLetterEntry) -> Self {
        Self {
            job_id: entry.job_id,
            reason: entry.reason,
            attempts: entry.attempts,
            dead_lettered_at: entry.dead_lettered_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct QuotaView {
    pub period_start: NaiveDate,
    pub used: u32,
    pub limit: u32,
    pub remaining: u32,
}
