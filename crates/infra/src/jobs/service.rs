//! Job admission and read-side operations used by the HTTP layer.

use std::sync::Arc;

use chrono::NaiveDate;
use constant_time_eq::constant_time_eq;
use serde::Serialize;
use tracing::{info, instrument, warn};
use url::Url;

use offerdesk_core::{Clock, OwnerId, QuotaPeriod, Tenant, TenantId};

use crate::quota::{QuotaError, QuotaLedger};

use super::store::{JobStore, JobStoreError};
use super::types::{DeadLetterEntry, JobId, JobStatus, NewJob, PdfJob, RenderPayload};

/// A render request as accepted from callers.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub tenant: Tenant,
    pub owner_id: OwnerId,
    pub payload: RenderPayload,
    pub callback_url: Option<String>,
}

/// Returned immediately on admission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobReceipt {
    pub job_id: JobId,
    pub status_url: String,
    pub download_url: String,
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("quota exceeded: {used} of {limit} used this period")]
    QuotaExceeded { used: u32, limit: u32 },
    #[error("job not found")]
    NotFound,
    #[error("job is not ready: {0}")]
    NotReady(JobStatus),
    #[error("invalid download token")]
    InvalidToken,
    #[error("validation error: {0}")]
    Validation(String),
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error(transparent)]
    Quota(#[from] QuotaError),
}

#[derive(Debug, Clone)]
pub struct JobServiceConfig {
    /// Jobs admitted per tenant per period.
    pub monthly_limit: u32,
    /// Retry budget stamped onto new jobs.
    pub max_retries: u32,
    /// Prefix for the URLs in [`JobReceipt`].
    pub public_base_url: String,
}

impl Default for JobServiceConfig {
    fn default() -> Self {
        Self {
            monthly_limit: 100,
            max_retries: 3,
            public_base_url: "http://localhost:8080".to_string(),
        }
    }
}

/// Quota usage for one period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuotaUsage {
    pub period_start: NaiveDate,
    pub used: u32,
    pub limit: u32,
}

#[derive(Clone)]
pub struct JobService {
    store: Arc<dyn JobStore>,
    ledger: Arc<dyn QuotaLedger>,
    clock: Arc<dyn Clock>,
    config: JobServiceConfig,
}

impl JobService {
    pub fn new(
        store: Arc<dyn JobStore>,
        ledger: Arc<dyn QuotaLedger>,
        clock: Arc<dyn Clock>,
        config: JobServiceConfig,
    ) -> Self {
        Self {
            store,
            ledger,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &JobServiceConfig {
        &self.config
    }

    /// Admit a job. Account tenants consume one quota credit; the credit is
    /// returned if the row cannot be created.
    #[instrument(skip(self, request), fields(tenant = %request.tenant), err)]
    pub async fn submit(&self, request: SubmitRequest) -> Result<JobReceipt, SubmitError> {
        if let Some(url) = &request.callback_url {
            validate_callback_url(url)?;
        }

        let now = self.clock.now();
        let period = QuotaPeriod::containing(now);
        let metered = request.tenant.account_id();

        if let Some(tenant_id) = metered {
            let decision = self
                .ledger
                .check_and_increment(tenant_id, self.config.monthly_limit, period.start())
                .await?;
            if !decision.allowed {
                return Err(SubmitError::QuotaExceeded {
                    used: decision.used,
                    limit: self.config.monthly_limit,
                });
            }
        }

        let job = PdfJob::new(
            NewJob {
                tenant: request.tenant,
                owner_id: request.owner_id,
                payload: request.payload,
                callback_url: request.callback_url,
                max_retries: self.config.max_retries,
                quota_period: metered.map(|_| period.start()),
            },
            now,
        );
        let job_id = job.id;

        match self.store.create(job).await {
            Ok(job) => {
                info!(job_id = %job.id, "job admitted");
                Ok(self.receipt(&job))
            }
            Err(e) => {
                if let Some(tenant_id) = metered {
                    if let Err(refund) = self.ledger.rollback_increment(tenant_id, period.start(), job_id).await {
                        warn!(job_id = %job_id, error = %refund, "failed to return quota after create failure");
                    }
                }
                Err(e.into())
            }
        }
    }

    fn receipt(&self, job: &PdfJob) -> JobReceipt {
        let base = self.config.public_base_url.trim_end_matches('/');
        JobReceipt {
            job_id: job.id,
            status_url: format!("{base}/jobs/{}", job.id),
            download_url: format!("{base}/jobs/{}/download?token={}", job.id, job.download_token),
        }
    }

    /// Read a job visible to `tenant`. Other tenants' jobs are reported as missing.
    pub async fn status(&self, tenant: Tenant, job_id: JobId) -> Result<PdfJob, SubmitError> {
        match self.store.get(job_id).await? {
            Some(job) if job.tenant == tenant => Ok(job),
            _ => Err(SubmitError::NotFound),
        }
    }

    /// Resolve a download token to the artifact URL.
    pub async fn download(&self, job_id: JobId, token: &str) -> Result<String, SubmitError> {
        let job = self.store.get(job_id).await?.ok_or(SubmitError::NotFound)?;
        if !constant_time_eq(job.download_token.as_bytes(), token.as_bytes()) {
            return Err(SubmitError::InvalidToken);
        }
        match (job.status, job.result_url) {
            (JobStatus::Completed, Some(url)) => Ok(url),
            (status, _) => Err(SubmitError::NotReady(status)),
        }
    }

    pub async fn list_dead_letters(
        &self,
        tenant: Tenant,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, SubmitError> {
        Ok(self.store.list_dead_letters(tenant, limit).await?)
    }

    /// Resubmit a dead-lettered job's payload as a new job.
    ///
    /// The original row stays in `dead_letter`; the replay is admitted (and
    /// charged) like any other submission.
    pub async fn replay_dead_letter(
        &self,
        tenant: Tenant,
        owner_id: OwnerId,
        job_id: JobId,
    ) -> Result<JobReceipt, SubmitError> {
        let job = self.status(tenant, job_id).await?;
        if job.status != JobStatus::DeadLetter {
            return Err(SubmitError::NotReady(job.status));
        }
        info!(job_id = %job_id, "replaying dead-lettered job");
        self.submit(SubmitRequest {
            tenant,
            owner_id,
            payload: job.payload,
            callback_url: job.callback_url,
        })
        .await
    }

    /// Usage of the period containing `period_start`, or the current one.
    pub async fn usage(
        &self,
        tenant_id: TenantId,
        period_start: Option<NaiveDate>,
    ) -> Result<QuotaUsage, SubmitError> {
        let period = match period_start {
            Some(d) => QuotaPeriod::from_date(d),
            None => QuotaPeriod::containing(self.clock.now()),
        };
        let used = self.ledger.usage(tenant_id, period.start()).await?;
        Ok(QuotaUsage {
            period_start: period.start(),
            used,
            limit: self.config.monthly_limit,
        })
    }
}

const MAX_CALLBACK_URL_LEN: usize = 2048;

/// Callback must parse as an absolute `http`/`https` URL with a host.
fn validate_callback_url(url: &str) -> Result<(), SubmitError> {
    let invalid = |reason: &str| SubmitError::Validation(format!("invalid callback url '{url}': {reason}"));

    if url.len() > MAX_CALLBACK_URL_LEN {
        return Err(invalid("too long"));
    }
    let parsed = Url::parse(url).map_err(|e| invalid(&e.to_string()))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(invalid("scheme must be http or https"));
    }
    if parsed.host_str().is_none_or(str::is_empty) {
        return Err(invalid("missing host"));
    }
    Ok(())
}
