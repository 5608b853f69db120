//! Outbound terminal-state webhooks. Best effort: failures are reported to
//! the caller for logging and never affect the job.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::jobs::types::{JobId, JobStatus, PdfJob};

/// Body POSTed to the job's callback URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub job_id: JobId,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WebhookEvent {
    pub fn for_job(job: &PdfJob) -> Self {
        let completed = job.status == JobStatus::Completed;
        Self {
            job_id: job.id,
            status: job.status,
            result_url: if completed { job.result_url.clone() } else { None },
            error: if completed { None } else { job.error_message.clone() },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WebhookError {
    #[error("webhook request failed: {0}")]
    Transport(String),
    #[error("webhook endpoint returned {0}")]
    Status(u16),
}

#[async_trait]
pub trait WebhookNotifier: Send + Sync + 'static {
    async fn notify(&self, url: &str, event: &WebhookEvent) -> Result<(), WebhookError>;
}

/// `reqwest`-based notifier with a per-request timeout.
#[derive(Debug, Clone)]
pub struct HttpWebhookNotifier {
    client: reqwest::Client,
}

impl HttpWebhookNotifier {
    pub fn new(timeout: Duration) -> Result<Self, WebhookError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| WebhookError::Transport(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl WebhookNotifier for HttpWebhookNotifier {
    async fn notify(&self, url: &str, event: &WebhookEvent) -> Result<(), WebhookError> {
        let resp = self
            .client
            .post(url)
            .json(event)
            .send()
            .await
            .map_err(|e| WebhookError::Transport(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(WebhookError::Status(resp.status().as_u16()));
        }
        Ok(())
    }
}

/// Notifier that records deliveries; optionally fails all of them.
#[derive(Debug, Default)]
pub struct RecordingWebhookNotifier {
    delivered: Mutex<Vec<(String, WebhookEvent)>>,
    fail_with: Option<WebhookError>,
}

impl RecordingWebhookNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(error: WebhookError) -> Self {
        Self {
            delivered: Mutex::new(Vec::new()),
            fail_with: Some(error),
        }
    }

    pub fn deliveries(&self) -> Vec<(String, WebhookEvent)> {
        self.delivered.lock().map(|d| d.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl WebhookNotifier for RecordingWebhookNotifier {
    async fn notify(&self, url: &str, event: &WebhookEvent) -> Result<(), WebhookError> {
        if let Ok(mut d) = self.delivered.lock() {
            d.push((url.to_string(), event.clone()));
        }
        match &self.fail_with {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::{NewJob, RenderPayload};
    use chrono::Utc;
    use offerdesk_core::{OwnerId, Tenant};

    #[test]
    fn completed_event_carries_url_only() {
        let now = Utc::now();
        let mut job = PdfJob::new(
            NewJob {
                tenant: Tenant::System,
                owner_id: OwnerId::new(),
                payload: RenderPayload::html("<p/>"),
                callback_url: Some("https://hooks.example.com".into()),
                max_retries: 3,
                quota_period: None,
            },
            now,
        );
        job.mark_processing(now);
        job.mark_completed("https://cdn/x.pdf", now);

        let json = serde_json::to_value(WebhookEvent::for_job(&job)).unwrap();
        assert_eq!(json["status"], "completed");
        assert_eq!(json["result_url"], "https://cdn/x.pdf");
        assert!(json.get("error").is_none());
    }
}
