//! Configuration loading and representation.
//!
//! Everything comes from environment variables. Missing variables fall back
//! to defaults; present but unparseable ones are an error.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::jobs::{
    JobServiceConfig, MetricsConfig, ReaperConfig, RetryPolicy, StatusChannelConfig, WorkerConfig,
};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key}: cannot parse '{value}': {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub jwt_secret: Option<String>,
    /// Postgres backends when set, in-memory otherwise.
    pub database_url: Option<String>,
    pub public_base_url: String,
    pub quota_monthly_limit: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub retry_max_retries: u32,
    pub retry_jitter_ratio: f64,
    pub worker_count: usize,
    pub worker_poll_interval: Duration,
    pub render_timeout: Duration,
    pub upload_timeout: Duration,
    pub reaper_interval: Duration,
    pub reaper_timeout: Duration,
    pub status_poll_interval: Duration,
    pub status_heartbeat: Duration,
    pub status_max_duration: Duration,
    pub metrics_interval: Duration,
    pub metrics_window: Duration,
    pub storage_root: PathBuf,
    pub storage_public_url: String,
    pub chromium_path: String,
    pub templates_dir: PathBuf,
    pub webhook_timeout: Duration,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(&lookup);

        let public_base_url = env
            .string("PUBLIC_BASE_URL")
            .unwrap_or_else(|| "http://localhost:8080".to_string());
        let storage_public_url = env
            .string("STORAGE_PUBLIC_URL")
            .unwrap_or_else(|| format!("{}/files", public_base_url.trim_end_matches('/')));

        Ok(Self {
            bind_addr: env.parse("BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 8080)))?,
            jwt_secret: env.string("JWT_SECRET"),
            database_url: env.string("DATABASE_URL"),
            public_base_url,
            quota_monthly_limit: env.parse("QUOTA_MONTHLY_LIMIT", 100)?,
            retry_base_delay: env.secs("RETRY_BASE_DELAY_SECS", 60)?,
            retry_max_delay: env.secs("RETRY_MAX_DELAY_SECS", 3600)?,
            retry_max_retries: env.parse("RETRY_MAX_RETRIES", 3)?,
            retry_jitter_ratio: env.parse("RETRY_JITTER_RATIO", 0.2)?,
            worker_count: env.parse("WORKER_COUNT", 2)?,
            worker_poll_interval: env.millis("WORKER_POLL_INTERVAL_MS", 1000)?,
            render_timeout: env.secs("RENDER_TIMEOUT_SECS", 60)?,
            upload_timeout: env.secs("UPLOAD_TIMEOUT_SECS", 30)?,
            reaper_interval: env.secs("REAPER_INTERVAL_SECS", 60)?,
            reaper_timeout: Duration::from_secs(env.parse::<u64>("REAPER_TIMEOUT_MINUTES", 10)? * 60),
            status_poll_interval: env.millis("STATUS_POLL_INTERVAL_MS", 2000)?,
            status_heartbeat: env.secs("STATUS_HEARTBEAT_SECS", 30)?,
            status_max_duration: env.secs("STATUS_MAX_DURATION_SECS", 300)?,
            metrics_interval: env.secs("METRICS_INTERVAL_SECS", 60)?,
            metrics_window: Duration::from_secs(env.parse::<u64>("METRICS_WINDOW_MINUTES", 60)? * 60),
            storage_root: env.parse("STORAGE_ROOT", PathBuf::from("./data/pdfs"))?,
            storage_public_url,
            chromium_path: env.string("CHROMIUM_PATH").unwrap_or_else(|| "chromium".to_string()),
            templates_dir: env.parse("TEMPLATES_DIR", PathBuf::from("./templates"))?,
            webhook_timeout: env.secs("WEBHOOK_TIMEOUT_SECS", 10)?,
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(self.retry_max_retries, self.retry_base_delay, self.retry_max_delay)
            .with_jitter_ratio(self.retry_jitter_ratio)
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig::default()
            .with_poll_interval(self.worker_poll_interval)
            .with_render_timeout(self.render_timeout)
            .with_upload_timeout(self.upload_timeout)
    }

    pub fn reaper_config(&self) -> ReaperConfig {
        ReaperConfig {
            interval: self.reaper_interval,
            timeout: self.reaper_timeout,
        }
    }

    pub fn status_config(&self) -> StatusChannelConfig {
        StatusChannelConfig {
            poll_interval: self.status_poll_interval,
            heartbeat_interval: self.status_heartbeat,
            max_duration: self.status_max_duration,
            ..StatusChannelConfig::default()
        }
    }

    pub fn metrics_config(&self) -> MetricsConfig {
        MetricsConfig {
            interval: self.metrics_interval,
            window: self.metrics_window,
            ..MetricsConfig::default()
        }
    }

    pub fn service_config(&self) -> JobServiceConfig {
        JobServiceConfig {
            monthly_limit: self.quota_monthly_limit,
            max_retries: self.retry_max_retries,
            public_base_url: self.public_base_url.clone(),
        }
    }
}

struct Env<'a, F>(&'a F);

impl<F> Env<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.string(key) {
            None => Ok(default),
            Some(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
                key,
                reason: e.to_string(),
                value,
            }),
        }
    }

    fn secs(&self, key: &'static str, default: u64) -> Result<Duration, ConfigError> {
        self.parse(key, default).map(Duration::from_secs)
    }

    fn millis(&self, key: &'static str, default: u64) -> Result<Duration, ConfigError> {
        self.parse(key, default).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let cfg = load(&[]).unwrap();
        assert_eq!(cfg.bind_addr.port(), 8080);
        assert_eq!(cfg.database_url, None);
        assert_eq!(cfg.quota_monthly_limit, 100);
        assert_eq!(cfg.reaper_timeout, Duration::from_secs(600));
        assert_eq!(cfg.storage_public_url, "http://localhost:8080/files");

        let policy = cfg.retry_policy();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.base_delay, Duration::from_secs(60));
        assert_eq!(policy.jitter_ratio, 0.2);
    }

    #[test]
    fn overrides_are_parsed() {
        let cfg = load(&[
            ("QUOTA_MONTHLY_LIMIT", "5"),
            ("WORKER_POLL_INTERVAL_MS", "250"),
            ("DATABASE_URL", "postgres://localhost/offerdesk"),
            ("PUBLIC_BASE_URL", "https://pdf.example.com/"),
            ("RETRY_JITTER_RATIO", "0"),
        ])
        .unwrap();
        assert_eq!(cfg.quota_monthly_limit, 5);
        assert_eq!(cfg.worker_config().poll_interval, Duration::from_millis(250));
        assert_eq!(cfg.database_url.as_deref(), Some("postgres://localhost/offerdesk"));
        assert_eq!(cfg.storage_public_url, "https://pdf.example.com/files");
        assert_eq!(cfg.service_config().monthly_limit, 5);
        assert_eq!(cfg.retry_policy().jitter_ratio, 0.0);
    }

    #[test]
    fn blank_values_count_as_unset() {
        let cfg = load(&[("DATABASE_URL", "  "), ("JWT_SECRET", "")]).unwrap();
        assert_eq!(cfg.database_url, None);
        assert_eq!(cfg.jwt_secret, None);
    }

    #[test]
    fn garbage_is_rejected() {
        let err = load(&[("WORKER_COUNT", "many")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "WORKER_COUNT", .. }));
        assert!(load(&[("BIND_ADDR", "not-an-addr")]).is_err());
    }
}
