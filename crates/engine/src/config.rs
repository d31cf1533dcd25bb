//! Import configuration.

use std::path::PathBuf;
use std::time::Duration;

use idmigrate_core::JobId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::RetryStrategy;

/// Prefix of every environment variable read by [`ImportConfig::from_env`].
pub const ENV_PREFIX: &str = "IDMIGRATE_";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
    #[error("missing required setting {0}")]
    Missing(String),
}

/// Sustained request rate and burst capacity of the shared budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateConfig {
    pub rate_per_sec: u32,
    /// Bucket size; defaults to `rate_per_sec`.
    pub burst: Option<u32>,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            rate_per_sec: 50,
            burst: None,
        }
    }
}

/// How retryable row failures are re-attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts per step, the first one included.
    pub max_attempts: u32,
    /// Fixed delay used for `with_backoff` verdicts.
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 1_000,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Whether another attempt is allowed after `attempt` attempts.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay before the next attempt for a given strategy.
    pub fn delay_for(&self, strategy: RetryStrategy) -> Duration {
        match strategy {
            RetryStrategy::WithBackoff => Duration::from_millis(self.backoff_ms),
            RetryStrategy::Immediate | RetryStrategy::ManualFix => Duration::ZERO,
        }
    }
}

/// How users are attached to organizations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum OrgMode {
    /// Users only, no memberships.
    #[default]
    None,
    /// Every user joins one organization that already exists.
    Single { org_id: String },
    /// Each row names its own organization; resolved through the cache.
    PerRow { create_missing: bool },
}

/// Destination credentials. Only a hash is ever persisted.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Credentials {
    pub domain: String,
    pub api_key: String,
}

impl Credentials {
    pub fn new(domain: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            api_key: api_key.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("domain", &self.domain)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

/// The part of the configuration a worker needs, sent in `initialize`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSettings {
    pub input_path: String,
    pub org_mode: OrgMode,
    pub concurrency: usize,
    pub dry_run: bool,
    pub retry: RetryPolicy,
    pub grant_timeout_ms: u64,
}

impl WorkerSettings {
    pub fn grant_timeout(&self) -> Duration {
        Duration::from_millis(self.grant_timeout_ms)
    }
}

/// Job-control surface: everything one import run needs.
#[derive(Debug, Clone)]
pub struct ImportConfig {
    pub input_path: PathBuf,
    /// Generated when absent.
    pub job_id: Option<String>,
    pub resume: bool,
    pub workers: usize,
    pub chunk_size: u64,
    pub org_mode: OrgMode,
    /// Rows in flight at once inside one worker.
    pub concurrency: usize,
    pub dry_run: bool,
    pub checkpoint_dir: PathBuf,
    pub rate: RateConfig,
    pub grant_timeout: Duration,
    pub retry: RetryPolicy,
    pub credentials: Credentials,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            input_path: PathBuf::new(),
            job_id: None,
            resume: false,
            workers: 4,
            chunk_size: 1_000,
            org_mode: OrgMode::None,
            concurrency: 10,
            dry_run: false,
            checkpoint_dir: PathBuf::from(".idmigrate/checkpoints"),
            rate: RateConfig::default(),
            grant_timeout: Duration::from_secs(5),
            retry: RetryPolicy::default(),
            credentials: Credentials::default(),
        }
    }
}

impl ImportConfig {
    pub fn new(input_path: impl Into<PathBuf>) -> Self {
        Self {
            input_path: input_path.into(),
            ..Default::default()
        }
    }

    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_org_mode(mut self, org_mode: OrgMode) -> Self {
        self.org_mode = org_mode;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.checkpoint_dir = dir.into();
        self
    }

    pub fn with_rate(mut self, rate_per_sec: u32, burst: Option<u32>) -> Self {
        self.rate = RateConfig { rate_per_sec, burst };
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_grant_timeout(mut self, timeout: Duration) -> Self {
        self.grant_timeout = timeout;
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    /// Defaults overlaid with `IDMIGRATE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with whatever `lookup` returns for each
    /// `IDMIGRATE_*` key.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(&format!("{ENV_PREFIX}{name}"))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let mut config = Self::default();

        if let Some(v) = get("INPUT") {
            config.input_path = PathBuf::from(v);
        }
        config.job_id = get("JOB_ID");
        if let Some(v) = get("RESUME") {
            config.resume = parse_bool("RESUME", &v)?;
        }
        if let Some(v) = get("WORKERS") {
            config.workers = parse_num("WORKERS", &v)?;
        }
        if let Some(v) = get("CHUNK_SIZE") {
            config.chunk_size = parse_num("CHUNK_SIZE", &v)?;
        }
        if let Some(v) = get("CONCURRENCY") {
            config.concurrency = parse_num("CONCURRENCY", &v)?;
        }
        if let Some(v) = get("DRY_RUN") {
            config.dry_run = parse_bool("DRY_RUN", &v)?;
        }
        if let Some(v) = get("CHECKPOINT_DIR") {
            config.checkpoint_dir = PathBuf::from(v);
        }
        if let Some(v) = get("RATE_LIMIT") {
            config.rate.rate_per_sec = parse_num("RATE_LIMIT", &v)?;
        }
        if let Some(v) = get("RATE_BURST") {
            config.rate.burst = Some(parse_num("RATE_BURST", &v)?);
        }
        if let Some(v) = get("GRANT_TIMEOUT_MS") {
            config.grant_timeout = Duration::from_millis(parse_num("GRANT_TIMEOUT_MS", &v)?);
        }
        if let Some(v) = get("MAX_ATTEMPTS") {
            config.retry.max_attempts = parse_num("MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = get("BACKOFF_MS") {
            config.retry.backoff_ms = parse_num("BACKOFF_MS", &v)?;
        }

        config.org_mode = match get("ORG_MODE").as_deref() {
            None | Some("none") => OrgMode::None,
            Some("single") => OrgMode::Single {
                org_id: get("ORG_ID").ok_or_else(|| ConfigError::Missing(format!("{ENV_PREFIX}ORG_ID")))?,
            },
            Some("per_row") | Some("per-row") => OrgMode::PerRow {
                create_missing: match get("CREATE_ORGS") {
                    Some(v) => parse_bool("CREATE_ORGS", &v)?,
                    None => true,
                },
            },
            Some(other) => {
                return Err(invalid("ORG_MODE", other, "expected none, single or per_row"));
            }
        };

        if let Some(domain) = get("DOMAIN") {
            config.credentials.domain = domain;
        }
        if let Some(api_key) = get("API_KEY") {
            config.credentials.api_key = api_key;
        }

        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(invalid("WORKERS", "0", "at least one worker is required"));
        }
        if self.chunk_size == 0 {
            return Err(invalid("CHUNK_SIZE", "0", "chunk size must be positive"));
        }
        if self.concurrency == 0 {
            return Err(invalid("CONCURRENCY", "0", "concurrency must be positive"));
        }
        if self.rate.rate_per_sec == 0 {
            return Err(invalid("RATE_LIMIT", "0", "rate must be positive"));
        }
        if self.rate.burst == Some(0) {
            return Err(invalid("RATE_BURST", "0", "burst must be positive"));
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("MAX_ATTEMPTS", "0", "at least one attempt is required"));
        }
        if let Some(job_id) = &self.job_id {
            JobId::parse(job_id.as_str()).map_err(|e| invalid("JOB_ID", job_id, &e.to_string()))?;
        }
        if self.resume && self.job_id.is_none() {
            return Err(ConfigError::Missing(format!("{ENV_PREFIX}JOB_ID (required to resume)")));
        }
        if let OrgMode::Single { org_id } = &self.org_mode {
            if org_id.is_empty() {
                return Err(ConfigError::Missing(format!("{ENV_PREFIX}ORG_ID")));
            }
        }
        Ok(())
    }

    /// The configured job id, or a freshly generated one.
    pub fn job_id_or_generate(&self) -> Result<JobId, ConfigError> {
        match &self.job_id {
            Some(raw) => JobId::parse(raw.as_str()).map_err(|e| invalid("JOB_ID", raw, &e.to_string())),
            None => Ok(JobId::generate()),
        }
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            input_path: self.input_path.display().to_string(),
            org_mode: self.org_mode.clone(),
            concurrency: self.concurrency,
            dry_run: self.dry_run,
            retry: self.retry,
            grant_timeout_ms: self.grant_timeout.as_millis() as u64,
        }
    }
}

fn invalid(key: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key: format!("{ENV_PREFIX}{key}"),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(key, value, "expected a boolean")),
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| invalid(key, value, &e.to_string()))
}
