//! Pipeline configuration.
//!
//! This module provides configuration options for the scoring pipeline:
//! the endpoint pool, scoring client, retry policy, database connection,
//! queue lease, failure policy and progress reporting.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::scoring::{
    Credentials, EndpointSource, EvaluationOptions, RetryPolicy, DEFAULT_PER_ENDPOINT_CONCURRENCY,
    DEFAULT_PORT_BASE, DEFAULT_REQUEST_TIMEOUT,
};
use crate::storage::{DatabaseOptions, DbRetryPolicy, FailurePolicy};

/// Upper bound on attempts per record.
pub const MAX_ATTEMPTS_LIMIT: u32 = 20;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration for one pipeline process.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    // Endpoint pool
    /// Where endpoint URLs come from.
    pub endpoints: EndpointSource,
    /// In-flight requests allowed per endpoint.
    pub per_endpoint_concurrency: usize,

    // Scoring client
    pub credentials: Credentials,
    pub evaluation: EvaluationOptions,
    /// Per-attempt request timeout.
    pub request_timeout: Duration,
    /// Attempts per record, including the first.
    pub max_attempts: u32,
    pub retry_base_delay: Duration,
    pub retry_multiplier: f64,

    // Dispatch
    /// Entries claimed per cycle; `None` means the pool's total capacity.
    pub batch_size: Option<usize>,
    /// Stop after this many batches.
    pub max_batches: Option<u64>,
    /// Claims older than this are reclaimable.
    pub lease_timeout: Duration,
    pub failure_policy: FailurePolicy,

    // Storage
    /// PostgreSQL connection URL.
    pub database_url: String,
    pub db_min_connections: u32,
    pub db_max_connections: u32,
    pub db_connect_timeout: Duration,
    /// Attempts for a database operation hitting transient errors.
    pub db_write_retries: u32,
    /// Linear backoff step between database retries.
    pub db_retry_delay: Duration,

    // Progress
    pub progress_interval: Duration,
    /// Re-query the remaining count after this many processed records.
    pub remaining_refresh_every: u64,
    /// Prometheus textfile rewritten after every batch.
    pub metrics_file: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            endpoints: EndpointSource::local(1, DEFAULT_PORT_BASE),
            per_endpoint_concurrency: DEFAULT_PER_ENDPOINT_CONCURRENCY,

            credentials: Credentials::default(),
            evaluation: EvaluationOptions::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_attempts: 3,
            retry_base_delay: Duration::from_secs(2),
            retry_multiplier: 2.0,

            batch_size: None,
            max_batches: None,
            lease_timeout: Duration::from_secs(900), // 15 minutes
            failure_policy: FailurePolicy::Skip,

            database_url: String::new(),
            db_min_connections: 2,
            db_max_connections: 10,
            db_connect_timeout: Duration::from_secs(10),
            db_write_retries: 5,
            db_retry_delay: Duration::from_secs(1),

            progress_interval: Duration::from_secs(30),
            remaining_refresh_every: 1000,
            metrics_file: None,
        }
    }
}

impl PipelineConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a validated configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `DATABASE_URL`: PostgreSQL connection URL (required)
    /// - `FUJI_ENDPOINTS`: Comma-separated endpoint URLs; overrides the template
    /// - `FUJI_ENDPOINT_TEMPLATE`: URL template with `{index}` / `{port}`
    /// - `FUJI_HOST_MODE`: `local` (default) or `docker`
    /// - `FUJI_ENDPOINT_COUNT`: Number of endpoints (default: 1)
    /// - `FUJI_PORT_BASE`: Port of the first local endpoint (default: 54001)
    /// - `FUJI_CONCURRENCY`: In-flight requests per endpoint (default: 3)
    /// - `FUJI_USERNAME` / `FUJI_PASSWORD`: Basic-auth credentials
    /// - `FUJI_METRIC_VERSION`: FUJI metric version (default: metrics_v0.5)
    /// - `FUJI_BATCH_SIZE`: Entries per batch (default: pool capacity)
    /// - `FUJI_MAX_ATTEMPTS`: Attempts per record (default: 3)
    /// - `FUJI_RETRY_BASE_DELAY_SECS`: First retry delay (default: 2)
    /// - `FUJI_RETRY_MULTIPLIER`: Backoff multiplier (default: 2.0)
    /// - `FUJI_REQUEST_TIMEOUT_SECS`: Request timeout (default: 60)
    /// - `FUJI_LEASE_TIMEOUT_SECS`: Claim lease (default: 900)
    /// - `FUJI_FAILURE_POLICY`: `skip` (default) or `mark-failed`
    /// - `FUJI_DB_MIN_CONNECTIONS` / `FUJI_DB_MAX_CONNECTIONS`: Pool size (default: 2/10)
    /// - `FUJI_DB_CONNECT_TIMEOUT_SECS`: Connect timeout (default: 10)
    /// - `FUJI_DB_WRITE_RETRIES`: Database attempts per operation (default: 5)
    /// - `FUJI_PROGRESS_INTERVAL_SECS`: Progress interval (default: 30)
    /// - `FUJI_METRICS_FILE`: Prometheus textfile path
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if required variables are missing or have invalid values.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self::load_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Reads environment variables over the defaults without validating,
    /// so callers can layer further overrides first.
    pub fn load_env() -> Result<Self, ConfigError> {
        Self::load_from(|key| std::env::var(key).ok())
    }

    fn load_from<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        // Endpoint pool
        let count: usize = match lookup("FUJI_ENDPOINT_COUNT") {
            Some(val) => parse_env_value(&val, "FUJI_ENDPOINT_COUNT")?,
            None => 1,
        };
        let port_base: u16 = match lookup("FUJI_PORT_BASE") {
            Some(val) => parse_env_value(&val, "FUJI_PORT_BASE")?,
            None => DEFAULT_PORT_BASE,
        };
        let mode = lookup("FUJI_HOST_MODE").unwrap_or_else(|| "local".to_string());
        config.endpoints = endpoint_source(
            lookup("FUJI_ENDPOINTS").as_deref(),
            lookup("FUJI_ENDPOINT_TEMPLATE"),
            &mode,
            count,
            port_base,
        )?;

        if let Some(val) = lookup("FUJI_CONCURRENCY") {
            config.per_endpoint_concurrency = parse_env_value(&val, "FUJI_CONCURRENCY")?;
        }

        // Scoring client
        if let Some(val) = lookup("FUJI_USERNAME") {
            config.credentials.username = val;
        }

        if let Some(val) = lookup("FUJI_PASSWORD") {
            config.credentials.password = val;
        }

        if let Some(val) = lookup("FUJI_METRIC_VERSION") {
            config.evaluation = config.evaluation.with_metric_version(val);
        }

        if let Some(val) = lookup("FUJI_REQUEST_TIMEOUT_SECS") {
            config.request_timeout = parse_secs(&val, "FUJI_REQUEST_TIMEOUT_SECS")?;
        }

        if let Some(val) = lookup("FUJI_MAX_ATTEMPTS") {
            config.max_attempts = parse_env_value(&val, "FUJI_MAX_ATTEMPTS")?;
        }

        if let Some(val) = lookup("FUJI_RETRY_BASE_DELAY_SECS") {
            config.retry_base_delay = parse_secs(&val, "FUJI_RETRY_BASE_DELAY_SECS")?;
        }

        if let Some(val) = lookup("FUJI_RETRY_MULTIPLIER") {
            config.retry_multiplier = parse_env_value(&val, "FUJI_RETRY_MULTIPLIER")?;
        }

        // Dispatch
        if let Some(val) = lookup("FUJI_BATCH_SIZE") {
            config.batch_size = Some(parse_env_value(&val, "FUJI_BATCH_SIZE")?);
        }

        if let Some(val) = lookup("FUJI_LEASE_TIMEOUT_SECS") {
            config.lease_timeout = parse_secs(&val, "FUJI_LEASE_TIMEOUT_SECS")?;
        }

        if let Some(val) = lookup("FUJI_FAILURE_POLICY") {
            config.failure_policy = parse_env_value(&val, "FUJI_FAILURE_POLICY")?;
        }

        // Storage settings
        if let Some(val) = lookup("DATABASE_URL") {
            config.database_url = val;
        }

        if let Some(val) = lookup("FUJI_DB_MIN_CONNECTIONS") {
            config.db_min_connections = parse_env_value(&val, "FUJI_DB_MIN_CONNECTIONS")?;
        }

        if let Some(val) = lookup("FUJI_DB_MAX_CONNECTIONS") {
            config.db_max_connections = parse_env_value(&val, "FUJI_DB_MAX_CONNECTIONS")?;
        }

        if let Some(val) = lookup("FUJI_DB_CONNECT_TIMEOUT_SECS") {
            config.db_connect_timeout = parse_secs(&val, "FUJI_DB_CONNECT_TIMEOUT_SECS")?;
        }

        if let Some(val) = lookup("FUJI_DB_WRITE_RETRIES") {
            config.db_write_retries = parse_env_value(&val, "FUJI_DB_WRITE_RETRIES")?;
        }

        // Progress
        if let Some(val) = lookup("FUJI_PROGRESS_INTERVAL_SECS") {
            config.progress_interval = parse_secs(&val, "FUJI_PROGRESS_INTERVAL_SECS")?;
        }

        if let Some(val) = lookup("FUJI_METRICS_FILE") {
            config.metrics_file = Some(PathBuf::from(val));
        }

        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingEnvVar` when no database URL is set and
    /// `ConfigError::ValidationFailed` if any other value is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Storage validation
        if self.database_url.trim().is_empty() {
            return Err(ConfigError::MissingEnvVar("DATABASE_URL".to_string()));
        }

        if self.db_max_connections == 0 {
            return Err(ConfigError::ValidationFailed(
                "db_max_connections must be greater than 0".to_string(),
            ));
        }

        if self.db_min_connections > self.db_max_connections {
            return Err(ConfigError::ValidationFailed(
                "db_min_connections cannot exceed db_max_connections".to_string(),
            ));
        }

        if self.db_write_retries == 0 {
            return Err(ConfigError::ValidationFailed(
                "db_write_retries must be greater than 0".to_string(),
            ));
        }

        // Endpoint validation
        let urls = self.endpoints.urls();
        if urls.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "at least one endpoint is required".to_string(),
            ));
        }

        if let Some(bad) = urls
            .iter()
            .find(|u| !(u.starts_with("http://") || u.starts_with("https://")))
        {
            return Err(ConfigError::ValidationFailed(format!(
                "endpoint '{}' is not an http(s) URL",
                bad
            )));
        }

        if let EndpointSource::Template {
            template,
            count,
            port_base,
        } = &self.endpoints
        {
            let last_port = *port_base as usize + count.saturating_sub(1);
            if template.contains("{port}") && last_port > u16::MAX as usize {
                return Err(ConfigError::ValidationFailed(
                    "endpoint ports exceed 65535".to_string(),
                ));
            }
        }

        if self.per_endpoint_concurrency == 0 {
            return Err(ConfigError::ValidationFailed(
                "per_endpoint_concurrency must be greater than 0".to_string(),
            ));
        }

        // Scoring validation
        if self.request_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "request_timeout must be greater than 0".to_string(),
            ));
        }

        if !(1..=MAX_ATTEMPTS_LIMIT).contains(&self.max_attempts) {
            return Err(ConfigError::ValidationFailed(format!(
                "max_attempts must be between 1 and {}",
                MAX_ATTEMPTS_LIMIT
            )));
        }

        if !(1.0..=10.0).contains(&self.retry_multiplier) {
            return Err(ConfigError::ValidationFailed(
                "retry_multiplier must be between 1.0 and 10.0".to_string(),
            ));
        }

        // Dispatch validation
        if self.batch_size == Some(0) {
            return Err(ConfigError::ValidationFailed(
                "batch_size must be greater than 0".to_string(),
            ));
        }

        // Entries beyond the pool capacity would wait for a permit while
        // their lease runs, so the lease bound only holds up to capacity.
        let capacity = urls.len().saturating_mul(self.per_endpoint_concurrency);
        if let Some(batch_size) = self.batch_size.filter(|&b| b > capacity) {
            return Err(ConfigError::ValidationFailed(format!(
                "batch_size ({}) cannot exceed endpoint capacity ({})",
                batch_size, capacity
            )));
        }

        if self.lease_timeout < self.worst_case_batch_time() {
            return Err(ConfigError::ValidationFailed(format!(
                "lease_timeout ({}s) must exceed the worst-case batch time ({}s)",
                self.lease_timeout.as_secs(),
                self.worst_case_batch_time().as_secs()
            )));
        }

        if self.remaining_refresh_every == 0 {
            return Err(ConfigError::ValidationFailed(
                "remaining_refresh_every must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Longest a claimed batch can stay in flight when it fits the pool
    /// capacity: every attempt timing out, every backoff delay, then every
    /// database write retry.
    pub fn worst_case_batch_time(&self) -> Duration {
        let retry = self.retry_policy();
        let scoring = (1..self.max_attempts)
            .map(|n| retry.delay_after(n))
            .fold(
                self.request_timeout.saturating_mul(self.max_attempts),
                Duration::saturating_add,
            );
        let db_retry = DbRetryPolicy::new(self.db_write_retries, self.db_retry_delay);
        (1..db_retry.max_attempts)
            .map(|n| db_retry.delay_after(n))
            .fold(scoring, Duration::saturating_add)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, self.retry_base_delay)
            .with_multiplier(self.retry_multiplier)
    }

    pub fn database_options(&self) -> DatabaseOptions {
        DatabaseOptions::new(self.database_url.clone())
            .with_pool_size(self.db_min_connections, self.db_max_connections)
            .with_connect_timeout(self.db_connect_timeout)
            .with_retry(DbRetryPolicy::new(self.db_write_retries, self.db_retry_delay))
    }

    /// Builder method to set the endpoint source.
    pub fn with_endpoints(mut self, endpoints: EndpointSource) -> Self {
        self.endpoints = endpoints;
        self
    }

    /// Builder method to set per-endpoint concurrency.
    pub fn with_per_endpoint_concurrency(mut self, concurrency: usize) -> Self {
        self.per_endpoint_concurrency = concurrency;
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Builder method to set the retry policy parameters.
    pub fn with_retry(mut self, max_attempts: u32, base_delay: Duration, multiplier: f64) -> Self {
        self.max_attempts = max_attempts;
        self.retry_base_delay = base_delay;
        self.retry_multiplier = multiplier;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    pub fn with_max_batches(mut self, max_batches: u64) -> Self {
        self.max_batches = Some(max_batches);
        self
    }

    pub fn with_lease_timeout(mut self, lease: Duration) -> Self {
        self.lease_timeout = lease;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Builder method to set database URL.
    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    /// Builder method to set the database pool size.
    pub fn with_db_pool(mut self, min: u32, max: u32) -> Self {
        self.db_min_connections = min;
        self.db_max_connections = max;
        self
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    pub fn with_metrics_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.metrics_file = Some(path.into());
        self
    }
}

/// Resolves the endpoint source: an explicit list wins over a template,
/// and a template wins over the host mode.
pub fn endpoint_source(
    explicit: Option<&str>,
    template: Option<String>,
    mode: &str,
    count: usize,
    port_base: u16,
) -> Result<EndpointSource, ConfigError> {
    if let Some(list) = explicit {
        let urls: Vec<String> = list
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if !urls.is_empty() {
            return Ok(EndpointSource::Explicit(urls));
        }
    }

    if let Some(template) = template {
        return Ok(EndpointSource::Template {
            template,
            count,
            port_base,
        });
    }

    match mode.trim().to_lowercase().as_str() {
        "local" => Ok(EndpointSource::local(count, port_base)),
        "docker" => Ok(EndpointSource::docker(count)),
        other => Err(ConfigError::InvalidValue {
            key: "FUJI_HOST_MODE".to_string(),
            message: format!("expected 'local' or 'docker', got '{}'", other),
        }),
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse a whole number of seconds.
fn parse_secs(value: &str, key: &str) -> Result<Duration, ConfigError> {
    let secs: u64 = parse_env_value(value, key)?;
    Ok(Duration::from_secs(secs))
}
