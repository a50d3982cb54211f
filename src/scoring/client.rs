//! FUJI scoring client.
//!
//! [`FujiApi`] is the seam to the remote service: one call, one attempt.
//! [`HttpFujiApi`] implements it over HTTP with basic authentication and a
//! fixed request timeout. [`ScoringClient`] adds key validation, endpoint
//! slot accounting and the retry policy on top of any `FujiApi`.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::ACCEPT;
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, warn};

use super::endpoint::Endpoint;
use super::outcome::{FailureKind, ScoreOutcome};
use super::request::{EvaluationOptions, EvaluationRequest, KeyValidator};
use super::response::{parse_evaluation, FujiScore};
use super::retry::RetryPolicy;
use crate::error::ScoringError;
use crate::metrics::MetricsCollector;

/// Default per-attempt request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Trait for services that can evaluate one identifier.
#[async_trait]
pub trait FujiApi: Send + Sync {
    /// Performs a single evaluation attempt against `endpoint`.
    async fn evaluate(&self, endpoint: &Endpoint, identifier: &str)
        -> Result<FujiScore, ScoringError>;
}

/// Basic-auth credentials for the FUJI API.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl Default for Credentials {
    /// Credentials baked into the public FUJI container image.
    fn default() -> Self {
        Self::new("marvel", "wonderwoman")
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// HTTP implementation of [`FujiApi`].
pub struct HttpFujiApi {
    http_client: Client,
    credentials: Credentials,
    options: EvaluationOptions,
    timeout: Duration,
}

impl HttpFujiApi {
    /// Creates a client whose every request is bounded by `timeout`.
    pub fn new(
        credentials: Credentials,
        options: EvaluationOptions,
        timeout: Duration,
    ) -> Result<Self, ScoringError> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ScoringError::ClientBuild(e.to_string()))?;

        Ok(Self {
            http_client,
            credentials,
            options,
            timeout,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn options(&self) -> &EvaluationOptions {
        &self.options
    }
}

#[async_trait]
impl FujiApi for HttpFujiApi {
    async fn evaluate(
        &self,
        endpoint: &Endpoint,
        identifier: &str,
    ) -> Result<FujiScore, ScoringError> {
        let request = EvaluationRequest::new(identifier, &self.options);

        let response = self
            .http_client
            .post(endpoint.url())
            .basic_auth(&self.credentials.username, Some(&self.credentials.password))
            .header(ACCEPT, "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| ScoringError::from_reqwest(e, self.timeout))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ScoringError::from_status(status.as_u16(), body));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ScoringError::from_reqwest(e, self.timeout))?;

        parse_evaluation(&body, Utc::now())
    }
}

/// Scores records with validation, endpoint slots and retries.
pub struct ScoringClient {
    api: Arc<dyn FujiApi>,
    retry: RetryPolicy,
    validator: KeyValidator,
    metrics: MetricsCollector,
}

impl ScoringClient {
    pub fn new(api: Arc<dyn FujiApi>, retry: RetryPolicy) -> Result<Self, ScoringError> {
        Ok(Self {
            api,
            retry,
            validator: KeyValidator::new()?,
            metrics: MetricsCollector::new(),
        })
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Scores one record against its assigned endpoint.
    ///
    /// Transient failures are retried on the same endpoint with exponential
    /// backoff until the policy's attempt limit. Permanent failures return
    /// after the first attempt. This never fails: every error becomes a
    /// failed [`ScoreOutcome`].
    pub async fn score(&self, key: &str, endpoint: &Endpoint) -> ScoreOutcome {
        let key = match self.validator.validate(key) {
            Ok(key) => key,
            Err(e) => {
                warn!(endpoint = %endpoint, error = %e, "Rejected reference key");
                return ScoreOutcome::failed(
                    FailureKind::Permanent,
                    e.to_string(),
                    0,
                    endpoint.index(),
                );
            }
        };

        let mut attempts = 0;
        loop {
            attempts += 1;

            let slot = endpoint.acquire().await;
            let started = Instant::now();
            let result = self.api.evaluate(endpoint, key).await;
            let latency = started.elapsed();
            drop(slot);

            match result {
                Ok(score) => {
                    self.metrics
                        .record_request(endpoint.url(), "success", latency.as_secs_f64());
                    debug!(
                        key = key,
                        endpoint = %endpoint,
                        attempts = attempts,
                        score = score.score,
                        "Record scored"
                    );
                    return ScoreOutcome::scored(score, attempts, endpoint.index());
                }
                Err(e) if e.is_transient() => {
                    self.metrics
                        .record_request(endpoint.url(), "transient", latency.as_secs_f64());

                    if !self.retry.should_retry(attempts) {
                        warn!(
                            key = key,
                            endpoint = %endpoint,
                            attempts = attempts,
                            error = %e,
                            "Scoring failed after exhausting retries"
                        );
                        return ScoreOutcome::failed(
                            FailureKind::RetriesExhausted,
                            e.to_string(),
                            attempts,
                            endpoint.index(),
                        );
                    }

                    let delay = self.retry.delay_after(attempts);
                    debug!(
                        key = key,
                        endpoint = %endpoint,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient scoring failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    self.metrics
                        .record_request(endpoint.url(), "permanent", latency.as_secs_f64());
                    warn!(
                        key = key,
                        endpoint = %endpoint,
                        error = %e,
                        "Permanent scoring failure"
                    );
                    return ScoreOutcome::failed(
                        FailureKind::Permanent,
                        e.to_string(),
                        attempts,
                        endpoint.index(),
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scoring::endpoint::EndpointPool;
    use std::collections::VecDeque;
    use tokio::sync::Mutex;

    /// Replays a fixed script of results and counts calls.
    struct ScriptedApi {
        script: Mutex<VecDeque<Result<FujiScore, ScoringError>>>,
        calls: Mutex<u32>,
    }

    impl ScriptedApi {
        fn new(script: Vec<Result<FujiScore, ScoringError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(0),
            })
        }

        async fn calls(&self) -> u32 {
            *self.calls.lock().await
        }
    }

    #[async_trait]
    impl FujiApi for ScriptedApi {
        async fn evaluate(
            &self,
            _endpoint: &Endpoint,
            _identifier: &str,
        ) -> Result<FujiScore, ScoringError> {
            *self.calls.lock().await += 1;
            self.script
                .lock()
                .await
                .pop_front()
                .unwrap_or(Err(ScoringError::MissingScore))
        }
    }

    fn score(value: f64) -> FujiScore {
        FujiScore {
            score: value,
            evaluated_at: Utc::now(),
        }
    }

    fn endpoint() -> Endpoint {
        let pool = EndpointPool::new(vec!["http://fuji1/evaluate".to_string()], 3).expect("pool");
        pool.endpoints()[0].clone()
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_success_first_attempt() {
        let api = ScriptedApi::new(vec![Ok(score(50.0))]);
        let client = ScoringClient::new(api.clone(), fast_retry()).expect("client");

        let outcome = client.score("10.1/abc", &endpoint()).await;
        assert!(outcome.is_success());
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.score().map(|s| s.score), Some(50.0));
        assert_eq!(api.calls().await, 1);
    }

    #[tokio::test]
    async fn test_two_transient_failures_then_success() {
        let api = ScriptedApi::new(vec![
            Err(ScoringError::Timeout(Duration::from_secs(60))),
            Err(ScoringError::from_status(502, "bad gateway")),
            Ok(score(75.0)),
        ]);
        let client = ScoringClient::new(api.clone(), fast_retry()).expect("client");

        let outcome = client.score("10.1/abc", &endpoint()).await;
        assert!(outcome.is_success());
        assert_eq!(outcome.attempts, 3);
        assert_eq!(api.calls().await, 3);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let api = ScriptedApi::new(vec![
            Err(ScoringError::Connection("refused".to_string())),
            Err(ScoringError::Connection("refused".to_string())),
            Err(ScoringError::Connection("refused".to_string())),
            Ok(score(1.0)),
        ]);
        let client = ScoringClient::new(api.clone(), fast_retry()).expect("client");

        let outcome = client.score("10.1/abc", &endpoint()).await;
        assert!(!outcome.is_success());
        assert_eq!(outcome.attempts, 3);
        assert!(matches!(
            outcome.result,
            crate::scoring::ScoreResult::Failed {
                kind: FailureKind::RetriesExhausted,
                ..
            }
        ));
        assert_eq!(api.calls().await, 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let api = ScriptedApi::new(vec![
            Err(ScoringError::from_status(400, "bad request")),
            Ok(score(1.0)),
        ]);
        let client = ScoringClient::new(api.clone(), fast_retry()).expect("client");

        let outcome = client.score("10.1/abc", &endpoint()).await;
        assert_eq!(outcome.attempts, 1);
        assert!(outcome.failure_reason().unwrap_or_default().contains("400"));
        assert_eq!(api.calls().await, 1);
    }

    #[tokio::test]
    async fn test_invalid_key_makes_no_request() {
        let api = ScriptedApi::new(vec![Ok(score(1.0))]);
        let client = ScoringClient::new(api.clone(), fast_retry()).expect("client");

        let outcome = client.score("not a key", &endpoint()).await;
        assert!(!outcome.is_success());
        assert_eq!(outcome.attempts, 0);
        assert_eq!(api.calls().await, 0);
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let debug = format!("{:?}", Credentials::default());
        assert!(debug.contains("marvel"));
        assert!(!debug.contains("wonderwoman"));
    }
}
