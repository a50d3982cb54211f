//! Scoring of dataset records against a pool of FUJI endpoints.
//!
//! - **Endpoint pool**: fixed list of endpoints, each with a concurrency budget
//! - **Client**: one authenticated evaluation per record, with retries
//! - **Retry policy**: exponential backoff for transient failures only
//!
//! # Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use fujifill::scoring::{
//!     Credentials, EndpointPool, EndpointSource, EvaluationOptions, HttpFujiApi,
//!     RetryPolicy, ScoringClient, DEFAULT_REQUEST_TIMEOUT,
//! };
//!
//! let api = HttpFujiApi::new(
//!     Credentials::default(),
//!     EvaluationOptions::default(),
//!     DEFAULT_REQUEST_TIMEOUT,
//! )?;
//! let client = ScoringClient::new(Arc::new(api), RetryPolicy::default())?;
//!
//! let mut pool = EndpointPool::from_source(&EndpointSource::local(4, 54001), 3)
//!     .expect("at least one endpoint");
//! let outcome = client.score("10.1594/PANGAEA.1", pool.next_slot()).await;
//! ```

pub mod client;
pub mod endpoint;
pub mod outcome;
pub mod request;
pub mod response;
pub mod retry;

pub use client::{Credentials, FujiApi, HttpFujiApi, ScoringClient, DEFAULT_REQUEST_TIMEOUT};
pub use endpoint::{
    Endpoint, EndpointPool, EndpointSlot, EndpointSource, DEFAULT_PER_ENDPOINT_CONCURRENCY,
    DEFAULT_PORT_BASE,
};
pub use outcome::{FailureKind, ScoreOutcome, ScoreResult};
pub use request::{EvaluationOptions, EvaluationRequest, KeyValidator};
pub use response::{parse_evaluation, FujiScore};
pub use retry::RetryPolicy;
