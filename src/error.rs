//! Error types for fujifill operations.
//!
//! Defines the error types shared across subsystems:
//! - Scoring requests against FUJI endpoints
//! - Run-level failures of the batch dispatcher
//! - Exporting scored records
//!
//! Store errors live in [`crate::storage`] and configuration errors in
//! [`crate::pipeline::config`], next to the code that produces them.

use std::time::Duration;

use thiserror::Error;

use crate::storage::StoreError;

/// Longest response body kept in an error message.
const MAX_ERROR_BODY_CHARS: usize = 512;

/// Errors from a single scoring attempt against one endpoint.
///
/// Each variant is either transient (worth retrying on the same endpoint)
/// or permanent (retrying will not change the answer).
#[derive(Debug, Error)]
pub enum ScoringError {
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Server error ({status}): {body}")]
    ServerError { status: u16, body: String },

    #[error("Rate limited ({status})")]
    RateLimited { status: u16 },

    #[error("Client error ({status}): {body}")]
    ClientError { status: u16, body: String },

    #[error("Failed to parse FUJI response: {0}")]
    ParseError(String),

    #[error("FUJI response has no FAIR score")]
    MissingScore,

    #[error("Invalid reference key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("Failed to build HTTP client: {0}")]
    ClientBuild(String),
}

impl ScoringError {
    /// Returns true when the same request may succeed if retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ScoringError::Timeout(_)
                | ScoringError::Connection(_)
                | ScoringError::RequestFailed(_)
                | ScoringError::ServerError { .. }
                | ScoringError::RateLimited { .. }
        )
    }

    /// Classifies a non-success HTTP status.
    ///
    /// 5xx, 408 and 429 are transient; every other status is permanent.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let body = truncate_body(body.into());
        match status {
            408 | 429 => ScoringError::RateLimited { status },
            500..=599 => ScoringError::ServerError { status, body },
            _ => ScoringError::ClientError { status, body },
        }
    }

    /// Maps a transport error from reqwest onto the taxonomy above.
    pub fn from_reqwest(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            ScoringError::Timeout(timeout)
        } else if err.is_connect() {
            ScoringError::Connection(err.to_string())
        } else if err.is_decode() {
            ScoringError::ParseError(err.to_string())
        } else {
            ScoringError::RequestFailed(err.to_string())
        }
    }
}

fn truncate_body(body: String) -> String {
    if body.chars().count() <= MAX_ERROR_BODY_CHARS {
        return body;
    }
    let mut truncated: String = body.chars().take(MAX_ERROR_BODY_CHARS).collect();
    truncated.push_str("...");
    truncated
}

/// Fatal errors that stop a dispatch run.
///
/// Per-record scoring failures never surface here; they are recorded as
/// batch outcomes instead.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Failed to claim batch: {0}")]
    Claim(#[source] StoreError),

    #[error("Failed to persist batch of {entries} entries: {source}")]
    Persist {
        entries: usize,
        #[source]
        source: StoreError,
    },

    #[error("Failed to prepare queue: {0}")]
    Prepare(#[source] StoreError),
}

/// Errors that can occur while exporting scored records.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("Filesystem error: {0}")]
    Filesystem(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to read scored records: {0}")]
    Store(#[from] StoreError),

    #[error("Invalid export setting: {0}")]
    InvalidSetting(String),
}
