//! Final result of scoring one record.

use super::response::FujiScore;

/// Why a record ended without a score.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Transient errors persisted through every allowed attempt.
    RetriesExhausted,
    /// The service or the input rejected the record; not retried.
    Permanent,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::RetriesExhausted => "retries_exhausted",
            FailureKind::Permanent => "permanent",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScoreResult {
    Scored(FujiScore),
    Failed { kind: FailureKind, reason: String },
}

/// Outcome of [`ScoringClient::score`](super::ScoringClient::score).
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreOutcome {
    pub result: ScoreResult,
    /// Network attempts made; zero when the key was rejected locally.
    pub attempts: u32,
    /// Endpoint the record was routed to.
    pub endpoint: usize,
}

impl ScoreOutcome {
    pub fn scored(score: FujiScore, attempts: u32, endpoint: usize) -> Self {
        Self {
            result: ScoreResult::Scored(score),
            attempts,
            endpoint,
        }
    }

    pub fn failed(
        kind: FailureKind,
        reason: impl Into<String>,
        attempts: u32,
        endpoint: usize,
    ) -> Self {
        Self {
            result: ScoreResult::Failed {
                kind,
                reason: reason.into(),
            },
            attempts,
            endpoint,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.result, ScoreResult::Scored(_))
    }

    pub fn score(&self) -> Option<&FujiScore> {
        match &self.result {
            ScoreResult::Scored(score) => Some(score),
            ScoreResult::Failed { .. } => None,
        }
    }

    pub fn failure_reason(&self) -> Option<&str> {
        match &self.result {
            ScoreResult::Scored(_) => None,
            ScoreResult::Failed { reason, .. } => Some(reason),
        }
    }
}
