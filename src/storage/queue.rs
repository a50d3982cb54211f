//! Queue store and result writer contracts.
//!
//! The queue table is the only point of coordination between pipeline
//! processes. Implementations must make [`QueueStore::claim_batch`] atomic:
//! a conditional update under row locks, never a read followed by a write.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use super::migrations::MigrationError;
use crate::scoring::ScoreOutcome;

/// Identifies one pipeline process for the lifetime of a run.
pub type WorkerId = Uuid;

/// Postgres SQLSTATE codes worth retrying.
const TRANSIENT_SQLSTATES: [&str; 7] = [
    "40001", // serialization_failure
    "40P01", // deadlock_detected
    "57P01", // admin_shutdown
    "57P03", // cannot_connect_now
    "08000", // connection_exception
    "08003", // connection_does_not_exist
    "08006", // connection_failure
];

/// Errors from the queue store and result writer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection to the database failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),

    /// Migration error.
    #[error("Migration error: {0}")]
    Migration(#[from] MigrationError),

    /// A row carried a state this version does not know.
    #[error("Invalid queue state: {0}")]
    InvalidState(String),
}

impl StoreError {
    /// Returns true for connectivity problems that may clear up on retry.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::ConnectionFailed(_) => true,
            StoreError::QueryFailed(err) => is_transient_sqlx(err),
            StoreError::Migration(MigrationError::Database(err))
            | StoreError::Migration(MigrationError::MigrationFailed { source: err, .. }) => {
                is_transient_sqlx(err)
            }
            StoreError::InvalidState(_) => false,
        }
    }
}

fn is_transient_sqlx(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db) => db
            .code()
            .map(|code| TRANSIENT_SQLSTATES.iter().any(|c| code == *c))
            .unwrap_or(false),
        _ => false,
    }
}

/// Lifecycle state of a queue entry.
///
/// "Done" has no state: a finished entry is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryState {
    Pending,
    Claimed,
    Failed,
}

impl EntryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryState::Pending => "pending",
            EntryState::Claimed => "claimed",
            EntryState::Failed => "failed",
        }
    }
}

impl FromStr for EntryState {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(EntryState::Pending),
            "claimed" => Ok(EntryState::Claimed),
            "failed" => Ok(EntryState::Failed),
            other => Err(StoreError::InvalidState(other.to_string())),
        }
    }
}

/// A claimed unit of work.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    /// Queue entry id.
    pub id: i64,
    /// Source record the entry refers to.
    pub dataset_id: i64,
    /// Reference key sent to the scoring service.
    pub doi: String,
    /// Times this entry has been claimed, including this claim.
    pub attempts: i32,
    pub claimed_at: DateTime<Utc>,
}

/// What happens to a record whose scoring failed for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Delete the entry and leave the score NULL; the next seed re-enqueues
    /// the record.
    #[default]
    Skip,
    /// Keep the entry as `failed` with its reason; it is not retried until
    /// explicitly requeued.
    MarkFailed,
}

impl FailurePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailurePolicy::Skip => "skip",
            FailurePolicy::MarkFailed => "mark-failed",
        }
    }
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "skip" => Ok(FailurePolicy::Skip),
            "mark-failed" | "mark_failed" => Ok(FailurePolicy::MarkFailed),
            other => Err(format!(
                "unknown failure policy '{}': expected 'skip' or 'mark-failed'",
                other
            )),
        }
    }
}

/// Which claims a manual release applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseScope {
    /// Every claimed entry.
    All,
    /// Claims older than the given lease.
    OlderThan(Duration),
}

/// Snapshot of queue contents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub pending: u64,
    pub claimed: u64,
    pub failed: u64,
    /// Source records without a score (queued or not).
    pub unscored: u64,
}

impl QueueCounts {
    /// Entries that still need work.
    pub fn remaining(&self) -> u64 {
        self.pending + self.claimed
    }
}

/// One claimed entry paired with how scoring it ended.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchItem {
    pub entry: QueueEntry,
    pub outcome: ScoreOutcome,
}

/// Outcomes of one dispatch cycle, consumed by the result writer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchResult {
    pub items: Vec<BatchItem>,
}

impl BatchResult {
    pub fn new(items: Vec<BatchItem>) -> Self {
        Self { items }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn succeeded(&self) -> usize {
        self.items.iter().filter(|i| i.outcome.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.len() - self.succeeded()
    }

    pub fn entry_ids(&self) -> Vec<i64> {
        self.items.iter().map(|i| i.entry.id).collect()
    }
}

/// What the result writer changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteSummary {
    /// Source records whose score was written.
    pub scored: u64,
    /// Queue entries deleted as done.
    pub completed: u64,
    /// Queue entries parked as failed.
    pub parked: u64,
}

/// Durable job queue.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Creates the queue table if absent. Safe to call repeatedly.
    async fn ensure_schema(&self) -> Result<(), StoreError>;

    /// Enqueues every unscored record without a live entry.
    ///
    /// Idempotent; returns the number of entries inserted.
    async fn seed(&self) -> Result<u64, StoreError>;

    /// Atomically claims up to `limit` entries for `worker`.
    ///
    /// Pending entries and claims older than `lease` are eligible. Concurrent
    /// callers never receive overlapping entries. An empty result means the
    /// queue is drained.
    async fn claim_batch(
        &self,
        worker: WorkerId,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<QueueEntry>, StoreError>;

    /// Deletes entries owned by `worker` once their results are durable.
    async fn complete(&self, worker: WorkerId, entry_ids: &[i64]) -> Result<u64, StoreError>;

    /// Returns entries owned by `worker` to pending.
    async fn release(&self, worker: WorkerId, entry_ids: &[i64]) -> Result<u64, StoreError>;

    /// Returns claims in `scope` to pending, whoever owns them.
    async fn release_claims(&self, scope: ReleaseScope) -> Result<u64, StoreError>;

    /// Returns failed entries to pending.
    async fn requeue_failed(&self) -> Result<u64, StoreError>;

    /// Entries still needing work, across all processes.
    async fn remaining(&self) -> Result<u64, StoreError>;

    async fn counts(&self) -> Result<QueueCounts, StoreError>;
}

/// Persists batch outcomes.
#[async_trait]
pub trait ResultWriter: Send + Sync {
    /// Writes scores and retires entries for one batch in one unit.
    ///
    /// Successful items get their score and evaluation time written and
    /// their entry deleted. Failed items leave the score untouched and are
    /// handled per `policy`. Writing the same batch twice leaves the same
    /// final state as writing it once.
    async fn write_batch(
        &self,
        worker: WorkerId,
        batch: &BatchResult,
        policy: FailurePolicy,
    ) -> Result<WriteSummary, StoreError>;
}

/// A source record that already has a score.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredRecord {
    pub id: i64,
    pub doi: Option<String>,
    pub score: f64,
    pub evaluation_date: Option<NaiveDateTime>,
}

/// Paged read access to scored source records.
#[async_trait]
pub trait ScoredSource: Send + Sync {
    /// Up to `limit` scored records with `id > after_id`, ordered by id.
    async fn scored_page(&self, after_id: i64, limit: usize)
        -> Result<Vec<ScoredRecord>, StoreError>;

    async fn count_scored(&self) -> Result<u64, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_state_round_trip() {
        for state in [EntryState::Pending, EntryState::Claimed, EntryState::Failed] {
            assert_eq!(state.as_str().parse::<EntryState>().expect("parse"), state);
        }
        assert!("done".parse::<EntryState>().is_err());
    }

    #[test]
    fn test_failure_policy_parse() {
        assert_eq!("skip".parse::<FailurePolicy>(), Ok(FailurePolicy::Skip));
        assert_eq!(
            "mark-failed".parse::<FailurePolicy>(),
            Ok(FailurePolicy::MarkFailed)
        );
        assert_eq!(
            "MARK_FAILED".parse::<FailurePolicy>(),
            Ok(FailurePolicy::MarkFailed)
        );
        assert!("retry".parse::<FailurePolicy>().is_err());
        assert_eq!(FailurePolicy::default(), FailurePolicy::Skip);
    }

    #[test]
    fn test_store_error_transience() {
        assert!(StoreError::ConnectionFailed("refused".to_string()).is_transient());
        assert!(StoreError::QueryFailed(sqlx::Error::PoolTimedOut).is_transient());
        assert!(!StoreError::QueryFailed(sqlx::Error::RowNotFound).is_transient());
        assert!(!StoreError::InvalidState("x".to_string()).is_transient());
        assert!(StoreError::Migration(MigrationError::MigrationFailed {
            name: "queue_v1_part_1".to_string(),
            source: sqlx::Error::PoolTimedOut,
        })
        .is_transient());
    }

    #[test]
    fn test_queue_counts_remaining() {
        let counts = QueueCounts {
            pending: 5,
            claimed: 2,
            failed: 3,
            unscored: 10,
        };
        assert_eq!(counts.remaining(), 7);
    }
}
