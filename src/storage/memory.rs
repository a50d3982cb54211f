//! In-memory queue store.
//!
//! Mirrors the Postgres semantics closely enough to run the dispatcher
//! end to end without a database: the source table, the queue table, owner
//! guards on completion and release, lease-based reclaim and all-or-nothing
//! batch writes. Writes can be made to fail on demand.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use tokio::sync::Mutex;

use super::queue::{
    BatchResult, EntryState, FailurePolicy, QueueCounts, QueueEntry, QueueStore, ReleaseScope,
    ResultWriter, ScoredRecord, ScoredSource, StoreError, WorkerId, WriteSummary,
};
use crate::scoring::ScoreResult;

/// A row of the simulated source table.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryRecord {
    pub id: i64,
    pub doi: Option<String>,
    pub score: Option<f64>,
    pub evaluation_date: Option<NaiveDateTime>,
}

#[derive(Debug, Clone)]
struct MemoryJob {
    id: i64,
    dataset_id: i64,
    doi: String,
    state: EntryState,
    claimed_by: Option<WorkerId>,
    claimed_at: Option<DateTime<Utc>>,
    attempts: i32,
    last_error: Option<String>,
}

impl MemoryJob {
    fn release(&mut self) {
        self.state = EntryState::Pending;
        self.claimed_by = None;
        self.claimed_at = None;
    }

    fn owned_by(&self, worker: WorkerId) -> bool {
        self.state == EntryState::Claimed && self.claimed_by == Some(worker)
    }

    fn is_claimable(&self, now: DateTime<Utc>, lease: Duration) -> bool {
        match self.state {
            EntryState::Pending => true,
            EntryState::Claimed => self
                .claimed_at
                .map(|at| now - at > lease_delta(lease))
                .unwrap_or(true),
            EntryState::Failed => false,
        }
    }
}

fn lease_delta(lease: Duration) -> chrono::Duration {
    chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

struct MemoryState {
    records: BTreeMap<i64, MemoryRecord>,
    jobs: BTreeMap<i64, MemoryJob>,
    next_job_id: i64,
    /// Remaining batch writes that fail with a connection error.
    failing_writes: u32,
    write_attempts: u64,
}

impl MemoryState {
    fn job_for_dataset(&self, dataset_id: i64) -> bool {
        self.jobs.values().any(|j| j.dataset_id == dataset_id)
    }

    fn counts(&self) -> QueueCounts {
        let mut counts = QueueCounts::default();
        for job in self.jobs.values() {
            match job.state {
                EntryState::Pending => counts.pending += 1,
                EntryState::Claimed => counts.claimed += 1,
                EntryState::Failed => counts.failed += 1,
            }
        }
        counts.unscored = self
            .records
            .values()
            .filter(|r| r.score.is_none() && r.doi.is_some())
            .count() as u64;
        counts
    }
}

/// In-memory implementation of [`QueueStore`], [`ResultWriter`] and
/// [`ScoredSource`].
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState {
                records: BTreeMap::new(),
                jobs: BTreeMap::new(),
                next_job_id: 1,
                failing_writes: 0,
                write_attempts: 0,
            }),
        }
    }

    /// Creates a store whose source table holds unscored records with the
    /// given ids and reference keys.
    pub async fn with_records<I, S>(records: I) -> Self
    where
        I: IntoIterator<Item = (i64, S)>,
        S: Into<String>,
    {
        let store = Self::new();
        for (id, doi) in records {
            store.insert_record(id, Some(doi.into())).await;
        }
        store
    }

    /// Inserts or replaces an unscored source record.
    pub async fn insert_record(&self, id: i64, doi: Option<String>) {
        let mut state = self.state.lock().await;
        state.records.insert(
            id,
            MemoryRecord {
                id,
                doi,
                score: None,
                evaluation_date: None,
            },
        );
    }

    pub async fn record(&self, id: i64) -> Option<MemoryRecord> {
        self.state.lock().await.records.get(&id).cloned()
    }

    pub async fn records(&self) -> Vec<MemoryRecord> {
        self.state.lock().await.records.values().cloned().collect()
    }

    /// Makes the next `count` batch writes fail with a transient error.
    pub async fn fail_next_writes(&self, count: u32) {
        self.state.lock().await.failing_writes = count;
    }

    /// Batch writes attempted so far, including injected failures.
    pub async fn write_attempts(&self) -> u64 {
        self.state.lock().await.write_attempts
    }

    /// Moves every live claim's timestamp back by `by`, as if its owner had
    /// stalled that long.
    pub async fn age_claims(&self, by: Duration) {
        let mut state = self.state.lock().await;
        for job in state.jobs.values_mut() {
            if let Some(at) = job.claimed_at.as_mut() {
                *at -= lease_delta(by);
            }
        }
    }

    /// Failure reason stored for a parked entry.
    pub async fn last_error(&self, dataset_id: i64) -> Option<String> {
        let state = self.state.lock().await;
        state
            .jobs
            .values()
            .find(|j| j.dataset_id == dataset_id)
            .and_then(|j| j.last_error.clone())
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn seed(&self) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let candidates: Vec<(i64, String)> = state
            .records
            .values()
            .filter(|r| r.score.is_none())
            .filter_map(|r| r.doi.clone().map(|doi| (r.id, doi)))
            .collect();

        let mut inserted = 0;
        for (dataset_id, doi) in candidates {
            if state.job_for_dataset(dataset_id) {
                continue;
            }
            let id = state.next_job_id;
            state.next_job_id += 1;
            state.jobs.insert(
                id,
                MemoryJob {
                    id,
                    dataset_id,
                    doi,
                    state: EntryState::Pending,
                    claimed_by: None,
                    claimed_at: None,
                    attempts: 0,
                    last_error: None,
                },
            );
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn claim_batch(
        &self,
        worker: WorkerId,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<QueueEntry>, StoreError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();

        let mut claimed = Vec::new();
        for job in state.jobs.values_mut() {
            if claimed.len() >= limit {
                break;
            }
            if !job.is_claimable(now, lease) {
                continue;
            }
            job.state = EntryState::Claimed;
            job.claimed_by = Some(worker);
            job.claimed_at = Some(now);
            job.attempts += 1;
            claimed.push(QueueEntry {
                id: job.id,
                dataset_id: job.dataset_id,
                doi: job.doi.clone(),
                attempts: job.attempts,
                claimed_at: now,
            });
        }
        Ok(claimed)
    }

    async fn complete(&self, worker: WorkerId, entry_ids: &[i64]) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let mut removed = 0;
        for id in entry_ids {
            if state.jobs.get(id).is_some_and(|j| j.owned_by(worker)) {
                state.jobs.remove(id);
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn release(&self, worker: WorkerId, entry_ids: &[i64]) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let mut released = 0;
        for id in entry_ids {
            if let Some(job) = state.jobs.get_mut(id) {
                if job.owned_by(worker) {
                    job.release();
                    released += 1;
                }
            }
        }
        Ok(released)
    }

    async fn release_claims(&self, scope: ReleaseScope) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let mut released = 0;
        for job in state.jobs.values_mut() {
            if job.state != EntryState::Claimed {
                continue;
            }
            let eligible = match scope {
                ReleaseScope::All => true,
                ReleaseScope::OlderThan(lease) => job.is_claimable(now, lease),
            };
            if eligible {
                job.release();
                released += 1;
            }
        }
        Ok(released)
    }

    async fn requeue_failed(&self) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let mut requeued = 0;
        for job in state.jobs.values_mut() {
            if job.state == EntryState::Failed {
                job.state = EntryState::Pending;
                job.last_error = None;
                requeued += 1;
            }
        }
        Ok(requeued)
    }

    async fn remaining(&self) -> Result<u64, StoreError> {
        Ok(self.state.lock().await.counts().remaining())
    }

    async fn counts(&self) -> Result<QueueCounts, StoreError> {
        Ok(self.state.lock().await.counts())
    }
}

#[async_trait]
impl ResultWriter for MemoryStore {
    async fn write_batch(
        &self,
        worker: WorkerId,
        batch: &BatchResult,
        policy: FailurePolicy,
    ) -> Result<WriteSummary, StoreError> {
        let mut state = self.state.lock().await;
        state.write_attempts += 1;
        if state.failing_writes > 0 {
            state.failing_writes -= 1;
            return Err(StoreError::ConnectionFailed(
                "injected write failure".to_string(),
            ));
        }

        let mut summary = WriteSummary::default();
        for item in &batch.items {
            let owned = state
                .jobs
                .get(&item.entry.id)
                .is_some_and(|j| j.owned_by(worker));

            match &item.outcome.result {
                ScoreResult::Scored(score) => {
                    if let Some(record) = state.records.get_mut(&item.entry.dataset_id) {
                        record.score = Some(score.score);
                        record.evaluation_date = Some(score.evaluated_at.naive_utc());
                        summary.scored += 1;
                    }
                    if owned {
                        state.jobs.remove(&item.entry.id);
                        summary.completed += 1;
                    }
                }
                ScoreResult::Failed { reason, .. } => {
                    if !owned {
                        continue;
                    }
                    match policy {
                        FailurePolicy::Skip => {
                            state.jobs.remove(&item.entry.id);
                            summary.completed += 1;
                        }
                        FailurePolicy::MarkFailed => {
                            if let Some(job) = state.jobs.get_mut(&item.entry.id) {
                                job.state = EntryState::Failed;
                                job.last_error = Some(reason.clone());
                                job.claimed_by = None;
                                job.claimed_at = None;
                                summary.parked += 1;
                            }
                        }
                    }
                }
            }
        }
        Ok(summary)
    }
}

#[async_trait]
impl ScoredSource for MemoryStore {
    async fn scored_page(
        &self,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<ScoredRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .records
            .range(after_id.saturating_add(1)..)
            .filter_map(|(_, r)| {
                r.score.map(|score| ScoredRecord {
                    id: r.id,
                    doi: r.doi.clone(),
                    score,
                    evaluation_date: r.evaluation_date,
                })
            })
            .take(limit)
            .collect())
    }

    async fn count_scored(&self) -> Result<u64, StoreError> {
        let state = self.state.lock().await;
        Ok(state.records.values().filter(|r| r.score.is_some()).count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scoring::{FailureKind, FujiScore, ScoreOutcome};
    use crate::storage::queue::BatchItem;
    use uuid::Uuid;

    const LEASE: Duration = Duration::from_secs(900);

    fn scored(entry: QueueEntry, value: f64) -> BatchItem {
        BatchItem {
            entry,
            outcome: ScoreOutcome::scored(
                FujiScore {
                    score: value,
                    evaluated_at: Utc::now(),
                },
                1,
                0,
            ),
        }
    }

    fn failed(entry: QueueEntry) -> BatchItem {
        BatchItem {
            entry,
            outcome: ScoreOutcome::failed(FailureKind::Permanent, "HTTP 400", 1, 0),
        }
    }

    #[tokio::test]
    async fn test_seed_is_idempotent() {
        let store = MemoryStore::with_records([(1, "10.1/a"), (2, "10.1/b")]).await;
        store.insert_record(3, None).await;

        assert_eq!(store.seed().await.expect("seed"), 2);
        assert_eq!(store.seed().await.expect("seed"), 0);
        assert_eq!(store.remaining().await.expect("remaining"), 2);
    }

    #[tokio::test]
    async fn test_claims_are_disjoint() {
        let store = MemoryStore::with_records((1..=5).map(|i| (i, format!("10.1/{}", i)))).await;
        store.seed().await.expect("seed");

        let a = store.claim_batch(Uuid::new_v4(), 3, LEASE).await.expect("claim");
        let b = store.claim_batch(Uuid::new_v4(), 3, LEASE).await.expect("claim");
        assert_eq!(a.len(), 3);
        assert_eq!(b.len(), 2);
        assert!(a.iter().all(|x| b.iter().all(|y| x.id != y.id)));

        let c = store.claim_batch(Uuid::new_v4(), 3, LEASE).await.expect("claim");
        assert!(c.is_empty());
    }

    #[tokio::test]
    async fn test_stale_claims_are_reclaimed() {
        let store = MemoryStore::with_records([(1, "10.1/a")]).await;
        store.seed().await.expect("seed");

        let crashed = Uuid::new_v4();
        let first = store.claim_batch(crashed, 10, LEASE).await.expect("claim");
        assert_eq!(first.len(), 1);

        let survivor = Uuid::new_v4();
        assert!(store.claim_batch(survivor, 10, LEASE).await.expect("claim").is_empty());

        store.age_claims(LEASE + Duration::from_secs(1)).await;
        let second = store.claim_batch(survivor, 10, LEASE).await.expect("claim");
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].attempts, 2);

        // The crashed owner can no longer complete it.
        assert_eq!(store.complete(crashed, &[second[0].id]).await.expect("complete"), 0);
    }

    #[tokio::test]
    async fn test_write_batch_skip_and_mark_failed() {
        let store = MemoryStore::with_records([(1, "10.1/a"), (2, "10.1/b")]).await;
        store.seed().await.expect("seed");
        let worker = Uuid::new_v4();
        let mut claimed = store.claim_batch(worker, 10, LEASE).await.expect("claim");
        let second = claimed.pop().expect("entry");
        let first = claimed.pop().expect("entry");

        let batch = BatchResult::new(vec![scored(first, 80.0), failed(second)]);
        let summary = store
            .write_batch(worker, &batch, FailurePolicy::MarkFailed)
            .await
            .expect("write");
        assert_eq!(summary.scored, 1);
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.parked, 1);

        let counts = store.counts().await.expect("counts");
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.remaining(), 0);
        assert_eq!(store.last_error(2).await.as_deref(), Some("HTTP 400"));
        assert_eq!(store.record(1).await.and_then(|r| r.score), Some(80.0));

        assert_eq!(store.requeue_failed().await.expect("requeue"), 1);
        assert_eq!(store.remaining().await.expect("remaining"), 1);
    }

    #[tokio::test]
    async fn test_rewriting_a_batch_is_harmless() {
        let store = MemoryStore::with_records([(1, "10.1/a")]).await;
        store.seed().await.expect("seed");
        let worker = Uuid::new_v4();
        let entry = store.claim_batch(worker, 1, LEASE).await.expect("claim").remove(0);
        let batch = BatchResult::new(vec![scored(entry, 55.0)]);

        store.write_batch(worker, &batch, FailurePolicy::Skip).await.expect("write");
        let again = store
            .write_batch(worker, &batch, FailurePolicy::Skip)
            .await
            .expect("write");
        assert_eq!(again.completed, 0);
        assert_eq!(store.record(1).await.and_then(|r| r.score), Some(55.0));
        assert_eq!(store.remaining().await.expect("remaining"), 0);
    }

    #[tokio::test]
    async fn test_injected_write_failure_changes_nothing() {
        let store = MemoryStore::with_records([(1, "10.1/a")]).await;
        store.seed().await.expect("seed");
        let worker = Uuid::new_v4();
        let entry = store.claim_batch(worker, 1, LEASE).await.expect("claim").remove(0);
        let batch = BatchResult::new(vec![scored(entry, 55.0)]);

        store.fail_next_writes(1).await;
        let err = store
            .write_batch(worker, &batch, FailurePolicy::Skip)
            .await
            .expect_err("injected");
        assert!(err.is_transient());
        assert_eq!(store.record(1).await.and_then(|r| r.score), None);
        assert_eq!(store.write_attempts().await, 1);
    }

    #[tokio::test]
    async fn test_release_scopes() {
        let store = MemoryStore::with_records([(1, "10.1/a"), (2, "10.1/b")]).await;
        store.seed().await.expect("seed");
        store.claim_batch(Uuid::new_v4(), 1, LEASE).await.expect("claim");

        assert_eq!(
            store.release_claims(ReleaseScope::OlderThan(LEASE)).await.expect("release"),
            0
        );
        assert_eq!(store.release_claims(ReleaseScope::All).await.expect("release"), 1);
        assert_eq!(store.counts().await.expect("counts").pending, 2);
    }

    #[tokio::test]
    async fn test_scored_page_keyset() {
        let store = MemoryStore::with_records((1..=4).map(|i| (i, format!("10.1/{}", i)))).await;
        store.seed().await.expect("seed");
        let worker = Uuid::new_v4();
        let entries = store.claim_batch(worker, 10, LEASE).await.expect("claim");
        let items = entries.into_iter().map(|e| scored(e, 10.0)).collect();
        store
            .write_batch(worker, &BatchResult::new(items), FailurePolicy::Skip)
            .await
            .expect("write");

        let page = store.scored_page(0, 3).await.expect("page");
        assert_eq!(page.iter().map(|r| r.id).collect::<Vec<_>>(), vec![1, 2, 3]);
        let rest = store.scored_page(3, 3).await.expect("page");
        assert_eq!(rest.len(), 1);
        assert_eq!(store.count_scored().await.expect("count"), 4);
    }
}
