//! Batch dispatcher.
//!
//! Each cycle claims a batch sized to the endpoint pool's capacity, routes
//! every entry to an endpoint in round-robin order, scores the whole batch
//! concurrently and waits for all of it before persisting. The next claim
//! never starts before the previous batch is durable.
//!
//! ```text
//! IDLE -> CLAIMING -> DISPATCHING -> AWAITING -> PERSISTING -> IDLE
//!             \-> DRAINED (empty claim)
//! ```

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::config::PipelineConfig;
use super::progress::{ProgressReporter, ProgressSnapshot};
use crate::error::DispatchError;
use crate::metrics::{write_metrics_file, MetricsCollector};
use crate::scoring::{EndpointPool, ScoringClient};
use crate::storage::{
    BatchItem, BatchResult, FailurePolicy, QueueEntry, QueueStore, ResultWriter, WorkerId,
    WriteSummary,
};

/// Where the dispatcher is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Idle,
    Claiming,
    Dispatching,
    Awaiting,
    Persisting,
    /// The queue returned an empty claim.
    Drained,
}

impl fmt::Display for DispatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchState::Idle => write!(f, "idle"),
            DispatchState::Claiming => write!(f, "claiming"),
            DispatchState::Dispatching => write!(f, "dispatching"),
            DispatchState::Awaiting => write!(f, "awaiting"),
            DispatchState::Persisting => write!(f, "persisting"),
            DispatchState::Drained => write!(f, "drained"),
        }
    }
}

/// Why a run ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Drained,
    StopRequested,
    BatchLimit,
}

/// Outcome of [`BatchDispatcher::run`].
#[derive(Debug, Clone)]
pub struct DispatchReport {
    pub reason: StopReason,
    pub batches: u64,
    pub progress: ProgressSnapshot,
}

/// Drives claim, score and persist cycles until the queue is drained.
pub struct BatchDispatcher<S> {
    store: Arc<S>,
    client: ScoringClient,
    pool: EndpointPool,
    worker: WorkerId,
    batch_size: usize,
    lease: Duration,
    policy: FailurePolicy,
    max_batches: Option<u64>,
    metrics_file: Option<PathBuf>,
    progress: ProgressReporter,
    metrics: MetricsCollector,
    state: DispatchState,
}

impl<S> BatchDispatcher<S>
where
    S: QueueStore + ResultWriter,
{
    /// Creates a dispatcher with a fresh worker id.
    ///
    /// The batch size defaults to the pool capacity and never exceeds it,
    /// so no claimed entry waits for a permit while its lease runs.
    pub fn new(
        store: Arc<S>,
        client: ScoringClient,
        pool: EndpointPool,
        config: &PipelineConfig,
    ) -> Self {
        let capacity = pool.capacity().max(1);
        let requested = config.batch_size.unwrap_or(capacity).max(1);
        if requested > capacity {
            warn!(
                requested = requested,
                capacity = capacity,
                "Batch size exceeds endpoint capacity, clamping"
            );
        }
        let batch_size = requested.min(capacity);
        Self {
            store,
            client,
            pool,
            worker: Uuid::new_v4(),
            batch_size,
            lease: config.lease_timeout,
            policy: config.failure_policy,
            max_batches: config.max_batches,
            metrics_file: config.metrics_file.clone(),
            progress: ProgressReporter::new(
                config.progress_interval,
                config.remaining_refresh_every,
            ),
            metrics: MetricsCollector::new(),
            state: DispatchState::Idle,
        }
    }

    pub fn with_worker_id(mut self, worker: WorkerId) -> Self {
        self.worker = worker;
        self
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn state(&self) -> DispatchState {
        self.state
    }

    pub fn progress(&self) -> &ProgressReporter {
        &self.progress
    }

    /// Creates the queue table and, if `seed` is set, enqueues unscored
    /// records. Returns the number of entries inserted.
    pub async fn prepare(&mut self, seed: bool) -> Result<u64, DispatchError> {
        self.store
            .ensure_schema()
            .await
            .map_err(DispatchError::Prepare)?;

        let inserted = if seed {
            let inserted = self.store.seed().await.map_err(DispatchError::Prepare)?;
            info!(inserted = inserted, "Seeded queue");
            inserted
        } else {
            0
        };

        self.refresh_remaining().await;
        Ok(inserted)
    }

    /// Runs batches until the queue drains, `stop` turns true, or the batch
    /// limit is reached. A stop request lets the in-flight batch finish.
    pub async fn run(
        &mut self,
        stop: watch::Receiver<bool>,
    ) -> Result<DispatchReport, DispatchError> {
        info!(
            worker = %self.worker,
            endpoints = self.pool.len(),
            capacity = self.pool.capacity(),
            batch_size = self.batch_size,
            policy = %self.policy,
            "Starting dispatch loop"
        );

        let reason = loop {
            if *stop.borrow() {
                info!("Stop requested, not claiming further batches");
                break StopReason::StopRequested;
            }
            if self
                .max_batches
                .is_some_and(|max| self.progress.batches() >= max)
            {
                break StopReason::BatchLimit;
            }

            self.state = DispatchState::Claiming;
            let entries = match self
                .store
                .claim_batch(self.worker, self.batch_size, self.lease)
                .await
            {
                Ok(entries) => entries,
                Err(e) => {
                    error!(error = %e, "Claiming a batch failed");
                    self.state = DispatchState::Idle;
                    return Err(DispatchError::Claim(e));
                }
            };

            if entries.is_empty() {
                self.state = DispatchState::Drained;
                break StopReason::Drained;
            }

            if let Err(e) = self.run_batch(entries).await {
                self.write_metrics();
                self.progress.finish();
                return Err(e);
            }
            self.state = DispatchState::Idle;
        };

        if reason == StopReason::Drained {
            self.refresh_remaining().await;
        }
        self.write_metrics();
        let progress = self.progress.finish();

        Ok(DispatchReport {
            reason,
            batches: self.progress.batches(),
            progress,
        })
    }

    /// Scores and persists one claimed batch.
    async fn run_batch(&mut self, entries: Vec<QueueEntry>) -> Result<WriteSummary, DispatchError> {
        let started = Instant::now();
        let count = entries.len();

        self.state = DispatchState::Dispatching;
        let endpoints = self.pool.assign(count);
        debug!(worker = %self.worker, entries = count, "Dispatching batch");

        self.state = DispatchState::Awaiting;
        self.metrics.set_in_flight(count);
        let client = &self.client;
        let outcomes = join_all(
            entries
                .iter()
                .zip(endpoints.iter())
                .map(|(entry, endpoint)| client.score(&entry.doi, endpoint)),
        )
        .await;
        self.metrics.set_in_flight(0);

        let batch = BatchResult::new(
            entries
                .into_iter()
                .zip(outcomes)
                .map(|(entry, outcome)| BatchItem { entry, outcome })
                .collect(),
        );

        self.state = DispatchState::Persisting;
        let summary = match self
            .store
            .write_batch(self.worker, &batch, self.policy)
            .await
        {
            Ok(summary) => summary,
            Err(source) => {
                let ids = batch.entry_ids();
                error!(
                    error = %source,
                    entries = ids.len(),
                    "Persisting batch failed, releasing claims"
                );
                match self.store.release(self.worker, &ids).await {
                    Ok(released) => warn!(released = released, "Released batch claims"),
                    Err(e) => error!(
                        error = %e,
                        "Releasing claims failed; entries become claimable after the lease expires"
                    ),
                }
                self.state = DispatchState::Idle;
                return Err(DispatchError::Persist {
                    entries: ids.len(),
                    source,
                });
            }
        };

        let succeeded = batch.succeeded();
        let failed = batch.failed();
        let expected_completed = match self.policy {
            FailurePolicy::Skip => count,
            FailurePolicy::MarkFailed => succeeded,
        };
        if (summary.completed as usize) < expected_completed {
            warn!(
                expected = expected_completed,
                completed = summary.completed,
                "Some claims were taken over before completion"
            );
        }

        for item in &batch.items {
            self.metrics.record_record(if item.outcome.is_success() {
                "scored"
            } else {
                "failed"
            });
        }
        self.progress.record_batch(succeeded as u64, failed as u64);
        if self.progress.needs_remaining_refresh() {
            self.refresh_remaining().await;
        }

        let elapsed = started.elapsed();
        self.metrics.record_batch(elapsed.as_secs_f64());
        debug!(
            batch = self.progress.batches(),
            succeeded = succeeded,
            failed = failed,
            scored = summary.scored,
            parked = summary.parked,
            elapsed_ms = elapsed.as_millis() as u64,
            "Batch persisted"
        );

        self.progress.maybe_emit();
        self.write_metrics();
        Ok(summary)
    }

    /// Re-queries the remaining count. Failure only costs a stale figure.
    async fn refresh_remaining(&mut self) {
        match self.store.remaining().await {
            Ok(remaining) => {
                self.progress.set_remaining(remaining);
                self.metrics.set_queue_remaining(remaining);
            }
            Err(e) => warn!(error = %e, "Could not refresh remaining count"),
        }
    }

    fn write_metrics(&self) {
        if let Some(path) = &self.metrics_file {
            if let Err(e) = write_metrics_file(path) {
                warn!(path = %path.display(), error = %e, "Could not write metrics file");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ScoringError;
    use crate::scoring::{Endpoint, FujiApi, FujiScore, RetryPolicy};
    use crate::storage::MemoryStore;
    use async_trait::async_trait;
    use chrono::Utc;

    /// Scores every key with a fixed value, failing keys that start with "bad".
    struct FixedApi;

    #[async_trait]
    impl FujiApi for FixedApi {
        async fn evaluate(
            &self,
            _endpoint: &Endpoint,
            identifier: &str,
        ) -> Result<FujiScore, ScoringError> {
            if identifier.starts_with("bad") {
                return Err(ScoringError::from_status(404, "not found"));
            }
            Ok(FujiScore {
                score: 42.0,
                evaluated_at: Utc::now(),
            })
        }
    }

    fn dispatcher(store: Arc<MemoryStore>, config: &PipelineConfig) -> BatchDispatcher<MemoryStore> {
        let client = ScoringClient::new(
            Arc::new(FixedApi),
            RetryPolicy::new(3, Duration::from_millis(1)),
        )
        .expect("client");
        let pool = EndpointPool::new(
            vec!["http://fuji1/e".to_string(), "http://fuji2/e".to_string()],
            config.per_endpoint_concurrency,
        )
        .expect("pool");
        BatchDispatcher::new(store, client, pool, config)
    }

    fn config() -> PipelineConfig {
        PipelineConfig::default()
            .with_database_url("memory")
            .with_per_endpoint_concurrency(1)
    }

    #[tokio::test]
    async fn test_batch_size_defaults_to_capacity() {
        let store = Arc::new(MemoryStore::new());
        let d = dispatcher(store.clone(), &config());
        assert_eq!(d.batch_size(), 2);

        let d = dispatcher(store.clone(), &config().with_batch_size(1));
        assert_eq!(d.batch_size(), 1);
    }

    #[tokio::test]
    async fn test_batch_size_is_clamped_to_capacity() {
        let store = Arc::new(MemoryStore::new());
        let d = dispatcher(store.clone(), &config().with_batch_size(7));
        assert_eq!(d.batch_size(), 2);

        let d = dispatcher(
            store,
            &config().with_per_endpoint_concurrency(3).with_batch_size(7),
        );
        assert_eq!(d.batch_size(), 6);
    }

    #[tokio::test]
    async fn test_drains_queue() {
        let store =
            Arc::new(MemoryStore::with_records((1..=5).map(|i| (i, format!("10.1/{}", i)))).await);
        let mut d = dispatcher(store.clone(), &config());
        assert_eq!(d.prepare(true).await.expect("prepare"), 5);

        let (_tx, rx) = watch::channel(false);
        let report = d.run(rx).await.expect("run");
        assert_eq!(report.reason, StopReason::Drained);
        assert_eq!(report.batches, 3);
        assert_eq!(report.progress.succeeded, 5);
        assert_eq!(report.progress.remaining, Some(0));
        assert_eq!(d.state(), DispatchState::Drained);
        assert_eq!(store.remaining().await.expect("remaining"), 0);
    }

    #[tokio::test]
    async fn test_permanent_failures_do_not_abort() {
        let store = Arc::new(MemoryStore::with_records([(1, "10.1/a"), (2, "bad/b")]).await);
        let mut d = dispatcher(
            store.clone(),
            &config().with_failure_policy(FailurePolicy::MarkFailed),
        );
        d.prepare(true).await.expect("prepare");

        let (_tx, rx) = watch::channel(false);
        let report = d.run(rx).await.expect("run");
        assert_eq!(report.progress.succeeded, 1);
        assert_eq!(report.progress.failed, 1);
        assert_eq!(store.counts().await.expect("counts").failed, 1);
        assert!(store.last_error(2).await.unwrap_or_default().contains("404"));
    }

    #[tokio::test]
    async fn test_stop_before_first_batch() {
        let store = Arc::new(MemoryStore::with_records([(1, "10.1/a")]).await);
        let mut d = dispatcher(store.clone(), &config());
        d.prepare(true).await.expect("prepare");

        let (tx, rx) = watch::channel(false);
        tx.send(true).expect("send");
        let report = d.run(rx).await.expect("run");
        assert_eq!(report.reason, StopReason::StopRequested);
        assert_eq!(report.batches, 0);
        assert_eq!(store.remaining().await.expect("remaining"), 1);
    }

    #[tokio::test]
    async fn test_batch_limit() {
        let store =
            Arc::new(MemoryStore::with_records((1..=6).map(|i| (i, format!("10.1/{}", i)))).await);
        let mut d = dispatcher(store.clone(), &config().with_max_batches(1));
        d.prepare(true).await.expect("prepare");

        let (_tx, rx) = watch::channel(false);
        let report = d.run(rx).await.expect("run");
        assert_eq!(report.reason, StopReason::BatchLimit);
        assert_eq!(report.batches, 1);
        assert_eq!(store.remaining().await.expect("remaining"), 4);
    }

    #[tokio::test]
    async fn test_persist_failure_releases_batch() {
        let store = Arc::new(MemoryStore::with_records([(1, "10.1/a"), (2, "10.1/b")]).await);
        let mut d = dispatcher(store.clone(), &config());
        d.prepare(true).await.expect("prepare");
        store.fail_next_writes(1).await;

        let (_tx, rx) = watch::channel(false);
        let err = d.run(rx).await.expect_err("persist failure");
        assert!(matches!(err, DispatchError::Persist { entries: 2, .. }));

        let counts = store.counts().await.expect("counts");
        assert_eq!(counts.pending, 2);
        assert_eq!(counts.claimed, 0);
        assert_eq!(store.record(1).await.and_then(|r| r.score), None);
    }
}
