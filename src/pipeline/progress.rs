//! Progress reporting for the dispatch loop.
//!
//! A single [`ProgressReporter`] is owned by the dispatcher and updated
//! only at batch boundaries, so no counter is ever shared between tasks.
//! The remaining-queue figure is a snapshot re-queried from the store,
//! since other processes drain the same queue.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Emit at least this often in records, regardless of the time interval.
pub const EMIT_EVERY_RECORDS: u64 = 100;

/// Length of the sliding window used for the recent rate.
pub const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Point-in-time view of the counters.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Last observed queue depth across all processes.
    pub remaining: Option<u64>,
    /// `processed / (processed + remaining)` as a percentage.
    pub percent: Option<f64>,
    pub elapsed: Duration,
    /// Records per second since start.
    pub overall_rate: f64,
    /// Records per second over the last [`RATE_WINDOW`].
    pub window_rate: f64,
}

/// Owned progress aggregator.
#[derive(Debug)]
pub struct ProgressReporter {
    started: Instant,
    processed: u64,
    succeeded: u64,
    failed: u64,
    batches: u64,
    remaining: Option<u64>,
    processed_since_refresh: u64,
    refresh_every: u64,
    interval: Duration,
    last_emit: Instant,
    processed_at_last_emit: u64,
    /// (time, cumulative processed) samples taken at batch boundaries.
    samples: VecDeque<(Instant, u64)>,
    finished: bool,
}

impl ProgressReporter {
    /// Creates a reporter that emits every `interval` and asks for a fresh
    /// remaining count every `refresh_every` processed records.
    pub fn new(interval: Duration, refresh_every: u64) -> Self {
        Self::starting_at(Instant::now(), interval, refresh_every)
    }

    pub fn starting_at(started: Instant, interval: Duration, refresh_every: u64) -> Self {
        let mut samples = VecDeque::new();
        samples.push_back((started, 0));
        Self {
            started,
            processed: 0,
            succeeded: 0,
            failed: 0,
            batches: 0,
            remaining: None,
            processed_since_refresh: 0,
            refresh_every: refresh_every.max(1),
            interval,
            last_emit: started,
            processed_at_last_emit: 0,
            samples,
            finished: false,
        }
    }

    /// Adds one finished batch.
    pub fn record_batch(&mut self, succeeded: u64, failed: u64) {
        self.record_batch_at(Instant::now(), succeeded, failed);
    }

    pub fn record_batch_at(&mut self, now: Instant, succeeded: u64, failed: u64) {
        let total = succeeded + failed;
        self.succeeded += succeeded;
        self.failed += failed;
        self.processed += total;
        self.processed_since_refresh += total;
        self.batches += 1;
        // Our own work shrinks the queue even between refreshes.
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining = remaining.saturating_sub(total);
        }

        self.samples.push_back((now, self.processed));
        let horizon = now.checked_sub(RATE_WINDOW);
        // Keep one sample at or before the window start as the baseline.
        while self.samples.len() > 2 {
            match (horizon, self.samples.get(1)) {
                (Some(horizon), Some((t, _))) if *t <= horizon => {
                    self.samples.pop_front();
                }
                _ => break,
            }
        }
    }

    /// Replaces the remaining-queue snapshot.
    pub fn set_remaining(&mut self, remaining: u64) {
        self.remaining = Some(remaining);
        self.processed_since_refresh = 0;
    }

    /// Whether the remaining count should be re-queried.
    pub fn needs_remaining_refresh(&self) -> bool {
        self.remaining.is_none() || self.processed_since_refresh >= self.refresh_every
    }

    pub fn processed(&self) -> u64 {
        self.processed
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded
    }

    pub fn failed(&self) -> u64 {
        self.failed
    }

    pub fn batches(&self) -> u64 {
        self.batches
    }

    /// Whether the closing summary has been emitted.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.snapshot_at(Instant::now())
    }

    pub fn snapshot_at(&self, now: Instant) -> ProgressSnapshot {
        let elapsed = now.saturating_duration_since(self.started);
        let percent = self.remaining.and_then(|remaining| {
            let total = self.processed + remaining;
            (total > 0).then(|| self.processed as f64 / total as f64 * 100.0)
        });

        ProgressSnapshot {
            processed: self.processed,
            succeeded: self.succeeded,
            failed: self.failed,
            remaining: self.remaining,
            percent,
            elapsed,
            overall_rate: rate(self.processed, elapsed),
            window_rate: self.window_rate(now),
        }
    }

    fn window_rate(&self, now: Instant) -> f64 {
        let horizon = now.checked_sub(RATE_WINDOW);
        let baseline = self
            .samples
            .iter()
            .rev()
            .find(|(t, _)| horizon.map(|h| *t <= h).unwrap_or(false))
            .or_else(|| self.samples.front());

        match baseline {
            Some((t, processed)) => {
                rate(self.processed - processed, now.saturating_duration_since(*t))
            }
            None => 0.0,
        }
    }

    /// Whether a progress line is due after the latest batch.
    pub fn should_emit_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_emit) >= self.interval
            || self.processed - self.processed_at_last_emit >= EMIT_EVERY_RECORDS
    }

    /// Emits a progress line if one is due. Returns whether it did.
    pub fn maybe_emit(&mut self) -> bool {
        let now = Instant::now();
        if !self.should_emit_at(now) {
            return false;
        }
        self.emit_at(now);
        true
    }

    fn emit_at(&mut self, now: Instant) {
        let snap = self.snapshot_at(now);
        self.last_emit = now;
        self.processed_at_last_emit = self.processed;

        tracing::info!(
            processed = snap.processed,
            succeeded = snap.succeeded,
            failed = snap.failed,
            remaining = snap.remaining,
            progress_pct = snap.percent.map(|p| format!("{:.1}%", p)),
            elapsed_secs = snap.elapsed.as_secs(),
            rate_per_sec = format!("{:.2}", snap.overall_rate),
            window_rate_per_sec = format!("{:.2}", snap.window_rate),
            "Scoring progress"
        );
    }

    /// Emits the final summary and returns the closing snapshot.
    pub fn finish(&mut self) -> ProgressSnapshot {
        let now = Instant::now();
        let snap = self.snapshot_at(now);
        self.last_emit = now;
        self.processed_at_last_emit = self.processed;
        self.finished = true;

        tracing::info!(
            batches = self.batches,
            processed = snap.processed,
            succeeded = snap.succeeded,
            failed = snap.failed,
            remaining = snap.remaining,
            elapsed_secs = snap.elapsed.as_secs(),
            rate_per_sec = format!("{:.2}", snap.overall_rate),
            "Scoring run finished"
        );
        snap
    }
}

fn rate(count: u64, over: Duration) -> f64 {
    let secs = over.as_secs_f64();
    if secs > 0.0 {
        count as f64 / secs
    } else {
        0.0
    }
}
