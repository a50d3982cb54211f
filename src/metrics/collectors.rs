//! High-level interface for recording pipeline metrics.
//!
//! `MetricsCollector` wraps the raw Prometheus statics with consistent
//! labeling. Every method is a no-op until `init_metrics()` has run, so
//! library code can record unconditionally.

use super::prometheus::{
    BATCH_DURATION, FUJI_LATENCY, FUJI_REQUESTS_TOTAL, QUEUE_REMAINING, RECORDS_IN_FLIGHT,
    RECORDS_TOTAL,
};

/// Metrics collector for recording fujifill operational metrics.
///
/// # Example
///
/// ```ignore
/// use fujifill::metrics::{init_metrics, MetricsCollector};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
///
/// collector.record_request("http://localhost:54001/fuji/api/v1/evaluate", "success", 12.5);
/// collector.record_record("scored");
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record one FUJI evaluation attempt.
    ///
    /// # Arguments
    ///
    /// * `endpoint` - Endpoint URL the attempt went to
    /// * `outcome` - "success", "transient" or "permanent"
    /// * `latency_secs` - Attempt latency in seconds
    pub fn record_request(&self, endpoint: &str, outcome: &str, latency_secs: f64) {
        if let Some(requests) = FUJI_REQUESTS_TOTAL.get() {
            requests.with_label_values(&[endpoint, outcome]).inc();
        }

        if let Some(latency) = FUJI_LATENCY.get() {
            latency.with_label_values(&[endpoint]).observe(latency_secs);
        }

        tracing::trace!(
            endpoint = endpoint,
            outcome = outcome,
            latency_secs = latency_secs,
            "Recorded FUJI request metric"
        );
    }

    /// Record a finished record ("scored" or "failed").
    pub fn record_record(&self, status: &str) {
        if let Some(records) = RECORDS_TOTAL.get() {
            records.with_label_values(&[status]).inc();
        }
    }

    pub fn set_queue_remaining(&self, remaining: u64) {
        if let Some(gauge) = QUEUE_REMAINING.get() {
            gauge.set(remaining as f64);
        }

        tracing::trace!(remaining = remaining, "Updated queue remaining metric");
    }

    pub fn set_in_flight(&self, count: usize) {
        if let Some(gauge) = RECORDS_IN_FLIGHT.get() {
            gauge.set(count as f64);
        }
    }

    /// Record the wall time of one dispatch cycle.
    pub fn record_batch(&self, duration_secs: f64) {
        if let Some(histogram) = BATCH_DURATION.get() {
            histogram.observe(duration_secs);
        }

        tracing::trace!(duration_secs = duration_secs, "Recorded batch metric");
    }
}
