//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by fujifill and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{
    CounterVec, Encoder, Gauge, Histogram, HistogramVec, Opts, Registry, TextEncoder,
};
use std::path::Path;
use std::sync::OnceLock;

/// Global Prometheus registry for all fujifill metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Total FUJI evaluation attempts, labeled by endpoint and outcome.
pub static FUJI_REQUESTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// FUJI evaluation latency in seconds, labeled by endpoint.
pub static FUJI_LATENCY: OnceLock<HistogramVec> = OnceLock::new();

/// Records finished by this process, labeled by status (scored/failed).
pub static RECORDS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Queue entries still needing work, as last observed.
pub static QUEUE_REMAINING: OnceLock<Gauge> = OnceLock::new();

/// Records currently being scored.
pub static RECORDS_IN_FLIGHT: OnceLock<Gauge> = OnceLock::new();

/// Wall time of one dispatch cycle, claim through persist.
pub static BATCH_DURATION: OnceLock<Histogram> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Recording before initialization is a no-op.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    // Scoring metrics
    let fuji_requests_total = CounterVec::new(
        Opts::new("fujifill_fuji_requests_total", "Total FUJI evaluation attempts"),
        &["endpoint", "outcome"],
    )?;

    let fuji_latency = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "fujifill_fuji_latency_seconds",
            "FUJI evaluation latency in seconds",
        )
        .buckets(vec![0.5, 1.0, 2.0, 5.0, 10.0, 20.0, 30.0, 60.0]),
        &["endpoint"],
    )?;

    let records_total = CounterVec::new(
        Opts::new("fujifill_records_total", "Records finished by this process"),
        &["status"],
    )?;

    // Queue metrics
    let queue_remaining = Gauge::new(
        "fujifill_queue_remaining",
        "Queue entries still needing work",
    )?;

    let records_in_flight = Gauge::new(
        "fujifill_records_in_flight",
        "Records currently being scored",
    )?;

    let batch_duration = Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "fujifill_batch_duration_seconds",
            "Dispatch cycle duration in seconds",
        )
        .buckets(vec![1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]),
    )?;

    registry.register(Box::new(fuji_requests_total.clone()))?;
    registry.register(Box::new(fuji_latency.clone()))?;
    registry.register(Box::new(records_total.clone()))?;
    registry.register(Box::new(queue_remaining.clone()))?;
    registry.register(Box::new(records_in_flight.clone()))?;
    registry.register(Box::new(batch_duration.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = FUJI_REQUESTS_TOTAL.set(fuji_requests_total);
    let _ = FUJI_LATENCY.set(fuji_latency);
    let _ = RECORDS_TOTAL.set(records_total);
    let _ = QUEUE_REMAINING.set(queue_remaining);
    let _ = RECORDS_IN_FLIGHT.set(records_in_flight);
    let _ = BATCH_DURATION.set(batch_duration);

    tracing::debug!("Prometheus metrics initialized");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// If the registry has not been initialized or encoding fails, returns a
/// comment line describing the problem.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

/// Writes the current metrics snapshot to `path`, for node-exporter style
/// textfile collection.
pub fn write_metrics_file(path: &Path) -> std::io::Result<()> {
    let tmp = path.with_extension("prom.tmp");
    std::fs::write(&tmp, export_metrics())?;
    std::fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        let result = init_metrics();
        // First call should succeed or metrics already initialized
        assert!(result.is_ok() || REGISTRY.get().is_some());
    }

    #[test]
    fn test_metrics_after_init() {
        let _ = init_metrics();

        let metrics = export_metrics();
        assert!(!metrics.is_empty());
        if REGISTRY.get().is_some() {
            assert!(!metrics.starts_with("# Error"));
        }
    }

    #[test]
    fn test_write_metrics_file() {
        let _ = init_metrics();
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("fujifill.prom");

        write_metrics_file(&path).expect("write metrics");
        let written = std::fs::read_to_string(&path).expect("read metrics");
        assert!(!written.starts_with("# Error"));
        assert!(!path.with_extension("prom.tmp").exists());
    }
}
