//! Prometheus metrics for the scoring pipeline.
//!
//! Covers FUJI request outcomes and latency per endpoint, records finished,
//! queue depth, in-flight records and batch durations. The snapshot can be
//! written to a textfile for scraping.
//!
//! # Example
//!
//! ```ignore
//! use fujifill::metrics::{init_metrics, write_metrics_file, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.set_queue_remaining(1200);
//!
//! write_metrics_file(std::path::Path::new("/var/lib/node_exporter/fujifill.prom"))?;
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics, write_metrics_file};

pub use prometheus::{
    BATCH_DURATION, FUJI_LATENCY, FUJI_REQUESTS_TOTAL, QUEUE_REMAINING, RECORDS_IN_FLIGHT,
    RECORDS_TOTAL, REGISTRY,
};
