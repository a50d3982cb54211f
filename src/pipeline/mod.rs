//! Batch scoring pipeline.
//!
//! The pipeline drains the durable job queue in batches:
//!
//! - **Config**: process settings loaded from the environment and the CLI
//! - **Dispatcher**: claim, score and persist cycles with a batch barrier
//! - **Progress**: counters, completion percentage and throughput
//!
//! # Pipeline Flow
//!
//! 1. **Prepare**: the queue table is created and unscored records enqueued
//! 2. **Claim**: a batch of entries is claimed for this worker
//! 3. **Dispatch**: entries are assigned round-robin to the endpoint pool
//! 4. **Await**: every scoring future in the batch settles
//! 5. **Persist**: scores and queue updates are written in one transaction
//!
//! The loop ends when a claim comes back empty, a stop is requested, or the
//! batch limit is reached.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use fujifill::pipeline::{BatchDispatcher, PipelineConfig};
//!
//! let config = PipelineConfig::from_env()?;
//! let store = Arc::new(PgStore::connect(&config.database_options()).await?);
//! let mut dispatcher = BatchDispatcher::new(store, client, pool, &config);
//!
//! dispatcher.prepare(true).await?;
//! let (_stop_tx, stop_rx) = tokio::sync::watch::channel(false);
//! let report = dispatcher.run(stop_rx).await?;
//! println!("{} records processed", report.progress.processed);
//! ```

pub mod config;
pub mod dispatcher;
pub mod progress;

pub use config::{endpoint_source, ConfigError, PipelineConfig, MAX_ATTEMPTS_LIMIT};
pub use dispatcher::{BatchDispatcher, DispatchReport, DispatchState, StopReason};
pub use progress::{ProgressReporter, ProgressSnapshot, EMIT_EVERY_RECORDS, RATE_WINDOW};
