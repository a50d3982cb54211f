//! fujifill: batch FUJI FAIR scoring for dataset records.
//!
//! This library drains a PostgreSQL job queue of unscored records, scores
//! each one against a pool of FUJI endpoints, and writes the scores back.

pub mod cli;
pub mod error;
pub mod export;
pub mod metrics;
pub mod pipeline;
pub mod scoring;
pub mod storage;

// Re-export commonly used error types
pub use error::{DispatchError, ExportError, ScoringError};
pub use pipeline::ConfigError;
pub use storage::StoreError;
