//! Export of scored records.
//!
//! Scored records are written as numbered NDJSON files (`1.ndjson`,
//! `2.ndjson`, ...) for downstream indexing.

pub mod ndjson;

pub use ndjson::{ExportRecord, ExportSummary, NdjsonExporter, RECORDS_PER_FILE};
