//! Durable job queue over PostgreSQL.
//!
//! The storage system consists of:
//! - **Queue contracts**: [`QueueStore`], [`ResultWriter`] and [`ScoredSource`]
//! - **Postgres store**: [`PgStore`], the production implementation
//! - **Memory store**: [`MemoryStore`], same semantics without a database
//! - **Migrations**: creates the queue table on first start
//!
//! # Usage
//!
//! ```rust,ignore
//! use fujifill::storage::{DatabaseOptions, PgStore, QueueStore};
//!
//! let store = PgStore::connect(&DatabaseOptions::new("postgres://localhost/pangaea")).await?;
//! store.ensure_schema().await?;
//! let inserted = store.seed().await?;
//! let batch = store.claim_batch(worker_id, 12, lease).await?;
//! ```

pub mod memory;
pub mod migrations;
pub mod postgres;
pub mod queue;
pub mod schema;

pub use memory::{MemoryRecord, MemoryStore};
pub use migrations::{MigrationError, MigrationRunner};
pub use postgres::{DatabaseOptions, DbRetryPolicy, PgStore};
pub use queue::{
    BatchItem, BatchResult, EntryState, FailurePolicy, QueueCounts, QueueEntry, QueueStore,
    ReleaseScope, ResultWriter, ScoredRecord, ScoredSource, StoreError, WorkerId, WriteSummary,
};
