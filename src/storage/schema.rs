//! Database schema constants and SQL queries.
//!
//! This module contains the queue table DDL and every statement the
//! Postgres store runs against the queue and the source table.

/// Creates the queue table. Compatible with queues created by older tooling
/// that only had `(id, dataset_id, doi)`; the remaining columns are added by
/// [`ADD_CLAIM_COLUMNS`].
pub const CREATE_JOBS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS fuji_jobs (
    id          BIGSERIAL PRIMARY KEY,
    dataset_id  BIGINT NOT NULL UNIQUE,
    doi         TEXT   NOT NULL
)
"#;

/// Claim bookkeeping columns.
pub const ADD_CLAIM_COLUMNS: &str = r#"
ALTER TABLE fuji_jobs
    ADD COLUMN IF NOT EXISTS state      TEXT        NOT NULL DEFAULT 'pending',
    ADD COLUMN IF NOT EXISTS claimed_by UUID,
    ADD COLUMN IF NOT EXISTS claimed_at TIMESTAMPTZ,
    ADD COLUMN IF NOT EXISTS attempts   INTEGER     NOT NULL DEFAULT 0,
    ADD COLUMN IF NOT EXISTS last_error TEXT,
    ADD COLUMN IF NOT EXISTS created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
"#;

/// Index used by the claim query.
pub const CREATE_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_fuji_jobs_state_id ON fuji_jobs(state, id)
"#;

/// Returns all schema statements in the order they must run.
pub fn all_schema_statements() -> Vec<&'static str> {
    vec![CREATE_JOBS_TABLE, ADD_CLAIM_COLUMNS, CREATE_INDEXES]
}

/// Enqueues every unscored dataset that has no queue entry yet.
pub const SEED_JOBS: &str = r#"
INSERT INTO fuji_jobs (dataset_id, doi)
SELECT id, doi
FROM "Dataset"
WHERE score IS NULL
  AND doi IS NOT NULL
ON CONFLICT (dataset_id) DO NOTHING
"#;

/// Atomically claims up to `$2` entries for worker `$1`.
///
/// Pending entries and claims older than `$3` seconds are eligible. Rows
/// locked by a concurrent claimer are skipped, never waited on, so two
/// claimers can never receive the same row.
pub const CLAIM_BATCH: &str = r#"
UPDATE fuji_jobs AS j
SET state = 'claimed',
    claimed_by = $1,
    claimed_at = NOW(),
    attempts = j.attempts + 1
WHERE j.id IN (
    SELECT id
    FROM fuji_jobs
    WHERE state = 'pending'
       OR (state = 'claimed' AND claimed_at < NOW() - ($3::DOUBLE PRECISION * INTERVAL '1 second'))
    ORDER BY id
    LIMIT $2
    FOR UPDATE SKIP LOCKED
)
RETURNING j.id, j.dataset_id, j.doi, j.attempts, j.claimed_at
"#;

/// Deletes finished entries still owned by the worker.
pub const COMPLETE_JOBS: &str = r#"
DELETE FROM fuji_jobs
WHERE id = ANY($1)
  AND claimed_by = $2
"#;

/// Returns entries owned by the worker to the pending state.
pub const RELEASE_JOBS: &str = r#"
UPDATE fuji_jobs
SET state = 'pending', claimed_by = NULL, claimed_at = NULL
WHERE id = ANY($1)
  AND claimed_by = $2
  AND state = 'claimed'
"#;

/// Returns every claimed entry to pending, regardless of owner.
pub const RELEASE_ALL_CLAIMS: &str = r#"
UPDATE fuji_jobs
SET state = 'pending', claimed_by = NULL, claimed_at = NULL
WHERE state = 'claimed'
"#;

/// Returns claims older than `$1` seconds to pending.
pub const RELEASE_STALE_CLAIMS: &str = r#"
UPDATE fuji_jobs
SET state = 'pending', claimed_by = NULL, claimed_at = NULL
WHERE state = 'claimed'
  AND claimed_at < NOW() - ($1::DOUBLE PRECISION * INTERVAL '1 second')
"#;

/// Moves failed entries back to pending.
pub const REQUEUE_FAILED: &str = r#"
UPDATE fuji_jobs
SET state = 'pending', last_error = NULL
WHERE state = 'failed'
"#;

/// Writes scores for a batch of datasets. Timestamps are stored as UTC.
pub const UPDATE_SCORES: &str = r#"
UPDATE "Dataset" AS d
SET score = u.score,
    evaluationdate = u.evaluated_at AT TIME ZONE 'UTC'
FROM UNNEST($1::BIGINT[], $2::DOUBLE PRECISION[], $3::TIMESTAMPTZ[]) AS u(id, score, evaluated_at)
WHERE d.id = u.id
"#;

/// Parks failed entries owned by the worker with their failure reason.
pub const MARK_FAILED: &str = r#"
UPDATE fuji_jobs AS j
SET state = 'failed',
    last_error = u.reason,
    claimed_by = NULL,
    claimed_at = NULL
FROM UNNEST($1::BIGINT[], $2::TEXT[]) AS u(id, reason)
WHERE j.id = u.id
  AND j.claimed_by = $3
"#;

/// Entries that still need work (pending or claimed).
pub const COUNT_REMAINING: &str = "SELECT COUNT(*) FROM fuji_jobs WHERE state <> 'failed'";

/// Entry counts per state.
pub const COUNT_BY_STATE: &str = "SELECT state, COUNT(*) AS n FROM fuji_jobs GROUP BY state";

/// Datasets that still lack a score and can be scored.
pub const COUNT_UNSCORED: &str =
    r#"SELECT COUNT(*) FROM "Dataset" WHERE score IS NULL AND doi IS NOT NULL"#;

/// Datasets that have a score.
pub const COUNT_SCORED: &str = r#"SELECT COUNT(*) FROM "Dataset" WHERE score IS NOT NULL"#;

/// Keyset page of scored datasets after id `$1`, `$2` rows at a time.
pub const SELECT_SCORED_PAGE: &str = r#"
SELECT id, doi, score, evaluationdate
FROM "Dataset"
WHERE score IS NOT NULL
  AND id > $1
ORDER BY id
LIMIT $2
"#;

/// Table names in the schema.
pub mod tables {
    /// Source table holding the records being scored.
    pub const DATASET: &str = "Dataset";
    /// Durable job queue.
    pub const JOBS: &str = "fuji_jobs";
    /// Applied schema steps.
    pub const MIGRATIONS: &str = "_fujifill_migrations";
}
