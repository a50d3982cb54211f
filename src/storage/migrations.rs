//! Database migration helpers.
//!
//! This module applies the queue schema and records which steps ran, so
//! `ensure_schema` is cheap and safe to call on every start, including from
//! several processes at once.

use sqlx::PgPool;
use thiserror::Error;

use super::schema;

/// Advisory lock key serializing schema changes across processes.
const MIGRATION_LOCK_KEY: i64 = 0x6675_6a69_6669_6c6c;

/// Errors that can occur during migration operations.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// Database query failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Migration script failed to execute.
    #[error("Migration {name} failed: {source}")]
    MigrationFailed {
        name: String,
        #[source]
        source: sqlx::Error,
    },
}

/// Migration runner for applying schema changes.
pub struct MigrationRunner {
    pool: PgPool,
}

impl MigrationRunner {
    /// Creates a new migration runner.
    ///
    /// # Arguments
    ///
    /// * `pool` - PostgreSQL connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Runs all pending migrations in a single transaction.
    ///
    /// A transaction-scoped advisory lock makes concurrent callers queue up
    /// behind each other; the first one applies the steps and the rest find
    /// them already recorded. Returns the number of steps applied.
    pub async fn run_migrations(&self) -> Result<usize, MigrationError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(MIGRATION_LOCK_KEY)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS _fujifill_migrations (
                id SERIAL PRIMARY KEY,
                name VARCHAR(255) NOT NULL UNIQUE,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        let mut applied = 0;
        for (idx, statement) in schema::all_schema_statements().iter().enumerate() {
            let name = migration_name(idx);

            let exists: Option<(i32,)> =
                sqlx::query_as("SELECT id FROM _fujifill_migrations WHERE name = $1")
                    .bind(&name)
                    .fetch_optional(&mut *tx)
                    .await?;
            if exists.is_some() {
                continue;
            }

            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(|source| MigrationError::MigrationFailed {
                    name: name.clone(),
                    source,
                })?;

            sqlx::query("INSERT INTO _fujifill_migrations (name) VALUES ($1)")
                .bind(&name)
                .execute(&mut *tx)
                .await?;

            applied += 1;
        }

        tx.commit().await?;

        if applied > 0 {
            tracing::info!(applied = applied, "Applied queue schema migrations");
        }
        Ok(applied)
    }
}

fn migration_name(idx: usize) -> String {
    format!("queue_v1_part_{}", idx)
}
