//! Maintenance store collaborators
//!
//! The pool does not own job execution; it only needs two SQL operations
//! during its lifecycle: re-opening rows whose worker died mid-execution,
//! and failing jobs abandoned at shutdown. Both live behind
//! [`MaintenanceStore`] so the runtime core stays independent of the queue
//! schema.

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use crate::job::Job;

/// Error type for store operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        Self::Database(e.to_string())
    }
}

/// Queue maintenance operations invoked by the pool
///
/// Failures from either operation are retriable: a failed
/// [`reset_locked`](MaintenanceStore::reset_locked) is logged and retried
/// on the next tick, and a failed
/// [`fail_jobs`](MaintenanceStore::fail_jobs) surfaces through the
/// shutdown error events.
#[async_trait]
pub trait MaintenanceStore: Send + Sync {
    /// Re-open jobs whose lock holder is gone.
    async fn reset_locked(&self) -> Result<(), StoreError>;

    /// Mark the given jobs failed with a message and release their locks.
    ///
    /// `worker_ids` scopes the update to locks still held by those workers.
    /// Returns the number of jobs updated.
    async fn fail_jobs(
        &self,
        worker_ids: &[String],
        jobs: &[Job],
        message: &str,
    ) -> Result<u64, StoreError>;
}

/// PostgreSQL implementation of [`MaintenanceStore`]
///
/// Acquires a connection from the shared pool per call; the connection is
/// returned on every exit path.
#[derive(Clone)]
pub struct PostgresMaintenanceStore {
    pool: PgPool,
}

impl PostgresMaintenanceStore {
    /// Create a store over the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Locks older than this are considered abandoned.
const STALE_LOCK_INTERVAL: &str = "4 hours";

#[async_trait]
impl MaintenanceStore for PostgresMaintenanceStore {
    #[instrument(skip(self))]
    async fn reset_locked(&self) -> Result<(), StoreError> {
        let jobs = sqlx::query_as::<_, Job>(
            r#"
            UPDATE jobs
            SET locked_at = NULL, locked_by = NULL
            WHERE locked_at < now() - $1::interval
            RETURNING *
            "#,
        )
        .bind(STALE_LOCK_INTERVAL)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to reset locked jobs: {}", e);
            StoreError::Database(e.to_string())
        })?;

        if !jobs.is_empty() {
            info!(count = jobs.len(), "reset locked jobs");
        }
        Ok(())
    }

    #[instrument(skip(self, jobs))]
    async fn fail_jobs(
        &self,
        worker_ids: &[String],
        jobs: &[Job],
        message: &str,
    ) -> Result<u64, StoreError> {
        if jobs.is_empty() {
            return Ok(0);
        }

        let job_ids: Vec<Uuid> = jobs.iter().map(|job| job.id).collect();

        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET last_error = $3,
                run_at = greatest(now(), run_at),
                locked_at = NULL,
                locked_by = NULL
            WHERE id = ANY($1) AND locked_by = ANY($2)
            "#,
        )
        .bind(&job_ids)
        .bind(worker_ids)
        .bind(message)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to fail jobs: {}", e);
            StoreError::Database(e.to_string())
        })?;

        debug!(rows = result.rows_affected(), "failed jobs");
        Ok(result.rows_affected())
    }
}
