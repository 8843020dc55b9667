//! Worker interface
//!
//! The pool supervises workers but does not execute jobs itself. A worker
//! implementation owns its dequeue loop and handler dispatch; the pool only
//! needs the small surface defined here: a nudge when new work may be
//! available, the currently held job for shutdown bookkeeping, and release.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use crate::events::EventBus;
use crate::job::Job;

/// Worker errors surfaced to the pool
#[derive(Debug, Clone, thiserror::Error)]
pub enum WorkerError {
    /// Release did not complete cleanly
    #[error("worker release failed: {0}")]
    Release(String),
}

/// A job-consuming agent supervised by a pool
///
/// Implementations consume one job at a time over short-lived database
/// transactions and observe [`WorkerContext::cancel`] at every suspension
/// point so long-running SQL is cancelled when the pool aborts.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Stable identifier, also used as the queue lock holder
    fn worker_id(&self) -> &str;

    /// Hint that new work may be available.
    ///
    /// Returns true if the hint was accepted (the worker was idle and will
    /// check the queue). A busy worker declines so the caller can try the
    /// next one.
    fn nudge(&self) -> bool;

    /// The job currently being executed, if any
    fn active_job(&self) -> Option<Job>;

    /// Stop consuming and wait for the in-flight job to finish.
    async fn release(&self) -> Result<(), WorkerError>;
}

/// Everything a worker needs from its pool
#[derive(Clone)]
pub struct WorkerContext {
    /// Identifier minted by the pool (`worker-<uuid>`)
    pub worker_id: String,

    /// Cancellation observed by worker SQL; derived from the pool abort signal
    pub cancel: CancellationToken,

    /// Shared database pool for short-lived checkouts
    pub pg: PgPool,

    /// The pool's event bus
    pub events: EventBus,
}

/// Builds one worker per concurrency slot at pool construction.
///
/// Workers are only ever constructed here; the pool never adds workers
/// after shutdown has begun.
pub type WorkerFactory = Arc<dyn Fn(WorkerContext) -> Arc<dyn Worker> + Send + Sync>;
