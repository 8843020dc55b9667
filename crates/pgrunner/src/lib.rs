//! # pgrunner
//!
//! Runtime core of a PostgreSQL-backed background job runner: a long-lived
//! process that concurrently dequeues jobs from a SQL-managed queue,
//! executes user-supplied task handlers, and coordinates an orderly
//! lifecycle across signals, database disconnects, and schema migrations.
//!
//! ## Features
//!
//! - **Worker pool supervision**: a fixed set of concurrent workers with
//!   graceful and forceful shutdown modes
//! - **Change notifications**: a dedicated LISTEN/NOTIFY connection with
//!   jittered exponential reconnect, nudging idle workers when jobs arrive
//! - **Stuck-job recovery**: a randomized periodic tick that re-opens rows
//!   whose worker died mid-execution
//! - **Signal coordination**: one broker per process fans termination
//!   signals out to every pool, escalating graceful to forceful
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Runtime                              │
//! │     (pool registry, signal broker, recommended exit code)    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        WorkerPool                            │
//! │   (supervises workers, owns shutdown state, emits events)    │
//! └─────────────────────────────────────────────────────────────┘
//!                  │                         │
//!                  ▼                         ▼
//! ┌───────────────────────────┐  ┌───────────────────────────────┐
//! │       ListenerTask         │  │      ResetLockedTicker        │
//! │ (LISTEN/NOTIFY, reconnect) │  │ (randomized maintenance tick) │
//! └───────────────────────────┘  └───────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use pgrunner::prelude::*;
//!
//! let runtime = Runtime::new();
//! let pg = sqlx::PgPool::connect(&database_url).await?;
//! let store = Arc::new(PostgresMaintenanceStore::new(pg.clone()));
//!
//! let pool = WorkerPool::start(
//!     runtime.clone(),
//!     PoolOptions::default().with_concurrency(4),
//!     pg,
//!     store,
//!     my_worker_factory,
//! )?;
//!
//! // Runs until a termination signal (or an explicit shutdown) arrives.
//! pool.wait().await?;
//! std::process::exit(runtime.recommended_exit_code().unwrap_or(0));
//! ```

pub mod config;
pub mod events;
pub mod job;
pub mod listener;
pub mod pool;
pub mod reset_locked;
pub mod runtime;
pub mod signals;
pub mod store;
pub mod worker;

mod sync;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::PoolOptions;
    pub use crate::events::{EventBus, PoolEvent};
    pub use crate::job::Job;
    pub use crate::pool::{PoolCompletion, PoolError, WorkerPool};
    pub use crate::runtime::{Runtime, SCHEMA_MIGRATION_EXIT_CODE};
    pub use crate::store::{MaintenanceStore, PostgresMaintenanceStore, StoreError};
    pub use crate::worker::{Worker, WorkerContext, WorkerFactory};
}

// Re-export key types at crate root
pub use config::{ConfigError, PoolOptions, ENABLE_DANGEROUS_LOGS_ENV};
pub use events::{EventBus, PoolEvent};
pub use job::Job;
pub use pool::{PoolCompletion, PoolError, WorkerPool};
pub use runtime::{Runtime, SCHEMA_MIGRATION_EXIT_CODE};
pub use signals::{BrokerError, ShutdownSink, SignalBroker, SignalSubscription, TermSignal};
pub use store::{MaintenanceStore, PostgresMaintenanceStore, StoreError};
pub use worker::{Worker, WorkerContext, WorkerError, WorkerFactory};
