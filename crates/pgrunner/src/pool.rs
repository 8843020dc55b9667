//! Worker pool supervisor
//!
//! A pool owns N workers, one notification listener, and one reset-locked
//! ticker, and drives their shared lifecycle: creation, notification
//! dispatch, graceful or forceful shutdown, and exactly-once termination.
//!
//! Pool state is mutated behind a single mutex; background tasks interact
//! with it only through cancellation tokens and the event bus.

use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use futures::future::join_all;
use sqlx::PgPool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::{self, ConfigError, PoolOptions};
use crate::events::{EventBus, PoolEvent};
use crate::listener::ListenerTask;
use crate::reset_locked::ResetLockedTicker;
use crate::runtime::Runtime;
use crate::signals::{BrokerError, ShutdownSink, SignalSubscription};
use crate::store::{MaintenanceStore, StoreError};
use crate::sync::Deferred;
use crate::worker::{Worker, WorkerContext, WorkerFactory};

/// Errors from pool construction
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// Invalid configuration
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// The signal broker refused the subscription
    #[error("signal broker error: {0}")]
    Signals(#[from] BrokerError),
}

/// The pool's terminal value: the outcome of the reset-locked tick that was
/// in flight at shutdown, or Ok when none was.
pub type PoolCompletion = Result<(), StoreError>;

struct PoolState {
    active: bool,
    shutting_down: bool,
    forcing: bool,
    terminated: bool,
    workers_released: bool,
    ticker: Option<JoinHandle<Option<PoolCompletion>>>,
    signal_subscription: Option<SignalSubscription>,
}

pub(crate) struct PoolInner {
    id: String,
    options: PoolOptions,
    runtime: Arc<Runtime>,
    events: EventBus,
    store: Arc<dyn MaintenanceStore>,
    workers: Arc<Vec<Arc<dyn Worker>>>,
    /// Root cancellation observed by workers; fired by the graceful
    /// shutdown watchdog or an external abort.
    abort: CancellationToken,
    /// Cancelled on deactivation; stops the listener and ticker.
    lifecycle: CancellationToken,
    completion: Deferred<PoolCompletion>,
    state: Mutex<PoolState>,
}

/// Supervises a set of workers consuming jobs from a shared queue
///
/// # Example
///
/// ```ignore
/// use pgrunner::{PoolOptions, Runtime, WorkerPool};
///
/// let runtime = Runtime::new();
/// let pool = WorkerPool::start(
///     runtime.clone(),
///     PoolOptions::default().with_concurrency(4),
///     pg_pool,
///     store,
///     worker_factory,
/// )?;
///
/// // ... later
/// pool.graceful_shutdown("deploy").await?;
/// ```
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// Construct a pool and start its background tasks.
    ///
    /// Must be called from within a tokio runtime. The returned handle is
    /// the only way to shut the pool down; dropping it leaves the
    /// background tasks running.
    pub fn start(
        runtime: Arc<Runtime>,
        options: PoolOptions,
        pg: PgPool,
        store: Arc<dyn MaintenanceStore>,
        worker_factory: WorkerFactory,
    ) -> Result<WorkerPool, PoolError> {
        let events = EventBus::new(options.events_channel_capacity);
        Self::start_with_events(runtime, options, pg, store, worker_factory, events)
    }

    /// Like [`start`](WorkerPool::start), but publishing onto a caller
    /// supplied bus so observers can subscribe before the pool exists.
    pub fn start_with_events(
        runtime: Arc<Runtime>,
        options: PoolOptions,
        pg: PgPool,
        store: Arc<dyn MaintenanceStore>,
        worker_factory: WorkerFactory,
        events: EventBus,
    ) -> Result<WorkerPool, PoolError> {
        options.validate()?;

        let id = format!("pool-{}", Uuid::now_v7());

        if config::dangerous_logs_enabled() {
            info!(pool_id = %id, options = ?options, "starting worker pool");
        } else {
            info!(pool_id = %id, concurrency = options.concurrency, "starting worker pool");
        }

        let abort = CancellationToken::new();
        let lifecycle = CancellationToken::new();

        let workers: Vec<Arc<dyn Worker>> = (0..options.concurrency)
            .map(|_| {
                worker_factory(WorkerContext {
                    worker_id: format!("worker-{}", Uuid::now_v7()),
                    cancel: abort.child_token(),
                    pg: pg.clone(),
                    events: events.clone(),
                })
            })
            .collect();
        let workers = Arc::new(workers);

        let inner = Arc::new(PoolInner {
            id: id.clone(),
            options: options.clone(),
            runtime: Arc::clone(&runtime),
            events: events.clone(),
            store: Arc::clone(&store),
            workers: Arc::clone(&workers),
            abort: abort.clone(),
            lifecycle: lifecycle.clone(),
            completion: Deferred::new(),
            state: Mutex::new(PoolState {
                active: true,
                shutting_down: false,
                forcing: false,
                terminated: false,
                workers_released: false,
                ticker: None,
                signal_subscription: None,
            }),
        });

        // Subscribe before registering so a broker refusal leaves no trace.
        if !options.no_handle_signals {
            let sink = Arc::new(PoolSink {
                pool: Arc::downgrade(&inner),
            });
            let subscription = runtime.signal_broker().subscribe(sink)?;
            inner.state.lock().unwrap().signal_subscription = Some(subscription);
        }

        runtime.register_pool(&id);

        let ticker = ResetLockedTicker {
            pool_id: id.clone(),
            store,
            events: events.clone(),
            lifecycle: lifecycle.clone(),
            min_interval: options.min_reset_locked_interval,
            max_interval: options.max_reset_locked_interval,
        };
        inner.state.lock().unwrap().ticker = Some(tokio::spawn(ticker.run()));

        let request_shutdown: Arc<dyn Fn(String) + Send + Sync> = {
            let weak = Arc::downgrade(&inner);
            Arc::new(move |message| {
                if let Some(pool) = weak.upgrade() {
                    tokio::spawn(async move {
                        let _ = PoolInner::graceful_shutdown(&pool, message).await;
                    });
                }
            })
        };
        tokio::spawn(
            ListenerTask {
                pool_id: id.clone(),
                pg,
                events: events.clone(),
                workers,
                lifecycle,
                runtime,
                request_shutdown,
            }
            .run(),
        );

        // External aborts start a graceful shutdown; the abort fired by the
        // shutdown watchdog finds the pool already shutting down.
        {
            let weak = Arc::downgrade(&inner);
            tokio::spawn(async move {
                abort.cancelled().await;
                let Some(pool) = weak.upgrade() else { return };
                let needs_shutdown = {
                    let state = pool.state.lock().unwrap();
                    !state.shutting_down && !state.terminated
                };
                if needs_shutdown {
                    info!(pool_id = %pool.id, "abort signal fired; initiating graceful shutdown");
                    let _ = PoolInner::graceful_shutdown(&pool, "pool aborted".to_string()).await;
                }
            });
        }

        events.emit(PoolEvent::Created { pool_id: id });

        Ok(WorkerPool { inner })
    }

    /// The pool's unique id
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// The pool's event bus
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Number of supervised workers; constant for the pool's lifetime
    pub fn worker_count(&self) -> usize {
        self.inner.workers.len()
    }

    /// Ids of the supervised workers, in construction order
    pub fn worker_ids(&self) -> Vec<String> {
        self.inner
            .workers
            .iter()
            .map(|worker| worker.worker_id().to_string())
            .collect()
    }

    /// A token observing the pool's abort signal.
    ///
    /// The returned token is a child: cancelling it does not abort the
    /// pool.
    pub fn abort_signal(&self) -> CancellationToken {
        self.inner.abort.child_token()
    }

    /// Whether the pool has fully terminated
    pub fn is_terminated(&self) -> bool {
        self.inner.completion.is_resolved()
    }

    /// Stop accepting work, let in-flight jobs finish, then terminate.
    ///
    /// Idempotent: a second call logs and waits for the shutdown already
    /// in progress. If shutdown outlives the configured abort timeout, the
    /// pool's abort signal fires so workers cancel in-flight SQL.
    pub async fn graceful_shutdown(&self, message: impl Into<String>) -> PoolCompletion {
        PoolInner::graceful_shutdown(&self.inner, message.into()).await
    }

    /// Stop accepting work, mark in-flight jobs failed, terminate now.
    pub async fn forceful_shutdown(&self, message: impl Into<String>) -> PoolCompletion {
        PoolInner::forceful_shutdown(&self.inner, message.into()).await
    }

    /// Deprecated alias for [`graceful_shutdown`](WorkerPool::graceful_shutdown).
    #[deprecated(since = "0.1.0", note = "use graceful_shutdown() instead")]
    pub async fn release(&self) -> PoolCompletion {
        warn!(
            pool_id = %self.inner.id,
            "WorkerPool::release() is deprecated; use graceful_shutdown()"
        );
        PoolInner::graceful_shutdown(&self.inner, "worker pool released".to_string()).await
    }

    /// Wait for the pool to terminate.
    ///
    /// Resolves with the outcome of the reset-locked tick that was in
    /// flight at shutdown, so lingering maintenance failures are visible.
    /// All other operational errors are delivered on the event bus.
    pub async fn wait(&self) -> PoolCompletion {
        self.inner.completion.wait().await
    }
}

/// Shutdown intents from the signal broker, forwarded to the pool.
struct PoolSink {
    pool: Weak<PoolInner>,
}

#[async_trait]
impl ShutdownSink for PoolSink {
    async fn graceful_shutdown(&self, message: String) {
        if let Some(pool) = self.pool.upgrade() {
            let _ = PoolInner::graceful_shutdown(&pool, message).await;
        }
    }

    async fn forceful_shutdown(&self, message: String) {
        if let Some(pool) = self.pool.upgrade() {
            let _ = PoolInner::forceful_shutdown(&pool, message).await;
        }
    }
}

impl PoolInner {
    #[instrument(skip(self), fields(pool_id = %self.id))]
    pub(crate) async fn graceful_shutdown(self: &Arc<Self>, message: String) -> PoolCompletion {
        let proceed = {
            let mut state = self.state.lock().unwrap();
            if state.shutting_down || state.terminated {
                false
            } else {
                state.shutting_down = true;
                true
            }
        };
        if !proceed {
            info!(pool_id = %self.id, "graceful shutdown already in progress");
            return self.completion.wait().await;
        }

        // Watchdog: if shutdown outlives its budget, fire the abort signal
        // so workers cancel in-flight SQL. Exits once the pool terminates.
        {
            let pool = Arc::clone(self);
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(pool.options.graceful_shutdown_abort_timeout) => {
                        warn!(
                            pool_id = %pool.id,
                            "graceful shutdown timed out; firing abort signal"
                        );
                        pool.abort.cancel();
                    }
                    _ = pool.completion.wait() => {}
                }
            });
        }

        match self.run_graceful(&message).await {
            Ok(()) => {
                info!(pool_id = %self.id, "graceful shutdown complete");
                self.events.emit(PoolEvent::GracefulShutdownComplete {
                    pool_id: self.id.clone(),
                });
                self.terminate().await;
            }
            Err(e) => {
                error!(pool_id = %self.id, error = %e, "graceful shutdown failed; escalating");
                self.events.emit(PoolEvent::GracefulShutdownError {
                    pool_id: self.id.clone(),
                    error: e.to_string(),
                });
                let _ = Self::forceful_shutdown(self, e.to_string()).await;
            }
        }

        self.completion.wait().await
    }

    #[instrument(skip(self), fields(pool_id = %self.id))]
    pub(crate) async fn forceful_shutdown(self: &Arc<Self>, message: String) -> PoolCompletion {
        let proceed = {
            let mut state = self.state.lock().unwrap();
            if state.terminated || state.forcing {
                false
            } else {
                state.forcing = true;
                state.shutting_down = true;
                true
            }
        };
        if !proceed {
            info!(pool_id = %self.id, "forceful shutdown already in progress");
            return self.completion.wait().await;
        }

        warn!(pool_id = %self.id, message = %message, "forceful shutdown");

        match self.run_forceful(&message).await {
            Ok(()) => {
                self.events.emit(PoolEvent::ForcefulShutdownComplete {
                    pool_id: self.id.clone(),
                });
            }
            Err(e) => {
                // Does not re-escalate; termination still runs.
                error!(pool_id = %self.id, error = %e, "forceful shutdown failed");
                self.events.emit(PoolEvent::ForcefulShutdownError {
                    pool_id: self.id.clone(),
                    error: e.to_string(),
                });
            }
        }

        self.terminate().await;
        self.completion.wait().await
    }

    async fn run_graceful(&self, message: &str) -> Result<(), StoreError> {
        self.events.emit(PoolEvent::GracefulShutdown {
            pool_id: self.id.clone(),
            message: message.to_string(),
        });
        info!(pool_id = %self.id, message, "graceful shutdown");

        self.deactivate();

        let settlements = self.release_workers().await;

        let mut failed_worker_ids = Vec::new();
        let mut abandoned = Vec::new();
        for (worker, outcome) in settlements {
            if let Err(e) = outcome {
                error!(
                    pool_id = %self.id,
                    worker_id = %worker.worker_id(),
                    error = %e,
                    "worker release failed"
                );
                let job = worker.active_job();
                self.events.emit(PoolEvent::GracefulShutdownWorkerError {
                    pool_id: self.id.clone(),
                    worker_id: worker.worker_id().to_string(),
                    error: e.to_string(),
                    job: job.clone(),
                });
                if let Some(job) = job {
                    failed_worker_ids.push(worker.worker_id().to_string());
                    abandoned.push(job);
                }
            }
        }

        if !abandoned.is_empty() {
            let failed = self
                .store
                .fail_jobs(&failed_worker_ids, &abandoned, message)
                .await?;
            info!(
                pool_id = %self.id,
                count = failed,
                "failed jobs abandoned by unreleased workers"
            );
        }

        Ok(())
    }

    async fn run_forceful(&self, message: &str) -> Result<(), StoreError> {
        self.events.emit(PoolEvent::ForcefulShutdown {
            pool_id: self.id.clone(),
            message: message.to_string(),
        });

        self.deactivate();

        // Snapshot in-flight jobs before asking workers to stop.
        let mut worker_ids = Vec::new();
        let mut in_flight = Vec::new();
        for worker in self.workers.iter() {
            if let Some(job) = worker.active_job() {
                worker_ids.push(worker.worker_id().to_string());
                in_flight.push(job);
            }
        }

        // Outcomes are logged but do not affect the rest of shutdown.
        let settlements = self.release_workers().await;
        for (worker, outcome) in &settlements {
            if let Err(e) = outcome {
                warn!(
                    pool_id = %self.id,
                    worker_id = %worker.worker_id(),
                    error = %e,
                    "worker release failed during forceful shutdown"
                );
            }
        }

        if !in_flight.is_empty() {
            let failed = self.store.fail_jobs(&worker_ids, &in_flight, message).await?;
            info!(pool_id = %self.id, count = failed, "failed in-flight jobs");
        }

        Ok(())
    }

    /// Release every worker in parallel, once per pool lifetime.
    ///
    /// A second call (forceful after graceful) returns empty settlements
    /// so workers are never double-released.
    async fn release_workers(&self) -> Vec<(Arc<dyn Worker>, Result<(), crate::worker::WorkerError>)> {
        {
            let mut state = self.state.lock().unwrap();
            if state.workers_released {
                return Vec::new();
            }
            state.workers_released = true;
        }

        let releases = self.workers.iter().map(|worker| {
            let worker = Arc::clone(worker);
            async move {
                let outcome = worker.release().await;
                (worker, outcome)
            }
        });
        join_all(releases).await
    }

    /// Stop scheduling: cancel timers, release the listener connection.
    ///
    /// After this returns, no further timers are scheduled and no new
    /// listener clients are requested. Idempotent.
    fn deactivate(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if !state.active {
                return;
            }
            state.active = false;
        }

        self.lifecycle.cancel();
        debug!(pool_id = %self.id, "pool deactivated");
        self.events.emit(PoolEvent::Released {
            pool_id: self.id.clone(),
        });
    }

    /// Terminal cleanup; runs exactly once.
    ///
    /// Deregisters from the runtime, waits out the in-flight reset-locked
    /// tick, releases the signal subscription, and resolves the completion
    /// cell with the tick's outcome.
    async fn terminate(&self) {
        let (ticker, subscription) = {
            let mut state = self.state.lock().unwrap();
            if state.terminated {
                error!(pool_id = %self.id, "terminate() called twice; this is a bug");
                return;
            }
            state.terminated = true;
            (state.ticker.take(), state.signal_subscription.take())
        };

        let outcome = match ticker {
            Some(handle) => match handle.await {
                Ok(Some(result)) => result,
                Ok(None) => Ok(()),
                Err(e) => {
                    error!(pool_id = %self.id, error = %e, "reset-locked task panicked");
                    Ok(())
                }
            },
            None => Ok(()),
        };

        self.runtime.deregister_pool(&self.id);
        if let Some(subscription) = subscription {
            subscription.release();
        }

        self.completion.resolve(outcome);
        info!(pool_id = %self.id, "worker pool terminated");
    }
}
