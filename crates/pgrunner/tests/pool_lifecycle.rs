//! Lifecycle tests for WorkerPool
//!
//! These run hermetically over stub workers and stores; no database is
//! required. The listener's live connection handling has its own unit
//! tests next to the implementation.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use sqlx::PgPool;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use pgrunner::{
    Job, MaintenanceStore, PoolEvent, PoolOptions, Runtime, StoreError, Worker, WorkerContext,
    WorkerError, WorkerFactory, WorkerPool,
};

// ============================================
// Test doubles
// ============================================

/// A worker whose release hangs until its cancellation token fires, then
/// reports failure, as a wedged job handler would.
struct HangingWorker {
    id: String,
    cancel: CancellationToken,
    job: Job,
    observed_cancellation: watch::Sender<bool>,
}

#[async_trait]
impl Worker for HangingWorker {
    fn worker_id(&self) -> &str {
        &self.id
    }

    fn nudge(&self) -> bool {
        false
    }

    fn active_job(&self) -> Option<Job> {
        Some(self.job.clone())
    }

    async fn release(&self) -> Result<(), WorkerError> {
        self.cancel.cancelled().await;
        let _ = self.observed_cancellation.send(true);
        Err(WorkerError::Release("job handler cancelled".into()))
    }
}

/// A well-behaved worker that releases immediately.
struct QuietWorker {
    id: String,
    releases: AtomicUsize,
}

#[async_trait]
impl Worker for QuietWorker {
    fn worker_id(&self) -> &str {
        &self.id
    }

    fn nudge(&self) -> bool {
        true
    }

    fn active_job(&self) -> Option<Job> {
        None
    }

    async fn release(&self) -> Result<(), WorkerError> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A store whose reset-locked calls block on a gate and then yield
/// scripted outcomes. fail_jobs invocations are recorded.
struct GatedStore {
    gate: watch::Sender<bool>,
    reset_outcomes: Mutex<VecDeque<Result<(), StoreError>>>,
    failed: Mutex<Vec<(Vec<String>, Vec<Job>, String)>>,
}

impl GatedStore {
    fn new(open: bool, reset_outcomes: Vec<Result<(), StoreError>>) -> Arc<Self> {
        let (gate, _) = watch::channel(open);
        Arc::new(Self {
            gate,
            reset_outcomes: Mutex::new(reset_outcomes.into()),
            failed: Mutex::new(Vec::new()),
        })
    }

    fn open_gate(&self) {
        let _ = self.gate.send(true);
    }
}

#[async_trait]
impl MaintenanceStore for GatedStore {
    async fn reset_locked(&self) -> Result<(), StoreError> {
        let mut rx = self.gate.subscribe();
        while !*rx.borrow_and_update() {
            rx.changed().await.expect("gate sender dropped");
        }
        self.reset_outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(()))
    }

    async fn fail_jobs(
        &self,
        worker_ids: &[String],
        jobs: &[Job],
        message: &str,
    ) -> Result<u64, StoreError> {
        self.failed.lock().unwrap().push((
            worker_ids.to_vec(),
            jobs.to_vec(),
            message.to_string(),
        ));
        Ok(jobs.len() as u64)
    }
}

// ============================================
// Helpers
// ============================================

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn lazy_pg() -> PgPool {
    PgPool::connect_lazy("postgres://localhost/unused").expect("lazy pool")
}

fn sample_job(locked_by: &str) -> Job {
    Job {
        id: Uuid::now_v7(),
        queue_name: None,
        task_identifier: "send_email".to_string(),
        payload: json!({"to": "user@example.com"}),
        priority: 0,
        run_at: Utc::now(),
        attempts: 1,
        max_attempts: 25,
        last_error: None,
        locked_at: Some(Utc::now()),
        locked_by: Some(locked_by.to_string()),
    }
}

fn quiet_factory(counters: Arc<Mutex<Vec<Arc<QuietWorker>>>>) -> WorkerFactory {
    Arc::new(move |ctx: WorkerContext| {
        let worker = Arc::new(QuietWorker {
            id: ctx.worker_id,
            releases: AtomicUsize::new(0),
        });
        counters.lock().unwrap().push(worker.clone());
        worker as Arc<dyn Worker>
    })
}

fn options(concurrency: usize) -> PoolOptions {
    PoolOptions::new()
        .with_concurrency(concurrency)
        .with_no_handle_signals(true)
        .with_reset_locked_interval(Duration::from_secs(600), Duration::from_secs(600))
}

// ============================================
// Scenarios
// ============================================

#[tokio::test]
async fn test_happy_path_shutdown() {
    init_tracing();
    let runtime = Runtime::new();
    let workers = Arc::new(Mutex::new(Vec::new()));
    let store = GatedStore::new(true, vec![]);
    let pool = WorkerPool::start(
        runtime.clone(),
        options(2),
        lazy_pg(),
        store.clone(),
        quiet_factory(workers.clone()),
    )
    .expect("pool should start");

    assert_eq!(runtime.active_pools(), 1);
    assert!(runtime.is_registered(pool.id()));
    assert_eq!(pool.worker_count(), 2);
    assert_eq!(pool.worker_ids().len(), 2);

    let mut events = pool.events().subscribe();
    pool.graceful_shutdown("bye").await.expect("clean shutdown");

    // Expected order: gracefulShutdown, release, complete.
    let mut order = Vec::new();
    while let Ok(event) = events.try_recv() {
        match event {
            PoolEvent::GracefulShutdown { ref message, .. } => {
                assert_eq!(message, "bye");
                order.push("shutdown");
            }
            PoolEvent::Released { .. } => order.push("released"),
            PoolEvent::GracefulShutdownComplete { .. } => order.push("complete"),
            _ => {}
        }
    }
    assert_eq!(order, vec!["shutdown", "released", "complete"]);

    assert!(pool.is_terminated());
    assert_eq!(runtime.active_pools(), 0);
    for worker in workers.lock().unwrap().iter() {
        assert_eq!(worker.releases.load(Ordering::SeqCst), 1);
    }
    assert!(store.failed.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_hung_release_is_aborted_and_job_failed() {
    init_tracing();
    let runtime = Runtime::new();
    let store = GatedStore::new(true, vec![]);
    let observed = Arc::new(Mutex::new(None::<watch::Receiver<bool>>));

    let factory: WorkerFactory = {
        let observed = observed.clone();
        Arc::new(move |ctx: WorkerContext| {
            let (tx, rx) = watch::channel(false);
            *observed.lock().unwrap() = Some(rx);
            Arc::new(HangingWorker {
                job: sample_job(&ctx.worker_id),
                id: ctx.worker_id,
                cancel: ctx.cancel,
                observed_cancellation: tx,
            }) as Arc<dyn Worker>
        })
    };

    let pool = WorkerPool::start(
        runtime.clone(),
        options(1).with_graceful_shutdown_abort_timeout(Duration::from_millis(100)),
        lazy_pg(),
        store.clone(),
        factory,
    )
    .expect("pool should start");

    let mut events = pool.events().subscribe();
    pool.graceful_shutdown("deploy").await.expect("completes");

    // The worker saw the abort-driven cancellation.
    let observed = observed.lock().unwrap().take().expect("worker built");
    assert!(*observed.borrow());

    // Its active job was force-failed.
    let failed = store.failed.lock().unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].2, "deploy");
    assert_eq!(failed[0].1.len(), 1);
    drop(failed);

    let mut saw_worker_error = false;
    while let Ok(event) = events.try_recv() {
        if let PoolEvent::GracefulShutdownWorkerError { job, .. } = event {
            assert!(job.is_some());
            saw_worker_error = true;
        }
    }
    assert!(saw_worker_error);
    assert!(pool.is_terminated());
}

#[tokio::test(start_paused = true)]
async fn test_completion_mirrors_in_flight_reset_locked_failure() {
    let runtime = Runtime::new();
    // The gate starts closed: the first tick blocks until we open it.
    let store = GatedStore::new(
        false,
        vec![Err(StoreError::Database("deadlock detected".into()))],
    );
    let pool = WorkerPool::start(
        runtime.clone(),
        options(0).with_reset_locked_interval(
            Duration::from_millis(50),
            Duration::from_millis(50),
        ),
        lazy_pg(),
        store.clone(),
        quiet_factory(Arc::new(Mutex::new(Vec::new()))),
    )
    .expect("pool should start");

    let mut events = pool.events().subscribe();

    // Wait for the tick to be in flight.
    loop {
        if let PoolEvent::ResetLockedStarted { .. } = events.recv().await.expect("events") {
            break;
        }
    }

    // Shut down while the tick is blocked, then let it finish.
    let waiter = {
        let store = store.clone();
        tokio::spawn(async move {
            // Give the shutdown a moment to deactivate, then release the tick.
            tokio::time::sleep(Duration::from_millis(20)).await;
            store.open_gate();
        })
    };

    let outcome = pool.graceful_shutdown("bye").await;
    waiter.await.expect("gate task");

    match outcome {
        Err(StoreError::Database(message)) => assert!(message.contains("deadlock")),
        other => panic!("expected the in-flight tick's failure, got {:?}", other),
    }

    // The in-flight tick's completion event fired with no next delay.
    let mut saw_terminal_failure = false;
    while let Ok(event) = events.try_recv() {
        if let PoolEvent::ResetLockedFailure { next_delay, .. } = event {
            assert_eq!(next_delay, None);
            saw_terminal_failure = true;
        }
    }
    assert!(saw_terminal_failure);
    assert!(pool.is_terminated());
    assert_eq!(runtime.active_pools(), 0);
}

#[tokio::test]
async fn test_double_graceful_shutdown_converges() {
    let runtime = Runtime::new();
    let workers = Arc::new(Mutex::new(Vec::new()));
    let pool = Arc::new(
        WorkerPool::start(
            runtime,
            options(1),
            lazy_pg(),
            GatedStore::new(true, vec![]),
            quiet_factory(workers.clone()),
        )
        .expect("pool should start"),
    );

    let first = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.graceful_shutdown("first").await })
    };
    let second = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.graceful_shutdown("second").await })
    };

    first.await.expect("join").expect("clean");
    second.await.expect("join").expect("clean");

    // Only one shutdown performed work.
    let workers = workers.lock().unwrap();
    assert_eq!(workers.len(), 1);
    assert_eq!(workers[0].releases.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_forceful_after_graceful_is_safe() {
    let runtime = Runtime::new();
    let workers = Arc::new(Mutex::new(Vec::new()));
    let store = GatedStore::new(true, vec![]);
    let pool = WorkerPool::start(
        runtime.clone(),
        options(2),
        lazy_pg(),
        store.clone(),
        quiet_factory(workers.clone()),
    )
    .expect("pool should start");

    pool.graceful_shutdown("bye").await.expect("clean");
    pool.forceful_shutdown("too late").await.expect("no-op");

    for worker in workers.lock().unwrap().iter() {
        assert_eq!(worker.releases.load(Ordering::SeqCst), 1);
    }
    assert_eq!(runtime.active_pools(), 0);
}

#[tokio::test]
async fn test_abort_signal_is_observable_but_read_only() {
    let runtime = Runtime::new();
    let pool = WorkerPool::start(
        runtime,
        options(0),
        lazy_pg(),
        GatedStore::new(true, vec![]),
        quiet_factory(Arc::new(Mutex::new(Vec::new()))),
    )
    .expect("pool should start");

    let observer = pool.abort_signal();
    // Cancelling the observer must not tear the pool down.
    observer.cancel();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!pool.is_terminated());

    pool.graceful_shutdown("done").await.expect("clean");
    assert!(pool.is_terminated());
}
