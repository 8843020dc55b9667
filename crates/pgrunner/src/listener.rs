//! Notification listener
//!
//! One dedicated connection per pool subscribes to the queue's notify
//! channels and reacts: inserts nudge an idle worker, schema migrations
//! trigger a controlled shutdown. The connection is re-established on
//! failure with jittered exponential backoff, indefinitely, for as long as
//! the pool is active.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::events::{EventBus, PoolEvent};
use crate::runtime::{Runtime, SCHEMA_MIGRATION_EXIT_CODE};
use crate::worker::Worker;

/// Channel notified on job insertion; the payload is ignored.
pub const JOBS_INSERT_CHANNEL: &str = "jobs:insert";

/// Channel notified when the queue schema is migrated.
pub const JOBS_MIGRATE_CHANNEL: &str = "jobs:migrate";

/// Base delay for the first reconnect attempt, in milliseconds.
const RECONNECT_BASE_MS: f64 = 50.0;

/// Per-attempt delay cap, in milliseconds.
const RECONNECT_CAP_MS: f64 = 60_000.0;

/// Reconnect delay for the given 0-based retry count.
///
/// `ceil(jitter * min(cap, base * e^n))` with `jitter = 0.5 + sqrt(U)/2`,
/// which biases the jitter upward. The result is always in `(0, cap]`.
pub(crate) fn reconnect_delay(retries: u32, rng: &mut impl Rng) -> Duration {
    let base = (RECONNECT_BASE_MS * (retries as f64).exp()).min(RECONNECT_CAP_MS);
    let jitter = 0.5 + rng.gen::<f64>().sqrt() / 2.0;
    Duration::from_millis((jitter * base).ceil() as u64)
}

/// Payload of a `jobs:migrate` notification. Malformed payloads are
/// tolerated; the revision is then simply unknown.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MigratePayload {
    migration_number: Option<u64>,
}

/// The listener task owned by a pool.
///
/// Exactly one of these runs per pool; it is the sole owner of the
/// listening connection, which makes release structurally idempotent.
pub(crate) struct ListenerTask {
    pub(crate) pool_id: String,
    pub(crate) pg: PgPool,
    pub(crate) events: EventBus,
    pub(crate) workers: Arc<Vec<Arc<dyn Worker>>>,
    /// Cancelled on pool deactivation; stops reconnects and releases the
    /// connection.
    pub(crate) lifecycle: CancellationToken,
    pub(crate) runtime: Arc<Runtime>,
    /// Initiates graceful pool shutdown (used on migration detection).
    pub(crate) request_shutdown: Arc<dyn Fn(String) + Send + Sync>,
}

impl ListenerTask {
    pub(crate) async fn run(self) {
        let mut attempts: u32 = 0;

        loop {
            if self.lifecycle.is_cancelled() {
                return;
            }

            self.events.emit(PoolEvent::ListenConnecting {
                pool_id: self.pool_id.clone(),
                attempts,
            });

            let connected = tokio::select! {
                _ = self.lifecycle.cancelled() => return,
                result = PgListener::connect_with(&self.pg) => result,
            };

            let mut listener = match connected {
                Ok(listener) => listener,
                Err(e) => {
                    warn!(pool_id = %self.pool_id, error = %e, "listener connect failed");
                    self.emit_error(&e);
                    if self.backoff(&mut attempts).await {
                        return;
                    }
                    continue;
                }
            };

            // The pool may have deactivated while we were connecting;
            // return the fresh connection without subscribing.
            if self.lifecycle.is_cancelled() {
                drop(listener);
                return;
            }

            if let Err(e) = listener.listen(JOBS_INSERT_CHANNEL).await {
                warn!(pool_id = %self.pool_id, error = %e, "LISTEN failed");
                self.emit_error(&e);
                if self.backoff(&mut attempts).await {
                    return;
                }
                continue;
            }

            // The insert subscription is live; the retry budget starts over.
            attempts = 0;

            if let Err(e) = listener.listen(JOBS_MIGRATE_CHANNEL).await {
                warn!(pool_id = %self.pool_id, error = %e, "LISTEN failed");
                self.emit_error(&e);
                if self.backoff(&mut attempts).await {
                    return;
                }
                continue;
            }

            info!(pool_id = %self.pool_id, "listening for queue notifications");
            self.events.emit(PoolEvent::ListenSuccess {
                pool_id: self.pool_id.clone(),
            });

            loop {
                // None means the pool deactivated while we were waiting.
                let received = tokio::select! {
                    _ = self.lifecycle.cancelled() => None,
                    received = listener.try_recv() => Some(received),
                };

                match received {
                    None => {
                        self.release(listener).await;
                        return;
                    }
                    Some(Ok(Some(notification))) => {
                        self.handle_notification(notification.channel(), notification.payload());
                    }
                    Some(Ok(None)) => {
                        warn!(pool_id = %self.pool_id, "listener connection lost");
                        self.events.emit(PoolEvent::ListenError {
                            pool_id: self.pool_id.clone(),
                            error: "connection closed".into(),
                        });
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(pool_id = %self.pool_id, error = %e, "listener stream error");
                        self.emit_error(&e);
                        break;
                    }
                }
            }

            drop(listener);
            if self.backoff(&mut attempts).await {
                return;
            }
        }
    }

    /// Dispatch one notification.
    pub(crate) fn handle_notification(&self, channel: &str, payload: &str) {
        match channel {
            JOBS_INSERT_CHANNEL => {
                for worker in self.workers.iter() {
                    if worker.nudge() {
                        trace!(worker_id = %worker.worker_id(), "nudged worker");
                        break;
                    }
                }
            }
            JOBS_MIGRATE_CHANNEL => {
                let revision = serde_json::from_str::<MigratePayload>(payload)
                    .ok()
                    .and_then(|p| p.migration_number);
                match revision {
                    Some(revision) => warn!(
                        pool_id = %self.pool_id,
                        revision,
                        "database schema was migrated underneath us; shutting down"
                    ),
                    None => warn!(
                        pool_id = %self.pool_id,
                        "database schema was migrated underneath us; shutting down"
                    ),
                }
                self.runtime
                    .set_recommended_exit_code(SCHEMA_MIGRATION_EXIT_CODE);
                (self.request_shutdown)("database schema migrated".to_string());
            }
            other => {
                warn!(pool_id = %self.pool_id, channel = other, "notification on unexpected channel");
            }
        }
    }

    /// Sleep before the next reconnect, bumping the retry counter.
    /// Returns true when cancelled.
    async fn backoff(&self, attempts: &mut u32) -> bool {
        let delay = reconnect_delay(*attempts, &mut rand::thread_rng());
        *attempts += 1;
        debug!(
            pool_id = %self.pool_id,
            attempts = *attempts,
            delay_ms = delay.as_millis() as u64,
            "scheduling listener reconnect"
        );
        tokio::select! {
            _ = self.lifecycle.cancelled() => true,
            _ = tokio::time::sleep(delay) => false,
        }
    }

    /// Best-effort unsubscribe before returning the connection.
    ///
    /// The connection may already be gone; errors are ignored. Nothing
    /// awaits this beyond the task itself, and the task runs it at most
    /// once.
    async fn release(&self, mut listener: PgListener) {
        if let Err(e) = listener.unlisten(JOBS_INSERT_CHANNEL).await {
            debug!(pool_id = %self.pool_id, error = %e, "UNLISTEN failed during release");
        }
    }

    fn emit_error(&self, error: &sqlx::Error) {
        self.events.emit(PoolEvent::ListenError {
            pool_id: self.pool_id.clone(),
            error: error.to_string(),
        });
    }
}
