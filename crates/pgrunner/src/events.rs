//! Pool lifecycle events
//!
//! Every observable state change in a pool is published on its [`EventBus`]
//! as a [`PoolEvent`]. The set is closed: observers match on the enum
//! instead of parsing event names.

use std::time::Duration;

use tokio::sync::broadcast;
use tracing::trace;

use crate::job::Job;

/// Lifecycle events emitted by a worker pool
///
/// Every variant carries the id of the emitting pool so observers watching
/// several pools on one bus can tell them apart.
#[derive(Debug, Clone, PartialEq)]
pub enum PoolEvent {
    // =========================================================================
    // Pool Lifecycle
    // =========================================================================
    /// The pool was constructed and its background tasks started
    Created {
        /// Emitting pool
        pool_id: String,
    },

    /// Listener and timers were stopped; no further work is scheduled
    Released {
        /// Emitting pool
        pool_id: String,
    },

    // =========================================================================
    // Listener
    // =========================================================================
    /// The listener is about to request a connection
    ListenConnecting {
        /// Emitting pool
        pool_id: String,
        /// Reconnect attempts since the last successful subscription
        attempts: u32,
    },

    /// The listener is connected and subscribed to its channels
    ListenSuccess {
        /// Emitting pool
        pool_id: String,
    },

    /// Connecting, subscribing, or the notification stream failed
    ListenError {
        /// Emitting pool
        pool_id: String,
        /// What went wrong
        error: String,
    },

    // =========================================================================
    // Graceful Shutdown
    // =========================================================================
    /// Graceful shutdown has begun
    GracefulShutdown {
        /// Emitting pool
        pool_id: String,
        /// Reason supplied by the caller
        message: String,
    },

    /// A worker failed to release during graceful shutdown
    GracefulShutdownWorkerError {
        /// Emitting pool
        pool_id: String,
        /// Worker whose release failed
        worker_id: String,
        /// The release error
        error: String,
        /// The job the worker was holding, if any
        job: Option<Job>,
    },

    /// Graceful shutdown finished cleanly
    GracefulShutdownComplete {
        /// Emitting pool
        pool_id: String,
    },

    /// Graceful shutdown hit an error and is escalating to forceful
    GracefulShutdownError {
        /// Emitting pool
        pool_id: String,
        /// What went wrong
        error: String,
    },

    // =========================================================================
    // Forceful Shutdown
    // =========================================================================
    /// Forceful shutdown has begun
    ForcefulShutdown {
        /// Emitting pool
        pool_id: String,
        /// Reason supplied by the caller or escalation
        message: String,
    },

    /// Forceful shutdown finished
    ForcefulShutdownComplete {
        /// Emitting pool
        pool_id: String,
    },

    /// Forceful shutdown hit an error; it does not re-escalate
    ForcefulShutdownError {
        /// Emitting pool
        pool_id: String,
        /// What went wrong
        error: String,
    },

    // =========================================================================
    // Reset-Locked Ticker
    // =========================================================================
    /// A reset-locked maintenance tick started
    ResetLockedStarted {
        /// Emitting pool
        pool_id: String,
    },

    /// A reset-locked tick succeeded
    ResetLockedSuccess {
        /// Emitting pool
        pool_id: String,
        /// Delay until the next tick, or None when no further tick is scheduled
        next_delay: Option<Duration>,
    },

    /// A reset-locked tick failed; the next tick is still scheduled
    ResetLockedFailure {
        /// Emitting pool
        pool_id: String,
        /// What went wrong
        error: String,
        /// Delay until the next tick, or None when no further tick is scheduled
        next_delay: Option<Duration>,
    },
}

impl PoolEvent {
    /// The id of the pool that emitted this event
    pub fn pool_id(&self) -> &str {
        match self {
            Self::Created { pool_id }
            | Self::Released { pool_id }
            | Self::ListenConnecting { pool_id, .. }
            | Self::ListenSuccess { pool_id }
            | Self::ListenError { pool_id, .. }
            | Self::GracefulShutdown { pool_id, .. }
            | Self::GracefulShutdownWorkerError { pool_id, .. }
            | Self::GracefulShutdownComplete { pool_id }
            | Self::GracefulShutdownError { pool_id, .. }
            | Self::ForcefulShutdown { pool_id, .. }
            | Self::ForcefulShutdownComplete { pool_id }
            | Self::ForcefulShutdownError { pool_id, .. }
            | Self::ResetLockedStarted { pool_id }
            | Self::ResetLockedSuccess { pool_id, .. }
            | Self::ResetLockedFailure { pool_id, .. } => pool_id,
        }
    }
}

/// Broadcast bus for [`PoolEvent`]s
///
/// Cloning the bus clones the sender side; every clone publishes into the
/// same channel. Emitting with no live subscribers is not an error, and a
/// slow subscriber only lags itself.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PoolEvent>,
}

impl EventBus {
    /// Create a bus with the given channel capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to all events published after this call
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Dropped silently when nobody is listening.
    pub(crate) fn emit(&self, event: PoolEvent) {
        trace!(?event, "pool event");
        let _ = self.tx.send(event);
    }
}
