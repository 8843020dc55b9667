//! Process-wide coordinator
//!
//! One [`Runtime`] value is constructed at process start and shared by
//! every pool, instead of scattering process-global mutable state. It owns
//! the pool registry, the signal broker, and the recommended exit code.

use std::collections::HashSet;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::signals::SignalBroker;

/// Exit code recommended after a schema migration was detected while
/// running. Schema drift makes continued operation unsafe; the non-zero
/// code lets supervisors distinguish this from a clean stop.
pub const SCHEMA_MIGRATION_EXIT_CODE: i32 = 54;

/// Sentinel meaning no exit code has been recommended.
const EXIT_CODE_UNSET: i32 = 0;

/// The single coordinator shared by all pools in a process
pub struct Runtime {
    pools: Mutex<HashSet<String>>,
    broker: SignalBroker,
    exit_code: AtomicI32,
}

impl Runtime {
    /// Create the coordinator. Call once at process start and share the
    /// handle with every pool.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pools: Mutex::new(HashSet::new()),
            broker: SignalBroker::new(),
            exit_code: AtomicI32::new(EXIT_CODE_UNSET),
        })
    }

    /// The process signal broker
    pub fn signal_broker(&self) -> &SignalBroker {
        &self.broker
    }

    /// Number of pools currently registered (created and not terminated)
    pub fn active_pools(&self) -> usize {
        self.pools.lock().unwrap().len()
    }

    /// Whether the given pool is currently registered
    pub fn is_registered(&self, pool_id: &str) -> bool {
        self.pools.lock().unwrap().contains(pool_id)
    }

    pub(crate) fn register_pool(&self, pool_id: &str) {
        self.pools.lock().unwrap().insert(pool_id.to_string());
        debug!(pool_id, "registered pool");
    }

    pub(crate) fn deregister_pool(&self, pool_id: &str) {
        self.pools.lock().unwrap().remove(pool_id);
        debug!(pool_id, "deregistered pool");
    }

    /// Recommend a process exit code. The first recommendation wins.
    pub fn set_recommended_exit_code(&self, code: i32) {
        let _ = self.exit_code.compare_exchange(
            EXIT_CODE_UNSET,
            code,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// The exit code the embedding binary should pass to
    /// `std::process::exit`, if any was recommended.
    pub fn recommended_exit_code(&self) -> Option<i32> {
        match self.exit_code.load(Ordering::SeqCst) {
            EXIT_CODE_UNSET => None,
            code => Some(code),
        }
    }
}
