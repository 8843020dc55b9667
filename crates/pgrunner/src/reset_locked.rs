//! Reset-locked ticker
//!
//! A periodic, randomized maintenance task that re-opens jobs whose worker
//! died while holding the lock. Randomization keeps co-started processes
//! from hammering the table in lockstep. Only one tick is ever in flight;
//! the next tick is scheduled from the completion of the previous one.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::events::{EventBus, PoolEvent};
use crate::store::{MaintenanceStore, StoreError};

/// Cap on the very first tick's delay.
const INITIAL_DELAY_CAP: Duration = Duration::from_millis(60_000);

/// Delay before the first tick: uniform in `[0, min(cap, max_interval))`.
pub(crate) fn initial_delay(max_interval: Duration, rng: &mut impl Rng) -> Duration {
    let cap = max_interval.min(INITIAL_DELAY_CAP);
    Duration::from_secs_f64(rng.gen::<f64>() * cap.as_secs_f64())
}

/// Delay between ticks: `ceil(min + U(0,1) * (max - min))` milliseconds.
/// With `min == max` this is exactly `min`.
pub(crate) fn next_delay(min: Duration, max: Duration, rng: &mut impl Rng) -> Duration {
    let spread = max.saturating_sub(min).as_millis() as f64;
    let millis = (min.as_millis() as f64 + rng.gen::<f64>() * spread).ceil() as u64;
    Duration::from_millis(millis)
}

/// The ticker task owned by a pool.
///
/// Runs until the lifecycle token is cancelled. The return value is the
/// outcome of the tick that was in flight at cancellation, or None when the
/// ticker was idle; the pool surfaces it as its completion value.
pub(crate) struct ResetLockedTicker {
    pub(crate) pool_id: String,
    pub(crate) store: Arc<dyn MaintenanceStore>,
    pub(crate) events: EventBus,
    pub(crate) lifecycle: CancellationToken,
    pub(crate) min_interval: Duration,
    pub(crate) max_interval: Duration,
}

impl ResetLockedTicker {
    pub(crate) async fn run(self) -> Option<Result<(), StoreError>> {
        let mut delay = initial_delay(self.max_interval, &mut rand::thread_rng());

        loop {
            tokio::select! {
                // Pending timer cancelled by deactivation; nothing in flight.
                _ = self.lifecycle.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }

            debug!(pool_id = %self.pool_id, "reset-locked tick");
            self.events.emit(PoolEvent::ResetLockedStarted {
                pool_id: self.pool_id.clone(),
            });

            // Deliberately not raced against cancellation: an in-flight
            // tick always runs to completion.
            let result = self.store.reset_locked().await;

            let next = if self.lifecycle.is_cancelled() {
                None
            } else {
                Some(next_delay(
                    self.min_interval,
                    self.max_interval,
                    &mut rand::thread_rng(),
                ))
            };

            match &result {
                Ok(()) => {
                    self.events.emit(PoolEvent::ResetLockedSuccess {
                        pool_id: self.pool_id.clone(),
                        next_delay: next,
                    });
                }
                Err(e) => {
                    warn!(pool_id = %self.pool_id, error = %e, "reset-locked failed");
                    self.events.emit(PoolEvent::ResetLockedFailure {
                        pool_id: self.pool_id.clone(),
                        error: e.to_string(),
                        next_delay: next,
                    });
                }
            }

            match next {
                Some(next) => delay = next,
                None => return Some(result),
            }
        }
    }
}
