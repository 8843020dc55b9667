//! Job row snapshot

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A snapshot of a queued job row.
///
/// Workers hand these back through [`Worker::active_job`] so the pool can
/// mark abandoned work as failed during shutdown. The shape mirrors the
/// queue table; execution bookkeeping (retries, task dispatch) lives with
/// the worker implementation, not here.
///
/// [`Worker::active_job`]: crate::worker::Worker::active_job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Job {
    /// Job identifier
    pub id: Uuid,

    /// Named queue, if the job is serialized behind one
    pub queue_name: Option<String>,

    /// Task identifier used to look up the handler
    pub task_identifier: String,

    /// Task payload
    pub payload: serde_json::Value,

    /// Scheduling priority (lower runs first)
    pub priority: i16,

    /// Earliest time the job may run
    pub run_at: DateTime<Utc>,

    /// Attempts so far (1-based once running)
    pub attempts: i16,

    /// Attempts allowed before the job is permanently failed
    pub max_attempts: i16,

    /// Message from the most recent failure, if any
    pub last_error: Option<String>,

    /// When the current worker locked the row
    pub locked_at: Option<DateTime<Utc>>,

    /// Worker id holding the lock
    pub locked_by: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_job() -> Job {
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
            locked_by: Some("worker-1".to_string()),
        }
    }

    #[test]
    fn test_serialization_round_trip() {
        let job = sample_job();
        let json = serde_json::to_string(&job).unwrap();
        let parsed: Job = serde_json::from_str(&json).unwrap();
        assert_eq!(job, parsed);
    }
}
