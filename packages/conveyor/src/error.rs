//! Structured errors for queue-backend operations.

use uuid::Uuid;

/// Errors raised by [`crate::QueueBackend`] implementations.
///
/// Backends wrap these in `anyhow::Error` at the trait boundary so that
/// remote backends can surface their own transport errors alongside them.
/// Callers that care about a specific case downcast.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The named queue has not been registered with the backend.
    #[error("unknown queue: {0}")]
    UnknownQueue(String),

    /// The job id is not present in the queue.
    #[error("unknown job {job_id} in queue {queue}")]
    UnknownJob {
        /// The queue that was addressed.
        queue: String,
        /// The missing job id.
        job_id: Uuid,
    },

    /// The job is not in a state that permits the requested transition
    /// (e.g. acking a job that is not active).
    #[error("job {job_id} is not active (state: {state})")]
    NotActive {
        /// The offending job id.
        job_id: Uuid,
        /// The state the job was actually in.
        state: String,
    },
}
