//! Job model and the queue-backend contract.
//!
//! A job is a unit of work in a named queue: an opaque JSON payload plus
//! scheduling metadata (priority, availability, attempt budget, backoff).
//! The backend decides *when* a job is leaseable; workers stay dumb and
//! just poll [`QueueBackend::lease_next`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting to be leased.
    #[default]
    Pending,
    /// Leased by a worker.
    Active,
    /// Finished successfully. Terminal.
    Completed,
    /// Exhausted its attempts or hit a fatal error. Terminal.
    Failed,
    /// Not yet due (initial delay or retry backoff).
    Delayed,
    /// Held back by a queue-level pause.
    Paused,
}

impl JobState {
    /// Whether the state is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Pending => "pending",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Delayed => "delayed",
            JobState::Paused => "paused",
        };
        f.write_str(s)
    }
}

/// Classification of job failures for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Failure may be transient; retry while attempts remain.
    Retryable,
    /// Failure is permanent; the job goes terminal regardless of the
    /// remaining attempt budget.
    Fatal,
}

impl FailureKind {
    /// Whether this kind permits another attempt.
    pub fn should_retry(&self) -> bool {
        matches!(self, FailureKind::Retryable)
    }
}

/// Delay schedule between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum BackoffPolicy {
    /// `base * 2^(attempt - 1)`: doubles after each failure.
    Exponential {
        /// Base delay in milliseconds.
        base_ms: u64,
    },
    /// The same delay after every failure.
    Fixed {
        /// Delay in milliseconds.
        delay_ms: u64,
    },
}

impl BackoffPolicy {
    /// Convenience constructor for exponential backoff.
    pub fn exponential(base: Duration) -> Self {
        BackoffPolicy::Exponential {
            base_ms: base.as_millis() as u64,
        }
    }

    /// Convenience constructor for fixed backoff.
    pub fn fixed(delay: Duration) -> Self {
        BackoffPolicy::Fixed {
            delay_ms: delay.as_millis() as u64,
        }
    }

    /// Delay to apply after the given (1-based) failed attempt.
    ///
    /// Capped at one hour so a long retry chain cannot schedule a job into
    /// the far future.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        const CAP_MS: u64 = 3_600_000;
        let ms = match self {
            BackoffPolicy::Exponential { base_ms } => {
                base_ms.saturating_mul(1u64 << attempt.saturating_sub(1).min(20))
            }
            BackoffPolicy::Fixed { delay_ms } => *delay_ms,
        };
        Duration::from_millis(ms.min(CAP_MS))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Exponential { base_ms: 1_000 }
    }
}

/// How many terminal jobs a queue keeps around for inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Completed jobs to keep, newest first.
    pub keep_completed: usize,
    /// Failed jobs to keep, newest first.
    pub keep_failed: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            keep_completed: 100,
            keep_failed: 500,
        }
    }
}

/// Options for [`QueueBackend::enqueue`].
#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    /// Higher runs first. Equal priorities lease in enqueue order.
    pub priority: i32,
    /// Initial delay before the job becomes leaseable.
    pub delay: Option<Duration>,
    /// Attempt budget (first attempt included).
    pub max_attempts: u32,
    /// Delay schedule between retries.
    pub backoff: BackoffPolicy,
    /// Caller-supplied id for idempotent enqueue. When a live (non-terminal)
    /// job with this id exists, enqueue dedupes and returns
    /// [`EnqueueResult::Duplicate`].
    pub job_id: Option<Uuid>,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            delay: None,
            max_attempts: 3,
            backoff: BackoffPolicy::default(),
            job_id: None,
        }
    }
}

impl EnqueueOptions {
    /// Options with an idempotent job id and everything else default.
    pub fn with_job_id(job_id: Uuid) -> Self {
        Self {
            job_id: Some(job_id),
            ..Default::default()
        }
    }
}

/// Result of an enqueue that handles idempotency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueResult {
    /// A new job was created.
    Created(Uuid),
    /// A live job with the supplied id already exists.
    Duplicate(Uuid),
}

impl EnqueueResult {
    /// The job id regardless of whether it was created or deduped.
    pub fn job_id(&self) -> Uuid {
        match self {
            EnqueueResult::Created(id) | EnqueueResult::Duplicate(id) => *id,
        }
    }

    /// True if this enqueue created a new job.
    pub fn is_created(&self) -> bool {
        matches!(self, EnqueueResult::Created(_))
    }
}

/// What [`QueueBackend::fail`] did with the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// The job was re-queued; it becomes leaseable at the given instant.
    Retried {
        /// When the next attempt becomes due.
        next_attempt_at: DateTime<Utc>,
    },
    /// The job went terminal.
    Failed,
}

/// A job leased by a worker, ready for execution.
#[derive(Debug, Clone)]
pub struct LeasedJob {
    /// Unique id within the backend.
    pub id: Uuid,
    /// The queue this job was leased from.
    pub queue: String,
    /// Opaque payload; schema is per-queue.
    pub payload: serde_json::Value,
    /// 1-based attempt number of this lease.
    pub attempt: u32,
    /// The job's attempt budget.
    pub max_attempts: u32,
    /// When the job was first enqueued.
    pub enqueued_at: DateTime<Utc>,
}

/// Point-in-time counters for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    /// Pending and due.
    pub waiting: usize,
    /// Currently leased.
    pub active: usize,
    /// Terminal successes still retained.
    pub completed: usize,
    /// Terminal failures still retained.
    pub failed: usize,
    /// Scheduled into the future (initial delay or backoff).
    pub delayed: usize,
}

/// The storage contract for named, durable, priority-aware queues.
///
/// # Implementer notes
///
/// - `lease_next` must be atomic: highest-priority, due, non-paused job
///   transitions to active exactly once. Equal priorities break ties FIFO.
/// - `fail` owns the retry decision: retryable failures with attempts
///   remaining re-queue with the job's backoff delay; everything else goes
///   terminal.
/// - Recurring schedules re-arm themselves; each firing is an ordinary job.
#[async_trait::async_trait]
pub trait QueueBackend: Send + Sync {
    /// Add a job to a queue. Honors priority, delay, attempt budget,
    /// backoff, and the idempotent job id.
    async fn enqueue(
        &self,
        queue: &str,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<EnqueueResult>;

    /// Register a recurring job: `payload` is enqueued every `every`,
    /// starting one interval from now.
    async fn schedule(
        &self,
        queue: &str,
        every: Duration,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<()>;

    /// Atomically lease the next due job, binding it to `worker_id`.
    /// Returns `None` when nothing is leaseable.
    async fn lease_next(&self, queue: &str, worker_id: &str) -> Result<Option<LeasedJob>>;

    /// Mark a leased job completed.
    async fn ack(&self, queue: &str, job_id: Uuid) -> Result<()>;

    /// Mark a leased job failed. Retryable failures with attempts remaining
    /// are re-queued with backoff; fatal failures and exhausted budgets go
    /// terminal.
    async fn fail(
        &self,
        queue: &str,
        job_id: Uuid,
        error: &str,
        kind: FailureKind,
    ) -> Result<FailOutcome>;

    /// Hold back all pending and delayed jobs in the queue.
    async fn pause(&self, queue: &str) -> Result<()>;

    /// Release a paused queue.
    async fn resume(&self, queue: &str) -> Result<()>;

    /// Point-in-time counters for the queue.
    async fn counts(&self, queue: &str) -> Result<QueueCounts>;

    /// Drop terminal jobs beyond the retention policy, oldest first.
    /// Returns the number removed.
    async fn retention_sweep(&self, queue: &str, policy: RetentionPolicy) -> Result<usize>;
}

/// Shared handle to a backend.
pub type SharedBackend = Arc<dyn QueueBackend>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_doubles() {
        let policy = BackoffPolicy::exponential(Duration::from_secs(2));
        assert_eq!(policy.delay_after(1), Duration::from_secs(2));
        assert_eq!(policy.delay_after(2), Duration::from_secs(4));
        assert_eq!(policy.delay_after(3), Duration::from_secs(8));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = BackoffPolicy::fixed(Duration::from_millis(500));
        assert_eq!(policy.delay_after(1), Duration::from_millis(500));
        assert_eq!(policy.delay_after(7), Duration::from_millis(500));
    }

    #[test]
    fn backoff_is_capped() {
        let policy = BackoffPolicy::exponential(Duration::from_secs(600));
        assert_eq!(policy.delay_after(12), Duration::from_secs(3_600));
    }

    #[test]
    fn enqueue_result_helpers() {
        let id = Uuid::new_v4();
        assert!(EnqueueResult::Created(id).is_created());
        assert!(!EnqueueResult::Duplicate(id).is_created());
        assert_eq!(EnqueueResult::Duplicate(id).job_id(), id);
    }

    #[test]
    fn terminal_states() {
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(!JobState::Active.is_terminal());
        assert!(!JobState::Paused.is_terminal());
    }

    #[test]
    fn fatal_never_retries() {
        assert!(FailureKind::Retryable.should_retry());
        assert!(!FailureKind::Fatal.should_retry());
    }
}
