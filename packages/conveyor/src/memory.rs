//! In-process reference implementation of [`QueueBackend`].
//!
//! Queues live in a single map behind a mutex; the lock is never held
//! across an await point. Selection is an ordered scan: at in-process
//! scale that beats maintaining a heap, and it keeps the FIFO tie-break
//! trivially correct.
//!
//! Recurring schedules are re-armed lazily inside [`MemoryBackend::lease_next`]:
//! each due firing is materialized as an ordinary job before selection runs.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::QueueError;
use crate::job::{
    BackoffPolicy, EnqueueOptions, EnqueueResult, FailOutcome, FailureKind, JobState, LeasedJob,
    QueueBackend, QueueCounts, RetentionPolicy,
};

#[derive(Debug, Clone)]
struct StoredJob {
    id: Uuid,
    payload: serde_json::Value,
    priority: i32,
    available_at: DateTime<Utc>,
    attempts: u32,
    max_attempts: u32,
    backoff: BackoffPolicy,
    state: JobState,
    seq: u64,
    worker_id: Option<String>,
    last_error: Option<String>,
    enqueued_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct Schedule {
    every: chrono::Duration,
    payload: serde_json::Value,
    options: EnqueueOptions,
    next_at: DateTime<Utc>,
}

#[derive(Default)]
struct QueueState {
    jobs: HashMap<Uuid, StoredJob>,
    schedules: Vec<Schedule>,
    paused: bool,
    next_seq: u64,
}

impl QueueState {
    fn insert_job(&mut self, payload: serde_json::Value, options: &EnqueueOptions) -> Uuid {
        let now = Utc::now();
        let id = options.job_id.unwrap_or_else(Uuid::new_v4);
        let (state, available_at) = match options.delay {
            Some(delay) => (
                JobState::Delayed,
                now + chrono::Duration::milliseconds(delay.as_millis() as i64),
            ),
            None => (JobState::Pending, now),
        };
        let seq = self.next_seq;
        self.next_seq += 1;
        self.jobs.insert(
            id,
            StoredJob {
                id,
                payload,
                priority: options.priority,
                available_at,
                attempts: 0,
                max_attempts: options.max_attempts.max(1),
                backoff: options.backoff,
                state: if self.paused { JobState::Paused } else { state },
                seq,
                worker_id: None,
                last_error: None,
                enqueued_at: now,
                finished_at: None,
            },
        );
        id
    }

    fn rearm_schedules(&mut self, now: DateTime<Utc>) {
        let mut due: Vec<(serde_json::Value, EnqueueOptions)> = Vec::new();
        for schedule in &mut self.schedules {
            while schedule.next_at <= now {
                due.push((schedule.payload.clone(), schedule.options.clone()));
                schedule.next_at += schedule.every;
            }
        }
        for (payload, mut options) in due {
            // Each firing is a fresh job; the idempotent id only applies to
            // the first one.
            options.job_id = None;
            self.insert_job(payload, &options);
        }
    }
}

/// In-memory [`QueueBackend`].
///
/// Complete with respect to the contract: priority + FIFO leasing, delays,
/// retry backoff, pause/resume, idempotent ids, recurring schedules, counts,
/// and retention. Wrap it in an `Arc` like any other backend.
#[derive(Default)]
pub struct MemoryBackend {
    queues: Mutex<HashMap<String, QueueState>>,
}

impl MemoryBackend {
    /// Create an empty backend. Queues materialize on first use.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inspect a job's state. Test and diagnostics helper.
    pub fn job_state(&self, queue: &str, job_id: Uuid) -> Option<JobState> {
        self.queues
            .lock()
            .get(queue)
            .and_then(|q| q.jobs.get(&job_id))
            .map(|j| j.state)
    }

    /// Inspect a job's attempt count. Test and diagnostics helper.
    pub fn job_attempts(&self, queue: &str, job_id: Uuid) -> Option<u32> {
        self.queues
            .lock()
            .get(queue)
            .and_then(|q| q.jobs.get(&job_id))
            .map(|j| j.attempts)
    }

    /// Inspect a job's last recorded error. Test and diagnostics helper.
    pub fn job_error(&self, queue: &str, job_id: Uuid) -> Option<String> {
        self.queues
            .lock()
            .get(queue)
            .and_then(|q| q.jobs.get(&job_id))
            .and_then(|j| j.last_error.clone())
    }
}

#[async_trait::async_trait]
impl QueueBackend for MemoryBackend {
    async fn enqueue(
        &self,
        queue: &str,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<EnqueueResult> {
        let mut queues = self.queues.lock();
        let state = queues.entry(queue.to_string()).or_default();

        if let Some(id) = options.job_id {
            if let Some(existing) = state.jobs.get(&id) {
                if !existing.state.is_terminal() {
                    return Ok(EnqueueResult::Duplicate(id));
                }
                // A terminal job under the same id is replaced by the new run.
                state.jobs.remove(&id);
            }
        }

        let id = state.insert_job(payload, &options);
        Ok(EnqueueResult::Created(id))
    }

    async fn schedule(
        &self,
        queue: &str,
        every: Duration,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<()> {
        let every = chrono::Duration::milliseconds(every.as_millis() as i64);
        let mut queues = self.queues.lock();
        let state = queues.entry(queue.to_string()).or_default();
        state.schedules.push(Schedule {
            every,
            payload,
            options,
            next_at: Utc::now() + every,
        });
        Ok(())
    }

    async fn lease_next(&self, queue: &str, worker_id: &str) -> Result<Option<LeasedJob>> {
        let now = Utc::now();
        let mut queues = self.queues.lock();
        let state = queues.entry(queue.to_string()).or_default();

        state.rearm_schedules(now);

        if state.paused {
            return Ok(None);
        }

        // Promote delayed jobs that have become due.
        for job in state.jobs.values_mut() {
            if job.state == JobState::Delayed && job.available_at <= now {
                job.state = JobState::Pending;
            }
        }

        // Highest priority first; FIFO within a priority.
        let best = state
            .jobs
            .values()
            .filter(|j| j.state == JobState::Pending && j.available_at <= now)
            .map(|j| (j.priority, std::cmp::Reverse(j.seq), j.id))
            .max()
            .map(|(_, _, id)| id);

        let Some(id) = best else {
            return Ok(None);
        };

        let job = state
            .jobs
            .get_mut(&id)
            .ok_or(QueueError::UnknownJob {
                queue: queue.to_string(),
                job_id: id,
            })?;
        job.state = JobState::Active;
        job.attempts += 1;
        job.worker_id = Some(worker_id.to_string());

        Ok(Some(LeasedJob {
            id: job.id,
            queue: queue.to_string(),
            payload: job.payload.clone(),
            attempt: job.attempts,
            max_attempts: job.max_attempts,
            enqueued_at: job.enqueued_at,
        }))
    }

    async fn ack(&self, queue: &str, job_id: Uuid) -> Result<()> {
        let mut queues = self.queues.lock();
        let state = queues
            .get_mut(queue)
            .ok_or_else(|| QueueError::UnknownQueue(queue.to_string()))?;
        let job = state.jobs.get_mut(&job_id).ok_or(QueueError::UnknownJob {
            queue: queue.to_string(),
            job_id,
        })?;
        if job.state != JobState::Active {
            return Err(QueueError::NotActive {
                job_id,
                state: job.state.to_string(),
            }
            .into());
        }
        job.state = JobState::Completed;
        job.worker_id = None;
        job.finished_at = Some(Utc::now());
        Ok(())
    }

    async fn fail(
        &self,
        queue: &str,
        job_id: Uuid,
        error: &str,
        kind: FailureKind,
    ) -> Result<FailOutcome> {
        let now = Utc::now();
        let mut queues = self.queues.lock();
        let state = queues
            .get_mut(queue)
            .ok_or_else(|| QueueError::UnknownQueue(queue.to_string()))?;
        let job = state.jobs.get_mut(&job_id).ok_or(QueueError::UnknownJob {
            queue: queue.to_string(),
            job_id,
        })?;
        if job.state != JobState::Active {
            return Err(QueueError::NotActive {
                job_id,
                state: job.state.to_string(),
            }
            .into());
        }

        job.last_error = Some(error.to_string());
        job.worker_id = None;

        if kind.should_retry() && job.attempts < job.max_attempts {
            let delay = job.backoff.delay_after(job.attempts);
            let next_attempt_at = now + chrono::Duration::milliseconds(delay.as_millis() as i64);
            job.state = JobState::Delayed;
            job.available_at = next_attempt_at;
            tracing::debug!(
                job_id = %job_id,
                queue = %queue,
                attempt = job.attempts,
                next_attempt_at = %next_attempt_at,
                "job re-queued for retry"
            );
            Ok(FailOutcome::Retried { next_attempt_at })
        } else {
            job.state = JobState::Failed;
            job.finished_at = Some(now);
            tracing::warn!(
                job_id = %job_id,
                queue = %queue,
                attempts = job.attempts,
                error = %error,
                "job failed terminally"
            );
            Ok(FailOutcome::Failed)
        }
    }

    async fn pause(&self, queue: &str) -> Result<()> {
        let mut queues = self.queues.lock();
        let state = queues.entry(queue.to_string()).or_default();
        state.paused = true;
        for job in state.jobs.values_mut() {
            if matches!(job.state, JobState::Pending | JobState::Delayed) {
                job.state = JobState::Paused;
            }
        }
        Ok(())
    }

    async fn resume(&self, queue: &str) -> Result<()> {
        let now = Utc::now();
        let mut queues = self.queues.lock();
        let state = queues.entry(queue.to_string()).or_default();
        state.paused = false;
        for job in state.jobs.values_mut() {
            if job.state == JobState::Paused {
                job.state = if job.available_at <= now {
                    JobState::Pending
                } else {
                    JobState::Delayed
                };
            }
        }
        Ok(())
    }

    async fn counts(&self, queue: &str) -> Result<QueueCounts> {
        let now = Utc::now();
        let queues = self.queues.lock();
        let Some(state) = queues.get(queue) else {
            return Ok(QueueCounts::default());
        };
        let mut counts = QueueCounts::default();
        for job in state.jobs.values() {
            match job.state {
                JobState::Pending if job.available_at <= now => counts.waiting += 1,
                JobState::Pending | JobState::Delayed => counts.delayed += 1,
                JobState::Paused => counts.waiting += 1,
                JobState::Active => counts.active += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    async fn retention_sweep(&self, queue: &str, policy: RetentionPolicy) -> Result<usize> {
        let mut queues = self.queues.lock();
        let Some(state) = queues.get_mut(queue) else {
            return Ok(0);
        };

        let mut removed = 0;
        for (terminal, keep) in [
            (JobState::Completed, policy.keep_completed),
            (JobState::Failed, policy.keep_failed),
        ] {
            let mut ids: Vec<(DateTime<Utc>, Uuid)> = state
                .jobs
                .values()
                .filter(|j| j.state == terminal)
                .map(|j| (j.finished_at.unwrap_or(j.enqueued_at), j.id))
                .collect();
            if ids.len() <= keep {
                continue;
            }
            // Newest first; everything past `keep` is dropped.
            ids.sort_by(|a, b| b.0.cmp(&a.0));
            for (_, id) in ids.split_off(keep) {
                state.jobs.remove(&id);
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn opts() -> EnqueueOptions {
        EnqueueOptions::default()
    }

    #[tokio::test]
    async fn leases_highest_priority_first() {
        let backend = MemoryBackend::new();
        backend
            .enqueue("q", json!({"n": 1}), EnqueueOptions { priority: 0, ..opts() })
            .await
            .unwrap();
        backend
            .enqueue("q", json!({"n": 2}), EnqueueOptions { priority: 5, ..opts() })
            .await
            .unwrap();

        let job = backend.lease_next("q", "w1").await.unwrap().unwrap();
        assert_eq!(job.payload["n"], 2);
    }

    #[tokio::test]
    async fn equal_priority_leases_fifo() {
        let backend = MemoryBackend::new();
        for n in 0..3 {
            backend.enqueue("q", json!({ "n": n }), opts()).await.unwrap();
        }
        for n in 0..3 {
            let job = backend.lease_next("q", "w1").await.unwrap().unwrap();
            assert_eq!(job.payload["n"], n);
            backend.ack("q", job.id).await.unwrap();
        }
    }

    #[tokio::test]
    async fn leased_job_is_not_leased_twice() {
        let backend = MemoryBackend::new();
        backend.enqueue("q", json!({}), opts()).await.unwrap();

        assert!(backend.lease_next("q", "w1").await.unwrap().is_some());
        assert!(backend.lease_next("q", "w2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delayed_job_is_not_due_immediately() {
        let backend = MemoryBackend::new();
        backend
            .enqueue(
                "q",
                json!({}),
                EnqueueOptions {
                    delay: Some(Duration::from_secs(60)),
                    ..opts()
                },
            )
            .await
            .unwrap();

        assert!(backend.lease_next("q", "w1").await.unwrap().is_none());
        let counts = backend.counts("q").await.unwrap();
        assert_eq!(counts.delayed, 1);
    }

    #[tokio::test]
    async fn retryable_failure_requeues_with_backoff() {
        let backend = MemoryBackend::new();
        let result = backend
            .enqueue(
                "q",
                json!({}),
                EnqueueOptions {
                    max_attempts: 3,
                    backoff: BackoffPolicy::fixed(Duration::from_secs(30)),
                    ..opts()
                },
            )
            .await
            .unwrap();
        let id = result.job_id();

        let job = backend.lease_next("q", "w1").await.unwrap().unwrap();
        assert_eq!(job.attempt, 1);

        let outcome = backend
            .fail("q", job.id, "connection reset", FailureKind::Retryable)
            .await
            .unwrap();
        assert!(matches!(outcome, FailOutcome::Retried { .. }));
        assert_eq!(backend.job_state("q", id), Some(JobState::Delayed));
        // The retry is scheduled 30s out, so nothing is leaseable now.
        assert!(backend.lease_next("q", "w1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fatal_failure_skips_remaining_attempts() {
        let backend = MemoryBackend::new();
        backend
            .enqueue("q", json!({}), EnqueueOptions { max_attempts: 5, ..opts() })
            .await
            .unwrap();

        let job = backend.lease_next("q", "w1").await.unwrap().unwrap();
        let outcome = backend
            .fail("q", job.id, "bad address", FailureKind::Fatal)
            .await
            .unwrap();
        assert_eq!(outcome, FailOutcome::Failed);
        assert_eq!(backend.job_state("q", job.id), Some(JobState::Failed));
    }

    #[tokio::test]
    async fn attempts_never_exceed_budget() {
        let backend = MemoryBackend::new();
        let id = backend
            .enqueue(
                "q",
                json!({}),
                EnqueueOptions {
                    max_attempts: 2,
                    backoff: BackoffPolicy::fixed(Duration::ZERO),
                    ..opts()
                },
            )
            .await
            .unwrap()
            .job_id();

        for expected_attempt in 1..=2 {
            let job = backend.lease_next("q", "w1").await.unwrap().unwrap();
            assert_eq!(job.attempt, expected_attempt);
            backend
                .fail("q", job.id, "timeout", FailureKind::Retryable)
                .await
                .unwrap();
        }
        assert_eq!(backend.job_state("q", id), Some(JobState::Failed));
        assert_eq!(backend.job_attempts("q", id), Some(2));
        assert!(backend.lease_next("q", "w1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_job_id_dedupes() {
        let backend = MemoryBackend::new();
        let id = Uuid::new_v4();
        let first = backend
            .enqueue("q", json!({}), EnqueueOptions::with_job_id(id))
            .await
            .unwrap();
        let second = backend
            .enqueue("q", json!({}), EnqueueOptions::with_job_id(id))
            .await
            .unwrap();

        assert!(first.is_created());
        assert_eq!(second, EnqueueResult::Duplicate(id));
        assert_eq!(backend.counts("q").await.unwrap().waiting, 1);
    }

    #[tokio::test]
    async fn pause_holds_jobs_and_resume_releases() {
        let backend = MemoryBackend::new();
        backend.enqueue("q", json!({}), opts()).await.unwrap();
        backend.pause("q").await.unwrap();

        assert!(backend.lease_next("q", "w1").await.unwrap().is_none());

        backend.resume("q").await.unwrap();
        assert!(backend.lease_next("q", "w1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn retention_keeps_last_n() {
        let backend = MemoryBackend::new();
        for _ in 0..5 {
            let id = backend.enqueue("q", json!({}), opts()).await.unwrap().job_id();
            backend.lease_next("q", "w1").await.unwrap().unwrap();
            backend.ack("q", id).await.unwrap();
        }

        let removed = backend
            .retention_sweep(
                "q",
                RetentionPolicy {
                    keep_completed: 2,
                    keep_failed: 0,
                },
            )
            .await
            .unwrap();
        assert_eq!(removed, 3);
        assert_eq!(backend.counts("q").await.unwrap().completed, 2);
    }

    #[tokio::test]
    async fn schedule_rearms_each_interval() {
        let backend = MemoryBackend::new();
        backend
            .schedule("q", Duration::from_millis(10), json!({"tick": true}), opts())
            .await
            .unwrap();

        assert!(backend.lease_next("q", "w1").await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(25)).await;
        let first = backend.lease_next("q", "w1").await.unwrap().unwrap();
        assert_eq!(first.payload["tick"], true);
        let second = backend.lease_next("q", "w1").await.unwrap();
        assert!(second.is_some(), "two intervals elapsed, two firings");
    }

    #[tokio::test]
    async fn ack_requires_active_lease() {
        let backend = MemoryBackend::new();
        let id = backend.enqueue("q", json!({}), opts()).await.unwrap().job_id();
        let err = backend.ack("q", id).await.unwrap_err();
        assert!(err.downcast_ref::<QueueError>().is_some());
    }
}
