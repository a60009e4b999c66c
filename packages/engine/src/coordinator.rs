//! Job coordinator: named queues, worker pools, lifecycle events.
//!
//! The coordinator owns the four pipeline queues and a worker pool per
//! queue. Each worker slot loops lease → process → ack/fail; processors
//! classify their own errors ([`crate::error::EngineError::failure_kind`])
//! and the backend owns the retry arithmetic. Every transition is
//! mirrored onto the bus as a `job:*` event.
//!
//! Shutdown cancels the shared token, stops leasing, and waits out a
//! bounded grace window for in-flight work.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use conveyor::{
    BackoffPolicy, EnqueueOptions, EnqueueResult, EventBus, FailOutcome, FailureKind, LeasedJob,
    QueueCounts, RetentionPolicy, SharedBackend,
};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::EngineError;
use crate::events::{AlertEvent, EventType, JobEvent, PipelineEvent};

/// The pipeline's named queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueName {
    Plan,
    Transaction,
    Simulation,
    Notification,
}

impl QueueName {
    /// Every queue, in registration order.
    pub const ALL: [QueueName; 4] = [
        QueueName::Plan,
        QueueName::Transaction,
        QueueName::Simulation,
        QueueName::Notification,
    ];

    /// The backend queue name.
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Plan => "plan",
            QueueName::Transaction => "transaction",
            QueueName::Simulation => "simulation",
            QueueName::Notification => "notification",
        }
    }

    /// The retry defaults for this queue.
    pub fn enqueue_options(&self) -> EnqueueOptions {
        let (max_attempts, backoff) = match self {
            QueueName::Plan => (3, BackoffPolicy::exponential(Duration::from_secs(1))),
            QueueName::Transaction => (3, BackoffPolicy::exponential(Duration::from_secs(2))),
            QueueName::Simulation => (2, BackoffPolicy::fixed(Duration::from_millis(500))),
            QueueName::Notification => (3, BackoffPolicy::exponential(Duration::from_secs(1))),
        };
        EnqueueOptions {
            max_attempts,
            backoff,
            ..Default::default()
        }
    }

    /// Default pool parallelism for this queue.
    pub fn default_concurrency(&self) -> usize {
        match self {
            QueueName::Plan => 3,
            QueueName::Transaction => 5,
            QueueName::Simulation => 10,
            QueueName::Notification => 10,
        }
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a processor gets besides the job itself.
#[derive(Clone)]
pub struct JobContext {
    pub queue: QueueName,
    pub job_id: Uuid,
    /// 1-based attempt number of this lease.
    pub attempt: u32,
    /// Cancelled on coordinator shutdown. Long calls must select on it.
    pub cancel: CancellationToken,
    events: EventBus<PipelineEvent>,
}

impl JobContext {
    pub(crate) fn new(
        queue: QueueName,
        job_id: Uuid,
        attempt: u32,
        cancel: CancellationToken,
        events: EventBus<PipelineEvent>,
    ) -> Self {
        Self {
            queue,
            job_id,
            attempt,
            cancel,
            events,
        }
    }

    /// Publish a `job:progress` event for this job.
    pub fn progress(&self, percent: u8) {
        self.events.publish(PipelineEvent::from_payload(
            EventType::JobProgress,
            &JobEvent {
                queue: self.queue.as_str().to_string(),
                job_id: self.job_id,
                progress: Some(percent.min(100)),
                error: None,
            },
        ));
    }

    /// The bus, for domain events published mid-job.
    pub fn events(&self) -> &EventBus<PipelineEvent> {
        &self.events
    }
}

/// A queue's worker implementation.
#[async_trait::async_trait]
pub trait JobProcessor: Send + Sync {
    /// Process one leased job. `Ok` acks; `Err` fails with the error's own
    /// retry classification.
    async fn process(&self, job: LeasedJob, ctx: JobContext) -> Result<(), EngineError>;
}

/// Cheap handle for submitting work and publishing events, handed to
/// workers and services so they do not need the coordinator itself.
#[derive(Clone)]
pub struct CoordinatorHandle {
    backend: SharedBackend,
    events: EventBus<PipelineEvent>,
}

impl CoordinatorHandle {
    /// Enqueue a job, publishing `job:queued` when it is newly created.
    pub async fn enqueue(
        &self,
        queue: QueueName,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<EnqueueResult> {
        let result = self.backend.enqueue(queue.as_str(), payload, options).await?;
        if result.is_created() {
            self.events.publish(PipelineEvent::from_payload(
                EventType::JobQueued,
                &JobEvent {
                    queue: queue.as_str().to_string(),
                    job_id: result.job_id(),
                    progress: None,
                    error: None,
                },
            ));
        } else {
            debug!(queue = %queue, job_id = %result.job_id(), "enqueue deduplicated");
        }
        Ok(result)
    }

    /// Register a recurring job on a queue.
    pub async fn schedule(
        &self,
        queue: QueueName,
        every: Duration,
        payload: serde_json::Value,
    ) -> Result<()> {
        self.backend
            .schedule(queue.as_str(), every, payload, queue.enqueue_options())
            .await
    }

    /// Publish a domain event.
    pub fn publish(&self, event: PipelineEvent) {
        self.events.publish(event);
    }

    /// The bus itself.
    pub fn events(&self) -> &EventBus<PipelineEvent> {
        &self.events
    }
}

/// Queue registry plus worker pools.
pub struct JobCoordinator {
    backend: SharedBackend,
    events: EventBus<PipelineEvent>,
    cancel: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
    poll_interval: Duration,
}

impl JobCoordinator {
    /// Create a coordinator over a backend and bus.
    pub fn new(backend: SharedBackend, events: EventBus<PipelineEvent>) -> Self {
        Self {
            backend,
            events,
            cancel: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
            poll_interval: Duration::from_millis(50),
        }
    }

    /// Override how long idle workers sleep between lease polls.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// A cheap handle for submitters.
    pub fn handle(&self) -> CoordinatorHandle {
        CoordinatorHandle {
            backend: self.backend.clone(),
            events: self.events.clone(),
        }
    }

    /// Spawn `parallelism` worker slots for a queue.
    pub fn register_worker(
        &self,
        queue: QueueName,
        processor: Arc<dyn JobProcessor>,
        parallelism: usize,
    ) {
        let parallelism = parallelism.max(1);
        let mut workers = self.workers.lock();
        for slot in 0..parallelism {
            let backend = self.backend.clone();
            let events = self.events.clone();
            let cancel = self.cancel.clone();
            let processor = processor.clone();
            let poll_interval = self.poll_interval;
            let worker_id = format!("{}-{}", queue.as_str(), slot);
            workers.push(tokio::spawn(async move {
                worker_loop(
                    backend,
                    events,
                    cancel,
                    queue,
                    processor,
                    worker_id,
                    poll_interval,
                )
                .await;
            }));
        }
        info!(queue = %queue, parallelism, "worker pool registered");
    }

    /// Hold back a queue.
    pub async fn pause(&self, queue: QueueName) -> Result<()> {
        self.backend.pause(queue.as_str()).await
    }

    /// Release a paused queue.
    pub async fn resume(&self, queue: QueueName) -> Result<()> {
        self.backend.resume(queue.as_str()).await
    }

    /// Counters for every queue.
    pub async fn stats(&self) -> Result<HashMap<QueueName, QueueCounts>> {
        let mut stats = HashMap::new();
        for queue in QueueName::ALL {
            stats.insert(queue, self.backend.counts(queue.as_str()).await?);
        }
        Ok(stats)
    }

    /// Apply the retention policy to every queue. Returns jobs removed.
    pub async fn retention_sweep(&self, policy: RetentionPolicy) -> Result<usize> {
        let mut removed = 0;
        for queue in QueueName::ALL {
            removed += self.backend.retention_sweep(queue.as_str(), policy).await?;
        }
        Ok(removed)
    }

    /// Stop leasing, cancel in-flight work, and wait out the grace window.
    pub async fn shutdown(&self, grace: Duration) {
        info!("coordinator shutting down");
        self.cancel.cancel();

        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        let drain = async {
            for worker in workers {
                let _ = worker.await;
            }
        };
        if tokio::time::timeout(grace, drain).await.is_err() {
            warn!(grace_ms = grace.as_millis() as u64, "grace window elapsed with workers still running");
        }

        self.events.publish(PipelineEvent::from_payload(
            EventType::SystemAlert,
            &AlertEvent {
                severity: "info".to_string(),
                title: "coordinator shutdown".to_string(),
                message: "job coordinator stopped accepting leases".to_string(),
                context: serde_json::Value::Null,
            },
        ));
    }

    /// Whether shutdown has been requested.
    pub fn is_shutting_down(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

async fn worker_loop(
    backend: SharedBackend,
    events: EventBus<PipelineEvent>,
    cancel: CancellationToken,
    queue: QueueName,
    processor: Arc<dyn JobProcessor>,
    worker_id: String,
    poll_interval: Duration,
) {
    debug!(worker_id = %worker_id, "worker slot started");
    loop {
        if cancel.is_cancelled() {
            break;
        }

        let leased = match backend.lease_next(queue.as_str(), &worker_id).await {
            Ok(leased) => leased,
            Err(e) => {
                error!(queue = %queue, error = %e, "failed to lease");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
                }
            }
        };

        let Some(job) = leased else {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(poll_interval) => {}
            }
            continue;
        };

        process_one(&backend, &events, &cancel, queue, &processor, job).await;
    }
    debug!(worker_id = %worker_id, "worker slot stopped");
}

async fn process_one(
    backend: &SharedBackend,
    events: &EventBus<PipelineEvent>,
    cancel: &CancellationToken,
    queue: QueueName,
    processor: &Arc<dyn JobProcessor>,
    job: LeasedJob,
) {
    let job_id = job.id;
    let ctx = JobContext::new(queue, job_id, job.attempt, cancel.child_token(), events.clone());

    debug!(queue = %queue, job_id = %job_id, attempt = job.attempt, "executing job");

    // Run in a task of its own so a panicking processor surfaces as a
    // stalled job instead of killing the worker slot.
    let outcome = {
        let processor = processor.clone();
        tokio::spawn(async move { processor.process(job, ctx).await }).await
    };

    let job_event = |error: Option<String>| JobEvent {
        queue: queue.as_str().to_string(),
        job_id,
        progress: None,
        error,
    };

    match outcome {
        Ok(Ok(())) => {
            if let Err(e) = backend.ack(queue.as_str(), job_id).await {
                error!(job_id = %job_id, error = %e, "failed to ack job");
            }
            events.publish(PipelineEvent::from_payload(
                EventType::JobCompleted,
                &job_event(None),
            ));
        }
        Ok(Err(err)) => {
            let kind = err.failure_kind();
            warn!(queue = %queue, job_id = %job_id, error = %err, retryable = kind.should_retry(), "job failed");
            match backend.fail(queue.as_str(), job_id, &err.to_string(), kind).await {
                Ok(FailOutcome::Retried { next_attempt_at }) => {
                    debug!(job_id = %job_id, next_attempt_at = %next_attempt_at, "job will retry");
                }
                Ok(FailOutcome::Failed) => {
                    events.publish(PipelineEvent::from_payload(
                        EventType::JobFailed,
                        &job_event(Some(err.to_string())),
                    ));
                }
                Err(e) => error!(job_id = %job_id, error = %e, "failed to record job failure"),
            }
        }
        Err(join_err) => {
            // Panic or abort inside the processor.
            error!(queue = %queue, job_id = %job_id, error = %join_err, "job stalled");
            events.publish(PipelineEvent::from_payload(
                EventType::JobStalled,
                &job_event(Some(join_err.to_string())),
            ));
            let message = format!("worker stalled: {join_err}");
            match backend
                .fail(queue.as_str(), job_id, &message, FailureKind::Retryable)
                .await
            {
                Ok(FailOutcome::Failed) => {
                    events.publish(PipelineEvent::from_payload(
                        EventType::JobFailed,
                        &job_event(Some(message)),
                    ));
                }
                Ok(FailOutcome::Retried { .. }) => {}
                Err(e) => error!(job_id = %job_id, error = %e, "failed to record stalled job"),
            }
        }
    }
}
