//! # Conveyor
//!
//! A priority-aware durable job queue contract plus the event plumbing that
//! pipelines built on it need.
//!
//! Conveyor owns interfaces and mechanics, not policy:
//! - [`QueueBackend`] — the storage contract for named queues: enqueue with
//!   priority/delay/idempotency, atomic leasing, ack/fail with retry
//!   classification, pause/resume, counters, retention.
//! - [`MemoryBackend`] — a complete in-process implementation of the
//!   contract, used as the embedded default and by test suites.
//! - [`EventBus`] — a clonable broadcast channel for lifecycle and domain
//!   events.
//!
//! Policy decisions (queue names, concurrency, backoff defaults, payload
//! schemas, polling cadence) belong to the application that drives the
//! backend.
//!
//! # Guarantees
//!
//! - **Linearizable per job**: once [`QueueBackend::lease_next`] returns a
//!   job, no other call returns the same job until it is acked or failed.
//! - **Fair leasing**: equal-priority jobs are leased in enqueue order.
//! - **At-most-once events**: the bus is in-memory; slow receivers may lag.
//!   Use entity status fields for durability.

pub mod bus;
pub mod error;
pub mod job;
pub mod memory;

pub use bus::EventBus;
pub use error::QueueError;
pub use job::{
    BackoffPolicy, EnqueueOptions, EnqueueResult, FailOutcome, FailureKind, JobState, LeasedJob,
    QueueBackend, QueueCounts, RetentionPolicy, SharedBackend,
};
pub use memory::MemoryBackend;
