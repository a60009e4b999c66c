//! Automation core for on-chain actions.
//!
//! Execution plans and single transactions enter through the [`Pipeline`]
//! facade, flow through durable queues driven by the [`JobCoordinator`],
//! and come out the other side as broadcast, confirmed (or failed)
//! transactions, gated by the risk-driven [`approvals`] state machine and
//! mirrored to external observers through the [`fanout`] hub.
//!
//! ```text
//! submit_plan / submit_transaction
//!     │  (rate limit, risk gate)
//!     ▼
//! JobCoordinator ── plan queue ──► PlanWorker ──► transaction queue
//!     │                                               │
//!     │             approval pending? ──► ApprovalService ──► queued
//!     │                                               │
//!     │                                               ▼
//!     │                                       TransactionWorker
//!     │                                validate → simulate → estimate
//!     │                                → sign → broadcast → confirm
//!     ▼
//! EventBus ──► SubscriberHub ──► filtered push subscribers
//! ```
//!
//! Chain access and relational storage are behind traits
//! ([`chain::ChainAdapter`], [`storage`]); the crate ships an in-memory
//! store set and a scriptable mock adapter so the whole pipeline runs,
//! and is tested, without external services.

pub mod approvals;
pub mod chain;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod fanout;
pub mod intake;
pub mod model;
pub mod pipeline;
pub mod rate_limit;
pub mod risk;
pub mod storage;
pub mod workers;

pub use approvals::{ApprovalService, ResolverGate};
pub use config::EngineConfig;
pub use coordinator::{CoordinatorHandle, JobContext, JobCoordinator, JobProcessor, QueueName};
pub use error::EngineError;
pub use events::{EventType, PipelineEvent};
pub use fanout::{Push, SubscriberFilter, SubscriberHub, Subscription};
pub use pipeline::{Pipeline, PipelineStats};
pub use risk::{ApprovalPriority, RiskLevel, RiskPolicy};
