//! The pipeline facade: construction, wiring, and the operations the
//! core exposes to its callers.
//!
//! Everything is passed in explicitly through [`EngineDeps`] (stores,
//! queue backend, chain registry, notification senders) and wired once
//! in [`Pipeline::start`]: the coordinator's four worker pools, the
//! approval sweeper, the retention sweeper, and the subscriber hub.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use conveyor::{EventBus, MemoryBackend, QueueCounts, SharedBackend};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::approvals::{ApprovalService, ResolverGate};
use crate::chain::ChainRegistry;
use crate::config::EngineConfig;
use crate::coordinator::{JobCoordinator, QueueName};
use crate::error::EngineError;
use crate::events::PipelineEvent;
use crate::fanout::{SubscriberFilter, SubscriberHub, Subscription};
use crate::intake::TransactionIntake;
use crate::model::{Approval, Notification, Plan, Transaction, TxSpec};
use crate::rate_limit::RateLimiter;
use crate::storage::{
    ApprovalCounts, MemoryStores, SharedApprovalStore, SharedAuditStore, SharedTransactionStore,
};
use crate::workers::{
    ChannelSender, NotificationJob, NotificationWorker, PlanJob, PlanWorker, SimulationWorker,
    TransactionWorker,
};

/// Everything the pipeline needs from outside.
pub struct EngineDeps {
    pub backend: SharedBackend,
    pub transactions: SharedTransactionStore,
    pub approvals: SharedApprovalStore,
    pub audit: SharedAuditStore,
    pub chains: Arc<ChainRegistry>,
    /// Channel senders for the notification worker.
    pub senders: Vec<Arc<dyn ChannelSender>>,
    /// Resolver policy; `None` allows every resolver.
    pub gate: Option<Arc<dyn ResolverGate>>,
}

impl EngineDeps {
    /// Fully in-memory dependencies: the embedded backend and store set.
    /// Returns the concrete stores and backend for inspection.
    pub fn in_memory(chains: Arc<ChainRegistry>) -> (Self, Arc<MemoryStores>, Arc<MemoryBackend>) {
        let stores = Arc::new(MemoryStores::new());
        let backend = Arc::new(MemoryBackend::new());
        let deps = Self {
            backend: backend.clone(),
            transactions: stores.clone(),
            approvals: stores.clone(),
            audit: stores.clone(),
            chains,
            senders: Vec::new(),
            gate: None,
        };
        (deps, stores, backend)
    }
}

/// Aggregate snapshot returned by [`Pipeline::stats`].
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    /// Queue counters keyed by queue name.
    pub queues: HashMap<String, QueueCounts>,
    /// Live push subscribers.
    pub subscribers: usize,
    /// Approval tallies.
    pub approvals: ApprovalCounts,
}

/// The assembled automation pipeline.
pub struct Pipeline {
    config: EngineConfig,
    coordinator: JobCoordinator,
    approvals: Arc<ApprovalService>,
    intake: Arc<TransactionIntake>,
    hub: SubscriberHub,
    limiter: RateLimiter,
    transactions: SharedTransactionStore,
    bus: EventBus<PipelineEvent>,
    background: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl Pipeline {
    /// Wire and start the pipeline: worker pools, approval sweeper,
    /// retention sweeper, subscriber hub.
    pub fn start(config: EngineConfig, deps: EngineDeps) -> Arc<Self> {
        let events: EventBus<PipelineEvent> = EventBus::new();
        let coordinator = JobCoordinator::new(deps.backend.clone(), events.clone());
        let handle = coordinator.handle();
        let cancel = CancellationToken::new();

        let mut approval_service = ApprovalService::new(
            deps.approvals.clone(),
            deps.transactions.clone(),
            deps.audit.clone(),
            handle.clone(),
        )
        .with_ttl(config.approval_ttl);
        if let Some(gate) = deps.gate.clone() {
            approval_service = approval_service.with_gate(gate);
        }
        let approvals = Arc::new(approval_service);

        let intake = Arc::new(TransactionIntake::new(
            deps.transactions.clone(),
            deps.audit.clone(),
            approvals.clone(),
            handle.clone(),
            config.risk,
        ));

        // Worker pools.
        let tx_worker = TransactionWorker::new(
            deps.transactions.clone(),
            deps.audit.clone(),
            deps.chains.clone(),
        )
        .with_broadcast_retry(config.broadcast_attempts, config.broadcast_backoff)
        .with_confirmation(config.confirm_timeout, config.confirm_interval);
        coordinator.register_worker(
            QueueName::Transaction,
            Arc::new(tx_worker),
            config.concurrency(QueueName::Transaction),
        );

        let plan_worker = PlanWorker::new(
            deps.transactions.clone(),
            deps.audit.clone(),
            intake.clone(),
        );
        coordinator.register_worker(
            QueueName::Plan,
            Arc::new(plan_worker),
            config.concurrency(QueueName::Plan),
        );

        let simulation_worker =
            SimulationWorker::new(deps.transactions.clone(), deps.chains.clone());
        coordinator.register_worker(
            QueueName::Simulation,
            Arc::new(simulation_worker),
            config.concurrency(QueueName::Simulation),
        );

        let mut notification_worker = NotificationWorker::new(deps.audit.clone());
        for sender in deps.senders {
            notification_worker = notification_worker.with_sender(sender);
        }
        coordinator.register_worker(
            QueueName::Notification,
            Arc::new(notification_worker),
            config.concurrency(QueueName::Notification),
        );

        let hub = SubscriberHub::new(events.clone());
        let limiter = RateLimiter::new(config.submit_rate_limit, config.submit_rate_window);

        let mut background = Vec::new();
        background.push(approvals.spawn_sweeper(config.sweep_interval, cancel.clone()));

        let pipeline = Arc::new(Self {
            config,
            coordinator,
            approvals,
            intake,
            hub,
            limiter,
            transactions: deps.transactions,
            bus: events,
            background: Mutex::new(background),
            cancel,
        });

        // Retention sweeper.
        {
            let weak = Arc::downgrade(&pipeline);
            let interval = pipeline.config.retention_interval;
            let policy = pipeline.config.retention;
            let cancel = pipeline.cancel.clone();
            let task = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            let Some(pipeline) = weak.upgrade() else { break };
                            if let Err(e) = pipeline.coordinator.retention_sweep(policy).await {
                                warn!(error = %e, "retention sweep failed");
                            }
                        }
                    }
                }
            });
            pipeline.background.lock().push(task);
        }

        info!("pipeline started");
        pipeline
    }

    /// Submit a single transaction. Returns its id once it is persisted
    /// and routed; everything past that point is asynchronous.
    pub async fn submit_transaction(&self, spec: TxSpec) -> Result<Uuid, EngineError> {
        self.limiter
            .check(spec.user_id.as_deref().unwrap_or("anonymous"))?;
        let tx = self.intake.submit(spec).await?;
        Ok(tx.id)
    }

    /// Submit a plan for execution. The job id is the plan id, so a plan
    /// has at most one active execution.
    pub async fn submit_plan(
        &self,
        plan: Plan,
        user_id: Option<String>,
        agent_id: Option<String>,
    ) -> Result<Uuid, EngineError> {
        self.limiter
            .check(user_id.as_deref().unwrap_or("anonymous"))?;
        plan.validate()?;

        let plan_id = plan.id;
        let payload = serde_json::to_value(PlanJob {
            plan,
            user_id,
            agent_id,
        })
        .map_err(anyhow::Error::from)?;
        let mut options = QueueName::Plan.enqueue_options();
        options.job_id = Some(plan_id);
        self.coordinator
            .handle()
            .enqueue(QueueName::Plan, payload, options)
            .await?;
        Ok(plan_id)
    }

    /// Enqueue a standalone dry-run for a persisted transaction.
    pub async fn submit_simulation(
        &self,
        transaction_id: Uuid,
        block: Option<i64>,
    ) -> Result<(), EngineError> {
        let payload = serde_json::to_value(crate::workers::SimulationJob {
            transaction_id,
            block,
        })
        .map_err(anyhow::Error::from)?;
        self.coordinator
            .handle()
            .enqueue(
                QueueName::Simulation,
                payload,
                QueueName::Simulation.enqueue_options(),
            )
            .await?;
        Ok(())
    }

    /// Enqueue an outbound notification.
    pub async fn submit_notification(&self, notification: Notification) -> Result<(), EngineError> {
        let payload = serde_json::to_value(NotificationJob { notification })
            .map_err(anyhow::Error::from)?;
        self.coordinator
            .handle()
            .enqueue(
                QueueName::Notification,
                payload,
                QueueName::Notification.enqueue_options(),
            )
            .await?;
        Ok(())
    }

    /// Approve a pending approval.
    pub async fn approve(
        &self,
        approval_id: Uuid,
        resolver: &str,
        text: Option<&str>,
    ) -> Result<Approval, EngineError> {
        self.approvals.approve(approval_id, resolver, text).await
    }

    /// Reject a pending approval (reason required).
    pub async fn reject(
        &self,
        approval_id: Uuid,
        resolver: &str,
        reason: &str,
    ) -> Result<Approval, EngineError> {
        self.approvals.reject(approval_id, resolver, reason).await
    }

    /// Cancel a pending approval.
    pub async fn cancel(&self, approval_id: Uuid) -> Result<Approval, EngineError> {
        self.approvals.cancel(approval_id).await
    }

    /// Pending approvals, swept first.
    pub async fn pending_approvals(&self) -> Result<Vec<Approval>, EngineError> {
        self.approvals.list_pending().await
    }

    /// Fetch a transaction.
    pub async fn transaction(&self, id: Uuid) -> Result<Option<Transaction>, EngineError> {
        Ok(self.transactions.get(id).await?)
    }

    /// Register a filtered push subscriber.
    pub fn subscribe(&self, filter: SubscriberFilter) -> Subscription {
        self.hub.subscribe(filter)
    }

    /// Remove a push subscriber.
    pub fn unsubscribe(&self, subscriber_id: Uuid) -> bool {
        self.hub.unsubscribe(subscriber_id)
    }

    /// Record subscriber liveness (pong or client activity).
    pub fn touch(&self, subscriber_id: Uuid) {
        self.hub.touch(subscriber_id)
    }

    /// The raw bus, for in-process consumers.
    pub fn events(&self) -> &EventBus<PipelineEvent> {
        &self.bus
    }

    /// Queue counters, subscriber count, and approval tallies.
    pub async fn stats(&self) -> Result<PipelineStats, EngineError> {
        let queues = self
            .coordinator
            .stats()
            .await?
            .into_iter()
            .map(|(queue, counts)| (queue.as_str().to_string(), counts))
            .collect();
        Ok(PipelineStats {
            queues,
            subscribers: self.hub.subscriber_count(),
            approvals: self.approvals.counts().await?,
        })
    }

    /// Hold back a queue.
    pub async fn pause(&self, queue: QueueName) -> Result<(), EngineError> {
        Ok(self.coordinator.pause(queue).await?)
    }

    /// Release a paused queue.
    pub async fn resume(&self, queue: QueueName) -> Result<(), EngineError> {
        Ok(self.coordinator.resume(queue).await?)
    }

    /// Graceful shutdown: stop sweepers and the hub, then drain the
    /// worker pools within the grace window.
    pub async fn shutdown(&self, grace: Duration) {
        self.cancel.cancel();
        self.hub.shutdown();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.background.lock());
        for task in tasks {
            task.abort();
        }
        self.coordinator.shutdown(grace).await;
        info!("pipeline stopped");
    }
}
