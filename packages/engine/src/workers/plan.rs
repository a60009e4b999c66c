//! Plan worker: expands a plan into ordered transaction submissions.
//!
//! Steps with no dependencies go first; a step becomes eligible when all
//! of its dependencies have confirmed. Parallelizable eligible steps are
//! submitted together; a non-parallelizable step waits for the plan to be
//! otherwise quiet. On a terminal step failure no further steps are
//! scheduled, in-flight steps run to completion, and the plan fails with
//! the first failure's reason.
//!
//! Completion is observed through bus events with a store poll as the
//! fallback, and the whole execution survives a plan-job retry: existing
//! step transactions are reloaded from the store before anything is
//! submitted, so already-confirmed work is never re-run.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use conveyor::LeasedJob;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::coordinator::{JobContext, JobProcessor};
use crate::error::EngineError;
use crate::events::{EventType, PipelineEvent, PlanEvent};
use crate::intake::TransactionIntake;
use crate::model::{AuditEntry, Plan, TxStatus};
use crate::storage::{SharedAuditStore, SharedTransactionStore};

use super::{decode_payload, PlanJob};

/// The plan-expansion processor.
pub struct PlanWorker {
    transactions: SharedTransactionStore,
    audit: SharedAuditStore,
    intake: Arc<TransactionIntake>,
    poll_interval: Duration,
}

/// Bookkeeping for one plan execution.
#[derive(Default)]
struct Execution {
    confirmed: HashSet<String>,
    started: HashSet<String>,
    in_flight: HashMap<Uuid, String>,
    failure: Option<String>,
}

impl PlanWorker {
    pub fn new(
        transactions: SharedTransactionStore,
        audit: SharedAuditStore,
        intake: Arc<TransactionIntake>,
    ) -> Self {
        Self {
            transactions,
            audit,
            intake,
            poll_interval: Duration::from_millis(250),
        }
    }

    /// Override the store-poll fallback interval.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Seed execution state from transactions persisted by a previous
    /// attempt of the same plan job.
    async fn resume_state(&self, plan: &Plan) -> Result<Execution, EngineError> {
        let mut exec = Execution::default();
        for tx in self.transactions.find_by_plan(plan.id).await? {
            let Some(step_id) = tx.step_id.clone() else {
                continue;
            };
            exec.started.insert(step_id.clone());
            match tx.status {
                TxStatus::Confirmed => {
                    exec.confirmed.insert(step_id);
                }
                TxStatus::Failed | TxStatus::Rejected | TxStatus::Cancelled => {
                    if exec.failure.is_none() {
                        exec.failure = Some(
                            tx.memo
                                .clone()
                                .unwrap_or_else(|| format!("step {step_id} failed")),
                        );
                    }
                }
                _ => {
                    exec.in_flight.insert(tx.id, step_id);
                }
            }
        }
        Ok(exec)
    }

    /// Submit every currently eligible step, honoring the parallelism
    /// flags. A risk-blocked step counts as a terminal step failure.
    async fn submit_eligible(
        &self,
        plan: &Plan,
        job: &PlanJob,
        exec: &mut Execution,
    ) -> Result<(), EngineError> {
        let eligible: Vec<_> = plan
            .eligible_steps(&exec.confirmed, &exec.started)
            .into_iter()
            .cloned()
            .collect();

        for step in eligible {
            if !step.parallelizable && !exec.in_flight.is_empty() {
                continue;
            }
            let spec = step.to_tx_spec(plan.id, job.user_id.clone(), job.agent_id.clone());
            match self.intake.submit(spec).await {
                Ok(tx) => {
                    debug!(plan_id = %plan.id, step = %step.id, transaction_id = %tx.id, "step submitted");
                    exec.started.insert(step.id.clone());
                    exec.in_flight.insert(tx.id, step.id.clone());
                }
                Err(err) if err.is_retryable() => return Err(err),
                Err(err) => {
                    warn!(plan_id = %plan.id, step = %step.id, error = %err, "step rejected at intake");
                    exec.started.insert(step.id.clone());
                    if exec.failure.is_none() {
                        exec.failure = Some(err.to_string());
                    }
                    return Ok(());
                }
            }
            if !step.parallelizable {
                break;
            }
        }
        Ok(())
    }

    /// Fold a terminal transaction status into the execution state.
    fn settle(exec: &mut Execution, tx_id: Uuid, status: TxStatus, error: Option<String>) {
        let Some(step_id) = exec.in_flight.get(&tx_id).cloned() else {
            return;
        };
        match status {
            TxStatus::Confirmed => {
                exec.in_flight.remove(&tx_id);
                exec.confirmed.insert(step_id);
            }
            TxStatus::Failed | TxStatus::Rejected | TxStatus::Cancelled => {
                exec.in_flight.remove(&tx_id);
                if exec.failure.is_none() {
                    exec.failure =
                        Some(error.unwrap_or_else(|| format!("step {step_id} failed")));
                }
            }
            _ => {}
        }
    }

    /// Re-read every in-flight transaction from the store.
    async fn resync(&self, exec: &mut Execution) -> Result<(), EngineError> {
        let in_flight: Vec<Uuid> = exec.in_flight.keys().copied().collect();
        for tx_id in in_flight {
            if let Some(tx) = self.transactions.get(tx_id).await? {
                let error = tx.memo.clone();
                Self::settle(exec, tx_id, tx.status, error);
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl JobProcessor for PlanWorker {
    async fn process(&self, job: LeasedJob, ctx: JobContext) -> Result<(), EngineError> {
        let payload: PlanJob = decode_payload(&job)?;
        let plan = payload.plan.clone();
        plan.validate()?;

        let plan_event = |error: Option<String>| PlanEvent {
            plan_id: plan.id,
            step_count: plan.steps.len(),
            user_id: payload.user_id.clone(),
            agent_id: payload.agent_id.clone(),
            error,
        };

        // Subscribe before any submission so no confirmation is missed.
        let mut rx = ctx.events().subscribe();

        let mut exec = self.resume_state(&plan).await?;
        let resumed = !exec.started.is_empty();
        if !resumed {
            self.audit
                .append(&AuditEntry::ok("plan", "plan_started", "execute", "plan", plan.id))
                .await?;
            ctx.events().publish(PipelineEvent::from_payload(
                EventType::PlanStarted,
                &plan_event(None),
            ));
            info!(plan_id = %plan.id, steps = plan.steps.len(), "plan started");
        } else {
            info!(plan_id = %plan.id, confirmed = exec.confirmed.len(), "plan execution resumed");
        }

        loop {
            if exec.failure.is_none() {
                self.submit_eligible(&plan, &payload, &mut exec).await?;
            }

            if exec.failure.is_none() && exec.confirmed.len() == plan.steps.len() {
                self.audit
                    .append(&AuditEntry::ok("plan", "plan_completed", "execute", "plan", plan.id))
                    .await?;
                ctx.events().publish(PipelineEvent::from_payload(
                    EventType::PlanCompleted,
                    &plan_event(None),
                ));
                info!(plan_id = %plan.id, "plan completed");
                return Ok(());
            }

            if let Some(reason) = &exec.failure {
                if exec.in_flight.is_empty() {
                    self.audit
                        .append(&AuditEntry::failure(
                            "plan",
                            "plan_failed",
                            "execute",
                            "plan",
                            plan.id,
                            reason,
                        ))
                        .await?;
                    ctx.events().publish(PipelineEvent::from_payload(
                        EventType::PlanFailed,
                        &plan_event(Some(reason.clone())),
                    ));
                    warn!(plan_id = %plan.id, reason = %reason, "plan failed");
                    return Ok(());
                }
            }

            tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(EngineError::Cancelled),
                received = rx.recv() => match received {
                    Ok(event) => {
                        if let Some((tx_id, status)) = terminal_tx_event(&event) {
                            let error = event.payload_str("error").map(str::to_string);
                            Self::settle(&mut exec, tx_id, status, error);
                        }
                    }
                    Err(RecvError::Lagged(_)) => self.resync(&mut exec).await?,
                    Err(RecvError::Closed) => self.resync(&mut exec).await?,
                },
                _ = tokio::time::sleep(self.poll_interval) => {
                    self.resync(&mut exec).await?;
                }
            }
        }
    }
}

/// Map a bus event onto a terminal transaction outcome.
fn terminal_tx_event(event: &PipelineEvent) -> Option<(Uuid, TxStatus)> {
    let status = match event.event_type {
        EventType::TransactionConfirmed => TxStatus::Confirmed,
        EventType::TransactionFailed => TxStatus::Failed,
        _ => return None,
    };
    let tx_id = event
        .payload_str("transaction_id")
        .and_then(|s| Uuid::parse_str(s).ok())?;
    Some((tx_id, status))
}
