//! Approval state machine.
//!
//! One pending approval gates one transaction. Every resolution path is a
//! compare-and-set in the store (`Pending → resolved` exactly once); the
//! service layers the transaction linkage on top: approving queues the
//! broadcast job, rejecting/cancelling drops the transaction, expiring
//! leaves it in `AwaitingApproval` for reconciliation.
//!
//! The expiry sweep is policy-driven time, not an in-memory timer, so it
//! survives restarts and is idempotent. Listing pending approvals always
//! sweeps first so callers never see stale entries.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::coordinator::{CoordinatorHandle, QueueName};
use crate::error::EngineError;
use crate::events::{EventType, PipelineEvent};
use crate::model::{Approval, ApprovalStatus, AuditEntry, TxStatus};
use crate::storage::{
    ApprovalCounts, SharedApprovalStore, SharedAuditStore, SharedTransactionStore,
};
use crate::workers::TransactionJob;

/// Caller-supplied policy over who may resolve approvals. Role and
/// ownership models live outside the core; resolvers are opaque ids here.
pub trait ResolverGate: Send + Sync {
    /// Whether `resolver` may approve or reject this approval.
    fn can_resolve(&self, resolver: &str, approval: &Approval) -> bool;
}

/// The default gate: anyone may resolve.
pub struct AllowAllResolvers;

impl ResolverGate for AllowAllResolvers {
    fn can_resolve(&self, _resolver: &str, _approval: &Approval) -> bool {
        true
    }
}

/// The approval lifecycle service.
pub struct ApprovalService {
    approvals: SharedApprovalStore,
    transactions: SharedTransactionStore,
    audit: SharedAuditStore,
    handle: CoordinatorHandle,
    ttl: chrono::Duration,
    gate: Arc<dyn ResolverGate>,
}

impl ApprovalService {
    /// Service with the default 60-minute expiry window and an
    /// allow-all resolver gate.
    pub fn new(
        approvals: SharedApprovalStore,
        transactions: SharedTransactionStore,
        audit: SharedAuditStore,
        handle: CoordinatorHandle,
    ) -> Self {
        Self {
            approvals,
            transactions,
            audit,
            handle,
            ttl: chrono::Duration::minutes(60),
            gate: Arc::new(AllowAllResolvers),
        }
    }

    /// Override the pending-approval time-to-live.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = chrono::Duration::milliseconds(ttl.as_millis() as i64);
        self
    }

    /// Install a resolver gate.
    pub fn with_gate(mut self, gate: Arc<dyn ResolverGate>) -> Self {
        self.gate = gate;
        self
    }

    /// Create the pending gate for a transaction already parked in
    /// `AwaitingApproval`. Publishes `approval:created` with a title and
    /// severity derived from the risk band.
    pub async fn create_for(
        &self,
        tx: &crate::model::Transaction,
    ) -> Result<Approval, EngineError> {
        let approval = Approval::for_transaction(tx, self.ttl);
        self.approvals.insert(&approval).await?;

        self.audit
            .append(
                &AuditEntry::ok(
                    "approval",
                    "approval_created",
                    "request",
                    "approval",
                    approval.id,
                )
                .with_metadata(serde_json::json!({
                    "transaction_id": approval.transaction_id,
                    "risk_score": approval.risk_score,
                    "severity": approval.risk_level.severity(),
                    "title": format!("{} risk transaction requires approval", approval.risk_level),
                })),
            )
            .await?;

        self.handle.publish(PipelineEvent::from_payload(
            EventType::ApprovalCreated,
            &approval.event(None),
        ));
        info!(approval_id = %approval.id, transaction_id = %tx.id, risk_level = %approval.risk_level, "approval requested");
        Ok(approval)
    }

    /// Approve: the transaction moves to `Queued` and its broadcast job is
    /// enqueued (job id = transaction id). Approving an already-approved
    /// approval is a no-op returning the existing resolution.
    pub async fn approve(
        &self,
        id: Uuid,
        resolver: &str,
        text: Option<&str>,
    ) -> Result<Approval, EngineError> {
        let existing = self.get(id).await?;
        if !self.gate.can_resolve(resolver, &existing) {
            return Err(EngineError::ResolverDenied(resolver.to_string()));
        }

        let Some(approval) = self
            .approvals
            .resolve(id, ApprovalStatus::Approved, Some(resolver), text)
            .await?
        else {
            // CAS miss: the approval already left Pending.
            let current = self.get(id).await?;
            if current.status == ApprovalStatus::Approved {
                return Ok(current);
            }
            return Err(EngineError::AlreadyResolved {
                id,
                status: current.status.to_string(),
            });
        };

        let queued = self
            .transactions
            .transition(
                approval.transaction_id,
                &[TxStatus::AwaitingApproval],
                TxStatus::Queued,
            )
            .await?;
        match queued {
            Some(tx) => {
                let mut options = QueueName::Transaction.enqueue_options();
                options.job_id = Some(tx.id);
                let payload = serde_json::to_value(TransactionJob {
                    transaction_id: tx.id,
                })
                .map_err(anyhow::Error::from)?;
                self.handle
                    .enqueue(QueueName::Transaction, payload, options)
                    .await?;
            }
            None => {
                warn!(
                    approval_id = %id,
                    transaction_id = %approval.transaction_id,
                    "approved but the transaction was not awaiting approval"
                );
            }
        }

        self.audit
            .append(&AuditEntry::ok(
                "approval",
                "approval_approved",
                "approve",
                "approval",
                id,
            ))
            .await?;
        self.handle.publish(PipelineEvent::from_payload(
            EventType::ApprovalApproved,
            &approval.event(text.map(str::to_string)),
        ));
        info!(approval_id = %id, resolver, "approval granted");
        Ok(approval)
    }

    /// Reject with a mandatory reason: the transaction moves to
    /// `Rejected` and `transaction:failed` carries `Rejected: <reason>`.
    pub async fn reject(
        &self,
        id: Uuid,
        resolver: &str,
        reason: &str,
    ) -> Result<Approval, EngineError> {
        if reason.trim().is_empty() {
            return Err(EngineError::Validation(
                "a rejection reason is required".into(),
            ));
        }
        let existing = self.get(id).await?;
        if !self.gate.can_resolve(resolver, &existing) {
            return Err(EngineError::ResolverDenied(resolver.to_string()));
        }

        let Some(approval) = self
            .approvals
            .resolve(id, ApprovalStatus::Rejected, Some(resolver), Some(reason))
            .await?
        else {
            let current = self.get(id).await?;
            return Err(EngineError::AlreadyResolved {
                id,
                status: current.status.to_string(),
            });
        };

        let failure = format!("Rejected: {reason}");
        if let Some(mut tx) = self
            .transactions
            .transition(
                approval.transaction_id,
                &[TxStatus::AwaitingApproval],
                TxStatus::Rejected,
            )
            .await?
        {
            tx.memo = Some(format!("Error: {failure}"));
            self.transactions.update(&tx).await?;
            self.handle.publish(PipelineEvent::from_payload(
                EventType::TransactionFailed,
                &tx.event(Some(failure.clone())),
            ));
        }

        self.audit
            .append(&AuditEntry::failure(
                "approval",
                "approval_rejected",
                "reject",
                "approval",
                id,
                &failure,
            ))
            .await?;
        self.handle.publish(PipelineEvent::from_payload(
            EventType::ApprovalRejected,
            &approval.event(Some(reason.to_string())),
        ));
        info!(approval_id = %id, resolver, reason, "approval rejected");
        Ok(approval)
    }

    /// Cancel (requester withdrew, or an admin pulled it): the
    /// transaction moves to `Cancelled`.
    pub async fn cancel(&self, id: Uuid) -> Result<Approval, EngineError> {
        let Some(approval) = self
            .approvals
            .resolve(id, ApprovalStatus::Cancelled, None, Some("Cancelled"))
            .await?
        else {
            let current = self.get(id).await?;
            return Err(EngineError::AlreadyResolved {
                id,
                status: current.status.to_string(),
            });
        };

        self.transactions
            .transition(
                approval.transaction_id,
                &[TxStatus::AwaitingApproval],
                TxStatus::Cancelled,
            )
            .await?;

        self.audit
            .append(&AuditEntry::ok(
                "approval",
                "approval_cancelled",
                "cancel",
                "approval",
                id,
            ))
            .await?;
        info!(approval_id = %id, "approval cancelled");
        Ok(approval)
    }

    /// Expire every pending approval past its deadline. Idempotent: a
    /// second run with no intervening change expires nothing. The linked
    /// transactions stay in `AwaitingApproval` for reconciliation.
    pub async fn sweep(&self) -> Result<Vec<Approval>, EngineError> {
        let expired = self.approvals.expire_due(Utc::now()).await?;
        for approval in &expired {
            self.audit
                .append(&AuditEntry::ok(
                    "approval",
                    "approval_expired",
                    "sweep",
                    "approval",
                    approval.id,
                ))
                .await?;
            self.handle.publish(PipelineEvent::from_payload(
                EventType::ApprovalExpired,
                &approval.event(Some("Auto-expired".to_string())),
            ));
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "expired stale approvals");
        }
        Ok(expired)
    }

    /// Pending approvals, guaranteed fresh: the sweep runs first.
    pub async fn list_pending(&self) -> Result<Vec<Approval>, EngineError> {
        self.sweep().await?;
        Ok(self.approvals.list_pending().await?)
    }

    /// Tallies per status.
    pub async fn counts(&self) -> Result<ApprovalCounts, EngineError> {
        Ok(self.approvals.counts().await?)
    }

    /// Fetch an approval or fail with `NotFound`.
    pub async fn get(&self, id: Uuid) -> Result<Approval, EngineError> {
        self.approvals
            .get(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("approval {id}")))
    }

    /// Run the sweep on a fixed interval until cancelled.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // skip the immediate tick
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = service.sweep().await {
                            warn!(error = %e, "approval sweep failed");
                        }
                    }
                }
            }
        })
    }
}
