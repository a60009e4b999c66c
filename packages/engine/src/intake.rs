//! Transaction intake: the risk gate and routing every submission
//! passes through, whether it arrives alone or as a plan step.
//!
//! Routing:
//! - score strictly above the hard ceiling → persisted as `Rejected`,
//!   never enqueued, surfaced to the caller as an error
//! - score at/above the approval threshold → `AwaitingApproval` plus a
//!   pending approval record
//! - otherwise → `Queued` and the broadcast job enqueued (job id =
//!   transaction id)
//!
//! `transaction:pending` is published for every admitted submission.

use std::sync::Arc;

use tracing::info;

use crate::approvals::ApprovalService;
use crate::coordinator::{CoordinatorHandle, QueueName};
use crate::error::EngineError;
use crate::events::{EventType, PipelineEvent};
use crate::model::{AuditEntry, Transaction, TxSpec, TxStatus};
use crate::risk::RiskPolicy;
use crate::storage::{SharedAuditStore, SharedTransactionStore};
use crate::workers::TransactionJob;

/// The single admission path for transactions.
pub struct TransactionIntake {
    transactions: SharedTransactionStore,
    audit: SharedAuditStore,
    approvals: Arc<ApprovalService>,
    handle: CoordinatorHandle,
    policy: RiskPolicy,
}

impl TransactionIntake {
    pub fn new(
        transactions: SharedTransactionStore,
        audit: SharedAuditStore,
        approvals: Arc<ApprovalService>,
        handle: CoordinatorHandle,
        policy: RiskPolicy,
    ) -> Self {
        Self {
            transactions,
            audit,
            approvals,
            handle,
            policy,
        }
    }

    /// Admit one submission. Returns the persisted record; the error path
    /// covers only what happens before enqueue (validation, risk block).
    /// Everything after is asynchronous.
    pub async fn submit(&self, spec: TxSpec) -> Result<Transaction, EngineError> {
        let mut tx = Transaction::from_spec(spec);
        tx.validate()?;

        if self.policy.blocked(tx.risk_score) {
            let reason = format!(
                "risk score {:.2} exceeds the maximum allowed {:.2}",
                tx.risk_score, self.policy.max_risk_score
            );
            tx.mark_failed(TxStatus::Rejected, &reason);
            self.transactions.insert(&tx).await?;
            self.audit
                .append(&AuditEntry::failure(
                    "transaction",
                    "tx_blocked",
                    "submit",
                    "transaction",
                    tx.id,
                    &reason,
                ))
                .await?;
            self.handle.publish(PipelineEvent::from_payload(
                EventType::TransactionFailed,
                &tx.event(Some(reason)),
            ));
            return Err(EngineError::RiskBlocked {
                score: tx.risk_score,
                max: self.policy.max_risk_score,
            });
        }

        tx.requires_approval = self.policy.requires_approval(tx.risk_score);
        tx.status = if tx.requires_approval {
            TxStatus::AwaitingApproval
        } else {
            TxStatus::Queued
        };
        self.transactions.insert(&tx).await?;
        self.audit
            .append(&AuditEntry::ok(
                "transaction",
                "tx_accepted",
                "submit",
                "transaction",
                tx.id,
            ))
            .await?;
        // Published before the broadcast job exists so observers always
        // see pending ahead of submitted.
        self.handle.publish(PipelineEvent::from_payload(
            EventType::TransactionPending,
            &tx.event(None),
        ));

        if tx.requires_approval {
            self.approvals.create_for(&tx).await?;
            info!(transaction_id = %tx.id, risk_score = tx.risk_score, "transaction awaiting approval");
        } else {
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
        Ok(tx)
    }
}
