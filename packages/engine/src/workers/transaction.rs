//! Transaction broadcast worker.
//!
//! One job processes one transaction end to end:
//!
//! 1. validate (0–10%): malformed addresses and missing fields are fatal
//! 2. resolve the chain adapter (10–20%): unregistered chain is fatal
//! 3. simulate when requested (20–40%): a revert persists the result,
//!    marks the transaction failed, and is fatal
//! 4. estimate gas when the caller supplied none (40–50%)
//! 5. build and sign (50–70%)
//! 6. persist `Broadcasting` *before* any network I/O (70%) so a crash
//!    is recoverable
//! 7. broadcast with bounded retry (70–80%): only the known transient
//!    classes retry, on exponential backoff
//! 8. poll for the receipt up to a hard ceiling (80–100%): a timeout is
//!    fatal for the job; reconciliation is a separate concern
//! 9. persist the outcome and mirror it onto the bus
//!
//! Exactly one broadcast job is live per transaction: the job id is the
//! transaction id, and only `Queued` (or crash-recovered `Broadcasting`)
//! records are picked up.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use conveyor::LeasedJob;
use tracing::{debug, info, warn};

use crate::chain::{ChainAdapter, ChainRegistry, Receipt, ReceiptStatus, SignedTx};
use crate::coordinator::{JobContext, JobProcessor};
use crate::error::{classify_broadcast_error, EngineError};
use crate::events::{EventType, PipelineEvent};
use crate::model::{AuditEntry, Transaction, TxStatus};
use crate::storage::{SharedAuditStore, SharedTransactionStore};

use super::{decode_payload, TransactionJob};

/// The broadcast pipeline processor.
pub struct TransactionWorker {
    transactions: SharedTransactionStore,
    audit: SharedAuditStore,
    chains: Arc<ChainRegistry>,
    confirm_timeout: Duration,
    confirm_interval: Duration,
    broadcast_attempts: u32,
    broadcast_backoff: Duration,
}

impl TransactionWorker {
    /// Worker with the default policy: 3 broadcast attempts on a 2 s
    /// exponential backoff, receipts polled every 3 s for up to 2 minutes.
    pub fn new(
        transactions: SharedTransactionStore,
        audit: SharedAuditStore,
        chains: Arc<ChainRegistry>,
    ) -> Self {
        Self {
            transactions,
            audit,
            chains,
            confirm_timeout: Duration::from_secs(120),
            confirm_interval: Duration::from_secs(3),
            broadcast_attempts: 3,
            broadcast_backoff: Duration::from_secs(2),
        }
    }

    /// Override the confirmation ceiling and poll interval.
    pub fn with_confirmation(mut self, timeout: Duration, interval: Duration) -> Self {
        self.confirm_timeout = timeout;
        self.confirm_interval = interval;
        self
    }

    /// Override the broadcast retry budget and backoff base.
    pub fn with_broadcast_retry(mut self, attempts: u32, backoff_base: Duration) -> Self {
        self.broadcast_attempts = attempts.max(1);
        self.broadcast_backoff = backoff_base;
        self
    }

    async fn run_pipeline(
        &self,
        tx: &mut Transaction,
        ctx: &JobContext,
    ) -> Result<(), EngineError> {
        // 1. Validate.
        ctx.progress(0);
        tx.validate()?;
        ctx.progress(10);

        // 2. Resolve the adapter.
        let adapter = self.chains.get(tx.chain_id)?;
        ctx.progress(20);

        // 3. Simulate when requested. The result is persisted either way.
        if tx.simulate {
            let outcome = adapter
                .simulate(tx, None)
                .await
                .map_err(|e| EngineError::SimulationFailed(e.to_string()))?;
            tx.simulation_result =
                Some(serde_json::to_value(&outcome).unwrap_or(serde_json::Value::Null));
            self.transactions.update(tx).await?;
            if !outcome.success {
                let reason = outcome
                    .revert_reason
                    .unwrap_or_else(|| "simulation reverted".to_string());
                return Err(EngineError::SimulationFailed(reason));
            }
        }
        ctx.progress(40);

        // 4. Estimate gas when the caller did not pin it.
        if tx.gas_limit.is_none() {
            let estimate = adapter
                .estimate_gas(tx)
                .await
                .map_err(|e| EngineError::SimulationFailed(format!("gas estimation: {e}")))?;
            tx.gas_limit = Some(estimate.gas_limit);
            if tx.max_fee_per_gas.is_none() {
                tx.max_fee_per_gas = Some(estimate.gas_price);
            }
        }
        ctx.progress(50);

        // 5. Build and sign.
        let unsigned = adapter
            .build(tx)
            .await
            .map_err(|e| EngineError::BroadcastRejected(format!("build failed: {e}")))?;
        ctx.progress(60);
        let signed = adapter
            .sign(&unsigned)
            .await
            .map_err(|e| EngineError::BroadcastRejected(format!("signing failed: {e}")))?;
        ctx.progress(70);

        // 6. Persist the status move before touching the network.
        tx.status = TxStatus::Broadcasting;
        self.transactions.update(tx).await?;

        // 7. Broadcast with bounded retry.
        let hash = self.broadcast_with_retry(adapter.as_ref(), &signed, ctx).await?;
        tx.hash = Some(hash.clone());
        tx.status = TxStatus::Broadcasted;
        self.transactions.update(tx).await?;
        self.audit
            .append(
                &AuditEntry::ok("transaction", "tx_submitted", "broadcast", "transaction", tx.id)
                    .with_metadata(serde_json::json!({ "hash": hash })),
            )
            .await?;
        ctx.events().publish(PipelineEvent::from_payload(
            EventType::TransactionSubmitted,
            &tx.event(None),
        ));
        info!(transaction_id = %tx.id, hash = %hash, "transaction broadcast");
        ctx.progress(80);

        // 8. Await confirmation.
        let receipt = self.await_receipt(adapter.as_ref(), &hash, ctx).await?;
        tx.block_number = Some(receipt.block_number);
        tx.block_hash = Some(receipt.block_hash.clone());
        tx.gas_used = Some(receipt.gas_used);
        tx.confirmed_at = Some(Utc::now());

        if receipt.status == ReceiptStatus::Reverted {
            return Err(EngineError::BroadcastRejected(
                "transaction reverted on-chain".to_string(),
            ));
        }

        // 9. Persist and publish the success.
        tx.status = TxStatus::Confirmed;
        self.transactions.update(tx).await?;
        self.audit
            .append(
                &AuditEntry::ok("transaction", "tx_confirmed", "confirm", "transaction", tx.id)
                    .with_metadata(serde_json::json!({
                        "block_number": receipt.block_number,
                        "gas_used": receipt.gas_used,
                    })),
            )
            .await?;
        ctx.events().publish(PipelineEvent::from_payload(
            EventType::TransactionConfirmed,
            &tx.event(None),
        ));
        info!(transaction_id = %tx.id, block = receipt.block_number, "transaction confirmed");
        ctx.progress(100);
        Ok(())
    }

    async fn broadcast_with_retry(
        &self,
        adapter: &dyn ChainAdapter,
        signed: &SignedTx,
        ctx: &JobContext,
    ) -> Result<String, EngineError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if ctx.cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            match adapter.broadcast(signed).await {
                Ok(hash) => return Ok(hash),
                Err(e) => {
                    let classified = classify_broadcast_error(&e.to_string());
                    if !classified.is_retryable() || attempt >= self.broadcast_attempts {
                        return Err(classified);
                    }
                    let delay = self.broadcast_backoff * 2u32.saturating_pow(attempt - 1);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %classified,
                        "broadcast attempt failed, backing off"
                    );
                    tokio::select! {
                        _ = ctx.cancel.cancelled() => return Err(EngineError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn await_receipt(
        &self,
        adapter: &dyn ChainAdapter,
        hash: &str,
        ctx: &JobContext,
    ) -> Result<Receipt, EngineError> {
        let deadline = tokio::time::Instant::now() + self.confirm_timeout;
        loop {
            if ctx.cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            match adapter.get_receipt(hash).await {
                Ok(Some(receipt)) => return Ok(receipt),
                Ok(None) => {}
                // Poll errors are absorbed; the deadline bounds them.
                Err(e) => debug!(hash = %hash, error = %e, "receipt poll failed"),
            }
            if tokio::time::Instant::now() + self.confirm_interval > deadline {
                return Err(EngineError::ConfirmationTimeout(
                    self.confirm_timeout.as_secs(),
                ));
            }
            tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(EngineError::Cancelled),
                _ = tokio::time::sleep(self.confirm_interval) => {}
            }
        }
    }

    /// Persist a fatal outcome and mirror it; retryable errors pass
    /// through untouched so the queue retries against current state.
    async fn handle_failure(
        &self,
        mut tx: Transaction,
        err: EngineError,
        ctx: &JobContext,
    ) -> Result<(), EngineError> {
        if err.is_retryable() || matches!(err, EngineError::Cancelled) {
            return Err(err);
        }

        tx.mark_failed(TxStatus::Failed, &err.to_string());
        self.transactions.update(&tx).await?;
        self.audit
            .append(&AuditEntry::failure(
                "transaction",
                "tx_failed",
                "broadcast",
                "transaction",
                tx.id,
                &err.to_string(),
            ))
            .await?;
        ctx.events().publish(PipelineEvent::from_payload(
            EventType::TransactionFailed,
            &tx.event(Some(err.to_string())),
        ));
        warn!(transaction_id = %tx.id, error = %err, "transaction failed");
        Err(err)
    }
}

#[async_trait::async_trait]
impl JobProcessor for TransactionWorker {
    async fn process(&self, job: LeasedJob, ctx: JobContext) -> Result<(), EngineError> {
        let payload: TransactionJob = decode_payload(&job)?;
        let mut tx = self
            .transactions
            .get(payload.transaction_id)
            .await?
            .ok_or_else(|| {
                EngineError::NotFound(format!("transaction {}", payload.transaction_id))
            })?;

        // Eligibility guard. `Broadcasting` is picked back up after a
        // crash mid-broadcast; anything else means the record moved on.
        match tx.status {
            TxStatus::Queued | TxStatus::Broadcasting => {}
            status if status.is_terminal() => {
                debug!(transaction_id = %tx.id, status = %status, "skipping settled transaction");
                return Ok(());
            }
            status => {
                debug!(transaction_id = %tx.id, status = %status, "transaction not eligible for broadcast");
                return Ok(());
            }
        }

        match self.run_pipeline(&mut tx, &ctx).await {
            Ok(()) => Ok(()),
            Err(err) => self.handle_failure(tx, err, &ctx).await,
        }
    }
}
