//! Simulation worker: read-only dry-runs with gas and balance analysis.
//!
//! Never mutates on-chain state. A revert is a result, not a job error:
//! the outcome is persisted with `success = false` and the job acks.

use std::sync::Arc;

use conveyor::LeasedJob;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::chain::{ChainRegistry, SimulationOutcome};
use crate::coordinator::{JobContext, JobProcessor};
use crate::error::EngineError;
use crate::events::{AlertEvent, EventType, PipelineEvent};
use crate::storage::SharedTransactionStore;

use super::{decode_payload, SimulationJob};

/// Warn when simulated gas passes this share of the limit.
const GAS_HEADROOM_WARN_RATIO: f64 = 0.9;

/// Warn when a simulated native-asset outflow exceeds this (wei).
const LARGE_OUTFLOW_WEI: i128 = 1_000_000_000_000_000_000; // 1 unit

/// The persisted analysis: the raw outcome plus derived warnings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationReport {
    pub outcome: SimulationOutcome,
    pub warnings: Vec<String>,
}

/// The dry-run processor.
pub struct SimulationWorker {
    transactions: SharedTransactionStore,
    chains: Arc<ChainRegistry>,
}

impl SimulationWorker {
    pub fn new(transactions: SharedTransactionStore, chains: Arc<ChainRegistry>) -> Self {
        Self {
            transactions,
            chains,
        }
    }

    /// Derive warnings from an outcome against the transaction's limits.
    fn analyze(outcome: &SimulationOutcome, gas_limit: Option<i64>) -> Vec<String> {
        let mut warnings = Vec::new();

        if let Some(limit) = gas_limit {
            if limit > 0 && outcome.gas_used as f64 > limit as f64 * GAS_HEADROOM_WARN_RATIO {
                warnings.push(format!(
                    "gas usage {} is over {}% of the {} limit",
                    outcome.gas_used,
                    (GAS_HEADROOM_WARN_RATIO * 100.0) as u32,
                    limit
                ));
            }
        }

        for change in &outcome.balance_changes {
            if change.token.is_some() {
                continue;
            }
            if let Ok(delta) = change.delta.parse::<i128>() {
                if delta < -LARGE_OUTFLOW_WEI {
                    warnings.push(format!(
                        "unusually large balance change for {}: {}",
                        change.address, change.delta
                    ));
                }
            }
        }

        warnings
    }
}

#[async_trait::async_trait]
impl JobProcessor for SimulationWorker {
    async fn process(&self, job: LeasedJob, ctx: JobContext) -> Result<(), EngineError> {
        let payload: SimulationJob = decode_payload(&job)?;
        let mut tx = self
            .transactions
            .get(payload.transaction_id)
            .await?
            .ok_or_else(|| {
                EngineError::NotFound(format!("transaction {}", payload.transaction_id))
            })?;

        ctx.progress(10);
        let adapter = self.chains.get(tx.chain_id)?;

        // Adapter-level failure (node unreachable) is a job error; a
        // revert comes back as a result.
        let outcome = adapter
            .simulate(&tx, payload.block)
            .await
            .map_err(|e| EngineError::Transient(format!("simulation call failed: {e}")))?;
        ctx.progress(70);

        let warnings = Self::analyze(&outcome, tx.gas_limit);
        let report = SimulationReport { outcome, warnings };

        tx.simulation_result =
            Some(serde_json::to_value(&report).unwrap_or(serde_json::Value::Null));
        self.transactions.update(&tx).await?;

        for warning in &report.warnings {
            ctx.events().publish(PipelineEvent::from_payload(
                EventType::SystemAlert,
                &AlertEvent {
                    severity: "warning".to_string(),
                    title: "simulation warning".to_string(),
                    message: warning.clone(),
                    context: serde_json::json!({ "transaction_id": tx.id }),
                },
            ));
        }

        if report.outcome.success {
            debug!(transaction_id = %tx.id, gas_used = report.outcome.gas_used, "simulation succeeded");
        } else {
            info!(
                transaction_id = %tx.id,
                revert_reason = report.outcome.revert_reason.as_deref().unwrap_or("unknown"),
                "simulation reverted"
            );
        }
        ctx.progress(100);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::BalanceChange;

    fn outcome(gas_used: i64) -> SimulationOutcome {
        SimulationOutcome {
            success: true,
            gas_used,
            return_value: None,
            revert_reason: None,
            balance_changes: vec![],
            logs: vec![],
        }
    }

    #[test]
    fn warns_when_gas_is_tight() {
        let warnings = SimulationWorker::analyze(&outcome(95_000), Some(100_000));
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("gas usage"));
    }

    #[test]
    fn quiet_when_gas_has_headroom() {
        let warnings = SimulationWorker::analyze(&outcome(50_000), Some(100_000));
        assert!(warnings.is_empty());
    }

    #[test]
    fn no_gas_warning_without_a_limit() {
        let warnings = SimulationWorker::analyze(&outcome(1_000_000), None);
        assert!(warnings.is_empty());
    }

    #[test]
    fn warns_on_large_native_outflow() {
        let mut o = outcome(10_000);
        o.balance_changes.push(BalanceChange {
            address: "0xAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA".into(),
            token: None,
            delta: "-2000000000000000000".into(),
        });
        let warnings = SimulationWorker::analyze(&o, None);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("balance change"));
    }

    #[test]
    fn token_deltas_are_not_flagged_as_native_outflow() {
        let mut o = outcome(10_000);
        o.balance_changes.push(BalanceChange {
            address: "0xAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA".into(),
            token: Some("0xCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCC".into()),
            delta: "-9000000000000000000".into(),
        });
        assert!(SimulationWorker::analyze(&o, None).is_empty());
    }
}
