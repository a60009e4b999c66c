//! The adapter contract for one blockchain.
//!
//! Adapters are infrastructure only: gas estimation, payload building,
//! signing, broadcast, receipts, and dry-runs. All policy (retry budgets,
//! confirmation ceilings, risk) lives in the workers. Errors are plain
//! `anyhow::Error`; the broadcast path classifies them by message (see
//! [`crate::error::classify_broadcast_error`]) because RPC nodes encode
//! the interesting cases in free text.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::model::Transaction;

/// Gas estimation result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GasEstimate {
    pub gas_limit: i64,
    /// Legacy gas price or max fee, as a decimal string in the chain's
    /// smallest unit.
    pub gas_price: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_fee: Option<String>,
}

/// A built but unsigned transaction payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnsignedTx {
    /// Chain-specific encoding, hex.
    pub raw: String,
}

/// A signed payload ready for broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedTx {
    /// Chain-specific encoding, hex.
    pub raw: String,
}

/// Inclusion outcome reported by a receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptStatus {
    Success,
    Reverted,
}

/// A confirmed receipt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Receipt {
    pub block_number: i64,
    pub block_hash: String,
    pub gas_used: i64,
    pub status: ReceiptStatus,
}

/// A balance delta observed during simulation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceChange {
    pub address: String,
    /// `None` for the native asset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Signed decimal string.
    pub delta: String,
}

/// Result of a dry-run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationOutcome {
    pub success: bool,
    pub gas_used: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub return_value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revert_reason: Option<String>,
    #[serde(default)]
    pub balance_changes: Vec<BalanceChange>,
    #[serde(default)]
    pub logs: Vec<serde_json::Value>,
}

/// Uniform access to one blockchain.
#[async_trait::async_trait]
pub trait ChainAdapter: Send + Sync {
    /// The chain this adapter serves.
    fn chain_id(&self) -> i64;

    /// Estimate gas for the transaction as specified.
    async fn estimate_gas(&self, tx: &Transaction) -> Result<GasEstimate>;

    /// Build the chain-specific payload.
    async fn build(&self, tx: &Transaction) -> Result<UnsignedTx>;

    /// Sign a built payload.
    async fn sign(&self, tx: &UnsignedTx) -> Result<SignedTx>;

    /// Submit a signed payload. Returns the chain hash.
    async fn broadcast(&self, tx: &SignedTx) -> Result<String>;

    /// Fetch the receipt for a hash; `None` while not yet included.
    async fn get_receipt(&self, hash: &str) -> Result<Option<Receipt>>;

    /// Dry-run the transaction against the given block (latest if `None`).
    async fn simulate(&self, tx: &Transaction, block: Option<i64>) -> Result<SimulationOutcome>;
}
