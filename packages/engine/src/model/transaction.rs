//! Transaction record: one intended on-chain operation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::error::EngineError;
use crate::events::TransactionEvent;
use crate::risk::RiskLevel;

/// Status machine of a transaction.
///
/// `Draft → (AwaitingApproval?) → Queued → Broadcasting → Broadcasted →
/// Confirmed`, with any non-terminal state able to drop to `Failed`,
/// `Rejected`, or `Cancelled`. The chain hash is present iff the
/// transaction reached `Broadcasted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "tx_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    #[default]
    Draft,
    AwaitingApproval,
    Queued,
    Broadcasting,
    Broadcasted,
    Confirmed,
    Failed,
    Rejected,
    Cancelled,
}

impl TxStatus {
    /// Whether the status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TxStatus::Confirmed | TxStatus::Failed | TxStatus::Rejected | TxStatus::Cancelled
        )
    }
}

impl std::fmt::Display for TxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TxStatus::Draft => "draft",
            TxStatus::AwaitingApproval => "awaiting_approval",
            TxStatus::Queued => "queued",
            TxStatus::Broadcasting => "broadcasting",
            TxStatus::Broadcasted => "broadcasted",
            TxStatus::Confirmed => "confirmed",
            TxStatus::Failed => "failed",
            TxStatus::Rejected => "rejected",
            TxStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Check an EVM-style address: `0x` prefix followed by 40 hex characters.
pub fn is_valid_address(address: &str) -> bool {
    address.len() == 42
        && address.starts_with("0x")
        && address[2..].chars().all(|c| c.is_ascii_hexdigit())
}

/// Caller-facing submission input for a single transaction.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct TxSpec {
    pub chain_id: i64,
    pub from_address: String,
    pub to_address: String,
    /// Value in the chain's base unit, as a decimal string.
    #[builder(default = "0".to_string())]
    pub value: String,
    #[builder(default, setter(strip_option))]
    pub data: Option<String>,
    #[builder(default, setter(strip_option))]
    pub gas_limit: Option<i64>,
    #[builder(default, setter(strip_option))]
    pub max_fee_per_gas: Option<String>,
    #[builder(default, setter(strip_option))]
    pub priority_fee_per_gas: Option<String>,
    #[builder(default, setter(strip_option))]
    pub nonce: Option<i64>,
    #[builder(default, setter(strip_option))]
    pub user_id: Option<String>,
    #[builder(default, setter(strip_option))]
    pub agent_id: Option<String>,
    #[builder(default, setter(strip_option))]
    pub plan_id: Option<Uuid>,
    #[builder(default, setter(strip_option))]
    pub step_id: Option<String>,
    #[builder(default = 0.0)]
    pub risk_score: f64,
    #[builder(default = false)]
    pub simulate: bool,
}

/// Persistent record of one intended on-chain operation.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Transaction {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,

    pub chain_id: i64,
    pub from_address: String,
    pub to_address: String,
    #[builder(default = "0".to_string())]
    pub value: String,
    #[builder(default, setter(strip_option))]
    pub data: Option<String>,

    // Gas / fees
    #[builder(default, setter(strip_option))]
    pub gas_limit: Option<i64>,
    #[builder(default, setter(strip_option))]
    pub max_fee_per_gas: Option<String>,
    #[builder(default, setter(strip_option))]
    pub priority_fee_per_gas: Option<String>,
    #[builder(default, setter(strip_option))]
    pub nonce: Option<i64>,

    // Association
    #[builder(default, setter(strip_option))]
    pub user_id: Option<String>,
    #[builder(default, setter(strip_option))]
    pub agent_id: Option<String>,
    #[builder(default, setter(strip_option))]
    pub plan_id: Option<Uuid>,
    #[builder(default, setter(strip_option))]
    pub step_id: Option<String>,

    // Risk
    #[builder(default = 0.0)]
    pub risk_score: f64,
    #[builder(default = RiskLevel::Low)]
    pub risk_level: RiskLevel,
    #[builder(default = false)]
    pub requires_approval: bool,
    #[builder(default = false)]
    pub simulate: bool,

    // State
    #[builder(default)]
    pub status: TxStatus,
    #[builder(default, setter(strip_option))]
    pub hash: Option<String>,

    // Receipt
    #[builder(default, setter(strip_option))]
    pub block_number: Option<i64>,
    #[builder(default, setter(strip_option))]
    pub block_hash: Option<String>,
    #[builder(default, setter(strip_option))]
    pub gas_used: Option<i64>,
    #[builder(default, setter(strip_option))]
    pub confirmed_at: Option<DateTime<Utc>>,

    // Outcome detail
    #[builder(default, setter(strip_option))]
    pub simulation_result: Option<serde_json::Value>,
    #[builder(default, setter(strip_option))]
    pub memo: Option<String>,

    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    /// Build a draft record from a submission, banding the risk score.
    pub fn from_spec(spec: TxSpec) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            chain_id: spec.chain_id,
            from_address: spec.from_address,
            to_address: spec.to_address,
            value: spec.value,
            data: spec.data,
            gas_limit: spec.gas_limit,
            max_fee_per_gas: spec.max_fee_per_gas,
            priority_fee_per_gas: spec.priority_fee_per_gas,
            nonce: spec.nonce,
            user_id: spec.user_id,
            agent_id: spec.agent_id,
            plan_id: spec.plan_id,
            step_id: spec.step_id,
            risk_score: spec.risk_score,
            risk_level: RiskLevel::from_score(spec.risk_score),
            requires_approval: false,
            simulate: spec.simulate,
            status: TxStatus::Draft,
            hash: None,
            block_number: None,
            block_hash: None,
            gas_used: None,
            confirmed_at: None,
            simulation_result: None,
            memo: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Structural validation ahead of any chain interaction.
    pub fn validate(&self) -> Result<(), EngineError> {
        if !is_valid_address(&self.from_address) {
            return Err(EngineError::Validation(format!(
                "malformed sender address: {}",
                self.from_address
            )));
        }
        if !is_valid_address(&self.to_address) {
            return Err(EngineError::Validation(format!(
                "malformed recipient address: {}",
                self.to_address
            )));
        }
        if self.chain_id <= 0 {
            return Err(EngineError::Validation(format!(
                "invalid chain id: {}",
                self.chain_id
            )));
        }
        if self.value.is_empty() || !self.value.chars().all(|c| c.is_ascii_digit()) {
            return Err(EngineError::Validation(format!(
                "invalid value: {:?}",
                self.value
            )));
        }
        Ok(())
    }

    /// Event payload snapshot of this record.
    pub fn event(&self, error: Option<String>) -> TransactionEvent {
        TransactionEvent {
            transaction_id: self.id,
            chain_id: self.chain_id,
            hash: self.hash.clone(),
            block_number: self.block_number,
            gas_used: self.gas_used,
            user_id: self.user_id.clone(),
            agent_id: self.agent_id.clone(),
            plan_id: self.plan_id,
            error,
        }
    }

    /// Record a failure: terminal status plus the memo convention.
    pub fn mark_failed(&mut self, status: TxStatus, error: &str) {
        self.status = status;
        self.memo = Some(format!("Error: {error}"));
        self.updated_at = Utc::now();
    }
}
