//! Approval record: a human (or policy) gate on a transaction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::events::ApprovalEvent;
use crate::risk::{ApprovalPriority, RiskLevel};

use super::transaction::Transaction;

/// Approval lifecycle. Transitions leave `Pending` exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "approval_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
    Expired,
    Cancelled,
}

impl ApprovalStatus {
    /// Whether the status is a resolution (anything but `Pending`).
    pub fn is_resolved(&self) -> bool {
        !matches!(self, ApprovalStatus::Pending)
    }
}

impl std::fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
            ApprovalStatus::Expired => "expired",
            ApprovalStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Gate record, 1:1 with a transaction.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Approval {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,
    pub transaction_id: Uuid,

    pub risk_score: f64,
    pub risk_level: RiskLevel,
    pub priority: ApprovalPriority,

    #[builder(default)]
    pub status: ApprovalStatus,

    #[builder(default = Utc::now())]
    pub requested_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[builder(default, setter(strip_option))]
    pub resolved_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub resolved_by: Option<String>,
    #[builder(default, setter(strip_option))]
    pub resolution: Option<String>,

    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

impl Approval {
    /// Create the pending gate for a transaction, expiring after `ttl`.
    pub fn for_transaction(tx: &Transaction, ttl: chrono::Duration) -> Self {
        let now = Utc::now();
        Approval::builder()
            .transaction_id(tx.id)
            .risk_score(tx.risk_score)
            .risk_level(tx.risk_level)
            .priority(ApprovalPriority::from(tx.risk_level))
            .requested_at(now)
            .expires_at(now + ttl)
            .build()
    }

    /// Whether the gate is past its deadline while still pending.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == ApprovalStatus::Pending && self.expires_at <= now
    }

    /// Event payload snapshot of this record.
    pub fn event(&self, reason: Option<String>) -> ApprovalEvent {
        ApprovalEvent {
            approval_id: self.id,
            transaction_id: self.transaction_id,
            risk_score: self.risk_score,
            risk_level: self.risk_level,
            priority: self.priority,
            expires_at: self.expires_at,
            resolver: self.resolved_by.clone(),
            reason,
        }
    }
}
