//! Storage contracts for the persistent records.
//!
//! The pipeline mutates records only through these traits. Status moves
//! that enforce ownership (approval resolution, the approval machine's
//! transaction transitions) are compare-and-set: the store applies the
//! update only if the current status matches, and reports a miss instead
//! of clobbering.
//!
//! Two implementations ship: [`postgres::PostgresStores`] for production
//! and [`memory::MemoryStores`] for tests and embedded use.

pub mod memory;
pub mod postgres;

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::model::{Approval, ApprovalStatus, AuditEntry, Transaction, TxStatus};

pub use memory::MemoryStores;
pub use postgres::PostgresStores;

/// Approval tallies per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ApprovalCounts {
    pub pending: usize,
    pub approved: usize,
    pub rejected: usize,
    pub expired: usize,
    pub cancelled: usize,
}

/// Persistence for [`Transaction`] records.
#[async_trait::async_trait]
pub trait TransactionStore: Send + Sync {
    /// Insert a new record.
    async fn insert(&self, tx: &Transaction) -> Result<()>;

    /// Fetch by internal id.
    async fn get(&self, id: Uuid) -> Result<Option<Transaction>>;

    /// Persist the whole row. The caller owns the record (job lease or
    /// approval-machine discipline).
    async fn update(&self, tx: &Transaction) -> Result<()>;

    /// Compare-and-set status move: applies `to` only while the current
    /// status is one of `from`. Returns the updated row, or `None` on a
    /// CAS miss.
    async fn transition(
        &self,
        id: Uuid,
        from: &[TxStatus],
        to: TxStatus,
    ) -> Result<Option<Transaction>>;

    /// All transactions belonging to a plan.
    async fn find_by_plan(&self, plan_id: Uuid) -> Result<Vec<Transaction>>;
}

/// Persistence for [`Approval`] records.
#[async_trait::async_trait]
pub trait ApprovalStore: Send + Sync {
    /// Insert a new pending approval.
    async fn insert(&self, approval: &Approval) -> Result<()>;

    /// Fetch by id.
    async fn get(&self, id: Uuid) -> Result<Option<Approval>>;

    /// Fetch the approval linked to a transaction.
    async fn find_by_transaction(&self, transaction_id: Uuid) -> Result<Option<Approval>>;

    /// Compare-and-set resolution: moves `Pending → to` and stamps the
    /// resolver fields. Returns the updated row, or `None` if the approval
    /// had already left `Pending`.
    async fn resolve(
        &self,
        id: Uuid,
        to: ApprovalStatus,
        resolved_by: Option<&str>,
        resolution: Option<&str>,
    ) -> Result<Option<Approval>>;

    /// Expire every pending approval whose deadline has passed, stamping
    /// `resolution = "Auto-expired"`. Returns the rows that changed; a
    /// second run with no intervening change returns nothing.
    async fn expire_due(&self, now: DateTime<Utc>) -> Result<Vec<Approval>>;

    /// All pending approvals. Callers sweep first (see
    /// [`crate::approvals::ApprovalService::list_pending`]).
    async fn list_pending(&self) -> Result<Vec<Approval>>;

    /// Tallies per status.
    async fn counts(&self) -> Result<ApprovalCounts>;
}

/// Append-only audit trail.
#[async_trait::async_trait]
pub trait AuditStore: Send + Sync {
    /// Append one entry.
    async fn append(&self, entry: &AuditEntry) -> Result<()>;

    /// Most recent entries, newest first.
    async fn recent(&self, limit: i64) -> Result<Vec<AuditEntry>>;
}

/// Shared handles, the shape the workers take.
pub type SharedTransactionStore = Arc<dyn TransactionStore>;
pub type SharedApprovalStore = Arc<dyn ApprovalStore>;
pub type SharedAuditStore = Arc<dyn AuditStore>;
