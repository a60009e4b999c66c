//! In-memory store set for tests and embedded pipelines.
//!
//! Mutexed maps with the same CAS semantics as the Postgres
//! implementation. Locks are never held across an await point.

use std::collections::HashMap;

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::model::{Approval, ApprovalStatus, AuditEntry, Transaction, TxStatus};

use super::{ApprovalCounts, ApprovalStore, AuditStore, TransactionStore};

/// One struct implementing all three store traits.
#[derive(Default)]
pub struct MemoryStores {
    transactions: Mutex<HashMap<Uuid, Transaction>>,
    approvals: Mutex<HashMap<Uuid, Approval>>,
    audit: Mutex<Vec<AuditEntry>>,
}

impl MemoryStores {
    /// Empty stores.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every transaction. Test helper.
    pub fn transactions(&self) -> Vec<Transaction> {
        self.transactions.lock().values().cloned().collect()
    }

    /// Snapshot of every audit entry, oldest first. Test helper.
    pub fn audit_entries(&self) -> Vec<AuditEntry> {
        self.audit.lock().clone()
    }
}

#[async_trait::async_trait]
impl TransactionStore for MemoryStores {
    async fn insert(&self, tx: &Transaction) -> Result<()> {
        self.transactions.lock().insert(tx.id, tx.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Transaction>> {
        Ok(self.transactions.lock().get(&id).cloned())
    }

    async fn update(&self, tx: &Transaction) -> Result<()> {
        let mut map = self.transactions.lock();
        let mut updated = tx.clone();
        updated.updated_at = Utc::now();
        map.insert(tx.id, updated);
        Ok(())
    }

    async fn transition(
        &self,
        id: Uuid,
        from: &[TxStatus],
        to: TxStatus,
    ) -> Result<Option<Transaction>> {
        let mut map = self.transactions.lock();
        let Some(tx) = map.get_mut(&id) else {
            return Ok(None);
        };
        if !from.contains(&tx.status) {
            return Ok(None);
        }
        tx.status = to;
        tx.updated_at = Utc::now();
        Ok(Some(tx.clone()))
    }

    async fn find_by_plan(&self, plan_id: Uuid) -> Result<Vec<Transaction>> {
        Ok(self
            .transactions
            .lock()
            .values()
            .filter(|t| t.plan_id == Some(plan_id))
            .cloned()
            .collect())
    }
}

#[async_trait::async_trait]
impl ApprovalStore for MemoryStores {
    async fn insert(&self, approval: &Approval) -> Result<()> {
        self.approvals.lock().insert(approval.id, approval.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Approval>> {
        Ok(self.approvals.lock().get(&id).cloned())
    }

    async fn find_by_transaction(&self, transaction_id: Uuid) -> Result<Option<Approval>> {
        Ok(self
            .approvals
            .lock()
            .values()
            .find(|a| a.transaction_id == transaction_id)
            .cloned())
    }

    async fn resolve(
        &self,
        id: Uuid,
        to: ApprovalStatus,
        resolved_by: Option<&str>,
        resolution: Option<&str>,
    ) -> Result<Option<Approval>> {
        let mut map = self.approvals.lock();
        let Some(approval) = map.get_mut(&id) else {
            return Ok(None);
        };
        if approval.status != ApprovalStatus::Pending {
            return Ok(None);
        }
        approval.status = to;
        approval.resolved_at = Some(Utc::now());
        approval.resolved_by = resolved_by.map(str::to_string);
        approval.resolution = resolution.map(str::to_string);
        approval.updated_at = Utc::now();
        Ok(Some(approval.clone()))
    }

    async fn expire_due(&self, now: DateTime<Utc>) -> Result<Vec<Approval>> {
        let mut map = self.approvals.lock();
        let mut expired = Vec::new();
        for approval in map.values_mut() {
            if approval.is_expired(now) {
                approval.status = ApprovalStatus::Expired;
                approval.resolved_at = Some(now);
                approval.resolution = Some("Auto-expired".to_string());
                approval.updated_at = now;
                expired.push(approval.clone());
            }
        }
        Ok(expired)
    }

    async fn list_pending(&self) -> Result<Vec<Approval>> {
        let mut pending: Vec<Approval> = self
            .approvals
            .lock()
            .values()
            .filter(|a| a.status == ApprovalStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|a| a.requested_at);
        Ok(pending)
    }

    async fn counts(&self) -> Result<ApprovalCounts> {
        let mut counts = ApprovalCounts::default();
        for approval in self.approvals.lock().values() {
            match approval.status {
                ApprovalStatus::Pending => counts.pending += 1,
                ApprovalStatus::Approved => counts.approved += 1,
                ApprovalStatus::Rejected => counts.rejected += 1,
                ApprovalStatus::Expired => counts.expired += 1,
                ApprovalStatus::Cancelled => counts.cancelled += 1,
            }
        }
        Ok(counts)
    }
}

#[async_trait::async_trait]
impl AuditStore for MemoryStores {
    async fn append(&self, entry: &AuditEntry) -> Result<()> {
        self.audit.lock().push(entry.clone());
        Ok(())
    }

    async fn recent(&self, limit: i64) -> Result<Vec<AuditEntry>> {
        let audit = self.audit.lock();
        Ok(audit.iter().rev().take(limit as usize).cloned().collect())
    }
}
