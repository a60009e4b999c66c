//! PostgreSQL implementation of the store traits.
//!
//! Hand-written SQL; status moves that enforce ownership are
//! compare-and-set `UPDATE … WHERE status` so concurrent writers cannot
//! clobber a resolution.
//!
//! # Database schema
//!
//! ```sql
//! CREATE TYPE tx_status AS ENUM (
//!     'draft', 'awaiting_approval', 'queued', 'broadcasting',
//!     'broadcasted', 'confirmed', 'failed', 'rejected', 'cancelled');
//! CREATE TYPE approval_status AS ENUM (
//!     'pending', 'approved', 'rejected', 'expired', 'cancelled');
//! CREATE TYPE risk_level AS ENUM ('low', 'medium', 'high', 'critical');
//! CREATE TYPE approval_priority AS ENUM ('low', 'normal', 'high', 'urgent');
//!
//! CREATE TABLE transactions (
//!     id UUID PRIMARY KEY,
//!     chain_id BIGINT NOT NULL,
//!     from_address TEXT NOT NULL,
//!     to_address TEXT NOT NULL,
//!     value TEXT NOT NULL,
//!     data TEXT,
//!     gas_limit BIGINT,
//!     max_fee_per_gas TEXT,
//!     priority_fee_per_gas TEXT,
//!     nonce BIGINT,
//!     user_id TEXT,
//!     agent_id TEXT,
//!     plan_id UUID,
//!     step_id TEXT,
//!     risk_score DOUBLE PRECISION NOT NULL DEFAULT 0,
//!     risk_level risk_level NOT NULL DEFAULT 'low',
//!     requires_approval BOOLEAN NOT NULL DEFAULT FALSE,
//!     simulate BOOLEAN NOT NULL DEFAULT FALSE,
//!     status tx_status NOT NULL DEFAULT 'draft',
//!     hash TEXT UNIQUE,
//!     block_number BIGINT,
//!     block_hash TEXT,
//!     gas_used BIGINT,
//!     confirmed_at TIMESTAMPTZ,
//!     simulation_result JSONB,
//!     memo TEXT,
//!     created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
//! );
//! CREATE INDEX idx_transactions_plan ON transactions (plan_id)
//!     WHERE plan_id IS NOT NULL;
//!
//! CREATE TABLE approvals (
//!     id UUID PRIMARY KEY,
//!     transaction_id UUID NOT NULL UNIQUE REFERENCES transactions (id),
//!     risk_score DOUBLE PRECISION NOT NULL,
//!     risk_level risk_level NOT NULL,
//!     priority approval_priority NOT NULL,
//!     status approval_status NOT NULL DEFAULT 'pending',
//!     requested_at TIMESTAMPTZ NOT NULL,
//!     expires_at TIMESTAMPTZ NOT NULL,
//!     resolved_at TIMESTAMPTZ,
//!     resolved_by TEXT,
//!     resolution TEXT,
//!     created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
//! );
//! CREATE INDEX idx_approvals_pending ON approvals (expires_at)
//!     WHERE status = 'pending';
//!
//! CREATE TABLE audit_log (
//!     id UUID PRIMARY KEY,
//!     event_type TEXT NOT NULL,
//!     event_code TEXT NOT NULL,
//!     action TEXT NOT NULL,
//!     resource_type TEXT NOT NULL,
//!     resource_id TEXT NOT NULL,
//!     success BOOLEAN NOT NULL,
//!     metadata JSONB NOT NULL DEFAULT 'null',
//!     created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
//! );
//! ```

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::model::{Approval, ApprovalStatus, AuditEntry, Transaction, TxStatus};

use super::{ApprovalCounts, ApprovalStore, AuditStore, TransactionStore};

const TX_COLUMNS: &str = "id, chain_id, from_address, to_address, value, data, gas_limit, \
     max_fee_per_gas, priority_fee_per_gas, nonce, user_id, agent_id, plan_id, step_id, \
     risk_score, risk_level, requires_approval, simulate, status, hash, block_number, \
     block_hash, gas_used, confirmed_at, simulation_result, memo, created_at, updated_at";

const APPROVAL_COLUMNS: &str = "id, transaction_id, risk_score, risk_level, priority, status, \
     requested_at, expires_at, resolved_at, resolved_by, resolution, created_at, updated_at";

/// PostgreSQL-backed store set.
#[derive(Clone)]
pub struct PostgresStores {
    pool: PgPool,
}

impl PostgresStores {
    /// Wrap a connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl TransactionStore for PostgresStores {
    async fn insert(&self, tx: &Transaction) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO transactions (
                id, chain_id, from_address, to_address, value, data, gas_limit,
                max_fee_per_gas, priority_fee_per_gas, nonce, user_id, agent_id, plan_id, step_id,
                risk_score, risk_level, requires_approval, simulate, status, hash, block_number,
                block_hash, gas_used, confirmed_at, simulation_result, memo, created_at, updated_at
            )
            VALUES (
                $1, $2, $3, $4, $5, $6, $7,
                $8, $9, $10, $11, $12, $13, $14,
                $15, $16, $17, $18, $19, $20, $21,
                $22, $23, $24, $25, $26, $27, $28
            )
            "#,
        )
        .bind(tx.id)
        .bind(tx.chain_id)
        .bind(&tx.from_address)
        .bind(&tx.to_address)
        .bind(&tx.value)
        .bind(&tx.data)
        .bind(tx.gas_limit)
        .bind(&tx.max_fee_per_gas)
        .bind(&tx.priority_fee_per_gas)
        .bind(tx.nonce)
        .bind(&tx.user_id)
        .bind(&tx.agent_id)
        .bind(tx.plan_id)
        .bind(&tx.step_id)
        .bind(tx.risk_score)
        .bind(tx.risk_level)
        .bind(tx.requires_approval)
        .bind(tx.simulate)
        .bind(tx.status)
        .bind(&tx.hash)
        .bind(tx.block_number)
        .bind(&tx.block_hash)
        .bind(tx.gas_used)
        .bind(tx.confirmed_at)
        .bind(&tx.simulation_result)
        .bind(&tx.memo)
        .bind(tx.created_at)
        .bind(tx.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Transaction>> {
        let tx = sqlx::query_as::<_, Transaction>(&format!(
            "SELECT {TX_COLUMNS} FROM transactions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(tx)
    }

    async fn update(&self, tx: &Transaction) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE transactions SET
                chain_id = $1, from_address = $2, to_address = $3, value = $4, data = $5,
                gas_limit = $6, max_fee_per_gas = $7, priority_fee_per_gas = $8, nonce = $9,
                user_id = $10, agent_id = $11, plan_id = $12, step_id = $13,
                risk_score = $14, risk_level = $15, requires_approval = $16, simulate = $17,
                status = $18, hash = $19, block_number = $20, block_hash = $21, gas_used = $22,
                confirmed_at = $23, simulation_result = $24, memo = $25, updated_at = NOW()
            WHERE id = $26
            "#,
        )
        .bind(tx.chain_id)
        .bind(&tx.from_address)
        .bind(&tx.to_address)
        .bind(&tx.value)
        .bind(&tx.data)
        .bind(tx.gas_limit)
        .bind(&tx.max_fee_per_gas)
        .bind(&tx.priority_fee_per_gas)
        .bind(tx.nonce)
        .bind(&tx.user_id)
        .bind(&tx.agent_id)
        .bind(tx.plan_id)
        .bind(&tx.step_id)
        .bind(tx.risk_score)
        .bind(tx.risk_level)
        .bind(tx.requires_approval)
        .bind(tx.simulate)
        .bind(tx.status)
        .bind(&tx.hash)
        .bind(tx.block_number)
        .bind(&tx.block_hash)
        .bind(tx.gas_used)
        .bind(tx.confirmed_at)
        .bind(&tx.simulation_result)
        .bind(&tx.memo)
        .bind(tx.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn transition(
        &self,
        id: Uuid,
        from: &[TxStatus],
        to: TxStatus,
    ) -> Result<Option<Transaction>> {
        let tx = sqlx::query_as::<_, Transaction>(&format!(
            r#"
            UPDATE transactions
            SET status = $1, updated_at = NOW()
            WHERE id = $2 AND status = ANY($3)
            RETURNING {TX_COLUMNS}
            "#
        ))
        .bind(to)
        .bind(id)
        .bind(from.to_vec())
        .fetch_optional(&self.pool)
        .await?;
        Ok(tx)
    }

    async fn find_by_plan(&self, plan_id: Uuid) -> Result<Vec<Transaction>> {
        let txs = sqlx::query_as::<_, Transaction>(&format!(
            "SELECT {TX_COLUMNS} FROM transactions WHERE plan_id = $1 ORDER BY created_at"
        ))
        .bind(plan_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(txs)
    }
}

#[async_trait::async_trait]
impl ApprovalStore for PostgresStores {
    async fn insert(&self, approval: &Approval) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO approvals (
                id, transaction_id, risk_score, risk_level, priority, status,
                requested_at, expires_at, resolved_at, resolved_by, resolution,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(approval.id)
        .bind(approval.transaction_id)
        .bind(approval.risk_score)
        .bind(approval.risk_level)
        .bind(approval.priority)
        .bind(approval.status)
        .bind(approval.requested_at)
        .bind(approval.expires_at)
        .bind(approval.resolved_at)
        .bind(&approval.resolved_by)
        .bind(&approval.resolution)
        .bind(approval.created_at)
        .bind(approval.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Approval>> {
        let approval = sqlx::query_as::<_, Approval>(&format!(
            "SELECT {APPROVAL_COLUMNS} FROM approvals WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(approval)
    }

    async fn find_by_transaction(&self, transaction_id: Uuid) -> Result<Option<Approval>> {
        let approval = sqlx::query_as::<_, Approval>(&format!(
            "SELECT {APPROVAL_COLUMNS} FROM approvals WHERE transaction_id = $1"
        ))
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(approval)
    }

    async fn resolve(
        &self,
        id: Uuid,
        to: ApprovalStatus,
        resolved_by: Option<&str>,
        resolution: Option<&str>,
    ) -> Result<Option<Approval>> {
        let approval = sqlx::query_as::<_, Approval>(&format!(
            r#"
            UPDATE approvals
            SET status = $1,
                resolved_at = NOW(),
                resolved_by = $2,
                resolution = $3,
                updated_at = NOW()
            WHERE id = $4 AND status = 'pending'
            RETURNING {APPROVAL_COLUMNS}
            "#
        ))
        .bind(to)
        .bind(resolved_by)
        .bind(resolution)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(approval)
    }

    async fn expire_due(&self, now: DateTime<Utc>) -> Result<Vec<Approval>> {
        let expired = sqlx::query_as::<_, Approval>(&format!(
            r#"
            UPDATE approvals
            SET status = 'expired',
                resolved_at = $1,
                resolution = 'Auto-expired',
                updated_at = $1
            WHERE status = 'pending' AND expires_at <= $1
            RETURNING {APPROVAL_COLUMNS}
            "#
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(expired)
    }

    async fn list_pending(&self) -> Result<Vec<Approval>> {
        let pending = sqlx::query_as::<_, Approval>(&format!(
            "SELECT {APPROVAL_COLUMNS} FROM approvals WHERE status = 'pending' ORDER BY requested_at"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(pending)
    }

    async fn counts(&self) -> Result<ApprovalCounts> {
        let rows = sqlx::query_as::<_, (ApprovalStatus, i64)>(
            "SELECT status, COUNT(*) FROM approvals GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts = ApprovalCounts::default();
        for (status, count) in rows {
            let count = count as usize;
            match status {
                ApprovalStatus::Pending => counts.pending = count,
                ApprovalStatus::Approved => counts.approved = count,
                ApprovalStatus::Rejected => counts.rejected = count,
                ApprovalStatus::Expired => counts.expired = count,
                ApprovalStatus::Cancelled => counts.cancelled = count,
            }
        }
        Ok(counts)
    }
}

#[async_trait::async_trait]
impl AuditStore for PostgresStores {
    async fn append(&self, entry: &AuditEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_log (
                id, event_type, event_code, action, resource_type, resource_id,
                success, metadata, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(entry.id)
        .bind(&entry.event_type)
        .bind(&entry.event_code)
        .bind(&entry.action)
        .bind(&entry.resource_type)
        .bind(&entry.resource_id)
        .bind(entry.success)
        .bind(&entry.metadata)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent(&self, limit: i64) -> Result<Vec<AuditEntry>> {
        let entries = sqlx::query_as::<_, AuditEntry>(
            r#"
            SELECT id, event_type, event_code, action, resource_type, resource_id,
                   success, metadata, created_at
            FROM audit_log
            ORDER BY created_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }
}
