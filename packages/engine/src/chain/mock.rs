//! Deterministic, scriptable chain adapter.
//!
//! Used by the test suites and anywhere a pipeline must run without a
//! live chain. Failure sequences are scripted per call site: push error
//! messages onto the broadcast script and the adapter plays them back
//! before succeeding; delay receipts by a poll count to exercise the
//! confirmation loop.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{anyhow, Result};
use parking_lot::Mutex;

use crate::chain::adapter::{
    ChainAdapter, GasEstimate, Receipt, ReceiptStatus, SignedTx, SimulationOutcome, UnsignedTx,
};
use crate::model::Transaction;

/// Scriptable [`ChainAdapter`].
pub struct MockChainAdapter {
    chain_id: i64,
    gas_limit: i64,
    /// Error messages to play back, one per broadcast call, before
    /// broadcasting succeeds.
    broadcast_failures: Mutex<VecDeque<String>>,
    /// `get_receipt` returns `None` this many times before the receipt.
    receipt_delay_polls: Mutex<u32>,
    /// When set, receipts report this status.
    receipt_status: Mutex<ReceiptStatus>,
    /// When set, `get_receipt` never finds anything.
    withhold_receipt: Mutex<bool>,
    /// Scripted simulation outcome.
    simulation: Mutex<Option<SimulationOutcome>>,
    broadcast_calls: AtomicU64,
    receipt_calls: AtomicU64,
}

impl MockChainAdapter {
    /// An adapter that succeeds at everything, immediately.
    pub fn new(chain_id: i64) -> Self {
        Self {
            chain_id,
            gas_limit: 21_000,
            broadcast_failures: Mutex::new(VecDeque::new()),
            receipt_delay_polls: Mutex::new(0),
            receipt_status: Mutex::new(ReceiptStatus::Success),
            withhold_receipt: Mutex::new(false),
            simulation: Mutex::new(None),
            broadcast_calls: AtomicU64::new(0),
            receipt_calls: AtomicU64::new(0),
        }
    }

    /// Queue a broadcast failure; calls consume the queue front-first.
    pub fn push_broadcast_failure(&self, message: &str) {
        self.broadcast_failures
            .lock()
            .push_back(message.to_string());
    }

    /// Make `get_receipt` return `None` for the next `polls` calls.
    pub fn delay_receipt(&self, polls: u32) {
        *self.receipt_delay_polls.lock() = polls;
    }

    /// Make `get_receipt` never find a receipt (confirmation timeout path).
    pub fn withhold_receipt(&self) {
        *self.withhold_receipt.lock() = true;
    }

    /// Make receipts report an on-chain revert.
    pub fn revert_on_chain(&self) {
        *self.receipt_status.lock() = ReceiptStatus::Reverted;
    }

    /// Script the next simulation outcome.
    pub fn set_simulation(&self, outcome: SimulationOutcome) {
        *self.simulation.lock() = Some(outcome);
    }

    /// Script a reverting simulation.
    pub fn fail_simulation(&self, revert_reason: &str) {
        self.set_simulation(SimulationOutcome {
            success: false,
            gas_used: 0,
            return_value: None,
            revert_reason: Some(revert_reason.to_string()),
            balance_changes: vec![],
            logs: vec![],
        });
    }

    /// Number of broadcast attempts observed.
    pub fn broadcast_calls(&self) -> u64 {
        self.broadcast_calls.load(Ordering::SeqCst)
    }

    /// Number of receipt polls observed.
    pub fn receipt_calls(&self) -> u64 {
        self.receipt_calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ChainAdapter for MockChainAdapter {
    fn chain_id(&self) -> i64 {
        self.chain_id
    }

    async fn estimate_gas(&self, _tx: &Transaction) -> Result<GasEstimate> {
        Ok(GasEstimate {
            gas_limit: self.gas_limit,
            gas_price: "1000000000".to_string(),
            base_fee: Some("500000000".to_string()),
        })
    }

    async fn build(&self, tx: &Transaction) -> Result<UnsignedTx> {
        Ok(UnsignedTx {
            raw: format!("0xunsigned{}", tx.id.simple()),
        })
    }

    async fn sign(&self, tx: &UnsignedTx) -> Result<SignedTx> {
        Ok(SignedTx {
            raw: tx.raw.replace("unsigned", "signed"),
        })
    }

    async fn broadcast(&self, tx: &SignedTx) -> Result<String> {
        self.broadcast_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = self.broadcast_failures.lock().pop_front() {
            return Err(anyhow!(message));
        }
        Ok(tx.raw.replace("0xsigned", "0xhash"))
    }

    async fn get_receipt(&self, hash: &str) -> Result<Option<Receipt>> {
        self.receipt_calls.fetch_add(1, Ordering::SeqCst);
        if *self.withhold_receipt.lock() {
            return Ok(None);
        }
        {
            let mut delay = self.receipt_delay_polls.lock();
            if *delay > 0 {
                *delay -= 1;
                return Ok(None);
            }
        }
        let suffix = hash.get(6..14).or_else(|| hash.get(2..)).unwrap_or("0");
        Ok(Some(Receipt {
            block_number: 1_204_321,
            block_hash: format!("0xblock{suffix}"),
            gas_used: self.gas_limit,
            status: *self.receipt_status.lock(),
        }))
    }

    async fn simulate(&self, _tx: &Transaction, _block: Option<i64>) -> Result<SimulationOutcome> {
        Ok(self.simulation.lock().clone().unwrap_or(SimulationOutcome {
            success: true,
            gas_used: self.gas_limit / 2,
            return_value: Some("0x01".to_string()),
            revert_reason: None,
            balance_changes: vec![],
            logs: vec![],
        }))
    }
}
