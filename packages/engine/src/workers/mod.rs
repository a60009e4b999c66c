//! The four queue processors and their payload schemas.
//!
//! Each queue carries exactly one payload shape, validated at enqueue
//! (construction) and dequeue (deserialization in the processor). A
//! payload that fails to deserialize is a fatal job error, the
//! dead-letter path.

pub mod notification;
pub mod plan;
pub mod simulation;
pub mod transaction;

use conveyor::LeasedJob;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineError;
use crate::model::{Notification, Plan};

pub use notification::{ChannelSender, NotificationWorker, RecordingSender, WebhookSender};
pub use plan::PlanWorker;
pub use simulation::SimulationWorker;
pub use transaction::TransactionWorker;

/// Payload of the `transaction` queue: one broadcast of one transaction.
///
/// The job id equals the transaction id, so duplicate submissions
/// deduplicate at the queue layer and at most one broadcast job per
/// transaction is ever live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionJob {
    pub transaction_id: Uuid,
}

/// Payload of the `plan` queue: one full plan execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanJob {
    pub plan: Plan,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

/// Payload of the `simulation` queue: a read-only dry-run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationJob {
    pub transaction_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block: Option<i64>,
}

/// Payload of the `notification` queue: one multi-channel delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationJob {
    pub notification: Notification,
}

/// Decode a queue payload; failure is fatal (dead-letter), never retried.
pub(crate) fn decode_payload<P: DeserializeOwned>(job: &LeasedJob) -> Result<P, EngineError> {
    serde_json::from_value(job.payload.clone()).map_err(|e| {
        EngineError::Validation(format!("invalid payload on queue {}: {e}", job.queue))
    })
}
