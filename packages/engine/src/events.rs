//! The closed event vocabulary and its payload shapes.
//!
//! Every state change the pipeline performs is mirrored onto the bus as a
//! [`PipelineEvent`]: a type from the closed set, an ISO-8601 UTC
//! timestamp, and a JSON payload. Payloads are built from the typed
//! structs below so producers cannot drift from the published schemas,
//! but travel as `serde_json::Value` so the fan-out layer can filter
//! without knowing every shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::risk::{ApprovalPriority, RiskLevel};

/// The closed set of event types observers can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "transaction:pending")]
    TransactionPending,
    #[serde(rename = "transaction:submitted")]
    TransactionSubmitted,
    #[serde(rename = "transaction:confirmed")]
    TransactionConfirmed,
    #[serde(rename = "transaction:failed")]
    TransactionFailed,
    #[serde(rename = "approval:created")]
    ApprovalCreated,
    #[serde(rename = "approval:approved")]
    ApprovalApproved,
    #[serde(rename = "approval:rejected")]
    ApprovalRejected,
    #[serde(rename = "approval:expired")]
    ApprovalExpired,
    #[serde(rename = "plan:started")]
    PlanStarted,
    #[serde(rename = "plan:completed")]
    PlanCompleted,
    #[serde(rename = "plan:failed")]
    PlanFailed,
    #[serde(rename = "agent:action")]
    AgentAction,
    #[serde(rename = "agent:error")]
    AgentError,
    #[serde(rename = "system:alert")]
    SystemAlert,
    #[serde(rename = "job:queued")]
    JobQueued,
    #[serde(rename = "job:progress")]
    JobProgress,
    #[serde(rename = "job:completed")]
    JobCompleted,
    #[serde(rename = "job:failed")]
    JobFailed,
    #[serde(rename = "job:stalled")]
    JobStalled,
}

impl EventType {
    /// The wire name, e.g. `transaction:confirmed`.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::TransactionPending => "transaction:pending",
            EventType::TransactionSubmitted => "transaction:submitted",
            EventType::TransactionConfirmed => "transaction:confirmed",
            EventType::TransactionFailed => "transaction:failed",
            EventType::ApprovalCreated => "approval:created",
            EventType::ApprovalApproved => "approval:approved",
            EventType::ApprovalRejected => "approval:rejected",
            EventType::ApprovalExpired => "approval:expired",
            EventType::PlanStarted => "plan:started",
            EventType::PlanCompleted => "plan:completed",
            EventType::PlanFailed => "plan:failed",
            EventType::AgentAction => "agent:action",
            EventType::AgentError => "agent:error",
            EventType::SystemAlert => "system:alert",
            EventType::JobQueued => "job:queued",
            EventType::JobProgress => "job:progress",
            EventType::JobCompleted => "job:completed",
            EventType::JobFailed => "job:failed",
            EventType::JobStalled => "job:stalled",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| format!("unknown event type: {s}"))
    }
}

/// A single event on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineEvent {
    /// Which member of the closed set this is.
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// When the event was published (UTC).
    pub timestamp: DateTime<Utc>,
    /// Schema depends on the event family; see the payload structs.
    pub payload: serde_json::Value,
}

impl PipelineEvent {
    /// Build an event with an already-serialized payload.
    pub fn new(event_type: EventType, payload: serde_json::Value) -> Self {
        Self {
            event_type,
            timestamp: Utc::now(),
            payload,
        }
    }

    /// Build an event from a typed payload.
    pub fn from_payload<P: Serialize>(event_type: EventType, payload: &P) -> Self {
        Self::new(
            event_type,
            serde_json::to_value(payload).unwrap_or(serde_json::Value::Null),
        )
    }

    /// Read a string field from the payload (filter matching).
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(|v| v.as_str())
    }
}

/// Payload for `transaction:*` events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionEvent {
    pub transaction_id: Uuid,
    pub chain_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_number: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gas_used: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Payload for `approval:*` events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalEvent {
    pub approval_id: Uuid,
    pub transaction_id: Uuid,
    pub risk_score: f64,
    pub risk_level: RiskLevel,
    pub priority: ApprovalPriority,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolver: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Payload for `plan:*` events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanEvent {
    pub plan_id: Uuid,
    pub step_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Payload for `job:*` lifecycle events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    pub queue: String,
    pub job_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Payload for `system:alert`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertEvent {
    pub severity: String,
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub context: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_serializes_with_colon_names() {
        let json = serde_json::to_string(&EventType::TransactionConfirmed).unwrap();
        assert_eq!(json, "\"transaction:confirmed\"");
    }

    #[test]
    fn event_type_round_trips_through_from_str() {
        for ty in [
            EventType::TransactionPending,
            EventType::ApprovalExpired,
            EventType::PlanFailed,
            EventType::JobStalled,
            EventType::SystemAlert,
        ] {
            let parsed: EventType = ty.as_str().parse().unwrap();
            assert_eq!(parsed, ty);
        }
    }

    #[test]
    fn unknown_event_type_fails_to_parse() {
        assert!("transaction:reverted".parse::<EventType>().is_err());
    }

    #[test]
    fn payload_fields_are_reachable_for_filtering() {
        let event = PipelineEvent::from_payload(
            EventType::TransactionConfirmed,
            &TransactionEvent {
                transaction_id: Uuid::new_v4(),
                chain_id: 42220,
                hash: Some("0xabc".into()),
                block_number: Some(10),
                gas_used: Some(21_000),
                user_id: Some("u42".into()),
                agent_id: None,
                plan_id: None,
                error: None,
            },
        );
        assert_eq!(event.payload_str("user_id"), Some("u42"));
        assert_eq!(event.payload_str("agent_id"), None);
    }

    #[test]
    fn none_fields_are_omitted_from_payload() {
        let event = PipelineEvent::from_payload(
            EventType::PlanCompleted,
            &PlanEvent {
                plan_id: Uuid::new_v4(),
                step_count: 3,
                user_id: None,
                agent_id: None,
                error: None,
            },
        );
        assert!(event.payload.get("error").is_none());
    }
}
