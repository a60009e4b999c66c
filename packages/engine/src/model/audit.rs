//! Audit trail entries.
//!
//! Every state transition the core performs appends one of these; failure
//! paths record `success = false` with the error text in the metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

/// One audit record.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct AuditEntry {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,
    /// Event family, e.g. `transaction`, `approval`, `plan`.
    pub event_type: String,
    /// Machine-readable code, e.g. `tx_confirmed`, `approval_expired`.
    pub event_code: String,
    /// The operation performed, e.g. `broadcast`, `approve`, `sweep`.
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    #[builder(default = true)]
    pub success: bool,
    #[builder(default = serde_json::Value::Null)]
    pub metadata: serde_json::Value,
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    /// Successful transition.
    pub fn ok(
        event_type: &str,
        event_code: &str,
        action: &str,
        resource_type: &str,
        resource_id: impl ToString,
    ) -> Self {
        AuditEntry::builder()
            .event_type(event_type)
            .event_code(event_code)
            .action(action)
            .resource_type(resource_type)
            .resource_id(resource_id.to_string())
            .build()
    }

    /// Failed transition; the error lands in the metadata.
    pub fn failure(
        event_type: &str,
        event_code: &str,
        action: &str,
        resource_type: &str,
        resource_id: impl ToString,
        error: &str,
    ) -> Self {
        AuditEntry::builder()
            .event_type(event_type)
            .event_code(event_code)
            .action(action)
            .resource_type(resource_type)
            .resource_id(resource_id.to_string())
            .success(false)
            .metadata(serde_json::json!({ "error": error }))
            .build()
    }

    /// Attach structured metadata.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_entry_defaults_to_success() {
        let entry = AuditEntry::ok("transaction", "tx_confirmed", "broadcast", "transaction", "t1");
        assert!(entry.success);
        assert_eq!(entry.metadata, serde_json::Value::Null);
    }

    #[test]
    fn failure_entry_records_the_error() {
        let entry = AuditEntry::failure(
            "transaction",
            "tx_failed",
            "broadcast",
            "transaction",
            "t1",
            "insufficient funds",
        );
        assert!(!entry.success);
        assert_eq!(entry.metadata["error"], "insufficient funds");
    }
}
