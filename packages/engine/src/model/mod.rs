//! Persistent record models.

pub mod approval;
pub mod audit;
pub mod notification;
pub mod plan;
pub mod transaction;

pub use approval::{Approval, ApprovalStatus};
pub use audit::AuditEntry;
pub use notification::{Channel, Notification};
pub use plan::{Plan, PlanStep};
pub use transaction::{is_valid_address, Transaction, TxSpec, TxStatus};
