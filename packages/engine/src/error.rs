//! Typed error surface with retry classification.
//!
//! Workers map every failure onto an [`EngineError`] variant; the
//! coordinator consults [`EngineError::failure_kind`] to decide between
//! re-queueing with backoff and terminal failure. Chain adapters report
//! plain `anyhow` errors; [`classify_broadcast_error`] sniffs the message
//! for the transient classes RPC nodes are known to emit.

use conveyor::FailureKind;
use uuid::Uuid;

/// Errors produced by the pipeline core.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Malformed input: bad address, missing field, invalid plan graph.
    #[error("validation failed: {0}")]
    Validation(String),

    /// No adapter registered for the chain.
    #[error("unsupported chain {0}")]
    UnsupportedChain(i64),

    /// Dry-run reverted or could not be estimated before broadcast.
    #[error("simulation failed: {0}")]
    SimulationFailed(String),

    /// Risk score above the hard block threshold; never enqueued.
    #[error("risk score {score:.2} exceeds the maximum allowed {max:.2}")]
    RiskBlocked {
        /// The transaction's risk score.
        score: f64,
        /// The configured ceiling.
        max: f64,
    },

    /// Caller exceeded the submission window.
    #[error("rate limit exceeded for {0}")]
    RateLimited(String),

    /// Timeout, reset, rate limit from an upstream service. Retryable.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Nonce/ordering conflict expected to self-heal on re-read. Retryable.
    #[error("nonce conflict: {0}")]
    NonceConflict(String),

    /// The sender cannot cover value + gas.
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    /// The node rejected the signed payload for a non-transient reason.
    #[error("broadcast rejected: {0}")]
    BroadcastRejected(String),

    /// Receipt polling hit its ceiling without an inclusion.
    #[error("confirmation timeout after {0}s")]
    ConfirmationTimeout(u64),

    /// A mutator was called on an approval that already left `Pending`.
    #[error("approval {id} is already resolved ({status})")]
    AlreadyResolved {
        /// The approval.
        id: Uuid,
        /// Its current status.
        status: String,
    },

    /// The resolver failed the caller-supplied gate.
    #[error("resolver {0} is not allowed to resolve this approval")]
    ResolverDenied(String),

    /// An entity referenced by id does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Shutdown raced the work.
    #[error("cancelled")]
    Cancelled,

    /// Storage or queue infrastructure error. Retryable.
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl EngineError {
    /// Whether this error should trigger a queue-level retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Transient(_) | EngineError::NonceConflict(_) | EngineError::Storage(_)
        )
    }

    /// Map onto the queue backend's failure classification.
    pub fn failure_kind(&self) -> FailureKind {
        if self.is_retryable() {
            FailureKind::Retryable
        } else {
            FailureKind::Fatal
        }
    }
}

/// Classify a broadcast failure by its message.
///
/// RPC nodes encode the interesting cases in free text, so this is
/// substring sniffing by design. The transient classes (nonce ordering,
/// already-known, timeouts, rate limits, resets) come back as retryable
/// variants; everything else is fatal.
pub fn classify_broadcast_error(message: &str) -> EngineError {
    let lower = message.to_lowercase();

    if lower.contains("nonce too low")
        || lower.contains("already known")
        || lower.contains("replacement transaction underpriced")
    {
        return EngineError::NonceConflict(message.to_string());
    }

    if lower.contains("timeout")
        || lower.contains("timed out")
        || lower.contains("rate limit")
        || lower.contains("too many requests")
        || lower.contains("connection reset")
        || lower.contains("connection refused")
        || lower.contains("temporarily unavailable")
    {
        return EngineError::Transient(message.to_string());
    }

    if lower.contains("insufficient funds") {
        return EngineError::InsufficientFunds(message.to_string());
    }

    EngineError::BroadcastRejected(message.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonce_errors_are_retryable() {
        for msg in [
            "nonce too low",
            "tx already known",
            "replacement transaction underpriced",
        ] {
            let err = classify_broadcast_error(msg);
            assert!(err.is_retryable(), "{msg} should be retryable");
        }
    }

    #[test]
    fn transient_errors_are_retryable() {
        for msg in [
            "request timeout",
            "429 rate limit exceeded",
            "connection reset by peer",
        ] {
            assert!(classify_broadcast_error(msg).is_retryable());
        }
    }

    #[test]
    fn insufficient_funds_is_fatal() {
        let err = classify_broadcast_error("insufficient funds for gas * price + value");
        assert!(matches!(err, EngineError::InsufficientFunds(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn unknown_rejections_are_fatal() {
        let err = classify_broadcast_error("invalid signature");
        assert!(matches!(err, EngineError::BroadcastRejected(_)));
        assert_eq!(err.failure_kind(), FailureKind::Fatal);
    }

    #[test]
    fn validation_is_fatal() {
        assert_eq!(
            EngineError::Validation("bad address".into()).failure_kind(),
            FailureKind::Fatal
        );
    }

    #[test]
    fn storage_is_retryable() {
        let err = EngineError::Storage(anyhow::anyhow!("pool exhausted"));
        assert!(err.is_retryable());
    }
}
