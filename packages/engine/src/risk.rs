//! Risk banding and the thresholds that route transactions.
//!
//! Scores live in `[0, 1]`. Bands are half-open on the upper bound except
//! the last:
//!
//! | Score | Level | Approval priority |
//! |---|---|---|
//! | `[0.00, 0.50)` | Low | — (no approval) |
//! | `[0.50, 0.70)` | Medium | Normal |
//! | `[0.70, 0.85)` | High | High |
//! | `[0.85, 1.00]` | Critical | Urgent |
//!
//! Independently of the banding, scores strictly above
//! [`RiskPolicy::max_risk_score`] are blocked outright: no approval is
//! requested and the transaction never enters a queue.

use serde::{Deserialize, Serialize};

/// Risk band derived from the numeric score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "risk_level", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// Band a score. Scores outside `[0, 1]` are clamped.
    pub fn from_score(score: f64) -> Self {
        let score = score.clamp(0.0, 1.0);
        if score < 0.5 {
            RiskLevel::Low
        } else if score < 0.7 {
            RiskLevel::Medium
        } else if score < 0.85 {
            RiskLevel::High
        } else {
            RiskLevel::Critical
        }
    }

    /// Severity label used in alert titles.
    pub fn severity(&self) -> &'static str {
        match self {
            RiskLevel::Low => "info",
            RiskLevel::Medium => "warning",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Queue priority of an approval request, derived from the risk band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "approval_priority", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ApprovalPriority {
    Low,
    Normal,
    High,
    Urgent,
}

impl From<RiskLevel> for ApprovalPriority {
    fn from(level: RiskLevel) -> Self {
        match level {
            RiskLevel::Low => ApprovalPriority::Low,
            RiskLevel::Medium => ApprovalPriority::Normal,
            RiskLevel::High => ApprovalPriority::High,
            RiskLevel::Critical => ApprovalPriority::Urgent,
        }
    }
}

/// The configurable thresholds that gate execution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RiskPolicy {
    /// At or above this score an approval is required. Default 0.5.
    pub approval_threshold: f64,
    /// At or above this score the band is critical. Default 0.85.
    pub block_threshold: f64,
    /// Strictly above this score execution is blocked outright.
    /// Default 0.95.
    pub max_risk_score: f64,
}

impl Default for RiskPolicy {
    fn default() -> Self {
        Self {
            approval_threshold: 0.5,
            block_threshold: 0.85,
            max_risk_score: 0.95,
        }
    }
}

impl RiskPolicy {
    /// Whether a score requires an approval before broadcast.
    pub fn requires_approval(&self, score: f64) -> bool {
        score >= self.approval_threshold
    }

    /// Whether a score is blocked outright (never requested).
    pub fn blocked(&self, score: f64) -> bool {
        score > self.max_risk_score
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn band_boundaries_are_exact() {
        assert_eq!(RiskLevel::from_score(0.0), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(0.49), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(0.5), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(0.69), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(0.7), RiskLevel::High);
        assert_eq!(RiskLevel::from_score(0.84), RiskLevel::High);
        assert_eq!(RiskLevel::from_score(0.85), RiskLevel::Critical);
        assert_eq!(RiskLevel::from_score(1.0), RiskLevel::Critical);
    }

    #[test]
    fn out_of_range_scores_clamp() {
        assert_eq!(RiskLevel::from_score(-0.3), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(1.7), RiskLevel::Critical);
    }

    #[test]
    fn priority_follows_level() {
        assert_eq!(ApprovalPriority::from(RiskLevel::Low), ApprovalPriority::Low);
        assert_eq!(
            ApprovalPriority::from(RiskLevel::Medium),
            ApprovalPriority::Normal
        );
        assert_eq!(
            ApprovalPriority::from(RiskLevel::High),
            ApprovalPriority::High
        );
        assert_eq!(
            ApprovalPriority::from(RiskLevel::Critical),
            ApprovalPriority::Urgent
        );
    }

    #[test]
    fn default_policy_gates() {
        let policy = RiskPolicy::default();
        assert!(!policy.requires_approval(0.49));
        assert!(policy.requires_approval(0.5));
        // Exactly the maximum is still requestable, strictly above is not.
        assert!(!policy.blocked(0.95));
        assert!(policy.blocked(0.951));
    }
}
