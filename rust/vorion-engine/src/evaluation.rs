//! Evaluation records and governance actions
//!
//! Evaluations are the structured result blobs recorded at well-defined
//! pipeline stages. They are append-only and discriminated by a `kind` tag;
//! unknown shapes are rejected at the serde boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::intent::IntentId;

/// Governance action ordered by restrictiveness.
///
/// The total order is `terminate > deny > escalate > limit > monitor >
/// allow`; decision resolution always takes the most restrictive of the rule
/// and policy actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GovernanceAction {
    Terminate,
    Deny,
    Escalate,
    Limit,
    Monitor,
    Allow,
}

impl GovernanceAction {
    /// Restrictiveness rank; lower is more restrictive
    fn rank(&self) -> u8 {
        match self {
            GovernanceAction::Terminate => 0,
            GovernanceAction::Deny => 1,
            GovernanceAction::Escalate => 2,
            GovernanceAction::Limit => 3,
            GovernanceAction::Monitor => 4,
            GovernanceAction::Allow => 5,
        }
    }

    /// The more restrictive of two actions
    pub fn most_restrictive(self, other: GovernanceAction) -> GovernanceAction {
        if other.rank() < self.rank() {
            other
        } else {
            self
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GovernanceAction::Terminate => "terminate",
            GovernanceAction::Deny => "deny",
            GovernanceAction::Escalate => "escalate",
            GovernanceAction::Limit => "limit",
            GovernanceAction::Monitor => "monitor",
            GovernanceAction::Allow => "allow",
        }
    }
}

impl std::fmt::Display for GovernanceAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a trust reading came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustSource {
    /// Live fetch from the trust engine
    Live,
    /// Cached value used while the trust breaker was open
    Cached,
    /// No reading available; defaulted to zero
    Default,
}

/// Rule evaluation output
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleOutcome {
    pub action: GovernanceAction,
    /// Identifiers of the rules that matched
    #[serde(default)]
    pub matched_rules: Vec<String>,
}

/// Policy evaluation output
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyOutcome {
    pub action: GovernanceAction,
    /// Match counts per policy
    #[serde(default)]
    pub matches: Vec<PolicyMatch>,
}

/// Per-policy match count
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyMatch {
    pub policy: String,
    pub count: u32,
}

/// Structured evaluation result recorded against an intent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Evaluation {
    /// Trust at intake
    TrustSnapshot {
        score: i64,
        level: u8,
        source: TrustSource,
    },
    /// Combined rule and policy output from the evaluate stage
    Basis {
        rule: RuleOutcome,
        policy: Option<PolicyOutcome>,
        /// Policy evaluation was skipped or failed; decision is rules-only
        degraded: bool,
    },
    /// Decision-time trust gate result
    TrustGate {
        passed: bool,
        required: u8,
        actual: u8,
    },
    /// Final decision
    Decision {
        rule_action: GovernanceAction,
        policy_action: Option<GovernanceAction>,
        final_action: GovernanceAction,
        /// Policy produced a more restrictive action than the rules
        policy_override: bool,
    },
    /// Terminal processing error
    Error { message: String, error_kind: String },
    /// Cancellation record
    Cancelled {
        reason: String,
        cancelled_by: Option<String>,
    },
}

impl Evaluation {
    /// Discriminator string as persisted
    pub fn kind(&self) -> &'static str {
        match self {
            Evaluation::TrustSnapshot { .. } => "trust-snapshot",
            Evaluation::Basis { .. } => "basis",
            Evaluation::TrustGate { .. } => "trust-gate",
            Evaluation::Decision { .. } => "decision",
            Evaluation::Error { .. } => "error",
            Evaluation::Cancelled { .. } => "cancelled",
        }
    }
}

/// A persisted evaluation row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationRecord {
    pub id: Uuid,
    pub intent_id: IntentId,
    #[serde(flatten)]
    pub evaluation: Evaluation,
    pub recorded_at: DateTime<Utc>,
}

impl EvaluationRecord {
    /// Wrap an evaluation for persistence
    pub fn new(intent_id: IntentId, evaluation: Evaluation) -> Self {
        Self {
            id: Uuid::new_v4(),
            intent_id,
            evaluation,
            recorded_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_most_restrictive_order() {
        use GovernanceAction::*;
        assert_eq!(Allow.most_restrictive(Deny), Deny);
        assert_eq!(Deny.most_restrictive(Allow), Deny);
        assert_eq!(Monitor.most_restrictive(Limit), Limit);
        assert_eq!(Escalate.most_restrictive(Terminate), Terminate);
        assert_eq!(Allow.most_restrictive(Allow), Allow);
    }

    #[test]
    fn test_kind_discriminator_round_trip() {
        let evaluation = Evaluation::TrustGate {
            passed: false,
            required: 3,
            actual: 0,
        };
        let json = serde_json::to_value(&evaluation).unwrap();
        assert_eq!(json["kind"], "trust-gate");
        let back: Evaluation = serde_json::from_value(json).unwrap();
        assert_eq!(back.kind(), "trust-gate");
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let json = serde_json::json!({"kind": "mystery", "data": 1});
        assert!(serde_json::from_value::<Evaluation>(json).is_err());
    }

    #[test]
    fn test_extra_fields_rejected_in_outcomes() {
        let json = serde_json::json!({"action": "allow", "matched_rules": [], "extra": true});
        assert!(serde_json::from_value::<RuleOutcome>(json).is_err());
    }
}
