//! Intent domain model and status state machine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};

/// Unique identifier for an intent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IntentId(pub Uuid);

impl IntentId {
    /// Generate a new intent ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse from string
    pub fn parse_str(s: &str) -> EngineResult<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| EngineError::Validation(format!("Invalid intent ID: {}", e)))
    }
}

impl Default for IntentId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for IntentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Tenant identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(pub String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Acting entity (agent) identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Intent processing status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentStatus {
    /// Accepted, waiting for the intake stage
    Pending,
    /// Under rule and policy evaluation
    Evaluating,
    /// Decision approved execution
    Approved,
    /// Decision denied execution
    Denied,
    /// Escalated for human review
    Escalated,
    /// Executing in the sandbox
    Executing,
    /// Execution finished successfully
    Completed,
    /// Processing or execution failed
    Failed,
    /// Cancelled by the submitter or an operator
    Cancelled,
}

impl IntentStatus {
    /// Whether no further transitions are permitted
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            IntentStatus::Completed
                | IntentStatus::Failed
                | IntentStatus::Denied
                | IntentStatus::Cancelled
        )
    }

    /// Whether the state machine permits moving to `next`
    pub fn can_transition_to(&self, next: IntentStatus) -> bool {
        use IntentStatus::*;
        matches!(
            (self, next),
            (Pending, Evaluating)
                | (Pending, Cancelled)
                | (Pending, Failed)
                | (Evaluating, Approved)
                | (Evaluating, Denied)
                | (Evaluating, Escalated)
                | (Evaluating, Cancelled)
                | (Evaluating, Failed)
                | (Escalated, Approved)
                | (Escalated, Denied)
                | (Escalated, Cancelled)
                | (Escalated, Failed)
                | (Approved, Executing)
                | (Approved, Cancelled)
                | (Approved, Failed)
                | (Executing, Completed)
                | (Executing, Failed)
        )
    }

    /// Lowercase wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentStatus::Pending => "pending",
            IntentStatus::Evaluating => "evaluating",
            IntentStatus::Approved => "approved",
            IntentStatus::Denied => "denied",
            IntentStatus::Escalated => "escalated",
            IntentStatus::Executing => "executing",
            IntentStatus::Completed => "completed",
            IntentStatus::Failed => "failed",
            IntentStatus::Cancelled => "cancelled",
        }
    }

    /// Event type recorded when an intent enters this status
    pub fn event_type(&self) -> &'static str {
        match self {
            IntentStatus::Pending => "intent.submitted",
            IntentStatus::Evaluating => "intent.evaluating",
            IntentStatus::Approved => "intent.approved",
            IntentStatus::Denied => "intent.denied",
            IntentStatus::Escalated => "intent.escalated",
            IntentStatus::Executing => "intent.executing",
            IntentStatus::Completed => "intent.executed.completed",
            IntentStatus::Failed => "intent.failed",
            IntentStatus::Cancelled => "intent.cancelled",
        }
    }
}

impl std::fmt::Display for IntentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trust score and coarse level pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TrustSnapshot {
    pub score: i64,
    pub level: u8,
}

/// Validation context for guarded transitions (cancellation reasons, human
/// approval permission)
#[derive(Debug, Clone, Copy, Default)]
pub struct TransitionGuards {
    /// A cancellation reason was supplied
    pub has_reason: bool,
    /// The caller holds approve/deny permission
    pub has_permission: bool,
    /// Skip state machine validation (operator escape hatch)
    pub skip_validation: bool,
}

/// An intent under governance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intent {
    /// Unique identifier
    pub id: IntentId,
    /// Owning tenant
    pub tenant_id: TenantId,
    /// Acting entity
    pub entity_id: EntityId,
    /// Free-form goal text
    pub goal: String,
    /// Intent type tag; drives routing, gates, and limits
    pub intent_type: Option<String>,
    /// Priority (larger is more urgent)
    pub priority: i32,
    /// Structured context, redacted and size-bounded at intake
    pub context: Value,
    /// Caller metadata, same handling as context
    pub metadata: Value,
    /// Current status
    pub status: IntentStatus,
    /// Trust at intake
    pub trust_snapshot: TrustSnapshot,
    /// Most recently observed trust
    pub current_trust: TrustSnapshot,
    /// Dedupe fingerprint (hex)
    pub dedupe_fingerprint: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancellation_reason: Option<String>,
}

impl Intent {
    /// Whether the intent has been soft-deleted
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Validate and apply a status transition.
    ///
    /// Transitions into `cancelled` require a reason; human `approved`/`denied`
    /// transitions require permission. Guard checks run even when state
    /// machine validation is skipped.
    pub fn transition_to(
        &mut self,
        next: IntentStatus,
        guards: TransitionGuards,
    ) -> EngineResult<()> {
        if next == IntentStatus::Cancelled && !guards.has_reason {
            return Err(EngineError::Validation(
                "cancellation requires a reason".to_string(),
            ));
        }
        if self.status == IntentStatus::Escalated
            && matches!(next, IntentStatus::Approved | IntentStatus::Denied)
            && !guards.has_permission
        {
            return Err(EngineError::Validation(
                "resolving an escalation requires approval permission".to_string(),
            ));
        }

        if !guards.skip_validation && !self.status.can_transition_to(next) {
            return Err(EngineError::InvalidStateTransition {
                from: self.status.as_str().to_string(),
                to: next.as_str().to_string(),
            });
        }

        self.status = next;
        self.updated_at = Utc::now();
        if next == IntentStatus::Cancelled {
            self.cancelled_at = Some(self.updated_at);
        }
        Ok(())
    }
}

/// A validated submission accepted by the intake service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentSubmission {
    pub entity_id: EntityId,
    pub goal: String,
    #[serde(default)]
    pub intent_type: Option<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "empty_object")]
    pub context: Value,
    #[serde(default = "empty_object")]
    pub metadata: Value,
    /// Caller-supplied idempotency key folded into the dedupe fingerprint
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

impl IntentSubmission {
    /// Minimal submission for the given entity and goal
    pub fn new(entity_id: impl Into<String>, goal: impl Into<String>) -> Self {
        Self {
            entity_id: EntityId::new(entity_id),
            goal: goal.into(),
            intent_type: None,
            priority: 0,
            context: empty_object(),
            metadata: empty_object(),
            idempotency_key: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn intent(status: IntentStatus) -> Intent {
        Intent {
            id: IntentId::new(),
            tenant_id: TenantId::new("t1"),
            entity_id: EntityId::new("e1"),
            goal: "test".to_string(),
            intent_type: None,
            priority: 0,
            context: json!({}),
            metadata: json!({}),
            status,
            trust_snapshot: TrustSnapshot::default(),
            current_trust: TrustSnapshot::default(),
            dedupe_fingerprint: "fp".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            deleted_at: None,
            cancelled_at: None,
            cancellation_reason: None,
        }
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut i = intent(IntentStatus::Pending);
        let guards = TransitionGuards::default();
        i.transition_to(IntentStatus::Evaluating, guards).unwrap();
        i.transition_to(IntentStatus::Approved, guards).unwrap();
        i.transition_to(IntentStatus::Executing, guards).unwrap();
        i.transition_to(IntentStatus::Completed, guards).unwrap();
        assert!(i.status.is_terminal());
    }

    #[test]
    fn test_terminal_states_reject_transitions() {
        for status in [
            IntentStatus::Completed,
            IntentStatus::Failed,
            IntentStatus::Denied,
            IntentStatus::Cancelled,
        ] {
            let mut i = intent(status);
            let result = i.transition_to(IntentStatus::Evaluating, TransitionGuards::default());
            assert!(matches!(
                result,
                Err(EngineError::InvalidStateTransition { .. })
            ));
        }
    }

    #[test]
    fn test_cancel_requires_reason() {
        let mut i = intent(IntentStatus::Pending);
        let result = i.transition_to(IntentStatus::Cancelled, TransitionGuards::default());
        assert!(matches!(result, Err(EngineError::Validation(_))));

        let guards = TransitionGuards {
            has_reason: true,
            ..Default::default()
        };
        i.transition_to(IntentStatus::Cancelled, guards).unwrap();
        assert!(i.cancelled_at.is_some());
    }

    #[test]
    fn test_escalation_resolution_requires_permission() {
        let mut i = intent(IntentStatus::Escalated);
        let result = i.transition_to(IntentStatus::Approved, TransitionGuards::default());
        assert!(matches!(result, Err(EngineError::Validation(_))));

        let guards = TransitionGuards {
            has_permission: true,
            ..Default::default()
        };
        i.transition_to(IntentStatus::Approved, guards).unwrap();
    }

    #[test]
    fn test_executing_cannot_be_cancelled() {
        let mut i = intent(IntentStatus::Executing);
        let guards = TransitionGuards {
            has_reason: true,
            ..Default::default()
        };
        assert!(i.transition_to(IntentStatus::Cancelled, guards).is_err());
    }

    #[test]
    fn test_skip_validation_still_checks_guards() {
        let mut i = intent(IntentStatus::Completed);
        let guards = TransitionGuards {
            skip_validation: true,
            ..Default::default()
        };
        // Reason guard still applies
        assert!(i.transition_to(IntentStatus::Cancelled, guards).is_err());
        // But the state machine itself is bypassed
        i.transition_to(IntentStatus::Failed, guards).unwrap();
    }
}
