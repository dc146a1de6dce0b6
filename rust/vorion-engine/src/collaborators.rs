//! External collaborator seams
//!
//! The trust engine, rule engine, policy engine, consent registry, sandbox
//! runtime, and proof recorder are external systems. The engine reaches them
//! only through these traits; `vorion-connectors` ships HTTP clients, and
//! the `Static*` implementations here back development and tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::SandboxConfig;
use crate::error::{EngineError, EngineResult};
use crate::evaluation::{Evaluation, GovernanceAction, PolicyOutcome, RuleOutcome};
use crate::intent::{EntityId, Intent, IntentId, TenantId, TrustSnapshot};

/// Resource limits handed to the sandbox per execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub max_memory_mb: u64,
    pub max_cpu_percent: u8,
    pub timeout_ms: u64,
    pub max_network_ops: Option<u64>,
    pub max_fs_ops: Option<u64>,
}

impl From<&SandboxConfig> for ResourceLimits {
    fn from(config: &SandboxConfig) -> Self {
        Self {
            max_memory_mb: config.max_memory_mb,
            max_cpu_percent: config.max_cpu_percent,
            timeout_ms: config.timeout_ms,
            max_network_ops: config.max_network_ops,
            max_fs_ops: config.max_fs_ops,
        }
    }
}

/// Classified sandbox outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionOutcome {
    Success,
    Failure,
    Timeout,
    Blocked,
}

impl ExecutionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionOutcome::Success => "success",
            ExecutionOutcome::Failure => "failure",
            ExecutionOutcome::Timeout => "timeout",
            ExecutionOutcome::Blocked => "blocked",
        }
    }
}

/// Sandbox execution report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub outcome: ExecutionOutcome,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub memory_peak_mb: Option<u64>,
}

/// Trust scoring collaborator
#[async_trait]
pub trait TrustProvider: Send + Sync {
    /// Current trust for an entity within a tenant
    async fn current_trust(
        &self,
        tenant: &TenantId,
        entity: &EntityId,
    ) -> EngineResult<TrustSnapshot>;
}

/// Synchronous rule evaluation collaborator; always available
#[async_trait]
pub trait RuleEngine: Send + Sync {
    async fn evaluate(&self, intent: &Intent) -> EngineResult<RuleOutcome>;
}

/// Policy evaluation collaborator; wrapped in the `policyEngine` breaker
#[async_trait]
pub trait PolicyEngine: Send + Sync {
    async fn evaluate(&self, intent: &Intent) -> EngineResult<PolicyOutcome>;
}

/// Consent registry collaborator
#[async_trait]
pub trait ConsentRegistry: Send + Sync {
    /// Whether consent of the given type is currently granted
    async fn has_consent(
        &self,
        tenant: &TenantId,
        entity: &EntityId,
        consent_type: &str,
    ) -> EngineResult<bool>;
}

/// Sandbox runtime collaborator
#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn execute(
        &self,
        intent: &Intent,
        limits: &ResourceLimits,
    ) -> EngineResult<ExecutionReport>;
}

/// Cryptographic proof recorder; fire-and-forget from the decision stage
#[async_trait]
pub trait ProofRecorder: Send + Sync {
    async fn record(&self, intent_id: IntentId, decision: &Evaluation) -> EngineResult<()>;
}

/// Collaborator bundle wired into the engine at startup
#[derive(Clone)]
pub struct Collaborators {
    pub trust: Arc<dyn TrustProvider>,
    pub rules: Arc<dyn RuleEngine>,
    pub policy: Arc<dyn PolicyEngine>,
    pub consent: Arc<dyn ConsentRegistry>,
    pub sandbox: Arc<dyn Sandbox>,
    pub proof: Arc<dyn ProofRecorder>,
}

impl Collaborators {
    /// All-static bundle: known trust scores, allow-all rules and policy,
    /// granted consent, instant sandbox success. The development default.
    pub fn statics() -> Self {
        Self {
            trust: Arc::new(StaticTrustProvider::default()),
            rules: Arc::new(StaticRuleEngine::allow()),
            policy: Arc::new(StaticPolicyEngine::allow()),
            consent: Arc::new(StaticConsentRegistry::grant_all()),
            sandbox: Arc::new(StaticSandbox::succeed()),
            proof: Arc::new(NoopProofRecorder),
        }
    }
}

/// Fixed per-entity trust table
#[derive(Default)]
pub struct StaticTrustProvider {
    scores: parking_lot::RwLock<HashMap<String, TrustSnapshot>>,
    default: TrustSnapshot,
}

impl StaticTrustProvider {
    pub fn with_default(default: TrustSnapshot) -> Self {
        Self {
            scores: parking_lot::RwLock::new(HashMap::new()),
            default,
        }
    }

    pub fn set(&self, entity: &EntityId, snapshot: TrustSnapshot) {
        self.scores
            .write()
            .insert(entity.as_str().to_string(), snapshot);
    }
}

#[async_trait]
impl TrustProvider for StaticTrustProvider {
    async fn current_trust(
        &self,
        _tenant: &TenantId,
        entity: &EntityId,
    ) -> EngineResult<TrustSnapshot> {
        Ok(self
            .scores
            .read()
            .get(entity.as_str())
            .copied()
            .unwrap_or(self.default))
    }
}

/// Fixed rule outcome
pub struct StaticRuleEngine {
    outcome: RuleOutcome,
}

impl StaticRuleEngine {
    pub fn allow() -> Self {
        Self::with_action(GovernanceAction::Allow)
    }

    pub fn with_action(action: GovernanceAction) -> Self {
        Self {
            outcome: RuleOutcome {
                action,
                matched_rules: Vec::new(),
            },
        }
    }
}

#[async_trait]
impl RuleEngine for StaticRuleEngine {
    async fn evaluate(&self, _intent: &Intent) -> EngineResult<RuleOutcome> {
        Ok(self.outcome.clone())
    }
}

/// Fixed or failing policy outcome
pub struct StaticPolicyEngine {
    outcome: Option<PolicyOutcome>,
}

impl StaticPolicyEngine {
    pub fn allow() -> Self {
        Self::with_action(GovernanceAction::Allow)
    }

    pub fn with_action(action: GovernanceAction) -> Self {
        Self {
            outcome: Some(PolicyOutcome {
                action,
                matches: Vec::new(),
            }),
        }
    }

    /// A policy engine that always errors (breaker tests)
    pub fn failing() -> Self {
        Self { outcome: None }
    }
}

#[async_trait]
impl PolicyEngine for StaticPolicyEngine {
    async fn evaluate(&self, _intent: &Intent) -> EngineResult<PolicyOutcome> {
        match &self.outcome {
            Some(outcome) => Ok(outcome.clone()),
            None => Err(EngineError::Internal(
                "policy engine unavailable".to_string(),
            )),
        }
    }
}

/// Consent registry with a fixed grant set
pub struct StaticConsentRegistry {
    grant_all: bool,
    revoked: parking_lot::RwLock<HashMap<String, ()>>,
}

impl StaticConsentRegistry {
    pub fn grant_all() -> Self {
        Self {
            grant_all: true,
            revoked: parking_lot::RwLock::new(HashMap::new()),
        }
    }

    pub fn deny_all() -> Self {
        Self {
            grant_all: false,
            revoked: parking_lot::RwLock::new(HashMap::new()),
        }
    }

    pub fn revoke(&self, entity: &EntityId) {
        self.revoked
            .write()
            .insert(entity.as_str().to_string(), ());
    }
}

#[async_trait]
impl ConsentRegistry for StaticConsentRegistry {
    async fn has_consent(
        &self,
        _tenant: &TenantId,
        entity: &EntityId,
        _consent_type: &str,
    ) -> EngineResult<bool> {
        if self.revoked.read().contains_key(entity.as_str()) {
            return Ok(false);
        }
        Ok(self.grant_all)
    }
}

/// Sandbox with a fixed report
pub struct StaticSandbox {
    outcome: ExecutionOutcome,
    error: Option<String>,
}

impl StaticSandbox {
    pub fn succeed() -> Self {
        Self {
            outcome: ExecutionOutcome::Success,
            error: None,
        }
    }

    pub fn with_outcome(outcome: ExecutionOutcome) -> Self {
        Self {
            outcome,
            error: (outcome != ExecutionOutcome::Success)
                .then(|| format!("execution {}", outcome.as_str())),
        }
    }
}

#[async_trait]
impl Sandbox for StaticSandbox {
    async fn execute(
        &self,
        _intent: &Intent,
        _limits: &ResourceLimits,
    ) -> EngineResult<ExecutionReport> {
        Ok(ExecutionReport {
            outcome: self.outcome,
            output: None,
            error: self.error.clone(),
            duration_ms: 1,
            memory_peak_mb: Some(8),
        })
    }
}

/// Proof recorder that drops proofs
pub struct NoopProofRecorder;

#[async_trait]
impl ProofRecorder for NoopProofRecorder {
    async fn record(&self, _intent_id: IntentId, _decision: &Evaluation) -> EngineResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_trust_lookup_and_default() {
        let provider = StaticTrustProvider::with_default(TrustSnapshot { score: 10, level: 1 });
        provider.set(
            &EntityId::new("e1"),
            TrustSnapshot {
                score: 400,
                level: 4,
            },
        );

        let tenant = TenantId::new("t1");
        let known = provider
            .current_trust(&tenant, &EntityId::new("e1"))
            .await
            .unwrap();
        assert_eq!(known.level, 4);

        let unknown = provider
            .current_trust(&tenant, &EntityId::new("e9"))
            .await
            .unwrap();
        assert_eq!(unknown.level, 1);
    }

    #[tokio::test]
    async fn test_consent_revocation() {
        let registry = StaticConsentRegistry::grant_all();
        let tenant = TenantId::new("t1");
        let entity = EntityId::new("e1");
        assert!(registry
            .has_consent(&tenant, &entity, "data_processing")
            .await
            .unwrap());
        registry.revoke(&entity);
        assert!(!registry
            .has_consent(&tenant, &entity, "data_processing")
            .await
            .unwrap());
    }
}
