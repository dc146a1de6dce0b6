//! Engine assembly and lifecycle
//!
//! All component handles (stores, resilience singletons, queues, workers,
//! webhook dispatcher, collaborators) are constructed once here and shared
//! by reference; the shutdown coordinator bounds their lifetime. Cyclic
//! component relationships (workers -> service -> queues -> workers) resolve
//! through this registry instead of mutual imports.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

use crate::collaborators::Collaborators;
use crate::config::EngineConfig;
use crate::dedupe::DedupeService;
use crate::error::{EngineError, EngineResult};
use crate::evaluation::{Evaluation, EvaluationRecord};
use crate::eventlog::EventLogWriter;
use crate::intent::{EntityId, Intent, IntentId, IntentStatus, TenantId, TransitionGuards, TrustSnapshot};
use crate::evaluation::TrustSource;
use crate::observability::{EngineMetrics, TraceContext};
use crate::queue::{Stage, StageJob, StageQueue};
use crate::resilience::circuit_breaker::CircuitBreakerRegistry;
use crate::resilience::dlq::DeadLetterQueue;
use crate::resilience::rate_limit::RateLimiter;
use crate::resilience::retry::RetryPolicy;
use crate::shutdown::{ShutdownCoordinator, ShutdownSignal, DEFAULT_DRAIN_DEADLINE};
use crate::store::kv::KvStore;
use crate::store::{
    DeliveryStore, EvaluationStore, EventStore, IntentStore, MemoryKv, MemoryStore,
    SubscriptionStore,
};
use crate::webhooks::dispatcher::WebhookDispatcher;
use crate::webhooks::secret::SecretCipher;
use crate::workers::{DecisionWorker, EvaluateWorker, ExecuteWorker, IntakeWorker};

/// Trust cache TTL used when the trust engine is unreachable
const TRUST_CACHE_TTL: Duration = Duration::from_secs(600);

/// Shared component registry
pub struct EngineCore {
    pub config: EngineConfig,
    pub intents: Arc<dyn IntentStore>,
    pub events: Arc<dyn EventStore>,
    pub evaluations: Arc<dyn EvaluationStore>,
    pub kv: Arc<dyn KvStore>,
    pub eventlog: Arc<EventLogWriter>,
    pub dedupe: Arc<DedupeService>,
    pub rate_limiter: Arc<RateLimiter>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub queues: HashMap<Stage, Arc<StageQueue>>,
    pub dlq: Arc<DeadLetterQueue>,
    pub retry: RetryPolicy,
    pub webhooks: Arc<WebhookDispatcher>,
    pub collaborators: Collaborators,
    pub cipher: Arc<SecretCipher>,
    pub metrics: Arc<EngineMetrics>,
    pub shutdown: ShutdownCoordinator,
    sandbox_slots: Arc<Semaphore>,
    side_tasks: Mutex<Vec<JoinHandle<()>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    workers_started: AtomicBool,
}

impl EngineCore {
    pub fn queue(&self, stage: Stage) -> Arc<StageQueue> {
        self.queues[&stage].clone()
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.signal()
    }

    /// Enqueue a stage job
    pub fn enqueue(&self, job: StageJob) -> EngineResult<()> {
        self.queues
            .get(&job.stage)
            .ok_or_else(|| EngineError::EnqueueFailed(format!("no queue for stage {}", job.stage)))?
            .push(job)
    }

    /// Acquire a sandbox execution slot
    pub async fn sandbox_permit(&self) -> OwnedSemaphorePermit {
        self.sandbox_slots
            .clone()
            .acquire_owned()
            .await
            .unwrap_or_else(|_| unreachable!("sandbox semaphore is never closed"))
    }

    /// Current trust through the `trustEngine` breaker, with cached and
    /// zero-default fallbacks
    pub async fn fetch_trust(
        &self,
        tenant: &TenantId,
        entity: &EntityId,
    ) -> (TrustSnapshot, TrustSource) {
        let cache_key = format!("trust:cache:{}:{}", tenant, entity);
        let breaker = self.breakers.get("trustEngine");
        let trust_provider = self.collaborators.trust.clone();

        let result = breaker
            .execute(|| async { trust_provider.current_trust(tenant, entity).await })
            .await;

        match result {
            Ok(snapshot) => {
                if let Ok(encoded) = serde_json::to_string(&snapshot) {
                    let _ = self
                        .kv
                        .set(&cache_key, &encoded, Some(TRUST_CACHE_TTL))
                        .await;
                }
                (snapshot, TrustSource::Live)
            }
            Err(error) => {
                tracing::warn!(
                    tenant = %tenant,
                    entity = %entity,
                    error = %error,
                    "trust fetch degraded"
                );
                self.metrics.trust_degradations.inc();
                match self.kv.get(&cache_key).await.ok().flatten() {
                    Some(cached) => match serde_json::from_str(&cached) {
                        Ok(snapshot) => (snapshot, TrustSource::Cached),
                        Err(_) => (TrustSnapshot::default(), TrustSource::Default),
                    },
                    None => (TrustSnapshot::default(), TrustSource::Default),
                }
            }
        }
    }

    /// Persist an evaluation record
    pub async fn record_evaluation(
        &self,
        intent_id: IntentId,
        evaluation: Evaluation,
    ) -> EngineResult<()> {
        self.evaluations
            .record_evaluation(&EvaluationRecord::new(intent_id, evaluation))
            .await
    }

    /// Apply a validated status transition: mutate, persist, append the
    /// transition event, and account metrics.
    pub async fn transition_intent(
        &self,
        intent: &mut Intent,
        to: IntentStatus,
        guards: TransitionGuards,
        event_payload: Value,
    ) -> EngineResult<()> {
        let from = intent.status;
        intent.transition_to(to, guards)?;
        self.intents.update_intent(intent).await?;
        self.eventlog
            .append(intent.id, to.event_type(), event_payload)
            .await?;

        self.metrics
            .status_transitions
            .with_label_values(&[from.as_str(), to.as_str()])
            .inc();
        self.metrics
            .intents_by_status
            .with_label_values(&[from.as_str()])
            .dec();
        self.metrics
            .intents_by_status
            .with_label_values(&[to.as_str()])
            .inc();
        Ok(())
    }

    /// Fire-and-forget webhook emission for an intent event
    pub fn emit_intent_webhook(&self, intent: &Intent, kind: &str, trace: &TraceContext) {
        let payload = serde_json::json!({
            "event": kind,
            "intent_id": intent.id.to_string(),
            "tenant_id": intent.tenant_id.as_str(),
            "entity_id": intent.entity_id.as_str(),
            "status": intent.status.as_str(),
            "intent_type": intent.intent_type,
            "occurred_at": chrono::Utc::now().timestamp(),
        });
        let webhooks = self.webhooks.clone();
        let tenant = intent.tenant_id.clone();
        let kind = kind.to_string();
        let trace = trace.child();
        self.spawn_side_task(async move {
            if let Err(error) = webhooks.dispatch(&tenant, &kind, payload, &trace).await {
                tracing::warn!(error = %error, event = %kind, "webhook dispatch failed");
            }
        });
    }

    /// Fire-and-forget proof recording
    pub fn record_proof(&self, intent_id: IntentId, decision: Evaluation) {
        let proof = self.collaborators.proof.clone();
        self.spawn_side_task(async move {
            if let Err(error) = proof.record(intent_id, &decision).await {
                tracing::warn!(intent_id = %intent_id, error = %error, "proof recording failed");
            }
        });
    }

    /// Run a task on the bounded side pool sharing the shutdown lifetime.
    /// Failures are logged by the task itself, never propagated.
    pub fn spawn_side_task<F>(&self, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(future);
        let mut tasks = self.side_tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    /// Mark an intent failed after its job dead-lettered
    pub async fn mark_intent_failed(
        &self,
        job: &StageJob,
        error: &EngineError,
    ) -> EngineResult<()> {
        let Some(mut intent) = self.intents.get_intent(&job.intent_id, &job.tenant_id).await?
        else {
            return Ok(());
        };
        if intent.status.is_terminal() {
            return Ok(());
        }

        self.record_evaluation(
            intent.id,
            Evaluation::Error {
                message: error.to_string(),
                error_kind: error.kind().to_string(),
            },
        )
        .await?;

        let guards = TransitionGuards {
            // Failure is reachable from every non-terminal state except
            // through the executing path's own handler; bypass validation so
            // an exhausted intake job can still fail the intent.
            skip_validation: true,
            ..Default::default()
        };
        self.transition_intent(
            &mut intent,
            IntentStatus::Failed,
            guards,
            serde_json::json!({
                "stage": job.stage.as_str(),
                "attempts": job.attempts_made,
                "error": error.to_string(),
            }),
        )
        .await
    }
}

/// The intent governance engine
#[derive(Clone)]
pub struct Engine {
    pub core: Arc<EngineCore>,
}

impl Engine {
    /// Start building an engine
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    /// Component registry handle
    pub fn core(&self) -> &Arc<EngineCore> {
        &self.core
    }

    /// Engine metrics handle
    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.core.metrics
    }

    /// Start the stage worker pools. Idempotent.
    pub fn start(&self) {
        if self
            .core
            .workers_started
            .swap(true, Ordering::SeqCst)
        {
            return;
        }

        let concurrency = self.core.config.queue_concurrency;
        let execute_concurrency = concurrency.min(self.core.config.cognigate.max_concurrent);

        let mut handles = Vec::new();
        handles.extend(crate::workers::spawn_stage_workers(
            self.core.clone(),
            Arc::new(IntakeWorker::new(self.core.clone())),
            concurrency,
        ));
        handles.extend(crate::workers::spawn_stage_workers(
            self.core.clone(),
            Arc::new(EvaluateWorker::new(self.core.clone())),
            concurrency,
        ));
        handles.extend(crate::workers::spawn_stage_workers(
            self.core.clone(),
            Arc::new(DecisionWorker::new(self.core.clone())),
            concurrency,
        ));
        handles.extend(crate::workers::spawn_stage_workers(
            self.core.clone(),
            Arc::new(ExecuteWorker::new(self.core.clone())),
            execute_concurrency,
        ));

        self.core.workers.lock().extend(handles);
        tracing::info!(
            concurrency,
            execute_concurrency,
            "stage workers started"
        );
    }

    /// Graceful shutdown: quiesce intake, drain workers under the deadline,
    /// then force close.
    pub async fn shutdown(&self, deadline: Option<Duration>) {
        let deadline = deadline.unwrap_or(DEFAULT_DRAIN_DEADLINE);
        let workers: Vec<JoinHandle<()>> = self.core.workers.lock().drain(..).collect();
        self.core.shutdown.drain(workers, deadline).await;

        // Side tasks (webhooks, proofs) get the remainder of the deadline
        let side: Vec<JoinHandle<()>> = self.core.side_tasks.lock().drain(..).collect();
        for task in side {
            if !task.is_finished() {
                task.abort();
            }
        }
        tracing::info!("engine shut down");
    }

    /// Whether the engine is refusing new work
    pub fn is_shutting_down(&self) -> bool {
        self.core.shutdown.signal().is_shutting_down()
    }
}

/// Builder wiring stores, collaborators, and configuration
pub struct EngineBuilder {
    config: EngineConfig,
    collaborators: Option<Collaborators>,
    registry: Option<prometheus::Registry>,
    kv: Option<Arc<dyn KvStore>>,
    event_store: Option<Arc<dyn EventStore>>,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self {
            config: EngineConfig::default(),
            collaborators: None,
            registry: None,
            kv: None,
            event_store: None,
        }
    }
}

impl EngineBuilder {
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_collaborators(mut self, collaborators: Collaborators) -> Self {
        self.collaborators = Some(collaborators);
        self
    }

    /// Register metrics on an existing registry (exposition lives with the
    /// metrics collaborator)
    pub fn with_registry(mut self, registry: prometheus::Registry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Use a shared ephemeral store (defaults to in-process)
    pub fn with_kv(mut self, kv: Arc<dyn KvStore>) -> Self {
        self.kv = Some(kv);
        self
    }

    /// Use a durable event store (defaults to in-process; see
    /// [`crate::store::sled_archive::SledEventStore`])
    pub fn with_event_store(mut self, events: Arc<dyn EventStore>) -> Self {
        self.event_store = Some(events);
        self
    }

    /// Assemble the engine. Workers are not started; call
    /// [`Engine::start`].
    pub fn build(self) -> EngineResult<Engine> {
        self.config.validate()?;
        let config = self.config;

        let registry = self.registry.unwrap_or_default();
        let metrics = Arc::new(EngineMetrics::new(&registry)?);

        let memory = Arc::new(MemoryStore::new());
        let intents: Arc<dyn IntentStore> = memory.clone();
        let events: Arc<dyn EventStore> = self.event_store.unwrap_or_else(|| memory.clone());
        let evaluations: Arc<dyn EvaluationStore> = memory.clone();
        let subscriptions: Arc<dyn SubscriptionStore> = memory.clone();
        let deliveries: Arc<dyn DeliveryStore> = memory.clone();
        let kv: Arc<dyn KvStore> = self.kv.unwrap_or_else(|| Arc::new(MemoryKv::new()));

        let eventlog = Arc::new(EventLogWriter::new(events.clone()));
        let dedupe = Arc::new(DedupeService::new(
            kv.clone(),
            intents.clone(),
            config.dedupe.clone(),
            metrics.clone(),
        ));
        let rate_limiter = Arc::new(RateLimiter::new(
            kv.clone(),
            config.rate_limits.clone(),
            metrics.clone(),
        ));
        let breakers = Arc::new(CircuitBreakerRegistry::new(
            kv.clone(),
            config.circuit_breakers.clone(),
            metrics.clone(),
        ));

        let cipher = Arc::new(match &config.encryption_key {
            Some(key) => SecretCipher::from_hex(key)?,
            None => SecretCipher::ephemeral(),
        });
        let webhooks = Arc::new(WebhookDispatcher::new(
            subscriptions,
            deliveries,
            breakers.clone(),
            cipher.clone(),
            config.webhook.clone(),
            config.production,
            metrics.clone(),
        ));

        let lease = config.job_lease();
        let queues: HashMap<Stage, Arc<StageQueue>> = Stage::all()
            .into_iter()
            .map(|stage| {
                (
                    stage,
                    Arc::new(StageQueue::new(stage, lease, metrics.clone())),
                )
            })
            .collect();

        let dlq = Arc::new(DeadLetterQueue::new(metrics.clone()));
        let retry = RetryPolicy::new(config.max_retries, config.retry_backoff_ms);
        let sandbox_slots = Arc::new(Semaphore::new(config.cognigate.max_concurrent));
        let collaborators = self.collaborators.unwrap_or_else(Collaborators::statics);

        let core = EngineCore {
            config,
            intents,
            events,
            evaluations,
            kv,
            eventlog,
            dedupe,
            rate_limiter,
            breakers,
            queues,
            dlq,
            retry,
            webhooks,
            collaborators,
            cipher,
            metrics,
            shutdown: ShutdownCoordinator::new(),
            sandbox_slots,
            side_tasks: Mutex::new(Vec::new()),
            workers: Mutex::new(Vec::new()),
            workers_started: AtomicBool::new(false),
        };

        Ok(Engine {
            core: Arc::new(core),
        })
    }
}
