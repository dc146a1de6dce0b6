//! Durable and ephemeral storage seams
//!
//! The relational database is an external collaborator; the engine talks to
//! it through these traits. The in-process [`MemoryStore`] is the default
//! realization (and the one the test suite runs against); the sled-backed
//! event archive in `vorion-lockchain` backs [`sled_archive::SledEventStore`]
//! for single-node durability.

pub mod kv;
pub mod memory;
pub mod sled_archive;

pub use kv::{KvStore, MemoryKv};
pub use memory::MemoryStore;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::EngineResult;
use crate::evaluation::EvaluationRecord;
use crate::eventlog::IntentEvent;
use crate::intent::{EntityId, Intent, IntentId, IntentStatus, TenantId};
use crate::webhooks::delivery::{WebhookDelivery, WebhookSubscription};

/// Listing filter for intents
#[derive(Debug, Clone)]
pub struct IntentFilter {
    pub tenant_id: TenantId,
    pub entity_id: Option<EntityId>,
    pub status: Option<IntentStatus>,
    pub include_deleted: bool,
    pub limit: usize,
    pub offset: u64,
}

/// One page of a listing
#[derive(Debug, Clone)]
pub struct IntentPage {
    pub items: Vec<Intent>,
    pub limit: usize,
    pub offset: u64,
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

/// Durable intent rows.
///
/// Implementations enforce the (tenant, fingerprint) uniqueness invariant
/// over non-soft-deleted rows on insert.
#[async_trait]
pub trait IntentStore: Send + Sync {
    /// Insert a new intent. Fails with `Conflict` when a live row with the
    /// same (tenant, fingerprint) exists.
    async fn insert_intent(&self, intent: &Intent) -> EngineResult<()>;

    /// Fetch by id within a tenant. Soft-deleted rows are returned (callers
    /// filter when appropriate).
    async fn get_intent(&self, id: &IntentId, tenant: &TenantId) -> EngineResult<Option<Intent>>;

    /// Find the live intent carrying a fingerprint
    async fn find_by_fingerprint(
        &self,
        tenant: &TenantId,
        fingerprint: &str,
    ) -> EngineResult<Option<Intent>>;

    /// Persist updated intent fields
    async fn update_intent(&self, intent: &Intent) -> EngineResult<()>;

    /// Remove a row entirely. Compensation path for a failed initial event
    /// append; not part of the public surface.
    async fn remove_intent(&self, id: &IntentId) -> EngineResult<()>;

    /// List intents for a tenant
    async fn list_intents(&self, filter: &IntentFilter) -> EngineResult<IntentPage>;

    /// Count non-terminal, non-deleted intents for a tenant
    async fn count_active(&self, tenant: &TenantId) -> EngineResult<u64>;
}

/// Append-only event rows.
///
/// Chain ordering is the [`crate::eventlog::EventLogWriter`]'s
/// responsibility; implementations persist and page.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Persist an event at its sequence position
    async fn append_event(&self, event: &IntentEvent) -> EngineResult<()>;

    /// Latest event for an intent, if any
    async fn latest_event(&self, intent_id: &IntentId) -> EngineResult<Option<IntentEvent>>;

    /// Events for an intent ordered by sequence, starting at `offset`
    async fn events_page(
        &self,
        intent_id: &IntentId,
        offset: u64,
        limit: usize,
    ) -> EngineResult<Vec<IntentEvent>>;

    /// Total events recorded for an intent
    async fn event_count(&self, intent_id: &IntentId) -> EngineResult<u64>;
}

/// Append-only evaluation rows
#[async_trait]
pub trait EvaluationStore: Send + Sync {
    async fn record_evaluation(&self, record: &EvaluationRecord) -> EngineResult<()>;

    async fn evaluations_for(&self, intent_id: &IntentId) -> EngineResult<Vec<EvaluationRecord>>;
}

/// Webhook subscription rows
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn put_subscription(&self, subscription: &WebhookSubscription) -> EngineResult<()>;

    async fn get_subscription(
        &self,
        tenant: &TenantId,
        id: &Uuid,
    ) -> EngineResult<Option<WebhookSubscription>>;

    async fn remove_subscription(&self, tenant: &TenantId, id: &Uuid) -> EngineResult<bool>;

    async fn subscriptions_for(&self, tenant: &TenantId)
        -> EngineResult<Vec<WebhookSubscription>>;
}

/// Persistent webhook delivery records
#[async_trait]
pub trait DeliveryStore: Send + Sync {
    async fn create_delivery(&self, delivery: &WebhookDelivery) -> EngineResult<()>;

    async fn update_delivery(&self, delivery: &WebhookDelivery) -> EngineResult<()>;

    async fn get_delivery(
        &self,
        tenant: &TenantId,
        id: &Uuid,
    ) -> EngineResult<Option<WebhookDelivery>>;

    /// Delivery history for a subscription, newest first
    async fn deliveries_for_subscription(
        &self,
        tenant: &TenantId,
        subscription_id: &Uuid,
        offset: u64,
        limit: usize,
    ) -> EngineResult<Vec<WebhookDelivery>>;

    /// Deliveries in `retrying` whose `next_retry_at` has passed
    async fn due_retries(
        &self,
        now: chrono::DateTime<chrono::Utc>,
        limit: usize,
    ) -> EngineResult<Vec<WebhookDelivery>>;
}
