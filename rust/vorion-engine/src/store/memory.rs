//! In-process store implementation
//!
//! The default realization of the durable-store traits. Backs the engine in
//! tests and single-node development; production deployments swap in the
//! relational collaborator.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::evaluation::EvaluationRecord;
use crate::eventlog::IntentEvent;
use crate::intent::{Intent, IntentId, TenantId};
use crate::store::{
    DeliveryStore, EvaluationStore, EventStore, IntentFilter, IntentPage, IntentStore,
    SubscriptionStore,
};
use crate::webhooks::delivery::{DeliveryStatus, WebhookDelivery, WebhookSubscription};

#[derive(Default)]
struct StoreInner {
    intents: HashMap<IntentId, Intent>,
    /// (tenant, fingerprint) -> id, live rows only
    fingerprints: HashMap<(String, String), IntentId>,
    events: HashMap<IntentId, Vec<IntentEvent>>,
    evaluations: HashMap<IntentId, Vec<EvaluationRecord>>,
    subscriptions: HashMap<(String, Uuid), WebhookSubscription>,
    deliveries: HashMap<Uuid, WebhookDelivery>,
}

/// In-process implementation of every durable-store trait
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<StoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn fingerprint_key(tenant: &TenantId, fingerprint: &str) -> (String, String) {
        (tenant.as_str().to_string(), fingerprint.to_string())
    }
}

#[async_trait]
impl IntentStore for MemoryStore {
    async fn insert_intent(&self, intent: &Intent) -> EngineResult<()> {
        let mut inner = self.inner.write();
        let key = Self::fingerprint_key(&intent.tenant_id, &intent.dedupe_fingerprint);
        if inner.fingerprints.contains_key(&key) {
            return Err(EngineError::Conflict(format!(
                "intent with fingerprint {} already exists for tenant {}",
                intent.dedupe_fingerprint, intent.tenant_id
            )));
        }
        inner.fingerprints.insert(key, intent.id);
        inner.intents.insert(intent.id, intent.clone());
        Ok(())
    }

    async fn get_intent(&self, id: &IntentId, tenant: &TenantId) -> EngineResult<Option<Intent>> {
        let inner = self.inner.read();
        Ok(inner
            .intents
            .get(id)
            .filter(|i| i.tenant_id == *tenant)
            .cloned())
    }

    async fn find_by_fingerprint(
        &self,
        tenant: &TenantId,
        fingerprint: &str,
    ) -> EngineResult<Option<Intent>> {
        let inner = self.inner.read();
        let key = Self::fingerprint_key(tenant, fingerprint);
        Ok(inner
            .fingerprints
            .get(&key)
            .and_then(|id| inner.intents.get(id))
            .cloned())
    }

    async fn update_intent(&self, intent: &Intent) -> EngineResult<()> {
        let mut inner = self.inner.write();
        if !inner.intents.contains_key(&intent.id) {
            return Err(EngineError::NotFound(format!("intent {}", intent.id)));
        }
        // Soft deletion releases the fingerprint for reuse
        if intent.is_deleted() {
            let key = Self::fingerprint_key(&intent.tenant_id, &intent.dedupe_fingerprint);
            if inner.fingerprints.get(&key) == Some(&intent.id) {
                inner.fingerprints.remove(&key);
            }
        }
        inner.intents.insert(intent.id, intent.clone());
        Ok(())
    }

    async fn remove_intent(&self, id: &IntentId) -> EngineResult<()> {
        let mut inner = self.inner.write();
        if let Some(intent) = inner.intents.remove(id) {
            let key = Self::fingerprint_key(&intent.tenant_id, &intent.dedupe_fingerprint);
            if inner.fingerprints.get(&key) == Some(id) {
                inner.fingerprints.remove(&key);
            }
            inner.events.remove(id);
            inner.evaluations.remove(id);
        }
        Ok(())
    }

    async fn list_intents(&self, filter: &IntentFilter) -> EngineResult<IntentPage> {
        let inner = self.inner.read();
        let mut matches: Vec<&Intent> = inner
            .intents
            .values()
            .filter(|i| i.tenant_id == filter.tenant_id)
            .filter(|i| filter.include_deleted || !i.is_deleted())
            .filter(|i| {
                filter
                    .entity_id
                    .as_ref()
                    .map(|e| i.entity_id == *e)
                    .unwrap_or(true)
            })
            .filter(|i| filter.status.map(|s| i.status == s).unwrap_or(true))
            .collect();
        matches.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.0.cmp(&b.id.0)));

        let total = matches.len() as u64;
        let items: Vec<Intent> = matches
            .into_iter()
            .skip(filter.offset as usize)
            .take(filter.limit)
            .cloned()
            .collect();
        let consumed = filter.offset + items.len() as u64;
        let has_more = consumed < total;

        Ok(IntentPage {
            items,
            limit: filter.limit,
            offset: filter.offset,
            next_cursor: has_more.then(|| consumed.to_string()),
            has_more,
        })
    }

    async fn count_active(&self, tenant: &TenantId) -> EngineResult<u64> {
        let inner = self.inner.read();
        Ok(inner
            .intents
            .values()
            .filter(|i| i.tenant_id == *tenant && !i.is_deleted() && !i.status.is_terminal())
            .count() as u64)
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn append_event(&self, event: &IntentEvent) -> EngineResult<()> {
        let mut inner = self.inner.write();
        let chain = inner.events.entry(event.intent_id).or_default();
        if chain.len() as u64 != event.seq {
            return Err(EngineError::Conflict(format!(
                "event sequence {} out of order for intent {} (expected {})",
                event.seq,
                event.intent_id,
                chain.len()
            )));
        }
        chain.push(event.clone());
        Ok(())
    }

    async fn latest_event(&self, intent_id: &IntentId) -> EngineResult<Option<IntentEvent>> {
        let inner = self.inner.read();
        Ok(inner
            .events
            .get(intent_id)
            .and_then(|chain| chain.last())
            .cloned())
    }

    async fn events_page(
        &self,
        intent_id: &IntentId,
        offset: u64,
        limit: usize,
    ) -> EngineResult<Vec<IntentEvent>> {
        let inner = self.inner.read();
        Ok(inner
            .events
            .get(intent_id)
            .map(|chain| {
                chain
                    .iter()
                    .skip(offset as usize)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn event_count(&self, intent_id: &IntentId) -> EngineResult<u64> {
        let inner = self.inner.read();
        Ok(inner.events.get(intent_id).map(|c| c.len() as u64).unwrap_or(0))
    }
}

#[async_trait]
impl EvaluationStore for MemoryStore {
    async fn record_evaluation(&self, record: &EvaluationRecord) -> EngineResult<()> {
        let mut inner = self.inner.write();
        inner
            .evaluations
            .entry(record.intent_id)
            .or_default()
            .push(record.clone());
        Ok(())
    }

    async fn evaluations_for(&self, intent_id: &IntentId) -> EngineResult<Vec<EvaluationRecord>> {
        let inner = self.inner.read();
        Ok(inner.evaluations.get(intent_id).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl SubscriptionStore for MemoryStore {
    async fn put_subscription(&self, subscription: &WebhookSubscription) -> EngineResult<()> {
        let mut inner = self.inner.write();
        inner.subscriptions.insert(
            (subscription.tenant_id.as_str().to_string(), subscription.id),
            subscription.clone(),
        );
        Ok(())
    }

    async fn get_subscription(
        &self,
        tenant: &TenantId,
        id: &Uuid,
    ) -> EngineResult<Option<WebhookSubscription>> {
        let inner = self.inner.read();
        Ok(inner
            .subscriptions
            .get(&(tenant.as_str().to_string(), *id))
            .cloned())
    }

    async fn remove_subscription(&self, tenant: &TenantId, id: &Uuid) -> EngineResult<bool> {
        let mut inner = self.inner.write();
        Ok(inner
            .subscriptions
            .remove(&(tenant.as_str().to_string(), *id))
            .is_some())
    }

    async fn subscriptions_for(
        &self,
        tenant: &TenantId,
    ) -> EngineResult<Vec<WebhookSubscription>> {
        let inner = self.inner.read();
        let mut subs: Vec<WebhookSubscription> = inner
            .subscriptions
            .values()
            .filter(|s| s.tenant_id == *tenant)
            .cloned()
            .collect();
        subs.sort_by_key(|s| s.created_at);
        Ok(subs)
    }
}

#[async_trait]
impl DeliveryStore for MemoryStore {
    async fn create_delivery(&self, delivery: &WebhookDelivery) -> EngineResult<()> {
        let mut inner = self.inner.write();
        inner.deliveries.insert(delivery.id, delivery.clone());
        Ok(())
    }

    async fn update_delivery(&self, delivery: &WebhookDelivery) -> EngineResult<()> {
        let mut inner = self.inner.write();
        if !inner.deliveries.contains_key(&delivery.id) {
            return Err(EngineError::NotFound(format!("delivery {}", delivery.id)));
        }
        inner.deliveries.insert(delivery.id, delivery.clone());
        Ok(())
    }

    async fn get_delivery(
        &self,
        tenant: &TenantId,
        id: &Uuid,
    ) -> EngineResult<Option<WebhookDelivery>> {
        let inner = self.inner.read();
        Ok(inner
            .deliveries
            .get(id)
            .filter(|d| d.tenant_id == *tenant)
            .cloned())
    }

    async fn deliveries_for_subscription(
        &self,
        tenant: &TenantId,
        subscription_id: &Uuid,
        offset: u64,
        limit: usize,
    ) -> EngineResult<Vec<WebhookDelivery>> {
        let inner = self.inner.read();
        let mut matches: Vec<&WebhookDelivery> = inner
            .deliveries
            .values()
            .filter(|d| d.tenant_id == *tenant && d.subscription_id == *subscription_id)
            .collect();
        matches.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(matches
            .into_iter()
            .skip(offset as usize)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn due_retries(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> EngineResult<Vec<WebhookDelivery>> {
        let inner = self.inner.read();
        let mut due: Vec<&WebhookDelivery> = inner
            .deliveries
            .values()
            .filter(|d| {
                d.status == DeliveryStatus::Retrying
                    && d.next_retry_at.map(|t| t <= now).unwrap_or(false)
            })
            .collect();
        due.sort_by_key(|d| d.next_retry_at);
        Ok(due.into_iter().take(limit).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::{EntityId, IntentStatus, TrustSnapshot};
    use serde_json::json;

    fn intent(tenant: &str, fingerprint: &str) -> Intent {
        Intent {
            id: IntentId::new(),
            tenant_id: TenantId::new(tenant),
            entity_id: EntityId::new("e1"),
            goal: "g".to_string(),
            intent_type: None,
            priority: 0,
            context: json!({}),
            metadata: json!({}),
            status: IntentStatus::Pending,
            trust_snapshot: TrustSnapshot::default(),
            current_trust: TrustSnapshot::default(),
            dedupe_fingerprint: fingerprint.to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            deleted_at: None,
            cancelled_at: None,
            cancellation_reason: None,
        }
    }

    #[tokio::test]
    async fn test_fingerprint_uniqueness_per_tenant() {
        let store = MemoryStore::new();
        store.insert_intent(&intent("t1", "fp")).await.unwrap();
        assert!(matches!(
            store.insert_intent(&intent("t1", "fp")).await,
            Err(EngineError::Conflict(_))
        ));
        // A different tenant may reuse the fingerprint
        store.insert_intent(&intent("t2", "fp")).await.unwrap();
    }

    #[tokio::test]
    async fn test_soft_delete_releases_fingerprint() {
        let store = MemoryStore::new();
        let mut first = intent("t1", "fp");
        store.insert_intent(&first).await.unwrap();

        first.deleted_at = Some(Utc::now());
        store.update_intent(&first).await.unwrap();

        store.insert_intent(&intent("t1", "fp")).await.unwrap();
    }

    #[tokio::test]
    async fn test_count_active_excludes_terminal() {
        let store = MemoryStore::new();
        let tenant = TenantId::new("t1");
        let mut a = intent("t1", "fp-a");
        a.status = IntentStatus::Evaluating;
        let mut b = intent("t1", "fp-b");
        b.status = IntentStatus::Completed;
        store.insert_intent(&a).await.unwrap();
        store.insert_intent(&b).await.unwrap();
        assert_eq!(store.count_active(&tenant).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_list_pagination() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store
                .insert_intent(&intent("t1", &format!("fp{}", i)))
                .await
                .unwrap();
        }
        let filter = IntentFilter {
            tenant_id: TenantId::new("t1"),
            entity_id: None,
            status: None,
            include_deleted: false,
            limit: 2,
            offset: 0,
        };
        let page = store.list_intents(&filter).await.unwrap();
        assert_eq!(page.items.len(), 2);
        assert!(page.has_more);
        assert_eq!(page.next_cursor.as_deref(), Some("2"));

        let last = store
            .list_intents(&IntentFilter {
                offset: 4,
                ..filter
            })
            .await
            .unwrap();
        assert_eq!(last.items.len(), 1);
        assert!(!last.has_more);
        assert!(last.next_cursor.is_none());
    }

    #[tokio::test]
    async fn test_out_of_order_event_rejected() {
        let store = MemoryStore::new();
        let intent_id = IntentId::new();
        let event = IntentEvent {
            id: Uuid::new_v4(),
            intent_id,
            seq: 3,
            event_type: "intent.submitted".to_string(),
            payload: json!({}),
            occurred_at: Utc::now(),
            hash: "h".to_string(),
            previous_hash: "p".to_string(),
        };
        assert!(matches!(
            store.append_event(&event).await,
            Err(EngineError::Conflict(_))
        ));
    }
}
