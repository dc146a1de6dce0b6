//! Webhook subscriptions and persistent delivery records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::IpAddr;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::intent::TenantId;
use crate::observability::TraceContext;

/// Longest response-body prefix kept on a delivery record
pub const MAX_RESPONSE_BODY_BYTES: usize = 1024;

/// A tenant's webhook endpoint registration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSubscription {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub url: String,
    /// AES-GCM envelope (hex nonce || ciphertext); plaintext exists only
    /// transiently in memory
    pub encrypted_secret: String,
    pub enabled: bool,
    /// Event kinds this endpoint receives
    pub events: Vec<String>,
    /// Per-endpoint retry budget override
    pub retry_attempts: Option<u32>,
    /// Per-endpoint retry delay override (milliseconds)
    pub retry_delay_ms: Option<u64>,
    /// IP resolved and validated at registration; deliveries must resolve to
    /// the same address
    pub pinned_ip: IpAddr,
    pub created_at: DateTime<Utc>,
}

impl WebhookSubscription {
    /// Whether this subscription receives the given event kind
    pub fn subscribes_to(&self, event_kind: &str) -> bool {
        self.enabled && self.events.iter().any(|e| e == event_kind || e == "*")
    }
}

/// Delivery lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Retrying,
    Delivered,
    Failed,
}

impl DeliveryStatus {
    /// Permitted transitions: pending→retrying, retrying→retrying,
    /// retrying→delivered, retrying→failed, failed→retrying (replay).
    /// `delivered` is terminal.
    pub fn can_transition_to(&self, next: DeliveryStatus) -> bool {
        use DeliveryStatus::*;
        matches!(
            (self, next),
            (Pending, Retrying)
                | (Retrying, Retrying)
                | (Retrying, Delivered)
                | (Retrying, Failed)
                | (Failed, Retrying)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Retrying => "retrying",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Failed => "failed",
        }
    }
}

/// One delivery of one event to one subscription
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookDelivery {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub tenant_id: TenantId,
    pub event_kind: String,
    pub payload: Value,
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub response_status: Option<u16>,
    /// Response body, truncated to [`MAX_RESPONSE_BODY_BYTES`]
    pub response_body: Option<String>,
    /// The endpoint's breaker was open, so no attempt was made
    pub skipped_by_circuit_breaker: bool,
    pub trace: TraceContext,
    pub created_at: DateTime<Utc>,
}

impl WebhookDelivery {
    /// Create a `pending` record for a subscription and event
    pub fn new(
        subscription: &WebhookSubscription,
        event_kind: &str,
        payload: Value,
        trace: TraceContext,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            subscription_id: subscription.id,
            tenant_id: subscription.tenant_id.clone(),
            event_kind: event_kind.to_string(),
            payload,
            status: DeliveryStatus::Pending,
            attempts: 0,
            last_attempt_at: None,
            last_error: None,
            next_retry_at: None,
            delivered_at: None,
            response_status: None,
            response_body: None,
            skipped_by_circuit_breaker: false,
            trace,
            created_at: Utc::now(),
        }
    }

    /// Apply a status transition, enforcing the delivery state machine
    pub fn transition_to(&mut self, next: DeliveryStatus) -> EngineResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(EngineError::InvalidStateTransition {
                from: self.status.as_str().to_string(),
                to: next.as_str().to_string(),
            });
        }
        self.status = next;
        if next == DeliveryStatus::Delivered {
            self.delivered_at = Some(Utc::now());
            self.next_retry_at = None;
        }
        Ok(())
    }

    /// Record a response body, keeping only the retained prefix
    pub fn set_response_body(&mut self, body: &str) {
        let mut end = body.len().min(MAX_RESPONSE_BODY_BYTES);
        while end > 0 && !body.is_char_boundary(end) {
            end -= 1;
        }
        self.response_body = Some(body[..end].to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn subscription() -> WebhookSubscription {
        WebhookSubscription {
            id: Uuid::new_v4(),
            tenant_id: TenantId::new("t1"),
            url: "https://hooks.example.com/intents".to_string(),
            encrypted_secret: "00".to_string(),
            enabled: true,
            events: vec!["intent.approved".to_string()],
            retry_attempts: None,
            retry_delay_ms: None,
            pinned_ip: "93.184.216.34".parse().unwrap(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_subscription_event_matching() {
        let sub = subscription();
        assert!(sub.subscribes_to("intent.approved"));
        assert!(!sub.subscribes_to("intent.completed"));

        let mut wildcard = subscription();
        wildcard.events = vec!["*".to_string()];
        assert!(wildcard.subscribes_to("intent.completed"));

        let mut disabled = subscription();
        disabled.enabled = false;
        assert!(!disabled.subscribes_to("intent.approved"));
    }

    #[test]
    fn test_delivery_lifecycle() {
        let sub = subscription();
        let mut delivery =
            WebhookDelivery::new(&sub, "intent.approved", json!({}), TraceContext::default());
        delivery.transition_to(DeliveryStatus::Retrying).unwrap();
        delivery.transition_to(DeliveryStatus::Delivered).unwrap();
        assert!(delivery.delivered_at.is_some());

        // Delivered is terminal
        assert!(delivery.transition_to(DeliveryStatus::Retrying).is_err());
    }

    #[test]
    fn test_failed_can_be_replayed() {
        let sub = subscription();
        let mut delivery =
            WebhookDelivery::new(&sub, "intent.approved", json!({}), TraceContext::default());
        delivery.transition_to(DeliveryStatus::Retrying).unwrap();
        delivery.transition_to(DeliveryStatus::Failed).unwrap();
        delivery.transition_to(DeliveryStatus::Retrying).unwrap();
    }

    #[test]
    fn test_pending_cannot_jump_to_delivered() {
        let sub = subscription();
        let mut delivery =
            WebhookDelivery::new(&sub, "intent.approved", json!({}), TraceContext::default());
        assert!(delivery.transition_to(DeliveryStatus::Delivered).is_err());
    }

    #[test]
    fn test_response_body_truncated() {
        let sub = subscription();
        let mut delivery =
            WebhookDelivery::new(&sub, "intent.approved", json!({}), TraceContext::default());
        delivery.set_response_body(&"x".repeat(5000));
        assert_eq!(delivery.response_body.as_ref().unwrap().len(), 1024);
    }
}
