//! Webhook dispatcher: fan-out delivery with signing, pinning, and breakers
//!
//! Dispatch creates a pending delivery record per eligible subscription and
//! delivers in parallel under a concurrency bound; one endpoint's failure
//! never affects its peers. Each endpoint has its own circuit breaker keyed
//! into the shared store, and every attempt re-checks the DNS pin before
//! connecting to the pinned address.

use chrono::Utc;
use futures::future::join_all;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use uuid::Uuid;
use vorion_lockchain::canonical_json;

use crate::config::WebhookConfig;
use crate::error::{EngineError, EngineResult};
use crate::intent::TenantId;
use crate::observability::{EngineMetrics, TraceContext};
use crate::resilience::circuit_breaker::{BreakerStatus, CircuitBreakerRegistry};
use crate::store::{DeliveryStore, SubscriptionStore};
use crate::webhooks::delivery::{DeliveryStatus, WebhookDelivery, WebhookSubscription};
use crate::webhooks::secret::SecretCipher;
use crate::webhooks::signature::generate_signature;
use crate::webhooks::ssrf;

/// Registration request
#[derive(Debug, Clone)]
pub struct RegisterWebhookRequest {
    pub url: String,
    /// Generated when absent; returned to the caller exactly once
    pub secret: Option<String>,
    pub enabled: bool,
    pub events: Vec<String>,
    pub retry_attempts: Option<u32>,
    pub retry_delay_ms: Option<u64>,
}

/// Registration result
#[derive(Debug, Clone)]
pub struct RegisteredWebhook {
    pub id: Uuid,
    /// Plaintext secret; persisted only as an encrypted envelope
    pub secret: String,
}

/// Fan-out delivery service
pub struct WebhookDispatcher {
    subscriptions: Arc<dyn SubscriptionStore>,
    deliveries: Arc<dyn DeliveryStore>,
    breakers: Arc<CircuitBreakerRegistry>,
    cipher: Arc<SecretCipher>,
    config: WebhookConfig,
    production: bool,
    metrics: Arc<EngineMetrics>,
    semaphore: Arc<Semaphore>,
}

impl WebhookDispatcher {
    pub fn new(
        subscriptions: Arc<dyn SubscriptionStore>,
        deliveries: Arc<dyn DeliveryStore>,
        breakers: Arc<CircuitBreakerRegistry>,
        cipher: Arc<SecretCipher>,
        config: WebhookConfig,
        production: bool,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        let permits = config.dispatch_concurrency;
        Self {
            subscriptions,
            deliveries,
            breakers,
            cipher,
            config,
            production,
            metrics,
            semaphore: Arc::new(Semaphore::new(permits)),
        }
    }

    fn breaker_key(tenant: &TenantId, subscription_id: &Uuid) -> String {
        format!("webhook:circuit:{}:{}", tenant, subscription_id)
    }

    /// Register a webhook endpoint for a tenant.
    ///
    /// Applies the SSRF guard, resolves and pins DNS, and encrypts the
    /// secret before persistence.
    pub async fn register(
        &self,
        tenant: &TenantId,
        request: RegisterWebhookRequest,
    ) -> EngineResult<RegisteredWebhook> {
        if request.events.is_empty() {
            return Err(EngineError::Validation(
                "webhook must subscribe to at least one event".to_string(),
            ));
        }
        let endpoint = ssrf::validate_and_pin(&request.url, self.production).await?;

        let secret = request.secret.unwrap_or_else(|| {
            use rand::RngCore;
            let mut bytes = [0u8; 24];
            rand::thread_rng().fill_bytes(&mut bytes);
            format!("whsec_{}", hex::encode(bytes))
        });
        let encrypted_secret = self.cipher.encrypt(&secret)?;

        let subscription = WebhookSubscription {
            id: Uuid::new_v4(),
            tenant_id: tenant.clone(),
            url: endpoint.url.to_string(),
            encrypted_secret,
            enabled: request.enabled,
            events: request.events,
            retry_attempts: request.retry_attempts,
            retry_delay_ms: request.retry_delay_ms,
            pinned_ip: endpoint.pinned_ip,
            created_at: Utc::now(),
        };
        self.subscriptions.put_subscription(&subscription).await?;

        tracing::info!(
            tenant = %tenant,
            webhook_id = %subscription.id,
            host = %endpoint.host,
            pinned_ip = %endpoint.pinned_ip,
            "webhook registered"
        );
        Ok(RegisteredWebhook {
            id: subscription.id,
            secret,
        })
    }

    /// Remove a registration
    pub async fn unregister(&self, tenant: &TenantId, id: &Uuid) -> EngineResult<bool> {
        self.subscriptions.remove_subscription(tenant, id).await
    }

    /// List a tenant's registrations
    pub async fn list(&self, tenant: &TenantId) -> EngineResult<Vec<WebhookSubscription>> {
        self.subscriptions.subscriptions_for(tenant).await
    }

    /// Breaker status for one endpoint
    pub async fn circuit_status(
        &self,
        tenant: &TenantId,
        id: &Uuid,
    ) -> EngineResult<BreakerStatus> {
        self.endpoint_breaker(tenant, id).status().await
    }

    /// Reset one endpoint's breaker
    pub async fn reset_circuit(&self, tenant: &TenantId, id: &Uuid) -> EngineResult<()> {
        self.endpoint_breaker(tenant, id).reset().await
    }

    fn endpoint_breaker(
        &self,
        tenant: &TenantId,
        id: &Uuid,
    ) -> Arc<crate::resilience::circuit_breaker::CircuitBreaker> {
        self.breakers.get_with(
            &Self::breaker_key(tenant, id),
            self.config.circuit_failure_threshold,
            Duration::from_millis(self.config.circuit_reset_timeout_ms),
        )
    }

    /// Delivery history for a subscription, newest first
    pub async fn delivery_history(
        &self,
        tenant: &TenantId,
        subscription_id: &Uuid,
        offset: u64,
        limit: usize,
    ) -> EngineResult<Vec<WebhookDelivery>> {
        self.deliveries
            .deliveries_for_subscription(tenant, subscription_id, offset, limit.clamp(1, 1000))
            .await
    }

    /// Dispatch an event to every eligible subscription of a tenant.
    ///
    /// Deliveries run in parallel with bounded concurrency; failures are
    /// recorded on the delivery rows, never propagated to the caller.
    pub async fn dispatch(
        &self,
        tenant: &TenantId,
        event_kind: &str,
        payload: Value,
        trace: &TraceContext,
    ) -> EngineResult<Vec<Uuid>> {
        let eligible: Vec<WebhookSubscription> = self
            .subscriptions
            .subscriptions_for(tenant)
            .await?
            .into_iter()
            .filter(|s| s.subscribes_to(event_kind))
            .collect();
        if eligible.is_empty() {
            return Ok(Vec::new());
        }

        let started = std::time::Instant::now();
        let mut delivery_ids = Vec::with_capacity(eligible.len());
        let mut tasks = Vec::with_capacity(eligible.len());

        for subscription in eligible {
            let delivery = WebhookDelivery::new(
                &subscription,
                event_kind,
                payload.clone(),
                trace.child(),
            );
            self.deliveries.create_delivery(&delivery).await?;
            delivery_ids.push(delivery.id);

            let semaphore = self.semaphore.clone();
            let this = self.clone_parts();
            tasks.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await;
                this.metrics.webhook_in_flight.inc();
                let result = this.deliver(subscription, delivery).await;
                this.metrics.webhook_in_flight.dec();
                if let Err(e) = result {
                    tracing::warn!(error = %e, "webhook delivery task failed");
                }
            }));
        }

        // allSettled semantics: one panicking or failing delivery never
        // affects its peers
        for outcome in join_all(tasks).await {
            let _ = outcome;
        }

        self.metrics
            .webhook_batch_duration
            .observe(started.elapsed().as_secs_f64());
        Ok(delivery_ids)
    }

    fn clone_parts(&self) -> DeliveryRunner {
        DeliveryRunner {
            deliveries: self.deliveries.clone(),
            breakers: self.breakers.clone(),
            config: self.config.clone(),
            metrics: self.metrics.clone(),
            cipher: self.cipher.clone(),
        }
    }

    /// Re-attempt deliveries whose retry time has come. Returns how many
    /// were processed.
    pub async fn process_pending_retries(&self, limit: usize) -> EngineResult<usize> {
        let due = self.deliveries.due_retries(Utc::now(), limit).await?;
        let mut processed = 0;
        for delivery in due {
            let Some(subscription) = self
                .subscriptions
                .get_subscription(&delivery.tenant_id, &delivery.subscription_id)
                .await?
            else {
                continue;
            };
            let runner = self.clone_parts();
            runner.deliver(subscription, delivery).await?;
            processed += 1;
        }
        Ok(processed)
    }

    /// Replay a failed delivery: transitions it to `retrying`, due now
    pub async fn replay_delivery(&self, tenant: &TenantId, id: &Uuid) -> EngineResult<()> {
        let mut delivery = self
            .deliveries
            .get_delivery(tenant, id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("delivery {}", id)))?;
        if delivery.status != DeliveryStatus::Failed {
            return Err(EngineError::Conflict(format!(
                "only failed deliveries can be replayed (status is {})",
                delivery.status.as_str()
            )));
        }
        delivery.transition_to(DeliveryStatus::Retrying)?;
        delivery.next_retry_at = Some(Utc::now());
        delivery.skipped_by_circuit_breaker = false;
        self.deliveries.update_delivery(&delivery).await
    }
}

/// The per-delivery execution half, cloneable into spawned tasks
struct DeliveryRunner {
    deliveries: Arc<dyn DeliveryStore>,
    breakers: Arc<CircuitBreakerRegistry>,
    config: WebhookConfig,
    metrics: Arc<EngineMetrics>,
    cipher: Arc<SecretCipher>,
}

impl DeliveryRunner {
    /// Run the single-delivery protocol for one subscription
    async fn deliver(
        &self,
        subscription: WebhookSubscription,
        mut delivery: WebhookDelivery,
    ) -> EngineResult<()> {
        let breaker = self.breakers.get_with(
            &WebhookDispatcher::breaker_key(&subscription.tenant_id, &subscription.id),
            self.config.circuit_failure_threshold,
            Duration::from_millis(self.config.circuit_reset_timeout_ms),
        );

        if breaker.is_open().await? {
            delivery.skipped_by_circuit_breaker = true;
            delivery.last_error = Some("circuit breaker open".to_string());
            if delivery.status == DeliveryStatus::Pending {
                delivery.transition_to(DeliveryStatus::Retrying)?;
            }
            delivery.transition_to(DeliveryStatus::Failed)?;
            self.deliveries.update_delivery(&delivery).await?;
            self.metrics
                .webhook_deliveries
                .with_label_values(&["skipped"])
                .inc();
            return Ok(());
        }

        let secret = self.cipher.decrypt(&subscription.encrypted_secret)?;
        let body = canonical_json(&delivery.payload);
        let retry_budget = subscription
            .retry_attempts
            .unwrap_or(self.config.retry_attempts)
            .max(1);
        let base_delay = subscription
            .retry_delay_ms
            .unwrap_or(self.config.retry_delay_ms);

        let url = url::Url::parse(&subscription.url)
            .map_err(|e| EngineError::Internal(format!("stored webhook url invalid: {}", e)))?;
        let host = url
            .host_str()
            .ok_or_else(|| EngineError::Internal("stored webhook url has no host".to_string()))?
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| EngineError::Internal("stored webhook url has no port".to_string()))?;

        delivery.next_retry_at = None;
        let mut last_error = String::new();

        for attempt in 1..=retry_budget {
            if delivery.status != DeliveryStatus::Retrying {
                delivery.transition_to(DeliveryStatus::Retrying)?;
            }
            delivery.attempts += 1;
            delivery.last_attempt_at = Some(Utc::now());
            self.deliveries.update_delivery(&delivery).await?;

            match self
                .attempt_once(&subscription, &delivery, &url, &host, port, &secret, &body)
                .await
            {
                Ok((status, response_body)) => {
                    delivery.response_status = Some(status);
                    delivery.set_response_body(&response_body);
                    delivery.last_error = None;
                    delivery.transition_to(DeliveryStatus::Delivered)?;
                    self.deliveries.update_delivery(&delivery).await?;
                    breaker.on_success().await?;
                    self.metrics
                        .webhook_deliveries
                        .with_label_values(&["delivered"])
                        .inc();
                    return Ok(());
                }
                Err((status, error)) => {
                    delivery.response_status = status;
                    delivery.last_error = Some(error.clone());
                    last_error = error;
                    self.deliveries.update_delivery(&delivery).await?;
                    if attempt < retry_budget {
                        let delay = base_delay.saturating_mul(1u64 << (attempt - 1).min(16));
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                    }
                }
            }
        }

        // Budget exhausted
        delivery.transition_to(DeliveryStatus::Failed)?;
        delivery.next_retry_at = None;
        self.deliveries.update_delivery(&delivery).await?;
        breaker.on_failure().await?;
        self.metrics
            .webhook_deliveries
            .with_label_values(&["failed"])
            .inc();
        tracing::warn!(
            webhook_id = %subscription.id,
            tenant = %subscription.tenant_id,
            error = %last_error,
            "webhook delivery exhausted its retry budget"
        );
        Ok(())
    }

    /// One HTTP attempt. DNS is re-resolved and checked against the pin, and
    /// the connection goes to the pinned address, not whatever the hostname
    /// resolves to at connect time.
    async fn attempt_once(
        &self,
        subscription: &WebhookSubscription,
        delivery: &WebhookDelivery,
        url: &url::Url,
        host: &str,
        port: u16,
        secret: &str,
        body: &str,
    ) -> Result<(u16, String), (Option<u16>, String)> {
        ssrf::verify_pin(
            host,
            port,
            &subscription.pinned_ip,
            self.config.allow_dns_change,
        )
        .await
        .map_err(|e| (None, e.to_string()))?;

        let client = reqwest::Client::builder()
            .timeout(self.config.timeout())
            .user_agent("Vorion-Webhook/1.0")
            .resolve(host, SocketAddr::new(subscription.pinned_ip, port))
            .build()
            .map_err(|e| (None, format!("failed to build http client: {}", e)))?;

        let timestamp = Utc::now().timestamp();
        let signature = generate_signature(body, secret, timestamp);

        let mut request = client
            .post(url.clone())
            .header("Content-Type", "application/json")
            .header("Host", host)
            .header("X-Webhook-Event", &delivery.event_kind)
            .header("X-Webhook-Delivery", delivery.id.to_string())
            .header("X-Vorion-Signature", signature)
            .header("X-Vorion-Timestamp", timestamp.to_string())
            .body(body.to_string());
        if let Some(traceparent) = &delivery.trace.traceparent {
            request = request.header("traceparent", traceparent);
        }
        if let Some(tracestate) = &delivery.trace.tracestate {
            request = request.header("tracestate", tracestate);
        }

        let response = request
            .send()
            .await
            .map_err(|e| (None, format!("request failed: {}", e)))?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if status.is_success() {
            Ok((status.as_u16(), text))
        } else {
            Err((Some(status.as_u16()), format!("HTTP {}", status)))
        }
    }
}
