//! Outbound webhook subsystem: signed payloads, SSRF guard with DNS
//! pinning, per-endpoint circuit breakers, persistent delivery records

pub mod delivery;
pub mod dispatcher;
pub mod secret;
pub mod signature;
pub mod ssrf;

pub use delivery::{DeliveryStatus, WebhookDelivery, WebhookSubscription};
pub use dispatcher::{RegisterWebhookRequest, RegisteredWebhook, WebhookDispatcher};
pub use secret::SecretCipher;
pub use signature::{generate_signature, verify_webhook_signature, DEFAULT_TOLERANCE_S};
