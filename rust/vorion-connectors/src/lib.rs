// rust/vorion-connectors/src/lib.rs
// HTTP collaborator clients for the Vorion intent engine

//! Implementations of the engine's collaborator traits over HTTP.
//!
//! The engine depends only on the traits in `vorion_engine::collaborators`;
//! this crate provides reqwest-backed clients with explicit timeouts and
//! JSON contracts for deployments where trust scoring, policy evaluation,
//! consent, and sandboxed execution are remote services.

pub mod client;
pub mod consent;
pub mod policy;
pub mod sandbox;
pub mod trust;

pub use client::{ConnectorClient, ConnectorConfig};
pub use consent::HttpConsentRegistry;
pub use policy::HttpPolicyEngine;
pub use sandbox::HttpSandbox;
pub use trust::HttpTrustProvider;
