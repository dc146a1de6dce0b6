// rust/vorion-lockchain/src/chain.rs
// Hash-chain primitives: canonical serialization and link hashing

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Previous-hash value of the first event in every chain (64 zeros)
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Canonical JSON rendering of a value.
///
/// `serde_json::Map` is a `BTreeMap` (the `preserve_order` feature is off), so
/// object keys serialize in sorted order at every nesting level. Two
/// structurally equal values therefore produce byte-identical output, which is
/// what makes the chain hash reproducible across processes.
pub fn canonical_json(value: &Value) -> String {
    value.to_string()
}

/// Compute the chain hash for one link.
///
/// `hash = hex(SHA-256(canonical || previous_hash))`. The previous hash is
/// mixed in as its hex string, so verification never needs to re-decode it.
pub fn chain_hash(canonical: &str, previous_hash: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hasher.update(previous_hash.as_bytes());
    hex::encode(hasher.finalize())
}

/// A record that participates in a hash chain.
///
/// Implementors expose the hashes they were persisted with and the canonical
/// form of their content, so a verifier can recompute the chain without
/// knowing the concrete event type.
pub trait ChainLink {
    /// Hash stored with this link
    fn stored_hash(&self) -> &str;

    /// Previous-hash stored with this link
    fn stored_previous_hash(&self) -> &str;

    /// Canonical content the hash was computed over
    fn canonical(&self) -> String;
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_json_sorts_keys() {
        let a = json!({"b": 1, "a": {"z": true, "m": null}});
        assert_eq!(canonical_json(&a), r#"{"a":{"m":null,"z":true},"b":1}"#);
    }

    #[test]
    fn test_chain_hash_is_deterministic() {
        let h1 = chain_hash("payload", GENESIS_HASH);
        let h2 = chain_hash("payload", GENESIS_HASH);
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
    }

    #[test]
    fn test_chain_hash_depends_on_previous() {
        let h1 = chain_hash("payload", GENESIS_HASH);
        let h2 = chain_hash("payload", &h1);
        assert_ne!(h1, h2);
    }
}
