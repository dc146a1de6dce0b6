// rust/vorion-lockchain/src/verify.rs
// Incremental chain verification over batched event sources

use crate::chain::{chain_hash, ChainLink, GENESIS_HASH};

/// Outcome of feeding one link to a [`ChainVerification`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainStep {
    /// Link verified, keep feeding
    Ok,
    /// Link's previous_hash does not match the running chain head
    BrokenLink,
    /// Link's stored hash does not match the recomputed hash
    HashMismatch,
    /// The verification limit was reached before this link was examined
    LimitReached,
}

/// Final verification report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainReport {
    /// Whether every examined link verified
    pub valid: bool,
    /// Zero-based index of the first broken link, if any
    pub invalid_at: Option<u64>,
    /// Human-readable description of the first failure, if any
    pub error: Option<String>,
    /// Number of links verified
    pub events_verified: u64,
    /// True when the limit stopped verification before the chain was
    /// exhausted. `valid` then asserts only the verified prefix.
    pub truncated: bool,
}

/// Incremental chain verifier.
///
/// Callers stream links in order (batched however their store pages them) and
/// call [`finish`](ChainVerification::finish) when the source is exhausted or
/// the limit was hit. The verifier holds only the running chain head, never
/// the events themselves, so arbitrarily long chains verify in constant
/// memory.
#[derive(Debug)]
pub struct ChainVerification {
    expected_previous: String,
    verified: u64,
    max_events: u64,
    failure: Option<(u64, String)>,
}

impl ChainVerification {
    /// Start a verification bounded at `max_events` links
    pub fn new(max_events: u64) -> Self {
        Self {
            expected_previous: GENESIS_HASH.to_string(),
            verified: 0,
            max_events,
            failure: None,
        }
    }

    /// True when no more links should be fed
    pub fn done(&self) -> bool {
        self.failure.is_some() || self.verified >= self.max_events
    }

    /// Number of links verified so far
    pub fn verified(&self) -> u64 {
        self.verified
    }

    /// Feed the next link in chain order
    pub fn push<L: ChainLink>(&mut self, link: &L) -> ChainStep {
        if self.failure.is_some() {
            return ChainStep::LimitReached;
        }
        if self.verified >= self.max_events {
            return ChainStep::LimitReached;
        }

        if link.stored_previous_hash() != self.expected_previous {
            self.failure = Some((
                self.verified,
                format!(
                    "previous_hash mismatch at index {}: expected {}, found {}",
                    self.verified,
                    self.expected_previous,
                    link.stored_previous_hash()
                ),
            ));
            return ChainStep::BrokenLink;
        }

        let recomputed = chain_hash(&link.canonical(), link.stored_previous_hash());
        if recomputed != link.stored_hash() {
            self.failure = Some((
                self.verified,
                format!("hash mismatch at index {}", self.verified),
            ));
            return ChainStep::HashMismatch;
        }

        self.expected_previous = recomputed;
        self.verified += 1;
        ChainStep::Ok
    }

    /// Produce the report. `more_remaining` says whether the source still had
    /// links past the limit when verification stopped.
    pub fn finish(self, more_remaining: bool) -> ChainReport {
        match self.failure {
            Some((index, error)) => ChainReport {
                valid: false,
                invalid_at: Some(index),
                error: Some(error),
                events_verified: self.verified,
                truncated: false,
            },
            None => ChainReport {
                valid: true,
                invalid_at: None,
                error: None,
                events_verified: self.verified,
                truncated: more_remaining && self.verified >= self.max_events,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::chain::canonical_json;
    use serde_json::json;

    struct TestLink {
        hash: String,
        previous_hash: String,
        body: String,
    }

    impl ChainLink for TestLink {
        fn stored_hash(&self) -> &str {
            &self.hash
        }
        fn stored_previous_hash(&self) -> &str {
            &self.previous_hash
        }
        fn canonical(&self) -> String {
            self.body.clone()
        }
    }

    fn build_chain(n: usize) -> Vec<TestLink> {
        let mut links = Vec::new();
        let mut previous = GENESIS_HASH.to_string();
        for i in 0..n {
            let body = canonical_json(&json!({"seq": i}));
            let hash = chain_hash(&body, &previous);
            links.push(TestLink {
                hash: hash.clone(),
                previous_hash: previous,
                body,
            });
            previous = hash;
        }
        links
    }

    #[test]
    fn test_valid_chain_verifies() {
        let links = build_chain(10);
        let mut verification = ChainVerification::new(100);
        for link in &links {
            assert_eq!(verification.push(link), ChainStep::Ok);
        }
        let report = verification.finish(false);
        assert!(report.valid);
        assert_eq!(report.events_verified, 10);
        assert!(!report.truncated);
    }

    #[test]
    fn test_tampered_payload_detected() {
        let mut links = build_chain(5);
        links[2].body = canonical_json(&json!({"seq": 99}));
        let mut verification = ChainVerification::new(100);
        let mut outcome = ChainStep::Ok;
        for link in &links {
            outcome = verification.push(link);
            if outcome != ChainStep::Ok {
                break;
            }
        }
        assert_eq!(outcome, ChainStep::HashMismatch);
        let report = verification.finish(false);
        assert!(!report.valid);
        assert_eq!(report.invalid_at, Some(2));
        assert_eq!(report.events_verified, 2);
    }

    #[test]
    fn test_broken_link_detected() {
        let mut links = build_chain(5);
        links[3].previous_hash = GENESIS_HASH.to_string();
        let mut verification = ChainVerification::new(100);
        for link in &links {
            if verification.push(link) != ChainStep::Ok {
                break;
            }
        }
        let report = verification.finish(false);
        assert!(!report.valid);
        assert_eq!(report.invalid_at, Some(3));
    }

    #[test]
    fn test_limit_truncates() {
        let links = build_chain(10);
        let mut verification = ChainVerification::new(4);
        for link in &links {
            if verification.done() {
                break;
            }
            verification.push(link);
        }
        let report = verification.finish(true);
        assert!(report.valid);
        assert_eq!(report.events_verified, 4);
        assert!(report.truncated);
    }
}
