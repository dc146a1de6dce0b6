//! Ephemeral key/value store for cross-instance coordination
//!
//! Rate-limit windows, lock records, circuit-breaker state, and dedupe
//! markers live here. Multi-step operations (evict-count-insert, guarded
//! deletes) are single trait methods so every implementation can execute
//! them indivisibly - the in-process store holds one mutex across the steps,
//! the way a networked store would run an atomic script.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::error::EngineResult;

/// Result of an atomic sliding-window check-and-consume
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowDecision {
    /// Whether a slot was consumed
    pub allowed: bool,
    /// Entries in the window after the operation (includes the new entry
    /// when allowed)
    pub current: u64,
    /// Timestamp of the oldest surviving entry, if any
    pub oldest_ms: Option<u64>,
}

/// Read-only view of a window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WindowStatus {
    pub count: u64,
    pub oldest_ms: Option<u64>,
}

/// Which window blocked a combined consume
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockedBy {
    Primary,
    Secondary,
}

/// Result of an atomic two-window check-and-consume
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairDecision {
    pub allowed: bool,
    pub blocked_by: Option<BlockedBy>,
    pub primary: WindowStatus,
    pub secondary: WindowStatus,
}

/// Update closure for [`KvStore::fetch_update`]
pub type UpdateFn = Box<dyn FnOnce(Option<&str>) -> Option<String> + Send>;

/// Parameters for one window in a combined consume
#[derive(Debug, Clone)]
pub struct WindowSpec {
    pub key: String,
    pub limit: u64,
    pub window_ms: u64,
}

/// Shared ephemeral store.
///
/// All methods are atomic with respect to each other for the keys they
/// touch. Values are strings (JSON where structured); expirations are
/// mandatory for window entries and optional elsewhere.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Get a value
    async fn get(&self, key: &str) -> EngineResult<Option<String>>;

    /// Set a value with an optional TTL
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> EngineResult<()>;

    /// Set only if the key is absent. Returns true when the value was set.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> EngineResult<bool>;

    /// Delete a key. Returns true when the key existed.
    async fn delete(&self, key: &str) -> EngineResult<bool>;

    /// Delete only if the current value matches. Returns true on delete.
    async fn delete_if_value(&self, key: &str, expected: &str) -> EngineResult<bool>;

    /// Atomic read-modify-write. The closure sees the current value and
    /// returns the replacement (`None` deletes). Returns the stored result.
    async fn fetch_update(
        &self,
        key: &str,
        ttl: Option<Duration>,
        update: UpdateFn,
    ) -> EngineResult<Option<String>>;

    /// Atomic sliding-window check-and-consume: evict entries older than
    /// `now_ms - window_ms`, count survivors, and insert `member` iff the
    /// count is below `limit`.
    async fn window_consume(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
        limit: u64,
        member: &str,
    ) -> EngineResult<WindowDecision>;

    /// Atomic check-and-consume over two windows: consumes from both or
    /// neither, reporting which one blocked.
    async fn window_consume_pair(
        &self,
        primary: &WindowSpec,
        secondary: &WindowSpec,
        now_ms: u64,
        member: &str,
    ) -> EngineResult<PairDecision>;

    /// Read a window without consuming
    async fn window_status(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
    ) -> EngineResult<WindowStatus>;
}

#[derive(Debug)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self) -> bool {
        self.expires_at.map(|t| t > Instant::now()).unwrap_or(true)
    }
}

#[derive(Default)]
struct KvInner {
    entries: HashMap<String, Entry>,
    windows: HashMap<String, Vec<(u64, String)>>,
}

impl KvInner {
    fn evict(&mut self, key: &str, cutoff_ms: u64) -> &mut Vec<(u64, String)> {
        let window = self.windows.entry(key.to_string()).or_default();
        window.retain(|(ts, _)| *ts >= cutoff_ms);
        window
    }

    fn status(window: &[(u64, String)]) -> WindowStatus {
        WindowStatus {
            count: window.len() as u64,
            oldest_ms: window.iter().map(|(ts, _)| *ts).min(),
        }
    }
}

/// In-process [`KvStore`]. One mutex guards every operation, making each
/// trait call indivisible exactly as the contract requires.
#[derive(Default)]
pub struct MemoryKv {
    inner: Mutex<KvInner>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> EngineResult<Option<String>> {
        let mut inner = self.inner.lock();
        let current = inner
            .entries
            .get(key)
            .map(|entry| (entry.live(), entry.value.clone()));
        match current {
            Some((true, value)) => Ok(Some(value)),
            Some((false, _)) => {
                inner.entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> EngineResult<()> {
        let mut inner = self.inner.lock();
        inner.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> EngineResult<bool> {
        let mut inner = self.inner.lock();
        let occupied = inner.entries.get(key).map(|e| e.live()).unwrap_or(false);
        if occupied {
            return Ok(false);
        }
        inner.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> EngineResult<bool> {
        let mut inner = self.inner.lock();
        Ok(inner.entries.remove(key).map(|e| e.live()).unwrap_or(false))
    }

    async fn delete_if_value(&self, key: &str, expected: &str) -> EngineResult<bool> {
        let mut inner = self.inner.lock();
        let matches = inner
            .entries
            .get(key)
            .map(|e| e.live() && e.value == expected)
            .unwrap_or(false);
        if matches {
            inner.entries.remove(key);
        }
        Ok(matches)
    }

    async fn fetch_update(
        &self,
        key: &str,
        ttl: Option<Duration>,
        update: UpdateFn,
    ) -> EngineResult<Option<String>> {
        let mut inner = self.inner.lock();
        let current = inner
            .entries
            .get(key)
            .filter(|e| e.live())
            .map(|e| e.value.clone());
        match update(current.as_deref()) {
            Some(next) => {
                inner.entries.insert(
                    key.to_string(),
                    Entry {
                        value: next.clone(),
                        expires_at: ttl.map(|d| Instant::now() + d),
                    },
                );
                Ok(Some(next))
            }
            None => {
                inner.entries.remove(key);
                Ok(None)
            }
        }
    }

    async fn window_consume(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
        limit: u64,
        member: &str,
    ) -> EngineResult<WindowDecision> {
        let mut inner = self.inner.lock();
        let window = inner.evict(key, now_ms.saturating_sub(window_ms));
        let count = window.len() as u64;
        if count < limit {
            window.push((now_ms, member.to_string()));
            let oldest = window.iter().map(|(ts, _)| *ts).min();
            Ok(WindowDecision {
                allowed: true,
                current: count + 1,
                oldest_ms: oldest,
            })
        } else {
            let oldest = window.iter().map(|(ts, _)| *ts).min();
            Ok(WindowDecision {
                allowed: false,
                current: count,
                oldest_ms: oldest,
            })
        }
    }

    async fn window_consume_pair(
        &self,
        primary: &WindowSpec,
        secondary: &WindowSpec,
        now_ms: u64,
        member: &str,
    ) -> EngineResult<PairDecision> {
        let mut inner = self.inner.lock();

        let primary_window = inner.evict(&primary.key, now_ms.saturating_sub(primary.window_ms));
        let primary_status = KvInner::status(primary_window);
        let secondary_window =
            inner.evict(&secondary.key, now_ms.saturating_sub(secondary.window_ms));
        let secondary_status = KvInner::status(secondary_window);

        if primary_status.count >= primary.limit {
            return Ok(PairDecision {
                allowed: false,
                blocked_by: Some(BlockedBy::Primary),
                primary: primary_status,
                secondary: secondary_status,
            });
        }
        if secondary_status.count >= secondary.limit {
            return Ok(PairDecision {
                allowed: false,
                blocked_by: Some(BlockedBy::Secondary),
                primary: primary_status,
                secondary: secondary_status,
            });
        }

        // Both pass: consume from both
        inner
            .evict(&primary.key, now_ms.saturating_sub(primary.window_ms))
            .push((now_ms, member.to_string()));
        inner
            .evict(&secondary.key, now_ms.saturating_sub(secondary.window_ms))
            .push((now_ms, member.to_string()));

        Ok(PairDecision {
            allowed: true,
            blocked_by: None,
            primary: WindowStatus {
                count: primary_status.count + 1,
                oldest_ms: primary_status.oldest_ms.or(Some(now_ms)),
            },
            secondary: WindowStatus {
                count: secondary_status.count + 1,
                oldest_ms: secondary_status.oldest_ms.or(Some(now_ms)),
            },
        })
    }

    async fn window_status(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
    ) -> EngineResult<WindowStatus> {
        let mut inner = self.inner.lock();
        let window = inner.evict(key, now_ms.saturating_sub(window_ms));
        Ok(KvInner::status(window))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_nx_excludes_second_writer() {
        let kv = MemoryKv::new();
        assert!(kv
            .set_nx("lock", "owner-a", Duration::from_secs(10))
            .await
            .unwrap());
        assert!(!kv
            .set_nx("lock", "owner-b", Duration::from_secs(10))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_set_nx_after_expiry() {
        let kv = MemoryKv::new();
        assert!(kv
            .set_nx("lock", "owner-a", Duration::from_millis(10))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(kv
            .set_nx("lock", "owner-b", Duration::from_secs(10))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_delete_if_value_guards_owner() {
        let kv = MemoryKv::new();
        kv.set("lock", "owner-a", None).await.unwrap();
        assert!(!kv.delete_if_value("lock", "owner-b").await.unwrap());
        assert!(kv.delete_if_value("lock", "owner-a").await.unwrap());
        assert!(kv.get("lock").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_window_consume_enforces_limit() {
        let kv = MemoryKv::new();
        for i in 0..3 {
            let decision = kv
                .window_consume("w", 1000, 60_000, 3, &format!("m{}", i))
                .await
                .unwrap();
            assert!(decision.allowed);
        }
        let denied = kv.window_consume("w", 1001, 60_000, 3, "m3").await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.current, 3);
        assert_eq!(denied.oldest_ms, Some(1000));
    }

    #[tokio::test]
    async fn test_window_eviction_frees_slots() {
        let kv = MemoryKv::new();
        for i in 0..3 {
            kv.window_consume("w", 1000, 1000, 3, &format!("m{}", i))
                .await
                .unwrap();
        }
        // One window later the old entries are gone
        let decision = kv.window_consume("w", 2500, 1000, 3, "m3").await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.current, 1);
    }

    #[tokio::test]
    async fn test_pair_consumes_both_or_neither() {
        let kv = MemoryKv::new();
        let primary = WindowSpec {
            key: "tenant".to_string(),
            limit: 10,
            window_ms: 60_000,
        };
        let secondary = WindowSpec {
            key: "entity".to_string(),
            limit: 1,
            window_ms: 60_000,
        };

        let first = kv
            .window_consume_pair(&primary, &secondary, 1000, "m0")
            .await
            .unwrap();
        assert!(first.allowed);

        // Entity window is full: tenant window must not be consumed
        let second = kv
            .window_consume_pair(&primary, &secondary, 1001, "m1")
            .await
            .unwrap();
        assert!(!second.allowed);
        assert_eq!(second.blocked_by, Some(BlockedBy::Secondary));
        assert_eq!(
            kv.window_status("tenant", 1002, 60_000).await.unwrap().count,
            1
        );
    }
}
