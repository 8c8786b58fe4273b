//! # cache — low-latency P&L snapshot cache
//!
//! The tick worker writes every recomputed P&L here *always*, even when the
//! durable-store write is suppressed by the update threshold — this is the
//! low-latency read path the dashboard polls between events.
//!
//! The cache is best effort: [`NoopPnlCache`] keeps the engine fully
//! functional when no cache backend is configured, only losing the fast
//! read path.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

// ─── Snapshot ─────────────────────────────────────────────────────────────────

/// The value cached per position id.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PnlSnapshot {
    pub position_id:    Uuid,
    pub unrealized_pnl: f64,
    pub day_pnl:        f64,
    pub current_price:  f64,
    pub updated_at_ms:  i64,
}

// ─── Port ─────────────────────────────────────────────────────────────────────

#[async_trait]
pub trait PnlCache: Send + Sync {
    /// Store `snapshot` under the position id for `ttl`. Never errors — an
    /// unavailable cache degrades to a no-op.
    async fn set(&self, snapshot: PnlSnapshot, ttl: Duration);

    async fn get(&self, position_id: Uuid) -> Option<PnlSnapshot>;
}

// ─── In-memory adapter ────────────────────────────────────────────────────────

/// Process-local cache. Expired entries are dropped lazily on read and
/// swept opportunistically on write.
#[derive(Default)]
pub struct InMemoryPnlCache {
    entries: RwLock<HashMap<Uuid, (PnlSnapshot, Instant)>>,
}

impl InMemoryPnlCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl PnlCache for InMemoryPnlCache {
    async fn set(&self, snapshot: PnlSnapshot, ttl: Duration) {
        let mut entries = self.entries.write().await;
        let now = Instant::now();
        entries.retain(|_, (_, expires)| *expires > now);
        entries.insert(snapshot.position_id, (snapshot, now + ttl));
    }

    async fn get(&self, position_id: Uuid) -> Option<PnlSnapshot> {
        let entries = self.entries.read().await;
        entries
            .get(&position_id)
            .filter(|(_, expires)| *expires > Instant::now())
            .map(|(snapshot, _)| *snapshot)
    }
}

// ─── No-op adapter ────────────────────────────────────────────────────────────

/// Degraded mode: accepts writes, answers nothing.
pub struct NoopPnlCache;

#[async_trait]
impl PnlCache for NoopPnlCache {
    async fn set(&self, _snapshot: PnlSnapshot, _ttl: Duration) {}

    async fn get(&self, _position_id: Uuid) -> Option<PnlSnapshot> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(id: u128, unrealized: f64) -> PnlSnapshot {
        PnlSnapshot {
            position_id: Uuid::from_u128(id),
            unrealized_pnl: unrealized,
            day_pnl: 0.0,
            current_price: 100.0,
            updated_at_ms: 0,
        }
    }

    #[tokio::test]
    async fn set_get_and_overwrite() {
        let cache = InMemoryPnlCache::new();
        cache.set(snap(1, -50.0), Duration::from_secs(30)).await;
        cache.set(snap(1, -75.0), Duration::from_secs(30)).await;

        let got = cache.get(Uuid::from_u128(1)).await.unwrap();
        assert_eq!(got.unrealized_pnl, -75.0);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn expired_entries_are_invisible() {
        let cache = InMemoryPnlCache::new();
        cache.set(snap(1, -50.0), Duration::from_millis(0)).await;
        assert!(cache.get(Uuid::from_u128(1)).await.is_none());
    }

    #[tokio::test]
    async fn noop_swallows_everything() {
        let cache = NoopPnlCache;
        cache.set(snap(1, -50.0), Duration::from_secs(30)).await;
        assert!(cache.get(Uuid::from_u128(1)).await.is_none());
    }
}
