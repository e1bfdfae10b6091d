//! Cache-invalidation hooks. The cache is an external collaborator:
//! eventually consistent, invalidated post-commit, and implementations
//! may no-op.
//!
//! A best-effort local implementation backed by `moka` is provided for
//! read-through use by callers that want one (e.g. serving `PoolState` reads
//! outside a transaction); every write still goes through the locked
//! transaction regardless of what this cache holds.

use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use tracing::debug;

/// Key prefixes mirroring the per-entity scheme used by the interface
/// contract this collaborator fulfills.
pub mod keys {
    pub const POOL_STATE: &str = "pool_state";
    pub const QUOTE: &str = "quote";
    pub const EVENT_LIST: &str = "event_list";
    pub const USER_PORTFOLIO: &str = "user_portfolio";
    pub const USER_ORDERS: &str = "user_orders";
    pub const LEADERBOARD: &str = "leaderboard";

    pub fn make_key(prefix: &str, id: impl std::fmt::Display) -> String {
        format!("{prefix}:{id}")
    }
}

/// A concrete, best-effort local cache: 5-minute TTL / 1-minute idle,
/// matching the existing service's cache configuration.
pub struct LocalCache {
    entries: Cache<String, Vec<u8>>,
}

impl LocalCache {
    pub fn new() -> Self {
        Self {
            entries: Cache::builder()
                .time_to_live(Duration::from_secs(5 * 60))
                .time_to_idle(Duration::from_secs(60))
                .build(),
        }
    }

    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.entries.get(key).await
    }

    pub async fn set(&self, key: String, value: Vec<u8>) {
        self.entries.insert(key, value).await;
    }

    async fn invalidate(&self, key: String) {
        self.entries.invalidate(&key).await;
    }
}

impl Default for LocalCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Cache-invalidation hooks the core calls post-commit. `None` means no-op.
#[derive(Clone, Default)]
pub struct CacheHooks {
    local: Option<Arc<LocalCache>>,
}

impl CacheHooks {
    pub fn noop() -> Self {
        Self { local: None }
    }

    pub fn local(cache: Arc<LocalCache>) -> Self {
        Self { local: Some(cache) }
    }

    pub async fn invalidate_on_trade(&self, market_id: i64, user_id: i64, event_id: Option<i64>) {
        let Some(cache) = &self.local else { return };
        debug!(market_id, user_id, ?event_id, "invalidate_on_trade");
        cache.invalidate(keys::make_key(keys::POOL_STATE, market_id)).await;
        cache.invalidate(keys::make_key(keys::QUOTE, market_id)).await;
        cache.invalidate(keys::make_key(keys::USER_PORTFOLIO, user_id)).await;
        cache.invalidate(keys::make_key(keys::USER_ORDERS, user_id)).await;
        cache.invalidate(keys::LEADERBOARD.to_string()).await;
        if let Some(event_id) = event_id {
            cache.invalidate(keys::make_key(keys::EVENT_LIST, event_id)).await;
        }
    }

    pub async fn invalidate_on_market_change(&self, market_id: i64, event_id: Option<i64>) {
        let Some(cache) = &self.local else { return };
        debug!(market_id, ?event_id, "invalidate_on_market_change");
        cache.invalidate(keys::make_key(keys::POOL_STATE, market_id)).await;
        cache.invalidate(keys::make_key(keys::QUOTE, market_id)).await;
        if let Some(event_id) = event_id {
            cache.invalidate(keys::make_key(keys::EVENT_LIST, event_id)).await;
        }
    }
}
