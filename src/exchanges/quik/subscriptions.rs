use crate::core::types::{AllTrade, SecurityKey};
use dashmap::DashMap;
use std::sync::Arc;

pub type FeedCallback = Arc<dyn Fn(&AllTrade) + Send + Sync>;

/// Feed callbacks keyed by security, one callback per key.
#[derive(Default)]
pub struct SubscriptionRegistry {
    feeds: DashMap<SecurityKey, FeedCallback>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the callback for `key`, replacing any previous one.
    /// Returns `true` when an existing subscription was overwritten.
    pub fn insert(&self, key: SecurityKey, callback: FeedCallback) -> bool {
        self.feeds.insert(key, callback).is_some()
    }

    /// The returned callback is a clone, so no shard lock is held while it runs.
    pub fn get(&self, key: &SecurityKey) -> Option<FeedCallback> {
        self.feeds.get(key).map(|entry| Arc::clone(entry.value()))
    }

    pub fn keys(&self) -> Vec<SecurityKey> {
        self.feeds.iter().map(|entry| entry.key().clone()).collect()
    }
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("keys", &self.keys())
            .finish()
    }
}
