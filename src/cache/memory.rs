use std::{
    sync::Mutex,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value as JsonValue;

use super::{CacheBackend, CacheKey, CachedItem};
use crate::core::{ServerError, ServerResult};

const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// In-process cache backed by a concurrent map.
///
/// Expired entries are dropped when read, and at most once per sweep
/// interval every write scans the whole map for them.
pub struct MemoryCache {
    items: DashMap<CacheKey, CachedItem>,
    max_items: Option<usize>,
    sweep_interval: Duration,
    last_sweep: Mutex<Instant>,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self {
            items: DashMap::new(),
            max_items: None,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            last_sweep: Mutex::new(Instant::now()),
        }
    }
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_items(max_items: usize) -> Self {
        Self {
            max_items: Some(max_items),
            ..Self::default()
        }
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn evict_expired(&self) {
        self.items.retain(|_, item| !item.is_expired());
    }

    fn sweep_if_due(&self) {
        let due = match self.last_sweep.lock() {
            Ok(mut last) if last.elapsed() >= self.sweep_interval => {
                *last = Instant::now();
                true
            }
            _ => false,
        };
        if due {
            self.evict_expired();
        }
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn get(&self, key: &CacheKey) -> ServerResult<Option<CachedItem>> {
        let expired = match self.items.get(key) {
            Some(item) if !item.is_expired() => return Ok(Some(item.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.items.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &CacheKey, value: JsonValue, ttl: Duration) -> ServerResult<()> {
        if ttl.is_zero() {
            return Ok(());
        }

        self.sweep_if_due();

        if let Some(max) = self.max_items {
            if self.items.len() >= max && !self.items.contains_key(key) {
                self.evict_expired();
                if self.items.len() >= max {
                    return Err(ServerError::Cache(format!(
                        "memory cache is full ({max} items)"
                    )));
                }
            }
        }

        self.items.insert(
            key.clone(),
            CachedItem {
                item: value,
                stored: Instant::now(),
                ttl,
            },
        );
        Ok(())
    }

    async fn remove(&self, key: &CacheKey) -> ServerResult<()> {
        self.items.remove(key);
        Ok(())
    }
}
