//! Cache backend interface.
//!
//! Storage engines are external; the server only talks to them through
//! [`CacheBackend`]. An in-memory backend is bundled for tests and small
//! deployments.

pub mod memory;
pub mod policy;

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::core::ServerResult;

pub use memory::MemoryCache;
pub use policy::Policy;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub segment: String,
    pub id: String,
}

impl CacheKey {
    pub fn new(segment: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            segment: segment.into(),
            id: id.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CachedItem {
    pub item: JsonValue,
    pub stored: Instant,
    pub ttl: Duration,
}

impl CachedItem {
    pub fn is_expired(&self) -> bool {
        self.stored.elapsed() >= self.ttl
    }

    /// Time left before expiry.
    pub fn remaining(&self) -> Duration {
        self.ttl.saturating_sub(self.stored.elapsed())
    }
}

/// Pluggable get/set/remove store with TTL.
///
/// Implementations report failures through the result; they must never
/// panic across the request lifecycle.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &CacheKey) -> ServerResult<Option<CachedItem>>;

    async fn set(&self, key: &CacheKey, value: JsonValue, ttl: Duration) -> ServerResult<()>;

    async fn remove(&self, key: &CacheKey) -> ServerResult<()>;
}
