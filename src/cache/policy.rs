use std::{sync::Arc, time::Duration};

use serde_json::Value as JsonValue;

use super::{CacheBackend, CacheKey};

/// A backend bound to one segment and lifetime.
///
/// Backend failures are logged and treated as misses; they never reach the
/// request lifecycle.
#[derive(Clone)]
pub struct Policy {
    backend: Arc<dyn CacheBackend>,
    segment: String,
    expires_in: Duration,
}

impl Policy {
    pub fn new(backend: Arc<dyn CacheBackend>, segment: impl Into<String>, expires_in: Duration) -> Self {
        Self {
            backend,
            segment: segment.into(),
            expires_in,
        }
    }

    pub fn segment(&self) -> &str {
        &self.segment
    }

    fn key(&self, id: &str) -> CacheKey {
        CacheKey::new(self.segment.clone(), id)
    }

    pub async fn get(&self, id: &str) -> Option<JsonValue> {
        match self.backend.get(&self.key(id)).await {
            Ok(item) => item.map(|i| i.item),
            Err(e) => {
                log::warn!("cache get failed for {}:{id}: {e}", self.segment);
                None
            }
        }
    }

    pub async fn set(&self, id: &str, value: JsonValue) {
        if let Err(e) = self.backend.set(&self.key(id), value, self.expires_in).await {
            log::warn!("cache set failed for {}:{id}: {e}", self.segment);
        }
    }

    pub async fn remove(&self, id: &str) {
        if let Err(e) = self.backend.remove(&self.key(id)).await {
            log::warn!("cache remove failed for {}:{id}: {e}", self.segment);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use serde_json::json;

    #[tokio::test]
    async fn test_policy_round_trip() {
        let policy = Policy::new(Arc::new(MemoryCache::new()), "#users", Duration::from_secs(1));
        assert!(policy.get("1").await.is_none());
        policy.set("1", json!({"name": "Bob"})).await;
        assert_eq!(policy.get("1").await, Some(json!({"name": "Bob"})));
        policy.remove("1").await;
        assert!(policy.get("1").await.is_none());
    }
}
