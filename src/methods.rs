//! Server methods: named functions shared across plugins, with optional
//! result caching.

use std::{collections::HashMap, future::Future, sync::Arc, time::Duration};

use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value as JsonValue;

use crate::{
    cache::{CacheBackend, Policy},
    core::{Boom, ServerError, ServerResult},
    lifecycle::protect::protect,
};

static METHOD_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z]\w*(\.[a-zA-Z]\w*)*$").expect("static regex"));

pub type MethodFn = Arc<dyn Fn(JsonValue) -> BoxFuture<'static, Result<JsonValue, Boom>> + Send + Sync>;

pub type KeyFn = Arc<dyn Fn(&JsonValue) -> Option<String> + Send + Sync>;

#[derive(Clone, Default)]
pub struct MethodOptions {
    /// Cache results for this long
    pub expires_in: Option<Duration>,
    /// Custom cache key; `None` from the function skips the cache
    pub generate_key: Option<KeyFn>,
}

impl MethodOptions {
    pub fn cached(expires_in: Duration) -> Self {
        Self {
            expires_in: Some(expires_in),
            generate_key: None,
        }
    }

    pub fn generate_key<F>(mut self, f: F) -> Self
    where
        F: Fn(&JsonValue) -> Option<String> + Send + Sync + 'static,
    {
        self.generate_key = Some(Arc::new(f));
        self
    }
}

struct ServerMethod {
    func: MethodFn,
    policy: Option<Policy>,
    generate_key: Option<KeyFn>,
}

/// Wraps an async closure as a method function.
pub fn method_fn<F, Fut>(f: F) -> MethodFn
where
    F: Fn(JsonValue) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<JsonValue, Boom>> + Send + 'static,
{
    Arc::new(move |args| Box::pin(f(args)))
}

pub struct Methods {
    methods: HashMap<String, ServerMethod>,
    cache: Arc<dyn CacheBackend>,
}

impl Methods {
    pub fn new(cache: Arc<dyn CacheBackend>) -> Self {
        Self {
            methods: HashMap::new(),
            cache,
        }
    }

    pub fn add(&mut self, name: &str, func: MethodFn, options: MethodOptions) -> ServerResult<()> {
        if !METHOD_NAME_RE.is_match(name) {
            return Err(ServerError::Configuration(format!(
                "invalid server method name: {name}"
            )));
        }
        if self.methods.contains_key(name) {
            return Err(ServerError::NameConflict(format!(
                "server method {name} already exists"
            )));
        }

        let policy = options
            .expires_in
            .map(|ttl| Policy::new(self.cache.clone(), format!("#{name}"), ttl));

        log::debug!("Adding server method {name} (cached: {})", policy.is_some());
        self.methods.insert(
            name.to_string(),
            ServerMethod {
                func,
                policy,
                generate_key: options.generate_key,
            },
        );
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    /// Calls a method, consulting its cache first when one is configured.
    ///
    /// Concurrent calls with the same key are not deduplicated.
    pub async fn call(&self, name: &str, args: JsonValue) -> Result<JsonValue, Boom> {
        let method = self
            .methods
            .get(name)
            .ok_or_else(|| Boom::internal(format!("Unknown server method: {name}")))?;

        let cache_id = match (&method.policy, &method.generate_key) {
            (None, _) => None,
            (Some(_), Some(key_fn)) => key_fn(&args),
            (Some(_), None) => serde_json::to_string(&args).ok(),
        };

        if let (Some(policy), Some(id)) = (&method.policy, &cache_id) {
            if let Some(value) = policy.get(id).await {
                return Ok(value);
            }
        }

        let value = protect("server method", (method.func)(args)).await?;

        if let (Some(policy), Some(id)) = (&method.policy, &cache_id) {
            policy.set(id, value.clone()).await;
        }

        Ok(value)
    }
}
