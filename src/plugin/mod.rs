//! Plugin composition.
//!
//! A [`Plugin`] registers routes, extensions, auth schemes, server methods
//! and exposed values through a [`PluginScope`] bound to its own [`Realm`].
//! Built-in plugins are resolvable by name through [`build_plugin`], which
//! is how manifests refer to them.

pub mod basic_auth;
pub mod cors;
pub mod key_auth;
pub mod realm;
pub mod request_id;
pub mod scope;

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use serde_json::Value as JsonValue;

use crate::{
    core::{ServerError, ServerResult},
    lifecycle::auth::RouteAuth,
};

pub use realm::Realm;
pub use scope::{HookPoint, PluginScope};

/// Factory building a configured plugin from JSON options
pub type PluginCreateFn = fn(JsonValue) -> ServerResult<Arc<dyn Plugin>>;

#[async_trait]
pub trait Plugin: Send + Sync {
    /// Unique plugin name, also used in extension `before`/`after` lists
    fn name(&self) -> &str;

    fn version(&self) -> &str {
        "0.0.0"
    }

    /// Plugins that must be registered before this one
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    /// Whether the plugin may be registered more than once
    fn multiple(&self) -> bool {
        false
    }

    async fn register(&self, scope: &mut PluginScope<'_>, options: JsonValue) -> ServerResult<()>;
}

/// How a plugin is registered
#[derive(Debug, Clone, Default)]
pub struct Registration {
    pub options: JsonValue,
    /// Prefix applied to every route path of the plugin
    pub prefix: Option<String>,
    /// Vhost applied to routes that do not set their own
    pub vhost: Vec<String>,
    /// Restricts the plugin to listeners carrying one of these labels
    pub select: Option<Vec<String>>,
    /// Skip silently if the plugin is already registered
    pub once: bool,
}

impl Registration {
    pub fn options(mut self, options: JsonValue) -> Self {
        self.options = options;
        self
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn vhost(mut self, host: impl Into<String>) -> Self {
        self.vhost.push(host.into());
        self
    }

    pub fn select(mut self, labels: &[&str]) -> Self {
        self.select = Some(labels.iter().map(|l| l.to_string()).collect());
        self
    }

    pub fn once(mut self) -> Self {
        self.once = true;
        self
    }
}

/// Built-in plugins by name.
static PLUGIN_BUILDER_REGISTRY: Lazy<HashMap<&'static str, PluginCreateFn>> = Lazy::new(|| {
    let arr: Vec<(&str, PluginCreateFn)> = vec![
        (
            request_id::PLUGIN_NAME,
            request_id::create_request_id_plugin,
        ),
        (cors::PLUGIN_NAME, cors::create_cors_plugin),
        (
            basic_auth::PLUGIN_NAME,
            basic_auth::create_basic_auth_plugin,
        ),
        (key_auth::PLUGIN_NAME, key_auth::create_key_auth_plugin),
    ];
    arr.into_iter().collect()
});

/// Creates a built-in plugin from its configuration.
///
/// # Errors
/// Returns `Configuration` for unknown plugin names or invalid options.
pub fn build_plugin(name: &str, cfg: JsonValue) -> ServerResult<Arc<dyn Plugin>> {
    let builder = PLUGIN_BUILDER_REGISTRY
        .get(name)
        .ok_or_else(|| ServerError::Configuration(format!("Unknown plugin type: {name}")))?;
    builder(cfg)
}

/// Parses and validates plugin options.
pub(crate) fn parse_config<T>(plugin: &str, cfg: JsonValue) -> ServerResult<T>
where
    T: serde::de::DeserializeOwned + validator::Validate,
{
    let cfg = if cfg.is_null() {
        JsonValue::Object(Default::default())
    } else {
        cfg
    };
    let config: T = serde_json::from_value(cfg)
        .map_err(|e| ServerError::Configuration(format!("Invalid {plugin} plugin config: {e}")))?;
    config
        .validate()
        .map_err(|e| ServerError::Configuration(format!("Invalid {plugin} plugin config: {e}")))?;
    Ok(config)
}

/// Options of plugins that provide an authentication scheme.
///
/// When `strategy` is set the plugin also registers a strategy of that name,
/// configured with the remaining options.
#[derive(Debug, Default, serde::Deserialize, validator::Validate)]
#[validate(schema(function = "AuthPluginConfig::validate_default"))]
pub(crate) struct AuthPluginConfig {
    strategy: Option<String>,
    /// Make the strategy the server default
    #[serde(default)]
    default: bool,
    #[serde(flatten)]
    options: serde_json::Map<String, JsonValue>,
}

impl AuthPluginConfig {
    fn validate_default(&self) -> Result<(), validator::ValidationError> {
        if self.default && self.strategy.is_none() {
            return Err(validator::ValidationError::new(
                "default requires a strategy name",
            ));
        }
        Ok(())
    }

    pub(crate) fn apply(&self, scope: &mut PluginScope<'_>, scheme: &str) -> ServerResult<()> {
        let Some(strategy) = &self.strategy else {
            return Ok(());
        };
        scope.auth_strategy(strategy, scheme, JsonValue::Object(self.options.clone()))?;
        if self.default {
            scope.auth_default(RouteAuth::required(strategy.as_str()))?;
        }
        Ok(())
    }
}

/// Compares secrets without short-circuiting on the first differing byte.
pub(crate) fn constant_time_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_build_builtin_plugins() {
        for name in ["request-id", "cors", "basic-auth", "key-auth"] {
            let plugin = build_plugin(name, JsonValue::Null).unwrap();
            assert_eq!(plugin.name(), name);
        }
        assert!(build_plugin("nope", json!({})).is_err());
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("secret", "secret"));
        assert!(!constant_time_eq("secret", "secreT"));
        assert!(!constant_time_eq("secret", "secrets"));
    }
}
