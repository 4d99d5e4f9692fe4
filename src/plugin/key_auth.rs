use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use validator::Validate;

use super::{constant_time_eq, parse_config, AuthPluginConfig, Plugin, PluginScope};
use crate::{
    core::{AuthScheme, Boom, Request, ServerResult, Toolkit},
    utils::request,
};

pub const PLUGIN_NAME: &str = "key-auth";
pub const SCHEME_NAME: &str = "api-key";

/// Default header and query parameter carrying the key
const DEFAULT_API_KEY_NAME: &str = "apikey";

/// Creates a Key Auth plugin instance with the given configuration.
pub fn create_key_auth_plugin(cfg: JsonValue) -> ServerResult<Arc<dyn Plugin>> {
    let config: AuthPluginConfig = parse_config(PLUGIN_NAME, cfg)?;
    Ok(Arc::new(PluginKeyAuth { config }))
}

/// Options of one `api-key` strategy
#[derive(Debug, Serialize, Deserialize, Validate)]
struct SchemeConfig {
    /// HTTP header carrying the key
    #[serde(default = "SchemeConfig::default_name")]
    header: String,

    /// Query parameter carrying the key, checked when the header is absent
    #[serde(default = "SchemeConfig::default_name")]
    query: String,

    /// Accepted keys and the credentials each one resolves to. Several keys
    /// allow rotation.
    #[validate(length(min = 1))]
    keys: HashMap<String, JsonValue>,
}

impl SchemeConfig {
    fn default_name() -> String {
        DEFAULT_API_KEY_NAME.to_string()
    }
}

/// Registers the `api-key` scheme, and optionally a strategy using it.
pub struct PluginKeyAuth {
    config: AuthPluginConfig,
}

#[async_trait]
impl Plugin for PluginKeyAuth {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    async fn register(&self, scope: &mut PluginScope<'_>, _options: JsonValue) -> ServerResult<()> {
        scope.auth_scheme(SCHEME_NAME, |options| {
            let config: SchemeConfig = parse_config(SCHEME_NAME, options)?;
            let scheme: Arc<dyn AuthScheme> = Arc::new(KeyScheme { config });
            Ok(scheme)
        })?;
        self.config.apply(scope, SCHEME_NAME)
    }
}

struct KeyScheme {
    config: SchemeConfig,
}

impl KeyScheme {
    fn lookup(&self, provided: &str) -> Option<&JsonValue> {
        // Compare against every key so timing does not reveal which matched.
        let mut found = None;
        for (key, credentials) in &self.config.keys {
            if constant_time_eq(provided, key) {
                found = Some(credentials);
            }
        }
        found
    }
}

#[async_trait]
impl AuthScheme for KeyScheme {
    async fn authenticate(&self, req: &Request, _h: &Toolkit) -> Result<JsonValue, Boom> {
        let provided = request::get_header_value(&req.headers, &self.config.header)
            .map(str::to_string)
            .or_else(|| req.query.get(&self.config.query).cloned())
            .filter(|v| !v.is_empty());

        let Some(provided) = provided else {
            return Err(Boom::unauthorized("Missing authentication", Some("ApiKey")));
        };

        match self.lookup(&provided) {
            Some(JsonValue::Null) => Ok(json!({})),
            Some(credentials) => Ok(credentials.clone()),
            None => Err(Boom::unauthorized(
                "Invalid user authorization",
                Some("ApiKey error=\"invalid_key\""),
            )),
        }
    }
}
