use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use http::header;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use validator::Validate;

use super::{constant_time_eq, parse_config, AuthPluginConfig, Plugin, PluginScope};
use crate::{
    core::{AuthScheme, Boom, Request, ServerResult, Toolkit},
    utils::request,
};

pub const PLUGIN_NAME: &str = "basic-auth";
pub const SCHEME_NAME: &str = "basic";

/// Creates a Basic Auth plugin instance.
pub fn create_basic_auth_plugin(cfg: JsonValue) -> ServerResult<Arc<dyn Plugin>> {
    let config: AuthPluginConfig = parse_config(PLUGIN_NAME, cfg)?;
    Ok(Arc::new(PluginBasicAuth { config }))
}

/// Options of one `basic` strategy
#[derive(Debug, Serialize, Deserialize, Validate)]
struct SchemeConfig {
    #[validate(length(min = 1))]
    users: HashMap<String, User>,
    #[serde(default = "SchemeConfig::default_realm")]
    realm: String,
}

impl SchemeConfig {
    fn default_realm() -> String {
        "portico".to_string()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct User {
    password: String,
    #[serde(default)]
    scope: Vec<String>,
}

/// Registers the `basic` scheme, and optionally a strategy using it.
pub struct PluginBasicAuth {
    config: AuthPluginConfig,
}

#[async_trait]
impl Plugin for PluginBasicAuth {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    async fn register(&self, scope: &mut PluginScope<'_>, _options: JsonValue) -> ServerResult<()> {
        scope.auth_scheme(SCHEME_NAME, |options| {
            let config: SchemeConfig = parse_config(SCHEME_NAME, options)?;
            let scheme: Arc<dyn AuthScheme> = Arc::new(BasicScheme {
                challenge: format!("Basic realm=\"{}\"", config.realm),
                config,
            });
            Ok(scheme)
        })?;
        self.config.apply(scope, SCHEME_NAME)
    }
}

struct BasicScheme {
    config: SchemeConfig,
    challenge: String,
}

impl BasicScheme {
    /// Returns the username when the header carries valid credentials.
    fn validate_credentials(&self, auth_value: &str) -> Option<(&str, &User)> {
        let (prefix, credential_part) = auth_value.split_once(' ')?;
        if !prefix.eq_ignore_ascii_case("basic") {
            return None;
        }

        let decoded_bytes = general_purpose::STANDARD
            .decode(credential_part.trim())
            .ok()?;
        let decoded_str = String::from_utf8(decoded_bytes).ok()?;
        let (user, pass) = decoded_str.split_once(':')?;

        let (name, entry) = self.config.users.get_key_value(user)?;
        constant_time_eq(pass, &entry.password).then_some((name.as_str(), entry))
    }
}

#[async_trait]
impl AuthScheme for BasicScheme {
    async fn authenticate(&self, req: &Request, _h: &Toolkit) -> Result<JsonValue, Boom> {
        let Some(auth_header) = request::get_header_value(&req.headers, header::AUTHORIZATION.as_str())
        else {
            return Err(Boom::unauthorized("Missing authentication", Some(self.challenge.as_str())));
        };

        match self.validate_credentials(auth_header) {
            Some((username, user)) => Ok(json!({
                "username": username,
                "scope": user.scope,
            })),
            None => Err(Boom::unauthorized(
                "Invalid user authorization",
                Some(self.challenge.as_str()),
            )),
        }
    }
}
