use std::sync::Arc;

use async_trait::async_trait;
use http::{HeaderName, HeaderValue};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;
use validator::{Validate, ValidationError};

use super::{parse_config, Plugin, PluginScope};
use crate::{
    core::{Boom, Extension, Flow, Request, ServerError, ServerResult, Toolkit},
    lifecycle::ext::ExtPoint,
    utils::request,
};

pub const PLUGIN_NAME: &str = "request-id";

// Constants for configuration and request variable keys
const DEFAULT_HEADER_NAME: &str = "X-Request-Id";
const ALGORITHM_UUID: &str = "uuid";
const ALGORITHM_RANGE_ID: &str = "range_id";
pub const REQUEST_ID_KEY: &str = "request-id";
const DEFAULT_CHAR_SET: &str = "abcdefghijklmnopqrstuvwxyzABCDEFGHIGKLMNOPQRSTUVWXYZ0123456789";

/// Creates a Request ID plugin instance with the given configuration.
pub fn create_request_id_plugin(cfg: JsonValue) -> ServerResult<Arc<dyn Plugin>> {
    let config: PluginConfig = parse_config(PLUGIN_NAME, cfg)?;
    HeaderName::from_bytes(config.header_name.as_bytes()).map_err(|e| {
        ServerError::Configuration(format!("Invalid request id header name: {e}"))
    })?;

    Ok(Arc::new(PluginRequestID {
        config: Arc::new(config),
    }))
}

/// Configuration for the Request ID plugin.
#[derive(Default, Debug, Serialize, Deserialize, Validate)]
struct PluginConfig {
    #[serde(default = "PluginConfig::default_header_name")]
    header_name: String,
    #[serde(default = "PluginConfig::default_include_in_response")]
    include_in_response: bool,
    #[serde(default = "PluginConfig::default_algorithm")]
    #[validate(custom(function = "PluginConfig::validate_algorithm"))]
    algorithm: String,
    #[serde(default)]
    range_id: RangeID,
}

impl PluginConfig {
    fn default_header_name() -> String {
        DEFAULT_HEADER_NAME.to_string()
    }

    fn default_include_in_response() -> bool {
        true
    }

    fn default_algorithm() -> String {
        ALGORITHM_UUID.to_string()
    }

    fn validate_algorithm(algorithm: &str) -> Result<(), ValidationError> {
        if algorithm == ALGORITHM_UUID || algorithm == ALGORITHM_RANGE_ID {
            Ok(())
        } else {
            Err(ValidationError::new(
                "algorithm must be either 'uuid' or 'range_id'",
            ))
        }
    }

    fn get_request_id(&self) -> String {
        match self.algorithm.as_str() {
            ALGORITHM_RANGE_ID => self.get_range_id(),
            _ => Uuid::new_v4().to_string(),
        }
    }

    fn get_range_id(&self) -> String {
        let char_set = if self.range_id.char_set.is_empty() {
            DEFAULT_CHAR_SET
        } else {
            &self.range_id.char_set
        };
        let chars: Vec<char> = char_set.chars().collect();
        let mut rng = rand::thread_rng();
        (0..self.range_id.length)
            .filter_map(|_| chars.choose(&mut rng).copied())
            .collect()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RangeID {
    #[serde(default = "RangeID::default_char_set")]
    char_set: String,
    #[serde(default = "RangeID::default_length")]
    length: u32,
}

impl Default for RangeID {
    fn default() -> Self {
        Self {
            char_set: Self::default_char_set(),
            length: Self::default_length(),
        }
    }
}

impl RangeID {
    fn default_char_set() -> String {
        DEFAULT_CHAR_SET.to_string()
    }

    fn default_length() -> u32 {
        16
    }
}

/// Tags every request with an id, taken from the request header when the
/// client supplied one.
pub struct PluginRequestID {
    config: Arc<PluginConfig>,
}

#[async_trait]
impl Plugin for PluginRequestID {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    async fn register(&self, scope: &mut PluginScope<'_>, _options: JsonValue) -> ServerResult<()> {
        scope.ext(ExtPoint::OnRequest, AssignId(self.config.clone()))?;
        if self.config.include_in_response {
            scope.ext(ExtPoint::OnPreResponse, EchoId(self.config.clone()))?;
        }
        Ok(())
    }
}

struct AssignId(Arc<PluginConfig>);

#[async_trait]
impl Extension for AssignId {
    async fn run(&self, req: &mut Request, _h: &Toolkit) -> Result<Flow, Boom> {
        let value = match request::get_header_value(&req.headers, &self.0.header_name) {
            Some(s) => s.to_string(),
            None => {
                let request_id = self.0.get_request_id();
                let name = HeaderName::from_bytes(self.0.header_name.as_bytes())
                    .map_err(|e| Boom::internal(e.to_string()))?;
                let value =
                    HeaderValue::from_str(&request_id).map_err(|e| Boom::internal(e.to_string()))?;
                req.headers.insert(name, value);
                request_id
            }
        };

        req.set(REQUEST_ID_KEY, value);
        Ok(Flow::Continue)
    }
}

struct EchoId(Arc<PluginConfig>);

#[async_trait]
impl Extension for EchoId {
    async fn run(&self, req: &mut Request, _h: &Toolkit) -> Result<Flow, Boom> {
        let Some(value) = req.get_str(REQUEST_ID_KEY).map(str::to_string) else {
            return Ok(Flow::Continue);
        };
        if let Some(response) = req.response.as_mut() {
            response.set_header(self.0.header_name.clone(), value);
        }
        Ok(Flow::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(cfg: JsonValue) -> PluginConfig {
        parse_config(PLUGIN_NAME, cfg).unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = config(JsonValue::Null);
        assert_eq!(config.header_name, DEFAULT_HEADER_NAME);
        assert!(config.include_in_response);
        assert!(Uuid::parse_str(&config.get_request_id()).is_ok());
    }

    #[test]
    fn test_range_id() {
        let config = config(json!({
            "algorithm": "range_id",
            "range_id": {"char_set": "ab", "length": 8},
        }));
        let id = config.get_request_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c == 'a' || c == 'b'));
    }

    #[test]
    fn test_invalid_algorithm() {
        assert!(create_request_id_plugin(json!({"algorithm": "sequential"})).is_err());
        assert!(create_request_id_plugin(json!({"header_name": "bad header"})).is_err());
    }
}
