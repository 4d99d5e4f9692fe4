use std::{collections::HashSet, sync::Arc};

use async_trait::async_trait;
use http::{header, Method, StatusCode};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use validator::{Validate, ValidationError};

use super::{parse_config, Plugin, PluginScope};
use crate::{
    core::{Boom, Extension, Flow, Request, Response, ServerError, ServerResult, Toolkit},
    lifecycle::ext::ExtPoint,
    utils::request,
};

pub const PLUGIN_NAME: &str = "cors";

const ALL_METHODS: &str = "GET,POST,PUT,DELETE,PATCH,OPTIONS,HEAD";

/// Creates a CORS plugin instance with the given configuration.
pub fn create_cors_plugin(cfg: JsonValue) -> ServerResult<Arc<dyn Plugin>> {
    let config: PluginConfig = parse_config(PLUGIN_NAME, cfg)?;

    // Pre-compile regex patterns
    let compiled_config = config.compile_regexes()?;

    Ok(Arc::new(PluginCors {
        config: Arc::new(compiled_config),
    }))
}

#[derive(Debug, Serialize, Deserialize, Default, Validate)]
#[validate(schema(function = "PluginConfig::validate"))]
pub struct PluginConfig {
    /// Allowed origins, comma separated. `*` allows any origin when no
    /// credentials are used, `**` allows any origin unconditionally.
    #[serde(default = "PluginConfig::default_star")]
    #[validate(custom(function = "PluginConfig::validate_origins"))]
    pub allow_origins: String,

    /// Allowed methods, comma separated, with the same wildcards.
    #[serde(default = "PluginConfig::default_star")]
    #[validate(custom(function = "PluginConfig::validate_methods"))]
    pub allow_methods: String,

    /// Allowed request headers. `**` echoes `Access-Control-Request-Headers`.
    #[serde(default = "PluginConfig::default_star")]
    #[validate(custom(function = "PluginConfig::validate_headers"))]
    pub allow_headers: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub expose_headers: Option<String>,

    /// Seconds a preflight result may be cached, -1 disables caching
    #[serde(default = "PluginConfig::default_max_age")]
    pub max_age: i32,

    #[serde(default)]
    pub allow_credential: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_origins_by_regex: Option<Vec<String>>,
}

impl PluginConfig {
    fn default_star() -> String {
        "*".to_string()
    }

    fn default_max_age() -> i32 {
        5
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.allow_credential && self.allow_origins == "*" {
            return Err(ValidationError::new(
                "allow_credential cannot be used with allow_origins='*'",
            ));
        }
        Ok(())
    }

    fn validate_origins(origins: &str) -> Result<(), ValidationError> {
        if origins.is_empty() {
            return Err(ValidationError::new("allow_origins cannot be empty"));
        }
        if origins != "*" && origins != "**" && origins.split(',').any(|o| o.trim().is_empty()) {
            return Err(ValidationError::new("allow_origins contains empty origin"));
        }
        Ok(())
    }

    fn validate_methods(methods: &str) -> Result<(), ValidationError> {
        if methods != "*" && methods != "**" {
            for method in methods.split(',').map(str::trim) {
                if !ALL_METHODS
                    .split(',')
                    .any(|m| m.eq_ignore_ascii_case(method))
                {
                    return Err(ValidationError::new("invalid HTTP method"));
                }
            }
        }
        Ok(())
    }

    fn validate_headers(headers: &str) -> Result<(), ValidationError> {
        if headers != "*" && headers != "**" {
            for header in headers.split(',').map(str::trim) {
                if !header.chars().all(|c| c.is_alphanumeric() || c == '-') {
                    return Err(ValidationError::new("invalid header name"));
                }
            }
        }
        Ok(())
    }

    fn compile_regexes(self) -> ServerResult<CompiledPluginConfig> {
        let allow_origins_by_regex = self
            .allow_origins_by_regex
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(|re| {
                Regex::new(re)
                    .map_err(|e| ServerError::Configuration(format!("Invalid regex {re}: {e}")))
            })
            .collect::<ServerResult<Vec<_>>>()?;

        Ok(CompiledPluginConfig {
            allowed: self
                .allow_origins
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            allow_origins: self.allow_origins,
            allow_methods: self.allow_methods,
            allow_headers: self.allow_headers,
            expose_headers: self.expose_headers,
            max_age: self.max_age,
            allow_credential: self.allow_credential,
            allow_origins_by_regex,
        })
    }
}

#[derive(Debug)]
pub struct CompiledPluginConfig {
    allow_origins: String,
    allowed: HashSet<String>,
    allow_methods: String,
    allow_headers: String,
    expose_headers: Option<String>,
    max_age: i32,
    allow_credential: bool,
    allow_origins_by_regex: Vec<Regex>,
}

impl CompiledPluginConfig {
    fn is_origin_allowed(&self, origin: &str) -> bool {
        if self.allow_origins == "*" || self.allow_origins == "**" {
            return true;
        }
        self.allowed.contains(origin) || self.allow_origins_by_regex.iter().any(|re| re.is_match(origin))
    }

    /// CORS response headers for a request, `None` if the origin is absent
    /// or not allowed.
    fn headers_for(&self, req: &Request) -> Option<Vec<(&'static str, String)>> {
        let origin = request::get_header_value(&req.headers, header::ORIGIN.as_str())?;
        if !self.is_origin_allowed(origin) {
            return None;
        }

        let mut headers = vec![("access-control-allow-origin", origin.to_string())];
        if self.allow_credential {
            headers.push(("access-control-allow-credentials", "true".to_string()));
        }

        let methods = if self.allow_methods == "**" {
            ALL_METHODS.to_string()
        } else {
            self.allow_methods.clone()
        };
        headers.push(("access-control-allow-methods", methods));

        let allow_headers = if self.allow_headers == "**" {
            request::get_header_value(&req.headers, header::ACCESS_CONTROL_REQUEST_HEADERS.as_str())
                .unwrap_or_default()
                .to_string()
        } else {
            self.allow_headers.clone()
        };
        headers.push(("access-control-allow-headers", allow_headers));
        headers.push(("access-control-max-age", self.max_age.to_string()));

        if let Some(expose) = &self.expose_headers {
            headers.push(("access-control-expose-headers", expose.clone()));
        }
        if self.allow_origins != "*" {
            headers.push(("vary", "Origin".to_string()));
        }
        Some(headers)
    }
}

pub struct PluginCors {
    config: Arc<CompiledPluginConfig>,
}

#[async_trait]
impl Plugin for PluginCors {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    async fn register(&self, scope: &mut PluginScope<'_>, _options: JsonValue) -> ServerResult<()> {
        scope.ext(ExtPoint::OnRequest, Preflight(self.config.clone()))?;
        scope.ext(ExtPoint::OnPreResponse, CorsHeaders(self.config.clone()))
    }
}

/// Answers allowed `OPTIONS` preflights before routing.
struct Preflight(Arc<CompiledPluginConfig>);

#[async_trait]
impl Extension for Preflight {
    async fn run(&self, req: &mut Request, _h: &Toolkit) -> Result<Flow, Boom> {
        if req.method != Method::OPTIONS {
            return Ok(Flow::Continue);
        }
        match self.0.headers_for(req) {
            Some(headers) => {
                let response = headers
                    .into_iter()
                    .fold(Response::empty().code(StatusCode::NO_CONTENT), |r, (k, v)| {
                        r.header(k, v)
                    });
                Ok(Flow::Respond(response.takeover()))
            }
            None => Ok(Flow::Continue),
        }
    }
}

/// Adds CORS headers to every outgoing response.
struct CorsHeaders(Arc<CompiledPluginConfig>);

#[async_trait]
impl Extension for CorsHeaders {
    async fn run(&self, req: &mut Request, _h: &Toolkit) -> Result<Flow, Boom> {
        if let Some(headers) = self.0.headers_for(req) {
            if let Some(response) = req.response.as_mut() {
                for (name, value) in headers {
                    response.set_header(name, value);
                }
            }
        }
        Ok(Flow::Continue)
    }
}
