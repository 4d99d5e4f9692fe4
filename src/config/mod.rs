pub mod manifest;

use std::{fs, time::Duration};

use log::{debug, trace};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use validator::{Validate, ValidationError};

use crate::core::{ServerError, ServerResult};

pub use manifest::{Manifest, PluginEntry};

const DEFAULT_MAX_BYTES: usize = 1024 * 1024;
const DEFAULT_PAYLOAD_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_HSTS_MAX_AGE: u64 = 15_768_000;

#[derive(Clone, Default, Debug, Serialize, Deserialize, Validate)]
pub struct ServerConfig {
    /// Listener labels; one connection is composed per entry
    #[serde(default)]
    pub listeners: Vec<Listener>,

    #[serde(default)]
    pub router: RouterConfig,

    /// Defaults applied to every route
    #[validate(nested)]
    #[serde(default)]
    pub routes: RouteConfig,

    #[serde(default)]
    pub debug: DebugConfig,

    #[validate(nested)]
    #[serde(default)]
    pub compression: CompressionConfig,

    #[serde(default)]
    pub load: LoadConfig,

    pub log: Option<Log>,

    /// Free-form application settings
    #[serde(default)]
    pub app: JsonValue,
}

impl ServerConfig {
    pub fn load_from_yaml<P>(path: P) -> ServerResult<Self>
    where
        P: AsRef<std::path::Path> + std::fmt::Display,
    {
        let conf_str = fs::read_to_string(&path)?;
        debug!("Conf file read from {path}");
        Self::from_yaml(&conf_str)
    }

    pub fn from_yaml(conf_str: &str) -> ServerResult<Self> {
        trace!("Read conf file: {conf_str}");
        let conf: ServerConfig = serde_yaml::from_str(conf_str)
            .map_err(|e| ServerError::serialization_error("Unable to parse yaml conf", e))?;

        trace!("Loaded conf: {conf:?}");

        conf.validate()?;

        Ok(conf)
    }

    pub fn to_yaml(&self) -> ServerResult<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Labels of every composed connection. A server without listeners has a
    /// single unlabelled connection.
    pub fn connection_labels(&self) -> Vec<Vec<String>> {
        if self.listeners.is_empty() {
            vec![Vec::new()]
        } else {
            self.listeners.iter().map(|l| l.labels.clone()).collect()
        }
    }
}

#[derive(Clone, Default, Debug, Serialize, Deserialize)]
pub struct Listener {
    #[serde(default)]
    pub labels: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default = "RouterConfig::default_case_sensitive")]
    pub is_case_sensitive: bool,
    #[serde(default)]
    pub strip_trailing_slash: bool,
}

impl RouterConfig {
    fn default_case_sensitive() -> bool {
        true
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            is_case_sensitive: true,
            strip_trailing_slash: false,
        }
    }
}

#[derive(Clone, Default, Debug, Serialize, Deserialize)]
pub struct DebugConfig {
    /// Include 5xx messages in error envelopes
    #[serde(default)]
    pub expose_errors: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct CompressionConfig {
    /// Bodies smaller than this are never encoded
    #[serde(default = "CompressionConfig::default_min_bytes")]
    pub min_bytes: usize,
}

impl CompressionConfig {
    fn default_min_bytes() -> usize {
        1024
    }
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self { min_bytes: 1024 }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoadConfig {
    /// How long `stop()` waits for in-flight requests
    #[serde(default = "LoadConfig::default_stop_timeout")]
    pub stop_timeout_ms: u64,
}

impl LoadConfig {
    fn default_stop_timeout() -> u64 {
        5000
    }
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            stop_timeout_ms: 5000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Log {
    pub path: String,
    #[serde(default)]
    pub level: Option<String>,
}

/// Per-route options.
///
/// Every field is optional so configurations can be layered: server
/// defaults, then realm defaults, then the route itself.
#[derive(Clone, Default, Debug, Serialize, Deserialize, Validate)]
#[validate(schema(function = "RouteConfig::validate_timeouts"))]
pub struct RouteConfig {
    #[serde(default)]
    pub timeout: TimeoutConfig,

    #[validate(nested)]
    #[serde(default)]
    pub payload: PayloadConfig,

    #[validate(nested)]
    #[serde(default)]
    pub cache: CacheConfig,

    pub security: Option<SecurityConfig>,

    pub compression: Option<bool>,
}

impl RouteConfig {
    fn validate_timeouts(&self) -> Result<(), ValidationError> {
        if let (Some(server), Some(socket)) = (self.timeout.server, self.timeout.socket) {
            if socket <= server {
                return Err(ValidationError::new(
                    "socket timeout must be greater than the server timeout",
                ));
            }
        }
        Ok(())
    }

    /// Layers `other` on top of `self`, field by field.
    pub fn merge(&self, other: &RouteConfig) -> RouteConfig {
        RouteConfig {
            timeout: TimeoutConfig {
                server: other.timeout.server.or(self.timeout.server),
                socket: other.timeout.socket.or(self.timeout.socket),
            },
            payload: PayloadConfig {
                parse: other.payload.parse.or(self.payload.parse),
                output: other.payload.output.or(self.payload.output),
                max_bytes: other.payload.max_bytes.or(self.payload.max_bytes),
                timeout: other.payload.timeout.or(self.payload.timeout),
                allow: other
                    .payload
                    .allow
                    .clone()
                    .or_else(|| self.payload.allow.clone()),
            },
            cache: CacheConfig {
                expires_in: other.cache.expires_in.or(self.cache.expires_in),
                privacy: other.cache.privacy.or(self.cache.privacy),
                statuses: other
                    .cache
                    .statuses
                    .clone()
                    .or_else(|| self.cache.statuses.clone()),
            },
            security: other.security.clone().or_else(|| self.security.clone()),
            compression: other.compression.or(self.compression),
        }
    }

    /// Resolves the layered options into concrete settings.
    pub fn resolve(&self) -> ServerResult<RouteSettings> {
        self.validate()?;

        let cache = match self.cache.expires_in {
            Some(expires_in) => Some(CacheSettings {
                expires_in: Duration::from_millis(expires_in),
                privacy: self.cache.privacy.unwrap_or_default(),
                statuses: self.cache.statuses.clone().unwrap_or_else(|| vec![200, 204]),
            }),
            None => None,
        };

        Ok(RouteSettings {
            server_timeout: self.timeout.server.map(Duration::from_millis),
            socket_timeout: self.timeout.socket.map(Duration::from_millis),
            payload: PayloadSettings {
                parse: self.payload.parse.unwrap_or(true),
                output: self.payload.output.unwrap_or_default(),
                max_bytes: self.payload.max_bytes.unwrap_or(DEFAULT_MAX_BYTES),
                timeout: Duration::from_millis(
                    self.payload.timeout.unwrap_or(DEFAULT_PAYLOAD_TIMEOUT_MS),
                ),
                allow: self.payload.allow.clone(),
            },
            cache,
            security: self.security.clone(),
            compression: self.compression.unwrap_or(true),
        })
    }
}

#[derive(Clone, Default, Debug, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Routing to response, in milliseconds
    pub server: Option<u64>,
    /// Idle outbound socket, in milliseconds
    pub socket: Option<u64>,
}

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadOutput {
    /// Read fully and (optionally) parse
    #[default]
    Data,
    /// Hand the raw stream to the handler
    Stream,
}

#[derive(Clone, Default, Debug, Serialize, Deserialize, Validate)]
pub struct PayloadConfig {
    pub parse: Option<bool>,
    pub output: Option<PayloadOutput>,
    #[validate(range(min = 1))]
    pub max_bytes: Option<usize>,
    /// Client timeout for receiving the full body, in milliseconds
    pub timeout: Option<u64>,
    /// Accepted content types
    pub allow: Option<Vec<String>>,
}

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CachePrivacy {
    #[default]
    Default,
    Public,
    Private,
}

#[derive(Clone, Default, Debug, Serialize, Deserialize, Validate)]
#[validate(schema(function = "CacheConfig::validate_statuses"))]
pub struct CacheConfig {
    /// Client cache lifetime in milliseconds
    pub expires_in: Option<u64>,
    pub privacy: Option<CachePrivacy>,
    pub statuses: Option<Vec<u16>>,
}

impl CacheConfig {
    fn validate_statuses(&self) -> Result<(), ValidationError> {
        match &self.statuses {
            Some(statuses) if !statuses.contains(&200) => {
                Err(ValidationError::new("cache statuses must include 200"))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// `Strict-Transport-Security` max-age in seconds, `None` to disable
    #[serde(default = "SecurityConfig::default_hsts")]
    pub hsts: Option<u64>,
    #[serde(default = "SecurityConfig::default_xframe")]
    pub xframe: Option<String>,
    #[serde(default = "SecurityConfig::default_true")]
    pub xss: bool,
    #[serde(default = "SecurityConfig::default_true")]
    pub no_open: bool,
    #[serde(default = "SecurityConfig::default_true")]
    pub no_sniff: bool,
    #[serde(default)]
    pub referrer: Option<String>,
}

impl SecurityConfig {
    fn default_hsts() -> Option<u64> {
        Some(DEFAULT_HSTS_MAX_AGE)
    }

    fn default_xframe() -> Option<String> {
        Some("DENY".to_string())
    }

    fn default_true() -> bool {
        true
    }

    /// Header pairs emitted on every response of the route.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = Vec::new();
        if let Some(max_age) = self.hsts {
            headers.push(("strict-transport-security", format!("max-age={max_age}")));
        }
        if let Some(xframe) = &self.xframe {
            headers.push(("x-frame-options", xframe.clone()));
        }
        if self.xss {
            headers.push(("x-xss-protection", "0".to_string()));
        }
        if self.no_open {
            headers.push(("x-download-options", "noopen".to_string()));
        }
        if self.no_sniff {
            headers.push(("x-content-type-options", "nosniff".to_string()));
        }
        if let Some(referrer) = &self.referrer {
            headers.push(("referrer-policy", referrer.clone()));
        }
        headers
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            hsts: Self::default_hsts(),
            xframe: Self::default_xframe(),
            xss: true,
            no_open: true,
            no_sniff: true,
            referrer: None,
        }
    }
}

/// Fully resolved route options
#[derive(Clone, Debug)]
pub struct RouteSettings {
    pub server_timeout: Option<Duration>,
    pub socket_timeout: Option<Duration>,
    pub payload: PayloadSettings,
    pub cache: Option<CacheSettings>,
    pub security: Option<SecurityConfig>,
    pub compression: bool,
}

#[derive(Clone, Debug)]
pub struct PayloadSettings {
    pub parse: bool,
    pub output: PayloadOutput,
    pub max_bytes: usize,
    pub timeout: Duration,
    pub allow: Option<Vec<String>>,
}

#[derive(Clone, Debug)]
pub struct CacheSettings {
    pub expires_in: Duration,
    pub privacy: CachePrivacy,
    pub statuses: Vec<u16>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_log() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn test_load_config() {
        init_log();
        let conf_str = r#"
---
listeners:
  - labels: [api]
  - labels: [admin]

router:
  strip_trailing_slash: true

routes:
  timeout:
    server: 50
    socket: 100
  cache:
    expires_in: 60000
    privacy: private

debug:
  expose_errors: true
        "#;
        let conf = ServerConfig::from_yaml(conf_str).unwrap();
        assert_eq!(2, conf.listeners.len());
        assert!(conf.router.is_case_sensitive);
        assert!(conf.router.strip_trailing_slash);
        assert_eq!(Some(50), conf.routes.timeout.server);
        assert_eq!(1024, conf.compression.min_bytes);
        assert!(conf.debug.expose_errors);
        assert_eq!(
            vec![vec!["api".to_string()], vec!["admin".to_string()]],
            conf.connection_labels()
        );
    }

    #[test]
    fn test_socket_timeout_must_exceed_server_timeout() {
        init_log();
        let conf_str = r#"
routes:
  timeout:
    server: 100
    socket: 100
        "#;
        assert!(ServerConfig::from_yaml(conf_str).is_err());
    }

    #[test]
    fn test_cache_statuses_require_200() {
        init_log();
        let conf_str = r#"
routes:
  cache:
    expires_in: 1000
    statuses: [204]
        "#;
        assert!(ServerConfig::from_yaml(conf_str).is_err());
    }

    #[test]
    fn test_max_bytes_must_be_positive() {
        init_log();
        let conf_str = r#"
routes:
  payload:
    max_bytes: 0
        "#;
        assert!(ServerConfig::from_yaml(conf_str).is_err());
    }

    #[test]
    fn test_merge_and_resolve() {
        let base = RouteConfig {
            timeout: TimeoutConfig {
                server: Some(1000),
                socket: None,
            },
            compression: Some(false),
            ..Default::default()
        };
        let route = RouteConfig {
            timeout: TimeoutConfig {
                server: Some(50),
                socket: None,
            },
            cache: CacheConfig {
                expires_in: Some(30_000),
                ..Default::default()
            },
            ..Default::default()
        };

        let settings = base.merge(&route).resolve().unwrap();
        assert_eq!(Some(Duration::from_millis(50)), settings.server_timeout);
        assert!(!settings.compression);
        assert!(settings.payload.parse);
        assert_eq!(DEFAULT_MAX_BYTES, settings.payload.max_bytes);

        let cache = settings.cache.unwrap();
        assert_eq!(Duration::from_secs(30), cache.expires_in);
        assert_eq!(CachePrivacy::Default, cache.privacy);
    }

    #[test]
    fn test_security_headers() {
        let headers = SecurityConfig::default().headers();
        assert!(headers
            .iter()
            .any(|(k, v)| *k == "strict-transport-security" && v == "max-age=15768000"));
        assert!(headers.iter().any(|(k, _)| *k == "x-content-type-options"));
        assert!(!headers.iter().any(|(k, _)| *k == "referrer-policy"));
    }
}
