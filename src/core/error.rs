//! Composition-time error handling for portico
//!
//! Everything that can go wrong while a server is being assembled (route
//! conflicts, plugin dependency problems, extension ordering cycles, bad
//! configuration) is reported through [`ServerError`]. These errors are fatal:
//! a server that produced one never starts serving.

use std::fmt;

/// Unified error types for server composition and lifecycle control
#[derive(Debug)]
pub enum ServerError {
    /// Two routes resolve to the same specificity for one method and vhost
    RouteConflict(String),

    /// A route definition that can never be matched or executed
    InvalidRoute(String),

    /// A plugin dependency is missing or the dependency graph has a cycle
    DependencyUnresolved(String),

    /// A name (plugin, exposed key, method, strategy) is already taken
    NameConflict(String),

    /// A plugin failed while registering
    Registration(String),

    /// Extension ordering constraints do not form a DAG
    ExtensionCycle(String),

    /// Invalid server or route configuration
    Configuration(String),

    /// Mutation attempted after composition completed
    Frozen(String),

    /// Cache backend failures
    Cache(String),

    /// Internal system errors
    Internal(String),

    /// File and stream I/O errors
    Io(std::io::Error),

    /// (De)serialization failures
    Serialization(String),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::RouteConflict(msg) => write!(f, "Route conflict: {msg}"),
            ServerError::InvalidRoute(msg) => write!(f, "Invalid route: {msg}"),
            ServerError::DependencyUnresolved(msg) => write!(f, "Dependency unresolved: {msg}"),
            ServerError::NameConflict(msg) => write!(f, "Name conflict: {msg}"),
            ServerError::Registration(msg) => write!(f, "Registration error: {msg}"),
            ServerError::ExtensionCycle(msg) => write!(f, "Extension ordering cycle: {msg}"),
            ServerError::Configuration(msg) => write!(f, "Configuration error: {msg}"),
            ServerError::Frozen(msg) => write!(f, "Server already composed: {msg}"),
            ServerError::Cache(msg) => write!(f, "Cache error: {msg}"),
            ServerError::Internal(msg) => write!(f, "Internal error: {msg}"),
            ServerError::Io(err) => write!(f, "I/O error: {err}"),
            ServerError::Serialization(msg) => write!(f, "Serialization error: {msg}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl ServerError {
    /// Wraps a (de)serialization failure with some context.
    pub fn serialization_error(context: &str, err: impl fmt::Display) -> Self {
        ServerError::Serialization(format!("{context}: {err}"))
    }

    /// True for errors that must stop the server from starting.
    pub fn is_composition_error(&self) -> bool {
        matches!(
            self,
            ServerError::RouteConflict(_)
                | ServerError::InvalidRoute(_)
                | ServerError::DependencyUnresolved(_)
                | ServerError::NameConflict(_)
                | ServerError::Registration(_)
                | ServerError::ExtensionCycle(_)
                | ServerError::Configuration(_)
        )
    }
}

// Error conversions
impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        ServerError::Io(err)
    }
}

impl From<serde_json::Error> for ServerError {
    fn from(err: serde_json::Error) -> Self {
        ServerError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for ServerError {
    fn from(err: serde_yaml::Error) -> Self {
        ServerError::Serialization(err.to_string())
    }
}

impl From<validator::ValidationErrors> for ServerError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServerError::Configuration(err.to_string())
    }
}

/// Result type alias for composition operations
pub type ServerResult<T> = std::result::Result<T, ServerError>;

/// Helper trait for adding context to errors
pub trait ErrorContext<T> {
    fn with_context(self, context: &str) -> ServerResult<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: fmt::Display,
{
    fn with_context(self, context: &str) -> ServerResult<T> {
        self.map_err(|e| ServerError::Internal(format!("{context}: {e}")))
    }
}

/// Convenience macros for error creation
#[macro_export]
macro_rules! config_error {
    ($msg:expr) => {
        $crate::core::ServerError::Configuration($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::core::ServerError::Configuration(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! route_error {
    ($msg:expr) => {
        $crate::core::ServerError::InvalidRoute($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::core::ServerError::InvalidRoute(format!($fmt, $($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ServerError::RouteConflict("GET /a".to_string());
        assert_eq!(err.to_string(), "Route conflict: GET /a");
        assert!(err.is_composition_error());

        let err: ServerError = std::io::Error::new(std::io::ErrorKind::NotFound, "missing").into();
        assert!(matches!(err, ServerError::Io(_)));
        assert!(!err.is_composition_error());
    }

    #[test]
    fn test_error_macros() {
        let err = config_error!("bad {}", "value");
        assert!(matches!(err, ServerError::Configuration(ref m) if m == "bad value"));

        let err = route_error!("no handler");
        assert!(matches!(err, ServerError::InvalidRoute(_)));
    }

    #[test]
    fn test_with_context() {
        let result: std::result::Result<(), &str> = Err("boom");
        let err = result.with_context("loading").unwrap_err();
        assert_eq!(err.to_string(), "Internal error: loading: boom");
    }
}
