//! Authentication schemes, strategies and route access checks.

use std::{collections::HashMap, sync::Arc};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::{
    core::{AuthScheme, Boom, ErrorKind, Request, ServerError, ServerResult, Toolkit},
    lifecycle::protect::protect,
    plugin::Realm,
    server::Shared,
};

/// Builds a configured scheme instance from strategy options
pub type SchemeFactory = Arc<dyn Fn(JsonValue) -> ServerResult<Arc<dyn AuthScheme>> + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// Skip authentication
    None,
    /// Continue without credentials when authentication fails
    Optional,
    #[default]
    Required,
}

/// Route authentication settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteAuth {
    #[serde(default)]
    pub mode: AuthMode,
    /// Strategies tried in order; empty means the default strategy's
    #[serde(default)]
    pub strategies: Vec<String>,
    /// Required credential scopes. `+` prefixes a required entry and `!` a
    /// forbidden one; at least one plain entry must match.
    #[serde(default)]
    pub scope: Option<Vec<String>>,
}

impl RouteAuth {
    pub fn required(strategy: impl Into<String>) -> Self {
        Self {
            mode: AuthMode::Required,
            strategies: vec![strategy.into()],
            scope: None,
        }
    }

    pub fn optional(strategy: impl Into<String>) -> Self {
        Self {
            mode: AuthMode::Optional,
            ..Self::required(strategy)
        }
    }

    pub fn none() -> Self {
        Self {
            mode: AuthMode::None,
            strategies: Vec::new(),
            scope: None,
        }
    }

    pub fn strategy(mut self, strategy: impl Into<String>) -> Self {
        self.strategies.push(strategy.into());
        self
    }

    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.scope.get_or_insert_with(Vec::new).push(scope.into());
        self
    }
}

struct Strategy {
    scheme: String,
    instance: Arc<dyn AuthScheme>,
    realm: Arc<Realm>,
}

#[derive(Default)]
pub struct AuthRegistry {
    schemes: HashMap<String, SchemeFactory>,
    strategies: HashMap<String, Strategy>,
    default: Option<RouteAuth>,
}

impl AuthRegistry {
    pub fn add_scheme(&mut self, name: &str, factory: SchemeFactory) -> ServerResult<()> {
        if self.schemes.contains_key(name) {
            return Err(ServerError::NameConflict(format!(
                "authentication scheme {name} already exists"
            )));
        }
        self.schemes.insert(name.to_string(), factory);
        Ok(())
    }

    pub fn add_strategy(
        &mut self,
        name: &str,
        scheme: &str,
        options: JsonValue,
        realm: Arc<Realm>,
    ) -> ServerResult<()> {
        if self.strategies.contains_key(name) {
            return Err(ServerError::NameConflict(format!(
                "authentication strategy {name} already exists"
            )));
        }
        let factory = self.schemes.get(scheme).ok_or_else(|| {
            ServerError::Registration(format!(
                "strategy {name} uses unknown authentication scheme {scheme}"
            ))
        })?;
        let instance = factory(options)?;

        log::debug!("Adding auth strategy {name} (scheme {scheme})");
        self.strategies.insert(
            name.to_string(),
            Strategy {
                scheme: scheme.to_string(),
                instance,
                realm,
            },
        );
        Ok(())
    }

    pub fn set_default(&mut self, auth: RouteAuth) -> ServerResult<()> {
        if self.default.is_some() {
            return Err(ServerError::NameConflict(
                "default authentication strategy already set".to_string(),
            ));
        }
        self.default = Some(auth);
        Ok(())
    }

    pub fn scheme_of(&self, strategy: &str) -> Option<&str> {
        self.strategies.get(strategy).map(|s| s.scheme.as_str())
    }

    /// The settings a route actually runs with.
    ///
    /// A route without explicit settings uses the default (or none at all);
    /// a route without strategies borrows the default's.
    pub fn resolve(&self, route: Option<&RouteAuth>) -> Option<RouteAuth> {
        match (route, &self.default) {
            (None, default) => default.clone(),
            (Some(auth), _) if auth.mode == AuthMode::None => None,
            (Some(auth), Some(default)) if auth.strategies.is_empty() => Some(RouteAuth {
                strategies: default.strategies.clone(),
                ..auth.clone()
            }),
            (Some(auth), _) => Some(auth.clone()),
        }
    }

    /// Checks that every strategy a route refers to exists.
    pub fn verify(&self, auth: &RouteAuth, route: &str) -> ServerResult<()> {
        if auth.mode != AuthMode::None && auth.strategies.is_empty() {
            return Err(ServerError::InvalidRoute(format!(
                "{route} requires authentication but names no strategy"
            )));
        }
        for name in &auth.strategies {
            if !self.strategies.contains_key(name) {
                return Err(ServerError::InvalidRoute(format!(
                    "{route} uses unknown authentication strategy {name}"
                )));
            }
        }
        Ok(())
    }
}

/// Resolves credentials for a request, trying strategies in order.
pub(crate) async fn authenticate(
    req: &mut Request,
    auth: &RouteAuth,
    shared: &Arc<Shared>,
) -> Result<(), Boom> {
    req.auth.mode = Some(auth.mode);
    if auth.mode == AuthMode::None {
        return Ok(());
    }

    if req.auth.is_injected {
        req.auth.is_authenticated = true;
        return Ok(());
    }

    let mut challenges = Vec::new();
    let mut last_message = None;

    for name in &auth.strategies {
        let Some(strategy) = shared.auth.strategies.get(name) else {
            continue;
        };
        let h = Toolkit::new(shared.clone(), strategy.realm.clone(), None);
        let what = format!("auth strategy {name}");

        match protect(&what, strategy.instance.authenticate(req, &h)).await {
            Ok(credentials) => {
                req.auth.is_authenticated = true;
                req.auth.strategy = Some(name.clone());
                req.auth.credentials = Some(credentials);
                req.auth.error = None;
                return Ok(());
            }
            Err(boom) if boom.status() == http::StatusCode::UNAUTHORIZED => {
                log::debug!("request {} strategy {name} declined: {}", req.id, boom.message());
                challenges.extend(
                    boom.headers()
                        .iter()
                        .filter(|(k, _)| k.eq_ignore_ascii_case("www-authenticate"))
                        .map(|(_, v)| v.clone()),
                );
                last_message = Some(boom.message().to_string());
            }
            Err(boom) => {
                req.auth.error = Some(boom.message().to_string());
                if auth.mode == AuthMode::Optional {
                    return Ok(());
                }
                return Err(boom);
            }
        }
    }

    let message = last_message.unwrap_or_else(|| "Missing authentication".to_string());
    req.auth.error = Some(message.clone());
    if auth.mode == AuthMode::Optional {
        return Ok(());
    }

    let mut boom = Boom::unauthorized(message, None);
    if !challenges.is_empty() {
        boom = boom.with_header("WWW-Authenticate", challenges.join(", "));
    }
    Err(boom)
}

/// Enforces the route scope against the resolved credentials.
pub(crate) fn access(req: &Request, auth: &RouteAuth) -> Result<(), Boom> {
    let Some(required) = &auth.scope else {
        return Ok(());
    };
    if !req.auth.is_authenticated {
        return Ok(());
    }

    let granted: Vec<&str> = match req.auth.credentials.as_ref().map(|c| &c["scope"]) {
        Some(JsonValue::String(s)) => vec![s.as_str()],
        Some(JsonValue::Array(items)) => items.iter().filter_map(|v| v.as_str()).collect(),
        _ => Vec::new(),
    };

    if scope_allows(required, &granted) {
        Ok(())
    } else {
        Err(Boom::forbidden("Insufficient scope").with_kind(ErrorKind::Forbidden))
    }
}

fn scope_allows(required: &[String], granted: &[&str]) -> bool {
    let mut any_of = Vec::new();
    for entry in required {
        if let Some(name) = entry.strip_prefix('+') {
            if !granted.contains(&name) {
                return false;
            }
        } else if let Some(name) = entry.strip_prefix('!') {
            if granted.contains(&name) {
                return false;
            }
        } else {
            any_of.push(entry.as_str());
        }
    }
    any_of.is_empty() || any_of.iter().any(|s| granted.contains(s))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scopes(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_scope_rules() {
        assert!(scope_allows(&scopes(&["a", "b"]), &["b"]));
        assert!(!scope_allows(&scopes(&["a", "b"]), &["c"]));
        assert!(scope_allows(&scopes(&["+a", "+b"]), &["a", "b"]));
        assert!(!scope_allows(&scopes(&["+a", "+b"]), &["a"]));
        assert!(!scope_allows(&scopes(&["a", "!banned"]), &["a", "banned"]));
        assert!(scope_allows(&scopes(&["!banned"]), &[]));
    }

    #[test]
    fn test_resolve_uses_default() {
        let mut registry = AuthRegistry::default();
        assert!(registry.resolve(None).is_none());

        registry.set_default(RouteAuth::required("simple")).unwrap();
        assert!(registry.set_default(RouteAuth::required("other")).is_err());

        let resolved = registry.resolve(None).unwrap();
        assert_eq!(resolved.strategies, vec!["simple".to_string()]);

        let optional = RouteAuth {
            mode: AuthMode::Optional,
            ..Default::default()
        };
        let resolved = registry.resolve(Some(&optional)).unwrap();
        assert_eq!(resolved.mode, AuthMode::Optional);
        assert_eq!(resolved.strategies, vec!["simple".to_string()]);

        assert!(registry.resolve(Some(&RouteAuth::none())).is_none());
    }

    #[test]
    fn test_strategy_requires_known_scheme() {
        let mut registry = AuthRegistry::default();
        let realm = Arc::new(Realm::root());
        assert!(matches!(
            registry.add_strategy("s", "missing", JsonValue::Null, realm),
            Err(ServerError::Registration(_))
        ));
        assert!(registry
            .verify(&RouteAuth::required("s"), "GET /")
            .is_err());
    }
}
