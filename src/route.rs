//! Route definitions.
//!
//! A [`RouteDef`] is what plugins hand to the server; composition turns it
//! into an immutable [`Route`] owned by its realm.

use std::{any::Any, fmt, sync::Arc};

use once_cell::sync::OnceCell;

use crate::{
    config::{RouteConfig, RouteSettings},
    core::{Bind, Extension, Handler, ServerError, ServerResult, Toolkit},
    lifecycle::{
        auth::RouteAuth,
        ext::{ExtBinding, ExtOptions, ExtPoint},
        prerequisites::{Pre, PrerequisiteGraph},
        validation::{FailAction, RouteValidation, Validator},
    },
    plugin::Realm,
    server::Shared,
};

/// Builder for a route
pub struct RouteDef {
    method: String,
    path: String,
    vhost: Vec<String>,
    id: Option<String>,
    handler: Option<Arc<dyn Handler>>,
    auth: Option<RouteAuth>,
    validation: RouteValidation,
    pre: Vec<Vec<Pre>>,
    config: RouteConfig,
    ext: Vec<(ExtPoint, Arc<dyn Extension>, ExtOptions)>,
    bind: Option<Bind>,
    tags: Vec<String>,
    description: Option<String>,
}

impl RouteDef {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            vhost: Vec::new(),
            id: None,
            handler: None,
            auth: None,
            validation: RouteValidation::default(),
            pre: Vec::new(),
            config: RouteConfig::default(),
            ext: Vec::new(),
            bind: None,
            tags: Vec::new(),
            description: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new("GET", path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new("POST", path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new("PUT", path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new("PATCH", path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new("DELETE", path)
    }

    /// Matches every method not registered explicitly on the same path.
    pub fn any(path: impl Into<String>) -> Self {
        Self::new("*", path)
    }

    pub fn handler(mut self, handler: impl Handler + 'static) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Unique route identifier used by [`crate::server::Server::lookup`].
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn vhost(mut self, host: impl Into<String>) -> Self {
        self.vhost.push(host.into());
        self
    }

    pub fn auth(mut self, auth: RouteAuth) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn no_auth(self) -> Self {
        self.auth(RouteAuth::none())
    }

    pub fn validate_headers(mut self, validator: impl Validator + 'static) -> Self {
        self.validation.headers = Some(Arc::new(validator));
        self
    }

    pub fn validate_params(mut self, validator: impl Validator + 'static) -> Self {
        self.validation.params = Some(Arc::new(validator));
        self
    }

    pub fn validate_query(mut self, validator: impl Validator + 'static) -> Self {
        self.validation.query = Some(Arc::new(validator));
        self
    }

    pub fn validate_payload(mut self, validator: impl Validator + 'static) -> Self {
        self.validation.payload = Some(Arc::new(validator));
        self
    }

    pub fn fail_action(mut self, action: FailAction) -> Self {
        self.validation.fail_action = action;
        self
    }

    /// Appends a group of prerequisites that run concurrently.
    pub fn pre(mut self, group: Vec<Pre>) -> Self {
        self.pre.push(group);
        self
    }

    pub fn config(mut self, config: RouteConfig) -> Self {
        self.config = config;
        self
    }

    /// Binds an extension to this route only.
    pub fn ext(mut self, point: ExtPoint, ext: impl Extension + 'static, options: ExtOptions) -> Self {
        self.ext.push((point, Arc::new(ext), options));
        self
    }

    pub fn bind<T: Any + Send + Sync>(mut self, value: T) -> Self {
        self.bind = Some(Arc::new(value));
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Resolves the definition against its realm. `seq` numbers the route's
    /// extension bindings.
    pub(crate) fn build(
        self,
        realm: &Arc<Realm>,
        server_defaults: &RouteConfig,
        seq: &mut usize,
    ) -> ServerResult<Route> {
        let path = realm.prefixed(&self.path);
        let label = format!("{} {path}", self.method.to_ascii_uppercase());

        let handler = self
            .handler
            .ok_or_else(|| ServerError::InvalidRoute(format!("{label} has no handler")))?;

        let settings = server_defaults
            .merge(realm.route_defaults())
            .merge(&self.config)
            .resolve()
            .map_err(|e| ServerError::InvalidRoute(format!("{label}: {e}")))?;

        let pre = PrerequisiteGraph::new(self.pre)?;

        let mut ext = Vec::with_capacity(self.ext.len());
        for (point, func, options) in self.ext {
            if !point.is_route_level() {
                return Err(ServerError::InvalidRoute(format!(
                    "{label} cannot bind {point}, it runs before routing"
                )));
            }
            ext.push(Arc::new(ExtBinding {
                point,
                func,
                realm: realm.clone(),
                options,
                seq: *seq,
            }));
            *seq += 1;
        }

        let vhost = if self.vhost.is_empty() {
            realm.vhost().to_vec()
        } else {
            self.vhost
        };

        Ok(Route {
            id: self.id,
            method: self.method.to_ascii_uppercase(),
            path,
            vhost,
            tags: self.tags,
            description: self.description,
            settings,
            handler,
            auth_def: self.auth,
            auth: OnceCell::new(),
            validation: self.validation,
            pre,
            ext,
            realm: realm.clone(),
            bind: self.bind,
        })
    }
}

/// A composed route
pub struct Route {
    pub id: Option<String>,
    pub method: String,
    /// Full path including the realm prefix
    pub path: String,
    pub vhost: Vec<String>,
    pub tags: Vec<String>,
    pub description: Option<String>,
    pub settings: RouteSettings,
    pub realm: Arc<Realm>,
    pub(crate) handler: Arc<dyn Handler>,
    auth_def: Option<RouteAuth>,
    /// Settled once strategies are known, at initialization
    auth: OnceCell<Option<RouteAuth>>,
    pub(crate) validation: RouteValidation,
    pub(crate) pre: PrerequisiteGraph,
    pub(crate) ext: Vec<Arc<ExtBinding>>,
    bind: Option<Bind>,
}

impl Route {
    /// Effective authentication settings, `None` when the route is public.
    pub fn auth(&self) -> Option<&RouteAuth> {
        self.auth.get().and_then(Option::as_ref)
    }

    pub(crate) fn auth_def(&self) -> Option<&RouteAuth> {
        self.auth_def.as_ref()
    }

    pub(crate) fn settle_auth(&self, auth: Option<RouteAuth>) {
        let _ = self.auth.set(auth);
    }

    pub(crate) fn toolkit(&self, shared: &Arc<Shared>) -> Toolkit {
        let bind = self.bind.clone().or_else(|| self.realm.bind.clone());
        Toolkit::new(shared.clone(), self.realm.clone(), bind)
    }

    pub fn has_prerequisites(&self) -> bool {
        !self.pre.is_empty()
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("id", &self.id)
            .field("method", &self.method)
            .field("path", &self.path)
            .field("vhost", &self.vhost)
            .field("plugin", &self.realm.name())
            .finish()
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.path)
    }
}
