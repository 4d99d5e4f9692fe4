use std::{any::Any, fmt, sync::Arc};

use futures::future::BoxFuture;
use serde_json::Value as JsonValue;

use super::{Plugin, Realm, Registration};
use crate::{
    config::{RouteConfig, ServerConfig},
    core::{AuthScheme, Encoder, Extension, ServerError, ServerHook, ServerResult},
    events::Events,
    lifecycle::{
        auth::RouteAuth,
        ext::{ExtOptions, ExtPoint},
    },
    methods::{MethodFn, MethodOptions},
    route::RouteDef,
    server::Composer,
    views::TemplateEngine,
};

/// Server lifecycle hook points
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPoint {
    /// Runs during initialization, after composition
    OnPreStart,
    OnPostStart,
    /// Runs before in-flight requests are drained
    OnPreStop,
    OnPostStop,
}

impl HookPoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookPoint::OnPreStart => "onPreStart",
            HookPoint::OnPostStart => "onPostStart",
            HookPoint::OnPreStop => "onPreStop",
            HookPoint::OnPostStop => "onPostStop",
        }
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registration interface handed to [`Plugin::register`].
///
/// Everything added through a scope is owned by the scope's realm. Calls
/// that change realm settings (`select`, `bind`, `route_defaults`) only
/// affect what is registered afterwards.
pub struct PluginScope<'a> {
    composer: &'a mut Composer,
    realm: Arc<Realm>,
}

impl<'a> PluginScope<'a> {
    pub(crate) fn new(composer: &'a mut Composer, realm: Arc<Realm>) -> Self {
        Self { composer, realm }
    }

    pub fn realm(&self) -> &Realm {
        &self.realm
    }

    /// Options passed with the registration
    pub fn options(&self) -> &JsonValue {
        self.realm.options()
    }

    pub fn settings(&self) -> &ServerConfig {
        &self.composer.config
    }

    pub fn events(&self) -> &Events {
        &self.composer.events
    }

    pub fn route(&mut self, def: RouteDef) -> ServerResult<()> {
        self.composer.add_route(def, &self.realm)
    }

    pub fn ext(&mut self, point: ExtPoint, ext: impl Extension + 'static) -> ServerResult<()> {
        self.ext_with(point, ext, ExtOptions::default())
    }

    pub fn ext_with(
        &mut self,
        point: ExtPoint,
        ext: impl Extension + 'static,
        options: ExtOptions,
    ) -> ServerResult<()> {
        self.composer.add_ext(point, Arc::new(ext), options, &self.realm)
    }

    pub fn hook(&mut self, point: HookPoint, hook: impl ServerHook + 'static) {
        self.composer.add_hook(point, Arc::new(hook), &self.realm);
    }

    pub fn on_pre_start(&mut self, hook: impl ServerHook + 'static) {
        self.hook(HookPoint::OnPreStart, hook);
    }

    pub fn on_post_start(&mut self, hook: impl ServerHook + 'static) {
        self.hook(HookPoint::OnPostStart, hook);
    }

    pub fn on_pre_stop(&mut self, hook: impl ServerHook + 'static) {
        self.hook(HookPoint::OnPreStop, hook);
    }

    pub fn on_post_stop(&mut self, hook: impl ServerHook + 'static) {
        self.hook(HookPoint::OnPostStop, hook);
    }

    /// Publishes a value under this plugin's namespace. Each key can be
    /// written once.
    pub fn expose<T: Any + Send + Sync>(&mut self, key: &str, value: T) -> ServerResult<()> {
        let namespace = self.realm.name().to_string();
        self.composer.expose(&namespace, key, Arc::new(value))
    }

    /// A value exposed by a plugin registered earlier.
    pub fn exposed<T: Any>(&self, plugin: &str, key: &str) -> Option<&T> {
        self.composer
            .exposed
            .get(plugin)
            .and_then(|ns| ns.get(key))
            .and_then(|v| v.downcast_ref::<T>())
    }

    /// Narrows further registrations to listeners with one of these labels.
    pub fn select(&mut self, labels: &[&str]) {
        let labels: Vec<String> = labels.iter().map(|l| l.to_string()).collect();
        let mut realm = (*self.realm).clone();
        realm.narrow_select(&labels);
        self.realm = Arc::new(realm);
    }

    /// Sets the context bound to functions registered from now on.
    pub fn bind<T: Any + Send + Sync>(&mut self, value: T) {
        let mut realm = (*self.realm).clone();
        realm.bind = Some(Arc::new(value));
        self.realm = Arc::new(realm);
    }

    /// Route configuration applied to this plugin's routes (and its children).
    pub fn route_defaults(&mut self, config: RouteConfig) {
        let mut realm = (*self.realm).clone();
        realm.route_defaults = realm.route_defaults.merge(&config);
        self.realm = Arc::new(realm);
    }

    /// Declares a plugin that must be registered by the time the server
    /// initializes.
    pub fn dependency(&mut self, plugin: &str) {
        let mut realm = (*self.realm).clone();
        realm.dependencies.push(plugin.to_string());
        self.composer
            .require(realm.name().to_string(), plugin.to_string());
        self.realm = Arc::new(realm);
    }

    /// Registers a nested plugin under this realm.
    pub fn register(
        &mut self,
        plugin: Arc<dyn Plugin>,
        registration: Registration,
    ) -> BoxFuture<'_, ServerResult<()>> {
        let parent = self.realm.clone();
        self.composer.register_plugin(plugin, registration, parent)
    }

    pub fn auth_scheme<F>(&mut self, name: &str, factory: F) -> ServerResult<()>
    where
        F: Fn(JsonValue) -> ServerResult<Arc<dyn AuthScheme>> + Send + Sync + 'static,
    {
        self.composer.auth.add_scheme(name, Arc::new(factory))
    }

    pub fn auth_strategy(&mut self, name: &str, scheme: &str, options: JsonValue) -> ServerResult<()> {
        self.composer
            .auth
            .add_strategy(name, scheme, options, self.realm.clone())
    }

    /// Authentication applied to routes that do not configure their own.
    pub fn auth_default(&mut self, auth: RouteAuth) -> ServerResult<()> {
        self.composer.auth.set_default(auth)
    }

    pub fn encoder(&mut self, name: &str, encoder: impl Encoder + 'static) -> ServerResult<()> {
        let name = name.to_ascii_lowercase();
        if self.composer.encoders.iter().any(|(n, _)| *n == name) {
            return Err(ServerError::NameConflict(format!(
                "encoder {name} already registered"
            )));
        }
        self.composer.encoders.push((name, Arc::new(encoder)));
        Ok(())
    }

    pub fn method(&mut self, name: &str, func: MethodFn, options: MethodOptions) -> ServerResult<()> {
        self.composer.methods.add(name, func, options)
    }

    pub fn views(&mut self, engine: impl TemplateEngine + 'static) -> ServerResult<()> {
        if self.composer.views.is_some() {
            return Err(ServerError::NameConflict(
                "a template engine is already registered".to_string(),
            ));
        }
        self.composer.views = Some(Arc::new(engine));
        Ok(())
    }
}
